use std::time::Instant;

use gpgpu_dynres::{
    swapchain::FRACTAL_TILES_PALETTE, FramePacingController, FramePresenter, Framework,
    OffscreenSwapChain, PacingConfig, Shader,
};
use rayon::prelude::*;

lazy_static::lazy_static! {
    static ref FW: Framework = Framework::new_blocking().expect("Failed to initialise the GPU");
}

const WIDTH: u32 = 1920;
const HEIGHT: u32 = 1080;
const FRAMES: u64 = 600;

/// Mean relative luminance of tightly packed RGBA8 pixels, in [0, 1].
fn mean_luminance(pixels: &[u8]) -> f64 {
    let count = (pixels.len() / 4).max(1) as f64;
    let total: f64 = pixels
        .par_chunks_exact(4)
        .map(|px| 0.2126 * px[0] as f64 + 0.7152 * px[1] as f64 + 0.0722 * px[2] as f64)
        .sum();
    total / count / 255.0
}

fn run() {
    let config = PacingConfig::from_env().unwrap_or_else(|err| {
        log::warn!("Ignoring pacing overrides: {}", err);
        PacingConfig::default()
    });

    // an optional WGSL file replaces the bundled fractal tiles shader, it has to
    // follow the same bindings and expose a `main` entry point.
    let swap_chain = match std::env::args().nth(1) {
        Some(path) => {
            let shader = Shader::from_wgsl_file(&FW, &path).unwrap();
            OffscreenSwapChain::new(&FW, WIDTH, HEIGHT, shader, "main", &FRACTAL_TILES_PALETTE)
        }
        None => OffscreenSwapChain::with_fractal_tiles(&FW, WIDTH, HEIGHT),
    };

    let controller = FramePacingController::new(config).unwrap();
    let mut presenter = FramePresenter::new(swap_chain, controller).unwrap();

    println!("Rendering {} frames at {}x{}", FRAMES, WIDTH, HEIGHT);
    let now = Instant::now();
    for _ in 0..FRAMES {
        let report = presenter.run_frame().unwrap();
        if report.resized {
            println!(
                "frame {:>4}: scale {:.2}, render target {:?} -> {:?}",
                report.frame_index,
                report.scale,
                report.render_size,
                presenter.render_size()
            );
        }
    }
    let elapsed = now.elapsed();

    let stats = presenter.stats();
    println!("Done in {:.2?}", elapsed);
    println!(
        "presented: {}, resizes: {}, fence waits: {}, average frame: {:.2?}",
        stats.frames_presented,
        stats.resizes,
        stats.fence_waits,
        elapsed / FRAMES as u32
    );

    if let Some(front) = presenter.backend().front_buffer() {
        let pixels = futures::executor::block_on(front.read_pixels()).unwrap();
        println!("front buffer mean luminance: {:.3}", mean_luminance(&pixels));
    }
}

fn main() {
    pretty_env_logger::init();
    run()
}
