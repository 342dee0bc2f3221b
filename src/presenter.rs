//! Double-buffered presentation loop driven by a [`FramePacingController`].
//!
//! Each frame goes `Idle -> Rendering -> Submitted -> Presented -> Idle`.
//! The GPU side is abstracted behind [`PresentationBackend`] so the loop
//! itself stays a plain state machine.

use std::time::{Duration, Instant};

use thiserror::Error;

use crate::pacing::{FramePacingController, PacingError};

/// Index of one of the two alternating back buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackBufferIndex(u8);

impl BackBufferIndex {
    pub const COUNT: usize = 2;

    pub fn new(index: usize) -> Self {
        Self((index & 1) as u8)
    }

    pub fn get(self) -> usize {
        self.0 as usize
    }

    pub fn flip(self) -> Self {
        Self(self.0 ^ 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameState {
    #[default]
    Idle,
    Rendering,
    Submitted,
    Presented,
}

/// What the backend needs to know to render one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameContext {
    pub frame_index: u64,
    /// Accumulated frame time since the presenter was created.
    pub time: Duration,
    pub scale: f64,
    pub render_size: (u32, u32),
    pub back_buffer: BackBufferIndex,
}

/// The GPU collaborator a [`FramePresenter`] drives.
///
/// Implementations own an intermediate render target sized by the current
/// scale and two back buffers sized by [`PresentationBackend::output_size`].
pub trait PresentationBackend {
    type Error: std::error::Error + 'static;

    fn output_size(&self) -> (u32, u32);

    /// Reallocates the intermediate render target. Called synchronously
    /// between frames.
    fn resize_render_target(&mut self, width: u32, height: u32) -> Result<(), Self::Error>;

    /// Records the work writing the intermediate render target.
    fn render(&mut self, frame: &FrameContext) -> Result<(), Self::Error>;

    /// Records the copy of the render target into back buffer `index`.
    fn copy_to_back_buffer(&mut self, index: BackBufferIndex) -> Result<(), Self::Error>;

    /// Submits the recorded work and returns the fence value it signals.
    fn submit(&mut self) -> Result<u64, Self::Error>;

    /// Highest fence value the GPU has completed.
    fn completed_fence_value(&self) -> u64;

    /// Blocks until the GPU has completed `value`.
    fn wait_for_fence(&mut self, value: u64) -> Result<(), Self::Error>;

    fn present(&mut self, index: BackBufferIndex) -> Result<(), Self::Error>;
}

#[derive(Error, Debug)]
pub enum PresentError<E: std::error::Error + 'static> {
    #[error(transparent)]
    Pacing(#[from] PacingError),
    #[error("presentation backend failed: {0}")]
    Backend(#[source] E),
}

/// Outcome of a presented frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameReport {
    pub frame_index: u64,
    pub back_buffer: BackBufferIndex,
    pub fence_value: u64,
    /// Size the frame was rendered at.
    pub render_size: (u32, u32),
    /// Scale used from the next frame onwards.
    pub scale: f64,
    /// Whether the render target was reallocated after this frame.
    pub resized: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameStats {
    pub frames_presented: u64,
    pub resizes: u64,
    pub fence_waits: u64,
}

/// Render target extent for `output` at `scale`, never smaller than one texel.
pub fn scaled_extent((width, height): (u32, u32), scale: f64) -> (u32, u32) {
    let scale_dim = |dim: u32| ((dim as f64 * scale).round() as u32).max(1);
    (scale_dim(width), scale_dim(height))
}

pub struct FramePresenter<B> {
    backend: B,
    controller: FramePacingController,
    state: FrameState,
    back_buffer: BackBufferIndex,
    in_flight: [u64; BackBufferIndex::COUNT],
    render_size: (u32, u32),
    /// Render target extent decided on but not yet allocated.
    pending_resize: Option<(u32, u32)>,
    frame_index: u64,
    time: Duration,
    last_frame: Option<Instant>,
    stats: FrameStats,
}

impl<B: PresentationBackend> FramePresenter<B> {
    /// Sizes the backend's render target for the controller's current scale.
    pub fn new(mut backend: B, controller: FramePacingController) -> Result<Self, B::Error> {
        let render_size = scaled_extent(backend.output_size(), controller.scale());
        backend.resize_render_target(render_size.0, render_size.1)?;

        Ok(Self {
            backend,
            controller,
            state: FrameState::Idle,
            back_buffer: BackBufferIndex::default(),
            in_flight: [0; BackBufferIndex::COUNT],
            render_size,
            pending_resize: None,
            frame_index: 0,
            time: Duration::ZERO,
            last_frame: None,
            stats: FrameStats::default(),
        })
    }

    /// Presents one frame, measuring the time since the previous call.
    ///
    /// The first frame reports the controller's target frame time.
    pub fn run_frame(&mut self) -> Result<FrameReport, PresentError<B::Error>> {
        let now = Instant::now();
        let elapsed = match self.last_frame {
            Some(previous) => now.duration_since(previous),
            None => self.controller.config().target_frame_duration(),
        };
        self.last_frame = Some(now);

        // A coarse clock can report back to back frames as instantaneous.
        self.present_frame(elapsed.max(Duration::from_nanos(100)))
    }

    /// Presents one frame given the duration of the previous one.
    ///
    /// A resize decided on a frame that failed is applied before the next
    /// frame renders.
    pub fn present_frame(
        &mut self,
        elapsed: Duration,
    ) -> Result<FrameReport, PresentError<B::Error>> {
        let decision = self.controller.advance_duration(elapsed)?;
        self.time = self.time.saturating_add(elapsed);

        self.apply_pending_resize().map_err(PresentError::Backend)?;
        if decision.resize_needed {
            self.pending_resize = Some(scaled_extent(self.backend.output_size(), decision.scale));
        }

        let index = self.back_buffer;
        let pending = self.in_flight[index.get()];
        if pending > self.backend.completed_fence_value() {
            log::trace!("Waiting on fence {} before reusing back buffer {}", pending, index.get());
            self.backend
                .wait_for_fence(pending)
                .map_err(PresentError::Backend)?;
            self.stats.fence_waits += 1;
        }

        self.state = FrameState::Rendering;
        let frame = FrameContext {
            frame_index: self.frame_index,
            time: self.time,
            scale: self.scale_in_use(),
            render_size: self.render_size,
            back_buffer: index,
        };
        self.backend.render(&frame).map_err(PresentError::Backend)?;
        self.backend
            .copy_to_back_buffer(index)
            .map_err(PresentError::Backend)?;

        let fence_value = self.backend.submit().map_err(PresentError::Backend)?;
        self.in_flight[index.get()] = fence_value;
        self.state = FrameState::Submitted;

        // Keep at most one frame queued behind the one just submitted.
        let previous = fence_value.saturating_sub(1);
        if previous > self.backend.completed_fence_value() {
            log::trace!("GPU fell behind, waiting on fence {}", previous);
            self.backend
                .wait_for_fence(previous)
                .map_err(PresentError::Backend)?;
            self.stats.fence_waits += 1;
        }

        self.backend.present(index).map_err(PresentError::Backend)?;
        self.state = FrameState::Presented;
        self.back_buffer = index.flip();
        self.frame_index += 1;
        self.stats.frames_presented += 1;

        // The decision only affects the frames after this one.
        let resized = self.apply_pending_resize().map_err(PresentError::Backend)?;
        self.state = FrameState::Idle;

        Ok(FrameReport {
            frame_index: frame.frame_index,
            back_buffer: index,
            fence_value,
            render_size: frame.render_size,
            scale: decision.scale,
            resized,
        })
    }

    /// Reallocates the render target if a resize is pending. The resize stays
    /// pending when the backend fails.
    fn apply_pending_resize(&mut self) -> Result<bool, B::Error> {
        let Some((width, height)) = self.pending_resize else {
            return Ok(false);
        };
        log::info!(
            "Resizing render target {}x{} -> {}x{}",
            self.render_size.0,
            self.render_size.1,
            width,
            height
        );
        self.backend.resize_render_target(width, height)?;
        self.render_size = (width, height);
        self.pending_resize = None;
        self.stats.resizes += 1;
        Ok(true)
    }

    /// The scale the current render target was sized for.
    fn scale_in_use(&self) -> f64 {
        let (output_width, _) = self.backend.output_size();
        if output_width == 0 {
            return self.controller.scale();
        }
        self.render_size.0 as f64 / output_width as f64
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    pub fn controller(&self) -> &FramePacingController {
        &self.controller
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Back buffer the next frame will be written to.
    pub fn back_buffer(&self) -> BackBufferIndex {
        self.back_buffer
    }

    pub fn render_size(&self) -> (u32, u32) {
        self.render_size
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }
}
