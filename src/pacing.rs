//! Dynamic resolution frame pacing.
//!
//! A [`FramePacingController`] keeps a sliding window of the most recent frame
//! times and, once per full window, nudges the render scale so the average
//! frame time converges on a target. The update formula follows Intel's
//! dynamic resolution rendering article: `scale += scale * (target - avg) / avg`.

use std::time::Duration;

use thiserror::Error;

/// Number of ticks in one second. A tick is 100 ns.
pub const TICKS_PER_SECOND: u64 = 10_000_000;

/// Target frame time in ticks to reach 60fps.
pub const TARGET_FRAME_TIME_60FPS: u64 = 166_666;

/// Default length of the sliding frame time window.
pub const DEFAULT_WINDOW_SIZE: usize = 32;

/// Lowest render scale the controller will pick.
pub const DEFAULT_SCALE_FLOOR: f64 = 0.10;
/// Highest render scale, rendering at the native output size.
pub const DEFAULT_SCALE_CEILING: f64 = 1.0;

/// Minimum change in scale that is worth a render target reallocation.
pub const DEFAULT_SCALE_CHANGE_THRESHOLD: f64 = 0.05;

pub type PacingResult<T> = Result<T, PacingError>;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacingError {
    #[error("frame time must be at least one tick")]
    ZeroFrameTime,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("sliding window must hold at least one frame")]
    EmptyWindow,
    #[error("target frame time must be at least one tick")]
    ZeroTargetFrameTime,
    #[error("scale bounds must satisfy 0 < floor <= ceiling <= 1, got [{floor}, {ceiling}]")]
    InvalidScaleBounds { floor: f64, ceiling: f64 },
    #[error("scale change threshold must be a finite non-negative number, got {0}")]
    InvalidThreshold(f64),
    #[error("a window of {window_size} frames at {target_frame_time} ticks overflows the running sum")]
    WindowSumOverflow {
        target_frame_time: u64,
        window_size: usize,
    },
    #[error("invalid value {value:?} for environment variable {var}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Tunables of a [`FramePacingController`].
#[derive(Debug, Clone, PartialEq)]
pub struct PacingConfig {
    /// Desired frame duration, in ticks.
    pub target_frame_time: u64,
    /// Number of samples averaged before a scale decision is made.
    pub window_size: usize,
    pub scale_floor: f64,
    pub scale_ceiling: f64,
    pub scale_change_threshold: f64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            target_frame_time: TARGET_FRAME_TIME_60FPS,
            window_size: DEFAULT_WINDOW_SIZE,
            scale_floor: DEFAULT_SCALE_FLOOR,
            scale_ceiling: DEFAULT_SCALE_CEILING,
            scale_change_threshold: DEFAULT_SCALE_CHANGE_THRESHOLD,
        }
    }
}

impl PacingConfig {
    /// Default configuration targeting `hz` frames per second.
    ///
    /// A rate of zero yields a zero target, which [`PacingConfig::validate`] rejects.
    pub fn for_refresh_rate(hz: u32) -> Self {
        Self::default().with_refresh_rate(hz)
    }

    pub fn with_refresh_rate(self, hz: u32) -> Self {
        let target_frame_time = TICKS_PER_SECOND.checked_div(hz as u64).unwrap_or(0);
        self.with_target_frame_time(target_frame_time)
    }

    pub fn with_target_frame_time(mut self, ticks: u64) -> Self {
        self.target_frame_time = ticks;
        self
    }

    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size;
        self
    }

    pub fn with_scale_bounds(mut self, floor: f64, ceiling: f64) -> Self {
        self.scale_floor = floor;
        self.scale_ceiling = ceiling;
        self
    }

    pub fn with_scale_change_threshold(mut self, threshold: f64) -> Self {
        self.scale_change_threshold = threshold;
        self
    }

    /// Largest frame time a single window slot holds, in ticks. Keeps the
    /// running sum of a full window within `u64`.
    pub fn max_frame_time(&self) -> u64 {
        u64::MAX / self.window_size.max(1) as u64
    }

    /// The target frame time as a [`Duration`].
    pub fn target_frame_duration(&self) -> Duration {
        Duration::from_nanos(self.target_frame_time.saturating_mul(100))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size == 0 {
            return Err(ConfigError::EmptyWindow);
        }
        if self.target_frame_time == 0 {
            return Err(ConfigError::ZeroTargetFrameTime);
        }
        if self
            .target_frame_time
            .checked_mul(self.window_size as u64)
            .is_none()
        {
            return Err(ConfigError::WindowSumOverflow {
                target_frame_time: self.target_frame_time,
                window_size: self.window_size,
            });
        }
        let (floor, ceiling) = (self.scale_floor, self.scale_ceiling);
        // Written so that NaN bounds are rejected too.
        if !(floor > 0.0 && floor <= ceiling && ceiling <= 1.0) {
            return Err(ConfigError::InvalidScaleBounds { floor, ceiling });
        }
        let threshold = self.scale_change_threshold;
        if !(threshold.is_finite() && threshold >= 0.0) {
            return Err(ConfigError::InvalidThreshold(threshold));
        }
        Ok(())
    }

    /// Reads overrides for the defaults from the environment.
    ///
    /// Recognised variables are `DYNRES_TARGET_FPS`, `DYNRES_WINDOW`,
    /// `DYNRES_SCALE_FLOOR`, `DYNRES_SCALE_CEILING` and `DYNRES_THRESHOLD`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        fn parse<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
        where
            T: std::str::FromStr,
            F: Fn(&str) -> Option<String>,
        {
            match lookup(var) {
                None => Ok(None),
                Some(value) => value
                    .trim()
                    .parse()
                    .map(Some)
                    .map_err(|_| ConfigError::InvalidEnv { var, value }),
            }
        }

        let mut config = Self::default();
        if let Some(hz) = parse::<u32, _>(&lookup, "DYNRES_TARGET_FPS")? {
            config = config.with_refresh_rate(hz);
        }
        if let Some(window_size) = parse(&lookup, "DYNRES_WINDOW")? {
            config.window_size = window_size;
        }
        if let Some(floor) = parse(&lookup, "DYNRES_SCALE_FLOOR")? {
            config.scale_floor = floor;
        }
        if let Some(ceiling) = parse(&lookup, "DYNRES_SCALE_CEILING")? {
            config.scale_ceiling = ceiling;
        }
        if let Some(threshold) = parse(&lookup, "DYNRES_THRESHOLD")? {
            config.scale_change_threshold = threshold;
        }
        config.validate()?;

        log::debug!("Frame pacing configuration: {:?}", config);
        Ok(config)
    }
}

/// Whether the next frame time contributes to the sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleState {
    #[default]
    Normal,
    /// A scale update was just applied. The next frame pays for the render
    /// target reallocation, so its duration is dropped.
    SkipNextSample,
}

/// Outcome of a single [`FramePacingController::advance`] call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacingDecision {
    /// The scale to use for subsequent frames.
    pub scale: f64,
    /// Set when `scale` has changed and render targets must be resized.
    pub resize_needed: bool,
}

/// Moving-average frame time estimator driving the render resolution scale.
#[derive(Debug, Clone)]
pub struct FramePacingController {
    config: PacingConfig,
    window: Vec<u64>,
    write_index: usize,
    running_sum: u64,
    state: SampleState,
    scale: f64,
}

impl FramePacingController {
    /// Creates a controller starting at full scale.
    pub fn new(config: PacingConfig) -> Result<Self, ConfigError> {
        let scale = config.scale_ceiling;
        Self::with_scale(config, scale)
    }

    /// Creates a controller starting at `scale`, clamped to the configured bounds.
    pub fn with_scale(config: PacingConfig, scale: f64) -> Result<Self, ConfigError> {
        config.validate()?;

        // Pre-filling with the target keeps the first window from asking for a resize.
        let window = vec![config.target_frame_time; config.window_size];
        let running_sum = config.target_frame_time * config.window_size as u64;
        let scale = if scale.is_nan() {
            config.scale_ceiling
        } else {
            scale.clamp(config.scale_floor, config.scale_ceiling)
        };

        Ok(Self {
            config,
            window,
            write_index: 0,
            running_sum,
            state: SampleState::Normal,
            scale,
        })
    }

    /// Records the duration of the last frame, in ticks, and decides whether
    /// the render scale has to change. Frame times above
    /// [`PacingConfig::max_frame_time`] are stored at that cap.
    pub fn advance(&mut self, frame_time: u64) -> PacingResult<PacingDecision> {
        if frame_time == 0 {
            return Err(PacingError::ZeroFrameTime);
        }

        if self.state == SampleState::SkipNextSample {
            self.state = SampleState::Normal;
            log::trace!("Dropping frame time {} right after a resize", frame_time);
            return Ok(self.unchanged());
        }

        let frame_time = frame_time.min(self.config.max_frame_time());
        let slot = &mut self.window[self.write_index];
        self.running_sum = self.running_sum - *slot + frame_time;
        *slot = frame_time;
        self.write_index = (self.write_index + 1) % self.window.len();

        // Only decide once per full window, this amortizes frame time spikes.
        if self.write_index != 0 {
            return Ok(self.unchanged());
        }

        let average = self.average_frame_time();
        let delta = (self.config.target_frame_time as f64 - average) / average;
        let candidate =
            (self.scale + self.scale * delta).clamp(self.config.scale_floor, self.config.scale_ceiling);

        log::debug!(
            "Average frame time {:.1} ticks, target {}, candidate scale {:.3}",
            average,
            self.config.target_frame_time,
            candidate
        );

        if (self.scale - candidate).abs() < self.config.scale_change_threshold {
            return Ok(self.unchanged());
        }

        log::info!("Render scale {:.3} -> {:.3}", self.scale, candidate);
        self.scale = candidate;
        self.state = SampleState::SkipNextSample;

        Ok(PacingDecision {
            scale: candidate,
            resize_needed: true,
        })
    }

    /// Same as [`FramePacingController::advance`] for a measured [`Duration`].
    ///
    /// Durations shorter than a tick are rounded up to one tick. Samples are
    /// capped at [`PacingConfig::max_frame_time`].
    pub fn advance_duration(&mut self, frame_time: Duration) -> PacingResult<PacingDecision> {
        if frame_time.is_zero() {
            return Err(PacingError::ZeroFrameTime);
        }
        let ticks = (frame_time.as_nanos() / 100).clamp(1, u64::MAX as u128) as u64;
        self.advance(ticks)
    }

    fn unchanged(&self) -> PacingDecision {
        PacingDecision {
            scale: self.scale,
            resize_needed: false,
        }
    }

    /// Refills the window with the target frame time, keeping the current scale.
    pub fn reset(&mut self) {
        self.window.fill(self.config.target_frame_time);
        self.running_sum = self.config.target_frame_time * self.window.len() as u64;
        self.write_index = 0;
        self.state = SampleState::Normal;
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn config(&self) -> &PacingConfig {
        &self.config
    }

    pub fn state(&self) -> SampleState {
        self.state
    }

    pub fn write_index(&self) -> usize {
        self.write_index
    }

    pub fn running_sum(&self) -> u64 {
        self.running_sum
    }

    /// Frame times currently in the window, in slot order.
    pub fn window(&self) -> &[u64] {
        &self.window
    }

    pub fn average_frame_time(&self) -> f64 {
        self.running_sum as f64 / self.window.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use proptest::prelude::*;

    use super::*;

    fn small_config() -> PacingConfig {
        PacingConfig::default()
            .with_target_frame_time(100)
            .with_window_size(4)
    }

    fn feed(controller: &mut FramePacingController, frames: &[u64]) -> Vec<PacingDecision> {
        frames
            .iter()
            .map(|&frame| controller.advance(frame).unwrap())
            .collect()
    }

    #[test]
    fn defaults_match_60hz() {
        let config = PacingConfig::default();
        assert_eq!(config.target_frame_time, 166_666);
        assert_eq!(config.window_size, 32);
        assert_eq!(PacingConfig::for_refresh_rate(60), config);

        let controller = FramePacingController::new(config).unwrap();
        assert_eq!(controller.scale(), 1.0);
        assert_eq!(controller.write_index(), 0);
        assert_eq!(controller.running_sum(), 166_666 * 32);
        assert_eq!(controller.average_frame_time(), 166_666.0);
    }

    #[test]
    fn fast_spike_is_clamped_to_ceiling() {
        let mut controller = FramePacingController::new(small_config()).unwrap();

        let decisions = feed(&mut controller, &[100, 100, 100, 50]);

        assert_eq!(controller.average_frame_time(), 87.5);
        assert!(decisions.iter().all(|d| !d.resize_needed));
        assert_eq!(controller.scale(), 1.0);
        assert_eq!(controller.state(), SampleState::Normal);
    }

    #[test]
    fn slow_window_halves_scale_then_skips_one_sample() {
        let mut controller = FramePacingController::new(small_config()).unwrap();

        let decisions = feed(&mut controller, &[200, 200, 200, 200]);
        assert!(decisions[..3].iter().all(|d| !d.resize_needed));
        assert_eq!(
            decisions[3],
            PacingDecision {
                scale: 0.5,
                resize_needed: true
            }
        );
        assert_eq!(controller.scale(), 0.5);
        assert_eq!(controller.state(), SampleState::SkipNextSample);

        let sum_before = controller.running_sum();
        let skipped = controller.advance(10_000).unwrap();
        assert!(!skipped.resize_needed);
        assert_eq!(skipped.scale, 0.5);
        assert_eq!(controller.running_sum(), sum_before);
        assert_eq!(controller.write_index(), 0);
        assert_eq!(controller.state(), SampleState::Normal);
    }

    #[test]
    fn skips_exactly_one_sample() {
        let mut controller = FramePacingController::new(small_config()).unwrap();
        feed(&mut controller, &[200, 200, 200, 200]);

        controller.advance(999).unwrap();
        controller.advance(100).unwrap();

        assert_eq!(controller.write_index(), 1);
        assert_eq!(controller.window(), &[100, 200, 200, 200]);
    }

    #[test]
    fn scale_recovers_when_frames_get_faster() {
        let mut controller = FramePacingController::with_scale(small_config(), 0.5).unwrap();

        let decisions = feed(&mut controller, &[50, 50, 50, 50]);

        // delta = (100 - 50) / 50 = 1, so the scale doubles.
        assert!(decisions[3].resize_needed);
        assert_eq!(controller.scale(), 1.0);
    }

    #[test]
    fn floor_is_respected() {
        let mut controller = FramePacingController::new(small_config()).unwrap();

        let decisions = feed(&mut controller, &[10_000; 4]);

        assert!(decisions[3].resize_needed);
        assert_eq!(controller.scale(), DEFAULT_SCALE_FLOOR);
    }

    #[test]
    fn small_corrections_are_ignored() {
        let mut controller = FramePacingController::with_scale(small_config(), 0.5).unwrap();

        // average = 104, candidate = 0.5 - 0.5 * 4 / 104 ~= 0.481
        let decisions = feed(&mut controller, &[104; 4]);

        assert!(decisions.iter().all(|d| !d.resize_needed));
        assert_eq!(controller.scale(), 0.5);
        assert_eq!(controller.state(), SampleState::Normal);
    }

    #[test]
    fn zero_frame_time_is_rejected_without_side_effects() {
        let mut controller = FramePacingController::new(small_config()).unwrap();
        controller.advance(120).unwrap();
        let before = controller.clone();

        assert_eq!(controller.advance(0), Err(PacingError::ZeroFrameTime));
        assert_eq!(
            controller.advance_duration(Duration::ZERO),
            Err(PacingError::ZeroFrameTime)
        );
        assert_eq!(controller.window(), before.window());
        assert_eq!(controller.write_index(), before.write_index());
        assert_eq!(controller.running_sum(), before.running_sum());
    }

    #[test]
    fn durations_are_converted_to_ticks() {
        let mut controller = FramePacingController::new(small_config()).unwrap();

        controller.advance_duration(Duration::from_micros(20)).unwrap();
        controller.advance_duration(Duration::from_nanos(1)).unwrap();

        assert_eq!(&controller.window()[..2], &[200, 1]);
    }

    #[test]
    fn huge_frame_times_are_capped() {
        let mut controller = FramePacingController::new(small_config()).unwrap();
        let cap = u64::MAX / 4;
        assert_eq!(controller.config().max_frame_time(), cap);

        let decisions: Vec<_> = (0..4)
            .map(|_| controller.advance_duration(Duration::MAX).unwrap())
            .collect();

        assert_eq!(controller.window(), &[cap; 4]);
        assert_eq!(controller.running_sum(), cap * 4);
        assert!(decisions[3].resize_needed);
        assert_eq!(controller.scale(), DEFAULT_SCALE_FLOOR);

        controller.advance(u64::MAX).unwrap();
        controller.advance(u64::MAX).unwrap();
        assert_eq!(controller.running_sum(), cap * 4);
    }

    #[test]
    fn reset_refills_window_and_keeps_scale() {
        let mut controller = FramePacingController::new(small_config()).unwrap();
        feed(&mut controller, &[200, 200, 200, 200, 300, 300]);

        controller.reset();

        assert_eq!(controller.scale(), 0.5);
        assert_eq!(controller.window(), &[100; 4]);
        assert_eq!(controller.running_sum(), 400);
        assert_eq!(controller.write_index(), 0);
        assert_eq!(controller.state(), SampleState::Normal);
    }

    #[test]
    fn initial_scale_is_clamped() {
        let config = small_config();
        assert_eq!(FramePacingController::with_scale(config.clone(), 3.0).unwrap().scale(), 1.0);
        assert_eq!(FramePacingController::with_scale(config.clone(), 0.0).unwrap().scale(), 0.1);
        assert_eq!(FramePacingController::with_scale(config, f64::NAN).unwrap().scale(), 1.0);
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let base = small_config();
        assert_eq!(
            FramePacingController::new(base.clone().with_window_size(0)).unwrap_err(),
            ConfigError::EmptyWindow
        );
        assert_eq!(
            base.clone().with_target_frame_time(0).validate(),
            Err(ConfigError::ZeroTargetFrameTime)
        );
        assert_eq!(
            PacingConfig::for_refresh_rate(0).validate(),
            Err(ConfigError::ZeroTargetFrameTime)
        );
        assert!(matches!(
            base.clone().with_scale_bounds(0.0, 1.0).validate(),
            Err(ConfigError::InvalidScaleBounds { .. })
        ));
        assert!(matches!(
            base.clone().with_scale_bounds(0.8, 0.5).validate(),
            Err(ConfigError::InvalidScaleBounds { .. })
        ));
        assert!(matches!(
            base.clone().with_scale_bounds(0.1, 1.5).validate(),
            Err(ConfigError::InvalidScaleBounds { .. })
        ));
        assert_eq!(
            FramePacingController::new(base.clone().with_target_frame_time(u64::MAX / 2))
                .unwrap_err(),
            ConfigError::WindowSumOverflow {
                target_frame_time: u64::MAX / 2,
                window_size: 4
            }
        );
        assert!(base
            .clone()
            .with_target_frame_time(u64::MAX / 4)
            .validate()
            .is_ok());
        assert_eq!(
            base.with_scale_change_threshold(-1.0).validate(),
            Err(ConfigError::InvalidThreshold(-1.0))
        );
    }

    #[test]
    fn env_overrides_defaults() {
        let vars: HashMap<&str, &str> = [
            ("DYNRES_TARGET_FPS", "120"),
            ("DYNRES_WINDOW", "16"),
            ("DYNRES_SCALE_FLOOR", "0.25"),
            ("DYNRES_THRESHOLD", " 0.1 "),
        ]
        .into_iter()
        .collect();

        let config = PacingConfig::from_lookup(|var| vars.get(var).map(|v| v.to_string())).unwrap();

        assert_eq!(config.target_frame_time, 83_333);
        assert_eq!(config.window_size, 16);
        assert_eq!(config.scale_floor, 0.25);
        assert_eq!(config.scale_ceiling, 1.0);
        assert_eq!(config.scale_change_threshold, 0.1);
    }

    #[test]
    fn env_rejects_garbage() {
        let err = PacingConfig::from_lookup(|var| {
            (var == "DYNRES_WINDOW").then(|| "lots".to_string())
        })
        .unwrap_err();

        assert_eq!(
            err,
            ConfigError::InvalidEnv {
                var: "DYNRES_WINDOW",
                value: "lots".into()
            }
        );
    }

    #[test]
    fn target_frame_duration_in_nanos() {
        assert_eq!(
            PacingConfig::default().target_frame_duration(),
            Duration::from_nanos(16_666_600)
        );
    }

    proptest! {
        #[test]
        fn steady_target_never_resizes(window in 1usize..64, frames in 1usize..256) {
            let config = PacingConfig::default().with_window_size(window);
            let target = config.target_frame_time;
            let mut controller = FramePacingController::new(config).unwrap();

            for _ in 0..frames {
                let decision = controller.advance(target).unwrap();
                prop_assert!(!decision.resize_needed);
            }
            prop_assert_eq!(controller.average_frame_time(), target as f64);
            prop_assert_eq!(controller.scale(), 1.0);
        }

        #[test]
        fn running_sum_tracks_window(frames in prop::collection::vec(1u64..1_000_000, 0..200)) {
            let mut controller = FramePacingController::new(small_config()).unwrap();

            for frame in frames {
                controller.advance(frame).unwrap();
                prop_assert_eq!(controller.running_sum(), controller.window().iter().sum::<u64>());
            }
        }

        #[test]
        fn running_sum_never_overflows(
            window in 1usize..16,
            frames in prop::collection::vec(1u64..=u64::MAX, 0..64),
        ) {
            let config = small_config().with_window_size(window);
            let mut controller = FramePacingController::new(config).unwrap();

            for frame in frames {
                controller.advance(frame).unwrap();
                let sum = controller
                    .window()
                    .iter()
                    .try_fold(0u64, |sum, &sample| sum.checked_add(sample));
                prop_assert_eq!(Some(controller.running_sum()), sum);
            }
        }

        #[test]
        fn scale_stays_within_bounds(frames in prop::collection::vec(1u64..10_000_000, 0..300)) {
            let mut controller = FramePacingController::new(small_config()).unwrap();

            for frame in frames {
                let decision = controller.advance(frame).unwrap();
                prop_assert!((0.1..=1.0).contains(&decision.scale));
                prop_assert_eq!(decision.scale, controller.scale());
            }
        }

        #[test]
        fn resize_is_always_followed_by_a_skip(
            frames in prop::collection::vec(1u64..1_000, 0..300),
            next in 1u64..1_000_000,
        ) {
            let mut controller = FramePacingController::new(small_config()).unwrap();

            for frame in frames {
                let before = controller.scale();
                let decision = controller.advance(frame).unwrap();
                if decision.resize_needed {
                    prop_assert!((before - decision.scale).abs() >= 0.05);
                    let sum = controller.running_sum();
                    let skipped = controller.advance(next).unwrap();
                    prop_assert!(!skipped.resize_needed);
                    prop_assert_eq!(skipped.scale, decision.scale);
                    prop_assert_eq!(controller.running_sum(), sum);
                } else {
                    prop_assert_eq!(decision.scale, before);
                }
            }
        }
    }
}
