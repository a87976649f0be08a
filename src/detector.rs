//! Motion and light-change detection over SUB-stream frames.
//!
//! Per-pixel adaptive Gaussian background subtraction produces a raw motion
//! score per frame; a sliding-window average smooths it; a gate layers the
//! minimum-motion requirement and stop hysteresis on top and emits
//! `MotionStart`/`MotionStop` in strict alternation.

use crate::events::{MotionEvent, SubFrame};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::debug;

/// Frames averaged for the smoothed motion score (0.5 s at 30 FPS).
pub const SMOOTHING_WINDOW: usize = 15;
/// Consecutive quiet frames required before motion is declared over
/// (1 s at 30 FPS).
pub const HYSTERESIS_FRAMES: u32 = 30;

/// Exponential update rate of the background model.
const LEARNING_RATE: f32 = 0.05;
/// Squared deviation beyond this multiple of the variance is foreground.
const VARIANCE_THRESHOLD: f32 = 16.0;
const INITIAL_VARIANCE: f32 = 100.0;
const MIN_VARIANCE: f32 = 4.0;

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Smoothed foreground fraction that counts as motion (0-1)
    pub motion_threshold: f64,
    /// Mean-luminance jump that counts as a light event (0-255)
    pub light_jump_threshold: f64,
    /// Motion must persist this long before Start is emitted
    pub min_motion: Duration,
    /// Warm-up window after (re)start during which no events are emitted
    pub startup_delay: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            motion_threshold: 0.02,
            light_jump_threshold: 30.0,
            min_motion: Duration::from_millis(500),
            startup_delay: Duration::from_secs(10),
        }
    }
}

/// Per-frame analysis, exposed for logging and tests.
#[derive(Debug, Clone, Copy)]
pub struct FrameAnalysis {
    pub motion_score: f64,
    pub smoothed_motion_score: f64,
    pub brightness: f64,
    pub brightness_delta: f64,
    /// Raw trigger condition for this frame (motion or light jump).
    pub condition: bool,
}

/// Single-Gaussian-per-pixel adaptive background model.
struct BackgroundModel {
    mean: Vec<f32>,
    variance: Vec<f32>,
    width: u32,
    height: u32,
}

impl BackgroundModel {
    fn new() -> Self {
        Self {
            mean: Vec::new(),
            variance: Vec::new(),
            width: 0,
            height: 0,
        }
    }

    /// Update the model with a GRAY8 frame and return the foreground
    /// fraction. The first frame after (re)initialization scores zero.
    fn apply(&mut self, frame: &SubFrame) -> f64 {
        let expected = (frame.width * frame.height) as usize;
        if frame.data.len() < expected || expected == 0 {
            return 0.0;
        }
        let pixels = &frame.data[..expected];

        if self.mean.len() != expected
            || self.width != frame.width
            || self.height != frame.height
        {
            self.mean = pixels.iter().map(|&p| p as f32).collect();
            self.variance = vec![INITIAL_VARIANCE; expected];
            self.width = frame.width;
            self.height = frame.height;
            return 0.0;
        }

        let mut foreground = 0usize;
        for (i, &p) in pixels.iter().enumerate() {
            let value = p as f32;
            let deviation = value - self.mean[i];
            let deviation_sq = deviation * deviation;
            if deviation_sq > VARIANCE_THRESHOLD * self.variance[i] {
                foreground += 1;
            }
            self.mean[i] += LEARNING_RATE * deviation;
            self.variance[i] =
                (self.variance[i] + LEARNING_RATE * (deviation_sq - self.variance[i]))
                    .max(MIN_VARIANCE);
        }

        foreground as f64 / expected as f64
    }

    fn reset(&mut self) {
        self.mean.clear();
        self.variance.clear();
        self.width = 0;
        self.height = 0;
    }
}

pub struct Detector {
    config: DetectorConfig,
    background: BackgroundModel,
    scores: VecDeque<f64>,
    last_brightness: Option<f64>,
    started_at: Option<Instant>,
    triggered: bool,
    pending_since: Option<Instant>,
    low_motion_frames: u32,
}

impl Detector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            background: BackgroundModel::new(),
            scores: VecDeque::with_capacity(SMOOTHING_WINDOW),
            last_brightness: None,
            started_at: None,
            triggered: false,
            pending_since: None,
            low_motion_frames: 0,
        }
    }

    /// Whether a Start has been emitted without a matching Stop yet.
    pub fn motion_active(&self) -> bool {
        self.triggered
    }

    /// Analyze one frame. Returns the per-frame scores and at most one
    /// motion transition.
    pub fn analyze(&mut self, frame: &SubFrame, now: Instant) -> (FrameAnalysis, Option<MotionEvent>) {
        let started = *self.started_at.get_or_insert(now);

        let motion_score = self.background.apply(frame);
        if self.scores.len() == SMOOTHING_WINDOW {
            self.scores.pop_front();
        }
        self.scores.push_back(motion_score);
        let smoothed = self.scores.iter().sum::<f64>() / self.scores.len() as f64;

        let brightness = mean_luminance(frame);
        let brightness_delta = self
            .last_brightness
            .map(|last| (brightness - last).abs())
            .unwrap_or(0.0);
        self.last_brightness = Some(brightness);

        let condition = smoothed > self.config.motion_threshold
            || brightness_delta > self.config.light_jump_threshold;

        let analysis = FrameAnalysis {
            motion_score,
            smoothed_motion_score: smoothed,
            brightness,
            brightness_delta,
            condition,
        };

        // Warm-up: frames prime the model, nothing is emitted.
        if now.duration_since(started) < self.config.startup_delay {
            return (analysis, None);
        }

        (analysis, self.gate(condition, now))
    }

    /// Min-motion persistence and stop hysteresis over the raw condition.
    fn gate(&mut self, condition: bool, now: Instant) -> Option<MotionEvent> {
        if condition {
            self.low_motion_frames = 0;
            if self.triggered {
                return None;
            }
            let since = *self.pending_since.get_or_insert(now);
            if now.duration_since(since) >= self.config.min_motion {
                self.triggered = true;
                self.pending_since = None;
                return Some(MotionEvent::Start(now));
            }
            return None;
        }

        if self.triggered {
            self.low_motion_frames += 1;
            if self.low_motion_frames >= HYSTERESIS_FRAMES {
                self.triggered = false;
                self.low_motion_frames = 0;
                return Some(MotionEvent::Stop(now));
            }
        } else if self.pending_since.take().is_some() {
            debug!("brief motion ignored");
        }
        None
    }

    /// Full reset after a stream reconnect: background model, smoothing
    /// window, gate state and the startup delay all start over.
    pub fn reset(&mut self) {
        self.background.reset();
        self.scores.clear();
        self.last_brightness = None;
        self.started_at = None;
        self.triggered = false;
        self.pending_since = None;
        self.low_motion_frames = 0;
    }
}

fn mean_luminance(frame: &SubFrame) -> f64 {
    if frame.data.is_empty() {
        return 0.0;
    }
    let sum: u64 = frame.data.iter().map(|&p| p as u64).sum();
    sum as f64 / frame.data.len() as f64
}
