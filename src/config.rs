//! Configuration management for Device Pilot.
//!
//! Configuration is loaded from environment variables (`RTSP_URL_MAIN`,
//! `RTSP_URL_SUB`, and the `PILOT_*` family) and then overridden by CLI
//! flags in `main.rs`. Validation fails fast before anything is started.

use config::{Config, ConfigError, Environment};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime configuration for the whole pilot system.
#[derive(Debug, Clone, Deserialize)]
pub struct PilotConfig {
    /// Main RTSP stream URL (high-res, captured by the segment buffer)
    #[serde(default)]
    pub rtsp_url_main: String,

    /// Sub RTSP stream URL (low-res, consumed by the detector)
    #[serde(default)]
    pub rtsp_url_sub: String,

    /// Footage retained before the triggering event, in seconds
    #[serde(default = "default_pre_roll_seconds")]
    pub pre_roll_seconds: f64,

    /// Tail period after motion stops, in seconds
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: f64,

    /// Nominal HLS segment length in seconds
    #[serde(default = "default_segment_duration")]
    pub segment_duration: f64,

    /// Detection warm-up window after start, in seconds
    #[serde(default = "default_startup_delay_seconds")]
    pub startup_delay_seconds: f64,

    /// Minimum sustained motion before an event is declared, in seconds
    #[serde(default = "default_min_motion_seconds")]
    pub min_motion_seconds: f64,

    /// Fraction of foreground pixels that counts as motion (0-1)
    #[serde(default = "default_motion_threshold")]
    pub motion_threshold: f64,

    /// Mean-luminance jump that counts as a light event (0-255)
    #[serde(default = "default_light_jump_threshold")]
    pub light_jump_threshold: f64,

    /// Cap on reconnect/restart backoff, in seconds
    #[serde(default = "default_max_reconnect_delay")]
    pub max_reconnect_delay: f64,

    /// Directory for the rotating HLS segment buffer
    #[serde(default = "default_buffer_dir")]
    pub buffer_dir: PathBuf,

    /// Directory for per-session scratch files (concat manifests)
    #[serde(default = "default_sessions_dir")]
    pub sessions_dir: PathBuf,

    /// Directory for finished MP4 output
    #[serde(default = "default_evidence_dir")]
    pub evidence_dir: PathBuf,

    /// Extra segments kept beyond the pre-roll window
    #[serde(default = "default_retention_headroom")]
    pub retention_headroom: usize,

    /// Number of concurrent MP4 assembly workers
    #[serde(default = "default_recorder_workers")]
    pub recorder_workers: usize,

    #[serde(default)]
    pub verbose: bool,
}

fn default_pre_roll_seconds() -> f64 {
    10.0
}
fn default_cooldown_seconds() -> f64 {
    10.0
}
fn default_segment_duration() -> f64 {
    5.0
}
fn default_startup_delay_seconds() -> f64 {
    10.0
}
fn default_min_motion_seconds() -> f64 {
    0.5
}
fn default_motion_threshold() -> f64 {
    0.02
}
fn default_light_jump_threshold() -> f64 {
    30.0
}
fn default_max_reconnect_delay() -> f64 {
    30.0
}
fn default_retention_headroom() -> usize {
    2
}
fn default_recorder_workers() -> usize {
    2
}

fn default_buffer_dir() -> PathBuf {
    // Prefer the RAM disk on devices that have one mounted; provisioning it
    // is an operator concern.
    let ramdisk = Path::new("/mnt/ramdisk");
    if cfg!(target_os = "linux") && ramdisk.is_dir() {
        return ramdisk.join("device-pilot").join("buffer");
    }
    std::env::temp_dir().join("device-pilot").join("buffer")
}

fn default_sessions_dir() -> PathBuf {
    std::env::temp_dir().join("device-pilot").join("sessions")
}

fn default_evidence_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join("device-pilot-recordings")
}

impl Default for PilotConfig {
    fn default() -> Self {
        Self {
            rtsp_url_main: String::new(),
            rtsp_url_sub: String::new(),
            pre_roll_seconds: default_pre_roll_seconds(),
            cooldown_seconds: default_cooldown_seconds(),
            segment_duration: default_segment_duration(),
            startup_delay_seconds: default_startup_delay_seconds(),
            min_motion_seconds: default_min_motion_seconds(),
            motion_threshold: default_motion_threshold(),
            light_jump_threshold: default_light_jump_threshold(),
            max_reconnect_delay: default_max_reconnect_delay(),
            buffer_dir: default_buffer_dir(),
            sessions_dir: default_sessions_dir(),
            evidence_dir: default_evidence_dir(),
            retention_headroom: default_retention_headroom(),
            recorder_workers: default_recorder_workers(),
            verbose: false,
        }
    }
}

impl PilotConfig {
    /// Load configuration from environment variables.
    ///
    /// `RTSP_URL_MAIN` and `RTSP_URL_SUB` are read unprefixed; everything
    /// else comes from `PILOT_*` (e.g. `PILOT_PRE_ROLL_SECONDS`).
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(Environment::with_prefix("PILOT").try_parsing(true))
            .build()?;

        let mut config: Self = config.try_deserialize()?;
        if let Ok(url) = std::env::var("RTSP_URL_MAIN") {
            config.rtsp_url_main = url;
        }
        if let Ok(url) = std::env::var("RTSP_URL_SUB") {
            config.rtsp_url_sub = url;
        }
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        validate_url("rtsp_url_main", &self.rtsp_url_main)?;
        validate_url("rtsp_url_sub", &self.rtsp_url_sub)?;

        if self.pre_roll_seconds < 0.0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "pre_roll_seconds",
                message: "must not be negative".to_string(),
            });
        }
        if self.cooldown_seconds < 0.0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "cooldown_seconds",
                message: "must not be negative".to_string(),
            });
        }
        if self.segment_duration <= 0.0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "segment_duration",
                message: "must be greater than 0".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.motion_threshold) {
            return Err(ConfigValidationError::InvalidValue {
                field: "motion_threshold",
                message: "must be within 0..=1".to_string(),
            });
        }
        if !(0.0..=255.0).contains(&self.light_jump_threshold) {
            return Err(ConfigValidationError::InvalidValue {
                field: "light_jump_threshold",
                message: "must be within 0..=255".to_string(),
            });
        }
        if self.recorder_workers == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "recorder_workers",
                message: "at least one worker is required".to_string(),
            });
        }
        if self.sessions_dir == self.evidence_dir {
            return Err(ConfigValidationError::InvalidValue {
                field: "sessions_dir",
                message: "must differ from evidence_dir (scratch is wiped on startup)"
                    .to_string(),
            });
        }

        Ok(())
    }

    /// Create the buffer, sessions and evidence directories.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.buffer_dir)?;
        std::fs::create_dir_all(&self.sessions_dir)?;
        std::fs::create_dir_all(&self.evidence_dir)?;
        Ok(())
    }

    pub fn pre_roll(&self) -> Duration {
        Duration::from_secs_f64(self.pre_roll_seconds)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.cooldown_seconds)
    }

    pub fn segment_len(&self) -> Duration {
        Duration::from_secs_f64(self.segment_duration)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs_f64(self.startup_delay_seconds)
    }

    pub fn min_motion(&self) -> Duration {
        Duration::from_secs_f64(self.min_motion_seconds)
    }

    pub fn max_reconnect(&self) -> Duration {
        Duration::from_secs_f64(self.max_reconnect_delay)
    }

    /// Whole segments needed to cover the pre-roll window, rounding up.
    pub fn preroll_segment_count(&self) -> usize {
        (self.pre_roll_seconds / self.segment_duration).ceil() as usize
    }

    /// Segments the buffer retains: the pre-roll window plus headroom.
    pub fn retention_limit(&self) -> usize {
        self.preroll_segment_count() + self.retention_headroom
    }
}

fn validate_url(field: &'static str, url: &str) -> Result<(), ConfigValidationError> {
    if url.is_empty() {
        return Err(ConfigValidationError::MissingField(field));
    }
    if !url.starts_with("rtsp://") && !url.starts_with("rtsps://") {
        return Err(ConfigValidationError::InvalidValue {
            field,
            message: "URL must start with rtsp:// or rtsps://".to_string(),
        });
    }
    Ok(())
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("missing required setting: {0}")]
    MissingField(&'static str),

    #[error("invalid value for {field}: {message}")]
    InvalidValue {
        field: &'static str,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> PilotConfig {
        PilotConfig {
            rtsp_url_main: "rtsp://camera:554/main".to_string(),
            rtsp_url_sub: "rtsp://camera:554/sub".to_string(),
            sessions_dir: PathBuf::from("/tmp/device-pilot-test/sessions"),
            evidence_dir: PathBuf::from("/tmp/device-pilot-test/evidence"),
            ..PilotConfig::default()
        }
    }

    #[test]
    fn test_valid_config() {
        let config = create_test_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_main_url() {
        let mut config = create_test_config();
        config.rtsp_url_main = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField("rtsp_url_main"))
        ));
    }

    #[test]
    fn test_non_rtsp_url_rejected() {
        let mut config = create_test_config();
        config.rtsp_url_sub = "http://camera:554/sub".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_rtsps_url_accepted() {
        let mut config = create_test_config();
        config.rtsp_url_main = "rtsps://camera:7441/main".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sessions_dir_must_differ_from_evidence() {
        let mut config = create_test_config();
        config.sessions_dir = config.evidence_dir.clone();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_motion_threshold_range() {
        let mut config = create_test_config();
        config.motion_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_preroll_segment_count_rounds_up() {
        let mut config = create_test_config();
        config.segment_duration = 5.0;

        config.pre_roll_seconds = 0.0;
        assert_eq!(config.preroll_segment_count(), 0);

        config.pre_roll_seconds = 3.0;
        assert_eq!(config.preroll_segment_count(), 1);

        config.pre_roll_seconds = 4.0;
        assert_eq!(config.preroll_segment_count(), 1);

        config.pre_roll_seconds = 5.0;
        assert_eq!(config.preroll_segment_count(), 1);

        config.pre_roll_seconds = 5.1;
        assert_eq!(config.preroll_segment_count(), 2);
    }

    #[test]
    fn test_retention_covers_preroll_plus_headroom() {
        let mut config = create_test_config();
        config.segment_duration = 5.0;
        config.pre_roll_seconds = 10.0;
        config.retention_headroom = 2;
        assert_eq!(config.retention_limit(), 4);
    }
}
