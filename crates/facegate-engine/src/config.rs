use facegate_core::{CenterTolerance, DetectOptions, MatchThresholds};
use facegate_hw::StreamConstraints;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv { key: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Engine configuration: defaults, overlaid by an optional TOML file,
/// overlaid by `FACEGATE_*` environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Detection loop period.
    pub poll_interval_ms: u64,
    /// How long a face must stay valid before verify mode captures.
    pub dwell_ms: u64,
    /// Delay between a successful verification and automatic close.
    pub confirm_close_delay_ms: u64,
    /// Allowed horizontal offset of the face center, as a fraction of frame width.
    pub off_center_x: f32,
    /// Allowed vertical offset of the face center, as a fraction of frame height.
    pub off_center_y: f32,
    /// Canonical width / height of every captured image.
    pub target_aspect: f32,
    /// Landmark similarity needed for a match.
    pub similarity_threshold: f32,
    /// Detector confidence needed for a match.
    pub confidence_threshold: f32,
    /// Detections scoring below this are discarded.
    pub detection_confidence: f32,
    /// V4L2 device path.
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Frames discarded after the stream starts (AGC/AE settling).
    pub warmup_frames: usize,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// SCRFD model file name inside `model_dir`.
    pub detector_model: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 300,
            dwell_ms: 1500,
            confirm_close_delay_ms: 1500,
            off_center_x: 0.15,
            off_center_y: 0.20,
            target_aspect: 0.75,
            similarity_threshold: 0.90,
            confidence_threshold: 0.60,
            detection_confidence: 0.50,
            camera_device: "/dev/video0".to_string(),
            camera_width: 640,
            camera_height: 480,
            warmup_frames: 4,
            model_dir: default_model_dir(),
            detector_model: "det_10g.onnx".to_string(),
        }
    }
}

/// `$XDG_DATA_HOME/facegate/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facegate/models")
}

impl EngineConfig {
    /// Load from `path` (if given) and the process environment, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml(&text)?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        tracing::debug!(?config, "configuration loaded");
        Ok(config)
    }

    /// Parse a TOML document; missing keys keep their defaults.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `FACEGATE_*` overrides. `lookup` returns the variable's value
    /// if set. Unparseable values are errors, not silently ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        env_parse(&lookup, "FACEGATE_POLL_INTERVAL_MS", &mut self.poll_interval_ms)?;
        env_parse(&lookup, "FACEGATE_DWELL_MS", &mut self.dwell_ms)?;
        env_parse(&lookup, "FACEGATE_CONFIRM_CLOSE_DELAY_MS", &mut self.confirm_close_delay_ms)?;
        env_parse(&lookup, "FACEGATE_OFF_CENTER_X", &mut self.off_center_x)?;
        env_parse(&lookup, "FACEGATE_OFF_CENTER_Y", &mut self.off_center_y)?;
        env_parse(&lookup, "FACEGATE_TARGET_ASPECT", &mut self.target_aspect)?;
        env_parse(&lookup, "FACEGATE_SIMILARITY_THRESHOLD", &mut self.similarity_threshold)?;
        env_parse(&lookup, "FACEGATE_CONFIDENCE_THRESHOLD", &mut self.confidence_threshold)?;
        env_parse(&lookup, "FACEGATE_DETECTION_CONFIDENCE", &mut self.detection_confidence)?;
        env_parse(&lookup, "FACEGATE_CAMERA_DEVICE", &mut self.camera_device)?;
        env_parse(&lookup, "FACEGATE_CAMERA_WIDTH", &mut self.camera_width)?;
        env_parse(&lookup, "FACEGATE_CAMERA_HEIGHT", &mut self.camera_height)?;
        env_parse(&lookup, "FACEGATE_WARMUP_FRAMES", &mut self.warmup_frames)?;
        env_parse(&lookup, "FACEGATE_MODEL_DIR", &mut self.model_dir)?;
        env_parse(&lookup, "FACEGATE_DETECTOR_MODEL", &mut self.detector_model)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.poll_interval_ms == 0 {
            return invalid("poll_interval_ms must be positive".into());
        }
        if !(self.target_aspect.is_finite() && self.target_aspect > 0.0) {
            return invalid(format!("target_aspect must be positive, got {}", self.target_aspect));
        }
        for (name, value) in [("off_center_x", self.off_center_x), ("off_center_y", self.off_center_y)] {
            if !(0.0..=0.5).contains(&value) {
                return invalid(format!("{name} must be within [0, 0.5], got {value}"));
            }
        }
        for (name, value) in [
            ("similarity_threshold", self.similarity_threshold),
            ("confidence_threshold", self.confidence_threshold),
            ("detection_confidence", self.detection_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return invalid(format!("{name} must be within [0, 1], got {value}"));
            }
        }
        if self.camera_width == 0 || self.camera_height == 0 {
            return invalid("camera resolution must be non-zero".into());
        }
        if self.camera_device.is_empty() {
            return invalid("camera_device must not be empty".into());
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn dwell(&self) -> Duration {
        Duration::from_millis(self.dwell_ms)
    }

    pub fn confirm_close_delay(&self) -> Duration {
        Duration::from_millis(self.confirm_close_delay_ms)
    }

    pub fn tolerance(&self) -> CenterTolerance {
        CenterTolerance {
            x: self.off_center_x,
            y: self.off_center_y,
        }
    }

    pub fn thresholds(&self) -> MatchThresholds {
        MatchThresholds {
            similarity: self.similarity_threshold,
            confidence: self.confidence_threshold,
        }
    }

    pub fn detect_options(&self) -> DetectOptions {
        DetectOptions {
            min_confidence: self.detection_confidence,
        }
    }

    pub fn stream_constraints(&self) -> StreamConstraints {
        StreamConstraints::preferred(self.camera_width, self.camera_height)
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.detector_model)
    }
}

fn env_parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) -> Result<(), ConfigError> {
    if let Some(value) = lookup(key) {
        *slot = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
            key: key.to_string(),
            value,
        })?;
    }
    Ok(())
}
