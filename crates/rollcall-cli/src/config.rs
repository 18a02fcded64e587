use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Interval between polling-loop ticks.
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 10;

/// Runtime configuration.
///
/// Built from defaults, then an optional TOML file, then `ROLLCALL_*`
/// environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Requested capture size; the driver may pick a nearby one.
    pub frame_width: u32,
    pub frame_height: u32,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Directory of `<identity>.<ext>` reference images.
    pub roster_dir: PathBuf,
    /// Directory the daily PDF report is written to.
    pub report_dir: PathBuf,
    /// Maximum embedding distance accepted as a match.
    pub tolerance: f32,
    /// Scale applied to frames before recognition.
    pub downsample_factor: f32,
    pub tick_interval_ms: u64,
    /// Frames discarded after opening the camera (AGC/AE stabilization).
    pub warmup_frames: usize,
    /// Frames tried when enrolling from the camera before giving up.
    pub enroll_attempts: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            frame_width: 640,
            frame_height: 480,
            model_dir: rollcall_core::default_model_dir(),
            roster_dir: PathBuf::from("face_database"),
            report_dir: PathBuf::from("."),
            tolerance: rollcall_core::DEFAULT_TOLERANCE,
            downsample_factor: rollcall_hw::DEFAULT_DOWNSAMPLE_FACTOR,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            warmup_frames: 4,
            enroll_attempts: 30,
        }
    }
}

impl Config {
    /// Load the file at `path` (if any), then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config {}", path.display()))?;
                Self::from_toml(&text)
                    .with_context(|| format!("invalid config {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Override fields from `ROLLCALL_*` variables. Unparseable values are
    /// ignored with a warning.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("ROLLCALL_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = lookup("ROLLCALL_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_ROSTER_DIR") {
            self.roster_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_REPORT_DIR") {
            self.report_dir = PathBuf::from(v);
        }
        env_parse(&lookup, "ROLLCALL_FRAME_WIDTH", &mut self.frame_width);
        env_parse(&lookup, "ROLLCALL_FRAME_HEIGHT", &mut self.frame_height);
        env_parse(&lookup, "ROLLCALL_TOLERANCE", &mut self.tolerance);
        env_parse(&lookup, "ROLLCALL_DOWNSAMPLE_FACTOR", &mut self.downsample_factor);
        env_parse(&lookup, "ROLLCALL_TICK_INTERVAL_MS", &mut self.tick_interval_ms);
        env_parse(&lookup, "ROLLCALL_WARMUP_FRAMES", &mut self.warmup_frames);
        env_parse(&lookup, "ROLLCALL_ENROLL_ATTEMPTS", &mut self.enroll_attempts);
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.tolerance.is_finite() && self.tolerance >= 0.0) {
            anyhow::bail!("tolerance must be a non-negative number, got {}", self.tolerance);
        }
        if !(self.downsample_factor > 0.0 && self.downsample_factor <= 1.0) {
            anyhow::bail!("downsample_factor must be in (0, 1], got {}", self.downsample_factor);
        }
        if self.tick_interval_ms == 0 {
            anyhow::bail!("tick_interval_ms must be at least 1");
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.tick_interval_ms)
    }
}

fn env_parse<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    if let Some(raw) = lookup(key) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable environment override"),
        }
    }
}
