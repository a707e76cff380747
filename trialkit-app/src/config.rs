use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use trialkit_core::{TaskKind, TaskParameters};
use trialkit_experiment::sampler::DEFAULT_BUFFER_SECONDS;

/// Task file loaded at startup. Every section is optional.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub task: TaskKind,
    pub params: TaskParameters,
    pub recording: RecordingConfig,
    pub sampler: SamplerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Root for recording subdirectories.
    pub data_dir: PathBuf,
    /// How long to wait for the logger to acknowledge a start or stop.
    pub ack_timeout_secs: f64,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            ack_timeout_secs: 5.0,
        }
    }
}

impl RecordingConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.ack_timeout_secs.max(0.0))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Seconds of signal the sampler keeps; bounds the trial duration.
    pub buffer_seconds: f64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            buffer_seconds: DEFAULT_BUFFER_SECONDS,
        }
    }
}

impl AppConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        anyhow::ensure!(
            config.recording.ack_timeout_secs.is_finite() && config.recording.ack_timeout_secs > 0.0,
            "recording.ack_timeout_secs must be a positive number"
        );
        Ok(config)
    }
}
