use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf, time::Duration};
use url::Url;

use crate::launch::LaunchContext;

const BACKEND_PORT: u16 = 8765;
const DEFAULT_HOST: &str = "localhost";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollIntervals {
    pub progress_ms: u64,
    pub calibration_ms: u64,
    pub session_lookup_ms: u64,
    pub metrics_ms: u64,
    pub timeline_ms: u64,
    pub patient_ms: u64,
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self {
            progress_ms: 1_000,
            calibration_ms: 800,
            session_lookup_ms: 3_000,
            metrics_ms: 1_000,
            timeline_ms: 3_000,
            patient_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// `None` derives `http://{launch host}:8765`.
    pub api_base_url: Option<String>,
    /// `None` derives `ws://{launch host}:8765/video/output`.
    pub stream_url: Option<String>,
    pub video_enabled: bool,
    pub data_dir: PathBuf,
    pub request_timeout_ms: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub calibration_target_secs: f64,
    pub poll: PollIntervals,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_base_url: None,
            stream_url: None,
            video_enabled: true,
            data_dir: PathBuf::from(".posture-monitor"),
            request_timeout_ms: 5_000,
            reconnect_initial_ms: 500,
            reconnect_max_ms: 10_000,
            calibration_target_secs: crate::calibration::CALIBRATION_TARGET_SECONDS,
            poll: PollIntervals::default(),
        }
    }
}

/// Concrete URLs once the launch host is known.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub api_base: Url,
    pub stream: Option<Url>,
}

impl ClientSettings {
    /// Reads settings from `path` when given. Missing fields fall back to
    /// defaults; a missing file is an error only when explicitly requested.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => {
                let contents = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read settings from {}", path.display()))?;
                serde_json::from_str(&contents)
                    .with_context(|| format!("Failed to parse settings in {}", path.display()))?
            }
            None => ClientSettings::default(),
        };
        settings.apply_env();
        Ok(settings)
    }

    fn apply_env(&mut self) {
        if let Ok(value) = std::env::var("POSTURE_API_BASE_URL") {
            self.api_base_url = Some(value);
        }
        if let Ok(value) = std::env::var("POSTURE_STREAM_URL") {
            self.stream_url = Some(value);
        }
        if let Ok(value) = std::env::var("POSTURE_DATA_DIR") {
            self.data_dir = PathBuf::from(value);
        }
    }

    pub fn resolve_endpoints(&self, launch: &LaunchContext) -> Result<Endpoints> {
        let host = launch.host.as_deref().unwrap_or(DEFAULT_HOST);

        let api_base = match &self.api_base_url {
            Some(raw) => Url::parse(raw).with_context(|| format!("invalid api_base_url '{raw}'"))?,
            None => Url::parse(&format!("http://{host}:{BACKEND_PORT}/"))
                .with_context(|| format!("cannot derive api url from host '{host}'"))?,
        };

        let stream = if self.video_enabled {
            let url = match &self.stream_url {
                Some(raw) => {
                    Url::parse(raw).with_context(|| format!("invalid stream_url '{raw}'"))?
                }
                None => Url::parse(&format!("ws://{host}:{BACKEND_PORT}/video/output"))
                    .with_context(|| format!("cannot derive stream url from host '{host}'"))?,
            };
            Some(url)
        } else {
            None
        };

        Ok(Endpoints { api_base, stream })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("posture-monitor.sqlite3")
    }
}
