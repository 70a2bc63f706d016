use std::fmt;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

/// Stable identifier of a physical monitoring unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything read from the launch URL. Parsed once and immutable afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchContext {
    pub host: Option<String>,
    pub device_id: Option<DeviceId>,
    pub session_id: Option<String>,
    pub force_calibration: bool,
}

impl LaunchContext {
    /// Accepts a full URL (`http://host/?device_id=..`) or a bare query string
    /// (`device_id=..&forceCalib=1`).
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let url = if raw.contains("://") {
            Url::parse(raw).with_context(|| format!("invalid launch url '{raw}'"))?
        } else {
            let query = raw.trim_start_matches('?');
            Url::parse(&format!("http://localhost/?{query}"))
                .with_context(|| format!("invalid launch query '{raw}'"))?
        };

        let mut ctx = LaunchContext {
            host: if raw.contains("://") {
                url.host_str().map(str::to_string)
            } else {
                None
            },
            ..Default::default()
        };

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "device_id" if !value.is_empty() => {
                    ctx.device_id = Some(DeviceId::new(value.into_owned()))
                }
                "session_id" if !value.is_empty() => ctx.session_id = Some(value.into_owned()),
                "forceCalib" => ctx.force_calibration = value == "1",
                _ => {}
            }
        }

        Ok(ctx)
    }
}
