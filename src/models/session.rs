use serde::{Deserialize, Serialize};

/// One row of `GET /sesiones/` as the backend sends it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    pub id: String,
    pub intervalo_segundos: f64,
    #[serde(default)]
    pub modo: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub total_interval_seconds: f64,
    pub mode: String,
    /// Overwritten by every fresh progress poll; zero until the first one.
    pub elapsed_seconds: f64,
}

impl Session {
    /// Session known only by id (from the launch URL); the first progress
    /// poll fills in the interval.
    pub fn pinned(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            total_interval_seconds: 0.0,
            mode: String::new(),
            elapsed_seconds: 0.0,
        }
    }
}

impl From<SessionRecord> for Session {
    fn from(record: SessionRecord) -> Self {
        Self {
            id: record.id,
            total_interval_seconds: record.intervalo_segundos,
            mode: record.modo,
            elapsed_seconds: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SessionProgress {
    pub elapsed: f64,
    #[serde(rename = "intervalo_segundos")]
    pub total_interval_seconds: f64,
}

impl SessionProgress {
    pub fn is_complete(&self) -> bool {
        self.elapsed >= self.total_interval_seconds
    }

    /// Completion for display, clamped to 100.
    pub fn percent(&self) -> f64 {
        if self.total_interval_seconds <= 0.0 {
            return 100.0;
        }
        (self.elapsed / self.total_interval_seconds * 100.0).min(100.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RestartResponse {
    pub ok: bool,
    #[serde(default)]
    pub message: Option<String>,
}
