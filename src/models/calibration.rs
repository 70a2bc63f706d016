use serde::{Deserialize, Serialize};

/// `GET /calib/progress/{session_id}` payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CalibrationSample {
    #[serde(rename = "good_time")]
    pub good_time_seconds: f64,
    #[serde(rename = "correcta")]
    pub is_correct_posture: bool,
}

impl CalibrationSample {
    pub fn new(good_time_seconds: f64, is_correct_posture: bool) -> Self {
        Self {
            good_time_seconds,
            is_correct_posture,
        }
    }
}
