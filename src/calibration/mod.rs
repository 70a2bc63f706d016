mod tracker;

pub use tracker::{CalibrationTracker, CalibrationView};

/// Seconds of correct posture needed to complete calibration.
pub const CALIBRATION_TARGET_SECONDS: f64 = 10.0;
