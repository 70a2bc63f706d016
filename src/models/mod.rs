pub mod calibration;
pub mod display;
pub mod session;

pub use calibration::CalibrationSample;
pub use display::{Patient, PostureAnalysis, PostureMetrics, TimelineEntry};
pub use session::{RestartResponse, Session, SessionProgress, SessionRecord};
