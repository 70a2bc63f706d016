use serde::Serialize;

use crate::models::CalibrationSample;

use super::CALIBRATION_TARGET_SECONDS;

/// Read-only copy of the tracker published in coordinator snapshots.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationView {
    pub good_time: f64,
    pub percentage: f64,
    pub is_in_frame: bool,
}

/// Turns calibration samples into a completion percentage.
///
/// Progress only grows while posture stays correct; any incorrect sample
/// drops it back to zero. Completion is reported once per calibration run,
/// on the sample that first reaches 100%, until [`reset`](Self::reset).
#[derive(Debug, Clone)]
pub struct CalibrationTracker {
    target_secs: f64,
    view: CalibrationView,
    completed: bool,
}

impl Default for CalibrationTracker {
    fn default() -> Self {
        Self::new(CALIBRATION_TARGET_SECONDS)
    }
}

impl CalibrationTracker {
    pub fn new(target_secs: f64) -> Self {
        Self {
            target_secs: if target_secs > 0.0 {
                target_secs
            } else {
                CALIBRATION_TARGET_SECONDS
            },
            view: CalibrationView::default(),
            completed: false,
        }
    }

    /// Feeds one sample. Returns `true` only on the sample that completes
    /// calibration.
    pub fn observe(&mut self, sample: CalibrationSample) -> bool {
        if !sample.is_correct_posture {
            self.view.is_in_frame = false;
            self.view.percentage = 0.0;
            return false;
        }

        let before = self.view.percentage;
        let percentage = (sample.good_time_seconds / self.target_secs * 100.0).clamp(0.0, 100.0);
        self.view = CalibrationView {
            good_time: sample.good_time_seconds,
            percentage,
            is_in_frame: percentage > 0.0,
        };

        if !self.completed && before < 100.0 && percentage >= 100.0 {
            self.completed = true;
            return true;
        }
        false
    }

    pub fn reset(&mut self) {
        self.view = CalibrationView::default();
        self.completed = false;
    }

    pub fn view(&self) -> CalibrationView {
        self.view
    }

    pub fn percentage(&self) -> f64 {
        self.view.percentage
    }

    pub fn is_complete(&self) -> bool {
        self.completed
    }
}
