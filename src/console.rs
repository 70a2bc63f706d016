//! Line commands read from stdin while the client runs.

use serde_json::{json, Value};

use crate::{
    display::{session_percent, DisplayState},
    lifecycle::CoordinatorSnapshot,
    relay::VideoFrame,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Restart the finished session.
    Restart,
    /// Leave calibration without waiting for the device mode switch.
    Proceed,
    Status,
    Quit,
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim().to_ascii_lowercase().as_str() {
            "restart" | "r" => Some(ConsoleCommand::Restart),
            "proceed" | "p" => Some(ConsoleCommand::Proceed),
            "status" | "s" => Some(ConsoleCommand::Status),
            "quit" | "q" | "exit" => Some(ConsoleCommand::Quit),
            _ => None,
        }
    }
}

pub const HELP: &str = "commands: restart | proceed | status | quit";

pub fn status_report(
    snapshot: &CoordinatorSnapshot,
    display: &DisplayState,
    frame: Option<&VideoFrame>,
) -> Value {
    json!({
        "phase": snapshot.phase.as_str(),
        "loading": snapshot.loading,
        "deviceId": snapshot.device_id,
        "session": snapshot.session,
        "sessionPercent": session_percent(snapshot.progress),
        "calibration": snapshot.calibration,
        "alert": snapshot.alert,
        "deviceRestartRequired": snapshot.device_restart_required,
        "patient": display.patient.as_ref().map(|p| p.nombre.as_str()),
        "risk": display.risk().map(|r| r.as_str()),
        "dominantPosture": display.dominant_posture().map(|(label, _)| label),
        "timelineEntries": display.timeline.len(),
        "frame": frame.map(|f| {
            let (width, height) = f.dimensions();
            json!({ "width": width, "height": height, "receivedAt": f.received_at })
        }),
    })
}
