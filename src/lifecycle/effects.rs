//! Side effects with at-most-once semantics. Each executor reads the
//! persisted flag it guards before calling out, and writes it only after the
//! call succeeded.

use log::{error, info, warn};

use crate::{
    api::BackendApi,
    flags::{Flag, FlagStore},
    launch::DeviceId,
};

use super::phase::{Effect, Event, ReportOutcome};

/// Runs one asynchronous effect and returns the event that reports its
/// outcome, if the lifecycle waits for one.
pub async fn execute<A, F>(api: &A, flags: &F, device: &DeviceId, effect: Effect) -> Option<Event>
where
    A: BackendApi,
    F: FlagStore,
{
    match effect {
        Effect::LoadFlags => {
            let calibrated = match flags.get(device, Flag::Calibrated).await {
                Ok(calibrated) => calibrated,
                Err(err) => {
                    // unreadable store: calibrate again rather than skip it
                    warn!("cannot read calibration flag for {device}: {err:#}");
                    false
                }
            };
            Some(Event::FlagsLoaded { calibrated })
        }
        Effect::SwitchToNormalMode => Some(Event::ModeSwitchFinished {
            ok: switch_to_normal_mode(api, device).await,
        }),
        Effect::PersistCalibrated => {
            persist_calibrated(flags, device).await;
            None
        }
        Effect::ReportSessionEnd { generation } => Some(Event::EndReportFinished {
            generation,
            outcome: report_session_end(api, flags, device).await,
        }),
        Effect::ClearSessionEndedFlag => {
            clear_session_ended(flags, device).await;
            None
        }
        Effect::RestartSession { session_id } => {
            let (ok, message) = restart_session(api, &session_id, device).await;
            Some(Event::RestartFinished { ok, message })
        }
        Effect::ResetCalibration | Effect::Alert(_) => None,
    }
}

pub async fn report_session_end<A, F>(api: &A, flags: &F, device: &DeviceId) -> ReportOutcome
where
    A: BackendApi,
    F: FlagStore,
{
    match flags.get(device, Flag::SessionEndedReported).await {
        Ok(true) => {
            info!("session end for {device} already reported; skipping");
            return ReportOutcome::AlreadyReported;
        }
        Ok(false) => {}
        Err(err) => {
            // without the read-check the report could be sent twice
            warn!("cannot read session-end marker for {device}: {err:#}");
            return ReportOutcome::Failed;
        }
    }

    if let Err(err) = api.report_session_end(device).await {
        warn!("session end report for {device} failed: {err:#}");
        return ReportOutcome::Failed;
    }

    if let Err(err) = flags.set(device, Flag::SessionEndedReported).await {
        error!("failed to persist session-end marker for {device}: {err:#}");
    }
    // next session starts with a fresh calibration
    if let Err(err) = flags.clear(device, Flag::Calibrated).await {
        error!("failed to clear calibration flag for {device}: {err:#}");
    }

    info!("session end reported for {device}");
    ReportOutcome::Reported
}

pub async fn switch_to_normal_mode<A: BackendApi>(api: &A, device: &DeviceId) -> bool {
    match api.switch_to_normal_mode(device).await {
        Ok(()) => {
            info!("device {device} switched to normal mode");
            true
        }
        Err(err) => {
            warn!("mode switch for {device} failed: {err:#}");
            false
        }
    }
}

/// Returns the backend verdict and, on refusal, its message.
pub async fn restart_session<A: BackendApi>(
    api: &A,
    session_id: &str,
    device: &DeviceId,
) -> (bool, Option<String>) {
    match api.restart_session(session_id, device).await {
        Ok(response) if response.ok => {
            info!("session {session_id} restarted for {device}");
            (true, None)
        }
        Ok(response) => {
            warn!(
                "backend refused restart of session {session_id}: {}",
                response.message.as_deref().unwrap_or("no reason given")
            );
            (false, response.message)
        }
        Err(err) => {
            warn!("restart of session {session_id} failed: {err:#}");
            (false, Some("network error".to_string()))
        }
    }
}

pub async fn persist_calibrated<F: FlagStore>(flags: &F, device: &DeviceId) {
    match flags.set(device, Flag::Calibrated).await {
        Ok(()) => info!("device {device} marked calibrated"),
        Err(err) => error!("failed to persist calibration flag for {device}: {err:#}"),
    }
}

pub async fn clear_session_ended<F: FlagStore>(flags: &F, device: &DeviceId) {
    if let Err(err) = flags.clear(device, Flag::SessionEndedReported).await {
        error!("failed to clear session-end marker for {device}: {err:#}");
    }
}
