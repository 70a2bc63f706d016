use serde::{Deserialize, Serialize};

use crate::models::{Session, SessionProgress};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum LifecyclePhase {
    #[default]
    AwaitingCalibration,
    Calibrating,
    Finalizing,
    SessionActive,
    SessionEnded,
}

impl LifecyclePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecyclePhase::AwaitingCalibration => "awaiting-calibration",
            LifecyclePhase::Calibrating => "calibrating",
            LifecyclePhase::Finalizing => "finalizing",
            LifecyclePhase::SessionActive => "session-active",
            LifecyclePhase::SessionEnded => "session-ended",
        }
    }
}

/// Outcome of the end-of-session report effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    Reported,
    /// The persisted flag said it was already sent; no request was made.
    AlreadyReported,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Persisted `calibrated` flag, read on entry to `AwaitingCalibration`.
    FlagsLoaded { calibrated: bool },
    SessionResolved(Session),
    ProgressObserved(SessionProgress),
    /// `completed` is true only on the sample that crossed 100%.
    CalibrationProgress { percentage: f64, completed: bool },
    CalibrationRestart,
    ModeSwitchFinished { ok: bool },
    UserProceeded,
    /// `generation` is the one carried by the [`Effect::ReportSessionEnd`]
    /// that produced this outcome.
    EndReportFinished {
        generation: u64,
        outcome: ReportOutcome,
    },
    RestartRequested,
    RestartFinished { ok: bool, message: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Read the persisted flags and feed back [`Event::FlagsLoaded`].
    LoadFlags,
    ResetCalibration,
    SwitchToNormalMode,
    PersistCalibrated,
    /// One report per observed session end; `generation` ties the outcome
    /// back to it.
    ReportSessionEnd { generation: u64 },
    ClearSessionEndedFlag,
    RestartSession { session_id: String },
    Alert(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Pending {
    #[default]
    Idle,
    InFlight,
    Done,
}

/// Result of feeding one event.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub from: LifecyclePhase,
    pub to: LifecyclePhase,
    pub effects: Vec<Effect>,
}

impl Step {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// The lifecycle state machine. Pure: it never performs I/O, it only returns
/// the effects the caller must run.
#[derive(Debug, Clone, Default)]
pub struct Lifecycle {
    phase: LifecyclePhase,
    force_calibration: bool,
    session: Option<Session>,
    progress: Option<SessionProgress>,
    end_report: Pending,
    mode_switch: Pending,
    /// Bumped whenever a new session begins; outcomes of older reports are
    /// ignored.
    report_generation: u64,
    restart_in_flight: bool,
    /// Calibration was persisted; only a device restart and a new launch
    /// move the client on.
    device_restart_required: bool,
}

impl Lifecycle {
    pub fn new(force_calibration: bool) -> Self {
        Self {
            force_calibration,
            ..Default::default()
        }
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.phase
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn progress(&self) -> Option<SessionProgress> {
        self.progress
    }

    pub fn force_calibration(&self) -> bool {
        self.force_calibration
    }

    pub fn device_restart_required(&self) -> bool {
        self.device_restart_required
    }

    pub fn apply(&mut self, event: Event) -> Step {
        let from = self.phase;
        let mut effects = Vec::new();

        match event {
            Event::FlagsLoaded { calibrated } => {
                if self.phase == LifecyclePhase::AwaitingCalibration
                    && !self.device_restart_required
                {
                    if calibrated && !self.force_calibration {
                        self.phase = LifecyclePhase::SessionActive;
                    } else {
                        self.phase = LifecyclePhase::Calibrating;
                        effects.push(Effect::ResetCalibration);
                    }
                }
            }

            Event::SessionResolved(session) => self.on_session(session, &mut effects),

            Event::ProgressObserved(progress) => self.on_progress(progress, &mut effects),

            Event::CalibrationProgress {
                percentage,
                completed,
            } => match self.phase {
                LifecyclePhase::Calibrating if completed => {
                    self.phase = LifecyclePhase::Finalizing;
                    self.mode_switch = Pending::InFlight;
                    effects.push(Effect::SwitchToNormalMode);
                }
                // a failed mode switch is retried on the next full-progress sample
                LifecyclePhase::Finalizing
                    if percentage >= 100.0 && self.mode_switch == Pending::Idle =>
                {
                    self.mode_switch = Pending::InFlight;
                    effects.push(Effect::SwitchToNormalMode);
                }
                _ => {}
            },

            Event::CalibrationRestart => match self.phase {
                LifecyclePhase::Calibrating => effects.push(Effect::ResetCalibration),
                LifecyclePhase::Finalizing => {
                    self.phase = LifecyclePhase::Calibrating;
                    self.mode_switch = Pending::Idle;
                    effects.push(Effect::ResetCalibration);
                }
                _ => {}
            },

            Event::ModeSwitchFinished { ok } => {
                if self.phase == LifecyclePhase::Finalizing {
                    if ok {
                        self.finish_calibration(&mut effects);
                    } else {
                        self.mode_switch = Pending::Idle;
                    }
                }
            }

            Event::UserProceeded => {
                if self.phase == LifecyclePhase::Finalizing {
                    self.finish_calibration(&mut effects);
                }
            }

            Event::EndReportFinished {
                generation,
                outcome,
            } => {
                // an older report's marker write is queued ahead of the clear
                // issued when the new session began, so it needs no handling
                if generation == self.report_generation && self.end_report == Pending::InFlight {
                    self.end_report = match outcome {
                        ReportOutcome::Reported | ReportOutcome::AlreadyReported => Pending::Done,
                        ReportOutcome::Failed => Pending::Idle,
                    };
                }
            }

            Event::RestartRequested => {
                if self.phase == LifecyclePhase::SessionEnded && !self.restart_in_flight {
                    match (&self.session, self.end_report) {
                        (_, Pending::InFlight) => effects.push(Effect::Alert(
                            "session end report still in progress, try again".into(),
                        )),
                        (Some(session), _) => {
                            self.restart_in_flight = true;
                            effects.push(Effect::RestartSession {
                                session_id: session.id.clone(),
                            });
                        }
                        (None, _) => {}
                    }
                }
            }

            Event::RestartFinished { ok, message } => {
                self.restart_in_flight = false;
                if self.phase == LifecyclePhase::SessionEnded {
                    if ok {
                        self.phase = LifecyclePhase::SessionActive;
                        self.progress = None;
                        self.end_report = Pending::Idle;
                        self.report_generation += 1;
                        effects.push(Effect::ClearSessionEndedFlag);
                    } else {
                        let alert = match message.filter(|m| !m.trim().is_empty()) {
                            Some(detail) => format!("session restart failed: {detail}"),
                            None => "session restart failed".to_string(),
                        };
                        effects.push(Effect::Alert(alert));
                    }
                }
            }
        }

        Step {
            from,
            to: self.phase,
            effects,
        }
    }

    /// The device still runs calibration firmware until it is restarted, so
    /// the phase is not re-derived in this run.
    fn finish_calibration(&mut self, effects: &mut Vec<Effect>) {
        self.mode_switch = Pending::Done;
        self.phase = LifecyclePhase::AwaitingCalibration;
        self.device_restart_required = true;
        effects.push(Effect::PersistCalibrated);
    }

    fn on_session(&mut self, session: Session, effects: &mut Vec<Effect>) {
        match self.session.as_mut() {
            Some(current) if current.id == session.id => {
                current.total_interval_seconds = session.total_interval_seconds;
                current.mode = session.mode;
                return;
            }
            Some(_) => {}
            None => {
                self.session = Some(session);
                return;
            }
        }

        self.session = Some(session);
        self.begin_new_session(effects);
    }

    fn on_progress(&mut self, progress: SessionProgress, effects: &mut Vec<Effect>) {
        if !matches!(
            self.phase,
            LifecyclePhase::SessionActive | LifecyclePhase::SessionEnded
        ) {
            return;
        }

        if let Some(previous) = self.progress {
            if progress.elapsed < previous.elapsed {
                self.begin_new_session(effects);
            }
        }

        self.progress = Some(progress);
        if let Some(session) = &mut self.session {
            session.elapsed_seconds = progress.elapsed;
            session.total_interval_seconds = progress.total_interval_seconds;
        }

        if !progress.is_complete() {
            return;
        }

        match self.phase {
            LifecyclePhase::SessionActive => {
                self.phase = LifecyclePhase::SessionEnded;
                self.request_end_report(effects);
            }
            LifecyclePhase::SessionEnded if self.end_report == Pending::Idle => {
                self.request_end_report(effects);
            }
            _ => {}
        }
    }

    fn request_end_report(&mut self, effects: &mut Vec<Effect>) {
        self.end_report = Pending::InFlight;
        effects.push(Effect::ReportSessionEnd {
            generation: self.report_generation,
        });
    }

    /// The backend started over: forget the previous run's progress and
    /// end-report state.
    fn begin_new_session(&mut self, effects: &mut Vec<Effect>) {
        self.progress = None;
        self.end_report = Pending::Idle;
        self.report_generation += 1;
        effects.push(Effect::ClearSessionEndedFlag);
        if self.phase == LifecyclePhase::SessionEnded {
            self.phase = LifecyclePhase::SessionActive;
        }
    }
}
