//! Read-only data shown next to the video: patient card, posture metrics,
//! posture analysis and the timeline. Feeds follow the session the
//! coordinator currently tracks and never influence the lifecycle.

mod views;

pub use views::{highest_posture, risk_level, session_percent, RiskLevel};

use std::{sync::Arc, time::Duration};

use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    api::DisplayApi,
    launch::DeviceId,
    lifecycle::CoordinatorSnapshot,
    models::{Patient, PostureAnalysis, PostureMetrics, TimelineEntry},
    poller::{self, PollSpec, Subscription},
    settings::PollIntervals,
};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info};

#[derive(Debug, Clone, Default)]
pub struct DisplayState {
    pub patient: Option<Patient>,
    pub metrics: Option<PostureMetrics>,
    pub analysis: Option<PostureAnalysis>,
    pub timeline: Vec<TimelineEntry>,
}

impl DisplayState {
    pub fn risk(&self) -> Option<RiskLevel> {
        self.metrics.as_ref().map(risk_level)
    }

    pub fn dominant_posture(&self) -> Option<(&str, f64)> {
        self.analysis.as_ref().and_then(highest_posture)
    }
}

pub struct DisplayBoard {
    state: watch::Receiver<DisplayState>,
    handle: JoinHandle<()>,
}

impl DisplayBoard {
    pub fn state(&self) -> DisplayState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DisplayState> {
        self.state.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

struct SessionFeeds {
    _metrics: Subscription<PostureMetrics>,
    _analysis: Subscription<PostureAnalysis>,
    _timeline: Subscription<Vec<TimelineEntry>>,
}

struct FeedContext<D> {
    api: Arc<D>,
    state: Arc<watch::Sender<DisplayState>>,
    poll: PollIntervals,
    timeout: Duration,
}

impl<D: DisplayApi> FeedContext<D> {
    fn spec(&self, name: &'static str, interval_ms: u64) -> PollSpec {
        PollSpec::new(name, Duration::from_millis(interval_ms), self.timeout)
    }

    fn patient(&self, token: &CancellationToken, device: DeviceId) -> Subscription<Patient> {
        let api = self.api.clone();
        let state = self.state.clone();
        poller::start(
            self.spec("patient", self.poll.patient_ms),
            token,
            move || {
                let api = api.clone();
                let device = device.clone();
                async move { api.patient(&device).await }
            },
            move |patient: &Patient| {
                state.send_modify(|s| s.patient = Some(patient.clone()));
            },
        )
    }

    fn session(&self, token: &CancellationToken, session_id: &str) -> SessionFeeds {
        let id = session_id.to_string();

        let (api, state, sid) = (self.api.clone(), self.state.clone(), id.clone());
        let metrics = poller::start(
            self.spec("posture-metrics", self.poll.metrics_ms),
            token,
            move || {
                let (api, sid) = (api.clone(), sid.clone());
                async move { api.posture_metrics(&sid).await }
            },
            move |metrics: &PostureMetrics| {
                state.send_modify(|s| s.metrics = Some(metrics.clone()));
            },
        );

        let (api, state, sid) = (self.api.clone(), self.state.clone(), id.clone());
        let analysis = poller::start(
            self.spec("posture-analysis", self.poll.metrics_ms),
            token,
            move || {
                let (api, sid) = (api.clone(), sid.clone());
                async move { api.posture_analysis(&sid).await }
            },
            move |analysis: &PostureAnalysis| {
                state.send_modify(|s| s.analysis = Some(analysis.clone()));
            },
        );

        let (api, state) = (self.api.clone(), self.state.clone());
        let timeline = poller::start(
            self.spec("timeline", self.poll.timeline_ms),
            token,
            move || {
                let (api, sid) = (api.clone(), id.clone());
                async move { api.timeline(&sid).await }
            },
            move |entries: &Vec<TimelineEntry>| {
                state.send_modify(|s| s.timeline = entries.clone());
            },
        );

        SessionFeeds {
            _metrics: metrics,
            _analysis: analysis,
            _timeline: timeline,
        }
    }
}

/// Starts the patient feed and follows `snapshots` to (re)start the
/// per-session feeds whenever the tracked session id changes.
pub fn spawn<D: DisplayApi>(
    api: Arc<D>,
    device: Option<DeviceId>,
    poll: PollIntervals,
    timeout: Duration,
    mut snapshots: watch::Receiver<CoordinatorSnapshot>,
    parent: &CancellationToken,
) -> DisplayBoard {
    let (state_tx, state_rx) = watch::channel(DisplayState::default());
    let ctx = FeedContext {
        api,
        state: Arc::new(state_tx),
        poll,
        timeout,
    };
    let token = parent.child_token();

    let handle = tokio::spawn(async move {
        let _patient = device.map(|device| ctx.patient(&token, device));
        let mut current: Option<String> = None;
        let mut feeds: Option<SessionFeeds> = None;

        loop {
            let session_id = snapshots
                .borrow_and_update()
                .session
                .as_ref()
                .map(|session| session.id.clone());

            if session_id != current {
                feeds.take();
                ctx.state.send_modify(|s| {
                    s.metrics = None;
                    s.analysis = None;
                    s.timeline.clear();
                });
                if let Some(id) = &session_id {
                    log_info!("display feeds following session {id}");
                    feeds = Some(ctx.session(&token, id));
                }
                current = session_id;
            }

            tokio::select! {
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = token.cancelled() => break,
            }
        }

        log_debug!("display board stopped");
    });

    DisplayBoard {
        state: state_rx,
        handle,
    }
}
