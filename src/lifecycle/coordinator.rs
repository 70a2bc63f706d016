//! The actor that owns the lifecycle.
//!
//! Pollers, the video relay and effect executions all report back through a
//! single inbox; the actor applies one message at a time, so lifecycle state
//! is never touched concurrently. Every phase gets a fresh set of pollers
//! under its own cancellation token and an epoch number. Poll results tagged
//! with an older epoch are dropped on arrival.
//!
//! The video relay is not tied to an epoch. It stays connected for as long as
//! the phase wants video, so moving between calibration and finalizing or
//! picking up a new session id does not reconnect it.

use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use serde::Serialize;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    api::BackendApi,
    calibration::{CalibrationTracker, CalibrationView},
    flags::FlagStore,
    launch::{DeviceId, LaunchContext},
    models::{CalibrationSample, Session, SessionProgress},
    poller::{self, PollSpec, Subscription},
    relay::{self, ControlEnvelope, FrameSlot, RelayHandle, RelaySpec},
    settings::{ClientSettings, Endpoints, PollIntervals},
};

use super::{
    effects,
    phase::{Effect, Event, Lifecycle, LifecyclePhase},
};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub device: Option<DeviceId>,
    /// Session id given at launch. When set, the latest-session lookup is
    /// not used to discover sessions.
    pub pinned_session: Option<String>,
    pub force_calibration: bool,
    /// `None` disables the video relay.
    pub stream_url: Option<Url>,
    pub poll: PollIntervals,
    pub request_timeout: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub calibration_target_secs: f64,
}

impl CoordinatorConfig {
    pub fn new(settings: &ClientSettings, launch: &LaunchContext, endpoints: &Endpoints) -> Self {
        Self {
            device: launch.device_id.clone(),
            pinned_session: launch.session_id.clone(),
            force_calibration: launch.force_calibration,
            stream_url: endpoints.stream.clone(),
            poll: settings.poll.clone(),
            request_timeout: settings.request_timeout(),
            reconnect_initial: Duration::from_millis(settings.reconnect_initial_ms),
            reconnect_max: Duration::from_millis(settings.reconnect_max_ms),
            calibration_target_secs: settings.calibration_target_secs,
        }
    }
}

/// What a presentation layer needs to render the current state.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorSnapshot {
    pub phase: LifecyclePhase,
    pub device_id: Option<DeviceId>,
    pub session: Option<Session>,
    pub progress: Option<SessionProgress>,
    pub calibration: CalibrationView,
    /// Last user-facing failure, cleared by the next restart request.
    pub alert: Option<String>,
    pub loading: bool,
    /// Calibration was saved; the device has to be restarted before a
    /// session can be monitored.
    pub device_restart_required: bool,
}

#[derive(Debug)]
enum Signal {
    Session(Session),
    Progress(SessionProgress),
    Calibration(CalibrationSample),
}

#[derive(Debug)]
enum Command {
    Restart,
    Proceed,
}

#[derive(Debug)]
enum Inbound {
    Signal { epoch: u64, signal: Signal },
    Control(ControlEnvelope),
    EffectDone(Event),
    Command(Command),
}

/// Cloneable front end to a running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    inbox: mpsc::UnboundedSender<Inbound>,
    snapshot: watch::Receiver<CoordinatorSnapshot>,
    frames: FrameSlot,
    cancel: CancellationToken,
}

impl CoordinatorHandle {
    pub fn request_restart(&self) -> Result<()> {
        self.send(Command::Restart)
    }

    /// Leaves calibration without waiting for the mode switch to succeed.
    pub fn proceed(&self) -> Result<()> {
        self.send(Command::Proceed)
    }

    /// Cancels every poller, closes the relay and stops the actor.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn snapshot(&self) -> CoordinatorSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CoordinatorSnapshot> {
        self.snapshot.clone()
    }

    pub fn frames(&self) -> &FrameSlot {
        &self.frames
    }

    fn send(&self, command: Command) -> Result<()> {
        self.inbox
            .send(Inbound::Command(command))
            .map_err(|_| anyhow!("coordinator is not running"))
    }
}

/// Pollers of one phase. Dropping the struct stops all of them.
struct PhaseTasks {
    token: CancellationToken,
    sessions: Option<Subscription<Option<Session>>>,
    progress: Option<Subscription<SessionProgress>>,
    calibration: Option<Subscription<CalibrationSample>>,
}

impl PhaseTasks {
    fn new(token: CancellationToken) -> Self {
        Self {
            token,
            sessions: None,
            progress: None,
            calibration: None,
        }
    }

    fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(sub) = &self.sessions {
            parts.push(sub.name());
        }
        if let Some(sub) = &self.progress {
            parts.push(sub.name());
        }
        if let Some(sub) = &self.calibration {
            parts.push(sub.name());
        }
        if parts.is_empty() {
            "none".to_string()
        } else {
            parts.join(", ")
        }
    }
}

impl Drop for PhaseTasks {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

pub struct Coordinator<A> {
    config: CoordinatorConfig,
    api: Arc<A>,
    lifecycle: Lifecycle,
    tracker: CalibrationTracker,
    frames: FrameSlot,
    inbox: mpsc::UnboundedSender<Inbound>,
    effects: Option<mpsc::UnboundedSender<Effect>>,
    cancel: CancellationToken,
    epoch: u64,
    wiring: Option<(LifecyclePhase, Option<String>)>,
    tasks: Option<PhaseTasks>,
    relay: Option<RelayHandle>,
    alert: Option<String>,
    snapshot: watch::Sender<CoordinatorSnapshot>,
}

impl<A: BackendApi> Coordinator<A> {
    /// Starts the actor and, when a device is known, its effect worker. Both
    /// stop when `parent` is cancelled or [`CoordinatorHandle::shutdown`] is
    /// called.
    pub fn spawn<F: FlagStore>(
        config: CoordinatorConfig,
        api: Arc<A>,
        flags: Arc<F>,
        parent: &CancellationToken,
    ) -> (CoordinatorHandle, JoinHandle<()>) {
        let cancel = parent.child_token();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let frames = FrameSlot::new();

        let effects = config.device.clone().map(|device| {
            spawn_effect_worker(device, api.clone(), flags, inbox_tx.clone(), cancel.clone())
        });

        let initial = CoordinatorSnapshot {
            device_id: config.device.clone(),
            loading: true,
            ..Default::default()
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);

        let coordinator = Coordinator {
            lifecycle: Lifecycle::new(config.force_calibration),
            tracker: CalibrationTracker::new(config.calibration_target_secs),
            config,
            api,
            frames: frames.clone(),
            inbox: inbox_tx.clone(),
            effects,
            cancel: cancel.clone(),
            epoch: 0,
            wiring: None,
            tasks: None,
            relay: None,
            alert: None,
            snapshot: snapshot_tx,
        };

        let handle = CoordinatorHandle {
            inbox: inbox_tx,
            snapshot: snapshot_rx,
            frames,
            cancel,
        };
        let join = tokio::spawn(coordinator.run(inbox_rx));
        (handle, join)
    }

    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Inbound>) {
        match self.config.device.clone() {
            Some(device) => {
                log_info!("coordinator started for device {device}");
                if let Some(id) = self.config.pinned_session.clone() {
                    self.apply(Event::SessionResolved(Session::pinned(id)));
                }
                self.dispatch(Effect::LoadFlags);
            }
            None => log_warn!("launch context has no device id; staying idle"),
        }
        self.publish();

        loop {
            let message = tokio::select! {
                message = inbox.recv() => message,
                _ = self.cancel.cancelled() => break,
            };
            let Some(message) = message else { break };

            match message {
                Inbound::Signal { epoch, signal } => {
                    if epoch != self.epoch {
                        log_debug!("dropping stale signal from epoch {epoch}: {signal:?}");
                        continue;
                    }
                    self.on_signal(signal);
                }
                Inbound::Control(envelope) => self.on_control(envelope),
                Inbound::EffectDone(event) => self.apply(event),
                Inbound::Command(command) => self.on_command(command),
            }

            self.rewire();
            self.publish();
        }

        self.tasks.take();
        self.relay.take();
        log_info!("coordinator stopped");
    }

    fn on_signal(&mut self, signal: Signal) {
        match signal {
            Signal::Session(session) => self.apply(Event::SessionResolved(session)),
            Signal::Progress(progress) => self.apply(Event::ProgressObserved(progress)),
            Signal::Calibration(sample) => {
                if !matches!(
                    self.lifecycle.phase(),
                    LifecyclePhase::Calibrating | LifecyclePhase::Finalizing
                ) {
                    return;
                }
                let completed = self.tracker.observe(sample);
                self.apply(Event::CalibrationProgress {
                    percentage: self.tracker.percentage(),
                    completed,
                });
            }
        }
    }

    fn on_control(&mut self, envelope: ControlEnvelope) {
        if envelope.restarts_calibration() {
            log_info!("device requested calibration restart");
            self.apply(Event::CalibrationRestart);
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Restart => {
                self.alert = None;
                self.apply(Event::RestartRequested);
            }
            Command::Proceed => self.apply(Event::UserProceeded),
        }
    }

    fn apply(&mut self, event: Event) {
        let step = self.lifecycle.apply(event);
        if step.changed() {
            log_info!("phase {} -> {}", step.from.as_str(), step.to.as_str());
        }

        for effect in step.effects {
            match effect {
                Effect::ResetCalibration => self.tracker.reset(),
                Effect::Alert(message) => {
                    log_warn!("{message}");
                    self.alert = Some(message);
                }
                other => self.dispatch(other),
            }
        }
    }

    fn dispatch(&self, effect: Effect) {
        match &self.effects {
            Some(worker) => {
                if worker.send(effect).is_err() {
                    log_warn!("effect worker has stopped");
                }
            }
            None => log_debug!("no device; dropping {effect:?}"),
        }
    }

    /// Replaces the pollers when the phase or the session id changed, and
    /// opens or closes the relay when the phase starts or stops wanting video.
    fn rewire(&mut self) {
        let Some(device) = self.config.device.clone() else {
            return;
        };
        let phase = self.lifecycle.phase();
        self.sync_relay(phase, &device);

        let session_id = self.lifecycle.session().map(|session| session.id.clone());
        let key = (phase, session_id.clone());
        if self.wiring.as_ref() == Some(&key) {
            return;
        }

        // stop the old set before the epoch moves on
        self.tasks.take();
        self.epoch += 1;
        self.wiring = Some(key);

        let mut tasks = PhaseTasks::new(self.cancel.child_token());
        let discover = session_id.is_none() || self.config.pinned_session.is_none();

        match phase {
            LifecyclePhase::AwaitingCalibration => {}
            LifecyclePhase::Calibrating | LifecyclePhase::Finalizing => {
                match &session_id {
                    Some(id) => tasks.calibration = Some(self.poll_calibration(&tasks.token, id)),
                    None => tasks.sessions = Some(self.poll_sessions(&tasks.token)),
                }
            }
            LifecyclePhase::SessionActive | LifecyclePhase::SessionEnded => {
                if discover {
                    tasks.sessions = Some(self.poll_sessions(&tasks.token));
                }
                if let Some(id) = &session_id {
                    tasks.progress = Some(self.poll_progress(&tasks.token, id));
                }
            }
        }

        log_info!(
            "{} (epoch {}): polling {}, video {}",
            phase.as_str(),
            self.epoch,
            tasks.describe(),
            if self.relay.is_some() { "on" } else { "off" }
        );
        self.tasks = Some(tasks);
    }

    fn poll_sessions(&self, token: &CancellationToken) -> Subscription<Option<Session>> {
        let api = self.api.clone();
        let inbox = self.inbox.clone();
        let epoch = self.epoch;
        poller::start(
            self.spec("session-lookup", self.config.poll.session_lookup_ms),
            token,
            move || {
                let api = api.clone();
                async move { api.latest_session().await }
            },
            move |latest: &Option<Session>| {
                if let Some(session) = latest {
                    let _ = inbox.send(Inbound::Signal {
                        epoch,
                        signal: Signal::Session(session.clone()),
                    });
                }
            },
        )
    }

    fn poll_progress(&self, token: &CancellationToken, session_id: &str) -> Subscription<SessionProgress> {
        let api = self.api.clone();
        let inbox = self.inbox.clone();
        let epoch = self.epoch;
        let session_id = session_id.to_string();
        poller::start(
            self.spec("session-progress", self.config.poll.progress_ms),
            token,
            move || {
                let api = api.clone();
                let session_id = session_id.clone();
                async move { api.session_progress(&session_id).await }
            },
            move |progress: &SessionProgress| {
                let _ = inbox.send(Inbound::Signal {
                    epoch,
                    signal: Signal::Progress(*progress),
                });
            },
        )
    }

    fn poll_calibration(
        &self,
        token: &CancellationToken,
        session_id: &str,
    ) -> Subscription<CalibrationSample> {
        let api = self.api.clone();
        let inbox = self.inbox.clone();
        let epoch = self.epoch;
        let session_id = session_id.to_string();
        poller::start(
            self.spec("calibration-progress", self.config.poll.calibration_ms),
            token,
            move || {
                let api = api.clone();
                let session_id = session_id.clone();
                async move { api.calibration_progress(&session_id).await }
            },
            move |sample: &CalibrationSample| {
                let _ = inbox.send(Inbound::Signal {
                    epoch,
                    signal: Signal::Calibration(*sample),
                });
            },
        )
    }

    fn sync_relay(&mut self, phase: LifecyclePhase, device: &DeviceId) {
        let wanted = matches!(
            phase,
            LifecyclePhase::Calibrating | LifecyclePhase::Finalizing | LifecyclePhase::SessionActive
        );
        match (wanted, self.relay.is_some()) {
            (true, false) => self.relay = self.open_relay(device),
            (false, true) => {
                log_debug!("closing video relay in {}", phase.as_str());
                self.relay.take();
            }
            _ => {}
        }
    }

    fn open_relay(&self, device: &DeviceId) -> Option<RelayHandle> {
        let stream_url = self.config.stream_url.clone()?;
        let inbox = self.inbox.clone();
        let spec = RelaySpec {
            stream_url,
            device: Some(device.clone()),
            reconnect_initial: self.config.reconnect_initial,
            reconnect_max: self.config.reconnect_max,
        };
        Some(relay::spawn(spec, &self.cancel, self.frames.clone(), move |envelope| {
            let _ = inbox.send(Inbound::Control(envelope));
        }))
    }

    fn spec(&self, name: &'static str, interval_ms: u64) -> PollSpec {
        PollSpec::new(
            name,
            Duration::from_millis(interval_ms),
            self.config.request_timeout,
        )
    }

    fn publish(&self) {
        let phase = self.lifecycle.phase();
        let session = self.lifecycle.session().cloned();
        let loading = self.config.device.is_none()
            || phase == LifecyclePhase::AwaitingCalibration
            || session.is_none();

        let snapshot = CoordinatorSnapshot {
            phase,
            device_id: self.config.device.clone(),
            session,
            progress: self.lifecycle.progress(),
            calibration: self.tracker.view(),
            alert: self.alert.clone(),
            loading,
            device_restart_required: self.lifecycle.device_restart_required(),
        };
        self.snapshot.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

/// Effects run one at a time, in the order the lifecycle produced them, so a
/// flag write always lands before the next effect reads it.
fn spawn_effect_worker<A, F>(
    device: DeviceId,
    api: Arc<A>,
    flags: Arc<F>,
    inbox: mpsc::UnboundedSender<Inbound>,
    cancel: CancellationToken,
) -> mpsc::UnboundedSender<Effect>
where
    A: BackendApi,
    F: FlagStore,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Effect>();

    tokio::spawn(async move {
        loop {
            let effect = tokio::select! {
                effect = rx.recv() => effect,
                _ = cancel.cancelled() => break,
            };
            let Some(effect) = effect else { break };

            log_debug!("running {effect:?}");
            if let Some(event) = effects::execute(&*api, &*flags, &device, effect).await {
                if inbox.send(Inbound::EffectDone(event)).is_err() {
                    break;
                }
            }
        }
        log_debug!("effect worker stopped");
    });

    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        flags::{Flag, MemoryFlagStore},
        models::RestartResponse,
        testing::{serve_video, MockBackend},
    };
    use futures_util::{SinkExt, StreamExt};
    use std::sync::atomic::Ordering;
    use tokio::sync::Notify;
    use tokio_tungstenite::tungstenite::Message;

    fn config(device: Option<&str>, force_calibration: bool) -> CoordinatorConfig {
        CoordinatorConfig {
            device: device.map(DeviceId::new),
            pinned_session: None,
            force_calibration,
            stream_url: None,
            poll: PollIntervals::default(),
            request_timeout: Duration::from_secs(5),
            reconnect_initial: Duration::from_millis(100),
            reconnect_max: Duration::from_secs(1),
            calibration_target_secs: 10.0,
        }
    }

    async fn wait_for(
        handle: &CoordinatorHandle,
        what: &str,
        predicate: impl Fn(&CoordinatorSnapshot) -> bool,
    ) -> CoordinatorSnapshot {
        let mut rx = handle.subscribe();
        let found = tokio::time::timeout(Duration::from_secs(120), async {
            loop {
                {
                    let current = rx.borrow_and_update();
                    if predicate(&current) {
                        return current.clone();
                    }
                }
                if rx.changed().await.is_err() {
                    panic!("coordinator stopped while waiting for {what}");
                }
            }
        })
        .await;
        match found {
            Ok(snapshot) => snapshot,
            Err(_) => panic!("timed out waiting for {what}: {:?}", handle.snapshot()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn restart_clears_marker_and_progress() {
        let device = DeviceId::new("d1");
        let api = Arc::new(MockBackend::with_session("s1", 60.0));
        api.set_progress(60.0, 60.0);
        let flags = Arc::new(MemoryFlagStore::new());
        flags.set(&device, Flag::Calibrated).await.unwrap();
        flags.set(&device, Flag::SessionEndedReported).await.unwrap();

        let root = CancellationToken::new();
        let (handle, _join) =
            Coordinator::spawn(config(Some("d1"), false), api.clone(), flags.clone(), &root);

        wait_for(&handle, "session end", |s| s.phase == LifecyclePhase::SessionEnded).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        // marker already persisted: recovered without a second report
        assert_eq!(api.end_reports.load(Ordering::SeqCst), 0);

        api.clear_progress();
        handle.request_restart().unwrap();
        let snapshot =
            wait_for(&handle, "restart", |s| s.phase == LifecyclePhase::SessionActive).await;
        assert!(snapshot.progress.is_none());
        assert_eq!(snapshot.session.map(|s| s.id), Some("s1".to_string()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(api.restarts.load(Ordering::SeqCst), 1);
        assert!(!flags.get(&device, Flag::SessionEndedReported).await.unwrap());
        root.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_restart_raises_alert() {
        let api = Arc::new(MockBackend::with_session("s1", 30.0));
        api.set_progress(30.0, 30.0);
        api.set_restart(Some(RestartResponse {
            ok: false,
            message: Some("busy".into()),
        }));
        let flags = Arc::new(MemoryFlagStore::new());
        flags
            .set(&DeviceId::new("d1"), Flag::Calibrated)
            .await
            .unwrap();

        let root = CancellationToken::new();
        let (handle, _join) = Coordinator::spawn(config(Some("d1"), false), api, flags, &root);

        wait_for(&handle, "session end", |s| s.phase == LifecyclePhase::SessionEnded).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.request_restart().unwrap();

        let snapshot = wait_for(&handle, "alert", |s| s.alert.is_some()).await;
        assert_eq!(snapshot.alert.as_deref(), Some("session restart failed: busy"));
        assert_eq!(snapshot.phase, LifecyclePhase::SessionEnded);
        root.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn force_override_recalibrates_then_waits_for_device_restart() {
        let device = DeviceId::new("d1");
        let api = Arc::new(MockBackend::with_session("s1", 60.0));
        api.set_progress(10.0, 60.0);
        let flags = Arc::new(MemoryFlagStore::new());
        flags.set(&device, Flag::Calibrated).await.unwrap();

        let root = CancellationToken::new();
        let (handle, _join) =
            Coordinator::spawn(config(Some("d1"), true), api.clone(), flags.clone(), &root);

        let snapshot =
            wait_for(&handle, "calibration", |s| s.phase == LifecyclePhase::Calibrating).await;
        assert_eq!(snapshot.calibration.percentage, 0.0);

        api.set_calibration(10.0, true);
        let snapshot = wait_for(&handle, "device restart", |s| s.device_restart_required).await;
        assert_eq!(snapshot.phase, LifecyclePhase::AwaitingCalibration);
        assert!(snapshot.loading);
        assert_eq!(api.mode_switches.load(Ordering::SeqCst), 1);
        assert!(flags.get(&device, Flag::Calibrated).await.unwrap());

        // nothing moves until the device is restarted and the client relaunched
        let calibration_calls = api.calibration_calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(10)).await;
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.phase, LifecyclePhase::AwaitingCalibration);
        assert!(snapshot.device_restart_required);
        assert_eq!(api.progress_calls.load(Ordering::SeqCst), 0);
        assert_eq!(api.calibration_calls.load(Ordering::SeqCst), calibration_calls);
        root.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn finalizes_on_the_sample_that_reaches_the_target() {
        let api = Arc::new(MockBackend::with_session("s1", 60.0));
        api.push_calibration_samples(&[(9.0, true), (10.0, true), (10.0, true)]);
        let flags = Arc::new(MemoryFlagStore::new());

        let root = CancellationToken::new();
        let (handle, _join) = Coordinator::spawn(config(Some("d1"), false), api.clone(), flags, &root);

        let snapshot = wait_for(&handle, "90%", |s| {
            (s.calibration.percentage - 90.0).abs() < 1e-9
        })
        .await;
        assert_eq!(snapshot.phase, LifecyclePhase::Calibrating);
        assert_eq!(api.mode_switches.load(Ordering::SeqCst), 0);

        wait_for(&handle, "device restart", |s| s.device_restart_required).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(api.mode_switches.load(Ordering::SeqCst), 1);
        assert_eq!(api.calibration_calls_at_switch.load(Ordering::SeqCst), 2);
        root.cancel();
    }

    #[tokio::test]
    async fn mode_envelope_restarts_calibration_on_the_same_socket() {
        let send_envelope = Arc::new(Notify::new());
        let trigger = send_envelope.clone();
        let (url, mut connections) = serve_video(move |_, mut socket| {
            let trigger = trigger.clone();
            async move {
                trigger.notified().await;
                let envelope = Message::text(r#"{"type":"modo","calibracion":true}"#);
                if socket.send(envelope).await.is_err() {
                    return;
                }
                while let Some(Ok(_)) = socket.next().await {}
            }
        })
        .await;

        let api = Arc::new(MockBackend::with_session("s1", 60.0));
        api.fail_mode_switch.store(true, Ordering::SeqCst);
        api.set_calibration(10.0, true);
        let flags = Arc::new(MemoryFlagStore::new());

        let mut config = config(Some("d1"), false);
        config.stream_url = Some(url);
        config.poll = PollIntervals {
            progress_ms: 20,
            calibration_ms: 20,
            session_lookup_ms: 20,
            ..PollIntervals::default()
        };

        let root = CancellationToken::new();
        let (handle, _join) = Coordinator::spawn(config, api.clone(), flags, &root);

        wait_for(&handle, "finalizing", |s| s.phase == LifecyclePhase::Finalizing).await;
        let first = tokio::time::timeout(Duration::from_secs(5), connections.recv()).await;
        assert_eq!(first.ok().flatten(), Some(1));

        // device left the frame; without the envelope the phase holds
        api.set_calibration(0.0, false);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handle.snapshot().phase, LifecyclePhase::Finalizing);

        send_envelope.notify_one();
        wait_for(&handle, "calibration restart", |s| {
            s.phase == LifecyclePhase::Calibrating
        })
        .await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.phase, LifecyclePhase::Calibrating);
        assert_eq!(snapshot.calibration.percentage, 0.0);
        assert!(api.mode_switches.load(Ordering::SeqCst) >= 1);
        // the socket opened in calibration survived both phase changes
        assert!(connections.try_recv().is_err());
        root.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn session_end_is_reported_once() {
        let device = DeviceId::new("d1");
        let api = Arc::new(MockBackend::with_session("s1", 60.0));
        api.set_progress(75.0, 60.0);
        let flags = Arc::new(MemoryFlagStore::new());
        flags.set(&device, Flag::Calibrated).await.unwrap();

        let root = CancellationToken::new();
        let (handle, _join) =
            Coordinator::spawn(config(Some("d1"), false), api.clone(), flags.clone(), &root);

        wait_for(&handle, "session end", |s| s.phase == LifecyclePhase::SessionEnded).await;
        // keep polling the finished session for a while
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(api.end_reports.load(Ordering::SeqCst), 1);
        assert!(api.progress_calls.load(Ordering::SeqCst) > 5);
        assert!(flags.get(&device, Flag::SessionEndedReported).await.unwrap());
        assert!(!flags.get(&device, Flag::Calibrated).await.unwrap());
        assert_eq!(handle.snapshot().phase, LifecyclePhase::SessionEnded);
        root.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn missing_device_stays_loading() {
        let api = Arc::new(MockBackend::with_session("s1", 60.0));
        api.set_progress(10.0, 60.0);
        let flags = Arc::new(MemoryFlagStore::new());

        let root = CancellationToken::new();
        let (handle, _join) = Coordinator::spawn(config(None, false), api.clone(), flags, &root);

        tokio::time::sleep(Duration::from_secs(10)).await;
        let snapshot = handle.snapshot();
        assert!(snapshot.loading);
        assert_eq!(snapshot.phase, LifecyclePhase::AwaitingCalibration);
        assert_eq!(api.progress_calls.load(Ordering::SeqCst), 0);
        root.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_polling() {
        let api = Arc::new(MockBackend::with_session("s1", 600.0));
        api.set_progress(10.0, 600.0);
        let flags = Arc::new(MemoryFlagStore::new());
        flags
            .set(&DeviceId::new("d1"), Flag::Calibrated)
            .await
            .unwrap();

        let root = CancellationToken::new();
        let (handle, join) =
            Coordinator::spawn(config(Some("d1"), false), api.clone(), flags, &root);
        wait_for(&handle, "progress", |s| s.progress.is_some()).await;

        handle.shutdown();
        join.await.unwrap();
        let calls = api.progress_calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(api.progress_calls.load(Ordering::SeqCst), calls);
    }
}
