//! In-process backend double for lifecycle tests, and a local video
//! endpoint for relay tests.

use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
};

use anyhow::{anyhow, Result};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_tungstenite::WebSocketStream;
use url::Url;

use crate::{
    api::{BackendApi, DisplayApi},
    launch::DeviceId,
    models::{
        CalibrationSample, Patient, PostureAnalysis, PostureMetrics, RestartResponse, Session,
        SessionProgress, TimelineEntry,
    },
};

/// Scripted responses. `None` progress/calibration/restart means the call
/// fails, like an unreachable backend; so does a display endpoint with no
/// entry for the requested session.
pub struct MockBackend {
    sessions: Mutex<Vec<Session>>,
    progress: Mutex<Option<SessionProgress>>,
    calibration: Mutex<Option<CalibrationSample>>,
    calibration_script: Mutex<VecDeque<CalibrationSample>>,
    restart: Mutex<Option<RestartResponse>>,
    pub fail_end_report: AtomicBool,
    pub fail_mode_switch: AtomicBool,
    pub end_reports: AtomicUsize,
    pub restarts: AtomicUsize,
    pub mode_switches: AtomicUsize,
    pub progress_calls: AtomicUsize,
    pub calibration_calls: AtomicUsize,
    /// `calibration_calls` seen by the most recent mode switch.
    pub calibration_calls_at_switch: AtomicUsize,
    patient: Mutex<Option<Patient>>,
    metrics: Mutex<HashMap<String, PostureMetrics>>,
    analyses: Mutex<HashMap<String, PostureAnalysis>>,
    timelines: Mutex<HashMap<String, Vec<TimelineEntry>>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            sessions: Mutex::new(Vec::new()),
            progress: Mutex::new(None),
            calibration: Mutex::new(None),
            calibration_script: Mutex::new(VecDeque::new()),
            restart: Mutex::new(Some(RestartResponse {
                ok: true,
                message: None,
            })),
            fail_end_report: AtomicBool::new(false),
            fail_mode_switch: AtomicBool::new(false),
            end_reports: AtomicUsize::new(0),
            restarts: AtomicUsize::new(0),
            mode_switches: AtomicUsize::new(0),
            progress_calls: AtomicUsize::new(0),
            calibration_calls: AtomicUsize::new(0),
            calibration_calls_at_switch: AtomicUsize::new(0),
            patient: Mutex::new(None),
            metrics: Mutex::new(HashMap::new()),
            analyses: Mutex::new(HashMap::new()),
            timelines: Mutex::new(HashMap::new()),
        }
    }
}

impl MockBackend {
    pub fn with_session(id: &str, total: f64) -> Self {
        let backend = Self::default();
        backend.sessions.lock().unwrap().push(Session {
            id: id.to_string(),
            total_interval_seconds: total,
            mode: "monitoreo".to_string(),
            elapsed_seconds: 0.0,
        });
        backend
    }

    pub fn set_progress(&self, elapsed: f64, total: f64) {
        *self.progress.lock().unwrap() = Some(SessionProgress {
            elapsed,
            total_interval_seconds: total,
        });
    }

    pub fn clear_progress(&self) {
        *self.progress.lock().unwrap() = None;
    }

    pub fn set_calibration(&self, good_time: f64, correct: bool) {
        *self.calibration.lock().unwrap() = Some(CalibrationSample::new(good_time, correct));
    }

    /// Queues samples answered one per call, before the fixed sample set
    /// with [`set_calibration`](Self::set_calibration). The last one keeps
    /// being answered once the queue runs dry.
    pub fn push_calibration_samples(&self, samples: &[(f64, bool)]) {
        let mut script = self.calibration_script.lock().unwrap();
        script.extend(
            samples
                .iter()
                .map(|&(good_time, correct)| CalibrationSample::new(good_time, correct)),
        );
    }

    pub fn set_patient(&self, patient: Patient) {
        *self.patient.lock().unwrap() = Some(patient);
    }

    pub fn set_metrics(&self, session_id: &str, metrics: Option<PostureMetrics>) {
        let mut map = self.metrics.lock().unwrap();
        match metrics {
            Some(metrics) => map.insert(session_id.to_string(), metrics),
            None => map.remove(session_id),
        };
    }

    pub fn set_analysis(&self, session_id: &str, analysis: PostureAnalysis) {
        self.analyses
            .lock()
            .unwrap()
            .insert(session_id.to_string(), analysis);
    }

    pub fn set_timeline(&self, session_id: &str, entries: Vec<TimelineEntry>) {
        self.timelines
            .lock()
            .unwrap()
            .insert(session_id.to_string(), entries);
    }

    pub fn set_restart(&self, response: Option<RestartResponse>) {
        *self.restart.lock().unwrap() = response;
    }
}

impl BackendApi for MockBackend {
    async fn latest_session(&self) -> Result<Option<Session>> {
        Ok(self.sessions.lock().unwrap().last().cloned())
    }

    async fn session_progress(&self, _session_id: &str) -> Result<SessionProgress> {
        self.progress_calls.fetch_add(1, Ordering::SeqCst);
        let progress = *self.progress.lock().unwrap();
        progress.ok_or_else(|| anyhow!("progress unavailable"))
    }

    async fn report_session_end(&self, _device: &DeviceId) -> Result<()> {
        if self.fail_end_report.load(Ordering::SeqCst) {
            return Err(anyhow!("end report rejected"));
        }
        self.end_reports.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn restart_session(&self, _session_id: &str, _device: &DeviceId) -> Result<RestartResponse> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        let response = self.restart.lock().unwrap().clone();
        response.ok_or_else(|| anyhow!("connection refused"))
    }

    async fn calibration_progress(&self, _session_id: &str) -> Result<CalibrationSample> {
        self.calibration_calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.calibration_script.lock().unwrap();
        if let Some(sample) = script.pop_front() {
            if script.is_empty() {
                *self.calibration.lock().unwrap() = Some(sample);
            }
            return Ok(sample);
        }
        let sample = *self.calibration.lock().unwrap();
        sample.ok_or_else(|| anyhow!("calibration unavailable"))
    }

    async fn switch_to_normal_mode(&self, _device: &DeviceId) -> Result<()> {
        self.mode_switches.fetch_add(1, Ordering::SeqCst);
        self.calibration_calls_at_switch
            .store(self.calibration_calls.load(Ordering::SeqCst), Ordering::SeqCst);
        if self.fail_mode_switch.load(Ordering::SeqCst) {
            return Err(anyhow!("device unreachable"));
        }
        Ok(())
    }
}

impl DisplayApi for MockBackend {
    async fn patient(&self, _device: &DeviceId) -> Result<Patient> {
        let patient = self.patient.lock().unwrap().clone();
        patient.ok_or_else(|| anyhow!("patient not found"))
    }

    async fn posture_metrics(&self, session_id: &str) -> Result<PostureMetrics> {
        let metrics = self.metrics.lock().unwrap().get(session_id).cloned();
        metrics.ok_or_else(|| anyhow!("no metrics for {session_id}"))
    }

    async fn posture_analysis(&self, session_id: &str) -> Result<PostureAnalysis> {
        let analysis = self.analyses.lock().unwrap().get(session_id).cloned();
        analysis.ok_or_else(|| anyhow!("no analysis for {session_id}"))
    }

    async fn timeline(&self, session_id: &str) -> Result<Vec<TimelineEntry>> {
        let entries = self.timelines.lock().unwrap().get(session_id).cloned();
        entries.ok_or_else(|| anyhow!("no timeline for {session_id}"))
    }
}

/// Accepts WebSocket clients on an ephemeral local port. Each accepted
/// client is numbered from 1, announced on the returned channel, and handed
/// to `session` on its own task.
pub async fn serve_video<S, Fut>(session: S) -> (Url, mpsc::UnboundedReceiver<usize>)
where
    S: Fn(usize, WebSocketStream<TcpStream>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut count = 0;
        while let Ok((stream, _)) = listener.accept().await {
            let Ok(socket) = tokio_tungstenite::accept_async(stream).await else {
                continue;
            };
            count += 1;
            let _ = tx.send(count);
            tokio::spawn(session(count, socket));
        }
    });

    let url = Url::parse(&format!("ws://{addr}/video/output")).unwrap();
    (url, rx)
}
