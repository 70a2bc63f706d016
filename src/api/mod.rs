mod client;

pub use client::HttpBackend;

use std::future::Future;

use anyhow::Result;

use crate::{
    launch::DeviceId,
    models::{
        CalibrationSample, Patient, PostureAnalysis, PostureMetrics, RestartResponse, Session,
        SessionProgress, TimelineEntry,
    },
};

/// Backend calls the lifecycle depends on. Display-only endpoints are in
/// [`DisplayApi`].
pub trait BackendApi: Send + Sync + 'static {
    /// Last element of the session list, `None` when the list is empty.
    fn latest_session(&self) -> impl Future<Output = Result<Option<Session>>> + Send;

    fn session_progress(
        &self,
        session_id: &str,
    ) -> impl Future<Output = Result<SessionProgress>> + Send;

    fn report_session_end(&self, device: &DeviceId) -> impl Future<Output = Result<()>> + Send;

    fn restart_session(
        &self,
        session_id: &str,
        device: &DeviceId,
    ) -> impl Future<Output = Result<RestartResponse>> + Send;

    fn calibration_progress(
        &self,
        session_id: &str,
    ) -> impl Future<Output = Result<CalibrationSample>> + Send;

    /// Takes the device out of calibration firmware mode.
    fn switch_to_normal_mode(&self, device: &DeviceId) -> impl Future<Output = Result<()>> + Send;
}

/// Read-only endpoints behind the display feeds.
pub trait DisplayApi: Send + Sync + 'static {
    fn patient(&self, device: &DeviceId) -> impl Future<Output = Result<Patient>> + Send;

    fn posture_metrics(
        &self,
        session_id: &str,
    ) -> impl Future<Output = Result<PostureMetrics>> + Send;

    fn posture_analysis(
        &self,
        session_id: &str,
    ) -> impl Future<Output = Result<PostureAnalysis>> + Send;

    fn timeline(&self, session_id: &str) -> impl Future<Output = Result<Vec<TimelineEntry>>> + Send;
}
