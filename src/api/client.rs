use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::debug;
use reqwest::Client;
use serde::de::DeserializeOwned;
use url::Url;

use crate::{
    launch::DeviceId,
    models::{
        CalibrationSample, Patient, PostureAnalysis, PostureMetrics, RestartResponse, Session,
        SessionProgress, SessionRecord, TimelineEntry,
    },
};

use super::{BackendApi, DisplayApi};

#[derive(Clone)]
pub struct HttpBackend {
    http: Client,
    base: Url,
}

impl HttpBackend {
    pub fn new(base: Url, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http, base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("api base url '{}' cannot carry a path", self.base))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        debug!("GET {url}");
        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("GET {url} failed"))?
            .error_for_status()
            .with_context(|| format!("GET {url} returned an error status"))?;
        response
            .json::<T>()
            .await
            .with_context(|| format!("GET {url} returned an unexpected body"))
    }

    async fn post(&self, url: Url) -> Result<reqwest::Response> {
        debug!("POST {url}");
        self.http
            .post(url.clone())
            .send()
            .await
            .with_context(|| format!("POST {url} failed"))
    }
}

impl BackendApi for HttpBackend {
    async fn latest_session(&self) -> Result<Option<Session>> {
        // the list endpoint is served with a trailing slash
        let sessions: Vec<SessionRecord> = self.get_json(self.url(&["sesiones", ""])?).await?;
        Ok(sessions.into_iter().last().map(Session::from))
    }

    async fn session_progress(&self, session_id: &str) -> Result<SessionProgress> {
        self.get_json(self.url(&["sesiones", "progress", session_id])?)
            .await
    }

    async fn report_session_end(&self, device: &DeviceId) -> Result<()> {
        let url = self.url(&["sesiones", "end", device.as_str()])?;
        self.post(url.clone())
            .await?
            .error_for_status()
            .with_context(|| format!("POST {url} returned an error status"))?;
        Ok(())
    }

    async fn restart_session(&self, session_id: &str, device: &DeviceId) -> Result<RestartResponse> {
        let mut url = self.url(&["sesiones", "reiniciar", session_id])?;
        url.query_pairs_mut().append_pair("device_id", device.as_str());
        // The body carries `ok`/`message` even on error statuses.
        self.post(url.clone())
            .await?
            .json::<RestartResponse>()
            .await
            .with_context(|| format!("POST {url} returned an unexpected body"))
    }

    async fn calibration_progress(&self, session_id: &str) -> Result<CalibrationSample> {
        self.get_json(self.url(&["calib", "progress", session_id])?)
            .await
    }

    async fn switch_to_normal_mode(&self, device: &DeviceId) -> Result<()> {
        let url = self.url(&["calib", "mode", device.as_str(), "normal"])?;
        self.post(url.clone())
            .await?
            .error_for_status()
            .with_context(|| format!("POST {url} returned an error status"))?;
        Ok(())
    }
}

impl DisplayApi for HttpBackend {
    async fn patient(&self, device: &DeviceId) -> Result<Patient> {
        self.get_json(self.url(&["pacientes", device.as_str()])?)
            .await
    }

    async fn posture_metrics(&self, session_id: &str) -> Result<PostureMetrics> {
        self.get_json(self.url(&["metricas", session_id])?).await
    }

    async fn posture_analysis(&self, session_id: &str) -> Result<PostureAnalysis> {
        self.get_json(self.url(&["analysis", session_id])?).await
    }

    async fn timeline(&self, session_id: &str) -> Result<Vec<TimelineEntry>> {
        self.get_json(self.url(&["timeline", session_id])?).await
    }
}
