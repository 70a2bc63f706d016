//! Read-only payloads shown next to the video. None of these affect the
//! lifecycle.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Patient {
    pub id: i64,
    #[serde(default)]
    pub telegram_id: Option<String>,
    pub device_id: String,
    pub nombre: String,
    pub edad: u32,
    #[serde(default)]
    pub sexo: Option<String>,
    #[serde(default)]
    pub diagnostico: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PostureMetrics {
    pub actual: String,
    pub transiciones_malas: u32,
    pub porcentaje_correcta: f64,
    pub porcentaje_incorrecta: f64,
    pub tiempo_parado: f64,
    pub tiempo_sentado: f64,
    pub alertas_enviadas: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimelineEntry {
    pub timestamp: String,
    pub postura: String,
    #[serde(default)]
    pub tiempo_mala_postura: f64,
}

/// Posture label to score, as returned by `GET /analysis/{session_id}`.
pub type PostureAnalysis = HashMap<String, f64>;
