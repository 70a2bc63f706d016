use serde::Serialize;

use crate::models::{PostureAnalysis, PostureMetrics, SessionProgress};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Moderate,
    High,
}

impl RiskLevel {
    /// Classifies by the share of time spent in incorrect posture.
    pub fn from_incorrect_percent(percent: f64) -> Self {
        if percent > 70.0 {
            RiskLevel::High
        } else if percent > 40.0 {
            RiskLevel::Moderate
        } else {
            RiskLevel::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Moderate => "moderate",
            RiskLevel::High => "high",
        }
    }
}

pub fn risk_level(metrics: &PostureMetrics) -> RiskLevel {
    RiskLevel::from_incorrect_percent(metrics.porcentaje_incorrecta)
}

/// Label with the highest score. Ties resolve to the alphabetically first
/// label so repeated polls render the same answer.
pub fn highest_posture(analysis: &PostureAnalysis) -> Option<(&str, f64)> {
    analysis
        .iter()
        .filter(|(_, score)| score.is_finite())
        .max_by(|(a_label, a), (b_label, b)| a.total_cmp(b).then_with(|| b_label.cmp(a_label)))
        .map(|(label, score)| (label.as_str(), *score))
}

pub fn session_percent(progress: Option<SessionProgress>) -> f64 {
    progress.map(|p| p.percent()).unwrap_or(0.0)
}
