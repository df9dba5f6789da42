// engine/types.rs

//! Record and result types shared by every stage of the scoring pipeline.
//!
//! Numeric fields are `Option<f64>` with a two-level meaning that the codec and
//! the heuristics rely on:
//!
//! - `None`: the column does not exist in the input at all.
//! - `Some(f64::NAN)`: the column exists but this cell is empty or not numeric.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Demographic and clinical attributes of one patient.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatientRecord {
    pub patient_id: Option<String>,
    pub age: Option<f64>,
    pub gender: Option<String>,
    pub blood_group: Option<String>,
    pub bmi: Option<f64>,
    pub medical_history: Option<String>,
}

/// One gene-disease association with its evidence scores.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssociationRecord {
    pub gene_id: Option<f64>,
    pub gene_symbol: Option<String>,
    pub disease_name: Option<String>,
    pub disease_class_encoded: Option<f64>,
    pub score: Option<f64>,
    pub ei: Option<f64>,
    pub combined_score: Option<f64>,
    pub evidence_strength: Option<f64>,
    pub association_age: Option<f64>,
    pub research_activity: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Normal,
    #[serde(rename = "At Risk")]
    AtRisk,
    #[serde(rename = "High Risk")]
    HighRisk,
    Error,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RiskLevel::Low => "Low",
            RiskLevel::Medium => "Medium",
            RiskLevel::High => "High",
            RiskLevel::Unknown => "Unknown",
        };
        f.write_str(text)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            HealthStatus::Normal => "Normal",
            HealthStatus::AtRisk => "At Risk",
            HealthStatus::HighRisk => "High Risk",
            HealthStatus::Error => "Error",
        };
        f.write_str(text)
    }
}

/// Identifies which cascade tier produced a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreSource {
    Model,
    WeightedHeuristic,
    SimpleHeuristic,
    /// Every tier failed; the result carries an error instead of a score.
    None,
}

impl fmt::Display for ScoreSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ScoreSource::Model => "model",
            ScoreSource::WeightedHeuristic => "weighted_heuristic",
            ScoreSource::SimpleHeuristic => "simple_heuristic",
            ScoreSource::None => "none",
        };
        f.write_str(text)
    }
}

/// Maps a risk score onto its level and health status.
///
/// The thresholds are exclusive on the lower bound: exactly `0.4` is still
/// `Low`/`Normal` and exactly `0.7` is still `Medium`/`At Risk`.
pub fn categorize(risk_score: f64) -> (RiskLevel, HealthStatus) {
    if risk_score > 0.7 {
        (RiskLevel::High, HealthStatus::HighRisk)
    } else if risk_score > 0.4 {
        (RiskLevel::Medium, HealthStatus::AtRisk)
    } else {
        (RiskLevel::Low, HealthStatus::Normal)
    }
}

/// Default identifier for a row that carries no `patient_id`.
pub fn default_patient_id(index: usize) -> String {
    format!("P{index:04}")
}

/// The final, categorized outcome for one patient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskResult {
    pub patient_id: String,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub health_status: HealthStatus,
    pub raw_score: f64,
    pub source: ScoreSource,
    pub error: Option<String>,
}

impl RiskResult {
    pub fn scored(patient_id: String, risk_score: f64, raw_score: f64, source: ScoreSource) -> Self {
        let (risk_level, health_status) = categorize(risk_score);
        Self {
            patient_id,
            risk_score,
            risk_level,
            health_status,
            raw_score,
            source,
            error: None,
        }
    }

    /// A row for which every tier failed. The score is forced to zero.
    pub fn failed(patient_id: String, message: String) -> Self {
        Self {
            patient_id,
            risk_score: 0.0,
            risk_level: RiskLevel::Unknown,
            health_status: HealthStatus::Error,
            raw_score: 0.0,
            source: ScoreSource::None,
            error: Some(message),
        }
    }

    pub fn is_error(&self) -> bool {
        self.health_status == HealthStatus::Error
    }
}

/// Risk of a single association, used for the per-gene breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssociationRisk {
    pub gene_symbol: String,
    pub disease_name: String,
    pub predicted_risk: f64,
    pub risk_level: RiskLevel,
    pub health_status: HealthStatus,
    pub source: ScoreSource,
}
