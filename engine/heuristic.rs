// engine/heuristic.rs

//! Closed-form risk formulas used when the trained model cannot be used.
//!
//! The weighted formula doubles as the training target when a corpus carries no
//! `personalized_risk_score` column, so the model learns to approximate its own
//! fallback. Any change here changes both.

use crate::types::{AssociationRecord, PatientRecord};

pub const SEVERE_CONDITIONS: [&str; 3] = ["Diabetes", "Hypertension", "Heart Disease"];
pub const MODERATE_CONDITIONS: [&str; 2] = ["Obesity", "High Cholesterol"];

/// Lowest score the simple formula will ever report.
pub const SIMPLE_FLOOR: f64 = 0.1;

const BMI_LOWER: f64 = 18.5;
const BMI_UPPER: f64 = 40.0;

#[derive(Debug, Clone, Copy)]
struct Weights {
    gene_score: f64,
    evidence_strength: f64,
    age: f64,
    bmi: f64,
    severe_bonus: f64,
    moderate_bonus: f64,
}

const WEIGHTED: Weights = Weights {
    gene_score: 0.3,
    evidence_strength: 0.2,
    age: 0.15,
    bmi: 0.10,
    severe_bonus: 0.05,
    moderate_bonus: 0.0,
};

const SIMPLE: Weights = Weights {
    gene_score: 0.4,
    evidence_strength: 0.3,
    age: 0.15,
    bmi: 0.10,
    severe_bonus: 0.05,
    moderate_bonus: 0.03,
};

/// Unclamped weighted sum. `NaN` only when the inputs themselves cancel out
/// (e.g. `+inf` and `-inf` evidence).
pub fn weighted_raw(patient: &PatientRecord, associations: &[AssociationRecord]) -> f64 {
    accumulate(&WEIGHTED, patient, associations)
}

/// The weighted formula clamped to `[0, 1]`.
pub fn weighted_score(patient: &PatientRecord, associations: &[AssociationRecord]) -> f64 {
    weighted_raw(patient, associations).clamp(0.0, 1.0)
}

pub fn simple_raw(patient: &PatientRecord, associations: &[AssociationRecord]) -> f64 {
    accumulate(&SIMPLE, patient, associations)
}

/// The simple formula clamped to `[SIMPLE_FLOOR, 1]`.
pub fn simple_score(patient: &PatientRecord, associations: &[AssociationRecord]) -> f64 {
    simple_raw(patient, associations).clamp(SIMPLE_FLOOR, 1.0)
}

/// Age contribution before weighting: `min(age / 100, 1)`.
pub fn age_factor(age: f64) -> f64 {
    (age / 100.0).min(1.0)
}

/// BMI contribution before weighting, scaled linearly between 18.5 and 40.
pub fn bmi_factor(bmi: f64) -> f64 {
    ((bmi - BMI_LOWER) / (BMI_UPPER - BMI_LOWER)).clamp(0.0, 1.0)
}

fn accumulate(weights: &Weights, patient: &PatientRecord, associations: &[AssociationRecord]) -> f64 {
    let mut total = 0.0;
    for association in associations {
        if let Some(score) = usable(association.score) {
            total += weights.gene_score * score;
        }
        if let Some(evidence) = usable(association.evidence_strength) {
            total += weights.evidence_strength * evidence;
        }
    }

    if let Some(age) = usable(patient.age) {
        total += weights.age * age_factor(age);
    }
    if let Some(bmi) = usable(patient.bmi) {
        total += weights.bmi * bmi_factor(bmi);
    }

    if let Some(history) = patient.medical_history.as_deref() {
        if SEVERE_CONDITIONS.contains(&history) {
            total += weights.severe_bonus;
        } else if MODERATE_CONDITIONS.contains(&history) {
            total += weights.moderate_bonus;
        }
    }

    total
}

fn usable(value: Option<f64>) -> Option<f64> {
    value.filter(|v| !v.is_nan())
}
