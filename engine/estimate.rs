// engine/estimate.rs

//! # Risk Estimation Cascade
//!
//! A score is produced by the first of three tiers that yields a finite value
//! in range:
//!
//! 1. **Model**: the trained forest, averaged over the patient's associations.
//! 2. **Weighted heuristic**: the closed-form formula the model was trained to
//!    approximate.
//! 3. **Simple heuristic**: a coarser formula with a floor of `0.1`.
//!
//! A tier failing is not an error; it just hands over to the next one. Only
//! when all three fail does the caller see an [`EstimateError::Exhausted`],
//! which becomes a result row with status `Error`.
//!
//! [`RiskEngine`] wraps the cascade with a lazily loaded model.

use crate::codec::FeatureRow;
use crate::data::{DataError, Table};
use crate::heuristic;
use crate::model::{
    ModelError, ModelInfo, ModelStore, PersistenceTier, SavedFile, TrainedModel, TrainingMode,
    TrainingSettings,
};
use crate::types::{
    AssociationRecord, AssociationRisk, HealthStatus, PatientRecord, RiskLevel, RiskResult,
    ScoreSource, categorize,
};
use itertools::Itertools;
use std::fmt;
use thiserror::Error;

/// Label used in breakdowns for an association without a gene or disease name.
pub const UNKNOWN_NAME: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Model,
    WeightedHeuristic,
    SimpleHeuristic,
}

/// Tiers in the order they are tried.
pub const CASCADE: [Tier; 3] = [Tier::Model, Tier::WeightedHeuristic, Tier::SimpleHeuristic];

impl Tier {
    pub fn source(self) -> ScoreSource {
        match self {
            Tier::Model => ScoreSource::Model,
            Tier::WeightedHeuristic => ScoreSource::WeightedHeuristic,
            Tier::SimpleHeuristic => ScoreSource::SimpleHeuristic,
        }
    }

    fn run(
        self,
        model: Option<&TrainedModel>,
        patient: &PatientRecord,
        associations: &[AssociationRecord],
    ) -> Result<Estimate, EstimateError> {
        let (score, raw) = match self {
            Tier::Model => {
                let model = model.ok_or(EstimateError::ModelUnavailable)?;
                let mean = model_mean(model, patient, associations)?;
                (mean, mean)
            }
            Tier::WeightedHeuristic => {
                let raw = heuristic::weighted_raw(patient, associations);
                (heuristic::weighted_score(patient, associations), raw)
            }
            Tier::SimpleHeuristic => {
                let raw = heuristic::simple_raw(patient, associations);
                (heuristic::simple_score(patient, associations), raw)
            }
        };

        if !score.is_finite() || !(0.0..=1.0).contains(&score) {
            return Err(EstimateError::InvalidScore { tier: self, value: score });
        }
        Ok(Estimate {
            score,
            raw,
            source: self.source(),
        })
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.source(), f)
    }
}

#[derive(Error, Debug)]
pub enum EstimateError {
    #[error("No trained model is available.")]
    ModelUnavailable,
    #[error("No association rows were supplied.")]
    NoAssociations,
    #[error("The input shares no feature columns with the model.")]
    FeatureMismatch,
    #[error("{0}")]
    Model(#[from] ModelError),
    #[error("The {tier} tier produced an invalid score ({value}).")]
    InvalidScore { tier: Tier, value: f64 },
    #[error(
        "All estimation tiers failed: {}",
        .0.iter().map(|(tier, e)| format!("{tier}: {e}")).join("; ")
    )]
    Exhausted(Vec<(Tier, EstimateError)>),
}

/// A successful tier result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    /// Final score in `[0, 1]`.
    pub score: f64,
    /// The tier's value before clamping.
    pub raw: f64,
    pub source: ScoreSource,
}

fn model_mean(
    model: &TrainedModel,
    patient: &PatientRecord,
    associations: &[AssociationRecord],
) -> Result<f64, EstimateError> {
    if associations.is_empty() {
        return Err(EstimateError::NoAssociations);
    }
    let rows: Vec<FeatureRow<'_>> = associations
        .iter()
        .map(|association| FeatureRow::join(patient, association))
        .collect();
    let predictions = model
        .predict_rows(&rows)?
        .ok_or(EstimateError::FeatureMismatch)?;
    Ok(predictions.mean().unwrap_or(f64::NAN))
}

/// Runs the cascade for one patient.
pub fn estimate(
    model: Option<&TrainedModel>,
    patient: &PatientRecord,
    associations: &[AssociationRecord],
) -> Result<Estimate, EstimateError> {
    let mut failures = Vec::with_capacity(CASCADE.len());
    for tier in CASCADE {
        match tier.run(model, patient, associations) {
            Ok(estimate) => return Ok(estimate),
            Err(e) => {
                log::debug!("{tier} tier skipped: {e}");
                failures.push((tier, e));
            }
        }
    }
    Err(EstimateError::Exhausted(failures))
}

/// Runs the cascade and categorizes the outcome. Never fails.
pub fn assess(
    model: Option<&TrainedModel>,
    patient_id: String,
    patient: &PatientRecord,
    associations: &[AssociationRecord],
) -> RiskResult {
    match estimate(model, patient, associations) {
        Ok(estimate) => RiskResult::scored(patient_id, estimate.score, estimate.raw, estimate.source),
        Err(e) => {
            log::warn!("Could not score patient {patient_id}: {e}");
            RiskResult::failed(patient_id, e.to_string())
        }
    }
}

/// Scores each association on its own, highest risk first.
pub fn breakdown(
    model: Option<&TrainedModel>,
    patient: &PatientRecord,
    associations: &[AssociationRecord],
) -> Vec<AssociationRisk> {
    let mut risks: Vec<AssociationRisk> = associations
        .iter()
        .map(|association| {
            let name = |value: &Option<String>| {
                value.clone().unwrap_or_else(|| UNKNOWN_NAME.to_string())
            };
            let (predicted_risk, risk_level, health_status, source) =
                match estimate(model, patient, std::slice::from_ref(association)) {
                    Ok(estimate) => {
                        let (level, status) = categorize(estimate.score);
                        (estimate.score, level, status, estimate.source)
                    }
                    Err(_) => (0.0, RiskLevel::Unknown, HealthStatus::Error, ScoreSource::None),
                };
            AssociationRisk {
                gene_symbol: name(&association.gene_symbol),
                disease_name: name(&association.disease_name),
                predicted_risk,
                risk_level,
                health_status,
                source,
            }
        })
        .collect();
    risks.sort_by(|a, b| b.predicted_risk.total_cmp(&a.predicted_risk));
    risks
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// How [`RiskEngine::train_or_load`] obtained its model.
#[derive(Debug, Clone, PartialEq)]
pub enum TrainOutcome {
    Loaded(PersistenceTier),
    Trained(Vec<SavedFile>),
}

/// The cascade plus a model that is loaded from the store on first use.
#[derive(Debug)]
pub struct RiskEngine {
    store: ModelStore,
    model: Option<TrainedModel>,
    loaded_from: Option<PersistenceTier>,
}

impl RiskEngine {
    pub fn new(store: ModelStore) -> Self {
        Self {
            store,
            model: None,
            loaded_from: None,
        }
    }

    /// An engine around an in-memory model.
    pub fn with_model(store: ModelStore, model: TrainedModel) -> Self {
        Self {
            store,
            model: Some(model),
            loaded_from: None,
        }
    }

    pub fn store(&self) -> &ModelStore {
        &self.store
    }

    pub fn model(&self) -> Option<&TrainedModel> {
        self.model.as_ref()
    }

    /// Loads the model if none is held yet. A failed load leaves the engine
    /// on the heuristics.
    pub fn ensure_model(&mut self) -> Option<&TrainedModel> {
        if self.model.is_none() {
            match self.store.load() {
                Ok((model, tier)) => {
                    self.model = Some(model);
                    self.loaded_from = Some(tier);
                }
                Err(ModelError::ModelNotFound(path)) => {
                    log::info!(
                        "No model at '{}'; scores will come from the heuristics.",
                        path.display()
                    );
                }
                Err(e) => log::warn!("Could not load the model, using the heuristics: {e}"),
            }
        }
        self.model.as_ref()
    }

    /// Returns the persisted model when one exists, otherwise trains on the
    /// table from `corpus` and saves it. `force` always retrains.
    pub fn train_or_load<F>(
        &mut self,
        corpus: F,
        mode: TrainingMode,
        settings: &TrainingSettings,
        force: bool,
    ) -> Result<TrainOutcome, EngineError>
    where
        F: FnOnce() -> Result<Table, DataError>,
    {
        if !force && self.store.exists() {
            match self.store.load() {
                Ok((model, tier)) => {
                    log::info!("A trained model already exists; skipping training.");
                    self.model = Some(model);
                    self.loaded_from = Some(tier);
                    return Ok(TrainOutcome::Loaded(tier));
                }
                Err(e) => log::warn!("Existing model is unreadable, retraining: {e}"),
            }
        }

        let table = corpus()?;
        let model = TrainedModel::train(&table, mode, settings)?;
        let saved = self.store.save(&model)?;
        self.model = Some(model);
        self.loaded_from = None;
        Ok(TrainOutcome::Trained(saved))
    }

    pub fn assess(
        &mut self,
        patient_id: String,
        patient: &PatientRecord,
        associations: &[AssociationRecord],
    ) -> RiskResult {
        let model = self.ensure_model();
        assess(model, patient_id, patient, associations)
    }

    pub fn detailed(
        &mut self,
        patient: &PatientRecord,
        associations: &[AssociationRecord],
    ) -> Vec<AssociationRisk> {
        let model = self.ensure_model();
        breakdown(model, patient, associations)
    }

    pub fn info(&mut self) -> Option<ModelInfo> {
        self.ensure_model();
        let loaded_from = self.loaded_from;
        self.model.as_ref().map(|model| ModelInfo {
            loaded_from,
            ..model.info()
        })
    }
}
