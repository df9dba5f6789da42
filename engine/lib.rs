// engine/lib.rs

//! Personalized gene-disease risk scoring.
//!
//! Patient attributes and gene-disease associations go in, a categorized
//! risk score comes out. A trained regression forest is used when one is
//! available and applicable; closed-form heuristics take over otherwise.

pub mod batch;
pub mod codec;
pub mod config;
pub mod data;
pub mod estimate;
pub mod heuristic;
pub mod model;
pub mod regressor;
pub mod types;

#[cfg(test)]
mod testutil;

pub use batch::{BatchSummary, run_batch};
pub use config::EngineConfig;
pub use estimate::{RiskEngine, TrainOutcome, assess, estimate};
pub use model::{ModelStore, PersistenceTier, TrainedModel, TrainingMode};
pub use types::{AssociationRecord, HealthStatus, PatientRecord, RiskLevel, RiskResult, ScoreSource};
