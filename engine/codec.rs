// engine/codec.rs

//! # Feature Codec
//!
//! Turns patient and association records into the dense matrix the regressor
//! consumes, and owns every piece of state needed to repeat that mapping at
//! prediction time:
//!
//! - **Column selection.** A fixed candidate list is intersected with the
//!   columns actually present. The resulting `feature_names` order is the
//!   column order of every matrix the codec ever produces.
//! - **Categorical encoding.** One [`CategoryEncoder`] per categorical column,
//!   labels sorted ascending and coded by rank. A label never seen during
//!   training is replaced by the first known label before encoding.
//! - **Numeric scaling.** Missing or unparseable cells are median-filled, then
//!   z-scored with the mean and scale captured at training time.
//!
//! At prediction time only the intersection of trained and incoming columns
//! carries information. Trained columns that are absent from the input are
//! imputed with their training-time fill value so the matrix keeps its width.

use crate::data::Table;
use crate::heuristic;
use crate::types::{AssociationRecord, PatientRecord};
use itertools::Itertools;
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

/// Label used for a categorical cell that is empty in the input.
pub const MISSING_LABEL: &str = "unknown";

/// Every column the codec knows how to use, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Age,
    Gender,
    BloodGroup,
    Bmi,
    MedicalHistory,
    GeneId,
    DiseaseClassEncoded,
    Score,
    Ei,
    CombinedScore,
    EvidenceStrength,
    AssociationAge,
    ResearchActivity,
}

impl Feature {
    pub const CANDIDATES: [Feature; 13] = [
        Feature::Age,
        Feature::Gender,
        Feature::BloodGroup,
        Feature::Bmi,
        Feature::MedicalHistory,
        Feature::GeneId,
        Feature::DiseaseClassEncoded,
        Feature::Score,
        Feature::Ei,
        Feature::CombinedScore,
        Feature::EvidenceStrength,
        Feature::AssociationAge,
        Feature::ResearchActivity,
    ];

    /// The input column name for this feature.
    pub fn name(self) -> &'static str {
        match self {
            Feature::Age => "age",
            Feature::Gender => "gender",
            Feature::BloodGroup => "blood_group",
            Feature::Bmi => "bmi",
            Feature::MedicalHistory => "medical_history",
            Feature::GeneId => "gene_id",
            Feature::DiseaseClassEncoded => "disease_class_encoded",
            Feature::Score => "score",
            Feature::Ei => "ei",
            Feature::CombinedScore => "combined_score",
            Feature::EvidenceStrength => "evidence_strength",
            Feature::AssociationAge => "association_age",
            Feature::ResearchActivity => "research_activity",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::CANDIDATES.into_iter().find(|feature| feature.name() == name)
    }

    pub fn is_categorical(self) -> bool {
        matches!(
            self,
            Feature::Gender | Feature::BloodGroup | Feature::MedicalHistory
        )
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Cannot fit the feature codec on an empty table.")]
    EmptyTable,
    #[error(
        "None of the known feature columns are present (or all of them are empty). Expected some of: {}",
        Feature::CANDIDATES.iter().map(|f| f.name()).join(", ")
    )]
    NoFeatures,
    #[error("The categorical feature '{0}' has no fitted encoder in this model.")]
    MissingEncoder(Feature),
    #[error("The encoder for categorical feature '{0}' has no known classes.")]
    EmptyEncoder(String),
    #[error("The numeric feature '{0}' has no fitted scale in this model.")]
    MissingScale(Feature),
}

/// A patient joined with one association: the flat row the codec reads from.
#[derive(Debug, Clone, Copy)]
pub struct FeatureRow<'a> {
    pub patient: &'a PatientRecord,
    pub association: &'a AssociationRecord,
}

impl<'a> FeatureRow<'a> {
    pub fn join(patient: &'a PatientRecord, association: &'a AssociationRecord) -> Self {
        Self {
            patient,
            association,
        }
    }

    /// Numeric value of `feature`; `None` for categorical features and for
    /// columns absent from the input.
    pub fn number(&self, feature: Feature) -> Option<f64> {
        match feature {
            Feature::Age => self.patient.age,
            Feature::Bmi => self.patient.bmi,
            Feature::GeneId => self.association.gene_id,
            Feature::DiseaseClassEncoded => self.association.disease_class_encoded,
            Feature::Score => self.association.score,
            Feature::Ei => self.association.ei,
            Feature::CombinedScore => self.association.combined_score,
            Feature::EvidenceStrength => self.association.evidence_strength,
            Feature::AssociationAge => self.association.association_age,
            Feature::ResearchActivity => self.association.research_activity,
            Feature::Gender | Feature::BloodGroup | Feature::MedicalHistory => None,
        }
    }

    pub fn label(&self, feature: Feature) -> Option<&'a str> {
        match feature {
            Feature::Gender => self.patient.gender.as_deref(),
            Feature::BloodGroup => self.patient.blood_group.as_deref(),
            Feature::MedicalHistory => self.patient.medical_history.as_deref(),
            _ => None,
        }
    }

    pub fn has(&self, feature: Feature) -> bool {
        if feature.is_categorical() {
            self.label(feature).is_some()
        } else {
            self.number(feature).is_some()
        }
    }
}

/// Label-to-integer mapping for one categorical column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryEncoder {
    classes: Vec<String>,
}

impl CategoryEncoder {
    pub fn fit<'a, I>(labels: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let classes = labels
            .into_iter()
            .map(str::to_string)
            .sorted()
            .dedup()
            .collect();
        Self { classes }
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Code of a known label.
    pub fn code(&self, label: &str) -> Option<usize> {
        self.classes
            .binary_search_by(|class| class.as_str().cmp(label))
            .ok()
    }

    /// Code of `label`, substituting the first known class for unseen labels.
    /// Returns `None` only when the encoder has no classes at all.
    pub fn encode_or_first(&self, label: &str) -> Option<usize> {
        if self.classes.is_empty() {
            return None;
        }
        Some(self.code(label).unwrap_or(0))
    }
}

/// Z-score parameters of one numeric column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnScale {
    pub feature: Feature,
    pub mean: f64,
    pub scale: f64,
}

impl ColumnScale {
    /// Population mean and standard deviation; a zero or non-finite spread
    /// scales by one.
    fn fit(feature: Feature, values: &[f64]) -> Self {
        let column = ArrayView1::from(values);
        let mean = column.mean().unwrap_or(0.0);
        let std = column.std(0.0);
        let scale = if std > 0.0 && std.is_finite() { std } else { 1.0 };
        Self {
            feature,
            mean,
            scale,
        }
    }

    pub fn apply(&self, value: f64) -> f64 {
        (value - self.mean) / self.scale
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub columns: Vec<ColumnScale>,
}

impl StandardScaler {
    pub fn get(&self, feature: Feature) -> Option<&ColumnScale> {
        self.columns.iter().find(|column| column.feature == feature)
    }
}

/// Everything the codec learned at training time. Never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedCodec {
    pub feature_names: Vec<Feature>,
    /// Keyed by column name. Absent from compact model bundles.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub encoders: BTreeMap<String, CategoryEncoder>,
    pub scaler: StandardScaler,
    /// Training-time median of each numeric column, keyed by column name.
    pub medians: BTreeMap<String, f64>,
}

/// Output of [`fit`]: the design matrix, the target, and the fitted codec.
#[derive(Debug, Clone)]
pub struct EncodedTable {
    pub x: Array2<f64>,
    pub y: Array1<f64>,
    pub codec: FittedCodec,
}

/// Fits the codec on a training table and encodes it.
pub fn fit(table: &Table) -> Result<EncodedTable, CodecError> {
    if table.rows.is_empty() {
        return Err(CodecError::EmptyTable);
    }
    let n = table.rows.len();
    let y = training_target(table);

    let mut features = Vec::new();
    let mut columns: Vec<Vec<f64>> = Vec::new();
    let mut encoders = BTreeMap::new();
    let mut scaler = StandardScaler::default();
    let mut medians = BTreeMap::new();

    for feature in Feature::CANDIDATES {
        if !table.columns.contains(&feature) {
            continue;
        }

        if feature.is_categorical() {
            let labels: Vec<&str> = table
                .rows
                .iter()
                .map(|row| row.features().label(feature).unwrap_or(MISSING_LABEL))
                .collect();
            let encoder = CategoryEncoder::fit(labels.iter().copied());
            let codes = labels
                .iter()
                .map(|label| encoder.code(label).unwrap_or(0) as f64)
                .collect();
            log::debug!(
                "Encoded '{}' with {} classes: {:?}",
                feature,
                encoder.classes().len(),
                encoder.classes()
            );
            encoders.insert(feature.name().to_string(), encoder);
            features.push(feature);
            columns.push(codes);
        } else {
            // Infinities are treated like unparseable cells during training.
            let mut values: Vec<f64> = table
                .rows
                .iter()
                .map(|row| {
                    row.features()
                        .number(feature)
                        .filter(|v| v.is_finite())
                        .unwrap_or(f64::NAN)
                })
                .collect();
            let fill = median(&values);
            if fill.is_nan() {
                log::warn!("Dropping feature '{feature}': the column has no usable values.");
                continue;
            }
            fill_missing(&mut values, fill);
            let column = ColumnScale::fit(feature, &values);
            let scaled = values.iter().map(|&v| column.apply(v)).collect();
            medians.insert(feature.name().to_string(), fill);
            scaler.columns.push(column);
            features.push(feature);
            columns.push(scaled);
        }
    }

    if features.is_empty() {
        return Err(CodecError::NoFeatures);
    }

    let mut x = Array2::zeros((n, features.len()));
    for (j, column) in columns.iter().enumerate() {
        for (i, &value) in column.iter().enumerate() {
            x[[i, j]] = value;
        }
    }

    log::info!(
        "Feature codec fitted on {} rows using {} features: {}",
        n,
        features.len(),
        features.iter().map(|f| f.name()).join(", ")
    );

    Ok(EncodedTable {
        x,
        y,
        codec: FittedCodec {
            feature_names: features,
            encoders,
            scaler,
            medians,
        },
    })
}

impl FittedCodec {
    /// Trained features that at least one of `rows` carries.
    pub fn present_features(&self, rows: &[FeatureRow<'_>]) -> BTreeSet<Feature> {
        self.feature_names
            .iter()
            .copied()
            .filter(|&feature| rows.iter().any(|row| row.has(feature)))
            .collect()
    }

    /// Encodes rows for prediction, one matrix row per input row.
    ///
    /// `Ok(None)` means no trained feature is present in the input and the
    /// model cannot be used. A model holding an encoder with no classes is
    /// unusable for every input, whichever columns it carries.
    pub fn transform(&self, rows: &[FeatureRow<'_>]) -> Result<Option<Array2<f64>>, CodecError> {
        if let Some((name, _)) = self.encoders.iter().find(|(_, encoder)| encoder.is_empty()) {
            return Err(CodecError::EmptyEncoder(name.clone()));
        }

        let present = self.present_features(rows);
        if present.is_empty() {
            log::debug!("No trained feature is present in the input; skipping the model.");
            return Ok(None);
        }

        let mut x = Array2::zeros((rows.len(), self.feature_names.len()));
        for (j, &feature) in self.feature_names.iter().enumerate() {
            let is_present = present.contains(&feature);

            if feature.is_categorical() {
                // Absent columns keep code 0, the first known class.
                if !is_present {
                    continue;
                }
                let encoder = self
                    .encoders
                    .get(feature.name())
                    .ok_or(CodecError::MissingEncoder(feature))?;
                for (i, row) in rows.iter().enumerate() {
                    let label = row.label(feature).unwrap_or(MISSING_LABEL);
                    let code = encoder
                        .encode_or_first(label)
                        .ok_or_else(|| CodecError::EmptyEncoder(feature.name().to_string()))?;
                    x[[i, j]] = code as f64;
                }
            } else {
                let column = self
                    .scaler
                    .get(feature)
                    .ok_or(CodecError::MissingScale(feature))?;
                let values = if is_present {
                    let mut values: Vec<f64> = rows
                        .iter()
                        .map(|row| row.number(feature).unwrap_or(f64::NAN))
                        .collect();
                    let fill = median(&values);
                    fill_missing(&mut values, fill);
                    values
                } else {
                    let fill = self
                        .medians
                        .get(feature.name())
                        .copied()
                        .unwrap_or(column.mean);
                    vec![fill; rows.len()]
                };
                for (i, value) in values.into_iter().enumerate() {
                    x[[i, j]] = column.apply(value);
                }
            }
        }

        Ok(Some(x))
    }
}

fn training_target(table: &Table) -> Array1<f64> {
    let mut y: Vec<f64> = if table.has_target {
        table
            .rows
            .iter()
            .map(|row| row.target.filter(|v| v.is_finite()).unwrap_or(f64::NAN))
            .collect()
    } else {
        log::info!(
            "No 'personalized_risk_score' column found; synthesizing targets with the weighted heuristic."
        );
        table
            .rows
            .iter()
            .map(|row| heuristic::weighted_score(&row.patient, std::slice::from_ref(&row.association)))
            .collect()
    };
    let fill = median(&y);
    fill_missing(&mut y, fill);
    Array1::from_vec(y)
}

/// Median of the non-NaN values, `NaN` when there are none. Even-length inputs
/// average the two middle values.
pub fn median(values: &[f64]) -> f64 {
    let mut usable: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    if usable.is_empty() {
        return f64::NAN;
    }
    usable.sort_by(f64::total_cmp);
    let mid = usable.len() / 2;
    if usable.len() % 2 == 0 {
        (usable[mid - 1] + usable[mid]) / 2.0
    } else {
        usable[mid]
    }
}

pub fn fill_missing(values: &mut [f64], fill: f64) {
    for value in values.iter_mut().filter(|v| v.is_nan()) {
        *value = fill;
    }
}
