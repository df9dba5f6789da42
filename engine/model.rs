// engine/model.rs

//! # Trained Model and Tiered Persistence
//!
//! A [`TrainedModel`] bundles the fitted feature codec with the regression
//! forest and the held-out metrics from training. It is immutable once built.
//!
//! [`ModelStore`] owns the on-disk layout. A model is always written as a
//! plain TOML document at `P`. When that file exceeds the size ceiling a gzip
//! copy is written to `P.gz`, and when even that is too large a compact bundle
//! without the categorical encoders is written to `P.ultra.gz`.
//!
//! Loading tries `P.gz`, then `P.ultra.gz`, then `P`. A candidate that exists
//! but cannot be decoded is skipped with a warning.

use crate::codec::{self, CodecError, Feature, FeatureRow, FittedCodec, StandardScaler};
use crate::data::Table;
use crate::regressor::{self, ForestError, ForestParams, RiskForest};
use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use smartcore::metrics::{mean_squared_error, r2};
use smartcore::model_selection::train_test_split;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// 100 MiB, the largest single file most git hosts accept.
pub const DEFAULT_SIZE_CEILING: u64 = 100 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Feature encoding failed: {0}")]
    Codec(#[from] CodecError),
    #[error("The regression forest failed: {0}")]
    Forest(#[from] ForestError),
    #[error(
        "No trained model was found at '{}' (also checked the .gz and .ultra.gz variants). Train a model first.",
        .0.display()
    )]
    ModelNotFound(PathBuf),
    #[error("Training needs at least {required} rows, but the dataset has {found}.")]
    InsufficientRows { found: usize, required: usize },
    #[error("The test fraction must lie strictly between 0 and 1, got {0}.")]
    InvalidTestFraction(f64),
    #[error("The {0} training mode is configured with n_trees = 0; a forest needs at least one tree.")]
    NoTrees(TrainingMode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingMode {
    #[default]
    Standard,
    /// Fewer, shallower trees for a smaller model file.
    Optimized,
}

impl fmt::Display for TrainingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingMode::Standard => f.write_str("standard"),
            TrainingMode::Optimized => f.write_str("optimized"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    pub seed: u64,
    pub test_fraction: f64,
    pub standard: ForestParams,
    pub optimized: ForestParams,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            seed: 42,
            test_fraction: 0.2,
            standard: ForestParams::default(),
            optimized: ForestParams::optimized(),
        }
    }
}

impl TrainingSettings {
    pub fn params(&self, mode: TrainingMode) -> ForestParams {
        match mode {
            TrainingMode::Standard => self.standard,
            TrainingMode::Optimized => self.optimized,
        }
    }
}

/// Goodness of fit on the held-out split.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub r2: f64,
    pub rmse: f64,
    pub n_train: usize,
    pub n_test: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainedModel {
    pub mode: TrainingMode,
    pub metrics: TrainingMetrics,
    pub codec: FittedCodec,
    pub forest: RiskForest,
}

/// Summary of a model for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    pub mode: TrainingMode,
    pub n_features: usize,
    pub feature_names: Vec<String>,
    pub categorical_encoders: usize,
    pub n_trees: usize,
    pub max_depth: Option<u16>,
    pub metrics: TrainingMetrics,
    pub loaded_from: Option<PersistenceTier>,
}

impl TrainedModel {
    /// Fits the codec, splits the rows, grows the forest on the training part
    /// and scores it on the held-out part.
    pub fn train(
        table: &Table,
        mode: TrainingMode,
        settings: &TrainingSettings,
    ) -> Result<Self, ModelError> {
        let fraction = settings.test_fraction as f32;
        if !(fraction > 0.0 && fraction < 1.0) {
            return Err(ModelError::InvalidTestFraction(settings.test_fraction));
        }
        let params = settings.params(mode);
        if params.n_trees == 0 {
            return Err(ModelError::NoTrees(mode));
        }
        let n_test = held_out_rows(table.len(), fraction);
        if n_test == 0 || n_test >= table.len() {
            return Err(ModelError::InsufficientRows {
                found: table.len(),
                required: (1.0 / f64::from(fraction)).ceil().max(2.0) as usize,
            });
        }

        let encoded = codec::fit(table)?;
        let x = regressor::to_dense(encoded.x.view())?;
        let y = encoded.y.to_vec();
        let (x_train, x_test, y_train, y_test) =
            train_test_split(&x, &y, fraction, true, Some(settings.seed));
        log::info!(
            "Training a {mode} model: {} training rows, {} held-out rows.",
            y_train.len(),
            y_test.len()
        );

        let forest = RiskForest::fit(&x_train, &y_train, params, settings.seed)?;
        let predicted = forest.predict(&x_test)?;
        let metrics = TrainingMetrics {
            r2: r2_score(&y_test, &predicted),
            rmse: rmse(&y_test, &predicted),
            n_train: y_train.len(),
            n_test: y_test.len(),
        };
        log::info!(
            "Held-out R² = {:.4}, RMSE = {:.4}",
            metrics.r2,
            metrics.rmse
        );

        Ok(Self {
            mode,
            metrics,
            codec: encoded.codec,
            forest,
        })
    }

    /// One prediction per row, or `Ok(None)` when the rows share no feature
    /// with the model.
    pub fn predict_rows(&self, rows: &[FeatureRow<'_>]) -> Result<Option<Array1<f64>>, ModelError> {
        let Some(x) = self.codec.transform(rows)? else {
            return Ok(None);
        };
        let predictions = self.forest.predict(&regressor::to_dense(x.view())?)?;
        Ok(Some(Array1::from_vec(predictions)))
    }

    pub fn info(&self) -> ModelInfo {
        ModelInfo {
            mode: self.mode,
            n_features: self.codec.feature_names.len(),
            feature_names: self
                .codec
                .feature_names
                .iter()
                .map(|f| f.name().to_string())
                .collect(),
            categorical_encoders: self.codec.encoders.len(),
            n_trees: self.forest.n_trees(),
            max_depth: self.forest.params.max_depth,
            metrics: self.metrics,
            loaded_from: None,
        }
    }
}

/// Rows `train_test_split` holds out: `floor(n * fraction)` in `f32`.
fn held_out_rows(n: usize, fraction: f32) -> usize {
    (n as f32 * fraction) as usize
}

/// Coefficient of determination. A constant target scores 1.0 when predicted
/// exactly and 0.0 otherwise.
pub fn r2_score(actual: &[f64], predicted: &[f64]) -> f64 {
    let Some(&first) = actual.first() else {
        return 0.0;
    };
    let (actual, predicted) = (actual.to_vec(), predicted.to_vec());
    if actual.iter().all(|&a| a == first) {
        return if actual == predicted { 1.0 } else { 0.0 };
    }
    r2(&actual, &predicted)
}

pub fn rmse(actual: &[f64], predicted: &[f64]) -> f64 {
    if actual.is_empty() {
        return 0.0;
    }
    mean_squared_error(&actual.to_vec(), &predicted.to_vec()).sqrt()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceTier {
    /// `P.gz`
    Compressed,
    /// `P.ultra.gz`, without categorical encoders.
    Ultra,
    /// `P`
    Plain,
}

impl PersistenceTier {
    /// Load precedence.
    pub const LOAD_ORDER: [PersistenceTier; 3] = [
        PersistenceTier::Compressed,
        PersistenceTier::Ultra,
        PersistenceTier::Plain,
    ];

    pub fn suffix(self) -> &'static str {
        match self {
            PersistenceTier::Compressed => ".gz",
            PersistenceTier::Ultra => ".ultra.gz",
            PersistenceTier::Plain => "",
        }
    }

    fn is_gzipped(self) -> bool {
        !matches!(self, PersistenceTier::Plain)
    }
}

impl fmt::Display for PersistenceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistenceTier::Compressed => f.write_str("compressed"),
            PersistenceTier::Ultra => f.write_str("ultra-compressed"),
            PersistenceTier::Plain => f.write_str("uncompressed"),
        }
    }
}

/// A file written by [`ModelStore::save`].
#[derive(Debug, Clone, PartialEq)]
pub struct SavedFile {
    pub tier: PersistenceTier,
    pub path: PathBuf,
    pub bytes: u64,
}

/// Serialized form of the ultra tier: the model minus its encoders. Field
/// names match [`TrainedModel`] so the same loader reads every tier.
#[derive(Serialize)]
struct CompactBundle<'a> {
    mode: TrainingMode,
    metrics: &'a TrainingMetrics,
    codec: CompactCodec<'a>,
    forest: &'a RiskForest,
}

#[derive(Serialize)]
struct CompactCodec<'a> {
    feature_names: &'a [Feature],
    scaler: &'a StandardScaler,
    medians: &'a BTreeMap<String, f64>,
}

impl<'a> CompactBundle<'a> {
    fn of(model: &'a TrainedModel) -> Self {
        Self {
            mode: model.mode,
            metrics: &model.metrics,
            codec: CompactCodec {
                feature_names: &model.codec.feature_names,
                scaler: &model.codec.scaler,
                medians: &model.codec.medians,
            },
            forest: &model.forest,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelStore {
    path: PathBuf,
    size_ceiling: u64,
}

impl ModelStore {
    pub fn new(path: impl Into<PathBuf>, size_ceiling: u64) -> Self {
        Self {
            path: path.into(),
            size_ceiling,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tier_path(&self, tier: PersistenceTier) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(tier.suffix());
        PathBuf::from(name)
    }

    /// Whether any persisted tier exists.
    pub fn exists(&self) -> bool {
        PersistenceTier::LOAD_ORDER
            .into_iter()
            .any(|tier| self.tier_path(tier).is_file())
    }

    /// Writes `P`, then the compressed tiers only as far as the size ceiling
    /// requires. Tiers from an earlier save that are no longer needed are
    /// removed.
    pub fn save(&self, model: &TrainedModel) -> Result<Vec<SavedFile>, ModelError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let text = toml::to_string_pretty(model)?;
        let mut saved = vec![self.write_tier(PersistenceTier::Plain, text.as_bytes())?];
        let mut needed = vec![PersistenceTier::Plain];

        if saved[0].bytes > self.size_ceiling {
            log::warn!(
                "Model file is {} bytes, above the {} byte ceiling; writing a gzip copy.",
                saved[0].bytes,
                self.size_ceiling
            );
            let compressed = gzip(text.as_bytes(), Compression::default())?;
            let file = self.write_tier(PersistenceTier::Compressed, &compressed)?;
            needed.push(PersistenceTier::Compressed);
            let too_large = file.bytes > self.size_ceiling;
            saved.push(file);

            if too_large {
                log::warn!("Compressed model is still above the ceiling; writing a compact bundle without encoders.");
                let compact = toml::to_string_pretty(&CompactBundle::of(model))?;
                let ultra = gzip(compact.as_bytes(), Compression::best())?;
                let file = self.write_tier(PersistenceTier::Ultra, &ultra)?;
                if file.bytes > self.size_ceiling {
                    log::warn!("Even the compact bundle ({} bytes) exceeds the ceiling.", file.bytes);
                }
                needed.push(PersistenceTier::Ultra);
                saved.push(file);
            }
        }

        for tier in PersistenceTier::LOAD_ORDER {
            let path = self.tier_path(tier);
            if !needed.contains(&tier) && path.is_file() {
                log::debug!("Removing stale model file '{}'", path.display());
                fs::remove_file(&path)?;
            }
        }

        for file in &saved {
            log::info!(
                "Saved {} model to '{}' ({} bytes)",
                file.tier,
                file.path.display(),
                file.bytes
            );
        }
        Ok(saved)
    }

    fn write_tier(&self, tier: PersistenceTier, bytes: &[u8]) -> Result<SavedFile, ModelError> {
        let path = self.tier_path(tier);
        let mut file = BufWriter::new(fs::File::create(&path)?);
        file.write_all(bytes)?;
        file.flush()?;
        Ok(SavedFile {
            tier,
            path,
            bytes: bytes.len() as u64,
        })
    }

    /// Loads the first decodable tier in load order.
    pub fn load(&self) -> Result<(TrainedModel, PersistenceTier), ModelError> {
        let mut last_error = None;
        for tier in PersistenceTier::LOAD_ORDER {
            let path = self.tier_path(tier);
            if !path.is_file() {
                continue;
            }
            match read_tier(&path, tier) {
                Ok(model) => {
                    log::info!("Loaded {tier} model from '{}'", path.display());
                    if model.codec.encoders.is_empty()
                        && model.codec.feature_names.iter().any(|f| f.is_categorical())
                    {
                        log::warn!("This model has no categorical encoders; inputs with categorical columns will use the heuristics.");
                    }
                    return Ok((model, tier));
                }
                Err(e) => {
                    log::warn!("Skipping unreadable model file '{}': {e}", path.display());
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| ModelError::ModelNotFound(self.path.clone())))
    }
}

fn read_tier(path: &Path, tier: PersistenceTier) -> Result<TrainedModel, ModelError> {
    let text = if tier.is_gzipped() {
        let mut text = String::new();
        MultiGzDecoder::new(fs::File::open(path)?).read_to_string(&mut text)?;
        text
    } else {
        fs::read_to_string(path)?
    };
    let model: TrainedModel = toml::from_str(&text)?;
    Ok(model)
}

fn gzip(bytes: &[u8], level: Compression) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), level);
    encoder.write_all(bytes)?;
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{small_settings, synthetic_table};
    use crate::types::{AssociationRecord, PatientRecord};
    use approx::assert_abs_diff_eq;
    use tempfile::tempdir;

    fn numeric_only_patient() -> (PatientRecord, AssociationRecord) {
        let patient = PatientRecord {
            age: Some(55.0),
            bmi: Some(30.0),
            ..PatientRecord::default()
        };
        let association = AssociationRecord {
            score: Some(0.6),
            evidence_strength: Some(0.7),
            ..AssociationRecord::default()
        };
        (patient, association)
    }

    #[test]
    fn held_out_rows_round_down() {
        assert_eq!(held_out_rows(10, 0.2), 2);
        assert_eq!(held_out_rows(11, 0.2), 2);
        assert_eq!(held_out_rows(200, 0.2), 40);
        assert_eq!(held_out_rows(4, 0.2), 0);
    }

    #[test]
    fn r2_handles_constant_targets() {
        let actual = [0.5, 0.5];
        assert_eq!(r2_score(&actual, &actual), 1.0);
        let off = [0.4, 0.6];
        assert_eq!(r2_score(&actual, &off), 0.0);
        assert_abs_diff_eq!(rmse(&actual, &off), 0.1, epsilon = 1e-12);
    }

    #[test]
    fn r2_matches_the_textbook_definition() {
        // ss_res = 1, ss_tot = 2
        assert_abs_diff_eq!(r2_score(&[1.0, 2.0, 3.0], &[1.0, 2.0, 4.0]), 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(
            rmse(&[1.0, 2.0, 3.0], &[1.0, 2.0, 4.0]),
            (1.0f64 / 3.0).sqrt(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn training_learns_the_synthesized_target() {
        let model =
            TrainedModel::train(&synthetic_table(200, 7), TrainingMode::Standard, &small_settings())
                .unwrap();
        assert_eq!(model.metrics.n_test, 40);
        assert!(model.metrics.r2 > 0.5, "r2 = {}", model.metrics.r2);
        assert_eq!(model.info().n_trees, 10);
        assert_eq!(model.info().max_depth, None);
        assert_eq!(model.info().categorical_encoders, 3);
    }

    #[test]
    fn training_rejects_tables_too_small_to_split() {
        let err = TrainedModel::train(&synthetic_table(4, 7), TrainingMode::Standard, &small_settings())
            .unwrap_err();
        assert!(matches!(err, ModelError::InsufficientRows { found: 4, required: 5 }));
        let model =
            TrainedModel::train(&synthetic_table(5, 7), TrainingMode::Standard, &small_settings())
                .unwrap();
        assert_eq!((model.metrics.n_train, model.metrics.n_test), (4, 1));
    }

    #[test]
    fn training_rejects_a_forest_without_trees() {
        let mut settings = small_settings();
        settings.standard.n_trees = 0;
        let err = TrainedModel::train(&synthetic_table(40, 7), TrainingMode::Standard, &settings)
            .unwrap_err();
        assert!(matches!(err, ModelError::NoTrees(TrainingMode::Standard)));
        assert!(err.to_string().contains("n_trees = 0"));
        TrainedModel::train(&synthetic_table(40, 7), TrainingMode::Optimized, &settings).unwrap();
    }

    #[test]
    fn predictions_are_deterministic() {
        let model =
            TrainedModel::train(&synthetic_table(80, 7), TrainingMode::Optimized, &small_settings())
                .unwrap();
        let (patient, association) = numeric_only_patient();
        let rows = [FeatureRow::join(&patient, &association)];
        let first = model.predict_rows(&rows).unwrap().unwrap();
        let second = model.predict_rows(&rows).unwrap().unwrap();
        assert_eq!(first[0].to_bits(), second[0].to_bits());
    }

    #[test]
    fn every_tier_round_trips() {
        let model =
            TrainedModel::train(&synthetic_table(60, 7), TrainingMode::Optimized, &small_settings())
                .unwrap();
        let (patient, association) = numeric_only_patient();
        let rows = [FeatureRow::join(&patient, &association)];
        let expected = model.predict_rows(&rows).unwrap().unwrap()[0];

        let text = toml::to_string_pretty(&model).unwrap();
        let gz_len = gzip(text.as_bytes(), Compression::default()).unwrap().len() as u64;
        let cases = [
            (u64::MAX, PersistenceTier::Plain),
            (gz_len, PersistenceTier::Compressed),
            (0, PersistenceTier::Compressed),
        ];

        for (ceiling, expected_tier) in cases {
            let dir = tempdir().unwrap();
            let store = ModelStore::new(dir.path().join("model.toml"), ceiling);
            store.save(&model).unwrap();
            let (loaded, tier) = store.load().unwrap();
            assert_eq!(tier, expected_tier, "ceiling {ceiling}");
            assert_eq!(loaded, model);
            let got = loaded.predict_rows(&rows).unwrap().unwrap()[0];
            assert_eq!(got.to_bits(), expected.to_bits());
        }
    }

    #[test]
    fn ultra_tier_loads_without_encoders() {
        let model =
            TrainedModel::train(&synthetic_table(60, 7), TrainingMode::Optimized, &small_settings())
                .unwrap();
        let dir = tempdir().unwrap();
        let store = ModelStore::new(dir.path().join("model.toml"), 0);
        let saved = store.save(&model).unwrap();
        assert_eq!(saved.len(), 3);

        // Drop the higher tiers so the loader reaches the ultra bundle.
        fs::remove_file(store.tier_path(PersistenceTier::Compressed)).unwrap();
        let (loaded, tier) = store.load().unwrap();
        assert_eq!(tier, PersistenceTier::Ultra);
        assert!(loaded.codec.encoders.is_empty());
        assert_eq!(loaded.codec.feature_names, model.codec.feature_names);
        assert!(!loaded.codec.encoders.contains_key(Feature::Gender.name()));

        let (patient, association) = numeric_only_patient();
        let rows = [FeatureRow::join(&patient, &association)];
        let expected = model.predict_rows(&rows).unwrap().unwrap()[0];
        let got = loaded.predict_rows(&rows).unwrap().unwrap()[0];
        assert_eq!(got.to_bits(), expected.to_bits());
    }

    #[test]
    fn saving_a_small_model_removes_stale_tiers() {
        let model =
            TrainedModel::train(&synthetic_table(40, 7), TrainingMode::Optimized, &small_settings())
                .unwrap();
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.toml");
        ModelStore::new(&path, 0).save(&model).unwrap();
        let store = ModelStore::new(&path, u64::MAX);
        assert!(store.tier_path(PersistenceTier::Ultra).is_file());

        store.save(&model).unwrap();
        assert!(!store.tier_path(PersistenceTier::Compressed).exists());
        assert!(!store.tier_path(PersistenceTier::Ultra).exists());
        assert_eq!(store.load().unwrap().1, PersistenceTier::Plain);
    }

    #[test]
    fn corrupt_candidates_are_skipped() {
        let model =
            TrainedModel::train(&synthetic_table(40, 7), TrainingMode::Optimized, &small_settings())
                .unwrap();
        let dir = tempdir().unwrap();
        let store = ModelStore::new(dir.path().join("model.toml"), u64::MAX);
        store.save(&model).unwrap();
        fs::write(store.tier_path(PersistenceTier::Compressed), b"not gzip").unwrap();

        let (_, tier) = store.load().unwrap();
        assert_eq!(tier, PersistenceTier::Plain);
    }

    #[test]
    fn missing_model_is_reported() {
        let dir = tempdir().unwrap();
        let store = ModelStore::new(dir.path().join("absent.toml"), DEFAULT_SIZE_CEILING);
        assert!(!store.exists());
        assert!(matches!(store.load(), Err(ModelError::ModelNotFound(_))));
    }
}
