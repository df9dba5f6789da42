// engine/regressor.rs

//! # Random Forest Regressor
//!
//! The risk model is smartcore's bagged regression forest. This module maps
//! the engine's [`ForestParams`] onto smartcore's parameters and checks shapes
//! and finiteness before any matrix reaches smartcore.
//!
//! Matrices cross into smartcore as a row-major [`DenseMatrix`] built by
//! [`to_dense`], which also rejects non-finite cells.
//!
//! A fitted smartcore forest carries `PhantomData` markers that TOML cannot
//! represent, so inside a model file the forest is an embedded JSON document.

use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};
use smartcore::ensemble::random_forest_regressor::{
    RandomForestRegressor, RandomForestRegressorParameters,
};
use smartcore::linalg::basic::arrays::Array;
use smartcore::linalg::basic::matrix::DenseMatrix;
use std::sync::Arc;
use thiserror::Error;

type Forest = RandomForestRegressor<f64, f64, DenseMatrix<f64>, Vec<f64>>;

#[derive(Error, Debug)]
pub enum ForestError {
    #[error("A forest needs at least one tree.")]
    NoTrees,
    #[error("Cannot train on {rows} rows with {targets} targets.")]
    ShapeMismatch { rows: usize, targets: usize },
    #[error("Cannot train a forest on an empty matrix.")]
    EmptyTrainingSet,
    #[error("Prediction input has {found} columns, but the forest was trained on {expected}.")]
    WidthMismatch { found: usize, expected: usize },
    #[error("Input contains a non-finite value at row {row}, column {column}.")]
    NonFiniteInput { row: usize, column: usize },
    #[error("Training target {index} is not finite.")]
    NonFiniteTarget { index: usize },
    #[error("Failed to train the random forest: {0}")]
    Fit(String),
    #[error("Random forest prediction failed: {0}")]
    Predict(String),
}

/// Growth parameters for every tree in the forest.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForestParams {
    pub n_trees: usize,
    /// `None` grows each tree until its leaves are pure or too small to split.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<u16>,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    /// Features examined per split. `None` examines all of them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_features: Option<usize>,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_depth: None,
            min_samples_split: 2,
            min_samples_leaf: 1,
            max_features: None,
        }
    }
}

impl ForestParams {
    /// A smaller forest with shallow trees, for compact model files.
    pub fn optimized() -> Self {
        Self {
            n_trees: 50,
            max_depth: Some(10),
            min_samples_split: 10,
            min_samples_leaf: 5,
            max_features: None,
        }
    }

    fn to_smartcore(self, n_features: usize, seed: u64) -> RandomForestRegressorParameters {
        // smartcore samples sqrt(n) features per split unless told otherwise.
        let m = self.max_features.unwrap_or(n_features).clamp(1, n_features);
        let params = RandomForestRegressorParameters::default()
            .with_n_trees(self.n_trees)
            .with_min_samples_split(self.min_samples_split)
            .with_min_samples_leaf(self.min_samples_leaf)
            .with_m(m)
            .with_seed(seed);
        match self.max_depth {
            Some(depth) => params.with_max_depth(depth),
            None => params,
        }
    }
}

/// Copies a matrix into smartcore's layout, rejecting `NaN` and infinities.
pub fn to_dense(x: ArrayView2<f64>) -> Result<DenseMatrix<f64>, ForestError> {
    if let Some(((row, column), _)) = x.indexed_iter().find(|(_, v)| !v.is_finite()) {
        return Err(ForestError::NonFiniteInput { row, column });
    }
    let values: Vec<f64> = x.iter().copied().collect();
    Ok(DenseMatrix::new(x.nrows(), x.ncols(), values, false))
}

/// A fitted forest plus the settings it was grown with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskForest {
    pub n_features: usize,
    pub params: ForestParams,
    pub seed: u64,
    #[serde(with = "embedded_json")]
    regressor: Arc<Forest>,
}

impl RiskForest {
    pub fn fit(
        x: &DenseMatrix<f64>,
        y: &[f64],
        params: ForestParams,
        seed: u64,
    ) -> Result<Self, ForestError> {
        let (rows, columns) = x.shape();
        if params.n_trees == 0 {
            return Err(ForestError::NoTrees);
        }
        if rows != y.len() {
            return Err(ForestError::ShapeMismatch {
                rows,
                targets: y.len(),
            });
        }
        if rows == 0 || columns == 0 {
            return Err(ForestError::EmptyTrainingSet);
        }
        if let Some(index) = y.iter().position(|v| !v.is_finite()) {
            return Err(ForestError::NonFiniteTarget { index });
        }

        log::info!(
            "Growing {} trees on {} rows x {} features (max depth {:?}, min leaf {}).",
            params.n_trees,
            rows,
            columns,
            params.max_depth,
            params.min_samples_leaf
        );

        let regressor: Forest =
            RandomForestRegressor::fit(x, &y.to_vec(), params.to_smartcore(columns, seed))
                .map_err(|e| ForestError::Fit(e.to_string()))?;

        Ok(Self {
            n_features: columns,
            params,
            seed,
            regressor: Arc::new(regressor),
        })
    }

    /// Mean prediction across trees, one value per row.
    pub fn predict(&self, x: &DenseMatrix<f64>) -> Result<Vec<f64>, ForestError> {
        let (rows, columns) = x.shape();
        if columns != self.n_features {
            return Err(ForestError::WidthMismatch {
                found: columns,
                expected: self.n_features,
            });
        }
        if rows == 0 {
            return Ok(Vec::new());
        }
        self.regressor
            .predict(x)
            .map_err(|e| ForestError::Predict(e.to_string()))
    }

    pub fn n_trees(&self) -> usize {
        self.params.n_trees
    }
}

mod embedded_json {
    use super::Forest;
    use serde::de::Error as _;
    use serde::ser::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S: Serializer>(forest: &Arc<Forest>, serializer: S) -> Result<S::Ok, S::Error> {
        let json = serde_json::to_string(&**forest).map_err(S::Error::custom)?;
        serializer.serialize_str(&json)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Arc<Forest>, D::Error> {
        let json = String::deserialize(deserializer)?;
        serde_json::from_str(&json)
            .map(Arc::new)
            .map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, array};
    use std::collections::BTreeSet;

    fn step_data() -> (DenseMatrix<f64>, Vec<f64>) {
        let n = 40;
        let x = Array2::from_shape_fn((n, 2), |(i, j)| if j == 0 { i as f64 } else { (i % 3) as f64 });
        let y = (0..n).map(|i| if i < 20 { 0.2 } else { 0.8 }).collect();
        (to_dense(x.view()).unwrap(), y)
    }

    fn small(n_trees: usize) -> ForestParams {
        ForestParams {
            n_trees,
            ..ForestParams::default()
        }
    }

    #[test]
    fn forest_predictions_stay_within_target_range() {
        let (x, y) = step_data();
        let forest = RiskForest::fit(&x, &y, small(20), 42).unwrap();
        let predictions = forest.predict(&x).unwrap();
        assert_eq!(predictions.len(), 40);
        // The mean of leaf values may round just past the target bounds.
        assert!(predictions.iter().all(|&p| p >= 0.2 - 1e-12 && p <= 0.8 + 1e-12));
        assert!(predictions[0] < 0.3);
        assert!(predictions[39] > 0.7);
    }

    #[test]
    fn training_is_reproducible_for_a_seed() {
        let (x, y) = step_data();
        let a = RiskForest::fit(&x, &y, ForestParams::optimized(), 42).unwrap();
        let b = RiskForest::fit(&x, &y, ForestParams::optimized(), 42).unwrap();
        assert_eq!(a, b);
        let pa = a.predict(&x).unwrap();
        let pb = b.predict(&x).unwrap();
        assert!(pa.iter().zip(&pb).all(|(p, q)| p.to_bits() == q.to_bits()));
    }

    #[test]
    fn depth_limit_bounds_distinct_predictions() {
        let x = Array2::from_shape_fn((200, 1), |(i, _)| i as f64);
        let y: Vec<f64> = (0..200).map(|i| (i as f64 / 10.0).sin()).collect();
        let x = to_dense(x.view()).unwrap();
        let params = ForestParams {
            n_trees: 1,
            max_depth: Some(1),
            ..ForestParams::default()
        };
        let forest = RiskForest::fit(&x, &y, params, 1).unwrap();
        let distinct: BTreeSet<u64> = forest
            .predict(&x)
            .unwrap()
            .iter()
            .map(|p| p.to_bits())
            .collect();
        assert!(distinct.len() <= 2, "{} distinct leaf values", distinct.len());
    }

    #[test]
    fn forest_survives_a_toml_round_trip() {
        let (x, y) = step_data();
        let forest = RiskForest::fit(&x, &y, small(5), 9).unwrap();
        let text = toml::to_string_pretty(&forest).unwrap();
        let restored: RiskForest = toml::from_str(&text).unwrap();
        assert_eq!(restored, forest);
        let before = forest.predict(&x).unwrap();
        let after = restored.predict(&x).unwrap();
        assert!(before.iter().zip(&after).all(|(p, q)| p.to_bits() == q.to_bits()));
    }

    #[test]
    fn predict_rejects_bad_inputs() {
        let (x, y) = step_data();
        let forest = RiskForest::fit(&x, &y, ForestParams::optimized(), 3).unwrap();

        let narrow = to_dense(Array2::<f64>::zeros((1, 1)).view()).unwrap();
        assert!(matches!(
            forest.predict(&narrow),
            Err(ForestError::WidthMismatch { found: 1, expected: 2 })
        ));

        let poisoned = array![[1.0, f64::NAN]];
        assert!(matches!(
            to_dense(poisoned.view()),
            Err(ForestError::NonFiniteInput { row: 0, column: 1 })
        ));
    }

    #[test]
    fn fit_validates_shapes_and_tree_count() {
        let x = to_dense(Array2::<f64>::zeros((3, 2)).view()).unwrap();
        assert!(matches!(
            RiskForest::fit(&x, &[0.0, 0.0], ForestParams::default(), 0),
            Err(ForestError::ShapeMismatch { rows: 3, targets: 2 })
        ));
        assert!(matches!(
            RiskForest::fit(&x, &[0.0; 3], small(0), 0),
            Err(ForestError::NoTrees)
        ));
        assert!(matches!(
            RiskForest::fit(&x, &[0.0, f64::INFINITY, 0.0], small(1), 0),
            Err(ForestError::NonFiniteTarget { index: 1 })
        ));
    }
}
