// engine/batch.rs

//! # Batch Scoring
//!
//! Scores every row of a table independently. Each row is one patient with a
//! single association taken from the same row.
//!
//! Before scoring, unparseable numeric cells are replaced by the median of
//! their column across the whole batch, so a lone `"N/A"` behaves like a
//! typical value instead of pushing the row off the model tier. Infinite
//! cells are left alone.
//!
//! Output order always matches input order, in sequential and parallel mode.

use crate::codec::{fill_missing, median};
use crate::data::{Table, TableRow};
use crate::estimate::{RiskEngine, assess};
use crate::model::TrainedModel;
use crate::types::{HealthStatus, RiskResult, ScoreSource, default_patient_id};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Failed to write results: {0}")]
    Csv(#[from] csv::Error),
    #[error("Failed to serialize the batch report: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Scores every row, one result per row in input order.
pub fn run_batch(model: Option<&TrainedModel>, table: &Table, parallel: bool) -> Vec<RiskResult> {
    run_batch_with(model, table, parallel, || {})
}

/// As [`run_batch`], calling `on_row` after each row is scored.
pub fn run_batch_with<F>(
    model: Option<&TrainedModel>,
    table: &Table,
    parallel: bool,
    on_row: F,
) -> Vec<RiskResult>
where
    F: Fn() + Sync,
{
    let rows = impute_batch(&table.rows);
    log::info!(
        "Scoring {} rows ({}, model {}).",
        rows.len(),
        if parallel { "parallel" } else { "sequential" },
        if model.is_some() { "loaded" } else { "unavailable" }
    );

    let score = |(index, row): (usize, &TableRow)| {
        let patient_id = row
            .patient
            .patient_id
            .clone()
            .unwrap_or_else(|| default_patient_id(index));
        let result = assess(model, patient_id, &row.patient, std::slice::from_ref(&row.association));
        on_row();
        result
    };

    if parallel {
        rows.par_iter().enumerate().map(score).collect()
    } else {
        rows.iter().enumerate().map(score).collect()
    }
}

impl RiskEngine {
    /// Loads the model if needed and scores the table.
    pub fn run_batch(&mut self, table: &Table, parallel: bool) -> Vec<RiskResult> {
        let model = self.ensure_model();
        run_batch(model, table, parallel)
    }
}

const NUMERIC_FIELDS: usize = 10;

fn numeric_cells(row: &mut TableRow) -> [&mut Option<f64>; NUMERIC_FIELDS] {
    let TableRow {
        patient,
        association,
        ..
    } = row;
    [
        &mut patient.age,
        &mut patient.bmi,
        &mut association.gene_id,
        &mut association.disease_class_encoded,
        &mut association.score,
        &mut association.ei,
        &mut association.combined_score,
        &mut association.evidence_strength,
        &mut association.association_age,
        &mut association.research_activity,
    ]
}

/// Copies the rows with every `NaN` numeric cell replaced by its column's
/// batch median. Columns with no usable value stay `NaN`.
fn impute_batch(rows: &[TableRow]) -> Vec<TableRow> {
    let mut rows = rows.to_vec();
    for field in 0..NUMERIC_FIELDS {
        let mut values: Vec<f64> = rows
            .iter_mut()
            .map(|row| numeric_cells(row)[field].unwrap_or(f64::NAN))
            .collect();
        if !values.iter().any(|v| v.is_nan()) {
            continue;
        }
        let fill = median(&values);
        fill_missing(&mut values, fill);
        for (row, value) in rows.iter_mut().zip(values) {
            // Absent cells stay absent.
            if let Some(cell) = numeric_cells(row).into_iter().nth(field).and_then(Option::as_mut) {
                *cell = value;
            }
        }
    }
    rows
}

/// Counts per health status and score source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub high_risk: usize,
    pub at_risk: usize,
    pub normal: usize,
    pub errors: usize,
    pub by_source: BTreeMap<String, usize>,
    /// Seconds since the Unix epoch.
    pub generated_at: u64,
}

impl BatchSummary {
    pub fn from_results(results: &[RiskResult]) -> Self {
        let count = |status: HealthStatus| results.iter().filter(|r| r.health_status == status).count();
        let mut by_source = BTreeMap::new();
        for result in results {
            *by_source.entry(result.source.to_string()).or_insert(0) += 1;
        }
        let generated_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
        Self {
            total: results.len(),
            high_risk: count(HealthStatus::HighRisk),
            at_risk: count(HealthStatus::AtRisk),
            normal: count(HealthStatus::Normal),
            errors: count(HealthStatus::Error),
            by_source,
            generated_at,
        }
    }

    pub fn from_model(&self) -> usize {
        self.by_source
            .get(&ScoreSource::Model.to_string())
            .copied()
            .unwrap_or(0)
    }
}

#[derive(Serialize)]
struct BatchReport<'a> {
    summary: &'a BatchSummary,
    results: &'a [RiskResult],
}

/// Writes one tab-separated line per result, with a header row.
pub fn write_results<W: Write>(writer: W, results: &[RiskResult]) -> Result<(), BatchError> {
    let mut out = csv::WriterBuilder::new().delimiter(b'\t').from_writer(writer);
    for result in results {
        out.serialize(result)?;
    }
    out.flush()?;
    Ok(())
}

/// Writes the summary and every result as a pretty-printed JSON document.
pub fn write_report<W: Write>(
    writer: W,
    summary: &BatchSummary,
    results: &[RiskResult],
) -> Result<(), BatchError> {
    serde_json::to_writer_pretty(writer, &BatchReport { summary, results })?;
    Ok(())
}
