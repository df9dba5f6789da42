// engine/data.rs

//! # Tabular Input
//!
//! Reads patient/association tables from delimited text and turns each row
//! into a [`PatientRecord`] joined with a single [`AssociationRecord`].
//!
//! Loading is deliberately permissive:
//!
//! - Every column is read as text and coerced here, so a stray `"N/A"` never
//!   fails the whole file. Unparseable numeric cells become `NaN`.
//! - Missing columns are tolerated and extra columns are ignored. Which known
//!   columns were present is recorded on the [`Table`].
//! - Files ending in `.gz` are decompressed first; `.tsv` files use tabs.

use crate::codec::{FeatureRow, Feature};
use crate::types::{AssociationRecord, PatientRecord};
use flate2::read::MultiGzDecoder;
use polars::prelude::*;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;

/// Column holding the training target.
pub const TARGET_COLUMN: &str = "personalized_risk_score";

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "No training dataset named '{prefix}*.csv' or '{prefix}*.csv.gz' was found in '{}'.",
        dir.display()
    )]
    NoTrainingCorpus { dir: PathBuf, prefix: String },
    #[error("The training directory '{}' does not exist.", .0.display())]
    MissingDirectory(PathBuf),
}

/// One input row: the patient, the association from the same row, and the
/// target cell when the table has one.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRow {
    pub patient: PatientRecord,
    pub association: AssociationRecord,
    pub target: Option<f64>,
}

impl TableRow {
    pub fn new(patient: PatientRecord, association: AssociationRecord, target: Option<f64>) -> Self {
        Self {
            patient,
            association,
            target,
        }
    }

    pub fn features(&self) -> FeatureRow<'_> {
        FeatureRow::join(&self.patient, &self.association)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Table {
    pub rows: Vec<TableRow>,
    /// Known feature columns present in the source.
    pub columns: BTreeSet<Feature>,
    pub has_target: bool,
}

impl Table {
    /// Builds a table from in-memory rows. A feature counts as present when
    /// at least one row carries it.
    pub fn from_rows(rows: Vec<TableRow>, has_target: bool) -> Self {
        let columns = Feature::CANDIDATES
            .into_iter()
            .filter(|&feature| rows.iter().any(|row| row.features().has(feature)))
            .collect();
        Self {
            rows,
            columns,
            has_target,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Coerces one text cell to a number. Empty and unparseable cells are `NaN`.
pub fn parse_numeric(cell: Option<&str>) -> f64 {
    cell.map(str::trim)
        .filter(|text| !text.is_empty())
        .and_then(|text| text.parse::<f64>().ok())
        .unwrap_or(f64::NAN)
}

fn parse_label(cell: Option<&str>) -> Option<String> {
    cell.map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

fn read_source(path: &Path) -> Result<Vec<u8>, DataError> {
    let file = File::open(path)?;
    let mut reader: Box<dyn Read> = if path.extension().is_some_and(|ext| ext == "gz") {
        Box::new(MultiGzDecoder::new(file))
    } else {
        Box::new(file)
    };
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    Ok(bytes)
}

fn separator_for(path: &Path) -> u8 {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let name = name.strip_suffix(".gz").unwrap_or(&name);
    if name.ends_with(".tsv") { b'\t' } else { b',' }
}

/// Reads a delimited file into a [`Table`].
pub fn load_table(path: &Path) -> Result<Table, DataError> {
    log::info!("Loading data from '{}'", path.display());
    let bytes = read_source(path)?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        log::warn!("'{}' is empty.", path.display());
        return Ok(Table::default());
    }

    let df = CsvReader::new(Cursor::new(bytes))
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_infer_schema_length(Some(0))
                .with_parse_options(CsvParseOptions::default().with_separator(separator_for(path))),
        )
        .finish()?;

    let table = table_from_frame(&df)?;
    log::info!(
        "Loaded {} rows with {} recognised feature columns{}.",
        table.len(),
        table.columns.len(),
        if table.has_target { " and a target column" } else { "" }
    );
    Ok(table)
}

fn has_column(df: &DataFrame, name: &str) -> bool {
    df.get_column_names().iter().any(|column| column.as_str() == name)
}

fn numeric_column(df: &DataFrame, name: &str) -> Result<Option<Vec<f64>>, DataError> {
    if !has_column(df, name) {
        return Ok(None);
    }
    let values = df.column(name)?.str()?.into_iter().map(parse_numeric).collect();
    Ok(Some(values))
}

fn label_column(df: &DataFrame, name: &str) -> Result<Option<Vec<Option<String>>>, DataError> {
    if !has_column(df, name) {
        return Ok(None);
    }
    let values = df.column(name)?.str()?.into_iter().map(parse_label).collect();
    Ok(Some(values))
}

fn table_from_frame(df: &DataFrame) -> Result<Table, DataError> {
    let n = df.height();

    let patient_id = label_column(df, "patient_id")?;
    let age = numeric_column(df, "age")?;
    let gender = label_column(df, "gender")?;
    let blood_group = label_column(df, "blood_group")?;
    let bmi = numeric_column(df, "bmi")?;
    let medical_history = label_column(df, "medical_history")?;

    let gene_id = numeric_column(df, "gene_id")?;
    let gene_symbol = label_column(df, "gene_symbol")?;
    let disease_name = label_column(df, "disease_name")?;
    let disease_class_encoded = numeric_column(df, "disease_class_encoded")?;
    let score = numeric_column(df, "score")?;
    let ei = numeric_column(df, "ei")?;
    let combined_score = numeric_column(df, "combined_score")?;
    let evidence_strength = numeric_column(df, "evidence_strength")?;
    let association_age = numeric_column(df, "association_age")?;
    let research_activity = numeric_column(df, "research_activity")?;
    let target = numeric_column(df, TARGET_COLUMN)?;

    let num = |column: &Option<Vec<f64>>, i: usize| column.as_ref().map(|values| values[i]);
    let text = |column: &Option<Vec<Option<String>>>, i: usize| {
        column.as_ref().and_then(|values| values[i].clone())
    };

    let rows = (0..n)
        .map(|i| {
            let patient = PatientRecord {
                patient_id: text(&patient_id, i),
                age: num(&age, i),
                gender: text(&gender, i),
                blood_group: text(&blood_group, i),
                bmi: num(&bmi, i),
                medical_history: text(&medical_history, i),
            };
            let association = AssociationRecord {
                gene_id: num(&gene_id, i),
                gene_symbol: text(&gene_symbol, i),
                disease_name: text(&disease_name, i),
                disease_class_encoded: num(&disease_class_encoded, i),
                score: num(&score, i),
                ei: num(&ei, i),
                combined_score: num(&combined_score, i),
                evidence_strength: num(&evidence_strength, i),
                association_age: num(&association_age, i),
                research_activity: num(&research_activity, i),
            };
            TableRow::new(patient, association, num(&target, i))
        })
        .collect();

    let columns = Feature::CANDIDATES
        .into_iter()
        .filter(|feature| has_column(df, feature.name()))
        .collect();

    Ok(Table {
        rows,
        columns,
        has_target: target.is_some(),
    })
}

/// Finds the newest `<prefix>*.csv.gz` in `dir`, falling back to the newest
/// `<prefix>*.csv` when no compressed dataset exists.
pub fn discover_training_corpus(dir: &Path, prefix: &str) -> Result<PathBuf, DataError> {
    if !dir.is_dir() {
        return Err(DataError::MissingDirectory(dir.to_path_buf()));
    }

    let mut compressed: Vec<(SystemTime, PathBuf)> = Vec::new();
    let mut plain: Vec<(SystemTime, PathBuf)> = Vec::new();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(prefix) {
            continue;
        }
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        // Not every filesystem records a creation time.
        let stamp = metadata
            .created()
            .or_else(|_| metadata.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        if name.ends_with(".csv.gz") {
            compressed.push((stamp, entry.path()));
        } else if name.ends_with(".csv") {
            plain.push((stamp, entry.path()));
        }
    }

    let pool = if compressed.is_empty() { plain } else { compressed };
    let newest = pool
        .into_iter()
        .max_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)))
        .map(|(_, path)| path)
        .ok_or_else(|| DataError::NoTrainingCorpus {
            dir: dir.to_path_buf(),
            prefix: prefix.to_string(),
        })?;

    log::info!("Using training dataset '{}'", newest.display());
    Ok(newest)
}
