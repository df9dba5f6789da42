// engine/testutil.rs

//! Seeded synthetic tables shared by the unit tests.

use crate::data::{Table, TableRow};
use crate::regressor::ForestParams;
use crate::model::{TrainedModel, TrainingMode, TrainingSettings};
use crate::types::{AssociationRecord, PatientRecord};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const GENDERS: [&str; 2] = ["Female", "Male"];
const BLOOD_GROUPS: [&str; 4] = ["A+", "B+", "O+", "AB-"];
const HISTORIES: [&str; 4] = ["None", "Diabetes", "Obesity", "Asthma"];

pub fn synthetic_table(n: usize, seed: u64) -> Table {
    let mut rng = StdRng::seed_from_u64(seed);
    let rows = (0..n)
        .map(|_| {
            let patient = PatientRecord {
                patient_id: None,
                age: Some(rng.gen_range(20.0..80.0)),
                gender: Some(GENDERS[rng.gen_range(0..GENDERS.len())].to_string()),
                blood_group: Some(BLOOD_GROUPS[rng.gen_range(0..BLOOD_GROUPS.len())].to_string()),
                bmi: Some(rng.gen_range(18.0..40.0)),
                medical_history: Some(HISTORIES[rng.gen_range(0..HISTORIES.len())].to_string()),
            };
            let association = AssociationRecord {
                gene_symbol: Some("BRCA1".to_string()),
                disease_name: Some("Breast cancer".to_string()),
                score: Some(rng.gen_range(0.0..1.0)),
                evidence_strength: Some(rng.gen_range(0.0..1.0)),
                ..AssociationRecord::default()
            };
            TableRow::new(patient, association, None)
        })
        .collect();
    Table::from_rows(rows, false)
}

pub fn small_settings() -> TrainingSettings {
    TrainingSettings {
        standard: ForestParams {
            n_trees: 10,
            ..ForestParams::default()
        },
        optimized: ForestParams {
            n_trees: 10,
            ..ForestParams::optimized()
        },
        ..TrainingSettings::default()
    }
}

pub fn small_model(n: usize) -> TrainedModel {
    TrainedModel::train(&synthetic_table(n, 7), TrainingMode::Optimized, &small_settings())
        .expect("synthetic training succeeds")
}
