use std::fs;
use std::process::Command;

use tempfile::tempdir;

fn training_data() -> String {
    let mut text = String::from("age,gender,blood_group,bmi,medical_history,score,evidence_strength\n");
    for i in 0..60 {
        let age = 20 + i;
        let gender = if i % 2 == 0 { "Female" } else { "Male" };
        let bmi = 18.0 + (i % 20) as f64;
        let score = (i % 10) as f64 / 10.0;
        let evidence = ((i * 7) % 10) as f64 / 10.0;
        text.push_str(&format!("{age},{gender},A+,{bmi},None,{score},{evidence}\n"));
    }
    text
}

#[test]
fn train_then_predict_writes_results() {
    let tmp = tempdir().expect("temporary directory");
    let data_dir = tmp.path().join("data");
    fs::create_dir(&data_dir).expect("create data dir");
    fs::write(data_dir.join("ml_training_dataset_1.csv"), training_data()).expect("write corpus");
    fs::write(
        tmp.path().join("genewell.toml"),
        "[training.optimized]\nn_trees = 5\nmax_depth = 6\nmin_samples_split = 4\nmin_samples_leaf = 2\n",
    )
    .expect("write config");

    let exe = env!("CARGO_BIN_EXE_genewell");
    let status = Command::new(exe)
        .current_dir(tmp.path())
        .args(["--config", "genewell.toml", "train", "--optimized"])
        .status()
        .expect("run genewell train");
    assert!(status.success(), "train exited with status {status:?}");
    assert!(tmp.path().join("personalized_model.toml").exists());

    fs::write(
        tmp.path().join("patients.csv"),
        "patient_id,age,gender,blood_group,bmi,medical_history,score,evidence_strength\n\
         A,45,Female,A+,26.5,None,0.85,0.9\n\
         B,70,Male,B-,N/A,Diabetes,0.4,0.3\n",
    )
    .expect("write input");

    let status = Command::new(exe)
        .current_dir(tmp.path())
        .args(["predict", "patients.csv", "--json", "report.json"])
        .status()
        .expect("run genewell predict");
    assert!(status.success(), "predict exited with status {status:?}");

    let predictions = fs::read_to_string(tmp.path().join("predictions.tsv")).expect("predictions");
    let lines: Vec<&str> = predictions.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("patient_id\trisk_score"));
    assert!(lines[1].starts_with("A\t"));
    assert!(lines[2].starts_with("B\t"));

    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(tmp.path().join("report.json")).expect("report"))
            .expect("valid json");
    assert_eq!(report["summary"]["total"], 2);
    assert_eq!(report["summary"]["errors"], 0);

    let output = Command::new(exe)
        .current_dir(tmp.path())
        .arg("info")
        .output()
        .expect("run genewell info");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Trees: 5"), "unexpected info output: {stdout}");
}

#[test]
fn predict_without_a_model_uses_heuristics() {
    let tmp = tempdir().expect("temporary directory");
    fs::write(
        tmp.path().join("patients.csv"),
        "age,gender,blood_group,bmi,medical_history,gene_symbol,score,evidence_strength\n\
         45,Female,A+,26.5,None,BRCA1,0.85,0.9\n",
    )
    .expect("write input");

    let exe = env!("CARGO_BIN_EXE_genewell");
    let status = Command::new(exe)
        .current_dir(tmp.path())
        .args(["predict", "patients.csv", "--output", "out.tsv"])
        .status()
        .expect("run genewell predict");
    assert!(status.success());

    let out = fs::read_to_string(tmp.path().join("out.tsv")).expect("output");
    let row = out.lines().nth(1).expect("one result row");
    let fields: Vec<&str> = row.split('\t').collect();
    assert_eq!(fields[0], "P0000");
    assert_eq!(fields[3], "At Risk");
    assert_eq!(fields[5], "weighted_heuristic");
}

#[test]
fn detail_lists_associations_by_risk() {
    let tmp = tempdir().expect("temporary directory");
    fs::write(
        tmp.path().join("patient.csv"),
        "age,gender,bmi,medical_history,gene_symbol,disease_name,score,evidence_strength\n\
         50,Female,27,None,APOE,Alzheimer disease,0.2,0.1\n\
         50,Female,27,None,BRCA1,Breast cancer,0.9,0.8\n",
    )
    .expect("write input");

    let output = Command::new(env!("CARGO_BIN_EXE_genewell"))
        .current_dir(tmp.path())
        .args(["detail", "patient.csv"])
        .output()
        .expect("run genewell detail");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let brca = stdout.find("BRCA1").expect("BRCA1 row");
    let apoe = stdout.find("APOE").expect("APOE row");
    assert!(brca < apoe, "rows not sorted by risk: {stdout}");
}

#[test]
fn missing_input_exits_with_an_error() {
    let tmp = tempdir().expect("temporary directory");
    let output = Command::new(env!("CARGO_BIN_EXE_genewell"))
        .current_dir(tmp.path())
        .args(["predict", "absent.csv"])
        .output()
        .expect("run genewell predict");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Error:"));
}
