#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::fs::File;
use std::io::{BufWriter, IsTerminal};
use std::path::PathBuf;
use std::process;

use genewell::batch::{BatchSummary, run_batch_with, write_report, write_results};
use genewell::data::{discover_training_corpus, load_table};
use genewell::types::default_patient_id;
use genewell::{EngineConfig, RiskEngine, TrainOutcome, TrainingMode};

#[derive(Args)]
pub struct TrainArgs {
    /// Training CSV (optionally .gz). Defaults to the newest dataset in the data directory.
    pub training_data: Option<PathBuf>,

    /// Grow a smaller forest (50 trees, depth 10) for a compact model file
    #[arg(long)]
    pub optimized: bool,

    /// Retrain even if a saved model already exists
    #[arg(long)]
    pub force: bool,
}

#[derive(Args)]
pub struct PredictArgs {
    /// CSV/TSV file with one patient-association pair per row
    pub input: PathBuf,

    /// Where to write the per-row results
    #[arg(long, default_value = "predictions.tsv")]
    pub output: PathBuf,

    /// Also write a JSON report with summary counts
    #[arg(long, value_name = "PATH")]
    pub json: Option<PathBuf>,

    /// Score rows in parallel
    #[arg(long)]
    pub parallel: bool,
}

#[derive(Args)]
pub struct DetailArgs {
    /// CSV/TSV file describing one patient; every row contributes an association
    pub input: PathBuf,
}

#[derive(Parser)]
#[command(
    name = "genewell",
    about = "Personalized gene-disease risk scoring",
    long_about = "Trains a regression forest on gene-disease association data and scores \
                 patients with it, falling back to closed-form heuristics when the model \
                 cannot be used."
)]
struct Cli {
    /// Optional TOML configuration file
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Train and save a risk model
    #[command(about = "Train a risk model (outputs: personalized_model.toml)")]
    Train(TrainArgs),

    /// Score every row of a file
    #[command(about = "Score patients in batch (outputs: predictions.tsv)")]
    Predict(PredictArgs),

    /// Per-association risk breakdown for one patient
    #[command(about = "Show the per-association risk breakdown for one patient")]
    Detail(DetailArgs),

    /// Describe the saved model
    #[command(about = "Show information about the saved model")]
    Info,

    /// Display version information
    #[command(about = "Display version information")]
    Version,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { config, command } = Cli::parse();

    let result = match command {
        Some(Commands::Train(args)) => train(config, args),
        Some(Commands::Predict(args)) => predict(config, args),
        Some(Commands::Detail(args)) => detail(config, args),
        Some(Commands::Info) => info(config),
        Some(Commands::Version) => {
            print_version_info();
            Ok(())
        }
        None => Cli::command()
            .print_help()
            .map(|()| println!())
            .map_err(|e| Box::new(e) as Box<dyn std::error::Error>),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn load_config(path: Option<PathBuf>) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    Ok(EngineConfig::load_or_default(path.as_deref())?)
}

fn create_progress_bar(len: u64, message: &str) -> Result<ProgressBar, Box<dyn std::error::Error>> {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    pb.set_style(
        ProgressStyle::with_template("> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("█▉▊▋▌▍▎▏  "),
    );
    pb.set_message(message.to_string());
    Ok(pb)
}

pub fn train(config: Option<PathBuf>, args: TrainArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config)?;
    let mode = if args.optimized {
        TrainingMode::Optimized
    } else {
        TrainingMode::Standard
    };
    let mut engine = RiskEngine::new(config.store());

    let corpus = || {
        let path = match &args.training_data {
            Some(path) => path.clone(),
            None => discover_training_corpus(&config.data_dir, &config.corpus_prefix)?,
        };
        println!("Loading training data from: {}", path.display());
        load_table(&path)
    };

    match engine.train_or_load(corpus, mode, &config.training, args.force)? {
        TrainOutcome::Loaded(tier) => {
            println!(
                "Found an existing model at {} ({tier}); use --force to retrain.",
                engine.store().path().display()
            );
        }
        TrainOutcome::Trained(files) => {
            for file in &files {
                println!(
                    "Model saved to: {} ({} bytes, {})",
                    file.path.display(),
                    file.bytes,
                    file.tier
                );
            }
        }
    }

    if let Some(model) = engine.model() {
        println!(
            "Held-out R²: {:.4}  RMSE: {:.4}  ({} train / {} test rows)",
            model.metrics.r2, model.metrics.rmse, model.metrics.n_train, model.metrics.n_test
        );
    }
    Ok(())
}

pub fn predict(config: Option<PathBuf>, args: PredictArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config)?;
    let mut engine = RiskEngine::new(config.store());

    let table = load_table(&args.input)?;
    println!("Loaded {} rows from {}", table.len(), args.input.display());

    let pb = create_progress_bar(table.len() as u64, "scoring")?;
    let model = engine.ensure_model();
    let results = run_batch_with(model, &table, args.parallel, || pb.inc(1));
    pb.finish_and_clear();

    write_results(BufWriter::new(File::create(&args.output)?), &results)?;
    println!("Predictions written to: {}", args.output.display());

    let summary = BatchSummary::from_results(&results);
    println!(
        "{} patients: {} High Risk, {} At Risk, {} Normal, {} Error ({} scored by the model)",
        summary.total,
        summary.high_risk,
        summary.at_risk,
        summary.normal,
        summary.errors,
        summary.from_model()
    );

    if let Some(path) = &args.json {
        write_report(BufWriter::new(File::create(path)?), &summary, &results)?;
        println!("Report written to: {}", path.display());
    }
    Ok(())
}

pub fn detail(config: Option<PathBuf>, args: DetailArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config)?;
    let mut engine = RiskEngine::new(config.store());

    let table = load_table(&args.input)?;
    let Some(first) = table.rows.first() else {
        return Err(format!("'{}' contains no rows.", args.input.display()).into());
    };
    let patient = first.patient.clone();
    let associations: Vec<_> = table.rows.iter().map(|row| row.association.clone()).collect();
    let patient_id = patient
        .patient_id
        .clone()
        .unwrap_or_else(|| default_patient_id(0));

    let overall = engine.assess(patient_id, &patient, &associations);
    println!(
        "Patient {}: {:.4} ({}, {}) from {}",
        overall.patient_id, overall.risk_score, overall.risk_level, overall.health_status, overall.source
    );
    if let Some(error) = &overall.error {
        println!("  {error}");
    }

    println!("gene_symbol\tdisease_name\tpredicted_risk\trisk_level\thealth_status\tsource");
    for risk in engine.detailed(&patient, &associations) {
        println!(
            "{}\t{}\t{:.4}\t{}\t{}\t{}",
            risk.gene_symbol,
            risk.disease_name,
            risk.predicted_risk,
            risk.risk_level,
            risk.health_status,
            risk.source
        );
    }
    Ok(())
}

pub fn info(config: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config)?;
    let mut engine = RiskEngine::new(config.store());
    let Some(info) = engine.info() else {
        println!(
            "No usable model found at {}. Scores will come from the heuristics.",
            engine.store().path().display()
        );
        return Ok(());
    };

    if let Some(tier) = info.loaded_from {
        println!("Loaded from: {tier} file");
    }
    println!("Training mode: {}", info.mode);
    println!("Features ({}): {}", info.n_features, info.feature_names.join(", "));
    println!("Categorical encoders: {}", info.categorical_encoders);
    match info.max_depth {
        Some(depth) => println!("Trees: {} (max depth {depth})", info.n_trees),
        None => println!("Trees: {} (unlimited depth)", info.n_trees),
    }
    println!(
        "Held-out R²: {:.4}  RMSE: {:.4}  ({} train / {} test rows)",
        info.metrics.r2, info.metrics.rmse, info.metrics.n_train, info.metrics.n_test
    );
    Ok(())
}

fn print_version_info() {
    println!("genewell {}", env!("CARGO_PKG_VERSION"));
    match option_env!("GENEWELL_RELEASE_TAG") {
        Some(tag) => println!("Release: {tag}"),
        None => println!("Release: development build"),
    }
}
