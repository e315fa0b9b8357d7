use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use distilkit::logging::init_logging;
use distilkit::models::{check_label_mapping, MeanPoolClassifier, SequenceClassifier, TrainableClassifier};
use distilkit::training::data::{
    comparison_texts, ensure_equivalent, BatchAssembler, DataLoader, DatasetSplits, HfTokenizer,
};
use distilkit::training::{
    evaluate_classifier, CheckpointManager, ClassificationMetrics, DistillationTrainer,
    ExperimentConfig, MetricRecord, TrainingEvent,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{info, warn};

const TOKENIZER_FILE: &str = "tokenizer.json";

#[derive(Parser)]
#[command(name = "distilkit")]
#[command(about = "Knowledge distillation of sequence classifiers", long_about = None)]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true, env = "DISTILKIT_QUIET")]
    quiet: bool,

    /// Emit JSON log lines
    #[arg(long, global = true, env = "DISTILKIT_JSON_LOGS")]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Distil a teacher into a student
    Train {
        /// Experiment configuration (JSON or YAML)
        #[arg(short, long, env = "DISTILKIT_CONFIG")]
        config: PathBuf,

        #[command(flatten)]
        overrides: Overrides,
    },

    /// Evaluate a model directory or checkpoint on one split
    Evaluate {
        /// Experiment configuration (JSON or YAML)
        #[arg(short, long, env = "DISTILKIT_CONFIG")]
        config: PathBuf,

        /// Checkpoint directory whose weights replace the student's
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        /// Split to evaluate
        #[arg(long, default_value = "validation")]
        split: String,
    },

    /// Validate configuration file
    Config {
        /// Configuration file to validate
        #[arg(short, long)]
        file: PathBuf,

        #[command(flatten)]
        overrides: Overrides,
    },

    /// Show system information
    Info,
}

/// Values that take precedence over the configuration file
#[derive(Args, Default)]
struct Overrides {
    /// Number of training epochs
    #[arg(long, env = "DISTILKIT_EPOCHS")]
    epochs: Option<usize>,

    /// Peak learning rate
    #[arg(long, env = "DISTILKIT_LEARNING_RATE")]
    learning_rate: Option<f64>,

    /// Weight of the student's own loss
    #[arg(long, env = "DISTILKIT_ALPHA")]
    alpha: Option<f64>,

    /// Softening temperature
    #[arg(long, env = "DISTILKIT_TEMPERATURE")]
    temperature: Option<f64>,

    /// Seed for shuffling and initialisation
    #[arg(long, env = "DISTILKIT_SEED")]
    seed: Option<u64>,

    /// Directory receiving checkpoints and final weights
    #[arg(long, env = "DISTILKIT_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Delete checkpoints left in the output directory by an earlier run
    #[arg(long, env = "DISTILKIT_OVERWRITE_OUTPUT_DIR")]
    overwrite_output_dir: bool,
}

impl Overrides {
    fn apply(&self, config: &mut ExperimentConfig) {
        if let Some(epochs) = self.epochs {
            config.run.training.num_epochs = epochs;
        }
        if let Some(lr) = self.learning_rate {
            config.run.optimizer.learning_rate = lr;
        }
        if let Some(alpha) = self.alpha {
            config.distillation.alpha = alpha;
        }
        if let Some(temperature) = self.temperature {
            config.distillation.temperature = temperature;
        }
        if let Some(seed) = self.seed {
            config.run.training.seed = seed;
        }
        if let Some(output_dir) = &self.output_dir {
            config.run.checkpointing.output_dir = output_dir.clone();
        }
        if self.overwrite_output_dir {
            config.run.checkpointing.overwrite_output_dir = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Train { config, overrides } => {
            let config = load_config(&config, &overrides)?;
            init_logging(cli.verbose, cli.quiet, cli.json || config.run.logging.json)?;
            train(config).await?;
        }

        Commands::Evaluate { config, checkpoint, split } => {
            let config = load_config(&config, &Overrides::default())?;
            init_logging(cli.verbose, cli.quiet, cli.json || config.run.logging.json)?;
            evaluate(config, checkpoint, &split)?;
        }

        Commands::Config { file, overrides } => {
            init_logging(cli.verbose, cli.quiet, cli.json)?;
            validate_config(&file, &overrides)?;
        }

        Commands::Info => {
            show_system_info();
        }
    }

    Ok(())
}

fn load_config(path: &Path, overrides: &Overrides) -> Result<ExperimentConfig> {
    let mut config = ExperimentConfig::from_file(path)
        .with_context(|| format!("Failed to load configuration file {}", path.display()))?;
    overrides.apply(&mut config);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn train(config: ExperimentConfig) -> Result<()> {
    info!("Starting distillation run");
    let run = &config.run;
    let device = run.runtime.device().context("Failed to open compute device")?;
    let dtype = run.runtime.dtype();

    let student_tokenizer = HfTokenizer::from_file(config.student_model_dir.join(TOKENIZER_FILE))
        .context("Failed to load student tokenizer")?;

    let splits = DatasetSplits::load(&run.data.data_dir, &student_tokenizer, run.data.max_length)
        .context("Failed to load dataset")?;

    let teacher: Option<Box<dyn SequenceClassifier>> = match &config.teacher_model_dir {
        Some(dir) if config.distillation.requires_teacher() => {
            let teacher_tokenizer = HfTokenizer::from_file(dir.join(TOKENIZER_FILE))
                .context("Failed to load teacher tokenizer")?;
            let texts = comparison_texts(&run.data.data_dir, run.data.tokenizer_probe_size)?;
            ensure_equivalent(&teacher_tokenizer, &student_tokenizer, &texts)?;

            let teacher = MeanPoolClassifier::load(dir, &device, dtype, true, run.training.seed)
                .context("Failed to load teacher model")?;
            check_label_mapping(&teacher, &splits.labels)?;
            Some(Box::new(teacher) as Box<dyn SequenceClassifier>)
        }
        Some(_) => {
            warn!("Supervised strategy selected, teacher model is ignored");
            None
        }
        None => None,
    };

    let student = MeanPoolClassifier::load(
        &config.student_model_dir,
        &device,
        dtype,
        false,
        run.training.seed,
    )
    .context("Failed to load student model")?;
    check_label_mapping(&student, &splits.labels)?;
    info!(parameters = student.num_parameters(), "Student ready");

    let num_labels = splits.num_labels();
    let pad = run.data.pad_token_id;
    let train_loader = DataLoader::new(
        &splits.train,
        BatchAssembler::new(run.training.train_batch_size, num_labels, pad, device.clone())?,
        run.training.shuffle,
        run.training.seed,
    )?;
    let eval_assembler = BatchAssembler::new(run.training.eval_batch_size, num_labels, pad, device.clone())?;
    let eval_loader = DataLoader::new(&splits.validation, eval_assembler.clone(), false, run.training.seed)?;
    let test_loader = splits
        .test
        .as_ref()
        .map(|split| DataLoader::new(split, eval_assembler.clone(), false, run.training.seed))
        .transpose()?;

    let total_steps = (run.training.num_epochs * train_loader.num_batches()) as u64;
    let output_dir = run.checkpointing.output_dir.clone();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut trainer = DistillationTrainer::new(
        config.run.clone(),
        config.distillation,
        student,
        teacher,
        train_loader,
        eval_loader,
        Box::new(ClassificationMetrics::new(num_labels)),
    )
    .context("Failed to initialise trainer")?
    .with_event_monitoring(tx);

    let progress = ProgressBar::new(total_steps);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .context("Invalid progress template")?
            .progress_chars("#>-"),
    );

    let monitor = {
        let progress = progress.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    TrainingEvent::StepCompleted { epoch, loss, .. } => {
                        progress.inc(1);
                        progress.set_message(format!("epoch {epoch} loss {loss:.4}"));
                    }
                    TrainingEvent::EvaluationCompleted { epoch, metrics } => {
                        progress.println(format!("epoch {epoch}: {}", format_metrics(&metrics)));
                    }
                    TrainingEvent::CheckpointSaved { path, is_best: true, .. } => {
                        progress.println(format!("new best checkpoint {}", path.display()));
                    }
                    TrainingEvent::Error { error } => {
                        progress.abandon_with_message(error);
                    }
                    _ => {}
                }
            }
        })
    };

    let (outcome, trainer) = tokio::task::spawn_blocking(move || {
        let outcome = trainer.train();
        (outcome, trainer)
    })
    .await
    .context("Training task panicked")?;

    // The trainer owns the only sender; dropping it ends the monitor
    let student = trainer.into_student();
    monitor.await.context("Progress monitor panicked")?;
    progress.finish_and_clear();

    let result = outcome.context("Training failed")?;
    info!(
        best_checkpoint = %result.best_checkpoint.display(),
        best_metric = result.best_metric,
        total_steps = result.total_steps,
        duration_secs = result.duration.as_secs_f64(),
        "Training complete"
    );

    let final_dir = output_dir.join("final");
    let weights = student.save(&final_dir).context("Failed to save final student")?;
    info!("Best student weights saved to: {}", weights.display());

    if let Some(test_loader) = test_loader {
        let record = evaluate_classifier(&student, &test_loader, &ClassificationMetrics::new(num_labels))
            .context("Test evaluation failed")?;
        let path = output_dir.join("test_metrics.json");
        fs::write(&path, serde_json::to_string_pretty(&record)?)
            .context("Failed to write test metrics")?;
        info!("Test metrics: {}", format_metrics(&record));
    }

    Ok(())
}

fn evaluate(config: ExperimentConfig, checkpoint: Option<PathBuf>, split: &str) -> Result<()> {
    let run = &config.run;
    let device = run.runtime.device().context("Failed to open compute device")?;
    let dtype = run.runtime.dtype();

    let tokenizer = HfTokenizer::from_file(config.student_model_dir.join(TOKENIZER_FILE))
        .context("Failed to load student tokenizer")?;
    let splits = DatasetSplits::load(&run.data.data_dir, &tokenizer, run.data.max_length)
        .context("Failed to load dataset")?;

    let selected = match split {
        "train" => &splits.train,
        "validation" => &splits.validation,
        "test" => match &splits.test {
            Some(test) => test,
            None => bail!("dataset has no test split"),
        },
        other => bail!("unknown split '{other}', expected train, validation or test"),
    };

    let mut model = MeanPoolClassifier::load(
        &config.student_model_dir,
        &device,
        dtype,
        checkpoint.is_none(),
        run.training.seed,
    )
    .context("Failed to load student model")?;
    check_label_mapping(&model, &splits.labels)?;

    if let Some(dir) = &checkpoint {
        let meta = CheckpointManager::load_checkpoint(dir)?;
        CheckpointManager::load_weights(dir, model.varmap_mut())?;
        info!(epoch = meta.epoch, global_step = meta.global_step, "Loaded checkpoint {}", dir.display());
    }

    let assembler = BatchAssembler::new(run.training.eval_batch_size, splits.num_labels(), run.data.pad_token_id, device)?;
    let loader = DataLoader::new(selected, assembler, false, run.training.seed)?;
    let record = evaluate_classifier(&model, &loader, &ClassificationMetrics::new(splits.num_labels()))
        .context("Evaluation failed")?;

    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

fn validate_config(path: &Path, overrides: &Overrides) -> Result<()> {
    info!("Validating configuration file: {}", path.display());
    let config = load_config(path, overrides)?;

    info!("✅ Configuration is valid!");
    info!("Configuration summary:");
    info!(
        "  - Strategy: {:?} (alpha {}, temperature {})",
        config.distillation.strategy, config.distillation.alpha, config.distillation.temperature
    );
    info!(
        "  - Epochs: {}, batch size {}/{}",
        config.run.training.num_epochs,
        config.run.training.train_batch_size,
        config.run.training.eval_batch_size
    );
    info!(
        "  - Optimizer: {:?} at {}",
        config.run.optimizer.optimizer_type, config.run.optimizer.learning_rate
    );
    info!(
        "  - Checkpoints: {} (keep {}, best by {})",
        config.run.checkpointing.output_dir.display(),
        config.run.checkpointing.save_total_limit,
        config.run.checkpointing.metric_for_best_model
    );
    info!("  - Student: {}", config.student_model_dir.display());
    if let Some(teacher) = &config.teacher_model_dir {
        info!("  - Teacher: {}", teacher.display());
    }

    Ok(())
}

fn format_metrics(record: &MetricRecord) -> String {
    record
        .iter()
        .map(|(name, value)| format!("{name}={value:.4}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn show_system_info() {
    println!("distilkit - knowledge distillation for sequence classifiers");
    println!();
    println!("Version: {}", distilkit::VERSION);
    println!();
    println!("Hardware support:");

    #[cfg(feature = "cuda")]
    println!("  ✅ NVIDIA CUDA GPU acceleration");
    #[cfg(not(feature = "cuda"))]
    println!("  ❌ CUDA support (not compiled)");

    #[cfg(feature = "metal")]
    println!("  ✅ Apple Metal GPU acceleration");
    #[cfg(not(feature = "metal"))]
    println!("  ❌ Metal support (not compiled)");

    #[cfg(feature = "accelerate")]
    println!("  ✅ Apple Accelerate framework");
    #[cfg(not(feature = "accelerate"))]
    println!("  ❌ Accelerate support (not compiled)");

    println!("  ✅ CPU training");
    println!();
    println!("Usage:");
    println!("  distilkit train -c experiment.yaml --alpha 0.5 --temperature 2.0");
    println!("  distilkit evaluate -c experiment.yaml --checkpoint runs/checkpoint-2 --split test");
    println!("  distilkit config -f experiment.yaml   # Validate configuration");
    println!("  distilkit info                        # Show this information");
}
