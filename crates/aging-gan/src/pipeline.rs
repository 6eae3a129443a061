//! Training and evaluation pipelines behind the CLI subcommands.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use burn::backend::{Autodiff, NdArray};
use burn::config::Config;
use cyclegan::training::fid::{FeatureExtractor, FidAccumulator, PooledFeatures};
use cyclegan::training::metrics::MetricsRecord;
use cyclegan::training::run::{
    test_best, write_test_metrics, Archiver, RunData, RunHooks, Terminator,
};
use cyclegan::training::samples::PngSampleWriter;
use cyclegan::training::tracking::{JsonlSink, MultiSink, TracingSink};
use cyclegan::{initialize_environment, run, RunConfig};
use faces::{FaceIndex, Split, UnpairedLoader};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::archive::{Ec2Terminator, S3Archiver};
use crate::config::{build_data_settings, build_model_config, load_optional_toml, DataSettings};

/// Backend used for training (autodiff over ndarray).
pub type TrainBackend = Autodiff<NdArray<f32>>;
/// Backend used for standalone evaluation.
pub type EvalBackend = NdArray<f32>;

/// Arguments for the `train` subcommand.
#[derive(Debug, Clone)]
pub struct TrainArgs {
    pub config: Option<PathBuf>,
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
    pub image_size: Option<u32>,
    pub gen_lr: f64,
    pub disc_lr: f64,
    pub num_train_epochs: usize,
    pub train_batch_size: usize,
    pub eval_batch_size: usize,
    pub lambda_adv_value: f64,
    pub lambda_cyc_value: f64,
    pub lambda_id_value: f64,
    pub weight_decay: f64,
    pub set_seed: bool,
    pub seed: u64,
    pub steps_for_logging_metrics: usize,
    pub num_sample_generations_to_save: usize,
    pub num_workers: usize,
    pub skip_test: bool,
    pub archive_and_terminate_ec2: bool,
    pub s3_bucket_name: String,
    pub checkpoint_every: usize,
    pub max_grad_norm: f64,
}

/// Arguments for the `evaluate` subcommand.
#[derive(Debug, Clone)]
pub struct EvaluateArgs {
    pub config: Option<PathBuf>,
    pub data_dir: PathBuf,
    /// Directory of a finished run (holds `config.json` and `checkpoints/`).
    pub output_dir: PathBuf,
    pub image_size: Option<u32>,
    pub eval_batch_size: usize,
    pub num_workers: usize,
    pub seed: u64,
    /// Where to write the metrics JSON. Defaults to `<output_dir>/metrics/test_metrics.json`.
    pub output: Option<PathBuf>,
}

/// Path of the serialized `RunConfig` inside a run's output directory.
pub fn run_config_path(output_dir: &Path) -> PathBuf {
    output_dir.join("config.json")
}

/// Assemble the run configuration from CLI flags and the TOML model section.
pub fn build_run_config(args: &TrainArgs, model: cyclegan::CycleGanConfig) -> RunConfig {
    RunConfig::new()
        .with_gen_lr(args.gen_lr)
        .with_disc_lr(args.disc_lr)
        .with_num_train_epochs(args.num_train_epochs)
        .with_train_batch_size(args.train_batch_size)
        .with_eval_batch_size(args.eval_batch_size)
        .with_lambda_adv(args.lambda_adv_value)
        .with_lambda_cyc(args.lambda_cyc_value)
        .with_lambda_id(args.lambda_id_value)
        .with_weight_decay(args.weight_decay)
        .with_set_seed(args.set_seed)
        .with_seed(args.seed)
        .with_steps_for_logging_metrics(args.steps_for_logging_metrics)
        .with_num_sample_generations_to_save(args.num_sample_generations_to_save)
        .with_num_workers(args.num_workers)
        .with_do_test(!args.skip_test)
        .with_archive_and_terminate_ec2(args.archive_and_terminate_ec2)
        .with_s3_bucket_name(args.s3_bucket_name.clone())
        .with_output_dir(args.output_dir.to_string_lossy().into_owned())
        .with_checkpoint_every(args.checkpoint_every)
        .with_max_grad_norm(args.max_grad_norm)
        .with_model(model)
}

/// Scan the dataset and build train/valid/test loaders.
///
/// The split is always drawn from `seed`, independent of `--set-seed`.
pub fn build_loaders(
    data_dir: &Path,
    settings: &DataSettings,
    config: &RunConfig,
) -> anyhow::Result<RunData<UnpairedLoader, UnpairedLoader, UnpairedLoader>> {
    let index = FaceIndex::scan(data_dir, &settings.thresholds)
        .with_context(|| format!("Failed to index faces under {}", data_dir.display()))?;
    tracing::info!(
        young = index.young().len(),
        old = index.old().len(),
        "Indexed dataset"
    );

    let size = settings.image_size;
    let workers = config.num_workers;
    let train = UnpairedLoader::train(
        index.split(Split::Train, config.seed),
        size,
        config.train_batch_size,
        workers,
    )?;
    let valid = UnpairedLoader::eval(
        index.split(Split::Valid, config.seed),
        size,
        config.eval_batch_size,
        workers,
    )?;
    let test = UnpairedLoader::eval(
        index.split(Split::Test, config.seed),
        size,
        config.eval_batch_size,
        workers,
    )?;
    tracing::info!(
        train = train.num_items(),
        valid = valid.num_items(),
        test = test.num_items(),
        "Built loaders"
    );
    Ok(RunData { train, valid, test })
}

fn print_metrics(record: &MetricsRecord) {
    for (key, value) in record.iter() {
        println!("  {key}: {value:.4}");
    }
}

/// Train the CycleGAN, checkpoint the best model and optionally test it.
pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    let start = Instant::now();

    // 1. Resolve config
    let toml = load_optional_toml(args.config.as_deref())?;
    let data_settings = build_data_settings(&toml.data, args.image_size)?;
    let config = build_run_config(&args, build_model_config(&toml.model));
    let mut env = initialize_environment::<TrainBackend>(&config);

    // 2. Data first: a missing or one-sided dataset fails before any model exists
    let data = build_loaders(&args.data_dir, &data_settings, &config)?;

    // 3. Persist the resolved config next to the outputs
    std::fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("Failed to create {}", args.output_dir.display()))?;
    let config_path = run_config_path(&args.output_dir);
    config
        .save(&config_path)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;

    // 4. Collaborators
    let mut tracker = MultiSink::new()
        .with(TracingSink::new())
        .with(JsonlSink::create(&args.output_dir.join("metrics.jsonl"))?);
    let mut samples =
        PngSampleWriter::new(config.samples_dir(), config.num_sample_generations_to_save);
    let archiver = S3Archiver;
    let terminator = if config.archive_and_terminate_ec2 {
        Some(Ec2Terminator::new()?)
    } else {
        None
    };
    let hooks = RunHooks {
        tracker: &mut tracker,
        samples: &mut samples,
        archiver: Some(&archiver as &dyn Archiver),
        terminator: terminator.as_ref().map(|t| t as &dyn Terminator),
    };

    // 5. Train
    let extractor = PooledFeatures::default();
    let outcome = run::<TrainBackend, _, _, _, _, _>(
        &config,
        &mut env,
        data,
        &extractor,
        hooks,
        Default::default(),
    )?;

    // 6. Print summary
    let elapsed = start.elapsed();
    println!("\n--- Training Summary ---");
    println!("Run: {}", outcome.run_name);
    println!("Epochs: {}", outcome.epochs);
    match (outcome.best_epoch, outcome.best_fid) {
        (Some(epoch), Some(fid)) => println!("Best val FID: {fid:.4} (epoch {epoch})"),
        _ => println!("Best val FID: none"),
    }
    println!("Checkpoints: {}", outcome.checkpoint_dir.display());
    if let Some(metrics) = &outcome.test_metrics {
        println!("Test metrics ({}):", config.test_metrics_path().display());
        print_metrics(metrics);
    }
    println!("Elapsed: {:.1}s", elapsed.as_secs_f64());

    Ok(())
}

/// Evaluate `best.ckpt` of a finished run on the test split.
pub fn run_evaluate(args: EvaluateArgs) -> anyhow::Result<()> {
    let start = Instant::now();

    let toml = load_optional_toml(args.config.as_deref())?;
    let data_settings = build_data_settings(&toml.data, args.image_size)?;

    // The architecture must match what was trained: prefer the saved run config.
    let saved = run_config_path(&args.output_dir);
    let base = if saved.exists() {
        tracing::info!(path = %saved.display(), "Using saved run config");
        RunConfig::load(&saved)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {e}", saved.display()))?
    } else {
        RunConfig::new().with_model(build_model_config(&toml.model))
    };
    let config = base
        .with_output_dir(args.output_dir.to_string_lossy().into_owned())
        .with_eval_batch_size(args.eval_batch_size)
        .with_num_workers(args.num_workers)
        .with_seed(args.seed);

    let index = FaceIndex::scan(&args.data_dir, &data_settings.thresholds)
        .with_context(|| format!("Failed to index faces under {}", args.data_dir.display()))?;
    let test = UnpairedLoader::eval(
        index.split(Split::Test, config.seed),
        data_settings.image_size,
        config.eval_batch_size,
        config.num_workers,
    )?;

    let extractor = PooledFeatures::default();
    let mut fid = FidAccumulator::new(FeatureExtractor::<EvalBackend>::dim(&extractor));
    let mut rng = StdRng::seed_from_u64(config.seed);
    let device = Default::default();

    let (metrics, epoch) = test_best::<EvalBackend, _, _>(
        &config.model,
        &config.checkpoint_dir(),
        &test,
        &config.loss_weights(),
        &extractor,
        &mut fid,
        &device,
        &mut rng,
    )?;

    let output = args.output.unwrap_or_else(|| config.test_metrics_path());
    write_test_metrics(&output, &metrics)?;

    println!("--- Evaluation Summary ---");
    println!("Checkpoint: {} (epoch {epoch})", config.checkpoint_dir().display());
    println!("Test items: {}", test.num_items());
    print_metrics(&metrics);
    println!("Output: {}", output.display());
    println!("Elapsed: {:.1}s", start.elapsed().as_secs_f64());

    Ok(())
}
