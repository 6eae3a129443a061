mod archive;
mod config;
mod pipeline;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pipeline::{EvaluateArgs, TrainArgs};

/// aging-gan: unpaired young/old face translation with a CycleGAN.
#[derive(Parser)]
#[command(name = "aging-gan", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands for training and standalone test evaluation.
#[derive(Subcommand)]
enum Command {
    /// Train G/F/DX/DY, keep the checkpoint with the best validation FID.
    Train {
        /// Path to a TOML file with `[model]` and `[data]` overrides.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Dataset root containing `utkface_aligned_cropped/UTKFace`.
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
        /// Directory for checkpoints, samples and metrics.
        #[arg(long, default_value = "outputs")]
        output_dir: PathBuf,
        /// Square image side (multiple of 4). Overrides the TOML value.
        #[arg(long)]
        image_size: Option<u32>,
        /// Initial learning rate for generators.
        #[arg(long, default_value_t = 2e-4)]
        gen_lr: f64,
        /// Initial learning rate for discriminators.
        #[arg(long, default_value_t = 1e-4)]
        disc_lr: f64,
        /// Number of training epochs.
        #[arg(long, default_value_t = 100)]
        num_train_epochs: usize,
        /// Batch size during training.
        #[arg(long, default_value_t = 16)]
        train_batch_size: usize,
        /// Batch size during evaluation.
        #[arg(long, default_value_t = 32)]
        eval_batch_size: usize,
        /// Weight for adversarial loss.
        #[arg(long, default_value_t = 2.0)]
        lambda_adv_value: f64,
        /// Weight for cycle-consistency loss.
        #[arg(long, default_value_t = 4.0)]
        lambda_cyc_value: f64,
        /// Weight for identity loss.
        #[arg(long, default_value_t = 0.5)]
        lambda_id_value: f64,
        /// L2 weight decay for all optimizers.
        #[arg(long, default_value_t = 1e-4)]
        weight_decay: f64,
        /// Seed the whole run for reproducibility.
        #[arg(long)]
        set_seed: bool,
        /// Random seed (always used for the dataset split).
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Log training metrics every N batches.
        #[arg(long, default_value_t = 50)]
        steps_for_logging_metrics: usize,
        /// Number of generated sample images to save per epoch.
        #[arg(long, default_value_t = 10)]
        num_sample_generations_to_save: usize,
        /// Image decoding threads per loader.
        #[arg(long, default_value_t = 3)]
        num_workers: usize,
        /// Skip evaluation on the test split after training.
        #[arg(long)]
        skip_test: bool,
        /// Upload outputs to S3 and terminate this EC2 instance when done.
        #[arg(long)]
        archive_and_terminate_ec2: bool,
        /// S3 bucket for --archive-and-terminate-ec2.
        #[arg(long, default_value = "aging-gan")]
        s3_bucket_name: String,
        /// Write `current.ckpt` every N epochs.
        #[arg(long, default_value_t = 5)]
        checkpoint_every: usize,
        /// Global gradient-norm clipping threshold.
        #[arg(long, default_value_t = 1.0)]
        max_grad_norm: f64,
    },
    /// Evaluate the best checkpoint of a finished run on the test split.
    Evaluate {
        /// Path to a TOML file with `[model]` and `[data]` overrides.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Dataset root containing `utkface_aligned_cropped/UTKFace`.
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
        /// Output directory of the training run.
        #[arg(long, default_value = "outputs")]
        output_dir: PathBuf,
        /// Square image side (multiple of 4). Overrides the TOML value.
        #[arg(long)]
        image_size: Option<u32>,
        /// Batch size during evaluation.
        #[arg(long, default_value_t = 32)]
        eval_batch_size: usize,
        /// Image decoding threads.
        #[arg(long, default_value_t = 3)]
        num_workers: usize,
        /// Seed of the dataset split (must match training).
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Path to write JSON test metrics.
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Train {
            config,
            data_dir,
            output_dir,
            image_size,
            gen_lr,
            disc_lr,
            num_train_epochs,
            train_batch_size,
            eval_batch_size,
            lambda_adv_value,
            lambda_cyc_value,
            lambda_id_value,
            weight_decay,
            set_seed,
            seed,
            steps_for_logging_metrics,
            num_sample_generations_to_save,
            num_workers,
            skip_test,
            archive_and_terminate_ec2,
            s3_bucket_name,
            checkpoint_every,
            max_grad_norm,
        } => pipeline::run_train(TrainArgs {
            config,
            data_dir,
            output_dir,
            image_size,
            gen_lr,
            disc_lr,
            num_train_epochs,
            train_batch_size,
            eval_batch_size,
            lambda_adv_value,
            lambda_cyc_value,
            lambda_id_value,
            weight_decay,
            set_seed,
            seed,
            steps_for_logging_metrics,
            num_sample_generations_to_save,
            num_workers,
            skip_test,
            archive_and_terminate_ec2,
            s3_bucket_name,
            checkpoint_every,
            max_grad_norm,
        }),
        Command::Evaluate {
            config,
            data_dir,
            output_dir,
            image_size,
            eval_batch_size,
            num_workers,
            seed,
            output,
        } => pipeline::run_evaluate(EvaluateArgs {
            config,
            data_dir,
            output_dir,
            image_size,
            eval_batch_size,
            num_workers,
            seed,
            output,
        }),
    }
}
