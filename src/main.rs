use clap::{Parser, Subcommand, ValueEnum};
use env_logger::Env;
use oncoembed::config::PipelineConfig;
use oncoembed::pipeline::{GenerateOptions, Modality, Pipeline, PipelineError};
use oncoembed::trainer::{LogisticReadout, TrainContext};
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(
    name = "oncoembed",
    about = "Clinical and image embedding pipeline for tumour progression studies",
    version
)]
struct Cli {
    /// TOML config file; built-in defaults are used when absent.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load raw inputs, split them, and persist embedding artifacts.
    GenerateData {
        /// Which modality to embed.
        #[arg(long, value_enum, default_value_t = DataType::Both)]
        data_type: DataType,
        /// Reuse artifacts already on disk instead of regenerating them.
        #[arg(long)]
        use_pregen: bool,
    },
    /// Fit the downstream model on the persisted train artifacts.
    Train {
        /// Epoch to resume from, forwarded to the trainer.
        #[arg(long)]
        resume_epoch: Option<usize>,
    },
    /// Evaluate the persisted model on the test artifacts.
    Test,
    /// Run k-fold cross-validation over the full clinical population.
    CrossValidate {
        /// Number of folds; defaults to the configured value.
        #[arg(long)]
        folds: Option<usize>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DataType {
    Clinical,
    Image,
    Both,
}

impl From<DataType> for Modality {
    fn from(value: DataType) -> Self {
        match value {
            DataType::Clinical => Modality::Clinical,
            DataType::Image => Modality::Image,
            DataType::Both => Modality::Both,
        }
    }
}

fn run(cli: Cli) -> Result<(), PipelineError> {
    let config = match &cli.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    let pipeline = Pipeline::new(config)?;
    let trainer_config = pipeline.config().trainer.clone();
    let folds_default = pipeline.config().folds;

    match cli.command {
        Command::GenerateData {
            data_type,
            use_pregen,
        } => pipeline.generate_data(GenerateOptions {
            modality: data_type.into(),
            use_pregen,
        }),
        Command::Train { resume_epoch } => {
            let mut readout =
                LogisticReadout::new(trainer_config.epochs, trainer_config.learning_rate);
            let ctx = TrainContext {
                config_path: cli.config,
                resume_epoch,
            };
            pipeline.train(&mut readout, &ctx)
        }
        Command::Test => {
            let readout =
                LogisticReadout::new(trainer_config.epochs, trainer_config.learning_rate);
            pipeline.test(&readout, &TrainContext::default())?;
            Ok(())
        }
        Command::CrossValidate { folds } => {
            let readout =
                LogisticReadout::new(trainer_config.epochs, trainer_config.learning_rate);
            pipeline.cross_validate(&readout, folds.unwrap_or(folds_default))?;
            Ok(())
        }
    }
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
