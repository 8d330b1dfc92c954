use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use modelwright::generation::GenerationOptions;
use modelwright::logging;
use modelwright::tasks::{vectorisation, ModelRegistry};
use modelwright::{
    Config, Device, LocalClassifier, LocalGenerator, OneOrMany, TextClassification,
    TextGeneration, TextVectorisation,
};
use std::path::PathBuf;
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "modelwright")]
#[command(version, about = "Run and finetune pretrained sequence models", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,

    /// Configuration file (JSON or YAML), layered under MODELWRIGHT__* variables
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate text continuations
    Generate {
        /// Input texts; more than one is sent as a list
        #[arg(required = true)]
        text: Vec<String>,

        #[command(flatten)]
        target: TargetArgs,

        #[command(flatten)]
        options: GenerationArgs,
    },

    /// Score candidate labels for a text
    Classify {
        text: String,

        /// Comma separated candidate labels
        #[arg(short, long, value_delimiter = ',', required = true)]
        labels: Vec<String>,

        #[command(flatten)]
        target: TargetArgs,
    },

    /// Embed texts
    Vectorise {
        #[arg(required = true)]
        text: Vec<String>,

        #[command(flatten)]
        target: TargetArgs,
    },

    /// Print the decoding configuration the given options resolve to
    Resolve {
        #[command(flatten)]
        options: GenerationArgs,
    },

    /// Validate a configuration file
    Config {
        /// Configuration file to validate
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Show build and device information
    Info,
}

#[derive(Args)]
struct TargetArgs {
    /// Run a local model instead of calling the API
    #[arg(long)]
    local: bool,

    /// Local registry key or API model name
    #[arg(short, long)]
    model: Option<String>,

    /// API key sent with remote requests
    #[arg(long, env = "MODELWRIGHT_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
}

#[derive(Args)]
struct GenerationArgs {
    #[arg(long)]
    min_length: Option<usize>,
    #[arg(long)]
    max_length: Option<usize>,
    #[arg(long)]
    temperature: Option<f64>,
    #[arg(long)]
    top_k: Option<usize>,
    #[arg(long)]
    top_p: Option<f64>,
    #[arg(long)]
    repetition_penalty: Option<f64>,
    #[arg(long)]
    length_penalty: Option<f64>,
    #[arg(long)]
    num_beams: Option<usize>,
    /// Sequences returned per input
    #[arg(short = 'n', long)]
    num_generations: Option<usize>,
    #[arg(long)]
    do_sample: Option<bool>,
}

impl From<GenerationArgs> for GenerationOptions {
    fn from(args: GenerationArgs) -> Self {
        Self {
            min_length: args.min_length,
            max_length: args.max_length,
            temperature: args.temperature,
            top_k: args.top_k,
            top_p: args.top_p,
            repetition_penalty: args.repetition_penalty,
            length_penalty: args.length_penalty,
            num_beams: args.num_beams,
            num_return_sequences: None,
            num_generations: args.num_generations,
            do_sample: args.do_sample,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose, cli.quiet, cli.json)?;

    if let Err(e) = run(cli).await {
        logging::error(&format!("{:#}", e));
        std::process::exit(1);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Generate {
            text,
            target,
            options,
        } => {
            let mut config = load_config(cli.config.as_ref())?;
            target.apply(&mut config, |tasks, model| tasks.generation_model = model);
            // No local generators ship with the binary; library callers register their own.
            let registry: ModelRegistry<dyn LocalGenerator> =
                ModelRegistry::new(modelwright::tasks::generation::DEFAULT_LOCAL_MODEL);
            let facade = TextGeneration::from_config(&config, &registry)
                .context("Failed to set up text generation")?;

            let output = facade
                .generate(&into_input(text), &options.into())
                .await
                .context("Generation failed")?;
            print_json(&output)
        }

        Commands::Classify {
            text,
            labels,
            target,
        } => {
            let mut config = load_config(cli.config.as_ref())?;
            target.apply(&mut config, |tasks, model| tasks.classification_model = model);
            let registry: ModelRegistry<dyn LocalClassifier> =
                ModelRegistry::new(modelwright::tasks::classification::DEFAULT_LOCAL_MODEL);
            let facade = TextClassification::from_config(&config, &registry)
                .context("Failed to set up text classification")?;

            let output = facade
                .classify(&OneOrMany::One(text), &OneOrMany::One(labels))
                .await
                .context("Classification failed")?;
            print_json(&output)
        }

        Commands::Vectorise { text, target } => {
            let mut config = load_config(cli.config.as_ref())?;
            target.apply(&mut config, |tasks, model| tasks.vectorisation_model = model);
            let facade = TextVectorisation::from_config(&config, &vectorisation::default_registry())
                .context("Failed to set up text vectorisation")?;

            let output = facade
                .vectorise(&into_input(text))
                .await
                .context("Vectorisation failed")?;
            print_json(&output)
        }

        Commands::Resolve { options } => {
            let options: GenerationOptions = options.into();
            let resolved = options.resolve().context("Invalid generation options")?;
            print_json(&resolved)
        }

        Commands::Config { file } => validate_config(file),

        Commands::Info => {
            show_system_info();
            Ok(())
        }
    }
}

impl TargetArgs {
    fn apply(
        self,
        config: &mut Config,
        set_model: impl FnOnce(&mut modelwright::config::TaskConfig, Option<String>),
    ) {
        if self.local {
            config.tasks.local = true;
        }
        if self.model.is_some() {
            set_model(&mut config.tasks, self.model);
        }
        if self.api_key.is_some() {
            config.api.api_key = self.api_key;
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let config = Config::load(path.map(PathBuf::as_path)).context("Failed to load configuration")?;
    debug!("Configuration: {:?}", config.tasks);
    Ok(config)
}

fn into_input(mut text: Vec<String>) -> OneOrMany<String> {
    match text.len() {
        1 => OneOrMany::One(text.remove(0)),
        _ => OneOrMany::Many(text),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", rendered);
    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    info!("Validating configuration file: {}", config_path.display());

    let config = Config::from_file(&config_path).context("Failed to load configuration file")?;

    logging::success("Configuration is valid");
    println!("  device:          {:?} -> {}", config.device.preference, config.device.resolve());
    println!("  validation split: {}", config.finetune.validation_split);
    println!("  epochs:          {}", config.finetune.epochs);
    match config.finetune.batch_size {
        Some(size) => println!("  batch size:      {}", size),
        None => println!("  batch size:      searched (starting at {})", config.finetune.probe.initial),
    }
    println!("  api:             {}", config.api.base_url);
    if config.api.api_key.is_none() && !config.tasks.local {
        logging::warning("No API key configured; remote calls may be rejected");
    }
    Ok(())
}

fn show_system_info() {
    println!("modelwright {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Host:");
    println!("  CPU cores:       {}", num_cpus::get());
    println!("  default device:  {}", Device::auto());
    println!();
    println!("Backends:");

    #[cfg(feature = "cuda")]
    println!("  CUDA:            compiled");
    #[cfg(not(feature = "cuda"))]
    println!("  CUDA:            not compiled");

    #[cfg(feature = "metal")]
    println!("  Metal:           compiled");
    #[cfg(not(feature = "metal"))]
    println!("  Metal:           not compiled");

    #[cfg(feature = "accelerate")]
    println!("  Accelerate:      compiled");
    #[cfg(not(feature = "accelerate"))]
    println!("  Accelerate:      not compiled");

    println!();
    println!("Finetunable generation models: {}", modelwright::generation::FINETUNABLE_MODELS.join(", "));
}
