use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use half::{bf16, f16};
use log::info;
use num_traits::Float;
use tracing_subscriber::filter::Directive;
use vit_block::{seeded, Block, Mode, ModelConfig, ModelDataType, RandomSource, Tensor};

#[derive(Parser, Debug)]
#[command(name = "vit_cli", version, about = "Inspect, run and initialize ViT encoder blocks.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the parameters of a raw ViT-Base checkpoint.
    Inspect {
        /// Checkpoint prefix, e.g. `dump/blocks.0`.
        #[arg(long)]
        prefix: PathBuf,
    },
    /// Forward a seeded random input through a block.
    Run(RunArgs),
    /// Randomly initialize a block and write it as a raw checkpoint.
    Init {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Load a raw ViT-Base checkpoint from this prefix.
    #[arg(long, conflicts_with = "config", required_unless_present = "config")]
    prefix: Option<PathBuf>,
    /// Randomly initialize from a JSON model config instead.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value_t = 16)]
    tokens: usize,
    #[arg(long, default_value_t = 1)]
    batch: usize,
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// Element type; defaults to the config's dtype.
    #[arg(long)]
    dtype: Option<ModelDataType>,
    /// Run in training mode (dropout and drop path active).
    #[arg(long)]
    train: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vit_block=info".parse::<Directive>().context("invalid log directive")?),
        )
        .init();

    match Cli::parse().command {
        Commands::Inspect { prefix } => inspect(prefix),
        Commands::Run(args) => run(args),
        Commands::Init { config, out, seed } => init(config, out, seed),
    }
}

fn inspect(prefix: PathBuf) -> Result<()> {
    let block = Block::from_checkpoint(&prefix)
        .with_context(|| format!("failed to load checkpoint {}", prefix.display()))?;
    println!("{}", block);
    for param in block.parameters() {
        println!("{:<14} {:?} {}", param.name, param.shape(), param.num_elements());
    }
    println!("total {}", block.num_parameters());
    Ok(())
}

fn run(args: RunArgs) -> Result<()> {
    let mut rng = seeded(args.seed);
    let block = match (&args.prefix, &args.config) {
        (Some(prefix), _) => Block::from_checkpoint(prefix)
            .with_context(|| format!("failed to load checkpoint {}", prefix.display()))?,
        (None, Some(path)) => {
            let config = ModelConfig::from_json_file(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            Block::new(config, &mut rng).context("failed to initialize block")?
        }
        (None, None) => anyhow::bail!("either --prefix or --config is required"),
    };
    let dtype = args.dtype.unwrap_or(block.config().dtype);
    info!(
        "running {} with {:?} on [{}, {}, {}]",
        block,
        dtype,
        block.config().model_dim,
        args.tokens,
        args.batch
    );

    match dtype {
        ModelDataType::F32 => forward_stats(block, &args, &mut rng),
        ModelDataType::F16 => forward_stats(block.cast::<f16>()?, &args, &mut rng),
        ModelDataType::BF16 => forward_stats(block.cast::<bf16>()?, &args, &mut rng),
    }
}

fn forward_stats<T: Float>(block: Block<T>, args: &RunArgs, rng: &mut dyn RandomSource) -> Result<()> {
    let shape = vec![block.config().model_dim, args.tokens, args.batch];
    let input: Tensor<f32> = Tensor::from_fn(shape, |_| rng.next_normal());
    let input = input.cast::<T>()?;

    let mut mode = if args.train { Mode::Train(rng) } else { Mode::Eval };
    let output = block.forward(&[input], &mut mode)?.remove(0);

    let values: Vec<f64> = output.data.iter().map(|v| v.to_f64().unwrap_or(f64::NAN)).collect();
    let n = values.len().max(1) as f64;
    let mean = values.iter().sum::<f64>() / n;
    let std = (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
    println!("output shape {:?} mean {:.6} std {:.6}", output.shape, mean, std);
    Ok(())
}

fn init(config: PathBuf, out: PathBuf, seed: u64) -> Result<()> {
    let config = ModelConfig::from_json_file(&config)
        .with_context(|| format!("failed to read config {}", config.display()))?;
    let block = Block::<f32>::new(config, &mut seeded(seed)).context("failed to initialize block")?;
    block
        .save_checkpoint(&out)
        .with_context(|| format!("failed to write checkpoint {}", out.display()))?;
    println!("wrote {} parameters to {}.*.bin", block.num_parameters(), out.display());
    Ok(())
}
