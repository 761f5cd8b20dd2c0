//! colorizer CLI - colorize grayscale images, or serve colorization over HTTP.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use colorizer::pipeline::DEFAULT_CHECKPOINT;
use colorizer::server::{self, ServerConfig, DEFAULT_LISTEN_ADDR, DEFAULT_MAX_UPLOAD_BYTES};
use colorizer::{Colorizer, Config, LoadPolicy};

/// Colorize grayscale images with a U-Net chrominance predictor.
#[derive(Parser, Debug)]
#[command(name = "colorizer")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Colorize one image file and write a PNG.
    Colorize {
        /// Input image path.
        #[arg(value_name = "INPUT")]
        input: PathBuf,

        /// Output PNG path.
        #[arg(value_name = "OUTPUT")]
        output: PathBuf,

        #[command(flatten)]
        model: ModelArgs,
    },

    /// Serve `POST /colorize` over HTTP.
    Serve {
        /// Address to listen on.
        #[arg(long, env = "COLORIZER_LISTEN_ADDR", default_value = DEFAULT_LISTEN_ADDR)]
        listen: String,

        /// Allowed CORS origin; repeat for several. `*` allows any.
        #[arg(
            long = "allowed-origin",
            env = "COLORIZER_ALLOWED_ORIGINS",
            value_delimiter = ',',
            default_value = "*"
        )]
        allowed_origins: Vec<String>,

        /// Maximum upload size in bytes.
        #[arg(long, env = "COLORIZER_MAX_UPLOAD_BYTES", default_value_t = DEFAULT_MAX_UPLOAD_BYTES)]
        max_upload_bytes: usize,

        #[command(flatten)]
        model: ModelArgs,
    },
}

#[derive(ClapArgs, Debug)]
struct ModelArgs {
    /// Safetensors checkpoint path.
    #[arg(
        long,
        env = "COLORIZER_CHECKPOINT",
        default_value = DEFAULT_CHECKPOINT,
        value_name = "PATH"
    )]
    checkpoint: PathBuf,

    /// Square resolution the network runs at.
    #[arg(long, env = "COLORIZER_IMAGE_SIZE", default_value = "256", value_name = "INT")]
    image_size: u32,

    /// Width of the first encoder stage; must match the checkpoint.
    #[arg(long, env = "COLORIZER_BASE_CHANNELS", default_value = "64", value_name = "INT")]
    base_channels: usize,

    /// Refuse to start when the checkpoint exists but cannot be loaded.
    #[arg(long, env = "COLORIZER_STRICT_CHECKPOINT")]
    strict_checkpoint: bool,

    /// Seed for untrained weights when no checkpoint loads.
    #[arg(long, value_name = "INT")]
    seed: Option<u64>,
}

impl ModelArgs {
    fn config(&self) -> Config {
        Config {
            image_size: self.image_size,
            base_channels: self.base_channels,
            checkpoint: self.checkpoint.clone(),
            load_policy: if self.strict_checkpoint {
                LoadPolicy::Strict
            } else {
                LoadPolicy::Permissive
            },
            seed: self.seed,
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("colorizer={log_level},tower_http={log_level}").into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    if let Err(err) = run(args.command) {
        tracing::error!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Colorize {
            input,
            output,
            model,
        } => {
            // Validate input file exists
            if !input.exists() {
                anyhow::bail!("Input file does not exist: {}", input.display());
            }

            let colorizer =
                Colorizer::new(model.config()).context("Failed to initialize colorizer")?;

            colorizer
                .process(&input, &output)
                .context("Failed to colorize image")?;

            println!("Successfully colorized {} -> {}", input.display(), output.display());
            Ok(())
        }
        Command::Serve {
            listen,
            allowed_origins,
            max_upload_bytes,
            model,
        } => {
            let colorizer =
                Colorizer::new(model.config()).context("Failed to initialize colorizer")?;
            let config = ServerConfig {
                listen_addr: listen,
                allowed_origins,
                max_upload_bytes,
            };

            let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
            runtime
                .block_on(server::serve(colorizer, config))
                .context("Server failed")
        }
    }
}
