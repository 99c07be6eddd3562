use anyhow::Result;
use sky_nowcast::config;
use std::{env, path::PathBuf};
use structopt::StructOpt;
use tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter};

#[derive(Debug, Clone, StructOpt)]
/// Sky camera nowcasting with a weather-conditioned GAN.
pub struct Args {
    #[structopt(long, default_value = "config.json5")]
    pub config: PathBuf,
    #[structopt(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, StructOpt)]
pub enum Command {
    /// Train the networks, resuming from the latest checkpoint of the run.
    Train {
        /// Defaults to a new directory under the configured log_dir.
        #[structopt(long)]
        run_dir: Option<PathBuf>,
    },
    /// Render nowcast montages over the configured lead times.
    Nowcast {
        #[structopt(long)]
        run_dir: PathBuf,
        /// Defaults to the latest checkpoint.
        #[structopt(long)]
        checkpoint: Option<u64>,
    },
    /// Write shuffled pairs of generated and observed images.
    Realism {
        #[structopt(long)]
        run_dir: PathBuf,
        #[structopt(long)]
        checkpoint: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // setup tracing
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true).compact();
    let filter_layer = {
        let filter = EnvFilter::from_default_env();
        if env::var("RUST_LOG").is_err() {
            filter.add_directive(LevelFilter::INFO.into())
        } else {
            filter
        }
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();

    // parse config
    let Args { config, command } = Args::from_args();
    let config = config::Config::load(&config)?;

    match command {
        Command::Train { run_dir } => sky_nowcast::start(config, run_dir).await?,
        Command::Nowcast {
            run_dir,
            checkpoint,
        } => sky_nowcast::nowcast(config, run_dir, checkpoint).await?,
        Command::Realism {
            run_dir,
            checkpoint,
        } => sky_nowcast::realism(config, run_dir, checkpoint).await?,
    }

    Ok(())
}
