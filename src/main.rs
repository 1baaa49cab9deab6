use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use fbflow::config::FlowConfig;
use fbflow::flow::Flow;
use fbflow::logger::init_tracing;
use fbflow::orchestrator::{RunOptions, run};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "fbflow",
    about = "Runs flow-based programs of channel and component processes",
    version = "0.1.0"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a flow until all of its sinks have finished
    Run(RunArgs),

    /// Check a flow file without starting anything
    Validate { file: PathBuf },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Flow file (JSON)
    file: PathBuf,

    /// The fbp-channel executable; defaults to the one next to fbflow
    #[arg(long = "channel-bin")]
    channel_bin: Option<PathBuf>,

    /// Env file with FBP_* settings; defaults to `.env` when present
    #[arg(long = "env_file")]
    env_file: Option<PathBuf>,

    /// Log level (e.g. error, warn, info, debug, trace)
    #[arg(long = "log_level", default_value = "info")]
    log_level: String,

    /// Also write logs to daily rolling files in this directory
    #[arg(long = "log_dir")]
    log_dir: Option<PathBuf>,

    #[arg(long = "startup_timeout_secs")]
    startup_timeout_secs: Option<u64>,

    #[arg(long = "connect_timeout_secs")]
    connect_timeout_secs: Option<u64>,

    /// Capacity of every link channel
    #[arg(long = "buffer_size")]
    buffer_size: Option<usize>,

    /// Interface channel processes listen on
    #[arg(long)]
    host: Option<String>,
}

impl RunArgs {
    fn config(&self) -> anyhow::Result<FlowConfig> {
        let mut config = FlowConfig::load(self.env_file.as_deref())?;
        if let Some(secs) = self.startup_timeout_secs {
            config.startup_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.connect_timeout_secs {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(size) = self.buffer_size {
            config.buffer_size = size;
        }
        if let Some(host) = &self.host {
            config.channel_host = host.clone();
        }
        if self.log_dir.is_some() {
            config.log_dir = self.log_dir.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

/// `fbp-channel` in the directory of the running executable.
fn sibling_channel_bin() -> anyhow::Result<PathBuf> {
    let exe = std::env::current_exe().context("could not locate the fbflow executable")?;
    let dir = exe.parent().unwrap_or(Path::new("."));
    Ok(dir.join(format!("fbp-channel{}", std::env::consts::EXE_SUFFIX)))
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run(args) => run_command(args).await,
        Commands::Validate { file } => Flow::load(&file)
            .map(|flow| {
                println!(
                    "✅ Flow file is valid: {} nodes, {} links.",
                    flow.nodes().count(),
                    flow.links().len()
                );
            })
            .map_err(anyhow::Error::from),
    };
    if let Err(e) = result {
        error!("{e:#}");
        eprintln!("❌ {e:#}");
        process::exit(1);
    }
}

async fn run_command(args: RunArgs) -> anyhow::Result<()> {
    // settings pick the log directory, so they load before tracing starts
    let config = args.config()?;
    let _guard = init_tracing(&args.log_level, config.log_dir.as_deref(), "fbflow.log")?;
    if let Some(path) = &config.env_file {
        info!("Loaded .env from {}", path.display());
    }

    let flow = Flow::load(&args.file)?;
    let channel_bin = match &args.channel_bin {
        Some(bin) => bin.clone(),
        None => sibling_channel_bin()?,
    };
    info!(flow = %args.file.display(), channel_bin = %channel_bin.display(), "starting flow");

    let options = RunOptions {
        channel_bin,
        config,
        log_level: args.log_level.clone(),
    };
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "could not listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    let summary = run(&flow, &options, shutdown).await?;
    info!(started = summary.started, finished = ?summary.finished, "flow finished");
    Ok(())
}
