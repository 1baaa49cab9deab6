//! Channel process: hosts channels and serves their endpoints over TCP.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use fbflow::logger::init_tracing;
use fbp_channel::client::DEFAULT_RETRY_INTERVAL;
use fbp_channel::{ChannelHost, ClosePolicy, ConnectionManager, HostOptions};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "fbp-channel", about = "Hosts FBP channels")]
struct Args {
    #[arg(long, default_value = "channel")]
    name: String,

    /// Correlation id the startup reports are tagged with
    #[arg(long = "startup_info_id")]
    startup_info_id: Option<String>,

    /// Writer ref of the report channel
    #[arg(long = "startup_info_writer_sr")]
    startup_info_writer_sr: Option<String>,

    #[arg(long = "no_of_channels", default_value_t = 1)]
    no_of_channels: usize,

    #[arg(long = "no_of_readers", default_value_t = 1)]
    no_of_readers: usize,

    #[arg(long = "no_of_writers", default_value_t = 1)]
    no_of_writers: usize,

    #[arg(long = "buffer_size", default_value_t = 1)]
    buffer_size: usize,

    /// Fixed reader tokens, channel-major
    #[arg(long = "reader_srts", value_delimiter = ',')]
    reader_srts: Vec<String>,

    /// Fixed writer tokens, channel-major
    #[arg(long = "writer_srts", value_delimiter = ',')]
    writer_srts: Vec<String>,

    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// 0 picks a free port
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Debug logging unless --log_level says otherwise
    #[arg(long)]
    verbose: bool,

    /// Bootstrap mode: print readerSR= / writerSR= to stdout
    #[arg(long = "output_srs")]
    output_srs: bool,

    /// Drop buffered messages on shutdown instead of letting readers drain them
    #[arg(long = "close_immediately")]
    close_immediately: bool,

    #[arg(long = "log_level")]
    log_level: Option<String>,

    #[arg(long = "log_dir")]
    log_dir: Option<PathBuf>,

    /// How long to keep retrying the report channel
    #[arg(long = "connect_timeout_secs", default_value_t = 10)]
    connect_timeout_secs: u64,
}

impl Args {
    fn log_level(&self) -> &str {
        match (&self.log_level, self.verbose) {
            (Some(level), _) => level,
            (None, true) => "debug",
            (None, false) => "info",
        }
    }

    fn host_options(&self) -> HostOptions {
        let close_policy = if self.close_immediately {
            ClosePolicy::Immediate
        } else {
            ClosePolicy::WaitForDrain
        };
        if self.output_srs {
            return HostOptions {
                buffer_size: self.buffer_size,
                port: self.port,
                close_policy,
                ..HostOptions::bootstrap(&self.host)
            };
        }
        HostOptions {
            name: self.name.clone(),
            no_of_channels: self.no_of_channels,
            no_of_readers: self.no_of_readers,
            no_of_writers: self.no_of_writers,
            buffer_size: self.buffer_size,
            reader_srts: self.reader_srts.clone(),
            writer_srts: self.writer_srts.clone(),
            host: self.host.clone(),
            port: self.port,
            close_policy,
        }
    }
}

#[cfg(unix)]
async fn terminated() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            error!(error = %e, "could not listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminated() {
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _guard = init_tracing(args.log_level(), args.log_dir.as_deref(), &format!("{}.log", args.name))?;

    let host = ChannelHost::bind(args.host_options())
        .await
        .with_context(|| format!("channel process `{}` could not start", args.name))?;

    if args.output_srs {
        let refs = host
            .startup_infos()
            .first()
            .and_then(|info| info.reader_refs.first().zip(info.writer_refs.first()));
        let Some((reader_sr, writer_sr)) = refs else {
            bail!("bootstrap channel has no endpoints");
        };
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "readerSR={reader_sr}")?;
        writeln!(stdout, "writerSR={writer_sr}")?;
        stdout.flush()?;
    } else {
        match (&args.startup_info_id, &args.startup_info_writer_sr) {
            (Some(id), Some(writer_sr)) => {
                let connections = ConnectionManager::new(
                    Duration::from_secs(args.connect_timeout_secs),
                    DEFAULT_RETRY_INTERVAL,
                );
                host.report(&connections, writer_sr, id)
                    .await
                    .with_context(|| format!("channel process `{}` could not report", args.name))?;
            }
            (None, None) => {
                info!(name = %args.name, "no report channel given, serving unannounced");
            }
            _ => bail!("--startup_info_id and --startup_info_writer_sr go together"),
        }
    }

    host.serve(terminated()).await;
    Ok(())
}
