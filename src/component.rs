//! Shared entry point of component executables.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use fbp_channel::{ChannelReader, ConnectionManager, Msg, Ports};
use serde_json::{Map, Value};
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;

use crate::logger::init_tracing;

/// Arguments every component accepts.
#[derive(Parser, Debug, Clone)]
pub struct ComponentArgs {
    /// Sturdy ref of the reader delivering this component's port infos
    pub port_infos_reader_sr: String,

    /// Log level (e.g. error, warn, info, debug, trace)
    #[arg(long = "log_level", default_value = "info")]
    pub log_level: String,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long = "log_dir")]
    pub log_dir: Option<PathBuf>,

    /// How long to keep retrying connections to channel processes
    #[arg(long = "connect_timeout_secs", default_value_t = 10)]
    pub connect_timeout_secs: u64,
}

impl ComponentArgs {
    pub fn init_logging(&self, name: &str) -> anyhow::Result<Option<WorkerGuard>> {
        init_tracing(&self.log_level, self.log_dir.as_deref(), &format!("{name}.log"))
    }

    pub fn connections(&self) -> ConnectionManager {
        ConnectionManager::new(
            Duration::from_secs(self.connect_timeout_secs),
            fbp_channel::client::DEFAULT_RETRY_INTERVAL,
        )
    }

    /// Reads this component's port infos and connects the declared ports.
    pub async fn connect(&self, connections: &ConnectionManager, ins: &[&str], outs: &[&str]) -> anyhow::Result<Ports> {
        Ok(Ports::from_port_infos_reader(connections, &self.port_infos_reader_sr, ins, outs).await?)
    }
}

/// Component configuration: defaults overridden by whatever arrives on `conf`.
pub async fn config_from_port(ports: &Ports, defaults: Value) -> anyhow::Result<Map<String, Value>> {
    let mut config = match defaults {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    ports.update_config_from_port(&mut config, "conf").await?;
    Ok(config)
}

/// Calls `f` for every packet on in port `port` until `done`.
///
/// Errors returned by `f` are logged and the packet is skipped.
pub async fn for_each_ip<F, Fut>(ports: &Ports, port: &str, mut f: F) -> anyhow::Result<usize>
where
    F: FnMut(fbp_channel::Ip) -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<()>>,
{
    let Some(reader) = ports.in_port(port) else {
        return Ok(0);
    };
    let mut count = 0;
    loop {
        match reader.read().await? {
            Msg::Value(ip) => {
                if let Err(e) = f(ip).await {
                    warn!(port, error = %e, "skipping packet");
                    continue;
                }
                count += 1;
            }
            Msg::Done => break,
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_positional_ref_and_snake_case_flags() {
        let args = ComponentArgs::try_parse_from([
            "fbp-copy",
            "fbp://127.0.0.1:4000/abc",
            "--log_level",
            "debug",
            "--log_dir",
            "/tmp/logs",
        ])
        .unwrap();
        assert_eq!(args.port_infos_reader_sr, "fbp://127.0.0.1:4000/abc");
        assert_eq!(args.log_level, "debug");
        assert_eq!(args.log_dir, Some(PathBuf::from("/tmp/logs")));
        assert_eq!(args.connect_timeout_secs, 10);
    }

    #[test]
    fn port_infos_ref_is_required() {
        assert!(ComponentArgs::try_parse_from(["fbp-copy"]).is_err());
    }
}
