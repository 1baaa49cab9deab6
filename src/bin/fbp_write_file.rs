//! Writes every packet on `in` as one line of the file named by `conf.path`.

use anyhow::{Context, bail};
use clap::Parser;
use fbflow::component::{ComponentArgs, config_from_port};
use fbp_channel::{ChannelReader, Msg};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
struct WriteFileConfig {
    path: Option<String>,
    #[serde(default)]
    append: bool,
    /// Write this attribute instead of the content
    #[serde(default)]
    from_attr: Option<String>,
}

fn line(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ComponentArgs::parse();
    let _guard = args.init_logging("fbp-write-file")?;
    let connections = args.connections();
    let ports = args.connect(&connections, &["conf", "in"], &[]).await?;

    let config = config_from_port(&ports, json!({"append": false})).await?;
    let config: WriteFileConfig =
        serde_json::from_value(Value::Object(config)).context("invalid fbp-write-file config")?;
    let Some(path) = config.path else {
        bail!("fbp-write-file needs `path` in its config");
    };

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(config.append)
        .truncate(!config.append)
        .open(&path)
        .await
        .with_context(|| format!("could not open {path}"))?;
    let mut out = BufWriter::new(file);

    let mut written = 0usize;
    if let Some(reader) = ports.in_port("in") {
        loop {
            let ip = match reader.read().await? {
                Msg::Value(ip) => ip,
                Msg::Done => break,
            };
            let Some(value) = ip.read_field(config.from_attr.as_deref()) else {
                warn!(attr = ?config.from_attr, "packet without the configured attribute, skipped");
                continue;
            };
            out.write_all(line(value).as_bytes()).await?;
            out.write_all(b"\n").await?;
            written += 1;
        }
    }
    out.flush().await?;

    info!(%path, written, "input finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strings_are_written_raw_and_the_rest_as_json() {
        assert_eq!(line(&json!("hello")), "hello");
        assert_eq!(line(&json!({"a": 1})), r#"{"a":1}"#);
        assert_eq!(line(&json!(3)), "3");
    }

    #[test]
    fn append_defaults_to_false() {
        let config: WriteFileConfig = serde_json::from_value(json!({"path": "out.txt"})).unwrap();
        assert!(!config.append);
        assert!(config.from_attr.is_none());
    }
}
