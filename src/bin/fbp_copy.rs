//! Copies every packet on `in` to each connection of the array port `out`.

use clap::Parser;
use fbflow::component::{ComponentArgs, config_from_port, for_each_ip};
use fbp_channel::Msg;
use serde_json::json;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ComponentArgs::parse();
    let _guard = args.init_logging("fbp-copy")?;
    let connections = args.connections();
    let ports = args.connect(&connections, &["conf", "in"], &["out"]).await?;

    let config = config_from_port(&ports, json!({})).await?;
    if !config.is_empty() {
        info!(?config, "config received");
    }

    let out = ports.out_port("out");
    let copied = for_each_ip(&ports, "in", |ip| async move {
        if let Some(out) = out {
            out.write(Msg::Value(ip)).await?;
        }
        Ok::<_, anyhow::Error>(())
    })
    .await?;

    ports.close_out_ports().await?;
    info!(copied, "input finished");
    Ok(())
}
