//! Prints the content of every packet on `in` to stdout.

use std::io::Write;

use clap::Parser;
use fbflow::component::{ComponentArgs, for_each_ip};
use serde_json::Value;
use tracing::debug;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ComponentArgs::parse();
    let _guard = args.init_logging("fbp-console")?;
    let connections = args.connections();
    let ports = args.connect(&connections, &["in"], &[]).await?;

    let printed = for_each_ip(&ports, "in", |ip| async move {
        let mut stdout = std::io::stdout().lock();
        match &ip.content {
            Value::String(s) => writeln!(stdout, "{s}")?,
            other => writeln!(stdout, "{other}")?,
        }
        stdout.flush()?;
        Ok::<_, anyhow::Error>(())
    })
    .await?;

    debug!(printed, "input finished");
    Ok(())
}
