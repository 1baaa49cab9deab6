use std::path::Path;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Filter from `RUST_LOG` when set, otherwise from `log_level`
/// (e.g. error, warn, info, debug, trace, or full directives).
pub fn env_filter(log_level: &str) -> anyhow::Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(log_level)
            .with_context(|| format!("invalid log level `{log_level}`")),
    }
}

/// Installs the global subscriber: plain text on stderr and, with a
/// `log_dir`, a daily rolling `<file_name>` in that directory.
///
/// stdout stays free for program output. Keep the returned guard alive
/// until exit or buffered file lines are lost.
pub fn init_tracing(
    log_level: &str,
    log_dir: Option<&Path>,
    file_name: &str,
) -> anyhow::Result<Option<WorkerGuard>> {
    let stderr_layer = fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_writer(std::io::stderr);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("could not create log dir {}", dir.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(daily(dir, file_name));
            let layer = fmt::layer()
                .with_ansi(false)
                .with_thread_names(true)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter(log_level)?)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("tracing subscriber already installed")?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_levels_and_directives() {
        assert!(env_filter("debug").is_ok());
        assert!(env_filter("fbflow=trace,fbp_channel=info").is_ok());
    }
}
