use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::FlowError;

pub const STARTUP_TIMEOUT_SECS: &str = "FBP_STARTUP_TIMEOUT_SECS";
pub const CONNECT_TIMEOUT_SECS: &str = "FBP_CONNECT_TIMEOUT_SECS";
pub const CONNECT_RETRY_MS: &str = "FBP_CONNECT_RETRY_MS";
pub const BUFFER_SIZE: &str = "FBP_BUFFER_SIZE";
pub const CHANNEL_HOST: &str = "FBP_CHANNEL_HOST";
pub const LOG_DIR: &str = "FBP_LOG_DIR";

/// Runtime settings of the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowConfig {
    /// How long to wait for the startup infos of every channel.
    pub startup_timeout: Duration,
    pub connect_timeout: Duration,
    pub connect_retry: Duration,
    /// Capacity of every link channel.
    pub buffer_size: usize,
    /// Address channel processes bind to and advertise.
    pub channel_host: String,
    pub log_dir: Option<PathBuf>,
    /// The `.env` file `load` read, if any. Logged by the caller once tracing is up.
    #[serde(skip)]
    pub env_file: Option<PathBuf>,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            connect_retry: Duration::from_millis(100),
            buffer_size: 1,
            channel_host: "127.0.0.1".into(),
            log_dir: None,
            env_file: None,
        }
    }
}

impl FlowConfig {
    /// Loads `env_file` (or a `.env` in the working directory) and then reads
    /// the `FBP_*` variables from the environment.
    ///
    /// Does not log: this runs before tracing is initialised.
    pub fn load(env_file: Option<&Path>) -> Result<Self, FlowError> {
        let loaded = match env_file {
            Some(path) if path.exists() => {
                dotenvy::from_path(path).map_err(|e| FlowError::Config(e.to_string()))?;
                Some(path.to_path_buf())
            }
            Some(path) => {
                return Err(FlowError::Config(format!(
                    "env file {} does not exist",
                    path.display()
                )));
            }
            None => dotenvy::dotenv().ok(),
        };
        let mut config = Self::from_lookup(|key| env::var(key).ok())?;
        config.env_file = loaded;
        Ok(config)
    }

    /// Builds the config from any key lookup, starting from the defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, FlowError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(secs) = parse::<u64>(&lookup, STARTUP_TIMEOUT_SECS)? {
            config.startup_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64>(&lookup, CONNECT_TIMEOUT_SECS)? {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = parse::<u64>(&lookup, CONNECT_RETRY_MS)? {
            config.connect_retry = Duration::from_millis(ms);
        }
        if let Some(size) = parse::<usize>(&lookup, BUFFER_SIZE)? {
            config.buffer_size = size;
        }
        if let Some(host) = lookup(CHANNEL_HOST).filter(|h| !h.trim().is_empty()) {
            config.channel_host = host.trim().to_string();
        }
        if let Some(dir) = lookup(LOG_DIR).filter(|d| !d.trim().is_empty()) {
            config.log_dir = Some(PathBuf::from(dir.trim()));
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), FlowError> {
        if self.buffer_size == 0 {
            return Err(FlowError::Config("buffer size must be at least 1".into()));
        }
        if self.connect_retry.is_zero() {
            return Err(FlowError::Config("connect retry interval must not be 0".into()));
        }
        Ok(())
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, FlowError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| FlowError::Config(format!("{key}: cannot parse `{raw}`"))),
    }
}
