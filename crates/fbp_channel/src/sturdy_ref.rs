use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::ChannelError;

pub const SCHEME: &str = "fbp://";

/// Reference to one endpoint: `fbp://<host>:<port>/<token>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SturdyRef {
    pub host: String,
    pub port: u16,
    pub token: String,
}

impl SturdyRef {
    pub fn new(host: impl Into<String>, port: u16, token: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            token: token.into(),
        }
    }

    /// `host:port` to connect to.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// A fresh random token.
    pub fn random_token() -> String {
        Uuid::new_v4().simple().to_string()
    }

    pub fn is_valid_token(token: &str) -> bool {
        !token.is_empty()
            && token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    }
}

impl fmt::Display for SturdyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME}{}:{}/{}", self.host, self.port, self.token)
    }
}

impl FromStr for SturdyRef {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ChannelError::InvalidRef(s.to_string());
        let rest = s.trim().strip_prefix(SCHEME).ok_or_else(invalid)?;
        let (authority, token) = rest.split_once('/').ok_or_else(invalid)?;
        let (host, port) = authority.rsplit_once(':').ok_or_else(invalid)?;
        let port: u16 = port.parse().map_err(|_| invalid())?;
        if host.is_empty() || port == 0 || !Self::is_valid_token(token) {
            return Err(invalid());
        }
        Ok(SturdyRef::new(host, port, token))
    }
}

impl Serialize for SturdyRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SturdyRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
