use thiserror::Error;

use crate::jsonrpc;

/// JSON-RPC error codes used on the channel wire protocol.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const HANDLE_CLOSED: i64 = -32001;
    pub const CHANNEL_CLOSED: i64 = -32002;
    pub const UNKNOWN_ENDPOINT: i64 = -32003;
    pub const MALFORMED_MESSAGE: i64 = -32004;
}

/// Errors raised by channels, their handles and remote endpoints.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The reader or writer was closed before this call.
    #[error("handle closed")]
    HandleClosed,

    /// The channel no longer accepts this operation.
    #[error("channel closed")]
    ChannelClosed,

    /// Could not reach the endpoint behind a reference.
    #[error("channel unavailable at {sr}: {reason}")]
    ChannelUnavailable { sr: String, reason: String },

    /// The channel process does not know the token.
    #[error("unknown endpoint `{0}`")]
    UnknownEndpoint(String),

    /// A reference token could not be parsed.
    #[error("invalid reference `{0}`")]
    InvalidRef(String),

    /// Capacity can only change before the first read or write.
    #[error("channel already in use")]
    InUse,

    /// A payload did not have the expected shape.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// The peer violated the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ChannelError {
    pub fn unavailable(sr: impl Into<String>, reason: impl ToString) -> Self {
        ChannelError::ChannelUnavailable {
            sr: sr.into(),
            reason: reason.to_string(),
        }
    }

    /// Wire representation of this error.
    pub fn to_rpc(&self) -> jsonrpc::Error {
        let code = match self {
            ChannelError::HandleClosed => codes::HANDLE_CLOSED,
            ChannelError::ChannelClosed | ChannelError::InUse => codes::CHANNEL_CLOSED,
            ChannelError::UnknownEndpoint(_) => codes::UNKNOWN_ENDPOINT,
            ChannelError::MalformedMessage(_) => codes::MALFORMED_MESSAGE,
            ChannelError::InvalidRef(_)
            | ChannelError::ChannelUnavailable { .. }
            | ChannelError::Protocol(_) => codes::INVALID_PARAMS,
        };
        jsonrpc::Error {
            code,
            message: self.to_string(),
            data: None,
        }
    }

    /// Rebuild an error received from a channel process.
    pub fn from_rpc(err: &jsonrpc::Error, token: &str) -> Self {
        match err.code {
            codes::HANDLE_CLOSED => ChannelError::HandleClosed,
            codes::CHANNEL_CLOSED => ChannelError::ChannelClosed,
            codes::UNKNOWN_ENDPOINT => ChannelError::UnknownEndpoint(token.to_string()),
            codes::MALFORMED_MESSAGE => ChannelError::MalformedMessage(err.message.clone()),
            _ => ChannelError::Protocol(format!("{} ({})", err.message, err.code)),
        }
    }
}

impl From<serde_json::Error> for ChannelError {
    fn from(err: serde_json::Error) -> ChannelError {
        ChannelError::MalformedMessage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_codes_survive_the_wire() {
        for err in [
            ChannelError::HandleClosed,
            ChannelError::ChannelClosed,
            ChannelError::UnknownEndpoint("t1".into()),
        ] {
            let wire = err.to_rpc();
            assert_eq!(ChannelError::from_rpc(&wire, "t1"), err);
        }
    }

    #[test]
    fn unknown_codes_become_protocol_errors() {
        let wire = jsonrpc::Error {
            code: -1,
            message: "boom".into(),
            data: None,
        };
        assert!(matches!(
            ChannelError::from_rpc(&wire, "t"),
            ChannelError::Protocol(_)
        ));
    }
}
