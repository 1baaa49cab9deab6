use std::io;

use fbp_channel::{ChannelError, NegotiationError};
use thiserror::Error;

/// Errors that end a flow run.
#[derive(Error, Debug)]
pub enum FlowError {
    #[error("invalid flow: {0}")]
    InvalidFlow(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("could not start `{name}`: {reason}")]
    ProcessStart { name: String, reason: String },

    #[error("negotiating {what}: {source}")]
    Negotiation {
        what: String,
        #[source]
        source: NegotiationError,
    },

    #[error("{what}: {source}")]
    Channel {
        what: String,
        #[source]
        source: ChannelError,
    },

    #[error("sink `{node}` failed with {status}")]
    SinkFailed { node: String, status: String },

    #[error("component `{node}` exited with {status} while the flow was running")]
    ComponentFailed { node: String, status: String },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("flow cancelled")]
    Cancelled,
}

impl FlowError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        FlowError::InvalidFlow(msg.into())
    }

    pub fn channel(what: impl Into<String>, source: ChannelError) -> Self {
        FlowError::Channel {
            what: what.into(),
            source,
        }
    }

    pub fn negotiation(what: impl Into<String>, source: NegotiationError) -> Self {
        FlowError::Negotiation {
            what: what.into(),
            source,
        }
    }
}
