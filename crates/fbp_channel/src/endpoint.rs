use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};

use crate::channel::{ReaderHandle, WriterHandle};
use crate::error::ChannelError;
use crate::message::{Ip, Msg};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EndpointKind {
    Reader,
    Writer,
}

/// Anything messages can be read from: a local handle or a remote endpoint.
#[async_trait]
pub trait ChannelReader: Send + Sync {
    async fn read(&self) -> Result<Msg, ChannelError>;

    async fn close(&self) -> Result<(), ChannelError>;
}

/// Anything messages can be written to.
#[async_trait]
pub trait ChannelWriter: Send + Sync {
    async fn write(&self, msg: Msg) -> Result<(), ChannelError>;

    async fn close(&self) -> Result<(), ChannelError>;

    async fn write_value(&self, content: Value) -> Result<(), ChannelError> {
        self.write(Msg::Value(Ip::new(content))).await
    }

    async fn write_done(&self) -> Result<(), ChannelError> {
        self.write(Msg::Done).await
    }
}

#[async_trait]
impl ChannelReader for ReaderHandle {
    async fn read(&self) -> Result<Msg, ChannelError> {
        ReaderHandle::read(self).await
    }

    async fn close(&self) -> Result<(), ChannelError> {
        ReaderHandle::close(self)
    }
}

#[async_trait]
impl ChannelWriter for WriterHandle {
    async fn write(&self, msg: Msg) -> Result<(), ChannelError> {
        WriterHandle::write(self, msg).await
    }

    async fn close(&self) -> Result<(), ChannelError> {
        WriterHandle::close(self)
    }
}

/// An endpoint as registered in a channel host under its token.
#[derive(Debug, Clone)]
pub enum Endpoint {
    Reader(ReaderHandle),
    Writer(WriterHandle),
}

impl Endpoint {
    pub fn kind(&self) -> EndpointKind {
        match self {
            Endpoint::Reader(_) => EndpointKind::Reader,
            Endpoint::Writer(_) => EndpointKind::Writer,
        }
    }

    pub fn channel_id(&self) -> u64 {
        match self {
            Endpoint::Reader(r) => r.channel().id(),
            Endpoint::Writer(w) => w.channel().id(),
        }
    }

    pub fn close(&self) -> Result<(), ChannelError> {
        match self {
            Endpoint::Reader(r) => r.close(),
            Endpoint::Writer(w) => w.close(),
        }
    }
}
