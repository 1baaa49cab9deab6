use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ClosePolicy};
use crate::client::ConnectionManager;
use crate::endpoint::{ChannelWriter, Endpoint};
use crate::error::ChannelError;
use crate::message::{StartupInfo, StartupReport};
use crate::server::{self, Registry};
use crate::sturdy_ref::SturdyRef;

/// Shape of the channels a host creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostOptions {
    pub name: String,
    pub no_of_channels: usize,
    pub no_of_readers: usize,
    pub no_of_writers: usize,
    pub buffer_size: usize,
    /// Fixed reader tokens, channel-major. Empty means random tokens.
    pub reader_srts: Vec<String>,
    pub writer_srts: Vec<String>,
    pub host: String,
    /// 0 picks a free port.
    pub port: u16,
    pub close_policy: ClosePolicy,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            name: "channel".into(),
            no_of_channels: 1,
            no_of_readers: 1,
            no_of_writers: 1,
            buffer_size: 1,
            reader_srts: Vec::new(),
            writer_srts: Vec::new(),
            host: "127.0.0.1".into(),
            port: 0,
            close_policy: ClosePolicy::default(),
        }
    }
}

impl HostOptions {
    /// One channel with one reader and one writer.
    pub fn bootstrap(host: impl Into<String>) -> Self {
        Self {
            name: "bootstrap".into(),
            host: host.into(),
            ..Self::default()
        }
    }
}

/// Hosts a set of channels and serves their endpoints on one TCP port.
pub struct ChannelHost {
    options: HostOptions,
    listener: TcpListener,
    local_addr: SocketAddr,
    channels: Vec<Channel>,
    infos: Vec<StartupInfo>,
    registry: Registry,
}

impl ChannelHost {
    /// Creates the channels and binds the listener.
    pub async fn bind(options: HostOptions) -> Result<Self, ChannelError> {
        if options.buffer_size == 0 {
            return Err(ChannelError::Protocol("buffer size must be at least 1".into()));
        }
        let reader_tokens = tokens(
            &options.reader_srts,
            options.no_of_channels * options.no_of_readers,
            "reader",
        )?;
        let writer_tokens = tokens(
            &options.writer_srts,
            options.no_of_channels * options.no_of_writers,
            "writer",
        )?;

        let bind_addr = format!("{}:{}", options.host, options.port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| ChannelError::unavailable(bind_addr.clone(), e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ChannelError::unavailable(bind_addr.clone(), e))?;

        let registry: Registry = Arc::new(DashMap::new());
        let mut channels = Vec::with_capacity(options.no_of_channels);
        let mut infos = Vec::with_capacity(options.no_of_channels);
        for c in 0..options.no_of_channels {
            let channel = Channel::with_policy(options.buffer_size, options.close_policy);
            let mut reader_refs = Vec::with_capacity(options.no_of_readers);
            for token in &reader_tokens[c * options.no_of_readers..(c + 1) * options.no_of_readers] {
                registry.insert(token.clone(), Endpoint::Reader(channel.create_reader()?));
                reader_refs.push(SturdyRef::new(&options.host, local_addr.port(), token).to_string());
            }
            let mut writer_refs = Vec::with_capacity(options.no_of_writers);
            for token in &writer_tokens[c * options.no_of_writers..(c + 1) * options.no_of_writers] {
                registry.insert(token.clone(), Endpoint::Writer(channel.create_writer()?));
                writer_refs.push(SturdyRef::new(&options.host, local_addr.port(), token).to_string());
            }
            infos.push(StartupInfo {
                buffer_size: options.buffer_size,
                reader_refs,
                writer_refs,
            });
            channels.push(channel);
        }
        info!(
            name = %options.name,
            addr = %local_addr,
            channels = options.no_of_channels,
            "channel host bound"
        );

        Ok(Self {
            options,
            listener,
            local_addr,
            channels,
            infos,
            registry,
        })
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// References of every channel, in creation order.
    pub fn startup_infos(&self) -> &[StartupInfo] {
        &self.infos
    }

    /// Writes one `StartupReport` per channel to the report channel at `writer_sr`.
    ///
    /// The report writer stays open: other channel processes share it.
    pub async fn report(
        &self,
        connections: &ConnectionManager,
        writer_sr: &str,
        id: &str,
    ) -> Result<(), ChannelError> {
        let writer = connections.writer(writer_sr).await?;
        for info in &self.infos {
            writer.write(StartupReport::new(id, info.clone()).to_msg()?).await?;
        }
        debug!(name = %self.options.name, %id, reports = self.infos.len(), "startup infos reported");
        Ok(())
    }

    /// Serves until `shutdown` resolves, then closes every channel by its policy.
    pub async fn serve<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        server::serve(self.listener, Arc::clone(&self.registry), shutdown).await;
        for channel in &self.channels {
            let discarded = channel.shutdown();
            if discarded > 0 {
                warn!(channel = channel.id(), discarded, "messages dropped on shutdown");
            }
        }
        info!(name = %self.options.name, "channel host stopped");
    }
}

fn tokens(fixed: &[String], needed: usize, what: &str) -> Result<Vec<String>, ChannelError> {
    if fixed.is_empty() {
        return Ok((0..needed).map(|_| SturdyRef::random_token()).collect());
    }
    if fixed.len() != needed {
        return Err(ChannelError::InvalidRef(format!(
            "expected {needed} fixed {what} tokens, got {}",
            fixed.len()
        )));
    }
    if let Some(bad) = fixed.iter().find(|t| !SturdyRef::is_valid_token(t)) {
        return Err(ChannelError::InvalidRef(bad.clone()));
    }
    Ok(fixed.to_vec())
}
