//! Client side of the channel wire protocol.
//!
//! A [`Connection`] multiplexes calls over one TCP stream: a writer task
//! sends request lines, a reader task routes responses back to the waiting
//! caller by request id.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::{Instant, sleep};
use tracing::{debug, trace, warn};

use crate::endpoint::{ChannelReader, ChannelWriter, EndpointKind};
use crate::error::ChannelError;
use crate::jsonrpc::{Id, Message, Method, Request, Response};
use crate::message::Msg;
use crate::server::{AttachParams, TokenParams, WriteParams};
use crate::sturdy_ref::SturdyRef;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

type InFlight = Arc<DashMap<Id, oneshot::Sender<Response>>>;

/// One multiplexed connection to a channel process.
#[derive(Debug)]
pub struct Connection {
    addr: String,
    tx: mpsc::UnboundedSender<Request>,
    in_flight: InFlight,
    next_id: AtomicI64,
    alive: Arc<AtomicBool>,
}

impl Connection {
    /// Connects to `addr`, retrying every `retry_interval` until `timeout` elapsed.
    pub async fn connect(
        addr: &str,
        timeout: Duration,
        retry_interval: Duration,
    ) -> Result<Arc<Self>, ChannelError> {
        let deadline = Instant::now() + timeout;
        let stream = loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => break stream,
                Err(e) if Instant::now() + retry_interval < deadline => {
                    trace!(%addr, error = %e, "connect failed, retrying");
                    sleep(retry_interval).await;
                }
                Err(e) => {
                    warn!(%addr, error = %e, "giving up connecting");
                    return Err(ChannelError::unavailable(addr, e));
                }
            }
        };
        let _ = stream.set_nodelay(true);
        debug!(%addr, "connected");
        Ok(Arc::new(Self::from_stream(addr, stream)))
    }

    fn from_stream(addr: &str, stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Request>();
        let in_flight: InFlight = Arc::new(DashMap::new());
        let alive = Arc::new(AtomicBool::new(true));

        {
            let alive = Arc::clone(&alive);
            tokio::spawn(async move {
                let mut w = BufWriter::new(write_half);
                while let Some(req) = rx.recv().await {
                    let Ok(line) = serde_json::to_string(&req) else {
                        continue;
                    };
                    if w.write_all(line.as_bytes()).await.is_err()
                        || w.write_all(b"\n").await.is_err()
                        || w.flush().await.is_err()
                    {
                        break;
                    }
                }
                alive.store(false, Ordering::SeqCst);
            });
        }

        {
            let in_flight = Arc::clone(&in_flight);
            let alive = Arc::clone(&alive);
            let addr = addr.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(read_half).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Message>(&line) {
                        Ok(Message::Response(rsp)) => {
                            if let Some((_, waiter)) = in_flight.remove(&rsp.id) {
                                let _ = waiter.send(rsp);
                            }
                        }
                        Ok(Message::Request(_)) => trace!(%addr, "ignoring request from server"),
                        Err(e) => warn!(%addr, error = %e, "bad line from channel process"),
                    }
                }
                alive.store(false, Ordering::SeqCst);
                // wake everybody still waiting
                in_flight.clear();
                debug!(%addr, "connection lost");
            });
        }

        Self {
            addr: addr.to_string(),
            tx,
            in_flight,
            next_id: AtomicI64::new(1),
            alive,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Sends one call and waits for its response.
    pub async fn call<P: Serialize>(
        &self,
        method: Method,
        params: &P,
        token: &str,
    ) -> Result<Value, ChannelError> {
        let lost = || ChannelError::unavailable(self.addr.clone(), "connection lost");
        if !self.is_alive() {
            return Err(lost());
        }
        let id = Id::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let params = serde_json::to_value(params)?;
        let (waiter, rx) = oneshot::channel();
        self.in_flight.insert(id.clone(), waiter);
        // the reader task clears `in_flight` after marking the connection dead,
        // so an insert that raced past that clear is caught here
        if !self.is_alive() {
            self.in_flight.remove(&id);
            return Err(lost());
        }
        if self.tx.send(Request::call(id.clone(), method, Some(params))).is_err() {
            self.in_flight.remove(&id);
            return Err(lost());
        }
        let rsp = rx.await.map_err(|_| lost())?;
        rsp.into_result()
            .map_err(|err| ChannelError::from_rpc(&err, token))
    }
}

/// Caches one connection per `host:port`.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    connections: Arc<Mutex<HashMap<String, Arc<Connection>>>>,
    connect_timeout: Duration,
    retry_interval: Duration,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT, DEFAULT_RETRY_INTERVAL)
    }
}

impl ConnectionManager {
    pub fn new(connect_timeout: Duration, retry_interval: Duration) -> Self {
        Self {
            connections: Arc::new(Mutex::new(HashMap::new())),
            connect_timeout,
            retry_interval,
        }
    }

    /// Cached live connection to `addr`, connecting if needed.
    pub async fn connection(&self, addr: &str) -> Result<Arc<Connection>, ChannelError> {
        let mut connections = self.connections.lock().await;
        if let Some(conn) = connections.get(addr) {
            if conn.is_alive() {
                return Ok(Arc::clone(conn));
            }
        }
        let conn = Connection::connect(addr, self.connect_timeout, self.retry_interval).await?;
        connections.insert(addr.to_string(), Arc::clone(&conn));
        Ok(conn)
    }

    async fn attach(&self, sr: &str, kind: EndpointKind) -> Result<(SturdyRef, Arc<Connection>), ChannelError> {
        let sr: SturdyRef = sr.parse()?;
        let conn = self.connection(&sr.addr()).await?;
        let params = AttachParams {
            token: sr.token.clone(),
            kind,
        };
        conn.call(Method::Attach, &params, &sr.token).await?;
        Ok((sr, conn))
    }

    pub async fn reader(&self, sr: &str) -> Result<RemoteReader, ChannelError> {
        let (sr, conn) = self.attach(sr, EndpointKind::Reader).await?;
        Ok(RemoteReader { sr, conn })
    }

    pub async fn writer(&self, sr: &str) -> Result<RemoteWriter, ChannelError> {
        let (sr, conn) = self.attach(sr, EndpointKind::Writer).await?;
        Ok(RemoteWriter { sr, conn })
    }

    /// Forgets every cached connection.
    pub async fn clear(&self) {
        self.connections.lock().await.clear();
    }
}

/// Reader endpoint living in another process.
#[derive(Debug, Clone)]
pub struct RemoteReader {
    sr: SturdyRef,
    conn: Arc<Connection>,
}

impl RemoteReader {
    pub fn sturdy_ref(&self) -> &SturdyRef {
        &self.sr
    }
}

#[async_trait]
impl ChannelReader for RemoteReader {
    async fn read(&self) -> Result<Msg, ChannelError> {
        let params = TokenParams {
            token: self.sr.token.clone(),
        };
        let value = self.conn.call(Method::Read, &params, &self.sr.token).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn close(&self) -> Result<(), ChannelError> {
        let params = TokenParams {
            token: self.sr.token.clone(),
        };
        self.conn.call(Method::Close, &params, &self.sr.token).await?;
        Ok(())
    }
}

/// Writer endpoint living in another process.
#[derive(Debug, Clone)]
pub struct RemoteWriter {
    sr: SturdyRef,
    conn: Arc<Connection>,
}

impl RemoteWriter {
    pub fn sturdy_ref(&self) -> &SturdyRef {
        &self.sr
    }
}

#[async_trait]
impl ChannelWriter for RemoteWriter {
    async fn write(&self, msg: Msg) -> Result<(), ChannelError> {
        let params = WriteParams {
            token: self.sr.token.clone(),
            msg,
        };
        self.conn.call(Method::Write, &params, &self.sr.token).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), ChannelError> {
        let params = TokenParams {
            token: self.sr.token.clone(),
        };
        self.conn.call(Method::Close, &params, &self.sr.token).await?;
        Ok(())
    }
}
