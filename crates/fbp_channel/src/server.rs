//! Serves registered endpoints over TCP, one JSON‑RPC object per line.
//!
//! Every request on a connection runs in its own task so a blocked `read`
//! never holds up a `write` or `close` sent on the same connection. When the
//! peer hangs up, its outstanding calls are aborted; the endpoints stay
//! registered and open.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use crate::endpoint::{Endpoint, EndpointKind};
use crate::error::{ChannelError, codes};
use crate::jsonrpc::{self, Id, Message, Method, Request, Response};
use crate::message::Msg;

/// Endpoints served by one channel process, keyed by token.
pub type Registry = Arc<DashMap<String, Endpoint>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachParams {
    pub token: String,
    pub kind: EndpointKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenParams {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteParams {
    pub token: String,
    pub msg: Msg,
}

/// Accepts connections until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, registry: Registry, shutdown: F)
where
    F: Future<Output = ()>,
{
    let mut connections = JoinSet::new();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                debug!("server shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    trace!(%peer, "connection accepted");
                    connections.spawn(serve_connection(stream, Arc::clone(&registry)));
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    connections.abort_all();
}

/// Runs one connection to EOF.
pub async fn serve_connection(stream: TcpStream, registry: Registry) {
    let peer = stream.peer_addr().ok();
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(write_lines(write_half, rx));

    let mut calls = JoinSet::new();
    let mut lines = BufReader::new(read_half).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Message>(line) {
                        Ok(Message::Request(req)) => {
                            let registry = Arc::clone(&registry);
                            let tx = tx.clone();
                            calls.spawn(async move {
                                if let Some(resp) = handle_request(&registry, req).await {
                                    enqueue(&tx, &resp);
                                }
                            });
                        }
                        Ok(Message::Response(_)) => trace!("ignoring stray response"),
                        Err(e) => {
                            let resp = Response::fail(
                                Id::Null,
                                jsonrpc::Error {
                                    code: codes::PARSE_ERROR,
                                    message: "Parse error".into(),
                                    data: Some(json!(e.to_string())),
                                },
                            );
                            enqueue(&tx, &resp);
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(?peer, error = %e, "connection read failed");
                    break;
                }
            },
            Some(_) = calls.join_next(), if !calls.is_empty() => {}
        }
    }

    // A dropped connection cancels what it asked for, nothing more.
    calls.abort_all();
    while calls.join_next().await.is_some() {}
    drop(tx);
    let _ = writer.await;
    trace!(?peer, "connection closed");
}

fn enqueue(tx: &UnboundedSender<String>, resp: &Response) {
    match serde_json::to_string(resp) {
        Ok(line) => {
            let _ = tx.send(line);
        }
        Err(e) => warn!(error = %e, "could not encode response"),
    }
}

async fn write_lines<W>(w: W, mut rx: mpsc::UnboundedReceiver<String>)
where
    W: AsyncWrite + Unpin,
{
    let mut w = BufWriter::new(w);
    while let Some(line) = rx.recv().await {
        if w.write_all(line.as_bytes()).await.is_err()
            || w.write_all(b"\n").await.is_err()
            || w.flush().await.is_err()
        {
            break;
        }
    }
}

/// Dispatches one request; `None` for notifications.
pub async fn handle_request(registry: &Registry, req: Request) -> Option<Response> {
    let outcome = dispatch(registry, &req).await;
    let id = req.id?;
    Some(match outcome {
        Ok(result) => Response::success(id, result),
        Err(err) => Response::fail(id, err),
    })
}

async fn dispatch(registry: &Registry, req: &Request) -> Result<Value, jsonrpc::Error> {
    let method = req.method.parse::<Method>().map_err(|_| jsonrpc::Error {
        code: codes::METHOD_NOT_FOUND,
        message: format!("Method not found: {}", req.method),
        data: None,
    })?;
    let params = req.params.clone().unwrap_or(Value::Null);

    match method {
        Method::Attach => {
            let p: AttachParams = parse_params(params)?;
            let endpoint = lookup(registry, &p.token)?;
            if endpoint.kind() != p.kind {
                return Err(ChannelError::Protocol(format!(
                    "`{}` is a {}, not a {}",
                    p.token,
                    endpoint.kind(),
                    p.kind
                ))
                .to_rpc());
            }
            debug!(token = %p.token, kind = %p.kind, "endpoint attached");
            Ok(json!({ "kind": p.kind }))
        }
        Method::Read => {
            let p: TokenParams = parse_params(params)?;
            let Endpoint::Reader(reader) = lookup(registry, &p.token)? else {
                return Err(wrong_kind(&p.token, EndpointKind::Reader));
            };
            let msg = reader.read().await.map_err(|e| e.to_rpc())?;
            serde_json::to_value(msg).map_err(|e| ChannelError::from(e).to_rpc())
        }
        Method::Write => {
            let p: WriteParams = parse_params(params)?;
            let Endpoint::Writer(writer) = lookup(registry, &p.token)? else {
                return Err(wrong_kind(&p.token, EndpointKind::Writer));
            };
            writer.write(p.msg).await.map_err(|e| e.to_rpc())?;
            Ok(Value::Null)
        }
        Method::Close => {
            let p: TokenParams = parse_params(params)?;
            lookup(registry, &p.token)?
                .close()
                .map_err(|e| e.to_rpc())?;
            info!(token = %p.token, "endpoint closed");
            Ok(Value::Null)
        }
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, jsonrpc::Error> {
    serde_json::from_value(params).map_err(|e| jsonrpc::Error {
        code: codes::INVALID_PARAMS,
        message: "Invalid params".into(),
        data: Some(json!(e.to_string())),
    })
}

fn lookup(registry: &Registry, token: &str) -> Result<Endpoint, jsonrpc::Error> {
    registry
        .get(token)
        .map(|e| e.value().clone())
        .ok_or_else(|| ChannelError::UnknownEndpoint(token.to_string()).to_rpc())
}

fn wrong_kind(token: &str, expected: EndpointKind) -> jsonrpc::Error {
    ChannelError::Protocol(format!("`{token}` is not a {expected}")).to_rpc()
}
