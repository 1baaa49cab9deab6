//! Component side: connecting the ports named in a `PortInfos` message.

use std::collections::HashMap;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::client::{ConnectionManager, RemoteReader, RemoteWriter};
use crate::endpoint::{ChannelReader, ChannelWriter};
use crate::error::ChannelError;
use crate::message::{Msg, PortInfos, PortRef};

/// An out port: one writer, or a fan-out array of writers.
#[derive(Debug, Clone)]
pub enum OutPort {
    Single(RemoteWriter),
    Array(Vec<RemoteWriter>),
}

impl OutPort {
    pub fn len(&self) -> usize {
        match self {
            OutPort::Single(_) => 1,
            OutPort::Array(ws) => ws.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn writers(&self) -> Vec<&RemoteWriter> {
        match self {
            OutPort::Single(w) => vec![w],
            OutPort::Array(ws) => ws.iter().collect(),
        }
    }

    /// Writes `msg` to every writer of the port.
    pub async fn write(&self, msg: Msg) -> Result<(), ChannelError> {
        match self {
            OutPort::Single(w) => w.write(msg).await,
            OutPort::Array(ws) => {
                for w in ws {
                    w.write(msg.clone()).await?;
                }
                Ok(())
            }
        }
    }

    pub async fn close(&self) -> Result<(), ChannelError> {
        let mut first_err = None;
        for w in self.writers() {
            if let Err(e) = w.close().await {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Connected in and out ports of one component instance.
#[derive(Debug, Clone)]
pub struct Ports {
    in_ports: HashMap<String, RemoteReader>,
    out_ports: HashMap<String, OutPort>,
}

impl Ports {
    /// Reads exactly one `PortInfos` from `port_infos_sr` and connects the
    /// ports listed in `ins` and `outs`. Ports the message does not mention
    /// stay unconnected.
    ///
    /// The port-info reader is left open; parallel instances share it.
    pub async fn from_port_infos_reader(
        connections: &ConnectionManager,
        port_infos_sr: &str,
        ins: &[&str],
        outs: &[&str],
    ) -> Result<Self, ChannelError> {
        let reader = connections.reader(port_infos_sr).await?;
        let infos = PortInfos::from_msg(reader.read().await?)?;
        debug!(
            in_ports = infos.in_ports.len(),
            out_ports = infos.out_ports.len(),
            "port infos received"
        );
        Self::connect(connections, &infos, ins, outs).await
    }

    pub async fn connect(
        connections: &ConnectionManager,
        infos: &PortInfos,
        ins: &[&str],
        outs: &[&str],
    ) -> Result<Self, ChannelError> {
        let mut in_ports = HashMap::new();
        for port in &infos.in_ports {
            if !ins.contains(&port.name.as_str()) {
                warn!(port = %port.name, "ignoring undeclared in port");
                continue;
            }
            let PortRef::Single { sr } = &port.target else {
                return Err(ChannelError::MalformedMessage(format!(
                    "in port `{}` cannot be an array",
                    port.name
                )));
            };
            in_ports.insert(port.name.clone(), connections.reader(sr).await?);
        }

        let mut out_ports = HashMap::new();
        for port in &infos.out_ports {
            if !outs.contains(&port.name.as_str()) {
                warn!(port = %port.name, "ignoring undeclared out port");
                continue;
            }
            let out = match &port.target {
                PortRef::Single { sr } => OutPort::Single(connections.writer(sr).await?),
                PortRef::Array { srs } => {
                    let mut writers = Vec::with_capacity(srs.len());
                    for sr in srs {
                        writers.push(connections.writer(sr).await?);
                    }
                    OutPort::Array(writers)
                }
            };
            out_ports.insert(port.name.clone(), out);
        }

        Ok(Self {
            in_ports,
            out_ports,
        })
    }

    pub fn in_port(&self, name: &str) -> Option<&RemoteReader> {
        self.in_ports.get(name)
    }

    pub fn out_port(&self, name: &str) -> Option<&OutPort> {
        self.out_ports.get(name)
    }

    /// Closes every out port, which signals `done` downstream.
    pub async fn close_out_ports(&self) -> Result<(), ChannelError> {
        let mut first_err = None;
        for (name, port) in &self.out_ports {
            if let Err(e) = port.close().await {
                warn!(port = %name, error = %e, "closing out port failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Reads one message from in port `port` and merges it into `config`.
    ///
    /// Returns whether anything was merged. Non-object payloads are logged
    /// and skipped.
    pub async fn update_config_from_port(
        &self,
        config: &mut Map<String, Value>,
        port: &str,
    ) -> Result<bool, ChannelError> {
        let Some(reader) = self.in_port(port) else {
            return Ok(false);
        };
        match reader.read().await? {
            Msg::Value(ip) => Ok(merge_config(config, ip.content)),
            Msg::Done => Ok(false),
        }
    }
}

/// Merges the keys of a JSON object into `config`.
pub fn merge_config(config: &mut Map<String, Value>, update: Value) -> bool {
    match update {
        Value::Object(update) => {
            config.extend(update);
            true
        }
        other => {
            warn!(payload = %other, "config update is not an object, skipped");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_overrides_and_keeps() {
        let mut cfg = json!({"path": "a.txt", "append": false})
            .as_object()
            .cloned()
            .unwrap();
        assert!(merge_config(&mut cfg, json!({"append": true})));
        assert_eq!(cfg["path"], json!("a.txt"));
        assert_eq!(cfg["append"], json!(true));
        assert!(!merge_config(&mut cfg, json!("nope")));
    }
}
