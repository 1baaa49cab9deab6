//! Runs a flow: starts one channel process per link plus one for port
//! infos, collects their references through the negotiator and launches
//! every component once all of its ports are resolved.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::process::ExitStatus;

use fbp_channel::{
    ChannelWriter, ConnectionManager, Msg, NamedPortRef, NegotiationError, Negotiator, PortInfos,
    RemoteWriter, StartupInfo,
};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::FlowConfig;
use crate::error::FlowError;
use crate::flow::{CONFIG_PORT, Flow, Link, Node, NodeKind, NodePorts};
use crate::process::{ChannelLauncher, ChannelRequest, ManagedProcess, ProcessRole, ProcessSet};

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Path to the `fbp-channel` executable.
    pub channel_bin: PathBuf,
    pub config: FlowConfig,
    /// Passed on to channel processes.
    pub log_level: String,
}

/// What a finished run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Component processes started, instances included.
    pub started: usize,
    /// Nodes waited for, in the order they finished.
    pub finished: Vec<String>,
}

/// Runs `flow` to completion, or until `shutdown` resolves.
///
/// Whatever happens, every process the run started is gone when this returns.
pub async fn run<F>(flow: &Flow, options: &RunOptions, shutdown: F) -> Result<RunSummary, FlowError>
where
    F: Future<Output = ()>,
{
    let mut processes = ProcessSet::new();
    let outcome = tokio::select! {
        outcome = run_flow(flow, options, &mut processes) => outcome,
        _ = shutdown => {
            warn!("flow cancelled");
            Err(FlowError::Cancelled)
        }
    };
    if let Err(e) = &outcome {
        error!(error = %e, "flow failed, tearing down");
    }
    let stopped = processes.stop_all().await;
    debug!(stopped, "flow torn down");
    outcome
}

#[derive(Debug, Clone, Copy)]
enum Target {
    Link(usize),
    PortInfos,
}

async fn negotiate<F>(target: Target, infos: F) -> (Target, Result<Vec<StartupInfo>, NegotiationError>)
where
    F: Future<Output = Result<Vec<StartupInfo>, NegotiationError>>,
{
    (target, infos.await)
}

enum Event {
    Negotiated(Target, Result<Vec<StartupInfo>, NegotiationError>),
    Exited(ManagedProcess, Result<ExitStatus, FlowError>),
}

/// Tracks process exits: the nodes the run waits for, and any process that
/// ends when it should not.
#[derive(Debug)]
struct Exits {
    /// node → instances still running
    waiting: HashMap<String, usize>,
    /// whether `waiting` holds sinks or, for a flow without any, every component
    sinks: bool,
    finished: Vec<String>,
}

impl Exits {
    fn new(flow: &Flow) -> Self {
        let sinks = flow.sinks();
        let has_sinks = !sinks.is_empty();
        let waited: Vec<&Node> = if has_sinks { sinks } else { flow.components().collect() };
        let waiting = waited
            .into_iter()
            .filter_map(|n| match n.kind {
                NodeKind::Component { instances, .. } => Some((n.id.clone(), instances)),
                NodeKind::Literal(_) => None,
            })
            .collect();
        Self {
            waiting,
            sinks: has_sinks,
            finished: Vec::new(),
        }
    }

    fn done(&self) -> bool {
        self.waiting.is_empty()
    }

    fn record(&mut self, process: ManagedProcess, status: Result<ExitStatus, FlowError>) -> Result<(), FlowError> {
        let status = status?;
        let name = process.name().to_string();
        if process.role() == ProcessRole::Channel {
            return Err(FlowError::ProcessStart {
                name,
                reason: format!("exited with {status} while the flow was running"),
            });
        }
        let Some(left) = self.waiting.get_mut(&name) else {
            if !status.success() {
                return Err(FlowError::ComponentFailed {
                    node: name,
                    status: status.to_string(),
                });
            }
            debug!(node = %name, "component finished");
            return Ok(());
        };
        if !status.success() {
            let status = status.to_string();
            return Err(if self.sinks {
                FlowError::SinkFailed { node: name, status }
            } else {
                FlowError::ComponentFailed { node: name, status }
            });
        }
        *left -= 1;
        if *left == 0 {
            self.waiting.remove(&name);
        }
        info!(node = %name, "finished");
        self.finished.push(name);
        Ok(())
    }
}

/// Port references collected so far.
#[derive(Debug, Default)]
struct Resolved {
    /// link index → reader ref of its channel
    readers: HashMap<usize, String>,
    /// link index → writer ref of its channel
    writers: HashMap<usize, String>,
    /// port-info channels not yet handed to a component
    port_infos: Vec<StartupInfo>,
}

impl Resolved {
    fn port_infos_for(&self, ports: &NodePorts) -> Option<PortInfos> {
        let mut infos = PortInfos::default();
        for (name, link) in &ports.ins {
            infos
                .in_ports
                .push(NamedPortRef::single(name, self.readers.get(link)?.clone()));
        }
        for (name, links) in &ports.outs {
            let refs = links
                .iter()
                .map(|l| self.writers.get(l).cloned())
                .collect::<Option<Vec<_>>>()?;
            let port = match refs.as_slice() {
                [single] => NamedPortRef::single(name, single.clone()),
                _ => NamedPortRef::array(name, refs),
            };
            infos.out_ports.push(port);
        }
        Some(infos)
    }
}

struct Launch<'a> {
    flow: &'a Flow,
    connections: &'a ConnectionManager,
    processes: &'a mut ProcessSet,
    node_ports: HashMap<String, NodePorts>,
    launched: HashSet<String>,
    port_info_writers: Vec<RemoteWriter>,
    started: usize,
}

impl Launch<'_> {
    /// Starts every component whose ports are all resolved.
    async fn ready_nodes(&mut self, resolved: &mut Resolved) -> Result<(), FlowError> {
        let flow = self.flow;
        for node in flow.components() {
            if self.launched.contains(&node.id) || resolved.port_infos.is_empty() {
                continue;
            }
            let Some(infos) = resolved.port_infos_for(&self.node_ports[&node.id]) else {
                continue;
            };
            let Some(channel) = resolved.port_infos.pop() else {
                break;
            };
            self.start(node, infos, channel).await?;
        }
        Ok(())
    }

    async fn start(&mut self, node: &Node, infos: PortInfos, channel: StartupInfo) -> Result<(), FlowError> {
        let NodeKind::Component { cmd, instances } = &node.kind else {
            return Ok(());
        };
        let (Some(reader_sr), Some(writer_sr)) =
            (channel.reader_refs.first(), channel.writer_refs.first())
        else {
            return Err(FlowError::invalid("port-info channel reported no endpoints"));
        };
        let (program, args) = cmd
            .split_first()
            .ok_or_else(|| FlowError::invalid(format!("node `{}` has no command", node.id)))?;

        for instance in 0..*instances {
            let process = ManagedProcess::spawn(
                node.id.clone(),
                program,
                args.iter().map(String::as_str).chain([reader_sr.as_str()]),
            )?;
            info!(node = %node.id, instance, pid = ?process.id(), "component started");
            self.processes.push(process);
        }
        self.launched.insert(node.id.clone());
        self.started += instances;

        let writer = self
            .connections
            .writer(writer_sr)
            .await
            .map_err(|e| FlowError::channel(format!("port infos of `{}`", node.id), e))?;
        let msg = infos
            .to_msg()
            .map_err(|e| FlowError::channel(format!("port infos of `{}`", node.id), e))?;
        for _ in 0..*instances {
            writer
                .write(msg.clone())
                .await
                .map_err(|e| FlowError::channel(format!("port infos of `{}`", node.id), e))?;
        }
        // stays open until the run ends
        self.port_info_writers.push(writer);
        Ok(())
    }
}

/// How many copies of a literal `link` carries: config literals reach every
/// instance of their node, any other literal is sent once.
fn literal_copies(flow: &Flow, link: &Link) -> usize {
    if link.target.port != CONFIG_PORT {
        return 1;
    }
    match flow.node(&link.target.node_id).map(|n| &n.kind) {
        Some(NodeKind::Component { instances, .. }) => *instances,
        _ => 1,
    }
}

async fn send_literal(
    connections: &ConnectionManager,
    writer_sr: &str,
    content: &Value,
    copies: usize,
) -> Result<(), fbp_channel::ChannelError> {
    let writer = connections.writer(writer_sr).await?;
    for _ in 0..copies {
        writer.write(Msg::value(content.clone())).await?;
    }
    writer.write(Msg::Done).await
}

async fn run_flow(
    flow: &Flow,
    options: &RunOptions,
    processes: &mut ProcessSet,
) -> Result<RunSummary, FlowError> {
    let config = &options.config;
    let launcher = ChannelLauncher {
        bin: options.channel_bin.clone(),
        host: config.channel_host.clone(),
        log_level: options.log_level.clone(),
        log_dir: config.log_dir.clone(),
    };

    let (bootstrap, reports_sr, report_writer_sr) =
        launcher.start_bootstrap(config.startup_timeout).await?;
    processes.push(bootstrap);

    let connections = ConnectionManager::new(config.connect_timeout, config.connect_retry);
    let reports = connections
        .reader(&reports_sr)
        .await
        .map_err(|e| FlowError::channel("bootstrap report channel", e))?;
    let negotiator = Negotiator::start(reports);

    let mut pending = FuturesUnordered::new();
    for (i, link) in flow.links().iter().enumerate() {
        // literals are written before anyone reads, so they must fit
        let buffer_size = match flow.node(&link.source.node_id) {
            Some(source) if source.is_literal() => config.buffer_size.max(literal_copies(flow, link)),
            _ => config.buffer_size,
        };
        let request = ChannelRequest {
            name: format!("link-{i}"),
            id: link.correlation_id(),
            no_of_channels: 1,
            buffer_size,
        };
        let (process, infos) =
            launcher.start_channels(&negotiator, request, &report_writer_sr, config.startup_timeout)?;
        processes.push(process);
        pending.push(negotiate(Target::Link(i), infos));
    }

    let components = flow.component_count();
    if components > 0 {
        let max_instances = flow
            .components()
            .map(|n| match n.kind {
                NodeKind::Component { instances, .. } => instances,
                NodeKind::Literal(_) => 1,
            })
            .max()
            .unwrap_or(1);
        let request = ChannelRequest {
            name: "port-infos".into(),
            id: Uuid::new_v4().to_string(),
            no_of_channels: components,
            buffer_size: max_instances,
        };
        let (process, infos) =
            launcher.start_channels(&negotiator, request, &report_writer_sr, config.startup_timeout)?;
        processes.push(process);
        pending.push(negotiate(Target::PortInfos, infos));
    }

    let mut resolved = Resolved::default();
    let mut launch = Launch {
        flow,
        connections: &connections,
        processes,
        node_ports: flow.components().map(|n| (n.id.clone(), flow.ports(&n.id))).collect(),
        launched: HashSet::new(),
        port_info_writers: Vec::new(),
        started: 0,
    };

    let mut exits = Exits::new(flow);
    while !pending.is_empty() {
        let event = tokio::select! {
            Some((target, outcome)) = pending.next() => Event::Negotiated(target, outcome),
            Some((process, status)) = launch.processes.next_exit() => Event::Exited(process, status),
            else => break,
        };
        let (target, outcome) = match event {
            Event::Negotiated(target, outcome) => (target, outcome),
            Event::Exited(process, status) => {
                exits.record(process, status)?;
                continue;
            }
        };
        match target {
            Target::Link(i) => {
                let link = &flow.links()[i];
                let infos = outcome.map_err(|e| FlowError::negotiation(link.to_string(), e))?;
                let info = infos
                    .into_iter()
                    .next()
                    .ok_or_else(|| FlowError::invalid(format!("{link}: empty startup info")))?;
                let (Some(reader_sr), Some(writer_sr)) =
                    (info.reader_refs.first(), info.writer_refs.first())
                else {
                    return Err(FlowError::invalid(format!("{link}: channel has no endpoints")));
                };
                debug!(%link, "link channel ready");

                match flow.node(&link.source.node_id).map(|n| &n.kind) {
                    Some(NodeKind::Literal(content)) => {
                        send_literal(&connections, writer_sr, content, literal_copies(flow, link))
                            .await
                            .map_err(|e| FlowError::channel(link.to_string(), e))?;
                    }
                    _ => {
                        resolved.writers.insert(i, writer_sr.clone());
                    }
                }
                resolved.readers.insert(i, reader_sr.clone());
            }
            Target::PortInfos => {
                resolved.port_infos = outcome
                    .map_err(|e| FlowError::negotiation("port-info channels", e))?;
                // pop() hands them out in flow order
                resolved.port_infos.reverse();
            }
        }
        launch.ready_nodes(&mut resolved).await?;
    }

    if let Some(stuck) = flow.components().find(|n| !launch.launched.contains(&n.id)) {
        return Err(FlowError::invalid(format!(
            "node `{}` could not be started: unresolved ports",
            stuck.id
        )));
    }
    info!(components = launch.started, "all components started");

    // channel processes stay in the set, so one dying fails the run here too
    while !exits.done() {
        let Some((process, status)) = launch.processes.next_exit().await else {
            break;
        };
        exits.record(process, status)?;
    }
    let summary = RunSummary {
        started: launch.started,
        finished: exits.finished,
    };

    for writer in &launch.port_info_writers {
        if let Err(e) = writer.close().await {
            debug!(error = %e, "port-info writer already closed");
        }
    }
    info!("all sinks finished");
    Ok(summary)
}
