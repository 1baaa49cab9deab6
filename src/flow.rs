//! Static flow graphs: loading, command resolution and validation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use petgraph::Direction;
use petgraph::graph::NodeIndex;
use petgraph::prelude::StableDiGraph;
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::FlowError;

/// Port every synthesized config literal is wired to.
pub const CONFIG_PORT: &str = "conf";

/// Namespace for link correlation ids.
const LINK_NAMESPACE: Uuid = Uuid::from_u128(0x6b1f_0c2e_5a7d_4e19_9c3b_2f8a_71d4_e605);

// ---------------------------------------------------------------------------
// On-disk format
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowFile {
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub links: Vec<LinkSpec>,
    #[serde(default)]
    pub cmds: Option<CmdFiles>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CmdFiles {
    One(String),
    Many(Vec<String>),
}

impl CmdFiles {
    fn paths(&self) -> Vec<&str> {
        match self {
            CmdFiles::One(p) => vec![p.as_str()],
            CmdFiles::Many(ps) => ps.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentSpec {
    pub cmd: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    pub node_id: String,
    #[serde(default)]
    pub component_id: Option<String>,
    #[serde(default)]
    pub component: Option<ComponentSpec>,
    #[serde(default)]
    pub content: Option<Value>,
    #[serde(default)]
    pub config: Option<Value>,
    #[serde(default)]
    pub parallel_processes: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortAddr {
    pub node_id: String,
    pub port: String,
}

impl PortAddr {
    pub fn new(node_id: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            port: port.into(),
        }
    }
}

impl fmt::Display for PortAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node_id, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkSpec {
    pub source: PortAddr,
    pub target: PortAddr,
}

// ---------------------------------------------------------------------------
// Resolved flow
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// Never spawned; its content is written straight into the link.
    Literal(Value),
    Component { cmd: Vec<String>, instances: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: String,
    pub kind: NodeKind,
}

impl Node {
    pub fn is_literal(&self) -> bool {
        matches!(self.kind, NodeKind::Literal(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Link {
    pub source: PortAddr,
    pub target: PortAddr,
}

impl Link {
    /// Deterministic id under which the link's channel reports its refs.
    pub fn correlation_id(&self) -> String {
        let key = format!(
            "{}\u{0}{}\u{0}{}\u{0}{}",
            self.source.node_id, self.source.port, self.target.node_id, self.target.port
        );
        Uuid::new_v5(&LINK_NAMESPACE, key.as_bytes()).to_string()
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link {} -> {}", self.source, self.target)
    }
}

/// The ports a component node needs resolved before it can start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodePorts {
    /// In port name → index of the link feeding it.
    pub ins: BTreeMap<String, usize>,
    /// Out port name → indices of the links leaving it; more than one makes an array port.
    pub outs: BTreeMap<String, Vec<usize>>,
}

#[derive(Debug, Clone)]
pub struct Flow {
    pub path: Option<PathBuf>,
    nodes: BTreeMap<String, Node>,
    links: Vec<Link>,
    graph: StableDiGraph<String, usize>,
    index_of: HashMap<String, NodeIndex>,
}

impl Flow {
    pub fn load(path: &Path) -> Result<Self, FlowError> {
        let raw = fs::read_to_string(path)
            .map_err(|e| FlowError::invalid(format!("cannot read {}: {e}", path.display())))?;
        let file: FlowFile = serde_json::from_str(&raw)
            .map_err(|e| FlowError::invalid(format!("{}: {e}", path.display())))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let cmds = load_cmds(&file, base)?;
        let mut flow = Self::build(file, &cmds)?;
        flow.path = Some(path.to_path_buf());
        info!(
            flow = %path.display(),
            nodes = flow.nodes.len(),
            links = flow.links.len(),
            "flow loaded"
        );
        Ok(flow)
    }

    /// Builds and validates a flow with `cmds` mapping component ids to command lines.
    pub fn build(file: FlowFile, cmds: &HashMap<String, String>) -> Result<Self, FlowError> {
        let mut nodes = BTreeMap::new();
        let mut configs = Vec::new();
        for spec in &file.nodes {
            if nodes.contains_key(&spec.node_id) {
                return Err(FlowError::invalid(format!("duplicate node `{}`", spec.node_id)));
            }
            let node = resolve_node(spec, cmds)?;
            if let (Some(config), false) = (&spec.config, node.is_literal()) {
                configs.push((spec.node_id.clone(), config.clone()));
            }
            nodes.insert(spec.node_id.clone(), node);
        }

        let mut links: Vec<Link> = file
            .links
            .iter()
            .map(|l| Link {
                source: l.source.clone(),
                target: l.target.clone(),
            })
            .collect();

        // config literals for nodes whose conf port is not wired
        for (node_id, config) in configs {
            let wired = links
                .iter()
                .any(|l| l.target.node_id == node_id && l.target.port == CONFIG_PORT);
            if wired {
                continue;
            }
            let literal_id = format!("{node_id}#{CONFIG_PORT}");
            if nodes.contains_key(&literal_id) {
                return Err(FlowError::invalid(format!("node id `{literal_id}` is reserved")));
            }
            nodes.insert(
                literal_id.clone(),
                Node {
                    id: literal_id.clone(),
                    kind: NodeKind::Literal(config),
                },
            );
            links.push(Link {
                source: PortAddr::new(literal_id, "out"),
                target: PortAddr::new(node_id, CONFIG_PORT),
            });
        }

        let mut graph = StableDiGraph::new();
        let mut index_of = HashMap::new();
        for id in nodes.keys() {
            index_of.insert(id.clone(), graph.add_node(id.clone()));
        }

        let mut fed = HashSet::new();
        let mut seen = HashSet::new();
        for (i, link) in links.iter().enumerate() {
            if !seen.insert(link.clone()) {
                return Err(FlowError::invalid(format!("duplicate {link}")));
            }
            let (Some(&from), Some(&to)) = (
                index_of.get(&link.source.node_id),
                index_of.get(&link.target.node_id),
            ) else {
                return Err(FlowError::invalid(format!("{link} names an unknown node")));
            };
            if nodes[&link.target.node_id].is_literal() {
                return Err(FlowError::invalid(format!(
                    "{link} targets literal node `{}`",
                    link.target.node_id
                )));
            }
            if !fed.insert(link.target.clone()) {
                return Err(FlowError::invalid(format!(
                    "in port {} is fed by more than one link",
                    link.target
                )));
            }
            graph.add_edge(from, to, i);
        }

        debug!(nodes = nodes.len(), links = links.len(), "flow graph built");
        Ok(Self {
            path: None,
            nodes,
            links,
            graph,
            index_of,
        })
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn components(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values().filter(|n| !n.is_literal())
    }

    pub fn component_count(&self) -> usize {
        self.components().count()
    }

    /// Ports of `node_id` with the links resolving them.
    pub fn ports(&self, node_id: &str) -> NodePorts {
        let mut ports = NodePorts::default();
        let Some(&idx) = self.index_of.get(node_id) else {
            return ports;
        };
        for edge in self.graph.edges_directed(idx, Direction::Incoming) {
            let link = &self.links[*edge.weight()];
            ports.ins.insert(link.target.port.clone(), *edge.weight());
        }
        for edge in self.graph.edges_directed(idx, Direction::Outgoing) {
            let link = &self.links[*edge.weight()];
            ports
                .outs
                .entry(link.source.port.clone())
                .or_default()
                .push(*edge.weight());
        }
        for links in ports.outs.values_mut() {
            links.sort_unstable();
        }
        ports
    }

    /// Components without out links.
    pub fn sinks(&self) -> Vec<&Node> {
        self.components()
            .filter(|n| {
                self.index_of.get(&n.id).is_some_and(|&idx| {
                    self.graph
                        .neighbors_directed(idx, Direction::Outgoing)
                        .next()
                        .is_none()
                })
            })
            .collect()
    }
}

fn resolve_node(spec: &NodeSpec, cmds: &HashMap<String, String>) -> Result<Node, FlowError> {
    if let Some(content) = &spec.content {
        if spec.component.is_some() || spec.parallel_processes.is_some() {
            return Err(FlowError::invalid(format!(
                "literal node `{}` cannot have a component",
                spec.node_id
            )));
        }
        return Ok(Node {
            id: spec.node_id.clone(),
            kind: NodeKind::Literal(content.clone()),
        });
    }

    let cmd_line = match (&spec.component, &spec.component_id) {
        (Some(component), _) => Some(component.cmd.clone()),
        (None, Some(component_id)) => cmds.get(component_id).cloned(),
        (None, None) => None,
    };
    let cmd: Vec<String> = cmd_line
        .as_deref()
        .unwrap_or_default()
        .split_whitespace()
        .map(str::to_string)
        .collect();
    if cmd.is_empty() {
        return Err(FlowError::invalid(format!(
            "node `{}` has no command (component {})",
            spec.node_id,
            spec.component_id.as_deref().unwrap_or("-")
        )));
    }
    let instances = spec.parallel_processes.unwrap_or(1);
    if instances == 0 {
        return Err(FlowError::invalid(format!(
            "node `{}`: parallelProcesses must be at least 1",
            spec.node_id
        )));
    }
    Ok(Node {
        id: spec.node_id.clone(),
        kind: NodeKind::Component { cmd, instances },
    })
}

fn load_cmds(file: &FlowFile, base: &Path) -> Result<HashMap<String, String>, FlowError> {
    let mut cmds = HashMap::new();
    let Some(files) = &file.cmds else {
        return Ok(cmds);
    };
    for rel in files.paths() {
        let path = base.join(rel);
        let raw = fs::read_to_string(&path)
            .map_err(|e| FlowError::invalid(format!("cannot read cmds {}: {e}", path.display())))?;
        let map: HashMap<String, String> = serde_json::from_str(&raw)
            .map_err(|e| FlowError::invalid(format!("{}: {e}", path.display())))?;
        cmds.extend(map);
    }
    Ok(cmds)
}
