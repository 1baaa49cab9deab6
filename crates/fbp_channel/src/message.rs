use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ChannelError;

/// What travels through a channel: either an information packet or the
/// end-of-stream marker of one writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Msg {
    Value(Ip),
    Done,
}

impl Msg {
    pub fn value(content: impl Into<Value>) -> Self {
        Msg::Value(Ip::new(content))
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Msg::Done)
    }

    pub fn into_ip(self) -> Option<Ip> {
        match self {
            Msg::Value(ip) => Some(ip),
            Msg::Done => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub key: String,
    pub value: Value,
}

/// Information packet. The channel layer never looks inside.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Ip {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<Attribute>,
    #[serde(default)]
    pub content: Value,
}

impl Ip {
    pub fn new(content: impl Into<Value>) -> Self {
        Self {
            attributes: Vec::new(),
            content: content.into(),
        }
    }

    /// Sets (or replaces) an attribute, keeping insertion order.
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|a| a.key == key) {
            Some(attr) => attr.value = value,
            None => self.attributes.push(Attribute { key, value }),
        }
        self
    }

    pub fn attr(&self, key: &str) -> Option<&Value> {
        self.attributes
            .iter()
            .find(|a| a.key == key)
            .map(|a| &a.value)
    }

    /// Content, or the named attribute when `from_attr` is set.
    pub fn read_field(&self, from_attr: Option<&str>) -> Option<&Value> {
        match from_attr {
            Some(key) => self.attr(key),
            None => Some(&self.content),
        }
    }

    /// New packet with `content` that carries over this packet's attributes.
    pub fn derive(&self, content: impl Into<Value>) -> Self {
        Self {
            attributes: self.attributes.clone(),
            content: content.into(),
        }
    }
}

/// References of one freshly created channel, `refs[i]` belongs to endpoint `i`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartupInfo {
    pub buffer_size: usize,
    pub reader_refs: Vec<String>,
    pub writer_refs: Vec<String>,
}

/// A `StartupInfo` tagged with the requester's correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartupReport {
    pub id: String,
    pub info: StartupInfo,
}

impl StartupReport {
    pub fn new(id: impl Into<String>, info: StartupInfo) -> Self {
        Self { id: id.into(), info }
    }

    pub fn to_msg(&self) -> Result<Msg, ChannelError> {
        Ok(Msg::Value(Ip::new(serde_json::to_value(self)?)))
    }

    pub fn from_ip(ip: &Ip) -> Result<Self, ChannelError> {
        Ok(serde_json::from_value(ip.content.clone())?)
    }
}

/// Reference(s) bound to one named port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortRef {
    Single {
        #[serde(rename = "ref")]
        sr: String,
    },
    Array {
        #[serde(rename = "refs")]
        srs: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedPortRef {
    pub name: String,
    #[serde(flatten)]
    pub target: PortRef,
}

impl NamedPortRef {
    pub fn single(name: impl Into<String>, sr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: PortRef::Single { sr: sr.into() },
        }
    }

    pub fn array(name: impl Into<String>, srs: Vec<String>) -> Self {
        Self {
            name: name.into(),
            target: PortRef::Array { srs },
        }
    }
}

/// First message every component reads: where its ports live.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortInfos {
    #[serde(default)]
    pub in_ports: Vec<NamedPortRef>,
    #[serde(default)]
    pub out_ports: Vec<NamedPortRef>,
}

impl PortInfos {
    pub fn to_msg(&self) -> Result<Msg, ChannelError> {
        Ok(Msg::Value(Ip::new(serde_json::to_value(self)?)))
    }

    pub fn from_msg(msg: Msg) -> Result<Self, ChannelError> {
        match msg {
            Msg::Value(ip) => Ok(serde_json::from_value(ip.content)?),
            Msg::Done => Err(ChannelError::MalformedMessage(
                "expected port infos, got done".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn done_is_a_bare_tag_on_the_wire() {
        assert_eq!(serde_json::to_value(Msg::Done).unwrap(), json!("done"));
        let v = serde_json::to_value(Msg::value("hi")).unwrap();
        assert_eq!(v, json!({"value": {"content": "hi"}}));
    }

    #[test]
    fn port_infos_use_ref_and_refs() {
        let pis = PortInfos {
            in_ports: vec![NamedPortRef::single("in", "fbp://h:1/a")],
            out_ports: vec![NamedPortRef::array(
                "out",
                vec!["fbp://h:1/b".into(), "fbp://h:1/c".into()],
            )],
        };
        let v = serde_json::to_value(&pis).unwrap();
        assert_eq!(
            v,
            json!({
                "inPorts": [{"name": "in", "ref": "fbp://h:1/a"}],
                "outPorts": [{"name": "out", "refs": ["fbp://h:1/b", "fbp://h:1/c"]}],
            })
        );
        let back = PortInfos::from_msg(pis.to_msg().unwrap()).unwrap();
        assert_eq!(back, pis);
    }

    #[test]
    fn attributes_keep_order_and_replace() {
        let ip = Ip::new(1)
            .with_attr("a", 1)
            .with_attr("b", 2)
            .with_attr("a", 3);
        assert_eq!(ip.attributes.len(), 2);
        assert_eq!(ip.attributes[0].key, "a");
        assert_eq!(ip.attr("a"), Some(&json!(3)));
        assert_eq!(ip.read_field(Some("b")), Some(&json!(2)));
        assert_eq!(ip.derive("x").attr("b"), Some(&json!(2)));
    }

    #[test]
    fn startup_report_needs_an_id() {
        let ip = Ip::new(json!({"info": {"bufferSize": 1, "readerRefs": [], "writerRefs": []}}));
        assert!(matches!(
            StartupReport::from_ip(&ip),
            Err(ChannelError::MalformedMessage(_))
        ));
    }
}
