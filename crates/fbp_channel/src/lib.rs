pub mod channel;
pub mod client;
pub mod endpoint;
pub mod error;
pub mod host;
pub mod jsonrpc;
pub mod message;
pub mod negotiator;
pub mod ports;
pub mod server;
pub mod sturdy_ref;

pub use channel::{Channel, ChannelState, ClosePolicy, ReaderHandle, WriterHandle};
pub use client::{Connection, ConnectionManager, RemoteReader, RemoteWriter};
pub use endpoint::{ChannelReader, ChannelWriter, Endpoint, EndpointKind};
pub use error::ChannelError;
pub use host::{ChannelHost, HostOptions};
pub use message::{Attribute, Ip, Msg, NamedPortRef, PortInfos, PortRef, StartupInfo, StartupReport};
pub use negotiator::{NegotiationError, Negotiator};
pub use ports::{OutPort, Ports};
pub use sturdy_ref::SturdyRef;
