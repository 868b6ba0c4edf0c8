//! Networking and replication core for the Ember engine.
//!
//! Keeps game object state and remote procedure calls consistent between an
//! authoritative server and its clients over plain UDP: a reliability layer
//! on top of unreliable datagrams, per-connection delta replication with
//! bandwidth shaping, RPC routing, and session discovery. Everything is
//! driven from one [`NetContext::update`] call per game tick; nothing here
//! spawns threads or blocks.

mod connection;
mod context;
mod message;
mod reliability;
mod replication;
mod rpc;
mod session;
mod stats;
mod transport;
mod value;

pub use connection::{
    Connection, ConnectionRegistry, ConnectionState, HostId, INVALID_HOST_ID, NetHost,
};
pub use context::{NetCallbacks, NetConfig, NetContext, NetStatus};
pub use message::{
    CodecError, DEFAULT_PORT, Datagram, FieldUpdate, MAX_DATAGRAM_SIZE, Message, MessageHeader,
    MessageKind, PROTOCOL_MAGIC, PROTOCOL_VERSION, Reader, RejectReason,
};
pub use reliability::{
    AckTracker, ReceiveTracker, ReliableInbound, ReliableOutbound, sequence_greater_than,
};
pub use replication::{
    INVALID_NET_ID, NetId, NetObject, NetObjectFlags, ObjectFactory, RateClass, ReplicationCursor,
    ReplicationEngine, UpdateManifest,
};
pub use rpc::{
    MAX_RPC_PARAMS, NetFunc, NetFuncType, RpcRegistry, RpcRoute, RpcTarget, accepts_remote,
    route_call,
};
pub use session::{Discovery, DiscoveredSession, SessionInfo, SessionManager};
pub use stats::{NetworkStats, PacketLossSimulation};
pub use transport::{NetSocket, addr_to_u32, ip_to_u32, u32_to_addr, u32_to_ip};
pub use value::{NetValue, NetValueKind};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("unknown object {0}")]
    UnknownObject(NetId),
    #[error("no factory registered for class '{0}'")]
    UnknownClass(String),
    #[error("object {0} has no field {1}")]
    BadField(NetId, usize),
    #[error("unknown rpc index {0}")]
    UnknownFunc(u8),
    #[error("rpc '{0}' already registered")]
    DuplicateFunc(String),
    #[error("argument list does not match signature of '{0}'")]
    SignatureMismatch(String),
    #[error("too many rpc parameters ({0}, max {MAX_RPC_PARAMS})")]
    TooManyParams(usize),
}
