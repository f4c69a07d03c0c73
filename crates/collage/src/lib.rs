//! Peer-to-peer distributed objects for clusters.
//!
//! A [`LocalNode`] hosts user objects and replicates their versioned state
//! to peer nodes. A process registers *master* objects, which produce new
//! versions on [`ObjectHandle::commit`], and maps *slave* objects, which
//! receive versioned data and apply it on [`ObjectHandle::sync`]. The
//! replication policy per object is selected by its [`ChangeType`].

pub mod barrier;
pub mod buffer;
pub mod command;
pub mod compress;
pub mod connection;
pub mod serial;

mod cm;
mod global;
mod ident;
mod instance_cache;
mod local_node;
mod node;
mod object;
mod request;
mod store;

pub use barrier::Barrier;
pub use global::Globals;
pub use ident::{NodeId, ObjectId, ObjectVersion, Version};
pub use local_node::{LocalNode, NodeStats, PushEvent, SendToken};
pub use node::Node;
pub use object::{
    ChangeType, Object, ObjectContext, ObjectHandle, Outbound, INSTANCE_ALL, INSTANCE_INVALID,
    INSTANCE_NONE,
};
pub use serial::{DataIStream, DataOStream};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("request timed out")]
    Timeout,
    #[error("barrier entry timed out")]
    BarrierTimeout,
    #[error("peer {0} is unreachable")]
    Unreachable(NodeId),
    #[error("protocol version mismatch: peer speaks {peer}, local is {local}")]
    ProtocolMismatch { peer: u32, local: u32 },
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),
    #[error("mapping failed: {0}")]
    MapFailed(&'static str),
    #[error("data stream ended unexpectedly")]
    UnexpectedEnd,
    #[error("object is not attached")]
    NotAttached,
    #[error("object {0} is already attached")]
    AlreadyAttached(ObjectId),
    #[error("no compressor registered under '{0}'")]
    UnknownCompressor(String),
    #[error("failed to decompress object data")]
    Decompress(#[source] lz4_flex::block::DecompressError),
    #[error("connection closed")]
    Closed,
    #[error("node is not listening")]
    NotListening,
    #[error("{0}")]
    InvalidState(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
