//! Wire payload types shared by the frontier dispatcher and the ring.
//!
//! Payloads are rkyv-encoded; decoding validates the archive because these
//! bytes arrive from other nodes.

use rkyv::{Archive, Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
#[error("wire codec: {0}")]
pub struct WireError(pub String);

macro_rules! wire_codec {
    ($($ty:ty),+ $(,)?) => {$(
        impl $ty {
            pub fn to_wire(&self) -> Result<Vec<u8>, WireError> {
                rkyv::to_bytes::<_, 1024>(self)
                    .map(|bytes| bytes.to_vec())
                    .map_err(|e| WireError(e.to_string()))
            }

            pub fn from_wire(bytes: &[u8]) -> Result<Self, WireError> {
                rkyv::from_bytes::<Self>(bytes).map_err(|e| WireError(e.to_string()))
            }
        }
    )+};
}

/// URLs routed to the node that owns their hosts (`url.found`), and also the
/// key list of a `keys.lock` request.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[archive_attr(derive(bytecheck::CheckBytes))]
pub struct UrlBatch {
    pub urls: Vec<String>,
}

/// One `lock.notify` stream block: the host key whose in-flight work has
/// drained, plus its serialized Bloom filter.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[archive_attr(derive(bytecheck::CheckBytes))]
pub struct KeyLockNotification {
    pub key: String,
    pub bloom: Vec<u8>,
}

/// A node on the ring.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[archive_attr(derive(bytecheck::CheckBytes))]
pub struct NodeMsg {
    pub id: [u8; 20],
    pub addr: String,
}

/// `dht.find_successor` request.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[archive_attr(derive(bytecheck::CheckBytes))]
pub struct KeyMsg {
    pub id: [u8; 20],
}

/// Request addressed to one virtual node of a peer.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[archive_attr(derive(bytecheck::CheckBytes))]
pub struct VnodeQuery {
    pub vnode: [u8; 20],
}

/// `dht.get_predecessor` response.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[archive_attr(derive(bytecheck::CheckBytes))]
pub struct OptNodeMsg {
    pub node: Option<NodeMsg>,
}

/// `dht.notify` request.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[archive_attr(derive(bytecheck::CheckBytes))]
pub struct NotifyMsg {
    pub vnode: [u8; 20],
    pub node: NodeMsg,
}

/// `dht.get_succ_list` response.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[archive_attr(derive(bytecheck::CheckBytes))]
pub struct NodeListMsg {
    pub nodes: Vec<NodeMsg>,
}

wire_codec!(
    UrlBatch,
    KeyLockNotification,
    NodeMsg,
    KeyMsg,
    VnodeQuery,
    OptNodeMsg,
    NotifyMsg,
    NodeListMsg,
);
