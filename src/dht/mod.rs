//! Chord-style consistent-hash overlay.
//!
//! Each physical peer runs several virtual nodes on a 160-bit SHA-1 ring.
//! A vnode owns the keys in `(predecessor, vnode]`. Stabilization, finger
//! repair and predecessor checks run as independent periodic tasks and
//! converge the ring after joins and failures; a single failed lookup is
//! never fatal.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::net::{NetError, Peer, RequestHandler};
use crate::proto::{KeyMsg, NodeListMsg, NodeMsg, NotifyMsg, OptNodeMsg, VnodeQuery};

pub mod id;

pub use id::RingId;

pub const FIND_SUCCESSOR: &str = "dht.find_successor";
pub const GET_PREDECESSOR: &str = "dht.get_predecessor";
pub const NOTIFY: &str = "dht.notify";
pub const GET_SUCC_LIST: &str = "dht.get_succ_list";

const FINGER_BITS: usize = 160;
const MAX_HOPS: usize = 32;

pub type BoxFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Error, Debug)]
pub enum DhtError {
    #[error("ring lookup failed: {0}")]
    Lookup(String),
    #[error(transparent)]
    Net(#[from] NetError),
    #[error("protocol: {0}")]
    Protocol(String),
}

/// Maps a routing key to the address of the owning node. The distributed
/// frontier depends on this seam so tests can pin ownership.
pub trait Router: Send + Sync {
    fn owner_of<'a>(&'a self, key: &'a [u8]) -> BoxFut<'a, Result<String, DhtError>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: RingId,
    pub addr: String,
}

impl NodeInfo {
    fn to_msg(&self) -> NodeMsg {
        NodeMsg {
            id: self.id.to_bytes(),
            addr: self.addr.clone(),
        }
    }

    fn from_msg(msg: &NodeMsg) -> Self {
        Self {
            id: RingId::from_bytes(msg.id),
            addr: msg.addr.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DhtConfig {
    pub vnode_num: usize,
    pub succ_list_len: usize,
    pub stabilize_interval: Duration,
    pub fix_fingers_interval: Duration,
    pub check_predecessor_interval: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            vnode_num: 4,
            succ_list_len: 4,
            stabilize_interval: Duration::from_millis(1_000),
            fix_fingers_interval: Duration::from_millis(1_000),
            check_predecessor_interval: Duration::from_millis(2_000),
        }
    }
}

struct Vnode {
    id: RingId,
    state: Mutex<VnodeState>,
}

struct VnodeState {
    predecessor: Option<NodeInfo>,
    /// `successors[0]` is the immediate successor; never empty.
    successors: Vec<NodeInfo>,
    fingers: Vec<Option<NodeInfo>>,
    next_finger: usize,
}

pub struct Dht {
    peer: Arc<Peer>,
    vnodes: Vec<Arc<Vnode>>,
    cfg: DhtConfig,
    cancel: CancellationToken,
}

impl Dht {
    /// Creates the local vnodes, registers RPC handlers and starts the
    /// periodic ring-maintenance tasks.
    pub fn new(peer: Arc<Peer>, cfg: DhtConfig, cancel: CancellationToken) -> Arc<Self> {
        let addr = peer.addr().to_string();
        let ids: Vec<RingId> = (0..cfg.vnode_num.max(1))
            .map(|i| RingId::vnode(&addr, i))
            .collect();
        // Local vnodes start linked in a sorted cycle so a lone node is
        // already a well-formed ring.
        let mut sorted = ids.clone();
        sorted.sort();
        let vnodes: Vec<Arc<Vnode>> = ids
            .iter()
            .map(|&id| {
                let position = sorted.iter().position(|&s| s == id).unwrap_or(0);
                let successor_id = sorted[(position + 1) % sorted.len()];
                Arc::new(Vnode {
                    id,
                    state: Mutex::new(VnodeState {
                        predecessor: None,
                        successors: vec![NodeInfo {
                            id: successor_id,
                            addr: addr.clone(),
                        }],
                        fingers: vec![None; FINGER_BITS],
                        next_finger: 0,
                    }),
                })
            })
            .collect();

        let dht = Arc::new(Self {
            peer,
            vnodes,
            cfg,
            cancel,
        });
        dht.register_handlers();
        dht.spawn_maintenance();
        dht
    }

    pub fn make_key(bytes: &[u8]) -> RingId {
        RingId::hash(bytes)
    }

    pub fn addr(&self) -> &str {
        self.peer.addr()
    }

    /// Joins an existing ring through a bootstrap peer. Individual lookup
    /// failures are logged and left for stabilization to repair.
    pub async fn join(&self, bootstrap: &str) -> Result<(), DhtError> {
        let mut joined = 0;
        for vnode in &self.vnodes {
            match self.rpc_find_successor(bootstrap, vnode.id).await {
                Ok(succ) => {
                    let mut state = vnode.state.lock();
                    state.successors = vec![succ];
                    state.predecessor = None;
                    joined += 1;
                }
                Err(e) => {
                    tracing::warn!(vnode = %vnode.id, error = %e, "join lookup failed");
                }
            }
        }
        if joined == 0 {
            return Err(DhtError::Lookup(format!(
                "no vnode could join via {}",
                bootstrap
            )));
        }
        tracing::info!(bootstrap, joined, "joined ring");
        Ok(())
    }

    /// Resolves the node owning `id`.
    pub async fn find_successor(&self, id: RingId) -> Result<NodeInfo, DhtError> {
        let mut vnode = self.closest_local_vnode(id);
        for _ in 0..MAX_HOPS {
            let (vnode_id, successor) = {
                let state = vnode.state.lock();
                (vnode.id, state.successors.first().cloned())
            };
            let successor = successor
                .ok_or_else(|| DhtError::Lookup("vnode has no successor".into()))?;

            if id.in_open_closed(vnode_id, successor.id) {
                return Ok(successor);
            }

            let next = self.closest_preceding_node(&vnode, id);
            if next.addr == self.peer.addr() {
                if next.id == vnode_id {
                    // No better candidate locally; push the lookup to the
                    // successor.
                    if successor.addr == self.peer.addr() {
                        match self.local_vnode(successor.id) {
                            Some(local) => {
                                vnode = local;
                                continue;
                            }
                            None => return Ok(successor),
                        }
                    }
                    return self.rpc_find_successor(&successor.addr, id).await;
                }
                match self.local_vnode(next.id) {
                    Some(local) => {
                        vnode = local;
                        continue;
                    }
                    None => return Ok(next),
                }
            }
            return self.rpc_find_successor(&next.addr, id).await;
        }
        Err(DhtError::Lookup(format!("no owner found for {:?}", id)))
    }

    /// One stabilization round over every local vnode. Also driven directly
    /// by tests that need deterministic convergence.
    pub async fn stabilize_all(&self) {
        for vnode in &self.vnodes {
            self.stabilize(vnode).await;
        }
    }

    /// One finger-repair round over every local vnode.
    pub async fn fix_fingers_all(&self) {
        for vnode in &self.vnodes {
            self.fix_fingers(vnode).await;
        }
    }

    /// Clears predecessors that no longer answer.
    pub async fn check_predecessors(&self) {
        for vnode in &self.vnodes {
            let predecessor = vnode.state.lock().predecessor.clone();
            let Some(predecessor) = predecessor else {
                continue;
            };
            if predecessor.addr == self.peer.addr() {
                continue;
            }
            let query = VnodeQuery {
                vnode: predecessor.id.to_bytes(),
            };
            let Ok(payload) = query.to_wire() else { continue };
            if let Err(e) = self
                .peer
                .request(&predecessor.addr, GET_PREDECESSOR, payload)
                .await
            {
                tracing::debug!(vnode = %vnode.id, error = %e, "predecessor unreachable, clearing");
                vnode.state.lock().predecessor = None;
            }
        }
    }

    async fn stabilize(&self, vnode: &Arc<Vnode>) {
        let successor = match vnode.state.lock().successors.first().cloned() {
            Some(successor) => successor,
            None => return,
        };

        // Ask the successor for its predecessor; an unreachable successor is
        // dropped in favor of the next entry in the successor list.
        let predecessor = if successor.addr == self.peer.addr() {
            self.local_vnode(successor.id)
                .and_then(|v| v.state.lock().predecessor.clone())
        } else {
            match self.rpc_get_predecessor(&successor.addr, successor.id).await {
                Ok(predecessor) => predecessor,
                Err(e) => {
                    tracing::debug!(successor = %successor.id, error = %e, "successor unreachable");
                    let mut state = vnode.state.lock();
                    if state.successors.len() > 1 {
                        state.successors.remove(0);
                    }
                    return;
                }
            }
        };

        if let Some(candidate) = predecessor {
            if candidate.id.in_open_open(vnode.id, successor.id) {
                vnode.state.lock().successors[0] = candidate;
            }
        }

        let successor = match vnode.state.lock().successors.first().cloned() {
            Some(successor) => successor,
            None => return,
        };
        let self_info = NodeInfo {
            id: vnode.id,
            addr: self.peer.addr().to_string(),
        };

        if successor.addr == self.peer.addr() {
            if let Some(local) = self.local_vnode(successor.id) {
                self.accept_notify(&local, self_info);
            }
            return;
        }

        if let Err(e) = self.rpc_notify(&successor.addr, successor.id, &self_info).await {
            tracing::debug!(successor = %successor.id, error = %e, "notify failed");
            return;
        }

        match self.rpc_get_succ_list(&successor.addr, successor.id).await {
            Ok(list) => {
                let mut successors = vec![successor];
                successors.extend(list);
                successors.truncate(self.cfg.succ_list_len.max(1));
                vnode.state.lock().successors = successors;
            }
            Err(e) => {
                tracing::debug!(successor = %successor.id, error = %e, "succ list refresh failed");
            }
        }
    }

    async fn fix_fingers(&self, vnode: &Arc<Vnode>) {
        let index = {
            let mut state = vnode.state.lock();
            let index = state.next_finger;
            state.next_finger = (index + 1) % FINGER_BITS;
            index
        };
        let target = vnode.id.add_pow2(index as u8);
        match self.find_successor(target).await {
            Ok(node) => {
                vnode.state.lock().fingers[index] = Some(node);
            }
            Err(e) => {
                tracing::debug!(vnode = %vnode.id, finger = index, error = %e, "finger refresh failed");
            }
        }
    }

    fn accept_notify(&self, vnode: &Arc<Vnode>, candidate: NodeInfo) {
        let mut state = vnode.state.lock();
        let adopt = match &state.predecessor {
            None => true,
            Some(current) => candidate.id.in_open_open(current.id, vnode.id),
        };
        if adopt {
            state.predecessor = Some(candidate);
        }
    }

    /// Among local vnodes, the one whose id most closely precedes `id`.
    fn closest_local_vnode(&self, id: RingId) -> Arc<Vnode> {
        let mut best = Arc::clone(&self.vnodes[0]);
        let mut best_distance = best.id.distance_to(id);
        for vnode in &self.vnodes[1..] {
            let distance = vnode.id.distance_to(id);
            if distance < best_distance {
                best = Arc::clone(vnode);
                best_distance = distance;
            }
        }
        best
    }

    /// Finger-table walk: the known node most closely preceding `id`.
    fn closest_preceding_node(&self, vnode: &Arc<Vnode>, id: RingId) -> NodeInfo {
        let state = vnode.state.lock();
        let mut best = NodeInfo {
            id: vnode.id,
            addr: self.peer.addr().to_string(),
        };
        let mut best_distance = best.id.distance_to(id);

        let candidates = state
            .fingers
            .iter()
            .flatten()
            .chain(state.successors.iter());
        for candidate in candidates {
            if !candidate.id.in_open_open(vnode.id, id) {
                continue;
            }
            let distance = candidate.id.distance_to(id);
            if distance < best_distance {
                best = candidate.clone();
                best_distance = distance;
            }
        }
        best
    }

    fn local_vnode(&self, id: RingId) -> Option<Arc<Vnode>> {
        self.vnodes.iter().find(|v| v.id == id).map(Arc::clone)
    }

    async fn rpc_find_successor(&self, addr: &str, id: RingId) -> Result<NodeInfo, DhtError> {
        let payload = KeyMsg { id: id.to_bytes() }
            .to_wire()
            .map_err(|e| DhtError::Protocol(e.to_string()))?;
        let reply = self.peer.request(addr, FIND_SUCCESSOR, payload).await?;
        let node = NodeMsg::from_wire(&reply).map_err(|e| DhtError::Protocol(e.to_string()))?;
        Ok(NodeInfo::from_msg(&node))
    }

    async fn rpc_get_predecessor(
        &self,
        addr: &str,
        vnode: RingId,
    ) -> Result<Option<NodeInfo>, DhtError> {
        let payload = VnodeQuery {
            vnode: vnode.to_bytes(),
        }
        .to_wire()
        .map_err(|e| DhtError::Protocol(e.to_string()))?;
        let reply = self.peer.request(addr, GET_PREDECESSOR, payload).await?;
        let opt = OptNodeMsg::from_wire(&reply).map_err(|e| DhtError::Protocol(e.to_string()))?;
        Ok(opt.node.as_ref().map(NodeInfo::from_msg))
    }

    async fn rpc_notify(
        &self,
        addr: &str,
        vnode: RingId,
        node: &NodeInfo,
    ) -> Result<(), DhtError> {
        let payload = NotifyMsg {
            vnode: vnode.to_bytes(),
            node: node.to_msg(),
        }
        .to_wire()
        .map_err(|e| DhtError::Protocol(e.to_string()))?;
        self.peer.request(addr, NOTIFY, payload).await?;
        Ok(())
    }

    async fn rpc_get_succ_list(
        &self,
        addr: &str,
        vnode: RingId,
    ) -> Result<Vec<NodeInfo>, DhtError> {
        let payload = VnodeQuery {
            vnode: vnode.to_bytes(),
        }
        .to_wire()
        .map_err(|e| DhtError::Protocol(e.to_string()))?;
        let reply = self.peer.request(addr, GET_SUCC_LIST, payload).await?;
        let list = NodeListMsg::from_wire(&reply).map_err(|e| DhtError::Protocol(e.to_string()))?;
        Ok(list.nodes.iter().map(NodeInfo::from_msg).collect())
    }

    fn register_handlers(self: &Arc<Self>) {
        self.peer.add_request_handler(
            FIND_SUCCESSOR,
            Arc::new(FindSuccessorHandler {
                dht: Arc::clone(self),
            }),
        );
        self.peer.add_request_handler(
            GET_PREDECESSOR,
            Arc::new(GetPredecessorHandler {
                dht: Arc::clone(self),
            }),
        );
        self.peer.add_request_handler(
            NOTIFY,
            Arc::new(NotifyHandler {
                dht: Arc::clone(self),
            }),
        );
        self.peer.add_request_handler(
            GET_SUCC_LIST,
            Arc::new(GetSuccListHandler {
                dht: Arc::clone(self),
            }),
        );
    }

    fn spawn_maintenance(self: &Arc<Self>) {
        let stabilize = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(stabilize.cfg.stabilize_interval);
            loop {
                tokio::select! {
                    _ = tick.tick() => stabilize.stabilize_all().await,
                    _ = stabilize.cancel.cancelled() => break,
                }
            }
        });

        let fingers = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(fingers.cfg.fix_fingers_interval);
            loop {
                tokio::select! {
                    _ = tick.tick() => fingers.fix_fingers_all().await,
                    _ = fingers.cancel.cancelled() => break,
                }
            }
        });

        let check = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(check.cfg.check_predecessor_interval);
            loop {
                tokio::select! {
                    _ = tick.tick() => check.check_predecessors().await,
                    _ = check.cancel.cancelled() => break,
                }
            }
        });
    }
}

impl Router for Dht {
    fn owner_of<'a>(&'a self, key: &'a [u8]) -> BoxFut<'a, Result<String, DhtError>> {
        Box::pin(async move {
            let node = self.find_successor(RingId::hash(key)).await?;
            Ok(node.addr)
        })
    }
}

struct FindSuccessorHandler {
    dht: Arc<Dht>,
}

impl RequestHandler for FindSuccessorHandler {
    fn handle(&self, _from: &str, payload: Bytes) -> crate::net::BoxFut<Result<Bytes, String>> {
        let dht = Arc::clone(&self.dht);
        Box::pin(async move {
            let key = KeyMsg::from_wire(&payload).map_err(|e| e.to_string())?;
            let node = dht
                .find_successor(RingId::from_bytes(key.id))
                .await
                .map_err(|e| e.to_string())?;
            let reply = node.to_msg().to_wire().map_err(|e| e.to_string())?;
            Ok(Bytes::from(reply))
        })
    }
}

struct GetPredecessorHandler {
    dht: Arc<Dht>,
}

impl RequestHandler for GetPredecessorHandler {
    fn handle(&self, _from: &str, payload: Bytes) -> crate::net::BoxFut<Result<Bytes, String>> {
        let dht = Arc::clone(&self.dht);
        Box::pin(async move {
            let query = VnodeQuery::from_wire(&payload).map_err(|e| e.to_string())?;
            let vnode = dht
                .local_vnode(RingId::from_bytes(query.vnode))
                .ok_or_else(|| "unknown vnode".to_string())?;
            let predecessor = vnode.state.lock().predecessor.clone();
            let reply = OptNodeMsg {
                node: predecessor.as_ref().map(NodeInfo::to_msg),
            }
            .to_wire()
            .map_err(|e| e.to_string())?;
            Ok(Bytes::from(reply))
        })
    }
}

struct NotifyHandler {
    dht: Arc<Dht>,
}

impl RequestHandler for NotifyHandler {
    fn handle(&self, _from: &str, payload: Bytes) -> crate::net::BoxFut<Result<Bytes, String>> {
        let dht = Arc::clone(&self.dht);
        Box::pin(async move {
            let notify = NotifyMsg::from_wire(&payload).map_err(|e| e.to_string())?;
            let vnode = dht
                .local_vnode(RingId::from_bytes(notify.vnode))
                .ok_or_else(|| "unknown vnode".to_string())?;
            dht.accept_notify(&vnode, NodeInfo::from_msg(&notify.node));
            Ok(Bytes::new())
        })
    }
}

struct GetSuccListHandler {
    dht: Arc<Dht>,
}

impl RequestHandler for GetSuccListHandler {
    fn handle(&self, _from: &str, payload: Bytes) -> crate::net::BoxFut<Result<Bytes, String>> {
        let dht = Arc::clone(&self.dht);
        Box::pin(async move {
            let query = VnodeQuery::from_wire(&payload).map_err(|e| e.to_string())?;
            let vnode = dht
                .local_vnode(RingId::from_bytes(query.vnode))
                .ok_or_else(|| "unknown vnode".to_string())?;
            let nodes: Vec<NodeMsg> = vnode
                .state
                .lock()
                .successors
                .iter()
                .map(NodeInfo::to_msg)
                .collect();
            let reply = NodeListMsg { nodes }.to_wire().map_err(|e| e.to_string())?;
            Ok(Bytes::from(reply))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_single_node_owns_everything() {
        let cancel = CancellationToken::new();
        let peer = Peer::bind("127.0.0.1:0", cancel.clone()).await.unwrap();
        let dht = Dht::new(Arc::clone(&peer), DhtConfig::default(), cancel);

        for key in [b"a.com".as_slice(), b"b.org", b"anything"] {
            let owner = dht.find_successor(RingId::hash(key)).await.unwrap();
            assert_eq!(owner.addr, peer.addr());
        }
    }

    #[tokio::test]
    async fn test_two_nodes_split_the_ring() {
        let cancel = CancellationToken::new();
        let peer_x = Peer::bind("127.0.0.1:0", cancel.clone()).await.unwrap();
        let peer_y = Peer::bind("127.0.0.1:0", cancel.clone()).await.unwrap();

        let cfg = DhtConfig {
            // Slow automatic ticks; the test drives rounds explicitly.
            stabilize_interval: Duration::from_secs(60),
            fix_fingers_interval: Duration::from_secs(60),
            check_predecessor_interval: Duration::from_secs(60),
            ..Default::default()
        };
        let x = Dht::new(Arc::clone(&peer_x), cfg.clone(), cancel.clone());
        let y = Dht::new(Arc::clone(&peer_y), cfg, cancel);

        y.join(peer_x.addr()).await.unwrap();
        for _ in 0..8 {
            x.stabilize_all().await;
            y.stabilize_all().await;
        }
        for _ in 0..4 {
            x.fix_fingers_all().await;
            y.fix_fingers_all().await;
        }

        // Each of Y's vnode ids must now resolve to Y from either node.
        for vnode in &y.vnodes {
            let from_x = x.find_successor(vnode.id).await.unwrap();
            assert_eq!(from_x.addr, peer_y.addr());
            let from_y = y.find_successor(vnode.id).await.unwrap();
            assert_eq!(from_y.addr, peer_y.addr());
        }

        // Both nodes agree on arbitrary keys.
        for key in 0..16u8 {
            let id = RingId::hash(&[key]);
            let from_x = x.find_successor(id).await.unwrap();
            let from_y = y.find_successor(id).await.unwrap();
            assert_eq!(from_x.addr, from_y.addr);
        }
    }
}
