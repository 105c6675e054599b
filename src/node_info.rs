use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::chord_util::{self, ChordId};
use crate::gval;

// on the wire a node is only its address. the id is always recomputed from it
#[derive(Serialize, Deserialize)]
struct NodeAddress {
    ip: String,
    port: u16,
}

/// Address of a ring member plus its id, `sha1("ip:port")`.
///
/// Two `NodeInfo`s are the same node iff they have the same `(ip, port)`.
#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "NodeAddress", into = "NodeAddress")]
pub struct NodeInfo {
    pub ip: String,
    pub port: u16,
    pub node_id: ChordId,
}

impl NodeInfo {
    pub fn new(ip: &str, port: u16) -> NodeInfo {
        let node_id = ChordId::hash_of(&format!("{}:{}", ip, port));
        NodeInfo {
            ip: ip.to_string(),
            port,
            node_id,
        }
    }

    pub fn address_str(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

impl From<NodeAddress> for NodeInfo {
    fn from(addr: NodeAddress) -> NodeInfo {
        NodeInfo::new(&addr.ip, addr.port)
    }
}

impl From<NodeInfo> for NodeAddress {
    fn from(node: NodeInfo) -> NodeAddress {
        NodeAddress {
            ip: node.ip,
            port: node.port,
        }
    }
}

impl PartialEq for NodeInfo {
    fn eq(&self, other: &Self) -> bool {
        self.ip == other.ip && self.port == other.port
    }
}

impl Eq for NodeInfo {}

impl Hash for NodeInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ip.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{},{}", self.ip, self.port, self.node_id)
    }
}

impl fmt::Debug for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeInfo({}:{})", self.ip, self.port)
    }
}

/// Routing state of the local node.
///
/// Only ever touched while holding the node's routing mutex, so every method
/// here is one atomic read-modify-write from the point of view of the
/// concurrent RPC handlers and maintenance loops.
pub struct RoutingTable {
    self_info: NodeInfo,
    max_successors: usize,
    // インデックス0は常にSome. 自ノード以外が見つかっていない間は自ノード自身
    pub fingers: Vec<Option<NodeInfo>>,
    // 自ノードは含まない
    pub successor_list: Vec<NodeInfo>,
    pub predecessor: Option<NodeInfo>,
}

impl RoutingTable {
    pub fn new(self_info: NodeInfo, max_successors: usize) -> RoutingTable {
        let mut fingers = vec![None; gval::ID_SPACE_BITS as usize];
        fingers[0] = Some(self_info.clone());
        RoutingTable {
            self_info,
            max_successors,
            fingers,
            successor_list: Vec::new(),
            predecessor: None,
        }
    }

    /// fingers[0], the last successor known to be alive.
    pub fn successor_estimate(&self) -> NodeInfo {
        self.fingers[0]
            .clone()
            .unwrap_or_else(|| self.self_info.clone())
    }

    pub fn set_successor(&mut self, node: NodeInfo) {
        self.fingers[0] = Some(node);
    }

    pub fn is_alone(&self) -> bool {
        self.successor_estimate() == self.self_info
    }

    pub fn is_successor_list_full(&self) -> bool {
        self.successor_list.len() >= self.max_successors
    }

    // [fingers[0]] + successor_list, in that order, without self and duplicates
    pub fn successor_candidates(&self) -> Vec<NodeInfo> {
        let mut ret = Vec::with_capacity(self.successor_list.len() + 1);
        let head = self.fingers[0].iter();
        for node in head.chain(self.successor_list.iter()) {
            if *node != self.self_info && !ret.contains(node) {
                ret.push(node.clone());
            }
        }
        ret
    }

    // every known node except self, farthest from self first. closest_preceding_node
    // walks this from the largest stride down
    pub fn preceding_candidates(&self) -> Vec<NodeInfo> {
        let mut ret: Vec<NodeInfo> = Vec::new();
        let fingers = self.fingers.iter().flatten();
        for node in fingers.chain(self.successor_list.iter()) {
            if *node != self.self_info && !ret.contains(node) {
                ret.push(node.clone());
            }
        }
        let self_id = &self.self_info.node_id;
        ret.sort_by(|a, b| {
            let dist_a = chord_util::calc_distance_right_mawari(self_id, &a.node_id);
            let dist_b = chord_util::calc_distance_right_mawari(self_id, &b.node_id);
            dist_b.cmp(&dist_a)
        });
        ret
    }

    /// Replaces the successor list with `nodes`, dropping self, duplicates and
    /// anything past the capacity.
    pub fn replace_successor_list(&mut self, nodes: Vec<NodeInfo>) {
        let mut new_list: Vec<NodeInfo> = Vec::with_capacity(self.max_successors);
        for node in nodes {
            if new_list.len() >= self.max_successors {
                break;
            }
            if node != self.self_info && !new_list.contains(&node) {
                new_list.push(node);
            }
        }
        self.successor_list = new_list;
    }

    // ダウンしていることが判明したノードを全ての経路情報から取り除く.
    // fingers[0] だった場合は successor_list の次の候補、なければ自身を successor とする
    pub fn forget_node(&mut self, node: &NodeInfo) {
        if *node == self.self_info {
            return;
        }
        self.successor_list.retain(|each| each != node);
        for finger in self.fingers.iter_mut().skip(1) {
            if finger.as_ref() == Some(node) {
                *finger = None;
            }
        }
        if self.fingers[0].as_ref() == Some(node) {
            let next = self
                .successor_list
                .first()
                .cloned()
                .unwrap_or_else(|| self.self_info.clone());
            self.fingers[0] = Some(next);
        }
        if self.predecessor.as_ref() == Some(node) {
            self.predecessor = None;
        }
    }

    // 重複なし、自ノードを除いたフィンガーテーブルの内容
    pub fn distinct_fingers(&self) -> Vec<NodeInfo> {
        let mut ret: Vec<NodeInfo> = Vec::new();
        for node in self.fingers.iter().flatten() {
            if *node != self.self_info && !ret.contains(node) {
                ret.push(node.clone());
            }
        }
        ret
    }
}

/// Read-only snapshot of a node's routing state, answered by `get_node_info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node: NodeInfo,
    pub predecessor: Option<NodeInfo>,
    pub successor: NodeInfo,
    pub successor_list: Vec<NodeInfo>,
    pub fingers: Vec<NodeInfo>,
    pub stored_keys: usize,
    pub queued_keys: usize,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "node        : {}", self.node)?;
        match &self.predecessor {
            Some(pred) => writeln!(f, "predecessor : {}", pred)?,
            None => writeln!(f, "predecessor : -")?,
        }
        writeln!(f, "successor   : {}", self.successor)?;
        for (idx, succ) in self.successor_list.iter().enumerate() {
            writeln!(f, "succ_list[{}]: {}", idx, succ)?;
        }
        writeln!(f, "fingers     : {} distinct", self.fingers.len())?;
        write!(
            f,
            "stored keys : {}, queued keys : {}",
            self.stored_keys, self.queued_keys
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(port: u16) -> NodeInfo {
        NodeInfo::new("127.0.0.1", port)
    }

    #[test]
    fn node_identity_is_address() {
        let a = node(7000);
        assert_eq!(a, node(7000));
        assert_ne!(a, node(7001));
        assert_eq!(a.node_id, ChordId::hash_of("127.0.0.1:7000"));
        assert_eq!(a.address_str(), "127.0.0.1:7000");
    }

    #[test]
    fn node_id_is_recomputed_on_decode() {
        let json = serde_json::to_value(&node(7000)).unwrap();
        assert_eq!(json, serde_json::json!({"ip": "127.0.0.1", "port": 7000}));
        let decoded: NodeInfo = serde_json::from_value(json).unwrap();
        assert_eq!(decoded.node_id, node(7000).node_id);
    }

    #[test]
    fn fresh_table_points_at_self() {
        let table = RoutingTable::new(node(7000), 3);
        assert!(table.is_alone());
        assert_eq!(table.successor_estimate(), node(7000));
        assert!(table.successor_candidates().is_empty());
        assert!(table.predecessor.is_none());
    }

    #[test]
    fn successor_list_is_deduplicated_and_bounded() {
        let mut table = RoutingTable::new(node(7000), 3);
        table.replace_successor_list(vec![
            node(7001),
            node(7001),
            node(7000),
            node(7002),
            node(7003),
            node(7004),
        ]);
        assert_eq!(table.successor_list, vec![node(7001), node(7002), node(7003)]);
        assert!(table.is_successor_list_full());

        table.set_successor(node(7002));
        assert_eq!(
            table.successor_candidates(),
            vec![node(7002), node(7001), node(7003)]
        );
    }

    #[test]
    fn forgetting_successor_promotes_next_in_list() {
        let mut table = RoutingTable::new(node(7000), 3);
        table.replace_successor_list(vec![node(7001), node(7002)]);
        table.set_successor(node(7001));
        table.fingers[5] = Some(node(7001));
        table.fingers[6] = Some(node(7002));
        table.predecessor = Some(node(7001));

        table.forget_node(&node(7001));
        assert_eq!(table.successor_estimate(), node(7002));
        assert_eq!(table.successor_list, vec![node(7002)]);
        assert!(table.fingers[5].is_none());
        assert_eq!(table.fingers[6], Some(node(7002)));
        assert!(table.predecessor.is_none());

        table.forget_node(&node(7002));
        assert!(table.is_alone());
        assert!(table.distinct_fingers().is_empty());
    }

    #[test]
    fn preceding_candidates_are_farthest_first() {
        let me = node(7000);
        let mut table = RoutingTable::new(me.clone(), 7);
        let others: Vec<NodeInfo> = (7001..7006).map(node).collect();
        table.replace_successor_list(others.clone());
        table.fingers[10] = Some(others[0].clone());

        let candidates = table.preceding_candidates();
        assert_eq!(candidates.len(), others.len());
        for pair in candidates.windows(2) {
            let d0 = chord_util::calc_distance_right_mawari(&me.node_id, &pair[0].node_id);
            let d1 = chord_util::calc_distance_right_mawari(&me.node_id, &pair[1].node_id);
            assert!(d0 > d1);
        }
    }
}
