use tracing::{debug, warn};

use crate::chord_node::ChordNode;
use crate::chord_util::{self, ChordId, GeneralError};
use crate::gval;
use crate::node_info::NodeInfo;

// successor_candidates を先頭から ping し、最初に応答したノードを successor とする.
// 応答しなかったノードは経路情報から一括で取り除く. 誰も応答しなければ自身を返す
pub fn successor(self_node: &ChordNode) -> NodeInfo {
    let candidates = self_node.routing.lock().successor_candidates();

    let mut dead: Vec<NodeInfo> = Vec::new();
    let mut found: Option<NodeInfo> = None;
    for candidate in candidates {
        if self_node.remote(&candidate).ping() {
            found = Some(candidate);
            break;
        }
        dead.push(candidate);
    }

    // forget_node promotes the next list entry, which is the live one found above
    let mut routing = self_node.routing.lock();
    for node in &dead {
        warn!(node = %self_node.node_info, dead = %node, "successor candidate unreachable, pruned");
        routing.forget_node(node);
    }
    found.unwrap_or_else(|| routing.successor_estimate())
}

// 自身なら RPC を経由せずに処理する
fn successor_of(self_node: &ChordNode, target: &NodeInfo) -> Result<NodeInfo, GeneralError> {
    if *target == self_node.node_info {
        Ok(successor(self_node))
    } else {
        self_node.remote(target).successor()
    }
}

fn closest_preceding_node_of(
    self_node: &ChordNode,
    target: &NodeInfo,
    key: &ChordId,
) -> Result<NodeInfo, GeneralError> {
    if *target == self_node.node_info {
        Ok(closest_preceding_node(self_node, key))
    } else {
        self_node.remote(target).closest_preceding_node(key)
    }
}

/// Owner of `key`.
///
/// Answered locally when `key` lies in `(predecessor, self]`, otherwise by
/// walking the ring to the node preceding `key` and asking it for its
/// successor.
pub fn find_successor(self_node: &ChordNode, key: &ChordId) -> Result<NodeInfo, GeneralError> {
    if self_node.is_responsible_for(key) {
        return Ok(self_node.node_info.clone());
    }
    let pred = find_predecessor(self_node, key);
    successor_of(self_node, &pred)
}

/// Node `n` with `key` in `(n, n.successor]`, or the closest one reached
/// when the walk can not go on.
pub fn find_predecessor(self_node: &ChordNode, key: &ChordId) -> NodeInfo {
    let mut current = self_node.node_info.clone();
    let mut current_succ = successor(self_node);

    for _ in 0..gval::MAX_LOOKUP_HOPS {
        // 一周してきた or 1ノードのみ
        if current_succ == current {
            break;
        }
        if chord_util::exist_between_right_closed(key, &current.node_id, &current_succ.node_id) {
            break;
        }

        let next = match closest_preceding_node_of(self_node, &current, key) {
            Ok(next) => next,
            Err(err) => {
                warn!(hop = %current, error = %err, "closest_preceding_node failed, lookup stops here");
                break;
            }
        };
        if next == current {
            break;
        }
        let next_succ = match successor_of(self_node, &next) {
            Ok(next_succ) => next_succ,
            Err(err) => {
                warn!(hop = %next, error = %err, "successor of lookup hop failed, lookup stops here");
                break;
            }
        };
        debug!(key = %key, from = %current, to = %next, "lookup hop");
        current = next;
        current_succ = next_succ;
    }

    current
}

// finger と successor_list のうち、自身から key の手前までの区間に入っていて
// かつ生きているもののうち最も遠いもの
pub fn closest_preceding_node(self_node: &ChordNode, key: &ChordId) -> NodeInfo {
    let self_id = &self_node.node_info.node_id;
    let candidates = self_node.routing.lock().preceding_candidates();

    let mut dead: Vec<NodeInfo> = Vec::new();
    let mut found: Option<NodeInfo> = None;
    for candidate in candidates {
        if !chord_util::exist_between_open(&candidate.node_id, self_id, key) {
            continue;
        }
        if self_node.remote(&candidate).ping() {
            found = Some(candidate);
            break;
        }
        dead.push(candidate);
    }

    if !dead.is_empty() {
        let mut routing = self_node.routing.lock();
        for node in &dead {
            routing.forget_node(node);
        }
    }
    found.unwrap_or_else(|| self_node.node_info.clone())
}
