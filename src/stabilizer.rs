use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::chord_node::ChordNode;
use crate::chord_util::{self, ChordId, GeneralError};
use crate::data_store::KeyHandoff;
use crate::gval;
use crate::node_info::NodeInfo;
use crate::router;

/// Joins the ring `bootstrap` belongs to.
///
/// The caller must already be serving RPCs: from the moment the successor
/// hands its keys over, writes for the new range are forwarded here. A
/// successor that already has a closer live predecessor refuses the handoff.
/// The lookup is then repeated after a stabilize interval.
pub fn join(self_node: &ChordNode, bootstrap: &NodeInfo) -> Result<(), GeneralError> {
    let self_info = &self_node.node_info;
    if bootstrap == self_info {
        warn!(node = %self_info, "bootstrap peer is this node, starting a new ring");
        return Ok(());
    }

    let settle = Duration::from_millis(self_node.config.maintenance.stabilize_interval_ms);
    let mut attempt = 0;
    let (successor, handoff) = loop {
        let successor = self_node.remote(bootstrap).find_successor(&self_info.node_id)?;
        if successor == *self_info {
            warn!(node = %self_info, bootstrap = %bootstrap, "ring already names this address as a member, starting alone");
            return Ok(());
        }
        self_node.routing.lock().set_successor(successor.clone());

        match self_node.remote(&successor).get_keys(&self_info.node_id, self_info) {
            Ok(handoff) => break (successor, handoff),
            Err(GeneralError::InvalidRequest(reason)) if attempt + 1 < gval::JOIN_RETRY_CNT_LIMIT => {
                debug!(node = %self_info, successor = %successor, %reason, attempt, "handoff refused, looking up the successor again");
                self_node.sleep_unless_shutdown(settle);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    };

    let value_cnt = handoff.values.len();
    let queue_cnt = handoff.messages.len();
    {
        let mut routing = self_node.routing.lock();
        let mut store = self_node.data_store.lock();
        if let Some(pred) = handoff.predecessor {
            if pred != *self_info && routing.predecessor.is_none() {
                routing.predecessor = Some(pred);
            }
        }
        store.merge_handoff(handoff.values, handoff.messages);
    }

    info!(
        node = %self_info,
        successor = %successor,
        values = value_cnt,
        queues = queue_cnt,
        "joined ring"
    );
    Ok(())
}

// join してきたノードに対して、そのノードが持つべきデータを渡す (donor 側).
// predecessor の付け替えとデータの切り出しは一つのクリティカルセクションで行う
pub fn get_keys(self_node: &ChordNode, boundary: &ChordId, joiner: &NodeInfo) -> Result<KeyHandoff, GeneralError> {
    let self_info = &self_node.node_info;
    if joiner == self_info {
        return Err(GeneralError::InvalidRequest("a node can not join through itself".to_string()));
    }

    // notify と同じ判定. 現在の predecessor の方が近く、かつ生きているなら断る
    let current = self_node.routing.lock().predecessor.clone();
    let keep_previous = match &current {
        Some(pred) if pred == joiner => true,
        Some(pred) if chord_util::exist_between_open(&joiner.node_id, &pred.node_id, &self_info.node_id) => true,
        Some(pred) => {
            if self_node.remote(pred).ping() {
                return Err(GeneralError::InvalidRequest(format!(
                    "{} is not the predecessor of {}, {} is closer",
                    joiner, self_info, pred
                )));
            }
            false
        }
        None => true,
    };

    let (handoff, purge) = {
        let mut routing = self_node.routing.lock();
        let store = self_node.data_store.lock();

        if routing.predecessor != current {
            return Err(GeneralError::InvalidRequest(format!(
                "predecessor of {} changed during the handoff to {}",
                self_info, joiner
            )));
        }
        let previous = if keep_previous { current } else { None };
        let was_alone = routing.is_alone();
        routing.predecessor = Some(joiner.clone());
        if was_alone {
            // 2ノード目. 相互に successor / predecessor となる
            routing.set_successor(joiner.clone());
        }

        let (values, messages) = store.collect_handoff(boundary, &self_info.node_id);

        // successor_list が満杯なら、その末尾のノードは joiner の担当分について
        // レプリカを持つべきノードではなくなる
        let purge = match (routing.successor_list.last(), previous.as_ref()) {
            (Some(tail), Some(prev))
                if routing.is_successor_list_full() && tail != joiner && tail != self_info =>
            {
                let mut keys: Vec<ChordId> = values
                    .iter()
                    .map(|iv| &iv.data_id)
                    .chain(messages.iter().map(|q| &q.data_id))
                    .filter(|key| chord_util::exist_between_right_closed(key, &prev.node_id, boundary))
                    .cloned()
                    .collect();
                keys.sort();
                keys.dedup();
                Some((tail.clone(), keys))
            }
            _ => None,
        };

        let predecessor = if was_alone { Some(self_info.clone()) } else { previous };
        (
            KeyHandoff {
                values,
                messages,
                predecessor,
            },
            purge,
        )
    };

    info!(
        node = %self_info,
        joiner = %joiner,
        values = handoff.values.len(),
        queues = handoff.messages.len(),
        "handed keys to joining predecessor"
    );

    if let Some((tail, keys)) = purge {
        let remote = self_node.remote(&tail);
        for key in &keys {
            if let Err(err) = remote.remove_key(key) {
                warn!(tail = %tail, key = %key, error = %err, "could not purge stale replica");
                break;
            }
        }
    }

    Ok(handoff)
}

// predecessor が落ちていたら忘れる
pub fn check_predecessor(self_node: &ChordNode) {
    let pred = self_node.routing.lock().predecessor.clone();
    let pred = match pred {
        Some(pred) if pred != self_node.node_info => pred,
        _ => return,
    };
    if self_node.remote(&pred).ping() {
        return;
    }
    let mut routing = self_node.routing.lock();
    if routing.predecessor.as_ref() == Some(&pred) {
        routing.predecessor = None;
        info!(node = %self_node.node_info, predecessor = %pred, "predecessor is down, cleared");
    }
}

/// One stabilize cycle: drop a dead predecessor, adopt a closer successor if
/// the current one knows of it, then tell the successor about this node.
pub fn stabilize(self_node: &ChordNode) -> Result<(), GeneralError> {
    check_predecessor(self_node);

    let self_info = &self_node.node_info;
    let mut successor = router::successor(self_node);

    let succ_pred = if successor == *self_info {
        self_node.routing.lock().predecessor.clone()
    } else {
        match self_node.remote(&successor).predecessor() {
            Ok(pred) => pred,
            Err(err) => {
                if err.is_unreachable() {
                    self_node.routing.lock().forget_node(&successor);
                }
                return Err(err);
            }
        }
    };

    if let Some(candidate) = succ_pred {
        if candidate != *self_info
            && chord_util::exist_between_open(&candidate.node_id, &self_info.node_id, &successor.node_id)
            && self_node.remote(&candidate).ping()
        {
            let mut routing = self_node.routing.lock();
            if routing.successor_estimate() == successor {
                routing.set_successor(candidate.clone());
                info!(node = %self_info, from = %successor, to = %candidate, "successor changed");
                successor = candidate;
            }
        }
    }

    if successor != *self_info {
        self_node.remote(&successor).notify(self_info)?;
    }
    Ok(())
}

/// `candidate` believes it might be this node's predecessor.
pub fn notify(self_node: &ChordNode, candidate: &NodeInfo) {
    let self_info = &self_node.node_info;
    if candidate == self_info {
        return;
    }

    let current = self_node.routing.lock().predecessor.clone();
    let adopt = match &current {
        None => true,
        Some(pred) if pred == candidate => false,
        Some(pred) => {
            chord_util::exist_between_open(&candidate.node_id, &pred.node_id, &self_info.node_id)
                || !self_node.remote(pred).ping()
        }
    };
    if !adopt {
        return;
    }

    // ping の間に他から書き換えられていたら今回は何もしない
    let mut routing = self_node.routing.lock();
    if routing.predecessor == current {
        routing.predecessor = Some(candidate.clone());
        info!(node = %self_info, predecessor = %candidate, "predecessor changed");
    }
}

// ランダムに選んだエントリ1つを更新する. fingers[0] は stabilize が管理する
pub fn fix_fingers(self_node: &ChordNode) -> Result<(), GeneralError> {
    let idx = 1 + chord_util::get_rnd_int_with_limit(gval::ID_SPACE_BITS - 1);
    let start = self_node.node_info.node_id.plus_pow2(idx);
    let finger = router::find_successor(self_node, &start)?;
    debug!(node = %self_node.node_info, idx, finger = %finger, "finger updated");
    self_node.routing.lock().fingers[idx as usize] = Some(finger);
    Ok(())
}

// successor と successor の successor_list を繋げたものを自身の successor_list とする
pub fn update_successor_list(self_node: &ChordNode) -> Result<(), GeneralError> {
    let successor = router::successor(self_node);
    if successor == self_node.node_info {
        self_node.routing.lock().replace_successor_list(Vec::new());
        return Ok(());
    }

    let mut nodes = vec![successor.clone()];
    nodes.extend(self_node.remote(&successor).get_successor_list()?);
    self_node.routing.lock().replace_successor_list(nodes);
    Ok(())
}

type MaintenanceTask = fn(&ChordNode) -> Result<(), GeneralError>;

pub fn spawn_maintenance(self_node: &Arc<ChordNode>) -> Result<Vec<JoinHandle<()>>, GeneralError> {
    let conf = &self_node.config.maintenance;
    let tasks: [(&'static str, u64, MaintenanceTask); 3] = [
        ("stabilize", conf.stabilize_interval_ms, stabilize),
        ("fix_fingers", conf.fix_fingers_interval_ms, fix_fingers),
        ("update_successors", conf.update_successors_interval_ms, update_successor_list),
    ];

    let mut handles = Vec::with_capacity(tasks.len());
    for (name, interval_ms, task) in tasks {
        let loop_node = Arc::clone(self_node);
        let interval = Duration::from_millis(interval_ms);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_periodically(&loop_node, name, interval, task))?;
        handles.push(handle);
    }
    Ok(handles)
}

fn run_periodically(self_node: &ChordNode, name: &'static str, interval: Duration, task: MaintenanceTask) {
    debug!(node = %self_node.node_info, task = name, "maintenance loop started");
    loop {
        self_node.sleep_unless_shutdown(interval);
        if self_node.is_shutdown() {
            break;
        }
        run_cycle(self_node, name, task);
    }
    debug!(node = %self_node.node_info, task = name, "maintenance loop stopped");
}

// 到達不能エラーの時だけバックオフしてリトライする. それ以外、あるいはリトライを
// 使い切った場合はこのサイクルを諦めて次の周期を待つ
fn run_cycle(self_node: &ChordNode, name: &'static str, task: MaintenanceTask) {
    let attempts = self_node.config.maintenance.cycle_retries.max(1);
    for attempt in 0..attempts {
        if self_node.is_shutdown() {
            return;
        }
        match task(self_node) {
            Ok(()) => return,
            Err(err) if err.is_unreachable() && attempt + 1 < attempts => {
                debug!(node = %self_node.node_info, task = name, attempt, error = %err, "maintenance cycle retry");
                self_node.sleep_unless_shutdown(self_node.config.rpc.backoff(attempt));
            }
            Err(err) => {
                warn!(node = %self_node.node_info, task = name, error = %err, "maintenance cycle skipped");
                return;
            }
        }
    }
}
