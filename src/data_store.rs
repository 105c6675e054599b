use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::chord_util::{self, ChordId};
use crate::node_info::NodeInfo;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataIdAndValue {
    pub data_id: ChordId,
    pub val_str: String,
}

impl DataIdAndValue {
    pub fn new(data_id: ChordId, val_str: String) -> DataIdAndValue {
        DataIdAndValue { data_id, val_str }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataIdAndMessages {
    pub data_id: ChordId,
    pub messages: Vec<String>,
}

/// Reply of `get_keys`: the entries a joining node takes over, plus the
/// donor's predecessor from before the join.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyHandoff {
    pub values: Vec<DataIdAndValue>,
    pub messages: Vec<DataIdAndMessages>,
    pub predecessor: Option<NodeInfo>,
}

#[derive(Debug, Clone, Default)]
pub struct DataStore {
    // Keyはハッシュを通されたものなので元データの値とは異なる
    stored_data: HashMap<ChordId, String>,
    messages: HashMap<ChordId, Vec<String>>,
}

impl DataStore {
    pub fn new() -> DataStore {
        DataStore::default()
    }

    // 上書きした場合は true
    pub fn store_one(&mut self, data_id: ChordId, value_str: String) -> bool {
        self.stored_data.insert(data_id, value_str).is_some()
    }

    pub fn get(&self, data_id: &ChordId) -> Option<String> {
        self.stored_data.get(data_id).cloned()
    }

    pub fn contains(&self, data_id: &ChordId) -> bool {
        self.stored_data.contains_key(data_id)
    }

    /// Drops both the value and the queue stored under `data_id`.
    pub fn remove_one_data(&mut self, data_id: &ChordId) {
        self.stored_data.remove(data_id);
        self.messages.remove(data_id);
    }

    pub fn push_message(&mut self, data_id: ChordId, message: String) {
        self.messages.entry(data_id).or_default().push(message);
    }

    // キューの中身を挿入順で返し、キュー自体も消す
    pub fn drain_messages(&mut self, data_id: &ChordId) -> Vec<String> {
        self.messages.remove(data_id).unwrap_or_default()
    }

    pub fn stored_count(&self) -> usize {
        self.stored_data.len()
    }

    pub fn queued_count(&self) -> usize {
        self.messages.len()
    }

    /// Copies every entry whose key is outside `(boundary_id, self_id]`.
    ///
    /// Used by a donor when a node with id `boundary_id` joins right before it:
    /// everything the donor is not responsible for anymore goes to the joiner,
    /// which owns part of it and replicates the rest. The donor keeps its
    /// copies as replicas.
    pub fn collect_handoff(
        &self,
        boundary_id: &ChordId,
        self_id: &ChordId,
    ) -> (Vec<DataIdAndValue>, Vec<DataIdAndMessages>) {
        let outside = |key: &ChordId| !chord_util::exist_between_right_closed(key, boundary_id, self_id);

        let mut values: Vec<DataIdAndValue> = self
            .stored_data
            .iter()
            .filter(|&(key, _)| outside(key))
            .map(|(key, val)| DataIdAndValue::new(key.clone(), val.clone()))
            .collect();
        values.sort_by(|a, b| a.data_id.cmp(&b.data_id));

        let mut messages: Vec<DataIdAndMessages> = self
            .messages
            .iter()
            .filter(|&(key, queue)| outside(key) && !queue.is_empty())
            .map(|(key, queue)| DataIdAndMessages {
                data_id: key.clone(),
                messages: queue.clone(),
            })
            .collect();
        messages.sort_by(|a, b| a.data_id.cmp(&b.data_id));

        (values, messages)
    }

    /// Merges entries handed over at join.
    ///
    /// A value already present locally was written after this node started
    /// serving and wins. Handed queues are older than local ones and go first.
    pub fn merge_handoff(&mut self, values: Vec<DataIdAndValue>, messages: Vec<DataIdAndMessages>) {
        for each_iv in values {
            self.stored_data.entry(each_iv.data_id).or_insert(each_iv.val_str);
        }
        for each_queue in messages {
            let local = self.messages.remove(&each_queue.data_id).unwrap_or_default();
            let mut merged = each_queue.messages;
            merged.extend(local);
            self.messages.insert(each_queue.data_id, merged);
        }
    }
}
