use std::collections::HashMap;
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::chord_util::{self, ChordId, GeneralError};
use crate::config::{self, NodeConfig};
use crate::data_store::DataStore;
use crate::endpoints::{self, RemoteNode};
use crate::gval;
use crate::node_info::{NodeInfo, NodeStatus, RoutingTable};
use crate::router;
use crate::stabilizer;
use crate::wire::{Request, Response};

/// Handler behind a registered callback name. Receives the local node and the
/// JSON argument sent by the caller.
pub type CallbackHandler = dyn Fn(&ChordNode, Value) -> Result<Value, GeneralError> + Send + Sync;

/// A ring member running in this process.
///
/// Lock order is always `routing` then `data_store`. Neither lock is held
/// while an RPC is in flight.
pub struct ChordNode {
    pub node_info: NodeInfo,
    pub config: NodeConfig,
    pub routing: Mutex<RoutingTable>,
    pub data_store: Mutex<DataStore>,
    callbacks: RwLock<HashMap<String, Arc<CallbackHandler>>>,
    shutdown: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ChordNode {
    /// A node that knows only itself. It does not listen until [`ChordNode::launch`].
    pub fn new(node_info: NodeInfo, config: NodeConfig) -> ChordNode {
        let routing = RoutingTable::new(node_info.clone(), config.max_successors);
        ChordNode {
            node_info,
            config,
            routing: Mutex::new(routing),
            data_store: Mutex::new(DataStore::new()),
            callbacks: RwLock::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Binds the listener, starts serving, joins through `config.bootstrap`
    /// if set and starts the maintenance loops.
    pub fn launch(config: NodeConfig) -> Result<Arc<ChordNode>, GeneralError> {
        config.validate()?;
        let listener = TcpListener::bind((config.listen_ip.as_str(), config.port))?;
        let port = listener.local_addr()?.port();
        let node_info = NodeInfo::new(&config.listen_ip, port);
        let node = Arc::new(ChordNode::new(node_info, config));

        let server_node = Arc::clone(&node);
        let server = thread::Builder::new()
            .name("rpc-server".to_string())
            .spawn(move || endpoints::serve(server_node, listener))?;
        node.workers.lock().push(server);

        if let Err(err) = node.join_and_maintain() {
            node.shutdown();
            return Err(err);
        }
        Ok(node)
    }

    fn join_and_maintain(self: &Arc<Self>) -> Result<(), GeneralError> {
        match &self.config.bootstrap {
            Some(bootstrap) => {
                let (host, port) = config::parse_host_port(bootstrap)?;
                stabilizer::join(self, &NodeInfo::new(&host, port))?;
            }
            None => info!(node = %self.node_info, "started a new ring"),
        }
        let handles = stabilizer::spawn_maintenance(self)?;
        self.workers.lock().extend(handles);
        Ok(())
    }

    /// Stops the maintenance loops and the RPC server. Peers see this node as
    /// unreachable from then on.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        // accept() only returns on a connection, so make one
        let wake_addr = (self.node_info.ip.as_str(), self.node_info.port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next());
        if let Some(addr) = wake_addr {
            if let Err(err) = TcpStream::connect_timeout(&addr, self.config.rpc.timeout()) {
                debug!(node = %self.node_info, error = %err, "could not wake rpc server");
            }
        }

        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!(node = %self.node_info, "worker thread panicked");
            }
        }
        info!(node = %self.node_info, "node shut down");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn sleep_unless_shutdown(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        let slice = Duration::from_millis(gval::SLEEP_SLICE_MILLIS);
        while !self.is_shutdown() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(slice.min(deadline - now));
        }
    }

    pub fn remote(&self, node: &NodeInfo) -> RemoteNode {
        RemoteNode::new(node.clone(), &self.config.rpc)
    }

    /// True iff `key` lies in `(predecessor, self]`. False while the
    /// predecessor is unknown.
    pub fn is_responsible_for(&self, key: &ChordId) -> bool {
        match &self.routing.lock().predecessor {
            Some(pred) => {
                chord_util::exist_between_right_closed(key, &pred.node_id, &self.node_info.node_id)
            }
            None => false,
        }
    }

    pub fn register<F>(&self, name: &str, handler: F)
    where
        F: Fn(&ChordNode, Value) -> Result<Value, GeneralError> + Send + Sync + 'static,
    {
        self.callbacks.write().insert(name.to_string(), Arc::new(handler));
    }

    pub fn status(&self) -> NodeStatus {
        let routing = self.routing.lock();
        let store = self.data_store.lock();
        NodeStatus {
            node: self.node_info.clone(),
            predecessor: routing.predecessor.clone(),
            successor: routing.successor_estimate(),
            successor_list: routing.successor_list.clone(),
            fingers: routing.distinct_fingers(),
            stored_keys: store.stored_count(),
            queued_keys: store.queued_count(),
        }
    }

    // ---- storage and mailbox ----

    pub fn put(&self, key: &ChordId, value: &str) -> Result<(), GeneralError> {
        self.put_with_hops(key, value, 0)
    }

    pub fn put_with_hops(&self, key: &ChordId, value: &str, hops: u8) -> Result<(), GeneralError> {
        self.route_write(
            key,
            hops,
            "put",
            |store| {
                store.store_one(key.clone(), value.to_string());
            },
            |owner, hops| owner.put(key, value, hops),
            |replica| replica.simple_put(key, value),
        )
    }

    pub fn get(&self, key: &ChordId) -> Result<Option<String>, GeneralError> {
        self.get_with_hops(key, 0)
    }

    /// `Ok(None)` means no node on the path holds `key`.
    pub fn get_with_hops(&self, key: &ChordId, hops: u8) -> Result<Option<String>, GeneralError> {
        self.check_hops(hops)?;
        let owner = router::find_successor(self, key)?;
        if owner == self.node_info {
            return Ok(self.data_store.lock().get(key));
        }

        debug!(node = %self.node_info, key = %key, owner = %owner, "forwarding get");
        let local_replica = || self.data_store.lock().get(key);
        match self.remote(&owner).get(key, hops.saturating_add(1)) {
            Ok(Some(value)) => Ok(Some(value)),
            Ok(None) => Ok(local_replica()),
            Err(err) => match local_replica() {
                Some(value) => {
                    warn!(node = %self.node_info, key = %key, error = %err, "owner failed, answering from local replica");
                    Ok(Some(value))
                }
                None => Err(err),
            },
        }
    }

    pub fn enqueue_message(&self, key: &ChordId, message: &str) -> Result<(), GeneralError> {
        self.enqueue_message_with_hops(key, message, 0)
    }

    pub fn enqueue_message_with_hops(&self, key: &ChordId, message: &str, hops: u8) -> Result<(), GeneralError> {
        self.route_write(
            key,
            hops,
            "enqueue_message",
            |store| store.push_message(key.clone(), message.to_string()),
            |owner, hops| owner.enqueue_message(key, message, hops),
            |replica| replica.simple_enqueue(key, message),
        )
    }

    /// Takes every message queued under `key`, oldest first. The queue is
    /// cleared on the owner and its replicas.
    pub fn dequeue_messages(&self, key: &ChordId) -> Result<Vec<String>, GeneralError> {
        self.dequeue_messages_with_hops(key, 0)
    }

    pub fn dequeue_messages_with_hops(&self, key: &ChordId, hops: u8) -> Result<Vec<String>, GeneralError> {
        self.route_write(
            key,
            hops,
            "dequeue_messages",
            |store| store.drain_messages(key),
            |owner, hops| owner.dequeue_messages(key, hops),
            |replica| replica.simple_dequeue(key),
        )
    }

    // replica side. never routed, never cascaded

    pub fn simple_put(&self, key: ChordId, value: String) {
        self.data_store.lock().store_one(key, value);
    }

    pub fn simple_enqueue(&self, key: ChordId, message: String) {
        self.data_store.lock().push_message(key, message);
    }

    pub fn simple_dequeue(&self, key: &ChordId) {
        self.data_store.lock().drain_messages(key);
    }

    pub fn remove_key(&self, key: &ChordId) {
        self.data_store.lock().remove_one_data(key);
    }

    fn check_hops(&self, hops: u8) -> Result<(), GeneralError> {
        if hops > self.config.max_forward_hops {
            return Err(GeneralError::ForwardLimitExceeded(self.config.max_forward_hops));
        }
        Ok(())
    }

    // 担当ノードなら自身に書き込みレプリカへ配る. そうでなければ担当ノードに転送する.
    // 担当の判定と書き込みは routing のロックを取ったまま行うので、get_keys による
    // 担当範囲の受け渡しと入れ違いになることはない
    fn route_write<T>(
        &self,
        key: &ChordId,
        hops: u8,
        command: &'static str,
        mut local: impl FnMut(&mut DataStore) -> T,
        forward: impl Fn(&RemoteNode, u8) -> Result<T, GeneralError>,
        replicate: impl Fn(&RemoteNode) -> Result<(), GeneralError>,
    ) -> Result<T, GeneralError> {
        self.check_hops(hops)?;
        let owner = router::find_successor(self, key)?;
        if owner != self.node_info {
            debug!(node = %self.node_info, key = %key, owner = %owner, command, "forwarding");
            return forward(&self.remote(&owner), hops.saturating_add(1));
        }

        let checked = {
            let routing = self.routing.lock();
            match moved_to(&routing, &self.node_info, key) {
                Some(new_owner) => Err(new_owner),
                None => Ok(self.apply_locally(&routing, &mut local)),
            }
        };
        let (result, replicas) = match checked {
            Ok(done) => done,
            Err(new_owner) => {
                debug!(node = %self.node_info, key = %key, new_owner = %new_owner, command, "key moved to predecessor");
                match forward(&self.remote(&new_owner), hops.saturating_add(1)) {
                    Err(err) if err.is_unreachable() => {
                        warn!(node = %self.node_info, key = %key, error = %err, "new owner unreachable, keeping the write here");
                        let routing = self.routing.lock();
                        self.apply_locally(&routing, &mut local)
                    }
                    other => return other,
                }
            }
        };

        for replica in &replicas {
            if let Err(err) = replicate(&self.remote(replica)) {
                warn!(node = %self.node_info, replica = %replica, key = %key, command, error = %err, "replication skipped");
            }
        }
        Ok(result)
    }

    fn apply_locally<T>(
        &self,
        routing: &RoutingTable,
        local: &mut impl FnMut(&mut DataStore) -> T,
    ) -> (T, Vec<NodeInfo>) {
        let mut store = self.data_store.lock();
        (local(&mut *store), routing.successor_candidates())
    }

    // ---- rpc dispatch ----

    /// Runs one decoded request against this node.
    pub fn dispatch(&self, req: Request) -> Response {
        debug!(node = %self.node_info, command = req.command_name(), "rpc received");
        match req {
            Request::Successor => Response::Node(router::successor(self)),
            Request::Predecessor => Response::MaybeNode(self.routing.lock().predecessor.clone()),
            Request::GetSuccessorList => Response::Nodes(self.routing.lock().successor_candidates()),
            Request::ClosestPrecedingNode { key } => {
                Response::Node(router::closest_preceding_node(self, &key))
            }
            Request::FindSuccessor { key } => to_response(router::find_successor(self, &key), Response::Node),
            Request::Notify { node } => {
                stabilizer::notify(self, &node);
                Response::Ack
            }
            Request::Put { key, value, hops } => {
                to_response(self.put_with_hops(&key, &value, hops), |_| Response::Ack)
            }
            Request::SimplePut { key, value } => {
                self.simple_put(key, value);
                Response::Ack
            }
            Request::Get { key, hops } => to_response(self.get_with_hops(&key, hops), Response::Value),
            Request::EnqueueMessage { key, message, hops } => to_response(
                self.enqueue_message_with_hops(&key, &message, hops),
                |_| Response::Ack,
            ),
            Request::SimpleEnqueue { key, message } => {
                self.simple_enqueue(key, message);
                Response::Ack
            }
            Request::DequeueMessages { key, hops } => {
                to_response(self.dequeue_messages_with_hops(&key, hops), Response::Messages)
            }
            Request::SimpleDequeue { key } => {
                self.simple_dequeue(&key);
                Response::Ack
            }
            Request::GetKeys { boundary, joiner } => {
                to_response(stabilizer::get_keys(self, &boundary, &joiner), Response::Keys)
            }
            Request::RemoveKey { key } => {
                self.remove_key(&key);
                Response::Ack
            }
            Request::GetNodeInfo => Response::Status(self.status()),
            Request::Callback { name, args } => {
                let handler = self.callbacks.read().get(&name).cloned();
                match handler {
                    Some(handler) => to_response(handler(self, args), Response::CallbackResult),
                    None => Response::Invalid {
                        reason: format!("unknown callback {:?}", name),
                    },
                }
            }
        }
    }
}

// predecessor がいて key が (predecessor, self] に入っていなければ、その predecessor
fn moved_to(routing: &RoutingTable, self_info: &NodeInfo, key: &ChordId) -> Option<NodeInfo> {
    match &routing.predecessor {
        Some(pred) if !chord_util::exist_between_right_closed(key, &pred.node_id, &self_info.node_id) => {
            Some(pred.clone())
        }
        _ => None,
    }
}

fn to_response<T>(result: Result<T, GeneralError>, wrap: impl FnOnce(T) -> Response) -> Response {
    match result {
        Ok(val) => wrap(val),
        Err(GeneralError::InvalidRequest(reason)) => Response::Invalid { reason },
        Err(err) => Response::Error {
            message: err.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn offline_node() -> ChordNode {
        ChordNode::new(NodeInfo::new("127.0.0.1", 40100), NodeConfig::default())
    }

    #[test]
    fn alone_node_serves_everything_locally() {
        let node = offline_node();
        let key = ChordId::hash_of("alice");
        assert_eq!(node.get(&key).unwrap(), None);
        node.put(&key, "127.0.0.1:9000").unwrap();
        assert_eq!(node.get(&key).unwrap(), Some("127.0.0.1:9000".to_string()));

        node.enqueue_message(&key, "m1").unwrap();
        node.enqueue_message(&key, "m2").unwrap();
        assert_eq!(node.dequeue_messages(&key).unwrap(), vec!["m1", "m2"]);
        assert!(node.dequeue_messages(&key).unwrap().is_empty());
    }

    #[test]
    fn hop_limit_is_enforced() {
        let node = offline_node();
        let key = ChordId::hash_of("bob");
        let over = node.config.max_forward_hops + 1;
        assert!(matches!(
            node.put_with_hops(&key, "v", over),
            Err(GeneralError::ForwardLimitExceeded(_))
        ));
        match node.dispatch(Request::Get { key, hops: over }) {
            Response::Error { message } => assert!(message.contains("forwarded")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn hop_limit_holds_at_the_top_of_the_counter() {
        let config = NodeConfig {
            max_forward_hops: u8::MAX - 1,
            ..NodeConfig::default()
        };
        assert!(config.validate().is_ok());
        let node = ChordNode::new(NodeInfo::new("127.0.0.1", 40102), config);
        let key = ChordId::hash_of("carol");
        assert!(matches!(
            node.enqueue_message_with_hops(&key, "m", u8::MAX),
            Err(GeneralError::ForwardLimitExceeded(254))
        ));
        assert!(node.put_with_hops(&key, "v", u8::MAX - 1).is_ok());
    }

    #[test]
    fn dispatch_answers_routing_queries() {
        let node = offline_node();
        let me = node.node_info.clone();
        assert!(matches!(node.dispatch(Request::Successor), Response::Node(n) if n == me));
        assert!(matches!(node.dispatch(Request::Predecessor), Response::MaybeNode(None)));
        assert!(matches!(
            node.dispatch(Request::FindSuccessor { key: ChordId::from_u64(7) }),
            Response::Node(n) if n == me
        ));
        match node.dispatch(Request::GetNodeInfo) {
            Response::Status(status) => {
                assert_eq!(status.node, me);
                assert_eq!(status.successor, me);
                assert!(status.successor_list.is_empty());
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn replica_commands_do_not_route() {
        let node = offline_node();
        // owned by someone else as far as this node knows
        node.routing.lock().predecessor = Some(NodeInfo::new("127.0.0.1", 40101));
        let key = ChordId::from_u64(3);
        node.dispatch(Request::SimplePut {
            key: key.clone(),
            value: "r".to_string(),
        });
        node.dispatch(Request::SimpleEnqueue {
            key: key.clone(),
            message: "q".to_string(),
        });
        assert_eq!(node.data_store.lock().get(&key), Some("r".to_string()));

        node.dispatch(Request::SimpleDequeue { key: key.clone() });
        assert_eq!(node.data_store.lock().queued_count(), 0);
        node.dispatch(Request::RemoveKey { key: key.clone() });
        assert!(!node.data_store.lock().contains(&key));
    }

    #[test]
    fn callbacks_are_dispatched_by_name() {
        let node = offline_node();
        node.register("echo_port", |node, args| {
            Ok(json!({ "port": node.node_info.port, "args": args }))
        });
        node.register("fail", |_, _| Err(GeneralError::Callback("nope".to_string())));

        match node.dispatch(Request::Callback {
            name: "echo_port".to_string(),
            args: json!([1, 2]),
        }) {
            Response::CallbackResult(val) => assert_eq!(val, json!({"port": 40100, "args": [1, 2]})),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(matches!(
            node.dispatch(Request::Callback {
                name: "fail".to_string(),
                args: Value::Null,
            }),
            Response::Error { .. }
        ));
        assert!(matches!(
            node.dispatch(Request::Callback {
                name: "missing".to_string(),
                args: Value::Null,
            }),
            Response::Invalid { .. }
        ));
    }
}
