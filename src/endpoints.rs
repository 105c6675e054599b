use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::chord_node::ChordNode;
use crate::chord_util::{ChordId, GeneralError};
use crate::config::RpcConfig;
use crate::data_store::KeyHandoff;
use crate::node_info::{NodeInfo, NodeStatus};
use crate::wire::{self, Inbound, Request, Response};

// how far one exchange got before it failed
enum Exchange {
    NotSent(io::Error),
    Unanswered(io::Error),
    Failed(GeneralError),
}

/// Handle of another ring member. Every RPC opens its own connection, sends
/// one request, reads one response and closes.
///
/// Calls through the same handle never overlap: the connection lock is held
/// for the whole exchange, retries included.
pub struct RemoteNode {
    pub node_info: NodeInfo,
    rpc: RpcConfig,
    conn_lock: Mutex<()>,
}

impl RemoteNode {
    pub fn new(node_info: NodeInfo, rpc: &RpcConfig) -> RemoteNode {
        RemoteNode {
            node_info,
            rpc: rpc.clone(),
            conn_lock: Mutex::new(()),
        }
    }

    fn socket_addr(&self) -> io::Result<SocketAddr> {
        (self.node_info.ip.as_str(), self.node_info.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("{} does not resolve", self.node_info.address_str()),
                )
            })
    }

    fn connect(&self, timeout: Duration, read_timeout: Duration) -> io::Result<TcpStream> {
        let stream = TcpStream::connect_timeout(&self.socket_addr()?, timeout)?;
        stream.set_read_timeout(Some(read_timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Bare liveness probe: connect, send an empty frame, close. No retries.
    pub fn ping(&self) -> bool {
        let _guard = self.conn_lock.lock();
        let timeout = self.rpc.ping_timeout();
        let result = self
            .connect(timeout, timeout)
            .and_then(|mut stream| wire::write_frame(&mut stream, &[]));
        match result {
            Ok(()) => true,
            Err(err) => {
                debug!(peer = %self.node_info, error = %err, "ping failed");
                false
            }
        }
    }

    fn exchange(&self, req: &Request) -> Result<Response, Exchange> {
        let mut stream = self
            .connect(self.rpc.timeout(), self.rpc.response_timeout())
            .map_err(Exchange::NotSent)?;
        match wire::send_message(&mut stream, req) {
            Ok(()) => {}
            Err(GeneralError::Io(err)) => return Err(Exchange::NotSent(err)),
            Err(err) => return Err(Exchange::Failed(err)),
        }
        match wire::recv_message(&mut stream) {
            Ok(resp) => Ok(resp),
            Err(GeneralError::Io(err)) => Err(Exchange::Unanswered(err)),
            Err(err) => Err(Exchange::Failed(err)),
        }
    }

    // transport errors are retried with exponential backoff, everything else is
    // returned as is. a request that may have been applied is only retried when
    // applying it twice is harmless
    fn call_with_attempts(&self, req: &Request, attempts: u32) -> Result<Response, GeneralError> {
        let _guard = self.conn_lock.lock();
        let attempts = attempts.max(1);
        let mut last_reason = String::new();
        for attempt in 0..attempts {
            let err = match self.exchange(req) {
                Ok(resp) => return Ok(resp),
                Err(Exchange::Failed(err)) => return Err(err),
                Err(Exchange::NotSent(err)) => err,
                Err(Exchange::Unanswered(err)) if req.is_idempotent() => err,
                Err(Exchange::Unanswered(err)) => {
                    return Err(GeneralError::PeerUnreachable {
                        addr: self.node_info.address_str(),
                        attempts: attempt + 1,
                        reason: format!("no response to {}, not retried: {}", req.command_name(), err),
                    });
                }
            };
            debug!(
                peer = %self.node_info,
                command = req.command_name(),
                attempt,
                error = %err,
                "rpc attempt failed"
            );
            last_reason = err.to_string();
            if attempt + 1 < attempts {
                thread::sleep(self.rpc.backoff(attempt));
            }
        }
        Err(GeneralError::PeerUnreachable {
            addr: self.node_info.address_str(),
            attempts,
            reason: last_reason,
        })
    }

    fn call(&self, req: &Request) -> Result<Response, GeneralError> {
        self.call_with_attempts(req, self.rpc.retries)
    }

    // replica-only writes are best effort: one attempt, no backoff
    fn call_once(&self, req: &Request) -> Result<Response, GeneralError> {
        self.call_with_attempts(req, 1)
    }

    fn reject(&self, resp: Response, command: &'static str) -> GeneralError {
        match resp {
            Response::Error { message } => GeneralError::Remote {
                addr: self.node_info.address_str(),
                message,
            },
            Response::Invalid { reason } => GeneralError::InvalidRequest(reason),
            _ => GeneralError::UnexpectedResponse {
                addr: self.node_info.address_str(),
                command,
            },
        }
    }

    fn expect_ack(&self, resp: Response, command: &'static str) -> Result<(), GeneralError> {
        match resp {
            Response::Ack => Ok(()),
            other => Err(self.reject(other, command)),
        }
    }

    fn expect_node(&self, resp: Response, command: &'static str) -> Result<NodeInfo, GeneralError> {
        match resp {
            Response::Node(node) => Ok(node),
            other => Err(self.reject(other, command)),
        }
    }

    pub fn successor(&self) -> Result<NodeInfo, GeneralError> {
        let resp = self.call(&Request::Successor)?;
        self.expect_node(resp, "successor")
    }

    pub fn predecessor(&self) -> Result<Option<NodeInfo>, GeneralError> {
        match self.call(&Request::Predecessor)? {
            Response::MaybeNode(node) => Ok(node),
            other => Err(self.reject(other, "predecessor")),
        }
    }

    pub fn get_successor_list(&self) -> Result<Vec<NodeInfo>, GeneralError> {
        match self.call(&Request::GetSuccessorList)? {
            Response::Nodes(nodes) => Ok(nodes),
            other => Err(self.reject(other, "get_successor_list")),
        }
    }

    pub fn closest_preceding_node(&self, key: &ChordId) -> Result<NodeInfo, GeneralError> {
        let resp = self.call(&Request::ClosestPrecedingNode { key: key.clone() })?;
        self.expect_node(resp, "closest_preceding_node")
    }

    pub fn find_successor(&self, key: &ChordId) -> Result<NodeInfo, GeneralError> {
        let resp = self.call(&Request::FindSuccessor { key: key.clone() })?;
        self.expect_node(resp, "find_successor")
    }

    pub fn notify(&self, node: &NodeInfo) -> Result<(), GeneralError> {
        let resp = self.call(&Request::Notify { node: node.clone() })?;
        self.expect_ack(resp, "notify")
    }

    pub fn put(&self, key: &ChordId, value: &str, hops: u8) -> Result<(), GeneralError> {
        let resp = self.call(&Request::Put {
            key: key.clone(),
            value: value.to_string(),
            hops,
        })?;
        self.expect_ack(resp, "put")
    }

    pub fn simple_put(&self, key: &ChordId, value: &str) -> Result<(), GeneralError> {
        let resp = self.call_once(&Request::SimplePut {
            key: key.clone(),
            value: value.to_string(),
        })?;
        self.expect_ack(resp, "simple_put")
    }

    pub fn get(&self, key: &ChordId, hops: u8) -> Result<Option<String>, GeneralError> {
        match self.call(&Request::Get { key: key.clone(), hops })? {
            Response::Value(value) => Ok(value),
            other => Err(self.reject(other, "get")),
        }
    }

    pub fn enqueue_message(&self, key: &ChordId, message: &str, hops: u8) -> Result<(), GeneralError> {
        let resp = self.call(&Request::EnqueueMessage {
            key: key.clone(),
            message: message.to_string(),
            hops,
        })?;
        self.expect_ack(resp, "enqueue_message")
    }

    pub fn simple_enqueue(&self, key: &ChordId, message: &str) -> Result<(), GeneralError> {
        let resp = self.call_once(&Request::SimpleEnqueue {
            key: key.clone(),
            message: message.to_string(),
        })?;
        self.expect_ack(resp, "simple_enqueue")
    }

    pub fn dequeue_messages(&self, key: &ChordId, hops: u8) -> Result<Vec<String>, GeneralError> {
        match self.call(&Request::DequeueMessages { key: key.clone(), hops })? {
            Response::Messages(messages) => Ok(messages),
            other => Err(self.reject(other, "dequeue_messages")),
        }
    }

    pub fn simple_dequeue(&self, key: &ChordId) -> Result<(), GeneralError> {
        let resp = self.call_once(&Request::SimpleDequeue { key: key.clone() })?;
        self.expect_ack(resp, "simple_dequeue")
    }

    pub fn get_keys(&self, boundary: &ChordId, joiner: &NodeInfo) -> Result<KeyHandoff, GeneralError> {
        let resp = self.call(&Request::GetKeys {
            boundary: boundary.clone(),
            joiner: joiner.clone(),
        })?;
        match resp {
            Response::Keys(handoff) => Ok(handoff),
            other => Err(self.reject(other, "get_keys")),
        }
    }

    pub fn remove_key(&self, key: &ChordId) -> Result<(), GeneralError> {
        let resp = self.call_once(&Request::RemoveKey { key: key.clone() })?;
        self.expect_ack(resp, "remove_key")
    }

    pub fn get_node_info(&self) -> Result<NodeStatus, GeneralError> {
        match self.call(&Request::GetNodeInfo)? {
            Response::Status(status) => Ok(status),
            other => Err(self.reject(other, "get_node_info")),
        }
    }

    pub fn callback(&self, name: &str, args: serde_json::Value) -> Result<serde_json::Value, GeneralError> {
        let resp = self.call(&Request::Callback {
            name: name.to_string(),
            args,
        })?;
        match resp {
            Response::CallbackResult(value) => Ok(value),
            other => Err(self.reject(other, "callback")),
        }
    }
}

// accept loop. ends when the node is shut down and the loop is woken by a
// connection from the node itself
pub fn serve(node: Arc<ChordNode>, listener: TcpListener) {
    info!(node = %node.node_info, "rpc server started");
    for incoming in listener.incoming() {
        if node.is_shutdown() {
            break;
        }
        let stream = match incoming {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "accept failed");
                continue;
            }
        };
        let worker_node = Arc::clone(&node);
        let spawned = thread::Builder::new()
            .name("rpc-handler".to_string())
            .spawn(move || handle_connection(&worker_node, stream));
        if let Err(err) = spawned {
            error!(error = %err, "could not spawn rpc handler");
        }
    }
    info!(node = %node.node_info, "rpc server stopped");
}

fn handle_connection(node: &ChordNode, mut stream: TcpStream) {
    let timeout = node.config.rpc.timeout();
    if let Err(err) = stream
        .set_read_timeout(Some(timeout))
        .and_then(|_| stream.set_write_timeout(Some(timeout)))
    {
        warn!(error = %err, "could not set socket timeouts");
        return;
    }

    let payload = match wire::read_frame(&mut stream) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, "dropping connection with unreadable frame");
            return;
        }
    };

    let resp = match wire::classify_frame(&payload) {
        Inbound::Ping => return,
        Inbound::Garbage(reason) => {
            warn!(%reason, "dropping connection with malformed request");
            return;
        }
        Inbound::UnknownCommand(reason) => {
            warn!(%reason, "rejecting unknown command");
            Response::Invalid { reason }
        }
        Inbound::Request(req) => node.dispatch(req),
    };

    if let Err(err) = wire::send_message(&mut stream, &resp) {
        warn!(error = %err, "could not send response");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_rpc() -> RpcConfig {
        RpcConfig {
            timeout_ms: 300,
            retries: 3,
            base_delay_ms: 5,
        }
    }

    fn dead_node() -> NodeInfo {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        NodeInfo::new("127.0.0.1", port)
    }

    // answers every connection with the given response
    fn fake_peer(resp: Response) -> NodeInfo {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            for mut stream in listener.incoming().flatten() {
                let payload = wire::read_frame(&mut stream).unwrap();
                if payload.is_empty() {
                    continue;
                }
                wire::send_message(&mut stream, &resp).unwrap();
            }
        });
        NodeInfo::new("127.0.0.1", port)
    }

    #[test]
    fn dead_peer_is_unreachable_after_retries() {
        let remote = RemoteNode::new(dead_node(), &fast_rpc());
        assert!(!remote.ping());
        match remote.successor() {
            Err(GeneralError::PeerUnreachable { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected: {:?}", other),
        }
        match remote.simple_put(&ChordId::from_u64(1), "v") {
            Err(GeneralError::PeerUnreachable { attempts, .. }) => assert_eq!(attempts, 1),
            other => panic!("unexpected: {:?}", other),
        }
    }

    // reads one request per connection and hangs up without answering
    fn silent_peer() -> (NodeInfo, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        thread::spawn(move || {
            for mut stream in listener.incoming().flatten() {
                if let Ok(payload) = wire::read_frame(&mut stream) {
                    if !payload.is_empty() {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
        });
        (NodeInfo::new("127.0.0.1", port), seen)
    }

    #[test]
    fn unanswered_mailbox_commands_are_sent_once() {
        let (peer, seen) = silent_peer();
        let remote = RemoteNode::new(peer, &fast_rpc());
        let key = ChordId::from_u64(9);

        match remote.dequeue_messages(&key, 0) {
            Err(GeneralError::PeerUnreachable { attempts, .. }) => assert_eq!(attempts, 1),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(remote.enqueue_message(&key, "m", 0).is_err());
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        // reads are safe to repeat
        match remote.get(&key, 0) {
            Err(GeneralError::PeerUnreachable { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn live_peer_answers_ping() {
        let remote = RemoteNode::new(fake_peer(Response::Ack), &fast_rpc());
        assert!(remote.ping());
        assert!(remote.notify(&NodeInfo::new("127.0.0.1", 1)).is_ok());
    }

    #[test]
    fn error_response_becomes_remote_error() {
        let remote = RemoteNode::new(
            fake_peer(Response::Error {
                message: "boom".to_string(),
            }),
            &fast_rpc(),
        );
        match remote.get(&ChordId::from_u64(1), 0) {
            Err(GeneralError::Remote { message, .. }) => assert_eq!(message, "boom"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn mismatched_response_is_reported() {
        let remote = RemoteNode::new(fake_peer(Response::Ack), &fast_rpc());
        assert!(matches!(
            remote.successor(),
            Err(GeneralError::UnexpectedResponse {
                command: "successor",
                ..
            })
        ));
        assert!(matches!(
            remote.callback("nope", serde_json::Value::Null),
            Err(GeneralError::UnexpectedResponse { .. })
        ));
    }
}
