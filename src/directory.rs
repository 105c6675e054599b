//! Client directory and mailbox on top of the ring.
//!
//! A client is known by name. Its current address is stored as JSON under
//! `sha1(name)`, and messages for it queue under the same key until it
//! collects them.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::chord_util::{ChordId, GeneralError};
use crate::config::{self, RpcConfig};
use crate::endpoints::RemoteNode;
use crate::node_info::NodeInfo;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientAddress {
    pub ip: String,
    pub port: u16,
}

pub struct DirectoryClient {
    peers: Vec<NodeInfo>,
    rpc: RpcConfig,
}

impl DirectoryClient {
    /// `peers` are tried in order for every operation.
    pub fn new(peers: Vec<NodeInfo>, rpc: &RpcConfig) -> DirectoryClient {
        DirectoryClient {
            peers,
            rpc: rpc.clone(),
        }
    }

    pub fn from_addresses(addrs: &[&str], rpc: &RpcConfig) -> Result<DirectoryClient, GeneralError> {
        let mut peers = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let (host, port) = config::parse_host_port(addr)?;
            peers.push(NodeInfo::new(&host, port));
        }
        Ok(DirectoryClient::new(peers, rpc))
    }

    pub fn client_key(name: &str) -> ChordId {
        ChordId::hash_of(name)
    }

    pub fn register_client(&self, name: &str, address: &ClientAddress) -> Result<(), GeneralError> {
        let key = Self::client_key(name);
        let value = serde_json::to_string(address)?;
        self.with_any_peer("register_client", |peer| peer.put(&key, &value, 0))
    }

    pub fn locate_client(&self, name: &str) -> Result<Option<ClientAddress>, GeneralError> {
        let key = Self::client_key(name);
        let value = self.with_any_peer("locate_client", |peer| peer.get(&key, 0))?;
        match value {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub fn post_message(&self, name: &str, message: &str) -> Result<(), GeneralError> {
        let key = Self::client_key(name);
        self.with_any_peer("post_message", |peer| peer.enqueue_message(&key, message, 0))
    }

    pub fn collect_messages(&self, name: &str) -> Result<Vec<String>, GeneralError> {
        let key = Self::client_key(name);
        self.with_any_peer("collect_messages", |peer| peer.dequeue_messages(&key, 0))
    }

    // the first peer that answers decides. only unreachable peers are skipped
    fn with_any_peer<T>(
        &self,
        op: &'static str,
        call: impl Fn(&RemoteNode) -> Result<T, GeneralError>,
    ) -> Result<T, GeneralError> {
        let mut failures: Vec<String> = Vec::new();
        for peer in &self.peers {
            match call(&RemoteNode::new(peer.clone(), &self.rpc)) {
                Ok(val) => return Ok(val),
                Err(err) if err.is_unreachable() => {
                    warn!(peer = %peer, op, error = %err, "directory peer unreachable");
                    failures.push(peer.address_str());
                }
                Err(err) => return Err(err),
            }
        }
        Err(GeneralError::DirectoryUnavailable(format!(
            "{}: no peer answered (tried [{}])",
            op,
            failures.join(", ")
        )))
    }
}
