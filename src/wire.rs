//! Request/response messages exchanged between ring members and their framing.
//!
//! A frame is a 4-byte big-endian payload length followed by that many bytes
//! of JSON. A frame of length zero is a liveness ping: the receiver closes the
//! connection without decoding or answering anything.

use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::chord_util::{ChordId, GeneralError};
use crate::data_store::KeyHandoff;
use crate::gval;
use crate::node_info::{NodeInfo, NodeStatus};

/// Every command a node answers. Anything not listed here is rejected by the
/// server before it reaches the node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Request {
    Successor,
    Predecessor,
    #[serde(alias = "get_succesors", alias = "get_succesor_list")]
    GetSuccessorList,
    ClosestPrecedingNode {
        key: ChordId,
    },
    FindSuccessor {
        key: ChordId,
    },
    Notify {
        node: NodeInfo,
    },
    Put {
        key: ChordId,
        value: String,
        hops: u8,
    },
    SimplePut {
        key: ChordId,
        value: String,
    },
    Get {
        key: ChordId,
        hops: u8,
    },
    EnqueueMessage {
        key: ChordId,
        message: String,
        hops: u8,
    },
    SimpleEnqueue {
        key: ChordId,
        message: String,
    },
    DequeueMessages {
        key: ChordId,
        hops: u8,
    },
    SimpleDequeue {
        key: ChordId,
    },
    GetKeys {
        boundary: ChordId,
        joiner: NodeInfo,
    },
    RemoveKey {
        key: ChordId,
    },
    GetNodeInfo,
    Callback {
        name: String,
        #[serde(default)]
        args: serde_json::Value,
    },
}

impl Request {
    /// False for commands whose effect must not be applied twice. A transport
    /// failure after such a request was sent is never retried.
    pub fn is_idempotent(&self) -> bool {
        !matches!(
            self,
            Request::EnqueueMessage { .. }
                | Request::SimpleEnqueue { .. }
                | Request::DequeueMessages { .. }
                | Request::Callback { .. }
        )
    }

    pub fn command_name(&self) -> &'static str {
        match self {
            Request::Successor => "successor",
            Request::Predecessor => "predecessor",
            Request::GetSuccessorList => "get_successor_list",
            Request::ClosestPrecedingNode { .. } => "closest_preceding_node",
            Request::FindSuccessor { .. } => "find_successor",
            Request::Notify { .. } => "notify",
            Request::Put { .. } => "put",
            Request::SimplePut { .. } => "simple_put",
            Request::Get { .. } => "get",
            Request::EnqueueMessage { .. } => "enqueue_message",
            Request::SimpleEnqueue { .. } => "simple_enqueue",
            Request::DequeueMessages { .. } => "dequeue_messages",
            Request::SimpleDequeue { .. } => "simple_dequeue",
            Request::GetKeys { .. } => "get_keys",
            Request::RemoveKey { .. } => "remove_key",
            Request::GetNodeInfo => "get_node_info",
            Request::Callback { .. } => "callback",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Response {
    Ack,
    Node(NodeInfo),
    MaybeNode(Option<NodeInfo>),
    Nodes(Vec<NodeInfo>),
    /// `None` is "not found", never "peer down".
    Value(Option<String>),
    Messages(Vec<String>),
    Keys(KeyHandoff),
    Status(NodeStatus),
    CallbackResult(serde_json::Value),
    /// The request named a command or callback this node does not know.
    Invalid { reason: String },
    /// The handler ran and failed.
    Error { message: String },
}

pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    if payload.len() > gval::MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame too large: {} bytes (max {})", payload.len(), gval::MAX_FRAME_LEN),
        ));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()
}

pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > gval::MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes (max {})", len, gval::MAX_FRAME_LEN),
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

pub fn send_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<(), GeneralError> {
    let payload = serde_json::to_vec(message)?;
    write_frame(writer, &payload)?;
    Ok(())
}

pub fn recv_message<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T, GeneralError> {
    let payload = read_frame(reader)?;
    Ok(serde_json::from_slice(&payload)?)
}

/// What a server makes of one inbound frame.
#[derive(Debug)]
pub enum Inbound {
    Ping,
    Request(Request),
    /// Well-formed JSON naming a command that does not exist.
    UnknownCommand(String),
    Garbage(String),
}

pub fn classify_frame(payload: &[u8]) -> Inbound {
    if payload.is_empty() {
        return Inbound::Ping;
    }
    let raw: serde_json::Value = match serde_json::from_slice(payload) {
        Ok(raw) => raw,
        Err(err) => return Inbound::Garbage(err.to_string()),
    };
    let command = match raw.get("command").and_then(|c| c.as_str()) {
        Some(command) => command.to_string(),
        None => return Inbound::Garbage("no command field".to_string()),
    };
    match serde_json::from_value::<Request>(raw) {
        Ok(req) => Inbound::Request(req),
        Err(err) => Inbound::UnknownCommand(format!("{}: {}", command, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_is_length_prefixed_big_endian() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").unwrap();
        assert_eq!(&buf[..4], &[0, 0, 0, 5]);
        assert_eq!(&buf[4..], b"hello");

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor).unwrap(), b"hello".to_vec());
    }

    #[test]
    fn payload_may_contain_any_bytes() {
        // the old "!!" terminated framing would cut this short
        let payload = b"{\"value\":\"wow!!\\n!!\"}".to_vec();
        let mut buf = Vec::new();
        write_frame(&mut buf, &payload).unwrap();
        assert_eq!(read_frame(&mut Cursor::new(buf)).unwrap(), payload);
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut buf = ((gval::MAX_FRAME_LEN + 1) as u32).to_be_bytes().to_vec();
        buf.extend_from_slice(b"xx");
        let err = read_frame(&mut Cursor::new(buf)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let mut buf = 10u32.to_be_bytes().to_vec();
        buf.extend_from_slice(b"abc");
        assert!(read_frame(&mut Cursor::new(buf)).is_err());
    }

    #[test]
    fn request_is_tagged_by_command() {
        let req = Request::Get {
            key: ChordId::from_u64(255),
            hops: 0,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["command"], "get");
        assert_eq!(json["key"], format!("{:0>40}", "ff"));

        let unit: Request = serde_json::from_str(r#"{"command":"successor"}"#).unwrap();
        assert_eq!(unit, Request::Successor);
        let legacy: Request = serde_json::from_str(r#"{"command":"get_succesors"}"#).unwrap();
        assert_eq!(legacy, Request::GetSuccessorList);
    }

    #[test]
    fn frames_are_classified() {
        assert!(matches!(classify_frame(b""), Inbound::Ping));
        assert!(matches!(classify_frame(b"\x00\xffgarbage"), Inbound::Garbage(_)));
        assert!(matches!(classify_frame(br#"{"foo":1}"#), Inbound::Garbage(_)));
        assert!(matches!(
            classify_frame(br#"{"command":"self_destruct"}"#),
            Inbound::UnknownCommand(_)
        ));
        assert!(matches!(
            classify_frame(br#"{"command":"get_node_info"}"#),
            Inbound::Request(Request::GetNodeInfo)
        ));
    }

    #[test]
    fn response_round_trips_through_frame() {
        let mut buf = Vec::new();
        send_message(&mut buf, &Response::Value(None)).unwrap();
        let back: Response = recv_message(&mut Cursor::new(buf)).unwrap();
        assert!(matches!(back, Response::Value(None)));
    }
}
