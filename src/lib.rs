//! A Chord ring that serves as the directory and mailbox of a messaging
//! application.
//!
//! Every member runs a [`chord_node::ChordNode`]: it owns the keys between its
//! predecessor and itself, replicates them along its successor list and keeps
//! its routing state converging through three maintenance loops. Clients of
//! the ring use [`directory::DirectoryClient`] or the plain
//! `put`/`get`/`enqueue_message`/`dequeue_messages` operations.

pub mod gval;
pub mod chord_util;
pub mod node_info;
pub mod data_store;
pub mod wire;
pub mod config;
pub mod endpoints;
pub mod router;
pub mod stabilizer;
pub mod chord_node;
pub mod directory;

pub use chord_node::ChordNode;
pub use chord_util::{ChordId, GeneralError};
pub use config::NodeConfig;
pub use node_info::{NodeInfo, NodeStatus};
