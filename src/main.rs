//! `chord_directory`: run a ring node, or talk to a running one.
//!
//! ```text
//! chord_directory run                               # new ring on 127.0.0.1:5000
//! chord_directory run -p 5001 -j 127.0.0.1:5000     # join it
//! chord_directory -c node.toml run                  # settings from a file
//! chord_directory status 127.0.0.1:5001
//! chord_directory put alice 10.0.0.7:9000
//! chord_directory get alice
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use chord_directory::chord_util::{self, GeneralError};
use chord_directory::config::{self, NodeConfig};
use chord_directory::endpoints::RemoteNode;
use chord_directory::{ChordId, ChordNode, NodeInfo};

#[derive(Parser)]
#[command(
    name = "chord_directory",
    version,
    about = "Chord ring node serving a client directory and mailbox"
)]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a ring node until killed.
    Run {
        /// Address to bind and advertise.
        #[arg(long)]
        ip: Option<String>,

        /// Port to listen on. 0 picks a free one.
        #[arg(short, long)]
        port: Option<u16>,

        /// `host:port` of a running node to join through. Omit to start a new ring.
        #[arg(short, long, env = "CHORD_JOIN")]
        join: Option<String>,
    },

    /// Print the routing state of a node.
    Status {
        #[arg(default_value = "127.0.0.1:5000")]
        node: String,
    },

    /// Store `value` under `sha1(key)`.
    Put {
        key: String,
        value: String,
        #[arg(short, long, default_value = "127.0.0.1:5000")]
        node: String,
    },

    /// Look up the value stored under `sha1(key)`.
    Get {
        key: String,
        #[arg(short, long, default_value = "127.0.0.1:5000")]
        node: String,
    },

    /// Queue a message under `sha1(key)`.
    Enqueue {
        key: String,
        message: String,
        #[arg(short, long, default_value = "127.0.0.1:5000")]
        node: String,
    },

    /// Take every message queued under `sha1(key)`.
    Dequeue {
        key: String,
        #[arg(short, long, default_value = "127.0.0.1:5000")]
        node: String,
    },
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        error!(error = %err, "exiting");
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), GeneralError> {
    let mut node_config = NodeConfig::load(cli.config.as_deref())?;
    chord_util::init_tracing(&node_config.log.level);

    match cli.command {
        Commands::Run { ip, port, join } => {
            if let Some(ip) = ip {
                node_config.listen_ip = ip;
            }
            if let Some(port) = port {
                node_config.port = port;
            }
            if join.is_some() {
                node_config.bootstrap = join;
            }
            run_node(node_config)
        }
        Commands::Status { node } => {
            let status = remote(&node, &node_config)?.get_node_info()?;
            println!("{}", status);
            Ok(())
        }
        Commands::Put { key, value, node } => {
            remote(&node, &node_config)?.put(&ChordId::hash_of(&key), &value, 0)?;
            println!("stored");
            Ok(())
        }
        Commands::Get { key, node } => {
            match remote(&node, &node_config)?.get(&ChordId::hash_of(&key), 0)? {
                Some(value) => println!("{}", value),
                None => println!("(not found)"),
            }
            Ok(())
        }
        Commands::Enqueue { key, message, node } => {
            remote(&node, &node_config)?.enqueue_message(&ChordId::hash_of(&key), &message, 0)?;
            println!("queued");
            Ok(())
        }
        Commands::Dequeue { key, node } => {
            let messages = remote(&node, &node_config)?.dequeue_messages(&ChordId::hash_of(&key), 0)?;
            for message in messages {
                println!("{}", message);
            }
            Ok(())
        }
    }
}

fn run_node(node_config: NodeConfig) -> Result<(), GeneralError> {
    node_config.validate()?;
    let node = ChordNode::launch(node_config)?;
    info!(node = %node.node_info, "node is up");
    while !node.is_shutdown() {
        node.sleep_unless_shutdown(Duration::from_secs(1));
    }
    Ok(())
}

fn remote(addr: &str, node_config: &NodeConfig) -> Result<RemoteNode, GeneralError> {
    let (host, port) = config::parse_host_port(addr)?;
    Ok(RemoteNode::new(NodeInfo::new(&host, port), &node_config.rpc))
}
