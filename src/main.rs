//! Binary entry point for bitpeer.

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use bitpeer::blockchain::Block;
use bitpeer::config::{Config, NetworkType};
use bitpeer::consensus;
use bitpeer::network::message::Message;
use bitpeer::network::{Node, NodeOptions};
use bitpeer::NodeError;

const EXIT_CONFIG: u8 = 1;
const EXIT_BIND: u8 = 2;
const EXIT_PROTOCOL: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "bitpeer", version, about = "A compact Bitcoin-compatible peer node")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the node.
    Node {
        /// Accept inbound connections.
        #[arg(long)]
        listen: bool,

        /// Comma-separated peer IPs to dial at startup.
        #[arg(long, value_delimiter = ',')]
        peers: Vec<IpAddr>,

        /// Data directory (defaults to the platform data dir).
        #[arg(long)]
        datadir: Option<PathBuf>,
    },

    /// Load a serialized block message and search for a satisfying nonce.
    Mine {
        /// Path to a serialized `block` message.
        #[arg(long)]
        block: PathBuf,

        #[arg(long, default_value_t = 0)]
        start_nonce: u32,

        #[arg(long, default_value_t = 4)]
        workers: usize,
    },

    /// Run the built-in self-tests.
    Test,
}

fn load_config(datadir: Option<PathBuf>) -> Result<Config, NodeError> {
    let config = Config::new(NetworkType::Mainnet, datadir);
    let config_file = config.get_config_file();
    if config_file.is_file() {
        let mut loaded = Config::from_file(&config_file)?;
        loaded.data_dir = config.data_dir;
        Ok(loaded)
    } else {
        Ok(config)
    }
}

async fn run_node(
    listen: bool,
    peers: Vec<IpAddr>,
    datadir: Option<PathBuf>,
) -> Result<(), NodeError> {
    let config = load_config(datadir)?;
    log::info!(
        "starting node: network={:?} datadir={}",
        config.network,
        config.data_dir.display()
    );
    let node = Node::new(config)?;
    node.run(NodeOptions {
        listen,
        initial_peers: peers,
    })
    .await
}

fn run_mine(path: PathBuf, start_nonce: u32, workers: usize) -> Result<(), NodeError> {
    let bytes = std::fs::read(&path)
        .map_err(|e| NodeError::Config(format!("cannot read {}: {}", path.display(), e)))?;
    let config = Config::default();
    let (_, message) = Message::parse_bytes(
        &bytes,
        config.network.magic_bytes(),
        config.max_message_length,
    )?;
    let block = match message {
        Some(Message::Block(block)) => block,
        _ => {
            return Err(NodeError::Config(format!(
                "{} does not contain a block message",
                path.display()
            )))
        }
    };
    mine_block(&block, start_nonce, workers)
}

fn mine_block(block: &Block, start_nonce: u32, workers: usize) -> Result<(), NodeError> {
    let mut header = block.header;
    log::info!(
        "mining over header {} with {} workers (target {:#010x})",
        header.hash().display_be(),
        workers,
        header.target
    );

    let found = if workers <= 1 {
        consensus::mine(&header, start_nonce)
    } else {
        consensus::mine_parallel(&header, workers)
    };

    match found {
        Some(nonce) => {
            header.nonce = nonce;
            println!("nonce = {}", nonce);
            println!("hash  = {}", header.hash().display_be());
            Ok(())
        }
        None => Err(NodeError::ProtocolViolation(
            "nonce space exhausted without a solution".to_string(),
        )),
    }
}

fn exit_code_for(error: &NodeError) -> u8 {
    match error {
        NodeError::Config(_) => EXIT_CONFIG,
        NodeError::Transport(_) => EXIT_BIND,
        _ => EXIT_PROTOCOL,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Node {
            listen,
            peers,
            datadir,
        } => run_node(listen, peers, datadir).await,
        Command::Mine {
            block,
            start_nonce,
            workers,
        } => run_mine(block, start_nonce, workers),
        Command::Test => match bitpeer::selftest::run() {
            Ok(()) => {
                println!("all self-tests passed");
                Ok(())
            }
            Err(failures) => {
                eprintln!("self-tests failed: {}", failures.join(", "));
                return ExitCode::from(EXIT_PROTOCOL);
            }
        },
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}
