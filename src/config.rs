use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum NetworkType {
    #[default]
    Mainnet,
    Testnet,
    Regtest,
}

impl NetworkType {
    pub fn default_port(&self) -> u16 {
        match self {
            NetworkType::Mainnet => 8333,
            NetworkType::Testnet => 18333,
            NetworkType::Regtest => 18444,
        }
    }

    pub fn magic_bytes(&self) -> u32 {
        match self {
            NetworkType::Mainnet => 0xD9B4_BEF9,
            NetworkType::Testnet => 0x0709_110B,
            NetworkType::Regtest => 0xDAB5_BFFA,
        }
    }
}

/// Chain constants. Immutable after startup; everything tunable lives in
/// [`Config`] instead.
#[derive(Debug, Clone)]
pub struct ChainParams {
    pub magic: u32,
    pub port: u16,
    pub dns_seeds: Vec<String>,
    pub genesis_height: u32,
    pub retarget_period: u32,
    pub retarget_lookback: u32,
    /// Desired wall-clock span of one retarget period, in seconds.
    pub desired_retarget_period: u32,
    pub retarget_bound: u32,
    pub block_max_forward_timestamp: u32,
    pub script_sig_size_lower: usize,
    pub script_sig_size_upper: usize,
}

impl ChainParams {
    pub fn for_network(network: NetworkType) -> Self {
        Self {
            magic: network.magic_bytes(),
            port: network.default_port(),
            dns_seeds: match network {
                NetworkType::Mainnet => vec![
                    "seed.bitcoin.sipa.be".to_string(),
                    "dnsseed.bluematt.me".to_string(),
                    "dnsseed.bitcoin.dashjr.org".to_string(),
                    "seed.bitcoinstats.com".to_string(),
                    "seed.bitcoin.jonasschnelli.ch".to_string(),
                    "seed.btc.petertodd.org".to_string(),
                ],
                _ => vec![],
            },
            genesis_height: 0,
            retarget_period: 2016,
            retarget_lookback: 2015,
            desired_retarget_period: 14 * 24 * 3600,
            retarget_bound: 4,
            block_max_forward_timestamp: 2 * 3600,
            script_sig_size_lower: 2,
            script_sig_size_upper: 100,
        }
    }
}

/// Node tunables, loadable from a toml file in the data directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub network: NetworkType,
    pub data_dir: PathBuf,
    pub user_agent: String,
    pub protocol_version: i32,
    pub services: u64,
    pub port: u16,
    pub backlog: u32,
    pub max_outgoing: usize,
    pub min_peer_version: i32,
    pub handshake_timeout: Duration,
    pub addr_life: Duration,
    pub clear_old_addr_threshold: usize,
    pub max_message_length: u32,
    pub block_max_forward_timestamp: u32,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("./data"))
            .join("bitpeer");

        Self {
            network: NetworkType::Mainnet,
            data_dir,
            user_agent: "/bitpeer:0.1.0/".to_string(),
            protocol_version: 70015,
            services: 0x01, // NODE_NETWORK
            port: NetworkType::Mainnet.default_port(),
            backlog: 128,
            max_outgoing: 8,
            min_peer_version: 31800,
            handshake_timeout: Duration::from_secs(60),
            addr_life: Duration::from_secs(14 * 24 * 3600),
            clear_old_addr_threshold: 1000,
            max_message_length: 32 * 1024 * 1024,
            block_max_forward_timestamp: 2 * 3600,
        }
    }
}

impl Config {
    pub fn new(network: NetworkType, data_dir: Option<PathBuf>) -> Self {
        let mut config = Self {
            network,
            port: network.default_port(),
            ..Self::default()
        };
        if let Some(dir) = data_dir {
            config.data_dir = dir;
        }
        config
    }

    pub fn from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        Ok(config)
    }

    pub fn to_file(&self, path: &PathBuf) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Ok(())
    }

    pub fn chain_params(&self) -> ChainParams {
        let mut params = ChainParams::for_network(self.network);
        params.block_max_forward_timestamp = self.block_max_forward_timestamp;
        params
    }

    pub fn get_data_subdir(&self, subdir: &str) -> PathBuf {
        self.data_dir.join(subdir)
    }

    pub fn get_blocks_dir(&self) -> PathBuf {
        self.get_data_subdir("blocks")
    }

    pub fn get_peers_file(&self) -> PathBuf {
        self.data_dir.join("peers.dat")
    }

    pub fn get_peers_csv_file(&self) -> PathBuf {
        self.data_dir.join("peers.csv")
    }

    pub fn get_block_indices_file(&self) -> PathBuf {
        self.data_dir.join("block_indices.dat")
    }

    pub fn get_config_file(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}

#[derive(Debug)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    SerializeError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(msg) => write!(f, "IO error: {}", msg),
            ConfigError::ParseError(msg) => write!(f, "Parse error: {}", msg),
            ConfigError::SerializeError(msg) => write!(f, "Serialize error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_network_type_methods() {
        assert_eq!(NetworkType::Mainnet.default_port(), 8333);
        assert_eq!(NetworkType::Testnet.default_port(), 18333);
        assert_eq!(NetworkType::Mainnet.magic_bytes(), 0xD9B4_BEF9);
    }

    #[test]
    fn test_chain_params() {
        let params = ChainParams::for_network(NetworkType::Mainnet);
        assert_eq!(params.retarget_period, 2016);
        assert_eq!(params.desired_retarget_period, 14 * 24 * 3600);
        assert_eq!(params.script_sig_size_lower, 2);
        assert_eq!(params.script_sig_size_upper, 100);
        assert_eq!(params.block_max_forward_timestamp, 7200);
    }

    #[test]
    fn test_config_serialization() -> Result<(), ConfigError> {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        let config = Config::default();
        config.to_file(&config_path)?;

        let loaded = Config::from_file(&config_path)?;
        assert_eq!(config.network, loaded.network);
        assert_eq!(config.protocol_version, loaded.protocol_version);
        assert_eq!(config.max_message_length, loaded.max_message_length);
        Ok(())
    }
}
