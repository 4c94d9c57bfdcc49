// Copyright (C) 2013-2020 Blockstack PBC, a public benefit corporation
// Copyright (C) 2020 Stacks Open Internet Foundation
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use std::fmt::{Debug, Display};
use std::fs;
use std::path::{Path, PathBuf};

use indexer_common::consts::{CHAIN_ID_MAINNET, CHAIN_ID_TESTNET};
use serde::Deserialize;

use crate::chainstate::coordinator::ChainsCoordinatorConfig;
use crate::core::MEMPOOL_MAX_TRANSACTION_AGE;
use crate::util_lib::db::MEMORY_DB_PATH;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// Error occurred reading config file
    #[error("{0}")]
    InvalidConfig(String),
    /// An error occurred parsing the TOML data
    #[error("{0}")]
    ParseError(String),
    /// A field was malformed
    #[error("identifier={0}, value={1}")]
    BadField(String, String),
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// The mainnet network
    Mainnet,
    /// The testnet network
    Testnet,
    /// The mocknet network
    Mocknet,
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mainnet => write!(f, "mainnet"),
            Self::Testnet => write!(f, "testnet"),
            Self::Mocknet => write!(f, "mocknet"),
        }
    }
}

impl Network {
    /// Check if the network is Mainnet or not
    pub const fn is_mainnet(&self) -> bool {
        match self {
            Self::Mainnet => true,
            Self::Testnet | Self::Mocknet => false,
        }
    }
}

/// The parsed configuration for the indexer
#[derive(Clone, PartialEq)]
pub struct Config {
    /// Path to the chain state database
    pub db_path: PathBuf,
    /// The network the ingested chain belongs to
    pub network: Network,
    /// Dropped or confirmed mempool rows older than this many blocks are deleted
    pub mempool_gc_threshold_blocks: u64,
    /// Pending mempool rows older than this many blocks are dropped as stale
    pub mempool_stale_threshold_blocks: Option<u64>,
    /// Reorgs deeper than this are refused
    pub max_reorg_depth: Option<u64>,
    /// File to append change notifications to, one JSON object per line
    pub event_log_path: Option<PathBuf>,
}

/// The raw configuration file
#[derive(Deserialize, Debug)]
pub struct RawConfigFile {
    /// Path to the chain state database, or `:memory:`
    pub db_path: String,
    /// The network to use. One of "mainnet", "testnet", or "mocknet".
    pub network: Network,
    /// Defaults to 256
    pub mempool_gc_threshold_blocks: Option<u64>,
    pub mempool_stale_threshold_blocks: Option<u64>,
    pub max_reorg_depth: Option<u64>,
    pub event_log_path: Option<String>,
}

impl RawConfigFile {
    /// load the config from a string
    pub fn load_from_str(data: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(data).map_err(|e| ConfigError::ParseError(format!("{e:?}")))?;
        Ok(config)
    }
}

impl TryFrom<&PathBuf> for RawConfigFile {
    type Error = ConfigError;

    fn try_from(path: &PathBuf) -> Result<Self, Self::Error> {
        Self::load_from_str(&fs::read_to_string(path).map_err(|e| {
            ConfigError::InvalidConfig(format!("failed to read config file: {e:?}"))
        })?)
    }
}

fn positive(name: &str, value: Option<u64>) -> Result<Option<u64>, ConfigError> {
    match value {
        Some(0) => Err(ConfigError::BadField(name.to_string(), "0".to_string())),
        other => Ok(other),
    }
}

impl TryFrom<RawConfigFile> for Config {
    type Error = ConfigError;

    /// Attempt to decode the raw config file's primitive types into our types.
    fn try_from(raw_data: RawConfigFile) -> Result<Self, Self::Error> {
        if raw_data.db_path.trim().is_empty() {
            return Err(ConfigError::BadField(
                "db_path".to_string(),
                raw_data.db_path.clone(),
            ));
        }
        let mempool_gc_threshold_blocks = positive(
            "mempool_gc_threshold_blocks",
            raw_data.mempool_gc_threshold_blocks,
        )?
        .unwrap_or(MEMPOOL_MAX_TRANSACTION_AGE);
        let mempool_stale_threshold_blocks = positive(
            "mempool_stale_threshold_blocks",
            raw_data.mempool_stale_threshold_blocks,
        )?;
        let max_reorg_depth = positive("max_reorg_depth", raw_data.max_reorg_depth)?;
        let event_log_path = match raw_data.event_log_path {
            Some(path) if path.trim().is_empty() => {
                return Err(ConfigError::BadField("event_log_path".to_string(), path));
            }
            other => other.map(PathBuf::from),
        };

        Ok(Self {
            db_path: PathBuf::from(raw_data.db_path),
            network: raw_data.network,
            mempool_gc_threshold_blocks,
            mempool_stale_threshold_blocks,
            max_reorg_depth,
            event_log_path,
        })
    }
}

impl TryFrom<&PathBuf> for Config {
    type Error = ConfigError;
    fn try_from(path: &PathBuf) -> Result<Self, ConfigError> {
        let config_file = RawConfigFile::try_from(path)?;
        Self::try_from(config_file)
    }
}

impl Config {
    /// load the config from a string and parse it
    pub fn load_from_str(data: &str) -> Result<Self, ConfigError> {
        RawConfigFile::load_from_str(data)?.try_into()
    }

    /// load the config from a file and parse it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        Self::try_from(&path.to_path_buf())
    }

    /// Convert the network to the chain ID its blocks are signed for
    pub fn to_chain_id(&self) -> u32 {
        if self.network.is_mainnet() {
            CHAIN_ID_MAINNET
        } else {
            CHAIN_ID_TESTNET
        }
    }

    /// The database path as handed to sqlite
    pub fn db_path_str(&self) -> &str {
        self.db_path.to_str().unwrap_or(MEMORY_DB_PATH)
    }

    pub fn coordinator_config(&self) -> ChainsCoordinatorConfig {
        ChainsCoordinatorConfig {
            mempool_gc_threshold: self.mempool_gc_threshold_blocks,
            mempool_stale_threshold: self.mempool_stale_threshold_blocks,
            max_reorg_depth: self.max_reorg_depth,
        }
    }

    /// Return a string with the configuration information for logging purposes
    pub fn config_to_log_string(&self) -> String {
        let opt_to_string = |value: Option<u64>| match value {
            Some(v) => v.to_string(),
            None => "None".to_string(),
        };
        let event_log_path = match &self.event_log_path {
            Some(path) => path.to_str().unwrap_or_default().to_string(),
            None => "None".to_string(),
        };
        format!(
            r#"
Network: {network}
Chain ID: 0x{chain_id:08x}
Database path: {db_path}
Mempool GC threshold: {gc} blocks
Mempool stale threshold: {stale}
Max reorg depth: {reorg}
Event log path: {event_log_path}
"#,
            network = self.network,
            chain_id = self.to_chain_id(),
            db_path = self.db_path.to_str().unwrap_or_default(),
            gc = self.mempool_gc_threshold_blocks,
            stale = opt_to_string(self.mempool_stale_threshold_blocks),
            reorg = opt_to_string(self.max_reorg_depth),
            event_log_path = event_log_path,
        )
    }
}

impl Display for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.config_to_log_string())
    }
}

impl Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.config_to_log_string())
    }
}
