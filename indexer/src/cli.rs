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

use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;
use indexer_common::types::chainstate::Txid;
use indexer_common::types::StacksAddress;

use crate::chainstate::TransactionType;
use crate::core::mempool::MempoolFilter;
use crate::core::MEMPOOL_MAX_PAGE_SIZE;

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Subcommand action to take
    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Subcommand, Debug)]
pub enum Command {
    /// Replay a newline-delimited JSON event feed into the chain state database
    Replay(ReplayArgs),
    /// Print the current chain tip
    Tip(ConfigArgs),
    /// List pending mempool transactions
    Mempool(MempoolArgs),
    /// Print what is known about a transaction
    TxStatus(TxStatusArgs),
    /// Print the nonce state of an address
    Nonces(NoncesArgs),
    /// Run the mempool garbage collector against the current tip
    Gc(ConfigArgs),
    /// Check a configuration file and output config information
    CheckConfig(ConfigArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct ConfigArgs {
    /// Path to the indexer's TOML config
    #[arg(short, long)]
    pub config: PathBuf,
}

#[derive(Parser, Debug, Clone)]
pub struct ReplayArgs {
    /// The base arguments
    #[clap(flatten)]
    pub config_args: ConfigArgs,
    /// Feed to read from. Reads stdin if absent.
    #[arg(long)]
    pub feed: Option<PathBuf>,
    /// Stop at the first rejected event instead of logging it and moving on
    #[arg(long, default_value_t = false)]
    pub stop_on_error: bool,
    /// Attempts per event while the database is busy
    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u32).range(1..))]
    pub max_attempts: u32,
    /// Print Prometheus metrics when the replay finishes
    #[arg(long, default_value_t = false)]
    pub print_metrics: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct MempoolArgs {
    /// The base arguments
    #[clap(flatten)]
    pub config_args: ConfigArgs,
    /// Only transactions sent by this address
    #[arg(long, value_parser = parse_address)]
    pub sender: Option<StacksAddress>,
    /// Only token transfers to this principal
    #[arg(long)]
    pub recipient: Option<String>,
    /// Only transactions that send, sponsor, or transfer to this principal
    #[arg(long)]
    pub address: Option<String>,
    /// Only these transaction types. May be repeated.
    #[arg(long = "type", value_parser = parse_tx_type)]
    pub tx_types: Vec<TransactionType>,
    #[arg(long, default_value_t = 20, value_parser = clap::value_parser!(u32).range(1..=i64::from(MEMPOOL_MAX_PAGE_SIZE)))]
    pub limit: u32,
    #[arg(long, default_value_t = 0)]
    pub offset: u32,
}

impl MempoolArgs {
    pub fn filter(&self) -> MempoolFilter {
        MempoolFilter {
            sender_address: self.sender.clone(),
            recipient_address: self.recipient.clone(),
            address: self.address.clone(),
            tx_types: self.tx_types.clone(),
        }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct TxStatusArgs {
    /// The base arguments
    #[clap(flatten)]
    pub config_args: ConfigArgs,
    /// Transaction ID in hex, with or without 0x
    #[arg(value_parser = parse_txid)]
    pub txid: Txid,
    /// Count transactions in the unconfirmed microblock stream as confirmed
    #[arg(long, default_value_t = false)]
    pub unanchored: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct NoncesArgs {
    /// The base arguments
    #[clap(flatten)]
    pub config_args: ConfigArgs,
    #[arg(value_parser = parse_address)]
    pub address: StacksAddress,
    /// Count transactions in the unconfirmed microblock stream as executed
    #[arg(long, default_value_t = false)]
    pub unanchored: bool,
}

/// Parse a transaction ID from the provided string
fn parse_txid(txid: &str) -> Result<Txid, String> {
    Txid::from_hex(txid.trim()).map_err(|e| format!("Invalid transaction ID: {e}"))
}

/// Parse a Stacks address from the provided string
fn parse_address(address: &str) -> Result<StacksAddress, String> {
    StacksAddress::from_str(address.trim()).map_err(|e| format!("Invalid address: {e:?}"))
}

/// Parse a transaction type name, as stored in the database
fn parse_tx_type(name: &str) -> Result<TransactionType, String> {
    TransactionType::lookup_by_name(name)
        .ok_or_else(|| {
            format!(
                "Invalid transaction type: {name} (expected one of: {})",
                TransactionType::ALL_NAMES.join(", ")
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::mempool::tests::SENDER;

    #[test]
    fn test_parse_txid() {
        let hex = "0x".to_string() + &"ab".repeat(32);
        assert_eq!(parse_txid(&hex).unwrap(), Txid([0xab; 32]));
        assert_eq!(parse_txid(&hex[2..]).unwrap(), Txid([0xab; 32]));
        assert!(parse_txid("0xabcd").is_err());
        assert!(parse_txid("not hex").is_err());
    }

    #[test]
    fn test_parse_mempool_args() {
        let cli = Cli::try_parse_from([
            "stacks-indexer",
            "mempool",
            "--config",
            "indexer.toml",
            "--sender",
            SENDER,
            "--type",
            "token_transfer",
            "--type",
            "contract_call",
            "--limit",
            "50",
        ])
        .unwrap();
        let Command::Mempool(args) = cli.command else {
            panic!("expected the mempool subcommand");
        };
        assert_eq!(args.config_args.config, PathBuf::from("indexer.toml"));
        assert_eq!(args.limit, 50);
        assert_eq!(args.offset, 0);
        let filter = args.filter();
        assert_eq!(filter.sender_address, Some(SENDER.parse().unwrap()));
        assert_eq!(
            filter.tx_types,
            vec![TransactionType::TokenTransfer, TransactionType::ContractCall]
        );

        assert!(Cli::try_parse_from([
            "stacks-indexer",
            "mempool",
            "--config",
            "indexer.toml",
            "--limit",
            "201",
        ])
        .is_err());
        assert!(Cli::try_parse_from([
            "stacks-indexer",
            "mempool",
            "--config",
            "indexer.toml",
            "--type",
            "burn",
        ])
        .is_err());
    }

    #[test]
    fn test_parse_replay_args() {
        let cli = Cli::try_parse_from([
            "stacks-indexer",
            "replay",
            "-c",
            "indexer.toml",
            "--feed",
            "events.ndjson",
            "--stop-on-error",
        ])
        .unwrap();
        let Command::Replay(args) = cli.command else {
            panic!("expected the replay subcommand");
        };
        assert_eq!(args.feed, Some(PathBuf::from("events.ndjson")));
        assert!(args.stop_on_error);
        assert_eq!(args.max_attempts, 5);
        assert!(!args.print_metrics);
    }
}
