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

extern crate serde_json;
extern crate slog;
extern crate stacks_indexer;

use std::error::Error;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader};
use std::path::Path;
use std::process;

use clap::Parser;
use indexer_common::{debug, error, info};
use serde::Serialize;
use serde_json::json;
use slog::{slog_debug, slog_error, slog_info};
use stacks_indexer::chainstate::coordinator::ChainStateCoordinator;
use stacks_indexer::chainstate::db::ChainStateDB;
use stacks_indexer::cli::{Cli, Command, ConfigArgs, MempoolArgs, NoncesArgs, ReplayArgs, TxStatusArgs};
use stacks_indexer::config::Config;
use stacks_indexer::event_dispatcher::JsonEventObserver;
use stacks_indexer::feed::FeedReplayer;
use stacks_indexer::monitoring;

type CliResult = Result<(), Box<dyn Error>>;

fn print_json<T: Serialize>(value: &T) -> CliResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn open_coordinator(args: &ConfigArgs) -> Result<ChainStateCoordinator, Box<dyn Error>> {
    let config = Config::load_from_file(&args.config)?;
    debug!("Loaded config"; "config" => %config.config_to_log_string());
    let chainstate = ChainStateDB::open(config.network.is_mainnet(), config.db_path_str())?;
    let mut coordinator = ChainStateCoordinator::new(chainstate, config.coordinator_config());
    if let Some(path) = &config.event_log_path {
        let sink = OpenOptions::new().create(true).append(true).open(path)?;
        coordinator.register_observer(Box::new(JsonEventObserver::new(sink)));
    }
    Ok(coordinator)
}

fn handle_replay(args: ReplayArgs) -> CliResult {
    let mut coordinator = open_coordinator(&args.config_args)?;
    let replayer = FeedReplayer {
        max_attempts: args.max_attempts,
        stop_on_error: args.stop_on_error,
    };
    let summary = match &args.feed {
        Some(path) => {
            info!("Replaying feed"; "path" => %path.display());
            replayer.replay(&mut coordinator, BufReader::new(File::open(path)?))?
        }
        None => {
            info!("Replaying feed from stdin");
            replayer.replay(&mut coordinator, io::stdin().lock())?
        }
    };
    print_json(&summary)?;
    if args.print_metrics {
        print!("{}", monitoring::gather_metrics());
    }
    Ok(())
}

fn handle_tip(args: ConfigArgs) -> CliResult {
    let coordinator = open_coordinator(&args)?;
    let tip = coordinator.get_chain_tip()?;
    print_json(&json!({
        "block_etag": tip.block_etag(),
        "mempool_etag": tip.mempool_etag(),
        "tip": tip,
    }))
}

fn handle_mempool(args: MempoolArgs) -> CliResult {
    let coordinator = open_coordinator(&args.config_args)?;
    let page = coordinator.get_mempool_tx_list(&args.filter(), args.limit, args.offset)?;
    print_json(&page)
}

fn handle_tx_status(args: TxStatusArgs) -> CliResult {
    let coordinator = open_coordinator(&args.config_args)?;
    match coordinator.get_tx_status(&args.txid, args.unanchored)? {
        Some(status) => print_json(&status),
        None => Err(format!("Transaction {} not found", args.txid.to_prefixed_hex()).into()),
    }
}

fn handle_nonces(args: NoncesArgs) -> CliResult {
    let coordinator = open_coordinator(&args.config_args)?;
    print_json(&coordinator.get_address_nonces(&args.address, args.unanchored)?)
}

fn handle_gc(args: ConfigArgs) -> CliResult {
    let mut coordinator = open_coordinator(&args)?;
    let deleted = coordinator.garbage_collect_mempool()?;
    println!("Deleted {deleted} mempool transactions");
    Ok(())
}

fn handle_check_config(args: ConfigArgs) -> CliResult {
    let config = Config::load_from_file(&args.config)?;
    if let Some(parent) = Path::new(config.db_path_str()).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            println!("Database directory {} will be created", parent.display());
        }
    }
    println!("Config: {config}");
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let res = match cli.command {
        Command::Replay(args) => handle_replay(args),
        Command::Tip(args) => handle_tip(args),
        Command::Mempool(args) => handle_mempool(args),
        Command::TxStatus(args) => handle_tx_status(args),
        Command::Nonces(args) => handle_nonces(args),
        Command::Gc(args) => handle_gc(args),
        Command::CheckConfig(args) => handle_check_config(args),
    };
    if let Err(e) = res {
        error!("Command failed"; "err" => %e);
        eprintln!("{e}");
        process::exit(1);
    }
}
