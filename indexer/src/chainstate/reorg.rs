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

//! Fork choice.  The canonical chain is the highest one; between chains of equal height the
//! one whose tip arrived first stays canonical, so a competing branch only takes over once it
//! is strictly higher than the canonical tip.

use indexer_common::types::chainstate::{BlockHeaderHash, StacksBlockId};

use crate::chainstate::db::{ChainStateDB, StacksBlockHeaderInfo};
use crate::chainstate::{BlockData, Error};
use crate::util_lib::db::{DBConn, DBTx};

/// How a newly stored block changes the canonical chain.
#[derive(Debug, Clone, PartialEq)]
pub enum ForkChoice {
    /// First block of an empty store
    Genesis,
    /// Builds directly on the canonical tip
    Extend { parent: StacksBlockId },
    /// Makes a competing branch the highest chain
    Reorg(ReorgPlan),
    /// Stays off the canonical chain, at least for now
    Sibling,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReorgPlan {
    /// Last block both chains share; `None` if they diverge at genesis
    pub common_ancestor: Option<StacksBlockId>,
    /// Canonical blocks above the common ancestor, tip first
    pub rolled_back: Vec<StacksBlockHeaderInfo>,
    /// Stored blocks of the new branch between the common ancestor and the new block,
    /// lowest first.  The new block itself is not included.
    pub stored_branch: Vec<StacksBlockHeaderInfo>,
}

/// Canonical-flag changes made by [`ForkChoice::apply`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlipOutcome {
    /// Newly canonical blocks, lowest first
    pub applied: Vec<StacksBlockHeaderInfo>,
    /// No longer canonical blocks, tip first
    pub rolled_back: Vec<StacksBlockHeaderInfo>,
    /// Unconfirmed microblocks a newly canonical block declined to accept
    pub orphaned_microblocks: Vec<BlockHeaderHash>,
}

impl ReorgPlan {
    pub fn depth(&self) -> u64 {
        self.rolled_back.len() as u64
    }
}

impl ForkChoice {
    /// Decide where `block` goes.  Its parent must already be stored (unless it is the
    /// genesis block) and `block` itself must not be.
    pub fn plan(
        conn: &DBConn,
        block: &BlockData,
        max_reorg_depth: Option<u64>,
    ) -> Result<ForkChoice, Error> {
        let Some(tip) = ChainStateDB::get_canonical_tip_block(conn)? else {
            if block.is_genesis() {
                return Ok(ForkChoice::Genesis);
            }
            return Err(Error::UnknownParentBlock(block.parent_index_block_hash));
        };

        if block.parent_index_block_hash == tip.block.index_block_hash {
            return Ok(ForkChoice::Extend {
                parent: tip.block.index_block_hash,
            });
        }
        if block.block_height <= tip.block_height() {
            debug!("Storing non-canonical sibling";
                   "index_block_hash" => %block.index_block_hash,
                   "block_height" => block.block_height,
                   "tip_height" => tip.block_height());
            return Ok(ForkChoice::Sibling);
        }

        // walk the new branch down to the first canonical block
        let mut stored_branch = vec![];
        let mut cursor = block.parent_index_block_hash;
        let common_ancestor = loop {
            if cursor.is_zero() {
                break None;
            }
            let ancestor = ChainStateDB::get_block(conn, &cursor)?
                .ok_or(Error::UnknownParentBlock(cursor))?;
            if ancestor.canonical {
                break Some(ancestor);
            }
            cursor = ancestor.block.parent_index_block_hash;
            stored_branch.push(ancestor);
            if let Some(max) = max_reorg_depth {
                let depth = stored_branch.len() as u64 + 1;
                if depth > max {
                    return Err(Error::ReorgDepthExceeded(depth, max));
                }
            }
        };
        stored_branch.reverse();

        // the canonical chain is connected, so everything above the ancestor is rolled back
        let ancestor_height = common_ancestor.as_ref().map_or(0, |a| a.block_height());
        let rolled_back = ChainStateDB::get_canonical_blocks_above(conn, ancestor_height)?;
        if let Some(max) = max_reorg_depth {
            let depth = rolled_back.len() as u64;
            if depth > max {
                return Err(Error::ReorgDepthExceeded(depth, max));
            }
        }

        let plan = ReorgPlan {
            common_ancestor: common_ancestor.map(|a| a.block.index_block_hash),
            rolled_back,
            stored_branch,
        };
        info!("Reorg";
              "new_tip" => %block.index_block_hash,
              "new_height" => block.block_height,
              "old_tip" => %tip.block.index_block_hash,
              "old_height" => tip.block_height(),
              "depth" => plan.depth());
        Ok(ForkChoice::Reorg(plan))
    }

    /// Every already-stored block whose canonical status this choice changes, or whose
    /// unconfirmed microblock stream it may orphan.
    pub fn affected_blocks(&self, block: &BlockData) -> Vec<StacksBlockId> {
        let mut affected = vec![];
        match self {
            ForkChoice::Genesis | ForkChoice::Sibling => {}
            ForkChoice::Extend { parent } => affected.push(*parent),
            ForkChoice::Reorg(plan) => {
                affected.extend(plan.rolled_back.iter().map(|b| b.block.index_block_hash));
                affected.extend(plan.stored_branch.iter().map(|b| b.block.index_block_hash));
                affected.extend(plan.common_ancestor);
            }
        }
        if !block.parent_index_block_hash.is_zero()
            && !affected.contains(&block.parent_index_block_hash)
        {
            affected.push(block.parent_index_block_hash);
        }
        affected
    }

    /// Flip canonical flags so that `block` (already stored) ends up where this choice puts
    /// it.
    pub fn apply(&self, tx: &DBTx, block: &BlockData) -> Result<FlipOutcome, Error> {
        let new_block = ChainStateDB::get_block(tx, &block.index_block_hash)?
            .ok_or(Error::UnknownParentBlock(block.index_block_hash))?;
        let (to_apply, rolled_back) = match self {
            ForkChoice::Sibling => return Ok(FlipOutcome::default()),
            ForkChoice::Genesis | ForkChoice::Extend { .. } => (vec![new_block], vec![]),
            ForkChoice::Reorg(plan) => {
                let mut to_apply = plan.stored_branch.clone();
                to_apply.push(new_block);
                (to_apply, plan.rolled_back.clone())
            }
        };

        for old in rolled_back.iter() {
            ChainStateDB::set_block_canonical(tx, old.index_block_hash(), false)?;
        }
        let mut orphaned_microblocks = vec![];
        for new in to_apply.iter() {
            ChainStateDB::set_block_canonical(tx, new.index_block_hash(), true)?;
            // the parent's stream is settled by the microblocks this block accepted
            if !new.block.parent_index_block_hash.is_zero() {
                orphaned_microblocks.extend(ChainStateDB::orphan_unaccepted_microblocks(
                    tx,
                    &new.block.parent_index_block_hash,
                )?);
            }
        }

        let applied = to_apply
            .into_iter()
            .map(|mut b| {
                b.canonical = true;
                b
            })
            .collect();
        let rolled_back = rolled_back
            .into_iter()
            .map(|mut b| {
                b.canonical = false;
                b
            })
            .collect();
        Ok(FlipOutcome {
            applied,
            rolled_back,
            orphaned_microblocks,
        })
    }
}
