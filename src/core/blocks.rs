//! Basic-block recognition over raw operations
//!
//! A single pass over the operation stream records block leaders: offset 0,
//! every branch target, the instruction following any block-ending operation,
//! and exception-region boundaries. The lifter worklist then drives symbolic
//! execution per block.

use indexmap::IndexMap;
use std::collections::HashSet;

use crate::common::types::{ExceptionRegionInfo, OpValue, RawOp};
use crate::core::tac::BasicBlock;

/// Recognized blocks keyed by leader offset.
#[derive(Debug, Clone, Default)]
pub struct BlockTable {
    blocks: IndexMap<u32, BasicBlock>,
}

impl BlockTable {
    pub fn new() -> Self {
        Self {
            blocks: IndexMap::new(),
        }
    }

    /// Get or create the block led by `offset`.
    pub fn ensure(&mut self, offset: u32) -> &mut BasicBlock {
        self.blocks
            .entry(offset)
            .or_insert_with(|| BasicBlock::new(offset))
    }

    pub fn get(&self, offset: u32) -> Option<&BasicBlock> {
        self.blocks.get(&offset)
    }

    pub fn get_mut(&mut self, offset: u32) -> Option<&mut BasicBlock> {
        self.blocks.get_mut(&offset)
    }

    /// Is `offset` a recognized block leader?
    pub fn is_leader(&self, offset: u32) -> bool {
        self.blocks.contains_key(&offset)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Leader offsets in ascending order.
    pub fn offsets_sorted(&self) -> Vec<u32> {
        let mut offsets: Vec<u32> = self.blocks.keys().copied().collect();
        offsets.sort_unstable();
        offsets
    }

    /// Blocks in ascending leader order.
    pub fn iter_sorted(&self) -> impl Iterator<Item = &BasicBlock> {
        let offsets = self.offsets_sorted();
        offsets.into_iter().filter_map(move |o| self.blocks.get(&o))
    }
}

/// Branch targets carried by an operation's operand.
fn operand_targets(op: &RawOp) -> Vec<u32> {
    match &op.operand {
        OpValue::Target(t) => vec![*t],
        OpValue::Targets(ts) => ts.clone(),
        _ => Vec::new(),
    }
}

/// Scan the operation stream and build the block table.
///
/// Branch targets pointing outside the method are ignored here; the lifter
/// reports them when it tries to enqueue the missing block.
pub fn recognize_blocks(ops: &[RawOp], regions: &[ExceptionRegionInfo]) -> BlockTable {
    let mut table = BlockTable::new();
    if ops.is_empty() {
        return table;
    }

    let known_offsets: HashSet<u32> = ops.iter().map(|op| op.offset).collect();

    // Entry point
    table.ensure(ops[0].offset);

    for (index, op) in ops.iter().enumerate() {
        if !op.opcode.ends_block() {
            continue;
        }

        // Branch targets keep the default fall-through flag; only a leader
        // directly following a non-falling operation overwrites it below.
        if op.opcode.is_branch() {
            for target in operand_targets(op) {
                if known_offsets.contains(&target) {
                    table.ensure(target);
                }
            }
        }

        if let Some(next) = ops.get(index + 1) {
            let falls = op.opcode.falls_through();
            let block = table.ensure(next.offset);
            block.can_fall_through = falls;
        }
    }

    // Exception-region boundaries are leaders too: handlers must be liftable
    // even when the guarded region only exits by throwing.
    for region in regions {
        for offset in [
            region.try_start,
            region.try_end,
            region.handler_start,
            region.handler_end,
        ] {
            if known_offsets.contains(&offset) {
                table.ensure(offset);
            }
        }
    }

    table
}
