//! Control-flow graph over a lifted method body
//!
//! Nodes are the lifter's basic blocks, identified by leader offset; edges
//! come from branch targets and fall-through. This is the unit cached per
//! reachable method and the structure the intraprocedural points-to
//! analysis iterates over.

use std::collections::BTreeSet;

use indexmap::IndexMap;

use crate::common::errors::LiftWarning;
use crate::common::types::MethodRef;
use crate::core::lifter::LiftedMethod;
use crate::core::tac::{BlockStatus, MethodBody, TacInstr};

/// One CFG node: a basic block's instruction range plus its edges.
#[derive(Debug, Clone, PartialEq)]
pub struct CfgBlock {
    /// Leader offset
    pub offset: u32,
    /// Start index into the flattened instruction list
    pub start: usize,
    /// End index (exclusive)
    pub end: usize,
    /// Successor leader offsets
    pub successors: BTreeSet<u32>,
    /// Predecessor leader offsets
    pub predecessors: BTreeSet<u32>,
}

/// Control-flow graph owning the lifted body it describes.
#[derive(Debug, Clone)]
pub struct ControlFlowGraph {
    /// Lifted body in offset order
    pub body: MethodBody,
    /// Blocks keyed by leader offset, in ascending order
    pub blocks: IndexMap<u32, CfgBlock>,
    /// Entry block offset
    pub entry: u32,
    /// Blocks ending in a return
    pub exits: Vec<u32>,
    /// Diagnostics carried over from lifting
    pub warnings: Vec<LiftWarning>,
}

impl ControlFlowGraph {
    /// Build the graph from a lifted method, consuming it.
    pub fn build(lifted: LiftedMethod) -> Self {
        let LiftedMethod {
            body,
            blocks: table,
            warnings,
            ..
        } = lifted;

        // Instruction ranges follow the flattening order: processed blocks
        // by ascending leader offset.
        let mut blocks: IndexMap<u32, CfgBlock> = IndexMap::new();
        let mut cursor = 0usize;
        for block in table.iter_sorted() {
            if block.status != BlockStatus::Processed {
                continue;
            }
            let start = cursor;
            cursor += block.instrs.len();
            blocks.insert(
                block.offset,
                CfgBlock {
                    offset: block.offset,
                    start,
                    end: cursor,
                    successors: BTreeSet::new(),
                    predecessors: BTreeSet::new(),
                },
            );
        }

        let offsets: Vec<u32> = blocks.keys().copied().collect();
        let entry = offsets.first().copied().unwrap_or(0);

        // Successors: every explicit target in the block, plus fall-through
        // when the final instruction lets control continue.
        let mut edges: Vec<(u32, u32)> = Vec::new();
        let mut exits = Vec::new();
        for (position, &offset) in offsets.iter().enumerate() {
            let block = &blocks[&offset];
            let instrs = &body.instrs[block.start..block.end];
            for instr in instrs {
                for target in instr.branch_targets() {
                    if blocks.contains_key(&target) {
                        edges.push((offset, target));
                    }
                }
            }
            let falls = instrs.last().map_or(true, |last| !last.ends_flow());
            if falls {
                if let Some(&next) = offsets.get(position + 1) {
                    edges.push((offset, next));
                }
            }
            if matches!(instrs.last(), Some(TacInstr::Return { .. })) {
                exits.push(offset);
            }
        }
        for (from, to) in edges {
            blocks[&from].successors.insert(to);
            blocks[&to].predecessors.insert(from);
        }

        Self {
            body,
            blocks,
            entry,
            exits,
            warnings,
        }
    }

    /// Method this graph describes.
    pub fn method(&self) -> &MethodRef {
        &self.body.method
    }

    /// Instructions of the block led by `offset`.
    pub fn block_instrs(&self, offset: u32) -> &[TacInstr] {
        match self.blocks.get(&offset) {
            Some(block) => &self.body.instrs[block.start..block.end],
            None => &[],
        }
    }

    /// Leader offsets in ascending order.
    pub fn block_offsets(&self) -> impl Iterator<Item = u32> + '_ {
        self.blocks.keys().copied()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}
