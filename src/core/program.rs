// This module defines the Program: the flat list of dual-graph basic blocks plus the
// per-compile state shared by the whole selection pass. The Program owns the monotonic
// VReg id counter, the wave configuration, and the two derived flags downstream phases
// must honor: needs_wqm (some instruction requires whole-quad mode; the position of the
// first such instruction is recorded for the widening phase) and needs_exact (a discard
// or demote is present, so helper lanes must be masked off before side effects). Blocks
// receive their index at insertion; edge bookkeeping is predecessor-sided until
// finalize_edges converts it into full bidirectional adjacency.

//! The output program and compile-wide state.

use log::debug;
use std::fmt;

use super::block::{Block, BlockKind};
use super::error::{SelectError, SelectResult};
use super::reg::{RegClass, RegFile, VReg};

/// Compile configuration supplied by the caller.
#[derive(Debug, Clone, Copy)]
pub struct WaveConfig {
    /// Number of lanes executing in lockstep.
    pub wave_width: u32,
}

impl WaveConfig {
    pub fn new(wave_width: u32) -> Self {
        debug_assert!(wave_width.is_power_of_two());
        Self { wave_width }
    }
}

/// A whole selected shader function.
pub struct Program {
    pub blocks: Vec<Block>,
    pub wave_width: u32,
    /// Some instruction requires whole-quad mode; a later phase widens the
    /// mask regions. The selector only records the requirement.
    pub needs_wqm: bool,
    /// First (block index, instruction index) requiring whole-quad mode.
    pub first_wqm_use: Option<(u32, u32)>,
    /// A discard/demote is present; helper lanes must be excluded from
    /// side effects.
    pub needs_exact: bool,
    next_vreg: u32,
}

impl Program {
    pub fn new(config: WaveConfig) -> Self {
        Self {
            blocks: Vec::new(),
            wave_width: config.wave_width,
            needs_wqm: false,
            first_wqm_use: None,
            needs_exact: false,
            next_vreg: 0,
        }
    }

    /// Allocate a fresh virtual register of the given class.
    pub fn alloc_vreg(&mut self, class: RegClass) -> VReg {
        let id = self.next_vreg;
        self.next_vreg += 1;
        VReg::new(id, class)
    }

    /// Number of VReg ids allocated so far.
    pub fn vreg_count(&self) -> u32 {
        self.next_vreg
    }

    /// Register class of an execution-mask value for this wave width.
    ///
    /// Lane masks are wave-wide scalars: one bit per lane, so a 64-lane
    /// wave needs two slots.
    pub fn lane_mask_class(&self) -> RegClass {
        RegClass::new(RegFile::Uniform, self.wave_width.div_ceil(32))
    }

    /// Insert a detached block, assigning its index.
    pub fn insert_block(&mut self, mut block: Block) -> u32 {
        let index = self.blocks.len() as u32;
        block.index = index;
        self.blocks.push(block);
        index
    }

    /// Create and insert an empty block of the given kind.
    pub fn create_and_insert_block(&mut self, kind: BlockKind) -> u32 {
        self.insert_block(Block::new(kind))
    }

    pub fn block(&self, index: u32) -> &Block {
        &self.blocks[index as usize]
    }

    pub fn block_mut(&mut self, index: u32) -> &mut Block {
        &mut self.blocks[index as usize]
    }

    /// Record a whole-quad-mode requirement at the given position.
    pub fn record_wqm(&mut self, block: u32, inst_idx: u32) {
        if self.first_wqm_use.is_none() {
            self.first_wqm_use = Some((block, inst_idx));
        }
        self.needs_wqm = true;
    }

    /// Convert predecessor-sided edge records into bidirectional adjacency.
    ///
    /// During traversal edges are only recorded on the successor's pred
    /// lists (merge blocks are built detached, so predecessor indices are
    /// the only stable names). This pass derives every block's successor
    /// lists, preserving predecessor order.
    pub fn finalize_edges(&mut self) -> SelectResult<()> {
        for b in &mut self.blocks {
            b.logical_succs.clear();
            b.linear_succs.clear();
        }
        for index in 0..self.blocks.len() as u32 {
            let logical: Vec<u32> = self.blocks[index as usize].logical_preds.clone();
            let linear: Vec<u32> = self.blocks[index as usize].linear_preds.clone();
            for pred in logical {
                if pred >= self.blocks.len() as u32 {
                    return Err(SelectError::invariant(format!(
                        "BB{index} has logical pred BB{pred} outside the program"
                    )));
                }
                self.blocks[pred as usize].logical_succs.push(index);
            }
            for pred in linear {
                if pred >= self.blocks.len() as u32 {
                    return Err(SelectError::invariant(format!(
                        "BB{index} has linear pred BB{pred} outside the program"
                    )));
                }
                self.blocks[pred as usize].linear_succs.push(index);
            }
        }
        debug!(
            "finalized edges: {} blocks, {} vregs, wqm={} exact={}",
            self.blocks.len(),
            self.next_vreg,
            self.needs_wqm,
            self.needs_exact,
        );
        Ok(())
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "program: wave_width={} needs_wqm={} needs_exact={}",
            self.wave_width, self.needs_wqm, self.needs_exact
        )?;
        for block in &self.blocks {
            write!(f, "{block}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vreg_ids_monotonic() {
        let mut program = Program::new(WaveConfig::new(64));
        let a = program.alloc_vreg(RegClass::new(RegFile::Vector, 1));
        let b = program.alloc_vreg(RegClass::new(RegFile::Uniform, 2));
        assert_eq!(a.id, 0);
        assert_eq!(b.id, 1);
        assert_eq!(program.vreg_count(), 2);
    }

    #[test]
    fn test_lane_mask_class() {
        assert_eq!(Program::new(WaveConfig::new(32)).lane_mask_class().slots, 1);
        assert_eq!(Program::new(WaveConfig::new(64)).lane_mask_class().slots, 2);
    }

    #[test]
    fn test_finalize_edges_builds_succs() {
        let mut program = Program::new(WaveConfig::new(64));
        let a = program.create_and_insert_block(BlockKind::TOP_LEVEL);
        let b = program.create_and_insert_block(BlockKind::default());
        let c = program.create_and_insert_block(BlockKind::MERGE);
        program.block_mut(b).logical_preds.push(a);
        program.block_mut(b).linear_preds.push(a);
        program.block_mut(c).logical_preds.push(a);
        program.block_mut(c).logical_preds.push(b);
        program.block_mut(c).linear_preds.push(b);
        program.finalize_edges().unwrap();
        assert_eq!(program.block(a).logical_succs, vec![b, c]);
        assert_eq!(program.block(a).linear_succs, vec![b]);
        assert_eq!(program.block(b).logical_succs, vec![c]);
        assert_eq!(program.block(b).linear_succs, vec![c]);
        assert!(program.block(c).logical_succs.is_empty());
    }

    #[test]
    fn test_first_wqm_use_sticks() {
        let mut program = Program::new(WaveConfig::new(32));
        program.record_wqm(2, 5);
        program.record_wqm(3, 0);
        assert_eq!(program.first_wqm_use, Some((2, 5)));
        assert!(program.needs_wqm);
    }
}
