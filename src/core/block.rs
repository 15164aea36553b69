// This module defines the dual-graph basic block produced by the selector. Every block
// carries two independent edge sets: logical predecessors/successors mirror the
// structured source nesting and are what value-flow analyses (phi placement, dominance)
// traverse, while linear predecessors/successors describe the true machine branch graph
// including the divergence-lowering helper blocks that exist only to keep the mask
// bookkeeping free of critical edges. Blocks are created detached, accumulate
// predecessor records while under construction, and receive their index when inserted
// into the Program; successor lists are derived from the predecessor records during
// edge finalization. BlockKind is a bitset of structural roles consumed by later phases.

//! Basic blocks with logical and linear edge sets.

use std::fmt;

use super::inst::Instruction;

/// Bitset of structural block roles.
///
/// Stored as a plain mask so later phases can test combinations cheaply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockKind(u16);

impl BlockKind {
    /// Boundary block of top-level (depth zero) control flow.
    pub const TOP_LEVEL: BlockKind = BlockKind(1 << 0);
    /// Loop entry edge block, immediately before the header.
    pub const LOOP_PREHEADER: BlockKind = BlockKind(1 << 1);
    /// Loop header, target of the back edge.
    pub const LOOP_HEADER: BlockKind = BlockKind(1 << 2);
    /// Loop exit merge block.
    pub const LOOP_EXIT: BlockKind = BlockKind(1 << 3);
    /// Block ending in a conditional branch opening a divergent region.
    pub const BRANCH: BlockKind = BlockKind(1 << 4);
    /// Mask-flip block between the arms of a divergent if.
    pub const INVERT: BlockKind = BlockKind(1 << 5);
    /// Reconvergence block of a divergent region.
    pub const MERGE: BlockKind = BlockKind(1 << 6);
    /// All lanes agree on the branch leaving this block.
    pub const UNIFORM: BlockKind = BlockKind(1 << 7);
    /// Block transferring control to a loop header.
    pub const CONTINUE: BlockKind = BlockKind(1 << 8);
    /// Block transferring control to a loop exit.
    pub const BREAK: BlockKind = BlockKind(1 << 9);
    /// Block containing a discard/demote.
    pub const USES_DISCARD: BlockKind = BlockKind(1 << 10);
    /// Terminal block performing the shader's export.
    pub const EXPORT_END: BlockKind = BlockKind(1 << 11);

    pub fn insert(&mut self, kind: BlockKind) {
        self.0 |= kind.0;
    }

    pub fn contains(&self, kind: BlockKind) -> bool {
        self.0 & kind.0 == kind.0
    }

    pub fn intersects(&self, kind: BlockKind) -> bool {
        self.0 & kind.0 != 0
    }

    /// The subset of roles shared with `other`.
    pub fn masked(&self, other: BlockKind) -> BlockKind {
        BlockKind(self.0 & other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for BlockKind {
    type Output = BlockKind;
    fn bitor(self, rhs: BlockKind) -> BlockKind {
        BlockKind(self.0 | rhs.0)
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(BlockKind, &str); 12] = [
            (BlockKind::TOP_LEVEL, "top_level"),
            (BlockKind::LOOP_PREHEADER, "loop_preheader"),
            (BlockKind::LOOP_HEADER, "loop_header"),
            (BlockKind::LOOP_EXIT, "loop_exit"),
            (BlockKind::BRANCH, "branch"),
            (BlockKind::INVERT, "invert"),
            (BlockKind::MERGE, "merge"),
            (BlockKind::UNIFORM, "uniform"),
            (BlockKind::CONTINUE, "continue"),
            (BlockKind::BREAK, "break"),
            (BlockKind::USES_DISCARD, "uses_discard"),
            (BlockKind::EXPORT_END, "export_end"),
        ];
        let mut first = true;
        for (kind, name) in NAMES {
            if self.contains(kind) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        if first {
            write!(f, "-")?;
        }
        Ok(())
    }
}

/// A basic block of the output program.
///
/// `index` is assigned when the block is inserted into the [`Program`] and
/// never changes; blocks are appended in creation order and never deleted.
/// While a block is still detached (a merge block whose predecessors are
/// being built), edges are recorded on the predecessor side only; the
/// successor lists stay empty until [`Program::finalize_edges`] runs.
///
/// [`Program`]: super::program::Program
/// [`Program::finalize_edges`]: super::program::Program::finalize_edges
#[derive(Debug, Default)]
pub struct Block {
    pub index: u32,
    pub kind: BlockKind,
    pub instructions: Vec<Instruction>,
    pub logical_preds: Vec<u32>,
    pub linear_preds: Vec<u32>,
    pub logical_succs: Vec<u32>,
    pub linear_succs: Vec<u32>,
}

impl Block {
    pub fn new(kind: BlockKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "BB{} [{}] logical preds {:?} linear preds {:?}",
            self.index, self.kind, self.logical_preds, self.linear_preds
        )?;
        for inst in &self.instructions {
            writeln!(f, "    {inst}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_bitset() {
        let mut kind = BlockKind::default();
        assert!(kind.is_empty());
        kind.insert(BlockKind::LOOP_HEADER);
        kind.insert(BlockKind::UNIFORM);
        assert!(kind.contains(BlockKind::LOOP_HEADER));
        assert!(!kind.contains(BlockKind::MERGE));
        assert!(kind.intersects(BlockKind::UNIFORM | BlockKind::BREAK));
        assert!(!kind.contains(BlockKind::UNIFORM | BlockKind::BREAK));
    }

    #[test]
    fn test_kind_masked() {
        let kind = BlockKind::TOP_LEVEL | BlockKind::MERGE;
        assert_eq!(kind.masked(BlockKind::TOP_LEVEL), BlockKind::TOP_LEVEL);
        assert!(kind.masked(BlockKind::BREAK).is_empty());
    }

    #[test]
    fn test_kind_display() {
        let kind = BlockKind::LOOP_HEADER | BlockKind::UNIFORM;
        assert_eq!(kind.to_string(), "loop_header|uniform");
    }
}
