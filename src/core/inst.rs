// This module defines the machine instruction model produced by the selector. An
// Instruction is an opcode tag plus a list of Operands (uses), a list of Defs
// (definitions) and an opcode-family payload; memory instructions carry a MemoryInfo
// describing the address space and ordering/caching metadata. Operands reference a VReg,
// an inline constant, or undef, and carry the modifiers later phases need: an optional
// fixed physical-location hint, a late-kill flag (the value must stay live through the
// whole instruction), and a sub-slot byte selector for narrow reads out of a wider
// register. Operand and definition counts are validated against the opcode's format on
// construction.

//! Machine instructions, operands and definitions.

use std::fmt;

use super::reg::{PhysReg, VReg};

/// Backend memory space an access targets.
///
/// Each space has its own capability descriptor (supported access sizes,
/// alignment rules, offset encoding window) consulted by the memory-access
/// emitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemSpace {
    /// Raw global memory addressed by per-lane pointers.
    Global,
    /// Structured/raw buffer accesses through a resource descriptor.
    Buffer,
    /// Per-lane scratch (spill/stack) memory.
    Scratch,
    /// Workgroup-shared memory.
    Shared,
}

/// Ordering and caching metadata carried by memory instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub space: MemSpace,
    /// Constant byte offset encoded directly in the instruction.
    pub const_offset: u32,
    /// Bypass non-coherent caches (device-scope visibility).
    pub coherent: bool,
    /// Streaming access, do not pollute the cache.
    pub nontemporal: bool,
}

impl MemoryInfo {
    pub fn new(space: MemSpace) -> Self {
        Self {
            space,
            const_offset: 0,
            coherent: false,
            nontemporal: false,
        }
    }

    pub fn at_offset(space: MemSpace, const_offset: u32) -> Self {
        Self {
            const_offset,
            ..Self::new(space)
        }
    }
}

/// Opcode-family-specific payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstPayload {
    None,
    Memory(MemoryInfo),
}

/// What an operand refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    Reg(VReg),
    Const(u64),
    Undef,
}

/// A use of a value by an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operand {
    pub kind: OperandKind,
    /// Request that the allocator place this use at a fixed location.
    pub fixed: Option<PhysReg>,
    /// The value must remain live through the whole instruction even if
    /// this is its last use (the hardware reads it late).
    pub late_kill: bool,
    /// Byte selector into the source register for sub-slot reads.
    pub sub_slot: u8,
}

impl Operand {
    pub fn reg(vreg: VReg) -> Self {
        Self {
            kind: OperandKind::Reg(vreg),
            fixed: None,
            late_kill: false,
            sub_slot: 0,
        }
    }

    pub fn constant(value: u64) -> Self {
        Self {
            kind: OperandKind::Const(value),
            fixed: None,
            late_kill: false,
            sub_slot: 0,
        }
    }

    pub fn undef() -> Self {
        Self {
            kind: OperandKind::Undef,
            fixed: None,
            late_kill: false,
            sub_slot: 0,
        }
    }

    pub fn fixed(mut self, reg: PhysReg) -> Self {
        self.fixed = Some(reg);
        self
    }

    pub fn late_kill(mut self) -> Self {
        self.late_kill = true;
        self
    }

    pub fn sub_slot(mut self, byte: u8) -> Self {
        self.sub_slot = byte;
        self
    }

    /// The referenced VReg, if any.
    pub fn as_reg(&self) -> Option<VReg> {
        match self.kind {
            OperandKind::Reg(v) => Some(v),
            _ => None,
        }
    }

    /// The inline constant, if any.
    pub fn as_const(&self) -> Option<u64> {
        match self.kind {
            OperandKind::Const(c) => Some(c),
            _ => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            OperandKind::Reg(v) => write!(f, "{v}")?,
            OperandKind::Const(c) => write!(f, "#{c}")?,
            OperandKind::Undef => write!(f, "undef")?,
        }
        if let Some(r) = self.fixed {
            write!(f, "@{r}")?;
        }
        Ok(())
    }
}

/// A value defined by an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Def {
    pub vreg: VReg,
    /// Require the allocator to place this definition at a fixed location.
    pub fixed: Option<PhysReg>,
}

impl Def {
    pub fn new(vreg: VReg) -> Self {
        Self { vreg, fixed: None }
    }

    pub fn fixed(vreg: VReg, reg: PhysReg) -> Self {
        Self {
            vreg,
            fixed: Some(reg),
        }
    }
}

impl fmt::Display for Def {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.vreg)?;
        if let Some(r) = self.fixed {
            write!(f, "@{r}")?;
        }
        Ok(())
    }
}

/// Expected operand or definition count for an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
}

impl Arity {
    fn accepts(&self, n: usize) -> bool {
        match *self {
            Arity::Exact(k) => n == k,
            Arity::AtLeast(k) => n >= k,
        }
    }
}

/// Machine opcodes emitted by the selector.
///
/// Encoding is a later phase's concern; these tags carry exactly the
/// structure the selector and the allocator need. Branch targets are not
/// operands: they are implied by the owning block's linear successor list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // Value plumbing.
    Mov,
    /// Merge values over the logical predecessors of a merge block.
    Phi,
    /// Merge values over the linear predecessors; used for uniform-file
    /// values whose merge is mask-driven.
    LinearPhi,
    /// Cut a register group into equal-sized pieces.
    SplitVector,
    /// Concatenate registers into a contiguous group.
    CreateVector,
    /// Extract one component of a register group: operands are the group
    /// and a constant component index.
    ExtractComponent,

    // Generic ALU (leaf dispatch keeps the interesting per-op tables
    // elsewhere; these tags are enough to drive selection end to end).
    IAdd,
    ISub,
    IMul,
    IAnd,
    IOr,
    IXor,
    Shl,
    Shr,
    FAdd,
    FMul,
    Select,

    // Memory.
    Load,
    Store,

    // Lane-mask manipulation. The execution mask is implicit hardware
    // state; these opcodes emit its bookkeeping, they never execute it.
    /// Save the current mask and narrow it to the condition:
    /// def = old mask, operand = condition mask.
    SaveExec,
    /// Flip to the complementary half of a saved mask (then-arm done,
    /// else-arm starts): operand = saved mask.
    InvertExec,
    /// Restore a saved mask at a merge point: operand = saved mask.
    RestoreExec,
    /// Retire the active lanes from the loop mask into a break
    /// accumulator: operand = old accumulator, def = new accumulator.
    MaskBreak,
    /// Park the active lanes until the loop's continue point:
    /// operand = old accumulator, def = new accumulator.
    MaskContinue,
    /// Remove lanes from the mask without branching:
    /// operand = condition mask (undef = all active lanes).
    Discard,

    // Quad-granular operations; these require whole-quad mode.
    DerivX,
    DerivY,

    // Branches. Targets are not operands; they come from the block's
    // linear successors, in order [fallthrough, taken].
    Jump,
    /// Branch if a uniform scalar condition is zero.
    JumpScalarZ,
    /// Branch if the execution mask is empty.
    JumpExecZ,

    /// Final value export of the shader.
    Export,
}

impl Opcode {
    /// Operand and definition counts this opcode requires.
    pub fn arity(&self) -> (Arity, Arity) {
        use Arity::*;
        use Opcode::*;
        match self {
            Mov => (Exact(1), Exact(1)),
            Phi | LinearPhi => (AtLeast(1), Exact(1)),
            SplitVector => (Exact(1), AtLeast(2)),
            CreateVector => (AtLeast(1), Exact(1)),
            ExtractComponent => (Exact(2), Exact(1)),
            IAdd | ISub | IMul | IAnd | IOr | IXor | Shl | Shr | FAdd | FMul => {
                (Exact(2), Exact(1))
            }
            Select => (Exact(3), Exact(1)),
            Load => (Exact(1), Exact(1)),
            Store => (Exact(2), Exact(0)),
            SaveExec => (Exact(1), Exact(1)),
            InvertExec | RestoreExec => (Exact(1), Exact(0)),
            MaskBreak | MaskContinue => (Exact(1), Exact(1)),
            Discard => (Exact(1), Exact(0)),
            DerivX | DerivY => (Exact(1), Exact(1)),
            Jump | JumpExecZ => (Exact(0), Exact(0)),
            JumpScalarZ => (Exact(1), Exact(0)),
            Export => (AtLeast(1), Exact(0)),
        }
    }

    /// Whether this opcode terminates a block.
    pub fn is_branch(&self) -> bool {
        matches!(self, Opcode::Jump | Opcode::JumpScalarZ | Opcode::JumpExecZ)
    }

    /// Whether the whole 2x2 quad must be active when this executes.
    pub fn needs_wqm(&self) -> bool {
        matches!(self, Opcode::DerivX | Opcode::DerivY)
    }
}

/// One machine instruction.
#[derive(Debug, Clone)]
pub struct Instruction {
    pub opcode: Opcode,
    pub operands: Vec<Operand>,
    pub defs: Vec<Def>,
    pub payload: InstPayload,
}

impl Instruction {
    /// Create an instruction, validating counts against the opcode format.
    pub fn new(opcode: Opcode, operands: Vec<Operand>, defs: Vec<Def>) -> Self {
        let (ops, dfs) = opcode.arity();
        assert!(
            ops.accepts(operands.len()),
            "{opcode:?}: bad operand count {}",
            operands.len()
        );
        assert!(
            dfs.accepts(defs.len()),
            "{opcode:?}: bad def count {}",
            defs.len()
        );
        Self {
            opcode,
            operands,
            defs,
            payload: InstPayload::None,
        }
    }

    /// Create a memory instruction carrying its access metadata.
    pub fn memory(
        opcode: Opcode,
        operands: Vec<Operand>,
        defs: Vec<Def>,
        info: MemoryInfo,
    ) -> Self {
        let mut inst = Self::new(opcode, operands, defs);
        inst.payload = InstPayload::Memory(info);
        inst
    }

    /// Memory metadata, if this is a memory instruction.
    pub fn memory_info(&self) -> Option<&MemoryInfo> {
        match &self.payload {
            InstPayload::Memory(info) => Some(info),
            InstPayload::None => None,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, d) in self.defs.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        if !self.defs.is_empty() {
            write!(f, " = ")?;
        }
        write!(f, "{:?}", self.opcode)?;
        for (i, op) in self.operands.iter().enumerate() {
            write!(f, "{} {op}", if i == 0 { "" } else { "," })?;
        }
        if let Some(info) = self.memory_info() {
            write!(f, " [{:?}+{}]", info.space, info.const_offset)?;
            if info.coherent {
                write!(f, " coherent")?;
            }
            if info.nontemporal {
                write!(f, " nontemporal")?;
            }
        }
        Ok(())
    }
}
