// This module defines the structured source IR the selector consumes: an SSA program
// whose control constructs (if, loop) are explicit tree nodes rather than flattened
// branches, with every value annotated by an external divergence analysis. A
// SourceFunction owns the value table (bit width, component count, divergence verdict
// per SSA value) and a control-flow tree of CfNodes; leaf blocks hold instruction lists.
// Break/continue are leaf instructions whose uniformity is decided by the enclosing
// nesting, not by an operand. The module also provides FuncBuilder, a small convenience
// layer used by the test suite to construct structured programs tersely.

//! Structured, divergence-annotated source IR.
//!
//! This is the selector's input contract. The front end has already run
//! SSA construction and divergence analysis; the selector only reads the
//! verdicts. Control flow arrives as a tree: a function body is a list of
//! [`CfNode`]s, each either a straight-line block of instructions or a
//! nested `if`/`loop` construct.

use std::fmt;

use crate::core::MemSpace;

/// Dense id of a source SSA value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueId(pub u32);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Externally supplied facts about one SSA value.
#[derive(Debug, Clone, Copy)]
pub struct ValueInfo {
    /// Bit width of one component (8, 16, 32 or 64).
    pub bit_size: u32,
    /// Number of vector components.
    pub num_components: u32,
    /// Divergence verdict: false means provably identical across the wave.
    pub divergent: bool,
}

impl ValueInfo {
    /// Total size of the value in bytes.
    pub fn bytes(&self) -> u32 {
        self.bit_size / 8 * self.num_components
    }
}

/// Arithmetic/logical operation tags.
///
/// The full per-opcode pattern dispatch lives outside this crate; these
/// tags are the minimal surface the driver needs for leaf emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Mov,
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
}

/// Derivative axis for quad-granular operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerivAxis {
    X,
    Y,
}

/// Alignment and caching facts of one memory access.
#[derive(Debug, Clone, Copy)]
pub struct AccessInfo {
    /// The base address is a multiple of this (power of two).
    pub align_mul: u32,
    /// Known byte offset of the address from that multiple.
    pub align_offset: u32,
    /// Constant byte offset added to the address.
    pub const_offset: u32,
    pub coherent: bool,
    pub nontemporal: bool,
}

impl AccessInfo {
    pub fn aligned(align_mul: u32) -> Self {
        Self {
            align_mul,
            align_offset: 0,
            const_offset: 0,
            coherent: false,
            nontemporal: false,
        }
    }

    pub fn with_const_offset(mut self, offset: u32) -> Self {
        self.const_offset = offset;
        self
    }

    pub fn with_align_offset(mut self, offset: u32) -> Self {
        self.align_offset = offset;
        self
    }
}

/// One source instruction.
#[derive(Debug, Clone)]
pub enum SrcInst {
    Const {
        dst: ValueId,
        value: u64,
    },
    Alu {
        op: AluOp,
        dst: ValueId,
        srcs: Vec<ValueId>,
    },
    /// SSA merge; must lead the first block after a join point. Sources
    /// are ordered to match the join's logical predecessors.
    Phi {
        dst: ValueId,
        srcs: Vec<ValueId>,
    },
    Load {
        dst: ValueId,
        space: MemSpace,
        addr: ValueId,
        access: AccessInfo,
    },
    Store {
        space: MemSpace,
        addr: ValueId,
        value: ValueId,
        access: AccessInfo,
    },
    /// Quad-granular derivative; requires whole-quad mode.
    Deriv {
        dst: ValueId,
        src: ValueId,
        axis: DerivAxis,
    },
    /// Remove lanes from the wave without branching. `cond == None`
    /// discards every currently active lane.
    Discard {
        cond: Option<ValueId>,
    },
    /// Leave the innermost loop. Uniformity is a property of the
    /// enclosing nesting, decided during lowering.
    Break,
    /// Jump to the innermost loop's next iteration.
    Continue,
    /// Terminal export of the shader's results.
    Export {
        srcs: Vec<ValueId>,
    },
}

/// One node of the structured control-flow tree.
#[derive(Debug, Clone)]
pub enum CfNode {
    /// Straight-line instruction list.
    Block(Vec<SrcInst>),
    If {
        cond: ValueId,
        then_cf: Vec<CfNode>,
        else_cf: Vec<CfNode>,
    },
    Loop {
        body: Vec<CfNode>,
    },
}

/// A whole source function: value table plus control-flow tree.
#[derive(Debug, Clone)]
pub struct SourceFunction {
    pub name: String,
    pub values: Vec<ValueInfo>,
    pub body: Vec<CfNode>,
}

impl SourceFunction {
    pub fn value_info(&self, id: ValueId) -> &ValueInfo {
        &self.values[id.0 as usize]
    }
}

/// Convenience builder for structured source functions.
///
/// Keeps a stack of open constructs so tests read like the shader they
/// describe:
///
/// ```
/// use wavesel::ir::FuncBuilder;
///
/// let mut b = FuncBuilder::new("simple");
/// let c = b.uniform_value(32, 1);
/// b.const_val(c, 1);
/// b.begin_if(c);
/// b.end_if();
/// let f = b.finish();
/// assert_eq!(f.name, "simple");
/// ```
pub struct FuncBuilder {
    name: String,
    values: Vec<ValueInfo>,
    frames: Vec<Frame>,
}

enum Frame {
    Body(Vec<CfNode>),
    Then {
        cond: ValueId,
        then_cf: Vec<CfNode>,
    },
    Else {
        cond: ValueId,
        then_cf: Vec<CfNode>,
        else_cf: Vec<CfNode>,
    },
    Loop(Vec<CfNode>),
}

impl Frame {
    fn nodes(&mut self) -> &mut Vec<CfNode> {
        match self {
            Frame::Body(nodes) | Frame::Loop(nodes) => nodes,
            Frame::Then { then_cf, .. } => then_cf,
            Frame::Else { else_cf, .. } => else_cf,
        }
    }
}

impl FuncBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: Vec::new(),
            frames: vec![Frame::Body(Vec::new())],
        }
    }

    /// Declare a new SSA value.
    pub fn value(&mut self, bit_size: u32, num_components: u32, divergent: bool) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(ValueInfo {
            bit_size,
            num_components,
            divergent,
        });
        id
    }

    pub fn uniform_value(&mut self, bit_size: u32, num_components: u32) -> ValueId {
        self.value(bit_size, num_components, false)
    }

    pub fn divergent_value(&mut self, bit_size: u32, num_components: u32) -> ValueId {
        self.value(bit_size, num_components, true)
    }

    /// Append an instruction to the innermost open construct.
    pub fn push(&mut self, inst: SrcInst) {
        let nodes = self
            .frames
            .last_mut()
            .expect("builder has no open frame")
            .nodes();
        match nodes.last_mut() {
            Some(CfNode::Block(insts)) => insts.push(inst),
            _ => nodes.push(CfNode::Block(vec![inst])),
        }
    }

    pub fn const_val(&mut self, dst: ValueId, value: u64) {
        self.push(SrcInst::Const { dst, value });
    }

    pub fn alu(&mut self, op: AluOp, dst: ValueId, srcs: Vec<ValueId>) {
        self.push(SrcInst::Alu { op, dst, srcs });
    }

    pub fn phi(&mut self, dst: ValueId, srcs: Vec<ValueId>) {
        self.push(SrcInst::Phi { dst, srcs });
    }

    pub fn begin_if(&mut self, cond: ValueId) {
        self.frames.push(Frame::Then {
            cond,
            then_cf: Vec::new(),
        });
    }

    pub fn begin_else(&mut self) {
        let frame = self.frames.pop().expect("begin_else without begin_if");
        match frame {
            Frame::Then { cond, then_cf } => self.frames.push(Frame::Else {
                cond,
                then_cf,
                else_cf: Vec::new(),
            }),
            _ => panic!("begin_else without begin_if"),
        }
    }

    pub fn end_if(&mut self) {
        let frame = self.frames.pop().expect("end_if without begin_if");
        let node = match frame {
            Frame::Then { cond, then_cf } => CfNode::If {
                cond,
                then_cf,
                else_cf: Vec::new(),
            },
            Frame::Else {
                cond,
                then_cf,
                else_cf,
            } => CfNode::If {
                cond,
                then_cf,
                else_cf,
            },
            _ => panic!("end_if without begin_if"),
        };
        self.frames
            .last_mut()
            .expect("builder has no open frame")
            .nodes()
            .push(node);
    }

    pub fn begin_loop(&mut self) {
        self.frames.push(Frame::Loop(Vec::new()));
    }

    pub fn end_loop(&mut self) {
        let frame = self.frames.pop().expect("end_loop without begin_loop");
        let node = match frame {
            Frame::Loop(body) => CfNode::Loop { body },
            _ => panic!("end_loop without begin_loop"),
        };
        self.frames
            .last_mut()
            .expect("builder has no open frame")
            .nodes()
            .push(node);
    }

    pub fn finish(mut self) -> SourceFunction {
        assert_eq!(self.frames.len(), 1, "unclosed control-flow construct");
        let body = match self.frames.pop() {
            Some(Frame::Body(nodes)) => nodes,
            _ => unreachable!(),
        };
        SourceFunction {
            name: self.name,
            values: self.values,
            body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_nests_constructs() {
        let mut b = FuncBuilder::new("nest");
        let c = b.uniform_value(1, 1);
        let x = b.uniform_value(32, 1);
        b.const_val(x, 3);
        b.begin_loop();
        b.begin_if(c);
        b.push(SrcInst::Break);
        b.end_if();
        b.end_loop();
        let f = b.finish();
        assert_eq!(f.body.len(), 2);
        match &f.body[1] {
            CfNode::Loop { body } => match &body[0] {
                CfNode::If { then_cf, else_cf, .. } => {
                    assert_eq!(then_cf.len(), 1);
                    assert!(else_cf.is_empty());
                }
                _ => panic!("expected if inside loop"),
            },
            _ => panic!("expected loop"),
        }
    }

    #[test]
    fn test_push_extends_trailing_block() {
        let mut b = FuncBuilder::new("blocks");
        let x = b.uniform_value(32, 1);
        let y = b.uniform_value(32, 1);
        b.const_val(x, 1);
        b.const_val(y, 2);
        let f = b.finish();
        assert_eq!(f.body.len(), 1);
        match &f.body[0] {
            CfNode::Block(insts) => assert_eq!(insts.len(), 2),
            _ => panic!("expected block"),
        }
    }

    #[test]
    #[should_panic(expected = "unclosed control-flow construct")]
    fn test_unclosed_construct_panics() {
        let mut b = FuncBuilder::new("bad");
        b.begin_loop();
        let _ = b.finish();
    }
}
