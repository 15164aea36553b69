// This module drives whole-function selection: a depth-first traversal of the
// structured source tree that dispatches straight-line instructions to the leaf
// emission glue (generic ALU, phis, memory, derivatives, discard, export) and nested
// if/loop constructs to the control-flow engine, skipping code made unreachable by an
// unconditional jump. Once traversal completes, the predecessor-sided edge records are
// finalized into full bidirectional adjacency and the Program is handed off, together
// with the needs_wqm/needs_exact flags, to register allocation and scheduling.

//! Top-level traversal and leaf emission glue.

use log::debug;

use crate::core::inst::Def;
use crate::core::{
    BlockKind, Instruction, Opcode, Operand, Program, RegFile, SelectError, SelectResult,
    WaveConfig,
};
use crate::ir::{AluOp, CfNode, DerivAxis, SourceFunction, SrcInst, ValueId};

use super::memory::{LoadRequest, StoreRequest};
use super::SelectContext;

/// Lower one source function into a flat dual-graph program.
pub fn select_function(src: &SourceFunction, config: WaveConfig) -> SelectResult<Program> {
    debug!("selecting function {}", src.name);
    let mut ctx = SelectContext::new(src, config);
    let start = ctx.program.create_and_insert_block(BlockKind::TOP_LEVEL);
    ctx.set_current(start);
    ctx.visit_cf_list(&src.body)?;
    ctx.program.finalize_edges()?;
    Ok(ctx.program)
}

fn alu_opcode(op: AluOp) -> (Opcode, usize) {
    match op {
        AluOp::Mov => (Opcode::Mov, 1),
        AluOp::IAdd => (Opcode::IAdd, 2),
        AluOp::ISub => (Opcode::ISub, 2),
        AluOp::IMul => (Opcode::IMul, 2),
        AluOp::IAnd => (Opcode::IAnd, 2),
        AluOp::IOr => (Opcode::IOr, 2),
        AluOp::IXor => (Opcode::IXor, 2),
        AluOp::Shl => (Opcode::Shl, 2),
        AluOp::Shr => (Opcode::Shr, 2),
        AluOp::FAdd => (Opcode::FAdd, 2),
        AluOp::FMul => (Opcode::FMul, 2),
        AluOp::Select => (Opcode::Select, 3),
    }
}

impl<'a> SelectContext<'a> {
    /// Visit one structured control-flow list.
    pub fn visit_cf_list(&mut self, nodes: &[CfNode]) -> SelectResult<()> {
        for node in nodes {
            if self.cf.has_branch {
                // Everything after an unconditional jump is unreachable.
                break;
            }
            match node {
                CfNode::Block(insts) => self.visit_block(insts)?,
                CfNode::If {
                    cond,
                    then_cf,
                    else_cf,
                } => self.visit_if(*cond, then_cf, else_cf)?,
                CfNode::Loop { body } => self.visit_loop(body)?,
            }
        }
        Ok(())
    }

    fn visit_block(&mut self, insts: &[SrcInst]) -> SelectResult<()> {
        for inst in insts {
            if self.cf.has_branch {
                break;
            }
            self.visit_inst(inst)?;
        }
        Ok(())
    }

    fn visit_if(
        &mut self,
        cond: ValueId,
        then_cf: &[CfNode],
        else_cf: &[CfNode],
    ) -> SelectResult<()> {
        let divergent = self.src.value_info(cond).divergent;
        let cond_reg = self.resolve(cond)?;
        if divergent {
            let mut ic = self.begin_divergent_if_then(cond_reg)?;
            self.visit_cf_list(then_cf)?;
            self.begin_divergent_if_else(&mut ic);
            self.visit_cf_list(else_cf)?;
            self.end_divergent_if(ic);
        } else {
            let mut ic = self.begin_uniform_if_then(cond_reg);
            self.visit_cf_list(then_cf)?;
            self.begin_uniform_if_else(&mut ic);
            self.visit_cf_list(else_cf)?;
            self.end_uniform_if(ic);
        }
        Ok(())
    }

    fn visit_loop(&mut self, body: &[CfNode]) -> SelectResult<()> {
        let frame = self.begin_loop();
        self.visit_cf_list(body)?;
        self.end_loop(frame)
    }

    fn visit_inst(&mut self, inst: &SrcInst) -> SelectResult<()> {
        match inst {
            SrcInst::Const { dst, value } => {
                let dst = self.resolve(*dst)?;
                self.emit(Instruction::new(
                    Opcode::Mov,
                    vec![Operand::constant(*value)],
                    vec![Def::new(dst)],
                ));
                Ok(())
            }
            SrcInst::Alu { op, dst, srcs } => self.visit_alu(*op, *dst, srcs),
            SrcInst::Phi { dst, srcs } => self.visit_phi(*dst, srcs),
            SrcInst::Load { dst, space, addr, access } => {
                self.visit_load(*dst, *space, *addr, access)
            }
            SrcInst::Store {
                space,
                addr,
                value,
                access,
            } => self.visit_store(*space, *addr, *value, access),
            SrcInst::Deriv { dst, src, axis } => self.visit_deriv(*dst, *src, *axis),
            SrcInst::Discard { cond } => {
                let cond = cond.map(|c| self.resolve(c)).transpose()?;
                self.emit_discard(cond);
                Ok(())
            }
            SrcInst::Break => self.emit_break(),
            SrcInst::Continue => self.emit_continue(),
            SrcInst::Export { srcs } => self.visit_export(srcs),
        }
    }

    fn visit_alu(&mut self, op: AluOp, dst: ValueId, srcs: &[ValueId]) -> SelectResult<()> {
        let (opcode, arity) = alu_opcode(op);
        if srcs.len() != arity {
            return Err(SelectError::invariant(format!(
                "{op:?} with {} sources",
                srcs.len()
            )));
        }
        let dst = self.resolve(dst)?;
        let mut operands = Vec::with_capacity(srcs.len());
        for &s in srcs {
            operands.push(Operand::reg(self.resolve(s)?));
        }
        self.emit(Instruction::new(opcode, operands, vec![Def::new(dst)]));
        Ok(())
    }

    fn visit_phi(&mut self, dst: ValueId, srcs: &[ValueId]) -> SelectResult<()> {
        let dst_reg = self.resolve(dst)?;
        let block = self.program.block(self.current_block());
        let kind = block.kind;
        // Uniform-file values cannot be merged along the logical graph when
        // the arms were mask-selected; they merge over the linear graph.
        let opcode = if kind.contains(BlockKind::MERGE) && dst_reg.file() == RegFile::Uniform {
            Opcode::LinearPhi
        } else {
            Opcode::Phi
        };
        if !kind.contains(BlockKind::LOOP_HEADER) {
            // Back edges are still pending at loop headers; everywhere else
            // the predecessor list is complete and must match.
            let expected = match opcode {
                Opcode::LinearPhi => block.linear_preds.len(),
                _ => block.logical_preds.len(),
            };
            if srcs.len() != expected {
                return Err(SelectError::invariant(format!(
                    "phi with {} sources at BB{} with {expected} predecessors",
                    srcs.len(),
                    self.current_block()
                )));
            }
        }
        let mut operands = Vec::with_capacity(srcs.len());
        for &s in srcs {
            operands.push(Operand::reg(self.resolve(s)?));
        }
        self.emit(Instruction::new(opcode, operands, vec![Def::new(dst_reg)]));
        Ok(())
    }

    fn visit_load(
        &mut self,
        dst: ValueId,
        space: crate::core::MemSpace,
        addr: ValueId,
        access: &crate::ir::AccessInfo,
    ) -> SelectResult<()> {
        let info = *self.src.value_info(dst);
        let dst_class = self.value_class(&info)?;
        if info.bit_size < 8 {
            return Err(SelectError::UnsupportedLowering {
                what: "sub-byte memory access",
                file: dst_class.file,
                bits: info.bit_size,
                components: info.num_components,
            });
        }
        let addr_reg = self.resolve(addr)?;
        let req = LoadRequest {
            space,
            addr: addr_reg,
            dst_file: dst_class.file,
            num_components: info.num_components,
            component_bytes: info.bit_size / 8,
            align_mul: access.align_mul,
            align_offset: access.align_offset,
            const_offset: access.const_offset,
            coherent: access.coherent,
            nontemporal: access.nontemporal,
        };
        let comps = self.emit_load(&req)?;
        let result = if comps.len() == 1 {
            comps[0]
        } else {
            let whole = self.emit_def(
                Opcode::CreateVector,
                comps.iter().copied().map(Operand::reg).collect(),
                dst_class,
            );
            self.record_components(whole, &comps);
            whole
        };
        self.define_result(dst, result)
    }

    fn visit_store(
        &mut self,
        space: crate::core::MemSpace,
        addr: ValueId,
        value: ValueId,
        access: &crate::ir::AccessInfo,
    ) -> SelectResult<()> {
        let info = *self.src.value_info(value);
        if info.bit_size < 8 {
            return Err(SelectError::UnsupportedLowering {
                what: "sub-byte memory access",
                file: RegFile::Vector,
                bits: info.bit_size,
                components: info.num_components,
            });
        }
        let addr_reg = self.resolve(addr)?;
        let value_reg = self.resolve(value)?;
        let req = StoreRequest {
            space,
            addr: addr_reg,
            value: value_reg,
            num_components: info.num_components,
            component_bytes: info.bit_size / 8,
            align_mul: access.align_mul,
            align_offset: access.align_offset,
            const_offset: access.const_offset,
            coherent: access.coherent,
            nontemporal: access.nontemporal,
        };
        self.emit_store(&req)
    }

    fn visit_deriv(&mut self, dst: ValueId, src: ValueId, axis: DerivAxis) -> SelectResult<()> {
        let dst_reg = self.resolve(dst)?;
        let src_reg = self.resolve(src)?;
        let opcode = match axis {
            DerivAxis::X => Opcode::DerivX,
            DerivAxis::Y => Opcode::DerivY,
        };
        let (block, idx) = self.emit(Instruction::new(
            opcode,
            vec![Operand::reg(src_reg)],
            vec![Def::new(dst_reg)],
        ));
        if opcode.needs_wqm() {
            // The widening itself is a later phase; only the requirement
            // is recorded here.
            self.program.record_wqm(block, idx);
        }
        Ok(())
    }

    fn visit_export(&mut self, srcs: &[ValueId]) -> SelectResult<()> {
        if srcs.is_empty() {
            return Err(SelectError::invariant("export with no sources"));
        }
        let mut operands = Vec::with_capacity(srcs.len());
        for &s in srcs {
            operands.push(Operand::reg(self.resolve(s)?).late_kill());
        }
        self.emit(Instruction::new(Opcode::Export, operands, vec![]));
        let block = self.current_block();
        self.program
            .block_mut(block)
            .kind
            .insert(BlockKind::EXPORT_END);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::FuncBuilder;

    #[test]
    fn test_straight_line_function() {
        let mut b = FuncBuilder::new("line");
        let x = b.uniform_value(32, 1);
        let y = b.uniform_value(32, 1);
        let z = b.uniform_value(32, 1);
        b.const_val(x, 1);
        b.const_val(y, 2);
        b.alu(AluOp::IAdd, z, vec![x, y]);
        b.push(SrcInst::Export { srcs: vec![z] });
        let src = b.finish();
        let program = select_function(&src, WaveConfig::new(64)).unwrap();
        assert_eq!(program.blocks.len(), 1);
        assert_eq!(program.blocks[0].instructions.len(), 4);
        assert!(program.blocks[0].kind.contains(BlockKind::EXPORT_END));
        assert!(!program.needs_wqm);
        assert!(!program.needs_exact);
    }

    #[test]
    fn test_derivative_records_wqm_position() {
        let mut b = FuncBuilder::new("wqm");
        let x = b.divergent_value(32, 1);
        let d = b.divergent_value(32, 1);
        b.const_val(x, 0);
        b.push(SrcInst::Deriv {
            dst: d,
            src: x,
            axis: DerivAxis::X,
        });
        let src = b.finish();
        let program = select_function(&src, WaveConfig::new(32)).unwrap();
        assert!(program.needs_wqm);
        assert_eq!(program.first_wqm_use, Some((0, 1)));
    }

    #[test]
    fn test_code_after_uniform_break_is_dropped() {
        let mut b = FuncBuilder::new("dead");
        let x = b.uniform_value(32, 1);
        b.begin_loop();
        b.push(SrcInst::Break);
        b.const_val(x, 9);
        b.end_loop();
        let src = b.finish();
        let program = select_function(&src, WaveConfig::new(64)).unwrap();
        // The constant after the break must not have been emitted.
        let emitted: usize = program
            .blocks
            .iter()
            .flat_map(|blk| blk.instructions.iter())
            .filter(|i| matches!(i.opcode, Opcode::Mov))
            .count();
        assert_eq!(emitted, 0);
    }
}
