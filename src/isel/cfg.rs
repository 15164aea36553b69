// This module implements the control-flow lowering engine: it rebuilds structured
// if/loop constructs into the dual logical/linear basic-block graph, choosing uniform
// or divergent lowering per construct. A uniform if becomes four blocks and a real
// scalar conditional branch. A divergent if becomes seven: both arms run in turn under
// a narrowed execution mask, with linear-only helper blocks funneling into an invert
// block that flips the mask between the arms. Loop breaks and continues lower to direct
// jumps when the wave provably moves as one, and to mask accounting plus guarded helper
// blocks at the loop's continue point otherwise, so a divergent loop only exits once
// every lane has left. The engine also records whole-quad-mode requirements and the
// potentially-empty-exec state that discards and divergent breaks impose.

//! Uniform and divergent control-flow reconstruction.

use log::debug;

use crate::core::{
    Block, BlockKind, Instruction, Opcode, Operand, SelectError, SelectResult, VReg,
};

use super::SelectContext;

/// State of the innermost loop being lowered.
pub struct LoopContext {
    /// Header block index (already inserted; back edges land here).
    pub header: u32,
    /// Exit block, detached until the loop ends; break sites record their
    /// predecessor edges on it.
    pub exit: Block,
    /// Accumulator of lanes that broke out divergently.
    pub break_acc: Option<VReg>,
    /// Accumulator of lanes parked until the continue point.
    pub continue_acc: Option<VReg>,
    pub has_divergent_break: bool,
    pub has_divergent_continue: bool,
}

/// Saved state bracketing one loop; created by [`SelectContext::begin_loop`]
/// and consumed by [`SelectContext::end_loop`].
pub struct LoopFrame {
    saved: Option<LoopContext>,
}

/// Control-flow state threaded through the recursive traversal.
///
/// The three `exec_potentially_empty_*` fields interact and are tracked
/// independently on purpose:
/// - `..._discard` is set by a discard under divergent control flow and
///   only clears at a top-level, non-divergent loop boundary.
/// - `..._break` is set by a divergent break together with
///   `..._break_depth`, the loop depth where it happened; it clears when
///   leaving a loop at or below that depth (the broken lanes have
///   reconverged at that loop's exit).
/// - While either flag is set, break/continue lowering must take the
///   guarded path even for provably uniform conditions.
pub struct ControlFlowInfo {
    pub loop_ctx: Option<LoopContext>,
    /// Current loop nesting depth.
    pub loop_depth: u32,
    /// The nearest enclosing if is divergent.
    pub parent_if_divergent: bool,
    /// The current block already ended in an unconditional jump.
    pub has_branch: bool,
    /// The current logical path ended in a divergent jump.
    pub has_divergent_branch: bool,
    pub exec_potentially_empty_discard: bool,
    pub exec_potentially_empty_break: bool,
    pub exec_potentially_empty_break_depth: u32,
}

impl ControlFlowInfo {
    pub fn new() -> Self {
        Self {
            loop_ctx: None,
            loop_depth: 0,
            parent_if_divergent: false,
            has_branch: false,
            has_divergent_branch: false,
            exec_potentially_empty_discard: false,
            exec_potentially_empty_break: false,
            exec_potentially_empty_break_depth: u32::MAX,
        }
    }
}

impl Default for ControlFlowInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// Saved state bracketing one structured if.
pub struct IfContext {
    bb_if: u32,
    divergent: bool,
    saved_mask: Option<VReg>,
    invert: Option<Block>,
    invert_idx: u32,
    endif: Option<Block>,
    then_had_branch: bool,
    then_divergent_jump: bool,
    saved_parent_if_divergent: bool,
    saved_has_divergent_branch: bool,
}

impl<'a> SelectContext<'a> {
    fn insert_with_preds(
        &mut self,
        kind: BlockKind,
        logical_preds: &[u32],
        linear_preds: &[u32],
    ) -> u32 {
        let mut block = Block::new(kind);
        block.logical_preds.extend_from_slice(logical_preds);
        block.linear_preds.extend_from_slice(linear_preds);
        self.program.insert_block(block)
    }

    fn emit_jump(&mut self) {
        self.emit(Instruction::new(Opcode::Jump, vec![], vec![]));
    }

    // ---- uniform if --------------------------------------------------

    /// Open a uniform if: a real conditional branch on a scalar condition.
    /// Exactly one arm executes; no mask bookkeeping is needed.
    pub fn begin_uniform_if_then(&mut self, cond: VReg) -> IfContext {
        let bb_if = self.current_block();
        self.emit(Instruction::new(
            Opcode::JumpScalarZ,
            vec![Operand::reg(cond)],
            vec![],
        ));
        self.program.block_mut(bb_if).kind.insert(BlockKind::UNIFORM);
        let top = self.program.block(bb_if).kind.masked(BlockKind::TOP_LEVEL);
        let endif = Block::new(top);

        let then_idx = self.insert_with_preds(BlockKind::default(), &[bb_if], &[bb_if]);
        self.set_current(then_idx);
        debug!("uniform if: BB{bb_if}, then BB{then_idx}");

        let ic = IfContext {
            bb_if,
            divergent: false,
            saved_mask: None,
            invert: None,
            invert_idx: 0,
            endif: Some(endif),
            then_had_branch: false,
            then_divergent_jump: false,
            saved_parent_if_divergent: self.cf.parent_if_divergent,
            saved_has_divergent_branch: self.cf.has_divergent_branch,
        };
        self.cf.has_branch = false;
        self.cf.has_divergent_branch = false;
        ic
    }

    pub fn begin_uniform_if_else(&mut self, ic: &mut IfContext) {
        debug_assert!(!ic.divergent);
        let then_blk = self.current_block();
        ic.then_had_branch = self.cf.has_branch;
        ic.then_divergent_jump = self.cf.has_divergent_branch;
        if !self.cf.has_branch {
            self.emit_jump();
            let endif = ic.endif.as_mut().expect("if already closed");
            endif.linear_preds.push(then_blk);
            if !ic.then_divergent_jump {
                endif.logical_preds.push(then_blk);
            }
        }
        self.program
            .block_mut(then_blk)
            .kind
            .insert(BlockKind::UNIFORM);

        let else_idx = self.insert_with_preds(BlockKind::default(), &[ic.bb_if], &[ic.bb_if]);
        self.set_current(else_idx);
        self.cf.has_branch = false;
        self.cf.has_divergent_branch = false;
    }

    pub fn end_uniform_if(&mut self, mut ic: IfContext) {
        debug_assert!(!ic.divergent);
        let else_blk = self.current_block();
        let else_had_branch = self.cf.has_branch;
        let else_divergent_jump = self.cf.has_divergent_branch;
        if !self.cf.has_branch {
            self.emit_jump();
            let endif = ic.endif.as_mut().expect("if already closed");
            endif.linear_preds.push(else_blk);
            if !else_divergent_jump {
                endif.logical_preds.push(else_blk);
            }
        }
        self.program
            .block_mut(else_blk)
            .kind
            .insert(BlockKind::UNIFORM);

        let endif_idx = self.program.insert_block(ic.endif.take().expect("if already closed"));
        self.set_current(endif_idx);
        debug!("uniform if: endif BB{endif_idx}");
        self.cf.has_branch = ic.then_had_branch && else_had_branch;
        self.cf.has_divergent_branch =
            ic.saved_has_divergent_branch || (ic.then_divergent_jump && else_divergent_jump);
    }

    // ---- divergent if ------------------------------------------------

    /// Open a divergent if: narrow the mask to the condition and branch on
    /// mask emptiness. Both arms are reached by every still-active lane in
    /// turn; the invert block flips to the complementary half in between.
    pub fn begin_divergent_if_then(&mut self, cond: VReg) -> SelectResult<IfContext> {
        let bb_if = self.current_block();
        let mask_class = self.program.lane_mask_class();
        if cond.class != mask_class {
            return Err(SelectError::UnsupportedLowering {
                what: "divergent branch condition",
                file: cond.file(),
                bits: cond.bytes() * 8,
                components: 1,
            });
        }
        let saved = self.emit_def(Opcode::SaveExec, vec![Operand::reg(cond)], mask_class);
        self.emit(Instruction::new(Opcode::JumpExecZ, vec![], vec![]));
        self.program.block_mut(bb_if).kind.insert(BlockKind::BRANCH);
        let top = self.program.block(bb_if).kind.masked(BlockKind::TOP_LEVEL);

        let then_idx = self.insert_with_preds(BlockKind::default(), &[bb_if], &[bb_if]);
        self.set_current(then_idx);
        debug!("divergent if: BB{bb_if}, logical then BB{then_idx}");

        let ic = IfContext {
            bb_if,
            divergent: true,
            saved_mask: Some(saved),
            invert: Some(Block::new(BlockKind::INVERT)),
            invert_idx: 0,
            endif: Some(Block::new(BlockKind::MERGE | top)),
            then_had_branch: false,
            then_divergent_jump: false,
            saved_parent_if_divergent: self.cf.parent_if_divergent,
            saved_has_divergent_branch: self.cf.has_divergent_branch,
        };
        self.cf.parent_if_divergent = true;
        self.cf.has_branch = false;
        self.cf.has_divergent_branch = false;
        Ok(ic)
    }

    pub fn begin_divergent_if_else(&mut self, ic: &mut IfContext) {
        debug_assert!(ic.divergent);
        let then_log = self.current_block();
        ic.then_had_branch = self.cf.has_branch;
        ic.then_divergent_jump = self.cf.has_divergent_branch;
        if !self.cf.has_branch {
            self.emit_jump();
            ic.invert
                .as_mut()
                .expect("if already closed")
                .linear_preds
                .push(then_log);
            if !ic.then_divergent_jump {
                ic.endif
                    .as_mut()
                    .expect("if already closed")
                    .logical_preds
                    .push(then_log);
            }
        }
        self.program
            .block_mut(then_log)
            .kind
            .insert(BlockKind::UNIFORM);

        // Linear-only then helper: the skip edge from the branch funnels
        // through here so the invert block has clean predecessors.
        let then_lin = self.insert_with_preds(BlockKind::UNIFORM, &[], &[ic.bb_if]);
        self.set_current(then_lin);
        self.emit_jump();
        ic.invert
            .as_mut()
            .expect("if already closed")
            .linear_preds
            .push(then_lin);

        // Invert block: flip to the else half of the saved mask, skip the
        // arm if no lane wants it.
        let invert_idx = self
            .program
            .insert_block(ic.invert.take().expect("if already closed"));
        ic.invert_idx = invert_idx;
        self.set_current(invert_idx);
        let saved = ic.saved_mask.expect("divergent if without saved mask");
        self.emit(Instruction::new(
            Opcode::InvertExec,
            vec![Operand::reg(saved)],
            vec![],
        ));
        self.emit(Instruction::new(Opcode::JumpExecZ, vec![], vec![]));
        debug!("divergent if: invert BB{invert_idx}");

        let else_idx = self.insert_with_preds(BlockKind::default(), &[ic.bb_if], &[invert_idx]);
        self.set_current(else_idx);
        self.cf.has_branch = false;
        self.cf.has_divergent_branch = false;
    }

    pub fn end_divergent_if(&mut self, mut ic: IfContext) {
        debug_assert!(ic.divergent);
        let else_log = self.current_block();
        let else_divergent_jump = self.cf.has_divergent_branch;
        if !self.cf.has_branch {
            self.emit_jump();
            let endif = ic.endif.as_mut().expect("if already closed");
            endif.linear_preds.push(else_log);
            if !else_divergent_jump {
                endif.logical_preds.push(else_log);
            }
        }
        self.program
            .block_mut(else_log)
            .kind
            .insert(BlockKind::UNIFORM);

        let else_lin = self.insert_with_preds(BlockKind::UNIFORM, &[], &[ic.invert_idx]);
        self.set_current(else_lin);
        self.emit_jump();
        ic.endif
            .as_mut()
            .expect("if already closed")
            .linear_preds
            .push(else_lin);

        let endif_idx = self
            .program
            .insert_block(ic.endif.take().expect("if already closed"));
        self.set_current(endif_idx);
        let saved = ic.saved_mask.expect("divergent if without saved mask");
        self.emit(Instruction::new(
            Opcode::RestoreExec,
            vec![Operand::reg(saved)],
            vec![],
        ));
        debug!("divergent if: endif BB{endif_idx}");

        self.cf.parent_if_divergent = ic.saved_parent_if_divergent;
        self.cf.has_branch = false;
        self.cf.has_divergent_branch =
            ic.saved_has_divergent_branch || (ic.then_divergent_jump && else_divergent_jump);
    }

    // ---- loops -------------------------------------------------------

    /// Open a loop: the current block becomes the preheader, the header is
    /// created and entered. The exit block stays detached until
    /// [`end_loop`](Self::end_loop); break sites record edges on it.
    pub fn begin_loop(&mut self) -> LoopFrame {
        let preheader = self.current_block();
        self.program
            .block_mut(preheader)
            .kind
            .insert(BlockKind::LOOP_PREHEADER | BlockKind::UNIFORM);
        self.emit_jump();
        let header = self.insert_with_preds(BlockKind::LOOP_HEADER, &[preheader], &[preheader]);
        self.set_current(header);

        let top = if self.cf.loop_depth == 0 {
            BlockKind::TOP_LEVEL
        } else {
            BlockKind::default()
        };
        let lc = LoopContext {
            header,
            exit: Block::new(BlockKind::LOOP_EXIT | top),
            break_acc: None,
            continue_acc: None,
            has_divergent_break: false,
            has_divergent_continue: false,
        };
        self.cf.loop_depth += 1;
        debug!("loop: header BB{header}, depth {}", self.cf.loop_depth);
        LoopFrame {
            saved: self.cf.loop_ctx.replace(lc),
        }
    }

    /// Close a loop. On the natural path the current block becomes the
    /// latch: a direct back edge when the whole wave provably iterates
    /// together, otherwise a mask-emptiness test selecting between a
    /// continue helper (back to the header) and a break helper (to the
    /// exit), so the loop only exits once every lane has left.
    pub fn end_loop(&mut self, frame: LoopFrame) -> SelectResult<()> {
        if !self.cf.has_branch {
            let latch = self.current_block();
            let (header, guarded, break_acc, continue_acc) = {
                let lc = self
                    .cf
                    .loop_ctx
                    .as_ref()
                    .ok_or_else(|| SelectError::invariant("end_loop outside a loop"))?;
                (
                    lc.header,
                    lc.has_divergent_break
                        || lc.has_divergent_continue
                        || self.cf.exec_potentially_empty_discard
                        || self.cf.exec_potentially_empty_break,
                    lc.break_acc,
                    lc.continue_acc,
                )
            };
            if guarded {
                // Un-park lanes waiting at the continue point, then test
                // whether any lane still wants another iteration.
                if let Some(acc) = continue_acc {
                    self.emit(Instruction::new(
                        Opcode::RestoreExec,
                        vec![Operand::reg(acc)],
                        vec![],
                    ));
                }
                self.emit(Instruction::new(Opcode::JumpExecZ, vec![], vec![]));
                self.program.block_mut(latch).kind.insert(BlockKind::BRANCH);
                self.program.block_mut(header).logical_preds.push(latch);

                let cont = self.insert_with_preds(
                    BlockKind::CONTINUE | BlockKind::UNIFORM,
                    &[],
                    &[latch],
                );
                self.set_current(cont);
                self.emit_jump();
                self.program.block_mut(header).linear_preds.push(cont);

                let brk =
                    self.insert_with_preds(BlockKind::BREAK | BlockKind::UNIFORM, &[], &[latch]);
                self.set_current(brk);
                if let Some(acc) = break_acc {
                    self.emit(Instruction::new(
                        Opcode::RestoreExec,
                        vec![Operand::reg(acc)],
                        vec![],
                    ));
                }
                self.emit_jump();
                self.cf
                    .loop_ctx
                    .as_mut()
                    .expect("loop context vanished")
                    .exit
                    .linear_preds
                    .push(brk);
                debug!("loop: guarded latch BB{latch}, continue BB{cont}, break BB{brk}");
            } else {
                self.program
                    .block_mut(latch)
                    .kind
                    .insert(BlockKind::CONTINUE | BlockKind::UNIFORM);
                self.emit_jump();
                self.program.block_mut(header).logical_preds.push(latch);
                self.program.block_mut(header).linear_preds.push(latch);
                debug!("loop: direct back edge BB{latch} -> BB{header}");
            }
        } else {
            // The body ended in an unconditional jump; the exit block
            // starts a fresh path.
            self.cf.has_branch = false;
        }

        let lc = self
            .cf
            .loop_ctx
            .take()
            .ok_or_else(|| SelectError::invariant("end_loop outside a loop"))?;
        let exit_idx = self.program.insert_block(lc.exit);
        self.set_current(exit_idx);
        self.cf.loop_ctx = frame.saved;
        self.cf.loop_depth -= 1;

        if self.cf.exec_potentially_empty_break
            && self.cf.exec_potentially_empty_break_depth > self.cf.loop_depth
        {
            // The lanes that broke have reconverged at this exit.
            self.cf.exec_potentially_empty_break = false;
            self.cf.exec_potentially_empty_break_depth = u32::MAX;
        }
        if self.cf.loop_depth == 0 && !self.cf.parent_if_divergent {
            self.cf.exec_potentially_empty_discard = false;
        }
        debug!("loop: exit BB{exit_idx}, depth {}", self.cf.loop_depth);
        Ok(())
    }

    // ---- jumps and discard -------------------------------------------

    /// Lower a `break`: a direct jump to the loop exit when the whole wave
    /// provably leaves together, otherwise mask accounting that the latch
    /// resolves.
    pub fn emit_break(&mut self) -> SelectResult<()> {
        let block = self.current_block();
        let lc = self
            .cf
            .loop_ctx
            .as_mut()
            .ok_or_else(|| SelectError::invariant("break outside a loop"))?;
        lc.exit.logical_preds.push(block);
        let direct = !self.cf.parent_if_divergent
            && !lc.has_divergent_continue
            && !self.cf.exec_potentially_empty_discard
            && !self.cf.exec_potentially_empty_break;
        if direct {
            lc.exit.linear_preds.push(block);
            self.program
                .block_mut(block)
                .kind
                .insert(BlockKind::BREAK | BlockKind::UNIFORM);
            self.emit_jump();
            self.cf.has_branch = true;
            debug!("uniform break in BB{block}");
        } else {
            let acc_in = lc.break_acc.map(Operand::reg).unwrap_or_else(Operand::undef);
            let mask_class = self.program.lane_mask_class();
            let acc = self.emit_def(Opcode::MaskBreak, vec![acc_in], mask_class);
            let lc = self.cf.loop_ctx.as_mut().expect("loop context vanished");
            lc.break_acc = Some(acc);
            lc.has_divergent_break = true;
            self.program.block_mut(block).kind.insert(BlockKind::BREAK);
            self.cf.has_divergent_branch = true;
            self.cf.exec_potentially_empty_break = true;
            self.cf.exec_potentially_empty_break_depth = self
                .cf
                .exec_potentially_empty_break_depth
                .min(self.cf.loop_depth);
            debug!("divergent break in BB{block}");
        }
        Ok(())
    }

    /// Lower a `continue`: a direct jump to the loop header when uniform,
    /// otherwise the lanes are parked until the continue point.
    pub fn emit_continue(&mut self) -> SelectResult<()> {
        let block = self.current_block();
        let lc = self
            .cf
            .loop_ctx
            .as_mut()
            .ok_or_else(|| SelectError::invariant("continue outside a loop"))?;
        let header = lc.header;
        let direct = !self.cf.parent_if_divergent
            && !lc.has_divergent_continue
            && !self.cf.exec_potentially_empty_discard
            && !self.cf.exec_potentially_empty_break;
        if direct {
            self.program
                .block_mut(block)
                .kind
                .insert(BlockKind::CONTINUE | BlockKind::UNIFORM);
            self.emit_jump();
            self.program.block_mut(header).logical_preds.push(block);
            self.program.block_mut(header).linear_preds.push(block);
            self.cf.has_branch = true;
            debug!("uniform continue in BB{block}");
        } else {
            let acc_in = lc
                .continue_acc
                .map(Operand::reg)
                .unwrap_or_else(Operand::undef);
            let mask_class = self.program.lane_mask_class();
            let acc = self.emit_def(Opcode::MaskContinue, vec![acc_in], mask_class);
            let lc = self.cf.loop_ctx.as_mut().expect("loop context vanished");
            lc.continue_acc = Some(acc);
            lc.has_divergent_continue = true;
            self.program
                .block_mut(block)
                .kind
                .insert(BlockKind::CONTINUE);
            self.program.block_mut(header).logical_preds.push(block);
            self.cf.has_divergent_branch = true;
            debug!("divergent continue in BB{block}");
        }
        Ok(())
    }

    /// Lower a discard/demote: lanes leave the mask without branching.
    pub fn emit_discard(&mut self, cond: Option<VReg>) {
        let op = cond.map(Operand::reg).unwrap_or_else(Operand::undef);
        self.emit(Instruction::new(Opcode::Discard, vec![op], vec![]));
        let block = self.current_block();
        self.program
            .block_mut(block)
            .kind
            .insert(BlockKind::USES_DISCARD);
        self.program.needs_exact = true;
        if self.cf.parent_if_divergent || self.cf.loop_depth > 0 {
            self.cf.exec_potentially_empty_discard = true;
        }
        debug!("discard in BB{block}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BlockKind, WaveConfig};
    use crate::ir::FuncBuilder;

    fn empty_src() -> crate::ir::SourceFunction {
        FuncBuilder::new("t").finish()
    }

    fn context(src: &crate::ir::SourceFunction) -> SelectContext<'_> {
        let mut ctx = SelectContext::new(src, WaveConfig::new(64));
        let start = ctx.program.create_and_insert_block(BlockKind::TOP_LEVEL);
        ctx.set_current(start);
        ctx
    }

    #[test]
    fn test_uniform_if_produces_four_blocks() {
        let src = empty_src();
        let mut ctx = context(&src);
        let cond = ctx.alloc(crate::core::RegClass::new(crate::core::RegFile::Uniform, 1));
        let mut ic = ctx.begin_uniform_if_then(cond);
        ctx.begin_uniform_if_else(&mut ic);
        ctx.end_uniform_if(ic);
        ctx.program.finalize_edges().unwrap();
        assert_eq!(ctx.program.blocks.len(), 4);
        let endif = ctx.program.block(3);
        assert_eq!(endif.logical_preds.len(), 2);
        assert_eq!(endif.linear_preds.len(), 2);
        assert!(!ctx
            .program
            .blocks
            .iter()
            .any(|b| b.kind.contains(BlockKind::INVERT)));
    }

    #[test]
    fn test_divergent_if_produces_seven_blocks() {
        let src = empty_src();
        let mut ctx = context(&src);
        let cond = ctx.alloc(ctx.program.lane_mask_class());
        let mut ic = ctx.begin_divergent_if_then(cond).unwrap();
        ctx.begin_divergent_if_else(&mut ic);
        ctx.end_divergent_if(ic);
        ctx.program.finalize_edges().unwrap();
        assert_eq!(ctx.program.blocks.len(), 7);
        let invert = ctx
            .program
            .blocks
            .iter()
            .find(|b| b.kind.contains(BlockKind::INVERT))
            .expect("invert block");
        assert_eq!(invert.linear_preds.len(), 2);
        assert_eq!(invert.linear_succs.len(), 2);
        assert!(invert.logical_preds.is_empty());
        let endif = ctx.program.blocks.last().unwrap();
        assert!(endif.kind.contains(BlockKind::MERGE));
        assert_eq!(endif.logical_preds.len(), 2);
        assert_eq!(endif.linear_preds.len(), 2);
    }

    #[test]
    fn test_empty_exec_flags_reset_at_loop_boundary() {
        let src = empty_src();
        let mut ctx = context(&src);
        let frame = ctx.begin_loop();
        ctx.emit_discard(None);
        assert!(ctx.cf.exec_potentially_empty_discard);
        ctx.end_loop(frame).unwrap();
        assert!(!ctx.cf.exec_potentially_empty_discard);
        assert!(!ctx.cf.exec_potentially_empty_break);
    }

    #[test]
    fn test_discard_forces_guarded_break() {
        let src = empty_src();
        let mut ctx = context(&src);
        let frame = ctx.begin_loop();
        ctx.emit_discard(None);
        ctx.emit_break().unwrap();
        // A uniform-looking break under potentially-empty exec must not
        // branch directly.
        assert!(!ctx.cf.has_branch);
        assert!(ctx.cf.exec_potentially_empty_break);
        ctx.end_loop(frame).unwrap();
        let kinds: Vec<_> = ctx.program.blocks.iter().map(|b| b.kind).collect();
        assert!(kinds
            .iter()
            .any(|k| k.contains(BlockKind::BREAK | BlockKind::UNIFORM)));
    }
}
