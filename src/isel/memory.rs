// This module implements the generic memory-access emitter: it turns one logical
// "load/store N components of S bytes" request into a concrete instruction sequence,
// parameterized by a per-space capability descriptor (supported access sizes, byte-
// unaligned support, narrow-element support, constant-offset encoding window). The emit
// loop always selects the largest supported size that fits the remaining bytes and the
// current alignment; when byte misalignment has no hardware support the access is
// rounded up to an aligned window and the extra leading bytes are shifted off after the
// load. Constant offsets beyond the encoding window are folded into the address
// register, never dropped. The union of useful bytes across emitted accesses equals the
// requested byte count exactly, with no overlap and no gap (soft internal assertion).

//! Capability-driven lowering of logical memory accesses.

use log::trace;

use crate::core::inst::Def;
use crate::core::{
    Instruction, MemSpace, MemoryInfo, Opcode, Operand, RegClass, RegFile, SelectError,
    SelectResult, VReg, SLOT_BYTES,
};

use super::SelectContext;

/// What one backend memory space can do.
#[derive(Debug, Clone, Copy)]
pub struct MemCapabilities {
    /// Access sizes in bytes the space supports, ascending.
    pub supported_sizes: &'static [u32],
    /// Accesses may start at any byte address.
    pub byte_unaligned: bool,
    /// 1- and 2-byte accesses exist (otherwise the space is slot-granular).
    pub narrow_elements: bool,
    /// Largest constant offset encodable in the instruction.
    pub max_const_offset: u32,
    /// Register file loaded pieces land in before promotion.
    pub result_file: RegFile,
}

impl MemCapabilities {
    fn supports(&self, size: u32) -> bool {
        self.supported_sizes.contains(&size)
    }

    /// Whether an access of `size` bytes is legal at `align`-byte alignment.
    ///
    /// Without byte-unaligned support, narrow accesses need natural
    /// alignment (and narrow-element support), wider ones at least
    /// 2-byte alignment.
    fn alignment_ok(&self, align: u32, size: u32) -> bool {
        if self.byte_unaligned {
            return true;
        }
        if size <= 2 {
            self.narrow_elements && align >= size
        } else {
            align >= 2
        }
    }

    /// Smallest supported size of at least `min` bytes.
    fn smallest_from(&self, min: u32) -> Option<u32> {
        self.supported_sizes.iter().copied().find(|&s| s >= min)
    }
}

pub const GLOBAL_CAPS: MemCapabilities = MemCapabilities {
    supported_sizes: &[1, 2, 4, 8, 12, 16],
    byte_unaligned: false,
    narrow_elements: true,
    max_const_offset: 4095,
    result_file: RegFile::Vector,
};

pub const BUFFER_CAPS: MemCapabilities = MemCapabilities {
    supported_sizes: &[1, 2, 4, 8, 12, 16],
    byte_unaligned: true,
    narrow_elements: true,
    max_const_offset: 4095,
    result_file: RegFile::Vector,
};

pub const SCRATCH_CAPS: MemCapabilities = MemCapabilities {
    supported_sizes: &[4, 8, 12, 16],
    byte_unaligned: false,
    narrow_elements: false,
    max_const_offset: 2047,
    result_file: RegFile::Vector,
};

pub const SHARED_CAPS: MemCapabilities = MemCapabilities {
    supported_sizes: &[1, 2, 4, 8, 16],
    byte_unaligned: false,
    narrow_elements: true,
    max_const_offset: 65535,
    result_file: RegFile::Vector,
};

/// Per-space emission strategy.
///
/// The capability descriptor drives chunk selection; the chunk hooks emit
/// the actual access instruction with whatever metadata the space needs.
pub trait MemPolicy {
    fn capabilities(&self) -> &'static MemCapabilities;

    fn emit_load_chunk(
        &self,
        ctx: &mut SelectContext,
        addr: VReg,
        dst: VReg,
        const_offset: u32,
        coherent: bool,
        nontemporal: bool,
    );

    fn emit_store_chunk(
        &self,
        ctx: &mut SelectContext,
        addr: VReg,
        data: VReg,
        const_offset: u32,
        coherent: bool,
        nontemporal: bool,
    );
}

pub struct GlobalPolicy;
pub struct BufferPolicy;
pub struct ScratchPolicy;
pub struct SharedPolicy;

impl MemPolicy for GlobalPolicy {
    fn capabilities(&self) -> &'static MemCapabilities {
        &GLOBAL_CAPS
    }

    fn emit_load_chunk(
        &self,
        ctx: &mut SelectContext,
        addr: VReg,
        dst: VReg,
        const_offset: u32,
        coherent: bool,
        nontemporal: bool,
    ) {
        let mut info = MemoryInfo::at_offset(MemSpace::Global, const_offset);
        info.coherent = coherent;
        info.nontemporal = nontemporal;
        ctx.emit(Instruction::memory(
            Opcode::Load,
            vec![Operand::reg(addr)],
            vec![Def::new(dst)],
            info,
        ));
    }

    fn emit_store_chunk(
        &self,
        ctx: &mut SelectContext,
        addr: VReg,
        data: VReg,
        const_offset: u32,
        coherent: bool,
        nontemporal: bool,
    ) {
        let mut info = MemoryInfo::at_offset(MemSpace::Global, const_offset);
        info.coherent = coherent;
        info.nontemporal = nontemporal;
        ctx.emit(Instruction::memory(
            Opcode::Store,
            vec![Operand::reg(addr), Operand::reg(data).late_kill()],
            vec![],
            info,
        ));
    }
}

impl MemPolicy for BufferPolicy {
    fn capabilities(&self) -> &'static MemCapabilities {
        &BUFFER_CAPS
    }

    fn emit_load_chunk(
        &self,
        ctx: &mut SelectContext,
        addr: VReg,
        dst: VReg,
        const_offset: u32,
        coherent: bool,
        nontemporal: bool,
    ) {
        let mut info = MemoryInfo::at_offset(MemSpace::Buffer, const_offset);
        info.coherent = coherent;
        info.nontemporal = nontemporal;
        // The descriptor half of the address is read after the data phase
        // starts; keep it live through the instruction.
        ctx.emit(Instruction::memory(
            Opcode::Load,
            vec![Operand::reg(addr).late_kill()],
            vec![Def::new(dst)],
            info,
        ));
    }

    fn emit_store_chunk(
        &self,
        ctx: &mut SelectContext,
        addr: VReg,
        data: VReg,
        const_offset: u32,
        coherent: bool,
        nontemporal: bool,
    ) {
        let mut info = MemoryInfo::at_offset(MemSpace::Buffer, const_offset);
        info.coherent = coherent;
        info.nontemporal = nontemporal;
        ctx.emit(Instruction::memory(
            Opcode::Store,
            vec![
                Operand::reg(addr).late_kill(),
                Operand::reg(data).late_kill(),
            ],
            vec![],
            info,
        ));
    }
}

impl MemPolicy for ScratchPolicy {
    fn capabilities(&self) -> &'static MemCapabilities {
        &SCRATCH_CAPS
    }

    fn emit_load_chunk(
        &self,
        ctx: &mut SelectContext,
        addr: VReg,
        dst: VReg,
        const_offset: u32,
        _coherent: bool,
        nontemporal: bool,
    ) {
        // Scratch is per-lane private; coherence is meaningless there.
        let mut info = MemoryInfo::at_offset(MemSpace::Scratch, const_offset);
        info.nontemporal = nontemporal;
        ctx.emit(Instruction::memory(
            Opcode::Load,
            vec![Operand::reg(addr)],
            vec![Def::new(dst)],
            info,
        ));
    }

    fn emit_store_chunk(
        &self,
        ctx: &mut SelectContext,
        addr: VReg,
        data: VReg,
        const_offset: u32,
        _coherent: bool,
        nontemporal: bool,
    ) {
        let mut info = MemoryInfo::at_offset(MemSpace::Scratch, const_offset);
        info.nontemporal = nontemporal;
        ctx.emit(Instruction::memory(
            Opcode::Store,
            vec![Operand::reg(addr), Operand::reg(data).late_kill()],
            vec![],
            info,
        ));
    }
}

impl MemPolicy for SharedPolicy {
    fn capabilities(&self) -> &'static MemCapabilities {
        &SHARED_CAPS
    }

    fn emit_load_chunk(
        &self,
        ctx: &mut SelectContext,
        addr: VReg,
        dst: VReg,
        const_offset: u32,
        _coherent: bool,
        _nontemporal: bool,
    ) {
        ctx.emit(Instruction::memory(
            Opcode::Load,
            vec![Operand::reg(addr)],
            vec![Def::new(dst)],
            MemoryInfo::at_offset(MemSpace::Shared, const_offset),
        ));
    }

    fn emit_store_chunk(
        &self,
        ctx: &mut SelectContext,
        addr: VReg,
        data: VReg,
        const_offset: u32,
        _coherent: bool,
        _nontemporal: bool,
    ) {
        ctx.emit(Instruction::memory(
            Opcode::Store,
            vec![Operand::reg(addr), Operand::reg(data).late_kill()],
            vec![],
            MemoryInfo::at_offset(MemSpace::Shared, const_offset),
        ));
    }
}

/// Strategy lookup by memory space.
pub fn policy_for(space: MemSpace) -> &'static dyn MemPolicy {
    match space {
        MemSpace::Global => &GlobalPolicy,
        MemSpace::Buffer => &BufferPolicy,
        MemSpace::Scratch => &ScratchPolicy,
        MemSpace::Shared => &SharedPolicy,
    }
}

pub fn capabilities_for(space: MemSpace) -> &'static MemCapabilities {
    policy_for(space).capabilities()
}

/// One logical load request.
#[derive(Debug, Clone, Copy)]
pub struct LoadRequest {
    pub space: MemSpace,
    pub addr: VReg,
    /// Register file of the final result values.
    pub dst_file: RegFile,
    pub num_components: u32,
    pub component_bytes: u32,
    /// The base address is a multiple of this (power of two).
    pub align_mul: u32,
    /// Known byte offset of the base from that multiple.
    pub align_offset: u32,
    pub const_offset: u32,
    pub coherent: bool,
    pub nontemporal: bool,
}

/// One logical store request.
#[derive(Debug, Clone, Copy)]
pub struct StoreRequest {
    pub space: MemSpace,
    pub addr: VReg,
    pub value: VReg,
    pub num_components: u32,
    pub component_bytes: u32,
    pub align_mul: u32,
    pub align_offset: u32,
    pub const_offset: u32,
    pub coherent: bool,
    pub nontemporal: bool,
}

/// One emitted access and the bytes of it we actually want.
struct Piece {
    reg: VReg,
    bytes: u32,
}

/// Byte alignment at `pos` bytes past a `(align_mul, 0)`-aligned base.
fn current_align(align_mul: u32, pos: u32) -> u32 {
    debug_assert!(align_mul.is_power_of_two());
    let off = pos % align_mul;
    if off == 0 {
        align_mul
    } else {
        1 << off.trailing_zeros()
    }
}

/// Whether a chunk of `size` keeps component boundaries recombinable:
/// chunks either cover whole components or evenly divide one.
fn component_fit(size: u32, component_bytes: u32, pos_in_comp: u32) -> bool {
    if pos_in_comp != 0 {
        let left = component_bytes - pos_in_comp;
        size <= left && left % size == 0
    } else if size >= component_bytes {
        size % component_bytes == 0
    } else {
        component_bytes % size == 0
    }
}

/// Largest supported chunk for the current position, if any fits.
fn pick_size(
    caps: &MemCapabilities,
    remaining: u32,
    align: u32,
    component_bytes: u32,
    pos_in_comp: u32,
) -> Option<u32> {
    caps.supported_sizes
        .iter()
        .rev()
        .copied()
        .find(|&s| {
            s <= remaining
                && caps.alignment_ok(align, s)
                && component_fit(s, component_bytes, pos_in_comp)
        })
}

/// Clamp the useful byte count of an over-fetched piece to something the
/// recombiner can represent and component boundaries allow.
fn trim_useful(useful: u32, remaining: u32, component_bytes: u32, pos_in_comp: u32) -> u32 {
    let mut u = useful.min(remaining);
    if pos_in_comp != 0 {
        u = u.min(component_bytes - pos_in_comp);
    } else if u >= component_bytes {
        u -= u % component_bytes;
    }
    if u >= 4 {
        u - u % 4
    } else if u == 3 {
        2
    } else {
        u
    }
}

impl<'a> SelectContext<'a> {
    /// addr + delta, as a fresh register of the same class.
    fn emit_addr_add(&mut self, addr: VReg, delta: i64) -> VReg {
        self.emit_def(
            Opcode::IAdd,
            vec![Operand::reg(addr), Operand::constant(delta as u64)],
            addr.class,
        )
    }

    /// Fold a constant offset the space cannot encode into the address.
    fn fold_const_offset(
        &mut self,
        addr: VReg,
        const_offset: u32,
        total: u32,
        caps: &MemCapabilities,
    ) -> (VReg, u32) {
        if const_offset.saturating_add(total - 1) <= caps.max_const_offset {
            return (addr, const_offset);
        }
        let window = caps.max_const_offset + 1;
        let mut keep = const_offset % window;
        if keep.saturating_add(total - 1) > caps.max_const_offset {
            keep = 0;
        }
        let fold = const_offset - keep;
        trace!("folding const offset {fold} into address, keeping {keep}");
        (self.emit_addr_add(addr, fold as i64), keep)
    }

    /// Load one chunk the straightforward way.
    #[allow(clippy::too_many_arguments)]
    fn load_direct_chunk(
        &mut self,
        policy: &dyn MemPolicy,
        addr: VReg,
        enc_offset: u32,
        size: u32,
        dst_file: RegFile,
        coherent: bool,
        nontemporal: bool,
    ) -> VReg {
        let caps = policy.capabilities();
        let file = if dst_file == RegFile::Uniform && size % SLOT_BYTES == 0 {
            // Whole-slot pieces of a uniform destination go straight to
            // the uniform file.
            RegFile::Uniform
        } else {
            caps.result_file
        };
        let (addr, enc_offset) = if enc_offset > caps.max_const_offset {
            (self.emit_addr_add(addr, enc_offset as i64), 0)
        } else {
            (addr, enc_offset)
        };
        let dst = self.alloc(RegClass::for_bytes(file, size));
        policy.emit_load_chunk(self, addr, dst, enc_offset, coherent, nontemporal);
        trace!("load chunk {size}B @+{enc_offset} -> {dst}");
        dst
    }

    /// Round a misaligned chunk up to an aligned window and shift the
    /// leading extras off. Returns the shifted piece and its useful bytes.
    #[allow(clippy::too_many_arguments)]
    fn load_rounded_chunk(
        &mut self,
        policy: &dyn MemPolicy,
        addr: VReg,
        enc_offset: u32,
        pos: u32,
        align_mul: u32,
        remaining: u32,
        component_bytes: u32,
        pos_in_comp: u32,
        coherent: bool,
        nontemporal: bool,
    ) -> SelectResult<(VReg, u32)> {
        let caps = policy.capabilities();
        let window = caps.smallest_from(SLOT_BYTES).ok_or_else(|| {
            SelectError::UnsupportedLowering {
                what: "memory space without slot-sized access",
                file: caps.result_file,
                bits: remaining * 8,
                components: 1,
            }
        })?;
        let file = caps.result_file;
        let loaded_class = RegClass::for_bytes(file, window);
        if align_mul >= SLOT_BYTES {
            // Sub-slot position is statically known; shift by a constant.
            let skip = pos % SLOT_BYTES;
            let delta = enc_offset as i64 - skip as i64;
            let (addr, enc) = if delta >= 0 && delta as u32 <= caps.max_const_offset {
                (addr, delta as u32)
            } else {
                (self.emit_addr_add(addr, delta), 0)
            };
            let loaded = self.alloc(loaded_class);
            policy.emit_load_chunk(self, addr, loaded, enc, coherent, nontemporal);
            let useful = trim_useful(window - skip, remaining, component_bytes, pos_in_comp);
            let piece = if skip == 0 && useful == window {
                loaded
            } else if skip == 0 {
                // Aligned over-fetch of a narrow tail: keep the low bytes.
                self.emit_def(
                    Opcode::Mov,
                    vec![Operand::reg(loaded)],
                    RegClass::for_bytes(file, useful),
                )
            } else {
                self.emit_def(
                    Opcode::Shr,
                    vec![Operand::reg(loaded), Operand::constant(skip as u64 * 8)],
                    RegClass::for_bytes(file, useful),
                )
            };
            trace!("rounded load {window}B skip {skip} -> {piece}");
            Ok((piece, useful))
        } else {
            // Sub-slot position only known at runtime; align the address
            // down and shift by the discarded low address bits.
            let based = if enc_offset != 0 {
                self.emit_addr_add(addr, enc_offset as i64)
            } else {
                addr
            };
            let aligned = self.emit_def(
                Opcode::IAnd,
                vec![Operand::reg(based), Operand::constant(!(SLOT_BYTES as u64 - 1))],
                based.class,
            );
            let low = self.emit_def(
                Opcode::IAnd,
                vec![Operand::reg(based), Operand::constant(SLOT_BYTES as u64 - 1)],
                based.class,
            );
            let shift = self.emit_def(
                Opcode::Shl,
                vec![Operand::reg(low), Operand::constant(3)],
                low.class,
            );
            let loaded = self.alloc(loaded_class);
            policy.emit_load_chunk(self, aligned, loaded, 0, coherent, nontemporal);
            // Guaranteed useful bytes: the static alignment bounds the
            // worst-case in-slot offset.
            let useful = trim_useful(
                align_mul.min(remaining),
                remaining,
                component_bytes,
                pos_in_comp,
            );
            let piece = self.emit_def(
                Opcode::Shr,
                vec![Operand::reg(loaded), Operand::reg(shift)],
                RegClass::for_bytes(file, useful),
            );
            trace!("runtime-aligned load {window}B align {align_mul} -> {piece}");
            Ok((piece, useful))
        }
    }

    /// Recombine loaded pieces into `num_components` values of
    /// `component_bytes` each.
    fn assemble_components(
        &mut self,
        pieces: &[Piece],
        num_components: u32,
        component_bytes: u32,
        dst_file: RegFile,
    ) -> SelectResult<Vec<VReg>> {
        let mut comps: Vec<VReg> = Vec::with_capacity(num_components as usize);
        let mut partial: Vec<VReg> = Vec::new();
        let mut partial_bytes = 0u32;
        for piece in pieces {
            if partial_bytes == 0 && piece.bytes % component_bytes == 0 {
                if piece.bytes == component_bytes {
                    comps.push(piece.reg);
                } else {
                    let n = piece.bytes / component_bytes;
                    let part_class = RegClass::for_bytes(piece.reg.file(), component_bytes);
                    let parts: Vec<VReg> = (0..n).map(|_| self.alloc(part_class)).collect();
                    self.emit(Instruction::new(
                        Opcode::SplitVector,
                        vec![Operand::reg(piece.reg)],
                        parts.iter().map(|&p| Def::new(p)).collect(),
                    ));
                    self.record_components(piece.reg, &parts);
                    comps.extend(parts);
                }
            } else {
                partial.push(piece.reg);
                partial_bytes += piece.bytes;
                if partial_bytes == component_bytes {
                    let file = if dst_file == RegFile::Uniform && component_bytes % SLOT_BYTES == 0
                    {
                        RegFile::Uniform
                    } else {
                        partial[0].file()
                    };
                    let comp = self.emit_def(
                        Opcode::CreateVector,
                        partial.drain(..).map(Operand::reg).collect(),
                        RegClass::for_bytes(file, component_bytes),
                    );
                    comps.push(comp);
                    partial_bytes = 0;
                } else if partial_bytes > component_bytes {
                    return Err(SelectError::invariant(
                        "memory chunk straddles a component boundary",
                    ));
                }
            }
        }
        if partial_bytes != 0 {
            return Err(SelectError::invariant(
                "memory pieces leave a component incomplete",
            ));
        }
        if comps.len() != num_components as usize {
            return Err(SelectError::invariant(format!(
                "assembled {} components, wanted {num_components}",
                comps.len()
            )));
        }
        Ok(comps)
    }

    /// Lower one logical load into a legal access sequence.
    ///
    /// Returns one register per component. The caller owns binding them to
    /// source values and recording the composite decomposition.
    pub fn emit_load(&mut self, req: &LoadRequest) -> SelectResult<Vec<VReg>> {
        self.emit_load_with(policy_for(req.space), req)
    }

    /// Like [`emit_load`](Self::emit_load) with an explicit strategy, which
    /// is how the capability stubs in the test suite drive the emitter.
    pub fn emit_load_with(
        &mut self,
        policy: &dyn MemPolicy,
        req: &LoadRequest,
    ) -> SelectResult<Vec<VReg>> {
        let caps = policy.capabilities();
        let total = req.num_components * req.component_bytes;
        debug_assert!(total > 0);
        debug_assert!(req.align_mul.is_power_of_two());
        let (addr, enc_offset) = self.fold_const_offset(req.addr, req.const_offset, total, caps);

        let mut pieces: Vec<Piece> = Vec::new();
        let mut advanced = 0u32;
        while advanced < total {
            let remaining = total - advanced;
            let pos = req.align_offset + req.const_offset + advanced;
            let align = current_align(req.align_mul, pos);
            let pos_in_comp = advanced % req.component_bytes;
            if let Some(size) = pick_size(caps, remaining, align, req.component_bytes, pos_in_comp)
            {
                let reg = self.load_direct_chunk(
                    policy,
                    addr,
                    enc_offset + advanced,
                    size,
                    req.dst_file,
                    req.coherent,
                    req.nontemporal,
                );
                pieces.push(Piece { reg, bytes: size });
                advanced += size;
            } else {
                let (reg, useful) = self.load_rounded_chunk(
                    policy,
                    addr,
                    enc_offset + advanced,
                    pos,
                    req.align_mul,
                    remaining,
                    req.component_bytes,
                    pos_in_comp,
                    req.coherent,
                    req.nontemporal,
                )?;
                debug_assert!(useful > 0);
                pieces.push(Piece { reg, bytes: useful });
                advanced += useful;
            }
        }
        // Soft assertion: the chunker owes the caller exactly the bytes
        // that were asked for.
        debug_assert_eq!(pieces.iter().map(|p| p.bytes).sum::<u32>(), total);

        self.assemble_components(&pieces, req.num_components, req.component_bytes, req.dst_file)
    }

    /// Lower one logical store into a legal access sequence.
    ///
    /// Stores never round up: widening a write would clobber neighboring
    /// bytes. A chunk with no legal size is an unsupported lowering.
    pub fn emit_store(&mut self, req: &StoreRequest) -> SelectResult<()> {
        self.emit_store_with(policy_for(req.space), req)
    }

    pub fn emit_store_with(
        &mut self,
        policy: &dyn MemPolicy,
        req: &StoreRequest,
    ) -> SelectResult<()> {
        let caps = policy.capabilities();
        let total = req.num_components * req.component_bytes;
        debug_assert!(total > 0);
        debug_assert_eq!(req.value.bytes(), total);
        debug_assert!(req.align_mul.is_power_of_two());
        let (addr, enc_offset) = self.fold_const_offset(req.addr, req.const_offset, total, caps);

        let mut advanced = 0u32;
        while advanced < total {
            let remaining = total - advanced;
            let pos = req.align_offset + req.const_offset + advanced;
            let align = current_align(req.align_mul, pos);
            let pos_in_comp = advanced % req.component_bytes;
            let size = pick_size(caps, remaining, align, req.component_bytes, pos_in_comp)
                .ok_or(SelectError::UnsupportedLowering {
                    what: "store alignment",
                    file: req.value.file(),
                    bits: remaining * 8,
                    components: req.num_components,
                })?;
            let data = self.store_chunk_value(req.value, advanced, size, req.component_bytes)?;
            let (chunk_addr, chunk_enc) = if enc_offset + advanced > caps.max_const_offset {
                (self.emit_addr_add(addr, (enc_offset + advanced) as i64), 0)
            } else {
                (addr, enc_offset + advanced)
            };
            policy.emit_store_chunk(
                self,
                chunk_addr,
                data,
                chunk_enc,
                req.coherent,
                req.nontemporal,
            );
            trace!("store chunk {size}B @+{chunk_enc}");
            advanced += size;
        }
        Ok(())
    }

    /// The `size` bytes of `value` starting at `byte_off`, as one register.
    fn store_chunk_value(
        &mut self,
        value: VReg,
        byte_off: u32,
        size: u32,
        component_bytes: u32,
    ) -> SelectResult<VReg> {
        if byte_off == 0 && size == value.bytes() {
            return Ok(value);
        }
        let file = value.file();
        let num = value.bytes() / component_bytes;
        let comp_class = RegClass::for_bytes(file, component_bytes);
        if size >= component_bytes {
            self.split(value, num)?;
            let first = byte_off / component_bytes;
            let count = size / component_bytes;
            if count == 1 {
                return self.extract(value, first, comp_class);
            }
            let mut parts = Vec::with_capacity(count as usize);
            for i in 0..count {
                parts.push(self.extract(value, first + i, comp_class)?);
            }
            Ok(self.emit_def(
                Opcode::CreateVector,
                parts.into_iter().map(Operand::reg).collect(),
                RegClass::for_bytes(file, size),
            ))
        } else {
            // Sub-component chunk: decompose the owning component once
            // more; the composite cache keeps this from repeating.
            self.split(value, num)?;
            let comp = self.extract(value, byte_off / component_bytes, comp_class)?;
            self.split(comp, component_bytes / size)?;
            self.extract(
                comp,
                (byte_off % component_bytes) / size,
                RegClass::for_bytes(file, size),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_align() {
        assert_eq!(current_align(4, 0), 4);
        assert_eq!(current_align(4, 2), 2);
        assert_eq!(current_align(4, 1), 1);
        assert_eq!(current_align(2, 6), 2);
        assert_eq!(current_align(16, 8), 8);
    }

    #[test]
    fn test_pick_size_prefers_largest_fit() {
        assert_eq!(pick_size(&GLOBAL_CAPS, 6, 2, 2, 0), Some(4));
        assert_eq!(pick_size(&GLOBAL_CAPS, 2, 2, 2, 0), Some(2));
        assert_eq!(pick_size(&GLOBAL_CAPS, 16, 16, 4, 0), Some(16));
        // 12 is supported and beats 8+4 for three dwords.
        assert_eq!(pick_size(&GLOBAL_CAPS, 12, 4, 4, 0), Some(12));
    }

    #[test]
    fn test_pick_size_respects_alignment() {
        // Slot-granular space cannot serve a 2-byte tail.
        assert_eq!(pick_size(&SCRATCH_CAPS, 2, 2, 2, 0), None);
        // Byte alignment without byte-unaligned support fits nothing wide.
        assert_eq!(pick_size(&GLOBAL_CAPS, 4, 1, 4, 0), Some(1));
        assert_eq!(pick_size(&SCRATCH_CAPS, 4, 1, 4, 0), None);
        // Byte-unaligned spaces do not care.
        assert_eq!(pick_size(&BUFFER_CAPS, 4, 1, 4, 0), Some(4));
    }

    #[test]
    fn test_pick_size_keeps_component_boundaries() {
        // 12 bytes would straddle 8-byte components; 8 is the best fit.
        assert_eq!(pick_size(&GLOBAL_CAPS, 16, 16, 8, 0), Some(16));
        assert_eq!(pick_size(&GLOBAL_CAPS, 14, 16, 8, 0), Some(8));
        // Mid-component chunks must finish the component.
        assert_eq!(pick_size(&GLOBAL_CAPS, 6, 2, 4, 2), Some(2));
    }

    #[test]
    fn test_trim_useful() {
        assert_eq!(trim_useful(3, 8, 4, 0), 2);
        assert_eq!(trim_useful(6, 6, 2, 0), 4);
        assert_eq!(trim_useful(4, 2, 2, 0), 2);
        assert_eq!(trim_useful(4, 8, 4, 2), 2);
    }
}
