// This module implements the value model of the selector: the mapping from source SSA
// values to machine virtual registers, and the composite-value cache that avoids
// emitting redundant split/extract instructions. resolve() is deterministic and
// memoized; the register class is derived from the value's declared bit width,
// component count and its externally supplied divergence verdict (divergent values go
// to the per-lane vector file, uniform ones to the wave-wide scalar file, and one-bit
// values become lane masks or scalar flags). extract() and split() consult the cache
// before emitting: a component that was already produced in the exact requested class
// is returned without any new instruction, and a value is decomposed at most once per
// requested decomposition.

//! SSA value to virtual register resolution and the composite cache.

use hashbrown::HashMap;
use log::trace;

use crate::core::inst::Def;
use crate::core::{
    Instruction, Opcode, Operand, RegClass, RegFile, SelectError, SelectResult, VReg,
};
use crate::ir::{ValueId, ValueInfo};

use super::SelectContext;

/// One cached sub-component of a composite value.
#[derive(Debug, Clone, Copy)]
struct CachedPart {
    index: u32,
    reg: VReg,
}

/// Per-function value state.
///
/// The memo table is keyed by source value id; the composite cache is a
/// dense arena indexed by VReg id, which is always known at insertion time
/// because ids are assigned monotonically.
#[derive(Default)]
pub struct ValueMap {
    regs: HashMap<u32, VReg>,
    parts: Vec<Vec<CachedPart>>,
}

impl ValueMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn parts_of(&self, reg: VReg) -> &[CachedPart] {
        self.parts
            .get(reg.id as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn cache_part(&mut self, whole: VReg, index: u32, part: VReg) {
        let slot = whole.id as usize;
        if self.parts.len() <= slot {
            self.parts.resize_with(slot + 1, Vec::new);
        }
        let entries = &mut self.parts[slot];
        entries.retain(|p| p.index != index || p.reg.class != part.class);
        entries.push(CachedPart { index, reg: part });
    }

    fn lookup_part(&self, whole: VReg, index: u32, class: RegClass) -> Option<VReg> {
        self.parts_of(whole)
            .iter()
            .find(|p| p.index == index && p.reg.class == class)
            .map(|p| p.reg)
    }
}

impl<'a> SelectContext<'a> {
    /// Register class for a source value, from its declared facts.
    pub fn value_class(&self, info: &ValueInfo) -> SelectResult<RegClass> {
        let file = if info.divergent {
            RegFile::Vector
        } else {
            RegFile::Uniform
        };
        if info.bit_size == 1 {
            // Booleans: divergent ones are lane masks (wave-wide scalars,
            // one bit per lane), uniform ones single scalar flags.
            return Ok(if info.divergent {
                self.program.lane_mask_class()
            } else {
                RegClass::new(RegFile::Uniform, 1)
            });
        }
        if !matches!(info.bit_size, 8 | 16 | 32 | 64) {
            return Err(SelectError::UnsupportedLowering {
                what: "value bit width",
                file,
                bits: info.bit_size,
                components: info.num_components,
            });
        }
        let bytes = info.bytes();
        if bytes >= 4 && bytes % 4 != 0 {
            // Packed narrow vectors that do not fill whole slots have no
            // register-class representation.
            return Err(SelectError::UnsupportedLowering {
                what: "packed narrow vector",
                file,
                bits: info.bit_size,
                components: info.num_components,
            });
        }
        Ok(RegClass::for_bytes(file, bytes))
    }

    /// The VReg already assigned to a value, if any.
    pub fn lookup(&self, value: ValueId) -> Option<VReg> {
        self.values.regs.get(&value.0).copied()
    }

    /// Deterministic, memoized source-value resolution.
    ///
    /// The same source value always yields the same VReg; the first call
    /// creates it from the value's declared class.
    pub fn resolve(&mut self, value: ValueId) -> SelectResult<VReg> {
        if let Some(reg) = self.lookup(value) {
            return Ok(reg);
        }
        let class = self.value_class(self.src.value_info(value))?;
        let reg = self.program.alloc_vreg(class);
        self.values.regs.insert(value.0, reg);
        trace!("resolve {value} -> {reg}");
        Ok(reg)
    }

    /// Bind a source value to a register produced elsewhere (e.g. by the
    /// memory emitter). The value must not have been resolved yet.
    pub fn bind(&mut self, value: ValueId, reg: VReg) {
        let prev = self.values.regs.insert(value.0, reg);
        debug_assert!(prev.is_none(), "{value} bound twice");
    }

    /// Make `produced` the register of `value`, copying if a forward
    /// reference (a loop phi) already pinned a register for it.
    pub fn define_result(&mut self, value: ValueId, produced: VReg) -> SelectResult<()> {
        match self.lookup(value) {
            None => {
                self.bind(value, produced);
                Ok(())
            }
            Some(existing) => {
                self.emit(Instruction::new(
                    Opcode::Mov,
                    vec![Operand::reg(produced)],
                    vec![Def::new(existing)],
                ));
                Ok(())
            }
        }
    }

    /// Record a known decomposition of `whole` into `components`.
    pub fn record_components(&mut self, whole: VReg, components: &[VReg]) {
        for (i, &part) in components.iter().enumerate() {
            self.values.cache_part(whole, i as u32, part);
        }
    }

    /// Component `index` of `value` in exactly `class`.
    ///
    /// Cache hits emit nothing. Requesting the whole value (index 0, same
    /// class) returns it unchanged. Otherwise one extract instruction is
    /// emitted and cached.
    pub fn extract(&mut self, value: VReg, index: u32, class: RegClass) -> SelectResult<VReg> {
        if let Some(part) = self.values.lookup_part(value, index, class) {
            return Ok(part);
        }
        if index == 0 && value.class == class {
            return Ok(value);
        }
        if class.bytes() * (index + 1) > value.bytes() {
            return Err(SelectError::invariant(format!(
                "extract of component {index} x {} bytes from {value}",
                class.bytes()
            )));
        }
        let part = self.alloc(class);
        self.emit(Instruction::new(
            Opcode::ExtractComponent,
            vec![Operand::reg(value), Operand::constant(index as u64)],
            vec![Def::new(part)],
        ));
        self.values.cache_part(value, index, part);
        trace!("extract {value}[{index}] -> {part}");
        Ok(part)
    }

    /// Decompose `value` into `num` equal pieces, at most once per value.
    pub fn split(&mut self, value: VReg, num: u32) -> SelectResult<()> {
        if num <= 1 {
            return Ok(());
        }
        if value.bytes() % num != 0 {
            return Err(SelectError::UnsupportedLowering {
                what: "uneven split",
                file: value.file(),
                bits: value.bytes() * 8,
                components: num,
            });
        }
        let part_class = RegClass::for_bytes(value.file(), value.bytes() / num);
        let cached = (0..num)
            .all(|i| self.values.lookup_part(value, i, part_class).is_some());
        if cached {
            return Ok(());
        }
        let parts: Vec<VReg> = (0..num).map(|_| self.alloc(part_class)).collect();
        self.emit(Instruction::new(
            Opcode::SplitVector,
            vec![Operand::reg(value)],
            parts.iter().map(|&p| Def::new(p)).collect(),
        ));
        self.record_components(value, &parts);
        trace!("split {value} into {num}");
        Ok(())
    }
}
