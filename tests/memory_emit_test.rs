// This test suite validates the generic memory-access emitter: chunk selection against
// capability descriptors, the byte-exactness guarantee (the useful bytes of all emitted
// accesses tile the request exactly), alignment-driven round-up-and-shift, constant
// offset folding into the address register, component reassembly, uniform-file
// promotion, and the store path's refusal to widen writes. A capability stub without
// 12-byte accesses checks that awkward sizes decompose (8+4) instead of failing, per
// the emitter's contract.

//! Memory-access emitter tests.

use wavesel::core::{
    BlockKind, Instruction, MemSpace, MemoryInfo, Opcode, Program, RegClass, RegFile, VReg,
    WaveConfig,
};
use wavesel::ir::{FuncBuilder, SourceFunction};
use wavesel::isel::memory::{MemCapabilities, MemPolicy};
use wavesel::isel::{LoadRequest, SelectContext, StoreRequest};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn empty_function() -> SourceFunction {
    FuncBuilder::new("mem").finish()
}

fn context(src: &SourceFunction) -> SelectContext<'_> {
    let mut ctx = SelectContext::new(src, WaveConfig::new(64));
    let start = ctx.program.create_and_insert_block(BlockKind::TOP_LEVEL);
    ctx.set_current(start);
    ctx
}

fn vector_addr(ctx: &mut SelectContext) -> VReg {
    ctx.alloc(RegClass::new(RegFile::Vector, 2))
}

fn load_request(addr: VReg, space: MemSpace, num: u32, bytes: u32, align: u32) -> LoadRequest {
    LoadRequest {
        space,
        addr,
        dst_file: RegFile::Vector,
        num_components: num,
        component_bytes: bytes,
        align_mul: align,
        align_offset: 0,
        const_offset: 0,
        coherent: false,
        nontemporal: false,
    }
}

fn loads_of(program: &Program) -> Vec<&Instruction> {
    program
        .blocks
        .iter()
        .flat_map(|b| b.instructions.iter())
        .filter(|i| i.opcode == Opcode::Load)
        .collect()
}

fn stores_of(program: &Program) -> Vec<&Instruction> {
    program
        .blocks
        .iter()
        .flat_map(|b| b.instructions.iter())
        .filter(|i| i.opcode == Opcode::Store)
        .collect()
}

/// Scenario E: 3 x 2 bytes at 2-byte alignment against the global space
/// (sizes {1,2,4,8,12,16}, no byte-unaligned access) emits a 4-byte and a
/// 2-byte access, six useful bytes, no overlap.
#[test]
fn six_bytes_at_align_two_is_four_plus_two() {
    init_logging();
    let src = empty_function();
    let mut ctx = context(&src);
    let addr = vector_addr(&mut ctx);
    let comps = ctx
        .emit_load(&load_request(addr, MemSpace::Global, 3, 2, 2))
        .unwrap();
    assert_eq!(comps.len(), 3);
    assert!(comps.iter().all(|c| c.bytes() == 2));

    let loads = loads_of(&ctx.program);
    let mut sizes: Vec<u32> = loads.iter().map(|i| i.defs[0].vreg.bytes()).collect();
    sizes.sort_unstable();
    assert_eq!(sizes, vec![2, 4]);
    // Offsets tile the request: the 4-byte access at 0, the tail at 4 (or
    // the equivalent 2+4 ordering).
    let mut offsets: Vec<u32> = loads
        .iter()
        .map(|i| i.memory_info().unwrap().const_offset)
        .collect();
    offsets.sort_unstable();
    assert_eq!(offsets[0], 0);
    assert_eq!(offsets[1] + loads_len_at(&loads, offsets[1]), 6);
}

fn loads_len_at(loads: &[&Instruction], offset: u32) -> u32 {
    loads
        .iter()
        .find(|i| i.memory_info().unwrap().const_offset == offset)
        .map(|i| i.defs[0].vreg.bytes())
        .unwrap()
}

#[test]
fn twelve_bytes_uses_native_access_when_supported() {
    init_logging();
    let src = empty_function();
    let mut ctx = context(&src);
    let addr = vector_addr(&mut ctx);
    let comps = ctx
        .emit_load(&load_request(addr, MemSpace::Global, 3, 4, 16))
        .unwrap();
    assert_eq!(comps.len(), 3);
    let loads = loads_of(&ctx.program);
    assert_eq!(loads.len(), 1);
    assert_eq!(loads[0].defs[0].vreg.bytes(), 12);
}

/// A capability stub whose sizes stop at powers of two: a 12-byte request
/// must decompose into 8+4 rather than fail.
struct NoTwelvePolicy;

static NO_TWELVE_CAPS: MemCapabilities = MemCapabilities {
    supported_sizes: &[1, 2, 4, 8, 16],
    byte_unaligned: false,
    narrow_elements: true,
    max_const_offset: 4095,
    result_file: RegFile::Vector,
};

impl MemPolicy for NoTwelvePolicy {
    fn capabilities(&self) -> &'static MemCapabilities {
        &NO_TWELVE_CAPS
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
            vec![wavesel::core::Operand::reg(addr)],
            vec![wavesel::core::Def::new(dst)],
            MemoryInfo::at_offset(MemSpace::Global, const_offset),
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
            vec![
                wavesel::core::Operand::reg(addr),
                wavesel::core::Operand::reg(data),
            ],
            vec![],
            MemoryInfo::at_offset(MemSpace::Global, const_offset),
        ));
    }
}

#[test]
fn twelve_bytes_decomposes_without_native_access() {
    init_logging();
    let src = empty_function();
    let mut ctx = context(&src);
    let addr = vector_addr(&mut ctx);
    let req = load_request(addr, MemSpace::Global, 3, 4, 16);
    let comps = ctx.emit_load_with(&NoTwelvePolicy, &req).unwrap();
    assert_eq!(comps.len(), 3);
    let loads = loads_of(&ctx.program);
    let mut sizes: Vec<u32> = loads.iter().map(|i| i.defs[0].vreg.bytes()).collect();
    sizes.sort_unstable();
    assert_eq!(sizes, vec![4, 8]);
}

/// Byte-exactness sweep: every request is answered with components of
/// exactly the right width, whatever the space and alignment.
#[test]
fn byte_exact_across_spaces_and_alignments() {
    init_logging();
    let cases: &[(MemSpace, u32, u32, u32, u32)] = &[
        (MemSpace::Global, 1, 4, 4, 0),
        (MemSpace::Global, 4, 4, 4, 0),
        (MemSpace::Global, 2, 8, 8, 8),
        (MemSpace::Global, 3, 2, 2, 0),
        (MemSpace::Global, 2, 2, 4, 2),
        (MemSpace::Global, 4, 1, 1, 3),
        (MemSpace::Buffer, 3, 4, 1, 1),
        (MemSpace::Buffer, 2, 2, 1, 0),
        (MemSpace::Shared, 4, 4, 16, 0),
        (MemSpace::Shared, 1, 2, 2, 0),
        (MemSpace::Scratch, 2, 4, 4, 4),
        (MemSpace::Scratch, 1, 4, 4, 0),
    ];
    for &(space, num, bytes, align_mul, align_offset) in cases {
        let src = empty_function();
        let mut ctx = context(&src);
        let addr = vector_addr(&mut ctx);
        let mut req = load_request(addr, space, num, bytes, align_mul);
        req.align_offset = align_offset;
        let comps = ctx
            .emit_load(&req)
            .unwrap_or_else(|e| panic!("{space:?} {num}x{bytes} align {align_mul}+{align_offset}: {e}"));
        assert_eq!(comps.len(), num as usize);
        assert!(
            comps.iter().all(|c| c.bytes() == bytes),
            "{space:?} {num}x{bytes}: wrong component widths"
        );
    }
}

/// A slot-granular space serving a narrow tail over-fetches one slot and
/// keeps the low bytes.
#[test]
fn scratch_narrow_tail_overfetches_and_narrows() {
    init_logging();
    let src = empty_function();
    let mut ctx = context(&src);
    let addr = vector_addr(&mut ctx);
    let comps = ctx
        .emit_load(&load_request(addr, MemSpace::Scratch, 1, 2, 4))
        .unwrap();
    assert_eq!(comps.len(), 1);
    assert_eq!(comps[0].bytes(), 2);
    let loads = loads_of(&ctx.program);
    assert_eq!(loads.len(), 1);
    // The access itself is slot-sized; the narrowing happens afterwards.
    assert_eq!(loads[0].defs[0].vreg.bytes(), 4);
}

#[test]
fn misaligned_slot_space_shifts_leading_bytes_off() {
    init_logging();
    let src = empty_function();
    let mut ctx = context(&src);
    let addr = vector_addr(&mut ctx);
    let mut req = load_request(addr, MemSpace::Scratch, 1, 4, 4);
    // Known byte misalignment on a space with no narrow accesses: every
    // piece comes from an over-fetching slot load shifted down.
    req.align_offset = 1;
    let comps = ctx.emit_load(&req).unwrap();
    assert_eq!(comps.len(), 1);
    assert_eq!(comps[0].bytes(), 4);
    let shr_count = ctx.program.blocks[0]
        .instructions
        .iter()
        .filter(|i| i.opcode == Opcode::Shr)
        .count();
    assert!(shr_count >= 1);
    // The shifted fragments are glued back into one component.
    let create = ctx.program.blocks[0]
        .instructions
        .iter()
        .any(|i| i.opcode == Opcode::CreateVector);
    assert!(create);
}

#[test]
fn oversized_const_offset_folds_into_address() {
    init_logging();
    let src = empty_function();
    let mut ctx = context(&src);
    let addr = vector_addr(&mut ctx);
    let mut req = load_request(addr, MemSpace::Global, 1, 4, 4);
    req.const_offset = 5000;
    let comps = ctx.emit_load(&req).unwrap();
    assert_eq!(comps.len(), 1);
    let adds: Vec<&Instruction> = ctx.program.blocks[0]
        .instructions
        .iter()
        .filter(|i| i.opcode == Opcode::IAdd)
        .collect();
    assert_eq!(adds.len(), 1);
    assert_eq!(adds[0].operands[1].as_const(), Some(4096));
    let loads = loads_of(&ctx.program);
    assert_eq!(loads[0].memory_info().unwrap().const_offset, 5000 - 4096);
}

#[test]
fn encodable_const_offset_is_kept_inline() {
    init_logging();
    let src = empty_function();
    let mut ctx = context(&src);
    let addr = vector_addr(&mut ctx);
    let mut req = load_request(addr, MemSpace::Global, 1, 4, 4);
    req.const_offset = 128;
    ctx.emit_load(&req).unwrap();
    let adds = ctx.program.blocks[0]
        .instructions
        .iter()
        .filter(|i| i.opcode == Opcode::IAdd)
        .count();
    assert_eq!(adds, 0);
    assert_eq!(loads_of(&ctx.program)[0].memory_info().unwrap().const_offset, 128);
}

#[test]
fn uniform_destination_promotes_whole_slot_pieces() {
    init_logging();
    let src = empty_function();
    let mut ctx = context(&src);
    let addr = ctx.alloc(RegClass::new(RegFile::Uniform, 2));
    let mut req = load_request(addr, MemSpace::Global, 4, 4, 16);
    req.dst_file = RegFile::Uniform;
    let comps = ctx.emit_load(&req).unwrap();
    assert!(comps.iter().all(|c| c.file() == RegFile::Uniform));
    let loads = loads_of(&ctx.program);
    assert!(loads.iter().all(|i| i.defs[0].vreg.file() == RegFile::Uniform));
}

#[test]
fn store_splits_into_legal_chunks() {
    init_logging();
    let src = empty_function();
    let mut ctx = context(&src);
    let addr = vector_addr(&mut ctx);
    let value = ctx.alloc(RegClass::new(RegFile::Vector, 4));
    let req = StoreRequest {
        space: MemSpace::Global,
        addr,
        value,
        num_components: 4,
        component_bytes: 4,
        align_mul: 16,
        align_offset: 0,
        const_offset: 0,
        coherent: false,
        nontemporal: false,
    };
    ctx.emit_store(&req).unwrap();
    let stores = stores_of(&ctx.program);
    assert_eq!(stores.len(), 1);
}

#[test]
fn byte_aligned_store_degrades_to_byte_chunks() {
    init_logging();
    let src = empty_function();
    let mut ctx = context(&src);
    let addr = vector_addr(&mut ctx);
    let value = ctx.alloc(RegClass::new(RegFile::Vector, 1));
    let req = StoreRequest {
        space: MemSpace::Global,
        addr,
        value,
        num_components: 1,
        component_bytes: 4,
        align_mul: 1,
        align_offset: 0,
        const_offset: 0,
        coherent: false,
        nontemporal: false,
    };
    ctx.emit_store(&req).unwrap();
    let stores = stores_of(&ctx.program);
    assert_eq!(stores.len(), 4);
}

#[test]
fn misaligned_store_on_slot_space_is_unsupported() {
    init_logging();
    let src = empty_function();
    let mut ctx = context(&src);
    let addr = vector_addr(&mut ctx);
    let value = ctx.alloc(RegClass::narrow(RegFile::Vector, 2));
    let req = StoreRequest {
        space: MemSpace::Scratch,
        addr,
        value,
        num_components: 1,
        component_bytes: 2,
        align_mul: 2,
        align_offset: 0,
        const_offset: 0,
        coherent: false,
        nontemporal: false,
    };
    assert!(ctx.emit_store(&req).is_err());
}
