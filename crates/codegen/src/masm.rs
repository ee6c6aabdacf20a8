//! Generic macro-assembler interface used by the code generation.
//!
//! The driver owns all value-location choreography; this trait is the
//! instruction-selection boundary each ISA implements. Operands arrive as
//! physical registers the driver already allocated. Methods that can trap
//! take the current stack depth (`sp_rel`, relative to the frame base) so
//! the exit sequence can publish an exact stack pointer to the host.
//!
//! Binary operations use the two-operand form `dst = dst op src`; the
//! AArch64 implementation expands that to its three-operand instructions
//! with `dst` repeated.

use capstan_environ::{
    AtomicRmwOp, CmpKind, FloatCmpKind, FloatTy, IntTy, ResourceUses, Sign, VecShape,
};

use crate::buffer::{CodeLabel, Reloc};
use crate::reg::Reg;
use crate::regalloc::RegisterPool;
use anyhow::Result;

/// Operand size, in bits.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OperandSize {
    S8,
    S16,
    S32,
    S64,
}

impl OperandSize {
    pub fn bytes(&self) -> u8 {
        match self {
            OperandSize::S8 => 1,
            OperandSize::S16 => 2,
            OperandSize::S32 => 4,
            OperandSize::S64 => 8,
        }
    }

    pub fn bits(&self) -> u8 {
        self.bytes() * 8
    }

    pub fn from_width(bits: u8) -> OperandSize {
        match bits {
            8 => OperandSize::S8,
            16 => OperandSize::S16,
            32 => OperandSize::S32,
            64 => OperandSize::S64,
            w => panic!("bad operand width: {w}"),
        }
    }
}

impl From<IntTy> for OperandSize {
    fn from(ty: IntTy) -> Self {
        match ty {
            IntTy::I32 => OperandSize::S32,
            IntTy::I64 => OperandSize::S64,
        }
    }
}

impl From<FloatTy> for OperandSize {
    fn from(ty: FloatTy) -> Self {
        match ty {
            FloatTy::F32 => OperandSize::S32,
            FloatTy::F64 => OperandSize::S64,
        }
    }
}

/// Two-operand integer ALU operations.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Mul,
}

/// Shift and rotate operations; the amount register is masked to the
/// operand width by the implementation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ShiftKind {
    Shl,
    ShrS,
    ShrU,
    Rotl,
    Rotr,
}

/// Division family selector.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DivRem {
    pub sign: Sign,
    pub rem: bool,
}

/// Leading/trailing-zero and population counts.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BitCountOp {
    Clz,
    Ctz,
    Popcnt,
}

/// An integer width change.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Extend {
    pub from_bits: u8,
    pub to_bits: u8,
    pub signed: bool,
}

/// Scalar float ALU operations with direct machine equivalents.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FloatAluOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Scalar float unary operations, applied in place.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FloatUnOp {
    Abs,
    Neg,
    Sqrt,
    Ceil,
    Floor,
    Trunc,
    Nearest,
}

/// Shape of a scalar memory load.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LoadKind {
    /// Integer load of `width` bits, extended to `ty`.
    Int { ty: IntTy, width: u8, sign: Sign },
    F32,
    F64,
}

impl LoadKind {
    pub fn width_bytes(&self) -> u8 {
        match self {
            LoadKind::Int { width, .. } => width / 8,
            LoadKind::F32 => 4,
            LoadKind::F64 => 8,
        }
    }
}

/// Shape of a scalar memory store.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StoreKind {
    /// Store the low `width` bits of an integer register.
    Int { width: u8 },
    F32,
    F64,
}

impl StoreKind {
    pub fn width_bytes(&self) -> u8 {
        match self {
            StoreKind::Int { width } => width / 8,
            StoreKind::F32 => 4,
            StoreKind::F64 => 8,
        }
    }
}

/// Negate a condition.
pub fn invert(kind: CmpKind) -> CmpKind {
    match kind {
        CmpKind::Eq => CmpKind::Ne,
        CmpKind::Ne => CmpKind::Eq,
        CmpKind::LtS => CmpKind::GeS,
        CmpKind::LtU => CmpKind::GeU,
        CmpKind::GtS => CmpKind::LeS,
        CmpKind::GtU => CmpKind::LeU,
        CmpKind::LeS => CmpKind::GtS,
        CmpKind::LeU => CmpKind::GtU,
        CmpKind::GeS => CmpKind::LtS,
        CmpKind::GeU => CmpKind::LtU,
    }
}

/// Slot type re-export used by slot accessors.
pub use crate::stack::SlotType;

/// Per-ISA instruction selection.
pub trait MacroAssembler {
    // ---- Inventory ----------------------------------------------------

    /// Allocatable registers in fixed scan order.
    fn pool(&self) -> RegisterPool;

    /// The reserved integer temporary.
    fn scratch(&self) -> Reg;

    /// The reserved vector temporary.
    fn scratch_float(&self) -> Reg;

    /// Fixed (dividend, second) register pair required by division, when
    /// the ISA constrains it (x86-64: RAX/RDX).
    fn fixed_div_regs(&self) -> Option<(Reg, Reg)>;

    /// Fixed shift-amount register, when the ISA constrains it (x86-64:
    /// RCX).
    fn fixed_shift_amount_reg(&self) -> Option<Reg>;

    /// Fixed result register for an atomic RMW / compare-exchange, when the
    /// ISA constrains it (x86-64: RAX for cmpxchg-based forms).
    fn fixed_atomic_result_reg(&self, op: Option<AtomicRmwOp>) -> Option<Reg>;

    // ---- Labels and control ------------------------------------------

    fn new_label(&mut self) -> CodeLabel;
    fn bind(&mut self, label: CodeLabel);
    fn jmp(&mut self, label: CodeLabel);
    fn jcc(&mut self, kind: CmpKind, label: CodeLabel);
    fn jmp_reg(&mut self, target: Reg);

    /// Load the address of `label`'s first instruction into `dst`.
    fn read_instruction_address(&mut self, dst: Reg, label: CodeLabel);

    /// Load the absolute address of the function record for
    /// `function_index`; patched at link time.
    fn load_function_addr(&mut self, dst: Reg, function_index: u32);

    /// Emit the indexed jump of a `br_table`: `index` is a zero-extended
    /// 32-bit register, `arms` the per-arm labels. Bounds are checked by
    /// the caller.
    fn jump_table(&mut self, index: Reg, arms: &[CodeLabel]);

    // ---- Exits --------------------------------------------------------

    /// Publish the stack pointer and status (plus builtin index), then
    /// leave to the host. With `reenter`, the continuation address is
    /// recorded in the call engine and execution resumes right after this
    /// sequence when the host re-enters.
    fn emit_exit(&mut self, status: u32, builtin: Option<u32>, sp_rel: u32, reenter: bool);

    /// Exit with `status` when `kind` holds for the current flags.
    fn trap_if(&mut self, kind: CmpKind, status: u32, sp_rel: u32);

    // ---- Prologue helpers --------------------------------------------

    /// Compare the value stack headroom against this function's ceiling
    /// (patched at finalize); leaves flags so the caller can branch on
    /// `GeU` = enough room.
    fn stack_headroom_cmp(&mut self);

    /// Recompute the stack-base register from the call engine.
    fn reload_stack_base(&mut self);

    /// Refresh the cached memory base register and length from the memory
    /// instance.
    fn reload_memory_cache(&mut self);

    /// Copy the module-instance resources the function uses into the call
    /// engine's module-context cache and seed the derived registers.
    fn init_module_context(&mut self, uses: ResourceUses);

    /// Epilogue: publish results, pop the call frame, return to the caller
    /// or exit to the host when the frame belongs to the entry call.
    fn function_return(&mut self, frame_rel: u32, result_slots: u32, ra_tmp: Reg);

    // ---- Moves and value-stack slots ---------------------------------

    fn mov_rr(&mut self, src: Reg, dst: Reg, size: OperandSize);
    fn mov_imm(&mut self, dst: Reg, imm: u64, size: OperandSize);
    fn mov_float_imm(&mut self, dst: Reg, bits: u64, size: OperandSize);

    /// Load/store a scalar slot (`[stack_base + slot*8]`).
    fn load_slot(&mut self, dst: Reg, slot: u32, ty: SlotType);
    fn store_slot(&mut self, src: Reg, slot: u32, ty: SlotType);
    fn load_slot_v128(&mut self, dst: Reg, slot: u32);
    fn store_slot_v128(&mut self, src: Reg, slot: u32);

    /// Raw 64-bit accesses to runtime records.
    fn load_engine(&mut self, dst: Reg, offset: u32);
    fn store_engine(&mut self, src: Reg, offset: u32);
    fn load_mem64(&mut self, dst: Reg, base: Reg, offset: u32);
    fn store_mem64(&mut self, src: Reg, base: Reg, offset: u32);
    fn load_indexed64(&mut self, dst: Reg, base: Reg, index: Reg, shift: u8);
    fn store_indexed64(&mut self, src: Reg, base: Reg, index: Reg, shift: u8);

    // ---- Scalar integer ----------------------------------------------

    fn alu_rr(&mut self, op: AluOp, src: Reg, dst: Reg, size: OperandSize);
    fn alu_imm(&mut self, op: AluOp, imm: i32, dst: Reg, size: OperandSize);
    fn shift_rr(&mut self, kind: ShiftKind, amount: Reg, dst: Reg, size: OperandSize);
    fn shift_imm(&mut self, kind: ShiftKind, imm: u8, dst: Reg, size: OperandSize);

    /// Division/remainder with explicit divide-by-zero and overflow traps.
    /// The result is left in `dividend.0`; `dividend.1` is clobbered.
    fn div_rem(&mut self, op: DivRem, divisor: Reg, dividend: (Reg, Reg), size: OperandSize,
        sp_rel: u32);

    fn bit_count(&mut self, op: BitCountOp, src: Reg, dst: Reg, size: OperandSize);
    fn extend(&mut self, src: Reg, dst: Reg, ext: Extend);

    /// Set flags for `lhs ? rhs` / `lhs ? imm`.
    fn cmp_rr(&mut self, lhs: Reg, rhs: Reg, size: OperandSize);
    fn cmp_imm(&mut self, lhs: Reg, imm: i32, size: OperandSize);

    /// Materialise the current flags as 0/1 into a 32-bit register.
    fn setcc(&mut self, kind: CmpKind, dst: Reg);

    /// Keep `dst` when `kind` holds for the current flags, else copy `src`
    /// into it. Works for any register class.
    fn select_rr(&mut self, kind: CmpKind, src: Reg, dst: Reg, ty: SlotType);

    // ---- Scalar float -------------------------------------------------

    fn float_alu(&mut self, op: FloatAluOp, src: Reg, dst: Reg, size: OperandSize);
    fn float_min_max(&mut self, is_max: bool, src: Reg, dst: Reg, size: OperandSize, tmp: Reg);
    fn float_unop(&mut self, op: FloatUnOp, dst: Reg, size: OperandSize);
    fn float_copysign(&mut self, src: Reg, dst: Reg, size: OperandSize, tmp: Reg);

    /// Compare floats and materialise the 0/1 outcome into `dst` (a GP
    /// register), with NaN folded into the predicate semantics.
    fn float_cmp(&mut self, kind: FloatCmpKind, lhs: Reg, rhs: Reg, dst: Reg, size: OperandSize);

    fn float_demote(&mut self, dst: Reg);
    fn float_promote(&mut self, dst: Reg);

    fn int_to_float(&mut self, src: Reg, dst: Reg, int: IntTy, float: FloatTy, sign: Sign,
        tmp_gp: Reg);

    /// Float → integer truncation. Trapping unless `saturating`.
    fn float_to_int(&mut self, src: Reg, dst: Reg, float: FloatTy, int: IntTy, sign: Sign,
        saturating: bool, tmp_fp: Reg, sp_rel: u32);

    fn reinterpret_float_to_int(&mut self, src: Reg, dst: Reg, size: OperandSize);
    fn reinterpret_int_to_float(&mut self, src: Reg, dst: Reg, size: OperandSize);

    // ---- Linear memory ------------------------------------------------

    /// Bounds-check `addr + offset .. + width` against the memory length
    /// and rewrite `addr` into the absolute effective address. With
    /// `check_align`, a natural-alignment check precedes the bounds check.
    fn memory_access(&mut self, addr: Reg, offset: u32, width: u8, check_align: bool,
        sp_rel: u32);

    fn wasm_load(&mut self, dst: Reg, addr: Reg, kind: LoadKind);
    fn wasm_store(&mut self, src: Reg, addr: Reg, kind: StoreKind);

    /// `memory.copy` with overlap-safe direction; operands are zero-extended
    /// counts/addresses, bounds-checked before any write.
    fn memory_copy_loop(&mut self, dst: Reg, src: Reg, len: Reg, sp_rel: u32);
    fn memory_fill_loop(&mut self, dst: Reg, val: Reg, len: Reg, sp_rel: u32);
    /// `memory.init` from the passive data segment `data_index`.
    fn memory_init_loop(&mut self, dst: Reg, src: Reg, len: Reg, tmp: Reg, data_index: u32,
        sp_rel: u32);
    /// `table.copy` / `table.init` over 8-byte reference entries.
    fn table_copy_loop(&mut self, dst_table: u32, src_table: u32, dst: Reg, src: Reg, len: Reg,
        tmp: Reg, sp_rel: u32);
    fn table_init_loop(&mut self, table_index: u32, elem_index: u32, dst: Reg, src: Reg,
        len: Reg, tmp: Reg, sp_rel: u32);

    // ---- Atomics ------------------------------------------------------

    fn atomic_load(&mut self, dst: Reg, addr: Reg, ty: IntTy, width: u8);
    fn atomic_store(&mut self, src: Reg, addr: Reg, width: u8);
    /// `dst` receives the previous value; on x86-64 some operators pin it.
    fn atomic_rmw(&mut self, op: AtomicRmwOp, operand: Reg, dst: Reg, addr: Reg, ty: IntTy,
        width: u8, tmp: Reg);
    /// Compare-and-swap: `expected` is the comparand and receives the
    /// previous value.
    fn atomic_cmpxchg(&mut self, expected: Reg, replacement: Reg, addr: Reg, ty: IntTy,
        width: u8, tmp: Reg);
    fn fence(&mut self);

    // ---- 128-bit vectors ---------------------------------------------

    fn v128_const(&mut self, dst: Reg, lo: u64, hi: u64);
    fn v128_mov(&mut self, src: Reg, dst: Reg);
    fn v128_add(&mut self, shape: VecShape, src: Reg, dst: Reg);
    fn v128_sub(&mut self, shape: VecShape, src: Reg, dst: Reg);
    fn v128_mul(&mut self, shape: VecShape, src: Reg, dst: Reg, tmp: Reg);
    fn v128_neg(&mut self, shape: VecShape, dst: Reg);
    fn v128_abs(&mut self, shape: VecShape, dst: Reg);
    fn v128_min(&mut self, shape: VecShape, sign: Sign, src: Reg, dst: Reg, tmp: Reg);
    fn v128_max(&mut self, shape: VecShape, sign: Sign, src: Reg, dst: Reg, tmp: Reg);
    fn v128_avgr(&mut self, shape: VecShape, src: Reg, dst: Reg);
    fn v128_add_sat(&mut self, shape: VecShape, sign: Sign, src: Reg, dst: Reg);
    fn v128_sub_sat(&mut self, shape: VecShape, sign: Sign, src: Reg, dst: Reg);
    fn v128_shl(&mut self, shape: VecShape, amount: Reg, dst: Reg, tmp: Reg);
    fn v128_shr(&mut self, shape: VecShape, sign: Sign, amount: Reg, dst: Reg, tmp: Reg);
    /// Per-lane predicate producing all-ones/zero lanes; `dst` holds the
    /// left operand and the result.
    fn v128_cmp(&mut self, shape: VecShape, kind: CmpKind, src: Reg, dst: Reg, tmp: Reg);
    fn v128_and(&mut self, src: Reg, dst: Reg);
    fn v128_or(&mut self, src: Reg, dst: Reg);
    fn v128_xor(&mut self, src: Reg, dst: Reg);
    fn v128_not(&mut self, dst: Reg);
    /// `dst = dst & !src`.
    fn v128_andnot(&mut self, src: Reg, dst: Reg);
    /// `mask = (v1 & mask) | (v2 & !mask)`; the result lands in `mask` and
    /// `v1` is clobbered.
    fn v128_bitselect(&mut self, v1: Reg, v2: Reg, mask: Reg);
    fn v128_splat(&mut self, shape: VecShape, src: Reg, dst: Reg);
    fn v128_extract_lane(&mut self, shape: VecShape, lane: u8, sign: Sign, src: Reg, dst: Reg);
    fn v128_replace_lane(&mut self, shape: VecShape, lane: u8, src: Reg, dst: Reg);
    fn v128_shuffle(&mut self, lanes: &[u8; 16], src: Reg, dst: Reg, tmp: Reg);
    fn v128_swizzle(&mut self, src: Reg, dst: Reg, tmp: Reg);
    fn v128_any_true(&mut self, src: Reg, dst: Reg);
    fn v128_all_true(&mut self, shape: VecShape, src: Reg, dst: Reg, tmp: Reg);
    fn v128_bitmask(&mut self, shape: VecShape, src: Reg, dst: Reg, tmp: Reg);
    fn v128_narrow(&mut self, shape: VecShape, sign: Sign, src: Reg, dst: Reg);
    fn v128_extend(&mut self, shape: VecShape, sign: Sign, low: bool, dst: Reg);
    fn v128_ext_add_pairwise(&mut self, shape: VecShape, sign: Sign, dst: Reg, tmp: Reg);
    fn v128_ext_mul(&mut self, shape: VecShape, sign: Sign, low: bool, src: Reg, dst: Reg,
        tmp: Reg);
    fn v128_q15mulr_sat(&mut self, src: Reg, dst: Reg);
    fn v128_dot(&mut self, src: Reg, dst: Reg);
    fn v128_popcnt(&mut self, dst: Reg, tmp: Reg);
    fn v128_trunc_sat(&mut self, shape: VecShape, sign: Sign, dst: Reg, tmp: Reg);
    fn v128_convert_i(&mut self, float: VecShape, sign: Sign, dst: Reg, tmp: Reg);
    fn v128_demote(&mut self, dst: Reg);
    fn v128_promote(&mut self, dst: Reg);

    fn v128_load(&mut self, kind: capstan_environ::V128LoadKind, dst: Reg, addr: Reg);
    fn v128_load_lane(&mut self, lane_bits: u8, lane: u8, dst: Reg, addr: Reg);
    fn v128_store(&mut self, src: Reg, addr: Reg);
    fn v128_store_lane(&mut self, lane_bits: u8, lane: u8, src: Reg, addr: Reg);

    // ---- Finish -------------------------------------------------------

    /// Resolve fixups, patch the deferred ceiling, return code + relocs.
    fn finalize(self, stack_pointer_ceil: u32) -> Result<(Vec<u8>, Vec<Reloc>)>
    where
        Self: Sized;
}
