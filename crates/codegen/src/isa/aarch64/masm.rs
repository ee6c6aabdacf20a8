//! AArch64 MacroAssembler: instruction selection for the generic lowering
//! interface.
//!
//! Register conventions: X0 call engine, X29 module instance, X1 value
//! stack base, X2 memory base, X27/X28 integer scratch, V31 vector scratch.
//! The baseline is ARMv8.0 with NEON; atomics lower to acquire/release
//! exclusives.

use capstan_environ::{
    AtomicRmwOp, CmpKind, CpuFeatures, FloatCmpKind, FloatTy, IntTy, ResourceUses, Sign,
    V128LoadKind, VecShape, ENGINE_COMPILER_CALL_RETURN_ADDRESS, ENGINE_DATA_INSTANCES_ELEMENT0,
    ENGINE_ELEMENT_INSTANCES_ELEMENT0, ENGINE_FUNCTIONS_ELEMENT0, ENGINE_GLOBALS_ELEMENT0,
    ENGINE_HOST_STACK_POINTER, ENGINE_MEMORY_ELEMENT0,
    ENGINE_MEMORY_INSTANCE, ENGINE_MEMORY_LEN, ENGINE_MODULE_INSTANCE, ENGINE_BUILTIN_CALL_INDEX,
    ENGINE_STACK_BASE_POINTER, ENGINE_STACK_POINTER, ENGINE_STATUS_CODE, ENGINE_TABLES_ELEMENT0,
    ENGINE_TABLES_LEN, ENGINE_TYPE_IDS_ELEMENT0, ENGINE_VALUE_STACK_ELEMENT0,
    ENGINE_VALUE_STACK_LEN, MEMORY_INSTANCE_BUFFER, MEMORY_INSTANCE_BUFFER_LEN,
    MODULE_INSTANCE_DATA_INSTANCES_ELEMENT0, MODULE_INSTANCE_ELEMENT_INSTANCES_ELEMENT0,
    MODULE_INSTANCE_FUNCTIONS_ELEMENT0, MODULE_INSTANCE_GLOBALS_ELEMENT0, MODULE_INSTANCE_MEMORY,
    MODULE_INSTANCE_TABLES_ELEMENT0, MODULE_INSTANCE_TABLES_LEN,
    MODULE_INSTANCE_TYPE_IDS_ELEMENT0, PASSIVE_INSTANCE_LEN, PASSIVE_INSTANCE_PTR,
    STATUS_INTEGER_DIVISION_BY_ZERO, STATUS_INTEGER_OVERFLOW,
    STATUS_INVALID_FLOAT_TO_INT_CONVERSION, STATUS_INVALID_TABLE_ACCESS,
    STATUS_MEMORY_OUT_OF_BOUNDS, STATUS_RETURNED, STATUS_UNALIGNED_ATOMIC,
    TABLE_INSTANCE_REFERENCES, TABLE_INSTANCE_REFERENCES_LEN,
};

use super::asm::{Assembler, Cond, VSize};
use super::regs;
use crate::buffer::{CodeLabel, FixupKind, Reloc, RelocKind};
use crate::masm::{
    invert, AluOp, BitCountOp, DivRem, Extend, FloatAluOp, FloatUnOp, LoadKind, MacroAssembler as
    Masm, OperandSize, ShiftKind, SlotType, StoreKind,
};
use crate::reg::Reg;
use crate::regalloc::RegisterPool;
use anyhow::Result;

fn cond(kind: CmpKind) -> Cond {
    match kind {
        CmpKind::Eq => Cond::Eq,
        CmpKind::Ne => Cond::Ne,
        CmpKind::LtS => Cond::Lt,
        CmpKind::LtU => Cond::Lo,
        CmpKind::GtS => Cond::Gt,
        CmpKind::GtU => Cond::Hi,
        CmpKind::LeS => Cond::Le,
        CmpKind::LeU => Cond::Ls,
        CmpKind::GeS => Cond::Ge,
        CmpKind::GeU => Cond::Hs,
    }
}

fn wide(size: OperandSize) -> bool {
    size == OperandSize::S64
}

fn vsize(shape: VecShape) -> VSize {
    match shape {
        VecShape::I8x16 => VSize::B,
        VecShape::I16x8 => VSize::H,
        VecShape::I32x4 | VecShape::F32x4 => VSize::S,
        VecShape::I64x2 | VecShape::F64x2 => VSize::D,
    }
}

fn lit64(x: u64) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[0..8].copy_from_slice(&x.to_le_bytes());
    out[8..16].copy_from_slice(&x.to_le_bytes());
    out
}

/// AArch64 MacroAssembler.
pub(crate) struct MacroAssembler {
    asm: Assembler,
    // The optional-feature knobs are x64-specific; every AArch64 sequence
    // here is baseline.
    _features: CpuFeatures,
}

impl MacroAssembler {
    pub fn new(features: CpuFeatures) -> Self {
        Self {
            asm: Assembler::new(),
            _features: features,
        }
    }

    /// Add an arbitrary immediate to `reg`; large values route through
    /// x28, so `reg` must not be x28.
    fn add_imm_any(&mut self, imm: u64, reg: Reg) {
        if imm == 0 {
            return;
        }
        if imm < 4096 {
            self.asm.add_imm(imm as u32, reg, true);
        } else {
            debug_assert!(reg != regs::scratch2());
            self.asm.mov_imm(regs::scratch2(), imm);
            self.asm.add_rr(regs::scratch2(), reg, true);
        }
    }

    /// Resolve `[base + offset]` into an operand the scaled-offset forms
    /// accept, computing through x28 when out of range.
    fn based(&mut self, base: Reg, offset: u32, size: u8) -> (Reg, u32) {
        let scaled_max = 4096 * size as u32;
        if offset % size as u32 == 0 && offset < scaled_max {
            (base, offset)
        } else {
            let tmp = regs::scratch2();
            debug_assert!(base != tmp);
            self.asm.mov_imm(tmp, offset as u64);
            self.asm.add_rr(base, tmp, true);
            (tmp, 0)
        }
    }

    fn slot_off(slot: u32) -> u32 {
        slot * 8
    }

    /// Address of a value-stack slot in x28 (for v128 access, whose
    /// scaled-offset form needs 16-byte multiples).
    fn slot_addr_v128(&mut self, slot: u32) -> Reg {
        let tmp = regs::scratch2();
        self.asm.mov_imm(tmp, Self::slot_off(slot) as u64);
        self.asm.add_rr(regs::stack_base(), tmp, true);
        tmp
    }

    fn dup_gp(&mut self, size: VSize, src: Reg, dst: Reg) {
        let imm5 = 1u32 << (size as u32);
        self.asm
            .v_raw2(0x4e00_0c00 | imm5 << 16, src, dst);
    }

    fn v_mov(&mut self, src: Reg, dst: Reg) {
        // orr vd, vn, vn
        self.asm.v_raw(0x4ea0_1c00, src, src, dst);
    }

    fn v_not(&mut self, src: Reg, dst: Reg) {
        self.asm.v_raw2(0x6e20_5800, src, dst);
    }

    /// Vector immediate shift-right (sshr/ushr), whole 128-bit register.
    fn v_shr_imm(&mut self, signed: bool, shape: VecShape, shift: u8, dst: Reg) {
        let esize = shape.lane_bits() as u32;
        let immhb = 2 * esize - shift as u32;
        let base = if signed { 0x4f00_0400 } else { 0x6f00_0400 };
        self.asm.v_raw2(base | immhb << 16, dst, dst);
    }

    /// sshll/ushll `#0` widening of the low or high half.
    fn v_extend_half(&mut self, signed: bool, src_size: VSize, high: bool, rn: Reg, rd: Reg) {
        let mut word = if signed { 0x0f00_a400u32 } else { 0x2f00_a400 };
        word |= 1 << (19 + src_size as u32);
        if high {
            word |= 0x4000_0000;
        }
        self.asm.v_raw2(word, rn, rd);
    }

    fn cmp_engine_field(&mut self, reg: Reg, offset: u32) {
        self.asm
            .load_zx(regs::scratch2(), regs::engine(), offset, 8);
        self.asm.cmp_rr(reg, regs::scratch2(), true);
    }
}

impl Masm for MacroAssembler {
    fn pool(&self) -> RegisterPool {
        regs::pool()
    }

    fn scratch(&self) -> Reg {
        regs::scratch()
    }

    fn scratch_float(&self) -> Reg {
        regs::scratch_v()
    }

    fn fixed_div_regs(&self) -> Option<(Reg, Reg)> {
        None
    }

    fn fixed_shift_amount_reg(&self) -> Option<Reg> {
        None
    }

    fn fixed_atomic_result_reg(&self, _op: Option<AtomicRmwOp>) -> Option<Reg> {
        None
    }

    // ---- labels and control ------------------------------------------

    fn new_label(&mut self) -> CodeLabel {
        self.asm.buf.new_label()
    }

    fn bind(&mut self, label: CodeLabel) {
        self.asm.buf.bind_label(label);
    }

    fn jmp(&mut self, label: CodeLabel) {
        self.asm.b(label);
    }

    fn jcc(&mut self, kind: CmpKind, label: CodeLabel) {
        self.asm.b_cond(cond(kind), label);
    }

    fn jmp_reg(&mut self, target: Reg) {
        self.asm.br(target);
    }

    fn read_instruction_address(&mut self, dst: Reg, label: CodeLabel) {
        self.asm.adr(dst, label);
    }

    fn load_function_addr(&mut self, dst: Reg, function_index: u32) {
        self.asm
            .ldr_x_reloc(dst, RelocKind::FunctionAddress { function_index });
    }

    fn jump_table(&mut self, index: Reg, arms: &[CodeLabel]) {
        let table = self.asm.buf.new_label();
        self.asm.adr(regs::scratch(), table);
        self.asm
            .ldrsw_indexed(regs::scratch2(), regs::scratch(), index);
        self.asm.add_rr(regs::scratch2(), regs::scratch(), true);
        self.asm.br(regs::scratch());
        self.asm.buf.bind_label(table);
        let base = self.asm.buf.len();
        for arm in arms {
            let at = self.asm.buf.len();
            self.asm.buf.put4(0);
            self.asm.buf.use_label(at, FixupKind::TableEntry { base }, *arm);
        }
    }

    // ---- exits --------------------------------------------------------

    fn emit_exit(&mut self, status: u32, builtin: Option<u32>, sp_rel: u32, reenter: bool) {
        let scratch = regs::scratch();
        self.asm
            .load_zx(scratch, regs::engine(), ENGINE_STACK_BASE_POINTER, 8);
        self.add_imm_any(sp_rel as u64, scratch);
        self.asm
            .store(scratch, regs::engine(), ENGINE_STACK_POINTER, 8);
        self.asm.mov_imm(scratch, status as u64);
        self.asm.store(scratch, regs::engine(), ENGINE_STATUS_CODE, 4);
        if let Some(index) = builtin {
            self.asm.mov_imm(scratch, index as u64);
            self.asm
                .store(scratch, regs::engine(), ENGINE_BUILTIN_CALL_INDEX, 4);
        }
        let cont = reenter.then(|| {
            let cont = self.asm.buf.new_label();
            self.asm.adr(scratch, cont);
            self.asm
                .store(scratch, regs::engine(), ENGINE_COMPILER_CALL_RETURN_ADDRESS, 8);
            cont
        });
        // The entry stub parked the host stack pointer just below the
        // callee-saved registers it pushed; unwind them in reverse and
        // return through the restored link register.
        self.asm
            .load_zx(scratch, regs::engine(), ENGINE_HOST_STACK_POINTER, 8);
        self.asm.mov_to_sp(scratch);
        self.asm.ldp_d_post16(regs::vreg(8), regs::vreg(9));
        self.asm.ldp_d_post16(regs::vreg(10), regs::vreg(11));
        self.asm.ldp_d_post16(regs::vreg(12), regs::vreg(13));
        self.asm.ldp_d_post16(regs::vreg(14), regs::vreg(15));
        self.asm.ldp_x_post16(regs::xreg(19), regs::xreg(20));
        self.asm.ldp_x_post16(regs::xreg(21), regs::xreg(22));
        self.asm.ldp_x_post16(regs::xreg(23), regs::xreg(24));
        self.asm.ldp_x_post16(regs::xreg(25), regs::xreg(26));
        self.asm.ldp_x_post16(regs::xreg(27), regs::xreg(28));
        self.asm.ldp_x_post16(regs::xreg(29), regs::xreg(30));
        self.asm.ret();
        if let Some(cont) = cont {
            self.asm.buf.bind_label(cont);
        }
    }

    fn trap_if(&mut self, kind: CmpKind, status: u32, sp_rel: u32) {
        let skip = self.asm.buf.new_label();
        self.asm.b_cond(cond(invert(kind)), skip);
        self.emit_exit(status, None, sp_rel, false);
        self.asm.buf.bind_label(skip);
    }

    // ---- prologue helpers --------------------------------------------

    fn stack_headroom_cmp(&mut self) {
        let scratch = regs::scratch();
        let scratch2 = regs::scratch2();
        self.asm
            .load_zx(scratch, regs::engine(), ENGINE_VALUE_STACK_LEN, 8);
        self.asm
            .load_zx(scratch2, regs::engine(), ENGINE_STACK_BASE_POINTER, 8);
        self.asm.sub_rr(scratch2, scratch, true);
        self.asm.mov_ceil(scratch2);
        self.asm.cmp_rr(scratch, scratch2, true);
    }

    fn reload_stack_base(&mut self) {
        let base = regs::stack_base();
        self.asm
            .load_zx(base, regs::engine(), ENGINE_STACK_BASE_POINTER, 8);
        self.asm.lsl_imm(3, base, true);
        self.asm
            .load_zx(regs::scratch(), regs::engine(), ENGINE_VALUE_STACK_ELEMENT0, 8);
        self.asm.add_rr(regs::scratch(), base, true);
    }

    fn reload_memory_cache(&mut self) {
        let scratch = regs::scratch();
        self.asm
            .load_zx(scratch, regs::engine(), ENGINE_MEMORY_INSTANCE, 8);
        self.asm
            .load_zx(regs::memory_base(), scratch, MEMORY_INSTANCE_BUFFER, 8);
        self.asm
            .store(regs::memory_base(), regs::engine(), ENGINE_MEMORY_ELEMENT0, 8);
        self.asm
            .load_zx(scratch, scratch, MEMORY_INSTANCE_BUFFER_LEN, 8);
        self.asm.store(scratch, regs::engine(), ENGINE_MEMORY_LEN, 8);
    }

    fn init_module_context(&mut self, uses: ResourceUses) {
        let scratch = regs::scratch();
        let engine = regs::engine();
        let instance = regs::module_instance();
        self.asm.store(instance, engine, ENGINE_MODULE_INSTANCE, 8);
        if uses.globals {
            self.asm
                .load_zx(scratch, instance, MODULE_INSTANCE_GLOBALS_ELEMENT0, 8);
            self.asm.store(scratch, engine, ENGINE_GLOBALS_ELEMENT0, 8);
        }
        if uses.memory {
            self.asm.load_zx(scratch, instance, MODULE_INSTANCE_MEMORY, 8);
            self.asm.store(scratch, engine, ENGINE_MEMORY_INSTANCE, 8);
            self.reload_memory_cache();
        }
        if uses.tables {
            self.asm
                .load_zx(scratch, instance, MODULE_INSTANCE_TABLES_ELEMENT0, 8);
            self.asm.store(scratch, engine, ENGINE_TABLES_ELEMENT0, 8);
            self.asm
                .load_zx(scratch, instance, MODULE_INSTANCE_TABLES_LEN, 8);
            self.asm.store(scratch, engine, ENGINE_TABLES_LEN, 8);
            self.asm
                .load_zx(scratch, instance, MODULE_INSTANCE_TYPE_IDS_ELEMENT0, 8);
            self.asm.store(scratch, engine, ENGINE_TYPE_IDS_ELEMENT0, 8);
        }
        if uses.functions {
            self.asm
                .load_zx(scratch, instance, MODULE_INSTANCE_FUNCTIONS_ELEMENT0, 8);
            self.asm.store(scratch, engine, ENGINE_FUNCTIONS_ELEMENT0, 8);
        }
        if uses.data_instances {
            self.asm
                .load_zx(scratch, instance, MODULE_INSTANCE_DATA_INSTANCES_ELEMENT0, 8);
            self.asm
                .store(scratch, engine, ENGINE_DATA_INSTANCES_ELEMENT0, 8);
        }
        if uses.element_instances {
            self.asm.load_zx(
                scratch,
                instance,
                MODULE_INSTANCE_ELEMENT_INSTANCES_ELEMENT0,
                8,
            );
            self.asm
                .store(scratch, engine, ENGINE_ELEMENT_INSTANCES_ELEMENT0, 8);
        }
    }

    fn function_return(&mut self, frame_rel: u32, result_slots: u32, ra_tmp: Reg) {
        let scratch = regs::scratch();
        let (base, off) = self.based(regs::stack_base(), Self::slot_off(frame_rel + 1), 8);
        self.asm.load_zx(scratch, base, off, 8);
        self.asm
            .store(scratch, regs::engine(), ENGINE_STACK_BASE_POINTER, 8);
        let (base, off) = self.based(regs::stack_base(), Self::slot_off(frame_rel), 8);
        self.asm.load_zx(ra_tmp, base, off, 8);
        let to_caller = self.asm.buf.new_label();
        self.asm.cmp_imm(ra_tmp, 0, true);
        self.asm.b_cond(Cond::Ne, to_caller);
        self.emit_exit(STATUS_RETURNED, None, result_slots, false);
        self.asm.buf.bind_label(to_caller);
        self.asm.br(ra_tmp);
    }

    // ---- moves and slots ---------------------------------------------

    fn mov_rr(&mut self, src: Reg, dst: Reg, size: OperandSize) {
        if src.is_float() {
            self.v_mov(src, dst);
        } else {
            self.asm.mov_rr(src, dst, wide(size));
        }
    }

    fn mov_imm(&mut self, dst: Reg, imm: u64, size: OperandSize) {
        let value = if wide(size) { imm } else { imm & 0xffff_ffff };
        self.asm.mov_imm(dst, value);
    }

    fn mov_float_imm(&mut self, dst: Reg, bits: u64, size: OperandSize) {
        self.asm.mov_imm(regs::scratch(), bits);
        self.asm.fmov_to_fp(regs::scratch(), dst, wide(size));
    }

    fn load_slot(&mut self, dst: Reg, slot: u32, ty: SlotType) {
        let off = Self::slot_off(slot);
        match ty {
            SlotType::I32 => {
                let (base, off) = self.based(regs::stack_base(), off, 4);
                self.asm.load_zx(dst, base, off, 4);
            }
            SlotType::I64 => {
                let (base, off) = self.based(regs::stack_base(), off, 8);
                self.asm.load_zx(dst, base, off, 8);
            }
            SlotType::F32 => {
                let (base, off) = self.based(regs::stack_base(), off, 4);
                self.asm.fload(dst, base, off, 4);
            }
            SlotType::F64 => {
                let (base, off) = self.based(regs::stack_base(), off, 8);
                self.asm.fload(dst, base, off, 8);
            }
            _ => unreachable!("v128 slots use the vector accessors"),
        }
    }

    fn store_slot(&mut self, src: Reg, slot: u32, ty: SlotType) {
        let off = Self::slot_off(slot);
        match ty {
            SlotType::I32 | SlotType::I64 => {
                let (base, off) = self.based(regs::stack_base(), off, 8);
                self.asm.store(src, base, off, 8);
            }
            SlotType::F32 => {
                let (base, off) = self.based(regs::stack_base(), off, 4);
                self.asm.fstore(src, base, off, 4);
            }
            SlotType::F64 => {
                let (base, off) = self.based(regs::stack_base(), off, 8);
                self.asm.fstore(src, base, off, 8);
            }
            _ => unreachable!("v128 slots use the vector accessors"),
        }
    }

    fn load_slot_v128(&mut self, dst: Reg, slot: u32) {
        let addr = self.slot_addr_v128(slot);
        self.asm.fload(dst, addr, 0, 16);
    }

    fn store_slot_v128(&mut self, src: Reg, slot: u32) {
        let addr = self.slot_addr_v128(slot);
        self.asm.fstore(src, addr, 0, 16);
    }

    fn load_engine(&mut self, dst: Reg, offset: u32) {
        self.asm.load_zx(dst, regs::engine(), offset, 8);
    }

    fn store_engine(&mut self, src: Reg, offset: u32) {
        self.asm.store(src, regs::engine(), offset, 8);
    }

    fn load_mem64(&mut self, dst: Reg, base: Reg, offset: u32) {
        let (base, off) = self.based(base, offset, 8);
        self.asm.load_zx(dst, base, off, 8);
    }

    fn store_mem64(&mut self, src: Reg, base: Reg, offset: u32) {
        let (base, off) = self.based(base, offset, 8);
        self.asm.store(src, base, off, 8);
    }

    fn load_indexed64(&mut self, dst: Reg, base: Reg, index: Reg, shift: u8) {
        self.asm.load_indexed(dst, base, index, shift, 8);
    }

    fn store_indexed64(&mut self, src: Reg, base: Reg, index: Reg, shift: u8) {
        self.asm.store_indexed(src, base, index, shift, 8);
    }

    // ---- scalar integer ----------------------------------------------

    fn alu_rr(&mut self, op: AluOp, src: Reg, dst: Reg, size: OperandSize) {
        let w = wide(size);
        match op {
            AluOp::Add => self.asm.add_rr(src, dst, w),
            AluOp::Sub => self.asm.sub_rr(src, dst, w),
            AluOp::And => self.asm.and_rr(src, dst, w),
            AluOp::Or => self.asm.orr_rr(src, dst, w),
            AluOp::Xor => self.asm.eor_rr(src, dst, w),
            AluOp::Mul => self.asm.mul_rr(src, dst, w),
        }
    }

    fn alu_imm(&mut self, op: AluOp, imm: i32, dst: Reg, size: OperandSize) {
        let w = wide(size);
        match op {
            AluOp::Add if imm >= 0 && imm < 4096 => self.asm.add_imm(imm as u32, dst, w),
            AluOp::Sub if imm >= 0 && imm < 4096 => self.asm.sub_imm(imm as u32, dst, w),
            _ => {
                let scratch = regs::scratch2();
                self.asm.mov_imm(scratch, imm as i64 as u64);
                self.alu_rr(op, scratch, dst, size);
            }
        }
    }

    fn shift_rr(&mut self, kind: ShiftKind, amount: Reg, dst: Reg, size: OperandSize) {
        let w = wide(size);
        match kind {
            ShiftKind::Shl => self.asm.lslv(amount, dst, w),
            ShiftKind::ShrU => self.asm.lsrv(amount, dst, w),
            ShiftKind::ShrS => self.asm.asrv(amount, dst, w),
            ShiftKind::Rotr => self.asm.rorv(amount, dst, w),
            ShiftKind::Rotl => {
                // rotl(x, n) = rotr(x, width - n).
                let scratch = regs::scratch();
                self.asm.neg(amount, scratch, w);
                self.asm.rorv(scratch, dst, w);
            }
        }
    }

    fn shift_imm(&mut self, kind: ShiftKind, imm: u8, dst: Reg, size: OperandSize) {
        let w = wide(size);
        match kind {
            ShiftKind::Shl => self.asm.lsl_imm(imm, dst, w),
            ShiftKind::ShrU => self.asm.lsr_imm(imm, dst, w),
            ShiftKind::ShrS => self.asm.asr_imm(imm, dst, w),
            ShiftKind::Rotr => self.asm.ror_imm(imm, dst, w),
            ShiftKind::Rotl => {
                let bits = size.bits();
                self.asm.ror_imm(bits.wrapping_sub(imm) & (bits - 1), dst, w);
            }
        }
    }

    fn div_rem(&mut self, op: DivRem, divisor: Reg, dividend: (Reg, Reg), size: OperandSize,
        sp_rel: u32) {
        let w = wide(size);
        let (d0, d1) = dividend;
        self.asm.cmp_imm(divisor, 0, w);
        self.trap_if(CmpKind::Eq, STATUS_INTEGER_DIVISION_BY_ZERO, sp_rel);
        match (op.sign, op.rem) {
            (Sign::Signed, false) => {
                let safe = self.asm.buf.new_label();
                self.asm.cmn_imm(divisor, 1, w);
                self.asm.b_cond(Cond::Ne, safe);
                let min = if w { i64::MIN as u64 } else { i32::MIN as u32 as u64 };
                self.asm.mov_imm(regs::scratch(), min);
                self.asm.cmp_rr(d0, regs::scratch(), w);
                self.trap_if(CmpKind::Eq, STATUS_INTEGER_OVERFLOW, sp_rel);
                self.asm.buf.bind_label(safe);
                self.asm.sdiv(d0, d0, divisor, w);
            }
            (Sign::Signed, true) => {
                let divide = self.asm.buf.new_label();
                let done = self.asm.buf.new_label();
                self.asm.cmn_imm(divisor, 1, w);
                self.asm.b_cond(Cond::Ne, divide);
                self.asm.mov_imm(d0, 0);
                self.asm.b(done);
                self.asm.buf.bind_label(divide);
                self.asm.sdiv(d1, d0, divisor, w);
                self.asm.msub(d0, d1, divisor, d0, w);
                self.asm.buf.bind_label(done);
            }
            (Sign::Unsigned, false) => self.asm.udiv(d0, d0, divisor, w),
            (Sign::Unsigned, true) => {
                self.asm.udiv(d1, d0, divisor, w);
                self.asm.msub(d0, d1, divisor, d0, w);
            }
        }
    }

    fn bit_count(&mut self, op: BitCountOp, src: Reg, dst: Reg, size: OperandSize) {
        let w = wide(size);
        match op {
            BitCountOp::Clz => self.asm.clz(src, dst, w),
            BitCountOp::Ctz => {
                self.asm.rbit(src, dst, w);
                self.asm.clz(dst, dst, w);
            }
            BitCountOp::Popcnt => {
                let sv = regs::scratch_v();
                self.asm.fmov_to_fp(src, sv, true);
                // cnt v.8b, addv b, back to the register file.
                self.asm.v_raw2(0x0e20_5800, sv, sv);
                self.asm.v_raw2(0x0e31_b800, sv, sv);
                self.asm.v_raw2(0x0e01_3c00, sv, dst);
            }
        }
    }

    fn extend(&mut self, src: Reg, dst: Reg, ext: Extend) {
        match (ext.from_bits, ext.signed) {
            (32, false) => self.asm.mov_rr(src, dst, false),
            (32, true) => {
                if ext.to_bits == 64 {
                    self.asm.sext(src, dst, 32, true);
                } else {
                    self.asm.mov_rr(src, dst, false);
                }
            }
            (from, true) => self.asm.sext(src, dst, from, ext.to_bits == 64),
            (from, false) => self.asm.uext(src, dst, from),
        }
    }

    fn cmp_rr(&mut self, lhs: Reg, rhs: Reg, size: OperandSize) {
        self.asm.cmp_rr(lhs, rhs, wide(size));
    }

    fn cmp_imm(&mut self, lhs: Reg, imm: i32, size: OperandSize) {
        if imm >= 0 && imm < 4096 {
            self.asm.cmp_imm(lhs, imm as u32, wide(size));
        } else if imm < 0 && imm > -4096 {
            self.asm.cmn_imm(lhs, (-imm) as u32, wide(size));
        } else {
            let scratch = regs::scratch2();
            self.asm.mov_imm(scratch, imm as i64 as u64);
            self.asm.cmp_rr(lhs, scratch, wide(size));
        }
    }

    fn setcc(&mut self, kind: CmpKind, dst: Reg) {
        self.asm.cset(cond(kind), dst);
    }

    fn select_rr(&mut self, kind: CmpKind, src: Reg, dst: Reg, ty: SlotType) {
        if dst.is_int() {
            // Keep dst when the condition holds, else src.
            self.asm.csel(cond(kind), dst, src, dst, true);
        } else {
            let keep = self.asm.buf.new_label();
            self.asm.b_cond(cond(kind), keep);
            self.v_mov(src, dst);
            self.asm.buf.bind_label(keep);
            let _ = ty;
        }
    }

    // ---- scalar float -------------------------------------------------

    fn float_alu(&mut self, op: FloatAluOp, src: Reg, dst: Reg, size: OperandSize) {
        let base = match (op, wide(size)) {
            (FloatAluOp::Add, false) => 0x1e20_2800,
            (FloatAluOp::Add, true) => 0x1e60_2800,
            (FloatAluOp::Sub, false) => 0x1e20_3800,
            (FloatAluOp::Sub, true) => 0x1e60_3800,
            (FloatAluOp::Mul, false) => 0x1e20_0800,
            (FloatAluOp::Mul, true) => 0x1e60_0800,
            (FloatAluOp::Div, false) => 0x1e20_1800,
            (FloatAluOp::Div, true) => 0x1e60_1800,
        };
        self.asm.fp_rrr(base, src, dst, dst);
    }

    fn float_min_max(&mut self, is_max: bool, src: Reg, dst: Reg, size: OperandSize, _tmp: Reg) {
        // fmin/fmax have exactly the required NaN and signed-zero
        // behaviour.
        let base = match (is_max, wide(size)) {
            (false, false) => 0x1e20_5800,
            (false, true) => 0x1e60_5800,
            (true, false) => 0x1e20_4800,
            (true, true) => 0x1e60_4800,
        };
        self.asm.fp_rrr(base, src, dst, dst);
    }

    fn float_unop(&mut self, op: FloatUnOp, dst: Reg, size: OperandSize) {
        let w = wide(size);
        let base = match op {
            FloatUnOp::Abs => {
                if w {
                    0x1e60_c000
                } else {
                    0x1e20_c000
                }
            }
            FloatUnOp::Neg => {
                if w {
                    0x1e61_4000
                } else {
                    0x1e21_4000
                }
            }
            FloatUnOp::Sqrt => {
                if w {
                    0x1e61_c000
                } else {
                    0x1e21_c000
                }
            }
            FloatUnOp::Ceil => {
                if w {
                    0x1e64_c000
                } else {
                    0x1e24_c000
                }
            }
            FloatUnOp::Floor => {
                if w {
                    0x1e65_4000
                } else {
                    0x1e25_4000
                }
            }
            FloatUnOp::Trunc => {
                if w {
                    0x1e65_c000
                } else {
                    0x1e25_c000
                }
            }
            FloatUnOp::Nearest => {
                if w {
                    0x1e64_4000
                } else {
                    0x1e24_4000
                }
            }
        };
        self.asm.fp_rr(base, dst, dst);
    }

    fn float_copysign(&mut self, src: Reg, dst: Reg, size: OperandSize, tmp: Reg) {
        // Move the sign bit over through the register file.
        let scratch = regs::scratch();
        let scratch2 = regs::scratch2();
        let w = wide(size);
        self.asm.fmov_from_fp(src, scratch, w);
        self.asm.fmov_from_fp(dst, scratch2, w);
        let bits = if w { 63 } else { 31 };
        self.asm.lsr_imm(bits, scratch, w);
        self.asm.lsl_imm(bits, scratch, w);
        self.asm.lsl_imm(1, scratch2, w);
        self.asm.lsr_imm(1, scratch2, w);
        self.asm.orr_rr(scratch, scratch2, w);
        self.asm.fmov_to_fp(scratch2, dst, w);
        let _ = tmp;
    }

    fn float_cmp(&mut self, kind: FloatCmpKind, lhs: Reg, rhs: Reg, dst: Reg, size: OperandSize) {
        self.asm.fcmp(lhs, rhs, wide(size));
        let cc = match kind {
            FloatCmpKind::Eq => Cond::Eq,
            FloatCmpKind::Ne => Cond::Ne,
            FloatCmpKind::Lt => Cond::Mi,
            FloatCmpKind::Gt => Cond::Gt,
            FloatCmpKind::Le => Cond::Ls,
            FloatCmpKind::Ge => Cond::Ge,
        };
        self.asm.cset(cc, dst);
    }

    fn float_demote(&mut self, dst: Reg) {
        self.asm.fp_rr(0x1e62_4000, dst, dst);
    }

    fn float_promote(&mut self, dst: Reg) {
        self.asm.fp_rr(0x1e22_c000, dst, dst);
    }

    fn int_to_float(&mut self, src: Reg, dst: Reg, int: IntTy, float: FloatTy, sign: Sign,
        _tmp_gp: Reg) {
        let base = match (float, int, sign) {
            (FloatTy::F32, IntTy::I32, Sign::Signed) => 0x1e22_0000,
            (FloatTy::F32, IntTy::I32, Sign::Unsigned) => 0x1e23_0000,
            (FloatTy::F32, IntTy::I64, Sign::Signed) => 0x9e22_0000,
            (FloatTy::F32, IntTy::I64, Sign::Unsigned) => 0x9e23_0000,
            (FloatTy::F64, IntTy::I32, Sign::Signed) => 0x1e62_0000,
            (FloatTy::F64, IntTy::I32, Sign::Unsigned) => 0x1e63_0000,
            (FloatTy::F64, IntTy::I64, Sign::Signed) => 0x9e62_0000,
            (FloatTy::F64, IntTy::I64, Sign::Unsigned) => 0x9e63_0000,
        };
        self.asm.fp_rr(base, src, dst);
    }

    fn float_to_int(&mut self, src: Reg, dst: Reg, float: FloatTy, int: IntTy, sign: Sign,
        saturating: bool, tmp_fp: Reg, sp_rel: u32) {
        let double = float == FloatTy::F64;
        if !saturating {
            // fcvtz* saturates silently; the trapping semantics need the
            // NaN and range checks up front.
            self.asm.fcmp(src, src, double);
            self.trap_if_unordered(sp_rel);
            let (lo, lo_inclusive, hi) = trunc_bounds(float, int, sign);
            let lo_label = self.asm.buf.add_const16(lit64(lo));
            self.asm
                .ldr_fp_literal(tmp_fp, lo_label, if double { 8 } else { 4 });
            self.asm.fcmp(src, tmp_fp, double);
            if lo_inclusive {
                self.trap_if_cond(Cond::Mi, STATUS_INTEGER_OVERFLOW, sp_rel);
            } else {
                self.trap_if_cond(Cond::Ls, STATUS_INTEGER_OVERFLOW, sp_rel);
            }
            let hi_label = self.asm.buf.add_const16(lit64(hi));
            self.asm
                .ldr_fp_literal(tmp_fp, hi_label, if double { 8 } else { 4 });
            self.asm.fcmp(src, tmp_fp, double);
            self.trap_if_cond(Cond::Ge, STATUS_INTEGER_OVERFLOW, sp_rel);
        }
        let base = match (int, sign, double) {
            (IntTy::I32, Sign::Signed, false) => 0x1e38_0000,
            (IntTy::I32, Sign::Unsigned, false) => 0x1e39_0000,
            (IntTy::I64, Sign::Signed, false) => 0x9e38_0000,
            (IntTy::I64, Sign::Unsigned, false) => 0x9e39_0000,
            (IntTy::I32, Sign::Signed, true) => 0x1e78_0000,
            (IntTy::I32, Sign::Unsigned, true) => 0x1e79_0000,
            (IntTy::I64, Sign::Signed, true) => 0x9e78_0000,
            (IntTy::I64, Sign::Unsigned, true) => 0x9e79_0000,
        };
        self.asm.fp_rr(base, src, dst);
    }

    fn reinterpret_float_to_int(&mut self, src: Reg, dst: Reg, size: OperandSize) {
        self.asm.fmov_from_fp(src, dst, wide(size));
    }

    fn reinterpret_int_to_float(&mut self, src: Reg, dst: Reg, size: OperandSize) {
        self.asm.fmov_to_fp(src, dst, wide(size));
    }

    // ---- linear memory ------------------------------------------------

    fn memory_access(&mut self, addr: Reg, offset: u32, width: u8, check_align: bool,
        sp_rel: u32) {
        let scratch = regs::scratch();
        if check_align && width > 1 {
            self.asm.mov_rr(addr, scratch, true);
            self.add_imm_any(offset as u64, scratch);
            self.asm.mov_imm(regs::scratch2(), (width - 1) as u64);
            self.asm.tst_rr(scratch, regs::scratch2(), true);
            self.trap_if(CmpKind::Ne, STATUS_UNALIGNED_ATOMIC, sp_rel);
        }
        self.asm.mov_rr(addr, scratch, true);
        self.add_imm_any(offset as u64 + width as u64, scratch);
        self.cmp_engine_field(scratch, ENGINE_MEMORY_LEN);
        self.trap_if(CmpKind::GtU, STATUS_MEMORY_OUT_OF_BOUNDS, sp_rel);
        self.add_imm_any(offset as u64, addr);
        self.asm.add_rr(regs::memory_base(), addr, true);
    }

    fn wasm_load(&mut self, dst: Reg, addr: Reg, kind: LoadKind) {
        match kind {
            LoadKind::Int { ty, width, sign } => match (sign, width) {
                (Sign::Unsigned, w) => self.asm.load_zx(dst, addr, 0, w / 8),
                (Sign::Signed, 64) => self.asm.load_zx(dst, addr, 0, 8),
                (Sign::Signed, w) => self.asm.load_sx(dst, addr, 0, w / 8, ty.bits()),
            },
            LoadKind::F32 => self.asm.fload(dst, addr, 0, 4),
            LoadKind::F64 => self.asm.fload(dst, addr, 0, 8),
        }
    }

    fn wasm_store(&mut self, src: Reg, addr: Reg, kind: StoreKind) {
        match kind {
            StoreKind::Int { width } => self.asm.store(src, addr, 0, width / 8),
            StoreKind::F32 => self.asm.fstore(src, addr, 0, 4),
            StoreKind::F64 => self.asm.fstore(src, addr, 0, 8),
        }
    }

    fn memory_copy_loop(&mut self, dst: Reg, src: Reg, len: Reg, sp_rel: u32) {
        let scratch = regs::scratch();
        self.asm.mov_rr(src, scratch, true);
        self.asm.add_rr(len, scratch, true);
        self.cmp_engine_field(scratch, ENGINE_MEMORY_LEN);
        self.trap_if(CmpKind::GtU, STATUS_MEMORY_OUT_OF_BOUNDS, sp_rel);
        self.asm.mov_rr(dst, scratch, true);
        self.asm.add_rr(len, scratch, true);
        self.cmp_engine_field(scratch, ENGINE_MEMORY_LEN);
        self.trap_if(CmpKind::GtU, STATUS_MEMORY_OUT_OF_BOUNDS, sp_rel);

        let (backward, forward, done) = (
            self.asm.buf.new_label(),
            self.asm.buf.new_label(),
            self.asm.buf.new_label(),
        );
        self.asm.cmp_imm(len, 0, true);
        self.asm.b_cond(Cond::Eq, done);
        self.asm.add_rr(regs::memory_base(), src, true);
        self.asm.add_rr(regs::memory_base(), dst, true);
        self.asm.cmp_rr(dst, src, true);
        self.asm.b_cond(Cond::Hi, backward);

        self.asm.buf.bind_label(forward);
        self.asm.load_zx(scratch, src, 0, 1);
        self.asm.store(scratch, dst, 0, 1);
        self.asm.add_imm(1, src, true);
        self.asm.add_imm(1, dst, true);
        self.asm.sub_imm(1, len, true);
        self.asm.cmp_imm(len, 0, true);
        self.asm.b_cond(Cond::Ne, forward);
        self.asm.b(done);

        self.asm.buf.bind_label(backward);
        let bwd = self.asm.buf.new_label();
        self.asm.buf.bind_label(bwd);
        self.asm.sub_imm(1, len, true);
        self.asm.load_indexed(scratch, src, len, 0, 1);
        self.asm.store_indexed(scratch, dst, len, 0, 1);
        self.asm.cmp_imm(len, 0, true);
        self.asm.b_cond(Cond::Ne, bwd);

        self.asm.buf.bind_label(done);
    }

    fn memory_fill_loop(&mut self, dst: Reg, val: Reg, len: Reg, sp_rel: u32) {
        let scratch = regs::scratch();
        self.asm.mov_rr(dst, scratch, true);
        self.asm.add_rr(len, scratch, true);
        self.cmp_engine_field(scratch, ENGINE_MEMORY_LEN);
        self.trap_if(CmpKind::GtU, STATUS_MEMORY_OUT_OF_BOUNDS, sp_rel);

        let (head, done) = (self.asm.buf.new_label(), self.asm.buf.new_label());
        self.asm.cmp_imm(len, 0, true);
        self.asm.b_cond(Cond::Eq, done);
        self.asm.add_rr(regs::memory_base(), dst, true);
        self.asm.buf.bind_label(head);
        self.asm.store(val, dst, 0, 1);
        self.asm.add_imm(1, dst, true);
        self.asm.sub_imm(1, len, true);
        self.asm.cmp_imm(len, 0, true);
        self.asm.b_cond(Cond::Ne, head);
        self.asm.buf.bind_label(done);
    }

    fn memory_init_loop(&mut self, dst: Reg, src: Reg, len: Reg, tmp: Reg, data_index: u32,
        sp_rel: u32) {
        let scratch = regs::scratch();
        let record = data_index * 16;
        self.load_engine(scratch, ENGINE_DATA_INSTANCES_ELEMENT0);
        self.load_mem64(scratch, scratch, record + PASSIVE_INSTANCE_LEN);
        self.asm.mov_rr(src, tmp, true);
        self.asm.add_rr(len, tmp, true);
        self.asm.cmp_rr(tmp, scratch, true);
        self.trap_if(CmpKind::GtU, STATUS_MEMORY_OUT_OF_BOUNDS, sp_rel);
        self.asm.mov_rr(dst, tmp, true);
        self.asm.add_rr(len, tmp, true);
        self.cmp_engine_field(tmp, ENGINE_MEMORY_LEN);
        self.trap_if(CmpKind::GtU, STATUS_MEMORY_OUT_OF_BOUNDS, sp_rel);

        let (head, done) = (self.asm.buf.new_label(), self.asm.buf.new_label());
        self.asm.cmp_imm(len, 0, true);
        self.asm.b_cond(Cond::Eq, done);
        self.load_engine(scratch, ENGINE_DATA_INSTANCES_ELEMENT0);
        self.load_mem64(scratch, scratch, record + PASSIVE_INSTANCE_PTR);
        self.asm.add_rr(scratch, src, true);
        self.asm.add_rr(regs::memory_base(), dst, true);
        self.asm.buf.bind_label(head);
        self.asm.load_zx(tmp, src, 0, 1);
        self.asm.store(tmp, dst, 0, 1);
        self.asm.add_imm(1, src, true);
        self.asm.add_imm(1, dst, true);
        self.asm.sub_imm(1, len, true);
        self.asm.cmp_imm(len, 0, true);
        self.asm.b_cond(Cond::Ne, head);
        self.asm.buf.bind_label(done);
    }

    fn table_copy_loop(&mut self, dst_table: u32, src_table: u32, dst: Reg, src: Reg, len: Reg,
        tmp: Reg, sp_rel: u32) {
        let scratch = regs::scratch();
        self.load_engine(scratch, ENGINE_TABLES_ELEMENT0);
        self.load_mem64(scratch, scratch, src_table * 8);
        self.asm.mov_rr(src, tmp, true);
        self.asm.add_rr(len, tmp, true);
        self.load_mem64(regs::scratch2(), scratch, TABLE_INSTANCE_REFERENCES_LEN);
        self.asm.cmp_rr(tmp, regs::scratch2(), true);
        self.trap_if(CmpKind::GtU, STATUS_INVALID_TABLE_ACCESS, sp_rel);
        self.load_engine(scratch, ENGINE_TABLES_ELEMENT0);
        self.load_mem64(scratch, scratch, dst_table * 8);
        self.asm.mov_rr(dst, tmp, true);
        self.asm.add_rr(len, tmp, true);
        self.load_mem64(regs::scratch2(), scratch, TABLE_INSTANCE_REFERENCES_LEN);
        self.asm.cmp_rr(tmp, regs::scratch2(), true);
        self.trap_if(CmpKind::GtU, STATUS_INVALID_TABLE_ACCESS, sp_rel);

        let (backward, forward, done) = (
            self.asm.buf.new_label(),
            self.asm.buf.new_label(),
            self.asm.buf.new_label(),
        );
        self.asm.cmp_imm(len, 0, true);
        self.asm.b_cond(Cond::Eq, done);
        self.load_mem64(scratch, scratch, TABLE_INSTANCE_REFERENCES);
        self.asm.lsl_imm(3, dst, true);
        self.asm.add_rr(scratch, dst, true);
        self.load_engine(scratch, ENGINE_TABLES_ELEMENT0);
        self.load_mem64(scratch, scratch, src_table * 8);
        self.load_mem64(scratch, scratch, TABLE_INSTANCE_REFERENCES);
        self.asm.lsl_imm(3, src, true);
        self.asm.add_rr(scratch, src, true);
        self.asm.cmp_rr(dst, src, true);
        self.asm.b_cond(Cond::Hi, backward);

        self.asm.buf.bind_label(forward);
        self.asm.load_zx(scratch, src, 0, 8);
        self.asm.store(scratch, dst, 0, 8);
        self.asm.add_imm(8, src, true);
        self.asm.add_imm(8, dst, true);
        self.asm.sub_imm(1, len, true);
        self.asm.cmp_imm(len, 0, true);
        self.asm.b_cond(Cond::Ne, forward);
        self.asm.b(done);

        self.asm.buf.bind_label(backward);
        let bwd = self.asm.buf.new_label();
        self.asm.buf.bind_label(bwd);
        self.asm.sub_imm(1, len, true);
        self.asm.load_indexed(scratch, src, len, 3, 8);
        self.asm.store_indexed(scratch, dst, len, 3, 8);
        self.asm.cmp_imm(len, 0, true);
        self.asm.b_cond(Cond::Ne, bwd);

        self.asm.buf.bind_label(done);
    }

    fn table_init_loop(&mut self, table_index: u32, elem_index: u32, dst: Reg, src: Reg,
        len: Reg, tmp: Reg, sp_rel: u32) {
        let scratch = regs::scratch();
        let record = elem_index * 16;
        self.load_engine(scratch, ENGINE_ELEMENT_INSTANCES_ELEMENT0);
        self.load_mem64(scratch, scratch, record + PASSIVE_INSTANCE_LEN);
        self.asm.mov_rr(src, tmp, true);
        self.asm.add_rr(len, tmp, true);
        self.asm.cmp_rr(tmp, scratch, true);
        self.trap_if(CmpKind::GtU, STATUS_INVALID_TABLE_ACCESS, sp_rel);
        self.load_engine(scratch, ENGINE_TABLES_ELEMENT0);
        self.load_mem64(scratch, scratch, table_index * 8);
        self.asm.mov_rr(dst, tmp, true);
        self.asm.add_rr(len, tmp, true);
        self.load_mem64(regs::scratch2(), scratch, TABLE_INSTANCE_REFERENCES_LEN);
        self.asm.cmp_rr(tmp, regs::scratch2(), true);
        self.trap_if(CmpKind::GtU, STATUS_INVALID_TABLE_ACCESS, sp_rel);

        let (head, done) = (self.asm.buf.new_label(), self.asm.buf.new_label());
        self.asm.cmp_imm(len, 0, true);
        self.asm.b_cond(Cond::Eq, done);
        self.load_mem64(scratch, scratch, TABLE_INSTANCE_REFERENCES);
        self.asm.lsl_imm(3, dst, true);
        self.asm.add_rr(scratch, dst, true);
        self.load_engine(scratch, ENGINE_ELEMENT_INSTANCES_ELEMENT0);
        self.load_mem64(scratch, scratch, record + PASSIVE_INSTANCE_PTR);
        self.asm.lsl_imm(3, src, true);
        self.asm.add_rr(scratch, src, true);
        self.asm.buf.bind_label(head);
        self.asm.load_zx(tmp, src, 0, 8);
        self.asm.store(tmp, dst, 0, 8);
        self.asm.add_imm(8, src, true);
        self.asm.add_imm(8, dst, true);
        self.asm.sub_imm(1, len, true);
        self.asm.cmp_imm(len, 0, true);
        self.asm.b_cond(Cond::Ne, head);
        self.asm.buf.bind_label(done);
    }

    // ---- atomics ------------------------------------------------------

    fn atomic_load(&mut self, dst: Reg, addr: Reg, _ty: IntTy, width: u8) {
        self.asm.ldar(dst, addr, width / 8);
    }

    fn atomic_store(&mut self, src: Reg, addr: Reg, width: u8) {
        self.asm.stlr(src, addr, width / 8);
    }

    fn atomic_rmw(&mut self, op: AtomicRmwOp, operand: Reg, dst: Reg, addr: Reg, _ty: IntTy,
        width: u8, tmp: Reg) {
        let bytes = width / 8;
        let w = width == 64;
        let retry = self.asm.buf.new_label();
        self.asm.buf.bind_label(retry);
        self.asm.ldaxr(dst, addr, bytes);
        match op {
            AtomicRmwOp::Add => {
                self.asm.mov_rr(dst, tmp, true);
                self.asm.add_rr(operand, tmp, w);
            }
            AtomicRmwOp::Sub => {
                self.asm.mov_rr(dst, tmp, true);
                self.asm.sub_rr(operand, tmp, w);
            }
            AtomicRmwOp::And => {
                self.asm.mov_rr(dst, tmp, true);
                self.asm.and_rr(operand, tmp, w);
            }
            AtomicRmwOp::Or => {
                self.asm.mov_rr(dst, tmp, true);
                self.asm.orr_rr(operand, tmp, w);
            }
            AtomicRmwOp::Xor => {
                self.asm.mov_rr(dst, tmp, true);
                self.asm.eor_rr(operand, tmp, w);
            }
            AtomicRmwOp::Xchg => {
                self.asm.mov_rr(operand, tmp, true);
            }
        }
        self.asm.stlxr(regs::scratch(), tmp, addr, bytes);
        self.asm.cbnz32(regs::scratch(), retry);
    }

    fn atomic_cmpxchg(&mut self, expected: Reg, replacement: Reg, addr: Reg, _ty: IntTy,
        width: u8, _tmp: Reg) {
        let bytes = width / 8;
        let w = width == 64;
        let retry = self.asm.buf.new_label();
        let done = self.asm.buf.new_label();
        self.asm.buf.bind_label(retry);
        self.asm.ldaxr(regs::scratch(), addr, bytes);
        self.asm.cmp_rr(regs::scratch(), expected, w);
        self.asm.b_cond(Cond::Ne, done);
        self.asm
            .stlxr(regs::scratch2(), replacement, addr, bytes);
        self.asm.cbnz32(regs::scratch2(), retry);
        self.asm.buf.bind_label(done);
        self.asm.mov_rr(regs::scratch(), expected, true);
    }

    fn fence(&mut self) {
        self.asm.dmb_ish();
    }

    // ---- vectors ------------------------------------------------------

    fn v128_const(&mut self, dst: Reg, lo: u64, hi: u64) {
        let mut lit = [0u8; 16];
        lit[0..8].copy_from_slice(&lo.to_le_bytes());
        lit[8..16].copy_from_slice(&hi.to_le_bytes());
        let label = self.asm.buf.add_const16(lit);
        self.asm.ldr_q_literal(dst, label);
    }

    fn v128_mov(&mut self, src: Reg, dst: Reg) {
        self.v_mov(src, dst);
    }

    fn v128_add(&mut self, shape: VecShape, src: Reg, dst: Reg) {
        match shape {
            VecShape::F32x4 => self.asm.v_raw(0x4e20_d400, src, dst, dst),
            VecShape::F64x2 => self.asm.v_raw(0x4e60_d400, src, dst, dst),
            _ => self.asm.v_rrr(0x4e20_8400, vsize(shape), src, dst, dst),
        }
    }

    fn v128_sub(&mut self, shape: VecShape, src: Reg, dst: Reg) {
        match shape {
            VecShape::F32x4 => self.asm.v_raw(0x4ea0_d400, src, dst, dst),
            VecShape::F64x2 => self.asm.v_raw(0x4ee0_d400, src, dst, dst),
            _ => self.asm.v_rrr(0x6e20_8400, vsize(shape), src, dst, dst),
        }
    }

    fn v128_mul(&mut self, shape: VecShape, src: Reg, dst: Reg, _tmp: Reg) {
        match shape {
            VecShape::F32x4 => self.asm.v_raw(0x6e20_dc00, src, dst, dst),
            VecShape::F64x2 => self.asm.v_raw(0x6e60_dc00, src, dst, dst),
            VecShape::I64x2 => {
                // No 64-lane NEON multiply; go through the register file.
                let (s1, s2) = (regs::scratch(), regs::scratch2());
                for lane in 0..2u32 {
                    let imm5 = (lane << 4) | 8;
                    self.asm.v_raw2(0x4e00_3c00 | imm5 << 16, dst, s1);
                    self.asm.v_raw2(0x4e00_3c00 | imm5 << 16, src, s2);
                    self.asm.mul_rr(s2, s1, true);
                    self.asm.v_raw2(0x4e00_1c00 | imm5 << 16, s1, dst);
                }
            }
            VecShape::I8x16 => unreachable!("i8x16 has no lanewise multiply"),
            _ => self.asm.v_rrr(0x4e20_9c00, vsize(shape), src, dst, dst),
        }
    }

    fn v128_neg(&mut self, shape: VecShape, dst: Reg) {
        match shape {
            VecShape::F32x4 => self.asm.v_raw2(0x6ea0_f800, dst, dst),
            VecShape::F64x2 => self.asm.v_raw2(0x6ee0_f800, dst, dst),
            _ => self.asm.v_rr(0x6e20_b800, vsize(shape), dst, dst),
        }
    }

    fn v128_abs(&mut self, shape: VecShape, dst: Reg) {
        match shape {
            VecShape::F32x4 => self.asm.v_raw2(0x4ea0_f800, dst, dst),
            VecShape::F64x2 => self.asm.v_raw2(0x4ee0_f800, dst, dst),
            _ => self.asm.v_rr(0x4e20_b800, vsize(shape), dst, dst),
        }
    }

    fn v128_min(&mut self, shape: VecShape, sign: Sign, src: Reg, dst: Reg, _tmp: Reg) {
        match shape {
            VecShape::F32x4 => self.asm.v_raw(0x4ea0_f400, src, dst, dst),
            VecShape::F64x2 => self.asm.v_raw(0x4ee0_f400, src, dst, dst),
            _ => {
                let base = if sign.is_signed() { 0x4e20_6c00 } else { 0x6e20_6c00 };
                self.asm.v_rrr(base, vsize(shape), src, dst, dst);
            }
        }
    }

    fn v128_max(&mut self, shape: VecShape, sign: Sign, src: Reg, dst: Reg, _tmp: Reg) {
        match shape {
            VecShape::F32x4 => self.asm.v_raw(0x4e20_f400, src, dst, dst),
            VecShape::F64x2 => self.asm.v_raw(0x4e60_f400, src, dst, dst),
            _ => {
                let base = if sign.is_signed() { 0x4e20_6400 } else { 0x6e20_6400 };
                self.asm.v_rrr(base, vsize(shape), src, dst, dst);
            }
        }
    }

    fn v128_avgr(&mut self, shape: VecShape, src: Reg, dst: Reg) {
        self.asm.v_rrr(0x6e20_1400, vsize(shape), src, dst, dst);
    }

    fn v128_add_sat(&mut self, shape: VecShape, sign: Sign, src: Reg, dst: Reg) {
        let base = if sign.is_signed() { 0x4e20_0c00 } else { 0x6e20_0c00 };
        self.asm.v_rrr(base, vsize(shape), src, dst, dst);
    }

    fn v128_sub_sat(&mut self, shape: VecShape, sign: Sign, src: Reg, dst: Reg) {
        let base = if sign.is_signed() { 0x4e20_2c00 } else { 0x6e20_2c00 };
        self.asm.v_rrr(base, vsize(shape), src, dst, dst);
    }

    fn v128_shl(&mut self, shape: VecShape, amount: Reg, dst: Reg, tmp: Reg) {
        let scratch = regs::scratch();
        self.asm.mov_rr(amount, scratch, false);
        self.asm.mov_imm(regs::scratch2(), (shape.lane_bits() - 1) as u64);
        self.asm.and_rr(regs::scratch2(), scratch, false);
        self.dup_gp(vsize(shape), scratch, tmp);
        self.asm.v_rrr(0x6e20_4400, vsize(shape), tmp, dst, dst);
    }

    fn v128_shr(&mut self, shape: VecShape, sign: Sign, amount: Reg, dst: Reg, tmp: Reg) {
        let scratch = regs::scratch();
        self.asm.mov_rr(amount, scratch, false);
        self.asm.mov_imm(regs::scratch2(), (shape.lane_bits() - 1) as u64);
        self.asm.and_rr(regs::scratch2(), scratch, false);
        self.asm.neg(scratch, scratch, false);
        self.dup_gp(vsize(shape), scratch, tmp);
        let base = if sign.is_signed() { 0x4e20_4400 } else { 0x6e20_4400 };
        self.asm.v_rrr(base, vsize(shape), tmp, dst, dst);
    }

    fn v128_cmp(&mut self, shape: VecShape, kind: CmpKind, src: Reg, dst: Reg, tmp: Reg) {
        use CmpKind::*;
        let size = vsize(shape);
        if shape.is_float() {
            let (eq, gt, ge) = if shape == VecShape::F64x2 {
                (0x4e60_e400u32, 0x6ee0_e400u32, 0x6e60_e400u32)
            } else {
                (0x4e20_e400, 0x6ea0_e400, 0x6e20_e400)
            };
            match kind {
                Eq => self.asm.v_raw(eq, src, dst, dst),
                Ne => {
                    self.asm.v_raw(eq, src, dst, dst);
                    self.v_not(dst, dst);
                }
                GtS | GtU => self.asm.v_raw(gt, src, dst, dst),
                GeS | GeU => self.asm.v_raw(ge, src, dst, dst),
                LtS | LtU => {
                    self.v_mov(dst, tmp);
                    self.asm.v_raw(gt, tmp, src, dst);
                }
                LeS | LeU => {
                    self.v_mov(dst, tmp);
                    self.asm.v_raw(ge, tmp, src, dst);
                }
            }
            return;
        }
        match kind {
            Eq => self.asm.v_rrr(0x6e20_8c00, size, src, dst, dst),
            Ne => {
                self.asm.v_rrr(0x6e20_8c00, size, src, dst, dst);
                self.v_not(dst, dst);
            }
            GtS => self.asm.v_rrr(0x4e20_3400, size, src, dst, dst),
            GeS => self.asm.v_rrr(0x4e20_3c00, size, src, dst, dst),
            GtU => self.asm.v_rrr(0x6e20_3400, size, src, dst, dst),
            GeU => self.asm.v_rrr(0x6e20_3c00, size, src, dst, dst),
            LtS => {
                self.v_mov(dst, tmp);
                self.asm
                    .v_rrr(0x4e20_3400, size, tmp, src, dst);
            }
            LeS => {
                self.v_mov(dst, tmp);
                self.asm
                    .v_rrr(0x4e20_3c00, size, tmp, src, dst);
            }
            LtU => {
                self.v_mov(dst, tmp);
                self.asm
                    .v_rrr(0x6e20_3400, size, tmp, src, dst);
            }
            LeU => {
                self.v_mov(dst, tmp);
                self.asm
                    .v_rrr(0x6e20_3c00, size, tmp, src, dst);
            }
        }
    }

    fn v128_and(&mut self, src: Reg, dst: Reg) {
        self.asm.v_raw(0x4e20_1c00, src, dst, dst);
    }

    fn v128_or(&mut self, src: Reg, dst: Reg) {
        self.asm.v_raw(0x4ea0_1c00, src, dst, dst);
    }

    fn v128_xor(&mut self, src: Reg, dst: Reg) {
        self.asm.v_raw(0x6e20_1c00, src, dst, dst);
    }

    fn v128_not(&mut self, dst: Reg) {
        self.v_not(dst, dst);
    }

    fn v128_andnot(&mut self, src: Reg, dst: Reg) {
        // bic vd, vn, vm = vn & ~vm.
        self.asm.v_raw(0x4e60_1c00, src, dst, dst);
    }

    fn v128_bitselect(&mut self, v1: Reg, v2: Reg, mask: Reg) {
        self.asm.v_raw(0x6e60_1c00, v2, v1, mask);
    }

    fn v128_splat(&mut self, shape: VecShape, src: Reg, dst: Reg) {
        match shape {
            VecShape::F32x4 => {
                let imm5 = 0b00100u32;
                self.asm.v_raw2(0x4e00_0400 | imm5 << 16, src, dst);
            }
            VecShape::F64x2 => {
                let imm5 = 0b01000u32;
                self.asm.v_raw2(0x4e00_0400 | imm5 << 16, src, dst);
            }
            _ => self.dup_gp(vsize(shape), src, dst),
        }
    }

    fn v128_extract_lane(&mut self, shape: VecShape, lane: u8, sign: Sign, src: Reg, dst: Reg) {
        let lane = lane as u32;
        match shape {
            VecShape::I8x16 => {
                let imm5 = (lane << 1) | 1;
                let base = if sign.is_signed() { 0x0e00_2c00 } else { 0x0e00_3c00 };
                self.asm.v_raw2(base | imm5 << 16, src, dst);
            }
            VecShape::I16x8 => {
                let imm5 = (lane << 2) | 2;
                let base = if sign.is_signed() { 0x0e00_2c00 } else { 0x0e00_3c00 };
                self.asm.v_raw2(base | imm5 << 16, src, dst);
            }
            VecShape::I32x4 => {
                let imm5 = (lane << 3) | 4;
                self.asm.v_raw2(0x0e00_3c00 | imm5 << 16, src, dst);
            }
            VecShape::I64x2 => {
                let imm5 = (lane << 4) | 8;
                self.asm.v_raw2(0x4e00_3c00 | imm5 << 16, src, dst);
            }
            VecShape::F32x4 => {
                let imm5 = (lane << 3) | 4;
                self.asm.v_raw2(0x5e00_0400 | imm5 << 16, src, dst);
            }
            VecShape::F64x2 => {
                let imm5 = (lane << 4) | 8;
                self.asm.v_raw2(0x5e00_0400 | imm5 << 16, src, dst);
            }
        }
    }

    fn v128_replace_lane(&mut self, shape: VecShape, lane: u8, src: Reg, dst: Reg) {
        let lane = lane as u32;
        match shape {
            VecShape::I8x16 => {
                let imm5 = (lane << 1) | 1;
                self.asm.v_raw2(0x4e00_1c00 | imm5 << 16, src, dst);
            }
            VecShape::I16x8 => {
                let imm5 = (lane << 2) | 2;
                self.asm.v_raw2(0x4e00_1c00 | imm5 << 16, src, dst);
            }
            VecShape::I32x4 => {
                let imm5 = (lane << 3) | 4;
                self.asm.v_raw2(0x4e00_1c00 | imm5 << 16, src, dst);
            }
            VecShape::I64x2 => {
                let imm5 = (lane << 4) | 8;
                self.asm.v_raw2(0x4e00_1c00 | imm5 << 16, src, dst);
            }
            VecShape::F32x4 => {
                let imm5 = (lane << 3) | 4;
                self.asm.v_raw2(0x6e00_0400 | imm5 << 16, src, dst);
            }
            VecShape::F64x2 => {
                let imm5 = (lane << 4) | 8;
                self.asm.v_raw2(0x6e00_0400 | imm5 << 16, src, dst);
            }
        }
    }

    fn v128_shuffle(&mut self, lanes: &[u8; 16], src: Reg, dst: Reg, tmp: Reg) {
        let sv = regs::scratch_v();
        let mut from_a = [0u8; 16];
        let mut from_b = [0u8; 16];
        for (i, &l) in lanes.iter().enumerate() {
            from_a[i] = if l < 16 { l } else { 0xff };
            from_b[i] = if l >= 16 { l - 16 } else { 0xff };
        }
        let a = self.asm.buf.add_const16(from_a);
        self.asm.ldr_q_literal(sv, a);
        self.asm.v_raw(0x4e00_0000, sv, dst, tmp);
        let b = self.asm.buf.add_const16(from_b);
        self.asm.ldr_q_literal(sv, b);
        self.asm.v_raw(0x4e00_0000, sv, src, sv);
        self.asm.v_raw(0x4ea0_1c00, sv, tmp, dst);
    }

    fn v128_swizzle(&mut self, src: Reg, dst: Reg, _tmp: Reg) {
        self.asm.v_raw(0x4e00_0000, src, dst, dst);
    }

    fn v128_any_true(&mut self, src: Reg, dst: Reg) {
        let sv = regs::scratch_v();
        // umaxv s, v.4s; any set bit survives.
        self.asm.v_raw2(0x6eb0_a800, src, sv);
        self.asm.v_raw2(0x0e00_3c00 | 0b00100 << 16, sv, dst);
        self.asm.cmp_imm(dst, 0, false);
        self.asm.cset(Cond::Ne, dst);
    }

    fn v128_all_true(&mut self, shape: VecShape, src: Reg, dst: Reg, tmp: Reg) {
        // Lanes equal to zero become all-ones; any such lane clears the
        // result.
        self.asm.v_rr(0x4e20_9800, vsize(shape), src, tmp);
        self.asm.v_raw2(0x6eb0_a800, tmp, tmp);
        self.asm.v_raw2(0x0e00_3c00 | 0b00100 << 16, tmp, dst);
        self.asm.cmp_imm(dst, 0, false);
        self.asm.cset(Cond::Eq, dst);
    }

    fn v128_bitmask(&mut self, shape: VecShape, src: Reg, dst: Reg, tmp: Reg) {
        let sv = regs::scratch_v();
        match shape {
            VecShape::I64x2 => {
                let scratch = regs::scratch();
                self.asm.v_raw2(0x4e00_3c00 | ((0 << 4) | 8) << 16, src, dst);
                self.asm.lsr_imm(63, dst, true);
                self.asm.v_raw2(0x4e00_3c00 | ((1 << 4) | 8) << 16, src, scratch);
                self.asm.lsr_imm(63, scratch, true);
                self.asm.lsl_imm(1, scratch, true);
                self.asm.orr_rr(scratch, dst, true);
            }
            VecShape::I8x16 => {
                self.v_mov(src, tmp);
                self.v_shr_imm(true, VecShape::I8x16, 7, tmp);
                let powers = self.asm.buf.add_const16([
                    0x01, 0x02, 0x04, 0x08, 0x10, 0x20, 0x40, 0x80, 0x01, 0x02, 0x04, 0x08,
                    0x10, 0x20, 0x40, 0x80,
                ]);
                self.asm.ldr_q_literal(sv, powers);
                self.asm.v_raw(0x4e20_1c00, sv, tmp, tmp);
                // ext high half, interleave, then a 16-bit horizontal sum.
                self.asm.v_raw(0x6e00_0000 | 8 << 11, tmp, tmp, sv);
                self.asm.v_rrr(0x4e00_3800, VSize::B, sv, tmp, tmp);
                self.asm.v_raw2(0x4e71_b800, tmp, tmp);
                self.asm.v_raw2(0x0e00_3c00 | 0b00010 << 16, tmp, dst);
            }
            VecShape::I16x8 => {
                self.v_mov(src, tmp);
                self.v_shr_imm(true, VecShape::I16x8, 15, tmp);
                let mut powers = [0u8; 16];
                for lane in 0..8 {
                    powers[lane * 2..lane * 2 + 2]
                        .copy_from_slice(&(1u16 << lane).to_le_bytes());
                }
                let label = self.asm.buf.add_const16(powers);
                self.asm.ldr_q_literal(sv, label);
                self.asm.v_raw(0x4e20_1c00, sv, tmp, tmp);
                self.asm.v_raw2(0x4e71_b800, tmp, tmp);
                self.asm.v_raw2(0x0e00_3c00 | 0b00010 << 16, tmp, dst);
            }
            VecShape::I32x4 => {
                self.v_mov(src, tmp);
                self.v_shr_imm(true, VecShape::I32x4, 31, tmp);
                let mut powers = [0u8; 16];
                for lane in 0..4 {
                    powers[lane * 4..lane * 4 + 4]
                        .copy_from_slice(&(1u32 << lane).to_le_bytes());
                }
                let label = self.asm.buf.add_const16(powers);
                self.asm.ldr_q_literal(sv, label);
                self.asm.v_raw(0x4e20_1c00, sv, tmp, tmp);
                self.asm.v_raw2(0x4eb1_b800, tmp, tmp);
                self.asm.v_raw2(0x0e00_3c00 | 0b00100 << 16, tmp, dst);
            }
            _ => unreachable!("bitmask is integer-lane only"),
        }
    }

    fn v128_narrow(&mut self, shape: VecShape, sign: Sign, src: Reg, dst: Reg) {
        let sv = regs::scratch_v();
        // Destination lane size is half the source's.
        let dst_size = match shape {
            VecShape::I16x8 => VSize::B,
            VecShape::I32x4 => VSize::H,
            _ => unreachable!("narrow sources are 16- and 32-lane"),
        };
        let (low, high) = if sign.is_signed() {
            (0x0e21_4800u32, 0x4e21_4800u32)
        } else {
            (0x2e21_2800, 0x6e21_2800)
        };
        self.asm.v_rr(low, dst_size, dst, sv);
        self.asm.v_rr(high, dst_size, src, sv);
        self.v_mov(sv, dst);
    }

    fn v128_extend(&mut self, shape: VecShape, sign: Sign, low: bool, dst: Reg) {
        self.v_extend_half(sign.is_signed(), vsize(shape), !low, dst, dst);
    }

    fn v128_ext_add_pairwise(&mut self, shape: VecShape, sign: Sign, dst: Reg, _tmp: Reg) {
        let base = if sign.is_signed() { 0x4e20_2800 } else { 0x6e20_2800 };
        self.asm.v_rr(base, vsize(shape), dst, dst);
    }

    fn v128_ext_mul(&mut self, shape: VecShape, sign: Sign, low: bool, src: Reg, dst: Reg,
        _tmp: Reg) {
        let mut base = if sign.is_signed() { 0x0e20_c000u32 } else { 0x2e20_c000u32 };
        if !low {
            base |= 0x4000_0000;
        }
        self.asm.v_rrr(base, vsize(shape), src, dst, dst);
    }

    fn v128_q15mulr_sat(&mut self, src: Reg, dst: Reg) {
        self.asm.v_raw(0x6e60_b400, src, dst, dst);
    }

    fn v128_dot(&mut self, src: Reg, dst: Reg) {
        let sv = regs::scratch_v();
        // Widening products of both halves, then pairwise sums.
        self.asm.v_rrr(0x0e20_c000, VSize::H, src, dst, sv);
        self.asm.v_rrr(0x4e20_c000, VSize::H, src, dst, dst);
        self.asm.v_rrr(0x4e20_bc00, VSize::S, dst, sv, dst);
    }

    fn v128_popcnt(&mut self, dst: Reg, _tmp: Reg) {
        self.asm.v_raw2(0x4e20_5800, dst, dst);
    }

    fn v128_trunc_sat(&mut self, shape: VecShape, sign: Sign, dst: Reg, _tmp: Reg) {
        match shape {
            VecShape::F32x4 => {
                let base = if sign.is_signed() { 0x4ea1_b800 } else { 0x6ea1_b800 };
                self.asm.v_raw2(base, dst, dst);
            }
            VecShape::F64x2 => {
                let cvt = if sign.is_signed() { 0x4ee1_b800 } else { 0x6ee1_b800 };
                self.asm.v_raw2(cvt, dst, dst);
                // Saturating narrow of the 64-lane results, zeroing the
                // high half.
                let narrow = if sign.is_signed() { 0x0e21_4800u32 } else { 0x2e21_4800u32 };
                self.asm.v_rr(narrow, VSize::S, dst, dst);
            }
            _ => unreachable!("trunc_sat shapes are f32x4 and f64x2"),
        }
    }

    fn v128_convert_i(&mut self, float: VecShape, sign: Sign, dst: Reg, _tmp: Reg) {
        match float {
            VecShape::F32x4 => {
                let base = if sign.is_signed() { 0x4e21_d800 } else { 0x6e21_d800 };
                self.asm.v_raw2(base, dst, dst);
            }
            VecShape::F64x2 => {
                self.v_extend_half(sign.is_signed(), VSize::S, false, dst, dst);
                let base = if sign.is_signed() { 0x4e61_d800 } else { 0x6e61_d800 };
                self.asm.v_raw2(base, dst, dst);
            }
            _ => unreachable!("convert targets are float shapes"),
        }
    }

    fn v128_demote(&mut self, dst: Reg) {
        self.asm.v_raw2(0x0e61_6800, dst, dst);
    }

    fn v128_promote(&mut self, dst: Reg) {
        self.asm.v_raw2(0x0e61_7800, dst, dst);
    }

    fn v128_load(&mut self, kind: V128LoadKind, dst: Reg, addr: Reg) {
        match kind {
            V128LoadKind::V128 => self.asm.fload(dst, addr, 0, 16),
            V128LoadKind::S8x8 { sign } => {
                self.asm.fload(dst, addr, 0, 8);
                self.v_extend_half(sign.is_signed(), VSize::B, false, dst, dst);
            }
            V128LoadKind::S16x4 { sign } => {
                self.asm.fload(dst, addr, 0, 8);
                self.v_extend_half(sign.is_signed(), VSize::H, false, dst, dst);
            }
            V128LoadKind::S32x2 { sign } => {
                self.asm.fload(dst, addr, 0, 8);
                self.v_extend_half(sign.is_signed(), VSize::S, false, dst, dst);
            }
            V128LoadKind::Splat { lane_bits } => {
                let scratch = regs::scratch();
                self.asm.load_zx(scratch, addr, 0, lane_bits / 8);
                let size = match lane_bits {
                    8 => VSize::B,
                    16 => VSize::H,
                    32 => VSize::S,
                    _ => VSize::D,
                };
                self.dup_gp(size, scratch, dst);
            }
            V128LoadKind::Zero32 => self.asm.fload(dst, addr, 0, 4),
            V128LoadKind::Zero64 => self.asm.fload(dst, addr, 0, 8),
        }
    }

    fn v128_load_lane(&mut self, lane_bits: u8, lane: u8, dst: Reg, addr: Reg) {
        let scratch = regs::scratch();
        self.asm.load_zx(scratch, addr, 0, lane_bits / 8);
        let lane = lane as u32;
        let imm5 = match lane_bits {
            8 => (lane << 1) | 1,
            16 => (lane << 2) | 2,
            32 => (lane << 3) | 4,
            _ => (lane << 4) | 8,
        };
        self.asm.v_raw2(0x4e00_1c00 | imm5 << 16, scratch, dst);
    }

    fn v128_store(&mut self, src: Reg, addr: Reg) {
        self.asm.fstore(src, addr, 0, 16);
    }

    fn v128_store_lane(&mut self, lane_bits: u8, lane: u8, src: Reg, addr: Reg) {
        let scratch = regs::scratch();
        let lane = lane as u32;
        let imm5 = match lane_bits {
            8 => (lane << 1) | 1,
            16 => (lane << 2) | 2,
            32 => (lane << 3) | 4,
            _ => (lane << 4) | 8,
        };
        let base = if lane_bits == 64 { 0x4e00_3c00 } else { 0x0e00_3c00 };
        self.asm.v_raw2(base | imm5 << 16, src, scratch);
        self.asm.store(scratch, addr, 0, lane_bits / 8);
    }

    fn finalize(self, stack_pointer_ceil: u32) -> Result<(Vec<u8>, Vec<Reloc>)> {
        self.asm.buf.finalize(stack_pointer_ceil)
    }
}

impl MacroAssembler {
    fn trap_if_unordered(&mut self, sp_rel: u32) {
        self.trap_if_cond(Cond::Vs, STATUS_INVALID_FLOAT_TO_INT_CONVERSION, sp_rel);
    }

    fn trap_if_cond(&mut self, cc: Cond, status: u32, sp_rel: u32) {
        let skip = self.asm.buf.new_label();
        self.asm.b_cond(cc.negate(), skip);
        self.emit_exit(status, None, sp_rel, false);
        self.asm.buf.bind_label(skip);
    }
}

/// `(lo, lo_inclusive, hi)` bit patterns (as f32 bits widened or f64 bits)
/// bounding a trapping float→int truncation.
fn trunc_bounds(float: FloatTy, int: IntTy, sign: Sign) -> (u64, bool, u64) {
    match (float, int, sign) {
        (FloatTy::F32, IntTy::I32, Sign::Signed) => (
            (-2147483648.0f32).to_bits() as u64,
            true,
            2147483648.0f32.to_bits() as u64,
        ),
        (FloatTy::F64, IntTy::I32, Sign::Signed) => (
            (-2147483649.0f64).to_bits(),
            false,
            2147483648.0f64.to_bits(),
        ),
        (FloatTy::F32, IntTy::I32, Sign::Unsigned) => (
            (-1.0f32).to_bits() as u64,
            false,
            4294967296.0f32.to_bits() as u64,
        ),
        (FloatTy::F64, IntTy::I32, Sign::Unsigned) => {
            ((-1.0f64).to_bits(), false, 4294967296.0f64.to_bits())
        }
        (FloatTy::F32, IntTy::I64, Sign::Signed) => (
            (-9223372036854775808.0f32).to_bits() as u64,
            true,
            9223372036854775808.0f32.to_bits() as u64,
        ),
        (FloatTy::F64, IntTy::I64, Sign::Signed) => (
            (-9223372036854775808.0f64).to_bits(),
            true,
            9223372036854775808.0f64.to_bits(),
        ),
        (FloatTy::F32, IntTy::I64, Sign::Unsigned) => (
            (-1.0f32).to_bits() as u64,
            false,
            18446744073709551616.0f32.to_bits() as u64,
        ),
        (FloatTy::F64, IntTy::I64, Sign::Unsigned) => (
            (-1.0f64).to_bits(),
            false,
            18446744073709551616.0f64.to_bits(),
        ),
    }
}
