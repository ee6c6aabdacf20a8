//! x64 MacroAssembler: instruction selection for the generic lowering
//! interface.
//!
//! Register conventions: R13 call engine, R12 module instance, R14 value
//! stack base, R15 memory base, R11 integer scratch, XMM15 vector scratch.
//! SSE4.2 is the baseline; LZCNT/TZCNT/POPCNT are feature-gated with BSR/
//! BSF/bit-twiddling fallbacks.

use capstan_environ::{
    AtomicRmwOp, CmpKind, CpuFeatures, FloatCmpKind, FloatTy, IntTy, ResourceUses, Sign,
    V128LoadKind, VecShape, ENGINE_COMPILER_CALL_RETURN_ADDRESS, ENGINE_DATA_INSTANCES_ELEMENT0,
    ENGINE_ELEMENT_INSTANCES_ELEMENT0, ENGINE_FUNCTIONS_ELEMENT0, ENGINE_GLOBALS_ELEMENT0,
    ENGINE_HOST_STACK_POINTER, ENGINE_MEMORY_ELEMENT0, ENGINE_MEMORY_INSTANCE, ENGINE_MEMORY_LEN,
    ENGINE_MODULE_INSTANCE, ENGINE_BUILTIN_CALL_INDEX, ENGINE_STACK_BASE_POINTER,
    ENGINE_STACK_POINTER, ENGINE_STATUS_CODE, ENGINE_TABLES_ELEMENT0, ENGINE_TABLES_LEN,
    ENGINE_TYPE_IDS_ELEMENT0, ENGINE_VALUE_STACK_ELEMENT0, ENGINE_VALUE_STACK_LEN,
    MEMORY_INSTANCE_BUFFER, MEMORY_INSTANCE_BUFFER_LEN, MODULE_INSTANCE_DATA_INSTANCES_ELEMENT0,
    MODULE_INSTANCE_ELEMENT_INSTANCES_ELEMENT0, MODULE_INSTANCE_FUNCTIONS_ELEMENT0,
    MODULE_INSTANCE_GLOBALS_ELEMENT0, MODULE_INSTANCE_MEMORY, MODULE_INSTANCE_TABLES_ELEMENT0,
    MODULE_INSTANCE_TABLES_LEN, MODULE_INSTANCE_TYPE_IDS_ELEMENT0, PASSIVE_INSTANCE_LEN,
    PASSIVE_INSTANCE_PTR, STATUS_INTEGER_DIVISION_BY_ZERO, STATUS_INTEGER_OVERFLOW,
    STATUS_INVALID_FLOAT_TO_INT_CONVERSION, STATUS_INVALID_TABLE_ACCESS,
    STATUS_MEMORY_OUT_OF_BOUNDS, STATUS_RETURNED, STATUS_UNALIGNED_ATOMIC,
    TABLE_INSTANCE_REFERENCES, TABLE_INSTANCE_REFERENCES_LEN,
};

use super::asm::{Alu, Assembler, Cc, Map};
use super::regs;
use crate::buffer::{CodeLabel, FixupKind, Reloc, RelocKind};
use crate::masm::{
    invert, AluOp, BitCountOp, DivRem, Extend, FloatAluOp, FloatUnOp, LoadKind, MacroAssembler as
    Masm, OperandSize, ShiftKind, SlotType, StoreKind,
};
use crate::reg::Reg;
use crate::regalloc::RegisterPool;
use anyhow::Result;

const RSP: Reg = Reg::int(4);

fn cc(kind: CmpKind) -> Cc {
    match kind {
        CmpKind::Eq => Cc::E,
        CmpKind::Ne => Cc::Ne,
        CmpKind::LtS => Cc::L,
        CmpKind::LtU => Cc::B,
        CmpKind::GtS => Cc::G,
        CmpKind::GtU => Cc::A,
        CmpKind::LeS => Cc::Le,
        CmpKind::LeU => Cc::Be,
        CmpKind::GeS => Cc::Ge,
        CmpKind::GeU => Cc::Ae,
    }
}

fn wide(size: OperandSize) -> bool {
    size == OperandSize::S64
}

/// Replicate a 32-bit pattern into a 16-byte literal.
fn c32(x: u32) -> [u8; 16] {
    let mut out = [0u8; 16];
    for lane in 0..4 {
        out[lane * 4..lane * 4 + 4].copy_from_slice(&x.to_le_bytes());
    }
    out
}

/// Replicate a 64-bit pattern into a 16-byte literal.
fn c64(x: u64) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[0..8].copy_from_slice(&x.to_le_bytes());
    out[8..16].copy_from_slice(&x.to_le_bytes());
    out
}

fn c8(x: u8) -> [u8; 16] {
    [x; 16]
}

fn c16(x: u16) -> [u8; 16] {
    let mut out = [0u8; 16];
    for lane in 0..8 {
        out[lane * 2..lane * 2 + 2].copy_from_slice(&x.to_le_bytes());
    }
    out
}

/// x64 MacroAssembler.
pub(crate) struct MacroAssembler {
    asm: Assembler,
    features: CpuFeatures,
}

impl MacroAssembler {
    pub fn new(features: CpuFeatures) -> Self {
        Self {
            asm: Assembler::new(),
            features,
        }
    }

    fn slot_disp(slot: u32) -> i32 {
        (slot * 8) as i32
    }

    fn sse(&mut self, pfx: u8, map: Map, op: u8, dst: Reg, src: Reg) {
        self.asm.sse_rr(pfx, map, op, dst, src, false);
    }

    fn sse_c(&mut self, pfx: u8, map: Map, op: u8, dst: Reg, lit: [u8; 16]) {
        let label = self.asm.buf.add_const16(lit);
        self.asm.sse_rip(pfx, map, op, dst, label);
    }

    fn movaps(&mut self, src: Reg, dst: Reg) {
        self.sse(0, Map::_0F, 0x28, dst, src);
    }

    fn pxor_self(&mut self, dst: Reg) {
        self.sse(0x66, Map::_0F, 0xef, dst, dst);
    }

    fn all_ones(&mut self, dst: Reg) {
        // pcmpeqd dst, dst
        self.sse(0x66, Map::_0F, 0x76, dst, dst);
    }

    /// Move the masked shift amount into an xmm register.
    fn shift_amount_to_xmm(&mut self, amount: Reg, lane_bits: u8, dst: Reg) {
        self.asm.mov_rr(amount, regs::scratch(), false);
        self.asm
            .alu_ri(Alu::And, (lane_bits - 1) as i32, regs::scratch(), false);
        self.asm.sse_gp(true, dst, regs::scratch(), false);
    }

    /// Logical right shift of the whole register by `bytes` (psrldq).
    fn psrldq(&mut self, dst: Reg, bytes: u8) {
        self.asm.sse_ext_imm(0x66, 0x73, 3, dst, bytes);
    }

    /// Per-lane immediate shifts (`71`/`72`/`73` group).
    fn pshift_imm(&mut self, op_group: u8, ext: u8, dst: Reg, imm: u8) {
        self.asm.sse_ext_imm(0x66, op_group, ext, dst, imm);
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
        Some((regs::rax(), regs::rdx()))
    }

    fn fixed_shift_amount_reg(&self) -> Option<Reg> {
        Some(regs::rcx())
    }

    fn fixed_atomic_result_reg(&self, op: Option<AtomicRmwOp>) -> Option<Reg> {
        match op {
            // add/sub lower to xadd, xchg to xchg; their result lands in the
            // operand register.
            Some(AtomicRmwOp::Add) | Some(AtomicRmwOp::Sub) | Some(AtomicRmwOp::Xchg) => None,
            // and/or/xor lower to a cmpxchg loop, cmpxchg itself compares
            // against RAX.
            _ => Some(regs::rax()),
        }
    }

    // ---- labels and control ------------------------------------------

    fn new_label(&mut self) -> CodeLabel {
        self.asm.buf.new_label()
    }

    fn bind(&mut self, label: CodeLabel) {
        self.asm.buf.bind_label(label);
    }

    fn jmp(&mut self, label: CodeLabel) {
        self.asm.jmp(label);
    }

    fn jcc(&mut self, kind: CmpKind, label: CodeLabel) {
        self.asm.jcc(cc(kind), label);
    }

    fn jmp_reg(&mut self, target: Reg) {
        self.asm.jmp_r(target);
    }

    fn read_instruction_address(&mut self, dst: Reg, label: CodeLabel) {
        self.asm.lea_rip(dst, label);
    }

    fn load_function_addr(&mut self, dst: Reg, function_index: u32) {
        self.asm
            .mov_ri64_reloc(dst, RelocKind::FunctionAddress { function_index });
    }

    fn jump_table(&mut self, index: Reg, arms: &[CodeLabel]) {
        let table = self.asm.buf.new_label();
        self.asm.lea_rip(regs::scratch(), table);
        self.asm.movsxd_indexed(index, regs::scratch(), index, 2);
        self.asm.alu_rr(Alu::Add, index, regs::scratch(), true);
        self.asm.jmp_r(regs::scratch());
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
        // Publish the absolute stack pointer.
        self.asm
            .load_zx(scratch, regs::engine(), ENGINE_STACK_BASE_POINTER as i32, 8);
        if sp_rel != 0 {
            self.asm.alu_ri(Alu::Add, sp_rel as i32, scratch, true);
        }
        self.asm
            .store(scratch, regs::engine(), ENGINE_STACK_POINTER as i32, 8);
        self.asm.mov_ri(scratch, status as u64, false);
        self.asm
            .store(scratch, regs::engine(), ENGINE_STATUS_CODE as i32, 4);
        if let Some(index) = builtin {
            self.asm.mov_ri(scratch, index as u64, false);
            self.asm
                .store(scratch, regs::engine(), ENGINE_BUILTIN_CALL_INDEX as i32, 4);
        }
        let cont = reenter.then(|| {
            let cont = self.asm.buf.new_label();
            self.asm.lea_rip(scratch, cont);
            self.asm.store(
                scratch,
                regs::engine(),
                ENGINE_COMPILER_CALL_RETURN_ADDRESS as i32,
                8,
            );
            cont
        });
        // The entry stub parked the host stack pointer just below the
        // callee-saved registers it pushed; unwind them in reverse.
        self.asm
            .load_zx(RSP, regs::engine(), ENGINE_HOST_STACK_POINTER as i32, 8);
        self.asm.pop_r(Reg::int(15));
        self.asm.pop_r(Reg::int(14));
        self.asm.pop_r(Reg::int(13));
        self.asm.pop_r(Reg::int(12));
        self.asm.pop_r(Reg::int(5));
        self.asm.pop_r(Reg::int(3));
        self.asm.ret();
        if let Some(cont) = cont {
            self.asm.buf.bind_label(cont);
        }
    }

    fn trap_if(&mut self, kind: CmpKind, status: u32, sp_rel: u32) {
        let skip = self.asm.buf.new_label();
        self.asm.jcc(cc(invert(kind)), skip);
        self.emit_exit(status, None, sp_rel, false);
        self.asm.buf.bind_label(skip);
    }

    // ---- prologue helpers --------------------------------------------

    fn stack_headroom_cmp(&mut self) {
        let scratch = regs::scratch();
        self.asm
            .load_zx(scratch, regs::engine(), ENGINE_VALUE_STACK_LEN as i32, 8);
        self.asm.alu_rm(
            Alu::Sub,
            scratch,
            regs::engine(),
            ENGINE_STACK_BASE_POINTER as i32,
            true,
        );
        self.asm.cmp_ri32_deferred(scratch);
    }

    fn reload_stack_base(&mut self) {
        let base = regs::stack_base();
        self.asm
            .load_zx(base, regs::engine(), ENGINE_STACK_BASE_POINTER as i32, 8);
        self.asm.shift_i(4, 3, base, true);
        self.asm.alu_rm(
            Alu::Add,
            base,
            regs::engine(),
            ENGINE_VALUE_STACK_ELEMENT0 as i32,
            true,
        );
    }

    fn reload_memory_cache(&mut self) {
        let scratch = regs::scratch();
        self.asm
            .load_zx(scratch, regs::engine(), ENGINE_MEMORY_INSTANCE as i32, 8);
        self.asm
            .load_zx(regs::memory_base(), scratch, MEMORY_INSTANCE_BUFFER as i32, 8);
        self.asm.store(
            regs::memory_base(),
            regs::engine(),
            ENGINE_MEMORY_ELEMENT0 as i32,
            8,
        );
        self.asm
            .load_zx(scratch, scratch, MEMORY_INSTANCE_BUFFER_LEN as i32, 8);
        self.asm
            .store(scratch, regs::engine(), ENGINE_MEMORY_LEN as i32, 8);
    }

    fn init_module_context(&mut self, uses: ResourceUses) {
        let scratch = regs::scratch();
        let engine = regs::engine();
        let instance = regs::module_instance();
        self.asm
            .store(instance, engine, ENGINE_MODULE_INSTANCE as i32, 8);
        if uses.globals {
            self.asm
                .load_zx(scratch, instance, MODULE_INSTANCE_GLOBALS_ELEMENT0 as i32, 8);
            self.asm
                .store(scratch, engine, ENGINE_GLOBALS_ELEMENT0 as i32, 8);
        }
        if uses.memory {
            self.asm
                .load_zx(scratch, instance, MODULE_INSTANCE_MEMORY as i32, 8);
            self.asm
                .store(scratch, engine, ENGINE_MEMORY_INSTANCE as i32, 8);
            self.reload_memory_cache();
        }
        if uses.tables {
            self.asm
                .load_zx(scratch, instance, MODULE_INSTANCE_TABLES_ELEMENT0 as i32, 8);
            self.asm
                .store(scratch, engine, ENGINE_TABLES_ELEMENT0 as i32, 8);
            self.asm
                .load_zx(scratch, instance, MODULE_INSTANCE_TABLES_LEN as i32, 8);
            self.asm.store(scratch, engine, ENGINE_TABLES_LEN as i32, 8);
            self.asm
                .load_zx(scratch, instance, MODULE_INSTANCE_TYPE_IDS_ELEMENT0 as i32, 8);
            self.asm
                .store(scratch, engine, ENGINE_TYPE_IDS_ELEMENT0 as i32, 8);
        }
        if uses.functions {
            self.asm.load_zx(
                scratch,
                instance,
                MODULE_INSTANCE_FUNCTIONS_ELEMENT0 as i32,
                8,
            );
            self.asm
                .store(scratch, engine, ENGINE_FUNCTIONS_ELEMENT0 as i32, 8);
        }
        if uses.data_instances {
            self.asm.load_zx(
                scratch,
                instance,
                MODULE_INSTANCE_DATA_INSTANCES_ELEMENT0 as i32,
                8,
            );
            self.asm
                .store(scratch, engine, ENGINE_DATA_INSTANCES_ELEMENT0 as i32, 8);
        }
        if uses.element_instances {
            self.asm.load_zx(
                scratch,
                instance,
                MODULE_INSTANCE_ELEMENT_INSTANCES_ELEMENT0 as i32,
                8,
            );
            self.asm.store(
                scratch,
                engine,
                ENGINE_ELEMENT_INSTANCES_ELEMENT0 as i32,
                8,
            );
        }
    }

    fn function_return(&mut self, frame_rel: u32, result_slots: u32, ra_tmp: Reg) {
        let scratch = regs::scratch();
        // Restore the caller's stack base.
        self.asm.load_zx(
            scratch,
            regs::stack_base(),
            Self::slot_disp(frame_rel + 1),
            8,
        );
        self.asm
            .store(scratch, regs::engine(), ENGINE_STACK_BASE_POINTER as i32, 8);
        self.asm
            .load_zx(ra_tmp, regs::stack_base(), Self::slot_disp(frame_rel), 8);
        self.asm.test_rr(ra_tmp, ra_tmp, true);
        let to_caller = self.asm.buf.new_label();
        self.asm.jcc(Cc::Ne, to_caller);
        // Entry frame: the seeded stack base is zero, so the published sp
        // is exactly the result count.
        self.emit_exit(STATUS_RETURNED, None, result_slots, false);
        self.asm.buf.bind_label(to_caller);
        self.asm.jmp_r(ra_tmp);
    }

    // ---- moves and slots ---------------------------------------------

    fn mov_rr(&mut self, src: Reg, dst: Reg, size: OperandSize) {
        if src.is_float() {
            self.movaps(src, dst);
        } else {
            self.asm.mov_rr(src, dst, wide(size));
        }
    }

    fn mov_imm(&mut self, dst: Reg, imm: u64, size: OperandSize) {
        self.asm.mov_ri(dst, imm, wide(size));
    }

    fn mov_float_imm(&mut self, dst: Reg, bits: u64, size: OperandSize) {
        if bits == 0 {
            self.pxor_self(dst);
        } else {
            self.asm.mov_ri(regs::scratch(), bits, wide(size));
            self.asm.sse_gp(true, dst, regs::scratch(), wide(size));
        }
    }

    fn load_slot(&mut self, dst: Reg, slot: u32, ty: SlotType) {
        let disp = Self::slot_disp(slot);
        match ty {
            SlotType::I32 => self.asm.load_zx(dst, regs::stack_base(), disp, 4),
            SlotType::I64 => self.asm.load_zx(dst, regs::stack_base(), disp, 8),
            SlotType::F32 => self.asm.sse_rm(0xf3, Map::_0F, 0x10, dst, regs::stack_base(), disp),
            SlotType::F64 => self.asm.sse_rm(0xf2, Map::_0F, 0x10, dst, regs::stack_base(), disp),
            _ => unreachable!("v128 slots use the vector accessors"),
        }
    }

    fn store_slot(&mut self, src: Reg, slot: u32, ty: SlotType) {
        let disp = Self::slot_disp(slot);
        match ty {
            // Integer slots hold the full zero-extended word.
            SlotType::I32 | SlotType::I64 => self.asm.store(src, regs::stack_base(), disp, 8),
            SlotType::F32 => self.asm.sse_rm(0xf3, Map::_0F, 0x11, src, regs::stack_base(), disp),
            SlotType::F64 => self.asm.sse_rm(0xf2, Map::_0F, 0x11, src, regs::stack_base(), disp),
            _ => unreachable!("v128 slots use the vector accessors"),
        }
    }

    fn load_slot_v128(&mut self, dst: Reg, slot: u32) {
        self.asm
            .sse_rm(0xf3, Map::_0F, 0x6f, dst, regs::stack_base(), Self::slot_disp(slot));
    }

    fn store_slot_v128(&mut self, src: Reg, slot: u32) {
        self.asm
            .sse_rm(0xf3, Map::_0F, 0x7f, src, regs::stack_base(), Self::slot_disp(slot));
    }

    fn load_engine(&mut self, dst: Reg, offset: u32) {
        self.asm.load_zx(dst, regs::engine(), offset as i32, 8);
    }

    fn store_engine(&mut self, src: Reg, offset: u32) {
        self.asm.store(src, regs::engine(), offset as i32, 8);
    }

    fn load_mem64(&mut self, dst: Reg, base: Reg, offset: u32) {
        self.asm.load_zx(dst, base, offset as i32, 8);
    }

    fn store_mem64(&mut self, src: Reg, base: Reg, offset: u32) {
        self.asm.store(src, base, offset as i32, 8);
    }

    fn load_indexed64(&mut self, dst: Reg, base: Reg, index: Reg, shift: u8) {
        self.asm.load_zx_indexed(dst, base, index, shift, 8);
    }

    fn store_indexed64(&mut self, src: Reg, base: Reg, index: Reg, shift: u8) {
        self.asm.store_indexed(src, base, index, shift, 8);
    }

    // ---- scalar integer ----------------------------------------------

    fn alu_rr(&mut self, op: AluOp, src: Reg, dst: Reg, size: OperandSize) {
        let w = wide(size);
        match op {
            AluOp::Add => self.asm.alu_rr(Alu::Add, src, dst, w),
            AluOp::Sub => self.asm.alu_rr(Alu::Sub, src, dst, w),
            AluOp::And => self.asm.alu_rr(Alu::And, src, dst, w),
            AluOp::Or => self.asm.alu_rr(Alu::Or, src, dst, w),
            AluOp::Xor => self.asm.alu_rr(Alu::Xor, src, dst, w),
            AluOp::Mul => self.asm.imul_rr(src, dst, w),
        }
    }

    fn alu_imm(&mut self, op: AluOp, imm: i32, dst: Reg, size: OperandSize) {
        let w = wide(size);
        match op {
            AluOp::Add => self.asm.alu_ri(Alu::Add, imm, dst, w),
            AluOp::Sub => self.asm.alu_ri(Alu::Sub, imm, dst, w),
            AluOp::And => self.asm.alu_ri(Alu::And, imm, dst, w),
            AluOp::Or => self.asm.alu_ri(Alu::Or, imm, dst, w),
            AluOp::Xor => self.asm.alu_ri(Alu::Xor, imm, dst, w),
            AluOp::Mul => unreachable!("no immediate multiply selection"),
        }
    }

    fn shift_rr(&mut self, kind: ShiftKind, amount: Reg, dst: Reg, size: OperandSize) {
        debug_assert_eq!(amount, regs::rcx());
        let ext = match kind {
            ShiftKind::Rotl => 0,
            ShiftKind::Rotr => 1,
            ShiftKind::Shl => 4,
            ShiftKind::ShrU => 5,
            ShiftKind::ShrS => 7,
        };
        self.asm.shift_cl(ext, dst, wide(size));
    }

    fn shift_imm(&mut self, kind: ShiftKind, imm: u8, dst: Reg, size: OperandSize) {
        let ext = match kind {
            ShiftKind::Rotl => 0,
            ShiftKind::Rotr => 1,
            ShiftKind::Shl => 4,
            ShiftKind::ShrU => 5,
            ShiftKind::ShrS => 7,
        };
        let mask = size.bits() - 1;
        self.asm.shift_i(ext, imm & mask, dst, wide(size));
    }

    fn div_rem(&mut self, op: DivRem, divisor: Reg, dividend: (Reg, Reg), size: OperandSize,
        sp_rel: u32) {
        let w = wide(size);
        let (lo, hi) = dividend;
        debug_assert_eq!((lo, hi), (regs::rax(), regs::rdx()));
        self.asm.alu_ri(Alu::Cmp, 0, divisor, w);
        self.trap_if(CmpKind::Eq, STATUS_INTEGER_DIVISION_BY_ZERO, sp_rel);
        match (op.sign, op.rem) {
            (Sign::Signed, false) => {
                // MIN / -1 overflows; detect it explicitly so the status
                // code reaches the host instead of a hardware fault.
                let safe = self.asm.buf.new_label();
                self.asm.alu_ri(Alu::Cmp, -1, divisor, w);
                self.asm.jcc(Cc::Ne, safe);
                if w {
                    self.asm.mov_ri(regs::scratch(), i64::MIN as u64, true);
                    self.asm.alu_rr(Alu::Cmp, regs::scratch(), lo, true);
                } else {
                    self.asm.alu_ri(Alu::Cmp, i32::MIN, lo, false);
                }
                self.trap_if(CmpKind::Eq, STATUS_INTEGER_OVERFLOW, sp_rel);
                self.asm.buf.bind_label(safe);
                self.asm.sign_extend_data(w);
                self.asm.idiv(divisor, w);
            }
            (Sign::Signed, true) => {
                // MIN % -1 is 0, not a trap.
                let divide = self.asm.buf.new_label();
                let done = self.asm.buf.new_label();
                self.asm.alu_ri(Alu::Cmp, -1, divisor, w);
                self.asm.jcc(Cc::Ne, divide);
                self.asm.alu_rr(Alu::Xor, hi, hi, false);
                self.asm.jmp(done);
                self.asm.buf.bind_label(divide);
                self.asm.sign_extend_data(w);
                self.asm.idiv(divisor, w);
                self.asm.buf.bind_label(done);
            }
            (Sign::Unsigned, _) => {
                self.asm.alu_rr(Alu::Xor, hi, hi, false);
                self.asm.div(divisor, w);
            }
        }
        if op.rem {
            self.asm.mov_rr(hi, lo, true);
        }
    }

    fn bit_count(&mut self, op: BitCountOp, src: Reg, dst: Reg, size: OperandSize) {
        let w = wide(size);
        let bits = size.bits() as u64;
        match op {
            BitCountOp::Clz if self.features.has_lzcnt => {
                self.asm.bit_rr(true, 0xbd, src, dst, w);
            }
            BitCountOp::Ctz if self.features.has_tzcnt => {
                self.asm.bit_rr(true, 0xbc, src, dst, w);
            }
            BitCountOp::Popcnt if self.features.has_popcnt => {
                self.asm.bit_rr(true, 0xb8, src, dst, w);
            }
            BitCountOp::Clz => {
                let nonzero = self.asm.buf.new_label();
                let done = self.asm.buf.new_label();
                self.asm.alu_ri(Alu::Cmp, 0, src, w);
                self.asm.jcc(Cc::Ne, nonzero);
                self.asm.mov_ri(dst, bits, false);
                self.asm.jmp(done);
                self.asm.buf.bind_label(nonzero);
                self.asm.bit_rr(false, 0xbd, src, dst, w);
                self.asm.alu_ri(Alu::Xor, (bits - 1) as i32, dst, false);
                self.asm.buf.bind_label(done);
            }
            BitCountOp::Ctz => {
                let nonzero = self.asm.buf.new_label();
                let done = self.asm.buf.new_label();
                self.asm.alu_ri(Alu::Cmp, 0, src, w);
                self.asm.jcc(Cc::Ne, nonzero);
                self.asm.mov_ri(dst, bits, false);
                self.asm.jmp(done);
                self.asm.buf.bind_label(nonzero);
                self.asm.bit_rr(false, 0xbc, src, dst, w);
                self.asm.buf.bind_label(done);
            }
            BitCountOp::Popcnt => self.popcnt_fallback(src, dst, w),
        }
    }

    fn extend(&mut self, src: Reg, dst: Reg, ext: Extend) {
        match (ext.from_bits, ext.signed) {
            (32, false) => self.asm.mov_rr(src, dst, false),
            (32, true) => {
                if ext.to_bits == 64 {
                    self.asm.movsx_rr(src, dst, 32, 64);
                } else {
                    self.asm.mov_rr(src, dst, false);
                }
            }
            (from, true) => self.asm.movsx_rr(src, dst, from, ext.to_bits),
            (from, false) => self.asm.movzx_rr(src, dst, from),
        }
    }

    fn cmp_rr(&mut self, lhs: Reg, rhs: Reg, size: OperandSize) {
        self.asm.alu_rr(Alu::Cmp, rhs, lhs, wide(size));
    }

    fn cmp_imm(&mut self, lhs: Reg, imm: i32, size: OperandSize) {
        self.asm.alu_ri(Alu::Cmp, imm, lhs, wide(size));
    }

    fn setcc(&mut self, kind: CmpKind, dst: Reg) {
        // Clear with a flag-preserving move first.
        self.asm.mov_ri(dst, 0, false);
        self.asm.setcc(cc(kind), dst);
    }

    fn select_rr(&mut self, kind: CmpKind, src: Reg, dst: Reg, ty: SlotType) {
        if dst.is_int() {
            self.asm.cmovcc(cc(invert(kind)), src, dst, true);
        } else {
            let keep = self.asm.buf.new_label();
            self.asm.jcc(cc(kind), keep);
            self.movaps(src, dst);
            self.asm.buf.bind_label(keep);
            let _ = ty;
        }
    }

    // ---- scalar float -------------------------------------------------

    fn float_alu(&mut self, op: FloatAluOp, src: Reg, dst: Reg, size: OperandSize) {
        let pfx = if wide(size) { 0xf2 } else { 0xf3 };
        let opcode = match op {
            FloatAluOp::Add => 0x58,
            FloatAluOp::Sub => 0x5c,
            FloatAluOp::Mul => 0x59,
            FloatAluOp::Div => 0x5e,
        };
        self.sse(pfx, Map::_0F, opcode, dst, src);
    }

    fn float_min_max(&mut self, is_max: bool, src: Reg, dst: Reg, size: OperandSize, _tmp: Reg) {
        let pfx = if wide(size) { 0xf2 } else { 0xf3 };
        let ucomi_pfx = if wide(size) { 0x66 } else { 0 };
        let (nan, equal, done) = (
            self.asm.buf.new_label(),
            self.asm.buf.new_label(),
            self.asm.buf.new_label(),
        );
        self.sse(ucomi_pfx, Map::_0F, 0x2e, dst, src);
        self.asm.jcc(Cc::P, nan);
        self.asm.jcc(Cc::E, equal);
        // Ordered and unequal: the hardware min/max is exact.
        self.sse(pfx, Map::_0F, if is_max { 0x5f } else { 0x5d }, dst, src);
        self.asm.jmp(done);
        self.asm.buf.bind_label(equal);
        // ±0: min wants the sign union, max the intersection.
        let bitwise_pfx = if wide(size) { 0x66 } else { 0 };
        self.sse(
            bitwise_pfx,
            Map::_0F,
            if is_max { 0x54 } else { 0x56 },
            dst,
            src,
        );
        self.asm.jmp(done);
        self.asm.buf.bind_label(nan);
        // Propagate a quiet NaN through an addition.
        self.sse(pfx, Map::_0F, 0x58, dst, src);
        self.asm.buf.bind_label(done);
    }

    fn float_unop(&mut self, op: FloatUnOp, dst: Reg, size: OperandSize) {
        let w = wide(size);
        match op {
            FloatUnOp::Abs => {
                let lit = if w { c64(0x7fff_ffff_ffff_ffff) } else { c32(0x7fff_ffff) };
                self.sse_c(0, Map::_0F, 0x54, dst, lit);
            }
            FloatUnOp::Neg => {
                let lit = if w { c64(0x8000_0000_0000_0000) } else { c32(0x8000_0000) };
                self.sse_c(0, Map::_0F, 0x57, dst, lit);
            }
            FloatUnOp::Sqrt => {
                self.sse(if w { 0xf2 } else { 0xf3 }, Map::_0F, 0x51, dst, dst);
            }
            FloatUnOp::Ceil | FloatUnOp::Floor | FloatUnOp::Trunc | FloatUnOp::Nearest => {
                let mode = match op {
                    FloatUnOp::Nearest => 0,
                    FloatUnOp::Floor => 1,
                    FloatUnOp::Ceil => 2,
                    _ => 3,
                };
                let opcode = if w { 0x0b } else { 0x0a };
                self.asm
                    .sse_rr_imm(0x66, Map::_0F3A, opcode, dst, dst, false, mode);
            }
        }
    }

    fn float_copysign(&mut self, src: Reg, dst: Reg, size: OperandSize, tmp: Reg) {
        let (sign, magnitude) = if wide(size) {
            (c64(0x8000_0000_0000_0000), c64(0x7fff_ffff_ffff_ffff))
        } else {
            (c32(0x8000_0000), c32(0x7fff_ffff))
        };
        let label = self.asm.buf.add_const16(sign);
        self.asm.sse_rip(0, Map::_0F, 0x28, tmp, label);
        // tmp = sign of src; dst = magnitude of dst; combine.
        self.sse(0, Map::_0F, 0x54, tmp, src);
        self.sse_c(0, Map::_0F, 0x54, dst, magnitude);
        self.sse(0, Map::_0F, 0x56, dst, tmp);
    }

    fn float_cmp(&mut self, kind: FloatCmpKind, lhs: Reg, rhs: Reg, dst: Reg, size: OperandSize) {
        let pfx = if wide(size) { 0x66 } else { 0 };
        match kind {
            FloatCmpKind::Gt => {
                self.sse(pfx, Map::_0F, 0x2e, lhs, rhs);
                self.asm.mov_ri(dst, 0, false);
                self.asm.setcc(Cc::A, dst);
            }
            FloatCmpKind::Ge => {
                self.sse(pfx, Map::_0F, 0x2e, lhs, rhs);
                self.asm.mov_ri(dst, 0, false);
                self.asm.setcc(Cc::Ae, dst);
            }
            FloatCmpKind::Lt => {
                self.sse(pfx, Map::_0F, 0x2e, rhs, lhs);
                self.asm.mov_ri(dst, 0, false);
                self.asm.setcc(Cc::A, dst);
            }
            FloatCmpKind::Le => {
                self.sse(pfx, Map::_0F, 0x2e, rhs, lhs);
                self.asm.mov_ri(dst, 0, false);
                self.asm.setcc(Cc::Ae, dst);
            }
            FloatCmpKind::Eq => {
                self.asm.mov_ri(dst, 0, false);
                self.asm.mov_ri(regs::scratch(), 0, false);
                self.sse(pfx, Map::_0F, 0x2e, lhs, rhs);
                self.asm.setcc(Cc::Np, dst);
                self.asm.setcc(Cc::E, regs::scratch());
                self.asm.alu_rr(Alu::And, regs::scratch(), dst, false);
            }
            FloatCmpKind::Ne => {
                self.asm.mov_ri(dst, 0, false);
                self.asm.mov_ri(regs::scratch(), 0, false);
                self.sse(pfx, Map::_0F, 0x2e, lhs, rhs);
                self.asm.setcc(Cc::P, dst);
                self.asm.setcc(Cc::Ne, regs::scratch());
                self.asm.alu_rr(Alu::Or, regs::scratch(), dst, false);
            }
        }
    }

    fn float_demote(&mut self, dst: Reg) {
        self.sse(0xf2, Map::_0F, 0x5a, dst, dst);
    }

    fn float_promote(&mut self, dst: Reg) {
        self.sse(0xf3, Map::_0F, 0x5a, dst, dst);
    }

    fn int_to_float(&mut self, src: Reg, dst: Reg, int: IntTy, float: FloatTy, sign: Sign,
        tmp_gp: Reg) {
        let pfx = if float == FloatTy::F64 { 0xf2 } else { 0xf3 };
        match (int, sign) {
            (IntTy::I32, Sign::Signed) => {
                self.asm.sse_rr(pfx, Map::_0F, 0x2a, dst, src, false);
            }
            (IntTy::I32, Sign::Unsigned) => {
                // The operand is zero-extended; a 64-bit signed convert is
                // exact.
                self.asm.sse_rr(pfx, Map::_0F, 0x2a, dst, src, true);
            }
            (IntTy::I64, Sign::Signed) => {
                self.asm.sse_rr(pfx, Map::_0F, 0x2a, dst, src, true);
            }
            (IntTy::I64, Sign::Unsigned) => {
                let big = self.asm.buf.new_label();
                let done = self.asm.buf.new_label();
                self.asm.test_rr(src, src, true);
                self.asm.jcc(Cc::S, big);
                self.asm.sse_rr(pfx, Map::_0F, 0x2a, dst, src, true);
                self.asm.jmp(done);
                self.asm.buf.bind_label(big);
                // Halve with a sticky low bit, convert, double.
                self.asm.mov_rr(src, tmp_gp, true);
                self.asm.shift_i(5, 1, tmp_gp, true);
                self.asm.mov_rr(src, regs::scratch(), true);
                self.asm.alu_ri(Alu::And, 1, regs::scratch(), true);
                self.asm.alu_rr(Alu::Or, regs::scratch(), tmp_gp, true);
                self.asm.sse_rr(pfx, Map::_0F, 0x2a, dst, tmp_gp, true);
                self.sse(pfx, Map::_0F, 0x58, dst, dst);
                self.asm.buf.bind_label(done);
            }
        }
    }

    fn float_to_int(&mut self, src: Reg, dst: Reg, float: FloatTy, int: IntTy, sign: Sign,
        saturating: bool, tmp_fp: Reg, sp_rel: u32) {
        let pfx = if float == FloatTy::F64 { 0xf2 } else { 0xf3 };
        let ucomi_pfx = if float == FloatTy::F64 { 0x66 } else { 0 };
        let cvtt = |m: &mut Self, dst: Reg, src: Reg, w: bool| {
            m.asm.sse_rr(pfx, Map::_0F, 0x2c, dst, src, w);
        };
        match (int, sign) {
            (IntTy::I32, Sign::Signed) => {
                cvtt(self, dst, src, false);
                self.asm.alu_ri(Alu::Cmp, i32::MIN, dst, false);
                let ok = self.asm.buf.new_label();
                self.asm.jcc(Cc::Ne, ok);
                if saturating {
                    let done = self.asm.buf.new_label();
                    // NaN saturates to zero; the sentinel is correct for
                    // negative overflow and flips for positive overflow.
                    self.sse(ucomi_pfx, Map::_0F, 0x2e, src, src);
                    let not_nan = self.asm.buf.new_label();
                    self.asm.jcc(Cc::Np, not_nan);
                    self.asm.mov_ri(dst, 0, false);
                    self.asm.jmp(done);
                    self.asm.buf.bind_label(not_nan);
                    self.pxor_self(tmp_fp);
                    self.sse(ucomi_pfx, Map::_0F, 0x2e, src, tmp_fp);
                    self.asm.jcc(Cc::B, done);
                    self.asm.mov_ri(dst, i32::MAX as u32 as u64, false);
                    self.asm.buf.bind_label(done);
                    self.asm.buf.bind_label(ok);
                } else {
                    self.sse(ucomi_pfx, Map::_0F, 0x2e, src, src);
                    self.trap_if_parity(sp_rel);
                    // Only an exact MIN survives; everything else is out of
                    // range.
                    let min_lit = if float == FloatTy::F64 {
                        c64((-(2147483648.0f64)).to_bits())
                    } else {
                        c32((-(2147483648.0f32)).to_bits())
                    };
                    let label = self.asm.buf.add_const16(min_lit);
                    self.asm.sse_rip(ucomi_pfx, Map::_0F, 0x2e, src, label);
                    self.trap_if(CmpKind::Ne, STATUS_INTEGER_OVERFLOW, sp_rel);
                    self.asm.buf.bind_label(ok);
                }
            }
            (IntTy::I64, Sign::Signed) => {
                cvtt(self, dst, src, true);
                self.asm.mov_ri(regs::scratch(), i64::MIN as u64, true);
                self.asm.alu_rr(Alu::Cmp, regs::scratch(), dst, true);
                let ok = self.asm.buf.new_label();
                self.asm.jcc(Cc::Ne, ok);
                if saturating {
                    let done = self.asm.buf.new_label();
                    self.sse(ucomi_pfx, Map::_0F, 0x2e, src, src);
                    let not_nan = self.asm.buf.new_label();
                    self.asm.jcc(Cc::Np, not_nan);
                    self.asm.mov_ri(dst, 0, false);
                    self.asm.jmp(done);
                    self.asm.buf.bind_label(not_nan);
                    self.pxor_self(tmp_fp);
                    self.sse(ucomi_pfx, Map::_0F, 0x2e, src, tmp_fp);
                    self.asm.jcc(Cc::B, done);
                    self.asm.mov_ri(dst, i64::MAX as u64, true);
                    self.asm.buf.bind_label(done);
                    self.asm.buf.bind_label(ok);
                } else {
                    self.sse(ucomi_pfx, Map::_0F, 0x2e, src, src);
                    self.trap_if_parity(sp_rel);
                    let min_lit = if float == FloatTy::F64 {
                        c64((-(9223372036854775808.0f64)).to_bits())
                    } else {
                        c32((-(9223372036854775808.0f32)).to_bits())
                    };
                    let label = self.asm.buf.add_const16(min_lit);
                    self.asm.sse_rip(ucomi_pfx, Map::_0F, 0x2e, src, label);
                    self.trap_if(CmpKind::Ne, STATUS_INTEGER_OVERFLOW, sp_rel);
                    self.asm.buf.bind_label(ok);
                }
            }
            (IntTy::I32, Sign::Unsigned) => {
                if saturating {
                    let (zero, max, done) = (
                        self.asm.buf.new_label(),
                        self.asm.buf.new_label(),
                        self.asm.buf.new_label(),
                    );
                    self.sse(ucomi_pfx, Map::_0F, 0x2e, src, src);
                    self.asm.jcc(Cc::P, zero);
                    let lim = if float == FloatTy::F64 {
                        c64(4294967296.0f64.to_bits())
                    } else {
                        c32(4294967296.0f32.to_bits())
                    };
                    let label = self.asm.buf.add_const16(lim);
                    self.asm.sse_rip(ucomi_pfx, Map::_0F, 0x2e, src, label);
                    self.asm.jcc(Cc::Ae, max);
                    cvtt(self, dst, src, true);
                    self.asm.test_rr(dst, dst, true);
                    self.asm.jcc(Cc::Ns, done);
                    self.asm.buf.bind_label(zero);
                    self.asm.mov_ri(dst, 0, false);
                    self.asm.jmp(done);
                    self.asm.buf.bind_label(max);
                    self.asm.mov_ri(dst, u32::MAX as u64, false);
                    self.asm.buf.bind_label(done);
                    self.asm.mov_rr(dst, dst, false);
                } else {
                    cvtt(self, dst, src, true);
                    let positive = self.asm.buf.new_label();
                    self.asm.test_rr(dst, dst, true);
                    self.asm.jcc(Cc::Ns, positive);
                    self.sse(ucomi_pfx, Map::_0F, 0x2e, src, src);
                    self.trap_if_parity(sp_rel);
                    self.emit_exit(STATUS_INTEGER_OVERFLOW, None, sp_rel, false);
                    self.asm.buf.bind_label(positive);
                    self.asm.mov_ri(regs::scratch(), u32::MAX as u64, false);
                    self.asm.alu_rr(Alu::Cmp, regs::scratch(), dst, true);
                    self.trap_if(CmpKind::GtU, STATUS_INTEGER_OVERFLOW, sp_rel);
                    self.asm.mov_rr(dst, dst, false);
                }
            }
            (IntTy::I64, Sign::Unsigned) => {
                let two63 = if float == FloatTy::F64 {
                    c64(9223372036854775808.0f64.to_bits())
                } else {
                    c32(9223372036854775808.0f32.to_bits())
                };
                let two63_label = self.asm.buf.add_const16(two63);
                if saturating {
                    let (zero, max, big, done) = (
                        self.asm.buf.new_label(),
                        self.asm.buf.new_label(),
                        self.asm.buf.new_label(),
                        self.asm.buf.new_label(),
                    );
                    self.sse(ucomi_pfx, Map::_0F, 0x2e, src, src);
                    self.asm.jcc(Cc::P, zero);
                    let lim = if float == FloatTy::F64 {
                        c64(18446744073709551616.0f64.to_bits())
                    } else {
                        c32(18446744073709551616.0f32.to_bits())
                    };
                    let lim_label = self.asm.buf.add_const16(lim);
                    self.asm.sse_rip(ucomi_pfx, Map::_0F, 0x2e, src, lim_label);
                    self.asm.jcc(Cc::Ae, max);
                    self.asm.sse_rip(ucomi_pfx, Map::_0F, 0x2e, src, two63_label);
                    self.asm.jcc(Cc::Ae, big);
                    cvtt(self, dst, src, true);
                    self.asm.test_rr(dst, dst, true);
                    self.asm.jcc(Cc::Ns, done);
                    self.asm.buf.bind_label(zero);
                    self.asm.mov_ri(dst, 0, false);
                    self.asm.jmp(done);
                    self.asm.buf.bind_label(max);
                    self.asm.mov_ri(dst, u64::MAX, true);
                    self.asm.jmp(done);
                    self.asm.buf.bind_label(big);
                    self.movaps(src, tmp_fp);
                    let sub_op = 0x5c;
                    self.asm.sse_rip(pfx, Map::_0F, sub_op, tmp_fp, two63_label);
                    cvtt(self, dst, tmp_fp, true);
                    self.asm.mov_ri(regs::scratch(), 0x8000_0000_0000_0000, true);
                    self.asm.alu_rr(Alu::Add, regs::scratch(), dst, true);
                    self.asm.buf.bind_label(done);
                } else {
                    let (big, done) = (self.asm.buf.new_label(), self.asm.buf.new_label());
                    self.asm.sse_rip(ucomi_pfx, Map::_0F, 0x2e, src, two63_label);
                    self.asm.jcc(Cc::Ae, big);
                    cvtt(self, dst, src, true);
                    self.asm.test_rr(dst, dst, true);
                    let trapped = self.asm.buf.new_label();
                    self.asm.jcc(Cc::Ns, done);
                    self.asm.buf.bind_label(trapped);
                    self.sse(ucomi_pfx, Map::_0F, 0x2e, src, src);
                    self.trap_if_parity(sp_rel);
                    self.emit_exit(STATUS_INTEGER_OVERFLOW, None, sp_rel, false);
                    self.asm.buf.bind_label(big);
                    self.movaps(src, tmp_fp);
                    self.asm.sse_rip(pfx, Map::_0F, 0x5c, tmp_fp, two63_label);
                    cvtt(self, dst, tmp_fp, true);
                    self.asm.test_rr(dst, dst, true);
                    self.trap_if(CmpKind::LtS, STATUS_INTEGER_OVERFLOW, sp_rel);
                    self.asm.mov_ri(regs::scratch(), 0x8000_0000_0000_0000, true);
                    self.asm.alu_rr(Alu::Add, regs::scratch(), dst, true);
                    self.asm.buf.bind_label(done);
                }
            }
        }
    }

    fn reinterpret_float_to_int(&mut self, src: Reg, dst: Reg, size: OperandSize) {
        self.asm.sse_gp(false, src, dst, wide(size));
    }

    fn reinterpret_int_to_float(&mut self, src: Reg, dst: Reg, size: OperandSize) {
        self.asm.sse_gp(true, dst, src, wide(size));
    }

    // ---- linear memory ------------------------------------------------

    fn memory_access(&mut self, addr: Reg, offset: u32, width: u8, check_align: bool,
        sp_rel: u32) {
        let scratch = regs::scratch();
        if check_align && width > 1 {
            // Alignment first, then bounds, so the trap order is
            // deterministic across targets.
            if offset <= i32::MAX as u32 {
                self.asm.lea(scratch, addr, offset as i32);
            } else {
                self.asm.mov_ri(scratch, offset as u64, true);
                self.asm.alu_rr(Alu::Add, addr, scratch, true);
            }
            self.asm.test_ri((width - 1) as i32, scratch, false);
            self.trap_if(CmpKind::Ne, STATUS_UNALIGNED_ATOMIC, sp_rel);
        }
        let end = offset as u64 + width as u64;
        if end <= i32::MAX as u64 {
            self.asm.lea(scratch, addr, end as i32);
        } else {
            self.asm.mov_ri(scratch, end, true);
            self.asm.alu_rr(Alu::Add, addr, scratch, true);
        }
        self.asm
            .alu_rm(Alu::Cmp, scratch, regs::engine(), ENGINE_MEMORY_LEN as i32, true);
        self.trap_if(CmpKind::GtU, STATUS_MEMORY_OUT_OF_BOUNDS, sp_rel);
        if offset <= i32::MAX as u32 {
            self.asm
                .lea_indexed(addr, regs::memory_base(), addr, 0, offset as i32);
        } else {
            self.asm.mov_ri(scratch, offset as u64, true);
            self.asm.alu_rr(Alu::Add, scratch, addr, true);
            self.asm.alu_rr(Alu::Add, regs::memory_base(), addr, true);
        }
    }

    fn wasm_load(&mut self, dst: Reg, addr: Reg, kind: LoadKind) {
        match kind {
            LoadKind::Int { ty, width, sign } => match (sign, width) {
                (Sign::Unsigned, w) => self.asm.load_zx(dst, addr, 0, w / 8),
                (Sign::Signed, 64) => self.asm.load_zx(dst, addr, 0, 8),
                (Sign::Signed, w) => self.asm.load_sx(dst, addr, 0, w / 8, ty.bits()),
            },
            LoadKind::F32 => self.asm.sse_rm(0xf3, Map::_0F, 0x10, dst, addr, 0),
            LoadKind::F64 => self.asm.sse_rm(0xf2, Map::_0F, 0x10, dst, addr, 0),
        }
    }

    fn wasm_store(&mut self, src: Reg, addr: Reg, kind: StoreKind) {
        match kind {
            StoreKind::Int { width } => self.asm.store(src, addr, 0, width / 8),
            StoreKind::F32 => self.asm.sse_rm(0xf3, Map::_0F, 0x11, src, addr, 0),
            StoreKind::F64 => self.asm.sse_rm(0xf2, Map::_0F, 0x11, src, addr, 0),
        }
    }

    fn memory_copy_loop(&mut self, dst: Reg, src: Reg, len: Reg, sp_rel: u32) {
        let scratch = regs::scratch();
        self.asm.mov_rr(src, scratch, true);
        self.asm.alu_rr(Alu::Add, len, scratch, true);
        self.asm
            .alu_rm(Alu::Cmp, scratch, regs::engine(), ENGINE_MEMORY_LEN as i32, true);
        self.trap_if(CmpKind::GtU, STATUS_MEMORY_OUT_OF_BOUNDS, sp_rel);
        self.asm.mov_rr(dst, scratch, true);
        self.asm.alu_rr(Alu::Add, len, scratch, true);
        self.asm
            .alu_rm(Alu::Cmp, scratch, regs::engine(), ENGINE_MEMORY_LEN as i32, true);
        self.trap_if(CmpKind::GtU, STATUS_MEMORY_OUT_OF_BOUNDS, sp_rel);

        let (backward, forward, done) = (
            self.asm.buf.new_label(),
            self.asm.buf.new_label(),
            self.asm.buf.new_label(),
        );
        self.asm.alu_ri(Alu::Cmp, 0, len, true);
        self.asm.jcc(Cc::E, done);
        self.asm.alu_rr(Alu::Add, regs::memory_base(), src, true);
        self.asm.alu_rr(Alu::Add, regs::memory_base(), dst, true);
        self.asm.alu_rr(Alu::Cmp, src, dst, true);
        self.asm.jcc(Cc::A, backward);

        self.asm.buf.bind_label(forward);
        self.asm.load_zx(scratch, src, 0, 1);
        self.asm.store(scratch, dst, 0, 1);
        self.asm.alu_ri(Alu::Add, 1, src, true);
        self.asm.alu_ri(Alu::Add, 1, dst, true);
        self.asm.alu_ri(Alu::Sub, 1, len, true);
        self.asm.jcc(Cc::Ne, forward);
        self.asm.jmp(done);

        self.asm.buf.bind_label(backward);
        let bwd = self.asm.buf.new_label();
        self.asm.buf.bind_label(bwd);
        self.asm.alu_ri(Alu::Sub, 1, len, true);
        self.asm.load_zx_indexed(scratch, src, len, 0, 1);
        self.asm.store_indexed(scratch, dst, len, 0, 1);
        self.asm.alu_ri(Alu::Cmp, 0, len, true);
        self.asm.jcc(Cc::Ne, bwd);

        self.asm.buf.bind_label(done);
    }

    fn memory_fill_loop(&mut self, dst: Reg, val: Reg, len: Reg, sp_rel: u32) {
        let scratch = regs::scratch();
        self.asm.mov_rr(dst, scratch, true);
        self.asm.alu_rr(Alu::Add, len, scratch, true);
        self.asm
            .alu_rm(Alu::Cmp, scratch, regs::engine(), ENGINE_MEMORY_LEN as i32, true);
        self.trap_if(CmpKind::GtU, STATUS_MEMORY_OUT_OF_BOUNDS, sp_rel);

        let (head, done) = (self.asm.buf.new_label(), self.asm.buf.new_label());
        self.asm.alu_ri(Alu::Cmp, 0, len, true);
        self.asm.jcc(Cc::E, done);
        self.asm.alu_rr(Alu::Add, regs::memory_base(), dst, true);
        self.asm.buf.bind_label(head);
        self.asm.store(val, dst, 0, 1);
        self.asm.alu_ri(Alu::Add, 1, dst, true);
        self.asm.alu_ri(Alu::Sub, 1, len, true);
        self.asm.jcc(Cc::Ne, head);
        self.asm.buf.bind_label(done);
    }

    fn memory_init_loop(&mut self, dst: Reg, src: Reg, len: Reg, tmp: Reg, data_index: u32,
        sp_rel: u32) {
        let scratch = regs::scratch();
        let record = (data_index * 16) as i32;
        self.load_engine(scratch, ENGINE_DATA_INSTANCES_ELEMENT0);
        self.asm
            .load_zx(scratch, scratch, record + PASSIVE_INSTANCE_LEN as i32, 8);
        self.asm.mov_rr(src, tmp, true);
        self.asm.alu_rr(Alu::Add, len, tmp, true);
        self.asm.alu_rr(Alu::Cmp, scratch, tmp, true);
        self.trap_if(CmpKind::GtU, STATUS_MEMORY_OUT_OF_BOUNDS, sp_rel);
        self.asm.mov_rr(dst, tmp, true);
        self.asm.alu_rr(Alu::Add, len, tmp, true);
        self.asm
            .alu_rm(Alu::Cmp, tmp, regs::engine(), ENGINE_MEMORY_LEN as i32, true);
        self.trap_if(CmpKind::GtU, STATUS_MEMORY_OUT_OF_BOUNDS, sp_rel);

        let (head, done) = (self.asm.buf.new_label(), self.asm.buf.new_label());
        self.asm.alu_ri(Alu::Cmp, 0, len, true);
        self.asm.jcc(Cc::E, done);
        self.load_engine(scratch, ENGINE_DATA_INSTANCES_ELEMENT0);
        self.asm
            .load_zx(scratch, scratch, record + PASSIVE_INSTANCE_PTR as i32, 8);
        self.asm.alu_rr(Alu::Add, scratch, src, true);
        self.asm.alu_rr(Alu::Add, regs::memory_base(), dst, true);
        self.asm.buf.bind_label(head);
        self.asm.load_zx(tmp, src, 0, 1);
        self.asm.store(tmp, dst, 0, 1);
        self.asm.alu_ri(Alu::Add, 1, src, true);
        self.asm.alu_ri(Alu::Add, 1, dst, true);
        self.asm.alu_ri(Alu::Sub, 1, len, true);
        self.asm.jcc(Cc::Ne, head);
        self.asm.buf.bind_label(done);
    }

    fn table_copy_loop(&mut self, dst_table: u32, src_table: u32, dst: Reg, src: Reg, len: Reg,
        tmp: Reg, sp_rel: u32) {
        let scratch = regs::scratch();
        // Source bound.
        self.load_engine(scratch, ENGINE_TABLES_ELEMENT0);
        self.asm.load_zx(scratch, scratch, (src_table * 8) as i32, 8);
        self.asm.mov_rr(src, tmp, true);
        self.asm.alu_rr(Alu::Add, len, tmp, true);
        self.asm
            .alu_rm(Alu::Cmp, tmp, scratch, TABLE_INSTANCE_REFERENCES_LEN as i32, true);
        self.trap_if(CmpKind::GtU, STATUS_INVALID_TABLE_ACCESS, sp_rel);
        // Destination bound.
        self.load_engine(scratch, ENGINE_TABLES_ELEMENT0);
        self.asm.load_zx(scratch, scratch, (dst_table * 8) as i32, 8);
        self.asm.mov_rr(dst, tmp, true);
        self.asm.alu_rr(Alu::Add, len, tmp, true);
        self.asm
            .alu_rm(Alu::Cmp, tmp, scratch, TABLE_INSTANCE_REFERENCES_LEN as i32, true);
        self.trap_if(CmpKind::GtU, STATUS_INVALID_TABLE_ACCESS, sp_rel);

        let (backward, forward, done) = (
            self.asm.buf.new_label(),
            self.asm.buf.new_label(),
            self.asm.buf.new_label(),
        );
        self.asm.alu_ri(Alu::Cmp, 0, len, true);
        self.asm.jcc(Cc::E, done);
        // scratch still holds the destination table instance.
        self.asm
            .load_zx(scratch, scratch, TABLE_INSTANCE_REFERENCES as i32, 8);
        self.asm.lea_indexed(dst, scratch, dst, 3, 0);
        self.load_engine(scratch, ENGINE_TABLES_ELEMENT0);
        self.asm.load_zx(scratch, scratch, (src_table * 8) as i32, 8);
        self.asm
            .load_zx(scratch, scratch, TABLE_INSTANCE_REFERENCES as i32, 8);
        self.asm.lea_indexed(src, scratch, src, 3, 0);
        self.asm.alu_rr(Alu::Cmp, src, dst, true);
        self.asm.jcc(Cc::A, backward);

        self.asm.buf.bind_label(forward);
        self.asm.load_zx(tmp, src, 0, 8);
        self.asm.store(tmp, dst, 0, 8);
        self.asm.alu_ri(Alu::Add, 8, src, true);
        self.asm.alu_ri(Alu::Add, 8, dst, true);
        self.asm.alu_ri(Alu::Sub, 1, len, true);
        self.asm.jcc(Cc::Ne, forward);
        self.asm.jmp(done);

        self.asm.buf.bind_label(backward);
        let bwd = self.asm.buf.new_label();
        self.asm.buf.bind_label(bwd);
        self.asm.alu_ri(Alu::Sub, 1, len, true);
        self.asm.load_zx_indexed(tmp, src, len, 3, 8);
        self.asm.store_indexed(tmp, dst, len, 3, 8);
        self.asm.alu_ri(Alu::Cmp, 0, len, true);
        self.asm.jcc(Cc::Ne, bwd);

        self.asm.buf.bind_label(done);
    }

    fn table_init_loop(&mut self, table_index: u32, elem_index: u32, dst: Reg, src: Reg,
        len: Reg, tmp: Reg, sp_rel: u32) {
        let scratch = regs::scratch();
        let record = (elem_index * 16) as i32;
        self.load_engine(scratch, ENGINE_ELEMENT_INSTANCES_ELEMENT0);
        self.asm
            .load_zx(scratch, scratch, record + PASSIVE_INSTANCE_LEN as i32, 8);
        self.asm.mov_rr(src, tmp, true);
        self.asm.alu_rr(Alu::Add, len, tmp, true);
        self.asm.alu_rr(Alu::Cmp, scratch, tmp, true);
        self.trap_if(CmpKind::GtU, STATUS_INVALID_TABLE_ACCESS, sp_rel);
        self.load_engine(scratch, ENGINE_TABLES_ELEMENT0);
        self.asm.load_zx(scratch, scratch, (table_index * 8) as i32, 8);
        self.asm.mov_rr(dst, tmp, true);
        self.asm.alu_rr(Alu::Add, len, tmp, true);
        self.asm
            .alu_rm(Alu::Cmp, tmp, scratch, TABLE_INSTANCE_REFERENCES_LEN as i32, true);
        self.trap_if(CmpKind::GtU, STATUS_INVALID_TABLE_ACCESS, sp_rel);

        let (head, done) = (self.asm.buf.new_label(), self.asm.buf.new_label());
        self.asm.alu_ri(Alu::Cmp, 0, len, true);
        self.asm.jcc(Cc::E, done);
        self.asm
            .load_zx(scratch, scratch, TABLE_INSTANCE_REFERENCES as i32, 8);
        self.asm.lea_indexed(dst, scratch, dst, 3, 0);
        self.load_engine(scratch, ENGINE_ELEMENT_INSTANCES_ELEMENT0);
        self.asm
            .load_zx(scratch, scratch, record + PASSIVE_INSTANCE_PTR as i32, 8);
        self.asm.lea_indexed(src, scratch, src, 3, 0);
        self.asm.buf.bind_label(head);
        self.asm.load_zx(tmp, src, 0, 8);
        self.asm.store(tmp, dst, 0, 8);
        self.asm.alu_ri(Alu::Add, 8, src, true);
        self.asm.alu_ri(Alu::Add, 8, dst, true);
        self.asm.alu_ri(Alu::Sub, 1, len, true);
        self.asm.jcc(Cc::Ne, head);
        self.asm.buf.bind_label(done);
    }

    // ---- atomics ------------------------------------------------------

    fn atomic_load(&mut self, dst: Reg, addr: Reg, _ty: IntTy, width: u8) {
        // x86-TSO loads are acquire.
        self.asm.load_zx(dst, addr, 0, width / 8);
    }

    fn atomic_store(&mut self, src: Reg, addr: Reg, width: u8) {
        // xchg is implicitly locked, giving the release (indeed seq-cst)
        // ordering; the old value clobbers src, which the caller discards.
        self.asm.xchg_mem(src, addr, width / 8);
    }

    fn atomic_rmw(&mut self, op: AtomicRmwOp, operand: Reg, dst: Reg, addr: Reg, _ty: IntTy,
        width: u8, tmp: Reg) {
        let w = width == 64;
        let bytes = width / 8;
        match op {
            AtomicRmwOp::Add | AtomicRmwOp::Sub => {
                self.asm.mov_rr(operand, dst, true);
                if op == AtomicRmwOp::Sub {
                    self.asm.neg(dst, w);
                }
                self.asm.lock_xadd(dst, addr, bytes);
                if width < 32 {
                    self.asm.movzx_rr(dst, dst, width);
                }
            }
            AtomicRmwOp::Xchg => {
                self.asm.mov_rr(operand, dst, true);
                self.asm.xchg_mem(dst, addr, bytes);
                if width < 32 {
                    self.asm.movzx_rr(dst, dst, width);
                }
            }
            AtomicRmwOp::And | AtomicRmwOp::Or | AtomicRmwOp::Xor => {
                debug_assert_eq!(dst, regs::rax());
                let alu = match op {
                    AtomicRmwOp::And => Alu::And,
                    AtomicRmwOp::Or => Alu::Or,
                    _ => Alu::Xor,
                };
                let retry = self.asm.buf.new_label();
                self.asm.load_zx(dst, addr, 0, bytes);
                self.asm.buf.bind_label(retry);
                self.asm.mov_rr(dst, tmp, true);
                self.asm.alu_rr(alu, operand, tmp, w);
                self.asm.lock_cmpxchg(tmp, addr, bytes);
                self.asm.jcc(Cc::Ne, retry);
            }
        }
    }

    fn atomic_cmpxchg(&mut self, expected: Reg, replacement: Reg, addr: Reg, _ty: IntTy,
        width: u8, _tmp: Reg) {
        debug_assert_eq!(expected, regs::rax());
        self.asm.lock_cmpxchg(replacement, addr, width / 8);
        if width < 32 {
            self.asm.movzx_rr(expected, expected, width);
        }
    }

    fn fence(&mut self) {
        self.asm.mfence();
    }

    // ---- vectors ------------------------------------------------------

    fn v128_const(&mut self, dst: Reg, lo: u64, hi: u64) {
        if lo == 0 && hi == 0 {
            self.pxor_self(dst);
            return;
        }
        self.asm.mov_ri(regs::scratch(), lo, true);
        self.asm.sse_gp(true, dst, regs::scratch(), true);
        if hi != 0 {
            self.asm.mov_ri(regs::scratch(), hi, true);
            self.asm
                .sse_rr_imm(0x66, Map::_0F3A, 0x22, dst, regs::scratch(), true, 1);
        }
    }

    fn v128_mov(&mut self, src: Reg, dst: Reg) {
        self.movaps(src, dst);
    }

    fn v128_add(&mut self, shape: VecShape, src: Reg, dst: Reg) {
        match shape {
            VecShape::I8x16 => self.sse(0x66, Map::_0F, 0xfc, dst, src),
            VecShape::I16x8 => self.sse(0x66, Map::_0F, 0xfd, dst, src),
            VecShape::I32x4 => self.sse(0x66, Map::_0F, 0xfe, dst, src),
            VecShape::I64x2 => self.sse(0x66, Map::_0F, 0xd4, dst, src),
            VecShape::F32x4 => self.sse(0, Map::_0F, 0x58, dst, src),
            VecShape::F64x2 => self.sse(0x66, Map::_0F, 0x58, dst, src),
        }
    }

    fn v128_sub(&mut self, shape: VecShape, src: Reg, dst: Reg) {
        match shape {
            VecShape::I8x16 => self.sse(0x66, Map::_0F, 0xf8, dst, src),
            VecShape::I16x8 => self.sse(0x66, Map::_0F, 0xf9, dst, src),
            VecShape::I32x4 => self.sse(0x66, Map::_0F, 0xfa, dst, src),
            VecShape::I64x2 => self.sse(0x66, Map::_0F, 0xfb, dst, src),
            VecShape::F32x4 => self.sse(0, Map::_0F, 0x5c, dst, src),
            VecShape::F64x2 => self.sse(0x66, Map::_0F, 0x5c, dst, src),
        }
    }

    fn v128_mul(&mut self, shape: VecShape, src: Reg, dst: Reg, tmp: Reg) {
        let sv = regs::scratch_v();
        match shape {
            VecShape::I16x8 => self.sse(0x66, Map::_0F, 0xd5, dst, src),
            VecShape::I32x4 => self.sse(0x66, Map::_0F38, 0x40, dst, src),
            VecShape::F32x4 => self.sse(0, Map::_0F, 0x59, dst, src),
            VecShape::F64x2 => self.sse(0x66, Map::_0F, 0x59, dst, src),
            VecShape::I64x2 => {
                // Three 32x32 partial products per lane.
                self.movaps(dst, tmp);
                self.pshift_imm(0x73, 2, tmp, 32);
                self.sse(0x66, Map::_0F, 0xf4, tmp, src);
                self.movaps(src, sv);
                self.pshift_imm(0x73, 2, sv, 32);
                self.sse(0x66, Map::_0F, 0xf4, sv, dst);
                self.sse(0x66, Map::_0F, 0xd4, tmp, sv);
                self.pshift_imm(0x73, 6, tmp, 32);
                self.sse(0x66, Map::_0F, 0xf4, dst, src);
                self.sse(0x66, Map::_0F, 0xd4, dst, tmp);
            }
            VecShape::I8x16 => unreachable!("i8x16 has no lanewise multiply"),
        }
    }

    fn v128_neg(&mut self, shape: VecShape, dst: Reg) {
        let sv = regs::scratch_v();
        match shape {
            VecShape::F32x4 => self.sse_c(0, Map::_0F, 0x57, dst, c32(0x8000_0000)),
            VecShape::F64x2 => self.sse_c(0, Map::_0F, 0x57, dst, c64(0x8000_0000_0000_0000)),
            _ => {
                self.pxor_self(sv);
                self.v128_sub(shape, dst, sv);
                self.movaps(sv, dst);
            }
        }
    }

    fn v128_abs(&mut self, shape: VecShape, dst: Reg) {
        let sv = regs::scratch_v();
        match shape {
            VecShape::I8x16 => self.sse(0x66, Map::_0F38, 0x1c, dst, dst),
            VecShape::I16x8 => self.sse(0x66, Map::_0F38, 0x1d, dst, dst),
            VecShape::I32x4 => self.sse(0x66, Map::_0F38, 0x1e, dst, dst),
            VecShape::I64x2 => {
                self.asm.sse_rr_imm(0x66, Map::_0F, 0x70, sv, dst, false, 0xf5);
                self.pshift_imm(0x72, 4, sv, 31);
                self.sse(0x66, Map::_0F, 0xef, dst, sv);
                self.sse(0x66, Map::_0F, 0xfb, dst, sv);
            }
            VecShape::F32x4 => self.sse_c(0, Map::_0F, 0x54, dst, c32(0x7fff_ffff)),
            VecShape::F64x2 => self.sse_c(0, Map::_0F, 0x54, dst, c64(0x7fff_ffff_ffff_ffff)),
        }
    }

    fn v128_min(&mut self, shape: VecShape, sign: Sign, src: Reg, dst: Reg, tmp: Reg) {
        match (shape, sign) {
            (VecShape::I8x16, Sign::Signed) => self.sse(0x66, Map::_0F38, 0x38, dst, src),
            (VecShape::I8x16, Sign::Unsigned) => self.sse(0x66, Map::_0F, 0xda, dst, src),
            (VecShape::I16x8, Sign::Signed) => self.sse(0x66, Map::_0F, 0xea, dst, src),
            (VecShape::I16x8, Sign::Unsigned) => self.sse(0x66, Map::_0F38, 0x3a, dst, src),
            (VecShape::I32x4, Sign::Signed) => self.sse(0x66, Map::_0F38, 0x39, dst, src),
            (VecShape::I32x4, Sign::Unsigned) => self.sse(0x66, Map::_0F38, 0x3b, dst, src),
            (VecShape::F32x4, _) => {
                self.movaps(src, tmp);
                self.sse(0, Map::_0F, 0x5d, tmp, dst);
                self.sse(0, Map::_0F, 0x5d, dst, src);
                self.sse(0, Map::_0F, 0x56, tmp, dst);
                self.asm.sse_rr_imm(0, Map::_0F, 0xc2, dst, tmp, false, 3);
                self.sse(0, Map::_0F, 0x56, tmp, dst);
                self.pshift_imm(0x72, 2, dst, 10);
                self.sse(0, Map::_0F, 0x55, dst, tmp);
            }
            (VecShape::F64x2, _) => {
                self.movaps(src, tmp);
                self.sse(0x66, Map::_0F, 0x5d, tmp, dst);
                self.sse(0x66, Map::_0F, 0x5d, dst, src);
                self.sse(0x66, Map::_0F, 0x56, tmp, dst);
                self.asm.sse_rr_imm(0x66, Map::_0F, 0xc2, dst, tmp, false, 3);
                self.sse(0x66, Map::_0F, 0x56, tmp, dst);
                self.pshift_imm(0x73, 2, dst, 13);
                self.sse(0x66, Map::_0F, 0x55, dst, tmp);
            }
            (VecShape::I64x2, _) => unreachable!("i64x2 has no lanewise min"),
        }
    }

    fn v128_max(&mut self, shape: VecShape, sign: Sign, src: Reg, dst: Reg, tmp: Reg) {
        match (shape, sign) {
            (VecShape::I8x16, Sign::Signed) => self.sse(0x66, Map::_0F38, 0x3c, dst, src),
            (VecShape::I8x16, Sign::Unsigned) => self.sse(0x66, Map::_0F, 0xde, dst, src),
            (VecShape::I16x8, Sign::Signed) => self.sse(0x66, Map::_0F, 0xee, dst, src),
            (VecShape::I16x8, Sign::Unsigned) => self.sse(0x66, Map::_0F38, 0x3e, dst, src),
            (VecShape::I32x4, Sign::Signed) => self.sse(0x66, Map::_0F38, 0x3d, dst, src),
            (VecShape::I32x4, Sign::Unsigned) => self.sse(0x66, Map::_0F38, 0x3f, dst, src),
            (VecShape::F32x4, _) => {
                self.movaps(src, tmp);
                self.sse(0, Map::_0F, 0x5f, tmp, dst);
                self.sse(0, Map::_0F, 0x5f, dst, src);
                self.sse(0, Map::_0F, 0x57, dst, tmp);
                self.sse(0, Map::_0F, 0x56, tmp, dst);
                self.sse(0, Map::_0F, 0x5c, tmp, dst);
                self.asm.sse_rr_imm(0, Map::_0F, 0xc2, dst, tmp, false, 3);
                self.pshift_imm(0x72, 2, dst, 10);
                self.sse(0, Map::_0F, 0x55, dst, tmp);
            }
            (VecShape::F64x2, _) => {
                self.movaps(src, tmp);
                self.sse(0x66, Map::_0F, 0x5f, tmp, dst);
                self.sse(0x66, Map::_0F, 0x5f, dst, src);
                self.sse(0x66, Map::_0F, 0x57, dst, tmp);
                self.sse(0x66, Map::_0F, 0x56, tmp, dst);
                self.sse(0x66, Map::_0F, 0x5c, tmp, dst);
                self.asm.sse_rr_imm(0x66, Map::_0F, 0xc2, dst, tmp, false, 3);
                self.pshift_imm(0x73, 2, dst, 13);
                self.sse(0x66, Map::_0F, 0x55, dst, tmp);
            }
            (VecShape::I64x2, _) => unreachable!("i64x2 has no lanewise max"),
        }
    }

    fn v128_avgr(&mut self, shape: VecShape, src: Reg, dst: Reg) {
        match shape {
            VecShape::I8x16 => self.sse(0x66, Map::_0F, 0xe0, dst, src),
            VecShape::I16x8 => self.sse(0x66, Map::_0F, 0xe3, dst, src),
            _ => unreachable!("avgr_u is 8- and 16-lane only"),
        }
    }

    fn v128_add_sat(&mut self, shape: VecShape, sign: Sign, src: Reg, dst: Reg) {
        let op = match (shape, sign) {
            (VecShape::I8x16, Sign::Signed) => 0xec,
            (VecShape::I8x16, Sign::Unsigned) => 0xdc,
            (VecShape::I16x8, Sign::Signed) => 0xed,
            (VecShape::I16x8, Sign::Unsigned) => 0xdd,
            _ => unreachable!("saturating add is 8- and 16-lane only"),
        };
        self.sse(0x66, Map::_0F, op, dst, src);
    }

    fn v128_sub_sat(&mut self, shape: VecShape, sign: Sign, src: Reg, dst: Reg) {
        let op = match (shape, sign) {
            (VecShape::I8x16, Sign::Signed) => 0xe8,
            (VecShape::I8x16, Sign::Unsigned) => 0xd8,
            (VecShape::I16x8, Sign::Signed) => 0xe9,
            (VecShape::I16x8, Sign::Unsigned) => 0xd9,
            _ => unreachable!("saturating sub is 8- and 16-lane only"),
        };
        self.sse(0x66, Map::_0F, op, dst, src);
    }

    fn v128_shl(&mut self, shape: VecShape, amount: Reg, dst: Reg, tmp: Reg) {
        self.shift_amount_to_xmm(amount, shape.lane_bits(), tmp);
        match shape {
            VecShape::I16x8 => self.sse(0x66, Map::_0F, 0xf1, dst, tmp),
            VecShape::I32x4 => self.sse(0x66, Map::_0F, 0xf2, dst, tmp),
            VecShape::I64x2 => self.sse(0x66, Map::_0F, 0xf3, dst, tmp),
            VecShape::I8x16 => {
                // Shift as words, then mask out the bits that crossed a
                // byte boundary; masks live in an 8-entry table.
                self.sse(0x66, Map::_0F, 0xf1, dst, tmp);
                let mut table = Vec::with_capacity(128);
                for s in 0..8u32 {
                    table.extend_from_slice(&c8((0xffu32 << s) as u8));
                }
                let label = self.asm.buf.add_const(&table);
                self.asm.lea_rip(amount, label);
                self.asm.shift_i(4, 4, regs::scratch(), true);
                self.asm
                    .sse_rm_indexed(0xf3, Map::_0F, 0x6f, tmp, amount, regs::scratch(), 0);
                self.sse(0x66, Map::_0F, 0xdb, dst, tmp);
            }
            _ => unreachable!("float shapes do not shift"),
        }
    }

    fn v128_shr(&mut self, shape: VecShape, sign: Sign, amount: Reg, dst: Reg, tmp: Reg) {
        self.shift_amount_to_xmm(amount, shape.lane_bits(), tmp);
        let sv = regs::scratch_v();
        match (shape, sign) {
            (VecShape::I16x8, Sign::Unsigned) => self.sse(0x66, Map::_0F, 0xd1, dst, tmp),
            (VecShape::I32x4, Sign::Unsigned) => self.sse(0x66, Map::_0F, 0xd2, dst, tmp),
            (VecShape::I64x2, Sign::Unsigned) => self.sse(0x66, Map::_0F, 0xd3, dst, tmp),
            (VecShape::I16x8, Sign::Signed) => self.sse(0x66, Map::_0F, 0xe1, dst, tmp),
            (VecShape::I32x4, Sign::Signed) => self.sse(0x66, Map::_0F, 0xe2, dst, tmp),
            (VecShape::I64x2, Sign::Signed) => {
                // (x >>u s ^ m) - m with m = sign bit >>u s.
                let label = self.asm.buf.add_const16(c64(0x8000_0000_0000_0000));
                self.asm.sse_rip(0xf3, Map::_0F, 0x6f, sv, label);
                self.sse(0x66, Map::_0F, 0xd3, sv, tmp);
                self.sse(0x66, Map::_0F, 0xd3, dst, tmp);
                self.sse(0x66, Map::_0F, 0xef, dst, sv);
                self.sse(0x66, Map::_0F, 0xfb, dst, sv);
            }
            (VecShape::I8x16, Sign::Unsigned) => {
                self.sse(0x66, Map::_0F, 0xd1, dst, tmp);
                let mut table = Vec::with_capacity(128);
                for s in 0..8u32 {
                    table.extend_from_slice(&c8((0xffu32 >> s) as u8));
                }
                let label = self.asm.buf.add_const(&table);
                self.asm.lea_rip(amount, label);
                self.asm.shift_i(4, 4, regs::scratch(), true);
                self.asm
                    .sse_rm_indexed(0xf3, Map::_0F, 0x6f, tmp, amount, regs::scratch(), 0);
                self.sse(0x66, Map::_0F, 0xdb, dst, tmp);
            }
            (VecShape::I8x16, Sign::Signed) => {
                // Widen each half to words, shift arithmetically by s+8,
                // and pack with signed saturation.
                self.asm.alu_ri(Alu::Add, 8, regs::scratch(), false);
                self.asm.sse_gp(true, tmp, regs::scratch(), false);
                self.movaps(dst, sv);
                self.sse(0x66, Map::_0F, 0x60, sv, sv);
                self.sse(0x66, Map::_0F, 0x68, dst, dst);
                self.sse(0x66, Map::_0F, 0xe1, sv, tmp);
                self.sse(0x66, Map::_0F, 0xe1, dst, tmp);
                self.sse(0x66, Map::_0F, 0x63, sv, dst);
                self.movaps(sv, dst);
            }
            _ => unreachable!("float shapes do not shift"),
        }
    }

    fn v128_cmp(&mut self, shape: VecShape, kind: CmpKind, src: Reg, dst: Reg, tmp: Reg) {
        use CmpKind::*;
        let sv = regs::scratch_v();
        let pcmpeq = |m: &mut Self, d: Reg, s: Reg| match shape {
            VecShape::I8x16 => m.sse(0x66, Map::_0F, 0x74, d, s),
            VecShape::I16x8 => m.sse(0x66, Map::_0F, 0x75, d, s),
            VecShape::I32x4 => m.sse(0x66, Map::_0F, 0x76, d, s),
            VecShape::I64x2 => m.sse(0x66, Map::_0F38, 0x29, d, s),
            _ => unreachable!(),
        };
        let pcmpgt = |m: &mut Self, d: Reg, s: Reg| match shape {
            VecShape::I8x16 => m.sse(0x66, Map::_0F, 0x64, d, s),
            VecShape::I16x8 => m.sse(0x66, Map::_0F, 0x65, d, s),
            VecShape::I32x4 => m.sse(0x66, Map::_0F, 0x66, d, s),
            VecShape::I64x2 => m.sse(0x66, Map::_0F38, 0x37, d, s),
            _ => unreachable!(),
        };
        if shape.is_float() {
            let pfx = if shape == VecShape::F64x2 { 0x66 } else { 0 };
            match kind {
                Eq => self.asm.sse_rr_imm(pfx, Map::_0F, 0xc2, dst, src, false, 0),
                Ne => self.asm.sse_rr_imm(pfx, Map::_0F, 0xc2, dst, src, false, 4),
                LtS | LtU => self.asm.sse_rr_imm(pfx, Map::_0F, 0xc2, dst, src, false, 1),
                LeS | LeU => self.asm.sse_rr_imm(pfx, Map::_0F, 0xc2, dst, src, false, 2),
                GtS | GtU => {
                    self.movaps(src, tmp);
                    self.asm.sse_rr_imm(pfx, Map::_0F, 0xc2, tmp, dst, false, 1);
                    self.movaps(tmp, dst);
                }
                GeS | GeU => {
                    self.movaps(src, tmp);
                    self.asm.sse_rr_imm(pfx, Map::_0F, 0xc2, tmp, dst, false, 2);
                    self.movaps(tmp, dst);
                }
            }
            return;
        }
        // Unsigned 64-lane compares go through a sign-bit flip.
        if shape == VecShape::I64x2 && matches!(kind, LtU | GtU | LeU | GeU) {
            let label = self.asm.buf.add_const16(c64(0x8000_0000_0000_0000));
            self.asm.sse_rip(0xf3, Map::_0F, 0x6f, sv, label);
            self.movaps(src, tmp);
            self.sse(0x66, Map::_0F, 0xef, tmp, sv);
            self.sse(0x66, Map::_0F, 0xef, dst, sv);
            match kind {
                GtU => pcmpgt(self, dst, tmp),
                LtU => {
                    pcmpgt(self, tmp, dst);
                    self.movaps(tmp, dst);
                }
                GeU => {
                    pcmpgt(self, tmp, dst);
                    self.movaps(tmp, dst);
                    self.all_ones(sv);
                    self.sse(0x66, Map::_0F, 0xef, dst, sv);
                }
                _ => {
                    pcmpgt(self, dst, tmp);
                    self.all_ones(sv);
                    self.sse(0x66, Map::_0F, 0xef, dst, sv);
                }
            }
            return;
        }
        let pminu = |m: &mut Self, d: Reg, s: Reg| match shape {
            VecShape::I8x16 => m.sse(0x66, Map::_0F, 0xda, d, s),
            VecShape::I16x8 => m.sse(0x66, Map::_0F38, 0x3a, d, s),
            VecShape::I32x4 => m.sse(0x66, Map::_0F38, 0x3b, d, s),
            _ => unreachable!(),
        };
        let pmaxu = |m: &mut Self, d: Reg, s: Reg| match shape {
            VecShape::I8x16 => m.sse(0x66, Map::_0F, 0xde, d, s),
            VecShape::I16x8 => m.sse(0x66, Map::_0F38, 0x3e, d, s),
            VecShape::I32x4 => m.sse(0x66, Map::_0F38, 0x3f, d, s),
            _ => unreachable!(),
        };
        match kind {
            Eq => pcmpeq(self, dst, src),
            Ne => {
                pcmpeq(self, dst, src);
                self.all_ones(sv);
                self.sse(0x66, Map::_0F, 0xef, dst, sv);
            }
            GtS => pcmpgt(self, dst, src),
            LtS => {
                self.movaps(src, tmp);
                pcmpgt(self, tmp, dst);
                self.movaps(tmp, dst);
            }
            GeS => {
                self.movaps(src, tmp);
                pcmpgt(self, tmp, dst);
                self.movaps(tmp, dst);
                self.all_ones(sv);
                self.sse(0x66, Map::_0F, 0xef, dst, sv);
            }
            LeS => {
                pcmpgt(self, dst, src);
                self.all_ones(sv);
                self.sse(0x66, Map::_0F, 0xef, dst, sv);
            }
            LeU => {
                self.movaps(dst, tmp);
                pminu(self, tmp, src);
                pcmpeq(self, dst, tmp);
            }
            GeU => {
                self.movaps(dst, tmp);
                pmaxu(self, tmp, src);
                pcmpeq(self, dst, tmp);
            }
            GtU => {
                self.movaps(dst, tmp);
                pminu(self, tmp, src);
                pcmpeq(self, dst, tmp);
                self.all_ones(sv);
                self.sse(0x66, Map::_0F, 0xef, dst, sv);
            }
            LtU => {
                self.movaps(dst, tmp);
                pmaxu(self, tmp, src);
                pcmpeq(self, dst, tmp);
                self.all_ones(sv);
                self.sse(0x66, Map::_0F, 0xef, dst, sv);
            }
        }
    }

    fn v128_and(&mut self, src: Reg, dst: Reg) {
        self.sse(0x66, Map::_0F, 0xdb, dst, src);
    }

    fn v128_or(&mut self, src: Reg, dst: Reg) {
        self.sse(0x66, Map::_0F, 0xeb, dst, src);
    }

    fn v128_xor(&mut self, src: Reg, dst: Reg) {
        self.sse(0x66, Map::_0F, 0xef, dst, src);
    }

    fn v128_not(&mut self, dst: Reg) {
        let sv = regs::scratch_v();
        self.all_ones(sv);
        self.sse(0x66, Map::_0F, 0xef, dst, sv);
    }

    fn v128_andnot(&mut self, src: Reg, dst: Reg) {
        // pandn computes ~first & second, so flip through the scratch.
        let sv = regs::scratch_v();
        self.movaps(src, sv);
        self.sse(0x66, Map::_0F, 0xdf, sv, dst);
        self.movaps(sv, dst);
    }

    fn v128_bitselect(&mut self, v1: Reg, v2: Reg, mask: Reg) {
        self.sse(0x66, Map::_0F, 0xdb, v1, mask);
        self.sse(0x66, Map::_0F, 0xdf, mask, v2);
        self.sse(0x66, Map::_0F, 0xeb, mask, v1);
    }

    fn v128_splat(&mut self, shape: VecShape, src: Reg, dst: Reg) {
        let sv = regs::scratch_v();
        match shape {
            VecShape::I8x16 => {
                self.asm.sse_gp(true, dst, src, false);
                self.pxor_self(sv);
                self.sse(0x66, Map::_0F38, 0x00, dst, sv);
            }
            VecShape::I16x8 => {
                self.asm.sse_gp(true, dst, src, false);
                self.asm.sse_rr_imm(0xf2, Map::_0F, 0x70, dst, dst, false, 0);
                self.asm.sse_rr_imm(0x66, Map::_0F, 0x70, dst, dst, false, 0);
            }
            VecShape::I32x4 => {
                self.asm.sse_gp(true, dst, src, false);
                self.asm.sse_rr_imm(0x66, Map::_0F, 0x70, dst, dst, false, 0);
            }
            VecShape::I64x2 => {
                self.asm.sse_gp(true, dst, src, true);
                self.sse(0x66, Map::_0F, 0x6c, dst, dst);
            }
            VecShape::F32x4 => {
                if src != dst {
                    self.movaps(src, dst);
                }
                self.asm.sse_rr_imm(0, Map::_0F, 0xc6, dst, dst, false, 0);
            }
            VecShape::F64x2 => {
                if src != dst {
                    self.movaps(src, dst);
                }
                self.sse(0x66, Map::_0F, 0x14, dst, dst);
            }
        }
    }

    fn v128_extract_lane(&mut self, shape: VecShape, lane: u8, sign: Sign, src: Reg, dst: Reg) {
        match shape {
            VecShape::I8x16 => {
                self.asm
                    .sse_rr_imm(0x66, Map::_0F3A, 0x14, src, dst, false, lane);
                if sign.is_signed() {
                    self.asm.movsx_rr(dst, dst, 8, 32);
                }
            }
            VecShape::I16x8 => {
                self.asm
                    .sse_rr_imm(0x66, Map::_0F3A, 0x15, src, dst, false, lane);
                if sign.is_signed() {
                    self.asm.movsx_rr(dst, dst, 16, 32);
                }
            }
            VecShape::I32x4 => {
                self.asm
                    .sse_rr_imm(0x66, Map::_0F3A, 0x16, src, dst, false, lane);
            }
            VecShape::I64x2 => {
                self.asm
                    .sse_rr_imm(0x66, Map::_0F3A, 0x16, src, dst, true, lane);
            }
            VecShape::F32x4 => {
                self.movaps(src, dst);
                if lane > 0 {
                    self.psrldq(dst, lane * 4);
                }
            }
            VecShape::F64x2 => {
                self.movaps(src, dst);
                if lane > 0 {
                    self.psrldq(dst, 8);
                }
            }
        }
    }

    fn v128_replace_lane(&mut self, shape: VecShape, lane: u8, src: Reg, dst: Reg) {
        match shape {
            VecShape::I8x16 => {
                self.asm
                    .sse_rr_imm(0x66, Map::_0F3A, 0x20, dst, src, false, lane);
            }
            VecShape::I16x8 => {
                self.asm.sse_rr_imm(0x66, Map::_0F, 0xc4, dst, src, false, lane);
            }
            VecShape::I32x4 => {
                self.asm
                    .sse_rr_imm(0x66, Map::_0F3A, 0x22, dst, src, false, lane);
            }
            VecShape::I64x2 => {
                self.asm
                    .sse_rr_imm(0x66, Map::_0F3A, 0x22, dst, src, true, lane);
            }
            VecShape::F32x4 => {
                self.asm
                    .sse_rr_imm(0x66, Map::_0F3A, 0x21, dst, src, false, lane << 4);
            }
            VecShape::F64x2 => {
                if lane == 0 {
                    self.sse(0xf2, Map::_0F, 0x10, dst, src);
                } else {
                    self.asm.sse_rr_imm(0x66, Map::_0F, 0xc6, dst, src, false, 0);
                }
            }
        }
    }

    fn v128_shuffle(&mut self, lanes: &[u8; 16], src: Reg, dst: Reg, tmp: Reg) {
        let sv = regs::scratch_v();
        let mut from_a = [0u8; 16];
        let mut from_b = [0u8; 16];
        for (i, &l) in lanes.iter().enumerate() {
            from_a[i] = if l < 16 { l } else { 0x80 };
            from_b[i] = if l >= 16 { l - 16 } else { 0x80 };
        }
        self.movaps(dst, tmp);
        let a = self.asm.buf.add_const16(from_a);
        self.asm.sse_rip(0x66, Map::_0F38, 0x00, tmp, a);
        self.movaps(src, sv);
        let b = self.asm.buf.add_const16(from_b);
        self.asm.sse_rip(0x66, Map::_0F38, 0x00, sv, b);
        self.movaps(tmp, dst);
        self.sse(0x66, Map::_0F, 0xeb, dst, sv);
    }

    fn v128_swizzle(&mut self, src: Reg, dst: Reg, tmp: Reg) {
        // Saturate indices so anything >= 16 selects zero.
        self.movaps(src, tmp);
        self.sse_c(0x66, Map::_0F, 0xdc, tmp, c8(0x70));
        self.sse(0x66, Map::_0F38, 0x00, dst, tmp);
    }

    fn v128_any_true(&mut self, src: Reg, dst: Reg) {
        self.sse(0x66, Map::_0F38, 0x17, src, src);
        self.asm.mov_ri(dst, 0, false);
        self.asm.setcc(Cc::Ne, dst);
    }

    fn v128_all_true(&mut self, shape: VecShape, src: Reg, dst: Reg, tmp: Reg) {
        self.pxor_self(tmp);
        match shape {
            VecShape::I8x16 => self.sse(0x66, Map::_0F, 0x74, tmp, src),
            VecShape::I16x8 => self.sse(0x66, Map::_0F, 0x75, tmp, src),
            VecShape::I32x4 => self.sse(0x66, Map::_0F, 0x76, tmp, src),
            VecShape::I64x2 => self.sse(0x66, Map::_0F38, 0x29, tmp, src),
            _ => unreachable!("all_true is integer-lane only"),
        }
        self.sse(0x66, Map::_0F38, 0x17, tmp, tmp);
        self.asm.mov_ri(dst, 0, false);
        self.asm.setcc(Cc::E, dst);
    }

    fn v128_bitmask(&mut self, shape: VecShape, src: Reg, dst: Reg, tmp: Reg) {
        match shape {
            VecShape::I8x16 => self.asm.sse_rr(0x66, Map::_0F, 0xd7, dst, src, false),
            VecShape::I16x8 => {
                self.movaps(src, tmp);
                self.sse(0x66, Map::_0F, 0x63, tmp, tmp);
                self.asm.sse_rr(0x66, Map::_0F, 0xd7, dst, tmp, false);
                self.asm.alu_ri(Alu::And, 0xff, dst, false);
            }
            VecShape::I32x4 => self.asm.sse_rr(0, Map::_0F, 0x50, dst, src, false),
            VecShape::I64x2 => self.asm.sse_rr(0x66, Map::_0F, 0x50, dst, src, false),
            _ => unreachable!("bitmask is integer-lane only"),
        }
    }

    fn v128_narrow(&mut self, shape: VecShape, sign: Sign, src: Reg, dst: Reg) {
        match (shape, sign) {
            (VecShape::I16x8, Sign::Signed) => self.sse(0x66, Map::_0F, 0x63, dst, src),
            (VecShape::I16x8, Sign::Unsigned) => self.sse(0x66, Map::_0F, 0x67, dst, src),
            (VecShape::I32x4, Sign::Signed) => self.sse(0x66, Map::_0F, 0x6b, dst, src),
            (VecShape::I32x4, Sign::Unsigned) => self.sse(0x66, Map::_0F38, 0x2b, dst, src),
            _ => unreachable!("narrow sources are 16- and 32-lane"),
        }
    }

    fn v128_extend(&mut self, shape: VecShape, sign: Sign, low: bool, dst: Reg) {
        if !low {
            self.psrldq(dst, 8);
        }
        let op = match (shape, sign) {
            (VecShape::I8x16, Sign::Signed) => 0x20,
            (VecShape::I8x16, Sign::Unsigned) => 0x30,
            (VecShape::I16x8, Sign::Signed) => 0x23,
            (VecShape::I16x8, Sign::Unsigned) => 0x33,
            (VecShape::I32x4, Sign::Signed) => 0x25,
            (VecShape::I32x4, Sign::Unsigned) => 0x35,
            _ => unreachable!("extend sources are integer lanes"),
        };
        self.sse(0x66, Map::_0F38, op, dst, dst);
    }

    fn v128_ext_add_pairwise(&mut self, shape: VecShape, sign: Sign, dst: Reg, tmp: Reg) {
        match (shape, sign) {
            (VecShape::I16x8, Sign::Signed) => {
                self.sse_c(0x66, Map::_0F, 0xf5, dst, c16(1));
            }
            (VecShape::I16x8, Sign::Unsigned) => {
                self.sse_c(0x66, Map::_0F, 0xef, dst, c16(0x8000));
                self.sse_c(0x66, Map::_0F, 0xf5, dst, c16(1));
                self.sse_c(0x66, Map::_0F, 0xfe, dst, c32(0x0001_0000));
            }
            (VecShape::I8x16, Sign::Signed) => {
                let ones = self.asm.buf.add_const16(c8(1));
                self.asm.sse_rip(0xf3, Map::_0F, 0x6f, tmp, ones);
                self.sse(0x66, Map::_0F38, 0x04, tmp, dst);
                self.movaps(tmp, dst);
            }
            (VecShape::I8x16, Sign::Unsigned) => {
                self.sse_c(0x66, Map::_0F38, 0x04, dst, c8(1));
            }
            _ => unreachable!("extadd_pairwise sources are 8- and 16-lane"),
        }
    }

    fn v128_ext_mul(&mut self, shape: VecShape, sign: Sign, low: bool, src: Reg, dst: Reg,
        tmp: Reg) {
        match shape {
            VecShape::I8x16 => {
                self.movaps(src, tmp);
                if !low {
                    self.psrldq(tmp, 8);
                    self.psrldq(dst, 8);
                }
                let ext = if sign.is_signed() { 0x20 } else { 0x30 };
                self.sse(0x66, Map::_0F38, ext, tmp, tmp);
                self.sse(0x66, Map::_0F38, ext, dst, dst);
                self.sse(0x66, Map::_0F, 0xd5, dst, tmp);
            }
            VecShape::I16x8 => {
                self.movaps(dst, tmp);
                self.sse(0x66, Map::_0F, 0xd5, tmp, src);
                let hi_op = if sign.is_signed() { 0xe5 } else { 0xe4 };
                self.sse(0x66, Map::_0F, hi_op, dst, src);
                if low {
                    // Interleave low products with high products.
                    self.sse(0x66, Map::_0F, 0x61, tmp, dst);
                } else {
                    self.sse(0x66, Map::_0F, 0x69, tmp, dst);
                }
                self.movaps(tmp, dst);
            }
            VecShape::I32x4 => {
                let arrange = if low { 0x50 } else { 0xfa };
                self.asm
                    .sse_rr_imm(0x66, Map::_0F, 0x70, dst, dst, false, arrange);
                self.asm.sse_rr_imm(0x66, Map::_0F, 0x70, tmp, src, false, arrange);
                if sign.is_signed() {
                    self.sse(0x66, Map::_0F38, 0x28, dst, tmp);
                } else {
                    self.sse(0x66, Map::_0F, 0xf4, dst, tmp);
                }
            }
            _ => unreachable!("extmul sources are integer lanes"),
        }
    }

    fn v128_q15mulr_sat(&mut self, src: Reg, dst: Reg) {
        let sv = regs::scratch_v();
        self.sse(0x66, Map::_0F38, 0x0b, dst, src);
        // The single wrapping case (-32768 * -32768) must saturate.
        self.movaps(dst, sv);
        self.sse_c(0x66, Map::_0F, 0x75, sv, c16(0x8000));
        self.sse(0x66, Map::_0F, 0xef, dst, sv);
    }

    fn v128_dot(&mut self, src: Reg, dst: Reg) {
        self.sse(0x66, Map::_0F, 0xf5, dst, src);
    }

    fn v128_popcnt(&mut self, dst: Reg, tmp: Reg) {
        let sv = regs::scratch_v();
        let lut: [u8; 16] = [0, 1, 1, 2, 1, 2, 2, 3, 1, 2, 2, 3, 2, 3, 3, 4];
        self.sse_c(0xf3, Map::_0F, 0x6f, sv, c8(0x0f));
        let nibble_mask = sv;
        self.movaps(dst, tmp);
        self.sse(0x66, Map::_0F, 0xdb, tmp, nibble_mask);
        self.pshift_imm(0x71, 2, dst, 4);
        self.sse(0x66, Map::_0F, 0xdb, dst, nibble_mask);
        let table = self.asm.buf.add_const16(lut);
        self.asm.sse_rip(0xf3, Map::_0F, 0x6f, sv, table);
        self.sse(0x66, Map::_0F38, 0x00, sv, tmp);
        let table2 = self.asm.buf.add_const16(lut);
        self.asm.sse_rip(0xf3, Map::_0F, 0x6f, tmp, table2);
        self.sse(0x66, Map::_0F38, 0x00, tmp, dst);
        self.sse(0x66, Map::_0F, 0xfc, tmp, sv);
        self.movaps(tmp, dst);
    }

    fn v128_trunc_sat(&mut self, shape: VecShape, sign: Sign, dst: Reg, tmp: Reg) {
        match (shape, sign) {
            (VecShape::F32x4, Sign::Signed) => {
                self.movaps(dst, tmp);
                self.asm.sse_rr_imm(0, Map::_0F, 0xc2, tmp, tmp, false, 0);
                self.sse(0, Map::_0F, 0x54, dst, tmp);
                let lim = self.asm.buf.add_const16(c32(0x4f00_0000));
                self.asm.sse_rip(0, Map::_0F, 0x28, tmp, lim);
                self.asm.sse_rr_imm(0, Map::_0F, 0xc2, tmp, dst, false, 2);
                self.sse(0xf3, Map::_0F, 0x5b, dst, dst);
                self.sse(0x66, Map::_0F, 0xef, dst, tmp);
            }
            (VecShape::F32x4, Sign::Unsigned) => {
                let sv = regs::scratch_v();
                self.pxor_self(sv);
                self.sse(0, Map::_0F, 0x5f, dst, sv);
                self.all_ones(tmp);
                self.pshift_imm(0x72, 2, tmp, 1);
                self.sse(0, Map::_0F, 0x5b, tmp, tmp);
                self.movaps(dst, sv);
                self.sse(0, Map::_0F, 0x5c, sv, tmp);
                self.asm.sse_rr_imm(0, Map::_0F, 0xc2, tmp, sv, false, 2);
                self.sse(0xf3, Map::_0F, 0x5b, sv, sv);
                self.sse(0x66, Map::_0F, 0xef, sv, tmp);
                self.pxor_self(tmp);
                self.sse(0x66, Map::_0F38, 0x3d, sv, tmp);
                self.sse(0xf3, Map::_0F, 0x5b, dst, dst);
                self.sse(0x66, Map::_0F, 0xfe, dst, sv);
            }
            (VecShape::F64x2, Sign::Signed) => {
                self.movaps(dst, tmp);
                self.asm.sse_rr_imm(0x66, Map::_0F, 0xc2, tmp, tmp, false, 0);
                self.sse(0, Map::_0F, 0x54, dst, tmp);
                self.sse_c(0x66, Map::_0F, 0x5d, dst, c64(2147483647.0f64.to_bits()));
                self.sse(0x66, Map::_0F, 0xe6, dst, dst);
            }
            (VecShape::F64x2, Sign::Unsigned) => {
                self.pxor_self(tmp);
                self.sse(0x66, Map::_0F, 0x5f, dst, tmp);
                self.sse_c(0x66, Map::_0F, 0x5d, dst, c64(4294967295.0f64.to_bits()));
                self.asm.sse_rr_imm(0x66, Map::_0F3A, 0x09, dst, dst, false, 3);
                self.sse_c(0x66, Map::_0F, 0x58, dst, c64(0x4330_0000_0000_0000));
                self.asm.sse_rr_imm(0, Map::_0F, 0xc6, dst, tmp, false, 0x88);
            }
            _ => unreachable!("trunc_sat shapes are f32x4 and f64x2"),
        }
    }

    fn v128_convert_i(&mut self, float: VecShape, sign: Sign, dst: Reg, tmp: Reg) {
        match (float, sign) {
            (VecShape::F32x4, Sign::Signed) => self.sse(0, Map::_0F, 0x5b, dst, dst),
            (VecShape::F32x4, Sign::Unsigned) => {
                self.movaps(dst, tmp);
                self.pshift_imm(0x72, 2, tmp, 16);
                self.sse(0, Map::_0F, 0x5b, tmp, tmp);
                self.sse_c(0, Map::_0F, 0x59, tmp, c32(65536.0f32.to_bits()));
                self.sse_c(0x66, Map::_0F, 0xdb, dst, c32(0x0000_ffff));
                self.sse(0, Map::_0F, 0x5b, dst, dst);
                self.sse(0, Map::_0F, 0x58, dst, tmp);
            }
            (VecShape::F64x2, Sign::Signed) => self.sse(0xf3, Map::_0F, 0xe6, dst, dst),
            (VecShape::F64x2, Sign::Unsigned) => {
                self.sse_c(0, Map::_0F, 0x14, dst, c32(0x4330_0000));
                self.sse_c(0x66, Map::_0F, 0x5c, dst, c64(0x4330_0000_0000_0000));
            }
            _ => unreachable!("convert targets are float shapes"),
        }
    }

    fn v128_demote(&mut self, dst: Reg) {
        self.sse(0x66, Map::_0F, 0x5a, dst, dst);
    }

    fn v128_promote(&mut self, dst: Reg) {
        self.sse(0, Map::_0F, 0x5a, dst, dst);
    }

    fn v128_load(&mut self, kind: V128LoadKind, dst: Reg, addr: Reg) {
        match kind {
            V128LoadKind::V128 => self.asm.sse_rm(0xf3, Map::_0F, 0x6f, dst, addr, 0),
            V128LoadKind::S8x8 { sign } => {
                let op = if sign.is_signed() { 0x20 } else { 0x30 };
                self.asm.sse_rm(0x66, Map::_0F38, op, dst, addr, 0);
            }
            V128LoadKind::S16x4 { sign } => {
                let op = if sign.is_signed() { 0x23 } else { 0x33 };
                self.asm.sse_rm(0x66, Map::_0F38, op, dst, addr, 0);
            }
            V128LoadKind::S32x2 { sign } => {
                let op = if sign.is_signed() { 0x25 } else { 0x35 };
                self.asm.sse_rm(0x66, Map::_0F38, op, dst, addr, 0);
            }
            V128LoadKind::Splat { lane_bits: 8 } => {
                self.asm.load_zx(regs::scratch(), addr, 0, 1);
                self.v128_splat(VecShape::I8x16, regs::scratch(), dst);
            }
            V128LoadKind::Splat { lane_bits: 16 } => {
                self.asm.load_zx(regs::scratch(), addr, 0, 2);
                self.v128_splat(VecShape::I16x8, regs::scratch(), dst);
            }
            V128LoadKind::Splat { lane_bits: 32 } => {
                self.asm.sse_rm(0x66, Map::_0F, 0x6e, dst, addr, 0);
                self.asm.sse_rr_imm(0x66, Map::_0F, 0x70, dst, dst, false, 0);
            }
            V128LoadKind::Splat { .. } => {
                self.asm.sse_rm(0xf3, Map::_0F, 0x7e, dst, addr, 0);
                self.sse(0x66, Map::_0F, 0x6c, dst, dst);
            }
            V128LoadKind::Zero32 => self.asm.sse_rm(0xf3, Map::_0F, 0x10, dst, addr, 0),
            V128LoadKind::Zero64 => self.asm.sse_rm(0xf3, Map::_0F, 0x7e, dst, addr, 0),
        }
    }

    fn v128_load_lane(&mut self, lane_bits: u8, lane: u8, dst: Reg, addr: Reg) {
        match lane_bits {
            8 => self
                .asm
                .sse_rm_imm(0x66, Map::_0F3A, 0x20, dst, addr, 0, lane),
            16 => self.asm.sse_rm_imm(0x66, Map::_0F, 0xc4, dst, addr, 0, lane),
            32 => self
                .asm
                .sse_rm_imm(0x66, Map::_0F3A, 0x22, dst, addr, 0, lane),
            _ => self
                .asm
                .sse_rm_w_imm(0x66, Map::_0F3A, 0x22, dst, addr, 0, lane),
        }
    }

    fn v128_store(&mut self, src: Reg, addr: Reg) {
        self.asm.sse_rm(0xf3, Map::_0F, 0x7f, src, addr, 0);
    }

    fn v128_store_lane(&mut self, lane_bits: u8, lane: u8, src: Reg, addr: Reg) {
        match lane_bits {
            8 => self
                .asm
                .sse_rm_imm(0x66, Map::_0F3A, 0x14, src, addr, 0, lane),
            16 => self
                .asm
                .sse_rm_imm(0x66, Map::_0F3A, 0x15, src, addr, 0, lane),
            32 => self
                .asm
                .sse_rm_imm(0x66, Map::_0F3A, 0x16, src, addr, 0, lane),
            _ => self
                .asm
                .sse_rm_w_imm(0x66, Map::_0F3A, 0x16, src, addr, 0, lane),
        }
    }

    fn finalize(self, stack_pointer_ceil: u32) -> Result<(Vec<u8>, Vec<Reloc>)> {
        self.asm.buf.finalize(stack_pointer_ceil)
    }
}

impl MacroAssembler {
    fn trap_if_parity(&mut self, sp_rel: u32) {
        let skip = self.asm.buf.new_label();
        self.asm.jcc(Cc::Np, skip);
        self.emit_exit(STATUS_INVALID_FLOAT_TO_INT_CONVERSION, None, sp_rel, false);
        self.asm.buf.bind_label(skip);
    }

    fn popcnt_fallback(&mut self, src: Reg, dst: Reg, w: bool) {
        let scratch = regs::scratch();
        if src != dst {
            self.asm.mov_rr(src, dst, true);
        }
        if !w {
            self.asm.mov_rr(dst, scratch, false);
            self.asm.shift_i(5, 1, scratch, false);
            self.asm.alu_ri(Alu::And, 0x55555555, scratch, false);
            self.asm.alu_rr(Alu::Sub, scratch, dst, false);
            self.asm.mov_rr(dst, scratch, false);
            self.asm.alu_ri(Alu::And, 0x33333333, scratch, false);
            self.asm.shift_i(5, 2, dst, false);
            self.asm.alu_ri(Alu::And, 0x33333333, dst, false);
            self.asm.alu_rr(Alu::Add, scratch, dst, false);
            self.asm.mov_rr(dst, scratch, false);
            self.asm.shift_i(5, 4, scratch, false);
            self.asm.alu_rr(Alu::Add, scratch, dst, false);
            self.asm.alu_ri(Alu::And, 0x0f0f0f0f, dst, false);
            self.asm.mov_rr(dst, scratch, false);
            self.asm.shift_i(4, 8, scratch, false);
            self.asm.alu_rr(Alu::Add, scratch, dst, false);
            self.asm.mov_rr(dst, scratch, false);
            self.asm.shift_i(4, 16, scratch, false);
            self.asm.alu_rr(Alu::Add, scratch, dst, false);
            self.asm.alu_ri(Alu::And, 0x3f, dst, false);
        } else {
            // Borrow a callee-visible register over the machine stack for
            // the wide masks.
            let aux = [regs::rax(), regs::rcx(), regs::rbx()]
                .into_iter()
                .find(|r| *r != dst)
                .unwrap();
            self.asm.push_r(aux);
            self.asm.mov_ri(aux, 0x5555_5555_5555_5555, true);
            self.asm.mov_rr(dst, scratch, true);
            self.asm.shift_i(5, 1, scratch, true);
            self.asm.alu_rr(Alu::And, aux, scratch, true);
            self.asm.alu_rr(Alu::Sub, scratch, dst, true);
            self.asm.mov_ri(aux, 0x3333_3333_3333_3333, true);
            self.asm.mov_rr(dst, scratch, true);
            self.asm.alu_rr(Alu::And, aux, scratch, true);
            self.asm.shift_i(5, 2, dst, true);
            self.asm.alu_rr(Alu::And, aux, dst, true);
            self.asm.alu_rr(Alu::Add, scratch, dst, true);
            self.asm.mov_rr(dst, scratch, true);
            self.asm.shift_i(5, 4, scratch, true);
            self.asm.alu_rr(Alu::Add, scratch, dst, true);
            self.asm.mov_ri(aux, 0x0f0f_0f0f_0f0f_0f0f, true);
            self.asm.alu_rr(Alu::And, aux, dst, true);
            self.asm.mov_ri(aux, 0x0101_0101_0101_0101, true);
            self.asm.imul_rr(aux, dst, true);
            self.asm.shift_i(5, 56, dst, true);
            self.asm.pop_r(aux);
        }
    }
}
