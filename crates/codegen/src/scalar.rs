//! Scalar operation lowering: constants, integer and float arithmetic,
//! conversions, memory accesses, globals, tables, atomics, and the
//! stack-shape operations (`pick`, `swap`, `select`, `drop`).

use anyhow::{bail, Result};
use capstan_environ::{
    AtomicRmwOp, CmpKind, FloatCmpKind, FloatTy, InclusiveRange, IntTy, MemArg, Sign, ValType,
    ENGINE_DATA_INSTANCES_ELEMENT0, ENGINE_ELEMENT_INSTANCES_ELEMENT0, ENGINE_GLOBALS_ELEMENT0,
    ENGINE_MEMORY_LEN, ENGINE_TABLES_ELEMENT0, GLOBAL_INSTANCE_VAL, PASSIVE_INSTANCE_LEN,
    PASSIVE_INSTANCE_PTR, STATUS_INVALID_TABLE_ACCESS, TABLE_INSTANCE_REFERENCES,
    TABLE_INSTANCE_REFERENCES_LEN, V128LoadKind,
};

use crate::codegen::CodeGen;
use crate::masm::{
    AluOp, BitCountOp, DivRem, Extend, FloatAluOp, FloatUnOp, LoadKind, MacroAssembler,
    OperandSize, ShiftKind, SlotType, StoreKind,
};
use crate::reg::RegClass;
use crate::stack::Location;

impl<'a, M: MacroAssembler> CodeGen<'a, M> {
    pub(crate) fn require_memory(&self) -> Result<()> {
        if !self.ir.uses.memory || self.env.memory.is_none() {
            bail!("memory access in a function not flagged as using memory");
        }
        Ok(())
    }

    pub(crate) fn require_tables(&self) -> Result<()> {
        if !self.ir.uses.tables {
            bail!("table access in a function not flagged as using tables");
        }
        Ok(())
    }

    fn slot_of(ty: IntTy) -> SlotType {
        match ty {
            IntTy::I32 => SlotType::I32,
            IntTy::I64 => SlotType::I64,
        }
    }

    fn float_slot(ty: FloatTy) -> SlotType {
        match ty {
            FloatTy::F32 => SlotType::F32,
            FloatTy::F64 => SlotType::F64,
        }
    }

    // ---- Constants ----------------------------------------------------

    pub(crate) fn emit_const_int(&mut self, value: u64, ty: SlotType) -> Result<()> {
        let size = if ty == SlotType::I32 {
            OperandSize::S32
        } else {
            OperandSize::S64
        };
        let reg = self.alloc_reg(RegClass::Int)?;
        self.masm.mov_imm(reg, value, size);
        self.stack.push_on_register(ty, reg);
        Ok(())
    }

    pub(crate) fn emit_const_float(&mut self, bits: u64, ty: SlotType) -> Result<()> {
        let size = if ty == SlotType::F32 {
            OperandSize::S32
        } else {
            OperandSize::S64
        };
        let reg = self.alloc_reg(RegClass::Float)?;
        self.masm.mov_float_imm(reg, bits, size);
        self.stack.push_on_register(ty, reg);
        Ok(())
    }

    pub(crate) fn emit_const_v128(&mut self, lo: u64, hi: u64) -> Result<()> {
        let reg = self.alloc_reg(RegClass::Float)?;
        self.masm.v128_const(reg, lo, hi);
        self.stack.push_vector_on_register(reg);
        Ok(())
    }

    // ---- Integer arithmetic ------------------------------------------

    pub(crate) fn emit_int_alu(&mut self, ty: IntTy, op: AluOp) -> Result<()> {
        let (src, _) = self.pop_to_reg()?;
        let (dst, _) = self.pop_to_reg()?;
        self.masm.alu_rr(op, src, dst, ty.into());
        self.free_reg(src);
        self.stack.push_on_register(Self::slot_of(ty), dst);
        Ok(())
    }

    pub(crate) fn emit_div_rem(&mut self, ty: IntTy, sign: Sign, rem: bool) -> Result<()> {
        let op = DivRem { sign, rem };
        match self.masm.fixed_div_regs() {
            Some((lo, hi)) => {
                self.claim_fixed(hi);
                self.claim_fixed(lo);
                let (divisor, _) = self.pop_to_reg()?;
                let (dividend, _) = self.pop_to_reg()?;
                self.masm.mov_rr(dividend, lo, OperandSize::S64);
                self.free_reg(dividend);
                let sp_rel = self.sp_rel();
                self.masm.div_rem(op, divisor, (lo, hi), ty.into(), sp_rel);
                self.free_reg(divisor);
                self.free_reg(hi);
                self.stack.push_on_register(Self::slot_of(ty), lo);
            }
            None => {
                let (divisor, _) = self.pop_to_reg()?;
                let (dividend, _) = self.pop_to_reg()?;
                let tmp = self.alloc_reg(RegClass::Int)?;
                let sp_rel = self.sp_rel();
                self.masm
                    .div_rem(op, divisor, (dividend, tmp), ty.into(), sp_rel);
                self.free_reg(divisor);
                self.free_reg(tmp);
                self.stack.push_on_register(Self::slot_of(ty), dividend);
            }
        }
        Ok(())
    }

    pub(crate) fn emit_shift(&mut self, ty: IntTy, kind: ShiftKind) -> Result<()> {
        match self.masm.fixed_shift_amount_reg() {
            Some(fixed) => {
                self.claim_fixed(fixed);
                let (amount, _) = self.pop_to_reg()?;
                self.masm.mov_rr(amount, fixed, OperandSize::S64);
                self.free_reg(amount);
                let (dst, _) = self.pop_to_reg()?;
                self.masm.shift_rr(kind, fixed, dst, ty.into());
                self.free_reg(fixed);
                self.stack.push_on_register(Self::slot_of(ty), dst);
            }
            None => {
                let (amount, _) = self.pop_to_reg()?;
                let (dst, _) = self.pop_to_reg()?;
                self.masm.shift_rr(kind, amount, dst, ty.into());
                self.free_reg(amount);
                self.stack.push_on_register(Self::slot_of(ty), dst);
            }
        }
        Ok(())
    }

    pub(crate) fn emit_bit_count(&mut self, ty: IntTy, op: BitCountOp) -> Result<()> {
        let (reg, _) = self.pop_to_reg()?;
        self.masm.bit_count(op, reg, reg, ty.into());
        self.stack.push_on_register(Self::slot_of(ty), reg);
        Ok(())
    }

    pub(crate) fn emit_eqz(&mut self, ty: IntTy) -> Result<()> {
        let (reg, _) = self.pop_to_reg()?;
        self.masm.cmp_imm(reg, 0, ty.into());
        self.free_reg(reg);
        self.stack.push_condition(CmpKind::Eq);
        Ok(())
    }

    pub(crate) fn emit_int_cmp(&mut self, ty: IntTy, kind: CmpKind) -> Result<()> {
        let (rhs, _) = self.pop_to_reg()?;
        let (lhs, _) = self.pop_to_reg()?;
        self.masm.cmp_rr(lhs, rhs, ty.into());
        self.free_reg(rhs);
        self.free_reg(lhs);
        self.stack.push_condition(kind);
        Ok(())
    }

    // ---- Float arithmetic --------------------------------------------

    pub(crate) fn emit_float_alu(&mut self, ty: FloatTy, op: FloatAluOp) -> Result<()> {
        let (src, _) = self.pop_to_reg()?;
        let (dst, _) = self.pop_to_reg()?;
        self.masm.float_alu(op, src, dst, ty.into());
        self.free_reg(src);
        self.stack.push_on_register(Self::float_slot(ty), dst);
        Ok(())
    }

    pub(crate) fn emit_float_min_max(&mut self, ty: FloatTy, is_max: bool) -> Result<()> {
        let (src, _) = self.pop_to_reg()?;
        let (dst, _) = self.pop_to_reg()?;
        let tmp = self.alloc_reg(RegClass::Float)?;
        self.masm.float_min_max(is_max, src, dst, ty.into(), tmp);
        self.free_reg(tmp);
        self.free_reg(src);
        self.stack.push_on_register(Self::float_slot(ty), dst);
        Ok(())
    }

    pub(crate) fn emit_float_copysign(&mut self, ty: FloatTy) -> Result<()> {
        let (src, _) = self.pop_to_reg()?;
        let (dst, _) = self.pop_to_reg()?;
        let tmp = self.alloc_reg(RegClass::Float)?;
        self.masm.float_copysign(src, dst, ty.into(), tmp);
        self.free_reg(tmp);
        self.free_reg(src);
        self.stack.push_on_register(Self::float_slot(ty), dst);
        Ok(())
    }

    pub(crate) fn emit_float_unop(&mut self, ty: FloatTy, op: FloatUnOp) -> Result<()> {
        let (reg, _) = self.pop_to_reg()?;
        self.masm.float_unop(op, reg, ty.into());
        self.stack.push_on_register(Self::float_slot(ty), reg);
        Ok(())
    }

    pub(crate) fn emit_float_cmp(&mut self, ty: FloatTy, kind: FloatCmpKind) -> Result<()> {
        let (rhs, _) = self.pop_to_reg()?;
        let (lhs, _) = self.pop_to_reg()?;
        let dst = self.alloc_reg(RegClass::Int)?;
        self.masm.float_cmp(kind, lhs, rhs, dst, ty.into());
        self.free_reg(rhs);
        self.free_reg(lhs);
        self.stack.push_on_register(SlotType::I32, dst);
        Ok(())
    }

    // ---- Conversions --------------------------------------------------

    pub(crate) fn emit_i32_wrap_i64(&mut self) -> Result<()> {
        let (reg, _) = self.pop_to_reg()?;
        // A 32-bit self-move zero-extends, truncating the value.
        self.masm.mov_rr(reg, reg, OperandSize::S32);
        self.stack.push_on_register(SlotType::I32, reg);
        Ok(())
    }

    pub(crate) fn emit_i64_extend_i32(&mut self, sign: Sign) -> Result<()> {
        let (reg, _) = self.pop_to_reg()?;
        self.masm.extend(
            reg,
            reg,
            Extend {
                from_bits: 32,
                to_bits: 64,
                signed: sign.is_signed(),
            },
        );
        self.stack.push_on_register(SlotType::I64, reg);
        Ok(())
    }

    pub(crate) fn emit_sign_extend(&mut self, ty: IntTy, from_bits: u8) -> Result<()> {
        let (reg, _) = self.pop_to_reg()?;
        self.masm.extend(
            reg,
            reg,
            Extend {
                from_bits,
                to_bits: ty.bits(),
                signed: true,
            },
        );
        self.stack.push_on_register(Self::slot_of(ty), reg);
        Ok(())
    }

    pub(crate) fn emit_trunc_float(
        &mut self,
        int: IntTy,
        float: FloatTy,
        sign: Sign,
        saturating: bool,
    ) -> Result<()> {
        let (src, _) = self.pop_to_reg()?;
        let dst = self.alloc_reg(RegClass::Int)?;
        let tmp_fp = self.alloc_reg(RegClass::Float)?;
        let sp_rel = self.sp_rel();
        self.masm
            .float_to_int(src, dst, float, int, sign, saturating, tmp_fp, sp_rel);
        self.free_reg(tmp_fp);
        self.free_reg(src);
        self.stack.push_on_register(Self::slot_of(int), dst);
        Ok(())
    }

    pub(crate) fn emit_convert_int(&mut self, float: FloatTy, int: IntTy, sign: Sign) -> Result<()> {
        let (src, _) = self.pop_to_reg()?;
        let dst = self.alloc_reg(RegClass::Float)?;
        let tmp_gp = self.alloc_reg(RegClass::Int)?;
        self.masm.int_to_float(src, dst, int, float, sign, tmp_gp);
        self.free_reg(tmp_gp);
        self.free_reg(src);
        self.stack.push_on_register(Self::float_slot(float), dst);
        Ok(())
    }

    pub(crate) fn emit_float_demote(&mut self) -> Result<()> {
        let (reg, _) = self.pop_to_reg()?;
        self.masm.float_demote(reg);
        self.stack.push_on_register(SlotType::F32, reg);
        Ok(())
    }

    pub(crate) fn emit_float_promote(&mut self) -> Result<()> {
        let (reg, _) = self.pop_to_reg()?;
        self.masm.float_promote(reg);
        self.stack.push_on_register(SlotType::F64, reg);
        Ok(())
    }

    pub(crate) fn emit_reinterpret_to_int(&mut self, size: OperandSize) -> Result<()> {
        let (src, _) = self.pop_to_reg()?;
        let dst = self.alloc_reg(RegClass::Int)?;
        self.masm.reinterpret_float_to_int(src, dst, size);
        self.free_reg(src);
        let ty = if size == OperandSize::S32 {
            SlotType::I32
        } else {
            SlotType::I64
        };
        self.stack.push_on_register(ty, dst);
        Ok(())
    }

    pub(crate) fn emit_reinterpret_to_float(&mut self, size: OperandSize) -> Result<()> {
        let (src, _) = self.pop_to_reg()?;
        let dst = self.alloc_reg(RegClass::Float)?;
        self.masm.reinterpret_int_to_float(src, dst, size);
        self.free_reg(src);
        let ty = if size == OperandSize::S32 {
            SlotType::F32
        } else {
            SlotType::F64
        };
        self.stack.push_on_register(ty, dst);
        Ok(())
    }

    // ---- Linear memory ------------------------------------------------

    pub(crate) fn emit_load(&mut self, ty: ValType, arg: MemArg) -> Result<()> {
        self.require_memory()?;
        let (base, _) = self.pop_to_reg()?;
        let sp_rel = self.sp_rel();
        match ty {
            ValType::I32 => {
                self.masm.memory_access(base, arg.offset, 4, false, sp_rel);
                self.masm.wasm_load(
                    base,
                    base,
                    LoadKind::Int {
                        ty: IntTy::I32,
                        width: 32,
                        sign: Sign::Unsigned,
                    },
                );
                self.stack.push_on_register(SlotType::I32, base);
            }
            ValType::I64 => {
                self.masm.memory_access(base, arg.offset, 8, false, sp_rel);
                self.masm.wasm_load(
                    base,
                    base,
                    LoadKind::Int {
                        ty: IntTy::I64,
                        width: 64,
                        sign: Sign::Unsigned,
                    },
                );
                self.stack.push_on_register(SlotType::I64, base);
            }
            ValType::F32 => {
                self.masm.memory_access(base, arg.offset, 4, false, sp_rel);
                let dst = self.alloc_reg(RegClass::Float)?;
                self.masm.wasm_load(dst, base, LoadKind::F32);
                self.free_reg(base);
                self.stack.push_on_register(SlotType::F32, dst);
            }
            ValType::F64 => {
                self.masm.memory_access(base, arg.offset, 8, false, sp_rel);
                let dst = self.alloc_reg(RegClass::Float)?;
                self.masm.wasm_load(dst, base, LoadKind::F64);
                self.free_reg(base);
                self.stack.push_on_register(SlotType::F64, dst);
            }
            other => bail!("scalar load cannot produce {other:?}"),
        }
        Ok(())
    }

    pub(crate) fn emit_load_narrow(
        &mut self,
        ty: IntTy,
        width: u8,
        sign: Sign,
        arg: MemArg,
    ) -> Result<()> {
        self.require_memory()?;
        let (base, _) = self.pop_to_reg()?;
        let sp_rel = self.sp_rel();
        self.masm
            .memory_access(base, arg.offset, width / 8, false, sp_rel);
        self.masm.wasm_load(base, base, LoadKind::Int { ty, width, sign });
        self.stack.push_on_register(Self::slot_of(ty), base);
        Ok(())
    }

    pub(crate) fn emit_store(&mut self, ty: ValType, arg: MemArg) -> Result<()> {
        self.require_memory()?;
        let (val, _) = self.pop_to_reg()?;
        let (base, _) = self.pop_to_reg()?;
        let sp_rel = self.sp_rel();
        let kind = match ty {
            ValType::I32 => StoreKind::Int { width: 32 },
            ValType::I64 => StoreKind::Int { width: 64 },
            ValType::F32 => StoreKind::F32,
            ValType::F64 => StoreKind::F64,
            other => bail!("scalar store cannot consume {other:?}"),
        };
        self.masm
            .memory_access(base, arg.offset, kind.width_bytes(), false, sp_rel);
        self.masm.wasm_store(val, base, kind);
        self.free_reg(val);
        self.free_reg(base);
        Ok(())
    }

    pub(crate) fn emit_store_narrow(&mut self, _ty: IntTy, width: u8, arg: MemArg) -> Result<()> {
        self.require_memory()?;
        let (val, _) = self.pop_to_reg()?;
        let (base, _) = self.pop_to_reg()?;
        let sp_rel = self.sp_rel();
        self.masm
            .memory_access(base, arg.offset, width / 8, false, sp_rel);
        self.masm.wasm_store(val, base, StoreKind::Int { width });
        self.free_reg(val);
        self.free_reg(base);
        Ok(())
    }

    pub(crate) fn emit_memory_size(&mut self) -> Result<()> {
        self.require_memory()?;
        let dst = self.alloc_reg(RegClass::Int)?;
        self.masm.load_engine(dst, ENGINE_MEMORY_LEN);
        self.masm
            .shift_imm(ShiftKind::ShrU, 16, dst, OperandSize::S64);
        self.stack.push_on_register(SlotType::I32, dst);
        Ok(())
    }

    pub(crate) fn emit_memory_copy(&mut self) -> Result<()> {
        self.require_memory()?;
        let (len, _) = self.pop_to_reg()?;
        let (src, _) = self.pop_to_reg()?;
        let (dst, _) = self.pop_to_reg()?;
        let sp_rel = self.sp_rel();
        self.masm.memory_copy_loop(dst, src, len, sp_rel);
        self.free_reg(len);
        self.free_reg(src);
        self.free_reg(dst);
        Ok(())
    }

    pub(crate) fn emit_memory_fill(&mut self) -> Result<()> {
        self.require_memory()?;
        let (len, _) = self.pop_to_reg()?;
        let (val, _) = self.pop_to_reg()?;
        let (dst, _) = self.pop_to_reg()?;
        let sp_rel = self.sp_rel();
        self.masm.memory_fill_loop(dst, val, len, sp_rel);
        self.free_reg(len);
        self.free_reg(val);
        self.free_reg(dst);
        Ok(())
    }

    pub(crate) fn emit_memory_init(&mut self, data_index: u32) -> Result<()> {
        self.require_memory()?;
        if data_index >= self.env.data_count {
            bail!("memory.init: data index {data_index} out of range");
        }
        if !self.ir.uses.data_instances {
            bail!("memory.init in a function not flagged as using data instances");
        }
        let (len, _) = self.pop_to_reg()?;
        let (src, _) = self.pop_to_reg()?;
        let (dst, _) = self.pop_to_reg()?;
        let tmp = self.alloc_reg(RegClass::Int)?;
        let sp_rel = self.sp_rel();
        self.masm.memory_init_loop(dst, src, len, tmp, data_index, sp_rel);
        self.free_reg(tmp);
        self.free_reg(len);
        self.free_reg(src);
        self.free_reg(dst);
        Ok(())
    }

    pub(crate) fn emit_data_drop(&mut self, data_index: u32) -> Result<()> {
        if data_index >= self.env.data_count {
            bail!("data.drop: data index {data_index} out of range");
        }
        if !self.ir.uses.data_instances {
            bail!("data.drop in a function not flagged as using data instances");
        }
        let zero = self.alloc_reg(RegClass::Int)?;
        let scratch = self.masm.scratch();
        self.masm.mov_imm(zero, 0, OperandSize::S64);
        self.masm.load_engine(scratch, ENGINE_DATA_INSTANCES_ELEMENT0);
        self.masm
            .store_mem64(zero, scratch, data_index * 16 + PASSIVE_INSTANCE_PTR);
        self.masm
            .store_mem64(zero, scratch, data_index * 16 + PASSIVE_INSTANCE_LEN);
        self.free_reg(zero);
        Ok(())
    }

    pub(crate) fn emit_elem_drop(&mut self, elem_index: u32) -> Result<()> {
        if elem_index >= self.env.element_count {
            bail!("elem.drop: element index {elem_index} out of range");
        }
        if !self.ir.uses.element_instances {
            bail!("elem.drop in a function not flagged as using element instances");
        }
        let zero = self.alloc_reg(RegClass::Int)?;
        let scratch = self.masm.scratch();
        self.masm.mov_imm(zero, 0, OperandSize::S64);
        self.masm
            .load_engine(scratch, ENGINE_ELEMENT_INSTANCES_ELEMENT0);
        self.masm
            .store_mem64(zero, scratch, elem_index * 16 + PASSIVE_INSTANCE_PTR);
        self.masm
            .store_mem64(zero, scratch, elem_index * 16 + PASSIVE_INSTANCE_LEN);
        self.free_reg(zero);
        Ok(())
    }

    // ---- Tables -------------------------------------------------------

    pub(crate) fn emit_table_init(&mut self, elem_index: u32, table_index: u32) -> Result<()> {
        self.require_tables()?;
        self.check_table_index(table_index)?;
        if elem_index >= self.env.element_count {
            bail!("table.init: element index {elem_index} out of range");
        }
        if !self.ir.uses.element_instances {
            bail!("table.init in a function not flagged as using element instances");
        }
        let (len, _) = self.pop_to_reg()?;
        let (src, _) = self.pop_to_reg()?;
        let (dst, _) = self.pop_to_reg()?;
        let tmp = self.alloc_reg(RegClass::Int)?;
        let sp_rel = self.sp_rel();
        self.masm
            .table_init_loop(table_index, elem_index, dst, src, len, tmp, sp_rel);
        self.free_reg(tmp);
        self.free_reg(len);
        self.free_reg(src);
        self.free_reg(dst);
        Ok(())
    }

    pub(crate) fn emit_table_copy(&mut self, dst_table: u32, src_table: u32) -> Result<()> {
        self.require_tables()?;
        self.check_table_index(dst_table)?;
        self.check_table_index(src_table)?;
        let (len, _) = self.pop_to_reg()?;
        let (src, _) = self.pop_to_reg()?;
        let (dst, _) = self.pop_to_reg()?;
        let tmp = self.alloc_reg(RegClass::Int)?;
        let sp_rel = self.sp_rel();
        self.masm
            .table_copy_loop(dst_table, src_table, dst, src, len, tmp, sp_rel);
        self.free_reg(tmp);
        self.free_reg(len);
        self.free_reg(src);
        self.free_reg(dst);
        Ok(())
    }

    pub(crate) fn emit_table_get(&mut self, table_index: u32) -> Result<()> {
        self.require_tables()?;
        self.check_table_index(table_index)?;
        let (index, _) = self.pop_to_reg()?;
        let dst = self.alloc_reg(RegClass::Int)?;
        let scratch = self.masm.scratch();
        let sp_rel = self.sp_rel();
        self.masm.load_engine(scratch, ENGINE_TABLES_ELEMENT0);
        self.masm.load_mem64(scratch, scratch, table_index * 8);
        self.masm
            .load_mem64(dst, scratch, TABLE_INSTANCE_REFERENCES_LEN);
        self.masm.cmp_rr(index, dst, OperandSize::S64);
        self.masm
            .trap_if(CmpKind::GeU, STATUS_INVALID_TABLE_ACCESS, sp_rel);
        self.masm.load_mem64(dst, scratch, TABLE_INSTANCE_REFERENCES);
        self.masm.load_indexed64(dst, dst, index, 3);
        self.free_reg(index);
        self.stack.push_on_register(SlotType::I64, dst);
        Ok(())
    }

    pub(crate) fn emit_table_set(&mut self, table_index: u32) -> Result<()> {
        self.require_tables()?;
        self.check_table_index(table_index)?;
        let (val, _) = self.pop_to_reg()?;
        let (index, _) = self.pop_to_reg()?;
        let tmp = self.alloc_reg(RegClass::Int)?;
        let scratch = self.masm.scratch();
        let sp_rel = self.sp_rel();
        self.masm.load_engine(scratch, ENGINE_TABLES_ELEMENT0);
        self.masm.load_mem64(scratch, scratch, table_index * 8);
        self.masm
            .load_mem64(tmp, scratch, TABLE_INSTANCE_REFERENCES_LEN);
        self.masm.cmp_rr(index, tmp, OperandSize::S64);
        self.masm
            .trap_if(CmpKind::GeU, STATUS_INVALID_TABLE_ACCESS, sp_rel);
        self.masm.load_mem64(tmp, scratch, TABLE_INSTANCE_REFERENCES);
        self.masm.store_indexed64(val, tmp, index, 3);
        self.free_reg(tmp);
        self.free_reg(index);
        self.free_reg(val);
        Ok(())
    }

    pub(crate) fn emit_table_size(&mut self, table_index: u32) -> Result<()> {
        self.require_tables()?;
        self.check_table_index(table_index)?;
        let dst = self.alloc_reg(RegClass::Int)?;
        let scratch = self.masm.scratch();
        self.masm.load_engine(scratch, ENGINE_TABLES_ELEMENT0);
        self.masm.load_mem64(scratch, scratch, table_index * 8);
        self.masm
            .load_mem64(dst, scratch, TABLE_INSTANCE_REFERENCES_LEN);
        self.stack.push_on_register(SlotType::I32, dst);
        Ok(())
    }

    // ---- Globals ------------------------------------------------------

    pub(crate) fn emit_global_get(&mut self, index: u32) -> Result<()> {
        let ty = match self.env.globals.get(index as usize) {
            Some(ty) => *ty,
            None => bail!("global.get: index {index} out of range"),
        };
        if !self.ir.uses.globals {
            bail!("global access in a function not flagged as using globals");
        }
        let scratch = self.masm.scratch();
        self.masm.load_engine(scratch, ENGINE_GLOBALS_ELEMENT0);
        self.masm.load_mem64(scratch, scratch, index * 8);
        match ty {
            ValType::I32 => {
                let dst = self.alloc_reg(RegClass::Int)?;
                self.masm.wasm_load(
                    dst,
                    scratch,
                    LoadKind::Int {
                        ty: IntTy::I32,
                        width: 32,
                        sign: Sign::Unsigned,
                    },
                );
                self.stack.push_on_register(SlotType::I32, dst);
            }
            ValType::I64 | ValType::FuncRef | ValType::ExternRef => {
                let dst = self.alloc_reg(RegClass::Int)?;
                self.masm.load_mem64(dst, scratch, GLOBAL_INSTANCE_VAL);
                self.stack.push_on_register(SlotType::I64, dst);
            }
            ValType::F32 => {
                let dst = self.alloc_reg(RegClass::Float)?;
                self.masm.wasm_load(dst, scratch, LoadKind::F32);
                self.stack.push_on_register(SlotType::F32, dst);
            }
            ValType::F64 => {
                let dst = self.alloc_reg(RegClass::Float)?;
                self.masm.wasm_load(dst, scratch, LoadKind::F64);
                self.stack.push_on_register(SlotType::F64, dst);
            }
            ValType::V128 => {
                let dst = self.alloc_reg(RegClass::Float)?;
                self.masm.v128_load(V128LoadKind::V128, dst, scratch);
                self.stack.push_vector_on_register(dst);
            }
        }
        Ok(())
    }

    pub(crate) fn emit_global_set(&mut self, index: u32) -> Result<()> {
        let ty = match self.env.globals.get(index as usize) {
            Some(ty) => *ty,
            None => bail!("global.set: index {index} out of range"),
        };
        if !self.ir.uses.globals {
            bail!("global access in a function not flagged as using globals");
        }
        let scratch = self.masm.scratch();
        match ty {
            ValType::V128 => {
                let val = self.pop_vector_to_reg()?;
                self.masm.load_engine(scratch, ENGINE_GLOBALS_ELEMENT0);
                self.masm.load_mem64(scratch, scratch, index * 8);
                self.masm.v128_store(val, scratch);
                self.free_reg(val);
            }
            ValType::F32 | ValType::F64 => {
                let (val, _) = self.pop_to_reg()?;
                self.masm.load_engine(scratch, ENGINE_GLOBALS_ELEMENT0);
                self.masm.load_mem64(scratch, scratch, index * 8);
                let kind = if ty == ValType::F32 {
                    StoreKind::F32
                } else {
                    StoreKind::F64
                };
                self.masm.wasm_store(val, scratch, kind);
                self.free_reg(val);
            }
            _ => {
                let (val, _) = self.pop_to_reg()?;
                self.masm.load_engine(scratch, ENGINE_GLOBALS_ELEMENT0);
                self.masm.load_mem64(scratch, scratch, index * 8);
                self.masm.store_mem64(val, scratch, GLOBAL_INSTANCE_VAL);
                self.free_reg(val);
            }
        }
        Ok(())
    }

    // ---- Atomics ------------------------------------------------------

    pub(crate) fn emit_atomic_load(&mut self, ty: IntTy, width: u8, arg: MemArg) -> Result<()> {
        self.require_memory()?;
        let (base, _) = self.pop_to_reg()?;
        let sp_rel = self.sp_rel();
        self.masm
            .memory_access(base, arg.offset, width / 8, true, sp_rel);
        self.masm.atomic_load(base, base, ty, width);
        self.stack.push_on_register(Self::slot_of(ty), base);
        Ok(())
    }

    pub(crate) fn emit_atomic_store(&mut self, _ty: IntTy, width: u8, arg: MemArg) -> Result<()> {
        self.require_memory()?;
        let (val, _) = self.pop_to_reg()?;
        let (base, _) = self.pop_to_reg()?;
        let sp_rel = self.sp_rel();
        self.masm
            .memory_access(base, arg.offset, width / 8, true, sp_rel);
        self.masm.atomic_store(val, base, width);
        self.free_reg(val);
        self.free_reg(base);
        Ok(())
    }

    pub(crate) fn emit_atomic_rmw(
        &mut self,
        ty: IntTy,
        width: u8,
        op: AtomicRmwOp,
        arg: MemArg,
    ) -> Result<()> {
        self.require_memory()?;
        let fixed = self.masm.fixed_atomic_result_reg(Some(op));
        if let Some(f) = fixed {
            self.claim_fixed(f);
        }
        let (operand, _) = self.pop_to_reg()?;
        let (base, _) = self.pop_to_reg()?;
        let sp_rel = self.sp_rel();
        self.masm
            .memory_access(base, arg.offset, width / 8, true, sp_rel);
        let tmp = self.alloc_reg(RegClass::Int)?;
        let dst = match fixed {
            Some(f) => f,
            None => self.alloc_reg(RegClass::Int)?,
        };
        self.masm.atomic_rmw(op, operand, dst, base, ty, width, tmp);
        self.free_reg(tmp);
        self.free_reg(base);
        self.free_reg(operand);
        self.stack.push_on_register(Self::slot_of(ty), dst);
        Ok(())
    }

    pub(crate) fn emit_atomic_cmpxchg(&mut self, ty: IntTy, width: u8, arg: MemArg) -> Result<()> {
        self.require_memory()?;
        let fixed = self.masm.fixed_atomic_result_reg(None);
        if let Some(f) = fixed {
            self.claim_fixed(f);
        }
        let (replacement, _) = self.pop_to_reg()?;
        let (expected_in, _) = self.pop_to_reg()?;
        let expected = match fixed {
            Some(f) => {
                self.masm.mov_rr(expected_in, f, OperandSize::S64);
                self.free_reg(expected_in);
                f
            }
            None => expected_in,
        };
        let (base, _) = self.pop_to_reg()?;
        let sp_rel = self.sp_rel();
        self.masm
            .memory_access(base, arg.offset, width / 8, true, sp_rel);
        let tmp = self.alloc_reg(RegClass::Int)?;
        self.masm
            .atomic_cmpxchg(expected, replacement, base, ty, width, tmp);
        self.free_reg(tmp);
        self.free_reg(base);
        self.free_reg(replacement);
        self.stack.push_on_register(Self::slot_of(ty), expected);
        Ok(())
    }

    // ---- Stack-shape operations --------------------------------------

    pub(crate) fn emit_drop(&mut self, range: Option<InclusiveRange>) -> Result<()> {
        match range {
            None => Ok(()),
            Some(range) => self.apply_drop_range(range),
        }
    }

    pub(crate) fn emit_select(&mut self, is_target_vector: bool) -> Result<()> {
        let top_loc = self.stack.peek_at(0).loc;
        let cond = match top_loc {
            Location::Condition(kind) => {
                self.stack.pop();
                kind
            }
            _ => {
                let (reg, _) = self.pop_to_reg()?;
                self.masm.cmp_imm(reg, 0, OperandSize::S32);
                self.free_reg(reg);
                CmpKind::Ne
            }
        };
        if is_target_vector {
            let v2 = self.pop_vector_to_reg()?;
            let v1 = self.pop_vector_to_reg()?;
            self.masm.select_rr(cond, v2, v1, SlotType::V128Lo);
            self.free_reg(v2);
            self.stack.push_vector_on_register(v1);
        } else {
            let (v2, _) = self.pop_to_reg()?;
            let (v1, ty) = self.pop_to_reg()?;
            self.masm.select_rr(cond, v2, v1, ty);
            self.free_reg(v2);
            self.stack.push_on_register(ty, v1);
        }
        Ok(())
    }

    pub(crate) fn emit_pick(&mut self, depth: u32, is_target_vector: bool) -> Result<()> {
        let idx = self.stack.sp() - 1 - depth as usize;
        let target = *self.stack.value(idx);
        if is_target_vector {
            if target.ty != SlotType::V128Lo {
                bail!("pick: depth {depth} does not name a v128 pair");
            }
            let dst = self.alloc_reg_excluding(RegClass::Float, &[idx])?;
            match target.loc {
                Location::Register(src) => self.masm.v128_mov(src, dst),
                Location::Stack => self
                    .masm
                    .load_slot_v128(dst, target.stack_pointer as u32),
                Location::Condition(_) => unreachable!(),
            }
            self.stack.push_vector_on_register(dst);
        } else {
            let dst = self.alloc_reg_excluding(target.ty.reg_class(), &[idx])?;
            match target.loc {
                Location::Register(src) => {
                    self.masm.mov_rr(src, dst, OperandSize::S64);
                }
                Location::Stack => {
                    self.masm
                        .load_slot(dst, target.stack_pointer as u32, target.ty);
                }
                Location::Condition(_) => unreachable!("condition was materialised"),
            }
            self.stack.push_on_register(target.ty, dst);
        }
        Ok(())
    }

    pub(crate) fn emit_swap(&mut self, depth: u32, is_target_vector: bool) -> Result<()> {
        let deep = self.stack.sp() - 1 - depth as usize;
        if is_target_vector {
            let top = self.stack.sp() - 2;
            let a = self.ensure_on_register_excluding(deep, &[top])?;
            let b = self.ensure_on_register_excluding(top, &[deep])?;
            self.stack.value_mut(deep).loc = Location::Register(b);
            self.stack.value_mut(deep + 1).loc = Location::Register(b);
            self.stack.value_mut(top).loc = Location::Register(a);
            self.stack.value_mut(top + 1).loc = Location::Register(a);
        } else {
            let top = self.stack.sp() - 1;
            let a = self.ensure_on_register_excluding(deep, &[top])?;
            let b = self.ensure_on_register_excluding(top, &[deep])?;
            self.stack.value_mut(deep).loc = Location::Register(b);
            self.stack.value_mut(top).loc = Location::Register(a);
        }
        Ok(())
    }
}
