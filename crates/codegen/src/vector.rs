//! 128-bit vector lowering. A v128 occupies two location-stack slots and a
//! single vector register; the pair is popped and pushed as one value.

use anyhow::{bail, Result};
use capstan_environ::{Operation, V128LoadKind, VecShape};

use crate::codegen::CodeGen;
use crate::masm::{MacroAssembler, SlotType};
use crate::reg::RegClass;

impl<'a, M: MacroAssembler> CodeGen<'a, M> {
    pub(crate) fn emit_vector_op(&mut self, op: &Operation) -> Result<()> {
        use Operation::*;
        match op {
            V128Load { kind, arg } => {
                self.require_memory()?;
                self.emit_v128_load(*kind, *arg)?;
            }
            V128LoadLane { lane_bits, lane, arg } => {
                self.require_memory()?;
                let v = self.pop_vector_to_reg()?;
                let (base, _) = self.pop_to_reg()?;
                let sp_rel = self.sp_rel();
                self.masm
                    .memory_access(base, arg.offset, lane_bits / 8, false, sp_rel);
                self.masm.v128_load_lane(*lane_bits, *lane, v, base);
                self.free_reg(base);
                self.stack.push_vector_on_register(v);
            }
            V128Store { arg } => {
                self.require_memory()?;
                let v = self.pop_vector_to_reg()?;
                let (base, _) = self.pop_to_reg()?;
                let sp_rel = self.sp_rel();
                self.masm.memory_access(base, arg.offset, 16, false, sp_rel);
                self.masm.v128_store(v, base);
                self.free_reg(base);
                self.free_reg(v);
            }
            V128StoreLane { lane_bits, lane, arg } => {
                self.require_memory()?;
                let v = self.pop_vector_to_reg()?;
                let (base, _) = self.pop_to_reg()?;
                let sp_rel = self.sp_rel();
                self.masm
                    .memory_access(base, arg.offset, lane_bits / 8, false, sp_rel);
                self.masm.v128_store_lane(*lane_bits, *lane, v, base);
                self.free_reg(base);
                self.free_reg(v);
            }

            V128Add { shape } => self.v128_binary(|m, s, d| m.v128_add(*shape, s, d))?,
            V128Sub { shape } => self.v128_binary(|m, s, d| m.v128_sub(*shape, s, d))?,
            V128Mul { shape } => {
                self.v128_binary_tmp(|m, s, d, t| m.v128_mul(*shape, s, d, t))?
            }
            V128Neg { shape } => self.v128_unary(|m, d| m.v128_neg(*shape, d))?,
            V128Abs { shape } => self.v128_unary(|m, d| m.v128_abs(*shape, d))?,
            V128Min { shape, sign } => {
                self.v128_binary_tmp(|m, s, d, t| m.v128_min(*shape, *sign, s, d, t))?
            }
            V128Max { shape, sign } => {
                self.v128_binary_tmp(|m, s, d, t| m.v128_max(*shape, *sign, s, d, t))?
            }
            V128AvgrU { shape } => self.v128_binary(|m, s, d| m.v128_avgr(*shape, s, d))?,
            V128AddSat { shape, sign } => {
                self.v128_binary(|m, s, d| m.v128_add_sat(*shape, *sign, s, d))?
            }
            V128SubSat { shape, sign } => {
                self.v128_binary(|m, s, d| m.v128_sub_sat(*shape, *sign, s, d))?
            }
            V128Shl { shape } => {
                let (amount, _) = self.pop_to_reg()?;
                let v = self.pop_vector_to_reg()?;
                let tmp = self.alloc_reg(RegClass::Float)?;
                self.masm.v128_shl(*shape, amount, v, tmp);
                self.free_reg(tmp);
                self.free_reg(amount);
                self.stack.push_vector_on_register(v);
            }
            V128Shr { shape, sign } => {
                let (amount, _) = self.pop_to_reg()?;
                let v = self.pop_vector_to_reg()?;
                let tmp = self.alloc_reg(RegClass::Float)?;
                self.masm.v128_shr(*shape, *sign, amount, v, tmp);
                self.free_reg(tmp);
                self.free_reg(amount);
                self.stack.push_vector_on_register(v);
            }
            V128Cmp { shape, kind } => {
                self.v128_binary_tmp(|m, s, d, t| m.v128_cmp(*shape, *kind, s, d, t))?
            }
            V128And => self.v128_binary(|m, s, d| m.v128_and(s, d))?,
            V128Or => self.v128_binary(|m, s, d| m.v128_or(s, d))?,
            V128Xor => self.v128_binary(|m, s, d| m.v128_xor(s, d))?,
            V128Not => self.v128_unary(|m, d| m.v128_not(d))?,
            V128AndNot => self.v128_binary(|m, s, d| m.v128_andnot(s, d))?,
            V128Bitselect => {
                let mask = self.pop_vector_to_reg()?;
                let v2 = self.pop_vector_to_reg()?;
                let v1 = self.pop_vector_to_reg()?;
                self.masm.v128_bitselect(v1, v2, mask);
                self.free_reg(v1);
                self.free_reg(v2);
                self.stack.push_vector_on_register(mask);
            }
            V128Splat { shape } => {
                let (src, _) = self.pop_to_reg()?;
                let dst = self.alloc_reg(RegClass::Float)?;
                self.masm.v128_splat(*shape, src, dst);
                self.free_reg(src);
                self.stack.push_vector_on_register(dst);
            }
            V128ExtractLane { shape, lane, sign } => {
                let v = self.pop_vector_to_reg()?;
                let (class, slot) = match shape {
                    VecShape::I8x16 | VecShape::I16x8 | VecShape::I32x4 => {
                        (RegClass::Int, SlotType::I32)
                    }
                    VecShape::I64x2 => (RegClass::Int, SlotType::I64),
                    VecShape::F32x4 => (RegClass::Float, SlotType::F32),
                    VecShape::F64x2 => (RegClass::Float, SlotType::F64),
                };
                let dst = self.alloc_reg(class)?;
                self.masm.v128_extract_lane(*shape, *lane, *sign, v, dst);
                self.free_reg(v);
                self.stack.push_on_register(slot, dst);
            }
            V128ReplaceLane { shape, lane } => {
                let (src, _) = self.pop_to_reg()?;
                let v = self.pop_vector_to_reg()?;
                self.masm.v128_replace_lane(*shape, *lane, src, v);
                self.free_reg(src);
                self.stack.push_vector_on_register(v);
            }
            V128Shuffle { lanes } => {
                let v2 = self.pop_vector_to_reg()?;
                let v1 = self.pop_vector_to_reg()?;
                let tmp = self.alloc_reg(RegClass::Float)?;
                self.masm.v128_shuffle(lanes, v2, v1, tmp);
                self.free_reg(tmp);
                self.free_reg(v2);
                self.stack.push_vector_on_register(v1);
            }
            V128Swizzle => {
                let indices = self.pop_vector_to_reg()?;
                let data = self.pop_vector_to_reg()?;
                let tmp = self.alloc_reg(RegClass::Float)?;
                self.masm.v128_swizzle(indices, data, tmp);
                self.free_reg(tmp);
                self.free_reg(indices);
                self.stack.push_vector_on_register(data);
            }
            V128AnyTrue => {
                let v = self.pop_vector_to_reg()?;
                let dst = self.alloc_reg(RegClass::Int)?;
                self.masm.v128_any_true(v, dst);
                self.free_reg(v);
                self.stack.push_on_register(SlotType::I32, dst);
            }
            V128AllTrue { shape } => {
                let v = self.pop_vector_to_reg()?;
                let dst = self.alloc_reg(RegClass::Int)?;
                let tmp = self.alloc_reg(RegClass::Float)?;
                self.masm.v128_all_true(*shape, v, dst, tmp);
                self.free_reg(tmp);
                self.free_reg(v);
                self.stack.push_on_register(SlotType::I32, dst);
            }
            V128Bitmask { shape } => {
                let v = self.pop_vector_to_reg()?;
                let dst = self.alloc_reg(RegClass::Int)?;
                let tmp = self.alloc_reg(RegClass::Float)?;
                self.masm.v128_bitmask(*shape, v, dst, tmp);
                self.free_reg(tmp);
                self.free_reg(v);
                self.stack.push_on_register(SlotType::I32, dst);
            }
            V128Narrow { shape, sign } => {
                self.v128_binary(|m, s, d| m.v128_narrow(*shape, *sign, s, d))?
            }
            V128Extend { shape, sign, low } => {
                self.v128_unary(|m, d| m.v128_extend(*shape, *sign, *low, d))?
            }
            V128ExtAddPairwise { shape, sign } => {
                let v = self.pop_vector_to_reg()?;
                let tmp = self.alloc_reg(RegClass::Float)?;
                self.masm.v128_ext_add_pairwise(*shape, *sign, v, tmp);
                self.free_reg(tmp);
                self.stack.push_vector_on_register(v);
            }
            V128ExtMul { shape, sign, low } => {
                self.v128_binary_tmp(|m, s, d, t| m.v128_ext_mul(*shape, *sign, *low, s, d, t))?
            }
            V128Q15MulrSatS => self.v128_binary(|m, s, d| m.v128_q15mulr_sat(s, d))?,
            V128Dot => self.v128_binary(|m, s, d| m.v128_dot(s, d))?,
            V128Popcnt => {
                let v = self.pop_vector_to_reg()?;
                let tmp = self.alloc_reg(RegClass::Float)?;
                self.masm.v128_popcnt(v, tmp);
                self.free_reg(tmp);
                self.stack.push_vector_on_register(v);
            }
            V128TruncSat { shape, sign } => {
                let v = self.pop_vector_to_reg()?;
                let tmp = self.alloc_reg(RegClass::Float)?;
                self.masm.v128_trunc_sat(*shape, *sign, v, tmp);
                self.free_reg(tmp);
                self.stack.push_vector_on_register(v);
            }
            V128FConvertI { float, sign } => {
                let v = self.pop_vector_to_reg()?;
                let tmp = self.alloc_reg(RegClass::Float)?;
                self.masm.v128_convert_i(*float, *sign, v, tmp);
                self.free_reg(tmp);
                self.stack.push_vector_on_register(v);
            }
            V128Demote => self.v128_unary(|m, d| m.v128_demote(d))?,
            V128Promote => self.v128_unary(|m, d| m.v128_promote(d))?,

            other => bail!("operation {other:?} is not a vector operation"),
        }
        Ok(())
    }

    fn emit_v128_load(&mut self, kind: V128LoadKind, arg: capstan_environ::MemArg) -> Result<()> {
        let width = match kind {
            V128LoadKind::V128 => 16,
            V128LoadKind::S8x8 { .. } | V128LoadKind::S16x4 { .. } | V128LoadKind::S32x2 { .. } => {
                8
            }
            V128LoadKind::Splat { lane_bits } => lane_bits / 8,
            V128LoadKind::Zero32 => 4,
            V128LoadKind::Zero64 => 8,
        };
        let (base, _) = self.pop_to_reg()?;
        let sp_rel = self.sp_rel();
        self.masm.memory_access(base, arg.offset, width, false, sp_rel);
        let dst = self.alloc_reg(RegClass::Float)?;
        self.masm.v128_load(kind, dst, base);
        self.free_reg(base);
        self.stack.push_vector_on_register(dst);
        Ok(())
    }

    /// rhs = top, lhs = result.
    fn v128_binary(
        &mut self,
        emit: impl FnOnce(&mut M, crate::reg::Reg, crate::reg::Reg),
    ) -> Result<()> {
        let rhs = self.pop_vector_to_reg()?;
        let lhs = self.pop_vector_to_reg()?;
        emit(&mut self.masm, rhs, lhs);
        self.free_reg(rhs);
        self.stack.push_vector_on_register(lhs);
        Ok(())
    }

    fn v128_binary_tmp(
        &mut self,
        emit: impl FnOnce(&mut M, crate::reg::Reg, crate::reg::Reg, crate::reg::Reg),
    ) -> Result<()> {
        let rhs = self.pop_vector_to_reg()?;
        let lhs = self.pop_vector_to_reg()?;
        let tmp = self.alloc_reg(RegClass::Float)?;
        emit(&mut self.masm, rhs, lhs, tmp);
        self.free_reg(tmp);
        self.free_reg(rhs);
        self.stack.push_vector_on_register(lhs);
        Ok(())
    }

    fn v128_unary(&mut self, emit: impl FnOnce(&mut M, crate::reg::Reg)) -> Result<()> {
        let v = self.pop_vector_to_reg()?;
        emit(&mut self.masm, v);
        self.stack.push_vector_on_register(v);
        Ok(())
    }
}
