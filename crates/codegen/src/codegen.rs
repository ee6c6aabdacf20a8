//! The code-generation driver.
//!
//! Walks the IR operation sequence once, keeps the value-location stack in
//! sync with every emitted instruction, and delegates instruction selection
//! to the target's `MacroAssembler`. Control flow, calls and the
//! preamble/epilogue live here; scalar and vector lowering are in their own
//! modules.

use std::collections::HashMap;

use anyhow::{bail, Result};
use capstan_environ::{
    Label as IrLabel, ModuleEnv, Operation, BUILTIN_GROW_VALUE_STACK,
    BUILTIN_MEMORY_GROW, BUILTIN_MEMORY_NOTIFY, BUILTIN_MEMORY_WAIT32, BUILTIN_MEMORY_WAIT64,
    BUILTIN_REF_FUNC, BUILTIN_TABLE_FILL, BUILTIN_TABLE_GROW, CmpKind, FunctionIr,
    STATUS_CALL_BUILTIN_FUNCTION, STATUS_UNREACHABLE,
};
use log::{debug, trace};

use crate::buffer::Reloc;
use crate::control::LabelEntry;
use crate::masm::{MacroAssembler, OperandSize, ShiftKind, SlotType};
use crate::stack::LocationStack;

/// The finished output of one function compilation.
#[derive(Debug, Clone)]
pub struct CompiledFunction {
    /// Native code; the entry point is byte 0.
    pub code: Vec<u8>,
    /// Absolute-address patch sites the runtime fills at link time.
    pub relocs: Vec<Reloc>,
    /// Maximum value-stack depth the body can reach, in slots.
    pub stack_pointer_ceil: u32,
}

pub(crate) struct CodeGen<'a, M: MacroAssembler> {
    pub masm: M,
    pub stack: LocationStack,
    pub env: &'a ModuleEnv,
    pub ir: &'a FunctionIr,
    pub labels: HashMap<IrLabel, LabelEntry>,
    /// Cleared after an unconditional transfer; restored at the next label
    /// that has a recorded arrival.
    pub reachable: bool,
}

impl<'a, M: MacroAssembler> CodeGen<'a, M> {
    pub fn new(masm: M, env: &'a ModuleEnv, ir: &'a FunctionIr) -> Self {
        Self {
            masm,
            stack: LocationStack::new(),
            env,
            ir,
            labels: HashMap::new(),
            reachable: true,
        }
    }

    pub fn compile(mut self) -> Result<CompiledFunction> {
        self.stack.init(&self.ir.ty);
        self.emit_preamble();

        for (i, op) in self.ir.ops.iter().enumerate() {
            trace!("lowering op {i}: {op:?}");
            self.emit_op(op)?;
        }
        if self.reachable {
            self.emit_function_return()?;
        }

        let ceil = self.stack.stack_pointer_ceil() as u32;
        debug!(
            "function body lowered; sp ceiling = {ceil} slots, {} labels",
            self.labels.len()
        );
        let (code, relocs) = self.masm.finalize(ceil)?;
        Ok(CompiledFunction {
            code,
            relocs,
            stack_pointer_ceil: ceil,
        })
    }

    /// Value-stack headroom check against the (deferred) ceiling, then the
    /// module-context cache initialisation. A failed check leaves to the
    /// host to grow the stack; re-entry lands on the context init, which
    /// re-derives every cached register from the engine.
    fn emit_preamble(&mut self) {
        let uses = self.ir.uses;
        let check = self.masm.new_label();
        let enough = self.masm.new_label();
        self.masm.bind(check);
        self.masm.stack_headroom_cmp();
        self.masm.jcc(CmpKind::GeU, enough);
        self.masm.emit_exit(
            STATUS_CALL_BUILTIN_FUNCTION,
            Some(BUILTIN_GROW_VALUE_STACK),
            self.stack.sp() as u32,
            true,
        );
        // One growth step may not be enough; re-entry lands here and the
        // check runs again.
        self.masm.jmp(check);
        self.masm.bind(enough);
        self.masm.init_module_context(uses);
        self.masm.reload_stack_base();
    }

    /// A builtin-function bounce: every live value goes to the value stack,
    /// the host services `builtin`, and the continuation re-derives the
    /// cached registers.
    pub fn builtin_exit(&mut self, builtin: u32) {
        self.release_all_to_stack();
        self.masm.emit_exit(
            STATUS_CALL_BUILTIN_FUNCTION,
            Some(builtin),
            self.stack.sp() as u32,
            true,
        );
        self.masm.reload_stack_base();
        if self.ir.uses.memory {
            self.masm.reload_memory_cache();
        }
    }

    fn emit_op(&mut self, op: &Operation) -> Result<()> {
        if let Operation::Label { label } = op {
            return self.emit_label(*label);
        }
        if !self.reachable {
            return Ok(());
        }
        // A pending comparison flag survives only until the next
        // flag-clobbering instruction; realise it unless this operation
        // consumes it directly.
        match op {
            Operation::BrIf { .. } | Operation::Select { .. } => {}
            _ => self.materialize_condition()?,
        }

        use Operation::*;
        match op {
            Label { .. } => unreachable!(),
            Unreachable => {
                self.masm
                    .emit_exit(STATUS_UNREACHABLE, None, self.stack.sp() as u32, false);
                self.reachable = false;
            }
            Br { target } => self.emit_br(target)?,
            BrIf { then, r#else } => self.emit_br_if(then, r#else)?,
            BrTable { targets, default } => self.emit_br_table(targets, default)?,
            Call { function_index } => self.emit_call(*function_index)?,
            CallIndirect {
                type_index,
                table_index,
            } => self.emit_call_indirect(*type_index, *table_index)?,
            Drop { range } => self.emit_drop(*range)?,
            Select { is_target_vector } => self.emit_select(*is_target_vector)?,
            Pick {
                depth,
                is_target_vector,
            } => self.emit_pick(*depth, *is_target_vector)?,
            Swap {
                depth,
                is_target_vector,
            } => self.emit_swap(*depth, *is_target_vector)?,
            GlobalGet { index } => self.emit_global_get(*index)?,
            GlobalSet { index } => self.emit_global_set(*index)?,

            ConstI32 { value } => self.emit_const_int(*value as u64, SlotType::I32)?,
            ConstI64 { value } => self.emit_const_int(*value, SlotType::I64)?,
            ConstF32 { bits } => self.emit_const_float(*bits as u64, SlotType::F32)?,
            ConstF64 { bits } => self.emit_const_float(*bits, SlotType::F64)?,
            ConstV128 { lo, hi } => self.emit_const_v128(*lo, *hi)?,

            IAdd { ty } => self.emit_int_alu(*ty, crate::masm::AluOp::Add)?,
            ISub { ty } => self.emit_int_alu(*ty, crate::masm::AluOp::Sub)?,
            IMul { ty } => self.emit_int_alu(*ty, crate::masm::AluOp::Mul)?,
            IAnd { ty } => self.emit_int_alu(*ty, crate::masm::AluOp::And)?,
            IOr { ty } => self.emit_int_alu(*ty, crate::masm::AluOp::Or)?,
            IXor { ty } => self.emit_int_alu(*ty, crate::masm::AluOp::Xor)?,
            IDiv { ty, sign } => self.emit_div_rem(*ty, *sign, false)?,
            IRem { ty, sign } => self.emit_div_rem(*ty, *sign, true)?,
            IShl { ty } => self.emit_shift(*ty, ShiftKind::Shl)?,
            IShr { ty, sign } => self.emit_shift(
                *ty,
                if sign.is_signed() {
                    ShiftKind::ShrS
                } else {
                    ShiftKind::ShrU
                },
            )?,
            IRotl { ty } => self.emit_shift(*ty, ShiftKind::Rotl)?,
            IRotr { ty } => self.emit_shift(*ty, ShiftKind::Rotr)?,
            IClz { ty } => self.emit_bit_count(*ty, crate::masm::BitCountOp::Clz)?,
            ICtz { ty } => self.emit_bit_count(*ty, crate::masm::BitCountOp::Ctz)?,
            IPopcnt { ty } => self.emit_bit_count(*ty, crate::masm::BitCountOp::Popcnt)?,
            IEqz { ty } => self.emit_eqz(*ty)?,
            ICmp { ty, kind } => self.emit_int_cmp(*ty, *kind)?,

            FAdd { ty } => self.emit_float_alu(*ty, crate::masm::FloatAluOp::Add)?,
            FSub { ty } => self.emit_float_alu(*ty, crate::masm::FloatAluOp::Sub)?,
            FMul { ty } => self.emit_float_alu(*ty, crate::masm::FloatAluOp::Mul)?,
            FDiv { ty } => self.emit_float_alu(*ty, crate::masm::FloatAluOp::Div)?,
            FMin { ty } => self.emit_float_min_max(*ty, false)?,
            FMax { ty } => self.emit_float_min_max(*ty, true)?,
            FCopysign { ty } => self.emit_float_copysign(*ty)?,
            FAbs { ty } => self.emit_float_unop(*ty, crate::masm::FloatUnOp::Abs)?,
            FNeg { ty } => self.emit_float_unop(*ty, crate::masm::FloatUnOp::Neg)?,
            FSqrt { ty } => self.emit_float_unop(*ty, crate::masm::FloatUnOp::Sqrt)?,
            FCeil { ty } => self.emit_float_unop(*ty, crate::masm::FloatUnOp::Ceil)?,
            FFloor { ty } => self.emit_float_unop(*ty, crate::masm::FloatUnOp::Floor)?,
            FTrunc { ty } => self.emit_float_unop(*ty, crate::masm::FloatUnOp::Trunc)?,
            FNearest { ty } => self.emit_float_unop(*ty, crate::masm::FloatUnOp::Nearest)?,
            FCmp { ty, kind } => self.emit_float_cmp(*ty, *kind)?,

            I32WrapI64 => self.emit_i32_wrap_i64()?,
            I64ExtendI32 { sign } => self.emit_i64_extend_i32(*sign)?,
            SignExtend { ty, from_bits } => self.emit_sign_extend(*ty, *from_bits)?,
            ITruncF {
                int,
                float,
                sign,
                saturating,
            } => self.emit_trunc_float(*int, *float, *sign, *saturating)?,
            FConvertI { float, int, sign } => self.emit_convert_int(*float, *int, *sign)?,
            F32DemoteF64 => self.emit_float_demote()?,
            F64PromoteF32 => self.emit_float_promote()?,
            I32ReinterpretF32 => self.emit_reinterpret_to_int(OperandSize::S32)?,
            I64ReinterpretF64 => self.emit_reinterpret_to_int(OperandSize::S64)?,
            F32ReinterpretI32 => self.emit_reinterpret_to_float(OperandSize::S32)?,
            F64ReinterpretI64 => self.emit_reinterpret_to_float(OperandSize::S64)?,

            Load { ty, arg } => self.emit_load(*ty, *arg)?,
            Load8 { ty, sign, arg } => self.emit_load_narrow(*ty, 8, *sign, *arg)?,
            Load16 { ty, sign, arg } => self.emit_load_narrow(*ty, 16, *sign, *arg)?,
            Load32 { sign, arg } => {
                self.emit_load_narrow(capstan_environ::IntTy::I64, 32, *sign, *arg)?
            }
            Store { ty, arg } => self.emit_store(*ty, *arg)?,
            Store8 { ty, arg } => self.emit_store_narrow(*ty, 8, *arg)?,
            Store16 { ty, arg } => self.emit_store_narrow(*ty, 16, *arg)?,
            Store32 { arg } => self.emit_store_narrow(capstan_environ::IntTy::I64, 32, *arg)?,
            MemorySize => self.emit_memory_size()?,
            MemoryGrow => {
                self.require_memory()?;
                self.builtin_exit(BUILTIN_MEMORY_GROW);
                // The previous page count (or -1) replaces the delta.
                self.stack.pop();
                self.stack.push_on_stack(SlotType::I32);
            }
            MemoryInit { data_index } => self.emit_memory_init(*data_index)?,
            DataDrop { data_index } => self.emit_data_drop(*data_index)?,
            MemoryCopy => self.emit_memory_copy()?,
            MemoryFill => self.emit_memory_fill()?,

            TableInit {
                elem_index,
                table_index,
            } => self.emit_table_init(*elem_index, *table_index)?,
            TableCopy {
                dst_table,
                src_table,
            } => self.emit_table_copy(*dst_table, *src_table)?,
            TableGet { table_index } => self.emit_table_get(*table_index)?,
            TableSet { table_index } => self.emit_table_set(*table_index)?,
            TableSize { table_index } => self.emit_table_size(*table_index)?,
            TableGrow { table_index } => {
                self.check_table_index(*table_index)?;
                self.push_imm_slot(*table_index as u64);
                self.builtin_exit(BUILTIN_TABLE_GROW);
                // [init, delta, table_index] collapse into the old size.
                for _ in 0..3 {
                    self.stack.pop();
                }
                self.stack.push_on_stack(SlotType::I32);
            }
            TableFill { table_index } => {
                self.check_table_index(*table_index)?;
                self.push_imm_slot(*table_index as u64);
                self.builtin_exit(BUILTIN_TABLE_FILL);
                for _ in 0..4 {
                    self.stack.pop();
                }
            }
            ElemDrop { elem_index } => self.emit_elem_drop(*elem_index)?,
            RefFunc { function_index } => {
                if self.env.function_type(*function_index).is_none() {
                    bail!("ref.func: function index {function_index} out of range");
                }
                self.push_imm_slot(*function_index as u64);
                self.builtin_exit(BUILTIN_REF_FUNC);
                // The index slot now holds the reference.
                self.stack.pop();
                self.stack.push_on_stack(SlotType::I64);
            }

            AtomicLoad { ty, width_bits, arg } => self.emit_atomic_load(*ty, *width_bits, *arg)?,
            AtomicStore { ty, width_bits, arg } => {
                self.emit_atomic_store(*ty, *width_bits, *arg)?
            }
            AtomicRmw {
                ty,
                width_bits,
                op,
                arg,
            } => self.emit_atomic_rmw(*ty, *width_bits, *op, *arg)?,
            AtomicCmpxchg { ty, width_bits, arg } => {
                self.emit_atomic_cmpxchg(*ty, *width_bits, *arg)?
            }
            AtomicMemoryWait { ty, arg } => {
                self.require_memory()?;
                let _ = arg;
                let builtin = match ty {
                    capstan_environ::IntTy::I32 => BUILTIN_MEMORY_WAIT32,
                    capstan_environ::IntTy::I64 => BUILTIN_MEMORY_WAIT64,
                };
                self.builtin_exit(builtin);
                // [addr, expected, timeout] collapse into the wake reason,
                // left in the slot where the address was.
                for _ in 0..3 {
                    self.stack.pop();
                }
                self.stack.push_on_stack(SlotType::I32);
            }
            AtomicMemoryNotify { arg } => {
                self.require_memory()?;
                let _ = arg;
                self.builtin_exit(BUILTIN_MEMORY_NOTIFY);
                for _ in 0..2 {
                    self.stack.pop();
                }
                self.stack.push_on_stack(SlotType::I32);
            }
            AtomicFence => self.masm.fence(),

            op => self.emit_vector_op(op)?,
        }
        Ok(())
    }

    pub(crate) fn check_table_index(&self, table_index: u32) -> Result<()> {
        if table_index as usize >= self.env.tables.len() {
            bail!("table index {table_index} out of range");
        }
        Ok(())
    }

}
