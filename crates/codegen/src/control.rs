//! Control flow and function calls.
//!
//! Branch edges follow one convention: every value is released to the value
//! stack before control transfers, so a label's snapshot is always
//! all-on-stack and every later arrival only has to agree on depth and
//! types. `br_table` arms reconcile independently against a scratch copy of
//! the pre-branch stack.

use anyhow::{bail, Result};
use capstan_environ::{
    BranchTarget, CmpKind, Label as IrLabel, CALL_FRAME_CALLEE_FUNCTION,
    CALL_FRAME_CALLER_STACK_BASE_POINTER, CALL_FRAME_RETURN_ADDRESS, CALL_FRAME_SLOTS,
    ENGINE_STACK_BASE_POINTER, ENGINE_STACK_POINTER, FUNCTION_CODE_INITIAL_ADDRESS,
    FUNCTION_TYPE_ID, ENGINE_TABLES_ELEMENT0, ENGINE_TYPE_IDS_ELEMENT0,
    STATUS_INVALID_TABLE_ACCESS, STATUS_TYPE_MISMATCH_ON_INDIRECT_CALL,
    TABLE_INSTANCE_REFERENCES, TABLE_INSTANCE_REFERENCES_LEN, ValType,
};

use smallvec::SmallVec;

use crate::buffer::CodeLabel;
use crate::codegen::CodeGen;
use crate::masm::{AluOp, MacroAssembler, OperandSize, SlotType};
use crate::reg::RegClass;
use crate::stack::{LocationStack, Location};

/// Per-label bookkeeping: the native label and the location-stack snapshot
/// captured at the first arrival.
pub(crate) struct LabelEntry {
    pub code: CodeLabel,
    pub snapshot: Option<LocationStack>,
}

impl<'a, M: MacroAssembler> CodeGen<'a, M> {
    pub(crate) fn label_code(&mut self, label: IrLabel) -> CodeLabel {
        if let Some(entry) = self.labels.get(&label) {
            return entry.code;
        }
        let code = self.masm.new_label();
        self.labels.insert(
            label,
            LabelEntry {
                code,
                snapshot: None,
            },
        );
        code
    }

    pub(crate) fn emit_label(&mut self, label: IrLabel) -> Result<()> {
        let code = self.label_code(label);
        let has_snapshot = self.labels[&label].snapshot.is_some();

        if self.reachable {
            self.materialize_condition()?;
            self.release_all_to_stack();
            if has_snapshot {
                let snapshot = self.labels[&label].snapshot.as_ref().unwrap();
                if !snapshot.isomorphic(&self.stack) {
                    bail!("stack shape at {label:?} disagrees with its first arrival");
                }
            } else {
                let snapshot = self.stack.clone();
                self.labels.get_mut(&label).unwrap().snapshot = Some(snapshot);
            }
        } else if has_snapshot {
            let snapshot = self.labels[&label].snapshot.clone().unwrap();
            self.stack.restore_from(&snapshot);
            self.reachable = true;
        }
        // A dead label (no recorded arrival, unreachable) still binds so
        // the buffer can resolve stray reads, but code stays unreachable.
        self.masm.bind(code);
        Ok(())
    }

    /// Drop this edge's dead entries, agree with (or record) the target's
    /// snapshot, and jump. The caller has already released everything to
    /// the stack.
    fn branch_edge(&mut self, target: &BranchTarget) -> Result<()> {
        if let Some(range) = target.drop_range {
            self.apply_drop_range(range)?;
        }
        let code = self.label_code(target.label);
        let has_snapshot = self.labels[&target.label].snapshot.is_some();
        if has_snapshot {
            let snapshot = self.labels[&target.label].snapshot.as_ref().unwrap();
            if !snapshot.isomorphic(&self.stack) {
                bail!(
                    "stack shape at branch to {:?} disagrees with the label snapshot",
                    target.label
                );
            }
        } else {
            let snapshot = self.stack.clone();
            self.labels.get_mut(&target.label).unwrap().snapshot = Some(snapshot);
        }
        self.masm.jmp(code);
        Ok(())
    }

    pub(crate) fn emit_br(&mut self, target: &BranchTarget) -> Result<()> {
        self.release_all_to_stack();
        self.branch_edge(target)?;
        self.reachable = false;
        Ok(())
    }

    pub(crate) fn emit_br_if(&mut self, then: &BranchTarget, els: &BranchTarget) -> Result<()> {
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
        // Spill stores leave the flags intact.
        self.release_all_to_stack();
        let saved = self.stack.clone();

        let then_side = self.masm.new_label();
        self.masm.jcc(cond, then_side);
        self.branch_edge(els)?;
        self.masm.bind(then_side);
        self.stack.restore_from(&saved);
        self.branch_edge(then)?;
        self.reachable = false;
        Ok(())
    }

    pub(crate) fn emit_br_table(
        &mut self,
        targets: &[BranchTarget],
        default: &BranchTarget,
    ) -> Result<()> {
        let (index, _) = self.pop_to_reg()?;
        self.release_all_to_stack();
        let saved = self.stack.clone();

        let out_of_range = self.masm.new_label();
        self.masm.cmp_imm(index, targets.len() as i32, OperandSize::S32);
        self.masm.jcc(CmpKind::GeU, out_of_range);

        let arms: SmallVec<[CodeLabel; 16]> =
            targets.iter().map(|_| self.masm.new_label()).collect();
        if !arms.is_empty() {
            self.masm.jump_table(index, &arms);
        }
        self.free_reg(index);

        for (arm, target) in arms.iter().zip(targets.iter()) {
            self.masm.bind(*arm);
            self.stack.restore_from(&saved);
            self.branch_edge(target)?;
        }
        self.masm.bind(out_of_range);
        self.stack.restore_from(&saved);
        self.branch_edge(default)?;
        self.reachable = false;
        Ok(())
    }

    /// Direct call. Parameters are already on the value stack; the frame is
    /// written above the larger of the parameter/result regions, the engine
    /// stack base moves to the callee's, and control transfers through the
    /// callee's function record.
    pub(crate) fn emit_call(&mut self, function_index: u32) -> Result<()> {
        let callee_ty = match self.env.function_type(function_index) {
            Some(ty) => ty.clone(),
            None => bail!("call: function index {function_index} out of range"),
        };
        self.release_all_to_stack();

        let param_slots = callee_ty.param_slots();
        let sp = self.stack.sp();
        if sp < param_slots {
            bail!("call: stack underflow for {param_slots} parameter slots");
        }
        let base_rel = sp - param_slots;
        let frame_rel = (base_rel + callee_ty.call_frame_offset()) as u32;
        let callee_prefix = (callee_ty.call_frame_offset() + CALL_FRAME_SLOTS) as u32;
        self.stack.raise_ceil(frame_rel as usize + CALL_FRAME_SLOTS);

        let t1 = self.alloc_reg(RegClass::Int)?;
        let t2 = self.alloc_reg(RegClass::Int)?;
        let cont = self.masm.new_label();

        self.masm.read_instruction_address(t1, cont);
        self.masm
            .store_slot(t1, frame_rel + CALL_FRAME_RETURN_ADDRESS as u32, SlotType::I64);
        self.masm.load_engine(t1, ENGINE_STACK_BASE_POINTER);
        self.masm.store_slot(
            t1,
            frame_rel + CALL_FRAME_CALLER_STACK_BASE_POINTER as u32,
            SlotType::I64,
        );
        self.masm.alu_imm(AluOp::Add, base_rel as i32, t1, OperandSize::S64);
        self.masm.store_engine(t1, ENGINE_STACK_BASE_POINTER);
        self.masm
            .alu_imm(AluOp::Add, callee_prefix as i32, t1, OperandSize::S64);
        self.masm.store_engine(t1, ENGINE_STACK_POINTER);

        self.masm.load_function_addr(t2, function_index);
        self.masm
            .store_slot(t2, frame_rel + CALL_FRAME_CALLEE_FUNCTION as u32, SlotType::I64);
        self.masm.load_mem64(t2, t2, FUNCTION_CODE_INITIAL_ADDRESS);
        self.masm.jmp_reg(t2);
        self.masm.bind(cont);

        self.masm.reload_stack_base();
        if self.ir.uses.memory {
            self.masm.reload_memory_cache();
        }
        self.free_reg(t1);
        self.free_reg(t2);

        self.finish_call_bookkeeping(base_rel, &callee_ty.results);
        Ok(())
    }

    pub(crate) fn emit_call_indirect(&mut self, type_index: u32, table_index: u32) -> Result<()> {
        let callee_ty = match self.env.types.get(type_index as usize) {
            Some(ty) => ty.clone(),
            None => bail!("call_indirect: type index {type_index} out of range"),
        };
        self.check_table_index(table_index)?;

        let (index, _) = self.pop_to_reg()?;
        self.release_all_to_stack();
        let sp_rel = self.sp_rel();

        // Bounds, null and type checks against the table entry.
        let record = self.alloc_reg(RegClass::Int)?;
        let tmp = self.alloc_reg(RegClass::Int)?;
        self.masm.load_engine(record, ENGINE_TABLES_ELEMENT0);
        self.masm.load_mem64(record, record, table_index * 8);
        self.masm.load_mem64(tmp, record, TABLE_INSTANCE_REFERENCES_LEN);
        self.masm.cmp_rr(index, tmp, OperandSize::S64);
        self.masm
            .trap_if(CmpKind::GeU, STATUS_INVALID_TABLE_ACCESS, sp_rel);
        self.masm.load_mem64(record, record, TABLE_INSTANCE_REFERENCES);
        self.masm.load_indexed64(record, record, index, 3);
        self.masm.cmp_imm(record, 0, OperandSize::S64);
        self.masm
            .trap_if(CmpKind::Eq, STATUS_INVALID_TABLE_ACCESS, sp_rel);
        self.masm.load_engine(tmp, ENGINE_TYPE_IDS_ELEMENT0);
        self.masm.load_mem64(tmp, tmp, type_index * 8);
        let scratch = self.masm.scratch();
        self.masm.load_mem64(scratch, record, FUNCTION_TYPE_ID);
        self.masm.cmp_rr(scratch, tmp, OperandSize::S64);
        self.masm
            .trap_if(CmpKind::Ne, STATUS_TYPE_MISMATCH_ON_INDIRECT_CALL, sp_rel);
        self.free_reg(index);

        let param_slots = callee_ty.param_slots();
        let sp = self.stack.sp();
        if sp < param_slots {
            bail!("call_indirect: stack underflow for {param_slots} parameter slots");
        }
        let base_rel = sp - param_slots;
        let frame_rel = (base_rel + callee_ty.call_frame_offset()) as u32;
        let callee_prefix = (callee_ty.call_frame_offset() + CALL_FRAME_SLOTS) as u32;
        self.stack.raise_ceil(frame_rel as usize + CALL_FRAME_SLOTS);

        let cont = self.masm.new_label();
        self.masm.read_instruction_address(tmp, cont);
        self.masm
            .store_slot(tmp, frame_rel + CALL_FRAME_RETURN_ADDRESS as u32, SlotType::I64);
        self.masm.load_engine(tmp, ENGINE_STACK_BASE_POINTER);
        self.masm.store_slot(
            tmp,
            frame_rel + CALL_FRAME_CALLER_STACK_BASE_POINTER as u32,
            SlotType::I64,
        );
        self.masm.alu_imm(AluOp::Add, base_rel as i32, tmp, OperandSize::S64);
        self.masm.store_engine(tmp, ENGINE_STACK_BASE_POINTER);
        self.masm
            .alu_imm(AluOp::Add, callee_prefix as i32, tmp, OperandSize::S64);
        self.masm.store_engine(tmp, ENGINE_STACK_POINTER);

        self.masm
            .store_slot(record, frame_rel + CALL_FRAME_CALLEE_FUNCTION as u32, SlotType::I64);
        self.masm.load_mem64(record, record, FUNCTION_CODE_INITIAL_ADDRESS);
        self.masm.jmp_reg(record);
        self.masm.bind(cont);

        self.masm.reload_stack_base();
        if self.ir.uses.memory {
            self.masm.reload_memory_cache();
        }
        self.free_reg(record);
        self.free_reg(tmp);

        self.finish_call_bookkeeping(base_rel, &callee_ty.results);
        Ok(())
    }

    fn finish_call_bookkeeping(&mut self, base_rel: usize, results: &[ValType]) {
        self.stack.shrink_to(base_rel);
        for result in results {
            match result {
                ValType::V128 => {
                    self.stack.push_vector_on_stack();
                }
                other => {
                    self.stack.push_on_stack(SlotType::scalar(*other));
                }
            }
        }
    }

    /// The epilogue: results slide down into the shared parameter/result
    /// region, the frame pops, and control returns to the caller, or to
    /// the host when this frame is the entry frame.
    pub(crate) fn emit_function_return(&mut self) -> Result<()> {
        self.materialize_condition()?;
        self.release_all_to_stack();

        let result_slots = self.ir.ty.result_slots() as u32;
        let sp = self.sp_rel();
        if sp < result_slots {
            bail!("function end: stack underflow for {result_slots} result slots");
        }
        let src_base = sp - result_slots;
        if src_base != 0 {
            let scratch = self.masm.scratch();
            for i in 0..result_slots {
                self.masm.load_slot(scratch, src_base + i, SlotType::I64);
                self.masm.store_slot(scratch, i, SlotType::I64);
            }
        }

        let frame_rel = self.ir.ty.call_frame_offset() as u32;
        let ra_tmp = self.alloc_reg(RegClass::Int)?;
        self.masm.function_return(frame_rel, result_slots, ra_tmp);
        self.free_reg(ra_tmp);
        self.reachable = false;
        Ok(())
    }
}
