//! Value/register choreography shared by every lowering.
//!
//! These helpers are the only code that moves values between the three
//! locations; the operation emitters compose them and never touch the
//! used-register masks directly.

use anyhow::{bail, Result};
use capstan_environ::InclusiveRange;
use smallvec::SmallVec;

use crate::codegen::CodeGen;
use crate::masm::{MacroAssembler, OperandSize, SlotType};
use crate::reg::{Reg, RegClass};
use crate::stack::Location;

impl<'a, M: MacroAssembler> CodeGen<'a, M> {
    pub(crate) fn sp_rel(&self) -> u32 {
        self.stack.sp() as u32
    }

    /// Allocate a register of `class`, spilling the deepest on-register
    /// value of that class when none is free.
    pub(crate) fn alloc_reg(&mut self, class: RegClass) -> Result<Reg> {
        self.alloc_reg_excluding(class, &[])
    }

    /// Same, but never steals a register owned by a value in `exclude`;
    /// used when those values must stay materialised.
    pub(crate) fn alloc_reg_excluding(
        &mut self,
        class: RegClass,
        exclude: &[usize],
    ) -> Result<Reg> {
        let pool = self.masm.pool();
        if let Some(reg) = self.stack.take_free_register(class, &pool) {
            self.stack.mark_register_used(reg);
            return Ok(reg);
        }
        let victim = if exclude.is_empty() {
            self.stack.take_steal_target(class)
        } else {
            self.stack.values().iter().position(|v| {
                v.ty != SlotType::V128Hi
                    && v.on_register()
                    && v.ty.reg_class() == class
                    && !exclude.contains(&v.stack_pointer)
            })
        };
        match victim {
            Some(idx) => {
                let reg = self.stack.value(idx).reg();
                self.spill_value(idx);
                self.stack.mark_register_used(reg);
                Ok(reg)
            }
            None => bail!("register class {class:?} exhausted: lowering holds too many live registers"),
        }
    }

    pub(crate) fn free_reg(&mut self, reg: Reg) {
        self.stack.mark_register_unused(reg);
    }

    /// Make a specific register available, spilling its current owner if
    /// any, and mark it used by the caller.
    pub(crate) fn claim_fixed(&mut self, reg: Reg) {
        if self.stack.is_register_used(reg) {
            let owner = self
                .stack
                .values()
                .iter()
                .position(|v| {
                    v.ty != SlotType::V128Hi && v.on_register() && v.reg() == reg
                })
                .expect("fixed register held outside the location stack");
            self.spill_value(owner);
        }
        self.stack.mark_register_used(reg);
    }

    /// Release one value to its backing slot on the value stack. Registers
    /// are freed; a pending comparison flag is realised through the
    /// scratch register without touching the allocatable set.
    pub(crate) fn spill_value(&mut self, idx: usize) {
        let value = *self.stack.value(idx);
        match value.loc {
            Location::Stack => {}
            Location::Register(reg) => {
                if value.ty == SlotType::V128Lo {
                    self.masm.store_slot_v128(reg, value.stack_pointer as u32);
                    self.stack.value_mut(idx).loc = Location::Stack;
                    self.stack.value_mut(idx + 1).loc = Location::Stack;
                } else if value.ty == SlotType::V128Hi {
                    // Spilled together with its low half.
                    return;
                } else {
                    self.masm
                        .store_slot(reg, value.stack_pointer as u32, value.ty);
                    self.stack.value_mut(idx).loc = Location::Stack;
                }
                self.stack.mark_register_unused(reg);
            }
            Location::Condition(kind) => {
                let scratch = self.masm.scratch();
                self.masm.setcc(kind, scratch);
                self.masm
                    .store_slot(scratch, value.stack_pointer as u32, SlotType::I32);
                self.stack.value_mut(idx).loc = Location::Stack;
            }
        }
    }

    /// Release every live register and flag to the value stack; the model
    /// becomes all-on-stack, the shape every branch edge and call site
    /// requires.
    pub(crate) fn release_all_to_stack(&mut self) {
        for idx in 0..self.stack.sp() {
            self.spill_value(idx);
        }
    }

    /// Realise a pending comparison flag into a general purpose register
    /// before an instruction that may clobber the flags.
    pub(crate) fn materialize_condition(&mut self) -> Result<()> {
        if self.stack.sp() == 0 {
            return Ok(());
        }
        let top = *self.stack.peek_at(0);
        if let Location::Condition(kind) = top.loc {
            // Register moves and spill stores leave the flags intact, so
            // allocation is safe here.
            let reg = self.alloc_reg(RegClass::Int)?;
            self.masm.setcc(kind, reg);
            self.stack.value_mut(top.stack_pointer).loc = Location::Register(reg);
        }
        Ok(())
    }

    /// Pop the top scalar into a register; the caller owns the register.
    pub(crate) fn pop_to_reg(&mut self) -> Result<(Reg, SlotType)> {
        self.materialize_condition()?;
        let value = self.stack.pop();
        match value.loc {
            Location::Register(reg) => Ok((reg, value.ty)),
            Location::Stack => {
                let reg = self.alloc_reg(value.ty.reg_class())?;
                self.masm
                    .load_slot(reg, value.stack_pointer as u32, value.ty);
                Ok((reg, value.ty))
            }
            Location::Condition(_) => unreachable!("condition was materialised"),
        }
    }

    /// Pop the top v128 pair into a vector register.
    pub(crate) fn pop_vector_to_reg(&mut self) -> Result<Reg> {
        let value = self.stack.pop_vector();
        match value.loc {
            Location::Register(reg) => Ok(reg),
            Location::Stack => {
                let reg = self.alloc_reg(RegClass::Float)?;
                self.masm.load_slot_v128(reg, value.stack_pointer as u32);
                Ok(reg)
            }
            Location::Condition(_) => unreachable!("v128 never lives in flags"),
        }
    }

    /// Materialise the value at stack index `idx` into a register without
    /// popping it, keeping the registers of the values in `also` pinned;
    /// `swap` materialises two values at once this way.
    pub(crate) fn ensure_on_register_excluding(
        &mut self,
        idx: usize,
        also: &[usize],
    ) -> Result<Reg> {
        let value = *self.stack.value(idx);
        let mut exclude = vec![idx];
        exclude.extend_from_slice(also);
        match value.loc {
            Location::Register(reg) => Ok(reg),
            Location::Condition(kind) => {
                let reg = self.alloc_reg_excluding(RegClass::Int, &exclude)?;
                self.masm.setcc(kind, reg);
                self.stack.value_mut(idx).loc = Location::Register(reg);
                Ok(reg)
            }
            Location::Stack => {
                if value.ty == SlotType::V128Lo {
                    let reg = self.alloc_reg_excluding(RegClass::Float, &exclude)?;
                    self.masm.load_slot_v128(reg, value.stack_pointer as u32);
                    self.stack.value_mut(idx).loc = Location::Register(reg);
                    self.stack.value_mut(idx + 1).loc = Location::Register(reg);
                    Ok(reg)
                } else {
                    let reg = self.alloc_reg_excluding(value.ty.reg_class(), &exclude)?;
                    self.masm
                        .load_slot(reg, value.stack_pointer as u32, value.ty);
                    self.stack.value_mut(idx).loc = Location::Register(reg);
                    Ok(reg)
                }
            }
        }
    }

    /// Store an immediate directly into the next value-stack slot and push
    /// the slot; used when a value must be visible to the host.
    pub(crate) fn push_imm_slot(&mut self, value: u64) {
        let scratch = self.masm.scratch();
        self.masm.mov_imm(scratch, value, OperandSize::S64);
        self.masm
            .store_slot(scratch, self.stack.sp() as u32, SlotType::I64);
        self.stack.push_on_stack(SlotType::I64);
    }

    /// Drop the inclusive range (counted from the top) and slide the
    /// values above it down. Register-resident survivors keep their
    /// registers; stack-resident survivors migrate through the scratch
    /// registers. The high half of a v128 moves with its low half.
    pub(crate) fn apply_drop_range(&mut self, range: InclusiveRange) -> Result<()> {
        self.materialize_condition()?;
        let sp = self.stack.sp();
        let live_count = range.start as usize;
        let drop_count = (range.end - range.start + 1) as usize;
        if live_count + drop_count > sp {
            bail!("drop range {range:?} exceeds stack depth {sp}");
        }
        let keep_below = sp - live_count - drop_count;

        // Free the dropped registers.
        for idx in keep_below..sp - live_count {
            let value = *self.stack.value(idx);
            if let Location::Register(reg) = value.loc {
                if value.ty != SlotType::V128Hi {
                    self.stack.mark_register_unused(reg);
                }
            }
        }

        let lives: SmallVec<[crate::stack::Value; 8]> = (sp - live_count..sp)
            .map(|idx| *self.stack.value(idx))
            .collect();
        self.stack.shrink_to(keep_below);

        let mut pending_vector: Option<Reg> = None;
        for live in lives {
            match live.ty {
                SlotType::V128Lo => match live.loc {
                    Location::Register(reg) => {
                        pending_vector = Some(reg);
                    }
                    Location::Stack => {
                        let scratch = self.masm.scratch_float();
                        self.masm.load_slot_v128(scratch, live.stack_pointer as u32);
                        self.masm
                            .store_slot_v128(scratch, self.stack.sp() as u32);
                        self.stack.push_vector_on_stack();
                    }
                    Location::Condition(_) => unreachable!(),
                },
                SlotType::V128Hi => {
                    if let Some(reg) = pending_vector.take() {
                        self.stack.push_vector_on_register(reg);
                    }
                }
                ty => match live.loc {
                    Location::Register(reg) => {
                        self.stack.push_on_register(ty, reg);
                    }
                    Location::Stack => {
                        let scratch = match ty.reg_class() {
                            RegClass::Int => self.masm.scratch(),
                            RegClass::Float => self.masm.scratch_float(),
                        };
                        self.masm.load_slot(scratch, live.stack_pointer as u32, ty);
                        self.masm
                            .store_slot(scratch, self.stack.sp() as u32, ty);
                        self.stack.push_on_stack(ty);
                    }
                    Location::Condition(_) => unreachable!("condition was materialised"),
                },
            }
        }
        Ok(())
    }
}
