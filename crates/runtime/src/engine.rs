//! The call engine: per-call execution state shared with generated code.
//!
//! Generated code holds the engine's address in a reserved register for
//! the whole call and reads/writes the leading `#[repr(C)]` block at the
//! fixed offsets from `capstan-environ`; the layout test below fails the
//! build loudly if the two drift apart.

use capstan_environ::{
    FunctionType, Tunables, ValType, CALL_FRAME_CALLEE_FUNCTION, CALL_FRAME_SLOTS,
};
use log::trace;

use crate::function::Function;
use crate::trap::{NativeCallStatus, Trap};

/// Per-call execution state. One engine drives one native call at a time;
/// engines are never shared between threads.
#[repr(C)]
pub struct CallEngine {
    // Stack context.
    pub(crate) value_stack_element0: *mut u64,
    pub(crate) value_stack_len: u64,
    pub(crate) stack_pointer: u64,
    pub(crate) stack_base_pointer: u64,
    // Exit context.
    pub(crate) status_code: u32,
    pub(crate) builtin_call_index: u32,
    // Module context cache, populated by generated preambles.
    pub(crate) module_instance: u64,
    pub(crate) globals_element0: u64,
    pub(crate) memory_element0: u64,
    pub(crate) memory_len: u64,
    pub(crate) memory_instance: u64,
    pub(crate) tables_element0: u64,
    pub(crate) tables_len: u64,
    pub(crate) type_ids_element0: u64,
    pub(crate) data_instances_element0: u64,
    pub(crate) element_instances_element0: u64,
    pub(crate) functions_element0: u64,
    // Architecture context.
    pub(crate) compiler_call_return_address: u64,
    pub(crate) host_stack_pointer: u64,
    pub(crate) host_return_address: u64,

    // Host-only storage; nothing below is visible to generated code.
    stack: Vec<u64>,
    max_slots: usize,
}

impl CallEngine {
    pub fn new(tunables: &Tunables) -> Box<CallEngine> {
        let mut engine = Box::new(CallEngine {
            value_stack_element0: std::ptr::null_mut(),
            value_stack_len: 0,
            stack_pointer: 0,
            stack_base_pointer: 0,
            status_code: 0,
            builtin_call_index: 0,
            module_instance: 0,
            globals_element0: 0,
            memory_element0: 0,
            memory_len: 0,
            memory_instance: 0,
            tables_element0: 0,
            tables_len: 0,
            type_ids_element0: 0,
            data_instances_element0: 0,
            element_instances_element0: 0,
            functions_element0: 0,
            compiler_call_return_address: 0,
            host_stack_pointer: 0,
            host_return_address: 0,
            stack: vec![0; tunables.initial_value_stack_slots],
            max_slots: tunables.max_value_stack_slots,
        });
        engine.refresh_stack_header();
        engine
    }

    fn refresh_stack_header(&mut self) {
        self.value_stack_element0 = self.stack.as_mut_ptr();
        self.value_stack_len = self.stack.len() as u64;
    }

    /// Seed the stack for an entry call: parameters at the bottom, padding
    /// up to the call-frame offset, then the entry frame whose zeroed
    /// return address tells the epilogue to exit with `Returned`.
    pub fn prepare_entry_call(&mut self, callee: *const Function, ty: &FunctionType,
        params: &[u64]) {
        debug_assert_eq!(params.len(), ty.param_slots());
        let frame = ty.call_frame_offset();
        for slot in self.stack.iter_mut().take(frame + CALL_FRAME_SLOTS) {
            *slot = 0;
        }
        self.stack[..params.len()].copy_from_slice(params);
        self.stack[frame + CALL_FRAME_CALLEE_FUNCTION] = callee as u64;
        self.stack_base_pointer = 0;
        self.stack_pointer = (frame + CALL_FRAME_SLOTS) as u64;
        self.status_code = 0;
        self.builtin_call_index = 0;
        self.refresh_stack_header();
    }

    pub fn status(&self) -> Option<NativeCallStatus> {
        NativeCallStatus::from_raw(self.status_code)
    }

    pub fn builtin_index(&self) -> u32 {
        self.builtin_call_index
    }

    pub fn compiler_call_return_address(&self) -> u64 {
        self.compiler_call_return_address
    }

    pub fn stack_pointer(&self) -> usize {
        self.stack_pointer as usize
    }

    /// Raw value-stack slot access for builtin servicing and result reads.
    pub fn slot(&self, index: usize) -> u64 {
        self.stack[index]
    }

    pub fn set_slot(&mut self, index: usize, value: u64) {
        self.stack[index] = value;
    }

    /// Grow the value stack to fit at least `required` more slots above the
    /// current base. The backing array moves, so every cached address is
    /// re-derived by the continuation code after re-entry.
    pub fn grow_value_stack(&mut self) -> Result<(), Trap> {
        let new_len = (self.stack.len() * 2).max(16);
        if new_len > self.max_slots {
            return Err(Trap::StackOverflow);
        }
        trace!(
            "growing value stack {} -> {} slots (sp = {})",
            self.stack.len(),
            new_len,
            self.stack_pointer
        );
        self.stack.resize(new_len, 0);
        self.refresh_stack_header();
        Ok(())
    }

    /// Read one result by type; results of an entry call sit at the bottom
    /// of the stack.
    pub fn result_bits(&self, slot: usize, ty: ValType) -> u64 {
        match ty {
            ValType::I32 | ValType::F32 => self.stack[slot] & 0xffff_ffff,
            _ => self.stack[slot],
        }
    }
}

// The engine address crosses threads only while no call is running.
unsafe impl Send for CallEngine {}

#[cfg(test)]
mod tests {
    use super::*;
    use capstan_environ as env;
    use memoffset::offset_of;

    #[test]
    fn engine_layout_matches_the_offset_table() {
        assert_eq!(
            offset_of!(CallEngine, value_stack_element0),
            env::ENGINE_VALUE_STACK_ELEMENT0 as usize
        );
        assert_eq!(
            offset_of!(CallEngine, value_stack_len),
            env::ENGINE_VALUE_STACK_LEN as usize
        );
        assert_eq!(
            offset_of!(CallEngine, stack_pointer),
            env::ENGINE_STACK_POINTER as usize
        );
        assert_eq!(
            offset_of!(CallEngine, stack_base_pointer),
            env::ENGINE_STACK_BASE_POINTER as usize
        );
        assert_eq!(
            offset_of!(CallEngine, status_code),
            env::ENGINE_STATUS_CODE as usize
        );
        assert_eq!(
            offset_of!(CallEngine, builtin_call_index),
            env::ENGINE_BUILTIN_CALL_INDEX as usize
        );
        assert_eq!(
            offset_of!(CallEngine, module_instance),
            env::ENGINE_MODULE_INSTANCE as usize
        );
        assert_eq!(
            offset_of!(CallEngine, globals_element0),
            env::ENGINE_GLOBALS_ELEMENT0 as usize
        );
        assert_eq!(
            offset_of!(CallEngine, memory_element0),
            env::ENGINE_MEMORY_ELEMENT0 as usize
        );
        assert_eq!(
            offset_of!(CallEngine, memory_len),
            env::ENGINE_MEMORY_LEN as usize
        );
        assert_eq!(
            offset_of!(CallEngine, memory_instance),
            env::ENGINE_MEMORY_INSTANCE as usize
        );
        assert_eq!(
            offset_of!(CallEngine, tables_element0),
            env::ENGINE_TABLES_ELEMENT0 as usize
        );
        assert_eq!(
            offset_of!(CallEngine, tables_len),
            env::ENGINE_TABLES_LEN as usize
        );
        assert_eq!(
            offset_of!(CallEngine, type_ids_element0),
            env::ENGINE_TYPE_IDS_ELEMENT0 as usize
        );
        assert_eq!(
            offset_of!(CallEngine, data_instances_element0),
            env::ENGINE_DATA_INSTANCES_ELEMENT0 as usize
        );
        assert_eq!(
            offset_of!(CallEngine, element_instances_element0),
            env::ENGINE_ELEMENT_INSTANCES_ELEMENT0 as usize
        );
        assert_eq!(
            offset_of!(CallEngine, functions_element0),
            env::ENGINE_FUNCTIONS_ELEMENT0 as usize
        );
        assert_eq!(
            offset_of!(CallEngine, compiler_call_return_address),
            env::ENGINE_COMPILER_CALL_RETURN_ADDRESS as usize
        );
        assert_eq!(
            offset_of!(CallEngine, host_stack_pointer),
            env::ENGINE_HOST_STACK_POINTER as usize
        );
        assert_eq!(
            offset_of!(CallEngine, host_return_address),
            env::ENGINE_HOST_RETURN_ADDRESS as usize
        );
    }

    #[test]
    fn entry_call_seeds_params_and_frame() {
        let mut engine = CallEngine::new(&Tunables::default());
        let ty = FunctionType::new([ValType::I32, ValType::I64], [ValType::I32]);
        engine.prepare_entry_call(0x1234 as *const Function, &ty, &[7, 9]);
        assert_eq!(engine.slot(0), 7);
        assert_eq!(engine.slot(1), 9);
        // Frame: return address 0, caller base 0, callee record.
        assert_eq!(engine.slot(2), 0);
        assert_eq!(engine.slot(3), 0);
        assert_eq!(engine.slot(4), 0x1234);
        assert_eq!(engine.stack_pointer(), 2 + CALL_FRAME_SLOTS);
    }
}
