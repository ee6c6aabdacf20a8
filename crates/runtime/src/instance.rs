//! Module instances: the per-module runtime state generated code runs
//! against.
//!
//! An instance owns its globals, memory, tables, passive segments and
//! function records. The `#[repr(C)]` header exposes the addresses the
//! preamble copies into the call engine's module-context cache; all of
//! them point into heap storage owned by the instance, so they stay valid
//! for the instance's lifetime. Function records are boxed and never move:
//! their addresses are the currency of direct calls, tables and `ref.func`.

use capstan_environ::{FunctionType, MemoryDecl, ValType};

use crate::function::Function;
use crate::global::GlobalInstance;
use crate::memory::MemoryInstance;
use crate::table::TableInstance;

/// A passive data or element segment header: raw pointer + length, read
/// (and zeroed by the drop operations) directly by generated code.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct PassiveSlice {
    pub ptr: u64,
    pub len: u64,
}

#[repr(C)]
pub struct ModuleInstance {
    globals_element0: *mut *mut GlobalInstance,
    memory: *mut MemoryInstance,
    tables_element0: *mut *mut TableInstance,
    tables_len: u64,
    engine: u64,
    type_ids_element0: *const u64,
    data_instances_element0: *mut PassiveSlice,
    element_instances_element0: *mut PassiveSlice,
    functions_element0: *mut *mut Function,

    globals: Vec<Box<GlobalInstance>>,
    global_ptrs: Vec<*mut GlobalInstance>,
    memory_box: Option<Box<MemoryInstance>>,
    tables: Vec<Box<TableInstance>>,
    table_ptrs: Vec<*mut TableInstance>,
    type_ids: Vec<u64>,
    data_storage: Vec<Vec<u8>>,
    data_slices: Vec<PassiveSlice>,
    element_storage: Vec<Vec<u64>>,
    element_slices: Vec<PassiveSlice>,
    functions: Vec<Box<Function>>,
    function_ptrs: Vec<*mut Function>,
}

// Instances are confined to one thread at a time; shared memories are the
// only cross-thread window and only through the atomic operations.
unsafe impl Send for ModuleInstance {}

impl ModuleInstance {
    pub fn memory(&self) -> Option<&MemoryInstance> {
        self.memory_box.as_deref()
    }

    pub fn memory_mut(&mut self) -> Option<&mut MemoryInstance> {
        self.memory_box.as_deref_mut()
    }

    pub fn table(&self, index: usize) -> Option<&TableInstance> {
        self.tables.get(index).map(|t| &**t)
    }

    pub fn table_mut(&mut self, index: usize) -> Option<&mut TableInstance> {
        self.tables.get_mut(index).map(|t| &mut **t)
    }

    pub fn global(&self, index: usize) -> Option<&GlobalInstance> {
        self.globals.get(index).map(|g| &**g)
    }

    pub fn global_mut(&mut self, index: usize) -> Option<&mut GlobalInstance> {
        self.globals.get_mut(index).map(|g| &mut **g)
    }

    pub fn function(&self, index: usize) -> Option<&Function> {
        self.functions.get(index).map(|f| &**f)
    }

    pub fn function_mut(&mut self, index: usize) -> Option<&mut Function> {
        self.functions.get_mut(index).map(|f| &mut **f)
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    /// The record address direct calls and tables carry.
    pub fn function_record_addr(&self, index: usize) -> Option<u64> {
        self.function_ptrs.get(index).map(|p| *p as u64)
    }

    pub fn data_segment(&self, index: usize) -> Option<PassiveSlice> {
        self.data_slices.get(index).copied()
    }

    /// Refresh the cached table/memory header words after a host-side
    /// grow; the element0 arrays themselves are stable.
    pub fn self_ptr(&mut self) -> *mut ModuleInstance {
        self as *mut ModuleInstance
    }
}

/// Builds a `ModuleInstance`, wiring the header pointers once all owned
/// storage is in place.
#[derive(Default)]
pub struct ModuleInstanceBuilder {
    globals: Vec<Box<GlobalInstance>>,
    memory: Option<Box<MemoryInstance>>,
    tables: Vec<Box<TableInstance>>,
    type_ids: Vec<u64>,
    data: Vec<Vec<u8>>,
    elements: Vec<Vec<u32>>,
    functions: Vec<(FunctionType, u64)>,
}

impl ModuleInstanceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global(mut self, ty: ValType, mutable: bool, val: u64, val_hi: u64) -> Self {
        self.globals.push(GlobalInstance::new(ty, mutable, val, val_hi));
        self
    }

    pub fn memory(mut self, decl: &MemoryDecl) -> Self {
        self.memory = Some(MemoryInstance::new(decl));
        self
    }

    pub fn table(mut self, ty: ValType, min: u32, max: Option<u32>) -> Self {
        self.tables.push(TableInstance::new(ty, min, max));
        self
    }

    pub fn type_ids(mut self, ids: Vec<u64>) -> Self {
        self.type_ids = ids;
        self
    }

    pub fn data_segment(mut self, bytes: Vec<u8>) -> Self {
        self.data.push(bytes);
        self
    }

    /// A passive element segment, as function indices resolved to record
    /// addresses at build time.
    pub fn element_segment(mut self, function_indices: Vec<u32>) -> Self {
        self.elements.push(function_indices);
        self
    }

    pub fn function(mut self, ty: FunctionType, type_id: u64) -> Self {
        self.functions.push((ty, type_id));
        self
    }

    pub fn build(self) -> Box<ModuleInstance> {
        let functions: Vec<Box<Function>> = self
            .functions
            .into_iter()
            .enumerate()
            .map(|(i, (ty, type_id))| Function::new(ty, type_id, i as u32))
            .collect();

        let mut instance = Box::new(ModuleInstance {
            globals_element0: std::ptr::null_mut(),
            memory: std::ptr::null_mut(),
            tables_element0: std::ptr::null_mut(),
            tables_len: 0,
            engine: 0,
            type_ids_element0: std::ptr::null(),
            data_instances_element0: std::ptr::null_mut(),
            element_instances_element0: std::ptr::null_mut(),
            functions_element0: std::ptr::null_mut(),
            globals: self.globals,
            global_ptrs: Vec::new(),
            memory_box: self.memory,
            tables: self.tables,
            table_ptrs: Vec::new(),
            type_ids: self.type_ids,
            data_storage: self.data,
            data_slices: Vec::new(),
            element_storage: Vec::new(),
            element_slices: Vec::new(),
            functions,
            function_ptrs: Vec::new(),
        });

        instance.function_ptrs = instance
            .functions
            .iter_mut()
            .map(|f| &mut **f as *mut Function)
            .collect();
        instance.global_ptrs = instance
            .globals
            .iter_mut()
            .map(|g| &mut **g as *mut GlobalInstance)
            .collect();
        instance.table_ptrs = instance
            .tables
            .iter_mut()
            .map(|t| &mut **t as *mut TableInstance)
            .collect();
        instance.data_slices = instance
            .data_storage
            .iter()
            .map(|d| PassiveSlice {
                ptr: d.as_ptr() as u64,
                len: d.len() as u64,
            })
            .collect();
        instance.element_storage = self
            .elements
            .into_iter()
            .map(|seg| {
                seg.into_iter()
                    .map(|idx| instance.function_ptrs[idx as usize] as u64)
                    .collect()
            })
            .collect();
        instance.element_slices = instance
            .element_storage
            .iter()
            .map(|e| PassiveSlice {
                ptr: e.as_ptr() as u64,
                len: e.len() as u64,
            })
            .collect();

        let instance_addr = &mut *instance as *mut ModuleInstance as u64;
        for function in &mut instance.functions {
            function.set_module_instance(instance_addr);
        }

        instance.globals_element0 = instance.global_ptrs.as_mut_ptr();
        instance.memory = instance
            .memory_box
            .as_deref_mut()
            .map(|m| m as *mut MemoryInstance)
            .unwrap_or(std::ptr::null_mut());
        instance.tables_element0 = instance.table_ptrs.as_mut_ptr();
        instance.tables_len = instance.table_ptrs.len() as u64;
        instance.type_ids_element0 = instance.type_ids.as_ptr();
        instance.data_instances_element0 = instance.data_slices.as_mut_ptr();
        instance.element_instances_element0 = instance.element_slices.as_mut_ptr();
        instance.functions_element0 = instance.function_ptrs.as_mut_ptr();
        instance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capstan_environ as env;
    use memoffset::offset_of;

    #[test]
    fn instance_layout_matches_the_offset_table() {
        assert_eq!(
            offset_of!(ModuleInstance, globals_element0),
            env::MODULE_INSTANCE_GLOBALS_ELEMENT0 as usize
        );
        assert_eq!(
            offset_of!(ModuleInstance, memory),
            env::MODULE_INSTANCE_MEMORY as usize
        );
        assert_eq!(
            offset_of!(ModuleInstance, tables_element0),
            env::MODULE_INSTANCE_TABLES_ELEMENT0 as usize
        );
        assert_eq!(
            offset_of!(ModuleInstance, tables_len),
            env::MODULE_INSTANCE_TABLES_LEN as usize
        );
        assert_eq!(
            offset_of!(ModuleInstance, engine),
            env::MODULE_INSTANCE_ENGINE as usize
        );
        assert_eq!(
            offset_of!(ModuleInstance, type_ids_element0),
            env::MODULE_INSTANCE_TYPE_IDS_ELEMENT0 as usize
        );
        assert_eq!(
            offset_of!(ModuleInstance, data_instances_element0),
            env::MODULE_INSTANCE_DATA_INSTANCES_ELEMENT0 as usize
        );
        assert_eq!(
            offset_of!(ModuleInstance, element_instances_element0),
            env::MODULE_INSTANCE_ELEMENT_INSTANCES_ELEMENT0 as usize
        );
        assert_eq!(
            offset_of!(ModuleInstance, functions_element0),
            env::MODULE_INSTANCE_FUNCTIONS_ELEMENT0 as usize
        );
        assert_eq!(
            offset_of!(PassiveSlice, ptr),
            env::PASSIVE_INSTANCE_PTR as usize
        );
        assert_eq!(
            offset_of!(PassiveSlice, len),
            env::PASSIVE_INSTANCE_LEN as usize
        );
    }

    #[test]
    fn builder_wires_header_pointers() {
        let instance = ModuleInstanceBuilder::new()
            .global(ValType::I32, true, 41, 0)
            .table(ValType::FuncRef, 4, None)
            .type_ids(vec![7])
            .function(FunctionType::default(), 7)
            .build();
        assert_eq!(instance.function_count(), 1);
        assert!(instance.function_record_addr(0).is_some());
        assert_eq!(instance.global(0).unwrap().value(), 41);
        assert_eq!(instance.table(0).unwrap().len(), 4);
    }
}
