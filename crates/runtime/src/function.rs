//! Compiled function records.

use capstan_environ::FunctionType;

use crate::code_memory::CodeMemory;

/// One compiled function. The four leading words are the ABI surface
/// generated code reads: entry address, stack ceiling, owning instance and
/// type id. The record's address itself is what direct calls, tables and
/// `ref.func` values carry, so records never move once published.
#[repr(C)]
pub struct Function {
    code_initial_address: u64,
    stack_pointer_ceil: u64,
    module_instance: u64,
    type_id: u64,

    code: Option<CodeMemory>,
    ty: FunctionType,
    index: u32,
}

impl Function {
    pub fn new(ty: FunctionType, type_id: u64, index: u32) -> Box<Function> {
        Box::new(Function {
            code_initial_address: 0,
            stack_pointer_ceil: 0,
            module_instance: 0,
            type_id,
            code: None,
            ty,
            index,
        })
    }

    /// Publish finished code; called once at link time.
    pub fn set_code(&mut self, code: CodeMemory, stack_pointer_ceil: u32) {
        self.code_initial_address = code.ptr() as u64;
        self.stack_pointer_ceil = stack_pointer_ceil as u64;
        self.code = Some(code);
    }

    pub fn set_module_instance(&mut self, instance: u64) {
        self.module_instance = instance;
    }

    pub fn code_initial_address(&self) -> u64 {
        self.code_initial_address
    }

    pub fn stack_pointer_ceil(&self) -> u64 {
        self.stack_pointer_ceil
    }

    pub fn type_id(&self) -> u64 {
        self.type_id
    }

    pub fn ty(&self) -> &FunctionType {
        &self.ty
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capstan_environ as env;
    use memoffset::offset_of;

    #[test]
    fn function_layout_matches_the_offset_table() {
        assert_eq!(
            offset_of!(Function, code_initial_address),
            env::FUNCTION_CODE_INITIAL_ADDRESS as usize
        );
        assert_eq!(
            offset_of!(Function, stack_pointer_ceil),
            env::FUNCTION_STACK_POINTER_CEIL as usize
        );
        assert_eq!(
            offset_of!(Function, module_instance),
            env::FUNCTION_MODULE_INSTANCE as usize
        );
        assert_eq!(offset_of!(Function, type_id), env::FUNCTION_TYPE_ID as usize);
    }
}
