//! Byte offsets of the runtime structures generated code reads directly.
//!
//! The runtime's `#[repr(C)]` definitions must match these numbers exactly;
//! `capstan-runtime` has layout tests that fail loudly on drift. Both ISA
//! emitters take every field offset from here and nowhere else.

/// `CallEngine`: stack context block.
pub const ENGINE_VALUE_STACK_ELEMENT0: u32 = 0;
pub const ENGINE_VALUE_STACK_LEN: u32 = 8;
pub const ENGINE_STACK_POINTER: u32 = 16;
pub const ENGINE_STACK_BASE_POINTER: u32 = 24;

/// `CallEngine`: exit context block.
pub const ENGINE_STATUS_CODE: u32 = 32;
pub const ENGINE_BUILTIN_CALL_INDEX: u32 = 36;

/// `CallEngine`: module context cache, refreshed by the preamble.
pub const ENGINE_MODULE_INSTANCE: u32 = 40;
pub const ENGINE_GLOBALS_ELEMENT0: u32 = 48;
pub const ENGINE_MEMORY_ELEMENT0: u32 = 56;
pub const ENGINE_MEMORY_LEN: u32 = 64;
pub const ENGINE_MEMORY_INSTANCE: u32 = 72;
pub const ENGINE_TABLES_ELEMENT0: u32 = 80;
pub const ENGINE_TABLES_LEN: u32 = 88;
pub const ENGINE_TYPE_IDS_ELEMENT0: u32 = 96;
pub const ENGINE_DATA_INSTANCES_ELEMENT0: u32 = 104;
pub const ENGINE_ELEMENT_INSTANCES_ELEMENT0: u32 = 112;
pub const ENGINE_FUNCTIONS_ELEMENT0: u32 = 120;

/// `CallEngine`: architecture context block.
pub const ENGINE_COMPILER_CALL_RETURN_ADDRESS: u32 = 128;
pub const ENGINE_HOST_STACK_POINTER: u32 = 136;
pub const ENGINE_HOST_RETURN_ADDRESS: u32 = 144;

/// `Function` record header.
pub const FUNCTION_CODE_INITIAL_ADDRESS: u32 = 0;
pub const FUNCTION_STACK_POINTER_CEIL: u32 = 8;
pub const FUNCTION_MODULE_INSTANCE: u32 = 16;
pub const FUNCTION_TYPE_ID: u32 = 24;

/// `ModuleInstance` header.
pub const MODULE_INSTANCE_GLOBALS_ELEMENT0: u32 = 0;
pub const MODULE_INSTANCE_MEMORY: u32 = 8;
pub const MODULE_INSTANCE_TABLES_ELEMENT0: u32 = 16;
pub const MODULE_INSTANCE_TABLES_LEN: u32 = 24;
pub const MODULE_INSTANCE_ENGINE: u32 = 32;
pub const MODULE_INSTANCE_TYPE_IDS_ELEMENT0: u32 = 40;
pub const MODULE_INSTANCE_DATA_INSTANCES_ELEMENT0: u32 = 48;
pub const MODULE_INSTANCE_ELEMENT_INSTANCES_ELEMENT0: u32 = 56;
pub const MODULE_INSTANCE_FUNCTIONS_ELEMENT0: u32 = 64;

/// `MemoryInstance` header: buffer pointer, then its byte length.
pub const MEMORY_INSTANCE_BUFFER: u32 = 0;
pub const MEMORY_INSTANCE_BUFFER_LEN: u32 = 8;

/// `TableInstance` header: references pointer, then its element count.
pub const TABLE_INSTANCE_REFERENCES: u32 = 0;
pub const TABLE_INSTANCE_REFERENCES_LEN: u32 = 8;

/// `GlobalInstance`: the value word, then the upper half for v128 globals.
pub const GLOBAL_INSTANCE_VAL: u32 = 0;
pub const GLOBAL_INSTANCE_VAL_HI: u32 = 8;

/// `DataInstance` / `ElementInstance`: a raw (pointer, length) pair.
pub const PASSIVE_INSTANCE_PTR: u32 = 0;
pub const PASSIVE_INSTANCE_LEN: u32 = 8;

/// Statuses written into `CallEngine.status_code` before returning to the
/// host. Dense small integers; the numeric values are part of the native
/// ABI and must match `capstan_runtime::NativeCallStatus`.
pub const STATUS_RETURNED: u32 = 0;
pub const STATUS_CALL_BUILTIN_FUNCTION: u32 = 1;
pub const STATUS_UNREACHABLE: u32 = 2;
pub const STATUS_MEMORY_OUT_OF_BOUNDS: u32 = 3;
pub const STATUS_INVALID_TABLE_ACCESS: u32 = 4;
pub const STATUS_TYPE_MISMATCH_ON_INDIRECT_CALL: u32 = 5;
pub const STATUS_INTEGER_OVERFLOW: u32 = 6;
pub const STATUS_INTEGER_DIVISION_BY_ZERO: u32 = 7;
pub const STATUS_INVALID_FLOAT_TO_INT_CONVERSION: u32 = 8;
pub const STATUS_UNALIGNED_ATOMIC: u32 = 9;

/// Indices written into `CallEngine.builtin_call_index` alongside
/// `STATUS_CALL_BUILTIN_FUNCTION`.
pub const BUILTIN_MEMORY_GROW: u32 = 0;
pub const BUILTIN_GROW_VALUE_STACK: u32 = 1;
pub const BUILTIN_MEMORY_WAIT32: u32 = 2;
pub const BUILTIN_MEMORY_WAIT64: u32 = 3;
pub const BUILTIN_MEMORY_NOTIFY: u32 = 4;
pub const BUILTIN_TABLE_GROW: u32 = 5;
pub const BUILTIN_TABLE_FILL: u32 = 6;
pub const BUILTIN_REF_FUNC: u32 = 7;
