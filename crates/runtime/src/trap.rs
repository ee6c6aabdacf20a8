//! Status codes crossing the native ABI, and the host-side trap type they
//! turn into.

use capstan_environ as env;
use thiserror::Error;

/// Status a finished (or suspended) native call reports back to the host.
///
/// The discriminants are part of the native ABI: generated code stores
/// them into the call engine's exit context as raw 32-bit integers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum NativeCallStatus {
    Returned = env::STATUS_RETURNED,
    CallBuiltinFunction = env::STATUS_CALL_BUILTIN_FUNCTION,
    Unreachable = env::STATUS_UNREACHABLE,
    MemoryOutOfBounds = env::STATUS_MEMORY_OUT_OF_BOUNDS,
    InvalidTableAccess = env::STATUS_INVALID_TABLE_ACCESS,
    TypeMismatchOnIndirectCall = env::STATUS_TYPE_MISMATCH_ON_INDIRECT_CALL,
    IntegerOverflow = env::STATUS_INTEGER_OVERFLOW,
    IntegerDivisionByZero = env::STATUS_INTEGER_DIVISION_BY_ZERO,
    InvalidFloatToIntConversion = env::STATUS_INVALID_FLOAT_TO_INT_CONVERSION,
    UnalignedAtomic = env::STATUS_UNALIGNED_ATOMIC,
}

impl NativeCallStatus {
    pub fn from_raw(raw: u32) -> Option<NativeCallStatus> {
        use NativeCallStatus::*;
        Some(match raw {
            env::STATUS_RETURNED => Returned,
            env::STATUS_CALL_BUILTIN_FUNCTION => CallBuiltinFunction,
            env::STATUS_UNREACHABLE => Unreachable,
            env::STATUS_MEMORY_OUT_OF_BOUNDS => MemoryOutOfBounds,
            env::STATUS_INVALID_TABLE_ACCESS => InvalidTableAccess,
            env::STATUS_TYPE_MISMATCH_ON_INDIRECT_CALL => TypeMismatchOnIndirectCall,
            env::STATUS_INTEGER_OVERFLOW => IntegerOverflow,
            env::STATUS_INTEGER_DIVISION_BY_ZERO => IntegerDivisionByZero,
            env::STATUS_INVALID_FLOAT_TO_INT_CONVERSION => InvalidFloatToIntConversion,
            env::STATUS_UNALIGNED_ATOMIC => UnalignedAtomic,
            _ => return None,
        })
    }
}

/// Built-in services generated code bounces through the host for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum BuiltinFunction {
    MemoryGrow = env::BUILTIN_MEMORY_GROW,
    GrowValueStack = env::BUILTIN_GROW_VALUE_STACK,
    MemoryWait32 = env::BUILTIN_MEMORY_WAIT32,
    MemoryWait64 = env::BUILTIN_MEMORY_WAIT64,
    MemoryNotify = env::BUILTIN_MEMORY_NOTIFY,
    TableGrow = env::BUILTIN_TABLE_GROW,
    TableFill = env::BUILTIN_TABLE_FILL,
    RefFunc = env::BUILTIN_REF_FUNC,
}

impl BuiltinFunction {
    pub fn from_raw(raw: u32) -> Option<BuiltinFunction> {
        use BuiltinFunction::*;
        Some(match raw {
            env::BUILTIN_MEMORY_GROW => MemoryGrow,
            env::BUILTIN_GROW_VALUE_STACK => GrowValueStack,
            env::BUILTIN_MEMORY_WAIT32 => MemoryWait32,
            env::BUILTIN_MEMORY_WAIT64 => MemoryWait64,
            env::BUILTIN_MEMORY_NOTIFY => MemoryNotify,
            env::BUILTIN_TABLE_GROW => TableGrow,
            env::BUILTIN_TABLE_FILL => TableFill,
            env::BUILTIN_REF_FUNC => RefFunc,
        _ => return None,
        })
    }
}

/// A wasm trap surfaced to the embedder.
#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum Trap {
    #[error("wasm trap: unreachable executed")]
    Unreachable,
    #[error("wasm trap: out of bounds memory access")]
    MemoryOutOfBounds,
    #[error("wasm trap: invalid table access")]
    InvalidTableAccess,
    #[error("wasm trap: indirect call type mismatch")]
    TypeMismatchOnIndirectCall,
    #[error("wasm trap: integer overflow")]
    IntegerOverflow,
    #[error("wasm trap: integer division by zero")]
    IntegerDivisionByZero,
    #[error("wasm trap: invalid conversion to integer")]
    InvalidFloatToIntConversion,
    #[error("wasm trap: unaligned atomic access")]
    UnalignedAtomic,
    #[error("wasm trap: value stack exhausted")]
    StackOverflow,
}

impl Trap {
    /// The trap corresponding to a status code, if it names one.
    pub fn from_status(status: NativeCallStatus) -> Option<Trap> {
        use NativeCallStatus::*;
        Some(match status {
            Unreachable => Trap::Unreachable,
            MemoryOutOfBounds => Trap::MemoryOutOfBounds,
            InvalidTableAccess => Trap::InvalidTableAccess,
            TypeMismatchOnIndirectCall => Trap::TypeMismatchOnIndirectCall,
            IntegerOverflow => Trap::IntegerOverflow,
            IntegerDivisionByZero => Trap::IntegerDivisionByZero,
            InvalidFloatToIntConversion => Trap::InvalidFloatToIntConversion,
            UnalignedAtomic => Trap::UnalignedAtomic,
            Returned | CallBuiltinFunction => return None,
        })
    }
}
