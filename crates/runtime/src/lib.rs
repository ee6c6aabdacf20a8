//! Runtime support for the Capstan JIT: the call engine and its value
//! stack, module instances and their resources, executable code memory,
//! and the native-call trampoline that bridges the host ABI into
//! generated code.
//!
//! Generated code reads several of these structures at fixed byte offsets;
//! every `#[repr(C)]` header here is pinned against `capstan-environ`'s
//! offset table by the layout tests at the bottom of each module.

mod code_memory;
mod engine;
mod function;
mod global;
mod instance;
mod memory;
mod table;
mod trampoline;
mod trap;

pub use crate::code_memory::CodeMemory;
pub use crate::engine::CallEngine;
pub use crate::function::Function;
pub use crate::global::GlobalInstance;
pub use crate::instance::{ModuleInstance, ModuleInstanceBuilder, PassiveSlice};
pub use crate::memory::MemoryInstance;
pub use crate::table::TableInstance;
pub use crate::trampoline::nativecall;
pub use crate::trap::{BuiltinFunction, NativeCallStatus, Trap};
