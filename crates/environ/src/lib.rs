//! Standalone environment for the Capstan single-pass JIT.
//!
//! This crate defines everything the back end and the runtime must agree on
//! without depending on each other: the linearised IR consumed by the code
//! generators, the value-type vocabulary, the byte offsets of every runtime
//! structure that generated code reads directly, and the compilation
//! tunables.

mod module;
mod offsets;
mod ops;
mod tunables;
mod types;

pub use crate::module::*;
pub use crate::offsets::*;
pub use crate::ops::*;
pub use crate::tunables::*;
pub use crate::types::*;
