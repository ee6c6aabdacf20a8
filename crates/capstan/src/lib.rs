//! Capstan: a single-pass WebAssembly JIT engine.
//!
//! The pieces: `capstan-codegen` lowers one IR function at a time into
//! native code, `capstan-runtime` owns the call engine and module state,
//! and this crate glues them together: compiling a module, linking
//! direct calls, and driving execution including the bounce through the
//! host for built-in services (stack growth, `memory.grow`, waits).

use anyhow::{anyhow, bail, Context, Result};
use capstan_environ::{
    FunctionIr, FunctionType, ModuleEnv, Tunables, ValType, WASM_PAGE_SIZE,
};
use capstan_runtime::{
    nativecall, BuiltinFunction, CallEngine, CodeMemory, ModuleInstance, ModuleInstanceBuilder,
    NativeCallStatus, Trap,
};
use log::{debug, trace};
use target_lexicon::Triple;

pub use capstan_codegen::{lookup, TargetIsa};
pub use capstan_environ as environ;
pub use capstan_runtime as runtime;

/// A wasm value crossing the host boundary.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Val {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    V128(u128),
    /// A raw function reference (a function record address, or 0 for
    /// null).
    FuncRef(u64),
    ExternRef(u64),
}

impl Val {
    fn ty(&self) -> ValType {
        match self {
            Val::I32(_) => ValType::I32,
            Val::I64(_) => ValType::I64,
            Val::F32(_) => ValType::F32,
            Val::F64(_) => ValType::F64,
            Val::V128(_) => ValType::V128,
            Val::FuncRef(_) => ValType::FuncRef,
            Val::ExternRef(_) => ValType::ExternRef,
        }
    }

    fn push_slots(&self, out: &mut Vec<u64>) {
        match self {
            Val::I32(v) => out.push(*v as u32 as u64),
            Val::I64(v) => out.push(*v as u64),
            Val::F32(v) => out.push(v.to_bits() as u64),
            Val::F64(v) => out.push(v.to_bits()),
            Val::V128(v) => {
                out.push(*v as u64);
                out.push((*v >> 64) as u64);
            }
            Val::FuncRef(v) | Val::ExternRef(v) => out.push(*v),
        }
    }

    fn read(engine: &CallEngine, slot: &mut usize, ty: ValType) -> Val {
        let lo = engine.slot(*slot);
        *slot += 1;
        match ty {
            ValType::I32 => Val::I32(lo as u32 as i32),
            ValType::I64 => Val::I64(lo as i64),
            ValType::F32 => Val::F32(f32::from_bits(lo as u32)),
            ValType::F64 => Val::F64(f64::from_bits(lo)),
            ValType::V128 => {
                let hi = engine.slot(*slot);
                *slot += 1;
                Val::V128(lo as u128 | (hi as u128) << 64)
            }
            ValType::FuncRef => Val::FuncRef(lo),
            ValType::ExternRef => Val::ExternRef(lo),
        }
    }
}

/// A module before instantiation: its environment, the IR of every
/// function body, and the instantiation payloads.
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub env: ModuleEnv,
    /// One body per `env.functions` entry.
    pub bodies: Vec<FunctionIr>,
    /// Initial values of every global (`lo`, `hi`), parallel to
    /// `env.globals`.
    pub global_inits: Vec<(u64, u64)>,
    /// Limits per table, parallel to `env.tables`.
    pub table_limits: Vec<(u32, Option<u32>)>,
    /// Passive data segments.
    pub data_segments: Vec<Vec<u8>>,
    /// Passive element segments, as function indices.
    pub element_segments: Vec<Vec<u32>>,
}

/// The compilation engine: the target ISA plus the tunables.
pub struct Engine {
    isa: Box<dyn TargetIsa>,
    tunables: Tunables,
}

impl Engine {
    /// An engine for the host machine.
    pub fn new() -> Result<Engine> {
        Engine::for_triple(Triple::host())
    }

    pub fn for_triple(triple: Triple) -> Result<Engine> {
        Ok(Engine {
            isa: lookup(triple)?,
            tunables: Tunables::default(),
        })
    }

    pub fn isa(&self) -> &dyn TargetIsa {
        &*self.isa
    }

    /// Compile every function, link direct calls, and wire up a runnable
    /// instance.
    pub fn instantiate(&self, module: &Module) -> Result<Instance> {
        if module.bodies.len() != module.env.functions.len() {
            bail!(
                "module declares {} functions but provides {} bodies",
                module.env.functions.len(),
                module.bodies.len()
            );
        }
        if module.global_inits.len() != module.env.globals.len() {
            bail!("global initialisers do not match global declarations");
        }
        if module.table_limits.len() != module.env.tables.len() {
            bail!("table limits do not match table declarations");
        }

        // Type ids: dense per-module identities compared by indirect
        // calls. Zero stays reserved for the null entry.
        let type_ids: Vec<u64> = (0..module.env.types.len() as u64).map(|i| i + 1).collect();

        let mut builder = ModuleInstanceBuilder::new().type_ids(type_ids.clone());
        for (ty, init) in module.env.globals.iter().zip(&module.global_inits) {
            builder = builder.global(*ty, true, init.0, init.1);
        }
        if let Some(decl) = &module.env.memory {
            builder = builder.memory(decl);
        }
        for (ty, limits) in module.env.tables.iter().zip(&module.table_limits) {
            builder = builder.table(*ty, limits.0, limits.1);
        }
        for data in &module.data_segments {
            builder = builder.data_segment(data.clone());
        }
        for elem in &module.element_segments {
            builder = builder.element_segment(elem.clone());
        }
        for type_index in &module.env.functions {
            let ty = module
                .env
                .types
                .get(*type_index as usize)
                .ok_or_else(|| anyhow!("function type index {type_index} out of range"))?;
            builder = builder.function(ty.clone(), type_ids[*type_index as usize]);
        }
        let mut instance = builder.build();

        for (index, body) in module.bodies.iter().enumerate() {
            let compiled = self
                .isa
                .compile_function(&module.env, body)
                .with_context(|| format!("compiling function {index}"))?;
            let mut code = compiled.code;
            for reloc in &compiled.relocs {
                let capstan_codegen::RelocKind::FunctionAddress { function_index } = reloc.kind;
                let addr = instance
                    .function_record_addr(function_index as usize)
                    .ok_or_else(|| anyhow!("relocation against unknown function"))?;
                let at = reloc.offset as usize;
                code[at..at + 8].copy_from_slice(&addr.to_le_bytes());
            }
            let mapped = CodeMemory::allocate(&code)?;
            debug!(
                "function {index}: {} bytes of code, ceiling {} slots",
                mapped.len(),
                compiled.stack_pointer_ceil
            );
            instance
                .function_mut(index)
                .unwrap()
                .set_code(mapped, compiled.stack_pointer_ceil);
        }

        Ok(Instance {
            module: instance,
            engine: CallEngine::new(&self.tunables),
            env: module.env.clone(),
        })
    }
}

/// A runnable instance: the module state plus a call engine.
pub struct Instance {
    module: Box<ModuleInstance>,
    engine: Box<CallEngine>,
    env: ModuleEnv,
}

impl Instance {
    pub fn module(&self) -> &ModuleInstance {
        &self.module
    }

    pub fn module_mut(&mut self) -> &mut ModuleInstance {
        &mut self.module
    }

    /// Call an exported-by-index function to completion, servicing the
    /// builtin-function exits along the way.
    pub fn invoke(&mut self, function_index: u32, params: &[Val]) -> Result<Vec<Val>> {
        let ty = self
            .env
            .function_type(function_index)
            .ok_or_else(|| anyhow!("function index {function_index} out of range"))?
            .clone();
        if params.len() != ty.params.len() {
            bail!(
                "expected {} parameters, got {}",
                ty.params.len(),
                params.len()
            );
        }
        for (param, want) in params.iter().zip(&ty.params) {
            if param.ty() != *want {
                bail!("parameter type mismatch: {param:?} is not a {want:?}");
            }
        }

        let mut slots = Vec::with_capacity(ty.param_slots());
        for param in params {
            param.push_slots(&mut slots);
        }

        let record = self
            .module
            .function(function_index as usize)
            .ok_or_else(|| anyhow!("function {function_index} missing"))?;
        let mut code = record.code_initial_address();
        if code == 0 {
            bail!("function {function_index} has no compiled code");
        }
        let record_ptr = record as *const _;
        self.engine.prepare_entry_call(record_ptr, &ty, &slots);

        loop {
            trace!("entering native code at {code:#x}");
            unsafe {
                nativecall(
                    code as *const u8,
                    &mut *self.engine as *mut CallEngine,
                    self.module.self_ptr(),
                );
            }
            let status = self
                .engine
                .status()
                .ok_or_else(|| anyhow!("native code reported an unknown status"))?;
            match status {
                NativeCallStatus::Returned => break,
                NativeCallStatus::CallBuiltinFunction => {
                    self.service_builtin()?;
                    code = self.engine.compiler_call_return_address();
                }
                trap => {
                    return Err(Trap::from_status(trap)
                        .expect("non-trap status handled above")
                        .into());
                }
            }
        }

        let mut results = Vec::with_capacity(ty.results.len());
        let mut slot = 0usize;
        for ty in &ty.results {
            results.push(Val::read(&self.engine, &mut slot, *ty));
        }
        Ok(results)
    }

    /// Handle one `CallBuiltinFunction` exit against the instance state.
    fn service_builtin(&mut self) -> Result<()> {
        let builtin = BuiltinFunction::from_raw(self.engine.builtin_index())
            .ok_or_else(|| anyhow!("native code requested an unknown builtin"))?;
        let sp = self.engine.stack_pointer();
        trace!("servicing builtin {builtin:?} at sp {sp}");
        match builtin {
            BuiltinFunction::GrowValueStack => {
                self.engine.grow_value_stack()?;
            }
            BuiltinFunction::MemoryGrow => {
                let delta = self.engine.slot(sp - 1) as u32;
                let memory = self
                    .module
                    .memory_mut()
                    .ok_or_else(|| anyhow!("memory.grow without a memory"))?;
                let old = memory.grow(delta);
                self.engine.set_slot(sp - 1, old as u32 as u64);
            }
            BuiltinFunction::MemoryWait32 | BuiltinFunction::MemoryWait64 => {
                let width = if builtin == BuiltinFunction::MemoryWait32 { 4 } else { 8 };
                let addr = self.engine.slot(sp - 3);
                let expected = self.engine.slot(sp - 2);
                let _timeout = self.engine.slot(sp - 1) as i64;
                let memory = self
                    .module
                    .memory()
                    .ok_or_else(|| anyhow!("memory.atomic.wait without a memory"))?;
                if addr % width != 0 {
                    return Err(Trap::UnalignedAtomic.into());
                }
                if addr + width > memory.len_bytes() as u64 {
                    return Err(Trap::MemoryOutOfBounds.into());
                }
                let bytes = memory.bytes();
                let current = if width == 4 {
                    u32::from_le_bytes(bytes[addr as usize..addr as usize + 4].try_into()?)
                        as u64
                } else {
                    u64::from_le_bytes(bytes[addr as usize..addr as usize + 8].try_into()?)
                };
                // A single-threaded embedding can never be woken; report
                // "not-equal" or "timed-out" immediately.
                let reason = if current != expected { 1u64 } else { 2 };
                self.engine.set_slot(sp - 3, reason);
            }
            BuiltinFunction::MemoryNotify => {
                let addr = self.engine.slot(sp - 2);
                let memory = self
                    .module
                    .memory()
                    .ok_or_else(|| anyhow!("memory.atomic.notify without a memory"))?;
                if addr % 4 != 0 {
                    return Err(Trap::UnalignedAtomic.into());
                }
                if addr + 4 > memory.len_bytes() as u64 {
                    return Err(Trap::MemoryOutOfBounds.into());
                }
                // Nobody can be waiting in a single-threaded embedding.
                self.engine.set_slot(sp - 2, 0);
            }
            BuiltinFunction::TableGrow => {
                let table_index = self.engine.slot(sp - 1) as usize;
                let delta = self.engine.slot(sp - 2) as u32;
                let init = self.engine.slot(sp - 3);
                let table = self
                    .module
                    .table_mut(table_index)
                    .ok_or_else(|| anyhow!("table.grow against a missing table"))?;
                let old = table.grow(delta, init);
                self.engine.set_slot(sp - 3, old as u32 as u64);
            }
            BuiltinFunction::TableFill => {
                let table_index = self.engine.slot(sp - 1) as usize;
                let len = self.engine.slot(sp - 2) as usize;
                let value = self.engine.slot(sp - 3);
                let start = self.engine.slot(sp - 4) as usize;
                let table = self
                    .module
                    .table_mut(table_index)
                    .ok_or_else(|| anyhow!("table.fill against a missing table"))?;
                if start
                    .checked_add(len)
                    .map(|end| end > table.len())
                    .unwrap_or(true)
                {
                    return Err(Trap::InvalidTableAccess.into());
                }
                table.fill(start, len, value);
            }
            BuiltinFunction::RefFunc => {
                let function_index = self.engine.slot(sp - 1) as usize;
                let addr = self
                    .module
                    .function_record_addr(function_index)
                    .ok_or_else(|| anyhow!("ref.func against a missing function"))?;
                self.engine.set_slot(sp - 1, addr);
            }
        }
        Ok(())
    }

    /// Write bytes into linear memory; instantiation-time convenience for
    /// active data segments and tests.
    pub fn write_memory(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let memory = self
            .module
            .memory_mut()
            .ok_or_else(|| anyhow!("no memory to write"))?;
        let dst = memory
            .bytes_mut()
            .get_mut(offset..offset + bytes.len())
            .ok_or_else(|| anyhow!("memory write out of range"))?;
        dst.copy_from_slice(bytes);
        Ok(())
    }

    pub fn read_memory(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let memory = self.module.memory().ok_or_else(|| anyhow!("no memory"))?;
        Ok(memory
            .bytes()
            .get(offset..offset + len)
            .ok_or_else(|| anyhow!("memory read out of range"))?
            .to_vec())
    }

    pub fn memory_pages(&self) -> Option<u32> {
        self.module.memory().map(|m| m.size_pages())
    }

    /// Seed a table entry with a function reference; instantiation-time
    /// convenience for active element segments.
    pub fn set_table_function(&mut self, table: usize, index: usize,
        function_index: u32) -> Result<()> {
        let addr = self
            .module
            .function_record_addr(function_index as usize)
            .ok_or_else(|| anyhow!("function index {function_index} out of range"))?;
        let table = self
            .module
            .table_mut(table)
            .ok_or_else(|| anyhow!("table out of range"))?;
        if index >= table.len() {
            bail!("table entry out of range");
        }
        table.set(index, addr);
        Ok(())
    }
}

/// One wasm page, re-exported for tests and embedders.
pub const PAGE: usize = WASM_PAGE_SIZE as usize;

/// Convenience constructor for the common single-type module shape used
/// in tests and small embeddings.
pub fn single_function_module(ty: FunctionType, body: FunctionIr) -> Module {
    Module {
        env: ModuleEnv {
            types: vec![ty],
            functions: vec![0],
            ..Default::default()
        },
        bodies: vec![body],
        ..Default::default()
    }
}
