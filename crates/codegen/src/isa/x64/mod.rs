use anyhow::Result;
use capstan_environ::{CpuFeatures, FunctionIr, ModuleEnv};
use target_lexicon::Triple;

use crate::codegen::{CodeGen, CompiledFunction};
use crate::isa::TargetIsa;

mod asm;
mod masm;
pub(crate) mod regs;

pub(crate) fn isa_from(triple: Triple, features: CpuFeatures) -> X64 {
    X64 { triple, features }
}

pub(crate) struct X64 {
    triple: Triple,
    features: CpuFeatures,
}

impl TargetIsa for X64 {
    fn name(&self) -> &'static str {
        "x64"
    }

    fn triple(&self) -> &Triple {
        &self.triple
    }

    fn compile_function(&self, env: &ModuleEnv, ir: &FunctionIr) -> Result<CompiledFunction> {
        let masm = masm::MacroAssembler::new(self.features);
        CodeGen::new(masm, env, ir).compile()
    }

    fn function_alignment(&self) -> u32 {
        16
    }
}
