use anyhow::{anyhow, Result};
use capstan_environ::{CpuFeatures, FunctionIr, ModuleEnv};
use core::fmt::Formatter;
use std::{
    error,
    fmt::{self, Debug, Display},
};
use target_lexicon::{Architecture, Triple};

use crate::codegen::CompiledFunction;

#[cfg(feature = "x64")]
pub(crate) mod x64;

#[cfg(feature = "arm64")]
pub(crate) mod aarch64;

macro_rules! isa {
    ($name: ident, $cfg_terms: tt, $triple: ident, $features: ident) => {{
        #[cfg $cfg_terms]
        {
            Ok(Box::new($name::isa_from($triple, $features)))
        }
        #[cfg(not $cfg_terms)]
        {
            Err(anyhow!(LookupError::SupportDisabled))
        }
    }};
}

/// Look up the back end for the given target triple, with default CPU
/// features.
pub fn lookup(triple: Triple) -> Result<Box<dyn TargetIsa>> {
    lookup_with_features(triple, CpuFeatures::default())
}

/// Look up the back end for the given target triple and feature set.
pub fn lookup_with_features(triple: Triple, features: CpuFeatures) -> Result<Box<dyn TargetIsa>> {
    match triple.architecture {
        Architecture::X86_64 => {
            isa!(x64, (feature = "x64"), triple, features)
        }
        Architecture::Aarch64 { .. } => {
            isa!(aarch64, (feature = "arm64"), triple, features)
        }

        _ => Err(anyhow!(LookupError::Unsupported)),
    }
}

impl error::Error for LookupError {}
impl Display for LookupError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LookupError::Unsupported => write!(f, "This target is not supported yet"),
            LookupError::SupportDisabled => write!(f, "Support for this target was disabled"),
        }
    }
}

#[derive(Debug)]
pub(crate) enum LookupError {
    Unsupported,
    #[allow(dead_code)]
    SupportDisabled,
}

/// A trait representing commonalities between the supported instruction set
/// architectures.
pub trait TargetIsa: Send + Sync {
    /// Get the name of the ISA.
    fn name(&self) -> &'static str;

    /// Get the target triple of the ISA.
    fn triple(&self) -> &Triple;

    /// Lower one IR function to native code.
    fn compile_function(&self, env: &ModuleEnv, ir: &FunctionIr) -> Result<CompiledFunction>;

    /// Required alignment of the finished code buffer.
    fn function_alignment(&self) -> u32;

    /// Get the endianess of the underlying target triple.
    fn endianness(&self) -> target_lexicon::Endianness {
        self.triple().endianness().unwrap()
    }
}

impl Debug for &dyn TargetIsa {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Target ISA {{ triple: {:?} }}", self.triple())
    }
}
