//! Compilation tunables and CPU feature capabilities.

/// Knobs shared between the runtime and the back end.
#[derive(Debug, Clone, Copy)]
pub struct Tunables {
    /// Slots allocated to a fresh value stack.
    pub initial_value_stack_slots: usize,
    /// Hard cap on value-stack growth, in slots.
    pub max_value_stack_slots: usize,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            initial_value_stack_slots: 512,
            max_value_stack_slots: 1024 * 1024,
        }
    }
}

/// Optional CPU features the lowerings may rely on. A cleared flag makes the
/// emitter select the portable fallback sequence instead.
///
/// The x86-64 baseline assumed unconditionally is SSE4.2 (x86-64-v2); the
/// AArch64 baseline is ARMv8.0 with NEON.
#[derive(Debug, Clone, Copy)]
pub struct CpuFeatures {
    /// x86-64 `LZCNT` (ABM); fallback is a `BSR` sequence.
    pub has_lzcnt: bool,
    /// x86-64 `TZCNT` (BMI1); fallback is a `BSF` sequence.
    pub has_tzcnt: bool,
    /// x86-64 scalar `POPCNT`; fallback is the bit-twiddling sequence.
    pub has_popcnt: bool,
}

impl Default for CpuFeatures {
    fn default() -> Self {
        Self {
            has_lzcnt: true,
            has_tzcnt: true,
            has_popcnt: true,
        }
    }
}

impl CpuFeatures {
    /// A conservative feature set: everything optional disabled.
    pub fn baseline() -> Self {
        Self {
            has_lzcnt: false,
            has_tzcnt: false,
            has_popcnt: false,
        }
    }
}
