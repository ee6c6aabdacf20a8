//! The native-call stub bridging the host ABI into generated code.
//!
//! The stub saves every callee-saved register the generated code may
//! clobber, parks the resulting stack pointer in the call engine's
//! architecture context, seeds the reserved registers (engine pointer,
//! module instance) and jumps to the code. Generated code never returns
//! through the normal ABI: its exit sequences restore the parked stack
//! pointer, unwind the saved registers and return to `nativecall`'s
//! caller directly.

use crate::engine::CallEngine;
use crate::instance::ModuleInstance;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        std::arch::global_asm!(
            ".text",
            ".globl capstan_nativecall",
            ".p2align 4",
            "capstan_nativecall:",
            // Callee-saved registers the generated code treats as free.
            "push rbx",
            "push rbp",
            "push r12",
            "push r13",
            "push r14",
            "push r15",
            // engine.arch_context.host_stack_pointer
            "mov qword ptr [rsi + 136], rsp",
            // Reserved registers: R13 call engine, R12 module instance.
            "mov r13, rsi",
            "mov r12, rdx",
            "jmp rdi",
        );
    } else if #[cfg(target_arch = "aarch64")] {
        std::arch::global_asm!(
            ".text",
            ".globl capstan_nativecall",
            ".p2align 4",
            "capstan_nativecall:",
            "stp x29, x30, [sp, #-16]!",
            "stp x27, x28, [sp, #-16]!",
            "stp x25, x26, [sp, #-16]!",
            "stp x23, x24, [sp, #-16]!",
            "stp x21, x22, [sp, #-16]!",
            "stp x19, x20, [sp, #-16]!",
            "stp d14, d15, [sp, #-16]!",
            "stp d12, d13, [sp, #-16]!",
            "stp d10, d11, [sp, #-16]!",
            "stp d8, d9, [sp, #-16]!",
            // engine.arch_context: parked stack pointer + return address.
            "mov x9, sp",
            "str x9, [x1, #136]",
            "str x30, [x1, #144]",
            // Reserved registers: X0 call engine, X29 module instance.
            "mov x9, x0",
            "mov x0, x1",
            "mov x29, x2",
            "br x9",
        );
    }
}

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
extern "C" {
    fn capstan_nativecall(
        code: *const u8,
        engine: *mut CallEngine,
        instance: *mut ModuleInstance,
    );
}

/// Enter generated code at `code`. Returns when the code leaves with a
/// status in the engine's exit context.
///
/// # Safety
///
/// `code` must be the entry (or recorded continuation) of code compiled
/// against this engine/instance pair, and the engine's stack must have
/// been prepared for the call.
pub unsafe fn nativecall(code: *const u8, engine: *mut CallEngine, instance: *mut ModuleInstance) {
    cfg_if::cfg_if! {
        if #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))] {
            capstan_nativecall(code, engine, instance);
        } else {
            let _ = (code, engine, instance);
            panic!("no native-call stub for this architecture");
        }
    }
}
