//! X64 register definitions: the reserved set and the allocatable pools.

use crate::reg::Reg;
use crate::regalloc::RegisterPool;

pub(crate) const fn rax() -> Reg {
    Reg::int(0)
}
pub(crate) const fn rcx() -> Reg {
    Reg::int(1)
}
pub(crate) const fn rdx() -> Reg {
    Reg::int(2)
}
pub(crate) const fn rbx() -> Reg {
    Reg::int(3)
}
pub(crate) const fn rsi() -> Reg {
    Reg::int(6)
}
pub(crate) const fn rdi() -> Reg {
    Reg::int(7)
}
pub(crate) const fn r8() -> Reg {
    Reg::int(8)
}
pub(crate) const fn r9() -> Reg {
    Reg::int(9)
}
pub(crate) const fn r10() -> Reg {
    Reg::int(10)
}

/// Reserved temporary, never allocatable.
pub(crate) const fn scratch() -> Reg {
    Reg::int(11)
}

/// Holds the module instance address across the function body.
pub(crate) const fn module_instance() -> Reg {
    Reg::int(12)
}

/// Holds the call engine address across the function body.
pub(crate) const fn engine() -> Reg {
    Reg::int(13)
}

/// Holds the address of value-stack slot 0 of the current frame.
pub(crate) const fn stack_base() -> Reg {
    Reg::int(14)
}

/// Holds the linear-memory base address.
pub(crate) const fn memory_base() -> Reg {
    Reg::int(15)
}

pub(crate) const fn xmm(enc: u8) -> Reg {
    Reg::float(enc)
}

/// Reserved vector temporary, never allocatable.
pub(crate) const fn scratch_v() -> Reg {
    Reg::float(15)
}

static INT_POOL: [Reg; 9] = [
    rax(),
    rcx(),
    rdx(),
    rbx(),
    rsi(),
    rdi(),
    r8(),
    r9(),
    r10(),
];

static FLOAT_POOL: [Reg; 15] = [
    xmm(0),
    xmm(1),
    xmm(2),
    xmm(3),
    xmm(4),
    xmm(5),
    xmm(6),
    xmm(7),
    xmm(8),
    xmm(9),
    xmm(10),
    xmm(11),
    xmm(12),
    xmm(13),
    xmm(14),
];

pub(crate) fn pool() -> RegisterPool {
    RegisterPool {
        int: &INT_POOL,
        float: &FLOAT_POOL,
    }
}
