//! AArch64 register definitions: the reserved set and the allocatable
//! pools.

use crate::reg::Reg;
use crate::regalloc::RegisterPool;

pub(crate) const fn xreg(enc: u8) -> Reg {
    Reg::int(enc)
}

pub(crate) const fn vreg(enc: u8) -> Reg {
    Reg::float(enc)
}

/// Holds the call engine address across the function body.
pub(crate) const fn engine() -> Reg {
    xreg(0)
}

/// Holds the address of value-stack slot 0 of the current frame.
pub(crate) const fn stack_base() -> Reg {
    xreg(1)
}

/// Holds the linear-memory base address.
pub(crate) const fn memory_base() -> Reg {
    xreg(2)
}

/// Holds the module instance address across the function body.
pub(crate) const fn module_instance() -> Reg {
    xreg(29)
}

/// Reserved temporaries, never allocatable.
pub(crate) const fn scratch() -> Reg {
    xreg(27)
}

pub(crate) const fn scratch2() -> Reg {
    xreg(28)
}

/// Reserved vector temporary.
pub(crate) const fn scratch_v() -> Reg {
    vreg(31)
}

// x18 is the platform register and x30 the link register; both stay out of
// the pool.
static INT_POOL: [Reg; 23] = [
    xreg(3),
    xreg(4),
    xreg(5),
    xreg(6),
    xreg(7),
    xreg(8),
    xreg(9),
    xreg(10),
    xreg(11),
    xreg(12),
    xreg(13),
    xreg(14),
    xreg(15),
    xreg(16),
    xreg(17),
    xreg(19),
    xreg(20),
    xreg(21),
    xreg(22),
    xreg(23),
    xreg(24),
    xreg(25),
    xreg(26),
];

static FLOAT_POOL: [Reg; 31] = [
    vreg(0),
    vreg(1),
    vreg(2),
    vreg(3),
    vreg(4),
    vreg(5),
    vreg(6),
    vreg(7),
    vreg(8),
    vreg(9),
    vreg(10),
    vreg(11),
    vreg(12),
    vreg(13),
    vreg(14),
    vreg(15),
    vreg(16),
    vreg(17),
    vreg(18),
    vreg(19),
    vreg(20),
    vreg(21),
    vreg(22),
    vreg(23),
    vreg(24),
    vreg(25),
    vreg(26),
    vreg(27),
    vreg(28),
    vreg(29),
    vreg(30),
];

pub(crate) fn pool() -> RegisterPool {
    RegisterPool {
        int: &INT_POOL,
        float: &FLOAT_POOL,
    }
}
