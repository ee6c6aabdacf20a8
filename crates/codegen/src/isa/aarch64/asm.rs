//! Assembler library implementation for AArch64.
//!
//! Every emitter appends one 32-bit instruction word; the macro assembler
//! layer picks the sequences. Register operands are hardware encodings;
//! encoding 31 means XZR or SP depending on the instruction class.

use crate::buffer::{CodeBuffer, CodeLabel, FixupKind};
use crate::reg::Reg;

pub(crate) const ZR: u8 = 31;

/// Condition codes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Cond {
    Eq = 0x0,
    Ne = 0x1,
    Hs = 0x2,
    Lo = 0x3,
    Mi = 0x4,
    Pl = 0x5,
    Vs = 0x6,
    Vc = 0x7,
    Hi = 0x8,
    Ls = 0x9,
    Ge = 0xa,
    Lt = 0xb,
    Gt = 0xc,
    Le = 0xd,
    Al = 0xe,
}

impl Cond {
    pub fn negate(self) -> Cond {
        match self {
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Hs => Cond::Lo,
            Cond::Lo => Cond::Hs,
            Cond::Mi => Cond::Pl,
            Cond::Pl => Cond::Mi,
            Cond::Vs => Cond::Vc,
            Cond::Vc => Cond::Vs,
            Cond::Hi => Cond::Ls,
            Cond::Ls => Cond::Hi,
            Cond::Ge => Cond::Lt,
            Cond::Lt => Cond::Ge,
            Cond::Gt => Cond::Le,
            Cond::Le => Cond::Gt,
            Cond::Al => Cond::Al,
        }
    }
}

/// NEON lane arrangement (`size` field of the three-same encodings).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum VSize {
    B = 0,
    H = 1,
    S = 2,
    D = 3,
}

pub(crate) struct Assembler {
    pub buf: CodeBuffer,
}

fn enc(reg: Reg) -> u32 {
    reg.hw_enc() as u32
}

impl Assembler {
    pub fn new() -> Self {
        Self {
            buf: CodeBuffer::new(),
        }
    }

    pub fn word(&mut self, w: u32) {
        self.buf.put4(w);
    }

    // ---- moves --------------------------------------------------------

    /// Load an arbitrary 64-bit immediate with movz/movk.
    pub fn mov_imm(&mut self, dst: Reg, imm: u64) {
        let d = enc(dst);
        let mut wrote = false;
        for hw in 0..4u32 {
            let chunk = (imm >> (hw * 16)) & 0xffff;
            if chunk != 0 || (hw == 3 && !wrote) {
                let op = if wrote { 0xf280_0000 } else { 0xd280_0000 };
                self.word(op | hw << 21 | (chunk as u32) << 5 | d);
                wrote = true;
            }
        }
        if !wrote {
            self.word(0xd280_0000 | d);
        }
    }

    /// Register move (orr with zero).
    pub fn mov_rr(&mut self, src: Reg, dst: Reg, wide: bool) {
        let base = if wide { 0xaa00_03e0 } else { 0x2a00_03e0 };
        self.word(base | enc(src) << 16 | enc(dst));
    }

    // ---- loads and stores --------------------------------------------

    fn ldst_unsigned(&mut self, base_op: u32, size_bytes: u32, rt: u32, rn: u32, offset: u32) {
        debug_assert!(offset % size_bytes == 0);
        let imm12 = offset / size_bytes;
        debug_assert!(imm12 < 4096);
        self.word(base_op | imm12 << 10 | rn << 5 | rt);
    }

    /// Zero-extending load of `width` bytes with an unsigned scaled offset.
    pub fn load_zx(&mut self, dst: Reg, base: Reg, offset: u32, width: u8) {
        let (op, sz) = match width {
            1 => (0x3940_0000, 1),
            2 => (0x7940_0000, 2),
            4 => (0xb940_0000, 4),
            _ => (0xf940_0000, 8),
        };
        self.ldst_unsigned(op, sz, enc(dst), enc(base), offset);
    }

    /// Sign-extending load into a register of `to_bits` bits.
    pub fn load_sx(&mut self, dst: Reg, base: Reg, offset: u32, width: u8, to_bits: u8) {
        let wide = to_bits == 64;
        let (op, sz) = match width {
            1 => (if wide { 0x3980_0000 } else { 0x39c0_0000 }, 1),
            2 => (if wide { 0x7980_0000 } else { 0x79c0_0000 }, 2),
            4 => (0xb980_0000, 4),
            _ => (0xf940_0000, 8),
        };
        self.ldst_unsigned(op, sz, enc(dst), enc(base), offset);
    }

    pub fn store(&mut self, src: Reg, base: Reg, offset: u32, width: u8) {
        let (op, sz) = match width {
            1 => (0x3900_0000, 1),
            2 => (0x7900_0000, 2),
            4 => (0xb900_0000, 4),
            _ => (0xf900_0000, 8),
        };
        self.ldst_unsigned(op, sz, enc(src), enc(base), offset);
    }

    /// `ldr dst, [base, index, lsl #shift]` (64-bit, shift 0 or 3).
    pub fn load_indexed(&mut self, dst: Reg, base: Reg, index: Reg, shift: u8, width: u8) {
        let (op, s) = match (width, shift) {
            (1, _) => (0x3860_6800, 0),
            (8, 3) => (0xf860_6800, 1 << 12),
            (8, 0) => (0xf860_6800, 0),
            _ => unreachable!("unsupported indexed load shape"),
        };
        self.word(op | enc(index) << 16 | s | enc(base) << 5 | enc(dst));
    }

    pub fn store_indexed(&mut self, src: Reg, base: Reg, index: Reg, shift: u8, width: u8) {
        let (op, s) = match (width, shift) {
            (1, _) => (0x3820_6800, 0),
            (8, 3) => (0xf820_6800, 1 << 12),
            (8, 0) => (0xf820_6800, 0),
            _ => unreachable!("unsupported indexed store shape"),
        };
        self.word(op | enc(index) << 16 | s | enc(base) << 5 | enc(src));
    }

    /// Scalar FP load/store with unsigned scaled offset.
    pub fn fload(&mut self, dst: Reg, base: Reg, offset: u32, width: u8) {
        let (op, sz) = match width {
            4 => (0xbd40_0000, 4),
            8 => (0xfd40_0000, 8),
            _ => (0x3dc0_0000, 16),
        };
        self.ldst_unsigned(op, sz, enc(dst), enc(base), offset);
    }

    pub fn fstore(&mut self, src: Reg, base: Reg, offset: u32, width: u8) {
        let (op, sz) = match width {
            4 => (0xbd00_0000, 4),
            8 => (0xfd00_0000, 8),
            _ => (0x3d80_0000, 16),
        };
        self.ldst_unsigned(op, sz, enc(src), enc(base), offset);
    }

    /// Load a literal-pool entry into a vector register (`ldr q, label`).
    pub fn ldr_q_literal(&mut self, dst: Reg, label: CodeLabel) {
        let at = self.buf.len();
        self.word(0x9c00_0000 | enc(dst));
        self.buf.use_label(at, FixupKind::Ldr19, label);
    }

    // ---- integer ALU --------------------------------------------------

    /// Shifted-register ALU; `base` already carries sf and opcode.
    fn rrr(&mut self, base: u32, rm: Reg, rn: Reg, rd: u32) {
        self.word(base | enc(rm) << 16 | enc(rn) << 5 | rd);
    }

    pub fn add_rr(&mut self, src: Reg, dst: Reg, wide: bool) {
        let base = if wide { 0x8b00_0000 } else { 0x0b00_0000 };
        self.rrr(base, src, dst, enc(dst));
    }

    pub fn sub_rr(&mut self, src: Reg, dst: Reg, wide: bool) {
        let base = if wide { 0xcb00_0000 } else { 0x4b00_0000 };
        self.rrr(base, src, dst, enc(dst));
    }

    pub fn and_rr(&mut self, src: Reg, dst: Reg, wide: bool) {
        let base = if wide { 0x8a00_0000 } else { 0x0a00_0000 };
        self.rrr(base, src, dst, enc(dst));
    }

    pub fn orr_rr(&mut self, src: Reg, dst: Reg, wide: bool) {
        let base = if wide { 0xaa00_0000 } else { 0x2a00_0000 };
        self.rrr(base, src, dst, enc(dst));
    }

    pub fn eor_rr(&mut self, src: Reg, dst: Reg, wide: bool) {
        let base = if wide { 0xca00_0000 } else { 0x4a00_0000 };
        self.rrr(base, src, dst, enc(dst));
    }

    pub fn mul_rr(&mut self, src: Reg, dst: Reg, wide: bool) {
        let base = if wide { 0x9b00_7c00 } else { 0x1b00_7c00 };
        self.rrr(base, src, dst, enc(dst));
    }

    /// `msub rd, rn, rm, ra`: rd = ra - rn*rm.
    pub fn msub(&mut self, rd: Reg, rn: Reg, rm: Reg, ra: Reg, wide: bool) {
        let base = if wide { 0x9b00_8000 } else { 0x1b00_8000 };
        self.word(base | enc(rm) << 16 | enc(ra) << 10 | enc(rn) << 5 | enc(rd));
    }

    pub fn sdiv(&mut self, rd: Reg, rn: Reg, rm: Reg, wide: bool) {
        let base = if wide { 0x9ac0_0c00 } else { 0x1ac0_0c00 };
        self.word(base | enc(rm) << 16 | enc(rn) << 5 | enc(rd));
    }

    pub fn udiv(&mut self, rd: Reg, rn: Reg, rm: Reg, wide: bool) {
        let base = if wide { 0x9ac0_0800 } else { 0x1ac0_0800 };
        self.word(base | enc(rm) << 16 | enc(rn) << 5 | enc(rd));
    }

    /// Add/subtract a 12-bit immediate; the caller splits larger values.
    pub fn add_imm(&mut self, imm: u32, dst: Reg, wide: bool) {
        debug_assert!(imm < 4096);
        let base = if wide { 0x9100_0000 } else { 0x1100_0000 };
        self.word(base | imm << 10 | enc(dst) << 5 | enc(dst));
    }

    pub fn sub_imm(&mut self, imm: u32, dst: Reg, wide: bool) {
        debug_assert!(imm < 4096);
        let base = if wide { 0xd100_0000 } else { 0x5100_0000 };
        self.word(base | imm << 10 | enc(dst) << 5 | enc(dst));
    }

    /// Compare: `subs zr, lhs, rhs`.
    pub fn cmp_rr(&mut self, lhs: Reg, rhs: Reg, wide: bool) {
        let base = if wide { 0xeb00_0000 } else { 0x6b00_0000 };
        self.word(base | enc(rhs) << 16 | enc(lhs) << 5 | ZR as u32);
    }

    pub fn cmp_imm(&mut self, lhs: Reg, imm: u32, wide: bool) {
        debug_assert!(imm < 4096);
        let base = if wide { 0xf100_0000 } else { 0x7100_0000 };
        self.word(base | imm << 10 | enc(lhs) << 5 | ZR as u32);
    }

    /// Test: `ands zr, a, b`.
    pub fn tst_rr(&mut self, a: Reg, b: Reg, wide: bool) {
        let base = if wide { 0xea00_0000 } else { 0x6a00_0000 };
        self.word(base | enc(b) << 16 | enc(a) << 5 | ZR as u32);
    }

    /// Variable shifts.
    pub fn lslv(&mut self, amount: Reg, dst: Reg, wide: bool) {
        let base = if wide { 0x9ac0_2000 } else { 0x1ac0_2000 };
        self.word(base | enc(amount) << 16 | enc(dst) << 5 | enc(dst));
    }

    pub fn lsrv(&mut self, amount: Reg, dst: Reg, wide: bool) {
        let base = if wide { 0x9ac0_2400 } else { 0x1ac0_2400 };
        self.word(base | enc(amount) << 16 | enc(dst) << 5 | enc(dst));
    }

    pub fn asrv(&mut self, amount: Reg, dst: Reg, wide: bool) {
        let base = if wide { 0x9ac0_2800 } else { 0x1ac0_2800 };
        self.word(base | enc(amount) << 16 | enc(dst) << 5 | enc(dst));
    }

    pub fn rorv(&mut self, amount: Reg, dst: Reg, wide: bool) {
        let base = if wide { 0x9ac0_2c00 } else { 0x1ac0_2c00 };
        self.word(base | enc(amount) << 16 | enc(dst) << 5 | enc(dst));
    }

    pub fn lsl_imm(&mut self, shift: u8, dst: Reg, wide: bool) {
        let d = enc(dst);
        if wide {
            let s = shift as u32 & 63;
            self.word(0xd340_0000 | ((64 - s) & 63) << 16 | (63 - s) << 10 | d << 5 | d);
        } else {
            let s = shift as u32 & 31;
            self.word(0x5300_0000 | ((32 - s) & 31) << 16 | (31 - s) << 10 | d << 5 | d);
        }
    }

    pub fn lsr_imm(&mut self, shift: u8, dst: Reg, wide: bool) {
        let d = enc(dst);
        if wide {
            self.word(0xd340_fc00 | (shift as u32 & 63) << 16 | d << 5 | d);
        } else {
            self.word(0x5300_7c00 | (shift as u32 & 31) << 16 | d << 5 | d);
        }
    }

    pub fn asr_imm(&mut self, shift: u8, dst: Reg, wide: bool) {
        let d = enc(dst);
        if wide {
            self.word(0x9340_fc00 | (shift as u32 & 63) << 16 | d << 5 | d);
        } else {
            self.word(0x1300_7c00 | (shift as u32 & 31) << 16 | d << 5 | d);
        }
    }

    /// `ror dst, dst, #shift` via extr.
    pub fn ror_imm(&mut self, shift: u8, dst: Reg, wide: bool) {
        let d = enc(dst);
        if wide {
            self.word(0x93c0_0000 | d << 16 | (shift as u32 & 63) << 10 | d << 5 | d);
        } else {
            self.word(0x1380_0000 | d << 16 | (shift as u32 & 31) << 10 | d << 5 | d);
        }
    }

    pub fn clz(&mut self, src: Reg, dst: Reg, wide: bool) {
        let base = if wide { 0xdac0_1000 } else { 0x5ac0_1000 };
        self.word(base | enc(src) << 5 | enc(dst));
    }

    pub fn rbit(&mut self, src: Reg, dst: Reg, wide: bool) {
        let base = if wide { 0xdac0_0000 } else { 0x5ac0_0000 };
        self.word(base | enc(src) << 5 | enc(dst));
    }

    /// sxtb/sxth/sxtw.
    pub fn sext(&mut self, src: Reg, dst: Reg, from_bits: u8, to64: bool) {
        let (s, d) = (enc(src), enc(dst));
        let word = match (from_bits, to64) {
            (8, true) => 0x9340_1c00,
            (16, true) => 0x9340_3c00,
            (32, true) => 0x9340_7c00,
            (8, false) => 0x1300_1c00,
            (16, false) => 0x1300_3c00,
            _ => unreachable!("invalid sign extension"),
        };
        self.word(word | s << 5 | d);
    }

    /// uxtb/uxth.
    pub fn uext(&mut self, src: Reg, dst: Reg, from_bits: u8) {
        let (s, d) = (enc(src), enc(dst));
        let word = match from_bits {
            8 => 0x5300_1c00,
            16 => 0x5300_3c00,
            _ => unreachable!("invalid zero extension"),
        };
        self.word(word | s << 5 | d);
    }

    /// cset (csinc against zero).
    pub fn cset(&mut self, cond: Cond, dst: Reg) {
        self.word(0x9a9f_07e0 | (cond.negate() as u32) << 12 | enc(dst));
    }

    pub fn csel(&mut self, cond: Cond, rn: Reg, rm: Reg, dst: Reg, wide: bool) {
        let base = if wide { 0x9a80_0000 } else { 0x1a80_0000 };
        self.word(base | enc(rm) << 16 | (cond as u32) << 12 | enc(rn) << 5 | enc(dst));
    }

    // ---- control ------------------------------------------------------

    pub fn b(&mut self, label: CodeLabel) {
        let at = self.buf.len();
        self.word(0x1400_0000);
        self.buf.use_label(at, FixupKind::Branch26, label);
    }

    pub fn b_cond(&mut self, cond: Cond, label: CodeLabel) {
        let at = self.buf.len();
        self.word(0x5400_0000 | cond as u32);
        self.buf.use_label(at, FixupKind::Branch19, label);
    }

    pub fn br(&mut self, target: Reg) {
        self.word(0xd61f_0000 | enc(target) << 5);
    }

    pub fn adr(&mut self, dst: Reg, label: CodeLabel) {
        let at = self.buf.len();
        self.word(0x1000_0000 | enc(dst));
        self.buf.use_label(at, FixupKind::Adr21, label);
    }

    /// `ldrsw dst, [base, index, lsl #2]`.
    pub fn ldrsw_indexed(&mut self, dst: Reg, base: Reg, index: Reg) {
        self.word(0xb8a0_7800 | enc(index) << 16 | enc(base) << 5 | enc(dst));
    }

    /// `cmn lhs, #imm` (adds with zero destination).
    pub fn cmn_imm(&mut self, lhs: Reg, imm: u32, wide: bool) {
        debug_assert!(imm < 4096);
        let base = if wide { 0xb100_0000 } else { 0x3100_0000 };
        self.word(base | imm << 10 | enc(lhs) << 5 | ZR as u32);
    }

    /// `neg dst, src` (sub from zero).
    pub fn neg(&mut self, src: Reg, dst: Reg, wide: bool) {
        let base = if wide { 0xcb00_0000 } else { 0x4b00_0000 };
        self.word(base | enc(src) << 16 | (ZR as u32) << 5 | enc(dst));
    }

    pub fn cbnz32(&mut self, reg: Reg, label: CodeLabel) {
        let at = self.buf.len();
        self.word(0x3500_0000 | enc(reg));
        self.buf.use_label(at, FixupKind::Branch19, label);
    }

    /// `mov sp, src`.
    pub fn mov_to_sp(&mut self, src: Reg) {
        self.word(0x9100_0000 | enc(src) << 5 | 31);
    }

    /// `movz dst, #0` + `movk dst, #0, lsl 16`, both patched with the
    /// stack ceiling at finalize.
    pub fn mov_ceil(&mut self, dst: Reg) {
        let at = self.buf.len();
        self.word(0x5280_0000 | enc(dst));
        self.word(0x72a0_0000 | enc(dst));
        self.buf.defer_ceil_movz_movk(at);
    }

    /// Load a link-time-patched 64-bit value (a literal-pool slot) into a
    /// general purpose register.
    pub fn ldr_x_reloc(&mut self, dst: Reg, kind: crate::buffer::RelocKind) {
        let label = self.buf.add_reloc_const8(kind);
        let at = self.buf.len();
        self.word(0x5800_0000 | enc(dst));
        self.buf.use_label(at, FixupKind::Ldr19, label);
    }

    /// Scalar FP load from the literal pool.
    pub fn ldr_fp_literal(&mut self, dst: Reg, label: CodeLabel, width: u8) {
        let op = match width {
            4 => 0x1c00_0000,
            8 => 0x5c00_0000,
            _ => 0x9c00_0000,
        };
        let at = self.buf.len();
        self.word(op | enc(dst));
        self.buf.use_label(at, FixupKind::Ldr19, label);
    }

    // ---- atomics ------------------------------------------------------

    pub fn ldar(&mut self, dst: Reg, addr: Reg, width: u8) {
        let op = match width {
            1 => 0x08df_fc00,
            2 => 0x48df_fc00,
            4 => 0x88df_fc00,
            _ => 0xc8df_fc00,
        };
        self.word(op | enc(addr) << 5 | enc(dst));
    }

    pub fn stlr(&mut self, src: Reg, addr: Reg, width: u8) {
        let op = match width {
            1 => 0x089f_fc00,
            2 => 0x489f_fc00,
            4 => 0x889f_fc00,
            _ => 0xc89f_fc00,
        };
        self.word(op | enc(addr) << 5 | enc(src));
    }

    pub fn ldaxr(&mut self, dst: Reg, addr: Reg, width: u8) {
        let op = match width {
            1 => 0x085f_fc00,
            2 => 0x485f_fc00,
            4 => 0x885f_fc00,
            _ => 0xc85f_fc00,
        };
        self.word(op | enc(addr) << 5 | enc(dst));
    }

    pub fn stlxr(&mut self, status: Reg, src: Reg, addr: Reg, width: u8) {
        let op = match width {
            1 => 0x0800_fc00,
            2 => 0x4800_fc00,
            4 => 0x8800_fc00,
            _ => 0xc800_fc00,
        };
        self.word(op | enc(status) << 16 | enc(addr) << 5 | enc(src));
    }

    pub fn dmb_ish(&mut self) {
        self.word(0xd503_3bbf);
    }

    /// `ldp x1, x2, [sp], #16`.
    pub fn ldp_x_post16(&mut self, r1: Reg, r2: Reg) {
        self.word(0xa8c1_0000 | enc(r2) << 10 | (31 << 5) | enc(r1));
    }

    /// `ldp d1, d2, [sp], #16`.
    pub fn ldp_d_post16(&mut self, r1: Reg, r2: Reg) {
        self.word(0x6cc1_0000 | enc(r2) << 10 | (31 << 5) | enc(r1));
    }

    pub fn ret(&mut self) {
        self.word(0xd65f_03c0);
    }

    // ---- scalar floating point ---------------------------------------

    /// Two-source FP arithmetic with the op base carrying precision.
    pub fn fp_rrr(&mut self, base: u32, rm: Reg, rn: Reg, rd: Reg) {
        self.word(base | enc(rm) << 16 | enc(rn) << 5 | enc(rd));
    }

    /// One-source FP ops.
    pub fn fp_rr(&mut self, base: u32, rn: Reg, rd: Reg) {
        self.word(base | enc(rn) << 5 | enc(rd));
    }

    pub fn fmov_to_fp(&mut self, src: Reg, dst: Reg, wide: bool) {
        let base = if wide { 0x9e67_0000 } else { 0x1e27_0000 };
        self.word(base | enc(src) << 5 | enc(dst));
    }

    pub fn fmov_from_fp(&mut self, src: Reg, dst: Reg, wide: bool) {
        let base = if wide { 0x9e66_0000 } else { 0x1e26_0000 };
        self.word(base | enc(src) << 5 | enc(dst));
    }

    pub fn fcmp(&mut self, lhs: Reg, rhs: Reg, double: bool) {
        let base = if double { 0x1e60_2000 } else { 0x1e20_2000 };
        self.word(base | enc(rhs) << 16 | enc(lhs) << 5);
    }

    // ---- NEON ---------------------------------------------------------

    /// Three-same vector instruction (`Q = 1`): base | size | Rm | Rn | Rd.
    pub fn v_rrr(&mut self, base: u32, size: VSize, rm: Reg, rn: Reg, rd: Reg) {
        self.word(base | (size as u32) << 22 | enc(rm) << 16 | enc(rn) << 5 | enc(rd));
    }

    /// Two-register vector instruction.
    pub fn v_rr(&mut self, base: u32, size: VSize, rn: Reg, rd: Reg) {
        self.word(base | (size as u32) << 22 | enc(rn) << 5 | enc(rd));
    }

    /// Raw vector word with explicit fields already baked in.
    pub fn v_raw(&mut self, base: u32, rm: Reg, rn: Reg, rd: Reg) {
        self.word(base | enc(rm) << 16 | enc(rn) << 5 | enc(rd));
    }

    pub fn v_raw2(&mut self, base: u32, rn: Reg, rd: Reg) {
        self.word(base | enc(rn) << 5 | enc(rd));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::aarch64::regs;

    fn words(f: impl FnOnce(&mut Assembler)) -> Vec<u32> {
        let mut asm = Assembler::new();
        f(&mut asm);
        let (code, _) = asm.buf.finalize(0).unwrap();
        code.chunks(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn golden_moves() {
        // movz x3, #100
        assert_eq!(
            words(|a| a.mov_imm(regs::xreg(3), 100)),
            vec![0xd280_0c83]
        );
        // mov x4, x3
        assert_eq!(
            words(|a| a.mov_rr(regs::xreg(3), regs::xreg(4), true)),
            vec![0xaa03_03e4]
        );
    }

    #[test]
    fn golden_loads() {
        // ldr x3, [x0, #16]
        assert_eq!(
            words(|a| a.load_zx(regs::xreg(3), regs::xreg(0), 16, 8)),
            vec![0xf940_0803]
        );
        // str x3, [x0, #8]
        assert_eq!(
            words(|a| a.store(regs::xreg(3), regs::xreg(0), 8, 8)),
            vec![0xf900_0403]
        );
    }

    #[test]
    fn golden_alu() {
        // add x3, x3, x4
        assert_eq!(
            words(|a| a.add_rr(regs::xreg(4), regs::xreg(3), true)),
            vec![0x8b04_0063]
        );
        // cmp x3, #0
        assert_eq!(
            words(|a| a.cmp_imm(regs::xreg(3), 0, true)),
            vec![0xf100_007f]
        );
        // sdiv x3, x3, x4
        assert_eq!(
            words(|a| a.sdiv(regs::xreg(3), regs::xreg(3), regs::xreg(4), true)),
            vec![0x9ac4_0c63]
        );
    }

    #[test]
    fn golden_branches() {
        // Backward b to self.
        let code = words(|a| {
            let l = a.buf.new_label();
            a.buf.bind_label(l);
            a.b(l);
        });
        assert_eq!(code, vec![0x1400_0000]);
        // ret through br x30 shape: br x5.
        assert_eq!(words(|a| a.br(regs::xreg(5))), vec![0xd61f_00a0]);
    }
}
