//! The patchable code buffer shared by both ISA assemblers.
//!
//! Instruction bytes are appended in one pass. Branches to labels that are
//! not bound yet leave a fixup behind; `finalize` resolves every fixup,
//! patches the deferred stack-ceiling immediates, appends the literal pool
//! and hands back the finished bytes plus the relocations the runtime must
//! apply at link time (absolute addresses of callee function records).

use anyhow::{bail, Result};

/// A position in the code buffer that can be branched to or read.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CodeLabel(u32);

/// A link-time relocation in the finished code.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Reloc {
    /// Byte offset of the patch site.
    pub offset: u32,
    pub kind: RelocKind,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RelocKind {
    /// An 8-byte little-endian slot to be filled with the absolute address
    /// of the function record for `function_index`.
    FunctionAddress { function_index: u32 },
}

#[derive(Debug, Copy, Clone)]
pub enum FixupKind {
    /// x86-64: 4-byte little-endian displacement at `at`, relative to the
    /// end of the displacement.
    PcRel32,
    /// AArch64 `b`/`bl`: 26-bit word-offset immediate in bits 0..26.
    Branch26,
    /// AArch64 `b.cond`/`cbz`/`cbnz`: 19-bit word-offset in bits 5..24.
    Branch19,
    /// AArch64 `adr`: 21-bit byte-offset split into immlo (29..31) and
    /// immhi (5..24).
    Adr21,
    /// AArch64 `ldr` (literal): 19-bit word-offset in bits 5..24.
    Ldr19,
    /// A 4-byte little-endian jump-table entry at `at` holding
    /// `target - table_base`.
    TableEntry { base: u32 },
}

/// Shape of a deferred stack-ceiling patch site.
#[derive(Debug, Copy, Clone)]
enum CeilSite {
    /// Raw little-endian 4-byte immediate.
    Imm32,
    /// An AArch64 `movz`/`movk` pair holding the low and high halves.
    MovzMovk,
}

#[derive(Debug, Copy, Clone)]
struct Fixup {
    at: u32,
    target: CodeLabel,
    kind: FixupKind,
}

#[derive(Default)]
pub struct CodeBuffer {
    bytes: Vec<u8>,
    labels: Vec<Option<u32>>,
    fixups: Vec<Fixup>,
    relocs: Vec<Reloc>,
    /// Sites rewritten with the stack-pointer ceiling at finalize.
    ceil_sites: Vec<(u32, CeilSite)>,
    /// Literals appended after the code, each bound to a label. Multiples
    /// of 16 bytes so pool entries stay vector-aligned. An entry may carry
    /// a relocation applied at its final pool offset.
    consts: Vec<(Vec<u8>, CodeLabel, Option<RelocKind>)>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> u32 {
        self.bytes.len() as u32
    }

    pub fn put1(&mut self, b: u8) {
        self.bytes.push(b);
    }

    pub fn put2(&mut self, v: u16) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put4(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put8(&mut self, v: u64) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub fn new_label(&mut self) -> CodeLabel {
        self.labels.push(None);
        CodeLabel(self.labels.len() as u32 - 1)
    }

    /// Bind `label` to the current offset. A label binds exactly once.
    pub fn bind_label(&mut self, label: CodeLabel) {
        let slot = &mut self.labels[label.0 as usize];
        debug_assert!(slot.is_none(), "label bound twice");
        *slot = Some(self.bytes.len() as u32);
    }

    pub fn label_offset(&self, label: CodeLabel) -> Option<u32> {
        self.labels[label.0 as usize]
    }

    /// Record that the `kind`-shaped patch site just emitted at `at` refers
    /// to `target`.
    pub fn use_label(&mut self, at: u32, kind: FixupKind, target: CodeLabel) {
        self.fixups.push(Fixup { at, target, kind });
    }

    /// Record an absolute 8-byte relocation at the current offset; the
    /// caller emits the placeholder.
    pub fn reloc_here(&mut self, kind: RelocKind) {
        self.relocs.push(Reloc {
            offset: self.bytes.len() as u32,
            kind,
        });
    }

    /// Record that the 4 bytes at `at` hold the function's stack-pointer
    /// ceiling, known only once the whole body is emitted.
    pub fn defer_ceil_imm32(&mut self, at: u32) {
        self.ceil_sites.push((at, CeilSite::Imm32));
    }

    /// Record a `movz` at `at` and a `movk` at `at + 4` whose 16-bit
    /// immediates receive the ceiling at finalize.
    pub fn defer_ceil_movz_movk(&mut self, at: u32) {
        self.ceil_sites.push((at, CeilSite::MovzMovk));
    }

    /// Intern a literal blob (a multiple of 16 bytes); the returned label
    /// binds to its address in the pool at finalize.
    pub fn add_const(&mut self, value: &[u8]) -> CodeLabel {
        debug_assert!(value.len() % 16 == 0);
        if let Some((_, label, _)) = self
            .consts
            .iter()
            .find(|(v, _, reloc)| v.as_slice() == value && reloc.is_none())
        {
            return *label;
        }
        let label = self.new_label();
        self.consts.push((value.to_vec(), label, None));
        label
    }

    /// Intern a single 16-byte literal.
    pub fn add_const16(&mut self, value: [u8; 16]) -> CodeLabel {
        self.add_const(&value)
    }

    /// Add a pool entry whose first 8 bytes are a link-time patch slot.
    /// Never deduplicated: every call site gets its own slot.
    pub fn add_reloc_const8(&mut self, kind: RelocKind) -> CodeLabel {
        let label = self.new_label();
        self.consts.push((vec![0; 16], label, Some(kind)));
        label
    }

    fn patch4(&mut self, at: u32, value: u32) {
        self.bytes[at as usize..at as usize + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn read4(&self, at: u32) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.bytes[at as usize..at as usize + 4]);
        u32::from_le_bytes(raw)
    }

    fn apply_fixup(&mut self, fixup: Fixup, target: u32) -> Result<()> {
        let at = fixup.at;
        match fixup.kind {
            FixupKind::PcRel32 => {
                let rel = target as i64 - (at as i64 + 4);
                let rel = i32::try_from(rel)?;
                self.patch4(at, rel as u32);
            }
            FixupKind::Branch26 => {
                let rel = (target as i64 - at as i64) / 4;
                if rel < -(1 << 25) || rel >= (1 << 25) {
                    bail!("branch26 target out of range");
                }
                let insn = self.read4(at) | ((rel as u32) & 0x03ff_ffff);
                self.patch4(at, insn);
            }
            FixupKind::Branch19 => {
                let rel = (target as i64 - at as i64) / 4;
                if rel < -(1 << 18) || rel >= (1 << 18) {
                    bail!("branch19 target out of range");
                }
                let insn = self.read4(at) | (((rel as u32) & 0x7ffff) << 5);
                self.patch4(at, insn);
            }
            FixupKind::Adr21 => {
                let rel = target as i64 - at as i64;
                if rel < -(1 << 20) || rel >= (1 << 20) {
                    bail!("adr target out of range");
                }
                let rel = rel as u32;
                let insn =
                    self.read4(at) | ((rel & 0x3) << 29) | (((rel >> 2) & 0x7ffff) << 5);
                self.patch4(at, insn);
            }
            FixupKind::Ldr19 => {
                let rel = (target as i64 - at as i64) / 4;
                if rel < -(1 << 18) || rel >= (1 << 18) {
                    bail!("literal load target out of range");
                }
                let insn = self.read4(at) | (((rel as u32) & 0x7ffff) << 5);
                self.patch4(at, insn);
            }
            FixupKind::TableEntry { base } => {
                let rel = target as i64 - base as i64;
                self.patch4(at, i32::try_from(rel)? as u32);
            }
        }
        Ok(())
    }

    /// Resolve everything and return `(bytes, relocs)`.
    ///
    /// `stack_pointer_ceil` rewrites the deferred headroom immediates. An
    /// unbound label at this point means the back end promised an
    /// instruction address that was never emitted: a compiler bug surfaced
    /// as an error, not a bad encoding.
    pub fn finalize(mut self, stack_pointer_ceil: u32) -> Result<(Vec<u8>, Vec<Reloc>)> {
        for (at, site) in std::mem::take(&mut self.ceil_sites) {
            match site {
                CeilSite::Imm32 => self.patch4(at, stack_pointer_ceil),
                CeilSite::MovzMovk => {
                    let movz = self.read4(at) | (stack_pointer_ceil & 0xffff) << 5;
                    self.patch4(at, movz);
                    let movk = self.read4(at + 4) | (stack_pointer_ceil >> 16) << 5;
                    self.patch4(at + 4, movk);
                }
            }
        }

        // Literal pool, 16-byte aligned so vector loads may use it.
        if !self.consts.is_empty() {
            while self.bytes.len() % 16 != 0 {
                self.bytes.push(0);
            }
            for (value, label, reloc) in std::mem::take(&mut self.consts) {
                self.bind_label(label);
                if let Some(kind) = reloc {
                    self.relocs.push(Reloc {
                        offset: self.bytes.len() as u32,
                        kind,
                    });
                }
                self.bytes.extend_from_slice(&value);
            }
            debug_assert!(self.bytes.len() % 16 == 0);
        }

        for fixup in std::mem::take(&mut self.fixups) {
            let target = match self.label_offset(fixup.target) {
                Some(offset) => offset,
                None => bail!(
                    "instruction address read for a label that was never emitted: {:?}",
                    fixup.target
                ),
            };
            self.apply_fixup(fixup, target)?;
        }

        Ok((self.bytes, self.relocs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rel32_forward_and_backward() {
        let mut buf = CodeBuffer::new();
        let back = buf.new_label();
        buf.bind_label(back);
        buf.put1(0x90);
        let fwd = buf.new_label();
        // two rel32 sites.
        let at1 = buf.len();
        buf.put4(0);
        buf.use_label(at1, FixupKind::PcRel32, back);
        let at2 = buf.len();
        buf.put4(0);
        buf.use_label(at2, FixupKind::PcRel32, fwd);
        buf.put1(0x90);
        buf.bind_label(fwd);
        let (bytes, _) = buf.finalize(0).unwrap();
        assert_eq!(&bytes[1..5], &(-5i32).to_le_bytes());
        assert_eq!(&bytes[5..9], &1i32.to_le_bytes());
    }

    #[test]
    fn unbound_label_is_an_error() {
        let mut buf = CodeBuffer::new();
        let label = buf.new_label();
        let at = buf.len();
        buf.put4(0);
        buf.use_label(at, FixupKind::PcRel32, label);
        assert!(buf.finalize(0).is_err());
    }

    #[test]
    fn ceiling_patch_rewrites_all_sites() {
        let mut buf = CodeBuffer::new();
        let at = buf.len();
        buf.put4(0xdead_beef);
        buf.defer_ceil_imm32(at);
        let (bytes, _) = buf.finalize(48).unwrap();
        assert_eq!(&bytes[0..4], &48u32.to_le_bytes());
    }

    #[test]
    fn const_pool_is_aligned_and_deduplicated() {
        let mut buf = CodeBuffer::new();
        buf.put1(0x90);
        let a = buf.add_const16([1; 16]);
        let b = buf.add_const16([1; 16]);
        assert_eq!(a, b);
        let at = buf.len();
        buf.put4(0);
        buf.use_label(at, FixupKind::PcRel32, a);
        let (bytes, _) = buf.finalize(0).unwrap();
        assert_eq!(bytes.len() % 16, 0);
        assert_eq!(&bytes[16..32], &[1; 16]);
    }
}
