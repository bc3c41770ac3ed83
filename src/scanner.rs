//! Pattern-finding routines built on [`InsnCursor`]. Each function walks
//! an instruction stream looking for a structural pattern (a literal
//! reference, a call, any branch, a function prologue) rather than a raw
//! byte sequence.

use log::debug;

use crate::cursor::InsnCursor;
use crate::error::{Error, Result};
use crate::insn::Mnemonic;
use crate::vmem::VMem;

/// Resolves the literal address an `adr`, or an `adrp` optionally paired
/// with a following `add` into the same register, computes — or `None`
/// if the instruction at this cursor does not address a literal at all.
fn resolve_literal(cursor: InsnCursor) -> Option<u64> {
    let insn = cursor.insn();
    match insn.mnemonic {
        Mnemonic::Adr => Some(insn.imm as u64),
        Mnemonic::Adrp => {
            let page = insn.imm as u64;
            if let Some(next) = cursor.forward() {
                let next_insn = next.insn();
                if next_insn.mnemonic == Mnemonic::Add && next_insn.rn == insn.rd {
                    return Some(page.wrapping_add(next_insn.imm as u64));
                }
            }
            Some(page)
        }
        _ => None,
    }
}

/// Finds the `skip`-th (0-indexed) instruction that computes `target` as
/// a PC-relative literal address (`adr`, or `adrp`+`add`).
pub fn find_literal_ref(vmem: VMem, target: u64, skip: usize) -> Result<InsnCursor> {
    let mut cursor = InsnCursor::new(vmem, vmem.base())?;
    let mut seen = 0usize;
    loop {
        if let Some(addr) = resolve_literal(cursor) {
            if addr == target {
                if seen == skip {
                    debug!("find_literal_ref: target 0x{target:x} at 0x{:x}", cursor.va());
                    return Ok(cursor);
                }
                seen += 1;
            }
        }
        cursor = match cursor.forward() {
            Some(next) => next,
            None => return Err(Error::NotFound("find_literal_ref")),
        };
    }
}

/// Finds a `bl` whose destination is `target`.
pub fn find_call_ref(vmem: VMem, target: u64) -> Result<InsnCursor> {
    let mut cursor = InsnCursor::new(vmem, vmem.base())?;
    loop {
        let insn = cursor.insn();
        if insn.mnemonic == Mnemonic::Bl && insn.imm as u64 == target {
            debug!("find_call_ref: call to 0x{target:x} at 0x{:x}", cursor.va());
            return Ok(cursor);
        }
        cursor = match cursor.forward() {
            Some(next) => next,
            None => return Err(Error::NotFound("find_call_ref")),
        };
    }
}

/// Finds any direct branch (`b`, `bl`, `b.cond`, `cbz`, `cbnz`) whose
/// destination is `target`, optionally restricted to the half-open
/// `[window.0, window.1)` virtual-address range.
pub fn find_branch_ref(vmem: VMem, target: u64, window: Option<(u64, u64)>) -> Result<InsnCursor> {
    let start = window.map(|w| w.0).unwrap_or_else(|| vmem.base());
    let end = window.map(|w| w.1).unwrap_or_else(|| vmem.end());
    let mut cursor = InsnCursor::new(vmem, start)?;
    loop {
        if cursor.va() >= end {
            return Err(Error::NotFound("find_branch_ref"));
        }
        let insn = cursor.insn();
        let is_branch_imm = matches!(
            insn.mnemonic,
            Mnemonic::B | Mnemonic::Bl | Mnemonic::Bcond | Mnemonic::Cbz | Mnemonic::Cbnz
        );
        if is_branch_imm && insn.imm as u64 == target {
            debug!("find_branch_ref: branch to 0x{target:x} at 0x{:x}", cursor.va());
            return Ok(cursor);
        }
        cursor = match cursor.forward() {
            Some(next) => next,
            None => return Err(Error::NotFound("find_branch_ref")),
        };
    }
}

/// How far back [`find_bof`] is willing to walk before giving up —
/// iBoot functions are small; a function body longer than this would
/// indicate we started inside data, not code.
const MAX_BOF_SCAN: u64 = 0x4000;

fn is_fp_lr_prologue(cursor: InsnCursor) -> bool {
    let insn = cursor.insn();
    insn.mnemonic == Mnemonic::Stp && insn.rd == 29 && insn.rm == 30 && insn.rn == 31
}

/// Walks backward from `va` to the beginning of its enclosing function,
/// recognised by the `stp x29, x30, [sp, ...]` frame-save that opens
/// nearly every iBoot routine (with or without a preceding
/// `sub sp, sp, #n`).
pub fn find_bof(vmem: VMem, va: u64) -> Result<u64> {
    let mut cursor = InsnCursor::new(vmem, va)?;
    let mut scanned = 0u64;
    loop {
        if is_fp_lr_prologue(cursor) {
            debug!("find_bof: 0x{va:x} -> 0x{:x}", cursor.va());
            return Ok(cursor.va());
        }
        cursor = match cursor.backward() {
            Some(prev) => prev,
            None => return Err(Error::NotFound("find_bof")),
        };
        scanned += 4;
        if scanned > MAX_BOF_SCAN {
            return Err(Error::NotFound("find_bof"));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::image::ByteImage;
    use crate::insn;

    fn image_with_words(words: &[(usize, u32)]) -> ByteImage<'static> {
        let mut buf = vec![0u8; 0x4000];
        buf[0..4].copy_from_slice(&0x9000_0000u32.to_le_bytes());
        buf[0x318..0x320].copy_from_slice(&0x8000_0000_0000u64.to_le_bytes());
        for (off, w) in words {
            buf[*off..*off + 4].copy_from_slice(&w.to_le_bytes());
        }
        ByteImage::from_buffer(buf).unwrap()
    }

    #[test]
    fn finds_adr_literal() {
        let pc = 0x8000_0000_0400u64;
        let target = 0x8000_0000_0500u64;
        let adr = insn::new_general_adr(pc, target, 0);
        let word = insn::encode(&adr).unwrap();
        let img = image_with_words(&[(0x400, word)]);
        let vmem = VMem::new(&img);
        let found = find_literal_ref(vmem, target, 0).unwrap();
        assert_eq!(found.va(), pc);
    }

    #[test]
    fn skip_selects_later_occurrence() {
        let target = 0x8000_0000_0700u64;
        let a = insn::new_general_adr(0x8000_0000_0400, target, 1);
        let b = insn::new_general_adr(0x8000_0000_0408, target, 2);
        let img = image_with_words(&[
            (0x400, insn::encode(&a).unwrap()),
            (0x408, insn::encode(&b).unwrap()),
        ]);
        let vmem = VMem::new(&img);
        let first = find_literal_ref(vmem, target, 0).unwrap();
        let second = find_literal_ref(vmem, target, 1).unwrap();
        assert_eq!(first.va(), 0x8000_0000_0400);
        assert_eq!(second.va(), 0x8000_0000_0408);
    }

    #[test]
    fn finds_call_ref() {
        let pc = 0x8000_0000_0400u64;
        let target = 0x8000_0000_1000u64;
        let bl = insn::new_immediate_bl(pc, target);
        let img = image_with_words(&[(0x400, insn::encode(&bl).unwrap())]);
        let vmem = VMem::new(&img);
        let found = find_call_ref(vmem, target).unwrap();
        assert_eq!(found.va(), pc);
    }

    #[test]
    fn finds_branch_ref_within_window() {
        let base = 0x8000_0000_0000u64;
        let pc = base + 0x800;
        let target = base + 0x1000;
        let b = insn::new_immediate_b(pc, target);
        let img = image_with_words(&[(0x800, insn::encode(&b).unwrap())]);
        let vmem = VMem::new(&img);
        assert!(find_branch_ref(vmem, target, Some((base + 0x700, base + 0x900))).is_ok());
        assert!(find_branch_ref(vmem, target, Some((base + 0x900, base + 0xa00))).is_err());
    }

    #[test]
    fn finds_bof_single_instruction_prologue() {
        // stp x29, x30, [sp, #-0x10]!
        let img = image_with_words(&[(0x800, 0xA9BF7BFD), (0x804, 0xD503201F)]);
        let vmem = VMem::new(&img);
        let bof = find_bof(vmem, img.base() + 0x804).unwrap();
        assert_eq!(bof, img.base() + 0x800);
    }

    #[test]
    fn find_bof_fails_past_scan_limit() {
        let img = image_with_words(&[]);
        let vmem = VMem::new(&img);
        assert!(find_bof(vmem, img.base() + 0x3000).is_err());
    }
}
