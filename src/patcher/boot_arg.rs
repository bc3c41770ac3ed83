use super::{find_zero_run, mov_reg_bytes};
use crate::cursor::InsnCursor;
use crate::error::{Error, Result};
use crate::image::ByteImage;
use crate::insn::{self, Mnemonic};
use crate::meta::Meta;
use crate::patch::Patch;
use crate::scanner::find_literal_ref;
use crate::vmem::VMem;

const DEFAULT_ARGS_CANDIDATES: &[&str] =
    &["rd=md0 nand-enable-reformat=1 -progress", "rd=md0 -progress -restore", "rd=md0"];

const ZERO_REGION_LEN: u64 = 270;
const SKIP_FIRST_REGION_CHIPIDS: &[i64] = &[8010, 8003, 8000];
const CERT_FALLBACK: &str = "Apple Inc.1";

fn find_relocation_site(vmem: VMem, after: u64, meta: &Meta) -> Result<u64> {
    let skip_first = meta.chipid.is_some_and(|c| SKIP_FIRST_REGION_CHIPIDS.contains(&c));
    let first = find_zero_run(vmem, ZERO_REGION_LEN, after);
    let region = if skip_first {
        first.and_then(|va| find_zero_run(vmem, ZERO_REGION_LEN, va + ZERO_REGION_LEN))
    } else {
        first
    };
    match region {
        Some(va) => Ok(va),
        None => vmem.memstr(CERT_FALLBACK),
    }
}

/// Rewrites the default boot-args string (and every instruction that
/// computes its address) to `args`. The source string is reused in
/// place when `args` still fits; otherwise it's relocated into a run of
/// unused zero bytes (or, failing that, over the `"Apple Inc.1"`
/// certificate-issuer string).
///
/// New-style builds (`vers >= 7429`, or `vers == 6723 && vers_arr[0] >=
/// 100`, and not a dev build) locate the real xref slot one level
/// removed: the directly-found reference sits behind a branch whose
/// target contains the actual call site, and the slot to rewrite is the
/// `nop` preceding that call — this mirrors how those builds indirect
/// boot-arg lookups through a small trampoline rather than referencing
/// the string inline.
pub fn get_boot_arg_patch(image: &ByteImage, meta: &Meta, args: &str) -> Result<Vec<Patch>> {
    let vmem = VMem::new(image);

    let (anchor, anchor_len) = DEFAULT_ARGS_CANDIDATES
        .iter()
        .find_map(|s| vmem.memstr(s).ok().map(|va| (va, s.len())))
        .ok_or(Error::NotFound("get_boot_arg_patch: default boot-args string"))?;

    let new_style = meta.is_new_style() && !meta.dev;
    let mut xref = find_literal_ref(vmem, anchor, 0)?;

    if new_style {
        let branch = xref.forward().ok_or(Error::NotFound("get_boot_arg_patch"))?;
        if branch.insn().mnemonic != Mnemonic::B {
            return Err(Error::InvalidCursorState("expected unconditional branch after new-style xref".into()));
        }
        let mut probe = InsnCursor::new(vmem, branch.insn().imm as u64)?;
        loop {
            if probe.insn().mnemonic == Mnemonic::Bl {
                break;
            }
            probe = probe.forward().ok_or(Error::NotFound("get_boot_arg_patch"))?;
        }
        loop {
            probe = probe.backward().ok_or(Error::NotFound("get_boot_arg_patch"))?;
            if probe.insn().mnemonic == Mnemonic::Nop {
                break;
            }
        }
        xref = probe;
    }

    let xref_rd = if new_style {
        4
    } else {
        match xref.insn().mnemonic {
            Mnemonic::Adr | Mnemonic::Adrp => xref.insn().rd,
            _ => {
                // Two instructions back from the xref must be the `bl`
                // that reaches it; the register actually used is the one
                // decoded from the instruction immediately before the
                // xref, not from the `bl` itself.
                let two_back = xref
                    .backward()
                    .and_then(|c| c.backward())
                    .ok_or(Error::NotFound("get_boot_arg_patch"))?;
                if two_back.insn().mnemonic != Mnemonic::Bl {
                    return Err(Error::InvalidCursorState("expected bl two instructions before non-adr xref".into()));
                }
                let one_back = two_back.forward().ok_or(Error::NotFound("get_boot_arg_patch"))?;
                one_back.insn().rd
            }
        }
    };

    if xref_rd > 9 || (xref_rd == 4 && !new_style) {
        return Ok(Vec::new());
    }

    let mut new_bytes = args.as_bytes().to_vec();
    new_bytes.push(0);

    let dest_va = if new_bytes.len() <= anchor_len + 1 { anchor } else { find_relocation_site(vmem, xref.va(), meta)? };

    let mut patches = vec![Patch::new(dest_va, new_bytes)];

    let xref_already_correct = xref.insn().mnemonic == Mnemonic::Adr && xref.insn().imm as u64 == dest_va;
    if !xref_already_correct {
        let rewritten = insn::new_general_adr(xref.va(), dest_va, xref_rd);
        patches.push(Patch::new(xref.va(), insn::encode(&rewritten)?.to_le_bytes().to_vec()));
    }

    let mut cursor = xref;
    let csel = loop {
        cursor = cursor.forward().ok_or(Error::NotFound("get_boot_arg_patch"))?;
        let insn = cursor.insn();
        if insn.mnemonic == Mnemonic::Csel && (insn.rn == xref_rd || insn.rm == xref_rd) {
            break cursor;
        }
    };
    let csel_insn = csel.insn();
    let src_reg = if csel_insn.rn == xref_rd { csel_insn.rn } else { csel_insn.rm };
    patches.push(Patch::new(csel.va(), mov_reg_bytes(csel_insn.rd, src_reg).to_vec()));

    let mut back = csel;
    let branch = loop {
        back = back.backward().ok_or(Error::NotFound("get_boot_arg_patch"))?;
        if back.insn().mnemonic == Mnemonic::B {
            break back;
        }
    };
    let mut probe = InsnCursor::new(vmem, branch.insn().imm as u64)?;
    let adr_cursor = loop {
        if probe.insn().mnemonic == Mnemonic::Adr {
            break probe;
        }
        probe = probe.forward().ok_or(Error::NotFound("get_boot_arg_patch"))?;
    };
    let rewritten = insn::new_general_adr(adr_cursor.va(), dest_va, adr_cursor.insn().rd);
    patches.push(Patch::new(adr_cursor.va(), insn::encode(&rewritten)?.to_le_bytes().to_vec()));

    Ok(patches)
}

#[cfg(test)]
mod test {
    use super::*;

    fn legacy_meta() -> Meta {
        Meta { vers: 1940, vers_arr: [0; 5], stage1: false, stage2: false, dev: false, chipid: None, entrypoint: 0 }
    }

    fn build_image() -> ByteImage<'static> {
        let base = 0x8000_0000u64;
        let mut buf = vec![0u8; 0x20000];
        buf[0..4].copy_from_slice(&0x9000_0000u32.to_le_bytes());
        buf[0x318..0x320].copy_from_slice(&base.to_le_bytes());

        let s = b"rd=md0 nand-enable-reformat=1 -progress\0";
        buf[0x10000..0x10000 + s.len()].copy_from_slice(s);

        let branch_va = base + 0xF00;
        let adr_dest_va = base + 0xF80;
        let xref_va = base + 0x1000;
        let csel_va = base + 0x1010;

        let b = insn::new_immediate_b(branch_va, adr_dest_va);
        buf[0xF00..0xF04].copy_from_slice(&insn::encode(&b).unwrap().to_le_bytes());

        let old_adr = insn::new_general_adr(adr_dest_va, base + 0x5000, 3);
        buf[0xF80..0xF84].copy_from_slice(&insn::encode(&old_adr).unwrap().to_le_bytes());

        let xref_adr = insn::new_general_adr(xref_va, base + 0x10000, 8);
        buf[0x1000..0x1004].copy_from_slice(&insn::encode(&xref_adr).unwrap().to_le_bytes());

        // csel x1, x8, x9, eq: sf=1 00 11010100 Rm(9) cond(0000) 00 Rn(8) Rd(1)
        let csel_word: u32 = (1 << 31) | (0b00_1101_0100 << 21) | (9 << 16) | (0b0000 << 12) | (8 << 5) | 1;
        buf[0x1010..0x1014].copy_from_slice(&csel_word.to_le_bytes());

        ByteImage::from_buffer(buf).unwrap()
    }

    #[test]
    fn short_args_rewrite_in_place_with_three_patches() {
        let img = build_image();
        let patches = get_boot_arg_patch(&img, &legacy_meta(), "-v").unwrap();
        assert_eq!(patches.len(), 3);

        let base = img.base();
        assert_eq!(patches[0].va, base + 0x10000);
        assert_eq!(patches[0].bytes, b"-v\0".to_vec());

        assert_eq!(patches[1].va, base + 0x1010);

        assert_eq!(patches[2].va, base + 0xF80);
    }

    #[test]
    fn oversized_register_aborts_cleanly() {
        let base = 0x8000_0000u64;
        let mut buf = vec![0u8; 0x20000];
        buf[0..4].copy_from_slice(&0x9000_0000u32.to_le_bytes());
        buf[0x318..0x320].copy_from_slice(&base.to_le_bytes());
        let s = b"rd=md0\0";
        buf[0x10000..0x10000 + s.len()].copy_from_slice(s);
        let xref_va = base + 0x1000;
        let xref_adr = insn::new_general_adr(xref_va, base + 0x10000, 10);
        buf[0x1000..0x1004].copy_from_slice(&insn::encode(&xref_adr).unwrap().to_le_bytes());
        let img = ByteImage::from_buffer(buf).unwrap();

        let patches = get_boot_arg_patch(&img, &legacy_meta(), "-v").unwrap();
        assert!(patches.is_empty());
    }
}
