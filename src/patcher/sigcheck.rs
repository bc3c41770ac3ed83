use super::mov_x0_0_ret;
use crate::error::{Error, Result};
use crate::image::ByteImage;
use crate::insn::Mnemonic;
use crate::meta::Meta;
use crate::patch::Patch;
use crate::scanner::{find_call_ref, find_literal_ref};
use crate::vmem::VMem;

const PATTERN_A: &[u8] = &[0xE8, 0x03, 0x00, 0xAA, 0xC0, 0x00, 0x80, 0x52, 0xE8, 0x00, 0x00, 0xB4];
const PATTERN_B: &[u8] = &[0xE8, 0x03, 0x00, 0xAA, 0xE0, 0x07, 0x1F, 0x32, 0xE8, 0x00, 0x00, 0xB4];
const PATTERN_C: &[u8] = &[0xE8, 0x07, 0x1F, 0x32, 0xE0, 0x00, 0x00, 0xB4, 0xC1, 0x00, 0x00, 0xB4];

struct Band {
    pattern: &'static [u8],
    isnotptr: bool,
    isadrl: bool,
}

fn band_for(meta: &Meta) -> Band {
    if meta.vers > 5540 || (meta.vers == 5540 && meta.vers_arr[0] >= 100) {
        Band { pattern: PATTERN_A, isnotptr: false, isadrl: false }
    } else if (3406..=5540).contains(&meta.vers) {
        Band { pattern: PATTERN_B, isnotptr: false, isadrl: false }
    } else {
        Band { pattern: PATTERN_C, isnotptr: true, isadrl: meta.vers <= 1940 }
    }
}

/// Disables Image4 manifest verification (`img4_decode_manifest_exists`)
/// by forcing its interposer callback to always report success.
pub fn get_sigcheck_patch(image: &ByteImage, meta: &Meta) -> Result<Vec<Patch>> {
    let vmem = VMem::new(image);
    let band = band_for(meta);

    let prologue_va = vmem.memmem(band.pattern, None)?;
    let callsite = find_call_ref(vmem, prologue_va)?;

    let mut cursor = callsite;
    let pointer = loop {
        cursor = cursor.forward().ok_or(Error::NotFound("get_sigcheck_patch"))?;
        if band.isadrl {
            if cursor.insn().mnemonic == Mnemonic::Ldr {
                let next = cursor.forward().ok_or(Error::NotFound("get_sigcheck_patch"))?;
                if next.insn().rd == 2 {
                    break next.insn().imm as u64;
                }
            }
        } else if matches!(cursor.insn().mnemonic, Mnemonic::Adr | Mnemonic::Adrp) && cursor.insn().rd == 2 {
            break cursor.insn().imm as u64;
        }
    };

    let callback_va = if band.isnotptr { pointer } else { vmem.deref(pointer)? };

    let mut patches = Vec::new();
    if band.isnotptr {
        patches.push(Patch::new(callback_va, mov_x0_0_ret().to_vec()));
    } else {
        let ret_cursor = walk_to_ret(vmem, callback_va)?;
        patches.push(Patch::new(ret_cursor.va() - 4, mov_x0_0_ret().to_vec()));

        let old_ref_target = ret_cursor.va() + 4;
        if let Ok(old_ref) = find_literal_ref(vmem, old_ref_target, 0) {
            patches.push(Patch::new(old_ref.va(), super::nop_bytes().to_vec()));
        }

        if let Some(next) = ret_cursor.forward() {
            if let Ok(second_ret) = walk_to_ret(vmem, next.va()) {
                patches.push(Patch::new(second_ret.va() - 4, 0xD280_0000u32.to_le_bytes().to_vec()));
            }
        }
    }

    Ok(patches)
}

fn walk_to_ret(vmem: VMem, from: u64) -> Result<crate::cursor::InsnCursor> {
    let mut cursor = crate::cursor::InsnCursor::new(vmem, from)?;
    loop {
        if cursor.insn().mnemonic == Mnemonic::Ret {
            return Ok(cursor);
        }
        cursor = cursor.forward().ok_or(Error::NotFound("walk_to_ret"))?;
    }
}
