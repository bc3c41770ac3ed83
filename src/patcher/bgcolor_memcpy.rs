use super::{find_zero_run, ret_bytes};
use crate::cursor::InsnCursor;
use crate::error::{Error, Result};
use crate::image::ByteImage;
use crate::insn::{self, Insn, Mnemonic, Supertype};
use crate::patch::Patch;
use crate::vmem::VMem;

/// `ldrb w3,[x1],#1 ; strb w3,[x0],#1 ; subs x2,x2,#1 ; b.ne -12` — a raw
/// byte-copy loop copying `x2` bytes from `x1` to `x0`.
const COPY_LOOP: [u8; 16] = [0x23, 0x14, 0x40, 0x38, 0x03, 0x14, 0x00, 0x38, 0x42, 0x04, 0x00, 0xF1, 0xA1, 0xFF, 0xFF, 0x54];

fn word_width_ldr(insn: &Insn) -> Result<u32> {
    let rewritten = Insn {
        mnemonic: Mnemonic::Ldr,
        supertype: Supertype::Memory,
        pc: insn.pc,
        rd: insn.rd,
        rn: insn.rn,
        rm: insn::NONE,
        imm: insn.imm,
        sf: 0,
    };
    crate::insn::encode(&rewritten)
}

fn is_memory(insn: &Insn) -> bool {
    insn.supertype == Supertype::Memory
}

/// Repurposes the `bgcolor` console command as a raw `memcpy(dst=x0,
/// src=x1, len=x2)` primitive — a classic jailbreak technique for
/// getting an arbitrary read/write primitive out of an existing,
/// otherwise-harmless command handler.
pub fn replace_bgcolor_with_memcpy(image: &ByteImage) -> Result<Vec<Patch>> {
    let vmem = VMem::new(image);

    let mut needle = vec![0u8];
    needle.extend_from_slice(b"bgcolor");
    needle.push(0);
    let hit = vmem.memmem(&needle, None)?;
    let name_va = hit + 1;
    let table_entry = vmem.memmem(&name_va.to_le_bytes(), None)?;
    let handler_va = vmem.deref(table_entry + 8)?;

    let scratch_va = find_zero_run(vmem, 7, table_entry).ok_or(Error::NotFound("replace_bgcolor_with_memcpy"))?;

    let mut patches = vec![
        Patch::new(scratch_va, b"memcpy\0".to_vec()),
        Patch::new(table_entry, scratch_va.to_le_bytes().to_vec()),
    ];

    let mut cursor = InsnCursor::new(vmem, handler_va)?;
    let mut run: Vec<InsnCursor> = Vec::new();
    loop {
        if is_memory(&cursor.insn()) {
            run.push(cursor);
            if run.len() == 3 {
                break;
            }
        } else {
            run.clear();
        }
        cursor = cursor.forward().ok_or(Error::NotFound("replace_bgcolor_with_memcpy"))?;
    }
    for hit in &run {
        patches.push(Patch::new(hit.va(), word_width_ldr(&hit.insn())?.to_le_bytes().to_vec()));
    }

    loop {
        cursor = cursor.forward().ok_or(Error::NotFound("replace_bgcolor_with_memcpy"))?;
        if cursor.insn().mnemonic == Mnemonic::Bl {
            break;
        }
    }
    let original_word = vmem.read_u32(cursor.va())?;

    let mut body = COPY_LOOP.to_vec();
    body.extend_from_slice(&original_word.to_le_bytes());
    body.extend_from_slice(&ret_bytes());
    patches.push(Patch::new(cursor.va(), body));

    Ok(patches)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::insn as insn_mod;

    fn build_image() -> ByteImage<'static> {
        let base = 0x8000_0000u64;
        let mut buf = vec![0u8; 0x10000];
        buf[0..4].copy_from_slice(&0x9000_0000u32.to_le_bytes());
        buf[0x318..0x320].copy_from_slice(&base.to_le_bytes());

        buf[0x1000..0x1000 + 9].copy_from_slice(b"\0bgcolor\0");
        let name_va = base + 0x1001;
        let table_entry = base + 0x1100;
        buf[0x1100..0x1108].copy_from_slice(&name_va.to_le_bytes());
        let handler_va = base + 0x2000;
        buf[0x1108..0x1110].copy_from_slice(&handler_va.to_le_bytes());

        let ldrh = insn_mod::Insn {
            mnemonic: insn_mod::Mnemonic::Ldrh,
            supertype: insn_mod::Supertype::Memory,
            pc: handler_va,
            rd: 1,
            rn: 0,
            rm: insn_mod::NONE,
            imm: 0,
            sf: 0,
        };
        // Encode ldrh/ldrb by hand since there's no constructor for them.
        let word: u32 = (0b01 << 30) | (0b111001 << 24) | (0b01 << 22) | (0 << 10) | ((ldrh.rn as u32) << 5) | (ldrh.rd as u32);
        buf[0x2000..0x2004].copy_from_slice(&word.to_le_bytes());
        buf[0x2004..0x2008].copy_from_slice(&word.to_le_bytes());
        buf[0x2008..0x200c].copy_from_slice(&word.to_le_bytes());

        let bl = insn_mod::new_immediate_bl(handler_va + 0xc, base + 0x9000);
        buf[0x200c..0x2010].copy_from_slice(&insn_mod::encode(&bl).unwrap().to_le_bytes());

        ByteImage::from_buffer(buf).unwrap()
    }

    #[test]
    fn rewrites_handler_and_name() {
        let img = build_image();
        let patches = replace_bgcolor_with_memcpy(&img).unwrap();
        assert!(patches.iter().any(|p| p.bytes == b"memcpy\0".to_vec()));
        assert!(patches.iter().any(|p| p.va == img.base() + 0x2000));
        assert!(patches.iter().any(|p| p.bytes.len() == 24));
    }
}
