use crate::error::Result;
use crate::image::ByteImage;
use crate::insn::Mnemonic;
use crate::patch::Patch;
use crate::scanner::find_literal_ref;
use crate::vmem::VMem;

/// Demote-register constants referenced by the device-state check this
/// patcher defeats. Duplicates are intentional: a constant can be
/// referenced from more than one call site, and each occurrence gets
/// its own independent scan and patch.
const DEMOTE_REGISTERS: &[u64] = &[
    0x3F50_0000,
    0x3F50_0000,
    0x3F50_0000,
    0x481B_C000,
    0x481B_C000,
    0x20E0_2A000,
    0x2102_BC000,
    0x2102_BC000,
    0x2352_BC000,
];

/// `movz x0, #0`.
fn mov_x0_0() -> [u8; 4] {
    0xD280_0000u32.to_le_bytes()
}

/// For each demote-register constant, if it is referenced anywhere in
/// the image, neutralises the `and ..., #1` gate that follows it.
pub fn get_demotion_patch(image: &ByteImage) -> Result<Vec<Patch>> {
    let vmem = VMem::new(image);
    let mut patches = Vec::new();

    for &register in DEMOTE_REGISTERS {
        let xref = match find_literal_ref(vmem, register, 0) {
            Ok(cursor) => cursor,
            Err(_) => continue,
        };

        let mut cursor = xref;
        let found_and = loop {
            let insn = cursor.insn();
            if insn.mnemonic == Mnemonic::And && insn.imm == 1 {
                break Some(cursor);
            }
            match cursor.forward() {
                Some(next) => cursor = next,
                None => break None,
            }
        };

        if let Some(and_cursor) = found_and {
            patches.push(Patch::new(and_cursor.va(), mov_x0_0().to_vec()));
        }
    }

    Ok(patches)
}
