use crate::error::{Error, Result};
use crate::image::ByteImage;
use crate::insn::{self, Mnemonic};
use crate::patch::Patch;
use crate::scanner::find_bof;
use crate::vmem::VMem;

/// Anchor bytes for `movz x18, #0`, used by the bootrom-exploit payload
/// to locate its own injection point.
const ANCHOR_A: [u8; 4] = [0x12, 0x00, 0x80, 0xd2];

/// Anchor bytes for `msr tpidrro_el0, x3`, found inside the `bzero`
/// stub this transformation hijacks as a trampoline.
const ANCHOR_B: [u8; 4] = [0x23, 0x74, 0x0b, 0xd5];

const TRAMPOLINE: [u8; 20] = [
    0x20, 0x00, 0x80, 0xd2, // movz x0, #1
    0x21, 0x00, 0x80, 0xd2, // movz x1, #1
    0x02, 0x00, 0x00, 0x14, // b +8
    0x00, 0x00, 0x00, 0x00, // (payload continuation, left zeroed)
    0x00, 0x00, 0x00, 0x00,
];

const NOP: u32 = 0xD503201F;
const NOPS_NEEDED: usize = 10;

const SHELLCODE: [u8; 32] = [
    0xe0, 0x03, 0x13, 0xaa, 0xe1, 0x03, 0x14, 0xaa, 0xe2, 0x03, 0x15, 0xaa, 0xe3, 0x03, 0x16, 0xaa,
    0xe4, 0x03, 0x17, 0xaa, 0xe5, 0x03, 0x18, 0xaa, 0xe6, 0x03, 0x19, 0xaa, 0xe7, 0x03, 0x1a, 0xaa,
];

/// Installs the `ra1nra1n`-style bootrom trampoline: patches a
/// `movz x18, #0` landmark directly with shellcode-entry bytes, then
/// repurposes the `bzero` stub (found from a second landmark) as a
/// launchpad by redirecting its first instruction into a run of spare
/// `nop`s, emitting the payload there, and restoring `bzero`'s original
/// behaviour afterwards.
pub fn get_ra1nra1n_patch(image: &ByteImage) -> Result<Vec<Patch>> {
    let vmem = VMem::new(image);

    let anchor_a = vmem.memmem(&ANCHOR_A, None)?;
    let mut patches = vec![Patch::new(anchor_a, TRAMPOLINE.to_vec())];

    let anchor_b = vmem.memmem(&ANCHOR_B, None)?;
    let bzero = find_bof(vmem, anchor_b)?;

    let original_first_word = vmem.read_u32(bzero)?;

    let nops_va = find_run_of_nops(&vmem, bzero)?;

    let b_to_nops = insn::new_immediate_b(bzero, nops_va);
    patches.push(Patch::new(bzero, insn::encode(&b_to_nops)?.to_le_bytes().to_vec()));

    let mut body = SHELLCODE.to_vec();
    body.extend_from_slice(&original_first_word.to_le_bytes());
    let b_back = insn::new_immediate_b(nops_va + body.len() as u64, bzero + 4);
    body.extend_from_slice(&insn::encode(&b_back)?.to_le_bytes());
    patches.push(Patch::new(nops_va, body));

    Ok(patches)
}

fn find_run_of_nops(vmem: &VMem, after: u64) -> Result<u64> {
    let mut va = after;
    while va < vmem.end() {
        let mut run_start = va;
        let mut run_len = 0usize;
        let mut probe = va;
        while probe < vmem.end() && vmem.read_u32(probe)? == NOP {
            if run_len == 0 {
                run_start = probe;
            }
            run_len += 1;
            probe += 4;
            if run_len == NOPS_NEEDED {
                return Ok(run_start);
            }
        }
        va += 4;
    }
    Err(Error::NotFound("get_ra1nra1n_patch"))
}
