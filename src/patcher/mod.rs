//! Per-transformation orchestrators. Each function is a pure
//! `(&ByteImage, &Meta, ...) -> Result<Vec<Patch>>` — no mutation, no
//! retained state, `NotFound`/`UnrecognisedVersion`/etc. on a missing
//! anchor aborting just that transformation.

mod bgcolor_memcpy;
mod boot_arg;
mod cmd_handler;
mod debug_enabled;
mod demotion;
mod freshnonce;
mod nvram_whitelist;
mod ra1nra1n;
mod sigcheck;
mod unlock_nvram;

pub use bgcolor_memcpy::replace_bgcolor_with_memcpy;
pub use boot_arg::get_boot_arg_patch;
pub use cmd_handler::get_cmd_handler_patch;
pub use debug_enabled::get_debug_enabled_patch;
pub use demotion::get_demotion_patch;
pub use freshnonce::get_freshnonce_patch;
pub use nvram_whitelist::{get_nvram_noremove_patch, get_nvram_nosave_patch};
pub use ra1nra1n::get_ra1nra1n_patch;
pub use sigcheck::get_sigcheck_patch;
pub use unlock_nvram::get_unlock_nvram_patch;

use crate::insn::{self, Mnemonic};
use crate::vmem::VMem;

/// Scans forward from `after` for a run of at least `min_len` zero
/// bytes, returning its starting address. Used to relocate strings and
/// scratch buffers into otherwise-unused image padding.
pub(crate) fn find_zero_run(vmem: VMem, min_len: u64, after: u64) -> Option<u64> {
    let mut run_start = after;
    let mut run_len = 0u64;
    let mut va = after;
    while va < vmem.end() {
        match vmem.read_u8(va) {
            Ok(0) => {
                if run_len == 0 {
                    run_start = va;
                }
                run_len += 1;
                if run_len >= min_len {
                    return Some(run_start);
                }
            }
            _ => run_len = 0,
        }
        va += 1;
    }
    None
}

/// `mov x0, #0` followed by `ret` — the canonical "always succeed /
/// always return zero" stub body used by several transformations.
pub(crate) fn mov_x0_0_ret() -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&0xD2800000u32.to_le_bytes()); // movz x0, #0
    out[4..].copy_from_slice(&0xD65F03C0u32.to_le_bytes()); // ret
    out
}

pub(crate) fn ret_bytes() -> [u8; 4] {
    0xD65F03C0u32.to_le_bytes()
}

pub(crate) fn nop_bytes() -> [u8; 4] {
    0xD503201Fu32.to_le_bytes()
}

/// Encodes `mov xd, xm` (the `orr` register-move alias), 64-bit.
pub(crate) fn mov_reg_bytes(rd: i32, rm: i32) -> [u8; 4] {
    let insn = insn::new_register_mov(0, 1, rd, rm);
    insn::encode(&insn).expect("mov reg is always representable").to_le_bytes()
}

pub(crate) fn is_branch_imm(m: Mnemonic) -> bool {
    matches!(m, Mnemonic::B | Mnemonic::Bl | Mnemonic::Bcond | Mnemonic::Cbz | Mnemonic::Cbnz)
}
