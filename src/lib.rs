//! `ibootpatchfinder`: locates and emits static binary patches against
//! Apple AArch64 iBoot images.
//!
//! The data flow is [`ByteImage`] (owned bytes + load base) ->
//! [`VMem`] (virtual-address view) -> [`InsnCursor`] (position in the
//! instruction stream) -> [`scanner`] (structural pattern search) ->
//! [`patcher`] (per-transformation `image -> Vec<Patch>`). Every
//! patcher is pure; applying patches to produce a patched image is a
//! separate, explicit step ([`ByteImage::apply`]).

pub mod config;
pub mod cursor;
pub mod error;
pub mod image;
pub mod insn;
pub mod meta;
pub mod patch;
pub mod patcher;
pub mod scanner;
pub mod vmem;

pub use config::PatchJob;
pub use error::{Error, Result};
pub use image::ByteImage;
pub use meta::Meta;
pub use patch::Patch;

use log::warn;

/// Runs every transformation enabled in `job` against `image`, merging
/// their patches into one independent set.
///
/// A single transformation's failure (missing anchor, version outside
/// any known band, ...) is logged and that transformation's patches are
/// dropped; the run as a whole still produces whatever the other
/// enabled transformations found. This mirrors §7's "errors from any
/// single patcher abort that patcher only" policy.
pub fn run_job(image: &ByteImage, meta: &Meta, job: &PatchJob) -> Result<Vec<Patch>> {
    let mut patches = Vec::new();

    let mut try_patch = |name: &str, result: Result<Vec<Patch>>| {
        match result {
            Ok(mut p) => patches.append(&mut p),
            Err(e) => warn!("{name}: {e}"),
        }
    };

    if let Some(args) = &job.boot_args {
        try_patch("boot_args", patcher::get_boot_arg_patch(image, meta, args));
    }
    if job.debug_enabled {
        try_patch("debug_enabled", patcher::get_debug_enabled_patch(image));
    }
    if job.sigcheck {
        try_patch("sigcheck", patcher::get_sigcheck_patch(image, meta));
    }
    if job.demotion {
        try_patch("demotion", patcher::get_demotion_patch(image));
    }
    if job.unlock_nvram {
        try_patch("unlock_nvram", patcher::get_unlock_nvram_patch(image, meta));
    }
    if job.nvram_nosave {
        try_patch("nvram_nosave", patcher::get_nvram_nosave_patch(image));
    }
    if job.nvram_noremove {
        try_patch("nvram_noremove", patcher::get_nvram_noremove_patch(image));
    }
    if job.freshnonce {
        try_patch("freshnonce", patcher::get_freshnonce_patch(image, meta));
    }
    if job.bgcolor_memcpy {
        try_patch("bgcolor_memcpy", patcher::replace_bgcolor_with_memcpy(image));
    }
    if job.ra1nra1n {
        try_patch("ra1nra1n", patcher::get_ra1nra1n_patch(image));
    }
    for spec in &job.cmd_handlers {
        try_patch("cmd_handler", patcher::get_cmd_handler_patch(image, &spec.cmd, spec.ptr));
    }

    if !patch::assert_independent(&patches) {
        return Err(Error::InvalidCursorState("combined patch set has overlapping ranges".into()));
    }

    Ok(patches)
}

#[cfg(test)]
mod test {
    use super::*;

    fn synthetic_image() -> ByteImage<'static> {
        let base = 0x8000_0000u64;
        let mut buf = vec![0u8; 0x10000];
        buf[0..4].copy_from_slice(&0x9000_0000u32.to_le_bytes());
        buf[0x318..0x320].copy_from_slice(&base.to_le_bytes());
        buf[0x280..0x280 + 15].copy_from_slice(b"iBoot-1940.0.0\0");
        buf[0x900..0x905].copy_from_slice(b"iBSS\0");
        ByteImage::from_buffer(buf).unwrap()
    }

    #[test]
    fn empty_job_produces_no_patches() {
        let image = synthetic_image();
        let meta = Meta::parse(&image).unwrap();
        let job = PatchJob { image: "iBoot.bin".into(), ..Default::default() };
        let patches = run_job(&image, &meta, &job).unwrap();
        assert!(patches.is_empty());
    }

    #[test]
    fn missing_anchor_is_logged_and_skipped_not_fatal() {
        let image = synthetic_image();
        let meta = Meta::parse(&image).unwrap();
        let job = PatchJob { image: "iBoot.bin".into(), debug_enabled: true, ..Default::default() };
        // "debug-enabled" is absent from the synthetic image; the run
        // must still succeed with an empty patch set rather than erroring.
        let patches = run_job(&image, &meta, &job).unwrap();
        assert!(patches.is_empty());
    }
}
