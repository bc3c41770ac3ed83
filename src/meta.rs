//! Image metadata extracted once at construction: version, stage, build
//! variant, chip id. Every patcher conditions its behaviour on these
//! fields rather than re-deriving them.

use log::debug;

use crate::error::{Error, Result};
use crate::image::ByteImage;
use crate::insn::Mnemonic;
use crate::scanner::find_literal_ref;
use crate::vmem::VMem;

const VERS_STR_OFFSET: usize = 0x280;
const MODE_STR_OFFSET: usize = 0x240;

/// This crate follows the convention used by the buffer-backed
/// constructor in the upstream source: for `vers < 3000`, `iBSS`/`iBEC`
/// (not `iBootStage1`/`iBootStage2`) mark Stage1/Stage2. See DESIGN.md.
const STAGE1_TAG_NEW: &str = "iBootStage1";
const STAGE2_TAG_NEW: &str = "iBootStage2";
const STAGE1_TAG_OLD: &str = "iBSS";
const STAGE2_TAG_OLD: &str = "iBEC";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Meta {
    pub vers: i64,
    pub vers_arr: [i64; 5],
    pub stage1: bool,
    pub stage2: bool,
    pub dev: bool,
    pub chipid: Option<i64>,
    pub entrypoint: u64,
}

fn parse_version_tail(tail: &str) -> Result<(i64, [i64; 5])> {
    // tail looks like "7429.0.1.0.0" or similar dot-separated digits.
    let mut parts = tail.split('.');
    let vers: i64 = parts
        .next()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| Error::InvalidImage("unparsable iBoot version".into()))?;
    let mut arr = [0i64; 5];
    for (slot, part) in arr.iter_mut().zip(parts) {
        *slot = part.trim().parse().unwrap_or(0);
    }
    Ok((vers, arr))
}

impl Meta {
    pub fn parse(image: &ByteImage) -> Result<Meta> {
        let vers_str = image.read_cstr(VERS_STR_OFFSET)?;
        if !vers_str.starts_with("iBoot") {
            return Err(Error::InvalidImage("missing iBoot version tag".into()));
        }
        let tail = vers_str.trim_start_matches("iBoot").trim_start_matches('-');
        let (vers, vers_arr) = parse_version_tail(tail)?;

        let mode_str = image.read_cstr(MODE_STR_OFFSET).unwrap_or("");
        let dev = mode_str.starts_with("DEVELOPMENT");

        let (stage1_tag, stage2_tag) = if vers < 3000 {
            (STAGE1_TAG_OLD, STAGE2_TAG_OLD)
        } else {
            (STAGE1_TAG_NEW, STAGE2_TAG_NEW)
        };
        let vmem = VMem::new(image);
        let stage1 = vmem.memstr(stage1_tag).is_ok();
        let stage2 = !stage1 && vmem.memstr(stage2_tag).is_ok();

        let chipid = if stage1 { None } else { chipid_of(image, &vmem).ok() };

        let entrypoint = image.base();

        debug!("parsed iBoot meta: vers={vers} stage1={stage1} stage2={stage2} dev={dev} chipid={chipid:?}");
        Ok(Meta { vers, vers_arr, stage1, stage2, dev, chipid, entrypoint })
    }

    /// True for `vers >= 7429`, or `vers == 6723` with `vers_arr[0] >= 100`
    /// — iBoot builds whose boot-args xref chain adds an extra branch hop.
    pub fn is_new_style(&self) -> bool {
        self.vers >= 7429 || (self.vers == 6723 && self.vers_arr[0] >= 100)
    }
}

fn chipid_of(image: &ByteImage, vmem: &VMem) -> Result<i64> {
    let anchor = vmem.memstr("platform-name")?;
    let xref = find_literal_ref(*vmem, anchor, 0)?;
    let mut cursor = xref;
    // The chip-id numeric string is referenced by the instruction
    // immediately following the "platform-name" xref.
    cursor = cursor.forward().ok_or(Error::NotFound("chipid"))?;
    let insn = cursor.insn();
    let str_va = match insn.mnemonic {
        Mnemonic::Adr | Mnemonic::Adrp => insn.imm as u64,
        _ => return Err(Error::NotFound("chipid")),
    };
    let offset = image.offset_of(str_va)?;
    let s = image.read_cstr(offset)?;
    s.trim()
        .trim_start_matches("0x")
        .parse()
        .or_else(|_| i64::from_str_radix(s.trim().trim_start_matches("0x"), 16))
        .map_err(|_| Error::InvalidImage(format!("unparsable chip id string {s:?}")))
}
