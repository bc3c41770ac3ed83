use super::{is_branch_imm, nop_bytes};
use crate::error::{Error, Result};
use crate::image::ByteImage;
use crate::meta::Meta;
use crate::patch::Patch;
use crate::scanner::{find_bof, find_call_ref, find_literal_ref};
use crate::vmem::VMem;

/// Forces a fresh APNonce to be generated on every boot by neutralising
/// the branch that would otherwise skip regeneration, two call levels
/// up from the `"com.apple.System.boot-nonce"` NVRAM accessor.
pub fn get_freshnonce_patch(image: &ByteImage, meta: &Meta) -> Result<Vec<Patch>> {
    if meta.stage1 {
        return Ok(Vec::new());
    }

    let vmem = VMem::new(image);
    let anchor = vmem.memstr("com.apple.System.boot-nonce")?;
    let xref = find_literal_ref(vmem, anchor, 0)?;
    let fn1 = find_bof(vmem, xref.va())?;
    let call1 = find_call_ref(vmem, fn1)?;
    let fn2 = find_bof(vmem, call1.va())?;
    let call2 = find_call_ref(vmem, fn2)?;

    let mut cursor = call2;
    loop {
        cursor = cursor.backward().ok_or(Error::NotFound("get_freshnonce_patch"))?;
        if is_branch_imm(cursor.insn().mnemonic) {
            break;
        }
    }

    Ok(vec![Patch::new(cursor.va(), nop_bytes().to_vec())])
}
