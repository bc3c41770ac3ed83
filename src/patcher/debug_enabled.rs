use crate::error::{Error, Result};
use crate::image::ByteImage;
use crate::insn::Mnemonic;
use crate::patch::Patch;
use crate::scanner::find_literal_ref;
use crate::vmem::VMem;

/// Finds the `"debug-enabled"` NVRAM-variable check and forces it to
/// always report enabled by replacing the second `bl` after its xref
/// with `mov x0, #1`.
pub fn get_debug_enabled_patch(image: &ByteImage) -> Result<Vec<Patch>> {
    let vmem = VMem::new(image);
    let anchor = vmem.memstr("debug-enabled")?;
    let xref = find_literal_ref(vmem, anchor, 0)?;

    let mut cursor = xref;
    let mut bls_seen = 0;
    loop {
        cursor = cursor.forward().ok_or(Error::NotFound("get_debug_enabled_patch"))?;
        if cursor.insn().mnemonic == Mnemonic::Bl {
            bls_seen += 1;
            if bls_seen == 2 {
                break;
            }
        }
    }

    let bytes = 0xD2800020u32.to_le_bytes(); // movz x0, #1
    Ok(vec![Patch::new(cursor.va(), bytes.to_vec())])
}
