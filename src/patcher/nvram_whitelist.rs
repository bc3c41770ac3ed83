use super::ret_bytes;
use crate::cursor::InsnCursor;
use crate::error::{Error, Result};
use crate::image::ByteImage;
use crate::insn::Mnemonic;
use crate::patch::Patch;
use crate::scanner::find_literal_ref;
use crate::vmem::VMem;

fn resolve_handler(vmem: &VMem, cmd: &str) -> Result<u64> {
    let mut needle = vec![0u8];
    needle.extend_from_slice(cmd.as_bytes());
    needle.push(0);
    let hit = vmem.memmem(&needle, None)?;
    let name_va = hit + 1;
    let table_entry = vmem.memmem(&name_va.to_le_bytes(), None)?;
    vmem.deref(table_entry + 8)
}

/// Makes `saveenv` a no-op by redirecting its handler's unconditional
/// first branch to a bare `ret`.
pub fn get_nvram_nosave_patch(image: &ByteImage) -> Result<Vec<Patch>> {
    let vmem = VMem::new(image);
    let handler_va = resolve_handler(&vmem, "saveenv")?;

    let cursor = InsnCursor::new(vmem, handler_va)?;
    let insn = cursor.insn();
    if insn.mnemonic != Mnemonic::B {
        return Err(Error::InvalidCursorState("saveenv handler does not open with an unconditional branch".into()));
    }

    Ok(vec![Patch::new(insn.imm as u64, ret_bytes().to_vec())])
}

/// Makes `nvram -d`-style variable removal a no-op. Scans successive
/// `"boot-command"` xrefs until one's command dispatch calls both
/// `remove_env_func` and (within the next three calls) the same
/// `nvram_save_func` that backs `saveenv`, then stubs out
/// `remove_env_func`.
pub fn get_nvram_noremove_patch(image: &ByteImage) -> Result<Vec<Patch>> {
    let vmem = VMem::new(image);
    let save_func = resolve_handler(&vmem, "saveenv")?;
    let anchor = vmem.memstr("boot-command")?;

    let mut skip = 0usize;
    loop {
        let xref = find_literal_ref(vmem, anchor, skip)?;
        skip += 1;

        let mut cursor = xref;
        let remove_env_func = loop {
            cursor = cursor.forward().ok_or(Error::NotFound("get_nvram_noremove_patch"))?;
            if cursor.insn().mnemonic == Mnemonic::Bl {
                break cursor.insn().imm as u64;
            }
        };

        let mut found_save = false;
        let mut bls_checked = 0;
        while bls_checked < 3 {
            cursor = match cursor.forward() {
                Some(c) => c,
                None => break,
            };
            if cursor.insn().mnemonic == Mnemonic::Bl {
                bls_checked += 1;
                if cursor.insn().imm as u64 == save_func {
                    found_save = true;
                    break;
                }
            }
        }

        if found_save {
            return Ok(vec![Patch::new(remove_env_func, ret_bytes().to_vec())]);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::insn;

    fn build_nosave_image() -> (ByteImage<'static>, u64, u64) {
        let base = 0x8000_0000u64;
        let mut buf = vec![0u8; 0x20000];
        buf[0..4].copy_from_slice(&0x9000_0000u32.to_le_bytes());
        buf[0x318..0x320].copy_from_slice(&base.to_le_bytes());

        buf[0x1000..0x1000 + 9].copy_from_slice(b"\0saveenv\0");
        let name_va = base + 0x1001;
        let table_entry = base + 0x1100;
        buf[0x1100..0x1108].copy_from_slice(&name_va.to_le_bytes());

        let handler_va = base + 0x2000;
        buf[0x1108..0x1110].copy_from_slice(&handler_va.to_le_bytes());

        let real_save_target = base + 0x3000;
        let b = insn::new_immediate_b(handler_va, real_save_target);
        buf[0x2000..0x2004].copy_from_slice(&insn::encode(&b).unwrap().to_le_bytes());

        (ByteImage::from_buffer(buf).unwrap(), handler_va, real_save_target)
    }

    #[test]
    fn nosave_redirects_branch_target_to_ret() {
        let (img, _handler_va, target) = build_nosave_image();
        let patches = get_nvram_nosave_patch(&img).unwrap();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].va, target);
        assert_eq!(patches[0].bytes, ret_bytes().to_vec());
    }
}
