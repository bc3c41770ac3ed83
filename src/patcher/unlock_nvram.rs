use super::mov_x0_0_ret;
use crate::cursor::InsnCursor;
use crate::error::{Error, Result};
use crate::image::ByteImage;
use crate::insn::Mnemonic;
use crate::meta::Meta;
use crate::patch::Patch;
use crate::scanner::{find_bof, find_literal_ref};
use crate::vmem::VMem;

/// `movz w19, #1` — forces the "write blocked" flag the dev-build
/// shadowed-write check tests to the allowed state.
const MOV_W19_1: u32 = 0x5280_0033;

/// a8x/a9 chip ids place the setenv whitelist array at a fixed offset
/// behind the `"debug-uarts"` xref slot rather than behind a run of
/// non-null pointers.
const FIXED_OFFSET_CHIPIDS: &[i64] = &[7001, 8000, 8003];

/// Defeats the NVRAM variable-name whitelist so arbitrary variables can
/// be set. Stage1 images carry no NVRAM implementation, so this is a
/// no-op there.
pub fn get_unlock_nvram_patch(image: &ByteImage, meta: &Meta) -> Result<Vec<Patch>> {
    if meta.stage1 {
        return Ok(Vec::new());
    }

    let vmem = VMem::new(image);
    let mut patches = Vec::new();

    if meta.dev {
        let anchor_str = if meta.stage2 { "Blocked shadowed write to variable" } else { "nvram_set_var" };
        let anchor_va = vmem.memstr(anchor_str)?;
        let xref = find_literal_ref(vmem, anchor_va, 0)?;
        if meta.stage2 {
            patches.push(Patch::new(xref.va(), MOV_W19_1.to_le_bytes().to_vec()));
        } else {
            let mut cursor = InsnCursor::new(vmem, xref.va())?;
            let orr = loop {
                cursor = cursor.backward().ok_or(Error::NotFound("get_unlock_nvram_patch"))?;
                if cursor.insn().mnemonic == Mnemonic::Orr {
                    break cursor;
                }
            };
            patches.push(Patch::new(orr.va() - 4, mov_x0_0_ret().to_vec()));
        }
        return Ok(patches);
    }

    for array_va in whitelist_arrays(&vmem, meta.chipid)? {
        let xref = find_literal_ref(vmem, array_va, 0)?;
        let bof = find_bof(vmem, xref.va())?;
        patches.push(Patch::new(bof, mov_x0_0_ret().to_vec()));
    }

    let system_anchor = vmem.memstr("com.apple.System.")?;
    let system_xref = find_literal_ref(vmem, system_anchor, 0)?;
    let system_bof = find_bof(vmem, system_xref.va())?;
    patches.push(Patch::new(system_bof, mov_x0_0_ret().to_vec()));

    Ok(patches)
}

/// `"debug-uarts"` sits among the pointer entries of the NULL-terminated
/// setenv whitelist array; this locates the array containing it and the
/// one immediately following (the two arrays "surrounding" the xref).
///
/// a8x/a9 chips (`chipid` 7001/8000/8003) place the array at a fixed
/// 16-byte offset behind the xref slot instead of behind a run of
/// non-null pointers.
fn whitelist_arrays(vmem: &VMem, chipid: Option<i64>) -> Result<Vec<u64>> {
    let anchor_va = vmem.memstr("debug-uarts")?;
    let slot = vmem.memmem(&anchor_va.to_le_bytes(), None)?;

    let start = if chipid.is_some_and(|c| FIXED_OFFSET_CHIPIDS.contains(&c)) {
        slot - 16
    } else {
        let mut start = slot;
        while start > vmem.base() {
            let prev = start - 8;
            match vmem.deref(prev) {
                Ok(0) | Err(_) => break,
                Ok(_) => start = prev,
            }
        }
        start
    };

    let mut end = slot;
    loop {
        match vmem.deref(end) {
            Ok(0) | Err(_) => break,
            Ok(_) => end += 8,
        }
    }
    let second_start = end + 8;

    Ok(vec![start, second_start])
}

#[cfg(test)]
mod test {
    use super::*;

    fn base_image(extra: &[(usize, &[u8])]) -> ByteImage<'static> {
        let base = 0x8000_0000u64;
        let mut buf = vec![0u8; 0x10000];
        buf[0..4].copy_from_slice(&0x9000_0000u32.to_le_bytes());
        buf[0x318..0x320].copy_from_slice(&base.to_le_bytes());
        for (off, bytes) in extra {
            buf[*off..*off + bytes.len()].copy_from_slice(bytes);
        }
        ByteImage::from_buffer(buf).unwrap()
    }

    fn stage1_meta() -> Meta {
        Meta { vers: 1940, vers_arr: [0; 5], stage1: true, stage2: false, dev: false, chipid: None, entrypoint: 0 }
    }

    #[test]
    fn stage1_is_a_no_op() {
        let img = base_image(&[]);
        assert!(get_unlock_nvram_patch(&img, &stage1_meta()).unwrap().is_empty());
    }

    #[test]
    fn dev_stage2_emits_single_flag_patch() {
        let base = 0x8000_0000u64;
        let anchor = b"Blocked shadowed write to variable\0";
        let img = base_image(&[(0x1000, anchor)]);

        let anchor_va = base + 0x1000;
        let xref_va = base + 0x2000;
        let adr = crate::insn::new_general_adr(xref_va, anchor_va, 5);
        let mut buf = img.bytes().to_vec();
        buf[0x2000..0x2004].copy_from_slice(&crate::insn::encode(&adr).unwrap().to_le_bytes());
        let img = ByteImage::from_buffer(buf).unwrap();

        let meta = Meta { vers: 7000, vers_arr: [0; 5], stage1: false, stage2: true, dev: true, chipid: None, entrypoint: 0 };
        let patches = get_unlock_nvram_patch(&img, &meta).unwrap();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].va, xref_va);
        assert_eq!(patches[0].bytes, MOV_W19_1.to_le_bytes().to_vec());
    }
}
