use crate::error::Result;
use crate::image::ByteImage;
use crate::patch::Patch;
use crate::vmem::VMem;

/// Installs `ptr` as the handler for the console command `cmd`.
///
/// iBoot's command table is an array of `{ name: *const c_char, handler:
/// fn }` pairs; this locates the pair whose name points at `cmd` and
/// overwrites its handler slot.
pub fn get_cmd_handler_patch(image: &ByteImage, cmd: &str, ptr: u64) -> Result<Vec<Patch>> {
    let vmem = VMem::new(image);

    let mut needle = vec![0u8];
    needle.extend_from_slice(cmd.as_bytes());
    needle.push(0);
    let hit = vmem.memmem(&needle, None)?;
    let name_va = hit + 1;

    let table_entry = vmem.memmem(&name_va.to_le_bytes(), None)?;
    let handler_slot = table_entry + 8;

    Ok(vec![Patch::new(handler_slot, ptr.to_le_bytes().to_vec())])
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn matches_concrete_scenario() {
        let base = 0x8000_0000u64;
        let mut buf = vec![0u8; 0x40000];
        buf[0..4].copy_from_slice(&0x9000_0000u32.to_le_bytes());
        buf[0x318..0x320].copy_from_slice(&base.to_le_bytes());

        buf[0x30000..0x30000 + 9].copy_from_slice(b"\0bgcolor\0");
        let name_va = base + 0x30001;
        buf[0x30100..0x30108].copy_from_slice(&name_va.to_le_bytes());

        let img = ByteImage::from_buffer(buf).unwrap();
        let patches = get_cmd_handler_patch(&img, "bgcolor", 0xDEAD_BEEF_CAFE_BABE).unwrap();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].va, base + 0x30108);
        assert_eq!(patches[0].bytes, 0xDEAD_BEEF_CAFE_BABEu64.to_le_bytes().to_vec());
    }
}
