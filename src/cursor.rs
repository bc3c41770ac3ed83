use crate::error::{Error, Result};
use crate::insn::{decode, Insn, Mnemonic};
use crate::vmem::VMem;

/// A position in an instruction stream. Cheap to copy; stepping produces
/// a new cursor rather than mutating in place, though `let mut c = ...;
/// c = c.forward()...` reads just as naturally as increment-and-assign.
#[derive(Clone, Copy, Debug)]
pub struct InsnCursor<'a> {
    vmem: VMem<'a>,
    va: u64,
}

impl<'a> InsnCursor<'a> {
    pub fn new(vmem: VMem<'a>, va: u64) -> Result<Self> {
        if va % 4 != 0 {
            return Err(Error::InvalidCursorState(format!("0x{va:x} is not instruction-aligned")));
        }
        if !vmem.contains(va) {
            return Err(Error::OutOfBounds { va });
        }
        Ok(InsnCursor { vmem, va })
    }

    pub fn va(&self) -> u64 {
        self.va
    }

    pub fn vmem(&self) -> VMem<'a> {
        self.vmem
    }

    /// Decodes the instruction at the cursor's current position.
    pub fn insn(&self) -> Insn {
        let word = self.vmem.read_u32(self.va).expect("cursor va is always in range");
        decode(word, self.va)
    }

    pub fn forward(&self) -> Option<InsnCursor<'a>> {
        InsnCursor::new(self.vmem, self.va + 4).ok()
    }

    pub fn backward(&self) -> Option<InsnCursor<'a>> {
        if self.va < self.vmem.base().checked_add(4)? {
            return None;
        }
        InsnCursor::new(self.vmem, self.va - 4).ok()
    }

    /// Reseats the cursor at `va`, as if freshly constructed.
    pub fn seek(&mut self, va: u64) -> Result<()> {
        *self = InsnCursor::new(self.vmem, va)?;
        Ok(())
    }
}

impl<'a> Iterator for InsnCursor<'a> {
    type Item = Insn;

    fn next(&mut self) -> Option<Insn> {
        let insn = self.insn();
        *self = self.forward()?;
        Some(insn)
    }
}

impl<'a> PartialEq<Mnemonic> for InsnCursor<'a> {
    fn eq(&self, other: &Mnemonic) -> bool {
        self.insn().mnemonic == *other
    }
}

impl<'a> PartialEq for InsnCursor<'a> {
    fn eq(&self, other: &Self) -> bool {
        self.va == other.va
    }
}
