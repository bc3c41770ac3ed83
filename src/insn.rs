//! AArch64 decode/encode subset used by the scanner and patchers.
//!
//! Only the mnemonics actually touched by pattern recognition are
//! classified; everything else decodes to [`Mnemonic::Other`] with
//! [`Supertype::Other`] rather than being rejected, so cursors can walk
//! freely over arbitrary code.

use crate::error::{Error, Result};

/// A register operand left unset (mirrors the `-1` sentinel the source
/// uses for "this instruction has no such operand").
pub const NONE: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mnemonic {
    Adr,
    Adrp,
    Add,
    Sub,
    And,
    Orr,
    Movz,
    Movk,
    Movn,
    MovReg,
    Ldr,
    Ldrh,
    Ldrb,
    Str,
    Strh,
    Strb,
    Stp,
    Ldp,
    B,
    Bl,
    Bcond,
    Br,
    Blr,
    Ret,
    Cbz,
    Cbnz,
    Csel,
    Nop,
    /// Anything outside the subset above, carrying the raw word.
    Other(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Supertype {
    General,
    Memory,
    BranchImm,
    BranchReg,
    Other,
}

/// A decoded instruction. `rd`/`rn`/`rm` are register operands (`-1` aka
/// [`NONE`] when not applicable); `imm` is mnemonic-specific (an
/// absolute PC-relative target for `adr`/`adrp`/branches, a scaled byte
/// offset for memory ops, a raw field for `movz`/`movk`). `sf` is 1 for
/// 64-bit (`X`) operand width, 0 for 32-bit (`W`) or byte/half memory
/// ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Insn {
    pub mnemonic: Mnemonic,
    pub supertype: Supertype,
    pub pc: u64,
    pub rd: i32,
    pub rn: i32,
    pub rm: i32,
    pub imm: i64,
    pub sf: u8,
}

impl Insn {
    pub fn is(&self, m: Mnemonic) -> bool {
        self.mnemonic == m
    }

    /// Accessor matching the source's `other()` name for the third
    /// register operand.
    pub fn other(&self) -> i32 {
        self.rm
    }
}

fn sign_extend(value: u32, bits: u32) -> i64 {
    let shift = 32 - bits;
    ((value << shift) as i32 >> shift) as i64
}

fn mask_for(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

fn ror(value: u64, amount: u32, size: u32) -> u64 {
    let amount = amount % size.max(1);
    let v = value & mask_for(size);
    if amount == 0 {
        v
    } else {
        ((v >> amount) | (v << (size - amount))) & mask_for(size)
    }
}

/// `DecodeBitMasks` from the AArch64 reference pseudocode, specialised
/// to the immediate (non-tmask) output used to recognise e.g.
/// `and x0, x0, #1`.
fn decode_logical_immediate(n: u8, imms: u8, immr: u8, data_size: u32) -> Option<u64> {
    let concat = ((n as u32) << 6) | (!(imms as u32) & 0x3f);
    if concat == 0 {
        return None;
    }
    let len = 31 - concat.leading_zeros();
    let levels = (1u32 << len) - 1;
    if (imms as u32 & levels) == levels {
        return None;
    }
    let s = imms as u32 & levels;
    let r = immr as u32 & levels;
    let esize = 1u32 << len;
    let welem = mask_for(s + 1) & mask_for(esize);
    let rotated = ror(welem, r, esize);

    let mut wmask = rotated;
    let mut cur = esize;
    while cur < data_size {
        wmask |= wmask << cur;
        cur *= 2;
    }
    Some(wmask & mask_for(data_size))
}

fn field(word: u32, hi: u32, lo: u32) -> u32 {
    (word >> lo) & ((1u32 << (hi - lo + 1)) - 1)
}

/// Decodes the 32-bit word `word` located at virtual address `pc`.
pub fn decode(word: u32, pc: u64) -> Insn {
    let base = Insn {
        mnemonic: Mnemonic::Other(word),
        supertype: Supertype::Other,
        pc,
        rd: NONE,
        rn: NONE,
        rm: NONE,
        imm: 0,
        sf: 0,
    };

    if word == 0xD503201F {
        return Insn { mnemonic: Mnemonic::Nop, supertype: Supertype::General, ..base };
    }

    // BR / BLR / RET: 1101011 Z 0 op2 11111 000000 Rn 00000
    let branch_reg_fixed = word & 0xFC1F_FC1F;
    let rn = field(word, 9, 5) as i32;
    match branch_reg_fixed {
        0xD61F_0000 => return Insn { mnemonic: Mnemonic::Br, supertype: Supertype::BranchReg, rn, ..base },
        0xD63F_0000 => return Insn { mnemonic: Mnemonic::Blr, supertype: Supertype::BranchReg, rn, ..base },
        0xD65F_0000 => return Insn { mnemonic: Mnemonic::Ret, supertype: Supertype::BranchReg, rn, ..base },
        _ => {}
    }

    // CSEL: sf 00 11010100 Rm cond 00 Rn Rd
    if field(word, 30, 21) == 0b00_1101_0100 && field(word, 11, 10) == 0 {
        let sf = field(word, 31, 31) as u8;
        let rm = field(word, 20, 16) as i32;
        let rn = field(word, 9, 5) as i32;
        let rd = field(word, 4, 0) as i32;
        let cond = field(word, 15, 12) as i64;
        return Insn { mnemonic: Mnemonic::Csel, supertype: Supertype::General, sf, rd, rn, rm, imm: cond, ..base };
    }

    // STP / LDP (general registers, pre/post-index or signed offset):
    // opc(2) 101 V idx(3) L imm7 Rt2 Rn Rt
    if field(word, 29, 27) == 0b101 && field(word, 26, 26) == 0 {
        let opc = field(word, 31, 30);
        let l = field(word, 22, 22);
        let scale = if opc == 0b10 { 3 } else { 2 }; // 64-bit: *8, 32-bit: *4
        let imm7 = field(word, 21, 15);
        let imm = sign_extend(imm7, 7) << scale;
        let rt2 = field(word, 14, 10) as i32;
        let rn = field(word, 9, 5) as i32;
        let rt = field(word, 4, 0) as i32;
        let mnemonic = if l == 1 { Mnemonic::Ldp } else { Mnemonic::Stp };
        let sf = if opc == 0b10 { 1 } else { 0 };
        return Insn { mnemonic, supertype: Supertype::Memory, sf, rd: rt, rn, rm: rt2, imm, ..base };
    }

    // MOVZ / MOVK / MOVN: sf opc 100101 hw imm16 Rd
    if field(word, 28, 23) == 0b100101 {
        let sf = field(word, 31, 31) as u8;
        let opc = field(word, 30, 29);
        let hw = field(word, 22, 21);
        let imm16 = field(word, 20, 5) as i64;
        let rd = field(word, 4, 0) as i32;
        let mnemonic = match opc {
            0b00 => Mnemonic::Movn,
            0b10 => Mnemonic::Movz,
            0b11 => Mnemonic::Movk,
            _ => return Insn { mnemonic: Mnemonic::Other(word), ..base },
        };
        return Insn {
            mnemonic,
            supertype: Supertype::General,
            sf,
            rd,
            rn: NONE,
            rm: hw as i32,
            imm: imm16,
            ..base
        };
    }

    // AND / ORR (immediate, logical immediate): sf opc 100100 N immr imms Rn Rd
    if field(word, 28, 23) == 0b100100 {
        let sf = field(word, 31, 31) as u8;
        let opc = field(word, 30, 29);
        let n = field(word, 22, 22) as u8;
        let immr = field(word, 21, 16) as u8;
        let imms = field(word, 15, 10) as u8;
        let rn = field(word, 9, 5) as i32;
        let rd = field(word, 4, 0) as i32;
        let data_size = if sf == 1 { 64 } else { 32 };
        let mnemonic = match opc {
            0b00 => Some(Mnemonic::And),
            0b01 => Some(Mnemonic::Orr),
            _ => None,
        };
        if let Some(mnemonic) = mnemonic {
            let imm = decode_logical_immediate(n, imms, immr, data_size).unwrap_or(0) as i64;
            return Insn { mnemonic, supertype: Supertype::General, sf, rd, rn, imm, ..base };
        }
    }

    // Logical (shifted register): sf opc 01010 shift N Rm imm6 Rn Rd.
    // We only classify the `mov` alias: ORR Xd, XZR, Xm (shift=0, N=0, imm6=0, Rn=31).
    if field(word, 28, 24) == 0b01010 {
        let sf = field(word, 31, 31) as u8;
        let opc = field(word, 30, 29);
        let shift = field(word, 23, 22);
        let n = field(word, 21, 21);
        let rm = field(word, 20, 16) as i32;
        let imm6 = field(word, 15, 10);
        let rn = field(word, 9, 5);
        let rd = field(word, 4, 0) as i32;
        if opc == 0b01 && shift == 0 && n == 0 && imm6 == 0 && rn == 31 {
            return Insn { mnemonic: Mnemonic::MovReg, supertype: Supertype::General, sf, rd, rn: NONE, rm, ..base };
        }
    }

    // LDR/STR/LDRH/LDRB/STRH/STRB (unsigned immediate offset):
    // size 111 0 01 opc imm12 Rn Rt
    if field(word, 29, 24) == 0b111001 {
        let size = field(word, 31, 30);
        let opc = field(word, 23, 22);
        let imm12 = field(word, 21, 10) as i64;
        let rn = field(word, 9, 5) as i32;
        let rt = field(word, 4, 0) as i32;
        let scale = size;
        let imm = imm12 << scale;
        let (mnemonic, sf) = match (size, opc) {
            (0b11, 0b01) => (Mnemonic::Ldr, 1),
            (0b11, 0b00) => (Mnemonic::Str, 1),
            (0b10, 0b01) => (Mnemonic::Ldr, 0),
            (0b10, 0b00) => (Mnemonic::Str, 0),
            (0b01, 0b01) => (Mnemonic::Ldrh, 0),
            (0b01, 0b00) => (Mnemonic::Strh, 0),
            (0b00, 0b01) => (Mnemonic::Ldrb, 0),
            (0b00, 0b00) => (Mnemonic::Strb, 0),
            _ => return Insn { mnemonic: Mnemonic::Other(word), ..base },
        };
        return Insn { mnemonic, supertype: Supertype::Memory, sf, rd: rt, rn, imm, ..base };
    }

    // ADR / ADRP: op immlo 10000 immhi Rd
    if field(word, 28, 24) == 0b10000 {
        let op = field(word, 31, 31);
        let immlo = field(word, 30, 29);
        let immhi = field(word, 23, 5);
        let imm21 = (immhi << 2) | immlo;
        let rd = field(word, 4, 0) as i32;
        let offset = sign_extend(imm21, 21);
        if op == 0 {
            return Insn { mnemonic: Mnemonic::Adr, supertype: Supertype::General, rd, imm: pc as i64 + offset, ..base };
        } else {
            let page = (pc as i64) & !0xFFF;
            return Insn {
                mnemonic: Mnemonic::Adrp,
                supertype: Supertype::General,
                rd,
                imm: page + (offset << 12),
                ..base
            };
        }
    }

    // ADD / SUB (immediate): sf op S 10001 shift imm12 Rn Rd
    if field(word, 28, 24) == 0b10001 {
        let sf = field(word, 31, 31) as u8;
        let op = field(word, 30, 30);
        let shift = field(word, 23, 22);
        let imm12 = field(word, 21, 10) as i64;
        let rn = field(word, 9, 5) as i32;
        let rd = field(word, 4, 0) as i32;
        let imm = if shift == 1 { imm12 << 12 } else { imm12 };
        let mnemonic = if op == 0 { Mnemonic::Add } else { Mnemonic::Sub };
        return Insn { mnemonic, supertype: Supertype::General, sf, rd, rn, imm, ..base };
    }

    // B / BL: op 00101 imm26
    let top6 = field(word, 31, 26);
    if top6 == 0b000101 || top6 == 0b100101 {
        let imm26 = field(word, 25, 0);
        let offset = sign_extend(imm26, 26) << 2;
        let mnemonic = if top6 == 0b100101 { Mnemonic::Bl } else { Mnemonic::B };
        return Insn { mnemonic, supertype: Supertype::BranchImm, imm: pc as i64 + offset, ..base };
    }

    // B.cond: 0101010 0 imm19 0 cond
    if field(word, 31, 24) == 0b0101_0100 && field(word, 4, 4) == 0 {
        let imm19 = field(word, 23, 5);
        let cond = field(word, 3, 0) as i64;
        let offset = sign_extend(imm19, 19) << 2;
        return Insn {
            mnemonic: Mnemonic::Bcond,
            supertype: Supertype::BranchImm,
            imm: pc as i64 + offset,
            rm: cond as i32,
            ..base
        };
    }

    // CBZ / CBNZ: sf 011010 op imm19 Rt
    if field(word, 30, 25) == 0b011010 {
        let sf = field(word, 31, 31) as u8;
        let op = field(word, 24, 24);
        let imm19 = field(word, 23, 5);
        let rt = field(word, 4, 0) as i32;
        let offset = sign_extend(imm19, 19) << 2;
        let mnemonic = if op == 1 { Mnemonic::Cbnz } else { Mnemonic::Cbz };
        return Insn {
            mnemonic,
            supertype: Supertype::BranchImm,
            sf,
            rd: rt,
            imm: pc as i64 + offset,
            ..base
        };
    }

    base
}

/// Re-encodes an instruction produced by one of the `new_*` constructors
/// below. Decode-only mnemonics (e.g. [`Mnemonic::Stp`], observed but
/// never synthesised by a patcher) are not representable here.
pub fn encode(insn: &Insn) -> Result<u32> {
    match insn.mnemonic {
        Mnemonic::Adr => {
            let offset = insn.imm - insn.pc as i64;
            if !(-(1 << 20)..(1 << 20)).contains(&offset) {
                return Err(Error::Unrepresentable(format!("adr offset {offset} out of range")));
            }
            let imm21 = (offset as i64 as u32) & 0x1F_FFFF;
            let immlo = imm21 & 0b11;
            let immhi = imm21 >> 2;
            Ok((immlo << 29) | (0b10000 << 24) | (immhi << 5) | (insn.rd as u32 & 0x1F))
        }
        Mnemonic::MovReg => {
            let sf = (insn.sf as u32) << 31;
            Ok(sf | (0b01 << 29) | (0b01010 << 24) | ((insn.rm as u32 & 0x1F) << 16) | (0b11111 << 5) | (insn.rd as u32 & 0x1F))
        }
        Mnemonic::Ldr | Mnemonic::Str => {
            let size: u32 = if insn.sf == 1 { 0b11 } else { 0b10 };
            let opc: u32 = if insn.mnemonic == Mnemonic::Ldr { 0b01 } else { 0b00 };
            let scale = size;
            if insn.imm < 0 || insn.imm & ((1 << scale) - 1) != 0 {
                return Err(Error::Unrepresentable(format!("ldr/str offset {} not scale-aligned", insn.imm)));
            }
            let imm12 = (insn.imm >> scale) as u32;
            if imm12 > 0xFFF {
                return Err(Error::Unrepresentable(format!("ldr/str offset {} out of range", insn.imm)));
            }
            Ok((size << 30)
                | (0b111001 << 24)
                | (opc << 22)
                | ((imm12 & 0xFFF) << 10)
                | ((insn.rn as u32 & 0x1F) << 5)
                | (insn.rd as u32 & 0x1F))
        }
        Mnemonic::B | Mnemonic::Bl => {
            let offset = insn.imm - insn.pc as i64;
            if offset % 4 != 0 || !(-(1 << 27)..(1 << 27)).contains(&offset) {
                return Err(Error::Unrepresentable(format!("branch offset {offset} out of range")));
            }
            let imm26 = ((offset >> 2) as i64 as u32) & 0x3FF_FFFF;
            let op: u32 = if insn.mnemonic == Mnemonic::Bl { 1 } else { 0 };
            Ok((op << 31) | (0b00101 << 26) | imm26)
        }
        Mnemonic::Movz | Mnemonic::Movk => {
            if !(0..=0xFFFF).contains(&insn.imm) {
                return Err(Error::Unrepresentable(format!("movz/movk immediate {} out of range", insn.imm)));
            }
            let sf = (insn.sf as u32) << 31;
            let opc: u32 = if insn.mnemonic == Mnemonic::Movz { 0b10 } else { 0b11 };
            let hw = (insn.rm as u32) & 0b11;
            Ok(sf | (opc << 29) | (0b100101 << 23) | (hw << 21) | ((insn.imm as u32 & 0xFFFF) << 5) | (insn.rd as u32 & 0x1F))
        }
        _ => Err(Error::Unrepresentable(format!("{:?} has no encoder", insn.mnemonic))),
    }
}

pub fn new_general_adr(pc: u64, target: u64, rd: i32) -> Insn {
    Insn {
        mnemonic: Mnemonic::Adr,
        supertype: Supertype::General,
        pc,
        rd,
        rn: NONE,
        rm: NONE,
        imm: target as i64,
        sf: 0,
    }
}

pub fn new_register_mov(pc: u64, sf: u8, rd: i32, rm: i32) -> Insn {
    Insn { mnemonic: Mnemonic::MovReg, supertype: Supertype::General, pc, rd, rn: NONE, rm, imm: 0, sf }
}

pub fn new_immediate_ldr(pc: u64, byte_offset: i64, rn: i32, rt: i32) -> Insn {
    Insn { mnemonic: Mnemonic::Ldr, supertype: Supertype::Memory, pc, rd: rt, rn, rm: NONE, imm: byte_offset, sf: 1 }
}

pub fn new_immediate_b(pc: u64, target: u64) -> Insn {
    Insn { mnemonic: Mnemonic::B, supertype: Supertype::BranchImm, pc, rd: NONE, rn: NONE, rm: NONE, imm: target as i64, sf: 0 }
}

pub fn new_immediate_bl(pc: u64, target: u64) -> Insn {
    Insn { mnemonic: Mnemonic::Bl, supertype: Supertype::BranchImm, pc, rd: NONE, rn: NONE, rm: NONE, imm: target as i64, sf: 0 }
}

pub fn new_immediate_movz(pc: u64, imm16: u16, rd: i32, hw: u8) -> Insn {
    Insn { mnemonic: Mnemonic::Movz, supertype: Supertype::General, pc, rd, rn: NONE, rm: hw as i32, imm: imm16 as i64, sf: 1 }
}

pub fn new_immediate_movk(pc: u64, imm16: u16, rd: i32, hw: u8) -> Insn {
    Insn { mnemonic: Mnemonic::Movk, supertype: Supertype::General, pc, rd, rn: NONE, rm: hw as i32, imm: imm16 as i64, sf: 1 }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn decodes_nop() {
        let i = decode(0xD503201F, 0x1000);
        assert_eq!(i.mnemonic, Mnemonic::Nop);
    }

    #[test]
    fn decodes_ret() {
        let i = decode(0xD65F03C0, 0x1000);
        assert_eq!(i.mnemonic, Mnemonic::Ret);
        assert_eq!(i.rn, 30);
    }

    #[test]
    fn decodes_sub_sp_sp_imm() {
        let i = decode(0xD10083FF, 0x1000);
        assert_eq!(i.mnemonic, Mnemonic::Sub);
        assert_eq!(i.rn, 31);
        assert_eq!(i.rd, 31);
        assert_eq!(i.imm, 0x20);
        assert_eq!(i.sf, 1);
    }

    #[test]
    fn decodes_stp_pre_index_fp_lr() {
        let i = decode(0xA9BF7BFD, 0x1000);
        assert_eq!(i.mnemonic, Mnemonic::Stp);
        assert_eq!(i.rd, 29); // x29
        assert_eq!(i.rm, 30); // x30
        assert_eq!(i.rn, 31); // sp
        assert_eq!(i.imm, -0x10);
    }

    #[test]
    fn decodes_and_immediate_one() {
        // and x0, x0, #1  => N=1, immr=0, imms=0, sf=1, opc=00, Rn=Rd=0
        let word = (1u32 << 31) | (0b100100 << 23) | (1 << 22) | (0 << 16) | (0 << 10) | (0 << 5) | 0;
        let i = decode(word, 0x2000);
        assert_eq!(i.mnemonic, Mnemonic::And);
        assert_eq!(i.imm, 1);
    }

    #[test]
    fn adr_encode_decode_round_trip() {
        let pc = 0x8000_1000u64;
        let target = 0x8001_0000u64;
        let insn = new_general_adr(pc, target, 8);
        let word = encode(&insn).unwrap();
        let decoded = decode(word, pc);
        assert_eq!(decoded.mnemonic, Mnemonic::Adr);
        assert_eq!(decoded.rd, 8);
        assert_eq!(decoded.imm, target as i64);
    }

    #[test]
    fn register_mov_round_trip() {
        let insn = new_register_mov(0x1000, 1, 1, 8);
        let word = encode(&insn).unwrap();
        let decoded = decode(word, 0x1000);
        assert_eq!(decoded.mnemonic, Mnemonic::MovReg);
        assert_eq!(decoded.rd, 1);
        assert_eq!(decoded.rm, 8);
    }

    #[test]
    fn immediate_b_round_trip() {
        let pc = 0x8000_2000u64;
        let target = 0x8000_1000u64;
        let insn = new_immediate_b(pc, target);
        let word = encode(&insn).unwrap();
        let decoded = decode(word, pc);
        assert_eq!(decoded.mnemonic, Mnemonic::B);
        assert_eq!(decoded.imm, target as i64);
    }

    #[test]
    fn immediate_movz_movk_round_trip() {
        let pc = 0x1000u64;
        let movz = new_immediate_movz(pc, 0xbeef, 2, 0);
        let word = encode(&movz).unwrap();
        let decoded = decode(word, pc);
        assert_eq!(decoded.mnemonic, Mnemonic::Movz);
        assert_eq!(decoded.imm, 0xbeef);
        assert_eq!(decoded.rd, 2);

        let movk = new_immediate_movk(pc, 0x1234, 2, 1);
        let word = encode(&movk).unwrap();
        let decoded = decode(word, pc);
        assert_eq!(decoded.mnemonic, Mnemonic::Movk);
        assert_eq!(decoded.imm, 0x1234);
        assert_eq!(decoded.rm, 1);
    }

    #[test]
    fn ldr_immediate_round_trip() {
        let insn = new_immediate_ldr(0x1000, 0x18, 3, 5);
        let word = encode(&insn).unwrap();
        let decoded = decode(word, 0x1000);
        assert_eq!(decoded.mnemonic, Mnemonic::Ldr);
        assert_eq!(decoded.imm, 0x18);
        assert_eq!(decoded.rn, 3);
        assert_eq!(decoded.rd, 5);
    }

    #[test]
    fn adr_rejects_out_of_range_target() {
        let insn = new_general_adr(0, 0x10_0000_0000, 0);
        assert!(encode(&insn).is_err());
    }

    #[test]
    fn unknown_word_decodes_to_other() {
        let i = decode(0xFFFF_FFFF, 0x1000);
        assert!(matches!(i.mnemonic, Mnemonic::Other(_)));
        assert_eq!(i.supertype, Supertype::Other);
    }
}
