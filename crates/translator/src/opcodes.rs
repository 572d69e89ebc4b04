// Copyright (c) 2025 the amivm project developers, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

use amivm_codegen::{emit, emit::Cond, emit::OperandWidth, CodeCursor};
use amivm_types::{
    layout::{ABS_EXEC_BASE, EXEC_BASE_SLOT},
    M68kReg,
};
use log::debug;

use crate::{
    operand::{extract_operand, Operand},
    reader::GuestReader,
    TranslateError, Translator,
};

/// An opcode handler consumes the remaining sub-fields of the primary
/// opcode word plus any extension words from `input` and emits the
/// equivalent host instructions into `out`. Handlers for non-terminal
/// instructions must not emit control transfers.
pub(crate) type OpcodeHandler = fn(
    &mut Translator,
    u16,
    &mut GuestReader,
    &mut CodeCursor,
) -> Result<(), TranslateError>;

/// One row of the opcode table.
pub(crate) struct OpcodeInfo {
    pub handler: OpcodeHandler,
    /// Mask applied to the primary opcode word before matching.
    pub mask: u16,
    /// Value the masked opcode must equal.
    pub pattern: u16,
    /// Bitmask of the effective-address modes the instruction accepts.
    pub ea_mask: u16,
    /// Whether the instruction ends a translation unit.
    pub terminal: bool,
}

// Motorola M68000 Family Programmer's Reference Manual, page 4-116
// Intel SDM Volume 2, MOV - Move
fn move_long(
    _t: &mut Translator,
    opcode: u16,
    input: &mut GuestReader,
    out: &mut CodeCursor,
) -> Result<(), TranslateError> {
    debug!("translating instruction MOVE");
    if opcode & 0x3000 != 0x2000 {
        return Err(TranslateError::UnsupportedSize { mnemonic: "MOVE" });
    }

    let src = extract_operand((opcode & 0x003f) as u8, input)?;
    // the destination field has its mode and register halves swapped
    let dst_field = (opcode & 0x0fc0) >> 6;
    let dst_mode_reg = ((dst_field & 0x07) << 3) | ((dst_field & 0x38) >> 3);
    let dst = extract_operand(dst_mode_reg as u8, input)?;

    match (src, dst) {
        (Operand::Absolute(addr), Operand::DataReg(reg)) => {
            emit::move_abs_to_reg(out, addr, reg.host());
        }
        (Operand::Immediate(value), Operand::DataReg(reg)) => {
            emit::move_imm_to_reg(out, u64::from(value), reg.host(), OperandWidth::Dword);
        }
        (Operand::DataReg(reg), Operand::Absolute(addr)) => {
            emit::move_reg_to_abs(out, reg.host(), addr);
        }
        (Operand::DataReg(src), Operand::DataReg(dst)) => {
            emit::move_reg_to_reg(out, src.host(), dst.host(), OperandWidth::Dword);
        }
        _ => return Err(TranslateError::UnsupportedOperands { mnemonic: "MOVE" }),
    }
    Ok(())
}

// Motorola M68000 Family Programmer's Reference Manual, page 4-119
//
// A source reading the absolute address 4 is after the Exec library
// base; that cell cannot exist on the host (the kernel refuses mappings
// near page zero), so the access is rewritten to the page the
// supervisor stores the base pointer at. This is a semantic rewrite of
// a guest ABI constant, not an optimization.
fn movea_long(
    _t: &mut Translator,
    opcode: u16,
    input: &mut GuestReader,
    out: &mut CodeCursor,
) -> Result<(), TranslateError> {
    debug!("translating instruction MOVEA");
    if opcode & 0x3000 != 0x2000 {
        return Err(TranslateError::UnsupportedSize { mnemonic: "MOVEA" });
    }

    let areg = M68kReg::addr(((opcode & 0x0e00) >> 9) as u8);
    let src = extract_operand((opcode & 0x003f) as u8, input)?;

    match src {
        Operand::Absolute(addr) => {
            let addr = if addr == ABS_EXEC_BASE {
                EXEC_BASE_SLOT
            } else {
                addr
            };
            emit::move_abs_to_reg(out, addr, areg.host());
        }
        Operand::Immediate(value) => {
            emit::move_imm_to_reg(out, u64::from(value), areg.host(), OperandWidth::Dword);
        }
        Operand::DataReg(src) | Operand::AddrReg(src) => {
            emit::move_reg_to_reg(out, src.host(), areg.host(), OperandWidth::Dword);
        }
        _ => return Err(TranslateError::UnsupportedOperands { mnemonic: "MOVEA" }),
    }
    Ok(())
}

// Motorola M68000 Family Programmer's Reference Manual, page 4-134
fn moveq(
    _t: &mut Translator,
    opcode: u16,
    _input: &mut GuestReader,
    out: &mut CodeCursor,
) -> Result<(), TranslateError> {
    // the 8-bit immediate is sign-extended to 32 bits
    let value = (opcode & 0x00ff) as u8 as i8 as i32;
    let reg = M68kReg::data(((opcode & 0x0e00) >> 9) as u8);
    debug!("translating instruction MOVEQ #{}, {}", value, reg);
    emit::move_imm_to_reg(out, value as u32 as u64, reg.host(), OperandWidth::Dword);
    Ok(())
}

// Motorola M68000 Family Programmer's Reference Manual, page 4-181
fn subq_long(
    _t: &mut Translator,
    opcode: u16,
    input: &mut GuestReader,
    out: &mut CodeCursor,
) -> Result<(), TranslateError> {
    debug!("translating instruction SUBQ");
    if opcode & 0x00c0 != 0x0080 {
        return Err(TranslateError::UnsupportedSize { mnemonic: "SUBQ" });
    }
    // the 3-bit data field encodes 1..8, with 8 stored as 0
    let value = match (opcode & 0x0e00) >> 9 {
        0 => 8,
        n => n as u8,
    };
    match extract_operand((opcode & 0x003f) as u8, input)? {
        Operand::DataReg(reg) => emit::sub_imm8_from_reg(out, reg.host(), value),
        _ => return Err(TranslateError::UnsupportedOperands { mnemonic: "SUBQ" }),
    }
    Ok(())
}

// Motorola M68000 Family Programmer's Reference Manual, page 4-193
//
// TST compares against an implicit zero; the host equivalent is TEST
// with the register in both operand positions, which sets ZF and SF the
// same way.
fn tst_long(
    _t: &mut Translator,
    opcode: u16,
    input: &mut GuestReader,
    out: &mut CodeCursor,
) -> Result<(), TranslateError> {
    debug!("translating instruction TST");
    if opcode & 0x00c0 != 0x0080 {
        return Err(TranslateError::UnsupportedSize { mnemonic: "TST" });
    }
    match extract_operand((opcode & 0x003f) as u8, input)? {
        Operand::DataReg(reg) => emit::test_reg_reg(out, reg.host()),
        _ => return Err(TranslateError::UnsupportedOperands { mnemonic: "TST" }),
    }
    Ok(())
}

// Motorola M68000 Family Programmer's Reference Manual, page 4-109
//
// The only supported form is the library call, `JSR d16(A6)`: the guest
// subtracts a jump-table offset from the library base in A6 and calls
// through the result. The emitted sequence computes the entry address
// in A6's host register itself and restores it afterwards, so A6 still
// holds the library base when the callee returns.
fn jsr(
    _t: &mut Translator,
    opcode: u16,
    input: &mut GuestReader,
    out: &mut CodeCursor,
) -> Result<(), TranslateError> {
    debug!("translating instruction JSR");
    match extract_operand((opcode & 0x003f) as u8, input)? {
        Operand::AddrRegOffset {
            reg: M68kReg::A6,
            offset,
        } => {
            let base = M68kReg::A6.host();
            emit::push_reg(out, base);
            emit::add_imm32_to_reg(out, base, i32::from(offset));
            emit::call_reg(out, base);
            emit::pop_reg(out, base);
            Ok(())
        }
        _ => Err(TranslateError::UnsupportedOperands { mnemonic: "JSR" }),
    }
}

// Motorola M68000 Family Programmer's Reference Manual, page 4-169
fn rts(
    _t: &mut Translator,
    _opcode: u16,
    _input: &mut GuestReader,
    out: &mut CodeCursor,
) -> Result<(), TranslateError> {
    debug!("translating instruction RTS");
    emit::ret(out);
    Ok(())
}

// Motorola M68000 Family Programmer's Reference Manual, page 4-25
// Intel SDM Volume 2, Jcc - Jump if Condition Is Met
//
// A conditional branch ends the translation unit. Both continuations,
// the branch target and the instruction after the branch, get a cache
// slot reserved here (with a translation stub if they are new), and the
// emitted code is a long-form Jcc to the taken slot followed by an
// unconditional jump to the fall-through slot. Neither continuation is
// translated now; their stubs translate them on first execution. The
// displacement of the guest branch counts from the address right after
// the opcode word, so the extension-word length has to be taken back
// out. (Scheme after the VMware binary-translation paper,
// https://www.vmware.com/pdf/asplos235_adams.pdf)
fn bcc(
    t: &mut Translator,
    opcode: u16,
    input: &mut GuestReader,
    out: &mut CodeCursor,
) -> Result<(), TranslateError> {
    debug!("translating instruction BCC");
    let (offset, ext_len) = match opcode & 0x00ff {
        0x0000 => (i32::from(input.read_word() as i16), 2),
        0x00ff => (input.read_dword() as i32, 4),
        disp => (i32::from(disp as u8 as i8), 0),
    };

    let cond = match opcode & 0x0f00 {
        0x0600 => Cond::Ne,
        0x0700 => Cond::Eq,
        _ => {
            return Err(TranslateError::UnsupportedCondition {
                cond: opcode & 0x0f00,
            })
        }
    };

    let taken_addr = (i64::from(input.addr()) + i64::from(offset) - ext_len) as u32;
    let fallthrough_addr = input.addr();

    let taken_slot = t.setup_tu_inner(taken_addr)? as u64;
    let fallthrough_slot = t.setup_tu_inner(fallthrough_addr)? as u64;

    // Jcc rel32 is 6 bytes, JMP rel32 is 5; displacements count from
    // the end of their instruction.
    let disp = branch_disp(taken_slot, out.addr() + 6)?;
    emit::jcc_rel32(out, cond, disp);
    let disp = branch_disp(fallthrough_slot, out.addr() + 5)?;
    emit::jmp_rel32(out, disp);
    Ok(())
}

fn branch_disp(target: u64, after: u64) -> Result<i32, TranslateError> {
    i32::try_from(target as i64 - after as i64).map_err(|_| TranslateError::BranchOutOfRange)
}

/* *
 * The opcode table.
 *
 * Rows must be ordered by the number of set mask bits, descending, so
 * that among the rows matching an opcode the most specific one wins
 * when the 65536-entry lookup table is expanded. The effective-address
 * mask columns come from the M68000 instruction summaries; the bit
 * assignment matches `valid_ea_mode`.
 * */
pub(crate) static OPCODE_INFO_TBL: [OpcodeInfo; 10] = [
    // handler      mask    pattern ea-mask terminal
    OpcodeInfo { handler: rts,        mask: 0xffff, pattern: 0x4e75, ea_mask: 0x000, terminal: true },
    OpcodeInfo { handler: tst_long,   mask: 0xffc0, pattern: 0x4a80, ea_mask: 0xbf8, terminal: false },
    OpcodeInfo { handler: jsr,        mask: 0xffc0, pattern: 0x4e80, ea_mask: 0x27b, terminal: false },
    OpcodeInfo { handler: subq_long,  mask: 0xf1c0, pattern: 0x5180, ea_mask: 0xff8, terminal: false },
    OpcodeInfo { handler: movea_long, mask: 0xf1c0, pattern: 0x2040, ea_mask: 0xfff, terminal: false },
    OpcodeInfo { handler: moveq,      mask: 0xf100, pattern: 0x7000, ea_mask: 0x000, terminal: false },
    OpcodeInfo { handler: bcc,        mask: 0xf000, pattern: 0x6000, ea_mask: 0x000, terminal: true },
    OpcodeInfo { handler: move_long,  mask: 0xf000, pattern: 0x1000, ea_mask: 0xbff, terminal: false },
    OpcodeInfo { handler: move_long,  mask: 0xf000, pattern: 0x3000, ea_mask: 0xfff, terminal: false },
    OpcodeInfo { handler: move_long,  mask: 0xf000, pattern: 0x2000, ea_mask: 0xfff, terminal: false },
];

// Checks an opcode's effective-address field against the instruction's
// allowed-mode mask.
fn valid_ea_mode(opcode: u16, mask: u16) -> bool {
    if mask == 0 {
        return true;
    }
    match opcode & 0x3f {
        0x00..=0x07 => mask & 0x800 != 0, // Dn
        0x08..=0x0f => mask & 0x400 != 0, // An
        0x10..=0x17 => mask & 0x200 != 0, // (An)
        0x18..=0x1f => mask & 0x100 != 0, // (An)+
        0x20..=0x27 => mask & 0x080 != 0, // -(An)
        0x28..=0x2f => mask & 0x040 != 0, // (d16,An)
        0x30..=0x37 => mask & 0x020 != 0, // (d8,An,Xn)
        0x38 => mask & 0x010 != 0,        // (xxx).W
        0x39 => mask & 0x008 != 0,        // (xxx).L
        0x3a => mask & 0x002 != 0,        // (d16,PC)
        0x3b => mask & 0x001 != 0,        // (d8,PC,Xn)
        0x3c => mask & 0x004 != 0,        // #imm
        _ => false,
    }
}

/// Expands the opcode table into a lookup indexed by the primary opcode
/// word. Unresolved entries stay `None`.
pub(crate) fn build_lookup_table() -> Vec<Option<&'static OpcodeInfo>> {
    debug!("building opcode handler table");
    let mut table: Vec<Option<&'static OpcodeInfo>> = vec![None; 0x10000];
    for (value, entry) in table.iter_mut().enumerate() {
        let opcode = value as u16;
        for info in &OPCODE_INFO_TBL {
            if opcode & info.mask != info.pattern {
                continue;
            }
            // MOVE also has a destination effective-address field, with
            // mode and register swapped; its legal destination modes
            // are the data-alterable ones
            if info.handler == (move_long as OpcodeHandler)
                && !valid_ea_mode(((opcode >> 9) & 0x07) | ((opcode >> 3) & 0x38), 0xbf8)
            {
                continue;
            }
            if valid_ea_mode(opcode, info.ea_mask) {
                *entry = Some(info);
                break;
            }
        }
    }
    table
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use amivm_codegen::CodeCursor;
    use amivm_tlcache::TranslationCache;

    use super::build_lookup_table;
    use crate::{reader::GuestReader, TranslateError, Translator};

    // Runs a single instruction from `guest` through its handler and
    // returns the emitted host bytes.
    fn translate_one(guest: &[u8]) -> Result<Vec<u8>, TranslateError> {
        let cache = TranslationCache::with_region_size(4096).unwrap();
        let mut translator = Translator::new(cache);
        let table = build_lookup_table();

        let mut input = unsafe { GuestReader::from_ptr(guest.as_ptr()) };
        let opcode = input.read_word();
        let info = table[opcode as usize].ok_or(TranslateError::UnknownOpcode {
            opcode,
            addr: input.addr(),
        })?;

        let mut buf = [0u8; 64];
        let mut out = CodeCursor::new(&mut buf, 0x7000_0000);
        (info.handler)(&mut translator, opcode, &mut input, &mut out)?;
        Ok(out.written().to_vec())
    }

    #[test]
    fn test_moveq() {
        // moveq #-128, d0 => mov r8d, 0xffffff80
        assert_eq!(
            translate_one(&[0x70, 0x80]).unwrap(),
            [0x41, 0xb8, 0x80, 0xff, 0xff, 0xff]
        );
        // moveq #127, d1 => mov r9d, 0x7f
        assert_eq!(
            translate_one(&[0x72, 0x7f]).unwrap(),
            [0x41, 0xb9, 0x7f, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_move_long() {
        // move.l $5555aaaa, d0 => mov r8d, [0x5555aaaa]
        assert_eq!(
            translate_one(&[0x20, 0x39, 0x55, 0x55, 0xaa, 0xaa]).unwrap(),
            [0x44, 0x8b, 0x04, 0x25, 0xaa, 0xaa, 0x55, 0x55]
        );
        // move.l #$5555aaaa, d1 => mov r9d, 0x5555aaaa
        assert_eq!(
            translate_one(&[0x22, 0x3c, 0x55, 0x55, 0xaa, 0xaa]).unwrap(),
            [0x41, 0xb9, 0xaa, 0xaa, 0x55, 0x55]
        );
        // move.l d1, $5555aaaa => mov [0x5555aaaa], r9d
        assert_eq!(
            translate_one(&[0x23, 0xc1, 0x55, 0x55, 0xaa, 0xaa]).unwrap(),
            [0x44, 0x89, 0x0c, 0x25, 0xaa, 0xaa, 0x55, 0x55]
        );
        // move.l d2, d3 => mov r11d, r10d
        assert_eq!(translate_one(&[0x26, 0x02]).unwrap(), [0x45, 0x89, 0xd3]);
    }

    #[test]
    fn test_movea_long() {
        // movea.l #$deadbeef, a4 => mov edi, 0xdeadbeef
        assert_eq!(
            translate_one(&[0x28, 0x7c, 0xde, 0xad, 0xbe, 0xef]).unwrap(),
            [0xbf, 0xef, 0xbe, 0xad, 0xde]
        );
        // movea.l $deadbeef, a7 => mov esp, [0xdeadbeef]
        assert_eq!(
            translate_one(&[0x2e, 0x79, 0xde, 0xad, 0xbe, 0xef]).unwrap(),
            [0x8b, 0x24, 0x25, 0xef, 0xbe, 0xad, 0xde]
        );
        // movea.l d0, a6 => mov esi, r8d
        assert_eq!(translate_one(&[0x2c, 0x40]).unwrap(), [0x44, 0x89, 0xc6]);
    }

    #[test]
    fn test_movea_rewrites_the_exec_base_address() {
        // movea.l $4.w, a6: address 4 cannot be mapped on the host, the
        // read goes to the page holding the Exec base pointer instead
        assert_eq!(
            translate_one(&[0x2c, 0x78, 0x00, 0x04]).unwrap(),
            [0x8b, 0x34, 0x25, 0x00, 0x00, 0x30, 0x00]
        );
    }

    #[test]
    fn test_subq_long() {
        // subq.l #1, d2 => sub r10d, 1
        assert_eq!(
            translate_one(&[0x53, 0x82]).unwrap(),
            [0x41, 0x83, 0xea, 0x01]
        );
        // subq.l #8, d0: the quick field stores 8 as 0
        assert_eq!(
            translate_one(&[0x51, 0x80]).unwrap(),
            [0x41, 0x83, 0xe8, 0x08]
        );
    }

    #[test]
    fn test_tst_long() {
        // tst.l d0 => test r8d, r8d
        assert_eq!(translate_one(&[0x4a, 0x80]).unwrap(), [0x45, 0x85, 0xc0]);
    }

    #[test]
    fn test_jsr_library_call() {
        // jsr -948(a6): push the base, add the (negative) jump-table
        // offset, call through, restore the base
        assert_eq!(
            translate_one(&[0x4e, 0xae, 0xfc, 0x4c]).unwrap(),
            [
                0x56, // push rsi
                0x81, 0xc6, 0x4c, 0xfc, 0xff, 0xff, // add esi, -948
                0xff, 0xd6, // call rsi
                0x5e, // pop rsi
            ]
        );
    }

    #[test]
    fn test_rts() {
        assert_eq!(translate_one(&[0x4e, 0x75]).unwrap(), [0xc3]);
    }

    #[test]
    fn test_unknown_and_unsupported_opcodes() {
        assert!(matches!(
            translate_one(&[0xff, 0xff]),
            Err(TranslateError::UnknownOpcode { opcode: 0xffff, .. })
        ));
        // jsr through anything but d16(A6) is not a library call
        assert!(matches!(
            translate_one(&[0x4e, 0xa9, 0x00, 0x10]), // jsr 16(a1)
            Err(TranslateError::UnsupportedOperands { mnemonic: "JSR" })
        ));
        // move.b is in the table but only long operations translate
        assert!(matches!(
            translate_one(&[0x10, 0x01]), // move.b d1, d0
            Err(TranslateError::UnsupportedSize { mnemonic: "MOVE" })
        ));
    }

    #[test]
    fn test_lookup_table_expansion() {
        let table = build_lookup_table();
        // unresolved entries stay empty
        assert!(table[0xffff].is_none());
        assert!(table[0x0000].is_none());
        // rts is an exact match
        assert!(table[0x4e75].is_some());
        // movea.l wins over the less specific move.l row
        let movea = table[0x2c40].unwrap();
        assert_eq!(movea.mask, 0xf1c0);
        // move.l with an immediate destination is not encodable
        assert!(table[0x29c0].is_none());
    }
}
