// Copyright (c) 2025 the amivm project developers, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

use amivm_types::M68kReg;

use crate::{reader::GuestReader, TranslateError};

/* *
 * Operand decoding.
 *
 * The 680x0 encodes an operand as a 6-bit field of two 3-bit halves,
 * mode and register:
 *
 * | mode | reg | addressing mode                  | extension words  |
 * |------|-----|----------------------------------|------------------|
 * | 000  | n   | data register Dn                 | none             |
 * | 001  | n   | address register An              | none             |
 * | 101  | n   | (d16, An)                        | one (the d16)    |
 * | 111  | 000 | absolute short                   | one              |
 * | 111  | 001 | absolute long                    | two              |
 * | 111  | 100 | immediate                        | two (.L only)    |
 *
 * Everything else (postincrement, predecrement, indexed, PC-relative)
 * is not supported. See the M68000 Family Programmer's Reference
 * Manual, section 2.2 "Effective Addressing Modes".
 * */

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Operand {
    DataReg(M68kReg),
    AddrReg(M68kReg),
    /// Address register indirect with a signed 16-bit displacement.
    AddrRegOffset { reg: M68kReg, offset: i16 },
    /// Absolute memory address (the short form is zero-extended).
    Absolute(u32),
    /// 32-bit immediate.
    Immediate(u32),
}

/// Decodes one operand from a mode/register field, consuming its
/// extension words from the instruction stream.
pub fn extract_operand(
    mode_reg: u8,
    input: &mut GuestReader,
) -> Result<Operand, TranslateError> {
    match mode_reg {
        0x00..=0x07 => Ok(Operand::DataReg(M68kReg::data(mode_reg))),
        0x08..=0x0f => Ok(Operand::AddrReg(M68kReg::addr(mode_reg))),
        0x28..=0x2f => Ok(Operand::AddrRegOffset {
            reg: M68kReg::addr(mode_reg),
            offset: input.read_word() as i16,
        }),
        0x38 => Ok(Operand::Absolute(u32::from(input.read_word()))),
        0x39 => Ok(Operand::Absolute(input.read_dword())),
        0x3c => Ok(Operand::Immediate(input.read_dword())),
        _ => Err(TranslateError::UnsupportedAddressingMode { mode_reg }),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use amivm_types::M68kReg;

    use super::{extract_operand, Operand};
    use crate::reader::GuestReader;

    fn extract(mode_reg: u8, ext: &[u8]) -> Operand {
        let mut input = unsafe { GuestReader::from_ptr(ext.as_ptr()) };
        extract_operand(mode_reg, &mut input).unwrap()
    }

    #[test]
    fn test_register_operands() {
        assert_eq!(extract(0x02, &[]), Operand::DataReg(M68kReg::D2));
        assert_eq!(extract(0x0e, &[]), Operand::AddrReg(M68kReg::A6));
    }

    #[test]
    fn test_indirect_with_offset() {
        assert_eq!(
            extract(0x2e, &[0xfc, 0x4c]),
            Operand::AddrRegOffset {
                reg: M68kReg::A6,
                offset: -948
            }
        );
    }

    #[test]
    fn test_memory_and_immediate_operands() {
        assert_eq!(extract(0x38, &[0x00, 0x04]), Operand::Absolute(4));
        assert_eq!(
            extract(0x39, &[0xde, 0xad, 0xbe, 0xef]),
            Operand::Absolute(0xdead_beef)
        );
        assert_eq!(
            extract(0x3c, &[0x55, 0x55, 0xaa, 0xaa]),
            Operand::Immediate(0x5555_aaaa)
        );
    }

    #[test]
    fn test_unsupported_modes_are_rejected() {
        // (A2)+ postincrement
        let mut input = unsafe { GuestReader::from_ptr([].as_ptr()) };
        assert!(extract_operand(0x1a, &mut input).is_err());
        // PC-relative
        let mut input = unsafe { GuestReader::from_ptr([].as_ptr()) };
        assert!(extract_operand(0x3a, &mut input).is_err());
    }
}
