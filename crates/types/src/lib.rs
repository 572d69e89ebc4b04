// Copyright (c) 2025 the amivm project developers, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

pub mod layout;

use std::fmt::{self, Display};

/* *
 * The guest register file and its pinning onto the host.
 *
 * The 680x0 has 16 general purpose 32-bit registers, 8 data registers
 * (D0..D7) and 8 address registers (A0..A7, where A7 is the stack
 * pointer). Each of them is assigned a fixed host register for the whole
 * lifetime of the process:
 *
 * - D0..D7 live in R8D..R15D, the registers that need a REX prefix.
 * - A0..A6 live in the classic registers EAX, ECX, EDX, EBX, EDI, EBP, ESI.
 * - A7 must live in ESP so that guest pushes, pops and returns work on
 *   the host stack directly. ESP occupies the slot A4 would get if the
 *   address registers were assigned in encoding order, so A4 and A7 swap
 *   places and A4 ends up in EDI.
 *
 * The numbering of `HostReg` follows the combined scheme used by the
 * emitter: values 0..7 are the REX-extended registers (the value is the
 * 3-bit field that goes into the encoding), values 8..15 are the classic
 * registers in hardware order (value - 8 is the 3-bit field).
 * */

/// A 680x0 register, numbered 0..15 (D0..D7, A0..A7).
#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum M68kReg {
    D0 = 0,
    D1,
    D2,
    D3,
    D4,
    D5,
    D6,
    D7,
    A0 = 8,
    A1,
    A2,
    A3,
    A4,
    A5,
    A6,
    A7,
}

const GUEST_REGS: [M68kReg; 16] = [
    M68kReg::D0,
    M68kReg::D1,
    M68kReg::D2,
    M68kReg::D3,
    M68kReg::D4,
    M68kReg::D5,
    M68kReg::D6,
    M68kReg::D7,
    M68kReg::A0,
    M68kReg::A1,
    M68kReg::A2,
    M68kReg::A3,
    M68kReg::A4,
    M68kReg::A5,
    M68kReg::A6,
    M68kReg::A7,
];

impl M68kReg {
    /// Builds a register from the 4-bit index used in the library
    /// argument descriptors: 0..7 are D0..D7, 8..15 are A0..A7.
    pub fn from_index(index: u8) -> Option<Self> {
        GUEST_REGS.get(index as usize).copied()
    }

    /// Builds a data register from the 3-bit register field of an opcode.
    pub fn data(number: u8) -> Self {
        GUEST_REGS[(number & 0x07) as usize]
    }

    /// Builds an address register from the 3-bit register field of an opcode.
    pub fn addr(number: u8) -> Self {
        GUEST_REGS[(8 | (number & 0x07)) as usize]
    }

    pub fn index(self) -> u8 {
        self as u8
    }

    /// The host register this guest register is pinned to.
    pub fn host(self) -> HostReg {
        HOST_REG_FOR_GUEST_REG[self as usize]
    }
}

impl Display for M68kReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let index = *self as u8;
        if index < 8 {
            write!(f, "D{}", index)
        } else {
            write!(f, "A{}", index - 8)
        }
    }
}

/// A host register in the combined numbering scheme of the emitter:
/// 0..7 are R8..R15 (REX-extended), 8..15 are the classic registers in
/// hardware encoding order.
#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum HostReg {
    R8 = 0,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rax = 8,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
}

impl HostReg {
    /// Whether the register needs a REX extension bit (R8..R15).
    pub fn is_extended(self) -> bool {
        (self as u8) < 8
    }

    /// The 3-bit register field that goes into the opcode, ModRM or SIB
    /// byte. The missing fourth bit is carried by the REX prefix.
    pub fn encoding(self) -> u8 {
        (self as u8) & 0x07
    }
}

/// Guest register pinning, indexed by `M68kReg`. This table is the single
/// source of truth; emitters must never hard-code host register numbers
/// for guest registers.
pub const HOST_REG_FOR_GUEST_REG: [HostReg; 16] = [
    HostReg::R8,  // D0
    HostReg::R9,  // D1
    HostReg::R10, // D2
    HostReg::R11, // D3
    HostReg::R12, // D4
    HostReg::R13, // D5
    HostReg::R14, // D6
    HostReg::R15, // D7
    HostReg::Rax, // A0
    HostReg::Rcx, // A1
    HostReg::Rdx, // A2
    HostReg::Rbx, // A3
    HostReg::Rdi, // A4, swapped with ESP
    HostReg::Rbp, // A5
    HostReg::Rsi, // A6
    HostReg::Rsp, // A7, swapped with EDI
];

/// Registers used for passing integer arguments, in order, as specified
/// by the System V x86-64 ABI.
pub const HOST_ARG_REGS: [HostReg; 6] = [
    HostReg::Rdi,
    HostReg::Rsi,
    HostReg::Rdx,
    HostReg::Rcx,
    HostReg::R8,
    HostReg::R9,
];

// Registers that have to be preserved across a library call by the
// AmigaOS calling convention but are caller-saved (or argument registers)
// on the host. See the Amiga Guru book, page 45. D4..D7 and A3 sit in
// host callee-saved registers (R12..R15, RBX) and A5/A7 sit in RBP/RSP,
// so the called function's prologue already covers those.
pub const GUEST_PRESERVED_REGS: [M68kReg; 5] = [
    M68kReg::D2,
    M68kReg::D3,
    M68kReg::A2,
    M68kReg::A4,
    M68kReg::A6,
];

/* *
 * Library function tables.
 *
 * A native library delivers its API as a table of rows, terminated by a
 * row whose offset is 0. Each row describes one entry of the library's
 * jump table:
 *
 * - `offset`: the positive offset that guest code subtracts from the
 *   library base address to reach the jump-table entry.
 * - `name`: the function name, for diagnostics.
 * - `arg_regs`: the argument register descriptor, a string of hex digits
 *   read from the right: argument count, return register, then the
 *   registers of arguments 1..n. Digit values 0..7 are D0..D7, 8..15
 *   (written `8`..`F`) are A0..A7. `"0902"` reads: 2 arguments,
 *   arg1 in A1, arg2 in D0, result in D0.
 * - `func`: the native implementation, or `None` for a function the
 *   library does not implement (the jump-table entry then raises a trap).
 * */

/// Address of a native `extern "C"` function, stored untyped because the
/// signatures differ per row. The thunk synthesizer only needs the raw
/// address for the call sequence it emits.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct NativeFunc(pub usize);

// Crossing the shared-object boundary as an array, so the field order
// must not depend on layout optimization. Both sides are Rust; the
// string slices never leave the process.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct FuncInfo {
    pub offset: u16,
    pub name: &'static str,
    pub arg_regs: &'static str,
    pub func: Option<NativeFunc>,
}

impl FuncInfo {
    pub fn new(offset: u16, name: &'static str, arg_regs: &'static str) -> Self {
        Self {
            offset,
            name,
            arg_regs,
            func: None,
        }
    }

    pub fn implemented(
        offset: u16,
        name: &'static str,
        arg_regs: &'static str,
        func: NativeFunc,
    ) -> Self {
        Self {
            offset,
            name,
            arg_regs,
            func: Some(func),
        }
    }

    /// The terminator row of a function table.
    pub fn end() -> Self {
        Self::new(0, "", "")
    }
}

/// Name of the `extern "C"` symbol a native library exports. Calling it
/// yields a pointer to the first row of the library's function table.
pub const FUNC_TABLE_SYMBOL: &str = "amiga_library_functions";

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{HostReg, M68kReg};

    #[test]
    fn test_guest_register_pinning() {
        // data registers occupy the REX-extended half
        assert_eq!(M68kReg::D0.host(), HostReg::R8);
        assert_eq!(M68kReg::D7.host(), HostReg::R15);
        assert!(M68kReg::D3.host().is_extended());

        // the stack pointers of both machines must coincide
        assert_eq!(M68kReg::A7.host(), HostReg::Rsp);
        // ... which displaces A4 into EDI
        assert_eq!(M68kReg::A4.host(), HostReg::Rdi);

        assert_eq!(M68kReg::A3.host(), HostReg::Rbx);
        assert_eq!(M68kReg::A6.host(), HostReg::Rsi);
    }

    #[test]
    fn test_host_register_encoding() {
        assert_eq!(HostReg::R8.encoding(), 0);
        assert_eq!(HostReg::R15.encoding(), 7);
        assert_eq!(HostReg::Rax.encoding(), 0);
        assert_eq!(HostReg::Rdi.encoding(), 7);
        assert!(!HostReg::Rsp.is_extended());
    }

    #[test]
    fn test_register_from_descriptor_index() {
        assert_eq!(M68kReg::from_index(0), Some(M68kReg::D0));
        assert_eq!(M68kReg::from_index(9), Some(M68kReg::A1));
        assert_eq!(M68kReg::from_index(15), Some(M68kReg::A7));
        assert_eq!(M68kReg::from_index(16), None);
    }
}
