// Copyright (c) 2025 the amivm project developers, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

//! x86-64 instruction emitter.
//!
//! Every operation writes the encoding of exactly one host instruction
//! (or one fixed sequence) into a caller-held [`CodeCursor`] and advances
//! it. Emitters are infallible: an impossible register/operand
//! combination is a bug in the caller, not a runtime condition.

pub mod cursor;
pub mod emit;

pub use cursor::CodeCursor;

/* *
 * Instruction format in long mode:
 * - legacy prefix: 0-4 bytes (group 1-4)
 * - REX: 0,1 byte
 * - Opcode: 1,2,3 bytes (3 bytes = 0F + 2 bytes)
 * - ModRM: 0,1 byte (Mod: 2-bit, Reg: 3-bit, R/M: 3-bit)
 * - SIB: 0,1 byte (Scale: 2-bit, Index: 3-bit, Base: 3-bit)
 * - Displacement: 0,1,2,4 bytes
 * - Immediate: 0,1,2,4 bytes (8 bytes only in `MOV r64, imm64`)
 *
 * References:
 *
 * - Intel Software Developer's Manual
 *   Volume 2, Chapter 2.1 INSTRUCTION FORMAT
 *   Volume 2, Appendix B INSTRUCTION FORMATS AND ENCODINGS
 *   https://www.intel.com/content/www/us/en/developer/articles/technical/intel-sdm.html
 * - X86 Opcode and Instruction Reference
 *   http://ref.x86asm.net/coder64.html
 * - x86 and amd64 instruction reference
 *   https://www.felixcloutier.com/x86/
 * */

// REX prefix: 0100WRXB.
// W = 64-bit operand size, R = extends ModRM.reg, X = extends SIB.index,
// B = extends ModRM.r/m, the SIB base, or the opcode register field.
pub const PREFIX_REX_B: u8 = 0x41;
pub const PREFIX_REX_R: u8 = 0x44;
pub const PREFIX_REX_W: u8 = 0x48;

pub const OPCODE_INT_3: u8 = 0xcc;
pub const OPCODE_JMP_REL8: u8 = 0xeb;
pub const OPCODE_JMP_REL32: u8 = 0xe9;
pub const OPCODE_CALL_ABS64: u8 = 0xff;
pub const OPCODE_MOV_REG_REG: u8 = 0x89;
pub const OPCODE_MOV_MEM_REG: u8 = 0x8b;
pub const OPCODE_MOV_IMM_REG: u8 = 0xb8;
pub const OPCODE_TEST_REG_REG: u8 = 0x85;
pub const OPCODE_GRP1_IMM32: u8 = 0x81;
pub const OPCODE_GRP1_IMM8: u8 = 0x83;
pub const OPCODE_RET: u8 = 0xc3;
pub const OPCODE_PUSH_REG: u8 = 0x50;
pub const OPCODE_POP_REG: u8 = 0x58;
pub const OPCODE_PUSHFQ: u8 = 0x9c;
pub const OPCODE_POPFQ: u8 = 0x9d;
pub const OPCODE_NOP: u8 = 0x90;
pub const OPCODE_TWO_BYTE: u8 = 0x0f;
