// Copyright (c) 2025 the amivm project developers, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

use amivm_types::{HostReg, M68kReg, GUEST_PRESERVED_REGS};

use crate::{
    CodeCursor, OPCODE_CALL_ABS64, OPCODE_GRP1_IMM32, OPCODE_GRP1_IMM8, OPCODE_INT_3,
    OPCODE_JMP_REL32, OPCODE_JMP_REL8, OPCODE_MOV_IMM_REG, OPCODE_MOV_MEM_REG, OPCODE_MOV_REG_REG,
    OPCODE_POPFQ, OPCODE_POP_REG, OPCODE_PUSHFQ, OPCODE_PUSH_REG, OPCODE_RET, OPCODE_TEST_REG_REG,
    OPCODE_TWO_BYTE, PREFIX_REX_B, PREFIX_REX_R, PREFIX_REX_W,
};

/// Operand size of an emitted instruction. `Dword` is the default
/// operand size in long mode; `Qword` adds REX.W.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum OperandWidth {
    Dword,
    Qword,
}

/// Condition of a conditional jump, named after the 680x0 mnemonics it
/// stands in for. The value is the second opcode byte of the `0F 8x`
/// long form.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Cond {
    Eq, // BEQ => JE
    Ne, // BNE => JNE
}

impl Cond {
    fn opcode(self) -> u8 {
        match self {
            Cond::Eq => 0x84,
            Cond::Ne => 0x85,
        }
    }
}

// ModRM byte, mode = 11 (register direct).
fn modrm_reg(reg: HostReg, rm: HostReg) -> u8 {
    0xc0 | (reg.encoding() << 3) | rm.encoding()
}

// ModRM + SIB pair selecting a 32-bit absolute address: mode = 00,
// r/m = 100 (SIB follows), SIB = 00 100 101 (no scale, no index,
// disp32-only base).
fn modrm_abs32(reg: HostReg) -> [u8; 2] {
    [0x04 | (reg.encoding() << 3), 0x25]
}

/// `MOV r, r`: opcode 89 /r, source in reg, destination in r/m.
pub fn move_reg_to_reg(cur: &mut CodeCursor, src: HostReg, dst: HostReg, width: OperandWidth) {
    let mut prefix = 0;
    if width == OperandWidth::Qword {
        prefix |= PREFIX_REX_W;
    }
    if src.is_extended() {
        prefix |= PREFIX_REX_R;
    }
    if dst.is_extended() {
        prefix |= PREFIX_REX_B;
    }
    if prefix != 0 {
        cur.write_u8(prefix);
    }
    cur.write_u8(OPCODE_MOV_REG_REG);
    cur.write_u8(modrm_reg(src, dst));
}

/// `MOV r, imm`: opcode B8+r with a 4-byte immediate, or a full 8-byte
/// immediate with REX.W. The register lives in the opcode byte, so its
/// extension bit is REX.B.
pub fn move_imm_to_reg(cur: &mut CodeCursor, value: u64, reg: HostReg, width: OperandWidth) {
    let mut prefix = 0;
    if width == OperandWidth::Qword {
        prefix |= PREFIX_REX_W;
    }
    if reg.is_extended() {
        prefix |= PREFIX_REX_B;
    }
    if prefix != 0 {
        cur.write_u8(prefix);
    }
    cur.write_u8(OPCODE_MOV_IMM_REG + reg.encoding());
    if width == OperandWidth::Qword {
        cur.write_u64(value);
    } else {
        cur.write_u32(value as u32);
    }
}

/// `MOV r32, [addr32]`: opcode 8B /r with the disp32-only SIB form.
pub fn move_abs_to_reg(cur: &mut CodeCursor, addr: u32, reg: HostReg) {
    if reg.is_extended() {
        cur.write_u8(PREFIX_REX_R);
    }
    cur.write_u8(OPCODE_MOV_MEM_REG);
    let [modrm, sib] = modrm_abs32(reg);
    cur.write_u8(modrm);
    cur.write_u8(sib);
    cur.write_u32(addr);
}

/// `MOV [addr32], r32`: opcode 89 /r with the disp32-only SIB form.
pub fn move_reg_to_abs(cur: &mut CodeCursor, reg: HostReg, addr: u32) {
    if reg.is_extended() {
        cur.write_u8(PREFIX_REX_R);
    }
    cur.write_u8(OPCODE_MOV_REG_REG);
    let [modrm, sib] = modrm_abs32(reg);
    cur.write_u8(modrm);
    cur.write_u8(sib);
    cur.write_u32(addr);
}

/// `PUSH r64`: opcode 50+r. Always 64-bit wide in long mode.
pub fn push_reg(cur: &mut CodeCursor, reg: HostReg) {
    if reg.is_extended() {
        cur.write_u8(PREFIX_REX_B);
    }
    cur.write_u8(OPCODE_PUSH_REG + reg.encoding());
}

/// `POP r64`: opcode 58+r.
pub fn pop_reg(cur: &mut CodeCursor, reg: HostReg) {
    if reg.is_extended() {
        cur.write_u8(PREFIX_REX_B);
    }
    cur.write_u8(OPCODE_POP_REG + reg.encoding());
}

/// `CALL r64`: opcode FF /2.
pub fn call_reg(cur: &mut CodeCursor, reg: HostReg) {
    if reg.is_extended() {
        cur.write_u8(PREFIX_REX_B);
    }
    cur.write_u8(OPCODE_CALL_ABS64);
    cur.write_u8(0xd0 | reg.encoding());
}

/// `ADD r32, imm32`: opcode 81 /0.
pub fn add_imm32_to_reg(cur: &mut CodeCursor, reg: HostReg, value: i32) {
    if reg.is_extended() {
        cur.write_u8(PREFIX_REX_B);
    }
    cur.write_u8(OPCODE_GRP1_IMM32);
    cur.write_u8(0xc0 | reg.encoding());
    cur.write_u32(value as u32);
}

/// `SUB r32, imm8`: opcode 83 /5, immediate sign-extended by the CPU.
pub fn sub_imm8_from_reg(cur: &mut CodeCursor, reg: HostReg, value: u8) {
    if reg.is_extended() {
        cur.write_u8(PREFIX_REX_B);
    }
    cur.write_u8(OPCODE_GRP1_IMM8);
    cur.write_u8(0xe8 | reg.encoding());
    cur.write_u8(value);
}

/// `TEST r32, r32` with both operands the same register; sets ZF/SF
/// from the register value, the host rendition of TST.
pub fn test_reg_reg(cur: &mut CodeCursor, reg: HostReg) {
    let mut prefix = 0;
    if reg.is_extended() {
        // the register appears in both the reg and the r/m field
        prefix |= PREFIX_REX_R | PREFIX_REX_B;
    }
    if prefix != 0 {
        cur.write_u8(prefix);
    }
    cur.write_u8(OPCODE_TEST_REG_REG);
    cur.write_u8(modrm_reg(reg, reg));
}

/// `RET` (near).
pub fn ret(cur: &mut CodeCursor) {
    cur.write_u8(OPCODE_RET);
}

/// `INT3`, the single-byte breakpoint trap.
pub fn int3(cur: &mut CodeCursor) {
    cur.write_u8(OPCODE_INT_3);
}

/// `JMP rel8`.
pub fn jmp_rel8(cur: &mut CodeCursor, disp: i8) {
    cur.write_u8(OPCODE_JMP_REL8);
    cur.write_u8(disp as u8);
}

/// `JMP rel32`.
pub fn jmp_rel32(cur: &mut CodeCursor, disp: i32) {
    cur.write_u8(OPCODE_JMP_REL32);
    cur.write_u32(disp as u32);
}

/// `Jcc rel32`, the two-byte `0F 8x` long form. The short `7x rel8` form
/// is never emitted; translated branch targets are whole cache slots and
/// easily exceed a byte of reach.
pub fn jcc_rel32(cur: &mut CodeCursor, cond: Cond, disp: i32) {
    cur.write_u8(OPCODE_TWO_BYTE);
    cur.write_u8(cond.opcode());
    cur.write_u32(disp as u32);
}

/// Calls an arbitrary 64-bit address from generated code.
///
/// The sequence is self-contained: it saves RBP (which holds guest A5
/// across the call), parks the incoming stack pointer in RBP, aligns RSP
/// to 16 bytes as the System V ABI requires at a call boundary, performs
/// the call through RAX, and restores RSP and RBP. RAX is clobbered;
/// it holds guest A0, which the AmigaOS convention marks caller-saved.
pub fn abs_call(cur: &mut CodeCursor, target: u64) {
    push_reg(cur, HostReg::Rbp);
    move_reg_to_reg(cur, HostReg::Rsp, HostReg::Rbp, OperandWidth::Qword);
    // and rsp, -16
    cur.write_u8(PREFIX_REX_W);
    cur.write_u8(OPCODE_GRP1_IMM8);
    cur.write_u8(0xe4);
    cur.write_u8(0xf0);
    move_imm_to_reg(cur, target, HostReg::Rax, OperandWidth::Qword);
    call_reg(cur, HostReg::Rax);
    move_reg_to_reg(cur, HostReg::Rbp, HostReg::Rsp, OperandWidth::Qword);
    pop_reg(cur, HostReg::Rbp);
}

/// Pushes the guest registers that the AmigaOS calling convention wants
/// preserved and the host convention does not already cover (D2, D3, A2,
/// A4, A6).
pub fn save_guest_regs(cur: &mut CodeCursor) {
    for reg in GUEST_PRESERVED_REGS {
        push_reg(cur, reg.host());
    }
}

/// Mirror image of [`save_guest_regs`].
pub fn restore_guest_regs(cur: &mut CodeCursor) {
    for reg in GUEST_PRESERVED_REGS.iter().rev() {
        pop_reg(cur, reg.host());
    }
}

/// Makes a host call completely invisible to the guest: saves the
/// preserved set plus the scratch registers D0/D1/A0/A1 and RFLAGS.
/// Needed around calls the guest never asked for: the translator
/// callback fires mid-instruction-stream where even caller-saved
/// registers and condition codes are live.
pub fn save_program_state(cur: &mut CodeCursor) {
    save_guest_regs(cur);
    push_reg(cur, M68kReg::D0.host());
    push_reg(cur, M68kReg::D1.host());
    push_reg(cur, M68kReg::A0.host());
    push_reg(cur, M68kReg::A1.host());
    cur.write_u8(OPCODE_PUSHFQ);
}

/// Mirror image of [`save_program_state`].
pub fn restore_program_state(cur: &mut CodeCursor) {
    cur.write_u8(OPCODE_POPFQ);
    pop_reg(cur, M68kReg::A1.host());
    pop_reg(cur, M68kReg::A0.host());
    pop_reg(cur, M68kReg::D1.host());
    pop_reg(cur, M68kReg::D0.host());
    restore_guest_regs(cur);
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use amivm_types::{HostReg, M68kReg};

    use super::{Cond, OperandWidth};
    use crate::CodeCursor;

    fn emit(f: impl FnOnce(&mut CodeCursor)) -> Vec<u8> {
        let mut buf = [0u8; 64];
        let mut cur = CodeCursor::new(&mut buf, 0);
        f(&mut cur);
        cur.written().to_vec()
    }

    #[test]
    fn test_move_imm_to_reg() {
        // mov r8d, 0xffffff80 (MOVEQ #-128, D0)
        assert_eq!(
            emit(|c| super::move_imm_to_reg(c, 0xffff_ff80, HostReg::R8, OperandWidth::Dword)),
            [0x41, 0xb8, 0x80, 0xff, 0xff, 0xff]
        );
        // mov r9d, 0x7f (MOVEQ #127, D1)
        assert_eq!(
            emit(|c| super::move_imm_to_reg(c, 0x7f, HostReg::R9, OperandWidth::Dword)),
            [0x41, 0xb9, 0x7f, 0x00, 0x00, 0x00]
        );
        // mov edi, 0xdeadbeef, a classic register, no prefix
        assert_eq!(
            emit(|c| super::move_imm_to_reg(c, 0xdead_beef, HostReg::Rdi, OperandWidth::Dword)),
            [0xbf, 0xef, 0xbe, 0xad, 0xde]
        );
        // mov rax, imm64
        assert_eq!(
            emit(|c| super::move_imm_to_reg(
                c,
                0x1122_3344_5566_7788,
                HostReg::Rax,
                OperandWidth::Qword
            )),
            [0x48, 0xb8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
    }

    #[test]
    fn test_move_reg_to_reg() {
        // mov r11d, r10d (MOVE.L D2, D3)
        assert_eq!(
            emit(|c| super::move_reg_to_reg(c, HostReg::R10, HostReg::R11, OperandWidth::Dword)),
            [0x45, 0x89, 0xd3]
        );
        // mov rbp, rsp
        assert_eq!(
            emit(|c| super::move_reg_to_reg(c, HostReg::Rsp, HostReg::Rbp, OperandWidth::Qword)),
            [0x48, 0x89, 0xe5]
        );
        // mov esi, r8d (library base from D0 into A6)
        assert_eq!(
            emit(|c| super::move_reg_to_reg(c, HostReg::R8, HostReg::Rsi, OperandWidth::Dword)),
            [0x44, 0x89, 0xc6]
        );
    }

    #[test]
    fn test_move_between_reg_and_absolute() {
        // mov r8d, [0x5555aaaa] (MOVE.L $5555AAAA, D0)
        assert_eq!(
            emit(|c| super::move_abs_to_reg(c, 0x5555_aaaa, HostReg::R8)),
            [0x44, 0x8b, 0x04, 0x25, 0xaa, 0xaa, 0x55, 0x55]
        );
        // mov [0x5555aaaa], r9d (MOVE.L D1, $5555AAAA)
        assert_eq!(
            emit(|c| super::move_reg_to_abs(c, HostReg::R9, 0x5555_aaaa)),
            [0x44, 0x89, 0x0c, 0x25, 0xaa, 0xaa, 0x55, 0x55]
        );
        // mov esi, [0x00000004] (MOVEA.L $4.W, A6), classic register
        assert_eq!(
            emit(|c| super::move_abs_to_reg(c, 0x0000_0004, HostReg::Rsi)),
            [0x8b, 0x34, 0x25, 0x04, 0x00, 0x00, 0x00]
        );
        // mov esp, [0xdeadbeef] (MOVEA.L $DEADBEEF, A7)
        assert_eq!(
            emit(|c| super::move_abs_to_reg(c, 0xdead_beef, HostReg::Rsp)),
            [0x8b, 0x24, 0x25, 0xef, 0xbe, 0xad, 0xde]
        );
    }

    #[test]
    fn test_push_pop() {
        assert_eq!(emit(|c| super::push_reg(c, HostReg::Rsi)), [0x56]);
        assert_eq!(emit(|c| super::push_reg(c, HostReg::R10)), [0x41, 0x52]);
        assert_eq!(emit(|c| super::pop_reg(c, HostReg::Rsi)), [0x5e]);
        assert_eq!(emit(|c| super::pop_reg(c, HostReg::R10)), [0x41, 0x5a]);
    }

    #[test]
    fn test_arithmetic() {
        // sub r10d, 1 (SUBQ.L #1, D2)
        assert_eq!(
            emit(|c| super::sub_imm8_from_reg(c, HostReg::R10, 1)),
            [0x41, 0x83, 0xea, 0x01]
        );
        // test r8d, r8d (TST.L D0)
        assert_eq!(
            emit(|c| super::test_reg_reg(c, HostReg::R8)),
            [0x45, 0x85, 0xc0]
        );
        // add esi, -948 (JSR -948(A6) uses this to reach the entry)
        assert_eq!(
            emit(|c| super::add_imm32_to_reg(c, HostReg::Rsi, -948)),
            [0x81, 0xc6, 0x4c, 0xfc, 0xff, 0xff]
        );
    }

    #[test]
    fn test_jumps() {
        // je rel32 with displacement -2, the long encoding of `BEQ.S *`
        assert_eq!(
            emit(|c| super::jcc_rel32(c, Cond::Eq, -2)),
            [0x0f, 0x84, 0xfe, 0xff, 0xff, 0xff]
        );
        assert_eq!(
            emit(|c| super::jcc_rel32(c, Cond::Ne, 0x100)),
            [0x0f, 0x85, 0x00, 0x01, 0x00, 0x00]
        );
        assert_eq!(
            emit(|c| super::jmp_rel32(c, -5)),
            [0xe9, 0xfb, 0xff, 0xff, 0xff]
        );
        assert_eq!(emit(|c| super::jmp_rel8(c, 126)), [0xeb, 0x7e]);
    }

    #[test]
    fn test_abs_call_sequence() {
        let code = emit(|c| super::abs_call(c, 0x0000_7fff_0000_1234));
        assert_eq!(
            code,
            [
                0x55, // push rbp
                0x48, 0x89, 0xe5, // mov rbp, rsp
                0x48, 0x83, 0xe4, 0xf0, // and rsp, -16
                0x48, 0xb8, 0x34, 0x12, 0x00, 0x00, 0xff, 0x7f, 0x00, 0x00, // mov rax, target
                0xff, 0xd0, // call rax
                0x48, 0x89, 0xec, // mov rsp, rbp
                0x5d, // pop rbp
            ]
        );
    }

    #[test]
    fn test_save_restore_are_mirror_images() {
        // D2 D3 A2 A4 A6 => r10, r11, rdx, rdi, rsi
        assert_eq!(
            emit(super::save_guest_regs),
            [0x41, 0x52, 0x41, 0x53, 0x52, 0x57, 0x56]
        );
        assert_eq!(
            emit(super::restore_guest_regs),
            [0x5e, 0x5f, 0x5a, 0x41, 0x5b, 0x41, 0x5a]
        );

        let save = emit(super::save_program_state);
        let restore = emit(super::restore_program_state);
        // preserved set, then D0, D1, A0, A1, then the flags
        assert_eq!(
            save,
            [
                0x41, 0x52, 0x41, 0x53, 0x52, 0x57, 0x56, // preserved set
                0x41, 0x50, 0x41, 0x51, 0x50, 0x51, // r8, r9, rax, rcx
                0x9c, // pushfq
            ]
        );
        assert_eq!(
            restore,
            [
                0x9d, // popfq
                0x59, 0x58, 0x41, 0x59, 0x41, 0x58, // rcx, rax, r9, r8
                0x5e, 0x5f, 0x5a, 0x41, 0x5b, 0x41, 0x5a, // preserved set
            ]
        );
    }

    #[test]
    fn test_pinned_register_round_trip() {
        // the emitter must honor the pinning table, not its own idea of
        // register numbers
        assert_eq!(
            emit(|c| super::push_reg(c, M68kReg::A6.host())),
            [0x56] // push rsi
        );
        assert_eq!(
            emit(|c| super::push_reg(c, M68kReg::D2.host())),
            [0x41, 0x52] // push r10
        );
    }
}
