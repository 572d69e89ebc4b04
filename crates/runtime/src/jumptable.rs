// Copyright (c) 2025 the amivm project developers, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

//! Library jump-table synthesis.
//!
//! AmigaOS dispatches a library call by subtracting a per-function
//! offset from the library base address and calling through the result.
//! The entries of an Amiga jump table were 6 bytes apart, not enough
//! for an absolute jump to a 64-bit target, so every library gets
//! *two* tables in one memory block:
//!
//! ```text
//! block start                                    block end = pseudo base
//!     | thunk table, growing forward ... gap ... | dispatch table |
//!                                   entry = pseudo base - offset ↑
//! ```
//!
//! The dispatch table sits at the end of the block and the block's end
//! address is what the guest receives as library base. Each of its
//! entries is either a 5-byte relative jump into the thunk table, or a
//! single INT3 for a function without a native implementation; the
//! supervisor treats that trap as "guest called an unimplemented
//! library function".
//!
//! A thunk adapts the guest's register-based calling convention to the
//! System V ABI: it saves the registers AmigaOS wants preserved, moves
//! the argument registers named by the row's descriptor into the host
//! argument registers, calls the native function, moves the result back
//! into the guest's return register, restores, and returns. Thunks are
//! plain host code; they never re-enter the translator.

use std::slice;

use log::debug;

use amivm_codegen::{emit, emit::OperandWidth, CodeCursor, OPCODE_INT_3, OPCODE_JMP_REL32};
use amivm_types::{FuncInfo, HostReg, M68kReg, NativeFunc, HOST_ARG_REGS};

use crate::RuntimeError;

/// Argument and result registers of one library function, decoded from
/// its descriptor string (see [`FuncInfo`]).
#[derive(Debug, PartialEq, Eq)]
pub struct ArgSpec {
    pub args: Vec<M68kReg>,
    pub ret: M68kReg,
}

/// Decodes a descriptor: read from the right, the digits are the
/// argument count, the return register, and the registers of arguments
/// 1..n.
pub fn parse_arg_spec(name: &str, desc: &str) -> Result<ArgSpec, RuntimeError> {
    let bad = || RuntimeError::BadDescriptor {
        name: name.to_string(),
        desc: desc.to_string(),
    };

    let digits = desc
        .chars()
        .map(|c| c.to_digit(16).map(|d| d as u8))
        .collect::<Option<Vec<u8>>>()
        .ok_or_else(bad)?;
    if digits.len() < 2 {
        return Err(bad());
    }

    let count = digits[digits.len() - 1] as usize;
    if digits.len() != count + 2 {
        return Err(bad());
    }
    if count > HOST_ARG_REGS.len() {
        return Err(RuntimeError::TooManyArgs {
            name: name.to_string(),
        });
    }

    let ret = M68kReg::from_index(digits[digits.len() - 2]).ok_or_else(bad)?;
    let args = (0..count)
        .map(|n| M68kReg::from_index(digits[digits.len() - 3 - n]).ok_or_else(bad))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ArgSpec { args, ret })
}

// Target of the call every thunk opens with; makes guest library
// traffic visible in the debug log.
extern "C" fn log_library_call(name: *const u8, len: usize) {
    let name = unsafe { slice::from_raw_parts(name, len) };
    debug!("calling library function {}()", String::from_utf8_lossy(name));
}

// Emits one thunk into `buf` and returns its length.
//
// Argument moves are 32-bit, which zero-extends guest pointers into the
// full host registers. The moves run in argument order and the host
// argument registers double as the pinned homes of A4, A6, A2, A1, D0
// and D1; AmigaOS never passes arguments in A4/A6, and the remaining
// overlaps only clobber a register after every argument sourcing it has
// been moved.
fn emit_thunk(buf: &mut [u8], base: u64, row: &FuncInfo, spec: &ArgSpec, target: NativeFunc) -> usize {
    let mut cur = CodeCursor::new(buf, base);
    emit::save_guest_regs(&mut cur);

    // The log call clobbers the caller-saved registers, and several of
    // them are the pinned homes of guest argument registers that still
    // have to be marshaled below, so it runs under a full program
    // state save.
    emit::save_program_state(&mut cur);
    emit::move_imm_to_reg(
        &mut cur,
        row.name.as_ptr() as u64,
        HOST_ARG_REGS[0],
        OperandWidth::Qword,
    );
    emit::move_imm_to_reg(
        &mut cur,
        row.name.len() as u64,
        HOST_ARG_REGS[1],
        OperandWidth::Qword,
    );
    emit::abs_call(&mut cur, log_library_call as usize as u64);
    emit::restore_program_state(&mut cur);

    for (n, reg) in spec.args.iter().enumerate() {
        emit::move_reg_to_reg(&mut cur, reg.host(), HOST_ARG_REGS[n], OperandWidth::Dword);
    }
    emit::abs_call(&mut cur, target.0 as u64);
    emit::move_reg_to_reg(&mut cur, HostReg::Rax, spec.ret.host(), OperandWidth::Dword);

    emit::restore_guest_regs(&mut cur);
    emit::ret(&mut cur);
    cur.pos()
}

/// Builds both jump tables for a library into `region` (mapped at host
/// address `region_base`). The guest's pseudo base pointer for the
/// library is the region's end address; `rows` must not include the
/// table terminator.
pub fn synthesize_jump_tables(
    region: &mut [u8],
    region_base: u64,
    rows: &[FuncInfo],
) -> Result<(), RuntimeError> {
    let region_len = region.len();
    let lowest_entry = region_len
        .checked_sub(
            rows.iter()
                .map(|row| row.offset as usize)
                .max()
                .unwrap_or(0),
        )
        .ok_or(RuntimeError::TableOverflow)?;
    let mut thunk_pos = 0;

    for row in rows {
        let entry = region_len
            .checked_sub(row.offset as usize)
            .ok_or(RuntimeError::TableOverflow)?;
        if entry >= region_len {
            return Err(RuntimeError::TableOverflow);
        }

        let Some(target) = row.func else {
            // no native implementation: raise SIGTRAP on the spot
            region[entry] = OPCODE_INT_3;
            continue;
        };
        if entry + 5 > region_len {
            return Err(RuntimeError::TableOverflow);
        }

        debug!("creating jump table entry for function {}()", row.name);
        let spec = parse_arg_spec(row.name, row.arg_regs)?;

        // thunks are emitted to a scratch buffer first so the dispatch
        // entry and the thunk can land in the same slice
        let mut scratch = [0u8; 192];
        let len = emit_thunk(&mut scratch, region_base + thunk_pos as u64, row, &spec, target);
        if thunk_pos + len > lowest_entry {
            return Err(RuntimeError::TableOverflow);
        }
        region[thunk_pos..thunk_pos + len].copy_from_slice(&scratch[..len]);

        // entry = jmp rel32 to the thunk
        let disp = (thunk_pos as i64 - (entry as i64 + 5)) as i32;
        region[entry] = OPCODE_JMP_REL32;
        region[entry + 1..entry + 5].copy_from_slice(&disp.to_le_bytes());

        thunk_pos += len;
    }
    Ok(())
}
