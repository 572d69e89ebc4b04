// Copyright (c) 2025 the amivm project developers, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

//! On-demand binary translation of 680x0 code into x86-64 code.
//!
//! A translation unit (TU) is a straight-line run of guest instructions
//! up to and including the first terminal instruction (a branch or a
//! return). Each TU gets one fixed-size cache slot:
//!
//! ```text
//! offset 0                  128                         256
//!        | stub, then NOPs   | translated instructions   |
//! ```
//!
//! [`setup_tu`] reserves the slot and writes a short *translation stub*
//! into the prefix: it saves the complete guest-visible program state,
//! calls back into [`translate_tu`] with the guest address as argument,
//! and restores the state. The NOP fill behind it makes execution slide
//! into the body, which the callback has written in the meantime. After
//! translation the first two bytes of the slot become a short jump over
//! the stub, so later entries run the body directly. Both slot states
//! are executable at any instant; the flip is a two-byte store while
//! the guest is parked inside the stub.
//!
//! Conditional branches end a TU by reserving slots for both of their
//! continuations and jumping between slots; this is how control flow
//! unfolds into the cache one executed path at a time.

mod opcodes;
mod operand;
mod reader;

use std::process;
use std::slice;
use std::sync::Mutex;

use log::{debug, error};
use thiserror::Error;

use amivm_codegen::{emit, emit::OperandWidth, CodeCursor};
use amivm_tlcache::{CacheError, TranslationCache, BODY_OFFSET, SLOT_SIZE};
use amivm_types::HOST_ARG_REGS;

use opcodes::{build_lookup_table, OpcodeInfo};
use reader::GuestReader;

// Worst-case host bytes for a single translated instruction (a
// conditional branch: 6-byte Jcc plus 5-byte JMP).
const MAX_HOST_BYTES_PER_INSTR: usize = 16;

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("translator has not been initialized")]
    NotInitialized,

    #[error("no handler found for opcode {opcode:#06x} at {addr:#010x}")]
    UnknownOpcode { opcode: u16, addr: u32 },

    #[error("unsupported addressing mode {mode_reg:#04x}")]
    UnsupportedAddressingMode { mode_reg: u8 },

    #[error("{mnemonic}: only long operations are supported")]
    UnsupportedSize { mnemonic: &'static str },

    #[error("{mnemonic}: unsupported operand combination")]
    UnsupportedOperands { mnemonic: &'static str },

    #[error("branch condition {cond:#06x} is not supported")]
    UnsupportedCondition { cond: u16 },

    #[error("branch target is out of reach of a 32-bit displacement")]
    BranchOutOfRange,

    #[error("translation unit at {addr:#010x} exceeds the slot capacity")]
    UnitTooLong { addr: u32 },

    #[error(transparent)]
    Cache(#[from] CacheError),
}

pub(crate) struct Translator {
    cache: TranslationCache,
    lookup_tbl: std::cell::OnceCell<Vec<Option<&'static OpcodeInfo>>>,
}

impl Translator {
    pub(crate) fn new(cache: TranslationCache) -> Self {
        Self {
            cache,
            lookup_tbl: std::cell::OnceCell::new(),
        }
    }

    /// Reserves a slot for the TU starting at `guest_addr` and arms it
    /// with a translation stub. Idempotent: an already-known address
    /// returns its existing slot untouched.
    fn setup_tu_inner(&mut self, guest_addr: u32) -> Result<*mut u8, TranslateError> {
        if let Some(slot) = self.cache.lookup(guest_addr) {
            return Ok(slot);
        }
        let slot = self.cache.alloc_slot(guest_addr)?;
        debug!(
            "setting up translation stub for {:#010x} in slot {:p}",
            guest_addr, slot
        );

        // The stub fires at an arbitrary point of guest execution, so
        // everything the guest can observe, including the flags, is
        // saved around the callback.
        let prefix = unsafe { slice::from_raw_parts_mut(slot, BODY_OFFSET) };
        let mut cur = CodeCursor::new(prefix, slot as u64);
        emit::save_program_state(&mut cur);
        emit::move_imm_to_reg(
            &mut cur,
            u64::from(guest_addr),
            HOST_ARG_REGS[0],
            OperandWidth::Dword,
        );
        emit::abs_call(&mut cur, translate_tu_callback as usize as u64);
        emit::restore_program_state(&mut cur);
        Ok(slot)
    }

    /// Translates the TU at `guest_addr` into its slot body and flips
    /// the slot into the translated state.
    fn translate_tu_inner(&mut self, guest_addr: u32) -> Result<*mut u8, TranslateError> {
        let slot = self.setup_tu_inner(guest_addr)?;
        debug!("translating code block at {:#010x}", guest_addr);

        let body =
            unsafe { slice::from_raw_parts_mut(slot.add(BODY_OFFSET), SLOT_SIZE - BODY_OFFSET) };
        let mut out = CodeCursor::new(body, slot as u64 + BODY_OFFSET as u64);
        let mut input = GuestReader::new(guest_addr);

        loop {
            if out.remaining() < MAX_HOST_BYTES_PER_INSTR {
                return Err(TranslateError::UnitTooLong { addr: guest_addr });
            }
            let addr = input.addr();
            let opcode = input.read_word();
            debug!("looking up opcode {:#06x} in opcode handler table", opcode);
            let info = {
                let table = self.lookup_tbl.get_or_init(build_lookup_table);
                table[opcode as usize]
            }
            .ok_or(TranslateError::UnknownOpcode { opcode, addr })?;
            (info.handler)(self, opcode, &mut input, &mut out)?;
            if info.terminal {
                debug!("instruction is the terminal instruction of this code block");
                break;
            }
        }

        // The guest is parked inside this very stub while we run, and
        // the bytes it still has to execute lie behind offset 2, so the
        // store cannot tear anything out from under it.
        let prefix = unsafe { slice::from_raw_parts_mut(slot, 2) };
        let mut cur = CodeCursor::new(prefix, slot as u64);
        emit::jmp_rel8(&mut cur, (BODY_OFFSET - 2) as i8);
        Ok(slot)
    }
}

// The translator the generated stubs call back into. A plain global
// because the stub reaches it through a C-ABI function with no room for
// a context argument; the same pattern the per-process opcode table of
// the lookup expansion uses.
static ACTIVE: Mutex<Option<Translator>> = Mutex::new(None);

fn with_active<R>(
    f: impl FnOnce(&mut Translator) -> Result<R, TranslateError>,
) -> Result<R, TranslateError> {
    let mut guard = ACTIVE.lock().unwrap_or_else(|e| e.into_inner());
    let translator = guard.as_mut().ok_or(TranslateError::NotInitialized)?;
    f(translator)
}

/// Installs the translation cache this process translates into. Replaces
/// any previous translator state.
pub fn init(cache: TranslationCache) {
    let mut guard = ACTIVE.lock().unwrap_or_else(|e| e.into_inner());
    *guard = Some(Translator::new(cache));
}

/// Reserves a stub-armed cache slot for the TU at `guest_addr` (see
/// [`Translator::setup_tu_inner`]) and returns its host address.
pub fn setup_tu(guest_addr: u32) -> Result<*mut u8, TranslateError> {
    with_active(|t| t.setup_tu_inner(guest_addr))
}

/// Translates the TU at `guest_addr`, finalizing its slot. Called by
/// the supervisor for the entry point and by the stubs for everything
/// else.
pub fn translate_tu(guest_addr: u32) -> Result<*mut u8, TranslateError> {
    with_active(|t| t.translate_tu_inner(guest_addr))
}

/// The host address translated for a guest address, if any.
pub fn lookup(guest_addr: u32) -> Option<*const u8> {
    let guard = ACTIVE.lock().unwrap_or_else(|e| e.into_inner());
    guard
        .as_ref()
        .and_then(|t| t.cache.lookup(guest_addr))
        .map(|p| p as *const u8)
}

/// Number of cache slots allocated so far.
pub fn slot_count() -> usize {
    let guard = ACTIVE.lock().unwrap_or_else(|e| e.into_inner());
    guard.as_ref().map_or(0, |t| t.cache.slot_count())
}

/// Invariant check over the whole cache: every slot is in a valid,
/// executable state.
pub fn cache_consistent() -> bool {
    let guard = ACTIVE.lock().unwrap_or_else(|e| e.into_inner());
    guard.as_ref().map_or(true, |t| t.cache.slots_consistent())
}

// Entry point of the translation stubs. Runs inside the guest process,
// in the middle of guest execution; a failure here means the TU cannot
// be completed and the guest cannot continue.
extern "C" fn translate_tu_callback(guest_addr: u32) -> *const u8 {
    match translate_tu(guest_addr) {
        Ok(slot) => slot,
        Err(err) => {
            error!("translating code block at {:#010x} failed: {}", guest_addr, err);
            process::abort();
        }
    }
}
