// Copyright (c) 2025 the amivm project developers, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

//! The supervisor.
//!
//! The guest runs as a forked child under `ptrace`, entered through the
//! translated entry slot. The parent only ever blocks in `waitpid`:
//! lazy translation happens *inside* the child (branch stubs call the
//! translator as an ordinary host function), so the one trap the
//! supervisor handles is the INT3 a dispatch table raises for an
//! unimplemented library function, plus whatever else ends the child.

use std::io;
use std::mem;
use std::process;

use log::{debug, info};
use nix::sys::ptrace;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use amivm_types::layout::EXEC_BASE_SLOT;

use crate::{exec, library::synthesize_library, RuntimeError};

/// Synthesizes the built-in Exec library and publishes its base pointer
/// at the well-known address the guest reads it from. Returns the
/// pseudo base.
pub fn install_system_library() -> Result<u32, RuntimeError> {
    debug!("loading Exec library");
    let exec_base = synthesize_library(exec::function_table())?;

    // The cell officially lives at address 4, which cannot be mapped;
    // the translator redirects guest reads of address 4 to this page.
    let mapped = unsafe {
        libc::mmap(
            EXEC_BASE_SLOT as usize as *mut libc::c_void,
            mem::size_of::<u32>(),
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_FIXED | libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        )
    };
    if mapped == libc::MAP_FAILED {
        return Err(RuntimeError::MapFailed {
            addr: EXEC_BASE_SLOT,
            err: io::Error::last_os_error(),
        });
    }
    unsafe { (mapped as *mut u32).write(exec_base) };
    debug!("Exec base {:#010x} stored at {:#010x}", exec_base, EXEC_BASE_SLOT);
    Ok(exec_base)
}

/// Forks the guest and supervises it until it ends. `entry` is the
/// translated (or stub-armed) host code of the guest entry point.
/// Returns the guest's exit status.
pub fn run_guest(entry: *const u8) -> Result<i32, RuntimeError> {
    match unsafe { fork() }? {
        ForkResult::Child => {
            debug!("child is starting...");
            // A failure to arm tracing only costs the unimplemented-
            // function diagnostics, so the guest still runs.
            let _ = ptrace::traceme();
            let entry_fn: extern "C" fn() = unsafe { mem::transmute(entry) };
            entry_fn();
            debug!("child is terminating...");
            // the guest's own exit status lives in D0 and is not
            // recoverable from here
            process::exit(0);
        }
        ForkResult::Parent { child } => supervise(child),
    }
}

fn supervise(child: Pid) -> Result<i32, RuntimeError> {
    loop {
        match waitpid(child, None)? {
            WaitStatus::Exited(_, status) => {
                info!("child has exited with status {}", status);
                return Ok(status);
            }
            WaitStatus::Stopped(pid, Signal::SIGTRAP) => {
                // the only breakpoint traps in the guest's address
                // space sit in dispatch-table entries of functions
                // without a native implementation
                reap(pid);
                return Err(RuntimeError::UnimplementedLibraryCall);
            }
            WaitStatus::Stopped(pid, signal) => {
                reap(pid);
                return Err(RuntimeError::GuestStopped(signal));
            }
            WaitStatus::Signaled(_, signal, _) => {
                return Err(RuntimeError::GuestKilled(signal));
            }
            WaitStatus::StillAlive | WaitStatus::Continued(_) => continue,
            _ => return Err(RuntimeError::UnexpectedWaitStatus),
        }
    }
}

// Kills a stopped child and collects the corpse so it does not linger
// as a zombie.
fn reap(pid: Pid) {
    let _ = kill(pid, Signal::SIGKILL);
    let _ = ptrace::cont(pid, None);
    let _ = waitpid(pid, None);
}
