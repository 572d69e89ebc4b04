// Copyright (c) 2025 the amivm project developers, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

//! Execution of translated programs.
//!
//! This crate owns everything around the translated code: the library
//! jump tables that bridge the guest's base-pointer-minus-offset call
//! convention to native functions ([`jumptable`]), the loading and
//! synthesis of native libraries including the built-in Exec library
//! ([`library`], [`exec`]), and the supervisor that runs the guest as a
//! traced child process ([`supervisor`]).

pub mod exec;
pub mod jumptable;
pub mod library;
pub mod supervisor;

use std::io;
use std::path::PathBuf;

use nix::sys::signal::Signal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("system call failed: {0}")]
    Sys(#[from] nix::Error),

    #[error("could not create memory mapping at {addr:#010x}: {err}")]
    MapFailed { addr: u32, err: io::Error },

    #[error("could not open native library '{path}': {err}")]
    LibraryOpen {
        path: PathBuf,
        err: libloading::Error,
    },

    #[error("native library does not export a function table: {0}")]
    MissingFunctionTable(libloading::Error),

    #[error("invalid argument descriptor '{desc}' for library function {name}()")]
    BadDescriptor { name: String, desc: String },

    #[error("library function {name}() takes more arguments than the host ABI passes in registers")]
    TooManyArgs { name: String },

    #[error("library jump tables do not fit into the reserved region")]
    TableOverflow,

    #[error("program called unimplemented library routine")]
    UnimplementedLibraryCall,

    #[error("guest was stopped by unexpected signal {0}")]
    GuestStopped(Signal),

    #[error("guest was terminated by signal {0}")]
    GuestKilled(Signal),

    #[error("unknown wait status for the guest process")]
    UnexpectedWaitStatus,
}
