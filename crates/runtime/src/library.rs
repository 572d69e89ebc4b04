// Copyright (c) 2025 the amivm project developers, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

//! Native library loading.
//!
//! An AmigaOS library name maps onto a host shared object by a plain
//! name transformation (`dos.library` becomes `<dir>/libdos.so`). The
//! shared object exports a function table (see
//! [`amivm_types::FUNC_TABLE_SYMBOL`]); loading a library means running
//! the jump-table synthesizer over that table in a freshly mapped
//! region and handing the region's end address to the guest as the
//! library base.
//!
//! Regions are taken from the fixed window starting at
//! `LIB_BASE_ADDRESS`, one [`LIB_JUMP_TABLE_SIZE`] block per library,
//! so every base the guest sees is a 32-bit address.

use std::env;
use std::io;
use std::path::{Path, PathBuf};
use std::slice;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use libloading::Library;
use log::debug;

use amivm_types::{
    layout::{LIB_BASE_ADDRESS, LIB_JUMP_TABLE_SIZE},
    FuncInfo, FUNC_TABLE_SYMBOL,
};

use crate::{jumptable::synthesize_jump_tables, RuntimeError};

/// Environment variable overriding the directory the native libraries
/// are loaded from.
pub const LIB_PATH_ENV: &str = "AMIVM_LIB_PATH";

// Host library handles are kept (and never closed): the guest may hold
// pointers into a library's tables for its whole lifetime, and
// CloseLibrary carries no information about which handle to drop.
static OPEN_LIBRARIES: Mutex<Vec<Library>> = Mutex::new(Vec::new());

// Next free jump-table region. Plain bump allocation; nothing is ever
// given back.
static NEXT_LIB_REGION: AtomicU32 = AtomicU32::new(LIB_BASE_ADDRESS);

/// The directory native libraries live in, `libs` unless overridden
/// through [`LIB_PATH_ENV`].
pub fn library_search_dir() -> PathBuf {
    env::var_os(LIB_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("libs"))
}

/// `foo.library` → `<search dir>/libfoo.so`.
pub fn host_library_path(amiga_name: &str) -> PathBuf {
    let stem = amiga_name.strip_suffix(".library").unwrap_or(amiga_name);
    library_search_dir().join(format!("lib{}.so", stem))
}

// Walks a C-handed function table up to its zero-offset terminator.
unsafe fn rows_from_ptr<'a>(first: *const FuncInfo) -> &'a [FuncInfo] {
    let mut len = 0;
    while (*first.add(len)).offset != 0 {
        len += 1;
    }
    slice::from_raw_parts(first, len)
}

/// Synthesizes the jump tables for a function table and returns the
/// pseudo base address the guest will use.
pub fn synthesize_library(rows: &[FuncInfo]) -> Result<u32, RuntimeError> {
    let region_base = NEXT_LIB_REGION.fetch_add(LIB_JUMP_TABLE_SIZE as u32, Ordering::SeqCst);
    let mapped = unsafe {
        libc::mmap(
            region_base as usize as *mut libc::c_void,
            LIB_JUMP_TABLE_SIZE,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_FIXED | libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        )
    };
    if mapped == libc::MAP_FAILED {
        return Err(RuntimeError::MapFailed {
            addr: region_base,
            err: io::Error::last_os_error(),
        });
    }

    debug!("setting up library jump tables at {:#010x}", region_base);
    let region = unsafe { slice::from_raw_parts_mut(mapped as *mut u8, LIB_JUMP_TABLE_SIZE) };
    synthesize_jump_tables(region, region_base as u64, rows)?;
    Ok(region_base + LIB_JUMP_TABLE_SIZE as u32)
}

/// Loads a native library from `path` and synthesizes its jump tables.
/// Returns the pseudo base address.
pub fn load_library(path: &Path) -> Result<u32, RuntimeError> {
    debug!("dlopen()ing library '{}'", path.display());
    let lib = unsafe { Library::new(path) }.map_err(|err| RuntimeError::LibraryOpen {
        path: path.to_path_buf(),
        err,
    })?;

    let table = unsafe {
        lib.get::<unsafe extern "C" fn() -> *const FuncInfo>(FUNC_TABLE_SYMBOL.as_bytes())
    }
    .map_err(RuntimeError::MissingFunctionTable)?;
    let rows = unsafe { rows_from_ptr(table()) };

    let base = synthesize_library(rows)?;
    OPEN_LIBRARIES
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .push(lib);
    Ok(base)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use std::path::Path;

    use amivm_types::layout::{LIB_BASE_ADDRESS, LIB_JUMP_TABLE_SIZE};
    use amivm_types::{FuncInfo, NativeFunc};

    use super::{host_library_path, synthesize_library};

    #[test]
    fn test_library_name_transformation() {
        std::env::remove_var(super::LIB_PATH_ENV);
        assert_eq!(
            host_library_path("dos.library"),
            Path::new("libs/libdos.so")
        );
        assert_eq!(
            host_library_path("intuition.library"),
            Path::new("libs/libintuition.so")
        );
        // a name without the suffix is used as the stem
        assert_eq!(host_library_path("dos"), Path::new("libs/libdos.so"));
    }

    extern "C" fn nop_native() {}

    #[test]
    fn test_synthesize_library_returns_region_end() {
        let rows = [
            FuncInfo::implemented(30, "First", "101", NativeFunc(nop_native as usize)),
            FuncInfo::new(36, "Second", "101"),
        ];
        let base = synthesize_library(&rows).unwrap();
        assert!(base >= LIB_BASE_ADDRESS + LIB_JUMP_TABLE_SIZE as u32);
        assert_eq!(base as usize % LIB_JUMP_TABLE_SIZE, 0);

        // the trap for the unimplemented entry is in place
        let trap = unsafe { ((base - 36) as usize as *const u8).read() };
        assert_eq!(trap, 0xcc);
        // the implemented entry is a relative jump
        let jump = unsafe { ((base - 30) as usize as *const u8).read() };
        assert_eq!(jump, 0xe9);
    }
}
