// Copyright (c) 2025 the amivm project developers, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

//! The fixed guest address-space layout.
//!
//! Every guest-visible object is mapped at a fixed 32-bit address so that
//! the loader can apply relocations by plain addition and the translator
//! never has to deal with 64-bit guest addresses. All bases are page
//! aligned and above the kernel's `vm.mmap_min_addr` floor.

/// Where the program's hunks (code, data, BSS) are mapped.
pub const HUNK_BASE_ADDRESS: u32 = 0x0010_0000;

/// Maximum number of hunks in an executable: code, data, BSS and one
/// spare.
pub const MAX_HUNKS: usize = 4;

/// Every hunk is given a region of this size, whatever its actual length,
/// so hunk n sits at `HUNK_BASE_ADDRESS + n * MAX_HUNK_SIZE`.
pub const MAX_HUNK_SIZE: usize = 65536;

/// Where the synthesized library jump-table regions are mapped, one
/// region of `LIB_JUMP_TABLE_SIZE` bytes per opened library.
pub const LIB_BASE_ADDRESS: u32 = 0x0020_0000;

/// Size of the memory block reserved for one library's jump tables
/// (dispatch table at the end, thunk table at the start).
pub const LIB_JUMP_TABLE_SIZE: usize = 8192;

/// Base address of the Exec library, the only absolute address in
/// AmigaOS, where address 4 holds a pointer to the library base. We
/// cannot map page zero (the kernel forbids mappings in the first 64 KB),
/// so reads of address 4 are rewritten to this page instead.
pub const EXEC_BASE_SLOT: u32 = 0x0030_0000;

/// The absolute address AmigaOS programs read the Exec base from.
pub const ABS_EXEC_BASE: u32 = 4;
