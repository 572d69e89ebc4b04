// Copyright (c) 2025 the amivm project developers, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

//! Loader for executables in the AmigaOS "Hunk" format.
//!
//! An executable is a sequence of big-endian typed blocks. It opens
//! with a header declaring the number of hunks (code, data, BSS) and
//! their sizes; each hunk then contributes a payload block
//! (`HUNK_CODE`, `HUNK_DATA` or `HUNK_BSS`), optionally followed by
//! symbol, debug and relocation blocks, and is closed by `HUNK_END`.
//!
//! Every hunk is mapped at a fixed 32-bit address
//! (`HUNK_BASE_ADDRESS + n * MAX_HUNK_SIZE`) so that 32-bit relocations
//! can be applied by adding the per-hunk load address to the stored
//! offsets, and so the translator never sees a guest address above the
//! 4 GB line.
//!
//! Reference: The AmigaDOS Manual, 3rd edition, chapter "The Hunk
//! structure of object files".

use std::fs::File;
use std::io;
use std::path::Path;
use std::ptr;

use log::debug;
use memmap2::Mmap;
use thiserror::Error;

use amivm_types::layout::{HUNK_BASE_ADDRESS, MAX_HUNKS, MAX_HUNK_SIZE};

// Block type ids, from dos/doshunks.h.
pub const HUNK_CODE: u32 = 0x3e9;
pub const HUNK_DATA: u32 = 0x3ea;
pub const HUNK_BSS: u32 = 0x3eb;
pub const HUNK_RELOC32: u32 = 0x3ec;
pub const HUNK_SYMBOL: u32 = 0x3f0;
pub const HUNK_DEBUG: u32 = 0x3f1;
pub const HUNK_END: u32 = 0x3f2;
pub const HUNK_HEADER: u32 = 0x3f3;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("could not open program image: {0}")]
    Io(#[from] io::Error),

    #[error("program image ends in the middle of a block")]
    TruncatedImage,

    #[error("executables that specify resident libraries in the header are not supported")]
    ResidentLibraries,

    #[error("executables with more than {MAX_HUNKS} hunks are not supported (got {0})")]
    TooManyHunks(u32),

    #[error("executables with a first hunk number other than 0 are not supported (got {0})")]
    NonZeroFirstHunk(u32),

    #[error("hunk #{hunk} is larger ({size} bytes) than the {MAX_HUNK_SIZE} byte hunk region")]
    HunkTooLarge { hunk: u32, size: u32 },

    #[error("unknown block type {0:#x}")]
    UnknownBlockType(u32),

    #[error("relocations reference hunk #{referenced} but the last hunk is #{last}")]
    RelocBadHunk { referenced: u32, last: u32 },

    #[error("relocation at position {pos} is outside its hunk or produces an invalid address")]
    RelocOutOfRange { pos: u32 },

    #[error("could not create memory mapping for hunks: {0}")]
    MapFailed(io::Error),

    #[error("executable contains no code hunk")]
    NoCodeHunk,

    #[error("program image does not start with a hunk header")]
    MissingHeader,
}

/// What the loader hands to the supervisor: where the guest code landed.
#[derive(Debug, Clone, Copy)]
pub struct LoadedProgram {
    pub code_address: u32,
    pub code_size: u32,
}

// Big-endian block reader over the mapped image.
struct ImageReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ImageReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn read_dword(&mut self) -> Result<u32, LoadError> {
        let bytes = self
            .data
            .get(self.pos..self.pos + 4)
            .ok_or(LoadError::TruncatedImage)?;
        self.pos += 4;
        Ok(u32::from_be_bytes(bytes.try_into().unwrap()))
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], LoadError> {
        let bytes = self
            .data
            .get(self.pos..self.pos + len)
            .ok_or(LoadError::TruncatedImage)?;
        self.pos += len;
        Ok(bytes)
    }

    fn skip(&mut self, len: usize) -> Result<(), LoadError> {
        self.read_bytes(len).map(|_| ())
    }
}

/// Loads a program image, mapping its hunks at the fixed guest
/// addresses and applying its relocations.
pub fn load_program(path: &Path) -> Result<LoadedProgram, LoadError> {
    debug!("mapping file '{}' into memory", path.display());
    let file = File::open(path)?;
    let image = unsafe { Mmap::map(&file)? };
    load_image(&image, HUNK_BASE_ADDRESS)
}

fn guest_ptr(addr: u32) -> *mut u8 {
    addr as usize as *mut u8
}

// Reads a big-endian dword out of guest memory, where the relocation
// offsets live.
fn read_guest_dword(addr: u32) -> u32 {
    let mut bytes = [0u8; 4];
    unsafe { ptr::copy_nonoverlapping(guest_ptr(addr), bytes.as_mut_ptr(), 4) };
    u32::from_be_bytes(bytes)
}

fn write_guest_dword(addr: u32, value: u32) {
    let bytes = value.to_be_bytes();
    unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), guest_ptr(addr), 4) };
}

fn load_image(image: &[u8], base: u32) -> Result<LoadedProgram, LoadError> {
    let mut reader = ImageReader::new(image);

    // per-hunk load addresses and declared sizes, filled by the header
    let mut hunk_addresses = [0u32; MAX_HUNKS];
    let mut hunk_sizes = [0u32; MAX_HUNKS];
    let mut last_hunk = 0u32;
    let mut header_seen = false;

    let mut hunk_num = 0u32;
    let mut code: Option<LoadedProgram> = None;

    debug!("reading individual hunks");
    while !reader.at_end() {
        let block_type = reader.read_dword()?;
        if !header_seen && block_type != HUNK_HEADER {
            return Err(LoadError::MissingHeader);
        }
        match block_type {
            HUNK_HEADER => {
                header_seen = true;
                debug!("block type is HUNK_HEADER");
                if reader.read_dword()? != 0 {
                    return Err(LoadError::ResidentLibraries);
                }
                // total number of hunks, including resident libraries
                // and overlay hunks
                reader.read_dword()?;
                let first = reader.read_dword()?;
                let last = reader.read_dword()?;
                if first != 0 {
                    return Err(LoadError::NonZeroFirstHunk(first));
                }
                if last as usize + 1 > MAX_HUNKS {
                    return Err(LoadError::TooManyHunks(last.wrapping_add(1)));
                }
                let count = last + 1;
                last_hunk = last;

                // validate all declared sizes before touching the
                // address space
                for hunk in 0..count {
                    let size = reader
                        .read_dword()?
                        .checked_mul(4)
                        .ok_or(LoadError::HunkTooLarge { hunk, size: u32::MAX })?;
                    if size as usize > MAX_HUNK_SIZE {
                        return Err(LoadError::HunkTooLarge { hunk, size });
                    }
                    hunk_sizes[hunk as usize] = size;
                    hunk_addresses[hunk as usize] = base + hunk * MAX_HUNK_SIZE as u32;
                }

                debug!("creating memory mapping for hunks at {:#010x}", base);
                let mapped = unsafe {
                    libc::mmap(
                        base as usize as *mut libc::c_void,
                        MAX_HUNKS * MAX_HUNK_SIZE,
                        libc::PROT_READ | libc::PROT_WRITE,
                        libc::MAP_FIXED | libc::MAP_ANON | libc::MAP_PRIVATE,
                        -1,
                        0,
                    )
                };
                if mapped == libc::MAP_FAILED {
                    return Err(LoadError::MapFailed(io::Error::last_os_error()));
                }
            }

            HUNK_CODE | HUNK_DATA => {
                debug!("block type is HUNK_CODE / HUNK_DATA");
                if hunk_num > last_hunk {
                    return Err(LoadError::TooManyHunks(hunk_num + 1));
                }
                let nbytes = reader.read_dword()? * 4;
                if nbytes as usize > MAX_HUNK_SIZE {
                    return Err(LoadError::HunkTooLarge {
                        hunk: hunk_num,
                        size: nbytes,
                    });
                }
                let payload = reader.read_bytes(nbytes as usize)?;
                let addr = hunk_addresses[hunk_num as usize];
                debug!(
                    "copying code / data ({} bytes) to mapped region at {:#010x}",
                    nbytes, addr
                );
                unsafe {
                    ptr::copy_nonoverlapping(payload.as_ptr(), guest_ptr(addr), payload.len())
                };
                if block_type == HUNK_CODE && code.is_none() {
                    code = Some(LoadedProgram {
                        code_address: addr,
                        code_size: nbytes,
                    });
                }
            }

            HUNK_BSS => {
                debug!("block type is HUNK_BSS");
                if hunk_num > last_hunk {
                    return Err(LoadError::TooManyHunks(hunk_num + 1));
                }
                let nbytes = reader.read_dword()? * 4;
                if nbytes as usize > MAX_HUNK_SIZE {
                    return Err(LoadError::HunkTooLarge {
                        hunk: hunk_num,
                        size: nbytes,
                    });
                }
                let addr = hunk_addresses[hunk_num as usize];
                debug!("zeroing mapped region at {:#010x} ({} bytes)", addr, nbytes);
                unsafe { ptr::write_bytes(guest_ptr(addr), 0, nbytes as usize) };
            }

            HUNK_RELOC32 => {
                debug!("block type is HUNK_RELOC32");
                if hunk_num > last_hunk {
                    return Err(LoadError::TooManyHunks(hunk_num + 1));
                }
                loop {
                    let count = reader.read_dword()?;
                    if count == 0 {
                        break;
                    }
                    let referenced = reader.read_dword()?;
                    if referenced > last_hunk {
                        return Err(LoadError::RelocBadHunk {
                            referenced,
                            last: last_hunk,
                        });
                    }
                    for _ in 0..count {
                        let pos = reader.read_dword()?;
                        // the fixup must lie inside the current hunk
                        let size = hunk_sizes[hunk_num as usize];
                        if pos.checked_add(4).map_or(true, |end| end > size) {
                            return Err(LoadError::RelocOutOfRange { pos });
                        }
                        let target = hunk_addresses[hunk_num as usize] + pos;
                        let offset = read_guest_dword(target);
                        if offset > u32::MAX - base {
                            return Err(LoadError::RelocOutOfRange { pos });
                        }
                        debug!(
                            "applying reloc referencing hunk #{} at position {}",
                            referenced, pos
                        );
                        write_guest_dword(target, offset + hunk_addresses[referenced as usize]);
                    }
                }
            }

            HUNK_SYMBOL => {
                debug!("block type is HUNK_SYMBOL");
                loop {
                    let ndwords = reader.read_dword()?;
                    if ndwords == 0 {
                        break;
                    }
                    // name dwords plus the symbol value
                    reader.skip((ndwords as usize + 1) * 4)?;
                }
            }

            HUNK_DEBUG => {
                debug!("block type is HUNK_DEBUG");
                let ndwords = reader.read_dword()?;
                reader.skip(ndwords as usize * 4)?;
            }

            HUNK_END => {
                debug!("block type is HUNK_END");
                hunk_num += 1;
            }

            other => return Err(LoadError::UnknownBlockType(other)),
        }
    }

    code.ok_or(LoadError::NoCodeHunk)
}
