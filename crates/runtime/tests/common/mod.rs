// Copyright (c) 2025 the amivm project developers, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

//! Shared helpers for the end-to-end scenarios. Each scenario lives in
//! its own integration-test file on purpose: the guest address layout
//! is fixed and the translator is a process-wide singleton, so every
//! scenario needs a process of its own.

#![allow(dead_code)]

use std::path::PathBuf;

const HUNK_CODE: u32 = 0x3e9;
const HUNK_DATA: u32 = 0x3ea;
const HUNK_END: u32 = 0x3f2;
const HUNK_HEADER: u32 = 0x3f3;

/// Builds a Hunk executable image: the first hunk is the code hunk,
/// any further ones are data hunks. Payloads are zero-padded to dword
/// granularity.
pub fn hunk_image(hunks: &[&[u8]]) -> Vec<u8> {
    fn dword(image: &mut Vec<u8>, value: u32) {
        image.extend_from_slice(&value.to_be_bytes());
    }

    let mut image = Vec::new();
    dword(&mut image, HUNK_HEADER);
    dword(&mut image, 0); // no resident libraries
    dword(&mut image, hunks.len() as u32);
    dword(&mut image, 0);
    dword(&mut image, hunks.len() as u32 - 1);
    for hunk in hunks {
        dword(&mut image, hunk.len().div_ceil(4) as u32);
    }

    for (n, hunk) in hunks.iter().enumerate() {
        let ndwords = hunk.len().div_ceil(4);
        dword(&mut image, if n == 0 { HUNK_CODE } else { HUNK_DATA });
        dword(&mut image, ndwords as u32);
        image.extend_from_slice(hunk);
        image.resize(image.len() + (ndwords * 4 - hunk.len()), 0);
        dword(&mut image, HUNK_END);
    }
    image
}

/// Writes a program image into the target directory and returns its
/// path.
pub fn write_program(name: &str, image: &[u8]) -> PathBuf {
    let path = std::env::temp_dir().join(format!("amivm-test-{}-{}", std::process::id(), name));
    std::fs::write(&path, image).unwrap();
    path
}

/// Loads a program image and prepares the translator: entry stub,
/// eager entry translation, system library. Returns the host address
/// of the entry slot.
pub fn bootstrap(name: &str, image: &[u8]) -> *const u8 {
    let path = write_program(name, image);
    let program = amivm_loader::load_program(&path).unwrap();
    amivm_translator::init(amivm_tlcache::TranslationCache::new().unwrap());
    let entry = amivm_translator::setup_tu(program.code_address).unwrap();
    amivm_translator::translate_tu(program.code_address).unwrap();
    amivm_runtime::supervisor::install_system_library().unwrap();
    entry
}

/// First bytes of a slot, for asserting its state.
pub fn slot_prefix(slot: *const u8) -> [u8; 2] {
    unsafe { [slot.read(), slot.add(1).read()] }
}
