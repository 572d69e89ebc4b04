// Copyright (c) 2025 the amivm project developers, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

//! End-to-end: a conditional branch reserves slots for both of its
//! continuations, and the one the guest actually takes is translated
//! lazily inside the child, through the translation stub, visible to
//! the supervisor via the shared cache region.

mod common;

use amivm_types::layout::HUNK_BASE_ADDRESS;

#[test]
fn branch_continuations_translate_lazily_in_the_child() {
    let image = common::hunk_image(&[&[
        0x70, 0x02, // moveq #2, d0
        0x4a, 0x80, // tst.l d0
        0x66, 0x02, // bne.s +2 (taken: d0 is nonzero)
        0x4e, 0x75, // rts (fall-through continuation)
        0x4e, 0x75, // rts (taken continuation)
    ]]);
    let entry = common::bootstrap("branch", &image);

    // translating the entry unit reserved both continuations
    assert_eq!(amivm_translator::slot_count(), 3);
    let taken = amivm_translator::lookup(HUNK_BASE_ADDRESS + 8).unwrap();
    let fallthrough = amivm_translator::lookup(HUNK_BASE_ADDRESS + 6).unwrap();
    // both are armed stubs, not yet translated
    assert_eq!(common::slot_prefix(taken)[0], 0x41);
    assert_eq!(common::slot_prefix(fallthrough)[0], 0x41);

    let status = amivm_runtime::supervisor::run_guest(entry).unwrap();
    assert_eq!(status, 0);

    // the child took the branch: its stub ran the translator and
    // finalized the slot, and the shared mapping makes that visible
    // here in the parent
    assert_eq!(common::slot_prefix(taken), [0xeb, 0x7e]);
    // the fall-through path never ran and is still a stub
    assert_eq!(common::slot_prefix(fallthrough)[0], 0x41);
    assert!(amivm_translator::cache_consistent());
}
