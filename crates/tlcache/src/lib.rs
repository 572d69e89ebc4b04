// Copyright (c) 2025 the amivm project developers, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

//! The translation cache.
//!
//! Maps guest code addresses to the executable slots holding their
//! translations. The mapping is a binary trie over the bits of the guest
//! address, walked from the most significant of [`GUEST_ADDR_BITS`] bits
//! down to bit 0; the leaf level stores the slot pointer in the child
//! link selected by the least significant bit (left child = 1-bit,
//! right child = 0-bit).
//!
//! Slots are carved out of a single anonymous shared read/write/execute
//! mapping by a bump allocator. The mapping is shared (not private) so
//! that code the child process writes while elaborating a stub is the
//! same memory the parent set up before forking.

use std::io;
use std::ptr;

use log::debug;
use thiserror::Error;

use amivm_codegen::{OPCODE_JMP_REL8, OPCODE_NOP, PREFIX_REX_B};

/// Total size of the executable region, the documented design limit.
pub const CODE_REGION_SIZE: usize = 65536;

/// Size of one cache slot.
pub const SLOT_SIZE: usize = 256;

/// Offset of the translated body inside a slot. The bytes below it are
/// reserved for the translation stub.
pub const BODY_OFFSET: usize = 128;

/// Number of significant guest address bits. The loader keeps all guest
/// code below this bound.
pub const GUEST_ADDR_BITS: u32 = 21;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("could not create memory mapping for translated code: {0}")]
    MapFailed(io::Error),

    #[error("no more free code slots available in translation cache")]
    OutOfSpace,

    #[error("guest address {0:#010x} is outside the supported range")]
    AddressOutOfRange(u32),
}

// One trie level. `children` carries the walk for the upper bits,
// `slots` holds the payload at the final level. The two are never
// populated in the same node because lookups for a given depth only ever
// touch one of them.
#[derive(Default)]
struct TrieNode {
    children: [Option<Box<TrieNode>>; 2],
    slots: [Option<*mut u8>; 2],
}

/// The shared executable region slots are bump-allocated from.
struct SlotArena {
    base: *mut u8,
    size: usize,
    next: usize,
}

impl SlotArena {
    fn new(size: usize) -> Result<Self, CacheError> {
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_ANON | libc::MAP_SHARED,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(CacheError::MapFailed(io::Error::last_os_error()));
        }
        Ok(Self {
            base: base as *mut u8,
            size,
            next: 0,
        })
    }

    // Hands out the next slot, filled with NOPs so that execution
    // entering anywhere inside it slides forward instead of running
    // garbage.
    fn alloc(&mut self) -> Result<*mut u8, CacheError> {
        if self.next + SLOT_SIZE > self.size {
            return Err(CacheError::OutOfSpace);
        }
        let slot = unsafe { self.base.add(self.next) };
        self.next += SLOT_SIZE;
        unsafe { ptr::write_bytes(slot, OPCODE_NOP, SLOT_SIZE) };
        Ok(slot)
    }

    fn allocated(&self) -> impl Iterator<Item = *mut u8> + '_ {
        (0..self.next / SLOT_SIZE).map(|n| unsafe { self.base.add(n * SLOT_SIZE) })
    }
}

pub struct TranslationCache {
    root: TrieNode,
    arena: SlotArena,
}

// The cache is only ever driven from one control flow at a time: the
// supervisor before forking, the guest's embedded translator after. The
// raw slot pointers refer to the process-shared executable region.
unsafe impl Send for TranslationCache {}

impl TranslationCache {
    pub fn new() -> Result<Self, CacheError> {
        Self::with_region_size(CODE_REGION_SIZE)
    }

    pub fn with_region_size(size: usize) -> Result<Self, CacheError> {
        Ok(Self {
            root: TrieNode::default(),
            arena: SlotArena::new(size)?,
        })
    }

    /// Looks up the slot translated (or reserved) for a guest address.
    pub fn lookup(&self, guest_addr: u32) -> Option<*mut u8> {
        let mut node = &self.root;
        let mut bit = 1u32 << (GUEST_ADDR_BITS - 1);
        while bit > 1 {
            let side = usize::from(guest_addr & bit != 0);
            node = node.children[side].as_deref()?;
            bit >>= 1;
        }
        node.slots[usize::from(guest_addr & 1 != 0)]
    }

    /// Records the slot for a guest address, creating or overwriting.
    pub fn insert(&mut self, guest_addr: u32, slot: *mut u8) -> Result<(), CacheError> {
        if guest_addr >> GUEST_ADDR_BITS != 0 {
            return Err(CacheError::AddressOutOfRange(guest_addr));
        }
        let mut node = &mut self.root;
        let mut bit = 1u32 << (GUEST_ADDR_BITS - 1);
        while bit > 1 {
            let side = usize::from(guest_addr & bit != 0);
            node = node.children[side].get_or_insert_with(Box::default);
            bit >>= 1;
        }
        debug!("putting mapping {:#010x} -> {:p} into cache", guest_addr, slot);
        node.slots[usize::from(guest_addr & 1 != 0)] = Some(slot);
        Ok(())
    }

    /// Returns the slot for a guest address, allocating a fresh
    /// NOP-filled one when the address is not in the cache yet.
    /// At most one slot ever exists per guest address.
    pub fn alloc_slot(&mut self, guest_addr: u32) -> Result<*mut u8, CacheError> {
        if let Some(slot) = self.lookup(guest_addr) {
            return Ok(slot);
        }
        let slot = self.arena.alloc()?;
        self.insert(guest_addr, slot)?;
        Ok(slot)
    }

    /// Number of slots handed out so far.
    pub fn slot_count(&self) -> usize {
        self.arena.next / SLOT_SIZE
    }

    /// The allocated slots, in allocation order.
    pub fn allocated_slots(&self) -> impl Iterator<Item = *mut u8> + '_ {
        self.arena.allocated()
    }

    /// Invariant check: every allocated slot is in one of its three
    /// valid states: freshly NOP-filled, armed with a translation stub
    /// (which opens with the register-save pushes and their REX
    /// prefix), or finalized with the short jump that skips the stub.
    /// Anything else means a torn write.
    pub fn slots_consistent(&self) -> bool {
        self.allocated_slots().all(|slot| {
            let first = unsafe { slot.read() };
            match first {
                OPCODE_NOP | PREFIX_REX_B => true,
                OPCODE_JMP_REL8 => (unsafe { slot.add(1).read() }) as usize == BODY_OFFSET - 2,
                _ => false,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{CacheError, TranslationCache, BODY_OFFSET, SLOT_SIZE};

    #[test]
    fn test_insert_then_lookup() {
        let mut cache = TranslationCache::new().unwrap();
        let p1 = 0xdead_beef_usize as *mut u8;
        let p2 = 0xcafe_babe_usize as *mut u8;
        cache.insert(0x5, p1).unwrap();
        cache.insert(0x6, p2).unwrap();
        assert_eq!(cache.lookup(0x5), Some(p1));
        assert_eq!(cache.lookup(0x6), Some(p2));
        assert_eq!(cache.lookup(0x7), None);
        // adjacent addresses sharing all but the lowest bits stay apart
        cache.insert(0x4, p2).unwrap();
        assert_eq!(cache.lookup(0x5), Some(p1));
        assert_eq!(cache.lookup(0x4), Some(p2));
    }

    #[test]
    fn test_insert_rejects_out_of_range_address() {
        let mut cache = TranslationCache::new().unwrap();
        let err = cache.insert(0x0020_0000, std::ptr::null_mut()).unwrap_err();
        assert!(matches!(err, CacheError::AddressOutOfRange(0x0020_0000)));
    }

    #[test]
    fn test_alloc_slot_is_idempotent() {
        let mut cache = TranslationCache::new().unwrap();
        let first = cache.alloc_slot(0x0010_0000).unwrap();
        let again = cache.alloc_slot(0x0010_0000).unwrap();
        assert_eq!(first, again);
        assert_eq!(cache.slot_count(), 1);

        let other = cache.alloc_slot(0x0010_0040).unwrap();
        assert_ne!(first, other);
        assert_eq!(other as usize - first as usize, SLOT_SIZE);
        assert_eq!(cache.slot_count(), 2);
    }

    #[test]
    fn test_fresh_slot_is_nop_filled() {
        let mut cache = TranslationCache::new().unwrap();
        let slot = cache.alloc_slot(0x1000).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(slot, SLOT_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0x90));
        assert!(cache.slots_consistent());
    }

    #[test]
    fn test_slot_state_consistency_check() {
        let mut cache = TranslationCache::new().unwrap();
        let slot = cache.alloc_slot(0x1000).unwrap();
        // stub state: the slot opens with the program-state save
        unsafe { slot.write(0x41) };
        assert!(cache.slots_consistent());
        // translated state: short jump over the stub region
        unsafe {
            slot.write(0xeb);
            slot.add(1).write((BODY_OFFSET - 2) as u8);
        }
        assert!(cache.slots_consistent());
        // anything else is a torn slot
        unsafe { slot.write(0xcc) };
        assert!(!cache.slots_consistent());
    }

    #[test]
    fn test_region_exhaustion() {
        let mut cache = TranslationCache::with_region_size(2 * SLOT_SIZE).unwrap();
        cache.alloc_slot(0x100).unwrap();
        cache.alloc_slot(0x200).unwrap();
        let err = cache.alloc_slot(0x300).unwrap_err();
        assert!(matches!(err, CacheError::OutOfSpace));
        // the failed allocation must not leave a mapping behind
        assert_eq!(cache.lookup(0x300), None);
    }
}
