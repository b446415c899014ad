//! Translation cache (TLB model).
//!
//! Each address space owns one cache partition. Entries are tagged with the address-space
//! id, mirroring hardware ASID tagging, so a lookup only ever matches translations that
//! were inserted for the same id. The cache holds a bounded number of entries ordered from
//! most to least recently used; invalidated slots are reused first, and only when none
//! are left is the least recently used valid entry evicted. An evicted translation is
//! simply re-resolved from the page table on the next miss.

use alloc::vec::Vec;

use crate::page_table::PageFlags;
use crate::{AddressSpaceId, FrameNumber, PageNumber};

/// A cached translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbEntry {
    asid: AddressSpaceId,
    page: PageNumber,
    frame: FrameNumber,
    /// Snapshot of the page table entry's flags at the time it was cached.
    flags: PageFlags,
    valid: bool,
}

impl TlbEntry {
    pub fn asid(&self) -> AddressSpaceId {
        self.asid
    }

    pub fn page(&self) -> PageNumber {
        self.page
    }

    pub fn frame(&self) -> FrameNumber {
        self.frame
    }

    pub fn flags(&self) -> PageFlags {
        self.flags
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    fn matches(&self, asid: AddressSpaceId, page: PageNumber) -> bool {
        self.valid && self.asid == asid && self.page == page
    }
}

/// Hit, miss and eviction counters for one cache partition.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// A bounded, LRU-ordered cache of virtual-to-physical translations.
pub struct TranslationCache {
    owner: AddressSpaceId,
    /// Most recently used first.
    entries: Vec<TlbEntry>,
    capacity: usize,
    stats: CacheStats,
}

impl TranslationCache {
    /// Creates an empty cache partition for `owner` with room for `capacity` entries.
    ///
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn new(owner: AddressSpaceId, capacity: usize) -> Self {
        assert!(capacity > 0, "translation cache needs at least one entry");
        Self {
            owner,
            entries: Vec::with_capacity(capacity),
            capacity,
            stats: CacheStats::default(),
        }
    }

    pub fn owner(&self) -> AddressSpaceId {
        self.owner
    }

    /// Looks up a translation, promoting it to most recently used on a hit.
    pub fn lookup(&mut self, asid: AddressSpaceId, page: PageNumber) -> Option<TlbEntry> {
        match self.position(asid, page) {
            Some(pos) => {
                let entry = self.entries.remove(pos);
                self.entries.insert(0, entry);
                self.stats.hits += 1;
                log::trace!("{asid}: tlb hit page {page} -> frame {}", entry.frame);
                Some(entry)
            }
            None => {
                self.stats.misses += 1;
                log::trace!("{asid}: tlb miss page {page}");
                None
            }
        }
    }

    /// Returns a cached translation without touching recency or counters.
    pub fn probe(&self, asid: AddressSpaceId, page: PageNumber) -> Option<TlbEntry> {
        self.position(asid, page).map(|pos| self.entries[pos])
    }

    /// Caches a translation, replacing any existing entry for the same page.
    pub fn insert(
        &mut self,
        asid: AddressSpaceId,
        page: PageNumber,
        frame: FrameNumber,
        flags: PageFlags,
    ) {
        if let Some(pos) = self.position(asid, page) {
            self.entries.remove(pos);
        } else if let Some(pos) = self.entries.iter().rposition(|e| !e.valid) {
            self.entries.remove(pos);
        } else if self.entries.len() >= self.capacity {
            if let Some(evicted) = self.entries.pop() {
                self.stats.evictions += 1;
                log::trace!("{}: tlb evict page {}", evicted.asid, evicted.page);
            }
        }

        self.entries.insert(
            0,
            TlbEntry {
                asid,
                page,
                frame,
                flags,
                valid: true,
            },
        );
    }

    /// Invalidates the translation for one page. Returns true if one was cached.
    pub fn invalidate(&mut self, asid: AddressSpaceId, page: PageNumber) -> bool {
        match self.position(asid, page) {
            Some(pos) => {
                self.entries[pos].valid = false;
                true
            }
            None => false,
        }
    }

    /// Invalidates every translation tagged with `asid`. Returns how many were dropped.
    pub fn invalidate_all(&mut self, asid: AddressSpaceId) -> usize {
        let mut dropped = 0;
        for entry in self.entries.iter_mut().filter(|e| e.valid && e.asid == asid) {
            entry.valid = false;
            dropped += 1;
        }
        if dropped > 0 {
            log::trace!("{asid}: tlb flushed {dropped} entries");
        }
        dropped
    }

    /// Returns the number of valid entries.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.valid).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    fn position(&self, asid: AddressSpaceId, page: PageNumber) -> Option<usize> {
        self.entries.iter().position(|e| e.matches(asid, page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_table::Permissions;

    const A: AddressSpaceId = AddressSpaceId::new(1);
    const B: AddressSpaceId = AddressSpaceId::new(2);

    fn flags() -> PageFlags {
        PageFlags::present(Permissions::READ_WRITE)
    }

    fn page(n: usize) -> PageNumber {
        PageNumber::new(n)
    }

    fn frame(n: usize) -> FrameNumber {
        FrameNumber::new(n)
    }

    #[test]
    fn insert_and_lookup() {
        let mut tlb = TranslationCache::new(A, 4);
        assert!(tlb.lookup(A, page(1)).is_none());

        tlb.insert(A, page(1), frame(7), flags());
        let entry = tlb.lookup(A, page(1)).unwrap();

        assert_eq!(entry.frame(), frame(7));
        assert!(entry.is_valid());
        assert_eq!(
            tlb.stats(),
            CacheStats {
                hits: 1,
                misses: 1,
                evictions: 0
            }
        );
    }

    #[test]
    fn entries_are_tagged_by_address_space() {
        let mut tlb = TranslationCache::new(A, 4);
        tlb.insert(A, page(1), frame(7), flags());
        tlb.insert(B, page(1), frame(9), flags());

        assert_eq!(tlb.lookup(A, page(1)).unwrap().frame(), frame(7));
        assert_eq!(tlb.lookup(B, page(1)).unwrap().frame(), frame(9));

        tlb.invalidate_all(B);
        assert!(tlb.lookup(B, page(1)).is_none());
        assert!(tlb.lookup(A, page(1)).is_some());
    }

    #[test]
    fn evicts_least_recently_used() {
        let mut tlb = TranslationCache::new(A, 2);
        tlb.insert(A, page(1), frame(1), flags());
        tlb.insert(A, page(2), frame(2), flags());

        // Touch page 1 so page 2 becomes the eviction candidate.
        tlb.lookup(A, page(1));
        tlb.insert(A, page(3), frame(3), flags());

        assert!(tlb.probe(A, page(1)).is_some());
        assert!(tlb.probe(A, page(2)).is_none());
        assert!(tlb.probe(A, page(3)).is_some());
        assert_eq!(tlb.stats().evictions, 1);
        assert_eq!(tlb.len(), 2);
    }

    #[test]
    fn invalid_slots_are_reused_before_eviction() {
        let mut tlb = TranslationCache::new(A, 2);
        tlb.insert(A, page(1), frame(1), flags());
        tlb.insert(A, page(2), frame(2), flags());
        assert!(tlb.invalidate(A, page(2)));

        tlb.insert(A, page(3), frame(3), flags());

        assert!(tlb.probe(A, page(1)).is_some());
        assert!(tlb.probe(A, page(3)).is_some());
        assert_eq!(tlb.stats().evictions, 0);
    }

    #[test]
    fn insert_replaces_existing_translation() {
        let mut tlb = TranslationCache::new(A, 2);
        tlb.insert(A, page(1), frame(1), flags());
        tlb.insert(A, page(1), frame(5), flags());

        assert_eq!(tlb.len(), 1);
        assert_eq!(tlb.probe(A, page(1)).unwrap().frame(), frame(5));
    }

    #[test]
    fn invalidate_missing_page() {
        let mut tlb = TranslationCache::new(A, 2);
        assert!(!tlb.invalidate(A, page(1)));
        assert_eq!(tlb.invalidate_all(A), 0);
        assert!(tlb.is_empty());
    }

    #[test]
    fn probe_does_not_count() {
        let mut tlb = TranslationCache::new(A, 2);
        tlb.insert(A, page(1), frame(1), flags());
        tlb.probe(A, page(1));
        tlb.probe(A, page(2));
        assert_eq!(tlb.stats(), CacheStats::default());
    }
}
