//! Per-address-space page table.
//!
//! A `PageTable` maps virtual page numbers to [`PageTableEntry`] values and keeps the
//! owning address space's translation cache coherent: every change to an entry
//! invalidates (or refreshes) the cached translation before the change becomes visible.
//!
//! Each present entry owns exactly one reference on its frame. Callers mapping a frame
//! hand that reference to the table; the table releases it when the entry is replaced,
//! unmapped or cleared.

mod entry;
mod flags;

pub use entry::PageTableEntry;
pub use flags::{PageFlags, Permissions};

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::{AddressSpaceId, FrameAllocator, FrameNumber, PageNumber, TranslationCache};

/// Returned by [`PageTable::lookup`] and [`PageTable::unmap`] when a page has no entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotMapped(pub PageNumber);

pub struct PageTable {
    asid: AddressSpaceId,
    entries: BTreeMap<PageNumber, PageTableEntry>,
    frames: Arc<FrameAllocator>,
    tlb: Arc<Mutex<TranslationCache>>,
}

impl PageTable {
    /// Creates an empty page table for `asid`, invalidating through `tlb`.
    pub fn new(
        asid: AddressSpaceId,
        frames: Arc<FrameAllocator>,
        tlb: Arc<Mutex<TranslationCache>>,
    ) -> Self {
        Self {
            asid,
            entries: BTreeMap::new(),
            frames,
            tlb,
        }
    }

    pub fn asid(&self) -> AddressSpaceId {
        self.asid
    }

    /// Maps `page` to `frame`, replacing any existing entry.
    ///
    /// The caller transfers one reference on `frame` to the table. If an entry is
    /// replaced, its frame reference is released and the old entry returned. Permissions
    /// are not checked here; the MMU checks them at translation time.
    pub fn map(
        &mut self,
        page: PageNumber,
        frame: FrameNumber,
        permissions: Permissions,
        cow: bool,
    ) -> Option<PageTableEntry> {
        let mut entry = PageTableEntry::new(page, frame, permissions);
        entry.flags_mut().set_copy_on_write(cow);
        self.install(entry)
    }

    /// Installs a fully-formed entry. Same ownership rules as [`PageTable::map`].
    pub fn install(&mut self, entry: PageTableEntry) -> Option<PageTableEntry> {
        debug_assert!(entry.is_present(), "installing a non-present entry");

        self.tlb.lock().invalidate(self.asid, entry.page());
        let replaced = self.entries.insert(entry.page(), entry);
        if let Some(old) = replaced {
            self.frames.release(old.frame());
        }

        log::debug!(
            "{}: map page {} -> frame {} ({}{}{})",
            self.asid,
            entry.page(),
            entry.frame(),
            entry.permissions(),
            if entry.is_copy_on_write() { ", cow" } else { "" },
            if entry.is_shared() { ", shared" } else { "" },
        );

        replaced
    }

    /// Removes the entry for `page`, releasing its frame reference.
    pub fn unmap(&mut self, page: PageNumber) -> Result<PageTableEntry, NotMapped> {
        let entry = self.entries.remove(&page).ok_or(NotMapped(page))?;
        self.tlb.lock().invalidate(self.asid, page);
        self.frames.release(entry.frame());

        log::debug!("{}: unmap page {} (frame {})", self.asid, page, entry.frame());
        Ok(entry)
    }

    /// Returns the entry for `page`.
    pub fn lookup(&self, page: PageNumber) -> Result<PageTableEntry, NotMapped> {
        self.entries.get(&page).copied().ok_or(NotMapped(page))
    }

    /// Applies `update` to the flags of the entry for `page`, invalidating its cached
    /// translation. Returns the updated entry.
    pub fn update_flags(
        &mut self,
        page: PageNumber,
        update: impl FnOnce(&mut PageFlags),
    ) -> Result<PageTableEntry, NotMapped> {
        let entry = self.entries.get_mut(&page).ok_or(NotMapped(page))?;
        self.tlb.lock().invalidate(self.asid, page);
        update(entry.flags_mut());
        Ok(*entry)
    }

    /// Records a translation through `page`: sets the accessed bit (and the dirty bit
    /// for writes) and loads the resulting entry into the translation cache.
    pub fn record_access(
        &mut self,
        page: PageNumber,
        write: bool,
    ) -> Result<PageTableEntry, NotMapped> {
        let entry = self.entries.get_mut(&page).ok_or(NotMapped(page))?;
        let flags = entry.flags_mut();
        flags.set_accessed(true);
        if write {
            flags.set_dirty(true);
        }

        let entry = *entry;
        self.tlb
            .lock()
            .insert(self.asid, page, entry.frame(), entry.flags());
        Ok(entry)
    }

    /// Clones this table for a child address space with copy-on-write semantics.
    ///
    /// Every writable, non-shared entry is marked copy-on-write in both tables. Explicitly
    /// shared entries stay writable and shared. Each cloned entry retains its frame. Pages
    /// for which `skip` returns true are left out of the child. The parent's translation
    /// cache partition is flushed since its entries lost write access.
    pub fn clone_cow(
        &mut self,
        asid: AddressSpaceId,
        tlb: Arc<Mutex<TranslationCache>>,
        mut skip: impl FnMut(PageNumber) -> bool,
    ) -> PageTable {
        let mut child = PageTable::new(asid, self.frames.clone(), tlb);

        for entry in self.entries.values_mut() {
            if skip(entry.page()) {
                continue;
            }

            let flags = entry.flags_mut();
            if flags.permissions().is_writable() && !flags.is_shared() {
                flags.set_copy_on_write(true);
            }
            self.frames.retain(entry.frame());

            let mut copy = *entry;
            copy.flags_mut().set_accessed(false);
            copy.flags_mut().set_dirty(false);
            child.entries.insert(copy.page(), copy);
        }

        self.tlb.lock().invalidate_all(self.asid);

        log::debug!(
            "{}: cloned {} entries into {}",
            self.asid,
            child.entries.len(),
            asid
        );

        child
    }

    /// Removes every entry, releasing all frame references. Returns the removed entries.
    pub fn clear(&mut self) -> Vec<PageTableEntry> {
        let entries = core::mem::take(&mut self.entries);
        self.tlb.lock().invalidate_all(self.asid);
        for entry in entries.values() {
            self.frames.release(entry.frame());
        }
        entries.into_values().collect()
    }

    /// Iterates over entries in page order.
    pub fn iter(&self) -> impl Iterator<Item = &PageTableEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
