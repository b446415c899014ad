//! Address space management.
//!
//! An address space owns one page table, the set of regions registered against it, and
//! a translation cache partition tagged with its id. The page table and regions sit
//! behind one reader-writer lock; the translation cache has its own lock so that cache
//! hits never touch the page table.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spin::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::{PAGE_SIZE, SimulatorConfig};
use crate::page_table::{PageTable, PageTableEntry, Permissions};
use crate::{FrameAllocator, PageNumber, ThreadId, TranslationCache, VirtualAddress, VmError};

/// Identifies an address space (the simulator's process id / ASID).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct AddressSpaceId(usize);

impl AddressSpaceId {
    pub const fn new(id: usize) -> Self {
        Self(id)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for AddressSpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "as{}", self.0)
    }
}

/// What a region is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Heap, globals, or any other mapping requested through `map_region`.
    Data,
    /// A private thread stack. Never inherited through fork.
    Stack(ThreadId),
    /// Frames explicitly shared from another address space.
    Shared,
}

/// A contiguous range of virtual pages registered with an address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    start: PageNumber,
    pages: usize,
    permissions: Permissions,
    growable: bool,
    kind: RegionKind,
}

impl Region {
    pub const fn new(
        start: PageNumber,
        pages: usize,
        permissions: Permissions,
        growable: bool,
        kind: RegionKind,
    ) -> Self {
        Self {
            start,
            pages,
            permissions,
            growable,
            kind,
        }
    }

    /// Creates a private, eagerly mapped read/write stack region.
    pub const fn stack(start: PageNumber, pages: usize, thread: ThreadId) -> Self {
        Self::new(
            start,
            pages,
            Permissions::READ_WRITE,
            false,
            RegionKind::Stack(thread),
        )
    }

    pub const fn start(&self) -> PageNumber {
        self.start
    }

    /// Returns the first page past the end of this region.
    pub fn end(&self) -> PageNumber {
        self.start + self.pages
    }

    pub const fn pages(&self) -> usize {
        self.pages
    }

    pub const fn size(&self) -> usize {
        self.pages * PAGE_SIZE
    }

    pub const fn start_address(&self) -> VirtualAddress {
        self.start.start()
    }

    pub const fn permissions(&self) -> Permissions {
        self.permissions
    }

    /// Returns true if pages in this region are allocated on first touch.
    pub const fn is_growable(&self) -> bool {
        self.growable
    }

    pub const fn kind(&self) -> RegionKind {
        self.kind
    }

    pub const fn is_stack(&self) -> bool {
        matches!(self.kind, RegionKind::Stack(_))
    }

    pub fn contains(&self, page: PageNumber) -> bool {
        page >= self.start && page < self.end()
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        self.start < other.end() && other.start < self.end()
    }

    /// Iterates over the pages in this region.
    pub fn iter_pages(&self) -> impl Iterator<Item = PageNumber> + use<> {
        let start = self.start;
        (0..self.pages).map(move |i| start + i)
    }
}

/// Mutable state of an address space, guarded by the address space's lock.
pub struct AddressSpaceState {
    pub table: PageTable,
    /// Sorted by start page, never overlapping.
    regions: Vec<Region>,
    /// First page above the next thread stack.
    next_stack_top: PageNumber,
}

impl AddressSpaceState {
    fn new(table: PageTable, next_stack_top: PageNumber) -> Self {
        Self {
            table,
            regions: Vec::new(),
            next_stack_top,
        }
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn region_containing(&self, page: PageNumber) -> Option<&Region> {
        self.regions.iter().find(|region| region.contains(page))
    }

    /// Registers a region without mapping anything.
    pub fn add_region(&mut self, region: Region) -> Result<(), VmError> {
        if self.regions.iter().any(|existing| existing.overlaps(&region)) {
            return Err(VmError::Overlap);
        }
        let pos = self
            .regions
            .partition_point(|existing| existing.start < region.start);
        self.regions.insert(pos, region);
        Ok(())
    }

    /// Unregisters the region that starts at `start`, without unmapping it.
    pub fn remove_region(&mut self, start: PageNumber) -> Option<Region> {
        let pos = self.regions.iter().position(|r| r.start == start)?;
        Some(self.regions.remove(pos))
    }

    /// Registers `region` and, unless it is growable, backs every page with a fresh
    /// zero-filled frame. On failure nothing stays mapped or registered.
    pub fn map_region(&mut self, region: Region, frames: &FrameAllocator) -> Result<(), VmError> {
        self.add_region(region)?;
        if region.is_growable() {
            return Ok(());
        }

        for page in region.iter_pages() {
            match frames.allocate() {
                Ok(frame) => {
                    self.table.map(page, frame, region.permissions(), false);
                }
                Err(err) => {
                    self.unmap_region_pages(&region);
                    self.remove_region(region.start());
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Unmaps every present page of `region`, returning the removed entries.
    pub fn unmap_region_pages(&mut self, region: &Region) -> Vec<PageTableEntry> {
        region
            .iter_pages()
            .filter_map(|page| self.table.unmap(page).ok())
            .collect()
    }

    /// Carves a stack of `pages` pages below the previous one and maps it.
    pub fn map_stack(
        &mut self,
        thread: ThreadId,
        pages: usize,
        guard_pages: usize,
        frames: &FrameAllocator,
    ) -> Result<Region, VmError> {
        let top = self.next_stack_top.as_usize();
        let bottom = top.checked_sub(pages).ok_or(VmError::InvalidRange)?;
        let region = Region::stack(PageNumber::new(bottom), pages, thread);

        self.map_region(region, frames)?;
        self.next_stack_top = PageNumber::new(bottom.saturating_sub(guard_pages));
        Ok(region)
    }

    /// Maps a fresh stack for `thread` over the same pages as `template`.
    pub fn map_stack_like(
        &mut self,
        template: &Region,
        thread: ThreadId,
        frames: &FrameAllocator,
    ) -> Result<Region, VmError> {
        let region = Region::stack(template.start(), template.pages(), thread);
        self.map_region(region, frames)?;
        Ok(region)
    }

    /// Clones this state for a forked child.
    ///
    /// Data and shared regions are inherited with copy-on-write semantics. Stack regions
    /// and their pages are not inherited; the caller maps fresh stacks into the child.
    pub fn clone_for_fork(
        &mut self,
        child: AddressSpaceId,
        tlb: Arc<Mutex<TranslationCache>>,
    ) -> AddressSpaceState {
        let regions = &self.regions;
        let table = self.table.clone_cow(child, tlb, |page| {
            regions
                .iter()
                .any(|region| region.is_stack() && region.contains(page))
        });

        AddressSpaceState {
            table,
            regions: self
                .regions
                .iter()
                .filter(|region| !region.is_stack())
                .copied()
                .collect(),
            next_stack_top: self.next_stack_top,
        }
    }

    /// Unmaps everything and forgets every region.
    pub fn clear(&mut self) -> Vec<PageTableEntry> {
        self.regions.clear();
        self.table.clear()
    }
}

/// Translation counters for one address space.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TranslationStats {
    pub tlb_hits: u64,
    pub tlb_misses: u64,
    pub tlb_evictions: u64,
    pub table_walks: u64,
    pub faults_repaired: u64,
}

/// An address space is the simulator's representation of a process's virtual memory.
pub struct AddressSpace {
    id: AddressSpaceId,
    state: RwLock<AddressSpaceState>,
    tlb: Arc<Mutex<TranslationCache>>,
    terminated: AtomicBool,
    table_walks: AtomicU64,
    faults_repaired: AtomicU64,
}

impl AddressSpace {
    /// Creates an empty address space.
    pub fn new(id: AddressSpaceId, frames: Arc<FrameAllocator>, config: &SimulatorConfig) -> Self {
        let tlb = Arc::new(Mutex::new(TranslationCache::new(id, config.tlb_capacity)));
        let table = PageTable::new(id, frames, tlb.clone());
        let state = AddressSpaceState::new(table, config.stack_top.page_number());
        Self::from_parts(id, state, tlb)
    }

    /// Assembles an address space around existing state, e.g. a forked child's.
    pub fn from_parts(
        id: AddressSpaceId,
        state: AddressSpaceState,
        tlb: Arc<Mutex<TranslationCache>>,
    ) -> Self {
        debug_assert_eq!(state.table.asid(), id);
        Self {
            id,
            state: RwLock::new(state),
            tlb,
            terminated: AtomicBool::new(false),
            table_walks: AtomicU64::new(0),
            faults_repaired: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> AddressSpaceId {
        self.id
    }

    pub fn state(&self) -> RwLockReadGuard<'_, AddressSpaceState> {
        self.state.read()
    }

    pub fn state_mut(&self) -> RwLockWriteGuard<'_, AddressSpaceState> {
        self.state.write()
    }

    /// Returns this address space's translation cache partition.
    pub fn tlb(&self) -> &Mutex<TranslationCache> {
        &self.tlb
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Marks the address space terminated. Returns true if it was already terminated.
    pub fn mark_terminated(&self) -> bool {
        self.terminated.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn record_walk(&self) {
        self.table_walks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_repair(&self) {
        self.faults_repaired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> TranslationStats {
        let cache = self.tlb.lock().stats();
        TranslationStats {
            tlb_hits: cache.hits,
            tlb_misses: cache.misses,
            tlb_evictions: cache.evictions,
            table_walks: self.table_walks.load(Ordering::Relaxed),
            faults_repaired: self.faults_repaired.load(Ordering::Relaxed),
        }
    }
}
