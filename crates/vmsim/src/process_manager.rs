//! Process and address-space lifecycle.
//!
//! The process manager is the simulator's front door. It owns the frame allocator, the
//! shared-memory registry and every live address space and thread, and it is the only
//! place address spaces are created or torn down. A fatal fault raised while serving an
//! access tears the faulting address space down before the error is returned; later
//! calls naming it see [`VmError::NotFound`].
//!
//! Lock order, outermost first: process table, address-space state (two states are
//! always taken in id order), thread table, translation cache, shared registry, frame
//! allocator. The process table lock is never held while an address space is locked.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::{Mutex, RwLock};

use crate::address_space::{Region, RegionKind};
use crate::config::{MAX_FAULT_RETRIES, PAGE_SIZE, USER_ADDRESS_LIMIT};
use crate::human_size::HumanSize;
use crate::mmu;
use crate::page_table::{PageTableEntry, Permissions};
use crate::shared_memory::ShareKind;
use crate::{
    AccessType, AccountingError, AddressSpace, AddressSpaceId, FaultHandler, FrameAllocator,
    FrameNumber, PageNumber, PhysicalAddress, SharedMemoryRegistry, SimulatorConfig, Thread,
    ThreadId, TranslationCache, TranslationStats, VirtualAddress, VmError,
};

pub struct ProcessManager {
    config: SimulatorConfig,
    frames: Arc<FrameAllocator>,
    shared: SharedMemoryRegistry,
    spaces: RwLock<BTreeMap<AddressSpaceId, Arc<AddressSpace>>>,
    threads: RwLock<BTreeMap<ThreadId, Thread>>,
    next_space_id: AtomicUsize,
    next_thread_id: AtomicUsize,
}

impl ProcessManager {
    pub fn new(config: SimulatorConfig) -> Self {
        let frames = Arc::new(FrameAllocator::new(config.frame_count));
        log::info!(
            "simulator started: {} of physical memory, {} translation cache entries per address space",
            HumanSize(config.frame_count * PAGE_SIZE),
            config.tlb_capacity
        );

        Self {
            config,
            shared: SharedMemoryRegistry::new(frames.clone()),
            frames,
            spaces: RwLock::new(BTreeMap::new()),
            threads: RwLock::new(BTreeMap::new()),
            next_space_id: AtomicUsize::new(1),
            next_thread_id: AtomicUsize::new(1),
        }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    pub fn frames(&self) -> &FrameAllocator {
        &self.frames
    }

    pub fn shared_memory(&self) -> &SharedMemoryRegistry {
        &self.shared
    }

    pub fn free_frames(&self) -> usize {
        self.frames.free_frames()
    }

    pub fn total_frames(&self) -> usize {
        self.frames.total_frames()
    }

    /// Creates an empty address space.
    pub fn create_process(&self) -> AddressSpaceId {
        let id = self.allocate_space_id();
        let space = Arc::new(AddressSpace::new(id, self.frames.clone(), &self.config));
        self.spaces.write().insert(id, space);

        log::info!("{id}: created");
        id
    }

    /// Forks `parent` into a new address space.
    ///
    /// Non-stack mappings are shared copy-on-write (explicitly shared mappings stay
    /// shared). Every parent thread gets a counterpart in the child with a fresh,
    /// zero-filled stack at the same virtual range.
    pub fn fork(&self, parent: AddressSpaceId) -> Result<AddressSpaceId, VmError> {
        let parent_space = self.space(parent)?;
        let child_id = self.allocate_space_id();
        let tlb = Arc::new(Mutex::new(TranslationCache::new(
            child_id,
            self.config.tlb_capacity,
        )));

        let (state, stacks) = {
            let mut parent_state = parent_space.state_mut();
            if parent_space.is_terminated() {
                return Err(VmError::NotFound);
            }

            let state = parent_state.clone_for_fork(child_id, tlb.clone());
            for entry in state.table.iter() {
                let kind = if entry.is_shared() {
                    ShareKind::Explicit
                } else {
                    ShareKind::CopyOnWrite
                };
                self.shared.record(entry.frame(), kind, parent, entry.page());
                self.shared.record(entry.frame(), kind, child_id, entry.page());
            }

            let stacks: Vec<Region> = parent_state
                .regions()
                .iter()
                .filter(|region| region.is_stack())
                .copied()
                .collect();
            (state, stacks)
        };

        let child = Arc::new(AddressSpace::from_parts(child_id, state, tlb));
        let mut threads = Vec::with_capacity(stacks.len());
        {
            let mut child_state = child.state_mut();
            for stack in &stacks {
                let id = self.allocate_thread_id();
                match child_state.map_stack_like(stack, id, &self.frames) {
                    Ok(region) => {
                        threads.push(Thread::new(
                            id,
                            child_id,
                            region.start_address(),
                            region.size(),
                        ));
                    }
                    Err(err) => {
                        log::warn!("{parent}: fork failed mapping child stacks: {err}");
                        child_state.clear();
                        drop(child_state);
                        self.shared.forget_space(child_id);
                        return Err(err);
                    }
                }
            }
        }

        self.threads
            .write()
            .extend(threads.iter().map(|thread| (thread.id(), *thread)));
        self.spaces.write().insert(child_id, child);

        log::info!(
            "{parent}: forked into {child_id} with {} threads",
            threads.len()
        );
        Ok(child_id)
    }

    /// Creates a thread in `asid` with a private stack of at least `stack_size` bytes.
    pub fn create_thread(
        &self,
        asid: AddressSpaceId,
        stack_size: usize,
    ) -> Result<ThreadId, VmError> {
        if stack_size == 0 {
            return Err(VmError::InvalidRange);
        }
        let space = self.space(asid)?;
        let pages = stack_size.div_ceil(PAGE_SIZE);
        let id = self.allocate_thread_id();

        let mut state = space.state_mut();
        if space.is_terminated() {
            return Err(VmError::NotFound);
        }
        let region = state.map_stack(id, pages, self.config.stack_guard_pages, &self.frames)?;

        // Registered under the state lock so a concurrent teardown cannot miss it.
        let thread = Thread::new(id, asid, region.start_address(), region.size());
        self.threads.write().insert(id, thread);
        drop(state);

        log::info!(
            "{asid}: created thread {id}, stack {}..{}",
            thread.stack_base(),
            thread.stack_top()
        );
        Ok(id)
    }

    /// Removes a thread and unmaps its stack.
    pub fn exit_thread(&self, id: ThreadId) -> Result<(), VmError> {
        let thread = self.thread(id).ok_or(VmError::NotFound)?;
        let space = self.space(thread.space())?;

        let mut state = space.state_mut();
        let stack = state
            .regions()
            .iter()
            .find(|region| region.kind() == RegionKind::Stack(id))
            .copied();
        if let Some(stack) = stack {
            state.remove_region(stack.start());
            for entry in state.unmap_region_pages(&stack) {
                self.shared.forget(entry.frame(), space.id(), entry.page());
            }
        }
        self.threads.write().remove(&id);
        drop(state);

        log::info!("{}: thread {id} exited", space.id());
        Ok(())
    }

    /// Registers a region of `len` bytes at `start`.
    ///
    /// `start` must be page-aligned; `len` is rounded up to whole pages. Non-growable
    /// regions are backed immediately; growable ones fault their pages in on first touch.
    pub fn map_region(
        &self,
        asid: AddressSpaceId,
        start: VirtualAddress,
        len: usize,
        permissions: Permissions,
        growable: bool,
    ) -> Result<(), VmError> {
        let (page, pages) = page_range(start, len)?;
        let space = self.space(asid)?;
        let region = Region::new(page, pages, permissions, growable, RegionKind::Data);

        let mut state = space.state_mut();
        if space.is_terminated() {
            return Err(VmError::NotFound);
        }
        state.map_region(region, &self.frames)?;

        log::debug!(
            "{asid}: mapped {} at {start} ({permissions}{})",
            HumanSize(region.size()),
            if growable { ", growable" } else { "" }
        );
        Ok(())
    }

    /// Unmaps the region registered exactly at `start` with length `len`.
    ///
    /// Thread stacks are only released through [`ProcessManager::exit_thread`].
    pub fn unmap_region(
        &self,
        asid: AddressSpaceId,
        start: VirtualAddress,
        len: usize,
    ) -> Result<(), VmError> {
        let (page, pages) = page_range(start, len)?;
        let space = self.space(asid)?;

        let mut state = space.state_mut();
        let region = state
            .regions()
            .iter()
            .find(|region| region.start() == page && region.pages() == pages)
            .copied()
            .filter(|region| !region.is_stack())
            .ok_or(VmError::InvalidRange)?;

        state.remove_region(region.start());
        for entry in state.unmap_region_pages(&region) {
            self.shared.forget(entry.frame(), asid, entry.page());
        }

        log::debug!("{asid}: unmapped {} at {start}", HumanSize(region.size()));
        Ok(())
    }

    /// Maps `len` bytes of `source` starting at `source_start` into `target` at
    /// `target_start`, so both address spaces see the same frames.
    ///
    /// Copy-on-write source pages are made private first so the share cannot be split by a
    /// later write. Unpopulated pages of growable source regions are populated. Asking for
    /// more access than the source mapping grants fails with
    /// [`VmError::PermissionDenied`].
    pub fn share_region(
        &self,
        source: AddressSpaceId,
        source_start: VirtualAddress,
        target: AddressSpaceId,
        target_start: VirtualAddress,
        len: usize,
        permissions: Permissions,
    ) -> Result<(), VmError> {
        if source == target {
            return Err(VmError::InvalidRange);
        }
        let (source_page, pages) = page_range(source_start, len)?;
        let (target_page, _) = page_range(target_start, len)?;
        let source_space = self.space(source)?;
        let target_space = self.space(target)?;

        let (mut source_state, mut target_state) = if source < target {
            let s = source_space.state_mut();
            (s, target_space.state_mut())
        } else {
            let t = target_space.state_mut();
            (source_space.state_mut(), t)
        };
        if source_space.is_terminated() || target_space.is_terminated() {
            return Err(VmError::NotFound);
        }

        // Validate the whole source range before touching anything.
        for page in (0..pages).map(|i| source_page + i) {
            let granted = match source_state.table.lookup(page) {
                Ok(entry) => entry.permissions(),
                Err(_) => match source_state.region_containing(page) {
                    Some(region) if region.is_growable() => region.permissions(),
                    _ => return Err(VmError::InvalidRange),
                },
            };
            if !granted.contains(permissions) {
                return Err(VmError::PermissionDenied);
            }
        }

        let region = Region::new(target_page, pages, permissions, false, RegionKind::Shared);
        target_state.add_region(region)?;

        // Make every source page private and present before any of them is flagged shared.
        let handler = FaultHandler::new(&self.frames, &self.shared);
        for page in (0..pages).map(|i| source_page + i) {
            let prepared = match source_state.table.lookup(page) {
                Ok(entry) if entry.is_copy_on_write() => handler
                    .break_cow(&mut source_state, source, page)
                    .map(|_| ()),
                Ok(_) => Ok(()),
                Err(_) => {
                    let permissions = source_state
                        .region_containing(page)
                        .map(Region::permissions)
                        .unwrap_or(Permissions::NONE);
                    self.frames.allocate().map(|frame| {
                        source_state.table.map(page, frame, permissions, false);
                    })
                }
            };
            if let Err(err) = prepared {
                target_state.remove_region(region.start());
                log::debug!("{source}: share with {target} failed: {err}");
                return Err(err);
            }
        }

        let mut flagged = Vec::new();
        for i in 0..pages {
            let page = source_page + i;
            let result = source_state
                .table
                .lookup(page)
                .map_err(VmError::from)
                .and_then(|entry| {
                    if !entry.is_shared() {
                        source_state
                            .table
                            .update_flags(page, |flags| flags.set_shared(true))?;
                        flagged.push(page);
                    }
                    self.shared
                        .record(entry.frame(), ShareKind::Explicit, source, page);
                    self.shared
                        .share(&mut target_state, entry.frame(), target_page + i, permissions)
                });

            if let Err(err) = result {
                for entry in target_state.unmap_region_pages(&region) {
                    self.shared.forget(entry.frame(), target, entry.page());
                }
                target_state.remove_region(region.start());
                for page in flagged {
                    if let Ok(entry) = source_state
                        .table
                        .update_flags(page, |flags| flags.set_shared(false))
                    {
                        self.shared.forget(entry.frame(), source, page);
                    }
                }
                log::debug!("{source}: share with {target} failed: {err}");
                return Err(err);
            }
        }

        log::debug!(
            "{source}: shared {} at {source_start} with {target} at {target_start} ({permissions})",
            HumanSize(region.size())
        );
        Ok(())
    }

    /// Translates `address` in `asid` for `access`, repairing faults along the way.
    ///
    /// A fatal fault tears the address space down before the error is returned.
    pub fn access(
        &self,
        asid: AddressSpaceId,
        address: VirtualAddress,
        access: AccessType,
    ) -> Result<PhysicalAddress, VmError> {
        let space = self.space(asid)?;
        let handler = FaultHandler::new(&self.frames, &self.shared);

        match mmu::resolve(&space, &handler, address, access) {
            Err(err) if err.is_fatal() => {
                drop(space);
                self.terminate(asid, err, address);
                Err(err)
            }
            result => result,
        }
    }

    /// Reads one byte through the MMU.
    pub fn read_byte(&self, asid: AddressSpaceId, address: VirtualAddress) -> Result<u8, VmError> {
        self.with_physical(asid, address, AccessType::Read, |physical| {
            self.frames.read_byte(physical)
        })
    }

    /// Writes one byte through the MMU.
    pub fn write_byte(
        &self,
        asid: AddressSpaceId,
        address: VirtualAddress,
        value: u8,
    ) -> Result<(), VmError> {
        self.with_physical(asid, address, AccessType::Write, |physical| {
            self.frames.write_byte(physical, value)
        })
    }

    /// Translates `address` and runs `op` on the result while holding the address space's
    /// state lock, so the frame cannot be released or remapped before `op` finishes.
    ///
    /// The translation is retried if the mapping changed between [`Self::access`] and
    /// taking the lock.
    fn with_physical<R>(
        &self,
        asid: AddressSpaceId,
        address: VirtualAddress,
        access: AccessType,
        op: impl FnOnce(PhysicalAddress) -> R,
    ) -> Result<R, VmError> {
        for _ in 0..=MAX_FAULT_RETRIES {
            let physical = self.access(asid, address, access)?;
            let space = self.space(asid)?;
            let state = space.state();
            if space.is_terminated() {
                return Err(VmError::NotFound);
            }

            let unchanged = state.table.lookup(address.page_number()).is_ok_and(|entry| {
                entry.frame() == physical.frame_number()
                    && mmu::check_access(entry.flags(), access).is_ok()
            });
            if unchanged {
                return Ok(op(physical));
            }
            log::trace!("{asid}: {access} {address} remapped before the access landed");
        }

        log::error!("{asid}: {access} {address} kept being remapped, giving up");
        self.terminate(asid, VmError::SegmentationFault, address);
        Err(VmError::SegmentationFault)
    }

    /// Destroys an address space and its threads, releasing every frame it maps.
    pub fn destroy_process(&self, asid: AddressSpaceId) -> Result<(), VmError> {
        let removed = self.spaces.write().remove(&asid);
        let space = removed.ok_or(VmError::NotFound)?;
        self.teardown(&space);
        Ok(())
    }

    /// Returns the present entries of `asid`'s page table in page order.
    pub fn inspect_page_table(&self, asid: AddressSpaceId) -> Result<Vec<PageTableEntry>, VmError> {
        let space = self.space(asid)?;
        let state = space.state();
        Ok(state.table.iter().copied().collect())
    }

    /// Returns the regions registered with `asid`, in address order.
    pub fn regions(&self, asid: AddressSpaceId) -> Result<Vec<Region>, VmError> {
        let space = self.space(asid)?;
        let state = space.state();
        Ok(state.regions().to_vec())
    }

    pub fn translation_stats(&self, asid: AddressSpaceId) -> Result<TranslationStats, VmError> {
        Ok(self.space(asid)?.stats())
    }

    /// Returns the ids of every live address space.
    pub fn process_ids(&self) -> Vec<AddressSpaceId> {
        self.spaces
            .read()
            .iter()
            .filter(|(_, space)| !space.is_terminated())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn thread(&self, id: ThreadId) -> Option<Thread> {
        self.threads.read().get(&id).copied()
    }

    /// Returns the threads of `asid` in creation order.
    pub fn threads_of(&self, asid: AddressSpaceId) -> Result<Vec<Thread>, VmError> {
        self.space(asid)?;
        Ok(self
            .threads
            .read()
            .values()
            .filter(|thread| thread.space() == asid)
            .copied()
            .collect())
    }

    /// Checks that every frame's reference count equals the number of present page table
    /// entries referencing it, across all address spaces.
    ///
    /// Only meaningful while no other operation is in flight.
    pub fn check_frame_accounting(&self) -> Result<(), AccountingError> {
        let spaces: Vec<_> = self.spaces.read().values().cloned().collect();

        let mut mappings: BTreeMap<FrameNumber, usize> = BTreeMap::new();
        for space in &spaces {
            for entry in space.state().table.iter() {
                *mappings.entry(entry.frame()).or_default() += 1;
            }
        }

        for (frame, actual) in self.frames.allocated_frames() {
            let expected = mappings.remove(&frame).unwrap_or(0);
            if expected != actual {
                return Err(AccountingError {
                    frame,
                    expected,
                    actual,
                });
            }
        }

        match mappings.into_iter().next() {
            Some((frame, expected)) => Err(AccountingError {
                frame,
                expected,
                actual: 0,
            }),
            None => Ok(()),
        }
    }

    fn space(&self, asid: AddressSpaceId) -> Result<Arc<AddressSpace>, VmError> {
        let spaces = self.spaces.read();
        match spaces.get(&asid) {
            Some(space) if !space.is_terminated() => Ok(space.clone()),
            _ => Err(VmError::NotFound),
        }
    }

    /// Removes `asid` from the process table after a fatal fault and tears it down.
    fn terminate(&self, asid: AddressSpaceId, err: VmError, address: VirtualAddress) {
        let removed = self.spaces.write().remove(&asid);
        if let Some(space) = removed {
            log::warn!("{asid}: terminated by {err} at {address}");
            self.teardown(&space);
        }
    }

    fn teardown(&self, space: &AddressSpace) {
        let id = space.id();
        space.mark_terminated();

        let released = space.state_mut().clear();
        self.threads.write().retain(|_, thread| thread.space() != id);
        self.shared.forget_space(id);

        log::info!("{id}: destroyed, released {} mappings", released.len());
    }

    fn allocate_space_id(&self) -> AddressSpaceId {
        AddressSpaceId::new(self.next_space_id.fetch_add(1, Ordering::Relaxed))
    }

    fn allocate_thread_id(&self) -> ThreadId {
        ThreadId::new(self.next_thread_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new(SimulatorConfig::default())
    }
}

/// Validates a user byte range and converts it to its first page and page count.
fn page_range(start: VirtualAddress, len: usize) -> Result<(PageNumber, usize), VmError> {
    if len == 0 || !start.is_aligned(PAGE_SIZE) {
        return Err(VmError::InvalidRange);
    }
    let pages = len.div_ceil(PAGE_SIZE);
    let last = pages
        .checked_mul(PAGE_SIZE)
        .and_then(|bytes| start.as_usize().checked_add(bytes - 1))
        .ok_or(VmError::InvalidRange)?;
    if last > USER_ADDRESS_LIMIT {
        return Err(VmError::InvalidRange);
    }
    Ok((start.page_number(), pages))
}
