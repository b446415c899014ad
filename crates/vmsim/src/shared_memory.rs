//! Bookkeeping for frames mapped by more than one address space.
//!
//! A frame ends up in several page tables in two ways: a fork leaves parent and child
//! pointing at the same frames until one of them writes (copy-on-write), and an explicit
//! share maps a frame into another address space on purpose. The registry records who
//! participates in each. Reference counts stay with the frame allocator; the registry
//! only answers "who else maps this frame, and why".
//!
//! A frame drops out of the registry once one participant or fewer remains.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::address_space::AddressSpaceState;
use crate::page_table::{PageTableEntry, Permissions};
use crate::{AddressSpaceId, FrameAllocator, FrameNumber, PageNumber, VmError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareKind {
    /// Inherited through fork; every writer gets a private copy.
    CopyOnWrite,
    /// Mapped into several address spaces on request; writes are visible to everyone.
    Explicit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedRegion {
    kind: ShareKind,
    members: BTreeSet<(AddressSpaceId, PageNumber)>,
}

impl SharedRegion {
    pub fn kind(&self) -> ShareKind {
        self.kind
    }

    /// The (address space, page) pairs mapping the frame.
    pub fn members(&self) -> impl Iterator<Item = (AddressSpaceId, PageNumber)> + '_ {
        self.members.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

pub struct SharedMemoryRegistry {
    regions: Mutex<BTreeMap<FrameNumber, SharedRegion>>,
    frames: Arc<FrameAllocator>,
}

impl SharedMemoryRegistry {
    pub fn new(frames: Arc<FrameAllocator>) -> Self {
        Self {
            regions: Mutex::new(BTreeMap::new()),
            frames,
        }
    }

    /// Maps an existing `frame` at `page` in the address space owning `state`.
    ///
    /// The new entry takes its own reference on the frame and carries the shared flag, so
    /// a later fork keeps it shared rather than copy-on-write.
    pub fn share(
        &self,
        state: &mut AddressSpaceState,
        frame: FrameNumber,
        page: PageNumber,
        permissions: Permissions,
    ) -> Result<(), VmError> {
        if state.table.lookup(page).is_ok() {
            return Err(VmError::Overlap);
        }

        self.frames.retain(frame);
        let mut entry = PageTableEntry::new(page, frame, permissions);
        entry.flags_mut().set_shared(true);
        state.table.install(entry);

        self.record(frame, ShareKind::Explicit, state.table.asid(), page);
        Ok(())
    }

    /// Removes a shared mapping. Equivalent to unmapping the page.
    pub fn unshare(
        &self,
        state: &mut AddressSpaceState,
        page: PageNumber,
    ) -> Result<PageTableEntry, VmError> {
        let asid = state.table.asid();
        let entry = state.table.unmap(page).map_err(|_| VmError::NotFound)?;
        self.forget(entry.frame(), asid, page);
        Ok(entry)
    }

    /// Records that `asid` maps `frame` at `page`. An explicit share wins over
    /// copy-on-write for the whole frame.
    pub fn record(
        &self,
        frame: FrameNumber,
        kind: ShareKind,
        asid: AddressSpaceId,
        page: PageNumber,
    ) {
        let mut regions = self.regions.lock();
        let region = regions.entry(frame).or_insert_with(|| SharedRegion {
            kind,
            members: BTreeSet::new(),
        });
        if kind == ShareKind::Explicit {
            region.kind = ShareKind::Explicit;
        }
        region.members.insert((asid, page));
    }

    /// Removes one participant from a frame's record.
    pub fn forget(&self, frame: FrameNumber, asid: AddressSpaceId, page: PageNumber) {
        let mut regions = self.regions.lock();
        if let Some(region) = regions.get_mut(&frame) {
            region.members.remove(&(asid, page));
            if region.members.len() <= 1 {
                regions.remove(&frame);
            }
        }
    }

    /// Removes every participation of `asid`.
    pub fn forget_space(&self, asid: AddressSpaceId) {
        let mut regions = self.regions.lock();
        regions.retain(|_, region| {
            region.members.retain(|(member, _)| *member != asid);
            region.members.len() > 1
        });
    }

    /// Returns the (address space, page) pairs sharing `frame`, or nothing if the frame
    /// is private.
    pub fn participants(&self, frame: FrameNumber) -> Vec<(AddressSpaceId, PageNumber)> {
        self.regions
            .lock()
            .get(&frame)
            .map(|region| region.members().collect())
            .unwrap_or_default()
    }

    pub fn region(&self, frame: FrameNumber) -> Option<SharedRegion> {
        self.regions.lock().get(&frame).cloned()
    }

    pub fn is_shared(&self, frame: FrameNumber) -> bool {
        self.regions.lock().contains_key(&frame)
    }

    /// Returns the number of frames currently shared.
    pub fn len(&self) -> usize {
        self.regions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.lock().is_empty()
    }
}
