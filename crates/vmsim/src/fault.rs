//! Page fault handling.
//!
//! The handler repairs what can be repaired and reports everything else as fatal:
//!
//! - `NotPresent` inside a growable region allocates a zero-filled frame on demand.
//!   Anywhere else it is a segmentation fault.
//! - `ProtectionViolation` is always fatal.
//! - `CowWrite` makes the page private: the last owner upgrades the entry in place,
//!   anyone else gets a fresh copy of the frame.
//!
//! A fatal fault marks the address space terminated. Tearing it down is the process
//! manager's job; the handler never removes an address space.

use crate::address_space::AddressSpaceState;
use crate::page_table::NotMapped;
use crate::{
    AccessType, AddressSpace, AddressSpaceId, Fault, FrameAllocator, FrameNumber, PageNumber,
    SharedMemoryRegistry, VirtualAddress, VmError,
};

/// What the handler did to repair a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repair {
    /// A growable region page was backed by a new frame.
    DemandAllocated(FrameNumber),
    /// The faulting address space was the last owner; the entry became writable in place.
    CowUpgraded(FrameNumber),
    /// The page was copied into a private frame.
    CowCopied { from: FrameNumber, to: FrameNumber },
    /// Another thread repaired the page first.
    AlreadyResolved,
}

impl From<NotMapped> for VmError {
    fn from(_: NotMapped) -> Self {
        VmError::SegmentationFault
    }
}

pub struct FaultHandler<'a> {
    frames: &'a FrameAllocator,
    shared: &'a SharedMemoryRegistry,
}

impl<'a> FaultHandler<'a> {
    pub fn new(frames: &'a FrameAllocator, shared: &'a SharedMemoryRegistry) -> Self {
        Self { frames, shared }
    }

    /// Handles one fault raised while translating `address` in `space`.
    pub fn handle(
        &self,
        space: &AddressSpace,
        address: VirtualAddress,
        access: AccessType,
        fault: Fault,
    ) -> Result<Repair, VmError> {
        let page = address.page_number();
        let result = match fault {
            Fault::NotPresent => self.handle_not_present(space, page),
            Fault::ProtectionViolation => Err(VmError::ProtectionViolation),
            Fault::CowWrite => {
                let mut state = space.state_mut();
                self.break_cow(&mut state, space.id(), page)
            }
        };

        match result {
            Ok(repair) => {
                space.record_repair();
                log::debug!("{}: {fault:?} at {address} repaired: {repair:?}", space.id());
                Ok(repair)
            }
            Err(err) if err.is_fatal() => {
                log::warn!("{}: {err} on {access} at {address}", space.id());
                space.mark_terminated();
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    fn handle_not_present(&self, space: &AddressSpace, page: PageNumber) -> Result<Repair, VmError> {
        let mut state = space.state_mut();
        if state.table.lookup(page).is_ok() {
            return Ok(Repair::AlreadyResolved);
        }

        let permissions = match state.region_containing(page) {
            Some(region) if region.is_growable() => region.permissions(),
            _ => return Err(VmError::SegmentationFault),
        };

        let frame = self.frames.allocate()?;
        state.table.map(page, frame, permissions, false);
        Ok(Repair::DemandAllocated(frame))
    }

    /// Gives `asid` a private, writable copy of a copy-on-write page.
    ///
    /// The caller holds the address space's state lock, which keeps the frame's reference
    /// count from growing underneath us: only a fork or share of this address space could
    /// add references, and both need the same lock.
    pub fn break_cow(
        &self,
        state: &mut AddressSpaceState,
        asid: AddressSpaceId,
        page: PageNumber,
    ) -> Result<Repair, VmError> {
        let Ok(entry) = state.table.lookup(page) else {
            return Ok(Repair::AlreadyResolved);
        };
        if !entry.is_copy_on_write() {
            return Ok(Repair::AlreadyResolved);
        }

        let old = entry.frame();
        if self.frames.ref_count(old) == 1 {
            state
                .table
                .update_flags(page, |flags| flags.set_copy_on_write(false))?;
            self.shared.forget(old, asid, page);
            return Ok(Repair::CowUpgraded(old));
        }

        let new = self.frames.allocate()?;
        self.frames.copy_frame(old, new);
        state.table.map(page, new, entry.permissions(), false);
        self.shared.forget(old, asid, page);
        Ok(Repair::CowCopied { from: old, to: new })
    }
}
