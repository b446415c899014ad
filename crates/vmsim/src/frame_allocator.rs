//! Physical frame allocator for the simulated machine.
//!
//! The allocator owns the pool of physical frames, their reference counts, and the
//! simulated contents of each frame. Frames are handed out first-fit (lowest free frame
//! number first) and returned to the pool when their last reference is released.
//!
//! Pool bookkeeping (free set, reference counts, allocated flags) sits behind a single
//! lock so that `allocate`, `retain` and `release` are atomic with respect to each other.
//! Frame contents are locked per frame, so byte traffic against different frames never
//! contends.

use alloc::boxed::Box;
use alloc::collections::BTreeSet;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use crate::config::PAGE_SIZE;
use crate::frame::{Frame, FrameFlag};
use crate::{FrameNumber, PhysicalAddress, VmError};

struct FramePool {
    frames: Vec<Frame>,
    free: BTreeSet<FrameNumber>,
}

impl FramePool {
    fn frame_mut(&mut self, frame: FrameNumber) -> &mut Frame {
        let total = self.frames.len();
        self.frames
            .get_mut(frame.as_usize())
            .unwrap_or_else(|| panic!("{frame:?} is outside the pool of {total} frames"))
    }
}

/// Manages the pool of simulated physical frames.
pub struct FrameAllocator {
    pool: Mutex<FramePool>,
    memory: Box<[Mutex<Box<[u8]>>]>,
}

impl FrameAllocator {
    /// Creates an allocator managing `frame_count` zero-filled frames.
    pub fn new(frame_count: usize) -> Self {
        let memory = (0..frame_count)
            .map(|_| Mutex::new(vec![0u8; PAGE_SIZE].into_boxed_slice()))
            .collect();

        log::debug!("frame pool initialized with {frame_count} frames");

        Self {
            pool: Mutex::new(FramePool {
                frames: vec![Frame::default(); frame_count],
                free: (0..frame_count).map(FrameNumber::new).collect(),
            }),
            memory,
        }
    }

    /// Allocates the lowest-numbered free frame.
    ///
    /// The returned frame is zero-filled and carries one reference, owned by the caller.
    pub fn allocate(&self) -> Result<FrameNumber, VmError> {
        let frame = {
            let mut pool = self.pool.lock();
            let Some(frame) = pool.free.pop_first() else {
                log::warn!("frame pool exhausted");
                return Err(VmError::OutOfMemory);
            };
            pool.frame_mut(frame).claim();
            frame
        };

        // The frame is exclusively ours until a reference is handed out.
        self.memory[frame.as_usize()].lock().fill(0);

        #[cfg(feature = "detailed-logging")]
        log::trace!("allocated {frame:?}");

        Ok(frame)
    }

    /// Adds a reference to an allocated frame, returning the new count.
    ///
    /// # Panics
    /// Panics if the frame is free or outside the pool.
    pub fn retain(&self, frame: FrameNumber) -> usize {
        let count = self.pool.lock().frame_mut(frame).retain();

        #[cfg(feature = "detailed-logging")]
        log::trace!("retain {frame:?} -> {count}");

        count
    }

    /// Drops a reference to a frame, returning it to the free pool when the count reaches
    /// zero. Returns true if the frame was freed.
    ///
    /// # Panics
    /// Panics on reference count underflow or if the frame is outside the pool.
    pub fn release(&self, frame: FrameNumber) -> bool {
        let mut pool = self.pool.lock();
        let remaining = pool.frame_mut(frame).release();

        #[cfg(feature = "detailed-logging")]
        log::trace!("release {frame:?} -> {remaining}");

        if remaining == 0 {
            pool.free.insert(frame);
            true
        } else {
            false
        }
    }

    /// Returns the current reference count of a frame (zero for free frames).
    pub fn ref_count(&self, frame: FrameNumber) -> usize {
        self.pool.lock().frame_mut(frame).ref_count()
    }

    /// Returns true if the frame is currently allocated.
    pub fn is_allocated(&self, frame: FrameNumber) -> bool {
        self.pool
            .lock()
            .frame_mut(frame)
            .flags
            .test(FrameFlag::Allocated)
    }

    /// Returns every allocated frame with its reference count, in frame order.
    pub fn allocated_frames(&self) -> Vec<(FrameNumber, usize)> {
        let pool = self.pool.lock();
        pool.frames
            .iter()
            .enumerate()
            .filter(|(_, frame)| frame.flags.test(FrameFlag::Allocated))
            .map(|(number, frame)| (FrameNumber::new(number), frame.ref_count()))
            .collect()
    }

    /// Returns the number of frames managed by this allocator.
    pub fn total_frames(&self) -> usize {
        self.memory.len()
    }

    /// Returns the number of frames in the free pool.
    pub fn free_frames(&self) -> usize {
        self.pool.lock().free.len()
    }

    /// Reads one byte of simulated physical memory.
    ///
    /// # Panics
    /// Panics if the address is outside the pool.
    pub fn read_byte(&self, addr: PhysicalAddress) -> u8 {
        self.frame_memory(addr.frame_number()).lock()[addr.page_offset()]
    }

    /// Writes one byte of simulated physical memory.
    ///
    /// # Panics
    /// Panics if the address is outside the pool.
    pub fn write_byte(&self, addr: PhysicalAddress, value: u8) {
        self.frame_memory(addr.frame_number()).lock()[addr.page_offset()] = value;
    }

    /// Copies the full contents of `src` into `dst`.
    pub fn copy_frame(&self, src: FrameNumber, dst: FrameNumber) {
        if src == dst {
            return;
        }

        // Snapshot first so the two frame locks are never held together.
        let contents = self.frame_memory(src).lock().clone();
        self.frame_memory(dst).lock().copy_from_slice(&contents);
    }

    /// Returns a copy of a frame's contents.
    pub fn frame_bytes(&self, frame: FrameNumber) -> Box<[u8]> {
        self.frame_memory(frame).lock().clone()
    }

    fn frame_memory(&self, frame: FrameNumber) -> &Mutex<Box<[u8]>> {
        self.memory.get(frame.as_usize()).unwrap_or_else(|| {
            panic!(
                "{frame:?} is outside the pool of {} frames",
                self.memory.len()
            )
        })
    }
}
