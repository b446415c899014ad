//! Physical frame metadata.

/// Holds bookkeeping for one physical frame.
///
/// Frames are owned collectively by the page-table entries that reference them; the
/// reference count tracks how many present entries point here. All access happens under
/// the [`FrameAllocator`](crate::FrameAllocator) pool lock.
#[derive(Debug, Default, Clone, Copy)]
pub struct Frame {
    /// Flags identifying the state of this frame.
    pub flags: FrameFlags,
    ref_count: usize,
}

impl Frame {
    /// Returns the number of references held on this frame.
    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    /// Marks the frame allocated with a single reference.
    pub fn claim(&mut self) {
        debug_assert!(!self.flags.test(FrameFlag::Allocated));
        self.flags.set(FrameFlag::Allocated);
        self.ref_count = 1;
    }

    /// Adds a reference, returning the new count.
    ///
    /// # Panics
    /// Panics if the frame is not allocated.
    pub fn retain(&mut self) -> usize {
        assert!(
            self.flags.test(FrameFlag::Allocated),
            "retain of a free frame"
        );
        self.ref_count += 1;
        self.ref_count
    }

    /// Drops a reference, returning the remaining count. The frame is marked free when
    /// the count reaches zero.
    ///
    /// # Panics
    /// Panics if the reference count would underflow.
    pub fn release(&mut self) -> usize {
        assert!(self.ref_count > 0, "frame reference count underflow");
        self.ref_count -= 1;
        if self.ref_count == 0 {
            self.flags.clear(FrameFlag::Allocated);
        }
        self.ref_count
    }
}

#[derive(Debug, Clone, Copy)]
pub enum FrameFlag {
    /// Frame is in use by at least one mapping.
    Allocated = 1 << 0,
}

/// Flags for a physical frame.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Creates a new `FrameFlags` instance with all flags cleared.
    pub const fn new() -> Self {
        Self(0)
    }

    pub fn set(&mut self, flag: FrameFlag) {
        self.0 |= flag as u8;
    }

    pub fn clear(&mut self, flag: FrameFlag) {
        self.0 &= !(flag as u8);
    }

    pub fn test(&self, flag: FrameFlag) -> bool {
        (self.0 & flag as u8) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_retain_release() {
        let mut frame = Frame::default();
        frame.claim();
        assert!(frame.flags.test(FrameFlag::Allocated));
        assert_eq!(frame.retain(), 2);
        assert_eq!(frame.release(), 1);
        assert_eq!(frame.release(), 0);
        assert!(!frame.flags.test(FrameFlag::Allocated));
    }

    #[test]
    #[should_panic(expected = "frame reference count underflow")]
    fn release_free_frame() {
        let mut frame = Frame::default();
        frame.release();
    }

    #[test]
    #[should_panic(expected = "retain of a free frame")]
    fn retain_free_frame() {
        let mut frame = Frame::default();
        frame.retain();
    }

    #[test]
    fn flags_set_and_clear() {
        let mut flags = FrameFlags::new();
        assert!(!flags.test(FrameFlag::Allocated));
        flags.set(FrameFlag::Allocated);
        assert!(flags.test(FrameFlag::Allocated));
        flags.clear(FrameFlag::Allocated);
        assert!(!flags.test(FrameFlag::Allocated));
    }
}
