use crate::entry::{EntryHeader, EntryKind};
use crate::sync::{fence, spin_loop, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

/// Shared handle to a segment. The segment manager owns every segment; the
/// cleaner holds handles only for the duration of a pass.
pub type SegmentRef = Arc<Segment>;

/// State of a segment in its lifecycle
///
/// - **Open**: tail segment accepting appends. Never cleaner input.
/// - **Closed**: sealed, replication of the original contents in flight.
/// - **Cleanable**: sealed and fully replicated; eligible for cleaning.
/// - **Freeable**: retired by a cleaning pass; the manager reclaims it.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Open = 0,
    Closed = 1,
    Cleanable = 2,
    Freeable = 3,
}

impl SegmentState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SegmentState::Open,
            1 => SegmentState::Closed,
            2 => SegmentState::Cleanable,
            3 => SegmentState::Freeable,
            _ => panic!("invalid segment state value: {value}"),
        }
    }
}

/// Error type for segment appends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendError {
    /// Not enough room left for the entry
    Full,
}

/// A fixed-capacity append-only region of log memory, carved into seglets.
///
/// All mutable state lives in atomics so that foreground writers can append
/// to an open segment while other threads read closed ones. Accounting
/// (live/dead bytes, seglets held) is what the cleaner's policy and selection
/// run on, so it is maintained here rather than derived by scanning.
#[repr(C, align(64))]
pub struct Segment {
    id: AtomicU64,
    state: AtomicU8,
    capacity: u32,
    seglet_size: u32,
    data: NonNull<u8>,
    layout: Layout,
    write_offset: AtomicU32,
    entry_count: AtomicU32,
    live_bytes: AtomicU32,
    dead_bytes: AtomicU32,
    seglets_held: AtomicU32,
    // u32::MAX until the first stamped entry lands
    min_timestamp: AtomicU32,
}

// Safety: the raw data pointer is owned by the segment and all shared
// mutation goes through atomics or offsets reserved by a single writer.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Allocate a new open segment. `capacity` must be a multiple of
    /// `seglet_size`, which must be a power of two.
    pub fn new(id: u64, capacity: u32, seglet_size: u32) -> SegmentRef {
        assert!(capacity > 0, "segment capacity must be non-zero");
        assert!(
            seglet_size.is_power_of_two(),
            "seglet size must be a power of two"
        );
        assert!(
            capacity % seglet_size == 0,
            "segment capacity must be a multiple of the seglet size"
        );

        let layout = Layout::from_size_align(capacity as usize, 64)
            .expect("failed to create segment layout");
        let data = unsafe { alloc_zeroed(layout) };
        if data.is_null() {
            panic!("failed to allocate {capacity} bytes for segment");
        }

        Arc::new(Segment {
            id: AtomicU64::new(id),
            state: AtomicU8::new(SegmentState::Open as u8),
            capacity,
            seglet_size,
            data: unsafe { NonNull::new_unchecked(data) },
            layout,
            write_offset: AtomicU32::new(0),
            entry_count: AtomicU32::new(0),
            live_bytes: AtomicU32::new(0),
            dead_bytes: AtomicU32::new(0),
            seglets_held: AtomicU32::new(capacity / seglet_size),
            min_timestamp: AtomicU32::new(u32::MAX),
        })
    }

    pub fn id(&self) -> u64 {
        self.id.load(Ordering::Relaxed)
    }

    /// Take over the identity of another segment. Used by segment managers
    /// when a compacted replacement is swapped in for its source: tombstones
    /// reference their target object's segment by identity, so an in-memory
    /// compaction must not mint a new one.
    pub fn adopt_identity(&self, source: &Segment) {
        self.id.store(source.id(), Ordering::Relaxed);
    }

    /// Reinitialize a freed segment for reuse under a new identity. The
    /// caller must guarantee that no references into the old contents remain.
    pub fn recycle(&self, id: u64) {
        self.id.store(id, Ordering::Relaxed);
        self.write_offset.store(0, Ordering::Relaxed);
        self.entry_count.store(0, Ordering::Relaxed);
        self.live_bytes.store(0, Ordering::Relaxed);
        self.dead_bytes.store(0, Ordering::Relaxed);
        self.seglets_held
            .store(self.capacity / self.seglet_size, Ordering::Relaxed);
        self.min_timestamp.store(u32::MAX, Ordering::Relaxed);
        self.state.store(SegmentState::Open as u8, Ordering::Release);
    }

    pub fn state(&self) -> SegmentState {
        SegmentState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Seal the segment: no further appends.
    pub fn close(&self) {
        self.transition(SegmentState::Open, SegmentState::Closed);
    }

    /// Mark the sealed segment as fully replicated and eligible for cleaning.
    pub fn make_cleanable(&self) {
        self.transition(SegmentState::Closed, SegmentState::Cleanable);
    }

    /// Retire the segment after a cleaning pass. Also legal straight from
    /// Closed, for managers that retire segments that never became
    /// candidates.
    pub fn make_freeable(&self) {
        let current = self.state();
        match current {
            SegmentState::Closed | SegmentState::Cleanable => {
                self.transition(current, SegmentState::Freeable)
            }
            other => panic!(
                "segment {}: invalid transition {:?} -> Freeable",
                self.id(),
                other
            ),
        }
    }

    fn transition(&self, from: SegmentState, to: SegmentState) {
        if let Err(actual) = self.state.compare_exchange(
            from as u8,
            to as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            panic!(
                "segment {}: invalid transition {:?} -> {:?} (currently {:?})",
                self.id(),
                from,
                to,
                SegmentState::from_u8(actual)
            );
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn seglet_size(&self) -> u32 {
        self.seglet_size
    }

    /// Append an entry, reserving space by CAS so concurrent writers never
    /// overlap. Returns the offset the entry landed at.
    pub fn append(
        &self,
        kind: EntryKind,
        timestamp: u32,
        payload: &[u8],
    ) -> Result<u32, AppendError> {
        debug_assert_eq!(self.state(), SegmentState::Open);

        let header = EntryHeader::new(kind, payload.len() as u32, timestamp);
        let padded = header.padded_size() as u32;

        // Reserve space
        let mut current = self.write_offset.load(Ordering::Relaxed);
        let offset = loop {
            let end = match current.checked_add(padded) {
                Some(end) if end <= self.capacity => end,
                _ => return Err(AppendError::Full),
            };
            match self.write_offset.compare_exchange_weak(
                current,
                end,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break current,
                Err(actual) => {
                    current = actual;
                    spin_loop();
                }
            }
        };

        // Write header and payload into the reserved region
        unsafe {
            let dst = self.data.as_ptr().add(offset as usize);
            let bytes = header.to_bytes();
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, EntryHeader::SIZE);
            std::ptr::copy_nonoverlapping(
                payload.as_ptr(),
                dst.add(EntryHeader::SIZE),
                payload.len(),
            );
        }

        // Publish the bytes before the accounting that makes them visible
        fence(Ordering::Release);

        self.entry_count.fetch_add(1, Ordering::Relaxed);
        self.live_bytes.fetch_add(padded, Ordering::Relaxed);

        if timestamp != 0 {
            let mut min = self.min_timestamp.load(Ordering::Relaxed);
            while timestamp < min {
                match self.min_timestamp.compare_exchange_weak(
                    min,
                    timestamp,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(actual) => min = actual,
                }
            }
        }

        Ok(offset)
    }

    /// Flag the entry at `offset` as dead and move its bytes from the live
    /// to the dead tally. Idempotent.
    pub fn mark_dead(&self, offset: u32) {
        let header = self.header_at(offset);
        if header.dead {
            return;
        }

        unsafe {
            let flags = self.data.as_ptr().add(offset as usize + 1);
            std::ptr::write_volatile(flags, EntryHeader::FLAG_DEAD);
        }
        fence(Ordering::Release);

        let padded = header.padded_size() as u32;
        self.live_bytes.fetch_sub(padded, Ordering::Relaxed);
        self.dead_bytes.fetch_add(padded, Ordering::Relaxed);
    }

    /// Walk all entries appended so far, in log order.
    pub fn entries(&self) -> EntryIter<'_> {
        // Synchronize with the Release fence in append()
        fence(Ordering::Acquire);
        EntryIter {
            segment: self,
            offset: 0,
            end: self.write_offset.load(Ordering::Acquire),
        }
    }

    pub(crate) fn header_at(&self, offset: u32) -> EntryHeader {
        let end = self.write_offset.load(Ordering::Acquire) as u64;
        if offset as u64 + EntryHeader::SIZE as u64 > end {
            panic!(
                "segment {}: entry header at offset {} out of bounds ({} bytes appended)",
                self.id(),
                offset,
                end
            );
        }

        let header = EntryHeader::from_bytes(unsafe {
            std::slice::from_raw_parts(
                self.data.as_ptr().add(offset as usize),
                EntryHeader::SIZE,
            )
        });

        if offset as u64 + header.padded_size() as u64 > end {
            panic!(
                "segment {}: corrupt entry at offset {} extends past write offset",
                self.id(),
                offset
            );
        }

        header
    }

    pub(crate) fn entry_payload(&self, offset: u32) -> &[u8] {
        let header = self.header_at(offset);
        unsafe {
            std::slice::from_raw_parts(
                self.data.as_ptr().add(offset as usize + EntryHeader::SIZE),
                header.len as usize,
            )
        }
    }

    /// Bytes appended so far, padding included.
    pub fn bytes_appended(&self) -> u32 {
        self.write_offset.load(Ordering::Acquire)
    }

    pub fn entry_count(&self) -> u32 {
        self.entry_count.load(Ordering::Relaxed)
    }

    pub fn live_bytes(&self) -> u32 {
        self.live_bytes.load(Ordering::Relaxed)
    }

    pub fn dead_bytes(&self) -> u32 {
        self.dead_bytes.load(Ordering::Relaxed)
    }

    pub fn seglets_held(&self) -> u32 {
        self.seglets_held.load(Ordering::Relaxed)
    }

    /// Earliest timestamp among stamped entries, if any landed.
    pub fn min_timestamp(&self) -> Option<u32> {
        match self.min_timestamp.load(Ordering::Relaxed) {
            u32::MAX => None,
            ts => Some(ts),
        }
    }

    /// Live bytes as a fraction of a full segment, the `u` in the
    /// cost/benefit score.
    pub fn live_fraction(&self) -> f64 {
        self.live_bytes() as f64 / self.capacity as f64
    }

    /// Percent of the memory this segment still holds that is live. A
    /// segment that holds no seglets has nothing left to compact.
    pub fn memory_utilization(&self) -> u32 {
        let held_bytes = self.seglets_held() as u64 * self.seglet_size as u64;
        if held_bytes == 0 {
            return 100;
        }
        (self.live_bytes() as u64 * 100 / held_bytes) as u32
    }

    /// Seglets an in-memory compaction of this segment would give back.
    pub fn freeable_seglets(&self) -> u32 {
        let live = self.live_bytes();
        let needed = (live + self.seglet_size - 1) / self.seglet_size;
        self.seglets_held().saturating_sub(needed)
    }

    /// Shrink the held-seglet count to what the appended bytes actually
    /// occupy, returning how many seglets were given back. Called on
    /// survivors once a pass stops appending to them.
    pub fn release_unused_seglets(&self) -> u32 {
        let appended = self.bytes_appended();
        let needed = (appended + self.seglet_size - 1) / self.seglet_size;
        let held = self.seglets_held.load(Ordering::Relaxed);
        let freed = held.saturating_sub(needed);
        self.seglets_held.store(needed, Ordering::Relaxed);
        freed
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        unsafe {
            dealloc(self.data.as_ptr(), self.layout);
        }
    }
}

/// Iterator over `(offset, header)` pairs of a segment's entries.
pub struct EntryIter<'a> {
    segment: &'a Segment,
    offset: u32,
    end: u32,
}

impl Iterator for EntryIter<'_> {
    type Item = (u32, EntryHeader);

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.end {
            return None;
        }
        let offset = self.offset;
        let header = self.segment.header_at(offset);
        self.offset += header.padded_size() as u32;
        Some((offset, header))
    }
}
