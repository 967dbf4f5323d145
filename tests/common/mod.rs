// In-memory reference log shared by the integration tests. Implements the
// cleaner's three collaborator interfaces over the crate's segments: a
// segment pool with seglet accounting, a key index, tombstones tied to
// their target object's segment, and a replica map with immediate or
// manually released acknowledgement.
#![allow(dead_code)]

use ahash::{AHashMap, AHashSet};
use crossbeam_deque::{Injector, Steal};
use parking_lot::{Condvar, Mutex};
use segclean::{
    coarse_timestamp, EntryHandlers, EntryHeader, EntryKind, EntryRef, Liveness, Relocation,
    ReplicaManager, Segment, SegmentManager, SegmentRef,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub struct TestLogConfig {
    pub segment_size: u32,
    pub seglet_size: u32,
    pub total_segments: u32,
    pub backup_segments: u32,
}

impl Default for TestLogConfig {
    fn default() -> Self {
        Self {
            segment_size: 64 * 1024,
            seglet_size: 4096,
            total_segments: 32,
            backup_segments: 64,
        }
    }
}

/// Bytes every test entry occupies in a segment (header + padded payload)
pub const ENTRY_BYTES: usize = 1024;
/// Entries per 64 KiB segment at [`ENTRY_BYTES`]
pub const ENTRIES_PER_SEGMENT: usize = 64;

/// Eight-byte key for entry `i` of batch `batch`
pub fn batch_key(batch: u32, i: u32) -> Vec<u8> {
    format!("{batch:03}{i:05}").into_bytes()
}

/// Value sized so a key/value entry occupies exactly `target` bytes
pub fn value_for_entry_size(key: &[u8], target: usize) -> Vec<u8> {
    let overhead = EntryHeader::SIZE + 2 + key.len();
    assert!(target >= overhead && target % 8 == 0);
    vec![0x5A; target - overhead]
}

type RelocateHook = Box<dyn Fn(&[u8]) + Send + Sync>;

pub struct TestLog {
    segment_size: u32,
    seglet_size: u32,
    total_segments: u32,
    backup_segments: u32,
    free: Injector<SegmentRef>,
    next_id: AtomicU64,
    state: Mutex<LogState>,
    replication_cv: Condvar,
    relocate_hook: Mutex<Option<RelocateHook>>,
    replicate_calls: AtomicU64,
}

struct LogState {
    open: SegmentRef,
    closed: Vec<SegmentRef>,
    index: AHashMap<Vec<u8>, (SegmentRef, u32)>,
    disk: AHashSet<u64>,
    pending_replication: AHashSet<u64>,
    freed: AHashSet<u64>,
    seglets_free: u32,
    auto_ack: bool,
    last_survivors: Vec<SegmentRef>,
}

impl TestLog {
    pub fn new(config: TestLogConfig) -> Arc<Self> {
        let free = Injector::new();
        let next_id = AtomicU64::new(0);
        for _ in 0..config.total_segments {
            let id = next_id.fetch_add(1, Ordering::Relaxed);
            free.push(Segment::new(id, config.segment_size, config.seglet_size));
        }

        let open = loop {
            match free.steal() {
                Steal::Success(segment) => break segment,
                Steal::Retry => continue,
                Steal::Empty => unreachable!("pool was just filled"),
            }
        };

        let seglets_per_segment = config.segment_size / config.seglet_size;
        let seglets_free = config.total_segments * seglets_per_segment - seglets_per_segment;

        Arc::new(Self {
            segment_size: config.segment_size,
            seglet_size: config.seglet_size,
            total_segments: config.total_segments,
            backup_segments: config.backup_segments,
            free,
            next_id,
            state: Mutex::new(LogState {
                open,
                closed: Vec::new(),
                index: AHashMap::new(),
                disk: AHashSet::new(),
                pending_replication: AHashSet::new(),
                freed: AHashSet::new(),
                seglets_free,
                auto_ack: true,
                last_survivors: Vec::new(),
            }),
            replication_cv: Condvar::new(),
            relocate_hook: Mutex::new(None),
            replicate_calls: AtomicU64::new(0),
        })
    }

    fn seglets_per_segment(&self) -> u32 {
        self.segment_size / self.seglet_size
    }

    fn total_seglets(&self) -> u32 {
        self.total_segments * self.seglets_per_segment()
    }

    fn take_free(&self) -> Option<SegmentRef> {
        loop {
            match self.free.steal() {
                Steal::Success(segment) => {
                    segment.recycle(self.next_id.fetch_add(1, Ordering::Relaxed));
                    return Some(segment);
                }
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    pub fn write(&self, key: &[u8], value: &[u8]) {
        self.write_with_timestamp(key, value, coarse_timestamp());
    }

    pub fn write_with_timestamp(&self, key: &[u8], value: &[u8], timestamp: u32) {
        let mut payload = Vec::with_capacity(2 + key.len() + value.len());
        payload.extend_from_slice(&(key.len() as u16).to_le_bytes());
        payload.extend_from_slice(key);
        payload.extend_from_slice(value);

        let mut state = self.state.lock();
        loop {
            let open = state.open.clone();
            match open.append(EntryKind::Object, timestamp, &payload) {
                Ok(offset) => {
                    if let Some((segment, old_offset)) =
                        state.index.insert(key.to_vec(), (open, offset))
                    {
                        segment.mark_dead(old_offset);
                    }
                    return;
                }
                Err(_) => self.rotate_open(&mut state),
            }
        }
    }

    pub fn delete(&self, key: &[u8]) {
        self.delete_with_timestamp(key, coarse_timestamp());
    }

    pub fn delete_with_timestamp(&self, key: &[u8], timestamp: u32) {
        let mut state = self.state.lock();
        let Some((segment, offset)) = state.index.remove(key) else {
            return;
        };
        segment.mark_dead(offset);

        let mut payload = Vec::with_capacity(8 + key.len());
        payload.extend_from_slice(&segment.id().to_le_bytes());
        payload.extend_from_slice(key);

        loop {
            let open = state.open.clone();
            if open
                .append(EntryKind::Tombstone, timestamp, &payload)
                .is_ok()
            {
                return;
            }
            self.rotate_open(&mut state);
        }
    }

    pub fn read(&self, key: &[u8]) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let (segment, offset) = state.index.get(key)?;
        let entry = EntryRef::new(segment, *offset);
        let payload = entry.payload();
        let key_len = u16::from_le_bytes([payload[0], payload[1]]) as usize;
        Some(payload[2 + key_len..].to_vec())
    }

    fn rotate_open(&self, state: &mut LogState) {
        let replacement = self.take_free().expect("log out of segments");
        state.seglets_free -= self.seglets_per_segment();
        let old = std::mem::replace(&mut state.open, replacement);
        old.close();
        // Head-of-log replication is immediate here; the waits worth
        // exercising are the ones on survivors
        state.disk.insert(old.id());
        old.make_cleanable();
        state.closed.push(old);
    }

    // ---- test inspection and control ----

    pub fn closed_segments(&self) -> Vec<SegmentRef> {
        self.state.lock().closed.clone()
    }

    pub fn last_survivors(&self) -> Vec<SegmentRef> {
        self.state.lock().last_survivors.clone()
    }

    pub fn freed_ids(&self) -> AHashSet<u64> {
        self.state.lock().freed.clone()
    }

    pub fn seglets_free(&self) -> u32 {
        self.state.lock().seglets_free
    }

    pub fn free_segment_count(&self) -> usize {
        self.free.len()
    }

    pub fn replicate_calls(&self) -> u64 {
        self.replicate_calls.load(Ordering::Relaxed)
    }

    pub fn set_auto_ack(&self, auto_ack: bool) {
        self.state.lock().auto_ack = auto_ack;
    }

    /// Acknowledge every replication currently in flight
    pub fn ack_all_replication(&self) {
        let mut state = self.state.lock();
        let pending: Vec<u64> = state.pending_replication.drain().collect();
        for id in pending {
            state.disk.insert(id);
        }
        self.replication_cv.notify_all();
    }

    /// Install a hook that runs just before each object's index swing,
    /// receiving the object's key. Lets tests overwrite an object while it
    /// is being relocated.
    pub fn set_relocate_hook(&self, hook: RelocateHook) {
        *self.relocate_hook.lock() = Some(hook);
    }
}

fn object_key(payload: &[u8]) -> &[u8] {
    let len = u16::from_le_bytes([payload[0], payload[1]]) as usize;
    &payload[2..2 + len]
}

fn tombstone_target(payload: &[u8]) -> u64 {
    u64::from_le_bytes(payload[..8].try_into().unwrap())
}

impl SegmentManager for TestLog {
    fn cleanable_candidates(&self) -> Vec<SegmentRef> {
        self.state.lock().closed.clone()
    }

    fn reserve_survivors(&self, n: usize) -> Option<Vec<SegmentRef>> {
        let mut state = self.state.lock();
        let mut reserved = Vec::with_capacity(n);
        for _ in 0..n {
            match self.take_free() {
                Some(segment) => {
                    state.seglets_free -= self.seglets_per_segment();
                    reserved.push(segment);
                }
                None => {
                    // Not enough segments for the full reservation; hand
                    // back what was taken
                    for segment in reserved {
                        state.seglets_free += self.seglets_per_segment();
                        self.free.push(segment);
                    }
                    return None;
                }
            }
        }
        Some(reserved)
    }

    fn release_survivor(&self, survivor: SegmentRef) {
        let mut state = self.state.lock();
        state.seglets_free += survivor.seglets_held();
        self.free.push(survivor);
    }

    fn cleaning_complete(&self, inputs: &[SegmentRef], survivors: Vec<SegmentRef>) {
        let mut state = self.state.lock();

        for survivor in &survivors {
            // The cleaner already trimmed trailing seglets; credit them back
            state.seglets_free += self.seglets_per_segment() - survivor.seglets_held();
            survivor.make_cleanable();
            state.disk.insert(survivor.id());
            state.closed.push(survivor.clone());
        }

        for input in inputs {
            input.make_freeable();
            state.closed.retain(|segment| !Arc::ptr_eq(segment, input));
            state.seglets_free += input.seglets_held();
            state.disk.remove(&input.id());
            state.freed.insert(input.id());
            self.free.push(input.clone());
        }

        state.last_survivors = survivors;
    }

    fn compaction_complete(&self, old: &SegmentRef, new: Option<SegmentRef>) {
        let mut state = self.state.lock();
        let position = state
            .closed
            .iter()
            .position(|segment| Arc::ptr_eq(segment, old))
            .expect("compacted segment is not a candidate");

        match new {
            Some(survivor) => {
                // Same identity, fewer seglets; the disk image is untouched
                survivor.adopt_identity(old);
                survivor.make_cleanable();
                state.seglets_free += self.seglets_per_segment() - survivor.seglets_held();
                state.closed[position] = survivor;
            }
            None => {
                // Nothing was live; retire the segment entirely
                state.closed.remove(position);
                state.disk.remove(&old.id());
                state.freed.insert(old.id());
            }
        }

        state.seglets_free += old.seglets_held();
        old.make_freeable();
        self.free.push(old.clone());
    }

    fn seglet_size(&self) -> u32 {
        self.seglet_size
    }

    fn segment_size(&self) -> u32 {
        self.segment_size
    }

    fn memory_utilization(&self) -> u32 {
        let state = self.state.lock();
        let total = self.total_seglets();
        ((total - state.seglets_free) as u64 * 100 / total as u64) as u32
    }

    fn disk_utilization(&self) -> u32 {
        let state = self.state.lock();
        (state.disk.len() as u64 * 100 / self.backup_segments as u64) as u32
    }
}

impl ReplicaManager for TestLog {
    fn replicate_closed(&self, segment: &SegmentRef) {
        self.replicate_calls.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        if state.auto_ack {
            state.disk.insert(segment.id());
        } else {
            state.pending_replication.insert(segment.id());
        }
    }

    fn await_replication(&self, segment: &SegmentRef) {
        let mut state = self.state.lock();
        while !state.disk.contains(&segment.id()) {
            self.replication_cv.wait(&mut state);
        }
    }
}

impl EntryHandlers for TestLog {
    fn check_liveness(&self, entry: EntryRef<'_>) -> Liveness {
        match entry.kind() {
            EntryKind::Object => {
                let key = object_key(entry.payload());
                let state = self.state.lock();
                match state.index.get(key) {
                    Some((segment, offset))
                        if Arc::ptr_eq(segment, entry.segment()) && *offset == entry.offset() =>
                    {
                        Liveness::Live
                    }
                    _ => Liveness::Dead,
                }
            }
            EntryKind::Tombstone => {
                let target = tombstone_target(entry.payload());
                if self.state.lock().freed.contains(&target) {
                    Liveness::Dead
                } else {
                    Liveness::Live
                }
            }
            EntryKind::Opaque => Liveness::Live,
        }
    }

    fn timestamp(&self, entry: EntryRef<'_>) -> u32 {
        entry.timestamp()
    }

    fn relocate(&self, old: EntryRef<'_>, new: EntryRef<'_>) -> Relocation {
        if old.kind() != EntryKind::Object {
            // Tombstones and opaque entries carry no index state to swing
            return Relocation::Accepted;
        }

        let key = object_key(old.payload()).to_vec();

        // The hook may write; run it before taking the lock
        {
            let hook = self.relocate_hook.lock();
            if let Some(hook) = hook.as_ref() {
                hook(&key);
            }
        }

        let mut state = self.state.lock();
        match state.index.get_mut(&key) {
            Some(location)
                if Arc::ptr_eq(&location.0, old.segment()) && location.1 == old.offset() =>
            {
                *location = (new.segment().clone(), new.offset());
                Relocation::Accepted
            }
            _ => Relocation::DiedMeanwhile,
        }
    }
}

/// Write `batches` batches of [`ENTRIES_PER_SEGMENT`] entries, each batch
/// stamped `start_ts + batch`, then one extra entry so the last full
/// segment rotates into the candidate list.
pub fn fill_segments(log: &TestLog, batches: u32, start_ts: u32) {
    for batch in 0..batches {
        let ts = start_ts + batch;
        for i in 0..ENTRIES_PER_SEGMENT as u32 {
            let key = batch_key(batch, i);
            let value = value_for_entry_size(&key, ENTRY_BYTES);
            log.write_with_timestamp(&key, &value, ts);
        }
    }
    let key = batch_key(999, 0);
    let value = value_for_entry_size(&key, ENTRY_BYTES);
    log.write_with_timestamp(&key, &value, start_ts + batches);
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
