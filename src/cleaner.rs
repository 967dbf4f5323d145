use crate::candidates::CandidateSet;
use crate::entry::coarse_timestamp;
use crate::policy::{self, Decision, PolicyView};
use crate::relocate::{self, PassOutcome, Relocator};
use crate::select;
use crate::stats::CleanerStats;
use crate::sync::{AtomicU8, Ordering};
use crate::{
    CleanerError, EntryHandlers, ReplicaManager, SegmentManager, MAX_LIVE_SEGMENTS_PER_DISK_PASS,
    POLL_USEC, SURVIVOR_SEGMENTS_TO_RESERVE,
};
use log::{debug, error, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Lifecycle of the background cleaner task.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanerState {
    Stopped = 0,
    Running = 1,
    Stopping = 2,
}

impl CleanerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => CleanerState::Stopped,
            1 => CleanerState::Running,
            2 => CleanerState::Stopping,
            _ => panic!("invalid cleaner state value: {value}"),
        }
    }
}

/// Builder for constructing a Cleaner with custom configuration
pub struct CleanerBuilder {
    write_cost_threshold: f64,
    poll_interval: Duration,
    survivor_reserve: usize,
    max_pass_live_segments: usize,
}

impl CleanerBuilder {
    pub fn new() -> Self {
        Self {
            write_cost_threshold: 2.0,
            poll_interval: Duration::from_micros(POLL_USEC),
            survivor_reserve: SURVIVOR_SEGMENTS_TO_RESERVE,
            max_pass_live_segments: MAX_LIVE_SEGMENTS_PER_DISK_PASS,
        }
    }

    /// How much work memory cleaning may do per byte freed before the
    /// cleaner falls back to a disk pass. Must be at least 1.0.
    pub fn write_cost_threshold(mut self, threshold: f64) -> Self {
        self.write_cost_threshold = threshold;
        self
    }

    /// How long to sleep when a tick finds nothing to do
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Survivor segments reserved up-front per disk pass. Must exceed the
    /// pass's live-segment budget so worst-case fragmentation cannot stall
    /// a pass mid-relocation.
    pub fn survivor_reserve(mut self, segments: usize) -> Self {
        self.survivor_reserve = segments;
        self
    }

    /// Upper bound on live data copied per disk pass, in full segments
    pub fn max_pass_live_segments(mut self, segments: usize) -> Self {
        self.max_pass_live_segments = segments;
        self
    }

    /// Build the Cleaner around its three collaborators. The segment
    /// manager owns all segments, the replica manager makes survivors
    /// durable, and the entry handlers own liveness and the index.
    pub fn build<M, R, H>(
        self,
        manager: Arc<M>,
        replica: Arc<R>,
        handlers: Arc<H>,
    ) -> Cleaner<M, R, H>
    where
        M: SegmentManager,
        R: ReplicaManager,
        H: EntryHandlers,
    {
        assert!(
            self.write_cost_threshold >= 1.0,
            "write cost threshold must be at least 1.0"
        );
        assert!(
            self.survivor_reserve > self.max_pass_live_segments,
            "survivor reservation must exceed the disk pass live-segment budget"
        );

        Cleaner {
            core: Arc::new(CleanerCore {
                manager,
                replica,
                handlers,
                write_cost_threshold: self.write_cost_threshold,
                poll_interval: self.poll_interval,
                survivor_reserve: self.survivor_reserve,
                max_pass_live_segments: self.max_pass_live_segments,
                stats: CleanerStats::new(),
                state: AtomicU8::new(CleanerState::Stopped as u8),
                last_error: Mutex::new(None),
            }),
            thread: Mutex::new(None),
        }
    }
}

impl Default for CleanerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The log cleaner: reclaims space from a log's closed segments by writing
/// out live data to new survivor segments and handing both back to the
/// segment manager.
///
/// Cleaning comes in two flavors. An in-memory compaction rewrites a single
/// segment into fewer seglets, touching neither disk nor backups. A disk
/// pass relocates the live entries of a whole batch of segments, chosen by
/// cost/benefit, into replicated survivors so the inputs can be freed in
/// memory and on their backups. The cleaner segregates survivors by entry
/// age: old data fragments slowly and keeps its segments cheap to own,
/// while young data concentrates where it can die together.
///
/// At most one cleaner runs per log. The background task is driven by
/// [`start`](Cleaner::start)/[`stop`](Cleaner::stop); the same tick can also
/// be run inline with [`run_once`](Cleaner::run_once).
pub struct Cleaner<M, R, H> {
    core: Arc<CleanerCore<M, R, H>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

struct CleanerCore<M, R, H> {
    manager: Arc<M>,
    replica: Arc<R>,
    handlers: Arc<H>,
    write_cost_threshold: f64,
    poll_interval: Duration,
    survivor_reserve: usize,
    max_pass_live_segments: usize,
    stats: CleanerStats,
    state: AtomicU8,
    last_error: Mutex<Option<CleanerError>>,
}

enum TickAction {
    Exit,
    Idle,
    Ran,
}

impl<M, R, H> Cleaner<M, R, H>
where
    M: SegmentManager + 'static,
    R: ReplicaManager + 'static,
    H: EntryHandlers + 'static,
{
    pub fn state(&self) -> CleanerState {
        CleanerState::from_u8(self.core.state.load(Ordering::Acquire))
    }

    pub fn statistics(&self) -> &CleanerStats {
        &self.core.stats
    }

    /// Launch the background cleaner thread. A no-op when the task is
    /// already running or still winding down.
    pub fn start(&self) {
        if self
            .core
            .state
            .compare_exchange(
                CleanerState::Stopped as u8,
                CleanerState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        let core = self.core.clone();
        let handle = std::thread::Builder::new()
            .name("segclean".to_string())
            .spawn(move || core.run())
            .expect("failed to spawn cleaner thread");
        *self.thread.lock() = Some(handle);
    }

    /// Ask the task to exit and wait for it. The signal is checked between
    /// passes, never mid-pass — a partial pass would leave survivors
    /// unreplicated — so the worst-case latency is one full disk pass.
    ///
    /// Surfaces any fatal error the task died with.
    pub fn stop(&self) -> Result<(), CleanerError> {
        match self.core.state.compare_exchange(
            CleanerState::Running as u8,
            CleanerState::Stopping as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(actual) if actual == CleanerState::Stopped as u8 => {
                return self.take_error();
            }
            Err(_) => {} // another stop in flight; join alongside it
        }

        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                *self.core.last_error.lock() = Some(CleanerError::CollaboratorInvariant(
                    "cleaner thread panicked".to_string(),
                ));
            }
        }
        self.core
            .state
            .store(CleanerState::Stopped as u8, Ordering::Release);
        self.take_error()
    }

    /// Run a single tick inline: one policy evaluation and at most one pass.
    /// Returns whether a pass ran. Legal only while the background task is
    /// stopped.
    pub fn run_once(&self) -> Result<bool, CleanerError> {
        if self.state() != CleanerState::Stopped {
            return Err(CleanerError::TaskRunning);
        }
        let mut candidates = CandidateSet::new();
        match self.core.tick(&mut candidates, false)? {
            TickAction::Ran => Ok(true),
            TickAction::Idle | TickAction::Exit => Ok(false),
        }
    }

    fn take_error(&self) -> Result<(), CleanerError> {
        match self.core.last_error.lock().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl<M, R, H> CleanerCore<M, R, H>
where
    M: SegmentManager,
    R: ReplicaManager,
    H: EntryHandlers,
{
    fn run(&self) {
        let mut candidates = CandidateSet::new();

        loop {
            match self.tick(&mut candidates, true) {
                Ok(TickAction::Exit) => break,
                Ok(_) => {}
                Err(error) if !error.is_fatal() => {
                    // Transient resource shortage; the pass was abandoned
                    // with its inputs untouched. Try again next tick.
                    self.stats.passes_aborted.increment();
                    warn!("cleaning pass abandoned: {error}");
                    std::thread::sleep(self.poll_interval);
                }
                Err(error) => {
                    error!("cleaner terminating: {error}");
                    *self.last_error.lock() = Some(error);
                    break;
                }
            }
        }

        self.state
            .store(CleanerState::Stopped as u8, Ordering::Release);
    }

    /// One tick: refresh candidates, decide, dispatch.
    fn tick(
        &self,
        candidates: &mut CandidateSet,
        allow_sleep: bool,
    ) -> Result<TickAction, CleanerError> {
        candidates.refresh(&*self.manager)?;

        let view = PolicyView {
            exit_requested: self.state.load(Ordering::Acquire) == CleanerState::Stopping as u8,
            memory_utilization: self.manager.memory_utilization(),
            disk_utilization: self.manager.disk_utilization(),
            last_write_cost: self.stats.last_write_cost(),
            have_candidates: !candidates.is_empty(),
        };

        match policy::decide(&view, self.write_cost_threshold) {
            Decision::Exit => Ok(TickAction::Exit),
            Decision::MemoryCleaning => match self.do_memory_cleaning(candidates)? {
                Some(write_cost) => {
                    self.stats.set_write_cost(write_cost);
                    Ok(TickAction::Ran)
                }
                None => {
                    // Nothing worth compacting; an infinite write cost makes
                    // the policy fall over to disk cleaning when possible.
                    self.stats.set_write_cost(f64::INFINITY);
                    self.idle(allow_sleep);
                    Ok(TickAction::Idle)
                }
            },
            Decision::DiskCleaning => {
                if self.do_disk_cleaning(candidates)? {
                    // Disk cleaning freed whole segments, so memory cleaning
                    // deserves a fresh chance.
                    self.stats.set_write_cost(0.0);
                    Ok(TickAction::Ran)
                } else {
                    self.idle(allow_sleep);
                    Ok(TickAction::Idle)
                }
            }
            Decision::Sleep => {
                self.idle(allow_sleep);
                Ok(TickAction::Idle)
            }
        }
    }

    fn idle(&self, allow_sleep: bool) {
        self.stats.idle_ticks.increment();
        if allow_sleep {
            std::thread::sleep(self.poll_interval);
        }
    }

    /// Compact one segment in memory, releasing seglets only. Returns the
    /// pass's write cost, or `None` when no candidate would free a seglet.
    fn do_memory_cleaning(
        &self,
        candidates: &CandidateSet,
    ) -> Result<Option<f64>, CleanerError> {
        let Some((segment, expected_freeable)) = select::segment_to_compact(candidates.as_slice())
        else {
            return Ok(None);
        };

        let seglet_size = segment.seglet_size() as u64;
        let held_before = segment.seglets_held() as u64;

        let inputs = [segment.clone()];
        let live = relocate::collect_live_entries(&inputs, &*self.handlers, &self.stats);

        let (bytes_written, held_after) = if live.is_empty() {
            // Nothing live at all; the whole segment's memory comes back
            self.manager.compaction_complete(&segment, None);
            (0u64, 0u64)
        } else {
            let relocator: Relocator<'_, M, R, H> = Relocator {
                manager: &*self.manager,
                replica: None,
                handlers: &*self.handlers,
                stats: &self.stats,
            };
            let mut outcome = relocator.relocate(&live, 1)?;
            let survivor = outcome.survivors.pop().unwrap();
            assert!(
                outcome.survivors.is_empty(),
                "memory compaction produced more than one survivor"
            );
            let written = survivor.bytes_appended() as u64;
            let held = survivor.seglets_held() as u64;
            self.manager.compaction_complete(&segment, Some(survivor));
            (written, held)
        };

        let seglets_freed = held_before.saturating_sub(held_after);
        let bytes_freed = seglets_freed * seglet_size;
        let write_cost = if bytes_freed == 0 {
            f64::INFINITY
        } else {
            bytes_written as f64 / bytes_freed as f64
        };

        self.stats.memory_passes.increment();
        self.stats.seglets_freed.add(seglets_freed);
        self.stats.bytes_freed.add(bytes_freed);

        debug!(
            "memory pass: segment {} compacted, {seglets_freed} seglets freed \
             (expected {expected_freeable}), write cost {write_cost:.2}",
            segment.id()
        );

        Ok(Some(write_cost))
    }

    /// Clean a batch of segments to fresh survivors so the inputs can be
    /// freed in memory and on their backups. Returns whether a pass ran.
    fn do_disk_cleaning(&self, candidates: &CandidateSet) -> Result<bool, CleanerError> {
        let now = coarse_timestamp();
        let budget = self.max_pass_live_segments as u64 * self.manager.segment_size() as u64;

        let inputs = select::segments_to_clean(candidates.as_slice(), now, budget);
        if inputs.is_empty() {
            return Ok(false);
        }

        let seglet_size = self.manager.seglet_size() as u64;
        let freed_seglets: u64 = inputs
            .iter()
            .map(|segment| segment.seglets_held() as u64)
            .sum();

        let live = relocate::collect_live_entries(&inputs, &*self.handlers, &self.stats);

        let outcome = if live.is_empty() {
            self.manager.cleaning_complete(&inputs, Vec::new());
            PassOutcome::default()
        } else {
            let relocator = Relocator {
                manager: &*self.manager,
                replica: Some(&*self.replica),
                handlers: &*self.handlers,
                stats: &self.stats,
            };
            let outcome = relocator.relocate(&live, self.survivor_reserve)?;
            self.manager
                .cleaning_complete(&inputs, outcome.survivors.clone());
            outcome
        };

        let retained_seglets: u64 = outcome
            .survivors
            .iter()
            .map(|survivor| survivor.seglets_held() as u64)
            .sum();
        let net_seglets = freed_seglets.saturating_sub(retained_seglets);

        self.stats.disk_passes.increment();
        self.stats.seglets_freed.add(net_seglets);
        self.stats.bytes_freed.add(net_seglets * seglet_size);

        debug!(
            "disk pass: {} segments cleaned into {} survivors, {} entries relocated \
             ({} died meanwhile), {net_seglets} seglets freed",
            inputs.len(),
            outcome.survivors.len(),
            outcome.entries_relocated,
            outcome.entries_died,
        );

        Ok(true)
    }
}
