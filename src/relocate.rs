use crate::entry::{EntryKind, EntryRef, Liveness, Relocation};
use crate::segment::{AppendError, SegmentRef};
use crate::stats::CleanerStats;
use crate::{CleanerError, EntryHandlers, ReplicaManager, SegmentManager};

/// Reference to a live entry awaiting relocation, with its timestamp cached
/// so the sort by age is pure comparisons instead of header reads. A pass
/// may hold millions of these, hence the dense 16-byte layout.
pub(crate) struct LiveEntry<'a> {
    pub segment: &'a SegmentRef,
    pub offset: u32,
    pub timestamp: u32,
}

/// What a relocation produced, for installation and accounting.
#[derive(Default)]
pub(crate) struct PassOutcome {
    pub survivors: Vec<SegmentRef>,
    pub bytes_relocated: u64,
    pub entries_relocated: u64,
    pub entries_died: u64,
}

/// Scan the input segments and collect every entry the handlers still
/// consider live, sorted ascending by timestamp so survivors come out
/// age-segregated. The handlers' verdict is authoritative; entries they
/// manage are also asked for their timestamp, everything else relocates
/// with no age information.
pub(crate) fn collect_live_entries<'a, H: EntryHandlers>(
    inputs: &'a [SegmentRef],
    handlers: &H,
    stats: &CleanerStats,
) -> Vec<LiveEntry<'a>> {
    let mut live = Vec::new();

    for segment in inputs {
        for (offset, header) in segment.entries() {
            stats.entries_scanned.increment();

            let entry = EntryRef::new(segment, offset);
            if handlers.check_liveness(entry) == Liveness::Dead {
                continue;
            }

            let timestamp = match header.kind {
                EntryKind::Object | EntryKind::Tombstone => handlers.timestamp(entry),
                EntryKind::Opaque => 0,
            };
            live.push(LiveEntry {
                segment,
                offset,
                timestamp,
            });
        }
    }

    live.sort_unstable_by_key(|entry| entry.timestamp);
    live
}

/// Copies live entries into survivor segments and swings the index.
///
/// `replica` is `None` for in-memory compactions, which must not generate
/// any backup traffic.
pub(crate) struct Relocator<'a, M, R, H> {
    pub manager: &'a M,
    pub replica: Option<&'a R>,
    pub handlers: &'a H,
    pub stats: &'a CleanerStats,
}

impl<M: SegmentManager, R: ReplicaManager, H: EntryHandlers> Relocator<'_, M, R, H> {
    /// Relocate `live` into survivors drawn from an up-front reservation of
    /// `reserve` segments, so the pass can never stall on allocation once it
    /// has started moving data.
    ///
    /// Per entry the order is copy first, index swing second: between the
    /// two the entry is reachable through both locations, never through
    /// neither. An entry that died in the window stays in the survivor but
    /// is marked dead immediately.
    pub(crate) fn relocate(
        &self,
        live: &[LiveEntry<'_>],
        reserve: usize,
    ) -> Result<PassOutcome, CleanerError> {
        let mut outcome = PassOutcome::default();
        if live.is_empty() {
            return Ok(outcome);
        }

        let Some(mut reserved) = self.manager.reserve_survivors(reserve) else {
            return Err(CleanerError::SurvivorsUnavailable);
        };
        // Pop from the front so survivors fill in reservation order
        reserved.reverse();

        let mut current: Option<SegmentRef> = None;

        for entry in live {
            let header = entry.segment.header_at(entry.offset);
            let payload = entry.segment.entry_payload(entry.offset);

            // Append, rolling to the next reserved survivor when full
            let (survivor, new_offset) = loop {
                if current.is_none() {
                    match reserved.pop() {
                        Some(segment) => current = Some(segment),
                        None => {
                            // The reservation is sized to cover a full pass
                            // budget; running dry mid-pass means relocated
                            // entries already point into survivors we cannot
                            // abandon.
                            return Err(CleanerError::CollaboratorInvariant(
                                "survivor reservation exhausted mid-pass".to_string(),
                            ));
                        }
                    }
                }

                let survivor = current.as_ref().unwrap();
                match survivor.append(header.kind, entry.timestamp, payload) {
                    Ok(offset) => break (survivor.clone(), offset),
                    Err(AppendError::Full) => {
                        let full = current.take().unwrap();
                        if full.bytes_appended() == 0 {
                            return Err(CleanerError::CollaboratorInvariant(format!(
                                "entry of {} bytes does not fit an empty survivor",
                                header.padded_size()
                            )));
                        }
                        self.seal_survivor(&full);
                        outcome.survivors.push(full);
                    }
                }
            };

            // Copy done; now swing the index
            let old = EntryRef::new(entry.segment, entry.offset);
            let new = EntryRef::new(&survivor, new_offset);
            match self.handlers.relocate(old, new) {
                Relocation::Accepted => {
                    outcome.bytes_relocated += header.padded_size() as u64;
                    outcome.entries_relocated += 1;
                    self.stats.entries_relocated.increment();
                }
                Relocation::DiedMeanwhile => {
                    survivor.mark_dead(new_offset);
                    outcome.entries_died += 1;
                    self.stats.entries_dead_on_relocation.increment();
                }
            }
        }

        // Seal the partially-used tail survivor
        if let Some(tail) = current.take() {
            self.seal_survivor(&tail);
            outcome.survivors.push(tail);
        }

        // Give back the reservations we never touched
        while let Some(unused) = reserved.pop() {
            self.manager.release_survivor(unused);
        }

        // Trim trailing seglets, then wait until every survivor is durable.
        // Input segments may only be freed once replay of the survivors
        // alone reconstructs the live state.
        for survivor in &outcome.survivors {
            survivor.release_unused_seglets();
        }
        if let Some(replica) = self.replica {
            for survivor in &outcome.survivors {
                replica.await_replication(survivor);
            }
        }

        self.stats
            .survivors_allocated
            .add(outcome.survivors.len() as u64);
        self.stats.bytes_relocated.add(outcome.bytes_relocated);

        Ok(outcome)
    }

    fn seal_survivor(&self, survivor: &SegmentRef) {
        survivor.close();
        if let Some(replica) = self.replica {
            replica.replicate_closed(survivor);
        }
    }
}
