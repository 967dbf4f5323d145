use crate::segment::{SegmentRef, SegmentState};
use crate::MAX_CLEANABLE_MEMORY_UTILIZATION;
use std::cmp::Ordering;

/// Pick the segment an in-memory compaction would profit most from: the one
/// giving back the most seglets. Ties go to the lower (older) segment id,
/// which keeps old data packing together. Returns the expected seglet yield
/// alongside the choice; `None` when no candidate would free even one.
pub(crate) fn segment_to_compact(candidates: &[SegmentRef]) -> Option<(SegmentRef, u32)> {
    let mut best: Option<(&SegmentRef, u32)> = None;

    for segment in candidates {
        if segment.state() != SegmentState::Cleanable {
            continue;
        }
        // Compacting a nearly-full segment could consume more seglets than
        // it frees, which starves the log.
        if segment.memory_utilization() > MAX_CLEANABLE_MEMORY_UTILIZATION {
            continue;
        }
        let freeable = segment.freeable_seglets();
        if freeable == 0 {
            continue;
        }
        best = match best {
            None => Some((segment, freeable)),
            Some((current, current_freeable)) => {
                if freeable > current_freeable
                    || (freeable == current_freeable && segment.id() < current.id())
                {
                    Some((segment, freeable))
                } else {
                    Some((current, current_freeable))
                }
            }
        };
    }

    best.map(|(segment, freeable)| (segment.clone(), freeable))
}

/// Cost/benefit score for disk cleaning: `((1 - u) * age) / (1 + u)`.
///
/// Favors segments with lots of dead space, but also rewards old segments
/// whose live data is unlikely to die soon, so the copying work sticks.
pub(crate) fn cost_benefit(segment: &SegmentRef, now: u32) -> f64 {
    let u = segment.live_fraction();
    let age = match segment.min_timestamp() {
        Some(ts) => now.saturating_sub(ts) as f64,
        None => 0.0,
    };
    ((1.0 - u) * age) / (1.0 + u)
}

/// Pick the batch of segments for a disk pass: candidates ranked by
/// cost/benefit, taken greedily while their accumulated live bytes stay
/// within `max_live_bytes`. Segments that are not yet fully replicated
/// (still Closed) are never chosen.
pub(crate) fn segments_to_clean(
    candidates: &[SegmentRef],
    now: u32,
    max_live_bytes: u64,
) -> Vec<SegmentRef> {
    let mut ranked: Vec<(f64, &SegmentRef)> = candidates
        .iter()
        .filter(|segment| segment.state() == SegmentState::Cleanable)
        .map(|segment| (cost_benefit(segment, now), segment))
        .collect();

    // Score descending, ties to the lower segment id for determinism
    ranked.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.1.id().cmp(&b.1.id()))
    });

    let mut chosen = Vec::new();
    let mut live_total = 0u64;
    for (_, segment) in ranked {
        let live = segment.live_bytes() as u64;
        if live_total + live > max_live_bytes {
            break;
        }
        live_total += live;
        chosen.push(segment.clone());
    }
    chosen
}
