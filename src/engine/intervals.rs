use crate::model::*;

// ── Interval Set algebra ─────────────────────────────────────────
//
// An Interval Set is a slice of spans sorted by `start`, pairwise disjoint and
// non-touching. Every function here takes and returns sets in that form;
// none of them look past a single (person, day).

/// The outcome of carving a booking out of a free set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    /// The free set after the booking.
    pub remaining: Vec<Span>,
    /// The fragments removed, recorded for exact restoration.
    pub consumed: Vec<Span>,
}

/// Index of the member that wholly contains `target`, if any.
fn containing_index(set: &[Span], target: &Span) -> Option<usize> {
    // Members are disjoint and sorted, so only the last one starting at or
    // before target.start can contain it.
    let idx = set.partition_point(|m| m.start <= target.start).checked_sub(1)?;
    set[idx].contains_span(target).then_some(idx)
}

/// True iff `target` lies wholly within one free fragment.
pub fn can_reserve(set: &[Span], target: &Span) -> bool {
    containing_index(set, target).is_some()
}

/// Every member that wholly contains `target`.
pub fn overlap_fragments(set: &[Span], target: &Span) -> Vec<Span> {
    containing_index(set, target)
        .map(|idx| vec![set[idx]])
        .unwrap_or_default()
}

/// Split the containing fragment around `target`. `None` when `target` is not
/// wholly inside a single fragment.
pub fn reserve(set: &[Span], target: Span) -> Option<Reservation> {
    let idx = containing_index(set, &target)?;
    let m = set[idx];

    let mut remaining = Vec::with_capacity(set.len() + 1);
    remaining.extend_from_slice(&set[..idx]);
    if m.start < target.start {
        remaining.push(Span::new(m.start, target.start));
    }
    if target.end < m.end {
        remaining.push(Span::new(target.end, m.end));
    }
    remaining.extend_from_slice(&set[idx + 1..]);

    Some(Reservation {
        remaining,
        consumed: vec![target],
    })
}

/// Union `fragments` back into `set` and coalesce anything touching or overlapping.
pub fn release(set: &[Span], fragments: &[Span]) -> Vec<Span> {
    if fragments.is_empty() {
        return set.to_vec();
    }
    let mut all = Vec::with_capacity(set.len() + fragments.len());
    all.extend_from_slice(set);
    all.extend_from_slice(fragments);
    normalize(all)
}

/// Sort arbitrary spans and merge them into a valid Interval Set.
pub fn normalize(mut spans: Vec<Span>) -> Vec<Span> {
    spans.sort_by_key(|s| s.start);
    merge_overlapping(&spans)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

pub fn total_duration(set: &[Span]) -> Ms {
    set.iter().map(Span::duration_ms).sum()
}

/// Sorted, non-empty members, and a strict gap between neighbours.
pub fn is_normalized(set: &[Span]) -> bool {
    set.iter().all(|s| s.start < s.end) && set.windows(2).all(|w| w[0].end < w[1].start)
}
