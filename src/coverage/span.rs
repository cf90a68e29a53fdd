use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Half-open `[start, end)` range in UTC, truncated to whole seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Span {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Option<Self> {
        let start = truncate_to_second(start);
        let end = truncate_to_second(end);
        (start < end).then_some(Self { start, end })
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn overlaps_or_touches(&self, other: &Span) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn contains(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Splits into consecutive pieces no longer than `step`.
    pub fn chunks(&self, step: Duration) -> Vec<Span> {
        if step <= Duration::zero() {
            return vec![*self];
        }
        let mut pieces = Vec::new();
        let mut cursor = self.start;
        while cursor < self.end {
            let next = (cursor + step).min(self.end);
            pieces.push(Span {
                start: cursor,
                end: next,
            });
            cursor = next;
        }
        pieces
    }
}

pub fn truncate_to_second(value: DateTime<Utc>) -> DateTime<Utc> {
    value.with_nanosecond(0).unwrap_or(value)
}

/// Sorts and merges spans; a span starting at or before the current end
/// joins it.
pub fn merge_spans(spans: &[Span]) -> Vec<Span> {
    let mut sorted = spans.to_vec();
    sorted.sort();

    let mut merged: Vec<Span> = Vec::with_capacity(sorted.len());
    for span in sorted {
        match merged.last_mut() {
            Some(current) if span.start <= current.end => {
                current.end = current.end.max(span.end);
            }
            _ => merged.push(span),
        }
    }
    merged
}

/// Every part of `window` not covered by `covered`, in order.
pub fn uncovered(window: Span, covered: &[Span]) -> Vec<Span> {
    let mut remainder = Vec::new();
    let mut cursor = window.start;

    for span in merge_spans(covered) {
        if span.end <= cursor {
            continue;
        }
        if span.start >= window.end {
            break;
        }
        if span.start > cursor {
            remainder.push(Span {
                start: cursor,
                end: span.start,
            });
        }
        cursor = cursor.max(span.end);
        if cursor >= window.end {
            break;
        }
    }

    if cursor < window.end {
        remainder.push(Span {
            start: cursor,
            end: window.end,
        });
    }
    remainder
}

/// Smallest gap worth fetching: one day, or the whole window when the
/// window itself is shorter.
pub fn minimum_gap(window: Span) -> Duration {
    Duration::days(1).min(window.duration())
}

/// Uncovered remainder of `window` with sub-day slivers dropped.
pub fn compute_gaps(window: Span, covered: &[Span]) -> Vec<Span> {
    let floor = minimum_gap(window);
    uncovered(window, covered)
        .into_iter()
        .filter(|gap| gap.duration() >= floor)
        .collect()
}

/// `from` minus `cut`: zero, one, or two pieces.
pub fn subtract(from: Span, cut: Span) -> Vec<Span> {
    if !from.overlaps(&cut) {
        return vec![from];
    }
    let mut pieces = Vec::with_capacity(2);
    if from.start < cut.start {
        pieces.push(Span {
            start: from.start,
            end: cut.start,
        });
    }
    if cut.end < from.end {
        pieces.push(Span {
            start: cut.end,
            end: from.end,
        });
    }
    pieces
}

/// Splits `count` across `pieces` in proportion to their duration. The
/// last piece absorbs rounding so the parts always sum to `count`.
pub fn apportion(count: i64, pieces: &[Span]) -> Vec<i64> {
    if pieces.is_empty() {
        return Vec::new();
    }
    let total: i64 = pieces.iter().map(|p| p.duration().num_seconds()).sum();
    if total <= 0 {
        let mut shares = vec![0; pieces.len()];
        if let Some(last) = shares.last_mut() {
            *last = count;
        }
        return shares;
    }

    let mut shares = Vec::with_capacity(pieces.len());
    let mut assigned = 0i64;
    for (idx, piece) in pieces.iter().enumerate() {
        if idx + 1 == pieces.len() {
            shares.push(count - assigned);
        } else {
            let share = count * piece.duration().num_seconds() / total;
            assigned += share;
            shares.push(share);
        }
    }
    shares
}
