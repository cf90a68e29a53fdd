use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::db::models::{format_timestamp, parse_timestamp, CoverageInterval};
use crate::db::{Database, DbError};

pub mod span;

pub use span::Span;

/// A stored interval as it was before a mark swallowed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoveredSpan {
    pub span: Span,
    pub item_count: i64,
}

/// A span marked covered, the item count it added and the intervals it
/// merged with, so the mark can be undone exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MarkedSpan {
    pub span: Span,
    pub item_count: i64,
    pub absorbed: Vec<CoveredSpan>,
}

/// Per-mailbox record of which date ranges have already been analyzed.
/// Stored intervals never overlap or touch: every write merges into its
/// neighbours inside a single transaction.
pub struct CoverageTracker<'a> {
    db: &'a Database,
    mailbox_id: String,
}

impl<'a> CoverageTracker<'a> {
    pub fn new(db: &'a Database, mailbox_id: impl Into<String>) -> Self {
        Self {
            db,
            mailbox_id: mailbox_id.into(),
        }
    }

    pub fn mailbox_id(&self) -> &str {
        &self.mailbox_id
    }

    pub fn intervals(&self) -> Result<Vec<CoverageInterval>, DbError> {
        load_intervals(self.db.conn(), &self.mailbox_id)
    }

    /// Unprocessed gaps of `[start, end)`, ordered and disjoint.
    pub fn gaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Span>, DbError> {
        let Some(window) = Span::new(start, end) else {
            return Ok(Vec::new());
        };
        let covered = self
            .intervals()?
            .iter()
            .filter_map(|interval| Span::new(interval.start, interval.end))
            .collect::<Vec<_>>();
        Ok(span::compute_gaps(window, &covered))
    }

    pub fn is_fully_covered(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<bool, DbError> {
        Ok(self.gaps(start, end)?.is_empty())
    }

    /// Records `[start, end)` as analyzed and merges it with every interval
    /// it overlaps or touches. All-or-nothing.
    pub fn mark_processed(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        item_count: i64,
    ) -> Result<MarkedSpan, DbError> {
        self.mark(start, end, item_count, None)
    }

    /// Like [`CoverageTracker::mark_processed`], and remembers the mark
    /// under `run_id` in the same transaction so a crashed run can be
    /// reverted by [`CoverageTracker::marks_for_run`] and `remove`.
    pub fn mark_processed_for_run(
        &self,
        run_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        item_count: i64,
    ) -> Result<MarkedSpan, DbError> {
        self.mark(start, end, item_count, Some(run_id))
    }

    fn mark(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        item_count: i64,
        run_id: Option<&str>,
    ) -> Result<MarkedSpan, DbError> {
        let span = Span::new(start, end).ok_or_else(|| {
            DbError::Config(format!(
                "cannot mark empty range {} .. {}",
                format_timestamp(start),
                format_timestamp(end)
            ))
        })?;

        let tx = self.db.conn().unchecked_transaction()?;
        let (merged, absorbed) = merge_into(&tx, &self.mailbox_id, span, item_count)?;
        let marked = MarkedSpan {
            span,
            item_count,
            absorbed,
        };
        if let Some(run_id) = run_id {
            let absorbed = serde_json::to_string(&marked.absorbed)?;
            tx.execute(
                r#"
                INSERT INTO run_marks (run_id, mailbox_id, start_at, end_at, item_count, absorbed)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
                params![
                    run_id,
                    self.mailbox_id,
                    format_timestamp(span.start),
                    format_timestamp(span.end),
                    item_count,
                    absorbed
                ],
            )?;
        }
        tx.commit()?;

        debug!(
            mailbox_id = %self.mailbox_id,
            start = %format_timestamp(merged.start),
            end = %format_timestamp(merged.end),
            item_count = merged.item_count,
            absorbed = marked.absorbed.len(),
            "coverage merged"
        );
        Ok(marked)
    }

    /// Marks written by `run_id`, oldest first.
    pub fn marks_for_run(&self, run_id: &str) -> Result<Vec<MarkedSpan>, DbError> {
        let mut stmt = self.db.conn().prepare(
            r#"
            SELECT start_at, end_at, item_count, absorbed
            FROM run_marks
            WHERE run_id = ? AND mailbox_id = ?
            ORDER BY id ASC
            "#,
        )?;
        let rows = stmt
            .query_map(params![run_id, self.mailbox_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut marks = Vec::with_capacity(rows.len());
        for (start_at, end_at, item_count, absorbed) in rows {
            let start = parse_timestamp(&start_at).map_err(DbError::Config)?;
            let end = parse_timestamp(&end_at).map_err(DbError::Config)?;
            let Some(span) = Span::new(start, end) else {
                continue;
            };
            marks.push(MarkedSpan {
                span,
                item_count,
                absorbed: serde_json::from_str(&absorbed)?,
            });
        }
        Ok(marks)
    }

    /// Drops the persisted marks of `run_id` once they are no longer needed
    /// for recovery.
    pub fn forget_run_marks(&self, run_id: &str) -> Result<usize, DbError> {
        Ok(self
            .db
            .conn()
            .execute("DELETE FROM run_marks WHERE run_id = ?", [run_id])?)
    }

    /// Compensation: undoes each mark, newest first. The intervals a mark
    /// absorbed come back with their own counts; coverage outside the mark
    /// that arrived later is kept. Failures are logged and skipped. Returns
    /// how many marks were reverted cleanly.
    pub fn remove(&self, marks: &[MarkedSpan]) -> usize {
        let mut removed = 0usize;
        for marked in marks.iter().rev() {
            match self.cut_span(marked) {
                Ok(()) => removed += 1,
                Err(error) => warn!(
                    mailbox_id = %self.mailbox_id,
                    start = %format_timestamp(marked.span.start),
                    end = %format_timestamp(marked.span.end),
                    "failed to revert coverage: {error}"
                ),
            }
        }
        removed
    }

    fn cut_span(&self, marked: &MarkedSpan) -> Result<(), DbError> {
        let tx = self.db.conn().unchecked_transaction()?;
        let overlapping = overlapping_intervals(&tx, &self.mailbox_id, marked.span)?;

        let mut count_to_release = marked.item_count.max(0);
        for interval in &overlapping {
            delete_interval(&tx, interval.id)?;

            let taken = count_to_release.min(interval.item_count);
            count_to_release -= taken;
            let Some(stored) = Span::new(interval.start, interval.end) else {
                continue;
            };

            let mut remaining = interval.item_count - taken;
            let mut pieces = span::subtract(stored, marked.span);
            for original in marked
                .absorbed
                .iter()
                .filter(|original| stored.contains(&original.span))
            {
                insert_interval(&tx, &self.mailbox_id, original.span, original.item_count)?;
                remaining -= original.item_count;
                pieces = pieces
                    .into_iter()
                    .flat_map(|piece| span::subtract(piece, original.span))
                    .collect();
            }

            let shares = span::apportion(remaining.max(0), &pieces);
            for (piece, share) in pieces.iter().zip(shares) {
                merge_into(&tx, &self.mailbox_id, *piece, share)?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Drops coverage inside `[start, end)`, trimming intervals that cross its
    /// edges. Returns the intervals as they were before trimming so a failed
    /// run can put them back with [`CoverageTracker::restore`].
    pub fn clear_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CoverageInterval>, DbError> {
        let Some(window) = Span::new(start, end) else {
            return Ok(Vec::new());
        };

        let tx = self.db.conn().unchecked_transaction()?;
        let overlapping = overlapping_intervals(&tx, &self.mailbox_id, window)?;
        for interval in &overlapping {
            delete_interval(&tx, interval.id)?;
            let Some(stored) = Span::new(interval.start, interval.end) else {
                continue;
            };
            let inside = Span {
                start: stored.start.max(window.start),
                end: stored.end.min(window.end),
            };
            let pieces = span::subtract(stored, window);
            let mut all = pieces.clone();
            all.push(inside);
            let shares = span::apportion(interval.item_count, &all);
            for (piece, share) in pieces.iter().zip(shares) {
                insert_interval(&tx, &self.mailbox_id, *piece, share)?;
            }
        }
        tx.commit()?;
        Ok(overlapping)
    }

    /// Puts back intervals returned by [`CoverageTracker::clear_window`].
    /// Best-effort, like [`CoverageTracker::remove`].
    pub fn restore(&self, originals: &[CoverageInterval]) -> usize {
        let mut restored = 0usize;
        for original in originals {
            let result = (|| -> Result<(), DbError> {
                let Some(stored) = Span::new(original.start, original.end) else {
                    return Ok(());
                };
                let tx = self.db.conn().unchecked_transaction()?;
                for interval in overlapping_intervals(&tx, &self.mailbox_id, stored)? {
                    if let Some(existing) = Span::new(interval.start, interval.end) {
                        if stored.contains(&existing) {
                            delete_interval(&tx, interval.id)?;
                        }
                    }
                }
                merge_into(&tx, &self.mailbox_id, stored, original.item_count)?;
                tx.commit()?;
                Ok(())
            })();

            match result {
                Ok(()) => restored += 1,
                Err(error) => warn!(
                    mailbox_id = %self.mailbox_id,
                    start = %format_timestamp(original.start),
                    end = %format_timestamp(original.end),
                    "failed to restore cleared coverage: {error}"
                ),
            }
        }
        restored
    }
}

fn load_intervals(conn: &Connection, mailbox_id: &str) -> Result<Vec<CoverageInterval>, DbError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT id, mailbox_id, start_at, end_at, item_count, processed_at
        FROM coverage_intervals
        WHERE mailbox_id = ?
        ORDER BY start_at ASC
        "#,
    )?;
    let intervals = stmt
        .query_map([mailbox_id], CoverageInterval::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(intervals)
}

fn overlapping_intervals(
    conn: &Connection,
    mailbox_id: &str,
    span: Span,
) -> Result<Vec<CoverageInterval>, DbError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT id, mailbox_id, start_at, end_at, item_count, processed_at
        FROM coverage_intervals
        WHERE mailbox_id = ? AND start_at < ? AND end_at > ?
        ORDER BY start_at ASC
        "#,
    )?;
    let intervals = stmt
        .query_map(
            params![
                mailbox_id,
                format_timestamp(span.end),
                format_timestamp(span.start)
            ],
            CoverageInterval::from_row,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(intervals)
}

/// Inserts `span` merged with every interval it overlaps or touches.
/// Returns the merged interval and the originals it replaced.
fn merge_into(
    conn: &Connection,
    mailbox_id: &str,
    span: Span,
    item_count: i64,
) -> Result<(CoverageInterval, Vec<CoveredSpan>), DbError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT id, mailbox_id, start_at, end_at, item_count, processed_at
        FROM coverage_intervals
        WHERE mailbox_id = ? AND start_at <= ? AND end_at >= ?
        "#,
    )?;
    let neighbours = stmt
        .query_map(
            params![
                mailbox_id,
                format_timestamp(span.end),
                format_timestamp(span.start)
            ],
            CoverageInterval::from_row,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut merged = span;
    let mut total = item_count;
    let mut absorbed = Vec::with_capacity(neighbours.len());
    for neighbour in &neighbours {
        merged.start = merged.start.min(neighbour.start);
        merged.end = merged.end.max(neighbour.end);
        total += neighbour.item_count;
        delete_interval(conn, neighbour.id)?;
        if let Some(original) = Span::new(neighbour.start, neighbour.end) {
            absorbed.push(CoveredSpan {
                span: original,
                item_count: neighbour.item_count,
            });
        }
    }

    let id = insert_interval(conn, mailbox_id, merged, total)?;
    let interval = conn.query_row(
        r#"
        SELECT id, mailbox_id, start_at, end_at, item_count, processed_at
        FROM coverage_intervals WHERE id = ?
        "#,
        [id],
        CoverageInterval::from_row,
    )?;
    Ok((interval, absorbed))
}

fn insert_interval(
    conn: &Connection,
    mailbox_id: &str,
    span: Span,
    item_count: i64,
) -> Result<i64, DbError> {
    conn.execute(
        r#"
        INSERT INTO coverage_intervals (mailbox_id, start_at, end_at, item_count)
        VALUES (?, ?, ?, ?)
        "#,
        params![
            mailbox_id,
            format_timestamp(span.start),
            format_timestamp(span.end),
            item_count.max(0)
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn delete_interval(conn: &Connection, id: i64) -> Result<(), DbError> {
    conn.execute("DELETE FROM coverage_intervals WHERE id = ?", [id])?;
    Ok(())
}
