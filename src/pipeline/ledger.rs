use serde::Serialize;
use tracing::{info, warn};

use crate::coverage::{CoverageTracker, MarkedSpan};
use crate::db::models::{format_timestamp, CoverageInterval};
use crate::db::Database;

/// Everything a run changed, so a failed or cancelled run can be undone.
#[derive(Debug, Default)]
pub struct RunLedger {
    run_id: String,
    marked: Vec<MarkedSpan>,
    created_messages: Vec<i64>,
    cleared: Vec<CoverageInterval>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompensationReport {
    pub spans_reverted: usize,
    pub artifacts_deleted: usize,
    pub messages_deleted: usize,
    pub intervals_restored: usize,
}

impl RunLedger {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            ..Self::default()
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn record_marked(&mut self, marked: MarkedSpan) {
        self.marked.push(marked);
    }

    pub fn record_created_messages(&mut self, ids: impl IntoIterator<Item = i64>) {
        self.created_messages.extend(ids);
    }

    pub fn record_cleared(&mut self, cleared: Vec<CoverageInterval>) {
        self.cleared.extend(cleared);
    }

    pub fn marked(&self) -> &[MarkedSpan] {
        &self.marked
    }

    pub fn created_messages(&self) -> &[i64] {
        &self.created_messages
    }

    pub fn is_empty(&self) -> bool {
        self.marked.is_empty() && self.created_messages.is_empty() && self.cleared.is_empty()
    }

    /// Undoes the run: reverts marked coverage newest first, deletes the run's artifacts
    /// and the messages only it referenced, then puts back coverage a forced
    /// run cleared. Every step is best-effort and logged. Entries are drained
    /// as they are handled, so a second call is a no-op.
    pub fn compensate(&mut self, db: &Database, tracker: &CoverageTracker<'_>) -> CompensationReport {
        let mut report = CompensationReport::default();

        if !self.marked.is_empty() {
            let marked = std::mem::take(&mut self.marked);
            report.spans_reverted = tracker.remove(&marked);
            if report.spans_reverted == marked.len() {
                if let Err(error) = tracker.forget_run_marks(&self.run_id) {
                    warn!(run_id = %self.run_id, "failed to drop persisted run marks: {error}");
                }
            }
            for span in &marked {
                info!(
                    run_id = %self.run_id,
                    start = %format_timestamp(span.span.start),
                    end = %format_timestamp(span.span.end),
                    "reverted coverage"
                );
            }
        }

        match db.delete_artifacts_for_run(&self.run_id) {
            Ok(deleted) => report.artifacts_deleted = deleted,
            Err(error) => warn!(run_id = %self.run_id, "failed to delete run artifacts: {error}"),
        }

        if !self.created_messages.is_empty() {
            match db.delete_orphaned_messages(&self.created_messages) {
                Ok(deleted) => {
                    report.messages_deleted = deleted;
                    self.created_messages.clear();
                }
                Err(error) => {
                    warn!(run_id = %self.run_id, "failed to delete orphaned messages: {error}")
                }
            }
        }

        if !self.cleared.is_empty() {
            let cleared = std::mem::take(&mut self.cleared);
            report.intervals_restored = tracker.restore(&cleared);
        }

        info!(
            run_id = %self.run_id,
            spans_reverted = report.spans_reverted,
            artifacts_deleted = report.artifacts_deleted,
            messages_deleted = report.messages_deleted,
            intervals_restored = report.intervals_restored,
            "run compensated"
        );
        report
    }
}
