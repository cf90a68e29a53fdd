use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, ErrorCode, Transaction, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::analyzer::{derive_artifact, Analyzer, ArtifactFields, BatchInsights};
use crate::connectors::{Connector, FetchedMessage};
use crate::coverage::{CoverageTracker, Span};
use crate::crypto::Encryptor;
use crate::db::models::{format_timestamp, RunStatus};
use crate::db::{Database, DbError};

pub mod error;
pub mod ledger;
pub mod worker;

pub use error::{sanitize_error_message, ErrorKind, PipelineError};
pub use ledger::{CompensationReport, RunLedger};
pub use worker::{execute_run, reap_stale_runs, validate_request, RunWorker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Longest span requested from a connector in one call.
    pub fetch_chunk_days: i64,
    /// Progress is written after this many stored messages.
    pub store_chunk_size: usize,
    pub force: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            fetch_chunk_days: 31,
            store_chunk_size: 200,
            force: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed { items_processed: i64 },
    Cancelled { items_processed: i64 },
}

enum Progress {
    Finished,
    Halted(RunStatus),
}

#[derive(Debug, Default)]
struct StoredBatch {
    count: i64,
    created: usize,
    reused: usize,
    halted: Option<RunStatus>,
}

struct PreparedArtifact<'m> {
    message: &'m FetchedMessage,
    fields: ArtifactFields,
    sealed: String,
}

#[derive(Serialize)]
struct ArtifactPayload<'a> {
    message: &'a FetchedMessage,
    fields: &'a ArtifactFields,
    analysis: &'a BatchInsights,
}

/// Incremental ingestion: fetch, store, analyze and mark each uncovered gap
/// of a requested window, undoing the run's work when it fails or is
/// cancelled.
pub struct IngestionPipeline<'a> {
    db: &'a Database,
    mailbox_id: String,
    encryptor: &'a dyn Encryptor,
    options: PipelineOptions,
}

impl<'a> IngestionPipeline<'a> {
    pub fn new(
        db: &'a Database,
        mailbox_id: impl Into<String>,
        encryptor: &'a dyn Encryptor,
        options: PipelineOptions,
    ) -> Self {
        Self {
            db,
            mailbox_id: mailbox_id.into(),
            encryptor,
            options,
        }
    }

    /// Drives `run_id` over `[start, end)`. The run must be pending. Errors
    /// are returned after compensation; recording the failure on the run is
    /// left to the caller.
    pub async fn analyze_date_range(
        &self,
        connector: &dyn Connector,
        analyzer: &dyn Analyzer,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        run_id: &str,
    ) -> Result<RunOutcome, PipelineError> {
        let window = Span::new(start, end).ok_or_else(|| {
            PipelineError::InvalidWindow(format!(
                "start {} must be before end {}",
                format_timestamp(start),
                format_timestamp(end)
            ))
        })?;
        let run = self
            .db
            .get_run(run_id)?
            .ok_or_else(|| DbError::RunNotFound(run_id.to_string()))?;
        let force = self.options.force || run.force;

        if !self.db.begin_run(run_id)? {
            let status = self.db.run_status(run_id)?;
            info!(run_id = %run_id, %status, "run is no longer pending; not started");
            return self.halted(run_id, status, 0);
        }
        info!(
            run_id = %run_id,
            mailbox_id = %self.mailbox_id,
            connector = connector.name(),
            start = %format_timestamp(window.start),
            end = %format_timestamp(window.end),
            force,
            "run started"
        );

        let tracker = CoverageTracker::new(self.db, self.mailbox_id.clone());
        let mut ledger = RunLedger::new(run_id);
        let mut items = 0i64;

        let halted = match self
            .process(connector, analyzer, &tracker, window, force, &mut ledger, &mut items)
            .await
        {
            Ok(Progress::Finished) => match self.db.complete_run(run_id, items) {
                Ok(true) => {
                    if let Err(error) = tracker.forget_run_marks(run_id) {
                        warn!(run_id = %run_id, "failed to drop persisted run marks: {error}");
                    }
                    info!(run_id = %run_id, items_processed = items, "run completed");
                    return Ok(RunOutcome::Completed {
                        items_processed: items,
                    });
                }
                // A cancel landed between the last checkpoint and completion.
                Ok(false) => self.db.run_status(run_id).map_err(PipelineError::from),
                Err(error) => Err(error.into()),
            },
            Ok(Progress::Halted(status)) => Ok(status),
            Err(error) => Err(error),
        };

        match halted {
            Ok(status) => {
                ledger.compensate(self.db, &tracker);
                self.halted(run_id, status, items)
            }
            Err(error) => {
                warn!(run_id = %run_id, kind = %error.kind(), "run failed, compensating: {error}");
                ledger.compensate(self.db, &tracker);
                Err(error)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn process(
        &self,
        connector: &dyn Connector,
        analyzer: &dyn Analyzer,
        tracker: &CoverageTracker<'_>,
        window: Span,
        force: bool,
        ledger: &mut RunLedger,
        items: &mut i64,
    ) -> Result<Progress, PipelineError> {
        let run_id = ledger.run_id().to_string();

        let gaps = if force {
            let cleared = tracker.clear_window(window.start, window.end)?;
            if !cleared.is_empty() {
                info!(run_id = %run_id, cleared = cleared.len(), "force reanalysis cleared coverage");
            }
            ledger.record_cleared(cleared);
            vec![window]
        } else {
            tracker.gaps(window.start, window.end)?
        };

        if gaps.is_empty() {
            info!(run_id = %run_id, "window already covered; nothing to fetch");
            return Ok(Progress::Finished);
        }
        info!(run_id = %run_id, gaps = gaps.len(), "computed gaps");

        let step = Duration::days(self.options.fetch_chunk_days.max(1));
        for (index, gap) in gaps.iter().enumerate() {
            if let Some(status) = self.checkpoint(&run_id)? {
                return Ok(Progress::Halted(status));
            }

            let mut fetched = Vec::new();
            for (chunk_index, chunk) in gap.chunks(step).into_iter().enumerate() {
                if chunk_index > 0 {
                    if let Some(status) = self.checkpoint(&run_id)? {
                        return Ok(Progress::Halted(status));
                    }
                }
                let batch = connector.fetch_messages(chunk.start, chunk.end).await?;
                let returned = batch.len();
                fetched.extend(
                    batch
                        .into_iter()
                        .filter(|m| m.received_at >= chunk.start && m.received_at < chunk.end),
                );
                debug!(
                    run_id = %run_id,
                    start = %format_timestamp(chunk.start),
                    end = %format_timestamp(chunk.end),
                    returned,
                    "fetched chunk"
                );
            }

            if let Some(status) = self.checkpoint(&run_id)? {
                return Ok(Progress::Halted(status));
            }

            let stored = self.store_and_analyze(analyzer, &run_id, &fetched, ledger, *items)?;
            *items += stored.count;
            if let Some(status) = stored.halted {
                return Ok(Progress::Halted(status));
            }

            let marked =
                tracker.mark_processed_for_run(&run_id, gap.start, gap.end, stored.count)?;
            ledger.record_marked(marked);
            info!(
                run_id = %run_id,
                gap = index + 1,
                of = gaps.len(),
                start = %format_timestamp(gap.start),
                end = %format_timestamp(gap.end),
                fetched = fetched.len(),
                created = stored.created,
                reused = stored.reused,
                "gap committed"
            );
        }

        Ok(Progress::Finished)
    }

    /// `Some(status)` once the run has left processing.
    fn checkpoint(&self, run_id: &str) -> Result<Option<RunStatus>, PipelineError> {
        let status = self.db.run_status(run_id)?;
        if status == RunStatus::Processing {
            return Ok(None);
        }
        info!(run_id = %run_id, %status, "run left processing; stopping at checkpoint");
        Ok(Some(status))
    }

    fn halted(
        &self,
        run_id: &str,
        status: RunStatus,
        items: i64,
    ) -> Result<RunOutcome, PipelineError> {
        if status == RunStatus::Cancelled {
            info!(run_id = %run_id, "run cancelled");
            return Ok(RunOutcome::Cancelled {
                items_processed: items,
            });
        }
        Err(PipelineError::RunInterrupted {
            run_id: run_id.to_string(),
            status,
        })
    }

    /// Analyzes the gap's messages, then stores them with their artifacts in
    /// transactions of at most `store_chunk_size` messages. Progress is
    /// written after each commit; the run status is checked before each
    /// chunk and storing stops once the run has left processing.
    fn store_and_analyze(
        &self,
        analyzer: &dyn Analyzer,
        run_id: &str,
        fetched: &[FetchedMessage],
        ledger: &mut RunLedger,
        items_before: i64,
    ) -> Result<StoredBatch, PipelineError> {
        let mut seen = HashSet::new();
        let batch = fetched
            .iter()
            .filter(|message| seen.insert(message.provider_message_id.as_str()))
            .cloned()
            .collect::<Vec<_>>();
        if batch.len() < fetched.len() {
            debug!(
                run_id = %run_id,
                duplicates = fetched.len() - batch.len(),
                "dropped repeated provider ids from batch"
            );
        }

        // No write lock is held while analyzing, so a cancel from another
        // connection goes through.
        let insights = analyzer.analyze(&batch)?;
        let mut prepared = Vec::with_capacity(batch.len());
        for (index, message) in batch.iter().enumerate() {
            let fields = derive_artifact(message, index, &insights);
            let payload = serde_json::to_vec(&ArtifactPayload {
                message,
                fields: &fields,
                analysis: &insights,
            })
            .map_err(DbError::from)?;
            let sealed = self.encryptor.encrypt(&payload)?;
            prepared.push(PreparedArtifact {
                message,
                fields,
                sealed,
            });
        }

        let mut stored = StoredBatch::default();
        for chunk in prepared.chunks(self.options.store_chunk_size.max(1)) {
            if let Some(status) = self.checkpoint(run_id)? {
                stored.halted = Some(status);
                return Ok(stored);
            }

            let created = self.store_chunk(run_id, chunk)?;
            stored.count += chunk.len() as i64;
            stored.created += created.len();
            stored.reused += chunk.len() - created.len();
            ledger.record_created_messages(created);
            self.db.record_progress(run_id, items_before + stored.count)?;
        }
        Ok(stored)
    }

    /// One write transaction per chunk. Returns the ids of messages it
    /// created.
    fn store_chunk(
        &self,
        run_id: &str,
        chunk: &[PreparedArtifact<'_>],
    ) -> Result<Vec<i64>, PipelineError> {
        let mut tx = Transaction::new_unchecked(self.db.conn(), TransactionBehavior::Immediate)
            .map_err(DbError::from)?;
        let mut created = Vec::new();

        for artifact in chunk {
            let (message_id, is_new) = upsert_message(&mut tx, &self.mailbox_id, artifact.message)?;
            if is_new {
                created.push(message_id);
            }
            tx.execute(
                r#"
                INSERT INTO analysis_artifacts
                    (message_id, run_id, sender_cluster, subject_cluster, category, payload)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
                params![
                    message_id,
                    run_id,
                    artifact.fields.sender_cluster,
                    artifact.fields.subject_cluster,
                    artifact.fields.category,
                    artifact.sealed
                ],
            )
            .map_err(DbError::from)?;
        }

        tx.commit().map_err(DbError::from)?;
        Ok(created)
    }
}

/// Reuses the stored record for `(mailbox, provider id)` or inserts one.
/// Returns the row id and whether it was created.
pub(crate) fn upsert_message(
    tx: &mut Transaction<'_>,
    mailbox_id: &str,
    message: &FetchedMessage,
) -> Result<(i64, bool), DbError> {
    if let Some(id) = find_message_id(tx, mailbox_id, &message.provider_message_id)? {
        return Ok((id, false));
    }
    insert_or_reread(tx, mailbox_id, message)
}

/// Insert under a savepoint; a uniqueness conflict from a concurrent writer
/// rolls the savepoint back and returns the row that won.
pub(crate) fn insert_or_reread(
    tx: &mut Transaction<'_>,
    mailbox_id: &str,
    message: &FetchedMessage,
) -> Result<(i64, bool), DbError> {
    let savepoint = tx.savepoint()?;
    let inserted = savepoint.execute(
        r#"
        INSERT INTO messages
            (mailbox_id, provider_message_id, sender_address, sender_name, subject, received_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
        params![
            mailbox_id,
            message.provider_message_id,
            message.sender_address,
            message.sender_name,
            message.subject,
            format_timestamp(message.received_at),
        ],
    );

    match inserted {
        Ok(_) => {
            let id = savepoint.last_insert_rowid();
            savepoint.commit()?;
            Ok((id, true))
        }
        Err(error) if is_constraint_violation(&error) => {
            drop(savepoint);
            debug!(
                mailbox_id,
                provider_message_id = %message.provider_message_id,
                kind = %ErrorKind::DataIntegrity,
                "message insert conflicted; re-reading existing record"
            );
            match find_message_id(tx, mailbox_id, &message.provider_message_id)? {
                Some(id) => Ok((id, false)),
                None => Err(DbError::Sqlite(error)),
            }
        }
        Err(error) => Err(error.into()),
    }
}

fn is_constraint_violation(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(failure, _) if failure.code == ErrorCode::ConstraintViolation
    )
}

fn find_message_id(
    conn: &Connection,
    mailbox_id: &str,
    provider_message_id: &str,
) -> Result<Option<i64>, DbError> {
    use rusqlite::OptionalExtension;

    let id = conn
        .query_row(
            "SELECT id FROM messages WHERE mailbox_id = ? AND provider_message_id = ?",
            params![mailbox_id, provider_message_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}
