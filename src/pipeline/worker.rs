use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use chrono::{DateTime, Duration, Utc};
use tracing::{error, info, warn};

use super::{
    sanitize_error_message, ErrorKind, IngestionPipeline, PipelineError, PipelineOptions,
    RunOutcome,
};
use crate::analyzer::Analyzer;
use crate::connectors::ConnectorFactory;
use crate::coverage::{CoverageTracker, Span};
use crate::crypto::PayloadKeys;
use crate::db::models::{format_timestamp, Run};
use crate::db::{Database, DbError};

const STALE_RUN_MESSAGE: &str = "run stopped reporting progress and was marked failed";

/// Executes one pending run to a terminal state. Pipeline failures are
/// classified and written to the run; the returned error only covers
/// bookkeeping that could not be recorded.
pub async fn execute_run(
    db: &Database,
    run_id: &str,
    connectors: &dyn ConnectorFactory,
    analyzer: &dyn Analyzer,
    keys: &PayloadKeys,
    options: PipelineOptions,
) -> Result<Run, PipelineError> {
    let run = db
        .get_run(run_id)?
        .ok_or_else(|| DbError::RunNotFound(run_id.to_string()))?;

    if let Err(error) = drive(db, &run, connectors, analyzer, keys, options).await {
        let kind = error.kind();
        let message = sanitize_error_message(&error.to_string());
        if db.fail_run(run_id, kind.as_str(), &message)? {
            warn!(run_id = %run_id, %kind, "run failed: {message}");
        }
        if kind == ErrorKind::PermanentCredential && db.set_mailbox_active(&run.mailbox_id, false)? {
            warn!(
                mailbox_id = %run.mailbox_id,
                "mailbox deactivated after the provider rejected its credentials"
            );
        }
    }

    db.get_run(run_id)?
        .ok_or_else(|| DbError::RunNotFound(run_id.to_string()).into())
}

async fn drive(
    db: &Database,
    run: &Run,
    connectors: &dyn ConnectorFactory,
    analyzer: &dyn Analyzer,
    keys: &PayloadKeys,
    options: PipelineOptions,
) -> Result<RunOutcome, PipelineError> {
    let mailbox = db
        .get_mailbox(&run.mailbox_id)?
        .ok_or_else(|| PipelineError::MailboxNotFound(run.mailbox_id.clone()))?;
    if !mailbox.is_active {
        return Err(PipelineError::MailboxInactive(mailbox.mailbox_id));
    }

    let connector = connectors.connect(&mailbox)?;
    let encryptor = keys.for_mailbox(&mailbox.mailbox_id)?;
    let pipeline = IngestionPipeline::new(db, &mailbox.mailbox_id, encryptor.as_ref(), options);
    pipeline
        .analyze_date_range(
            connector.as_ref(),
            analyzer,
            run.window_start,
            run.window_end,
            &run.run_id,
        )
        .await
}

/// Background executor. Jobs run one at a time on a dedicated thread with its
/// own database connection and a current-thread runtime.
pub struct RunWorker {
    jobs: Option<mpsc::Sender<String>>,
    handle: Option<JoinHandle<()>>,
}

impl RunWorker {
    pub fn spawn(
        db_path: PathBuf,
        connectors: Arc<dyn ConnectorFactory>,
        analyzer: Arc<dyn Analyzer>,
        keys: PayloadKeys,
        options: PipelineOptions,
    ) -> Result<Self, PipelineError> {
        let (sender, receiver) = mpsc::channel::<String>();

        let handle = std::thread::Builder::new()
            .name("mailmind-run-worker".to_string())
            .spawn(move || {
                let db = match Database::open(&db_path) {
                    Ok(db) => db,
                    Err(error) => {
                        error!(path = %db_path.display(), "run worker cannot open database: {error}");
                        return;
                    }
                };
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(error) => {
                        error!("run worker cannot start runtime: {error}");
                        return;
                    }
                };

                while let Ok(run_id) = receiver.recv() {
                    info!(run_id = %run_id, "worker picked up run");
                    let result = runtime.block_on(execute_run(
                        &db,
                        &run_id,
                        connectors.as_ref(),
                        analyzer.as_ref(),
                        &keys,
                        options,
                    ));
                    match result {
                        Ok(run) => info!(run_id = %run_id, status = %run.status, "run finished"),
                        Err(error) => error!(run_id = %run_id, "could not record run result: {error}"),
                    }
                }
            })
            .map_err(|error| PipelineError::Db(DbError::Io(error)))?;

        Ok(Self {
            jobs: Some(sender),
            handle: Some(handle),
        })
    }

    /// Validates the request, records a pending run and queues it. Returns
    /// the run id immediately.
    pub fn submit(
        &self,
        db: &Database,
        mailbox_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        force: bool,
    ) -> Result<String, PipelineError> {
        let window = validate_request(db, mailbox_id, start, end)?;
        let run = db.create_run(mailbox_id, window.start, window.end, force)?;

        let queued = self
            .jobs
            .as_ref()
            .is_some_and(|jobs| jobs.send(run.run_id.clone()).is_ok());
        if !queued {
            db.fail_run(
                &run.run_id,
                ErrorKind::Unclassified.as_str(),
                "run worker is not running",
            )?;
            return Err(PipelineError::WorkerStopped);
        }

        info!(
            run_id = %run.run_id,
            mailbox_id,
            start = %format_timestamp(window.start),
            end = %format_timestamp(window.end),
            force,
            "run queued"
        );
        Ok(run.run_id)
    }

    /// Stops accepting jobs and waits for queued ones to finish.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.jobs.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("run worker panicked");
            }
        }
    }
}

impl Drop for RunWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Checks a run request before anything is recorded.
pub fn validate_request(
    db: &Database,
    mailbox_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Span, PipelineError> {
    let window = Span::new(start, end).ok_or_else(|| {
        PipelineError::InvalidWindow(format!(
            "start {} must be before end {}",
            format_timestamp(start),
            format_timestamp(end)
        ))
    })?;
    let mailbox = db
        .get_mailbox(mailbox_id)?
        .ok_or_else(|| PipelineError::MailboxNotFound(mailbox_id.to_string()))?;
    if !mailbox.is_active {
        return Err(PipelineError::MailboxInactive(mailbox.mailbox_id));
    }
    Ok(window)
}

/// Fails runs stuck in processing since before `now - older_than` and undoes
/// what they left behind: coverage they marked goes back to its pre-run
/// state, then their artifacts and the messages nothing else references are
/// deleted.
pub fn reap_stale_runs(db: &Database, older_than: Duration) -> Result<Vec<Run>, DbError> {
    let cutoff = Utc::now() - older_than;
    let mut reaped = Vec::new();

    for run in db.stale_runs(cutoff)? {
        if !db.fail_run(&run.run_id, ErrorKind::Unclassified.as_str(), STALE_RUN_MESSAGE)? {
            continue;
        }
        let tracker = CoverageTracker::new(db, run.mailbox_id.clone());
        let marks = tracker.marks_for_run(&run.run_id)?;
        let reverted = tracker.remove(&marks);
        if reverted == marks.len() {
            tracker.forget_run_marks(&run.run_id)?;
        }
        let artifacts = db.delete_artifacts_for_run(&run.run_id)?;
        let messages = db.purge_orphaned_messages(&run.mailbox_id)?;
        warn!(
            run_id = %run.run_id,
            mailbox_id = %run.mailbox_id,
            started_at = run.started_at.as_deref().unwrap_or("-"),
            reverted,
            artifacts,
            messages,
            "reaped stale run"
        );
        if let Some(updated) = db.get_run(&run.run_id)? {
            reaped.push(updated);
        }
    }

    Ok(reaped)
}
