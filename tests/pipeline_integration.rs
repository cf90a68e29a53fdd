use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use mailmind::analyzer::{Analyzer, AnalyzerError, BatchInsights, KeywordAnalyzer};
use mailmind::connectors::{Connector, ConnectorError, ConnectorFactory, FetchedMessage};
use mailmind::coverage::{CoverageTracker, Span};
use mailmind::crypto::{PassthroughEncryptor, PayloadKeys};
use mailmind::db::models::{Mailbox, Provider, RunStatus};
use mailmind::db::Database;
use mailmind::pipeline::{
    execute_run, validate_request, ErrorKind, IngestionPipeline, PipelineError, PipelineOptions,
    RunOutcome, RunWorker,
};
use uuid::Uuid;

const MASTER_HEX: &str = "8f3a1c2b4d5e6f708192a3b4c5d6e7f8091a2b3c4d5e6f708192a3b4c5d6e7f8";

type Fetch = Result<Vec<FetchedMessage>, ConnectorError>;

struct StubConnector<'a> {
    responses: RefCell<VecDeque<Fetch>>,
    calls: RefCell<Vec<(DateTime<Utc>, DateTime<Utc>)>>,
    on_call: Option<Box<dyn Fn(usize) + 'a>>,
}

impl<'a> StubConnector<'a> {
    fn scripted(responses: Vec<Fetch>) -> Self {
        Self {
            responses: RefCell::new(responses.into()),
            calls: RefCell::new(Vec::new()),
            on_call: None,
        }
    }

    fn with_hook(mut self, hook: impl Fn(usize) + 'a) -> Self {
        self.on_call = Some(Box::new(hook));
        self
    }

    fn calls(&self) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        self.calls.borrow().clone()
    }
}

#[async_trait(?Send)]
impl Connector for StubConnector<'_> {
    fn name(&self) -> &str {
        "stub"
    }

    async fn fetch_messages(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Fetch {
        self.calls.borrow_mut().push((start, end));
        let call = self.calls.borrow().len();
        if let Some(hook) = &self.on_call {
            hook(call);
        }
        self.responses
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

struct BrokenAnalyzer;

impl Analyzer for BrokenAnalyzer {
    fn analyze(&self, _messages: &[FetchedMessage]) -> Result<BatchInsights, AnalyzerError> {
        Err(AnalyzerError("model unavailable".to_string()))
    }
}

/// Cancels the run from a second connection while the batch is analyzed,
/// the way the CLI's Ctrl-C handler does.
struct CancelDuringAnalysis {
    db_path: PathBuf,
    run_id: String,
    cancel_accepted: AtomicBool,
}

impl Analyzer for CancelDuringAnalysis {
    fn analyze(&self, messages: &[FetchedMessage]) -> Result<BatchInsights, AnalyzerError> {
        let accepted = Database::open(&self.db_path)
            .and_then(|other| other.request_cancel(&self.run_id))
            .is_ok();
        self.cancel_accepted.store(accepted, Ordering::SeqCst);
        KeywordAnalyzer.analyze(messages)
    }
}

/// Hands out a connector that always fails the way the mailbox's provider
/// does when its refresh token was revoked.
struct RevokedCredentials;

struct RevokedConnector;

#[async_trait(?Send)]
impl Connector for RevokedConnector {
    fn name(&self) -> &str {
        "revoked"
    }

    async fn fetch_messages(&self, _start: DateTime<Utc>, _end: DateTime<Utc>) -> Fetch {
        Err(ConnectorError::PermanentCredential(
            "token refresh rejected: invalid_grant".to_string(),
        ))
    }
}

impl ConnectorFactory for RevokedCredentials {
    fn connect(&self, _mailbox: &Mailbox) -> Result<Box<dyn Connector>, ConnectorError> {
        Ok(Box::new(RevokedConnector))
    }
}

struct FixedMessages(Vec<FetchedMessage>);

impl ConnectorFactory for FixedMessages {
    fn connect(&self, _mailbox: &Mailbox) -> Result<Box<dyn Connector>, ConnectorError> {
        Ok(Box::new(StubConnector::scripted(vec![Ok(self.0.clone())])))
    }
}

fn temp_db() -> (Database, PathBuf) {
    let path = std::env::temp_dir().join(format!("mailmind-pipeline-it-{}.db", Uuid::new_v4()));
    let db = Database::open(&path).expect("open db");
    db.insert_mailbox(&Mailbox {
        mailbox_id: "mbx".to_string(),
        provider: Provider::Gmail,
        email_address: "owner@example.com".to_string(),
        display_name: Some("Owner".to_string()),
        is_active: true,
        created_at: None,
        config: None,
    })
    .expect("insert mailbox");
    (db, path)
}

fn cleanup(path: &Path) {
    let _ = std::fs::remove_file(path);
}

fn day(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0)
        .single()
        .expect("valid date")
}

fn message(id: &str, sender: &str, subject: &str, at: DateTime<Utc>) -> FetchedMessage {
    FetchedMessage {
        provider_message_id: id.to_string(),
        sender_address: sender.to_string(),
        sender_name: None,
        subject: subject.to_string(),
        received_at: at,
        thread_id: None,
        snippet: String::new(),
    }
}

fn spans(intervals: &[(DateTime<Utc>, DateTime<Utc>)]) -> Vec<Span> {
    intervals
        .iter()
        .map(|(start, end)| Span::new(*start, *end).expect("span"))
        .collect()
}

fn coverage(db: &Database) -> Vec<(DateTime<Utc>, DateTime<Utc>, i64)> {
    CoverageTracker::new(db, "mbx")
        .intervals()
        .expect("intervals")
        .into_iter()
        .map(|interval| (interval.start, interval.end, interval.item_count))
        .collect()
}

#[tokio::test]
async fn extends_existing_coverage_with_the_missing_gap() {
    let (db, path) = temp_db();
    let tracker = CoverageTracker::new(&db, "mbx");
    tracker.mark_processed(day(1), day(10), 7).expect("seed coverage");
    assert_eq!(
        tracker.gaps(day(5), day(20)).expect("gaps"),
        spans(&[(day(10), day(20))])
    );

    let connector = StubConnector::scripted(vec![Ok(vec![
        message("m-1", "billing@shop.example", "Your order has shipped", day(11)),
        message("m-2", "billing@shop.example", "Your order has shipped again", day(12)),
        message("m-3", "alice@example.com", "Lunch?", day(13)),
        message("m-4", "billing@shop.example", "Weekly newsletter", day(15)),
        message("m-5", "alice@example.com", "Quarterly planning", day(19) + Duration::hours(23)),
    ])]);
    let keys = PayloadKeys::from_hex(MASTER_HEX).expect("master key");
    let encryptor = keys.for_mailbox("mbx").expect("encryptor");
    let run = db.create_run("mbx", day(5), day(20), false).expect("run");

    let pipeline = IngestionPipeline::new(&db, "mbx", encryptor.as_ref(), PipelineOptions::default());
    let outcome = pipeline
        .analyze_date_range(&connector, &KeywordAnalyzer, day(5), day(20), &run.run_id)
        .await
        .expect("run succeeds");

    assert_eq!(outcome, RunOutcome::Completed { items_processed: 5 });
    assert_eq!(connector.calls(), vec![(day(10), day(20))]);
    assert_eq!(coverage(&db), vec![(day(1), day(20), 12)]);

    let finished = db.get_run(&run.run_id).expect("get").expect("run exists");
    assert_eq!(finished.status, RunStatus::Completed);
    assert_eq!(finished.items_processed, 5);
    assert!(finished.completed_at.is_some());

    let artifacts = db.artifacts_for_run(&run.run_id).expect("artifacts");
    assert_eq!(artifacts.len(), 5);
    let shipped = artifacts
        .iter()
        .find(|artifact| artifact.subject_cluster.starts_with("subject_cluster_"))
        .expect("shipping notices cluster together");
    assert_eq!(shipped.sender_cluster, "sender_top_1");
    assert!(shipped.payload.starts_with("v1:"));
    assert!(!shipped.payload.contains("shipped"));

    let opened = encryptor.decrypt(&shipped.payload).expect("decrypt payload");
    let payload: serde_json::Value = serde_json::from_slice(&opened).expect("payload json");
    assert_eq!(payload["analysis"]["total_messages"], 5);
    assert!(payload["message"]["provider_message_id"].is_string());
    cleanup(&path);
}

#[tokio::test]
async fn fully_covered_window_makes_no_connector_calls() {
    let (db, path) = temp_db();
    CoverageTracker::new(&db, "mbx")
        .mark_processed(day(1), day(31), 40)
        .expect("seed coverage");
    let run = db.create_run("mbx", day(5), day(20), false).expect("run");
    let connector = StubConnector::scripted(Vec::new());

    let outcome = IngestionPipeline::new(&db, "mbx", &PassthroughEncryptor, PipelineOptions::default())
        .analyze_date_range(&connector, &KeywordAnalyzer, day(5), day(20), &run.run_id)
        .await
        .expect("run succeeds");

    assert_eq!(outcome, RunOutcome::Completed { items_processed: 0 });
    assert!(connector.calls().is_empty());
    assert_eq!(coverage(&db), vec![(day(1), day(31), 40)]);
    assert_eq!(db.run_status(&run.run_id).expect("status"), RunStatus::Completed);
    cleanup(&path);
}

#[tokio::test]
async fn empty_gaps_are_still_marked_covered() {
    let (db, path) = temp_db();
    let pipeline = IngestionPipeline::new(&db, "mbx", &PassthroughEncryptor, PipelineOptions::default());

    let first = db.create_run("mbx", day(1), day(8), false).expect("run");
    let quiet = StubConnector::scripted(vec![Ok(Vec::new())]);
    pipeline
        .analyze_date_range(&quiet, &KeywordAnalyzer, day(1), day(8), &first.run_id)
        .await
        .expect("first run");
    assert_eq!(coverage(&db), vec![(day(1), day(8), 0)]);

    let second = db.create_run("mbx", day(1), day(8), false).expect("run");
    let untouched = StubConnector::scripted(Vec::new());
    pipeline
        .analyze_date_range(&untouched, &KeywordAnalyzer, day(1), day(8), &second.run_id)
        .await
        .expect("second run");
    assert!(untouched.calls().is_empty());
    cleanup(&path);
}

#[tokio::test]
async fn failure_after_first_gap_restores_gaps_and_removes_run_data() {
    let (db, path) = temp_db();
    let tracker = CoverageTracker::new(&db, "mbx");
    tracker.mark_processed(day(5), day(10), 3).expect("seed coverage");
    let before = tracker.gaps(day(1), day(15)).expect("gaps");
    assert_eq!(before, spans(&[(day(1), day(5)), (day(10), day(15))]));

    let connector = StubConnector::scripted(vec![
        Ok(vec![
            message("m-1", "alice@example.com", "Standup notes", day(2)),
            message("m-2", "bob@example.com", "Invoice", day(3)),
        ]),
        Err(ConnectorError::Transient("provider returned 503".to_string())),
    ]);
    let run = db.create_run("mbx", day(1), day(15), false).expect("run");

    let error = IngestionPipeline::new(&db, "mbx", &PassthroughEncryptor, PipelineOptions::default())
        .analyze_date_range(&connector, &KeywordAnalyzer, day(1), day(15), &run.run_id)
        .await
        .expect_err("second gap fails");

    assert_eq!(error.kind(), ErrorKind::TransientNetwork);
    assert_eq!(connector.calls().len(), 2);
    assert_eq!(tracker.gaps(day(1), day(15)).expect("gaps"), before);
    assert_eq!(coverage(&db), vec![(day(5), day(10), 3)]);
    assert!(db.artifacts_for_run(&run.run_id).expect("artifacts").is_empty());
    assert!(db.list_messages("mbx").expect("messages").is_empty());
    cleanup(&path);
}

#[tokio::test]
async fn analyzer_failure_stores_nothing() {
    let (db, path) = temp_db();
    let connector = StubConnector::scripted(vec![Ok(vec![message(
        "m-1",
        "alice@example.com",
        "Hello",
        day(2),
    )])]);
    let run = db.create_run("mbx", day(1), day(4), false).expect("run");

    let error = IngestionPipeline::new(&db, "mbx", &PassthroughEncryptor, PipelineOptions::default())
        .analyze_date_range(&connector, &BrokenAnalyzer, day(1), day(4), &run.run_id)
        .await
        .expect_err("analysis fails");

    assert!(matches!(error, PipelineError::Analyzer(_)));
    assert_eq!(error.kind(), ErrorKind::Unclassified);
    assert!(db.list_messages("mbx").expect("messages").is_empty());
    assert!(coverage(&db).is_empty());
    cleanup(&path);
}

#[tokio::test]
async fn cancellation_mid_run_reverts_committed_gaps() {
    let (db, path) = temp_db();
    let tracker = CoverageTracker::new(&db, "mbx");
    tracker.mark_processed(day(8), day(10), 1).expect("seed");
    tracker.mark_processed(day(18), day(20), 2).expect("seed");
    assert_eq!(tracker.gaps(day(1), day(31)).expect("gaps").len(), 3);

    let run = db.create_run("mbx", day(1), day(31), false).expect("run");
    let run_id = run.run_id.clone();
    let db_path = path.clone();
    let connector = StubConnector::scripted(vec![
        Ok(vec![message("m-1", "alice@example.com", "Gap one", day(3))]),
        Ok(vec![message("m-2", "alice@example.com", "Gap two", day(12))]),
    ])
    .with_hook(move |call| {
        // The user cancels from another process while gap two is in flight.
        if call == 2 {
            let other = Database::open(&db_path).expect("second connection");
            other.request_cancel(&run_id).expect("cancel accepted");
        }
    });

    let outcome = IngestionPipeline::new(&db, "mbx", &PassthroughEncryptor, PipelineOptions::default())
        .analyze_date_range(&connector, &KeywordAnalyzer, day(1), day(31), &run.run_id)
        .await
        .expect("cancel is not an error");

    assert!(matches!(outcome, RunOutcome::Cancelled { .. }));
    assert_eq!(
        connector.calls(),
        vec![(day(1), day(8)), (day(10), day(18))],
        "gap three is never attempted"
    );
    assert_eq!(
        coverage(&db),
        vec![(day(8), day(10), 1), (day(18), day(20), 2)]
    );
    assert_eq!(db.run_status(&run.run_id).expect("status"), RunStatus::Cancelled);
    assert!(db.artifacts_for_run(&run.run_id).expect("artifacts").is_empty());
    assert!(db.find_message("mbx", "m-1").expect("find").is_none());
    cleanup(&path);
}

#[tokio::test]
async fn cancel_from_another_connection_lands_during_analysis() {
    let (db, path) = temp_db();
    let run = db.create_run("mbx", day(1), day(5), false).expect("run");
    let connector = StubConnector::scripted(vec![Ok(vec![
        message("m-1", "alice@example.com", "Hello", day(2)),
        message("m-2", "bob@example.com", "Report", day(3)),
        message("m-3", "carol@example.com", "Invoice", day(4)),
    ])]);
    let analyzer = CancelDuringAnalysis {
        db_path: path.clone(),
        run_id: run.run_id.clone(),
        cancel_accepted: AtomicBool::new(false),
    };

    let outcome = IngestionPipeline::new(&db, "mbx", &PassthroughEncryptor, PipelineOptions::default())
        .analyze_date_range(&connector, &analyzer, day(1), day(5), &run.run_id)
        .await
        .expect("cancel is not an error");

    assert!(analyzer.cancel_accepted.load(Ordering::SeqCst));
    assert_eq!(outcome, RunOutcome::Cancelled { items_processed: 0 });
    assert_eq!(db.run_status(&run.run_id).expect("status"), RunStatus::Cancelled);
    assert!(db.list_messages("mbx").expect("messages").is_empty());
    assert!(coverage(&db).is_empty());
    cleanup(&path);
}

#[tokio::test]
async fn progress_is_committed_after_each_storage_chunk() {
    let (db, path) = temp_db();
    db.conn()
        .execute_batch(
            r#"
            CREATE TRIGGER refuse_third_message BEFORE INSERT ON messages
            WHEN NEW.provider_message_id = 'm-3'
            BEGIN
                SELECT RAISE(ABORT, 'disk refused write');
            END;
            "#,
        )
        .expect("create trigger");
    let run = db.create_run("mbx", day(1), day(5), false).expect("run");
    let connector = StubConnector::scripted(vec![Ok(vec![
        message("m-1", "alice@example.com", "Hello", day(2)),
        message("m-2", "bob@example.com", "Report", day(3)),
        message("m-3", "carol@example.com", "Invoice", day(4)),
    ])]);
    let options = PipelineOptions {
        store_chunk_size: 1,
        ..PipelineOptions::default()
    };

    let error = IngestionPipeline::new(&db, "mbx", &PassthroughEncryptor, options)
        .analyze_date_range(&connector, &KeywordAnalyzer, day(1), day(5), &run.run_id)
        .await
        .expect_err("third message cannot be stored");
    assert_eq!(error.kind(), ErrorKind::Unclassified);

    let observer = Database::open(&path).expect("second connection");
    let seen = observer.get_run(&run.run_id).expect("get").expect("run exists");
    assert_eq!(seen.items_processed, 2);

    assert!(db.list_messages("mbx").expect("messages").is_empty());
    assert!(db.artifacts_for_run(&run.run_id).expect("artifacts").is_empty());
    assert!(coverage(&db).is_empty());
    cleanup(&path);
}

#[tokio::test]
async fn cancelled_before_start_never_fetches() {
    let (db, path) = temp_db();
    let run = db.create_run("mbx", day(1), day(5), false).expect("run");
    db.request_cancel(&run.run_id).expect("cancel pending run");
    let connector = StubConnector::scripted(Vec::new());

    let outcome = IngestionPipeline::new(&db, "mbx", &PassthroughEncryptor, PipelineOptions::default())
        .analyze_date_range(&connector, &KeywordAnalyzer, day(1), day(5), &run.run_id)
        .await
        .expect("cancelled run");

    assert_eq!(outcome, RunOutcome::Cancelled { items_processed: 0 });
    assert!(connector.calls().is_empty());
    assert!(coverage(&db).is_empty());
    cleanup(&path);
}

#[tokio::test]
async fn refetched_messages_are_reused_not_duplicated() {
    let (db, path) = temp_db();
    let pipeline = IngestionPipeline::new(&db, "mbx", &PassthroughEncryptor, PipelineOptions::default());

    let first = db.create_run("mbx", day(1), day(5), false).expect("run");
    let connector = StubConnector::scripted(vec![Ok(vec![
        message("m-1", "alice@example.com", "Hello", day(1) + Duration::hours(9)),
        message("m-2", "bob@example.com", "Report", day(2)),
        message("m-1", "alice@example.com", "Hello", day(1) + Duration::hours(9)),
    ])]);
    let outcome = pipeline
        .analyze_date_range(&connector, &KeywordAnalyzer, day(1), day(5), &first.run_id)
        .await
        .expect("first run");
    assert_eq!(outcome, RunOutcome::Completed { items_processed: 2 });

    let forced = db.create_run("mbx", day(1), day(5), true).expect("forced run");
    let again = StubConnector::scripted(vec![Ok(vec![
        message("m-1", "alice@example.com", "Hello", day(1) + Duration::hours(9)),
        message("m-2", "bob@example.com", "Report", day(2)),
        message("m-3", "carol@example.com", "New thing", day(4)),
    ])]);
    pipeline
        .analyze_date_range(&again, &KeywordAnalyzer, day(1), day(5), &forced.run_id)
        .await
        .expect("forced run");

    assert_eq!(again.calls(), vec![(day(1), day(5))]);
    assert_eq!(db.list_messages("mbx").expect("messages").len(), 3);
    assert_eq!(db.artifacts_for_run(&first.run_id).expect("artifacts").len(), 2);
    assert_eq!(db.artifacts_for_run(&forced.run_id).expect("artifacts").len(), 3);
    assert_eq!(coverage(&db), vec![(day(1), day(5), 3)]);
    cleanup(&path);
}

#[tokio::test]
async fn failed_forced_run_restores_cleared_coverage() {
    let (db, path) = temp_db();
    CoverageTracker::new(&db, "mbx")
        .mark_processed(day(1), day(10), 4)
        .expect("seed coverage");
    let run = db.create_run("mbx", day(3), day(6), true).expect("forced run");
    let connector =
        StubConnector::scripted(vec![Err(ConnectorError::Unclassified("boom".to_string()))]);

    let error = IngestionPipeline::new(&db, "mbx", &PassthroughEncryptor, PipelineOptions::default())
        .analyze_date_range(&connector, &KeywordAnalyzer, day(3), day(6), &run.run_id)
        .await
        .expect_err("fetch fails");

    assert_eq!(error.kind(), ErrorKind::Unclassified);
    assert_eq!(connector.calls(), vec![(day(3), day(6))]);
    assert_eq!(coverage(&db), vec![(day(1), day(10), 4)]);
    cleanup(&path);
}

#[tokio::test]
async fn long_gaps_are_fetched_in_chunks() {
    let (db, path) = temp_db();
    let run = db.create_run("mbx", day(1), day(31), false).expect("run");
    let connector = StubConnector::scripted(Vec::new());
    let options = PipelineOptions {
        fetch_chunk_days: 10,
        ..PipelineOptions::default()
    };

    IngestionPipeline::new(&db, "mbx", &PassthroughEncryptor, options)
        .analyze_date_range(&connector, &KeywordAnalyzer, day(1), day(31), &run.run_id)
        .await
        .expect("run");

    assert_eq!(
        connector.calls(),
        vec![(day(1), day(11)), (day(11), day(21)), (day(21), day(31))]
    );
    assert_eq!(coverage(&db), vec![(day(1), day(31), 0)]);
    cleanup(&path);
}

#[tokio::test]
async fn revoked_credentials_fail_the_run_and_deactivate_the_mailbox() {
    let (db, path) = temp_db();
    let run = db.create_run("mbx", day(1), day(5), false).expect("run");

    let finished = execute_run(
        &db,
        &run.run_id,
        &RevokedCredentials,
        &KeywordAnalyzer,
        &PayloadKeys::Passthrough,
        PipelineOptions::default(),
    )
    .await
    .expect("bookkeeping succeeds");

    assert_eq!(finished.status, RunStatus::Failed);
    assert_eq!(finished.error_kind.as_deref(), Some("permanent_credential"));
    assert!(finished
        .error_message
        .as_deref()
        .is_some_and(|message| message.contains("invalid_grant")));

    let mailbox = db.get_mailbox("mbx").expect("get").expect("mailbox exists");
    assert!(!mailbox.is_active);
    assert!(matches!(
        validate_request(&db, "mbx", day(1), day(5)),
        Err(PipelineError::MailboxInactive(_))
    ));
    cleanup(&path);
}

#[test]
fn worker_runs_submitted_jobs_in_the_background() {
    let (db, path) = temp_db();
    let factory = FixedMessages(vec![
        message("m-1", "alice@example.com", "Standup", day(2)),
        message("m-2", "bob@example.com", "Invoice", day(3)),
    ]);
    let worker = RunWorker::spawn(
        path.clone(),
        Arc::new(factory),
        Arc::new(KeywordAnalyzer),
        PayloadKeys::Passthrough,
        PipelineOptions::default(),
    )
    .expect("spawn worker");

    let run_id = worker
        .submit(&db, "mbx", day(1), day(5), false)
        .expect("submit");
    assert!(matches!(
        worker.submit(&db, "mbx", day(5), day(1), false),
        Err(PipelineError::InvalidWindow(_))
    ));
    worker.shutdown();

    let run = db.get_run(&run_id).expect("get").expect("run exists");
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.items_processed, 2);
    assert_eq!(coverage(&db), vec![(day(1), day(5), 2)]);
    cleanup(&path);
}
