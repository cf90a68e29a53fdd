use anyhow::Result;
use rusqlite::Connection;

pub fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS mailboxes (
            mailbox_id TEXT PRIMARY KEY,
            provider TEXT NOT NULL CHECK(provider IN ('gmail', 'json_archive')),
            email_address TEXT NOT NULL,
            display_name TEXT,
            is_active BOOLEAN NOT NULL DEFAULT true,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
            config TEXT
        );

        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            mailbox_id TEXT NOT NULL REFERENCES mailboxes(mailbox_id) ON DELETE CASCADE,
            provider_message_id TEXT NOT NULL,
            sender_address TEXT NOT NULL,
            sender_name TEXT,
            subject TEXT NOT NULL DEFAULT '',
            received_at TEXT NOT NULL,
            stored_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
            UNIQUE(mailbox_id, provider_message_id)
        );

        CREATE TABLE IF NOT EXISTS runs (
            run_id TEXT PRIMARY KEY,
            mailbox_id TEXT NOT NULL REFERENCES mailboxes(mailbox_id) ON DELETE CASCADE,
            window_start TEXT NOT NULL,
            window_end TEXT NOT NULL,
            force_reanalysis BOOLEAN NOT NULL DEFAULT false,
            status TEXT NOT NULL CHECK(status IN ('pending', 'processing', 'completed', 'failed', 'cancelled')),
            items_processed INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            error_kind TEXT,
            error_message TEXT
        );

        CREATE TABLE IF NOT EXISTS analysis_artifacts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
            sender_cluster TEXT NOT NULL,
            subject_cluster TEXT NOT NULL,
            category TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS coverage_intervals (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            mailbox_id TEXT NOT NULL REFERENCES mailboxes(mailbox_id) ON DELETE CASCADE,
            start_at TEXT NOT NULL,
            end_at TEXT NOT NULL,
            item_count INTEGER NOT NULL DEFAULT 0,
            processed_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
            CHECK(start_at < end_at)
        );

        CREATE TABLE IF NOT EXISTS run_marks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
            mailbox_id TEXT NOT NULL REFERENCES mailboxes(mailbox_id) ON DELETE CASCADE,
            start_at TEXT NOT NULL,
            end_at TEXT NOT NULL,
            item_count INTEGER NOT NULL DEFAULT 0,
            absorbed TEXT NOT NULL DEFAULT '[]',
            marked_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS sync_state (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );

        CREATE INDEX IF NOT EXISTS idx_messages_mailbox_received ON messages(mailbox_id, received_at);
        CREATE INDEX IF NOT EXISTS idx_messages_sender ON messages(sender_address);
        CREATE INDEX IF NOT EXISTS idx_artifacts_run_id ON analysis_artifacts(run_id);
        CREATE INDEX IF NOT EXISTS idx_artifacts_message_id ON analysis_artifacts(message_id);
        CREATE INDEX IF NOT EXISTS idx_artifacts_category ON analysis_artifacts(category);
        CREATE INDEX IF NOT EXISTS idx_runs_mailbox_created ON runs(mailbox_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
        CREATE INDEX IF NOT EXISTS idx_coverage_mailbox_start ON coverage_intervals(mailbox_id, start_at);
        CREATE INDEX IF NOT EXISTS idx_run_marks_run_id ON run_marks(run_id);
        "#,
    )?;

    Ok(())
}
