use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use self::models::{
    format_timestamp, now_timestamp, AnalysisArtifact, Mailbox, MessageRecord, Run, RunStatus,
};

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("json serialization: {0}")]
    Json(#[from] serde_json::Error),

    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Config(String),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("run {run_id} is {status}; only pending or processing runs can be cancelled")]
    CancelRejected { run_id: String, status: RunStatus },
}

pub mod migrations;
pub mod models;
pub mod schema;

const RUN_COLUMNS: &str = "run_id, mailbox_id, window_start, window_end, force_reanalysis, status, \
     items_processed, error_kind, error_message, created_at, started_at, completed_at";

#[derive(Debug, Clone, Serialize)]
pub struct StatusCount {
    pub status: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStats {
    pub total_mailboxes: i64,
    pub total_messages: i64,
    pub total_artifacts: i64,
    pub total_coverage_intervals: i64,
    pub runs_by_status: Vec<StatusCount>,
}

pub struct Database {
    conn: Connection,
    path: PathBuf,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        // The worker and the request path hold separate connections.
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let mut db = Self {
            conn,
            path: path.to_path_buf(),
        };
        db.initialize()?;
        Ok(db)
    }

    pub fn initialize(&mut self) -> Result<(), DbError> {
        self.run_migrations()
    }

    fn run_migrations(&mut self) -> Result<(), DbError> {
        migrations::migrate(&self.conn)
            .map_err(|e| DbError::Config(format!("migration failed: {e}")))
    }

    pub fn default_db_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir()
            .ok_or_else(|| DbError::Config("failed to determine home directory".to_string()))?;
        Ok(home.join(".mailmind").join("mailmind.db"))
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn insert_mailbox(&self, mailbox: &Mailbox) -> Result<(), DbError> {
        let config_json = mailbox
            .config
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.conn.execute(
            r#"
            INSERT INTO mailboxes (mailbox_id, provider, email_address, display_name, is_active, config)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(mailbox_id) DO UPDATE SET
                provider = excluded.provider,
                email_address = excluded.email_address,
                display_name = excluded.display_name,
                is_active = excluded.is_active,
                config = excluded.config
            "#,
            params![
                mailbox.mailbox_id,
                mailbox.provider.to_string(),
                mailbox.email_address,
                mailbox.display_name,
                mailbox.is_active,
                config_json,
            ],
        )?;

        Ok(())
    }

    pub fn get_mailbox(&self, mailbox_id: &str) -> Result<Option<Mailbox>, DbError> {
        let mailbox = self
            .conn
            .query_row(
                r#"
                SELECT mailbox_id, provider, email_address, display_name, is_active, created_at, config
                FROM mailboxes
                WHERE mailbox_id = ?
                "#,
                [mailbox_id],
                Mailbox::from_row,
            )
            .optional()?;
        Ok(mailbox)
    }

    pub fn list_mailboxes(&self) -> Result<Vec<Mailbox>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT mailbox_id, provider, email_address, display_name, is_active, created_at, config
            FROM mailboxes
            ORDER BY email_address ASC
            "#,
        )?;

        let mailboxes = stmt
            .query_map([], Mailbox::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(mailboxes)
    }

    pub fn remove_mailbox(&self, mailbox_id: &str) -> Result<usize, DbError> {
        let deleted = self
            .conn
            .execute("DELETE FROM mailboxes WHERE mailbox_id = ?", [mailbox_id])?;
        Ok(deleted)
    }

    pub fn set_mailbox_active(&self, mailbox_id: &str, active: bool) -> Result<bool, DbError> {
        let updated = self.conn.execute(
            "UPDATE mailboxes SET is_active = ? WHERE mailbox_id = ?",
            params![active, mailbox_id],
        )?;
        Ok(updated > 0)
    }

    pub fn find_message(
        &self,
        mailbox_id: &str,
        provider_message_id: &str,
    ) -> Result<Option<MessageRecord>, DbError> {
        let message = self
            .conn
            .query_row(
                r#"
                SELECT id, mailbox_id, provider_message_id, sender_address, sender_name, subject,
                       received_at, stored_at
                FROM messages
                WHERE mailbox_id = ? AND provider_message_id = ?
                "#,
                params![mailbox_id, provider_message_id],
                MessageRecord::from_row,
            )
            .optional()?;
        Ok(message)
    }

    pub fn list_messages(&self, mailbox_id: &str) -> Result<Vec<MessageRecord>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, mailbox_id, provider_message_id, sender_address, sender_name, subject,
                   received_at, stored_at
            FROM messages
            WHERE mailbox_id = ?
            ORDER BY received_at ASC, id ASC
            "#,
        )?;
        let messages = stmt
            .query_map([mailbox_id], MessageRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(messages)
    }

    pub fn artifacts_for_run(&self, run_id: &str) -> Result<Vec<AnalysisArtifact>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, message_id, run_id, sender_cluster, subject_cluster, category, payload, created_at
            FROM analysis_artifacts
            WHERE run_id = ?
            ORDER BY id ASC
            "#,
        )?;
        let artifacts = stmt
            .query_map([run_id], AnalysisArtifact::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(artifacts)
    }

    pub fn delete_artifacts_for_run(&self, run_id: &str) -> Result<usize, DbError> {
        let deleted = self
            .conn
            .execute("DELETE FROM analysis_artifacts WHERE run_id = ?", [run_id])?;
        Ok(deleted)
    }

    /// Deletes the given messages unless an artifact still references them.
    pub fn delete_orphaned_messages(&self, message_ids: &[i64]) -> Result<usize, DbError> {
        let mut deleted = 0usize;
        for id in message_ids {
            deleted += self.conn.execute(
                r#"
                DELETE FROM messages
                WHERE id = ?
                  AND NOT EXISTS (SELECT 1 FROM analysis_artifacts WHERE message_id = messages.id)
                "#,
                [id],
            )?;
        }
        Ok(deleted)
    }

    /// Deletes every message of the mailbox that no artifact references.
    pub fn purge_orphaned_messages(&self, mailbox_id: &str) -> Result<usize, DbError> {
        let deleted = self.conn.execute(
            r#"
            DELETE FROM messages
            WHERE mailbox_id = ?
              AND NOT EXISTS (SELECT 1 FROM analysis_artifacts WHERE message_id = messages.id)
            "#,
            [mailbox_id],
        )?;
        Ok(deleted)
    }

    pub fn create_run(
        &self,
        mailbox_id: &str,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        force: bool,
    ) -> Result<Run, DbError> {
        let run_id = Uuid::new_v4().to_string();
        self.conn.execute(
            r#"
            INSERT INTO runs (run_id, mailbox_id, window_start, window_end, force_reanalysis, status,
                              items_processed, created_at)
            VALUES (?, ?, ?, ?, ?, 'pending', 0, ?)
            "#,
            params![
                run_id,
                mailbox_id,
                format_timestamp(window_start),
                format_timestamp(window_end),
                force,
                now_timestamp(),
            ],
        )?;

        self.get_run(&run_id)?.ok_or(DbError::RunNotFound(run_id))
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<Run>, DbError> {
        let run = self
            .conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?"),
                [run_id],
                Run::from_row,
            )
            .optional()?;
        Ok(run)
    }

    pub fn run_status(&self, run_id: &str) -> Result<RunStatus, DbError> {
        self.get_run(run_id)?
            .map(|run| run.status)
            .ok_or_else(|| DbError::RunNotFound(run_id.to_string()))
    }

    pub fn list_runs(&self, mailbox_id: Option<&str>, limit: usize) -> Result<Vec<Run>, DbError> {
        let limit = if limit == 0 { 50 } else { limit };
        let mut sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE 1 = 1");
        let mut params_vec: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(mailbox_id) = mailbox_id {
            sql.push_str(" AND mailbox_id = ?");
            params_vec.push(Box::new(mailbox_id.to_string()));
        }
        sql.push_str(" ORDER BY created_at DESC, rowid DESC LIMIT ?");
        params_vec.push(Box::new(limit as i64));

        let params_refs: Vec<&dyn ToSql> = params_vec.iter().map(|v| v.as_ref()).collect();
        let mut stmt = self.conn.prepare(&sql)?;
        let runs = stmt
            .query_map(params_refs.as_slice(), Run::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    /// pending -> processing. False when the run already left pending.
    pub fn begin_run(&self, run_id: &str) -> Result<bool, DbError> {
        let updated = self.conn.execute(
            r#"
            UPDATE runs SET status = 'processing', started_at = ?
            WHERE run_id = ? AND status = 'pending'
            "#,
            params![now_timestamp(), run_id],
        )?;
        Ok(updated > 0)
    }

    pub fn record_progress(&self, run_id: &str, items_processed: i64) -> Result<bool, DbError> {
        let updated = self.conn.execute(
            "UPDATE runs SET items_processed = ? WHERE run_id = ? AND status = 'processing'",
            params![items_processed, run_id],
        )?;
        Ok(updated > 0)
    }

    /// processing -> completed. False when a cancel won the race.
    pub fn complete_run(&self, run_id: &str, items_processed: i64) -> Result<bool, DbError> {
        let updated = self.conn.execute(
            r#"
            UPDATE runs SET status = 'completed', items_processed = ?, completed_at = ?
            WHERE run_id = ? AND status = 'processing'
            "#,
            params![items_processed, now_timestamp(), run_id],
        )?;
        Ok(updated > 0)
    }

    pub fn fail_run(&self, run_id: &str, error_kind: &str, message: &str) -> Result<bool, DbError> {
        let updated = self.conn.execute(
            r#"
            UPDATE runs SET status = 'failed', error_kind = ?, error_message = ?, completed_at = ?
            WHERE run_id = ? AND status IN ('pending', 'processing')
            "#,
            params![error_kind, message, now_timestamp(), run_id],
        )?;
        Ok(updated > 0)
    }

    pub fn request_cancel(&self, run_id: &str) -> Result<Run, DbError> {
        let updated = self.conn.execute(
            r#"
            UPDATE runs SET status = 'cancelled', completed_at = ?
            WHERE run_id = ? AND status IN ('pending', 'processing')
            "#,
            params![now_timestamp(), run_id],
        )?;

        let run = self
            .get_run(run_id)?
            .ok_or_else(|| DbError::RunNotFound(run_id.to_string()))?;
        if updated == 0 {
            return Err(DbError::CancelRejected {
                run_id: run_id.to_string(),
                status: run.status,
            });
        }
        Ok(run)
    }

    /// Runs still processing that started before `cutoff`.
    pub fn stale_runs(&self, cutoff: DateTime<Utc>) -> Result<Vec<Run>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            r#"
            SELECT {RUN_COLUMNS} FROM runs
            WHERE status = 'processing' AND COALESCE(started_at, created_at) < ?
            ORDER BY created_at ASC
            "#
        ))?;
        let runs = stmt
            .query_map([format_timestamp(cutoff)], Run::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    pub fn get_stats(&self) -> Result<DatabaseStats, DbError> {
        let count = |sql: &str| -> Result<i64, DbError> {
            Ok(self.conn.query_row(sql, [], |row| row.get(0))?)
        };

        let total_mailboxes = count("SELECT COUNT(*) FROM mailboxes")?;
        let total_messages = count("SELECT COUNT(*) FROM messages")?;
        let total_artifacts = count("SELECT COUNT(*) FROM analysis_artifacts")?;
        let total_coverage_intervals = count("SELECT COUNT(*) FROM coverage_intervals")?;

        let mut stmt = self.conn.prepare(
            "SELECT status, COUNT(*) AS count FROM runs GROUP BY status ORDER BY count DESC, status ASC",
        )?;
        let runs_by_status = stmt
            .query_map([], |row| {
                Ok(StatusCount {
                    status: row.get(0)?,
                    count: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(DatabaseStats {
            total_mailboxes,
            total_messages,
            total_artifacts,
            total_coverage_intervals,
            runs_by_status,
        })
    }
}
