use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rusqlite::{Result as SqlResult, Row};
use serde::{Deserialize, Serialize};

/// Storage format for every timestamp column. Fixed width and UTC, so
/// lexicographic order in SQL matches chronological order.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Gmail,
    JsonArchive,
}

impl Display for Provider {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gmail => write!(f, "gmail"),
            Self::JsonArchive => write!(f, "json_archive"),
        }
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gmail" => Ok(Self::Gmail),
            "json_archive" | "json-archive" | "archive" => Ok(Self::JsonArchive),
            other => Err(format!("invalid provider: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl Display for RunStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            other => Err(format!("invalid run status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Mailbox {
    pub mailbox_id: String,
    pub provider: Provider,
    pub email_address: String,
    pub display_name: Option<String>,
    pub is_active: bool,
    pub created_at: Option<String>,
    pub config: Option<serde_json::Value>,
}

/// One stored message, unique per `(mailbox_id, provider_message_id)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageRecord {
    pub id: i64,
    pub mailbox_id: String,
    pub provider_message_id: String,
    pub sender_address: String,
    pub sender_name: Option<String>,
    pub subject: String,
    pub received_at: DateTime<Utc>,
    pub stored_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisArtifact {
    pub id: i64,
    pub message_id: i64,
    pub run_id: String,
    pub sender_cluster: String,
    pub subject_cluster: String,
    pub category: String,
    pub payload: String,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub run_id: String,
    pub mailbox_id: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub force: bool,
    pub status: RunStatus,
    pub items_processed: i64,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoverageInterval {
    pub id: i64,
    pub mailbox_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub item_count: i64,
    pub processed_at: Option<String>,
}

pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.format(TIMESTAMP_FORMAT).to_string()
}

/// Accepts the storage format as well as any RFC 3339 timestamp and
/// normalizes it to UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    let trimmed = raw.trim();
    if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, TIMESTAMP_FORMAT) {
        return Ok(naive.and_utc());
    }
    DateTime::parse_from_rfc3339(trimmed)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|e| format!("invalid timestamp '{trimmed}': {e}"))
}

pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_json_value(raw: Option<String>) -> Option<serde_json::Value> {
    raw.and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok())
}

fn conversion_error(raw: &str, error: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        raw.len(),
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, error)),
    )
}

fn timestamp_column(row: &Row<'_>, column: &str) -> SqlResult<DateTime<Utc>> {
    let raw: String = row.get(column)?;
    parse_timestamp(&raw).map_err(|e| conversion_error(&raw, e))
}

impl Mailbox {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        let provider_raw: String = row.get("provider")?;
        let provider =
            Provider::from_str(&provider_raw).map_err(|e| conversion_error(&provider_raw, e))?;

        Ok(Self {
            mailbox_id: row.get("mailbox_id")?,
            provider,
            email_address: row.get("email_address")?,
            display_name: row.get("display_name")?,
            is_active: row.get("is_active")?,
            created_at: row.get("created_at")?,
            config: parse_json_value(row.get("config")?),
        })
    }

    pub fn config_string(&self, key: &str) -> Option<String> {
        self.config
            .as_ref()
            .and_then(|config| config.get(key))
            .and_then(|value| value.as_str())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }
}

impl MessageRecord {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            mailbox_id: row.get("mailbox_id")?,
            provider_message_id: row.get("provider_message_id")?,
            sender_address: row.get("sender_address")?,
            sender_name: row.get("sender_name")?,
            subject: row.get("subject")?,
            received_at: timestamp_column(row, "received_at")?,
            stored_at: row.get("stored_at")?,
        })
    }
}

impl AnalysisArtifact {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            message_id: row.get("message_id")?,
            run_id: row.get("run_id")?,
            sender_cluster: row.get("sender_cluster")?,
            subject_cluster: row.get("subject_cluster")?,
            category: row.get("category")?,
            payload: row.get("payload")?,
            created_at: row.get("created_at")?,
        })
    }
}

impl Run {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        let status_raw: String = row.get("status")?;
        let status =
            RunStatus::from_str(&status_raw).map_err(|e| conversion_error(&status_raw, e))?;

        Ok(Self {
            run_id: row.get("run_id")?,
            mailbox_id: row.get("mailbox_id")?,
            window_start: timestamp_column(row, "window_start")?,
            window_end: timestamp_column(row, "window_end")?,
            force: row.get("force_reanalysis")?,
            status,
            items_processed: row.get("items_processed")?,
            error_kind: row.get("error_kind")?,
            error_message: row.get("error_message")?,
            created_at: row.get("created_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
        })
    }
}

impl CoverageInterval {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            mailbox_id: row.get("mailbox_id")?,
            start: timestamp_column(row, "start_at")?,
            end: timestamp_column(row, "end_at")?,
            item_count: row.get("item_count")?,
            processed_at: row.get("processed_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{format_timestamp, parse_timestamp, Provider, RunStatus};

    #[test]
    fn provider_display_and_parse() {
        assert_eq!(Provider::JsonArchive.to_string(), "json_archive");
        assert_eq!(
            "json-archive".parse::<Provider>().expect("parse provider"),
            Provider::JsonArchive
        );
        assert!("yahoo".parse::<Provider>().is_err());
    }

    #[test]
    fn run_status_terminal_set() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Processing.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert_eq!(
            "cancelled".parse::<RunStatus>().expect("parse status"),
            RunStatus::Cancelled
        );
    }

    #[test]
    fn timestamps_normalize_offsets_to_utc() {
        let parsed = parse_timestamp("2024-01-05T02:30:00+02:00").expect("parse offset timestamp");
        assert_eq!(
            parsed,
            Utc.with_ymd_and_hms(2024, 1, 5, 0, 30, 0).single().expect("valid")
        );
        assert_eq!(format_timestamp(parsed), "2024-01-05T00:30:00Z");
        assert_eq!(
            parse_timestamp("2024-01-05T00:30:00Z").expect("parse storage format"),
            parsed
        );
    }
}
