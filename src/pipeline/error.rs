use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analyzer::AnalyzerError;
use crate::connectors::ConnectorError;
use crate::crypto::CryptoError;
use crate::db::models::RunStatus;
use crate::db::DbError;

/// Upper bound for error text persisted on a run.
pub const MAX_ERROR_MESSAGE_BYTES: usize = 500;
const TRUNCATION_MARKER: &str = "…[truncated]";

/// Machine-readable failure class stored in `runs.error_kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientNetwork,
    PermanentCredential,
    DataIntegrity,
    Unclassified,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransientNetwork => "transient_network",
            Self::PermanentCredential => "permanent_credential",
            Self::DataIntegrity => "data_integrity",
            Self::Unclassified => "unclassified",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "transient_network" | "transient" => Ok(Self::TransientNetwork),
            "permanent_credential" => Ok(Self::PermanentCredential),
            "data_integrity" => Ok(Self::DataIntegrity),
            "unclassified" => Ok(Self::Unclassified),
            other => Err(format!("invalid error kind: {other}")),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error("analyzer failed: {0}")]
    Analyzer(#[from] AnalyzerError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error("encryption failed: {0}")]
    Encryption(#[from] CryptoError),

    #[error("invalid window: {0}")]
    InvalidWindow(String),

    #[error("mailbox not found: {0}")]
    MailboxNotFound(String),

    #[error("mailbox {0} is deactivated; re-activate it before analyzing")]
    MailboxInactive(String),

    #[error("run {run_id} left processing while in flight (now {status})")]
    RunInterrupted { run_id: String, status: RunStatus },

    #[error("run worker is not running")]
    WorkerStopped,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connector(error) => error.kind(),
            // Uniqueness conflicts are resolved by re-reading the stored
            // record; a constraint failure that still escapes is not one of
            // those and gets no special class.
            _ => ErrorKind::Unclassified,
        }
    }
}

/// Strips control characters, collapses whitespace and bounds the result to
/// [`MAX_ERROR_MESSAGE_BYTES`] on a char boundary.
pub fn sanitize_error_message(raw: &str) -> String {
    let cleaned = raw
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect::<String>();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");

    if collapsed.len() <= MAX_ERROR_MESSAGE_BYTES {
        return collapsed;
    }

    let mut cut = MAX_ERROR_MESSAGE_BYTES - TRUNCATION_MARKER.len();
    while !collapsed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{TRUNCATION_MARKER}", collapsed[..cut].trim_end())
}
