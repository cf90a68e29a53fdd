use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::models::{Mailbox, Provider};
use crate::pipeline::error::ErrorKind;

pub mod gmail_api;
pub mod json_archive;

pub use gmail_api::GmailApiConnector;
pub use json_archive::JsonArchiveConnector;

/// One message as returned by a provider, before it is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedMessage {
    pub provider_message_id: String,
    pub sender_address: String,
    pub sender_name: Option<String>,
    pub subject: String,
    pub received_at: DateTime<Utc>,
    pub thread_id: Option<String>,
    pub snippet: String,
}

/// Connector failures carry their classification from the point of failure.
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("transient provider failure: {0}")]
    Transient(String),

    #[error("provider rejected credentials: {0}")]
    PermanentCredential(String),

    #[error("{0}")]
    Unclassified(String),
}

impl ConnectorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) => ErrorKind::TransientNetwork,
            Self::PermanentCredential(_) => ErrorKind::PermanentCredential,
            Self::Unclassified(_) => ErrorKind::Unclassified,
        }
    }

    /// Network-level reqwest failures are transient; anything that got as far
    /// as decoding a response is not.
    pub fn from_request(context: &str, error: reqwest::Error) -> Self {
        if error.is_timeout() || error.is_connect() || error.is_request() {
            Self::Transient(format!("{context}: {error}"))
        } else {
            Self::Unclassified(format!("{context}: {error}"))
        }
    }
}

#[async_trait(?Send)]
pub trait Connector {
    fn name(&self) -> &str;

    /// Messages received in `[start, end)`.
    async fn fetch_messages(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<FetchedMessage>, ConnectorError>;
}

/// Builds the connector for a mailbox. Runs on the worker thread, so it must
/// be shareable.
pub trait ConnectorFactory: Send + Sync {
    fn connect(&self, mailbox: &Mailbox) -> Result<Box<dyn Connector>, ConnectorError>;
}

/// Dispatches on the mailbox provider.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProviderConnectors;

impl ConnectorFactory for ProviderConnectors {
    fn connect(&self, mailbox: &Mailbox) -> Result<Box<dyn Connector>, ConnectorError> {
        match mailbox.provider {
            Provider::Gmail => Ok(Box::new(GmailApiConnector::for_mailbox(mailbox)?)),
            Provider::JsonArchive => Ok(Box::new(JsonArchiveConnector::for_mailbox(mailbox)?)),
        }
    }
}
