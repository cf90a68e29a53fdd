use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::connectors::{Connector, ConnectorError, FetchedMessage};
use crate::db::models::{parse_timestamp, Mailbox};

const SNIPPET_MAX_CHARS: usize = 200;

/// Offline connector over exported message files: one JSON object per file,
/// Graph or Gmail-export style keys.
#[derive(Debug, Clone)]
pub struct JsonArchiveConnector {
    path: PathBuf,
}

impl JsonArchiveConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn for_mailbox(mailbox: &Mailbox) -> Result<Self, ConnectorError> {
        mailbox
            .config_string("path")
            .map(Self::new)
            .ok_or_else(|| {
                ConnectorError::Unclassified(format!(
                    "json archive mailbox {} has no config.path",
                    mailbox.mailbox_id
                ))
            })
    }
}

#[async_trait(?Send)]
impl Connector for JsonArchiveConnector {
    fn name(&self) -> &str {
        "json_archive"
    }

    async fn fetch_messages(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<FetchedMessage>, ConnectorError> {
        let files = collect_json_files(&self.path)?;
        let mut messages = Vec::new();

        for file_path in files {
            match read_archive_file(&file_path) {
                Ok(message) => {
                    if message.received_at >= start && message.received_at < end {
                        messages.push(message);
                    }
                }
                Err(error) => warn!(file = %file_path.display(), "skipping archive file: {error}"),
            }
        }

        messages.sort_by(|a, b| {
            a.received_at
                .cmp(&b.received_at)
                .then_with(|| a.provider_message_id.cmp(&b.provider_message_id))
        });
        debug!(
            path = %self.path.display(),
            count = messages.len(),
            "json archive messages in window"
        );
        Ok(messages)
    }
}

fn collect_json_files(path: &Path) -> Result<Vec<PathBuf>, ConnectorError> {
    if path.is_file() {
        if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
            return Ok(vec![path.to_path_buf()]);
        }
        return Err(ConnectorError::Unclassified(format!(
            "expected .json file, got {}",
            path.display()
        )));
    }

    if !path.is_dir() {
        return Err(ConnectorError::Unclassified(format!(
            "archive path does not exist or is not a file/directory: {}",
            path.display()
        )));
    }

    let entries = std::fs::read_dir(path).map_err(|e| {
        ConnectorError::Unclassified(format!("read archive directory {}: {e}", path.display()))
    })?;
    let mut files = Vec::new();
    for entry in entries {
        let entry_path = entry
            .map_err(|e| ConnectorError::Unclassified(format!("read archive entry: {e}")))?
            .path();
        if entry_path.is_file()
            && entry_path.extension().and_then(|ext| ext.to_str()) == Some("json")
        {
            files.push(entry_path);
        }
    }

    files.sort();
    Ok(files)
}

fn read_archive_file(file_path: &Path) -> Result<FetchedMessage, String> {
    let raw = std::fs::read_to_string(file_path).map_err(|e| format!("read: {e}"))?;
    let payload: Value = serde_json::from_str(&raw).map_err(|e| format!("parse: {e}"))?;
    map_archive_payload(&payload)
}

fn map_archive_payload(payload: &Value) -> Result<FetchedMessage, String> {
    let record = payload.get("email").unwrap_or(payload);

    let provider_message_id = get_str(record, &["id"])
        .or_else(|| get_str(payload, &["id", "graph_id", "message_id"]))
        .ok_or_else(|| "missing id".to_string())?;

    let received_raw = get_str(record, &["receivedDateTime", "received_at", "date"])
        .or_else(|| get_str(payload, &["receivedDateTime", "received_at"]))
        .or_else(|| get_str(record, &["sentDateTime"]))
        .ok_or_else(|| format!("message {provider_message_id} has no received timestamp"))?;
    let received_at = parse_timestamp(&received_raw)?;

    let headers = field(record, payload, &["headers"]);
    let (sender_name, mut sender_address) =
        parse_contact(field(record, payload, &["from", "sender"])).unwrap_or((None, None));
    if sender_address.is_none() {
        sender_address = header_value(headers, &["From", "from"])
            .and_then(|header| parse_first_email_from_header(&header));
    }

    let subject = get_str(record, &["subject"])
        .or_else(|| get_str(payload, &["subject"]))
        .or_else(|| header_value(headers, &["Subject", "subject"]))
        .unwrap_or_default();

    let thread_id = get_str(record, &["conversationId", "threadId", "thread_id"])
        .or_else(|| get_str(payload, &["conversationId", "threadId"]));

    Ok(FetchedMessage {
        provider_message_id,
        sender_address: sender_address.unwrap_or_default(),
        sender_name,
        subject,
        received_at,
        thread_id,
        snippet: snippet(record, payload),
    })
}

fn snippet(record: &Value, payload: &Value) -> String {
    let text = get_str(record, &["bodyPreview", "snippet"])
        .or_else(|| get_str(payload, &["bodyPreview", "snippet"]))
        .or_else(|| match field(record, payload, &["body"]) {
            Some(Value::Object(body)) => {
                let content = body.get("content").and_then(Value::as_str)?;
                let is_html = body
                    .get("contentType")
                    .and_then(Value::as_str)
                    .map(|kind| kind.eq_ignore_ascii_case("html"))
                    .unwrap_or_else(|| looks_like_html(content));
                Some(if is_html {
                    html_to_text(content)
                } else {
                    content.to_string()
                })
            }
            Some(Value::String(content)) if looks_like_html(content) => Some(html_to_text(content)),
            Some(Value::String(content)) => Some(content.clone()),
            _ => None,
        })
        .unwrap_or_default();

    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(SNIPPET_MAX_CHARS).collect()
}

fn field<'a>(record: &'a Value, payload: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .find_map(|key| record.get(*key))
        .or_else(|| keys.iter().find_map(|key| payload.get(*key)))
}

fn get_str(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| value.get(*key))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn parse_contact(value: Option<&Value>) -> Option<(Option<String>, Option<String>)> {
    let value = value?;
    if let Some(raw) = value.as_str() {
        return Some((None, parse_first_email_from_header(raw)));
    }

    let nested = value.get("emailAddress");
    let name = value
        .get("name")
        .or_else(|| nested.and_then(|n| n.get("name")))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string);
    let address = value
        .get("address")
        .or_else(|| value.get("email"))
        .or_else(|| nested.and_then(|n| n.get("address")))
        .and_then(Value::as_str)
        .map(|address| address.trim().to_ascii_lowercase());

    if name.is_none() && address.is_none() {
        return None;
    }
    Some((name, address))
}

fn header_value(headers: Option<&Value>, keys: &[&str]) -> Option<String> {
    let headers = headers?.as_object()?;
    headers
        .iter()
        .filter(|(name, _)| keys.iter().any(|wanted| name.eq_ignore_ascii_case(wanted)))
        .filter_map(|(_, value)| value.as_str())
        .map(str::trim)
        .find(|value| !value.is_empty())
        .map(str::to_string)
}

fn html_to_text(html: &str) -> String {
    html2text::from_read(html.as_bytes(), 120).trim().to_string()
}

fn looks_like_html(value: &str) -> bool {
    value.contains("<html") || value.contains("<body") || value.contains("</")
}

fn parse_first_email_from_header(value: &str) -> Option<String> {
    let email_pattern = Regex::new(r"(?i)<([^>]+@[^>]+)>").expect("compile email header regex");
    if let Some(captures) = email_pattern.captures(value) {
        return captures
            .get(1)
            .map(|capture| capture.as_str().trim().to_ascii_lowercase());
    }

    let fallback = value.trim().trim_matches('"').to_ascii_lowercase();
    fallback.contains('@').then_some(fallback)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;
    use uuid::Uuid;

    use super::{map_archive_payload, JsonArchiveConnector};
    use crate::connectors::{Connector, ConnectorError};

    fn temp_root() -> PathBuf {
        let root =
            std::env::temp_dir().join(format!("mailmind-json-archive-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&root).expect("create temp root");
        root
    }

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0)
            .single()
            .expect("valid date")
    }

    #[test]
    fn graph_style_payload_maps_sender_and_thread() {
        let payload = json!({
            "id": "msg-1",
            "subject": "Kickoff",
            "receivedDateTime": "2024-01-03T10:00:00Z",
            "conversationId": "conv-7",
            "from": { "emailAddress": { "name": "Alice", "address": "Alice@Example.com" } },
            "bodyPreview": "Kickoff   preview"
        });

        let message = map_archive_payload(&payload).expect("map payload");
        assert_eq!(message.provider_message_id, "msg-1");
        assert_eq!(message.sender_address, "alice@example.com");
        assert_eq!(message.sender_name.as_deref(), Some("Alice"));
        assert_eq!(message.thread_id.as_deref(), Some("conv-7"));
        assert_eq!(message.snippet, "Kickoff preview");
    }

    #[test]
    fn header_sender_and_html_body_fallbacks() {
        let payload = json!({
            "id": "msg-2",
            "receivedDateTime": "2024-01-03T10:00:00+02:00",
            "headers": { "From": "Bob <BOB@example.com>", "Subject": "Invoice" },
            "body": { "contentType": "html", "content": "<p>Total <b>due</b></p>" }
        });

        let message = map_archive_payload(&payload).expect("map payload");
        assert_eq!(message.sender_address, "bob@example.com");
        assert_eq!(message.subject, "Invoice");
        assert!(message.snippet.contains("Total"));
        assert_eq!(message.received_at.to_rfc3339(), "2024-01-03T08:00:00+00:00");
    }

    #[test]
    fn payload_without_timestamp_is_rejected() {
        assert!(map_archive_payload(&json!({ "id": "msg-3" })).is_err());
    }

    #[tokio::test]
    async fn fetch_filters_window_and_skips_broken_files() {
        let root = temp_root();
        for (name, id, received) in [
            ("a.json", "msg-a", "2024-01-02T09:00:00Z"),
            ("b.json", "msg-b", "2024-01-05T00:00:00Z"),
            ("c.json", "msg-c", "2024-01-04T23:59:59Z"),
        ] {
            let payload = json!({
                "id": id,
                "subject": format!("subject {id}"),
                "receivedDateTime": received,
                "from": { "address": "sender@example.com" }
            });
            std::fs::write(root.join(name), payload.to_string()).expect("write archive file");
        }
        std::fs::write(root.join("broken.json"), "{ not json").expect("write broken file");
        std::fs::write(root.join("notes.txt"), "ignored").expect("write other file");

        let connector = JsonArchiveConnector::new(&root);
        let messages = connector
            .fetch_messages(day(2), day(5))
            .await
            .expect("fetch archive");
        let ids = messages
            .iter()
            .map(|m| m.provider_message_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["msg-a", "msg-c"]);

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn missing_archive_path_is_unclassified() {
        let connector = JsonArchiveConnector::new("/nonexistent/mailmind-archive");
        assert!(matches!(
            connector.fetch_messages(day(1), day(2)).await,
            Err(ConnectorError::Unclassified(_))
        ));
    }
}
