use std::cell::RefCell;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::connectors::{Connector, ConnectorError, FetchedMessage};
use crate::db::models::Mailbox;

const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const TOKEN_URL_ENV: &str = "MAILMIND_GMAIL_TOKEN_URL";
const API_BASE_ENV: &str = "MAILMIND_GMAIL_API_BASE";
const TOKEN_SKEW_SECONDS: i64 = 60;
const DEFAULT_PAGE_SIZE: usize = 100;
const MAX_RATE_LIMIT_RETRIES: usize = 5;
const MAX_BACKOFF_SECONDS: u64 = 32;
const REDACTED_BODY_MAX_LEN: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GmailEndpoints {
    pub token_url: String,
    pub api_base: String,
}

impl GmailEndpoints {
    pub fn from_env() -> Self {
        Self {
            token_url: env_value(TOKEN_URL_ENV).unwrap_or_else(|| GOOGLE_TOKEN_URL.to_string()),
            api_base: env_value(API_BASE_ENV).unwrap_or_else(|| GMAIL_API_BASE.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GmailCredentials {
    client_id: String,
    client_secret: String,
    refresh_token: String,
}

impl GmailCredentials {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            refresh_token: refresh_token.into(),
        }
    }

    /// Environment first, then the mailbox config.
    pub fn resolve(mailbox: &Mailbox) -> Result<Self, ConnectorError> {
        let lookup = |env: &str, key: &str| {
            env_value(env)
                .or_else(|| mailbox.config_string(key))
                .ok_or_else(|| {
                    ConnectorError::Unclassified(format!(
                        "missing gmail {key} ({env} or mailbox config)"
                    ))
                })
        };

        Ok(Self {
            client_id: lookup("MAILMIND_GMAIL_CLIENT_ID", "client_id")?,
            client_secret: lookup("MAILMIND_GMAIL_CLIENT_SECRET", "client_secret")?,
            refresh_token: lookup("MAILMIND_GMAIL_REFRESH_TOKEN", "refresh_token")?,
        })
    }
}

#[derive(Debug)]
pub struct GmailApiConnector {
    client: Client,
    credentials: GmailCredentials,
    endpoints: GmailEndpoints,
    access_token: RefCell<Option<AccessToken>>,
}

impl GmailApiConnector {
    pub fn new(credentials: GmailCredentials, endpoints: GmailEndpoints) -> Self {
        Self {
            client: Client::new(),
            credentials,
            endpoints,
            access_token: RefCell::new(None),
        }
    }

    pub fn for_mailbox(mailbox: &Mailbox) -> Result<Self, ConnectorError> {
        Ok(Self::new(
            GmailCredentials::resolve(mailbox)?,
            GmailEndpoints::from_env(),
        ))
    }

    async fn access_token(&self) -> Result<String, ConnectorError> {
        if let Some(token) = self
            .access_token
            .borrow()
            .as_ref()
            .filter(|token| !token.is_expired())
        {
            return Ok(token.value.clone());
        }

        let fresh = self.refresh_access_token().await?;
        let value = fresh.value.clone();
        *self.access_token.borrow_mut() = Some(fresh);
        Ok(value)
    }

    async fn refresh_access_token(&self) -> Result<AccessToken, ConnectorError> {
        let token_url = &self.endpoints.token_url;
        let response = self
            .client
            .post(token_url)
            .form(&[
                ("client_id", self.credentials.client_id.as_str()),
                ("client_secret", self.credentials.client_secret.as_str()),
                ("refresh_token", self.credentials.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| ConnectorError::from_request("request gmail oauth token", e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ConnectorError::from_request("read gmail token response", e))?;

        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
            return Err(ConnectorError::PermanentCredential(format!(
                "gmail token refresh rejected: status={} body={}",
                status,
                redact_response_body(&body)
            )));
        }
        if !status.is_success() {
            return Err(classify_status(
                status,
                &format!(
                    "gmail token refresh failed: status={} body={}",
                    status,
                    redact_response_body(&body)
                ),
            ));
        }

        let payload: OAuthTokenResponse = serde_json::from_str(&body).map_err(|e| {
            ConnectorError::Unclassified(format!("decode gmail token response: {e}"))
        })?;
        Ok(AccessToken {
            value: payload.access_token,
            expires_at: Utc::now()
                + Duration::seconds(
                    (payload.expires_in as i64).saturating_sub(TOKEN_SKEW_SECONDS),
                ),
        })
    }

    async fn fetch_with_retry(&self, url: &Url) -> Result<String, ConnectorError> {
        let mut backoff_seconds = 1u64;

        for attempt in 0..=MAX_RATE_LIMIT_RETRIES {
            let token = self.access_token().await?;
            let response = self
                .client
                .get(url.clone())
                .bearer_auth(&token)
                .header("accept", "application/json")
                .send()
                .await
                .map_err(|e| ConnectorError::from_request("gmail api request", e))?;

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                if attempt == MAX_RATE_LIMIT_RETRIES {
                    return Err(ConnectorError::Transient(format!(
                        "gmail api rate limit persisted after {MAX_RATE_LIMIT_RETRIES} retries"
                    )));
                }

                let wait_seconds = response
                    .headers()
                    .get("retry-after")
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.trim().parse::<u64>().ok())
                    .unwrap_or(backoff_seconds)
                    .min(MAX_BACKOFF_SECONDS);
                warn!(
                    attempt = attempt + 1,
                    wait_seconds, "gmail api rate limited; retrying"
                );
                sleep(StdDuration::from_secs(wait_seconds)).await;
                backoff_seconds = (backoff_seconds * 2).min(MAX_BACKOFF_SECONDS);
                continue;
            }

            let body = response
                .text()
                .await
                .map_err(|e| ConnectorError::from_request("read gmail api response", e))?;
            if !status.is_success() {
                return Err(classify_status(
                    status,
                    &format!(
                        "gmail api request failed: status={} body={}",
                        status,
                        redact_response_body(&body)
                    ),
                ));
            }

            return Ok(body);
        }

        Err(ConnectorError::Transient(
            "gmail api request failed without response".to_string(),
        ))
    }

    fn endpoint(&self, path: &str, query: &[(&str, String)]) -> Result<Url, ConnectorError> {
        let base = self.endpoints.api_base.trim_end_matches('/');
        Url::parse_with_params(&format!("{base}{path}"), query)
            .map_err(|e| ConnectorError::Unclassified(format!("invalid gmail api url: {e}")))
    }

    async fn list_message_ids(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<String>, ConnectorError> {
        let search = window_query(start, end);
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("q", search.clone()),
                ("maxResults", DEFAULT_PAGE_SIZE.to_string()),
            ];
            if let Some(token) = page_token.as_ref() {
                query.push(("pageToken", token.clone()));
            }
            let url = self.endpoint("/users/me/messages", &query)?;
            let body = self.fetch_with_retry(&url).await?;
            let page: GmailMessageList = serde_json::from_str(&body).map_err(|e| {
                ConnectorError::Unclassified(format!("decode gmail message list: {e}"))
            })?;

            ids.extend(page.messages.unwrap_or_default().into_iter().map(|m| m.id));
            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        Ok(ids)
    }

    async fn get_message(&self, message_id: &str) -> Result<GmailMessage, ConnectorError> {
        let url = self.endpoint(
            &format!("/users/me/messages/{message_id}"),
            &[
                ("format", "metadata".to_string()),
                ("metadataHeaders", "From".to_string()),
                ("metadataHeaders", "Subject".to_string()),
            ],
        )?;
        let body = self.fetch_with_retry(&url).await?;
        serde_json::from_str(&body)
            .map_err(|e| ConnectorError::Unclassified(format!("decode gmail message: {e}")))
    }
}

#[async_trait(?Send)]
impl Connector for GmailApiConnector {
    fn name(&self) -> &str {
        "gmail_api"
    }

    async fn fetch_messages(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<FetchedMessage>, ConnectorError> {
        let ids = self.list_message_ids(start, end).await?;
        debug!(count = ids.len(), "gmail listed message ids");

        let mut messages = Vec::with_capacity(ids.len());
        for id in ids {
            let message = self.get_message(&id).await?;
            match map_gmail_message(&message) {
                Some(fetched) if fetched.received_at >= start && fetched.received_at < end => {
                    messages.push(fetched);
                }
                Some(_) => {}
                None => warn!(message_id = %id, "gmail message missing internalDate; skipped"),
            }
        }

        messages.sort_by(|a, b| a.received_at.cmp(&b.received_at));
        Ok(messages)
    }
}

/// `after:` and `before:` take epoch seconds; results are still filtered on
/// `internalDate` so the window stays half-open.
fn window_query(start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    format!("after:{} before:{}", start.timestamp() - 1, end.timestamp())
}

fn classify_status(status: StatusCode, message: &str) -> ConnectorError {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        ConnectorError::Transient(message.to_string())
    } else if status == StatusCode::UNAUTHORIZED {
        ConnectorError::PermanentCredential(message.to_string())
    } else {
        ConnectorError::Unclassified(message.to_string())
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn redact_response_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= REDACTED_BODY_MAX_LEN {
        return trimmed.to_string();
    }
    let mut cut = REDACTED_BODY_MAX_LEN;
    while !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…[truncated {} bytes]", &trimmed[..cut], trimmed.len())
}

fn map_gmail_message(message: &GmailMessage) -> Option<FetchedMessage> {
    let received_at = message
        .internal_date
        .as_deref()
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())?;

    let (sender_name, sender_address) = parse_from_header(extract_header(message, "From").as_deref());

    Some(FetchedMessage {
        provider_message_id: message.id.clone(),
        sender_address: sender_address
            .map(|address| address.to_ascii_lowercase())
            .unwrap_or_default(),
        sender_name,
        subject: extract_header(message, "Subject").unwrap_or_default(),
        received_at,
        thread_id: message.thread_id.clone(),
        snippet: message
            .snippet
            .as_deref()
            .map(html_entity_decode)
            .unwrap_or_default(),
    })
}

fn extract_header(message: &GmailMessage, name: &str) -> Option<String> {
    message
        .payload
        .as_ref()?
        .headers
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|header| header.name.eq_ignore_ascii_case(name))
        .map(|header| header.value.trim().to_string())
}

fn parse_from_header(raw: Option<&str>) -> (Option<String>, Option<String>) {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return (None, None);
    };

    // "Display Name <email@example.com>"
    if let (Some(open), Some(close)) = (raw.rfind('<'), raw.rfind('>')) {
        if open < close {
            let address = raw[open + 1..close].trim();
            let name = raw[..open].trim().trim_matches('"').trim();
            return (
                (!name.is_empty()).then(|| name.to_string()),
                (!address.is_empty()).then(|| address.to_string()),
            );
        }
    }

    if raw.contains('@') {
        return (None, Some(raw.to_string()));
    }
    (Some(raw.to_string()), None)
}

fn html_entity_decode(s: &str) -> String {
    s.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
}

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: DateTime<Utc>,
}

impl AccessToken {
    fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

#[derive(Debug, Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct GmailMessageList {
    messages: Option<Vec<GmailMessageStub>>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GmailMessageStub {
    id: String,
}

#[derive(Debug, Deserialize)]
struct GmailMessage {
    id: String,
    #[serde(rename = "threadId")]
    thread_id: Option<String>,
    snippet: Option<String>,
    payload: Option<GmailPayload>,
    #[serde(rename = "internalDate")]
    internal_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GmailPayload {
    headers: Option<Vec<GmailHeader>>,
}

#[derive(Debug, Deserialize)]
struct GmailHeader {
    name: String,
    value: String,
}
