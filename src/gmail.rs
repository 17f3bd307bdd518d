use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::config::AppConfig;
use crate::error::SyncError;
use crate::session::Session;

/// Upper bound (exclusive) of the random extra wait added to each backoff.
const JITTER_MS: u64 = 500;

/// One page of message ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessagePage {
    pub ids: Vec<String>,
    pub next_page_token: Option<String>,
}

/// The two facts the treemap needs from a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMetadata {
    pub from_header: String,
    pub is_unread: bool,
}

/// Remote mailbox contract.
///
/// Implementations raise [`SyncError::AuthExpired`] on rejected credentials
/// and absorb rate limiting internally, surfacing [`SyncError::Transport`]
/// only once retries are exhausted.
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn list_message_ids(&self, page_token: Option<&str>) -> Result<MessagePage, SyncError>;

    /// `Ok(None)` when the message has no usable `From` header.
    async fn get_message_metadata(&self, id: &str) -> Result<Option<MessageMetadata>, SyncError>;
}

// ---------------------------------------------------------------------------
// Gmail REST client
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageResponse {
    #[serde(default)]
    label_ids: Vec<String>,
    payload: Option<Payload>,
}

#[derive(Debug, Deserialize)]
struct Payload {
    #[serde(default)]
    headers: Vec<Header>,
}

#[derive(Debug, Deserialize)]
struct Header {
    name: String,
    value: String,
}

/// Gmail API client bound to one signed-in [`Session`].
pub struct GmailClient {
    http: reqwest::Client,
    session: Session,
    api_base: String,
    label: String,
    page_size: u32,
    max_retries: u32,
}

impl std::fmt::Debug for GmailClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GmailClient")
            .field("session", &self.session)
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

impl GmailClient {
    pub fn new(http: reqwest::Client, session: Session, config: &AppConfig) -> Self {
        Self {
            http,
            session,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            label: config.label.clone(),
            page_size: config.page_size,
            max_retries: config.max_retries,
        }
    }

    /// GET with bearer auth, retrying HTTP 429 with exponential backoff.
    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, SyncError> {
        for attempt in 0..=self.max_retries {
            let res = self
                .http
                .get(url)
                .query(query)
                .header(reqwest::header::AUTHORIZATION, self.session.bearer())
                .send()
                .await?;

            let status = res.status();
            if status.is_success() {
                return res
                    .json::<T>()
                    .await
                    .map_err(|e| SyncError::Transport(format!("Gmail API decode error: {e}")));
            }
            if status == StatusCode::TOO_MANY_REQUESTS && attempt < self.max_retries {
                let jitter = rand::thread_rng().gen_range(0..JITTER_MS);
                let delay = backoff_delay(attempt, jitter);
                log::warn!("Gmail rate limited, retrying in {:?} (attempt {})", delay, attempt + 1);
                tokio::time::sleep(delay).await;
                continue;
            }
            return Err(status_error(status));
        }
        Err(SyncError::Transport("Max retries exceeded".into()))
    }
}

#[async_trait]
impl MessageSource for GmailClient {
    async fn list_message_ids(&self, page_token: Option<&str>) -> Result<MessagePage, SyncError> {
        let url = format!("{}/messages", self.api_base);
        let mut query = vec![
            ("maxResults", self.page_size.to_string()),
            ("labelIds", self.label.clone()),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }
        let page: ListResponse = self.get_json(&url, &query).await?;
        Ok(MessagePage {
            ids: page.messages.into_iter().map(|m| m.id).collect(),
            next_page_token: page.next_page_token.filter(|t| !t.is_empty()),
        })
    }

    async fn get_message_metadata(&self, id: &str) -> Result<Option<MessageMetadata>, SyncError> {
        let url = format!("{}/messages/{}", self.api_base, id);
        let query = [
            ("format", "metadata".to_string()),
            ("metadataHeaders", "From".to_string()),
        ];
        let msg: MessageResponse = self.get_json(&url, &query).await?;
        Ok(metadata_from_response(msg))
    }
}

fn metadata_from_response(msg: MessageResponse) -> Option<MessageMetadata> {
    let from = msg
        .payload?
        .headers
        .into_iter()
        .find(|h| h.name.eq_ignore_ascii_case("from"))?;
    Some(MessageMetadata {
        from_header: from.value,
        is_unread: msg.label_ids.iter().any(|l| l == "UNREAD"),
    })
}

fn status_error(status: StatusCode) -> SyncError {
    if status == StatusCode::UNAUTHORIZED {
        SyncError::AuthExpired
    } else {
        SyncError::Transport(format!("Gmail API error: {}", status.as_u16()))
    }
}

/// `2^attempt` seconds plus `jitter_ms`.
pub fn backoff_delay(attempt: u32, jitter_ms: u64) -> Duration {
    let base = 1000u64.saturating_mul(1u64 << attempt.min(16));
    Duration::from_millis(base + jitter_ms)
}

/// Split a `From` header into `(address, display name)`.
///
/// `"Jane Doe" <jane@x.com>` → `("jane@x.com", "Jane Doe")`; a bare address
/// doubles as its own name. `None` when no address can be found.
pub fn parse_from_header(raw: &str) -> Option<(String, String)> {
    if let Some(open) = raw.find('<') {
        if let Some(len) = raw[open + 1..].find('>').filter(|&len| len > 0) {
            let email = raw[open + 1..open + 1 + len].trim().to_string();
            let quoted = raw[..open].trim();
            let name = quoted
                .strip_prefix(['"', '\''])
                .unwrap_or(quoted);
            let name = name.strip_suffix(['"', '\'']).unwrap_or(name).trim();
            if email.is_empty() {
                return None;
            }
            let name = if name.is_empty() { email.clone() } else { name.to_string() };
            return Some((email, name));
        }
    }

    let email = raw.trim();
    if email.is_empty() {
        return None;
    }
    Some((email.to_string(), email.to_string()))
}
