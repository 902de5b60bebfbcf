//! Messaging-provider HTTP client (spec §6). Treated as a black-box
//! with a handful of methods: fetch inbound messages, send a message,
//! nudge a typing indicator, and mark a conversation read. Retryable
//! statuses get exponential backoff with jitter; everything else is
//! the caller's problem.

use std::time::Duration;

use rand::Rng;
use reqwest::Client;
use reqwest::StatusCode;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

const INBOUND_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_millis(4000);

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("transient provider error after {attempts} attempts: {source}")]
    Transient { attempts: u32, #[source] source: reqwest::Error },
    #[error("provider returned {status}: {body}")]
    Irrecoverable { status: StatusCode, body: String },
    #[error(transparent)]
    Request(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    pub message_handle: String,
    pub content: Option<String>,
    /// String or array of strings per the provider's inconsistent shape (spec §9 open question).
    #[serde(default)]
    pub from_number: Option<serde_json::Value>,
    #[serde(default)]
    pub to_number: Option<serde_json::Value>,
    #[serde(default)]
    pub is_outbound: bool,
    pub media_url: Option<String>,
    pub created_at: Option<String>,
    pub date_sent: Option<String>,
    pub date_updated: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    data: Vec<InboundMessage>,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    number: &'a str,
    from_number: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct SendMessageResponse {
    #[serde(default)]
    message_handle: Option<String>,
    #[serde(default)]
    id: Option<String>,
}

#[derive(Clone)]
pub struct ProviderClient {
    http: Client,
    api_base: String,
    api_key: String,
    api_secret: String,
    from_number: String,
}

impl ProviderClient {
    pub fn new(api_base: String, api_key: String, api_secret: String, from_number: String) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(INBOUND_FETCH_TIMEOUT).build()?;
        Ok(Self { http, api_base, api_key, api_secret, from_number })
    }

    fn with_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.header("X-Api-Key", &self.api_key).header("X-Api-Secret", &self.api_secret)
    }

    /// GET `{apiBase}/v2/messages?limit=100`, filtered to inbound only.
    pub async fn fetch_inbound_messages(&self) -> Result<Vec<InboundMessage>, ProviderError> {
        let url = format!("{}/v2/messages?limit=100", self.api_base);
        let response: MessagesResponse = self
            .retrying(|| self.with_auth(self.http.get(&url)))
            .await?
            .json()
            .await?;
        Ok(response.data.into_iter().filter(|m| !m.is_outbound).collect())
    }

    /// POST `{apiBase}/send-message`.
    pub async fn send_message(&self, number: &str, content: &str) -> Result<String, ProviderError> {
        let url = format!("{}/send-message", self.api_base);
        let body = SendMessageRequest { number, from_number: &self.from_number, content };
        let response: SendMessageResponse = self
            .retrying(|| self.with_auth(self.http.post(&url)).json(&body))
            .await?
            .json()
            .await?;
        Ok(response.message_handle.or(response.id).unwrap_or_default())
    }

    /// POST `{apiBase}/send-typing-indicator`, best-effort. The caller
    /// decides what "failure" means for its own backoff bookkeeping.
    pub async fn send_typing_indicator(&self, number: &str) -> Result<(), reqwest::Error> {
        let url = format!("{}/send-typing-indicator", self.api_base);
        let body = serde_json::json!({ "number": number });
        self.with_auth(self.http.post(&url)).json(&body).send().await?.error_for_status()?;
        Ok(())
    }

    /// POST `{apiBase}/mark-read`, best-effort.
    pub async fn mark_read(&self, message_handle: &str) {
        let url = format!("{}/mark-read", self.api_base);
        let body = serde_json::json!({ "message_handle": message_handle });
        if let Err(error) = self.with_auth(self.http.post(&url)).json(&body).send().await {
            tracing::debug!(%error, "mark-read failed");
        }
    }

    /// Issues a request with retries on 429/502/503/504 and network
    /// errors, using exponential backoff with jitter (spec §4.6.7/§7).
    async fn retrying<F>(&self, build: F) -> Result<reqwest::Response, ProviderError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match build().send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) if is_retryable_status(response.status()) && attempt < MAX_ATTEMPTS => {
                    tokio::time::sleep(backoff_delay(attempt)).await;
                    continue;
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    return Err(ProviderError::Irrecoverable { status, body });
                }
                Err(_) if attempt < MAX_ATTEMPTS => {
                    tokio::time::sleep(backoff_delay(attempt)).await;
                    continue;
                }
                Err(error) => return Err(ProviderError::Transient { attempts: attempt, source: error }),
            }
        }
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 429 | 502 | 503 | 504)
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(1 << (attempt.saturating_sub(1)).min(8));
    let capped = exp.min(BACKOFF_CAP);
    let jitter_ms = rand::rng().random_range(0..=capped.as_millis() as u64 / 4);
    capped + Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses_match_spec_list() {
        for code in [429, 502, 503, 504] {
            assert!(is_retryable_status(StatusCode::from_u16(code).unwrap()));
        }
        assert!(!is_retryable_status(StatusCode::from_u16(404).unwrap()));
        assert!(!is_retryable_status(StatusCode::from_u16(400).unwrap()));
    }

    #[test]
    fn backoff_delay_is_bounded() {
        for attempt in 1..=5 {
            let delay = backoff_delay(attempt);
            assert!(delay >= BACKOFF_BASE);
            assert!(delay <= BACKOFF_CAP + Duration::from_millis(BACKOFF_CAP.as_millis() as u64 / 4));
        }
    }
}
