//! Torn API client: rate-limit-aware fetch with bounded retries.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use tdh_core::AttackRecord;
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "tdh-api";

pub const DEFAULT_BASE_URL: &str = "https://api.torn.com";

/// Wait applied to a 429 that carries no `Retry-After` header.
pub const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("max retries exceeded fetching {url}")]
    MaxRetriesExceeded { url: String },
    #[error("decoding response body: {0}")]
    Decode(#[source] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// What to do with a completed HTTP response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseAction {
    /// 200: parse the body and return.
    Success,
    /// 429: wait the given duration and retry. Rate-limit waits never consume
    /// a retry-budget slot; the server has told us when success is possible.
    RateLimited(Duration),
    /// Any other status: consume one retry slot and try again per policy.
    RetryLater,
}

pub fn classify_response(
    status: StatusCode,
    headers: &HeaderMap,
    default_rate_limit_wait: Duration,
) -> ResponseAction {
    if status == StatusCode::OK {
        ResponseAction::Success
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ResponseAction::RateLimited(retry_after_delay(headers, default_rate_limit_wait))
    } else {
        ResponseAction::RetryLater
    }
}

/// Reads a `Retry-After` seconds value, falling back to `default` when the
/// header is absent or unparseable.
pub fn retry_after_delay(headers: &HeaderMap, default: Duration) -> Duration {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

/// Retry policy for the paginated attack-log path: a fixed cooldown between
/// attempts rather than exponential growth.
#[derive(Debug, Clone, Copy)]
pub struct PaginatedRetryPolicy {
    pub max_retries: usize,
    pub retry_cooldown: Duration,
}

impl Default for PaginatedRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_cooldown: Duration::from_secs(60),
        }
    }
}

/// Retry policy for the single-record path: exponential backoff, doubling
/// from `base_delay` and capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy)]
enum RetrySchedule {
    FixedCooldown(PaginatedRetryPolicy),
    Exponential(BackoffPolicy),
}

impl RetrySchedule {
    fn max_retries(&self) -> usize {
        match self {
            Self::FixedCooldown(p) => p.max_retries,
            Self::Exponential(p) => p.max_retries,
        }
    }

    fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        match self {
            Self::FixedCooldown(p) => p.retry_cooldown,
            Self::Exponential(p) => p.delay_for_attempt(attempt_index),
        }
    }
}

/// Endpoint and key material for one run. The key is carried opaquely and
/// appended as a query parameter, exactly as the remote API expects.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub api_key: String,
}

impl ApiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn faction_attacks_url(&self, faction_id: i64, from: Option<i64>) -> String {
        let mut url = format!(
            "{}/faction/{}?selections=attacks&key={}",
            self.base_url, faction_id, self.api_key
        );
        if let Some(from) = from {
            url.push_str(&format!("&from={from}"));
        }
        url
    }

    pub fn user_basic_url(&self, user_id: Option<i64>) -> String {
        match user_id {
            Some(id) => format!(
                "{}/user/{}?selections=basic&key={}",
                self.base_url, id, self.api_key
            ),
            None => format!("{}/user?selections=basic&key={}", self.base_url, self.api_key),
        }
    }
}

/// Success body of the user basic selection.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserBasic {
    pub player_id: i64,
    pub name: String,
    pub level: i64,
    pub status: Value,
}

/// Extracts the attack collection from a success body. The API keys records
/// by an internal id we do not interpret; the page is an unordered set.
pub fn parse_attack_page(body: &Value) -> Result<Vec<AttackRecord>, serde_json::Error> {
    let Some(attacks) = body.get("attacks").and_then(Value::as_object) else {
        return Ok(Vec::new());
    };
    attacks
        .values()
        .cloned()
        .map(serde_json::from_value)
        .collect()
}

#[derive(Debug)]
pub struct TornClient {
    http: reqwest::Client,
    config: ApiConfig,
    paginated_retry: PaginatedRetryPolicy,
    backoff: BackoffPolicy,
    rate_limit_wait: Duration,
}

impl TornClient {
    pub fn new(config: ApiConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(Duration::from_secs(20))
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            http,
            config,
            paginated_retry: PaginatedRetryPolicy::default(),
            backoff: BackoffPolicy::default(),
            rate_limit_wait: DEFAULT_RATE_LIMIT_WAIT,
        })
    }

    pub fn with_policies(
        mut self,
        paginated_retry: PaginatedRetryPolicy,
        backoff: BackoffPolicy,
    ) -> Self {
        self.paginated_retry = paginated_retry;
        self.backoff = backoff;
        self
    }

    /// One page of the faction attack log, unordered. `from` is the inclusive
    /// lower bound; omitting it yields the newest records (the exploratory
    /// call).
    pub async fn fetch_attack_page(
        &self,
        faction_id: i64,
        from: Option<i64>,
    ) -> Result<Vec<AttackRecord>, FetchError> {
        let url = self.config.faction_attacks_url(faction_id, from);
        let body = self
            .get_with_retry(&url, RetrySchedule::FixedCooldown(self.paginated_retry))
            .await?;
        parse_attack_page(&body).map_err(FetchError::Decode)
    }

    pub async fn fetch_user_basic(
        &self,
        user_id: Option<i64>,
    ) -> Result<UserBasic, FetchError> {
        let url = self.config.user_basic_url(user_id);
        let body = self
            .get_with_retry(&url, RetrySchedule::Exponential(self.backoff))
            .await?;
        serde_json::from_value(body).map_err(FetchError::Decode)
    }

    async fn get_with_retry(
        &self,
        url: &str,
        schedule: RetrySchedule,
    ) -> Result<Value, FetchError> {
        let mut attempt = 0usize;
        while attempt < schedule.max_retries() {
            match self.http.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    match classify_response(status, resp.headers(), self.rate_limit_wait) {
                        ResponseAction::Success => {
                            let body = resp.json::<Value>().await?;
                            info!(attempt = attempt + 1, "fetch succeeded");
                            return Ok(body);
                        }
                        ResponseAction::RateLimited(wait) => {
                            warn!(wait_secs = wait.as_secs(), "rate limited, waiting");
                            tokio::time::sleep(wait).await;
                            // Budget deliberately untouched.
                        }
                        ResponseAction::RetryLater => {
                            warn!(
                                attempt = attempt + 1,
                                status = status.as_u16(),
                                "fetch failed"
                            );
                            attempt += 1;
                            if attempt < schedule.max_retries() {
                                tokio::time::sleep(schedule.delay_for_attempt(attempt - 1))
                                    .await;
                            }
                        }
                    }
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable {
                        return Err(FetchError::Request(err));
                    }
                    warn!(attempt = attempt + 1, error = %err, "request error");
                    attempt += 1;
                    if attempt < schedule.max_retries() {
                        tokio::time::sleep(schedule.delay_for_attempt(attempt - 1)).await;
                    }
                }
            }
        }
        Err(FetchError::MaxRetriesExceeded {
            url: url.to_string(),
        })
    }
}

/// Page source seam the ingestion loop is written against; production code
/// binds it to a [`TornClient`] and a faction id, tests script it.
#[async_trait]
pub trait AttackSource: Send + Sync {
    async fn fetch_page(&self, from: Option<i64>) -> Result<Vec<AttackRecord>, FetchError>;
}

#[derive(Debug)]
pub struct FactionAttackSource {
    client: TornClient,
    faction_id: i64,
}

impl FactionAttackSource {
    pub fn new(client: TornClient, faction_id: i64) -> Self {
        Self { client, faction_id }
    }
}

#[async_trait]
impl AttackSource for FactionAttackSource {
    async fn fetch_page(&self, from: Option<i64>) -> Result<Vec<AttackRecord>, FetchError> {
        self.client.fetch_attack_page(self.faction_id, from).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves the given raw HTTP responses one connection at a time.
    async fn scripted_server(responses: Vec<String>) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            for response in responses {
                let (mut socket, _) = listener.accept().await.expect("accept");
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                socket.write_all(response.as_bytes()).await.expect("write");
                let _ = socket.shutdown().await;
            }
        });
        addr
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(3));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(3));
    }

    #[test]
    fn rate_limit_uses_server_supplied_wait() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("5"));
        let action = classify_response(
            StatusCode::TOO_MANY_REQUESTS,
            &headers,
            DEFAULT_RATE_LIMIT_WAIT,
        );
        assert_eq!(action, ResponseAction::RateLimited(Duration::from_secs(5)));
    }

    #[test]
    fn rate_limit_without_header_uses_default() {
        let headers = HeaderMap::new();
        let action =
            classify_response(StatusCode::TOO_MANY_REQUESTS, &headers, DEFAULT_RATE_LIMIT_WAIT);
        assert_eq!(action, ResponseAction::RateLimited(DEFAULT_RATE_LIMIT_WAIT));
    }

    #[tokio::test]
    async fn rate_limited_attempts_are_exempt_from_the_retry_budget() {
        let rate_limited = "HTTP/1.1 429 Too Many Requests\r\nRetry-After: 0\r\n\
                            Content-Length: 0\r\nConnection: close\r\n\r\n"
            .to_string();
        let body =
            r#"{"attacks":{"1":{"timestamp_started":150,"attacker_id":7,"defender_id":9}}}"#;
        let success = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\
             Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        // Four rate-limit responses against a budget of three: the success
        // is only reachable because 429s leave the budget untouched.
        let addr = scripted_server(vec![
            rate_limited.clone(),
            rate_limited.clone(),
            rate_limited.clone(),
            rate_limited,
            success,
        ])
        .await;

        let config = ApiConfig::new("k").with_base_url(format!("http://{addr}"));
        let client = TornClient::new(config).expect("client").with_policies(
            PaginatedRetryPolicy {
                max_retries: 3,
                retry_cooldown: Duration::ZERO,
            },
            BackoffPolicy::default(),
        );

        let page = client
            .fetch_attack_page(42, None)
            .await
            .expect("succeeds once the rate limit lifts");
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].natural_key().derived_id(), "150_7_9");
    }

    #[test]
    fn server_errors_consume_the_retry_budget() {
        let headers = HeaderMap::new();
        assert_eq!(
            classify_response(StatusCode::INTERNAL_SERVER_ERROR, &headers, DEFAULT_RATE_LIMIT_WAIT),
            ResponseAction::RetryLater
        );
        assert_eq!(
            classify_response(StatusCode::OK, &headers, DEFAULT_RATE_LIMIT_WAIT),
            ResponseAction::Success
        );
    }

    #[test]
    fn attack_page_is_extracted_from_keyed_collection() {
        let body = json!({
            "attacks": {
                "9001": {
                    "timestamp_started": 150,
                    "attacker_id": 7,
                    "defender_id": 9,
                    "respect_gain": 4.2
                }
            }
        });
        let page = parse_attack_page(&body).expect("parse");
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].timestamp_started, 150);
        assert_eq!(page[0].attacker_id, 7);
        assert_eq!(page[0].defender_id, 9);
        assert_eq!(page[0].extra.get("respect_gain"), Some(&json!(4.2)));
    }

    #[test]
    fn empty_body_yields_empty_page() {
        assert!(parse_attack_page(&json!({})).expect("parse").is_empty());
    }

    #[test]
    fn urls_carry_selection_key_and_optional_from() {
        let config = ApiConfig::new("abc123");
        assert_eq!(
            config.faction_attacks_url(42, None),
            "https://api.torn.com/faction/42?selections=attacks&key=abc123"
        );
        assert_eq!(
            config.faction_attacks_url(42, Some(100)),
            "https://api.torn.com/faction/42?selections=attacks&key=abc123&from=100"
        );
        assert_eq!(
            config.user_basic_url(Some(7)),
            "https://api.torn.com/user/7?selections=basic&key=abc123"
        );
        assert_eq!(
            config.user_basic_url(None),
            "https://api.torn.com/user?selections=basic&key=abc123"
        );
    }

    #[test]
    fn user_basic_body_decodes() {
        let body = json!({
            "player_id": 7,
            "name": "Duke",
            "level": 15,
            "status": {"state": "Okay", "description": "Okay"}
        });
        let user: UserBasic = serde_json::from_value(body).expect("decode");
        assert_eq!(user.player_id, 7);
        assert_eq!(user.name, "Duke");
        assert_eq!(user.level, 15);
    }
}
