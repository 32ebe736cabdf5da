//! JSON-over-HTTP client with bounded retries for external APIs.

use std::time::Duration;

use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

const ERROR_DETAIL_LIMIT: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Whether repeating a request can duplicate its effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Idempotent,
    NonIdempotent,
}

pub fn classify_status(kind: RequestKind, status: StatusCode) -> RetryDisposition {
    let retry = match kind {
        RequestKind::Idempotent => {
            status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
        }
        RequestKind::NonIdempotent => status == StatusCode::TOO_MANY_REQUESTS,
    };
    if retry {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(kind: RequestKind, err: &reqwest::Error) -> RetryDisposition {
    let retry = match kind {
        RequestKind::Idempotent => err.is_timeout() || err.is_connect() || err.is_request(),
        // the request may have reached the server; only a failed connect is safe
        RequestKind::NonIdempotent => err.is_connect(),
    };
    if retry {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

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
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: Some(concat!("jobmail/", env!("CARGO_PKG_VERSION")).to_string()),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url} :: {detail}")]
    Status { status: u16, url: String, detail: String },
    #[error("invalid JSON from {url}: {message}")]
    Decode { url: String, message: String },
}

fn truncate_detail(mut detail: String) -> String {
    if detail.len() > ERROR_DETAIL_LIMIT {
        let mut cut = ERROR_DETAIL_LIMIT;
        while !detail.is_char_boundary(cut) {
            cut -= 1;
        }
        detail.truncate(cut);
    }
    detail
}

#[derive(Debug, Clone)]
pub struct RetryingClient {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl RetryingClient {
    pub fn new(config: &HttpClientConfig) -> Result<Self, HttpError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            backoff: config.backoff,
        })
    }

    /// Sends the request built by `build`, rebuilding it for each retry.
    /// Non-success statuses become [`HttpError::Status`] carrying the body text.
    pub async fn send<F>(&self, kind: RequestKind, build: F) -> Result<reqwest::Response, HttpError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let mut attempt = 0usize;
        loop {
            match build(&self.client).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }

                    let url = resp.url().to_string();
                    if classify_status(kind, status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(%url, status = status.as_u16(), attempt, "retrying http request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    let detail = resp.text().await.unwrap_or_default();
                    return Err(HttpError::Status {
                        status: status.as_u16(),
                        url,
                        detail: truncate_detail(detail),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(kind, &err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "retrying http request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(HttpError::Request(err));
                }
            }
        }
    }

    pub async fn send_json<F>(&self, kind: RequestKind, build: F) -> Result<Value, HttpError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let resp = self.send(kind, build).await?;
        let url = resp.url().to_string();
        let text = resp.text().await?;
        serde_json::from_str(&text).map_err(|e| HttpError::Decode {
            url,
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn page_creation_only_retries_rate_limits() {
        assert_eq!(
            classify_status(RequestKind::NonIdempotent, StatusCode::BAD_GATEWAY),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(RequestKind::NonIdempotent, StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(RequestKind::Idempotent, StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(RequestKind::Idempotent, StatusCode::BAD_REQUEST),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn error_detail_is_cut_on_a_char_boundary() {
        let detail = "é".repeat(ERROR_DETAIL_LIMIT);
        let cut = truncate_detail(detail);
        assert!(cut.len() <= ERROR_DETAIL_LIMIT);
        assert!(cut.chars().all(|c| c == 'é'));
    }
}
