//! HTTP transport that backs off on throttling responses.
//!
//! Only `429 Too Many Requests` is interpreted. The request body is buffered
//! before the first attempt so it can be replayed on every retry; every other
//! status, and every transport error, goes back to the caller untouched.
//!
//! Waiting happens inside the returned future, so dropping it (for example
//! from a `tokio::select!` on a cancellation token) abandons the backoff.

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Method, Request, Response, StatusCode, Url};

/// Wait used when a 429 carries no usable `retry-after`.
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

pub struct RateLimitedTransport {
    client: Client,
    max_retries: u32,
    default_delay: Duration,
}

/// A request split into replayable parts.
struct BufferedRequest {
    method: Method,
    url: Url,
    headers: HeaderMap,
    timeout: Option<Duration>,
    body: Option<Bytes>,
}

impl BufferedRequest {
    /// `None` when the body is a stream and cannot be buffered.
    fn from_request(request: &Request) -> Option<Self> {
        let body = match request.body() {
            Some(body) => Some(Bytes::copy_from_slice(body.as_bytes()?)),
            None => None,
        };
        Some(Self {
            method: request.method().clone(),
            url: request.url().clone(),
            headers: request.headers().clone(),
            timeout: request.timeout().copied(),
            body,
        })
    }

    fn build(&self) -> Request {
        let mut request = Request::new(self.method.clone(), self.url.clone());
        *request.headers_mut() = self.headers.clone();
        *request.timeout_mut() = self.timeout;
        if let Some(body) = &self.body {
            *request.body_mut() = Some(body.clone().into());
        }
        request
    }
}

impl RateLimitedTransport {
    pub fn new(client: Client, max_retries: u32) -> Self {
        Self {
            client,
            max_retries,
            default_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Send `request`, sleeping and replaying it while the server answers 429.
    ///
    /// After `max_retries` replays the last 429 response is returned as is.
    pub async fn execute(&self, request: Request) -> Result<Response, reqwest::Error> {
        let Some(buffered) = BufferedRequest::from_request(&request) else {
            tracing::debug!("Streaming request body, sending without replay support");
            return self.client.execute(request).await;
        };
        drop(request);

        let mut attempt = 0;
        loop {
            let response = self.client.execute(buffered.build()).await?;
            if response.status() != StatusCode::TOO_MANY_REQUESTS || attempt >= self.max_retries {
                return Ok(response);
            }
            attempt += 1;

            let wait = retry_after(response.headers(), Utc::now()).unwrap_or(self.default_delay);
            tracing::warn!(
                "Rate limited by {}, retrying in {:?} (attempt {}/{})",
                buffered.url.host_str().unwrap_or("server"),
                wait,
                attempt,
                self.max_retries
            );
            drop(response);
            tokio::time::sleep(wait).await;
        }
    }
}

fn retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?;
    parse_retry_after(value, now)
}

/// Parse a `retry-after` value: delay seconds or an HTTP-date. Dates in the
/// past yield a zero wait.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    Some(
        at.with_timezone(&Utc)
            .signed_duration_since(now)
            .to_std()
            .unwrap_or(Duration::ZERO),
    )
}
