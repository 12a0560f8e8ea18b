use std::{thread, time::Duration};

use reqwest::{
    StatusCode,
    blocking::{Client, RequestBuilder, Response},
};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::{
    config::RetryPolicy,
    error::{RepairError, Result},
};

/// Blocking client that retries connect failures, timeouts, 5xx and 429 responses.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
    retry: RetryPolicy,
}

impl HttpClient {
    pub fn new(accept_invalid_certs: bool, timeout: Duration, retry: RetryPolicy) -> Result<Self> {
        let inner = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(timeout)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .map_err(|e| RepairError::config(format!("cannot build http client: {e}")))?;
        Ok(HttpClient { inner, retry })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Send the request produced by `build`, rebuilding it for every attempt. Any non-2xx
    /// status that is not retried (or survives every retry) becomes [`RepairError::Api`].
    /// Only for idempotent requests.
    pub fn send<F>(&self, operation: &str, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        self.send_attempts(operation, self.retry.max_attempts, build)
    }

    /// Single attempt for requests that create something. A timed out request may have
    /// been applied by the server, so repeating it could create a duplicate.
    pub fn send_once<F>(&self, operation: &str, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        self.send_attempts(operation, 1, build)
    }

    fn send_attempts<F>(&self, operation: &str, max_attempts: u32, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match build(&self.inner).send() {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    if is_retryable_status(status) && attempt < max_attempts {
                        self.back_off(operation, attempt, &status.to_string());
                        continue;
                    }
                    let body = response.text().unwrap_or_default();
                    return Err(RepairError::Api {
                        operation: operation.to_string(),
                        status: status.as_u16(),
                        body,
                    });
                }
                Err(err) if is_retryable_error(&err) && attempt < max_attempts => {
                    self.back_off(operation, attempt, &err.to_string());
                }
                Err(err) => {
                    return Err(RepairError::Transient {
                        operation: operation.to_string(),
                        attempts: attempt,
                        message: err.to_string(),
                    });
                }
            }
        }
    }

    pub fn send_json<T, F>(&self, operation: &str, build: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: Fn(&Client) -> RequestBuilder,
    {
        decode(operation, self.send(operation, build)?)
    }

    pub fn send_once_json<T, F>(&self, operation: &str, build: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: Fn(&Client) -> RequestBuilder,
    {
        decode(operation, self.send_once(operation, build)?)
    }

    fn back_off(&self, operation: &str, attempt: u32, cause: &str) {
        let delay = self.retry.delay_after(attempt);
        warn!(
            operation,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "retrying after {cause}"
        );
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        debug!(operation, attempt = attempt + 1, "retry");
    }
}

fn decode<T: DeserializeOwned>(operation: &str, response: Response) -> Result<T> {
    response.json::<T>().map_err(|e| RepairError::Decode {
        operation: operation.to_string(),
        message: e.to_string(),
    })
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_timeout()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_server_errors_and_throttling_only() {
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
        assert!(!is_retryable_status(StatusCode::CONFLICT));
        assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn refused_connection_exhausts_the_policy() {
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::ZERO,
            factor: 1,
        };
        let client = HttpClient::new(false, Duration::from_secs(2), policy).unwrap();
        // port 9 (discard) is not expected to listen on loopback
        let err = client
            .send("ping", |c| c.get("http://127.0.0.1:9/"))
            .unwrap_err();
        match err {
            RepairError::Transient {
                operation,
                attempts,
                ..
            } => {
                assert_eq!(operation, "ping");
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn creating_requests_are_not_repeated() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::ZERO,
            factor: 1,
        };
        let client = HttpClient::new(false, Duration::from_secs(2), policy).unwrap();
        let err = client
            .send_once("insert", |c| c.post("http://127.0.0.1:9/"))
            .unwrap_err();
        assert!(matches!(err, RepairError::Transient { attempts: 1, .. }));
    }
}
