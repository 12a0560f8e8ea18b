//! Typed run configuration shared by the library and the binaries.

use std::{path::PathBuf, time::Duration};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use url::Url;

use crate::{
    error::{RepairError, Result},
    execute::DisableMode,
};

pub const DEFAULT_NAMESPACE: &str = "cpd-instance";
pub const DEFAULT_USER_ID: &str = "1000331001";
pub const DEFAULT_USER_NAME: &str = "cpadmin";
pub const DEFAULT_WORKERS: usize = 4;

pub const COUCHDB_SERVICE: &str = "service/wdp-couchdb-svc";
pub const COUCHDB_REMOTE_PORT: u16 = 6984;
pub const CREDENTIALS_DATABASE: &str = "task-credentials";

/// Bounded exponential backoff for calls that may fail transiently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            factor: 2,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no waiting.
    pub fn none() -> Self {
        RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            factor: 1,
        }
    }

    /// Delay before retrying after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let multiplier = self.factor.saturating_pow(exponent);
        self.base_delay.saturating_mul(multiplier)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformConfig {
    /// Normalized base url, without a trailing slash.
    pub host: String,
    pub accept_invalid_certs: bool,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl PlatformConfig {
    pub fn new(host: &str) -> Result<Self> {
        Ok(PlatformConfig {
            host: normalize_host(host)?,
            accept_invalid_certs: false,
            request_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        })
    }
}

/// Document store reached through the local end of the tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub local_port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub retry: RetryPolicy,
}

impl StoreConfig {
    pub fn database_url(&self) -> String {
        format!("https://127.0.0.1:{}/{}", self.local_port, self.database)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    pub oc_path: PathBuf,
    pub namespace: String,
    pub service: String,
    pub remote_port: u16,
    pub local_port: u16,
    pub ready_timeout: Duration,
}

impl TunnelConfig {
    pub fn couchdb(oc_path: PathBuf, namespace: impl Into<String>, local_port: u16) -> Self {
        TunnelConfig {
            oc_path,
            namespace: namespace.into(),
            service: COUCHDB_SERVICE.to_string(),
            remote_port: COUCHDB_REMOTE_PORT,
            local_port,
            ready_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOptions {
    /// Limit discovery to one project.
    pub project_id: Option<String>,
    /// Limit inventory and planning to one primary pipeline.
    pub primary_pipeline_id: Option<String>,
    /// Apply plans; otherwise only report them.
    pub fix: bool,
    pub dump_dir: Option<PathBuf>,
    pub workers: usize,
    pub disable_mode: DisableMode,
    pub owner_user_id: String,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        ReconcileOptions {
            project_id: None,
            primary_pipeline_id: None,
            fix: false,
            dump_dir: None,
            workers: DEFAULT_WORKERS,
            disable_mode: DisableMode::Void,
            owner_user_id: DEFAULT_USER_NAME.to_string(),
        }
    }
}

/// Parse a host url and drop any trailing slash so paths can be appended verbatim.
pub fn normalize_host(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(RepairError::config("host must not be empty"));
    }
    let url = Url::parse(trimmed)
        .map_err(|e| RepairError::config(format!("invalid host '{trimmed}': {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(RepairError::config(format!(
            "host '{trimmed}' must use http or https"
        )));
    }
    if url.host_str().is_none() {
        return Err(RepairError::config(format!("host '{trimmed}' has no host name")));
    }
    Ok(url.as_str().trim_end_matches('/').to_string())
}

/// Split base64 `user:password` credentials.
pub fn decode_basic_credentials(encoded: &str) -> Result<(String, String)> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| RepairError::config(format!("document store credentials are not base64: {e}")))?;
    let text = String::from_utf8(bytes)
        .map_err(|_| RepairError::config("document store credentials are not utf-8"))?;
    let (user, password) = text
        .split_once(':')
        .ok_or_else(|| RepairError::config("document store credentials must be user:password"))?;
    Ok((user.to_string(), password.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_loses_trailing_slash() {
        assert_eq!(
            normalize_host("https://cpd.example.com/").unwrap(),
            "https://cpd.example.com"
        );
        assert_eq!(
            normalize_host(" https://cpd.example.com/zen/ ").unwrap(),
            "https://cpd.example.com/zen"
        );
    }

    #[test]
    fn host_must_be_http() {
        assert!(normalize_host("ftp://cpd.example.com").unwrap_err().is_fatal());
        assert!(normalize_host("").is_err());
        assert!(normalize_host("not a url").is_err());
    }

    #[test]
    fn backoff_grows_exponentially() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_millis(500));
        assert_eq!(policy.delay_after(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_after(3), Duration::from_millis(2000));
        assert_eq!(RetryPolicy::none().delay_after(5), Duration::ZERO);
    }

    #[test]
    fn basic_credentials_split_on_first_colon() {
        let encoded = STANDARD.encode("admin:pa:ss");
        let (user, password) = decode_basic_credentials(&encoded).unwrap();
        assert_eq!(user, "admin");
        assert_eq!(password, "pa:ss");
        assert!(decode_basic_credentials("%%%").is_err());
    }
}
