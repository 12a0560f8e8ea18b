//! Obtaining the credentials a run needs before it may touch the platform: tokens,
//! cluster secrets and the local port for the document store tunnel.

use std::{
    net::TcpListener,
    path::{Path, PathBuf},
    process::Command,
};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use crate::{
    error::{RepairError, Result},
    http::client::HttpClient,
};

const SERVICE_BROKER_SECRET: &str = "zen-service-broker-secret";
const COUCHDB_SECRET: &str = "wdp-couchdb";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
}

/// Mint a platform token for `username` (uid `user_id`) using the service broker secret.
pub fn mint_user_token(
    client: &HttpClient,
    host: &str,
    service_broker_token: &str,
    user_id: &str,
    username: &str,
) -> Result<String> {
    let url = format!("{host}/zen-data/internal/v1/service_token");
    let response: TokenResponse = client.send_json("mint user token", |c| {
        c.get(&url)
            .header("Secret", service_broker_token)
            .query(&[("uid", user_id), ("username", username)])
    })?;
    response
        .token
        .ok_or_else(|| RepairError::config(format!("no token returned for user {username}")))
}

/// Exchange a username and password for a platform token.
pub fn authorize(client: &HttpClient, host: &str, username: &str, password: &str) -> Result<String> {
    let url = format!("{host}/icp4d-api/v1/authorize");
    let body = json!({ "username": username, "password": password });
    let response: TokenResponse = client
        .send_json("authorize", |c| {
            c.post(&url).header("cache-control", "no-cache").json(&body)
        })
        .map_err(|e| RepairError::config(format!("cannot authorize {username}: {e}")))?;
    let token = response
        .token
        .ok_or_else(|| RepairError::config(format!("authorization of {username} returned no token")))?;
    info!(username, "access token generated");
    Ok(token)
}

/// The `oc` binary to use: the configured path, or `oc` resolved through `PATH`.
pub fn resolve_oc_path(configured: Option<PathBuf>) -> PathBuf {
    configured.unwrap_or_else(|| PathBuf::from("oc"))
}

/// `data` of a cluster secret as printed by `oc get secret --output json`.
pub fn read_cluster_secret(oc_path: &Path, namespace: &str, name: &str) -> Result<Map<String, Value>> {
    debug!(namespace, secret = name, "reading cluster secret");
    let output = Command::new(oc_path)
        .args(["-n", namespace, "get", "secret", name, "--output", "json"])
        .output()
        .map_err(|e| {
            RepairError::config(format!("cannot run {}: {e}", oc_path.display()))
        })?;
    if !output.status.success() {
        return Err(RepairError::config(format!(
            "reading secret {name} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    let secret: Value = serde_json::from_slice(&output.stdout)
        .map_err(|e| RepairError::config(format!("secret {name} is not JSON: {e}")))?;
    secret
        .get("data")
        .and_then(Value::as_object)
        .cloned()
        .ok_or_else(|| RepairError::config(format!("secret {name} has no data")))
}

fn decode_secret_field(data: &Map<String, Value>, secret: &str, key: &str) -> Result<String> {
    let encoded = data
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| RepairError::config(format!("invalid `{secret}` secret: missing {key}")))?;
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| RepairError::config(format!("invalid `{secret}` secret: {key}: {e}")))?;
    String::from_utf8(bytes)
        .map_err(|_| RepairError::config(format!("invalid `{secret}` secret: {key} is not utf-8")))
}

pub fn service_broker_token_from_cluster(oc_path: &Path, namespace: &str) -> Result<String> {
    let data = read_cluster_secret(oc_path, namespace, SERVICE_BROKER_SECRET)?;
    decode_secret_field(&data, SERVICE_BROKER_SECRET, "token")
}

/// Admin user and password of the document store.
pub fn couchdb_credentials_from_cluster(oc_path: &Path, namespace: &str) -> Result<(String, String)> {
    let data = read_cluster_secret(oc_path, namespace, COUCHDB_SECRET)?;
    let username = decode_secret_field(&data, COUCHDB_SECRET, "adminUsername")?;
    let password = decode_secret_field(&data, COUCHDB_SECRET, "adminPassword")?;
    info!(username = %username, "document store credentials read from cluster");
    Ok((username, password))
}

/// A loopback port nothing listens on right now.
pub fn free_local_port() -> Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).map_err(|e| RepairError::Io {
        path: PathBuf::from("127.0.0.1:0"),
        source: e,
    })?;
    let port = listener
        .local_addr()
        .map_err(|e| RepairError::Io {
            path: PathBuf::from("127.0.0.1:0"),
            source: e,
        })?
        .port();
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_fields_are_base64_decoded() {
        let mut data = Map::new();
        data.insert("adminUsername".into(), Value::String(STANDARD.encode("admin")));
        data.insert("broken".into(), Value::String("***".into()));
        assert_eq!(
            decode_secret_field(&data, COUCHDB_SECRET, "adminUsername").unwrap(),
            "admin"
        );
        let missing = decode_secret_field(&data, COUCHDB_SECRET, "adminPassword").unwrap_err();
        assert!(missing.is_fatal());
        assert!(missing.to_string().contains("missing adminPassword"));
        assert!(decode_secret_field(&data, COUCHDB_SECRET, "broken").is_err());
    }

    #[test]
    fn free_port_is_nonzero() {
        assert_ne!(free_local_port().unwrap(), 0);
    }
}
