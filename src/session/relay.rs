//! ICE Server Resolution
//!
//! Public STUN servers are always available. When a relay credential
//! endpoint is configured, TURN credentials are fetched from it over HTTPS
//! and used instead; any failure falls back to the STUN list. The request is
//! bounded so an unresponsive endpoint cannot hold up negotiation.

use std::time::Duration;
use serde::{Serialize, Deserialize};
use thiserror::Error;
use tracing::{info, warn};

/// STUN servers used when nothing else is configured.
pub const DEFAULT_STUN_URLS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// One ICE server entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    /// `stun:` / `turn:` URLs.
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    /// TURN username.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    /// A credential-less STUN entry.
    pub fn stun(url: impl Into<String>) -> Self {
        Self { urls: vec![url.into()], username: None, credential: None }
    }
}

/// Relay credential fetch errors.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The HTTP request failed.
    #[error("relay request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The endpoint answered with an error.
    #[error("relay endpoint error: {0}")]
    Upstream(String),

    /// The endpoint answered with something unparseable.
    #[error("relay response invalid: {0}")]
    InvalidResponse(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(url) => vec![url],
        OneOrMany::Many(urls) => urls,
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RelayBody {
    List(Vec<IceServerConfig>),
    Wrapped {
        #[serde(rename = "iceServers")]
        ice_servers: Vec<IceServerConfig>,
    },
    Error {
        error: String,
    },
}

/// STUN entries for a list of URLs.
pub fn stun_servers(urls: &[String]) -> Vec<IceServerConfig> {
    urls.iter().map(IceServerConfig::stun).collect()
}

/// Interpret a relay endpoint response.
pub fn parse_relay_response(status: u16, body: &str) -> Result<Vec<IceServerConfig>, RelayError> {
    let parsed: Result<RelayBody, _> = serde_json::from_str(body);
    match parsed {
        Ok(RelayBody::Error { error }) => Err(RelayError::Upstream(error)),
        Ok(_) if !(200..300).contains(&status) => {
            Err(RelayError::Upstream(format!("status {status}")))
        }
        Ok(RelayBody::List(servers)) | Ok(RelayBody::Wrapped { ice_servers: servers }) => {
            if servers.is_empty() {
                Err(RelayError::InvalidResponse("no ice servers".into()))
            } else {
                Ok(servers)
            }
        }
        Err(_) if !(200..300).contains(&status) => {
            Err(RelayError::Upstream(format!("status {status}")))
        }
        Err(e) => Err(RelayError::InvalidResponse(e.to_string())),
    }
}

/// Fetch TURN credentials from the relay endpoint, giving up after `timeout`.
pub async fn fetch_relay_servers(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<Vec<IceServerConfig>, RelayError> {
    let response = client.get(url).timeout(timeout).send().await?;
    let status = response.status().as_u16();
    let body = response.text().await?;
    parse_relay_response(status, &body)
}

/// Relay credentials if configured and reachable, otherwise STUN.
pub async fn resolve_ice_servers(
    client: &reqwest::Client,
    relay_url: Option<&str>,
    stun_urls: &[String],
    timeout: Duration,
) -> Vec<IceServerConfig> {
    let Some(url) = relay_url else {
        return stun_servers(stun_urls);
    };

    match fetch_relay_servers(client, url, timeout).await {
        Ok(mut servers) => {
            info!("Fetched {} relay ICE servers", servers.len());
            // Keep STUN as well so direct paths are still tried first
            servers.extend(stun_servers(stun_urls));
            servers
        }
        Err(e) => {
            warn!("Relay credentials unavailable, using STUN only: {}", e);
            stun_servers(stun_urls)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_list() {
        let body = r#"[{"urls":"turn:relay.example.com:3478","username":"u","credential":"p"}]"#;
        let servers = parse_relay_response(200, body).unwrap();
        assert_eq!(servers[0].urls, vec!["turn:relay.example.com:3478".to_string()]);
        assert_eq!(servers[0].username.as_deref(), Some("u"));
    }

    #[test]
    fn test_parse_wrapped_list() {
        let body = r#"{"iceServers":[{"urls":["turn:a:3478","turns:a:5349"]}]}"#;
        let servers = parse_relay_response(200, body).unwrap();
        assert_eq!(servers[0].urls.len(), 2);
        assert_eq!(servers[0].credential, None);
    }

    #[test]
    fn test_parse_upstream_error() {
        let err = parse_relay_response(500, r#"{"error":"quota exceeded"}"#).unwrap_err();
        assert!(matches!(err, RelayError::Upstream(ref m) if m == "quota exceeded"));

        let err = parse_relay_response(502, "<html>bad gateway</html>").unwrap_err();
        assert!(matches!(err, RelayError::Upstream(_)));
    }

    #[test]
    fn test_parse_empty_list_rejected() {
        assert!(matches!(
            parse_relay_response(200, "[]"),
            Err(RelayError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_without_relay_uses_stun() {
        let client = reqwest::Client::new();
        let stun = vec!["stun:stun.example.org:3478".to_string()];
        let servers = resolve_ice_servers(&client, None, &stun, Duration::from_secs(1)).await;
        assert_eq!(servers, vec![IceServerConfig::stun("stun:stun.example.org:3478")]);
    }

    #[tokio::test]
    async fn test_silent_relay_falls_back_to_stun() {
        // Accepts connections and never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let client = reqwest::Client::new();
        let url = format!("http://{addr}/credentials");
        let stun = vec!["stun:stun.example.org:3478".to_string()];
        let servers = tokio::time::timeout(
            Duration::from_secs(10),
            resolve_ice_servers(&client, Some(&url), &stun, Duration::from_millis(200)),
        )
        .await
        .unwrap();
        assert_eq!(servers, stun_servers(&stun));

        let err = fetch_relay_servers(&client, &url, Duration::from_millis(200)).await.unwrap_err();
        assert!(matches!(err, RelayError::Http(ref e) if e.is_timeout()));
        server.abort();
    }
}
