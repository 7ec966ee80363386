//! SSRF-safe webhook delivery.
//!
//! Webhook URLs are user-supplied, so every send re-validates the target:
//! http(s) schemes only, a blocklist of internal hostnames (including cloud
//! metadata names), and resolution-time refusal of loopback, private,
//! link-local, and multicast addresses. DNS can change between sends, which
//! is why validation is not a one-time check at registration.

use std::net::IpAddr;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{ColloquyError, ColloquyResult};

type HmacSha256 = Hmac<Sha256>;

/// Internal service names and metadata endpoints that must never be
/// webhook targets.
const BLOCKED_HOSTNAMES: &[&str] = &[
    "localhost",
    "metadata",
    "metadata.google.internal",
    "metadata.amazonaws.com",
    "redis",
    "postgres",
    "minio",
    "colloquy-gateway",
    "colloquy-collector",
    "colloquy-decisions",
];

fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_unspecified()
                || v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            v6.is_unspecified()
                || v6.is_loopback()
                || v6.is_multicast()
                // Unique-local fc00::/7 and link-local fe80::/10.
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

/// Validates a webhook URL against the SSRF policy. Resolves the hostname
/// and refuses if any resulting address is internal.
pub async fn validate_webhook_url(url: &str) -> ColloquyResult<()> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| ColloquyError::WebhookRejected(format!("unparseable URL: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(ColloquyError::WebhookRejected(format!(
                "scheme '{other}' is not allowed"
            )))
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| ColloquyError::WebhookRejected("URL has no host".into()))?
        .to_ascii_lowercase();

    if BLOCKED_HOSTNAMES.contains(&host.as_str()) {
        return Err(ColloquyError::WebhookRejected(format!(
            "hostname '{host}' is internal"
        )));
    }

    // IP literal: check directly. Hostname: resolve and check every address
    // so DNS rebinding cannot smuggle an internal target through.
    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_blocked_ip(ip) {
            return Err(ColloquyError::WebhookRejected(format!(
                "address {ip} is not routable for webhooks"
            )));
        }
        return Ok(());
    }

    let port = parsed.port_or_known_default().unwrap_or(443);
    let addrs = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|e| ColloquyError::WebhookRejected(format!("cannot resolve '{host}': {e}")))?;

    let mut any = false;
    for addr in addrs {
        any = true;
        if is_blocked_ip(addr.ip()) {
            return Err(ColloquyError::WebhookRejected(format!(
                "'{host}' resolves to internal address {}",
                addr.ip()
            )));
        }
    }
    if !any {
        return Err(ColloquyError::WebhookRejected(format!(
            "'{host}' resolved to no addresses"
        )));
    }
    Ok(())
}

/// Delivers JSON event payloads to user-configured endpoints.
#[derive(Clone)]
pub struct WebhookSender {
    client: reqwest::Client,
}

impl Default for WebhookSender {
    fn default() -> Self {
        Self::new()
    }
}

impl WebhookSender {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("static client configuration"),
        }
    }

    /// Validates the URL, then POSTs `{"event_type": ..., **payload}`.
    /// When a secret is configured it is sent as a bearer token and the
    /// body is signed with HMAC-SHA256 so receivers can verify origin.
    pub async fn send(
        &self,
        url: &str,
        event_type: &str,
        payload: &serde_json::Value,
        secret: Option<&str>,
    ) -> ColloquyResult<()> {
        validate_webhook_url(url).await?;

        let mut body = serde_json::json!({"event_type": event_type});
        if let Some(object) = payload.as_object() {
            for (k, v) in object {
                body[k] = v.clone();
            }
        }
        let raw = serde_json::to_vec(&body)?;

        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/json");
        if let Some(secret) = secret.filter(|s| !s.trim().is_empty()) {
            let mut mac = HmacSha256::new_from_slice(secret.trim().as_bytes())
                .expect("hmac accepts any key length");
            mac.update(&raw);
            let signature = hex::encode(mac.finalize().into_bytes());
            request = request
                .header("Authorization", format!("Bearer {}", secret.trim()))
                .header("X-Colloquy-Signature", format!("sha256={signature}"));
        }

        let response = request
            .body(raw)
            .send()
            .await
            .map_err(|e| ColloquyError::Internal(format!("webhook send failed: {e}")))?;

        if !response.status().is_success() {
            log::warn!(
                "[Webhook] {event_type} to {url} returned {}",
                response.status()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn non_http_schemes_are_rejected() {
        let err = validate_webhook_url("ftp://example.com/hook").await.unwrap_err();
        assert_eq!(err.code(), "webhook_url_rejected");
        assert!(validate_webhook_url("file:///etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn loopback_and_metadata_addresses_are_rejected() {
        assert!(validate_webhook_url("http://127.0.0.1/hook").await.is_err());
        assert!(validate_webhook_url("http://169.254.169.254/latest/meta-data")
            .await
            .is_err());
        assert!(validate_webhook_url("http://10.1.2.3/hook").await.is_err());
        assert!(validate_webhook_url("http://192.168.1.10/hook").await.is_err());
        assert!(validate_webhook_url("http://[::1]/hook").await.is_err());
    }

    #[tokio::test]
    async fn internal_hostnames_are_rejected_without_resolution() {
        assert!(validate_webhook_url("http://localhost:9000/hook").await.is_err());
        assert!(validate_webhook_url("https://Metadata.Google.Internal/x")
            .await
            .is_err());
        assert!(validate_webhook_url("http://redis:6379/hook").await.is_err());
    }

    #[tokio::test]
    async fn public_ip_literals_pass() {
        assert!(validate_webhook_url("https://93.184.216.34/hook").await.is_ok());
    }
}
