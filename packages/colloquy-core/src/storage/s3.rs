//! S3-compatible object store (MinIO in development).
//!
//! Talks the S3 REST API directly with SigV4 request signing; the API
//! subset here (PUT/GET/HEAD/DELETE on a single object, presigned GET) is
//! small enough that a full SDK would be the heavier dependency. Path-style
//! addressing is used because MinIO defaults to it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Method;
use sha2::{Digest, Sha256};

use super::{validate_key, ObjectStore};
use crate::config::StorageConfig;
use crate::error::{ColloquyError, ColloquyResult};

type HmacSha256 = Hmac<Sha256>;

const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

pub struct S3ObjectStore {
    client: reqwest::Client,
    endpoint: String,
    bucket: String,
    access_key: String,
    secret_key: String,
    region: String,
}

impl S3ObjectStore {
    pub fn new(config: &StorageConfig) -> ColloquyResult<Self> {
        if config.s3_access_key.is_empty() || config.s3_secret_key.is_empty() {
            return Err(ColloquyError::Configuration(
                "S3 storage selected but credentials are missing".into(),
            ));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint: config.s3_endpoint.trim_end_matches('/').to_string(),
            bucket: config.s3_bucket.clone(),
            access_key: config.s3_access_key.clone(),
            secret_key: config.s3_secret_key.clone(),
            region: config.s3_region.clone(),
        })
    }

    fn host(&self) -> String {
        self.endpoint
            .trim_start_matches("http://")
            .trim_start_matches("https://")
            .to_string()
    }

    fn object_uri(&self, key: &str) -> String {
        format!("/{}/{}", self.bucket, uri_encode(key, false))
    }

    fn signing_key(&self, date: &str) -> Vec<u8> {
        let mut key = hmac_sha256(format!("AWS4{}", self.secret_key).as_bytes(), date.as_bytes());
        for part in [self.region.as_str(), "s3", "aws4_request"] {
            key = hmac_sha256(&key, part.as_bytes());
        }
        key
    }

    /// Signs and sends one object request.
    async fn request(
        &self,
        method: Method,
        key: &str,
        body: Option<(&[u8], &str)>,
    ) -> ColloquyResult<reqwest::Response> {
        validate_key(key)?;
        let now: DateTime<Utc> = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();

        let payload_hash = match body {
            Some((data, _)) => hex::encode(Sha256::digest(data)),
            None => hex::encode(Sha256::digest(b"")),
        };

        let uri = self.object_uri(key);
        let host = self.host();
        let canonical_headers = format!(
            "host:{host}\nx-amz-content-sha256:{payload_hash}\nx-amz-date:{amz_date}\n"
        );
        let signed_headers = "host;x-amz-content-sha256;x-amz-date";
        let canonical_request = format!(
            "{}\n{uri}\n\n{canonical_headers}\n{signed_headers}\n{payload_hash}",
            method.as_str()
        );

        let scope = format!("{date}/{}/s3/aws4_request", self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );
        let signature = hex::encode(hmac_sha256(
            &self.signing_key(&date),
            string_to_sign.as_bytes(),
        ));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, \
             Signature={signature}",
            self.access_key
        );

        let mut request = self
            .client
            .request(method, format!("{}{uri}", self.endpoint))
            .header("Authorization", authorization)
            .header("x-amz-date", amz_date)
            .header("x-amz-content-sha256", payload_hash);
        if let Some((data, content_type)) = body {
            request = request
                .header("Content-Type", content_type)
                .body(data.to_vec());
        }

        request
            .send()
            .await
            .map_err(|e| ColloquyError::Storage(format!("s3 request failed: {e}")))
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn upload(&self, path: &str, data: &[u8], content_type: &str) -> ColloquyResult<String> {
        let response = self
            .request(Method::PUT, path, Some((data, content_type)))
            .await?;
        if !response.status().is_success() {
            return Err(ColloquyError::Storage(format!(
                "s3 upload of {path} returned {}",
                response.status()
            )));
        }
        Ok(path.to_string())
    }

    async fn download(&self, path: &str) -> ColloquyResult<Vec<u8>> {
        let response = self.request(Method::GET, path, None).await?;
        match response.status() {
            status if status.is_success() => Ok(response
                .bytes()
                .await
                .map_err(|e| ColloquyError::Storage(format!("s3 body read: {e}")))?
                .to_vec()),
            reqwest::StatusCode::NOT_FOUND => {
                Err(ColloquyError::NotFound(format!("object {path}")))
            }
            status => Err(ColloquyError::Storage(format!(
                "s3 download of {path} returned {status}"
            ))),
        }
    }

    /// Presigned GET with the signature in the query string; no credentials
    /// reach the holder of the URL.
    async fn presign(&self, path: &str, expires_secs: u64) -> ColloquyResult<String> {
        validate_key(path)?;
        let now: DateTime<Utc> = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let scope = format!("{date}/{}/s3/aws4_request", self.region);

        let credential = uri_encode(&format!("{}/{scope}", self.access_key), true);
        let query = format!(
            "X-Amz-Algorithm=AWS4-HMAC-SHA256&X-Amz-Credential={credential}\
             &X-Amz-Date={amz_date}&X-Amz-Expires={expires_secs}&X-Amz-SignedHeaders=host"
        );

        let uri = self.object_uri(path);
        let host = self.host();
        let canonical_request = format!(
            "GET\n{uri}\n{query}\nhost:{host}\n\nhost\n{UNSIGNED_PAYLOAD}"
        );
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );
        let signature = hex::encode(hmac_sha256(
            &self.signing_key(&date),
            string_to_sign.as_bytes(),
        ));

        Ok(format!(
            "{}{uri}?{query}&X-Amz-Signature={signature}",
            self.endpoint
        ))
    }

    async fn delete(&self, path: &str) -> ColloquyResult<()> {
        let response = self.request(Method::DELETE, path, None).await?;
        if response.status().is_success() || response.status() == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(ColloquyError::Storage(format!(
                "s3 delete of {path} returned {}",
                response.status()
            )))
        }
    }

    async fn exists(&self, path: &str) -> ColloquyResult<bool> {
        let response = self.request(Method::HEAD, path, None).await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            status => Err(ColloquyError::Storage(format!(
                "s3 head of {path} returned {status}"
            ))),
        }
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// RFC 3986 percent-encoding as SigV4 requires; `/` survives in object
/// paths but not inside query values.
fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            b'/' if !encode_slash => out.push('/'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageBackendKind;

    fn config() -> StorageConfig {
        StorageConfig {
            backend: StorageBackendKind::S3,
            s3_endpoint: "http://minio:9000".into(),
            s3_bucket: "colloquy-recordings".into(),
            s3_access_key: "AK".into(),
            s3_secret_key: "SK".into(),
            s3_region: "us-east-1".into(),
            ..StorageConfig::default()
        }
    }

    #[test]
    fn missing_credentials_fail_construction() {
        let mut cfg = config();
        cfg.s3_access_key.clear();
        assert!(S3ObjectStore::new(&cfg).is_err());
    }

    #[test]
    fn uri_encoding_preserves_path_slashes_only_when_asked() {
        assert_eq!(uri_encode("a/b c.wav", false), "a/b%20c.wav");
        assert_eq!(uri_encode("AK/20250601/us", true), "AK%2F20250601%2Fus");
    }

    #[tokio::test]
    async fn presigned_url_carries_signature_not_secret() {
        let store = S3ObjectStore::new(&config()).unwrap();
        let url = store.presign("meetings/42/audio.wav", 3600).await.unwrap();
        assert!(url.starts_with("http://minio:9000/colloquy-recordings/meetings/42/audio.wav?"));
        assert!(url.contains("X-Amz-Signature="));
        assert!(url.contains("X-Amz-Expires=3600"));
        assert!(!url.contains("SK"));
    }

    #[tokio::test]
    async fn presign_refuses_traversal_keys() {
        let store = S3ObjectStore::new(&config()).unwrap();
        assert!(store.presign("../other-bucket/obj", 60).await.is_err());
    }
}
