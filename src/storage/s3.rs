//! S3-compatible blob store.
//!
//! Stores blobs as objects named `<prefix><checksum>` using the S3 REST
//! API with AWS Signature V4 authentication. Blob metadata travels as
//! `x-amz-meta-*` headers. Supports custom endpoints for S3-compatible
//! services (MinIO, LocalStack).
//!
//! Uses only pure-Rust dependencies (`hmac`, `sha2`) for AWS signing — no
//! C library dependencies like `aws-lc-sys`, making it compatible with
//! all build environments including Nix.
//!
//! # Configuration
//!
//! ```toml
//! [storage]
//! backend = "s3"
//!
//! [storage.s3]
//! bucket = "acme-knowledge"
//! prefix = "blobs/"
//! region = "us-east-1"
//! # endpoint_url = "http://localhost:9000"   # MinIO
//! ```
//!
//! # Environment Variables
//!
//! Credentials are read from environment variables:
//! - `AWS_ACCESS_KEY_ID` — required
//! - `AWS_SECRET_ACCESS_KEY` — required
//! - `AWS_SESSION_TOKEN` — optional (for temporary credentials / IAM roles)

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use async_trait::async_trait;
use chrono::Utc;

use super::{BlobMetadata, BlobStore, StorageError};
use crate::config::S3StorageConfig;

type HmacSha256 = Hmac<Sha256>;

const META_HEADER_PREFIX: &str = "x-amz-meta-";

/// S3-backed [`BlobStore`].
pub struct S3BlobStore {
    config: S3StorageConfig,
    creds: AwsCredentials,
    client: reqwest::Client,
}

impl S3BlobStore {
    /// Create a store for the configured bucket, reading credentials from
    /// the environment.
    pub fn from_env(config: S3StorageConfig) -> Result<Self, StorageError> {
        let creds = AwsCredentials::from_env()?;
        Ok(Self {
            config,
            creds,
            client: reqwest::Client::new(),
        })
    }

    fn object_key(&self, checksum: &str) -> String {
        format!("{}{}", self.config.prefix, checksum)
    }

    fn host(&self) -> String {
        if let Some(ref endpoint) = self.config.endpoint_url {
            endpoint
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_end_matches('/')
                .to_string()
        } else {
            format!(
                "{}.s3.{}.amazonaws.com",
                self.config.bucket, self.config.region
            )
        }
    }

    fn scheme(&self) -> &'static str {
        match self.config.endpoint_url {
            Some(ref endpoint) if endpoint.starts_with("http://") => "http",
            _ => "https",
        }
    }

    /// Sign a request with AWS SigV4 and return the headers to attach.
    ///
    /// `query_params` must already be sorted by key. `extra_headers` are
    /// included in the signature (metadata headers on PUT).
    fn sign(
        &self,
        method: &str,
        canonical_uri: &str,
        query_params: &[(String, String)],
        payload_hash: &str,
        extra_headers: &[(String, String)],
    ) -> Vec<(String, String)> {
        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        let canonical_querystring: String = query_params
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let mut headers: Vec<(String, String)> = vec![
            ("host".to_string(), self.host()),
            ("x-amz-content-sha256".to_string(), payload_hash.to_string()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        for (k, v) in extra_headers {
            headers.push((k.to_lowercase(), v.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers: String = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");

        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method, canonical_uri, canonical_querystring, canonical_headers, signed_headers,
            payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.config.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key = derive_signing_key(
            &self.creds.secret_access_key,
            &date_stamp,
            &self.config.region,
            "s3",
        );
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.creds.access_key_id, credential_scope, signed_headers, signature
        );

        let mut request_headers = vec![("Authorization".to_string(), authorization)];
        for (k, v) in headers {
            if k != "host" {
                request_headers.push((k, v));
            }
        }
        request_headers
    }

    fn object_url(&self, key: &str) -> (String, String) {
        let encoded_key = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        let canonical_uri = format!("/{}", encoded_key);
        let url = format!("{}://{}{}", self.scheme(), self.host(), canonical_uri);
        (canonical_uri, url)
    }

    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
        headers: Vec<(String, String)>,
        action: &str,
    ) -> Result<reqwest::Response, StorageError> {
        let mut builder = builder;
        for (k, v) in headers {
            builder = builder.header(&k, &v);
        }
        builder
            .send()
            .await
            .map_err(|e| StorageError::Backend(format!("S3 {} request failed: {}", action, e)))
    }

    /// List all object keys under the configured prefix, with pagination.
    async fn list_keys(&self) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut query_params = vec![
                ("list-type".to_string(), "2".to_string()),
                ("max-keys".to_string(), "1000".to_string()),
            ];
            if let Some(ref token) = continuation_token {
                query_params.push(("continuation-token".to_string(), token.clone()));
            }
            if !self.config.prefix.is_empty() {
                query_params.push(("prefix".to_string(), self.config.prefix.clone()));
            }
            query_params.sort_by(|a, b| a.0.cmp(&b.0));

            let payload_hash = hex_sha256(b"");
            let headers = self.sign("GET", "/", &query_params, &payload_hash, &[]);

            let canonical_querystring: String = query_params
                .iter()
                .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
                .collect::<Vec<_>>()
                .join("&");
            let url = format!(
                "{}://{}/?{}",
                self.scheme(),
                self.host(),
                canonical_querystring
            );

            let resp = self
                .send(self.client.get(&url), headers, "ListObjectsV2")
                .await?;

            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(StorageError::Backend(format!(
                    "S3 ListObjectsV2 failed (HTTP {}): {}",
                    status,
                    body.chars().take(500).collect::<String>()
                )));
            }

            let xml_body = resp
                .text()
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            let (batch, is_truncated, next_token) = parse_list_objects_response(&xml_body);
            keys.extend(batch);

            if is_truncated {
                continuation_token = next_token;
            } else {
                break;
            }
        }

        Ok(keys)
    }

    async fn delete_key(&self, key: &str) -> Result<(), StorageError> {
        let (canonical_uri, url) = self.object_url(key);
        let payload_hash = hex_sha256(b"");
        let headers = self.sign("DELETE", &canonical_uri, &[], &payload_hash, &[]);

        let resp = self
            .send(self.client.delete(&url), headers, "DeleteObject")
            .await?;

        // DeleteObject returns 204 whether or not the object existed.
        if !resp.status().is_success() && resp.status().as_u16() != 404 {
            return Err(StorageError::Backend(format!(
                "S3 DeleteObject failed (HTTP {}) for key '{}'",
                resp.status(),
                key
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn store(
        &self,
        checksum: &str,
        bytes: &[u8],
        metadata: &BlobMetadata,
    ) -> Result<(), StorageError> {
        let key = self.object_key(checksum);
        let (canonical_uri, url) = self.object_url(&key);
        let payload_hash = hex_sha256(bytes);

        let meta_headers: Vec<(String, String)> = metadata
            .iter()
            .map(|(k, v)| (format!("{}{}", META_HEADER_PREFIX, k), v.clone()))
            .collect();
        let headers = self.sign("PUT", &canonical_uri, &[], &payload_hash, &meta_headers);

        let resp = self
            .send(
                self.client.put(&url).body(bytes.to_vec()),
                headers,
                "PutObject",
            )
            .await?;

        if !resp.status().is_success() {
            return Err(StorageError::Backend(format!(
                "S3 PutObject failed (HTTP {}) for checksum '{}'",
                resp.status(),
                checksum
            )));
        }
        Ok(())
    }

    async fn fetch(&self, checksum: &str) -> Result<(Vec<u8>, BlobMetadata), StorageError> {
        let key = self.object_key(checksum);
        let (canonical_uri, url) = self.object_url(&key);
        let payload_hash = hex_sha256(b"");
        let headers = self.sign("GET", &canonical_uri, &[], &payload_hash, &[]);

        let resp = self
            .send(self.client.get(&url), headers, "GetObject")
            .await?;

        if resp.status().as_u16() == 404 {
            return Err(StorageError::NotFound(checksum.to_string()));
        }
        if !resp.status().is_success() {
            return Err(StorageError::Backend(format!(
                "S3 GetObject failed (HTTP {}) for checksum '{}'",
                resp.status(),
                checksum
            )));
        }

        let mut metadata = BlobMetadata::new();
        for (name, value) in resp.headers() {
            if let Some(meta_key) = name.as_str().strip_prefix(META_HEADER_PREFIX) {
                if let Ok(v) = value.to_str() {
                    metadata.insert(meta_key.to_string(), v.to_string());
                }
            }
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok((bytes.to_vec(), metadata))
    }

    async fn delete(&self, checksum: &str) -> Result<(), StorageError> {
        self.delete_key(&self.object_key(checksum)).await
    }

    async fn delete_all(&self) -> Result<(), StorageError> {
        for key in self.list_keys().await? {
            self.delete_key(&key).await?;
        }
        Ok(())
    }
}

// ============ AWS Credentials ============

/// AWS credentials loaded from environment variables.
struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    fn from_env() -> Result<Self, StorageError> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID").map_err(|_| {
            StorageError::Backend("AWS_ACCESS_KEY_ID environment variable not set".to_string())
        })?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY").map_err(|_| {
            StorageError::Backend("AWS_SECRET_ACCESS_KEY environment variable not set".to_string())
        })?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

// ============ AWS SigV4 Helpers ============

/// Compute the hex-encoded SHA-256 hash of data.
fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compute HMAC-SHA256 of data with the given key.
fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Compute hex-encoded HMAC-SHA256.
fn hex_hmac_sha256(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_sha256(key, data))
}

/// Derive the AWS SigV4 signing key for a given date, region, and service.
///
/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// URI-encode a string per RFC 3986 (used in SigV4 canonical requests).
///
/// Encodes all characters except unreserved characters:
/// `A-Z a-z 0-9 - _ . ~`
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}

// ============ XML Parsing (minimal, no extra deps) ============

/// Parse a `ListObjectsV2` XML response into object keys plus the
/// truncation flag and continuation token for pagination.
fn parse_list_objects_response(xml: &str) -> (Vec<String>, bool, Option<String>) {
    let mut keys = Vec::new();
    let is_truncated = extract_xml_value(xml, "IsTruncated")
        .map(|v| v == "true")
        .unwrap_or(false);
    let next_token = extract_xml_value(xml, "NextContinuationToken");

    let mut remaining = xml;
    while let Some(start) = remaining.find("<Contents>") {
        let block_start = start + "<Contents>".len();
        if let Some(end) = remaining[block_start..].find("</Contents>") {
            let block = &remaining[block_start..block_start + end];
            if let Some(key) = extract_xml_value(block, "Key") {
                if !key.is_empty() && !key.ends_with('/') {
                    keys.push(key);
                }
            }
            remaining = &remaining[block_start + end + "</Contents>".len()..];
        } else {
            break;
        }
    }

    (keys, is_truncated, next_token)
}

/// Extract the text content of an XML tag (simple, non-nested).
fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    if let Some(start) = xml.find(&open) {
        let value_start = start + open.len();
        if let Some(end) = xml[value_start..].find(&close) {
            return Some(xml[value_start..value_start + end].to_string());
        }
    }
    None
}
