//! Remote resource retrieval.
//!
//! One narrow interface: fetch bytes over HTTP(S) with bounded retry and an
//! optional expected digest. Transient failures (connect/timeout/5xx) are
//! retried with exponential backoff; a digest mismatch is final — corrupted
//! bytes are never handed to the caller.
//!
//! Also carries the typed models for Mojang's public version manifest, which
//! is how server jars are located.

use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::time::Duration;
use thiserror::Error;

pub const VERSION_MANIFEST_URL: &str =
    "https://piston-meta.mojang.com/mc/game/version_manifest_v2.json";

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request to {url} failed after {attempts} attempt(s): {reason}")]
    Exhausted {
        url: String,
        attempts: u32,
        reason: String,
    },
    #[error("unexpected status {status} from {url}")]
    Status { url: String, status: u16 },
    #[error("checksum mismatch for {url}: expected {expected}, got {actual}")]
    HashMismatch {
        url: String,
        expected: String,
        actual: String,
    },
    #[error("invalid response body from {url}: {reason}")]
    Body { url: String, reason: String },
}

/// Digest the caller expects the fetched bytes to have.
/// Mojang publishes sha1 for server jars; bundle sources use sha256.
#[derive(Debug, Clone)]
pub enum ExpectedDigest {
    Sha256(String),
    Sha1(String),
}

impl ExpectedDigest {
    fn verify(&self, data: &[u8]) -> Result<(), (String, String)> {
        let (expected, actual) = match self {
            Self::Sha256(want) => (want.clone(), hex::encode(Sha256::digest(data))),
            Self::Sha1(want) => (want.clone(), hex::encode(Sha1::digest(data))),
        };
        if actual.eq_ignore_ascii_case(&expected) {
            Ok(())
        } else {
            Err((expected, actual))
        }
    }
}

pub struct Fetcher {
    client: reqwest::Client,
    max_attempts: u32,
    base_delay: Duration,
    /// Manifest URL; overridable for tests against a local fixture server.
    manifest_url: String,
}

impl Fetcher {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent("warden-core/0.1")
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            manifest_url: VERSION_MANIFEST_URL.to_string(),
        }
    }

    pub fn with_policy(mut self, max_attempts: u32, base_delay: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.base_delay = base_delay;
        self
    }

    #[allow(dead_code)] // 테스트/목서버용
    pub fn with_manifest_url(mut self, url: &str) -> Self {
        self.manifest_url = url.to_string();
        self
    }

    /// Fetch `url`, retrying transient failures, verifying `expected` if set.
    pub async fn fetch(
        &self,
        url: &str,
        expected: Option<&ExpectedDigest>,
    ) -> Result<Vec<u8>, FetchError> {
        let mut last_reason = String::new();

        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                let delay = self.base_delay * 2u32.pow(attempt - 2);
                tracing::debug!("Retrying {} in {:?} (attempt {})", url, delay, attempt);
                tokio::time::sleep(delay).await;
            }

            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let bytes = match resp.bytes().await {
                            Ok(b) => b,
                            Err(e) => {
                                last_reason = format!("body read failed: {}", e);
                                continue;
                            }
                        };
                        if let Some(digest) = expected {
                            if let Err((expected, actual)) = digest.verify(&bytes) {
                                return Err(FetchError::HashMismatch {
                                    url: url.to_string(),
                                    expected,
                                    actual,
                                });
                            }
                        }
                        return Ok(bytes.to_vec());
                    }
                    if status.is_server_error() {
                        last_reason = format!("server returned {}", status);
                        continue;
                    }
                    // 4xx 는 재시도해도 의미 없음
                    return Err(FetchError::Status {
                        url: url.to_string(),
                        status: status.as_u16(),
                    });
                }
                Err(e) => {
                    last_reason = e.to_string();
                    continue;
                }
            }
        }

        Err(FetchError::Exhausted {
            url: url.to_string(),
            attempts: self.max_attempts,
            reason: last_reason,
        })
    }

    async fn fetch_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let bytes = self.fetch(url, None).await?;
        serde_json::from_slice(&bytes).map_err(|e| FetchError::Body {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }

    /// Fetch Mojang's version manifest (all known game versions).
    pub async fn fetch_version_manifest(&self) -> Result<VersionManifest, FetchError> {
        self.fetch_json(&self.manifest_url.clone()).await
    }

    /// Fetch the per-version detail document a manifest entry points at.
    pub async fn fetch_version_detail(&self, url: &str) -> Result<VersionDetail, FetchError> {
        self.fetch_json(url).await
    }
}

impl Default for Fetcher {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Mojang version manifest models ──────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionManifest {
    pub latest: LatestVersions,
    pub versions: Vec<VersionEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatestVersions {
    pub release: String,
    pub snapshot: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    #[serde(default)]
    pub sha1: Option<String>,
}

impl VersionEntry {
    pub fn is_stable(&self) -> bool {
        self.kind == "release"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionDetail {
    pub downloads: VersionDownloads,
    #[serde(rename = "javaVersion", default)]
    pub java_version: Option<JavaVersionInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionDownloads {
    #[serde(default)]
    pub server: Option<DownloadInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadInfo {
    pub url: String,
    pub sha1: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JavaVersionInfo {
    #[serde(rename = "majorVersion")]
    pub major_version: u32,
}
