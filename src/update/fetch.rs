//! Artifact download.
//!
//! The fetcher walks a ranked list of [`DownloadSource`]s and returns
//! the first fully verified artifact. Verification means a success
//! status, a non-empty body, and, when the source declares one, a
//! SHA-256 checksum computed while the body streams to disk. A failed
//! attempt never leaves a partial file behind.

use crate::error::{Error, Result};
use crate::update::source::DownloadSource;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// A downloaded artifact waiting to be swapped in.
#[derive(Debug, Clone)]
pub struct StagedArtifact {
    /// Where the artifact was written.
    pub path: PathBuf,
    /// Size in bytes.
    pub bytes: u64,
    /// Hex-encoded SHA-256 of the content.
    pub checksum: String,
}

/// Downloads artifacts from ranked sources.
pub struct Fetcher {
    client: reqwest::Client,
}

impl Fetcher {
    /// Create a fetcher using `client` for all transfers.
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Try each source in rank order until one yields a verified artifact.
    ///
    /// Sources without a resolved URL are skipped without counting as a
    /// failure. After this returns, either exactly one verified file
    /// exists at `destination` (success) or none does (error).
    ///
    /// # Errors
    ///
    /// Returns [`Error::DownloadExhausted`] naming the last per-source
    /// failure once every source has been tried.
    pub async fn fetch(
        &self,
        sources: &[DownloadSource],
        destination: &Path,
    ) -> Result<StagedArtifact> {
        let mut attempts = 0_usize;
        let mut last_error = String::from("no download sources configured");

        for source in sources {
            let Some(url) = &source.url else {
                debug!("Skipping download source '{}': no URL resolved", source.name);
                continue;
            };
            attempts += 1;
            info!("Downloading from {}: {url}", source.name);
            match self
                .fetch_one(url, source.checksum.as_deref(), destination)
                .await
            {
                Ok(artifact) => {
                    info!(
                        "Downloaded {} bytes from {} (sha256 {})",
                        artifact.bytes, source.name, artifact.checksum
                    );
                    return Ok(artifact);
                }
                Err(e) => {
                    warn!("Download source '{}' failed: {e}", source.name);
                    last_error = e.to_string();
                }
            }
        }

        Err(Error::DownloadExhausted {
            attempts,
            last: last_error,
        })
    }

    /// Download one URL, deleting the partial file on any failure.
    async fn fetch_one(
        &self,
        url: &str,
        declared_checksum: Option<&str>,
        destination: &Path,
    ) -> Result<StagedArtifact> {
        match self.stream_to_file(url, declared_checksum, destination).await {
            Ok(artifact) => Ok(artifact),
            Err(e) => {
                let _ = tokio::fs::remove_file(destination).await;
                Err(e)
            }
        }
    }

    async fn stream_to_file(
        &self,
        url: &str,
        declared_checksum: Option<&str>,
        destination: &Path,
    ) -> Result<StagedArtifact> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Download(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Download(format!("HTTP {status}")));
        }

        let mut file = tokio::fs::File::create(destination).await?;
        let mut hasher = Sha256::new();
        let mut bytes: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::Download(format!("transfer failed: {e}")))?;
            hasher.update(&chunk);
            bytes += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        if bytes == 0 {
            return Err(Error::Download("empty response body".to_string()));
        }

        let actual = hex::encode(hasher.finalize());
        if let Some(expected) = declared_checksum {
            if !expected.trim().eq_ignore_ascii_case(&actual) {
                return Err(Error::ChecksumMismatch {
                    expected: expected.trim().to_string(),
                    actual,
                });
            }
        }

        Ok(StagedArtifact {
            path: destination.to_path_buf(),
            bytes,
            checksum: actual,
        })
    }
}
