//! Streaming HTTPS downloads for disk and archive exports.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::application::ports::{DownloadRequest, Downloader};
use crate::domain::progress::ProgressTracker;

/// Downloads with `reqwest`, accepting the self-signed certificates
/// hypervisor hosts ship with.
pub struct HttpDownloader {
    http: reqwest::Client,
}

impl HttpDownloader {
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialised.
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .context("building HTTP client")?;
        Ok(Self { http })
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn download(
        &self,
        request: &DownloadRequest,
        dest: &Path,
        progress: &(dyn Fn(u8) + Send + Sync),
    ) -> Result<u64> {
        let mut builder = self.http.get(&request.url);
        if let Some((user, password)) = &request.basic_auth {
            builder = builder.basic_auth(user, Some(password));
        }
        let response = builder
            .send()
            .await
            .context("sending download request")?
            .error_for_status()
            .context("download refused")?;

        let mut tracker = ProgressTracker::new(response.content_length());
        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("creating {}", dest.display()))?;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("reading download body")?;
            file.write_all(&chunk)
                .await
                .with_context(|| format!("writing {}", dest.display()))?;
            if let Some(percent) = tracker.advance(chunk.len() as u64) {
                progress(percent);
            }
        }
        file.flush().await?;
        tracing::debug!(bytes = tracker.received(), dest = %dest.display(), "download complete");
        Ok(tracker.received())
    }
}
