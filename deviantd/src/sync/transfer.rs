use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use url::Url;

pub const PARTIAL_SUFFIX: &str = "partial";

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("asset host returned {0}")]
    Status(StatusCode),
    #[error("refusing to overwrite {0}")]
    DestinationExists(PathBuf),
}

impl TransferError {
    /// The asset itself is gone or forbidden, as opposed to a failed fetch.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            TransferError::Status(
                StatusCode::FORBIDDEN | StatusCode::NOT_FOUND | StatusCode::GONE
            )
        )
    }
}

#[derive(Clone)]
pub struct TransferClient {
    http: Client,
}

impl TransferClient {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }

    pub fn with_http(http: Client) -> Self {
        Self { http }
    }

    pub fn build_http(user_agent: &str, timeout: Duration) -> Result<Client, reqwest::Error> {
        Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
    }

    /// Streams `href` into `target` through a `.partial` sibling and renames
    /// it into place. Never replaces an existing file. Returns bytes written.
    pub async fn download_to_path(&self, href: &str, target: &Path) -> Result<u64, TransferError> {
        if target.exists() {
            return Err(TransferError::DestinationExists(target.to_path_buf()));
        }
        let url = Url::parse(href)?;
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::Status(status));
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(target);
        match write_stream(response, &partial).await {
            Ok(written) => {
                if target.exists() {
                    let _ = tokio::fs::remove_file(&partial).await;
                    return Err(TransferError::DestinationExists(target.to_path_buf()));
                }
                tokio::fs::rename(&partial, target).await?;
                Ok(written)
            }
            Err(err) => {
                let _ = tokio::fs::remove_file(&partial).await;
                Err(err)
            }
        }
    }
}

impl Default for TransferClient {
    fn default() -> Self {
        Self::new()
    }
}

async fn write_stream(response: reqwest::Response, partial: &Path) -> Result<u64, TransferError> {
    let mut file = tokio::fs::File::create(partial).await?;
    let mut stream = response.bytes_stream();
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}

pub fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}{PARTIAL_SUFFIX}",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}
