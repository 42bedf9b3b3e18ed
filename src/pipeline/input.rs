//! Input resolution: load a user-supplied path or URL into PDF bytes.
//!
//! The pipeline operates on in-memory bytes (pdfium can load from a slice),
//! so downloads never touch the filesystem. The `%PDF` magic is checked
//! before returning so a mislabelled upload fails with a clear error instead
//! of a pdfium parse failure deep inside a worker.

use crate::error::AnalysisError;
use std::path::PathBuf;
use tracing::{debug, info};

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve the input string to the document's bytes.
pub async fn load_document(input: &str, timeout_secs: u64) -> Result<Vec<u8>, AnalysisError> {
    let bytes = if is_url(input) {
        download_url(input, timeout_secs).await?
    } else {
        read_local(input).await?
    };
    validate_pdf(&bytes)?;
    Ok(bytes)
}

/// Reject anything that is empty or does not start with `%PDF`.
pub fn validate_pdf(bytes: &[u8]) -> Result<(), AnalysisError> {
    if bytes.is_empty() {
        return Err(AnalysisError::Validation("document is empty".into()));
    }
    if !bytes.starts_with(b"%PDF") {
        let mut magic = [0u8; 4];
        let n = bytes.len().min(4);
        magic[..n].copy_from_slice(&bytes[..n]);
        return Err(AnalysisError::NotAPdf { magic });
    }
    Ok(())
}

async fn read_local(path_str: &str) -> Result<Vec<u8>, AnalysisError> {
    if path_str.trim().is_empty() {
        return Err(AnalysisError::InvalidInput {
            input: path_str.to_string(),
        });
    }
    let path = PathBuf::from(path_str);
    let bytes = tokio::fs::read(&path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => AnalysisError::FileNotFound { path: path.clone() },
        _ => AnalysisError::Internal(format!("reading {}: {}", path.display(), e)),
    })?;
    debug!("Read local PDF: {} ({} bytes)", path.display(), bytes.len());
    Ok(bytes)
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<Vec<u8>, AnalysisError> {
    info!("Downloading PDF from: {}", url);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| AnalysisError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            AnalysisError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            AnalysisError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    })?;

    if !response.status().is_success() {
        return Err(AnalysisError::DownloadFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| AnalysisError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    info!("Downloaded {} bytes", bytes.len());
    Ok(bytes.to_vec())
}
