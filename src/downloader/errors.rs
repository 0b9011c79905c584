// Error types for the retrieval pipeline

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::diagnostics::{diagnose_error, explain};

#[derive(Debug, Error)]
pub enum DownloadError {
    /// The request itself is unusable (empty locator, bad tier name, ...)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Metadata service unreachable or returned something we could not parse.
    /// Never retried by the pipeline.
    #[error("Could not resolve {locator}: {reason}")]
    Resolution { locator: String, reason: String },

    /// Catalog has nothing that satisfies the request
    #[error("No matching format: {request}")]
    NoMatchingFormat { request: String },

    /// Retry budget exhausted, or the transfer failed in a way retrying cannot fix
    #[error("Fetch of format {format_id} failed after {attempts} attempt(s): {cause}{}", on_disk(.left_on_disk))]
    Fetch {
        format_id: String,
        attempts: u32,
        cause: String,
        left_on_disk: Vec<PathBuf>,
    },

    /// External merge tool failed. Both intermediates are kept for manual recovery.
    #[error("Merge failed: {message}{}", kept_intermediates(.video, .audio))]
    Merge {
        message: String,
        video: PathBuf,
        audio: PathBuf,
    },

    /// Destination unwritable. Surfaced immediately, never retried.
    #[error("Filesystem error at {}: {source}", .path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Cancelled{}", on_disk(.left_on_disk))]
    Cancelled { left_on_disk: Vec<PathBuf> },
}

fn on_disk(paths: &[PathBuf]) -> String {
    if paths.is_empty() {
        return String::new();
    }
    let listed: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
    format!(" (left on disk: {})", listed.join(", "))
}

fn kept_intermediates(video: &Path, audio: &Path) -> String {
    format!(
        " (intermediates kept: {}, {})",
        video.display(),
        audio.display()
    )
}

impl DownloadError {
    pub fn filesystem(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Filesystem {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn resolution(locator: impl ToString, reason: impl Into<String>) -> Self {
        Self::Resolution {
            locator: locator.to_string(),
            reason: reason.into(),
        }
    }

    pub fn no_match(request: impl ToString) -> Self {
        Self::NoMatchingFormat {
            request: request.to_string(),
        }
    }

    /// Files the failed operation left behind, so an operator can resume or clean up
    pub fn left_on_disk(&self) -> Vec<PathBuf> {
        match self {
            Self::Fetch { left_on_disk, .. } | Self::Cancelled { left_on_disk } => {
                left_on_disk.clone()
            }
            Self::Merge { video, audio, .. } => vec![video.clone(), audio.clone()],
            Self::Filesystem { path, .. } if path.exists() => vec![path.clone()],
            _ => Vec::new(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Failure of a single transfer attempt, as reported by a backend
#[derive(Debug, Error)]
pub enum TransferError {
    /// Worth another attempt: network errors, 5xx, throttling, short writes
    #[error("{0}")]
    Transient(String),

    /// Retrying will not help: unknown format id, removed video, 404, ...
    #[error("{0}")]
    Fatal(String),

    /// Local write failed
    #[error("{}: {source}", .path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl TransferError {
    pub fn filesystem(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Filesystem {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Classify an HTTP status from a direct transfer
    pub fn from_status(status: u16, url_hint: &str) -> Self {
        let message = format!("HTTP {} while fetching {}", status, url_hint);
        match status {
            403 | 408 | 429 => Self::Transient(message),
            500..=599 => Self::Transient(message),
            _ => Self::Fatal(message),
        }
    }
}

// Backend stderr comes in as free text; sort it into transient vs fatal
impl From<String> for TransferError {
    fn from(s: String) -> Self {
        let message = explain(&s);
        match diagnose_error(&s) {
            Some(reason) if reason.is_permanent() => Self::Fatal(message),
            _ => Self::Transient(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stderr_classification() {
        let err = TransferError::from("ERROR: HTTP Error 503: Service Unavailable".to_string());
        assert!(err.is_transient());

        let err = TransferError::from("ERROR: Requested format is not available".to_string());
        assert!(!err.is_transient());

        let err = TransferError::from("ERROR: [youtube] abc: Video unavailable".to_string());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_status_classification() {
        assert!(TransferError::from_status(503, "x").is_transient());
        assert!(TransferError::from_status(429, "x").is_transient());
        assert!(!TransferError::from_status(404, "x").is_transient());
    }

    #[test]
    fn test_failure_message_names_leftovers() {
        let err = DownloadError::Fetch {
            format_id: "137".to_string(),
            attempts: 3,
            cause: "connection reset".to_string(),
            left_on_disk: vec![PathBuf::from("out/a_video.mp4.part")],
        };
        let text = err.to_string();
        assert!(text.contains("connection reset"));
        assert!(text.contains("out/a_video.mp4.part"));
        assert_eq!(err.left_on_disk().len(), 1);
    }

    #[test]
    fn test_merge_error_keeps_tool_message() {
        let err = DownloadError::Merge {
            message: "Invalid data found when processing input".to_string(),
            video: PathBuf::from("out/t_video.mp4"),
            audio: PathBuf::from("out/t_audio.mp4"),
        };
        let text = err.to_string();
        assert!(text.contains("Invalid data found"));
        assert!(text.contains("t_video.mp4"));
        assert!(text.contains("t_audio.mp4"));
    }
}
