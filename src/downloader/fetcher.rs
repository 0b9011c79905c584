// Retrying fetcher - one descriptor to one local file

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::errors::{DownloadError, TransferError};
use super::models::{
    DownloadJob, FetchResult, ProgressEvent, RequestContext, ResourceLocator, RetryPolicy,
    StreamDescriptor,
};
use super::progress::{TransferProgress, DEFAULT_PROGRESS_INTERVAL};
use super::traits::{MediaBackend, ProgressEmitter};
use super::utils::{file_len, part_path};

/// Per-item values every fetch of that item shares
#[derive(Debug, Clone)]
pub struct FetchSession {
    pub locator: ResourceLocator,
    pub context: RequestContext,
    pub retry: RetryPolicy,
    pub progress: ProgressEmitter,
    pub cancel: CancellationToken,
}

impl FetchSession {
    pub fn new(locator: ResourceLocator, context: RequestContext, retry: RetryPolicy) -> Self {
        Self {
            locator,
            context,
            retry,
            progress: ProgressEmitter::silent(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressEmitter) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[derive(Clone)]
pub struct RetryingFetcher {
    backend: Arc<dyn MediaBackend>,
    progress_interval: Duration,
}

impl RetryingFetcher {
    pub fn new(backend: Arc<dyn MediaBackend>) -> Self {
        Self {
            backend,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Fetch `descriptor` into `dest`.
    ///
    /// A non-empty file already at `dest` counts as complete and nothing is transferred;
    /// this is checked once, before the first attempt. Transfers go to `<dest>.part` and
    /// are renamed into place on success. Exhausted or fatal failures come back as
    /// `ok: false`; only filesystem errors and cancellation are `Err`.
    pub async fn fetch(
        &self,
        session: &FetchSession,
        descriptor: &StreamDescriptor,
        dest: &Path,
    ) -> Result<FetchResult, DownloadError> {
        let mut job = DownloadJob::new(descriptor.clone(), dest.to_path_buf());

        match file_len(dest).await? {
            Some(len) if len > 0 => {
                info!(path = %dest.display(), "Already downloaded, skipping");
                job.succeed();
                session.progress.emit(ProgressEvent::Skipped {
                    path: dest.to_path_buf(),
                });
                return Ok(FetchResult {
                    ok: true,
                    job,
                    skipped: true,
                    partial: None,
                });
            }
            Some(_) => {
                debug!(path = %dest.display(), "Removing empty leftover");
                tokio::fs::remove_file(dest)
                    .await
                    .map_err(|e| DownloadError::filesystem(dest, e))?;
            }
            None => {}
        }

        let part = part_path(dest);
        let progress = TransferProgress::new(
            descriptor.id.clone(),
            session.progress.clone(),
            self.progress_interval,
        );

        loop {
            if session.cancel.is_cancelled() {
                return Err(cancelled(&part).await);
            }

            job.start_attempt();
            let resume_from = file_len(&part).await?.unwrap_or(0);
            progress.begin_attempt(resume_from);
            debug!(
                format_id = %descriptor.id,
                attempt = job.attempts,
                resume_from,
                backend = self.backend.name(),
                "Transfer attempt"
            );

            let outcome = tokio::select! {
                biased;
                _ = session.cancel.cancelled() => return Err(cancelled(&part).await),
                result = self.backend.transfer(
                    &session.locator,
                    descriptor,
                    &part,
                    &session.context,
                    &progress,
                ) => result,
            };

            let message = match outcome {
                Ok(()) => {
                    tokio::fs::rename(&part, dest)
                        .await
                        .map_err(|e| DownloadError::filesystem(dest, e))?;
                    progress.finish();
                    job.succeed();
                    info!(
                        format_id = %descriptor.id,
                        attempts = job.attempts,
                        path = %dest.display(),
                        "Fetched"
                    );
                    return Ok(FetchResult {
                        ok: true,
                        job,
                        skipped: false,
                        partial: None,
                    });
                }
                Err(TransferError::Filesystem { path, source }) => {
                    job.give_up();
                    return Err(DownloadError::Filesystem { path, source });
                }
                Err(TransferError::Fatal(message)) => {
                    warn!(format_id = %descriptor.id, error = %message, "Transfer failed, not retrying");
                    job.record_failure(message);
                    job.give_up();
                    return Ok(failed(job, &part).await);
                }
                Err(TransferError::Transient(message)) => message,
            };

            job.record_failure(message.clone());
            if !session.retry.max_attempts.allows_another(job.attempts) {
                warn!(
                    format_id = %descriptor.id,
                    attempts = job.attempts,
                    error = %message,
                    "Retry budget exhausted"
                );
                job.give_up();
                return Ok(failed(job, &part).await);
            }

            let delay = session.retry.backoff.delay_for(job.attempts);
            warn!(
                format_id = %descriptor.id,
                attempt = job.attempts,
                max_attempts = %session.retry.max_attempts,
                delay_secs = delay.as_secs_f64(),
                error = %message,
                "Transfer failed, retrying"
            );
            session.progress.emit(ProgressEvent::Retrying {
                stream: descriptor.id.clone(),
                attempt: job.attempts,
                delay_seconds: delay.as_secs(),
                error: message,
            });

            tokio::select! {
                biased;
                _ = session.cancel.cancelled() => return Err(cancelled(&part).await),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

async fn partial_on_disk(part: &Path) -> Option<PathBuf> {
    match file_len(part).await {
        Ok(Some(_)) => Some(part.to_path_buf()),
        _ => None,
    }
}

async fn failed(job: DownloadJob, part: &Path) -> FetchResult {
    FetchResult {
        ok: false,
        job,
        skipped: false,
        partial: partial_on_disk(part).await,
    }
}

async fn cancelled(part: &Path) -> DownloadError {
    DownloadError::Cancelled {
        left_on_disk: partial_on_disk(part).await.into_iter().collect(),
    }
}
