// Reconciler - turns fetched stream file(s) into the final output

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use super::errors::DownloadError;
use super::fetcher::{FetchSession, RetryingFetcher};
use super::models::{DownloadJob, FinalOutput, MergeTask, ProgressEvent, Selection};
use super::traits::{MergeTool, ProgressEmitter};
use super::utils::{remove_if_exists, OutputPlan};

pub struct Reconciler {
    fetcher: RetryingFetcher,
    merger: Arc<dyn MergeTool>,
}

impl Reconciler {
    pub fn new(fetcher: RetryingFetcher, merger: Arc<dyn MergeTool>) -> Self {
        Self { fetcher, merger }
    }

    /// Single selections pass through untouched. Pairs get their audio fetched next to
    /// the video intermediate and both are merged into `plan.final_path()`.
    pub async fn reconcile(
        &self,
        video_job: DownloadJob,
        selection: &Selection,
        plan: &OutputPlan,
        session: &FetchSession,
    ) -> Result<FinalOutput, DownloadError> {
        let audio = match selection {
            Selection::Single(_) => {
                return Ok(FinalOutput {
                    path: video_job.destination,
                    merged: false,
                    skipped: false,
                })
            }
            Selection::Pair { audio, .. } => audio,
        };

        let audio_path = plan.audio_intermediate();
        let fetched = self.fetcher.fetch(session, audio, &audio_path).await?;
        if !fetched.ok {
            return Err(fetched.into_error(&[video_job.destination.clone()]));
        }

        let task = MergeTask {
            video: video_job,
            audio: fetched.job,
            output: plan.final_path(),
        };
        self.merge(task, plan.merge_temp(), &session.progress).await
    }

    /// Run the merge tool into `temp`, then rename onto the task output. Intermediates are
    /// removed only after the rename; on failure they stay and `temp` goes.
    pub async fn merge(
        &self,
        task: MergeTask,
        temp: PathBuf,
        progress: &ProgressEmitter,
    ) -> Result<FinalOutput, DownloadError> {
        let MergeTask {
            video,
            audio,
            output,
        } = task;

        remove_if_exists(&temp)
            .await
            .map_err(|e| DownloadError::filesystem(&temp, e))?;

        progress.emit(ProgressEvent::Merging {
            output: output.clone(),
        });
        info!(
            tool = self.merger.name(),
            video = %video.destination.display(),
            audio = %audio.destination.display(),
            output = %output.display(),
            "Merging streams"
        );

        if let Err(message) = self
            .merger
            .merge(&video.destination, &audio.destination, &temp)
            .await
        {
            if let Err(e) = remove_if_exists(&temp).await {
                warn!(path = %temp.display(), error = %e, "Could not remove partial merge output");
            }
            warn!(error = %message, "Merge failed, keeping intermediates");
            return Err(DownloadError::Merge {
                message,
                video: video.destination,
                audio: audio.destination,
            });
        }

        tokio::fs::rename(&temp, &output)
            .await
            .map_err(|e| DownloadError::filesystem(&output, e))?;

        for intermediate in [&video.destination, &audio.destination] {
            if let Err(e) = remove_if_exists(intermediate).await {
                warn!(path = %intermediate.display(), error = %e, "Could not remove intermediate");
            }
        }

        Ok(FinalOutput {
            path: output,
            merged: true,
            skipped: false,
        })
    }
}
