// Orchestrator - resolve, select, fetch, reconcile for items and playlists

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::errors::DownloadError;
use super::fetcher::{FetchSession, RetryingFetcher};
use super::format_selector::FormatSelector;
use super::models::{
    Catalog, DownloadRequest, EntryOutcome, EntryStatus, FinalOutput, PlaylistEntry,
    PlaylistReport, PlaylistRun, ProgressEvent, RequestContext, ResourceLocator, SearchHit,
    Selection,
};
use super::progress::DEFAULT_PROGRESS_INTERVAL;
use super::reconciler::Reconciler;
use super::traits::{MediaBackend, MergeTool, ProgressEmitter};
use super::utils::{ensure_folder, file_len, OutputPlan};

pub struct Downloader {
    backend: Arc<dyn MediaBackend>,
    fetcher: RetryingFetcher,
    reconciler: Reconciler,
    playlist_workers: usize,
}

impl Downloader {
    pub fn new(backend: Arc<dyn MediaBackend>, merger: Arc<dyn MergeTool>) -> Self {
        Self::with_progress_interval(backend, merger, DEFAULT_PROGRESS_INTERVAL)
    }

    pub fn with_progress_interval(
        backend: Arc<dyn MediaBackend>,
        merger: Arc<dyn MergeTool>,
        interval: Duration,
    ) -> Self {
        let fetcher = RetryingFetcher::new(backend.clone()).with_progress_interval(interval);
        Self {
            reconciler: Reconciler::new(fetcher.clone(), merger),
            fetcher,
            backend,
            playlist_workers: 1,
        }
    }

    /// Entries processed at once during a playlist run (at least 1)
    pub fn with_playlist_workers(mut self, workers: usize) -> Self {
        self.playlist_workers = workers.max(1);
        self
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub async fn resolve(
        &self,
        locator: &ResourceLocator,
        ctx: &RequestContext,
    ) -> Result<Catalog, DownloadError> {
        info!(locator = %locator, backend = self.backend.name(), "Resolving formats");
        let catalog = self.backend.resolve(locator, ctx).await?;
        if catalog.is_empty() {
            warn!(locator = %locator, "Item exposes no formats");
        }
        Ok(catalog)
    }

    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        ctx: &RequestContext,
    ) -> Result<Vec<SearchHit>, DownloadError> {
        self.backend.search(query, limit, ctx).await
    }

    pub async fn list_collection(
        &self,
        locator: &ResourceLocator,
        ctx: &RequestContext,
    ) -> Result<Vec<PlaylistEntry>, DownloadError> {
        self.backend.resolve_collection(locator, ctx).await
    }

    /// Resolve, select, fetch and reconcile one item
    pub async fn download(
        &self,
        request: &DownloadRequest,
        progress: ProgressEmitter,
        cancel: CancellationToken,
    ) -> Result<FinalOutput, DownloadError> {
        let session = session_for(request, &request.locator, progress, cancel);
        session.progress.emit(ProgressEvent::Resolving {
            locator: request.locator.to_string(),
        });

        let catalog = tokio::select! {
            biased;
            _ = session.cancel.cancelled() => {
                return Err(DownloadError::Cancelled { left_on_disk: Vec::new() })
            }
            result = self.resolve(&request.locator, &request.context) => result?,
        };

        self.download_with_catalog(request, &catalog, &session).await
    }

    /// The part of `download` after resolution, for callers that already hold a catalog
    pub async fn download_with_catalog(
        &self,
        request: &DownloadRequest,
        catalog: &Catalog,
        session: &FetchSession,
    ) -> Result<FinalOutput, DownloadError> {
        let selection = FormatSelector::resolve_choice(catalog, &request.quality)?;

        // A search query could match something else on the next call; transfers use the
        // page the catalog came from
        let pinned;
        let session = match pinned_locator(&session.locator, catalog) {
            Some(locator) => {
                pinned = FetchSession {
                    locator,
                    ..session.clone()
                };
                &pinned
            }
            None => session,
        };

        session.progress.emit(ProgressEvent::Selected {
            summary: describe(&selection),
        });

        ensure_folder(&request.folder).await?;
        let plan = OutputPlan::new(&request.folder, &catalog.title, selection.container());
        let final_path = plan.final_path();

        if file_len(&final_path).await?.map_or(false, |len| len > 0) {
            info!(path = %final_path.display(), "Output exists, skipping");
            session.progress.emit(ProgressEvent::Skipped {
                path: final_path.clone(),
            });
            return Ok(FinalOutput {
                path: final_path,
                merged: false,
                skipped: true,
            });
        }

        let video_dest = if selection.needs_merge() {
            plan.video_intermediate()
        } else {
            final_path
        };

        let fetched = self
            .fetcher
            .fetch(session, selection.primary(), &video_dest)
            .await?;
        if !fetched.ok {
            return Err(fetched.into_error(&[]));
        }

        let output = self
            .reconciler
            .reconcile(fetched.job, &selection, &plan, session)
            .await?;

        info!(path = %output.path.display(), merged = output.merged, "Done");
        session.progress.emit(ProgressEvent::Finished {
            path: output.path.clone(),
        });
        Ok(output)
    }

    /// Download every entry of a collection with one quality policy.
    ///
    /// The policy comes from the first entry: an explicit format id becomes the chosen
    /// descriptor's resolution tier, audio becomes "best". A failing entry is recorded
    /// and the run moves on.
    pub async fn download_playlist(
        &self,
        request: &DownloadRequest,
        progress: ProgressEmitter,
        cancel: CancellationToken,
    ) -> Result<PlaylistReport, DownloadError> {
        info!(locator = %request.locator, "Resolving playlist");
        progress.emit(ProgressEvent::Resolving {
            locator: request.locator.to_string(),
        });
        let entries = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled { left_on_disk: Vec::new() }),
            result = self.backend.resolve_collection(&request.locator, &request.context) => result?,
        };

        if entries.is_empty() {
            warn!(locator = %request.locator, "Playlist has no entries");
            return Ok(PlaylistReport::default());
        }

        let first_catalog = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled { left_on_disk: Vec::new() }),
            result = self.resolve(&entries[0].locator, &request.context) => result,
        };
        let mut first = Some(first_catalog);
        let chosen: Option<Selection> = match &first {
            Some(Ok(catalog)) => FormatSelector::resolve_choice(catalog, &request.quality).ok(),
            _ => None,
        };
        let policy = request.quality.as_tier_policy(chosen.as_ref());
        info!(entries = entries.len(), policy = %policy, "Playlist policy");

        let run = PlaylistRun {
            entries,
            folder: request.folder.clone(),
            policy,
        };
        let total = run.entries.len();
        let run = &run;

        let outcomes: Vec<EntryOutcome> = stream::iter(run.entries.iter().enumerate())
            .map(|(index, entry)| {
                let prefetched = if index == 0 { first.take() } else { None };
                self.run_entry(
                    request,
                    run,
                    index,
                    total,
                    entry,
                    prefetched,
                    progress.clone(),
                    cancel.clone(),
                )
            })
            .buffered(self.playlist_workers)
            .collect()
            .await;

        let report = PlaylistReport { outcomes };
        info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            "Playlist finished"
        );
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_entry(
        &self,
        request: &DownloadRequest,
        run: &PlaylistRun,
        index: usize,
        total: usize,
        entry: &PlaylistEntry,
        prefetched: Option<Result<Catalog, DownloadError>>,
        progress: ProgressEmitter,
        cancel: CancellationToken,
    ) -> EntryOutcome {
        info!(index = index + 1, total, title = %entry.title, "Playlist entry");
        progress.emit(ProgressEvent::EntryStarted {
            index,
            total,
            title: entry.title.clone(),
        });

        let entry_request = DownloadRequest {
            locator: entry.locator.clone(),
            quality: run.policy.clone(),
            retry: request.retry,
            folder: run.folder.clone(),
            context: request.context.clone(),
        };

        let result = if cancel.is_cancelled() {
            Err(DownloadError::Cancelled {
                left_on_disk: Vec::new(),
            })
        } else {
            match prefetched {
                Some(Ok(catalog)) => {
                    let session =
                        session_for(&entry_request, &entry_request.locator, progress, cancel);
                    self.download_with_catalog(&entry_request, &catalog, &session)
                        .await
                }
                Some(Err(e)) => Err(e),
                None => self.download(&entry_request, progress, cancel).await,
            }
        };

        let status = match result {
            Ok(output) => EntryStatus::Done(output),
            Err(e) => {
                warn!(index = index + 1, title = %entry.title, error = %e, "Playlist entry failed");
                EntryStatus::Failed {
                    reason: e.to_string(),
                    left_on_disk: e.left_on_disk(),
                }
            }
        };

        EntryOutcome {
            index,
            title: entry.title.clone(),
            locator: entry.locator.clone(),
            status,
        }
    }
}

fn session_for(
    request: &DownloadRequest,
    locator: &ResourceLocator,
    progress: ProgressEmitter,
    cancel: CancellationToken,
) -> FetchSession {
    FetchSession::new(locator.clone(), request.context.clone(), request.retry)
        .with_progress(progress)
        .with_cancel(cancel)
}

fn pinned_locator(locator: &ResourceLocator, catalog: &Catalog) -> Option<ResourceLocator> {
    if locator.is_link() {
        return None;
    }
    catalog
        .webpage_url
        .as_deref()
        .and_then(|url| ResourceLocator::new(url).ok())
}

fn describe(selection: &Selection) -> String {
    match selection {
        Selection::Single(d) => d.summary(),
        Selection::Pair { video, audio } => format!("{} + {}", video.summary(), audio.summary()),
    }
}
