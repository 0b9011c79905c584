// Front-ends: terminal menu, console wizard, web form

pub mod menu;
pub mod prompt;
pub mod render;
pub mod web;
pub mod wizard;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::downloader::backends::{FfmpegMerger, YtDlpBackend};
use crate::downloader::fetcher::FetchSession;
use crate::downloader::models::{
    Catalog, DownloadRequest, FinalOutput, MediaKind, PlaylistReport, QualityRequest,
    ResourceLocator,
};
use crate::downloader::tools::ToolManager;
use crate::downloader::traits::{MediaBackend, MergeTool, ProgressEmitter};
use crate::downloader::{DownloadError, Downloader};

/// What every front-end needs: a wired pipeline plus the loaded settings
pub struct AppContext {
    pub downloader: Downloader,
    pub config: Config,
}

impl AppContext {
    /// Locate yt-dlp and ffmpeg and wire the real backends
    pub fn from_config(config: Config) -> Result<Self> {
        let tools = ToolManager::new(config.tool_paths());
        let backend = Arc::new(YtDlpBackend::new(tools.ytdlp_command()?));
        let merger = Arc::new(FfmpegMerger::new(tools.ffmpeg_command()?));
        Ok(Self::new(config, backend, merger))
    }

    pub fn new(config: Config, backend: Arc<dyn MediaBackend>, merger: Arc<dyn MergeTool>) -> Self {
        let downloader =
            Downloader::new(backend, merger).with_playlist_workers(config.download.playlist_workers);
        Self { downloader, config }
    }

    /// Video requests get the configured container filter, audio takes any
    pub fn quality(&self, request: QualityRequest) -> QualityRequest {
        match request.kind {
            MediaKind::Video if request.container.is_none() => {
                request.with_container(self.config.preferred_container())
            }
            _ => request,
        }
    }

    pub fn request(
        &self,
        locator: ResourceLocator,
        quality: QualityRequest,
        folder: Option<PathBuf>,
    ) -> DownloadRequest {
        DownloadRequest::new(
            locator,
            self.quality(quality),
            folder.unwrap_or_else(|| self.config.download.folder.clone()),
        )
        .with_retry(self.config.retry_policy())
        .with_context(self.config.request_context())
    }

    /// Single item with progress printed to stderr
    pub async fn run_single(
        &self,
        request: &DownloadRequest,
        cancel: CancellationToken,
    ) -> Result<FinalOutput, DownloadError> {
        let (emitter, rx) = ProgressEmitter::channel();
        let printer = render::spawn_progress_printer(rx);
        let result = self.downloader.download(request, emitter, cancel).await;
        let _ = printer.await;
        result
    }

    /// Like `run_single` for an item the caller has already resolved
    pub async fn run_with_catalog(
        &self,
        request: &DownloadRequest,
        catalog: &Catalog,
        cancel: CancellationToken,
    ) -> Result<FinalOutput, DownloadError> {
        let (emitter, rx) = ProgressEmitter::channel();
        let printer = render::spawn_progress_printer(rx);
        let session = FetchSession::new(
            request.locator.clone(),
            request.context.clone(),
            request.retry,
        )
        .with_progress(emitter)
        .with_cancel(cancel);
        let result = self
            .downloader
            .download_with_catalog(request, catalog, &session)
            .await;
        drop(session);
        let _ = printer.await;
        result
    }

    pub async fn run_playlist(
        &self,
        request: &DownloadRequest,
        cancel: CancellationToken,
    ) -> Result<PlaylistReport, DownloadError> {
        let (emitter, rx) = ProgressEmitter::channel();
        let printer = render::spawn_progress_printer(rx);
        let result = self
            .downloader
            .download_playlist(request, emitter, cancel)
            .await;
        let _ = printer.await;
        result
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::downloader::testing::{FakeBackend, FakeMerger};

    pub fn app(backend: FakeBackend, folder: &std::path::Path) -> (AppContext, Arc<FakeBackend>) {
        let backend = Arc::new(backend);
        let mut config = Config::default();
        config.download.folder = folder.to_path_buf();
        config.download.backoff_seconds = 0;
        let app = AppContext::new(config, backend.clone(), Arc::new(FakeMerger::new()));
        (app, backend)
    }
}
