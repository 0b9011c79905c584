// Backend and merge-tool trait definitions

use std::path::Path;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::errors::{DownloadError, TransferError};
use super::models::{
    Catalog, PlaylistEntry, ProgressEvent, RequestContext, ResourceLocator, SearchHit,
    StreamDescriptor,
};
use super::progress::TransferProgress;

/// Remote format-resolution and transfer service
#[async_trait]
pub trait MediaBackend: Send + Sync {
    /// Name of the backend (for logging)
    fn name(&self) -> &'static str;

    /// Metadata for one item. An item with no formats is an empty catalog, not an error.
    async fn resolve(
        &self,
        locator: &ResourceLocator,
        ctx: &RequestContext,
    ) -> Result<Catalog, DownloadError>;

    /// Flat listing of a collection, in collection order
    async fn resolve_collection(
        &self,
        locator: &ResourceLocator,
        ctx: &RequestContext,
    ) -> Result<Vec<PlaylistEntry>, DownloadError>;

    async fn search(
        &self,
        query: &str,
        limit: usize,
        ctx: &RequestContext,
    ) -> Result<Vec<SearchHit>, DownloadError>;

    /// One transfer attempt of `descriptor` into `dest`. `dest` may already hold a
    /// partial file from an earlier attempt; implementations resume it when they can.
    async fn transfer(
        &self,
        locator: &ResourceLocator,
        descriptor: &StreamDescriptor,
        dest: &Path,
        ctx: &RequestContext,
        progress: &TransferProgress,
    ) -> Result<(), TransferError>;
}

/// External tool joining a video-only and an audio-only file
#[async_trait]
pub trait MergeTool: Send + Sync {
    fn name(&self) -> &'static str;

    /// Err carries the tool's own message
    async fn merge(&self, video: &Path, audio: &Path, output: &Path) -> Result<(), String>;
}

/// Progress emitter helper
#[derive(Debug, Clone, Default)]
pub struct ProgressEmitter {
    sender: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl ProgressEmitter {
    pub fn new(sender: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    /// Emitter plus the receiving end, for front-ends that render progress
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Drops every event
    pub fn silent() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: ProgressEvent) {
        if let Some(sender) = &self.sender {
            // Receiver gone means nobody is watching; the pipeline carries on
            let _ = sender.send(event);
        }
    }
}
