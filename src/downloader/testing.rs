// In-memory backend and merge tool for pipeline tests

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::errors::{DownloadError, TransferError};
use super::models::{
    Catalog, PlaylistEntry, RequestContext, ResourceLocator, SearchHit, StreamDescriptor,
    StreamKind,
};
use super::progress::TransferProgress;
use super::traits::{MediaBackend, MergeTool};

pub fn video(id: &str, label: &str, height: u32, kbps: Option<f64>) -> StreamDescriptor {
    StreamDescriptor {
        id: id.to_string(),
        kind: StreamKind::Video,
        resolution_label: Some(label.to_string()),
        container: "mp4".to_string(),
        video_codec: Some("avc1.640028".to_string()),
        audio_codec: Some("none".to_string()),
        bitrate_kbps: kbps,
        size_bytes: None,
        size_is_exact: false,
        height: Some(height),
        protocol: Some("https".to_string()),
    }
}

pub fn muxed(id: &str, label: &str, height: u32, kbps: Option<f64>) -> StreamDescriptor {
    StreamDescriptor {
        kind: StreamKind::Muxed,
        audio_codec: Some("mp4a.40.2".to_string()),
        ..video(id, label, height, kbps)
    }
}

pub fn audio(id: &str, kbps: Option<f64>) -> StreamDescriptor {
    StreamDescriptor {
        id: id.to_string(),
        kind: StreamKind::Audio,
        resolution_label: None,
        container: "m4a".to_string(),
        video_codec: Some("none".to_string()),
        audio_codec: Some("mp4a.40.2".to_string()),
        bitrate_kbps: kbps,
        size_bytes: None,
        size_is_exact: false,
        height: None,
        protocol: Some("https".to_string()),
    }
}

pub fn catalog(title: &str, formats: Vec<StreamDescriptor>) -> Catalog {
    Catalog {
        title: title.to_string(),
        duration_seconds: None,
        uploader: None,
        webpage_url: None,
        formats,
    }
}

pub fn locator(raw: &str) -> ResourceLocator {
    ResourceLocator::new(raw).unwrap()
}

#[derive(Debug, Clone)]
pub enum Failure {
    Transient(&'static str),
    Fatal(&'static str),
}

impl Failure {
    fn to_error(&self) -> TransferError {
        match self {
            Self::Transient(msg) => TransferError::Transient(msg.to_string()),
            Self::Fatal(msg) => TransferError::Fatal(msg.to_string()),
        }
    }
}

/// Backend serving canned catalogs and writing `data:<id>` for every transfer.
/// Scripted failures are consumed per format id before transfers start succeeding.
#[derive(Default)]
pub struct FakeBackend {
    catalogs: HashMap<String, Catalog>,
    collections: HashMap<String, Vec<PlaylistEntry>>,
    scripted: Mutex<HashMap<String, VecDeque<Failure>>>,
    always_failing: HashMap<String, Failure>,
    transfers: Mutex<HashMap<String, u32>>,
    total_transfers: AtomicU32,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_catalog(mut self, locator: &str, catalog: Catalog) -> Self {
        self.catalogs.insert(locator.to_string(), catalog);
        self
    }

    pub fn with_collection(mut self, locator: &str, entries: &[(&str, &str)]) -> Self {
        let entries = entries
            .iter()
            .map(|(title, url)| PlaylistEntry {
                title: title.to_string(),
                locator: ResourceLocator::new(*url).unwrap(),
            })
            .collect();
        self.collections.insert(locator.to_string(), entries);
        self
    }

    pub fn failing(self, format_id: &str, failures: Vec<Failure>) -> Self {
        self.scripted
            .lock()
            .unwrap()
            .insert(format_id.to_string(), failures.into());
        self
    }

    pub fn always_failing(mut self, format_id: &str, failure: Failure) -> Self {
        self.always_failing.insert(format_id.to_string(), failure);
        self
    }

    pub fn transfers(&self) -> u32 {
        self.total_transfers.load(Ordering::SeqCst)
    }

    pub fn transfers_of(&self, format_id: &str) -> u32 {
        self.transfers
            .lock()
            .unwrap()
            .get(format_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl MediaBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn resolve(
        &self,
        locator: &ResourceLocator,
        _ctx: &RequestContext,
    ) -> Result<Catalog, DownloadError> {
        self.catalogs
            .get(locator.as_str())
            .cloned()
            .ok_or_else(|| DownloadError::resolution(locator, "ERROR: Video unavailable"))
    }

    async fn resolve_collection(
        &self,
        locator: &ResourceLocator,
        _ctx: &RequestContext,
    ) -> Result<Vec<PlaylistEntry>, DownloadError> {
        self.collections
            .get(locator.as_str())
            .cloned()
            .ok_or_else(|| DownloadError::resolution(locator, "not a playlist"))
    }

    async fn search(
        &self,
        query: &str,
        limit: usize,
        _ctx: &RequestContext,
    ) -> Result<Vec<SearchHit>, DownloadError> {
        let mut hits: Vec<SearchHit> = self
            .catalogs
            .iter()
            .filter(|(_, c)| c.title.to_lowercase().contains(&query.to_lowercase()))
            .map(|(url, c)| SearchHit {
                title: c.title.clone(),
                locator: ResourceLocator::new(url.clone()).unwrap(),
                uploader: c.uploader.clone(),
                duration_seconds: c.duration_seconds,
            })
            .collect();
        hits.sort_by(|a, b| a.title.cmp(&b.title));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn transfer(
        &self,
        _locator: &ResourceLocator,
        descriptor: &StreamDescriptor,
        dest: &Path,
        _ctx: &RequestContext,
        progress: &TransferProgress,
    ) -> Result<(), TransferError> {
        self.total_transfers.fetch_add(1, Ordering::SeqCst);
        *self
            .transfers
            .lock()
            .unwrap()
            .entry(descriptor.id.clone())
            .or_insert(0) += 1;

        if let Some(failure) = self.always_failing.get(&descriptor.id) {
            return Err(failure.to_error());
        }
        let scripted = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(&descriptor.id)
            .and_then(|queue| queue.pop_front());
        if let Some(failure) = scripted {
            return Err(failure.to_error());
        }

        let body = format!("data:{}", descriptor.id);
        progress.set_total(Some(body.len() as u64));
        tokio::fs::write(dest, body.as_bytes())
            .await
            .map_err(|e| TransferError::filesystem(dest, e))?;
        progress.update(body.len() as u64);
        Ok(())
    }
}

/// Merge tool that concatenates its inputs, or fails with a fixed message
#[derive(Default)]
pub struct FakeMerger {
    failure: Option<String>,
    calls: AtomicU32,
}

impl FakeMerger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MergeTool for FakeMerger {
    fn name(&self) -> &'static str {
        "fake-merge"
    }

    async fn merge(&self, video: &Path, audio: &Path, output: &Path) -> Result<(), String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.failure {
            // A real tool may leave a truncated output behind
            let _ = tokio::fs::write(output, b"truncated").await;
            return Err(message.clone());
        }
        let mut data = tokio::fs::read(video).await.map_err(|e| e.to_string())?;
        data.extend(tokio::fs::read(audio).await.map_err(|e| e.to_string())?);
        tokio::fs::write(output, data).await.map_err(|e| e.to_string())
    }
}
