// Common data models for the retrieval pipeline

use std::fmt;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::DownloadError;

/// A URL or a search string naming one item or one collection
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceLocator(String);

impl ResourceLocator {
    pub fn new(raw: impl Into<String>) -> Result<Self, DownloadError> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DownloadError::InvalidRequest(
                "empty URL or search query".to_string(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Direct link (as opposed to a free-text search query)
    pub fn is_link(&self) -> bool {
        let lower = self.0.to_lowercase();
        lower.starts_with("http://")
            || lower.starts_with("https://")
            || lower.starts_with("www.")
            || lower.contains("youtu.be/")
    }
}

impl fmt::Display for ResourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ResourceLocator {
    type Err = DownloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ResourceLocator {
    type Error = DownloadError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ResourceLocator> for String {
    fn from(value: ResourceLocator) -> Self {
        value.0
    }
}

/// What a stream carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Video only, `audio_codec == "none"`
    Video,
    /// Audio only
    Audio,
    /// Video with embedded audio
    Muxed,
}

impl StreamKind {
    /// Classify from codec strings. `"none"` means the track is absent; a missing codec
    /// means the backend did not say, and is assumed present.
    pub fn from_codecs(video_codec: Option<&str>, audio_codec: Option<&str>) -> Option<Self> {
        let has_video = !is_none_codec(video_codec);
        let has_audio = !is_none_codec(audio_codec);
        match (has_video, has_audio) {
            (true, true) => Some(Self::Muxed),
            (true, false) => Some(Self::Video),
            (false, true) => Some(Self::Audio),
            (false, false) => None,
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Video => write!(f, "video"),
            Self::Audio => write!(f, "audio"),
            Self::Muxed => write!(f, "muxed"),
        }
    }
}

fn is_none_codec(codec: Option<&str>) -> bool {
    codec.map_or(false, |c| c.eq_ignore_ascii_case("none"))
}

/// One retrievable stream (metadata only)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    /// Opaque selector understood by the backend (e.g. "137")
    pub id: String,
    pub kind: StreamKind,
    /// e.g. "720p", "1080p60"
    pub resolution_label: Option<String>,
    /// File extension (mp4, webm, m4a)
    pub container: String,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub bitrate_kbps: Option<f64>,
    /// Exact or estimated size
    pub size_bytes: Option<u64>,
    /// `size_bytes` is the real file size, not an estimate
    #[serde(default)]
    pub size_is_exact: bool,
    pub height: Option<u32>,
    /// Transfer protocol reported by the backend (https, m3u8_native, ...)
    pub protocol: Option<String>,
}

impl StreamDescriptor {
    /// Size a finished transfer must reach, when the backend knows it exactly
    pub fn exact_size(&self) -> Option<u64> {
        self.size_bytes.filter(|_| self.size_is_exact)
    }

    /// Video stream with no audio track; needs a separate audio fetch and a merge
    pub fn lacks_audio(&self) -> bool {
        self.kind == StreamKind::Video
    }

    pub fn is_audio_only(&self) -> bool {
        self.kind == StreamKind::Audio
    }

    /// Plain HTTP(S) stream the fetcher can pull directly
    pub fn is_direct_http(&self) -> bool {
        match self.protocol.as_deref() {
            Some(p) => p == "http" || p == "https",
            None => true,
        }
    }

    /// Short human label: "720p mp4 avc1/none 1200kbps"
    pub fn summary(&self) -> String {
        let mut parts = vec![
            self.resolution_label
                .clone()
                .unwrap_or_else(|| self.kind.to_string()),
            self.container.clone(),
        ];
        parts.push(format!(
            "{}/{}",
            self.video_codec.as_deref().unwrap_or("?"),
            self.audio_codec.as_deref().unwrap_or("?")
        ));
        if let Some(kbps) = self.bitrate_kbps {
            parts.push(format!("{:.0}kbps", kbps));
        }
        parts.join(" ")
    }
}

/// All formats of one item at one point in time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    pub title: String,
    pub duration_seconds: Option<u64>,
    pub uploader: Option<String>,
    pub webpage_url: Option<String>,
    pub formats: Vec<StreamDescriptor>,
}

impl Catalog {
    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }

    pub fn find(&self, id: &str) -> Option<&StreamDescriptor> {
        self.formats.iter().find(|f| f.id == id)
    }

    /// Size as reported, or bitrate x duration when the backend gave no size
    pub fn estimated_size(&self, descriptor: &StreamDescriptor) -> Option<u64> {
        descriptor.size_bytes.or_else(|| {
            let kbps = descriptor.bitrate_kbps?;
            let secs = self.duration_seconds?;
            Some((kbps * 1000.0 / 8.0 * secs as f64) as u64)
        })
    }
}

/// Kind requested by the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    #[default]
    Video,
    Audio,
}

impl FromStr for MediaKind {
    type Err = DownloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "video" | "v" => Ok(Self::Video),
            "audio" | "a" => Ok(Self::Audio),
            other => Err(DownloadError::InvalidRequest(format!(
                "unknown kind '{}', expected video or audio",
                other
            ))),
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Video => write!(f, "video"),
            Self::Audio => write!(f, "audio"),
        }
    }
}

/// Named quality bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityTier {
    Highest,
    Best,
    Worst,
    /// Resolution height, "720p" -> 720
    Height(u32),
    /// Audio bitrate, "128kbps" -> 128
    Bitrate(u32),
    /// Audio container, "m4a"
    Container(String),
}

impl FromStr for QualityTier {
    type Err = DownloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        let value = lower.trim_start_matches('.');
        match value {
            "highest" => return Ok(Self::Highest),
            "best" | "auto" | "audio" => return Ok(Self::Best),
            "worst" | "lowest" => return Ok(Self::Worst),
            "8k" => return Ok(Self::Height(4320)),
            "4k" => return Ok(Self::Height(2160)),
            "2k" => return Ok(Self::Height(1440)),
            "mp3" | "m4a" | "webm" | "opus" | "ogg" | "aac" => {
                return Ok(Self::Container(value.to_string()))
            }
            _ => {}
        }
        if let Some(num) = value.strip_suffix("kbps") {
            if let Ok(kbps) = num.trim().parse::<u32>() {
                return Ok(Self::Bitrate(kbps));
            }
        }
        if let Some(num) = value.strip_suffix('p') {
            if let Ok(height) = num.parse::<u32>() {
                return Ok(Self::Height(height));
            }
        }
        Err(DownloadError::InvalidRequest(format!(
            "unknown quality '{}'",
            s.trim()
        )))
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Highest => write!(f, "highest"),
            Self::Best => write!(f, "best"),
            Self::Worst => write!(f, "worst"),
            Self::Height(h) => write!(f, "{}p", h),
            Self::Bitrate(kbps) => write!(f, "{}kbps", kbps),
            Self::Container(ext) => write!(f, "{}", ext),
        }
    }
}

/// Named tier or exact descriptor id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FormatChoice {
    Tier(QualityTier),
    FormatId(String),
}

/// What the user asked for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityRequest {
    pub kind: MediaKind,
    pub choice: FormatChoice,
    /// Only consider descriptors in this container (e.g. "mp4")
    pub container: Option<String>,
}

impl QualityRequest {
    pub fn video(tier: QualityTier) -> Self {
        Self {
            kind: MediaKind::Video,
            choice: FormatChoice::Tier(tier),
            container: None,
        }
    }

    pub fn audio(tier: QualityTier) -> Self {
        Self {
            kind: MediaKind::Audio,
            choice: FormatChoice::Tier(tier),
            container: None,
        }
    }

    pub fn format_id(kind: MediaKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            choice: FormatChoice::FormatId(id.into()),
            container: None,
        }
    }

    pub fn with_container(mut self, container: Option<String>) -> Self {
        self.container = container.map(|c| c.trim_start_matches('.').to_lowercase());
        self
    }

    /// The same request expressed as a tier, so it can be applied to other items whose
    /// descriptor ids differ. `chosen` is what this request resolved to on the first item,
    /// if it resolved at all.
    pub fn as_tier_policy(&self, chosen: Option<&Selection>) -> Self {
        let tier = match (&self.choice, self.kind) {
            (FormatChoice::Tier(tier), _) => tier.clone(),
            (FormatChoice::FormatId(_), MediaKind::Audio) => QualityTier::Best,
            (FormatChoice::FormatId(_), MediaKind::Video) => chosen
                .and_then(|s| s.primary().height)
                .map(QualityTier::Height)
                .unwrap_or(QualityTier::Best),
        };
        Self {
            kind: self.kind,
            choice: FormatChoice::Tier(tier),
            container: self.container.clone(),
        }
    }
}

impl Default for QualityRequest {
    fn default() -> Self {
        Self::video(QualityTier::Best)
    }
}

impl fmt::Display for QualityRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.choice {
            FormatChoice::Tier(tier) => write!(f, "{} {}", self.kind, tier)?,
            FormatChoice::FormatId(id) => write!(f, "{} format id {}", self.kind, id)?,
        }
        if let Some(container) = &self.container {
            write!(f, " in {}", container)?;
        }
        Ok(())
    }
}

/// Fully resolved choice; nothing about it changes once fetching starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Selection {
    /// Muxed stream, audio-only stream, or video with nothing to pair it with
    Single(StreamDescriptor),
    /// Video-only stream plus independently chosen best audio
    Pair {
        video: StreamDescriptor,
        audio: StreamDescriptor,
    },
}

impl Selection {
    /// The stream fetched first
    pub fn primary(&self) -> &StreamDescriptor {
        match self {
            Self::Single(d) => d,
            Self::Pair { video, .. } => video,
        }
    }

    pub fn audio(&self) -> Option<&StreamDescriptor> {
        match self {
            Self::Single(_) => None,
            Self::Pair { audio, .. } => Some(audio),
        }
    }

    pub fn needs_merge(&self) -> bool {
        matches!(self, Self::Pair { .. })
    }

    /// Extension of the final output
    pub fn container(&self) -> &str {
        &self.primary().container
    }
}

/// How many attempts a fetch gets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxAttempts {
    Bounded(NonZeroU32),
    Unbounded,
}

impl MaxAttempts {
    /// 0 means unbounded
    pub fn from_count(count: u32) -> Self {
        NonZeroU32::new(count).map_or(Self::Unbounded, Self::Bounded)
    }

    /// Whether another attempt is allowed after `made` attempts
    pub fn allows_another(&self, made: u32) -> bool {
        match self {
            Self::Bounded(max) => made < max.get(),
            Self::Unbounded => true,
        }
    }
}

impl fmt::Display for MaxAttempts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bounded(n) => write!(f, "{}", n),
            Self::Unbounded => write!(f, "unbounded"),
        }
    }
}

/// Delay between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// initial * 2^(attempt-1), capped at max
    Exponential { initial: Duration, max: Duration },
}

impl Backoff {
    /// Delay after the `attempt`-th failed attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed(d) => d,
            Self::Exponential { initial, max } => {
                let shift = attempt.saturating_sub(1).min(16);
                initial.saturating_mul(1u32 << shift).min(max)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: MaxAttempts,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn bounded(attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: MaxAttempts::from_count(attempts.max(1)),
            backoff,
        }
    }

    pub fn unbounded(backoff: Backoff) -> Self {
        Self {
            max_attempts: MaxAttempts::Unbounded,
            backoff,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::bounded(3, Backoff::Fixed(Duration::from_secs(2)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

/// One in-flight retrieval, owned by the fetcher driving it
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub descriptor: StreamDescriptor,
    pub destination: PathBuf,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub status: JobStatus,
}

impl DownloadJob {
    pub fn new(descriptor: StreamDescriptor, destination: PathBuf) -> Self {
        Self {
            descriptor,
            destination,
            attempts: 0,
            last_error: None,
            status: JobStatus::Pending,
        }
    }

    pub(crate) fn start_attempt(&mut self) {
        debug_assert!(matches!(
            self.status,
            JobStatus::Pending | JobStatus::InProgress
        ));
        self.attempts += 1;
        self.status = JobStatus::InProgress;
    }

    pub(crate) fn record_failure(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
    }

    pub(crate) fn succeed(&mut self) {
        self.status = JobStatus::Succeeded;
    }

    pub(crate) fn give_up(&mut self) {
        self.status = JobStatus::Failed;
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, JobStatus::Succeeded | JobStatus::Failed)
    }
}

/// Outcome of `RetryingFetcher::fetch`
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub ok: bool,
    pub job: DownloadJob,
    /// Destination already held a complete file; nothing was transferred
    pub skipped: bool,
    /// Partial `.part` file left behind by a failed fetch
    pub partial: Option<PathBuf>,
}

impl FetchResult {
    pub fn last_error(&self) -> Option<&str> {
        self.job.last_error.as_deref()
    }

    /// Terminal error for a failed fetch; `also_on_disk` lists earlier outputs of the
    /// same item that stay behind
    pub fn into_error(self, also_on_disk: &[PathBuf]) -> DownloadError {
        let mut left_on_disk = also_on_disk.to_vec();
        left_on_disk.extend(self.partial);
        DownloadError::Fetch {
            format_id: self.job.descriptor.id,
            attempts: self.job.attempts,
            cause: self
                .job
                .last_error
                .unwrap_or_else(|| "unknown error".to_string()),
            left_on_disk,
        }
    }
}

/// Completed video + audio jobs waiting to become one file
#[derive(Debug, Clone)]
pub struct MergeTask {
    pub video: DownloadJob,
    pub audio: DownloadJob,
    pub output: PathBuf,
}

/// Where the pipeline left the result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalOutput {
    pub path: PathBuf,
    pub merged: bool,
    /// Output existed already; nothing was fetched
    pub skipped: bool,
}

/// Session values attached to every backend request
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// SOCKS5/HTTP proxy URL
    pub proxy: Option<String>,
    /// Per-request timeout
    pub timeout: Duration,
    pub user_agent: String,
    /// Extra headers (Accept-*, Referer, ...)
    pub headers: Vec<(String, String)>,
    /// Netscape cookies.txt
    pub cookies_file: Option<PathBuf>,
    /// Raw cookie header value, e.g. "cf_clearance=..."
    pub cookie: Option<String>,
}

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36";

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            proxy: None,
            timeout: Duration::from_secs(30),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            headers: vec![
                (
                    "Accept".to_string(),
                    "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".to_string(),
                ),
                ("Accept-Language".to_string(), "en-us,en;q=0.5".to_string()),
            ],
            cookies_file: None,
            cookie: None,
        }
    }
}

impl RequestContext {
    pub fn with_proxy(mut self, proxy: Option<String>) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn with_cookie(mut self, cookie: Option<String>) -> Self {
        self.cookie = cookie;
        self
    }

    pub fn with_cookies_file(mut self, path: Option<PathBuf>) -> Self {
        self.cookies_file = path;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Everything needed to run one item through the pipeline
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub locator: ResourceLocator,
    pub quality: QualityRequest,
    pub retry: RetryPolicy,
    pub folder: PathBuf,
    pub context: RequestContext,
}

impl DownloadRequest {
    pub fn new(locator: ResourceLocator, quality: QualityRequest, folder: impl Into<PathBuf>) -> Self {
        Self {
            locator,
            quality,
            retry: RetryPolicy::default(),
            folder: folder.into(),
            context: RequestContext::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = context;
        self
    }
}

/// One item of a collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistEntry {
    pub title: String,
    pub locator: ResourceLocator,
}

/// A collection run: same folder and quality policy for every entry
#[derive(Debug, Clone)]
pub struct PlaylistRun {
    pub entries: Vec<PlaylistEntry>,
    pub folder: PathBuf,
    pub policy: QualityRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EntryStatus {
    Done(FinalOutput),
    Failed {
        reason: String,
        left_on_disk: Vec<PathBuf>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryOutcome {
    pub index: usize,
    pub title: String,
    pub locator: ResourceLocator,
    pub status: EntryStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlaylistReport {
    pub outcomes: Vec<EntryOutcome>,
}

impl PlaylistReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, EntryStatus::Done(_)))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }
}

/// Search result shown by the console wizard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub locator: ResourceLocator,
    pub uploader: Option<String>,
    pub duration_seconds: Option<u64>,
}

/// Byte-level progress of one stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadProgress {
    /// Descriptor id of the stream
    pub stream: String,
    pub bytes_done: u64,
    pub bytes_total: Option<u64>,
    pub eta_seconds: Option<u64>,
}

impl DownloadProgress {
    pub fn percent(&self) -> Option<f32> {
        let total = self.bytes_total.filter(|t| *t > 0)?;
        Some((self.bytes_done as f64 / total as f64 * 100.0).min(100.0) as f32)
    }
}

/// Side-channel events for UI layers. Never needed for correctness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    Resolving { locator: String },
    Selected { summary: String },
    Transfer(DownloadProgress),
    Retrying {
        stream: String,
        attempt: u32,
        delay_seconds: u64,
        error: String,
    },
    Skipped { path: PathBuf },
    Merging { output: PathBuf },
    Finished { path: PathBuf },
    EntryStarted { index: usize, total: usize, title: String },
}
