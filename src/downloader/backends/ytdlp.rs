// yt-dlp backend
//
// Metadata comes from `yt-dlp --dump-json`. Transfers take one of two paths:
// - plain http(s) streams: yt-dlp hands out the direct URL (`-g`) and reqwest pulls it,
//   resuming a partial file with a Range request
// - everything else (HLS, DASH fragments): yt-dlp downloads the single format itself

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use futures::StreamExt;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, COOKIE, RANGE};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command as TokioCommand;
use tracing::{debug, warn};

use crate::downloader::diagnostics::explain;
use crate::downloader::errors::{DownloadError, TransferError};
use crate::downloader::models::{
    Catalog, PlaylistEntry, RequestContext, ResourceLocator, SearchHit, StreamDescriptor,
    StreamKind,
};
use crate::downloader::progress::TransferProgress;
use crate::downloader::tools::ToolCommand;
use crate::downloader::traits::MediaBackend;
use crate::downloader::utils::{context_args, run_output_with_timeout};

pub struct YtDlpBackend {
    command: ToolCommand,
    /// Limit for metadata calls (resolve, listing, search, direct URL)
    metadata_timeout_secs: u64,
}

impl YtDlpBackend {
    pub fn new(command: ToolCommand) -> Self {
        Self {
            command,
            metadata_timeout_secs: 120,
        }
    }

    pub fn with_metadata_timeout(mut self, secs: u64) -> Self {
        self.metadata_timeout_secs = secs;
        self
    }

    fn build_args(&self, ctx: &RequestContext, extra: Vec<String>) -> Vec<String> {
        let mut args = context_args(ctx);
        args.extend(extra);
        self.command.args(args)
    }

    /// Run a metadata call and return stdout, or the stderr explanation on failure
    async fn run_metadata(&self, ctx: &RequestContext, extra: Vec<String>) -> Result<Vec<u8>, String> {
        let args = self.build_args(ctx, extra);
        debug!(program = %self.command.program, args = ?args, "Running yt-dlp");

        let out = run_output_with_timeout(&self.command.program, args, self.metadata_timeout_secs)
            .await?;
        if out.status.success() {
            Ok(out.stdout)
        } else {
            Err(explain(&String::from_utf8_lossy(&out.stderr)))
        }
    }

    async fn direct_url(
        &self,
        locator: &ResourceLocator,
        descriptor: &StreamDescriptor,
        ctx: &RequestContext,
    ) -> Result<String, TransferError> {
        let args = self.build_args(
            ctx,
            vec![
                "-g".to_string(),
                "-f".to_string(),
                descriptor.id.clone(),
                "--no-playlist".to_string(),
                target(locator),
            ],
        );
        let out = run_output_with_timeout(&self.command.program, args, self.metadata_timeout_secs)
            .await
            .map_err(TransferError::Transient)?;
        if !out.status.success() {
            return Err(TransferError::from(
                String::from_utf8_lossy(&out.stderr).to_string(),
            ));
        }
        String::from_utf8_lossy(&out.stdout)
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)
            .ok_or_else(|| TransferError::Transient("yt-dlp returned no direct URL".to_string()))
    }

    async fn transfer_direct(
        &self,
        locator: &ResourceLocator,
        descriptor: &StreamDescriptor,
        dest: &Path,
        ctx: &RequestContext,
        progress: &TransferProgress,
    ) -> Result<(), TransferError> {
        let url = self.direct_url(locator, descriptor, ctx).await?;
        let client = http_client(ctx)?;

        let existing = tokio::fs::metadata(dest).await.map(|m| m.len()).unwrap_or(0);
        let mut request = client.get(&url);
        if existing > 0 {
            request = request.header(RANGE, format!("bytes={}-", existing));
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransferError::Transient(format!("Request failed: {}", e)))?;

        let status = response.status().as_u16();
        let append = match status {
            206 => true,
            200 => {
                if existing > 0 {
                    debug!(format_id = %descriptor.id, "Server ignored range, starting over");
                    progress.restart();
                }
                false
            }
            416 if existing > 0 => {
                debug!(format_id = %descriptor.id, "Partial file already complete");
                return Ok(());
            }
            _ => return Err(TransferError::from_status(status, &format!("format {}", descriptor.id))),
        };

        let offset = if append { existing } else { 0 };
        let expected = expected_length(response.content_length(), offset, descriptor);
        progress.set_total(expected.or(descriptor.size_bytes));

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(dest)
            .await
            .map_err(|e| TransferError::filesystem(dest, e))?;

        let mut written = offset;
        let mut body = Box::pin(response.bytes_stream());
        loop {
            let next = tokio::time::timeout(ctx.timeout, body.next())
                .await
                .map_err(|_| {
                    TransferError::Transient(format!(
                        "No data for {}s after {} bytes",
                        ctx.timeout.as_secs(),
                        written
                    ))
                })?;
            let chunk = match next {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    return Err(TransferError::Transient(format!(
                        "Connection dropped after {} bytes: {}",
                        written, e
                    )))
                }
                None => break,
            };
            file.write_all(&chunk)
                .await
                .map_err(|e| TransferError::filesystem(dest, e))?;
            written += chunk.len() as u64;
            progress.update(written);
        }
        file.flush()
            .await
            .map_err(|e| TransferError::filesystem(dest, e))?;

        match expected {
            Some(total) if written < total => Err(TransferError::Transient(format!(
                "Short write: {} of {} bytes",
                written, total
            ))),
            _ => Ok(()),
        }
    }

    async fn transfer_subprocess(
        &self,
        locator: &ResourceLocator,
        descriptor: &StreamDescriptor,
        dest: &Path,
        ctx: &RequestContext,
        progress: &TransferProgress,
    ) -> Result<(), TransferError> {
        let args = self.build_args(
            ctx,
            vec![
                "-f".to_string(),
                descriptor.id.clone(),
                "--no-playlist".to_string(),
                "--newline".to_string(),
                "--no-part".to_string(),
                "--continue".to_string(),
                "--hls-prefer-native".to_string(),
                "-o".to_string(),
                // Literal path; '%' would start a template field
                dest.display().to_string().replace('%', "%%"),
                target(locator),
            ],
        );
        debug!(program = %self.command.program, args = ?args, "Running yt-dlp transfer");

        let mut child = TokioCommand::new(&self.command.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransferError::Fatal(format!("Failed to start {}: {}", self.command.program, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransferError::Transient("Failed to capture stdout".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| TransferError::Transient("Failed to capture stderr".to_string()))?;

        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| TransferError::Transient(format!("Failed to read yt-dlp output: {}", e)))?
        {
            if let Some((done, total)) = parse_progress_line(&line) {
                progress.set_total(total);
                progress.update(done);
            } else if line.starts_with("[download]") {
                debug!("[yt-dlp] {}", line);
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| TransferError::Transient(format!("Process error: {}", e)))?;
        let stderr_output = stderr_task.await.unwrap_or_default();

        if status.success() {
            Ok(())
        } else {
            Err(TransferError::from(stderr_output))
        }
    }
}

#[async_trait]
impl MediaBackend for YtDlpBackend {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    async fn resolve(
        &self,
        locator: &ResourceLocator,
        ctx: &RequestContext,
    ) -> Result<Catalog, DownloadError> {
        let stdout = self
            .run_metadata(
                ctx,
                vec![
                    "--dump-json".to_string(),
                    "--no-playlist".to_string(),
                    "--no-warnings".to_string(),
                    target(locator),
                ],
            )
            .await
            .map_err(|reason| DownloadError::resolution(locator, reason))?;

        parse_catalog(&stdout).map_err(|reason| DownloadError::resolution(locator, reason))
    }

    async fn resolve_collection(
        &self,
        locator: &ResourceLocator,
        ctx: &RequestContext,
    ) -> Result<Vec<PlaylistEntry>, DownloadError> {
        let stdout = self
            .run_metadata(
                ctx,
                vec![
                    "--flat-playlist".to_string(),
                    "--dump-single-json".to_string(),
                    "--no-warnings".to_string(),
                    locator.to_string(),
                ],
            )
            .await
            .map_err(|reason| DownloadError::resolution(locator, reason))?;

        parse_collection(&stdout, locator).map_err(|reason| DownloadError::resolution(locator, reason))
    }

    async fn search(
        &self,
        query: &str,
        limit: usize,
        ctx: &RequestContext,
    ) -> Result<Vec<SearchHit>, DownloadError> {
        let stdout = self
            .run_metadata(
                ctx,
                vec![
                    "--flat-playlist".to_string(),
                    "--dump-single-json".to_string(),
                    "--no-warnings".to_string(),
                    format!("ytsearch{}:{}", limit.max(1), query),
                ],
            )
            .await
            .map_err(|reason| DownloadError::resolution(query, reason))?;

        parse_search(&stdout).map_err(|reason| DownloadError::resolution(query, reason))
    }

    async fn transfer(
        &self,
        locator: &ResourceLocator,
        descriptor: &StreamDescriptor,
        dest: &Path,
        ctx: &RequestContext,
        progress: &TransferProgress,
    ) -> Result<(), TransferError> {
        if descriptor.is_direct_http() {
            self.transfer_direct(locator, descriptor, dest, ctx, progress)
                .await
        } else {
            self.transfer_subprocess(locator, descriptor, dest, ctx, progress)
                .await
        }
    }
}

/// Length the file must reach for the transfer to count as complete. Estimated sizes
/// only feed the progress display.
fn expected_length(
    content_length: Option<u64>,
    offset: u64,
    descriptor: &StreamDescriptor,
) -> Option<u64> {
    content_length
        .map(|len| len + offset)
        .or_else(|| descriptor.exact_size())
}

/// What to hand yt-dlp: the link itself, or the first search hit for free text
fn target(locator: &ResourceLocator) -> String {
    if locator.is_link() {
        locator.to_string()
    } else {
        format!("ytsearch1:{}", locator)
    }
}

fn http_client(ctx: &RequestContext) -> Result<reqwest::Client, TransferError> {
    let mut headers = HeaderMap::new();
    for (name, value) in &ctx.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(header = %name, "Skipping invalid header"),
        }
    }
    if let Some(cookie) = &ctx.cookie {
        match HeaderValue::from_str(cookie) {
            Ok(value) => {
                headers.insert(COOKIE, value);
            }
            Err(_) => warn!("Skipping invalid cookie value"),
        }
    }

    let mut builder = reqwest::Client::builder()
        .user_agent(ctx.user_agent.clone())
        .default_headers(headers)
        .connect_timeout(ctx.timeout);

    if let Some(proxy) = &ctx.proxy {
        let proxy = reqwest::Proxy::all(proxy)
            .map_err(|e| TransferError::Fatal(format!("Invalid proxy {}: {}", proxy, e)))?;
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|e| TransferError::Fatal(format!("Failed to build HTTP client: {}", e)))
}

#[derive(Debug, Deserialize)]
struct RawInfo {
    title: Option<String>,
    duration: Option<f64>,
    uploader: Option<String>,
    webpage_url: Option<String>,
    #[serde(default)]
    formats: Vec<RawFormat>,
}

#[derive(Debug, Deserialize)]
struct RawFormat {
    format_id: Option<String>,
    ext: Option<String>,
    format_note: Option<String>,
    height: Option<f64>,
    vcodec: Option<String>,
    acodec: Option<String>,
    tbr: Option<f64>,
    abr: Option<f64>,
    vbr: Option<f64>,
    filesize: Option<f64>,
    filesize_approx: Option<f64>,
    protocol: Option<String>,
}

impl RawFormat {
    /// Validate into a descriptor; `None` for entries the pipeline cannot use
    fn into_descriptor(self) -> Option<StreamDescriptor> {
        let (id, container) = match (self.format_id, self.ext) {
            (Some(id), Some(ext)) if !id.is_empty() && !ext.is_empty() => (id, ext),
            (id, ext) => {
                warn!(format_id = ?id, ext = ?ext, "Dropping format without id or container");
                return None;
            }
        };

        // Storyboards and the like carry neither track
        let kind = StreamKind::from_codecs(self.vcodec.as_deref(), self.acodec.as_deref())?;

        let height = self.height.filter(|h| *h > 0.0).map(|h| h as u32);
        let resolution_label = match kind {
            StreamKind::Audio => None,
            _ => self
                .format_note
                .filter(|n| n.starts_with(|c: char| c.is_ascii_digit()))
                .or_else(|| height.map(|h| format!("{}p", h))),
        };

        Some(StreamDescriptor {
            id,
            kind,
            resolution_label,
            container,
            video_codec: self.vcodec,
            audio_codec: self.acodec,
            bitrate_kbps: self.tbr.or(self.abr).or(self.vbr),
            size_bytes: self
                .filesize
                .or(self.filesize_approx)
                .map(|s| s as u64),
            size_is_exact: self.filesize.is_some(),
            height,
            protocol: self.protocol,
        })
    }
}

fn parse_catalog(stdout: &[u8]) -> Result<Catalog, String> {
    // ytsearch1: may print several documents; the first one describes the item
    let raw: RawInfo = serde_json::Deserializer::from_slice(stdout)
        .into_iter::<RawInfo>()
        .next()
        .ok_or_else(|| "yt-dlp printed no metadata".to_string())?
        .map_err(|e| format!("Invalid JSON from yt-dlp: {}", e))?;

    let formats = raw
        .formats
        .into_iter()
        .filter_map(RawFormat::into_descriptor)
        .collect();

    Ok(Catalog {
        title: raw.title.unwrap_or_else(|| "untitled".to_string()),
        duration_seconds: raw.duration.map(|d| d.round() as u64),
        uploader: raw.uploader,
        webpage_url: raw.webpage_url,
        formats,
    })
}

#[derive(Debug, Deserialize)]
struct RawListing {
    title: Option<String>,
    webpage_url: Option<String>,
    entries: Option<Vec<RawEntry>>,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    title: Option<String>,
    url: Option<String>,
    webpage_url: Option<String>,
    uploader: Option<String>,
    channel: Option<String>,
    duration: Option<f64>,
}

impl RawEntry {
    fn locator(&self) -> Option<ResourceLocator> {
        self.webpage_url
            .as_deref()
            .or(self.url.as_deref())
            .and_then(|u| ResourceLocator::new(u).ok())
    }
}

fn parse_listing(stdout: &[u8]) -> Result<RawListing, String> {
    serde_json::from_slice(stdout).map_err(|e| format!("Invalid JSON from yt-dlp: {}", e))
}

fn parse_collection(stdout: &[u8], locator: &ResourceLocator) -> Result<Vec<PlaylistEntry>, String> {
    let listing = parse_listing(stdout)?;

    let Some(entries) = listing.entries else {
        // A single item given where a collection was expected
        let locator = listing
            .webpage_url
            .as_deref()
            .and_then(|u| ResourceLocator::new(u).ok())
            .unwrap_or_else(|| locator.clone());
        return Ok(vec![PlaylistEntry {
            title: listing.title.unwrap_or_else(|| "untitled".to_string()),
            locator,
        }]);
    };

    Ok(entries
        .into_iter()
        .enumerate()
        .filter_map(|(i, entry)| match entry.locator() {
            Some(locator) => Some(PlaylistEntry {
                title: entry.title.unwrap_or_else(|| format!("entry {}", i + 1)),
                locator,
            }),
            None => {
                warn!(index = i + 1, "Dropping playlist entry without URL");
                None
            }
        })
        .collect())
}

fn parse_search(stdout: &[u8]) -> Result<Vec<SearchHit>, String> {
    let listing = parse_listing(stdout)?;
    Ok(listing
        .entries
        .unwrap_or_default()
        .into_iter()
        .filter_map(|entry| {
            let locator = entry.locator()?;
            Some(SearchHit {
                title: entry.title.unwrap_or_else(|| "untitled".to_string()),
                locator,
                uploader: entry.uploader.or(entry.channel),
                duration_seconds: entry.duration.map(|d| d.round() as u64),
            })
        })
        .collect())
}

/// `[download]  12.5% of ~ 310.04MiB at 374.36KiB/s ETA 11:59` -> (bytes done, total)
fn parse_progress_line(line: &str) -> Option<(u64, Option<u64>)> {
    lazy_static::lazy_static! {
        static ref PROGRESS_RE: Regex = Regex::new(
            r"\[download\]\s+(\d+\.?\d*)%\s+of\s+~?\s*(\d+\.?\d*\s*\w+)"
        ).unwrap();
    }

    let caps = PROGRESS_RE.captures(line)?;
    let percent: f64 = caps.get(1)?.as_str().parse().ok()?;
    let total = caps.get(2).and_then(|m| parse_size(m.as_str()))?;
    let done = (total as f64 * percent.min(100.0) / 100.0) as u64;
    Some((done, Some(total)))
}

/// "343.72MiB" -> bytes
fn parse_size(text: &str) -> Option<u64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let value: f64 = text[..split].parse().ok()?;
    let multiplier: f64 = match text[split..].trim() {
        "B" | "" => 1.0,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "KB" | "kB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        _ => return None,
    };
    Some((value * multiplier) as u64)
}
