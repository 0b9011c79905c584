// Helper functions shared by the pipeline and backend implementations

use std::path::{Path, PathBuf};
use std::process::Stdio;

use regex::Regex;
use tokio::process::Command as TokioCommand;
use tokio::time::{timeout, Duration};

use super::errors::DownloadError;
use super::models::RequestContext;

const MAX_STEM_BYTES: usize = 200;

/// Run a tool to completion and collect its output; the child is killed once
/// `timeout_secs` pass
pub async fn run_output_with_timeout(
    program: &str,
    args: Vec<String>,
    timeout_secs: u64,
) -> Result<std::process::Output, String> {
    let child = TokioCommand::new(program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("Failed to start {}: {}", program, e))?;

    // Dropping the pending future on timeout drops the child, which kills it
    timeout(Duration::from_secs(timeout_secs), child.wait_with_output())
        .await
        .map_err(|_| format!("{} timed out after {}s", program, timeout_secs))?
        .map_err(|e| format!("Failed to wait for {}: {}", program, e))
}

/// Look for a binary in the usual install locations, then on PATH
pub fn find_binary(name: &str) -> Option<PathBuf> {
    let common_paths = [
        format!("/opt/homebrew/bin/{}", name),
        format!("/usr/local/bin/{}", name),
        format!("/usr/bin/{}", name),
    ];
    for path in common_paths {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
    }

    if let Ok(output) = std::process::Command::new("which").arg(name).output() {
        if output.status.success() {
            let found = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !found.is_empty() {
                return Some(PathBuf::from(found));
            }
        }
    }

    None
}

/// Session arguments every yt-dlp invocation carries
pub fn context_args(ctx: &RequestContext) -> Vec<String> {
    let mut args = vec![
        "--no-update".to_string(),
        "--socket-timeout".to_string(),
        ctx.timeout.as_secs().max(1).to_string(),
        "--user-agent".to_string(),
        ctx.user_agent.clone(),
    ];

    for (name, value) in &ctx.headers {
        args.push("--add-header".to_string());
        args.push(format!("{}:{}", name, value));
    }

    if let Some(cookie) = &ctx.cookie {
        args.push("--add-header".to_string());
        args.push(format!("Cookie:{}", cookie));
    }

    if let Some(path) = &ctx.cookies_file {
        args.push("--cookies".to_string());
        args.push(path.display().to_string());
    }

    if let Some(proxy) = &ctx.proxy {
        args.push("--proxy".to_string());
        args.push(proxy.clone());
    }

    args
}

/// File-name stem derived from a title: reserved characters and control characters
/// stripped, trimmed, at most 200 bytes, never empty
pub fn sanitize_filename(title: &str) -> String {
    lazy_static::lazy_static! {
        static ref RESERVED_RE: Regex = Regex::new(r#"[\\/*?:"<>|]"#).unwrap();
    }

    let stripped = RESERVED_RE.replace_all(title, "");
    let cleaned: String = stripped.chars().filter(|c| !c.is_control()).collect();
    let trimmed = cleaned.trim();

    let mut end = trimmed.len().min(MAX_STEM_BYTES);
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    let truncated = trimmed[..end].trim_end();

    if truncated.is_empty() || truncated.chars().all(|c| c == '.') {
        "untitled".to_string()
    } else {
        truncated.to_string()
    }
}

/// Every path one item can occupy in the destination folder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPlan {
    pub folder: PathBuf,
    pub stem: String,
    pub container: String,
}

impl OutputPlan {
    pub fn new(folder: impl Into<PathBuf>, title: &str, container: &str) -> Self {
        Self {
            folder: folder.into(),
            stem: sanitize_filename(title),
            container: container.trim_start_matches('.').to_string(),
        }
    }

    /// `<title>.<ext>`
    pub fn final_path(&self) -> PathBuf {
        self.folder.join(format!("{}.{}", self.stem, self.container))
    }

    /// `<title>_video.<ext>`
    pub fn video_intermediate(&self) -> PathBuf {
        self.folder
            .join(format!("{}_video.{}", self.stem, self.container))
    }

    /// `<title>_audio.<ext>`, same extension as the output so the merge input names line up
    pub fn audio_intermediate(&self) -> PathBuf {
        self.folder
            .join(format!("{}_audio.{}", self.stem, self.container))
    }

    /// Merge target before the rename into `final_path`
    pub fn merge_temp(&self) -> PathBuf {
        self.folder
            .join(format!("{}.merging.{}", self.stem, self.container))
    }
}

/// `<dest>.part`
pub fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

pub async fn ensure_folder(folder: &Path) -> Result<(), DownloadError> {
    tokio::fs::create_dir_all(folder)
        .await
        .map_err(|e| DownloadError::filesystem(folder, e))
}

/// Size of a file, `None` when it does not exist
pub async fn file_len(path: &Path) -> Result<Option<u64>, DownloadError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(Some(meta.len())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(DownloadError::filesystem(path, e)),
    }
}

/// Remove a file if present
pub async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Human-readable size (e.g. "150 MB")
pub fn format_size(bytes: Option<u64>) -> Option<String> {
    bytes.map(|b| {
        let mb = b as f64 / 1_048_576.0;
        if mb >= 1024.0 {
            format!("{:.1} GB", mb / 1024.0)
        } else if mb >= 1.0 {
            format!("{:.0} MB", mb)
        } else {
            format!("{:.0} KB", b as f64 / 1024.0)
        }
    })
}

/// "1:02:03" or "4:05"
pub fn format_duration(seconds: Option<u64>) -> String {
    match seconds {
        Some(s) if s >= 3600 => format!("{}:{:02}:{:02}", s / 3600, (s % 3600) / 60, s % 60),
        Some(s) => format!("{}:{:02}", s / 60, s % 60),
        None => "?".to_string(),
    }
}

/// Cut to `max` chars for table display
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_strips_reserved() {
        assert_eq!(sanitize_filename("My/Video:Title?"), "MyVideoTitle");
        assert_eq!(sanitize_filename("  a<b>c|d\"e*f\\g  "), "abcdefg");
    }

    #[test]
    fn test_sanitize_control_and_empty() {
        assert_eq!(sanitize_filename("line\nbreak\ttab"), "linebreaktab");
        assert_eq!(sanitize_filename("???"), "untitled");
        assert_eq!(sanitize_filename("   "), "untitled");
    }

    #[test]
    fn test_sanitize_truncates_on_char_boundary() {
        let title = "é".repeat(150);
        let stem = sanitize_filename(&title);
        assert!(stem.len() <= 200);
        assert_eq!(stem.chars().count(), 100);
    }

    #[test]
    fn test_output_plan_names() {
        let plan = OutputPlan::new("out", "My/Video:Title?", "mp4");
        assert_eq!(plan.final_path(), PathBuf::from("out/MyVideoTitle.mp4"));
        assert_eq!(
            plan.video_intermediate(),
            PathBuf::from("out/MyVideoTitle_video.mp4")
        );
        assert_eq!(
            plan.audio_intermediate(),
            PathBuf::from("out/MyVideoTitle_audio.mp4")
        );
        assert_eq!(
            part_path(&plan.final_path()),
            PathBuf::from("out/MyVideoTitle.mp4.part")
        );
    }

    #[test]
    fn test_context_args_carry_cookie_and_proxy() {
        let ctx = RequestContext::default()
            .with_proxy(Some("socks5h://127.0.0.1:1080".to_string()))
            .with_cookie(Some("cf_clearance=abc".to_string()));
        let args = context_args(&ctx);
        assert!(args.contains(&"Cookie:cf_clearance=abc".to_string()));
        let proxy_at = args.iter().position(|a| a == "--proxy").unwrap();
        assert_eq!(args[proxy_at + 1], "socks5h://127.0.0.1:1080");
    }

    #[test]
    fn test_format_helpers() {
        assert_eq!(format_size(Some(150 * 1_048_576)), Some("150 MB".to_string()));
        assert_eq!(format_duration(Some(3723)), "1:02:03");
        assert_eq!(truncate_chars("abcdefghij", 6), "abc...");
    }
}
