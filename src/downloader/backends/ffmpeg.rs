// ffmpeg merge tool

use std::path::Path;

use async_trait::async_trait;
use tracing::debug;

use crate::downloader::tools::ToolCommand;
use crate::downloader::traits::MergeTool;
use crate::downloader::utils::run_output_with_timeout;

/// Remux video, re-encode audio to AAC
pub struct FfmpegMerger {
    command: ToolCommand,
    timeout_secs: u64,
}

impl FfmpegMerger {
    pub fn new(command: ToolCommand) -> Self {
        Self {
            command,
            timeout_secs: 3600,
        }
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn merge_args(video: &Path, audio: &Path, output: &Path) -> Vec<String> {
        vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-i".to_string(),
            video.display().to_string(),
            "-i".to_string(),
            audio.display().to_string(),
            "-map".to_string(),
            "0:v:0".to_string(),
            "-map".to_string(),
            "1:a:0".to_string(),
            "-c:v".to_string(),
            "copy".to_string(),
            "-c:a".to_string(),
            "aac".to_string(),
            output.display().to_string(),
        ]
    }
}

#[async_trait]
impl MergeTool for FfmpegMerger {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    async fn merge(&self, video: &Path, audio: &Path, output: &Path) -> Result<(), String> {
        let args = self.command.args(Self::merge_args(video, audio, output));
        debug!(program = %self.command.program, args = ?args, "Running merge");

        let out = run_output_with_timeout(&self.command.program, args, self.timeout_secs).await?;
        if out.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&out.stderr);
        let tail: Vec<&str> = stderr
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        let message = tail[tail.len().saturating_sub(3)..].join(" | ");
        Err(if message.is_empty() {
            format!("ffmpeg exited with {}", out.status)
        } else {
            message
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_args_copy_video_and_aac_audio() {
        let args = FfmpegMerger::merge_args(
            Path::new("out/a_video.mp4"),
            Path::new("out/a_audio.mp4"),
            Path::new("out/a.merging.mp4"),
        );
        assert_eq!(args.first().map(String::as_str), Some("-y"));
        let joined = args.join(" ");
        assert!(joined.contains("-i out/a_video.mp4 -i out/a_audio.mp4"));
        assert!(joined.contains("-c:v copy -c:a aac"));
        assert_eq!(args.last().map(String::as_str), Some("out/a.merging.mp4"));
    }

    #[tokio::test]
    async fn test_missing_program_is_an_error() {
        let merger = FfmpegMerger::new(ToolCommand::binary("/nonexistent/ffmpeg"));
        let err = merger
            .merge(Path::new("v.mp4"), Path::new("a.mp4"), Path::new("o.mp4"))
            .await
            .unwrap_err();
        assert!(err.contains("Failed to start"));
    }
}
