// External tool discovery (yt-dlp, ffmpeg)

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::errors::DownloadError;
use super::utils::find_binary;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ToolType {
    YtDlp,
    /// `python -m yt_dlp`, used when there is no standalone binary
    YtDlpModule,
    Ffmpeg,
}

impl ToolType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolType::YtDlp => "yt-dlp",
            ToolType::YtDlpModule => "yt_dlp (python)",
            ToolType::Ffmpeg => "ffmpeg",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub tool_type: ToolType,
    pub version: Option<String>,
    pub path: Option<String>,
    pub is_available: bool,
}

/// How to start a tool: program plus arguments that go before everything else
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub prefix_args: Vec<String>,
}

impl ToolCommand {
    pub fn binary(path: impl AsRef<Path>) -> Self {
        Self {
            program: path.as_ref().display().to_string(),
            prefix_args: Vec::new(),
        }
    }

    pub fn python_module(python: &str, module: &str) -> Self {
        Self {
            program: python.to_string(),
            prefix_args: vec!["-m".to_string(), module.to_string()],
        }
    }

    /// Prefix plus `args`
    pub fn args(&self, args: impl IntoIterator<Item = String>) -> Vec<String> {
        self.prefix_args.iter().cloned().chain(args).collect()
    }
}

/// Configured overrides; `None` means search the usual places
#[derive(Debug, Clone)]
pub struct ToolPaths {
    pub ytdlp: Option<PathBuf>,
    pub python: String,
    pub ffmpeg: Option<PathBuf>,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            ytdlp: None,
            python: "python3".to_string(),
            ffmpeg: None,
        }
    }
}

pub struct ToolManager {
    paths: ToolPaths,
}

impl ToolManager {
    pub fn new(paths: ToolPaths) -> Self {
        Self { paths }
    }

    pub fn get_tool_info(&self, tool_type: ToolType) -> ToolInfo {
        let (path, version) = self.detect_tool(tool_type);

        ToolInfo {
            name: tool_type.as_str().to_string(),
            tool_type,
            is_available: path.is_some(),
            version,
            path,
        }
    }

    pub fn get_all_tools(&self) -> Vec<ToolInfo> {
        vec![
            self.get_tool_info(ToolType::YtDlp),
            self.get_tool_info(ToolType::YtDlpModule),
            self.get_tool_info(ToolType::Ffmpeg),
        ]
    }

    /// Standalone yt-dlp if present, else the python module
    pub fn ytdlp_command(&self) -> Result<ToolCommand, DownloadError> {
        if let Some(path) = self.locate(ToolType::YtDlp) {
            debug!(path = %path.display(), "Using yt-dlp binary");
            return Ok(ToolCommand::binary(path));
        }
        if self.python_has_module("yt_dlp") {
            debug!(python = %self.paths.python, "Using python yt_dlp module");
            return Ok(ToolCommand::python_module(&self.paths.python, "yt_dlp"));
        }
        Err(DownloadError::ToolNotFound(
            "yt-dlp (install the binary or `pip install yt-dlp`)".to_string(),
        ))
    }

    pub fn ffmpeg_command(&self) -> Result<ToolCommand, DownloadError> {
        self.locate(ToolType::Ffmpeg)
            .map(ToolCommand::binary)
            .ok_or_else(|| DownloadError::ToolNotFound("ffmpeg".to_string()))
    }

    fn locate(&self, tool_type: ToolType) -> Option<PathBuf> {
        let configured = match tool_type {
            ToolType::YtDlp => self.paths.ytdlp.as_ref(),
            ToolType::Ffmpeg => self.paths.ffmpeg.as_ref(),
            ToolType::YtDlpModule => None,
        };
        if let Some(path) = configured {
            // An explicit setting is never second-guessed by a PATH search
            return path.exists().then(|| path.clone());
        }
        match tool_type {
            ToolType::YtDlp => find_binary("yt-dlp"),
            ToolType::Ffmpeg => find_binary("ffmpeg"),
            ToolType::YtDlpModule => None,
        }
    }

    fn detect_tool(&self, tool_type: ToolType) -> (Option<String>, Option<String>) {
        match tool_type {
            ToolType::YtDlpModule => {
                if !self.python_has_module("yt_dlp") {
                    return (None, None);
                }
                let version = Command::new(&self.paths.python)
                    .args(["-m", "yt_dlp", "--version"])
                    .output()
                    .ok()
                    .filter(|o| o.status.success())
                    .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string());
                (Some(self.paths.python.clone()), version)
            }
            _ => match self.locate(tool_type) {
                Some(path) => {
                    let version = self.get_version(&path, tool_type);
                    (Some(path.display().to_string()), version)
                }
                None => (None, None),
            },
        }
    }

    fn get_version(&self, path: &Path, tool_type: ToolType) -> Option<String> {
        let arg = match tool_type {
            ToolType::Ffmpeg => "-version",
            _ => "--version",
        };

        match Command::new(path).arg(arg).output() {
            Ok(output) if output.status.success() => {
                let out = String::from_utf8_lossy(&output.stdout);
                // ffmpeg prints a banner; the first line carries the version
                out.lines().next().map(|l| l.trim().to_string())
            }
            _ => None,
        }
    }

    pub fn python_has_module(&self, module: &str) -> bool {
        let code = format!("import {}", module);
        match Command::new(&self.paths.python).args(["-c", &code]).output() {
            Ok(out) => out.status.success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_configured_path_is_unavailable() {
        let manager = ToolManager::new(ToolPaths {
            ytdlp: Some(PathBuf::from("/nonexistent/yt-dlp")),
            python: "/nonexistent/python".to_string(),
            ffmpeg: Some(PathBuf::from("/nonexistent/ffmpeg")),
        });

        let info = manager.get_tool_info(ToolType::Ffmpeg);
        assert!(!info.is_available);
        assert!(info.version.is_none());
        assert!(matches!(
            manager.ffmpeg_command(),
            Err(DownloadError::ToolNotFound(_))
        ));
        assert!(matches!(
            manager.ytdlp_command(),
            Err(DownloadError::ToolNotFound(_))
        ));
    }

    #[test]
    fn test_module_command_prefixes_args() {
        let cmd = ToolCommand::python_module("python3", "yt_dlp");
        assert_eq!(
            cmd.args(vec!["--version".to_string()]),
            vec!["-m", "yt_dlp", "--version"]
        );
    }

    #[test]
    fn test_configured_path_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("ffmpeg");
        std::fs::write(&fake, b"").unwrap();
        let manager = ToolManager::new(ToolPaths {
            ffmpeg: Some(fake.clone()),
            ..ToolPaths::default()
        });

        assert_eq!(
            manager.ffmpeg_command().unwrap(),
            ToolCommand::binary(&fake)
        );
    }
}
