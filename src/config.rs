use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::downloader::models::{Backoff, MaxAttempts, RequestContext, RetryPolicy, DEFAULT_USER_AGENT};
use crate::downloader::tools::ToolPaths;

pub const DEFAULT_CONFIG_FILE: &str = "reelgrab.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub download: DownloadConfig,
    pub network: NetworkConfig,
    pub tools: ToolsConfig,
    pub web: WebConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffMode {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub folder: PathBuf,
    /// Preferred container for video ("" for any)
    pub container: String,
    /// 0 retries forever
    pub retries: u32,
    pub backoff_seconds: u64,
    pub backoff_mode: BackoffMode,
    /// Cap for exponential backoff
    pub backoff_max_seconds: u64,
    pub playlist_workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// e.g. "socks5h://127.0.0.1:1080"
    pub proxy: Option<String>,
    pub timeout_seconds: u64,
    pub user_agent: String,
    /// Extra request headers, name -> value
    pub headers: Vec<(String, String)>,
    pub cookies_file: Option<PathBuf>,
    /// Raw cookie header, e.g. "cf_clearance=..."
    pub cookie: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ytdlp_path: Option<PathBuf>,
    pub python: String,
    pub ffmpeg_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            folder: dirs::download_dir()
                .map(|d| d.join("reelgrab"))
                .unwrap_or_else(|| PathBuf::from("./downloads")),
            container: "mp4".to_string(),
            retries: 3,
            backoff_seconds: 2,
            backoff_mode: BackoffMode::Fixed,
            backoff_max_seconds: 60,
            playlist_workers: 1,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        let base = RequestContext::default();
        Self {
            proxy: None,
            timeout_seconds: base.timeout.as_secs(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            headers: base.headers,
            cookies_file: None,
            cookie: None,
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ytdlp_path: None,
            python: std::env::var("YTDLP_PYTHON").unwrap_or_else(|_| "python3".to_string()),
            ffmpeg_path: None,
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl Config {
    /// Load from `path`, else `$REELGRAB_CONFIG`, else `./reelgrab.toml`.
    /// A missing file means defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_file = match path {
            Some(p) => p.to_path_buf(),
            None => std::env::var("REELGRAB_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE)),
        };

        if config_file.exists() {
            let contents = std::fs::read_to_string(&config_file)
                .with_context(|| format!("reading {}", config_file.display()))?;
            Self::from_toml(&contents).with_context(|| format!("parsing {}", config_file.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let initial = Duration::from_secs(self.download.backoff_seconds);
        let backoff = match self.download.backoff_mode {
            BackoffMode::Fixed => Backoff::Fixed(initial),
            BackoffMode::Exponential => Backoff::Exponential {
                initial,
                max: Duration::from_secs(self.download.backoff_max_seconds.max(self.download.backoff_seconds)),
            },
        };
        RetryPolicy {
            max_attempts: MaxAttempts::from_count(self.download.retries),
            backoff,
        }
    }

    pub fn request_context(&self) -> RequestContext {
        RequestContext {
            proxy: self.network.proxy.clone().filter(|p| !p.trim().is_empty()),
            timeout: Duration::from_secs(self.network.timeout_seconds.max(1)),
            user_agent: self.network.user_agent.clone(),
            headers: self.network.headers.clone(),
            cookies_file: self.network.cookies_file.clone(),
            cookie: self.network.cookie.clone().filter(|c| !c.trim().is_empty()),
        }
    }

    pub fn tool_paths(&self) -> ToolPaths {
        ToolPaths {
            ytdlp: self.tools.ytdlp_path.clone(),
            python: self.tools.python.clone(),
            ffmpeg: self.tools.ffmpeg_path.clone(),
        }
    }

    /// Container filter for video requests, `None` when any container goes
    pub fn preferred_container(&self) -> Option<String> {
        let c = self.download.container.trim();
        (!c.is_empty()).then(|| c.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [download]
            retries = 0
            backoff_mode = "exponential"

            [network]
            proxy = "socks5h://127.0.0.1:1080"
            cookie = "cf_clearance=abc"
            "#,
        )
        .unwrap();

        assert_eq!(config.download.container, "mp4");
        assert_eq!(config.web.port, 8080);
        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, MaxAttempts::Unbounded);
        assert!(matches!(policy.backoff, Backoff::Exponential { .. }));
        let ctx = config.request_context();
        assert_eq!(ctx.proxy.as_deref(), Some("socks5h://127.0.0.1:1080"));
        assert_eq!(ctx.cookie.as_deref(), Some("cf_clearance=abc"));
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(Some(dir.path().join("nope.toml").as_path())).unwrap();
        assert_eq!(config.download.retries, 3);
        assert_eq!(
            config.retry_policy().backoff,
            Backoff::Fixed(Duration::from_secs(2))
        );
    }

    #[test]
    fn test_bad_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reelgrab.toml");
        std::fs::write(&path, "[download\nretries = ").unwrap();
        assert!(Config::load(Some(path.as_path())).is_err());
    }
}
