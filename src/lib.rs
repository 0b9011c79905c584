pub mod config;
pub mod downloader;
pub mod frontends;

pub use config::Config;
pub use downloader::{DownloadError, Downloader};
