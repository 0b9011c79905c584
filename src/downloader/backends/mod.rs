// Backends: yt-dlp for metadata and transfer, ffmpeg for merging

pub mod ffmpeg;
pub mod ytdlp;

pub use ffmpeg::FfmpegMerger;
pub use ytdlp::YtDlpBackend;
