// Downloader module - resolve, select, fetch and merge

pub mod backends;
pub mod diagnostics;
pub mod errors;
pub mod fetcher;
pub mod format_selector;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod reconciler;
pub mod tools;
pub mod traits;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use errors::{DownloadError, TransferError};
pub use fetcher::{FetchSession, RetryingFetcher};
pub use format_selector::FormatSelector;
pub use models::{
    Catalog, DownloadRequest, FinalOutput, MediaKind, PlaylistReport, ProgressEvent,
    QualityRequest, QualityTier, RequestContext, ResourceLocator, RetryPolicy, Selection,
    StreamDescriptor, StreamKind,
};
pub use orchestrator::Downloader;
pub use reconciler::Reconciler;
pub use traits::{MediaBackend, MergeTool, ProgressEmitter};
