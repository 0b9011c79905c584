// Failure diagnostics - sorts backend error text into known causes
//
// Used in two places:
// - the fetcher, to decide whether another attempt can possibly help
// - resolution errors, to attach a short hint for the operator

use serde::{Deserialize, Serialize};

/// Known reasons a remote service refuses or fails a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// HTTP 403, usually an expired direct link
    Forbidden,
    RateLimited,
    /// Remote 5xx
    ServerError,
    /// Timed out, refused or reset
    Network,
    /// Captcha or a clearance challenge
    Challenge,
    AgeGated,
    RegionLocked,
    Private,
    Removed,
    /// The requested format id does not exist for this item
    MissingFormat,
    /// DRM or paid content
    Protected,
    MembersOnly,
    Unknown,
}

/// Checked in order; the first signature found in the lowercased text wins
const SIGNATURES: &[(FailureReason, &[&str])] = &[
    (
        FailureReason::Protected,
        &["drm", "widevine", "playready", "fairplay", "requires purchase", "rental"],
    ),
    (
        FailureReason::MembersOnly,
        &["members only", "members-only", "join this channel", "available to members"],
    ),
    (
        FailureReason::MissingFormat,
        &["format is not available", "no video formats found"],
    ),
    (
        FailureReason::ServerError,
        &[
            "http error 5",
            "internal server error",
            "service unavailable",
            "bad gateway",
            "gateway timeout",
        ],
    ),
    (
        FailureReason::AgeGated,
        &["age-restricted", "confirm your age"],
    ),
    (
        FailureReason::Private,
        &["private video", "video is private", "granted access"],
    ),
    (
        FailureReason::Removed,
        &[
            "video unavailable",
            "video is unavailable",
            "has been removed",
            "no longer available",
        ],
    ),
    (
        FailureReason::RegionLocked,
        &["not available in your country", "blocked in your country"],
    ),
    (
        FailureReason::RateLimited,
        &["429", "rate limit", "too many requests"],
    ),
    (
        FailureReason::Challenge,
        &["captcha", "unusual traffic", "not a bot", "cloudflare"],
    ),
    (FailureReason::Forbidden, &["403", "forbidden"]),
    (
        FailureReason::Network,
        &[
            "timeout",
            "timed out",
            "connection refused",
            "connection reset",
            "network unreachable",
        ],
    ),
];

impl FailureReason {
    /// Retrying with the same settings cannot succeed
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::AgeGated
                | Self::RegionLocked
                | Self::Private
                | Self::Removed
                | Self::MissingFormat
                | Self::Protected
                | Self::MembersOnly
        )
    }

    /// One-line suggestion shown next to terminal failures
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::Forbidden | Self::Challenge => {
                Some("refresh cookies (cookies file or clearance cookie) or use a proxy")
            }
            Self::RateLimited => Some("wait 10-15 minutes or switch IP"),
            Self::Network => Some("check the connection or configure a proxy"),
            Self::AgeGated | Self::Private | Self::MembersOnly => {
                Some("use cookies from an account that has access")
            }
            Self::RegionLocked => Some("use a proxy in an allowed region"),
            Self::MissingFormat => Some("list formats again, ids change between runs"),
            Self::Protected => Some("protected content cannot be downloaded"),
            Self::Removed | Self::ServerError | Self::Unknown => None,
        }
    }
}

/// Most specific reason for `error`; `None` only for blank text
pub fn diagnose_error(error: &str) -> Option<FailureReason> {
    if error.trim().is_empty() {
        return None;
    }
    let lower = error.to_lowercase();
    let reason = SIGNATURES
        .iter()
        .find(|(_, needles)| needles.iter().any(|n| lower.contains(n)))
        .map(|(reason, _)| *reason)
        .unwrap_or(FailureReason::Unknown);
    Some(reason)
}

/// Last line that looks like the actual error, for compact messages
pub fn summarize(error: &str) -> String {
    let lines: Vec<&str> = error.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    lines
        .iter()
        .rev()
        .find(|l| l.to_lowercase().starts_with("error"))
        .or_else(|| lines.last())
        .map(|l| l.to_string())
        .unwrap_or_else(|| "no error output".to_string())
}

/// Error text plus a hint when we recognise the cause
pub fn explain(error: &str) -> String {
    let summary = summarize(error);
    match diagnose_error(error).and_then(|r| r.hint()) {
        Some(hint) => format!("{} (hint: {})", summary, hint),
        None => summary,
    }
}
