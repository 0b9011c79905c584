// FormatSelector - deduplicates, ranks and resolves format choices
//
// Backends list the same resolution several times (different codecs, bitrates,
// protocols). The selector:
// - keeps the highest-bitrate descriptor per resolution label
// - orders labels by height, then bitrate
// - turns a quality request into exactly one descriptor or a video+audio pair
// - builds the quality tables the front-ends show

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::errors::DownloadError;
use super::models::{
    Catalog, FormatChoice, MediaKind, QualityRequest, QualityTier, Selection, StreamDescriptor,
    StreamKind,
};
use super::utils::format_size;

/// Quality option for table display
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityOption {
    /// Display label (e.g., "1080p mp4")
    pub label: String,

    /// Descriptor id to request
    pub format_id: String,

    /// "avc1 + mp4a" style codec summary
    pub codec_info: String,

    pub bitrate_kbps: Option<f64>,

    /// Video plus the best audio when the video has no audio track
    pub estimated_size: Option<String>,

    /// Whether a separate audio fetch and merge will follow
    pub needs_merge: bool,
}

/// Format selector with deterministic ranking
pub struct FormatSelector;

impl FormatSelector {
    /// One descriptor per resolution label (highest bitrate wins, first seen on ties),
    /// ordered by descending resolution then descending bitrate
    pub fn canonicalize<F>(catalog: &Catalog, filter: F) -> Vec<StreamDescriptor>
    where
        F: Fn(&StreamDescriptor) -> bool,
    {
        let mut groups: Vec<(Option<&str>, &StreamDescriptor)> = Vec::new();

        for format in catalog.formats.iter().filter(|f| filter(*f)) {
            let label = format.resolution_label.as_deref();
            match groups.iter_mut().find(|(key, _)| *key == label) {
                Some((_, kept)) => {
                    if bitrate_beats(format.bitrate_kbps, kept.bitrate_kbps) {
                        *kept = format;
                    }
                }
                None => groups.push((label, format)),
            }
        }

        let mut ranked: Vec<StreamDescriptor> =
            groups.into_iter().map(|(_, f)| f.clone()).collect();
        // Stable sort keeps first-seen order for full ties
        ranked.sort_by(|a, b| {
            descending(height_of(a), height_of(b))
                .then_with(|| descending_f64(a.bitrate_kbps, b.bitrate_kbps))
        });
        ranked
    }

    /// Filter keeping only descriptors in `container`, or everything when `None`
    pub fn container_filter(container: Option<&str>) -> impl Fn(&StreamDescriptor) -> bool + '_ {
        move |f| container.map_or(true, |c| f.container.eq_ignore_ascii_case(c))
    }

    /// Audio-only descriptors by descending bitrate; ties keep catalog order
    pub fn rank_audio(catalog: &Catalog, container: Option<&str>) -> Vec<StreamDescriptor> {
        let in_container = Self::container_filter(container);
        let mut audio: Vec<StreamDescriptor> = catalog
            .formats
            .iter()
            .filter(|f| f.kind == StreamKind::Audio && in_container(f))
            .cloned()
            .collect();
        audio.sort_by(|a, b| descending_f64(a.bitrate_kbps, b.bitrate_kbps));
        audio
    }

    /// Best audio to pair with a video-only stream. Depends only on the audio entries,
    /// never on where the video entries sit in the catalog.
    pub fn best_audio(catalog: &Catalog) -> Option<StreamDescriptor> {
        Self::rank_audio(catalog, None).into_iter().next()
    }

    /// Resolve a request into a complete selection. Never substitutes a different kind.
    pub fn resolve_choice(
        catalog: &Catalog,
        request: &QualityRequest,
    ) -> Result<Selection, DownloadError> {
        let chosen = match &request.choice {
            FormatChoice::FormatId(id) => {
                let descriptor = catalog
                    .find(id)
                    .ok_or_else(|| DownloadError::no_match(request))?;
                if !kind_fits(request.kind, descriptor.kind) {
                    return Err(DownloadError::no_match(format!(
                        "{} (format {} is {})",
                        request, id, descriptor.kind
                    )));
                }
                descriptor.clone()
            }
            FormatChoice::Tier(tier) => match request.kind {
                MediaKind::Video => Self::pick_video(catalog, tier, request)?,
                MediaKind::Audio => Self::pick_audio(catalog, tier, request)?,
            },
        };

        debug!(format_id = %chosen.id, kind = %chosen.kind, "Format chosen");

        if !chosen.lacks_audio() {
            return Ok(Selection::Single(chosen));
        }

        match Self::best_audio(catalog) {
            Some(audio) => Ok(Selection::Pair {
                video: chosen,
                audio,
            }),
            None => {
                warn!(
                    format_id = %chosen.id,
                    "Video-only stream and no audio in catalog, output will be silent"
                );
                Ok(Selection::Single(chosen))
            }
        }
    }

    fn pick_video(
        catalog: &Catalog,
        tier: &QualityTier,
        request: &QualityRequest,
    ) -> Result<StreamDescriptor, DownloadError> {
        let container = match tier {
            QualityTier::Container(ext) => Some(ext.as_str()),
            _ => request.container.as_deref(),
        };
        let in_container = Self::container_filter(container);
        let ranked = Self::canonicalize(catalog, |f| {
            kind_fits(MediaKind::Video, f.kind) && in_container(f)
        });

        let picked = match tier {
            QualityTier::Highest | QualityTier::Best | QualityTier::Container(_) => {
                ranked.first()
            }
            QualityTier::Worst => ranked.last(),
            QualityTier::Height(target) => ranked
                .iter()
                .find(|f| height_of(f) == Some(*target))
                // ranked is descending, so the first one below is the best below
                .or_else(|| ranked.iter().find(|f| height_of(f).map_or(false, |h| h < *target))),
            QualityTier::Bitrate(_) => None,
        };

        picked.cloned().ok_or_else(|| DownloadError::no_match(request))
    }

    fn pick_audio(
        catalog: &Catalog,
        tier: &QualityTier,
        request: &QualityRequest,
    ) -> Result<StreamDescriptor, DownloadError> {
        let container = match tier {
            QualityTier::Container(ext) => Some(ext.as_str()),
            _ => request.container.as_deref(),
        };
        let ranked = Self::rank_audio(catalog, container);

        let picked = match tier {
            QualityTier::Highest | QualityTier::Best | QualityTier::Container(_) => {
                ranked.first()
            }
            QualityTier::Worst => ranked.last(),
            QualityTier::Bitrate(target) => {
                let target = f64::from(*target);
                // Nearest known bitrate; on equal distance the higher one (earlier) wins
                ranked
                    .iter()
                    .filter(|f| f.bitrate_kbps.is_some())
                    .fold(None::<&StreamDescriptor>, |best, f| {
                        let dist = (f.bitrate_kbps.unwrap_or(0.0) - target).abs();
                        match best {
                            Some(b) if (b.bitrate_kbps.unwrap_or(0.0) - target).abs() <= dist => {
                                Some(b)
                            }
                            _ => Some(f),
                        }
                    })
            }
            QualityTier::Height(_) => None,
        };

        picked.cloned().ok_or_else(|| DownloadError::no_match(request))
    }

    /// Rows for the quality tables in the terminal front-ends
    pub fn build_quality_options(
        catalog: &Catalog,
        kind: MediaKind,
        container: Option<&str>,
    ) -> Vec<QualityOption> {
        match kind {
            MediaKind::Video => {
                let in_container = Self::container_filter(container);
                let best_audio = Self::best_audio(catalog);
                let audio_size = best_audio
                    .as_ref()
                    .and_then(|a| catalog.estimated_size(a))
                    .unwrap_or(0);

                Self::canonicalize(catalog, |f| {
                    kind_fits(MediaKind::Video, f.kind) && in_container(f)
                })
                .into_iter()
                .map(|f| {
                    let needs_merge = f.lacks_audio() && best_audio.is_some();
                    let size = catalog
                        .estimated_size(&f)
                        .map(|s| if needs_merge { s + audio_size } else { s });
                    QualityOption {
                        label: format!(
                            "{} {}",
                            f.resolution_label.as_deref().unwrap_or("unknown"),
                            f.container
                        ),
                        format_id: f.id.clone(),
                        codec_info: codec_label(&f),
                        bitrate_kbps: f.bitrate_kbps,
                        estimated_size: format_size(size),
                        needs_merge,
                    }
                })
                .collect()
            }
            MediaKind::Audio => Self::rank_audio(catalog, container)
                .into_iter()
                .map(|f| QualityOption {
                    label: format!(
                        "{} {}",
                        f.bitrate_kbps
                            .map(|b| format!("{:.0}kbps", b))
                            .unwrap_or_else(|| "audio".to_string()),
                        f.container
                    ),
                    format_id: f.id.clone(),
                    codec_info: codec_label(&f),
                    bitrate_kbps: f.bitrate_kbps,
                    estimated_size: format_size(catalog.estimated_size(&f)),
                    needs_merge: false,
                })
                .collect(),
        }
    }
}

fn kind_fits(requested: MediaKind, kind: StreamKind) -> bool {
    match requested {
        MediaKind::Video => matches!(kind, StreamKind::Video | StreamKind::Muxed),
        MediaKind::Audio => kind == StreamKind::Audio,
    }
}

/// Height from the descriptor, or parsed from a label like "1080p60"
fn height_of(format: &StreamDescriptor) -> Option<u32> {
    format.height.or_else(|| {
        let label = format.resolution_label.as_deref()?;
        let digits: String = label.chars().take_while(|c| c.is_ascii_digit()).collect();
        if label[digits.len()..].starts_with('p') {
            digits.parse().ok()
        } else {
            None
        }
    })
}

/// Known values first, larger first
fn descending(a: Option<u32>, b: Option<u32>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn descending_f64(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => y.partial_cmp(&x).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Strictly better bitrate; a missing bitrate loses to any known one
fn bitrate_beats(candidate: Option<f64>, kept: Option<f64>) -> bool {
    match (candidate, kept) {
        (Some(c), Some(k)) => c > k,
        (Some(_), None) => true,
        _ => false,
    }
}

/// Get human-readable codec label
fn codec_label(format: &StreamDescriptor) -> String {
    let short = |codec: Option<&str>| -> String {
        match codec {
            Some("none") | None => "-".to_string(),
            Some(c) => c.split('.').next().unwrap_or(c).to_string(),
        }
    };
    format!(
        "{} + {}",
        short(format.video_codec.as_deref()),
        short(format.audio_codec.as_deref())
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::testing::{audio, catalog, muxed, video};

    #[test]
    fn test_canonicalize_keeps_max_bitrate_per_label() {
        let cat = catalog(
            "t",
            vec![
                video("1", "720p", 720, Some(1000.0)),
                video("2", "720p", 720, Some(1500.0)),
                video("3", "1080p", 1080, Some(2000.0)),
            ],
        );

        let ranked = FormatSelector::canonicalize(&cat, |_| true);

        let ids: Vec<&str> = ranked.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["3", "2"]);
    }

    #[test]
    fn test_canonicalize_tie_keeps_first_and_missing_bitrate_loses() {
        let cat = catalog(
            "t",
            vec![
                video("a", "480p", 480, None),
                video("b", "480p", 480, Some(300.0)),
                video("c", "480p", 480, Some(300.0)),
            ],
        );

        let ranked = FormatSelector::canonicalize(&cat, |_| true);

        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].id, "b");
    }

    #[test]
    fn test_null_label_is_separate_and_sorts_last() {
        let mut unlabeled = muxed("x", "", 0, Some(5000.0));
        unlabeled.resolution_label = None;
        unlabeled.height = None;
        let cat = catalog(
            "t",
            vec![unlabeled, muxed("18", "360p", 360, Some(500.0))],
        );

        let ranked = FormatSelector::canonicalize(&cat, |_| true);

        let ids: Vec<&str> = ranked.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["18", "x"]);
    }

    #[test]
    fn test_container_filter() {
        let mut webm = video("248", "1080p", 1080, Some(3000.0));
        webm.container = "webm".to_string();
        let cat = catalog("t", vec![webm, video("137", "1080p", 1080, Some(2500.0))]);

        let ranked = FormatSelector::canonicalize(&cat, FormatSelector::container_filter(Some("mp4")));

        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].id, "137");
    }

    #[test]
    fn test_best_audio_ignores_video_ordering() {
        let audio_entries = vec![audio("139", Some(48.0)), audio("140", Some(128.0))];
        let videos = vec![
            video("137", "1080p", 1080, Some(2500.0)),
            video("136", "720p", 720, Some(1200.0)),
        ];

        let mut forward = videos.clone();
        forward.extend(audio_entries.clone());
        let mut shuffled = audio_entries.clone();
        shuffled.insert(1, videos[0].clone());
        shuffled.push(videos[1].clone());

        let a = FormatSelector::best_audio(&catalog("t", forward)).unwrap();
        let b = FormatSelector::best_audio(&catalog("t", shuffled)).unwrap();
        assert_eq!(a.id, "140");
        assert_eq!(a, b);
    }

    #[test]
    fn test_video_only_choice_becomes_pair() {
        let cat = catalog(
            "t",
            vec![
                video("137", "1080p", 1080, Some(2500.0)),
                audio("140", Some(128.0)),
            ],
        );

        let selection =
            FormatSelector::resolve_choice(&cat, &QualityRequest::video(QualityTier::Highest))
                .unwrap();

        match selection {
            Selection::Pair { video, audio } => {
                assert_eq!(video.id, "137");
                assert_eq!(audio.id, "140");
            }
            other => panic!("expected pair, got {:?}", other),
        }
    }

    #[test]
    fn test_muxed_choice_is_single() {
        let cat = catalog(
            "t",
            vec![muxed("22", "720p", 720, Some(1500.0)), audio("140", Some(128.0))],
        );

        let selection =
            FormatSelector::resolve_choice(&cat, &QualityRequest::video(QualityTier::Best)).unwrap();

        assert!(!selection.needs_merge());
        assert_eq!(selection.primary().id, "22");
    }

    #[test]
    fn test_height_tier_falls_back_below() {
        let cat = catalog(
            "t",
            vec![
                muxed("1080", "1080p", 1080, Some(3000.0)),
                muxed("480", "480p", 480, Some(800.0)),
                muxed("360", "360p", 360, Some(500.0)),
            ],
        );

        let exact =
            FormatSelector::resolve_choice(&cat, &QualityRequest::video(QualityTier::Height(480)))
                .unwrap();
        assert_eq!(exact.primary().id, "480");

        let below =
            FormatSelector::resolve_choice(&cat, &QualityRequest::video(QualityTier::Height(720)))
                .unwrap();
        assert_eq!(below.primary().id, "480");

        let none =
            FormatSelector::resolve_choice(&cat, &QualityRequest::video(QualityTier::Height(240)));
        assert!(matches!(none, Err(DownloadError::NoMatchingFormat { .. })));
    }

    #[test]
    fn test_worst_is_bottom_of_ranking() {
        let cat = catalog(
            "t",
            vec![
                muxed("22", "720p", 720, Some(1500.0)),
                muxed("18", "360p", 360, Some(500.0)),
            ],
        );
        let worst =
            FormatSelector::resolve_choice(&cat, &QualityRequest::video(QualityTier::Worst)).unwrap();
        assert_eq!(worst.primary().id, "18");
    }

    #[test]
    fn test_never_substitutes_kind() {
        let cat = catalog("t", vec![muxed("22", "720p", 720, Some(1500.0))]);

        let audio_req = FormatSelector::resolve_choice(&cat, &QualityRequest::audio(QualityTier::Best));
        assert!(matches!(audio_req, Err(DownloadError::NoMatchingFormat { .. })));

        let by_id = FormatSelector::resolve_choice(
            &cat,
            &QualityRequest::format_id(MediaKind::Audio, "22"),
        );
        assert!(matches!(by_id, Err(DownloadError::NoMatchingFormat { .. })));
    }

    #[test]
    fn test_audio_bitrate_and_container_tiers() {
        let mut opus = audio("251", Some(160.0));
        opus.container = "webm".to_string();
        let cat = catalog(
            "t",
            vec![audio("139", Some(48.0)), audio("140", Some(129.5)), opus],
        );

        let near =
            FormatSelector::resolve_choice(&cat, &QualityRequest::audio(QualityTier::Bitrate(128)))
                .unwrap();
        assert_eq!(near.primary().id, "140");

        let m4a = FormatSelector::resolve_choice(
            &cat,
            &QualityRequest::audio(QualityTier::Container("m4a".to_string())),
        )
        .unwrap();
        assert_eq!(m4a.primary().id, "140");

        let best =
            FormatSelector::resolve_choice(&cat, &QualityRequest::audio(QualityTier::Best)).unwrap();
        assert_eq!(best.primary().id, "251");
    }

    #[test]
    fn test_video_only_without_any_audio_stays_single() {
        let cat = catalog("t", vec![video("137", "1080p", 1080, Some(2500.0))]);
        let selection =
            FormatSelector::resolve_choice(&cat, &QualityRequest::video(QualityTier::Best)).unwrap();
        assert_eq!(selection, Selection::Single(cat.formats[0].clone()));
    }

    #[test]
    fn test_quality_options_include_audio_size() {
        let mut cat = catalog(
            "t",
            vec![
                video("137", "1080p", 1080, Some(2500.0)),
                audio("140", Some(128.0)),
            ],
        );
        cat.duration_seconds = Some(600);

        let rows = FormatSelector::build_quality_options(&cat, MediaKind::Video, None);

        assert_eq!(rows.len(), 1);
        assert!(rows[0].needs_merge);
        assert_eq!(rows[0].codec_info, "avc1 + -");
        assert!(rows[0].estimated_size.is_some());
    }
}
