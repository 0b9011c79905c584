// Text rendering for the terminal front-ends

use std::io::Write;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use crate::downloader::errors::DownloadError;
use crate::downloader::format_selector::QualityOption;
use crate::downloader::models::{EntryStatus, PlaylistReport, ProgressEvent, SearchHit};
use crate::downloader::utils::{format_duration, format_size, truncate_chars};

/// Search results show at most this many title characters
pub const TITLE_WIDTH: usize = 60;

/// One status line per event; `None` for events not worth showing
pub fn progress_line(event: &ProgressEvent) -> Option<String> {
    let line = match event {
        ProgressEvent::Resolving { locator } => format!("Resolving {}", locator),
        ProgressEvent::Selected { summary } => format!("Selected {}", summary),
        ProgressEvent::Transfer(p) => {
            let done = format_size(Some(p.bytes_done)).unwrap_or_default();
            match (p.percent(), p.bytes_total) {
                (Some(pct), Some(total)) => format!(
                    "[{}] {:5.1}% of {} ({}){}",
                    p.stream,
                    pct,
                    format_size(Some(total)).unwrap_or_default(),
                    done,
                    p.eta_seconds
                        .map(|s| format!(" ETA {}", format_duration(Some(s))))
                        .unwrap_or_default()
                ),
                _ if p.bytes_done == 0 => return None,
                _ => format!("[{}] {}", p.stream, done),
            }
        }
        ProgressEvent::Retrying {
            stream,
            attempt,
            delay_seconds,
            error,
        } => format!(
            "[{}] attempt {} failed ({}), retrying in {}s",
            stream, attempt, error, delay_seconds
        ),
        ProgressEvent::Skipped { path } => format!("Already downloaded: {}", path.display()),
        ProgressEvent::Merging { output } => format!("Merging audio and video into {}", output.display()),
        ProgressEvent::Finished { path } => format!("Saved to {}", path.display()),
        ProgressEvent::EntryStarted { index, total, title } => {
            format!("Processing video {}/{}: {}", index + 1, total, title)
        }
    };
    Some(line)
}

/// Print events to stderr until every emitter is dropped
pub fn spawn_progress_printer(mut rx: UnboundedReceiver<ProgressEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut in_transfer = false;
        while let Some(event) = rx.recv().await {
            let Some(line) = progress_line(&event) else {
                continue;
            };
            let mut err = std::io::stderr().lock();
            if matches!(event, ProgressEvent::Transfer(_)) {
                let _ = write!(err, "\r{:<78}", truncate_chars(&line, 78));
                in_transfer = true;
            } else {
                if in_transfer {
                    let _ = writeln!(err);
                    in_transfer = false;
                }
                let _ = writeln!(err, "{}", line);
            }
            let _ = err.flush();
        }
        if in_transfer {
            eprintln!();
        }
    })
}

pub fn quality_table(options: &[QualityOption]) -> String {
    let mut out = String::new();
    for (i, option) in options.iter().enumerate() {
        out.push_str(&format!(
            "{:>3}. {:<14} id {:<8} {:<18} {:>10} ~{}{}\n",
            i + 1,
            option.label,
            option.format_id,
            option.codec_info,
            option
                .bitrate_kbps
                .map(|b| format!("{:.0}kbps", b))
                .unwrap_or_else(|| "?".to_string()),
            option.estimated_size.as_deref().unwrap_or("unknown size"),
            if option.needs_merge { " (+audio)" } else { "" }
        ));
    }
    out
}

pub fn search_table(hits: &[SearchHit]) -> String {
    let mut out = String::new();
    for (i, hit) in hits.iter().enumerate() {
        out.push_str(&format!(
            "{:>3}. {:<60} {:>8}  {}\n",
            i + 1,
            truncate_chars(&hit.title, TITLE_WIDTH),
            format_duration(hit.duration_seconds),
            hit.uploader.as_deref().unwrap_or("")
        ));
    }
    out
}

/// Error line plus any files the failure left behind
pub fn failure_text(err: &DownloadError) -> String {
    let mut out = format!("Download failed: {}", err);
    for path in err.left_on_disk() {
        out.push_str(&format!("\n  left on disk: {}", path.display()));
    }
    out
}

pub fn report_summary(report: &PlaylistReport) -> String {
    let mut out = format!(
        "Playlist finished: {} downloaded, {} failed\n",
        report.succeeded(),
        report.failed()
    );
    for outcome in &report.outcomes {
        match &outcome.status {
            EntryStatus::Done(output) => out.push_str(&format!(
                "  ok    {:>3}. {}\n",
                outcome.index + 1,
                output.path.display()
            )),
            EntryStatus::Failed {
                reason,
                left_on_disk,
            } => {
                out.push_str(&format!(
                    "  FAIL  {:>3}. {}: {}\n",
                    outcome.index + 1,
                    outcome.title,
                    reason
                ));
                for path in left_on_disk {
                    out.push_str(&format!("              left on disk: {}\n", path.display()));
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::models::{DownloadProgress, EntryOutcome, FinalOutput, ResourceLocator};
    use std::path::PathBuf;

    #[test]
    fn test_transfer_line_shows_percent() {
        let line = progress_line(&ProgressEvent::Transfer(DownloadProgress {
            stream: "137".to_string(),
            bytes_done: 512 * 1024 * 1024,
            bytes_total: Some(1024 * 1024 * 1024),
            eta_seconds: Some(65),
        }))
        .unwrap();
        assert!(line.contains("50.0%"));
        assert!(line.contains("ETA 1:05"));

        let idle = ProgressEvent::Transfer(DownloadProgress {
            stream: "140".to_string(),
            bytes_done: 0,
            bytes_total: None,
            eta_seconds: None,
        });
        assert_eq!(progress_line(&idle), None);
    }

    #[test]
    fn test_search_titles_are_truncated() {
        let hits = vec![SearchHit {
            title: "x".repeat(100),
            locator: ResourceLocator::new("https://youtu.be/a").unwrap(),
            uploader: None,
            duration_seconds: Some(90),
        }];
        let table = search_table(&hits);
        assert!(!table.contains(&"x".repeat(61)));
        assert!(table.contains("1:30"));
    }

    #[test]
    fn test_report_lists_failures() {
        let report = PlaylistReport {
            outcomes: vec![
                EntryOutcome {
                    index: 0,
                    title: "One".to_string(),
                    locator: ResourceLocator::new("https://youtu.be/1").unwrap(),
                    status: EntryStatus::Done(FinalOutput {
                        path: PathBuf::from("out/One.mp4"),
                        merged: false,
                        skipped: false,
                    }),
                },
                EntryOutcome {
                    index: 1,
                    title: "Two".to_string(),
                    locator: ResourceLocator::new("https://youtu.be/2").unwrap(),
                    status: EntryStatus::Failed {
                        reason: "Merge failed".to_string(),
                        left_on_disk: vec![PathBuf::from("out/Two_video.mp4")],
                    },
                },
            ],
        };
        let text = report_summary(&report);
        assert!(text.contains("1 downloaded, 1 failed"));
        assert!(text.contains("out/Two_video.mp4"));
    }
}
