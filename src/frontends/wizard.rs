// Guided console flow: search or URL, format tables, confirm, download

use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use super::prompt::Prompter;
use super::render::{failure_text, quality_table, search_table};
use super::AppContext;
use crate::downloader::format_selector::{FormatSelector, QualityOption};
use crate::downloader::models::{MediaKind, QualityRequest, ResourceLocator};
use crate::downloader::utils::format_duration;

pub const SEARCH_LIMIT: usize = 15;
pub const DEFAULT_PATH: &str = "./downloads";

pub async fn run<R: BufRead, W: Write>(
    app: &AppContext,
    prompter: &mut Prompter<R, W>,
    cancel: CancellationToken,
) -> Result<()> {
    prompter.say("Welcome to reelgrab. Paste a link or type something to search for.")?;
    let ctx = app.config.request_context();

    let query = prompter.ask_required("Enter a video URL or search term")?;
    let locator = ResourceLocator::new(query.as_str())?;
    let locator = if locator.is_link() {
        locator
    } else {
        let hits = match app.downloader.search(&query, SEARCH_LIMIT, &ctx).await {
            Ok(hits) => hits,
            Err(e) => {
                prompter.say(&format!("Search failed: {}", e))?;
                return Ok(());
            }
        };
        if hits.is_empty() {
            prompter.say("No results found.")?;
            return Ok(());
        }
        prompter.say("\nSearch Results")?;
        prompter.say(search_table(&hits).trim_end())?;
        let index = prompter.choose("Select a video (number)", hits.len())?;
        hits[index].locator.clone()
    };

    let catalog = match app.downloader.resolve(&locator, &ctx).await {
        Ok(catalog) => catalog,
        Err(e) => {
            prompter.say(&format!("Could not get video info: {}", e))?;
            return Ok(());
        }
    };
    prompter.say(&format!(
        "\n{} ({}){}",
        catalog.title,
        format_duration(catalog.duration_seconds),
        catalog
            .uploader
            .as_deref()
            .map(|u| format!(" by {}", u))
            .unwrap_or_default()
    ))?;

    let video = FormatSelector::build_quality_options(&catalog, MediaKind::Video, None);
    let audio = FormatSelector::build_quality_options(&catalog, MediaKind::Audio, None);
    if !video.is_empty() {
        prompter.say("\nVideo Formats")?;
        prompter.say(quality_table(&video).trim_end())?;
    }
    if !audio.is_empty() {
        prompter.say("\nAudio Formats")?;
        prompter.say(quality_table(&audio).trim_end())?;
    }

    let (kind, options) = match (video.is_empty(), audio.is_empty()) {
        (true, true) => {
            prompter.say("No downloadable formats found.")?;
            return Ok(());
        }
        (false, true) => (MediaKind::Video, video),
        (true, false) => (MediaKind::Audio, audio),
        (false, false) => match ask_kind(prompter)? {
            MediaKind::Video => (MediaKind::Video, video),
            MediaKind::Audio => (MediaKind::Audio, audio),
        },
    };
    let chosen: &QualityOption = &options[prompter.choose("Select a format (number)", options.len())?];

    let folder = PathBuf::from(prompter.ask_default("Download path", DEFAULT_PATH)?);
    let question = format!("Download {} with quality {}?", kind, chosen.label);
    if !prompter.confirm(&question, true)? {
        prompter.say("Download cancelled.")?;
        return Ok(());
    }

    let request = app.request(
        locator,
        QualityRequest::format_id(kind, chosen.format_id.clone()),
        Some(folder),
    );
    match app.run_with_catalog(&request, &catalog, cancel).await {
        Ok(output) if output.skipped => {
            prompter.say(&format!("Already downloaded: {}", output.path.display()))?
        }
        Ok(output) => prompter.say(&format!("Download complete: {}", output.path.display()))?,
        Err(e) => prompter.say(&failure_text(&e))?,
    }
    Ok(())
}

fn ask_kind<R: BufRead, W: Write>(prompter: &mut Prompter<R, W>) -> Result<MediaKind> {
    loop {
        match prompter
            .ask_default("Format type (video/audio)", "video")?
            .to_lowercase()
            .as_str()
        {
            "video" | "v" => return Ok(MediaKind::Video),
            "audio" | "a" => return Ok(MediaKind::Audio),
            _ => prompter.say("Please type video or audio.")?,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::testing::{audio, catalog, video, FakeBackend};
    use crate::frontends::test_support::app;
    use std::io::Cursor;

    fn scripted(input: String) -> Prompter<Cursor<Vec<u8>>, Vec<u8>> {
        Prompter::new(Cursor::new(input.into_bytes()), Vec::new())
    }

    fn backend() -> FakeBackend {
        FakeBackend::new().with_catalog(
            "https://youtu.be/cat",
            catalog(
                "Cat Video",
                vec![
                    video("137", "1080p", 1080, Some(4000.0)),
                    audio("251", Some(160.0)),
                    audio("140", Some(128.0)),
                ],
            ),
        )
    }

    #[tokio::test]
    async fn test_search_then_audio_download() {
        let dir = tempfile::tempdir().unwrap();
        let (app, backend) = app(backend(), dir.path());

        let mut prompter = scripted(format!("cat\n1\naudio\n2\n{}\ny\n", dir.path().display()));
        run(&app, &mut prompter, CancellationToken::new()).await.unwrap();

        let shown = String::from_utf8(prompter.output().clone()).unwrap();
        assert!(shown.contains("Search Results"));
        assert!(shown.contains("Video Formats"));
        assert!(shown.contains("Audio Formats"));
        assert!(shown.contains("Download complete"));
        assert!(dir.path().join("Cat Video.m4a").exists());
        assert_eq!(backend.transfers_of("140"), 1);
        assert_eq!(backend.transfers_of("137"), 0);
    }

    #[tokio::test]
    async fn test_declining_confirmation_downloads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (app, backend) = app(backend(), dir.path());

        let mut prompter = scripted("https://youtu.be/cat\n\n1\n\nn\n".to_string());
        run(&app, &mut prompter, CancellationToken::new()).await.unwrap();

        let shown = String::from_utf8(prompter.output().clone()).unwrap();
        assert!(shown.contains("Download video with quality 1080p mp4?"));
        assert!(shown.contains("Download cancelled."));
        assert_eq!(backend.transfers(), 0);
    }

    #[tokio::test]
    async fn test_no_search_results() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = app(backend(), dir.path());

        let mut prompter = scripted("dog\n".to_string());
        run(&app, &mut prompter, CancellationToken::new()).await.unwrap();

        let shown = String::from_utf8(prompter.output().clone()).unwrap();
        assert!(shown.contains("No results found."));
    }
}
