// Numbered terminal menu: single item, playlist, exit

use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::prompt::Prompter;
use super::render::{failure_text, quality_table, report_summary};
use super::AppContext;
use crate::downloader::format_selector::{FormatSelector, QualityOption};
use crate::downloader::models::{Catalog, MediaKind, QualityRequest, ResourceLocator};

const MENU: &str = "\n1. Download Single Video\n2. Download Playlist\n3. Exit";

/// Loop until the user picks "Exit" or input ends
pub async fn run<R: BufRead, W: Write>(
    app: &AppContext,
    prompter: &mut Prompter<R, W>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        prompter.say(MENU)?;
        match prompter.choose("Select an option (1-3)", 3)? {
            0 => single(app, prompter, cancel.child_token()).await?,
            1 => playlist(app, prompter, cancel.child_token()).await?,
            _ => {
                prompter.say("Goodbye!")?;
                return Ok(());
            }
        }
        if cancel.is_cancelled() {
            return Ok(());
        }
    }
}

async fn single<R: BufRead, W: Write>(
    app: &AppContext,
    prompter: &mut Prompter<R, W>,
    cancel: CancellationToken,
) -> Result<()> {
    let Some(locator) = ask_locator(prompter, "Enter the video URL")? else {
        return Ok(());
    };
    let folder = ask_folder(app, prompter)?;

    let catalog = match app
        .downloader
        .resolve(&locator, &app.config.request_context())
        .await
    {
        Ok(catalog) => catalog,
        Err(e) => {
            prompter.say(&format!("Could not get formats: {}", e))?;
            return Ok(());
        }
    };

    let Some(format_id) = pick_quality(app, prompter, &catalog)? else {
        return Ok(());
    };
    let request = app.request(
        locator,
        QualityRequest::format_id(MediaKind::Video, format_id),
        Some(folder),
    );
    match app.run_with_catalog(&request, &catalog, cancel).await {
        Ok(output) => prompter.say(&format!("Download complete: {}", output.path.display()))?,
        Err(e) => prompter.say(&failure_text(&e))?,
    }
    Ok(())
}

/// The quality list comes from the first entry; the same choice is applied to the rest
async fn playlist<R: BufRead, W: Write>(
    app: &AppContext,
    prompter: &mut Prompter<R, W>,
    cancel: CancellationToken,
) -> Result<()> {
    let Some(locator) = ask_locator(prompter, "Enter the playlist URL")? else {
        return Ok(());
    };
    let folder = ask_folder(app, prompter)?;
    let ctx = app.config.request_context();

    let entries = match app.downloader.list_collection(&locator, &ctx).await {
        Ok(entries) if !entries.is_empty() => entries,
        Ok(_) => {
            prompter.say("The playlist is empty.")?;
            return Ok(());
        }
        Err(e) => {
            prompter.say(&format!("Could not read the playlist: {}", e))?;
            return Ok(());
        }
    };
    prompter.say(&format!("Found {} videos in the playlist.", entries.len()))?;

    let first = match app.downloader.resolve(&entries[0].locator, &ctx).await {
        Ok(catalog) => catalog,
        Err(e) => {
            prompter.say(&format!("Could not get formats for the first video: {}", e))?;
            return Ok(());
        }
    };
    let Some(format_id) = pick_quality(app, prompter, &first)? else {
        return Ok(());
    };

    let request = app.request(
        locator,
        QualityRequest::format_id(MediaKind::Video, format_id),
        Some(folder),
    );
    match app.run_playlist(&request, cancel).await {
        Ok(report) => prompter.say(report_summary(&report).trim_end())?,
        Err(e) => prompter.say(&failure_text(&e))?,
    }
    Ok(())
}

fn ask_locator<R: BufRead, W: Write>(
    prompter: &mut Prompter<R, W>,
    question: &str,
) -> Result<Option<ResourceLocator>> {
    let raw = prompter.ask_required(question)?;
    match ResourceLocator::new(raw) {
        Ok(locator) => Ok(Some(locator)),
        Err(e) => {
            prompter.say(&e.to_string())?;
            Ok(None)
        }
    }
}

fn ask_folder<R: BufRead, W: Write>(
    app: &AppContext,
    prompter: &mut Prompter<R, W>,
) -> Result<PathBuf> {
    let default = app.config.download.folder.display().to_string();
    Ok(PathBuf::from(prompter.ask_default("Enter folder name", &default)?))
}

fn pick_quality<R: BufRead, W: Write>(
    app: &AppContext,
    prompter: &mut Prompter<R, W>,
    catalog: &Catalog,
) -> Result<Option<String>> {
    let container = app.config.preferred_container();
    let mut options: Vec<QualityOption> =
        FormatSelector::build_quality_options(catalog, MediaKind::Video, container.as_deref());
    if options.is_empty() && container.is_some() {
        debug!("No video in the preferred container, listing all");
        options = FormatSelector::build_quality_options(catalog, MediaKind::Video, None);
    }
    if options.is_empty() {
        prompter.say("No downloadable video formats found.")?;
        return Ok(None);
    }

    prompter.say(&format!("\nAvailable qualities for \"{}\":", catalog.title))?;
    prompter.say(quality_table(&options).trim_end())?;
    let index = prompter.choose("Select the quality (by number)", options.len())?;
    Ok(Some(options[index].format_id.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::testing::{audio, catalog, muxed, video, FakeBackend};
    use crate::frontends::test_support::app;
    use std::io::Cursor;

    fn scripted(input: String) -> Prompter<Cursor<Vec<u8>>, Vec<u8>> {
        Prompter::new(Cursor::new(input.into_bytes()), Vec::new())
    }

    #[tokio::test]
    async fn test_single_download_merges_chosen_quality() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new().with_catalog(
            "https://youtu.be/a",
            catalog(
                "My Video",
                vec![
                    video("137", "1080p", 1080, Some(4000.0)),
                    video("22", "720p", 720, Some(2000.0)),
                    audio("140", Some(128.0)),
                ],
            ),
        );
        let (app, backend) = app(backend, dir.path());
        let folder = dir.path().join("menu");

        let mut prompter = scripted(format!(
            "1\nhttps://youtu.be/a\n{}\n9\n2\n3\n",
            folder.display()
        ));
        run(&app, &mut prompter, CancellationToken::new()).await.unwrap();

        let shown = String::from_utf8(prompter.output().clone()).unwrap();
        assert!(shown.contains("1080p mp4"));
        assert!(shown.contains("Invalid choice"));
        assert!(shown.contains("Download complete"));
        assert!(folder.join("My Video.mp4").exists());
        assert_eq!(backend.transfers_of("22"), 1);
        assert_eq!(backend.transfers_of("137"), 0);
        assert_eq!(backend.transfers_of("140"), 1);
    }

    #[tokio::test]
    async fn test_playlist_applies_first_entry_choice() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new()
            .with_collection(
                "https://youtube.com/playlist?list=PL1",
                &[("One", "https://youtu.be/1"), ("Two", "https://youtu.be/2")],
            )
            .with_catalog(
                "https://youtu.be/1",
                catalog("One", vec![muxed("18", "360p", 360, Some(500.0))]),
            )
            .with_catalog(
                "https://youtu.be/2",
                catalog("Two", vec![muxed("43", "360p", 360, Some(600.0))]),
            );
        let (app, _) = app(backend, dir.path());

        let mut prompter = scripted(format!(
            "2\nhttps://youtube.com/playlist?list=PL1\n{}\n1\n3\n",
            dir.path().display()
        ));
        run(&app, &mut prompter, CancellationToken::new()).await.unwrap();

        let shown = String::from_utf8(prompter.output().clone()).unwrap();
        assert!(shown.contains("Found 2 videos"));
        assert!(shown.contains("2 downloaded, 0 failed"));
        assert!(dir.path().join("One.mp4").exists());
        assert!(dir.path().join("Two.mp4").exists());
    }

    #[tokio::test]
    async fn test_unknown_url_returns_to_menu() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = app(FakeBackend::new(), dir.path());

        let mut prompter = scripted("1\nhttps://youtu.be/missing\n\n3\n".to_string());
        run(&app, &mut prompter, CancellationToken::new()).await.unwrap();

        let shown = String::from_utf8(prompter.output().clone()).unwrap();
        assert!(shown.contains("Could not get formats"));
        assert!(shown.contains("Goodbye!"));
    }
}
