use std::io::{self, BufReader};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use reelgrab::downloader::format_selector::FormatSelector;
use reelgrab::downloader::models::{MediaKind, QualityRequest, QualityTier, ResourceLocator};
use reelgrab::downloader::tools::ToolManager;
use reelgrab::frontends::prompt::Prompter;
use reelgrab::frontends::{menu, render, web, wizard, AppContext};
use reelgrab::Config;

#[derive(Parser)]
#[command(name = "reelgrab")]
#[command(version)]
#[command(about = "Download videos and audio with quality selection, retries and merging")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path (default: $REELGRAB_CONFIG or ./reelgrab.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info", global = true)]
    log_level: String,

    /// Proxy URL, e.g. socks5h://127.0.0.1:1080 (overrides config file)
    #[arg(long, global = true)]
    proxy: Option<String>,

    /// Cookie header value sent with every request (overrides config file)
    #[arg(long, global = true)]
    cookie: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download one video or its audio
    Get(DownloadArgs),
    /// Download every entry of a playlist with one quality
    Playlist(DownloadArgs),
    /// List the qualities available for a URL
    Formats {
        url: String,
        #[arg(long, default_value = "video")]
        kind: MediaKind,
    },
    /// Numbered terminal menu
    Menu,
    /// Guided console flow with search
    Wizard,
    /// Web form
    Serve {
        #[arg(short = 'H', long, value_name = "IP")]
        host: Option<String>,
        #[arg(short, long, value_name = "PORT")]
        port: Option<u16>,
    },
    /// Show detected external tools
    Tools,
}

#[derive(Args)]
struct DownloadArgs {
    /// Video URL (or search terms for `get`)
    url: String,

    #[arg(long, default_value = "video")]
    kind: MediaKind,

    /// highest, best, worst, 1080p, 4k, 128kbps, m4a...
    #[arg(short, long, default_value = "highest", conflicts_with = "format_id")]
    quality: QualityTier,

    /// Exact format id from `reelgrab formats`
    #[arg(short, long)]
    format_id: Option<String>,

    /// Destination folder
    #[arg(short = 'o', long)]
    folder: Option<PathBuf>,

    /// Attempts per stream, 0 retries forever
    #[arg(short, long)]
    retries: Option<u32>,

    /// Preferred video container, "" for any
    #[arg(long)]
    container: Option<String>,
}

impl DownloadArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(retries) = self.retries {
            config.download.retries = retries;
        }
        if let Some(container) = &self.container {
            config.download.container = container.clone();
        }
    }

    fn quality(&self) -> QualityRequest {
        match &self.format_id {
            Some(id) => QualityRequest::format_id(self.kind, id.clone()),
            None => match self.kind {
                MediaKind::Video => QualityRequest::video(self.quality.clone()),
                MediaKind::Audio => QualityRequest::audio(self.quality.clone()),
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_filter = format!("reelgrab={}", cli.log_level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(proxy) = cli.proxy.clone() {
        config.network.proxy = Some(proxy);
    }
    if let Some(cookie) = cli.cookie.clone() {
        config.network.cookie = Some(cookie);
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            return;
        }
        info!("Interrupted, stopping after the current step");
        on_signal.cancel();
    });

    match cli.command {
        Command::Get(args) => {
            args.apply(&mut config);
            let app = AppContext::from_config(config)?;
            let request = app.request(
                ResourceLocator::new(args.url.as_str())?,
                args.quality(),
                args.folder.clone(),
            );
            match app.run_single(&request, cancel).await {
                Ok(output) => {
                    println!("{}", output.path.display());
                    Ok(())
                }
                Err(e) => bail!(render::failure_text(&e)),
            }
        }
        Command::Playlist(args) => {
            args.apply(&mut config);
            let app = AppContext::from_config(config)?;
            let request = app.request(
                ResourceLocator::new(args.url.as_str())?,
                args.quality(),
                args.folder.clone(),
            );
            let report = app
                .run_playlist(&request, cancel)
                .await
                .map_err(|e| anyhow::anyhow!(render::failure_text(&e)))?;
            print!("{}", render::report_summary(&report));
            if report.failed() > 0 {
                bail!("{} of {} entries failed", report.failed(), report.outcomes.len());
            }
            Ok(())
        }
        Command::Formats { url, kind } => {
            let app = AppContext::from_config(config)?;
            let locator = ResourceLocator::new(url)?;
            let catalog = app
                .downloader
                .resolve(&locator, &app.config.request_context())
                .await?;
            let container = match kind {
                MediaKind::Video => app.config.preferred_container(),
                MediaKind::Audio => None,
            };
            let options =
                FormatSelector::build_quality_options(&catalog, kind, container.as_deref());
            println!("{}", catalog.title);
            print!("{}", render::quality_table(&options));
            Ok(())
        }
        Command::Menu => {
            let app = AppContext::from_config(config)?;
            let mut prompter = Prompter::new(BufReader::new(io::stdin()), io::stdout());
            menu::run(&app, &mut prompter, cancel).await
        }
        Command::Wizard => {
            let app = AppContext::from_config(config)?;
            let mut prompter = Prompter::new(BufReader::new(io::stdin()), io::stdout());
            wizard::run(&app, &mut prompter, cancel).await
        }
        Command::Serve { host, port } => {
            if let Some(host) = host {
                config.web.host = host;
            }
            if let Some(port) = port {
                config.web.port = port;
            }
            let ip: IpAddr = config
                .web
                .host
                .parse()
                .with_context(|| format!("invalid listen address '{}'", config.web.host))?;
            let addr = SocketAddr::new(ip, config.web.port);
            let app = Arc::new(AppContext::from_config(config)?);
            web::serve(app, addr, cancel).await
        }
        Command::Tools => show_tools(&config),
    }
}

fn show_tools(config: &Config) -> Result<()> {
    let manager = ToolManager::new(config.tool_paths());
    for tool in manager.get_all_tools() {
        println!(
            "{:<16} {:<10} {:<40} {}",
            tool.name,
            if tool.is_available { "found" } else { "missing" },
            tool.path.as_deref().unwrap_or("-"),
            tool.version.as_deref().unwrap_or("")
        );
    }
    Ok(())
}
