use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use folio_core::config::project_dirs;
use folio_core::{
    DocumentSession, FileKeyValueStore, LoadingState, PageNumber, PageStatus, ProgressStore,
    ReaderConfig, ReaderController, ReaderEvent, ReaderHost, ScrollBehavior,
};
use image::RgbaImage;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Parser)]
#[command(name = "folio", version, about = "Windowed PDF reader with saved progress")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Open a document, apply navigation, and report where reading ended up
    Open(OpenArgs),
    /// List saved reading progress, most recent first
    History,
}

#[derive(Debug, clap::Args)]
struct OpenArgs {
    /// URL or path of the PDF
    source: String,

    /// Title stored alongside progress
    #[arg(long)]
    title: Option<String>,

    /// Stable document id; progress is only recorded per-URL without it
    #[arg(long = "id")]
    document_id: Option<String>,

    /// Viewport width in CSS pixels
    #[arg(long, default_value_t = 1280.0)]
    width: f32,

    /// Device pixel ratio used for rendered surfaces
    #[arg(long = "pixel-ratio", default_value_t = 1.0)]
    pixel_ratio: f32,

    /// Page to move to after loading (1-based)
    #[arg(long)]
    goto: Option<PageNumber>,

    /// Link carrying a `#page=N` fragment to jump to
    #[arg(long)]
    jump: Option<String>,

    /// Zoom step to apply, repeatable (e.g. --zoom 0.15 --zoom 0.15)
    #[arg(long = "zoom", allow_negative_numbers = true)]
    zoom: Vec<f32>,

    /// Directory to write rendered window pages into as PNG
    #[arg(long)]
    out: Option<PathBuf>,

    /// Print the flattened outline
    #[arg(long)]
    outline: bool,
}

/// Host without a real scroll container: every page is always laid out.
struct HeadlessHost {
    width: f32,
    pixel_ratio: f32,
}

impl ReaderHost for HeadlessHost {
    fn viewport_width(&self) -> f32 {
        self.width
    }

    fn device_pixel_ratio(&self) -> f32 {
        self.pixel_ratio
    }

    fn scroll_to_page(&self, page: PageNumber, behavior: ScrollBehavior) -> bool {
        info!(page, ?behavior, "scroll to page");
        true
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = project_dirs()?;
    let _log_guard = init_logging(&project_dirs)?;
    let config = ReaderConfig::load()?;
    let store = open_store(&config)?;

    match args.command {
        Commands::Open(open) => run_open(open, config, store).await,
        Commands::History => {
            print_history(&store);
            Ok(())
        }
    }
}

fn open_store(config: &ReaderConfig) -> Result<ProgressStore> {
    let state_dir = config.state_dir()?;
    let kv = FileKeyValueStore::open(state_dir.join("progress.json"))
        .with_context(|| format!("failed to open progress store in {:?}", state_dir))?;
    Ok(ProgressStore::new(Arc::new(kv), config.storage.namespace.clone()))
}

async fn run_open(args: OpenArgs, config: ReaderConfig, store: ProgressStore) -> Result<()> {
    let loader = folio_render::shared_loader(config.loading.pdfium_library_path.clone());
    let host = Arc::new(HeadlessHost {
        width: args.width,
        pixel_ratio: args.pixel_ratio,
    });
    let controller = ReaderController::new(loader, store, host, config)?;

    let title = args
        .title
        .clone()
        .unwrap_or_else(|| default_title(&args.source));
    controller
        .open(&args.source, &title, args.document_id.clone())
        .await;

    let session = controller
        .session()
        .ok_or_else(|| anyhow!("reader session vanished during load"))?;
    if session.loading == LoadingState::Failed {
        let message = session.error_message.unwrap_or_default();
        controller.close();
        bail!("{message}");
    }

    if let Some(page) = args.goto {
        controller.set_page(page);
    }
    if let Some(link) = args.jump.as_deref() {
        match controller.jump_to(None, Some(link)).await {
            Some(page) => info!(page, "jumped"),
            None => warn!(link, "link does not name a page"),
        }
    }
    for delta in &args.zoom {
        controller.set_zoom(*delta);
    }

    if args.outline {
        wait_for_outline(&controller).await;
        print_outline(&controller);
    }

    if let Some(dir) = args.out.as_deref() {
        wait_for_window(&controller).await;
        let written = write_window_pages(&controller, dir)?;
        println!("wrote {written} page(s) to {}", dir.display());
    }

    if let Some(session) = controller.session() {
        println!("{}", format_status(&session));
    }
    controller.close();
    Ok(())
}

fn default_title(source: &str) -> String {
    let without_fragment = source.split('#').next().unwrap_or(source);
    without_fragment
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or(without_fragment)
        .to_string()
}

async fn wait_for_outline(controller: &ReaderController) {
    let events = controller.events();
    let ready = || {
        events
            .lock()
            .iter()
            .any(|event| matches!(event, ReaderEvent::OutlineReady { .. }))
    };
    let wait = async {
        while !ready() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(10), wait).await.is_err() {
        warn!("outline did not arrive in time");
    }
}

fn print_outline(controller: &ReaderController) {
    let Some(session) = controller.session() else {
        return;
    };
    if session.outline.is_empty() {
        println!("(no outline)");
        return;
    }
    for node in &session.outline {
        let indent = "  ".repeat(node.depth);
        match &node.external_url {
            Some(url) => println!("{indent}{} <{url}>", node.title),
            None => println!("{indent}{}", node.title),
        }
    }
}

/// Waits until every page in the render window has either drawn or failed.
async fn wait_for_window(controller: &ReaderController) {
    let settled = || {
        controller
            .render_window()
            .map(|window| {
                window.pages().into_iter().all(|page| {
                    controller.page(page).is_some_and(|snapshot| {
                        matches!(snapshot.status, PageStatus::Rendered | PageStatus::Error)
                    })
                })
            })
            .unwrap_or(true)
    };
    let wait = async {
        while !settled() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(60), wait).await.is_err() {
        warn!("window pages did not finish rendering in time");
    }
}

fn write_window_pages(controller: &ReaderController, dir: &Path) -> Result<usize> {
    fs::create_dir_all(dir).with_context(|| format!("failed to create {:?}", dir))?;
    let Some(window) = controller.render_window() else {
        return Ok(0);
    };

    let mut written = 0;
    for page in window.pages() {
        let Some(surface) = controller.page(page).and_then(|snapshot| snapshot.surface) else {
            warn!(page, "page has no surface, skipping");
            continue;
        };
        let image = RgbaImage::from_raw(surface.width, surface.height, surface.pixels.clone())
            .ok_or_else(|| anyhow!("surface for page {page} has the wrong size"))?;
        let path = dir.join(format!("page-{page:04}.png"));
        image
            .save(&path)
            .with_context(|| format!("failed to write {:?}", path))?;
        written += 1;
    }
    Ok(written)
}

fn print_history(store: &ProgressStore) {
    let history = store.history();
    if history.is_empty() {
        println!("no reading history");
        return;
    }
    for (document_id, record) in history {
        let last_read = record
            .last_read
            .map(|at| at.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "—".to_string());
        println!(
            "{document_id}\t{last_read}\tpage {}/{}\t{}",
            record.page, record.total_pages, record.title
        );
    }
}

fn format_status(session: &DocumentSession) -> String {
    let zoom_percent = session.zoom * 100.0;
    let zoom_display = if zoom_percent.is_finite() {
        format!("{:.0}%", zoom_percent)
    } else {
        "—".to_string()
    };

    let mut status = format!(
        "{} — page {}/{} — {}",
        session.title, session.current_page, session.total_pages, zoom_display
    );
    if let Some(target) = session.jump_target {
        status.push_str(&format!(" — jumping to {target}"));
    }
    status
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "folio.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);
    let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}
