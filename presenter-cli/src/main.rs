use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use crossterm::cursor;
use crossterm::event::{self, Event};
use crossterm::style::Print;
use crossterm::terminal::{self, Clear, ClearType};
use directories::ProjectDirs;
use image::RgbaImage;
use presenter_core::{
    load_document, Command, Credentials, DisplayedPage, DocumentBackend, DocumentIndex, PagePart,
    PageSources, PasswordPrompt, PresentationSession, RenderTarget, RenderedImage, SessionConfig,
    SessionEvent, ViewTargets,
};
use presenter_render::PdfiumRenderFactory;
use serde_json::json;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::filter_fn, prelude::*, EnvFilter};

mod keys;

use keys::{KeyAction, KeyMapper};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PartArg {
    Whole,
    Left,
    Right,
}

impl From<PartArg> for PagePart {
    fn from(part: PartArg) -> Self {
        match part {
            PartArg::Whole => PagePart::Whole,
            PartArg::Left => PagePart::LeftHalf,
            PartArg::Right => PagePart::RightHalf,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "presenter",
    version,
    about = "PDF presenter console with pre-rendered slides"
)]
struct Args {
    /// Presentation PDF
    presentation: PathBuf,

    /// Separate PDF holding the speaker notes, page by page
    #[arg(short = 'n', long = "notes")]
    notes: Option<PathBuf>,

    /// Page to start on (1-based)
    #[arg(short = 'p', long = "page", default_value_t = 1)]
    page: usize,

    /// Show only part of each page, for PDFs with slide and notes side by side
    #[arg(long = "part", value_enum)]
    part: Option<PartArg>,

    /// Configuration file (defaults to presenter.toml in the config directory)
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Maximum number of cached pages
    #[arg(long = "cache-pages")]
    cache_pages: Option<usize>,

    /// Cache memory budget in MiB
    #[arg(long = "cache-mib")]
    cache_mib: Option<usize>,

    /// Pages to render ahead on each side of the current page
    #[arg(long = "prefetch")]
    prefetch: Option<usize>,

    /// Write the start page (and its notes) as PNG files into DIR and exit
    #[arg(long = "export", value_name = "DIR")]
    export: Option<PathBuf>,

    /// Print page labels, slides and document details as JSON and exit
    #[arg(long = "info")]
    info: bool,
}

/// Set while the key loop owns the terminal; stderr logging is muted then.
static CONSOLE_MUTED: AtomicBool = AtomicBool::new(false);

fn console_logging_enabled() -> bool {
    !CONSOLE_MUTED.load(Ordering::Relaxed)
}

/// Mutes the stderr log layer until dropped. The log file keeps everything.
struct MutedConsole;

impl MutedConsole {
    fn new() -> Self {
        CONSOLE_MUTED.store(true, Ordering::Relaxed);
        Self
    }
}

impl Drop for MutedConsole {
    fn drop(&mut self) {
        CONSOLE_MUTED.store(false, Ordering::Relaxed);
    }
}

struct RawModeGuard {
    _muted: MutedConsole,
}

impl RawModeGuard {
    fn new() -> Result<Self> {
        let muted = MutedConsole::new();
        terminal::enable_raw_mode()?;
        Ok(Self { _muted: muted })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
        let mut stdout = io::stdout();
        let _ = crossterm::execute!(stdout, cursor::Show);
    }
}

/// Reads passwords for locked documents from the terminal.
struct StdinPrompt;

impl PasswordPrompt for StdinPrompt {
    fn credentials(&self, path: &Path) -> Result<Credentials> {
        let mut stderr = io::stderr();
        let stdin = io::stdin();
        let mut lines = stdin.lock().lines();

        writeln!(stderr, "{} is password protected.", path.display())?;
        write!(stderr, "User password: ")?;
        stderr.flush()?;
        let user = lines.next().transpose()?.unwrap_or_default();
        write!(stderr, "Owner password (empty to skip): ")?;
        stderr.flush()?;
        let owner = lines.next().transpose()?.unwrap_or_default();

        Ok(Credentials {
            owner: owner.trim_end().to_string(),
            user: user.trim_end().to_string(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("org", "presenter", "presenter")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| SessionConfig::default_path(&project_dirs));
    let mut config = SessionConfig::load_or_default(&config_path)?;
    apply_overrides(&mut config, &args);

    let provider = PdfiumRenderFactory::new(config.render)?;
    let prompt = StdinPrompt;
    let slides = load_document(&provider, &args.presentation, &prompt)
        .await
        .with_context(|| format!("failed to open {:?}", args.presentation))?;
    let notes = match &args.notes {
        Some(path) => Some(
            load_document(&provider, path, &prompt)
                .await
                .with_context(|| format!("failed to open notes {:?}", path))?,
        ),
        None => None,
    };

    if args.info {
        let report = info_report(slides.index(), notes.as_deref().map(DocumentBackend::index));
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let start = isize::try_from(args.page).unwrap_or(isize::MAX) - 1;
    let mut session = PresentationSession::new(config, PageSources::new(slides, notes))?;

    if let Some(dir) = &args.export {
        let shown = session.show_page(start);
        export_page(dir, &shown)?;
        return Ok(());
    }

    run_console(&mut session, start)
}

fn apply_overrides(config: &mut SessionConfig, args: &Args) {
    if let Some(part) = args.part {
        config.page_part = part.into();
    }
    if let Some(pages) = args.cache_pages {
        config.cache.max_entries = pages.max(1);
    }
    if let Some(mib) = args.cache_mib {
        config.cache.max_bytes = mib.saturating_mul(1024 * 1024);
    }
    if let Some(radius) = args.prefetch {
        config.prefetch_radius = radius;
    }
}

fn info_report(slides: &DocumentIndex, notes: Option<&DocumentIndex>) -> serde_json::Value {
    let pages: Vec<_> = (0..slides.page_count())
        .map(|page| {
            let size = slides.page_size(page as isize);
            json!({
                "index": page,
                "label": slides.label(page),
                "width": size.width,
                "height": size.height,
                "duration": slides.duration(page),
            })
        })
        .collect();
    let unsupported: Vec<String> = slides
        .unsupported_features()
        .iter()
        .map(ToString::to_string)
        .collect();

    json!({
        "path": slides.info().path,
        "id": slides.info().id.to_string(),
        "title": slides.info().metadata.title,
        "author": slides.info().metadata.author,
        "page_count": slides.page_count(),
        "pages": pages,
        "slides": slides.slides(),
        "unsupported": unsupported,
        "notes_page_count": notes.map(DocumentIndex::page_count),
    })
}

fn run_console(session: &mut PresentationSession, start: isize) -> Result<()> {
    let redraw = Arc::new(AtomicBool::new(false));
    let redraw_flag = Arc::clone(&redraw);
    session.subscribe(move |event| {
        if matches!(
            event,
            SessionEvent::PageRendered {
                displayed: true,
                ..
            } | SessionEvent::CacheInvalidated
        ) {
            redraw_flag.store(true, Ordering::Release);
        }
    });

    let _raw = RawModeGuard::new()?;
    let mut stdout = io::stdout();
    crossterm::execute!(stdout, cursor::Hide, Clear(ClearType::All))?;

    let mut keys = KeyMapper::new();
    let mut shown = session.show_page(start);
    let mut message: Option<String> = None;
    let mut dirty = true;

    loop {
        session.poll_completions();
        if redraw.swap(false, Ordering::AcqRel) {
            if let Some(current) = session.displayed() {
                shown = current;
            }
            dirty = true;
        }

        if dirty {
            let status = status_line(session, &shown, keys.pending_input(), message.as_deref());
            draw_status_line(&mut stdout, &status)?;
            dirty = false;
        }

        if !event::poll(Duration::from_millis(50))? {
            continue;
        }
        let ev = event::read()?;
        if let Event::Resize(..) = ev {
            if let Some(targets) = targets_for_window(session) {
                shown = session.apply(Command::Resize { targets });
            }
            dirty = true;
            continue;
        }

        match keys.map_event(ev) {
            KeyAction::Command(command) => {
                shown = session.apply(command);
                message = None;
            }
            KeyAction::Export => {
                message = Some(match export_page(Path::new("."), &shown) {
                    Ok(path) => format!("exported {}", path.display()),
                    Err(err) => {
                        warn!(%err, "export failed");
                        format!("export failed: {err:#}")
                    }
                });
            }
            KeyAction::Quit => break,
            KeyAction::None => {}
        }
        dirty = true;
    }

    crossterm::execute!(stdout, Clear(ClearType::All), cursor::MoveTo(0, 0))?;
    Ok(())
}

/// Slide box matching the terminal's pixel size, when the terminal reports one.
fn targets_for_window(session: &PresentationSession) -> Option<ViewTargets> {
    let window = terminal::window_size().ok()?;
    if window.width == 0 || window.height == 0 {
        return None;
    }
    let mut targets = session.cache().targets();
    targets.slide = RenderTarget::new(u32::from(window.width), u32::from(window.height));
    Some(targets)
}

fn status_line(
    session: &PresentationSession,
    shown: &DisplayedPage,
    pending: Option<String>,
    message: Option<&str>,
) -> String {
    let index = session.index();
    let cache = session.cache();
    let slides = index.slides().len();
    let cached = match cache.cached_range() {
        Some(range) => format!("{}-{}", range.start() + 1, range.end() + 1),
        None => "-".to_string(),
    };

    let mut status = format!(
        "page {}/{}  slide {}/{} [{}]  cached {} ({} pages, {:.1} MiB)  next {}",
        shown.page_index + 1,
        index.page_count(),
        index.slide_number(shown.page_index) + 1,
        slides,
        shown.label,
        cached,
        cache.len(),
        cache.bytes_used() as f64 / (1024.0 * 1024.0),
        if shown.next.is_some() { "ready" } else { "-" },
    );
    if shown.notes.is_some() {
        status.push_str("  notes");
    }
    if let Some(pending) = pending {
        status.push_str(&format!("  :{pending}"));
    }
    if let Some(message) = message {
        status.push_str(&format!("  {message}"));
    }
    status
}

fn draw_status_line(stdout: &mut io::Stdout, status: &str) -> Result<()> {
    let (_, rows) = terminal::size()?;
    crossterm::execute!(
        stdout,
        cursor::MoveTo(0, rows.saturating_sub(1)),
        Clear(ClearType::CurrentLine),
        Print(status)
    )?;
    Ok(())
}

/// Writes the slide image, and the notes image when present, as PNG files.
/// Returns the slide file path.
fn export_page(dir: &Path, shown: &DisplayedPage) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("failed to create {:?}", dir))?;
    let stem = format!("page-{:03}", shown.page_index + 1);

    let slide_path = dir.join(format!("{stem}.png"));
    save_png(&shown.slide, &slide_path)?;
    if let Some(notes) = &shown.notes {
        save_png(notes, &dir.join(format!("{stem}-notes.png")))?;
    }
    info!(path = %slide_path.display(), "exported page");
    Ok(slide_path)
}

fn save_png(image: &RenderedImage, path: &Path) -> Result<()> {
    let buffer = RgbaImage::from_raw(image.width, image.height, image.pixels.clone())
        .ok_or_else(|| anyhow!("image buffer for page {} is truncated", image.page_index))?;
    buffer
        .save(path)
        .with_context(|| format!("failed to write {:?}", path))
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "presenter.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_filter(filter_fn(|_| console_logging_enabled()));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}
