use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use crossterm::cursor;
use crossterm::event;
use crossterm::terminal::{self, Clear, ClearType};
use directories::ProjectDirs;
use docview_core::{
    DocumentId, FileHandleAllocator, SessionEvent, SessionState, SourceFile, ViewerConfig,
    ViewerError, ViewingSession,
};
use docview_result::{download, highlight, page_references, PageReference, Span};
use docview_tty::{
    format_reference, split_lines, tab_labels, truncate_with_ellipsis, write_status_line,
    AnsiRenderer, ColorMode, DrawParams, EventMapper, TerminalSurface, UiEvent,
};
use serde_json::Value;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};
use url::Url;

mod picker;
mod upload;

use picker::partition_by_media_type;
use upload::{AnalysisClient, UploadRequest};

const REFERENCE_ROWS: usize = 8;

#[derive(Debug, Parser)]
#[command(
    name = "docview",
    version,
    about = "Submit PDFs for persona-driven analysis and read the result beside the documents"
)]
struct Args {
    /// Config file to use instead of the platform default
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory for the log file
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: CommandKind,
}

#[derive(Debug, Subcommand)]
enum CommandKind {
    /// Upload documents with a persona and job, then show the analysis
    Analyze(AnalyzeArgs),
    /// Show a saved analysis result, optionally next to its documents
    Show(ShowArgs),
}

impl CommandKind {
    fn output(&self) -> &OutputArgs {
        match self {
            CommandKind::Analyze(args) => &args.output,
            CommandKind::Show(args) => &args.output,
        }
    }
}

#[derive(Debug, clap::Args)]
struct AnalyzeArgs {
    #[arg(long)]
    persona: String,

    #[arg(long)]
    job: String,

    /// Analysis service URL
    #[arg(long)]
    endpoint: Option<Url>,

    #[command(flatten)]
    output: OutputArgs,

    /// PDF files to submit
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

#[derive(Debug, clap::Args)]
struct ShowArgs {
    /// JSON file written by an earlier download
    result: PathBuf,

    #[command(flatten)]
    output: OutputArgs,

    /// Documents the result refers to
    files: Vec<PathBuf>,
}

#[derive(Debug, clap::Args)]
struct OutputArgs {
    /// Print the result and exit instead of opening the viewer
    #[arg(long)]
    print: bool,

    #[arg(long, value_enum, default_value_t = ColorChoice::Auto)]
    color: ColorChoice,

    /// Directory downloads are saved into; with --print the result is saved right away
    #[arg(long)]
    download: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ColorChoice {
    Auto,
    Always,
    Never,
}

impl ColorChoice {
    fn resolve(self, is_terminal: bool) -> ColorMode {
        match self {
            ColorChoice::Always => ColorMode::Always,
            ColorChoice::Never => ColorMode::Never,
            ColorChoice::Auto if is_terminal => ColorMode::Always,
            ColorChoice::Auto => ColorMode::Never,
        }
    }
}

struct RawModeGuard;

impl RawModeGuard {
    fn new() -> anyhow::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
        let mut stdout = io::stdout();
        let _ = crossterm::execute!(stdout, cursor::Show);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("net", "docview", "docview")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let log_dir = args
        .log_dir
        .clone()
        .unwrap_or_else(|| project_dirs.data_local_dir().join("logs"));
    // The viewer owns the terminal, so console logging is for --print runs only.
    let _log_guard = init_logging(&log_dir, args.command.output().print)?;

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| ViewerConfig::default_path(&project_dirs));
    let config = ViewerConfig::load(&config_path)?;
    debug!(path = %config_path.display(), "configuration loaded");

    match args.command {
        CommandKind::Analyze(cmd) => run_analyze(cmd, config).await,
        CommandKind::Show(cmd) => run_show(cmd, config),
    }
}

async fn run_analyze(cmd: AnalyzeArgs, mut config: ViewerConfig) -> Result<()> {
    if let Some(endpoint) = cmd.endpoint {
        config.endpoint = endpoint;
    }

    let files = pick_files(cmd.files, &config);
    let request = UploadRequest {
        persona: cmd.persona,
        job: cmd.job,
        files,
    };
    request.validate(config.max_documents)?;

    let client = AnalysisClient::new(&config)?;
    eprintln!(
        "Uploading {} document(s) to {}",
        request.files.len(),
        client.endpoint()
    );
    let analysis = client.submit(&request).await?;
    if let Some(seconds) = analysis.execution_time_seconds {
        eprintln!("Analysis finished in {:.1}s", seconds);
    }

    present(analysis.summary, request.files, &cmd.output, &config)
}

fn run_show(cmd: ShowArgs, config: ViewerConfig) -> Result<()> {
    let raw = fs::read_to_string(&cmd.result)
        .with_context(|| format!("failed to read result file {:?}", cmd.result))?;
    let value = serde_json::from_str::<Value>(&raw).unwrap_or(Value::String(raw));
    let files = pick_files(cmd.files, &config);
    present(value, files, &cmd.output, &config)
}

fn pick_files(paths: Vec<PathBuf>, config: &ViewerConfig) -> Vec<SourceFile> {
    let picked = partition_by_media_type(paths, config);
    for rejected in &picked.rejected {
        eprintln!("Skipping {}", rejected);
    }
    picked.accepted
}

fn present(
    value: Value,
    files: Vec<SourceFile>,
    output: &OutputArgs,
    config: &ViewerConfig,
) -> Result<()> {
    if output.print {
        return print_result(&value, output, config);
    }
    if !io::stdout().is_terminal() {
        bail!("standard output is not a terminal; pass --print to write the result instead");
    }
    let download_dir = output.download.clone().unwrap_or_else(|| PathBuf::from("."));
    run_viewer(value, files, output.color.resolve(true), download_dir, config)
}

fn print_result(value: &Value, output: &OutputArgs, config: &ViewerConfig) -> Result<()> {
    let spans = highlight(value)?;
    let stdout = io::stdout();
    let mut renderer = AnsiRenderer::new(stdout.lock(), output.color.resolve(stdout.is_terminal()));
    renderer.print_spans(&spans)?;

    let references = page_references(value);
    if !references.is_empty() {
        let writer = renderer.writer();
        writeln!(writer)?;
        writeln!(writer, "Page references:")?;
        for (idx, reference) in references.iter().enumerate() {
            writeln!(writer, "{}", format_reference(idx + 1, reference))?;
        }
        writer.flush()?;
    }

    if let Some(dir) = &output.download {
        let path = download(value, dir, &config.download_filename)?;
        eprintln!("Saved {}", path.display());
    }
    Ok(())
}

fn run_viewer(
    value: Value,
    files: Vec<SourceFile>,
    color: ColorMode,
    download_dir: PathBuf,
    config: &ViewerConfig,
) -> Result<()> {
    let surface = Arc::new(TerminalSurface::new());
    let mut session =
        ViewingSession::new(config, Arc::new(FileHandleAllocator), surface.clone())?;
    if !files.is_empty() {
        session.load(files)?;
    }

    let mut viewer = Viewer::new(session, surface, value, download_dir, config)?;

    let _raw = RawModeGuard::new()?;
    let mut stdout = io::stdout();
    crossterm::execute!(stdout, cursor::Hide)?;
    let mut renderer = AnsiRenderer::new(stdout, color);
    let mut event_mapper = EventMapper::new();
    let mut dirty = true;
    renderer.clear_all()?;

    loop {
        if viewer.absorb_session_events() {
            dirty = true;
        }

        if dirty {
            viewer.redraw(&mut renderer, event_mapper.pending_input().as_deref())?;
            dirty = false;
        }

        if event::poll(Duration::from_millis(100))? {
            let ev = event::read()?;
            if matches!(ev, event::Event::Resize(..)) {
                renderer.clear_all()?;
            }
            let ui_event = event_mapper.map_event(ev);
            match viewer.handle_event(ui_event) {
                LoopAction::Quit => break,
                LoopAction::Continue => dirty = true,
            }
        }
    }

    renderer.clear_all()?;
    viewer.session.dispose();
    Ok(())
}

enum LoopAction {
    Continue,
    Quit,
}

struct Viewer {
    session: ViewingSession,
    surface: Arc<TerminalSurface>,
    value: Value,
    spans: Vec<Span>,
    line_count: usize,
    references: Vec<PageReference>,
    download_dir: PathBuf,
    download_filename: String,
    show_page_controls: bool,
    scroll: usize,
    message: Option<String>,
    last_state: Option<SessionState>,
}

impl Viewer {
    fn new(
        session: ViewingSession,
        surface: Arc<TerminalSurface>,
        value: Value,
        download_dir: PathBuf,
        config: &ViewerConfig,
    ) -> Result<Self> {
        let spans = highlight(&value)?;
        Ok(Self {
            line_count: split_lines(&spans).len(),
            references: page_references(&value),
            spans,
            value,
            session,
            surface,
            download_dir,
            download_filename: config.download_filename.clone(),
            show_page_controls: config.viewer.show_page_controls,
            scroll: 0,
            message: None,
            last_state: None,
        })
    }

    fn handle_event(&mut self, event: UiEvent) -> LoopAction {
        match event {
            UiEvent::GotoPage { page } => {
                let outcome = self.session.navigate(page).map(|_| ());
                self.report(outcome);
            }
            UiEvent::NextDocument => {
                let outcome = self.session.select_next().map(|_| ());
                self.report(outcome);
            }
            UiEvent::PrevDocument => {
                let outcome = self.session.select_previous().map(|_| ());
                self.report(outcome);
            }
            UiEvent::OpenReference { number } => self.open_reference(number),
            UiEvent::Scroll { delta } => {
                let max = self.line_count.saturating_sub(1);
                self.scroll = self.scroll.saturating_add_signed(delta).min(max);
            }
            UiEvent::Download => {
                self.message = Some(
                    match download(&self.value, &self.download_dir, &self.download_filename) {
                        Ok(path) => format!("saved {}", path.display()),
                        Err(err) => err.to_string(),
                    },
                );
            }
            UiEvent::Quit => return LoopAction::Quit,
            UiEvent::None => {}
        }
        LoopAction::Continue
    }

    fn open_reference(&mut self, number: usize) {
        let Some(reference) = number
            .checked_sub(1)
            .and_then(|idx| self.references.get(idx))
            .cloned()
        else {
            self.message = Some(format!("no page reference {}", number));
            return;
        };
        match self.session.open_reference(&reference.document, reference.page) {
            Err(ViewerError::OutOfRange { .. }) => {
                self.message = Some(format!("{} is not loaded", reference.document));
            }
            outcome => self.report(outcome.map(|_| ())),
        }
    }

    fn report(&mut self, outcome: Result<(), ViewerError>) {
        match outcome {
            Ok(()) => {}
            Err(err) if err.is_surfaced() => self.message = Some(err.to_string()),
            Err(err) => debug!(error = %err, "navigation dropped"),
        }
    }

    /// Folds session events into the status message. Returns whether anything changed.
    fn absorb_session_events(&mut self) -> bool {
        let mut changed = false;
        for event in self.session.drain_events() {
            changed = true;
            match event {
                SessionEvent::SurfaceReady(id) => {
                    info!(document = %self.name_of(id), "document ready");
                }
                SessionEvent::SurfaceFailed { document, message } => {
                    warn!(document = %self.name_of(document), %message, "document failed to open");
                    self.message = Some(format!("failed to open {}: {}", self.name_of(document), message));
                }
                SessionEvent::NavigationApplied { document, page } => {
                    self.message = Some(format!("{}: page {}", self.name_of(document), page));
                }
                SessionEvent::NavigationDropped { page } => {
                    debug!(page, "jump dropped after document switch");
                }
                SessionEvent::NavigationFailed { page, message } => {
                    self.message = Some(format!("jump to page {} failed: {}", page, message));
                }
                SessionEvent::DocumentsReplaced { .. } | SessionEvent::ActiveDocumentChanged(_) => {}
            }
        }
        let state = self.session.state();
        if self.last_state.as_ref() != Some(&state) {
            self.last_state = Some(state);
            changed = true;
        }
        changed
    }

    fn name_of(&self, id: DocumentId) -> String {
        self.session
            .documents()
            .documents()
            .iter()
            .find(|doc| doc.id == id)
            .map(|doc| doc.name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    fn redraw<W: Write>(&self, renderer: &mut AnsiRenderer<W>, pending: Option<&str>) -> Result<()> {
        let (columns, rows) = terminal::size()?;
        let reference_rows = self.references.len().min(REFERENCE_ROWS) as u16;
        let result_rows = rows.saturating_sub(2 + reference_rows);

        renderer.begin_sync_update()?;
        let documents = self.session.documents();
        let labels = tab_labels(
            documents.documents().iter().map(|doc| doc.label()),
            columns as usize,
        );
        renderer.draw_tabs(&labels, documents.active_index(), 0)?;
        renderer.draw_result(
            &self.spans,
            self.scroll,
            DrawParams::clamped(1, columns, result_rows),
        )?;
        if reference_rows > 0 {
            renderer.draw_references(
                &self.references,
                DrawParams::clamped(1 + result_rows, columns, reference_rows),
            )?;
        }

        let status = truncate_with_ellipsis(self.status_line(pending), columns as usize);
        {
            let writer = renderer.writer();
            crossterm::execute!(
                writer,
                cursor::MoveTo(0, rows.saturating_sub(1)),
                Clear(ClearType::CurrentLine)
            )?;
            write_status_line(writer, &status)?;
        }
        renderer.end_sync_update()?;
        Ok(())
    }

    fn status_line(&self, pending: Option<&str>) -> String {
        let mut parts = Vec::new();
        match self.session.active() {
            Some(doc) => {
                let mut label = doc.name.clone();
                match self.session.state() {
                    SessionState::Ready if self.show_page_controls => {
                        if let Some(view) = self.surface.view().filter(|v| v.document == doc.id) {
                            label.push_str(&format!(" p.{}", view.page));
                        }
                    }
                    SessionState::Initializing => label.push_str(" (loading)"),
                    SessionState::Failed(_) => label.push_str(" (failed)"),
                    _ => {}
                }
                parts.push(label);
            }
            None => parts.push("no documents".to_string()),
        }
        if let Some(message) = &self.message {
            parts.push(message.clone());
        }
        if let Some(pending) = pending {
            parts.push(pending.to_string());
        }
        parts.join(" | ")
    }
}

fn init_logging(log_dir: &Path, console: bool) -> Result<WorkerGuard> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory {:?}", log_dir))?;

    let file_appender = tracing_appender::rolling::never(log_dir, "docview.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);
    let console_layer = console.then(|| tracing_subscriber::fmt::layer().with_writer(io::stderr));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}
