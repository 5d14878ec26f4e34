use std::io::{self, Write};

use anyhow::Result;
use crossterm::{
    cursor,
    event::{Event, KeyCode, KeyEvent, KeyModifiers},
    queue,
    style::{Attribute, Color, Print, ResetColor, SetAttribute, SetForegroundColor},
    terminal::{Clear, ClearType},
};
use docview_result::{PageReference, Span, TokenKind};

mod surface;

pub use surface::{SurfaceView, TerminalSurface};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMode {
    Always,
    Never,
}

pub struct AnsiRenderer<W: Write> {
    writer: W,
    color: ColorMode,
}

/// Region of the terminal a pane may draw into.
#[derive(Debug, Clone, Copy)]
pub struct DrawParams {
    pub top: u16,
    pub columns: u16,
    pub rows: u16,
}

impl DrawParams {
    pub fn clamped(top: u16, columns: u16, rows: u16) -> Self {
        Self {
            top,
            columns: columns.max(1),
            rows: rows.max(1),
        }
    }
}

impl<W: Write> AnsiRenderer<W> {
    pub fn new(writer: W, color: ColorMode) -> Self {
        Self { writer, color }
    }

    pub fn writer(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    /// Writes every span as a continuous stream, for non-interactive output.
    pub fn print_spans(&mut self, spans: &[Span]) -> Result<()> {
        for span in spans {
            self.styled(span.kind, &span.display_text())?;
        }
        queue!(self.writer, Print("\n"))?;
        self.writer.flush()?;
        Ok(())
    }

    /// Draws the lines of `spans` starting at line `scroll`, clipped to `params`.
    pub fn draw_result(&mut self, spans: &[Span], scroll: usize, params: DrawParams) -> Result<()> {
        let lines = split_lines(spans);
        let visible = lines.iter().skip(scroll).take(params.rows as usize);
        let mut row = params.top;
        for line in visible {
            queue!(
                self.writer,
                cursor::MoveTo(0, row),
                Clear(ClearType::CurrentLine)
            )?;
            let mut remaining = params.columns as usize;
            for (kind, text) in line {
                if remaining == 0 {
                    break;
                }
                let clipped: String = text.chars().take(remaining).collect();
                remaining -= clipped.chars().count();
                self.styled(*kind, &clipped)?;
            }
            row = row.saturating_add(1);
        }
        for blank in row..params.top.saturating_add(params.rows) {
            queue!(
                self.writer,
                cursor::MoveTo(0, blank),
                Clear(ClearType::CurrentLine)
            )?;
        }
        self.writer.flush()?;
        Ok(())
    }

    /// One row of document tabs; the active one is drawn reversed.
    pub fn draw_tabs(&mut self, labels: &[String], active: Option<usize>, row: u16) -> Result<()> {
        queue!(
            self.writer,
            cursor::MoveTo(0, row),
            Clear(ClearType::CurrentLine)
        )?;
        for (idx, label) in labels.iter().enumerate() {
            let text = format!(" {} ", label);
            if Some(idx) == active {
                queue!(
                    self.writer,
                    SetAttribute(Attribute::Reverse),
                    Print(text),
                    SetAttribute(Attribute::Reset)
                )?;
            } else {
                queue!(self.writer, Print(text))?;
            }
            queue!(self.writer, Print("|"))?;
        }
        self.writer.flush()?;
        Ok(())
    }

    pub fn draw_references(&mut self, references: &[PageReference], params: DrawParams) -> Result<()> {
        let width = params.columns as usize;
        for (offset, row) in (params.top..params.top.saturating_add(params.rows)).enumerate() {
            queue!(
                self.writer,
                cursor::MoveTo(0, row),
                Clear(ClearType::CurrentLine)
            )?;
            if let Some(reference) = references.get(offset) {
                let line = truncate_with_ellipsis(format_reference(offset + 1, reference), width);
                queue!(self.writer, Print(line))?;
            }
        }
        self.writer.flush()?;
        Ok(())
    }

    pub fn begin_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026h")?;
        Ok(())
    }

    /// The terminal renders all buffered changes at once.
    pub fn end_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026l")?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn clear_all(&mut self) -> Result<()> {
        crossterm::execute!(
            &mut self.writer,
            Clear(ClearType::All),
            cursor::MoveTo(0, 0)
        )?;
        Ok(())
    }

    fn styled(&mut self, kind: TokenKind, text: &str) -> Result<()> {
        let style = match self.color {
            ColorMode::Never => None,
            ColorMode::Always => token_style(kind),
        };
        match style {
            Some((color, bold)) => {
                queue!(self.writer, SetForegroundColor(color))?;
                if bold {
                    queue!(self.writer, SetAttribute(Attribute::Bold))?;
                }
                queue!(
                    self.writer,
                    Print(text),
                    SetAttribute(Attribute::Reset),
                    ResetColor
                )?;
            }
            None => queue!(self.writer, Print(text))?,
        }
        Ok(())
    }
}

fn token_style(kind: TokenKind) -> Option<(Color, bool)> {
    match kind {
        TokenKind::Key => Some((Color::Cyan, true)),
        TokenKind::String => Some((Color::Grey, false)),
        TokenKind::Boolean => Some((Color::Magenta, true)),
        TokenKind::Null => Some((Color::Red, false)),
        TokenKind::Number => Some((Color::Cyan, false)),
        TokenKind::Plain => None,
    }
}

pub type Line = Vec<(TokenKind, String)>;

/// Breaks spans at newlines into display lines of unescaped text.
pub fn split_lines(spans: &[Span]) -> Vec<Line> {
    let mut lines: Vec<Line> = vec![Vec::new()];
    for span in spans {
        let text = span.display_text();
        for (idx, piece) in text.split('\n').enumerate() {
            if idx > 0 {
                lines.push(Vec::new());
            }
            if !piece.is_empty() {
                if let Some(line) = lines.last_mut() {
                    line.push((span.kind, piece.to_owned()));
                }
            }
        }
    }
    lines
}

pub fn format_reference(number: usize, reference: &PageReference) -> String {
    match &reference.label {
        Some(label) => format!(
            "{:>2}. {} p.{}  {}",
            number, reference.document, reference.page, label
        ),
        None => format!("{:>2}. {} p.{}", number, reference.document, reference.page),
    }
}

/// Shortens each label so the whole strip fits `width` columns.
pub fn tab_labels<'a>(labels: impl IntoIterator<Item = &'a str>, width: usize) -> Vec<String> {
    let labels: Vec<&str> = labels.into_iter().collect();
    if labels.is_empty() {
        return Vec::new();
    }
    // Each tab carries two padding spaces and a separator.
    let per_tab = (width / labels.len()).saturating_sub(3).max(1);
    labels
        .into_iter()
        .map(|label| truncate_with_ellipsis(label.to_owned(), per_tab))
        .collect()
}

pub fn truncate_with_ellipsis(mut text: String, width: usize) -> String {
    if text.chars().count() > width {
        if width <= 3 {
            text = text.chars().take(width).collect();
        } else {
            let mut truncated = text.chars().take(width - 3).collect::<String>();
            truncated.push_str("...");
            text = truncated;
        }
    }
    text
}

pub fn write_status_line<W: Write>(writer: &mut W, label: &str) -> io::Result<()> {
    write!(writer, "{}", label)?;
    writer.flush()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    GotoPage { page: u32 },
    NextDocument,
    PrevDocument,
    OpenReference { number: usize },
    Scroll { delta: isize },
    Download,
    Quit,
    None,
}

/// Turns key presses into viewer actions, collecting a numeric prefix first.
#[derive(Debug, Default)]
pub struct EventMapper {
    pending_count: Option<usize>,
    pending_digits: String,
}

impl EventMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map_event(&mut self, event: Event) -> UiEvent {
        let Event::Key(KeyEvent {
            code, modifiers, ..
        }) = event
        else {
            return UiEvent::None;
        };

        match (code, modifiers) {
            (KeyCode::Char(c), KeyModifiers::NONE) if c.is_ascii_digit() => {
                if let Some(digit) = c.to_digit(10) {
                    self.push_digit(digit as usize);
                }
                UiEvent::None
            }
            (KeyCode::Char('c'), modifiers) if modifiers.contains(KeyModifiers::CONTROL) => {
                self.reset_count();
                UiEvent::Quit
            }
            (KeyCode::Char('g'), KeyModifiers::NONE) => {
                let page = u32::try_from(self.take_count()).unwrap_or(u32::MAX);
                UiEvent::GotoPage { page }
            }
            (KeyCode::Enter, _) => {
                let number = self.take_count();
                UiEvent::OpenReference { number }
            }
            (KeyCode::Tab, KeyModifiers::NONE) => {
                self.reset_count();
                UiEvent::NextDocument
            }
            (KeyCode::BackTab, _) => {
                self.reset_count();
                UiEvent::PrevDocument
            }
            (KeyCode::Char('j'), KeyModifiers::NONE) | (KeyCode::Down, KeyModifiers::NONE) => {
                let delta = self.take_count() as isize;
                UiEvent::Scroll { delta }
            }
            (KeyCode::Char('k'), KeyModifiers::NONE) | (KeyCode::Up, KeyModifiers::NONE) => {
                let delta = -(self.take_count() as isize);
                UiEvent::Scroll { delta }
            }
            (KeyCode::Char('d'), KeyModifiers::NONE) => {
                self.reset_count();
                UiEvent::Download
            }
            (KeyCode::Char('q'), _) | (KeyCode::Esc, _) => {
                self.reset_count();
                UiEvent::Quit
            }
            _ => {
                self.reset_count();
                UiEvent::None
            }
        }
    }

    fn push_digit(&mut self, digit: usize) {
        let current = self.pending_count.unwrap_or(0);
        let next = current.saturating_mul(10).saturating_add(digit);
        self.pending_count = Some(next);
        if let Some(c) = char::from_digit(digit as u32, 10) {
            self.pending_digits.push(c);
        }
    }

    fn take_count(&mut self) -> usize {
        let count = self
            .pending_count
            .take()
            .filter(|&count| count > 0)
            .unwrap_or(1);
        self.pending_digits.clear();
        count
    }

    fn reset_count(&mut self) {
        self.pending_count = None;
        self.pending_digits.clear();
    }

    pub fn pending_input(&self) -> Option<String> {
        if self.pending_digits.is_empty() {
            None
        } else {
            Some(self.pending_digits.clone())
        }
    }
}
