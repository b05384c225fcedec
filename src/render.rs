//! Output rendering for confab.
//!
//! The conversation controller only talks to the [`Renderer`] trait: it hands over finished
//! messages, token estimates, and live snapshots of a streaming reply.  [`PlainTextRenderer`]
//! writes them to a terminal with optional ANSI styling, or prints just the payload of the
//! latest reply (see [`extract_content`]).

use std::io::{self, IsTerminal, Stdout, Write};
use std::time::Duration;

use crate::message::{Message, Role};
use crate::stream::Snapshot;
use crate::tokens::TokenEstimate;

/// ANSI escape code for bold text.
const ANSI_BOLD: &str = "\x1b[1m";

/// ANSI escape code to reset all styling.
const ANSI_RESET: &str = "\x1b[0m";

/// ANSI escape code for blue text (user turns).
const ANSI_BLUE: &str = "\x1b[34m";

/// ANSI escape code for green text (assistant turns).
const ANSI_GREEN: &str = "\x1b[32m";

/// ANSI escape code for red text (system messages and errors).
const ANSI_RED: &str = "\x1b[31m";

/// ANSI escape code that clears the current line.
const ANSI_CLEAR_LINE: &str = "\r\x1b[2K";

/// Delimiter of fenced code blocks.
const FENCE: &str = "```";

const SPINNER_FRAMES: &[char] = &['⠋', '⠙', '⠹', '⠸', '⠼', '⠴', '⠦', '⠧', '⠇', '⠏'];
const SPINNER_INTERVAL: Duration = Duration::from_millis(80);

/// A sink for everything the conversation shows the user.
pub trait Renderer: Send {
    /// Print finished messages.  System messages are not shown.
    fn print_messages(&mut self, messages: &[Message]);

    /// Print what would be sent, including system messages, and the estimates for it.
    fn print_tokens(&mut self, messages: &[Message], estimates: &[TokenEstimate]);

    /// Show the latest snapshot of a streaming reply.
    ///
    /// Snapshots arrive in order and each one extends the previous.
    fn update(&mut self, snapshot: &Snapshot);

    /// Called once a streaming reply has ended, successfully or not.
    fn finish_stream(&mut self);

    /// Print an error message.
    fn print_error(&mut self, error: &str);

    /// Print an informational message.
    fn print_info(&mut self, info: &str);

    /// Start an indicator for a call that shows nothing until it returns.
    ///
    /// The indicator stops when the returned value is dropped.
    fn start_waiting(&mut self) -> Option<WaitIndicator> {
        None
    }
}

fn role_color(role: Role) -> &'static str {
    match role {
        Role::User => ANSI_BLUE,
        Role::Assistant => ANSI_GREEN,
        Role::System => ANSI_RED,
    }
}

/// Plain text renderer with optional ANSI styling.
pub struct PlainTextRenderer<W: Write = Stdout> {
    out: W,
    use_color: bool,
    raw: bool,
    extract: bool,
    progress: bool,
    streamed: Option<usize>,
    pending: String,
}

impl PlainTextRenderer {
    /// Creates a new PlainTextRenderer with ANSI colors enabled.
    pub fn new() -> Self {
        Self::with_color(true)
    }

    /// Creates a new PlainTextRenderer with specified color setting.
    pub fn with_color(use_color: bool) -> Self {
        let mut renderer = Self::with_writer(io::stdout(), use_color);
        renderer.progress = io::stderr().is_terminal();
        renderer
    }
}

impl Default for PlainTextRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Write + Send> PlainTextRenderer<W> {
    /// Creates a renderer that writes to `out`.
    pub fn with_writer(out: W, use_color: bool) -> Self {
        Self {
            out,
            use_color,
            raw: false,
            extract: false,
            progress: false,
            streamed: None,
            pending: String::new(),
        }
    }

    /// Print only the content of the latest reply, without headers or styling.
    pub fn raw(mut self, raw: bool) -> Self {
        self.raw = raw;
        if raw {
            self.use_color = false;
            self.progress = false;
        }
        self
    }

    /// Print only the JSON document or longest code block of the latest reply.
    ///
    /// Streamed replies are held back until the stream finishes.
    pub fn extract(mut self, extract: bool) -> Self {
        self.extract = extract;
        if extract {
            self.use_color = false;
            self.progress = false;
        }
        self
    }

    /// Consumes the renderer, returning the writer.
    pub fn into_inner(self) -> W {
        self.out
    }

    fn flush(&mut self) {
        let _ = self.out.flush();
    }

    fn header(&mut self, role: Role) {
        if self.use_color {
            let _ = writeln!(
                self.out,
                "{ANSI_BOLD}{}{role}{ANSI_RESET}",
                role_color(role)
            );
        } else {
            let _ = writeln!(self.out, "{role}:");
        }
    }

    fn message(&mut self, message: &Message) {
        self.header(message.role);
        let _ = writeln!(self.out, "{}", message.content);
        let _ = writeln!(self.out);
    }
}

impl<W: Write + Send> Renderer for PlainTextRenderer<W> {
    fn print_messages(&mut self, messages: &[Message]) {
        if self.extract {
            if let Some(last) = messages.last().filter(|m| m.role == Role::Assistant) {
                let _ = writeln!(self.out, "{}", extract_content(&last.content));
            }
        } else if self.raw {
            if let Some(last) = messages.last().filter(|m| m.role == Role::Assistant) {
                let _ = writeln!(self.out, "{}", last.content);
            }
        } else {
            for message in messages.iter().filter(|m| m.role != Role::System) {
                self.message(message);
            }
        }
        self.flush();
    }

    fn print_tokens(&mut self, messages: &[Message], estimates: &[TokenEstimate]) {
        for message in messages {
            self.message(message);
        }
        let width = estimates
            .iter()
            .map(|e| e.model.len())
            .chain(["Model".len()])
            .max()
            .unwrap_or_default();
        let _ = writeln!(self.out, "{:<width$}  {:>8}  {:>10}", "Model", "Tokens", "Cost");
        for estimate in estimates {
            let _ = writeln!(
                self.out,
                "{:<width$}  {:>8}  {:>10}",
                estimate.model,
                estimate.tokens,
                format!("${:.5}", estimate.cost)
            );
        }
        self.flush();
    }

    fn update(&mut self, snapshot: &Snapshot) {
        if self.extract {
            self.pending.clone_from(&snapshot.content);
            self.streamed = Some(snapshot.content.len());
            return;
        }
        let printed = match self.streamed {
            Some(printed) => printed,
            None => {
                if !self.raw {
                    self.header(snapshot.role.unwrap_or(Role::Assistant));
                }
                0
            }
        };
        if let Some(suffix) = snapshot.content.get(printed..) {
            let _ = write!(self.out, "{suffix}");
        }
        self.streamed = Some(snapshot.content.len().max(printed));
        self.flush();
    }

    fn finish_stream(&mut self) {
        if self.extract {
            if self.streamed.take().is_some() {
                let pending = std::mem::take(&mut self.pending);
                let _ = writeln!(self.out, "{}", extract_content(&pending));
            }
        } else if self.streamed.take().is_some() {
            let _ = writeln!(self.out);
            if !self.raw {
                let _ = writeln!(self.out);
            }
        }
        self.flush();
    }

    fn print_error(&mut self, error: &str) {
        if self.use_color {
            eprintln!("{ANSI_RED}Error:{ANSI_RESET} {error}");
        } else {
            eprintln!("Error: {error}");
        }
    }

    fn print_info(&mut self, info: &str) {
        let _ = writeln!(self.out, "{info}");
        self.flush();
    }

    fn start_waiting(&mut self) -> Option<WaitIndicator> {
        self.progress.then(WaitIndicator::start)
    }
}

/// The payload of a reply: the JSON document it contains, else its longest fenced code block,
/// else the whole text.
pub fn extract_content(text: &str) -> String {
    extract_json(text)
        .or_else(|| extract_block(text))
        .unwrap_or_else(|| text.to_string())
}

/// Parses everything from the first line that opens an object or array as one JSON document.
fn extract_json(text: &str) -> Option<String> {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.iter().position(|line| {
        let line = line.trim_start();
        line.starts_with('{') || line.starts_with('[')
    })?;
    let value: serde_json::Value = serde_json::from_str(&lines[start..].join(" ")).ok()?;
    serde_json::to_string(&value).ok()
}

/// The longest non-empty fenced block, without its info string.
fn extract_block(text: &str) -> Option<String> {
    let pieces: Vec<&str> = text.split(FENCE).collect();
    let closed = pieces.len().saturating_sub(1);
    pieces[..closed]
        .iter()
        .skip(1)
        .step_by(2)
        .map(|block| strip_info_string(block).trim())
        .filter(|block| !block.is_empty())
        .max_by_key(|block| block.len())
        .map(str::to_string)
}

fn strip_info_string(block: &str) -> &str {
    match block.split_once('\n') {
        Some((info, body)) if !info.trim().contains(char::is_whitespace) => body,
        _ => block,
    }
}

/// An animated indicator on stderr that runs until dropped.
pub struct WaitIndicator {
    task: tokio::task::JoinHandle<()>,
}

impl WaitIndicator {
    /// Starts the indicator on the current tokio runtime.
    pub fn start() -> Self {
        let task = tokio::spawn(async {
            let mut interval = tokio::time::interval(SPINNER_INTERVAL);
            for frame in SPINNER_FRAMES.iter().cycle() {
                interval.tick().await;
                let mut stderr = io::stderr();
                let _ = write!(stderr, "\r{frame} waiting for reply");
                let _ = stderr.flush();
            }
        });
        Self { task }
    }
}

impl Drop for WaitIndicator {
    fn drop(&mut self) {
        self.task.abort();
        let mut stderr = io::stderr();
        let _ = write!(stderr, "{ANSI_CLEAR_LINE}");
        let _ = stderr.flush();
    }
}
