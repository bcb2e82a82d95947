//! Terminal transcript rendering for the CLI.
//!
//! `Renderer` writes whole transcripts (for `history`) and status lines;
//! `StreamPrinter` follows a thread's message list while a run is streaming
//! and prints only what is new since the previous snapshot.

use crate::config::DisplayConfig;
use crate::types::{Message, ToolCall, ToolMessage};
use crossterm::style::{Color, Stylize};
use std::io::{self, Write};

const INDENT: &str = "  ";
const GLYPH_TOOL_CALL: &str = "→";
const GLYPH_TOOL_RESULT: &str = "←";
const PREVIEW_WIDTH: usize = 120;

/// Styled line writer shared by every CLI subcommand.
#[derive(Debug, Clone, Copy)]
pub struct Renderer {
    color: bool,
    show_tool_calls: bool,
}

impl Renderer {
    pub fn new(color: bool, show_tool_calls: bool) -> Self {
        Self {
            color,
            show_tool_calls,
        }
    }

    pub fn from_config(display: &DisplayConfig, no_color: bool) -> Self {
        Self::new(display.color && !no_color, display.show_tool_calls)
    }

    /// Renderer for messages printed before configuration is available.
    pub fn startup(no_color: bool) -> Self {
        Self::new(!no_color, true)
    }

    /// Print every message of a transcript.
    pub fn transcript<W: Write>(&self, out: &mut W, messages: &[Message]) -> io::Result<()> {
        for message in messages {
            self.message(out, message)?;
        }
        Ok(())
    }

    /// Print one complete message.
    pub fn message<W: Write>(&self, out: &mut W, message: &Message) -> io::Result<()> {
        match message {
            Message::Human(text) => {
                self.label(out, "you", Color::Cyan)?;
                writeln!(out, "{}", text.content)
            }
            Message::System(text) => {
                self.label(out, "system", Color::DarkGrey)?;
                writeln!(out, "{}", text.content)
            }
            Message::Ai(ai) => {
                self.ai_label(out, ai.node_id.as_deref())?;
                writeln!(out, "{}", ai.content)?;
                for call in &ai.tool_calls {
                    self.tool_call(out, call)?;
                }
                Ok(())
            }
            Message::Tool(tool) => self.tool_result(out, tool),
        }
    }

    fn ai_label<W: Write>(&self, out: &mut W, node: Option<&str>) -> io::Result<()> {
        match node {
            Some(node) => self.label(out, &format!("assistant ({node})"), Color::Green),
            None => self.label(out, "assistant", Color::Green),
        }
    }

    fn label<W: Write>(&self, out: &mut W, label: &str, color: Color) -> io::Result<()> {
        if self.color {
            write!(out, "{} ", format!("{label}:").with(color).bold())
        } else {
            write!(out, "{label}: ")
        }
    }

    pub fn tool_call<W: Write>(&self, out: &mut W, call: &ToolCall) -> io::Result<()> {
        if !self.show_tool_calls {
            return Ok(());
        }
        let args = preview(&call.args);
        if self.color {
            writeln!(
                out,
                "{INDENT}{} {}({})",
                GLYPH_TOOL_CALL.with(Color::Magenta),
                call.name.as_str().bold(),
                args.with(Color::DarkGrey),
            )
        } else {
            writeln!(out, "{INDENT}{GLYPH_TOOL_CALL} {}({args})", call.name)
        }
    }

    pub fn tool_result<W: Write>(&self, out: &mut W, tool: &ToolMessage) -> io::Result<()> {
        if !self.show_tool_calls {
            return Ok(());
        }
        let content = preview(&tool.content);
        let color = if tool.is_error { Color::Red } else { Color::DarkGrey };
        if self.color {
            writeln!(
                out,
                "{INDENT}{} {}: {}",
                GLYPH_TOOL_RESULT.with(color),
                tool.name.as_str().bold(),
                content.with(color),
            )
        } else {
            writeln!(out, "{INDENT}{GLYPH_TOOL_RESULT} {}: {content}", tool.name)
        }
    }

    pub fn error<W: Write>(&self, out: &mut W, message: &str) -> io::Result<()> {
        if self.color {
            writeln!(out, "{} {message}", "error:".with(Color::Red).bold())
        } else {
            writeln!(out, "error: {message}")
        }
    }

    pub fn warn<W: Write>(&self, out: &mut W, message: &str) -> io::Result<()> {
        if self.color {
            writeln!(out, "{} {message}", "warning:".with(Color::Yellow).bold())
        } else {
            writeln!(out, "warning: {message}")
        }
    }

    /// Key/value row used by list-style subcommands.
    pub fn field<W: Write>(&self, out: &mut W, key: &str, value: &str) -> io::Result<()> {
        if self.color {
            writeln!(out, "{INDENT}{} {value}", format!("{key}:").with(Color::DarkGrey))
        } else {
            writeln!(out, "{INDENT}{key}: {value}")
        }
    }

    pub fn heading<W: Write>(&self, out: &mut W, title: &str) -> io::Result<()> {
        if self.color {
            writeln!(out, "{} {}", "•".with(Color::Blue), title.bold())
        } else {
            writeln!(out, "{title}")
        }
    }
}

/// Prints the growing tail of a streaming thread.
///
/// Messages before `start` are treated as already shown. Text is printed as
/// it arrives; tool calls are printed once their AI message is complete,
/// since their `args` stream in fragments.
#[derive(Debug)]
pub struct StreamPrinter {
    renderer: Renderer,
    index: usize,
    printed_chars: usize,
    label_printed: bool,
}

impl StreamPrinter {
    pub fn new(renderer: Renderer, start: usize) -> Self {
        Self {
            renderer,
            index: start,
            printed_chars: 0,
            label_printed: false,
        }
    }

    /// Print whatever `messages` holds beyond the previous call.
    pub fn update<W: Write>(&mut self, out: &mut W, messages: &[Message]) -> io::Result<()> {
        while let Some(message) = messages.get(self.index) {
            let is_last = self.index + 1 == messages.len();
            match message {
                Message::Ai(ai) => {
                    let Some(delta) = ai.content.get(self.printed_chars..) else {
                        // Finalize replaced the message with different text.
                        return Ok(());
                    };
                    if !self.label_printed && !(ai.content.is_empty() && is_last) {
                        self.renderer.ai_label(out, ai.node_id.as_deref())?;
                        self.label_printed = true;
                    }
                    write!(out, "{delta}")?;
                    self.printed_chars = ai.content.len();
                    if is_last {
                        break;
                    }
                    if self.label_printed {
                        writeln!(out)?;
                    }
                    for call in &ai.tool_calls {
                        self.renderer.tool_call(out, call)?;
                    }
                }
                Message::Tool(tool) => self.renderer.tool_result(out, tool)?,
                Message::Human(_) | Message::System(_) => {}
            }
            self.advance();
        }
        out.flush()
    }

    /// Close out the last message once the run is over.
    pub fn finish<W: Write>(&mut self, out: &mut W, messages: &[Message]) -> io::Result<()> {
        self.update(out, messages)?;
        if let Some(Message::Ai(ai)) = messages.get(self.index) {
            if self.label_printed {
                writeln!(out)?;
            }
            for call in &ai.tool_calls {
                self.renderer.tool_call(out, call)?;
            }
            self.advance();
        }
        out.flush()
    }

    /// Index of the first message not yet fully printed.
    pub fn position(&self) -> usize {
        self.index
    }

    fn advance(&mut self) {
        self.index += 1;
        self.printed_chars = 0;
        self.label_printed = false;
    }
}

fn preview(text: &str) -> String {
    let line = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if line.chars().count() <= PREVIEW_WIDTH {
        return line;
    }
    let mut clipped: String = line.chars().take(PREVIEW_WIDTH - 1).collect();
    clipped.push('…');
    clipped
}
