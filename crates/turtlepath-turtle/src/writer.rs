//! Stream-backed [`Emitter`]: turns the turtle's command/number/flag stream
//! into the text of a `d` attribute.
//!
//! Three formats:
//! - normal: single spaces between items, trailing newline at the end
//! - optimized: every droppable space dropped, `nl`/`sp` ignored
//! - prettyprint: each command starts a new line

use std::io::Write;

use crate::Emitter;

/// Formats a double with a fixed number of decimal places, then trims
/// trailing zeros and a dangling point. `-0` collapses to `0`.
pub fn double_to_string(val: f64, decimal_places: usize) -> String {
    let mut s = format!("{val:.decimal_places$}");

    if s.contains('.') {
        while s.ends_with('0') {
            s.pop();
        }
        if s.ends_with('.') {
            s.pop();
        }
    }

    if s == "-0" {
        s = "0".to_string();
    }

    s
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Normal,
    Optimized,
    Prettyprint,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ItemKind {
    Command,
    ZCommand,
    Number,
    Whitespace,
    Newline,
}

pub struct PathWriter {
    out: Box<dyn Write>,

    previous: ItemKind,
    first_command: bool,

    decimal_places: usize,
    format: OutputFormat,

    finished: bool,
    write_failed: bool,
}

impl PathWriter {
    pub fn new(out: Box<dyn Write>) -> Self {
        Self {
            out,
            previous: ItemKind::Whitespace,
            first_command: true,
            decimal_places: 4,
            format: OutputFormat::Normal,
            finished: false,
            write_failed: false,
        }
    }

    pub fn set_decimal_places(&mut self, n: usize) {
        self.decimal_places = n;
    }

    pub fn set_format(&mut self, format: OutputFormat) {
        self.format = format;
    }

    fn write(&mut self, text: &str) {
        if let Err(err) = self.out.write_all(text.as_bytes()) {
            if !self.write_failed {
                log::error!("writing path output failed: {err}");
            }
            self.write_failed = true;
        }
    }

    fn prev_is_whitespace(&self) -> bool {
        matches!(self.previous, ItemKind::Whitespace | ItemKind::Newline)
    }

    // Inter-item space, except in optimized output.
    fn finish_emit(&mut self) {
        if self.format != OutputFormat::Optimized && !self.prev_is_whitespace() {
            self.write(" ");
            self.previous = ItemKind::Whitespace;
        }
    }

    fn emit_value_separator(&mut self) {
        // Two adjacent numbers always need a space, even when optimized.
        if self.previous == ItemKind::Number {
            self.write(" ");
        } else {
            self.previous = ItemKind::Number;
        }
    }
}

impl Emitter for PathWriter {
    fn emit_char(&mut self, ch: char) {
        match ch {
            ' ' | '\n' => {
                if self.format != OutputFormat::Optimized {
                    self.write(if ch == ' ' { " " } else { "\n" });
                    self.previous = if ch == ' ' {
                        ItemKind::Whitespace
                    } else {
                        ItemKind::Newline
                    };
                }
            }

            _ => {
                if std::mem::take(&mut self.first_command) && ch != 'm' && ch != 'M' {
                    // SVG path data must start with a move.
                    self.write("M0 0");
                    self.previous = ItemKind::Number;
                }

                match self.format {
                    OutputFormat::Prettyprint => {
                        self.write("\n");
                        self.previous = ItemKind::Newline;
                    }
                    OutputFormat::Normal => {
                        if !self.prev_is_whitespace() {
                            self.write(" ");
                        }
                    }
                    OutputFormat::Optimized => {}
                }

                let mut buf = [0u8; 4];
                self.write(ch.encode_utf8(&mut buf));

                self.previous = if ch == 'z' || ch == 'Z' {
                    ItemKind::ZCommand
                } else {
                    ItemKind::Command
                };

                self.finish_emit();
            }
        }
    }

    fn emit_flag(&mut self, flag: bool) {
        self.emit_value_separator();
        self.write(if flag { "1" } else { "0" });
        self.finish_emit();
    }

    fn emit_number(&mut self, val: f64) {
        self.emit_value_separator();
        let text = double_to_string(val, self.decimal_places);
        self.write(&text);
        self.finish_emit();
    }

    fn emit_raw(&mut self, text: &str) {
        self.write(text);
    }

    fn finish(&mut self) {
        // Idempotent: a second call (say, after the SVG footer) only
        // flushes.
        if !std::mem::replace(&mut self.finished, true)
            && self.format == OutputFormat::Normal
            && self.previous != ItemKind::Newline
        {
            self.write("\n");
        }

        let _ = self.out.flush();
    }
}
