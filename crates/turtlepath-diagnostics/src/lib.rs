//! Turtlepath diagnostics.
//!
//! One line per diagnostic, in the classic compiler shape:
//!
//! ```text
//! spiral.turtle:12:5: Error: Name 'radius' is undefined
//! ```
//!
//! The library crates never print or exit on their own; they hand
//! [`Diagnostic`] values to a [`DiagnosticSink`], and the CLI decides what
//! happens to them.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "Error"),
            Severity::Warning => write!(f, "Warning"),
            Severity::Info => write!(f, "Info"),
        }
    }
}

/// A 1-based line/column position. Line 0 means "no location" (used for
/// builtins and for errors that precede any token).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Location {
    pub line: u32,
    pub col: u32,
}

impl Location {
    pub fn new(line: u32, col: u32) -> Self {
        Self { line, col }
    }

    pub fn is_valid(&self) -> bool {
        self.line > 0
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

/// Half-open source range, start inclusive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Span {
    pub start: Location,
    pub end: Location,
}

impl Span {
    pub fn new(start: Location, end: Location) -> Self {
        Self { start, end }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub filename: String,
    pub loc: Location,
    pub message: String,
}

impl Diagnostic {
    pub fn new(
        severity: Severity,
        filename: impl Into<String>,
        loc: Location,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            filename: filename.into(),
            loc,
            message: message.into(),
        }
    }

    pub fn error(filename: impl Into<String>, loc: Location, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, filename, loc, message)
    }

    pub fn warning(filename: impl Into<String>, loc: Location, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, filename, loc, message)
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // `Line 3:` when there is no filename, `foo.turtle:3:7:` when there
        // is, and no location prefix at all for location-free messages.
        if self.filename.is_empty() {
            if self.loc.is_valid() {
                write!(f, "Line {}: ", self.loc.line)?;
            }
        } else {
            write!(f, "{}:", self.filename)?;
            if self.loc.is_valid() {
                write!(f, "{}:{}:", self.loc.line, self.loc.col)?;
            }
            write!(f, " ")?;
        }

        write!(f, "{}: {}", self.severity, self.message)
    }
}

/// Where diagnostics go. Implementations choose to print, collect, or drop;
/// none of them terminate the process.
pub trait DiagnosticSink {
    fn report(&mut self, diag: Diagnostic);
}

/// Shared handle, so a parser and the sub-parsers it spawns for imports all
/// feed the same sink.
pub type SharedSink = Rc<RefCell<dyn DiagnosticSink>>;

/// Prints each diagnostic to stderr as it arrives.
#[derive(Default)]
pub struct StderrSink;

impl DiagnosticSink for StderrSink {
    fn report(&mut self, diag: Diagnostic) {
        eprintln!("{diag}");
    }
}

/// Collects diagnostics in memory. Used by tests, and anywhere output order
/// must be inspected.
#[derive(Default)]
pub struct CollectingSink {
    pub diagnostics: Vec<Diagnostic>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.diagnostics.iter().map(|d| d.to_string()).collect()
    }

    pub fn error_count(&self) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Error)
            .count()
    }
}

impl DiagnosticSink for CollectingSink {
    fn report(&mut self, diag: Diagnostic) {
        self.diagnostics.push(diag);
    }
}
