//! The debugger: source maps, tracing, backtraces, and chunk listing.
//!
//! Implements both debug-sink traits. During parsing it records, per chunk,
//! the source location and phase label of every compiled statement: a data
//! structure parallel to the engine's own chunk table. During execution it
//! prints trace points and remembers where the pen-height error happened.

use std::io::{self, Write};

use rustc_hash::FxHashMap;
use turtlepath_diagnostics::Location;
use turtlepath_engine::{
    DebugInfo, EngineDebugSink, EngineLocation, ParserDebugSink, SourceLocation, NO_CHUNK,
};

#[derive(Clone, Copy, Default)]
struct StatementInfo {
    label: Option<&'static str>,
    line: u32,
    col: u32,
}

#[derive(Default)]
struct ChunkDebugInfo {
    file_id: usize,
    is_call_frame: bool,
    statements: Vec<StatementInfo>,
}

#[derive(Default)]
pub struct Debugger {
    call_trace_level: u8,
    parse_trace_level: u8,
    report_breakpoints: bool,
    show_stacks: bool,

    /// Trace output goes to stdout when the path data does, so the trace
    /// interleaves with the SVG output it explains; otherwise stderr.
    trace_to_stdout: bool,

    // parser-fed state
    current_source: (usize, StatementInfo),
    filenames: FxHashMap<usize, String>,

    // chunk_index -> per-statement info, parallel to the engine's chunks
    chunks: Vec<ChunkDebugInfo>,

    pen_height_error_loc: Option<EngineLocation>,
}

impl Debugger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_call_trace_level(&mut self, level: u8) {
        self.call_trace_level = level;
    }

    pub fn set_parse_trace_level(&mut self, level: u8) {
        self.parse_trace_level = level;
    }

    pub fn set_report_breakpoints(&mut self, on: bool) {
        self.report_breakpoints = on;
    }

    pub fn set_show_stacks(&mut self, on: bool) {
        self.show_stacks = on;
    }

    pub fn set_trace_to_stdout(&mut self, on: bool) {
        self.trace_to_stdout = on;
    }

    pub fn needs_trace_stream(&self) -> bool {
        self.call_trace_level > 0 || self.report_breakpoints
    }

    fn trace_out(&self) -> Box<dyn Write> {
        if self.trace_to_stdout {
            Box::new(io::stdout())
        } else {
            Box::new(io::stderr())
        }
    }

    /// `file:line:col: ` (or `Line N:C: ` for the nameless stdin file),
    /// empty when nothing is known.
    fn location_prefix(&self, loc: EngineLocation) -> String {
        let (filename, source_loc) = self.source_location(loc);

        let mut out = String::new();

        if filename.is_empty() {
            if source_loc.is_valid() {
                out.push_str("Line ");
            }
        } else {
            out.push_str(&filename);
            out.push(':');
        }

        if source_loc.is_valid() {
            out.push_str(&format!("{}:{}:", source_loc.line, source_loc.col));
        }

        if !out.is_empty() {
            out.push(' ');
        }

        out
    }

    /// Maps an engine location back to (filename, source location).
    pub fn source_location(&self, loc: EngineLocation) -> (String, Location) {
        let Some(chunk) = self.chunks.get(loc.chunk_index) else {
            return (String::new(), Location::default());
        };

        let filename = self
            .filenames
            .get(&chunk.file_id)
            .cloned()
            .unwrap_or_default();

        let source_loc = chunk
            .statements
            .get(loc.statement_index)
            .map(|s| Location::new(s.line, s.col))
            .unwrap_or_default();

        (filename, source_loc)
    }

    pub fn pen_height_error_location(&self) -> Option<(String, Location)> {
        self.pen_height_error_loc.map(|loc| self.source_location(loc))
    }

    fn show_trace_point(
        &self,
        out: &mut dyn Write,
        phase: &str,
        loc: EngineLocation,
        stack_description: &str,
    ) {
        let label = self
            .chunks
            .get(loc.chunk_index)
            .and_then(|c| c.statements.get(loc.statement_index))
            .and_then(|s| s.label);

        let _ = write!(out, "{}{}", self.location_prefix(loc), phase);
        if let Some(label) = label {
            let _ = write!(out, " {label}");
        }
        let _ = write!(out, ":");

        if self.show_stacks && !stack_description.is_empty() {
            let _ = write!(out, " {stack_description}");
        }

        let _ = writeln!(out);
        let _ = out.flush();
    }

    pub fn show_backtrace(&self, call_stack: &[EngineLocation], stack_description: &str) {
        let mut err = io::stderr();

        if call_stack.is_empty() {
            let _ = writeln!(err, "Backtrace: empty! (Internal Error)");
            return;
        }

        let _ = writeln!(err);
        let _ = writeln!(err, "---- Backtrace: --------------------------");

        for (i, pc) in call_stack.iter().enumerate() {
            if pc.chunk_index == NO_CHUNK {
                let _ = write!(err, "Internal error: unrecognized chunk");
            } else if pc.chunk_index >= self.chunks.len() {
                let _ = write!(err, "Internal error: bad chunk index");
            } else {
                let _ = write!(err, "{}", self.location_prefix(*pc));
            }

            let what = if i == 0 {
                "main"
            } else if self
                .chunks
                .get(pc.chunk_index)
                .map(|c| c.is_call_frame)
                .unwrap_or(false)
            {
                "command function"
            } else {
                "local block"
            };

            let _ = writeln!(err, "{what}");
        }

        if !stack_description.is_empty() {
            let _ = writeln!(err, "------------------------------------------");
            let _ = writeln!(err, "Stacks: {stack_description}");
        }

        let _ = writeln!(err, "---- End of backtrace: -------------------");
    }

    pub fn list_chunks(&self, out: &mut dyn Write) {
        let _ = writeln!(out, " --------- Chunks --------------------------------");

        for (i, chunk) in self.chunks.iter().enumerate() {
            let _ = write!(out, "{i}: ");

            // Builtin chunks are never reported to the sink, so they show
            // up here as empty cells.
            if chunk.statements.is_empty() {
                let _ = writeln!(out, "builtin command function");
                continue;
            }

            let what = if chunk.is_call_frame {
                "command function"
            } else {
                "local block"
            };

            let _ = writeln!(
                out,
                "{what} ----- {} statement(s) -----",
                chunk.statements.len()
            );

            for info in &chunk.statements {
                let _ = writeln!(
                    out,
                    "  line {}:{} {}",
                    info.line,
                    info.col,
                    info.label.unwrap_or("")
                );
            }
        }

        let _ = writeln!(out, " --------- End of chunks -------------------------");
    }
}

impl ParserDebugSink for Debugger {
    fn add_source_file(&mut self, file_id: usize, filename: &str) {
        self.current_source.0 = file_id;
        self.filenames.insert(file_id, filename.to_string());
    }

    fn set_source_location(&mut self, loc: SourceLocation, label: Option<&'static str>) {
        self.current_source = (
            loc.file_id,
            StatementInfo {
                label,
                line: loc.line,
                col: loc.col,
            },
        );
    }
}

impl EngineDebugSink for Debugger {
    fn handle_new_chunk(&mut self, chunk_index: usize, is_call_frame: bool) {
        debug_assert!(chunk_index >= self.chunks.len());

        // Builtins are not reported, which leaves empty cells at the
        // start; they are few and small.
        while self.chunks.len() <= chunk_index {
            self.chunks.push(ChunkDebugInfo::default());
        }

        self.chunks[chunk_index].file_id = self.current_source.0;
        self.chunks[chunk_index].is_call_frame = is_call_frame;
    }

    fn handle_new_statement(&mut self, info: &DebugInfo<'_>) {
        let statement = self.current_source.1;

        let chunk = &mut self.chunks[info.loc.chunk_index];
        debug_assert_eq!(chunk.statements.len(), info.loc.statement_index);
        chunk.statements.push(statement);

        if self.parse_trace_level > 0 {
            let mut err = io::stderr();
            self.show_trace_point(&mut err, "Parse", info.loc, info.stack_description);
        }
    }

    fn want_stack_description(&self) -> bool {
        (self.parse_trace_level > 0 || self.call_trace_level > 0) && self.show_stacks
    }

    fn handle_trace_point(&mut self, info: &DebugInfo<'_>) {
        if self.call_trace_level == 0 {
            return;
        }

        let mut out = self.trace_out();

        // A blank line separates the trace from the path data it is
        // interleaved with.
        let _ = writeln!(out);

        self.show_trace_point(&mut *out, "Run", info.loc, info.stack_description);

        if self.call_trace_level > 1 {
            let _ = writeln!(
                out,
                " Turtle: xyd={:.2},{:.2},{:.2} ixy={:.2},{:.2}",
                info.turtle.x(),
                info.turtle.y(),
                info.turtle.dir(),
                info.turtle.initial_x(),
                info.turtle.initial_y(),
            );
        }
    }

    fn handle_pen_height_error(&mut self, loc: EngineLocation) {
        self.pen_height_error_loc = Some(loc);
    }

    fn handle_breakpoint(&mut self, loc: EngineLocation) {
        if self.report_breakpoints {
            let mut out = self.trace_out();
            let _ = write!(out, "{}", self.location_prefix(loc));
            let _ = writeln!(out, "--------- breakpoint ----------------");
            let _ = out.flush();
        }
    }
}
