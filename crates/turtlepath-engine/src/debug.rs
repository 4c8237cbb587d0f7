//! Debug-sink capabilities.
//!
//! The parser, the engine, and a debugger form a triangle; it is kept
//! acyclic by defining the two sink traits here and letting the driver own
//! the one object that implements both, handed around as a non-owning
//! `Rc<RefCell<dyn …>>`.

use turtlepath_turtle::SvgPathTurtle;

/// A position inside the compiled program: which chunk, which statement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineLocation {
    pub chunk_index: usize,
    pub statement_index: usize,
}

pub const NO_CHUNK: usize = usize::MAX;

impl EngineLocation {
    pub fn new(chunk_index: usize, statement_index: usize) -> Self {
        Self {
            chunk_index,
            statement_index,
        }
    }
}

/// A position in some source file, identified by the shared file map's id.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SourceLocation {
    pub file_id: usize,
    pub line: u32,
    pub col: u32,
}

/// Context handed to the engine-side sink calls.
pub struct DebugInfo<'a> {
    pub loc: EngineLocation,

    /// Execution-time turtle, for position traces.
    pub turtle: &'a SvgPathTurtle,

    /// May be empty; see [`EngineDebugSink::want_stack_description`].
    pub stack_description: &'a str,
}

/// Fed by the engine: program construction during parsing, then trace
/// points, breakpoints, and the pen-height error during execution.
pub trait EngineDebugSink {
    // parsing (builtin chunks are not reported)
    fn handle_new_chunk(&mut self, chunk_index: usize, is_call_frame: bool);
    fn handle_new_statement(&mut self, info: &DebugInfo<'_>);

    // execution
    fn want_stack_description(&self) -> bool;
    fn handle_trace_point(&mut self, info: &DebugInfo<'_>);
    fn handle_pen_height_error(&mut self, loc: EngineLocation);
    fn handle_breakpoint(&mut self, loc: EngineLocation);
}

/// Fed by the parser: which files exist, and where in the source the
/// statements being compiled right now come from.
pub trait ParserDebugSink {
    fn add_source_file(&mut self, file_id: usize, filename: &str);
    fn set_source_location(&mut self, loc: SourceLocation, label: Option<&'static str>);
}
