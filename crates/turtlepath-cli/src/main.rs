//! The turtlepath interpreter.
//!
//! Reads a turtle program, compiles it into the engine, runs it, and writes
//! the contents of an SVG path `d` attribute (optionally wrapped in a whole
//! `<svg>` document) to the output.

mod debugger;

use std::cell::RefCell;
use std::fs;
use std::io::{self, Read, Write};
use std::process::ExitCode;
use std::rc::Rc;

use anyhow::{bail, Context};
use clap::Parser as CommandLine;

use turtlepath_diagnostics::{Diagnostic, Severity, SharedSink, StderrSink};
use turtlepath_engine::Engine;
use turtlepath_parser::Parser;
use turtlepath_turtle::{OutputFormat, PathWriter, SvgConfig, SvgPathTurtle};

use debugger::Debugger;

#[derive(CommandLine)]
#[command(
    name = "turtlepath",
    version,
    about = "Interprets turtlepath programs and emits SVG path data"
)]
struct Options {
    /// Input program file; "-" or absent reads stdin
    input: Option<String>,

    /// Output file; "-" or absent writes stdout
    output: Option<String>,

    /// Drop unnecessary whitespace in the output
    #[arg(long, conflicts_with = "prettyprint")]
    optimize: bool,

    /// Put each SVG command on a separate line
    #[arg(long)]
    prettyprint: bool,

    /// Decimal places in the output
    #[arg(long, value_name = "N", default_value_t = 2)]
    decimal_places: usize,

    /// Disable the pen height warning
    #[arg(long = "no-pen-error")]
    no_pen_error: bool,

    /// Wrap the output in a basic 500x500 SVG file
    #[arg(short = 's')]
    svg: bool,

    /// Like -s, but configurable: "w h [bg-color path-fill path-stroke
    /// stroke-width linejoin linecap]"
    #[arg(long, value_name = "CONFIG")]
    svg_out: Option<String>,

    /// Line numbers on all errors; backtrace on execution errors
    #[arg(long)]
    debug: bool,

    /// Trace execution (twice for turtle state)
    #[arg(long, action = clap::ArgAction::Count)]
    trace: u8,

    /// Trace parsing
    #[arg(long = "trace-parse", action = clap::ArgAction::Count)]
    trace_parse: u8,

    /// Report when the 'breakpoint' command is encountered
    #[arg(long = "show-breaks")]
    show_breaks: bool,

    /// Show the list of all functions and local blocks
    #[arg(long = "list-chunks")]
    list_chunks: bool,
}

impl Options {
    fn wants_debugger(&self) -> bool {
        self.debug
            || self.trace > 0
            || self.trace_parse > 0
            || self.show_breaks
            || self.list_chunks
    }
}

fn is_stdio(name: &Option<String>) -> bool {
    match name {
        None => true,
        Some(name) => name.is_empty() || name == "-",
    }
}

fn read_input(options: &Options) -> anyhow::Result<(String, String)> {
    if is_stdio(&options.input) {
        let mut source = String::new();
        io::stdin()
            .read_to_string(&mut source)
            .context("reading stdin")?;
        return Ok((source, String::new()));
    }

    let name = options.input.clone().unwrap_or_default();
    let source = fs::read_to_string(&name).with_context(|| format!("reading {name}"))?;
    Ok((source, name))
}

fn open_output(options: &Options) -> anyhow::Result<Box<dyn Write>> {
    if is_stdio(&options.output) {
        return Ok(Box::new(io::stdout()));
    }

    let name = options.output.clone().unwrap_or_default();
    let file = fs::File::create(&name).with_context(|| format!("creating {name}"))?;
    Ok(Box::new(io::BufWriter::new(file)))
}

fn svg_config(options: &Options) -> anyhow::Result<SvgConfig> {
    let mut config = SvgConfig::default();

    if let Some(spec) = &options.svg_out {
        if !config.configure(spec) {
            bail!("Invalid config for --svg-out option");
        }
    } else if options.svg {
        config.enable();
    }

    Ok(config)
}

fn main() -> ExitCode {
    env_logger::builder().format_timestamp(None).init();

    let options = Options::parse();

    match run(&options) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(options: &Options) -> anyhow::Result<ExitCode> {
    let (source, input_name) = read_input(options)?;
    let svg = svg_config(options)?;

    // Debugger, when any debug flag asks for one.

    let debugger = if options.wants_debugger() {
        let mut d = Debugger::new();
        d.set_call_trace_level(options.trace);
        d.set_parse_trace_level(options.trace_parse);
        d.set_report_breakpoints(options.show_breaks);
        d.set_show_stacks(true);
        d.set_trace_to_stdout(is_stdio(&options.output));
        Some(Rc::new(RefCell::new(d)))
    } else {
        None
    };

    // Engine and output pipeline.

    let mut writer = PathWriter::new(open_output(options)?);
    writer.set_decimal_places(options.decimal_places);
    if options.optimize {
        writer.set_format(OutputFormat::Optimized);
    } else if options.prettyprint {
        writer.set_format(OutputFormat::Prettyprint);
    }

    let turtle = SvgPathTurtle::new(Box::new(writer));

    let engine_sink = debugger
        .clone()
        .map(|d| d as Rc<RefCell<dyn turtlepath_engine::EngineDebugSink>>);
    let mut engine = Engine::new(turtle, engine_sink);

    // Parse.

    let sink: SharedSink = Rc::new(RefCell::new(StderrSink));

    let main_chunk;
    let has_error;
    {
        let parser_sink = debugger
            .clone()
            .map(|d| d as Rc<RefCell<dyn turtlepath_engine::ParserDebugSink>>);

        let mut parser = Parser::new(&source, &mut engine, sink, parser_sink);
        parser.set_filename(&input_name);
        parser.parse();

        main_chunk = parser.main_chunk();
        has_error = parser.has_error();
    }

    if let (Some(debugger), true) = (&debugger, options.list_chunks) {
        debugger.borrow().list_chunks(&mut io::stderr());
    }

    if has_error {
        return Ok(ExitCode::FAILURE);
    }

    log::debug!("parse complete, main chunk {main_chunk}");

    // Execute, between the SVG header and footer when wrapping.

    if svg.enabled() {
        engine.turtle_mut().emit_raw(&svg.header());
    }

    let result = engine.execute_main(main_chunk);

    // The wrapper closes no matter how execution ended, so a failing run
    // still leaves a well-formed <svg> document behind.
    if svg.enabled() {
        engine.turtle_mut().emit_raw(&svg.footer());
        engine.turtle_mut().finish();
    }

    if let Err(err) = result {
        let (filename, loc) = match &debugger {
            Some(d) => d.borrow().source_location(engine.engine_location()),
            None => (String::new(), Default::default()),
        };

        eprintln!("{}", Diagnostic::new(Severity::Error, filename, loc, err.to_string()));

        if let Some(d) = &debugger {
            let (call_stack, stacks) = engine.get_backtrace();
            d.borrow().show_backtrace(&call_stack, &stacks);
        }

        return Ok(ExitCode::FAILURE);
    }

    // The pen-height problem is only a warning, reported after the run.
    if !options.no_pen_error && engine.has_pen_height_error() {
        let (filename, loc) = match &debugger {
            Some(d) => d
                .borrow()
                .pen_height_error_location()
                .unwrap_or_default(),
            None => (String::new(), Default::default()),
        };

        eprintln!(
            "{}",
            Diagnostic::new(
                Severity::Warning,
                filename,
                loc,
                "Pen height became negative. Results may be incorrect."
            )
        );
    }

    Ok(ExitCode::SUCCESS)
}
