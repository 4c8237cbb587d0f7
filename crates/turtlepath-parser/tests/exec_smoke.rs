//! End-to-end: parse a program, execute it, look at the turtle and the
//! emitted path data.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use turtlepath_diagnostics::{CollectingSink, SharedSink};
use turtlepath_engine::{Engine, StackSize};
use turtlepath_parser::Parser;
use turtlepath_turtle::{PathWriter, SvgPathTurtle};

#[derive(Clone, Default)]
struct SharedBuf(Rc<RefCell<Vec<u8>>>);

impl io::Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct Run {
    output: String,
    messages: Vec<String>,
    has_error: bool,
    exec_error: Option<String>,
    x: f64,
    y: f64,
    dir: f64,
}

fn run(source: &str) -> Run {
    let buf = SharedBuf::default();
    let contents = buf.0.clone();

    let mut writer = PathWriter::new(Box::new(buf));
    writer.set_decimal_places(2);

    let turtle = SvgPathTurtle::new(Box::new(writer));
    let mut engine = Engine::new(turtle, None);

    // Small enough that the runaway-recursion test errors out well before
    // the test thread's own stack runs dry.
    engine.set_recursion_limit(2_000);

    let collecting = Rc::new(RefCell::new(CollectingSink::new()));
    let sink: SharedSink = collecting.clone();

    let main_chunk;
    let has_error;
    {
        let mut parser = Parser::new(source, &mut engine, sink, None);
        parser.set_filename("test.turtle");
        parser.parse();

        main_chunk = parser.main_chunk();
        has_error = parser.has_error();
    }

    let exec_error = if has_error {
        None
    } else {
        let result = engine.execute_main(main_chunk);

        if result.is_ok() {
            // Both stacks drain completely on every successful run.
            assert_eq!(engine.stack_size(), StackSize::default());
        }

        result.err().map(|e| e.to_string())
    };

    let run = Run {
        output: String::from_utf8(contents.borrow().clone()).unwrap(),
        messages: collecting.borrow().messages(),
        has_error,
        exec_error,
        x: engine.turtle().x(),
        y: engine.turtle().y(),
        dir: engine.turtle().dir(),
    };
    run
}

fn run_ok(source: &str) -> Run {
    let r = run(source);
    assert!(
        !r.has_error && r.exec_error.is_none(),
        "unexpected failure: {:?} / {:?}",
        r.messages,
        r.exec_error
    );
    r
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

// ===================== plain commands and values =====================

#[test]
fn forward_emits_a_line() {
    let r = run_ok("f 10");
    assert_eq!(r.output, "M 0 0 L 10 0 \n");
}

#[test]
fn constant_value_folds_into_the_call() {
    // constant-only expressions fold at parse time
    let r = run_ok("PI = 3.14159  r (PI + 0)");
    assert!(close(r.dir, 3.14159));
    // nothing drawn; only the closing newline
    assert_eq!(r.output, "\n");
}

#[test]
fn runtime_value_gets_a_global_slot() {
    let r = run_ok("side = (unique * 10)  j side  j side");
    // unique yields 1, evaluated once at the definition
    assert!(close(r.x, 20.0));
}

#[test]
fn precedence_and_associativity() {
    assert!(close(run_ok("j (2 + 3 * 4)").x, 14.0));
    assert!(close(run_ok("j (10 - 3 - 2)").x, 5.0)); // left-to-right
    assert!(close(run_ok("j (2 ** 3 ** 2)").x, 512.0)); // right-to-left
    assert!(close(run_ok("j (1 + 2 == 3)").x, 1.0));
    assert!(close(run_ok("j (0 || 7)").x, 7.0));
    assert!(close(run_ok("j (2 && 7)").x, 7.0));
}

#[test]
fn ternary_parses_middle_as_parenthesized() {
    assert!(close(run_ok("j (1 ? 2 : 3)").x, 2.0));
    assert!(close(run_ok("j (0 ? 2 : 3)").x, 3.0));
    // nested: right-to-left
    assert!(close(run_ok("j (0 ? 1 : 0 ? 2 : 3)").x, 3.0));
}

#[test]
fn unary_operators() {
    assert!(close(run_ok("j -3").x, -3.0));
    assert!(close(run_ok("j +5").x, 5.0));
    assert!(close(run_ok("j !0").x, 1.0));
    assert!(close(run_ok("j !2").x, 0.0));
    // unary minus binds tighter than '*': -2**2 is -(2**2)
    assert!(close(run_ok("j -2 ** 2").x, -4.0));
}

#[test]
fn turtle_state_expressions() {
    let r = run_ok("j 10  j turtle.x");
    assert!(close(r.x, 20.0));

    let r = run_ok("r 45  d (turtle.dir * 2)");
    assert!(close(r.dir, 90.0));
}

#[test]
fn unique_counts_up_from_one() {
    let r = run_ok("j unique  j unique  j unique");
    assert!(close(r.x, 6.0));
}

#[test]
fn command_arguments_are_prefix_expressions() {
    // two arguments, no commas
    let r = run_ok("m 10 20  f 5");
    assert!(close(r.x, 15.0));
    assert!(close(r.y, 20.0));
}

// ===================== control flow =====================

#[test]
fn if_else_branches() {
    assert!(close(run_ok("if 1 { j 1 } else { j 100 }").x, 1.0));
    assert!(close(run_ok("if 0 { j 1 } else { j 100 }").x, 100.0));
    assert!(close(run_ok("if 0 { j 1 }").x, 0.0));
    // 'else if' chains
    let r = run_ok("x = (unique - 1)  if x == 1 { j 1 } else if x == 0 { j 2 } else { j 3 }");
    assert!(close(r.x, 2.0));
}

#[test]
fn if_takes_a_single_statement_body() {
    assert!(close(run_ok("if 1 j 7").x, 7.0));
}

#[test]
fn count_loop_truncates() {
    assert!(close(run_ok("for 3 { j 2 }").x, 6.0));
    assert!(close(run_ok("for 3.9 { j 2 }").x, 6.0));
    assert!(close(run_ok("for 0 { j 2 }").x, 0.0));
}

#[test]
fn range_loop_direction_follows_endpoints() {
    // ascending: 1, 2, 3
    assert!(close(run_ok("for i = 1..3 { j i }").x, 6.0));
    // descending: 3, 2, 1: three iterations
    assert!(close(run_ok("for 3..1 { j 10 }").x, 30.0));
}

#[test]
fn stepped_range_loop() {
    // iterations at 1 and 6
    assert!(close(run_ok("for 1..5..10 { j 1 }").x, 2.0));
    // descending uses |step|
    assert!(close(run_ok("for i = 10..3..1 { j i }").x, 10.0 + 7.0 + 4.0 + 1.0));
}

#[test]
fn named_loop_var_requires_a_range() {
    let r = run(
        "for i = 3 { j i }", // error: named var without '..'
    );
    assert!(r.has_error);
    assert!(r
        .messages
        .iter()
        .any(|m| m.contains("the loop must use '..'")));
}

#[test]
fn loop_var_scope_ends_with_the_loop() {
    let r = run("for i = 1..2 { j i }  j i");
    assert!(r.has_error);
    assert!(r.messages.iter().any(|m| m.contains("Undefined name: i")));
}

// ===================== functions and recursion =====================

#[test]
fn user_function_call() {
    let r = run_ok("def step(n) { j n r 90 }  step 5  step 5");
    assert!(close(r.x, 5.0));
    assert!(close(r.y, 5.0));
    assert!(close(r.dir, 180.0));
}

#[test]
fn self_recursion_terminates() {
    // four invocations, arguments 3 2 1 0
    let r = run_ok("def fall(n) { if n { j 1 fall (n - 1) } }  fall 3");
    assert!(close(r.x, 3.0));
}

#[test]
fn calls_parse_back_to_back() {
    let r = run_ok("def one(n) { j n }  one 4 one 5");
    // "one 4" consumes the single parameter; "one 5" is then a fresh call
    assert!(close(r.x, 9.0));
}

#[test]
fn lambda_parameter_runs_the_argument() {
    let r = run_ok("def run(g()) { g }  run { f 10 }");
    assert!(close(r.x, 10.0));
    assert!(r.output.contains("L 10 0"));
}

#[test]
fn lambda_parameter_with_values() {
    let r = run_ok("def twice(g(v)) { g 1 g 2 }  twice {=> (x) j x}");
    assert!(close(r.x, 3.0));
}

#[test]
fn named_function_as_lambda_argument() {
    let r = run_ok("def apply(g(v)) { g 3 }  def jmp(n) { j n }  apply jmp");
    assert!(close(r.x, 3.0));
}

#[test]
fn lambda_param_forwarded_to_another_function() {
    let r = run_ok("def a(g()) { g }  def b(g()) { a g }  b { j 5 }");
    assert!(close(r.x, 5.0));
}

#[test]
fn lambda_argument_may_take_fewer_values() {
    // callee offers one value; the lambda ignores it
    let r = run_ok("def each(g(v)) { g 1 g 2 }  each { j 10 }");
    assert!(close(r.x, 20.0));
}

// ===================== closures =====================

#[test]
fn closure_captures_enclosing_local() {
    let r = run_ok("def outer(v) { def inner() { j v } inner inner }  outer 5");
    assert!(close(r.x, 10.0));
}

#[test]
fn captures_cascade_through_intermediate_functions() {
    let r = run_ok(
        "def outer(v) { def mid() { def inner() { j v } inner } mid }  outer 7",
    );
    assert!(close(r.x, 7.0));
}

#[test]
fn global_constant_reaches_nested_functions_by_folding() {
    let r = run_ok("a = 5  def outer() { def inner() { r a } inner }  outer");
    assert!(close(r.dir, 5.0));
}

#[test]
fn anonymous_lambda_captures_mid_argument_list() {
    let r = run_ok(
        "def draw(g(v)) { g 4 }  def outer(k) { draw {=> (x) j (x + k)} }  outer 10",
    );
    assert!(close(r.x, 14.0));
}

#[test]
fn closure_with_self_recursion() {
    let r = run_ok(
        "def outer(step) { def walk(m) { if m { j step walk (m - 1) } } walk 3 }  outer 2",
    );
    assert!(close(r.x, 6.0));
}

#[test]
fn sibling_closures_each_get_their_own_slot() {
    let r = run_ok(
        "def outer(a b) {\n\
         def first() { j a }\n\
         def second() { j b }\n\
         first second\n\
         }\n\
         outer 1 20",
    );
    assert!(close(r.x, 21.0));
}

// ===================== errors =====================

#[test]
fn undefined_command_reports_and_recovers() {
    let r = run("zap 3\nj 4");
    assert!(r.has_error);
    assert!(r
        .messages
        .iter()
        .any(|m| m.contains("Name 'zap' is undefined")));
}

#[test]
fn value_used_as_command() {
    let r = run("x = 3  x 4");
    assert!(r.has_error);
    assert!(r
        .messages
        .iter()
        .any(|m| m.contains("Name 'x' is not a command or lambda function")));
}

#[test]
fn missing_argument_is_reported() {
    let r = run("f");
    assert!(r.has_error);
    assert!(r
        .messages
        .iter()
        .any(|m| m.contains("Missing parameter 1 ('distance') in call to f()")));
}

#[test]
fn signature_mismatch_is_reported() {
    let r = run("def apply(g(v)) { g 3 }  def bad(a b) { }  apply bad");
    assert!(r.has_error);
    assert!(r.messages.iter().any(|m| {
        m.contains("Function signature of 'bad' does not match parameter 1 ('g(v)') in call to apply()")
    }));
}

#[test]
fn recursive_value_definition_is_reported() {
    let r = run("x = x");
    assert!(r.has_error);
    assert!(r
        .messages
        .iter()
        .any(|m| m.contains("Name 'x' is recursively defined")));
}

#[test]
fn duplicate_definition_is_reported() {
    let r = run("x = 1\nx = 2");
    assert!(r.has_error);
    assert!(r
        .messages
        .iter()
        .any(|m| m.contains("Name 'x' is already defined")));
}

#[test]
fn invalid_number_is_reported() {
    let r = run("j 1e-");
    assert!(r.has_error);
    assert!(r.messages.iter().any(|m| m.contains("Invalid number: '1e-'")));
}

#[test]
fn unterminated_string_is_reported() {
    let r = run("import 'nope");
    assert!(r.has_error);
    assert!(r
        .messages
        .iter()
        .any(|m| m.contains("Unterminated string constant")));
}

#[test]
fn stray_brace_at_global_level() {
    let r = run("}");
    assert!(r.has_error);
    assert!(r.messages.iter().any(|m| m.contains("Unexpected token: }")));
}

#[test]
fn too_complex_expression_panics_and_recovers() {
    let source = format!("x = {}1{}\nj 4", "(".repeat(2100), ")".repeat(2100));
    let r = run(&source);
    assert!(r.has_error);
    assert!(r
        .messages
        .iter()
        .any(|m| m.contains("Expression too complex to parse")));
}

#[test]
fn errors_keep_parsing_for_more_diagnostics() {
    let r = run("zap 1\nzing 2\nj 3");
    assert!(r.has_error);
    let count = r
        .messages
        .iter()
        .filter(|m| m.contains("is undefined"))
        .count();
    assert_eq!(count, 2);
}

#[test]
fn diagnostics_carry_file_line_and_column() {
    let r = run("j 1\n  zap 2");
    assert!(r
        .messages
        .iter()
        .any(|m| m.starts_with("test.turtle:2:3: Error:")));
}

// ===================== runtime errors =====================

#[test]
fn pop_on_empty_stack_is_a_runtime_error() {
    let r = run("pop");
    assert!(!r.has_error);
    assert_eq!(r.exec_error.as_deref(), Some("Empty stack in 'pop' command."));
}

#[test]
fn parallel_lines_in_q() {
    let r = run("q 10 0 180");
    assert_eq!(
        r.exec_error.as_deref(),
        Some("Parallel lines in q or Q command.")
    );
}

#[test]
fn runaway_recursion_is_a_runtime_error() {
    let r = run("def f(n) { f (n + 1) }  f 0");
    assert!(!r.has_error);
    assert!(r
        .exec_error
        .as_deref()
        .unwrap_or("")
        .contains("Stack overflow"));
}

// ===================== output shapes =====================

#[test]
fn square_closes_with_z() {
    let r = run_ok("f 10 r 90 f 10 r 90 f 10 z");
    assert_eq!(r.output, "M 0 0 L 10 0 L 10 10 L 0 10 Z \n");
}

#[test]
fn pen_up_suppresses_drawing() {
    let r = run_ok("up f 10 down f 5");
    assert_eq!(r.output, "M 10 0 L 15 0 \n");
}

#[test]
fn breakpoint_is_invisible_without_a_debugger() {
    let r = run_ok("f 1 breakpoint f 1");
    assert_eq!(r.output, "M 0 0 L 1 0 L 2 0 \n");
}
