//! Module imports, over real files in a temp directory.

use std::cell::RefCell;
use std::rc::Rc;

use turtlepath_diagnostics::{CollectingSink, SharedSink};
use turtlepath_engine::Engine;
use turtlepath_parser::Parser;
use turtlepath_turtle::{NullEmitter, SvgPathTurtle};

struct Run {
    messages: Vec<String>,
    has_error: bool,
    x: f64,
    y: f64,
}

fn run(source: &str) -> Run {
    let turtle = SvgPathTurtle::new(Box::new(NullEmitter));
    let mut engine = Engine::new(turtle, None);

    let collecting = Rc::new(RefCell::new(CollectingSink::new()));
    let sink: SharedSink = collecting.clone();

    let main_chunk;
    let has_error;
    {
        let mut parser = Parser::new(source, &mut engine, sink, None);
        parser.set_filename("main.turtle");
        parser.parse();

        main_chunk = parser.main_chunk();
        has_error = parser.has_error();
    }

    if !has_error {
        engine.execute_main(main_chunk).unwrap();
    }

    let run = Run {
        messages: collecting.borrow().messages(),
        has_error,
        x: engine.turtle().x(),
        y: engine.turtle().y(),
    };
    run
}

fn write_module(dir: &tempfile::TempDir, name: &str, contents: &str) -> String {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).unwrap();
    path.display().to_string()
}

const SHAPES: &str = "\
STEP = 4
def walk(n) { j (n * STEP) }
def corner() { j 1 r 90 }
";

#[test]
fn imported_definitions_are_callable() {
    let dir = tempfile::tempdir().unwrap();
    let shapes = write_module(&dir, "shapes.turtle", SHAPES);

    let r = run(&format!("import '{shapes}'\nwalk 3\n"));
    assert!(!r.has_error, "{:?}", r.messages);
    assert_eq!(r.x, 12.0);
}

#[test]
fn imported_constants_fold() {
    let dir = tempfile::tempdir().unwrap();
    let shapes = write_module(&dir, "shapes.turtle", SHAPES);

    let r = run(&format!("import '{shapes}'\nj STEP\n"));
    assert!(!r.has_error, "{:?}", r.messages);
    assert_eq!(r.x, 4.0);
}

#[test]
fn importing_the_same_file_twice_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let shapes = write_module(&dir, "shapes.turtle", SHAPES);

    let r = run(&format!("import '{shapes}'\nimport '{shapes}'\ncorner\n"));
    assert!(!r.has_error, "{:?}", r.messages);
    assert_eq!(r.x, 1.0);
}

#[test]
fn duplicate_names_are_reported_on_merge() {
    let dir = tempfile::tempdir().unwrap();
    let shapes = write_module(&dir, "shapes.turtle", SHAPES);

    let r = run(&format!("STEP = 1\nwalk = 2\nimport '{shapes}'\n"));
    assert!(r.has_error);
    assert!(r.messages.iter().any(|m| {
        m.contains("Some names were duplicates, and could not be imported: STEP walk")
    }));
}

#[test]
fn modules_may_import_other_modules() {
    let dir = tempfile::tempdir().unwrap();
    let base = write_module(&dir, "base.turtle", "UNIT = 2\n");
    let mid = write_module(
        &dir,
        "mid.turtle",
        &format!("import '{base}'\ndef hop() {{ j UNIT }}\n"),
    );

    let r = run(&format!("import '{mid}'\nhop\nj UNIT\n"));
    assert!(!r.has_error, "{:?}", r.messages);
    // hop jumps 2, then UNIT is visible here too (merged transitively)
    assert_eq!(r.x, 4.0);
}

#[test]
fn circular_imports_parse_once() {
    let dir = tempfile::tempdir().unwrap();

    let a_path = dir.path().join("a.turtle");
    let b_path = dir.path().join("b.turtle");

    std::fs::write(
        &a_path,
        format!("import '{}'\nA = 1\n", b_path.display()),
    )
    .unwrap();
    std::fs::write(
        &b_path,
        format!("import '{}'\nB = 2\n", a_path.display()),
    )
    .unwrap();

    let r = run(&format!("import '{}'\nj A\nj B\n", a_path.display()));
    // b's import of a hits the file map and becomes a no-op, so the chain
    // terminates; a ends up exporting both A and its merged copy of B.
    assert!(!r.has_error, "{:?}", r.messages);
    assert_eq!(r.x, 3.0);
}

#[test]
fn statements_are_not_allowed_in_modules() {
    let dir = tempfile::tempdir().unwrap();
    let bad = write_module(&dir, "bad.turtle", "f 10\n");

    let r = run(&format!("import '{bad}'\n"));
    assert!(r.has_error);
    assert!(r
        .messages
        .iter()
        .any(|m| m.contains("Statements are not allowed in imported modules")));
}

#[test]
fn runtime_value_definition_in_module_is_a_statement() {
    let dir = tempfile::tempdir().unwrap();
    let bad = write_module(&dir, "bad.turtle", "v = (unique + 1)\n");

    let r = run(&format!("import '{bad}'\n"));
    assert!(r.has_error);
    assert!(r
        .messages
        .iter()
        .any(|m| m.contains("Statements are not allowed in imported modules")));
}

#[test]
fn module_functions_may_contain_statements() {
    let dir = tempfile::tempdir().unwrap();
    let ok = write_module(
        &dir,
        "ok.turtle",
        "def zig(n) { for i = 1..n { j i } local = (unique) j local }\n",
    );

    let r = run(&format!("import '{ok}'\nzig 2\n"));
    assert!(!r.has_error, "{:?}", r.messages);
    // 1 + 2 + unique(=1)
    assert_eq!(r.x, 4.0);
}

#[test]
fn imports_must_be_at_global_scope() {
    let r = run("def g() { import 'x.turtle' }\n");
    assert!(r.has_error);
    assert!(r
        .messages
        .iter()
        .any(|m| m.contains("Import statements are only allowed at the global level")));
}

#[test]
fn missing_module_file_is_reported() {
    let r = run("import 'definitely_not_here.turtle'\n");
    assert!(r.has_error);
    assert!(r
        .messages
        .iter()
        .any(|m| m.contains("Importing definitely_not_here.turtle:")));
}

#[test]
fn module_errors_propagate_to_the_importer() {
    let dir = tempfile::tempdir().unwrap();
    let bad = write_module(&dir, "bad.turtle", "def broken( { }\n");

    let r = run(&format!("import '{bad}'\n"));
    assert!(r.has_error);
}

#[test]
fn diagnostics_name_the_module_file() {
    let dir = tempfile::tempdir().unwrap();
    let bad = write_module(&dir, "bad.turtle", "f 10\n");

    let r = run(&format!("import '{bad}'\n"));
    assert!(r
        .messages
        .iter()
        .any(|m| m.contains("bad.turtle:1:1: Error:")));
}

#[test]
fn empty_import_name_is_rejected() {
    let r = run("import ''\n");
    assert!(r.has_error);
    assert!(r
        .messages
        .iter()
        .any(|m| m.contains("Empty import module name")));
}
