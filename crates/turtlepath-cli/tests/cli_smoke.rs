//! Drives the built binary end to end.

use std::io::Write;
use std::process::{Command, Stdio};

fn run_with_args(code: &str, args: &[&str]) -> (String, String, bool) {
    let mut child = Command::new(env!("CARGO_BIN_EXE_turtlepath"))
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    child
        .stdin
        .as_mut()
        .unwrap()
        .write_all(code.as_bytes())
        .unwrap();

    let out = child.wait_with_output().unwrap();

    (
        String::from_utf8_lossy(&out.stdout).to_string(),
        String::from_utf8_lossy(&out.stderr).to_string(),
        out.status.success(),
    )
}

fn run(code: &str) -> (String, String, bool) {
    run_with_args(code, &[])
}

#[test]
fn draws_a_line() {
    let (stdout, _, ok) = run("f 10\n");
    assert!(ok);
    assert_eq!(stdout, "M 0 0 L 10 0 \n");
}

#[test]
fn optimize_drops_spacing() {
    let (stdout, _, ok) = run_with_args("f 10 r 90 f 5\n", &["--optimize"]);
    assert!(ok);
    assert_eq!(stdout, "M0 0L10 0L10 5");
}

#[test]
fn prettyprint_breaks_lines() {
    let (stdout, _, ok) = run_with_args("f 10\n", &["--prettyprint"]);
    assert!(ok);
    assert_eq!(stdout, "\nM 0 0 \nL 10 0 ");
}

#[test]
fn decimal_places_are_configurable() {
    let (stdout, _, ok) = run_with_args("f 1.23456\n", &["--decimal-places", "4"]);
    assert!(ok);
    assert!(stdout.contains("1.2346"), "{stdout}");
}

#[test]
fn svg_wrapper() {
    let (stdout, _, ok) = run_with_args("f 10\n", &["-s"]);
    assert!(ok);
    assert!(stdout.starts_with("<svg viewbox=\"0 0 500 500\""));
    assert!(stdout.contains("d=\"M 0 0 L 10 0"));
    assert!(stdout.trim_end().ends_with("</svg>"));
}

#[test]
fn svg_out_config() {
    let (stdout, _, ok) = run_with_args("f 10\n", &["--svg-out", "800 600 black"]);
    assert!(ok);
    assert!(stdout.contains("width=\"800\" height=\"600\""));
    assert!(stdout.contains("fill=\"black\""));
}

#[test]
fn parse_errors_exit_nonzero_and_skip_execution() {
    let (stdout, stderr, ok) = run("zap 3\n");
    assert!(!ok);
    assert!(stdout.is_empty());
    assert!(stderr.contains("Error: Name 'zap' is undefined"));
}

#[test]
fn execution_errors_exit_nonzero() {
    let (_, stderr, ok) = run("pop\n");
    assert!(!ok);
    assert!(stderr.contains("Empty stack in 'pop' command."));
}

#[test]
fn svg_wrapper_closes_on_execution_error() {
    let (stdout, stderr, ok) = run_with_args("f 5 pop\n", &["-s"]);
    assert!(!ok);
    assert!(stderr.contains("Empty stack in 'pop' command."));
    // whatever was drawn before the error is still a closed document
    assert!(stdout.contains("d=\"M 0 0 L 5 0"));
    assert!(stdout.trim_end().ends_with("</svg>"));
}

#[test]
fn pen_height_warning_after_success() {
    // an unbalanced 'down' pushes the pen below the paper
    let (stdout, stderr, ok) = run("f 5 down f 1 up\n");
    assert!(ok);
    assert!(stdout.contains("M 0 0 L 5 0"));
    assert!(stderr.contains("Pen height became negative"));
}

#[test]
fn pen_height_warning_can_be_disabled() {
    let (_, stderr, ok) = run_with_args("f 5 down f 1 up\n", &["--no-pen-error"]);
    assert!(ok);
    assert!(!stderr.contains("Pen height became negative"));
}

#[test]
fn files_in_and_out() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("square.turtle");
    let output = dir.path().join("square.d");

    std::fs::write(&input, "f 10 r 90 f 10 r 90 f 10 z\n").unwrap();

    let (_, stderr, ok) = run_with_args(
        "",
        &[
            input.to_str().unwrap(),
            output.to_str().unwrap(),
        ],
    );
    assert!(ok, "{stderr}");

    let written = std::fs::read_to_string(&output).unwrap();
    assert_eq!(written, "M 0 0 L 10 0 L 10 10 L 0 10 Z \n");
}

#[test]
fn debug_backtrace_on_execution_error() {
    let (_, stderr, ok) = run_with_args("def boom() { pop }\nboom\n", &["--debug"]);
    assert!(!ok);
    assert!(stderr.contains("Empty stack in 'pop' command."));
    assert!(stderr.contains("---- Backtrace: ---"));
    assert!(stderr.contains("command function"));
}

#[test]
fn list_chunks() {
    let (_, stderr, ok) = run_with_args("def s(n) { f n }\ns 3\n", &["--list-chunks"]);
    assert!(ok);
    assert!(stderr.contains("--------- Chunks ---"));
    assert!(stderr.contains("command function"));
}

#[test]
fn breakpoints_report_with_show_breaks() {
    let (stdout, _, ok) = run_with_args("f 1 breakpoint\n", &["--show-breaks"]);
    assert!(ok);
    assert!(stdout.contains("breakpoint"));
}

#[test]
fn conflicting_formats_are_rejected() {
    let (_, stderr, ok) = run_with_args("f 1\n", &["--optimize", "--prettyprint"]);
    assert!(!ok);
    assert!(!stderr.is_empty());
}
