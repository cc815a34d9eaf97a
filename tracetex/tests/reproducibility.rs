// Reproducibility tests for the command-line tool.
//
// These tests verify that `tracetex` produces byte-identical output for
// identical inputs, and that exported traces transcribe like their source.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

fn tracetex_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_tracetex"))
}

fn project_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .to_path_buf()
}

fn demo(name: &str) -> String {
    project_root()
        .join("demos")
        .join(name)
        .to_str()
        .unwrap()
        .to_string()
}

fn run(args: &[&str]) -> Output {
    Command::new(tracetex_binary())
        .args(args)
        .output()
        .expect("failed to run tracetex")
}

fn run_ok(args: &[&str]) -> String {
    let output = run(args);
    assert!(
        output.status.success(),
        "tracetex failed with args {:?}\nstderr: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).expect("non-UTF8 output")
}

/// A scratch file path unique to this test process.
fn scratch(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("tracetex-{}-{}", std::process::id(), name))
}

#[test]
fn same_script_identical_tex() {
    let script = demo("mlp.tts");
    let first = run_ok(&[&script, "--grad", "W"]);
    let second = run_ok(&[&script, "--grad", "W"]);
    assert_eq!(first, second, "TeX output should be byte-identical across runs");
    assert!(first.starts_with("h_{i}(x) = "), "{first}");
}

#[test]
fn tex_output_ends_with_newline() {
    let out = run_ok(&[&demo("quotient.tts")]);
    assert_eq!(out, "f = {x\\left(x - y\\right) \\over x + y} + y\n");
}

#[test]
fn display_wraps_in_aligned() {
    let out = run_ok(&[&demo("quotient.tts"), "--display"]);
    assert!(out.starts_with("\\begin{aligned}\n"));
    assert!(out.ends_with("\\end{aligned}\n"));
}

#[test]
fn build_info_is_stable() {
    let script = demo("quotient.tts");
    let first = run_ok(&[&script, "--emit", "build-info"]);
    let second = run_ok(&[&script, "--emit", "build-info"]);
    assert_eq!(first, second);
    assert!(first.contains("\"trace_hash\""));
    assert!(first.contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn exported_graph_transcribes_like_its_script() {
    let script = demo("named.tts");
    let direct = run_ok(&[&script, "--grad", "x"]);

    let json_path = scratch("named-grad.json");
    let json = run_ok(&[&script, "--grad", "x", "--emit", "graph"]);
    std::fs::write(&json_path, json).unwrap();
    let imported = run_ok(&[json_path.to_str().unwrap()]);
    let _ = std::fs::remove_file(&json_path);

    assert_eq!(imported, direct);
}

#[test]
fn config_file_changes_notation() {
    let config = scratch("config.json");
    std::fs::write(&config, r#"{ "line_separator": "\n", "function_name": "g" }"#).unwrap();
    let out = run_ok(&[&demo("named.tts"), "--config", config.to_str().unwrap()]);
    let _ = std::fs::remove_file(&config);
    assert_eq!(out, "z = x + y\ng = {x\\left(x - y\\right) \\over z} + y\n");
}

#[test]
fn expr_emit_prints_program() {
    let out = run_ok(&[&demo("matvec.tts"), "--emit", "expr"]);
    assert_eq!(out, "f[i] = (sum [j] (mul x[j] U[ji]))\n");
}

// ── Exit codes ──────────────────────────────────────────────────────────────

#[test]
fn missing_input_exits_2() {
    let output = run(&["no-such-file.tts"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn unknown_argument_exits_2() {
    let script = demo("quotient.tts");
    for arg in ["w", "9"] {
        let output = run(&[&script, "--grad", arg]);
        assert_eq!(output.status.code(), Some(2), "--grad {arg}");
        assert!(output.stdout.is_empty());
    }
}

#[test]
fn numeric_argument_selects_position() {
    let script = demo("quotient.tts");
    assert_eq!(run_ok(&[&script, "--grad", "1"]), run_ok(&[&script, "--grad", "y"]));
}

#[test]
fn script_error_exits_1() {
    let path = scratch("broken.tts");
    std::fs::write(&path, "fn f(x) { return x + }\n").unwrap();
    let output = run(&[path.to_str().unwrap()]);
    let _ = std::fs::remove_file(&path);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("E0200"));
}

#[test]
fn ambiguous_name_is_reported_once() {
    let path = scratch("ambiguous.tts");
    std::fs::write(
        &path,
        "fn f(x, y) {\n  let a = exp(x) as z\n  let b = exp(y) as z\n  return a + b\n}\n",
    )
    .unwrap();
    let output = run(&[path.to_str().unwrap()]);
    let _ = std::fs::remove_file(&path);
    assert!(output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(stderr.matches("W0100").count(), 1, "{stderr}");
    assert!(!stderr.contains("ambiguous binding name"), "{stderr}");
    assert_eq!(
        String::from_utf8_lossy(&output.stdout),
        "z = \\exp\\left(x\\right) \\\\\nz = \\exp\\left(y\\right) \\\\\nf = z + z\n"
    );
}

#[test]
fn unsupported_primitive_exits_1() {
    let path = scratch("erf.tts");
    std::fs::write(&path, "fn f(x) { return erf(x) }\n").unwrap();
    let output = run(&[path.to_str().unwrap()]);
    let _ = std::fs::remove_file(&path);
    assert_eq!(output.status.code(), Some(1));
    assert!(output.stdout.is_empty());
    assert!(String::from_utf8_lossy(&output.stderr).contains("E0100"));
}
