// Script front-end tests: every demo script loads, captures and transcribes,
// and scripts agree with the Rust tracer on the same function.

use std::path::{Path, PathBuf};

use tracetex::script::{load, ScriptFunction};
use tracetex::{grad, transcribe, with_argument_names, Function, Shape};

fn project_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .to_path_buf()
}

fn demo(name: &str) -> ScriptFunction {
    let path = project_root().join("demos").join(name);
    let source = std::fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("cannot read {}: {}", path.display(), e));
    let script = load(&source).unwrap_or_else(|diags| {
        panic!(
            "{} failed to load:\n{}",
            name,
            diags.iter().map(|d| d.to_string()).collect::<Vec<_>>().join("\n")
        )
    });
    script.entry().expect("demo defines a function").clone()
}

fn transcribe_demo(name: &str) -> String {
    let f = demo(name);
    transcribe(&f, &f.example_shapes())
        .unwrap_or_else(|e| panic!("{} failed to transcribe: {}", name, e))
}

#[test]
fn every_demo_transcribes() {
    let mut count = 0;
    for entry in std::fs::read_dir(project_root().join("demos")).unwrap() {
        let path = entry.unwrap().path();
        if path.extension().is_some_and(|e| e == "tts") {
            let name = path.file_name().unwrap().to_str().unwrap().to_string();
            assert!(!transcribe_demo(&name).is_empty(), "{name}");
            count += 1;
        }
    }
    assert!(count >= 5, "expected the demo scripts, found {count}");
}

#[test]
fn quotient_script_matches_rust_function() {
    let rust = with_argument_names(
        Function::new("f", |_t, a| {
            let (x, y) = (a[0], a[1]);
            vec![x * (x - y) / (x + y) + y]
        }),
        &["x", "y"],
    );
    let expected = transcribe(&rust, &[Shape::scalar(), Shape::scalar()]).unwrap();
    assert_eq!(transcribe_demo("quotient.tts"), expected);
}

#[test]
fn named_script() {
    assert_eq!(
        transcribe_demo("named.tts"),
        "z = x + y \\\\\nf = {x\\left(x - y\\right) \\over z} + y"
    );
}

#[test]
fn dependencies_script() {
    assert_eq!(
        transcribe_demo("dependencies.tts"),
        "z(x) = \\exp\\left(x\\right) \\\\\nz(y) = \\exp\\left(y\\right) \\\\\nf = z(x) + z(y)"
    );
}

#[test]
fn matvec_script() {
    assert_eq!(transcribe_demo("matvec.tts"), "f_{i} = \\sum_{j}x_{j}U_{ji}");
}

#[test]
fn mlp_gradient_contains_relu_indicator() {
    let f = demo("mlp.tts");
    let w = f.argument_position("W").unwrap();
    let text = transcribe(&grad(f.clone(), &[w]), &f.example_shapes()).unwrap();
    assert!(text.contains("\\mathbb{1}"), "{text}");
    assert!(text.contains("\\delta W"), "{text}");
}

#[test]
fn quotient_gradient_from_script_matches_rust_function() {
    let rust = with_argument_names(
        Function::new("f", |_t, a| {
            let (x, y) = (a[0], a[1]);
            vec![x * (x - y) / (x + y) + y]
        }),
        &["x", "y"],
    );
    let scalars = [Shape::scalar(), Shape::scalar()];
    let expected = transcribe(&grad(rust, &[0]), &scalars).unwrap();
    let script = demo("quotient.tts");
    assert_eq!(transcribe(&grad(script, &[0]), &scalars).unwrap(), expected);
}
