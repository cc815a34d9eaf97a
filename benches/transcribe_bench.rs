use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use tracetex::pass::PassId;
use tracetex::pipeline::{run_pipeline, TranscriptionState};
use tracetex::script::load;
use tracetex::*;

// Benchmark scenarios, written as trace scripts.

const QUOTIENT: &str = r#"
fn f(x, y) {
  return x * (x - y) / (x + y) + y
}
"#;

const NAMED: &str = r#"
fn f(x, y) {
  let zx = exp(x) as z(x)
  let zy = exp(y) as z(y)
  return x * (zx - zy) / (zx + zy) + y
}
"#;

const MLP: &str = r#"
fn layer(v, W, b) {
  return relu(v @ W + b)
}

fn loss(x: [8], W1: [8, 16], b1: [16], W2: [16, 4], b2: [4], t: [4]) {
  let h = layer(x, W1, b1) as h(x)
  let o = layer(h, W2, b2) as o(x)
  let e = o - t
  return sum(e * e)
}
"#;

fn scenarios() -> [(&'static str, &'static str); 3] {
    [("quotient", QUOTIENT), ("named", NAMED), ("mlp", MLP)]
}

/// A chain of `n` named steps, each depending on the previous one.
fn generate_chain(n: usize) -> String {
    let mut src = String::from("fn f(x, y) {\n  let v0 = x + y as v\n");
    for k in 1..n {
        src.push_str(&format!(
            "  let v{k} = exp(v{}) * x - y as v_{k}\n",
            k - 1
        ));
    }
    src.push_str(&format!("  return v{} / (x + y)\n}}\n", n - 1));
    src
}

fn trace_of(source: &str) -> Trace {
    let script = load(source).expect("benchmark scenario must load");
    let f = script.entry().expect("benchmark scenario defines a function");
    capture(f, &f.example_shapes()).expect("benchmark scenario must capture")
}

fn grad_trace_of(source: &str) -> Trace {
    let script = load(source).expect("benchmark scenario must load");
    let f = script.entry().expect("benchmark scenario defines a function");
    capture(&grad(f.clone(), &[]), &f.example_shapes()).expect("benchmark scenario must capture")
}

// Script parse latency.
fn bench_parse_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("kpi/parse_latency");

    for (name, source) in scenarios() {
        group.bench_with_input(BenchmarkId::from_parameter(name), source, |b, source| {
            b.iter(|| {
                let script = load(black_box(source));
                black_box(script.is_ok());
            });
        });
    }

    group.finish();
}

// Full latency (load -> capture -> bind -> thread -> build -> render).
fn bench_full_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("kpi/full_latency");

    for (name, source) in scenarios() {
        group.bench_with_input(BenchmarkId::from_parameter(name), source, |b, source| {
            b.iter(|| {
                let script = load(black_box(source)).unwrap();
                let f = script.entry().unwrap();
                black_box(transcribe(f, &f.example_shapes()).unwrap());
            });
        });
    }

    group.finish();
}

// Reverse-mode differentiation plus transcription of the gradient.
fn bench_gradient_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("kpi/gradient_latency");

    for (name, source) in scenarios() {
        group.bench_with_input(BenchmarkId::from_parameter(name), source, |b, source| {
            b.iter(|| {
                let trace = grad_trace_of(black_box(source));
                black_box(transcribe_trace(trace, &TranscribeOptions::default()).unwrap());
            });
        });
    }

    group.finish();
}

// Pass-level latency on a captured gradient trace.
fn bench_pass_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("kpi/pass_latency");
    let trace = grad_trace_of(MLP);

    for (name, terminal) in [
        ("bind", PassId::Bind),
        ("thread", PassId::Thread),
        ("build", PassId::Build),
        ("render", PassId::Render),
    ] {
        group.bench_function(name, |b| {
            b.iter_batched(
                || TranscriptionState::new(trace.clone(), TranscribeOptions::default()),
                |mut state| {
                    run_pipeline(&mut state, terminal, |_, _| {}).unwrap();
                    black_box(state.text);
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

// Scaling with the number of named steps.
fn bench_chain_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("kpi/chain_scaling");

    for n in [4usize, 16, 64] {
        let trace = trace_of(&generate_chain(n));
        group.bench_with_input(BenchmarkId::from_parameter(n), &trace, |b, trace| {
            b.iter_batched(
                || trace.clone(),
                |trace| black_box(transcribe_trace(trace, &TranscribeOptions::default()).unwrap()),
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_parse_latency,
    bench_full_latency,
    bench_gradient_latency,
    bench_pass_latency,
    bench_chain_scaling,
);
criterion_main!(benches);
