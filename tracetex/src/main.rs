use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::exit;

use tracetex::autodiff::{transform, Mode};
use tracetex::options::load_options;
use tracetex::pass::PassId;
use tracetex::pipeline::{compute_provenance, run_pipeline, TranscriptionState};
use tracetex::render::aligned;
use tracetex::script::load;
use tracetex::{capture, Trace, Traceable, TranscribeOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum EmitStage {
    /// Rendered LaTeX equations
    Tex,
    /// Built expression trees (s-expressions)
    Expr,
    /// The captured trace as interchange JSON
    Graph,
    /// Provenance hashes as JSON
    BuildInfo,
}

#[derive(Parser, Debug)]
#[command(
    name = "tracetex",
    version,
    about = "Transcribes traced (and differentiated) array computations into LaTeX equations"
)]
struct Cli {
    /// Input trace script (.tts) or exported trace (.json)
    input: PathBuf,

    /// Script function to transcribe (default: the last one defined)
    #[arg(short, long)]
    function: Option<String>,

    /// Symbol used for the function on output equations
    #[arg(long)]
    symbol: Option<String>,

    /// Differentiate in reverse mode with a unit seed w.r.t. ARG (name or position; repeatable)
    #[arg(long, value_name = "ARG", conflicts_with_all = ["jvp", "vjp"])]
    grad: Vec<String>,

    /// Differentiate in forward mode w.r.t. ARG (repeatable)
    #[arg(long, value_name = "ARG", conflicts_with = "vjp")]
    jvp: Vec<String>,

    /// Differentiate in reverse mode with cotangent seeds w.r.t. ARG (repeatable)
    #[arg(long, value_name = "ARG")]
    vjp: Vec<String>,

    /// Output stage
    #[arg(long, value_enum, default_value_t = EmitStage::Tex)]
    emit: EmitStage,

    /// Transcription options (JSON)
    #[arg(long, value_name = "FILE.json")]
    config: Option<PathBuf>,

    /// Wrap the equations in an aligned environment
    #[arg(long)]
    display: bool,

    /// Output file (default: stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Print passes and timing
    #[arg(long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .with_target(false)
        .init();

    // ── Options ──
    let mut options = match &cli.config {
        Some(path) => load_options(path).unwrap_or_else(|e| {
            eprintln!("tracetex: error: {}", e);
            exit(2);
        }),
        None => TranscribeOptions::default(),
    };
    if cli.symbol.is_some() {
        options.function_name = cli.symbol.clone();
    }
    options.verbose |= cli.verbose;

    // ── Capture ──
    let source = std::fs::read_to_string(&cli.input).unwrap_or_else(|e| {
        eprintln!("tracetex: error: {}: {}", cli.input.display(), e);
        exit(2);
    });
    let trace = if is_json(&cli.input) {
        Trace::from_json(&source).unwrap_or_else(|e| {
            eprintln!("tracetex: error: {}: {}", cli.input.display(), e);
            exit(1);
        })
    } else {
        capture_script(&cli, &source)
    };
    let trace = differentiate(&cli, trace);

    // ── Emit ──
    let output = match cli.emit {
        EmitStage::Graph => trace.to_json().map(|json| json + "\n").unwrap_or_else(|e| {
            eprintln!("tracetex: error: {}", e);
            exit(1);
        }),
        EmitStage::BuildInfo => compute_provenance(&trace, &options)
            .and_then(|p| p.to_json())
            .unwrap_or_else(|e| {
                eprintln!("tracetex: error: {}", e);
                exit(1);
            }),
        EmitStage::Expr | EmitStage::Tex => {
            let terminal = if cli.emit == EmitStage::Expr {
                PassId::Build
            } else {
                PassId::Render
            };
            let mut state = TranscriptionState::new(trace, options);
            let result = run_pipeline(&mut state, terminal, |_, _| {});
            for diag in &state.diagnostics {
                eprintln!("tracetex: {}", diag);
            }
            if result.is_err() {
                exit(1);
            }
            match (terminal, state.program, state.text) {
                (PassId::Build, Some(program), _) => program.to_string(),
                (_, _, Some(text)) if cli.display => aligned(&text) + "\n",
                (_, _, Some(text)) => text + "\n",
                _ => {
                    eprintln!("tracetex: error: transcription produced no output");
                    exit(1);
                }
            }
        }
    };

    match &cli.output {
        Some(path) => {
            if let Err(e) = std::fs::write(path, output) {
                eprintln!("tracetex: error: {}: {}", path.display(), e);
                exit(2);
            }
        }
        None => print!("{}", output),
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
}

/// Load a trace script and capture the selected function on its declared shapes.
fn capture_script(cli: &Cli, source: &str) -> Trace {
    let script = load(source).unwrap_or_else(|diags| {
        for diag in &diags {
            eprintln!("tracetex: {}: {}", cli.input.display(), diag);
        }
        exit(1);
    });
    let function = match &cli.function {
        Some(name) => script.function(name),
        None => script.entry(),
    };
    let Some(function) = function else {
        match &cli.function {
            Some(name) => eprintln!("tracetex: error: no function `{}` in script", name),
            None => eprintln!("tracetex: error: script defines no function"),
        }
        exit(1);
    };
    tracing::info!(function = function.name(), "capturing");
    capture(function, &function.example_shapes()).unwrap_or_else(|e| {
        eprintln!("tracetex: error: trace capture failed: {}", e);
        exit(1);
    })
}

/// Apply the requested differentiation transform, if any.
fn differentiate(cli: &Cli, trace: Trace) -> Trace {
    let (mode, args) = if !cli.grad.is_empty() {
        (Mode::Grad, &cli.grad)
    } else if !cli.jvp.is_empty() {
        (Mode::Jvp, &cli.jvp)
    } else if !cli.vjp.is_empty() {
        (Mode::Vjp, &cli.vjp)
    } else {
        return trace;
    };
    let wrt: Vec<usize> = args
        .iter()
        .map(|arg| {
            trace
                .argument_position(arg)
                .or_else(|| {
                    arg.parse::<usize>()
                        .ok()
                        .filter(|&position| position < trace.arguments.len())
                })
                .unwrap_or_else(|| {
                    eprintln!("tracetex: error: `{}` is not an argument of `{}`", arg, trace.name);
                    exit(2);
                })
        })
        .collect();
    transform(trace, mode, &wrt).unwrap_or_else(|e| {
        eprintln!("tracetex: error: trace capture failed: {}", e);
        exit(1);
    })
}
