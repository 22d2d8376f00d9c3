//! Compiler driver.
//!
//! Reads a JSON-serialized module (file path or standard input), runs the
//! front-end, and prints either the view listing or a GraphViz rendering.
//! Exit code 0 on a clean compile, 1 when the error log holds any error.

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

use flowlog::ast::Module;
use flowlog::export::dot;
use flowlog::{compile, CompileOptions, ErrorLog};

#[derive(Parser, Debug)]
#[command(name = "flowlog", about = "Compile rule modules into a dataflow IR")]
struct Args {
    /// Module files (JSON). Reads standard input when omitted.
    inputs: Vec<PathBuf>,

    /// Emit GraphViz DOT instead of the view listing.
    #[arg(long)]
    dot: bool,

    /// Skip the optimizer passes.
    #[arg(long)]
    no_optimize: bool,

    /// Upper bound on optimizer rounds.
    #[arg(long, default_value_t = 64)]
    max_rounds: usize,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(Args::parse()) {
        Ok(clean) => {
            if clean {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<bool> {
    let modules = read_modules(&args.inputs)?;

    let options = CompileOptions {
        max_optimizer_rounds: args.max_rounds,
        skip_optimizer: args.no_optimize,
    };
    let mut log = ErrorLog::new();
    let query = compile(&modules, &options, &mut log);

    for diagnostic in log.iter() {
        eprintln!("{diagnostic}");
    }

    let Some(query) = query else {
        return Ok(false);
    };
    if log.has_errors() {
        return Ok(false);
    }

    if args.dot {
        print!("{}", dot::to_dot(&query));
    } else {
        print!("{}", query.debug_listing());
    }
    Ok(true)
}

fn read_modules(inputs: &[PathBuf]) -> Result<Vec<Module>> {
    if inputs.is_empty() {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("reading standard input")?;
        let module: Module = serde_json::from_str(&text).context("parsing module JSON")?;
        return Ok(vec![module]);
    }
    let mut modules = Vec::with_capacity(inputs.len());
    for path in inputs {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let module: Module =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        modules.push(module);
    }
    Ok(modules)
}
