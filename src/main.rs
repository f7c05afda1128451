use clap::Parser;
use failure::ResultExt;
use kaleido::backend::interp::DEFAULT_MAX_DEPTH;
use kaleido::backend::{Backend, InterpBackend};
use kaleido::config::{BinopSpec, Config};
use kaleido::toplevel::{Outcome, Toplevel};
use std::fs;
use std::io::{stdin, BufRead};
use std::path::PathBuf;

#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
#[clap(rename_all = "snake_case")]
enum BackendKind {
    Interp,
    Llvm,
}

#[derive(Parser, Debug)]
#[command(version, about = "Kaleidoscope REPL and file runner", long_about = None)]
struct Cli {
    /// Run a source file instead of reading stdin line by line
    #[arg(short, long, value_name = "FILE")]
    input: Option<PathBuf>,

    #[arg(long, help = "Skip the optimizer pipeline")]
    no_opt: bool,

    #[arg(short, long, help = "Do not print IR for definitions and expressions")]
    quiet: bool,

    /// Install or override a binary operator, e.g. `--binop '^=50'`
    #[arg(long = "binop", value_name = "OP=PREC")]
    binops: Vec<BinopSpec>,

    #[arg(long, value_enum, default_value = "interp")]
    backend: BackendKind,

    /// Call depth at which the interpreter gives up on a runaway recursion
    #[arg(long, value_name = "N", default_value_t = DEFAULT_MAX_DEPTH)]
    max_depth: usize,
}

fn main() -> Result<(), failure::Error> {
    kaleido::init_tracing();
    let cli = Cli::parse();

    let mut config = Config::default();
    config.optimize = !cli.no_opt;
    config.dump_ir = !cli.quiet;
    for spec in &cli.binops {
        config.precedence.set(spec.op, spec.prec);
    }

    match cli.backend {
        BackendKind::Interp => {
            let backend = InterpBackend::new()
                .with_optimize(config.optimize)
                .with_max_depth(cli.max_depth);
            drive(&cli, Toplevel::new(config, backend))
        }
        BackendKind::Llvm => llvm(&cli, config),
    }
}

#[cfg(feature = "llvm")]
fn llvm(cli: &Cli, config: Config) -> Result<(), failure::Error> {
    let backend = kaleido::backend::llvm::LlvmBackend::new("my cool jit", config.optimize)?;
    drive(cli, Toplevel::new(config, backend))
}

#[cfg(not(feature = "llvm"))]
fn llvm(_: &Cli, _: Config) -> Result<(), failure::Error> {
    Err(failure::format_err!(
        "this build has no LLVM backend; rebuild with `--features llvm`"
    ))
}

fn drive<B: Backend>(cli: &Cli, mut top: Toplevel<B>) -> Result<(), failure::Error> {
    if let Some(path) = &cli.input {
        let src = fs::read_to_string(path)
            .with_context(|_| format!("failed to read {}", path.display()))?;
        report(top.run_source(&src));
        return Ok(());
    }

    let stdin = stdin();
    let mut lines = stdin.lock().lines();
    let mut pending = String::new();
    loop {
        eprint!("{}", if pending.is_empty() { "ready> " } else { "...> " });
        let line = match lines.next() {
            Some(line) => line?,
            None => break,
        };
        pending.push_str(&line);
        pending.push('\n');
        // A blank line runs whatever has been typed so far.
        if !line.trim().is_empty() && top.is_incomplete(&pending) {
            continue;
        }
        report(top.run_source(&pending));
        pending.clear();
    }
    if !pending.trim().is_empty() {
        report(top.run_source(&pending));
    }
    eprintln!();
    Ok(())
}

fn report(results: Vec<Result<Outcome, kaleido::error::Error>>) {
    for result in results {
        match result {
            Ok(Outcome::Definition { ir, .. }) => {
                eprintln!("Read function definition:");
                print_ir(ir);
            }
            Ok(Outcome::Extern { ir, .. }) => {
                eprintln!("Read extern:");
                print_ir(ir);
            }
            Ok(Outcome::Evaluated { value, ir }) => {
                print_ir(ir);
                eprintln!("Evaluated to {}", value);
            }
            Err(e) => eprintln!("Error: {}", e),
        }
    }
}

fn print_ir(ir: Option<String>) {
    if let Some(ir) = ir {
        eprintln!("{}", ir.trim_end());
    }
}
