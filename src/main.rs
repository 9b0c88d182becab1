use std::path::PathBuf;

use clap::Parser;

use weft::{DynamicScope, Environment, Mutable, Program, RenderTreeBuilder, Step, VM, Value, render};

/// Render a compiled weft program against a data model.
#[derive(Parser)]
#[command(name = "weft")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a compiled program (JSON)
    program: PathBuf,

    /// Data model file (JSON); the model is null when omitted
    #[arg(short, long)]
    data: Option<PathBuf>,

    /// Entry point to execute
    #[arg(short, long, default_value = "main")]
    entry: String,

    /// Drive the VM step by step and report the step count
    #[arg(long)]
    steps: bool,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let source = match std::fs::read_to_string(&cli.program) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error reading {}: {}", cli.program.display(), e);
            std::process::exit(1);
        }
    };

    let program: Program = match serde_json::from_str(&source) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Invalid program: {}", e);
            std::process::exit(1);
        }
    };

    let data = match &cli.data {
        Some(path) => {
            let source = match std::fs::read_to_string(path) {
                Ok(s) => s,
                Err(e) => {
                    eprintln!("Error reading {}: {}", path.display(), e);
                    std::process::exit(1);
                }
            };
            match serde_json::from_str::<Value>(&source) {
                Ok(v) => v,
                Err(e) => {
                    eprintln!("Invalid data model: {}", e);
                    std::process::exit(1);
                }
            }
        }
        None => Value::Null,
    };

    let env = Environment::new(program);
    let model = Mutable::shared(data);
    let mut builder = RenderTreeBuilder::new();

    if cli.steps {
        let start = match env.program().entry(&cli.entry) {
            Some(h) => h,
            None => {
                eprintln!("Error: unknown entry point: {}", cli.entry);
                std::process::exit(1);
            }
        };
        let count = {
            let mut vm = VM::initial(&env, &mut builder, model, DynamicScope::new());
            vm.begin(start);
            let mut count = 0u64;
            loop {
                match vm.next() {
                    Step::Pending => count += 1,
                    Step::Done(_) => break,
                }
            }
            count
        };
        println!("steps: {}", count);
    } else if let Err(e) = render(&env, &mut builder, &cli.entry, model, DynamicScope::new()) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    println!("{}", builder.text());
}
