//! Girder CLI
//!
//! `girder run <file>`, `girder eval <source>`, and `girder repl`, each
//! against a fresh environment with the provider of choice. Uncaught
//! exceptions render to stderr (type, payload, stack trace) and exit
//! non-zero.

mod repl;

use clap::{Parser, Subcommand, ValueEnum};
use girder::{Environment, GirderError, ProviderKind};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "girder")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Girder scripting language", long_about = None)]
struct Cli {
    /// Execution provider.
    #[arg(long, value_enum, default_value_t = Provider::Interpreter, global = true)]
    provider: Provider,

    /// Log filter, e.g. "girder=debug".
    #[arg(long, global = true)]
    log: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Provider {
    Interpreter,
    Compiler,
}

impl From<Provider> for ProviderKind {
    fn from(provider: Provider) -> Self {
        match provider {
            Provider::Interpreter => ProviderKind::Interpreter,
            Provider::Compiler => ProviderKind::Compiler,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script file
    Run {
        /// Input source file
        input: PathBuf,
    },

    /// Evaluate source text and print its result
    Eval {
        /// Source text
        source: String,
    },

    /// Interactive session
    Repl,
}

fn main() {
    let cli = Cli::parse();

    if let Some(filter) = &cli.log {
        use tracing_subscriber::EnvFilter;
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(filter.clone()))
            .with_writer(std::io::stderr)
            .init();
    }

    let provider = cli.provider.into();
    let status = match cli.command {
        Commands::Run { input } => run_file(provider, &input),
        Commands::Eval { source } => eval_source(provider, &source),
        Commands::Repl => repl::run(provider),
    };
    process::exit(status);
}

fn run_file(provider: ProviderKind, input: &PathBuf) -> i32 {
    let mut env = Environment::new(provider);
    let name = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "main".to_string());
    let callable = match env.compile_file(input, &name, HashMap::new()) {
        Ok(callable) => callable,
        Err(error) => return report(error),
    };
    match env.call(&callable, &[]) {
        Ok(_) => 0,
        Err(error) => report(GirderError::Runtime(error)),
    }
}

fn eval_source(provider: ProviderKind, source: &str) -> i32 {
    let mut env = Environment::new(provider);
    let callable = match env.compile_source(source, "eval", HashMap::new()) {
        Ok(callable) => callable,
        Err(error) => return report(error),
    };
    match env.call(&callable, &[]) {
        Ok(value) => {
            if !value.is_null() {
                println!("{}", value.to_display_string());
            }
            0
        }
        Err(error) => report(GirderError::Runtime(error)),
    }
}

fn report(error: GirderError) -> i32 {
    eprintln!("{}", error);
    1
}
