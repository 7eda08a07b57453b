use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use clap::Parser as _;
use clap::Subcommand;
use miette::IntoDiagnostic;
use miette::WrapErr;
use ripple::{
    ErrorKind, ErrorPolicy, Lexer, ParserOptions, Runtime, RuntimeConfig, ScriptError, SourceFile,
    Value,
};
use tracing::debug;

/// Scripts recurse through the evaluator, so they run on a thread with room.
const SCRIPT_STACK_SIZE: usize = 256 * 1024 * 1024;

#[derive(clap::Parser, Debug)]
#[command(name = "ripple", version, about = "Run reactive ripple scripts")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging (use multiple times for increased verbosity)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Set log level (overrides --verbose)
    #[arg(long, global = true, value_enum)]
    log_level: Option<LogLevel>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the token stream of a script
    Tokenize { filename: PathBuf },
    /// Print the expression graph of a script
    Parse {
        filename: PathBuf,
        /// Parse the whole script as a pure expression
        #[arg(long)]
        pure: bool,
    },
    /// Evaluate a script
    Run {
        filename: PathBuf,
        /// Parse the whole script as a pure expression
        #[arg(long)]
        pure: bool,
        /// Evaluate collections on the worker pool
        #[arg(long)]
        parallel: bool,
        /// What happens to errors no handler accepted
        #[arg(long, value_enum)]
        error_policy: Option<ErrorPolicy>,
        /// Shorthand for `--error-policy fail-fast`
        #[arg(long, conflicts_with = "error_policy")]
        fail_fast: bool,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        max_depth: Option<usize>,
        /// Print the value of the last statement
        #[arg(long)]
        print_result: bool,
    },
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

fn main() -> miette::Result<()> {
    let args = Args::parse();
    setup_logging(args.verbose, args.log_level);

    match args.command {
        Commands::Tokenize { filename } => {
            let source = read_source(&filename)?;
            for token in Lexer::new(&source) {
                match token {
                    Ok(token) => println!("{token}"),
                    Err(e) => {
                        if let Some(line) = e.line() {
                            eprintln!("[line {line}] Error: {}", e.message());
                        }
                        eprintln!("{:?}", miette::Report::new(e));
                        std::process::exit(65);
                    }
                }
            }
            println!("EOF  null");
        }
        Commands::Parse { filename, pure } => {
            let source = read_source(&filename)?;
            let rt = Runtime::new()?;
            let options = ParserOptions {
                pure,
                source_name: Some(source.name().to_string()),
                ..Default::default()
            };
            match rt.parse(source.name(), source.text(), &options) {
                Ok(script) => println!("{script}"),
                Err(e) => {
                    eprintln!("{:?}", miette::Report::new(e));
                    std::process::exit(65);
                }
            }
        }
        Commands::Run {
            filename,
            pure,
            parallel,
            error_policy,
            fail_fast,
            workers,
            max_depth,
            print_result,
        } => {
            let source = read_source(&filename)?;
            let mut config = RuntimeConfig::from_env();
            if fail_fast {
                config.error_policy = ErrorPolicy::FailFast;
            } else if let Some(policy) = error_policy {
                config.error_policy = policy;
            }
            if let Some(workers) = workers {
                config = config.with_workers(workers);
            }
            if let Some(depth) = max_depth {
                config = config.with_max_recursion_depth(depth);
            }
            let options = ParserOptions {
                pure,
                parallel,
                source_name: Some(source.name().to_string()),
            };

            let script = thread::Builder::new()
                .name("ripple-main".to_string())
                .stack_size(SCRIPT_STACK_SIZE)
                .spawn(move || run_script(config, &source, &options, print_result))
                .into_diagnostic()
                .wrap_err("starting the script thread failed")?;
            let result = script
                .join()
                .map_err(|_| miette::miette!("the script thread panicked"))?;
            if let Err(e) = result {
                let code = if e.kind() == ErrorKind::Parse { 65 } else { 70 };
                eprintln!("{:?}", miette::Report::new(e));
                std::process::exit(code);
            }
        }
    }
    Ok(())
}

fn read_source(filename: &PathBuf) -> miette::Result<std::sync::Arc<SourceFile>> {
    let text = fs::read_to_string(filename)
        .into_diagnostic()
        .wrap_err_with(|| format!("reading `{}` failed", filename.display()))?;
    Ok(SourceFile::new(filename.display().to_string(), text))
}

/// Evaluate the script, then keep the runtime alive while `every`
/// schedules are still firing.
fn run_script(
    config: RuntimeConfig,
    source: &SourceFile,
    options: &ParserOptions,
    print_result: bool,
) -> Result<(), ScriptError> {
    let rt = Runtime::with_config(config)?;
    let value = rt.run_with(source.text(), options)?;
    if print_result && !matches!(value, Value::Void) {
        println!("{value}");
    }
    if let Value::Error(err) = &value {
        debug!(kind = %err.kind(), "script finished with an error value");
    }
    while rt.context().scheduler().active() > 0 {
        thread::sleep(Duration::from_millis(10));
    }
    Ok(())
}

fn setup_logging(verbose: u8, log_level: Option<LogLevel>) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = if let Some(level) = log_level {
        EnvFilter::new(match level {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        })
    } else {
        match verbose {
            0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            1 => EnvFilter::new("info"),
            2 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    let formatter = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .with_level(true);

    tracing_subscriber::registry()
        .with(formatter)
        .with(filter)
        .init();
}
