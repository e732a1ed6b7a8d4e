//! Purpose: `stowage` CLI entry point for inspecting and editing a collection store.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Commands emit one JSON document on stdout (pretty on a TTY).
//! Invariants: Errors are emitted as one JSON line on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
#![allow(clippy::result_large_err)]
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueHint};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};
use tracing_subscriber::EnvFilter;

mod command_dispatch;

use stowage::api::{Error, ErrorKind, to_exit_code};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    init_tracing();
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if err.use_stderr() => {
            return Err(Error::new(ErrorKind::Usage).with_message(clap_error_summary(&err)));
        }
        Err(err) => {
            // Help and version output.
            err.print().map_err(|io_err| {
                Error::new(ErrorKind::Internal)
                    .with_message("write help")
                    .with_source(io_err)
            })?;
            return Ok(RunOutcome::with_code(err.exit_code()));
        }
    };

    let sweep_interval = cli.sweep_interval_ms.map(Duration::from_millis);
    command_dispatch::dispatch_command(cli.command, cli.db, sweep_interval)
}

fn clap_error_summary(err: &clap::Error) -> String {
    err.to_string()
        .lines()
        .next()
        .map(|line| line.trim_start_matches("error: ").trim().to_string())
        .unwrap_or_else(|| "invalid arguments".to_string())
}

#[derive(Parser)]
#[command(
    name = "stowage",
    version,
    about = "Typed collections persisted in a single SQLite file",
    long_about = None,
    after_help = r#"EXAMPLES
  $ stowage map set prefs '"theme"' '"dark"'
  $ stowage map get prefs '"theme"'
  $ stowage queue push jobs '{"task": "resize", "id": 7}' --ttl-ms 60000
  $ stowage queue pop jobs
  $ stowage tables
  $ stowage sweep

Keys and values are JSON documents."#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        env = "STOWAGE_DB",
        default_value = "stowage.sqlite",
        help = "Database file holding the collections",
        value_hint = ValueHint::FilePath
    )]
    db: PathBuf,
    #[arg(long, help = "Background sweep interval in milliseconds (default: 1000)")]
    sweep_interval_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "List collection tables present in the database")]
    Tables,
    #[command(about = "Delete expired rows from every collection table now")]
    Sweep,
    #[command(arg_required_else_help = true, about = "Read and write a map collection")]
    Map {
        #[command(subcommand)]
        command: MapCommand,
    },
    #[command(arg_required_else_help = true, about = "Read and write a FIFO queue collection")]
    Queue {
        #[command(subcommand)]
        command: QueueCommand,
    },
    #[command(
        arg_required_else_help = true,
        about = "Generate shell completions",
        after_help = r#"EXAMPLES
  $ stowage completion bash > ~/.local/share/bash-completion/completions/stowage
  $ stowage completion zsh > ~/.zfunc/_stowage
  $ stowage completion fish > ~/.config/fish/completions/stowage.fish"#
    )]
    Completion {
        #[arg(help = "Shell to generate completions for")]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum MapCommand {
    #[command(about = "Insert or overwrite one key")]
    Set {
        name: String,
        #[arg(help = "Key as JSON")]
        key: String,
        #[arg(help = "Value as JSON")]
        value: String,
        #[arg(long, help = "Expire after this many milliseconds (0 = never)")]
        ttl_ms: Option<u64>,
    },
    #[command(about = "Read one key")]
    Get {
        name: String,
        #[arg(help = "Key as JSON")]
        key: String,
    },
    #[command(about = "Delete one key")]
    Del {
        name: String,
        #[arg(help = "Key as JSON")]
        key: String,
    },
    #[command(about = "List live entries, most recently updated first")]
    List { name: String },
    #[command(about = "Count live entries")]
    Size { name: String },
}

#[derive(Subcommand)]
enum QueueCommand {
    #[command(about = "Enqueue one value")]
    Push {
        name: String,
        #[arg(help = "Value as JSON")]
        value: String,
        #[arg(long, help = "Expire after this many milliseconds (0 = never)")]
        ttl_ms: Option<u64>,
    },
    #[command(about = "Dequeue the oldest live value")]
    Pop { name: String },
    #[command(about = "Show the oldest live value without removing it")]
    Peek { name: String },
    #[command(about = "List live values in dequeue order")]
    List { name: String },
    #[command(about = "Count live values")]
    Size { name: String },
}

fn emit_json(value: Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    };
    println!("{}", json.unwrap_or_else(|_| "{}".to_string()));
}

fn emit_error(err: &Error) {
    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| err.to_string());
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::StoreUnavailable => "store unavailable".to_string(),
        ErrorKind::StoreClosed => "store is closed".to_string(),
        ErrorKind::Schema => "schema setup failed".to_string(),
        ErrorKind::Codec => "encoding failed".to_string(),
        ErrorKind::PositionNotFound => "position not found".to_string(),
        ErrorKind::Transaction => "transaction failed".to_string(),
        ErrorKind::Query => "query failed".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = std::error::Error::source(err);
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(table) = err.table() {
        inner.insert("table".to_string(), json!(table));
    }
    if let Some(position) = err.position() {
        inner.insert("position".to_string(), json!(position));
    }
    if let Some(rollback) = err.rollback_failure() {
        inner.insert("rollback".to_string(), json!(rollback));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}
