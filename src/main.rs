//! Purpose: `latzero` CLI entry point.
//! Role: Binary crate root; parses args, runs one command, emits JSON on stdout.
//! Invariants: Errors are emitted as JSON on stderr (plain text on a terminal).
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: All pool access goes through `api::PoolManager`; the CLI holds no state.
use std::io::{self, IsTerminal};
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueHint, error::ErrorKind as ClapErrorKind};
use latzero::api::{Error, ErrorKind, to_exit_code};
use latzero::pool_paths::default_base_dir;
use serde_json::{Map, Value, json};
use tracing_subscriber::EnvFilter;

mod command_dispatch;
mod pool_info_json;
mod value_json;

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

#[derive(Parser)]
#[command(
    name = "latzero",
    version,
    about = "Shared-memory key/value pools for local processes",
    long_about = "Create, inspect, and maintain named shared-memory pools.\n\
                  Values are passed and printed as JSON. Credentials are read from\n\
                  the environment variable named by --credential-env, never from argv."
)]
struct Cli {
    #[arg(
        long,
        global = true,
        help = "Base directory for the registry and pools (default: $LATZERO_DIR, /dev/shm/latzero)",
        value_hint = ValueHint::DirPath
    )]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Create a pool")]
    Create {
        name: String,
        #[arg(long, help = "Initial capacity in bytes")]
        initial_capacity: Option<u64>,
        #[arg(long, help = "Maximum capacity in bytes")]
        max_capacity: Option<u64>,
        #[arg(long, help = "Segment size in bytes (growth granularity)")]
        segment_size: Option<u64>,
        #[arg(long, help = "Destroy the pool after this many seconds without clients")]
        idle_destroy_secs: Option<u64>,
        #[arg(long, help = "TTL applied to writes that do not set one")]
        default_ttl_secs: Option<u64>,
        #[arg(long, help = "Encrypt every entry with a key derived from the credential")]
        encrypted: bool,
        #[arg(long, help = "Reject connections without the matching credential")]
        require_auth: bool,
        #[arg(long, help = "Environment variable holding the pool credential")]
        credential_env: Option<String>,
        #[arg(long, help = "PBKDF2 rounds applied to the credential (default 600000)")]
        kdf_rounds: Option<u32>,
    },
    #[command(about = "List pools")]
    List,
    #[command(about = "Show pool statistics, or registry-wide totals without a name")]
    Stats { name: Option<String> },
    #[command(about = "Force-destroy a pool, even with connected clients")]
    Destroy { name: String },
    #[command(about = "Store a JSON value")]
    Set {
        pool: String,
        key: String,
        #[arg(help = "Inline JSON value")]
        value: String,
        #[arg(long, help = "Expire the entry after this many seconds")]
        ttl_secs: Option<u64>,
        #[arg(long, help = "Environment variable holding the pool credential")]
        credential_env: Option<String>,
    },
    #[command(about = "Read a value as JSON")]
    Get {
        pool: String,
        key: String,
        #[arg(long, help = "Environment variable holding the pool credential")]
        credential_env: Option<String>,
    },
    #[command(about = "Delete a key")]
    Del {
        pool: String,
        key: String,
        #[arg(long, help = "Environment variable holding the pool credential")]
        credential_env: Option<String>,
    },
    #[command(about = "List unexpired keys")]
    Keys {
        pool: String,
        #[arg(long, default_value = "", help = "Only keys starting with this prefix")]
        prefix: String,
        #[arg(long, help = "Environment variable holding the pool credential")]
        credential_env: Option<String>,
    },
    #[command(about = "Publish a JSON value on a topic to listening clients")]
    Emit {
        pool: String,
        topic: String,
        #[arg(help = "Inline JSON value")]
        value: String,
        #[arg(long, help = "Environment variable holding the pool credential")]
        credential_env: Option<String>,
    },
    #[command(about = "Send a JSON value to a topic's listener and print its reply")]
    Call {
        pool: String,
        topic: String,
        #[arg(help = "Inline JSON value")]
        value: String,
        #[arg(long, default_value_t = 5000, help = "Give up after this many milliseconds")]
        timeout_ms: u64,
        #[arg(long, help = "Environment variable holding the pool credential")]
        credential_env: Option<String>,
    },
    #[command(about = "Run one reclaim cycle (expire entries, reap clients, destroy idle pools)")]
    Cleanup {
        #[arg(long, default_value_t = 60, help = "Heartbeat age after which a client is reaped")]
        liveness_secs: u64,
    },
    #[command(about = "Run the reclaim daemon until SIGINT/SIGTERM")]
    Daemon {
        #[arg(long, default_value_t = 1000, help = "Cycle period in milliseconds")]
        period_ms: u64,
        #[arg(long, default_value_t = 60, help = "Heartbeat age after which a client is reaped")]
        liveness_secs: u64,
    },
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
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint("Try `latzero --help`."));
            }
        },
    };

    let base_dir = cli.dir.unwrap_or_else(default_base_dir);
    command_dispatch::dispatch_command(cli.command, base_dir).map_err(add_hint)
}

fn add_hint(err: Error) -> Error {
    if err.hint().is_some() {
        return err;
    }
    match err.kind() {
        ErrorKind::LockTimeout => err.with_hint("Another process holds the lock; retry shortly."),
        ErrorKind::AuthFailure => {
            err.with_hint("Pass --credential-env naming a variable that holds the pool credential.")
        }
        ErrorKind::CapacityExceeded => {
            err.with_hint("Raise the pool's max capacity or delete entries.")
        }
        ErrorKind::CorruptedRecord => {
            err.with_hint("The record was skipped; rewrite the key or destroy the pool.")
        }
        ErrorKind::Timeout => err.with_hint("Check that a client is listening on the topic."),
        _ => err,
    }
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

fn emit_json(value: &Value) {
    let json = serde_json::to_string(value)
        .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("error: {}", error_message(err));
        if let Some(hint) = err.hint() {
            eprintln!("hint: {hint}");
        }
        return;
    }
    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::PoolNotFound => "pool not found".to_string(),
        ErrorKind::PoolAlreadyExists => "pool already exists".to_string(),
        ErrorKind::AuthFailure => "authentication failed".to_string(),
        ErrorKind::IntegrityFailure => "integrity check failed".to_string(),
        ErrorKind::CapacityExceeded => "pool capacity exceeded".to_string(),
        ErrorKind::LockTimeout => "timed out waiting for lock".to_string(),
        ErrorKind::Serialization => "value cannot be serialized".to_string(),
        ErrorKind::CorruptedRecord => "corrupted record".to_string(),
        ErrorKind::ReadOnly => "handle is read-only".to_string(),
        ErrorKind::Disconnected => "client was disconnected".to_string(),
        ErrorKind::RegistryFull => "registry is full".to_string(),
        ErrorKind::Timeout => "timed out waiting for a reply".to_string(),
        ErrorKind::HandlerFailed => "event handler failed".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
        ErrorKind::Internal => "internal error".to_string(),
    }
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(pool) = err.pool() {
        inner.insert("pool".to_string(), json!(pool));
    }
    if let Some(key) = err.key() {
        inner.insert("key".to_string(), json!(key));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    let mut causes = Vec::new();
    let mut cur = std::error::Error::source(err);
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}
