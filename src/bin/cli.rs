//! PMKV CLI
//!
//! Command-line interface for operating on a PMKV pool file.

use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use pmkv::protocol::{Command, Status};
use pmkv::{CheckStatus, Config, Durability, Engine};
use tracing_subscriber::{fmt, EnvFilter};

/// PMKV CLI
#[derive(Parser, Debug)]
#[command(name = "pmkv-cli")]
#[command(about = "CLI for the PMKV persistent key-value store")]
#[command(version)]
struct Args {
    /// Pool file
    #[arg(short, long, default_value = "./pmkv.pool")]
    pool: String,

    /// Pool size in MB when creating a new pool
    #[arg(short, long, default_value = "64")]
    size_mb: u64,

    /// Discard any existing pool and create a fresh one
    #[arg(long)]
    force_create: bool,

    /// Durability barrier strategy
    #[arg(long, value_enum, default_value = "flush")]
    durability: DurabilityArg,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DurabilityArg {
    /// msync on every barrier
    Flush,
    /// Fence only; survives process death
    Process,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Get a value by key
    Get {
        /// The key to get
        key: String,
    },

    /// Set a key-value pair
    Put {
        /// The key to set
        key: String,

        /// The value to set
        value: String,
    },

    /// Delete a key
    Del {
        /// The key to delete
        key: String,
    },

    /// Check whether a key exists
    Exists {
        /// The key to check
        key: String,
    },

    /// Count keys
    Count,

    /// Audit the pool file without opening it
    Check,

    /// Put keys "0".."count" with values "<i>!", printing each committed index
    Fill {
        /// Number of keys to write
        #[arg(short, long)]
        count: u64,

        /// Times to write the whole sequence; later passes overwrite
        #[arg(long, default_value = "1")]
        passes: u64,
    },

    /// Delete keys "0".."count" in order, printing each deleted index
    DeleteSeq {
        /// Number of keys to delete
        #[arg(short, long)]
        count: u64,
    },
}

fn main() -> ExitCode {
    // Initialize tracing/logging (stderr, so stdout stays machine readable)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,pmkv=info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if let Commands::Check = args.command {
        return match Engine::check(&args.pool) {
            CheckStatus::Consistent => {
                println!("consistent");
                ExitCode::SUCCESS
            }
            CheckStatus::Inconsistent => {
                println!("inconsistent");
                ExitCode::from(1)
            }
            CheckStatus::CheckFailed => {
                println!("check failed");
                ExitCode::from(2)
            }
        };
    }

    let durability = match args.durability {
        DurabilityArg::Flush => Durability::Flush,
        DurabilityArg::Process => Durability::Process,
    };
    let config = Config::builder()
        .path(&args.pool)
        .pool_size(args.size_mb * 1024 * 1024)
        .force_create(args.force_create)
        .durability(durability)
        .build();

    let engine = match Engine::open(config) {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!("Failed to open pool {}: {}", args.pool, e);
            return ExitCode::from(2);
        }
    };

    let command = match args.command {
        Commands::Get { key } => Command::Get { key: key.into_bytes() },
        Commands::Put { key, value } => Command::Put {
            key: key.into_bytes(),
            value: value.into_bytes(),
        },
        Commands::Del { key } => Command::Delete { key: key.into_bytes() },
        Commands::Exists { key } => Command::Exists { key: key.into_bytes() },
        Commands::Count => Command::Count,
        Commands::Fill { count, passes } => return fill(engine, count, passes),
        Commands::DeleteSeq { count } => return delete_seq(engine, count),
        Commands::Check => unreachable!("handled before opening"),
    };

    let response = engine.execute(command.clone());
    match (&command, response.status) {
        (Command::Get { .. }, Status::Ok) => {
            let value = response.payload.unwrap_or_default();
            println!("{}", String::from_utf8_lossy(&value));
        }
        (Command::Count, Status::Ok) => {
            println!("{}", response.as_count().unwrap_or_default());
        }
        (Command::Exists { .. }, status) => {
            println!("{}", status.is_ok());
        }
        (_, Status::Ok) => println!("OK"),
        (_, Status::NotFound) => println!("NOT_FOUND"),
        (_, status) => {
            let message = response.payload.unwrap_or_default();
            eprintln!("{:?}: {}", status, String::from_utf8_lossy(&message));
        }
    }

    let exit = match response.status {
        Status::Ok | Status::NotFound => ExitCode::SUCCESS,
        _ => ExitCode::from(1),
    };

    if let Err(e) = engine.close() {
        tracing::error!("Failed to close pool: {}", e);
        return ExitCode::from(1);
    }

    exit
}

/// Sequential load used by crash tests: every printed index is committed.
///
/// Indices count operations across passes, so pass 2 of a 100-key fill
/// prints 100..200.
fn fill(engine: Engine, count: u64, passes: u64) -> ExitCode {
    let mut done = 0;
    for _ in 0..passes {
        for i in 0..count {
            let key = i.to_string();
            let value = format!("{}!", i);
            if let Err(e) = engine.put(key.as_bytes(), value.as_bytes()) {
                tracing::error!("put {} failed: {}", i, e);
                return ExitCode::from(1);
            }
            if report(done).is_err() {
                return ExitCode::from(1);
            }
            done += 1;
        }
    }

    finish(engine)
}

/// Sequential deletes used by crash tests: every printed index is gone
fn delete_seq(engine: Engine, count: u64) -> ExitCode {
    for i in 0..count {
        if let Err(e) = engine.delete(i.to_string().as_bytes()) {
            tracing::error!("delete {} failed: {}", i, e);
            return ExitCode::from(1);
        }
        if report(i).is_err() {
            return ExitCode::from(1);
        }
    }

    finish(engine)
}

fn report(index: u64) -> std::io::Result<()> {
    use std::io::Write;

    let mut out = std::io::stdout().lock();
    writeln!(out, "{}", index)?;
    out.flush()
}

fn finish(engine: Engine) -> ExitCode {
    match engine.close() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Failed to close pool: {}", e);
            ExitCode::from(1)
        }
    }
}
