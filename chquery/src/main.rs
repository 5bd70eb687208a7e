//! Entrypoint of the chquery binary
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr,
    clippy::future_not_send
)]

use dotenvy::dotenv;
use tracing_subscriber::EnvFilter;

mod commands {
    pub(crate) mod common;
    pub(crate) mod ping;
    pub(crate) mod query;
}

enum ReturnCode {
    Failure = 1,
}

#[derive(Debug, clap::Parser)]
#[clap(
    name = "chquery",
    version,
    about = "Run queries against ClickHouse over HTTP",
    long_about = r#"Run queries against ClickHouse over HTTP

Examples:
    # Check that the server is reachable
    chquery ping --addr localhost:8123

    # Stream the result of a query to stdout as tab separated values
    chquery query "SELECT number, number + 1 FROM system.numbers LIMIT 10"

    # Try a second server if the first cannot be reached, with compressed responses
    chquery query --fallback-addr replica:8123 --compress "SELECT count() FROM hits"

    # Show what the client is doing
    LOG_FILTER=debug chquery ping
"#
)]
struct Config {
    /// Logging filter, in `tracing_subscriber::EnvFilter` syntax, e.g. `info,chclient=debug`
    #[clap(long = "log-filter", env = "LOG_FILTER", default_value = "warn", global = true)]
    log_filter: String,

    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, clap::Parser)]
enum Command {
    /// Check that the server can be reached and accepts the credentials
    Ping(commands::ping::Config),

    /// Run a query and print its rows
    Query(commands::query::Config),
}

fn main() -> Result<(), std::io::Error> {
    // load all environment variables from .env before doing anything
    load_dotenv();

    let config: Config = clap::Parser::parse();

    if let Err(e) = init_logs(&config.log_filter) {
        eprintln!("Initializing logs failed: {e}");
        std::process::exit(ReturnCode::Failure as _);
    }

    let tokio_runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    tokio_runtime.block_on(async move {
        match config.command {
            None => println!("command required, -h/--help for help"),
            Some(Command::Ping(config)) => {
                if let Err(e) = commands::ping::command(config).await {
                    eprintln!("Ping command failed: {e}");
                    std::process::exit(ReturnCode::Failure as _)
                }
            }
            Some(Command::Query(config)) => {
                if let Err(e) = commands::query::command(config).await {
                    eprintln!("Query command failed: {e}");
                    std::process::exit(ReturnCode::Failure as _)
                }
            }
        }
    });

    Ok(())
}

fn init_logs(filter: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(filter)?)
        .with_writer(std::io::stderr)
        .try_init()
}

/// Source the .env file before initialising the Config struct - this sets
/// any envs in the file, which the Config struct then uses.
///
/// Precedence is given to existing env variables.
fn load_dotenv() {
    match dotenv() {
        Ok(_) => {}
        Err(dotenvy::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            // Ignore this - a missing env file is not an error, defaults will
            // be applied when initialising the Config struct.
        }
        Err(e) => {
            eprintln!("FATAL Error loading config from: {e}");
            eprintln!("Aborting");
            std::process::exit(1);
        }
    };
}
