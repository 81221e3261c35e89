//! awdshells — multi-session reverse shell aggregator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use awdshells::cli::Repl;
use awdshells::config::{Config, LISTEN_ADDR};
use awdshells::logger::{self, Level, Logger};
use awdshells::server::Server;

/// Multi-session reverse shell aggregator.
#[derive(Parser, Debug)]
#[command(name = "awdshells")]
#[command(about, long_about = None, disable_version_flag = true)]
struct Cli {
    /// TCP listen port
    #[arg(short, long, default_value_t = 11451)]
    port: u16,

    /// Runtime worker thread count
    #[arg(short, long, default_value_t = 50)]
    concurrency: usize,

    /// Display log level (raw, success, message, warning, error, none)
    #[arg(short, long, default_value = "success")]
    level: String,

    /// Start the graphical frontend instead of the CLI
    #[arg(short, long)]
    gui: bool,

    /// Show version
    #[arg(short = 'v', long)]
    version: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("awdshells {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let level: Level = cli.level.parse()?;

    let mut config = Config {
        port: cli.port,
        concurrency: cli.concurrency,
        log_level: level,
        gui: cli.gui,
        ..Config::default()
    };
    config.apply_env_overrides();
    config.validate()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.concurrency)
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> anyhow::Result<()> {
    let log = Arc::new(Logger::new(logger::default_file_name(), config.log_level));

    log.message(format!(
        "Starting server... on {LISTEN_ADDR}:{}, with {} as concurrency hint",
        config.port, config.concurrency
    ));

    let server = Arc::new(Server::new(&config, Arc::clone(&log)));
    server.start().await?;

    log.success("Server started.");
    log.message("Receiving sessions...");

    // Ctrl-C asks the REPL to wind down after its current command; the
    // blocking stdin read itself cannot be interrupted.
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        let log = Arc::clone(&log);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log.message("Ctrl-C pressed. Exiting program...");
                interrupted.store(true, Ordering::Release);
            }
        });
    }

    if config.gui {
        log.message("Starting GUI...");
        // no graphical frontend yet; fall through to the CLI
        log.message("GUI stopped.");
    }

    log.message("Starting CLI...");
    let repl_result = {
        let server = Arc::clone(&server);
        let log = Arc::clone(&log);
        let handle = tokio::runtime::Handle::current();
        let interrupted = Arc::clone(&interrupted);
        tokio::task::spawn_blocking(move || {
            let mut repl = Repl::new(server, log, handle, interrupted);
            let stdin = std::io::stdin();
            let mut input = stdin.lock();
            let mut output = std::io::stdout();
            repl.run(&mut input, &mut output)
        })
        .await
        .context("CLI thread panicked")?
    };
    repl_result.context("CLI I/O failure")?;
    log.message("CLI stopped.");

    log.message("Stopping server...");
    server.stop();
    log.success("Server stopped.");

    Ok(())
}
