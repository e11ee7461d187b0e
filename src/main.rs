use std::io;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use darkhttpd::config::{Cli, Config};
use darkhttpd::error::{HttpdError, HttpdResult};
use darkhttpd::response::SERVER_NAME;
use darkhttpd::server::Server;
use darkhttpd::syscalls;

fn main() {
    // any startup failure is fatal and reported on stderr
    if let Err(e) = run() {
        eprintln!("darkhttpd: {e}");
        process::exit(1);
    }
}

fn run() -> HttpdResult<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // usage, help and argument errors all exit non-zero
            let _ = e.print();
            process::exit(1);
        }
    };

    init_logging();
    info!("{SERVER_NAME} starting");

    let config = Config::from_cli(cli)?;

    syscalls::ignore_sigpipe()?;
    let mut server = Server::new(&config)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::Release);
    })
    .map_err(|e| HttpdError::Startup {
        what: "can't install shutdown handler".to_owned(),
        source: io::Error::other(e),
    })?;

    server.run(shutdown)
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
