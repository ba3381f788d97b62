use clap::Parser;
use env_logger::Env;
use log::{error, info, warn};
use mijia_logger::app::{Options, run_with_io};
use mijia_logger::output::csv_log::CsvLog;
use mijia_logger::session::bluer::BluerRadio;
use std::panic::{self, PanicHookInfo};
use std::sync::Arc;

/// Exit codes for the application
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PANIC: i32 = 2;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Set up panic hook to ensure clean exit codes for process managers
    // (e.g., systemd, docker restart policies) that monitor exit status
    panic::set_hook(Box::new(move |info: &PanicHookInfo| {
        eprintln!("Panic! {}", info);
        std::process::exit(EXIT_PANIC);
    }));

    // A missing .env file is fine.
    dotenv::dotenv().ok();
    let options = Options::parse();

    let default_filter = if options.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_filter))
        .format_timestamp_secs()
        .init();

    info!(
        "mijia-logger {} starting: mode={} output={}",
        env!("CARGO_PKG_VERSION"),
        options.mode,
        options.output.display()
    );
    match options.device {
        Some(address) => info!("Using fixed device {address}"),
        None => info!("Reading device selection from {}", options.config.display()),
    }

    let mut log = CsvLog::new(&options.output);
    if let Err(e) = log.ensure() {
        warn!("Cannot prepare {}: {e}", options.output.display());
    }

    let radio = Arc::new(BluerRadio::new());
    let shutdown = tokio::signal::ctrl_c();

    match run_with_io(&options, radio, options.selection_source(), &mut log, shutdown).await {
        Ok(()) => std::process::exit(EXIT_SUCCESS),
        Err(why) => {
            error!("{why}");
            std::process::exit(EXIT_ERROR);
        }
    }
}
