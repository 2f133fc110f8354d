type Result<T> = color_eyre::eyre::Result<T>;

mod cli;
mod connector;
mod exchange;
mod messages;
mod receiver;
mod signals;
mod supervisor;

use clap::Parser;
use std::io::IsTerminal;
use tokio::select;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{Cli, Config};
use exchange::{Exchange, Finish, RunReport};
use signals::Signals;
use supervisor::Supervisor;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;

    // The log is the tool's output, so default to info
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_ansi(std::io::stdout().is_terminal()))
        .with(filter)
        .init();

    let cli = Cli::parse();
    let config = Config::from_cli(cli)?;

    let messages = config.load_messages()?;
    info!(
        "Prepared {} messages ({} bytes)",
        messages.len(),
        messages.total_len()
    );
    if messages.is_empty() {
        warn!("No messages selected, only connecting");
    }
    for (i, message) in messages.messages().iter().enumerate() {
        debug!("Message {}: {} ({} bytes)", i, message.name, message.len());
    }

    let mut signals = Signals::new()?;

    // Start the server first so it is listening by the time we connect
    let supervisor = match &config.process {
        Some(process) => Some(Supervisor::start(process)?),
        None => None,
    };

    let exchange = Exchange::new(config.exchange.clone(), messages.into_inner(), supervisor);

    select! {
        report = exchange.run() => log_report(&report?),
        signal = signals.next() => {
            // Dropping the exchange kills the supervised server
            warn!("Received {}, exiting", signal.unwrap_or("signal"));
        }
    }

    info!("msgbounds exiting");
    Ok(())
}

fn log_report(report: &RunReport) {
    info!(
        "Sent {} messages, {} short writes, {} replies read",
        report.sent,
        report.short_writes,
        report.replies.len()
    );
    for reply in &report.replies {
        debug!("Reply at {:?}: {}", reply.step, reply.bytes.escape_ascii());
    }

    match &report.finish {
        Finish::Slept => info!("Done"),
        Finish::Process(process) => info!(
            "Server finished with {} ({:?}, signal delivered: {}, \
             {} bytes stdout, {} bytes stderr)",
            process.exit,
            process.resolution,
            process.signal_delivered,
            process.output.stdout.len(),
            process.output.stderr.len()
        ),
    }
}
