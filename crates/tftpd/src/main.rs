//! TFTP Server - Main executable
//!
//! Command line parsing, log configuration, and orderly shutdown on
//! SIGTERM, SIGHUP, and SIGINT.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use argh::FromArgs;
use tftp::server::{Server, ServerConfig};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;

const DEFAULT_PORT: u16 = 69;

#[derive(FromArgs, Debug)]
/// TFTP server - concurrent RFC 1350 file transfer over UDP
struct CliConfig {
    /// set the mail prefix (default: $TFTP_MAIL_PREFIX or /var/spool/mail)
    #[argh(option, short = 'm')]
    mail_prefix: Option<PathBuf>,

    /// set the log level (critical, error, warn, info, debug, off)
    #[argh(option, short = 'l', default = "String::from(\"info\")")]
    log_level: String,

    /// set the port to listen on (default: 69)
    #[argh(option, short = 'p', default = "DEFAULT_PORT")]
    port: u16,
}

/// Map the CLI log level onto a tracing filter, case-insensitively.
///
/// `critical` folds into `error`, which is the closest tracing level.
fn parse_log_level(value: &str) -> Option<LevelFilter> {
    match value.to_ascii_lowercase().as_str() {
        "critical" | "error" => Some(LevelFilter::ERROR),
        "warn" => Some(LevelFilter::WARN),
        "info" => Some(LevelFilter::INFO),
        "debug" => Some(LevelFilter::DEBUG),
        "off" => Some(LevelFilter::OFF),
        _ => None,
    }
}

/// Flip the shutdown signal when SIGTERM, SIGHUP, or SIGINT arrives.
async fn signal_handler(shutdown: watch::Sender<bool>) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM."),
        _ = sighup.recv() => info!("Received SIGHUP."),
        _ = sigint.recv() => info!("Received SIGINT."),
    }

    let _ = shutdown.send(true);
    Ok(())
}

#[tokio::main]
async fn run(port: u16) -> Result<()> {
    let (shutdown, rx) = watch::channel(false);
    tokio::spawn(signal_handler(shutdown));

    let mut server = Server::new(ServerConfig {
        bind_address: format!("[::]:{port}"),
    });

    info!("TFTP server starting on UDP port {}.", port);
    server.run(rx).await?;
    info!("TFTP server stopped.");
    Ok(())
}

fn main() -> ExitCode {
    let cli: CliConfig = argh::from_env();

    let Some(level) = parse_log_level(&cli.log_level) else {
        eprintln!(
            "Unrecognized log level: {}\nValid log levels are: critical, error, warn, info, debug, off",
            cli.log_level
        );
        return ExitCode::FAILURE;
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    if let Some(prefix) = cli.mail_prefix {
        tftp::staging::set_mail_prefix(prefix);
    }

    match run(cli.port) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}
