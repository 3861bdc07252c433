// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use kpitail::config::Config;
use kpitail::init::args::Arguments;
use kpitail::init::daemon::Daemon;
use kpitail::listener::Listener;
use std::net::SocketAddr;
use std::process::ExitCode;
use tokio::select;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::{error, info};
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

fn main() -> ExitCode {
    let opt = Arguments::parse();

    let config = match Config::load_file(&opt.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            return ExitCode::from(1);
        }
    };

    let _logger = match setup_logging(&opt.log_level) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("ERROR: failed to set up logging: {}", e);
            return ExitCode::from(1);
        }
    };

    // Bind the scrape port before the runtime starts; a busy port must
    // abort startup, not a running daemon.
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = match Listener::listen_std(addr) {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, "failed to bind metrics endpoint");
            return ExitCode::from(1);
        }
    };

    match run_daemon(config, listener) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "daemon exited with error");
            ExitCode::from(1)
        }
    }
}

#[tokio::main]
async fn run_daemon(config: Config, listener: Listener) -> Result<(), BoxError> {
    let cancel = CancellationToken::new();

    let root = cancel.clone();
    tokio::spawn(async move {
        signal_wait().await;
        info!("shutdown signal received");
        root.cancel();
    });

    Daemon::new(config).run(listener, cancel).await
}

async fn signal_wait() {
    let mut sig_term = sig(SignalKind::terminate());
    let mut sig_int = sig(SignalKind::interrupt());

    select! {
        _ = sig_term.recv() => {},
        _ = sig_int.recv() => {},
    }
}

fn sig(kind: SignalKind) -> Signal {
    signal(kind).unwrap()
}

type LoggerGuard = tracing_appender::non_blocking::WorkerGuard;

fn setup_logging(log_level: &str) -> std::io::Result<LoggerGuard> {
    LogTracer::init().expect("Unable to setup log tracer!");

    let (non_blocking_writer, guard) = tracing_appender::non_blocking(std::io::stdout());

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_writer)
        .with_target(false)
        .with_level(true)
        .compact();

    let subscriber = Registry::default()
        .with(EnvFilter::new(log_level))
        .with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).unwrap();

    Ok(guard)
}
