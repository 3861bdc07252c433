// SPDX-License-Identifier: Apache-2.0

//! Daemon wiring: builds the tailer, rotator, and extractor, connects their
//! notification channels, and runs them under a shared cancellation root.
//!
//! The first fatal task error wins the select, cancels the remaining tasks,
//! and is returned to the caller; cancellation of the root token (signal
//! handling lives in the binary) produces a clean shutdown instead.

use std::time::Duration;

use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::listener::Listener;
use crate::metrics::server::MetricsServer;
use crate::metrics::KpiExtractor;
use crate::rotator::{self, Rotator};
use crate::tailer::Tailer;

/// How long shutdown waits for tasks to drain after cancellation.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Daemon {
    config: Config,
}

impl Daemon {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run until the root token is cancelled or a task fails fatally.
    pub async fn run(
        self,
        listener: Listener,
        cancel: CancellationToken,
    ) -> Result<(), BoxError> {
        let config = self.config;

        // Extractor construction compiles the KPI regexes and registers the
        // gauges; failures here are startup errors, before any task runs.
        let extractor = KpiExtractor::new(
            &config.kpis,
            &config.log_config.rotated_log_file,
            &config.server.pushgateway,
        )?;
        let server = MetricsServer::new(extractor.registry(), config.server.metrics_path.clone());

        info!(
            source_file = %config.log_config.source_log_file.display(),
            redirect_file = %config.log_config.redirect_log_file.display(),
            snapshot_file = %config.log_config.rotated_log_file.display(),
            rotation_interval = %humantime::format_duration(config.log_config.rotation_interval),
            "starting kpitail"
        );

        let mut task_set: JoinSet<Result<(), BoxError>> = JoinSet::new();
        let tasks_cancel = cancel.child_token();

        let (rotate_tx, rotate_rx) = mpsc::channel::<()>(1);
        let (rescan_tx, rescan_rx) = mpsc::channel::<()>(1);

        let tailer = Tailer::new(
            &config.log_config.source_log_file,
            &config.log_config.redirect_log_file,
        );
        {
            let cancel = tasks_cancel.clone();
            task_set.spawn(async move {
                tailer
                    .run(rotate_rx, cancel)
                    .await
                    .map_err(|e| -> BoxError { format!("tailing failed: {e}").into() })
            });
        }

        let rotator = Rotator::new(
            &config.log_config.redirect_log_file,
            &config.log_config.rotated_log_file,
            config.log_config.rotation_interval,
        );
        {
            let cancel = tasks_cancel.clone();
            task_set.spawn(async move {
                match rotator.run(rotate_tx, rescan_tx, cancel).await {
                    Ok(()) | Err(rotator::Error::Cancelled) => Ok(()),
                    Err(e) => Err(format!("rotation failed: {e}").into()),
                }
            });
        }

        {
            let cancel = tasks_cancel.clone();
            task_set.spawn(async move {
                extractor
                    .run(rescan_rx, cancel)
                    .await
                    .map_err(|e| -> BoxError { format!("metrics extraction failed: {e}").into() })
            });
        }

        {
            let cancel = tasks_cancel.clone();
            task_set.spawn(async move {
                server
                    .serve(listener, cancel)
                    .await
                    .map_err(|e| -> BoxError { format!("metrics server failed: {e}").into() })
            });
        }

        let mut result = Ok(());
        select! {
            _ = cancel.cancelled() => {
                info!("shutdown requested, stopping tasks");
            }
            res = wait_for_any_task(&mut task_set) => {
                match res {
                    Ok(()) => warn!("unexpected early task exit"),
                    Err(e) => result = Err(e),
                }
            }
        }

        tasks_cancel.cancel();
        if let Err(e) = wait_for_tasks_with_timeout(&mut task_set, SHUTDOWN_DRAIN_TIMEOUT).await {
            warn!(error = %e, "timed out waiting for tasks to stop");
        }

        result
    }
}

async fn wait_for_any_task(tasks: &mut JoinSet<Result<(), BoxError>>) -> Result<(), BoxError> {
    match tasks.join_next().await {
        None => Ok(()), // should not happen, the set is never empty here
        Some(res) => res?,
    }
}

async fn wait_for_tasks_with_timeout(
    tasks: &mut JoinSet<Result<(), BoxError>>,
    timeout: Duration,
) -> Result<(), BoxError> {
    let stop_at = Instant::now() + timeout;
    let mut result = Ok(());
    loop {
        match timeout_at(stop_at, tasks.join_next()).await {
            Err(_) => {
                result = Err("timed out waiting for tasks to complete".into());
                break;
            }
            Ok(None) => break,
            Ok(Some(v)) => match v {
                Ok(Ok(())) => {}
                Ok(Err(e)) => result = Err(e),
                Err(e) => error!(error = %e, "failed to join task"),
            },
        }
    }

    result
}
