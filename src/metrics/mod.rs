// SPDX-License-Identifier: Apache-2.0

//! KPI extraction from rotation snapshots.
//!
//! Each configured KPI is a named regex backed by one gauge. On every
//! rotation notification the extractor rescans the snapshot file and sets
//! each gauge to the number of snapshot lines its regex matches, so gauge
//! values always reflect exactly the most recent snapshot.

pub mod push;
pub mod server;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

use prometheus::{Gauge, Opts, Registry};
use regex::Regex;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::select;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Kpi, PushGatewayConfig};
use crate::metrics::push::{GatewayPusher, PushError};

/// Snapshot lines larger than this are skipped with a warning.
const MAX_SCAN_LINE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to compile regex for KPI {name}: {source}")]
    Regex { name: String, source: regex::Error },

    #[error("failed to register gauge for KPI {name}: {source}")]
    Register {
        name: String,
        source: prometheus::Error,
    },

    #[error("failed to build push gateway client: {0}")]
    PushClient(#[from] PushError),
}

#[derive(Debug)]
struct CompiledKpi {
    name: String,
    regex: Regex,
}

/// Extractor owning the compiled KPI table, the gauge registry, and the
/// transient count table used during rescans.
#[derive(Debug)]
pub struct KpiExtractor {
    kpis: Vec<CompiledKpi>,
    gauges: HashMap<String, Gauge>,
    counts: Mutex<HashMap<String, u64>>,
    snapshot_path: PathBuf,
    registry: Registry,
    pusher: Option<GatewayPusher>,
}

impl KpiExtractor {
    /// Compile every KPI regex and register one gauge per KPI. Any
    /// compilation failure or invalid metric name aborts startup.
    pub fn new(
        kpis: &[Kpi],
        snapshot_path: impl Into<PathBuf>,
        pushgateway: &PushGatewayConfig,
    ) -> Result<Self, Error> {
        let registry = Registry::new();
        let mut compiled = Vec::with_capacity(kpis.len());
        let mut gauges = HashMap::with_capacity(kpis.len());
        let mut counts = HashMap::with_capacity(kpis.len());

        for kpi in kpis {
            let regex = Regex::new(&kpi.regex).map_err(|e| Error::Regex {
                name: kpi.name.clone(),
                source: e,
            })?;

            let opts = Opts::new(
                kpi.name.clone(),
                format!("count of {} events from log monitoring", kpi.name),
            )
            .const_labels(kpi.custom_labels.clone());
            let gauge = Gauge::with_opts(opts).map_err(|e| Error::Register {
                name: kpi.name.clone(),
                source: e,
            })?;
            registry
                .register(Box::new(gauge.clone()))
                .map_err(|e| Error::Register {
                    name: kpi.name.clone(),
                    source: e,
                })?;

            gauges.insert(kpi.name.clone(), gauge);
            counts.insert(kpi.name.clone(), 0);
            compiled.push(CompiledKpi {
                name: kpi.name.clone(),
                regex,
            });
        }
        info!(kpi_count = compiled.len(), "KPI regex table compiled");

        let pusher = if pushgateway.enabled {
            Some(GatewayPusher::new(pushgateway)?)
        } else {
            None
        };

        Ok(Self {
            kpis: compiled,
            gauges,
            counts: Mutex::new(counts),
            snapshot_path: snapshot_path.into(),
            registry,
            pusher,
        })
    }

    /// Registry backing the scrape endpoint.
    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    /// Rescan on every rotation notification until cancellation.
    pub async fn run(
        self,
        mut rescan_rx: mpsc::Receiver<()>,
        cancel: CancellationToken,
    ) -> Result<(), Error> {
        loop {
            select! {
                _ = cancel.cancelled() => {
                    info!("extractor stopped");
                    return Ok(());
                }
                signal = rescan_rx.recv() => {
                    match signal {
                        None => {
                            info!("rescan channel closed, extractor stopped");
                            return Ok(());
                        }
                        Some(()) => self.rescan().await,
                    }
                }
            }
        }
    }

    /// One rescan cycle: reset counts, scan the snapshot, publish gauges,
    /// then push if configured. A missing or unreadable snapshot is
    /// non-fatal and leaves every count at 0 for the cycle.
    async fn rescan(&self) {
        let mut counts = self.counts.lock().await;
        for value in counts.values_mut() {
            *value = 0;
        }

        match self.scan_snapshot(&mut counts).await {
            Ok(lines) => debug!(lines, snapshot_file = %self.snapshot_path.display(),
                "snapshot rescan complete"),
            Err(e) => warn!(error = %e, snapshot_file = %self.snapshot_path.display(),
                "failed to read snapshot file, counts reset for this cycle"),
        }

        for kpi in &self.kpis {
            if let (Some(gauge), Some(count)) =
                (self.gauges.get(&kpi.name), counts.get(&kpi.name))
            {
                gauge.set(*count as f64);
            }
        }
        drop(counts);

        if let Some(pusher) = &self.pusher {
            match pusher.push(&self.registry).await {
                Ok(()) => debug!("metrics pushed to gateway"),
                Err(e) => warn!(error = %e, "failed to push metrics to gateway"),
            }
        }
    }

    /// Count matching lines per KPI. A line matching several KPIs counts
    /// once for each; multiple matches within one line count once.
    async fn scan_snapshot(&self, counts: &mut HashMap<String, u64>) -> io::Result<u64> {
        let file = File::open(&self.snapshot_path).await?;
        let mut reader = BufReader::with_capacity(64 * 1024, file);
        let mut buf = Vec::with_capacity(1024);
        let mut lines = 0u64;

        loop {
            buf.clear();
            let n = reader.read_until(b'\n', &mut buf).await?;
            if n == 0 {
                break;
            }
            if buf.len() > MAX_SCAN_LINE {
                warn!(
                    size = buf.len(),
                    snapshot_file = %self.snapshot_path.display(),
                    "skipping oversized snapshot line"
                );
                continue;
            }

            let text = String::from_utf8_lossy(&buf);
            let line = text.trim_end_matches('\n').trim_end_matches('\r');
            for kpi in &self.kpis {
                if kpi.regex.is_match(line) {
                    if let Some(count) = counts.get_mut(&kpi.name) {
                        *count += 1;
                    }
                }
            }
            lines += 1;
        }

        Ok(lines)
    }
}
