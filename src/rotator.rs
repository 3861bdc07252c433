// SPDX-License-Identifier: Apache-2.0

//! Interval-driven rotation of the redirect file into the snapshot file.
//!
//! Each tick copies the redirect file into the snapshot (overwriting the
//! previous snapshot), truncates the redirect file in place, and notifies
//! the tailer and the extractor. The rotator manipulates the redirect file
//! by path only and never takes the tailer's writer lock; bytes written
//! between the copy and the truncate fall into a small, documented loss
//! window bounded by the 60 second interval floor.

use std::io::{self, ErrorKind};
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tokio::fs::{DirBuilder, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum Error {
    #[error("stopped by cancel signal")]
    Cancelled,

    #[error("rotation notification channel closed")]
    NotifyClosed,

    #[error("failed to create snapshot directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("failed to create snapshot file {path}: {source}")]
    CreateSnapshot { path: PathBuf, source: io::Error },

    #[error("failed to open redirect file {path}: {source}")]
    OpenRedirect { path: PathBuf, source: io::Error },

    #[error("failed to copy redirect file into snapshot: {0}")]
    Copy(io::Error),

    #[error("failed to truncate redirect file: {0}")]
    Truncate(io::Error),
}

pub struct Rotator {
    redirect_path: PathBuf,
    snapshot_path: PathBuf,
    interval: Duration,
}

impl Rotator {
    pub fn new(
        redirect_path: impl Into<PathBuf>,
        snapshot_path: impl Into<PathBuf>,
        interval: Duration,
    ) -> Self {
        Self {
            redirect_path: redirect_path.into(),
            snapshot_path: snapshot_path.into(),
            interval,
        }
    }

    /// Tick every interval until cancelled; the first rotation fires one
    /// full interval after start. Returns [`Error::Cancelled`] on shutdown.
    pub async fn run(
        self,
        tailer_tx: mpsc::Sender<()>,
        rescan_tx: mpsc::Sender<()>,
        cancel: CancellationToken,
    ) -> Result<(), Error> {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = ticker.tick() => {
                    if self.rotate().await? {
                        self.notify(&tailer_tx, &rescan_tx, &cancel).await?;
                    }
                }
            }
        }
    }

    /// Copy the redirect file into the snapshot and truncate the redirect
    /// file in place.
    ///
    /// Returns `Ok(false)` when the redirect file does not exist yet (the
    /// tailer has not produced output), in which case no notification must
    /// be sent.
    async fn rotate(&self) -> Result<bool, Error> {
        if let Some(dir) = self
            .snapshot_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
        {
            let mut builder = DirBuilder::new();
            builder.recursive(true);
            #[cfg(unix)]
            builder.mode(0o755);
            builder.create(dir).await.map_err(|e| Error::CreateDir {
                path: dir.to_path_buf(),
                source: e,
            })?;
        }

        let mut snapshot =
            File::create(&self.snapshot_path)
                .await
                .map_err(|e| Error::CreateSnapshot {
                    path: self.snapshot_path.clone(),
                    source: e,
                })?;

        let mut redirect = match OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.redirect_path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(
                    redirect_file = %self.redirect_path.display(),
                    "redirect file not present yet, skipping rotation tick"
                );
                return Ok(false);
            }
            Err(e) => {
                return Err(Error::OpenRedirect {
                    path: self.redirect_path.clone(),
                    source: e,
                })
            }
        };

        tokio::io::copy(&mut redirect, &mut snapshot)
            .await
            .map_err(Error::Copy)?;
        snapshot.flush().await.map_err(Error::Copy)?;

        redirect.set_len(0).await.map_err(Error::Truncate)?;

        Ok(true)
    }

    /// Notify the tailer, then the extractor. Each send is raced against
    /// cancellation so shutdown never blocks on a full slot.
    async fn notify(
        &self,
        tailer_tx: &mpsc::Sender<()>,
        rescan_tx: &mpsc::Sender<()>,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        select! {
            res = tailer_tx.send(()) => {
                if res.is_err() {
                    return Err(Error::NotifyClosed);
                }
            }
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        }

        info!(
            redirect_file = %self.redirect_path.display(),
            snapshot_file = %self.snapshot_path.display(),
            reason = "scheduled interval",
            "log file rotated"
        );

        select! {
            res = rescan_tx.send(()) => {
                if res.is_err() {
                    return Err(Error::NotifyClosed);
                }
            }
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        }

        Ok(())
    }
}
