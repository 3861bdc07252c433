// SPDX-License-Identifier: Apache-2.0

//! Source-directory watcher for the tailer.
//!
//! Watches the directory containing the source file rather than the file
//! itself, since the inode may be removed and recreated by external log
//! rotation. Raw notify events are folded into tagged [`SourceEvent`]s so
//! the tailer's state machine never sees backend-specific event types.
//!
//! A companion poller stats the source path every 200 ms and raises a
//! truncate signal whenever the file shrinks below the tailer's recorded
//! read offset, which directory events alone cannot reveal.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How often the truncate poller stats the source file.
pub const TRUNCATE_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("watcher initialization failed: {0}")]
    Init(String),

    #[error("failed to watch {path}: {message}")]
    Watch { path: PathBuf, message: String },

    #[error("source file {0} has no parent directory or file name")]
    InvalidPath(PathBuf),
}

/// Event surfaced to the tailer from the watched source directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceEvent {
    /// The source file appeared (created or renamed into place).
    Created,
    /// The source file was written in place.
    Modified,
    /// The source file was removed or renamed away.
    Deleted,
    /// The open source file shrank below the recorded read offset.
    Truncated,
    /// Cancellation was requested.
    ShutdownRequested,
    /// The event channel closed or the truncate poller died; no further
    /// events will arrive.
    WatcherFailed,
}

/// Read-position bookkeeping shared between the tailer and the truncate
/// poller. The poller only compares sizes while a source handle is open.
#[derive(Debug, Default)]
pub struct SourcePosition {
    offset: AtomicU64,
    open: AtomicBool,
}

impl SourcePosition {
    pub fn set_offset(&self, offset: u64) {
        self.offset.store(offset, Ordering::Release);
    }

    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::Acquire)
    }

    pub fn mark_open(&self, open: bool) {
        self.open.store(open, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

/// Capability object producing [`SourceEvent`]s for a single source file.
#[derive(Debug)]
pub struct SourceWatcher {
    // Dropping the notify watcher stops event delivery, so it lives as long
    // as the event receiver.
    _watcher: RecommendedWatcher,
    events: mpsc::UnboundedReceiver<notify::Result<Event>>,
    truncate_rx: mpsc::Receiver<()>,
    truncate_err_rx: mpsc::Receiver<()>,
    source_name: OsString,
    cancel: CancellationToken,
}

impl SourceWatcher {
    /// Watch the directory of `source_file` and spawn the truncate poller.
    pub fn new(
        source_file: &Path,
        position: Arc<SourcePosition>,
        cancel: CancellationToken,
    ) -> Result<Self, WatcherError> {
        let dir = source_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| WatcherError::InvalidPath(source_file.to_path_buf()))?;
        let source_name = source_file
            .file_name()
            .ok_or_else(|| WatcherError::InvalidPath(source_file.to_path_buf()))?
            .to_os_string();

        let (event_tx, events) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = event_tx.send(res);
        })
        .map_err(|e| WatcherError::Init(e.to_string()))?;
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| WatcherError::Watch {
                path: dir.to_path_buf(),
                message: e.to_string(),
            })?;
        debug!(source_dir = %dir.display(), "source directory watch established");

        // Single-slot signal channel: a full slot means a truncate is already
        // pending and the next poll retries while the condition holds.
        let (truncate_tx, truncate_rx) = mpsc::channel(1);
        let (truncate_err_tx, truncate_err_rx) = mpsc::channel(1);
        tokio::spawn(detect_truncate(
            source_file.to_path_buf(),
            position,
            truncate_tx,
            truncate_err_tx,
            cancel.clone(),
        ));

        Ok(Self {
            _watcher: watcher,
            events,
            truncate_rx,
            truncate_err_rx,
            source_name,
            cancel,
        })
    }

    /// Block until the next event of interest for the source file.
    ///
    /// Directory events for other basenames are discarded; watcher backend
    /// errors are logged and skipped.
    pub async fn await_event(&mut self) -> SourceEvent {
        loop {
            select! {
                biased;
                _ = self.cancel.cancelled() => return SourceEvent::ShutdownRequested,
                event = self.events.recv() => {
                    match event {
                        None => return SourceEvent::WatcherFailed,
                        Some(Err(e)) => {
                            warn!(error = %e, "filesystem watcher reported an error");
                        }
                        Some(Ok(event)) => {
                            if let Some(source_event) = self.classify(&event) {
                                return source_event;
                            }
                        }
                    }
                }
                signal = self.truncate_rx.recv() => {
                    match signal {
                        Some(()) => return SourceEvent::Truncated,
                        None => return SourceEvent::WatcherFailed,
                    }
                }
                _ = self.truncate_err_rx.recv() => {
                    // The poller exited while we were not cancelled.
                    return SourceEvent::WatcherFailed;
                }
            }
        }
    }

    fn matches_source(&self, path: &Path) -> bool {
        path.file_name() == Some(self.source_name.as_os_str())
    }

    fn classify(&self, event: &Event) -> Option<SourceEvent> {
        let any_match = event.paths.iter().any(|p| self.matches_source(p));
        match &event.kind {
            EventKind::Create(_) if any_match => Some(SourceEvent::Created),
            EventKind::Remove(_) if any_match => Some(SourceEvent::Deleted),
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match event.paths.as_slice() {
                [from, to] => {
                    if self.matches_source(to) {
                        Some(SourceEvent::Created)
                    } else if self.matches_source(from) {
                        Some(SourceEvent::Deleted)
                    } else {
                        None
                    }
                }
                _ if any_match => Some(SourceEvent::Deleted),
                _ => None,
            },
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) if any_match => {
                Some(SourceEvent::Created)
            }
            EventKind::Modify(ModifyKind::Name(_)) if any_match => Some(SourceEvent::Deleted),
            EventKind::Modify(_) if any_match => Some(SourceEvent::Modified),
            _ => None,
        }
    }
}

/// Stat the source path on an interval and raise a truncate signal when its
/// size drops below the recorded read offset. Exits on cancellation, closing
/// the error channel held by [`SourceWatcher::await_event`].
async fn detect_truncate(
    path: PathBuf,
    position: Arc<SourcePosition>,
    truncate_tx: mpsc::Sender<()>,
    _err_tx: mpsc::Sender<()>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(TRUNCATE_POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                if !position.is_open() {
                    continue;
                }
                match tokio::fs::metadata(&path).await {
                    Ok(meta) => {
                        if meta.len() < position.offset() {
                            let _ = truncate_tx.try_send(());
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        warn!(error = %e, path = %path.display(), "truncate poll stat failed");
                    }
                }
            }
        }
    }
}
