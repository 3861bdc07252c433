// SPDX-License-Identifier: Apache-2.0

//! Tailer: follows the source log and mirrors new lines into the redirect
//! file.
//!
//! The tailer alternates between draining new bytes from the source and
//! waiting on watcher events. Two auxiliary tasks share the redirect writer
//! behind a mutex: a periodic flush task and a rotation reactor that rewinds
//! the write handle to offset 0 after the rotator truncates the file on
//! disk.

pub mod watcher;

use std::io::{self, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::fs::{DirBuilder, File};
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::select;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::tailer::watcher::{SourceEvent, SourcePosition, SourceWatcher, WatcherError};

const IO_BUFFER_SIZE: usize = 64 * 1024;

/// Upper bound on how long a drained line sits in the redirect buffer
/// before it reaches disk.
const FLUSH_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to create redirect directory {path}: {source}")]
    CreateRedirectDir { path: PathBuf, source: io::Error },

    #[error("failed to create redirect file {path}: {source}")]
    CreateRedirect { path: PathBuf, source: io::Error },

    #[error(transparent)]
    Watcher(#[from] WatcherError),

    #[error("source event watcher stopped")]
    WatcherStopped,

    #[error("failed to write to redirect file: {0}")]
    RedirectWrite(io::Error),
}

/// Redirect write handle shared between the drain loop, the periodic flush
/// task, and the rotation reactor.
struct RedirectWriter {
    inner: Option<BufWriter<File>>,
}

impl RedirectWriter {
    fn new(file: File) -> Self {
        Self {
            inner: Some(BufWriter::with_capacity(IO_BUFFER_SIZE, file)),
        }
    }

    fn writer(&mut self) -> io::Result<&mut BufWriter<File>> {
        self.inner
            .as_mut()
            .ok_or_else(|| io::Error::other("redirect writer closed"))
    }

    async fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        self.writer()?.write_all(buf).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.writer()?.flush().await
    }

    /// Rewind the underlying handle to offset 0 after the rotator truncated
    /// the file on disk. Bytes still buffered here were not part of the
    /// copied snapshot, so they are carried across the seek and re-written
    /// at the start of the emptied file.
    async fn seek_start(&mut self) -> io::Result<()> {
        let writer = self
            .inner
            .take()
            .ok_or_else(|| io::Error::other("redirect writer closed"))?;
        let pending = writer.buffer().to_vec();
        let mut file = writer.into_inner();
        file.seek(SeekFrom::Start(0)).await?;
        let mut writer = BufWriter::with_capacity(IO_BUFFER_SIZE, file);
        if !pending.is_empty() {
            writer.write_all(&pending).await?;
        }
        self.inner = Some(writer);
        Ok(())
    }
}

struct SourceReader {
    reader: BufReader<File>,
    pos: u64,
}

pub struct Tailer {
    source_path: PathBuf,
    redirect_path: PathBuf,
}

impl Tailer {
    pub fn new(source_path: impl Into<PathBuf>, redirect_path: impl Into<PathBuf>) -> Self {
        Self {
            source_path: source_path.into(),
            redirect_path: redirect_path.into(),
        }
    }

    /// Run until cancellation or a fatal error.
    ///
    /// `rotate_rx` delivers rotation signals from the rotator; each one
    /// rewinds the redirect write handle to offset 0.
    pub async fn run(
        self,
        rotate_rx: mpsc::Receiver<()>,
        cancel: CancellationToken,
    ) -> Result<(), Error> {
        let writer = Arc::new(Mutex::new(self.open_redirect().await?));
        let position = Arc::new(SourcePosition::default());

        let mut watcher =
            SourceWatcher::new(&self.source_path, position.clone(), cancel.clone())?;

        self.spawn_rotation_reactor(rotate_rx, writer.clone(), cancel.clone());
        self.spawn_periodic_flush(writer.clone(), cancel.clone());

        let mut source = match self.open_source(&position).await {
            Ok(reader) => Some(reader),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(
                    source_file = %self.source_path.display(),
                    "source log does not exist yet, waiting for it to appear"
                );
                None
            }
            Err(e) => {
                warn!(error = %e, source_file = %self.source_path.display(),
                    "failed to open source log file");
                None
            }
        };

        loop {
            if let Some(reader) = source.as_mut() {
                self.drain(reader, &writer, &position).await?;
            }

            match watcher.await_event().await {
                SourceEvent::Created => {
                    if source.is_none() {
                        source = self.reopen_source(&position).await;
                    }
                }
                SourceEvent::Modified => {
                    // New data; the loop re-enters the drain phase.
                }
                SourceEvent::Deleted => {
                    if source.take().is_some() {
                        position.mark_open(false);
                        info!(
                            source_file = %self.source_path.display(),
                            "source log file removed or renamed, waiting for recreation"
                        );
                    }
                }
                SourceEvent::Truncated => {
                    info!(
                        source_file = %self.source_path.display(),
                        "source log file truncated, reopening"
                    );
                    source = self.reopen_source(&position).await;
                }
                SourceEvent::ShutdownRequested => break,
                SourceEvent::WatcherFailed => {
                    self.final_flush(&writer).await;
                    return Err(Error::WatcherStopped);
                }
            }
        }

        position.mark_open(false);
        self.final_flush(&writer).await;
        info!("tailer stopped");
        Ok(())
    }

    /// Create the redirect directory and file, truncating any prior content.
    async fn open_redirect(&self) -> Result<RedirectWriter, Error> {
        if let Some(dir) = self
            .redirect_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
        {
            let mut builder = DirBuilder::new();
            builder.recursive(true);
            #[cfg(unix)]
            builder.mode(0o755);
            builder
                .create(dir)
                .await
                .map_err(|e| Error::CreateRedirectDir {
                    path: dir.to_path_buf(),
                    source: e,
                })?;
        }

        let file = File::create(&self.redirect_path)
            .await
            .map_err(|e| Error::CreateRedirect {
                path: self.redirect_path.clone(),
                source: e,
            })?;
        info!(redirect_file = %self.redirect_path.display(), "redirect file opened");
        Ok(RedirectWriter::new(file))
    }

    /// Open the source read-only and record the end-of-file position, so
    /// tailing starts with lines written from now on.
    async fn open_source(&self, position: &SourcePosition) -> io::Result<SourceReader> {
        let mut file = File::open(&self.source_path).await?;
        let pos = file.seek(SeekFrom::End(0)).await?;
        position.set_offset(pos);
        position.mark_open(true);
        info!(
            source_file = %self.source_path.display(),
            offset = pos,
            "source file opened"
        );
        Ok(SourceReader {
            reader: BufReader::with_capacity(IO_BUFFER_SIZE, file),
            pos,
        })
    }

    async fn reopen_source(&self, position: &SourcePosition) -> Option<SourceReader> {
        match self.open_source(position).await {
            Ok(reader) => Some(reader),
            Err(e) => {
                position.mark_open(false);
                warn!(error = %e, source_file = %self.source_path.display(),
                    "failed to reopen source log file");
                None
            }
        }
    }

    /// Drain phase: copy newline-delimited chunks from the source into the
    /// redirect writer until EOF. Partial trailing content is written too;
    /// the redirect buffer is flushed by the periodic flush task.
    async fn drain(
        &self,
        source: &mut SourceReader,
        writer: &Arc<Mutex<RedirectWriter>>,
        position: &SourcePosition,
    ) -> Result<(), Error> {
        let mut line = Vec::with_capacity(1024);
        loop {
            line.clear();
            match source.reader.read_until(b'\n', &mut line).await {
                Ok(0) => {
                    position.set_offset(source.pos);
                    return Ok(());
                }
                Ok(n) => {
                    source.pos += n as u64;
                    let mut w = writer.lock().await;
                    w.write(&line).await.map_err(Error::RedirectWrite)?;
                }
                Err(e) => {
                    // Non-EOF read errors interrupt the drain; the next
                    // watcher event (typically truncate or delete) recovers
                    // the source handle.
                    warn!(error = %e, "error reading source log file");
                    position.set_offset(source.pos);
                    return Ok(());
                }
            }
        }
    }

    fn spawn_rotation_reactor(
        &self,
        mut rotate_rx: mpsc::Receiver<()>,
        writer: Arc<Mutex<RedirectWriter>>,
        cancel: CancellationToken,
    ) {
        let redirect_path = self.redirect_path.clone();
        tokio::spawn(async move {
            loop {
                select! {
                    _ = cancel.cancelled() => return,
                    signal = rotate_rx.recv() => {
                        match signal {
                            None => return,
                            Some(()) => {
                                let mut w = writer.lock().await;
                                match w.seek_start().await {
                                    Ok(()) => info!(
                                        redirect_file = %redirect_path.display(),
                                        "rotation signal received, redirect writer rewound"
                                    ),
                                    Err(e) => error!(
                                        error = %e,
                                        redirect_file = %redirect_path.display(),
                                        "failed to rewind redirect writer after rotation"
                                    ),
                                }
                            }
                        }
                    }
                }
            }
        });
    }

    fn spawn_periodic_flush(&self, writer: Arc<Mutex<RedirectWriter>>, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let mut w = writer.lock().await;
                        if let Err(e) = w.flush().await {
                            warn!(error = %e, "periodic redirect flush failed");
                        }
                    }
                }
            }
        });
    }

    async fn final_flush(&self, writer: &Arc<Mutex<RedirectWriter>>) {
        let mut w = writer.lock().await;
        if let Err(e) = w.flush().await {
            warn!(error = %e, "final redirect flush failed");
        }
        debug!(redirect_file = %self.redirect_path.display(), "redirect writer flushed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use std::path::Path;
    use tempfile::TempDir;
    use tokio::task::JoinHandle;
    use tokio::time::{sleep, Instant};

    struct Fixture {
        _dir: TempDir,
        source: PathBuf,
        redirect: PathBuf,
        rotate_tx: mpsc::Sender<()>,
        cancel: CancellationToken,
        handle: JoinHandle<Result<(), Error>>,
    }

    fn start_tailer(create_source: bool) -> Fixture {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("app.log");
        let redirect = dir.path().join("out").join("app_redirect.log");
        if create_source {
            fs::File::create(&source).unwrap();
        }

        let (rotate_tx, rotate_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let tailer = Tailer::new(&source, &redirect);
        let handle = tokio::spawn(tailer.run(rotate_rx, cancel.clone()));

        Fixture {
            _dir: dir,
            source,
            redirect,
            rotate_tx,
            cancel,
            handle,
        }
    }

    fn append(path: &Path, content: &str) {
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f.flush().unwrap();
    }

    async fn wait_for(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            sleep(Duration::from_millis(25)).await;
        }
    }

    async fn wait_for_redirect_content(fixture: &Fixture, expected: &str) {
        let path = fixture.redirect.clone();
        wait_for(&format!("redirect content {expected:?}"), || {
            fs::read_to_string(&path).map(|c| c == expected).unwrap_or(false)
        })
        .await;
    }

    async fn shutdown(fixture: Fixture) {
        fixture.cancel.cancel();
        let result = fixture.handle.await.unwrap();
        assert!(result.is_ok(), "tailer exited with {result:?}");
    }

    #[tokio::test]
    async fn redirect_starts_empty_even_with_stale_content() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("app.log");
        let redirect = dir.path().join("app_redirect.log");
        fs::File::create(&source).unwrap();
        fs::write(&redirect, b"stale content from a previous run").unwrap();

        let (_rotate_tx, rotate_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Tailer::new(&source, &redirect).run(rotate_rx, cancel.clone()));

        wait_for("empty redirect file", || {
            fs::metadata(&redirect).map(|m| m.len() == 0).unwrap_or(false)
        })
        .await;

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn mirrors_appended_lines() {
        let fixture = start_tailer(true);
        wait_for("redirect file", || fixture.redirect.exists()).await;
        // Let the tailer reach its end-of-file position first.
        sleep(Duration::from_millis(500)).await;

        append(&fixture.source, "hello\nworld\n");
        wait_for_redirect_content(&fixture, "hello\nworld\n").await;

        shutdown(fixture).await;
    }

    #[tokio::test]
    async fn starts_tailing_from_end_of_existing_content() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("app.log");
        let redirect = dir.path().join("app_redirect.log");
        fs::write(&source, b"existing line\n").unwrap();

        let (_rotate_tx, rotate_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Tailer::new(&source, &redirect).run(rotate_rx, cancel.clone()));
        sleep(Duration::from_millis(500)).await;

        append(&source, "new line\n");
        let redirect_path = redirect.clone();
        wait_for("only the new line mirrored", || {
            fs::read_to_string(&redirect_path)
                .map(|c| c == "new line\n")
                .unwrap_or(false)
        })
        .await;

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn waits_for_source_creation() {
        let fixture = start_tailer(false);
        wait_for("redirect file", || fixture.redirect.exists()).await;
        sleep(Duration::from_millis(300)).await;

        fs::File::create(&fixture.source).unwrap();
        sleep(Duration::from_millis(800)).await;
        append(&fixture.source, "hello\n");
        wait_for_redirect_content(&fixture, "hello\n").await;

        shutdown(fixture).await;
    }

    #[tokio::test]
    async fn follows_recreated_source_from_its_end() {
        let fixture = start_tailer(true);
        sleep(Duration::from_millis(500)).await;

        append(&fixture.source, "a\n");
        wait_for_redirect_content(&fixture, "a\n").await;

        fs::remove_file(&fixture.source).unwrap();
        sleep(Duration::from_millis(500)).await;

        fs::File::create(&fixture.source).unwrap();
        sleep(Duration::from_millis(800)).await;
        append(&fixture.source, "b\n");
        wait_for_redirect_content(&fixture, "a\nb\n").await;

        shutdown(fixture).await;
    }

    #[tokio::test]
    async fn resumes_after_external_truncation() {
        let fixture = start_tailer(true);
        sleep(Duration::from_millis(500)).await;

        append(&fixture.source, "1234567890\n");
        wait_for_redirect_content(&fixture, "1234567890\n").await;

        fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&fixture.source)
            .unwrap();
        // Truncate detection polls every 200ms; give the reopen time to land.
        sleep(Duration::from_millis(800)).await;

        append(&fixture.source, "x\n");
        wait_for_redirect_content(&fixture, "1234567890\nx\n").await;

        shutdown(fixture).await;
    }

    #[tokio::test]
    async fn rotation_signal_rewinds_redirect_writes() {
        let fixture = start_tailer(true);
        sleep(Duration::from_millis(500)).await;

        append(&fixture.source, "first line\n");
        wait_for_redirect_content(&fixture, "first line\n").await;

        // Simulate the rotator: truncate on disk, then signal the seek.
        fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&fixture.redirect)
            .unwrap();
        fixture.rotate_tx.send(()).await.unwrap();
        sleep(Duration::from_millis(300)).await;

        append(&fixture.source, "second\n");
        wait_for_redirect_content(&fixture, "second\n").await;

        shutdown(fixture).await;
    }
}
