// SPDX-License-Identifier: Apache-2.0

//! End-to-end tests for the tail, rotate, count, and scrape pipeline
//! against the real filesystem, with short rotation intervals injected
//! directly into the daemon (the 60 second floor is a configuration-load
//! rule).

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use kpitail::config::{Config, Kpi, LogConfig, PushGatewayConfig, ServerConfig};
use kpitail::init::daemon::Daemon;
use kpitail::listener::Listener;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

struct TestDaemon {
    _dir: TempDir,
    source: PathBuf,
    redirect: PathBuf,
    metrics_url: String,
    cancel: CancellationToken,
    handle: JoinHandle<Result<(), tower::BoxError>>,
}

fn kpi(name: &str, regex: &str) -> Kpi {
    Kpi {
        name: name.to_string(),
        regex: regex.to_string(),
        custom_labels: HashMap::new(),
    }
}

async fn start_daemon(rotation_interval: Duration, create_source: bool) -> TestDaemon {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("app.log");
    let redirect = dir.path().join("app_redirect.log");
    let snapshot = dir.path().join("app_rotated.log");
    if create_source {
        fs::File::create(&source).unwrap();
    }

    let config = Config {
        log_config: LogConfig {
            source_log_file: source.clone(),
            redirect_log_file: redirect.clone(),
            rotated_log_file: snapshot,
            rotation_interval,
        },
        server: ServerConfig {
            port: 0, // unused, the test binds its own listener
            metrics_path: "/metrics".to_string(),
            pushgateway: PushGatewayConfig::default(),
        },
        kpis: vec![
            kpi("test1", "test1"),
            kpi("test2", "test2"),
            kpi("test3", "test3"),
        ],
    };

    let listener = Listener::listen_async("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let bound = listener.bound_address().unwrap();
    let metrics_url = format!("http://{}/metrics", bound);

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(Daemon::new(config).run(listener, cancel.clone()));

    TestDaemon {
        _dir: dir,
        source,
        redirect,
        metrics_url,
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

fn gauge_value(body: &str, name: &str) -> Option<f64> {
    body.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some(n), Some(v)) if n == name => v.parse().ok(),
            _ => None,
        }
    })
}

async fn scrape(url: &str) -> String {
    reqwest::get(url)
        .await
        .expect("scrape request failed")
        .text()
        .await
        .expect("scrape body unreadable")
}

async fn wait_for_gauges(url: &str, expected: [(&str, f64); 3]) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let body = scrape(url).await;
        let matches = expected
            .iter()
            .all(|&(name, value)| gauge_value(&body, name) == Some(value));
        if matches {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "gauges never reached {expected:?}, last body:\n{body}"
        );
        sleep(Duration::from_millis(100)).await;
    }
}

async fn shutdown(daemon: TestDaemon) {
    daemon.cancel.cancel();
    let result = daemon.handle.await.unwrap();
    assert!(result.is_ok(), "daemon exited with {result:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tail_rotate_count_scrape_roundtrip() {
    let daemon = start_daemon(Duration::from_secs(2), true).await;

    // Give the tailer time to open the source and record end-of-file.
    sleep(Duration::from_millis(700)).await;
    append(
        &daemon.source,
        "test1 line\ntest1 again\ntest2 here\nunrelated\n",
    );

    wait_for_gauges(&daemon.metrics_url, [("test1", 2.0), ("test2", 1.0), ("test3", 0.0)]).await;

    let body = scrape(&daemon.metrics_url).await;
    assert!(body.contains("# HELP test1 count of test1 events from log monitoring"));
    assert!(body.contains("# TYPE test1 gauge"));

    // The next snapshot replaces the previous counts entirely.
    append(&daemon.source, "test3 only\n");
    wait_for_gauges(&daemon.metrics_url, [("test1", 0.0), ("test2", 0.0), ("test3", 1.0)]).await;

    shutdown(daemon).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scrape_unknown_path_returns_404() {
    let daemon = start_daemon(Duration::from_secs(60), true).await;
    sleep(Duration::from_millis(300)).await;

    let url = daemon.metrics_url.replace("/metrics", "/other");
    let response = reqwest::get(&url).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    // The metrics path itself serves even before the first rotation, with
    // all gauges at their initial zero.
    let body = scrape(&daemon.metrics_url).await;
    assert_eq!(gauge_value(&body, "test1"), Some(0.0));

    shutdown(daemon).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn source_created_after_startup_is_tailed() {
    let daemon = start_daemon(Duration::from_secs(60), false).await;
    sleep(Duration::from_millis(500)).await;

    fs::File::create(&daemon.source).unwrap();
    sleep(Duration::from_millis(800)).await;
    append(&daemon.source, "hello\n");

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if fs::read_to_string(&daemon.redirect)
            .map(|c| c == "hello\n")
            .unwrap_or(false)
        {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "redirect never received the new line"
        );
        sleep(Duration::from_millis(50)).await;
    }

    shutdown(daemon).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn clean_shutdown_without_activity() {
    let daemon = start_daemon(Duration::from_secs(60), true).await;
    sleep(Duration::from_millis(300)).await;
    shutdown(daemon).await;
}
