#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use codedocs_local_runtime::{
    InstallPipeline, OllamaCatalog, OllamaClient, ProgressEvent, RuntimeConfig,
};
use common::{free_port, FakeRuntime};
use futures_util::StreamExt;

const PULL_SCRIPT: &str = r#"case "$2" in
  bad)
    echo "pulling manifest"
    echo "Error: nope" >&2
    echo "verifying sha256 digest"
    exit 1
    ;;
  slow)
    echo $$ > "$(dirname "$0")/pull.pid"
    exec sleep 30
    ;;
  *)
    printf 'pulling %s 50%%\rpulling %s 100%%\n' "$2" "$2"
    echo "got $2"
    ;;
esac"#;

async fn catalog_with_tags(config: &RuntimeConfig, tags: &str) -> (OllamaCatalog, mockito::ServerGuard) {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/api/tags")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(tags)
        .create_async()
        .await;

    let catalog = OllamaCatalog::new(config, free_port())
        .with_client(OllamaClient::with_url(server.url()));
    (catalog, server)
}

fn progress_lines<'a>(events: &'a [ProgressEvent], model: &str) -> Vec<&'a str> {
    events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::Progress { model: m, line } if m == model => Some(line.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_pull_children_drive_the_pipeline() {
    let fake = FakeRuntime::new(PULL_SCRIPT);
    let config = fake.config().build();
    let (catalog, _server) =
        catalog_with_tags(&config, r#"{"models":[{"name":"present:latest"}]}"#).await;

    let pipeline = InstallPipeline::new(Arc::new(catalog));
    let events: Vec<ProgressEvent> = pipeline
        .install_sequential(&["bad", "present", "good"])
        .await
        .collect()
        .await;

    // Event skeleton without progress lines.
    let skeleton: Vec<String> = events
        .iter()
        .filter(|e| !matches!(e, ProgressEvent::Progress { .. }))
        .map(|e| e.message())
        .collect();
    assert_eq!(
        skeleton,
        vec![
            "Installing model bad...",
            "Failed to install model bad: pull exited with exit status: 1",
            "Model present already exists.",
            "Installing model good...",
            "Model good installed successfully.",
            "Installation process completed.",
        ]
    );

    // Progress of a model sits between its start and its outcome.
    let position = |wanted: &ProgressEvent| events.iter().position(|e| e == wanted).unwrap();
    let bad_start = position(&ProgressEvent::InstallStarted { model: "bad".into() });
    let bad_end = events
        .iter()
        .position(|e| matches!(e, ProgressEvent::InstallFailed { model, .. } if model == "bad"))
        .unwrap();
    for (i, event) in events.iter().enumerate() {
        if event.model() == Some("bad") {
            assert!(i >= bad_start && i <= bad_end);
        }
    }

    // Both streams reach the caller; stdout keeps its own order.
    let bad = progress_lines(&events, "bad");
    assert_eq!(bad.len(), 3);
    assert!(bad.contains(&"Error: nope"));
    let stdout_only: Vec<&str> = bad.iter().copied().filter(|l| *l != "Error: nope").collect();
    assert_eq!(stdout_only, vec!["pulling manifest", "verifying sha256 digest"]);

    // Carriage returns split progress redraws into separate lines.
    assert_eq!(
        progress_lines(&events, "good"),
        vec!["pulling good 50%", "pulling good 100%", "got good"]
    );

    match events.last() {
        Some(ProgressEvent::BatchComplete { summary }) => {
            assert_eq!(summary.installed, vec!["good"]);
            assert_eq!(summary.already_present, vec!["present"]);
            assert_eq!(summary.failed, vec!["bad"]);
        }
        other => panic!("expected BatchComplete, got {:?}", other),
    }

    // Each pull ran as `<binary> [args] pull <name>` against the runtime's host.
    assert_eq!(fake.spawn_args(), vec!["pull", "pull"]);
    let host = std::fs::read_to_string(&fake.host_file).unwrap();
    assert!(host.trim().starts_with("127.0.0.1:"), "{}", host);
}

#[tokio::test]
async fn test_listing_failure_pulls_everything() {
    let fake = FakeRuntime::new(PULL_SCRIPT);
    let config = fake.config().build();
    // Nothing listens on this port, so listing fails.
    let catalog = OllamaCatalog::new(&config, free_port());

    let events: Vec<ProgressEvent> = InstallPipeline::new(Arc::new(catalog))
        .install_sequential(&["good"])
        .await
        .collect()
        .await;

    assert_eq!(events.first(), Some(&ProgressEvent::InstallStarted { model: "good".into() }));
    assert!(events.contains(&ProgressEvent::InstallSucceeded { model: "good".into() }));
    assert!(events.last().unwrap().is_terminal());
}

#[tokio::test]
async fn test_spawn_failure_is_isolated() {
    let fake = FakeRuntime::new(PULL_SCRIPT);
    let broken = fake
        .config()
        .runtime_binary(fake.dir.path().join("no-such-ollama"))
        .binary_args(Vec::<String>::new())
        .build();
    let (catalog, _server) = catalog_with_tags(&broken, r#"{"models":[]}"#).await;

    let events: Vec<ProgressEvent> = InstallPipeline::new(Arc::new(catalog))
        .install_sequential(&["a", "b"])
        .await
        .collect()
        .await;

    let failed: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::InstallFailed { model, reason } => {
                assert!(reason.contains("Failed to spawn runtime"), "{}", reason);
                Some(model.as_str())
            }
            _ => None,
        })
        .collect();
    assert_eq!(failed, vec!["a", "b"]);
    match events.last() {
        Some(ProgressEvent::BatchComplete { summary }) => assert_eq!(summary.failed, vec!["a", "b"]),
        other => panic!("expected BatchComplete, got {:?}", other),
    }
}

#[tokio::test]
async fn test_cancel_kills_the_pull_child() {
    let fake = FakeRuntime::new(PULL_SCRIPT);
    let config = fake.config().build();
    let (catalog, _server) = catalog_with_tags(&config, r#"{"models":[]}"#).await;

    let mut stream = InstallPipeline::new(Arc::new(catalog))
        .install_sequential(&["slow", "good"])
        .await;
    assert_eq!(
        stream.recv().await,
        Some(ProgressEvent::InstallStarted { model: "slow".into() })
    );

    let pid_file = fake.dir.path().join("pull.pid");
    let mut pid = String::new();
    for _ in 0..200 {
        pid = std::fs::read_to_string(&pid_file).unwrap_or_default().trim().to_string();
        if !pid.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!pid.is_empty(), "pull never started");

    let cancelled_at = Instant::now();
    stream.cancel();
    let rest: Vec<ProgressEvent> = stream.collect().await;

    assert!(cancelled_at.elapsed() < Duration::from_secs(3), "took {:?}", cancelled_at.elapsed());
    assert_eq!(rest, vec![ProgressEvent::Cancelled]);
    assert_eq!(fake.spawn_count(), 1);

    let alive = std::process::Command::new("kill")
        .args(["-0", &pid])
        .status()
        .unwrap()
        .success();
    assert!(!alive, "pull child {} still running", pid);
}
