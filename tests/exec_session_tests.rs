//! Exec Session Integration Tests
//!
//! Streaming output through a session: protocol event demultiplexing, the
//! unified sprite log topic, buffer replay for late subscribers, and the
//! shutdown drain against live sessions.

use lattice::capabilities::secrets::StaticSecretStore;
use lattice::capabilities::worker_api::{make_api_sprite, ExecStreamItem, StubWorkerApi};
use lattice::capabilities::WORKER_API_TOKEN;
use lattice::events::{topics, BusMessage, EventBus};
use lattice::exec::{self, run_drain, DrainOutcome, ExecRegistry};
use std::sync::Arc;
use std::time::Duration;

fn make_deps(stub: &StubWorkerApi) -> (exec::ExecDeps, EventBus, ExecRegistry) {
    let bus = EventBus::new();
    let registry = ExecRegistry::new();
    let deps = exec::ExecDeps {
        worker_api: Arc::new(stub.clone()),
        bus: bus.clone(),
        registry: registry.clone(),
        secrets: Arc::new(StaticSecretStore::new().with(WORKER_API_TOKEN, "test-token")),
        idle_timeout: Some(Duration::from_millis(500)),
        max_buffer_lines: Some(100),
    };
    (deps, bus, registry)
}

/// A full exec run: stdout, a protocol event, stderr, exit — observed on the
/// session topic, the events topic, and the sprite log topic.
#[tokio::test]
async fn test_exec_stream_demultiplexed() {
    let stub = StubWorkerApi::new();
    stub.insert_sprite(make_api_sprite("s1", "running"));
    stub.set_exec_hold_open(true);
    let (deps, bus, registry) = make_deps(&stub);

    let mut logs_rx = bus.subscribe(&topics::sprite_logs("s1"));
    let (handle, join) = exec::session::start("s1", "cargo test", deps).await.unwrap();
    let mut events_rx = bus.subscribe(&topics::exec_events(handle.session_id()));
    let mut exec_rx = bus.subscribe(&topics::exec(handle.session_id()));
    assert_eq!(registry.len(), 1);

    // Feed the stream after subscribing so every chunk is observed live.
    stub.push_exec(ExecStreamItem::Stdout("building project".to_string())).await;
    stub.push_exec(ExecStreamItem::Stdout(
        r#"LATTICE_EVENT {"type":"checkpoint","data":{"message":"tests compiled"}}"#.to_string(),
    ))
    .await;
    stub.push_exec(ExecStreamItem::Stderr("warning: unused import".to_string())).await;
    stub.push_exec(ExecStreamItem::Exit(0)).await;

    // Raw envelopes on exec:<sid>, in order
    let mut streams = Vec::new();
    for _ in 0..4 {
        match tokio::time::timeout(Duration::from_secs(2), exec_rx.recv()).await.unwrap().unwrap() {
            BusMessage::ExecOutput(output) => {
                assert_eq!(output.sprite_id, "s1");
                streams.push(output.stream);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
    assert_eq!(
        streams,
        vec![
            exec::ExecStream::Stdout,
            exec::ExecStream::Stdout,
            exec::ExecStream::Stderr,
            exec::ExecStream::Exit,
        ]
    );

    // The checkpoint event was parsed onto the events topic
    match tokio::time::timeout(Duration::from_secs(2), events_rx.recv()).await.unwrap().unwrap() {
        BusMessage::ProtocolEvent(event) => assert_eq!(event.message(), "tests compiled"),
        other => panic!("unexpected message: {other:?}"),
    }

    // And the unified log stream carries everything
    let mut log_lines = Vec::new();
    for _ in 0..4 {
        match tokio::time::timeout(Duration::from_secs(2), logs_rx.recv()).await.unwrap().unwrap() {
            BusMessage::LogLine(line) => log_lines.push(line.line.clone()),
            other => panic!("unexpected message: {other:?}"),
        }
    }
    assert_eq!(log_lines[0], "building project");
    assert_eq!(log_lines[2], "warning: unused import");

    // Exit tore the session down
    join.await.unwrap();
    assert!(registry.is_empty());
}

/// Late subscribers replay history through `get_output`.
#[tokio::test]
async fn test_late_subscriber_fetches_buffer() {
    let stub = StubWorkerApi::new();
    stub.insert_sprite(make_api_sprite("s1", "running"));
    stub.set_exec_hold_open(true);
    stub.script_exec(vec![
        ExecStreamItem::Stdout("early line 1".to_string()),
        ExecStreamItem::Stdout("early line 2".to_string()),
    ]);
    let (deps, _bus, _registry) = make_deps(&stub);

    let (handle, _join) = exec::session::start("s1", "tail -f build.log", deps).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let output = handle.get_output().await;
    assert_eq!(output.len(), 2);
    assert_eq!(output[0].chunk, "early line 1");
    assert_eq!(output[1].chunk, "early line 2");

    handle.close().await;
}

/// The drain waits for live sessions and reports a clean drain when they
/// finish inside the window.
#[tokio::test]
async fn test_drain_waits_for_sessions() {
    let stub = StubWorkerApi::new();
    stub.insert_sprite(make_api_sprite("s1", "running"));
    stub.set_exec_hold_open(true);
    let (deps, _bus, registry) = make_deps(&stub);

    let (handle, join) = exec::session::start("s1", "sleep 60", deps).await.unwrap();
    assert_eq!(registry.len(), 1);

    // Close the session shortly after the drain starts polling.
    let closer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(40)).await;
        handle.close().await;
    });

    let outcome = exec::drain::run_drain_with_poll(
        &registry,
        Duration::from_secs(5),
        Duration::from_millis(20),
    )
    .await;
    assert_eq!(outcome, DrainOutcome::Drained);

    let _ = closer.await;
    let _ = join.await;
}

/// An empty registry means the drain is immediate; a stuck session is
/// force-closed at the window edge.
#[tokio::test]
async fn test_drain_immediate_and_forced() {
    let registry = ExecRegistry::new();
    assert_eq!(run_drain(&registry, Duration::from_secs(600)).await, DrainOutcome::Immediate);

    let stub = StubWorkerApi::new();
    stub.insert_sprite(make_api_sprite("s1", "running"));
    stub.set_exec_hold_open(true);
    let (deps, _bus, registry) = make_deps(&stub);
    let deps = exec::ExecDeps { registry: registry.clone(), ..deps };

    let (_handle, join) = exec::session::start("s1", "sleep 9999", deps).await.unwrap();
    let outcome = exec::drain::run_drain_with_poll(
        &registry,
        Duration::from_millis(60),
        Duration::from_millis(20),
    )
    .await;
    assert_eq!(outcome, DrainOutcome::ForcedExit);

    // The force-close asked the session to stop; it unregisters on exit.
    let _ = tokio::time::timeout(Duration::from_secs(2), join).await;
    assert!(registry.is_empty());
}
