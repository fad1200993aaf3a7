use super::*;
use std::sync::Mutex;

use crate::tests::{next_stream_event, operation_frame, spawn_fake_api, FakeApiOptions};
use shared::domain::OperationId;

fn metadata(status: OperationStatus, err: &str) -> OperationMetadata {
    let mut metadata = OperationMetadata::new("op-1", status);
    metadata.err = err.to_string();
    metadata
}

fn offline_listener(queue: EventQueue) -> Arc<EventStreamListener> {
    EventStreamListener::new("http://127.0.0.1:9", queue, ListenerSettings::default())
        .expect("listener")
}

#[test]
fn terminal_statuses_map_to_outcomes() {
    assert_eq!(
        completion_outcome(&metadata(OperationStatus::Success, "")),
        Some(OperationOutcome::Success)
    );
    assert_eq!(
        completion_outcome(&metadata(OperationStatus::Failure, "disk full")),
        Some(OperationOutcome::Failure("disk full".to_string()))
    );
    assert_eq!(
        completion_outcome(&metadata(OperationStatus::Cancelled, "")),
        Some(OperationOutcome::Failure("Cancelled".to_string()))
    );
    assert_eq!(
        completion_outcome(&metadata(OperationStatus::Cancelled, "Cancelled by user")),
        Some(OperationOutcome::Failure("Cancelled by user".to_string()))
    );
    for status in [
        OperationStatus::Pending,
        OperationStatus::Running,
        OperationStatus::Cancelling,
        OperationStatus::Unknown,
    ] {
        assert_eq!(completion_outcome(&metadata(status, "")), None);
    }
}

#[test]
fn events_url_switches_to_websocket_scheme() {
    let url = events_url("http://10.0.0.5:8443", &EventScope::DefaultProject).expect("url");
    assert_eq!(url.as_str(), "ws://10.0.0.5:8443/1.0/events?type=operation");

    let url = events_url(
        "https://lxd.example.com/",
        &EventScope::Project("dev".to_string()),
    )
    .expect("url");
    assert_eq!(
        url.as_str(),
        "wss://lxd.example.com/1.0/events?type=operation&project=dev"
    );
}

#[test]
fn events_url_keeps_path_prefix_and_scopes_all_projects() {
    let url = events_url("https://proxy.example.com/lxd/", &EventScope::AllProjects).expect("url");
    assert_eq!(
        url.as_str(),
        "wss://proxy.example.com/lxd/1.0/events?type=operation&all-projects=true"
    );
}

#[test]
fn events_url_rejects_unsupported_schemes() {
    let err = events_url("ftp://example.com", &EventScope::DefaultProject).expect_err("ftp");
    assert!(matches!(err, ListenerError::InvalidUrl { .. }));
    let err = events_url("not a url", &EventScope::DefaultProject).expect_err("garbage");
    assert!(matches!(err, ListenerError::InvalidUrl { .. }));
}

#[tokio::test]
async fn handle_frame_resolves_terminal_operation_and_republishes() {
    let queue = EventQueue::default();
    let listener = offline_listener(queue.clone());
    let mut events = listener.subscribe();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let (success, finish) = (Arc::clone(&calls), Arc::clone(&calls));
    queue.register(
        "op-7",
        move || success.lock().expect("calls").push("success"),
        |_| panic!("must not fail"),
        move || finish.lock().expect("calls").push("finish"),
    );

    listener.handle_frame(&operation_frame("op-7", OperationStatus::Running, ""));
    assert!(queue.is_pending(&OperationId::new("op-7")));
    assert!(calls.lock().expect("calls").is_empty());

    listener.handle_frame(&operation_frame("op-7", OperationStatus::Success, ""));
    assert_eq!(*calls.lock().expect("calls"), ["success", "finish"]);

    for expected in [OperationStatus::Running, OperationStatus::Success] {
        match events.try_recv().expect("republished event") {
            StreamEvent::Operation(event) => {
                assert_eq!(event.metadata.id, OperationId::new("op-7"));
                assert_eq!(event.metadata.status, expected);
            }
            other => panic!("unexpected stream event: {other:?}"),
        }
    }
}

#[test]
fn handle_frame_ignores_other_event_types_and_garbage() {
    let queue = EventQueue::default();
    let listener = offline_listener(queue.clone());
    let mut events = listener.subscribe();

    listener.handle_frame(r#"{"type":"logging","metadata":{"message":"hello","level":"info"}}"#);
    listener.handle_frame(r#"{"type":"lifecycle","metadata":{"action":"instance-started"}}"#);
    listener.handle_frame("not json");

    assert!(events.try_recv().is_err());
    assert_eq!(queue.buffered_count(), 0);
}

#[tokio::test]
async fn listener_reconnects_and_keeps_resolving() {
    let api = spawn_fake_api(FakeApiOptions {
        drop_first_connection: true,
        ..FakeApiOptions::default()
    })
    .await
    .expect("spawn api");
    let queue = EventQueue::default();
    let listener = EventStreamListener::new(
        &api.url,
        queue.clone(),
        ListenerSettings {
            scope: EventScope::AllProjects,
            reconnect_delay: Duration::from_millis(20),
        },
    )
    .expect("listener");
    let mut events = listener.subscribe();
    let task = listener.spawn();

    assert!(matches!(
        next_stream_event(&mut events).await,
        StreamEvent::Connected
    ));
    assert!(matches!(
        next_stream_event(&mut events).await,
        StreamEvent::Disconnected { .. }
    ));
    assert!(matches!(
        next_stream_event(&mut events).await,
        StreamEvent::Connected
    ));
    api.state.wait_for_subscriber().await;
    assert_eq!(api.state.connections(), 2);

    let waiter = queue.wait_for("op-after-reconnect");
    api.state.push_frame(operation_frame(
        "op-after-reconnect",
        OperationStatus::Failure,
        "Failed to create instance",
    ));
    let outcome = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("timely completion")
        .expect("outcome");
    assert_eq!(
        outcome,
        OperationOutcome::Failure("Failed to create instance".to_string())
    );

    task.abort();
}
