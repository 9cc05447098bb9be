//! Integration tests for batch dispatch and failure classification.
//!
//! The engine process is a shell script; the HTTP hop is replaced by a
//! scripted transport.

#![cfg(unix)]

mod common;

use std::time::Duration;

use common::{serial, FakeEngine, FakeTransport, Reply, FATAL_LINE, PANIC_LINE, READY_LINE};
use engine_host::engine::{
    codes, DomainError, EngineError, EnginePhase, EngineSupervisor, FixedPathResolver,
    RequestDispatcher, TransportError,
};
use serde_json::{json, Value};

fn dispatcher(engine: &FakeEngine, transport: FakeTransport) -> RequestDispatcher {
    RequestDispatcher::new(engine.supervisor_with(engine.config(), transport))
}

#[tokio::test]
async fn test_batch_results_follow_input_order() {
    let _serial = serial().await;
    let engine = FakeEngine::ready();
    let transport = FakeTransport::body(
        r#"[
            {"data":{"findUniqueUser":{"id":1}}},
            {"errors":[{"error_code":"P2002","message":"Unique constraint failed on the fields: (`email`)","meta":{"target":["email"]}}]},
            {"data":{"count":3}}
        ]"#,
    );
    let dispatcher = dispatcher(&engine, transport.clone());

    let results = dispatcher.send(["query one", "query two", "query three"]).await.unwrap();

    assert_eq!(results.len(), 3);
    assert_eq!(results[0].as_ref().unwrap(), &json!({ "findUniqueUser": { "id": 1 } }));
    match &results[1] {
        Err(DomainError::Known(e)) => {
            assert_eq!(e.code, "P2002");
            assert_eq!(e.meta, Some(json!({ "target": ["email"] })));
        }
        other => panic!("expected known error, got {other:?}"),
    }
    assert_eq!(results[2].as_ref().unwrap(), &json!({ "count": 3 }));

    let bodies = transport.bodies();
    assert_eq!(bodies.len(), 1);
    let sent: Value = serde_json::from_str(&bodies[0]).unwrap();
    assert_eq!(
        sent,
        json!({ "batch": [
            { "query": "query one", "variables": {} },
            { "query": "query two", "variables": {} },
            { "query": "query three", "variables": {} }
        ]})
    );

    dispatcher.supervisor().stop().await;
}

#[tokio::test]
async fn test_empty_batch_does_not_start_engine() {
    let _serial = serial().await;
    let engine = FakeEngine::ready();
    let dispatcher = dispatcher(&engine, FakeTransport::body("[]"));

    let results = dispatcher.send(Vec::<String>::new()).await.unwrap();
    assert!(results.is_empty());
    assert_eq!(engine.spawn_count(), 0);
    assert_eq!(dispatcher.supervisor().phase(), EnginePhase::NotStarted);
}

#[tokio::test]
async fn test_initialization_failure_surfaces() {
    let _serial = serial().await;
    let engine = FakeEngine::ready();
    let supervisor = EngineSupervisor::builder(engine.config())
        .resolver(FixedPathResolver::new("/nonexistent/query-engine"))
        .transport(FakeTransport::body("[]"))
        .build()
        .unwrap();
    let dispatcher = RequestDispatcher::new(supervisor);

    let err = dispatcher.send(["query"]).await.unwrap_err();
    assert!(matches!(err, EngineError::Initialization(_)));
    assert_eq!(err.error_code(), Some(codes::BINARY_NOT_FOUND));
}

#[tokio::test]
async fn test_panic_during_request_is_rust_panic() {
    let _serial = serial().await;
    let engine = FakeEngine::new(&format!(
        "echo '{READY_LINE}'\nsleep 0.5\necho '{PANIC_LINE}'\nexec sleep 30"
    ));
    let dispatcher = dispatcher(&engine, FakeTransport::hang());

    let err = tokio::time::timeout(Duration::from_secs(10), dispatcher.send(["query"]))
        .await
        .unwrap()
        .unwrap_err();

    match &err {
        EngineError::RustPanic(panic) => {
            assert_eq!(panic.message, "index out of bounds in src/exec.rs:42:9")
        }
        other => panic!("expected RustPanic, got {other:?}"),
    }
    assert!(err.requires_restart());

    let supervisor = dispatcher.supervisor();
    supervisor.incarnation().unwrap().wait_terminated().await;
    assert_eq!(supervisor.phase(), EnginePhase::Crashed);
}

#[tokio::test]
async fn test_send_after_stop_starts_new_incarnation() {
    let _serial = serial().await;
    let engine = FakeEngine::ready();
    let dispatcher = dispatcher(&engine, FakeTransport::body(r#"[{"data":{}}]"#));
    let supervisor = dispatcher.supervisor().clone();

    supervisor.ensure_started().await.unwrap();
    let first_pid = supervisor.pid().unwrap();
    supervisor.stop().await;

    let results = dispatcher.send(["query"]).await.unwrap();
    assert_eq!(results.len(), 1);

    let second = supervisor.incarnation().unwrap();
    assert_eq!(second.generation(), 2);
    assert_ne!(second.pid().unwrap(), first_pid);
    assert_eq!(engine.spawn_count(), 2);

    supervisor.stop().await;
}

#[tokio::test]
async fn test_cancel_in_flight_request() {
    let _serial = serial().await;
    let engine = FakeEngine::ready();
    let dispatcher = dispatcher(&engine, FakeTransport::hang());
    dispatcher.supervisor().ensure_started().await.unwrap();

    let ticket = dispatcher.submit(["slow query"]);
    let handle = ticket.handle();
    let request = tokio::spawn(ticket.outcome());

    let incarnation = dispatcher.supervisor().incarnation().unwrap();
    while incarnation.in_flight() == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle.cancel();

    let err = request.await.unwrap().unwrap_err();
    assert!(matches!(err, EngineError::Canceled(id) if id == handle.id()));
    assert_eq!(incarnation.in_flight(), 0);
    assert_eq!(dispatcher.supervisor().phase(), EnginePhase::Ready);

    dispatcher.supervisor().stop().await;
}

#[tokio::test]
async fn test_cancel_before_start() {
    let _serial = serial().await;
    let engine = FakeEngine::ready();
    let dispatcher = dispatcher(&engine, FakeTransport::hang());

    let ticket = dispatcher.submit(["query"]);
    ticket.handle().cancel();
    let id = ticket.id();

    let err = ticket.outcome().await.unwrap_err();
    assert!(matches!(err, EngineError::Canceled(got) if got == id));
    assert_eq!(engine.spawn_count(), 0);
}

#[tokio::test]
async fn test_cancel_reaches_only_its_own_request() {
    let _serial = serial().await;
    let engine = FakeEngine::ready();
    let dispatcher = dispatcher(&engine, FakeTransport::hang());
    dispatcher.supervisor().ensure_started().await.unwrap();

    let first = dispatcher.submit(["first"]);
    let second = dispatcher.submit(["second"]);
    let first_handle = first.handle();
    let second_handle = second.handle();

    let first = tokio::spawn(first.outcome());
    let second = tokio::spawn(second.outcome());

    let incarnation = dispatcher.supervisor().incarnation().unwrap();
    while incarnation.in_flight() < 2 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    first_handle.cancel();

    assert!(matches!(first.await.unwrap(), Err(EngineError::Canceled(_))));
    assert!(!second_handle.is_canceled());
    assert_eq!(incarnation.in_flight(), 1);

    second_handle.cancel();
    assert!(matches!(second.await.unwrap(), Err(EngineError::Canceled(_))));

    dispatcher.supervisor().stop().await;
}

#[tokio::test]
async fn test_connection_reset_uses_diagnostics() {
    let _serial = serial().await;
    let engine = FakeEngine::new(&format!(
        "echo 'connection pool exhausted' >&2\necho '{READY_LINE}'\nexec sleep 30"
    ));
    let transport =
        FakeTransport::new(|| Reply::Fail(TransportError::ConnectionReset("eof".to_string())));
    let dispatcher = dispatcher(&engine, transport);

    let err = dispatcher.send(["query"]).await.unwrap_err();
    match err {
        EngineError::UnknownRequest(e) => assert!(e.message.contains("connection pool exhausted")),
        other => panic!("expected UnknownRequest, got {other:?}"),
    }

    dispatcher.supervisor().stop().await;
}

#[tokio::test]
async fn test_connection_reset_after_fatal_record_uses_its_message() {
    let _serial = serial().await;
    let engine = FakeEngine::new(&format!(
        "echo '{READY_LINE}'\ncat <<'EOF'\n{FATAL_LINE}\nEOF\nexec sleep 30"
    ));
    let transport =
        FakeTransport::new(|| Reply::Fail(TransportError::ConnectionReset("eof".to_string())));
    let dispatcher = dispatcher(&engine, transport);
    let supervisor = dispatcher.supervisor();

    supervisor.ensure_started().await.unwrap();
    while supervisor.last_failure().is_none() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let err = dispatcher.send(["query"]).await.unwrap_err();
    match &err {
        EngineError::UnknownRequest(e) => {
            assert_eq!(e.message, "Can't reach database server at localhost:5432")
        }
        other => panic!("expected UnknownRequest, got {other:?}"),
    }
    assert!(!err.is_panic());
    // A fatal record after startup does not take the engine down.
    assert_eq!(supervisor.phase(), EnginePhase::Ready);

    supervisor.stop().await;
}

#[tokio::test]
async fn test_connection_refused_without_diagnostics_propagates() {
    let _serial = serial().await;
    let engine = FakeEngine::ready();
    let transport =
        FakeTransport::new(|| Reply::Fail(TransportError::ConnectionRefused("refused".to_string())));
    let dispatcher = dispatcher(&engine, transport);

    let err = dispatcher.send(["query"]).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Transport(TransportError::ConnectionRefused(_))
    ));

    dispatcher.supervisor().stop().await;
}

#[tokio::test]
async fn test_http_error_status_is_unknown() {
    let _serial = serial().await;
    let engine = FakeEngine::ready();
    let transport = FakeTransport::new(|| {
        Reply::Fail(TransportError::Status {
            status: 500,
            body: "internal error".to_string(),
        })
    });
    let dispatcher = dispatcher(&engine, transport);

    let err = dispatcher.send(["query"]).await.unwrap_err();
    assert_eq!(err.to_string(), "engine responded with HTTP 500: internal error");
    assert!(matches!(err, EngineError::UnknownRequest(_)));

    dispatcher.supervisor().stop().await;
}

#[tokio::test]
async fn test_stop_waits_for_in_flight_request() {
    let _serial = serial().await;
    let engine = FakeEngine::ready();
    let dispatcher = dispatcher(&engine, FakeTransport::hang());
    dispatcher.supervisor().ensure_started().await.unwrap();

    let request = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.send(["slow"]).await })
    };
    let incarnation = dispatcher.supervisor().incarnation().unwrap();
    while incarnation.in_flight() == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // The request never completes, so stop waits out the one-second grace.
    let started = tokio::time::Instant::now();
    dispatcher.supervisor().stop().await;
    assert!(started.elapsed() >= Duration::from_millis(900));

    let err = request.await.unwrap().unwrap_err();
    assert!(matches!(err, EngineError::Canceled(_)));
    assert_eq!(dispatcher.supervisor().phase(), EnginePhase::Stopped);
}
