use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_bridge_error::ErrorKind;
use agent_bridge_event_schema::DomainEvent;
use agent_bridge_event_stream::{EventStream, EventStreamReader, ReconnectPolicy};
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::{stream, StreamExt};
use serde_json::json;

/// What the mock server does for one `/event` connection.
#[derive(Clone)]
enum Connection {
    /// Sends the frames as a single chunk, then keeps the response open.
    Hold(String),
    /// Sends the frames, then closes the response.
    Close(String),
    Status(StatusCode),
}

#[derive(Clone, Default)]
struct MockServer {
    script: Arc<Mutex<VecDeque<Connection>>>,
    directories: Arc<Mutex<Vec<Option<String>>>>,
    accepts: Arc<Mutex<Vec<Option<String>>>>,
    arrivals: Arc<Mutex<Vec<tokio::time::Instant>>>,
}

impl MockServer {
    fn new(script: Vec<Connection>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            ..Self::default()
        }
    }

    fn directories(&self) -> Vec<Option<String>> {
        self.directories.lock().expect("lock directories").clone()
    }

    fn push_script(&self, script: Vec<Connection>) {
        self.script.lock().expect("lock script").extend(script);
    }

    /// Time between consecutive `/event` requests.
    fn gaps(&self) -> Vec<Duration> {
        let arrivals = self.arrivals.lock().expect("lock arrivals");
        arrivals.windows(2).map(|pair| pair[1] - pair[0]).collect()
    }
}

async fn events(State(mock): State<MockServer>, headers: HeaderMap) -> Response {
    mock.arrivals
        .lock()
        .expect("lock arrivals")
        .push(tokio::time::Instant::now());
    let header_text = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    mock.directories
        .lock()
        .expect("lock directories")
        .push(header_text("x-opencode-directory"));
    mock.accepts
        .lock()
        .expect("lock accepts")
        .push(header_text("accept"));

    let next = mock.script.lock().expect("lock script").pop_front();
    let (frames, hold) = match next {
        Some(Connection::Hold(frames)) => (frames, true),
        Some(Connection::Close(frames)) => (frames, false),
        Some(Connection::Status(status)) => return status.into_response(),
        None => return StatusCode::SERVICE_UNAVAILABLE.into_response(),
    };

    let first = stream::iter(vec![Ok::<_, Infallible>(Bytes::from(frames))]);
    let body = if hold {
        Body::from_stream(first.chain(stream::pending()))
    } else {
        Body::from_stream(first)
    };
    ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
}

async fn spawn_mock(mock: MockServer) -> String {
    let app = Router::new().route("/event", get(events)).with_state(mock);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server");
    let addr = listener.local_addr().expect("mock addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve mock");
    });
    format!("http://{addr}")
}

fn frame(value: serde_json::Value) -> String {
    format!("data: {value}\n\n")
}

fn delta(text: &str) -> String {
    frame(json!({
        "type": "message.part.updated",
        "properties": {
            "part": {"id": "p1", "sessionID": "s1", "type": "text"},
            "delta": text,
        }
    }))
}

fn tool_running() -> String {
    frame(json!({
        "type": "message.part.updated",
        "properties": {
            "part": {
                "id": "p2", "sessionID": "s1", "type": "tool",
                "callID": "call_1", "tool": "bash",
                "state": {"status": "running", "input": {"command": "ls"}},
            }
        }
    }))
}

fn idle(session: &str) -> String {
    frame(json!({"type": "session.idle", "properties": {"sessionID": session}}))
}

fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        initial_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(200),
        max_consecutive_failures: 3,
    }
}

async fn next_event(stream: &mut EventStream) -> DomainEvent {
    tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("event in time")
        .expect("stream open")
}

#[tokio::test]
async fn sends_directory_header_and_decodes_events() {
    let mock = MockServer::new(vec![Connection::Hold(format!(
        "{}{}",
        frame(json!({"type": "server.connected", "properties": {}})),
        idle("s1")
    ))]);
    let base_url = spawn_mock(mock.clone()).await;

    let mut reader = EventStreamReader::new(fast_policy(), Duration::from_millis(33));
    let mut stream = reader.connect(&base_url, "/proj");

    assert_eq!(next_event(&mut stream).await, DomainEvent::Connected);
    assert_eq!(
        next_event(&mut stream).await,
        DomainEvent::SessionIdle {
            session_id: "s1".to_string()
        }
    );
    assert!(reader.is_connected());
    assert!(reader.has_active_stream());
    assert_eq!(reader.directory(), Some("/proj"));
    assert_eq!(mock.directories(), vec![Some("/proj".to_string())]);
    assert_eq!(
        mock.accepts.lock().expect("lock accepts").clone(),
        vec![Some("text/event-stream".to_string())]
    );
}

#[tokio::test]
async fn non_ascii_directory_matches_api_encoding() {
    let mock = MockServer::new(vec![Connection::Hold(idle("s1"))]);
    let base_url = spawn_mock(mock.clone()).await;

    let mut reader = EventStreamReader::new(fast_policy(), Duration::from_millis(33));
    let mut stream = reader.connect(&base_url, "/home/jos\u{e9}/proj");
    next_event(&mut stream).await;

    assert_eq!(
        mock.directories(),
        vec![Some("%2Fhome%2Fjos%C3%A9%2Fproj".to_string())]
    );
    assert_eq!(reader.directory(), Some("/home/jos\u{e9}/proj"));
}

#[tokio::test]
async fn buffered_deltas_arrive_before_tool_event() {
    let mock = MockServer::new(vec![Connection::Hold(format!(
        "{}{}{}{}",
        delta("Lo"),
        delta("ok"),
        delta("ing"),
        tool_running()
    ))]);
    let base_url = spawn_mock(mock).await;

    let mut reader = EventStreamReader::new(fast_policy(), Duration::from_millis(33));
    let mut stream = reader.connect(&base_url, "/proj");

    let mut text = String::new();
    loop {
        match next_event(&mut stream).await {
            DomainEvent::TextDelta { text: piece, .. } => text.push_str(&piece),
            DomainEvent::ToolRunning { call, .. } => {
                assert_eq!(call.input_summary, "ls");
                break;
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert_eq!(text, "Looking");
}

#[tokio::test]
async fn malformed_frame_does_not_drop_connection() {
    let mock = MockServer::new(vec![Connection::Hold(format!(
        "data: {{\"type\":\n\ndata: not json at all\n\n{}",
        idle("s1")
    ))]);
    let base_url = spawn_mock(mock.clone()).await;

    let mut reader = EventStreamReader::new(fast_policy(), Duration::from_millis(33));
    let mut stream = reader.connect(&base_url, "/proj");

    assert_eq!(
        next_event(&mut stream).await,
        DomainEvent::SessionIdle {
            session_id: "s1".to_string()
        }
    );
    assert!(reader.is_connected());
    assert_eq!(mock.directories().len(), 1);
}

#[tokio::test]
async fn reconnects_with_last_directory_after_drop() {
    let mock = MockServer::new(vec![
        Connection::Close(idle("s1")),
        Connection::Status(StatusCode::BAD_GATEWAY),
        Connection::Hold(idle("s2")),
    ]);
    let base_url = spawn_mock(mock.clone()).await;

    let mut reader = EventStreamReader::new(fast_policy(), Duration::from_millis(33));
    let mut stream = reader.connect(&base_url, "/proj");

    assert_eq!(
        next_event(&mut stream).await,
        DomainEvent::SessionIdle {
            session_id: "s1".to_string()
        }
    );
    assert_eq!(
        next_event(&mut stream).await,
        DomainEvent::SessionIdle {
            session_id: "s2".to_string()
        }
    );
    assert!(reader.is_connected());
    assert_eq!(mock.directories(), vec![Some("/proj".to_string()); 3]);
}

fn assert_gap(gap: Duration, expected_secs: u64) {
    let expected = Duration::from_secs(expected_secs);
    assert!(
        gap >= expected && gap < expected + Duration::from_millis(500),
        "expected a reconnect after about {expected:?}, got {gap:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn reconnect_delay_doubles_and_fresh_connect_starts_over() {
    let mock = MockServer::new(vec![
        Connection::Close(idle("s1")),
        Connection::Status(StatusCode::BAD_GATEWAY),
        Connection::Hold(idle("s2")),
    ]);
    let base_url = spawn_mock(mock.clone()).await;

    let mut reader = EventStreamReader::new(ReconnectPolicy::default(), Duration::from_millis(33));
    let mut stream = reader.connect(&base_url, "/proj");

    for expected in ["s1", "s2"] {
        assert_eq!(
            stream.next().await,
            Some(DomainEvent::SessionIdle {
                session_id: expected.to_string()
            })
        );
    }
    let gaps = mock.gaps();
    assert_eq!(gaps.len(), 2);
    assert_gap(gaps[0], 1);
    assert_gap(gaps[1], 2);

    reader.disconnect();
    mock.push_script(vec![
        Connection::Close(idle("s3")),
        Connection::Hold(idle("s4")),
    ]);
    let mut stream = reader.connect(&base_url, "/proj");
    for expected in ["s3", "s4"] {
        assert_eq!(
            stream.next().await,
            Some(DomainEvent::SessionIdle {
                session_id: expected.to_string()
            })
        );
    }
    let gaps = mock.gaps();
    assert_eq!(gaps.len(), 4);
    assert_gap(gaps[3], 1);
    assert_eq!(mock.directories(), vec![Some("/proj".to_string()); 5]);
}

#[tokio::test]
async fn gives_up_after_consecutive_failures() {
    let mock = MockServer::new(vec![
        Connection::Status(StatusCode::INTERNAL_SERVER_ERROR),
        Connection::Status(StatusCode::INTERNAL_SERVER_ERROR),
        Connection::Status(StatusCode::INTERNAL_SERVER_ERROR),
    ]);
    let base_url = spawn_mock(mock.clone()).await;

    let mut reader = EventStreamReader::new(fast_policy(), Duration::from_millis(33));
    let mut stream = reader.connect(&base_url, "/proj");

    match next_event(&mut stream).await {
        DomainEvent::Error { kind, .. } => assert_eq!(kind, ErrorKind::StreamFailure),
        other => panic!("unexpected event: {other:?}"),
    }
    let end = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("stream end in time");
    assert!(end.is_none());
    for _ in 0..50 {
        if !reader.has_active_stream() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!reader.has_active_stream());
    assert!(!reader.is_connected());
    assert_eq!(mock.directories().len(), 3);
}

#[tokio::test]
async fn disconnect_is_idempotent_and_ends_stream() {
    let mock = MockServer::new(vec![Connection::Hold(idle("s1"))]);
    let base_url = spawn_mock(mock).await;

    let mut reader = EventStreamReader::new(fast_policy(), Duration::from_millis(33));
    let mut stream = reader.connect(&base_url, "/proj");
    next_event(&mut stream).await;

    reader.disconnect();
    reader.disconnect();
    assert!(!reader.has_active_stream());
    assert!(!reader.is_connected());

    let end = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("stream end in time");
    assert!(end.is_none());
}

#[tokio::test]
async fn fresh_connect_replaces_previous_stream() {
    let mock = MockServer::new(vec![
        Connection::Hold(idle("s1")),
        Connection::Hold(idle("s2")),
    ]);
    let base_url = spawn_mock(mock.clone()).await;

    let mut reader = EventStreamReader::new(fast_policy(), Duration::from_millis(33));
    let mut first = reader.connect(&base_url, "/a");
    next_event(&mut first).await;

    let mut second = reader.connect(&base_url, "/b");
    assert_eq!(
        next_event(&mut second).await,
        DomainEvent::SessionIdle {
            session_id: "s2".to_string()
        }
    );
    let end = tokio::time::timeout(Duration::from_secs(2), first.next())
        .await
        .expect("first stream end in time");
    assert!(end.is_none());
    assert_eq!(
        mock.directories(),
        vec![Some("/a".to_string()), Some("/b".to_string())]
    );
    assert_eq!(reader.directory(), Some("/b"));
}
