use std::sync::{Arc, Mutex};

use agent_bridge_api_client::AgentApiClient;
use agent_bridge_error::{BridgeError, ErrorKind};
use agent_bridge_event_schema::PermissionReply;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::{json, Value};

#[derive(Debug, Clone)]
struct Recorded {
    path: String,
    directory: Option<String>,
    body: Value,
}

#[derive(Clone, Default)]
struct MockServer {
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl MockServer {
    fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().expect("lock requests").clone()
    }
}

async fn record(State(mock): State<MockServer>, headers: HeaderMap, uri: Uri, body: Bytes) -> Response {
    let path = uri.path().to_string();
    mock.requests.lock().expect("lock requests").push(Recorded {
        path: path.clone(),
        directory: headers
            .get("x-opencode-directory")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
        body: serde_json::from_slice(&body).unwrap_or(Value::Null),
    });

    match path.as_str() {
        "/session" => Json(json!({"id": "ses_1", "title": "New session"})).into_response(),
        "/session/broken/message" => (StatusCode::BAD_REQUEST, "unknown session").into_response(),
        _ => Json(json!(true)).into_response(),
    }
}

async fn spawn_mock(mock: MockServer) -> String {
    let app = Router::new().fallback(record).with_state(mock);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server");
    let addr = listener.local_addr().expect("mock addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve mock");
    });
    format!("http://{addr}")
}

async fn client_for(mock: &MockServer) -> AgentApiClient {
    let mut client = AgentApiClient::new(spawn_mock(mock.clone()).await);
    client.update_directory("/proj");
    client
}

#[tokio::test]
async fn create_session_returns_server_id() {
    let mock = MockServer::default();
    let client = client_for(&mock).await;

    let session_id = client.create_session().await.expect("create session");
    assert_eq!(session_id, "ses_1");

    let requests = mock.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].path, "/session");
    assert_eq!(requests[0].directory.as_deref(), Some("/proj"));
}

#[tokio::test]
async fn create_session_without_server_is_http_failure() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let client = AgentApiClient::new(format!("http://{addr}"));
    let err = client.create_session().await.expect_err("no server");
    assert!(matches!(err, BridgeError::Http { .. }));
    assert_eq!(err.kind(), ErrorKind::ApiFailure);
}

#[tokio::test]
async fn prompt_body_carries_text_model_and_agent() {
    let mock = MockServer::default();
    let client = client_for(&mock).await;

    client
        .send_prompt_async("ses_1", "fix bug", Some("anthropic/claude-sonnet-4"), Some("build"))
        .await
        .expect("send prompt");
    client
        .send_prompt_async("ses_1", "again", Some("no-slash"), None)
        .await
        .expect("send prompt without model");

    let requests = mock.requests();
    assert_eq!(requests[0].path, "/session/ses_1/message");
    assert_eq!(
        requests[0].body,
        json!({
            "model": {"providerID": "anthropic", "modelID": "claude-sonnet-4"},
            "agent": "build",
            "parts": [{"type": "text", "text": "fix bug"}],
        })
    );
    assert_eq!(
        requests[1].body,
        json!({"parts": [{"type": "text", "text": "again"}]})
    );
}

#[tokio::test]
async fn rejected_prompt_is_invalid_response() {
    let mock = MockServer::default();
    let client = client_for(&mock).await;

    let err = client
        .send_prompt_async("broken", "hello", None, None)
        .await
        .expect_err("prompt should be rejected");
    match err {
        BridgeError::InvalidResponse {
            operation, status, ..
        } => {
            assert_eq!(operation, "session.prompt");
            assert_eq!(status, Some(400));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn abort_and_replies_hit_their_routes() {
    let mock = MockServer::default();
    let client = client_for(&mock).await;

    client.abort_session("ses_1").await.expect("abort");
    client
        .reply_to_question("que_1", &[vec!["main".to_string()]])
        .await
        .expect("reply question");
    client.reject_question("que_2").await.expect("reject question");
    client
        .reply_to_permission("per_1", &PermissionReply::AllowOnce)
        .await
        .expect("allow once");
    client
        .reply_to_permission("per_2", &PermissionReply::AlwaysAllow)
        .await
        .expect("always allow");
    client
        .reply_to_permission(
            "per_3",
            &PermissionReply::Reject {
                reason: Some("use a branch".to_string()),
            },
        )
        .await
        .expect("reject");

    let requests = mock.requests();
    let paths: Vec<&str> = requests.iter().map(|r| r.path.as_str()).collect();
    assert_eq!(
        paths,
        vec![
            "/session/ses_1/abort",
            "/question/que_1/reply",
            "/question/que_2/reject",
            "/permission/per_1/reply",
            "/permission/per_2/reply",
            "/permission/per_3/reply",
        ]
    );
    assert_eq!(requests[1].body, json!({"answers": [["main"]]}));
    assert_eq!(requests[3].body, json!({"reply": "once"}));
    assert_eq!(requests[4].body, json!({"reply": "always"}));
    assert_eq!(
        requests[5].body,
        json!({"reply": "reject", "message": "use a branch"})
    );
    assert!(requests
        .iter()
        .all(|r| r.directory.as_deref() == Some("/proj")));
}

#[tokio::test]
async fn directory_change_applies_to_next_request() {
    let mock = MockServer::default();
    let mut client = client_for(&mock).await;

    client.abort_session("ses_1").await.expect("abort");
    client.update_directory("/elsewhere");
    client.abort_session("ses_1").await.expect("abort");

    let directories: Vec<Option<String>> =
        mock.requests().into_iter().map(|r| r.directory).collect();
    assert_eq!(
        directories,
        vec![Some("/proj".to_string()), Some("/elsewhere".to_string())]
    );
}

#[tokio::test]
async fn non_ascii_directory_is_percent_encoded() {
    let mock = MockServer::default();
    let mut client = client_for(&mock).await;

    client.update_directory("/home/jos\u{e9}/proj");
    client.create_session().await.expect("create session");

    let requests = mock.requests();
    assert_eq!(
        requests[0].directory.as_deref(),
        Some("%2Fhome%2Fjos%C3%A9%2Fproj")
    );
}
