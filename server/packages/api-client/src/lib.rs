//! REST side of the agent server protocol.
//!
//! Every request carries the current directory header so the server routes it
//! to the same workspace instance as the event stream.

use agent_bridge_error::BridgeError;
use agent_bridge_event_schema::{directory_header_value, PermissionReply, SessionId, DIRECTORY_HEADER};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct AgentApiClient {
    http: Client,
    base_url: String,
    directory: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelSpec {
    #[serde(rename = "providerID")]
    pub provider_id: String,
    #[serde(rename = "modelID")]
    pub model_id: String,
}

impl ModelSpec {
    /// Parses `provider/model`. Anything else is rejected.
    pub fn parse(model: &str) -> Option<Self> {
        let (provider_id, model_id) = model.split_once('/')?;
        let provider_id = provider_id.trim();
        let model_id = model_id.trim();
        if provider_id.is_empty() || model_id.is_empty() {
            return None;
        }
        Some(Self {
            provider_id: provider_id.to_string(),
            model_id: model_id.to_string(),
        })
    }
}

#[derive(Debug, Serialize)]
struct TextPartInput<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct PromptRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<ModelSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    agent: Option<&'a str>,
    parts: Vec<TextPartInput<'a>>,
}

impl AgentApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: normalize_base_url(base_url.into()),
            directory: None,
        }
    }

    pub fn update_base_url(&mut self, base_url: impl Into<String>) {
        self.base_url = normalize_base_url(base_url.into());
    }

    pub fn update_directory(&mut self, directory: impl Into<String>) {
        self.directory = Some(directory.into());
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn directory(&self) -> Option<&str> {
        self.directory.as_deref()
    }

    pub async fn create_session(&self) -> Result<SessionId, BridgeError> {
        let response = self.post("session.create", "/session", &json!({})).await?;
        let session = response
            .json::<SessionResponse>()
            .await
            .map_err(|err| BridgeError::invalid_response("session.create", None, err.to_string()))?;
        debug!(session_id = %session.id, "session created");
        Ok(session.id)
    }

    /// Returns once the server accepted the prompt. Output arrives on the event stream.
    pub async fn send_prompt_async(
        &self,
        session_id: &str,
        text: &str,
        model: Option<&str>,
        agent: Option<&str>,
    ) -> Result<(), BridgeError> {
        let model = model.and_then(|model| {
            let spec = ModelSpec::parse(model);
            if spec.is_none() {
                warn!(model, "ignoring model that is not in provider/model form");
            }
            spec
        });
        let body = PromptRequest {
            model,
            agent,
            parts: vec![TextPartInput { kind: "text", text }],
        };
        let body = serde_json::to_value(&body)
            .map_err(|err| BridgeError::http("session.prompt", err))?;
        self.post(
            "session.prompt",
            &format!("/session/{session_id}/message"),
            &body,
        )
        .await?;
        Ok(())
    }

    pub async fn abort_session(&self, session_id: &str) -> Result<(), BridgeError> {
        self.post(
            "session.abort",
            &format!("/session/{session_id}/abort"),
            &json!({}),
        )
        .await?;
        Ok(())
    }

    pub async fn reply_to_question(
        &self,
        request_id: &str,
        answers: &[Vec<String>],
    ) -> Result<(), BridgeError> {
        self.post(
            "question.reply",
            &format!("/question/{request_id}/reply"),
            &json!({ "answers": answers }),
        )
        .await?;
        Ok(())
    }

    pub async fn reject_question(&self, request_id: &str) -> Result<(), BridgeError> {
        self.post(
            "question.reject",
            &format!("/question/{request_id}/reject"),
            &json!({}),
        )
        .await?;
        Ok(())
    }

    pub async fn reply_to_permission(
        &self,
        request_id: &str,
        reply: &PermissionReply,
    ) -> Result<(), BridgeError> {
        let mut body = json!({ "reply": reply.wire_value() });
        if let Some(message) = reply.message() {
            body["message"] = Value::String(message.to_string());
        }
        self.post(
            "permission.reply",
            &format!("/permission/{request_id}/reply"),
            &body,
        )
        .await?;
        Ok(())
    }

    fn default_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(directory) = &self.directory {
            match HeaderValue::from_str(&directory_header_value(directory)) {
                Ok(value) => {
                    headers.insert(DIRECTORY_HEADER, value);
                }
                Err(_) => warn!(directory = %directory, "directory is not a valid header value"),
            }
        }
        headers
    }

    async fn post(&self, operation: &str, path: &str, body: &Value) -> Result<Response, BridgeError> {
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .headers(self.default_headers())
            .json(body)
            .send()
            .await
            .map_err(|err| {
                warn!(operation, error = %err, "agent server request failed");
                BridgeError::http(operation, err)
            })?;

        if !response.status().is_success() {
            return Err(build_response_error(response, operation).await);
        }
        Ok(response)
    }
}

async fn build_response_error(response: Response, operation: &str) -> BridgeError {
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<failed to read response body>".to_string());
    warn!(operation, status = status.as_u16(), body = %body, "agent server rejected request");
    BridgeError::invalid_response(operation, Some(status.as_u16()), format!("HTTP {status} {body}"))
}

fn normalize_base_url(base_url: String) -> String {
    base_url.trim_end_matches('/').to_string()
}
