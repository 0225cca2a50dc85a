use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use agent_bridge_error::ErrorKind;

pub mod background;
pub mod prompts;

pub use background::{BackgroundSession, BackgroundStatus};
pub use prompts::{
    NativePrompt, NativePromptKind, PermissionReply, PermissionRequest, QuestionItem,
    QuestionOption, QuestionRequest,
};

/// Header the agent server uses to pick the workspace instance for a request.
/// Stream and REST calls must carry the same value or events will not correlate.
pub const DIRECTORY_HEADER: &str = "x-opencode-directory";

/// Value sent in [`DIRECTORY_HEADER`]. Printable ASCII paths go out verbatim;
/// anything else is percent-encoded as a whole so it is still a valid header.
pub fn directory_header_value(directory: &str) -> String {
    let plain = directory
        .bytes()
        .all(|byte| (0x20..0x7f).contains(&byte) && byte != b'%');
    if plain {
        directory.to_string()
    } else {
        urlencoding::encode(directory).into_owned()
    }
}

/// Server-issued session identifier. Opaque to the bridge.
pub type SessionId = String;

/// Schema-light JSON object used for raw tool, question and permission input.
/// Only read at the protocol boundary; typed fields are extracted from it.
pub type RawInput = Map<String, Value>;

/// Everything the bridge delivers to its consumer. Content and failures travel
/// on the same channel: failures arrive as [`DomainEvent::Error`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DomainEvent {
    TextDelta {
        session_id: SessionId,
        text: String,
    },
    TextComplete {
        session_id: SessionId,
        text: String,
    },
    ReasoningDelta {
        session_id: SessionId,
        text: String,
    },
    ToolRunning {
        session_id: SessionId,
        call: ToolCall,
    },
    ToolCompleted {
        session_id: SessionId,
        call: ToolCall,
        output: String,
    },
    ToolError {
        session_id: SessionId,
        call: ToolCall,
        error: String,
    },
    Usage {
        session_id: SessionId,
        usage: Usage,
    },
    SessionIdle {
        session_id: SessionId,
    },
    SessionError {
        session_id: SessionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        message: String,
    },
    QuestionAsked {
        session_id: SessionId,
        request: QuestionRequest,
    },
    PermissionAsked {
        session_id: SessionId,
        request: PermissionRequest,
    },
    Connected,
    Heartbeat,
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        kind: ErrorKind,
        message: String,
    },
}

impl DomainEvent {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::TextDelta { session_id, .. }
            | Self::TextComplete { session_id, .. }
            | Self::ReasoningDelta { session_id, .. }
            | Self::ToolRunning { session_id, .. }
            | Self::ToolCompleted { session_id, .. }
            | Self::ToolError { session_id, .. }
            | Self::Usage { session_id, .. }
            | Self::SessionIdle { session_id }
            | Self::SessionError { session_id, .. }
            | Self::QuestionAsked { session_id, .. }
            | Self::PermissionAsked { session_id, .. } => Some(session_id),
            Self::Error { session_id, .. } => session_id.as_deref(),
            Self::Connected | Self::Heartbeat => None,
        }
    }

    pub fn is_text_delta(&self) -> bool {
        matches!(self, Self::TextDelta { .. })
    }

    /// Ends the session's current run, successfully or not.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::SessionIdle { .. } | Self::SessionError { .. })
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            session_id: None,
            kind,
            message: message.into(),
        }
    }

    pub fn session_error_event(
        session_id: impl Into<SessionId>,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self::Error {
            session_id: Some(session_id.into()),
            kind,
            message: message.into(),
        }
    }

    /// Tool events carrying the native question/permission marker are
    /// re-encoded as their own prompt variants. Everything else is returned as is.
    pub fn into_prompt_if_native(self) -> Self {
        match self {
            Self::ToolRunning { session_id, call } => match call.native_prompt_event(&session_id) {
                Some(prompt) => prompt,
                None => Self::ToolRunning { session_id, call },
            },
            other => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub tool: String,
    /// Short human-readable hint (command, path, pattern) pulled from the input.
    #[serde(default)]
    pub input_summary: String,
    #[serde(default)]
    pub input: RawInput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native: Option<NativePrompt>,
}

impl ToolCall {
    pub fn native_prompt_event(&self, session_id: &str) -> Option<DomainEvent> {
        let native = self.native.as_ref()?;
        match native.kind {
            NativePromptKind::Question => Some(DomainEvent::QuestionAsked {
                session_id: session_id.to_string(),
                request: QuestionRequest::from_tool_input(
                    &native.request_id,
                    &self.call_id,
                    &self.input,
                ),
            }),
            NativePromptKind::Permission => Some(DomainEvent::PermissionAsked {
                session_id: session_id.to_string(),
                request: PermissionRequest::from_tool_input(
                    &native.request_id,
                    &self.call_id,
                    &self.input,
                ),
            }),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub reasoning_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_write_tokens: u64,
    #[serde(default)]
    pub cost: f64,
}

impl Usage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.reasoning_tokens
    }
}
