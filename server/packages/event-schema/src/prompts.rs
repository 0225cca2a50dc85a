use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::RawInput;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NativePromptKind {
    Question,
    Permission,
}

impl NativePromptKind {
    pub fn from_marker(marker: &str) -> Option<Self> {
        match marker {
            "question" => Some(Self::Question),
            "permission" => Some(Self::Permission),
            _ => None,
        }
    }
}

/// Marker carried by tool calls that are really structured prompts for the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativePrompt {
    pub kind: NativePromptKind,
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub label: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionItem {
    pub question: String,
    #[serde(default)]
    pub header: String,
    #[serde(default)]
    pub options: Vec<QuestionOption>,
    #[serde(default)]
    pub multiple: bool,
    #[serde(default)]
    pub custom: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionRequest {
    pub request_id: String,
    pub questions: Vec<QuestionItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
}

impl QuestionRequest {
    pub fn from_tool_input(request_id: &str, call_id: &str, input: &RawInput) -> Self {
        Self {
            request_id: request_id.to_string(),
            questions: parse_questions(input.get("questions")),
            call_id: Some(call_id.to_string()),
        }
    }
}

/// Malformed entries are skipped rather than failing the whole prompt.
pub fn parse_questions(value: Option<&Value>) -> Vec<QuestionItem> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| serde_json::from_value::<QuestionItem>(item.clone()).ok())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub request_id: String,
    pub permission: String,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub metadata: RawInput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
}

impl PermissionRequest {
    pub fn from_tool_input(request_id: &str, call_id: &str, input: &RawInput) -> Self {
        let metadata = input
            .get("metadata")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        Self {
            request_id: request_id.to_string(),
            permission: input
                .get("permission")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            patterns: string_list(input.get("patterns")),
            metadata,
            call_id: Some(call_id.to_string()),
        }
    }
}

pub fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Operator decision on a permission prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionReply {
    AllowOnce,
    AlwaysAllow,
    Reject { reason: Option<String> },
}

impl PermissionReply {
    pub fn wire_value(&self) -> &'static str {
        match self {
            Self::AllowOnce => "once",
            Self::AlwaysAllow => "always",
            Self::Reject { .. } => "reject",
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Reject { reason } => reason.as_deref(),
            _ => None,
        }
    }
}
