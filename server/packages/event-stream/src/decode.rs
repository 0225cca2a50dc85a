use agent_bridge_error::BridgeError;
use agent_bridge_event_schema::prompts::{parse_questions, string_list};
use agent_bridge_event_schema::{
    DomainEvent, NativePrompt, NativePromptKind, PermissionRequest, QuestionRequest, RawInput,
    SessionId, ToolCall, Usage,
};
use serde_json::Value;

const SUMMARY_KEYS: [&str; 7] = [
    "command",
    "filePath",
    "path",
    "pattern",
    "url",
    "query",
    "description",
];
const SUMMARY_MAX_CHARS: usize = 120;

/// Decodes one SSE payload.
///
/// `Ok(None)` means the frame is well formed but carries nothing the bridge
/// surfaces (unknown type, user echo, empty delta). `Err` means it is malformed.
pub fn parse_event(payload: &str) -> Result<Option<DomainEvent>, BridgeError> {
    let value: Value = serde_json::from_str(payload)?;
    let event_type = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| BridgeError::decode("event has no type"))?;
    let props = value.get("properties").unwrap_or(&Value::Null);

    match event_type {
        "server.connected" => Ok(Some(DomainEvent::Connected)),
        "server.heartbeat" => Ok(Some(DomainEvent::Heartbeat)),
        "message.part.updated" => decode_part_updated(props),
        "message.updated" => decode_message_updated(props),
        "session.idle" => Ok(Some(DomainEvent::SessionIdle {
            session_id: session_id(props)?,
        })),
        "session.error" => decode_session_error(props),
        "question.asked" => decode_question(props),
        "permission.asked" => decode_permission(props),
        _ => Ok(None),
    }
}

fn session_id(props: &Value) -> Result<SessionId, BridgeError> {
    ["/sessionID", "/part/sessionID", "/info/sessionID"]
        .iter()
        .find_map(|pointer| props.pointer(pointer).and_then(Value::as_str))
        .map(str::to_string)
        .ok_or_else(|| BridgeError::decode("event has no sessionID"))
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

fn u64_at(value: &Value, pointer: &str) -> u64 {
    value.pointer(pointer).and_then(Value::as_u64).unwrap_or(0)
}

fn decode_part_updated(props: &Value) -> Result<Option<DomainEvent>, BridgeError> {
    let part = props
        .get("part")
        .ok_or_else(|| BridgeError::decode("message.part.updated has no part"))?;
    let part_type = part.get("type").and_then(Value::as_str).unwrap_or_default();
    if !matches!(part_type, "text" | "reasoning" | "tool") {
        return Ok(None);
    }
    let session_id = session_id(props)?;
    let delta = props.get("delta").and_then(Value::as_str);

    match part_type {
        "text" => {
            if let Some(delta) = delta {
                if delta.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(DomainEvent::TextDelta {
                    session_id,
                    text: delta.to_string(),
                }));
            }
            let finished = part
                .pointer("/time/end")
                .map(|end| !end.is_null())
                .unwrap_or(false);
            if !finished {
                return Ok(None);
            }
            Ok(Some(DomainEvent::TextComplete {
                session_id,
                text: str_at(part, "/text").unwrap_or_default().to_string(),
            }))
        }
        "reasoning" => Ok(delta
            .filter(|delta| !delta.is_empty())
            .map(|delta| DomainEvent::ReasoningDelta {
                session_id,
                text: delta.to_string(),
            })),
        "tool" => decode_tool_part(session_id, part),
        _ => Ok(None),
    }
}

fn decode_tool_part(session_id: SessionId, part: &Value) -> Result<Option<DomainEvent>, BridgeError> {
    let call_id = str_at(part, "/callID")
        .or_else(|| str_at(part, "/id"))
        .ok_or_else(|| BridgeError::decode("tool part has no callID"))?
        .to_string();
    let tool = str_at(part, "/tool").unwrap_or("tool").to_string();
    let state = part.get("state").unwrap_or(&Value::Null);
    let input: RawInput = state
        .get("input")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    let native = str_at(state, "/metadata/nativePrompt")
        .and_then(NativePromptKind::from_marker)
        .map(|kind| NativePrompt {
            kind,
            request_id: str_at(state, "/metadata/requestID")
                .unwrap_or(&call_id)
                .to_string(),
        });

    let call = ToolCall {
        call_id,
        tool,
        input_summary: summarize_input(&input),
        input,
        native,
    };

    let event = match str_at(state, "/status").unwrap_or_default() {
        "running" | "pending" => DomainEvent::ToolRunning { session_id, call },
        "completed" => DomainEvent::ToolCompleted {
            session_id,
            call,
            output: match state.get("output") {
                Some(Value::String(output)) => output.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            },
        },
        "error" => DomainEvent::ToolError {
            session_id,
            call,
            error: str_at(state, "/error")
                .unwrap_or("tool failed")
                .to_string(),
        },
        _ => return Ok(None),
    };
    Ok(Some(event))
}

/// First string among the well-known input keys, cut to a display-friendly length.
pub fn summarize_input(input: &RawInput) -> String {
    let Some(value) = SUMMARY_KEYS
        .iter()
        .find_map(|key| input.get(*key).and_then(Value::as_str))
    else {
        return String::new();
    };
    if value.chars().count() <= SUMMARY_MAX_CHARS {
        return value.to_string();
    }
    let mut summary: String = value.chars().take(SUMMARY_MAX_CHARS).collect();
    summary.push_str("...");
    summary
}

fn decode_message_updated(props: &Value) -> Result<Option<DomainEvent>, BridgeError> {
    let Some(info) = props.get("info") else {
        return Ok(None);
    };
    if str_at(info, "/role") != Some("assistant") {
        return Ok(None);
    }
    let completed = info
        .pointer("/time/completed")
        .map(|value| !value.is_null())
        .unwrap_or(false);
    let Some(tokens) = info.get("tokens") else {
        return Ok(None);
    };
    if !completed {
        return Ok(None);
    }

    Ok(Some(DomainEvent::Usage {
        session_id: session_id(props)?,
        usage: Usage {
            input_tokens: u64_at(tokens, "/input"),
            output_tokens: u64_at(tokens, "/output"),
            reasoning_tokens: u64_at(tokens, "/reasoning"),
            cache_read_tokens: u64_at(tokens, "/cache/read"),
            cache_write_tokens: u64_at(tokens, "/cache/write"),
            cost: info.get("cost").and_then(Value::as_f64).unwrap_or(0.0),
        },
    }))
}

fn decode_session_error(props: &Value) -> Result<Option<DomainEvent>, BridgeError> {
    let session_id = session_id(props)?;
    let error = props.get("error").unwrap_or(&Value::Null);
    let name = str_at(error, "/name").map(str::to_string);
    let message = str_at(error, "/data/message")
        .or_else(|| str_at(error, "/message"))
        .or(name.as_deref())
        .unwrap_or("session failed")
        .to_string();
    Ok(Some(DomainEvent::SessionError {
        session_id,
        name,
        message,
    }))
}

fn decode_question(props: &Value) -> Result<Option<DomainEvent>, BridgeError> {
    let request_id = str_at(props, "/id")
        .ok_or_else(|| BridgeError::decode("question.asked has no id"))?
        .to_string();
    Ok(Some(DomainEvent::QuestionAsked {
        session_id: session_id(props)?,
        request: QuestionRequest {
            request_id,
            questions: parse_questions(props.get("questions")),
            call_id: str_at(props, "/tool/callID").map(str::to_string),
        },
    }))
}

fn decode_permission(props: &Value) -> Result<Option<DomainEvent>, BridgeError> {
    let request_id = str_at(props, "/id")
        .ok_or_else(|| BridgeError::decode("permission.asked has no id"))?
        .to_string();
    Ok(Some(DomainEvent::PermissionAsked {
        session_id: session_id(props)?,
        request: PermissionRequest {
            request_id,
            permission: str_at(props, "/permission")
                .unwrap_or_default()
                .to_string(),
            patterns: string_list(props.get("patterns")),
            metadata: props
                .get("metadata")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
            call_id: str_at(props, "/tool/callID").map(str::to_string),
        },
    }))
}
