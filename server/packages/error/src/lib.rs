use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse failure classes. Every [`BridgeError`] maps onto exactly one of these,
/// and the same value travels on error-kind domain events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    SpawnFailure,
    StreamFailure,
    ApiFailure,
    ProtocolDecodeFailure,
    ServerFatal,
    BridgeClosed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SpawnFailure => "spawn_failure",
            Self::StreamFailure => "stream_failure",
            Self::ApiFailure => "api_failure",
            Self::ProtocolDecodeFailure => "protocol_decode_failure",
            Self::ServerFatal => "server_fatal",
            Self::BridgeClosed => "bridge_closed",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::SpawnFailure => "Agent Server Failed To Start",
            Self::StreamFailure => "Event Stream Lost",
            Self::ApiFailure => "Agent Request Failed",
            Self::ProtocolDecodeFailure => "Malformed Event",
            Self::ServerFatal => "Agent Server Stopped",
            Self::BridgeClosed => "Bridge Closed",
        }
    }

    /// Fatal kinds need an explicit restart before the bridge is usable again.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SpawnFailure | Self::ServerFatal | Self::BridgeClosed
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    #[error("failed to spawn agent server `{binary}`: {message}")]
    Spawn { binary: String, message: String },
    #[error("agent server `{binary}` did not announce a listening url within {timeout_ms}ms")]
    PortNotAnnounced { binary: String, timeout_ms: u64 },
    #[error("agent server `{binary}` exited before announcing a url (exit code {exit_code:?})")]
    ProcessExited {
        binary: String,
        exit_code: Option<i32>,
    },
    #[error("agent server gave up after {attempts} restart attempts: {message}")]
    RestartsExhausted { attempts: u32, message: String },
    #[error("event stream returned status {status}")]
    StreamStatus { status: u16 },
    #[error("event stream i/o error: {message}")]
    StreamIo { message: String },
    #[error("event stream gave up after {attempts} failed reconnects")]
    StreamRetriesExhausted { attempts: u32 },
    #[error("invalid response from {operation}: {message}")]
    InvalidResponse {
        operation: String,
        status: Option<u16>,
        message: String,
    },
    #[error("request {operation} failed: {message}")]
    Http { operation: String, message: String },
    #[error("failed to decode event: {message}")]
    Decode { message: String },
    #[error("bridge is closed")]
    BridgeClosed,
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Spawn { .. } | Self::PortNotAnnounced { .. } | Self::ProcessExited { .. } => {
                ErrorKind::SpawnFailure
            }
            Self::RestartsExhausted { .. } => ErrorKind::ServerFatal,
            Self::StreamStatus { .. }
            | Self::StreamIo { .. }
            | Self::StreamRetriesExhausted { .. } => ErrorKind::StreamFailure,
            Self::InvalidResponse { .. } | Self::Http { .. } => ErrorKind::ApiFailure,
            Self::Decode { .. } => ErrorKind::ProtocolDecodeFailure,
            Self::BridgeClosed => ErrorKind::BridgeClosed,
        }
    }

    pub fn invalid_response(
        operation: impl Into<String>,
        status: Option<u16>,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidResponse {
            operation: operation.into(),
            status,
            message: message.into(),
        }
    }

    pub fn http(operation: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Http {
            operation: operation.into(),
            message: err.to_string(),
        }
    }

    pub fn decode(err: impl std::fmt::Display) -> Self {
        Self::Decode {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(value: serde_json::Error) -> Self {
        Self::decode(value)
    }
}
