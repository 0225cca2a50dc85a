use serde::{Deserialize, Serialize};

use crate::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundStatus {
    Running,
    Completed,
    Failed,
}

/// A run the operator started without focusing it. Its text is collected into
/// `result` instead of being streamed as deltas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundSession {
    pub session_id: SessionId,
    pub intent: String,
    pub status: BackgroundStatus,
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Text of the part currently streaming; folded into `result` once it completes.
    #[serde(skip)]
    streaming: String,
}

impl BackgroundSession {
    pub fn new(session_id: impl Into<SessionId>, intent: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            intent: intent.into(),
            status: BackgroundStatus::Running,
            result: String::new(),
            error: None,
            streaming: String::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == BackgroundStatus::Running
    }

    pub fn append_delta(&mut self, text: &str) {
        self.streaming.push_str(text);
    }

    /// A completed text part supersedes whatever deltas were streamed for it.
    pub fn complete_part(&mut self, text: &str) {
        self.streaming.clear();
        self.push_result(text);
    }

    pub fn finish(&mut self) {
        self.flush_streaming();
        self.status = BackgroundStatus::Completed;
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.flush_streaming();
        self.status = BackgroundStatus::Failed;
        self.error = Some(message.into());
    }

    fn flush_streaming(&mut self) {
        let pending = std::mem::take(&mut self.streaming);
        self.push_result(&pending);
    }

    fn push_result(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if !self.result.is_empty() {
            self.result.push_str("\n\n");
        }
        self.result.push_str(text);
    }
}
