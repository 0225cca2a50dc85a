use std::collections::{BTreeMap, BTreeSet, HashSet};

use agent_bridge_event_schema::{BackgroundSession, DomainEvent, SessionId};

/// Session bookkeeping owned by the bridge task.
///
/// While the active set is empty every session's events are accepted; this is
/// how the first session's events get through before its id is known.
#[derive(Debug, Default)]
pub(crate) struct SessionTracker {
    current: Option<SessionId>,
    active: BTreeSet<SessionId>,
    background: BTreeMap<SessionId, BackgroundSession>,
    seen_prompts: HashSet<String>,
}

impl SessionTracker {
    pub fn accepts(&self, session_id: &str) -> bool {
        self.active.is_empty() || self.active.contains(session_id)
    }

    pub fn current(&self) -> Option<&SessionId> {
        self.current.as_ref()
    }

    pub fn set_current(&mut self, session_id: SessionId) {
        self.active.insert(session_id.clone());
        self.current = Some(session_id);
    }

    /// Forgets which session is in the foreground. The session stays tracked
    /// so its remaining events are still delivered.
    pub fn clear_current(&mut self) -> Option<SessionId> {
        self.current.take()
    }

    pub fn add_background(&mut self, session: BackgroundSession) {
        self.active.insert(session.session_id.clone());
        self.background.insert(session.session_id.clone(), session);
    }

    pub fn remove_background(&mut self, session_id: &str) -> Option<BackgroundSession> {
        let removed = self.background.remove(session_id)?;
        if self.current.as_deref() != Some(session_id) {
            self.active.remove(session_id);
        }
        Some(removed)
    }

    pub fn running_background_mut(&mut self, session_id: &str) -> Option<&mut BackgroundSession> {
        self.background
            .get_mut(session_id)
            .filter(|session| session.is_running())
    }

    pub fn is_background_running(&self, session_id: &str) -> bool {
        self.background
            .get(session_id)
            .map(BackgroundSession::is_running)
            .unwrap_or(false)
    }

    /// Marks every running background session failed and returns them.
    pub fn fail_running_background(&mut self, message: &str) -> Vec<BackgroundSession> {
        self.background
            .values_mut()
            .filter(|session| session.is_running())
            .map(|session| {
                session.fail(message);
                session.clone()
            })
            .collect()
    }

    /// False for a question or permission whose request id was already delivered.
    pub fn first_prompt_sighting(&mut self, event: &DomainEvent) -> bool {
        let request_id = match event {
            DomainEvent::QuestionAsked { request, .. } => &request.request_id,
            DomainEvent::PermissionAsked { request, .. } => &request.request_id,
            _ => return true,
        };
        self.seen_prompts.insert(request_id.clone())
    }

    pub fn active_sessions(&self) -> Vec<SessionId> {
        self.active.iter().cloned().collect()
    }

    pub fn background_sessions(&self) -> Vec<BackgroundSession> {
        self.background.values().cloned().collect()
    }
}
