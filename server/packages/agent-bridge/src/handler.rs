use agent_bridge_event_schema::{BackgroundSession, DomainEvent};
use tokio::sync::mpsc;

/// Receives everything the bridge produces. Called from the bridge task, so
/// implementations should hand work off rather than block.
pub trait EventHandler: Send + Sync + 'static {
    fn handle_event(&self, event: DomainEvent);

    /// A background session was created or changed status.
    fn handle_background(&self, _session: BackgroundSession) {}
}

#[derive(Debug, Clone, PartialEq)]
pub enum BridgeUpdate {
    Event(DomainEvent),
    Background(BackgroundSession),
}

impl EventHandler for mpsc::UnboundedSender<BridgeUpdate> {
    fn handle_event(&self, event: DomainEvent) {
        let _ = self.send(BridgeUpdate::Event(event));
    }

    fn handle_background(&self, session: BackgroundSession) {
        let _ = self.send(BridgeUpdate::Background(session));
    }
}
