//! Supervises a local coding agent server and turns its event stream into
//! session-scoped [`DomainEvent`]s.

pub mod cli;
mod config;
mod coordinator;
mod handler;
mod sessions;

pub use agent_bridge_event_schema::{BackgroundSession, DomainEvent, PermissionReply, SessionId};
pub use config::BridgeConfig;
pub use coordinator::{Bridge, BridgeHandle, BridgeState, BridgeStatus};
pub use handler::{BridgeUpdate, EventHandler};
