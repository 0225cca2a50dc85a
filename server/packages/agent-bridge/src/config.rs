use std::path::PathBuf;
use std::time::Duration;

use agent_bridge_event_stream::{ReconnectPolicy, DEFAULT_THROTTLE_INTERVAL};
use agent_bridge_server_supervisor::{ServerConfiguration, SupervisorConfig};

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub server: ServerConfiguration,
    pub supervisor: SupervisorConfig,
    pub reconnect: ReconnectPolicy,
    pub throttle_interval: Duration,
    /// `provider/model` sent with every prompt when set.
    pub model: Option<String>,
    pub agent: Option<String>,
    /// How long a prompt waits for the event stream to open before being sent anyway.
    pub stream_ready_timeout: Duration,
}

impl BridgeConfig {
    pub fn new(server: ServerConfiguration) -> Self {
        Self {
            server,
            supervisor: SupervisorConfig::default(),
            reconnect: ReconnectPolicy::default(),
            throttle_interval: DEFAULT_THROTTLE_INTERVAL,
            model: None,
            agent: None,
            stream_ready_timeout: Duration::from_secs(5),
        }
    }

    /// The server runs from its configured directory, falling back to home.
    pub(crate) fn resolved_server(&self) -> ServerConfiguration {
        let mut server = self.server.clone();
        if server.working_directory.is_none() {
            server.working_directory = default_working_directory();
        }
        server
    }
}

fn default_working_directory() -> Option<PathBuf> {
    dirs::home_dir().or_else(|| std::env::current_dir().ok())
}
