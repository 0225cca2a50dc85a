use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// How to launch the agent server. Replacing it requires a stop and a fresh start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerConfiguration {
    pub binary: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_directory: Option<PathBuf>,
}

impl ServerConfiguration {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            ..Self::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_working_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(directory.into());
        self
    }

    pub(crate) fn binary_display(&self) -> String {
        self.binary.display().to_string()
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How often `start` checks whether the child has announced its url.
    pub poll_interval: Duration,
    pub startup_timeout: Duration,
    pub health_interval: Duration,
    /// Time between SIGTERM and a forced kill.
    pub grace_period: Duration,
    pub max_restarts: u32,
    pub restart_delay: Duration,
    /// A child that stays up this long earns back the full restart budget.
    pub stable_after: Duration,
    /// Child stdout/stderr is appended here; `None` only traces it.
    pub log_dir: Option<PathBuf>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            startup_timeout: Duration::from_secs(10),
            health_interval: Duration::from_secs(1),
            grace_period: Duration::from_secs(5),
            max_restarts: 3,
            restart_delay: Duration::from_millis(500),
            stable_after: Duration::from_secs(60),
            log_dir: Some(default_log_dir()),
        }
    }
}

pub fn default_log_dir() -> PathBuf {
    let mut base = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
    base.push("agent-bridge");
    base.push("server-logs");
    base
}
