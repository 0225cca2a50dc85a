use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Instant;

use agent_bridge_error::BridgeError;
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

mod config;
mod output;

pub use config::{default_log_dir, ServerConfiguration, SupervisorConfig};
pub use output::parse_announced_url;

use output::{open_server_log, spawn_output_loop};

pub type RestartHandler = Arc<dyn Fn(String) + Send + Sync>;
pub type ExitHandler = Arc<dyn Fn(String) + Send + Sync>;
pub type FatalHandler = Arc<dyn Fn(BridgeError) + Send + Sync>;

/// Owns the agent server child process. Clones share the same process.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

struct Inner {
    config: SupervisorConfig,
    ensure_lock: Mutex<()>,
    state: Mutex<SupervisorState>,
    handlers: StdMutex<Handlers>,
}

#[derive(Default)]
struct Handlers {
    exit: Option<ExitHandler>,
    restart: Option<RestartHandler>,
    fatal: Option<FatalHandler>,
}

#[derive(Default)]
struct SupervisorState {
    server: Option<RunningServer>,
    server_config: Option<ServerConfiguration>,
    monitor: Option<JoinHandle<()>>,
    restart_attempts: u32,
    next_instance_id: u64,
    shutdown_requested: bool,
    last_error: Option<String>,
}

struct RunningServer {
    base_url: String,
    child: Arc<Mutex<Child>>,
    instance_id: u64,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                ensure_lock: Mutex::new(()),
                state: Mutex::new(SupervisorState::default()),
                handlers: StdMutex::new(Handlers::default()),
            }),
        }
    }

    /// Called with the new base url after every successful automatic restart.
    /// Register before `start` so an early crash is not missed.
    pub fn set_restart_handler(&self, handler: impl Fn(String) + Send + Sync + 'static) {
        if let Ok(mut handlers) = self.inner.handlers.lock() {
            handlers.restart = Some(Arc::new(handler));
        }
    }

    /// Called with a description whenever the child dies unexpectedly,
    /// before any restart is attempted.
    pub fn set_exit_handler(&self, handler: impl Fn(String) + Send + Sync + 'static) {
        if let Ok(mut handlers) = self.inner.handlers.lock() {
            handlers.exit = Some(Arc::new(handler));
        }
    }

    /// Called once when restart attempts are exhausted.
    pub fn set_fatal_handler(&self, handler: impl Fn(BridgeError) + Send + Sync + 'static) {
        if let Ok(mut handlers) = self.inner.handlers.lock() {
            handlers.fatal = Some(Arc::new(handler));
        }
    }

    /// Spawns the server and waits for it to announce its url. Returns the
    /// current url without spawning if a server is already running.
    pub async fn start(&self, server_config: ServerConfiguration) -> Result<String, BridgeError> {
        let _guard = self.inner.ensure_lock.lock().await;

        if let Some(base_url) = self.running_base_url().await {
            return Ok(base_url);
        }

        {
            let mut state = self.inner.state.lock().await;
            state.shutdown_requested = false;
            state.restart_attempts = 0;
            state.server_config = Some(server_config.clone());
        }

        match self.launch(&server_config).await {
            Ok(server) => {
                let base_url = server.base_url.clone();
                self.install(server).await;
                Ok(base_url)
            }
            Err(err) => {
                let mut state = self.inner.state.lock().await;
                state.last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    /// SIGTERM, then a forced kill after the grace period. Safe to call repeatedly.
    pub async fn stop(&self) {
        let _guard = self.inner.ensure_lock.lock().await;

        let (server, monitor) = {
            let mut state = self.inner.state.lock().await;
            state.shutdown_requested = true;
            (state.server.take(), state.monitor.take())
        };

        if let Some(monitor) = monitor {
            monitor.abort();
        }

        if let Some(server) = server {
            let mut child = server.child.lock().await;
            terminate_child(&mut child, self.inner.config.grace_period).await;
            info!(
                instance_id = server.instance_id,
                base_url = %server.base_url,
                "agent server stopped"
            );
        }
    }

    pub async fn base_url(&self) -> Option<String> {
        let state = self.inner.state.lock().await;
        state.server.as_ref().map(|server| server.base_url.clone())
    }

    pub async fn is_running(&self) -> bool {
        self.running_base_url().await.is_some()
    }

    pub async fn last_error(&self) -> Option<String> {
        self.inner.state.lock().await.last_error.clone()
    }

    async fn running_base_url(&self) -> Option<String> {
        let (base_url, child) = {
            let state = self.inner.state.lock().await;
            let server = state.server.as_ref()?;
            (server.base_url.clone(), server.child.clone())
        };

        let mut child = child.lock().await;
        match child.try_wait() {
            Ok(None) => Some(base_url),
            Ok(Some(_)) | Err(_) => None,
        }
    }

    async fn launch(&self, server_config: &ServerConfiguration) -> Result<RunningServer, BridgeError> {
        let spawn_start = Instant::now();
        let binary = server_config.binary_display();

        let mut command = Command::new(&server_config.binary);
        command
            .args(&server_config.args)
            .envs(&server_config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(directory) = &server_config.working_directory {
            command.current_dir(directory);
        }

        info!(
            binary = %binary,
            args = ?server_config.args,
            cwd = ?server_config.working_directory,
            "spawning agent server"
        );

        let mut child = command.spawn().map_err(|err| {
            error!(binary = %binary, error = %err, "failed to spawn agent server");
            BridgeError::Spawn {
                binary: binary.clone(),
                message: err.to_string(),
            }
        })?;

        let pid = child.id().unwrap_or(0);
        info!(
            pid,
            elapsed_ms = spawn_start.elapsed().as_millis() as u64,
            "agent server spawned"
        );

        let log = self.inner.config.log_dir.as_deref().and_then(|dir| {
            open_server_log(dir)
                .map_err(|err| warn!(dir = %dir.display(), error = %err, "failed to open server log"))
                .ok()
        });

        let (announced_tx, announced_rx) = watch::channel(None);
        if let Some(stdout) = child.stdout.take() {
            spawn_output_loop(stdout, "stdout", pid, announced_tx.clone(), log.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_output_loop(stderr, "stderr", pid, announced_tx, log);
        }

        let base_url = match self
            .wait_for_announcement(&mut child, announced_rx, &binary)
            .await
        {
            Ok(base_url) => base_url,
            Err(err) => {
                terminate_child(&mut child, self.inner.config.grace_period).await;
                return Err(err);
            }
        };

        let instance_id = {
            let mut state = self.inner.state.lock().await;
            state.next_instance_id += 1;
            state.next_instance_id
        };

        info!(
            pid,
            instance_id,
            base_url = %base_url,
            startup_ms = spawn_start.elapsed().as_millis() as u64,
            "agent server ready"
        );

        Ok(RunningServer {
            base_url,
            child: Arc::new(Mutex::new(child)),
            instance_id,
        })
    }

    async fn wait_for_announcement(
        &self,
        child: &mut Child,
        announced: watch::Receiver<Option<String>>,
        binary: &str,
    ) -> Result<String, BridgeError> {
        let config = &self.inner.config;
        let deadline = Instant::now() + config.startup_timeout;

        loop {
            if let Some(base_url) = announced.borrow().clone() {
                return Ok(base_url);
            }

            if let Ok(Some(status)) = child.try_wait() {
                warn!(binary, ?status, "agent server exited during startup");
                return Err(BridgeError::ProcessExited {
                    binary: binary.to_string(),
                    exit_code: status.code(),
                });
            }

            if Instant::now() >= deadline {
                return Err(BridgeError::PortNotAnnounced {
                    binary: binary.to_string(),
                    timeout_ms: config.startup_timeout.as_millis() as u64,
                });
            }

            sleep(config.poll_interval).await;
        }
    }

    async fn install(&self, server: RunningServer) {
        let monitor = self.spawn_monitor_task(server.instance_id, server.child.clone());
        let mut state = self.inner.state.lock().await;
        state.server = Some(server);
        state.last_error = None;
        state.monitor = Some(monitor);
    }

    fn spawn_monitor_task(&self, instance_id: u64, child: Arc<Mutex<Child>>) -> JoinHandle<()> {
        let inner = Arc::downgrade(&self.inner);
        let interval = self.inner.config.health_interval;
        let stable_after = self.inner.config.stable_after;
        tokio::spawn(async move {
            let started = Instant::now();
            let mut stable = false;
            loop {
                sleep(interval).await;

                let status = {
                    let mut child = child.lock().await;
                    match child.try_wait() {
                        Ok(status) => status,
                        Err(err) => {
                            warn!(instance_id, error = %err, "agent server health check failed");
                            None
                        }
                    }
                };

                let Some(supervisor) = upgrade(&inner) else {
                    return;
                };
                if let Some(status) = status {
                    supervisor.handle_process_exit(instance_id, status).await;
                    return;
                }
                if !stable && started.elapsed() >= stable_after {
                    stable = true;
                    supervisor.mark_stable(instance_id).await;
                }
            }
        })
    }

    async fn mark_stable(&self, instance_id: u64) {
        let mut state = self.inner.state.lock().await;
        let is_current = state
            .server
            .as_ref()
            .map(|server| server.instance_id == instance_id)
            .unwrap_or(false);
        if is_current && state.restart_attempts > 0 {
            info!(
                instance_id,
                restart_attempts = state.restart_attempts,
                "agent server stable, restart budget reset"
            );
            state.restart_attempts = 0;
        }
    }

    async fn handle_process_exit(&self, instance_id: u64, status: ExitStatus) {
        let (server_config, mut last_message) = {
            let mut state = self.inner.state.lock().await;
            let is_current = state
                .server
                .as_ref()
                .map(|server| server.instance_id == instance_id)
                .unwrap_or(false);
            if !is_current {
                return;
            }
            state.server = None;
            if state.shutdown_requested {
                return;
            }

            let message = format!("agent server exited with {status}");
            warn!(instance_id, exit_code = ?status.code(), "agent server died");
            state.last_error = Some(message.clone());
            let Some(server_config) = state.server_config.clone() else {
                return;
            };
            (server_config, message)
        };

        let exit_handler = self
            .inner
            .handlers
            .lock()
            .ok()
            .and_then(|handlers| handlers.exit.clone());
        if let Some(handler) = exit_handler {
            handler(last_message.clone());
        }

        let max_restarts = self.inner.config.max_restarts;
        loop {
            let attempt = {
                let mut state = self.inner.state.lock().await;
                if state.shutdown_requested {
                    return;
                }
                state.restart_attempts += 1;
                state.restart_attempts
            };

            if attempt > max_restarts {
                self.report_fatal(max_restarts, last_message).await;
                return;
            }

            sleep(self.inner.config.restart_delay).await;

            let _guard = self.inner.ensure_lock.lock().await;
            {
                let state = self.inner.state.lock().await;
                if state.shutdown_requested || state.server.is_some() {
                    return;
                }
            }

            info!(attempt, max_restarts, "restarting agent server");
            match self.launch(&server_config).await {
                Ok(server) => {
                    let base_url = server.base_url.clone();
                    self.install(server).await;
                    drop(_guard);
                    self.notify_restart(base_url);
                    return;
                }
                Err(err) => {
                    warn!(attempt, error = %err, "agent server restart attempt failed");
                    last_message = err.to_string();
                }
            }
        }
    }

    async fn report_fatal(&self, attempts: u32, message: String) {
        error!(attempts, last_error = %message, "agent server restarts exhausted");
        {
            let mut state = self.inner.state.lock().await;
            state.last_error = Some(message.clone());
        }
        let handler = self
            .inner
            .handlers
            .lock()
            .ok()
            .and_then(|handlers| handlers.fatal.clone());
        if let Some(handler) = handler {
            handler(BridgeError::RestartsExhausted { attempts, message });
        }
    }

    fn notify_restart(&self, base_url: String) {
        let handler = self
            .inner
            .handlers
            .lock()
            .ok()
            .and_then(|handlers| handlers.restart.clone());
        match handler {
            Some(handler) => handler(base_url),
            None => warn!(base_url = %base_url, "agent server restarted without a restart handler"),
        }
    }
}

fn upgrade(inner: &Weak<Inner>) -> Option<ProcessSupervisor> {
    inner.upgrade().map(|inner| ProcessSupervisor { inner })
}

async fn terminate_child(child: &mut Child, grace_period: std::time::Duration) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }

    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    match timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => tracing::debug!(?status, "agent server exited after SIGTERM"),
        Ok(Err(err)) => warn!(error = %err, "failed waiting for agent server exit"),
        Err(_) => {
            warn!(
                grace_ms = grace_period.as_millis() as u64,
                "agent server ignored SIGTERM, killing"
            );
            if let Err(err) = child.kill().await {
                warn!(error = %err, "failed to kill agent server");
            }
        }
    }
}
