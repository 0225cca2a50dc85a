use std::future::Future;
use std::time::Duration;

use agent_bridge_api_client::AgentApiClient;
use agent_bridge_error::{BridgeError, ErrorKind};
use agent_bridge_event_schema::{BackgroundSession, DomainEvent, PermissionReply, SessionId};
use agent_bridge_event_stream::{EventStream, EventStreamReader};
use agent_bridge_server_supervisor::ProcessSupervisor;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use crate::config::BridgeConfig;
use crate::handler::EventHandler;
use crate::sessions::SessionTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeState {
    Unconfigured,
    Starting,
    RunningSessionless,
    RunningSessionActive,
    Restarting,
    Stopped,
    /// The server kept dying and restarts were given up. Only `restart` leaves this state.
    Failed,
}

impl BridgeState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::RunningSessionless | Self::RunningSessionActive)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatus {
    pub state: BridgeState,
    pub server_url: Option<String>,
    pub directory: Option<String>,
    pub current_session: Option<SessionId>,
    pub active_sessions: Vec<SessionId>,
    pub stream_active: bool,
    pub stream_connected: bool,
    pub background: Vec<BackgroundSession>,
}

enum Command {
    StartIfNeeded {
        reply: oneshot::Sender<Result<String, BridgeError>>,
    },
    SubmitIntent {
        text: String,
        cwd: String,
        reply: oneshot::Sender<Result<SessionId, BridgeError>>,
    },
    CreateBackground {
        text: String,
        cwd: String,
        reply: oneshot::Sender<Result<SessionId, BridgeError>>,
    },
    Abort {
        session_id: Option<SessionId>,
        reply: oneshot::Sender<Result<Option<SessionId>, BridgeError>>,
    },
    ReplyQuestion {
        request_id: String,
        answers: Vec<Vec<String>>,
        reply: oneshot::Sender<Result<(), BridgeError>>,
    },
    RejectQuestion {
        request_id: String,
        reply: oneshot::Sender<Result<(), BridgeError>>,
    },
    ReplyPermission {
        request_id: String,
        decision: PermissionReply,
        reply: oneshot::Sender<Result<(), BridgeError>>,
    },
    NewConversation {
        reply: oneshot::Sender<Option<SessionId>>,
    },
    DismissBackground {
        session_id: SessionId,
        reply: oneshot::Sender<Option<BackgroundSession>>,
    },
    Status {
        reply: oneshot::Sender<BridgeStatus>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Restart {
        reply: oneshot::Sender<Result<String, BridgeError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    ServerExited {
        message: String,
    },
    ServerRestarted {
        base_url: String,
    },
    ServerFatal {
        error: BridgeError,
    },
    PromptFailed {
        session_id: SessionId,
        error: BridgeError,
    },
}

/// Cheap to clone. Every call is a message to the bridge task; once that task
/// has ended calls fail with `BridgeError::BridgeClosed`.
#[derive(Clone)]
pub struct BridgeHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl BridgeHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, BridgeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .map_err(|_| BridgeError::BridgeClosed)?;
        rx.await.map_err(|_| BridgeError::BridgeClosed)
    }

    /// Starts the agent server unless it is already up. Returns its base url.
    pub async fn start_if_needed(&self) -> Result<String, BridgeError> {
        self.request(|reply| Command::StartIfNeeded { reply }).await?
    }

    /// Sends `text` to the current session, creating one if needed. Returns
    /// once the session exists; output arrives through the event handler.
    pub async fn submit_intent(
        &self,
        text: impl Into<String>,
        cwd: impl Into<String>,
    ) -> Result<SessionId, BridgeError> {
        let (text, cwd) = (text.into(), cwd.into());
        self.request(|reply| Command::SubmitIntent { text, cwd, reply })
            .await?
    }

    /// Starts a new session that runs alongside the current one without
    /// replacing it.
    pub async fn create_background_session(
        &self,
        text: impl Into<String>,
        cwd: impl Into<String>,
    ) -> Result<SessionId, BridgeError> {
        let (text, cwd) = (text.into(), cwd.into());
        self.request(|reply| Command::CreateBackground { text, cwd, reply })
            .await?
    }

    /// Aborts `session_id`, or the current session when `None`. Returns the
    /// session that was aborted.
    pub async fn abort(&self, session_id: Option<SessionId>) -> Result<Option<SessionId>, BridgeError> {
        self.request(|reply| Command::Abort { session_id, reply })
            .await?
    }

    pub async fn reply_to_question(
        &self,
        request_id: impl Into<String>,
        answers: Vec<Vec<String>>,
    ) -> Result<(), BridgeError> {
        let request_id = request_id.into();
        self.request(|reply| Command::ReplyQuestion {
            request_id,
            answers,
            reply,
        })
        .await?
    }

    pub async fn reject_question(&self, request_id: impl Into<String>) -> Result<(), BridgeError> {
        let request_id = request_id.into();
        self.request(|reply| Command::RejectQuestion { request_id, reply })
            .await?
    }

    pub async fn reply_to_permission(
        &self,
        request_id: impl Into<String>,
        decision: PermissionReply,
    ) -> Result<(), BridgeError> {
        let request_id = request_id.into();
        self.request(|reply| Command::ReplyPermission {
            request_id,
            decision,
            reply,
        })
        .await?
    }

    /// Forgets the current session so the next intent starts a fresh one.
    pub async fn new_conversation(&self) -> Result<Option<SessionId>, BridgeError> {
        self.request(|reply| Command::NewConversation { reply }).await
    }

    pub async fn dismiss_background(
        &self,
        session_id: impl Into<SessionId>,
    ) -> Result<Option<BackgroundSession>, BridgeError> {
        let session_id = session_id.into();
        self.request(|reply| Command::DismissBackground { session_id, reply })
            .await
    }

    pub async fn status(&self) -> Result<BridgeStatus, BridgeError> {
        self.request(|reply| Command::Status { reply }).await
    }

    pub async fn stop(&self) -> Result<(), BridgeError> {
        self.request(|reply| Command::Stop { reply }).await
    }

    pub async fn restart(&self) -> Result<String, BridgeError> {
        self.request(|reply| Command::Restart { reply }).await?
    }

    /// Stops the server and ends the bridge task.
    pub async fn shutdown(&self) -> Result<(), BridgeError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

#[derive(Debug, Clone, Copy)]
enum ReconnectReason {
    NeverStarted,
    DirectoryChanged,
    StreamDied,
}

/// The task that owns the supervisor, the event stream and all session state.
pub struct Bridge {
    config: BridgeConfig,
    handler: Box<dyn EventHandler>,
    inbox: mpsc::UnboundedReceiver<Command>,
    inbox_tx: mpsc::WeakUnboundedSender<Command>,
    supervisor: ProcessSupervisor,
    reader: EventStreamReader,
    stream: Option<EventStream>,
    api: AgentApiClient,
    sessions: SessionTracker,
    state: BridgeState,
    base_url: Option<String>,
    last_directory: Option<String>,
    fatal: Option<BridgeError>,
}

impl Bridge {
    /// Spawns the bridge task on the current runtime. The task ends when
    /// `shutdown` is called or every handle has been dropped.
    pub fn spawn(config: BridgeConfig, handler: impl EventHandler) -> BridgeHandle {
        let (tx, inbox) = mpsc::unbounded_channel();
        let bridge = Bridge {
            supervisor: ProcessSupervisor::new(config.supervisor.clone()),
            reader: EventStreamReader::new(config.reconnect.clone(), config.throttle_interval),
            stream: None,
            api: AgentApiClient::new(""),
            sessions: SessionTracker::default(),
            state: BridgeState::Unconfigured,
            base_url: None,
            last_directory: None,
            fatal: None,
            handler: Box::new(handler),
            inbox,
            inbox_tx: tx.downgrade(),
            config,
        };
        tokio::spawn(bridge.run());
        BridgeHandle { tx }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.inbox.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.stop().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.stop().await;
                        break;
                    }
                },
                event = next_stream_event(&mut self.stream) => match event {
                    Some(event) => self.dispatch(event),
                    None => {
                        debug!(directory = ?self.last_directory, "event stream ended");
                        self.stream = None;
                    }
                },
            }
        }
        info!("bridge shut down");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartIfNeeded { reply } => {
                let _ = reply.send(self.start_if_needed().await);
            }
            Command::SubmitIntent { text, cwd, reply } => {
                let _ = reply.send(self.submit_intent(text, cwd).await);
            }
            Command::CreateBackground { text, cwd, reply } => {
                let _ = reply.send(self.create_background_session(text, cwd).await);
            }
            Command::Abort { session_id, reply } => self.abort(session_id, reply),
            Command::ReplyQuestion {
                request_id,
                answers,
                reply,
            } => {
                let api = self.api.clone();
                self.spawn_call("question.reply", reply, async move {
                    api.reply_to_question(&request_id, &answers).await
                });
            }
            Command::RejectQuestion { request_id, reply } => {
                let api = self.api.clone();
                self.spawn_call("question.reject", reply, async move {
                    api.reject_question(&request_id).await
                });
            }
            Command::ReplyPermission {
                request_id,
                decision,
                reply,
            } => {
                let api = self.api.clone();
                self.spawn_call("permission.reply", reply, async move {
                    api.reply_to_permission(&request_id, &decision).await
                });
            }
            Command::NewConversation { reply } => {
                let previous = self.sessions.clear_current();
                info!(previous = ?previous, "starting a new conversation");
                self.refresh_running_state();
                let _ = reply.send(previous);
            }
            Command::DismissBackground { session_id, reply } => {
                let _ = reply.send(self.sessions.remove_background(&session_id));
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::Stop { reply } => {
                self.stop().await;
                let _ = reply.send(());
            }
            Command::Restart { reply } => {
                let _ = reply.send(self.restart().await);
            }
            Command::Shutdown { reply } => {
                self.stop().await;
                let _ = reply.send(());
            }
            Command::ServerExited { message } => {
                warn!(message = %message, "agent server exited, waiting for restart");
                self.state = BridgeState::Restarting;
            }
            Command::ServerRestarted { base_url } => self.resume_after_restart(base_url),
            Command::ServerFatal { error } => self.enter_failed(error),
            Command::PromptFailed { session_id, error } => {
                if let Some(session) = self.sessions.running_background_mut(&session_id) {
                    session.fail(error.to_string());
                    let snapshot = session.clone();
                    self.handler.handle_background(snapshot);
                }
                self.handler.handle_event(DomainEvent::session_error_event(
                    session_id,
                    error.kind(),
                    error.to_string(),
                ));
            }
        }
    }

    async fn start_if_needed(&mut self) -> Result<String, BridgeError> {
        if let Some(fatal) = &self.fatal {
            return Err(fatal.clone());
        }

        if !self.supervisor.is_running().await {
            self.register_supervisor_handlers();
            self.state = BridgeState::Starting;
        }

        match self.supervisor.start(self.config.resolved_server()).await {
            Ok(base_url) => {
                match self.base_url.as_deref() {
                    Some(current) if current == base_url => {}
                    // Replaced a dead server before the supervisor's own restart
                    // ran, so no restart notification will follow.
                    Some(_) => self.resume_after_restart(base_url.clone()),
                    None => {
                        info!(base_url = %base_url, "agent server running");
                        self.api.update_base_url(base_url.clone());
                        self.base_url = Some(base_url.clone());
                    }
                }
                self.refresh_running_state();
                Ok(base_url)
            }
            Err(err) => {
                error!(error = %err, "failed to start agent server");
                self.state = BridgeState::Stopped;
                self.base_url = None;
                self.handler
                    .handle_event(DomainEvent::error(err.kind(), err.to_string()));
                Err(err)
            }
        }
    }

    async fn submit_intent(&mut self, text: String, cwd: String) -> Result<SessionId, BridgeError> {
        let base_url = self.start_if_needed().await?;
        self.prepare_directory(&base_url, &cwd);

        let existing = self.sessions.current().cloned();
        let session_id = match existing {
            Some(session_id) => session_id,
            None => {
                let session_id = self.create_session().await?;
                self.sessions.set_current(session_id.clone());
                session_id
            }
        };
        self.refresh_running_state();

        info!(session_id = %session_id, directory = %cwd, "submitting intent");
        self.spawn_prompt(session_id.clone(), text);
        Ok(session_id)
    }

    async fn create_background_session(
        &mut self,
        text: String,
        cwd: String,
    ) -> Result<SessionId, BridgeError> {
        let base_url = self.start_if_needed().await?;
        self.prepare_directory(&base_url, &cwd);

        let session_id = self.create_session().await?;
        let session = BackgroundSession::new(session_id.clone(), text.clone());
        self.sessions.add_background(session.clone());
        self.handler.handle_background(session);

        info!(session_id = %session_id, directory = %cwd, "starting background session");
        self.spawn_prompt(session_id.clone(), text);
        Ok(session_id)
    }

    fn prepare_directory(&mut self, base_url: &str, directory: &str) {
        self.api.update_directory(directory);

        let reason = match self.last_directory.as_deref() {
            None => Some(ReconnectReason::NeverStarted),
            Some(previous) if previous != directory => Some(ReconnectReason::DirectoryChanged),
            Some(_) if self.stream.is_none() || !self.reader.has_active_stream() => {
                Some(ReconnectReason::StreamDied)
            }
            Some(_) => None,
        };
        let Some(reason) = reason else {
            return;
        };

        match reason {
            ReconnectReason::NeverStarted => {
                info!(directory, "opening event stream");
            }
            ReconnectReason::DirectoryChanged => {
                let previous = self.sessions.clear_current();
                info!(
                    directory,
                    previous_directory = ?self.last_directory,
                    previous_session = ?previous,
                    "directory changed, reconnecting event stream"
                );
            }
            ReconnectReason::StreamDied => {
                warn!(directory, "event stream is not running, reconnecting");
            }
        }

        self.stream = Some(self.reader.connect(base_url, directory));
        self.last_directory = Some(directory.to_string());
    }

    async fn create_session(&self) -> Result<SessionId, BridgeError> {
        self.api.create_session().await.map_err(|err| {
            warn!(error = %err, "failed to create session");
            self.handler
                .handle_event(DomainEvent::error(err.kind(), err.to_string()));
            err
        })
    }

    /// The prompt waits briefly for the stream to open so the first events of
    /// the run are not missed.
    fn spawn_prompt(&self, session_id: SessionId, text: String) {
        let api = self.api.clone();
        let model = self.config.model.clone();
        let agent = self.config.agent.clone();
        let ready_timeout = self.config.stream_ready_timeout;
        let connected = self.reader.connection_watch();
        let inbox = self.inbox_tx.clone();

        tokio::spawn(async move {
            if !wait_until_connected(connected, ready_timeout).await {
                warn!(session_id = %session_id, "event stream not open yet, sending prompt anyway");
            }
            let sent = api
                .send_prompt_async(&session_id, &text, model.as_deref(), agent.as_deref())
                .await;
            if let Err(error) = sent {
                warn!(session_id = %session_id, error = %error, "failed to send prompt");
                forward(&inbox, Command::PromptFailed { session_id, error });
            }
        });
    }

    fn abort(
        &self,
        session_id: Option<SessionId>,
        reply: oneshot::Sender<Result<Option<SessionId>, BridgeError>>,
    ) {
        let Some(session_id) = session_id.or_else(|| self.sessions.current().cloned()) else {
            let _ = reply.send(Ok(None));
            return;
        };
        if let Err(err) = self.require_server("session.abort") {
            let _ = reply.send(Err(err));
            return;
        }

        info!(session_id = %session_id, "aborting session");
        let api = self.api.clone();
        tokio::spawn(async move {
            let result = api.abort_session(&session_id).await.map(|()| Some(session_id));
            if let Err(err) = &result {
                warn!(error = %err, "abort failed");
            }
            let _ = reply.send(result);
        });
    }

    fn spawn_call(
        &self,
        operation: &'static str,
        reply: oneshot::Sender<Result<(), BridgeError>>,
        call: impl Future<Output = Result<(), BridgeError>> + Send + 'static,
    ) {
        if let Err(err) = self.require_server(operation) {
            let _ = reply.send(Err(err));
            return;
        }
        tokio::spawn(async move {
            let result = call.await;
            if let Err(err) = &result {
                warn!(operation, error = %err, "request failed");
            }
            let _ = reply.send(result);
        });
    }

    fn require_server(&self, operation: &str) -> Result<(), BridgeError> {
        if self.base_url.is_some() {
            Ok(())
        } else {
            Err(BridgeError::http(operation, "agent server is not running"))
        }
    }

    fn dispatch(&mut self, event: DomainEvent) {
        let Some(session_id) = event.session_id().map(str::to_owned) else {
            self.handler.handle_event(event);
            return;
        };
        if !self.sessions.accepts(&session_id) {
            trace!(session_id = %session_id, "dropping event for untracked session");
            return;
        }

        let event = event.into_prompt_if_native();
        if self.sessions.is_background_running(&session_id) {
            self.dispatch_background(&session_id, event);
        } else if self.sessions.first_prompt_sighting(&event) {
            self.handler.handle_event(event);
        }
    }

    fn dispatch_background(&mut self, session_id: &str, event: DomainEvent) {
        match event {
            DomainEvent::QuestionAsked { .. } | DomainEvent::PermissionAsked { .. } => {
                if self.sessions.first_prompt_sighting(&event) {
                    self.handler.handle_event(event);
                }
            }
            DomainEvent::Usage { .. } | DomainEvent::Error { .. } => {
                self.handler.handle_event(event);
            }
            DomainEvent::TextDelta { text, .. } => {
                if let Some(session) = self.sessions.running_background_mut(session_id) {
                    session.append_delta(&text);
                }
            }
            DomainEvent::TextComplete { text, .. } => {
                if let Some(session) = self.sessions.running_background_mut(session_id) {
                    session.complete_part(&text);
                }
            }
            DomainEvent::SessionIdle { .. } => {
                if let Some(session) = self.sessions.running_background_mut(session_id) {
                    session.finish();
                    info!(session_id, "background session completed");
                    let snapshot = session.clone();
                    self.handler.handle_background(snapshot);
                }
            }
            DomainEvent::SessionError { message, .. } => {
                if let Some(session) = self.sessions.running_background_mut(session_id) {
                    session.fail(message);
                    warn!(session_id, "background session failed");
                    let snapshot = session.clone();
                    self.handler.handle_background(snapshot);
                }
            }
            _ => {}
        }
    }

    fn resume_after_restart(&mut self, base_url: String) {
        info!(base_url = %base_url, "agent server restarted");
        self.api.update_base_url(base_url.clone());
        self.base_url = Some(base_url.clone());
        self.refresh_running_state();

        self.reader.disconnect();
        self.stream = None;
        if let Some(directory) = self.last_directory.clone() {
            info!(directory = %directory, "reconnecting event stream to restarted server");
            self.stream = Some(self.reader.connect(&base_url, &directory));
        }
    }

    fn enter_failed(&mut self, error: BridgeError) {
        error!(error = %error, "agent server failed permanently");
        self.state = BridgeState::Failed;
        self.base_url = None;
        self.reader.disconnect();
        self.stream = None;

        let message = error.to_string();
        for session in self.sessions.fail_running_background(&message) {
            self.handler.handle_background(session);
        }
        self.handler
            .handle_event(DomainEvent::error(ErrorKind::ServerFatal, message));
        self.fatal = Some(error);
    }

    async fn stop(&mut self) {
        self.reader.disconnect();
        self.stream = None;
        self.supervisor.stop().await;
        self.base_url = None;
        if self.state != BridgeState::Failed {
            self.state = BridgeState::Stopped;
        }
    }

    async fn restart(&mut self) -> Result<String, BridgeError> {
        info!("restarting bridge");
        self.stop().await;
        self.fatal = None;
        self.state = BridgeState::Restarting;
        self.start_if_needed().await
    }

    fn refresh_running_state(&mut self) {
        if self.base_url.is_none() {
            return;
        }
        self.state = if self.sessions.current().is_some() {
            BridgeState::RunningSessionActive
        } else {
            BridgeState::RunningSessionless
        };
    }

    fn register_supervisor_handlers(&self) {
        let inbox = self.inbox_tx.clone();
        self.supervisor.set_exit_handler(move |message| {
            forward(&inbox, Command::ServerExited { message });
        });
        let inbox = self.inbox_tx.clone();
        self.supervisor.set_restart_handler(move |base_url| {
            forward(&inbox, Command::ServerRestarted { base_url });
        });
        let inbox = self.inbox_tx.clone();
        self.supervisor.set_fatal_handler(move |error| {
            forward(&inbox, Command::ServerFatal { error });
        });
    }

    fn status(&self) -> BridgeStatus {
        BridgeStatus {
            state: self.state,
            server_url: self.base_url.clone(),
            directory: self.last_directory.clone(),
            current_session: self.sessions.current().cloned(),
            active_sessions: self.sessions.active_sessions(),
            stream_active: self.reader.has_active_stream(),
            stream_connected: self.reader.is_connected(),
            background: self.sessions.background_sessions(),
        }
    }
}

fn forward(inbox: &mpsc::WeakUnboundedSender<Command>, command: Command) {
    if let Some(inbox) = inbox.upgrade() {
        let _ = inbox.send(command);
    }
}

async fn next_stream_event(stream: &mut Option<EventStream>) -> Option<DomainEvent> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn wait_until_connected(mut connected: watch::Receiver<bool>, limit: Duration) -> bool {
    matches!(
        timeout(limit, connected.wait_for(|open| *open)).await,
        Ok(Ok(_))
    )
}
