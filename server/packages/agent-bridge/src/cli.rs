use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use agent_bridge_error::{BridgeError, ErrorKind};
use agent_bridge_event_schema::{BackgroundSession, DomainEvent, PermissionReply, SessionId};
use agent_bridge_event_stream::{EventStreamReader, ReconnectPolicy, DEFAULT_THROTTLE_INTERVAL};
use agent_bridge_server_supervisor::{ServerConfiguration, SupervisorConfig};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::BridgeConfig;
use crate::coordinator::{Bridge, BridgeHandle};
use crate::handler::BridgeUpdate;

const DEFAULT_SERVER_BIN: &str = "opencode";

#[derive(Parser, Debug)]
#[command(name = "agent-bridge", bin_name = "agent-bridge")]
#[command(about = "Drive a local coding agent server and stream its events", version)]
#[command(arg_required_else_help = true)]
pub struct AgentBridgeCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the agent server, submit a prompt and print events as JSON lines.
    Run(RunArgs),
    /// Print the event stream of an already running agent server.
    Watch(WatchArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Agent server binary.
    #[arg(long = "server-bin", env = "AGENT_BRIDGE_SERVER_BIN", default_value = DEFAULT_SERVER_BIN)]
    server_bin: PathBuf,

    /// Argument passed to the server binary. Repeat for several.
    #[arg(
        long = "server-arg",
        allow_hyphen_values = true,
        default_values = ["serve", "--port", "0"]
    )]
    server_args: Vec<String>,

    /// Extra environment for the server as KEY=VALUE.
    #[arg(long = "server-env", value_parser = parse_key_value)]
    server_env: Vec<(String, String)>,

    /// Working directory of the server process. Defaults to the home directory.
    #[arg(long = "server-cwd")]
    server_cwd: Option<PathBuf>,

    #[arg(long = "max-restarts", env = "AGENT_BRIDGE_MAX_RESTARTS", default_value_t = 3)]
    max_restarts: u32,

    /// Directory for the server's output log.
    #[arg(long = "log-dir", env = "AGENT_BRIDGE_LOG_DIR")]
    log_dir: Option<PathBuf>,

    #[arg(long = "startup-timeout-secs", default_value_t = 10)]
    startup_timeout_secs: u64,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    server: ServerArgs,

    /// Project directory the prompt applies to. Defaults to the current directory.
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Model as provider/model.
    #[arg(long, env = "AGENT_BRIDGE_MODEL")]
    model: Option<String>,

    #[arg(long, env = "AGENT_BRIDGE_AGENT")]
    agent: Option<String>,

    /// Run as a background session and print only its final result.
    #[arg(long)]
    background: bool,

    /// Allow every permission request once and decline every question.
    #[arg(long = "auto-approve")]
    auto_approve: bool,

    #[arg(required = true, num_args = 1..)]
    prompt: Vec<String>,
}

#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Base url of the running server.
    #[arg(long)]
    url: String,

    #[arg(long)]
    directory: PathBuf,

    /// Only print events for this session.
    #[arg(long)]
    session: Option<String>,

    /// Also print heartbeats.
    #[arg(long)]
    heartbeats: bool,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("bridge error: {0}")]
    Bridge(#[from] BridgeError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("session {session_id} failed: {message}")]
    SessionFailed { session_id: String, message: String },
    #[error("invalid directory: {0}")]
    InvalidDirectory(String),
}

pub fn run_agent_bridge() -> Result<(), CliError> {
    let cli = AgentBridgeCli::parse();
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    run_command(&cli.command)
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
    Ok(())
}

pub fn run_command(command: &Command) -> Result<(), CliError> {
    match command {
        Command::Run(args) => run_prompt(args),
        Command::Watch(args) => run_watch(args),
    }
}

impl ServerArgs {
    fn server_configuration(&self) -> ServerConfiguration {
        let mut server = ServerConfiguration::new(&self.server_bin).with_args(&self.server_args);
        for (key, value) in &self.server_env {
            server = server.with_env(key, value);
        }
        if let Some(directory) = &self.server_cwd {
            server = server.with_working_directory(directory);
        }
        server
    }

    fn supervisor_config(&self) -> SupervisorConfig {
        let mut supervisor = SupervisorConfig {
            max_restarts: self.max_restarts,
            startup_timeout: Duration::from_secs(self.startup_timeout_secs),
            ..SupervisorConfig::default()
        };
        if let Some(log_dir) = &self.log_dir {
            supervisor.log_dir = Some(log_dir.clone());
        }
        supervisor
    }
}

impl RunArgs {
    fn bridge_config(&self) -> BridgeConfig {
        let mut config = BridgeConfig::new(self.server.server_configuration());
        config.supervisor = self.server.supervisor_config();
        config.model = self.model.clone();
        config.agent = self.agent.clone();
        config
    }
}

fn run_prompt(args: &RunArgs) -> Result<(), CliError> {
    let directory = match &args.cwd {
        Some(directory) => directory.clone(),
        None => std::env::current_dir()?,
    };
    let directory = directory
        .to_str()
        .ok_or_else(|| CliError::InvalidDirectory(directory.display().to_string()))?
        .to_string();
    let prompt = args.prompt.join(" ");
    let config = args.bridge_config();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let (tx, mut updates) = mpsc::unbounded_channel();
        let bridge = Bridge::spawn(config, tx);

        let submitted = if args.background {
            bridge.create_background_session(prompt, directory).await
        } else {
            bridge.submit_intent(prompt, directory).await
        };
        let outcome = match submitted {
            Ok(session_id) => {
                tracing::info!(session_id = %session_id, "prompt submitted");
                follow_session(&bridge, &mut updates, &session_id, args.auto_approve).await
            }
            Err(err) => {
                if let Err(print_err) = drain_updates(&mut updates) {
                    tracing::warn!(error = %print_err, "failed to print pending events");
                }
                Err(CliError::from(err))
            }
        };

        if let Err(err) = bridge.shutdown().await {
            tracing::warn!(error = %err, "bridge shutdown failed");
        }
        outcome
    })
}

/// Prints updates until the session finishes. Ctrl-C aborts the session.
async fn follow_session(
    bridge: &BridgeHandle,
    updates: &mut mpsc::UnboundedReceiver<BridgeUpdate>,
    session_id: &SessionId,
    auto_approve: bool,
) -> Result<(), CliError> {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            update = updates.recv() => {
                let Some(update) = update else {
                    return Err(BridgeError::BridgeClosed.into());
                };
                print_update(&update)?;
                if auto_approve {
                    answer_prompt(bridge, &update).await;
                }
                if let Some(outcome) = session_outcome(&update, session_id) {
                    return outcome;
                }
            }
            _ = &mut ctrl_c => {
                tracing::info!(session_id = %session_id, "interrupted, aborting session");
                bridge.abort(Some(session_id.clone())).await?;
                return Ok(());
            }
        }
    }
}

async fn answer_prompt(bridge: &BridgeHandle, update: &BridgeUpdate) {
    let result = match update {
        BridgeUpdate::Event(DomainEvent::PermissionAsked { request, .. }) => {
            bridge
                .reply_to_permission(request.request_id.clone(), PermissionReply::AllowOnce)
                .await
        }
        BridgeUpdate::Event(DomainEvent::QuestionAsked { request, .. }) => {
            bridge.reject_question(request.request_id.clone()).await
        }
        _ => return,
    };
    if let Err(err) = result {
        tracing::warn!(error = %err, "failed to answer prompt");
    }
}

/// `Some` once `update` ends the run of `session_id`.
fn session_outcome(update: &BridgeUpdate, session_id: &str) -> Option<Result<(), CliError>> {
    let failed = |message: &str| {
        Some(Err(CliError::SessionFailed {
            session_id: session_id.to_string(),
            message: message.to_string(),
        }))
    };

    match update {
        BridgeUpdate::Background(session) if session.session_id == session_id => {
            if session.is_running() {
                None
            } else if let Some(error) = &session.error {
                failed(error)
            } else {
                Some(Ok(()))
            }
        }
        BridgeUpdate::Event(event) => match event {
            DomainEvent::SessionIdle { session_id: id } if id == session_id => Some(Ok(())),
            DomainEvent::SessionError { session_id: id, message, .. } if id == session_id => {
                failed(message)
            }
            DomainEvent::Error {
                session_id: Some(id),
                message,
                ..
            } if id == session_id => failed(message),
            DomainEvent::Error { kind, message, .. } if kind.is_fatal() => failed(message),
            // The reader gave up, so no further events will arrive for this run.
            DomainEvent::Error {
                kind: ErrorKind::StreamFailure,
                session_id: None,
                message,
            } => failed(message),
            _ => None,
        },
        BridgeUpdate::Background(_) => None,
    }
}

fn drain_updates(updates: &mut mpsc::UnboundedReceiver<BridgeUpdate>) -> Result<(), CliError> {
    while let Ok(update) = updates.try_recv() {
        print_update(&update)?;
    }
    Ok(())
}

#[derive(Serialize)]
struct BackgroundLine<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    session: &'a BackgroundSession,
}

fn print_update(update: &BridgeUpdate) -> Result<(), CliError> {
    let line = match update {
        BridgeUpdate::Event(DomainEvent::Heartbeat) => return Ok(()),
        BridgeUpdate::Event(event) => serde_json::to_string(event)?,
        BridgeUpdate::Background(session) => serde_json::to_string(&BackgroundLine {
            kind: "background",
            session,
        })?,
    };
    write_stdout_line(&line)
}

fn run_watch(args: &WatchArgs) -> Result<(), CliError> {
    let directory = args
        .directory
        .to_str()
        .ok_or_else(|| CliError::InvalidDirectory(args.directory.display().to_string()))?
        .to_string();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let mut reader =
            EventStreamReader::new(ReconnectPolicy::default(), DEFAULT_THROTTLE_INTERVAL);
        let mut events = reader.connect(&args.url, &directory);
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                event = events.next() => {
                    let Some(event) = event else {
                        break;
                    };
                    if !args.heartbeats && matches!(event, DomainEvent::Heartbeat) {
                        continue;
                    }
                    if let (Some(filter), Some(id)) = (&args.session, event.session_id()) {
                        if filter != id {
                            continue;
                        }
                    }
                    write_stdout_line(&serde_json::to_string(&event)?)?;
                }
                _ = &mut ctrl_c => break,
            }
        }

        reader.disconnect();
        Ok::<(), CliError>(())
    })
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{raw}`"))?;
    if key.is_empty() {
        return Err(format!("empty key in `{raw}`"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn write_stdout_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stdout();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}
