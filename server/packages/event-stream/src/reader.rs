use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use agent_bridge_error::BridgeError;
use agent_bridge_event_schema::{directory_header_value, DomainEvent, DIRECTORY_HEADER};
use futures::{Stream, StreamExt};
use reqwest::header::ACCEPT;
use reqwest::{Client, StatusCode};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, MissedTickBehavior};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{error, info, warn};

use crate::backoff::{Backoff, ReconnectPolicy};
use crate::throttle::{EventPipeline, DEFAULT_THROTTLE_INTERVAL};

/// Events from one logical connection. Ends when the reader disconnects or
/// gives up reconnecting. Dropping it stops the reconnect loop.
pub struct EventStream {
    inner: UnboundedReceiverStream<DomainEvent>,
}

impl Stream for EventStream {
    type Item = DomainEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Owns the single live SSE connection to the agent server.
pub struct EventStreamReader {
    client: Client,
    policy: ReconnectPolicy,
    throttle_interval: Duration,
    task: Option<JoinHandle<()>>,
    connected: Arc<watch::Sender<bool>>,
    directory: Option<String>,
}

impl Default for EventStreamReader {
    fn default() -> Self {
        Self::new(ReconnectPolicy::default(), DEFAULT_THROTTLE_INTERVAL)
    }
}

impl EventStreamReader {
    pub fn new(policy: ReconnectPolicy, throttle_interval: Duration) -> Self {
        Self {
            client: Client::new(),
            policy,
            throttle_interval,
            task: None,
            connected: Arc::new(watch::channel(false).0),
            directory: None,
        }
    }

    /// Replaces any previous connection and starts a new reconnect loop with
    /// a fresh backoff.
    pub fn connect(&mut self, base_url: &str, directory: &str) -> EventStream {
        self.disconnect();

        let (tx, rx) = mpsc::unbounded_channel();
        let connected = Arc::new(watch::channel(false).0);
        let task = StreamTask {
            client: self.client.clone(),
            url: format!("{}/event", base_url.trim_end_matches('/')),
            directory: directory.to_string(),
            policy: self.policy.clone(),
            throttle_interval: self.throttle_interval.max(Duration::from_millis(1)),
            connected: connected.clone(),
            tx,
        };

        info!(base_url, directory, "connecting event stream");
        self.connected = connected;
        self.directory = Some(directory.to_string());
        self.task = Some(tokio::spawn(task.run()));

        EventStream {
            inner: UnboundedReceiverStream::new(rx),
        }
    }

    pub fn disconnect(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            info!(directory = ?self.directory, "event stream disconnected");
        }
        self.connected.send_replace(false);
    }

    /// The reconnect loop is alive, possibly sleeping between attempts.
    pub fn has_active_stream(&self) -> bool {
        self.task
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    /// An HTTP response is currently open.
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Follows the open/closed state of the current connection only; a later
    /// `connect` starts a new channel.
    pub fn connection_watch(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    pub fn directory(&self) -> Option<&str> {
        self.directory.as_deref()
    }
}

impl Drop for EventStreamReader {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

enum StreamEnd {
    Ended,
    Failed(BridgeError),
    ReceiverClosed,
}

struct StreamTask {
    client: Client,
    url: String,
    directory: String,
    policy: ReconnectPolicy,
    throttle_interval: Duration,
    connected: Arc<watch::Sender<bool>>,
    tx: mpsc::UnboundedSender<DomainEvent>,
}

impl StreamTask {
    async fn run(self) {
        let mut backoff = Backoff::new(&self.policy);
        let mut failures: u32 = 0;

        loop {
            match self.open().await {
                Ok(response) => {
                    failures = 0;
                    self.connected.send_replace(true);
                    info!(url = %self.url, directory = %self.directory, "event stream connected");

                    let end = self.consume(response).await;
                    self.connected.send_replace(false);
                    match end {
                        StreamEnd::ReceiverClosed => return,
                        StreamEnd::Ended => warn!(url = %self.url, "event stream ended by server"),
                        StreamEnd::Failed(err) => warn!(url = %self.url, error = %err, "event stream failed"),
                    }
                }
                Err(err) => warn!(url = %self.url, error = %err, "event stream connect failed"),
            }

            if self.tx.is_closed() {
                return;
            }

            failures += 1;
            if failures >= self.policy.max_consecutive_failures {
                let err = BridgeError::StreamRetriesExhausted { attempts: failures };
                error!(url = %self.url, attempts = failures, "event stream giving up");
                let _ = self.tx.send(DomainEvent::error(err.kind(), err.to_string()));
                return;
            }

            let delay = backoff.next_delay();
            info!(
                delay_ms = delay.as_millis() as u64,
                attempt = failures,
                directory = %self.directory,
                "reconnecting event stream"
            );
            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.tx.closed() => return,
            }
        }
    }

    async fn open(&self) -> Result<reqwest::Response, BridgeError> {
        let response = self
            .client
            .get(&self.url)
            .header(ACCEPT, "text/event-stream")
            .header(DIRECTORY_HEADER, directory_header_value(&self.directory))
            .send()
            .await
            .map_err(|err| BridgeError::StreamIo {
                message: err.to_string(),
            })?;

        if response.status() != StatusCode::OK {
            return Err(BridgeError::StreamStatus {
                status: response.status().as_u16(),
            });
        }
        Ok(response)
    }

    async fn consume(&self, response: reqwest::Response) -> StreamEnd {
        let mut bytes = response.bytes_stream();
        let mut pipeline = EventPipeline::new(self.throttle_interval);
        let mut ticker = tokio::time::interval(pipeline.throttle_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let end = loop {
            tokio::select! {
                chunk = bytes.next() => match chunk {
                    Some(Ok(chunk)) => {
                        if !self.emit(pipeline.feed(&chunk)) {
                            return StreamEnd::ReceiverClosed;
                        }
                    }
                    Some(Err(err)) => {
                        break StreamEnd::Failed(BridgeError::StreamIo {
                            message: err.to_string(),
                        });
                    }
                    None => break StreamEnd::Ended,
                },
                _ = ticker.tick() => {
                    if !self.emit(pipeline.tick(Instant::now())) {
                        return StreamEnd::ReceiverClosed;
                    }
                }
                _ = self.tx.closed() => return StreamEnd::ReceiverClosed,
            }
        };

        if pipeline.dropped_frames() > 0 {
            warn!(dropped = pipeline.dropped_frames(), "event stream dropped undecodable frames");
        }
        if !self.emit(pipeline.finish()) {
            return StreamEnd::ReceiverClosed;
        }
        end
    }

    fn emit(&self, events: Vec<DomainEvent>) -> bool {
        events.into_iter().all(|event| self.tx.send(event).is_ok())
    }
}
