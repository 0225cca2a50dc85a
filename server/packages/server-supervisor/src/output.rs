use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::watch;
use url::Url;

pub(crate) type SharedLog = Arc<StdMutex<File>>;

pub(crate) fn open_server_log(log_dir: &Path) -> std::io::Result<SharedLog> {
    fs::create_dir_all(log_dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("server.log"))?;
    Ok(Arc::new(StdMutex::new(file)))
}

/// Copies one child output pipe into the log and publishes the first url it sees.
pub(crate) fn spawn_output_loop<R>(
    reader: R,
    stream: &'static str,
    pid: u32,
    announced: watch::Sender<Option<String>>,
    log: Option<SharedLog>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(err) => {
                    tracing::debug!(pid, stream, error = %err, "agent server output closed");
                    break;
                }
            };

            tracing::debug!(pid, stream, line = %line, "agent server output");
            if let Some(log) = &log {
                if let Ok(mut file) = log.lock() {
                    let _ = writeln!(file, "[{pid} {stream}] {line}");
                }
            }

            if announced.borrow().is_none() {
                if let Some(url) = parse_announced_url(&line) {
                    tracing::info!(pid, url = %url, "agent server announced url");
                    announced.send_replace(Some(url));
                }
            }
        }
    });
}

/// Finds the first `http(s)://host:port` in a line and returns its origin.
/// Urls without an explicit port are ignored.
pub fn parse_announced_url(line: &str) -> Option<String> {
    let start = line.find("http://").or_else(|| line.find("https://"))?;
    let candidate: String = line[start..]
        .chars()
        .take_while(|c| !c.is_whitespace())
        .collect();
    let candidate = candidate.trim_end_matches(['/', '.', ',', ')', '"', '\'']);
    let parsed = Url::parse(candidate).ok()?;
    let host = parsed.host_str()?;
    let port = parsed.port()?;
    Some(format!("{}://{}:{}", parsed.scheme(), host, port))
}
