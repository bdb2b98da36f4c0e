//! Channel Pair
//!
//! Every plugin owns a bounded command channel and a single-slot response
//! channel. Callers talk to a plugin through its [`PluginPort`], which holds
//! the sending end of the command channel and the receiving end of the
//! response channel. The interface task holds the other two ends.
//!
//! A port serves one caller at a time. Each command is tagged with a sequence
//! number and the matching response carries it back, so a response that
//! arrives after its caller gave up is discarded instead of being handed to
//! the next caller.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};

use crate::error::DispatchError;

// ─────────────────────────────────────────────────────────────────────────────
// Timeout
// ─────────────────────────────────────────────────────────────────────────────

/// How long a caller is prepared to wait for a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    Forever,
    After(Duration),
}

impl Timeout {
    pub fn from_millis(ms: u64) -> Self {
        Timeout::After(Duration::from_millis(ms))
    }

    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Timeout::Forever => None,
            Timeout::After(d) => Some(*d),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Timeout::After(d)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reply
// ─────────────────────────────────────────────────────────────────────────────

/// What a plugin sent back for a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Text written by the plugin's handler.
    Message(String),
    /// The plugin stopped; it will not answer further commands.
    Terminated,
}

impl Reply {
    /// Response text. Empty for `Terminated`.
    pub fn as_str(&self) -> &str {
        match self {
            Reply::Message(text) => text,
            Reply::Terminated => "",
        }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, Reply::Terminated)
    }

    pub fn into_string(self) -> String {
        match self {
            Reply::Message(text) => text,
            Reply::Terminated => String::new(),
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Message(text) => f.write_str(text),
            Reply::Terminated => f.write_str("<terminated>"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Envelopes
// ─────────────────────────────────────────────────────────────────────────────

/// A message on either channel, tagged with the request it belongs to.
#[derive(Debug)]
pub(crate) struct Envelope<T> {
    pub seq: u64,
    pub body: T,
}

pub(crate) type CommandEnvelope = Envelope<String>;
pub(crate) type ResponseEnvelope = Envelope<Reply>;

/// The interface task's ends of the channel pair.
pub(crate) struct PortEnds {
    pub commands: mpsc::Receiver<CommandEnvelope>,
    pub responses: mpsc::Sender<ResponseEnvelope>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Plugin Port
// ─────────────────────────────────────────────────────────────────────────────

/// Caller-side ends of a plugin's channel pair.
pub struct PluginPort {
    name: String,
    commands: mpsc::Sender<CommandEnvelope>,
    /// Held for the whole exchange, which serialises callers.
    responses: Mutex<mpsc::Receiver<ResponseEnvelope>>,
    next_seq: AtomicU64,
}

/// Create a plugin's channel pair. `depth` must be at least 1.
pub(crate) fn channel_pair(name: &str, depth: usize) -> (Arc<PluginPort>, PortEnds) {
    let (command_tx, command_rx) = mpsc::channel(depth);
    let (response_tx, response_rx) = mpsc::channel(1);

    let port = Arc::new(PluginPort {
        name: name.to_string(),
        commands: command_tx,
        responses: Mutex::new(response_rx),
        next_seq: AtomicU64::new(1),
    });
    let ends = PortEnds {
        commands: command_rx,
        responses: response_tx,
    };
    (port, ends)
}

impl PluginPort {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True once the interface task has dropped its command receiver.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Send `text` and wait for the response to it.
    ///
    /// The deadline covers waiting for earlier callers, queueing the command
    /// and waiting for the reply.
    pub async fn request(&self, text: &str, timeout: Timeout) -> Result<Reply, DispatchError> {
        match timeout {
            Timeout::Forever => self.exchange(text).await,
            Timeout::After(limit) => tokio::time::timeout(limit, self.exchange(text))
                .await
                .map_err(|_| {
                    tracing::debug!(plugin = %self.name, ?limit, "Command timed out");
                    DispatchError::Timeout(limit)
                })?,
        }
    }

    async fn exchange(&self, text: &str) -> Result<Reply, DispatchError> {
        let mut responses = self.responses.lock().await;
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);

        self.commands
            .send(Envelope {
                seq,
                body: text.to_string(),
            })
            .await
            .map_err(|_| DispatchError::Closed(self.name.clone()))?;

        loop {
            match responses.recv().await {
                Some(response) if response.seq == seq => return Ok(response.body),
                Some(stale) => {
                    tracing::debug!(
                        plugin = %self.name,
                        seq = stale.seq,
                        "Discarding stale response"
                    );
                }
                None => return Err(DispatchError::Closed(self.name.clone())),
            }
        }
    }
}

impl fmt::Debug for PluginPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginPort")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    /// Answers each command with its own text after `delay`.
    fn spawn_echo(mut ends: PortEnds, delay: Duration) {
        tokio::spawn(async move {
            while let Some(cmd) = ends.commands.recv().await {
                tokio::time::sleep(delay).await;
                let reply = Envelope {
                    seq: cmd.seq,
                    body: Reply::Message(cmd.body),
                };
                if ends.responses.send(reply).await.is_err() {
                    break;
                }
            }
        });
    }

    #[tokio::test]
    async fn test_request_receives_matching_response() {
        let (port, ends) = channel_pair("echo", 1);
        spawn_echo(ends, Duration::ZERO);

        let reply = port.request("ping()", Timeout::Forever).await.unwrap();
        assert_eq!(reply, Reply::Message("ping()".into()));
    }

    #[tokio::test]
    async fn test_request_times_out_within_deadline() {
        let (port, _ends) = channel_pair("silent", 1);

        let started = Instant::now();
        let result = port.request("ping()", Timeout::from_millis(30)).await;
        assert_eq!(result, Err(DispatchError::Timeout(Duration::from_millis(30))));
        assert!(started.elapsed() < Duration::from_secs(1));

        // The port is usable again afterwards
        let result = port.request("again()", Timeout::from_millis(30)).await;
        assert!(matches!(result, Err(DispatchError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_late_response_is_not_delivered_to_next_caller() {
        let (port, ends) = channel_pair("slow", 2);
        spawn_echo(ends, Duration::from_millis(50));

        let first = port.request("first()", Timeout::from_millis(10)).await;
        assert!(matches!(first, Err(DispatchError::Timeout(_))));

        let second = port.request("second()", Timeout::Forever).await.unwrap();
        assert_eq!(second.as_str(), "second()");
    }

    #[tokio::test]
    async fn test_closed_port_reports_closed() {
        let (port, ends) = channel_pair("gone", 1);
        drop(ends);

        assert!(port.is_closed());
        let result = port.request("ping()", Timeout::Forever).await;
        assert_eq!(result, Err(DispatchError::Closed("gone".into())));
    }

    #[test]
    fn test_terminated_reply_has_empty_text() {
        assert_eq!(Reply::Terminated.as_str(), "");
        assert!(Reply::Terminated.is_terminated());
        assert_eq!(Reply::Message("A".into()).into_string(), "A");
    }
}
