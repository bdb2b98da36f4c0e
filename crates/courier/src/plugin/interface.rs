//! Interface task loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use super::lifecycle::Shared;
use super::{COMMAND_ERROR_LEVEL, Plugin, shutdown_signalled};
use crate::channel::{Envelope, PortEnds, Reply};
use crate::codec::{Command, ResponseBuffer};
use crate::debug::Category;

const IDENTITY: &str = "identity";
const STOP: &str = "stop";

enum Step {
    Continue,
    Exit,
}

/// Answer commands for `shared`'s plugin until it is told to stop.
pub(crate) async fn run<P: Plugin>(
    shared: Arc<Shared<P>>,
    mut ends: PortEnds,
    mut shutdown: watch::Receiver<bool>,
    buffer_size: usize,
    grace: Duration,
) {
    let mut response = ResponseBuffer::with_capacity(buffer_size);
    tracing::debug!(plugin = %shared.name, "Interface task running");

    loop {
        let envelope = tokio::select! {
            biased;
            _ = shutdown_signalled(&mut shutdown) => break,
            received = ends.commands.recv() => match received {
                Some(envelope) => envelope,
                None => break,
            },
        };

        response.clear();
        if let Step::Exit =
            handle_one(&shared, &mut ends, &mut shutdown, &mut response, envelope, grace).await
        {
            break;
        }
    }

    drain(&shared, &mut ends);
}

async fn handle_one<P: Plugin>(
    shared: &Arc<Shared<P>>,
    ends: &mut PortEnds,
    shutdown: &mut watch::Receiver<bool>,
    response: &mut ResponseBuffer,
    envelope: Envelope<String>,
    grace: Duration,
) -> Step {
    let Envelope { seq, body } = envelope;
    tracing::trace!(plugin = %shared.name, seq, command = %body, "Command received");

    let command = match Command::parse(&body) {
        Ok(command) => command,
        Err(e) => {
            response.set(&format!("malformed_command({})", e.reason()));
            shared.directory.log(
                COMMAND_ERROR_LEVEL,
                Category::Error,
                format_args!("{}: malformed_command({})", shared.name, body),
            );
            let text = response.as_str().to_string();
            return reply(shared, ends, shutdown, seq, Reply::Message(text)).await;
        }
    };

    match command.function() {
        IDENTITY => {
            response.set(&shared.name);
        }
        STOP => {
            if let Some(running) = shared.begin_stop() {
                shared.finish_stop(running, false).await;
            }
            // The plugin is gone; the caller still gets its answer.
            let _ = tokio::time::timeout(
                grace,
                ends.responses.send(Envelope {
                    seq,
                    body: Reply::Terminated,
                }),
            )
            .await;
            return Step::Exit;
        }
        function => {
            if !shared.plugin.handle(&command, response).await {
                response.set(&format!("unknown_function({})", function));
                shared.directory.log(
                    COMMAND_ERROR_LEVEL,
                    Category::Error,
                    format_args!("{}: unknown_function({})", shared.name, function),
                );
            }
        }
    }

    if response.is_truncated() {
        tracing::debug!(
            plugin = %shared.name,
            capacity = response.capacity(),
            "Response truncated"
        );
    }
    let text = response.as_str().to_string();
    reply(shared, ends, shutdown, seq, Reply::Message(text)).await
}

async fn reply<P: Plugin>(
    shared: &Arc<Shared<P>>,
    ends: &mut PortEnds,
    shutdown: &mut watch::Receiver<bool>,
    seq: u64,
    body: Reply,
) -> Step {
    tokio::select! {
        biased;
        sent = ends.responses.send(Envelope { seq, body }) => {
            if sent.is_err() {
                tracing::debug!(plugin = %shared.name, seq, "Caller went away before the reply");
            }
            Step::Continue
        }
        _ = shutdown_signalled(shutdown) => Step::Exit,
    }
}

/// Close the command channel and tell anyone still queued that the plugin is gone.
fn drain<P: Plugin>(shared: &Shared<P>, ends: &mut PortEnds) {
    ends.commands.close();
    let mut dropped = 0usize;
    while let Ok(envelope) = ends.commands.try_recv() {
        dropped += 1;
        let _ = ends.responses.try_send(Envelope {
            seq: envelope.seq,
            body: Reply::Terminated,
        });
    }
    tracing::debug!(plugin = %shared.name, dropped, "Interface task exiting");
}
