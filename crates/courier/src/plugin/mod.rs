//! Plugins
//!
//! A plugin is a named pair of tasks: a worker running the plugin's own logic
//! and an interface task answering text commands on the plugin's behalf. Both
//! are created by [`PluginHost::start`] and removed by [`PluginHost::stop`].
//!
//! # Lifecycle
//!
//! ```text
//! Idle → Starting → Running → Stopping → Idle
//! ```
//!
//! Starting creates the channel pair, spawns the worker, spawns the interface
//! task and registers with the directory. If any step fails everything done so
//! far is undone and the host is back in `Idle`.
//!
//! # Built-in commands
//!
//! - `identity()` replies with the plugin's name
//! - `stop()` stops the plugin and replies [`Reply::Terminated`](crate::Reply)
//!
//! Everything else goes to [`Plugin::handle`].

mod interface;
mod lifecycle;

pub use lifecycle::*;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::channel::{Reply, Timeout};
use crate::codec::{Command, DEFAULT_RESPONSE_CAPACITY, ResponseBuffer};
use crate::debug::Category;
use crate::directory::Directory;
use crate::error::DispatchError;

/// Debug level at which unknown and malformed commands are reported.
pub const COMMAND_ERROR_LEVEL: u8 = 1;

// ─────────────────────────────────────────────────────────────────────────────
// Plugin Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Plugin-specific command handling.
///
/// The interface task calls `handle` for every command that is not built in.
/// Write the reply into `response` and return `true`, or return `false` to
/// have the command reported as `unknown_function(<name>)`.
///
/// State shared with the worker lives in `self`, behind whatever interior
/// mutability the plugin needs; the worker sees the same instance through
/// [`WorkerContext::plugin`].
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    async fn handle(&self, command: &Command, response: &mut ResponseBuffer) -> bool {
        let _ = (command, response);
        false
    }
}

/// A plugin with no commands of its own.
#[async_trait]
impl Plugin for () {}

// ─────────────────────────────────────────────────────────────────────────────
// Start Options
// ─────────────────────────────────────────────────────────────────────────────

/// Parameters for starting a plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOptions {
    /// Worker task stack size, in kernel units.
    pub stack_size: usize,
    /// Interface task stack size, in kernel units.
    pub interface_stack_size: usize,
    /// Capacity of the reply buffer in bytes.
    pub interface_buffer_size: usize,
    /// Depth of the command channel. At least 1.
    pub queue_depth: usize,
    pub priority: u8,
    pub core: Option<usize>,
    /// How long `stop` waits for each task to exit before deleting it.
    pub shutdown_grace: Duration,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            stack_size: 64,
            interface_stack_size: 256,
            interface_buffer_size: DEFAULT_RESPONSE_CAPACITY,
            queue_depth: 1,
            priority: 1,
            core: None,
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

impl StartOptions {
    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub fn with_interface_stack_size(mut self, stack_size: usize) -> Self {
        self.interface_stack_size = stack_size;
        self
    }

    pub fn with_interface_buffer_size(mut self, size: usize) -> Self {
        self.interface_buffer_size = size;
        self
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn on_core(mut self, core: usize) -> Self {
        self.core = Some(core);
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker Context
// ─────────────────────────────────────────────────────────────────────────────

/// Everything a worker task gets to work with.
pub struct WorkerContext<P: Plugin> {
    name: Arc<str>,
    plugin: Arc<P>,
    directory: Arc<Directory>,
    shutdown: watch::Receiver<bool>,
}

impl<P: Plugin> WorkerContext<P> {
    pub(crate) fn new(
        name: Arc<str>,
        plugin: Arc<P>,
        directory: Arc<Directory>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            name,
            plugin,
            directory,
            shutdown,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn plugin(&self) -> &Arc<P> {
        &self.plugin
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    /// True once the plugin has been asked to stop.
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves when the plugin is asked to stop.
    pub async fn shutdown(&mut self) {
        shutdown_signalled(&mut self.shutdown).await;
    }

    /// Send a command to another plugin by name.
    pub async fn dispatch(
        &self,
        target: &str,
        text: &str,
        timeout: impl Into<Timeout>,
    ) -> Result<Reply, DispatchError> {
        self.directory.dispatch(target, text, timeout).await
    }

    /// Log through the directory's debug sink, prefixed with this plugin's name.
    pub fn log(&self, required: u8, category: Category, message: impl std::fmt::Display) -> bool {
        self.directory
            .log(required, category, format_args!("{}: {}", self.name, message))
    }
}

/// Wait until `rx` reads `true` or its sender is gone.
pub(crate) async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}
