//! Plugin Host
//!
//! Owns one plugin's tasks and channels and moves them through the lifecycle.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use super::{Plugin, StartOptions, WorkerContext, interface};
use crate::channel::{PluginPort, Reply, Timeout, channel_pair};
use crate::codec::MAX_FUNCTION_LEN;
use crate::directory::Directory;
use crate::error::{DispatchError, StartError};
use crate::kernel::{Kernel, TaskFuture, TaskHandle, TaskInfo, TaskSpec};

/// Prefix of the interface task's name.
pub const INTERFACE_PREFIX: &str = "i_";

// ─────────────────────────────────────────────────────────────────────────────
// Lifecycle State
// ─────────────────────────────────────────────────────────────────────────────

/// Where a plugin is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Idle => write!(f, "idle"),
            LifecycleState::Starting => write!(f, "starting"),
            LifecycleState::Running => write!(f, "running"),
            LifecycleState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Resources that exist only while the plugin runs.
pub(crate) struct Running {
    worker: TaskHandle,
    interface: TaskHandle,
    port: Arc<PluginPort>,
    shutdown_tx: watch::Sender<bool>,
    grace: Duration,
}

enum Phase {
    Idle,
    Starting,
    Running(Running),
    Stopping,
}

impl Phase {
    fn state(&self) -> LifecycleState {
        match self {
            Phase::Idle => LifecycleState::Idle,
            Phase::Starting => LifecycleState::Starting,
            Phase::Running(_) => LifecycleState::Running,
            Phase::Stopping => LifecycleState::Stopping,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared State
// ─────────────────────────────────────────────────────────────────────────────

/// State shared between the host and the plugin's interface task.
pub(crate) struct Shared<P: Plugin> {
    pub(crate) name: Arc<str>,
    interface_name: String,
    pub(crate) plugin: Arc<P>,
    pub(crate) directory: Arc<Directory>,
    kernel: Arc<dyn Kernel>,
    phase: Mutex<Phase>,
}

impl<P: Plugin> Shared<P> {
    /// Take the running resources, moving to `Stopping`. `None` if the plugin
    /// is not running or someone else is already stopping it.
    pub(crate) fn begin_stop(&self) -> Option<Running> {
        let mut phase = self.phase.lock();
        match std::mem::replace(&mut *phase, Phase::Stopping) {
            Phase::Running(running) => Some(running),
            other => {
                *phase = other;
                None
            }
        }
    }

    /// Release everything `begin_stop` handed out and return to `Idle`.
    ///
    /// `join_interface` is false when called from the interface task itself,
    /// which cannot wait for its own exit. If this future is dropped part way
    /// through, both tasks are deleted and the slot is still released.
    pub(crate) async fn finish_stop(&self, running: Running, join_interface: bool) {
        let mut teardown = Teardown {
            shared: self,
            running,
            completed: false,
        };
        let grace = teardown.running.grace;
        teardown.running.shutdown_tx.send_replace(true);

        if join_interface && !teardown.running.interface.shutdown(grace).await {
            tracing::warn!(plugin = %self.name, "Interface task deleted after grace period");
        }
        if !teardown.running.worker.shutdown(grace).await {
            tracing::warn!(plugin = %self.name, "Worker task deleted after grace period");
        }
        teardown.completed = true;
    }
}

/// Completes a stop when dropped, whether or not the stopping future ran to
/// the end.
struct Teardown<'a, P: Plugin> {
    shared: &'a Shared<P>,
    running: Running,
    completed: bool,
}

impl<P: Plugin> Drop for Teardown<'_, P> {
    fn drop(&mut self) {
        let name = &self.shared.name;
        if !self.completed {
            tracing::warn!(plugin = %name, "Stop interrupted, deleting plugin tasks");
            self.running.worker.delete();
            self.running.interface.delete();
        }

        if !self.shared.directory.release(name, self.running.worker.id()) {
            tracing::warn!(plugin = %name, "Plugin was not registered at stop");
        }
        *self.shared.phase.lock() = Phase::Idle;
        tracing::info!(plugin = %name, "Plugin stopped");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Plugin Host
// ─────────────────────────────────────────────────────────────────────────────

/// Handle owning one plugin instance.
///
/// Cloning the host gives another handle to the same instance.
pub struct PluginHost<P: Plugin> {
    shared: Arc<Shared<P>>,
}

impl<P: Plugin> Clone for PluginHost<P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<P: Plugin> PluginHost<P> {
    /// Create an idle plugin called `name`.
    ///
    /// Names must be non-empty, at most 15 bytes and free of parentheses.
    pub fn new(
        name: &str,
        plugin: P,
        directory: Arc<Directory>,
        kernel: Arc<dyn Kernel>,
    ) -> Result<Self, StartError> {
        if name.is_empty() || name.len() > MAX_FUNCTION_LEN || name.contains(['(', ')']) {
            return Err(StartError::InvalidName(name.to_string()));
        }

        Ok(Self {
            shared: Arc::new(Shared {
                name: Arc::from(name),
                interface_name: format!("{}{}", INTERFACE_PREFIX, name),
                plugin: Arc::new(plugin),
                directory,
                kernel,
                phase: Mutex::new(Phase::Idle),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Name of the interface task, `i_<name>`.
    pub fn interface_name(&self) -> &str {
        &self.shared.interface_name
    }

    pub fn plugin(&self) -> &Arc<P> {
        &self.shared.plugin
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.shared.directory
    }

    pub fn state(&self) -> LifecycleState {
        self.shared.phase.lock().state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    pub fn worker_info(&self) -> Option<TaskInfo> {
        match &*self.shared.phase.lock() {
            Phase::Running(running) => Some(running.worker.info().clone()),
            _ => None,
        }
    }

    pub fn interface_info(&self) -> Option<TaskInfo> {
        match &*self.shared.phase.lock() {
            Phase::Running(running) => Some(running.interface.info().clone()),
            _ => None,
        }
    }

    /// Start the plugin with `worker` as its worker task body.
    ///
    /// Fails if this host is already started, if another plugin is
    /// registered under the same name, or if any task, channel or directory
    /// slot cannot be had. On failure nothing is left behind.
    pub fn start<F, Fut>(&self, worker: F, options: StartOptions) -> Result<(), StartError>
    where
        F: FnOnce(WorkerContext<P>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let shared = &self.shared;
        if options.queue_depth == 0 {
            return Err(StartError::InvalidQueueDepth);
        }

        // Built before taking the phase lock: the closure may call back into
        // this host.
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = WorkerContext::new(
            Arc::clone(&shared.name),
            Arc::clone(&shared.plugin),
            Arc::clone(&shared.directory),
            shutdown_rx,
        );
        let worker_body: TaskFuture = Box::pin(worker(ctx));

        // Held for the whole start so the interface task cannot observe a
        // half-started plugin.
        let mut phase = shared.phase.lock();
        if !matches!(*phase, Phase::Idle) {
            return Err(StartError::AlreadyStarted(shared.name.to_string()));
        }
        if shared.directory.contains(&shared.name) {
            return Err(StartError::NameCollision(shared.name.to_string()));
        }

        *phase = Phase::Starting;
        tracing::debug!(plugin = %shared.name, "Starting plugin");

        match self.launch(worker_body, shutdown_tx, &options) {
            Ok(running) => {
                *phase = Phase::Running(running);
                tracing::info!(plugin = %shared.name, "Plugin started");
                Ok(())
            }
            Err(e) => {
                *phase = Phase::Idle;
                tracing::warn!(plugin = %shared.name, error = %e, "Plugin failed to start");
                Err(e)
            }
        }
    }

    /// Start the plugin with its tasks pinned to `core`.
    pub fn start_on_core<F, Fut>(
        &self,
        core: usize,
        worker: F,
        options: StartOptions,
    ) -> Result<(), StartError>
    where
        F: FnOnce(WorkerContext<P>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.start(worker, options.on_core(core))
    }

    /// Create channels, spawn both tasks and register. Undoes its own work on
    /// failure.
    fn launch(
        &self,
        worker_body: TaskFuture,
        shutdown_tx: watch::Sender<bool>,
        options: &StartOptions,
    ) -> Result<Running, StartError> {
        let shared = &self.shared;
        let (port, ends) = channel_pair(&shared.name, options.queue_depth);
        let shutdown_rx = shutdown_tx.subscribe();

        let worker_spec =
            TaskSpec::new(shared.name.to_string(), options.stack_size, options.priority)
                .on_core(options.core);
        let worker_task = shared.kernel.spawn(worker_spec, worker_body)?;

        let interface_spec = TaskSpec::new(
            shared.interface_name.clone(),
            options.interface_stack_size,
            options.priority,
        )
        .on_core(options.core);
        let interface_body = interface::run(
            Arc::clone(shared),
            ends,
            shutdown_rx,
            options.interface_buffer_size,
            options.shutdown_grace,
        );
        let interface_task = match shared.kernel.spawn(interface_spec, Box::pin(interface_body)) {
            Ok(task) => task,
            Err(e) => {
                worker_task.delete();
                return Err(e.into());
            }
        };

        let registered = shared
            .directory
            .register(&shared.name, worker_task.info().clone(), Arc::clone(&port));
        if let Err(e) = registered {
            interface_task.delete();
            worker_task.delete();
            return Err(e.into());
        }

        Ok(Running {
            worker: worker_task,
            interface: interface_task,
            port,
            shutdown_tx,
            grace: options.shutdown_grace,
        })
    }

    /// Send `text` to this plugin and wait for the reply.
    pub async fn cmd(
        &self,
        text: &str,
        timeout: impl Into<Timeout>,
    ) -> Result<Reply, DispatchError> {
        let port = match &*self.shared.phase.lock() {
            Phase::Running(running) => Arc::clone(&running.port),
            _ => return Err(DispatchError::NotRunning(self.shared.name.to_string())),
        };
        port.request(text, timeout.into()).await
    }

    /// Stop the plugin: signal both tasks, wait for them (deleting any that
    /// outlive the grace period), deregister and drop the channels.
    ///
    /// Returns `false` without doing anything if the plugin is not running.
    pub async fn stop(&self) -> bool {
        let Some(running) = self.shared.begin_stop() else {
            return false;
        };
        tracing::debug!(plugin = %self.shared.name, "Stopping plugin");
        self.shared.finish_stop(running, true).await;
        true
    }
}

impl<P: Plugin> fmt::Debug for PluginHost<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginHost")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
