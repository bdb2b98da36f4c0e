//! Kernel Substrate
//!
//! The scheduling floor plugins are built on: spawning named tasks, deleting
//! them, and reading back what state they are in. Two kernels are provided:
//!
//! - [`TokioKernel`] runs every task on the ambient tokio runtime.
//! - [`ThreadKernel`] gives every task its own OS thread, sized from the
//!   task's requested stack, driving a current-thread runtime.
//!
//! Both wrap the task future so that its state and accumulated run time can be
//! observed from other tasks without cooperation from the task itself.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::task::{Context, Poll, Wake, Waker};
use std::thread;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::watch;

use crate::error::KernelError;

/// Boxed task body handed to a kernel.
pub type TaskFuture = BoxFuture<'static, ()>;

/// Next task ID to assign. IDs are never reused.
static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

// ─────────────────────────────────────────────────────────────────────────────
// Task State
// ─────────────────────────────────────────────────────────────────────────────

/// Scheduling state of a task as seen from outside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum TaskState {
    /// Currently being polled.
    Running = 0,
    /// Woken and waiting to be polled.
    Ready = 1,
    /// Waiting on a channel, timer or other event.
    Blocked = 2,
    /// Parked by the scheduler. Neither shipped kernel produces this.
    Suspended = 3,
    /// Finished or deleted.
    Deleted = 4,
    /// Unknown task, or no introspection available.
    Invalid = 5,
}

impl TaskState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Running,
            1 => Self::Ready,
            2 => Self::Blocked,
            3 => Self::Suspended,
            4 => Self::Deleted,
            _ => Self::Invalid,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn is_alive(self) -> bool {
        matches!(
            self,
            TaskState::Running | TaskState::Ready | TaskState::Blocked | TaskState::Suspended
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Running => "Running",
            TaskState::Ready => "Ready",
            TaskState::Blocked => "Blocked",
            TaskState::Suspended => "Suspended",
            TaskState::Deleted => "Deleted",
            TaskState::Invalid => "Invalid",
        };
        f.write_str(s)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Task Spec
// ─────────────────────────────────────────────────────────────────────────────

/// Parameters for creating a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub name: String,
    /// Requested stack size in kernel units. Only [`ThreadKernel`] uses it.
    pub stack_size: usize,
    /// Recorded and reported; not enforced.
    pub priority: u8,
    /// Requested core affinity. Recorded and reported; not enforced.
    pub core: Option<usize>,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, stack_size: usize, priority: u8) -> Self {
        Self {
            name: name.into(),
            stack_size,
            priority,
            core: None,
        }
    }

    pub fn on_core(mut self, core: Option<usize>) -> Self {
        self.core = core;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Status Snapshot
// ─────────────────────────────────────────────────────────────────────────────

/// Read-only view of a task for operator tooling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub name: String,
    pub state: TaskState,
    /// Opaque stack base address. Not available from async kernels.
    pub stack_base: Option<usize>,
    /// Total time spent executing the task.
    pub run_time: Duration,
    pub priority: u8,
    pub task_id: u64,
    pub stack_size: usize,
    pub core: Option<usize>,
}

impl StatusSnapshot {
    /// Snapshot for a task that does not exist.
    pub fn invalid(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: TaskState::Invalid,
            stack_base: None,
            run_time: Duration::ZERO,
            priority: 0,
            task_id: 0,
            stack_size: 0,
            core: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.state != TaskState::Invalid
    }
}

impl fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "***** TASK STATUS *****")?;
        writeln!(f, "Name:     {}", self.name)?;
        writeln!(f, "State:    {}[{}]", self.state, self.state.code())?;
        writeln!(f, "Address:  {:#x}", self.stack_base.unwrap_or(0))?;
        writeln!(f, "Runtime:  {}", self.run_time.as_micros())?;
        writeln!(f, "Priority: {}", self.priority)?;
        writeln!(f, "Task ID:  {}", self.task_id)?;
        writeln!(f, "***********************")
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Task Info
// ─────────────────────────────────────────────────────────────────────────────

struct TaskMeta {
    id: u64,
    spec: TaskSpec,
    state: AtomicU8,
    run_time_nanos: AtomicU64,
}

impl TaskMeta {
    fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Move `from` to `to` unless another transition got there first.
    fn transition(&self, from: TaskState, to: TaskState) {
        let _ = self.state.compare_exchange(
            from as u8,
            to as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    fn add_run_time(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.run_time_nanos.fetch_add(nanos, Ordering::Relaxed);
    }
}

/// Cloneable, read-only reference to a spawned task.
#[derive(Clone)]
pub struct TaskInfo {
    meta: Arc<TaskMeta>,
}

impl TaskInfo {
    pub fn id(&self) -> u64 {
        self.meta.id
    }

    pub fn name(&self) -> &str {
        &self.meta.spec.name
    }

    pub fn spec(&self) -> &TaskSpec {
        &self.meta.spec
    }

    pub fn state(&self) -> TaskState {
        self.meta.state()
    }

    pub fn run_time(&self) -> Duration {
        Duration::from_nanos(self.meta.run_time_nanos.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let spec = &self.meta.spec;
        StatusSnapshot {
            name: spec.name.clone(),
            state: self.state(),
            stack_base: None,
            run_time: self.run_time(),
            priority: spec.priority,
            task_id: self.meta.id,
            stack_size: spec.stack_size,
            core: spec.core,
        }
    }
}

impl fmt::Debug for TaskInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskInfo")
            .field("id", &self.meta.id)
            .field("name", &self.meta.spec.name)
            .field("state", &self.state())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Task Handle
// ─────────────────────────────────────────────────────────────────────────────

/// Owning handle to a spawned task.
///
/// Dropping the handle detaches the task; it keeps running until it finishes.
pub struct TaskHandle {
    info: TaskInfo,
    delete_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl TaskHandle {
    pub fn info(&self) -> &TaskInfo {
        &self.info
    }

    pub fn id(&self) -> u64 {
        self.info.id()
    }

    pub fn state(&self) -> TaskState {
        self.info.state()
    }

    /// Delete the task. Its future is dropped the next time it is scheduled,
    /// without running any further code of its own.
    pub fn delete(&self) {
        self.delete_tx.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        *self.done_rx.borrow()
    }

    /// Wait for the task to finish.
    pub async fn join(&self) {
        let mut done = self.done_rx.clone();
        // An error means the task was dropped by its runtime; it is gone either way.
        let _ = done.wait_for(|finished| *finished).await;
    }

    /// Give the task `grace` to finish on its own, then delete it.
    ///
    /// Returns `true` if the task exited by itself.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        if tokio::time::timeout(grace, self.join()).await.is_ok() {
            return true;
        }
        tracing::warn!(task = %self.info.name(), "Task did not exit within grace period, deleting");
        self.delete();
        self.join().await;
        false
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("info", &self.info)
            .field("finished", &self.is_finished())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Kernel
// ─────────────────────────────────────────────────────────────────────────────

/// Something that can run tasks.
pub trait Kernel: Send + Sync + 'static {
    /// Spawn `task` as a new task described by `spec`.
    fn spawn(&self, spec: TaskSpec, task: TaskFuture) -> Result<TaskHandle, KernelError>;
}

/// Wrap `task` with state tracking and deletion, returning its handle and the
/// future a kernel should run.
pub fn prepare(spec: TaskSpec, task: TaskFuture) -> (TaskHandle, TaskFuture) {
    let meta = Arc::new(TaskMeta {
        id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
        spec,
        state: AtomicU8::new(TaskState::Ready as u8),
        run_time_nanos: AtomicU64::new(0),
    });

    let (delete_tx, delete_rx) = watch::channel(false);
    let (done_tx, done_rx) = watch::channel(false);

    let tracked = Tracked {
        inner: task,
        meta: Arc::clone(&meta),
    };
    let task_meta = Arc::clone(&meta);
    let wrapped: TaskFuture = Box::pin(async move {
        tokio::select! {
            biased;
            _ = delete_requested(delete_rx) => {
                tracing::debug!(task = %task_meta.spec.name, "Task deleted");
            }
            _ = tracked => {}
        }
        task_meta.set_state(TaskState::Deleted);
        done_tx.send_replace(true);
    });

    let handle = TaskHandle {
        info: TaskInfo { meta },
        delete_tx,
        done_rx,
    };
    (handle, wrapped)
}

async fn delete_requested(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Handle dropped: the task is detached and can no longer be deleted.
            std::future::pending::<()>().await;
        }
    }
}

/// Future wrapper that records scheduling state and time spent in `poll`.
struct Tracked {
    inner: TaskFuture,
    meta: Arc<TaskMeta>,
}

impl Future for Tracked {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = &mut *self;
        this.meta.set_state(TaskState::Running);

        let waker = Waker::from(Arc::new(StateWaker {
            inner: cx.waker().clone(),
            meta: Arc::clone(&this.meta),
        }));
        let mut tracked_cx = Context::from_waker(&waker);

        let started = Instant::now();
        let poll = this.inner.as_mut().poll(&mut tracked_cx);
        this.meta.add_run_time(started.elapsed());

        match poll {
            Poll::Ready(()) => {
                this.meta.set_state(TaskState::Deleted);
                Poll::Ready(())
            }
            Poll::Pending => {
                // A wake during the poll already moved us to Ready.
                this.meta.transition(TaskState::Running, TaskState::Blocked);
                Poll::Pending
            }
        }
    }
}

struct StateWaker {
    inner: Waker,
    meta: Arc<TaskMeta>,
}

impl Wake for StateWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.meta.transition(TaskState::Blocked, TaskState::Ready);
        self.meta.transition(TaskState::Running, TaskState::Ready);
        self.inner.wake_by_ref();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tokio Kernel
// ─────────────────────────────────────────────────────────────────────────────

/// Runs tasks on a tokio runtime.
#[derive(Debug, Clone, Default)]
pub struct TokioKernel {
    runtime: Option<tokio::runtime::Handle>,
}

impl TokioKernel {
    /// Spawn onto whichever runtime is current at spawn time.
    pub fn new() -> Self {
        Self { runtime: None }
    }

    /// Spawn onto a specific runtime.
    pub fn with_handle(runtime: tokio::runtime::Handle) -> Self {
        Self {
            runtime: Some(runtime),
        }
    }
}

impl Kernel for TokioKernel {
    fn spawn(&self, spec: TaskSpec, task: TaskFuture) -> Result<TaskHandle, KernelError> {
        if spec.stack_size == 0 {
            return Err(KernelError::InvalidStackSize);
        }
        let runtime = match &self.runtime {
            Some(handle) => handle.clone(),
            None => tokio::runtime::Handle::try_current().map_err(|_| KernelError::NoRuntime)?,
        };

        let (handle, task) = prepare(spec, task);
        runtime.spawn(task);
        Ok(handle)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Thread Kernel
// ─────────────────────────────────────────────────────────────────────────────

/// Smallest stack given to a task thread, whatever was requested.
pub const MIN_THREAD_STACK: usize = 128 * 1024;

/// Runs every task on a dedicated OS thread.
///
/// The thread's stack is `stack_size * unit_bytes`, floored at
/// [`MIN_THREAD_STACK`]. Each thread drives its own current-thread runtime.
#[derive(Debug, Clone)]
pub struct ThreadKernel {
    unit_bytes: usize,
}

impl ThreadKernel {
    pub fn new() -> Self {
        Self { unit_bytes: 1024 }
    }

    /// Interpret stack sizes as multiples of `unit_bytes`.
    pub fn with_unit_bytes(unit_bytes: usize) -> Self {
        Self {
            unit_bytes: unit_bytes.max(1),
        }
    }

    pub fn stack_bytes(&self, stack_size: usize) -> usize {
        stack_size
            .saturating_mul(self.unit_bytes)
            .max(MIN_THREAD_STACK)
    }
}

impl Default for ThreadKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel for ThreadKernel {
    fn spawn(&self, spec: TaskSpec, task: TaskFuture) -> Result<TaskHandle, KernelError> {
        if spec.stack_size == 0 {
            return Err(KernelError::InvalidStackSize);
        }
        let stack_bytes = self.stack_bytes(spec.stack_size);
        let name = spec.name.clone();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (handle, task) = prepare(spec, task);

        thread::Builder::new()
            .name(name.clone())
            .stack_size(stack_bytes)
            .spawn(move || {
                tracing::debug!(task = %name, "Task thread started");
                runtime.block_on(task);
                tracing::debug!(task = %name, "Task thread exiting");
            })?;

        Ok(handle)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    fn spec(name: &str) -> TaskSpec {
        TaskSpec::new(name, 64, 1)
    }

    #[tokio::test]
    async fn test_task_runs_to_completion() {
        let kernel = TokioKernel::new();
        let (tx, rx) = oneshot::channel();
        let handle = kernel
            .spawn(
                spec("finisher"),
                Box::pin(async move {
                    let _ = tx.send(7);
                }),
            )
            .unwrap();

        assert_eq!(rx.await.unwrap(), 7);
        handle.join().await;
        assert!(handle.is_finished());
        assert_eq!(handle.state(), TaskState::Deleted);
    }

    #[tokio::test]
    async fn test_blocked_task_reports_blocked_then_deleted() {
        let kernel = TokioKernel::new();
        let (_tx, rx) = oneshot::channel::<()>();
        let handle = kernel
            .spawn(
                spec("waiter"),
                Box::pin(async move {
                    let _ = rx.await;
                }),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handle.state(), TaskState::Blocked);

        handle.delete();
        handle.join().await;
        assert_eq!(handle.state(), TaskState::Deleted);
    }

    #[tokio::test]
    async fn test_shutdown_deletes_after_grace() {
        let kernel = TokioKernel::new();
        let handle = kernel
            .spawn(spec("stubborn"), Box::pin(std::future::pending::<()>()))
            .unwrap();
        let info = handle.info().clone();

        let exited_cleanly = handle.shutdown(Duration::from_millis(20)).await;
        assert!(!exited_cleanly);
        assert_eq!(info.state(), TaskState::Deleted);
    }

    #[tokio::test]
    async fn test_snapshot_carries_spec() {
        let kernel = TokioKernel::new();
        let handle = kernel
            .spawn(
                TaskSpec::new("pinned", 128, 3).on_core(Some(1)),
                Box::pin(std::future::pending::<()>()),
            )
            .unwrap();

        let snapshot = handle.info().snapshot();
        assert_eq!(snapshot.name, "pinned");
        assert_eq!(snapshot.priority, 3);
        assert_eq!(snapshot.stack_size, 128);
        assert_eq!(snapshot.core, Some(1));
        assert_eq!(snapshot.task_id, handle.id());
        assert!(snapshot.is_valid());
        handle.delete();
    }

    #[test]
    fn test_tokio_kernel_needs_runtime() {
        let kernel = TokioKernel::new();
        let result = kernel.spawn(spec("orphan"), Box::pin(async {}));
        assert!(matches!(result, Err(KernelError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_zero_stack_rejected() {
        let kernel = TokioKernel::new();
        let result = kernel.spawn(TaskSpec::new("tiny", 0, 1), Box::pin(async {}));
        assert!(matches!(result, Err(KernelError::InvalidStackSize)));
    }

    #[tokio::test]
    async fn test_thread_kernel_runs_task_on_named_thread() {
        let kernel = ThreadKernel::new();
        let (tx, rx) = oneshot::channel();
        let handle = kernel
            .spawn(
                spec("threaded"),
                Box::pin(async move {
                    let name = thread::current().name().map(String::from);
                    let _ = tx.send(name);
                }),
            )
            .unwrap();

        assert_eq!(rx.await.unwrap().as_deref(), Some("threaded"));
        handle.join().await;
        assert_eq!(handle.state(), TaskState::Deleted);
    }

    #[test]
    fn test_thread_stack_floor() {
        let kernel = ThreadKernel::with_unit_bytes(4);
        assert_eq!(kernel.stack_bytes(64), MIN_THREAD_STACK);
        let kernel = ThreadKernel::new();
        assert_eq!(kernel.stack_bytes(256), 256 * 1024);
    }

    #[test]
    fn test_invalid_snapshot_renders_block() {
        let text = StatusSnapshot::invalid("ghost").to_string();
        assert!(text.contains("Name:     ghost"));
        assert!(text.contains("State:    Invalid[5]"));
        assert!(text.contains("Address:  0x0"));
    }
}
