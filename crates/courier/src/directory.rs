//! Plugin Directory
//!
//! Fixed-capacity table of running plugins, keyed by name. Plugins register
//! themselves when they start and deregister when they stop; any task holding
//! the directory can send a command to any registered plugin by name.
//!
//! The directory also owns the level-gated debug log plugins report through,
//! and answers task status queries for operator tooling.
//!
//! All access to the table is serialised by one mutex. The lock is never held
//! across an await point.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::channel::{PluginPort, Reply, Timeout};
use crate::debug::{Category, DebugLog, DebugSink};
use crate::error::{DispatchError, KernelError, RegistryError};
use crate::kernel::{StatusSnapshot, TaskInfo};

/// Default number of plugins a directory can hold.
pub const DEFAULT_CAPACITY: usize = 10;

/// Debug level at which a dispatch to an unknown name is reported.
pub const LOOKUP_MISS_LEVEL: u8 = 1;

/// Debug level of the monitor heartbeat.
pub const MONITOR_LEVEL: u8 = 255;

// ─────────────────────────────────────────────────────────────────────────────
// Slot Table
// ─────────────────────────────────────────────────────────────────────────────

struct PluginEntry {
    name: String,
    worker: TaskInfo,
    port: Arc<PluginPort>,
}

/// Fixed array of slots plus a free list. `None` marks a free slot.
struct SlotTable {
    slots: Vec<Option<PluginEntry>>,
    free: Vec<usize>,
}

impl SlotTable {
    fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            // Reversed so the lowest free slot is handed out first
            free: (0..capacity).rev().collect(),
        }
    }

    fn find(&self, name: &str) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|e| e.name == name))
    }

    fn get(&self, name: &str) -> Option<&PluginEntry> {
        self.find(name).and_then(|i| self.slots[i].as_ref())
    }

    fn active(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    fn release(&mut self, index: usize) {
        self.slots[index] = None;
        self.free.push(index);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Directory
// ─────────────────────────────────────────────────────────────────────────────

/// Directory of running plugins.
///
/// Construct one per process and share it as `Arc<Directory>` with every
/// plugin host and every task that needs to reach plugins by name.
pub struct Directory {
    table: Mutex<SlotTable>,
    log: DebugLog,
}

impl Directory {
    /// Create a directory with room for `capacity` plugins.
    pub fn new(capacity: usize) -> Self {
        Self {
            table: Mutex::new(SlotTable::new(capacity)),
            log: DebugLog::default(),
        }
    }

    /// Create a directory wrapped in an Arc
    pub fn new_shared(capacity: usize) -> Arc<Self> {
        Arc::new(Self::new(capacity))
    }

    /// Create a directory from configuration.
    pub fn from_config(config: &crate::config::CourierConfig) -> Self {
        let directory = Self::new(config.directory.capacity);
        directory.log.set_level(config.debug.level);
        directory.log.set_ansi(config.debug.ansi);
        directory
    }

    pub fn capacity(&self) -> usize {
        self.table.lock().slots.len()
    }

    /// Number of registered plugins.
    pub fn count(&self) -> usize {
        self.table.lock().active()
    }

    /// Register a plugin under `name`.
    ///
    /// Fails without touching the table if the name is empty, already
    /// registered, or no slot is free.
    pub fn register(
        &self,
        name: &str,
        worker: TaskInfo,
        port: Arc<PluginPort>,
    ) -> Result<(), RegistryError> {
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }

        let mut table = self.table.lock();
        if table.find(name).is_some() {
            return Err(RegistryError::NameCollision(name.to_string()));
        }
        let index = table.free.pop().ok_or(RegistryError::Full)?;
        table.slots[index] = Some(PluginEntry {
            name: name.to_string(),
            worker,
            port,
        });
        drop(table);

        tracing::debug!(plugin = %name, slot = index, "Registered plugin");
        Ok(())
    }

    /// Remove `name` from the directory.
    pub fn deregister(&self, name: &str) -> Result<(), RegistryError> {
        let mut table = self.table.lock();
        let index = table
            .find(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        table.release(index);
        drop(table);

        tracing::debug!(plugin = %name, slot = index, "Deregistered plugin");
        Ok(())
    }

    /// Remove `name` only if it is still registered to the worker task
    /// `worker_id`. Used by plugins tearing themselves down.
    pub(crate) fn release(&self, name: &str, worker_id: u64) -> bool {
        let mut table = self.table.lock();
        let Some(index) = table.find(name) else {
            return false;
        };
        if table.slots[index].as_ref().map(|e| e.worker.id()) != Some(worker_id) {
            return false;
        }
        table.release(index);
        drop(table);

        tracing::debug!(plugin = %name, slot = index, "Released plugin slot");
        true
    }

    /// Worker task of the plugin registered as `name`.
    pub fn lookup(&self, name: &str) -> Option<TaskInfo> {
        self.table.lock().get(name).map(|e| e.worker.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.lock().find(name).is_some()
    }

    /// Channel pair of the plugin registered as `name`.
    pub fn port(&self, name: &str) -> Option<Arc<PluginPort>> {
        self.table.lock().get(name).map(|e| Arc::clone(&e.port))
    }

    /// Names of all registered plugins, in slot order.
    pub fn names(&self) -> Vec<String> {
        self.table
            .lock()
            .slots
            .iter()
            .flatten()
            .map(|e| e.name.clone())
            .collect()
    }

    /// Send `text` to the plugin registered as `name` and wait for its reply.
    ///
    /// An unknown name is reported on the debug log at
    /// [`LOOKUP_MISS_LEVEL`] and returned as [`DispatchError::LookupMiss`].
    pub async fn dispatch(
        &self,
        name: &str,
        text: &str,
        timeout: impl Into<Timeout>,
    ) -> Result<Reply, DispatchError> {
        let Some(port) = self.port(name) else {
            self.log(
                LOOKUP_MISS_LEVEL,
                Category::Warning,
                format_args!("{}: lookup_miss({})", name, text),
            );
            return Err(DispatchError::LookupMiss(name.to_string()));
        };
        port.request(text, timeout.into()).await
    }

    /// Status of the worker task registered as `name`, or an `Invalid`
    /// snapshot if there is none.
    pub fn status(&self, name: &str) -> StatusSnapshot {
        match self.lookup(name) {
            Some(worker) => {
                let mut snapshot = worker.snapshot();
                snapshot.name = name.to_string();
                snapshot
            }
            None => StatusSnapshot::invalid(name),
        }
    }

    /// Status block for `name` as operator text.
    pub fn status_report(&self, name: &str) -> String {
        self.status(name).to_string()
    }

    /// Write the status block for `name` to the debug sink.
    pub fn print_status(&self, name: &str) {
        self.log.write_block(Category::Info, &self.status_report(name));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Debug log
    // ─────────────────────────────────────────────────────────────────────────

    /// Set the debug level; returns the level now in effect.
    pub fn set_debug_level(&self, level: u8) -> u8 {
        self.log.set_level(level)
    }

    pub fn debug_level(&self) -> u8 {
        self.log.level()
    }

    pub fn set_debug_sink(&self, sink: Arc<dyn DebugSink>) {
        self.log.set_sink(sink);
    }

    pub fn set_ansi(&self, ansi: bool) {
        self.log.set_ansi(ansi);
    }

    /// Emit `message` if the debug level is at least `required`.
    pub fn log(&self, required: u8, category: Category, message: impl fmt::Display) -> bool {
        self.log.log(required, category, message)
    }

    pub fn debug_log(&self) -> &DebugLog {
        &self.log
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Monitor
    // ─────────────────────────────────────────────────────────────────────────

    /// Start the directory's own monitor task, which reports the number of
    /// active plugins every `interval` at [`MONITOR_LEVEL`].
    ///
    /// The monitor stops when the returned handle is dropped or the
    /// directory is gone.
    pub fn spawn_monitor(
        self: &Arc<Self>,
        interval: Duration,
    ) -> Result<MonitorHandle, KernelError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| KernelError::NoRuntime)?;
        let directory: Weak<Directory> = Arc::downgrade(self);

        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(directory) = directory.upgrade() else {
                    break;
                };
                directory.log(
                    MONITOR_LEVEL,
                    Category::Info,
                    format_args!(
                        "monitor: {}/{} plugins active",
                        directory.count(),
                        directory.capacity()
                    ),
                );
            }
        });
        Ok(MonitorHandle { task })
    }
}

impl Default for Directory {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl fmt::Debug for Directory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Directory")
            .field("names", &self.names())
            .field("capacity", &self.capacity())
            .field("log", &self.log)
            .finish()
    }
}

/// Keeps the directory monitor alive. Dropping it stops the monitor.
#[derive(Debug)]
pub struct MonitorHandle {
    task: JoinHandle<()>,
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Envelope, PortEnds, channel_pair};
    use crate::debug::MemorySink;
    use crate::kernel::{TaskHandle, TaskSpec, TaskState, prepare};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashSet;

    /// A task handle that is never run, plus a port with nobody listening.
    fn entry(name: &str) -> (TaskHandle, Arc<PluginPort>, PortEnds) {
        let (handle, _task) = prepare(TaskSpec::new(name, 64, 1), Box::pin(async {}));
        let (port, ends) = channel_pair(name, 1);
        (handle, port, ends)
    }

    fn register(directory: &Directory, name: &str) -> Result<(), RegistryError> {
        let (handle, port, _ends) = entry(name);
        directory.register(name, handle.info().clone(), port)
    }

    #[test]
    fn test_register_and_lookup() {
        let directory = Directory::new(4);
        register(&directory, "led").unwrap();

        assert_eq!(directory.count(), 1);
        assert!(directory.contains("led"));
        assert_eq!(directory.lookup("led").unwrap().name(), "led");
        assert!(directory.lookup("fan").is_none());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let directory = Directory::new(4);
        register(&directory, "led").unwrap();

        assert_eq!(
            register(&directory, "led"),
            Err(RegistryError::NameCollision("led".into()))
        );
        assert_eq!(directory.count(), 1);
    }

    #[test]
    fn test_empty_name_rejected() {
        let directory = Directory::new(4);
        assert_eq!(register(&directory, ""), Err(RegistryError::EmptyName));
        assert_eq!(directory.count(), 0);
    }

    #[test]
    fn test_full_directory_unchanged() {
        let directory = Directory::new(3);
        for name in ["a", "b", "c"] {
            register(&directory, name).unwrap();
        }
        let before = directory.names();

        assert_eq!(register(&directory, "d"), Err(RegistryError::Full));
        assert_eq!(directory.count(), 3);
        assert_eq!(directory.names(), before);
        assert!(!directory.contains("d"));
    }

    #[test]
    fn test_deregister_frees_slot_for_reuse() {
        let directory = Directory::new(2);
        register(&directory, "a").unwrap();
        register(&directory, "b").unwrap();

        directory.deregister("a").unwrap();
        assert_eq!(
            directory.deregister("a"),
            Err(RegistryError::NotFound("a".into()))
        );

        register(&directory, "c").unwrap();
        assert_eq!(directory.names(), vec!["c".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_release_only_matches_owner() {
        let directory = Directory::new(2);
        let (handle, port, _ends) = entry("led");
        directory.register("led", handle.info().clone(), port).unwrap();

        assert!(!directory.release("led", handle.id() + 1000));
        assert!(directory.contains("led"));
        assert!(directory.release("led", handle.id()));
        assert!(!directory.contains("led"));
    }

    #[test]
    fn test_random_sequences_keep_names_unique() {
        let names = ["a", "b", "c", "d", "e", "f"];
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..50 {
            let directory = Directory::new(4);
            let mut model: HashSet<&str> = HashSet::new();

            for _ in 0..100 {
                let name = names[rng.gen_range(0..names.len())];
                if rng.gen_bool(0.6) {
                    let result = register(&directory, name);
                    let expected = if model.contains(name) {
                        Err(RegistryError::NameCollision(name.into()))
                    } else if model.len() == 4 {
                        Err(RegistryError::Full)
                    } else {
                        model.insert(name);
                        Ok(())
                    };
                    assert_eq!(result, expected);
                } else {
                    let result = directory.deregister(name);
                    assert_eq!(result.is_ok(), model.remove(name));
                }

                let listed = directory.names();
                let unique: HashSet<&String> = listed.iter().collect();
                assert_eq!(unique.len(), listed.len());
                assert_eq!(directory.count(), model.len());
                assert_eq!(listed.len(), model.len());
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_mutation_keeps_table_consistent() {
        use std::sync::atomic::{AtomicIsize, Ordering};

        let names = ["a", "b", "c", "d", "e", "f"];
        let directory = Directory::new_shared(4);
        let net = Arc::new(AtomicIsize::new(0));

        let mut tasks = Vec::new();
        for worker in 0..8u64 {
            let directory = Arc::clone(&directory);
            let net = Arc::clone(&net);
            tasks.push(tokio::spawn(async move {
                let mut rng = StdRng::seed_from_u64(worker);
                for _ in 0..200 {
                    let name = names[rng.gen_range(0..names.len())];
                    if rng.gen_bool(0.5) {
                        if register(&directory, name).is_ok() {
                            net.fetch_add(1, Ordering::SeqCst);
                        }
                    } else if directory.deregister(name).is_ok() {
                        net.fetch_sub(1, Ordering::SeqCst);
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }
        for dispatcher in 0..2u64 {
            let directory = Arc::clone(&directory);
            tasks.push(tokio::spawn(async move {
                let mut rng = StdRng::seed_from_u64(100 + dispatcher);
                for _ in 0..100 {
                    let name = names[rng.gen_range(0..names.len())];
                    let result = directory
                        .dispatch(name, "identity()", Duration::from_millis(5))
                        .await;
                    assert!(result.is_err());
                    let listed = directory.names();
                    let unique: HashSet<&String> = listed.iter().collect();
                    assert_eq!(unique.len(), listed.len());
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let listed = directory.names();
        let unique: HashSet<&String> = listed.iter().collect();
        assert_eq!(unique.len(), listed.len());
        assert!(listed.len() <= directory.capacity());
        assert_eq!(directory.count() as isize, net.load(Ordering::SeqCst));
        assert_eq!(directory.count(), listed.len());
    }

    #[tokio::test]
    async fn test_dispatch_routes_to_port() {
        let directory = Directory::new(2);
        let (handle, port, mut ends) = entry("echo");
        directory.register("echo", handle.info().clone(), port).unwrap();

        tokio::spawn(async move {
            if let Some(cmd) = ends.commands.recv().await {
                let _ = ends
                    .responses
                    .send(Envelope {
                        seq: cmd.seq,
                        body: Reply::Message(format!("got {}", cmd.body)),
                    })
                    .await;
            }
        });

        let reply = directory
            .dispatch("echo", "ping()", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply.as_str(), "got ping()");
    }

    #[tokio::test]
    async fn test_dispatch_lookup_miss_logs_once() {
        let directory = Directory::new(2);
        let sink = MemorySink::new();
        directory.set_debug_sink(Arc::new(sink.clone()));

        let result = directory.dispatch("C", "identity()", Timeout::Forever).await;
        assert_eq!(result, Err(DispatchError::LookupMiss("C".into())));
        assert!(sink.is_empty());

        directory.set_debug_level(LOOKUP_MISS_LEVEL);
        let result = directory.dispatch("C", "identity()", Timeout::Forever).await;
        assert!(matches!(result, Err(DispatchError::LookupMiss(_))));
        assert_eq!(sink.count(Category::Warning), 1);
        assert!(sink.lines()[0].ends_with("C: lookup_miss(identity())"));
    }

    #[test]
    fn test_status_of_unknown_is_invalid() {
        let directory = Directory::new(2);
        let status = directory.status("ghost");
        assert_eq!(status.state, TaskState::Invalid);
        assert_eq!(status.name, "ghost");
    }

    #[test]
    fn test_status_of_registered_worker() {
        let directory = Directory::new(2);
        let (handle, port, _ends) = entry("led");
        directory.register("led", handle.info().clone(), port).unwrap();

        let status = directory.status("led");
        assert_eq!(status.task_id, handle.id());
        assert_eq!(status.state, TaskState::Ready);
        assert_eq!(status.priority, 1);
    }

    #[test]
    fn test_print_status_ignores_debug_level() {
        let directory = Directory::new(2);
        let sink = MemorySink::new();
        directory.set_debug_sink(Arc::new(sink.clone()));

        directory.print_status("ghost");
        let lines = sink.lines();
        assert_eq!(lines.first().map(String::as_str), Some("***** TASK STATUS *****"));
        assert!(lines.iter().any(|l| l == "State:    Invalid[5]"));
    }

    #[tokio::test]
    async fn test_monitor_reports_at_ultra_level() {
        let directory = Directory::new_shared(2);
        let sink = MemorySink::new();
        directory.set_debug_sink(Arc::new(sink.clone()));
        directory.set_debug_level(MONITOR_LEVEL);

        let monitor = directory.spawn_monitor(Duration::from_millis(10)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(monitor);

        assert!(sink.count(Category::Info) >= 1);
        assert!(sink.lines()[0].ends_with("monitor: 0/2 plugins active"));
    }
}
