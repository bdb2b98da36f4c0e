//! Courier - named plugins talking over text commands
//!
//! This crate provides:
//! - A fixed-capacity directory of running plugins with name-based dispatch
//! - The `name(params)` command codec
//! - Plugin hosts that pair a worker task with a command interface task
//! - A level-gated debug log and task status reports

// Command codec
pub mod codec;

// Task substrate
pub mod kernel;

// Per-plugin channel pair
pub mod channel;

// Debug sink
pub mod debug;

// Plugin directory
pub mod directory;

// Plugin lifecycle
pub mod plugin;

pub mod config;
pub mod demo;
pub mod error;

pub use channel::{PluginPort, Reply, Timeout};
pub use codec::{Command, ResponseBuffer};
pub use config::CourierConfig;
pub use debug::{Category, DebugSink, MemorySink, TracingSink, WriterSink};
pub use directory::Directory;
pub use error::{CodecError, ConfigError, DispatchError, KernelError, RegistryError, StartError};
pub use kernel::{Kernel, StatusSnapshot, TaskState, ThreadKernel, TokioKernel};
pub use plugin::{LifecycleState, Plugin, PluginHost, StartOptions, WorkerContext};
