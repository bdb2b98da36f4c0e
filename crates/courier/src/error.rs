//! Error types for the plugin directory and its collaborators.

use std::time::Duration;

/// Errors produced while decoding command text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("missing '(' after function name")]
    MissingOpenParen,

    #[error("missing closing ')'")]
    MissingCloseParen,

    #[error("nested '(' in parameters")]
    NestedParen,

    #[error("empty function name")]
    EmptyFunction,

    #[error("function name longer than {max} bytes")]
    FunctionTooLong { max: usize },

    #[error("parameters longer than {max} bytes")]
    ParametersTooLong { max: usize },
}

impl CodecError {
    /// Short machine-readable reason, used in `malformed_command(..)` replies.
    pub fn reason(&self) -> &'static str {
        match self {
            CodecError::MissingOpenParen => "missing_open_paren",
            CodecError::MissingCloseParen => "missing_close_paren",
            CodecError::NestedParen => "nested_paren",
            CodecError::EmptyFunction => "empty_function",
            CodecError::FunctionTooLong { .. } => "function_too_long",
            CodecError::ParametersTooLong { .. } => "parameters_too_long",
        }
    }
}

/// Errors from the plugin directory.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("directory is full")]
    Full,

    #[error("name already registered: {0}")]
    NameCollision(String),

    #[error("name not registered: {0}")]
    NotFound(String),

    #[error("empty names are reserved for free slots")]
    EmptyName,
}

/// Errors from the kernel substrate.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("no async runtime available to spawn on")]
    NoRuntime,

    #[error("stack size must be non-zero")]
    InvalidStackSize,

    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Errors returned by `PluginHost::start`. Every variant is returned only
/// after the start attempt has been fully rolled back.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("invalid plugin name: {0:?}")]
    InvalidName(String),

    #[error("plugin already started: {0}")]
    AlreadyStarted(String),

    #[error("a plugin named {0} is already running")]
    NameCollision(String),

    #[error("command queue depth must be at least 1")]
    InvalidQueueDepth,

    #[error("registration failed: {0}")]
    Registration(#[from] RegistryError),

    #[error("task creation failed: {0}")]
    Creation(#[from] KernelError),
}

/// Errors returned when sending a command to a plugin.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("no plugin registered as {0}")]
    LookupMiss(String),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("plugin not running: {0}")]
    NotRunning(String),

    #[error("plugin channel closed: {0}")]
    Closed(String),
}

/// Errors loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}
