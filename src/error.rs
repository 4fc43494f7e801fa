//! Error types for oob-bootstrap
//!
//! Provides structured error handling with:
//! - Numeric error codes for machine parsing
//! - The four protocol-level kinds (store, protocol, init, resource)
//! - User-friendly suggestions
//! - Exit codes for the CLI

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::store::{StoreError, StoreOp};

/// Result type alias for bootstrap operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes for machine parsing and documentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // Configuration errors (1xx)
    ConfigNotFound = 100,
    ConfigParseError = 101,
    ConfigValidation = 102,
    InvalidPeer = 103,

    // IO errors (2xx)
    IoRead = 200,
    IoWrite = 201,
    IoPermission = 202,
    IoNotFound = 203,

    // Store errors (3xx)
    StoreUnreachable = 300,
    StoreKeyNotFound = 301,
    StoreWaitTimeout = 302,
    StoreBackend = 303,

    // Protocol errors (4xx)
    ProtocolState = 400,
    ProtocolBufferSize = 401,
    OperationNotFinished = 402,
    OperationAlreadyCompleted = 403,
    CounterOvershoot = 404,

    // Init errors (5xx)
    ThreadModeUnsupported = 500,
    CapabilityQuery = 501,
    ConfigRead = 502,

    // Resource errors (6xx)
    LibraryInit = 600,
    WorkerCreate = 601,
    ContextCreate = 602,
    EngineFailure = 603,
    Teardown = 604,

    // Trace errors (7xx)
    TraceWrite = 700,
    Serialization = 701,

    // Internal errors (9xx)
    InternalError = 900,
}

impl ErrorCode {
    /// Get the string code (e.g., "E300")
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }

    /// Get the exit code for CLI (maps to 1-125 range)
    pub fn exit_code(&self) -> i32 {
        match *self as u16 {
            100..=199 => 10,
            200..=299 => 20,
            300..=399 => 30,
            400..=499 => 40,
            500..=599 => 50,
            600..=699 => 60,
            700..=799 => 70,
            900..=999 => 90,
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Coarse error classification
///
/// `Store`, `Protocol`, `Init` and `Resource` are the kinds the rendezvous
/// protocol and communicator lifecycle report; the rest cover the ambient
/// config/io/trace plumbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Io,
    Store,
    Protocol,
    Init,
    Resource,
    Trace,
    Internal,
}

/// Main error type
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Configuration parse error
    #[error("Failed to parse configuration: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<toml::de::Error>,
    },

    /// Configuration validation error
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String, field: Option<String> },

    /// Rank/size pair that cannot describe a peer group
    #[error("Invalid peer: rank {rank} is not in [0, {size})")]
    InvalidPeer { rank: usize, size: usize },

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────

    /// File read error
    #[error("Failed to read file: {path}")]
    IoRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File write error
    #[error("Failed to write file: {path}")]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // ─────────────────────────────────────────────────────────────
    // Store Errors
    // ─────────────────────────────────────────────────────────────

    /// A key-value store operation failed
    #[error("Store {op} on '{key}' failed: {source}")]
    Store {
        op: StoreOp,
        key: String,
        #[source]
        source: StoreError,
    },

    // ─────────────────────────────────────────────────────────────
    // Protocol Errors
    // ─────────────────────────────────────────────────────────────

    /// Operation invoked in a state its state machine does not allow
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    /// Buffer length disagrees with the round's message length
    #[error("Buffer size mismatch{}: expected {expected} bytes, got {actual}", .rank.map(|r| format!(" for rank {}", r)).unwrap_or_default())]
    BufferSize {
        expected: usize,
        actual: usize,
        rank: Option<usize>,
    },

    /// Completion requested for an operation still in flight
    #[error("Operation {op} has not finished")]
    OperationNotFinished { op: u64 },

    /// Completion requested for an operation that is not outstanding
    #[error("Operation {op} is not outstanding (already completed or unknown)")]
    OperationAlreadyCompleted { op: u64 },

    /// The shared completion counter went past the peer count
    #[error("Completion counter '{key}' reached {value} with only {size} peers")]
    CounterOvershoot { key: String, value: i64, size: usize },

    // ─────────────────────────────────────────────────────────────
    // Init Errors
    // ─────────────────────────────────────────────────────────────

    /// Library lacks multithreaded access support
    #[error("Communication library supports thread mode '{actual}', '{required}' is required")]
    ThreadModeUnsupported { required: String, actual: String },

    /// Capability descriptor could not be queried
    #[error("Failed to query communication library attributes: {message}")]
    CapabilityQuery { message: String },

    /// Library configuration could not be read or modified
    #[error("Failed to prepare library configuration: {message}")]
    ConfigRead { message: String },

    // ─────────────────────────────────────────────────────────────
    // Resource Errors
    // ─────────────────────────────────────────────────────────────

    /// Library handle initialization failed
    #[error("Failed to initialize communication library: {message}")]
    LibraryInit { message: String },

    /// Worker/progress engine creation failed
    #[error("Failed to create worker: {message}")]
    WorkerCreate { message: String },

    /// Context creation (including the bootstrap round) failed
    #[error("Failed to create communication context: {message}")]
    ContextCreate { message: String },

    /// The engine failed after the context was ready
    #[error("Communication engine failed during {operation}: {message}")]
    EngineFailure {
        operation: &'static str,
        message: String,
    },

    /// Releasing a library resource failed
    #[error("Failed to release {resource}: {message}")]
    Teardown {
        resource: &'static str,
        message: String,
    },

    // ─────────────────────────────────────────────────────────────
    // Trace Errors
    // ─────────────────────────────────────────────────────────────

    /// Trace file could not be written
    #[error("Failed to write comms trace to {path}")]
    TraceWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ─────────────────────────────────────────────────────────────
    // Internal Errors
    // ─────────────────────────────────────────────────────────────

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    // ─────────────────────────────────────────────────────────────
    // Error Classification
    // ─────────────────────────────────────────────────────────────

    /// Get the numeric error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigNotFound { .. } => ErrorCode::ConfigNotFound,
            Error::ConfigParse { .. } => ErrorCode::ConfigParseError,
            Error::ConfigValidation { .. } => ErrorCode::ConfigValidation,
            Error::InvalidPeer { .. } => ErrorCode::InvalidPeer,

            Error::IoRead { .. } => ErrorCode::IoRead,
            Error::IoWrite { .. } => ErrorCode::IoWrite,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::IoNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorCode::IoPermission,
                _ => ErrorCode::IoRead,
            },
            Error::Toml(_) => ErrorCode::ConfigParseError,
            Error::Json(_) => ErrorCode::Serialization,

            Error::Store { source, .. } => match source {
                StoreError::Unreachable(_) => ErrorCode::StoreUnreachable,
                StoreError::KeyNotFound(_) => ErrorCode::StoreKeyNotFound,
                StoreError::WaitTimeout { .. } => ErrorCode::StoreWaitTimeout,
                StoreError::Backend(_) => ErrorCode::StoreBackend,
            },

            Error::InvalidState { .. } => ErrorCode::ProtocolState,
            Error::BufferSize { .. } => ErrorCode::ProtocolBufferSize,
            Error::OperationNotFinished { .. } => ErrorCode::OperationNotFinished,
            Error::OperationAlreadyCompleted { .. } => ErrorCode::OperationAlreadyCompleted,
            Error::CounterOvershoot { .. } => ErrorCode::CounterOvershoot,

            Error::ThreadModeUnsupported { .. } => ErrorCode::ThreadModeUnsupported,
            Error::CapabilityQuery { .. } => ErrorCode::CapabilityQuery,
            Error::ConfigRead { .. } => ErrorCode::ConfigRead,

            Error::LibraryInit { .. } => ErrorCode::LibraryInit,
            Error::WorkerCreate { .. } => ErrorCode::WorkerCreate,
            Error::ContextCreate { .. } => ErrorCode::ContextCreate,
            Error::EngineFailure { .. } => ErrorCode::EngineFailure,
            Error::Teardown { .. } => ErrorCode::Teardown,

            Error::TraceWrite { .. } => ErrorCode::TraceWrite,

            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Get the coarse error kind
    pub fn kind(&self) -> ErrorKind {
        match self.code() as u16 {
            100..=199 => ErrorKind::Config,
            200..=299 => ErrorKind::Io,
            300..=399 => ErrorKind::Store,
            400..=499 => ErrorKind::Protocol,
            500..=599 => ErrorKind::Init,
            600..=699 => ErrorKind::Resource,
            700..=799 => ErrorKind::Trace,
            _ => ErrorKind::Internal,
        }
    }

    /// Whether re-invoking the whole round may succeed
    ///
    /// The coordinator never retries on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Store {
                source: StoreError::Unreachable(_) | StoreError::WaitTimeout { .. },
                ..
            }
        )
    }

    /// Whether the error leaves the owning handle unusable
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Config | ErrorKind::Init | ErrorKind::Resource | ErrorKind::Internal
        )
    }

    /// Get the exit code for CLI
    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    // ─────────────────────────────────────────────────────────────
    // User-Friendly Messages
    // ─────────────────────────────────────────────────────────────

    /// Get a user-friendly suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::ConfigNotFound { .. } => Some(
                "Run 'oob-bootstrap config init' to create a default configuration file."
            ),
            Error::ConfigParse { .. } => Some(
                "Check your configuration file syntax. Run 'oob-bootstrap config validate' to see details."
            ),
            Error::ConfigValidation { .. } => Some(
                "Review the configuration file and fix the invalid values."
            ),
            Error::InvalidPeer { .. } => Some(
                "Every peer must agree on the group size and use a unique rank below it."
            ),

            Error::Store { source: StoreError::Unreachable(_), .. } => Some(
                "Check that the key-value store is reachable from every peer, then restart the round."
            ),
            Error::Store { source: StoreError::WaitTimeout { .. }, .. } => Some(
                "A peer may have exited before reaching the barrier. Raise 'rendezvous.wait_timeout_ms' or restart all peers."
            ),

            Error::CounterOvershoot { .. } => Some(
                "Two rounds are sharing one namespace concurrently. Serialize round initiation or use distinct namespaces."
            ),

            Error::ThreadModeUnsupported { .. } => Some(
                "The communication library was built without multithreading support. Rebuild it with thread-multiple enabled."
            ),

            Error::ContextCreate { .. } => Some(
                "Verify every peer started with the same namespace and group size."
            ),
            Error::EngineFailure { .. } => Some(
                "The engine is in an unknown state. Destroy the communicator and do not reuse it."
            ),

            Error::TraceWrite { .. } => Some(
                "Set OOB_COMMS_TRACE_OUTPUT_DIR to a writable directory."
            ),

            _ => None,
        }
    }

    /// Format the error for terminal display with colors
    pub fn format_for_terminal(&self) -> String {
        let mut output = format!(
            "\x1b[31mError [{}]\x1b[0m: {}\n",
            self.code().as_str(),
            self
        );

        if let Some(hint) = self.suggestion() {
            output.push_str(&format!("\n\x1b[33mHint\x1b[0m: {}\n", hint));
        }

        output
    }

    /// Format the error for logging (no colors)
    pub fn format_for_log(&self) -> String {
        format!("[{}] {}", self.code().as_str(), self)
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    /// Create a config validation error
    pub fn config_validation(message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: None,
        }
    }

    /// Create a config validation error with field name
    pub fn config_field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Wrap a store failure with the operation and key it hit
    pub fn store(op: StoreOp, key: impl Into<String>, source: StoreError) -> Self {
        Error::Store {
            op,
            key: key.into(),
            source,
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(operation: &'static str, state: impl fmt::Display) -> Self {
        Error::InvalidState {
            operation,
            state: state.to_string(),
        }
    }
}
