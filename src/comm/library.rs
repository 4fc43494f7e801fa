//! Communication library trait definitions
//!
//! Defines the `CommLibrary` trait every library binding implements. Handles
//! are typed newtypes issued by the library; the wrapper never inspects them.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::OobAllgather;
use crate::trace::PayloadInfo;

/// Option overridden with the peer count before library init
pub const ESTIMATED_NUM_EPS: &str = "ESTIMATED_NUM_EPS";

// ─────────────────────────────────────────────────────────────────
// Capabilities & Configuration
// ─────────────────────────────────────────────────────────────────

/// Thread-safety level a library supports, weakest first
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ThreadMode {
    Single,
    Funneled,
    #[default]
    Multi,
}

impl ThreadMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreadMode::Single => "single",
            ThreadMode::Funneled => "funneled",
            ThreadMode::Multi => "multi",
        }
    }
}

impl fmt::Display for ThreadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability descriptor reported by the library
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryAttributes {
    pub name: String,
    pub version: String,
    pub max_thread_mode: ThreadMode,
}

/// Key/value option table read from the library's environment prefix
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LibraryConfig {
    prefix: String,
    options: BTreeMap<String, String>,
}

impl LibraryConfig {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            options: BTreeMap::new(),
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    /// Set one option, replacing any previous value
    pub fn modify(&mut self, key: &str, value: impl Into<String>) -> LibraryResult<()> {
        if key.is_empty() {
            return Err(LibraryError::InvalidParam("empty option name".into()));
        }
        self.options.insert(key.to_string(), value.into());
        Ok(())
    }

    pub fn options(&self) -> impl Iterator<Item = (&str, &str)> {
        self.options.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

// ─────────────────────────────────────────────────────────────────
// Handles
// ─────────────────────────────────────────────────────────────────

/// Library-level handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LibraryHandle(pub u64);

/// Worker / progress engine handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerHandle(pub u64);

/// Communication context handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextHandle(pub u64);

/// Outstanding operation identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ─────────────────────────────────────────────────────────────────
// Operations
// ─────────────────────────────────────────────────────────────────

/// Parameters for context creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextParams {
    pub rank: usize,
    pub size: usize,
    /// Context shared by every peer in the group
    pub shared: bool,
}

/// Progress of one outstanding operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationStatus {
    InProgress,
    Complete,
    Failed(String),
}

/// Operation to post on a context
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationDesc {
    /// Operation name, e.g. "allreduce"
    pub name: String,
    pub input: Option<PayloadInfo>,
    pub output: Option<PayloadInfo>,
    /// Root rank for rooted operations
    pub root: Option<usize>,
    pub in_split: Option<Vec<u64>>,
    pub out_split: Option<Vec<u64>>,
}

impl OperationDesc {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_input(mut self, input: PayloadInfo) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_output(mut self, output: PayloadInfo) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_root(mut self, root: usize) -> Self {
        self.root = Some(root);
        self
    }

    pub fn with_splits(mut self, in_split: Vec<u64>, out_split: Vec<u64>) -> Self {
        self.in_split = Some(in_split);
        self.out_split = Some(out_split);
        self
    }
}

// ─────────────────────────────────────────────────────────────────
// Library Errors
// ─────────────────────────────────────────────────────────────────

/// Status reported by a failing library call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LibraryError {
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("no resource: {0}")]
    NoResource(String),

    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    #[error("out-of-band exchange failed: {0}")]
    OobFailed(String),

    #[error("engine error: {0}")]
    Engine(String),
}

pub type LibraryResult<T> = std::result::Result<T, LibraryError>;

// ─────────────────────────────────────────────────────────────────
// CommLibrary Trait
// ─────────────────────────────────────────────────────────────────

/// External communication library
///
/// Implementations must tolerate concurrent calls from several threads once
/// they report `ThreadMode::Multi`.
pub trait CommLibrary: Send + Sync {
    // ─────────────────────────────────────────────────────────────
    // Setup
    // ─────────────────────────────────────────────────────────────

    /// Report capabilities; called before anything is acquired
    fn query_attributes(&self) -> LibraryResult<LibraryAttributes>;

    /// Read the option table for an environment prefix
    fn read_config(&self, prefix: &str) -> LibraryResult<LibraryConfig>;

    /// Initialize the library-level handle
    fn init(&self, config: &LibraryConfig) -> LibraryResult<LibraryHandle>;

    /// Create a progress engine bound to `lib`
    fn create_worker(&self, lib: LibraryHandle, thread_mode: ThreadMode)
        -> LibraryResult<WorkerHandle>;

    /// Create a context, exchanging addresses through `oob`
    ///
    /// The library drives `oob` to completion (`allgather`, `test` until
    /// done, `free`) before returning.
    fn create_context(
        &self,
        lib: LibraryHandle,
        worker: WorkerHandle,
        params: &ContextParams,
        oob: &dyn OobAllgather,
    ) -> LibraryResult<ContextHandle>;

    /// Peer addresses gathered during context creation, by rank
    fn context_peers(&self, ctx: ContextHandle) -> LibraryResult<Vec<Vec<u8>>>;

    // ─────────────────────────────────────────────────────────────
    // Runtime
    // ─────────────────────────────────────────────────────────────

    /// Advance the engine one non-blocking step; returns operations completed
    fn progress(&self, ctx: ContextHandle) -> LibraryResult<usize>;

    fn post_operation(&self, ctx: ContextHandle, desc: &OperationDesc)
        -> LibraryResult<OperationId>;

    fn operation_status(&self, ctx: ContextHandle, op: OperationId)
        -> LibraryResult<OperationStatus>;

    /// Return a finished operation's resources to the engine
    fn finalize_operation(&self, ctx: ContextHandle, op: OperationId) -> LibraryResult<()>;

    // ─────────────────────────────────────────────────────────────
    // Teardown
    // ─────────────────────────────────────────────────────────────

    fn destroy_context(&self, ctx: ContextHandle) -> LibraryResult<()>;

    fn destroy_worker(&self, worker: WorkerHandle) -> LibraryResult<()>;

    fn finalize(&self, lib: LibraryHandle) -> LibraryResult<()>;
}
