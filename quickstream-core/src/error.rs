//! Error types for the quickstream runtime.
//!
//! Two failure taxonomies are deliberately distinct. Recoverable
//! operational failures (a module file that cannot be found, a name
//! collision, a module rejecting its own construction) are reported
//! through [`QsError`] and always leave the graph in its prior consistent
//! state. Programming-contract violations (structural calls off the main
//! thread, a block re-entering its own lifecycle callback) panic instead;
//! they indicate an embedder or module bug, not a runtime condition.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for quickstream operations.
#[derive(Error, Debug)]
pub enum QsError {
    // =========================================================================
    // Dictionary Errors (E001-E099)
    // =========================================================================
    /// A dictionary key contained a byte outside the printable ASCII range.
    #[error("E001: Invalid dictionary key {key:?}: byte 0x{byte:02x} outside printable range")]
    InvalidKey {
        /// The offending key.
        key: String,
        /// The first out-of-range byte.
        byte: u8,
    },

    // =========================================================================
    // Module Loader Errors (E101-E199)
    // =========================================================================
    /// No shared object or built-in module matched the requested name.
    #[error("E101: Module '{name}' not found (no file in the search path, no built-in)")]
    ModuleNotFound {
        /// The requested module name.
        name: String,
    },

    /// The dynamic library could not be opened.
    #[error("E102: Failed to open module at {path}: {cause}")]
    ModuleOpen {
        /// The resolved library path.
        path: PathBuf,
        /// Reason for the open failure.
        cause: String,
    },

    /// The opened library does not export the block entry symbol.
    #[error("E103: Module at {path} has no usable entry symbol: {cause}")]
    ModuleSymbol {
        /// The resolved library path.
        path: PathBuf,
        /// Reason for the lookup failure.
        cause: String,
    },

    /// Filesystem failure while producing an isolated copy of a module.
    #[error("E104: Failed to copy module {path} for isolation: {cause}")]
    ModuleIo {
        /// The library being copied.
        path: PathBuf,
        /// The underlying I/O error.
        cause: String,
    },

    // =========================================================================
    // Block Errors (E201-E299)
    // =========================================================================
    /// A block with this name already exists in the relevant scope.
    #[error("E201: Block name '{name}' is already in use")]
    DuplicateBlockName {
        /// The colliding name.
        name: String,
    },

    /// Automatic name derivation ran out of attempts.
    #[error("E202: Could not derive a unique block name from '{stem}'")]
    BlockNameExhausted {
        /// The module-derived name stem.
        stem: String,
    },

    /// A super block attempted to load its own module as a child.
    #[error("E203: Super block would load itself: {source_id}")]
    SelfLoad {
        /// The module source identity that matched the parent chain.
        source_id: String,
    },

    /// The module's declare callback reported a hard failure.
    #[error("E204: Block '{block}' declare failed: {cause}")]
    DeclareFailed {
        /// The block being constructed.
        block: String,
        /// The module-reported cause.
        cause: String,
    },

    /// No block with the given name exists.
    #[error("E205: Block '{name}' not found")]
    BlockNotFound {
        /// The requested block name.
        name: String,
    },

    /// A child block was requested under a simple (non-super) block.
    #[error("E206: Block '{name}' is not a super block and cannot own children")]
    NotSuper {
        /// The would-be parent.
        name: String,
    },

    /// A child block was created without an explicit name.
    #[error("E207: Child blocks of '{parent}' must be given an explicit name")]
    ChildNeedsName {
        /// The parent super block.
        parent: String,
    },

    /// The block was destroyed while a queued operation was pending.
    #[error("E208: Block '{name}' was destroyed before the operation completed")]
    BlockGone {
        /// The destroyed block.
        name: String,
    },

    /// The operation only applies to simple blocks.
    #[error("E209: Block '{name}' is not a simple block")]
    NotSimple {
        /// The block the operation was attempted on.
        name: String,
    },

    // =========================================================================
    // Graph Errors (E301-E399)
    // =========================================================================
    /// Structural mutation attempted while the graph streams are running.
    #[error("E301: Graph is {state}; stop the streams before changing structure")]
    NotPaused {
        /// The current flow state.
        state: String,
    },

    /// A named stream port does not exist on the block.
    #[error("E302: Block '{block}' has no port '{port}'")]
    PortNotFound {
        /// The block searched.
        block: String,
        /// The missing port name.
        port: String,
    },

    /// The input port already has a feeder connected.
    #[error("E303: Input '{port}' of block '{block}' already has a feeder")]
    InputOccupied {
        /// The block owning the input.
        block: String,
        /// The occupied input port.
        port: String,
    },

    /// The requested connection would create a stream cycle.
    #[error("E304: Connecting '{from}' to '{to}' would create a stream cycle")]
    StreamCycle {
        /// The feeding block.
        from: String,
        /// The consuming block.
        to: String,
    },

    /// A module's start callback failed.
    #[error("E305: Block '{block}' failed to start: {cause}")]
    StartFailed {
        /// The block whose start failed.
        block: String,
        /// The module-reported cause.
        cause: String,
    },

    // =========================================================================
    // Thread Pool Errors (E401-E499)
    // =========================================================================
    /// A thread pool with this name already exists in the graph.
    #[error("E401: Thread pool '{name}' already exists")]
    ThreadPoolExists {
        /// The colliding pool name.
        name: String,
    },

    /// No thread pool with the given name exists.
    #[error("E402: Thread pool '{name}' not found")]
    ThreadPoolNotFound {
        /// The requested pool name.
        name: String,
    },

    /// Destroying the last thread pool of a graph is refused.
    #[error("E403: Thread pool '{name}' is the graph's last pool and cannot be destroyed")]
    LastThreadPool {
        /// The surviving pool.
        name: String,
    },

    /// Destroying a pool that still has blocks assigned is refused.
    #[error("E404: Thread pool '{name}' still has {blocks} assigned block(s)")]
    ThreadPoolBusy {
        /// The busy pool.
        name: String,
        /// Number of blocks still assigned.
        blocks: usize,
    },

    /// The block's parameter job queue is full.
    #[error("E405: Parameter queue of block '{block}' is full ({capacity})")]
    ParameterQueueFull {
        /// The saturated block.
        block: String,
        /// The configured queue capacity.
        capacity: usize,
    },

    /// The block has no parameter with the given name.
    #[error("E406: Block '{block}' has no {kind} parameter '{param}'")]
    UnknownParameter {
        /// The block searched.
        block: String,
        /// The parameter kind ("setter", "getter" or "constant").
        kind: &'static str,
        /// The missing parameter name.
        param: String,
    },

    /// The module reported a failure handling a parameter operation.
    #[error("E407: Parameter '{param}' of block '{block}' failed: {cause}")]
    ParameterFailed {
        /// The block handling the parameter.
        block: String,
        /// The parameter name.
        param: String,
        /// The module-reported cause.
        cause: String,
    },

    // =========================================================================
    // Shared Memory Errors (E501-E599)
    // =========================================================================
    /// No shared memory segment with the given name exists.
    #[error("E501: Shared memory '{name}' not found")]
    MemoryNotFound {
        /// The requested segment name.
        name: String,
    },

    // =========================================================================
    // Module-supplied Errors (E701-E799)
    // =========================================================================
    /// A failure reported by block module code.
    #[error("E701: {message}")]
    Module {
        /// The module-supplied message.
        message: String,
    },
}

impl QsError {
    /// Get the stable error code (e.g., "E001").
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidKey { .. } => "E001",
            Self::ModuleNotFound { .. } => "E101",
            Self::ModuleOpen { .. } => "E102",
            Self::ModuleSymbol { .. } => "E103",
            Self::ModuleIo { .. } => "E104",
            Self::DuplicateBlockName { .. } => "E201",
            Self::BlockNameExhausted { .. } => "E202",
            Self::SelfLoad { .. } => "E203",
            Self::DeclareFailed { .. } => "E204",
            Self::BlockNotFound { .. } => "E205",
            Self::NotSuper { .. } => "E206",
            Self::ChildNeedsName { .. } => "E207",
            Self::BlockGone { .. } => "E208",
            Self::NotSimple { .. } => "E209",
            Self::NotPaused { .. } => "E301",
            Self::PortNotFound { .. } => "E302",
            Self::InputOccupied { .. } => "E303",
            Self::StreamCycle { .. } => "E304",
            Self::StartFailed { .. } => "E305",
            Self::ThreadPoolExists { .. } => "E401",
            Self::ThreadPoolNotFound { .. } => "E402",
            Self::LastThreadPool { .. } => "E403",
            Self::ThreadPoolBusy { .. } => "E404",
            Self::ParameterQueueFull { .. } => "E405",
            Self::UnknownParameter { .. } => "E406",
            Self::ParameterFailed { .. } => "E407",
            Self::MemoryNotFound { .. } => "E501",
            Self::Module { .. } => "E701",
        }
    }

    /// Construct a module-supplied error from any displayable cause.
    ///
    /// This is the error modules return from their own callbacks
    /// (`declare`, `flow`, parameter handlers).
    pub fn module(message: impl Into<String>) -> Self {
        Self::Module {
            message: message.into(),
        }
    }

    /// Check if this error is a lookup miss (name/port/module not found).
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ModuleNotFound { .. }
                | Self::BlockNotFound { .. }
                | Self::PortNotFound { .. }
                | Self::ThreadPoolNotFound { .. }
                | Self::MemoryNotFound { .. }
                | Self::UnknownParameter { .. }
        )
    }

    /// Check if this error is a naming/uniqueness conflict.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::DuplicateBlockName { .. }
                | Self::ThreadPoolExists { .. }
                | Self::InputOccupied { .. }
        )
    }
}

/// Result type alias using [`QsError`].
pub type Result<T> = std::result::Result<T, QsError>;
