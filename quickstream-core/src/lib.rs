//! quickstream-core: a block-based dataflow runtime.
//!
//! Applications assemble a [`Graph`] of blocks, each backed by a
//! [`BlockModule`] loaded from a shared object or a registered builtin,
//! connect their stream ports and start the flow. Worker [`ThreadPool`]s
//! execute block jobs; the graph guarantees a block's module callbacks
//! never run concurrently with each other.
//!
//! ```no_run
//! use quickstream_core::{Runtime, RuntimeConfig};
//!
//! # fn main() -> quickstream_core::Result<()> {
//! let runtime = Runtime::with_config(RuntimeConfig::from_env());
//! let graph = runtime.create_graph(Some("pipeline"));
//! let source = graph.create_block(None, "sequence", None)?.unwrap();
//! let sink = graph.create_block(None, "null", None)?.unwrap();
//! graph.connect(&source, "out", &sink, "in")?;
//! graph.start()?;
//! graph.wait();
//! graph.stop()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod block;
mod config;
mod context;
mod dict;
mod error;
mod graph;
mod memory;
mod module;
mod pool;
mod runtime;
mod value;

pub use block::Block;
pub use config::{RuntimeConfig, DEFAULT_PARAMETER_QUEUE_LENGTH};
pub use dict::{Dict, DictCursor, Insert, Remove};
pub use error::{QsError, Result};
pub use graph::{FlowState, Graph, DEFAULT_POOL_NAME};
pub use memory::{MemoryGuard, SharedMemory};
pub use module::{
    BlockModule, DeclareContext, DeclareStatus, FlowContext, FlowStatus, ModuleOptions, Packet,
    StartContext, ENTRY_SYMBOL,
};
pub use pool::{ThreadPool, DEFAULT_MAX_THREADS};
pub use runtime::Runtime;
pub use value::Value;
