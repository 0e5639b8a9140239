//! Standard block modules for the quickstream runtime.
//!
//! These ship as builtins: call [`register_standard_builtins`] on a
//! [`Runtime`] and the modules become loadable by name, with shared
//! objects of the same name still taking precedence on the block path.
//!
//! - `sequence`: source emitting a bounded run of numbered packets
//! - `passthrough`: forwards packets unchanged
//! - `counter`: replaces each packet with the running packet count
//! - `null`: consumes and discards packets

#![warn(missing_docs)]
#![warn(clippy::all)]

mod counter;
mod null;
mod passthrough;
mod sequence;

pub use counter::Counter;
pub use null::Null;
pub use passthrough::Passthrough;
pub use sequence::Sequence;

use quickstream_core::{Result, Runtime};

/// Register every standard block module on `runtime`.
pub fn register_standard_builtins(runtime: &Runtime) -> Result<()> {
    runtime.register_builtin("sequence", || Box::new(Sequence::default()))?;
    runtime.register_builtin("passthrough", || Box::new(Passthrough::default()))?;
    runtime.register_builtin("counter", || Box::new(Counter::default()))?;
    runtime.register_builtin("null", || Box::new(Null::default()))?;
    tracing::debug!("standard block modules registered");
    Ok(())
}
