//! Block module ABI: the contract between the runtime and block code.
//!
//! A block module is the behavior behind a block. It may be compiled into
//! the application and registered as a builtin, or live in a dynamically
//! loaded shared object exporting [`ENTRY_SYMBOL`] (usually via
//! [`export_block_module!`](crate::export_block_module)). Either way the
//! runtime drives it through the [`BlockModule`] trait: `declare` once at
//! load, `start`/`flow`/`stop` per run cycle, `undeclare`/`destroy` at
//! teardown.

mod loader;
mod registry;

pub(crate) use loader::{ModuleLoader, ModuleSource};
pub(crate) use registry::BuiltinRegistry;

use crate::block::Block;
use crate::error::{QsError, Result};
use crate::graph::Graph;
use crate::value::Value;
use std::sync::Arc;

/// Symbol a dynamic block module must export.
pub const ENTRY_SYMBOL: &str = "quickstream_block_module";

/// A unit of data flowing between blocks.
pub type Packet = Vec<u8>;

/// Static properties a module reports before anything else runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModuleOptions {
    /// Super modules build sub-graphs: blocks they load during `declare`
    /// become their children and they take no part in streaming.
    pub is_super: bool,
    /// Opt out of copy-isolation. By default every load of the same
    /// shared object gets its own copy of the object's global state; a
    /// module that deliberately shares state across its instances sets
    /// this.
    pub allow_shared_state: bool,
}

/// What `declare` asks the runtime to do with the freshly loaded block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclareStatus {
    /// Keep the block in the graph.
    Keep,
    /// Unload immediately without treating the load as a failure. Used by
    /// modules that only exist for their declare-time side effects.
    Unload,
}

/// What `flow` reports about this block's appetite for more work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    /// Call `flow` again soon, even without new input.
    Again,
    /// Nothing to do until new input arrives.
    Idle,
    /// This block is done for the rest of the run; `flow` will not be
    /// called again until the next start.
    Finished,
}

/// Declare-time interface handed to [`BlockModule::declare`].
///
/// This is the only point where a block may shape its interface: ports,
/// parameters and constants are fixed once `declare` returns.
pub struct DeclareContext<'a> {
    graph: &'a Graph,
    block: &'a Arc<Block>,
}

impl<'a> DeclareContext<'a> {
    pub(crate) fn new(graph: &'a Graph, block: &'a Arc<Block>) -> Self {
        Self { graph, block }
    }

    /// The graph the block is being loaded into. Super modules use this to
    /// load their children.
    pub fn graph(&self) -> &Graph {
        self.graph
    }

    /// Full colon-joined name of the block being declared.
    pub fn block_name(&self) -> String {
        self.block.name().to_string()
    }

    /// Declare an input port, returning its index.
    pub fn add_input(&mut self, name: &str) -> Result<usize> {
        self.block.add_input(name)
    }

    /// Declare an output port, returning its index.
    pub fn add_output(&mut self, name: &str) -> Result<usize> {
        self.block.add_output(name)
    }

    /// Declare a settable parameter.
    pub fn add_setter(&mut self, name: &str, description: &str) -> Result<()> {
        self.block.add_setter(name, description)
    }

    /// Declare a gettable parameter.
    pub fn add_getter(&mut self, name: &str, description: &str) -> Result<()> {
        self.block.add_getter(name, description)
    }

    /// Publish a constant, readable without touching the module.
    pub fn add_constant(&mut self, name: &str, value: Value) -> Result<()> {
        self.block.add_constant(name, value)
    }

    /// Bound how many ports `start` will accept connections on.
    pub fn set_port_limits(&mut self, max_inputs: Option<usize>, max_outputs: Option<usize>) {
        self.block.set_port_limits(max_inputs, max_outputs);
    }

    /// Register a file to be deleted when the block is destroyed.
    pub fn add_run_file(&mut self, path: std::path::PathBuf) {
        self.block.add_run_file(path);
    }
}

/// Connection snapshot handed to [`BlockModule::start`] and
/// [`BlockModule::stop`].
#[derive(Debug, Clone, Default)]
pub struct StartContext {
    pub(crate) connected_inputs: Vec<bool>,
    pub(crate) connected_outputs: Vec<bool>,
}

impl StartContext {
    /// Whether the input port at `index` has a feeding connection.
    pub fn input_connected(&self, index: usize) -> bool {
        self.connected_inputs.get(index).copied().unwrap_or(false)
    }

    /// Whether the output port at `index` has at least one reader.
    pub fn output_connected(&self, index: usize) -> bool {
        self.connected_outputs.get(index).copied().unwrap_or(false)
    }

    /// Number of connected input ports.
    pub fn connected_input_count(&self) -> usize {
        self.connected_inputs.iter().filter(|c| **c).count()
    }

    /// Number of connected output ports.
    pub fn connected_output_count(&self) -> usize {
        self.connected_outputs.iter().filter(|c| **c).count()
    }
}

/// Streaming interface handed to [`BlockModule::flow`].
///
/// Input packets are drained from the port queues before the call; output
/// packets are buffered here and delivered to reader blocks after the
/// call returns, outside the module lock.
pub struct FlowContext {
    inputs: Vec<Vec<Packet>>,
    emitted: Vec<(usize, Packet)>,
}

impl FlowContext {
    /// Build a context with the given per-port input packets. Lets an
    /// embedder (or a test) drive a module's `flow` without a graph.
    pub fn new(inputs: Vec<Vec<Packet>>) -> Self {
        Self {
            inputs,
            emitted: Vec::new(),
        }
    }

    /// Consume the context, returning the `(output port, packet)` pairs
    /// the module emitted.
    pub fn into_emitted(self) -> Vec<(usize, Packet)> {
        self.emitted
    }

    /// Number of declared input ports.
    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    /// Take all packets pending on input `port` (empty if none, or if the
    /// port index is out of range).
    pub fn take_input(&mut self, port: usize) -> Vec<Packet> {
        match self.inputs.get_mut(port) {
            Some(queue) => std::mem::take(queue),
            None => Vec::new(),
        }
    }

    /// Packets pending on input `port`, without consuming them.
    pub fn peek_input(&self, port: usize) -> &[Packet] {
        self.inputs.get(port).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Emit a packet on output `port`.
    pub fn output(&mut self, port: usize, packet: Packet) {
        self.emitted.push((port, packet));
    }
}

/// Behavior of a block, builtin or dynamically loaded.
///
/// Only `declare` is mandatory; the defaults make a do-nothing block.
/// `flow` runs on thread-pool workers, so implementations must be `Send`;
/// the runtime guarantees at most one callback runs on a given instance
/// at a time.
pub trait BlockModule: Send {
    /// Static module properties. Read once, before `declare`.
    fn options(&self) -> ModuleOptions {
        ModuleOptions::default()
    }

    /// Shape the block: ports, parameters, constants, children.
    fn declare(&mut self, ctx: &mut DeclareContext<'_>) -> Result<DeclareStatus>;

    /// The graph is starting; connections are now known and fixed.
    fn start(&mut self, _ctx: &StartContext) -> Result<()> {
        Ok(())
    }

    /// The graph is stopping. Infallible: stop must always complete.
    fn stop(&mut self, _ctx: &StartContext) {}

    /// Process pending input and/or generate output.
    fn flow(&mut self, _ctx: &mut FlowContext) -> Result<FlowStatus> {
        Ok(FlowStatus::Idle)
    }

    /// A declared setter was written. Only called for names registered
    /// with [`DeclareContext::add_setter`].
    fn set_parameter(&mut self, name: &str, _value: Value) -> Result<()> {
        Err(QsError::module(format!("setter '{name}' not handled")))
    }

    /// A declared getter was read. Only called for names registered with
    /// [`DeclareContext::add_getter`].
    fn get_parameter(&mut self, name: &str) -> Result<Value> {
        Err(QsError::module(format!("getter '{name}' not handled")))
    }

    /// Inverse of `declare`, called during block destruction while the
    /// block's interface is still intact.
    fn undeclare(&mut self) {}

    /// Last callback before the instance is dropped.
    fn destroy(&mut self) {}
}

/// Export a type as a dynamic block module.
///
/// Expands to the `extern "C"` entry point the loader resolves. The
/// expression is evaluated once per load and double-boxed so the fat
/// trait-object pointer survives the C ABI:
///
/// ```ignore
/// quickstream_core::export_block_module!(MyBlock::default());
/// ```
#[macro_export]
macro_rules! export_block_module {
    ($ctor:expr) => {
        #[no_mangle]
        pub extern "C" fn quickstream_block_module() -> *mut ::std::os::raw::c_void {
            let module: Box<dyn $crate::BlockModule> = Box::new($ctor);
            Box::into_raw(Box::new(module)) as *mut ::std::os::raw::c_void
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Minimal;

    impl BlockModule for Minimal {
        fn declare(&mut self, _ctx: &mut DeclareContext<'_>) -> Result<DeclareStatus> {
            Ok(DeclareStatus::Keep)
        }
    }

    #[test]
    fn defaults_make_a_do_nothing_block() {
        let mut m = Minimal;
        assert!(!m.options().is_super);
        assert!(!m.options().allow_shared_state);
        let mut flow = FlowContext::new(vec![]);
        assert_eq!(m.flow(&mut flow).unwrap(), FlowStatus::Idle);
        assert!(m.set_parameter("x", Value::int(1)).is_err());
        assert!(m.get_parameter("x").is_err());
    }

    #[test]
    fn flow_context_buffers_emissions() {
        let mut ctx = FlowContext::new(vec![vec![b"one".to_vec(), b"two".to_vec()], vec![]]);
        assert_eq!(ctx.input_count(), 2);
        assert_eq!(ctx.peek_input(0).len(), 2);
        let taken = ctx.take_input(0);
        assert_eq!(taken.len(), 2);
        assert!(ctx.take_input(0).is_empty());
        assert!(ctx.take_input(9).is_empty());

        ctx.output(1, b"out".to_vec());
        let emitted = ctx.into_emitted();
        assert_eq!(emitted, vec![(1, b"out".to_vec())]);
    }

    #[test]
    fn start_context_reports_connections() {
        let ctx = StartContext {
            connected_inputs: vec![true, false],
            connected_outputs: vec![true],
        };
        assert!(ctx.input_connected(0));
        assert!(!ctx.input_connected(1));
        assert!(!ctx.input_connected(5));
        assert_eq!(ctx.connected_input_count(), 1);
        assert_eq!(ctx.connected_output_count(), 1);
    }
}
