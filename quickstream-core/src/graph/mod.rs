//! Graph: the container tying blocks, connections and thread pools
//! together.
//!
//! A graph alternates between two regimes. While *paused*, the embedder's
//! creating thread may restructure it: load and destroy blocks, connect
//! ports, manage pools. While *running*, workers execute flow jobs and the
//! structure is frozen. Structural calls off the creating thread are a
//! contract violation and panic; operational failures return errors and
//! leave the graph consistent.

use crate::block::{Block, Feeder, Job, Reader};
use crate::context;
use crate::dict::{Dict, Remove};
use crate::error::{QsError, Result};
use crate::memory::{MemorySlot, SharedMemory};
use crate::module::{DeclareContext, DeclareStatus, StartContext};
use crate::pool::{discard_jobs, PoolShared, ThreadPool, DEFAULT_MAX_THREADS};
use crate::runtime::Runtime;
use crate::value::Value;
use parking_lot::{Condvar, Mutex, ReentrantMutex};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::sync_channel;
use std::sync::{Arc, Weak};
use std::thread::ThreadId;
use uuid::Uuid;

/// Name of the pool every graph starts with.
pub const DEFAULT_POOL_NAME: &str = "default";

const AUTO_NAME_ATTEMPTS: usize = 1000;

/// Whether a graph's streams are flowing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// Structure may change; no flow jobs execute.
    Paused,
    /// Streams are flowing; structure is frozen.
    Running,
    /// A module failed while running; flow has been abandoned. `stop`
    /// returns the graph to `Paused`.
    Failed,
}

impl std::fmt::Display for FlowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Paused => "paused",
            Self::Running => "running",
            Self::Failed => "failed",
        })
    }
}

struct BlockTable {
    by_name: Dict<Arc<Block>>,
    /// Load order, children included. Start runs forward, stop backward.
    order: Vec<Arc<Block>>,
}

struct PoolTable {
    pools: Vec<ThreadPool>,
    default_index: usize,
}

pub(crate) struct GraphInner {
    id: Uuid,
    name: String,
    runtime: Runtime,
    main_thread: ThreadId,
    /// Held across structural operations. Reentrant so a super block's
    /// declare can load children while its own load holds the lock.
    structural: ReentrantMutex<()>,
    table: Mutex<BlockTable>,
    pools: Mutex<PoolTable>,
    state: Mutex<FlowState>,
    state_changed: Condvar,
    /// Jobs queued but not yet fully executed, graph-wide.
    pending: Mutex<usize>,
    quiescent: Condvar,
    /// Blocks whose start callback ran, with their connection snapshots,
    /// so stop can mirror them in reverse.
    started: Mutex<Vec<(Arc<Block>, StartContext)>>,
    memory: Mutex<Dict<Arc<MemorySlot>>>,
    torn_down: AtomicBool,
}

impl GraphInner {
    pub(crate) fn job_added(&self) {
        *self.pending.lock() += 1;
    }

    pub(crate) fn job_done(&self) {
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.quiescent.notify_all();
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        *self.state.lock() == FlowState::Running
    }

    /// Abandon the run after a module failure. Idempotent; only a running
    /// graph can fail.
    pub(crate) fn set_failed(&self) {
        let mut state = self.state.lock();
        if *state == FlowState::Running {
            *state = FlowState::Failed;
            tracing::error!(graph = %self.name, "graph failed, abandoning flow");
            self.state_changed.notify_all();
        }
    }

    pub(crate) fn assert_main_thread(&self, operation: &str) {
        assert_eq!(
            std::thread::current().id(),
            self.main_thread,
            "{operation} called off the graph's creating thread"
        );
    }

    /// Structural mutation is legal while `Paused` or `Failed`; only a
    /// running graph rejects it.
    pub(crate) fn require_not_running(&self) -> Result<()> {
        let state = *self.state.lock();
        if state == FlowState::Running {
            Err(QsError::NotPaused {
                state: state.to_string(),
            })
        } else {
            Ok(())
        }
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<Arc<Block>> {
        self.table
            .lock()
            .by_name
            .find(name)
            .filter(|b| !b.is_dead())
            .cloned()
    }

    pub(crate) fn has_block_name(&self, name: &str) -> bool {
        self.table.lock().by_name.find(name).is_some()
    }
}

/// A dataflow graph.
///
/// Created by [`Runtime::create_graph`]; dropped (or explicitly
/// [`destroy`](Graph::destroy)ed), it stops its streams, destroys its
/// blocks and shuts its pools down. The handle is deliberately not
/// clonable: one owner, one teardown.
pub struct Graph {
    inner: Arc<GraphInner>,
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("name", &self.inner.name)
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Graph {
    pub(crate) fn new(runtime: Runtime, name: String) -> Self {
        let inner = Arc::new(GraphInner {
            id: Uuid::new_v4(),
            name,
            runtime,
            main_thread: std::thread::current().id(),
            structural: ReentrantMutex::new(()),
            table: Mutex::new(BlockTable {
                by_name: Dict::new(),
                order: Vec::new(),
            }),
            pools: Mutex::new(PoolTable {
                pools: Vec::new(),
                default_index: 0,
            }),
            state: Mutex::new(FlowState::Paused),
            state_changed: Condvar::new(),
            pending: Mutex::new(0),
            quiescent: Condvar::new(),
            started: Mutex::new(Vec::new()),
            memory: Mutex::new(Dict::new()),
            torn_down: AtomicBool::new(false),
        });
        let default_pool = ThreadPool {
            shared: PoolShared::new(
                DEFAULT_POOL_NAME,
                Arc::downgrade(&inner),
                DEFAULT_MAX_THREADS,
            ),
        };
        inner.pools.lock().pools.push(default_pool);
        tracing::info!(graph = %inner.name, id = %inner.id, "graph created");
        Self { inner }
    }

    pub(crate) fn inner_weak(&self) -> Weak<GraphInner> {
        Arc::downgrade(&self.inner)
    }

    /// The graph's unique id.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// The graph's name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current flow state.
    pub fn state(&self) -> FlowState {
        *self.inner.state.lock()
    }

    // ------------------------------------------------------------------
    // Blocks
    // ------------------------------------------------------------------

    /// Load a block module into the graph.
    ///
    /// `block_name` names the block explicitly; left out, a unique name is
    /// derived from the module name. Simple blocks are assigned to `pool`,
    /// or to the default pool. Called from inside a super block's declare
    /// callback, the new block becomes that super's child and an explicit
    /// name is mandatory.
    ///
    /// Returns `Ok(None)` when the module's declare asks to be unloaded;
    /// that is a successful load with nothing kept.
    pub fn create_block(
        &self,
        pool: Option<&ThreadPool>,
        module_name: &str,
        block_name: Option<&str>,
    ) -> Result<Option<Arc<Block>>> {
        self.inner.assert_main_thread("Graph::create_block");
        let _structural = self.inner.structural.lock();
        self.inner.require_not_running()?;

        let parent = context::current()
            .filter(|b| b.graph_inner().map(|g| Arc::ptr_eq(&g, &self.inner)) == Some(true));

        let loaded = self.inner.runtime.load_module(module_name)?;
        let options = loaded.0.options();

        if let Some(parent) = &parent {
            if parent.super_block().is_none() {
                return Err(QsError::NotSuper {
                    name: parent.name().to_string(),
                });
            }
            // A module chain loading itself would recurse without bound.
            let identity = loaded.1.identity();
            let mut ancestor = Some(Arc::clone(parent));
            while let Some(a) = ancestor {
                if a.source().identity() == identity {
                    return Err(QsError::SelfLoad {
                        source_id: identity,
                    });
                }
                ancestor = a.parent();
            }
        }

        let full_name = self.resolve_block_name(parent.as_ref(), module_name, block_name)?;

        let pool_shared = if options.is_super {
            None
        } else {
            let pools = self.inner.pools.lock();
            let chosen = match pool {
                Some(p) => pools
                    .pools
                    .iter()
                    .find(|member| member.is(&p.shared))
                    .ok_or_else(|| QsError::ThreadPoolNotFound {
                        name: p.name(),
                    })?,
                None => &pools.pools[pools.default_index],
            };
            Some(Arc::clone(&chosen.shared))
        };

        let (module, source) = loaded;
        let block = Block::new(
            full_name.clone(),
            Arc::downgrade(&self.inner),
            parent.as_ref().map(Arc::downgrade),
            module,
            source,
            options.is_super,
            self.inner.runtime.parameter_queue_length(),
        );
        if let (Some(shared), Ok(simple)) = (&pool_shared, block.simple()) {
            *simple.pool.lock() = Arc::downgrade(shared);
        }

        {
            let mut table = self.inner.table.lock();
            table.by_name.insert(&full_name, Arc::clone(&block))?;
            table.order.push(Arc::clone(&block));
        }
        if let Some(parent) = &parent {
            if let Some(sup) = parent.super_block() {
                sup.children.lock().push(Arc::clone(&block));
            }
        }

        let status = block.with_module(|m| {
            let mut ctx = DeclareContext::new(self, &block);
            m.declare(&mut ctx)
        });

        match status {
            Some(Ok(DeclareStatus::Keep)) => {
                block.freeze_interface();
                tracing::info!(
                    graph = %self.inner.name,
                    block = %full_name,
                    module = module_name,
                    "block created"
                );
                Ok(Some(block))
            }
            Some(Ok(DeclareStatus::Unload)) => {
                tracing::debug!(
                    graph = %self.inner.name,
                    module = module_name,
                    "module requested unload after declare"
                );
                self.dismantle(&block, true);
                Ok(None)
            }
            Some(Err(err)) => {
                // Declare failed: the block never existed as far as the
                // module protocol goes, so no undeclare/destroy.
                self.dismantle(&block, false);
                Err(QsError::DeclareFailed {
                    block: full_name,
                    cause: err.to_string(),
                })
            }
            None => {
                self.dismantle(&block, false);
                Err(QsError::DeclareFailed {
                    block: full_name,
                    cause: "module instance missing".to_string(),
                })
            }
        }
    }

    fn resolve_block_name(
        &self,
        parent: Option<&Arc<Block>>,
        module_name: &str,
        block_name: Option<&str>,
    ) -> Result<String> {
        if let Some(name) = block_name {
            if name.is_empty() || name.contains(':') {
                return Err(QsError::InvalidKey {
                    key: name.to_string(),
                    byte: b':',
                });
            }
            let full = match parent {
                Some(parent) => format!("{}:{name}", parent.name()),
                None => name.to_string(),
            };
            let taken = match parent {
                Some(_) => self.inner.has_block_name(&full),
                // Top-level names are unique across every graph of the
                // runtime, so flat runtime-wide lookups stay unambiguous.
                None => self.inner.runtime.top_level_name_in_use(&full),
            };
            if taken {
                return Err(QsError::DuplicateBlockName { name: full });
            }
            return Ok(full);
        }

        let Some(parent) = parent else {
            let stem = derive_name_stem(module_name);
            for attempt in 1..=AUTO_NAME_ATTEMPTS {
                let candidate = if attempt == 1 {
                    stem.clone()
                } else {
                    format!("{stem}_{attempt}")
                };
                if !self.inner.runtime.top_level_name_in_use(&candidate) {
                    return Ok(candidate);
                }
            }
            return Err(QsError::BlockNameExhausted { stem });
        };
        Err(QsError::ChildNeedsName {
            parent: parent.name().to_string(),
        })
    }

    /// Remove a half-constructed block without the undeclare/destroy
    /// protocol (`graceful` runs it, for declare-requested unloads).
    fn dismantle(&self, block: &Arc<Block>, graceful: bool) {
        if graceful {
            block.with_module(|m| m.undeclare());
            block.with_module(|m| m.destroy());
        }
        block.mark_dead();
        block.discard_module();
        block.remove_run_files();
        if let Some(parent) = block.parent() {
            if let Some(sup) = parent.super_block() {
                sup.children.lock().retain(|c| !Arc::ptr_eq(c, block));
            }
        }
        let mut table = self.inner.table.lock();
        table.by_name.remove(block.name());
        table.order.retain(|b| !Arc::ptr_eq(b, block));
    }

    /// Destroy a block, its children first.
    ///
    /// Stops the graph's streams if they are running, then runs the
    /// module's undeclare and destroy callbacks, severs every stream
    /// connection touching the block and deletes its run files.
    ///
    /// # Panics
    ///
    /// Panics when called from within the block's own module callback, or
    /// off the creating thread.
    pub fn destroy_block(&self, block: &Arc<Block>) -> Result<()> {
        self.inner.assert_main_thread("Graph::destroy_block");
        let _structural = self.inner.structural.lock();
        // A running graph stops first; destroying live flow is never an
        // error, just an implicit stop.
        self.stop_internal();
        if context::stack_contains(block) {
            panic!(
                "block '{}' cannot be destroyed from within its own module callback",
                block.name()
            );
        }
        if block.is_dead() {
            return Ok(());
        }
        let same_graph = block.graph_inner().map(|g| Arc::ptr_eq(&g, &self.inner));
        if same_graph != Some(true) {
            return Err(QsError::BlockNotFound {
                name: block.name().to_string(),
            });
        }
        self.destroy_block_inner(block);
        Ok(())
    }

    fn destroy_block_inner(&self, block: &Arc<Block>) {
        // Children die first, youngest first.
        for child in block.children().into_iter().rev() {
            self.destroy_block_inner(&child);
        }

        block.mark_dead();
        if let Ok(simple) = block.simple() {
            discard_jobs(block);

            // Sever incoming edges: a detached output must not keep
            // feeding a destroyed block's queue.
            let feeders: Vec<(Weak<Block>, usize, usize)> = {
                let ports = simple.ports.lock();
                ports
                    .inputs
                    .iter()
                    .enumerate()
                    .filter_map(|(idx, p)| {
                        p.feeder.as_ref().map(|f| (f.block.clone(), f.output, idx))
                    })
                    .collect()
            };
            for (weak, output, input) in feeders {
                if let Some(feeder) = weak.upgrade() {
                    if let Ok(fs) = feeder.simple() {
                        let mut ports = fs.ports.lock();
                        if let Some(out) = ports.outputs.get_mut(output) {
                            out.readers
                                .retain(|r| !(r.input == input && r.block.ptr_eq(&Arc::downgrade(block))));
                        }
                    }
                }
            }

            // Sever outgoing edges.
            let readers: Vec<(Weak<Block>, usize)> = {
                let ports = simple.ports.lock();
                ports
                    .outputs
                    .iter()
                    .flat_map(|o| o.readers.iter().map(|r| (r.block.clone(), r.input)))
                    .collect()
            };
            for (weak, input) in readers {
                if let Some(reader) = weak.upgrade() {
                    if let Ok(rs) = reader.simple() {
                        let mut ports = rs.ports.lock();
                        if let Some(in_port) = ports.inputs.get_mut(input) {
                            in_port.feeder = None;
                            in_port.queue.clear();
                        }
                    }
                }
            }

            let mut ports = simple.ports.lock();
            for input in &mut ports.inputs {
                input.feeder = None;
                input.queue.clear();
            }
            for output in &mut ports.outputs {
                output.readers.clear();
            }
        }

        // Undeclare while the interface is still inspectable, then the
        // final destroy, then the instance itself.
        block.with_module(|m| m.undeclare());
        block.with_module(|m| m.destroy());
        block.discard_module();
        block.remove_run_files();

        if let Some(parent) = block.parent() {
            if let Some(sup) = parent.super_block() {
                sup.children.lock().retain(|c| !Arc::ptr_eq(c, block));
            }
        }
        {
            let mut table = self.inner.table.lock();
            table.by_name.remove(block.name());
            table.order.retain(|b| !Arc::ptr_eq(b, block));
        }
        tracing::info!(graph = %self.inner.name, block = %block.name(), "block destroyed");
    }

    /// Look a block up by its full colon-joined name.
    pub fn find_block(&self, name: &str) -> Option<Arc<Block>> {
        self.inner.lookup(name)
    }

    /// Every block currently in the graph, in load order.
    pub fn blocks(&self) -> Vec<Arc<Block>> {
        self.inner.table.lock().order.clone()
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    /// Connect `from`'s output port to `to`'s input port.
    ///
    /// An input accepts one feeder; an output fans out freely. The edge is
    /// refused when it would close a stream cycle.
    pub fn connect(
        &self,
        from: &Arc<Block>,
        output: &str,
        to: &Arc<Block>,
        input: &str,
    ) -> Result<()> {
        self.inner.assert_main_thread("Graph::connect");
        let _structural = self.inner.structural.lock();
        self.inner.require_not_running()?;
        self.require_member(from)?;
        self.require_member(to)?;
        let from_simple = from.simple()?;
        let to_simple = to.simple()?;

        let out_idx = from_simple
            .ports
            .lock()
            .output_index(output)
            .ok_or_else(|| QsError::PortNotFound {
                block: from.name().to_string(),
                port: output.to_string(),
            })?;
        let in_idx = to_simple
            .ports
            .lock()
            .input_index(input)
            .ok_or_else(|| QsError::PortNotFound {
                block: to.name().to_string(),
                port: input.to_string(),
            })?;

        {
            let ports = to_simple.ports.lock();
            if ports.inputs[in_idx].feeder.is_some() {
                return Err(QsError::InputOccupied {
                    block: to.name().to_string(),
                    port: input.to_string(),
                });
            }
            if let Some(max) = ports.max_inputs {
                let connected = ports.inputs.iter().filter(|p| p.feeder.is_some()).count();
                if connected >= max {
                    return Err(QsError::module(format!(
                        "block '{}' accepts at most {max} connected input(s)",
                        to.name()
                    )));
                }
            }
        }
        {
            let ports = from_simple.ports.lock();
            if let Some(max) = ports.max_outputs {
                let connected = ports
                    .outputs
                    .iter()
                    .filter(|p| !p.readers.is_empty())
                    .count();
                let already = !ports.outputs[out_idx].readers.is_empty();
                if !already && connected >= max {
                    return Err(QsError::module(format!(
                        "block '{}' accepts at most {max} connected output(s)",
                        from.name()
                    )));
                }
            }
        }

        if Arc::ptr_eq(from, to) || reachable(to, from) {
            return Err(QsError::StreamCycle {
                from: from.name().to_string(),
                to: to.name().to_string(),
            });
        }

        from_simple.ports.lock().outputs[out_idx].readers.push(Reader {
            block: Arc::downgrade(to),
            input: in_idx,
        });
        to_simple.ports.lock().inputs[in_idx].feeder = Some(Feeder {
            block: Arc::downgrade(from),
            output: out_idx,
        });
        tracing::debug!(
            from = %from.name(),
            output,
            to = %to.name(),
            input,
            "ports connected"
        );
        Ok(())
    }

    /// Disconnect the feeder of `block`'s input port, dropping any queued
    /// packets. A port with no feeder is left as is.
    pub fn disconnect(&self, block: &Arc<Block>, input: &str) -> Result<()> {
        self.inner.assert_main_thread("Graph::disconnect");
        let _structural = self.inner.structural.lock();
        self.inner.require_not_running()?;
        self.require_member(block)?;
        let simple = block.simple()?;

        let (in_idx, feeder) = {
            let mut ports = simple.ports.lock();
            let idx = ports
                .input_index(input)
                .ok_or_else(|| QsError::PortNotFound {
                    block: block.name().to_string(),
                    port: input.to_string(),
                })?;
            let port = &mut ports.inputs[idx];
            port.queue.clear();
            (idx, port.feeder.take())
        };
        let Some(feeder) = feeder else {
            return Ok(());
        };
        if let Some(from) = feeder.block.upgrade() {
            if let Ok(fs) = from.simple() {
                let mut ports = fs.ports.lock();
                if let Some(out) = ports.outputs.get_mut(feeder.output) {
                    out.readers
                        .retain(|r| !(r.input == in_idx && r.block.ptr_eq(&Arc::downgrade(block))));
                }
            }
        }
        Ok(())
    }

    fn require_member(&self, block: &Arc<Block>) -> Result<()> {
        let ok = !block.is_dead()
            && block.graph_inner().map(|g| Arc::ptr_eq(&g, &self.inner)) == Some(true);
        if ok {
            Ok(())
        } else {
            Err(QsError::BlockNotFound {
                name: block.name().to_string(),
            })
        }
    }

    // ------------------------------------------------------------------
    // Flow control
    // ------------------------------------------------------------------

    /// Start the streams: run every simple block's start callback in load
    /// order, switch to `Running` and seed source blocks with their first
    /// flow job.
    ///
    /// If any start callback fails, the blocks already started are
    /// stopped in reverse order and the graph stays paused.
    pub fn start(&self) -> Result<()> {
        self.inner.assert_main_thread("Graph::start");
        let _structural = self.inner.structural.lock();
        self.inner.require_not_running()?;

        let blocks = self.inner.table.lock().order.clone();
        let mut started: Vec<(Arc<Block>, StartContext)> = Vec::new();
        for block in &blocks {
            let Ok(simple) = block.simple() else {
                continue;
            };
            simple.finished.store(false, Ordering::Release);
            // Packets from an earlier run never leak into this one.
            simple.ports.lock().drain_queues();
            let ctx = {
                let (connected_inputs, connected_outputs) =
                    simple.ports.lock().connection_snapshot();
                StartContext {
                    connected_inputs,
                    connected_outputs,
                }
            };
            match block.with_module(|m| m.start(&ctx)) {
                Some(Ok(())) => started.push((Arc::clone(block), ctx)),
                Some(Err(err)) => {
                    for (other, other_ctx) in started.into_iter().rev() {
                        other.with_module(|m| m.stop(&other_ctx));
                    }
                    return Err(QsError::StartFailed {
                        block: block.name().to_string(),
                        cause: err.to_string(),
                    });
                }
                None => {}
            }
        }
        *self.inner.started.lock() = started;
        *self.inner.state.lock() = FlowState::Running;
        self.inner.state_changed.notify_all();
        tracing::info!(graph = %self.inner.name, "graph started");

        // Source blocks (no connected inputs) will never be woken by a
        // delivery, so they get their first flow job here.
        for block in &blocks {
            if let Ok(simple) = block.simple() {
                let sourcelike = {
                    let (inputs, _) = simple.ports.lock().connection_snapshot();
                    !inputs.iter().any(|c| *c)
                };
                if sourcelike {
                    let _ = block.enqueue(Job::Flow);
                }
            }
        }
        Ok(())
    }

    /// Stop the streams and return to `Paused`.
    ///
    /// Flow stops being scheduled immediately; the call then waits for
    /// in-flight jobs to drain before running stop callbacks in reverse
    /// start order. Stopping a paused graph is a no-op.
    pub fn stop(&self) -> Result<()> {
        self.inner.assert_main_thread("Graph::stop");
        let _structural = self.inner.structural.lock();
        self.stop_internal();
        Ok(())
    }

    fn stop_internal(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state == FlowState::Paused {
                return;
            }
            *state = FlowState::Paused;
            self.inner.state_changed.notify_all();
        }
        // Leftover flow jobs now discard themselves; the pending counter
        // strictly drains.
        self.wait();
        let started: Vec<(Arc<Block>, StartContext)> =
            self.inner.started.lock().drain(..).collect();
        for (block, ctx) in started.into_iter().rev() {
            block.with_module(|m| m.stop(&ctx));
        }
        for block in self.inner.table.lock().order.iter() {
            if let Ok(simple) = block.simple() {
                simple.ports.lock().drain_queues();
            }
        }
        tracing::info!(graph = %self.inner.name, "graph stopped");
    }

    /// Block until no jobs are queued or executing anywhere in the graph.
    ///
    /// With the graph running, quiescence means every source has finished
    /// and all derived work has drained. May be called from any thread.
    pub fn wait(&self) {
        let mut pending = self.inner.pending.lock();
        while *pending > 0 {
            self.inner.quiescent.wait(&mut pending);
        }
    }

    // ------------------------------------------------------------------
    // Parameters
    // ------------------------------------------------------------------

    /// Queue a write to a block's declared setter. Asynchronous: the
    /// module sees the value when its worker gets to the job.
    pub fn set_parameter(&self, block_name: &str, param: &str, value: Value) -> Result<()> {
        let block = self.find_block(block_name).ok_or_else(|| QsError::BlockNotFound {
            name: block_name.to_string(),
        })?;
        let simple = block.simple()?;
        if simple.setters.lock().find(param).is_none() {
            return Err(QsError::UnknownParameter {
                block: block_name.to_string(),
                kind: "setter",
                param: param.to_string(),
            });
        }
        block.enqueue(Job::SetParameter {
            name: param.to_string(),
            value,
        })
    }

    /// Read a block's declared getter, waiting for the module to answer.
    pub fn get_parameter(&self, block_name: &str, param: &str) -> Result<Value> {
        let block = self.find_block(block_name).ok_or_else(|| QsError::BlockNotFound {
            name: block_name.to_string(),
        })?;
        let simple = block.simple()?;
        if simple.getters.lock().find(param).is_none() {
            return Err(QsError::UnknownParameter {
                block: block_name.to_string(),
                kind: "getter",
                param: param.to_string(),
            });
        }
        if context::stack_contains(&block) {
            // The module lock is held by the very callback asking; the
            // rendezvous below could never complete.
            return Err(QsError::module(format!(
                "block '{block_name}' cannot read its own getter from a module callback"
            )));
        }
        let (reply, answer) = sync_channel(1);
        block.enqueue(Job::GetParameter {
            name: param.to_string(),
            reply,
        })?;
        answer.recv().map_err(|_| QsError::BlockGone {
            name: block_name.to_string(),
        })?
    }

    /// Read a constant a block published at declare time. Immediate; the
    /// module is not involved.
    pub fn constant(&self, block_name: &str, name: &str) -> Result<Value> {
        let block = self.find_block(block_name).ok_or_else(|| QsError::BlockNotFound {
            name: block_name.to_string(),
        })?;
        let simple = block.simple()?;
        let found = simple.constants.lock().find(name).cloned();
        found.ok_or_else(|| QsError::UnknownParameter {
            block: block_name.to_string(),
            kind: "constant",
            param: name.to_string(),
        })
    }

    // ------------------------------------------------------------------
    // Thread pools
    // ------------------------------------------------------------------

    /// Create an additional worker pool.
    pub fn create_thread_pool(&self, name: &str, max_threads: usize) -> Result<ThreadPool> {
        self.inner.assert_main_thread("Graph::create_thread_pool");
        let _structural = self.inner.structural.lock();
        let mut pools = self.inner.pools.lock();
        if pools.pools.iter().any(|p| p.name() == name) {
            return Err(QsError::ThreadPoolExists {
                name: name.to_string(),
            });
        }
        let pool = ThreadPool {
            shared: PoolShared::new(name, Arc::downgrade(&self.inner), max_threads),
        };
        pools.pools.push(pool.clone());
        tracing::debug!(graph = %self.inner.name, pool = name, max_threads, "pool created");
        Ok(pool)
    }

    /// Look a pool up by name.
    pub fn thread_pool(&self, name: &str) -> Option<ThreadPool> {
        self.inner
            .pools
            .lock()
            .pools
            .iter()
            .find(|p| p.name() == name)
            .cloned()
    }

    /// The pool blocks land in when created without an explicit pool.
    pub fn default_thread_pool(&self) -> ThreadPool {
        let pools = self.inner.pools.lock();
        pools.pools[pools.default_index].clone()
    }

    /// Make `pool` the default for future block loads.
    pub fn set_default_thread_pool(&self, pool: &ThreadPool) -> Result<()> {
        self.inner.assert_main_thread("Graph::set_default_thread_pool");
        let mut pools = self.inner.pools.lock();
        match pools.pools.iter().position(|p| p.is(&pool.shared)) {
            Some(index) => {
                pools.default_index = index;
                Ok(())
            }
            None => Err(QsError::ThreadPoolNotFound { name: pool.name() }),
        }
    }

    /// Rename a pool. The new name must be free.
    pub fn rename_thread_pool(&self, pool: &ThreadPool, new_name: &str) -> Result<()> {
        self.inner.assert_main_thread("Graph::rename_thread_pool");
        let pools = self.inner.pools.lock();
        if !pools.pools.iter().any(|p| p.is(&pool.shared)) {
            return Err(QsError::ThreadPoolNotFound { name: pool.name() });
        }
        if pools.pools.iter().any(|p| p.name() == new_name) {
            return Err(QsError::ThreadPoolExists {
                name: new_name.to_string(),
            });
        }
        pool.shared.rename(new_name);
        Ok(())
    }

    /// Destroy a pool, stopping its workers.
    ///
    /// Refused for the graph's last pool and for a pool that still has
    /// blocks assigned; reassign them first.
    pub fn destroy_thread_pool(&self, pool: &ThreadPool) -> Result<()> {
        self.inner.assert_main_thread("Graph::destroy_thread_pool");
        let _structural = self.inner.structural.lock();
        self.inner.require_not_running()?;
        let mut pools = self.inner.pools.lock();
        let Some(index) = pools.pools.iter().position(|p| p.is(&pool.shared)) else {
            return Err(QsError::ThreadPoolNotFound { name: pool.name() });
        };
        if pools.pools.len() == 1 {
            return Err(QsError::LastThreadPool { name: pool.name() });
        }
        let assigned = self
            .inner
            .table
            .lock()
            .order
            .iter()
            .filter(|block| {
                block
                    .simple()
                    .ok()
                    .and_then(|s| s.pool.lock().upgrade())
                    .map(|shared| Arc::ptr_eq(&shared, &pool.shared))
                    == Some(true)
            })
            .count();
        if assigned > 0 {
            return Err(QsError::ThreadPoolBusy {
                name: pool.name(),
                blocks: assigned,
            });
        }
        let removed = pools.pools.remove(index);
        if pools.default_index >= pools.pools.len() || pools.default_index == index {
            pools.default_index = 0;
        } else if pools.default_index > index {
            pools.default_index -= 1;
        }
        drop(pools);
        removed.shared.shutdown();
        tracing::debug!(graph = %self.inner.name, pool = %removed.name(), "pool destroyed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Shared memory
    // ------------------------------------------------------------------

    /// Attach to the named shared memory segment, allocating a zero-filled
    /// one of `size` bytes if this is the first request. The bool reports
    /// whether this call allocated, letting the first caller initialize
    /// the contents.
    pub fn get_memory(&self, name: &str, size: usize) -> Result<(SharedMemory, bool)> {
        let mut memory = self.inner.memory.lock();
        if let Some(slot) = memory.find(name) {
            if slot.size() != size {
                tracing::warn!(
                    segment = name,
                    existing = slot.size(),
                    requested = size,
                    "shared memory size mismatch, using existing segment"
                );
            }
            return Ok((SharedMemory::new(name, Arc::clone(slot)), false));
        }
        let slot = MemorySlot::new(size);
        memory.insert(name, Arc::clone(&slot))?;
        tracing::debug!(graph = %self.inner.name, segment = name, size, "shared memory allocated");
        Ok((SharedMemory::new(name, slot), true))
    }

    /// Remove the name from the segment table. Existing handles stay
    /// valid; the bytes go away when the last one drops.
    pub fn free_memory(&self, name: &str) -> Result<()> {
        match self.inner.memory.lock().remove(name) {
            Remove::Removed => Ok(()),
            Remove::NotFound => Err(QsError::MemoryNotFound {
                name: name.to_string(),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Introspection and teardown
    // ------------------------------------------------------------------

    /// Render a human-readable description of the graph's structure.
    pub fn dump(&self, w: &mut dyn std::fmt::Write) -> std::fmt::Result {
        writeln!(
            w,
            "graph '{}' [{}] state={}",
            self.inner.name,
            self.inner.id,
            self.state()
        )?;
        {
            let pools = self.inner.pools.lock();
            for (index, pool) in pools.pools.iter().enumerate() {
                let marker = if index == pools.default_index { "*" } else { " " };
                writeln!(
                    w,
                    "  pool{marker} '{}' max_threads={}",
                    pool.name(),
                    pool.max_threads()
                )?;
            }
        }
        for block in self.inner.table.lock().order.iter() {
            if block.is_super() {
                writeln!(w, "  super '{}' children={}", block.name(), block.children().len())?;
                continue;
            }
            let Ok(simple) = block.simple() else {
                continue;
            };
            writeln!(w, "  block '{}'", block.name())?;
            let ports = simple.ports.lock();
            for input in &ports.inputs {
                match input.feeder.as_ref().and_then(|f| f.block.upgrade()) {
                    Some(feeder) => {
                        writeln!(w, "    in  '{}' <- '{}'", input.name, feeder.name())?
                    }
                    None => writeln!(w, "    in  '{}' (unconnected)", input.name)?,
                }
            }
            for output in &ports.outputs {
                let readers: Vec<String> = output
                    .readers
                    .iter()
                    .filter_map(|r| r.block.upgrade())
                    .map(|b| b.name().to_string())
                    .collect();
                if readers.is_empty() {
                    writeln!(w, "    out '{}' (unconnected)", output.name)?;
                } else {
                    writeln!(w, "    out '{}' -> {}", output.name, readers.join(", "))?;
                }
            }
            drop(ports);
            let mut setters = Vec::new();
            simple.setters.lock().for_each(|name, _| {
                setters.push(name.to_string());
                std::ops::ControlFlow::Continue(())
            });
            for name in setters {
                writeln!(w, "    set '{name}'")?;
            }
            let mut getters = Vec::new();
            simple.getters.lock().for_each(|name, _| {
                getters.push(name.to_string());
                std::ops::ControlFlow::Continue(())
            });
            for name in getters {
                writeln!(w, "    get '{name}'")?;
            }
            let mut constants = Vec::new();
            simple.constants.lock().for_each(|name, value| {
                constants.push((name.to_string(), value.clone()));
                std::ops::ControlFlow::Continue(())
            });
            for (name, value) in constants {
                writeln!(w, "    const '{name}' = {value}")?;
            }
        }
        Ok(())
    }

    /// Tear the graph down now instead of at drop.
    pub fn destroy(self) {}

    fn teardown(&self) {
        if self.inner.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_internal();
        let _structural = self.inner.structural.lock();
        let roots: Vec<Arc<Block>> = self
            .inner
            .table
            .lock()
            .order
            .iter()
            .filter(|b| b.parent().is_none())
            .cloned()
            .collect();
        for root in roots.into_iter().rev() {
            self.destroy_block_inner(&root);
        }
        let pools: Vec<ThreadPool> = self.inner.pools.lock().pools.drain(..).collect();
        for pool in pools {
            pool.shared.shutdown();
        }
        tracing::info!(graph = %self.inner.name, "graph torn down");
    }
}

impl Drop for Graph {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn derive_name_stem(module_name: &str) -> String {
    let stem = Path::new(module_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(module_name);
    stem.replace(':', "_")
}

/// Whether `target` is reachable from `start` along stream edges.
fn reachable(start: &Arc<Block>, target: &Arc<Block>) -> bool {
    let mut visited: Vec<Arc<Block>> = vec![Arc::clone(start)];
    let mut frontier: Vec<Arc<Block>> = vec![Arc::clone(start)];
    while let Some(block) = frontier.pop() {
        if Arc::ptr_eq(&block, target) {
            return true;
        }
        let Ok(simple) = block.simple() else {
            continue;
        };
        let next: Vec<Arc<Block>> = {
            let ports = simple.ports.lock();
            ports
                .outputs
                .iter()
                .flat_map(|o| o.readers.iter())
                .filter_map(|r| r.block.upgrade())
                .collect()
        };
        for candidate in next {
            if !visited.iter().any(|v| Arc::ptr_eq(v, &candidate)) {
                visited.push(Arc::clone(&candidate));
                frontier.push(candidate);
            }
        }
    }
    false
}
