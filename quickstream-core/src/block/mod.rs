//! Blocks: named, connectable units of module behavior inside a graph.
//!
//! A *simple* block owns stream ports, parameters and a job queue, and is
//! assigned to a thread pool. A *super* block owns child blocks instead;
//! it shapes a sub-graph at declare time and never streams. Every block
//! wraps exactly one [`BlockModule`] instance, and the runtime guarantees
//! at most one module callback runs on that instance at any moment.

mod port;

pub(crate) use port::{Feeder, InputPort, OutputPort, Ports, Reader};

use crate::context;
use crate::dict::Dict;
use crate::error::{QsError, Result};
use crate::graph::GraphInner;
use crate::module::{BlockModule, FlowContext, FlowStatus, ModuleSource, Packet};
use crate::pool::PoolShared;
use crate::value::Value;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Weak};

/// A unit of work queued against a block.
pub(crate) enum Job {
    /// Run the module's flow callback.
    Flow,
    /// Write a declared setter.
    SetParameter { name: String, value: Value },
    /// Read a declared getter, replying on a rendezvous channel.
    GetParameter {
        name: String,
        reply: SyncSender<Result<Value>>,
    },
}

/// Description attached to a declared parameter.
pub(crate) struct ParamInfo {
    #[allow(dead_code)]
    pub(crate) description: String,
}

/// Per-block job queue with single-flight execution flags.
pub(crate) struct JobQueue {
    pub(crate) queue: VecDeque<Job>,
    /// A worker is currently executing a job for this block.
    pub(crate) busy: bool,
    /// The block is already sitting in its pool's run queue.
    pub(crate) scheduled: bool,
    /// Bound on queued parameter jobs; flow jobs are not counted.
    pub(crate) param_capacity: usize,
}

impl JobQueue {
    fn param_jobs(&self) -> usize {
        self.queue
            .iter()
            .filter(|j| !matches!(j, Job::Flow))
            .count()
    }
}

/// State specific to streaming (non-super) blocks.
pub(crate) struct SimpleBlock {
    pub(crate) ports: Mutex<Ports>,
    pub(crate) setters: Mutex<Dict<ParamInfo>>,
    pub(crate) getters: Mutex<Dict<ParamInfo>>,
    pub(crate) constants: Mutex<Dict<Value>>,
    pub(crate) jobs: Mutex<JobQueue>,
    pub(crate) pool: Mutex<Weak<PoolShared>>,
    /// Set when `flow` reports Finished; cleared on graph start.
    pub(crate) finished: AtomicBool,
}

/// State specific to super blocks.
pub(crate) struct SuperBlock {
    pub(crate) children: Mutex<Vec<Arc<Block>>>,
}

pub(crate) enum BlockKind {
    Simple(SimpleBlock),
    Super(SuperBlock),
}

/// A loaded block in a graph.
///
/// Obtained from [`Graph::create_block`](crate::Graph::create_block) and
/// passed back to the structural graph API. Cheaply clonable via `Arc`.
pub struct Block {
    name: String,
    graph: Weak<GraphInner>,
    parent: Option<Weak<Block>>,
    // Declared before `source`: the module instance must drop while the
    // library that produced it is still mapped.
    module: Mutex<Option<Box<dyn BlockModule>>>,
    source: ModuleSource,
    kind: BlockKind,
    /// Interface mutations (ports, parameters) are only legal until the
    /// declare callback returns.
    interface_frozen: AtomicBool,
    /// Set once the block is removed from its graph.
    dead: AtomicBool,
    user_data: Mutex<Option<Box<dyn Any + Send>>>,
    run_files: Mutex<Vec<PathBuf>>,
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("name", &self.name)
            .field("source", &self.source)
            .field("super", &self.is_super())
            .finish()
    }
}

impl Block {
    pub(crate) fn new(
        name: String,
        graph: Weak<GraphInner>,
        parent: Option<Weak<Block>>,
        module: Box<dyn BlockModule>,
        source: ModuleSource,
        is_super: bool,
        param_capacity: usize,
    ) -> Arc<Self> {
        let kind = if is_super {
            BlockKind::Super(SuperBlock {
                children: Mutex::new(Vec::new()),
            })
        } else {
            BlockKind::Simple(SimpleBlock {
                ports: Mutex::new(Ports::default()),
                setters: Mutex::new(Dict::new()),
                getters: Mutex::new(Dict::new()),
                constants: Mutex::new(Dict::new()),
                jobs: Mutex::new(JobQueue {
                    queue: VecDeque::new(),
                    busy: false,
                    scheduled: false,
                    param_capacity,
                }),
                pool: Mutex::new(Weak::new()),
                finished: AtomicBool::new(false),
            })
        };
        Arc::new(Self {
            name,
            graph,
            parent,
            module: Mutex::new(Some(module)),
            source,
            kind,
            interface_frozen: AtomicBool::new(false),
            dead: AtomicBool::new(false),
            user_data: Mutex::new(None),
            run_files: Mutex::new(Vec::new()),
        })
    }

    /// Full colon-joined block name, unique within its graph.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The last segment of the colon-joined name.
    pub fn short_name(&self) -> &str {
        self.name.rsplit(':').next().unwrap_or(&self.name)
    }

    /// Whether this is a super (sub-graph building) block.
    pub fn is_super(&self) -> bool {
        matches!(self.kind, BlockKind::Super(_))
    }

    /// Direct children of a super block; empty for simple blocks.
    pub fn children(&self) -> Vec<Arc<Block>> {
        match &self.kind {
            BlockKind::Super(sup) => sup.children.lock().clone(),
            BlockKind::Simple(_) => Vec::new(),
        }
    }

    /// Attach arbitrary embedder data to this block.
    pub fn set_user_data<T: Any + Send>(&self, data: T) {
        *self.user_data.lock() = Some(Box::new(data));
    }

    /// Borrow the attached embedder data, if present and of type `T`.
    pub fn with_user_data<T: Any + Send, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut guard = self.user_data.lock();
        guard.as_mut().and_then(|b| b.downcast_mut::<T>()).map(f)
    }

    /// Remove and return the attached embedder data.
    pub fn take_user_data<T: Any + Send>(&self) -> Option<Box<T>> {
        let data = self.user_data.lock().take()?;
        match data.downcast() {
            Ok(typed) => Some(typed),
            Err(other) => {
                // Wrong type asked for: put it back.
                *self.user_data.lock() = Some(other);
                None
            }
        }
    }

    pub(crate) fn source(&self) -> &ModuleSource {
        &self.source
    }

    pub(crate) fn parent(&self) -> Option<Arc<Block>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn graph_inner(&self) -> Option<Arc<GraphInner>> {
        self.graph.upgrade()
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    pub(crate) fn mark_dead(&self) {
        self.dead.store(true, Ordering::Release);
    }

    pub(crate) fn freeze_interface(&self) {
        self.interface_frozen.store(true, Ordering::Release);
    }

    pub(crate) fn simple(&self) -> Result<&SimpleBlock> {
        match &self.kind {
            BlockKind::Simple(simple) => Ok(simple),
            BlockKind::Super(_) => Err(QsError::NotSimple {
                name: self.name.clone(),
            }),
        }
    }

    pub(crate) fn super_block(&self) -> Option<&SuperBlock> {
        match &self.kind {
            BlockKind::Super(sup) => Some(sup),
            BlockKind::Simple(_) => None,
        }
    }

    /// Run a module callback under the module lock, with this block on
    /// the thread's callback stack.
    pub(crate) fn with_module<R>(
        self: &Arc<Self>,
        f: impl FnOnce(&mut dyn BlockModule) -> R,
    ) -> Option<R> {
        let mut guard = self.module.lock();
        let module = guard.as_mut()?;
        let _cb = context::enter(Arc::clone(self));
        Some(f(module.as_mut()))
    }

    /// Drop the module instance. Must happen before the block itself
    /// drops only in the sense that it is the point after which no
    /// callback can run; field order handles the library lifetime.
    pub(crate) fn discard_module(&self) {
        self.module.lock().take();
    }

    // ------------------------------------------------------------------
    // Declare-time interface construction
    // ------------------------------------------------------------------

    fn declare_only(&self) -> Result<()> {
        if self.interface_frozen.load(Ordering::Acquire) {
            return Err(QsError::module(format!(
                "block '{}': interface changes are only allowed during declare",
                self.name
            )));
        }
        Ok(())
    }

    pub(crate) fn add_input(&self, name: &str) -> Result<usize> {
        self.declare_only()?;
        let simple = self.simple()?;
        let mut ports = simple.ports.lock();
        if ports.input_index(name).is_some() {
            return Err(QsError::module(format!(
                "block '{}': duplicate input port '{name}'",
                self.name
            )));
        }
        ports.inputs.push(InputPort::new(name));
        Ok(ports.inputs.len() - 1)
    }

    pub(crate) fn add_output(&self, name: &str) -> Result<usize> {
        self.declare_only()?;
        let simple = self.simple()?;
        let mut ports = simple.ports.lock();
        if ports.output_index(name).is_some() {
            return Err(QsError::module(format!(
                "block '{}': duplicate output port '{name}'",
                self.name
            )));
        }
        ports.outputs.push(OutputPort::new(name));
        Ok(ports.outputs.len() - 1)
    }

    pub(crate) fn add_setter(&self, name: &str, description: &str) -> Result<()> {
        self.declare_only()?;
        let simple = self.simple()?;
        let outcome = simple.setters.lock().insert(
            name,
            ParamInfo {
                description: description.to_string(),
            },
        )?;
        if outcome == crate::dict::Insert::AlreadyPresent {
            return Err(QsError::module(format!(
                "block '{}': duplicate setter '{name}'",
                self.name
            )));
        }
        Ok(())
    }

    pub(crate) fn add_getter(&self, name: &str, description: &str) -> Result<()> {
        self.declare_only()?;
        let simple = self.simple()?;
        let outcome = simple.getters.lock().insert(
            name,
            ParamInfo {
                description: description.to_string(),
            },
        )?;
        if outcome == crate::dict::Insert::AlreadyPresent {
            return Err(QsError::module(format!(
                "block '{}': duplicate getter '{name}'",
                self.name
            )));
        }
        Ok(())
    }

    pub(crate) fn add_constant(&self, name: &str, value: Value) -> Result<()> {
        self.declare_only()?;
        let simple = self.simple()?;
        let outcome = simple.constants.lock().insert(name, value)?;
        if outcome == crate::dict::Insert::AlreadyPresent {
            return Err(QsError::module(format!(
                "block '{}': duplicate constant '{name}'",
                self.name
            )));
        }
        Ok(())
    }

    pub(crate) fn set_port_limits(&self, max_inputs: Option<usize>, max_outputs: Option<usize>) {
        if self.declare_only().is_err() {
            return;
        }
        if let Ok(simple) = self.simple() {
            let mut ports = simple.ports.lock();
            ports.max_inputs = max_inputs;
            ports.max_outputs = max_outputs;
        }
    }

    pub(crate) fn add_run_file(&self, path: PathBuf) {
        self.run_files.lock().push(path);
    }

    /// Delete every registered run file. Called once, at destruction.
    pub(crate) fn remove_run_files(&self) {
        for path in self.run_files.lock().drain(..) {
            if let Err(err) = std::fs::remove_file(&path) {
                tracing::warn!(
                    block = %self.name,
                    path = %path.display(),
                    error = %err,
                    "failed to remove block run file"
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Job queue
    // ------------------------------------------------------------------

    /// Queue a job and make sure a worker will pick this block up.
    ///
    /// The graph's pending counter is bumped before the job becomes
    /// visible so a concurrent `wait` cannot observe quiescence early.
    pub(crate) fn enqueue(self: &Arc<Self>, job: Job) -> Result<()> {
        if self.is_dead() {
            return Err(QsError::BlockGone {
                name: self.name.clone(),
            });
        }
        let graph = self.graph.upgrade().ok_or_else(|| QsError::BlockGone {
            name: self.name.clone(),
        })?;
        let simple = self.simple()?;
        let need_schedule = {
            let mut jobs = simple.jobs.lock();
            if !matches!(job, Job::Flow) && jobs.param_jobs() >= jobs.param_capacity {
                return Err(QsError::ParameterQueueFull {
                    block: self.name.clone(),
                    capacity: jobs.param_capacity,
                });
            }
            graph.job_added();
            jobs.queue.push_back(job);
            !std::mem::replace(&mut jobs.scheduled, true)
        };
        if need_schedule {
            self.push_to_pool(simple);
        }
        Ok(())
    }

    fn push_to_pool(self: &Arc<Self>, simple: &SimpleBlock) {
        if let Some(pool) = simple.pool.lock().upgrade() {
            pool.push(Arc::clone(self));
        } else if let Some(graph) = self.graph.upgrade() {
            // No pool assigned; jobs drain without running their work.
            tracing::error!(block = %self.name, "block has no thread pool, discarding jobs");
            let mut jobs = simple.jobs.lock();
            jobs.scheduled = false;
            let dropped = jobs.queue.len();
            jobs.queue.clear();
            drop(jobs);
            for _ in 0..dropped {
                graph.job_done();
            }
        }
    }

    /// Execute at most one queued job. Called from pool workers; the
    /// busy flag guarantees single-flight even when the block sits in
    /// two pool run queues during reassignment.
    pub(crate) fn run_pending(self: &Arc<Self>) {
        let Some(graph) = self.graph.upgrade() else {
            return;
        };
        let Ok(simple) = self.simple() else {
            return;
        };
        let job = {
            let mut jobs = simple.jobs.lock();
            jobs.scheduled = false;
            if jobs.busy {
                return;
            }
            let Some(job) = jobs.queue.pop_front() else {
                return;
            };
            jobs.busy = true;
            job
        };
        self.execute(&graph, simple, job);
        let more = {
            let mut jobs = simple.jobs.lock();
            jobs.busy = false;
            if !jobs.queue.is_empty() && !jobs.scheduled {
                jobs.scheduled = true;
                true
            } else {
                false
            }
        };
        graph.job_done();
        if more {
            self.push_to_pool(simple);
        }
    }

    fn execute(self: &Arc<Self>, graph: &Arc<GraphInner>, simple: &SimpleBlock, job: Job) {
        match job {
            Job::Flow => {
                // Flow work is only meaningful while the graph runs;
                // leftover flow jobs after a stop are discarded.
                if !graph.is_running() || simple.finished.load(Ordering::Acquire) {
                    return;
                }
                let inputs = simple.ports.lock().drain_queues();
                let mut ctx = FlowContext::new(inputs);
                let status = self.with_module(|m| m.flow(&mut ctx));
                let emitted = ctx.into_emitted();
                match status {
                    Some(Ok(FlowStatus::Again)) => {
                        self.deliver(emitted);
                        if graph.is_running() {
                            let _ = self.enqueue(Job::Flow);
                        }
                    }
                    Some(Ok(FlowStatus::Idle)) => self.deliver(emitted),
                    Some(Ok(FlowStatus::Finished)) => {
                        self.deliver(emitted);
                        simple.finished.store(true, Ordering::Release);
                        tracing::debug!(block = %self.name, "block finished flowing");
                    }
                    Some(Err(err)) => {
                        tracing::error!(block = %self.name, error = %err, "flow failed");
                        graph.set_failed();
                    }
                    None => {}
                }
            }
            Job::SetParameter { name, value } => {
                let result = self.with_module(|m| m.set_parameter(&name, value));
                if let Some(Err(err)) = result {
                    tracing::error!(
                        block = %self.name,
                        parameter = %name,
                        error = %err,
                        "set_parameter failed"
                    );
                }
            }
            Job::GetParameter { name, reply } => {
                let result = match self.with_module(|m| m.get_parameter(&name)) {
                    Some(inner) => inner.map_err(|err| QsError::ParameterFailed {
                        block: self.name.clone(),
                        param: name,
                        cause: err.to_string(),
                    }),
                    None => Err(QsError::BlockGone {
                        name: self.name.clone(),
                    }),
                };
                // The requester may have timed out and dropped the
                // receiver; that is not our problem.
                let _ = reply.send(result);
            }
        }
    }

    /// Deliver buffered flow emissions to reader blocks and wake them.
    fn deliver(&self, emitted: Vec<(usize, Packet)>) {
        if emitted.is_empty() {
            return;
        }
        let Ok(simple) = self.simple() else {
            return;
        };
        let mut woken: Vec<Arc<Block>> = Vec::new();
        for (port, packet) in emitted {
            let readers: Vec<(Weak<Block>, usize)> = {
                let ports = simple.ports.lock();
                match ports.outputs.get(port) {
                    Some(out) => out
                        .readers
                        .iter()
                        .map(|r| (r.block.clone(), r.input))
                        .collect(),
                    None => {
                        tracing::warn!(
                            block = %self.name,
                            port,
                            "flow emitted on undeclared output port"
                        );
                        continue;
                    }
                }
            };
            for (weak, input) in readers {
                let Some(reader) = weak.upgrade() else {
                    continue;
                };
                if let Ok(rs) = reader.simple() {
                    let mut ports = rs.ports.lock();
                    if let Some(in_port) = ports.inputs.get_mut(input) {
                        in_port.queue.push_back(packet.clone());
                    }
                    drop(ports);
                    if !woken.iter().any(|b| Arc::ptr_eq(b, &reader)) {
                        woken.push(reader);
                    }
                }
            }
        }
        for reader in woken {
            let _ = reader.enqueue(Job::Flow);
        }
    }
}
