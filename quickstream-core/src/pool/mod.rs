//! Worker thread pools executing block jobs.
//!
//! Each graph owns at least one pool; every simple block is assigned to
//! exactly one. Workers are spawned on demand: a pool holds no threads
//! until the first job arrives, then grows up to its `max_threads` bound
//! as long as pushes find no idle worker. A block enters a pool's run
//! queue at most once at a time (the `scheduled` flag) and executes on at
//! most one worker at a time (the `busy` flag), so module callbacks are
//! never concurrent even while a block migrates between pools.

use crate::block::Block;
use crate::error::{QsError, Result};
use crate::graph::GraphInner;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

/// Default worker bound for newly created pools.
pub const DEFAULT_MAX_THREADS: usize = 3;

struct PoolState {
    run_queue: VecDeque<Arc<Block>>,
    max_threads: usize,
    /// Threads spawned and not yet exited.
    workers: usize,
    /// Threads currently parked on the work condvar.
    idle: usize,
    shutdown: bool,
}

pub(crate) struct PoolShared {
    name: Mutex<String>,
    graph: Weak<GraphInner>,
    state: Mutex<PoolState>,
    work: Condvar,
    joins: Mutex<Vec<JoinHandle<()>>>,
}

impl PoolShared {
    pub(crate) fn new(name: &str, graph: Weak<GraphInner>, max_threads: usize) -> Arc<Self> {
        Arc::new(Self {
            name: Mutex::new(name.to_string()),
            graph,
            state: Mutex::new(PoolState {
                run_queue: VecDeque::new(),
                max_threads: max_threads.max(1),
                workers: 0,
                idle: 0,
                shutdown: false,
            }),
            work: Condvar::new(),
            joins: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub(crate) fn rename(&self, name: &str) {
        *self.name.lock() = name.to_string();
    }

    pub(crate) fn max_threads(&self) -> usize {
        self.state.lock().max_threads
    }

    pub(crate) fn set_max_threads(&self, n: usize) {
        self.state.lock().max_threads = n.max(1);
    }

    /// Queue a block for execution off the calling thread.
    pub(crate) fn push(self: &Arc<Self>, block: Arc<Block>) {
        let spawn = {
            let mut st = self.state.lock();
            if st.shutdown {
                drop(st);
                discard_jobs(&block);
                return;
            }
            st.run_queue.push_back(block);
            if st.idle > 0 {
                self.work.notify_one();
                false
            } else if st.workers < st.max_threads {
                st.workers += 1;
                true
            } else {
                // All workers busy and at the bound; one of them will
                // pick this up when it finishes its current job.
                false
            }
        };
        if spawn {
            self.spawn_worker();
        }
    }

    fn spawn_worker(self: &Arc<Self>) {
        let shared = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name(format!("qs-pool-{}", self.name()))
            .spawn(move || shared.worker_loop());
        match spawned {
            Ok(handle) => self.joins.lock().push(handle),
            Err(err) => {
                let mut st = self.state.lock();
                st.workers -= 1;
                tracing::error!(pool = %self.name(), error = %err, "failed to spawn worker");
                // Queued blocks stay; an existing worker or a later
                // successful spawn will serve them.
            }
        }
    }

    fn worker_loop(self: Arc<Self>) {
        tracing::debug!(pool = %self.name(), "worker started");
        loop {
            let block = {
                let mut st = self.state.lock();
                loop {
                    if let Some(block) = st.run_queue.pop_front() {
                        break Some(block);
                    }
                    if st.shutdown {
                        break None;
                    }
                    st.idle += 1;
                    self.work.wait(&mut st);
                    st.idle -= 1;
                }
            };
            match block {
                Some(block) => block.run_pending(),
                None => break,
            }
        }
        self.state.lock().workers -= 1;
        tracing::debug!(pool = %self.name(), "worker exiting");
    }

    /// Stop the workers and discard whatever was still queued.
    ///
    /// Idempotent. Queued but unexecuted jobs still count against the
    /// graph's pending counter, so each discarded one is reported done.
    pub(crate) fn shutdown(&self) {
        let already = {
            let mut st = self.state.lock();
            std::mem::replace(&mut st.shutdown, true)
        };
        if already {
            return;
        }
        self.work.notify_all();
        let joins: Vec<JoinHandle<()>> = self.joins.lock().drain(..).collect();
        for handle in joins {
            if handle.join().is_err() {
                tracing::error!(pool = %self.name(), "worker panicked");
            }
        }
        let leftovers: Vec<Arc<Block>> = self.state.lock().run_queue.drain(..).collect();
        for block in leftovers {
            discard_jobs(&block);
        }
    }
}

/// Drop a block's queued jobs, balancing the graph's pending counter.
pub(crate) fn discard_jobs(block: &Arc<Block>) {
    let Ok(simple) = block.simple() else {
        return;
    };
    let dropped = {
        let mut jobs = simple.jobs.lock();
        jobs.scheduled = false;
        let n = jobs.queue.len();
        jobs.queue.clear();
        n
    };
    if let Some(graph) = block.graph_inner() {
        for _ in 0..dropped {
            graph.job_done();
        }
    }
}

/// Handle to a worker thread pool of a graph.
///
/// Obtained from [`Graph::thread_pool`](crate::Graph::thread_pool) or
/// [`Graph::create_thread_pool`](crate::Graph::create_thread_pool).
#[derive(Clone)]
pub struct ThreadPool {
    pub(crate) shared: Arc<PoolShared>,
}

impl ThreadPool {
    /// The pool's current name.
    pub fn name(&self) -> String {
        self.shared.name()
    }

    /// The worker thread bound.
    pub fn max_threads(&self) -> usize {
        self.shared.max_threads()
    }

    /// Raise or lower the worker thread bound (minimum 1). Lowering it
    /// does not stop existing workers; they exit only at shutdown.
    pub fn set_max_threads(&self, n: usize) {
        self.shared.set_max_threads(n);
    }

    /// Reassign `block` to this pool.
    ///
    /// Structural: requires a paused graph, the main thread, and that the
    /// block belongs to the same graph as the pool.
    pub fn add_block(&self, block: &Arc<Block>) -> Result<()> {
        let graph = self.shared.graph.upgrade().ok_or_else(|| QsError::BlockGone {
            name: block.name().to_string(),
        })?;
        graph.assert_main_thread("ThreadPool::add_block");
        graph.require_not_running()?;
        let same_graph = block
            .graph_inner()
            .map(|g| Arc::ptr_eq(&g, &graph))
            .unwrap_or(false);
        if !same_graph {
            return Err(QsError::BlockNotFound {
                name: block.name().to_string(),
            });
        }
        let simple = block.simple()?;
        *simple.pool.lock() = Arc::downgrade(&self.shared);
        tracing::debug!(block = %block.name(), pool = %self.name(), "block reassigned");
        Ok(())
    }

    pub(crate) fn is(&self, shared: &Arc<PoolShared>) -> bool {
        Arc::ptr_eq(&self.shared, shared)
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("name", &self.name())
            .field("max_threads", &self.max_threads())
            .finish()
    }
}
