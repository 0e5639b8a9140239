//! Process-wide runtime: configuration, module loading and graph
//! bookkeeping.

use crate::block::Block;
use crate::config::RuntimeConfig;
use crate::dict::Dict;
use crate::error::Result;
use crate::graph::{Graph, GraphInner};
use crate::module::{BlockModule, BuiltinRegistry, ModuleLoader, ModuleSource};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Entry point of the library.
///
/// A runtime owns the module search configuration, the builtin registry
/// and the shared-object load registry that powers copy-isolation. Graphs
/// are created from it and keep it alive; the handle itself is cheap to
/// clone and share between threads.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    config: RuntimeConfig,
    builtins: Mutex<BuiltinRegistry>,
    loader: ModuleLoader,
    graphs: Mutex<Vec<Weak<GraphInner>>>,
    graph_counter: AtomicUsize,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    /// Create a runtime configured from the environment
    /// (see [`RuntimeConfig::from_env`]).
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::from_env())
    }

    /// Create a runtime with an explicit configuration.
    pub fn with_config(config: RuntimeConfig) -> Self {
        let loader = ModuleLoader::new(&config, Arc::new(Mutex::new(Dict::new())));
        tracing::debug!(
            block_dirs = config.block_path.len(),
            parameter_queue_length = config.parameter_queue_length,
            "runtime created"
        );
        Self {
            inner: Arc::new(RuntimeInner {
                config,
                builtins: Mutex::new(BuiltinRegistry::new()),
                loader,
                graphs: Mutex::new(Vec::new()),
                graph_counter: AtomicUsize::new(0),
            }),
        }
    }

    /// Register a builtin block module constructor under `name`.
    ///
    /// The loader prefers shared objects; the builtin serves as fallback
    /// when no file on the block path matches the name.
    pub fn register_builtin(
        &self,
        name: &str,
        ctor: impl Fn() -> Box<dyn BlockModule> + Send + Sync + 'static,
    ) -> Result<()> {
        self.inner.builtins.lock().register(name, Arc::new(ctor))
    }

    /// Create a graph. The calling thread becomes the graph's structural
    /// ("main") thread. Without an explicit name the graph is named
    /// `graph_0`, `graph_1`, ...
    pub fn create_graph(&self, name: Option<&str>) -> Graph {
        let name = match name {
            Some(n) => n.to_string(),
            None => format!(
                "graph_{}",
                self.inner.graph_counter.fetch_add(1, Ordering::Relaxed)
            ),
        };
        let graph = Graph::new(self.clone(), name);
        let mut graphs = self.inner.graphs.lock();
        graphs.retain(|g| g.strong_count() > 0);
        graphs.push(graph.inner_weak());
        graph
    }

    /// Find a block by full name across every live graph of the runtime.
    /// Top-level block names are unique runtime-wide, making this lookup
    /// unambiguous.
    pub fn find_block(&self, name: &str) -> Option<Arc<Block>> {
        self.inner
            .graphs
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .find_map(|g| g.lookup(name))
    }

    pub(crate) fn load_module(&self, name: &str) -> Result<(Box<dyn BlockModule>, ModuleSource)> {
        self.inner.loader.load(name, &self.inner.builtins)
    }

    pub(crate) fn top_level_name_in_use(&self, name: &str) -> bool {
        self.inner
            .graphs
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .any(|g| g.has_block_name(name))
    }

    pub(crate) fn parameter_queue_length(&self) -> usize {
        self.inner.config.parameter_queue_length
    }
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        // Graphs hold their runtime strongly, so by the time the inner
        // state drops every graph has already been torn down.
        tracing::debug!("runtime dropped");
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let live = self
            .inner
            .graphs
            .lock()
            .iter()
            .filter(|g| g.strong_count() > 0)
            .count();
        f.debug_struct("Runtime").field("graphs", &live).finish()
    }
}
