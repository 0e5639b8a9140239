//! Thread pool management and scheduling guarantees.

use quickstream_core::{
    BlockModule, DeclareContext, DeclareStatus, FlowContext, FlowStatus, Result, Runtime,
    RuntimeConfig, Value, DEFAULT_MAX_THREADS, DEFAULT_POOL_NAME,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Inert;

impl BlockModule for Inert {
    fn declare(&mut self, ctx: &mut DeclareContext<'_>) -> Result<DeclareStatus> {
        ctx.add_output("out")?;
        Ok(DeclareStatus::Keep)
    }
}

fn runtime() -> Runtime {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let rt = Runtime::with_config(RuntimeConfig::default());
    rt.register_builtin("inert", || Box::new(Inert)).unwrap();
    rt
}

#[test]
fn every_graph_starts_with_a_default_pool() {
    let rt = runtime();
    let graph = rt.create_graph(None);
    let pool = graph.default_thread_pool();
    assert_eq!(pool.name(), DEFAULT_POOL_NAME);
    assert_eq!(pool.max_threads(), DEFAULT_MAX_THREADS);
    assert!(graph.thread_pool(DEFAULT_POOL_NAME).is_some());
}

#[test]
fn pool_names_are_unique_and_renamable() {
    let rt = runtime();
    let graph = rt.create_graph(None);
    let pool = graph.create_thread_pool("fast", 8).unwrap();
    assert_eq!(pool.max_threads(), 8);
    assert_eq!(
        graph.create_thread_pool("fast", 2).unwrap_err().code(),
        "E401"
    );
    graph.rename_thread_pool(&pool, "faster").unwrap();
    assert!(graph.thread_pool("fast").is_none());
    assert!(graph.thread_pool("faster").is_some());
    assert_eq!(
        graph
            .rename_thread_pool(&pool, DEFAULT_POOL_NAME)
            .unwrap_err()
            .code(),
        "E401"
    );
}

#[test]
fn the_last_pool_cannot_be_destroyed() {
    let rt = runtime();
    let graph = rt.create_graph(None);
    let only = graph.default_thread_pool();
    assert_eq!(graph.destroy_thread_pool(&only).unwrap_err().code(), "E403");
}

#[test]
fn a_pool_with_assigned_blocks_refuses_destruction() {
    let rt = runtime();
    let graph = rt.create_graph(None);
    let side = graph.create_thread_pool("side", 2).unwrap();
    let block = graph
        .create_block(Some(&side), "inert", Some("resident"))
        .unwrap()
        .unwrap();
    let err = graph.destroy_thread_pool(&side).unwrap_err();
    assert_eq!(err.code(), "E404");
    assert!(err.to_string().contains("1 assigned"));

    // Reassigning the block frees the pool.
    graph.default_thread_pool().add_block(&block).unwrap();
    graph.destroy_thread_pool(&side).unwrap();
    assert!(graph.thread_pool("side").is_none());
}

#[test]
fn blocks_land_in_the_default_pool() {
    let rt = runtime();
    let graph = rt.create_graph(None);
    let side = graph.create_thread_pool("side", 2).unwrap();
    graph.set_default_thread_pool(&side).unwrap();
    graph.create_block(None, "inert", Some("b")).unwrap().unwrap();
    // "side" is now the default and therefore busy.
    assert_eq!(graph.destroy_thread_pool(&side).unwrap_err().code(), "E404");
}

#[test]
fn a_blocks_callbacks_never_run_concurrently() {
    struct Churn {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        rounds: usize,
    }

    impl BlockModule for Churn {
        fn declare(&mut self, ctx: &mut DeclareContext<'_>) -> Result<DeclareStatus> {
            ctx.add_output("out")?;
            Ok(DeclareStatus::Keep)
        }

        fn flow(&mut self, _ctx: &mut FlowContext) -> Result<FlowStatus> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(1));
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.rounds -= 1;
            if self.rounds == 0 {
                Ok(FlowStatus::Finished)
            } else {
                Ok(FlowStatus::Again)
            }
        }
    }

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let rt = Runtime::with_config(RuntimeConfig::default());
    let (a, p) = (Arc::clone(&active), Arc::clone(&peak));
    rt.register_builtin("churn", move || {
        Box::new(Churn {
            active: Arc::clone(&a),
            peak: Arc::clone(&p),
            rounds: 50,
        })
    })
    .unwrap();

    let graph = rt.create_graph(None);
    let pool = graph.create_thread_pool("wide", 4).unwrap();
    graph
        .create_block(Some(&pool), "churn", Some("solo"))
        .unwrap()
        .unwrap();
    graph.start().unwrap();
    graph.wait();
    graph.stop().unwrap();
    // 50 flows ran, never two at once.
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[test]
fn parameter_queue_is_bounded() {
    struct Sluggish;

    impl BlockModule for Sluggish {
        fn declare(&mut self, ctx: &mut DeclareContext<'_>) -> Result<DeclareStatus> {
            ctx.add_setter("speed", "ignored, slowly")?;
            Ok(DeclareStatus::Keep)
        }

        fn set_parameter(&mut self, _name: &str, _value: Value) -> Result<()> {
            std::thread::sleep(Duration::from_millis(20));
            Ok(())
        }
    }

    let rt = Runtime::with_config(RuntimeConfig::default().with_parameter_queue_length(2));
    rt.register_builtin("sluggish", || Box::new(Sluggish)).unwrap();
    let graph = rt.create_graph(None);
    graph.create_block(None, "sluggish", Some("s")).unwrap().unwrap();

    // Flood the queue: with the module sleeping through each write, the
    // bound has to trip.
    let mut saw_full = false;
    for i in 0..50 {
        match graph.set_parameter("s", "speed", Value::int(i)) {
            Ok(()) => {}
            Err(err) => {
                assert_eq!(err.code(), "E405");
                saw_full = true;
                break;
            }
        }
    }
    assert!(saw_full);
    graph.wait();
}

#[test]
fn unknown_parameters_are_rejected_up_front() {
    let rt = runtime();
    let graph = rt.create_graph(None);
    graph.create_block(None, "inert", Some("b")).unwrap().unwrap();
    assert_eq!(
        graph
            .set_parameter("b", "ghost", Value::int(1))
            .unwrap_err()
            .code(),
        "E406"
    );
    assert_eq!(graph.get_parameter("b", "ghost").unwrap_err().code(), "E406");
    assert_eq!(graph.constant("b", "ghost").unwrap_err().code(), "E406");
    assert_eq!(
        graph
            .set_parameter("nobody", "x", Value::int(1))
            .unwrap_err()
            .code(),
        "E205"
    );
}
