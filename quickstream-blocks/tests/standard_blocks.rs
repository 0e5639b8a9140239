//! The standard modules wired into a real graph.

use quickstream_blocks::register_standard_builtins;
use quickstream_core::{Runtime, RuntimeConfig, Value};

fn runtime() -> Runtime {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let rt = Runtime::with_config(RuntimeConfig::default());
    register_standard_builtins(&rt).unwrap();
    rt
}

#[test]
fn sequence_through_passthrough_into_null() {
    let rt = runtime();
    let graph = rt.create_graph(Some("standard"));

    let src = graph.create_block(None, "sequence", Some("src")).unwrap().unwrap();
    let mid = graph.create_block(None, "passthrough", Some("mid")).unwrap().unwrap();
    let sink = graph.create_block(None, "null", Some("sink")).unwrap().unwrap();
    graph.connect(&src, "out", &mid, "in").unwrap();
    graph.connect(&mid, "out", &sink, "in").unwrap();

    // The default packet count is published as a constant; the setter
    // changes the effective count without touching it.
    assert_eq!(graph.constant("src", "count").unwrap().as_i64(), Some(10));
    graph.set_parameter("src", "count", Value::int(25)).unwrap();
    assert_eq!(graph.constant("src", "count").unwrap().as_i64(), Some(10));
    assert!(graph.constant("src", "emitted").is_err());

    graph.start().unwrap();
    graph.wait();
    graph.stop().unwrap();

    assert_eq!(graph.get_parameter("src", "emitted").unwrap().as_i64(), Some(25));
    assert_eq!(graph.get_parameter("mid", "packets").unwrap().as_i64(), Some(25));
    assert_eq!(graph.get_parameter("sink", "consumed").unwrap().as_i64(), Some(25));
}

#[test]
fn counter_replaces_payloads_with_totals() {
    let rt = runtime();
    let graph = rt.create_graph(None);

    let src = graph.create_block(None, "sequence", Some("src")).unwrap().unwrap();
    let count = graph.create_block(None, "counter", Some("count")).unwrap().unwrap();
    let sink = graph.create_block(None, "null", Some("sink")).unwrap().unwrap();
    graph.connect(&src, "out", &count, "in").unwrap();
    graph.connect(&count, "out", &sink, "in").unwrap();
    graph.set_parameter("src", "count", Value::int(7)).unwrap();

    graph.start().unwrap();
    graph.wait();
    graph.stop().unwrap();

    assert_eq!(graph.get_parameter("count", "count").unwrap().as_i64(), Some(7));
    assert_eq!(graph.get_parameter("sink", "consumed").unwrap().as_i64(), Some(7));
}

#[test]
fn runs_are_independent() {
    let rt = runtime();
    let graph = rt.create_graph(None);
    let src = graph.create_block(None, "sequence", Some("src")).unwrap().unwrap();
    let sink = graph.create_block(None, "null", Some("sink")).unwrap().unwrap();
    graph.connect(&src, "out", &sink, "in").unwrap();
    graph.set_parameter("src", "count", Value::int(4)).unwrap();

    graph.start().unwrap();
    graph.wait();
    graph.stop().unwrap();
    assert_eq!(graph.get_parameter("sink", "consumed").unwrap().as_i64(), Some(4));

    // Getters reset with the next start.
    graph.start().unwrap();
    graph.wait();
    graph.stop().unwrap();
    assert_eq!(graph.get_parameter("src", "emitted").unwrap().as_i64(), Some(4));
    assert_eq!(graph.get_parameter("sink", "consumed").unwrap().as_i64(), Some(4));
}
