//! Dictionary behavior through the public API.

use quickstream_core::{Dict, Insert, Remove};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn lookup_is_exact_not_prefix() {
    let mut dict = Dict::new();
    dict.insert("block", 1).unwrap();
    dict.insert("block:param", 2).unwrap();
    assert_eq!(dict.find("block"), Some(&1));
    assert_eq!(dict.find("block:param"), Some(&2));
    assert_eq!(dict.find("bloc"), None);
    assert_eq!(dict.find("block:"), None);
    assert_eq!(dict.find("block:param:extra"), None);
}

#[test]
fn removal_leaves_siblings_intact() {
    let mut dict = Dict::new();
    let keys: Vec<String> = (0..50).map(|i| format!("node_{i:02}")).collect();
    for key in &keys {
        dict.insert(key, key.clone()).unwrap();
    }
    for key in keys.iter().skip(1).step_by(2) {
        assert_eq!(dict.remove(key), Remove::Removed);
    }
    for (i, key) in keys.iter().enumerate() {
        if i % 2 == 1 {
            assert_eq!(dict.find(key), None);
        } else {
            assert_eq!(dict.find(key), Some(key));
        }
    }
    assert_eq!(dict.len(), 25);
}

#[test]
fn find_mut_edits_in_place() {
    let mut dict = Dict::new();
    dict.insert("counter", 0u32).unwrap();
    *dict.find_mut("counter").unwrap() += 5;
    assert_eq!(dict.find("counter"), Some(&5));
    assert!(dict.find_mut("missing").is_none());
}

#[test]
fn cursor_resolves_hierarchical_names_incrementally() {
    let mut dict = Dict::new();
    dict.insert("pipeline:decode:rate", 1).unwrap();
    dict.insert("pipeline:decode:drops", 2).unwrap();
    dict.insert("pipeline:encode:rate", 3).unwrap();

    let pipeline = dict.subtree("pipeline:").unwrap();
    let decode = pipeline.subtree("decode:").unwrap();
    assert_eq!(decode.find("rate"), Some(&1));
    assert_eq!(decode.find("drops"), Some(&2));
    assert_eq!(decode.find("rate:extra"), None);
    assert_eq!(pipeline.subtree("encode:").unwrap().find("rate"), Some(&3));
    assert!(dict.subtree("pipelines").is_none());
}

#[test]
fn traversal_order_matches_byte_order() {
    let mut dict = Dict::new();
    let mut keys = vec!["zz", "a", "a z", "Z", "a!", "~", " "];
    for key in &keys {
        dict.insert(key, ()).unwrap();
    }
    let mut seen = Vec::new();
    dict.for_each(|k, _| {
        seen.push(k.to_string());
        ControlFlow::Continue(())
    });
    keys.sort();
    assert_eq!(seen, keys);
}

#[test]
fn destructors_run_on_teardown_in_bulk() {
    let fired = Arc::new(AtomicUsize::new(0));
    let mut dict = Dict::new();
    for i in 0..20 {
        let key = format!("k{i}");
        dict.insert(&key, i).unwrap();
        let f = Arc::clone(&fired);
        dict.set_destructor(&key, move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
    }
    drop(dict);
    assert_eq!(fired.load(Ordering::SeqCst), 20);
}

#[test]
fn reinsert_after_remove_reuses_key() {
    let mut dict = Dict::new();
    assert_eq!(dict.insert("name", 1).unwrap(), Insert::Inserted);
    assert_eq!(dict.remove("name"), Remove::Removed);
    assert_eq!(dict.insert("name", 2).unwrap(), Insert::Inserted);
    assert_eq!(dict.find("name"), Some(&2));
}

#[test]
fn retain_on_prefix_groups() {
    let mut dict = Dict::new();
    for name in ["g1:a", "g1:b", "g2:a", "g2:b", "solo"] {
        dict.insert(name, ()).unwrap();
    }
    dict.retain(|key, _| !key.starts_with("g1:"));
    assert_eq!(dict.len(), 3);
    assert!(dict.find("g1:a").is_none());
    assert!(dict.find("g2:a").is_some());
    assert!(dict.find("solo").is_some());
}
