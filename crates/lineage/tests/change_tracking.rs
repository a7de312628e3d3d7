//! Registry + graph + store working together across a simulated restart.

use chrono::Utc;

use tipoff_core::NodeKind;
use tipoff_lineage::{ContentRegistry, FsLineageStore, LineageGraph, LineageStore};

fn ids(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

#[test]
fn changed_source_drives_closure_and_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsLineageStore::new(dir.path()).unwrap();

    let registry = ContentRegistry::new();
    let graph = LineageGraph::new();
    graph.add_node("e1", NodeKind::Entity, ids(&["s1", "s2"])).unwrap();
    graph.add_node("f1", NodeKind::Feature, ids(&["e1"])).unwrap();

    for (id, hash) in [("s1", "a"), ("s2", "b")] {
        assert!(registry.register_fetch(id, "scoreboard", hash).unwrap());
    }
    let dirty = registry.list_dirty(None).unwrap();
    let closure = graph.downstream_closure(&dirty).unwrap();
    assert_eq!(closure, ids(&["e1", "f1"]));

    let now = Utc::now();
    for node in &closure {
        graph.mark_computed(node, now).unwrap();
    }
    registry.commit_processed("s1", "a").unwrap();
    registry.commit_processed("s2", "b").unwrap();

    store.save_graph(&graph.snapshot().unwrap()).unwrap();
    store.save_registry(&registry.snapshot().unwrap()).unwrap();

    // Restart.
    let registry = ContentRegistry::from_snapshot(store.load_registry().unwrap().unwrap());
    let graph = LineageGraph::from_snapshot(store.load_graph().unwrap().unwrap()).unwrap();

    assert!(registry.list_dirty(None).unwrap().is_empty());
    assert!(!registry.register_fetch("s1", "scoreboard", "a").unwrap());
    assert!(registry.register_fetch("s2", "scoreboard", "b2").unwrap());

    let dirty = registry.list_dirty(None).unwrap();
    assert_eq!(dirty, ids(&["s2"]));
    assert_eq!(graph.downstream_closure(&dirty).unwrap(), ids(&["e1", "f1"]));
    assert_eq!(graph.stale_nodes(&registry).unwrap(), ids(&["e1", "f1"]));
}
