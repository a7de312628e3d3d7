use super::*;

use chrono::Duration;

fn ids(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

/// s1, s2 -> e1 -> f1
fn scenario() -> LineageGraph {
    let g = LineageGraph::new();
    g.add_node("e1", NodeKind::Entity, ids(&["s1", "s2"])).unwrap();
    g.add_node("f1", NodeKind::Feature, ids(&["e1"])).unwrap();
    g
}

fn position(order: &[String], id: &str) -> usize {
    order.iter().position(|x| x == id).unwrap()
}

#[test]
fn closure_of_source_is_ordered() {
    let g = scenario();
    assert_eq!(g.downstream_closure(&["s1"]).unwrap(), ids(&["e1", "f1"]));
    assert_eq!(g.downstream_closure(&["s2"]).unwrap(), ids(&["e1", "f1"]));
    assert_eq!(g.downstream_closure(&["e1"]).unwrap(), ids(&["f1"]));
}

#[test]
fn closure_of_unknown_or_leaf_is_empty() {
    let g = scenario();
    assert!(g.downstream_closure(&["nope"]).unwrap().is_empty());
    assert!(g.downstream_closure(&["f1"]).unwrap().is_empty());
    assert!(g.downstream_closure::<&str>(&[]).unwrap().is_empty());
}

#[test]
fn closure_includes_changed_node_reached_from_another_seed() {
    let g = scenario();
    assert_eq!(g.downstream_closure(&["f1", "s1"]).unwrap(), ids(&["e1", "f1"]));
}

#[test]
fn self_dependency_is_a_cycle() {
    let g = LineageGraph::new();
    let err = g.add_node("e1", NodeKind::Entity, ids(&["e1"])).unwrap_err();
    assert!(matches!(err, LineageError::CycleDetected(_)));
    assert!(g.is_empty());
}

#[test]
fn cycle_rejected_and_graph_unchanged() {
    let g = scenario();
    g.add_node("m1", NodeKind::Model, ids(&["f1"])).unwrap();
    let before = g.snapshot().unwrap();

    let err = g
        .add_node("e1", NodeKind::Entity, ids(&["s1", "m1"]))
        .unwrap_err();
    match err {
        LineageError::CycleDetected(path) => {
            assert!(path.starts_with("e1 -> m1"), "path was {path}");
            assert!(path.ends_with("-> e1"), "path was {path}");
        }
        other => panic!("expected cycle, got {other:?}"),
    }
    assert_eq!(g.snapshot().unwrap(), before);
}

#[test]
fn topological_order_respects_every_edge() {
    let g = LineageGraph::new();
    // Declared out of dependency order on purpose.
    g.add_node("m1", NodeKind::Model, ids(&["f1", "f2"])).unwrap();
    g.add_node("f2", NodeKind::Feature, ids(&["e2", "f1"])).unwrap();
    g.add_node("f1", NodeKind::Feature, ids(&["e1"])).unwrap();
    g.add_node("e1", NodeKind::Entity, ids(&["s1"])).unwrap();
    g.add_node("e2", NodeKind::Entity, ids(&["s2"])).unwrap();

    let order = g.full_order().unwrap();
    assert_eq!(order.len(), 5);
    for node in g.snapshot().unwrap().nodes {
        for dep in node.depends_on.iter().filter(|d| g.contains(d)) {
            assert!(
                position(&order, dep) < position(&order, &node.node_id),
                "{dep} must precede {}",
                node.node_id
            );
        }
    }
}

#[test]
fn ties_follow_insertion_order() {
    let g = LineageGraph::new();
    g.add_node("b", NodeKind::Entity, ids(&["s"])).unwrap();
    g.add_node("a", NodeKind::Entity, ids(&["s"])).unwrap();
    g.add_node("c", NodeKind::Entity, ids(&["s"])).unwrap();
    assert_eq!(g.topological_order(&["s"]).unwrap(), ids(&["b", "a", "c"]));
}

#[test]
fn topological_order_is_restricted_to_reachable_subgraph() {
    let g = scenario();
    g.add_node("e2", NodeKind::Entity, ids(&["s3"])).unwrap();
    g.add_node("f2", NodeKind::Feature, ids(&["e2"])).unwrap();

    assert_eq!(g.topological_order(&["e1"]).unwrap(), ids(&["e1", "f1"]));
    assert_eq!(g.topological_order(&["s3"]).unwrap(), ids(&["e2", "f2"]));
}

#[test]
fn update_keeps_position_and_resets_computation_on_new_inputs() {
    let g = scenario();
    g.mark_computed("e1", Utc::now()).unwrap();

    g.add_node("e1", NodeKind::Entity, ids(&["s1", "s2"])).unwrap();
    assert!(g.node("e1").unwrap().unwrap().last_computed_at.is_some());

    g.add_node("e1", NodeKind::Entity, ids(&["s1"])).unwrap();
    let e1 = g.node("e1").unwrap().unwrap();
    assert!(e1.last_computed_at.is_none());
    assert_eq!(g.full_order().unwrap(), ids(&["e1", "f1"]));
}

#[test]
fn mark_computed_unknown_node() {
    let g = LineageGraph::new();
    let err = g.mark_computed("ghost", Utc::now()).unwrap_err();
    assert!(matches!(err, LineageError::UnknownNode(_)));
}

#[test]
fn stale_nodes_follow_inputs_and_versions() {
    let g = scenario();
    let reg = ContentRegistry::new();
    reg.register_fetch("s1", "teams", "h1").unwrap();
    reg.register_fetch("s2", "teams", "h2").unwrap();

    assert_eq!(g.stale_nodes(&reg).unwrap(), ids(&["e1", "f1"]));

    let later = Utc::now() + Duration::seconds(5);
    g.mark_computed("e1", later).unwrap();
    g.mark_computed("f1", later + Duration::seconds(1)).unwrap();
    assert!(g.stale_nodes(&reg).unwrap().is_empty());

    // Bumping the generator version of e1 makes it and its dependents stale.
    g.upsert(LineageNode::new("e1", NodeKind::Entity, ids(&["s1", "s2"])).with_generator_version(2))
        .unwrap();
    assert_eq!(g.stale_nodes(&reg).unwrap(), ids(&["e1", "f1"]));
}

#[test]
fn external_inputs_are_sources() {
    let g = scenario();
    assert_eq!(g.external_inputs().unwrap(), ids(&["s1", "s2"]));
    assert_eq!(g.dependents("e1").unwrap(), ids(&["f1"]));
}

#[test]
fn snapshot_round_trip_preserves_order() {
    let g = scenario();
    g.add_node("e0", NodeKind::Entity, ids(&["s9"])).unwrap();
    let restored = LineageGraph::from_snapshot(g.snapshot().unwrap()).unwrap();
    assert_eq!(restored.full_order().unwrap(), g.full_order().unwrap());
}

#[test]
fn cyclic_snapshot_is_rejected() {
    let snapshot = GraphSnapshot {
        nodes: vec![
            LineageNode::new("a", NodeKind::Entity, ids(&["b"])),
            LineageNode::new("b", NodeKind::Entity, ids(&["a"])),
        ],
    };
    assert!(matches!(
        LineageGraph::from_snapshot(snapshot),
        Err(LineageError::CycleDetected(_))
    ));
}
