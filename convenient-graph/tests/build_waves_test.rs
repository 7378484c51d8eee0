//! Wave scheduling over a configuration dependency graph
//!
//! Builds are released in "waves": every vertex whose dependencies have all
//! finished in an earlier wave may start. This mirrors how an external engine
//! walks the submitted graph, and checks that:
//! 1. Dependencies always finish in an earlier wave than their dependants
//! 2. A cycle leaves vertices that can never be released
//! 3. A failure reaches every dependant through the reverse edges

use convenient_graph::Graph;
use std::collections::BTreeSet;

#[derive(Debug, Clone)]
struct Config {
    name: &'static str,
    revision: u32,
}

fn config(name: &'static str, revision: u32) -> Config {
    Config { name, revision }
}

/// Release vertices wave by wave. Returns the waves plus anything that could
/// never be released.
fn waves(graph: &Graph<u32, Config>) -> (Vec<Vec<u32>>, BTreeSet<u32>) {
    let mut finished = BTreeSet::new();
    let mut remaining: BTreeSet<u32> = graph.vertices().map(|(id, _)| *id).collect();
    let mut result = Vec::new();

    loop {
        let wave: Vec<u32> = remaining
            .iter()
            .copied()
            .filter(|id| {
                graph
                    .dependencies(id)
                    .unwrap()
                    .iter()
                    .all(|dep| finished.contains(dep))
            })
            .collect();

        if wave.is_empty() {
            break;
        }
        for id in &wave {
            let _ = remaining.remove(id);
            let _ = finished.insert(*id);
        }
        result.push(wave);
    }

    (result, remaining)
}

fn product_graph() -> Graph<u32, Config> {
    // product -> {web, cli}; web -> core; cli -> core; core -> parent
    let mut graph = Graph::new();
    let _ = graph.add_vertex(1, config("product", 3));
    let _ = graph.add_vertex(2, config("web", 7));
    let _ = graph.add_vertex(3, config("cli", 1));
    let _ = graph.add_vertex(4, config("core", 12));
    let _ = graph.add_vertex(5, config("parent", 2));

    graph.add_edge(1, 2).unwrap();
    graph.add_edge(1, 3).unwrap();
    graph.add_edge(2, 4).unwrap();
    graph.add_edge(3, 4).unwrap();
    graph.add_edge(4, 5).unwrap();
    graph
}

#[test]
fn test_waves_respect_dependencies() {
    let graph = product_graph();
    let (waves, stuck) = waves(&graph);

    assert!(stuck.is_empty());
    assert_eq!(waves, vec![vec![5], vec![4], vec![2, 3], vec![1]]);

    for edge in graph.edges() {
        let wave_of = |id: u32| waves.iter().position(|w| w.contains(&id)).unwrap();
        assert!(
            wave_of(edge.to) < wave_of(edge.from),
            "{} must finish before {}",
            graph.vertex(&edge.to).unwrap().name,
            graph.vertex(&edge.from).unwrap().name
        );
    }
}

#[test]
fn test_dependants_mirror_dependencies() {
    let graph = product_graph();
    for edge in graph.edges() {
        assert!(graph.dependants(&edge.to).unwrap().contains(&edge.from));
    }
    assert!(graph.dependants(&1).unwrap().is_empty());
    assert_eq!(graph.dependants(&4).unwrap(), &BTreeSet::from([2, 3]));
}

#[test]
fn test_cycle_blocks_release() {
    let mut graph = product_graph();
    // parent now depends on web: web -> core -> parent -> web
    graph.add_edge(5, 2).unwrap();

    let (waves, stuck) = waves(&graph);
    assert!(waves.is_empty());
    assert_eq!(stuck.len(), 5);

    let cycle = graph.find_cycle().unwrap();
    let members: BTreeSet<u32> = cycle.iter().copied().collect();
    assert_eq!(members, BTreeSet::from([2, 4, 5]));
}

#[test]
fn test_failure_reaches_every_dependant() {
    let graph = product_graph();
    let mut affected = BTreeSet::new();
    let mut queue = vec![4];
    while let Some(id) = queue.pop() {
        for dependant in graph.dependants(&id).unwrap() {
            if affected.insert(*dependant) {
                queue.push(*dependant);
            }
        }
    }
    assert_eq!(affected, BTreeSet::from([1, 2, 3]));

    let revisions: u32 = affected
        .iter()
        .map(|id| graph.vertex(id).unwrap().revision)
        .sum();
    assert_eq!(revisions, 3 + 7 + 1);
}
