//! Resource dependency graph
//!
//! Nodes are declared resources; an edge `(consumer, producer)` means the
//! consumer must not begin provisioning until the producer has completed.
//! Implicit edges are inferred from data references in resource specs.
//! Explicit edges come from [`Resource::explicit_dependencies`] and cover
//! ordering the engine cannot infer, such as seeding data before a service
//! starts.
//!
//! The graph is built once per composition pass and only read afterwards, so
//! ordered maps are used throughout: the same input always yields the same
//! edges, order and apply waves.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::handle::ResourceId;
use crate::resource::Resource;
use crate::{Error, Result};

/// How an edge came to exist
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EdgeKind {
    /// Inferred from a data reference
    Implicit,
    /// Declared because ordering is required without a data reference
    Explicit,
}

/// A directed ordering edge
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct DependencyEdge {
    /// Resource that waits
    pub consumer: ResourceId,
    /// Resource waited for
    pub producer: ResourceId,
    /// Implicit or explicit
    pub kind: EdgeKind,
}

/// Dependency graph over declared resources
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    /// Declared resources
    nodes: BTreeSet<ResourceId>,

    /// Outgoing edges: consumer -> {producer -> kind}
    edges_out: BTreeMap<ResourceId, BTreeMap<ResourceId, EdgeKind>>,

    /// Incoming edges: producer -> {consumer}
    edges_in: BTreeMap<ResourceId, BTreeSet<ResourceId>>,
}

impl DependencyGraph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from resource declarations
    pub fn from_resources<'a>(resources: impl IntoIterator<Item = &'a Resource>) -> Self {
        let mut graph = Self::new();
        for resource in resources {
            graph.add_resource(resource);
        }
        graph
    }

    /// Add a resource and every edge its declaration implies
    pub fn add_resource(&mut self, resource: &Resource) {
        self.add_node(resource.id.clone());
        for producer in resource.spec.references() {
            self.add_edge(&resource.id, producer, EdgeKind::Implicit);
        }
        for producer in &resource.explicit_dependencies {
            self.add_edge(&resource.id, producer, EdgeKind::Explicit);
        }
    }

    /// Add a node without edges
    pub fn add_node(&mut self, id: ResourceId) {
        self.nodes.insert(id);
    }

    /// Add an edge
    ///
    /// When the same pair is declared both ways the implicit edge wins: the
    /// data reference already forces the ordering.
    pub fn add_edge(&mut self, consumer: &ResourceId, producer: &ResourceId, kind: EdgeKind) {
        let producers = self.edges_out.entry(consumer.clone()).or_default();
        let entry = producers.entry(producer.clone()).or_insert(kind);
        if kind == EdgeKind::Implicit {
            *entry = EdgeKind::Implicit;
        }
        self.edges_in
            .entry(producer.clone())
            .or_default()
            .insert(consumer.clone());
    }

    /// Whether a resource is declared
    pub fn contains(&self, id: &ResourceId) -> bool {
        self.nodes.contains(id)
    }

    /// Kind of the edge between two resources, if any
    pub fn edge(&self, consumer: &ResourceId, producer: &ResourceId) -> Option<EdgeKind> {
        self.edges_out
            .get(consumer)
            .and_then(|producers| producers.get(producer))
            .copied()
    }

    /// Edges out of a consumer
    pub fn dependencies(&self, consumer: &ResourceId) -> Vec<DependencyEdge> {
        self.edges_out
            .get(consumer)
            .map(|producers| {
                producers
                    .iter()
                    .map(|(producer, kind)| DependencyEdge {
                        consumer: consumer.clone(),
                        producer: producer.clone(),
                        kind: *kind,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Resources that wait for a producer
    pub fn dependents(&self, producer: &ResourceId) -> Vec<ResourceId> {
        self.edges_in
            .get(producer)
            .map(|consumers| consumers.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every edge, ordered by consumer then producer
    pub fn edges(&self) -> Vec<DependencyEdge> {
        self.edges_out
            .keys()
            .flat_map(|consumer| self.dependencies(consumer))
            .collect()
    }

    /// Only the explicit edges
    pub fn explicit_edges(&self) -> Vec<DependencyEdge> {
        self.edges()
            .into_iter()
            .filter(|e| e.kind == EdgeKind::Explicit)
            .collect()
    }

    /// Edges whose producer was never declared
    pub fn dangling_edges(&self) -> Vec<DependencyEdge> {
        self.edges()
            .into_iter()
            .filter(|e| !self.nodes.contains(&e.producer))
            .collect()
    }

    /// Whether `consumer` waits for `producer`, directly or transitively
    pub fn depends_on(&self, consumer: &ResourceId, producer: &ResourceId) -> bool {
        let mut stack = vec![consumer];
        let mut seen = BTreeSet::new();
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(producers) = self.edges_out.get(current) {
                for next in producers.keys() {
                    if next == producer {
                        return true;
                    }
                    stack.push(next);
                }
            }
        }
        false
    }

    /// Number of declared resources
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of edges
    pub fn edge_count(&self) -> usize {
        self.edges_out.values().map(BTreeMap::len).sum()
    }

    /// Group resources into waves the engine may apply concurrently
    ///
    /// Every resource in a wave depends only on resources in earlier waves.
    /// Fails on a dangling producer or a cycle.
    pub fn apply_waves(&self) -> Result<Vec<Vec<ResourceId>>> {
        if let Some(edge) = self.dangling_edges().into_iter().next() {
            warn!(
                consumer = %edge.consumer,
                producer = %edge.producer,
                "dependency on undeclared resource"
            );
            return Err(Error::unresolved(edge.producer.as_str()));
        }

        let mut pending: BTreeMap<&ResourceId, usize> = self
            .nodes
            .iter()
            .map(|id| (id, self.edges_out.get(id).map(BTreeMap::len).unwrap_or(0)))
            .collect();

        let mut waves = Vec::new();
        loop {
            let ready: Vec<&ResourceId> = pending
                .iter()
                .filter(|(_, remaining)| **remaining == 0)
                .map(|(id, _)| *id)
                .collect();
            if ready.is_empty() {
                break;
            }
            for id in &ready {
                pending.remove(*id);
                if let Some(consumers) = self.edges_in.get(*id) {
                    for consumer in consumers {
                        if let Some(remaining) = pending.get_mut(consumer) {
                            *remaining -= 1;
                        }
                    }
                }
            }
            waves.push(ready.into_iter().cloned().collect());
        }

        if !pending.is_empty() {
            let path = self
                .find_cycle()
                .unwrap_or_else(|| pending.keys().map(|id| (*id).clone()).collect());
            return Err(Error::DependencyCycle {
                path: path.into_iter().map(|id| id.to_string()).collect(),
            });
        }
        Ok(waves)
    }

    /// Resources in an order that respects every edge
    pub fn apply_order(&self) -> Result<Vec<ResourceId>> {
        Ok(self.apply_waves()?.into_iter().flatten().collect())
    }

    /// A cycle as a path whose first and last ids are equal
    pub fn find_cycle(&self) -> Option<Vec<ResourceId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit<'a>(
            graph: &'a DependencyGraph,
            id: &'a ResourceId,
            marks: &mut BTreeMap<&'a ResourceId, Mark>,
            path: &mut Vec<&'a ResourceId>,
        ) -> Option<Vec<ResourceId>> {
            match marks.get(id) {
                Some(Mark::Done) => return None,
                Some(Mark::Visiting) => {
                    let start = path.iter().position(|p| *p == id).unwrap_or(0);
                    let mut cycle: Vec<ResourceId> =
                        path[start..].iter().map(|p| (*p).clone()).collect();
                    cycle.push(id.clone());
                    return Some(cycle);
                }
                None => {}
            }
            marks.insert(id, Mark::Visiting);
            path.push(id);
            if let Some(producers) = graph.edges_out.get(id) {
                for producer in producers.keys() {
                    if let Some(cycle) = visit(graph, producer, marks, path) {
                        return Some(cycle);
                    }
                }
            }
            path.pop();
            marks.insert(id, Mark::Done);
            None
        }

        let mut marks = BTreeMap::new();
        let mut path = Vec::new();
        for id in &self.nodes {
            if let Some(cycle) = visit(self, id, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceSpec;

    fn id(name: &str) -> ResourceId {
        ResourceId::new("app", name)
    }

    fn bucket(name: &str) -> Resource {
        Resource::new(
            id(name),
            ResourceSpec::Bucket {
                encryption_key: None,
            },
        )
    }

    fn deployment(name: &str, bucket: &str) -> Resource {
        Resource::new(
            id(name),
            ResourceSpec::BucketDeployment {
                bucket: id(bucket),
                source: "sql".into(),
                prefix: None,
            },
        )
    }

    // =========================================================================
    // Story: Implicit Edges Come From References
    // =========================================================================

    #[test]
    fn story_reference_creates_implicit_edge() {
        let graph = DependencyGraph::from_resources(&[bucket("Seed"), deployment("Upload", "Seed")]);

        assert_eq!(graph.edge(&id("Upload"), &id("Seed")), Some(EdgeKind::Implicit));
        assert_eq!(graph.edge(&id("Seed"), &id("Upload")), None);
        assert_eq!(graph.dependents(&id("Seed")), vec![id("Upload")]);
        assert_eq!(graph.edge_count(), 1);
    }

    // =========================================================================
    // Story: Explicit Edges Order Unrelated Resources
    // =========================================================================

    #[test]
    fn story_explicit_edge_orders_independent_resources() {
        let mut consumer = bucket("Service");
        consumer.explicit_dependencies.insert(id("Upload"));
        let resources = vec![bucket("Seed"), deployment("Upload", "Seed"), consumer];
        let graph = DependencyGraph::from_resources(&resources);

        assert_eq!(graph.edge(&id("Service"), &id("Upload")), Some(EdgeKind::Explicit));
        assert_eq!(graph.explicit_edges().len(), 1);
        assert!(graph.depends_on(&id("Service"), &id("Seed")));

        let waves = graph.apply_waves().unwrap();
        assert_eq!(
            waves,
            vec![vec![id("Seed")], vec![id("Upload")], vec![id("Service")]]
        );
    }

    #[test]
    fn story_without_explicit_edge_resources_share_a_wave() {
        let resources = vec![bucket("Seed"), bucket("Service")];
        let graph = DependencyGraph::from_resources(&resources);
        let waves = graph.apply_waves().unwrap();
        assert_eq!(waves, vec![vec![id("Seed"), id("Service")]]);
    }

    #[test]
    fn story_implicit_wins_over_explicit_for_same_pair() {
        let mut upload = deployment("Upload", "Seed");
        upload.explicit_dependencies.insert(id("Seed"));
        let graph = DependencyGraph::from_resources(&[bucket("Seed"), upload]);
        assert_eq!(graph.edge(&id("Upload"), &id("Seed")), Some(EdgeKind::Implicit));
        assert!(graph.explicit_edges().is_empty());
    }

    // =========================================================================
    // Story: Broken Graphs Fail Before Apply
    // =========================================================================

    #[test]
    fn story_dangling_producer_is_unresolved() {
        let graph = DependencyGraph::from_resources(&[deployment("Upload", "Missing")]);
        assert_eq!(graph.dangling_edges().len(), 1);
        let err = graph.apply_waves().unwrap_err();
        assert!(err.to_string().contains("app/Missing"));
    }

    #[test]
    fn story_cycle_is_reported_with_path() {
        let mut a = bucket("A");
        a.explicit_dependencies.insert(id("B"));
        let mut b = bucket("B");
        b.explicit_dependencies.insert(id("A"));
        let graph = DependencyGraph::from_resources(&[a, b]);

        let cycle = graph.find_cycle().expect("cycle");
        assert_eq!(cycle.first(), cycle.last());

        match graph.apply_waves().unwrap_err() {
            Error::DependencyCycle { path } => assert_eq!(path.len(), 3),
            other => panic!("Expected DependencyCycle, got {other}"),
        }
    }

    #[test]
    fn story_apply_order_respects_every_edge() {
        let mut service = bucket("Service");
        service.explicit_dependencies.insert(id("Upload"));
        let resources = vec![service, deployment("Upload", "Seed"), bucket("Seed")];
        let graph = DependencyGraph::from_resources(&resources);
        let order = graph.apply_order().unwrap();
        for edge in graph.edges() {
            let c = order.iter().position(|i| *i == edge.consumer).unwrap();
            let p = order.iter().position(|i| *i == edge.producer).unwrap();
            assert!(p < c, "{} must precede {}", edge.producer, edge.consumer);
        }
    }
}
