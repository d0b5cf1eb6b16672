//! Graph data handed to the layout engine
//!
//! Reading and writing the JSON exchange format lives here too, so the binary
//! can hand a loaded graph straight to the engine and write the result back.

use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{LayoutError, LayoutResult};
use crate::gpu::{GpuEdge, GpuNode};

/// Node positions and edges of one dataset.
///
/// Both arrays are copied into engine-owned buffers at load time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphData {
    pub nodes: Vec<GpuNode>,
    pub edges: Vec<GpuEdge>,
}

/// How nodes without coordinates are placed
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub seed: u64,
    /// Side length of the square the nodes are scattered over
    pub extent: f32,
}

impl Placement {
    /// Placement scaled by dataset size, kept inside the working domain
    pub fn scaled(seed: u64, node_count: usize, ideal_length: f32, domain_high: f32) -> Self {
        let extent = (ideal_length * (node_count as f32).sqrt()).clamp(1.0, domain_high.max(1.0));
        Self { seed, extent }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct GraphFile {
    nodes: Vec<NodeRecord>,
    #[serde(default)]
    edges: Vec<EdgeRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct NodeRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    x: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    y: Option<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EdgeRecord {
    source: u32,
    target: u32,
}

impl GraphData {
    pub fn new(nodes: Vec<GpuNode>, edges: Vec<GpuEdge>) -> Self {
        Self { nodes, edges }
    }

    /// `count` nodes scattered uniformly over `[0, extent)²`
    pub fn scattered(count: usize, placement: Placement) -> Self {
        let mut rng = StdRng::seed_from_u64(placement.seed);
        let nodes = (0..count)
            .map(|_| random_node(&mut rng, placement.extent))
            .collect();
        Self {
            nodes,
            edges: Vec::new(),
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Check that every edge refers to an existing node
    pub fn validate(&self) -> LayoutResult<()> {
        validate_edges(self.nodes.len(), &self.edges)
    }

    /// Copy of the edges, stably sorted by source index
    pub fn edges_by_source(&self) -> Vec<GpuEdge> {
        let mut edges = self.edges.clone();
        edges.sort_by_key(|e| e.source);
        edges
    }

    /// Copy of the edges, stably sorted by target index
    pub fn edges_by_target(&self) -> Vec<GpuEdge> {
        let mut edges = self.edges.clone();
        edges.sort_by_key(|e| e.target);
        edges
    }

    /// Replace node positions, keeping the auxiliary slots
    pub fn set_positions(&mut self, nodes: &[GpuNode]) {
        for (node, updated) in self.nodes.iter_mut().zip(nodes) {
            node.x = updated.x;
            node.y = updated.y;
        }
    }

    /// Parse the JSON exchange format.
    ///
    /// Nodes missing either coordinate are placed at random using `placement`.
    pub fn from_json_str(text: &str, placement: Placement) -> LayoutResult<Self> {
        let file: GraphFile = serde_json::from_str(text)?;
        Self::from_file(file, placement)
    }

    fn from_file(file: GraphFile, placement: Placement) -> LayoutResult<Self> {
        let mut rng = StdRng::seed_from_u64(placement.seed);

        let nodes = file
            .nodes
            .iter()
            .map(|record| match (record.x, record.y) {
                (Some(x), Some(y)) => GpuNode::new(x, y),
                _ => random_node(&mut rng, placement.extent),
            })
            .collect();
        let edges = file
            .edges
            .iter()
            .map(|e| GpuEdge::new(e.source, e.target))
            .collect();

        let graph = Self { nodes, edges };
        graph.validate()?;
        Ok(graph)
    }

    /// Read a graph file, scaling random placement to the number of nodes
    pub fn load_json(
        path: &Path,
        seed: u64,
        ideal_length: f32,
        domain_high: f32,
    ) -> LayoutResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let file: GraphFile = serde_json::from_str(&text)?;
        let placement = Placement::scaled(seed, file.nodes.len(), ideal_length, domain_high);
        Self::from_file(file, placement)
    }

    /// Serialize in the same shape `from_json_str` reads
    pub fn to_json_string(&self) -> LayoutResult<String> {
        let file = GraphFile {
            nodes: self
                .nodes
                .iter()
                .map(|n| NodeRecord {
                    x: Some(n.x),
                    y: Some(n.y),
                })
                .collect(),
            edges: self
                .edges
                .iter()
                .map(|e| EdgeRecord {
                    source: e.source,
                    target: e.target,
                })
                .collect(),
        };
        Ok(serde_json::to_string_pretty(&file)?)
    }

    pub fn save_json(&self, path: &Path) -> LayoutResult<()> {
        std::fs::write(path, self.to_json_string()?)?;
        Ok(())
    }
}

/// Check edge endpoints against the node count
pub fn validate_edges(node_count: usize, edges: &[GpuEdge]) -> LayoutResult<()> {
    for (index, edge) in edges.iter().enumerate() {
        if edge.source as usize >= node_count || edge.target as usize >= node_count {
            return Err(LayoutError::InvalidEdge {
                index,
                from: edge.source,
                to: edge.target,
                node_count,
            });
        }
    }
    Ok(())
}

fn random_node(rng: &mut StdRng, extent: f32) -> GpuNode {
    GpuNode::new(rng.gen_range(0.0..extent), rng.gen_range(0.0..extent))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn placement() -> Placement {
        Placement {
            seed: 7,
            extent: 1.0,
        }
    }

    #[test]
    fn parses_positions_and_edges() {
        let json = r#"{
            "nodes": [{"x": 0.5, "y": -1.0}, {"x": 2.0, "y": 3.0}],
            "edges": [{"source": 0, "target": 1}]
        }"#;
        let graph = GraphData::from_json_str(json, placement()).unwrap();
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.nodes[0].position(), [0.5, -1.0]);
        assert_eq!(graph.nodes[1].size, 1.0);
        assert_eq!(graph.edges, vec![GpuEdge::new(0, 1)]);
    }

    #[test]
    fn missing_coordinates_are_randomised_reproducibly() {
        let json = r#"{"nodes": [{}, {}, {"x": 1.0}], "edges": []}"#;
        let a = GraphData::from_json_str(json, placement()).unwrap();
        let b = GraphData::from_json_str(json, placement()).unwrap();
        assert_eq!(a, b);
        for node in &a.nodes {
            assert!((0.0..1.0).contains(&node.x));
            assert!((0.0..1.0).contains(&node.y));
        }
        assert_ne!(a.nodes[0], a.nodes[1]);
    }

    #[test]
    fn rejects_out_of_range_edge() {
        let json = r#"{"nodes": [{}, {}], "edges": [{"source": 0, "target": 5}]}"#;
        let err = GraphData::from_json_str(json, placement()).unwrap_err();
        assert!(matches!(
            err,
            LayoutError::InvalidEdge {
                index: 0,
                to: 5,
                ..
            }
        ));
    }

    #[test]
    fn sorted_copies_are_stable() {
        let graph = GraphData::new(
            vec![GpuNode::new(0.0, 0.0); 3],
            vec![
                GpuEdge::new(2, 0),
                GpuEdge::new(1, 2),
                GpuEdge::new(2, 1),
                GpuEdge::new(0, 2),
            ],
        );
        let by_source = graph.edges_by_source();
        assert_eq!(
            by_source,
            vec![
                GpuEdge::new(0, 2),
                GpuEdge::new(1, 2),
                GpuEdge::new(2, 0),
                GpuEdge::new(2, 1),
            ]
        );
        let by_target = graph.edges_by_target();
        assert_eq!(by_target[0], GpuEdge::new(2, 0));
        assert_eq!(by_target[1], GpuEdge::new(2, 1));
        assert_eq!(by_target[2], GpuEdge::new(1, 2));
        assert_eq!(by_target[3], GpuEdge::new(0, 2));
    }

    #[test]
    fn json_export_reads_back() {
        let graph = GraphData::new(
            vec![GpuNode::new(0.25, 0.5), GpuNode::new(-3.0, 4.0)],
            vec![GpuEdge::new(1, 0)],
        );
        let text = graph.to_json_string().unwrap();
        let back = GraphData::from_json_str(&text, placement()).unwrap();
        assert_eq!(back, graph);
    }

    #[test]
    fn placement_extent_is_clamped() {
        assert_eq!(Placement::scaled(0, 4, 0.01, 8.0).extent, 1.0);
        assert_eq!(Placement::scaled(0, 1_000_000, 0.01, 8.0).extent, 8.0);
        let mid = Placement::scaled(0, 40_000, 0.01, 8.0).extent;
        assert!((mid - 2.0).abs() < 1e-5);
    }

    #[test]
    fn load_json_scales_placement_by_node_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.json");
        let text = format!(r#"{{"nodes": [{}], "edges": []}}"#, vec!["{}"; 16].join(", "));
        std::fs::write(&path, &text).unwrap();

        let graph = GraphData::load_json(&path, 5, 1.0, 8.0).unwrap();
        let expected = GraphData::from_json_str(&text, Placement::scaled(5, 16, 1.0, 8.0)).unwrap();
        assert_eq!(graph, expected);
        assert!(graph.nodes.iter().all(|n| (0.0..4.0).contains(&n.x) && (0.0..4.0).contains(&n.y)));
        assert!(graph.nodes.iter().any(|n| n.x > 1.0 || n.y > 1.0));
    }
}
