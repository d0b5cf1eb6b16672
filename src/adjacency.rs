//! CSR-style incidence lists for the attractive force pass
//!
//! Edges are grouped twice: by source and by target. For an edge `(u, v)`
//! node `u` finds `v` in its source range and node `v` finds `u` in its
//! target range, so each endpoint visits every edge exactly once.

use crate::error::LayoutResult;
use crate::gpu::{AdjacencyEntry, GpuEdge};
use crate::graph::validate_edges;

/// Per-node ranges plus the two flat neighbour lists
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdjacencyIndex {
    pub entries: Vec<AdjacencyEntry>,
    /// Targets of the edges sorted by source
    pub source_list: Vec<u32>,
    /// Sources of the edges sorted by target
    pub target_list: Vec<u32>,
}

impl AdjacencyIndex {
    /// Validate and group an unsorted edge list
    pub fn build(node_count: usize, edges: &[GpuEdge]) -> LayoutResult<Self> {
        validate_edges(node_count, edges)?;

        let mut by_source = edges.to_vec();
        by_source.sort_by_key(|e| e.source);
        let mut by_target = edges.to_vec();
        by_target.sort_by_key(|e| e.target);

        Ok(Self::from_sorted(node_count, &by_source, &by_target))
    }

    /// Build from edge copies already sorted by source and by target.
    ///
    /// Endpoints must be in range.
    pub fn from_sorted(node_count: usize, by_source: &[GpuEdge], by_target: &[GpuEdge]) -> Self {
        let mut entries = vec![AdjacencyEntry::default(); node_count];

        let mut previous = None;
        for (i, edge) in by_source.iter().enumerate() {
            let entry = &mut entries[edge.source as usize];
            if previous != Some(edge.source) {
                entry.source_start = i as u32;
                previous = Some(edge.source);
            }
            entry.source_degree += 1;
        }

        let mut previous = None;
        for (i, edge) in by_target.iter().enumerate() {
            let entry = &mut entries[edge.target as usize];
            if previous != Some(edge.target) {
                entry.target_start = i as u32;
                previous = Some(edge.target);
            }
            entry.target_degree += 1;
        }

        Self {
            entries,
            source_list: by_source.iter().map(|e| e.target).collect(),
            target_list: by_target.iter().map(|e| e.source).collect(),
        }
    }

    pub fn node_count(&self) -> usize {
        self.entries.len()
    }

    pub fn edge_count(&self) -> usize {
        self.source_list.len()
    }

    /// Nodes connected to `node`, once per incident edge
    pub fn neighbours(&self, node: usize) -> impl Iterator<Item = u32> + '_ {
        let entry = self.entries[node];
        let sources = &self.source_list[entry.source_start as usize..][..entry.source_degree as usize];
        let targets = &self.target_list[entry.target_start as usize..][..entry.target_degree as usize];
        sources.iter().chain(targets).copied()
    }

    pub fn degree(&self, node: usize) -> u32 {
        let entry = self.entries[node];
        entry.source_degree + entry.target_degree
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LayoutError;

    #[test]
    fn groups_by_source_and_target() {
        let edges = [GpuEdge::new(0, 1), GpuEdge::new(2, 0), GpuEdge::new(0, 2)];
        let index = AdjacencyIndex::build(3, &edges).unwrap();

        assert_eq!(index.source_list, vec![1, 2, 0]);
        assert_eq!(index.target_list, vec![2, 0, 0]);
        assert_eq!(
            index.entries[0],
            AdjacencyEntry {
                source_start: 0,
                source_degree: 2,
                target_start: 0,
                target_degree: 1,
            }
        );
        assert_eq!(index.entries[2].source_start, 2);
        assert_eq!(index.entries[2].target_start, 2);
    }

    #[test]
    fn each_edge_is_seen_once_per_endpoint() {
        let edges = [GpuEdge::new(0, 1), GpuEdge::new(1, 2), GpuEdge::new(2, 3)];
        let index = AdjacencyIndex::build(4, &edges).unwrap();

        let mut seen: Vec<(u32, u32)> = (0..4)
            .flat_map(|n| index.neighbours(n).map(move |m| (n as u32, m)))
            .collect();
        seen.sort_unstable();
        assert_eq!(
            seen,
            vec![(0, 1), (1, 0), (1, 2), (2, 1), (2, 3), (3, 2)]
        );
        let total: u32 = (0..4).map(|n| index.degree(n)).sum();
        assert_eq!(total, 2 * edges.len() as u32);
    }

    #[test]
    fn duplicate_edges_count_per_copy() {
        let edges = [GpuEdge::new(0, 1), GpuEdge::new(0, 1)];
        let index = AdjacencyIndex::build(2, &edges).unwrap();
        assert_eq!(index.neighbours(0).collect::<Vec<_>>(), vec![1, 1]);
        assert_eq!(index.neighbours(1).collect::<Vec<_>>(), vec![0, 0]);
    }

    #[test]
    fn isolated_nodes_have_empty_ranges() {
        let index = AdjacencyIndex::build(5, &[GpuEdge::new(3, 4)]).unwrap();
        assert_eq!(index.degree(0), 0);
        assert_eq!(index.neighbours(1).count(), 0);
        assert_eq!(index.edge_count(), 1);
    }

    #[test]
    fn rejects_invalid_endpoint() {
        let err = AdjacencyIndex::build(2, &[GpuEdge::new(0, 1), GpuEdge::new(2, 0)]).unwrap_err();
        assert!(matches!(err, LayoutError::InvalidEdge { index: 1, .. }));
    }
}
