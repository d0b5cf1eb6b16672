//! B-ary clustering tree over spatially sorted nodes
//!
//! The tree is a flat array: leaves occupy `[0, n)` in sorted order and each
//! higher level occupies the next contiguous range. A cluster's children are
//! `B` consecutive entries of the level below, so no pointers are stored
//! beyond the child indices themselves.

use crate::config::BRANCHING_FACTOR;
use crate::gpu::{
    BoundingBox, ClusterNode, GpuNode, LevelUniforms, MAX_TREE_LEVELS, NO_CHILD, TreeHeader,
};

/// Index ranges of every tree level for a given node count
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeLayout {
    node_count: u32,
    level_starts: Vec<u32>,
    level_counts: Vec<u32>,
}

impl TreeLayout {
    pub fn new(node_count: u32) -> Self {
        let mut level_starts = Vec::new();
        let mut level_counts = Vec::new();

        if node_count > 0 {
            let mut start: u32 = 0;
            let mut count = node_count;
            level_starts.push(start);
            level_counts.push(count);
            while count > 1 {
                start = start.saturating_add(count);
                count = count.div_ceil(BRANCHING_FACTOR);
                level_starts.push(start);
                level_counts.push(count);
            }
        }

        Self {
            node_count,
            level_starts,
            level_counts,
        }
    }

    pub fn node_count(&self) -> u32 {
        self.node_count
    }

    /// Number of levels including the leaf level
    pub fn level_count(&self) -> usize {
        self.level_starts.len()
    }

    /// Number of cluster levels above the leaves, `ceil(log_B n)`
    pub fn cluster_levels(&self) -> usize {
        self.level_count().saturating_sub(1)
    }

    /// Leaves plus clusters
    pub fn total_count(&self) -> u32 {
        match (self.level_starts.last(), self.level_counts.last()) {
            (Some(start), Some(count)) => start + count,
            _ => 0,
        }
    }

    /// Index of the root, or [`NO_CHILD`] for an empty tree
    pub fn root(&self) -> u32 {
        self.level_starts.last().copied().unwrap_or(NO_CHILD)
    }

    pub fn level_range(&self, level: usize) -> std::ops::Range<u32> {
        let start = self.level_starts[level];
        start..start + self.level_counts[level]
    }

    /// Build parameters for every cluster level, bottom-up
    pub fn level_uniforms(&self) -> Vec<LevelUniforms> {
        (1..self.level_count())
            .map(|level| LevelUniforms {
                level_start: self.level_starts[level],
                level_count: self.level_counts[level],
                child_start: self.level_starts[level - 1],
                child_count: self.level_counts[level - 1],
            })
            .collect()
    }

    pub fn header(&self) -> TreeHeader {
        let mut level_start = [0; MAX_TREE_LEVELS];
        for (slot, start) in level_start.iter_mut().zip(&self.level_starts) {
            *slot = *start;
        }
        TreeHeader {
            node_count: self.node_count,
            total_count: self.total_count(),
            level_count: self.level_count() as u32,
            root: self.root(),
            level_start,
        }
    }
}

/// Child slots of cluster `slot` in a level whose children start at
/// `child_start` and number `child_count`
pub fn child_indices(slot: u32, child_start: u32, child_count: u32) -> [u32; 4] {
    let mut children = [NO_CHILD; 4];
    for (c, child) in children.iter_mut().enumerate() {
        let offset = slot * BRANCHING_FACTOR + c as u32;
        if offset < child_count {
            *child = child_start + offset;
        }
    }
    children
}

/// Combine live children into their parent: summed mass, mass-weighted
/// centre, union of rectangles.
///
/// The rectangle is the tight union of the children rather than a fixed
/// subdivision of the parent's rectangle; it still contains every leaf below.
pub fn merge_children(nodes: &[ClusterNode], children: [u32; 4]) -> ClusterNode {
    let mut rect = [f32::MAX, f32::MAX, f32::MIN, f32::MIN];
    let mut weighted = [0.0f32; 2];
    let mut mass = 0.0f32;

    for child in children.iter().copied().filter(|&c| c != NO_CHILD) {
        let node = &nodes[child as usize];
        mass += node.mass;
        weighted[0] += node.mass * node.center_of_mass[0];
        weighted[1] += node.mass * node.center_of_mass[1];
        rect[0] = rect[0].min(node.rect[0]);
        rect[1] = rect[1].min(node.rect[1]);
        rect[2] = rect[2].max(node.rect[2]);
        rect[3] = rect[3].max(node.rect[3]);
    }

    let center_of_mass = if mass > 0.0 {
        [weighted[0] / mass, weighted[1] / mass]
    } else {
        [0.0, 0.0]
    };

    ClusterNode {
        rect,
        children,
        center_of_mass,
        mass,
        _padding: 0.0,
    }
}

/// A built tree together with its layout
#[derive(Debug, Clone)]
pub struct ClusterTree {
    pub layout: TreeLayout,
    pub nodes: Vec<ClusterNode>,
}

impl ClusterTree {
    /// Build the tree bottom-up.
    ///
    /// `order[i]` is the node placed at leaf `i`. The root rectangle is
    /// widened to the global bounding box.
    pub fn build(positions: &[GpuNode], order: &[u32], bounds: &BoundingBox) -> Self {
        let layout = TreeLayout::new(order.len() as u32);
        let mut nodes = Vec::with_capacity(layout.total_count() as usize);

        nodes.extend(order.iter().map(|&i| {
            let node = &positions[i as usize];
            ClusterNode::leaf(node.x, node.y)
        }));

        for level in layout.level_uniforms() {
            for slot in 0..level.level_count {
                let children = child_indices(slot, level.child_start, level.child_count);
                let cluster = merge_children(&nodes, children);
                nodes.push(cluster);
            }
        }

        if let Some(root) = nodes.last_mut() {
            if !bounds.is_empty() {
                let global = bounds.rect();
                root.rect[0] = root.rect[0].min(global[0]);
                root.rect[1] = root.rect[1].min(global[1]);
                root.rect[2] = root.rect[2].max(global[2]);
                root.rect[3] = root.rect[3].max(global[3]);
            }
        }

        Self { layout, nodes }
    }

    pub fn root(&self) -> Option<&ClusterNode> {
        self.nodes.get(self.layout.root() as usize)
    }

    pub fn is_leaf(&self, index: u32) -> bool {
        index < self.layout.node_count()
    }
}

/// Walk a tree read back from either backend and check that every cluster's
/// mass equals the sum of its children's, the leaf level totals `n`, and
/// every child's rectangle lies inside its parent's.
pub fn check_tree(layout: &TreeLayout, nodes: &[ClusterNode]) -> Result<(), String> {
    if nodes.len() < layout.total_count() as usize {
        return Err(format!(
            "tree has {} entries, expected {}",
            nodes.len(),
            layout.total_count()
        ));
    }
    if layout.level_count() == 0 {
        return Ok(());
    }

    let leaves = layout.level_range(0);
    let leaf_mass: f32 = nodes[leaves.start as usize..leaves.end as usize]
        .iter()
        .map(|n| n.mass)
        .sum();
    if leaf_mass != layout.node_count() as f32 {
        return Err(format!(
            "leaf mass {} does not match node count {}",
            leaf_mass,
            layout.node_count()
        ));
    }

    for level in 1..layout.level_count() {
        let mut level_mass = 0.0;
        for index in layout.level_range(level) {
            let cluster = &nodes[index as usize];
            level_mass += cluster.mass;
            let mut child_mass = 0.0;
            for child in cluster.live_children() {
                let node = &nodes[child as usize];
                child_mass += node.mass;
                let inside = node.rect[0] >= cluster.rect[0]
                    && node.rect[1] >= cluster.rect[1]
                    && node.rect[2] <= cluster.rect[2]
                    && node.rect[3] <= cluster.rect[3];
                if !inside {
                    return Err(format!("child {} escapes cluster {}", child, index));
                }
            }
            if child_mass != cluster.mass {
                return Err(format!(
                    "cluster {} has mass {} but its children sum to {}",
                    index, cluster.mass, child_mass
                ));
            }
        }
        if level_mass != layout.node_count() as f32 {
            return Err(format!("level {} holds mass {}", level, level_mass));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(n: usize) -> Vec<GpuNode> {
        (0..n).map(|i| GpuNode::new(i as f32 * 0.1, (i % 3) as f32)).collect()
    }

    #[test]
    fn layout_level_ranges() {
        let layout = TreeLayout::new(10);
        // 10 leaves, 3 clusters, 1 root
        assert_eq!(layout.level_count(), 3);
        assert_eq!(layout.cluster_levels(), 2);
        assert_eq!(layout.level_range(0), 0..10);
        assert_eq!(layout.level_range(1), 10..13);
        assert_eq!(layout.level_range(2), 13..14);
        assert_eq!(layout.total_count(), 14);
        assert_eq!(layout.root(), 13);
    }

    #[test]
    fn cluster_levels_match_log_b() {
        for (n, expected) in [(1, 0), (2, 1), (4, 1), (5, 2), (16, 2), (17, 3), (1 << 20, 10)] {
            assert_eq!(TreeLayout::new(n).cluster_levels(), expected, "n = {}", n);
        }
        assert_eq!(TreeLayout::new(0).level_count(), 0);
        assert_eq!(TreeLayout::new(0).root(), NO_CHILD);
    }

    #[test]
    fn header_fits_largest_tree() {
        let layout = TreeLayout::new(1 << 30);
        assert!(layout.level_count() <= MAX_TREE_LEVELS);
        let header = layout.header();
        assert_eq!(header.root, layout.root());
    }

    #[test]
    fn partial_last_group_has_absent_children() {
        assert_eq!(child_indices(0, 0, 5), [0, 1, 2, 3]);
        assert_eq!(child_indices(1, 0, 5), [4, NO_CHILD, NO_CHILD, NO_CHILD]);
    }

    #[test]
    fn mass_is_conserved() {
        let positions = line(23);
        let order: Vec<u32> = (0..23).rev().collect();
        let tree = ClusterTree::build(&positions, &order, &BoundingBox::from_nodes(&positions));

        check_tree(&tree.layout, &tree.nodes).unwrap();
        assert_eq!(tree.root().unwrap().mass, 23.0);
    }

    #[test]
    fn centre_of_mass_is_weighted() {
        let positions = vec![
            GpuNode::new(0.0, 0.0),
            GpuNode::new(1.0, 0.0),
            GpuNode::new(2.0, 0.0),
            GpuNode::new(3.0, 0.0),
            GpuNode::new(10.0, 10.0),
        ];
        let order = [0, 1, 2, 3, 4];
        let tree = ClusterTree::build(&positions, &order, &BoundingBox::empty());

        // first cluster holds four nodes, the second one
        assert_eq!(tree.nodes[5].center_of_mass, [1.5, 0.0]);
        assert_eq!(tree.nodes[6].mass, 1.0);
        let root = tree.root().unwrap();
        assert_eq!(root.mass, 5.0);
        assert!((root.center_of_mass[0] - 16.0 / 5.0).abs() < 1e-6);
        assert!((root.center_of_mass[1] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn leaves_lie_in_their_rectangles() {
        let positions = line(40);
        let order: Vec<u32> = (0..40).collect();
        let bounds = BoundingBox::from_nodes(&positions);
        let tree = ClusterTree::build(&positions, &order, &bounds);

        for (leaf, &node) in order.iter().enumerate() {
            let p = positions[node as usize];
            assert!(tree.nodes[leaf].contains(p.x, p.y));
            assert!(tree.is_leaf(leaf as u32));
        }
        let root = tree.root().unwrap();
        let [x0, y0, x1, y1] = bounds.rect();
        assert!(root.rect[0] <= x0 && root.rect[1] <= y0);
        assert!(root.rect[2] >= x1 && root.rect[3] >= y1);
    }

    #[test]
    fn single_node_tree_is_a_leaf() {
        let positions = vec![GpuNode::new(0.5, 0.5)];
        let tree = ClusterTree::build(&positions, &[0], &BoundingBox::from_nodes(&positions));
        assert_eq!(tree.layout.root(), 0);
        assert_eq!(tree.nodes.len(), 1);
        assert!(tree.is_leaf(0));
    }
}
