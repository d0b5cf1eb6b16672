//! CPU execution of the layout pipeline
//!
//! Mirrors the WGSL kernels step by step so GPU results can be checked
//! against it, and so layouts can be computed on machines without a GPU.

use crate::adjacency::AdjacencyIndex;
use crate::config::STACK_CAPACITY;
use crate::driver::{IterationParams, LayoutBackend};
use crate::error::LayoutResult;
use crate::gpu::{BoundingBox, GpuNode};
use crate::graph::GraphData;
use crate::morton;
use crate::tree::ClusterTree;

/// Divisor of the index-dependent offset applied at the domain walls
const WALL_OFFSET_DIVISOR: f32 = 500_000.0;

/// Stable ascending sort of `keys`, carrying `vals` along.
///
/// Four 8-bit counting passes, the same digit order the device sort uses.
pub fn radix_sort(keys: &mut [u32], vals: &mut [u32]) {
    assert_eq!(keys.len(), vals.len(), "keys and payload differ in length");
    let n = keys.len();
    let mut keys_tmp = vec![0u32; n];
    let mut vals_tmp = vec![0u32; n];

    // Even passes write the temporaries, odd passes write back
    for pass in 0..4 {
        let shift = pass * 8;
        if pass % 2 == 0 {
            scatter_pass(keys, vals, &mut keys_tmp, &mut vals_tmp, shift);
        } else {
            scatter_pass(&keys_tmp, &vals_tmp, keys, vals, shift);
        }
    }
}

fn scatter_pass(
    src_keys: &[u32],
    src_vals: &[u32],
    dst_keys: &mut [u32],
    dst_vals: &mut [u32],
    shift: u32,
) {
    let mut offsets = [0usize; 256];
    for key in src_keys {
        offsets[((key >> shift) & 0xff) as usize] += 1;
    }
    let mut running = 0;
    for slot in offsets.iter_mut() {
        let count = *slot;
        *slot = running;
        running += count;
    }
    for (key, val) in src_keys.iter().zip(src_vals) {
        let digit = ((key >> shift) & 0xff) as usize;
        dst_keys[offsets[digit]] = *key;
        dst_vals[offsets[digit]] = *val;
        offsets[digit] += 1;
    }
}

/// Attractive force on `node`: d² / l toward every neighbour
pub fn attractive_force(
    nodes: &[GpuNode],
    adjacency: &AdjacencyIndex,
    node: usize,
    ideal_length: f32,
) -> [f32; 2] {
    let p = nodes[node].position();
    let mut force = [0.0f32; 2];
    for other in adjacency.neighbours(node) {
        let q = nodes[other as usize].position();
        let delta = [q[0] - p[0], q[1] - p[1]];
        let d = length(delta);
        if d > 1e-7 {
            let scale = d * d / ideal_length / d;
            force[0] += scale * delta[0];
            force[1] += scale * delta[1];
        }
    }
    force
}

fn repulsion(p: [f32; 2], q: [f32; 2], weight: f32) -> [f32; 2] {
    let delta = [p[0] - q[0], p[1] - q[1]];
    let d = length(delta);
    if d > 0.0 {
        let scale = weight / d / d;
        [scale * delta[0], scale * delta[1]]
    } else {
        [0.0, 0.0]
    }
}

/// Barnes-Hut repulsion on a point, using a stack of [`STACK_CAPACITY`]
/// entries
pub fn repulsive_force(tree: &ClusterTree, p: [f32; 2], ideal_length: f32, theta: f32) -> [f32; 2] {
    repulsive_force_with_capacity(tree, p, ideal_length, theta, STACK_CAPACITY as usize)
}

/// Barnes-Hut repulsion with a traversal stack of `capacity` entries.
/// Clusters that do not fit on the stack are skipped along with everything
/// below them.
pub fn repulsive_force_with_capacity(
    tree: &ClusterTree,
    p: [f32; 2],
    ideal_length: f32,
    theta: f32,
    capacity: usize,
) -> [f32; 2] {
    let l2 = ideal_length * ideal_length;
    let total = tree.nodes.len() as u32;
    let mut force = [0.0f32; 2];
    let mut add = |f: [f32; 2]| {
        force[0] += f[0];
        force[1] += f[1];
    };

    let mut stack = Vec::with_capacity(capacity);
    stack.push(tree.layout.root());

    while let Some(index) = stack.pop() {
        if index >= total {
            continue;
        }
        let cluster = &tree.nodes[index as usize];
        if tree.is_leaf(index) {
            add(repulsion(p, cluster.center_of_mass, l2));
            continue;
        }
        if cluster.mass <= 0.0 {
            continue;
        }

        let delta = [p[0] - cluster.center_of_mass[0], p[1] - cluster.center_of_mass[1]];
        let d = length(delta);
        let s = cluster.half_width();
        if !cluster.contains(p[0], p[1]) && d > 0.0 && theta * d > s {
            add(repulsion(p, cluster.center_of_mass, cluster.mass * l2));
        } else {
            for child in cluster.live_children() {
                if tree.is_leaf(child) {
                    add(repulsion(p, tree.nodes[child as usize].center_of_mass, l2));
                } else if stack.len() < capacity {
                    stack.push(child);
                }
            }
        }
    }
    force
}

/// Net displacement: sum clamped to `cooling`, tiny vectors snapped to zero
pub fn combine_forces(attractive: [f32; 2], repulsive: [f32; 2], cooling: f32) -> [f32; 2] {
    let net = [attractive[0] + repulsive[0], attractive[1] + repulsive[1]];
    let magnitude = length(net);
    if magnitude > 1e-9 {
        let scale = cooling.min(magnitude) / magnitude;
        [net[0] * scale, net[1] * scale]
    } else {
        [0.0, 0.0]
    }
}

/// Clamp a coordinate into the domain and nudge it off the walls
pub fn settle(value: f32, index: usize, low: f32, high: f32) -> f32 {
    let offset = index as f32 / WALL_OFFSET_DIVISOR;
    let x = value.clamp(low, high);
    if x == high {
        x - offset
    } else if x == low {
        x + offset
    } else {
        x
    }
}

fn length(v: [f32; 2]) -> f32 {
    (v[0] * v[0] + v[1] * v[1]).sqrt()
}

/// Runs every iteration on the host
#[derive(Debug, Default)]
pub struct HostBackend {
    nodes: Vec<GpuNode>,
    adjacency: AdjacencyIndex,
    forces: Vec<[f32; 2]>,
    bounds: BoundingBox,
    tree: Option<ClusterTree>,
}

impl HostBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tree built during the most recent iteration
    pub fn tree(&self) -> Option<&ClusterTree> {
        self.tree.as_ref()
    }

    pub fn nodes(&self) -> &[GpuNode] {
        &self.nodes
    }

    /// Morton keys for the current positions, paired with node indices
    fn spatial_order(&self) -> Vec<u32> {
        let rect = self.bounds.rect();
        let mut keys: Vec<u32> = self
            .nodes
            .iter()
            .map(|n| morton::encode(n.x, n.y, rect))
            .collect();
        let mut order: Vec<u32> = (0..self.nodes.len() as u32).collect();
        radix_sort(&mut keys, &mut order);
        order
    }
}

impl LayoutBackend for HostBackend {
    fn load(&mut self, graph: &GraphData) -> LayoutResult<()> {
        graph.validate()?;
        self.adjacency = AdjacencyIndex::from_sorted(
            graph.node_count(),
            &graph.edges_by_source(),
            &graph.edges_by_target(),
        );
        self.nodes = graph.nodes.clone();
        self.forces = vec![[0.0; 2]; graph.node_count()];
        self.bounds = BoundingBox::from_nodes(&self.nodes);
        self.tree = None;
        Ok(())
    }

    fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn edge_count(&self) -> usize {
        self.adjacency.edge_count()
    }

    fn iterate(&mut self, params: &IterationParams) -> LayoutResult<()> {
        let order = self.spatial_order();
        let tree = ClusterTree::build(&self.nodes, &order, &self.bounds);

        for i in 0..self.nodes.len() {
            let attractive = attractive_force(&self.nodes, &self.adjacency, i, params.ideal_length);
            let repulsive =
                repulsive_force(&tree, self.nodes[i].position(), params.ideal_length, params.theta);
            self.forces[i] = combine_forces(attractive, repulsive, params.cooling_factor);
        }

        let mut bounds = BoundingBox::empty();
        for (i, (node, force)) in self.nodes.iter_mut().zip(&mut self.forces).enumerate() {
            node.x = settle(node.x + force[0], i, params.domain_low, params.domain_high);
            node.y = settle(node.y + force[1], i, params.domain_low, params.domain_high);
            *force = [0.0, 0.0];
            bounds.fold(node.x, node.y);
        }
        self.bounds = bounds;
        self.tree = Some(tree);
        Ok(())
    }

    fn synchronize(&mut self) -> LayoutResult<()> {
        Ok(())
    }

    fn read_positions(&mut self) -> LayoutResult<Vec<GpuNode>> {
        Ok(self.nodes.clone())
    }

    fn read_bounds(&mut self) -> LayoutResult<BoundingBox> {
        Ok(self.bounds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LayoutConfig;
    use crate::cooling::CoolingSchedule;
    use crate::driver::{LayoutEngine, RunOutcome};
    use crate::gpu::GpuEdge;
    use crate::graph::Placement;
    use crate::tree::check_tree;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn params(cooling: f32, ideal_length: f32) -> IterationParams {
        IterationParams {
            cooling_factor: cooling,
            ideal_length,
            theta: 0.8,
            domain_low: -7.0,
            domain_high: 8.0,
        }
    }

    fn distance(a: &GpuNode, b: &GpuNode) -> f32 {
        ((a.x - b.x).powi(2) + (a.y - b.y).powi(2)).sqrt()
    }

    #[test]
    fn radix_sort_is_stable() {
        let mut keys = vec![5, 1, 0x0100, 1, u32::MAX, 0, 5, 0x0001_0000];
        let mut vals: Vec<u32> = (0..keys.len() as u32).collect();
        radix_sort(&mut keys, &mut vals);
        assert_eq!(keys, vec![0, 1, 1, 5, 5, 0x0100, 0x0001_0000, u32::MAX]);
        assert_eq!(vals, vec![5, 1, 3, 0, 6, 2, 7, 4]);
    }

    #[test]
    fn radix_sort_reversed_keys() {
        let n = 8192u32;
        let mut keys: Vec<u32> = (0..n).map(|i| n - 1 - i).collect();
        let mut vals: Vec<u32> = (0..n).collect();
        radix_sort(&mut keys, &mut vals);
        assert!(keys.iter().copied().eq(0..n));
        assert!(vals.iter().copied().eq((0..n).rev()));
    }

    #[test]
    fn radix_sort_random_is_permutation() {
        let mut rng = StdRng::seed_from_u64(11);
        let original: Vec<u32> = (0..2000).map(|_| rng.r#gen()).collect();
        let mut keys = original.clone();
        let mut vals: Vec<u32> = (0..2000).collect();
        radix_sort(&mut keys, &mut vals);

        assert!(keys.windows(2).all(|w| w[0] <= w[1]));
        for (key, val) in keys.iter().zip(&vals) {
            assert_eq!(original[*val as usize], *key);
        }

        // sorting again changes nothing
        let mut again = keys.clone();
        let mut again_vals = vals.clone();
        radix_sort(&mut again, &mut again_vals);
        assert_eq!(again, keys);
        assert_eq!(again_vals, vals);
    }

    #[test]
    fn radix_sort_empty() {
        let mut keys: Vec<u32> = Vec::new();
        let mut vals: Vec<u32> = Vec::new();
        radix_sort(&mut keys, &mut vals);
        assert!(keys.is_empty());
    }

    #[test]
    fn edge_forces_are_symmetric() {
        let nodes = vec![GpuNode::new(0.1, 0.2), GpuNode::new(0.4, -0.2)];
        let adjacency = AdjacencyIndex::build(2, &[GpuEdge::new(0, 1)]).unwrap();
        let on_u = attractive_force(&nodes, &adjacency, 0, 0.01);
        let on_v = attractive_force(&nodes, &adjacency, 1, 0.01);

        assert!((on_u[0] + on_v[0]).abs() < 1e-4);
        assert!((on_u[1] + on_v[1]).abs() < 1e-4);
        // |f| = d² / l with d = 0.5
        assert!((length(on_u) - 25.0).abs() < 1e-3);
        assert!(on_u[0] > 0.0 && on_u[1] < 0.0);
    }

    #[test]
    fn self_loops_add_no_force() {
        let nodes = vec![GpuNode::new(1.0, 1.0)];
        let adjacency = AdjacencyIndex::build(1, &[GpuEdge::new(0, 0)]).unwrap();
        assert_eq!(attractive_force(&nodes, &adjacency, 0, 0.01), [0.0, 0.0]);
    }

    #[test]
    fn far_cluster_is_approximated() {
        // a tight group far away acts like one body of its mass
        let mut nodes = vec![GpuNode::new(0.0, 0.0)];
        for i in 0..4 {
            nodes.push(GpuNode::new(10.0 + i as f32 * 0.001, 0.0));
        }
        // the far group fills the first cluster, the origin the second
        let order = [1, 2, 3, 4, 0];
        let tree = ClusterTree::build(&nodes, &order, &BoundingBox::from_nodes(&nodes));

        let force = repulsive_force(&tree, [0.0, 0.0], 1.0, 0.8);
        let exact: f32 = (1..5).map(|i| 1.0 / nodes[i].x).sum();
        assert!(force[0] < 0.0);
        assert!((force[0].abs() - exact).abs() / exact < 1e-3);
        assert!(force[1].abs() < 1e-6);
    }

    #[test]
    fn full_stack_drops_subtrees() {
        let nodes: Vec<GpuNode> = (0..256)
            .map(|i| GpuNode::new(i as f32 / 256.0, (i % 7) as f32 * 0.01))
            .collect();
        let order: Vec<u32> = (0..256).collect();
        let tree = ClusterTree::build(&nodes, &order, &BoundingBox::from_nodes(&nodes));
        assert_eq!(tree.layout.level_count(), 5);

        // theta = 0 opens every cluster, so the full stack reaches every leaf
        let p = [-1.0, 0.0];
        let full = repulsive_force(&tree, p, 0.1, 0.0);
        for capacity in [1, 2] {
            let capped = repulsive_force_with_capacity(&tree, p, 0.1, 0.0, capacity);
            assert!(capped[0].is_finite() && capped[1].is_finite());
            assert!(capped[0] < 0.0);
            assert!(length(capped) < length(full), "capacity {}", capacity);
        }
        let one = repulsive_force_with_capacity(&tree, p, 0.1, 0.0, 1);
        let two = repulsive_force_with_capacity(&tree, p, 0.1, 0.0, 2);
        assert!(length(one) < length(two));
    }

    #[test]
    fn node_never_repels_itself() {
        let nodes = vec![GpuNode::new(0.5, 0.5)];
        let tree = ClusterTree::build(&nodes, &[0], &BoundingBox::from_nodes(&nodes));
        assert_eq!(repulsive_force(&tree, [0.5, 0.5], 0.01, 0.8), [0.0, 0.0]);
    }

    #[test]
    fn combination_clamps_and_snaps() {
        let clamped = combine_forces([3.0, 0.0], [0.0, 4.0], 0.5);
        assert!((length(clamped) - 0.5).abs() < 1e-6);
        assert!((clamped[0] / clamped[1] - 0.75).abs() < 1e-6);

        let small = combine_forces([0.1, 0.0], [0.0, 0.0], 0.5);
        assert_eq!(small, [0.1, 0.0]);

        assert_eq!(combine_forces([1e-10, 0.0], [0.0, 0.0], 0.5), [0.0, 0.0]);
    }

    #[test]
    fn settle_breaks_ties_at_walls() {
        assert_eq!(settle(3.0, 9, -7.0, 8.0), 3.0);
        assert_eq!(settle(12.0, 0, -7.0, 8.0), 8.0);
        assert!(settle(12.0, 5, -7.0, 8.0) < 8.0);
        assert!(settle(-9.0, 5, -7.0, 8.0) > -7.0);
        assert_ne!(settle(12.0, 5, -7.0, 8.0), settle(12.0, 6, -7.0, 8.0));
    }

    #[test]
    fn iteration_keeps_tree_invariants() {
        let graph = GraphData::scattered(
            150,
            Placement {
                seed: 5,
                extent: 2.0,
            },
        );
        let mut backend = HostBackend::new();
        backend.load(&graph).unwrap();
        backend.iterate(&params(0.1, 0.05)).unwrap();

        let tree = backend.tree().unwrap();
        check_tree(&tree.layout, &tree.nodes).unwrap();
        for leaf in 0..graph.node_count() {
            // leaves hold the positions the tree was built from
            let cluster = &tree.nodes[leaf];
            let matches = graph
                .nodes
                .iter()
                .any(|n| cluster.contains(n.x, n.y));
            assert!(matches);
        }
        let bounds = backend.read_bounds().unwrap();
        let [x0, y0, x1, y1] = bounds.rect();
        let eps = 1e-5;
        for node in backend.nodes() {
            assert!(node.x >= x0 - eps && node.x <= x1 + eps);
            assert!(node.y >= y0 - eps && node.y <= y1 + eps);
        }
    }

    #[test]
    fn connected_pair_converges_to_ideal_length() {
        for seed in 0..5 {
            let mut graph = GraphData::scattered(
                2,
                Placement {
                    seed,
                    extent: 1.0,
                },
            );
            graph.edges.push(GpuEdge::new(0, 1));

            let mut engine = LayoutEngine::new(HostBackend::new(), LayoutConfig::default()).unwrap();
            engine.load(&graph).unwrap();
            let outcome = engine.run().unwrap();
            assert!(matches!(outcome, RunOutcome::Completed(_)));

            let nodes = engine.positions().unwrap();
            let d = distance(&nodes[0], &nodes[1]);
            assert!((d - 0.01).abs() < 0.002, "seed {}: distance {}", seed, d);
        }
    }

    #[test]
    fn disconnected_nodes_spread_apart() {
        let graph = GraphData::scattered(
            24,
            Placement {
                seed: 9,
                extent: 1.0,
            },
        );
        let config = LayoutConfig {
            ideal_length: 0.3,
            require_edges: false,
            ..Default::default()
        };
        let schedule = CoolingSchedule::from_config(&config);

        let mut backend = HostBackend::new();
        backend.load(&graph).unwrap();
        let initial_area = backend.read_bounds().unwrap().area();

        let mut areas = Vec::new();
        for k in 0..schedule.planned_iterations() {
            backend
                .iterate(&params(schedule.factor(k), config.ideal_length))
                .unwrap();
            areas.push(backend.read_bounds().unwrap().area());
        }

        let final_area = *areas.last().unwrap();
        assert!(final_area > initial_area);
        let early_growth = (areas[10] - areas[0]).abs();
        let late_growth = (areas[areas.len() - 1] - areas[areas.len() - 11]).abs();
        assert!(late_growth < 1e-2, "box still growing by {}", late_growth);
        assert!(late_growth < early_growth);

        let nodes = backend.nodes();
        for i in 0..nodes.len() {
            for j in i + 1..nodes.len() {
                assert!(distance(&nodes[i], &nodes[j]) > 0.0, "nodes {} and {} coincide", i, j);
            }
        }
    }
}
