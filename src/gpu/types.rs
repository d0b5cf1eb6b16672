//! GPU buffer types for the layout pipeline
//!
//! These types are uploaded directly to GPU buffers.
//! All are repr(C) and Pod so their layout matches the WGSL structs in
//! `shaders.rs` byte for byte.

use bytemuck::{Pod, Zeroable};

use crate::config::FIXED_POINT_SCALE;

/// Marks an absent child slot in a [`ClusterNode`]
pub const NO_CHILD: u32 = u32::MAX;

/// Capacity of the level table in [`TreeHeader`]
pub const MAX_TREE_LEVELS: usize = 20;

/// A node of the graph.
///
/// Layout matches WGSL struct for direct buffer upload.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuNode {
    /// Auxiliary scalar, not read by the layout kernels
    pub value: f32,
    pub x: f32,
    pub y: f32,
    /// Render size, not read by the layout kernels
    pub size: f32,
}

impl GpuNode {
    /// Create a new node at the given position
    pub fn new(x: f32, y: f32) -> Self {
        Self {
            value: 0.0,
            x,
            y,
            size: 1.0,
        }
    }

    pub fn position(&self) -> [f32; 2] {
        [self.x, self.y]
    }
}

/// A directed edge between two node indices
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct GpuEdge {
    pub source: u32,
    pub target: u32,
}

impl GpuEdge {
    pub fn new(source: u32, target: u32) -> Self {
        Self { source, target }
    }
}

/// Per-node ranges into the flat source and target neighbour lists
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct AdjacencyEntry {
    pub source_start: u32,
    pub source_degree: u32,
    pub target_start: u32,
    pub target_degree: u32,
}

/// One entry of the clustering tree.
///
/// Leaves use the same layout with mass 1 and no children.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ClusterNode {
    /// Bounding rectangle as `[min_x, min_y, max_x, max_y]`
    pub rect: [f32; 4],
    /// Child indices, [`NO_CHILD`] for absent slots
    pub children: [u32; 4],
    pub center_of_mass: [f32; 2],
    /// Number of nodes below this cluster
    pub mass: f32,
    pub _padding: f32,
}

impl ClusterNode {
    /// A leaf holding a single node
    pub fn leaf(x: f32, y: f32) -> Self {
        Self {
            rect: [x, y, x, y],
            children: [NO_CHILD; 4],
            center_of_mass: [x, y],
            mass: 1.0,
            _padding: 0.0,
        }
    }

    /// Half of the longer side of the bounding rectangle
    pub fn half_width(&self) -> f32 {
        0.5 * (self.rect[2] - self.rect[0]).max(self.rect[3] - self.rect[1])
    }

    /// Whether `(x, y)` lies inside the bounding rectangle
    pub fn contains(&self, x: f32, y: f32) -> bool {
        x >= self.rect[0] && x <= self.rect[2] && y >= self.rect[1] && y <= self.rect[3]
    }

    /// Iterator over the live child indices
    pub fn live_children(&self) -> impl Iterator<Item = u32> + '_ {
        self.children.iter().copied().filter(|&c| c != NO_CHILD)
    }
}

/// Global bounding box, stored as fixed-point integers so the integrator can
/// fold positions in with atomic min/max.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct BoundingBox {
    pub x_min: i32,
    pub x_max: i32,
    pub y_min: i32,
    pub y_max: i32,
}

impl BoundingBox {
    /// The identity for folding: every position widens it
    pub fn empty() -> Self {
        Self {
            x_min: i32::MAX,
            x_max: i32::MIN,
            y_min: i32::MAX,
            y_max: i32::MIN,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.x_min > self.x_max || self.y_min > self.y_max
    }

    /// Widen the box to include `(x, y)`. Minima round down and maxima round
    /// up so the decoded box always contains the point.
    pub fn fold(&mut self, x: f32, y: f32) {
        self.x_min = self.x_min.min((x * FIXED_POINT_SCALE).floor() as i32);
        self.x_max = self.x_max.max((x * FIXED_POINT_SCALE).ceil() as i32);
        self.y_min = self.y_min.min((y * FIXED_POINT_SCALE).floor() as i32);
        self.y_max = self.y_max.max((y * FIXED_POINT_SCALE).ceil() as i32);
    }

    pub fn from_nodes(nodes: &[GpuNode]) -> Self {
        let mut bounds = Self::empty();
        for node in nodes {
            bounds.fold(node.x, node.y);
        }
        bounds
    }

    /// Decoded rectangle as `[min_x, min_y, max_x, max_y]`
    pub fn rect(&self) -> [f32; 4] {
        [
            self.x_min as f32 / FIXED_POINT_SCALE,
            self.y_min as f32 / FIXED_POINT_SCALE,
            self.x_max as f32 / FIXED_POINT_SCALE,
            self.y_max as f32 / FIXED_POINT_SCALE,
        ]
    }

    /// Area of the decoded rectangle
    pub fn area(&self) -> f32 {
        let [x0, y0, x1, y1] = self.rect();
        (x1 - x0).max(0.0) * (y1 - y0).max(0.0)
    }
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::empty()
    }
}

/// Level table of the clustering tree, uploaded once per dataset.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct TreeHeader {
    pub node_count: u32,
    /// Leaves plus clusters
    pub total_count: u32,
    /// Number of levels including the leaf level
    pub level_count: u32,
    pub root: u32,
    /// First index of every level
    pub level_start: [u32; MAX_TREE_LEVELS],
}

/// Per-iteration parameters shared by the layout kernels
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct LayoutUniforms {
    pub node_count: u32,
    pub edge_count: u32,
    pub cooling_factor: f32,
    pub ideal_length: f32,
    pub theta: f32,
    pub domain_low: f32,
    pub domain_high: f32,
    pub _padding: f32,
}

/// Parameters of one radix sort pass
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct SortUniforms {
    pub num_keys: u32,
    pub padded_size: u32,
    pub num_blocks: u32,
    /// Bit offset of the digit sorted in this pass
    pub shift: u32,
}

/// Parameters of one tree level build
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct LevelUniforms {
    pub level_start: u32,
    pub level_count: u32,
    pub child_start: u32,
    pub child_count: u32,
}
