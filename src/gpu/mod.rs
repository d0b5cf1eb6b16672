//! GPU force-directed layout (Barnes-Hut on compute shaders)
//!
//! This module runs the whole layout iteration on the device with wgpu. The
//! host uploads a graph once and then only queues work; positions stay on the
//! device until they are read back.
//!
//! # Pipeline
//!
//! Each iteration runs these stages in order:
//!
//! - **Spatial keys**: quantise positions inside the bounding box and
//!   interleave them into 32-bit Morton codes
//! - **Radix sort**: four stable 8-bit passes sorting node indices by key
//! - **Tree build**: group sorted leaves four at a time, level by level, into
//!   clusters with a bounding rectangle, centre of mass and mass
//! - **Attractive forces**: per node, over the flattened adjacency lists
//! - **Repulsive forces**: Barnes-Hut traversal of the tree, combined with
//!   the attractive force and limited by the cooling factor
//! - **Integration**: move, clamp into the domain and rebuild the bounding box
//!
//! # Example
//!
//! ```rust,ignore
//! use forcegraph::gpu::{GpuBackend, GpuEdge, GpuNode};
//! use forcegraph::{GraphData, LayoutConfig, LayoutEngine};
//!
//! let graph = GraphData::new(
//!     vec![GpuNode::new(0.0, 0.0), GpuNode::new(1.0, 0.0), GpuNode::new(0.5, 0.8)],
//!     vec![GpuEdge::new(0, 1), GpuEdge::new(1, 2), GpuEdge::new(2, 0)],
//! );
//!
//! let mut engine = LayoutEngine::new(GpuBackend::new()?, LayoutConfig::default())?;
//! engine.load(&graph)?;
//! engine.run()?;
//!
//! for node in engine.positions()? {
//!     println!("Position: {:?}", node.position());
//! }
//! ```

mod backend;
pub(crate) mod device;
mod shaders;
mod sort;
mod types;

pub use backend::GpuBackend;
pub use device::GpuContext;
pub use shaders::{
    LayoutShaders, NODE_WORKGROUP_SIZE, SORT_BLOCK_KEYS, SORT_ROWS_PER_BLOCK, SORT_WORKGROUP_SIZE,
};
pub use sort::{RadixSorter, SELF_TEST_KEYS, SORT_PASSES, SortBuffers, padded_size};
pub use types::{
    AdjacencyEntry, BoundingBox, ClusterNode, GpuEdge, GpuNode, LayoutUniforms, LevelUniforms,
    MAX_TREE_LEVELS, NO_CHILD, SortUniforms, TreeHeader,
};
