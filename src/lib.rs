//! forcegraph - Force-directed 2D graph layout on the GPU.
//!
//! Nodes are ordered along a Morton curve, grouped into a four-way clustering
//! tree and pushed apart with a Barnes-Hut approximation while edges pull
//! their endpoints together. A cooling schedule shrinks the step size until
//! the layout settles.
//!
//! The same pipeline runs on the GPU ([`gpu::GpuBackend`]) or on the host
//! ([`HostBackend`]); both plug into [`LayoutEngine`].

pub mod adjacency;
pub mod config;
pub mod cooling;
pub mod driver;
pub mod error;
pub mod gpu;
pub mod graph;
pub mod morton;
pub mod reference;
pub mod tree;

pub use adjacency::AdjacencyIndex;
pub use config::LayoutConfig;
pub use cooling::{CoolingSchedule, StopReason};
pub use driver::{
    EngineState, IterationParams, LayoutBackend, LayoutEngine, Progress, RunOutcome, RunSummary,
    StopHandle,
};
pub use error::{LayoutError, LayoutResult};
pub use graph::{GraphData, Placement};
pub use reference::HostBackend;
pub use tree::{ClusterTree, TreeLayout};

/// Engine running on the GPU
pub type GpuLayoutEngine = LayoutEngine<gpu::GpuBackend>;

/// Engine running on the host
pub type HostLayoutEngine = LayoutEngine<HostBackend>;
