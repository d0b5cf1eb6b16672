//! Error types for graph loading, device setup and layout runs

use thiserror::Error;

/// Errors that can occur while loading a graph or running a layout
#[derive(Error, Debug)]
pub enum LayoutError {
    /// No compatible GPU adapter was found
    #[error("no suitable GPU adapter found")]
    NoAdapter,

    /// The adapter refused to create a device
    #[error("failed to create GPU device: {0}")]
    DeviceCreation(String),

    /// A buffer would exceed the device limits
    #[error("buffer '{label}' needs {requested} bytes but the device allows at most {limit}")]
    Allocation {
        label: &'static str,
        requested: u64,
        limit: u64,
    },

    /// The device reported an allocation failure
    #[error("device ran out of memory: {0}")]
    OutOfMemory(String),

    /// Mapping a staging buffer for readback failed
    #[error("failed to map buffer: {0}")]
    BufferMap(String),

    /// An edge refers to a node that does not exist
    #[error("edge {index} ({from} -> {to}) is out of range for {node_count} nodes")]
    InvalidEdge {
        index: usize,
        from: u32,
        to: u32,
        node_count: usize,
    },

    /// A sort was requested for more keys than the buffers hold
    #[error("cannot sort {requested} keys with buffers sized for {capacity}")]
    SortCapacity { requested: u32, capacity: u32 },

    /// A layout parameter is outside its valid range
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// `run` was called before any graph was loaded
    #[error("no graph has been loaded")]
    NotLoaded,

    /// An I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON could not be parsed or written
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML could not be parsed
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type for layout operations
pub type LayoutResult<T> = Result<T, LayoutError>;
