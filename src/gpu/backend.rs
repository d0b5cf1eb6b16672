//! GPU execution of the layout pipeline
//!
//! Every iteration is recorded into one command encoder and submitted once:
//! spatial keys, radix sort, tree build (leaves, then one dispatch per
//! level), attractive forces, repulsive forces, bounding box reset and
//! integration. The host never waits between iterations; the driver decides
//! when to synchronise.

use super::device::{
    GpuContext, compute_pipeline, create_buffer, create_buffer_init, pipeline_layout, read_buffer,
    storage_entry, uniform_entry, uniform_slot, uniform_stride, workgroups,
};
use super::shaders::{LayoutShaders, NODE_WORKGROUP_SIZE};
use super::sort::{RadixSorter, SortBuffers};
use super::types::{BoundingBox, ClusterNode, GpuNode, LayoutUniforms, LevelUniforms};
use crate::adjacency::AdjacencyIndex;
use crate::driver::{IterationParams, LayoutBackend};
use crate::error::{LayoutError, LayoutResult};
use crate::graph::GraphData;
use crate::tree::TreeLayout;

/// Buffers and bind groups of one loaded dataset
struct GraphResources {
    node_count: u32,
    edge_count: u32,
    tree: TreeLayout,

    node_buffer: wgpu::Buffer,
    bounds_buffer: wgpu::Buffer,
    tree_buffer: wgpu::Buffer,
    uniform_buffer: wgpu::Buffer,
    // Kept alive to maintain GPU resources (referenced by bind groups)
    _force_buffer: wgpu::Buffer,
    _adjacency_buffer: wgpu::Buffer,
    _source_list_buffer: wgpu::Buffer,
    _target_list_buffer: wgpu::Buffer,
    _header_buffer: wgpu::Buffer,
    _level_buffer: wgpu::Buffer,
    sort_buffers: SortBuffers,

    morton_bind_group: wgpu::BindGroup,
    tree_bind_group: wgpu::BindGroup,
    attractive_bind_group: wgpu::BindGroup,
    repulsive_bind_group: wgpu::BindGroup,
    integrate_bind_group: wgpu::BindGroup,
}

/// Layout backend running every stage in compute shaders
pub struct GpuBackend {
    context: GpuContext,
    sorter: RadixSorter,

    morton_layout: wgpu::BindGroupLayout,
    tree_layout: wgpu::BindGroupLayout,
    attractive_layout: wgpu::BindGroupLayout,
    repulsive_layout: wgpu::BindGroupLayout,
    integrate_layout: wgpu::BindGroupLayout,

    morton_pipeline: wgpu::ComputePipeline,
    leaves_pipeline: wgpu::ComputePipeline,
    level_pipeline: wgpu::ComputePipeline,
    attractive_pipeline: wgpu::ComputePipeline,
    repulsive_pipeline: wgpu::ComputePipeline,
    reset_bounds_pipeline: wgpu::ComputePipeline,
    integrate_pipeline: wgpu::ComputePipeline,

    level_stride: u64,
    resources: Option<GraphResources>,
}

impl GpuBackend {
    /// Create a backend on a freshly requested device
    pub fn new() -> LayoutResult<Self> {
        Ok(Self::with_context(GpuContext::new()?))
    }

    /// Create a backend sharing an existing device
    pub fn with_context(context: GpuContext) -> Self {
        let device = &context.device;
        let shaders = LayoutShaders::new();
        let module = |label: &str, source: String| {
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            })
        };
        let morton_module = module("Morton Codes Shader", shaders.morton);
        let tree_module = module("Build Tree Shader", shaders.build_tree);
        let attractive_module = module("Attractive Forces Shader", shaders.attractive);
        let repulsive_module = module("Repulsive Forces Shader", shaders.repulsive);
        let integrate_module = module("Integrate Shader", shaders.integrate);

        let bind_group_layout = |label: &str, entries: &[wgpu::BindGroupLayoutEntry]| {
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(label),
                entries,
            })
        };
        let morton_layout = bind_group_layout(
            "Morton Codes Bind Group Layout",
            &[
                storage_entry(0, true),
                uniform_entry(1, false),
                storage_entry(2, true),
                storage_entry(3, false),
                storage_entry(4, false),
            ],
        );
        let tree_layout = bind_group_layout(
            "Build Tree Bind Group Layout",
            &[
                storage_entry(0, true),
                storage_entry(1, true),
                storage_entry(2, true),
                storage_entry(3, false),
                uniform_entry(4, true),
                uniform_entry(5, false),
            ],
        );
        let attractive_layout = bind_group_layout(
            "Attractive Forces Bind Group Layout",
            &[
                storage_entry(0, true),
                storage_entry(1, true),
                storage_entry(2, true),
                storage_entry(3, true),
                storage_entry(4, false),
                uniform_entry(5, false),
            ],
        );
        let repulsive_layout = bind_group_layout(
            "Repulsive Forces Bind Group Layout",
            &[
                storage_entry(0, true),
                storage_entry(1, false),
                uniform_entry(2, false),
                storage_entry(3, true),
                storage_entry(4, true),
            ],
        );
        let integrate_layout = bind_group_layout(
            "Integrate Bind Group Layout",
            &[
                storage_entry(0, false),
                storage_entry(1, false),
                uniform_entry(2, false),
                storage_entry(3, false),
            ],
        );

        let morton_pipeline = compute_pipeline(
            device,
            "Morton Codes Pipeline",
            &pipeline_layout(device, "Morton Codes Pipeline Layout", &morton_layout),
            &morton_module,
            "morton_codes",
        );
        let tree_pipeline_layout = pipeline_layout(device, "Build Tree Pipeline Layout", &tree_layout);
        let leaves_pipeline = compute_pipeline(
            device,
            "Build Leaves Pipeline",
            &tree_pipeline_layout,
            &tree_module,
            "build_leaves",
        );
        let level_pipeline = compute_pipeline(
            device,
            "Build Level Pipeline",
            &tree_pipeline_layout,
            &tree_module,
            "build_level",
        );
        let attractive_pipeline = compute_pipeline(
            device,
            "Attractive Forces Pipeline",
            &pipeline_layout(device, "Attractive Forces Pipeline Layout", &attractive_layout),
            &attractive_module,
            "attractive_forces",
        );
        let repulsive_pipeline = compute_pipeline(
            device,
            "Repulsive Forces Pipeline",
            &pipeline_layout(device, "Repulsive Forces Pipeline Layout", &repulsive_layout),
            &repulsive_module,
            "repulsive_forces",
        );
        let integrate_pipeline_layout =
            pipeline_layout(device, "Integrate Pipeline Layout", &integrate_layout);
        let reset_bounds_pipeline = compute_pipeline(
            device,
            "Reset Bounds Pipeline",
            &integrate_pipeline_layout,
            &integrate_module,
            "reset_bounds",
        );
        let integrate_pipeline = compute_pipeline(
            device,
            "Integrate Pipeline",
            &integrate_pipeline_layout,
            &integrate_module,
            "integrate",
        );

        let level_stride = uniform_stride::<LevelUniforms>(device);
        let sorter = RadixSorter::new(context.device.clone(), context.queue.clone());

        Self {
            context,
            sorter,
            morton_layout,
            tree_layout,
            attractive_layout,
            repulsive_layout,
            integrate_layout,
            morton_pipeline,
            leaves_pipeline,
            level_pipeline,
            attractive_pipeline,
            repulsive_pipeline,
            reset_bounds_pipeline,
            integrate_pipeline,
            level_stride,
            resources: None,
        }
    }

    pub fn context(&self) -> &GpuContext {
        &self.context
    }

    /// The sorter used for the spatial ordering, e.g. for a self-test
    pub fn sorter(&self) -> &RadixSorter {
        &self.sorter
    }

    /// Buffer holding the current node positions, for a renderer to bind
    pub fn node_buffer(&self) -> Option<&wgpu::Buffer> {
        self.resources.as_ref().map(|r| &r.node_buffer)
    }

    /// Read back the tree built by the most recent iteration
    pub fn read_tree(&mut self) -> LayoutResult<(TreeLayout, Vec<ClusterNode>)> {
        let resources = self.resources.as_ref().ok_or(LayoutError::NotLoaded)?;
        let nodes = read_buffer(
            &self.context.device,
            &self.context.queue,
            &resources.tree_buffer,
            resources.tree.total_count() as usize,
        )?;
        Ok((resources.tree.clone(), nodes))
    }

    fn create_resources(&self, graph: &GraphData) -> LayoutResult<GraphResources> {
        let device = &self.context.device;
        let node_count = graph.node_count() as u32;
        let edge_count = graph.edge_count() as u32;

        let adjacency = AdjacencyIndex::build(graph.node_count(), &graph.edges)?;
        let tree = TreeLayout::new(node_count);
        let bounds = BoundingBox::from_nodes(&graph.nodes);

        let storage = wgpu::BufferUsages::STORAGE;
        let node_buffer = create_buffer_init(
            device,
            "Node Buffer",
            &graph.nodes,
            storage | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
        )?;
        let force_buffer = create_buffer(
            device,
            "Force Buffer",
            u64::from(node_count) * 8,
            storage,
        )?;
        let bounds_buffer = create_buffer_init(
            device,
            "Bounds Buffer",
            &[bounds],
            storage | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
        )?;
        let adjacency_buffer =
            create_buffer_init(device, "Adjacency Buffer", &adjacency.entries, storage)?;
        let source_list_buffer =
            create_buffer_init(device, "Source List Buffer", &adjacency.source_list, storage)?;
        let target_list_buffer =
            create_buffer_init(device, "Target List Buffer", &adjacency.target_list, storage)?;
        let tree_buffer = create_buffer(
            device,
            "Cluster Tree",
            u64::from(tree.total_count()) * std::mem::size_of::<ClusterNode>() as u64,
            storage | wgpu::BufferUsages::COPY_SRC,
        )?;
        let header_buffer = create_buffer_init(device, "Tree Header", &[tree.header()], storage)?;

        let stride = self.level_stride as usize;
        let levels = tree.level_uniforms();
        let mut slots = vec![0u8; stride * levels.len().max(1)];
        for (level, uniforms) in levels.iter().enumerate() {
            let offset = level * stride;
            slots[offset..offset + std::mem::size_of::<LevelUniforms>()]
                .copy_from_slice(bytemuck::bytes_of(uniforms));
        }
        let level_buffer =
            create_buffer_init(device, "Level Uniforms", &slots, wgpu::BufferUsages::UNIFORM)?;

        let uniform_buffer = create_buffer(
            device,
            "Layout Uniforms",
            std::mem::size_of::<LayoutUniforms>() as u64,
            wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        )?;

        let sort_buffers = self.sorter.create_sort_buffers(node_count)?;

        let bind_group = |label: &str,
                          layout: &wgpu::BindGroupLayout,
                          resources: &[wgpu::BindingResource<'_>]| {
            let entries: Vec<wgpu::BindGroupEntry> = resources
                .iter()
                .enumerate()
                .map(|(binding, resource)| wgpu::BindGroupEntry {
                    binding: binding as u32,
                    resource: resource.clone(),
                })
                .collect();
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(label),
                layout,
                entries: &entries,
            })
        };

        let morton_bind_group = bind_group(
            "Morton Codes Bind Group",
            &self.morton_layout,
            &[
                node_buffer.as_entire_binding(),
                uniform_buffer.as_entire_binding(),
                bounds_buffer.as_entire_binding(),
                sort_buffers.keys_a.as_entire_binding(),
                sort_buffers.vals_a.as_entire_binding(),
            ],
        );
        let tree_bind_group = bind_group(
            "Build Tree Bind Group",
            &self.tree_layout,
            &[
                node_buffer.as_entire_binding(),
                sort_buffers.vals_a.as_entire_binding(),
                bounds_buffer.as_entire_binding(),
                tree_buffer.as_entire_binding(),
                uniform_slot::<LevelUniforms>(&level_buffer),
                uniform_buffer.as_entire_binding(),
            ],
        );
        let attractive_bind_group = bind_group(
            "Attractive Forces Bind Group",
            &self.attractive_layout,
            &[
                node_buffer.as_entire_binding(),
                adjacency_buffer.as_entire_binding(),
                source_list_buffer.as_entire_binding(),
                target_list_buffer.as_entire_binding(),
                force_buffer.as_entire_binding(),
                uniform_buffer.as_entire_binding(),
            ],
        );
        let repulsive_bind_group = bind_group(
            "Repulsive Forces Bind Group",
            &self.repulsive_layout,
            &[
                node_buffer.as_entire_binding(),
                force_buffer.as_entire_binding(),
                uniform_buffer.as_entire_binding(),
                tree_buffer.as_entire_binding(),
                header_buffer.as_entire_binding(),
            ],
        );
        let integrate_bind_group = bind_group(
            "Integrate Bind Group",
            &self.integrate_layout,
            &[
                node_buffer.as_entire_binding(),
                force_buffer.as_entire_binding(),
                uniform_buffer.as_entire_binding(),
                bounds_buffer.as_entire_binding(),
            ],
        );

        Ok(GraphResources {
            node_count,
            edge_count,
            tree,
            node_buffer,
            bounds_buffer,
            tree_buffer,
            uniform_buffer,
            _force_buffer: force_buffer,
            _adjacency_buffer: adjacency_buffer,
            _source_list_buffer: source_list_buffer,
            _target_list_buffer: target_list_buffer,
            _header_buffer: header_buffer,
            _level_buffer: level_buffer,
            sort_buffers,
            morton_bind_group,
            tree_bind_group,
            attractive_bind_group,
            repulsive_bind_group,
            integrate_bind_group,
        })
    }
}

impl LayoutBackend for GpuBackend {
    fn load(&mut self, graph: &GraphData) -> LayoutResult<()> {
        graph.validate()?;
        // Release the previous dataset before allocating the next one
        self.resources = None;
        let resources = self.create_resources(graph)?;
        tracing::debug!(
            nodes = resources.node_count,
            edges = resources.edge_count,
            levels = resources.tree.level_count(),
            "uploaded graph to device"
        );
        self.resources = Some(resources);
        Ok(())
    }

    fn node_count(&self) -> usize {
        self.resources.as_ref().map_or(0, |r| r.node_count as usize)
    }

    fn edge_count(&self) -> usize {
        self.resources.as_ref().map_or(0, |r| r.edge_count as usize)
    }

    fn iterate(&mut self, params: &IterationParams) -> LayoutResult<()> {
        let resources = self.resources.as_ref().ok_or(LayoutError::NotLoaded)?;
        let n = resources.node_count;
        if n == 0 {
            return Ok(());
        }

        let uniforms = LayoutUniforms {
            node_count: n,
            edge_count: resources.edge_count,
            cooling_factor: params.cooling_factor,
            ideal_length: params.ideal_length,
            theta: params.theta,
            domain_low: params.domain_low,
            domain_high: params.domain_high,
            _padding: 0.0,
        };
        self.context
            .queue
            .write_buffer(&resources.uniform_buffer, 0, bytemuck::bytes_of(&uniforms));

        let node_workgroups = workgroups(n, NODE_WORKGROUP_SIZE);
        let mut encoder =
            self.context
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("Layout Iteration Encoder"),
                });

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Morton Codes Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.morton_pipeline);
            pass.set_bind_group(0, &resources.morton_bind_group, &[]);
            pass.dispatch_workgroups(node_workgroups, 1, 1);
        }

        self.sorter
            .encode_sort(&mut encoder, &resources.sort_buffers, n)?;

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Build Tree Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.leaves_pipeline);
            pass.set_bind_group(0, &resources.tree_bind_group, &[0]);
            pass.dispatch_workgroups(node_workgroups, 1, 1);

            pass.set_pipeline(&self.level_pipeline);
            for (level, uniforms) in resources.tree.level_uniforms().iter().enumerate() {
                let offset = (level as u64 * self.level_stride) as u32;
                pass.set_bind_group(0, &resources.tree_bind_group, &[offset]);
                pass.dispatch_workgroups(
                    workgroups(uniforms.level_count, NODE_WORKGROUP_SIZE),
                    1,
                    1,
                );
            }
        }

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Attractive Forces Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.attractive_pipeline);
            pass.set_bind_group(0, &resources.attractive_bind_group, &[]);
            pass.dispatch_workgroups(node_workgroups, 1, 1);
        }

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Repulsive Forces Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.repulsive_pipeline);
            pass.set_bind_group(0, &resources.repulsive_bind_group, &[]);
            pass.dispatch_workgroups(node_workgroups, 1, 1);
        }

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Integration Pass"),
                timestamp_writes: None,
            });
            pass.set_bind_group(0, &resources.integrate_bind_group, &[]);
            pass.set_pipeline(&self.reset_bounds_pipeline);
            pass.dispatch_workgroups(1, 1, 1);
            pass.set_pipeline(&self.integrate_pipeline);
            pass.dispatch_workgroups(node_workgroups, 1, 1);
        }

        self.context.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn synchronize(&mut self) -> LayoutResult<()> {
        let _ = self.context.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }

    fn read_positions(&mut self) -> LayoutResult<Vec<GpuNode>> {
        let resources = self.resources.as_ref().ok_or(LayoutError::NotLoaded)?;
        read_buffer(
            &self.context.device,
            &self.context.queue,
            &resources.node_buffer,
            resources.node_count as usize,
        )
    }

    fn read_bounds(&mut self) -> LayoutResult<BoundingBox> {
        let resources = self.resources.as_ref().ok_or(LayoutError::NotLoaded)?;
        let bounds: Vec<BoundingBox> = read_buffer(
            &self.context.device,
            &self.context.queue,
            &resources.bounds_buffer,
            1,
        )?;
        Ok(bounds.first().copied().unwrap_or_default())
    }
}
