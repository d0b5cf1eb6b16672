//! Device setup, guarded buffer allocation and buffer readback

use std::sync::Arc;

use bytemuck::Pod;
use wgpu::util::DeviceExt;

use crate::error::{LayoutError, LayoutResult};

/// Smallest buffer we create; empty inputs still need a bindable buffer
const MIN_BUFFER_SIZE: u64 = 16;

/// An initialised device and queue shared by the sorter and the layout backend
#[derive(Clone)]
pub struct GpuContext {
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
}

impl GpuContext {
    /// Wrap an existing device, e.g. one owned by a renderer
    pub fn from_device(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        Self { device, queue }
    }

    /// Request a high-performance adapter and a device with its full limits
    pub fn new() -> LayoutResult<Self> {
        pollster::block_on(Self::request())
    }

    async fn request() -> LayoutResult<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or(LayoutError::NoAdapter)?;

        let info = adapter.get_info();
        tracing::info!(
            adapter = %info.name,
            backend = ?info.backend,
            "selected GPU adapter"
        );

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Layout Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: adapter.limits(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .map_err(|e| LayoutError::DeviceCreation(e.to_string()))?;

        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
        })
    }
}

/// Reject sizes the device cannot hold before asking it to allocate
fn check_limits(
    device: &wgpu::Device,
    label: &'static str,
    size: u64,
    usage: wgpu::BufferUsages,
) -> LayoutResult<()> {
    let limits = device.limits();
    let mut limit = limits.max_buffer_size;
    if usage.contains(wgpu::BufferUsages::STORAGE) {
        limit = limit.min(u64::from(limits.max_storage_buffer_binding_size));
    }
    if size > limit {
        return Err(LayoutError::Allocation {
            label,
            requested: size,
            limit,
        });
    }
    Ok(())
}

/// Run `create` inside an out-of-memory error scope
fn with_oom_scope(
    device: &wgpu::Device,
    label: &'static str,
    create: impl FnOnce() -> wgpu::Buffer,
) -> LayoutResult<wgpu::Buffer> {
    device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    let buffer = create();
    if let Some(error) = pollster::block_on(device.pop_error_scope()) {
        return Err(LayoutError::OutOfMemory(format!("{}: {}", label, error)));
    }
    Ok(buffer)
}

/// Create an uninitialised buffer, checked against the device limits
pub fn create_buffer(
    device: &wgpu::Device,
    label: &'static str,
    size: u64,
    usage: wgpu::BufferUsages,
) -> LayoutResult<wgpu::Buffer> {
    let size = size.max(MIN_BUFFER_SIZE).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
    check_limits(device, label, size, usage)?;
    with_oom_scope(device, label, || {
        device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage,
            mapped_at_creation: false,
        })
    })
}

/// Create a buffer holding `contents`, checked against the device limits
pub fn create_buffer_init<T: Pod>(
    device: &wgpu::Device,
    label: &'static str,
    contents: &[T],
    usage: wgpu::BufferUsages,
) -> LayoutResult<wgpu::Buffer> {
    if contents.is_empty() {
        return create_buffer(device, label, MIN_BUFFER_SIZE, usage);
    }
    let bytes: &[u8] = bytemuck::cast_slice(contents);
    check_limits(device, label, bytes.len() as u64, usage)?;
    with_oom_scope(device, label, || {
        device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytes,
            usage,
        })
    })
}

/// Copy the first `count` elements of `buffer` to the host.
///
/// Blocks until the device has finished all submitted work.
pub fn read_buffer<T: Pod>(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    buffer: &wgpu::Buffer,
    count: usize,
) -> LayoutResult<Vec<T>> {
    if count == 0 {
        return Ok(Vec::new());
    }

    let size = (count * std::mem::size_of::<T>()) as u64;
    let staging = create_buffer(
        device,
        "Staging Buffer",
        size,
        wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
    )?;

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("Readback Encoder"),
    });
    encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, size);
    queue.submit(std::iter::once(encoder.finish()));

    let slice = staging.slice(..size);
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });
    let _ = device.poll(wgpu::Maintain::Wait);
    rx.recv()
        .map_err(|e| LayoutError::BufferMap(e.to_string()))?
        .map_err(|e| LayoutError::BufferMap(e.to_string()))?;

    let data = slice.get_mapped_range();
    let values: Vec<T> = bytemuck::cast_slice(&data).to_vec();
    drop(data);
    staging.unmap();

    Ok(values)
}

/// Number of workgroups covering `count` invocations
pub fn workgroups(count: u32, size: u32) -> u32 {
    count.div_ceil(size).max(1)
}

/// Distance between uniform slots addressed by dynamic offset
pub fn uniform_stride<T>(device: &wgpu::Device) -> u64 {
    let align = u64::from(device.limits().min_uniform_buffer_offset_alignment);
    (std::mem::size_of::<T>() as u64).next_multiple_of(align)
}

pub fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Uniform binding; `dynamic` selects per-dispatch offsets into a slot array
pub fn uniform_entry(binding: u32, dynamic: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: dynamic,
            min_binding_size: None,
        },
        count: None,
    }
}

/// One slot of a dynamic-offset uniform buffer
pub fn uniform_slot<T>(buffer: &wgpu::Buffer) -> wgpu::BindingResource<'_> {
    wgpu::BindingResource::Buffer(wgpu::BufferBinding {
        buffer,
        offset: 0,
        size: wgpu::BufferSize::new(std::mem::size_of::<T>() as u64),
    })
}

pub fn compute_pipeline(
    device: &wgpu::Device,
    label: &str,
    layout: &wgpu::PipelineLayout,
    module: &wgpu::ShaderModule,
    entry_point: &str,
) -> wgpu::ComputePipeline {
    device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(label),
        layout: Some(layout),
        module,
        entry_point: Some(entry_point),
        compilation_options: Default::default(),
        cache: None,
    })
}

/// Pipeline layout with a single bind group
pub fn pipeline_layout(
    device: &wgpu::Device,
    label: &str,
    bind_group_layout: &wgpu::BindGroupLayout,
) -> wgpu::PipelineLayout {
    device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(label),
        bind_group_layouts: &[bind_group_layout],
        push_constant_ranges: &[],
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Device for tests, `None` when the machine has no usable adapter
    pub(crate) fn test_context() -> Option<GpuContext> {
        match GpuContext::new() {
            Ok(context) => Some(context),
            Err(e) => {
                eprintln!("skipping GPU test: {}", e);
                None
            }
        }
    }

    #[test]
    fn test_workgroups() {
        assert_eq!(workgroups(0, 64), 1);
        assert_eq!(workgroups(64, 64), 1);
        assert_eq!(workgroups(65, 64), 2);
    }

    #[test]
    fn test_buffer_round_trip() {
        let Some(context) = test_context() else {
            return;
        };
        let values: Vec<u32> = (0..100).collect();
        let buffer = create_buffer_init(
            &context.device,
            "Test Buffer",
            &values,
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        )
        .unwrap();
        let back: Vec<u32> = read_buffer(&context.device, &context.queue, &buffer, 100).unwrap();
        assert_eq!(back, values);
    }

    #[test]
    fn test_oversized_buffer_is_rejected() {
        let Some(context) = test_context() else {
            return;
        };
        let limit = u64::from(context.device.limits().max_storage_buffer_binding_size);
        let err = create_buffer(
            &context.device,
            "Huge Buffer",
            limit + 4,
            wgpu::BufferUsages::STORAGE,
        )
        .unwrap_err();
        assert!(matches!(err, LayoutError::Allocation { label: "Huge Buffer", .. }));
    }
}
