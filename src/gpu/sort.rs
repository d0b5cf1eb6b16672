//! GPU radix sort of 32-bit keys with a 32-bit payload
//!
//! Four stable 8-bit passes ping-pong between buffer A and buffer B, so the
//! sorted result ends up back in A. Buffers are padded to a whole number of
//! sort blocks; the padding carries `u32::MAX` keys and sorts to the tail.

use std::sync::Arc;

use super::device::{
    compute_pipeline, create_buffer, pipeline_layout, read_buffer, storage_entry, uniform_entry,
    uniform_slot, uniform_stride, workgroups,
};
use super::shaders::{LayoutShaders, SORT_BLOCK_KEYS, SORT_WORKGROUP_SIZE};
use super::types::SortUniforms;
use crate::error::{LayoutError, LayoutResult};

/// Number of 8-bit digits in a key
pub const SORT_PASSES: u32 = 4;

/// Keys used by [`RadixSorter::self_test`]
pub const SELF_TEST_KEYS: u32 = 8192;

/// Logical length rounded up to a whole number of sort blocks
pub fn padded_size(n: u32) -> u32 {
    n.div_ceil(SORT_BLOCK_KEYS) * SORT_BLOCK_KEYS
}

/// Double-buffered keys and payload plus histogram scratch space.
///
/// Sized once for a maximum key count and reused by every sort.
pub struct SortBuffers {
    pub keys_a: wgpu::Buffer,
    pub keys_b: wgpu::Buffer,
    pub vals_a: wgpu::Buffer,
    pub vals_b: wgpu::Buffer,
    // Kept alive to maintain GPU resources (referenced by bind_groups)
    _histogram: wgpu::Buffer,
    uniforms: wgpu::Buffer,
    /// `[A -> B, B -> A]`
    bind_groups: [wgpu::BindGroup; 2],
    capacity: u32,
}

impl SortBuffers {
    /// Largest key count these buffers can sort
    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

/// Compute pipelines of the radix sort
pub struct RadixSorter {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,

    bind_group_layout: wgpu::BindGroupLayout,
    pad_pipeline: wgpu::ComputePipeline,
    zero_pipeline: wgpu::ComputePipeline,
    histogram_pipeline: wgpu::ComputePipeline,
    prefix_pipeline: wgpu::ComputePipeline,
    scatter_pipeline: wgpu::ComputePipeline,

    uniform_stride: u64,
}

impl RadixSorter {
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        let shaders = LayoutShaders::new();
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Radix Sort Shader"),
            source: wgpu::ShaderSource::Wgsl(shaders.radix_sort.into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Radix Sort Bind Group Layout"),
            entries: &[
                uniform_entry(0, true),
                storage_entry(1, false),
                storage_entry(2, true),
                storage_entry(3, false),
                storage_entry(4, true),
                storage_entry(5, false),
            ],
        });
        let layout = pipeline_layout(&device, "Radix Sort Pipeline Layout", &bind_group_layout);

        let pad_pipeline = compute_pipeline(&device, "Pad Keys Pipeline", &layout, &module, "pad_keys");
        let zero_pipeline = compute_pipeline(
            &device,
            "Zero Histograms Pipeline",
            &layout,
            &module,
            "zero_histograms",
        );
        let histogram_pipeline = compute_pipeline(
            &device,
            "Histogram Pipeline",
            &layout,
            &module,
            "calculate_histogram",
        );
        let prefix_pipeline = compute_pipeline(
            &device,
            "Prefix Histogram Pipeline",
            &layout,
            &module,
            "prefix_histogram",
        );
        let scatter_pipeline = compute_pipeline(&device, "Scatter Pipeline", &layout, &module, "scatter");

        let uniform_stride = uniform_stride::<SortUniforms>(&device);

        Self {
            device,
            queue,
            bind_group_layout,
            pad_pipeline,
            zero_pipeline,
            histogram_pipeline,
            prefix_pipeline,
            scatter_pipeline,
            uniform_stride,
        }
    }

    /// Allocate buffers able to sort up to `n` keys
    pub fn create_sort_buffers(&self, n: u32) -> LayoutResult<SortBuffers> {
        let padded = padded_size(n.max(1));
        let num_blocks = padded / SORT_BLOCK_KEYS;

        let max_blocks = self.device.limits().max_compute_workgroups_per_dimension;
        if num_blocks > max_blocks {
            return Err(LayoutError::SortCapacity {
                requested: n,
                capacity: max_blocks.saturating_mul(SORT_BLOCK_KEYS),
            });
        }

        let key_bytes = u64::from(padded) * 4;
        let usage = wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_DST
            | wgpu::BufferUsages::COPY_SRC;
        let keys_a = create_buffer(&self.device, "Sort Keys A", key_bytes, usage)?;
        let keys_b = create_buffer(&self.device, "Sort Keys B", key_bytes, usage)?;
        let vals_a = create_buffer(&self.device, "Sort Payload A", key_bytes, usage)?;
        let vals_b = create_buffer(&self.device, "Sort Payload B", key_bytes, usage)?;

        let histogram = create_buffer(
            &self.device,
            "Sort Histogram",
            u64::from(SORT_WORKGROUP_SIZE) * u64::from(num_blocks) * 4,
            wgpu::BufferUsages::STORAGE,
        )?;
        let uniforms = create_buffer(
            &self.device,
            "Sort Uniforms",
            self.uniform_stride * u64::from(SORT_PASSES),
            wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        )?;

        let bind_group = |label,
                          keys_in: &wgpu::Buffer,
                          keys_out: &wgpu::Buffer,
                          vals_in: &wgpu::Buffer,
                          vals_out: &wgpu::Buffer| {
            self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(label),
                layout: &self.bind_group_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: uniform_slot::<SortUniforms>(&uniforms),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: histogram.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: keys_in.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: keys_out.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 4,
                        resource: vals_in.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 5,
                        resource: vals_out.as_entire_binding(),
                    },
                ],
            })
        };
        let forward = bind_group("Sort Bind Group A->B", &keys_a, &keys_b, &vals_a, &vals_b);
        let backward = bind_group("Sort Bind Group B->A", &keys_b, &keys_a, &vals_b, &vals_a);

        Ok(SortBuffers {
            keys_a,
            keys_b,
            vals_a,
            vals_b,
            _histogram: histogram,
            uniforms,
            bind_groups: [forward, backward],
            capacity: padded,
        })
    }

    /// Record a full sort of the first `n` entries of A into `encoder`.
    ///
    /// The pass parameters are written through the queue, so they take effect
    /// with the next submission.
    pub fn encode_sort(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        buffers: &SortBuffers,
        n: u32,
    ) -> LayoutResult<()> {
        if n == 0 {
            return Ok(());
        }
        if n > buffers.capacity {
            return Err(LayoutError::SortCapacity {
                requested: n,
                capacity: buffers.capacity,
            });
        }

        let padded = padded_size(n);
        let num_blocks = padded / SORT_BLOCK_KEYS;

        let stride = self.uniform_stride as usize;
        let mut slots = vec![0u8; stride * SORT_PASSES as usize];
        for pass in 0..SORT_PASSES {
            let uniforms = SortUniforms {
                num_keys: n,
                padded_size: padded,
                num_blocks,
                shift: pass * 8,
            };
            let offset = pass as usize * stride;
            slots[offset..offset + std::mem::size_of::<SortUniforms>()]
                .copy_from_slice(bytemuck::bytes_of(&uniforms));
        }
        self.queue.write_buffer(&buffers.uniforms, 0, &slots);

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("Radix Sort Pass"),
            timestamp_writes: None,
        });

        if padded > n {
            // B -> A group: writes the tail of A
            pass.set_pipeline(&self.pad_pipeline);
            pass.set_bind_group(0, &buffers.bind_groups[1], &[0]);
            pass.dispatch_workgroups(workgroups(padded - n, SORT_WORKGROUP_SIZE), 1, 1);
        }

        for sort_pass in 0..SORT_PASSES {
            let bind_group = &buffers.bind_groups[(sort_pass % 2) as usize];
            let offset = [(u64::from(sort_pass) * self.uniform_stride) as u32];

            pass.set_bind_group(0, bind_group, &offset);

            pass.set_pipeline(&self.zero_pipeline);
            pass.dispatch_workgroups(num_blocks, 1, 1);

            pass.set_pipeline(&self.histogram_pipeline);
            pass.dispatch_workgroups(num_blocks, 1, 1);

            pass.set_pipeline(&self.prefix_pipeline);
            pass.dispatch_workgroups(1, 1, 1);

            pass.set_pipeline(&self.scatter_pipeline);
            pass.dispatch_workgroups(num_blocks, 1, 1);
        }

        Ok(())
    }

    /// Sort the first `n` entries of A in place and submit immediately
    pub fn sort(&self, buffers: &SortBuffers, n: u32) -> LayoutResult<()> {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Radix Sort Encoder"),
            });
        self.encode_sort(&mut encoder, buffers, n)?;
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    /// Upload `keys` with their indices as payload, sort, and read both back
    pub fn sort_keys(&self, keys: &[u32]) -> LayoutResult<(Vec<u32>, Vec<u32>)> {
        let n = keys.len() as u32;
        if n == 0 {
            return Ok((Vec::new(), Vec::new()));
        }

        let buffers = self.create_sort_buffers(n)?;
        let vals: Vec<u32> = (0..n).collect();
        self.queue
            .write_buffer(&buffers.keys_a, 0, bytemuck::cast_slice(keys));
        self.queue
            .write_buffer(&buffers.vals_a, 0, bytemuck::cast_slice(&vals));

        self.sort(&buffers, n)?;

        let sorted = read_buffer(&self.device, &self.queue, &buffers.keys_a, keys.len())?;
        let payload = read_buffer(&self.device, &self.queue, &buffers.vals_a, keys.len())?;
        Ok((sorted, payload))
    }

    /// Sort a reversed key sequence and check the result.
    ///
    /// Returns `Ok(false)` when the device produced a wrong order.
    pub fn self_test(&self) -> LayoutResult<bool> {
        let keys: Vec<u32> = (0..SELF_TEST_KEYS).rev().collect();
        let (sorted, payload) = self.sort_keys(&keys)?;

        let keys_ok = sorted.iter().copied().eq(0..SELF_TEST_KEYS);
        let payload_ok = payload.iter().copied().eq((0..SELF_TEST_KEYS).rev());
        if keys_ok && payload_ok {
            tracing::debug!(keys = SELF_TEST_KEYS, "radix sort self-test passed");
        } else {
            tracing::warn!(keys = SELF_TEST_KEYS, "radix sort self-test produced a wrong order");
        }
        Ok(keys_ok && payload_ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::device::tests::test_context;
    use crate::reference::radix_sort;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn sorter() -> Option<RadixSorter> {
        let context = test_context()?;
        Some(RadixSorter::new(context.device, context.queue))
    }

    #[test]
    fn test_padded_size() {
        assert_eq!(padded_size(0), 0);
        assert_eq!(padded_size(1), SORT_BLOCK_KEYS);
        assert_eq!(padded_size(SORT_BLOCK_KEYS), SORT_BLOCK_KEYS);
        assert_eq!(padded_size(SORT_BLOCK_KEYS + 1), 2 * SORT_BLOCK_KEYS);
    }

    #[test]
    fn test_self_test() {
        let Some(sorter) = sorter() else {
            return;
        };
        assert!(sorter.self_test().unwrap());
    }

    #[test]
    fn test_matches_host_sort() {
        let Some(sorter) = sorter() else {
            return;
        };
        let mut rng = StdRng::seed_from_u64(3);
        // duplicates and keys equal to the padding value
        let mut keys: Vec<u32> = (0..10_000).map(|_| rng.gen_range(0..512)).collect();
        keys[17] = u32::MAX;
        keys[4000] = u32::MAX;

        let (sorted, payload) = sorter.sort_keys(&keys).unwrap();

        let mut expected_keys = keys.clone();
        let mut expected_vals: Vec<u32> = (0..keys.len() as u32).collect();
        radix_sort(&mut expected_keys, &mut expected_vals);

        assert_eq!(sorted, expected_keys);
        assert_eq!(payload, expected_vals);
    }

    #[test]
    fn test_sorted_input_is_unchanged() {
        let Some(sorter) = sorter() else {
            return;
        };
        let keys: Vec<u32> = (0..5000).map(|i| i * 3).collect();
        let (sorted, payload) = sorter.sort_keys(&keys).unwrap();
        assert_eq!(sorted, keys);
        assert!(payload.iter().copied().eq(0..5000));
    }

    #[test]
    fn test_empty_and_oversized() {
        let Some(sorter) = sorter() else {
            return;
        };
        let (sorted, payload) = sorter.sort_keys(&[]).unwrap();
        assert!(sorted.is_empty() && payload.is_empty());

        let buffers = sorter.create_sort_buffers(10).unwrap();
        assert_eq!(buffers.capacity(), SORT_BLOCK_KEYS);
        sorter.sort(&buffers, 0).unwrap();
        let err = sorter.sort(&buffers, SORT_BLOCK_KEYS + 1).unwrap_err();
        assert!(matches!(err, LayoutError::SortCapacity { .. }));
    }
}
