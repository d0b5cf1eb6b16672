//! WGSL compute shaders for the layout pipeline
//!
//! Every kernel is prefixed with the shared constants and type definitions.
//! Bindings are declared per kernel because the stages touch different
//! buffers; the matching bind group layouts live in `backend.rs` and `sort.rs`.

use crate::config::{
    BRANCHING_FACTOR, FIXED_POINT_SCALE, MORTON_BITS_PER_AXIS, STACK_CAPACITY,
};

use super::types::{MAX_TREE_LEVELS, NO_CHILD};

/// Threads per workgroup of the per-node kernels
pub const NODE_WORKGROUP_SIZE: u32 = 64;

/// Threads per workgroup of the sort kernels, also the number of digit buckets
pub const SORT_WORKGROUP_SIZE: u32 = 256;

/// Rows of keys each sort workgroup handles
pub const SORT_ROWS_PER_BLOCK: u32 = 15;

/// Keys per sort block; sort buffers are padded to a multiple of this
pub const SORT_BLOCK_KEYS: u32 = SORT_WORKGROUP_SIZE * SORT_ROWS_PER_BLOCK;

/// Constants shared with the host code
pub fn constants() -> String {
    format!(
        r#"
const NO_CHILD: u32 = {no_child}u;
const BRANCHING_FACTOR: u32 = {branching}u;
const STACK_CAPACITY: u32 = {stack}u;
const MAX_TREE_LEVELS: u32 = {levels}u;
const FIXED_POINT_SCALE: f32 = {scale:.1};
const GRID_MAX: u32 = {grid}u;
const SORT_WG: u32 = {sort_wg}u;
const SORT_ROWS: u32 = {rows}u;
const SORT_BLOCK_KEYS: u32 = {block}u;
"#,
        no_child = NO_CHILD,
        branching = BRANCHING_FACTOR,
        stack = STACK_CAPACITY,
        levels = MAX_TREE_LEVELS,
        scale = FIXED_POINT_SCALE,
        grid = (1u32 << MORTON_BITS_PER_AXIS) - 1,
        sort_wg = SORT_WORKGROUP_SIZE,
        rows = SORT_ROWS_PER_BLOCK,
        block = SORT_BLOCK_KEYS,
    )
}

/// Common type definitions shared by all shaders
pub const TYPES: &str = r#"
struct Node {
    value: f32,
    x: f32,
    y: f32,
    size: f32,
}

struct AdjacencyEntry {
    source_start: u32,
    source_degree: u32,
    target_start: u32,
    target_degree: u32,
}

struct ClusterNode {
    rect: vec4<f32>,
    children: array<u32, 4>,
    com: vec2<f32>,
    mass: f32,
    _padding: f32,
}

struct TreeHeader {
    node_count: u32,
    total_count: u32,
    level_count: u32,
    root: u32,
    level_start: array<u32, MAX_TREE_LEVELS>,
}

struct Uniforms {
    node_count: u32,
    edge_count: u32,
    cooling_factor: f32,
    ideal_length: f32,
    theta: f32,
    domain_low: f32,
    domain_high: f32,
    _padding: f32,
}

struct LevelUniforms {
    level_start: u32,
    level_count: u32,
    child_start: u32,
    child_count: u32,
}

struct SortUniforms {
    num_keys: u32,
    padded_size: u32,
    num_blocks: u32,
    shift: u32,
}

struct Bounds {
    x_min: i32,
    x_max: i32,
    y_min: i32,
    y_max: i32,
}

struct AtomicBounds {
    x_min: atomic<i32>,
    x_max: atomic<i32>,
    y_min: atomic<i32>,
    y_max: atomic<i32>,
}

fn bounds_rect(b: Bounds) -> vec4<f32> {
    return vec4<f32>(
        f32(b.x_min) / FIXED_POINT_SCALE,
        f32(b.y_min) / FIXED_POINT_SCALE,
        f32(b.x_max) / FIXED_POINT_SCALE,
        f32(b.y_max) / FIXED_POINT_SCALE,
    );
}
"#;

/// Spatial keys: quantise each position inside the bounding box and
/// interleave the grid coordinates. Writes the node index as payload.
pub const MORTON_CODES: &str = r#"
@group(0) @binding(0) var<storage, read> nodes: array<Node>;
@group(0) @binding(1) var<uniform> uniforms: Uniforms;
@group(0) @binding(2) var<storage, read> bounds: Bounds;
@group(0) @binding(3) var<storage, read_write> keys: array<u32>;
@group(0) @binding(4) var<storage, read_write> payload: array<u32>;

fn expand_bits(v: u32) -> u32 {
    var x = v & 0xffffu;
    x = (x | (x << 8u)) & 0x00ff00ffu;
    x = (x | (x << 4u)) & 0x0f0f0f0fu;
    x = (x | (x << 2u)) & 0x33333333u;
    x = (x | (x << 1u)) & 0x55555555u;
    return x;
}

fn quantize(value: f32, lo: f32, hi: f32) -> u32 {
    let extent = max(hi - lo, 1.1920929e-7);
    let t = clamp((value - lo) / extent, 0.0, 1.0);
    return u32(t * f32(GRID_MAX));
}

@compute @workgroup_size(64)
fn morton_codes(@builtin(global_invocation_id) global_id: vec3<u32>) {
    let i = global_id.x;
    if (i >= uniforms.node_count) {
        return;
    }

    let rect = bounds_rect(bounds);
    let node = nodes[i];
    let gx = quantize(node.x, rect.x, rect.z);
    let gy = quantize(node.y, rect.y, rect.w);

    keys[i] = expand_bits(gx) | (expand_bits(gy) << 1u);
    payload[i] = i;
}
"#;

/// One 8-bit pass of the radix sort, split into five entry points.
///
/// Histograms are stored digit-major (`digit * num_blocks + block`) so a
/// single linear exclusive scan yields every block's scatter offset.
pub const RADIX_SORT: &str = r#"
@group(0) @binding(0) var<uniform> params: SortUniforms;
@group(0) @binding(1) var<storage, read_write> histogram: array<u32>;
@group(0) @binding(2) var<storage, read> keys_in: array<u32>;
@group(0) @binding(3) var<storage, read_write> keys_out: array<u32>;
@group(0) @binding(4) var<storage, read> vals_in: array<u32>;
@group(0) @binding(5) var<storage, read_write> vals_out: array<u32>;

var<workgroup> local_histogram: array<atomic<u32>, SORT_WG>;
var<workgroup> partial_sums: array<u32, SORT_WG>;
var<workgroup> digit_offsets: array<u32, SORT_WG>;
var<workgroup> row_digits: array<u32, SORT_WG>;

// Fill the tail of the output buffers so padding sorts last
@compute @workgroup_size(256)
fn pad_keys(@builtin(global_invocation_id) global_id: vec3<u32>) {
    let index = params.num_keys + global_id.x;
    if (index >= params.padded_size) {
        return;
    }
    keys_out[index] = 0xffffffffu;
    vals_out[index] = index;
}

@compute @workgroup_size(256)
fn zero_histograms(@builtin(global_invocation_id) global_id: vec3<u32>) {
    if (global_id.x < SORT_WG * params.num_blocks) {
        histogram[global_id.x] = 0u;
    }
}

@compute @workgroup_size(256)
fn calculate_histogram(
    @builtin(workgroup_id) workgroup_id: vec3<u32>,
    @builtin(local_invocation_id) local_id: vec3<u32>,
) {
    let block = workgroup_id.x;
    let lid = local_id.x;

    atomicStore(&local_histogram[lid], 0u);
    workgroupBarrier();

    let base = block * SORT_BLOCK_KEYS;
    for (var row = 0u; row < SORT_ROWS; row++) {
        let index = base + row * SORT_WG + lid;
        if (index < params.padded_size) {
            let digit = (keys_in[index] >> params.shift) & 0xffu;
            atomicAdd(&local_histogram[digit], 1u);
        }
    }
    workgroupBarrier();

    histogram[lid * params.num_blocks + block] = atomicLoad(&local_histogram[lid]);
}

// Single workgroup: thread d owns digit d's row of block counts
@compute @workgroup_size(256)
fn prefix_histogram(@builtin(local_invocation_id) local_id: vec3<u32>) {
    let digit = local_id.x;
    let row = digit * params.num_blocks;

    var total = 0u;
    for (var b = 0u; b < params.num_blocks; b++) {
        total += histogram[row + b];
    }
    partial_sums[digit] = total;
    workgroupBarrier();

    for (var offset = 1u; offset < SORT_WG; offset = offset << 1u) {
        var value = partial_sums[digit];
        if (digit >= offset) {
            value += partial_sums[digit - offset];
        }
        workgroupBarrier();
        partial_sums[digit] = value;
        workgroupBarrier();
    }

    var running = partial_sums[digit] - total;
    for (var b = 0u; b < params.num_blocks; b++) {
        let count = histogram[row + b];
        histogram[row + b] = running;
        running += count;
    }
}

// Rows are processed in order and ranked within a row by thread index,
// which keeps every pass stable.
@compute @workgroup_size(256)
fn scatter(
    @builtin(workgroup_id) workgroup_id: vec3<u32>,
    @builtin(local_invocation_id) local_id: vec3<u32>,
) {
    let block = workgroup_id.x;
    let lid = local_id.x;

    digit_offsets[lid] = histogram[lid * params.num_blocks + block];
    workgroupBarrier();

    let base = block * SORT_BLOCK_KEYS;
    for (var row = 0u; row < SORT_ROWS; row++) {
        let index = base + row * SORT_WG + lid;
        let key = keys_in[index];
        let digit = (key >> params.shift) & 0xffu;
        row_digits[lid] = digit;
        workgroupBarrier();

        var rank = 0u;
        var last = true;
        for (var j = 0u; j < SORT_WG; j++) {
            if (row_digits[j] == digit) {
                if (j < lid) {
                    rank += 1u;
                } else if (j > lid) {
                    last = false;
                }
            }
        }

        let destination = digit_offsets[digit] + rank;
        keys_out[destination] = key;
        vals_out[destination] = vals_in[index];
        workgroupBarrier();

        if (last) {
            digit_offsets[digit] = destination + 1u;
        }
        workgroupBarrier();
    }
}
"#;

/// Bottom-up tree construction. `build_leaves` runs once, `build_level` once
/// per level with the level parameters bound at a dynamic offset.
pub const BUILD_TREE: &str = r#"
@group(0) @binding(0) var<storage, read> nodes: array<Node>;
@group(0) @binding(1) var<storage, read> payload: array<u32>;
@group(0) @binding(2) var<storage, read> bounds: Bounds;
@group(0) @binding(3) var<storage, read_write> tree: array<ClusterNode>;
@group(0) @binding(4) var<uniform> level: LevelUniforms;
@group(0) @binding(5) var<uniform> uniforms: Uniforms;

@compute @workgroup_size(64)
fn build_leaves(@builtin(global_invocation_id) global_id: vec3<u32>) {
    let i = global_id.x;
    if (i >= uniforms.node_count) {
        return;
    }

    let node = nodes[payload[i]];
    var leaf: ClusterNode;
    leaf.rect = vec4<f32>(node.x, node.y, node.x, node.y);
    leaf.children = array<u32, 4>(NO_CHILD, NO_CHILD, NO_CHILD, NO_CHILD);
    leaf.com = vec2<f32>(node.x, node.y);
    leaf.mass = 1.0;
    leaf._padding = 0.0;
    tree[i] = leaf;
}

@compute @workgroup_size(64)
fn build_level(@builtin(global_invocation_id) global_id: vec3<u32>) {
    let slot = global_id.x;
    if (slot >= level.level_count) {
        return;
    }

    var cluster: ClusterNode;
    // Tight union of the children, not a subdivision of the parent rectangle
    var rect = vec4<f32>(3.4028235e38, 3.4028235e38, -3.4028235e38, -3.4028235e38);
    var weighted = vec2<f32>(0.0, 0.0);
    var mass = 0.0;

    for (var c = 0u; c < BRANCHING_FACTOR; c++) {
        let offset = slot * BRANCHING_FACTOR + c;
        if (offset >= level.child_count) {
            cluster.children[c] = NO_CHILD;
            continue;
        }
        let child_index = level.child_start + offset;
        let child = tree[child_index];
        cluster.children[c] = child_index;
        mass += child.mass;
        weighted += child.mass * child.com;
        rect = vec4<f32>(min(rect.xy, child.rect.xy), max(rect.zw, child.rect.zw));
    }

    if (mass > 0.0) {
        cluster.com = weighted / mass;
    } else {
        cluster.com = vec2<f32>(0.0, 0.0);
    }

    // The root also covers the global bounding box
    if (level.level_count == 1u) {
        let global_rect = bounds_rect(bounds);
        rect = vec4<f32>(min(rect.xy, global_rect.xy), max(rect.zw, global_rect.zw));
    }

    cluster.rect = rect;
    cluster.mass = mass;
    cluster._padding = 0.0;
    tree[level.level_start + slot] = cluster;
}
"#;

/// Attractive pass: pull every node toward each neighbour with magnitude
/// d² / l. Overwrites the force buffer.
pub const ATTRACTIVE_FORCES: &str = r#"
@group(0) @binding(0) var<storage, read> nodes: array<Node>;
@group(0) @binding(1) var<storage, read> adjacency: array<AdjacencyEntry>;
@group(0) @binding(2) var<storage, read> source_list: array<u32>;
@group(0) @binding(3) var<storage, read> target_list: array<u32>;
@group(0) @binding(4) var<storage, read_write> forces: array<vec2<f32>>;
@group(0) @binding(5) var<uniform> uniforms: Uniforms;

fn attraction(p: vec2<f32>, q: vec2<f32>, l: f32) -> vec2<f32> {
    let delta = q - p;
    let d = length(delta);
    if (d > 1e-7) {
        return (d * d / l) * (delta / d);
    }
    return vec2<f32>(0.0, 0.0);
}

@compute @workgroup_size(64)
fn attractive_forces(@builtin(global_invocation_id) global_id: vec3<u32>) {
    let i = global_id.x;
    if (i >= uniforms.node_count) {
        return;
    }

    let l = uniforms.ideal_length;
    let p = vec2<f32>(nodes[i].x, nodes[i].y);
    let entry = adjacency[i];
    var force = vec2<f32>(0.0, 0.0);

    for (var k = 0u; k < entry.source_degree; k++) {
        let other = nodes[source_list[entry.source_start + k]];
        force += attraction(p, vec2<f32>(other.x, other.y), l);
    }
    for (var k = 0u; k < entry.target_degree; k++) {
        let other = nodes[target_list[entry.target_start + k]];
        force += attraction(p, vec2<f32>(other.x, other.y), l);
    }

    forces[i] = force;
}
"#;

/// Repulsive pass: Barnes-Hut traversal with a private fixed-size stack,
/// then combine with the attractive force and clamp to the cooling factor.
pub const REPULSIVE_FORCES: &str = r#"
@group(0) @binding(0) var<storage, read> nodes: array<Node>;
@group(0) @binding(1) var<storage, read_write> forces: array<vec2<f32>>;
@group(0) @binding(2) var<uniform> uniforms: Uniforms;
@group(0) @binding(3) var<storage, read> tree: array<ClusterNode>;
@group(0) @binding(4) var<storage, read> header: TreeHeader;

fn repulsion(p: vec2<f32>, q: vec2<f32>, weight: f32) -> vec2<f32> {
    let delta = p - q;
    let d = length(delta);
    if (d > 0.0) {
        return (weight / d) * (delta / d);
    }
    return vec2<f32>(0.0, 0.0);
}

@compute @workgroup_size(64)
fn repulsive_forces(@builtin(global_invocation_id) global_id: vec3<u32>) {
    let i = global_id.x;
    if (i >= uniforms.node_count) {
        return;
    }

    let p = vec2<f32>(nodes[i].x, nodes[i].y);
    let l2 = uniforms.ideal_length * uniforms.ideal_length;
    var force = vec2<f32>(0.0, 0.0);

    var stack: array<u32, STACK_CAPACITY>;
    stack[0] = header.root;
    var top = 1u;

    loop {
        if (top == 0u) {
            break;
        }
        top -= 1u;
        let index = stack[top];
        if (index >= header.total_count) {
            continue;
        }

        let cluster = tree[index];
        if (index < header.node_count) {
            force += repulsion(p, cluster.com, l2);
            continue;
        }
        if (cluster.mass <= 0.0) {
            continue;
        }

        let d = distance(p, cluster.com);
        let s = 0.5 * max(cluster.rect.z - cluster.rect.x, cluster.rect.w - cluster.rect.y);
        let inside = all(p >= cluster.rect.xy) && all(p <= cluster.rect.zw);

        if (!inside && d > 0.0 && uniforms.theta * d > s) {
            force += repulsion(p, cluster.com, cluster.mass * l2);
        } else {
            for (var c = 0u; c < BRANCHING_FACTOR; c++) {
                let child = tree[index].children[c];
                if (child == NO_CHILD) {
                    continue;
                }
                if (child < header.node_count) {
                    force += repulsion(p, tree[child].com, l2);
                } else if (top < STACK_CAPACITY) {
                    stack[top] = child;
                    top += 1u;
                }
            }
        }
    }

    let net = forces[i] + force;
    let magnitude = length(net);
    if (magnitude > 1e-9) {
        forces[i] = normalize(net) * min(uniforms.cooling_factor, magnitude);
    } else {
        forces[i] = vec2<f32>(0.0, 0.0);
    }
}
"#;

/// Integration: move, clamp into the domain, break ties at the walls, zero
/// the force and fold the position into the bounding box.
pub const INTEGRATE: &str = r#"
@group(0) @binding(0) var<storage, read_write> nodes: array<Node>;
@group(0) @binding(1) var<storage, read_write> forces: array<vec2<f32>>;
@group(0) @binding(2) var<uniform> uniforms: Uniforms;
@group(0) @binding(3) var<storage, read_write> bounds: AtomicBounds;

fn settle(value: f32, offset: f32) -> f32 {
    var x = clamp(value, uniforms.domain_low, uniforms.domain_high);
    if (x == uniforms.domain_high) {
        x -= offset;
    } else if (x == uniforms.domain_low) {
        x += offset;
    }
    return x;
}

@compute @workgroup_size(1)
fn reset_bounds() {
    atomicStore(&bounds.x_min, 2147483647);
    atomicStore(&bounds.x_max, -2147483647 - 1);
    atomicStore(&bounds.y_min, 2147483647);
    atomicStore(&bounds.y_max, -2147483647 - 1);
}

@compute @workgroup_size(64)
fn integrate(@builtin(global_invocation_id) global_id: vec3<u32>) {
    let i = global_id.x;
    if (i >= uniforms.node_count) {
        return;
    }

    let force = forces[i];
    let offset = f32(i) / 500000.0;
    let x = settle(nodes[i].x + force.x, offset);
    let y = settle(nodes[i].y + force.y, offset);

    nodes[i].x = x;
    nodes[i].y = y;
    forces[i] = vec2<f32>(0.0, 0.0);

    atomicMin(&bounds.x_min, i32(floor(x * FIXED_POINT_SCALE)));
    atomicMax(&bounds.x_max, i32(ceil(x * FIXED_POINT_SCALE)));
    atomicMin(&bounds.y_min, i32(floor(y * FIXED_POINT_SCALE)));
    atomicMax(&bounds.y_max, i32(ceil(y * FIXED_POINT_SCALE)));
}
"#;

/// Collection of all layout shader sources
pub struct LayoutShaders {
    pub morton: String,
    pub radix_sort: String,
    pub build_tree: String,
    pub attractive: String,
    pub repulsive: String,
    pub integrate: String,
}

impl LayoutShaders {
    pub fn new() -> Self {
        let prelude = format!("{}\n{}", constants(), TYPES);
        Self {
            morton: format!("{}\n{}", prelude, MORTON_CODES),
            radix_sort: format!("{}\n{}", prelude, RADIX_SORT),
            build_tree: format!("{}\n{}", prelude, BUILD_TREE),
            attractive: format!("{}\n{}", prelude, ATTRACTIVE_FORCES),
            repulsive: format!("{}\n{}", prelude, REPULSIVE_FORCES),
            integrate: format!("{}\n{}", prelude, INTEGRATE),
        }
    }
}

impl Default for LayoutShaders {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_follow_host_values() {
        let text = constants();
        assert!(text.contains("const NO_CHILD: u32 = 4294967295u;"));
        assert!(text.contains("const BRANCHING_FACTOR: u32 = 4u;"));
        assert!(text.contains("const FIXED_POINT_SCALE: f32 = 1000.0;"));
        assert!(text.contains("const GRID_MAX: u32 = 65535u;"));
        assert!(text.contains("const SORT_BLOCK_KEYS: u32 = 3840u;"));
    }

    #[test]
    fn every_shader_has_its_entry_points() {
        let shaders = LayoutShaders::new();
        let expected = [
            (&shaders.morton, vec!["morton_codes"]),
            (
                &shaders.radix_sort,
                vec!["pad_keys", "zero_histograms", "calculate_histogram", "prefix_histogram", "scatter"],
            ),
            (&shaders.build_tree, vec!["build_leaves", "build_level"]),
            (&shaders.attractive, vec!["attractive_forces"]),
            (&shaders.repulsive, vec!["repulsive_forces"]),
            (&shaders.integrate, vec!["reset_bounds", "integrate"]),
        ];
        for (source, entry_points) in expected {
            assert!(source.contains("struct ClusterNode"));
            for entry in entry_points {
                assert!(source.contains(&format!("fn {}(", entry)), "missing {}", entry);
            }
        }
    }
}
