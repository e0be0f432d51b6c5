//! WGSL sources for the registry kernels
//!
//! Every kernel compiles to its own module. The uniform struct and the buffer
//! bindings are generated from the kernel's contract in [`Kernel::bindings`]
//! and [`Kernel::uniform_block`]; only the entry point body is written by
//! hand. Bodies follow the host kernels in `compute::kernels` operation for
//! operation.
//!
//! Each invocation handles element `work_group_offset + global_id.x`.
//! Invocations past the end of a chunk recompute elements of the following
//! chunk, which yields identical values.

use crate::compute::{Access, Kernel};

/// Invocations per workgroup of every kernel
pub const WORKGROUP_SIZE: u32 = 64;

const COMMON: &str = r#"
fn hash(v: u32) -> u32 {
    var x = v;
    x ^= x >> 16u;
    x *= 0x7feb352du;
    x ^= x >> 15u;
    x *= 0x846ca68bu;
    x ^= x >> 16u;
    return x;
}

fn jitter(seed: u32, element: u32, axis: u32) -> f32 {
    let h = hash(seed ^ hash(element * 3u + axis));
    return f32(h) / 4294967295.0 - 0.5;
}

fn falloff(d: f32, radius: f32) -> f32 {
    if (radius <= 0.0 || d >= radius) {
        return 0.0;
    }
    let q = d / radius;
    let t = 1.0 - q * q;
    return t * t;
}
"#;

const GRID: &str = r#"
fn grid_dims() -> vec3<u32> {
    return vec3<u32>(params.grid_x, params.grid_y, params.grid_z);
}

fn grid_origin() -> vec3<f32> {
    return vec3<f32>(params.origin_x, params.origin_y, params.origin_z);
}

fn cell_index(c: vec3<u32>) -> u32 {
    return c.x + params.grid_x * (c.y + params.grid_y * c.z);
}

fn cell_coords(i: u32) -> vec3<u32> {
    return vec3<u32>(i % params.grid_x, (i / params.grid_x) % params.grid_y, i / (params.grid_x * params.grid_y));
}

// -1 outside the grid
fn cell_of(p: vec3<f32>) -> i32 {
    let t = floor((p - grid_origin()) / params.cell_size);
    let d = vec3<f32>(grid_dims());
    if (!all(t >= vec3<f32>(0.0)) || !all(t < d)) {
        return -1;
    }
    return i32(cell_index(vec3<u32>(t)));
}
"#;

const ADVECT: &str = r#"
fn advect_step(p: vec3<f32>) -> vec2<f32> {
    let c = cell_of(p);
    if (c < 0) {
        return vec2<f32>(0.0);
    }
    let o = u32(c) * 4u;
    let scale = -params.advect_strength * params.direction;
    var delta = vec2<f32>(gradient[o], gradient[o + 1u]) * scale;
    let len = length(delta);
    if (!(len < 3.0e38)) {
        return vec2<f32>(0.0);
    }
    if (len > params.max_step && len > 0.0) {
        delta *= params.max_step / len;
    }
    return delta;
}
"#;

const SAMPLES_IN: &str = r#"
fn live_count(edge: u32) -> u32 {
    let w = samples_in[edge * params.max_sample_points * 4u + 3u];
    if (!(w > 0.0 && w < 3.0e38)) {
        return 0u;
    }
    return min(u32(w), params.max_sample_points);
}

fn sample_point(edge: u32, i: u32) -> vec3<f32> {
    let o = (edge * params.max_sample_points + i) * 4u;
    return vec3<f32>(samples_in[o], samples_in[o + 1u], samples_in[o + 2u]);
}
"#;

const SAMPLES_OUT: &str = r#"
fn clear_slot(edge: u32) {
    let base = edge * params.max_sample_points * 4u;
    for (var k = 0u; k < params.max_sample_points * 4u; k++) {
        samples_out[base + k] = 0.0;
    }
}

fn write_point(edge: u32, i: u32, p: vec3<f32>, w: f32) {
    let o = (edge * params.max_sample_points + i) * 4u;
    samples_out[o] = p.x;
    samples_out[o + 1u] = p.y;
    samples_out[o + 2u] = p.z;
    samples_out[o + 3u] = w;
}
"#;

const COPY_SLOT: &str = r#"
fn copy_slot(slot: u32) {
    let o = slot * 4u;
    for (var k = 0u; k < 4u; k++) {
        samples_out[o + k] = samples_in[o + k];
    }
}
"#;

const NODE_NOISE: &str = r#"
@compute @workgroup_size(64)
fn node_noise(@builtin(global_invocation_id) gid: vec3<u32>) {
    let i = params.work_group_offset + gid.x;
    if (i >= params.element_count) {
        return;
    }
    let r = i * params.node_stride;
    for (var k = 0u; k < params.node_stride; k++) {
        nodes_out[r + k] = nodes_in[r + k];
    }
    let scale = params.sample_length * params.strength;
    nodes_out[r] += jitter(params.seed, i, 0u) * scale;
    nodes_out[r + 1u] += jitter(params.seed, i, 1u) * scale;
}
"#;

const NODE_DENSITY: &str = r#"
@compute @workgroup_size(64)
fn node_density(@builtin(global_invocation_id) gid: vec3<u32>) {
    let c = params.work_group_offset + gid.x;
    if (c >= params.element_count) {
        return;
    }
    let o = c * 4u;
    let p = vec3<f32>(cell_positions[o], cell_positions[o + 1u], cell_positions[o + 2u]);
    for (var i = params.node_offset; i < params.node_offset + params.node_count; i++) {
        let r = i * params.node_stride;
        let w = nodes_in[r + 3u];
        let q = vec3<f32>(nodes_in[r], nodes_in[r + 1u], nodes_in[r + 2u]);
        density[o] += w * falloff(distance(p, q), params.radius);
    }
}
"#;

const NODE_ADVECT: &str = r#"
@compute @workgroup_size(64)
fn node_advect(@builtin(global_invocation_id) gid: vec3<u32>) {
    let i = params.work_group_offset + gid.x;
    if (i >= params.element_count) {
        return;
    }
    let r = i * params.node_stride;
    for (var k = 0u; k < params.node_stride; k++) {
        nodes_out[r + k] = nodes_in[r + k];
    }
    if (i < params.node_offset || i >= params.node_offset + params.node_count) {
        return;
    }
    let delta = advect_step(vec3<f32>(nodes_in[r], nodes_in[r + 1u], nodes_in[r + 2u]));
    nodes_out[r] += delta.x;
    nodes_out[r + 1u] += delta.y;
}
"#;

const GRID_CLEAR: &str = r#"
@compute @workgroup_size(64)
fn grid_clear(@builtin(global_invocation_id) gid: vec3<u32>) {
    let c = params.work_group_offset + gid.x;
    if (c >= params.element_count) {
        return;
    }
    for (var k = 0u; k < 4u; k++) {
        density[c * 4u + k] = 0.0;
    }
}
"#;

const GRID_POSITION: &str = r#"
@compute @workgroup_size(64)
fn grid_position(@builtin(global_invocation_id) gid: vec3<u32>) {
    let c = params.work_group_offset + gid.x;
    if (c >= params.element_count) {
        return;
    }
    let center = grid_origin() + (vec3<f32>(cell_coords(c)) + vec3<f32>(0.5)) * params.cell_size;
    let o = c * 4u;
    cell_positions[o] = center.x;
    cell_positions[o + 1u] = center.y;
    cell_positions[o + 2u] = center.z;
    cell_positions[o + 3u] = 0.0;
}
"#;

const GRID_GRADIENT: &str = r#"
@compute @workgroup_size(64)
fn grid_gradient(@builtin(global_invocation_id) gid: vec3<u32>) {
    let c = params.work_group_offset + gid.x;
    if (c >= params.element_count) {
        return;
    }
    let coords = cell_coords(c);
    let dims = grid_dims();
    var g = vec3<f32>(0.0);
    for (var axis = 0u; axis < 3u; axis++) {
        let lo = select(coords[axis] - 1u, 0u, coords[axis] == 0u);
        let hi = min(coords[axis] + 1u, max(dims[axis], 1u) - 1u);
        if (hi > lo) {
            var a = coords;
            var b = coords;
            a[axis] = lo;
            b[axis] = hi;
            let d_lo = density_in[cell_index(a) * 4u];
            let d_hi = density_in[cell_index(b) * 4u];
            g[axis] = (d_hi - d_lo) / (f32(hi - lo) * params.cell_size);
        }
    }
    let o = c * 4u;
    gradient[o] = g.x;
    gradient[o + 1u] = g.y;
    gradient[o + 2u] = g.z;
    gradient[o + 3u] = 0.0;
}
"#;

const INIT_SAMPLE_EDGES: &str = r#"
@compute @workgroup_size(64)
fn init_sample_edges(@builtin(global_invocation_id) gid: vec3<u32>) {
    let e = params.work_group_offset + gid.x;
    if (e >= params.element_count) {
        return;
    }
    let r = e * params.meta_stride;
    let a = vec3<f32>(metadata[r + 4u], metadata[r + 5u], metadata[r + 6u]);
    let b = vec3<f32>(metadata[r + 8u], metadata[r + 9u], metadata[r + 10u]);
    let total = distance(a, b);
    let wanted = max(ceil(total / params.sample_length - 1e-4), 1.0);
    let segments = u32(min(wanted, f32(params.max_sample_points - 1u)));

    clear_slot(e);
    write_point(e, 0u, a, f32(segments + 1u));
    for (var k = 1u; k < segments; k++) {
        let t = total * f32(k) / f32(segments);
        var f = 0.0;
        if (total > 0.0) {
            f = clamp(t / total, 0.0, 1.0);
        }
        write_point(e, k, a + (b - a) * f, 1.0);
    }
    write_point(e, segments, b, 1.0);
}
"#;

const SAMPLE_EDGES: &str = r#"
@compute @workgroup_size(64)
fn sample_edges(@builtin(global_invocation_id) gid: vec3<u32>) {
    let e = params.work_group_offset + gid.x;
    if (e >= params.element_count) {
        return;
    }
    let max_points = params.max_sample_points;
    let n = live_count(e);
    if (n < 2u) {
        for (var k = 0u; k < max_points; k++) {
            copy_slot(e * max_points + k);
        }
        return;
    }
    var total = 0.0;
    for (var i = 1u; i < n; i++) {
        total += distance(sample_point(e, i - 1u), sample_point(e, i));
    }
    let wanted = max(ceil(total / params.sample_length - 1e-4), 1.0);
    let segments = u32(min(wanted, f32(max_points - 1u)));

    clear_slot(e);
    write_point(e, 0u, sample_point(e, 0u), f32(segments + 1u));
    var j = 0u;
    var cum_j = 0.0;
    var cum_next = distance(sample_point(e, 0u), sample_point(e, 1u));
    for (var k = 1u; k < segments; k++) {
        let t = total * f32(k) / f32(segments);
        while (j + 2u < n && cum_next < t) {
            j += 1u;
            cum_j = cum_next;
            cum_next += distance(sample_point(e, j), sample_point(e, j + 1u));
        }
        let span = cum_next - cum_j;
        var f = 0.0;
        if (span > 0.0) {
            f = clamp((t - cum_j) / span, 0.0, 1.0);
        }
        let a = sample_point(e, j);
        let b = sample_point(e, j + 1u);
        write_point(e, k, a + (b - a) * f, 1.0);
    }
    write_point(e, segments, sample_point(e, n - 1u), 1.0);
}
"#;

const SAMPLE_NOISE: &str = r#"
@compute @workgroup_size(64)
fn sample_noise(@builtin(global_invocation_id) gid: vec3<u32>) {
    let slot = params.work_group_offset + gid.x;
    if (slot >= params.element_count) {
        return;
    }
    copy_slot(slot);
    let edge = slot / params.max_sample_points;
    let i = slot % params.max_sample_points;
    let live = live_count(edge);
    if (i >= live) {
        return;
    }
    var axes = 3u;
    if (i == 0u || i + 1u == live) {
        axes = select(0u, 2u, params.move_start_end != 0u);
    }
    for (var axis = 0u; axis < axes; axis++) {
        samples_out[slot * 4u + axis] += jitter(params.seed, slot, axis) * params.strength;
    }
}
"#;

const SAMPLE_SMOOTH: &str = r#"
@compute @workgroup_size(64)
fn sample_smooth(@builtin(global_invocation_id) gid: vec3<u32>) {
    let slot = params.work_group_offset + gid.x;
    if (slot >= params.element_count) {
        return;
    }
    copy_slot(slot);
    let edge = slot / params.max_sample_points;
    let i = slot % params.max_sample_points;
    let live = live_count(edge);
    if (i == 0u || i + 1u >= live || params.radius <= 0.0) {
        return;
    }
    let p = sample_point(edge, i);
    var sum = vec3<f32>(0.0);
    var weight_sum = 0.0;
    for (var j = 0u; j < live; j++) {
        let q = sample_point(edge, j);
        let d = distance(p, q);
        if (d < params.radius) {
            let w = 1.0 - d / params.radius;
            sum += q * w;
            weight_sum += w;
        }
    }
    if (weight_sum > 0.0) {
        let s = sum / weight_sum;
        samples_out[slot * 4u] = s.x;
        samples_out[slot * 4u + 1u] = s.y;
        samples_out[slot * 4u + 2u] = s.z;
    }
}
"#;

const SAMPLE_DENSITY: &str = r#"
@compute @workgroup_size(64)
fn sample_density(@builtin(global_invocation_id) gid: vec3<u32>) {
    let c = params.work_group_offset + gid.x;
    if (c >= params.element_count) {
        return;
    }
    let o = c * 4u;
    let p = vec3<f32>(cell_positions[o], cell_positions[o + 1u], cell_positions[o + 2u]);
    for (var e = 0u; e < params.edge_count; e++) {
        let w = metadata[e * params.meta_stride + 2u];
        if (w == 0.0) {
            continue;
        }
        let live = live_count(e);
        for (var i = 0u; i < live; i++) {
            density[o] += w * falloff(distance(p, sample_point(e, i)), params.radius);
        }
    }
}
"#;

const SAMPLE_ADVECT: &str = r#"
@compute @workgroup_size(64)
fn sample_advect(@builtin(global_invocation_id) gid: vec3<u32>) {
    let slot = params.work_group_offset + gid.x;
    if (slot >= params.element_count) {
        return;
    }
    copy_slot(slot);
    let edge = slot / params.max_sample_points;
    let i = slot % params.max_sample_points;
    let live = live_count(edge);
    if (i == 0u || i + 1u >= live) {
        return;
    }
    let delta = advect_step(sample_point(edge, i));
    samples_out[slot * 4u] += delta.x;
    samples_out[slot * 4u + 1u] += delta.y;
}
"#;

const CHECK_LIMITS: &str = r#"
@compute @workgroup_size(64)
fn check_limits(@builtin(global_invocation_id) gid: vec3<u32>) {
    let e = params.work_group_offset + gid.x;
    if (e >= params.element_count) {
        return;
    }
    let live = live_count(e);
    var z_min = 0.0;
    var z_max = 0.0;
    for (var i = 0u; i < live; i++) {
        let z = sample_point(e, i).z;
        if (i == 0u) {
            z_min = z;
            z_max = z;
        } else {
            z_min = min(z_min, z);
            z_max = max(z_max, z);
        }
    }
    let o = e * 4u;
    limits[o] = f32(live);
    limits[o + 1u] = z_min;
    limits[o + 2u] = z_max;
    limits[o + 3u] = 0.0;
}
"#;

fn body(kernel: Kernel) -> &'static str {
    match kernel {
        Kernel::NodeNoise => NODE_NOISE,
        Kernel::NodeDensity => NODE_DENSITY,
        Kernel::NodeAdvect => NODE_ADVECT,
        Kernel::GridClear => GRID_CLEAR,
        Kernel::GridPosition => GRID_POSITION,
        Kernel::GridGradient => GRID_GRADIENT,
        Kernel::InitSampleEdges => INIT_SAMPLE_EDGES,
        Kernel::SampleEdges => SAMPLE_EDGES,
        Kernel::SampleNoise => SAMPLE_NOISE,
        Kernel::SampleSmooth => SAMPLE_SMOOTH,
        Kernel::SampleDensity => SAMPLE_DENSITY,
        Kernel::SampleAdvect => SAMPLE_ADVECT,
        Kernel::CheckLimits => CHECK_LIMITS,
    }
}

fn binds(kernel: Kernel, name: &str) -> bool {
    kernel.bindings().iter().any(|b| b.name == name)
}

fn has_uniform(kernel: Kernel, key: &str) -> bool {
    kernel.uniform_block().any(|u| u.key == key)
}

/// `Params` struct in contract order, padded to 16 bytes
fn params_struct(kernel: Kernel) -> String {
    let mut fields: Vec<String> = kernel
        .uniform_block()
        .map(|spec| format!("    {}: {},", spec.key, spec.kind.wgsl()))
        .collect();
    let mut pad = 0;
    while fields.len() % 4 != 0 {
        fields.push(format!("    _pad{pad}: u32,"));
        pad += 1;
    }
    format!("struct Params {{\n{}\n}}\n", fields.join("\n"))
}

fn binding_decls(kernel: Kernel) -> String {
    let mut decls = String::new();
    for (index, binding) in kernel.bindings().iter().enumerate() {
        let access = match binding.access {
            Access::Read => "read",
            Access::Write => "read_write",
        };
        decls.push_str(&format!(
            "@group(0) @binding({index}) var<storage, {access}> {}: array<f32>;\n",
            binding.name
        ));
    }
    decls.push_str(&format!(
        "@group(0) @binding({}) var<uniform> params: Params;\n",
        kernel.bindings().len()
    ));
    decls
}

/// Complete WGSL module of `kernel`; the entry point is [`Kernel::name`]
pub fn source(kernel: Kernel) -> String {
    let mut src = params_struct(kernel);
    src.push_str(&binding_decls(kernel));
    src.push_str(COMMON);
    if has_uniform(kernel, "grid_x") {
        src.push_str(GRID);
    }
    if binds(kernel, "gradient") && has_uniform(kernel, "advect_strength") {
        src.push_str(ADVECT);
    }
    if binds(kernel, "samples_in") {
        src.push_str(SAMPLES_IN);
    }
    if binds(kernel, "samples_out") {
        src.push_str(SAMPLES_OUT);
    }
    if binds(kernel, "samples_in") && binds(kernel, "samples_out") {
        src.push_str(COPY_SLOT);
    }
    src.push_str(body(kernel));
    src
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kernel_declares_its_entry_point() {
        for kernel in Kernel::ALL {
            let src = source(kernel);
            assert!(src.contains(&format!("fn {}(", kernel.name())), "{kernel}");
            assert!(src.contains(&format!("@workgroup_size({WORKGROUP_SIZE})")), "{kernel}");
        }
    }

    #[test]
    fn bindings_follow_the_contract() {
        let src = source(Kernel::SampleDensity);
        assert!(src.contains("@binding(0) var<storage, read> cell_positions"));
        assert!(src.contains("@binding(2) var<storage, read> metadata"));
        assert!(src.contains("@binding(3) var<storage, read_write> density"));
        assert!(src.contains("@binding(4) var<uniform> params"));
    }

    #[test]
    fn params_are_padded_to_whole_vectors() {
        // work_group_offset, element_count, max_sample_points, sample_length
        let src = params_struct(Kernel::SampleEdges);
        assert!(!src.contains("_pad"));
        // two common uniforms and one own
        let src = params_struct(Kernel::CheckLimits);
        assert!(src.contains("_pad0: u32"));
        assert!(!src.contains("_pad1"));
    }

    #[test]
    fn helpers_are_included_only_where_bound() {
        assert!(!source(Kernel::NodeNoise).contains("fn live_count"));
        assert!(source(Kernel::CheckLimits).contains("fn live_count"));
        assert!(!source(Kernel::CheckLimits).contains("fn copy_slot"));
        assert!(source(Kernel::SampleAdvect).contains("fn advect_step"));
        assert!(!source(Kernel::GridGradient).contains("fn advect_step"));
    }
}
