//! Host implementations of the registry kernels
//!
//! Each function processes the element range of one dispatch chunk and
//! writes only the elements of that range. Inputs arrive in binding order
//! (read bindings only); the output is the kernel's single write binding.

use std::ops::Range;

use super::kernel::{GridSpec, Kernel, Uniforms};
use crate::error::{BundleError, Result};
use crate::model::distance;
use crate::types::{CELL_FLOATS, EdgeRecordLayout, LIMIT_FLOATS, POINT_FLOATS};

/// Run one chunk of `kernel` on host memory
pub fn run(
    kernel: Kernel,
    inputs: &[&[f32]],
    out: &mut [f32],
    uniforms: &Uniforms,
    range: Range<usize>,
) -> Result<()> {
    let total = uniforms.get_uint(kernel, "element_count")? as usize;
    let range = range.start.min(total)..range.end.min(total);
    match kernel {
        Kernel::NodeNoise => node_noise(kernel, inputs[0], out, uniforms, range, total),
        Kernel::NodeDensity => node_density(kernel, inputs[0], inputs[1], out, uniforms, range),
        Kernel::NodeAdvect => {
            node_advect(kernel, inputs[0], inputs[1], out, uniforms, range, total)
        }
        Kernel::GridClear => {
            require(kernel, "density", out, total * CELL_FLOATS)?;
            out[range.start * CELL_FLOATS..range.end * CELL_FLOATS].fill(0.0);
            Ok(())
        }
        Kernel::GridPosition => grid_position(kernel, out, uniforms, range, total),
        Kernel::GridGradient => grid_gradient(kernel, inputs[0], out, uniforms, range, total),
        Kernel::InitSampleEdges => {
            init_sample_edges(kernel, inputs[0], out, uniforms, range, total)
        }
        Kernel::SampleEdges => sample_edges(kernel, inputs[0], out, uniforms, range, total),
        Kernel::SampleNoise => sample_noise(kernel, inputs[0], out, uniforms, range, total),
        Kernel::SampleSmooth => sample_smooth(kernel, inputs[0], out, uniforms, range, total),
        Kernel::SampleDensity => {
            sample_density(kernel, inputs[0], inputs[1], inputs[2], out, uniforms, range)
        }
        Kernel::SampleAdvect => {
            sample_advect(kernel, inputs[0], inputs[1], out, uniforms, range, total)
        }
        Kernel::CheckLimits => check_limits(kernel, inputs[0], out, uniforms, range, total),
    }
}

fn require_cells(kernel: Kernel, grid: &GridSpec, total: usize) -> Result<()> {
    if total > grid.cell_count() {
        return Err(BundleError::BindingContract {
            kernel: kernel.name(),
            problem: format!("{total} elements over a grid of {} cells", grid.cell_count()),
        });
    }
    Ok(())
}

fn require(kernel: Kernel, name: &str, buffer: &[f32], needed: usize) -> Result<()> {
    if buffer.len() < needed {
        return Err(BundleError::BindingContract {
            kernel: kernel.name(),
            problem: format!("buffer '{name}' holds {} floats, needs {needed}", buffer.len()),
        });
    }
    Ok(())
}

/// Integer hash (lowbias32), identical to the WGSL `hash` helper
pub fn hash(mut x: u32) -> u32 {
    x ^= x >> 16;
    x = x.wrapping_mul(0x7feb_352d);
    x ^= x >> 15;
    x = x.wrapping_mul(0x846c_a68b);
    x ^= x >> 16;
    x
}

/// Deterministic jitter in `[-0.5, 0.5]` for an element and axis
pub fn jitter(seed: u32, element: u32, axis: u32) -> f32 {
    let h = hash(seed ^ hash(element.wrapping_mul(3).wrapping_add(axis)));
    h as f32 / u32::MAX as f32 - 0.5
}

/// Density falloff `(1 - (d / r)^2)^2` inside the radius, zero outside
pub fn falloff(d: f32, radius: f32) -> f32 {
    if radius <= 0.0 || d >= radius {
        return 0.0;
    }
    let q = d / radius;
    let t = 1.0 - q * q;
    t * t
}

/// Live point count stored in the header of `edge`, clamped to the capacity
pub fn live_count(samples: &[f32], edge: usize, max_points: usize) -> usize {
    let w = samples[edge * max_points * POINT_FLOATS + 3];
    if w.is_finite() && w > 0.0 {
        (w as usize).min(max_points)
    } else {
        0
    }
}

fn position(buffer: &[f32], offset: usize) -> [f32; 3] {
    [buffer[offset], buffer[offset + 1], buffer[offset + 2]]
}

/// Resample a polyline at uniform arc-length spacing of about
/// `sample_length`, keeping both endpoints and at most `max_points` points
pub fn resample_polyline(
    points: &[[f32; 3]],
    sample_length: f32,
    max_points: usize,
) -> Vec<[f32; 3]> {
    let n = points.len();
    if n < 2 || max_points < 2 {
        return points.iter().take(max_points).copied().collect();
    }
    let mut cumulative = vec![0.0f32; n];
    for i in 1..n {
        cumulative[i] = cumulative[i - 1] + distance(points[i - 1], points[i]);
    }
    let total = cumulative[n - 1];
    let wanted = (total / sample_length - 1e-4).ceil().max(1.0) as usize;
    let segments = wanted.min(max_points - 1);

    let mut resampled = Vec::with_capacity(segments + 1);
    resampled.push(points[0]);
    let mut j = 0;
    for k in 1..segments {
        let t = total * k as f32 / segments as f32;
        while j + 2 < n && cumulative[j + 1] < t {
            j += 1;
        }
        let span = cumulative[j + 1] - cumulative[j];
        let f = if span > 0.0 {
            ((t - cumulative[j]) / span).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let (a, b) = (points[j], points[j + 1]);
        resampled.push([
            a[0] + (b[0] - a[0]) * f,
            a[1] + (b[1] - a[1]) * f,
            a[2] + (b[2] - a[2]) * f,
        ]);
    }
    resampled.push(points[n - 1]);
    resampled
}

/// Write a polyline into an edge slot: header count, live flags, zero padding
fn write_slot(out: &mut [f32], edge: usize, max_points: usize, points: &[[f32; 3]]) {
    let base = edge * max_points * POINT_FLOATS;
    let slot = &mut out[base..base + max_points * POINT_FLOATS];
    slot.fill(0.0);
    let live = points.len().min(max_points);
    for (k, p) in points.iter().take(live).enumerate() {
        let o = k * POINT_FLOATS;
        slot[o..o + 3].copy_from_slice(p);
        slot[o + 3] = if k == 0 { live as f32 } else { 1.0 };
    }
}

fn read_polyline(samples: &[f32], edge: usize, max_points: usize) -> Vec<[f32; 3]> {
    let base = edge * max_points * POINT_FLOATS;
    (0..live_count(samples, edge, max_points))
        .map(|i| position(samples, base + i * POINT_FLOATS))
        .collect()
}

fn copy_slot(input: &[f32], out: &mut [f32], slot: usize) {
    let o = slot * POINT_FLOATS;
    out[o..o + POINT_FLOATS].copy_from_slice(&input[o..o + POINT_FLOATS]);
}

fn node_noise(
    kernel: Kernel,
    nodes: &[f32],
    out: &mut [f32],
    uniforms: &Uniforms,
    range: Range<usize>,
    total: usize,
) -> Result<()> {
    let stride = uniforms.get_uint(kernel, "node_stride")? as usize;
    let seed = uniforms.get_uint(kernel, "seed")?;
    let scale =
        uniforms.get_float(kernel, "sample_length")? * uniforms.get_float(kernel, "strength")?;
    require(kernel, "nodes_in", nodes, total * stride)?;
    require(kernel, "nodes_out", out, total * stride)?;

    for i in range {
        let r = i * stride;
        out[r..r + stride].copy_from_slice(&nodes[r..r + stride]);
        out[r] += jitter(seed, i as u32, 0) * scale;
        out[r + 1] += jitter(seed, i as u32, 1) * scale;
    }
    Ok(())
}

/// Add a weighted falloff splat centered at `p` to every cell of `range`
/// within `radius`
fn splat(
    grid: &GridSpec,
    positions: &[f32],
    out: &mut [f32],
    range: &Range<usize>,
    p: [f32; 3],
    weight: f32,
    radius: f32,
) {
    if weight == 0.0 || radius <= 0.0 {
        return;
    }
    let mut lo = [0usize; 3];
    let mut hi = [0usize; 3];
    for axis in 0..3 {
        let a = ((p[axis] - radius - grid.origin[axis]) / grid.cell_size).floor();
        let b = ((p[axis] + radius - grid.origin[axis]) / grid.cell_size).floor();
        let last = grid.dims[axis] as f32 - 1.0;
        if !(b >= 0.0 && a <= last) {
            return;
        }
        lo[axis] = a.max(0.0) as usize;
        hi[axis] = b.min(last) as usize;
    }
    for z in lo[2]..=hi[2] {
        for y in lo[1]..=hi[1] {
            for x in lo[0]..=hi[0] {
                let c = grid.index([x, y, z]);
                if !range.contains(&c) {
                    continue;
                }
                let d = distance(p, position(positions, c * CELL_FLOATS));
                out[c * CELL_FLOATS] += weight * falloff(d, radius);
            }
        }
    }
}

fn node_density(
    kernel: Kernel,
    positions: &[f32],
    nodes: &[f32],
    out: &mut [f32],
    uniforms: &Uniforms,
    range: Range<usize>,
) -> Result<()> {
    let grid = GridSpec::from_uniforms(kernel, uniforms)?;
    let stride = uniforms.get_uint(kernel, "node_stride")? as usize;
    let offset = uniforms.get_uint(kernel, "node_offset")? as usize;
    let count = uniforms.get_uint(kernel, "node_count")? as usize;
    let radius = uniforms.get_float(kernel, "radius")?;
    let cells = grid.cell_count();
    require(kernel, "cell_positions", positions, cells * CELL_FLOATS)?;
    require(kernel, "density", out, cells * CELL_FLOATS)?;
    require(kernel, "nodes_in", nodes, (offset + count) * stride)?;

    for i in offset..offset + count {
        let r = i * stride;
        let weight = nodes[r + 3];
        splat(&grid, positions, out, &range, position(nodes, r), weight, radius);
    }
    Ok(())
}

/// Step along the negative density gradient in the x/y plane, clamped to
/// `max_step`
fn advect_step(
    grid: &GridSpec,
    gradient: &[f32],
    p: [f32; 3],
    strength: f32,
    direction: f32,
    max_step: f32,
) -> [f32; 2] {
    let Some(cell) = grid.cell_of(p) else {
        return [0.0, 0.0];
    };
    let c = grid.index(cell) * CELL_FLOATS;
    let scale = -strength * direction;
    let mut step = [gradient[c] * scale, gradient[c + 1] * scale];
    let length = (step[0] * step[0] + step[1] * step[1]).sqrt();
    if !length.is_finite() {
        return [0.0, 0.0];
    }
    if length > max_step && length > 0.0 {
        let k = max_step / length;
        step = [step[0] * k, step[1] * k];
    }
    step
}

fn node_advect(
    kernel: Kernel,
    nodes: &[f32],
    gradient: &[f32],
    out: &mut [f32],
    uniforms: &Uniforms,
    range: Range<usize>,
    total: usize,
) -> Result<()> {
    let grid = GridSpec::from_uniforms(kernel, uniforms)?;
    let stride = uniforms.get_uint(kernel, "node_stride")? as usize;
    let offset = uniforms.get_uint(kernel, "node_offset")? as usize;
    let count = uniforms.get_uint(kernel, "node_count")? as usize;
    let strength = uniforms.get_float(kernel, "advect_strength")?;
    let direction = uniforms.get_float(kernel, "direction")?;
    let max_step = uniforms.get_float(kernel, "max_step")?;
    require(kernel, "nodes_in", nodes, total * stride)?;
    require(kernel, "nodes_out", out, total * stride)?;
    require(kernel, "gradient", gradient, grid.cell_count() * CELL_FLOATS)?;

    let active = offset..offset + count;
    for i in range {
        let r = i * stride;
        out[r..r + stride].copy_from_slice(&nodes[r..r + stride]);
        if active.contains(&i) {
            let p = position(nodes, r);
            let step = advect_step(&grid, gradient, p, strength, direction, max_step);
            out[r] += step[0];
            out[r + 1] += step[1];
        }
    }
    Ok(())
}

fn grid_position(
    kernel: Kernel,
    out: &mut [f32],
    uniforms: &Uniforms,
    range: Range<usize>,
    total: usize,
) -> Result<()> {
    let grid = GridSpec::from_uniforms(kernel, uniforms)?;
    require_cells(kernel, &grid, total)?;
    require(kernel, "cell_positions", out, grid.cell_count() * CELL_FLOATS)?;
    for c in range {
        let coords = grid.coords(c);
        let o = c * CELL_FLOATS;
        for axis in 0..3 {
            out[o + axis] = grid.origin[axis] + (coords[axis] as f32 + 0.5) * grid.cell_size;
        }
        out[o + 3] = 0.0;
    }
    Ok(())
}

fn grid_gradient(
    kernel: Kernel,
    density: &[f32],
    out: &mut [f32],
    uniforms: &Uniforms,
    range: Range<usize>,
    total: usize,
) -> Result<()> {
    let grid = GridSpec::from_uniforms(kernel, uniforms)?;
    require_cells(kernel, &grid, total)?;
    let cells = grid.cell_count();
    require(kernel, "density_in", density, cells * CELL_FLOATS)?;
    require(kernel, "gradient", out, cells * CELL_FLOATS)?;

    for c in range {
        let coords = grid.coords(c);
        let o = c * CELL_FLOATS;
        for axis in 0..3 {
            let dim = grid.dims[axis] as usize;
            let lo = coords[axis].saturating_sub(1);
            let hi = (coords[axis] + 1).min(dim.saturating_sub(1));
            out[o + axis] = if hi > lo {
                let mut a = coords;
                let mut b = coords;
                a[axis] = lo;
                b[axis] = hi;
                let d_lo = density[grid.index(a) * CELL_FLOATS];
                let d_hi = density[grid.index(b) * CELL_FLOATS];
                (d_hi - d_lo) / ((hi - lo) as f32 * grid.cell_size)
            } else {
                0.0
            };
        }
        out[o + 3] = 0.0;
    }
    Ok(())
}

fn init_sample_edges(
    kernel: Kernel,
    metadata: &[f32],
    out: &mut [f32],
    uniforms: &Uniforms,
    range: Range<usize>,
    total: usize,
) -> Result<()> {
    let max_points = uniforms.get_uint(kernel, "max_sample_points")? as usize;
    let stride = uniforms.get_uint(kernel, "meta_stride")? as usize;
    let sample_length = uniforms.get_float(kernel, "sample_length")?;
    require(kernel, "metadata", metadata, total * stride)?;
    require(kernel, "samples_out", out, total * max_points * POINT_FLOATS)?;

    for e in range {
        let r = e * stride;
        let seed = [
            position(metadata, r + EdgeRecordLayout::START),
            position(metadata, r + EdgeRecordLayout::END),
        ];
        let points = resample_polyline(&seed, sample_length, max_points);
        write_slot(out, e, max_points, &points);
    }
    Ok(())
}

fn sample_edges(
    kernel: Kernel,
    samples: &[f32],
    out: &mut [f32],
    uniforms: &Uniforms,
    range: Range<usize>,
    total: usize,
) -> Result<()> {
    let max_points = uniforms.get_uint(kernel, "max_sample_points")? as usize;
    let sample_length = uniforms.get_float(kernel, "sample_length")?;
    let needed = total * max_points * POINT_FLOATS;
    require(kernel, "samples_in", samples, needed)?;
    require(kernel, "samples_out", out, needed)?;

    for e in range {
        let polyline = read_polyline(samples, e, max_points);
        if polyline.len() < 2 {
            for slot in e * max_points..(e + 1) * max_points {
                copy_slot(samples, out, slot);
            }
            continue;
        }
        let points = resample_polyline(&polyline, sample_length, max_points);
        write_slot(out, e, max_points, &points);
    }
    Ok(())
}

fn sample_noise(
    kernel: Kernel,
    samples: &[f32],
    out: &mut [f32],
    uniforms: &Uniforms,
    range: Range<usize>,
    total: usize,
) -> Result<()> {
    let max_points = uniforms.get_uint(kernel, "max_sample_points")? as usize;
    let move_start_end = uniforms.get_uint(kernel, "move_start_end")? != 0;
    let seed = uniforms.get_uint(kernel, "seed")?;
    let strength = uniforms.get_float(kernel, "strength")?;
    require(kernel, "samples_in", samples, total * POINT_FLOATS)?;
    require(kernel, "samples_out", out, total * POINT_FLOATS)?;

    for slot in range {
        copy_slot(samples, out, slot);
        let (edge, i) = (slot / max_points, slot % max_points);
        let live = live_count(samples, edge, max_points);
        if i >= live {
            continue;
        }
        let endpoint = i == 0 || i + 1 == live;
        let axes = match (endpoint, move_start_end) {
            (false, _) => 3,
            (true, true) => 2,
            (true, false) => 0,
        };
        let o = slot * POINT_FLOATS;
        for axis in 0..axes {
            out[o + axis] += jitter(seed, slot as u32, axis as u32) * strength;
        }
    }
    Ok(())
}

fn sample_smooth(
    kernel: Kernel,
    samples: &[f32],
    out: &mut [f32],
    uniforms: &Uniforms,
    range: Range<usize>,
    total: usize,
) -> Result<()> {
    let max_points = uniforms.get_uint(kernel, "max_sample_points")? as usize;
    let radius = uniforms.get_float(kernel, "radius")?;
    require(kernel, "samples_in", samples, total * POINT_FLOATS)?;
    require(kernel, "samples_out", out, total * POINT_FLOATS)?;

    for slot in range {
        copy_slot(samples, out, slot);
        let (edge, i) = (slot / max_points, slot % max_points);
        let live = live_count(samples, edge, max_points);
        if i == 0 || i + 1 >= live || radius <= 0.0 {
            continue;
        }
        let base = edge * max_points * POINT_FLOATS;
        let p = position(samples, base + i * POINT_FLOATS);
        let mut sum = [0.0f32; 3];
        let mut weight_sum = 0.0f32;
        for j in 0..live {
            let q = position(samples, base + j * POINT_FLOATS);
            let d = distance(p, q);
            if d < radius {
                let w = 1.0 - d / radius;
                for axis in 0..3 {
                    sum[axis] += q[axis] * w;
                }
                weight_sum += w;
            }
        }
        if weight_sum > 0.0 {
            let o = slot * POINT_FLOATS;
            for axis in 0..3 {
                out[o + axis] = sum[axis] / weight_sum;
            }
        }
    }
    Ok(())
}

fn sample_density(
    kernel: Kernel,
    positions: &[f32],
    samples: &[f32],
    metadata: &[f32],
    out: &mut [f32],
    uniforms: &Uniforms,
    range: Range<usize>,
) -> Result<()> {
    let grid = GridSpec::from_uniforms(kernel, uniforms)?;
    let max_points = uniforms.get_uint(kernel, "max_sample_points")? as usize;
    let stride = uniforms.get_uint(kernel, "meta_stride")? as usize;
    let edges = uniforms.get_uint(kernel, "edge_count")? as usize;
    let radius = uniforms.get_float(kernel, "radius")?;
    let cells = grid.cell_count();
    require(kernel, "cell_positions", positions, cells * CELL_FLOATS)?;
    require(kernel, "density", out, cells * CELL_FLOATS)?;
    require(kernel, "samples_in", samples, edges * max_points * POINT_FLOATS)?;
    require(kernel, "metadata", metadata, edges * stride)?;

    for e in 0..edges {
        let weight = metadata[e * stride + EdgeRecordLayout::IMPORTANCE];
        for p in read_polyline(samples, e, max_points) {
            splat(&grid, positions, out, &range, p, weight, radius);
        }
    }
    Ok(())
}

fn sample_advect(
    kernel: Kernel,
    samples: &[f32],
    gradient: &[f32],
    out: &mut [f32],
    uniforms: &Uniforms,
    range: Range<usize>,
    total: usize,
) -> Result<()> {
    let grid = GridSpec::from_uniforms(kernel, uniforms)?;
    let max_points = uniforms.get_uint(kernel, "max_sample_points")? as usize;
    let strength = uniforms.get_float(kernel, "advect_strength")?;
    let direction = uniforms.get_float(kernel, "direction")?;
    let max_step = uniforms.get_float(kernel, "max_step")?;
    require(kernel, "samples_in", samples, total * POINT_FLOATS)?;
    require(kernel, "samples_out", out, total * POINT_FLOATS)?;
    require(kernel, "gradient", gradient, grid.cell_count() * CELL_FLOATS)?;

    for slot in range {
        copy_slot(samples, out, slot);
        let (edge, i) = (slot / max_points, slot % max_points);
        let live = live_count(samples, edge, max_points);
        if i == 0 || i + 1 >= live {
            continue;
        }
        let o = slot * POINT_FLOATS;
        let p = position(samples, o);
        let step = advect_step(&grid, gradient, p, strength, direction, max_step);
        out[o] += step[0];
        out[o + 1] += step[1];
    }
    Ok(())
}

fn check_limits(
    kernel: Kernel,
    samples: &[f32],
    out: &mut [f32],
    uniforms: &Uniforms,
    range: Range<usize>,
    total: usize,
) -> Result<()> {
    let max_points = uniforms.get_uint(kernel, "max_sample_points")? as usize;
    require(kernel, "samples_in", samples, total * max_points * POINT_FLOATS)?;
    require(kernel, "limits", out, total * LIMIT_FLOATS)?;

    for e in range {
        let polyline = read_polyline(samples, e, max_points);
        let (near, far) = polyline
            .iter()
            .map(|p| p[2])
            .fold(None, |acc: Option<(f32, f32)>, z| match acc {
                None => Some((z, z)),
                Some((lo, hi)) => Some((lo.min(z), hi.max(z))),
            })
            .unwrap_or((0.0, 0.0));
        let o = e * LIMIT_FLOATS;
        out[o..o + LIMIT_FLOATS].copy_from_slice(&[polyline.len() as f32, near, far, 0.0]);
    }
    Ok(())
}
