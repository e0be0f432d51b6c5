//! Buffer record types and layouts
//!
//! Every device buffer is a flat array of `f32`. These types describe how the
//! floats are grouped into records. All records are multiples of four floats so
//! that a record maps onto whole `vec4<f32>` values in a shader.

use bytemuck::{Pod, Zeroable};

// =============================================================================
// Default Constants
// =============================================================================

/// Default width of a layer plane (x extent)
pub const DEFAULT_LAYER_WIDTH: f32 = 10.0;

/// Default height of a layer plane (y extent)
pub const DEFAULT_LAYER_HEIGHT: f32 = 10.0;

/// Default distance between consecutive layers along z
pub const DEFAULT_LAYER_DISTANCE: f32 = 5.0;

/// Default spacing between resampled polyline points
pub const DEFAULT_SAMPLE_LENGTH: f32 = 0.5;

/// Default maximum number of edges stored in one sample buffer
pub const DEFAULT_MAX_EDGES_PER_BUFFER: usize = 8192;

/// Default edge length of a density grid cell
pub const DEFAULT_CELL_SIZE: f32 = 0.5;

/// Default radius of the density falloff kernel at full bandwidth
pub const DEFAULT_DENSITY_RADIUS: f32 = 1.5;

/// Default radius of the polyline smoothing kernel at full bandwidth
pub const DEFAULT_SMOOTH_RADIUS: f32 = 1.0;

/// Default advection step scale
pub const DEFAULT_ADVECT_STRENGTH: f32 = 0.01;

/// Default node jitter, in multiples of the sample length
pub const DEFAULT_NODE_NOISE_STRENGTH: f32 = 0.5;

/// Default polyline jitter, in multiples of the sample length
pub const DEFAULT_EDGE_NOISE_STRENGTH: f32 = 0.5;

/// Points reserved at the end of every polyline slot
pub const RESERVED_SAMPLE_POINTS: usize = 5;

/// Fraction of usable capacity at which sample storage grows
pub const RESIZE_FILL_RATIO: f32 = 0.8;

/// Smallest polyline capacity ever allocated
pub const MIN_SAMPLE_POINTS: usize = 8;

/// Floats per polyline point
pub const POINT_FLOATS: usize = 4;

/// Floats per density grid cell record
pub const CELL_FLOATS: usize = 4;

/// Floats per `check_limits` result record
pub const LIMIT_FLOATS: usize = 4;

/// Round `n` up to the next multiple of four
pub fn round_up4(n: usize) -> usize {
    n.div_ceil(4) * 4
}

/// A polyline point as stored in a sample buffer.
///
/// Point 0 of every edge keeps the live point count in `weight`; every other
/// live point carries `weight == 1.0`. Slots past the live count are zero.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct SamplePoint {
    /// Position in 3D space
    pub position: [f32; 3],
    /// Live count for point 0, live flag otherwise
    pub weight: f32,
}

impl SamplePoint {
    /// Create a live point
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self {
            position: [x, y, z],
            weight: 1.0,
        }
    }

    /// Create the header point of an edge carrying the live count
    pub fn header(position: [f32; 3], live_count: usize) -> Self {
        Self {
            position,
            weight: live_count as f32,
        }
    }
}

/// Layout of a node record: `[x, y, z, importance, classes.., padding]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRecordLayout {
    /// Number of class importance values per node
    pub num_classes: usize,
    /// Floats per record
    pub stride: usize,
}

impl NodeRecordLayout {
    pub const POSITION: usize = 0;
    pub const IMPORTANCE: usize = 3;
    pub const CLASSES: usize = 4;

    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            stride: Self::CLASSES + round_up4(num_classes),
        }
    }

    /// Pack a node into a record
    pub fn pack(&self, position: [f32; 3], importance: f32, classes: &[f32]) -> Vec<f32> {
        let mut record = vec![0.0; self.stride];
        record[..3].copy_from_slice(&position);
        record[Self::IMPORTANCE] = importance;
        let n = classes.len().min(self.num_classes);
        record[Self::CLASSES..Self::CLASSES + n].copy_from_slice(&classes[..n]);
        record
    }
}

/// Layout of an edge metadata record
///
/// ```text
/// [layer, local_id, importance, global_id]
/// [start.x, start.y, start.z, start_weight]
/// [end.x,   end.y,   end.z,   end_weight]
/// [class_0 .. class_{n-1}, padding to a multiple of 4]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeRecordLayout {
    /// Number of class importance values per edge
    pub num_classes: usize,
    /// Floats per record
    pub stride: usize,
}

impl EdgeRecordLayout {
    pub const LAYER: usize = 0;
    pub const LOCAL_ID: usize = 1;
    pub const IMPORTANCE: usize = 2;
    pub const GLOBAL_ID: usize = 3;
    pub const START: usize = 4;
    pub const END: usize = 8;
    pub const CLASSES: usize = 12;

    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            stride: Self::CLASSES + round_up4(num_classes),
        }
    }

    /// Floats of padding after the class values
    pub fn padding(&self) -> usize {
        self.stride - Self::CLASSES - self.num_classes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_point_size() {
        // 3 floats (position) + 1 float (weight) = 16 bytes
        assert_eq!(std::mem::size_of::<SamplePoint>(), 16);
    }

    #[test]
    fn test_edge_layout_is_vec4_aligned() {
        for classes in 0..40 {
            let layout = EdgeRecordLayout::new(classes);
            assert_eq!(layout.stride % 4, 0, "stride for {classes} classes");
            assert!(layout.stride >= EdgeRecordLayout::CLASSES + classes);
            assert!(layout.padding() < 4);
        }
    }

    #[test]
    fn test_edge_layout_known_sizes() {
        assert_eq!(EdgeRecordLayout::new(0).stride, 12);
        assert_eq!(EdgeRecordLayout::new(10).stride, 24);
        assert_eq!(EdgeRecordLayout::new(10).padding(), 2);
    }

    #[test]
    fn test_node_layout_pack() {
        let layout = NodeRecordLayout::new(3);
        assert_eq!(layout.stride, 8);
        let record = layout.pack([1.0, 2.0, 3.0], 0.5, &[0.1, 0.2, 0.3]);
        assert_eq!(record, vec![1.0, 2.0, 3.0, 0.5, 0.1, 0.2, 0.3, 0.0]);
    }

    #[test]
    fn test_header_point_carries_count() {
        let header = SamplePoint::header([0.0, 1.0, 2.0], 17);
        assert_eq!(header.weight, 17.0);
    }
}
