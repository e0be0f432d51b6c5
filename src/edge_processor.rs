//! Polyline storage and per-edge kernels
//!
//! Edges are partitioned per layer pair into containers of at most
//! `max_edges_per_buffer` edges, further limited so that a single sample
//! buffer never exceeds the device's storage ceiling. Every partition holds:
//!
//! - a [`DoubleBuffer`] of `edge_count * max_sample_points` points
//! - a metadata buffer of `edge_count` records (see [`EdgeRecordLayout`])
//! - a limits buffer receiving one `check_limits` record per edge
//!
//! Every edge owns a fixed slot of `max_sample_points` points. The live point
//! count sits in the `w` component of the slot's first point; slots are zero
//! past the live count. When the longest polyline gets close to the slot
//! capacity, [`EdgeProcessor::check_limits`] grows every slot.

use crate::advection::AdvectionProgress;
use crate::compute::kernels::live_count;
use crate::compute::{
    Bindings, BufferHandle, ComputeDevice, DoubleBuffer, Kernel, SingleBuffer, Uniforms,
    dispatch_chunked,
};
use crate::error::{BundleError, Result};
use crate::model::NetworkModel;
use crate::types::{
    EdgeRecordLayout, LIMIT_FLOATS, MIN_SAMPLE_POINTS, POINT_FLOATS, RESERVED_SAMPLE_POINTS,
    RESIZE_FILL_RATIO, SamplePoint,
};

/// Slot capacity for edges no longer than `max_distance`
pub fn sample_capacity(max_distance: f32, sample_length: f32) -> usize {
    let segments = if sample_length > 0.0 && max_distance.is_finite() {
        (max_distance / sample_length).ceil().max(0.0) as usize
    } else {
        0
    };
    (2 * segments + RESERVED_SAMPLE_POINTS).max(MIN_SAMPLE_POINTS)
}

/// Whether the longest polyline is close enough to the capacity to grow
pub fn needs_resize(max_live: usize, capacity: usize) -> bool {
    let usable = capacity.saturating_sub(RESERVED_SAMPLE_POINTS);
    max_live as f32 >= RESIZE_FILL_RATIO * usable as f32
}

/// Polyline storage of the edges of one (layer pair, container)
#[derive(Debug)]
pub struct EdgePartition {
    layer: usize,
    container: usize,
    edge_count: usize,
    samples: DoubleBuffer,
    metadata: BufferHandle,
    limits: SingleBuffer,
}

impl EdgePartition {
    /// Source layer of the partition's edges
    pub fn layer(&self) -> usize {
        self.layer
    }

    pub fn container(&self) -> usize {
        self.container
    }

    pub fn edge_count(&self) -> usize {
        self.edge_count
    }

    pub fn samples(&self) -> &DoubleBuffer {
        &self.samples
    }

    pub(crate) fn samples_mut(&mut self) -> &mut DoubleBuffer {
        &mut self.samples
    }

    pub fn metadata(&self) -> BufferHandle {
        self.metadata
    }

    fn release<D: ComputeDevice + ?Sized>(self, device: &mut D) {
        self.samples.release(device);
        device.release(self.metadata);
        self.limits.release(device);
    }
}

/// Aggregated result of a [`EdgeProcessor::check_limits`] pass
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LimitsReport {
    /// Sum of the live point counts of every edge
    pub point_count: usize,
    /// Smallest z of any live point
    pub nearest_z: f32,
    /// Largest z of any live point
    pub farthest_z: f32,
    /// Longest polyline, in points
    pub max_live: usize,
    /// New slot capacity if the pass grew the storage
    pub resized_to: Option<usize>,
}

/// One edge as staged on the host: metadata record and live points
struct StagedEdge {
    record: Vec<f32>,
    points: Vec<f32>,
}

/// Owns the polyline and metadata storage of every edge
#[derive(Debug)]
pub struct EdgeProcessor {
    partitions: Vec<EdgePartition>,
    layout: EdgeRecordLayout,
    max_sample_points: usize,
    sample_length: f32,
    max_edges_per_buffer: usize,
    edge_count: usize,
    seed: u32,
    noise_calls: u32,
}

impl EdgeProcessor {
    pub fn new(sample_length: f32, max_edges_per_buffer: usize, seed: u32) -> Self {
        Self {
            partitions: Vec::new(),
            layout: EdgeRecordLayout::new(0),
            max_sample_points: MIN_SAMPLE_POINTS,
            sample_length,
            max_edges_per_buffer: max_edges_per_buffer.max(1),
            edge_count: 0,
            seed,
            noise_calls: 0,
        }
    }

    /// Partition the model's edges and upload straight two-point polylines
    /// from source to target
    pub fn set_data<D: ComputeDevice + ?Sized>(
        &mut self,
        device: &mut D,
        model: &NetworkModel,
    ) -> Result<()> {
        let layout = EdgeRecordLayout::new(model.num_classes());
        let capacity = sample_capacity(model.max_distance(), self.sample_length);
        let staged = model
            .edges()
            .iter()
            .enumerate()
            .map(|(global_id, edge)| {
                let record = model.edge_record(edge, global_id, &layout);
                let at = |o: usize| [record[o], record[o + 1], record[o + 2]];
                let [x, y, z] = at(EdgeRecordLayout::END);
                let seed = [
                    SamplePoint::header(at(EdgeRecordLayout::START), 2),
                    SamplePoint::new(x, y, z),
                ];
                let points = bytemuck::cast_slice::<SamplePoint, f32>(&seed).to_vec();
                StagedEdge { record, points }
            })
            .collect();

        self.layout = layout;
        self.rebuild(device, staged, capacity)?;
        tracing::info!(
            edges = self.edge_count,
            partitions = self.partitions.len(),
            max_sample_points = self.max_sample_points,
            "edge storage ready"
        );
        Ok(())
    }

    /// Recreate the storage from snapshot data: per partition, per edge, a
    /// metadata record and a polyline slot of `max_sample_points` points
    pub fn restore<D: ComputeDevice + ?Sized>(
        &mut self,
        device: &mut D,
        layout: EdgeRecordLayout,
        max_sample_points: usize,
        metadata: &[Vec<Vec<f32>>],
        samples: &[Vec<Vec<f32>>],
    ) -> Result<()> {
        if max_sample_points < 2 {
            return Err(BundleError::InvalidInput(format!(
                "polyline capacity {max_sample_points} cannot hold an edge"
            )));
        }
        if metadata.len() != samples.len() {
            return Err(BundleError::InvalidInput(format!(
                "{} metadata partitions, {} sample partitions",
                metadata.len(),
                samples.len()
            )));
        }
        let slot_floats = max_sample_points * POINT_FLOATS;
        let mut staged = Vec::new();
        for (records, slots) in metadata.iter().zip(samples) {
            if records.len() != slots.len() {
                return Err(BundleError::InvalidInput(format!(
                    "partition holds {} metadata records but {} polylines",
                    records.len(),
                    slots.len()
                )));
            }
            for (record, slot) in records.iter().zip(slots) {
                if record.len() != layout.stride || slot.len() != slot_floats {
                    return Err(BundleError::InvalidInput(
                        "edge record or polyline slot has the wrong size".to_string(),
                    ));
                }
                let live = live_count(slot, 0, max_sample_points);
                staged.push(StagedEdge {
                    record: record.clone(),
                    points: slot[..live * POINT_FLOATS].to_vec(),
                });
            }
        }
        self.layout = layout;
        self.rebuild(device, staged, max_sample_points.max(MIN_SAMPLE_POINTS))
    }

    /// Edges per partition that keep a sample half under the device ceiling
    fn edges_per_buffer<D: ComputeDevice + ?Sized>(&self, device: &D, capacity: usize) -> usize {
        let slot_bytes = (capacity * POINT_FLOATS * std::mem::size_of::<f32>()) as u64;
        let fitting = (device.limits().max_buffer_bytes / slot_bytes.max(1)) as usize;
        self.max_edges_per_buffer.min(fitting).max(1)
    }

    /// Allocate fresh partitions for `staged` edges at `capacity` points per
    /// slot, then free the old partitions. On failure the old storage stays.
    fn rebuild<D: ComputeDevice + ?Sized>(
        &mut self,
        device: &mut D,
        staged: Vec<StagedEdge>,
        capacity: usize,
    ) -> Result<()> {
        let per_buffer = self.edges_per_buffer(device, capacity);
        let mut fresh: Vec<EdgePartition> = Vec::new();
        let edge_count = staged.len();

        let mut start = 0;
        while start < staged.len() {
            let layer = staged[start].record[EdgeRecordLayout::LAYER] as usize;
            let mut end = start;
            while staged
                .get(end)
                .is_some_and(|edge| edge.record[EdgeRecordLayout::LAYER] as usize == layer)
            {
                end += 1;
            }
            for (container, chunk) in staged[start..end].chunks(per_buffer).enumerate() {
                match self.allocate(device, layer, container, chunk, capacity) {
                    Ok(partition) => fresh.push(partition),
                    Err(err) => {
                        for partition in fresh {
                            partition.release(device);
                        }
                        return Err(err);
                    }
                }
            }
            start = end;
        }

        for partition in std::mem::replace(&mut self.partitions, fresh) {
            partition.release(device);
        }
        self.max_sample_points = capacity;
        self.edge_count = edge_count;
        Ok(())
    }

    fn allocate<D: ComputeDevice + ?Sized>(
        &self,
        device: &mut D,
        layer: usize,
        container: usize,
        edges: &[StagedEdge],
        capacity: usize,
    ) -> Result<EdgePartition> {
        let slot_floats = capacity * POINT_FLOATS;
        let mut samples = vec![0.0; edges.len() * slot_floats];
        let mut metadata = Vec::with_capacity(edges.len() * self.layout.stride);
        for (i, edge) in edges.iter().enumerate() {
            let n = edge.points.len().min(slot_floats);
            samples[i * slot_floats..i * slot_floats + n].copy_from_slice(&edge.points[..n]);
            metadata.extend_from_slice(&edge.record);
        }

        let label = format!("samples[{layer}/{container}]");
        let buffer = DoubleBuffer::create(device, &label, samples.len())?;
        let meta = device.create_buffer(&format!("metadata[{layer}/{container}]"), metadata.len());
        let limits = SingleBuffer::create(
            device,
            &format!("limits[{layer}/{container}]"),
            edges.len() * LIMIT_FLOATS,
        );
        let (meta, limits) = match (meta, limits) {
            (Ok(meta), Ok(limits)) => (meta, limits),
            (meta, limits) => {
                buffer.release(device);
                let meta_err = match meta {
                    Ok(handle) => {
                        device.release(handle);
                        None
                    }
                    Err(err) => Some(err),
                };
                let limits_err = match limits {
                    Ok(limits) => {
                        limits.release(device);
                        None
                    }
                    Err(err) => Some(err),
                };
                return Err(meta_err.or(limits_err).unwrap_or_else(|| {
                    BundleError::Device("partition allocation failed".to_string())
                }));
            }
        };
        let partition = EdgePartition {
            layer,
            container,
            edge_count: edges.len(),
            samples: buffer,
            metadata: meta,
            limits,
        };
        let uploaded = partition
            .samples
            .upload(device, &samples)
            .and_then(|_| device.write_buffer(meta, 0, &metadata));
        if let Err(err) = uploaded {
            partition.release(device);
            return Err(err);
        }
        Ok(partition)
    }

    pub fn partitions(&self) -> &[EdgePartition] {
        &self.partitions
    }

    pub(crate) fn partitions_mut(&mut self) -> &mut [EdgePartition] {
        &mut self.partitions
    }

    /// Indices of the partitions holding edges of `layer`
    pub fn layer_partitions(&self, layer: usize) -> impl Iterator<Item = usize> + '_ {
        self.partitions
            .iter()
            .enumerate()
            .filter(move |(_, p)| p.layer == layer)
            .map(|(i, _)| i)
    }

    pub fn layout(&self) -> EdgeRecordLayout {
        self.layout
    }

    /// Point capacity of every polyline slot
    pub fn max_sample_points(&self) -> usize {
        self.max_sample_points
    }

    pub fn edge_count(&self) -> usize {
        self.edge_count
    }

    pub fn sample_length(&self) -> f32 {
        self.sample_length
    }

    /// Run a per-edge sample kernel that reads the current half and writes
    /// the target half of every partition, then swap
    fn transform_samples<D: ComputeDevice + ?Sized>(
        &mut self,
        device: &mut D,
        kernel: Kernel,
        uniforms: Uniforms,
        per_point: bool,
    ) -> Result<()> {
        let uniforms = uniforms.uint("max_sample_points", self.max_sample_points as u32);
        for partition in &mut self.partitions {
            let count = if per_point {
                partition.edge_count * self.max_sample_points
            } else {
                partition.edge_count
            };
            let bindings = Bindings::new()
                .read(partition.samples.current())
                .write(partition.samples.target());
            dispatch_chunked(device, kernel, &bindings, uniforms.clone(), count)?;
            partition.samples.swap();
        }
        Ok(())
    }

    /// Resample every polyline at uniform arc-length spacing
    pub fn sample_edges<D: ComputeDevice + ?Sized>(&mut self, device: &mut D) -> Result<()> {
        let uniforms = Uniforms::new().float("sample_length", self.sample_length);
        self.transform_samples(device, Kernel::SampleEdges, uniforms, false)
    }

    /// Replace every polyline by a uniform resample of the straight segment
    /// between its endpoints
    pub fn init_sample_edge<D: ComputeDevice + ?Sized>(&mut self, device: &mut D) -> Result<()> {
        let uniforms = Uniforms::new()
            .uint("max_sample_points", self.max_sample_points as u32)
            .uint("meta_stride", self.layout.stride as u32)
            .float("sample_length", self.sample_length);
        for partition in &mut self.partitions {
            let bindings = Bindings::new()
                .read(partition.metadata)
                .write(partition.samples.target());
            dispatch_chunked(
                device,
                Kernel::InitSampleEdges,
                &bindings,
                uniforms.clone(),
                partition.edge_count,
            )?;
            partition.samples.swap();
        }
        Ok(())
    }

    /// Jitter interior points by up to half of `strength` per axis; endpoints
    /// move in their layer plane only when `move_start_end` is set
    pub fn sample_noise<D: ComputeDevice + ?Sized>(
        &mut self,
        device: &mut D,
        strength: f32,
        move_start_end: bool,
    ) -> Result<()> {
        let seed = self.seed.wrapping_add(self.noise_calls.wrapping_mul(0x85eb_ca6b));
        self.noise_calls = self.noise_calls.wrapping_add(1);
        let uniforms = Uniforms::new()
            .uint("move_start_end", u32::from(move_start_end))
            .uint("seed", seed)
            .float("strength", strength);
        self.transform_samples(device, Kernel::SampleNoise, uniforms, true)
    }

    /// Smooth interior points with a radius shrinking with the schedule
    pub fn sample_smooth<D: ComputeDevice + ?Sized>(
        &mut self,
        device: &mut D,
        progress: &AdvectionProgress,
        smooth_radius: f32,
    ) -> Result<()> {
        let radius = smooth_radius * progress.bandwidth_reduction();
        let uniforms = Uniforms::new().float("radius", radius);
        self.transform_samples(device, Kernel::SampleSmooth, uniforms, true)
    }

    /// Gather per-edge live counts and depth ranges. With `check_resize`, the
    /// storage grows when the longest polyline nears the slot capacity.
    pub fn check_limits<D: ComputeDevice + ?Sized>(
        &mut self,
        device: &mut D,
        check_resize: bool,
    ) -> Result<LimitsReport> {
        let uniforms = Uniforms::new().uint("max_sample_points", self.max_sample_points as u32);
        let mut report = LimitsReport::default();
        let mut depth: Option<(f32, f32)> = None;

        for partition in &self.partitions {
            let bindings = Bindings::new()
                .read(partition.samples.current())
                .write(partition.limits);
            dispatch_chunked(
                device,
                Kernel::CheckLimits,
                &bindings,
                uniforms.clone(),
                partition.edge_count,
            )?;
            let limits = partition.limits.read(device)?;
            for record in limits.chunks_exact(LIMIT_FLOATS).take(partition.edge_count) {
                let live = record[0] as usize;
                report.point_count += live;
                report.max_live = report.max_live.max(live);
                if live > 0 {
                    depth = Some(match depth {
                        None => (record[1], record[2]),
                        Some((near, far)) => (near.min(record[1]), far.max(record[2])),
                    });
                }
            }
        }
        if let Some((near, far)) = depth {
            report.nearest_z = near;
            report.farthest_z = far;
        }

        if check_resize && needs_resize(report.max_live, self.max_sample_points) {
            let old = self.max_sample_points;
            self.resize_sample_storage(device, (2 * report.max_live).max(old))?;
            if self.max_sample_points != old {
                report.resized_to = Some(self.max_sample_points);
            }
        }
        tracing::debug!(
            points = report.point_count,
            max_live = report.max_live,
            capacity = self.max_sample_points,
            "checked limits"
        );
        Ok(report)
    }

    /// Grow every polyline slot to `new_capacity` points, keeping each live
    /// prefix. Requests that would not grow the storage are ignored.
    pub fn resize_sample_storage<D: ComputeDevice + ?Sized>(
        &mut self,
        device: &mut D,
        new_capacity: usize,
    ) -> Result<()> {
        if new_capacity <= self.max_sample_points {
            return Ok(());
        }
        let old = self.max_sample_points;
        let slot_floats = old * POINT_FLOATS;
        let mut staged = Vec::with_capacity(self.edge_count);
        for partition in &self.partitions {
            let samples = partition.samples.read(device)?;
            let metadata = device.read_buffer(partition.metadata)?;
            let records = metadata.chunks_exact(self.layout.stride);
            for (e, record) in records.take(partition.edge_count).enumerate() {
                let live = live_count(&samples, e, old);
                let base = e * slot_floats;
                staged.push(StagedEdge {
                    record: record.to_vec(),
                    points: samples[base..base + live * POINT_FLOATS].to_vec(),
                });
            }
        }
        self.rebuild(device, staged, new_capacity)?;
        tracing::info!(from = old, to = new_capacity, "resized sample storage");
        Ok(())
    }

    /// Current polyline slots of one partition
    pub fn read_samples<D: ComputeDevice + ?Sized>(
        &self,
        device: &mut D,
        partition: usize,
    ) -> Result<Vec<f32>> {
        self.partition(partition)?.samples.read(device)
    }

    /// Metadata records of one partition
    pub fn read_metadata<D: ComputeDevice + ?Sized>(
        &self,
        device: &mut D,
        partition: usize,
    ) -> Result<Vec<f32>> {
        device.read_buffer(self.partition(partition)?.metadata)
    }

    /// Current polyline slots of every partition
    pub fn read_all_samples<D: ComputeDevice + ?Sized>(
        &self,
        device: &mut D,
    ) -> Result<Vec<Vec<f32>>> {
        (0..self.partitions.len())
            .map(|i| self.read_samples(device, i))
            .collect()
    }

    /// Metadata records of every partition
    pub fn read_all_metadata<D: ComputeDevice + ?Sized>(
        &self,
        device: &mut D,
    ) -> Result<Vec<Vec<f32>>> {
        (0..self.partitions.len())
            .map(|i| self.read_metadata(device, i))
            .collect()
    }

    /// Live points of every edge, in global edge order
    pub fn polylines<D: ComputeDevice + ?Sized>(
        &self,
        device: &mut D,
    ) -> Result<Vec<Vec<[f32; 3]>>> {
        let mut polylines = Vec::with_capacity(self.edge_count);
        for (i, partition) in self.partitions.iter().enumerate() {
            let samples = self.read_samples(device, i)?;
            for e in 0..partition.edge_count {
                let base = e * self.max_sample_points * POINT_FLOATS;
                let live = live_count(&samples, e, self.max_sample_points);
                polylines.push(
                    samples[base..base + live * POINT_FLOATS]
                        .chunks_exact(POINT_FLOATS)
                        .map(|p| [p[0], p[1], p[2]])
                        .collect(),
                );
            }
        }
        Ok(polylines)
    }

    fn partition(&self, index: usize) -> Result<&EdgePartition> {
        self.partitions.get(index).ok_or_else(|| {
            BundleError::InvalidInput(format!(
                "partition {index} out of range ({} partitions)",
                self.partitions.len()
            ))
        })
    }

    /// Release every buffer
    pub fn delete<D: ComputeDevice + ?Sized>(&mut self, device: &mut D) {
        for partition in self.partitions.drain(..) {
            partition.release(device);
        }
        self.edge_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advection::Direction;
    use crate::compute::{DeviceLimits, HostDevice};
    use crate::config::{AnnealingConfig, BundlingConfig};
    use crate::model::NetworkInput;
    use proptest::prelude::*;

    fn model(sizes: &[usize]) -> NetworkModel {
        NetworkModel::build(&NetworkInput::uniform(sizes), &BundlingConfig::default()).unwrap()
    }

    fn processor(
        device: &mut HostDevice,
        model: &NetworkModel,
        per_buffer: usize,
    ) -> EdgeProcessor {
        let mut edges = EdgeProcessor::new(0.5, per_buffer, 11);
        edges.set_data(device, model).unwrap();
        edges
    }

    #[test]
    fn capacity_follows_the_longest_edge() {
        assert_eq!(sample_capacity(10.0, 0.5), 45);
        assert_eq!(sample_capacity(0.0, 0.5), MIN_SAMPLE_POINTS);
        assert_eq!(sample_capacity(0.4, 0.5), MIN_SAMPLE_POINTS);
    }

    #[test]
    fn resize_threshold_at_capacity_50() {
        assert!(needs_resize(37, 50));
        assert!(!needs_resize(35, 50));
    }

    #[test]
    fn four_by_three_starts_with_twelve_straight_edges() {
        let model = model(&[4, 3]);
        let mut device = HostDevice::new();
        let mut edges = processor(&mut device, &model, 8192);

        assert_eq!(edges.edge_count(), 12);
        assert_eq!(edges.partitions().len(), 1);
        let report = edges.check_limits(&mut device, false).unwrap();
        assert_eq!(report.point_count, 24);
        assert_eq!(report.max_live, 2);
        for polyline in edges.polylines(&mut device).unwrap() {
            assert_eq!(polyline.len(), 2);
        }
    }

    #[test]
    fn partitions_split_per_layer_and_container() {
        let model = model(&[3, 3, 2]);
        let mut device = HostDevice::new();
        let edges = processor(&mut device, &model, 4);

        let shape: Vec<(usize, usize, usize)> = edges
            .partitions()
            .iter()
            .map(|p| (p.layer(), p.container(), p.edge_count()))
            .collect();
        assert_eq!(shape, vec![(0, 0, 4), (0, 1, 4), (0, 2, 1), (1, 0, 4), (1, 1, 2)]);
        assert_eq!(edges.layer_partitions(1).collect::<Vec<_>>(), vec![3, 4]);
    }

    #[test]
    fn storage_ceiling_limits_partition_size() {
        let model = model(&[4, 4]);
        let mut device = HostDevice::with_limits(DeviceLimits {
            max_buffer_bytes: 4096,
            ..DeviceLimits::default()
        });
        let edges = processor(&mut device, &model, 8192);
        let slot_bytes = edges.max_sample_points() * POINT_FLOATS * 4;
        for partition in edges.partitions() {
            assert!(partition.edge_count() * slot_bytes <= 4096);
        }
        assert_eq!(edges.edge_count(), 16);
    }

    #[test]
    fn oversized_slot_is_a_sizing_error() {
        let model = model(&[2, 2]);
        let mut device = HostDevice::with_limits(DeviceLimits {
            max_buffer_bytes: 64,
            ..DeviceLimits::default()
        });
        let mut edges = EdgeProcessor::new(0.5, 8192, 0);
        let err = edges.set_data(&mut device, &model).unwrap_err();
        assert!(matches!(err, BundleError::BufferTooLarge { .. }));
        assert_eq!(device.stats().live_buffers, 0);
    }

    #[test]
    fn resampling_straight_edges_is_idempotent() {
        let model = model(&[3, 2]);
        let mut device = HostDevice::new();
        let mut edges = processor(&mut device, &model, 8192);
        edges.sample_edges(&mut device).unwrap();
        let once = edges.polylines(&mut device).unwrap();
        edges.sample_edges(&mut device).unwrap();
        let twice = edges.polylines(&mut device).unwrap();

        assert_eq!(once.len(), twice.len());
        for (a, b) in once.iter().zip(&twice) {
            assert_eq!(a.len(), b.len());
            assert_eq!(a.first(), b.first());
            assert_eq!(a.last(), b.last());
            for (p, q) in a.iter().zip(b) {
                assert!(crate::model::distance(*p, *q) < 1e-4);
            }
        }
    }

    #[test]
    fn init_sample_matches_resampled_seed() {
        let model = model(&[2, 2]);
        let mut device = HostDevice::new();
        let mut edges = processor(&mut device, &model, 8192);
        edges.init_sample_edge(&mut device).unwrap();
        let fresh = edges.polylines(&mut device).unwrap();
        for (polyline, edge) in fresh.iter().zip(model.edges()) {
            assert_eq!(polyline[0], model.nodes()[edge.source].position);
            assert_eq!(*polyline.last().unwrap(), model.nodes()[edge.target].position);
            let length = crate::model::distance(polyline[0], *polyline.last().unwrap());
            let expected = ((length / 0.5) - 1e-4).ceil().max(1.0) as usize + 1;
            assert_eq!(polyline.len(), expected.min(edges.max_sample_points()));
        }
    }

    #[test]
    fn noise_keeps_endpoints_fixed() {
        let model = model(&[2, 2]);
        let mut device = HostDevice::new();
        let mut edges = processor(&mut device, &model, 8192);
        edges.init_sample_edge(&mut device).unwrap();
        let before = edges.polylines(&mut device).unwrap();
        edges.sample_noise(&mut device, 0.25, false).unwrap();
        let after = edges.polylines(&mut device).unwrap();
        for (a, b) in before.iter().zip(&after) {
            assert_eq!(a.len(), b.len());
            assert_eq!(a.first(), b.first());
            assert_eq!(a.last(), b.last());
        }
        assert_ne!(before, after);
    }

    #[test]
    fn smoothing_keeps_a_straight_line_straight() {
        let model = model(&[1, 1]);
        let mut device = HostDevice::new();
        let mut edges = processor(&mut device, &model, 8192);
        edges.init_sample_edge(&mut device).unwrap();
        let before = edges.polylines(&mut device).unwrap();

        let progress = AdvectionProgress::new(&AnnealingConfig::default(), Direction::Forward);
        edges.sample_smooth(&mut device, &progress, 1.0).unwrap();
        let after = edges.polylines(&mut device).unwrap();
        for (p, q) in before[0].iter().zip(&after[0]) {
            assert!(p[0].abs() < 1e-5 && q[0].abs() < 1e-5);
            assert!(p[1].abs() < 1e-5 && q[1].abs() < 1e-5);
        }
        assert_eq!(before[0].first(), after[0].first());
        assert_eq!(before[0].last(), after[0].last());
    }

    /// One edge of a `[1, 1]` network whose middle point sits `offset` off
    /// the chord from `(0, 0, 0)` to `(0, 0, 1)`
    fn kinked(device: &mut HostDevice, offset: f32) -> EdgeProcessor {
        let model = model(&[1, 1]);
        let layout = EdgeRecordLayout::new(model.num_classes());
        let record = model.edge_record(&model.edges()[0], 0, &layout);
        let points = [
            SamplePoint::header([0.0, 0.0, 0.0], 3),
            SamplePoint::new(offset, 0.0, 0.5),
            SamplePoint::new(0.0, 0.0, 1.0),
        ];
        let live = bytemuck::cast_slice::<SamplePoint, f32>(&points);
        let mut slot = vec![0.0; MIN_SAMPLE_POINTS * POINT_FLOATS];
        slot[..live.len()].copy_from_slice(live);

        let mut edges = EdgeProcessor::new(0.5, 8192, 0);
        edges
            .restore(device, layout, MIN_SAMPLE_POINTS, &[vec![record]], &[vec![slot]])
            .unwrap();
        edges
    }

    #[test]
    fn smoothing_pulls_a_kink_less_as_the_radius_shrinks() {
        let annealing = AnnealingConfig {
            bandwidth: 1.0,
            reduction: 0.92,
            limit: 0.01,
        };
        // Distance the middle point moves toward the chord after smoothing
        // at the given iteration
        let pull = |iterations: usize| -> f32 {
            let mut device = HostDevice::new();
            let mut edges = kinked(&mut device, 0.4);
            let mut progress = AdvectionProgress::new(&annealing, Direction::Forward);
            for _ in 0..iterations {
                progress.iterate();
            }
            edges.sample_smooth(&mut device, &progress, 1.0).unwrap();
            let polyline = edges.polylines(&mut device).unwrap().remove(0);
            assert_eq!(polyline.len(), 3);
            assert_eq!(polyline[0], [0.0, 0.0, 0.0]);
            assert_eq!(polyline[2], [0.0, 0.0, 1.0]);
            assert!(polyline[1][0] >= 0.0);
            0.4 - polyline[1][0]
        };

        let first = pull(0);
        let later = pull(3);
        assert!(first > 0.1, "kink moved {first} at full radius");
        assert!(later > 0.0 && later < first, "{later} vs {first}");
        // 0.92^6 is below the 0.64 spacing between the points
        assert_eq!(pull(6), 0.0);
    }

    #[test]
    fn full_slots_below_the_doubling_point_report_no_resize() {
        let model = model(&[1, 1]);
        let mut device = HostDevice::new();
        let mut edges = EdgeProcessor::new(2.0, 8192, 0);
        edges.set_data(&mut device, &model).unwrap();
        let capacity = edges.max_sample_points();
        assert_eq!(capacity, 11);

        edges.sample_length = 1.25;
        edges.init_sample_edge(&mut device).unwrap();
        let report = edges.check_limits(&mut device, true).unwrap();
        assert_eq!(report.max_live, 5);
        assert!(needs_resize(report.max_live, capacity));
        assert_eq!(report.resized_to, None);
        assert_eq!(edges.max_sample_points(), capacity);
    }

    #[test]
    fn check_limits_grows_full_slots() {
        let model = model(&[2, 2]);
        let mut device = HostDevice::new();
        let mut edges = processor(&mut device, &model, 8192);
        let capacity = edges.max_sample_points();
        edges.init_sample_edge(&mut device).unwrap();

        // A much finer spacing fills every slot
        edges.sample_length = 0.05;
        edges.sample_edges(&mut device).unwrap();
        let report = edges.check_limits(&mut device, true).unwrap();
        assert_eq!(report.max_live, capacity);
        assert_eq!(report.resized_to, Some(2 * capacity));
        assert_eq!(edges.max_sample_points(), 2 * capacity);

        let after = edges.check_limits(&mut device, false).unwrap();
        assert_eq!(after.point_count, report.point_count);
    }

    #[test]
    fn resize_never_shrinks() {
        let model = model(&[2, 2]);
        let mut device = HostDevice::new();
        let mut edges = processor(&mut device, &model, 8192);
        let capacity = edges.max_sample_points();
        edges.resize_sample_storage(&mut device, capacity / 2).unwrap();
        assert_eq!(edges.max_sample_points(), capacity);
    }

    #[test]
    fn delete_releases_every_buffer() {
        let model = model(&[3, 3, 3]);
        let mut device = HostDevice::new();
        let mut edges = processor(&mut device, &model, 4);
        assert!(device.stats().live_buffers > 0);
        edges.delete(&mut device);
        assert_eq!(device.stats().live_buffers, 0);
        assert!(edges.partitions().is_empty());
    }

    #[test]
    fn empty_model_has_no_partitions() {
        let model = model(&[5]);
        let mut device = HostDevice::new();
        let mut edges = processor(&mut device, &model, 8192);
        edges.sample_edges(&mut device).unwrap();
        let report = edges.check_limits(&mut device, true).unwrap();
        assert_eq!(report.point_count, 0);
        assert!(edges.partitions().is_empty());
    }

    proptest! {
        #[test]
        fn resize_preserves_live_prefixes(
            sizes in prop::collection::vec(1usize..4, 2..4),
            noise in 0.0f32..0.4,
            grow in 1usize..40,
        ) {
            let model = model(&sizes);
            let mut device = HostDevice::new();
            let mut edges = processor(&mut device, &model, 3);
            edges.init_sample_edge(&mut device).unwrap();
            edges.sample_noise(&mut device, noise, false).unwrap();
            let before = edges.polylines(&mut device).unwrap();
            let capacity = edges.max_sample_points();

            edges.resize_sample_storage(&mut device, capacity + grow).unwrap();
            prop_assert_eq!(edges.max_sample_points(), capacity + grow);
            prop_assert_eq!(edges.polylines(&mut device).unwrap(), before);

            let slot = edges.max_sample_points() * POINT_FLOATS;
            for samples in edges.read_all_samples(&mut device).unwrap() {
                for (e, chunk) in samples.chunks_exact(slot).enumerate() {
                    let live = live_count(&samples, e, edges.max_sample_points());
                    prop_assert!(chunk[live * POINT_FLOATS..].iter().all(|&v| v == 0.0));
                }
            }
        }

        #[test]
        fn point_count_is_the_sum_of_live_counts(
            sizes in prop::collection::vec(1usize..5, 2..4),
            sample_length in 0.2f32..2.0,
        ) {
            let model = model(&sizes);
            let mut device = HostDevice::new();
            let mut edges = EdgeProcessor::new(sample_length, 5, 3);
            edges.set_data(&mut device, &model).unwrap();
            edges.init_sample_edge(&mut device).unwrap();
            let report = edges.check_limits(&mut device, false).unwrap();
            let total: usize = edges.polylines(&mut device).unwrap().iter().map(Vec::len).sum();
            prop_assert_eq!(report.point_count, total);
            prop_assert!(report.max_live <= edges.max_sample_points());
        }
    }
}
