//! Node position storage and node jitter

use crate::compute::{Bindings, ComputeDevice, DoubleBuffer, Kernel, Uniforms, dispatch_chunked};
use crate::error::Result;
use crate::model::NetworkModel;
use crate::types::NodeRecordLayout;

/// Owns the double-buffered node records of a network
#[derive(Debug)]
pub struct NodeProcessor {
    nodes: Option<DoubleBuffer>,
    layout: NodeRecordLayout,
    node_count: usize,
    seed: u32,
    noise_calls: u32,
}

impl NodeProcessor {
    pub fn new(seed: u32) -> Self {
        Self {
            nodes: None,
            layout: NodeRecordLayout::new(0),
            node_count: 0,
            seed,
            noise_calls: 0,
        }
    }

    /// Allocate node storage for `model` and upload its records into both
    /// halves. Previously held storage is released first.
    pub fn set_data<D: ComputeDevice + ?Sized>(
        &mut self,
        device: &mut D,
        model: &NetworkModel,
    ) -> Result<()> {
        self.delete(device);
        let layout = NodeRecordLayout::new(model.num_classes());
        let records = model.node_records(&layout);
        self.upload(device, layout, model.node_count(), &records)
    }

    /// Allocate node storage from raw records, e.g. a restored snapshot
    pub fn set_records<D: ComputeDevice + ?Sized>(
        &mut self,
        device: &mut D,
        layout: NodeRecordLayout,
        records: &[f32],
    ) -> Result<()> {
        self.delete(device);
        let node_count = records.len() / layout.stride.max(1);
        self.upload(device, layout, node_count, records)
    }

    fn upload<D: ComputeDevice + ?Sized>(
        &mut self,
        device: &mut D,
        layout: NodeRecordLayout,
        node_count: usize,
        records: &[f32],
    ) -> Result<()> {
        let buffer = DoubleBuffer::create(device, "nodes", node_count * layout.stride)?;
        if let Err(err) = buffer.upload(device, records) {
            buffer.release(device);
            return Err(err);
        }
        tracing::debug!(node_count, stride = layout.stride, "uploaded node records");
        self.nodes = Some(buffer);
        self.layout = layout;
        self.node_count = node_count;
        Ok(())
    }

    pub fn layout(&self) -> NodeRecordLayout {
        self.layout
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    pub fn buffer(&self) -> Option<&DoubleBuffer> {
        self.nodes.as_ref()
    }

    pub(crate) fn buffer_mut(&mut self) -> Option<&mut DoubleBuffer> {
        self.nodes.as_mut()
    }

    /// Jitter every node within its layer plane by up to half of
    /// `sample_length * strength` per axis
    pub fn node_noise<D: ComputeDevice + ?Sized>(
        &mut self,
        device: &mut D,
        sample_length: f32,
        strength: f32,
    ) -> Result<()> {
        let Some(nodes) = self.nodes.as_mut() else {
            return Ok(());
        };
        let seed = self.seed.wrapping_add(self.noise_calls.wrapping_mul(0x9e37_79b9));
        self.noise_calls = self.noise_calls.wrapping_add(1);

        let bindings = Bindings::new().read(nodes.current()).write(nodes.target());
        let uniforms = Uniforms::new()
            .uint("node_stride", self.layout.stride as u32)
            .uint("seed", seed)
            .float("sample_length", sample_length)
            .float("strength", strength);
        dispatch_chunked(device, Kernel::NodeNoise, &bindings, uniforms, self.node_count)?;
        nodes.swap();
        Ok(())
    }

    /// Read the current node records back from the device
    pub fn read_records<D: ComputeDevice + ?Sized>(&self, device: &mut D) -> Result<Vec<f32>> {
        match &self.nodes {
            Some(nodes) => nodes.read(device),
            None => Ok(Vec::new()),
        }
    }

    /// Read back node positions
    pub fn read_nodes_from_buffer<D: ComputeDevice + ?Sized>(
        &self,
        device: &mut D,
    ) -> Result<Vec<[f32; 3]>> {
        let records = self.read_records(device)?;
        Ok(records
            .chunks_exact(self.layout.stride)
            .take(self.node_count)
            .map(|r| [r[0], r[1], r[2]])
            .collect())
    }

    /// Release the node storage
    pub fn delete<D: ComputeDevice + ?Sized>(&mut self, device: &mut D) {
        if let Some(nodes) = self.nodes.take() {
            nodes.release(device);
        }
        self.node_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::HostDevice;
    use crate::config::BundlingConfig;
    use crate::model::NetworkInput;

    fn model(sizes: &[usize]) -> NetworkModel {
        NetworkModel::build(&NetworkInput::uniform(sizes), &BundlingConfig::default()).unwrap()
    }

    #[test]
    fn positions_round_trip_through_the_device() {
        let model = model(&[4, 3]);
        let mut device = HostDevice::new();
        let mut nodes = NodeProcessor::new(1);
        nodes.set_data(&mut device, &model).unwrap();

        let positions = nodes.read_nodes_from_buffer(&mut device).unwrap();
        let expected: Vec<[f32; 3]> = model.nodes().iter().map(|n| n.position).collect();
        assert_eq!(positions, expected);
    }

    #[test]
    fn noise_moves_nodes_within_their_plane() {
        let model = model(&[5, 5]);
        let mut device = HostDevice::new();
        let mut nodes = NodeProcessor::new(42);
        nodes.set_data(&mut device, &model).unwrap();
        nodes.node_noise(&mut device, 0.5, 1.0).unwrap();

        let moved = nodes.read_nodes_from_buffer(&mut device).unwrap();
        let mut any_moved = false;
        for (before, after) in model.nodes().iter().zip(&moved) {
            assert_eq!(before.position[2], after[2]);
            assert!((before.position[0] - after[0]).abs() <= 0.25 + 1e-5);
            assert!((before.position[1] - after[1]).abs() <= 0.25 + 1e-5);
            any_moved |= before.position[0] != after[0];
        }
        assert!(any_moved);
    }

    #[test]
    fn repeated_noise_uses_fresh_offsets() {
        let model = model(&[3]);
        let mut device = HostDevice::new();
        let mut nodes = NodeProcessor::new(7);
        nodes.set_data(&mut device, &model).unwrap();
        nodes.node_noise(&mut device, 1.0, 1.0).unwrap();
        let first = nodes.read_nodes_from_buffer(&mut device).unwrap();
        nodes.node_noise(&mut device, 1.0, 1.0).unwrap();
        let second = nodes.read_nodes_from_buffer(&mut device).unwrap();
        let d0 = [first[0][0] - model.nodes()[0].position[0], 0.0];
        let d1 = [second[0][0] - first[0][0], 0.0];
        assert_ne!(d0, d1);
    }

    #[test]
    fn delete_releases_both_halves() {
        let model = model(&[2, 2]);
        let mut device = HostDevice::new();
        let mut nodes = NodeProcessor::new(0);
        nodes.set_data(&mut device, &model).unwrap();
        assert_eq!(device.stats().live_buffers, 2);
        nodes.delete(&mut device);
        assert_eq!(device.stats().live_buffers, 0);
        assert!(nodes.read_nodes_from_buffer(&mut device).unwrap().is_empty());
    }

    #[test]
    fn empty_network_is_a_no_op() {
        let model = model(&[]);
        let mut device = HostDevice::new();
        let mut nodes = NodeProcessor::new(0);
        nodes.set_data(&mut device, &model).unwrap();
        nodes.node_noise(&mut device, 0.5, 1.0).unwrap();
        assert!(nodes.read_nodes_from_buffer(&mut device).unwrap().is_empty());
    }
}
