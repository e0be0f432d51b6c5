//! Density grid and advection
//!
//! The grid spans the x/y bounding box of the network plus one padding cell
//! per side. Along z it covers a slab of one layer distance plus padding,
//! placed either around a single layer plane (node phases) or between two
//! consecutive layers (edge phases). One iteration over a slab is:
//!
//! ```text
//! clear -> position -> density -> gradient -> advect
//! ```

use std::ops::Range;

use crate::compute::{
    Bindings, ComputeDevice, GridSpec, Kernel, SingleBuffer, Uniforms, dispatch_chunked,
};
use crate::edge_processor::EdgeProcessor;
use crate::error::{BundleError, Result};
use crate::model::NetworkModel;
use crate::node_processor::NodeProcessor;
use crate::types::CELL_FLOATS;

/// Where the grid slab sits along z
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slab {
    /// Centered on one layer plane
    Layer(usize),
    /// Spanning a layer and the next one
    LayerPair(usize),
}

/// Owns the density, cell position and gradient buffers
#[derive(Debug)]
pub struct GridProcessor {
    spec: GridSpec,
    layer_z: Vec<f32>,
    positions: SingleBuffer,
    density: SingleBuffer,
    gradient: SingleBuffer,
    slab: Option<Slab>,
}

impl GridProcessor {
    /// Size the grid to the model's bounding volume
    pub fn new<D: ComputeDevice + ?Sized>(
        device: &mut D,
        model: &NetworkModel,
        cell_size: f32,
    ) -> Result<Self> {
        if !(cell_size > 0.0) {
            return Err(BundleError::Config(format!(
                "cell_size must be positive, got {cell_size}"
            )));
        }
        let bounds = model.bounds();
        let extent = bounds.extent();
        let cells = |length: f32| (length.max(0.0) / cell_size).ceil().max(1.0) as u32 + 2;
        let spec = GridSpec {
            dims: [
                cells(extent[0]),
                cells(extent[1]),
                cells(model.layer_distance().abs()),
            ],
            origin: [bounds.min[0] - cell_size, bounds.min[1] - cell_size, 0.0],
            cell_size,
        };
        let len = spec.cell_count() * CELL_FLOATS;

        let positions = SingleBuffer::create(device, "grid positions", len)?;
        let density = match SingleBuffer::create(device, "grid density", len) {
            Ok(buffer) => buffer,
            Err(err) => {
                positions.release(device);
                return Err(err);
            }
        };
        let gradient = match SingleBuffer::create(device, "grid gradient", len) {
            Ok(buffer) => buffer,
            Err(err) => {
                positions.release(device);
                density.release(device);
                return Err(err);
            }
        };
        tracing::debug!(dims = ?spec.dims, cells = spec.cell_count(), "density grid allocated");

        Ok(Self {
            spec,
            layer_z: (0..model.layer_count()).map(|l| model.layer_z(l)).collect(),
            positions,
            density,
            gradient,
            slab: None,
        })
    }

    pub fn spec(&self) -> GridSpec {
        self.spec
    }

    pub fn cell_count(&self) -> usize {
        self.spec.cell_count()
    }

    pub fn slab(&self) -> Option<Slab> {
        self.slab
    }

    /// Move the slab along z. Cell positions must be recalculated afterwards.
    pub fn place(&mut self, slab: Slab) -> Result<()> {
        let cell = self.spec.cell_size;
        let inner = (self.spec.dims[2] - 2) as f32 * cell;
        let origin_z = match slab {
            Slab::Layer(layer) => self.z_of(layer)? - inner / 2.0 - cell,
            Slab::LayerPair(layer) => {
                let (a, b) = (self.z_of(layer)?, self.z_of(layer + 1)?);
                a.min(b) - cell
            }
        };
        self.spec.origin[2] = origin_z;
        self.slab = Some(slab);
        Ok(())
    }

    fn z_of(&self, layer: usize) -> Result<f32> {
        self.layer_z.get(layer).copied().ok_or_else(|| {
            BundleError::InvalidInput(format!(
                "layer {layer} out of range ({} layers)",
                self.layer_z.len()
            ))
        })
    }

    fn grid_uniforms(&self) -> Uniforms {
        self.spec.apply(Uniforms::new())
    }

    /// Zero the density field
    pub fn clear_buffer<D: ComputeDevice + ?Sized>(&self, device: &mut D) -> Result<()> {
        let bindings = Bindings::new().write(self.density);
        dispatch_chunked(
            device,
            Kernel::GridClear,
            &bindings,
            Uniforms::new(),
            self.cell_count(),
        )?;
        Ok(())
    }

    /// Store the world-space center of every cell for the current slab
    pub fn calculate_position<D: ComputeDevice + ?Sized>(&self, device: &mut D) -> Result<()> {
        let bindings = Bindings::new().write(self.positions);
        dispatch_chunked(
            device,
            Kernel::GridPosition,
            &bindings,
            self.grid_uniforms(),
            self.cell_count(),
        )?;
        Ok(())
    }

    /// Add the importance-weighted density of the nodes in `nodes_range`
    pub fn calculate_node_density<D: ComputeDevice + ?Sized>(
        &self,
        device: &mut D,
        nodes: &NodeProcessor,
        nodes_range: Range<usize>,
        radius: f32,
    ) -> Result<()> {
        let Some(buffer) = nodes.buffer() else {
            return Ok(());
        };
        let bindings = Bindings::new()
            .read(self.positions)
            .read(buffer.current())
            .write(self.density);
        let uniforms = self
            .grid_uniforms()
            .uint("node_stride", nodes.layout().stride as u32)
            .uint("node_offset", nodes_range.start as u32)
            .uint("node_count", nodes_range.len() as u32)
            .float("radius", radius);
        dispatch_chunked(device, Kernel::NodeDensity, &bindings, uniforms, self.cell_count())?;
        Ok(())
    }

    /// Add the importance-weighted density of every live point of the given
    /// edge partitions
    pub fn calculate_sample_density<D: ComputeDevice + ?Sized>(
        &self,
        device: &mut D,
        edges: &EdgeProcessor,
        partitions: &[usize],
        radius: f32,
    ) -> Result<()> {
        for &index in partitions {
            let Some(partition) = edges.partitions().get(index) else {
                continue;
            };
            let bindings = Bindings::new()
                .read(self.positions)
                .read(partition.samples().current())
                .read(partition.metadata())
                .write(self.density);
            let uniforms = self
                .grid_uniforms()
                .uint("max_sample_points", edges.max_sample_points() as u32)
                .uint("meta_stride", edges.layout().stride as u32)
                .uint("edge_count", partition.edge_count() as u32)
                .float("radius", radius);
            dispatch_chunked(
                device,
                Kernel::SampleDensity,
                &bindings,
                uniforms,
                self.cell_count(),
            )?;
        }
        Ok(())
    }

    /// Finite-difference gradient of the density field
    pub fn calculate_gradient<D: ComputeDevice + ?Sized>(&self, device: &mut D) -> Result<()> {
        let bindings = Bindings::new().read(self.density).write(self.gradient);
        dispatch_chunked(
            device,
            Kernel::GridGradient,
            &bindings,
            self.grid_uniforms(),
            self.cell_count(),
        )?;
        Ok(())
    }

    fn advect_uniforms(&self, strength: f32, direction: f32) -> Uniforms {
        self.grid_uniforms()
            .float("advect_strength", strength)
            .float("direction", direction)
            .float("max_step", self.spec.cell_size)
    }

    /// Move the nodes in `nodes_range` down the density gradient in their
    /// layer plane. Every other node is copied unchanged.
    pub fn node_advect<D: ComputeDevice + ?Sized>(
        &self,
        device: &mut D,
        nodes: &mut NodeProcessor,
        nodes_range: Range<usize>,
        strength: f32,
        direction: f32,
    ) -> Result<()> {
        let stride = nodes.layout().stride;
        let count = nodes.node_count();
        let Some(buffer) = nodes.buffer_mut() else {
            return Ok(());
        };
        let bindings = Bindings::new()
            .read(buffer.current())
            .read(self.gradient)
            .write(buffer.target());
        let uniforms = self
            .advect_uniforms(strength, direction)
            .uint("node_stride", stride as u32)
            .uint("node_offset", nodes_range.start as u32)
            .uint("node_count", nodes_range.len() as u32);
        dispatch_chunked(device, Kernel::NodeAdvect, &bindings, uniforms, count)?;
        buffer.swap();
        Ok(())
    }

    /// Move the interior points of the given partitions down the density
    /// gradient in the x/y plane
    pub fn sample_advect<D: ComputeDevice + ?Sized>(
        &self,
        device: &mut D,
        edges: &mut EdgeProcessor,
        partitions: &[usize],
        strength: f32,
        direction: f32,
    ) -> Result<()> {
        let max_points = edges.max_sample_points();
        let uniforms = self
            .advect_uniforms(strength, direction)
            .uint("max_sample_points", max_points as u32);
        for &index in partitions {
            let Some(partition) = edges.partitions_mut().get_mut(index) else {
                continue;
            };
            let count = partition.edge_count() * max_points;
            let samples = partition.samples_mut();
            let bindings = Bindings::new()
                .read(samples.current())
                .read(self.gradient)
                .write(samples.target());
            dispatch_chunked(device, Kernel::SampleAdvect, &bindings, uniforms.clone(), count)?;
            samples.swap();
        }
        Ok(())
    }

    /// Read the density field back (one record per cell, density first)
    pub fn read_density<D: ComputeDevice + ?Sized>(&self, device: &mut D) -> Result<Vec<f32>> {
        self.density.read(device)
    }

    /// Read the gradient field back (one record per cell, xyz first)
    pub fn read_gradient<D: ComputeDevice + ?Sized>(&self, device: &mut D) -> Result<Vec<f32>> {
        self.gradient.read(device)
    }

    /// Release the grid buffers
    pub fn delete<D: ComputeDevice + ?Sized>(self, device: &mut D) {
        self.positions.release(device);
        self.density.release(device);
        self.gradient.release(device);
    }
}
