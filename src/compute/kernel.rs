//! Kernel registry: names, binding roles and uniform contracts
//!
//! A kernel is identified by a [`Kernel`] variant. Each kernel declares the
//! buffers it binds (in order, with their access) and the uniforms it expects
//! (in order, with their type). Both backends derive everything they need from
//! these contracts: the host backend reads uniforms by key, the wgpu backend
//! generates WGSL declarations and packs the uniform block in contract order.

use std::fmt;

use crate::error::{BundleError, Result};

/// Element type of a uniform value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniformKind {
    Float,
    UInt,
}

impl UniformKind {
    pub fn wgsl(self) -> &'static str {
        match self {
            UniformKind::Float => "f32",
            UniformKind::UInt => "u32",
        }
    }
}

/// A typed uniform value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UniformValue {
    Float(f32),
    UInt(u32),
}

impl UniformValue {
    pub fn kind(&self) -> UniformKind {
        match self {
            UniformValue::Float(_) => UniformKind::Float,
            UniformValue::UInt(_) => UniformKind::UInt,
        }
    }

    /// Raw 32-bit pattern as uploaded to the device
    pub fn bits(&self) -> u32 {
        match self {
            UniformValue::Float(v) => v.to_bits(),
            UniformValue::UInt(v) => *v,
        }
    }
}

/// Access a kernel needs to a bound buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// One buffer binding of a kernel
#[derive(Debug, Clone, Copy)]
pub struct BindingSpec {
    pub name: &'static str,
    pub access: Access,
}

/// One uniform of a kernel
#[derive(Debug, Clone, Copy)]
pub struct UniformSpec {
    pub key: &'static str,
    pub kind: UniformKind,
}

const fn read(name: &'static str) -> BindingSpec {
    BindingSpec {
        name,
        access: Access::Read,
    }
}

const fn write(name: &'static str) -> BindingSpec {
    BindingSpec {
        name,
        access: Access::Write,
    }
}

const fn float(key: &'static str) -> UniformSpec {
    UniformSpec {
        key,
        kind: UniformKind::Float,
    }
}

const fn uint(key: &'static str) -> UniformSpec {
    UniformSpec {
        key,
        kind: UniformKind::UInt,
    }
}

/// Uniforms every kernel receives from the chunked dispatcher
pub const COMMON_UNIFORMS: &[UniformSpec] = &[uint("work_group_offset"), uint("element_count")];

const NODE_PAIR: &[BindingSpec] = &[read("nodes_in"), write("nodes_out")];
const SAMPLE_PAIR: &[BindingSpec] = &[read("samples_in"), write("samples_out")];
const NODE_DENSITY_BINDINGS: &[BindingSpec] =
    &[read("cell_positions"), read("nodes_in"), write("density")];
const NODE_ADVECT_BINDINGS: &[BindingSpec] =
    &[read("nodes_in"), read("gradient"), write("nodes_out")];
const GRID_CLEAR_BINDINGS: &[BindingSpec] = &[write("density")];
const GRID_POSITION_BINDINGS: &[BindingSpec] = &[write("cell_positions")];
const GRID_GRADIENT_BINDINGS: &[BindingSpec] = &[read("density_in"), write("gradient")];
const INIT_SAMPLE_BINDINGS: &[BindingSpec] = &[read("metadata"), write("samples_out")];
const SAMPLE_DENSITY_BINDINGS: &[BindingSpec] = &[
    read("cell_positions"),
    read("samples_in"),
    read("metadata"),
    write("density"),
];
const SAMPLE_ADVECT_BINDINGS: &[BindingSpec] =
    &[read("samples_in"), read("gradient"), write("samples_out")];
const CHECK_LIMITS_BINDINGS: &[BindingSpec] = &[read("samples_in"), write("limits")];

const GRID_UNIFORMS: &[UniformSpec] = &[
    uint("grid_x"),
    uint("grid_y"),
    uint("grid_z"),
    float("origin_x"),
    float("origin_y"),
    float("origin_z"),
    float("cell_size"),
];
const NODE_NOISE_UNIFORMS: &[UniformSpec] = &[
    uint("node_stride"),
    uint("seed"),
    float("sample_length"),
    float("strength"),
];
const NODE_DENSITY_UNIFORMS: &[UniformSpec] = &[
    uint("node_stride"),
    uint("node_offset"),
    uint("node_count"),
    float("radius"),
    uint("grid_x"),
    uint("grid_y"),
    uint("grid_z"),
    float("origin_x"),
    float("origin_y"),
    float("origin_z"),
    float("cell_size"),
];
const NODE_ADVECT_UNIFORMS: &[UniformSpec] = &[
    uint("node_stride"),
    uint("node_offset"),
    uint("node_count"),
    float("advect_strength"),
    float("direction"),
    float("max_step"),
    uint("grid_x"),
    uint("grid_y"),
    uint("grid_z"),
    float("origin_x"),
    float("origin_y"),
    float("origin_z"),
    float("cell_size"),
];
const INIT_SAMPLE_UNIFORMS: &[UniformSpec] = &[
    uint("max_sample_points"),
    uint("meta_stride"),
    float("sample_length"),
];
const SAMPLE_EDGES_UNIFORMS: &[UniformSpec] = &[uint("max_sample_points"), float("sample_length")];
const SAMPLE_NOISE_UNIFORMS: &[UniformSpec] = &[
    uint("max_sample_points"),
    uint("move_start_end"),
    uint("seed"),
    float("strength"),
];
const SAMPLE_SMOOTH_UNIFORMS: &[UniformSpec] = &[uint("max_sample_points"), float("radius")];
const SAMPLE_DENSITY_UNIFORMS: &[UniformSpec] = &[
    uint("max_sample_points"),
    uint("meta_stride"),
    uint("edge_count"),
    float("radius"),
    uint("grid_x"),
    uint("grid_y"),
    uint("grid_z"),
    float("origin_x"),
    float("origin_y"),
    float("origin_z"),
    float("cell_size"),
];
const SAMPLE_ADVECT_UNIFORMS: &[UniformSpec] = &[
    uint("max_sample_points"),
    float("advect_strength"),
    float("direction"),
    float("max_step"),
    uint("grid_x"),
    uint("grid_y"),
    uint("grid_z"),
    float("origin_x"),
    float("origin_y"),
    float("origin_z"),
    float("cell_size"),
];
const CHECK_LIMITS_UNIFORMS: &[UniformSpec] = &[uint("max_sample_points")];

/// Every compute kernel of the bundling pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kernel {
    /// Jitter node positions within their layer plane (per node)
    NodeNoise,
    /// Accumulate node density into the grid (per cell)
    NodeDensity,
    /// Move nodes of one layer along the negative gradient (per node)
    NodeAdvect,
    /// Zero the density grid (per cell)
    GridClear,
    /// World-space center of every cell (per cell)
    GridPosition,
    /// Finite-difference gradient of the density (per cell)
    GridGradient,
    /// Straight resample from the metadata endpoints (per edge)
    InitSampleEdges,
    /// Uniform resample of the current polylines (per edge)
    SampleEdges,
    /// Jitter polyline points (per point slot)
    SampleNoise,
    /// Kernel-weighted smoothing along each polyline (per point slot)
    SampleSmooth,
    /// Accumulate polyline density into the grid (per cell)
    SampleDensity,
    /// Move polyline points along the negative gradient (per point slot)
    SampleAdvect,
    /// Per-edge live count and depth range (per edge)
    CheckLimits,
}

impl Kernel {
    pub const ALL: [Kernel; 13] = [
        Kernel::NodeNoise,
        Kernel::NodeDensity,
        Kernel::NodeAdvect,
        Kernel::GridClear,
        Kernel::GridPosition,
        Kernel::GridGradient,
        Kernel::InitSampleEdges,
        Kernel::SampleEdges,
        Kernel::SampleNoise,
        Kernel::SampleSmooth,
        Kernel::SampleDensity,
        Kernel::SampleAdvect,
        Kernel::CheckLimits,
    ];

    /// Registry name, also the WGSL entry point
    pub fn name(self) -> &'static str {
        match self {
            Kernel::NodeNoise => "node_noise",
            Kernel::NodeDensity => "node_density",
            Kernel::NodeAdvect => "node_advect",
            Kernel::GridClear => "grid_clear",
            Kernel::GridPosition => "grid_position",
            Kernel::GridGradient => "grid_gradient",
            Kernel::InitSampleEdges => "init_sample_edges",
            Kernel::SampleEdges => "sample_edges",
            Kernel::SampleNoise => "sample_noise",
            Kernel::SampleSmooth => "sample_smooth",
            Kernel::SampleDensity => "sample_density",
            Kernel::SampleAdvect => "sample_advect",
            Kernel::CheckLimits => "check_limits",
        }
    }

    /// Buffers in binding order
    pub fn bindings(self) -> &'static [BindingSpec] {
        match self {
            Kernel::NodeNoise => NODE_PAIR,
            Kernel::NodeDensity => NODE_DENSITY_BINDINGS,
            Kernel::NodeAdvect => NODE_ADVECT_BINDINGS,
            Kernel::GridClear => GRID_CLEAR_BINDINGS,
            Kernel::GridPosition => GRID_POSITION_BINDINGS,
            Kernel::GridGradient => GRID_GRADIENT_BINDINGS,
            Kernel::InitSampleEdges => INIT_SAMPLE_BINDINGS,
            Kernel::SampleEdges | Kernel::SampleNoise | Kernel::SampleSmooth => SAMPLE_PAIR,
            Kernel::SampleDensity => SAMPLE_DENSITY_BINDINGS,
            Kernel::SampleAdvect => SAMPLE_ADVECT_BINDINGS,
            Kernel::CheckLimits => CHECK_LIMITS_BINDINGS,
        }
    }

    /// Kernel-specific uniforms in block order, after [`COMMON_UNIFORMS`]
    pub fn uniforms(self) -> &'static [UniformSpec] {
        match self {
            Kernel::NodeNoise => NODE_NOISE_UNIFORMS,
            Kernel::NodeDensity => NODE_DENSITY_UNIFORMS,
            Kernel::NodeAdvect => NODE_ADVECT_UNIFORMS,
            Kernel::GridClear => &[],
            Kernel::GridPosition | Kernel::GridGradient => GRID_UNIFORMS,
            Kernel::InitSampleEdges => INIT_SAMPLE_UNIFORMS,
            Kernel::SampleEdges => SAMPLE_EDGES_UNIFORMS,
            Kernel::SampleNoise => SAMPLE_NOISE_UNIFORMS,
            Kernel::SampleSmooth => SAMPLE_SMOOTH_UNIFORMS,
            Kernel::SampleDensity => SAMPLE_DENSITY_UNIFORMS,
            Kernel::SampleAdvect => SAMPLE_ADVECT_UNIFORMS,
            Kernel::CheckLimits => CHECK_LIMITS_UNIFORMS,
        }
    }

    /// Full uniform block: common uniforms followed by the kernel's own
    pub fn uniform_block(self) -> impl Iterator<Item = &'static UniformSpec> {
        COMMON_UNIFORMS.iter().chain(self.uniforms().iter())
    }
}

impl fmt::Display for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Key-value uniform set passed to a dispatch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Uniforms {
    values: Vec<(&'static str, UniformValue)>,
}

impl Uniforms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set (or replace) a value
    pub fn set(mut self, key: &'static str, value: UniformValue) -> Self {
        self.insert(key, value);
        self
    }

    pub fn float(self, key: &'static str, value: f32) -> Self {
        self.set(key, UniformValue::Float(value))
    }

    pub fn uint(self, key: &'static str, value: u32) -> Self {
        self.set(key, UniformValue::UInt(value))
    }

    pub fn insert(&mut self, key: &'static str, value: UniformValue) {
        match self.values.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.values.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<UniformValue> {
        self.values.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
    }

    pub fn get_float(&self, kernel: Kernel, key: &'static str) -> Result<f32> {
        match self.get(key) {
            Some(UniformValue::Float(v)) => Ok(v),
            Some(_) => Err(contract_error(kernel, key, "has the wrong type")),
            None => Err(contract_error(kernel, key, "is missing")),
        }
    }

    pub fn get_uint(&self, kernel: Kernel, key: &'static str) -> Result<u32> {
        match self.get(key) {
            Some(UniformValue::UInt(v)) => Ok(v),
            Some(_) => Err(contract_error(kernel, key, "has the wrong type")),
            None => Err(contract_error(kernel, key, "is missing")),
        }
    }

    /// Check the set against the kernel's contract: every key present with the
    /// right type, and nothing extra
    pub fn validate(&self, kernel: Kernel) -> Result<()> {
        for spec in kernel.uniform_block() {
            match self.get(spec.key) {
                None => return Err(contract_error(kernel, spec.key, "is missing")),
                Some(v) if v.kind() != spec.kind => {
                    return Err(contract_error(kernel, spec.key, "has the wrong type"));
                }
                Some(_) => {}
            }
        }
        if let Some((key, _)) = self
            .values
            .iter()
            .find(|(k, _)| !kernel.uniform_block().any(|s| s.key == *k))
        {
            return Err(contract_error(kernel, key, "is not part of the contract"));
        }
        Ok(())
    }

    /// Values in contract order as raw words, padded to a multiple of four
    /// words (16 bytes) for a uniform buffer
    pub fn packed(&self, kernel: Kernel) -> Result<Vec<u32>> {
        self.validate(kernel)?;
        let mut words: Vec<u32> = kernel
            .uniform_block()
            .filter_map(|spec| self.get(spec.key))
            .map(|v| v.bits())
            .collect();
        words.resize(words.len().div_ceil(4) * 4, 0);
        Ok(words)
    }
}

fn contract_error(kernel: Kernel, key: &str, problem: &'static str) -> BundleError {
    BundleError::UniformContract {
        kernel: kernel.name(),
        key: key.to_string(),
        problem,
    }
}

/// Placement and resolution of a density grid
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridSpec {
    /// Cells per axis
    pub dims: [u32; 3],
    /// World position of the corner of cell (0, 0, 0)
    pub origin: [f32; 3],
    pub cell_size: f32,
}

impl GridSpec {
    pub fn cell_count(&self) -> usize {
        self.dims.iter().map(|&d| d as usize).product()
    }

    /// Add the grid uniforms to a set
    pub fn apply(&self, uniforms: Uniforms) -> Uniforms {
        uniforms
            .uint("grid_x", self.dims[0])
            .uint("grid_y", self.dims[1])
            .uint("grid_z", self.dims[2])
            .float("origin_x", self.origin[0])
            .float("origin_y", self.origin[1])
            .float("origin_z", self.origin[2])
            .float("cell_size", self.cell_size)
    }

    /// Read the grid uniforms back out of a set
    pub fn from_uniforms(kernel: Kernel, uniforms: &Uniforms) -> Result<Self> {
        Ok(Self {
            dims: [
                uniforms.get_uint(kernel, "grid_x")?,
                uniforms.get_uint(kernel, "grid_y")?,
                uniforms.get_uint(kernel, "grid_z")?,
            ],
            origin: [
                uniforms.get_float(kernel, "origin_x")?,
                uniforms.get_float(kernel, "origin_y")?,
                uniforms.get_float(kernel, "origin_z")?,
            ],
            cell_size: uniforms.get_float(kernel, "cell_size")?,
        })
    }

    /// Integer cell coordinates of a world position, if inside the grid
    pub fn cell_of(&self, p: [f32; 3]) -> Option<[usize; 3]> {
        let mut cell = [0usize; 3];
        for axis in 0..3 {
            let t = ((p[axis] - self.origin[axis]) / self.cell_size).floor();
            if !(t >= 0.0 && t < self.dims[axis] as f32) {
                return None;
            }
            cell[axis] = t as usize;
        }
        Some(cell)
    }

    pub fn index(&self, cell: [usize; 3]) -> usize {
        let [x, y, _] = self.dims.map(|d| d as usize);
        cell[0] + x * (cell[1] + y * cell[2])
    }

    pub fn coords(&self, index: usize) -> [usize; 3] {
        let [x, y, _] = self.dims.map(|d| d as usize);
        [index % x, (index / x) % y, index / (x * y)]
    }
}
