//! Bundling state machine
//!
//! [`NetworkProcessor`] owns the geometry model, the compute device and the
//! node, edge and grid processors. Callers drive it by repeatedly calling
//! [`NetworkProcessor::process`] with the mode they want; every call performs
//! at most one iteration of the active phase.
//!
//! # Phases
//!
//! | Mode | Per call | Finishes when |
//! |------|----------|---------------|
//! | `Idle` | nothing | immediately |
//! | `NodeAdvect*` | one density/advect sweep over every layer | schedule limit |
//! | `NodeNoise` | one node jitter | after one call |
//! | `EdgeAdvect*` | resample, advect per layer pair, smooth, check limits | schedule limit |
//! | `EdgeNoise` | one polyline jitter and resample | after one call |
//!
//! Switching into `Idle` discards the bundled polylines and reseeds straight
//! ones. Node phases bump a node revision; edge work first rebuilds the edge
//! storage when it was built from an older revision.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::advection::{AdvectionProgress, Direction};
use crate::compute::ComputeDevice;
use crate::config::BundlingConfig;
use crate::edge_processor::{EdgeProcessor, LimitsReport};
use crate::error::Result;
use crate::grid_processor::{GridProcessor, Slab};
use crate::model::{NetworkInput, NetworkModel};
use crate::node_processor::NodeProcessor;
use crate::snapshot::BundleSnapshot;
use crate::types::{EdgeRecordLayout, NodeRecordLayout, POINT_FLOATS};

/// What [`NetworkProcessor::process`] works on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    #[default]
    Idle,
    NodeAdvectForward,
    NodeAdvectReverse,
    NodeNoise,
    EdgeAdvectForward,
    EdgeAdvectReverse,
    EdgeNoise,
}

impl ProcessingMode {
    /// Sweep direction of an advection mode
    pub fn direction(self) -> Option<Direction> {
        match self {
            ProcessingMode::NodeAdvectForward | ProcessingMode::EdgeAdvectForward => {
                Some(Direction::Forward)
            }
            ProcessingMode::NodeAdvectReverse | ProcessingMode::EdgeAdvectReverse => {
                Some(Direction::Reverse)
            }
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ProcessingMode::Idle => "idle",
            ProcessingMode::NodeAdvectForward => "node_advect_forward",
            ProcessingMode::NodeAdvectReverse => "node_advect_reverse",
            ProcessingMode::NodeNoise => "node_noise",
            ProcessingMode::EdgeAdvectForward => "edge_advect_forward",
            ProcessingMode::EdgeAdvectReverse => "edge_advect_reverse",
            ProcessingMode::EdgeNoise => "edge_noise",
        }
    }
}

impl fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Read-only counters of a [`NetworkProcessor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub node_count: usize,
    pub edge_count: usize,
    pub point_count: usize,
    pub grid_cells: usize,
    pub pruned_edges: usize,
    pub max_sample_points: usize,
}

/// Drives the bundling phases over an injected compute device
pub struct NetworkProcessor<D: ComputeDevice> {
    device: D,
    config: BundlingConfig,
    model: NetworkModel,
    nodes: NodeProcessor,
    edges: EdgeProcessor,
    grid: GridProcessor,
    node_progress: AdvectionProgress,
    edge_progress: AdvectionProgress,
    mode: ProcessingMode,
    action_finished: bool,
    node_revision: u64,
    edge_revision: u64,
    limits: LimitsReport,
}

impl<D: ComputeDevice> NetworkProcessor<D> {
    /// Lay out `input` and upload it to `device`
    pub fn from_input(device: D, input: &NetworkInput, config: BundlingConfig) -> Result<Self> {
        config.validate()?;
        let model = NetworkModel::build(input, &config)?;
        Self::new(device, model, config)
    }

    /// Upload an already built model to `device`
    pub fn new(mut device: D, model: NetworkModel, config: BundlingConfig) -> Result<Self> {
        config.validate()?;
        let mut nodes = NodeProcessor::new(config.noise_seed);
        nodes.set_data(&mut device, &model)?;
        let mut edges = Self::edge_processor(&config);
        edges.set_data(&mut device, &model)?;
        Self::assemble(device, model, config, nodes, edges)
    }

    /// Resume from a snapshot
    pub fn restore(
        snapshot: &BundleSnapshot,
        config: BundlingConfig,
        mut device: D,
    ) -> Result<Self> {
        config.validate()?;
        let model = snapshot.model(&config)?;

        let mut nodes = NodeProcessor::new(config.noise_seed);
        let records: Vec<f32> = snapshot.node_data.iter().flatten().copied().collect();
        nodes.set_records(&mut device, NodeRecordLayout::new(snapshot.num_classes), &records)?;

        let mut edges = Self::edge_processor(&config);
        edges.restore(
            &mut device,
            EdgeRecordLayout::new(snapshot.num_classes),
            snapshot.max_sample_points,
            &snapshot.edge_metadata,
            &snapshot.edge_samples,
        )?;
        tracing::info!(
            nodes = model.node_count(),
            edges = model.edge_count(),
            "restored snapshot"
        );
        Self::assemble(device, model, config, nodes, edges)
    }

    fn edge_processor(config: &BundlingConfig) -> EdgeProcessor {
        EdgeProcessor::new(
            config.sample_length,
            config.max_edges_per_buffer,
            config.noise_seed ^ 0xa5a5_a5a5,
        )
    }

    fn assemble(
        mut device: D,
        model: NetworkModel,
        config: BundlingConfig,
        nodes: NodeProcessor,
        mut edges: EdgeProcessor,
    ) -> Result<Self> {
        let grid = GridProcessor::new(&mut device, &model, config.cell_size)?;
        let limits = edges.check_limits(&mut device, false)?;
        Ok(Self {
            node_progress: AdvectionProgress::new(&config.node_annealing, Direction::Forward),
            edge_progress: AdvectionProgress::new(&config.edge_annealing, Direction::Forward),
            device,
            config,
            model,
            nodes,
            edges,
            grid,
            mode: ProcessingMode::Idle,
            action_finished: true,
            node_revision: 0,
            edge_revision: 0,
            limits,
        })
    }

    pub fn mode(&self) -> ProcessingMode {
        self.mode
    }

    /// Whether the current mode has nothing left to do
    pub fn action_finished(&self) -> bool {
        self.action_finished
    }

    /// Switch modes. Entering `Idle` reseeds straight polylines; entering an
    /// advection mode restarts its schedule.
    pub fn set_mode(&mut self, mode: ProcessingMode) -> Result<()> {
        if mode == self.mode {
            return Ok(());
        }
        tracing::info!(from = %self.mode, to = %mode, "switching mode");
        match mode {
            ProcessingMode::Idle => {
                self.ensure_edges_fresh()?;
                self.edges.init_sample_edge(&mut self.device)?;
                self.limits = self.edges.check_limits(&mut self.device, true)?;
            }
            ProcessingMode::NodeAdvectForward | ProcessingMode::NodeAdvectReverse => {
                if let Some(direction) = mode.direction() {
                    self.node_progress.reset_with(direction);
                }
            }
            ProcessingMode::EdgeAdvectForward | ProcessingMode::EdgeAdvectReverse => {
                if let Some(direction) = mode.direction() {
                    self.edge_progress.reset_with(direction);
                }
            }
            ProcessingMode::NodeNoise | ProcessingMode::EdgeNoise => {}
        }
        self.mode = mode;
        self.action_finished = mode == ProcessingMode::Idle;
        Ok(())
    }

    /// Switch to `mode` if needed and run one step of it. Returns whether
    /// the mode has finished.
    pub fn process(&mut self, mode: ProcessingMode) -> Result<bool> {
        self.set_mode(mode)?;
        if self.action_finished {
            return Ok(true);
        }
        match mode {
            ProcessingMode::Idle => self.action_finished = true,
            ProcessingMode::NodeAdvectForward | ProcessingMode::NodeAdvectReverse => {
                self.node_advect_iteration()?;
            }
            ProcessingMode::NodeNoise => {
                self.nodes.node_noise(
                    &mut self.device,
                    self.config.sample_length,
                    self.config.node_noise_strength,
                )?;
                self.node_revision += 1;
                self.action_finished = true;
            }
            ProcessingMode::EdgeAdvectForward | ProcessingMode::EdgeAdvectReverse => {
                self.edge_advect_iteration()?;
            }
            ProcessingMode::EdgeNoise => {
                self.ensure_edges_fresh()?;
                self.edges.sample_noise(
                    &mut self.device,
                    self.config.edge_noise_strength * self.config.sample_length,
                    self.config.noise_moves_endpoints,
                )?;
                self.edges.sample_edges(&mut self.device)?;
                self.limits = self.edges.check_limits(&mut self.device, true)?;
                self.action_finished = true;
            }
        }
        Ok(self.action_finished)
    }

    /// Process `mode` until it finishes or `max_steps` calls were made.
    /// Returns the number of calls.
    pub fn run(&mut self, mode: ProcessingMode, max_steps: usize) -> Result<usize> {
        let mut steps = 0;
        while steps < max_steps {
            steps += 1;
            if self.process(mode)? {
                break;
            }
        }
        Ok(steps)
    }

    fn node_advect_iteration(&mut self) -> Result<()> {
        let radius = self.config.density_radius * self.node_progress.bandwidth_reduction();
        let direction = self.node_progress.direction().sign();
        for layer in 0..self.model.layer_count() {
            let range = self.model.layer_nodes(layer);
            if range.is_empty() {
                continue;
            }
            self.grid.place(Slab::Layer(layer))?;
            self.grid.clear_buffer(&mut self.device)?;
            self.grid.calculate_position(&mut self.device)?;
            self.grid
                .calculate_node_density(&mut self.device, &self.nodes, range.clone(), radius)?;
            self.grid.calculate_gradient(&mut self.device)?;
            self.grid.node_advect(
                &mut self.device,
                &mut self.nodes,
                range,
                self.config.advect_strength,
                direction,
            )?;
        }
        self.node_revision += 1;
        self.node_progress.iterate();
        self.action_finished = self.node_progress.limit_reached();
        tracing::debug!(
            iteration = self.node_progress.iteration(),
            bandwidth = self.node_progress.bandwidth(),
            "node advection step"
        );
        Ok(())
    }

    fn edge_advect_iteration(&mut self) -> Result<()> {
        self.ensure_edges_fresh()?;
        let radius = self.config.density_radius * self.edge_progress.bandwidth_reduction();
        let direction = self.edge_progress.direction().sign();

        self.edges.sample_edges(&mut self.device)?;
        for layer in 0..self.model.layer_count().saturating_sub(1) {
            let partitions: Vec<usize> = self.edges.layer_partitions(layer).collect();
            if partitions.is_empty() {
                continue;
            }
            self.grid.place(Slab::LayerPair(layer))?;
            self.grid.clear_buffer(&mut self.device)?;
            self.grid.calculate_position(&mut self.device)?;
            self.grid
                .calculate_sample_density(&mut self.device, &self.edges, &partitions, radius)?;
            self.grid.calculate_gradient(&mut self.device)?;
            self.grid.sample_advect(
                &mut self.device,
                &mut self.edges,
                &partitions,
                self.config.advect_strength,
                direction,
            )?;
        }
        self.edges
            .sample_smooth(&mut self.device, &self.edge_progress, self.config.smooth_radius)?;
        self.limits = self.edges.check_limits(&mut self.device, true)?;

        self.edge_progress.iterate();
        self.action_finished = self.edge_progress.limit_reached();
        tracing::debug!(
            iteration = self.edge_progress.iteration(),
            bandwidth = self.edge_progress.bandwidth(),
            similarity = self.edge_progress.similarity(),
            points = self.limits.point_count,
            "edge advection step"
        );
        Ok(())
    }

    /// Whether the edge storage was built from older node positions
    pub fn edges_stale(&self) -> bool {
        self.edge_revision != self.node_revision
    }

    fn ensure_edges_fresh(&mut self) -> Result<()> {
        if self.edges_stale() {
            self.reset_edges()?;
        }
        Ok(())
    }

    /// Read node positions back, update the model and rebuild the edge and
    /// grid storage from it
    pub fn reset_edges(&mut self) -> Result<()> {
        let positions = self.nodes.read_nodes_from_buffer(&mut self.device)?;
        self.model.update_node_positions(&positions)?;

        self.edges.delete(&mut self.device);
        self.edges.set_data(&mut self.device, &self.model)?;

        let grid = GridProcessor::new(&mut self.device, &self.model, self.config.cell_size)?;
        std::mem::replace(&mut self.grid, grid).delete(&mut self.device);

        self.limits = self.edges.check_limits(&mut self.device, false)?;
        self.edge_revision = self.node_revision;
        tracing::info!(revision = self.node_revision, "rebuilt edges from node positions");
        Ok(())
    }

    pub fn counters(&self) -> Counters {
        Counters {
            node_count: self.model.node_count(),
            edge_count: self.edges.edge_count(),
            point_count: self.limits.point_count,
            grid_cells: self.grid.cell_count(),
            pruned_edges: self.model.pruned_edges(),
            max_sample_points: self.edges.max_sample_points(),
        }
    }

    pub fn point_count(&self) -> usize {
        self.limits.point_count
    }

    pub fn edge_count(&self) -> usize {
        self.edges.edge_count()
    }

    pub fn grid_cell_count(&self) -> usize {
        self.grid.cell_count()
    }

    pub fn pruned_edge_count(&self) -> usize {
        self.model.pruned_edges()
    }

    /// Result of the most recent limits check
    pub fn limits(&self) -> LimitsReport {
        self.limits
    }

    pub fn node_progress(&self) -> &AdvectionProgress {
        &self.node_progress
    }

    pub fn edge_progress(&self) -> &AdvectionProgress {
        &self.edge_progress
    }

    pub fn model(&self) -> &NetworkModel {
        &self.model
    }

    pub fn config(&self) -> &BundlingConfig {
        &self.config
    }

    pub fn edges(&self) -> &EdgeProcessor {
        &self.edges
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Current node positions (reads the device)
    pub fn node_positions(&mut self) -> Result<Vec<[f32; 3]>> {
        self.nodes.read_nodes_from_buffer(&mut self.device)
    }

    /// Live points of every edge (reads the device)
    pub fn polylines(&mut self) -> Result<Vec<Vec<[f32; 3]>>> {
        self.edges.polylines(&mut self.device)
    }

    /// Capture the current node records and polylines
    pub fn snapshot(&mut self) -> Result<BundleSnapshot> {
        let node_layout = self.nodes.layout();
        let node_data = self
            .nodes
            .read_records(&mut self.device)?
            .chunks_exact(node_layout.stride)
            .map(<[f32]>::to_vec)
            .collect();

        let stride = self.edges.layout().stride;
        let slot = self.edges.max_sample_points() * POINT_FLOATS;
        let split = |data: Vec<f32>, size: usize| -> Vec<Vec<f32>> {
            data.chunks_exact(size).map(<[f32]>::to_vec).collect()
        };
        let edge_metadata = self
            .edges
            .read_all_metadata(&mut self.device)?
            .into_iter()
            .map(|data| split(data, stride))
            .collect();
        let edge_samples = self
            .edges
            .read_all_samples(&mut self.device)?
            .into_iter()
            .map(|data| split(data, slot))
            .collect();

        Ok(BundleSnapshot {
            layer_sizes: self.model.layer_sizes().to_vec(),
            node_data,
            edge_metadata,
            edge_samples,
            max_sample_points: self.edges.max_sample_points(),
            num_classes: self.model.num_classes(),
            pruned_edges: self.model.pruned_edges(),
        })
    }

    /// Release every device buffer and hand the device back
    pub fn delete(mut self) -> D {
        self.nodes.delete(&mut self.device);
        self.edges.delete(&mut self.device);
        self.grid.delete(&mut self.device);
        self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::HostDevice;

    fn processor(sizes: &[usize]) -> NetworkProcessor<HostDevice> {
        NetworkProcessor::from_input(
            HostDevice::new(),
            &NetworkInput::uniform(sizes),
            BundlingConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn starts_idle_with_straight_edges() {
        let processor = processor(&[4, 3]);
        assert_eq!(processor.mode(), ProcessingMode::Idle);
        assert!(processor.action_finished());
        let counters = processor.counters();
        assert_eq!(counters.edge_count, 12);
        assert_eq!(counters.point_count, 24);
        assert_eq!(counters.node_count, 7);
        assert_eq!(counters.pruned_edges, 0);
        assert!(counters.grid_cells > 0);
    }

    #[test]
    fn entering_advect_resets_the_schedule() {
        let mut processor = processor(&[3, 3]);
        processor.process(ProcessingMode::EdgeAdvectForward).unwrap();
        processor.process(ProcessingMode::EdgeAdvectForward).unwrap();
        assert_eq!(processor.edge_progress().iteration(), 2);

        processor.set_mode(ProcessingMode::EdgeAdvectReverse).unwrap();
        assert_eq!(processor.edge_progress().iteration(), 0);
        assert_eq!(processor.edge_progress().direction(), Direction::Reverse);
        assert!(!processor.action_finished());
    }

    #[test]
    fn noise_modes_finish_after_one_call() {
        let mut processor = processor(&[3, 2]);
        assert!(processor.process(ProcessingMode::NodeNoise).unwrap());
        assert!(processor.edges_stale());
        assert!(processor.process(ProcessingMode::EdgeNoise).unwrap());
        assert!(!processor.edges_stale());
        assert!(processor.process(ProcessingMode::EdgeNoise).unwrap());
    }

    #[test]
    fn node_advection_runs_to_its_limit() {
        let mut processor = processor(&[4, 4]);
        let steps = processor.run(ProcessingMode::NodeAdvectForward, 1000).unwrap();
        assert_eq!(steps, 22);
        assert!(processor.action_finished());
        assert!(processor.node_progress().limit_reached());
        assert!(processor.edges_stale());
    }

    #[test]
    fn idle_reseeds_from_moved_nodes() {
        let mut processor = processor(&[3, 3]);
        processor.process(ProcessingMode::NodeNoise).unwrap();
        let moved = processor.node_positions().unwrap();

        processor.process(ProcessingMode::Idle).unwrap();
        assert!(!processor.edges_stale());
        let polylines = processor.polylines().unwrap();
        for (polyline, edge) in polylines.iter().zip(processor.model().edges()) {
            assert_eq!(polyline[0], moved[edge.source]);
            assert_eq!(*polyline.last().unwrap(), moved[edge.target]);
        }
    }

    #[test]
    fn failed_reseed_keeps_the_previous_mode() {
        let mut processor = processor(&[3, 3]);
        processor.process(ProcessingMode::NodeNoise).unwrap();
        let moved = processor.node_positions().unwrap();

        // A device that knows none of the buffers fails the node readback
        let device = std::mem::replace(&mut processor.device, HostDevice::new());
        assert!(processor.process(ProcessingMode::Idle).is_err());
        assert_eq!(processor.mode(), ProcessingMode::NodeNoise);
        assert!(processor.edges_stale());

        processor.device = device;
        assert!(processor.process(ProcessingMode::Idle).unwrap());
        assert_eq!(processor.mode(), ProcessingMode::Idle);
        assert!(!processor.edges_stale());
        let polylines = processor.polylines().unwrap();
        for (polyline, edge) in polylines.iter().zip(processor.model().edges()) {
            assert_eq!(polyline[0], moved[edge.source]);
            assert_eq!(*polyline.last().unwrap(), moved[edge.target]);
        }
    }

    #[test]
    fn edge_advection_keeps_endpoints_on_nodes() {
        let mut processor = processor(&[3, 2]);
        processor.run(ProcessingMode::EdgeAdvectForward, 5).unwrap();
        let nodes = processor.node_positions().unwrap();
        let polylines = processor.polylines().unwrap();
        let capacity = processor.counters().max_sample_points;
        for (polyline, edge) in polylines.iter().zip(processor.model().edges()) {
            assert!(polyline.len() >= 2 && polyline.len() <= capacity);
            assert_eq!(polyline[0], nodes[edge.source]);
            assert_eq!(*polyline.last().unwrap(), nodes[edge.target]);
        }
    }

    #[test]
    fn snapshot_restores_the_same_geometry() {
        let mut processor = processor(&[3, 2]);
        processor.run(ProcessingMode::EdgeAdvectForward, 3).unwrap();
        let snapshot = processor.snapshot().unwrap();
        let before = processor.polylines().unwrap();

        let mut restored =
            NetworkProcessor::restore(&snapshot, BundlingConfig::default(), HostDevice::new())
                .unwrap();
        assert_eq!(restored.polylines().unwrap(), before);
        assert_eq!(restored.counters().point_count, processor.counters().point_count);
        assert_eq!(restored.snapshot().unwrap(), snapshot);
    }

    #[test]
    fn delete_frees_the_device() {
        let processor = processor(&[3, 3, 2]);
        let device = processor.delete();
        assert_eq!(device.stats().live_buffers, 0);
    }

    #[test]
    fn empty_network_is_processable() {
        let mut processor = processor(&[]);
        assert_eq!(processor.counters().edge_count, 0);
        assert!(processor.process(ProcessingMode::NodeAdvectForward).is_ok());
        assert!(processor.process(ProcessingMode::EdgeAdvectForward).is_ok());
        assert!(processor.process(ProcessingMode::Idle).unwrap());
    }
}
