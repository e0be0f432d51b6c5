//! Geometry model of a layered network
//!
//! Nodes of every layer are laid out on a near-square grid in a plane
//! perpendicular to z, with layers stacked along z. Edges connect every node
//! of a layer to every node of the next layer; edges whose weighted
//! importance falls below the prune threshold are dropped.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::config::BundlingConfig;
use crate::error::{BundleError, Result};
use crate::importance::relevant_mean;
use crate::types::{EdgeRecordLayout, NodeRecordLayout};

/// Logical shape of a trained network and its importance data
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkInput {
    /// Nodes per layer
    pub layer_sizes: Vec<usize>,
    /// Class importance values per node, in global node order (may be empty)
    #[serde(default)]
    pub node_features: Vec<Vec<f32>>,
    /// Per layer pair, edge values indexed `source * next_layer_size + target`
    /// (empty = every edge has value 1.0)
    #[serde(default)]
    pub edge_importance: Vec<Vec<f32>>,
    /// Per layer pair and edge, class importance values (empty = derived from
    /// the endpoint nodes)
    #[serde(default)]
    pub edge_class_importance: Vec<Vec<Vec<f32>>>,
}

impl NetworkInput {
    /// A network with the given layer sizes and no importance data
    pub fn uniform(layer_sizes: &[usize]) -> Self {
        Self {
            layer_sizes: layer_sizes.to_vec(),
            ..Default::default()
        }
    }

    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Number of class values per node, checked for consistency
    pub fn num_classes(&self) -> Result<usize> {
        let node_count: usize = self.layer_sizes.iter().sum();
        if self.node_features.is_empty() {
            return Ok(0);
        }
        if self.node_features.len() != node_count {
            return Err(BundleError::InvalidInput(format!(
                "{} node feature rows for {node_count} nodes",
                self.node_features.len()
            )));
        }
        let classes = self.node_features[0].len();
        if self.node_features.iter().any(|f| f.len() != classes) {
            return Err(BundleError::InvalidInput(
                "node feature rows differ in length".to_string(),
            ));
        }
        Ok(classes)
    }

    fn validate_edges(&self) -> Result<()> {
        let pairs = self.layer_sizes.len().saturating_sub(1);
        for (what, len) in [
            ("edge_importance", self.edge_importance.len()),
            ("edge_class_importance", self.edge_class_importance.len()),
        ] {
            if len != 0 && len != pairs {
                return Err(BundleError::InvalidInput(format!(
                    "{what} has {len} layer pairs, network has {pairs}"
                )));
            }
        }
        for pair in 0..pairs {
            let expected = self.layer_sizes[pair] * self.layer_sizes[pair + 1];
            if let Some(values) = self.edge_importance.get(pair) {
                if values.len() != expected {
                    return Err(BundleError::InvalidInput(format!(
                        "layer pair {pair}: {} edge values, expected {expected}",
                        values.len()
                    )));
                }
            }
            if let Some(values) = self.edge_class_importance.get(pair) {
                if values.len() != expected {
                    return Err(BundleError::InvalidInput(format!(
                        "layer pair {pair}: {} edge class rows, expected {expected}",
                        values.len()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// A laid-out node
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub layer: usize,
    pub position: [f32; 3],
    /// Mean of the relevant class values (1.0 without class data)
    pub importance: f32,
    pub classes: Vec<f32>,
}

/// An edge between consecutive layers that survived pruning
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    /// Index of the source layer
    pub layer: usize,
    /// `source * next_layer_size + target` within the layer pair
    pub local_id: usize,
    /// Global node index of the source
    pub source: usize,
    /// Global node index of the target
    pub target: usize,
    pub importance: f32,
    pub classes: Vec<f32>,
}

/// Axis-aligned bounding volume
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl Bounds {
    pub fn extent(&self) -> [f32; 3] {
        [
            self.max[0] - self.min[0],
            self.max[1] - self.min[1],
            self.max[2] - self.min[2],
        ]
    }
}

/// Node coordinates and the filtered edge list of a layered network
#[derive(Debug, Clone)]
pub struct NetworkModel {
    layer_sizes: Vec<usize>,
    layer_offsets: Vec<usize>,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    edge_layer_offsets: Vec<usize>,
    pruned_edges: usize,
    num_classes: usize,
    layer_width: f32,
    layer_height: f32,
    layer_distance: f32,
}

impl NetworkModel {
    /// Lay out the network and generate its filtered edge set
    pub fn build(input: &NetworkInput, config: &BundlingConfig) -> Result<Self> {
        let num_classes = input.num_classes()?;
        input.validate_edges()?;

        let importance_of = config.importance_mode.resolve();
        let relevant = &config.relevant_classes;
        let layer_offsets = offsets(&input.layer_sizes);
        let layer_count = input.layer_sizes.len();

        let mut nodes = Vec::with_capacity(layer_offsets[layer_count]);
        for (layer, &size) in input.layer_sizes.iter().enumerate() {
            let z = layer_z(layer, layer_count, config.layer_distance);
            for i in 0..size {
                let [x, y] = grid_position(i, size, config.layer_width, config.layer_height);
                let classes = input
                    .node_features
                    .get(layer_offsets[layer] + i)
                    .cloned()
                    .unwrap_or_default();
                nodes.push(Node {
                    layer,
                    position: [x, y, z],
                    importance: relevant_mean(&classes, relevant),
                    classes,
                });
            }
        }

        let mut edges = Vec::new();
        let mut pruned_edges = 0;
        for layer in 0..layer_count.saturating_sub(1) {
            let next = input.layer_sizes[layer + 1];
            for s in 0..input.layer_sizes[layer] {
                for t in 0..next {
                    let local_id = s * next + t;
                    let source = layer_offsets[layer] + s;
                    let target = layer_offsets[layer + 1] + t;
                    let value = input
                        .edge_importance
                        .get(layer)
                        .map_or(1.0, |values| values[local_id]);
                    let classes = match input.edge_class_importance.get(layer) {
                        Some(rows) => rows[local_id].clone(),
                        None => endpoint_mean(&nodes[source].classes, &nodes[target].classes),
                    };
                    let importance = importance_of(value, &classes, relevant);
                    let endpoint_weight =
                        (nodes[source].importance + nodes[target].importance) / 2.0;
                    if importance * endpoint_weight < config.prune_threshold {
                        pruned_edges += 1;
                        continue;
                    }
                    edges.push(Edge {
                        layer,
                        local_id,
                        source,
                        target,
                        importance,
                        classes,
                    });
                }
            }
        }

        if pruned_edges > 0 {
            tracing::info!(pruned_edges, kept = edges.len(), "pruned low-importance edges");
        }

        Ok(Self::from_parts(
            input.layer_sizes.clone(),
            nodes,
            edges,
            pruned_edges,
            num_classes,
            config,
        ))
    }

    /// Assemble a model from already laid-out nodes and filtered edges.
    /// Edges must be sorted by layer.
    pub fn from_parts(
        layer_sizes: Vec<usize>,
        nodes: Vec<Node>,
        edges: Vec<Edge>,
        pruned_edges: usize,
        num_classes: usize,
        config: &BundlingConfig,
    ) -> Self {
        let layer_offsets = offsets(&layer_sizes);
        let pairs = layer_sizes.len().saturating_sub(1);
        let mut edge_layer_offsets = vec![0; pairs + 1];
        for edge in &edges {
            edge_layer_offsets[edge.layer + 1] += 1;
        }
        for i in 0..pairs {
            edge_layer_offsets[i + 1] += edge_layer_offsets[i];
        }
        Self {
            layer_sizes,
            layer_offsets,
            nodes,
            edges,
            edge_layer_offsets,
            pruned_edges,
            num_classes,
            layer_width: config.layer_width,
            layer_height: config.layer_height,
            layer_distance: config.layer_distance,
        }
    }

    pub fn layer_sizes(&self) -> &[usize] {
        &self.layer_sizes
    }

    pub fn layer_count(&self) -> usize {
        self.layer_sizes.len()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn pruned_edges(&self) -> usize {
        self.pruned_edges
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn layer_distance(&self) -> f32 {
        self.layer_distance
    }

    /// Global node indices of a layer
    pub fn layer_nodes(&self, layer: usize) -> Range<usize> {
        self.layer_offsets[layer]..self.layer_offsets[layer + 1]
    }

    /// Edges leaving `layer`
    pub fn layer_edges(&self, layer: usize) -> &[Edge] {
        match self.edge_layer_offsets.get(layer + 1) {
            Some(&end) => &self.edges[self.edge_layer_offsets[layer]..end],
            None => &[],
        }
    }

    /// z coordinate of a layer plane
    pub fn layer_z(&self, layer: usize) -> f32 {
        layer_z(layer, self.layer_count(), self.layer_distance)
    }

    /// Largest distance between nodes of consecutive layers, i.e. the length
    /// of the longest possible edge
    pub fn max_distance(&self) -> f32 {
        let mut max = 0.0f32;
        for layer in 0..self.layer_count().saturating_sub(1) {
            for a in &self.nodes[self.layer_nodes(layer)] {
                for b in &self.nodes[self.layer_nodes(layer + 1)] {
                    max = max.max(distance(a.position, b.position));
                }
            }
        }
        max
    }

    /// Bounding volume of the layer boxes and every node
    pub fn bounds(&self) -> Bounds {
        let half = [self.layer_width / 2.0, self.layer_height / 2.0];
        let z_first = self.layer_z(0);
        let z_last = self.layer_z(self.layer_count().saturating_sub(1));
        let mut bounds = Bounds {
            min: [-half[0], -half[1], z_first.min(z_last)],
            max: [half[0], half[1], z_first.max(z_last)],
        };
        for node in &self.nodes {
            for axis in 0..3 {
                bounds.min[axis] = bounds.min[axis].min(node.position[axis]);
                bounds.max[axis] = bounds.max[axis].max(node.position[axis]);
            }
        }
        bounds
    }

    /// Node records for upload, one `layout.stride` record per node
    pub fn node_records(&self, layout: &NodeRecordLayout) -> Vec<f32> {
        self.nodes
            .iter()
            .flat_map(|n| layout.pack(n.position, n.importance, &n.classes))
            .collect()
    }

    /// Metadata record of an edge
    pub fn edge_record(
        &self,
        edge: &Edge,
        global_id: usize,
        layout: &EdgeRecordLayout,
    ) -> Vec<f32> {
        let mut record = vec![0.0; layout.stride];
        let source = &self.nodes[edge.source];
        let target = &self.nodes[edge.target];
        record[EdgeRecordLayout::LAYER] = edge.layer as f32;
        record[EdgeRecordLayout::LOCAL_ID] = edge.local_id as f32;
        record[EdgeRecordLayout::IMPORTANCE] = edge.importance;
        record[EdgeRecordLayout::GLOBAL_ID] = global_id as f32;
        record[EdgeRecordLayout::START..EdgeRecordLayout::START + 3]
            .copy_from_slice(&source.position);
        record[EdgeRecordLayout::START + 3] = source.importance;
        record[EdgeRecordLayout::END..EdgeRecordLayout::END + 3].copy_from_slice(&target.position);
        record[EdgeRecordLayout::END + 3] = target.importance;
        let n = edge.classes.len().min(layout.num_classes);
        record[EdgeRecordLayout::CLASSES..EdgeRecordLayout::CLASSES + n]
            .copy_from_slice(&edge.classes[..n]);
        record
    }

    /// Replace node coordinates with positions read back from the device
    pub fn update_node_positions(&mut self, positions: &[[f32; 3]]) -> Result<()> {
        if positions.len() != self.nodes.len() {
            return Err(BundleError::InvalidInput(format!(
                "{} positions for {} nodes",
                positions.len(),
                self.nodes.len()
            )));
        }
        for (node, position) in self.nodes.iter_mut().zip(positions) {
            node.position = *position;
        }
        Ok(())
    }
}

fn offsets(sizes: &[usize]) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(sizes.len() + 1);
    let mut total = 0;
    offsets.push(0);
    for size in sizes {
        total += size;
        offsets.push(total);
    }
    offsets
}

fn layer_z(layer: usize, layer_count: usize, layer_distance: f32) -> f32 {
    let center = layer_count.saturating_sub(1) as f32 / 2.0;
    (layer as f32 - center) * layer_distance
}

/// Position of node `i` of `n` on a near-square grid centered on the origin
fn grid_position(i: usize, n: usize, width: f32, height: f32) -> [f32; 2] {
    let cols = (n as f32).sqrt().ceil().max(1.0) as usize;
    let rows = n.div_ceil(cols).max(1);
    let (col, row) = (i % cols, i / cols);
    [axis_position(col, cols, width), axis_position(row, rows, height)]
}

fn axis_position(index: usize, count: usize, extent: f32) -> f32 {
    if count <= 1 {
        0.0
    } else {
        -extent / 2.0 + index as f32 * extent / (count - 1) as f32
    }
}

fn endpoint_mean(a: &[f32], b: &[f32]) -> Vec<f32> {
    a.iter().zip(b).map(|(x, y)| (x + y) / 2.0).collect()
}

pub(crate) fn distance(a: [f32; 3], b: [f32; 3]) -> f32 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2)).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(sizes: &[usize]) -> NetworkModel {
        NetworkModel::build(&NetworkInput::uniform(sizes), &BundlingConfig::default()).unwrap()
    }

    #[test]
    fn fully_connected_pair_has_all_edges() {
        let model = build(&[4, 3]);
        assert_eq!(model.node_count(), 7);
        assert_eq!(model.edge_count(), 12);
        assert_eq!(model.pruned_edges(), 0);
        assert_eq!(model.layer_edges(0).len(), 12);
    }

    #[test]
    fn layers_stack_along_z() {
        let model = build(&[2, 2, 2]);
        assert_eq!(model.layer_z(0), -5.0);
        assert_eq!(model.layer_z(1), 0.0);
        assert_eq!(model.layer_z(2), 5.0);
        assert!(model.nodes()[model.layer_nodes(2)].iter().all(|n| n.position[2] == 5.0));
    }

    #[test]
    fn single_node_layer_sits_at_center() {
        let model = build(&[1, 5]);
        let node = &model.nodes()[0];
        assert_eq!(node.position[0], 0.0);
        assert_eq!(node.position[1], 0.0);
        assert!(node.position.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn degenerate_networks_are_valid() {
        let empty = build(&[]);
        assert_eq!(empty.node_count(), 0);
        assert_eq!(empty.edge_count(), 0);
        assert_eq!(empty.max_distance(), 0.0);

        let single = build(&[3]);
        assert_eq!(single.edge_count(), 0);
        assert!(single.bounds().extent().iter().all(|v| v.is_finite()));

        let hollow = build(&[2, 0, 2]);
        assert_eq!(hollow.edge_count(), 0);
        assert!(hollow.layer_edges(1).is_empty());
    }

    #[test]
    fn grid_fills_the_layer_box() {
        let model = build(&[4]);
        let xs: Vec<f32> = model.nodes().iter().map(|n| n.position[0]).collect();
        assert_eq!(xs, vec![-5.0, 5.0, -5.0, 5.0]);
    }

    #[test]
    fn prune_threshold_drops_weak_edges() {
        let mut input = NetworkInput::uniform(&[2, 2]);
        input.edge_importance = vec![vec![0.9, 0.1, 0.5, 0.05]];
        let config = BundlingConfig {
            prune_threshold: 0.2,
            importance_mode: crate::importance::ImportanceMode::Edge,
            ..Default::default()
        };
        let model = NetworkModel::build(&input, &config).unwrap();
        assert_eq!(model.edge_count(), 2);
        assert_eq!(model.pruned_edges(), 2);
        let kept: Vec<usize> = model.edges().iter().map(|e| e.local_id).collect();
        assert_eq!(kept, vec![0, 2]);
    }

    #[test]
    fn endpoint_weight_enters_pruning() {
        let mut input = NetworkInput::uniform(&[1, 2]);
        input.node_features = vec![vec![1.0], vec![1.0], vec![0.0]];
        let config = BundlingConfig {
            prune_threshold: 0.1,
            importance_mode: crate::importance::ImportanceMode::Edge,
            ..Default::default()
        };
        let model = NetworkModel::build(&input, &config).unwrap();
        // second target has importance 0, so its edge weighs 1.0 * 0.5
        assert_eq!(model.edge_count(), 2);

        let strict = BundlingConfig {
            prune_threshold: 0.6,
            ..config
        };
        let model = NetworkModel::build(&input, &strict).unwrap();
        assert_eq!(model.edge_count(), 1);
        assert_eq!(model.pruned_edges(), 1);
    }

    #[test]
    fn mismatched_features_are_rejected() {
        let mut input = NetworkInput::uniform(&[2, 2]);
        input.node_features = vec![vec![1.0]; 3];
        assert!(matches!(
            NetworkModel::build(&input, &BundlingConfig::default()),
            Err(BundleError::InvalidInput(_))
        ));
    }

    #[test]
    fn max_distance_spans_opposite_corners() {
        let model = build(&[4, 4]);
        let diagonal = (10.0f32 * 10.0 + 10.0 * 10.0 + 5.0 * 5.0).sqrt();
        assert!((model.max_distance() - diagonal).abs() < 1e-4);
    }

    #[test]
    fn edge_record_carries_endpoints() {
        let model = build(&[1, 1]);
        let layout = EdgeRecordLayout::new(0);
        let record = model.edge_record(&model.edges()[0], 0, &layout);
        assert_eq!(record.len(), 12);
        assert_eq!(&record[4..7], &model.nodes()[0].position);
        assert_eq!(&record[8..11], &model.nodes()[1].position);
    }

    #[test]
    fn update_positions_checks_length() {
        let mut model = build(&[2]);
        assert!(model.update_node_positions(&[[0.0; 3]]).is_err());
        model.update_node_positions(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]).unwrap();
        assert_eq!(model.nodes()[1].position, [4.0, 5.0, 6.0]);
    }
}
