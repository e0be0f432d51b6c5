//! Persisted bundling state
//!
//! A [`BundleSnapshot`] holds everything needed to render the bundled
//! geometry or to resume bundling: node records, and per edge partition the
//! metadata records and raw polyline slots.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::compute::kernels::live_count;
use crate::config::BundlingConfig;
use crate::error::{BundleError, Result};
use crate::model::{Edge, NetworkModel, Node};
use crate::types::{EdgeRecordLayout, NodeRecordLayout, POINT_FLOATS};

/// Serialized bundling result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleSnapshot {
    pub layer_sizes: Vec<usize>,
    /// One node record per node, in global node order
    pub node_data: Vec<Vec<f32>>,
    /// Per partition, one metadata record per edge
    pub edge_metadata: Vec<Vec<Vec<f32>>>,
    /// Per partition, one polyline slot of `max_sample_points` points per edge
    pub edge_samples: Vec<Vec<Vec<f32>>>,
    pub max_sample_points: usize,
    pub num_classes: usize,
    #[serde(default)]
    pub pruned_edges: usize,
}

impl BundleSnapshot {
    /// Write the snapshot as JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let writer = BufWriter::new(File::create(path.as_ref())?);
        serde_json::to_writer(writer, self)?;
        tracing::info!(
            path = %path.as_ref().display(),
            edges = self.edge_count(),
            "snapshot saved"
        );
        Ok(())
    }

    /// Read and validate a JSON snapshot
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let snapshot: BundleSnapshot = serde_json::from_reader(reader)?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    /// Check that every record and slot has the size its layout implies
    pub fn validate(&self) -> Result<()> {
        let node_count: usize = self.layer_sizes.iter().sum();
        if self.node_data.len() != node_count {
            return Err(BundleError::InvalidInput(format!(
                "snapshot has {} node records for {node_count} nodes",
                self.node_data.len()
            )));
        }
        let node_stride = NodeRecordLayout::new(self.num_classes).stride;
        if self.node_data.iter().any(|r| r.len() != node_stride) {
            return Err(BundleError::InvalidInput(format!(
                "node records must hold {node_stride} floats"
            )));
        }
        if self.edge_metadata.len() != self.edge_samples.len() {
            return Err(BundleError::InvalidInput(
                "edge metadata and samples disagree on the partition count".to_string(),
            ));
        }
        if self.max_sample_points < 2 {
            return Err(BundleError::InvalidInput(format!(
                "polyline capacity {} cannot hold an edge",
                self.max_sample_points
            )));
        }
        let edge_stride = EdgeRecordLayout::new(self.num_classes).stride;
        let slot = self.max_sample_points * POINT_FLOATS;
        for (records, slots) in self.edge_metadata.iter().zip(&self.edge_samples) {
            if records.len() != slots.len() {
                return Err(BundleError::InvalidInput(
                    "partition metadata and samples disagree on the edge count".to_string(),
                ));
            }
            if records.iter().any(|r| r.len() != edge_stride) {
                return Err(BundleError::InvalidInput(format!(
                    "edge records must hold {edge_stride} floats"
                )));
            }
            if slots.iter().any(|s| s.len() != slot) {
                return Err(BundleError::InvalidInput(format!(
                    "polyline slots must hold {slot} floats"
                )));
            }
        }
        Ok(())
    }

    pub fn node_count(&self) -> usize {
        self.node_data.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edge_metadata.iter().map(Vec::len).sum()
    }

    /// Sum of the live point counts of every polyline
    pub fn point_count(&self) -> usize {
        self.edge_samples
            .iter()
            .flatten()
            .map(|slot| live_count(slot, 0, self.max_sample_points))
            .sum()
    }

    /// Live points of every edge, in partition order
    pub fn polylines(&self) -> Vec<Vec<[f32; 3]>> {
        self.edge_samples
            .iter()
            .flatten()
            .map(|slot| {
                let live = live_count(slot, 0, self.max_sample_points);
                slot[..live * POINT_FLOATS]
                    .chunks_exact(POINT_FLOATS)
                    .map(|p| [p[0], p[1], p[2]])
                    .collect()
            })
            .collect()
    }

    /// Rebuild the geometry model the snapshot was taken from
    pub fn model(&self, config: &BundlingConfig) -> Result<NetworkModel> {
        self.validate()?;
        let mut offsets = Vec::with_capacity(self.layer_sizes.len() + 1);
        offsets.push(0);
        for size in &self.layer_sizes {
            offsets.push(offsets[offsets.len() - 1] + size);
        }

        let mut nodes = Vec::with_capacity(self.node_data.len());
        for (layer, &size) in self.layer_sizes.iter().enumerate() {
            for record in &self.node_data[offsets[layer]..offsets[layer] + size] {
                let classes =
                    NodeRecordLayout::CLASSES..NodeRecordLayout::CLASSES + self.num_classes;
                nodes.push(Node {
                    layer,
                    position: [record[0], record[1], record[2]],
                    importance: record[NodeRecordLayout::IMPORTANCE],
                    classes: record[classes].to_vec(),
                });
            }
        }

        let mut edges = Vec::with_capacity(self.edge_count());
        for record in self.edge_metadata.iter().flatten() {
            let layer = record[EdgeRecordLayout::LAYER] as usize;
            let local_id = record[EdgeRecordLayout::LOCAL_ID] as usize;
            if layer + 1 >= self.layer_sizes.len() {
                return Err(BundleError::InvalidInput(format!(
                    "edge record refers to missing layer pair {layer}"
                )));
            }
            let next = self.layer_sizes[layer + 1];
            if local_id >= self.layer_sizes[layer] * next {
                return Err(BundleError::InvalidInput(format!(
                    "edge {local_id} out of range in layer pair {layer}"
                )));
            }
            if edges.last().is_some_and(|e: &Edge| e.layer > layer) {
                return Err(BundleError::InvalidInput(
                    "edge records are not sorted by layer".to_string(),
                ));
            }
            let classes = EdgeRecordLayout::CLASSES..EdgeRecordLayout::CLASSES + self.num_classes;
            edges.push(Edge {
                layer,
                local_id,
                source: offsets[layer] + local_id / next,
                target: offsets[layer + 1] + local_id % next,
                importance: record[EdgeRecordLayout::IMPORTANCE],
                classes: record[classes].to_vec(),
            });
        }

        Ok(NetworkModel::from_parts(
            self.layer_sizes.clone(),
            nodes,
            edges,
            self.pruned_edges,
            self.num_classes,
            config,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> BundleSnapshot {
        let mut slot = vec![0.0; 8 * POINT_FLOATS];
        slot[..12].copy_from_slice(&[0.0, 0.0, -2.5, 3.0, 0.1, 0.0, 0.0, 1.0, 0.0, 0.0, 2.5, 1.0]);
        let mut record = vec![0.0; 12];
        record[EdgeRecordLayout::LOCAL_ID] = 1.0;
        record[EdgeRecordLayout::IMPORTANCE] = 0.5;
        BundleSnapshot {
            layer_sizes: vec![1, 2],
            node_data: vec![
                vec![0.0, 0.0, -2.5, 1.0],
                vec![-5.0, 0.0, 2.5, 1.0],
                vec![5.0, 0.0, 2.5, 1.0],
            ],
            edge_metadata: vec![vec![record]],
            edge_samples: vec![vec![slot]],
            max_sample_points: 8,
            num_classes: 0,
            pruned_edges: 1,
        }
    }

    #[test]
    fn counts_and_polylines() {
        let snapshot = snapshot();
        snapshot.validate().unwrap();
        assert_eq!(snapshot.node_count(), 3);
        assert_eq!(snapshot.edge_count(), 1);
        assert_eq!(snapshot.point_count(), 3);
        assert_eq!(snapshot.polylines()[0][1], [0.1, 0.0, 0.0]);
    }

    #[test]
    fn model_recovers_edge_endpoints() {
        let model = snapshot().model(&BundlingConfig::default()).unwrap();
        assert_eq!(model.edge_count(), 1);
        assert_eq!(model.edges()[0].source, 0);
        assert_eq!(model.edges()[0].target, 2);
        assert_eq!(model.pruned_edges(), 1);
    }

    #[test]
    fn wrong_slot_size_is_rejected() {
        let mut snapshot = snapshot();
        snapshot.edge_samples[0][0].pop();
        assert!(snapshot.validate().is_err());
    }

    #[test]
    fn save_and_load_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.json");
        let snapshot = snapshot();
        snapshot.save(&path).unwrap();
        assert_eq!(BundleSnapshot::load(&path).unwrap(), snapshot);
    }

    #[test]
    fn missing_pruned_count_defaults_to_zero() {
        let mut value = serde_json::to_value(snapshot()).unwrap();
        value.as_object_mut().unwrap().remove("pruned_edges");
        let snapshot: BundleSnapshot = serde_json::from_value(value).unwrap();
        assert_eq!(snapshot.pruned_edges, 0);
    }
}
