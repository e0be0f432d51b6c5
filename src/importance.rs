//! Importance aggregation
//!
//! An edge carries a scalar value and a per-class importance vector. The
//! [`ImportanceMode`] chosen in the configuration is resolved once into a
//! plain function pointer so the hot loops never branch on the mode.

use serde::{Deserialize, Serialize};

/// Signature of a resolved importance function
pub type ImportanceFn = fn(f32, &[f32], &[usize]) -> f32;

/// How an edge's importance is derived from its values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportanceMode {
    /// The scalar edge value alone
    Edge,
    /// Mean of the relevant class values, ignoring the edge value
    ClassMean,
    /// Edge value scaled by the mean of the relevant class values
    #[default]
    EdgeTimesClassMean,
    /// Edge value scaled by the largest relevant class value
    EdgeTimesClassMax,
}

impl ImportanceMode {
    /// Resolve the mode into its aggregation function
    pub fn resolve(self) -> ImportanceFn {
        match self {
            ImportanceMode::Edge => edge_only,
            ImportanceMode::ClassMean => class_mean,
            ImportanceMode::EdgeTimesClassMean => edge_times_class_mean,
            ImportanceMode::EdgeTimesClassMax => edge_times_class_max,
        }
    }
}

fn edge_only(edge: f32, _classes: &[f32], _relevant: &[usize]) -> f32 {
    edge
}

fn class_mean(_edge: f32, classes: &[f32], relevant: &[usize]) -> f32 {
    relevant_mean(classes, relevant)
}

fn edge_times_class_mean(edge: f32, classes: &[f32], relevant: &[usize]) -> f32 {
    edge * relevant_mean(classes, relevant)
}

fn edge_times_class_max(edge: f32, classes: &[f32], relevant: &[usize]) -> f32 {
    let max = relevant_values(classes, relevant).fold(f32::NEG_INFINITY, f32::max);
    if max.is_finite() { edge * max } else { edge }
}

/// Iterate the class values selected by `relevant` (all classes when empty)
fn relevant_values<'a>(
    classes: &'a [f32],
    relevant: &'a [usize],
) -> Box<dyn Iterator<Item = f32> + 'a> {
    if relevant.is_empty() {
        Box::new(classes.iter().copied())
    } else {
        Box::new(relevant.iter().filter_map(|&i| classes.get(i).copied()))
    }
}

/// Mean of the relevant class values; 1.0 when there are none so that
/// networks without class data keep their raw edge values.
pub fn relevant_mean(classes: &[f32], relevant: &[usize]) -> f32 {
    let (sum, count) =
        relevant_values(classes, relevant).fold((0.0f32, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 { 1.0 } else { sum / count as f32 }
}
