//! nnbundle - density-driven edge bundling for layered neural-network graphs.
//!
//! A network's nodes are laid out in stacked layer planes and every edge
//! between consecutive layers becomes a polyline. Bundling alternates
//! density accumulation on a voxel grid with advection along the negative
//! density gradient, under an annealing schedule, so that edges attract each
//! other into bundles. All heavy work is expressed as named kernels run by a
//! [`compute::ComputeDevice`]: [`compute::HostDevice`] on host memory, or
//! `gpu::WgpuDevice` on a GPU with the `gpu` feature.

pub mod advection;
pub mod compute;
pub mod config;
pub mod edge_processor;
pub mod error;
#[cfg(feature = "gpu")]
pub mod gpu;
pub mod grid_processor;
pub mod importance;
pub mod model;
pub mod network_processor;
pub mod node_processor;
pub mod snapshot;
pub mod types;

pub use advection::{AdvectionProgress, Direction};
pub use compute::{ComputeDevice, HostDevice};
pub use config::{AnnealingConfig, BundlingConfig};
pub use error::{BundleError, Result};
pub use importance::ImportanceMode;
pub use model::{NetworkInput, NetworkModel};
pub use network_processor::{Counters, NetworkProcessor, ProcessingMode};
pub use snapshot::BundleSnapshot;
