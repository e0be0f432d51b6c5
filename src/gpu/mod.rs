//! GPU compute backend (feature `gpu`)
//!
//! [`WgpuDevice`] implements [`crate::compute::ComputeDevice`] on top of
//! wgpu. Every registry kernel is compiled to a WGSL compute pipeline on first
//! use and cached; dispatches are recorded into one command encoder per
//! barrier and submitted in order.
//!
//! # Example
//!
//! ```rust,ignore
//! use nnbundle::gpu::WgpuDevice;
//! use nnbundle::{BundlingConfig, NetworkInput, NetworkProcessor, ProcessingMode};
//!
//! let device = WgpuDevice::new()?;
//! let input = NetworkInput::uniform(&[784, 128, 10]);
//! let mut processor = NetworkProcessor::from_input(device, &input, BundlingConfig::default())?;
//! processor.run(ProcessingMode::EdgeAdvectForward, 200)?;
//! let polylines = processor.polylines()?;
//! ```
//!
//! # Buffers
//!
//! Buffers are plain `array<f32>` storage bindings. Uniforms are packed in
//! contract order into a fresh uniform buffer per dispatch. Readback copies
//! into a mappable staging buffer and blocks until the device is idle.

mod device;
mod shaders;

pub use device::WgpuDevice;
pub use shaders::{WORKGROUP_SIZE, source as kernel_source};
