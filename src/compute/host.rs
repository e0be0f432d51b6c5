//! Host reference device
//!
//! Executes every registry kernel on host memory with the same binding and
//! uniform contracts as the GPU backend. Used for tests, for machines without
//! an adapter, and as the reference the WGSL kernels are checked against.

use std::collections::HashMap;

use super::kernel::{Kernel, Uniforms};
use super::kernels;
use super::{Access, Bindings, BufferHandle, ComputeDevice, DeviceLimits};
use crate::error::{BundleError, Result};

/// Counters of work submitted to a [`HostDevice`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub dispatches: usize,
    pub barriers: usize,
    pub readbacks: usize,
    pub live_buffers: usize,
}

struct HostBuffer {
    label: String,
    data: Vec<f32>,
}

/// Compute device backed by host memory
pub struct HostDevice {
    buffers: HashMap<u64, HostBuffer>,
    next_id: u64,
    limits: DeviceLimits,
    stats: DeviceStats,
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HostDevice {
    pub fn new() -> Self {
        Self::with_limits(DeviceLimits::default())
    }

    /// Create a device reporting custom limits (small limits exercise the
    /// chunking and partitioning paths)
    pub fn with_limits(limits: DeviceLimits) -> Self {
        Self {
            buffers: HashMap::new(),
            next_id: 1,
            limits,
            stats: DeviceStats::default(),
        }
    }

    pub fn stats(&self) -> DeviceStats {
        DeviceStats {
            live_buffers: self.buffers.len(),
            ..self.stats
        }
    }

    /// Label a buffer was created with
    pub fn label(&self, buffer: BufferHandle) -> Option<&str> {
        self.buffers.get(&buffer.0).map(|b| b.label.as_str())
    }

    fn buffer(&self, buffer: BufferHandle) -> Result<&HostBuffer> {
        self.buffers
            .get(&buffer.0)
            .ok_or(BundleError::UnknownBuffer(buffer.0))
    }
}

impl ComputeDevice for HostDevice {
    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn create_buffer(&mut self, label: &str, len: usize) -> Result<BufferHandle> {
        self.limits.check_buffer(label, len)?;
        let id = self.next_id;
        self.next_id += 1;
        self.buffers.insert(
            id,
            HostBuffer {
                label: label.to_string(),
                data: vec![0.0; len],
            },
        );
        Ok(BufferHandle(id))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: usize, data: &[f32]) -> Result<()> {
        let target = self
            .buffers
            .get_mut(&buffer.0)
            .ok_or(BundleError::UnknownBuffer(buffer.0))?;
        let end = offset + data.len();
        if end > target.data.len() {
            return Err(BundleError::BufferTooLarge {
                label: target.label.clone(),
                bytes: (end * std::mem::size_of::<f32>()) as u64,
                limit: (target.data.len() * std::mem::size_of::<f32>()) as u64,
            });
        }
        target.data[offset..end].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&mut self, buffer: BufferHandle) -> Result<Vec<f32>> {
        self.stats.readbacks += 1;
        Ok(self.buffer(buffer)?.data.clone())
    }

    fn buffer_len(&self, buffer: BufferHandle) -> Result<usize> {
        Ok(self.buffer(buffer)?.data.len())
    }

    fn dispatch(
        &mut self,
        kernel: Kernel,
        bindings: &Bindings,
        uniforms: &Uniforms,
        count: usize,
    ) -> Result<()> {
        if count > self.limits.max_dispatch_width {
            return Err(BundleError::DispatchTooWide {
                kernel: kernel.name(),
                count,
                max: self.limits.max_dispatch_width,
            });
        }
        bindings.validate(kernel)?;
        uniforms.validate(kernel)?;

        let output = bindings
            .output()
            .ok_or_else(|| BundleError::BindingContract {
                kernel: kernel.name(),
                problem: "no output binding".to_string(),
            })?;
        let mut out = self
            .buffers
            .remove(&output.0)
            .ok_or(BundleError::UnknownBuffer(output.0))?;

        let result = (|| {
            let inputs = bindings
                .slots()
                .iter()
                .filter(|(access, _)| *access == Access::Read)
                .map(|(_, h)| self.buffer(*h).map(|b| b.data.as_slice()))
                .collect::<Result<Vec<&[f32]>>>()?;
            let offset = uniforms.get_uint(kernel, "work_group_offset")? as usize;
            kernels::run(kernel, &inputs, &mut out.data, uniforms, offset..offset + count)
        })();

        self.buffers.insert(output.0, out);
        self.stats.dispatches += 1;
        result
    }

    fn barrier(&mut self) -> Result<()> {
        self.stats.barriers += 1;
        Ok(())
    }

    fn release(&mut self, buffer: BufferHandle) {
        self.buffers.remove(&buffer.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::{SingleBuffer, Uniforms};

    #[test]
    fn buffers_start_zeroed() {
        let mut device = HostDevice::new();
        let buffer = device.create_buffer("zeros", 5).unwrap();
        assert_eq!(device.read_buffer(buffer).unwrap(), vec![0.0; 5]);
        assert_eq!(device.label(buffer), Some("zeros"));
    }

    #[test]
    fn write_past_end_is_rejected() {
        let mut device = HostDevice::new();
        let buffer = device.create_buffer("short", 2).unwrap();
        assert!(device.write_buffer(buffer, 1, &[1.0, 2.0]).is_err());
    }

    #[test]
    fn released_buffers_are_gone() {
        let mut device = HostDevice::new();
        let buffer = device.create_buffer("temp", 2).unwrap();
        assert_eq!(device.stats().live_buffers, 1);
        device.release(buffer);
        assert_eq!(device.stats().live_buffers, 0);
        assert!(matches!(
            device.read_buffer(buffer),
            Err(BundleError::UnknownBuffer(_))
        ));
    }

    #[test]
    fn over_wide_dispatch_is_rejected() {
        let mut device = HostDevice::with_limits(DeviceLimits {
            max_dispatch_width: 2,
            ..DeviceLimits::default()
        });
        let density = SingleBuffer::create(&mut device, "density", 16).unwrap();
        let uniforms = Uniforms::new()
            .uint("work_group_offset", 0)
            .uint("element_count", 4);
        let err = device
            .dispatch(Kernel::GridClear, &Bindings::new().write(density), &uniforms, 4)
            .unwrap_err();
        assert!(matches!(err, BundleError::DispatchTooWide { .. }));
    }

    #[test]
    fn output_survives_a_failed_dispatch() {
        let mut device = HostDevice::new();
        let density = SingleBuffer::create(&mut device, "density", 16).unwrap();
        let missing = BufferHandle(999);
        let uniforms = crate::compute::GridSpec {
            dims: [2, 2, 1],
            origin: [0.0; 3],
            cell_size: 1.0,
        }
        .apply(
            Uniforms::new()
                .uint("work_group_offset", 0)
                .uint("element_count", 4),
        );
        let bindings = Bindings::new().read(missing).write(density);
        assert!(device
            .dispatch(Kernel::GridGradient, &bindings, &uniforms, 4)
            .is_err());
        assert_eq!(device.buffer_len(density.handle()).unwrap(), 16);
    }
}
