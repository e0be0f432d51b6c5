//! Compute device abstraction
//!
//! The bundling processors never talk to a graphics API directly. They own
//! [`BufferHandle`]s into a [`ComputeDevice`] and issue named [`Kernel`]
//! dispatches against it. Two devices implement the trait:
//!
//! - [`HostDevice`]: runs every kernel on host memory (reference backend)
//! - `gpu::WgpuDevice`: runs the same kernels as WGSL compute shaders
//!   (feature `gpu`)
//!
//! # Double buffering
//!
//! Kernels that transform a buffer read one half of a [`DoubleBuffer`] and
//! write the other. [`DoubleBuffer::current`] yields a [`Current`] handle that
//! can only be bound for reading, [`DoubleBuffer::target`] a [`Target`] handle
//! that can only be bound for writing, so a kernel cannot be wired to write
//! the half it reads. [`DoubleBuffer::swap`] is the only point where the halves
//! change roles. Raw [`BufferHandle`]s are read-only; a buffer without a
//! second half is written through a [`SingleBuffer`].
//!
//! ```compile_fail
//! use nnbundle::compute::{Bindings, DoubleBuffer, HostDevice};
//!
//! let mut device = HostDevice::new();
//! let samples = DoubleBuffer::create(&mut device, "samples", 8).unwrap();
//! let bindings = Bindings::new().write(samples.current().handle());
//! ```
//!
//! # Chunked dispatch
//!
//! Devices limit how many elements one dispatch may cover.
//! [`dispatch_chunked`] splits larger requests into `ceil(count / width)`
//! dispatches with an explicit `work_group_offset`, each followed by a
//! barrier.

mod host;
mod kernel;
pub mod kernels;

pub use host::{DeviceStats, HostDevice};
pub use kernel::{
    Access, BindingSpec, COMMON_UNIFORMS, GridSpec, Kernel, UniformKind, UniformSpec,
    UniformValue, Uniforms,
};

use crate::error::{BundleError, Result};

/// Opaque handle to a device buffer of `f32`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub(crate) u64);

impl BufferHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Hardware limits a device reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Most elements a single dispatch may cover
    pub max_dispatch_width: usize,
    /// Largest storage buffer, in bytes
    pub max_buffer_bytes: u64,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            // 65535 workgroups of 64 invocations
            max_dispatch_width: 65_535 * 64,
            // wgpu's default storage binding ceiling (128 MiB)
            max_buffer_bytes: 128 << 20,
        }
    }
}

impl DeviceLimits {
    /// Fail with a sizing error if a buffer of `len` floats does not fit
    pub fn check_buffer(&self, label: &str, len: usize) -> Result<()> {
        let bytes = (len * std::mem::size_of::<f32>()) as u64;
        if bytes > self.max_buffer_bytes {
            return Err(BundleError::BufferTooLarge {
                label: label.to_string(),
                bytes,
                limit: self.max_buffer_bytes,
            });
        }
        Ok(())
    }
}

/// A device that stores `f32` buffers and runs registry kernels over them
pub trait ComputeDevice {
    /// Hardware limits of this device
    fn limits(&self) -> DeviceLimits;

    /// Allocate a zero-initialised buffer of `len` floats
    fn create_buffer(&mut self, label: &str, len: usize) -> Result<BufferHandle>;

    /// Upload `data` starting at float `offset`
    fn write_buffer(&mut self, buffer: BufferHandle, offset: usize, data: &[f32]) -> Result<()>;

    /// Wait for all submitted work and read the whole buffer back
    fn read_buffer(&mut self, buffer: BufferHandle) -> Result<Vec<f32>>;

    /// Length of a buffer in floats
    fn buffer_len(&self, buffer: BufferHandle) -> Result<usize>;

    /// Run `kernel` over `count` elements starting at the uniform
    /// `work_group_offset`. `count` must not exceed the dispatch width.
    fn dispatch(
        &mut self,
        kernel: Kernel,
        bindings: &Bindings,
        uniforms: &Uniforms,
        count: usize,
    ) -> Result<()>;

    /// Make all writes of previous dispatches visible to later ones
    fn barrier(&mut self) -> Result<()>;

    /// Free a buffer
    fn release(&mut self, buffer: BufferHandle);
}

/// A handle that may be bound for reading
pub trait Readable {
    fn read_handle(&self) -> BufferHandle;
}

/// A handle that may be bound for writing
pub trait Writable {
    fn write_handle(&self) -> BufferHandle;
}

/// Read side of a double buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Current(BufferHandle);

/// Write side of a double buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target(BufferHandle);

impl Current {
    pub fn handle(&self) -> BufferHandle {
        self.0
    }
}

impl Target {
    pub fn handle(&self) -> BufferHandle {
        self.0
    }
}

impl Readable for BufferHandle {
    fn read_handle(&self) -> BufferHandle {
        *self
    }
}

impl Readable for Current {
    fn read_handle(&self) -> BufferHandle {
        self.0
    }
}

impl Writable for Target {
    fn write_handle(&self) -> BufferHandle {
        self.0
    }
}

/// A buffer without a second half, bound for reading or writing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SingleBuffer(BufferHandle);

impl SingleBuffer {
    /// Allocate a zero-initialised buffer of `len` floats
    pub fn create<D: ComputeDevice + ?Sized>(
        device: &mut D,
        label: &str,
        len: usize,
    ) -> Result<Self> {
        device.create_buffer(label, len).map(Self)
    }

    pub fn handle(&self) -> BufferHandle {
        self.0
    }

    /// Read the buffer back (waits for the device)
    pub fn read<D: ComputeDevice + ?Sized>(&self, device: &mut D) -> Result<Vec<f32>> {
        device.read_buffer(self.0)
    }

    pub fn release<D: ComputeDevice + ?Sized>(self, device: &mut D) {
        device.release(self.0);
    }
}

impl Readable for SingleBuffer {
    fn read_handle(&self) -> BufferHandle {
        self.0
    }
}

impl Writable for SingleBuffer {
    fn write_handle(&self) -> BufferHandle {
        self.0
    }
}

/// Buffers bound to a dispatch, in binding order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bindings {
    slots: Vec<(Access, BufferHandle)>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(mut self, buffer: impl Readable) -> Self {
        self.slots.push((Access::Read, buffer.read_handle()));
        self
    }

    pub fn write(mut self, buffer: impl Writable) -> Self {
        self.slots.push((Access::Write, buffer.write_handle()));
        self
    }

    pub fn slots(&self) -> &[(Access, BufferHandle)] {
        &self.slots
    }

    /// The single written buffer
    pub fn output(&self) -> Option<BufferHandle> {
        self.slots
            .iter()
            .find(|(access, _)| *access == Access::Write)
            .map(|(_, h)| *h)
    }

    /// Check the bindings against the kernel's contract and reject a write
    /// that aliases a read
    pub fn validate(&self, kernel: Kernel) -> Result<()> {
        let spec = kernel.bindings();
        if spec.len() != self.slots.len() {
            return Err(BundleError::BindingContract {
                kernel: kernel.name(),
                problem: format!("expects {} buffers, got {}", spec.len(), self.slots.len()),
            });
        }
        for (binding, (access, _)) in spec.iter().zip(&self.slots) {
            if binding.access != *access {
                return Err(BundleError::BindingContract {
                    kernel: kernel.name(),
                    problem: format!("binding '{}' has the wrong access", binding.name),
                });
            }
        }
        if let Some(out) = self.output() {
            let aliased = self
                .slots
                .iter()
                .any(|(access, h)| *access == Access::Read && *h == out);
            if aliased {
                return Err(BundleError::Hazard {
                    kernel: kernel.name(),
                    buffer: out.id(),
                });
            }
        }
        Ok(())
    }
}

/// Two equally sized buffers used ping-pong style
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoubleBuffer {
    buffers: [BufferHandle; 2],
    current: usize,
    len: usize,
}

impl DoubleBuffer {
    /// Allocate both halves
    pub fn create<D: ComputeDevice + ?Sized>(
        device: &mut D,
        label: &str,
        len: usize,
    ) -> Result<Self> {
        let front = device.create_buffer(&format!("{label} (a)"), len)?;
        let back = match device.create_buffer(&format!("{label} (b)"), len) {
            Ok(back) => back,
            Err(err) => {
                device.release(front);
                return Err(err);
            }
        };
        Ok(Self {
            buffers: [front, back],
            current: 0,
            len,
        })
    }

    /// Upload the same data into both halves, so either is valid to read
    pub fn upload<D: ComputeDevice + ?Sized>(&self, device: &mut D, data: &[f32]) -> Result<()> {
        device.write_buffer(self.buffers[0], 0, data)?;
        device.write_buffer(self.buffers[1], 0, data)
    }

    pub fn current(&self) -> Current {
        Current(self.buffers[self.current])
    }

    pub fn target(&self) -> Target {
        Target(self.buffers[1 - self.current])
    }

    /// Exchange the roles of the two halves
    pub fn swap(&mut self) {
        self.current = 1 - self.current;
    }

    /// Length of each half in floats
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read back the current half (waits for the device)
    pub fn read<D: ComputeDevice + ?Sized>(&self, device: &mut D) -> Result<Vec<f32>> {
        device.read_buffer(self.current().handle())
    }

    /// Free both halves
    pub fn release<D: ComputeDevice + ?Sized>(self, device: &mut D) {
        device.release(self.buffers[0]);
        device.release(self.buffers[1]);
    }
}

/// Dispatch `kernel` over `count` elements, split into chunks no wider than
/// the device allows. Each chunk carries its own `work_group_offset` and is
/// followed by a barrier. Returns the number of dispatches issued.
pub fn dispatch_chunked<D: ComputeDevice + ?Sized>(
    device: &mut D,
    kernel: Kernel,
    bindings: &Bindings,
    uniforms: Uniforms,
    count: usize,
) -> Result<usize> {
    let width = device.limits().max_dispatch_width.max(1);
    let mut uniforms = uniforms
        .uint("work_group_offset", 0)
        .uint("element_count", count as u32);
    uniforms.validate(kernel)?;
    bindings.validate(kernel)?;

    let mut offset = 0;
    let mut dispatches = 0;
    while offset < count {
        let chunk = width.min(count - offset);
        uniforms.insert("work_group_offset", UniformValue::UInt(offset as u32));
        device.dispatch(kernel, bindings, &uniforms, chunk)?;
        device.barrier()?;
        offset += chunk;
        dispatches += 1;
    }
    if dispatches > 1 {
        tracing::trace!(kernel = kernel.name(), count, dispatches, "chunked dispatch");
    }
    Ok(dispatches)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_twice_restores_handles() {
        let mut device = HostDevice::new();
        let mut buffer = DoubleBuffer::create(&mut device, "test", 8).unwrap();
        let (current, target) = (buffer.current(), buffer.target());
        assert_ne!(current.handle(), target.handle());

        buffer.swap();
        assert_eq!(buffer.current().handle(), target.handle());
        assert_eq!(buffer.target().handle(), current.handle());

        buffer.swap();
        assert_eq!(buffer.current(), current);
        assert_eq!(buffer.target(), target);
    }

    #[test]
    fn upload_fills_both_halves() {
        let mut device = HostDevice::new();
        let mut buffer = DoubleBuffer::create(&mut device, "test", 3).unwrap();
        buffer.upload(&mut device, &[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(buffer.read(&mut device).unwrap(), vec![1.0, 2.0, 3.0]);
        buffer.swap();
        assert_eq!(buffer.read(&mut device).unwrap(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn aliased_write_is_a_hazard() {
        let mut device = HostDevice::new();
        let buffer = SingleBuffer::create(&mut device, "grid", 8).unwrap();
        let bindings = Bindings::new().read(buffer).write(buffer);
        assert!(matches!(
            bindings.validate(Kernel::GridGradient),
            Err(BundleError::Hazard { .. })
        ));
    }

    #[test]
    fn binding_count_is_checked() {
        let mut device = HostDevice::new();
        let buffer = SingleBuffer::create(&mut device, "grid", 8).unwrap();
        let bindings = Bindings::new().write(buffer);
        assert!(matches!(
            bindings.validate(Kernel::GridGradient),
            Err(BundleError::BindingContract { .. })
        ));
    }

    #[test]
    fn chunking_splits_wide_dispatches() {
        let mut device = HostDevice::with_limits(DeviceLimits {
            max_dispatch_width: 4,
            ..DeviceLimits::default()
        });
        let density = SingleBuffer::create(&mut device, "density", 10 * 4).unwrap();
        device.write_buffer(density.handle(), 0, &[7.0; 40]).unwrap();

        let bindings = Bindings::new().write(density);
        let dispatches =
            dispatch_chunked(&mut device, Kernel::GridClear, &bindings, Uniforms::new(), 10)
                .unwrap();

        assert_eq!(dispatches, 3);
        assert_eq!(device.stats().dispatches, 3);
        assert_eq!(device.stats().barriers, 3);
        assert!(density.read(&mut device).unwrap().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn empty_dispatch_issues_nothing() {
        let mut device = HostDevice::new();
        let density = SingleBuffer::create(&mut device, "density", 4).unwrap();
        let bindings = Bindings::new().write(density);
        let dispatches =
            dispatch_chunked(&mut device, Kernel::GridClear, &bindings, Uniforms::new(), 0)
                .unwrap();
        assert_eq!(dispatches, 0);
    }

    #[test]
    fn oversized_buffer_is_fatal() {
        let mut device = HostDevice::with_limits(DeviceLimits {
            max_buffer_bytes: 64,
            ..DeviceLimits::default()
        });
        assert!(device.create_buffer("small", 16).is_ok());
        assert!(matches!(
            device.create_buffer("large", 17),
            Err(BundleError::BufferTooLarge { .. })
        ));
    }
}
