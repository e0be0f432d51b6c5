//! [`ComputeDevice`] backed by wgpu compute shaders

use std::collections::HashMap;
use std::sync::Arc;

use wgpu::util::DeviceExt;

use super::shaders::{self, WORKGROUP_SIZE};
use crate::compute::{Access, Bindings, BufferHandle, ComputeDevice, DeviceLimits, Kernel, Uniforms};
use crate::error::{BundleError, Result};

const FLOAT_BYTES: u64 = std::mem::size_of::<f32>() as u64;

/// wgpu rejects zero-sized bindings
const MIN_BUFFER_BYTES: u64 = 16;

struct GpuBuffer {
    buffer: wgpu::Buffer,
    len: usize,
}

struct Pipeline {
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
}

/// Compute device running the registry kernels as WGSL on a GPU adapter
pub struct WgpuDevice {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    buffers: HashMap<u64, GpuBuffer>,
    pipelines: HashMap<Kernel, Pipeline>,
    encoder: Option<wgpu::CommandEncoder>,
    next_id: u64,
    limits: DeviceLimits,
    adapter_name: String,
}

impl WgpuDevice {
    /// Open the highest-performance adapter available
    pub fn new() -> Result<Self> {
        pollster::block_on(Self::create())
    }

    async fn create() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| BundleError::Device("no suitable GPU adapter".to_string()))?;

        let adapter_limits = adapter.limits();
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("nnbundle device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: adapter_limits.clone(),
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await
            .map_err(|e| BundleError::Device(format!("failed to create device: {e}")))?;

        let info = adapter.get_info();
        tracing::info!(adapter = %info.name, backend = ?info.backend, "opened GPU adapter");

        let limits = DeviceLimits {
            max_dispatch_width: adapter_limits.max_compute_workgroups_per_dimension as usize
                * WORKGROUP_SIZE as usize,
            max_buffer_bytes: u64::from(adapter_limits.max_storage_buffer_binding_size)
                .min(adapter_limits.max_buffer_size),
        };
        Ok(Self::with_device(Arc::new(device), Arc::new(queue), limits, info.name))
    }

    /// Wrap an existing device and queue
    pub fn with_device(
        device: Arc<wgpu::Device>,
        queue: Arc<wgpu::Queue>,
        limits: DeviceLimits,
        adapter_name: String,
    ) -> Self {
        Self {
            device,
            queue,
            buffers: HashMap::new(),
            pipelines: HashMap::new(),
            encoder: None,
            next_id: 1,
            limits,
            adapter_name,
        }
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    fn buffer(&self, handle: BufferHandle) -> Result<&GpuBuffer> {
        self.buffers
            .get(&handle.id())
            .ok_or(BundleError::UnknownBuffer(handle.id()))
    }

    /// Submit recorded dispatches
    fn flush(&mut self) {
        if let Some(encoder) = self.encoder.take() {
            self.queue.submit(std::iter::once(encoder.finish()));
        }
    }

    fn pipeline(&mut self, kernel: Kernel) -> Result<&Pipeline> {
        if !self.pipelines.contains_key(&kernel) {
            let pipeline = self.build_pipeline(kernel)?;
            self.pipelines.insert(kernel, pipeline);
        }
        self.pipelines
            .get(&kernel)
            .ok_or_else(|| BundleError::Device(format!("pipeline {kernel} missing")))
    }

    fn build_pipeline(&self, kernel: Kernel) -> Result<Pipeline> {
        let storage = |read_only| wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        };
        let mut entries: Vec<wgpu::BindGroupLayoutEntry> = kernel
            .bindings()
            .iter()
            .enumerate()
            .map(|(index, binding)| wgpu::BindGroupLayoutEntry {
                binding: index as u32,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: storage(binding.access == Access::Read),
                count: None,
            })
            .collect();
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: kernel.bindings().len() as u32,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        });

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(kernel.name()),
            source: wgpu::ShaderSource::Wgsl(shaders::source(kernel).into()),
        });
        let layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(kernel.name()),
                entries: &entries,
            });
        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(kernel.name()),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(kernel.name()),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: Some(kernel.name()),
                compilation_options: Default::default(),
                cache: None,
            });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(BundleError::Device(format!("kernel {kernel} failed to compile: {err}")));
        }
        tracing::debug!(kernel = kernel.name(), "compiled compute pipeline");
        Ok(Pipeline { pipeline, layout })
    }
}

impl ComputeDevice for WgpuDevice {
    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn create_buffer(&mut self, label: &str, len: usize) -> Result<BufferHandle> {
        self.limits.check_buffer(label, len)?;
        let size = (len as u64 * FLOAT_BYTES).max(MIN_BUFFER_BYTES);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let handle = BufferHandle(self.next_id);
        self.next_id += 1;
        self.buffers.insert(handle.id(), GpuBuffer { buffer, len });
        Ok(handle)
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: usize, data: &[f32]) -> Result<()> {
        let len = self.buffer(buffer)?.len;
        if offset + data.len() > len {
            return Err(BundleError::Device(format!(
                "write of {} floats at {offset} overruns buffer {} of {len}",
                data.len(),
                buffer.id()
            )));
        }
        if data.is_empty() {
            return Ok(());
        }
        // queued writes land before the next submission, so earlier
        // dispatches must be submitted first
        self.flush();
        let target = &self.buffer(buffer)?.buffer;
        self.queue
            .write_buffer(target, offset as u64 * FLOAT_BYTES, bytemuck::cast_slice(data));
        Ok(())
    }

    fn read_buffer(&mut self, buffer: BufferHandle) -> Result<Vec<f32>> {
        let len = self.buffer(buffer)?.len;
        if len == 0 {
            return Ok(Vec::new());
        }
        let bytes = len as u64 * FLOAT_BYTES;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback"),
            size: bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .encoder
            .take()
            .unwrap_or_else(|| self.device.create_command_encoder(&Default::default()));
        encoder.copy_buffer_to_buffer(&self.buffer(buffer)?.buffer, 0, &staging, 0, bytes);
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|e| BundleError::Device(format!("readback channel closed: {e}")))?
            .map_err(|e| BundleError::Device(format!("failed to map readback buffer: {e}")))?;

        let data = slice.get_mapped_range();
        let floats = bytemuck::cast_slice::<u8, f32>(&data).to_vec();
        drop(data);
        staging.unmap();
        Ok(floats)
    }

    fn buffer_len(&self, buffer: BufferHandle) -> Result<usize> {
        Ok(self.buffer(buffer)?.len)
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
        let words = uniforms.packed(kernel)?;
        if count == 0 {
            return Ok(());
        }

        let params = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("params"),
                contents: bytemuck::cast_slice(&words),
                usage: wgpu::BufferUsages::UNIFORM,
            });
        let mut resources = Vec::with_capacity(bindings.slots().len());
        for (_, handle) in bindings.slots() {
            resources.push(self.buffer(*handle)?.buffer.clone());
        }

        let device = Arc::clone(&self.device);
        let pipeline = self.pipeline(kernel)?;
        let mut entries: Vec<wgpu::BindGroupEntry> = resources
            .iter()
            .enumerate()
            .map(|(index, buffer)| wgpu::BindGroupEntry {
                binding: index as u32,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        entries.push(wgpu::BindGroupEntry {
            binding: resources.len() as u32,
            resource: params.as_entire_binding(),
        });
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(kernel.name()),
            layout: &pipeline.layout,
            entries: &entries,
        });
        let compute = pipeline.pipeline.clone();

        let mut encoder = self
            .encoder
            .take()
            .unwrap_or_else(|| device.create_command_encoder(&Default::default()));
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(kernel.name()),
                timestamp_writes: None,
            });
            pass.set_pipeline(&compute);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups((count as u32).div_ceil(WORKGROUP_SIZE), 1, 1);
        }
        self.encoder = Some(encoder);
        Ok(())
    }

    fn barrier(&mut self) -> Result<()> {
        // wgpu orders storage accesses between compute passes; submitting here
        // keeps command buffers short
        self.flush();
        Ok(())
    }

    fn release(&mut self, buffer: BufferHandle) {
        if let Some(gpu) = self.buffers.remove(&buffer.id()) {
            gpu.buffer.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::HostDevice;
    use crate::config::BundlingConfig;
    use crate::model::NetworkInput;
    use crate::network_processor::{NetworkProcessor, ProcessingMode};

    fn polylines<D: ComputeDevice>(device: D) -> Vec<Vec<[f32; 3]>> {
        let mut processor = NetworkProcessor::from_input(
            device,
            &NetworkInput::uniform(&[4, 3, 2]),
            BundlingConfig::default(),
        )
        .unwrap();
        processor.run(ProcessingMode::EdgeAdvectForward, 4).unwrap();
        processor.polylines().unwrap()
    }

    #[test]
    #[ignore = "requires a GPU adapter"]
    fn buffers_round_trip() {
        let mut device = WgpuDevice::new().unwrap();
        let buffer = device.create_buffer("test", 5).unwrap();
        device.write_buffer(buffer, 1, &[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(device.read_buffer(buffer).unwrap(), vec![0.0, 1.0, 2.0, 3.0, 0.0]);
        device.release(buffer);
        assert!(device.read_buffer(buffer).is_err());
    }

    #[test]
    #[ignore = "requires a GPU adapter"]
    fn every_kernel_compiles() {
        let mut device = WgpuDevice::new().unwrap();
        for kernel in Kernel::ALL {
            device.pipeline(kernel).unwrap();
        }
    }

    #[test]
    #[ignore = "requires a GPU adapter"]
    fn matches_the_host_device() {
        let host = polylines(HostDevice::new());
        let gpu = polylines(WgpuDevice::new().unwrap());
        assert_eq!(host.len(), gpu.len());
        for (a, b) in host.iter().zip(&gpu) {
            assert_eq!(a.len(), b.len());
            for (p, q) in a.iter().zip(b) {
                for axis in 0..3 {
                    assert!((p[axis] - q[axis]).abs() < 1e-3, "{p:?} vs {q:?}");
                }
            }
        }
    }
}
