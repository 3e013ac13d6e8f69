//! GPU engine: the RK4 step as a WGSL f64 compute shader.
//!
//! Construction is an eager probe: the adapter, an f64-capable device and
//! the compiled pipeline all have to exist before a `GpuBackend` is handed
//! out, so "GPU unavailable" always surfaces at resolve time and never in
//! the middle of a run.
//!
//! ## Adapter selection
//!
//! | `DUSTSIM_GPU_ADAPTER` | Behavior |
//! |-----------------------|----------|
//! | *(unset)* or `auto`   | first discrete adapter with `SHADER_F64`, else any with it |
//! | `0`, `1`, …           | adapter by enumeration index |
//! | substring             | case-insensitive adapter name match |
//!
//! Without the `gpu` cargo feature the backend still exists but always
//! reports itself unavailable.

#[cfg(feature = "gpu")]
pub use enabled::GpuBackend;

#[cfg(not(feature = "gpu"))]
pub use disabled::GpuBackend;

#[cfg(feature = "gpu")]
mod enabled {
    use std::env;
    use std::sync::mpsc;

    use bytemuck::{Pod, Zeroable};
    use log::{debug, info};
    use wgpu::util::DeviceExt;

    use crate::error::{BackendUnavailable, DustError, Result};
    use crate::simulation::engine::Backend;
    use crate::simulation::forces::R_EPS;
    use crate::simulation::params::{BackendKind, SimulationConfig};
    use crate::simulation::result::{trajectory_len, SimulationResult};

    const SHADER: &str = include_str!("gpu/dust_rk4.wgsl");
    const WORKGROUP_SIZE: u32 = 64;

    /// Uniform block matching `Dims` in the shader
    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    struct Dims {
        n: u32,
        step: u32,
        _pad: [u32; 2],
    }

    pub struct GpuBackend {
        adapter_name: String,
        device: wgpu::Device,
        queue: wgpu::Queue,
        pipeline: wgpu::ComputePipeline,
    }

    fn unavailable(message: impl Into<String>) -> BackendUnavailable {
        BackendUnavailable::Gpu(message.into())
    }

    fn numeric(message: impl Into<String>) -> DustError {
        DustError::numeric(BackendKind::Gpu, message)
    }

    impl GpuBackend {
        /// Probe the host and bring up device and pipeline
        pub fn new() -> std::result::Result<Self, BackendUnavailable> {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .build()
                .map_err(|e| unavailable(format!("failed to create async runtime: {e}")))?;
            runtime.block_on(Self::connect())
        }

        /// Name of the adapter the device was created on
        pub fn adapter_name(&self) -> &str {
            &self.adapter_name
        }

        async fn connect() -> std::result::Result<Self, BackendUnavailable> {
            let selector = env::var("DUSTSIM_GPU_ADAPTER")
                .unwrap_or_default()
                .trim()
                .to_lowercase();

            let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
            let adapters = instance.enumerate_adapters(wgpu::Backends::all());
            if adapters.is_empty() {
                return Err(unavailable("no GPU adapter found"));
            }

            let adapter = select_adapter(adapters, &selector)?;
            let info = adapter.get_info();
            if !adapter.features().contains(wgpu::Features::SHADER_F64) {
                return Err(unavailable(format!(
                    "adapter '{}' does not support f64 shaders",
                    info.name
                )));
            }

            let (device, queue) = adapter
                .request_device(
                    &wgpu::DeviceDescriptor {
                        label: Some("dustsim device"),
                        required_features: wgpu::Features::SHADER_F64,
                        required_limits: adapter.limits(),
                        memory_hints: wgpu::MemoryHints::Performance,
                    },
                    None,
                )
                .await
                .map_err(|e| unavailable(format!("device request on '{}' failed: {e}", info.name)))?;

            device.push_error_scope(wgpu::ErrorFilter::Validation);
            let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("dust_rk4"),
                source: wgpu::ShaderSource::Wgsl(SHADER.into()),
            });
            let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("dust_rk4"),
                layout: None,
                module: &module,
                entry_point: "main",
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });
            if let Some(e) = device.pop_error_scope().await {
                return Err(unavailable(format!("shader compilation failed: {e}")));
            }

            info!("GPU backend ready on {} ({:?})", info.name, info.backend);
            Ok(Self {
                adapter_name: info.name,
                device,
                queue,
                pipeline,
            })
        }

        fn storage_init(&self, label: &str, data: &[f64], usage: wgpu::BufferUsages) -> wgpu::Buffer {
            self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: bytemuck::cast_slice(data),
                usage: wgpu::BufferUsages::STORAGE | usage,
            })
        }
    }

    fn select_adapter(
        adapters: Vec<wgpu::Adapter>,
        selector: &str,
    ) -> std::result::Result<wgpu::Adapter, BackendUnavailable> {
        if selector.is_empty() || selector == "auto" {
            let mut discrete = None;
            let mut fallback = None;
            for a in adapters {
                if !a.features().contains(wgpu::Features::SHADER_F64) {
                    continue;
                }
                if a.get_info().device_type == wgpu::DeviceType::DiscreteGpu && discrete.is_none() {
                    discrete = Some(a);
                } else if fallback.is_none() {
                    fallback = Some(a);
                }
            }
            return discrete
                .or(fallback)
                .ok_or_else(|| unavailable("no GPU adapter supports f64 shaders"));
        }

        if let Ok(index) = selector.parse::<usize>() {
            if index < adapters.len() {
                return adapters
                    .into_iter()
                    .nth(index)
                    .ok_or_else(|| unavailable(format!("no adapter at index {index}")));
            }
        }
        adapters
            .into_iter()
            .find(|a| a.get_info().name.to_lowercase().contains(selector))
            .ok_or_else(|| unavailable(format!("no adapter matching '{selector}'")))
    }

    impl Backend for GpuBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Gpu
        }

        fn run(&self, config: &SimulationConfig) -> Result<SimulationResult> {
            let particles = config.particles();
            let n = particles.count();
            let steps = config.num_steps();
            let dt = config.time_step();

            let limits = self.device.limits();
            let state_len = trajectory_len(n, steps, BackendKind::Gpu)?;
            let state_bytes = state_len
                .checked_mul(std::mem::size_of::<f64>())
                .and_then(|bytes| u64::try_from(bytes).ok())
                .ok_or_else(|| numeric("trajectory byte size overflows"))?;
            if state_bytes > u64::from(limits.max_storage_buffer_binding_size) || state_bytes > limits.max_buffer_size {
                return Err(numeric(format!(
                    "trajectory needs {state_bytes} bytes, device allows {} per binding",
                    limits.max_storage_buffer_binding_size
                )));
            }
            let n_u32 = u32::try_from(n).map_err(|_| numeric("particle count exceeds u32"))?;
            let workgroups = n_u32.div_ceil(WORKGROUP_SIZE);
            if workgroups > limits.max_compute_workgroups_per_dimension {
                return Err(numeric(format!("{n} particles exceed the dispatch limit")));
            }

            // history with row 0 filled, later rows written by the shader
            let mut history = vec![0.0_f64; state_len];
            for (dst, src) in history.iter_mut().zip(particles.initial_state().iter()) {
                *dst = *src;
            }

            let e = config.electric_field();
            let b = config.magnetic_field();
            let params = [
                dt,
                0.5 * dt,
                dt / 6.0,
                config.gm_sun(),
                R_EPS,
                e.x,
                e.y,
                e.z,
                b.x,
                b.y,
                b.z,
            ];

            let state_buf = self.storage_init("state", &history, wgpu::BufferUsages::COPY_SRC);
            let qm_buf = self.storage_init("q_over_m", &config.q_over_m().to_vec(), wgpu::BufferUsages::empty());
            let beta_buf = self.storage_init("beta", particles.betas(), wgpu::BufferUsages::empty());
            let params_buf = self.storage_init("params", &params, wgpu::BufferUsages::empty());
            let dims_buf = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("dims"),
                size: std::mem::size_of::<Dims>() as u64,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });

            let layout = self.pipeline.get_bind_group_layout(0);
            let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("dust_rk4"),
                layout: &layout,
                entries: &[
                    wgpu::BindGroupEntry { binding: 0, resource: state_buf.as_entire_binding() },
                    wgpu::BindGroupEntry { binding: 1, resource: qm_buf.as_entire_binding() },
                    wgpu::BindGroupEntry { binding: 2, resource: beta_buf.as_entire_binding() },
                    wgpu::BindGroupEntry { binding: 3, resource: params_buf.as_entire_binding() },
                    wgpu::BindGroupEntry { binding: 4, resource: dims_buf.as_entire_binding() },
                ],
            });

            debug!("GPU run: particles={n}, steps={steps}, workgroups={workgroups}");

            // one submit per step; the dims write lands before its dispatch
            for step in 1..steps {
                let dims = Dims {
                    n: n_u32,
                    step: step as u32,
                    _pad: [0; 2],
                };
                self.queue.write_buffer(&dims_buf, 0, bytemuck::bytes_of(&dims));

                let mut encoder = self
                    .device
                    .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("rk4 step") });
                {
                    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                        label: Some("rk4 step"),
                        timestamp_writes: None,
                    });
                    pass.set_pipeline(&self.pipeline);
                    pass.set_bind_group(0, &bind_group, &[]);
                    pass.dispatch_workgroups(workgroups, 1, 1);
                }
                self.queue.submit(std::iter::once(encoder.finish()));
            }

            // readback
            let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("state staging"),
                size: state_bytes,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("readback") });
            encoder.copy_buffer_to_buffer(&state_buf, 0, &staging, 0, state_bytes);
            self.queue.submit(std::iter::once(encoder.finish()));

            let slice = staging.slice(..);
            let (sender, receiver) = mpsc::channel();
            slice.map_async(wgpu::MapMode::Read, move |result| {
                let _ = sender.send(result);
            });
            self.device.poll(wgpu::Maintain::Wait);
            receiver
                .recv()
                .map_err(|_| numeric("buffer map callback was dropped"))?
                .map_err(|e| numeric(format!("buffer mapping failed: {e}")))?;

            let values: Vec<f64> = {
                let data = slice.get_mapped_range();
                bytemuck::try_cast_slice::<u8, f64>(&data)
                    .map_err(|e| numeric(format!("unexpected readback layout: {e}")))?
                    .to_vec()
            };
            staging.unmap();

            let state = ndarray::Array3::from_shape_vec((steps, n, 6), values)
                .map_err(|e| numeric(e.to_string()))?;
            SimulationResult::new(config.times(), state, BackendKind::Gpu)
        }
    }
}

#[cfg(not(feature = "gpu"))]
mod disabled {
    use crate::error::{BackendUnavailable, DustError, Result};
    use crate::simulation::engine::Backend;
    use crate::simulation::params::{BackendKind, SimulationConfig};
    use crate::simulation::result::SimulationResult;

    /// Placeholder compiled without wgpu; it can never be constructed
    pub struct GpuBackend {
        _private: (),
    }

    impl GpuBackend {
        pub fn new() -> std::result::Result<Self, BackendUnavailable> {
            Err(BackendUnavailable::Gpu(
                "dustsim was built without the `gpu` feature; rebuild with `--features gpu`".to_string(),
            ))
        }

        pub fn adapter_name(&self) -> &str {
            "none"
        }
    }

    impl Backend for GpuBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Gpu
        }

        fn run(&self, _config: &SimulationConfig) -> Result<SimulationResult> {
            Err(DustError::numeric(BackendKind::Gpu, "GPU support is not compiled in"))
        }
    }
}
