// gpu/backend.rs — `Backend` implementation on a real device through wgpu.
//
// QUEUE MODEL
// ───────────
// wgpu exposes one in-order queue per device: every submission starts after
// the previous one has finished. Wait-lists are therefore already satisfied
// by submission order for events this backend produced. They are still
// checked:
//
//   event of ours, pending    nothing to do, order covers it
//   any event, failed         the new command fails without running
//   foreign event, pending    INVALID_EVENT_WAIT_LIST, it can never resolve
//
// Each command is its own submission. `on_submitted_work_done` completes
// its event, and callbacks fire while the device is polled, which happens
// in `wait`, `finish` and `take_read`.
//
// PIPELINES
// ─────────
// A build compiles every unit once with the profile's default workgroup
// size to collect naga's diagnostics. Launch pipelines are created lazily,
// one per (program, kernel, local extent), because the extent is baked
// into the shader text.
//
// Buffer sizes are rounded up to 4 bytes (wgpu's copy alignment); reads
// return exactly the requested byte count.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::mpsc;

use wgpu::util::DeviceExt;

use crate::backend::{Backend, BuildFailure, Launch, ProgramBinary, ProgramHandle, RawArg, RawBuffer, ReadTicket};
use crate::buffer::{AccessMode, AlignedBytes};
use crate::device::{DeviceInfo, DeviceSelector};
use crate::error::Status;
use crate::event::{CompletionEvent, EventId, EventStatus, WaitList};
use crate::gpu::device::{dispatch_size, DeviceProfile, GpuDevice, GpuError};
use crate::gpu::wgsl;
use crate::program::{BuildLog, KernelSignature, KernelSource, ParamType};

const SCALAR_UNIFORM_BYTES: usize = 16;

struct GpuProgram {
    units: Vec<String>,
    /// Signature and index of the unit that defines it.
    kernels: Vec<(KernelSignature, usize)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PipelineKey {
    program: ProgramHandle,
    kernel: String,
    local: [u32; 3],
}

struct CachedPipeline {
    pipeline: wgpu::ComputePipeline,
    args_layout: wgpu::BindGroupLayout,
    grid_layout: wgpu::BindGroupLayout,
}

struct GpuBuffer {
    buffer: wgpu::Buffer,
    bytes: u64,
}

enum PendingRead {
    Mapping { staging: wgpu::Buffer, bytes: usize, done: mpsc::Receiver<Result<(), wgpu::BufferAsyncError>> },
    Skipped(Status),
}

pub struct WgpuBackend {
    gpu: GpuDevice,
    programs: HashMap<ProgramHandle, GpuProgram>,
    pipelines: HashMap<PipelineKey, CachedPipeline>,
    buffers: HashMap<RawBuffer, GpuBuffer>,
    reads: HashMap<ReadTicket, PendingRead>,
    own: HashSet<EventId>,
    next_handle: u64,
}

impl WgpuBackend {
    /// Open the adapter `selector` picks.
    ///
    /// # Errors
    /// `GpuError::NoDevice` when nothing matches the selector.
    pub fn open(selector: DeviceSelector, profile: DeviceProfile) -> Result<Self, GpuError> {
        Ok(WgpuBackend::new(GpuDevice::open(selector, profile)?))
    }

    pub fn new(gpu: GpuDevice) -> Self {
        WgpuBackend {
            gpu,
            programs: HashMap::new(),
            pipelines: HashMap::new(),
            buffers: HashMap::new(),
            reads: HashMap::new(),
            own: HashSet::new(),
            next_handle: 1,
        }
    }

    pub fn gpu(&self) -> &GpuDevice {
        &self.gpu
    }

    /// Every adapter the instance enumerated, not just the opened one.
    pub fn adapters(&self) -> &[DeviceInfo] {
        &self.gpu.devices
    }

    fn handle(&mut self) -> u64 {
        let h = self.next_handle;
        self.next_handle += 1;
        h
    }

    /// Check `wait` for a new command whose event is `event`. Returns
    /// `false` when the command must not run because a dependency failed;
    /// `event` has been failed already.
    fn admit(&self, wait: &WaitList, event: &CompletionEvent) -> Result<bool, Status> {
        for dep in wait.events() {
            match dep.status() {
                EventStatus::Error(status) => {
                    log::warn!("{} not run: {} failed with {status}", event.label(), dep.id());
                    event.fail(Status::ExecStatusErrorForEventsInWaitList);
                    return Ok(false);
                }
                EventStatus::Pending if !self.own.contains(&dep.id()) => {
                    log::error!("{} waits on {}, which no queue of this device will signal", event.label(), dep.id());
                    return Err(Status::InvalidEventWaitList);
                }
                _ => {}
            }
        }
        Ok(true)
    }

    /// Bind, encode and submit one launch.
    fn submit_kernel(&mut self, launch: &Launch) -> Result<(), Status> {
        let global = launch.range.global.dims();
        let local = match launch.range.local {
            Some(l) => l.dims().map(|d| d as u32),
            None => self.gpu.workgroup_size.for_rank(launch.range.global.rank()),
        };
        let groups = dispatch_size(global, local);
        if groups.iter().any(|g| *g > self.gpu.limits.max_compute_workgroups_per_dimension) {
            return Err(Status::InvalidGlobalWorkSize);
        }

        let key = PipelineKey { program: launch.program, kernel: launch.kernel.clone(), local };
        self.ensure_pipeline(&key)?;
        let cached = self.pipelines.get(&key).ok_or(Status::InvalidKernelName)?;

        let scalars: Vec<Option<wgpu::Buffer>> =
            launch.args.iter().map(|a| scalar_bytes(a).map(|b| self.uniform("scalar argument", &b))).collect();
        let mut bound: Vec<&wgpu::Buffer> = Vec::with_capacity(launch.args.len());
        for (arg, scalar) in launch.args.iter().zip(&scalars) {
            match (arg, scalar) {
                (RawArg::Buffer(raw), _) => bound.push(&self.buffers.get(raw).ok_or(Status::InvalidMemObject)?.buffer),
                (_, Some(u)) => bound.push(u),
                _ => return Err(Status::InvalidArgValue),
            }
        }
        let grid = [global[0] as u32, global[1] as u32, global[2] as u32, 0];
        let grid_buf = self.uniform("global extent", bytemuck::cast_slice(&grid));

        let device = &self.gpu.device;
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let entries: Vec<wgpu::BindGroupEntry> = bound
            .iter()
            .enumerate()
            .map(|(i, b)| wgpu::BindGroupEntry { binding: i as u32, resource: b.as_entire_binding() })
            .collect();
        let args_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&launch.kernel),
            layout: &cached.args_layout,
            entries: &entries,
        });
        let grid_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("global extent"),
            layout: &cached.grid_layout,
            entries: &[wgpu::BindGroupEntry { binding: 0, resource: grid_buf.as_entire_binding() }],
        });
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(&launch.kernel) });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(&launch.kernel),
                timestamp_writes: None,
            });
            pass.set_pipeline(&cached.pipeline);
            pass.set_bind_group(0, &args_group, &[]);
            pass.set_bind_group(1, &grid_group, &[]);
            pass.dispatch_workgroups(groups[0], groups[1], groups[2]);
        }
        self.gpu.queue.submit(std::iter::once(encoder.finish()));
        if let Some(e) = pollster::block_on(device.pop_error_scope()) {
            log::error!("launch of {} rejected: {e}", launch.kernel);
            return Err(Status::InvalidKernelArgs);
        }
        log::debug!("{} over {:?} in {:?} groups of {:?}", launch.kernel, global, groups, local);
        Ok(())
    }

    fn signal_when_done(&mut self, event: &CompletionEvent) {
        self.own.insert(event.id());
        let ev = event.clone();
        self.gpu.queue.on_submitted_work_done(move || {
            ev.complete();
        });
    }

    /// Compile `text` as one shader module. Returns the module and the
    /// formatted diagnostics with their counts.
    fn compile(&self, unit: &str, text: &str) -> (Option<wgpu::ShaderModule>, Vec<String>, usize, usize) {
        let device = &self.gpu.device;
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(unit),
            source: wgpu::ShaderSource::Wgsl(text.into()),
        });
        let info = pollster::block_on(module.get_compilation_info());
        let scope = pollster::block_on(device.pop_error_scope());

        let (mut lines, mut warnings, mut errors) = (Vec::new(), 0, 0);
        for m in &info.messages {
            let (line, col) = m.location.as_ref().map(|l| (l.line_number, l.line_position)).unwrap_or((0, 0));
            let severity = match m.message_type {
                wgpu::CompilationMessageType::Error => {
                    errors += 1;
                    "error"
                }
                wgpu::CompilationMessageType::Warning => {
                    warnings += 1;
                    "warning"
                }
                wgpu::CompilationMessageType::Info => "note",
            };
            lines.push(format!("{unit}:{line}:{col}: {severity}: {}", m.message));
        }
        if let Some(e) = scope {
            if errors == 0 {
                lines.push(format!("{unit}:0:0: error: {e}"));
                errors += 1;
            }
        }
        let module = (errors == 0).then_some(module);
        (module, lines, warnings, errors)
    }

    fn ensure_pipeline(&mut self, key: &PipelineKey) -> Result<(), Status> {
        if self.pipelines.contains_key(key) {
            return Ok(());
        }
        let program = self.programs.get(&key.program).ok_or(Status::InvalidValue)?;
        let (sig, unit) = program.kernels.iter().find(|(s, _)| s.name == key.kernel).ok_or(Status::InvalidKernelName)?;
        let text = wgsl::specialise(&program.units[*unit], key.local);
        let sig = sig.clone();

        let label = format!("{}[{}x{}x{}]", key.kernel, key.local[0], key.local[1], key.local[2]);
        let (module, lines, _, _) = self.compile(&label, &text);
        let Some(module) = module else {
            log::error!("specialising {label} failed:\n{}", lines.join("\n"));
            return Err(Status::InvalidWorkGroupSize);
        };

        let device = &self.gpu.device;
        let entries: Vec<wgpu::BindGroupLayoutEntry> = sig
            .params
            .iter()
            .enumerate()
            .map(|(i, p)| wgpu::BindGroupLayoutEntry {
                binding: i as u32,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: match p.ty {
                        ParamType::Buffer { writable, .. } => wgpu::BufferBindingType::Storage { read_only: !writable },
                        ParamType::Scalar(_) => wgpu::BufferBindingType::Uniform,
                    },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();
        let args_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("kernel arguments"),
            entries: &entries,
        });
        let grid_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("global extent"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });
        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(&label),
            bind_group_layouts: &[&args_layout, &grid_layout],
            push_constant_ranges: &[],
        });

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(&label),
            layout: Some(&layout),
            module: &module,
            entry_point: &key.kernel,
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });
        if let Some(e) = pollster::block_on(device.pop_error_scope()) {
            log::error!("pipeline {label} rejected: {e}");
            return Err(Status::InvalidKernelArgs);
        }
        log::debug!("created pipeline {label}");
        self.pipelines.insert(key.clone(), CachedPipeline { pipeline, args_layout, grid_layout });
        Ok(())
    }

    fn uniform(&self, label: &str, contents: &[u8]) -> wgpu::Buffer {
        self.gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents,
            usage: wgpu::BufferUsages::UNIFORM,
        })
    }
}

fn round_up4(bytes: u64) -> u64 {
    (bytes + 3) & !3
}

/// A scalar argument padded to one uniform slot.
fn scalar_bytes(arg: &RawArg) -> Option<[u8; SCALAR_UNIFORM_BYTES]> {
    let word = match *arg {
        RawArg::F32(v) => v.to_le_bytes(),
        RawArg::U32(v) => v.to_le_bytes(),
        RawArg::I32(v) => v.to_le_bytes(),
        RawArg::Buffer(_) => return None,
    };
    let mut out = [0u8; SCALAR_UNIFORM_BYTES];
    out[..4].copy_from_slice(&word);
    Some(out)
}

impl Backend for WgpuBackend {
    fn name(&self) -> &str {
        "wgpu"
    }

    fn devices(&self) -> &[DeviceInfo] {
        std::slice::from_ref(&self.gpu.info)
    }

    fn queue_device(&self) -> &DeviceInfo {
        &self.gpu.info
    }

    fn build_program(&mut self, units: &[KernelSource], targets: &[usize]) -> Result<ProgramBinary, BuildFailure> {
        if targets.iter().any(|t| *t != self.gpu.info.index) {
            return Err(BuildFailure { status: Status::InvalidDevice, logs: Vec::new() });
        }
        let (mut lines, mut warnings, mut errors) = (Vec::new(), 0, 0);
        let mut kernels: Vec<(KernelSignature, usize)> = Vec::new();

        for (i, unit) in units.iter().enumerate() {
            let scan = wgsl::scan(&unit.text);
            lines.extend(scan.diagnostics.iter().map(|d| format!("{}:{d}", unit.name)));
            errors += scan.errors;
            if scan.kernels.is_empty() {
                lines.push(format!("{}:1:1: warning: unit declares no entry points", unit.name));
                warnings += 1;
            }
            if scan.errors == 0 {
                let text = wgsl::specialise_default(&unit.text, self.gpu.workgroup_size, 3);
                let (_, l, w, e) = self.compile(&unit.name, &text);
                lines.extend(l);
                warnings += w;
                errors += e;
            }
            for k in scan.kernels {
                if kernels.iter().any(|(s, _)| s.name == k.name) {
                    lines.push(format!("link: error: redefinition of kernel `{}`", k.name));
                    errors += 1;
                } else {
                    kernels.push((k, i));
                }
            }
        }

        let mut text = lines.join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        let logs = vec![BuildLog { device: self.gpu.info.name.clone(), text, warnings, errors }];
        if errors > 0 {
            return Err(BuildFailure { status: Status::BuildProgramFailure, logs });
        }

        let handle = ProgramHandle(self.handle());
        let signatures = kernels.iter().map(|(s, _)| s.clone()).collect();
        self.programs.insert(handle, GpuProgram { units: units.iter().map(|u| u.text.clone()).collect(), kernels });
        Ok(ProgramBinary { handle, kernels: signatures, logs })
    }

    fn create_buffer(&mut self, bytes: u64, _access: AccessMode, init: Option<&[u8]>) -> Result<RawBuffer, Status> {
        if bytes == 0 || bytes > self.gpu.info.max_alloc_bytes {
            return Err(Status::InvalidBufferSize);
        }
        if init.is_some_and(|i| i.len() as u64 != bytes) {
            return Err(Status::InvalidValue);
        }
        let size = round_up4(bytes);
        let usage = wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST;
        let device = &self.gpu.device;

        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = match init {
            Some(init) => {
                let mut contents = init.to_vec();
                contents.resize(size as usize, 0);
                device.create_buffer_init(&wgpu::util::BufferInitDescriptor { label: None, contents: &contents, usage })
            }
            None => device.create_buffer(&wgpu::BufferDescriptor { label: None, size, usage, mapped_at_creation: false }),
        };
        if let Some(e) = pollster::block_on(device.pop_error_scope()) {
            log::error!("buffer of {bytes} bytes: {e}");
            return Err(Status::MemObjectAllocationFailure);
        }
        let raw = RawBuffer(self.handle());
        self.buffers.insert(raw, GpuBuffer { buffer, bytes });
        Ok(raw)
    }

    fn release_buffer(&mut self, buffer: RawBuffer) -> Result<(), Status> {
        let b = self.buffers.remove(&buffer).ok_or(Status::InvalidMemObject)?;
        b.buffer.destroy();
        Ok(())
    }

    fn enqueue_kernel(&mut self, launch: &Launch, wait: &WaitList) -> Result<CompletionEvent, Status> {
        let event = CompletionEvent::new(launch.kernel.clone());
        let submitted = match self.admit(wait, &event) {
            Ok(false) => return Ok(event),
            Ok(true) => self.submit_kernel(launch),
            Err(status) => Err(status),
        };
        match submitted {
            Ok(()) => {
                self.signal_when_done(&event);
                Ok(event)
            }
            Err(status) => {
                // Nothing on the queue will complete it now.
                event.fail(status);
                Err(status)
            }
        }
    }

    fn enqueue_barrier(&mut self, wait: &WaitList) -> Result<CompletionEvent, Status> {
        let event = CompletionEvent::new("barrier");
        if self.admit(wait, &event)? {
            // In-order queue: everything submitted so far is ahead of
            // anything submitted later.
            self.signal_when_done(&event);
        }
        Ok(event)
    }

    fn enqueue_read(&mut self, buffer: RawBuffer, bytes: u64, wait: &WaitList) -> Result<(CompletionEvent, ReadTicket), Status> {
        let src = self.buffers.get(&buffer).ok_or(Status::InvalidMemObject)?;
        if bytes == 0 || bytes > src.bytes {
            return Err(Status::InvalidValue);
        }
        let event = CompletionEvent::new("read");
        let ticket = ReadTicket(self.next_handle);
        self.next_handle += 1;
        if !self.admit(wait, &event)? {
            self.reads.insert(ticket, PendingRead::Skipped(Status::ExecStatusErrorForEventsInWaitList));
            return Ok((event, ticket));
        }

        let size = round_up4(bytes);
        let device = &self.gpu.device;
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("readback") });
        encoder.copy_buffer_to_buffer(&src.buffer, 0, &staging, 0, size);
        self.gpu.queue.submit(std::iter::once(encoder.finish()));

        let (tx, rx) = mpsc::channel();
        staging.slice(..).map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        self.reads.insert(ticket, PendingRead::Mapping { staging, bytes: bytes as usize, done: rx });
        self.signal_when_done(&event);
        Ok((event, ticket))
    }

    fn take_read(&mut self, ticket: ReadTicket) -> Result<AlignedBytes, Status> {
        let (staging, bytes, done) = match self.reads.remove(&ticket).ok_or(Status::InvalidValue)? {
            PendingRead::Skipped(status) => return Err(status),
            PendingRead::Mapping { staging, bytes, done } => (staging, bytes, done),
        };
        self.gpu.device.poll(wgpu::Maintain::Wait);
        match done.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log::error!("readback map failed: {e}");
                return Err(Status::MapFailure);
            }
            Err(_) => return Err(Status::MapFailure),
        }
        let data = {
            let mapped = staging.slice(..).get_mapped_range();
            AlignedBytes::from_bytes(&mapped[..bytes])
        };
        staging.unmap();
        Ok(data)
    }

    fn wait(&mut self, events: &[CompletionEvent]) -> Result<(), Status> {
        if events.iter().any(|e| !e.is_resolved() && !self.own.contains(&e.id())) {
            return Err(Status::InvalidEventWaitList);
        }
        if events.iter().any(|e| !e.is_resolved()) {
            self.gpu.device.poll(wgpu::Maintain::Wait);
        }
        if events.iter().any(|e| !e.is_resolved()) {
            return Err(Status::InvalidEventWaitList);
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), Status> {
        self.gpu.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }
}

impl fmt::Debug for WgpuBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WgpuBackend")
            .field("device", &self.gpu.info.name)
            .field("profile", &self.gpu.profile)
            .field("programs", &self.programs.len())
            .field("pipelines", &self.pipelines.len())
            .field("buffers", &self.buffers.len())
            .field("pending_reads", &self.reads.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferAllocator, BufferRegistry, BufferRole};
    use crate::dispatch::{Extent, KernelDispatcher, KernelInvocation};
    use crate::extract::ResultExtractor;
    use crate::pipeline::{PipelineController, PipelineSpec, State};
    use crate::program::ProgramBuilder;
    use crate::sources::{self, Dialect};

    #[test]
    fn sizes_round_to_copy_alignment() {
        assert_eq!(round_up4(1), 4);
        assert_eq!(round_up4(4), 4);
        assert_eq!(round_up4(2_097_153), 2_097_156);
    }

    #[test]
    fn scalars_fill_one_uniform_slot() {
        let b = scalar_bytes(&RawArg::F32(8.0)).unwrap();
        assert_eq!(&b[..4], &8.0f32.to_le_bytes());
        assert!(b[4..].iter().all(|x| *x == 0));
        assert!(scalar_bytes(&RawArg::Buffer(RawBuffer(1))).is_none());
    }

    // ---- GPU integration tests (subprocess isolation, see gpu::device) ----

    fn run_gpu_test_in_subprocess(test_name: &str) -> String {
        let output = std::process::Command::new("cargo")
            .args(["test", "--lib", "--", test_name, "--exact", "--ignored", "--nocapture"])
            .output()
            .unwrap_or_else(|e| panic!("failed to spawn subprocess for {test_name}: {e}"));
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        print!("{stdout}");
        eprint!("{stderr}");
        stdout + &stderr
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_pass_through_round_trip() {
        let mut backend = WgpuBackend::open(DeviceSelector::First, DeviceProfile::Native).unwrap();
        let program = ProgramBuilder::new().source(sources::pass_through(Dialect::Wgsl)).build(&mut backend).unwrap();
        let mut registry = BufferRegistry::new();
        let mut alloc = BufferAllocator::new();
        let input: Vec<f32> = (0..1000).map(|i| i as f32 * 0.37 - 11.0).collect();
        let src = alloc.allocate_f32(&mut backend, &mut registry, BufferRole::Named("src".into()), AccessMode::ReadOnly, &input).unwrap();
        let dst = alloc
            .allocate_f32(&mut backend, &mut registry, BufferRole::Named("dst".into()), AccessMode::ReadWrite, &[0.0; 1000])
            .unwrap();
        let inv = KernelInvocation::new("pass_through", Extent::d1(1000)).buffer(src).buffer(dst);
        let ev = KernelDispatcher::new().dispatch(&mut backend, &program, &mut registry, &inv).unwrap();
        let mapping = ResultExtractor::new().map(&mut backend, &mut registry, dst, &WaitList::new().with(&ev)).unwrap();
        let out = mapping.as_f32().unwrap();
        assert!(out.iter().zip(&input).all(|(a, b)| a.to_bits() == b.to_bits()));
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_rejected_launch_leaves_queue_usable() {
        let mut backend = WgpuBackend::open(DeviceSelector::First, DeviceProfile::Native).unwrap();
        let program = ProgramBuilder::new().source(sources::pass_through(Dialect::Wgsl)).build(&mut backend).unwrap();
        let mut registry = BufferRegistry::new();
        let mut alloc = BufferAllocator::new();
        let src = alloc.allocate_f32(&mut backend, &mut registry, BufferRole::Named("src".into()), AccessMode::ReadOnly, &[1.5; 64]).unwrap();
        let dst = alloc.allocate_f32(&mut backend, &mut registry, BufferRole::Named("dst".into()), AccessMode::ReadWrite, &[0.0; 64]).unwrap();
        let mut d = KernelDispatcher::new();

        // One item per group: more groups than any dimension allows.
        let too_many = KernelInvocation::new("pass_through", Extent::d1(1 << 20)).local(Extent::d1(1)).buffer(src).buffer(dst);
        let err = d.dispatch(&mut backend, &program, &mut registry, &too_many).unwrap_err();
        assert_eq!(err.status(), Status::InvalidGlobalWorkSize);
        assert!(registry.get(dst).unwrap().producer().is_none());

        let inv = KernelInvocation::new("pass_through", Extent::d1(64)).buffer(src).buffer(dst);
        let ev = d.dispatch(&mut backend, &program, &mut registry, &inv).unwrap();
        let mapping = ResultExtractor::new().map(&mut backend, &mut registry, dst, &WaitList::new().with(&ev)).unwrap();
        assert!(mapping.as_f32().unwrap().iter().all(|v| *v == 1.5));
        backend.finish().unwrap();
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_pipeline_reaches_done() {
        let backend = WgpuBackend::open(DeviceSelector::First, DeviceProfile::Native).unwrap();
        let mut c = PipelineController::new(backend, PipelineSpec::new(Dialect::Wgsl, 128, 320, 240));
        let out = c.run().unwrap();
        assert_eq!(c.state(), State::Done);
        assert!(out.image.data().iter().all(|b| *b != 0xFF));
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_pass_through_round_trip() {
        let out = run_gpu_test_in_subprocess("gpu::backend::tests::inner_pass_through_round_trip");
        assert!(out.contains("GPU_TEST_OK"), "inner test did not print GPU_TEST_OK:\n{out}");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_rejected_launch_leaves_queue_usable() {
        let out = run_gpu_test_in_subprocess("gpu::backend::tests::inner_rejected_launch_leaves_queue_usable");
        assert!(out.contains("GPU_TEST_OK"), "inner test did not print GPU_TEST_OK:\n{out}");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_pipeline_reaches_done() {
        let out = run_gpu_test_in_subprocess("gpu::backend::tests::inner_pipeline_reaches_done");
        assert!(out.contains("GPU_TEST_OK"), "inner test did not print GPU_TEST_OK:\n{out}");
    }
}
