// emu/mod.rs — Deterministic emulated device with an out-of-order queue.
//
// QUEUE MODEL
// ───────────
// Enqueues never execute anything. Commands sit in the queue with their
// dependency events until the host blocks (`wait` or `finish`). Each step
// then picks one *ready* command (every dependency resolved) with a seeded
// RNG and runs it. Commands that do not name each other may therefore run
// in either order, which is exactly how an out-of-order device queue may
// behave; a given seed always picks the same order.
//
//   kernel    runs its library body over the whole index space
//   barrier   completes once its dependencies have; later commands depend
//             on the most recent barrier
//   read      copies buffer bytes into a host-side ticket
//
// A command whose dependencies include a failed event fails with
// EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST without running.
//
// LAZY VISIBILITY
// ───────────────
// With `lazy_visibility`, reads see a per-buffer snapshot that only
// `finish` refreshes. Kernel writes still land immediately for other
// kernels. This reproduces drivers where waiting on the producing event is
// not enough for a host read to observe the data.

pub mod compiler;
pub mod kernels;

use std::collections::HashMap;
use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::backend::{Backend, BuildFailure, Launch, ProgramBinary, ProgramHandle, RawArg, RawBuffer, ReadTicket};
use crate::buffer::{AccessMode, AlignedBytes};
use crate::device::{DeviceInfo, DeviceKind, DeviceSelector};
use crate::error::{NoDeviceError, Status};
use crate::event::{CompletionEvent, EventStatus, WaitList};
use crate::program::{KernelSignature, KernelSource};

pub use kernels::{KernelArgs, KernelBody, KernelFault, KernelLibrary, WorkItem};

use kernels::{default_local, ArgValue};

const MIB: u64 = 1 << 20;
const GIB: u64 = 1 << 30;

/// The devices an emulated context enumerates.
#[derive(Debug, Clone, PartialEq)]
pub struct EmuPlatform {
    pub devices: Vec<DeviceInfo>,
}

impl EmuPlatform {
    pub fn new(devices: Vec<DeviceInfo>) -> Self {
        let devices = devices.into_iter().enumerate().map(|(i, d)| DeviceInfo { index: i, ..d }).collect();
        EmuPlatform { devices }
    }

    /// A platform with no devices, for exercising the no-device path.
    pub fn empty() -> Self {
        EmuPlatform { devices: Vec::new() }
    }
}

impl Default for EmuPlatform {
    /// One GPU-like and one CPU-like device; only the CPU has fp64.
    fn default() -> Self {
        EmuPlatform::new(vec![
            DeviceInfo {
                index: 0,
                name: "voxmarch emulated GPU".to_string(),
                vendor: "voxmarch".to_string(),
                kind: DeviceKind::Gpu,
                max_work_group_size: 256,
                max_work_item_sizes: [256, 256, 64],
                global_mem_bytes: GIB,
                max_alloc_bytes: 256 * MIB,
                extensions: vec!["cl_khr_byte_addressable_store".to_string()],
            },
            DeviceInfo {
                index: 1,
                name: "voxmarch emulated CPU".to_string(),
                vendor: "voxmarch".to_string(),
                kind: DeviceKind::Cpu,
                max_work_group_size: 1024,
                max_work_item_sizes: [1024, 1024, 1024],
                global_mem_bytes: 4 * GIB,
                max_alloc_bytes: GIB,
                extensions: vec!["cl_khr_byte_addressable_store".to_string(), "cl_khr_fp64".to_string()],
            },
        ])
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmuOptions {
    /// Seed of the ready-command picker.
    pub seed: u64,
    /// Host reads only observe kernel writes after `finish`.
    pub lazy_visibility: bool,
}

struct Storage {
    data: AlignedBytes,
    visible: Option<AlignedBytes>,
}

enum Op {
    Kernel(Launch),
    Barrier,
    Read { buffer: RawBuffer, bytes: usize, ticket: ReadTicket },
}

struct Command {
    event: CompletionEvent,
    deps: Vec<CompletionEvent>,
    op: Op,
}

impl Command {
    fn is_ready(&self) -> bool {
        self.deps.iter().all(|d| d.is_resolved())
    }
}

pub struct EmuBackend {
    devices: Vec<DeviceInfo>,
    queue_device: usize,
    options: EmuOptions,
    library: KernelLibrary,
    rng: StdRng,
    programs: HashMap<ProgramHandle, Vec<KernelSignature>>,
    buffers: HashMap<RawBuffer, Storage>,
    allocated: u64,
    queue: Vec<Command>,
    last_barrier: Option<CompletionEvent>,
    reads: HashMap<ReadTicket, AlignedBytes>,
    next_handle: u64,
    executed: usize,
}

impl EmuBackend {
    /// Open a context over `platform`, queueing to the selected device.
    ///
    /// # Errors
    /// `NoDeviceError` when no device satisfies `selector`.
    pub fn open(platform: EmuPlatform, selector: DeviceSelector, options: EmuOptions) -> Result<Self, NoDeviceError> {
        let chosen = selector.select(&platform.devices)?.index;
        let queue_device = platform.devices.iter().position(|d| d.index == chosen).unwrap_or(0);
        log::info!("emulated context on {} (seed {})", platform.devices[queue_device], options.seed);
        Ok(EmuBackend {
            devices: platform.devices,
            queue_device,
            options,
            library: KernelLibrary::reference(),
            rng: StdRng::seed_from_u64(options.seed),
            programs: HashMap::new(),
            buffers: HashMap::new(),
            allocated: 0,
            queue: Vec::new(),
            last_barrier: None,
            reads: HashMap::new(),
            next_handle: 1,
            executed: 0,
        })
    }

    /// Replace the kernel library used to link and run programs.
    pub fn with_library(mut self, library: KernelLibrary) -> Self {
        self.library = library;
        self
    }

    /// Add or replace one kernel body.
    pub fn register<F>(&mut self, name: impl Into<String>, body: F)
    where
        F: Fn(&WorkItem, &mut KernelArgs) -> Result<(), KernelFault> + Send + Sync + 'static,
    {
        self.library.register(name, body);
    }

    pub fn options(&self) -> EmuOptions {
        self.options
    }

    /// Commands executed so far, of any kind.
    pub fn executed(&self) -> usize {
        self.executed
    }

    /// Commands enqueued but not yet run.
    pub fn pending_commands(&self) -> usize {
        self.queue.len()
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.allocated
    }

    fn handle(&mut self) -> u64 {
        let h = self.next_handle;
        self.next_handle += 1;
        h
    }

    fn push(&mut self, label: &str, wait: &WaitList, op: Op) -> CompletionEvent {
        let event = CompletionEvent::new(label);
        let mut deps: Vec<CompletionEvent> = wait.events().to_vec();
        if let Some(b) = &self.last_barrier {
            if !deps.contains(b) {
                deps.push(b.clone());
            }
        }
        self.queue.push(Command { event: event.clone(), deps, op });
        event
    }

    /// Run one ready command. Returns false when none is ready.
    fn step(&mut self) -> bool {
        let ready: Vec<usize> = (0..self.queue.len()).filter(|&i| self.queue[i].is_ready()).collect();
        if ready.is_empty() {
            return false;
        }
        let pick = ready[self.rng.gen_range(0..ready.len())];
        let cmd = self.queue.remove(pick);
        self.executed += 1;

        if let Some(bad) = cmd.deps.iter().find(|d| matches!(d.status(), EventStatus::Error(_))) {
            log::warn!("{} skipped: dependency {} failed", cmd.event, bad.id());
            cmd.event.fail(Status::ExecStatusErrorForEventsInWaitList);
            return true;
        }

        let outcome = match &cmd.op {
            Op::Kernel(launch) => self.run_kernel(launch),
            Op::Barrier => Ok(()),
            Op::Read { buffer, bytes, ticket } => match self.buffers.get(buffer) {
                Some(s) => {
                    let src = s.visible.as_ref().unwrap_or(&s.data);
                    self.reads.insert(*ticket, src.truncated(*bytes));
                    Ok(())
                }
                None => Err(Status::InvalidMemObject),
            },
        };
        match outcome {
            Ok(()) => {
                cmd.event.complete();
            }
            Err(status) => {
                log::warn!("{} failed: {status}", cmd.event);
                cmd.event.fail(status);
            }
        }
        true
    }

    fn run_kernel(&mut self, launch: &Launch) -> Result<(), Status> {
        let body = self.library.get(&launch.kernel).cloned().ok_or(Status::InvalidKernelName)?;
        let global = launch.range.global.dims();
        let rank = launch.range.global.rank();
        let local = match launch.range.local {
            Some(l) => l.dims(),
            None => default_local(global, rank, &self.devices[self.queue_device]),
        };

        // Move bound buffers out of storage for the duration of the launch.
        let mut bound: Vec<Option<RawBuffer>> = Vec::with_capacity(launch.args.len());
        let mut values = Vec::with_capacity(launch.args.len());
        for arg in &launch.args {
            let value = match *arg {
                RawArg::Buffer(raw) => {
                    if let Some(j) = bound.iter().position(|b| *b == Some(raw)) {
                        bound.push(None);
                        ArgValue::Alias(j)
                    } else {
                        let data = match self.buffers.get_mut(&raw) {
                            Some(s) => std::mem::take(&mut s.data),
                            None => {
                                self.restore(&bound, values);
                                return Err(Status::InvalidMemObject);
                            }
                        };
                        bound.push(Some(raw));
                        ArgValue::Buffer(data)
                    }
                }
                RawArg::F32(v) => {
                    bound.push(None);
                    ArgValue::F32(v)
                }
                RawArg::U32(v) => {
                    bound.push(None);
                    ArgValue::U32(v)
                }
                RawArg::I32(v) => {
                    bound.push(None);
                    ArgValue::I32(v)
                }
            };
            values.push(value);
        }

        let mut args = KernelArgs::new(values);
        let groups = [global[0] / local[0], global[1] / local[1], global[2] / local[2]];
        let mut fault = None;
        'groups: for gz in 0..groups[2] {
            for gy in 0..groups[1] {
                for gx in 0..groups[0] {
                    for lz in 0..local[2] {
                        for ly in 0..local[1] {
                            for lx in 0..local[0] {
                                let item = WorkItem {
                                    global_id: [gx * local[0] + lx, gy * local[1] + ly, gz * local[2] + lz],
                                    global_size: global,
                                    local_id: [lx, ly, lz],
                                    local_size: local,
                                    group_id: [gx, gy, gz],
                                };
                                if let Err(f) = body(&item, &mut args) {
                                    log::warn!("{} faulted at {:?}: {f}", launch.kernel, item.global_id);
                                    fault = Some(f.status());
                                    break 'groups;
                                }
                            }
                        }
                    }
                }
            }
        }
        self.restore(&bound, args.into_values());
        fault.map_or(Ok(()), Err)
    }

    fn restore(&mut self, bound: &[Option<RawBuffer>], values: Vec<ArgValue>) {
        for (raw, value) in bound.iter().zip(values) {
            if let (Some(raw), ArgValue::Buffer(data)) = (raw, value) {
                if let Some(s) = self.buffers.get_mut(raw) {
                    s.data = data;
                }
            }
        }
    }

    fn refresh_visibility(&mut self) {
        for s in self.buffers.values_mut() {
            if s.visible.is_some() {
                s.visible = Some(s.data.clone());
            }
        }
    }
}

impl fmt::Debug for EmuBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmuBackend")
            .field("device", &self.devices[self.queue_device].name)
            .field("options", &self.options)
            .field("buffers", &self.buffers.len())
            .field("queued", &self.queue.len())
            .finish()
    }
}

impl Backend for EmuBackend {
    fn name(&self) -> &str {
        "emu"
    }

    fn devices(&self) -> &[DeviceInfo] {
        &self.devices
    }

    fn queue_device(&self) -> &DeviceInfo {
        &self.devices[self.queue_device]
    }

    fn build_program(&mut self, units: &[KernelSource], targets: &[usize]) -> Result<ProgramBinary, BuildFailure> {
        let mut logs = Vec::new();
        let mut kernels = None;
        for &t in targets {
            let Some(device) = self.devices.iter().find(|d| d.index == t) else {
                return Err(BuildFailure { status: Status::InvalidDevice, logs });
            };
            let (sigs, log) = compiler::compile(units, device, &self.library);
            logs.push(log);
            kernels.get_or_insert(sigs);
        }
        if logs.iter().any(|l| l.failed()) {
            return Err(BuildFailure { status: Status::BuildProgramFailure, logs });
        }
        let handle = ProgramHandle(self.handle());
        let kernels = kernels.unwrap_or_default();
        self.programs.insert(handle, kernels.clone());
        Ok(ProgramBinary { handle, kernels, logs })
    }

    fn create_buffer(&mut self, bytes: u64, _access: AccessMode, init: Option<&[u8]>) -> Result<RawBuffer, Status> {
        let device = &self.devices[self.queue_device];
        if bytes == 0 || bytes > device.max_alloc_bytes {
            return Err(Status::InvalidBufferSize);
        }
        if self.allocated + bytes > device.global_mem_bytes {
            return Err(Status::MemObjectAllocationFailure);
        }
        let data = match init {
            Some(init) if init.len() as u64 != bytes => return Err(Status::InvalidValue),
            Some(init) => AlignedBytes::from_bytes(init),
            None => AlignedBytes::zeroed(bytes as usize),
        };
        let visible = self.options.lazy_visibility.then(|| data.clone());
        let raw = RawBuffer(self.handle());
        self.buffers.insert(raw, Storage { data, visible });
        self.allocated += bytes;
        Ok(raw)
    }

    fn release_buffer(&mut self, buffer: RawBuffer) -> Result<(), Status> {
        let s = self.buffers.remove(&buffer).ok_or(Status::InvalidMemObject)?;
        self.allocated = self.allocated.saturating_sub(s.data.len() as u64);
        Ok(())
    }

    fn enqueue_kernel(&mut self, launch: &Launch, wait: &WaitList) -> Result<CompletionEvent, Status> {
        let sigs = self.programs.get(&launch.program).ok_or(Status::InvalidValue)?;
        if !sigs.iter().any(|k| k.name == launch.kernel) {
            return Err(Status::InvalidKernelName);
        }
        for arg in &launch.args {
            if let RawArg::Buffer(raw) = arg {
                if !self.buffers.contains_key(raw) {
                    return Err(Status::InvalidMemObject);
                }
            }
        }
        Ok(self.push(&launch.kernel, wait, Op::Kernel(launch.clone())))
    }

    fn enqueue_barrier(&mut self, wait: &WaitList) -> Result<CompletionEvent, Status> {
        let deps = if wait.is_empty() { self.queue.iter().map(|c| &c.event).collect() } else { wait.clone() };
        let ev = self.push("barrier", &deps, Op::Barrier);
        self.last_barrier = Some(ev.clone());
        Ok(ev)
    }

    fn enqueue_read(&mut self, buffer: RawBuffer, bytes: u64, wait: &WaitList) -> Result<(CompletionEvent, ReadTicket), Status> {
        let len = self.buffers.get(&buffer).ok_or(Status::InvalidMemObject)?.data.len() as u64;
        if bytes == 0 || bytes > len {
            return Err(Status::InvalidValue);
        }
        let ticket = ReadTicket(self.handle());
        let ev = self.push("read", wait, Op::Read { buffer, bytes: bytes as usize, ticket });
        Ok((ev, ticket))
    }

    fn take_read(&mut self, ticket: ReadTicket) -> Result<AlignedBytes, Status> {
        self.reads.remove(&ticket).ok_or(Status::InvalidValue)
    }

    fn wait(&mut self, events: &[CompletionEvent]) -> Result<(), Status> {
        while !events.iter().all(|e| e.is_resolved()) {
            if !self.step() {
                return Err(Status::InvalidEventWaitList);
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), Status> {
        while !self.queue.is_empty() {
            if !self.step() {
                log::error!("{} command(s) can never run", self.queue.len());
                return Err(Status::InvalidEventWaitList);
            }
        }
        self.refresh_visibility();
        Ok(())
    }
}
