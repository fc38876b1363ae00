// backend.rs — The device seam.
//
// The orchestration core (builder, allocator, dispatcher, sync graph,
// extractor, controller) talks to a device only through this trait. Two
// implementations exist:
//
//   emu::EmuBackend   deterministic CPU executor with an out-of-order queue
//   gpu::WgpuBackend  real device through wgpu (in-order queue)
//
// Every enqueue returns immediately with a pending `CompletionEvent`; the
// backend is the only party that signals it. `wait` and `finish` are the
// only blocking entry points.

use crate::buffer::{AccessMode, AlignedBytes};
use crate::device::DeviceInfo;
use crate::dispatch::NdRange;
use crate::error::Status;
use crate::event::{CompletionEvent, WaitList};
use crate::program::{BuildLog, KernelSignature, KernelSource};

/// Backend-side buffer handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawBuffer(pub u64);

/// Backend-side program handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramHandle(pub u64);

/// Claim on the host copy produced by an enqueued read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReadTicket(pub u64);

/// Successful build output.
#[derive(Debug, Clone)]
pub struct ProgramBinary {
    pub handle: ProgramHandle,
    pub kernels: Vec<KernelSignature>,
    pub logs: Vec<BuildLog>,
}

/// Failed build output; logs cover every target device.
#[derive(Debug, Clone)]
pub struct BuildFailure {
    pub status: Status,
    pub logs: Vec<BuildLog>,
}

/// An argument after registry resolution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawArg {
    Buffer(RawBuffer),
    F32(f32),
    U32(u32),
    I32(i32),
}

/// A fully validated kernel launch.
#[derive(Debug, Clone, PartialEq)]
pub struct Launch {
    pub program: ProgramHandle,
    pub kernel: String,
    pub args: Vec<RawArg>,
    pub range: NdRange,
}

pub trait Backend {
    /// Short backend name for log lines.
    fn name(&self) -> &str;

    /// Every device of the backend's context.
    fn devices(&self) -> &[DeviceInfo];

    /// The device the command queue submits to.
    fn queue_device(&self) -> &DeviceInfo;

    /// Build all `units` for every device index in `targets`.
    fn build_program(&mut self, units: &[KernelSource], targets: &[usize]) -> Result<ProgramBinary, BuildFailure>;

    fn create_buffer(&mut self, bytes: u64, access: AccessMode, init: Option<&[u8]>) -> Result<RawBuffer, Status>;

    fn release_buffer(&mut self, buffer: RawBuffer) -> Result<(), Status>;

    /// Enqueue a kernel that starts only after every event in `wait` completes.
    fn enqueue_kernel(&mut self, launch: &Launch, wait: &WaitList) -> Result<CompletionEvent, Status>;

    /// Enqueue a barrier: every later command waits for `wait`, or for every
    /// earlier command when `wait` is empty.
    fn enqueue_barrier(&mut self, wait: &WaitList) -> Result<CompletionEvent, Status>;

    /// Enqueue a device-to-host copy of the first `bytes` bytes of `buffer`.
    fn enqueue_read(
        &mut self,
        buffer: RawBuffer,
        bytes: u64,
        wait: &WaitList,
    ) -> Result<(CompletionEvent, ReadTicket), Status>;

    /// Collect the host copy of a completed read.
    fn take_read(&mut self, ticket: ReadTicket) -> Result<AlignedBytes, Status>;

    /// Block until every event in `events` has resolved.
    ///
    /// An event resolving with an error is not a failure of `wait` itself;
    /// callers inspect the event status. `Err` means the events can never
    /// resolve.
    fn wait(&mut self, events: &[CompletionEvent]) -> Result<(), Status>;

    /// Block until every submitted command has finished (the drain).
    fn finish(&mut self) -> Result<(), Status>;
}
