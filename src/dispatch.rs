// dispatch.rs — Kernel invocations and the dispatcher.
//
// A `KernelInvocation` names an entry point, binds arguments by position,
// describes a 1–3 dimensional index space and carries its wait-list. The
// dispatcher validates all of it against the compiled signature and the
// buffer registry before anything reaches the queue:
//
//   1. the entry point exists and the argument count matches
//   2. the index space has rank 1..=3, nonzero extents, and a local extent
//      (if given) of the same rank that divides the global extent and fits
//      the device's work-group limits
//   3. every buffer argument exists, has the declared element type, allows
//      the access the parameter needs and is not mapped on the host
//   4. every buffer argument whose last write is still outstanding names
//      that write's event in the wait-list, or was fenced by a barrier
//
// Rule 4 is what makes cross-stage dependencies explicit: a stage cannot
// read another stage's output without naming the producer.
// `DependencyPolicy::Unchecked` turns it off so the stale-read hazard can be
// demonstrated.

use std::fmt;

use crate::backend::{Backend, Launch, RawArg};
use crate::buffer::{BufferId, BufferRegistry};
use crate::error::{DispatchError, Status};
use crate::event::{CompletionEvent, WaitList};
use crate::program::{CompiledProgram, ParamType, ScalarType};

/// One bound kernel argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Arg {
    Buffer(BufferId),
    F32(f32),
    U32(u32),
    I32(i32),
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Buffer(id) => write!(f, "buffer {id}"),
            Arg::F32(v) => write!(f, "float {v}"),
            Arg::U32(v) => write!(f, "uint {v}"),
            Arg::I32(v) => write!(f, "int {v}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Index space
// ---------------------------------------------------------------------------

/// Extent of an index space. Dimensions beyond `rank` are 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extent {
    dims: [usize; 3],
    rank: usize,
}

impl Extent {
    pub fn d1(x: usize) -> Self {
        Extent { dims: [x, 1, 1], rank: 1 }
    }

    pub fn d2(x: usize, y: usize) -> Self {
        Extent { dims: [x, y, 1], rank: 2 }
    }

    pub fn d3(x: usize, y: usize, z: usize) -> Self {
        Extent { dims: [x, y, z], rank: 3 }
    }

    /// Build from a slice of any length. Ranks outside 1..=3 are kept so
    /// the dispatcher can reject them with a proper status.
    pub fn from_slice(dims: &[usize]) -> Self {
        let mut d = [1; 3];
        for (slot, v) in d.iter_mut().zip(dims) {
            *slot = *v;
        }
        Extent { dims: d, rank: dims.len() }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// All three dimensions, padded with 1.
    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    /// Work-item count, or `None` when it overflows `usize`.
    pub fn total(&self) -> Option<usize> {
        self.dims.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self.rank.clamp(1, 3);
        let parts: Vec<String> = self.dims[..n].iter().map(|d| d.to_string()).collect();
        write!(f, "({})", parts.join(", "))
    }
}

/// Global extent plus optional local (work-group) extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NdRange {
    pub global: Extent,
    pub local: Option<Extent>,
}

impl NdRange {
    pub fn new(global: Extent) -> Self {
        NdRange { global, local: None }
    }
}

// ---------------------------------------------------------------------------
// KernelInvocation
// ---------------------------------------------------------------------------

/// A kernel launch request, built fluently.
#[derive(Debug, Clone)]
pub struct KernelInvocation {
    pub kernel: String,
    pub args: Vec<Arg>,
    pub range: NdRange,
    pub wait: WaitList,
}

impl KernelInvocation {
    pub fn new(kernel: impl Into<String>, global: Extent) -> Self {
        KernelInvocation { kernel: kernel.into(), args: Vec::new(), range: NdRange::new(global), wait: WaitList::new() }
    }

    pub fn arg(mut self, arg: Arg) -> Self {
        self.args.push(arg);
        self
    }

    pub fn buffer(self, id: BufferId) -> Self {
        self.arg(Arg::Buffer(id))
    }

    pub fn f32(self, v: f32) -> Self {
        self.arg(Arg::F32(v))
    }

    pub fn u32(self, v: u32) -> Self {
        self.arg(Arg::U32(v))
    }

    pub fn i32(self, v: i32) -> Self {
        self.arg(Arg::I32(v))
    }

    pub fn local(mut self, local: Extent) -> Self {
        self.range.local = Some(local);
        self
    }

    /// Add one producer event to the wait-list.
    pub fn after(mut self, event: &CompletionEvent) -> Self {
        self.wait.push(event);
        self
    }

    pub fn wait_on(mut self, wait: WaitList) -> Self {
        self.wait.extend(&wait);
        self
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DependencyPolicy {
    /// Reject reads of outstanding writes that are not in the wait-list.
    #[default]
    Enforce,
    /// Skip the producer check.
    Unchecked,
}

/// Validates invocations and enqueues them.
#[derive(Debug, Default)]
pub struct KernelDispatcher {
    policy: DependencyPolicy,
    dispatches: usize,
}

impl KernelDispatcher {
    pub fn new() -> Self {
        KernelDispatcher::default()
    }

    pub fn with_policy(policy: DependencyPolicy) -> Self {
        KernelDispatcher { policy, dispatches: 0 }
    }

    pub fn policy(&self) -> DependencyPolicy {
        self.policy
    }

    /// Number of kernels successfully enqueued.
    pub fn dispatches(&self) -> usize {
        self.dispatches
    }

    /// Validate `inv` and enqueue it. Returns the pending completion event.
    ///
    /// On success every writable buffer argument records the returned event
    /// as its producer and every read-only one records it as a reader.
    ///
    /// # Errors
    /// `DispatchError` for any binding, index-space or dependency problem,
    /// and `DispatchError::Rejected` when the backend refuses the command.
    pub fn dispatch<B: Backend + ?Sized>(
        &mut self,
        backend: &mut B,
        program: &CompiledProgram,
        registry: &mut BufferRegistry,
        inv: &KernelInvocation,
    ) -> Result<CompletionEvent, DispatchError> {
        match self.validate_and_enqueue(backend, program, registry, inv) {
            Ok(ev) => {
                self.dispatches += 1;
                log::info!("enqueue {} over {} gave: {} -> {}", inv.kernel, inv.range.global, Status::Success, ev.id());
                Ok(ev)
            }
            Err(e) => {
                log::error!("enqueue {} over {} gave: {} ({e})", inv.kernel, inv.range.global, e.status());
                Err(e)
            }
        }
    }

    fn validate_and_enqueue<B: Backend + ?Sized>(
        &mut self,
        backend: &mut B,
        program: &CompiledProgram,
        registry: &mut BufferRegistry,
        inv: &KernelInvocation,
    ) -> Result<CompletionEvent, DispatchError> {
        let kernel = inv.kernel.as_str();
        let sig = program.kernel(kernel).ok_or_else(|| DispatchError::UnknownKernel(kernel.to_string()))?;
        if sig.params.len() != inv.args.len() {
            return Err(DispatchError::ArgumentCount {
                kernel: kernel.to_string(),
                expected: sig.params.len(),
                actual: inv.args.len(),
            });
        }

        check_range(kernel, &inv.range, backend.queue_device())?;

        let mut raw_args = Vec::with_capacity(inv.args.len());
        let mut written = Vec::new();
        let mut read = Vec::new();
        for (index, (param, arg)) in sig.params.iter().zip(&inv.args).enumerate() {
            let mismatch = || DispatchError::ArgumentType {
                kernel: kernel.to_string(),
                index,
                expected: param.ty.to_string(),
                actual: arg.to_string(),
            };
            let raw = match (param.ty, *arg) {
                (ParamType::Buffer { element, writable }, Arg::Buffer(id)) => {
                    let entry = registry.get(id).ok_or(DispatchError::UnknownBuffer {
                        kernel: kernel.to_string(),
                        index,
                        buffer: id,
                    })?;
                    if entry.desc.element != element {
                        return Err(DispatchError::ArgumentType {
                            kernel: kernel.to_string(),
                            index,
                            expected: param.ty.to_string(),
                            actual: format!("{} buffer `{}`", entry.desc.element, entry.role()),
                        });
                    }
                    let allowed = if writable { entry.desc.access.device_can_write() } else { entry.desc.access.device_can_read() };
                    if !allowed {
                        return Err(DispatchError::AccessViolation {
                            kernel: kernel.to_string(),
                            index,
                            role: entry.role().to_string(),
                            access: entry.desc.access,
                            needed: if writable { "write" } else { "read" },
                        });
                    }
                    if entry.is_mapped() {
                        return Err(DispatchError::BufferMapped { kernel: kernel.to_string(), role: entry.role().to_string() });
                    }
                    if self.policy == DependencyPolicy::Enforce && !entry.write_is_settled() {
                        if let Some(producer) = entry.producer() {
                            if !inv.wait.contains(producer.id()) {
                                return Err(DispatchError::UnsatisfiedDependency {
                                    kernel: kernel.to_string(),
                                    role: entry.role().to_string(),
                                    producer: producer.id(),
                                });
                            }
                        }
                    }
                    if self.policy == DependencyPolicy::Enforce && writable {
                        if let Some(reader) = entry.unfenced_readers().iter().find(|r| !inv.wait.contains(r.id())) {
                            return Err(DispatchError::WriteAfterRead {
                                kernel: kernel.to_string(),
                                role: entry.role().to_string(),
                                reader: reader.id(),
                            });
                        }
                    }
                    if writable {
                        written.push(id);
                    } else {
                        read.push(id);
                    }
                    RawArg::Buffer(entry.raw)
                }
                (ParamType::Scalar(ScalarType::F32), Arg::F32(v)) => RawArg::F32(v),
                (ParamType::Scalar(ScalarType::U32), Arg::U32(v)) => RawArg::U32(v),
                (ParamType::Scalar(ScalarType::I32), Arg::I32(v)) => RawArg::I32(v),
                _ => return Err(mismatch()),
            };
            raw_args.push(raw);
        }

        let launch = Launch {
            program: program.handle(),
            kernel: kernel.to_string(),
            args: raw_args,
            range: inv.range,
        };
        let event = backend
            .enqueue_kernel(&launch, &inv.wait)
            .map_err(|status| DispatchError::Rejected { kernel: kernel.to_string(), status })?;

        for id in read {
            registry.record_reader(id, &event);
        }
        for id in written {
            registry.record_producer(id, &event);
        }
        Ok(event)
    }
}

fn check_range(kernel: &str, range: &NdRange, device: &crate::device::DeviceInfo) -> Result<(), DispatchError> {
    let invalid = |reason: String, status: Status| DispatchError::InvalidIndexSpace { kernel: kernel.to_string(), reason, status };

    let global = range.global;
    if !(1..=3).contains(&global.rank()) {
        return Err(invalid(format!("rank {} is outside 1..=3", global.rank()), Status::InvalidWorkDimension));
    }
    if global.dims().contains(&0) {
        return Err(invalid(format!("global extent {global} has a zero dimension"), Status::InvalidGlobalWorkSize));
    }
    if global.total().is_none() {
        return Err(invalid(format!("global extent {global} overflows the work-item count"), Status::InvalidGlobalWorkSize));
    }

    let Some(local) = range.local else {
        return Ok(());
    };
    if local.rank() != global.rank() {
        return Err(invalid(
            format!("local rank {} differs from global rank {}", local.rank(), global.rank()),
            Status::InvalidWorkDimension,
        ));
    }
    for (d, (&g, &l)) in global.dims().iter().zip(local.dims().iter()).enumerate() {
        if l == 0 || g % l != 0 {
            return Err(invalid(
                format!("local extent {local} does not divide global extent {global} in dimension {d}"),
                Status::InvalidWorkGroupSize,
            ));
        }
        if l > device.max_work_item_sizes[d] {
            return Err(invalid(
                format!("local size {l} exceeds the device limit {} in dimension {d}", device.max_work_item_sizes[d]),
                Status::InvalidWorkGroupSize,
            ));
        }
    }
    let items = local.total().unwrap_or(usize::MAX);
    if items > device.max_work_group_size {
        return Err(invalid(
            format!("work-group of {items} items exceeds the device limit {}", device.max_work_group_size),
            Status::InvalidWorkGroupSize,
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{AccessMode, BufferAllocator, BufferDesc, BufferRole, ElementType, Shape};
    use crate::device::DeviceSelector;
    use crate::emu::{EmuBackend, EmuOptions, EmuPlatform};
    use crate::program::ProgramBuilder;
    use crate::sources::{self, Dialect};

    struct Rig {
        backend: EmuBackend,
        program: CompiledProgram,
        registry: BufferRegistry,
        alloc: BufferAllocator,
    }

    fn rig() -> Rig {
        let mut backend = EmuBackend::open(EmuPlatform::default(), DeviceSelector::First, EmuOptions::default()).unwrap();
        let program = ProgramBuilder::new()
            .source(sources::generator(Dialect::OpenCl))
            .source(sources::pass_through(Dialect::OpenCl))
            .build(&mut backend)
            .unwrap();
        Rig { backend, program, registry: BufferRegistry::new(), alloc: BufferAllocator::new() }
    }

    fn voxels(r: &mut Rig, access: AccessMode) -> BufferId {
        let desc = BufferDesc::new(BufferRole::Voxels, ElementType::Byte, Shape::d3(4, 4, 4), access);
        r.alloc.allocate(&mut r.backend, &mut r.registry, desc, None).unwrap()
    }

    fn floats(r: &mut Rig, name: &str, access: AccessMode, n: usize) -> BufferId {
        let desc = BufferDesc::new(BufferRole::Named(name.into()), ElementType::Float32, Shape::d1(n), access);
        r.alloc.allocate(&mut r.backend, &mut r.registry, desc, None).unwrap()
    }

    #[test]
    fn unknown_kernel_is_rejected() {
        let mut r = rig();
        let mut d = KernelDispatcher::new();
        let err = d.dispatch(&mut r.backend, &r.program, &mut r.registry, &KernelInvocation::new("nope", Extent::d1(4))).unwrap_err();
        assert_eq!(err, DispatchError::UnknownKernel("nope".into()));
        assert_eq!(d.dispatches(), 0);
    }

    #[test]
    fn argument_count_and_type_are_checked() {
        let mut r = rig();
        let v = voxels(&mut r, AccessMode::ReadWrite);
        let mut d = KernelDispatcher::new();

        let inv = KernelInvocation::new("mandel", Extent::d3(4, 4, 4)).buffer(v);
        let err = d.dispatch(&mut r.backend, &r.program, &mut r.registry, &inv).unwrap_err();
        assert!(matches!(err, DispatchError::ArgumentCount { expected: 2, actual: 1, .. }));

        let inv = KernelInvocation::new("mandel", Extent::d3(4, 4, 4)).buffer(v).u32(8);
        let err = d.dispatch(&mut r.backend, &r.program, &mut r.registry, &inv).unwrap_err();
        assert!(matches!(err, DispatchError::ArgumentType { index: 1, .. }));

        let f = floats(&mut r, "f", AccessMode::ReadWrite, 64);
        let inv = KernelInvocation::new("mandel", Extent::d3(4, 4, 4)).buffer(f).f32(8.0);
        let err = d.dispatch(&mut r.backend, &r.program, &mut r.registry, &inv).unwrap_err();
        assert!(matches!(err, DispatchError::ArgumentType { index: 0, .. }));
    }

    #[test]
    fn read_only_buffer_cannot_be_written() {
        let mut r = rig();
        let v = voxels(&mut r, AccessMode::ReadOnly);
        let mut d = KernelDispatcher::new();
        let inv = KernelInvocation::new("mandel", Extent::d3(4, 4, 4)).buffer(v).f32(8.0);
        let err = d.dispatch(&mut r.backend, &r.program, &mut r.registry, &inv).unwrap_err();
        assert!(matches!(err, DispatchError::AccessViolation { needed: "write", .. }));
    }

    #[test]
    fn index_space_validation() {
        let mut r = rig();
        let v = voxels(&mut r, AccessMode::ReadWrite);
        let mut d = KernelDispatcher::new();
        let base = KernelInvocation::new("mandel", Extent::d3(4, 4, 4)).buffer(v).f32(8.0);

        let mut zero = base.clone();
        zero.range.global = Extent::d3(4, 0, 4);
        let err = d.dispatch(&mut r.backend, &r.program, &mut r.registry, &zero).unwrap_err();
        assert_eq!(err.status(), Status::InvalidGlobalWorkSize);

        let mut four_d = base.clone();
        four_d.range.global = Extent::from_slice(&[4, 4, 4, 4]);
        let err = d.dispatch(&mut r.backend, &r.program, &mut r.registry, &four_d).unwrap_err();
        assert_eq!(err.status(), Status::InvalidWorkDimension);

        let err = d.dispatch(&mut r.backend, &r.program, &mut r.registry, &base.clone().local(Extent::d3(3, 1, 1))).unwrap_err();
        assert_eq!(err.status(), Status::InvalidWorkGroupSize);

        let err = d.dispatch(&mut r.backend, &r.program, &mut r.registry, &base.clone().local(Extent::d2(2, 2))).unwrap_err();
        assert_eq!(err.status(), Status::InvalidWorkDimension);

        d.dispatch(&mut r.backend, &r.program, &mut r.registry, &base.local(Extent::d3(2, 2, 2))).unwrap();
        assert_eq!(d.dispatches(), 1);
    }

    #[test]
    fn oversized_work_group_is_rejected() {
        let mut r = rig();
        let f = floats(&mut r, "src", AccessMode::ReadOnly, 4096);
        let g = floats(&mut r, "dst", AccessMode::ReadWrite, 4096);
        let mut d = KernelDispatcher::new();
        let inv = KernelInvocation::new("pass_through", Extent::d1(4096)).buffer(f).buffer(g).local(Extent::d1(4096));
        let err = d.dispatch(&mut r.backend, &r.program, &mut r.registry, &inv).unwrap_err();
        assert_eq!(err.status(), Status::InvalidWorkGroupSize);
    }

    #[test]
    fn unnamed_producer_is_an_unsatisfied_dependency() {
        let mut r = rig();
        let src = floats(&mut r, "src", AccessMode::ReadWrite, 16);
        let mid = floats(&mut r, "mid", AccessMode::ReadWrite, 16);
        let dst = floats(&mut r, "dst", AccessMode::ReadWrite, 16);
        let mut d = KernelDispatcher::new();

        let first = KernelInvocation::new("pass_through", Extent::d1(16)).buffer(src).buffer(mid);
        let ev = d.dispatch(&mut r.backend, &r.program, &mut r.registry, &first).unwrap();
        assert_eq!(r.registry.get(mid).unwrap().producer().unwrap().id(), ev.id());

        let second = KernelInvocation::new("pass_through", Extent::d1(16)).buffer(mid).buffer(dst);
        let err = d.dispatch(&mut r.backend, &r.program, &mut r.registry, &second).unwrap_err();
        assert!(matches!(err, DispatchError::UnsatisfiedDependency { producer, .. } if producer == ev.id()));

        d.dispatch(&mut r.backend, &r.program, &mut r.registry, &second.after(&ev)).unwrap();
    }

    #[test]
    fn completed_producer_still_has_to_be_named() {
        let mut r = rig();
        let src = floats(&mut r, "src", AccessMode::ReadWrite, 16);
        let mid = floats(&mut r, "mid", AccessMode::ReadWrite, 16);
        let dst = floats(&mut r, "dst", AccessMode::ReadWrite, 16);
        let mut d = KernelDispatcher::new();

        let first = KernelInvocation::new("pass_through", Extent::d1(16)).buffer(src).buffer(mid);
        let ev = d.dispatch(&mut r.backend, &r.program, &mut r.registry, &first).unwrap();
        r.backend.finish().unwrap();
        assert_eq!(ev.status(), crate::event::EventStatus::Complete);

        let second = KernelInvocation::new("pass_through", Extent::d1(16)).buffer(mid).buffer(dst);
        let err = d.dispatch(&mut r.backend, &r.program, &mut r.registry, &second).unwrap_err();
        assert!(matches!(err, DispatchError::UnsatisfiedDependency { producer, .. } if producer == ev.id()));
    }

    #[test]
    fn writer_must_name_in_flight_readers() {
        let mut r = rig();
        let src = floats(&mut r, "src", AccessMode::ReadWrite, 16);
        let dst = floats(&mut r, "dst", AccessMode::ReadWrite, 16);
        let other = floats(&mut r, "other", AccessMode::ReadWrite, 16);
        let mut d = KernelDispatcher::new();

        let read_src = KernelInvocation::new("pass_through", Extent::d1(16)).buffer(src).buffer(dst);
        let reader = d.dispatch(&mut r.backend, &r.program, &mut r.registry, &read_src).unwrap();
        assert_eq!(r.registry.get(src).unwrap().unfenced_readers().len(), 1);

        let overwrite = KernelInvocation::new("pass_through", Extent::d1(16)).buffer(other).buffer(src);
        let err = d.dispatch(&mut r.backend, &r.program, &mut r.registry, &overwrite).unwrap_err();
        assert!(matches!(err, DispatchError::WriteAfterRead { reader: id, .. } if id == reader.id()));
        assert_eq!(err.status(), Status::InvalidEventWaitList);

        d.dispatch(&mut r.backend, &r.program, &mut r.registry, &overwrite.after(&reader)).unwrap();
        assert!(r.registry.get(src).unwrap().unfenced_readers().is_empty());
        assert_eq!(d.dispatches(), 2);
    }

    #[test]
    fn overflowing_global_extent_is_rejected() {
        let mut r = rig();
        let v = voxels(&mut r, AccessMode::ReadWrite);
        let mut d = KernelDispatcher::new();
        let huge = 1usize << 22;
        assert_eq!(Extent::d3(huge, huge, huge).total(), None);
        let inv = KernelInvocation::new("mandel", Extent::d3(huge, huge, huge)).buffer(v).f32(8.0);
        let err = d.dispatch(&mut r.backend, &r.program, &mut r.registry, &inv).unwrap_err();
        assert_eq!(err.status(), Status::InvalidGlobalWorkSize);
        assert_eq!(d.dispatches(), 0);
    }

    #[test]
    fn unchecked_policy_skips_producer_check() {
        let mut r = rig();
        let src = floats(&mut r, "src", AccessMode::ReadWrite, 8);
        let mid = floats(&mut r, "mid", AccessMode::ReadWrite, 8);
        let dst = floats(&mut r, "dst", AccessMode::ReadWrite, 8);
        let mut d = KernelDispatcher::with_policy(DependencyPolicy::Unchecked);
        d.dispatch(&mut r.backend, &r.program, &mut r.registry, &KernelInvocation::new("pass_through", Extent::d1(8)).buffer(src).buffer(mid)).unwrap();
        d.dispatch(&mut r.backend, &r.program, &mut r.registry, &KernelInvocation::new("pass_through", Extent::d1(8)).buffer(mid).buffer(dst)).unwrap();
        assert_eq!(d.dispatches(), 2);
    }

    #[test]
    fn unknown_buffer_is_rejected() {
        let mut r = rig();
        let mut d = KernelDispatcher::new();
        let inv = KernelInvocation::new("mandel", Extent::d3(4, 4, 4)).buffer(BufferId(99)).f32(8.0);
        let err = d.dispatch(&mut r.backend, &r.program, &mut r.registry, &inv).unwrap_err();
        assert!(matches!(err, DispatchError::UnknownBuffer { index: 0, .. }));
    }
}
