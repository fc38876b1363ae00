// tests/test_events.rs — Integration tests for completion events, waits,
// barriers and dependency enforcement.
//
// These run with `cargo test --test test_events`.

use voxmarch::backend::Backend;
use voxmarch::buffer::{AccessMode, BufferAllocator, BufferDesc, BufferId, BufferRegistry, BufferRole, ElementType, Shape};
use voxmarch::device::DeviceSelector;
use voxmarch::dispatch::{DependencyPolicy, Extent, KernelDispatcher, KernelInvocation};
use voxmarch::emu::{EmuBackend, EmuOptions, EmuPlatform, KernelFault};
use voxmarch::error::{DispatchError, Status};
use voxmarch::event::{CompletionEvent, EventStatus, WaitList};
use voxmarch::extract::ResultExtractor;
use voxmarch::program::{CompiledProgram, ProgramBuilder};
use voxmarch::sources::{self, Dialect};
use voxmarch::sync::{DrainPolicy, SyncGraph};

struct Fixture {
    backend: EmuBackend,
    registry: BufferRegistry,
    alloc: BufferAllocator,
    program: CompiledProgram,
}

fn fixture(seed: u64) -> Fixture {
    let mut backend = EmuBackend::open(EmuPlatform::default(), DeviceSelector::First, EmuOptions { seed, lazy_visibility: false }).unwrap();
    let program = ProgramBuilder::new().source(sources::pass_through(Dialect::OpenCl)).build(&mut backend).unwrap();
    Fixture { backend, registry: BufferRegistry::new(), alloc: BufferAllocator::new(), program }
}

impl Fixture {
    fn floats(&mut self, name: &str, len: usize, access: AccessMode) -> BufferId {
        let desc = BufferDesc::new(BufferRole::Named(name.into()), ElementType::Float32, Shape::d1(len), access);
        self.alloc.allocate(&mut self.backend, &mut self.registry, desc, None).unwrap()
    }

    fn copy(&mut self, d: &mut KernelDispatcher, src: BufferId, dst: BufferId, wait: WaitList) -> Result<CompletionEvent, DispatchError> {
        let inv = KernelInvocation::new("pass_through", Extent::d1(16)).buffer(src).buffer(dst).wait_on(wait);
        d.dispatch(&mut self.backend, &self.program, &mut self.registry, &inv)
    }
}

// ===== Event lifecycle =====

#[test]
fn dispatch_does_not_block() {
    let mut f = fixture(0);
    let mut d = KernelDispatcher::new();
    let a = f.floats("a", 16, AccessMode::ReadWrite);
    let b = f.floats("b", 16, AccessMode::ReadWrite);

    let ev = f.copy(&mut d, a, b, WaitList::new()).unwrap();
    assert_eq!(ev.status(), EventStatus::Pending);
    assert_eq!(f.backend.executed(), 0);
    assert_eq!(f.backend.pending_commands(), 1);

    let mut sync = SyncGraph::new(DrainPolicy::Never);
    sync.wait(&mut f.backend, &ev).unwrap();
    assert_eq!(ev.status(), EventStatus::Complete);
    assert_eq!(f.backend.executed(), 1);
    assert_eq!(sync.waits(), 1);
}

#[test]
fn events_are_signalled_once() {
    let ev = CompletionEvent::new("manual");
    assert!(!ev.is_resolved());
    assert!(ev.complete());
    assert!(!ev.complete());
    assert!(!ev.fail(Status::OutOfResources));
    assert_eq!(ev.status(), EventStatus::Complete);

    // Clones share the one signal.
    let other = CompletionEvent::new("manual");
    let clone = other.clone();
    assert!(clone.fail(Status::OutOfResources));
    assert_eq!(other.status(), EventStatus::Error(Status::OutOfResources));
    assert_eq!(other.id(), clone.id());
}

#[test]
fn waiting_on_a_foreign_event_is_an_error() {
    let mut f = fixture(0);
    let stranger = CompletionEvent::new("never enqueued");
    let mut sync = SyncGraph::new(DrainPolicy::Never);
    let err = sync.wait(&mut f.backend, &stranger).unwrap_err();
    assert_eq!(err.status, Status::InvalidEventWaitList);
    assert_eq!(err.event, Some(stranger.id()));
}

// ===== Failure propagation =====

#[test]
fn failed_dependency_poisons_dependants() {
    let mut f = fixture(3);
    f.backend.register("pass_through", |_, _| Err(KernelFault::Custom("boom".into())));
    let mut d = KernelDispatcher::new();
    let a = f.floats("a", 16, AccessMode::ReadWrite);
    let b = f.floats("b", 16, AccessMode::ReadWrite);
    let c = f.floats("c", 16, AccessMode::ReadWrite);

    let first = f.copy(&mut d, a, b, WaitList::new()).unwrap();
    let second = f.copy(&mut d, b, c, WaitList::new().with(&first)).unwrap();

    let mut sync = SyncGraph::new(DrainPolicy::Never);
    let err = sync.wait(&mut f.backend, &second).unwrap_err();
    assert_eq!(err.status, Status::ExecStatusErrorForEventsInWaitList);
    assert_eq!(first.status(), EventStatus::Error(Status::OutOfResources));

    // Mapping behind the failed chain reports the failure instead of data.
    let mut extract = ResultExtractor::new();
    let map_err = extract.map(&mut f.backend, &mut f.registry, c, &WaitList::new().with(&second)).unwrap_err();
    assert_eq!(map_err.status(), Status::ExecStatusErrorForEventsInWaitList);
}

// ===== Hazards and barriers =====

#[test]
fn enforced_hazard_needs_the_producer() {
    let mut f = fixture(0);
    let mut d = KernelDispatcher::new();
    let a = f.floats("a", 16, AccessMode::ReadWrite);
    let b = f.floats("b", 16, AccessMode::ReadWrite);
    let c = f.floats("c", 16, AccessMode::ReadWrite);

    let producer = f.copy(&mut d, a, b, WaitList::new()).unwrap();
    let err = f.copy(&mut d, b, c, WaitList::new()).unwrap_err();
    match err {
        DispatchError::UnsatisfiedDependency { producer: p, .. } => assert_eq!(p, producer.id()),
        other => panic!("expected an unsatisfied dependency, got {other:?}"),
    }
    assert_eq!(d.dispatches(), 1);
    assert_eq!(f.backend.pending_commands(), 1);

    f.copy(&mut d, b, c, WaitList::new().with(&producer)).unwrap();
    assert_eq!(d.dispatches(), 2);
}

#[test]
fn barrier_satisfies_the_hazard() {
    let mut f = fixture(0);
    let mut d = KernelDispatcher::new();
    let mut sync = SyncGraph::new(DrainPolicy::Never);
    let a = f.floats("a", 16, AccessMode::ReadWrite);
    let b = f.floats("b", 16, AccessMode::ReadWrite);
    let c = f.floats("c", 16, AccessMode::ReadWrite);

    f.copy(&mut d, a, b, WaitList::new()).unwrap();
    let fence = sync.barrier(&mut f.backend, &mut f.registry, &WaitList::new()).unwrap();
    assert!(f.registry.get(b).unwrap().is_fenced());

    let consumer = f.copy(&mut d, b, c, WaitList::new()).unwrap();
    sync.wait(&mut f.backend, &consumer).unwrap();
    assert_eq!(fence.status(), EventStatus::Complete);
    assert_eq!(sync.barriers(), 1);
}

#[test]
fn completed_producer_still_has_to_be_named_or_fenced() {
    let mut f = fixture(0);
    let mut d = KernelDispatcher::new();
    let mut sync = SyncGraph::new(DrainPolicy::Never);
    let a = f.floats("a", 16, AccessMode::ReadWrite);
    let b = f.floats("b", 16, AccessMode::ReadWrite);
    let c = f.floats("c", 16, AccessMode::ReadWrite);

    let producer = f.copy(&mut d, a, b, WaitList::new()).unwrap();
    sync.wait(&mut f.backend, &producer).unwrap();
    assert_eq!(producer.status(), EventStatus::Complete);

    // Having finished does not stand in for the wait-list.
    let err = f.copy(&mut d, b, c, WaitList::new()).unwrap_err();
    assert!(matches!(err, DispatchError::UnsatisfiedDependency { producer: p, .. } if p == producer.id()));

    sync.barrier(&mut f.backend, &mut f.registry, &WaitList::new().with(&producer)).unwrap();
    f.copy(&mut d, b, c, WaitList::new()).unwrap();
}

#[test]
fn overwriting_a_buffer_in_use_needs_its_readers() {
    let mut f = fixture(0);
    let mut d = KernelDispatcher::new();
    let mut sync = SyncGraph::new(DrainPolicy::Never);
    let a = f.floats("a", 16, AccessMode::ReadWrite);
    let b = f.floats("b", 16, AccessMode::ReadWrite);
    let c = f.floats("c", 16, AccessMode::ReadWrite);

    let reader = f.copy(&mut d, a, b, WaitList::new()).unwrap();
    let err = f.copy(&mut d, c, a, WaitList::new()).unwrap_err();
    match err {
        DispatchError::WriteAfterRead { reader: r, ref role, .. } => {
            assert_eq!(r, reader.id());
            assert_eq!(role, "a");
        }
        other => panic!("expected a write-after-read, got {other:?}"),
    }

    // A barrier over every queued command clears the readers.
    sync.barrier(&mut f.backend, &mut f.registry, &WaitList::new()).unwrap();
    let writer = f.copy(&mut d, c, a, WaitList::new()).unwrap();
    sync.wait(&mut f.backend, &writer).unwrap();
    assert_eq!(reader.status(), EventStatus::Complete);
}

#[test]
fn unchecked_policy_lets_the_hazard_through() {
    let mut f = fixture(0);
    let mut d = KernelDispatcher::with_policy(DependencyPolicy::Unchecked);
    let a = f.floats("a", 16, AccessMode::ReadWrite);
    let b = f.floats("b", 16, AccessMode::ReadWrite);
    let c = f.floats("c", 16, AccessMode::ReadWrite);

    f.copy(&mut d, a, b, WaitList::new()).unwrap();
    f.copy(&mut d, b, c, WaitList::new()).unwrap();
    assert_eq!(d.dispatches(), 2);
}

#[test]
fn drain_runs_everything_and_fences_all_writes() {
    let mut f = fixture(5);
    let mut d = KernelDispatcher::new();
    let mut sync = SyncGraph::new(DrainPolicy::BeforeMap);
    let a = f.floats("a", 16, AccessMode::ReadWrite);
    let b = f.floats("b", 16, AccessMode::ReadWrite);
    let c = f.floats("c", 16, AccessMode::ReadWrite);

    let first = f.copy(&mut d, a, b, WaitList::new()).unwrap();
    let second = f.copy(&mut d, a, c, WaitList::new()).unwrap();
    assert!(sync.before_map(&mut f.backend, &mut f.registry).unwrap());
    assert_eq!(f.backend.pending_commands(), 0);
    assert!(first.is_resolved() && second.is_resolved());
    assert!(f.registry.get(b).unwrap().is_fenced());
    assert!(f.registry.get(c).unwrap().is_fenced());
    assert_eq!(sync.drains(), 1);
    assert!(f.backend.finish().is_ok());
}
