// sync.rs — The synchronization graph: waits, barriers and the drain.
//
// Three primitives, and nothing is inserted implicitly:
//
//   wait / wait_all   block the host until events resolve
//   barrier           non-blocking; every later command waits for the given
//                     events (all earlier commands when the list is empty)
//   drain             block until the whole queue has finished
//
// The drain exists for backends where waiting on the producing event has
// been observed not to make buffer contents visible to a subsequent host
// read. It only runs before mapping when `DrainPolicy::BeforeMap` is chosen.

use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::buffer::BufferRegistry;
use crate::error::{DispatchError, Status, WaitError};
use crate::event::{CompletionEvent, EventStatus, WaitList};

/// Whether to drain the queue before mapping results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainPolicy {
    #[default]
    Never,
    BeforeMap,
}

#[derive(Debug, Default)]
pub struct SyncGraph {
    policy: DrainPolicy,
    waits: usize,
    barriers: usize,
    drains: usize,
}

impl SyncGraph {
    pub fn new(policy: DrainPolicy) -> Self {
        SyncGraph { policy, ..SyncGraph::default() }
    }

    pub fn policy(&self) -> DrainPolicy {
        self.policy
    }

    pub fn waits(&self) -> usize {
        self.waits
    }

    pub fn barriers(&self) -> usize {
        self.barriers
    }

    pub fn drains(&self) -> usize {
        self.drains
    }

    /// Block until `event` resolves.
    ///
    /// # Errors
    /// `WaitError` when the event resolves with an error, or can never resolve.
    pub fn wait<B: Backend + ?Sized>(&mut self, backend: &mut B, event: &CompletionEvent) -> Result<(), WaitError> {
        self.wait_all(backend, &WaitList::new().with(event))
    }

    /// Block until every event in `wait` resolves. Fails on the first event
    /// that resolved with an error.
    pub fn wait_all<B: Backend + ?Sized>(&mut self, backend: &mut B, wait: &WaitList) -> Result<(), WaitError> {
        self.waits += 1;
        if let Err(status) = backend.wait(wait.events()) {
            let first = wait.events().iter().find(|e| !e.is_resolved());
            log::error!("wait on {} event(s) gave: {status}", wait.len());
            return Err(WaitError {
                event: first.map(|e| e.id()),
                label: first.map(|e| e.label().to_string()).unwrap_or_else(|| "wait-list".to_string()),
                status,
            });
        }
        for ev in wait.events() {
            match ev.status() {
                EventStatus::Complete => {}
                EventStatus::Error(status) => {
                    log::error!("wait on {} gave: {status}", ev.id());
                    return Err(WaitError { event: Some(ev.id()), label: ev.label().to_string(), status });
                }
                EventStatus::Pending => {
                    return Err(WaitError {
                        event: Some(ev.id()),
                        label: ev.label().to_string(),
                        status: Status::InvalidEventWaitList,
                    });
                }
            }
        }
        log::debug!("wait on {} event(s) gave: {}", wait.len(), Status::Success);
        Ok(())
    }

    /// Enqueue a barrier on `wait` and mark the fenced writes in `registry`.
    ///
    /// # Errors
    /// `DispatchError::Rejected` when the backend refuses the barrier.
    pub fn barrier<B: Backend + ?Sized>(
        &mut self,
        backend: &mut B,
        registry: &mut BufferRegistry,
        wait: &WaitList,
    ) -> Result<CompletionEvent, DispatchError> {
        let ev = backend.enqueue_barrier(wait).map_err(|status| {
            log::error!("barrier on {} event(s) gave: {status}", wait.len());
            DispatchError::Rejected { kernel: "barrier".to_string(), status }
        })?;
        registry.fence(wait);
        self.barriers += 1;
        log::debug!("barrier on {} event(s) gave: {} -> {}", wait.len(), Status::Success, ev.id());
        Ok(ev)
    }

    /// Block until every submitted command has finished.
    pub fn drain<B: Backend + ?Sized>(&mut self, backend: &mut B, registry: &mut BufferRegistry) -> Result<(), WaitError> {
        backend.finish().map_err(|status| {
            log::error!("queue drain gave: {status}");
            WaitError { event: None, label: "queue drain".to_string(), status }
        })?;
        registry.fence_all();
        self.drains += 1;
        log::info!("queue drain gave: {}", Status::Success);
        Ok(())
    }

    /// Run the drain if the policy asks for it. Returns whether it ran.
    pub fn before_map<B: Backend + ?Sized>(&mut self, backend: &mut B, registry: &mut BufferRegistry) -> Result<bool, WaitError> {
        match self.policy {
            DrainPolicy::Never => Ok(false),
            DrainPolicy::BeforeMap => {
                self.drain(backend, registry)?;
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{AccessMode, BufferAllocator, BufferRole};
    use crate::device::DeviceSelector;
    use crate::dispatch::{Extent, KernelDispatcher, KernelInvocation};
    use crate::emu::{EmuBackend, EmuOptions, EmuPlatform};
    use crate::program::ProgramBuilder;
    use crate::sources::{self, Dialect};

    fn backend() -> EmuBackend {
        EmuBackend::open(EmuPlatform::default(), DeviceSelector::First, EmuOptions::default()).unwrap()
    }

    #[test]
    fn wait_on_foreign_event_fails() {
        let mut b = backend();
        let mut sync = SyncGraph::default();
        let orphan = CompletionEvent::new("orphan");
        let err = sync.wait(&mut b, &orphan).unwrap_err();
        assert_eq!(err.status, Status::InvalidEventWaitList);
        assert_eq!(err.event, Some(orphan.id()));
    }

    #[test]
    fn wait_reports_error_status() {
        let mut b = backend();
        let mut sync = SyncGraph::default();
        let failed = CompletionEvent::new("k");
        failed.fail(Status::OutOfResources);
        let err = sync.wait(&mut b, &failed).unwrap_err();
        assert_eq!(err.status, Status::OutOfResources);
        assert_eq!(err.label, "k");
    }

    #[test]
    fn barrier_fences_listed_writes() {
        let mut b = backend();
        let program = ProgramBuilder::new().source(sources::pass_through(Dialect::OpenCl)).build(&mut b).unwrap();
        let mut reg = BufferRegistry::new();
        let mut alloc = BufferAllocator::new();
        let src = alloc.allocate_f32(&mut b, &mut reg, BufferRole::Named("src".into()), AccessMode::ReadOnly, &[1.0; 8]).unwrap();
        let dst = alloc.allocate_f32(&mut b, &mut reg, BufferRole::Named("dst".into()), AccessMode::ReadWrite, &[0.0; 8]).unwrap();
        let mut d = KernelDispatcher::new();
        let ev = d.dispatch(&mut b, &program, &mut reg, &KernelInvocation::new("pass_through", Extent::d1(8)).buffer(src).buffer(dst)).unwrap();

        let mut sync = SyncGraph::default();
        assert!(!reg.get(dst).unwrap().is_fenced());
        sync.barrier(&mut b, &mut reg, &WaitList::new().with(&ev)).unwrap();
        assert!(reg.get(dst).unwrap().is_fenced());
        assert_eq!(sync.barriers(), 1);
        assert_eq!(ev.status(), EventStatus::Pending);
    }

    #[test]
    fn before_map_respects_policy() {
        let mut b = backend();
        let mut reg = BufferRegistry::new();
        let mut never = SyncGraph::new(DrainPolicy::Never);
        assert!(!never.before_map(&mut b, &mut reg).unwrap());
        assert_eq!(never.drains(), 0);

        let mut always = SyncGraph::new(DrainPolicy::BeforeMap);
        assert!(always.before_map(&mut b, &mut reg).unwrap());
        assert_eq!(always.drains(), 1);
    }
}
