// extract.rs — Mapping device buffers back to the host.
//
// A mapping is a two-step affair: `enqueue_map` queues the device-to-host
// copy behind its own wait-list and returns a `PendingMapping`; `finish`
// blocks on that copy and yields a `Mapping`. `map` does both. While a
// mapping is open its buffer counts as mapped and no kernel may bind it.

use crate::backend::{Backend, ReadTicket};
use crate::buffer::{AlignedBytes, BufferId, BufferRegistry, BufferRole, ElementType, Shape};
use crate::error::{MapError, Status};
use crate::event::{CompletionEvent, EventStatus, WaitList};

/// A map request whose copy has been enqueued but not yet waited on.
#[derive(Debug)]
pub struct PendingMapping {
    buffer: BufferId,
    role: BufferRole,
    element: ElementType,
    shape: Shape,
    event: CompletionEvent,
    ticket: ReadTicket,
}

impl PendingMapping {
    pub fn buffer(&self) -> BufferId {
        self.buffer
    }

    /// Event of the enqueued copy.
    pub fn event(&self) -> &CompletionEvent {
        &self.event
    }
}

/// A host-visible view over one buffer's contents, valid until unmapped.
#[derive(Debug)]
pub struct Mapping {
    buffer: BufferId,
    role: BufferRole,
    element: ElementType,
    shape: Shape,
    data: AlignedBytes,
}

impl Mapping {
    pub fn buffer(&self) -> BufferId {
        self.buffer
    }

    pub fn role(&self) -> &BufferRole {
        &self.role
    }

    pub fn element(&self) -> ElementType {
        self.element
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    /// Byte view. Fails unless the buffer holds bytes.
    pub fn as_bytes(&self) -> Result<&[u8], MapError> {
        self.require(ElementType::Byte)?;
        Ok(self.data.as_bytes())
    }

    /// Float view. Fails unless the buffer holds floats.
    pub fn as_f32(&self) -> Result<&[f32], MapError> {
        self.require(ElementType::Float32)?;
        Ok(self.data.as_f32())
    }

    /// Owned copy shaped like the buffer.
    pub fn to_byte_grid(&self) -> Result<HostGrid<u8>, MapError> {
        Ok(HostGrid { shape: self.shape, data: self.as_bytes()?.to_vec() })
    }

    pub fn to_f32_grid(&self) -> Result<HostGrid<f32>, MapError> {
        Ok(HostGrid { shape: self.shape, data: self.as_f32()?.to_vec() })
    }

    fn require(&self, requested: ElementType) -> Result<(), MapError> {
        if self.element != requested {
            return Err(MapError::ElementMismatch { role: self.role.to_string(), actual: self.element, requested });
        }
        Ok(())
    }
}

/// Host-owned result grid with shape-derived indexing.
#[derive(Debug, Clone, PartialEq)]
pub struct HostGrid<T> {
    shape: Shape,
    data: Vec<T>,
}

impl<T: Copy> HostGrid<T> {
    /// Returns `None` when `data` does not hold exactly `shape.len()` elements.
    pub fn new(shape: Shape, data: Vec<T>) -> Option<Self> {
        (data.len() == shape.len()).then_some(HostGrid { shape, data })
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get(&self, x: usize, y: usize, z: usize) -> Option<T> {
        self.shape.index(x, y, z).map(|i| self.data[i])
    }
}

#[derive(Debug, Default)]
pub struct ResultExtractor {
    maps: usize,
}

impl ResultExtractor {
    pub fn new() -> Self {
        ResultExtractor::default()
    }

    /// Number of mappings completed.
    pub fn maps(&self) -> usize {
        self.maps
    }

    /// Queue the host copy of `id` behind `wait`. Does not block.
    ///
    /// # Errors
    /// `MapError::AccessDenied` for write-only buffers, `UnknownBuffer` for a
    /// stale id, `Driver` when the backend refuses the copy.
    pub fn enqueue_map<B: Backend + ?Sized>(
        &mut self,
        backend: &mut B,
        registry: &mut BufferRegistry,
        id: BufferId,
        wait: &WaitList,
    ) -> Result<PendingMapping, MapError> {
        let entry = registry.get_mut(id).ok_or(MapError::UnknownBuffer(id))?;
        let role = entry.desc.role.clone();
        if !entry.desc.access.host_can_read() {
            let err = MapError::AccessDenied { role: role.to_string(), access: entry.desc.access };
            log::error!("map `{role}` gave: {} ({err})", err.status());
            return Err(err);
        }
        let (event, ticket) = backend.enqueue_read(entry.raw, entry.byte_len(), wait).map_err(|status| {
            log::error!("map `{role}` gave: {status}");
            MapError::Driver { role: role.to_string(), status }
        })?;
        entry.mapped += 1;
        Ok(PendingMapping { buffer: id, role, element: entry.desc.element, shape: entry.desc.shape, event, ticket })
    }

    /// Block until the copy behind `pending` is done and return the view.
    ///
    /// # Errors
    /// `MapError::WaitListFailed` when the copy or anything it waited on
    /// resolved with an error or could never run.
    pub fn finish<B: Backend + ?Sized>(
        &mut self,
        backend: &mut B,
        registry: &mut BufferRegistry,
        pending: PendingMapping,
    ) -> Result<Mapping, MapError> {
        let role = pending.role.to_string();
        let outcome = match backend.wait(std::slice::from_ref(&pending.event)) {
            Err(status) => Err(status),
            Ok(()) => match pending.event.status() {
                EventStatus::Complete => Ok(()),
                EventStatus::Error(status) => Err(status),
                EventStatus::Pending => Err(Status::InvalidEventWaitList),
            },
        };
        if let Err(status) = outcome {
            release_mapping(registry, pending.buffer);
            log::error!("map `{role}` gave: {status}");
            return Err(MapError::WaitListFailed { role, status });
        }

        let data = backend.take_read(pending.ticket).map_err(|status| {
            release_mapping(registry, pending.buffer);
            log::error!("map `{role}` gave: {status}");
            MapError::Driver { role: role.clone(), status }
        })?;
        self.maps += 1;
        log::info!("map `{role}` ({} bytes) gave: {}", data.len(), Status::Success);
        Ok(Mapping {
            buffer: pending.buffer,
            role: pending.role,
            element: pending.element,
            shape: pending.shape,
            data,
        })
    }

    /// Blocking map: `enqueue_map` followed by `finish`.
    pub fn map<B: Backend + ?Sized>(
        &mut self,
        backend: &mut B,
        registry: &mut BufferRegistry,
        id: BufferId,
        wait: &WaitList,
    ) -> Result<Mapping, MapError> {
        let pending = self.enqueue_map(backend, registry, id, wait)?;
        self.finish(backend, registry, pending)
    }

    /// Close a mapping. The buffer may be bound by kernels again.
    pub fn unmap(&mut self, registry: &mut BufferRegistry, mapping: Mapping) {
        release_mapping(registry, mapping.buffer);
    }
}

fn release_mapping(registry: &mut BufferRegistry, id: BufferId) {
    if let Some(entry) = registry.get_mut(id) {
        entry.mapped = entry.mapped.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{AccessMode, BufferAllocator, BufferDesc};
    use crate::device::DeviceSelector;
    use crate::emu::{EmuBackend, EmuOptions, EmuPlatform};

    fn backend() -> EmuBackend {
        EmuBackend::open(EmuPlatform::default(), DeviceSelector::First, EmuOptions::default()).unwrap()
    }

    #[test]
    fn host_grid_indexing() {
        let g = HostGrid::new(Shape::d2(3, 2), vec![0u8, 1, 2, 3, 4, 5]).unwrap();
        assert_eq!(g.get(2, 1, 0), Some(5));
        assert_eq!(g.get(3, 0, 0), None);
        assert!(HostGrid::new(Shape::d2(3, 2), vec![0u8; 5]).is_none());
    }

    #[test]
    fn typed_view_must_match_element() {
        let mut b = backend();
        let mut reg = BufferRegistry::new();
        let mut alloc = BufferAllocator::new();
        let id = alloc
            .allocate(&mut b, &mut reg, BufferDesc::new(BufferRole::Image, ElementType::Byte, Shape::d2(4, 2), AccessMode::ReadWrite), Some(&[7u8; 8]))
            .unwrap();
        let mut ex = ResultExtractor::new();
        let m = ex.map(&mut b, &mut reg, id, &WaitList::new()).unwrap();
        assert_eq!(m.as_bytes().unwrap(), &[7u8; 8]);
        assert!(matches!(m.as_f32(), Err(MapError::ElementMismatch { .. })));
        assert!(reg.get(id).unwrap().is_mapped());
        ex.unmap(&mut reg, m);
        assert!(!reg.get(id).unwrap().is_mapped());
        assert_eq!(ex.maps(), 1);
    }

    #[test]
    fn non_blocking_map_is_pending_until_finished() {
        let mut b = backend();
        let mut reg = BufferRegistry::new();
        let mut alloc = BufferAllocator::new();
        let id = alloc.allocate_f32(&mut b, &mut reg, BufferRole::Debug, AccessMode::ReadOnly, &[0.5, 0.25]).unwrap();
        let mut ex = ResultExtractor::new();
        let pending = ex.enqueue_map(&mut b, &mut reg, id, &WaitList::new()).unwrap();
        assert_eq!(pending.event().status(), EventStatus::Pending);
        let m = ex.finish(&mut b, &mut reg, pending).unwrap();
        assert_eq!(m.as_f32().unwrap(), &[0.5, 0.25]);
    }

    #[test]
    fn failed_wait_list_is_a_map_error() {
        let mut b = backend();
        let mut reg = BufferRegistry::new();
        let mut alloc = BufferAllocator::new();
        let id = alloc.allocate_f32(&mut b, &mut reg, BufferRole::Debug, AccessMode::ReadWrite, &[1.0]).unwrap();
        let failed = CompletionEvent::new("upstream");
        failed.fail(Status::OutOfResources);
        let mut ex = ResultExtractor::new();
        let err = ex.map(&mut b, &mut reg, id, &WaitList::new().with(&failed)).unwrap_err();
        assert_eq!(err, MapError::WaitListFailed { role: "debug".into(), status: Status::ExecStatusErrorForEventsInWaitList });
        assert!(!reg.get(id).unwrap().is_mapped());
    }

    #[test]
    fn unresolvable_wait_list_is_a_map_error() {
        let mut b = backend();
        let mut reg = BufferRegistry::new();
        let mut alloc = BufferAllocator::new();
        let id = alloc.allocate_f32(&mut b, &mut reg, BufferRole::Debug, AccessMode::ReadWrite, &[1.0]).unwrap();
        let never = CompletionEvent::new("never");
        let mut ex = ResultExtractor::new();
        let err = ex.map(&mut b, &mut reg, id, &WaitList::new().with(&never)).unwrap_err();
        assert_eq!(err.status(), Status::InvalidEventWaitList);
    }
}
