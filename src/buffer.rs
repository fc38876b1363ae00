// buffer.rs — Device buffers: descriptions, the role registry and the allocator.
//
// Every device buffer the pipeline touches is a named entry in a
// `BufferRegistry`, tagged with its semantic role, element type and shape.
// Offsets into the flat device memory are derived from the `Shape`
// (x fastest, then y, then z) rather than computed by hand at call sites.
//
// The registry also carries the dependency bookkeeping the dispatcher
// needs: the event of the last kernel that wrote each buffer, whether a
// barrier has fenced that write, and how many host mappings are open.
//
// HOST STORAGE
// ────────────
// `AlignedBytes` keeps byte payloads in a `Vec<u32>` so the same storage
// can be viewed as `[f32]` through bytemuck without an unaligned cast.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::backend::{Backend, RawBuffer};
use crate::error::AllocationError;
use crate::event::{CompletionEvent, WaitList};

/// Registry key for one allocated buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub(crate) u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

/// Kernel-side access mode, fixed at creation.
///
/// `WriteOnly` buffers can never be mapped for host read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessMode {
    pub fn device_can_read(self) -> bool {
        self != AccessMode::WriteOnly
    }

    pub fn device_can_write(self) -> bool {
        self != AccessMode::ReadOnly
    }

    pub fn host_can_read(self) -> bool {
        self != AccessMode::WriteOnly
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::ReadOnly => write!(f, "read-only"),
            AccessMode::WriteOnly => write!(f, "write-only"),
            AccessMode::ReadWrite => write!(f, "read-write"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    Byte,
    Float32,
}

impl ElementType {
    pub fn size(self) -> usize {
        match self {
            ElementType::Byte => 1,
            ElementType::Float32 => 4,
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementType::Byte => write!(f, "uchar"),
            ElementType::Float32 => write!(f, "float"),
        }
    }
}

// ---------------------------------------------------------------------------
// Shape
// ---------------------------------------------------------------------------

/// Extent of a 1-, 2- or 3-dimensional buffer, in elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: [usize; 3],
    rank: usize,
}

impl Shape {
    pub fn d1(len: usize) -> Self {
        Shape { dims: [len, 1, 1], rank: 1 }
    }

    pub fn d2(width: usize, height: usize) -> Self {
        Shape { dims: [width, height, 1], rank: 2 }
    }

    pub fn d3(x: usize, y: usize, z: usize) -> Self {
        Shape { dims: [x, y, z], rank: 3 }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// The significant dimensions, `rank` entries long.
    pub fn dims(&self) -> &[usize] {
        &self.dims[..self.rank]
    }

    pub fn width(&self) -> usize {
        self.dims[0]
    }

    pub fn height(&self) -> usize {
        self.dims[1]
    }

    pub fn depth(&self) -> usize {
        self.dims[2]
    }

    /// Total element count, saturating at `usize::MAX`.
    pub fn len(&self) -> usize {
        self.checked_len().unwrap_or(usize::MAX)
    }

    /// Total element count, or `None` when it does not fit in `usize`.
    pub fn checked_len(&self) -> Option<usize> {
        self.dims.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flat element offset of `(x, y, z)`: `z·W·H + y·W + x`.
    /// Returns `None` when the coordinate is outside the shape.
    pub fn index(&self, x: usize, y: usize, z: usize) -> Option<usize> {
        let [w, h, d] = self.dims;
        if x >= w || y >= h || z >= d {
            return None;
        }
        Some(z * w * h + y * w + x)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.dims().iter().map(|d| d.to_string()).collect();
        write!(f, "{}", parts.join("x"))
    }
}

// ---------------------------------------------------------------------------
// Roles and descriptors
// ---------------------------------------------------------------------------

/// What a buffer is for. At most one live buffer per role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BufferRole {
    Voxels,
    Image,
    Debug,
    RenderConfig,
    Named(String),
}

impl fmt::Display for BufferRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferRole::Voxels => write!(f, "voxels"),
            BufferRole::Image => write!(f, "image"),
            BufferRole::Debug => write!(f, "debug"),
            BufferRole::RenderConfig => write!(f, "render-config"),
            BufferRole::Named(n) => write!(f, "{n}"),
        }
    }
}

/// Everything needed to create one buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDesc {
    pub role: BufferRole,
    pub element: ElementType,
    pub shape: Shape,
    pub access: AccessMode,
}

impl BufferDesc {
    pub fn new(role: BufferRole, element: ElementType, shape: Shape, access: AccessMode) -> Self {
        BufferDesc { role, element, shape, access }
    }

    /// Size in bytes.
    ///
    /// # Errors
    /// `AllocationError::TooLarge` when the element count or the byte size
    /// overflows.
    pub fn byte_len(&self) -> Result<u64, AllocationError> {
        self.shape
            .checked_len()
            .and_then(|n| n.checked_mul(self.element.size()))
            .and_then(|n| u64::try_from(n).ok())
            .ok_or_else(|| AllocationError::TooLarge { role: self.role.to_string(), shape: self.shape.to_string(), element: self.element })
    }
}

// ---------------------------------------------------------------------------
// AlignedBytes
// ---------------------------------------------------------------------------

/// A byte buffer with 4-byte aligned storage.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AlignedBytes {
    words: Vec<u32>,
    len: usize,
}

impl AlignedBytes {
    pub fn zeroed(len: usize) -> Self {
        AlignedBytes { words: vec![0; len.div_ceil(4)], len }
    }

    pub fn filled(len: usize, byte: u8) -> Self {
        AlignedBytes { words: vec![u32::from_ne_bytes([byte; 4]); len.div_ceil(4)], len }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut out = AlignedBytes::zeroed(bytes.len());
        out.as_bytes_mut().copy_from_slice(bytes);
        out
    }

    pub fn from_f32(values: &[f32]) -> Self {
        Self::from_bytes(bytemuck::cast_slice(values))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u32, u8>(&self.words)[..self.len]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut bytemuck::cast_slice_mut::<u32, u8>(&mut self.words)[..len]
    }

    /// The payload as floats. Trailing bytes that do not fill a whole
    /// float are not visible through this view.
    pub fn as_f32(&self) -> &[f32] {
        &bytemuck::cast_slice::<u32, f32>(&self.words)[..self.len / 4]
    }

    pub fn as_f32_mut(&mut self) -> &mut [f32] {
        let n = self.len / 4;
        &mut bytemuck::cast_slice_mut::<u32, f32>(&mut self.words)[..n]
    }

    /// Copy of the first `len` bytes.
    pub fn truncated(&self, len: usize) -> AlignedBytes {
        AlignedBytes::from_bytes(&self.as_bytes()[..len.min(self.len)])
    }
}

impl fmt::Debug for AlignedBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AlignedBytes({} bytes)", self.len)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// One registered buffer and its dependency state.
#[derive(Debug)]
pub struct BufferEntry {
    pub id: BufferId,
    pub desc: BufferDesc,
    pub(crate) raw: RawBuffer,
    pub(crate) bytes: u64,
    pub(crate) producer: Option<CompletionEvent>,
    pub(crate) fenced: bool,
    pub(crate) readers: Vec<CompletionEvent>,
    pub(crate) mapped: usize,
}

impl BufferEntry {
    pub fn role(&self) -> &BufferRole {
        &self.desc.role
    }

    pub fn byte_len(&self) -> u64 {
        self.bytes
    }

    /// Event of the last kernel bound to this buffer with write access.
    pub fn producer(&self) -> Option<&CompletionEvent> {
        self.producer.as_ref()
    }

    /// True once a barrier has ordered the last write before any later command.
    pub fn is_fenced(&self) -> bool {
        self.fenced
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped > 0
    }

    /// Whether a kernel that does not name the producer may still bind this
    /// buffer: nothing has written it, or a barrier or drain fenced the write.
    /// The producer's current status plays no part.
    pub fn write_is_settled(&self) -> bool {
        self.producer.is_none() || self.fenced
    }

    /// Read-only bindings since the last write that no barrier has fenced.
    /// A later writer must name each of them.
    pub fn unfenced_readers(&self) -> &[CompletionEvent] {
        &self.readers
    }
}

/// Role-indexed table of every live device buffer of one pipeline run.
#[derive(Debug, Default)]
pub struct BufferRegistry {
    entries: BTreeMap<BufferId, BufferEntry>,
    next_id: u64,
}

impl BufferRegistry {
    pub fn new() -> Self {
        BufferRegistry::default()
    }

    pub fn get(&self, id: BufferId) -> Option<&BufferEntry> {
        self.entries.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: BufferId) -> Option<&mut BufferEntry> {
        self.entries.get_mut(&id)
    }

    pub fn by_role(&self, role: &BufferRole) -> Option<&BufferEntry> {
        self.entries.values().find(|e| &e.desc.role == role)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BufferEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total bytes held by registered buffers.
    pub fn bytes(&self) -> u64 {
        self.entries.values().map(|e| e.byte_len()).sum()
    }

    pub(crate) fn insert(&mut self, desc: BufferDesc, raw: RawBuffer, bytes: u64) -> BufferId {
        let id = BufferId(self.next_id);
        self.next_id += 1;
        self.entries.insert(id, BufferEntry { id, desc, raw, bytes, producer: None, fenced: false, readers: Vec::new(), mapped: 0 });
        id
    }

    pub(crate) fn record_producer(&mut self, id: BufferId, event: &CompletionEvent) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.producer = Some(event.clone());
            entry.fenced = false;
            entry.readers.clear();
        }
    }

    pub(crate) fn record_reader(&mut self, id: BufferId, event: &CompletionEvent) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.readers.push(event.clone());
        }
    }

    /// Mark writes and reads by any event in `wait` as fenced. An empty list
    /// fences every recorded access.
    pub(crate) fn fence(&mut self, wait: &WaitList) {
        let covered = |ev: &CompletionEvent| wait.is_empty() || wait.contains(ev.id());
        for entry in self.entries.values_mut() {
            if entry.producer.as_ref().is_some_and(covered) {
                entry.fenced = true;
            }
            entry.readers.retain(|r| !covered(r));
        }
    }

    pub(crate) fn fence_all(&mut self) {
        self.fence(&WaitList::new());
    }

    /// Release every buffer back to the backend and empty the registry.
    /// Returns the number of buffers released.
    pub fn release_all<B: Backend + ?Sized>(&mut self, backend: &mut B) -> usize {
        let entries = std::mem::take(&mut self.entries);
        let count = entries.len();
        for (id, entry) in entries {
            if let Err(status) = backend.release_buffer(entry.raw) {
                log::warn!("release of {id} ({}) gave: {status}", entry.desc.role);
            }
        }
        count
    }
}

// ---------------------------------------------------------------------------
// Allocator
// ---------------------------------------------------------------------------

/// Creates device buffers and registers them.
#[derive(Debug, Default)]
pub struct BufferAllocator {
    allocations: usize,
}

impl BufferAllocator {
    pub fn new() -> Self {
        BufferAllocator::default()
    }

    /// Number of buffers successfully created so far.
    pub fn allocations(&self) -> usize {
        self.allocations
    }

    /// Create a buffer described by `desc`, optionally initialised from `init`.
    ///
    /// # Errors
    /// `AllocationError` on a zero-sized or overflowing shape, a duplicate role, an
    /// initialiser whose length differs from the buffer's byte length, or
    /// when the device refuses the allocation.
    pub fn allocate<B: Backend + ?Sized>(
        &mut self,
        backend: &mut B,
        registry: &mut BufferRegistry,
        desc: BufferDesc,
        init: Option<&[u8]>,
    ) -> Result<BufferId, AllocationError> {
        let role = desc.role.to_string();
        let bytes = desc.byte_len()?;
        if bytes == 0 {
            return Err(AllocationError::ZeroSize { role });
        }
        if registry.by_role(&desc.role).is_some() {
            return Err(AllocationError::DuplicateRole(role));
        }
        if let Some(init) = init {
            if init.len() as u64 != bytes {
                return Err(AllocationError::InitSizeMismatch { role, expected: bytes, actual: init.len() as u64 });
            }
        }

        let raw = backend.create_buffer(bytes, desc.access, init).map_err(|status| {
            log::error!("allocate `{role}` ({bytes} bytes, {}) gave: {status}", desc.access);
            AllocationError::Device { role: role.clone(), bytes, status }
        })?;
        log::debug!("allocated `{role}` {} {} {} ({bytes} bytes)", desc.shape, desc.element, desc.access);

        self.allocations += 1;
        Ok(registry.insert(desc, raw, bytes))
    }

    /// Convenience for float buffers initialised from a host slice.
    pub fn allocate_f32<B: Backend + ?Sized>(
        &mut self,
        backend: &mut B,
        registry: &mut BufferRegistry,
        role: BufferRole,
        access: AccessMode,
        values: &[f32],
    ) -> Result<BufferId, AllocationError> {
        let desc = BufferDesc::new(role, ElementType::Float32, Shape::d1(values.len()), access);
        self.allocate(backend, registry, desc, Some(bytemuck::cast_slice(values)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_index_is_x_fastest() {
        let s = Shape::d3(4, 3, 2);
        assert_eq!(s.len(), 24);
        assert_eq!(s.index(0, 0, 0), Some(0));
        assert_eq!(s.index(1, 0, 0), Some(1));
        assert_eq!(s.index(0, 1, 0), Some(4));
        assert_eq!(s.index(0, 0, 1), Some(12));
        assert_eq!(s.index(3, 2, 1), Some(23));
        assert_eq!(s.index(4, 0, 0), None);
    }

    #[test]
    fn shape_2d_matches_row_major() {
        let s = Shape::d2(320, 240);
        assert_eq!(s.rank(), 2);
        assert_eq!(s.dims(), &[320, 240]);
        assert_eq!(s.index(5, 2, 0), Some(2 * 320 + 5));
        assert_eq!(s.to_string(), "320x240");
    }

    #[test]
    fn aligned_bytes_views() {
        let vals = [1.5f32, -2.0, 3.25];
        let b = AlignedBytes::from_f32(&vals);
        assert_eq!(b.len(), 12);
        assert_eq!(b.as_f32(), &vals);

        let odd = AlignedBytes::filled(5, 0xAB);
        assert_eq!(odd.as_bytes(), &[0xAB; 5]);
        assert_eq!(odd.as_f32().len(), 1);
        assert_eq!(odd.truncated(2).as_bytes(), &[0xAB, 0xAB]);
    }

    #[test]
    fn access_mode_rules() {
        assert!(!AccessMode::WriteOnly.host_can_read());
        assert!(AccessMode::ReadOnly.host_can_read());
        assert!(!AccessMode::ReadOnly.device_can_write());
        assert!(AccessMode::ReadWrite.device_can_write());
    }

    #[test]
    fn fence_marks_only_listed_producers() {
        let mut reg = BufferRegistry::new();
        let a = reg.insert(BufferDesc::new(BufferRole::Voxels, ElementType::Byte, Shape::d1(4), AccessMode::ReadWrite), RawBuffer(1), 4);
        let b = reg.insert(BufferDesc::new(BufferRole::Image, ElementType::Byte, Shape::d1(4), AccessMode::ReadWrite), RawBuffer(2), 4);
        let ea = CompletionEvent::new("a");
        let eb = CompletionEvent::new("b");
        reg.record_producer(a, &ea);
        reg.record_producer(b, &eb);
        assert!(!reg.get(a).unwrap().write_is_settled());

        reg.fence(&WaitList::new().with(&ea));
        assert!(reg.get(a).unwrap().is_fenced());
        assert!(!reg.get(b).unwrap().is_fenced());

        reg.fence_all();
        assert!(reg.get(b).unwrap().write_is_settled());
    }

    #[test]
    fn completed_producer_is_not_settled_until_fenced() {
        let mut reg = BufferRegistry::new();
        let a = reg.insert(BufferDesc::new(BufferRole::Debug, ElementType::Float32, Shape::d1(1), AccessMode::ReadWrite), RawBuffer(1), 4);
        let ev = CompletionEvent::new("k");
        reg.record_producer(a, &ev);
        ev.complete();
        assert!(!reg.get(a).unwrap().write_is_settled());
        reg.fence(&WaitList::new().with(&ev));
        assert!(reg.get(a).unwrap().write_is_settled());
        assert_eq!(reg.by_role(&BufferRole::Debug).unwrap().id, a);
    }

    #[test]
    fn readers_are_cleared_by_fence_and_by_the_next_write() {
        let mut reg = BufferRegistry::new();
        let a = reg.insert(BufferDesc::new(BufferRole::Voxels, ElementType::Byte, Shape::d1(4), AccessMode::ReadWrite), RawBuffer(1), 4);
        let r1 = CompletionEvent::new("r1");
        let r2 = CompletionEvent::new("r2");
        reg.record_reader(a, &r1);
        reg.record_reader(a, &r2);
        assert_eq!(reg.get(a).unwrap().unfenced_readers().len(), 2);

        reg.fence(&WaitList::new().with(&r1));
        let left: Vec<_> = reg.get(a).unwrap().unfenced_readers().iter().map(|r| r.id()).collect();
        assert_eq!(left, vec![r2.id()]);

        reg.record_producer(a, &CompletionEvent::new("w"));
        assert!(reg.get(a).unwrap().unfenced_readers().is_empty());
    }

    #[test]
    fn overflowing_shape_is_too_large() {
        let huge = 1usize << 22;
        let shape = Shape::d3(huge, huge, huge);
        assert_eq!(shape.checked_len(), None);
        assert_eq!(shape.len(), usize::MAX);
        let desc = BufferDesc::new(BufferRole::Voxels, ElementType::Byte, shape, AccessMode::ReadWrite);
        assert!(matches!(desc.byte_len(), Err(AllocationError::TooLarge { .. })));

        // The element count fits but the byte size does not.
        let floats = BufferDesc::new(BufferRole::Debug, ElementType::Float32, Shape::d1(usize::MAX / 2), AccessMode::ReadWrite);
        assert!(floats.byte_len().is_err());
        assert_eq!(Shape::d2(3, 4).checked_len(), Some(12));
    }

}
