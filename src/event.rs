// event.rs — Completion events and wait-lists.
//
// A `CompletionEvent` is the single-producer, multi-consumer handle for one
// enqueued operation. The backend that enqueued the operation is the only
// party that signals it; everyone else clones the handle and observes it.
//
// STATE ENCODING
// ──────────────
// The state lives in an `AtomicU8` so a device-side callback (wgpu calls
// `on_submitted_work_done` from whichever thread polls the device) can
// signal without a lock. The error status is stored in a separate
// `AtomicI32` *before* the state flips, so a reader that sees ERROR always
// sees the matching code:
//
//   PENDING --cas--> SIGNALLING --store code--> COMPLETE | ERROR
//
// Readers treat SIGNALLING as still pending. The compare-and-swap is what
// makes "signalled exactly once" hold: a second signal loses the race and
// is refused.

use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crate::error::Status;

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

const PENDING: u8 = 0;
const SIGNALLING: u8 = 1;
const COMPLETE: u8 = 2;
const ERROR: u8 = 3;

/// Process-unique event identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(u64);

impl EventId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ev#{}", self.0)
    }
}

/// Observable state of one enqueued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Pending,
    Complete,
    Error(Status),
}

impl EventStatus {
    pub fn is_resolved(self) -> bool {
        !matches!(self, EventStatus::Pending)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventStatus::Pending => write!(f, "pending"),
            EventStatus::Complete => write!(f, "complete"),
            EventStatus::Error(s) => write!(f, "error {s}"),
        }
    }
}

struct EventCell {
    id: EventId,
    label: String,
    state: AtomicU8,
    code: AtomicI32,
}

/// Handle on the completion state of exactly one enqueued operation.
///
/// Cloning is cheap and every clone observes the same state.
#[derive(Clone)]
pub struct CompletionEvent(Arc<EventCell>);

impl CompletionEvent {
    /// Create a new pending event. Backends create one per enqueued command.
    pub fn new(label: impl Into<String>) -> Self {
        CompletionEvent(Arc::new(EventCell {
            id: EventId(NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed)),
            label: label.into(),
            state: AtomicU8::new(PENDING),
            code: AtomicI32::new(0),
        }))
    }

    pub fn id(&self) -> EventId {
        self.0.id
    }

    /// Name of the operation that produced this event.
    pub fn label(&self) -> &str {
        &self.0.label
    }

    pub fn status(&self) -> EventStatus {
        match self.0.state.load(Ordering::Acquire) {
            COMPLETE => EventStatus::Complete,
            ERROR => {
                let code = self.0.code.load(Ordering::Relaxed);
                EventStatus::Error(Status::from_code(code).unwrap_or(Status::OutOfResources))
            }
            _ => EventStatus::Pending,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.status().is_resolved()
    }

    /// Mark the operation finished. Returns `false` if the event had
    /// already been signalled; the second signal is ignored.
    pub fn complete(&self) -> bool {
        self.signal(COMPLETE, Status::Success)
    }

    /// Mark the operation failed with `status`. Same exactly-once rule as
    /// [`complete`](Self::complete).
    pub fn fail(&self, status: Status) -> bool {
        self.signal(ERROR, status)
    }

    fn signal(&self, target: u8, status: Status) -> bool {
        let cell = &self.0;
        if cell
            .state
            .compare_exchange(PENDING, SIGNALLING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::warn!("{} ({}) signalled twice; keeping {}", cell.id, cell.label, self.status());
            return false;
        }
        cell.code.store(status.code(), Ordering::Relaxed);
        cell.state.store(target, Ordering::Release);
        true
    }
}

impl PartialEq for CompletionEvent {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for CompletionEvent {}

impl fmt::Debug for CompletionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionEvent")
            .field("id", &self.id())
            .field("label", &self.label())
            .field("status", &self.status())
            .finish()
    }
}

impl fmt::Display for CompletionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.id(), self.label(), self.status())
    }
}

// ---------------------------------------------------------------------------
// WaitList
// ---------------------------------------------------------------------------

/// An ordered, duplicate-free set of events an operation must wait for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaitList {
    events: Vec<CompletionEvent>,
}

impl WaitList {
    pub fn new() -> Self {
        WaitList::default()
    }

    /// Builder form of [`push`](Self::push).
    pub fn with(mut self, event: &CompletionEvent) -> Self {
        self.push(event);
        self
    }

    pub fn push(&mut self, event: &CompletionEvent) {
        if !self.contains(event.id()) {
            self.events.push(event.clone());
        }
    }

    /// Union of two wait-lists.
    pub fn extend(&mut self, other: &WaitList) {
        for ev in &other.events {
            self.push(ev);
        }
    }

    pub fn contains(&self, id: EventId) -> bool {
        self.events.iter().any(|e| e.id() == id)
    }

    pub fn events(&self) -> &[CompletionEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn all_complete(&self) -> bool {
        self.events.iter().all(|e| e.status() == EventStatus::Complete)
    }

    /// First event in the list that resolved with an error, if any.
    pub fn first_error(&self) -> Option<(&CompletionEvent, Status)> {
        self.events.iter().find_map(|e| match e.status() {
            EventStatus::Error(s) => Some((e, s)),
            _ => None,
        })
    }
}

impl<'a> FromIterator<&'a CompletionEvent> for WaitList {
    fn from_iter<I: IntoIterator<Item = &'a CompletionEvent>>(iter: I) -> Self {
        let mut list = WaitList::new();
        for ev in iter {
            list.push(ev);
        }
        list
    }
}
