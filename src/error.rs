// error.rs — Status codes and the per-stage error taxonomy.
//
// Every failure the pipeline can hit is typed by the stage that produced it:
//
//   NoDeviceError    device selection found nothing usable
//   CompileError     program build failed on one or more devices
//   AllocationError  a buffer could not be created
//   DispatchError    argument binding, index space or queue rejection
//   MapError         host read-back refused or failed
//
// Backends report low-level outcomes as a `Status`, numbered like the
// OpenCL status codes so log lines read the same on every backend.
// `WaitError` is what a host-side wait produces; the stage that waited
// turns it into its own error kind.

use std::fmt;

use thiserror::Error;

use crate::buffer::{AccessMode, BufferId, ElementType};
use crate::event::EventId;
use crate::pipeline::State;
use crate::program::BuildLog;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Numeric/symbolic outcome of one backend operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    DeviceNotFound,
    MemObjectAllocationFailure,
    OutOfResources,
    BuildProgramFailure,
    MapFailure,
    ExecStatusErrorForEventsInWaitList,
    InvalidValue,
    InvalidDevice,
    InvalidMemObject,
    InvalidKernelName,
    InvalidArgIndex,
    InvalidArgValue,
    InvalidKernelArgs,
    InvalidWorkDimension,
    InvalidWorkGroupSize,
    InvalidEventWaitList,
    InvalidOperation,
    InvalidBufferSize,
    InvalidGlobalWorkSize,
}

const ALL_STATUSES: [Status; 20] = [
    Status::Success,
    Status::DeviceNotFound,
    Status::MemObjectAllocationFailure,
    Status::OutOfResources,
    Status::BuildProgramFailure,
    Status::MapFailure,
    Status::ExecStatusErrorForEventsInWaitList,
    Status::InvalidValue,
    Status::InvalidDevice,
    Status::InvalidMemObject,
    Status::InvalidKernelName,
    Status::InvalidArgIndex,
    Status::InvalidArgValue,
    Status::InvalidKernelArgs,
    Status::InvalidWorkDimension,
    Status::InvalidWorkGroupSize,
    Status::InvalidEventWaitList,
    Status::InvalidOperation,
    Status::InvalidBufferSize,
    Status::InvalidGlobalWorkSize,
];

impl Status {
    /// Numeric code. Zero is success, failures are negative.
    pub fn code(self) -> i32 {
        match self {
            Status::Success => 0,
            Status::DeviceNotFound => -1,
            Status::MemObjectAllocationFailure => -4,
            Status::OutOfResources => -5,
            Status::BuildProgramFailure => -11,
            Status::MapFailure => -12,
            Status::ExecStatusErrorForEventsInWaitList => -14,
            Status::InvalidValue => -30,
            Status::InvalidDevice => -33,
            Status::InvalidMemObject => -38,
            Status::InvalidKernelName => -46,
            Status::InvalidArgIndex => -49,
            Status::InvalidArgValue => -50,
            Status::InvalidKernelArgs => -52,
            Status::InvalidWorkDimension => -53,
            Status::InvalidWorkGroupSize => -54,
            Status::InvalidEventWaitList => -57,
            Status::InvalidOperation => -59,
            Status::InvalidBufferSize => -61,
            Status::InvalidGlobalWorkSize => -63,
        }
    }

    /// Symbolic name as printed in status lines.
    pub fn name(self) -> &'static str {
        match self {
            Status::Success => "SUCCESS",
            Status::DeviceNotFound => "DEVICE_NOT_FOUND",
            Status::MemObjectAllocationFailure => "MEM_OBJECT_ALLOCATION_FAILURE",
            Status::OutOfResources => "OUT_OF_RESOURCES",
            Status::BuildProgramFailure => "BUILD_PROGRAM_FAILURE",
            Status::MapFailure => "MAP_FAILURE",
            Status::ExecStatusErrorForEventsInWaitList => "EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST",
            Status::InvalidValue => "INVALID_VALUE",
            Status::InvalidDevice => "INVALID_DEVICE",
            Status::InvalidMemObject => "INVALID_MEM_OBJECT",
            Status::InvalidKernelName => "INVALID_KERNEL_NAME",
            Status::InvalidArgIndex => "INVALID_ARG_INDEX",
            Status::InvalidArgValue => "INVALID_ARG_VALUE",
            Status::InvalidKernelArgs => "INVALID_KERNEL_ARGS",
            Status::InvalidWorkDimension => "INVALID_WORK_DIMENSION",
            Status::InvalidWorkGroupSize => "INVALID_WORK_GROUP_SIZE",
            Status::InvalidEventWaitList => "INVALID_EVENT_WAIT_LIST",
            Status::InvalidOperation => "INVALID_OPERATION",
            Status::InvalidBufferSize => "INVALID_BUFFER_SIZE",
            Status::InvalidGlobalWorkSize => "INVALID_GLOBAL_WORK_SIZE",
        }
    }

    /// Inverse of [`Status::code`].
    pub fn from_code(code: i32) -> Option<Status> {
        ALL_STATUSES.iter().copied().find(|s| s.code() == code)
    }

    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

// ---------------------------------------------------------------------------
// Per-stage errors
// ---------------------------------------------------------------------------

/// No enumerated device satisfied the selector.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no compute device matches {requirement} ({available} device(s) enumerated)")]
pub struct NoDeviceError {
    pub requirement: String,
    pub available: usize,
}

/// Program build failed. Carries the build log of every requested device,
/// including the ones that built cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("program build failed: {status}, {}", failed_devices(.logs))]
pub struct CompileError {
    pub status: Status,
    pub logs: Vec<BuildLog>,
}

impl CompileError {
    /// Concatenated diagnostics, one block per device.
    pub fn diagnostics(&self) -> String {
        let mut out = String::new();
        for log in &self.logs {
            out.push_str(&format!("--- build log for {} ---\n", log.device));
            out.push_str(&log.text);
            if !log.text.ends_with('\n') {
                out.push('\n');
            }
        }
        out
    }
}

fn failed_devices(logs: &[BuildLog]) -> String {
    let failed: Vec<&str> = logs.iter().filter(|l| l.failed()).map(|l| l.device.as_str()).collect();
    if failed.is_empty() {
        "no per-device diagnostics".to_string()
    } else {
        format!("failed on {}", failed.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocationError {
    #[error("buffer `{role}` has zero size")]
    ZeroSize { role: String },
    #[error("buffer `{role}` of {shape} {element} elements does not fit in the address space")]
    TooLarge { role: String, shape: String, element: ElementType },
    #[error("initial payload for `{role}` is {actual} bytes, buffer holds {expected}")]
    InitSizeMismatch { role: String, expected: u64, actual: u64 },
    #[error("a buffer with role `{0}` is already allocated")]
    DuplicateRole(String),
    #[error("device rejected `{role}` ({bytes} bytes): {status}")]
    Device { role: String, bytes: u64, status: Status },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("kernel `{0}` is not an entry point of the program")]
    UnknownKernel(String),
    #[error("kernel `{kernel}` takes {expected} argument(s), {actual} bound")]
    ArgumentCount { kernel: String, expected: usize, actual: usize },
    #[error("argument {index} of `{kernel}`: parameter is {expected}, bound {actual}")]
    ArgumentType { kernel: String, index: usize, expected: String, actual: String },
    #[error("argument {index} of `{kernel}`: buffer `{role}` is {access}, kernel needs {needed} access")]
    AccessViolation { kernel: String, index: usize, role: String, access: AccessMode, needed: &'static str },
    #[error("argument {index} of `{kernel}`: {buffer} does not exist")]
    UnknownBuffer { kernel: String, index: usize, buffer: BufferId },
    #[error("invalid index space for `{kernel}`: {reason} ({status})")]
    InvalidIndexSpace { kernel: String, reason: String, status: Status },
    #[error("`{kernel}` reads `{role}` but its producer {producer} is neither in the wait-list nor fenced")]
    UnsatisfiedDependency { kernel: String, role: String, producer: EventId },
    #[error("`{kernel}` writes `{role}` while reader {reader} is neither in the wait-list nor fenced")]
    WriteAfterRead { kernel: String, role: String, reader: EventId },
    #[error("`{kernel}` binds `{role}` while it is mapped on the host")]
    BufferMapped { kernel: String, role: String },
    #[error("`{kernel}` failed on the device: {status}")]
    Execution { kernel: String, status: Status },
    #[error("queue rejected `{kernel}`: {status}")]
    Rejected { kernel: String, status: Status },
}

impl DispatchError {
    /// Status code reported on the dispatch status line.
    pub fn status(&self) -> Status {
        match self {
            DispatchError::UnknownKernel(_) => Status::InvalidKernelName,
            DispatchError::ArgumentCount { .. } => Status::InvalidKernelArgs,
            DispatchError::ArgumentType { .. } => Status::InvalidArgValue,
            DispatchError::AccessViolation { .. } => Status::InvalidArgValue,
            DispatchError::UnknownBuffer { .. } => Status::InvalidMemObject,
            DispatchError::InvalidIndexSpace { status, .. } => *status,
            DispatchError::UnsatisfiedDependency { .. } | DispatchError::WriteAfterRead { .. } => Status::InvalidEventWaitList,
            DispatchError::BufferMapped { .. } => Status::InvalidOperation,
            DispatchError::Execution { status, .. } => *status,
            DispatchError::Rejected { status, .. } => *status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MapError {
    #[error("buffer `{role}` is {access} and cannot be mapped for host read")]
    AccessDenied { role: String, access: AccessMode },
    #[error("{0} does not exist")]
    UnknownBuffer(BufferId),
    #[error("wait-list for mapping `{role}` did not resolve: {status}")]
    WaitListFailed { role: String, status: Status },
    #[error("buffer `{role}` holds {actual} elements, requested a {requested} view")]
    ElementMismatch { role: String, actual: ElementType, requested: ElementType },
    #[error("mapping `{role}` failed: {status}")]
    Driver { role: String, status: Status },
}

impl MapError {
    pub fn status(&self) -> Status {
        match self {
            MapError::AccessDenied { .. } => Status::InvalidOperation,
            MapError::UnknownBuffer(_) => Status::InvalidMemObject,
            MapError::WaitListFailed { status, .. } => *status,
            MapError::ElementMismatch { .. } => Status::InvalidValue,
            MapError::Driver { status, .. } => *status,
        }
    }
}

/// A host-side wait that ended without the event completing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{label} resolved with {status}")]
pub struct WaitError {
    pub event: Option<EventId>,
    pub label: String,
    pub status: Status,
}

impl From<WaitError> for DispatchError {
    fn from(e: WaitError) -> Self {
        DispatchError::Execution { kernel: e.label, status: e.status }
    }
}

// ---------------------------------------------------------------------------
// Controller-level errors
// ---------------------------------------------------------------------------

/// The error a single pipeline stage failed with.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Map(#[from] MapError),
    #[error("controller already reached terminal state {0}")]
    Finished(State),
}

impl StageError {
    /// Error kind name as reported to the caller.
    pub fn kind(&self) -> &'static str {
        match self {
            StageError::Compile(_) => "CompileError",
            StageError::Allocation(_) => "AllocationError",
            StageError::Dispatch(_) => "DispatchError",
            StageError::Map(_) => "MapError",
            StageError::Finished(_) => "Finished",
        }
    }
}

/// A failed pipeline run: the stage it failed in and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineError {
    pub stage: State,
    pub source: StageError,
}

impl PipelineError {
    /// Full per-device build diagnostics when the run failed to compile.
    pub fn diagnostics(&self) -> Option<&[BuildLog]> {
        match &self.source {
            StageError::Compile(e) => Some(&e.logs),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.source.kind()
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipeline failed in {} with {}: {}", self.stage, self.kind(), self.source)
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

// ============================================================
// Tests
// ============================================================
