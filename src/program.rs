// program.rs — Kernel sources, signatures and the program builder.
//
// A program is built once per pipeline run from one or more source units.
// The build either succeeds for every requested device or fails as a
// whole; there is no partial program. Build logs are kept in both cases
// and every log is written to the log output as it arrives, at a level
// that matches its worst diagnostic.

use std::fmt;
use std::path::Path;

use crate::backend::{Backend, ProgramHandle};
use crate::buffer::ElementType;
use crate::error::{CompileError, Status};

/// One named unit of kernel source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSource {
    pub name: String,
    pub text: String,
}

impl KernelSource {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        KernelSource { name: name.into(), text: text.into() }
    }

    /// Load a unit from disk, naming it after the file.
    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(KernelSource { name, text })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    F32,
    U32,
    I32,
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarType::F32 => write!(f, "float"),
            ScalarType::U32 => write!(f, "uint"),
            ScalarType::I32 => write!(f, "int"),
        }
    }
}

/// Declared type of one kernel parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    /// A global buffer. `writable` is false for `const` views.
    Buffer { element: ElementType, writable: bool },
    Scalar(ScalarType),
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamType::Buffer { element, writable: true } => write!(f, "__global {element}*"),
            ParamType::Buffer { element, writable: false } => write!(f, "__global const {element}*"),
            ParamType::Scalar(s) => write!(f, "{s}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelParam {
    pub name: String,
    pub ty: ParamType,
}

/// Entry-point name and ordered parameter list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSignature {
    pub name: String,
    pub params: Vec<KernelParam>,
}

impl fmt::Display for KernelSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<String> = self.params.iter().map(|p| format!("{} {}", p.ty, p.name)).collect();
        write!(f, "{}({})", self.name, params.join(", "))
    }
}

/// Raw diagnostic text produced for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildLog {
    pub device: String,
    pub text: String,
    pub warnings: usize,
    pub errors: usize,
}

impl BuildLog {
    pub fn failed(&self) -> bool {
        self.errors > 0
    }

    pub fn is_clean(&self) -> bool {
        self.errors == 0 && self.warnings == 0
    }
}

/// An immutable, successfully built program.
#[derive(Debug, Clone)]
pub struct CompiledProgram {
    handle: ProgramHandle,
    kernels: Vec<KernelSignature>,
    logs: Vec<BuildLog>,
}

impl CompiledProgram {
    pub fn handle(&self) -> ProgramHandle {
        self.handle
    }

    pub fn kernel(&self, name: &str) -> Option<&KernelSignature> {
        self.kernels.iter().find(|k| k.name == name)
    }

    pub fn kernels(&self) -> &[KernelSignature] {
        &self.kernels
    }

    /// Per-device build logs, retained from a successful build.
    pub fn logs(&self) -> &[BuildLog] {
        &self.logs
    }

    pub fn warnings(&self) -> usize {
        self.logs.iter().map(|l| l.warnings).sum()
    }
}

// ---------------------------------------------------------------------------
// ProgramBuilder
// ---------------------------------------------------------------------------

/// Collects source units and builds them for a device set.
///
/// ```ignore
/// let program = ProgramBuilder::new()
///     .source(sources::generator(Dialect::OpenCl))
///     .source(sources::marcher(Dialect::OpenCl))
///     .build(&mut backend)?;
/// ```
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    sources: Vec<KernelSource>,
    targets: Option<Vec<usize>>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        ProgramBuilder::default()
    }

    pub fn source(mut self, source: KernelSource) -> Self {
        self.sources.push(source);
        self
    }

    /// Restrict the build to these device indices. Defaults to every device
    /// the backend enumerated.
    pub fn targets(mut self, devices: &[usize]) -> Self {
        self.targets = Some(devices.to_vec());
        self
    }

    /// Build all units for all target devices.
    ///
    /// # Errors
    /// `CompileError` when there is nothing to build, when a target index
    /// is unknown, or when any device's build reports an error. The error
    /// carries the log of every target.
    pub fn build<B: Backend + ?Sized>(self, backend: &mut B) -> Result<CompiledProgram, CompileError> {
        if self.sources.is_empty() {
            return Err(CompileError { status: Status::InvalidValue, logs: Vec::new() });
        }
        let targets = match self.targets {
            Some(t) => t,
            None => backend.devices().iter().map(|d| d.index).collect(),
        };
        if targets.is_empty() || targets.iter().any(|t| !backend.devices().iter().any(|d| d.index == *t)) {
            log::error!("build targets {targets:?} do not name enumerated devices");
            return Err(CompileError { status: Status::InvalidDevice, logs: Vec::new() });
        }

        let units: Vec<&str> = self.sources.iter().map(|s| s.name.as_str()).collect();
        log::info!("building {} for {} device(s)", units.join(" + "), targets.len());

        match backend.build_program(&self.sources, &targets) {
            Ok(binary) => {
                emit_logs(&binary.logs);
                for k in &binary.kernels {
                    log::debug!("entry point {k}");
                }
                Ok(CompiledProgram { handle: binary.handle, kernels: binary.kernels, logs: binary.logs })
            }
            Err(failure) => {
                emit_logs(&failure.logs);
                log::error!("build gave: {}", failure.status);
                Err(CompileError { status: failure.status, logs: failure.logs })
            }
        }
    }
}

fn emit_logs(logs: &[BuildLog]) {
    for log in logs {
        let text = if log.text.trim().is_empty() { "(empty)" } else { log.text.trim_end() };
        if log.failed() {
            log::error!("build log for {}:\n{text}", log.device);
        } else if log.warnings > 0 {
            log::warn!("build log for {}:\n{text}", log.device);
        } else {
            log::info!("build log for {}: {text}", log.device);
        }
    }
}
