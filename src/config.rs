// config.rs — Run configuration: defaults, JSON file, command line.
//
// Precedence is defaults < `--config FILE` < the remaining flags, in the
// order they appear. The file holds a JSON object with any subset of the
// `RunConfig` fields.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::{DeviceKind, DeviceSelector};
use crate::emu::EmuOptions;
use crate::pipeline::{PipelineSpec, StageSource};
use crate::program::KernelSource;
use crate::sources::Dialect;
use crate::sync::DrainPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("cannot parse {path}: {source}")]
    Json { path: PathBuf, source: serde_json::Error },
    #[error("unknown flag `{0}` (try --help)")]
    UnknownFlag(String),
    #[error("flag `{0}` needs a value")]
    MissingValue(String),
    #[error("bad value `{value}` for `{flag}`: {reason}")]
    InvalidValue { flag: String, value: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Deterministic emulated device.
    #[default]
    Emu,
    /// Real device through wgpu.
    Wgpu,
}

impl BackendKind {
    /// Kernel dialect the backend compiles.
    pub fn dialect(self) -> Dialect {
        match self {
            BackendKind::Emu => Dialect::OpenCl,
            BackendKind::Wgpu => Dialect::Wgsl,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Emu => write!(f, "emu"),
            BackendKind::Wgpu => write!(f, "wgpu"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub backend: BackendKind,
    /// Device index; takes precedence over `device_kind`.
    pub device: Option<usize>,
    pub device_kind: Option<DeviceKind>,
    pub voxels: usize,
    pub width: usize,
    pub height: usize,
    pub power: f32,
    /// Orbit in steps of π/10 about x, y and z.
    pub rotate: [f32; 3],
    pub zoom: f32,
    pub drain: DrainPolicy,
    pub seed: u64,
    pub lazy_visibility: bool,
    pub generator: Option<PathBuf>,
    pub marcher: Option<PathBuf>,
    pub save_voxels: Option<PathBuf>,
    pub save_image: Option<PathBuf>,
    pub save_debug: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            backend: BackendKind::Emu,
            device: None,
            device_kind: None,
            voxels: 128,
            width: 320,
            height: 240,
            power: 8.0,
            rotate: [0.0; 3],
            zoom: 1.0,
            drain: DrainPolicy::Never,
            seed: 0,
            lazy_visibility: false,
            generator: None,
            marcher: None,
            save_voxels: None,
            save_image: None,
            save_debug: None,
        }
    }
}

/// What the command line asked for.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Run(RunConfig),
    Help,
}

impl RunConfig {
    /// Load a JSON config file. Missing fields keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Json { path: path.to_path_buf(), source })
    }

    pub fn selector(&self) -> DeviceSelector {
        match (self.device, self.device_kind) {
            (Some(i), _) => DeviceSelector::Index(i),
            (None, Some(k)) => DeviceSelector::Kind(k),
            (None, None) => DeviceSelector::First,
        }
    }

    pub fn emu_options(&self) -> EmuOptions {
        EmuOptions { seed: self.seed, lazy_visibility: self.lazy_visibility }
    }

    /// The pipeline description for this run. Kernel files given on the
    /// command line replace the shipped sources of their stage.
    pub fn pipeline_spec(&self) -> Result<PipelineSpec, ConfigError> {
        let mut spec = PipelineSpec::new(self.backend.dialect(), self.voxels, self.width, self.height);
        spec.power = self.power;
        spec.view = spec.view.rotated(self.rotate).zoomed(self.zoom);
        spec.read_voxels = self.save_voxels.is_some();
        if let Some(path) = &self.generator {
            spec.generator = StageSource::new(read_source(path)?, "mandel");
        }
        if let Some(path) = &self.marcher {
            spec.marcher = StageSource::new(read_source(path)?, "ray");
        }
        Ok(spec)
    }

    fn check(&self) -> Result<(), ConfigError> {
        let positive = |flag: &str, v: usize| {
            if v == 0 {
                Err(invalid(flag, "0", "must be positive"))
            } else {
                Ok(())
            }
        };
        positive("--voxels", self.voxels)?;
        positive("--size", self.width)?;
        positive("--size", self.height)?;
        let finite = |flag: &str, v: f32| {
            if v.is_finite() {
                Ok(())
            } else {
                Err(invalid(flag, &v.to_string(), "must be finite"))
            }
        };
        finite("--power", self.power)?;
        finite("--zoom", self.zoom)?;
        for angle in self.rotate {
            finite("--rotate", angle)?;
        }
        if self.zoom <= 0.0 {
            return Err(invalid("--zoom", &self.zoom.to_string(), "must be positive"));
        }
        Ok(())
    }
}

fn read_source(path: &Path) -> Result<KernelSource, ConfigError> {
    KernelSource::from_file(path).map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })
}

fn invalid(flag: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue { flag: flag.to_string(), value: value.to_string(), reason: reason.to_string() }
}

fn parse<T: std::str::FromStr>(flag: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: fmt::Display,
{
    value.parse().map_err(|e: T::Err| invalid(flag, value, &e.to_string()))
}

fn parse_size(flag: &str, value: &str) -> Result<(usize, usize), ConfigError> {
    let (w, h) = value.split_once(['x', 'X']).ok_or_else(|| invalid(flag, value, "expected WxH"))?;
    Ok((parse(flag, w)?, parse(flag, h)?))
}

fn parse_triple(flag: &str, value: &str) -> Result<[f32; 3], ConfigError> {
    let parts: Vec<&str> = value.split(',').collect();
    if parts.len() != 3 {
        return Err(invalid(flag, value, "expected X,Y,Z"));
    }
    Ok([parse(flag, parts[0])?, parse(flag, parts[1])?, parse(flag, parts[2])?])
}

/// Parse the arguments after the program name.
///
/// # Errors
/// `ConfigError` for unknown flags, missing or malformed values, an
/// unreadable config file, or a configuration with zero-sized outputs.
pub fn parse_args<I, S>(args: I) -> Result<Command, ConfigError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let args: Vec<String> = args.into_iter().map(Into::into).collect();
    let mut cfg = RunConfig::default();
    let mut it = args.iter();
    while let Some(flag) = it.next() {
        let flag = flag.as_str();
        let mut value = || it.next().map(String::as_str).ok_or_else(|| ConfigError::MissingValue(flag.to_string()));
        match flag {
            "-h" | "--help" => return Ok(Command::Help),
            "--config" => cfg = RunConfig::from_file(Path::new(value()?))?,
            "--backend" => {
                let v = value()?;
                cfg.backend = match v {
                    "emu" => BackendKind::Emu,
                    "wgpu" => BackendKind::Wgpu,
                    other => return Err(invalid(flag, other, "expected emu or wgpu")),
                };
            }
            "--device" => cfg.device = Some(parse(flag, value()?)?),
            "--gpu" => cfg.device_kind = Some(DeviceKind::Gpu),
            "--cpu" => cfg.device_kind = Some(DeviceKind::Cpu),
            "--voxels" => cfg.voxels = parse(flag, value()?)?,
            "--size" => (cfg.width, cfg.height) = parse_size(flag, value()?)?,
            "--power" => cfg.power = parse(flag, value()?)?,
            "--rotate" => cfg.rotate = parse_triple(flag, value()?)?,
            "--zoom" => cfg.zoom = parse(flag, value()?)?,
            "--drain" => cfg.drain = DrainPolicy::BeforeMap,
            "--seed" => cfg.seed = parse(flag, value()?)?,
            "--lazy-visibility" => cfg.lazy_visibility = true,
            "--generator" => cfg.generator = Some(PathBuf::from(value()?)),
            "--marcher" => cfg.marcher = Some(PathBuf::from(value()?)),
            "--save-voxels" => cfg.save_voxels = Some(PathBuf::from(value()?)),
            "--save-image" => cfg.save_image = Some(PathBuf::from(value()?)),
            "--save-debug" => cfg.save_debug = Some(PathBuf::from(value()?)),
            other => return Err(ConfigError::UnknownFlag(other.to_string())),
        }
    }
    cfg.check()?;
    Ok(Command::Run(cfg))
}

pub const USAGE: &str = "\
voxmarch: generate a Mandelbulb voxel grid and ray-march it into an image

USAGE:
  voxmarch [OPTIONS]

OPTIONS:
  --config FILE         JSON file with any RunConfig fields
  --backend emu|wgpu    device backend (default emu)
  --device N            device index
  --gpu | --cpu         first device of that kind
  --voxels V            grid edge length (default 128)
  --size WxH            image size (default 320x240)
  --power P             Mandelbulb power (default 8)
  --rotate X,Y,Z        orbit in steps of pi/10
  --zoom S              scale the view plane (below 1 zooms in)
  --drain               drain the queue before mapping results
  --seed N              emulator scheduling seed
  --lazy-visibility     emulate drivers that need a drain before reads
  --generator FILE      replace the voxel generator source
  --marcher FILE        replace the ray marcher source
  --save-voxels FILE    write the voxel grid (raw bytes)
  --save-image FILE     write the image (PGM)
  --save-debug FILE     write the depth buffer (little-endian f32)
  -h, --help            this text

Logging follows RUST_LOG (default info).";
