// sources.rs — The kernel sources shipped with the crate.
//
// Every kernel exists twice: OpenCL C for the emulated device and WGSL for
// wgpu. Both dialects implement the same arithmetic and the same parameter
// order, so a pipeline can switch backends without touching dispatch code.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::program::KernelSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    OpenCl,
    Wgsl,
}

impl Dialect {
    pub fn extension(self) -> &'static str {
        match self {
            Dialect::OpenCl => "cl",
            Dialect::Wgsl => "wgsl",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::OpenCl => write!(f, "OpenCL C"),
            Dialect::Wgsl => write!(f, "WGSL"),
        }
    }
}

/// `mandel(voxels, power)`: fills a V×V×V byte grid.
pub fn generator(dialect: Dialect) -> KernelSource {
    match dialect {
        Dialect::OpenCl => KernelSource::new("mandel.cl", include_str!("shaders/mandel.cl")),
        Dialect::Wgsl => KernelSource::new("mandel.wgsl", include_str!("shaders/mandel.wgsl")),
    }
}

/// `ray(image, voxels, config, debug)`: renders a W×H view of the grid.
pub fn marcher(dialect: Dialect) -> KernelSource {
    match dialect {
        Dialect::OpenCl => KernelSource::new("ray.cl", include_str!("shaders/ray.cl")),
        Dialect::Wgsl => KernelSource::new("ray.wgsl", include_str!("shaders/ray.wgsl")),
    }
}

/// `pass_through(src, dst)`: float copy.
pub fn pass_through(dialect: Dialect) -> KernelSource {
    match dialect {
        Dialect::OpenCl => KernelSource::new("pass_through.cl", include_str!("shaders/pass_through.cl")),
        Dialect::Wgsl => KernelSource::new("pass_through.wgsl", include_str!("shaders/pass_through.wgsl")),
    }
}
