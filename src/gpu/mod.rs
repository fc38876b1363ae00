// gpu/mod.rs — Real-device backend through wgpu.
//
// The orchestration core is backend-agnostic; this module only has to turn
// `Backend` calls into wgpu work on a Vulkan adapter:
//
//   device   adapter enumeration, profiles, workgroup defaults
//   wgsl     kernel signatures and workgroup specialisation of WGSL units
//   backend  buffers, pipelines, submissions and readback

pub mod backend;
pub mod device;
pub mod wgsl;

pub use backend::WgpuBackend;
pub use device::{DeviceProfile, GpuDevice, GpuError, WorkgroupSize};
