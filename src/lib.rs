// voxmarch: host-side orchestration of a two-stage compute pipeline
//
// Stage 1 fills a V×V×V voxel grid with a Mandelbulb density; stage 2
// ray-marches that grid into a W×H grey image plus a per-pixel depth
// buffer. The crate owns everything around the kernels: device selection,
// program builds, buffers, dispatch, the event graph between the stages
// and mapping the results back.
//
// Two backends implement the device seam:
//   emu   deterministic emulated device with an out-of-order queue
//   gpu   real Vulkan device through wgpu

pub mod backend;
pub mod buffer;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod emu;
pub mod error;
pub mod event;
pub mod extract;
pub mod gpu;
pub mod output;
pub mod pipeline;
pub mod program;
pub mod sources;
pub mod sync;
pub mod view;

pub use backend::Backend;
pub use device::{DeviceInfo, DeviceKind, DeviceSelector};
pub use error::{PipelineError, StageError, Status};
pub use pipeline::{PipelineController, PipelineOutput, PipelineSpec, State};
pub use view::RenderConfig;
