// gpu/device.rs — wgpu adapter enumeration and device creation.
//
// Responsibilities:
//   - Enumerate Vulkan adapters and describe each as a `DeviceInfo`, so the
//     same `DeviceSelector` that picks emulated devices picks real ones.
//   - Expose a `DeviceProfile` for simulating hardware limits on a
//     development machine (e.g., cap invocations to match Raspberry Pi).
//   - Provide `WorkgroupSize`, the default local extent for launches that
//     do not name one, validated against the active profile.
//
// ADAPTER ORDER:
// `DeviceSelector::First` takes the first adapter of the enumeration. We
// sort real hardware (discrete, integrated) ahead of virtual/other adapters
// and software renderers last, so "first" means "best available". Index
// and kind selectors see the same sorted order; `index` is the position in
// it.
//
// DEVICE LIMITS:
// Under a non-Native profile we request *lower* limits than the hardware
// supports. wgpu validates every dispatch against the requested limits, so
// violations that would crash on the target are caught on the laptop.
//
// WORKGROUP SIZES:
// naga does not accept `override` constants inside `@workgroup_size`, so
// shaders carry `{{WG_X}}`/`{{WG_Y}}`/`{{WG_Z}}` placeholders that are
// replaced with literals before the module is created.

use std::fmt;

use thiserror::Error;

use crate::device::{DeviceInfo, DeviceKind, DeviceSelector};
use crate::error::NoDeviceError;

/// Hardware profile controlling device limits and default workgroup sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceProfile {
    /// Use the adapter's actual hardware limits. No artificial caps.
    #[default]
    Native,
    /// Simulate Raspberry Pi 4/5 (Broadcom VideoCore VI/VII, V3DV Vulkan).
    RaspberryPi,
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceProfile::Native => write!(f, "Native"),
            DeviceProfile::RaspberryPi => write!(f, "RaspberryPi (simulated limits)"),
        }
    }
}

/// Default local extent for a launch of the given rank.
///
/// `x·y·z` must not exceed the profile's invocation limit. Lower-rank
/// launches fold the spare dimensions into x (rank 1) or drop z (rank 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkgroupSize {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl WorkgroupSize {
    pub fn total(&self) -> u32 {
        self.x * self.y * self.z
    }

    /// - `Native`: 16×8×2 = 256 invocations, the WebGPU default cap.
    ///   Rank-2 launches use 16×8 = 128, four 32-wide warps.
    /// - `RaspberryPi`: 8×8×1 = 64 invocations, well inside the 256 limit.
    pub fn for_profile(profile: DeviceProfile) -> Self {
        match profile {
            DeviceProfile::Native => WorkgroupSize { x: 16, y: 8, z: 2 },
            DeviceProfile::RaspberryPi => WorkgroupSize { x: 8, y: 8, z: 1 },
        }
    }

    /// Local extent for a launch of `rank` dimensions.
    pub fn for_rank(&self, rank: usize) -> [u32; 3] {
        match rank {
            1 => [self.total(), 1, 1],
            2 => [self.x, self.y, 1],
            _ => [self.x, self.y, self.z],
        }
    }
}

impl fmt::Display for WorkgroupSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{}×{} ({} invocations)", self.x, self.y, self.z, self.total())
    }
}

/// Number of workgroups covering `global` with `local`-sized groups.
///
/// Uses ceiling division, so shaders must guard against ids past the
/// global extent.
pub fn dispatch_size(global: [usize; 3], local: [u32; 3]) -> [u32; 3] {
    let mut out = [1u32; 3];
    for d in 0..3 {
        let l = local[d].max(1) as usize;
        out[d] = global[d].div_ceil(l) as u32;
    }
    out
}

/// The opened wgpu device, its queue and the enumeration it was picked from.
///
/// # Field drop order
/// Rust drops struct fields in declaration order (top → bottom).
/// `_instance` is declared last so the `wgpu::Instance` outlives `device`
/// and `queue`. dzn (the D3D12-to-Vulkan layer on WSL2) crashes when the
/// Vulkan instance is destroyed while device-level objects still exist.
pub struct GpuDevice {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub profile: DeviceProfile,
    pub info: DeviceInfo,
    pub devices: Vec<DeviceInfo>,
    pub limits: wgpu::Limits,
    pub workgroup_size: WorkgroupSize,
    _instance: wgpu::Instance,
}

impl GpuDevice {
    /// Open the adapter `selector` picks, with `profile` limits.
    ///
    /// # Errors
    /// `GpuError::NoDevice` when no adapter matches (including none at all),
    /// `GpuError::DeviceRequest` when the driver refuses the device.
    pub fn open(selector: DeviceSelector, profile: DeviceProfile) -> Result<Self, GpuError> {
        pollster::block_on(Self::open_async(selector, profile))
    }

    async fn open_async(selector: DeviceSelector, profile: DeviceProfile) -> Result<Self, GpuError> {
        // dzn on WSL2 declares itself non-conformant; without this flag
        // wgpu hides it and only llvmpipe is left.
        let flags = if cfg!(debug_assertions) {
            wgpu::InstanceFlags::VALIDATION | wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        } else {
            wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        };
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::VULKAN,
            flags,
            ..Default::default()
        });

        let mut adapters = instance.enumerate_adapters(wgpu::Backends::VULKAN);
        adapters.sort_by_key(|a| adapter_rank(a.get_info().device_type));
        let devices: Vec<DeviceInfo> = adapters.iter().enumerate().map(|(i, a)| describe(i, a)).collect();
        for d in &devices {
            log::info!("Vulkan adapter {d}");
        }

        let chosen = selector.select(&devices)?.clone();
        let adapter = adapters.into_iter().nth(chosen.index).ok_or(GpuError::NoDevice(NoDeviceError {
            requirement: selector.to_string(),
            available: devices.len(),
        }))?;

        // Native on a V3D adapter means the caller is on a Pi already.
        let profile = match profile {
            DeviceProfile::Native if chosen.name.to_ascii_lowercase().contains("v3d") => {
                log::info!("V3D adapter detected, using RaspberryPi profile");
                DeviceProfile::RaspberryPi
            }
            other => other,
        };
        let limits = limits_for_profile(profile);

        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("voxmarch"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits.clone(),
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await?;

        let info = clamp_to_limits(chosen, &limits);
        let workgroup_size = WorkgroupSize::for_profile(profile);
        log::info!("opened {info} with profile {profile}, default workgroup {workgroup_size}");

        Ok(GpuDevice { device, queue, profile, info, devices, limits, workgroup_size, _instance: instance })
    }

    /// Override the default workgroup size, validating against the profile.
    pub fn set_workgroup_size(&mut self, x: u32, y: u32, z: u32) -> Result<(), GpuError> {
        let total = x * y * z;
        let max = max_invocations_for_profile(self.profile);
        if total > max {
            return Err(GpuError::WorkgroupTooLarge { total, max });
        }
        self.workgroup_size = WorkgroupSize { x, y, z };
        Ok(())
    }
}

impl fmt::Display for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GpuDevice {{ adapter: {}, profile: {}, workgroup: {} }}", self.info, self.profile, self.workgroup_size)
    }
}

// ============================================================
// Adapter description
// ============================================================

fn adapter_rank(ty: wgpu::DeviceType) -> u8 {
    match ty {
        wgpu::DeviceType::DiscreteGpu => 0,
        wgpu::DeviceType::IntegratedGpu => 1,
        wgpu::DeviceType::VirtualGpu | wgpu::DeviceType::Other => 2,
        wgpu::DeviceType::Cpu => 3,
    }
}

fn kind_of(ty: wgpu::DeviceType) -> DeviceKind {
    match ty {
        wgpu::DeviceType::DiscreteGpu | wgpu::DeviceType::IntegratedGpu | wgpu::DeviceType::VirtualGpu => DeviceKind::Gpu,
        wgpu::DeviceType::Cpu => DeviceKind::Cpu,
        wgpu::DeviceType::Other => DeviceKind::Other,
    }
}

fn describe(index: usize, adapter: &wgpu::Adapter) -> DeviceInfo {
    let info = adapter.get_info();
    let limits = adapter.limits();
    info_from_limits(index, &info.name, info.vendor, info.device_type, &limits)
}

fn info_from_limits(index: usize, name: &str, vendor: u32, ty: wgpu::DeviceType, limits: &wgpu::Limits) -> DeviceInfo {
    let max_alloc = limits.max_buffer_size.min(limits.max_storage_buffer_binding_size as u64);
    DeviceInfo {
        index,
        name: name.to_string(),
        vendor: format!("{vendor:#06x}"),
        kind: kind_of(ty),
        max_work_group_size: limits.max_compute_invocations_per_workgroup as usize,
        max_work_item_sizes: [
            limits.max_compute_workgroup_size_x as usize,
            limits.max_compute_workgroup_size_y as usize,
            limits.max_compute_workgroup_size_z as usize,
        ],
        // wgpu does not report device memory; the largest buffer stands in.
        global_mem_bytes: limits.max_buffer_size,
        max_alloc_bytes: max_alloc,
        extensions: Vec::new(),
    }
}

/// The opened device reports the *requested* limits, not the adapter's.
fn clamp_to_limits(info: DeviceInfo, limits: &wgpu::Limits) -> DeviceInfo {
    let requested = info_from_limits(info.index, &info.name, 0, wgpu::DeviceType::Other, limits);
    DeviceInfo {
        max_work_group_size: info.max_work_group_size.min(requested.max_work_group_size),
        max_work_item_sizes: [
            info.max_work_item_sizes[0].min(requested.max_work_item_sizes[0]),
            info.max_work_item_sizes[1].min(requested.max_work_item_sizes[1]),
            info.max_work_item_sizes[2].min(requested.max_work_item_sizes[2]),
        ],
        max_alloc_bytes: info.max_alloc_bytes.min(requested.max_alloc_bytes),
        global_mem_bytes: info.global_mem_bytes.min(requested.global_mem_bytes),
        ..info
    }
}

// ============================================================
// Limits helpers
// ============================================================

fn limits_for_profile(profile: DeviceProfile) -> wgpu::Limits {
    match profile {
        DeviceProfile::Native => wgpu::Limits::default(),

        DeviceProfile::RaspberryPi => wgpu::Limits {
            // VideoCore VI/VII: vulkaninfo reports 256 max invocations.
            max_compute_invocations_per_workgroup: 256,
            max_compute_workgroup_size_x: 256,
            max_compute_workgroup_size_y: 256,
            max_compute_workgroup_size_z: 64,
            // 128 MiB of the shared 4 GiB is ample for a 128³ grid.
            max_storage_buffer_binding_size: 128 << 20,
            max_buffer_size: 128 << 20,
            ..wgpu::Limits::default()
        },
    }
}

fn max_invocations_for_profile(profile: DeviceProfile) -> u32 {
    limits_for_profile(profile).max_compute_invocations_per_workgroup
}

// ============================================================
// Error type
// ============================================================

#[derive(Debug, Error)]
pub enum GpuError {
    /// No adapter matched the selector. On WSL2 check that `vulkaninfo`
    /// lists a real GPU.
    #[error(transparent)]
    NoDevice(#[from] NoDeviceError),
    #[error("device request failed: {0}")]
    DeviceRequest(#[from] wgpu::RequestDeviceError),
    #[error("workgroup size {total} exceeds profile limit of {max} invocations")]
    WorkgroupTooLarge { total: u32, max: u32 },
}

// ============================================================
// Tests
// ============================================================
