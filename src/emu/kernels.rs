// emu/kernels.rs — Executable kernel bodies for the emulated device.
//
// The emulator compiles kernel *signatures* from source text but cannot run
// OpenCL C. Each entry point is instead backed by a Rust body registered in
// a `KernelLibrary` under the same name; the body runs once per work-item
// with the item's ids and positional access to the bound arguments.
//
// Reference bodies:
//
//   mandel(voxels: uchar*, power: float)              over (V, V, V)
//   ray(image: uchar*, voxels: const uchar*,
//       config: const float*, debug: float*)          over (W, H)
//   pass_through(src: const float*, dst: float*)      over (N)
//
// The shipped OpenCL C and WGSL sources implement the same arithmetic.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::buffer::AlignedBytes;
use crate::device::DeviceInfo;
use crate::error::Status;
use crate::view::{add, normalize, scale, sub, RenderConfig};

/// Escape-time iterations of the Mandelbulb generator.
pub const MAX_ITERATIONS: u32 = 10;
/// Voxel values at or above this are solid to the marcher.
pub const SOLID: u8 = 128;
/// Image value written where a ray hits nothing.
pub const BACKGROUND: u8 = 0;
/// Debug value written where a ray hits nothing.
pub const MISS_DEPTH: f32 = -1.0;
/// March step in voxel units.
pub const STEP: f32 = 0.5;

// ---------------------------------------------------------------------------
// Work-items and arguments
// ---------------------------------------------------------------------------

/// Ids of one work-item. Unused dimensions are 0 (ids) or 1 (sizes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkItem {
    pub global_id: [usize; 3],
    pub global_size: [usize; 3],
    pub local_id: [usize; 3],
    pub local_size: [usize; 3],
    pub group_id: [usize; 3],
}

impl WorkItem {
    /// Row-major linear index of the global id, x fastest.
    pub fn linear_id(&self) -> usize {
        let [x, y, z] = self.global_id;
        let [w, h, _] = self.global_size;
        (z * h + y) * w + x
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum KernelFault {
    #[error("argument {0} is not a buffer")]
    NotABuffer(usize),
    #[error("argument {index} is not a {expected} scalar")]
    NotAScalar { index: usize, expected: &'static str },
    #[error("argument {index}: element {offset} is outside a buffer of {len} elements")]
    OutOfBounds { index: usize, offset: usize, len: usize },
    #[error("{0}")]
    Custom(String),
}

impl KernelFault {
    pub fn status(&self) -> Status {
        match self {
            KernelFault::NotABuffer(_) | KernelFault::NotAScalar { .. } => Status::InvalidKernelArgs,
            KernelFault::OutOfBounds { .. } | KernelFault::Custom(_) => Status::OutOfResources,
        }
    }
}

pub(crate) enum ArgValue {
    Buffer(AlignedBytes),
    /// Same device buffer bound again; refers to an earlier slot.
    Alias(usize),
    F32(f32),
    U32(u32),
    I32(i32),
}

/// Positional access to a launch's bound arguments.
pub struct KernelArgs {
    values: Vec<ArgValue>,
}

impl KernelArgs {
    pub(crate) fn new(values: Vec<ArgValue>) -> Self {
        KernelArgs { values }
    }

    pub(crate) fn into_values(self) -> Vec<ArgValue> {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn slot(&self, index: usize) -> Result<usize, KernelFault> {
        match self.values.get(index) {
            Some(ArgValue::Buffer(_)) => Ok(index),
            Some(ArgValue::Alias(j)) => Ok(*j),
            _ => Err(KernelFault::NotABuffer(index)),
        }
    }

    fn buffer(&self, index: usize) -> Result<&AlignedBytes, KernelFault> {
        match self.values.get(self.slot(index)?) {
            Some(ArgValue::Buffer(b)) => Ok(b),
            _ => Err(KernelFault::NotABuffer(index)),
        }
    }

    fn buffer_mut(&mut self, index: usize) -> Result<&mut AlignedBytes, KernelFault> {
        let slot = self.slot(index)?;
        match self.values.get_mut(slot) {
            Some(ArgValue::Buffer(b)) => Ok(b),
            _ => Err(KernelFault::NotABuffer(index)),
        }
    }

    pub fn bytes(&self, index: usize) -> Result<&[u8], KernelFault> {
        Ok(self.buffer(index)?.as_bytes())
    }

    pub fn f32s(&self, index: usize) -> Result<&[f32], KernelFault> {
        Ok(self.buffer(index)?.as_f32())
    }

    pub fn read_byte(&self, index: usize, offset: usize) -> Result<u8, KernelFault> {
        let bytes = self.bytes(index)?;
        bytes.get(offset).copied().ok_or(KernelFault::OutOfBounds { index, offset, len: bytes.len() })
    }

    pub fn write_byte(&mut self, index: usize, offset: usize, value: u8) -> Result<(), KernelFault> {
        let bytes = self.buffer_mut(index)?.as_bytes_mut();
        let len = bytes.len();
        let slot = bytes.get_mut(offset).ok_or(KernelFault::OutOfBounds { index, offset, len })?;
        *slot = value;
        Ok(())
    }

    pub fn read_f32(&self, index: usize, offset: usize) -> Result<f32, KernelFault> {
        let floats = self.f32s(index)?;
        floats.get(offset).copied().ok_or(KernelFault::OutOfBounds { index, offset, len: floats.len() })
    }

    pub fn write_f32(&mut self, index: usize, offset: usize, value: f32) -> Result<(), KernelFault> {
        let floats = self.buffer_mut(index)?.as_f32_mut();
        let len = floats.len();
        let slot = floats.get_mut(offset).ok_or(KernelFault::OutOfBounds { index, offset, len })?;
        *slot = value;
        Ok(())
    }

    pub fn scalar_f32(&self, index: usize) -> Result<f32, KernelFault> {
        match self.values.get(index) {
            Some(ArgValue::F32(v)) => Ok(*v),
            _ => Err(KernelFault::NotAScalar { index, expected: "float" }),
        }
    }

    pub fn scalar_u32(&self, index: usize) -> Result<u32, KernelFault> {
        match self.values.get(index) {
            Some(ArgValue::U32(v)) => Ok(*v),
            _ => Err(KernelFault::NotAScalar { index, expected: "uint" }),
        }
    }

    pub fn scalar_i32(&self, index: usize) -> Result<i32, KernelFault> {
        match self.values.get(index) {
            Some(ArgValue::I32(v)) => Ok(*v),
            _ => Err(KernelFault::NotAScalar { index, expected: "int" }),
        }
    }
}

// ---------------------------------------------------------------------------
// Library
// ---------------------------------------------------------------------------

pub type KernelBody = Arc<dyn Fn(&WorkItem, &mut KernelArgs) -> Result<(), KernelFault> + Send + Sync>;

/// Name-indexed kernel bodies.
#[derive(Clone, Default)]
pub struct KernelLibrary {
    bodies: HashMap<String, KernelBody>,
}

impl KernelLibrary {
    /// An empty library.
    pub fn new() -> Self {
        KernelLibrary::default()
    }

    /// Bodies for the shipped `mandel`, `ray` and `pass_through` kernels.
    pub fn reference() -> Self {
        KernelLibrary::new()
            .with("mandel", mandel)
            .with("ray", ray)
            .with("pass_through", pass_through)
    }

    pub fn register<F>(&mut self, name: impl Into<String>, body: F)
    where
        F: Fn(&WorkItem, &mut KernelArgs) -> Result<(), KernelFault> + Send + Sync + 'static,
    {
        self.bodies.insert(name.into(), Arc::new(body));
    }

    pub fn with<F>(mut self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&WorkItem, &mut KernelArgs) -> Result<(), KernelFault> + Send + Sync + 'static,
    {
        self.register(name, body);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bodies.contains_key(name)
    }

    pub(crate) fn get(&self, name: &str) -> Option<&KernelBody> {
        self.bodies.get(name)
    }
}

impl fmt::Debug for KernelLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.bodies.keys().collect();
        names.sort();
        f.debug_struct("KernelLibrary").field("kernels", &names).finish()
    }
}

/// Default local extent when a launch leaves it open: per dimension the
/// largest divisor of the global extent up to 16×4×4, shrunk until the
/// device's work-group limit is met.
pub(crate) fn default_local(global: [usize; 3], rank: usize, device: &DeviceInfo) -> [usize; 3] {
    const PREFERRED: [usize; 3] = [16, 4, 4];
    let mut local = [1; 3];
    for d in 0..rank.min(3) {
        let cap = PREFERRED[d].min(device.max_work_item_sizes[d]).max(1);
        local[d] = largest_divisor_at_most(global[d], cap);
    }
    while local.iter().product::<usize>() > device.max_work_group_size.max(1) {
        match (0..3).rev().find(|&d| local[d] > 1) {
            Some(d) => local[d] = largest_divisor_at_most(global[d], local[d] - 1),
            None => break,
        }
    }
    local
}

fn largest_divisor_at_most(n: usize, cap: usize) -> usize {
    (1..=cap.min(n).max(1)).rev().find(|d| n % d == 0).unwrap_or(1)
}

// ---------------------------------------------------------------------------
// Reference bodies
// ---------------------------------------------------------------------------

fn mandel(item: &WorkItem, args: &mut KernelArgs) -> Result<(), KernelFault> {
    let power = args.scalar_f32(1)?;
    let [x, y, z] = item.global_id;
    let [nx, ny, nz] = item.global_size;
    let c = [grid_coord(x, nx), grid_coord(y, ny), grid_coord(z, nz)];
    args.write_byte(0, item.linear_id(), mandelbulb_density(c, power))
}

fn ray(item: &WorkItem, args: &mut KernelArgs) -> Result<(), KernelFault> {
    let [px, py, _] = item.global_id;
    let [w, h, _] = item.global_size;
    let cfg = RenderConfig::from_floats(args.f32s(2)?)
        .ok_or_else(|| KernelFault::Custom("render config must hold 15 floats".to_string()))?;
    let [dx, dy, _] = grid_dims(&cfg);
    let (shade, depth) = {
        let voxels = &*args;
        march(&cfg, px, py, w, h, |x, y, z| voxels.read_byte(1, (z * dy + y) * dx + x))?
    };
    let idx = py * w + px;
    args.write_byte(0, idx, shade)?;
    args.write_f32(3, idx, depth)
}

fn pass_through(item: &WorkItem, args: &mut KernelArgs) -> Result<(), KernelFault> {
    let i = item.linear_id();
    let v = args.read_f32(0, i)?;
    args.write_f32(1, i, v)
}

/// Centre of voxel `i` of `n`, mapped into [-1.5, 1.5].
fn grid_coord(i: usize, n: usize) -> f32 {
    ((i as f32 + 0.5) / n as f32) * 3.0 - 1.5
}

/// Escape-time density of the power-`power` Mandelbulb at `c`: 255 inside,
/// otherwise the escape iteration scaled into 0..=127.
pub fn mandelbulb_density(c: [f32; 3], power: f32) -> u8 {
    let mut p = c;
    for i in 0..MAX_ITERATIONS {
        let r = (p[0] * p[0] + p[1] * p[1] + p[2] * p[2]).sqrt();
        if r > 2.0 {
            return (i * 127 / MAX_ITERATIONS) as u8;
        }
        let theta = if r > 0.0 { (p[2] / r).clamp(-1.0, 1.0).acos() } else { 0.0 };
        let phi = p[1].atan2(p[0]);
        let rp = r.powf(power);
        let (st, ct) = (theta * power).sin_cos();
        let (sp, cp) = (phi * power).sin_cos();
        p = [rp * st * cp + c[0], rp * st * sp + c[1], rp * ct + c[2]];
    }
    255
}

fn grid_dims(cfg: &RenderConfig) -> [usize; 3] {
    [cfg.dims[0].max(0.0) as usize, cfg.dims[1].max(0.0) as usize, cfg.dims[2].max(0.0) as usize]
}

/// Cast the ray for pixel `(px, py)` and march it through the grid.
///
/// Returns `(shade, depth)`: shade is 1..=250 on a hit (brighter is nearer
/// the entry face) and `BACKGROUND` on a miss; depth is the ray parameter of
/// the hit, or `MISS_DEPTH`.
pub fn march<F>(cfg: &RenderConfig, px: usize, py: usize, width: usize, height: usize, mut sample: F) -> Result<(u8, f32), KernelFault>
where
    F: FnMut(usize, usize, usize) -> Result<u8, KernelFault>,
{
    let dims = grid_dims(cfg);
    if dims.contains(&0) {
        return Ok((BACKGROUND, MISS_DEPTH));
    }
    let u = (px as f32 + 0.5) / width as f32 - 0.5;
    let v = (py as f32 + 0.5) / height as f32 - 0.5;
    let target = add(add(cfg.vp_mid, scale(cfg.vp_right, u)), scale(cfg.vp_down, v));
    let dir = normalize(sub(target, cfg.eye));
    let Some((t0, t1)) = slab(cfg.eye, dir, cfg.dims) else {
        return Ok((BACKGROUND, MISS_DEPTH));
    };

    let cell = |p: f32, n: usize| (p.floor().max(0.0) as usize).min(n - 1);
    let mut t = t0.max(0.0);
    while t <= t1 {
        let p = add(cfg.eye, scale(dir, t));
        if sample(cell(p[0], dims[0]), cell(p[1], dims[1]), cell(p[2], dims[2]))? >= SOLID {
            let span = (t1 - t0).max(f32::EPSILON);
            let depth = ((t - t0) / span).clamp(0.0, 1.0);
            let shade = (250.0 - depth * 249.0).round().clamp(1.0, 250.0) as u8;
            return Ok((shade, t));
        }
        t += STEP;
    }
    Ok((BACKGROUND, MISS_DEPTH))
}

/// Ray/box intersection against [0, dims]. Returns the entry and exit
/// parameters, or `None` when the box is missed or behind the origin.
fn slab(origin: [f32; 3], dir: [f32; 3], dims: [f32; 3]) -> Option<(f32, f32)> {
    let mut t0 = f32::NEG_INFINITY;
    let mut t1 = f32::INFINITY;
    for a in 0..3 {
        if dir[a].abs() < 1e-8 {
            if origin[a] < 0.0 || origin[a] > dims[a] {
                return None;
            }
        } else {
            let inv = 1.0 / dir[a];
            let (mut ta, mut tb) = (-origin[a] * inv, (dims[a] - origin[a]) * inv);
            if ta > tb {
                std::mem::swap(&mut ta, &mut tb);
            }
            t0 = t0.max(ta);
            t1 = t1.min(tb);
        }
    }
    (t1 >= t0.max(0.0)).then_some((t0, t1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceKind;

    fn device(max_wg: usize) -> DeviceInfo {
        DeviceInfo {
            index: 0,
            name: "t".into(),
            vendor: "t".into(),
            kind: DeviceKind::Gpu,
            max_work_group_size: max_wg,
            max_work_item_sizes: [256, 256, 64],
            global_mem_bytes: 1 << 20,
            max_alloc_bytes: 1 << 20,
            extensions: vec![],
        }
    }

    #[test]
    fn default_local_divides_global() {
        let d = device(256);
        assert_eq!(default_local([320, 240, 1], 2, &d), [16, 4, 1]);
        assert_eq!(default_local([128, 128, 128], 3, &d), [16, 4, 4]);
        assert_eq!(default_local([1000, 1, 1], 1, &d), [10, 1, 1]);
        assert_eq!(default_local([7, 1, 1], 1, &d), [7, 1, 1]);
    }

    #[test]
    fn default_local_respects_group_limit() {
        let d = device(32);
        let l = default_local([128, 128, 128], 3, &d);
        assert!(l.iter().product::<usize>() <= 32, "{l:?}");
        for (g, l) in [128, 128, 128].iter().zip(l) {
            assert_eq!(g % l, 0);
        }
    }

    #[test]
    fn bulb_centre_is_solid_and_corner_is_empty() {
        assert_eq!(mandelbulb_density([0.05, 0.05, 0.05], 8.0), 255);
        assert!(mandelbulb_density([1.49, 1.49, 1.49], 8.0) < SOLID);
    }

    #[test]
    fn slab_hits_and_misses() {
        let (t0, t1) = slab([5.0, 5.0, -10.0], [0.0, 0.0, 1.0], [10.0, 10.0, 10.0]).unwrap();
        assert!((t0 - 10.0).abs() < 1e-5 && (t1 - 20.0).abs() < 1e-5);
        assert!(slab([50.0, 5.0, -10.0], [0.0, 0.0, 1.0], [10.0, 10.0, 10.0]).is_none());
        assert!(slab([5.0, 5.0, 20.0], [0.0, 0.0, 1.0], [10.0, 10.0, 10.0]).is_none());
    }

    #[test]
    fn march_reports_hit_shade_and_depth() {
        let cfg = RenderConfig::for_grid(8);
        // Solid everywhere: the centre ray hits on the entry face.
        let (shade, depth) = march(&cfg, 0, 0, 1, 1, |_, _, _| Ok(255)).unwrap();
        assert_eq!(shade, 250);
        assert!((depth - 24.0).abs() < 1e-3, "{depth}");
        // Empty everywhere: background.
        let (shade, depth) = march(&cfg, 0, 0, 1, 1, |_, _, _| Ok(0)).unwrap();
        assert_eq!((shade, depth), (BACKGROUND, MISS_DEPTH));
    }

    #[test]
    fn kernel_args_bounds_and_aliases() {
        let mut args = KernelArgs::new(vec![
            ArgValue::Buffer(AlignedBytes::zeroed(4)),
            ArgValue::Alias(0),
            ArgValue::F32(2.0),
        ]);
        args.write_byte(1, 3, 9).unwrap();
        assert_eq!(args.read_byte(0, 3).unwrap(), 9);
        assert!(matches!(args.write_byte(0, 4, 1), Err(KernelFault::OutOfBounds { offset: 4, .. })));
        assert_eq!(args.scalar_f32(2).unwrap(), 2.0);
        assert!(matches!(args.scalar_u32(2), Err(KernelFault::NotAScalar { .. })));
        assert!(matches!(args.bytes(2), Err(KernelFault::NotABuffer(2))));
    }
}
