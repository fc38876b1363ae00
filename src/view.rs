// view.rs — The render configuration handed to the ray marcher.
//
// LAYOUT
// ──────
// 15 floats, passed to the marcher as a read-only buffer:
//
//   [0..3]   eye position
//   [3..6]   view-plane centre (the point the eye looks at)
//   [6..9]   view-plane right basis (spans the full image width)
//   [9..12]  view-plane down basis (spans the full image height)
//   [12..15] voxel-grid dimensions
//
// All positions are in voxel units: the grid occupies [0, dims) on each axis.
//
// The orbit and zoom helpers move the camera around the grid centre the way
// an interactive viewer would: points (eye, centre) are rotated about the
// grid centre, basis vectors are rotated in place, and zoom scales the basis.

use serde::{Deserialize, Serialize};

pub const RENDER_CONFIG_FLOATS: usize = 15;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable, Serialize, Deserialize)]
pub struct RenderConfig {
    pub eye: [f32; 3],
    pub vp_mid: [f32; 3],
    pub vp_right: [f32; 3],
    pub vp_down: [f32; 3],
    pub dims: [f32; 3],
}

impl RenderConfig {
    /// Default view of a `v`³ grid: eye 3v in front of the grid, looking
    /// at its centre through a v×v view plane at distance v.
    pub fn for_grid(v: usize) -> Self {
        let v = v as f32;
        RenderConfig {
            eye: [v / 2.0, v / 2.0, -3.0 * v],
            vp_mid: [v / 2.0, v / 2.0, -2.0 * v],
            vp_right: [v, 0.0, 0.0],
            vp_down: [0.0, v, 0.0],
            dims: [v, v, v],
        }
    }

    pub fn as_floats(&self) -> [f32; RENDER_CONFIG_FLOATS] {
        bytemuck::cast(*self)
    }

    /// Inverse of [`as_floats`](Self::as_floats). `None` unless exactly 15 floats.
    pub fn from_floats(floats: &[f32]) -> Option<Self> {
        let arr: [f32; RENDER_CONFIG_FLOATS] = floats.try_into().ok()?;
        Some(bytemuck::cast(arr))
    }

    /// Orbit about the grid centre. Angles are in steps of π/10 about the
    /// x, y and z axes.
    pub fn rotated(&self, steps: [f32; 3]) -> Self {
        let step = std::f32::consts::PI / 10.0;
        let rot = euler(steps[0] * step, steps[1] * step, steps[2] * step);
        let centre = scale(self.dims, 0.5);
        let about = |p: [f32; 3]| add(centre, mat_mul(&rot, sub(p, centre)));
        RenderConfig {
            eye: about(self.eye),
            vp_mid: about(self.vp_mid),
            vp_right: mat_mul(&rot, self.vp_right),
            vp_down: mat_mul(&rot, self.vp_down),
            dims: self.dims,
        }
    }

    /// Scale the view-plane basis. Values below 1 zoom in.
    pub fn zoomed(&self, factor: f32) -> Self {
        RenderConfig {
            vp_right: scale(self.vp_right, factor),
            vp_down: scale(self.vp_down, factor),
            ..*self
        }
    }
}

// ---------------------------------------------------------------------------
// Small vector helpers
// ---------------------------------------------------------------------------

pub(crate) fn add(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

pub(crate) fn sub(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

pub(crate) fn scale(a: [f32; 3], s: f32) -> [f32; 3] {
    [a[0] * s, a[1] * s, a[2] * s]
}

pub(crate) fn length(a: [f32; 3]) -> f32 {
    (a[0] * a[0] + a[1] * a[1] + a[2] * a[2]).sqrt()
}

pub(crate) fn normalize(a: [f32; 3]) -> [f32; 3] {
    let len = length(a);
    if len > 0.0 {
        scale(a, 1.0 / len)
    } else {
        [0.0, 0.0, 1.0]
    }
}

fn mat_mul(m: &[[f32; 3]; 3], v: [f32; 3]) -> [f32; 3] {
    [
        m[0][0] * v[0] + m[0][1] * v[1] + m[0][2] * v[2],
        m[1][0] * v[0] + m[1][1] * v[1] + m[1][2] * v[2],
        m[2][0] * v[0] + m[2][1] * v[1] + m[2][2] * v[2],
    ]
}

/// Rotation matrix Rz(yaw) · Ry(pitch) · Rx(roll).
fn euler(roll: f32, pitch: f32, yaw: f32) -> [[f32; 3]; 3] {
    let (sr, cr) = roll.sin_cos();
    let (sp, cp) = pitch.sin_cos();
    let (sy, cy) = yaw.sin_cos();
    [
        [cy * cp, cy * sp * sr - sy * cr, cy * sp * cr + sy * sr],
        [sy * cp, sy * sp * sr + cy * cr, sy * sp * cr - cy * sr],
        [-sp, cp * sr, cp * cr],
    ]
}
