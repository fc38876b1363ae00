// device.rs — Compute device descriptions and explicit device selection.
//
// Backends enumerate their devices as plain `DeviceInfo` records; the
// `DeviceSelector` picks one of them by position, kind or an arbitrary
// capability predicate and returns a typed `NoDeviceError` otherwise.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::NoDeviceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Gpu,
    Cpu,
    Accelerator,
    Other,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Gpu => write!(f, "GPU"),
            DeviceKind::Cpu => write!(f, "CPU"),
            DeviceKind::Accelerator => write!(f, "accelerator"),
            DeviceKind::Other => write!(f, "other"),
        }
    }
}

/// Capabilities of one compute device as reported by its backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Position in the backend's enumeration order.
    pub index: usize,
    pub name: String,
    pub vendor: String,
    pub kind: DeviceKind,
    /// Maximum work-items in one work-group (product of local extents).
    pub max_work_group_size: usize,
    /// Per-dimension limits on the local extent.
    pub max_work_item_sizes: [usize; 3],
    pub global_mem_bytes: u64,
    /// Largest single buffer the device will allocate.
    pub max_alloc_bytes: u64,
    pub extensions: Vec<String>,
}

impl DeviceInfo {
    pub fn supports(&self, extension: &str) -> bool {
        self.extensions.iter().any(|e| e == extension)
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {} ({}, {})", self.index, self.name, self.kind, self.vendor)
    }
}

/// How to choose the device the pipeline's queue runs on.
#[derive(Clone, Copy, Default)]
pub enum DeviceSelector {
    /// The first enumerated device.
    #[default]
    First,
    /// The device at this enumeration index.
    Index(usize),
    /// The first device of this kind.
    Kind(DeviceKind),
    /// The first device for which the predicate holds.
    Matching(fn(&DeviceInfo) -> bool),
}

impl DeviceSelector {
    /// Pick a device from `devices`.
    ///
    /// # Errors
    /// `NoDeviceError` when nothing matches, including when `devices` is empty.
    pub fn select<'a>(&self, devices: &'a [DeviceInfo]) -> Result<&'a DeviceInfo, NoDeviceError> {
        let found = match self {
            DeviceSelector::First => devices.first(),
            DeviceSelector::Index(i) => devices.iter().find(|d| d.index == *i),
            DeviceSelector::Kind(k) => devices.iter().find(|d| d.kind == *k),
            DeviceSelector::Matching(pred) => devices.iter().find(|d| pred(d)),
        };
        found.ok_or_else(|| NoDeviceError {
            requirement: self.to_string(),
            available: devices.len(),
        })
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSelector::First => write!(f, "any device"),
            DeviceSelector::Index(i) => write!(f, "device index {i}"),
            DeviceSelector::Kind(k) => write!(f, "device kind {k}"),
            DeviceSelector::Matching(_) => write!(f, "capability predicate"),
        }
    }
}

impl fmt::Debug for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceSelector({self})")
    }
}
