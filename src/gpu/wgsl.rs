// gpu/wgsl.rs — Kernel signatures from WGSL source.
//
// BINDING CONVENTION
// ──────────────────
// Kernel parameters are the `@group(0)` bindings of a unit, in binding
// order; every `@compute` entry point of the unit shares them. Group 1 is
// reserved for the backend (binding 0 holds the global extent as
// `vec4<u32>`).
//
//   var<storage, read_write> x: array<f32>            writable float buffer
//   var<storage, read> x: array<f32>                  read-only float buffer
//   var<storage, ...> x: array<u32 | atomic<u32>>     byte buffer, packed
//                                                     four bytes per word
//   var<uniform> x: f32 | u32 | i32                   scalar
//
// naga does the real compile; this scan only recovers what the dispatcher
// needs to validate arguments.

use crate::buffer::ElementType;
use crate::gpu::device::WorkgroupSize;
use crate::program::{KernelParam, KernelSignature, ParamType, ScalarType};

/// Binding group the backend owns.
pub const BACKEND_GROUP: u32 = 1;

/// Result of scanning one unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scan {
    pub kernels: Vec<KernelSignature>,
    /// `line:col: severity: message` lines, without the unit prefix.
    pub diagnostics: Vec<String>,
    pub errors: usize,
}

#[derive(Debug, Clone, PartialEq)]
struct Binding {
    binding: u32,
    param: KernelParam,
}

/// Replace the workgroup-size placeholders with literals.
pub fn specialise(text: &str, local: [u32; 3]) -> String {
    text.replace("{{WG_X}}", &local[0].to_string())
        .replace("{{WG_Y}}", &local[1].to_string())
        .replace("{{WG_Z}}", &local[2].to_string())
}

/// Specialise with the default extent for a launch of `rank` dimensions.
pub fn specialise_default(text: &str, wg: WorkgroupSize, rank: usize) -> String {
    specialise(text, wg.for_rank(rank))
}

pub fn scan(text: &str) -> Scan {
    let mut scan = Scan::default();
    let mut bindings: Vec<Binding> = Vec::new();
    let mut entries: Vec<String> = Vec::new();
    let mut pending_compute = false;

    for (n, raw) in text.lines().enumerate() {
        let line = strip_comment(raw).trim();
        let lineno = n + 1;
        if line.is_empty() {
            continue;
        }
        if line.contains("@compute") {
            pending_compute = true;
        }
        if pending_compute {
            if let Some(name) = fn_name(line) {
                entries.push(name.to_string());
                pending_compute = false;
            }
        }
        if let Some(group) = attr_u32(line, "@group(") {
            let Some(binding) = attr_u32(line, "@binding(") else {
                scan.error(lineno, "@group without @binding");
                continue;
            };
            if group == BACKEND_GROUP {
                continue;
            }
            if group != 0 {
                scan.error(lineno, format!("bind group {group} is not supported"));
                continue;
            }
            match parse_var(line) {
                Ok(param) => {
                    if bindings.iter().any(|b| b.binding == binding) {
                        scan.error(lineno, format!("binding {binding} declared twice"));
                    } else {
                        bindings.push(Binding { binding, param });
                    }
                }
                Err(msg) => scan.error(lineno, msg),
            }
        }
    }

    bindings.sort_by_key(|b| b.binding);
    for (i, b) in bindings.iter().enumerate() {
        if b.binding as usize != i {
            scan.error(0, format!("bindings must be contiguous from 0, found {} at position {i}", b.binding));
            break;
        }
    }
    let params: Vec<KernelParam> = bindings.into_iter().map(|b| b.param).collect();
    scan.kernels = entries.into_iter().map(|name| KernelSignature { name, params: params.clone() }).collect();
    scan
}

impl Scan {
    fn error(&mut self, line: usize, msg: impl Into<String>) {
        self.diagnostics.push(format!("{line}:1: error: {}", msg.into()));
        self.errors += 1;
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find("//") {
        Some(i) => &line[..i],
        None => line,
    }
}

fn attr_u32(line: &str, attr: &str) -> Option<u32> {
    let start = line.find(attr)? + attr.len();
    let end = line[start..].find(')')? + start;
    line[start..end].trim().parse().ok()
}

fn fn_name(line: &str) -> Option<&str> {
    let rest = &line[line.find("fn ")? + 3..];
    let end = rest.find('(')?;
    let name = rest[..end].trim();
    (!name.is_empty()).then_some(name)
}

/// `var<space[, access]> name: type;` after the attributes.
fn parse_var(line: &str) -> Result<KernelParam, String> {
    let var = line.find("var<").ok_or("binding is not a `var` declaration")?;
    let rest = &line[var + 4..];
    let close = rest.find('>').ok_or("unterminated address space")?;
    let space: Vec<&str> = rest[..close].split(',').map(str::trim).collect();
    let decl = rest[close + 1..].trim().trim_end_matches(';');
    let (name, ty) = decl.split_once(':').ok_or("binding without a type")?;
    let (name, ty) = (name.trim().to_string(), ty.trim());

    let ty = match space.as_slice() {
        ["uniform"] => match ty {
            "f32" => ParamType::Scalar(ScalarType::F32),
            "u32" => ParamType::Scalar(ScalarType::U32),
            "i32" => ParamType::Scalar(ScalarType::I32),
            other => return Err(format!("uniform `{name}` has unsupported type {other}")),
        },
        ["storage", access @ ..] => {
            let writable = match access {
                [] | ["read"] => false,
                ["read_write"] => true,
                other => return Err(format!("storage `{name}` has unsupported access {other:?}")),
            };
            let element = match ty.replace(' ', "").as_str() {
                "array<f32>" => ElementType::Float32,
                "array<u32>" | "array<atomic<u32>>" => ElementType::Byte,
                other => return Err(format!("storage `{name}` has unsupported type {other}")),
            };
            ParamType::Buffer { element, writable }
        }
        other => return Err(format!("`{name}` uses unsupported address space {other:?}")),
    };
    Ok(KernelParam { name, ty })
}
