// emu/compiler.rs — Front end of the emulated device's OpenCL C compiler.
//
// The emulator checks what a driver front end would reject and extracts
// kernel signatures; the bodies themselves come from the kernel library.
//
// CHECKS
// ──────
//   #error / #warning          emitted as diagnostics
//   #pragma OPENCL EXTENSION   the device must list the extension
//   braces and parentheses     must balance
//   __kernel void f(...)       parameters must be __global pointers to
//                              uchar/char/float, or float/uint/int scalars
//   kernel names               unique across all units of one build
//   link                       every kernel needs a library body
//
// Diagnostics are formatted `unit:line:col: severity: message`, one per
// line, the way a command-line compiler prints them.

use std::collections::HashSet;
use std::fmt;

use crate::buffer::ElementType;
use crate::device::DeviceInfo;
use crate::emu::kernels::KernelLibrary;
use crate::program::{BuildLog, KernelParam, KernelSignature, KernelSource, ParamType, ScalarType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Severity {
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Default)]
struct Diagnostics {
    lines: Vec<String>,
    warnings: usize,
    errors: usize,
}

impl Diagnostics {
    fn at(&mut self, unit: &str, line: usize, col: usize, severity: Severity, message: impl fmt::Display) {
        self.lines.push(format!("{unit}:{line}:{col}: {severity}: {message}"));
        self.bump(severity);
    }

    fn link(&mut self, severity: Severity, message: impl fmt::Display) {
        self.lines.push(format!("link: {severity}: {message}"));
        self.bump(severity);
    }

    fn bump(&mut self, severity: Severity) {
        match severity {
            Severity::Warning => self.warnings += 1,
            Severity::Error => self.errors += 1,
        }
    }

    fn into_log(self, device: &str) -> BuildLog {
        let mut text = self.lines.join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        BuildLog { device: device.to_string(), text, warnings: self.warnings, errors: self.errors }
    }
}

/// Compile every unit for one device. Signatures are returned even when
/// the log reports errors; the caller decides from the log.
pub(crate) fn compile(units: &[KernelSource], device: &DeviceInfo, library: &KernelLibrary) -> (Vec<KernelSignature>, BuildLog) {
    let mut diags = Diagnostics::default();
    let mut kernels: Vec<KernelSignature> = Vec::new();
    let mut seen = HashSet::new();

    for unit in units {
        let text = strip_comments(&unit.text);
        check_directives(&unit.name, &text, device, &mut diags);
        let tokens = tokenize(&text);
        check_balance(&unit.name, &tokens, &mut diags);
        let found = parse_kernels(&unit.name, &tokens, &mut diags);
        if found.is_empty() {
            diags.at(&unit.name, 1, 1, Severity::Warning, "unit declares no kernels");
        }
        for (sig, line, col) in found {
            if !seen.insert(sig.name.clone()) {
                diags.at(&unit.name, line, col, Severity::Error, format!("redefinition of kernel `{}`", sig.name));
                continue;
            }
            kernels.push(sig);
        }
    }

    if diags.errors == 0 {
        for k in &kernels {
            if !library.contains(&k.name) {
                diags.link(Severity::Error, format!("no executable body for kernel `{}`", k.name));
            }
        }
    }
    (kernels, diags.into_log(&device.name))
}

/// Replace comments with spaces, keeping newlines so positions survive.
fn strip_comments(src: &str) -> String {
    let mut out = String::with_capacity(src.len());
    let mut chars = src.chars().peekable();
    while let Some(c) = chars.next() {
        match (c, chars.peek()) {
            ('/', Some('/')) => {
                out.push_str("  ");
                chars.next();
                while let Some(&n) = chars.peek() {
                    if n == '\n' {
                        break;
                    }
                    out.push(' ');
                    chars.next();
                }
            }
            ('/', Some('*')) => {
                out.push_str("  ");
                chars.next();
                let mut prev = ' ';
                for n in chars.by_ref() {
                    out.push(if n == '\n' { '\n' } else { ' ' });
                    if prev == '*' && n == '/' {
                        break;
                    }
                    prev = n;
                }
            }
            _ => out.push(c),
        }
    }
    out
}

fn check_directives(unit: &str, text: &str, device: &DeviceInfo, diags: &mut Diagnostics) {
    for (i, line) in text.lines().enumerate() {
        let trimmed = line.trim_start();
        let Some(rest) = trimmed.strip_prefix('#') else { continue };
        let col = line.len() - trimmed.len() + 1;
        let mut words = rest.split_whitespace();
        match words.next() {
            Some("error") => diags.at(unit, i + 1, col, Severity::Error, rest.trim_start()["error".len()..].trim()),
            Some("warning") => diags.at(unit, i + 1, col, Severity::Warning, rest.trim_start()["warning".len()..].trim()),
            Some("pragma") => {
                let parts: Vec<&str> = words.collect();
                if let ["OPENCL", "EXTENSION", ext, ":", "enable"] = parts.as_slice() {
                    if *ext != "all" && !device.supports(ext) {
                        diags.at(unit, i + 1, col, Severity::Error, format!("extension `{ext}` is not supported on {}", device.name));
                    }
                }
            }
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Punct(char),
    Other,
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    line: usize,
    col: usize,
}

/// Tokenize everything outside preprocessor lines.
fn tokenize(text: &str) -> Vec<Token> {
    let mut out = Vec::new();
    for (i, line) in text.lines().enumerate() {
        if line.trim_start().starts_with('#') {
            continue;
        }
        let chars: Vec<char> = line.chars().collect();
        let mut j = 0;
        while j < chars.len() {
            let c = chars[j];
            let start = j;
            let tok = if c.is_whitespace() {
                j += 1;
                continue;
            } else if c.is_ascii_alphabetic() || c == '_' {
                while j < chars.len() && (chars[j].is_ascii_alphanumeric() || chars[j] == '_') {
                    j += 1;
                }
                Tok::Ident(chars[start..j].iter().collect())
            } else if c.is_ascii_digit() {
                while j < chars.len() && (chars[j].is_ascii_alphanumeric() || chars[j] == '.') {
                    j += 1;
                }
                Tok::Other
            } else {
                j += 1;
                Tok::Punct(c)
            };
            out.push(Token { tok, line: i + 1, col: start + 1 });
        }
    }
    out
}

fn check_balance(unit: &str, tokens: &[Token], diags: &mut Diagnostics) {
    let mut stack: Vec<&Token> = Vec::new();
    for t in tokens {
        match t.tok {
            Tok::Punct('{' | '(') => stack.push(t),
            Tok::Punct(c @ ('}' | ')')) => {
                let open = if c == '}' { '{' } else { '(' };
                match stack.pop() {
                    Some(o) if o.tok == Tok::Punct(open) => {}
                    Some(o) => {
                        diags.at(unit, t.line, t.col, Severity::Error, format!("unexpected `{c}`"));
                        stack.push(o);
                    }
                    None => diags.at(unit, t.line, t.col, Severity::Error, format!("unmatched `{c}`")),
                }
            }
            _ => {}
        }
    }
    for o in stack {
        let close = if o.tok == Tok::Punct('{') { '}' } else { ')' };
        diags.at(unit, o.line, o.col, Severity::Error, format!("expected `{close}` to close this"));
    }
}

// ---------------------------------------------------------------------------
// Kernel signatures
// ---------------------------------------------------------------------------

fn parse_kernels(unit: &str, tokens: &[Token], diags: &mut Diagnostics) -> Vec<(KernelSignature, usize, usize)> {
    let mut found = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        let is_kernel = matches!(&tokens[i].tok, Tok::Ident(s) if s == "__kernel" || s == "kernel");
        if !is_kernel {
            i += 1;
            continue;
        }
        let at = &tokens[i];
        i += 1;
        // Skip attributes such as __attribute__((reqd_work_group_size(...))).
        while matches!(tokens.get(i).map(|t| &t.tok), Some(Tok::Ident(s)) if s == "__attribute__") {
            i = skip_group(tokens, i + 1);
        }
        match tokens.get(i).map(|t| &t.tok) {
            Some(Tok::Ident(s)) if s == "void" => i += 1,
            _ => {
                diags.at(unit, at.line, at.col, Severity::Error, "kernel functions must return void");
                continue;
            }
        }
        let Some(Token { tok: Tok::Ident(name), line, col }) = tokens.get(i).cloned() else {
            diags.at(unit, at.line, at.col, Severity::Error, "expected kernel name");
            continue;
        };
        i += 1;
        if tokens.get(i).map(|t| &t.tok) != Some(&Tok::Punct('(')) {
            diags.at(unit, line, col, Severity::Error, format!("expected `(` after kernel `{name}`"));
            continue;
        }
        let close = skip_group(tokens, i);
        let inner = &tokens[(i + 1).min(close)..close.saturating_sub(1).max(i + 1)];
        i = close;

        let mut params = Vec::new();
        let mut ok = true;
        for part in inner.split(|t| t.tok == Tok::Punct(',')) {
            match parse_param(part) {
                Ok(Some(p)) => params.push(p),
                Ok(None) => {}
                Err((msg, t_line, t_col)) => {
                    diags.at(unit, t_line.unwrap_or(line), t_col.unwrap_or(col), Severity::Error, format!("in kernel `{name}`: {msg}"));
                    ok = false;
                }
            }
        }
        if ok {
            found.push((KernelSignature { name, params }, line, col));
        }
    }
    found
}

/// Given the index of an opening `(`, return the index just past its match.
fn skip_group(tokens: &[Token], open: usize) -> usize {
    let mut depth = 0usize;
    let mut i = open;
    while i < tokens.len() {
        match tokens[i].tok {
            Tok::Punct('(') => depth += 1,
            Tok::Punct(')') => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return i + 1;
                }
            }
            _ => {}
        }
        i += 1;
    }
    tokens.len()
}

type ParamFault = (String, Option<usize>, Option<usize>);

fn parse_param(part: &[Token]) -> Result<Option<KernelParam>, ParamFault> {
    let words: Vec<&str> = part
        .iter()
        .filter_map(|t| match &t.tok {
            Tok::Ident(s) => Some(s.as_str()),
            _ => None,
        })
        .collect();
    let first = part.first();
    let pos = (first.map(|t| t.line), first.map(|t| t.col));
    if words.is_empty() || words == ["void"] {
        return Ok(None);
    }
    let pointer = part.iter().any(|t| t.tok == Tok::Punct('*'));
    let Some((&name, quals)) = words.split_last() else {
        return Ok(None);
    };
    let fault = |msg: String| (msg, pos.0, pos.1);

    let has = |q: &str| quals.iter().any(|w| *w == q);
    let base: Vec<&str> = quals
        .iter()
        .copied()
        .filter(|q| !matches!(*q, "__global" | "global" | "const" | "restrict" | "__restrict" | "volatile"))
        .collect();

    if pointer {
        for space in ["__local", "local", "__constant", "constant", "__private", "private"] {
            if has(space) {
                return Err(fault(format!("parameter `{name}`: address space `{space}` is not supported")));
            }
        }
        if !(has("__global") || has("global")) {
            return Err(fault(format!("parameter `{name}`: pointer parameters must be __global")));
        }
        let element = match base.as_slice() {
            ["uchar"] | ["char"] | ["unsigned", "char"] => ElementType::Byte,
            ["float"] => ElementType::Float32,
            other => return Err(fault(format!("parameter `{name}`: unsupported element type `{}`", other.join(" ")))),
        };
        let writable = !has("const");
        return Ok(Some(KernelParam { name: name.to_string(), ty: ParamType::Buffer { element, writable } }));
    }

    let scalar = match base.as_slice() {
        ["float"] => ScalarType::F32,
        ["uint"] | ["unsigned"] | ["unsigned", "int"] => ScalarType::U32,
        ["int"] => ScalarType::I32,
        other => return Err(fault(format!("parameter `{name}`: unsupported scalar type `{}`", other.join(" ")))),
    };
    Ok(Some(KernelParam { name: name.to_string(), ty: ParamType::Scalar(scalar) }))
}
