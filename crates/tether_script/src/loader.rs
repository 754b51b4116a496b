//! Module source loading
//!
//! The runtime does not resolve files itself. A [`ModuleLoader`] hands it the
//! source of a module and the list of modules it imports directly; the import list
//! drives preloading.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};

/// Source code and direct imports of one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSource {
    pub code: String,
    pub imports: Vec<String>,
}

impl ModuleSource {
    /// Build a source whose imports are the `require("...")` calls found in `code`.
    pub fn new(code: impl Into<String>) -> Self {
        let code = code.into();
        let imports = scan_imports(&code);
        Self { code, imports }
    }

    pub fn with_imports(code: impl Into<String>, imports: Vec<String>) -> Self {
        Self {
            code: code.into(),
            imports: imports.iter().map(|path| normalize_path(path)).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    NotFound,
    Io(String),
}

/// Supplies module sources to the engine thread.
pub trait ModuleLoader: Send + Sync {
    fn load(&self, path: &str) -> Result<ModuleSource, LoadError>;
}

/// Canonical form of a module path: no leading `./` or `/`, no `.js` suffix.
pub fn normalize_path(path: &str) -> String {
    let mut path = path.trim();
    while let Some(rest) = path.strip_prefix("./") {
        path = rest;
    }
    let path = path.trim_start_matches('/');
    path.strip_suffix(".js").unwrap_or(path).to_string()
}

/// Collect the literal arguments of `require(...)` calls, in first-seen order.
///
/// This is a lexical scan, not a parse: comments and string literals are
/// skipped and `require` must stand alone (`myrequire(` and `obj.require(` do
/// not count). Regex literals containing quotes can still confuse it; loaders
/// that know better should use [`ModuleSource::with_imports`].
pub fn scan_imports(code: &str) -> Vec<String> {
    const CALL: &[u8] = b"require(";

    let bytes = code.as_bytes();
    let mut imports: Vec<String> = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                i = find_from(bytes, i + 2, b"\n").map_or(bytes.len(), |end| end + 1);
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = find_from(bytes, i + 2, b"*/").map_or(bytes.len(), |end| end + 2);
            }
            quote @ (b'"' | b'\'' | b'`') => {
                i = string_end(bytes, i + 1, quote).map_or(bytes.len(), |end| end + 1);
            }
            _ if bytes[i..].starts_with(CALL) && (i == 0 || !is_ident_byte(bytes[i - 1])) => {
                i += CALL.len();
                while bytes.get(i).map_or(false, u8::is_ascii_whitespace) {
                    i += 1;
                }
                let Some(&quote) = bytes
                    .get(i)
                    .filter(|b| matches!(**b, b'"' | b'\'' | b'`'))
                else {
                    continue;
                };
                let Some(end) = string_end(bytes, i + 1, quote) else {
                    break;
                };
                let path = normalize_path(&code[i + 1..end]);
                if !path.is_empty() && !imports.contains(&path) {
                    imports.push(path);
                }
                i = end + 1;
            }
            _ => i += 1,
        }
    }
    imports
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'$' | b'.') || b >= 0x80
}

fn find_from(bytes: &[u8], start: usize, needle: &[u8]) -> Option<usize> {
    bytes
        .get(start..)?
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|at| start + at)
}

/// Index of the quote closing a literal whose body starts at `start`.
fn string_end(bytes: &[u8], start: usize, quote: u8) -> Option<usize> {
    let mut i = start;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b if b == quote => return Some(i),
            _ => i += 1,
        }
    }
    None
}

/// In-memory loader. Sources can be replaced at any time, which is how tests and
/// tools stage a new version of a module before announcing a hot reload.
#[derive(Default)]
pub struct StaticModuleLoader {
    modules: RwLock<HashMap<String, ModuleSource>>,
}

impl StaticModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module(self, path: &str, code: &str) -> Self {
        self.insert(path, ModuleSource::new(code));
        self
    }

    pub fn insert(&self, path: &str, source: ModuleSource) {
        self.modules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(normalize_path(path), source);
    }
}

impl ModuleLoader for StaticModuleLoader {
    fn load(&self, path: &str) -> Result<ModuleSource, LoadError> {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
            .ok_or(LoadError::NotFound)
    }
}

/// Loads `<root>/<path>.js` from disk.
pub struct FsModuleLoader {
    root: PathBuf,
}

impl FsModuleLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ModuleLoader for FsModuleLoader {
    fn load(&self, path: &str) -> Result<ModuleSource, LoadError> {
        let file = self.root.join(format!("{}.js", path));
        match std::fs::read_to_string(&file) {
            Ok(code) => Ok(ModuleSource::new(code)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(LoadError::NotFound),
            Err(err) => Err(LoadError::Io(format!("{}: {}", file.display(), err))),
        }
    }
}
