//! Safe, collision-free local names for remote items.
//!
//! Remote titles can contain anything: slashes, reserved device names,
//! hundreds of characters. [`resolve`] turns a title into a name that is valid
//! on common filesystems and unique among the names already claimed in the
//! same directory. It is pure: the only state is the sibling set passed in.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Maximum length of one path component, in bytes. Leaves room below the
/// common 255-byte limit for a temp-file suffix.
pub const MAX_NAME_BYTES: usize = 200;

/// Name used when nothing printable survives sanitizing.
pub const FALLBACK_NAME: &str = "untitled";

/// Longest suffix still treated as a file extension.
const MAX_EXTENSION_BYTES: usize = 16;

const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Names already assigned within one directory.
///
/// Comparison ignores case so the result is safe on case-insensitive
/// filesystems.
#[derive(Debug, Clone, Default)]
pub struct SiblingNames {
    used: HashSet<String>,
}

impl SiblingNames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.used.contains(&name.to_lowercase())
    }

    pub fn insert(&mut self, name: &str) {
        self.used.insert(name.to_lowercase());
    }

    pub fn len(&self) -> usize {
        self.used.len()
    }

    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }

    /// Resolve `candidate` and record the result as used.
    pub fn claim(&mut self, candidate: &str) -> String {
        let name = resolve(candidate, self);
        self.insert(&name);
        name
    }
}

/// Sibling sets for every directory of one output tree.
#[derive(Debug, Default)]
pub struct PathAllocator {
    dirs: HashMap<PathBuf, SiblingNames>,
}

impl PathAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a unique name for `candidate` inside `dir` and return the joined path.
    pub fn allocate(&mut self, dir: &Path, candidate: &str) -> PathBuf {
        let name = self.dirs.entry(dir.to_path_buf()).or_default().claim(candidate);
        dir.join(name)
    }
}

/// Map `candidate` to a safe name not present in `siblings`.
///
/// Collisions get ` (2)`, ` (3)`, ... inserted before the extension, so the
/// outcome depends only on the candidate and the names claimed before it.
pub fn resolve(candidate: &str, siblings: &SiblingNames) -> String {
    let base = sanitize_component(candidate);
    if !siblings.contains(&base) {
        return base;
    }

    let (stem, extension) = split_extension(&base);
    (2u64..)
        .map(|n| fit(stem, &format!(" ({})", n), extension))
        .find(|name| !siblings.contains(name))
        .unwrap_or(base)
}

/// Make a single path component safe for common filesystems.
pub fn sanitize_component(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    // Windows strips trailing dots and spaces, which would alias distinct names.
    let trimmed = replaced.trim().trim_end_matches(&['.', ' '][..]);
    if trimmed.is_empty() || trimmed.chars().all(|c| c == '.') {
        return FALLBACK_NAME.to_string();
    }

    // Dot-prefixed names are left to temp files and the ledger.
    let visible;
    let trimmed = if trimmed.starts_with('.') {
        visible = format!("_{}", trimmed);
        visible.as_str()
    } else {
        trimmed
    };

    let (stem, extension) = split_extension(trimmed);
    let stem = if RESERVED_NAMES
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(stem))
    {
        format!("_{}", stem)
    } else {
        stem.to_string()
    };

    fit(&stem, "", extension)
}

/// Append `.extension` unless `title` already ends with it.
pub fn with_extension(title: &str, extension: Option<&str>) -> String {
    match extension.map(|e| e.trim_start_matches('.')).filter(|e| !e.is_empty()) {
        Some(ext) => {
            let suffix = format!(".{}", ext.to_lowercase());
            if title.to_lowercase().ends_with(&suffix) {
                title.to_string()
            } else {
                format!("{}.{}", title, ext)
            }
        }
        None => title.to_string(),
    }
}

/// Split `name` into stem and extension (with its dot).
pub fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx)
            if idx > 0
                && name.len() - idx <= MAX_EXTENSION_BYTES
                && !name[idx..].contains(' ') =>
        {
            name.split_at(idx)
        }
        _ => (name, ""),
    }
}

/// Join stem, suffix and extension, shortening the stem to stay within
/// [`MAX_NAME_BYTES`].
fn fit(stem: &str, suffix: &str, extension: &str) -> String {
    let budget = MAX_NAME_BYTES.saturating_sub(suffix.len() + extension.len());
    let stem = truncate_bytes(stem, budget).trim_end_matches(&['.', ' '][..]);
    let stem = if stem.is_empty() { FALLBACK_NAME } else { stem };
    format!("{}{}{}", stem, suffix, extension)
}

fn truncate_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
