//! Workspace-relative target paths
//!
//! Provides [`TargetPath`], the only way a file is named anywhere in the
//! pipeline. Construction normalizes the path and rejects anything that could
//! address a file outside the workspace root.

use std::fmt::{self, Display, Formatter};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

/// Normalized, relative path of a file inside the workspace
///
/// Stored as `/`-separated segments. Never absolute, never contains `.` or
/// `..` segments, never empty.
///
/// # Examples
/// - `src/lib.rs` → `["src", "lib.rs"]`
/// - `./src//main.rs` → `["src", "main.rs"]`
/// - `../etc/passwd` → rejected
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TargetPath(Vec<String>);

impl TargetPath {
    /// Parse and normalize a path
    ///
    /// # Errors
    /// Returns error for empty, absolute, parent-escaping or NUL-containing paths
    pub fn new(raw: &str) -> Result<Self, PathError> {
        if raw.contains('\0') {
            return Err(PathError::InvalidCharacter(raw.replace('\0', "\\0")));
        }
        let unified = raw.replace('\\', "/");
        if unified.starts_with('/') || has_drive_prefix(&unified) {
            return Err(PathError::Absolute(raw.to_string()));
        }

        let mut segments = Vec::new();
        for segment in unified.split('/') {
            match segment {
                "" | "." => {}
                ".." => return Err(PathError::Traversal(raw.to_string())),
                other => segments.push(other.to_string()),
            }
        }

        if segments.is_empty() {
            return Err(PathError::Empty);
        }
        Ok(Self(segments))
    }

    /// Convert a filesystem path relative to `root`
    ///
    /// # Errors
    /// Returns error if `path` is not under `root` or is not representable
    pub fn from_fs(root: &Path, path: &Path) -> Result<Self, PathError> {
        let relative = path
            .strip_prefix(root)
            .map_err(|_| PathError::OutsideRoot(path.display().to_string()))?;
        let mut parts = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => parts.push(
                    part.to_str()
                        .ok_or_else(|| PathError::NonUtf8(path.display().to_string()))?
                        .to_string(),
                ),
                Component::CurDir => {}
                _ => return Err(PathError::Traversal(path.display().to_string())),
            }
        }
        Self::new(&parts.join("/"))
    }

    /// Path segments
    #[inline]
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Final segment (file name)
    #[inline]
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.0.last().map_or("", String::as_str)
    }

    /// Parent directory segments (empty for files at the root)
    #[inline]
    #[must_use]
    pub fn parent_segments(&self) -> &[String] {
        &self.0[..self.0.len() - 1]
    }

    /// Whether both paths live in the same directory
    #[inline]
    #[must_use]
    pub fn is_sibling_of(&self, other: &Self) -> bool {
        self.parent_segments() == other.parent_segments()
    }

    /// Whether this path sits under a directory named by `prefix` segments
    #[must_use]
    pub fn starts_with(&self, prefix: &[&str]) -> bool {
        prefix.len() <= self.0.len() && self.0.iter().zip(prefix).all(|(a, b)| a == b)
    }

    /// Resolve under a root directory
    ///
    /// Always stays under `root` because the path has no `..` segments.
    #[must_use]
    pub fn resolve(&self, root: &Path) -> PathBuf {
        let mut out = root.to_path_buf();
        for segment in &self.0 {
            out.push(segment);
        }
        out
    }

    /// `/`-joined form
    #[must_use]
    pub fn as_string(&self) -> String {
        self.0.join("/")
    }
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

impl Display for TargetPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_string())
    }
}

impl FromStr for TargetPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl serde::Serialize for TargetPath {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.as_string())
    }
}

impl<'de> serde::Deserialize<'de> for TargetPath {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        Self::new(&s).map_err(serde::de::Error::custom)
    }
}

/// Errors for target path construction
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    /// Empty path
    #[error("empty path")]
    Empty,

    /// Absolute path
    #[error("absolute path not allowed: {0}")]
    Absolute(String),

    /// `..` component
    #[error("path traversal not allowed: {0}")]
    Traversal(String),

    /// NUL or other forbidden character
    #[error("invalid character in path: {0}")]
    InvalidCharacter(String),

    /// Filesystem path outside the workspace root
    #[error("path outside root: {0}")]
    OutsideRoot(String),

    /// Filesystem path that is not valid UTF-8
    #[error("non-utf8 path: {0}")]
    NonUtf8(String),
}
