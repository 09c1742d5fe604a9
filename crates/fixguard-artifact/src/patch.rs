//! Patch sets and their resolution to exact bytes
//!
//! A [`PatchSet`] is what a proposal carries: one [`FilePatch`] per target
//! file. Before anything is classified, sandboxed or written, a patch set is
//! resolved against the current base content into a [`ResolvedPatch`], the
//! exact bytes every later stage works with.

use crate::diff::{self, DiffError};
use crate::hash::{ContentHash, DigestBuilder};
use crate::path::TargetPath;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;

/// Content change for one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PatchContent {
    /// Replace the whole file with `text`
    Replace { text: String },

    /// Apply a single-file unified diff to the current content
    UnifiedDiff { diff: String },
}

impl PatchContent {
    /// Stable tag used in digests
    #[inline]
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Replace { .. } => "replace",
            Self::UnifiedDiff { .. } => "unified_diff",
        }
    }

    /// Raw text carried by the patch
    #[inline]
    #[must_use]
    pub fn text(&self) -> &str {
        match self {
            Self::Replace { text } => text,
            Self::UnifiedDiff { diff } => diff,
        }
    }

    /// Whether the patch carries no content at all
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text().trim().is_empty()
    }
}

/// Patch for a single target file
///
/// # Invariants
/// - `base_hash`, when present, must match the file being patched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePatch {
    /// File being changed
    pub target: TargetPath,

    /// The change
    pub content: PatchContent,

    /// Expected hash of the current content (optimistic concurrency);
    /// `None` means "whatever is there", or a new file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_hash: Option<ContentHash>,
}

impl FilePatch {
    /// Full-replacement patch
    #[must_use]
    pub fn replace(target: TargetPath, text: impl Into<String>) -> Self {
        Self {
            target,
            content: PatchContent::Replace { text: text.into() },
            base_hash: None,
        }
    }

    /// Unified diff patch
    #[must_use]
    pub fn diff(target: TargetPath, diff: impl Into<String>) -> Self {
        Self {
            target,
            content: PatchContent::UnifiedDiff { diff: diff.into() },
            base_hash: None,
        }
    }

    /// Pin the expected base content
    #[must_use]
    pub fn with_base_hash(mut self, hash: ContentHash) -> Self {
        self.base_hash = Some(hash);
        self
    }

    /// Resolve against the current content of the target
    ///
    /// `base` is `None` when the file does not exist yet.
    ///
    /// # Errors
    /// Returns error on empty content, base mismatch, non-UTF-8 base for a
    /// diff, or a diff that does not apply
    pub fn resolve(&self, base: Option<&[u8]>) -> Result<ResolvedFile, PatchError> {
        if self.content.is_empty() {
            return Err(PatchError::EmptyContent(self.target.clone()));
        }

        let before_hash = base.map(ContentHash::compute);
        if let Some(expected) = self.base_hash {
            if before_hash != Some(expected) {
                return Err(PatchError::BaseMismatch {
                    target: self.target.clone(),
                    expected,
                    actual: before_hash,
                });
            }
        }

        let after = match &self.content {
            PatchContent::Replace { text } => text.as_bytes().to_vec(),
            PatchContent::UnifiedDiff { diff } => {
                let base_text = match base {
                    Some(bytes) => std::str::from_utf8(bytes)
                        .map_err(|_| PatchError::BinaryBase(self.target.clone()))?,
                    None => "",
                };
                diff::apply_unified_diff(base_text, diff)
                    .map_err(|source| PatchError::Diff {
                        target: self.target.clone(),
                        source,
                    })?
                    .into_bytes()
            }
        };

        Ok(ResolvedFile {
            target: self.target.clone(),
            before: base.map(<[u8]>::to_vec),
            before_hash,
            after,
        })
    }
}

/// Ordered set of file patches, at most one per target
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<FilePatch>", into = "Vec<FilePatch>")]
pub struct PatchSet {
    files: IndexMap<TargetPath, FilePatch>,
}

impl PatchSet {
    /// Build from patches, rejecting duplicate targets
    ///
    /// # Errors
    /// Returns error if two patches name the same target
    pub fn new(patches: impl IntoIterator<Item = FilePatch>) -> Result<Self, PatchError> {
        let mut files = IndexMap::new();
        for patch in patches {
            if files.contains_key(&patch.target) {
                return Err(PatchError::DuplicateTarget(patch.target));
            }
            files.insert(patch.target.clone(), patch);
        }
        Ok(Self { files })
    }

    /// Single-file patch set
    #[must_use]
    pub fn single(patch: FilePatch) -> Self {
        let mut files = IndexMap::new();
        files.insert(patch.target.clone(), patch);
        Self { files }
    }

    /// Patches in order
    pub fn iter(&self) -> impl Iterator<Item = &FilePatch> {
        self.files.values()
    }

    /// Targets in order
    pub fn targets(&self) -> impl Iterator<Item = &TargetPath> {
        self.files.keys()
    }

    /// Number of files
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether the set has no patches
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Patch for a target
    #[must_use]
    pub fn get(&self, target: &TargetPath) -> Option<&FilePatch> {
        self.files.get(target)
    }

    /// Checksum over the ordered patch contents
    ///
    /// This is the value an approval is bound to.
    #[must_use]
    pub fn digest(&self) -> ContentHash {
        let mut builder = DigestBuilder::new("patch-set");
        for patch in self.files.values() {
            builder
                .field(patch.target.as_string().as_bytes())
                .field(patch.content.kind().as_bytes())
                .field(patch.content.text().as_bytes())
                .optional_hash(patch.base_hash.as_ref());
        }
        builder.finish()
    }

    /// Resolve every patch with a base lookup
    ///
    /// # Errors
    /// Returns the first resolution error, or [`PatchError::Empty`] for an
    /// empty set
    pub fn resolve_with<F>(&self, mut base: F) -> Result<ResolvedPatch, PatchError>
    where
        F: FnMut(&TargetPath) -> io::Result<Option<Vec<u8>>>,
    {
        if self.files.is_empty() {
            return Err(PatchError::Empty);
        }
        let mut files = Vec::with_capacity(self.files.len());
        for patch in self.files.values() {
            let current = base(&patch.target).map_err(|source| PatchError::Io {
                target: patch.target.clone(),
                source,
            })?;
            files.push(patch.resolve(current.as_deref())?);
        }
        Ok(ResolvedPatch { files })
    }

    /// Resolve every patch against files under `root`
    ///
    /// # Errors
    /// See [`PatchSet::resolve_with`]
    pub fn resolve_from(&self, root: &Path) -> Result<ResolvedPatch, PatchError> {
        self.resolve_with(|target| read_optional(&target.resolve(root)))
    }
}

impl TryFrom<Vec<FilePatch>> for PatchSet {
    type Error = PatchError;

    fn try_from(value: Vec<FilePatch>) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PatchSet> for Vec<FilePatch> {
    fn from(value: PatchSet) -> Self {
        value.files.into_values().collect()
    }
}

/// Read a file, mapping "not found" to `None`
///
/// # Errors
/// Returns any I/O error other than not-found
pub fn read_optional(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Exact before/after bytes for one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFile {
    /// File being changed
    pub target: TargetPath,
    /// Content at resolution time (`None` if the file did not exist)
    pub before: Option<Vec<u8>>,
    /// Hash of `before`
    pub before_hash: Option<ContentHash>,
    /// Content to be written
    pub after: Vec<u8>,
}

impl ResolvedFile {
    /// `after` as text, if it is UTF-8
    #[must_use]
    pub fn after_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.after).ok()
    }

    /// `before` as text (empty for new files), if it is UTF-8
    #[must_use]
    pub fn before_text(&self) -> Option<&str> {
        match &self.before {
            Some(bytes) => std::str::from_utf8(bytes).ok(),
            None => Some(""),
        }
    }
}

/// A patch set resolved to exact bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPatch {
    files: Vec<ResolvedFile>,
}

impl ResolvedPatch {
    /// Wrap already-resolved files
    #[must_use]
    pub fn from_files(files: Vec<ResolvedFile>) -> Self {
        Self { files }
    }

    /// Files in patch order
    #[inline]
    #[must_use]
    pub fn files(&self) -> &[ResolvedFile] {
        &self.files
    }

    /// Targets in patch order
    pub fn targets(&self) -> impl Iterator<Item = &TargetPath> {
        self.files.iter().map(|f| &f.target)
    }

    /// Checksum over the bytes about to be written and the bases they replace
    #[must_use]
    pub fn digest(&self) -> ContentHash {
        let mut builder = DigestBuilder::new("resolved-bytes");
        for file in &self.files {
            builder
                .field(file.target.as_string().as_bytes())
                .optional_hash(file.before_hash.as_ref())
                .field(ContentHash::compute(&file.after).as_bytes());
        }
        builder.finish()
    }
}

/// Errors from building or resolving patches
#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    /// Patch set has no files
    #[error("patch set is empty")]
    Empty,

    /// A file patch carries no content
    #[error("patch for {0} is empty")]
    EmptyContent(TargetPath),

    /// Two patches for the same target
    #[error("duplicate patch target: {0}")]
    DuplicateTarget(TargetPath),

    /// Current content differs from the pinned base
    #[error("base mismatch for {target}: expected {expected}, found {}", .actual.map_or_else(|| "<missing>".to_string(), |h| h.to_string()))]
    BaseMismatch {
        target: TargetPath,
        expected: ContentHash,
        actual: Option<ContentHash>,
    },

    /// Diff against a base that is not text
    #[error("cannot apply a diff to binary content in {0}")]
    BinaryBase(TargetPath),

    /// Diff did not parse or apply
    #[error("diff for {target} failed: {source}")]
    Diff {
        target: TargetPath,
        #[source]
        source: DiffError,
    },

    /// Reading the base failed
    #[error("reading {target} failed: {source}")]
    Io {
        target: TargetPath,
        #[source]
        source: io::Error,
    },
}
