//! FixGuard Artifact System
//!
//! Content-addressed patches and workspace-safe paths.
//!
//! # Core Concepts
//!
//! - [`ContentHash`]: 32-byte BLAKE3 hash for file contents and checksums
//! - [`TargetPath`]: normalized relative path that cannot escape the workspace
//! - [`PatchSet`]: ordered per-file patches (full replacement or unified diff)
//! - [`ResolvedPatch`]: the exact bytes a patch set produces against a base
//!
//! # Example
//!
//! ```rust,ignore
//! use fixguard_artifact::{FilePatch, PatchSet, TargetPath};
//!
//! let target = TargetPath::new("src/lib.rs")?;
//! let patch = PatchSet::single(FilePatch::replace(target, "pub fn fixed() {}\n"));
//!
//! // The approval is bound to this checksum
//! println!("digest: {}", patch.digest());
//!
//! // Every later stage works with the resolved bytes
//! let resolved = patch.resolve_from(workspace_root)?;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod diff;
mod hash;
mod patch;
mod path;

pub use diff::{apply_unified_diff, diff_stats, DiffError};
pub use hash::{ContentHash, DigestBuilder, HashError};
pub use patch::{
    read_optional, FilePatch, PatchContent, PatchError, PatchSet, ResolvedFile, ResolvedPatch,
};
pub use path::{PathError, TargetPath};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod integration_tests {
    use super::*;
    use std::fs;

    #[test]
    fn resolve_from_workspace_reads_bases() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        fs::create_dir_all(dir.join("src")).unwrap();
        fs::write(dir.join("src/lib.rs"), "fn a() {}\n").unwrap();

        let set = PatchSet::new(vec![
            FilePatch::diff(
                TargetPath::new("src/lib.rs").unwrap(),
                "@@ -1 +1 @@\n-fn a() {}\n+fn a() { }\n",
            ),
            FilePatch::replace(TargetPath::new("src/new.rs").unwrap(), "fn b() {}\n"),
        ])
        .unwrap();

        let resolved = set.resolve_from(dir).unwrap();
        assert_eq!(resolved.files().len(), 2);
        assert_eq!(resolved.files()[0].after_text(), Some("fn a() { }\n"));
        assert!(resolved.files()[1].before.is_none());
    }
}
