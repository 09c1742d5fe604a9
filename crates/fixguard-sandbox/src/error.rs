//! Sandbox errors
//!
//! These are infrastructure failures (the sandbox could not be built or a
//! command could not be started). Prohibited behavior observed inside a run
//! is reported as a [`crate::SandboxViolation`] in the result instead.

use fixguard_artifact::TargetPath;
use std::io;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("failed to create sandbox directory: {0}")]
    Setup(#[source] io::Error),

    #[error("failed to copy {path} into the sandbox: {source}")]
    Materialize {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write patched {target} into the sandbox: {source}")]
    WritePatched {
        target: TargetPath,
        #[source]
        source: io::Error,
    },

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to fingerprint {path}: {source}")]
    Fingerprint {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("network tripwire unavailable: {0}")]
    Tripwire(#[source] io::Error),

    #[error("sandbox confinement failed: {0}")]
    Confinement(String),
}
