//! FixGuard Sandbox
//!
//! Validates a resolved patch in a disposable copy of the minimal file tree
//! it needs, running the configured validation commands under monitoring.
//!
//! # Confinement and monitoring
//!
//! - Confinement: on Linux each command runs in bubblewrap namespaces with a
//!   read-only host, a private `/tmp` and no network beyond loopback (see
//!   [`Confinement`])
//! - Outbound network: connections the namespace refused, plus proxy
//!   variables pointing at a loopback [`Tripwire`]
//! - Process spawn: only allowlisted executables are started
//! - Writes outside the root: scratch files left in the private `/tmp`,
//!   copied workspace files that changed, and symlinks leaving the sandbox
//! - Limits: per-command and total wall-clock, output and tree size
//!
//! Any observation fails the run. The sandbox directory is deleted after
//! every run.

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod command;
mod confine;
mod error;
mod limits;
mod materialize;
mod monitor;
mod result;
mod runner;
mod validator;

pub use command::{CommandOutput, CommandRequest, CommandRunner, ValidationCommand};
pub use confine::{Confinement, ConfinementReport};
pub use error::SandboxError;
pub use limits::ResourceLimits;
pub use materialize::CopyPlan;
pub use monitor::{escaping_symlinks, WorkspaceFingerprint};
pub use result::{CommandRecord, LimitKind, ResourceUsage, SandboxResult, SandboxViolation};
pub use runner::{ProcessRunner, Tripwire};
pub use validator::{SandboxPolicy, SandboxValidator};

/// Re-exported so callers share one cancellation type
pub use tokio_util::sync::CancellationToken;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
