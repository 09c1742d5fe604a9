//! FixGuard Threat Classifier
//!
//! Assigns a [`RiskTier`] and a safety-score adjustment to a patch by
//! matching its introduced lines against a [`ThreatLibrary`].
//!
//! Classification never fails open: any patch that cannot be resolved or
//! read as text is classified [`RiskTier::Critical`] with the maximum score
//! penalty.
//!
//! # Example
//!
//! ```rust,ignore
//! use fixguard_classifier::{ClassifierConfig, ThreatClassifier};
//!
//! let classifier = ThreatClassifier::new(ClassifierConfig::default());
//! let classification = classifier.classify_patch(&patch, workspace_root);
//! if classification.has_critical_match() {
//!     // interactive review is mandatory
//! }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod classifier;
mod pattern;
mod tier;

pub use classifier::{
    Classification, ClassificationError, ClassifierConfig, PatternMatch, ThreatClassifier,
};
pub use pattern::{Matcher, TargetRule, ThreatCategory, ThreatLibrary, ThreatPattern};
pub use tier::RiskTier;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
