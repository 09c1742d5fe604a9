//! Risk tiers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse danger classification of a patch
///
/// Ordered: `Cosmetic < Low < Medium < High < Critical`. Once assigned to a
/// proposal a tier only ever moves up (see [`RiskTier::raise`]).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskTier {
    /// Whitespace/formatting only
    Cosmetic,
    /// Small behavioral change, no risky constructs
    Low,
    /// Larger change or mildly risky constructs
    Medium,
    /// Risky constructs (network, deserialization, sensitive files)
    High,
    /// Dangerous constructs or unclassifiable patch
    #[default]
    Critical,
}

impl RiskTier {
    /// All tiers in ascending order
    pub const ALL: [RiskTier; 5] = [
        RiskTier::Cosmetic,
        RiskTier::Low,
        RiskTier::Medium,
        RiskTier::High,
        RiskTier::Critical,
    ];

    /// Monotonic merge: the higher of the two tiers
    #[inline]
    #[must_use]
    pub fn raise(self, other: RiskTier) -> RiskTier {
        self.max(other)
    }

    /// Stable upper-case label
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskTier::Cosmetic => "COSMETIC",
            RiskTier::Low => "LOW",
            RiskTier::Medium => "MEDIUM",
            RiskTier::High => "HIGH",
            RiskTier::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
