//! Patch classification
//!
//! Only *introduced* lines are scanned: lines of the new content that do
//! not appear in the old content (as a multiset, ignoring surrounding
//! whitespace). Pre-existing code therefore never taints a fix, and a
//! re-indented line is not treated as new.

use crate::pattern::{ThreatCategory, ThreatLibrary};
use crate::tier::RiskTier;
use fixguard_artifact::{DiffError, PatchError, PatchSet, ResolvedFile, ResolvedPatch, TargetPath};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, warn};

/// Longest excerpt kept for a match
const EXCERPT_CHARS: usize = 120;

/// Classifier tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Introduced-line count up to which a clean change is LOW
    pub small_change_lines: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            small_change_lines: 20,
        }
    }
}

/// A pattern or target rule that fired
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternMatch {
    pub pattern_id: String,
    pub category: ThreatCategory,
    pub severity: RiskTier,
    pub penalty: u8,
    pub target: TargetPath,
    /// 1-based line in the new content; `None` for target rules
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    #[serde(default)]
    pub excerpt: String,
}

/// Result of classifying a patch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub risk_tier: RiskTier,
    /// Non-positive adjustment to the safety score
    pub safety_score_delta: i16,
    pub matches: Vec<PatternMatch>,
    pub introduced_lines: usize,
    pub removed_lines: usize,
    /// Set when the patch could not be classified
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl Classification {
    /// CRITICAL classification for a patch that could not be analysed
    #[must_use]
    pub fn fail_closed(error: &ClassificationError) -> Self {
        Self {
            risk_tier: RiskTier::Critical,
            safety_score_delta: -100,
            matches: Vec::new(),
            introduced_lines: 0,
            removed_lines: 0,
            failure: Some(error.to_string()),
        }
    }

    /// Whether any matched pattern is CRITICAL
    #[must_use]
    pub fn has_critical_match(&self) -> bool {
        self.matches.iter().any(|m| m.severity == RiskTier::Critical)
    }

    #[inline]
    #[must_use]
    pub fn is_fail_closed(&self) -> bool {
        self.failure.is_some()
    }

    /// Distinct ids of matched patterns, in match order
    #[must_use]
    pub fn matched_ids(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.matches
            .iter()
            .map(|m| m.pattern_id.as_str())
            .filter(|id| seen.insert(*id))
            .collect()
    }

    /// Apply the delta to a 0-100 score
    #[must_use]
    pub fn apply_to_score(&self, score: u8) -> u8 {
        let adjusted = i16::from(score.min(100)) + self.safety_score_delta;
        u8::try_from(adjusted.clamp(0, 100)).unwrap_or(0)
    }
}

/// Why a patch could not be classified
#[derive(Debug, thiserror::Error)]
pub enum ClassificationError {
    #[error("patch is empty")]
    EmptyPatch,

    #[error("patch changes nothing")]
    NoEffect,

    #[error("malformed diff for {target}: {source}")]
    MalformedDiff {
        target: TargetPath,
        #[source]
        source: DiffError,
    },

    #[error("diff for {target} does not match its base: {source}")]
    HunkMismatch {
        target: TargetPath,
        #[source]
        source: DiffError,
    },

    #[error("binary content in {0}")]
    BinaryContent(TargetPath),

    #[error("base of {0} changed since the patch was computed")]
    StaleBase(TargetPath),

    #[error("duplicate target {0}")]
    DuplicateTarget(TargetPath),

    #[error("threat library incomplete, failed to compile: {}", .0.join(", "))]
    IncompleteLibrary(Vec<String>),

    #[error("reading {target} failed: {source}")]
    Io {
        target: TargetPath,
        #[source]
        source: std::io::Error,
    },
}

impl From<PatchError> for ClassificationError {
    fn from(err: PatchError) -> Self {
        match err {
            PatchError::Empty | PatchError::EmptyContent(_) => Self::EmptyPatch,
            PatchError::DuplicateTarget(t) => Self::DuplicateTarget(t),
            PatchError::BaseMismatch { target, .. } => Self::StaleBase(target),
            PatchError::BinaryBase(t) => Self::BinaryContent(t),
            PatchError::Diff { target, source } => match source {
                DiffError::ContextMismatch { .. } | DiffError::OutOfRange { .. } => {
                    Self::HunkMismatch { target, source }
                }
                other => Self::MalformedDiff {
                    target,
                    source: other,
                },
            },
            PatchError::Io { target, source } => Self::Io { target, source },
        }
    }
}

/// Introduced lines and removed-line count for one file
struct LineDelta<'a> {
    introduced: Vec<(usize, &'a str)>,
    removed: usize,
}

impl<'a> LineDelta<'a> {
    fn between(before: &str, after: &'a str) -> Self {
        let mut pool: HashMap<&str, usize> = HashMap::new();
        for line in before.lines() {
            *pool.entry(line.trim()).or_default() += 1;
        }
        let mut introduced = Vec::new();
        for (idx, line) in after.lines().enumerate() {
            match pool.get_mut(line.trim()) {
                Some(n) if *n > 0 => *n -= 1,
                _ => introduced.push((idx + 1, line)),
            }
        }
        Self {
            introduced,
            removed: pool.values().sum(),
        }
    }
}

/// Whether a change only moves whitespace around
///
/// A whitespace run still counts where it separates two word characters,
/// so `import os` never equals `importos`. Layout-sensitive files must also
/// keep their line breaks and block nesting, and Makefiles their exact
/// indentation.
fn is_cosmetic(target: &TargetPath, before: &str, after: &str) -> bool {
    match Layout::of(target) {
        Layout::Free => squeeze(before) == squeeze(after),
        Layout::Nested => matches!((nesting(before), nesting(after)), (Some(a), Some(b)) if a == b),
        Layout::Exact => indented(before) == indented(after),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    Free,
    /// Indentation opens blocks (Python, YAML)
    Nested,
    /// Leading tabs are syntax (make)
    Exact,
}

impl Layout {
    fn of(target: &TargetPath) -> Self {
        let name = target.file_name();
        match name.rsplit_once('.').map(|(_, ext)| ext) {
            Some("py" | "pyi" | "yaml" | "yml") => Self::Nested,
            Some("mk") => Self::Exact,
            _ if matches!(name, "Makefile" | "makefile" | "GNUmakefile") => Self::Exact,
            _ => Self::Free,
        }
    }
}

/// Whitespace runs dropped, except one space between word characters
fn squeeze(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut gap = false;
    for c in text.chars() {
        if c.is_whitespace() {
            gap = true;
            continue;
        }
        if gap && is_word(c) && out.chars().next_back().is_some_and(is_word) {
            out.push(' ');
        }
        gap = false;
        out.push(c);
    }
    out
}

fn is_word(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Non-blank lines as `(block depth, squeezed content)`
///
/// `None` when a line dedents to a width no enclosing block opened.
fn nesting(text: &str) -> Option<Vec<(usize, String)>> {
    let mut widths = vec![0];
    let mut lines = Vec::new();
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let content = line.trim_start();
        let width: usize = line[..line.len() - content.len()]
            .chars()
            .map(|c| if c == '\t' { 8 } else { 1 })
            .sum();
        let mut dedented = false;
        while widths.len() > 1 && widths.last().is_some_and(|&top| width < top) {
            widths.pop();
            dedented = true;
        }
        match widths.last() {
            Some(&top) if top == width => {}
            Some(&top) if top < width && !dedented => widths.push(width),
            _ => return None,
        }
        lines.push((widths.len() - 1, squeeze(content)));
    }
    Some(lines)
}

/// Non-blank lines as `(indentation, squeezed content)`
fn indented(text: &str) -> Vec<(&str, String)> {
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let content = line.trim_start();
            (&line[..line.len() - content.len()], squeeze(content))
        })
        .collect()
}

fn excerpt(line: &str) -> String {
    line.trim().chars().take(EXCERPT_CHARS).collect()
}

/// Deterministic threat classifier
#[derive(Debug, Clone)]
pub struct ThreatClassifier {
    library: ThreatLibrary,
    config: ClassifierConfig,
}

impl Default for ThreatClassifier {
    fn default() -> Self {
        Self::new(ClassifierConfig::default())
    }
}

impl ThreatClassifier {
    /// Classifier over the built-in library
    #[must_use]
    pub fn new(config: ClassifierConfig) -> Self {
        Self {
            library: ThreatLibrary::builtin(),
            config,
        }
    }

    /// Replace the pattern library
    #[must_use]
    pub fn with_library(mut self, library: ThreatLibrary) -> Self {
        self.library = library;
        self
    }

    #[inline]
    #[must_use]
    pub fn library(&self) -> &ThreatLibrary {
        &self.library
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Classify resolved bytes, failing closed to CRITICAL
    #[must_use]
    pub fn classify(&self, resolved: &ResolvedPatch) -> Classification {
        self.try_classify(resolved)
            .unwrap_or_else(|e| Self::failed(&e))
    }

    /// Resolve `patch` against `root` and classify, failing closed
    #[must_use]
    pub fn classify_patch(&self, patch: &PatchSet, root: &Path) -> Classification {
        patch
            .resolve_from(root)
            .map_err(ClassificationError::from)
            .and_then(|resolved| self.try_classify(&resolved))
            .unwrap_or_else(|e| Self::failed(&e))
    }

    fn failed(error: &ClassificationError) -> Classification {
        warn!(error = %error, "classification failed, assigning CRITICAL");
        Classification::fail_closed(error)
    }

    /// Classify resolved bytes
    ///
    /// # Errors
    /// Returns error for an empty or no-op patch, non-UTF-8 content, or a
    /// library with patterns that failed to compile
    pub fn try_classify(
        &self,
        resolved: &ResolvedPatch,
    ) -> Result<Classification, ClassificationError> {
        if !self.library.broken().is_empty() {
            return Err(ClassificationError::IncompleteLibrary(self.library.broken().to_vec()));
        }
        if resolved.files().is_empty() {
            return Err(ClassificationError::EmptyPatch);
        }

        let mut matches = Vec::new();
        let mut introduced_lines = 0;
        let mut removed_lines = 0;
        let mut cosmetic = true;
        let mut changed = false;

        for file in resolved.files() {
            let before = file
                .before_text()
                .ok_or_else(|| ClassificationError::BinaryContent(file.target.clone()))?;
            let after = file
                .after_text()
                .ok_or_else(|| ClassificationError::BinaryContent(file.target.clone()))?;

            changed |= file.before.as_deref() != Some(file.after.as_slice());
            cosmetic &= is_cosmetic(&file.target, before, after);

            let delta = LineDelta::between(before, after);
            introduced_lines += delta.introduced.len();
            removed_lines += delta.removed;

            self.scan_file(file, &delta, &mut matches);
        }

        if !changed {
            return Err(ClassificationError::NoEffect);
        }

        let baseline = if cosmetic {
            RiskTier::Cosmetic
        } else if introduced_lines <= self.config.small_change_lines {
            RiskTier::Low
        } else {
            RiskTier::Medium
        };
        let risk_tier = matches
            .iter()
            .fold(baseline, |tier, m: &PatternMatch| tier.raise(m.severity));

        // Each pattern costs its penalty once, however often it fires
        let mut charged = HashSet::new();
        let penalty: u32 = matches
            .iter()
            .filter(|m| charged.insert(m.pattern_id.as_str()))
            .map(|m| u32::from(m.penalty))
            .sum();
        let safety_score_delta = -i16::try_from(penalty.min(100)).unwrap_or(100);

        debug!(
            risk_tier = %risk_tier,
            safety_score_delta,
            matches = matches.len(),
            introduced_lines,
            "patch classified"
        );

        Ok(Classification {
            risk_tier,
            safety_score_delta,
            matches,
            introduced_lines,
            removed_lines,
            failure: None,
        })
    }

    fn scan_file(&self, file: &ResolvedFile, delta: &LineDelta<'_>, out: &mut Vec<PatternMatch>) {
        for rule in self.library.target_rules() {
            if rule.applies_to(&file.target) {
                debug!(rule = rule.id, target = %file.target, "sensitive target");
                out.push(PatternMatch {
                    pattern_id: rule.id.to_string(),
                    category: ThreatCategory::SensitiveTarget,
                    severity: rule.severity,
                    penalty: rule.penalty,
                    target: file.target.clone(),
                    line: None,
                    excerpt: rule.description.to_string(),
                });
            }
        }

        for pattern in self.library.patterns() {
            let hit = delta
                .introduced
                .iter()
                .find(|(_, line)| pattern.find(line).is_some());
            if let Some(&(line_no, line)) = hit {
                debug!(
                    pattern = %pattern.id,
                    target = %file.target,
                    line = line_no,
                    "threat pattern matched"
                );
                out.push(PatternMatch {
                    pattern_id: pattern.id.clone(),
                    category: pattern.category,
                    severity: pattern.severity,
                    penalty: pattern.penalty,
                    target: file.target.clone(),
                    line: Some(line_no),
                    excerpt: excerpt(line),
                });
            }
        }
    }
}
