//! Threat pattern library
//!
//! Deterministic substring and regex checks grouped by category. The
//! built-in library is compiled once; callers extend a clone of it with
//! [`ThreatLibrary::with_pattern`].

use crate::tier::RiskTier;
use fixguard_artifact::TargetPath;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What kind of danger a pattern detects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatCategory {
    ShellExecution,
    DynamicEvaluation,
    NetworkAccess,
    PathTraversal,
    CredentialLiteral,
    UnsafeDeserialization,
    DestructiveFilesystem,
    /// Target file itself is sensitive
    SensitiveTarget,
}

impl ThreatCategory {
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ShellExecution => "shell_execution",
            Self::DynamicEvaluation => "dynamic_evaluation",
            Self::NetworkAccess => "network_access",
            Self::PathTraversal => "path_traversal",
            Self::CredentialLiteral => "credential_literal",
            Self::UnsafeDeserialization => "unsafe_deserialization",
            Self::DestructiveFilesystem => "destructive_filesystem",
            Self::SensitiveTarget => "sensitive_target",
        }
    }
}

impl fmt::Display for ThreatCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a pattern recognizes a line
#[derive(Debug, Clone)]
pub enum Matcher {
    Substring(String),
    Regex(Regex),
}

impl Matcher {
    /// Byte offset of the first match in `line`
    #[must_use]
    pub fn find(&self, line: &str) -> Option<usize> {
        match self {
            Self::Substring(needle) => line.find(needle.as_str()),
            Self::Regex(re) => re.find(line).map(|m| m.start()),
        }
    }
}

/// One entry in the library
#[derive(Debug, Clone)]
pub struct ThreatPattern {
    pub id: String,
    pub category: ThreatCategory,
    pub severity: RiskTier,
    /// Subtracted from the safety score when matched
    pub penalty: u8,
    pub description: String,
    matcher: Matcher,
}

impl ThreatPattern {
    /// Pattern matching a literal substring
    #[must_use]
    pub fn substring(
        id: impl Into<String>,
        category: ThreatCategory,
        severity: RiskTier,
        penalty: u8,
        needle: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            category,
            severity,
            penalty,
            description: description.into(),
            matcher: Matcher::Substring(needle.into()),
        }
    }

    /// Pattern matching a regular expression
    ///
    /// # Errors
    /// Returns error if `expr` does not compile
    pub fn regex(
        id: impl Into<String>,
        category: ThreatCategory,
        severity: RiskTier,
        penalty: u8,
        expr: &str,
        description: impl Into<String>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            id: id.into(),
            category,
            severity,
            penalty,
            description: description.into(),
            matcher: Matcher::Regex(Regex::new(expr)?),
        })
    }

    #[inline]
    #[must_use]
    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    /// Byte offset of the first match in `line`
    #[inline]
    #[must_use]
    pub fn find(&self, line: &str) -> Option<usize> {
        self.matcher.find(line)
    }
}

/// Rule over the target path rather than its content
#[derive(Debug, Clone)]
pub struct TargetRule {
    pub id: &'static str,
    pub severity: RiskTier,
    pub penalty: u8,
    pub description: &'static str,
    applies: fn(&TargetPath) -> bool,
}

impl TargetRule {
    #[inline]
    #[must_use]
    pub fn applies_to(&self, target: &TargetPath) -> bool {
        (self.applies)(target)
    }
}

/// Set of content patterns and target rules
#[derive(Debug, Clone, Default)]
pub struct ThreatLibrary {
    patterns: Vec<ThreatPattern>,
    target_rules: Vec<TargetRule>,
    /// Built-in patterns that failed to compile
    broken: Vec<String>,
}

static BUILTIN: Lazy<ThreatLibrary> = Lazy::new(build_builtin);

impl ThreatLibrary {
    /// Library with no patterns
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// The maintained built-in library
    #[must_use]
    pub fn builtin() -> Self {
        BUILTIN.clone()
    }

    /// Add a custom pattern
    #[must_use]
    pub fn with_pattern(mut self, pattern: ThreatPattern) -> Self {
        self.patterns.push(pattern);
        self
    }

    /// Add a pattern in place
    pub fn push(&mut self, pattern: ThreatPattern) {
        self.patterns.push(pattern);
    }

    #[inline]
    #[must_use]
    pub fn patterns(&self) -> &[ThreatPattern] {
        &self.patterns
    }

    #[inline]
    #[must_use]
    pub fn target_rules(&self) -> &[TargetRule] {
        &self.target_rules
    }

    /// Look up a pattern by id
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ThreatPattern> {
        self.patterns.iter().find(|p| p.id == id)
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Ids of built-in patterns missing because they did not compile
    ///
    /// A classifier over a library with gaps fails closed.
    #[inline]
    #[must_use]
    pub fn broken(&self) -> &[String] {
        &self.broken
    }
}

type Spec = (
    &'static str,
    ThreatCategory,
    RiskTier,
    u8,
    &'static str,
    &'static str,
);

// (id, category, severity, penalty, needle, description)
const SUBSTRINGS: &[Spec] = &[
    ("shell.os_system", ThreatCategory::ShellExecution, RiskTier::Critical, 60, "os.system(", "os.system shell invocation"),
    ("shell.os_popen", ThreatCategory::ShellExecution, RiskTier::Critical, 60, "os.popen(", "os.popen shell invocation"),
    ("shell.runtime_exec", ThreatCategory::ShellExecution, RiskTier::Critical, 60, "Runtime.getRuntime().exec(", "JVM runtime exec"),
    ("shell.php_exec", ThreatCategory::ShellExecution, RiskTier::Critical, 60, "shell_exec(", "PHP shell_exec"),
    ("shell.child_process", ThreatCategory::ShellExecution, RiskTier::High, 35, "child_process", "Node child_process module"),
    ("eval.new_function", ThreatCategory::DynamicEvaluation, RiskTier::Critical, 50, "new Function(", "JavaScript Function constructor"),
    ("eval.dunder_import", ThreatCategory::DynamicEvaluation, RiskTier::High, 30, "__import__(", "dynamic module import"),
    ("net.tcp_connect", ThreatCategory::NetworkAccess, RiskTier::High, 30, "TcpStream::connect", "raw TCP connection"),
    ("net.urllib", ThreatCategory::NetworkAccess, RiskTier::High, 30, "urllib.request", "urllib network request"),
    ("net.http_client", ThreatCategory::NetworkAccess, RiskTier::High, 30, "http.client", "http.client network access"),
    ("net.reqwest", ThreatCategory::NetworkAccess, RiskTier::High, 30, "reqwest::", "reqwest HTTP client"),
    ("path.etc_passwd", ThreatCategory::PathTraversal, RiskTier::Critical, 50, "/etc/passwd", "system account file access"),
    ("path.etc_shadow", ThreatCategory::PathTraversal, RiskTier::Critical, 50, "/etc/shadow", "system password file access"),
    ("deser.pickle", ThreatCategory::UnsafeDeserialization, RiskTier::High, 30, "pickle.loads(", "pickle deserialization"),
    ("deser.marshal", ThreatCategory::UnsafeDeserialization, RiskTier::High, 30, "marshal.loads(", "marshal deserialization"),
    ("deser.yaml_load", ThreatCategory::UnsafeDeserialization, RiskTier::High, 25, "yaml.load(", "unsafe YAML loader"),
    ("fs.rmtree", ThreatCategory::DestructiveFilesystem, RiskTier::High, 30, "shutil.rmtree(", "recursive directory removal"),
    ("fs.remove_dir_all", ThreatCategory::DestructiveFilesystem, RiskTier::Medium, 15, "remove_dir_all(", "recursive directory removal"),
];

// (id, category, severity, penalty, regex, description)
const REGEXES: &[Spec] = &[
    ("shell.subprocess_shell", ThreatCategory::ShellExecution, RiskTier::Critical, 60, r"subprocess\.[A-Za-z_]+\(.*shell\s*=\s*True", "subprocess with shell=True"),
    ("shell.command_sh", ThreatCategory::ShellExecution, RiskTier::Critical, 60, r#"Command::new\(\s*"(sh|bash|zsh|cmd|powershell)""#, "spawning a shell interpreter"),
    ("eval.eval", ThreatCategory::DynamicEvaluation, RiskTier::Critical, 50, r"\beval\s*\(", "dynamic code evaluation"),
    ("eval.exec", ThreatCategory::DynamicEvaluation, RiskTier::High, 40, r"(^|[^.\w])exec\s*\(", "dynamic code execution"),
    ("net.socket", ThreatCategory::NetworkAccess, RiskTier::High, 30, r"\bsocket\.(socket|create_connection)\b", "raw socket"),
    ("net.requests", ThreatCategory::NetworkAccess, RiskTier::High, 30, r"\brequests\.(get|post|put|delete|patch|head|request)\s*\(", "requests HTTP call"),
    ("net.fetch_url", ThreatCategory::NetworkAccess, RiskTier::High, 30, r#"\bfetch\s*\(\s*['"`]https?://"#, "fetch to a remote URL"),
    ("net.curl_wget", ThreatCategory::NetworkAccess, RiskTier::High, 30, r"\b(curl|wget)\s+\S", "command-line download"),
    ("path.deep_traversal", ThreatCategory::PathTraversal, RiskTier::High, 35, r"(\.\./){2,}|(\.\.\\){2,}", "multi-level parent traversal"),
    ("path.parent_traversal", ThreatCategory::PathTraversal, RiskTier::Medium, 10, r"\.\.[/\\]", "parent directory reference"),
    ("cred.assignment", ThreatCategory::CredentialLiteral, RiskTier::Critical, 50, r#"(?i)\b(password|passwd|secret|api[_-]?key|access[_-]?token|auth[_-]?token)\b["']?\s*[:=]\s*["'][^"'\s]{6,}["']"#, "credential-looking literal"),
    ("cred.aws_key", ThreatCategory::CredentialLiteral, RiskTier::Critical, 50, r"\bAKIA[0-9A-Z]{16}\b", "AWS access key id"),
    ("cred.private_key", ThreatCategory::CredentialLiteral, RiskTier::Critical, 50, r"-----BEGIN ([A-Z]+ )?PRIVATE KEY-----", "embedded private key"),
    ("cred.github_token", ThreatCategory::CredentialLiteral, RiskTier::Critical, 50, r"\bgh[pousr]_[A-Za-z0-9]{36}\b", "GitHub token"),
    ("fs.rm_rf", ThreatCategory::DestructiveFilesystem, RiskTier::Critical, 50, r"\brm\s+-[a-zA-Z]*(rf|fr)[a-zA-Z]*\b", "recursive forced delete"),
];

fn is_git_internal(target: &TargetPath) -> bool {
    target.starts_with(&[".git"])
}

fn is_ssh_material(target: &TargetPath) -> bool {
    target.segments().iter().any(|s| s == ".ssh")
}

fn is_env_file(target: &TargetPath) -> bool {
    target.file_name() == ".env" || target.file_name().starts_with(".env.")
}

fn is_ci_workflow(target: &TargetPath) -> bool {
    target.starts_with(&[".github", "workflows"])
        || target.file_name() == ".gitlab-ci.yml"
        || target.starts_with(&[".circleci"])
}

fn build_builtin() -> ThreatLibrary {
    let mut library = compile(SUBSTRINGS, REGEXES);
    library.target_rules = vec![
        TargetRule {
            id: "target.git_internal",
            severity: RiskTier::High,
            penalty: 40,
            description: "writes into the .git directory",
            applies: is_git_internal,
        },
        TargetRule {
            id: "target.ssh",
            severity: RiskTier::High,
            penalty: 40,
            description: "writes SSH material",
            applies: is_ssh_material,
        },
        TargetRule {
            id: "target.env_file",
            severity: RiskTier::High,
            penalty: 30,
            description: "writes an environment file",
            applies: is_env_file,
        },
        TargetRule {
            id: "target.ci_workflow",
            severity: RiskTier::High,
            penalty: 30,
            description: "writes a CI workflow definition",
            applies: is_ci_workflow,
        },
    ];
    library
}

fn compile(substrings: &[Spec], regexes: &[Spec]) -> ThreatLibrary {
    let mut library = ThreatLibrary::empty();
    for &(id, category, severity, penalty, needle, description) in substrings {
        library.push(ThreatPattern::substring(
            id,
            category,
            severity,
            penalty,
            needle,
            description,
        ));
    }
    for &(id, category, severity, penalty, expr, description) in regexes {
        match ThreatPattern::regex(id, category, severity, penalty, expr, description) {
            Ok(p) => library.push(p),
            Err(e) => {
                tracing::error!(pattern = id, error = %e, "built-in pattern failed to compile");
                library.broken.push(id.to_string());
            }
        }
    }
    library
}
