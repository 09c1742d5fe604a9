//! OS-level confinement of validation commands
//!
//! On Linux every command runs under bubblewrap with fresh user, network,
//! PID, IPC and mount namespaces:
//!
//! - the host filesystem is mounted read-only
//! - only the request's writable directories are bound read-write
//! - `/tmp` is a private tmpfs
//! - the network namespace has nothing but loopback
//!
//! The command runs under a small `sh` wrapper. Once it exits the wrapper
//! kills whatever it left behind, then writes a report into a directory
//! owned by the runner. The report holds the namespace's IP/TCP/UDP
//! counters and a listing of the scratch tmpfs. Connections the namespace
//! refused and scratch files written outside the writable directories
//! become violations.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// `$1` is the report directory, the rest is the command's argv
const WRAPPER: &str = r#"report=$1
shift
"$@"
status=$?
kill -9 -1 2>/dev/null
rm -rf "$report/net" "$report/net6" "$report/scratch" "$report/done"
cat /proc/net/snmp > "$report/net"
cat /proc/net/snmp6 > "$report/net6" 2>/dev/null
find /tmp /dev/shm -mindepth 1 -xdev > "$report/scratch" 2>/dev/null
: > "$report/done"
exit $status
"#;

/// How commands are isolated from the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Confinement {
    /// bubblewrap namespaces (Linux)
    Bubblewrap { program: PathBuf },
    /// Plain subprocess; only the proxy tripwire and workspace fingerprints
    /// observe the command
    Unconfined,
}

impl Default for Confinement {
    fn default() -> Self {
        if cfg!(target_os = "linux") {
            Self::Bubblewrap {
                program: PathBuf::from("bwrap"),
            }
        } else {
            Self::Unconfined
        }
    }
}

impl Confinement {
    #[must_use]
    pub fn is_confined(&self) -> bool {
        matches!(self, Self::Bubblewrap { .. })
    }

    /// Build the process for `program args..` in `cwd`
    ///
    /// `report` is required for [`Confinement::Bubblewrap`] and is bound
    /// writable next to `writable`.
    pub(crate) fn command(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
        writable: &[PathBuf],
        report: Option<&Path>,
    ) -> Command {
        match (self, report) {
            (Self::Bubblewrap { program: bwrap }, Some(report)) => {
                let mut cmd = Command::new(bwrap);
                cmd.args(["--ro-bind", "/", "/"])
                    .args(["--dev", "/dev"])
                    .args(["--proc", "/proc"])
                    .args(["--tmpfs", "/tmp"]);
                for dir in writable.iter().map(PathBuf::as_path).chain([report]) {
                    cmd.arg("--bind").arg(dir).arg(dir);
                }
                cmd.args(["--unshare-all", "--die-with-parent", "--new-session"])
                    .arg("--chdir")
                    .arg(cwd)
                    .args(["--", "/bin/sh", "-c", WRAPPER, "fixguard-confine"])
                    .arg(report)
                    .arg(program)
                    .args(args);
                cmd
            }
            _ => {
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
        }
    }
}

/// What the wrapper observed inside the namespaces
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfinementReport {
    /// Connections and datagrams the namespace refused or could not route
    pub blocked_network: u64,
    /// Scratch paths created outside the writable directories
    pub escaped_writes: Vec<String>,
}

impl ConfinementReport {
    /// Read the report the wrapper left in `dir`
    ///
    /// `None` when the wrapper did not finish (killed, or bubblewrap never
    /// started the command).
    #[must_use]
    pub fn read(dir: &Path, writable: &[PathBuf]) -> Option<Self> {
        if !dir.join("done").exists() {
            return None;
        }
        let net = fs::read_to_string(dir.join("net")).unwrap_or_default();
        let net6 = fs::read_to_string(dir.join("net6")).unwrap_or_default();
        let scratch = fs::read_to_string(dir.join("scratch")).unwrap_or_default();

        let mut bound: Vec<&Path> = writable.iter().map(PathBuf::as_path).collect();
        bound.push(dir);
        Some(Self {
            blocked_network: blocked_attempts(&net, &net6),
            escaped_writes: scratch
                .lines()
                .filter(|line| !line.is_empty())
                .filter(|line| !is_mount_path(Path::new(line), &bound))
                .map(str::to_string)
                .collect(),
        })
    }
}

/// Mount points and the directories bubblewrap created to hold them
fn is_mount_path(entry: &Path, bound: &[&Path]) -> bool {
    bound.iter().any(|b| b.starts_with(entry))
}

/// Failed opens, refused datagrams and unroutable packets
///
/// A fresh namespace starts with every counter at zero.
pub(crate) fn blocked_attempts(snmp: &str, snmp6: &str) -> u64 {
    let v4 = counter(snmp, "Ip", "OutNoRoutes")
        + counter(snmp, "Tcp", "AttemptFails")
        + counter(snmp, "Udp", "NoPorts");
    let v6: u64 = snmp6
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some("Ip6OutNoRoutes" | "Udp6NoPorts"), Some(value)) => value.parse::<u64>().ok(),
                _ => None,
            }
        })
        .sum();
    v4 + v6
}

/// One field of a `/proc/net/snmp` table (header line, then value line)
fn counter(snmp: &str, table: &str, field: &str) -> u64 {
    let prefix = format!("{table}:");
    let mut rows = snmp.lines().filter(|line| line.starts_with(&prefix));
    let (Some(header), Some(values)) = (rows.next(), rows.next()) else {
        return 0;
    };
    header
        .split_whitespace()
        .zip(values.split_whitespace())
        .find(|(name, _)| *name == field)
        .and_then(|(_, value)| value.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SNMP: &str = "\
Ip: Forwarding DefaultTTL InReceives OutRequests OutNoRoutes
Ip: 1 64 4 4 2
Icmp: InMsgs OutMsgs
Icmp: 0 0
Tcp: RtoAlgorithm ActiveOpens PassiveOpens AttemptFails EstabResets
Tcp: 1 3 0 1 0
Udp: InDatagrams NoPorts InErrors OutDatagrams
Udp: 0 1 0 1
";

    #[test]
    fn counts_refused_and_unroutable_traffic() {
        assert_eq!(counter(SNMP, "Tcp", "ActiveOpens"), 3);
        assert_eq!(counter(SNMP, "Udp", "Missing"), 0);
        let snmp6 = "Ip6InReceives 0\nIp6OutNoRoutes 1\nUdp6NoPorts 0\n";
        assert_eq!(blocked_attempts(SNMP, snmp6), 2 + 1 + 1 + 1);
    }

    #[test]
    fn quiet_namespace_reports_nothing() {
        let quiet = SNMP
            .replace("Ip: 1 64 4 4 2", "Ip: 1 64 4 4 0")
            .replace("Tcp: 1 3 0 1 0", "Tcp: 1 3 3 0 0")
            .replace("Udp: 0 1 0 1", "Udp: 0 0 0 1");
        assert_eq!(blocked_attempts(&quiet, ""), 0);
    }

    #[test]
    fn report_ignores_mount_points() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = PathBuf::from("/tmp/fixguard-sandbox-x");
        let report = dir.path();
        fs::write(report.join("net"), SNMP).unwrap();
        fs::write(
            report.join("scratch"),
            format!(
                "/tmp/fixguard-sandbox-x\n{}\n/tmp/_escape\n",
                report.display()
            ),
        )
        .unwrap();
        assert!(ConfinementReport::read(report, &[sandbox.clone()]).is_none());

        fs::write(report.join("done"), "").unwrap();
        let parsed = ConfinementReport::read(report, &[sandbox]).unwrap();
        assert_eq!(parsed.escaped_writes, vec!["/tmp/_escape".to_string()]);
        assert_eq!(parsed.blocked_network, 4);
    }

    #[test]
    fn bubblewrap_binds_only_writable_dirs() {
        let confinement = Confinement::Bubblewrap {
            program: PathBuf::from("bwrap"),
        };
        let cmd = confinement.command(
            "pytest",
            &["-q".to_string()],
            Path::new("/s/work"),
            &[PathBuf::from("/s")],
            Some(Path::new("/r")),
        );
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        let joined = args.join(" ");
        assert!(joined.starts_with(
            "--ro-bind / / --dev /dev --proc /proc --tmpfs /tmp --bind /s /s --bind /r /r --unshare-all"
        ));
        assert!(!args.iter().any(|a| a == "--share-net"));
        assert!(joined.ends_with("fixguard-confine /r pytest -q"));
    }
}
