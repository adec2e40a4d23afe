//! Task model shared by the poller, disposer and runner.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Kind of remote task. Each kind has its own endpoints, status vocabulary
/// and id namespace on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Download,
    #[serde(rename = "filesystem")]
    FileSystem,
    VirtualDisk,
    Upload,
}

impl TaskKind {
    pub const ALL: [TaskKind; 4] = [
        TaskKind::Download,
        TaskKind::FileSystem,
        TaskKind::VirtualDisk,
        TaskKind::Upload,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Download => "download",
            TaskKind::FileSystem => "filesystem",
            TaskKind::VirtualDisk => "virtual_disk",
            TaskKind::Upload => "upload",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a stored kind string names no known task kind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task kind '{0}'")]
pub struct UnknownTaskKind(pub String);

impl FromStr for TaskKind {
    type Err = UnknownTaskKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| UnknownTaskKind(s.to_string()))
    }
}

/// Reference to one in-flight remote task.
///
/// Ids are only unique within a kind, so the pair is the identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    pub kind: TaskKind,
    pub id: i64,
}

impl TaskHandle {
    pub fn new(kind: TaskKind, id: i64) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} task {}", self.kind, self.id)
    }
}

/// Interval and overall timeout for waiting on one category of operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingSpec {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollingSpec {
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// How a wait on a remote task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalOutcome {
    Success,
    /// Terminal failure status, with the device's error detail.
    Failed(String),
    /// Deadline passed first; carries the last observed status.
    TimedOut(String),
}

/// Hash algorithms the device can compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    #[default]
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
        }
    }
}

impl FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "md5" => Ok(HashAlgorithm::Md5),
            "sha1" => Ok(HashAlgorithm::Sha1),
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha512" => Ok(HashAlgorithm::Sha512),
            other => Err(format!("unsupported hash algorithm '{}'", other)),
        }
    }
}

/// A `"<algorithm>:<hex digest>"` checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    pub algorithm: HashAlgorithm,
    pub digest: String,
}

impl Checksum {
    pub fn new(algorithm: HashAlgorithm, digest: impl Into<String>) -> Self {
        Self {
            algorithm,
            digest: digest.into().to_ascii_lowercase(),
        }
    }

    /// Compares digests as hex, ignoring case. Algorithms must match too.
    pub fn matches(&self, other: &Checksum) -> bool {
        self.algorithm == other.algorithm && self.digest.eq_ignore_ascii_case(&other.digest)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.digest)
    }
}

impl FromStr for Checksum {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algo, digest) = s
            .split_once(':')
            .ok_or_else(|| format!("checksum '{}' must look like '<algorithm>:<hex>'", s))?;
        let algorithm: HashAlgorithm = algo.parse()?;

        if digest.is_empty() || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("checksum digest '{}' is not hex", digest));
        }

        Ok(Checksum::new(algorithm, digest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_str() {
        for kind in TaskKind::ALL {
            assert_eq!(kind.as_str().parse::<TaskKind>().unwrap(), kind);
        }
        assert_eq!(
            "torrent".parse::<TaskKind>(),
            Err(UnknownTaskKind("torrent".to_string()))
        );
    }

    #[test]
    fn kind_serde_names_match_as_str() {
        for kind in TaskKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn checksum_parse_and_display() {
        let c: Checksum = "sha256:DEADbeef".parse().unwrap();
        assert_eq!(c.algorithm, HashAlgorithm::Sha256);
        assert_eq!(c.to_string(), "sha256:deadbeef");
    }

    #[test]
    fn checksum_rejects_missing_prefix_and_bad_hex() {
        assert!("deadbeef".parse::<Checksum>().is_err());
        assert!("crc32:deadbeef".parse::<Checksum>().is_err());
        assert!("sha1:xyz".parse::<Checksum>().is_err());
        assert!("sha1:".parse::<Checksum>().is_err());
    }

    #[test]
    fn checksum_matches_requires_same_algorithm() {
        let a = Checksum::new(HashAlgorithm::Sha256, "cafebabe");
        let b = Checksum::new(HashAlgorithm::Sha256, "CAFEBABE");
        let c = Checksum::new(HashAlgorithm::Md5, "cafebabe");
        assert!(a.matches(&b));
        assert!(!a.matches(&c));
    }
}
