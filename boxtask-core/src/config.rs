//! Polling configuration.
//!
//! One [`PollingSpec`] per operation category. Defaults can be overridden
//! from a JSON document:
//!
//! ```json
//! { "create": { "timeout": "1h" }, "move": { "interval": "500ms" } }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::task::{PollingSpec, TaskKind};

/// How upload tasks are judged complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadCompletion {
    /// Only the `done` status counts.
    #[default]
    Strict,
    /// `uploaded == size` also counts, even if the status still lags.
    SizeMatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingConfig {
    /// Download-based creation.
    pub create: PollingSpec,
    pub upload: PollingSpec,
    pub delete: PollingSpec,
    pub move_: PollingSpec,
    pub checksum_compute: PollingSpec,
    /// Virtual disk create and resize.
    pub disk: PollingSpec,
    pub upload_completion: UploadCompletion,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            create: PollingSpec::new(Duration::from_secs(3), Duration::from_secs(30 * 60)),
            upload: PollingSpec::new(Duration::from_secs(1), Duration::from_secs(30 * 60)),
            delete: PollingSpec::new(Duration::from_secs(1), Duration::from_secs(5 * 60)),
            move_: PollingSpec::new(Duration::from_secs(1), Duration::from_secs(5 * 60)),
            checksum_compute: PollingSpec::new(
                Duration::from_secs(1),
                Duration::from_secs(10 * 60),
            ),
            disk: PollingSpec::new(Duration::from_secs(1), Duration::from_secs(10 * 60)),
            upload_completion: UploadCompletion::Strict,
        }
    }
}

impl PollingConfig {
    /// Spec used to resume a recorded task of `kind`.
    ///
    /// Filesystem tasks back several categories and the handle does not say
    /// which, so the most patient of them is used.
    pub fn for_kind(&self, kind: TaskKind) -> PollingSpec {
        match kind {
            TaskKind::Download => self.create,
            TaskKind::Upload => self.upload,
            TaskKind::VirtualDisk => self.disk,
            TaskKind::FileSystem => {
                let specs = [self.delete, self.move_, self.checksum_compute];
                PollingSpec {
                    interval: specs.iter().map(|s| s.interval).min().unwrap_or_default(),
                    timeout: specs.iter().map(|s| s.timeout).max().unwrap_or_default(),
                }
            }
        }
    }

    /// Apply overrides from a JSON document on top of the defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let overrides: PollingOverrides = serde_json::from_str(json)?;
        Self::default().merge(&overrides)
    }

    pub async fn from_file(path: &Path) -> Result<Self> {
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::Config(format!("reading {}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }

    pub fn merge(mut self, overrides: &PollingOverrides) -> Result<Self> {
        let slots = [
            ("create", &mut self.create, &overrides.create),
            ("upload", &mut self.upload, &overrides.upload),
            ("delete", &mut self.delete, &overrides.delete),
            ("move", &mut self.move_, &overrides.move_),
            (
                "checksum_compute",
                &mut self.checksum_compute,
                &overrides.checksum_compute,
            ),
            ("disk", &mut self.disk, &overrides.disk),
        ];

        for (name, spec, over) in slots {
            let Some(over) = over else { continue };
            if let Some(interval) = &over.interval {
                spec.interval = parse_duration(interval)
                    .map_err(|e| Error::Config(format!("{}.interval: {}", name, e)))?;
            }
            if let Some(timeout) = &over.timeout {
                spec.timeout = parse_duration(timeout)
                    .map_err(|e| Error::Config(format!("{}.timeout: {}", name, e)))?;
            }
            if spec.interval.is_zero() || spec.timeout.is_zero() {
                return Err(Error::Config(format!(
                    "{}: interval and timeout must be positive",
                    name
                )));
            }
        }

        if let Some(mode) = overrides.upload_completion {
            self.upload_completion = mode;
        }

        Ok(self)
    }

    /// Categories in display order, for listing.
    pub fn categories(&self) -> [(&'static str, PollingSpec); 6] {
        [
            ("create", self.create),
            ("upload", self.upload),
            ("delete", self.delete),
            ("move", self.move_),
            ("checksum_compute", self.checksum_compute),
            ("disk", self.disk),
        ]
    }
}

/// Partial configuration as written by users.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PollingOverrides {
    pub create: Option<SpecOverride>,
    pub upload: Option<SpecOverride>,
    pub delete: Option<SpecOverride>,
    #[serde(rename = "move")]
    pub move_: Option<SpecOverride>,
    pub checksum_compute: Option<SpecOverride>,
    pub disk: Option<SpecOverride>,
    pub upload_completion: Option<UploadCompletion>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpecOverride {
    pub interval: Option<String>,
    pub timeout: Option<String>,
}

/// Parse durations such as `"500ms"`, `"3s"`, `"5m"`, `"1h30m"`.
pub fn parse_duration(input: &str) -> std::result::Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return Err(format!("invalid duration '{}'", input));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|_| format!("invalid duration '{}'", input))?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let too_large = || format!("duration '{}' is too large", input);
        let part = match unit {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.checked_mul(60).ok_or_else(too_large)?),
            "h" => Duration::from_secs(value.checked_mul(3600).ok_or_else(too_large)?),
            "" => return Err(format!("missing unit in duration '{}'", input)),
            other => return Err(format!("unknown unit '{}' in duration '{}'", other, input)),
        };
        total = total.checked_add(part).ok_or_else(too_large)?;
    }

    Ok(total)
}

/// Inverse of [`parse_duration`] for display.
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms % 1000 != 0 {
        return format!("{}ms", ms);
    }
    let secs = d.as_secs();
    if secs != 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs != 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}
