//! Extraction of activity timestamps from the cluster-autoscaler status document.
//!
//! Two document shapes are understood:
//!
//! - **Structured**: a YAML document with a `clusterWide` mapping whose
//!   `health`, `scaleUp` and `scaleDown` entries carry an RFC 3339
//!   `lastProbeTime`.
//! - **Legacy**: the human-readable report older autoscalers write, where
//!   `LastProbeTime: 2022-09-11 11:21:27.046154458 +0000 UTC m=+25121.07`
//!   appears once per activity. Labels are assigned by position only.

use std::fmt;

use chrono::{DateTime, FixedOffset};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The activities reported by the autoscaler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Activity {
    /// Overall cluster-wide health probe.
    Main,
    /// Scale-up loop.
    ScaleUp,
    /// Scale-down loop.
    ScaleDown,
}

impl Activity {
    /// All activities, in legacy document order.
    pub const ALL: [Activity; 3] = [Activity::Main, Activity::ScaleUp, Activity::ScaleDown];

    /// Label value used in exported metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::ScaleUp => "scaleUp",
            Self::ScaleDown => "scaleDown",
        }
    }
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three last-probe timestamps of one status document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityTimestamps {
    pub main: DateTime<FixedOffset>,
    pub scale_up: DateTime<FixedOffset>,
    pub scale_down: DateTime<FixedOffset>,
}

impl ActivityTimestamps {
    /// Timestamp for a single activity.
    pub fn get(&self, activity: Activity) -> DateTime<FixedOffset> {
        match activity {
            Activity::Main => self.main,
            Activity::ScaleUp => self.scale_up,
            Activity::ScaleDown => self.scale_down,
        }
    }

    /// Iterate `(activity, unix seconds)` pairs.
    pub fn unix_seconds(&self) -> impl Iterator<Item = (Activity, i64)> + '_ {
        Activity::ALL
            .into_iter()
            .map(|activity| (activity, self.get(activity).timestamp()))
    }
}

/// Errors produced while extracting timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    /// The document is malformed or holds fewer than three timestamps.
    #[error("failed to parse status document: {0}")]
    Parse(String),

    /// A timestamp was found but does not match its layout.
    #[error("invalid {activity} timestamp {value:?}: {reason}")]
    TimestampFormat {
        activity: Activity,
        value: String,
        reason: String,
    },
}

/// How the status document is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractMode {
    /// Structured when the document has a `clusterWide` mapping, legacy otherwise.
    #[default]
    Auto,
    /// YAML document only.
    Structured,
    /// Free-text `LastProbeTime:` lines only.
    Legacy,
}

/// Layout of a legacy timestamp once the zone abbreviation is split off.
const LEGACY_LAYOUT: &str = "%Y-%m-%d %H:%M:%S%.f %z";

// Every label matches, whatever follows it, so a malformed value keeps its
// position instead of letting later entries shift up.
static LEGACY_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"LastProbeTime:[ \t]*([^\r\n]*)").unwrap());

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusDocument {
    cluster_wide: Option<ClusterWide>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClusterWide {
    health: Option<ProbeCondition>,
    scale_up: Option<ProbeCondition>,
    scale_down: Option<ProbeCondition>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProbeCondition {
    last_probe_time: Option<String>,
}

/// Turns a status document into [`ActivityTimestamps`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusExtractor {
    mode: ExtractMode,
}

impl StatusExtractor {
    /// Create an extractor for the given mode.
    pub fn new(mode: ExtractMode) -> Self {
        Self { mode }
    }

    /// The configured mode.
    pub fn mode(&self) -> ExtractMode {
        self.mode
    }

    /// Extract all three timestamps, failing if any is missing or malformed.
    pub fn extract(&self, document: &str) -> Result<ActivityTimestamps, ExtractError> {
        match self.mode {
            ExtractMode::Structured => extract_structured(document),
            ExtractMode::Legacy => extract_legacy(document),
            ExtractMode::Auto => {
                if is_structured(document) {
                    extract_structured(document)
                } else {
                    extract_legacy(document)
                }
            }
        }
    }
}

fn is_structured(document: &str) -> bool {
    serde_yaml::from_str::<serde_yaml::Value>(document)
        .map(|value| value.get("clusterWide").is_some())
        .unwrap_or(false)
}

/// Extract timestamps from the YAML status document.
pub fn extract_structured(document: &str) -> Result<ActivityTimestamps, ExtractError> {
    let parsed: StatusDocument =
        serde_yaml::from_str(document).map_err(|e| ExtractError::Parse(e.to_string()))?;

    let cluster_wide = parsed
        .cluster_wide
        .ok_or_else(|| ExtractError::Parse("missing clusterWide section".to_string()))?;

    let probe_time = |condition: Option<ProbeCondition>,
                      activity: Activity,
                      field: &str|
     -> Result<DateTime<FixedOffset>, ExtractError> {
        let raw = condition
            .and_then(|c| c.last_probe_time)
            .ok_or_else(|| {
                ExtractError::Parse(format!("missing clusterWide.{}.lastProbeTime", field))
            })?;
        parse_rfc3339(activity, &raw)
    };

    Ok(ActivityTimestamps {
        main: probe_time(cluster_wide.health, Activity::Main, "health")?,
        scale_up: probe_time(cluster_wide.scale_up, Activity::ScaleUp, "scaleUp")?,
        scale_down: probe_time(cluster_wide.scale_down, Activity::ScaleDown, "scaleDown")?,
    })
}

/// Extract timestamps from the free-text status report.
///
/// The first three `LastProbeTime:` occurrences are mapped to main, scale-up
/// and scale-down in that order. Later occurrences (node groups) are ignored.
pub fn extract_legacy(document: &str) -> Result<ActivityTimestamps, ExtractError> {
    let found: Vec<&str> = LEGACY_REGEX
        .captures_iter(document)
        .filter_map(|caps| caps.get(1).map(|m| strip_monotonic_reading(m.as_str())))
        .take(3)
        .collect();

    if found.len() < 3 {
        return Err(ExtractError::Parse(format!(
            "expected 3 LastProbeTime entries, found {}",
            found.len()
        )));
    }

    Ok(ActivityTimestamps {
        main: parse_legacy_timestamp(Activity::Main, found[0])?,
        scale_up: parse_legacy_timestamp(Activity::ScaleUp, found[1])?,
        scale_down: parse_legacy_timestamp(Activity::ScaleDown, found[2])?,
    })
}

/// Cut the Go monotonic clock suffix (`m=+25121.07`) off a probe time.
fn strip_monotonic_reading(value: &str) -> &str {
    let end = value
        .match_indices("m=")
        .map(|(idx, _)| idx)
        .find(|&idx| idx == 0 || value[..idx].ends_with(char::is_whitespace))
        .unwrap_or(value.len());

    value[..end].trim()
}

fn parse_rfc3339(activity: Activity, value: &str) -> Result<DateTime<FixedOffset>, ExtractError> {
    DateTime::parse_from_rfc3339(value).map_err(|e| ExtractError::TimestampFormat {
        activity,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// Parse `YYYY-MM-DD HH:MM:SS[.fffffffff] ±ZZZZ ZONE`.
///
/// The zone abbreviation must be present but the numeric offset decides the
/// instant.
pub fn parse_legacy_timestamp(
    activity: Activity,
    value: &str,
) -> Result<DateTime<FixedOffset>, ExtractError> {
    let format_error = |reason: String| ExtractError::TimestampFormat {
        activity,
        value: value.to_string(),
        reason,
    };

    let tokens: Vec<&str> = value.split_whitespace().collect();
    let [date, time, offset, zone] = tokens.as_slice() else {
        return Err(format_error(format!(
            "expected 4 fields, found {}",
            tokens.len()
        )));
    };

    if zone.is_empty() || !zone.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(format_error(format!("invalid zone abbreviation {:?}", zone)));
    }

    DateTime::parse_from_str(&format!("{} {} {}", date, time, offset), LEGACY_LAYOUT)
        .map_err(|e| format_error(e.to_string()))
}
