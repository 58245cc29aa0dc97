//! Tunables for rendering and budget accounting

use serde::{Deserialize, Serialize};

/// Global render timeout per version, in milliseconds
pub const DEFAULT_RENDER_TIMEOUT_MS: u64 = 5_000;

/// Daily computation allotment, in milliseconds
pub const DEFAULT_DAILY_ALLOTMENT_MS: i64 = 60_000;

/// Engine versions the render service supports, oldest first
pub const DEFAULT_AVAILABLE_VERSIONS: [&str; 4] = ["0.12.0", "0.13.0", "0.13.1", "0.14.0"];

/// How a batch derives the timeout of each single render
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Every version gets the full global timeout
    #[default]
    FixedPerVersion,
    /// The global timeout is divided evenly across the batch
    SplitAcrossBatch,
}

impl TimeoutPolicy {
    /// Timeout for each version of a batch of `batch_len` versions
    pub fn per_version(&self, global_ms: u64, batch_len: usize) -> u64 {
        match self {
            TimeoutPolicy::FixedPerVersion => global_ms,
            TimeoutPolicy::SplitAcrossBatch => global_ms / batch_len.max(1) as u64,
        }
    }
}

impl std::str::FromStr for TimeoutPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" | "fixed_per_version" => Ok(TimeoutPolicy::FixedPerVersion),
            "split" | "split_across_batch" => Ok(TimeoutPolicy::SplitAcrossBatch),
            other => Err(format!("unknown timeout policy '{}'", other)),
        }
    }
}

/// Render and budget settings shared by the orchestration components
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderSettings {
    pub render_timeout_ms: u64,
    pub timeout_policy: TimeoutPolicy,
    pub daily_allotment_ms: i64,
    /// Offset of the reference timezone whose midnight bounds a budget day
    pub reset_offset_hours: i8,
    /// Supported engine versions, oldest first
    pub available_versions: Vec<String>,
}

impl RenderSettings {
    /// Newest supported version, rendered when a request names none
    pub fn latest_version(&self) -> Option<&str> {
        crate::version::highest(self.available_versions.iter().map(String::as_str))
    }

    /// The configured spelling of `version`, if it is supported
    pub fn canonical_version(&self, version: &str) -> Option<&str> {
        self.available_versions
            .iter()
            .find(|v| crate::version::same(v, version))
            .map(String::as_str)
    }
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            render_timeout_ms: DEFAULT_RENDER_TIMEOUT_MS,
            timeout_policy: TimeoutPolicy::default(),
            daily_allotment_ms: DEFAULT_DAILY_ALLOTMENT_MS,
            reset_offset_hours: 0,
            available_versions: DEFAULT_AVAILABLE_VERSIONS
                .iter()
                .map(|v| v.to_string())
                .collect(),
        }
    }
}
