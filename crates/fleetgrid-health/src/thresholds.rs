use std::collections::HashMap;
use std::time::Duration;

use fleetgrid_state::Platform;

/// Staleness limits for one platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthThresholds {
    /// ONLINE instances silent this long become UNRESPONSIVE.
    pub missed_after: Duration,
    /// STARTING instances older than this become UNRESPONSIVE.
    pub startup_timeout: Duration,
    /// UNRESPONSIVE instances silent this long are reclaimed.
    pub reclaim_after: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            missed_after: Duration::from_secs(15),
            startup_timeout: Duration::from_secs(180),
            reclaim_after: Duration::from_secs(60),
        }
    }
}

/// Default thresholds plus per-platform overrides.
#[derive(Debug, Clone, Default)]
pub(crate) struct ThresholdTable {
    pub default: HealthThresholds,
    pub platforms: HashMap<Platform, HealthThresholds>,
}

impl ThresholdTable {
    pub fn get(&self, platform: Platform) -> HealthThresholds {
        self.platforms.get(&platform).copied().unwrap_or(self.default)
    }
}
