//! VPU configuration.

use serde::{Deserialize, Serialize};

/// Default cap on cycles per [`crate::Vpu::run_slice`] call.
pub const DEFAULT_SLICE: u32 = 1_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpuConfig {
    /// Record per-target timings.
    #[serde(default = "default_true")]
    pub collect_statistics: bool,
    /// Cycles a slice may run before handing control back.
    #[serde(default = "default_slice")]
    pub max_cycles_per_slice: u32,
}

fn default_true() -> bool {
    true
}

fn default_slice() -> u32 {
    DEFAULT_SLICE
}

impl Default for VpuConfig {
    fn default() -> Self {
        Self {
            collect_statistics: true,
            max_cycles_per_slice: DEFAULT_SLICE,
        }
    }
}

impl VpuConfig {
    /// Read `BPEL_VPU_STATS` and `BPEL_VPU_SLICE`, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let collect_statistics = lookup("BPEL_VPU_STATS")
            .map(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "0" | "false" | "off"))
            .unwrap_or(defaults.collect_statistics);
        let max_cycles_per_slice = lookup("BPEL_VPU_SLICE")
            .and_then(|v| v.trim().parse::<u32>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(defaults.max_cycles_per_slice);
        Self {
            collect_statistics,
            max_cycles_per_slice,
        }
    }
}
