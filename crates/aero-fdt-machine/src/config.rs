use serde::Deserialize;

use crate::arch::CpuArch;

/// Compatible-name prefixes that are never instantiated, regardless of configuration.
pub const BUILTIN_DEVICE_DENYLIST: &[&str] = &[
    // Keyboard/mouse pair behind one node; needs splitting into two devices first.
    "pl050",
];

pub const DEFAULT_MAX_CPUS: usize = 16;

/// Host-side inputs to a machine build that the device tree cannot supply.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MachineConfig {
    /// CPU model created when the tree has no `/cpus` node.
    pub cpu_type: Option<String>,
    /// Frequency for CPU nodes without `timebase-frequency`.
    ///
    /// `0` means unknown; the build continues with a warning.
    pub default_cpu_freq_hz: u64,
    pub arch: CpuArch,
    /// Additional compatible-name prefixes to refuse, on top of [`BUILTIN_DEVICE_DENYLIST`].
    pub device_blocklist: Vec<String>,
    pub max_cpus: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            cpu_type: None,
            default_cpu_freq_hz: 0,
            arch: CpuArch::None,
            device_blocklist: Vec::new(),
            max_cpus: DEFAULT_MAX_CPUS,
        }
    }
}

impl MachineConfig {
    /// Whether `name` (a manufacturer-stripped compatible string) is refused.
    pub fn is_blocked(&self, name: &str) -> bool {
        BUILTIN_DEVICE_DENYLIST
            .iter()
            .copied()
            .chain(self.device_blocklist.iter().map(String::as_str))
            .any(|prefix| name.starts_with(prefix))
    }
}
