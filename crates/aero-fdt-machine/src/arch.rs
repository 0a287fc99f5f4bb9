//! Per-architecture CPU interrupt inputs used to wire the root interrupt controller.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::backend::{CpuId, IrqSink, MachineBackend};

/// PowerPC 40x external interrupt input (`PPC40x_INPUT_INT`).
const PPC40X_INPUT_INT: u32 = 4;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CpuArch {
    /// IRQ and FIQ. The virtual inputs are not routed from the device tree.
    Arm,
    /// The eight CP0 interrupt lines.
    Mips,
    /// PowerPC 40x.
    Ppc,
    Microblaze,
    /// No CPU interrupt inputs; the root controller is left unconnected.
    #[default]
    None,
}

impl CpuArch {
    /// Input lines of one CPU in the order the root controller's outputs drive them.
    pub fn cpu_irq_lines(self) -> &'static [u32] {
        match self {
            CpuArch::Arm => &[0, 1],
            CpuArch::Mips => &[0, 1, 2, 3, 4, 5, 6, 7],
            CpuArch::Ppc => &[PPC40X_INPUT_INT],
            CpuArch::Microblaze => &[0],
            CpuArch::None => &[],
        }
    }

    pub fn cpu_irq_sinks(self, backend: &dyn MachineBackend, cpu: CpuId) -> Vec<IrqSink> {
        self.cpu_irq_lines()
            .iter()
            .map(|&line| backend.cpu_irq_in(cpu, line))
            .collect()
    }
}

impl fmt::Display for CpuArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CpuArch::Arm => "arm",
            CpuArch::Mips => "mips",
            CpuArch::Ppc => "ppc",
            CpuArch::Microblaze => "microblaze",
            CpuArch::None => "none",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown CPU architecture {0:?} (expected arm, mips, ppc, microblaze or none)")]
pub struct ParseCpuArchError(String);

impl FromStr for CpuArch {
    type Err = ParseCpuArchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "arm" | "aarch32" => Ok(CpuArch::Arm),
            "mips" => Ok(CpuArch::Mips),
            "ppc" | "powerpc" => Ok(CpuArch::Ppc),
            "microblaze" => Ok(CpuArch::Microblaze),
            "none" => Ok(CpuArch::None),
            _ => Err(ParseCpuArchError(s.to_string())),
        }
    }
}
