//! Capabilities the topology builder consumes from the emulator it is building for.
//!
//! The builder never owns device objects. It asks a [`MachineBackend`] to construct them from
//! catalog type names, and refers to the results through the opaque handles defined here.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

handle!(
    /// A CPU created by [`MachineBackend::create_cpu`].
    CpuId,
    "cpu"
);
handle!(
    /// A device created by the backend's catalog or as a placeholder.
    DeviceId,
    "dev"
);
handle!(
    /// A child bus exposed by a bus controller device.
    BusId,
    "bus"
);
handle!(
    /// A clock object owned by the build's [`ClockTree`](crate::ClockTree).
    ClockId,
    "clk"
);

/// Peripheral bus flavours a controller can expose to its children.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    I2c,
    Spi,
}

impl fmt::Display for BusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BusKind::I2c => "i2c",
            BusKind::Spi => "spi",
        })
    }
}

/// An input line that an interrupt or GPIO output can drive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum IrqSink {
    Cpu { cpu: CpuId, line: u32 },
    Device { device: DeviceId, line: u32 },
}

impl fmt::Display for IrqSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrqSink::Cpu { cpu, line } => write!(f, "{cpu}.in[{line}]"),
            IrqSink::Device { device, line } => write!(f, "{device}.in[{line}]"),
        }
    }
}

/// Objects a device link property may point at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkTarget {
    SystemMemory,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),

    #[error("unknown cpu {0}")]
    UnknownCpu(CpuId),

    #[error("unknown bus {0}")]
    UnknownBus(BusId),

    #[error("unknown clock {0}")]
    UnknownClock(ClockId),

    #[error("clock {0} already exists")]
    ClockExists(ClockId),

    #[error("{device} is already realized")]
    AlreadyRealized { device: DeviceId },

    #[error("{device} must be realized first")]
    NotRealized { device: DeviceId },

    #[error("{device} has no MMIO region {index}")]
    NoMmioRegion { device: DeviceId, index: usize },

    #[error("{what} line {line} does not exist on {device}")]
    NoSuchLine {
        device: DeviceId,
        line: u32,
        what: &'static str,
    },

    #[error("region {base:#x}+{size:#x} is empty or wraps the address space")]
    InvalidRegion { base: u64, size: u64 },

    #[error("region {base:#x}+{size:#x} overlaps {existing}")]
    Overlap {
        base: u64,
        size: u64,
        existing: String,
    },

    #[error("{0}")]
    Other(String),
}

/// Device catalog plus CPU, RAM and wiring primitives.
///
/// Construction is fallible without being an error: `try_create_device` and
/// `create_placeholder` return `None` when the catalog cannot provide the device, and the builder
/// degrades that node to "no device". Everything returning `Result` reports a misuse or an
/// impossible request that the builder treats as fatal or skips, depending on the phase.
pub trait MachineBackend {
    fn create_cpu(&mut self, model: &str, freq_hz: u64) -> Option<CpuId>;

    /// Input line `line` of `cpu`.
    fn cpu_irq_in(&self, cpu: CpuId, line: u32) -> IrqSink {
        IrqSink::Cpu { cpu, line }
    }

    fn map_ram(&mut self, base: u64, size: u64) -> Result<(), BackendError>;

    fn try_create_device(&mut self, type_name: &str) -> Option<DeviceId>;

    /// Creates an inert device reserving `base..base + size`, already realized and mapped.
    fn create_placeholder(&mut self, name: &str, base: u64, size: u64) -> Option<DeviceId>;

    fn set_link_property(
        &mut self,
        device: DeviceId,
        name: &str,
        target: LinkTarget,
    ) -> Result<(), BackendError>;

    fn set_uint_property(
        &mut self,
        device: DeviceId,
        name: &str,
        value: u64,
    ) -> Result<(), BackendError>;

    fn realize(&mut self, device: DeviceId) -> Result<(), BackendError>;

    /// Places MMIO region `index` of `device` at `base`; `size` is the extent the document
    /// declares for it.
    fn mmio_map(
        &mut self,
        device: DeviceId,
        index: usize,
        base: u64,
        size: u64,
    ) -> Result<(), BackendError>;

    fn child_bus(&self, device: DeviceId, kind: BusKind) -> Option<BusId>;

    /// Realizes `device` as a peripheral on `bus`.
    fn realize_on_bus(&mut self, device: DeviceId, bus: BusId) -> Result<(), BackendError>;

    /// Input line `line` of `device`, usable as the target of an output connection.
    fn gpio_in(&self, device: DeviceId, line: u32) -> Result<IrqSink, BackendError>;

    /// Connects interrupt output `index` of `device` to `sink`.
    fn connect_irq(
        &mut self,
        device: DeviceId,
        index: u32,
        sink: IrqSink,
    ) -> Result<(), BackendError>;

    fn connect_gpio_out(
        &mut self,
        device: DeviceId,
        line: u32,
        sink: IrqSink,
    ) -> Result<(), BackendError>;

    /// Creates the clock object behind `clock`, initially running at `hz`.
    fn create_clock(&mut self, clock: ClockId, name: &str, hz: u64) -> Result<(), BackendError>;

    /// Makes `clock` a derived clock of `source`.
    fn set_clock_source(&mut self, clock: ClockId, source: ClockId) -> Result<(), BackendError>;

    /// Source-changed notification: `clock` now runs at `hz`.
    ///
    /// Sent for every rate change the [`ClockTree`](crate::ClockTree) computes, including the
    /// recomputation of clocks downstream of the one that changed.
    fn set_clock_hz(&mut self, clock: ClockId, hz: u64) -> Result<(), BackendError>;

    fn connect_clock_in(
        &mut self,
        device: DeviceId,
        name: &str,
        clock: ClockId,
    ) -> Result<(), BackendError>;
}
