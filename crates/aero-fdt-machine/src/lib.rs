//! Builds a wired virtual machine topology from a device tree.
//!
//! [`build_machine`] walks a [`DeviceTree`](aero_fdt::DeviceTree) and drives a
//! [`MachineBackend`]: CPUs and RAM first, then one device per recognised node, then the clock,
//! interrupt and GPIO nets between them. [`ModelMachine`] is an in-memory backend that records
//! the result.

#![forbid(unsafe_code)]

mod arch;
mod backend;
mod bus;
pub mod cells;
mod classify;
mod clock;
mod config;
mod error;
mod gpio;
mod instantiate;
mod intc;
mod machine;
mod model;
mod registry;

pub use arch::{CpuArch, ParseCpuArchError};
pub use backend::{
    BackendError, BusId, BusKind, ClockId, CpuId, DeviceId, IrqSink, LinkTarget, MachineBackend,
};
pub use classify::{classify, classify_and_instantiate, peripheral_bus};
pub use clock::{build_clock_tree, ClockRecord, ClockScale, ClockTree};
pub use config::{MachineConfig, BUILTIN_DEVICE_DENYLIST, DEFAULT_MAX_CPUS};
pub use error::BuildError;
pub use gpio::connect_gpios;
pub use instantiate::{create_from_compatible, realize_and_map, strip_manufacturer};
pub use intc::{
    build_interrupt_tree, effective_interrupt_parent, interrupt_cells, interrupt_lines,
    MAX_CONTROLLER_LINES,
};
pub use machine::{
    build_machine, build_machine_from_blob, scan_devices, BuildContext, BuiltMachine,
    MachineSummary, NodeSummary, RamRegion,
};
pub use model::{
    BusState, ClockInput, ClockState, CpuState, DeviceCatalog, DeviceModel, DeviceState,
    LineConnection, MmioMapping, ModelMachine, Region, PLACEHOLDER_TYPE,
};
pub use registry::{DeviceRecord, NodeKind, Registry};
