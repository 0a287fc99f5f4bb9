use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;

use aero_fdt::NodeId;
use serde::Serialize;

use crate::backend::{DeviceId, IrqSink};

/// What the classifier decided a node is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
    /// Clock provider; only reserved here, its clock is created by the clock resolver.
    ClockSource,
    PciBus,
    GenericBus,
    I2cBus,
    SpiBus,
    GpioController,
    InterruptController,
    LeafDevice,
    /// Unimplemented device reserving the node's address range.
    Placeholder,
    /// Scanned, nothing built.
    None,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NodeKind::ClockSource => "clock-source",
            NodeKind::PciBus => "pci-bus",
            NodeKind::GenericBus => "generic-bus",
            NodeKind::I2cBus => "i2c-bus",
            NodeKind::SpiBus => "spi-bus",
            NodeKind::GpioController => "gpio-controller",
            NodeKind::InterruptController => "interrupt-controller",
            NodeKind::LeafDevice => "leaf-device",
            NodeKind::Placeholder => "placeholder",
            NodeKind::None => "none",
        })
    }
}

/// Outcome of classifying one node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeviceRecord {
    /// `None` when the node was scanned but produced no device.
    pub device: Option<DeviceId>,
    pub kind: NodeKind,
    /// Input lines allocated on an interrupt controller, indexed by line number.
    pub irq_sinks: Vec<IrqSink>,
    /// GPIO inputs of this device driven by a controller, in reference-row order. Rows that
    /// could not be wired are left out.
    pub gpio_sinks: Vec<IrqSink>,
}

impl DeviceRecord {
    pub fn new(kind: NodeKind, device: Option<DeviceId>) -> Self {
        Self {
            device,
            kind,
            irq_sinks: Vec::new(),
            gpio_sinks: Vec::new(),
        }
    }

    pub fn empty(kind: NodeKind) -> Self {
        Self::new(kind, None)
    }
}

/// Node to device mapping for one build.
///
/// A node gets exactly one record, the first time it is classified. Later inserts for the same
/// node are ignored so a node is never constructed twice, even if construction failed.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    records: HashMap<NodeId, DeviceRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.records.contains_key(&node)
    }

    pub fn get(&self, node: NodeId) -> Option<&DeviceRecord> {
        self.records.get(&node)
    }

    pub(crate) fn get_mut(&mut self, node: NodeId) -> Option<&mut DeviceRecord> {
        self.records.get_mut(&node)
    }

    /// The instantiated device for `node`, if any.
    pub fn device(&self, node: NodeId) -> Option<DeviceId> {
        self.get(node).and_then(|record| record.device)
    }

    /// Records `record` for `node` unless one exists; returns whichever record is stored.
    pub fn insert(&mut self, node: NodeId, record: DeviceRecord) -> &DeviceRecord {
        match self.records.entry(node) {
            Entry::Occupied(existing) => existing.into_mut(),
            Entry::Vacant(slot) => slot.insert(record),
        }
    }

    /// Records in document order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &DeviceRecord)> {
        let mut records: Vec<_> = self.records.iter().map(|(&id, r)| (id, r)).collect();
        records.sort_by_key(|&(id, _)| id);
        records.into_iter()
    }
}
