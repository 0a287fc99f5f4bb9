//! Node classification: an ordered rule table deciding what each node becomes.

use aero_fdt::{DeviceTree, NodeId};
use tracing::debug;

use crate::backend::{BusKind, DeviceId};
use crate::bus;
use crate::error::BuildError;
use crate::instantiate;
use crate::machine::BuildContext;
use crate::registry::{DeviceRecord, NodeKind};

type Predicate = fn(&DeviceTree, NodeId) -> bool;
type Constructor = fn(&mut BuildContext<'_>, NodeId) -> Result<DeviceRecord, BuildError>;

struct Rule {
    kind: NodeKind,
    applies: Predicate,
    construct: Constructor,
}

/// First matching rule wins. The leaf rule always applies; its constructor falls back to a
/// placeholder and then to no device.
const RULES: &[Rule] = &[
    Rule {
        kind: NodeKind::ClockSource,
        applies: |tree, node| tree.has_property(node, "#clock-cells"),
        construct: instantiate::build_clock_provider,
    },
    Rule {
        kind: NodeKind::PciBus,
        applies: |tree, node| device_type_is(tree, node, "pci"),
        construct: bus::build_pci_bus,
    },
    Rule {
        kind: NodeKind::GenericBus,
        applies: |tree, node| device_type_is(tree, node, "soc"),
        construct: bus::build_generic_bus,
    },
    Rule {
        kind: NodeKind::GenericBus,
        applies: |tree, node| tree.has_children(node) && tree.has_property(node, "ranges"),
        construct: bus::build_generic_bus,
    },
    Rule {
        kind: NodeKind::I2cBus,
        applies: |tree, node| peripheral_bus(tree, node) == Some(BusKind::I2c),
        construct: bus::build_i2c_bus,
    },
    Rule {
        kind: NodeKind::SpiBus,
        applies: |tree, node| peripheral_bus(tree, node) == Some(BusKind::Spi),
        construct: bus::build_spi_bus,
    },
    Rule {
        kind: NodeKind::GpioController,
        applies: |tree, node| tree.has_property(node, "gpio-controller"),
        construct: instantiate::build_gpio_controller,
    },
    Rule {
        kind: NodeKind::InterruptController,
        applies: |tree, node| tree.has_property(node, "interrupt-controller"),
        construct: instantiate::build_interrupt_controller,
    },
    Rule {
        kind: NodeKind::LeafDevice,
        applies: |_, _| true,
        construct: instantiate::build_leaf,
    },
];

fn device_type_is(tree: &DeviceTree, node: NodeId, prefix: &str) -> bool {
    tree.prop_str(node, "device_type")
        .is_some_and(|ty| ty.starts_with(prefix))
}

/// Naming-convention match for I2C/SPI controllers: a node with children whose name and one of
/// whose compatible strings both mention the bus. Controllers named otherwise are classified
/// as leaf devices.
pub fn peripheral_bus(tree: &DeviceTree, node: NodeId) -> Option<BusKind> {
    if !tree.has_children(node) {
        return None;
    }
    let name = tree.name(node);
    tree.string_list(node, "compatible")
        .into_iter()
        .find_map(|compatible| {
            if compatible.contains("i2c") && name.contains("i2c") {
                Some(BusKind::I2c)
            } else if compatible.contains("spi") && name.contains("spi") {
                Some(BusKind::Spi)
            } else {
                None
            }
        })
}

fn rule_for(tree: &DeviceTree, node: NodeId) -> &'static Rule {
    RULES
        .iter()
        .find(|rule| (rule.applies)(tree, node))
        .unwrap_or(&RULES[RULES.len() - 1])
}

/// The kind of construction `node` is routed to, without building anything.
pub fn classify(tree: &DeviceTree, node: NodeId) -> NodeKind {
    rule_for(tree, node).kind
}

/// Returns the node's record, building it on first sight.
///
/// A node is constructed at most once per build. Construction failures are recorded as "no
/// device" and never retried; only malformed cells are fatal.
pub fn classify_and_instantiate(
    ctx: &mut BuildContext<'_>,
    parent: Option<DeviceId>,
    node: NodeId,
) -> Result<DeviceRecord, BuildError> {
    if let Some(record) = ctx.registry.get(node) {
        return Ok(record.clone());
    }

    let rule = rule_for(ctx.tree, node);
    debug!(
        node = %ctx.tree.path_of(node),
        kind = %rule.kind,
        parent = ?parent,
        "classifying node"
    );
    let record = (rule.construct)(ctx, node)?;
    Ok(ctx.registry.insert(node, record).clone())
}
