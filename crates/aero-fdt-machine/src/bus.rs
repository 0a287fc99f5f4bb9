//! Bus node constructors.

use aero_fdt::NodeId;
use tracing::{debug, warn};

use crate::backend::BusKind;
use crate::cells;
use crate::error::BuildError;
use crate::instantiate::{build_mapped_device, cell_error, create_from_compatible};
use crate::machine::BuildContext;
use crate::registry::{DeviceRecord, NodeKind};

/// PCI host bridge. Without a catalog device the bus is transparent; children are still visited
/// by the walker.
pub(crate) fn build_pci_bus(
    ctx: &mut BuildContext<'_>,
    node: NodeId,
) -> Result<DeviceRecord, BuildError> {
    debug!(node = %ctx.tree.path_of(node), "adding pci bus");
    let device = build_mapped_device(ctx, node)?;
    Ok(DeviceRecord::new(NodeKind::PciBus, device))
}

/// `simple-bus`, SoC and other memory-mapped buses.
pub(crate) fn build_generic_bus(
    ctx: &mut BuildContext<'_>,
    node: NodeId,
) -> Result<DeviceRecord, BuildError> {
    debug!(node = %ctx.tree.path_of(node), "adding generic bus");
    let device = build_mapped_device(ctx, node)?;
    if device.is_none() {
        debug!(node = %ctx.tree.path_of(node), "transparent bus");
    }
    Ok(DeviceRecord::new(NodeKind::GenericBus, device))
}

pub(crate) fn build_i2c_bus(
    ctx: &mut BuildContext<'_>,
    node: NodeId,
) -> Result<DeviceRecord, BuildError> {
    build_peripheral_bus(ctx, node, BusKind::I2c)
}

pub(crate) fn build_spi_bus(
    ctx: &mut BuildContext<'_>,
    node: NodeId,
) -> Result<DeviceRecord, BuildError> {
    build_peripheral_bus(ctx, node, BusKind::Spi)
}

/// Property carrying a peripheral's address on its bus, and the value written to it.
fn bus_address(kind: BusKind, reg_address: u64) -> (&'static str, u64) {
    match kind {
        BusKind::I2c => ("address", reg_address & 0xff),
        BusKind::Spi => ("cs", reg_address & 0xff),
    }
}

/// Builds the controller, then every child as a peripheral on the controller's child bus.
///
/// When the controller cannot be built, every child is recorded without a device so the walker
/// does not retry them as stand-alone devices.
fn build_peripheral_bus(
    ctx: &mut BuildContext<'_>,
    node: NodeId,
    kind: BusKind,
) -> Result<DeviceRecord, BuildError> {
    let tree = ctx.tree;
    let bus_kind = match kind {
        BusKind::I2c => NodeKind::I2cBus,
        BusKind::Spi => NodeKind::SpiBus,
    };

    let controller = build_mapped_device(ctx, node)?;
    let bus = controller.and_then(|device| ctx.backend.child_bus(device, kind));
    let Some(bus) = bus else {
        debug!(node = %tree.path_of(node), %kind, "bus controller unavailable; skipping children");
        for child in tree.children(node) {
            ctx.registry.insert(child, DeviceRecord::empty(NodeKind::None));
        }
        return Ok(DeviceRecord::new(bus_kind, controller));
    };
    debug!(node = %tree.path_of(node), %kind, %bus, "added bus");

    for child in tree.children(node) {
        if ctx.registry.contains(child) {
            continue;
        }
        let address = match cells::reg_entry(tree, child, 0) {
            Ok(entry) => entry.address,
            Err(err) if err.is_not_found() => {
                debug!(node = %tree.path_of(child), "peripheral has no reg address; skipping");
                ctx.registry.insert(child, DeviceRecord::empty(NodeKind::None));
                continue;
            }
            Err(err) => return Err(cell_error(tree, child, err)),
        };

        let mut record = DeviceRecord::empty(NodeKind::None);
        if let Some(device) = create_from_compatible(ctx, child) {
            let (prop, value) = bus_address(kind, address);
            let attached = ctx
                .backend
                .set_uint_property(device, prop, value)
                .and_then(|()| ctx.backend.realize_on_bus(device, bus));
            match attached {
                Ok(()) => {
                    debug!(node = %tree.path_of(child), %bus, prop, value, "attached peripheral");
                    record = DeviceRecord::new(NodeKind::LeafDevice, Some(device));
                }
                Err(err) => warn!(node = %tree.path_of(child), "cannot attach to {bus}: {err}"),
            }
        }
        ctx.registry.insert(child, record);
    }

    Ok(DeviceRecord::new(bus_kind, controller))
}
