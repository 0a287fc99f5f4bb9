//! Device construction from `compatible` strings.

use aero_fdt::{DeviceTree, NodeId};
use tracing::{debug, warn};

use crate::backend::{BackendError, DeviceId, LinkTarget, MachineBackend};
use crate::cells::{self, CellError};
use crate::error::BuildError;
use crate::machine::BuildContext;
use crate::registry::{DeviceRecord, NodeKind};

type Fixup = fn(&mut dyn MachineBackend, DeviceId) -> Result<(), BackendError>;

/// Construction-time property fixups, keyed by catalog-name prefix. Applied before realize.
const FIXUPS: &[(&str, Fixup)] = &[("pl08", pl08x_downstream)];

// PL080/PL081 DMA engines master onto system memory.
fn pl08x_downstream(backend: &mut dyn MachineBackend, dev: DeviceId) -> Result<(), BackendError> {
    backend.set_link_property(dev, "downstream", LinkTarget::SystemMemory)
}

/// Drops the manufacturer prefix: `"arm,pl011"` becomes `"pl011"`.
pub fn strip_manufacturer(compatible: &str) -> &str {
    compatible
        .split_once(',')
        .map_or(compatible, |(_, model)| model)
}

pub(crate) fn cell_error(tree: &DeviceTree, node: NodeId, source: CellError) -> BuildError {
    BuildError::Cells {
        node: tree.path_of(node),
        source,
    }
}

fn apply_fixups(ctx: &mut BuildContext<'_>, node: NodeId, device: DeviceId, name: &str) {
    for (_, fixup) in FIXUPS.iter().filter(|(prefix, _)| name.starts_with(prefix)) {
        if let Err(err) = fixup(&mut *ctx.backend, device) {
            warn!(node = %ctx.tree.path_of(node), "fixup for {name} failed: {err}");
        }
    }
}

/// Creates (but does not realize) a device for the first usable entry of the node's
/// `compatible` list.
///
/// Each entry is tried by its manufacturer-stripped name and then with `-` replaced by `_`.
/// Blocked names are skipped.
pub fn create_from_compatible(ctx: &mut BuildContext<'_>, node: NodeId) -> Option<DeviceId> {
    let tree = ctx.tree;
    for compatible in tree.string_list(node, "compatible") {
        let name = strip_manufacturer(compatible);
        if ctx.config.is_blocked(name) {
            debug!(node = %tree.path_of(node), name, "device is blocklisted");
            continue;
        }

        let alias = name.replace('-', "_");
        let device = ctx.backend.try_create_device(name).or_else(|| {
            (alias != name)
                .then(|| ctx.backend.try_create_device(&alias))
                .flatten()
        });
        if let Some(device) = device {
            debug!(node = %tree.path_of(node), name, %device, "created device");
            apply_fixups(ctx, node, device, name);
            return Some(device);
        }
    }
    debug!(node = %tree.path_of(node), "no catalog device matches");
    None
}

/// Realizes `device` and maps each `reg` entry onto its MMIO regions in order.
///
/// Returns `Ok(false)` if the backend refuses to realize the device. Malformed `reg` cells are
/// fatal; a refused mapping only loses that region.
pub fn realize_and_map(
    ctx: &mut BuildContext<'_>,
    node: NodeId,
    device: DeviceId,
) -> Result<bool, BuildError> {
    let tree = ctx.tree;
    if let Err(err) = ctx.backend.realize(device) {
        warn!(node = %tree.path_of(node), "cannot realize {device}: {err}");
        return Ok(false);
    }

    let regions = cells::reg_entries(tree, node).map_err(|err| cell_error(tree, node, err))?;
    for (index, region) in regions.into_iter().enumerate() {
        if let Err(err) = ctx
            .backend
            .mmio_map(device, index, region.address, region.size)
        {
            warn!(
                node = %tree.path_of(node),
                index,
                base = region.address,
                "cannot map region: {err}"
            );
        }
    }
    Ok(true)
}

/// Compatible construction plus realize and MMIO mapping.
pub fn build_mapped_device(
    ctx: &mut BuildContext<'_>,
    node: NodeId,
) -> Result<Option<DeviceId>, BuildError> {
    let Some(device) = create_from_compatible(ctx, node) else {
        return Ok(None);
    };
    Ok(realize_and_map(ctx, node, device)?.then_some(device))
}

pub(crate) fn build_clock_provider(
    ctx: &mut BuildContext<'_>,
    node: NodeId,
) -> Result<DeviceRecord, BuildError> {
    ctx.clock_nodes += 1;
    debug!(node = %ctx.tree.path_of(node), "reserved clock provider");
    Ok(DeviceRecord::empty(NodeKind::ClockSource))
}

pub(crate) fn build_gpio_controller(
    ctx: &mut BuildContext<'_>,
    node: NodeId,
) -> Result<DeviceRecord, BuildError> {
    let device = build_mapped_device(ctx, node)?;
    Ok(DeviceRecord::new(NodeKind::GpioController, device))
}

pub(crate) fn build_interrupt_controller(
    ctx: &mut BuildContext<'_>,
    node: NodeId,
) -> Result<DeviceRecord, BuildError> {
    let device = build_mapped_device(ctx, node)?;
    Ok(DeviceRecord::new(NodeKind::InterruptController, device))
}

/// A catalog device, else an unimplemented-device placeholder over the node's address range,
/// else nothing.
pub(crate) fn build_leaf(
    ctx: &mut BuildContext<'_>,
    node: NodeId,
) -> Result<DeviceRecord, BuildError> {
    if let Some(device) = build_mapped_device(ctx, node)? {
        return Ok(DeviceRecord::new(NodeKind::LeafDevice, Some(device)));
    }

    let tree = ctx.tree;
    let regions = cells::reg_entries(tree, node).map_err(|err| cell_error(tree, node, err))?;
    let Some(first) = regions.first() else {
        debug!(node = %tree.path_of(node), "no device created");
        return Ok(DeviceRecord::empty(NodeKind::None));
    };
    let size = regions
        .iter()
        .fold(0u64, |total, region| total.saturating_add(region.size));

    match ctx
        .backend
        .create_placeholder(tree.name(node), first.address, size)
    {
        Some(device) => {
            debug!(
                node = %tree.path_of(node),
                base = first.address,
                size,
                "reserved address range with placeholder"
            );
            Ok(DeviceRecord::new(NodeKind::Placeholder, Some(device)))
        }
        None => {
            debug!(node = %tree.path_of(node), "no device created");
            Ok(DeviceRecord::empty(NodeKind::None))
        }
    }
}
