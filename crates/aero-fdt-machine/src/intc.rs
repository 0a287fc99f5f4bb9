//! Interrupt routing: sizes every instantiated interrupt controller from the `interrupts`
//! properties that target it, allocates its inputs and connects each device's outputs.
//!
//! Limitations:
//! - With `#interrupt-cells = <3>` the line number is read from cell 1 (the GIC layout);
//!   otherwise from cell 0.
//! - Controllers exposing several interrupt classes (e.g. GIC SPI vs PPI) are treated as one
//!   flat line space.

use aero_fdt::{DeviceTree, NodeId};
use tracing::{debug, info, warn};

use crate::backend::{DeviceId, IrqSink};
use crate::cells::{CellArray, CellError};
use crate::error::BuildError;
use crate::machine::BuildContext;

/// Rows naming a line at or above this are ignored; it bounds controller sizing.
pub const MAX_CONTROLLER_LINES: u32 = 1024;

/// The interrupt controller `node` reports to: the nearest `interrupt-parent` on the node or
/// its ancestors. A zero phandle is ignored.
pub fn effective_interrupt_parent(tree: &DeviceTree, node: NodeId) -> Option<NodeId> {
    let mut cursor = Some(node);
    while let Some(current) = cursor {
        match tree.prop_u32(current, "interrupt-parent") {
            Some(phandle) if phandle != 0 => return tree.node_by_phandle(phandle),
            _ => cursor = tree.parent(current),
        }
    }
    None
}

/// `#interrupt-cells` of a controller; missing or zero means one cell.
pub fn interrupt_cells(tree: &DeviceTree, controller: NodeId) -> u32 {
    tree.prop_u32(controller, "#interrupt-cells")
        .filter(|&cells| cells != 0)
        .unwrap_or(1)
}

/// Line numbers of every row of the node's `interrupts`, in order.
pub fn interrupt_lines(
    tree: &DeviceTree,
    node: NodeId,
    cells: u32,
) -> Result<Vec<u32>, CellError> {
    let rows = CellArray::new(tree, node, "interrupts", cells)?;
    let column = if cells == 3 { 1 } else { 0 };
    (0..rows.rows()).map(|row| rows.cell(row, column)).collect()
}

/// Resolves the root interrupt controller to its device.
fn root_controller(ctx: &BuildContext<'_>) -> Result<(NodeId, DeviceId), BuildError> {
    let tree = ctx.tree;
    let phandle = tree
        .prop_u32(tree.root(), "interrupt-parent")
        .ok_or(BuildError::NoRootInterruptParent)?;
    let node = tree
        .node_by_phandle(phandle)
        .ok_or(BuildError::UnresolvedRootInterruptParent { phandle })?;
    let device = ctx.registry.device(node).ok_or_else(|| {
        BuildError::RootInterruptParentNotInstantiated {
            node: tree.path_of(node),
        }
    })?;
    Ok((node, device))
}

struct Consumer {
    node: NodeId,
    controller: NodeId,
    lines: Vec<u32>,
}

pub fn build_interrupt_tree(ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
    let tree = ctx.tree;
    debug!("building interrupt tree");

    let cpu_sinks: Vec<IrqSink> = ctx
        .cpus
        .iter()
        .flat_map(|&cpu| ctx.config.arch.cpu_irq_sinks(&*ctx.backend, cpu))
        .collect();
    let (root_node, root_device) = root_controller(ctx)?;

    for (line, sink) in (0u32..).zip(&cpu_sinks) {
        if let Err(err) = ctx.backend.connect_gpio_out(root_device, line, *sink) {
            warn!(
                controller = %tree.path_of(root_node),
                line,
                "cannot connect CPU input {sink}: {err}"
            );
        }
    }
    debug!(
        controller = %tree.path_of(root_node),
        lines = cpu_sinks.len(),
        "wired root interrupt controller to CPUs"
    );

    // Decoded once; each controller below picks the rows that target it.
    let consumers: Vec<Consumer> = tree
        .nodes_with_property("interrupts")
        .filter_map(|node| {
            let controller = effective_interrupt_parent(tree, node)?;
            if controller == node {
                debug!(node = %tree.path_of(node), "interrupt parent is itself; skipping");
                return None;
            }
            match interrupt_lines(tree, node, interrupt_cells(tree, controller)) {
                Ok(lines) => {
                    for line in lines.iter().filter(|&&line| line >= MAX_CONTROLLER_LINES) {
                        warn!(
                            node = %tree.path_of(node),
                            line,
                            "interrupt line out of range; row skipped"
                        );
                    }
                    Some(Consumer {
                        node,
                        controller,
                        lines,
                    })
                }
                Err(err) => {
                    warn!(node = %tree.path_of(node), "skipping malformed interrupts: {err}");
                    None
                }
            }
        })
        .collect();

    let mut wired = 0usize;
    for controller in tree.nodes_with_property("interrupt-controller") {
        let Some(device) = ctx.registry.device(controller) else {
            continue;
        };
        let targeting = || consumers.iter().filter(move |c| c.controller == controller);

        // Sizing completes before any line is allocated.
        let count = targeting()
            .flat_map(|c| c.lines.iter().copied())
            .filter(|&line| line < MAX_CONTROLLER_LINES)
            .max()
            .map_or(0, |max| max.saturating_add(1));

        let mut sinks = Vec::new();
        for line in 0..count {
            match ctx.backend.gpio_in(device, line) {
                Ok(sink) => sinks.push(sink),
                Err(err) => {
                    warn!(
                        controller = %tree.path_of(controller),
                        needed = count,
                        "controller provides only {line} inputs: {err}"
                    );
                    break;
                }
            }
        }
        debug!(
            controller = %tree.path_of(controller),
            lines = sinks.len(),
            "allocated interrupt inputs"
        );

        for consumer in targeting() {
            let Some(source) = ctx.registry.device(consumer.node) else {
                debug!(node = %tree.path_of(consumer.node), "no device; interrupts not wired");
                continue;
            };
            for (output, &line) in (0u32..).zip(&consumer.lines) {
                let Some(&sink) = sinks.get(line as usize) else {
                    continue;
                };
                match ctx.backend.connect_irq(source, output, sink) {
                    Ok(()) => {
                        debug!(node = %tree.path_of(consumer.node), output, line, "connected irq");
                        wired += 1;
                    }
                    Err(err) => warn!(
                        node = %tree.path_of(consumer.node),
                        output,
                        line,
                        "cannot connect irq: {err}"
                    ),
                }
            }
        }

        if let Some(record) = ctx.registry.get_mut(controller) {
            record.irq_sinks = sinks;
        }
    }

    info!(connections = wired, "interrupt tree built");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use aero_fdt::DeviceTreeBuilder;

    fn tree() -> DeviceTree {
        let mut b = DeviceTreeBuilder::new();
        b.property_u32("interrupt-parent", 1);
        let gic = b.begin_node("gic");
        b.property_null("interrupt-controller")
            .property_u32("#interrupt-cells", 3)
            .property_phandle(1);
        b.end_node(gic).unwrap();
        let vic = b.begin_node("vic");
        b.property_null("interrupt-controller")
            .property_phandle(2)
            .property_u32("interrupt-parent", 2);
        b.end_node(vic).unwrap();
        let soc = b.begin_node("soc");
        b.property_u32("interrupt-parent", 0);
        let uart = b.begin_node("uart");
        b.property_array_u32("interrupts", &[0, 5, 4, 0, 7, 4]);
        b.end_node(uart).unwrap();
        let timer = b.begin_node("timer");
        b.property_u32("interrupt-parent", 2)
            .property_array_u32("interrupts", &[3]);
        b.end_node(timer).unwrap();
        b.end_node(soc).unwrap();
        b.finish().unwrap()
    }

    #[test]
    fn parent_is_inherited_and_zero_is_skipped() {
        let tree = tree();
        let gic = tree.find_path("/gic").unwrap();
        let vic = tree.find_path("/vic").unwrap();
        assert_eq!(
            effective_interrupt_parent(&tree, tree.find_path("/soc/uart").unwrap()),
            Some(gic)
        );
        assert_eq!(
            effective_interrupt_parent(&tree, tree.find_path("/soc/timer").unwrap()),
            Some(vic)
        );
        assert_eq!(effective_interrupt_parent(&tree, vic), Some(vic));
    }

    #[test]
    fn three_cell_specifiers_use_the_middle_cell() {
        let tree = tree();
        let uart = tree.find_path("/soc/uart").unwrap();
        assert_eq!(interrupt_lines(&tree, uart, 3), Ok(vec![5, 7]));
        assert_eq!(interrupt_lines(&tree, uart, 2), Ok(vec![0, 4, 7]));
        assert!(interrupt_lines(&tree, uart, 4).is_err());
        assert_eq!(interrupt_cells(&tree, tree.find_path("/vic").unwrap()), 1);
    }
}
