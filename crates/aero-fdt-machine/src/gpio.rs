use std::collections::BTreeMap;

use aero_fdt::NodeId;
use tracing::{debug, info, warn};

use crate::backend::IrqSink;
use crate::cells::{phandle_refs, PhandleRef};
use crate::machine::BuildContext;

/// Connects GPIO controller outputs to the devices naming them in `gpios`.
///
/// Entry *n* of a consumer's `gpios` list drives the consumer's GPIO input *n*; the first
/// argument cell of the entry selects the controller output line.
pub fn connect_gpios(ctx: &mut BuildContext<'_>) {
    let tree = ctx.tree;
    debug!("connecting gpios");

    let consumers: Vec<(NodeId, Vec<PhandleRef>)> = tree
        .nodes_with_property("gpios")
        .map(|node| (node, phandle_refs(tree, node, "gpios", "#gpio-cells")))
        .collect();

    // Per consumer, keyed by row ordinal; controllers are visited in document order, not row order.
    let mut sinks: BTreeMap<NodeId, BTreeMap<usize, IrqSink>> = BTreeMap::new();
    let mut wired = 0usize;
    for controller in tree.nodes_with_property("gpio-controller") {
        let Some(device) = ctx.registry.device(controller) else {
            continue;
        };
        debug!(controller = %tree.path_of(controller), "scanning gpio consumers");

        for (consumer, refs) in &consumers {
            let mut refs = refs
                .iter()
                .filter(|entry| entry.provider == controller)
                .peekable();
            if refs.peek().is_none() {
                continue;
            }
            let Some(target) = ctx.registry.device(*consumer) else {
                debug!(node = %tree.path_of(*consumer), "no device; gpios not wired");
                continue;
            };

            for entry in refs {
                let Some(&line) = entry.args.first() else {
                    warn!(
                        node = %tree.path_of(*consumer),
                        controller = %tree.path_of(controller),
                        "gpio entry has no line number"
                    );
                    continue;
                };
                let input = entry.ordinal as u32;
                let connected = ctx
                    .backend
                    .gpio_in(target, input)
                    .and_then(|sink| {
                        ctx.backend
                            .connect_gpio_out(device, line, sink)
                            .map(|()| sink)
                    });
                match connected {
                    Ok(sink) => {
                        debug!(node = %tree.path_of(*consumer), line, input, "connected gpio");
                        sinks
                            .entry(*consumer)
                            .or_default()
                            .insert(entry.ordinal, sink);
                        wired += 1;
                    }
                    Err(err) => warn!(
                        node = %tree.path_of(*consumer),
                        line,
                        input,
                        "cannot connect gpio: {err}"
                    ),
                }
            }
        }
    }

    for (consumer, by_row) in sinks {
        if let Some(record) = ctx.registry.get_mut(consumer) {
            record.gpio_sinks.extend(by_row.into_values());
        }
    }
    info!(connections = wired, "gpio nets connected");
}
