//! Clock tree: fixed-rate sources, fixed-factor derived clocks and device clock inputs.

use std::collections::{HashMap, HashSet};

use aero_fdt::{DeviceTree, NodeId};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backend::{ClockId, MachineBackend};
use crate::cells::{self, phandle_refs, CellError};
use crate::machine::BuildContext;

/// `hz * mult / div` with the division hoisted first when the product would overflow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ClockScale {
    pub mult: u64,
    pub div: u64,
}

impl ClockScale {
    pub const UNITY: ClockScale = ClockScale { mult: 1, div: 1 };

    /// A zero divisor is treated as 1.
    pub fn new(mult: u64, div: u64) -> Self {
        Self {
            mult,
            div: div.max(1),
        }
    }

    pub fn apply(self, hz: u64) -> u64 {
        let div = self.div.max(1);
        match hz.checked_mul(self.mult) {
            Some(product) => product / div,
            None => (hz / div).saturating_mul(self.mult),
        }
    }
}

impl Default for ClockScale {
    fn default() -> Self {
        Self::UNITY
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClockRecord {
    pub id: ClockId,
    #[serde(skip)]
    pub node: NodeId,
    pub name: String,
    pub hz: u64,
    pub source: Option<ClockId>,
    pub scale: ClockScale,
}

/// Every clock of one machine.
///
/// Derived clocks are recomputed whenever their source changes: [`ClockTree::set_hz`] and
/// [`ClockTree::set_source`] push the new rate through all downstream clocks and return every
/// clock whose rate was set, for [`ClockTree::publish`] to forward to the backend.
#[derive(Debug, Default, Clone, Serialize)]
#[serde(transparent)]
pub struct ClockTree {
    clocks: Vec<ClockRecord>,
    #[serde(skip)]
    by_node: HashMap<NodeId, ClockId>,
}

impl ClockTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.clocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }

    /// Creates a clock for `node`. A node owns at most one clock; adding it again returns the
    /// existing id.
    pub fn add(&mut self, node: NodeId, name: &str, hz: u64) -> ClockId {
        if let Some(&id) = self.by_node.get(&node) {
            return id;
        }
        let id = ClockId(self.clocks.len() as u32);
        self.clocks.push(ClockRecord {
            id,
            node,
            name: name.to_string(),
            hz,
            source: None,
            scale: ClockScale::UNITY,
        });
        self.by_node.insert(node, id);
        id
    }

    pub fn get(&self, id: ClockId) -> Option<&ClockRecord> {
        self.clocks.get(id.0 as usize)
    }

    pub fn by_node(&self, node: NodeId) -> Option<ClockId> {
        self.by_node.get(&node).copied()
    }

    pub fn hz(&self, id: ClockId) -> u64 {
        self.get(id).map_or(0, |clock| clock.hz)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClockRecord> {
        self.clocks.iter()
    }

    /// Sets a clock's rate and updates everything derived from it.
    pub fn set_hz(&mut self, id: ClockId, hz: u64) -> Vec<ClockId> {
        let Some(clock) = self.clocks.get_mut(id.0 as usize) else {
            return Vec::new();
        };
        clock.hz = hz;
        let mut changed = vec![id];
        changed.extend(self.propagate(id));
        changed
    }

    /// Makes `id` a derived clock of `source`, recomputes it and updates its dependents.
    pub fn set_source(
        &mut self,
        id: ClockId,
        source: ClockId,
        scale: ClockScale,
    ) -> Vec<ClockId> {
        let Some(clock) = self.clocks.get_mut(id.0 as usize) else {
            return Vec::new();
        };
        clock.source = Some(source);
        clock.scale = scale;
        self.recompute(id);
        let mut changed = vec![id];
        changed.extend(self.propagate(id));
        changed
    }

    /// Re-derives `id` from its source's current rate.
    pub fn recompute(&mut self, id: ClockId) {
        let Some(clock) = self.get(id) else {
            return;
        };
        let Some(source) = clock.source else {
            return;
        };
        let hz = clock.scale.apply(self.hz(source));
        if let Some(clock) = self.clocks.get_mut(id.0 as usize) {
            clock.hz = hz;
        }
    }

    /// Sends the current rate of each clock in `changed` to `backend`.
    pub fn publish(&self, changed: &[ClockId], backend: &mut dyn MachineBackend) {
        for &id in changed {
            if let Err(err) = backend.set_clock_hz(id, self.hz(id)) {
                warn!(clock = %id, "cannot update clock rate: {err}");
            }
        }
    }

    // Each clock is visited at most once, so source cycles terminate.
    fn propagate(&mut self, from: ClockId) -> Vec<ClockId> {
        let mut visited = HashSet::from([from]);
        let mut pending = vec![from];
        let mut recomputed = Vec::new();
        while let Some(upstream) = pending.pop() {
            let downstream: Vec<ClockId> = self
                .clocks
                .iter()
                .filter(|clock| clock.source == Some(upstream) && !visited.contains(&clock.id))
                .map(|clock| clock.id)
                .collect();
            for id in downstream {
                visited.insert(id);
                self.recompute(id);
                recomputed.push(id);
                pending.push(id);
            }
        }
        recomputed
    }
}

fn optional_number(tree: &DeviceTree, node: NodeId, prop: &str, default: u64) -> u64 {
    match cells::read_number(tree, node, prop) {
        Ok(value) => value,
        Err(CellError::MissingProperty { .. }) => default,
        Err(err) => {
            warn!(node = %tree.path_of(node), prop, "{err}; using {default}");
            default
        }
    }
}

/// Creates every clock, links derived clocks to their sources and connects device clock inputs.
///
/// Runs after classification: it scans the document rather than the registry, so clocks may
/// reference providers anywhere in the tree.
pub fn build_clock_tree(ctx: &mut BuildContext<'_>) {
    let tree = ctx.tree;
    debug!(
        classified = ctx.clock_nodes,
        "building clock tree"
    );

    // Sources and derived clocks alike; rates for derived clocks arrive with their links.
    for node in tree.nodes_with_property("#clock-cells") {
        let name = tree.name(node);
        let hz = match cells::read_number(tree, node, "clock-frequency") {
            Ok(hz) => {
                debug!(clock = name, hz, "clock source");
                hz
            }
            Err(CellError::MissingProperty { .. }) => {
                debug!(clock = name, "derived clock");
                0
            }
            Err(err) => {
                warn!(clock = name, "bad clock-frequency ({err}); treating as derived");
                0
            }
        };
        let id = ctx.clocks.add(node, name, hz);
        if let Err(err) = ctx.backend.create_clock(id, name, hz) {
            warn!(clock = name, "cannot create clock: {err}");
        }
    }

    for node in tree.nodes_with_property("clocks") {
        let refs = phandle_refs(tree, node, "clocks", "#clock-cells");

        if let Some(target) = ctx.clocks.by_node(node) {
            let mut refs = refs.into_iter();
            let Some(first) = refs.next() else {
                continue;
            };
            let Some(source) = ctx.clocks.by_node(first.provider) else {
                continue;
            };
            let extra = refs.count();
            if extra > 0 {
                debug!(
                    clock = tree.name(node),
                    extra, "derived clock has several parents; using the first"
                );
            }
            let mult = optional_number(tree, node, "clock-mult", 1);
            let mut div = optional_number(tree, node, "clock-div", 1);
            if div == 0 {
                warn!(clock = tree.name(node), "clock-div is 0; using 1");
                div = 1;
            }
            if let Err(err) = ctx.backend.set_clock_source(target, source) {
                warn!(clock = tree.name(node), "cannot link clock: {err}");
            }
            let changed = ctx
                .clocks
                .set_source(target, source, ClockScale::new(mult, div));
            ctx.clocks.publish(&changed, &mut *ctx.backend);
            continue;
        }

        let Some(record) = ctx.registry.get(node) else {
            continue;
        };
        let Some(device) = record.device else {
            debug!(node = %tree.path_of(node), "no device for clock consumer; skipping");
            continue;
        };
        for clock_ref in refs {
            let Some(clock) = ctx.clocks.by_node(clock_ref.provider) else {
                continue;
            };
            let input = tree
                .string_list_get(node, "clock-names", clock_ref.ordinal)
                .unwrap_or_else(|| tree.base_name(node));
            if let Err(err) = ctx.backend.connect_clock_in(device, input, clock) {
                warn!(node = %tree.path_of(node), input, "cannot connect clock: {err}");
            }
        }
    }

    info!(clocks = ctx.clocks.len(), "clock tree built");
}
