//! Machine bring-up: CPUs, RAM, the device walk and the resolver passes, in that order.

use aero_fdt::{DeviceTree, NodeId};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backend::{ClockId, CpuId, DeviceId, MachineBackend};
use crate::cells;
use crate::classify::classify_and_instantiate;
use crate::clock::{build_clock_tree, ClockTree};
use crate::config::MachineConfig;
use crate::error::BuildError;
use crate::gpio::connect_gpios;
use crate::instantiate::{cell_error, strip_manufacturer};
use crate::intc::build_interrupt_tree;
use crate::registry::{DeviceRecord, Registry};

const CPUS_NODE: &str = "cpus";
const MEMORY_NODE: &str = "memory";

/// State of one in-flight build, passed explicitly to every stage.
pub struct BuildContext<'a> {
    pub tree: &'a DeviceTree,
    pub backend: &'a mut dyn MachineBackend,
    pub config: &'a MachineConfig,
    pub registry: Registry,
    pub clocks: ClockTree,
    pub cpus: Vec<CpuId>,
    /// Clock providers reserved by the classifier.
    pub clock_nodes: usize,
}

impl<'a> BuildContext<'a> {
    pub fn new(
        tree: &'a DeviceTree,
        backend: &'a mut dyn MachineBackend,
        config: &'a MachineConfig,
    ) -> Self {
        Self {
            tree,
            backend,
            config,
            registry: Registry::new(),
            clocks: ClockTree::new(),
            cpus: Vec::new(),
            clock_nodes: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RamRegion {
    pub base: u64,
    pub size: u64,
}

/// A fully wired topology.
#[derive(Debug, Clone)]
pub struct BuiltMachine {
    pub model: Option<String>,
    pub cpus: Vec<CpuId>,
    pub ram: RamRegion,
    pub registry: Registry,
    pub clocks: ClockTree,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeSummary {
    pub path: String,
    #[serde(flatten)]
    pub record: DeviceRecord,
}

/// Serializable view of a [`BuiltMachine`] with nodes named by path.
#[derive(Debug, Clone, Serialize)]
pub struct MachineSummary<'a> {
    pub model: Option<&'a str>,
    pub cpus: &'a [CpuId],
    pub ram: RamRegion,
    pub nodes: Vec<NodeSummary>,
    pub clocks: &'a ClockTree,
}

impl BuiltMachine {
    /// Changes a clock's rate after the build and notifies `backend` of every clock whose rate
    /// was recomputed as a result. `backend` must be the one the machine was built on.
    pub fn set_clock_hz(&mut self, backend: &mut dyn MachineBackend, clock: ClockId, hz: u64) {
        let changed = self.clocks.set_hz(clock, hz);
        self.clocks.publish(&changed, backend);
    }

    /// `tree` must be the document the machine was built from.
    pub fn summary<'a>(&'a self, tree: &DeviceTree) -> MachineSummary<'a> {
        MachineSummary {
            model: self.model.as_deref(),
            cpus: &self.cpus,
            ram: self.ram,
            nodes: self
                .registry
                .iter()
                .map(|(node, record)| NodeSummary {
                    path: tree.path_of(node),
                    record: record.clone(),
                })
                .collect(),
            clocks: &self.clocks,
        }
    }
}

fn is_cpu_node(tree: &DeviceTree, node: NodeId) -> bool {
    tree.prop_str(node, "device_type") == Some("cpu") || tree.base_name(node) == "cpu"
}

fn create_cpus(ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
    let tree = ctx.tree;
    let cpu_nodes: Vec<NodeId> = tree
        .subnode(tree.root(), CPUS_NODE)
        .map(|cpus| tree.children(cpus).filter(|&n| is_cpu_node(tree, n)).collect())
        .unwrap_or_default();

    if cpu_nodes.is_empty() {
        let model = ctx.config.cpu_type.as_deref().ok_or(BuildError::NoCpu)?;
        let cpu = ctx
            .backend
            .create_cpu(model, ctx.config.default_cpu_freq_hz)
            .ok_or_else(|| BuildError::CpuCreate {
                model: model.to_string(),
            })?;
        info!(model, %cpu, "no CPU nodes in device tree; using configured CPU");
        ctx.cpus.push(cpu);
        return Ok(());
    }

    if cpu_nodes.len() > ctx.config.max_cpus {
        return Err(BuildError::TooManyCpus {
            max: ctx.config.max_cpus,
        });
    }

    for node in cpu_nodes {
        let model = tree
            .prop_str(node, "compatible")
            .ok_or_else(|| BuildError::CpuMissingCompatible {
                node: tree.path_of(node),
            })?;
        let freq_hz = match cells::read_number(tree, node, "timebase-frequency") {
            Ok(hz) => hz,
            Err(_) => {
                debug!(
                    node = %tree.path_of(node),
                    hz = ctx.config.default_cpu_freq_hz,
                    "no timebase-frequency; using default"
                );
                ctx.config.default_cpu_freq_hz
            }
        };
        if freq_hz == 0 {
            warn!(
                node = %tree.path_of(node),
                "CPU frequency unknown; set a default CPU frequency"
            );
        }

        let stripped = strip_manufacturer(model);
        let cpu = ctx
            .backend
            .create_cpu(model, freq_hz)
            .or_else(|| {
                (stripped != model)
                    .then(|| ctx.backend.create_cpu(stripped, freq_hz))
                    .flatten()
            })
            .ok_or_else(|| BuildError::CpuCreate {
                model: model.to_string(),
            })?;
        debug!(node = %tree.path_of(node), model, %cpu, freq_hz, "created CPU");
        ctx.cpus.push(cpu);
    }
    Ok(())
}

/// The root `interrupt-parent` must exist before any device is wired.
fn check_root_interrupt_parent(tree: &DeviceTree) -> Result<(), BuildError> {
    if tree.has_property(tree.root(), "interrupt-parent") {
        Ok(())
    } else {
        Err(BuildError::NoRootInterruptParent)
    }
}

fn map_memory(ctx: &mut BuildContext<'_>) -> Result<RamRegion, BuildError> {
    let tree = ctx.tree;
    let memory = tree
        .subnode(tree.root(), MEMORY_NODE)
        .ok_or(BuildError::NoMemory)?;
    let entry = match cells::reg_entry(tree, memory, 0) {
        Ok(entry) => entry,
        Err(err) if err.is_not_found() => return Err(BuildError::NoMemory),
        Err(err) => return Err(cell_error(tree, memory, err)),
    };
    if entry.size == 0 {
        return Err(BuildError::NoMemory);
    }

    ctx.backend
        .map_ram(entry.address, entry.size)
        .map_err(|source| BuildError::Backend {
            context: format!("mapping RAM at {:#x}", entry.address),
            source,
        })?;
    info!(
        base = entry.address,
        size_mib = entry.size / (1024 * 1024),
        "mapped system memory"
    );
    Ok(RamRegion {
        base: entry.address,
        size: entry.size,
    })
}

/// Pre-order walk below one root child. Only nodes with `compatible` are classified; the rest
/// are passed through with no parent device.
fn scan_subtree(ctx: &mut BuildContext<'_>, top: NodeId) -> Result<(), BuildError> {
    let tree = ctx.tree;
    let mut pending: Vec<(NodeId, Option<DeviceId>)> = vec![(top, None)];
    while let Some((node, parent)) = pending.pop() {
        let device = if tree.string_list(node, "compatible").is_empty() {
            None
        } else {
            classify_and_instantiate(ctx, parent, node)?.device
        };
        let children: Vec<NodeId> = tree.children(node).collect();
        pending.extend(children.into_iter().rev().map(|child| (child, device)));
    }
    Ok(())
}

/// Classifies every device node under the root, skipping `/cpus` and `/memory`.
pub fn scan_devices(ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
    let tree = ctx.tree;
    for child in tree.children(tree.root()) {
        let name = tree.base_name(child);
        if name == CPUS_NODE || name == MEMORY_NODE {
            continue;
        }
        scan_subtree(ctx, child)?;
    }
    info!(
        nodes = ctx.registry.len(),
        clocks = ctx.clock_nodes,
        "device walk complete"
    );
    Ok(())
}

/// Builds the machine described by `tree` on `backend`.
///
/// Stages run strictly in order: CPUs, root interrupt-parent check, RAM, device walk, then the
/// clock, interrupt and GPIO resolvers. Any error aborts the build; the backend may hold a
/// partial topology at that point and should be discarded.
pub fn build_machine(
    tree: &DeviceTree,
    backend: &mut dyn MachineBackend,
    config: &MachineConfig,
) -> Result<BuiltMachine, BuildError> {
    let model = tree.prop_str(tree.root(), "model").map(str::to_string);
    info!(model = model.as_deref().unwrap_or("<unnamed>"), "building machine from device tree");

    let mut ctx = BuildContext::new(tree, backend, config);
    create_cpus(&mut ctx)?;
    check_root_interrupt_parent(tree)?;
    let ram = map_memory(&mut ctx)?;

    scan_devices(&mut ctx)?;
    build_clock_tree(&mut ctx);
    build_interrupt_tree(&mut ctx)?;
    connect_gpios(&mut ctx);

    Ok(BuiltMachine {
        model,
        cpus: ctx.cpus,
        ram,
        registry: ctx.registry,
        clocks: ctx.clocks,
    })
}

/// Decodes a DTB blob and builds it (see [`build_machine`]).
pub fn build_machine_from_blob(
    blob: &[u8],
    backend: &mut dyn MachineBackend,
    config: &MachineConfig,
) -> Result<BuiltMachine, BuildError> {
    let tree = DeviceTree::from_blob(blob)?;
    build_machine(&tree, backend, config)
}
