#![forbid(unsafe_code)]

use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use aero_fdt::DeviceTree;
use aero_fdt_machine::{
    build_machine, BuiltMachine, CpuArch, MachineConfig, MachineSummary, ModelMachine,
};
use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(about = "Build a machine topology from a flattened device tree and print it")]
struct Args {
    /// Device tree blob (.dtb) to load.
    #[arg(long)]
    dtb: PathBuf,

    /// JSON machine configuration; the flags below override its fields.
    #[arg(long)]
    config: Option<PathBuf>,

    /// CPU model to create when the tree has no /cpus node.
    #[arg(long)]
    cpu: Option<String>,

    /// Frequency (Hz) for CPU nodes without timebase-frequency.
    #[arg(long)]
    cpu_freq: Option<u64>,

    /// CPU architecture used to wire the root interrupt controller (arm, mips, ppc, microblaze, none).
    #[arg(long)]
    arch: Option<CpuArch>,

    /// Refuse devices whose compatible name starts with this prefix. Repeatable.
    #[arg(long = "block", value_name = "PREFIX")]
    blocklist: Vec<String>,

    /// Maximum number of CPU nodes accepted.
    #[arg(long)]
    max_cpus: Option<usize>,

    /// Print the built machine as JSON.
    #[arg(long)]
    json: bool,

    /// Log at debug level (overrides RUST_LOG).
    #[arg(long, short)]
    verbose: bool,
}

impl Args {
    fn machine_config(&self) -> Result<MachineConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => MachineConfig::default(),
        };
        if let Some(cpu) = &self.cpu {
            config.cpu_type = Some(cpu.clone());
        }
        if let Some(hz) = self.cpu_freq {
            config.default_cpu_freq_hz = hz;
        }
        if let Some(arch) = self.arch {
            config.arch = arch;
        }
        if let Some(max) = self.max_cpus {
            config.max_cpus = max;
        }
        config.device_blocklist.extend(self.blocklist.iter().cloned());
        Ok(config)
    }
}

fn load_config(path: &Path) -> Result<MachineConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid config {}", path.display()))
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

#[derive(Serialize)]
struct Report<'a> {
    machine: MachineSummary<'a>,
    backend: &'a ModelMachine,
}

fn print_text(
    out: &mut impl Write,
    tree: &DeviceTree,
    built: &BuiltMachine,
    backend: &ModelMachine,
) -> io::Result<()> {
    writeln!(out, "model: {}", built.model.as_deref().unwrap_or("<unnamed>"))?;
    for cpu in backend.cpus() {
        writeln!(out, "{}: {} @ {} Hz", cpu.id, cpu.model, cpu.freq_hz)?;
    }
    writeln!(out, "ram: {:#x} +{:#x}", built.ram.base, built.ram.size)?;

    writeln!(out, "nodes:")?;
    for (node, record) in built.registry.iter() {
        let device = record
            .device
            .and_then(|id| backend.device(id))
            .map(|state| format!(" {} ({})", state.id, state.type_name))
            .unwrap_or_default();
        writeln!(out, "  {} [{}]{}", tree.path_of(node), record.kind, device)?;
    }

    writeln!(out, "mmio:")?;
    for mapping in backend.mmio_mappings() {
        writeln!(
            out,
            "  {:#010x} +{:#x} {}[{}]",
            mapping.region.base, mapping.region.size, mapping.device, mapping.index
        )?;
    }

    writeln!(out, "irqs:")?;
    for conn in backend.irq_connections() {
        writeln!(out, "  {}.irq[{}] -> {}", conn.device, conn.line, conn.sink)?;
    }
    writeln!(out, "gpios:")?;
    for conn in backend.gpio_connections() {
        writeln!(out, "  {}.out[{}] -> {}", conn.device, conn.line, conn.sink)?;
    }

    writeln!(out, "clocks:")?;
    for clock in built.clocks.iter() {
        match clock.source {
            Some(source) => writeln!(
                out,
                "  {} {} {} Hz (from {} x{}/{})",
                clock.id, clock.name, clock.hz, source, clock.scale.mult, clock.scale.div
            )?,
            None => writeln!(out, "  {} {} {} Hz", clock.id, clock.name, clock.hz)?,
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = args.machine_config()?;
    let blob = std::fs::read(&args.dtb)
        .with_context(|| format!("failed to read {}", args.dtb.display()))?;
    let tree = DeviceTree::from_blob(&blob)
        .with_context(|| format!("failed to decode {}", args.dtb.display()))?;

    let mut backend = ModelMachine::default();
    let built = build_machine(&tree, &mut backend, &config)
        .with_context(|| format!("failed to build machine from {}", args.dtb.display()))?;
    tracing::info!(
        devices = backend.devices().len(),
        irqs = backend.irq_connections().len(),
        clocks = built.clocks.len(),
        "machine built"
    );

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    if args.json {
        let report = Report {
            machine: built.summary(&tree),
            backend: &backend,
        };
        serde_json::to_writer_pretty(&mut out, &report).context("failed to write JSON")?;
        writeln!(out)?;
    } else {
        print_text(&mut out, &tree, &built, &backend)?;
    }
    out.flush()?;
    Ok(())
}
