mod common;

use aero_fdt::{DeviceTree, DeviceTreeBuilder};
use aero_fdt_machine::{
    build_machine, CpuArch, CpuId, DeviceId, IrqSink, MachineConfig, ModelMachine,
};
use common::{arm_config, board, node, reference_board, BoardOptions};
use pretty_assertions::assert_eq;

const GIC_PHANDLE: u32 = 1;

/// Cortex-A15 board with a GIC at the root; `devices` adds nodes under the root.
fn gic_board(devices: fn(&mut DeviceTreeBuilder)) -> DeviceTree {
    let mut b = DeviceTreeBuilder::new();
    b.property_u32("#address-cells", 1)
        .property_u32("#size-cells", 1)
        .property_u32("interrupt-parent", GIC_PHANDLE);

    let cpus = b.begin_node("cpus");
    let cpu = b.begin_node("cpu@0");
    b.property_string("device_type", "cpu")
        .property_string("compatible", "arm,cortex-a15");
    b.end_node(cpu).unwrap();
    b.end_node(cpus).unwrap();

    let memory = b.begin_node("memory@80000000");
    b.property_array_u32("reg", &[0x8000_0000, 0x1000_0000]);
    b.end_node(memory).unwrap();

    let gic = b.begin_node("interrupt-controller@2c001000");
    b.property_string_list("compatible", &["arm,cortex-a15-gic", "arm,cortex-a9-gic"])
        .property_null("interrupt-controller")
        .property_u32("#interrupt-cells", 3)
        .property_array_u32("reg", &[0x2c00_1000, 0x1000, 0x2c00_2000, 0x2000])
        .property_phandle(GIC_PHANDLE);
    b.end_node(gic).unwrap();

    devices(&mut b);
    b.finish().unwrap()
}

fn uart(b: &mut DeviceTreeBuilder, base: u32, interrupts: &[u32]) {
    let node = b.begin_node(&format!("uart@{base:x}"));
    b.property_string("compatible", "arm,pl011")
        .property_array_u32("reg", &[base, 0x1000])
        .property_array_u32("interrupts", interrupts);
    b.end_node(node).unwrap();
}

fn device_of(built: &aero_fdt_machine::BuiltMachine, tree: &DeviceTree, path: &str) -> DeviceId {
    built.registry.device(node(tree, path)).unwrap()
}

fn irqs_from(machine: &ModelMachine, device: DeviceId) -> Vec<(u32, IrqSink)> {
    machine
        .irq_connections()
        .iter()
        .filter(|c| c.device == device)
        .map(|c| (c.line, c.sink))
        .collect()
}

#[test]
fn root_controller_drives_cpu_inputs() {
    let tree = reference_board();
    let mut machine = ModelMachine::default();
    let built = build_machine(&tree, &mut machine, &arm_config()).unwrap();

    let vic = device_of(&built, &tree, "/soc/interrupt-controller@10140000");
    let cpu = CpuId(0);
    let outputs: Vec<_> = machine
        .gpio_connections()
        .iter()
        .filter(|c| c.device == vic)
        .map(|c| (c.line, c.sink))
        .collect();
    assert_eq!(
        outputs,
        [
            (0, IrqSink::Cpu { cpu, line: 0 }),
            (1, IrqSink::Cpu { cpu, line: 1 }),
        ]
    );
}

#[test]
fn devices_connect_to_the_line_they_name() {
    let tree = reference_board();
    let mut machine = ModelMachine::default();
    let built = build_machine(&tree, &mut machine, &arm_config()).unwrap();

    let vic = device_of(&built, &tree, "/soc/interrupt-controller@10140000");
    let line = |line| IrqSink::Device { device: vic, line };
    let uart = device_of(&built, &tree, "/soc/uart@101f1000");
    let timer = device_of(&built, &tree, "/soc/timer@101e2000");
    let gpio = device_of(&built, &tree, "/soc/gpio@101e4000");
    assert_eq!(irqs_from(&machine, uart), [(0, line(12))]);
    assert_eq!(irqs_from(&machine, timer), [(0, line(4))]);
    assert_eq!(irqs_from(&machine, gpio), [(0, line(6))]);

    // The KMI placeholder has no outputs; its row is skipped.
    let kmi = device_of(&built, &tree, "/soc/kmi@10006000");
    assert!(irqs_from(&machine, kmi).is_empty());
    assert_eq!(machine.irq_connections().len(), 3);

    let record = built
        .registry
        .get(node(&tree, "/soc/interrupt-controller@10140000"))
        .unwrap();
    assert_eq!(record.irq_sinks.len(), 13);
    assert_eq!(record.irq_sinks[12], line(12));
}

#[test]
fn controller_is_sized_by_its_highest_line() {
    let tree = gic_board(|b| {
        uart(b, 0x1c09_0000, &[0, 2, 4]);
        uart(b, 0x1c0a_0000, &[0, 0, 4]);
        uart(b, 0x1c0b_0000, &[0, 5, 4]);
    });
    let mut machine = ModelMachine::default();
    let built = build_machine(&tree, &mut machine, &arm_config()).unwrap();

    let gic = device_of(&built, &tree, "/interrupt-controller@2c001000");
    let record = built.registry.get(node(&tree, "/interrupt-controller@2c001000")).unwrap();
    assert_eq!(record.irq_sinks.len(), 6);

    let line = |line| IrqSink::Device { device: gic, line };
    for (path, expected) in [
        ("/uart@1c090000", 2),
        ("/uart@1c0a0000", 0),
        ("/uart@1c0b0000", 5),
    ] {
        let uart = device_of(&built, &tree, path);
        assert_eq!(irqs_from(&machine, uart), [(0, line(expected))], "{path}");
    }

    // Both register banks are mapped.
    let banks = machine
        .mmio_mappings()
        .iter()
        .filter(|m| m.device == gic)
        .count();
    assert_eq!(banks, 2);
}

#[test]
fn unresolvable_and_self_parents_are_skipped() {
    let tree = gic_board(|b| {
        uart(b, 0x1c09_0000, &[0, 1, 4]);

        let orphan = b.begin_node("uart@1c0a0000");
        b.property_string("compatible", "arm,pl011")
            .property_array_u32("reg", &[0x1c0a_0000, 0x1000])
            .property_u32("interrupt-parent", 0x77)
            .property_u32("interrupts", 3);
        b.end_node(orphan).unwrap();

        let vic = b.begin_node("interrupt-controller@10140000");
        b.property_string("compatible", "arm,pl190")
            .property_null("interrupt-controller")
            .property_array_u32("reg", &[0x1014_0000, 0x1000])
            .property_u32("interrupt-parent", 3)
            .property_u32("interrupts", 9)
            .property_phandle(3);
        b.end_node(vic).unwrap();
    });
    let mut machine = ModelMachine::default();
    let built = build_machine(&tree, &mut machine, &arm_config()).unwrap();

    let orphan = device_of(&built, &tree, "/uart@1c0a0000");
    let vic = device_of(&built, &tree, "/interrupt-controller@10140000");
    assert!(irqs_from(&machine, orphan).is_empty());
    assert!(irqs_from(&machine, vic).is_empty());
    assert_eq!(machine.irq_connections().len(), 1);

    // Nothing targets the VIC, so it has no inputs allocated.
    let record = built
        .registry
        .get(node(&tree, "/interrupt-controller@10140000"))
        .unwrap();
    assert!(record.irq_sinks.is_empty());
}

#[test]
fn controllers_cascade() {
    let tree = gic_board(|b| {
        let vic = b.begin_node("interrupt-controller@10140000");
        b.property_string("compatible", "arm,pl190")
            .property_null("interrupt-controller")
            .property_u32("#interrupt-cells", 1)
            .property_u32("#address-cells", 1)
            .property_u32("#size-cells", 1)
            .property_array_u32("reg", &[0x1014_0000, 0x1000])
            .property_array_u32("interrupts", &[0, 7, 4])
            .property_phandle(3);
        let uart = b.begin_node("uart@10141000");
        b.property_string("compatible", "arm,pl011")
            .property_array_u32("reg", &[0x1014_1000, 0x1000])
            .property_u32("interrupt-parent", 3)
            .property_u32("interrupts", 9);
        b.end_node(uart).unwrap();
        b.end_node(vic).unwrap();
    });
    let mut machine = ModelMachine::default();
    let built = build_machine(&tree, &mut machine, &arm_config()).unwrap();

    let gic = device_of(&built, &tree, "/interrupt-controller@2c001000");
    let vic = device_of(&built, &tree, "/interrupt-controller@10140000");
    let uart = device_of(&built, &tree, "/interrupt-controller@10140000/uart@10141000");
    assert_eq!(
        irqs_from(&machine, vic),
        [(0, IrqSink::Device { device: gic, line: 7 })]
    );
    assert_eq!(
        irqs_from(&machine, uart),
        [(0, IrqSink::Device { device: vic, line: 9 })]
    );
}

#[test]
fn lines_beyond_the_controller_are_dropped() {
    fn noisy(b: &mut DeviceTreeBuilder) {
        let node = b.begin_node("rtc@10008000");
        b.property_string("compatible", "arm,pl031")
            .property_array_u32("reg", &[0x1000_8000, 0x1000])
            .property_u32("interrupts", 40);
        b.end_node(node).unwrap();
    }
    let tree = board(&BoardOptions {
        extra_soc_nodes: noisy,
        ..BoardOptions::default()
    });
    let mut machine = ModelMachine::default();
    let built = build_machine(&tree, &mut machine, &arm_config()).unwrap();

    let record = built
        .registry
        .get(node(&tree, "/soc/interrupt-controller@10140000"))
        .unwrap();
    assert_eq!(record.irq_sinks.len(), 32);
    let rtc = device_of(&built, &tree, "/soc/rtc@10008000");
    assert!(irqs_from(&machine, rtc).is_empty());
    let uart = device_of(&built, &tree, "/soc/uart@101f1000");
    assert_eq!(irqs_from(&machine, uart).len(), 1);
}

#[test]
fn huge_line_numbers_do_not_size_the_controller() {
    let tree = gic_board(|b| {
        uart(b, 0x1c09_0000, &[0, 0xffff_ffff, 4]);
        uart(b, 0x1c0a_0000, &[0, 3, 4]);
    });
    let mut machine = ModelMachine::default();
    let built = build_machine(&tree, &mut machine, &arm_config()).unwrap();

    let record = built
        .registry
        .get(node(&tree, "/interrupt-controller@2c001000"))
        .unwrap();
    assert_eq!(record.irq_sinks.len(), 4);

    let noisy = device_of(&built, &tree, "/uart@1c090000");
    assert!(irqs_from(&machine, noisy).is_empty());
    let gic = device_of(&built, &tree, "/interrupt-controller@2c001000");
    let quiet = device_of(&built, &tree, "/uart@1c0a0000");
    assert_eq!(
        irqs_from(&machine, quiet),
        [(0, IrqSink::Device { device: gic, line: 3 })]
    );
}

#[test]
fn architecture_without_cpu_lines_still_wires_devices() {
    let tree = reference_board();
    let mut machine = ModelMachine::default();
    let config = MachineConfig {
        arch: CpuArch::None,
        ..arm_config()
    };
    build_machine(&tree, &mut machine, &config).unwrap();

    assert!(machine
        .gpio_connections()
        .iter()
        .all(|c| !matches!(c.sink, IrqSink::Cpu { .. })));
    assert_eq!(machine.irq_connections().len(), 3);
}
