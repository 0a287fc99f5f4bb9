#![allow(dead_code)]

use aero_fdt::{DeviceTree, DeviceTreeBuilder, NodeId};
use aero_fdt_machine::{CpuArch, MachineConfig};

pub const VIC_PHANDLE: u32 = 1;
pub const GPIO_PHANDLE: u32 = 2;
pub const OSC_PHANDLE: u32 = 10;
pub const PCLK_PHANDLE: u32 = 11;

pub const RAM_SIZE: u64 = 0x0800_0000;

/// Knobs for [`board`]; the default is a complete single-core board.
pub struct BoardOptions {
    pub root_interrupt_parent: Option<u32>,
    pub cpus: usize,
    pub memory: bool,
    /// Extra nodes appended inside `/soc`.
    pub extra_soc_nodes: fn(&mut DeviceTreeBuilder),
}

impl Default for BoardOptions {
    fn default() -> Self {
        Self {
            root_interrupt_parent: Some(VIC_PHANDLE),
            cpus: 1,
            memory: true,
            extra_soc_nodes: |_| {},
        }
    }
}

pub fn arm_config() -> MachineConfig {
    MachineConfig {
        arch: CpuArch::Arm,
        default_cpu_freq_hz: 200_000_000,
        ..MachineConfig::default()
    }
}

pub fn reference_board() -> DeviceTree {
    board(&BoardOptions::default())
}

/// A small Versatile-style board: one VIC, UART, timer, GPIO controller with a key consumer,
/// a blocklisted KMI, an unknown device, an I2C bus with an RTC and a two-level clock tree.
pub fn board(options: &BoardOptions) -> DeviceTree {
    let mut b = DeviceTreeBuilder::new();
    b.property_string("model", "aero,test-board")
        .property_u32("#address-cells", 1)
        .property_u32("#size-cells", 1);
    if let Some(phandle) = options.root_interrupt_parent {
        b.property_u32("interrupt-parent", phandle);
    }

    if options.cpus > 0 {
        let cpus = b.begin_node("cpus");
        b.property_u32("#address-cells", 1)
            .property_u32("#size-cells", 0);
        for index in 0..options.cpus {
            let cpu = b.begin_node(&format!("cpu@{index}"));
            b.property_string("device_type", "cpu")
                .property_string("compatible", "arm,arm926")
                .property_u32("reg", index as u32);
            b.end_node(cpu).unwrap();
        }
        b.end_node(cpus).unwrap();
    }

    if options.memory {
        let memory = b.begin_node("memory@0");
        b.property_string("device_type", "memory")
            .property_array_u32("reg", &[0, RAM_SIZE as u32]);
        b.end_node(memory).unwrap();
    }

    let osc = b.begin_node("oscillator");
    b.property_string("compatible", "fixed-clock")
        .property_u32("#clock-cells", 0)
        .property_u32("clock-frequency", 24_000_000)
        .property_phandle(OSC_PHANDLE);
    b.end_node(osc).unwrap();

    let pclk = b.begin_node("pclk");
    b.property_string("compatible", "fixed-factor-clock")
        .property_u32("#clock-cells", 0)
        .property_u32("clocks", OSC_PHANDLE)
        .property_u32("clock-div", 2)
        .property_phandle(PCLK_PHANDLE);
    b.end_node(pclk).unwrap();

    let soc = b.begin_node("soc");
    b.property_string("compatible", "simple-bus")
        .property_u32("#address-cells", 1)
        .property_u32("#size-cells", 1)
        .property_null("ranges");

    let vic = b.begin_node("interrupt-controller@10140000");
    b.property_string("compatible", "arm,pl190")
        .property_null("interrupt-controller")
        .property_u32("#interrupt-cells", 1)
        .property_array_u32("reg", &[0x1014_0000, 0x1000])
        .property_phandle(VIC_PHANDLE);
    b.end_node(vic).unwrap();

    let uart = b.begin_node("uart@101f1000");
    b.property_string_list("compatible", &["arm,pl011", "arm,primecell"])
        .property_array_u32("reg", &[0x101f_1000, 0x1000])
        .property_u32("interrupts", 12)
        .property_u32("clocks", PCLK_PHANDLE)
        .property_string("clock-names", "uartclk");
    b.end_node(uart).unwrap();

    let timer = b.begin_node("timer@101e2000");
    b.property_string("compatible", "arm,sp804")
        .property_array_u32("reg", &[0x101e_2000, 0x1000])
        .property_u32("interrupts", 4)
        .property_array_u32("clocks", &[PCLK_PHANDLE, PCLK_PHANDLE])
        .property_string_list("clock-names", &["timclk", "apb_pclk"]);
    b.end_node(timer).unwrap();

    let gpio = b.begin_node("gpio@101e4000");
    b.property_string("compatible", "arm,pl061")
        .property_null("gpio-controller")
        .property_u32("#gpio-cells", 2)
        .property_array_u32("reg", &[0x101e_4000, 0x1000])
        .property_u32("interrupts", 6)
        .property_phandle(GPIO_PHANDLE);
    b.end_node(gpio).unwrap();

    let keys = b.begin_node("keys");
    b.property_string("compatible", "gpio-keys")
        .property_array_u32("gpios", &[GPIO_PHANDLE, 3, 0, GPIO_PHANDLE, 5, 0]);
    b.end_node(keys).unwrap();

    let kmi = b.begin_node("kmi@10006000");
    b.property_string("compatible", "arm,pl050")
        .property_array_u32("reg", &[0x1000_6000, 0x1000])
        .property_u32("interrupts", 3);
    b.end_node(kmi).unwrap();

    let widget = b.begin_node("widget@10007000");
    b.property_string("compatible", "acme,widget")
        .property_array_u32("reg", &[0x1000_7000, 0x100, 0x1000_7100, 0x100]);
    b.end_node(widget).unwrap();

    let i2c = b.begin_node("i2c@10002000");
    b.property_string("compatible", "arm,versatile-i2c")
        .property_array_u32("reg", &[0x1000_2000, 0x1000])
        .property_u32("#address-cells", 1)
        .property_u32("#size-cells", 0);
    let rtc = b.begin_node("rtc@68");
    b.property_string("compatible", "dallas,ds1338")
        .property_u32("reg", 0x68);
    b.end_node(rtc).unwrap();
    let sensor = b.begin_node("sensor");
    b.property_string("compatible", "acme,sensor");
    b.end_node(sensor).unwrap();
    b.end_node(i2c).unwrap();

    (options.extra_soc_nodes)(&mut b);
    b.end_node(soc).unwrap();
    b.finish().unwrap()
}

pub fn node(tree: &DeviceTree, path: &str) -> NodeId {
    tree.find_path(path)
        .unwrap_or_else(|| panic!("{path} not in tree"))
}
