use std::path::Path;
use std::process::{Command, Output};

use vm_fdt::FdtWriter;

fn blob(with_cpus: bool, with_interrupt_parent: bool) -> Vec<u8> {
    let mut fdt = FdtWriter::new().unwrap();
    let root = fdt.begin_node("").unwrap();
    fdt.property_string("model", "smoke-board").unwrap();
    fdt.property_u32("#address-cells", 1).unwrap();
    fdt.property_u32("#size-cells", 1).unwrap();
    if with_interrupt_parent {
        fdt.property_u32("interrupt-parent", 1).unwrap();
    }

    if with_cpus {
        let cpus = fdt.begin_node("cpus").unwrap();
        let cpu = fdt.begin_node("cpu@0").unwrap();
        fdt.property_string("device_type", "cpu").unwrap();
        fdt.property_string("compatible", "arm,arm926").unwrap();
        fdt.end_node(cpu).unwrap();
        fdt.end_node(cpus).unwrap();
    }

    let memory = fdt.begin_node("memory@0").unwrap();
    fdt.property_array_u32("reg", &[0, 0x0400_0000]).unwrap();
    fdt.end_node(memory).unwrap();

    let vic = fdt.begin_node("intc@10140000").unwrap();
    fdt.property_string("compatible", "arm,pl190").unwrap();
    fdt.property_null("interrupt-controller").unwrap();
    fdt.property_u32("#interrupt-cells", 1).unwrap();
    fdt.property_array_u32("reg", &[0x1014_0000, 0x1000]).unwrap();
    fdt.property_phandle(1).unwrap();
    fdt.end_node(vic).unwrap();

    let uart = fdt.begin_node("uart@101f1000").unwrap();
    fdt.property_string("compatible", "arm,pl011").unwrap();
    fdt.property_array_u32("reg", &[0x101f_1000, 0x1000]).unwrap();
    fdt.property_u32("interrupts", 12).unwrap();
    fdt.end_node(uart).unwrap();

    fdt.end_node(root).unwrap();
    fdt.finish().unwrap()
}

fn write_blob(dir: &Path, blob: &[u8]) -> String {
    let path = dir.join("board.dtb");
    std::fs::write(&path, blob).unwrap();
    path.to_str().unwrap().to_string()
}

fn run(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_aero-fdt-machine"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run aero-fdt-machine")
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn prints_machine_as_json() {
    let tmp = tempfile::tempdir().unwrap();
    let dtb = write_blob(tmp.path(), &blob(true, true));

    let output = run(&["--dtb", &dtb, "--arch", "arm", "--json"]);
    assert!(output.status.success(), "stderr:\n{}", stderr(&output));

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["machine"]["model"], "smoke-board");
    let types: Vec<&str> = report["backend"]["devices"]
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["type_name"].as_str().unwrap())
        .collect();
    assert_eq!(types, ["pl190", "pl011"]);
    assert_eq!(report["backend"]["irqs"].as_array().unwrap().len(), 1);
    // ARM: IRQ and FIQ.
    assert_eq!(report["backend"]["gpios"].as_array().unwrap().len(), 2);
}

#[test]
fn text_output_lists_nodes() {
    let tmp = tempfile::tempdir().unwrap();
    let dtb = write_blob(tmp.path(), &blob(true, true));

    let output = run(&["--dtb", &dtb]);
    assert!(output.status.success(), "stderr:\n{}", stderr(&output));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("model: smoke-board"), "{stdout}");
    assert!(stdout.contains("/uart@101f1000 [leaf-device] dev1 (pl011)"), "{stdout}");
}

#[test]
fn config_file_and_flags_combine() {
    let tmp = tempfile::tempdir().unwrap();
    let dtb = write_blob(tmp.path(), &blob(false, true));
    let config = tmp.path().join("machine.json");
    std::fs::write(
        &config,
        r#"{ "cpu_type": "arm926", "default_cpu_freq_hz": 1000000 }"#,
    )
    .unwrap();

    let output = run(&[
        "--dtb",
        &dtb,
        "--config",
        config.to_str().unwrap(),
        "--block",
        "pl011",
        "--json",
    ]);
    assert!(output.status.success(), "stderr:\n{}", stderr(&output));

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["backend"]["cpus"][0]["model"], "arm926");
    assert_eq!(report["backend"]["cpus"][0]["freq_hz"], 1_000_000);
    let uart = report["machine"]["nodes"]
        .as_array()
        .unwrap()
        .iter()
        .find(|n| n["path"] == "/uart@101f1000")
        .unwrap();
    assert_eq!(uart["kind"], "placeholder");
}

#[test]
fn build_errors_exit_non_zero() {
    let tmp = tempfile::tempdir().unwrap();
    let dtb = write_blob(tmp.path(), &blob(true, false));

    let output = run(&["--dtb", &dtb]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("interrupt-parent"), "{}", stderr(&output));
}

#[test]
fn unknown_config_fields_are_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let dtb = write_blob(tmp.path(), &blob(true, true));
    let config = tmp.path().join("machine.json");
    std::fs::write(&config, r#"{ "cpu": "arm926" }"#).unwrap();

    let output = run(&["--dtb", &dtb, "--config", config.to_str().unwrap()]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("invalid config"), "{}", stderr(&output));
}
