//! In-memory reference backend.
//!
//! [`ModelMachine`] does not emulate anything; it validates every request against a
//! [`DeviceCatalog`] and records the resulting topology, which makes it useful both for tests and
//! for inspecting what a device tree would build.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::backend::{
    BackendError, BusId, BusKind, ClockId, CpuId, DeviceId, IrqSink, LinkTarget, MachineBackend,
};

/// Type name given to placeholder devices.
pub const PLACEHOLDER_TYPE: &str = "unimplemented-device";

/// Shape of a constructible device type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeviceModel {
    pub type_name: String,
    pub mmio_regions: usize,
    pub irq_outputs: u32,
    pub gpio_inputs: u32,
    pub gpio_outputs: u32,
    pub child_bus: Option<BusKind>,
}

impl DeviceModel {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            mmio_regions: 0,
            irq_outputs: 0,
            gpio_inputs: 0,
            gpio_outputs: 0,
            child_bus: None,
        }
    }

    pub fn mmio(mut self, regions: usize) -> Self {
        self.mmio_regions = regions;
        self
    }

    pub fn irqs(mut self, outputs: u32) -> Self {
        self.irq_outputs = outputs;
        self
    }

    pub fn gpio(mut self, inputs: u32, outputs: u32) -> Self {
        self.gpio_inputs = inputs;
        self.gpio_outputs = outputs;
        self
    }

    pub fn bus(mut self, kind: BusKind) -> Self {
        self.child_bus = Some(kind);
        self
    }
}

/// Device and CPU types a [`ModelMachine`] can create.
#[derive(Clone, Debug, Default)]
pub struct DeviceCatalog {
    devices: BTreeMap<String, DeviceModel>,
    cpus: BTreeMap<String, u32>,
}

impl DeviceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Common ARM, MIPS, PowerPC and MicroBlaze parts.
    pub fn with_defaults() -> Self {
        let mut catalog = Self::new();
        for (cpu, irq_inputs) in [
            ("arm926", 4),
            ("arm1176", 4),
            ("cortex-a7", 4),
            ("cortex-a9", 4),
            ("cortex-a15", 4),
            ("4Kc", 8),
            ("24Kc", 8),
            ("24Kf", 8),
            ("34Kf", 8),
            ("405", 7),
            ("microblaze", 1),
        ] {
            catalog.add_cpu(cpu, irq_inputs);
        }

        for model in [
            DeviceModel::new("pl011").mmio(1).irqs(1),
            DeviceModel::new("pl031").mmio(1).irqs(1),
            DeviceModel::new("pl061").mmio(1).irqs(1).gpio(8, 8),
            DeviceModel::new("pl080").mmio(1).irqs(1),
            DeviceModel::new("pl081").mmio(1).irqs(1),
            DeviceModel::new("pl110").mmio(1).irqs(1),
            DeviceModel::new("pl181").mmio(1).irqs(2),
            DeviceModel::new("pl190").mmio(1).irqs(2).gpio(32, 2),
            DeviceModel::new("pl022").mmio(1).irqs(1).bus(BusKind::Spi),
            DeviceModel::new("sp804").mmio(1).irqs(1),
            DeviceModel::new("sp805").mmio(1).irqs(1),
            DeviceModel::new("cortex-a9-gic").mmio(2).gpio(96, 8),
            DeviceModel::new("cortex-a15-gic").mmio(2).gpio(96, 8),
            DeviceModel::new("versatile_i2c").mmio(1).bus(BusKind::I2c),
            DeviceModel::new("ds1338"),
            DeviceModel::new("tmp105").gpio(0, 1),
            DeviceModel::new("m25p80").gpio(1, 0),
            DeviceModel::new("ns16550a").mmio(1).irqs(1),
            DeviceModel::new("xps_intc").mmio(1).gpio(32, 1),
            DeviceModel::new("gpio_keys").gpio(8, 0),
        ] {
            catalog.add_device(model);
        }
        catalog
    }

    pub fn add_device(&mut self, model: DeviceModel) -> &mut Self {
        self.devices.insert(model.type_name.clone(), model);
        self
    }

    pub fn add_cpu(&mut self, model: &str, irq_inputs: u32) -> &mut Self {
        self.cpus.insert(model.to_string(), irq_inputs);
        self
    }

    pub fn device(&self, type_name: &str) -> Option<&DeviceModel> {
        self.devices.get(type_name)
    }

    pub fn cpu_irq_inputs(&self, model: &str) -> Option<u32> {
        self.cpus.get(model).copied()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CpuState {
    pub id: CpuId,
    pub model: String,
    pub freq_hz: u64,
    #[serde(skip)]
    irq_inputs: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeviceState {
    pub id: DeviceId,
    pub type_name: String,
    /// Node name for placeholder devices.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub realized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_bus: Option<BusId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_bus: Option<BusId>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub uint_properties: BTreeMap<String, u64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub link_properties: BTreeMap<String, LinkTarget>,
    #[serde(skip)]
    model: DeviceModel,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BusState {
    pub id: BusId,
    pub kind: BusKind,
    pub controller: DeviceId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Region {
    pub base: u64,
    pub size: u64,
}

impl Region {
    fn new(base: u64, size: u64) -> Result<Self, BackendError> {
        if size == 0 || base.checked_add(size - 1).is_none() {
            return Err(BackendError::InvalidRegion { base, size });
        }
        Ok(Self { base, size })
    }

    fn last(&self) -> u64 {
        self.base + (self.size - 1)
    }

    fn overlaps(&self, other: &Region) -> bool {
        self.base <= other.last() && other.base <= self.last()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MmioMapping {
    pub device: DeviceId,
    pub index: usize,
    #[serde(flatten)]
    pub region: Region,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LineConnection {
    pub device: DeviceId,
    pub line: u32,
    pub sink: IrqSink,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClockState {
    pub id: ClockId,
    pub name: String,
    pub hz: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<ClockId>,
    /// Rate notifications received after creation.
    pub updates: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClockInput {
    pub device: DeviceId,
    pub name: String,
    pub clock: ClockId,
}

/// Recording [`MachineBackend`].
#[derive(Clone, Debug, Serialize)]
pub struct ModelMachine {
    #[serde(skip)]
    catalog: DeviceCatalog,
    cpus: Vec<CpuState>,
    ram: Vec<Region>,
    devices: Vec<DeviceState>,
    buses: Vec<BusState>,
    mmio: Vec<MmioMapping>,
    irqs: Vec<LineConnection>,
    gpios: Vec<LineConnection>,
    clocks: Vec<ClockState>,
    clock_inputs: Vec<ClockInput>,
}

impl Default for ModelMachine {
    fn default() -> Self {
        Self::new(DeviceCatalog::with_defaults())
    }
}

impl ModelMachine {
    pub fn new(catalog: DeviceCatalog) -> Self {
        Self {
            catalog,
            cpus: Vec::new(),
            ram: Vec::new(),
            devices: Vec::new(),
            buses: Vec::new(),
            mmio: Vec::new(),
            irqs: Vec::new(),
            gpios: Vec::new(),
            clocks: Vec::new(),
            clock_inputs: Vec::new(),
        }
    }

    pub fn catalog(&self) -> &DeviceCatalog {
        &self.catalog
    }

    pub fn cpus(&self) -> &[CpuState] {
        &self.cpus
    }

    pub fn ram(&self) -> &[Region] {
        &self.ram
    }

    pub fn devices(&self) -> &[DeviceState] {
        &self.devices
    }

    pub fn device(&self, id: DeviceId) -> Option<&DeviceState> {
        self.devices.get(id.0 as usize)
    }

    /// Devices of one type, in creation order.
    pub fn devices_of_type<'a>(
        &'a self,
        type_name: &'a str,
    ) -> impl Iterator<Item = &'a DeviceState> + 'a {
        self.devices
            .iter()
            .filter(move |device| device.type_name == type_name)
    }

    pub fn buses(&self) -> &[BusState] {
        &self.buses
    }

    pub fn mmio_mappings(&self) -> &[MmioMapping] {
        &self.mmio
    }

    pub fn irq_connections(&self) -> &[LineConnection] {
        &self.irqs
    }

    pub fn gpio_connections(&self) -> &[LineConnection] {
        &self.gpios
    }

    pub fn clocks(&self) -> &[ClockState] {
        &self.clocks
    }

    pub fn clock(&self, id: ClockId) -> Option<&ClockState> {
        self.clocks.iter().find(|clock| clock.id == id)
    }

    pub fn clock_inputs(&self) -> &[ClockInput] {
        &self.clock_inputs
    }

    fn clock_mut(&mut self, id: ClockId) -> Result<&mut ClockState, BackendError> {
        self.clocks
            .iter_mut()
            .find(|clock| clock.id == id)
            .ok_or(BackendError::UnknownClock(id))
    }

    fn device_state(&self, id: DeviceId) -> Result<&DeviceState, BackendError> {
        self.device(id).ok_or(BackendError::UnknownDevice(id))
    }

    fn device_state_mut(&mut self, id: DeviceId) -> Result<&mut DeviceState, BackendError> {
        self.devices
            .get_mut(id.0 as usize)
            .ok_or(BackendError::UnknownDevice(id))
    }

    fn unrealized_mut(&mut self, id: DeviceId) -> Result<&mut DeviceState, BackendError> {
        let device = self.device_state_mut(id)?;
        if device.realized {
            return Err(BackendError::AlreadyRealized { device: id });
        }
        Ok(device)
    }

    fn claim(&self, region: Region) -> Result<(), BackendError> {
        let conflict = |existing: String| BackendError::Overlap {
            base: region.base,
            size: region.size,
            existing,
        };
        if let Some(ram) = self.ram.iter().find(|ram| ram.overlaps(&region)) {
            return Err(conflict(format!("RAM at {:#x}", ram.base)));
        }
        if let Some(mapping) = self.mmio.iter().find(|m| m.region.overlaps(&region)) {
            return Err(conflict(format!(
                "{} region {} at {:#x}",
                mapping.device, mapping.index, mapping.region.base
            )));
        }
        Ok(())
    }

    fn check_sink(&self, sink: IrqSink) -> Result<(), BackendError> {
        match sink {
            IrqSink::Cpu { cpu, line } => {
                let state = self
                    .cpus
                    .get(cpu.0 as usize)
                    .ok_or(BackendError::UnknownCpu(cpu))?;
                if line >= state.irq_inputs {
                    return Err(BackendError::Other(format!(
                        "{cpu} has no interrupt input {line}"
                    )));
                }
            }
            IrqSink::Device { device, line } => {
                if line >= self.device_state(device)?.model.gpio_inputs {
                    return Err(BackendError::NoSuchLine {
                        device,
                        line,
                        what: "gpio input",
                    });
                }
            }
        }
        Ok(())
    }

    fn push_device(&mut self, model: DeviceModel, label: Option<String>) -> DeviceId {
        let id = DeviceId(self.devices.len() as u32);
        let child_bus = model.child_bus.map(|kind| {
            let bus = BusId(self.buses.len() as u32);
            self.buses.push(BusState {
                id: bus,
                kind,
                controller: id,
            });
            bus
        });
        self.devices.push(DeviceState {
            id,
            type_name: model.type_name.clone(),
            label,
            realized: false,
            parent_bus: None,
            child_bus,
            uint_properties: BTreeMap::new(),
            link_properties: BTreeMap::new(),
            model,
        });
        id
    }
}

impl MachineBackend for ModelMachine {
    fn create_cpu(&mut self, model: &str, freq_hz: u64) -> Option<CpuId> {
        let irq_inputs = self.catalog.cpu_irq_inputs(model)?;
        let id = CpuId(self.cpus.len() as u32);
        self.cpus.push(CpuState {
            id,
            model: model.to_string(),
            freq_hz,
            irq_inputs,
        });
        Some(id)
    }

    fn map_ram(&mut self, base: u64, size: u64) -> Result<(), BackendError> {
        let region = Region::new(base, size)?;
        self.claim(region)?;
        self.ram.push(region);
        Ok(())
    }

    fn try_create_device(&mut self, type_name: &str) -> Option<DeviceId> {
        let model = self.catalog.device(type_name)?.clone();
        Some(self.push_device(model, None))
    }

    fn create_placeholder(&mut self, name: &str, base: u64, size: u64) -> Option<DeviceId> {
        let region = Region::new(base, size).ok()?;
        self.claim(region).ok()?;
        let id = self.push_device(
            DeviceModel::new(PLACEHOLDER_TYPE).mmio(1),
            Some(name.to_string()),
        );
        if let Some(device) = self.devices.get_mut(id.0 as usize) {
            device.realized = true;
        }
        self.mmio.push(MmioMapping {
            device: id,
            index: 0,
            region,
        });
        Some(id)
    }

    fn set_link_property(
        &mut self,
        device: DeviceId,
        name: &str,
        target: LinkTarget,
    ) -> Result<(), BackendError> {
        self.unrealized_mut(device)?
            .link_properties
            .insert(name.to_string(), target);
        Ok(())
    }

    fn set_uint_property(
        &mut self,
        device: DeviceId,
        name: &str,
        value: u64,
    ) -> Result<(), BackendError> {
        self.unrealized_mut(device)?
            .uint_properties
            .insert(name.to_string(), value);
        Ok(())
    }

    fn realize(&mut self, device: DeviceId) -> Result<(), BackendError> {
        self.unrealized_mut(device)?.realized = true;
        Ok(())
    }

    fn mmio_map(
        &mut self,
        device: DeviceId,
        index: usize,
        base: u64,
        size: u64,
    ) -> Result<(), BackendError> {
        let state = self.device_state(device)?;
        if !state.realized {
            return Err(BackendError::NotRealized { device });
        }
        if index >= state.model.mmio_regions {
            return Err(BackendError::NoMmioRegion { device, index });
        }
        let region = Region::new(base, size)?;
        self.claim(region)?;
        self.mmio.push(MmioMapping {
            device,
            index,
            region,
        });
        Ok(())
    }

    fn child_bus(&self, device: DeviceId, kind: BusKind) -> Option<BusId> {
        let bus = self.device(device)?.child_bus?;
        self.buses
            .get(bus.0 as usize)
            .filter(|state| state.kind == kind)
            .map(|state| state.id)
    }

    fn realize_on_bus(&mut self, device: DeviceId, bus: BusId) -> Result<(), BackendError> {
        if self.buses.get(bus.0 as usize).is_none() {
            return Err(BackendError::UnknownBus(bus));
        }
        let state = self.unrealized_mut(device)?;
        state.parent_bus = Some(bus);
        state.realized = true;
        Ok(())
    }

    fn gpio_in(&self, device: DeviceId, line: u32) -> Result<IrqSink, BackendError> {
        let sink = IrqSink::Device { device, line };
        self.check_sink(sink)?;
        Ok(sink)
    }

    fn connect_irq(
        &mut self,
        device: DeviceId,
        index: u32,
        sink: IrqSink,
    ) -> Result<(), BackendError> {
        if index >= self.device_state(device)?.model.irq_outputs {
            return Err(BackendError::NoSuchLine {
                device,
                line: index,
                what: "irq output",
            });
        }
        self.check_sink(sink)?;
        self.irqs.push(LineConnection {
            device,
            line: index,
            sink,
        });
        Ok(())
    }

    fn connect_gpio_out(
        &mut self,
        device: DeviceId,
        line: u32,
        sink: IrqSink,
    ) -> Result<(), BackendError> {
        if line >= self.device_state(device)?.model.gpio_outputs {
            return Err(BackendError::NoSuchLine {
                device,
                line,
                what: "gpio output",
            });
        }
        self.check_sink(sink)?;
        self.gpios.push(LineConnection { device, line, sink });
        Ok(())
    }

    fn create_clock(&mut self, clock: ClockId, name: &str, hz: u64) -> Result<(), BackendError> {
        if self.clock(clock).is_some() {
            return Err(BackendError::ClockExists(clock));
        }
        self.clocks.push(ClockState {
            id: clock,
            name: name.to_string(),
            hz,
            source: None,
            updates: 0,
        });
        Ok(())
    }

    fn set_clock_source(&mut self, clock: ClockId, source: ClockId) -> Result<(), BackendError> {
        if self.clock(source).is_none() {
            return Err(BackendError::UnknownClock(source));
        }
        self.clock_mut(clock)?.source = Some(source);
        Ok(())
    }

    fn set_clock_hz(&mut self, clock: ClockId, hz: u64) -> Result<(), BackendError> {
        let state = self.clock_mut(clock)?;
        state.hz = hz;
        state.updates += 1;
        Ok(())
    }

    fn connect_clock_in(
        &mut self,
        device: DeviceId,
        name: &str,
        clock: ClockId,
    ) -> Result<(), BackendError> {
        self.device_state(device)?;
        if self.clock(clock).is_none() {
            return Err(BackendError::UnknownClock(clock));
        }
        self.clock_inputs.push(ClockInput {
            device,
            name: name.to_string(),
            clock,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlapping_regions_are_refused() {
        let mut machine = ModelMachine::default();
        machine.map_ram(0x4000_0000, 0x1000_0000).unwrap();

        let uart = machine.try_create_device("pl011").unwrap();
        machine.realize(uart).unwrap();
        assert!(matches!(
            machine.mmio_map(uart, 0, 0x4000_1000, 0x1000),
            Err(BackendError::Overlap { .. })
        ));
        machine.mmio_map(uart, 0, 0x1000_0000, 0x1000).unwrap();
        assert_eq!(
            machine.create_placeholder("ghost", 0x1000_0800, 0x100),
            None
        );
        assert!(machine.create_placeholder("ghost", 0x2000_0000, 0x100).is_some());
    }

    #[test]
    fn properties_must_precede_realize() {
        let mut machine = ModelMachine::default();
        let dma = machine.try_create_device("pl080").unwrap();
        machine
            .set_link_property(dma, "downstream", LinkTarget::SystemMemory)
            .unwrap();
        machine.realize(dma).unwrap();
        assert_eq!(
            machine.set_uint_property(dma, "x", 1),
            Err(BackendError::AlreadyRealized { device: dma })
        );
        assert_eq!(
            machine.realize(dma),
            Err(BackendError::AlreadyRealized { device: dma })
        );
    }

    #[test]
    fn lines_are_bounded_by_the_model() {
        let mut machine = ModelMachine::default();
        let vic = machine.try_create_device("pl190").unwrap();
        let uart = machine.try_create_device("pl011").unwrap();
        let sink = machine.gpio_in(vic, 31).unwrap();
        assert!(machine.gpio_in(vic, 32).is_err());
        machine.connect_irq(uart, 0, sink).unwrap();
        assert!(machine.connect_irq(uart, 1, sink).is_err());

        let cpu = machine.create_cpu("arm926", 0).unwrap();
        machine
            .connect_gpio_out(vic, 0, machine.cpu_irq_in(cpu, 0))
            .unwrap();
        assert!(machine
            .connect_gpio_out(vic, 1, machine.cpu_irq_in(cpu, 9))
            .is_err());
    }

    #[test]
    fn bus_controllers_expose_typed_child_buses() {
        let mut machine = ModelMachine::default();
        let i2c = machine.try_create_device("versatile_i2c").unwrap();
        let bus = machine.child_bus(i2c, BusKind::I2c).unwrap();
        assert_eq!(machine.child_bus(i2c, BusKind::Spi), None);

        let rtc = machine.try_create_device("ds1338").unwrap();
        machine.set_uint_property(rtc, "address", 0x68).unwrap();
        machine.realize_on_bus(rtc, bus).unwrap();
        assert_eq!(machine.device(rtc).unwrap().parent_bus, Some(bus));
    }

    #[test]
    fn clocks_must_exist_before_use() {
        let mut machine = ModelMachine::default();
        let uart = machine.try_create_device("pl011").unwrap();
        let (osc, pclk) = (ClockId(0), ClockId(1));
        assert_eq!(
            machine.connect_clock_in(uart, "uartclk", osc),
            Err(BackendError::UnknownClock(osc))
        );

        machine.create_clock(osc, "osc", 24_000_000).unwrap();
        machine.create_clock(pclk, "pclk", 0).unwrap();
        assert_eq!(
            machine.create_clock(osc, "osc", 1),
            Err(BackendError::ClockExists(osc))
        );
        machine.set_clock_source(pclk, osc).unwrap();
        machine.set_clock_hz(pclk, 12_000_000).unwrap();
        machine.connect_clock_in(uart, "uartclk", pclk).unwrap();

        let state = machine.clock(pclk).unwrap();
        assert_eq!((state.hz, state.source, state.updates), (12_000_000, Some(osc), 1));
        assert_eq!(
            machine.set_clock_hz(ClockId(5), 1),
            Err(BackendError::UnknownClock(ClockId(5)))
        );
    }

    #[test]
    fn region_extent_reaching_the_top_of_memory_is_valid() {
        assert!(Region::new(u64::MAX, 1).is_ok());
        assert!(Region::new(u64::MAX, 2).is_err());
        assert!(Region::new(0, 0).is_err());
    }
}
