// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! End-to-end exercise of a directly-assigned device against a fake host
//! platform: construction, bus registration, MSI enablement through the
//! masked configuration path, interrupt re-injection and BAR traffic.

use std::sync::{Arc, Mutex};

use pci_direct::{
    BarLayout, DirectPciDevice, GuestIrqSink, HostPlatform, HostPlatformError, IrqTrigger,
    MmioRegion, NUM_BAR_REGS, NUM_CONFIGURATION_REGISTERS, PassthroughTarget, PciBdf, PciBus,
};
use vm_memory::GuestAddress;

struct FakeRegion {
    mem: Mutex<Vec<u8>>,
}

impl MmioRegion for FakeRegion {
    fn read(&self, offset: u64, data: &mut [u8]) {
        let mem = self.mem.lock().unwrap();
        data.copy_from_slice(&mem[offset as usize..offset as usize + data.len()]);
    }

    fn write(&self, offset: u64, data: &[u8]) {
        let mut mem = self.mem.lock().unwrap();
        mem[offset as usize..offset as usize + data.len()].copy_from_slice(data);
    }

    fn len(&self) -> u64 {
        self.mem.lock().unwrap().len() as u64
    }
}

struct FakeHost {
    config: Mutex<[u32; NUM_CONFIGURATION_REGISTERS]>,
    layout: [BarLayout; NUM_BAR_REGS],
    msi_cap: Option<u8>,
    regions: Mutex<Vec<Arc<FakeRegion>>>,
}

impl FakeHost {
    fn new() -> Self {
        let mut config = [0u32; NUM_CONFIGURATION_REGISTERS];
        config[0] = 0x5678_1234; // vendor/device
        config[1] = 0x0010_0003; // io+mem decode enabled
        config[4] = 0x1000; // one 4KB memory BAR
        config[15] = 0x0000_0109; // pin A, line 9

        // MSI capability at 0x50: 1 vector, 64-bit addressing, with the
        // message the device was left programmed with.
        config[0x50 / 4] = 0x0080_0005;
        config[0x50 / 4 + 1] = 0xfee0_0000;
        config[0x50 / 4 + 2] = 0x0;
        config[0x50 / 4 + 3] = 0x40;

        let mut layout = [BarLayout::default(); NUM_BAR_REGS];
        layout[0] = BarLayout {
            base: 0x1000,
            size: 0x1000,
        };

        FakeHost {
            config: Mutex::new(config),
            layout,
            msi_cap: Some(0x50),
            regions: Mutex::new(Vec::new()),
        }
    }
}

impl HostPlatform for FakeHost {
    fn config_read(&self, _bdf: PciBdf, reg_idx: usize) -> u32 {
        self.config.lock().unwrap()[reg_idx]
    }

    fn config_write(&self, _bdf: PciBdf, reg_idx: usize, value: u32) {
        self.config.lock().unwrap()[reg_idx] = value;
    }

    fn bar_layout(&self, _bdf: PciBdf) -> [BarLayout; NUM_BAR_REGS] {
        self.layout
    }

    fn vf_bar_layout(&self, _parent: PciBdf, _vf_index: u32) -> [BarLayout; NUM_BAR_REGS] {
        self.layout
    }

    fn find_capability(&self, _bdf: PciBdf, cap_id: u8) -> Option<u8> {
        match cap_id {
            0x05 => self.msi_cap,
            _ => None,
        }
    }

    fn vf_bdf(&self, parent: PciBdf, _vf_index: u32) -> Result<PciBdf, HostPlatformError> {
        Err(HostPlatformError::VfNotFound(parent, 0))
    }

    fn vf_device_id(&self, _parent: PciBdf) -> u32 {
        0
    }

    fn assign_device(&self, _bdf: PciBdf, _vf: Option<PciBdf>) -> Result<(), HostPlatformError> {
        Ok(())
    }

    fn allocate_io_region(&self, base: u16, _len: u32) -> Result<u16, HostPlatformError> {
        Ok(base)
    }

    fn allocate_mmio_region(
        &self,
        _base: u64,
        len: u64,
    ) -> Result<Arc<dyn MmioRegion>, HostPlatformError> {
        let region = Arc::new(FakeRegion {
            mem: Mutex::new(vec![0; len as usize]),
        });
        self.regions.lock().unwrap().push(region.clone());
        Ok(region)
    }

    fn allocate_irq(
        &self,
        _bdf: PciBdf,
        vector: usize,
        _trigger: IrqTrigger,
    ) -> Result<u32, HostPlatformError> {
        Ok(100 + vector as u32)
    }

    fn notify_irq(&self, _gsi: u32) {}

    fn io_port_read(&self, _port: u16, data: &mut [u8]) {
        data.fill(0);
    }

    fn io_port_write(&self, _port: u16, _data: &[u8]) {}
}

#[derive(Default)]
struct FakeSink {
    raised: Mutex<Vec<(u8, IrqTrigger)>>,
}

impl GuestIrqSink for FakeSink {
    fn raise(&self, vector: u8, trigger: IrqTrigger) {
        self.raised.lock().unwrap().push((vector, trigger));
    }
}

#[test]
fn msi_device_end_to_end() {
    let host = Arc::new(FakeHost::new());
    let sink = Arc::new(FakeSink::default());
    let bdf = PciBdf::new(0, 0, 4, 0);

    let device = DirectPciDevice::new(
        host.clone(),
        sink.clone(),
        PassthroughTarget::Device(bdf),
    )
    .unwrap();
    assert_eq!(device.host_irqs(), &[100]);

    let mut bus = PciBus::new();
    let guest_bdf = bus
        .add_device(Arc::new(Mutex::new(device)), bdf, None)
        .unwrap();
    assert_eq!(guest_bdf.device(), 4);

    // A BAR size probe through the bus sees the masked shadow.
    bus.config_write(guest_bdf, 4, 0xffff_ffff);
    assert_eq!(bus.config_read(guest_bdf, 4), 0xffff_f000);
    bus.config_write(guest_bdf, 4, 0x1000);

    // Nothing is delivered while MSI is still disabled.
    assert!(!bus.handle_host_interrupt(100, IrqTrigger::Edge));
    assert!(sink.raised.lock().unwrap().is_empty());

    // Enable MSI through the masked write path.
    bus.config_write(guest_bdf, 0x50 / 4, 0x0001_0000);

    assert!(bus.handle_host_interrupt(100, IrqTrigger::Edge));
    assert_eq!(
        sink.raised.lock().unwrap().as_slice(),
        &[(0x40, IrqTrigger::Edge)]
    );

    // BAR traffic lands in the mapped host region.
    assert!(bus.mmio_write(GuestAddress(0x1000), &0xc0de_f00du32.to_le_bytes()));
    {
        let regions = host.regions.lock().unwrap();
        let mut data = [0u8; 4];
        regions[0].read(0, &mut data);
        assert_eq!(u32::from_le_bytes(data), 0xc0de_f00d);
    }

    // Reads come back through the same translation.
    let mut data = [0u8; 4];
    assert!(bus.mmio_read(GuestAddress(0x1000), &mut data));
    assert_eq!(u32::from_le_bytes(data), 0xc0de_f00d);

    // An address no BAR covers is not claimed.
    assert!(!bus.mmio_read(GuestAddress(0x4000), &mut data));
}

#[test]
fn missing_virtual_function_aborts_construction() {
    let host = Arc::new(FakeHost::new());
    let sink = Arc::new(FakeSink::default());

    let result = DirectPciDevice::new(
        host,
        sink,
        PassthroughTarget::VirtualFunction {
            parent: PciBdf::new(0, 0, 4, 0),
            index: 3,
        },
    );
    assert!(result.is_err());
}
