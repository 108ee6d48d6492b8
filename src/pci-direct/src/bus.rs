// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use vm_memory::GuestAddress;

use crate::device::{MmioMapping, PciDevice};
use crate::{IrqTrigger, PciBdf};

/// Errors from registering devices on the bus.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum PciBusError {
    /// no free device slot on the bus
    NoPciDeviceSlotAvailable,
    /// device slot {0} already in use
    SlotInUse(PciBdf),
}

/// Routes guest traffic to registered devices.
///
/// Configuration accesses are dispatched by address match; everything else
/// is offered to each device in turn until one claims it. Devices are held
/// behind a mutex, which is also what serializes guest-originated accesses
/// against interrupt-context calls into the same device.
#[derive(Default)]
pub struct PciBus {
    devices: BTreeMap<u16, Arc<Mutex<dyn PciDevice>>>,
}

impl std::fmt::Debug for PciBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PciBus")
            .field("devices", &self.devices.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PciBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches `device` to the bus: at `requested` (or the next free slot
    /// after it) when a reassignment is asked for, at the device's own
    /// `own_bdf` otherwise. Returns the address the device ended up at.
    pub fn add_device(
        &mut self,
        device: Arc<Mutex<dyn PciDevice>>,
        own_bdf: PciBdf,
        requested: Option<PciBdf>,
    ) -> Result<PciBdf, PciBusError> {
        let bdf = match requested {
            None => {
                if self.devices.contains_key(&u16::from(own_bdf)) {
                    return Err(PciBusError::SlotInUse(own_bdf));
                }
                own_bdf
            }
            Some(from) => self.find_free_bdf(from)?,
        };
        self.devices.insert(u16::from(bdf), device);
        Ok(bdf)
    }

    /// First unoccupied address at or after `from`, scanning device slots
    /// on the same bus.
    fn find_free_bdf(&self, from: PciBdf) -> Result<PciBdf, PciBusError> {
        for device in from.device()..32 {
            let candidate = PciBdf::new(from.segment(), from.bus(), device, from.function());
            if !self.devices.contains_key(&u16::from(candidate)) {
                return Ok(candidate);
            }
        }
        Err(PciBusError::NoPciDeviceSlotAvailable)
    }

    pub fn config_read(&self, bdf: PciBdf, reg_idx: usize) -> u32 {
        self.devices
            .get(&u16::from(bdf))
            .map_or(0xffff_ffff, |device| {
                device.lock().unwrap().read_config_register(reg_idx)
            })
    }

    pub fn config_write(&self, bdf: PciBdf, reg_idx: usize, value: u32) {
        if let Some(device) = self.devices.get(&u16::from(bdf)) {
            device.lock().unwrap().write_config_register(reg_idx, value);
        }
    }

    pub fn pio_read(&self, port: u16, data: &mut [u8]) -> bool {
        self.devices
            .values()
            .any(|device| device.lock().unwrap().pio_read(port, data))
    }

    pub fn pio_write(&self, port: u16, data: &[u8]) -> bool {
        self.devices
            .values()
            .any(|device| device.lock().unwrap().pio_write(port, data))
    }

    pub fn mmio_read(&self, addr: GuestAddress, data: &mut [u8]) -> bool {
        self.devices
            .values()
            .any(|device| device.lock().unwrap().mmio_read(addr, data))
    }

    pub fn mmio_write(&self, addr: GuestAddress, data: &[u8]) -> bool {
        self.devices
            .values()
            .any(|device| device.lock().unwrap().mmio_write(addr, data))
    }

    pub fn mmio_map(&self, addr: GuestAddress) -> Option<MmioMapping> {
        self.devices
            .values()
            .find_map(|device| device.lock().unwrap().mmio_map(addr))
    }

    pub fn alloc_hint(&self, first: GuestAddress, second: u64) -> Option<MmioMapping> {
        self.devices
            .values()
            .find_map(|device| device.lock().unwrap().alloc_hint(first, second))
    }

    /// Offers a physical interrupt to every device; host lines may be
    /// shared, so delivery does not stop at the first claim.
    pub fn handle_host_interrupt(&self, line: u32, trigger: IrqTrigger) -> bool {
        let mut claimed = false;
        for device in self.devices.values() {
            claimed |= device.lock().unwrap().handle_host_interrupt(line, trigger);
        }
        claimed
    }

    pub fn handle_irq_notify(&self, base_irq: u8, mask: u8) -> bool {
        let mut claimed = false;
        for device in self.devices.values() {
            claimed |= device.lock().unwrap().handle_irq_notify(base_irq, mask);
        }
        claimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DummyDevice {
        port: u16,
        reads: usize,
    }

    impl PciDevice for DummyDevice {
        fn read_config_register(&mut self, reg_idx: usize) -> u32 {
            if reg_idx == 0 { 0x1234_5678 } else { 0 }
        }

        fn write_config_register(&mut self, _reg_idx: usize, _value: u32) {}

        fn pio_read(&mut self, port: u16, _data: &mut [u8]) -> bool {
            if port == self.port {
                self.reads += 1;
                true
            } else {
                false
            }
        }
    }

    fn dummy(port: u16) -> Arc<Mutex<DummyDevice>> {
        Arc::new(Mutex::new(DummyDevice { port, reads: 0 }))
    }

    #[test]
    fn registration_at_own_address() {
        let mut bus = PciBus::new();
        let bdf = PciBdf::new(0, 0, 3, 0);

        assert_eq!(
            bus.add_device(dummy(0x100), bdf, None).unwrap().device(),
            3
        );
        assert!(matches!(
            bus.add_device(dummy(0x100), bdf, None),
            Err(PciBusError::SlotInUse(_))
        ));
    }

    #[test]
    fn registration_finds_a_free_slot() {
        let mut bus = PciBus::new();
        let requested = PciBdf::new(0, 0, 4, 0);

        let first = bus
            .add_device(dummy(0x100), PciBdf::new(0, 0, 1, 0), Some(requested))
            .unwrap();
        assert_eq!(first.device(), 4);

        let second = bus
            .add_device(dummy(0x200), PciBdf::new(0, 0, 2, 0), Some(requested))
            .unwrap();
        assert_eq!(second.device(), 5);
    }

    #[test]
    fn config_routes_by_address() {
        let mut bus = PciBus::new();
        let bdf = bus
            .add_device(dummy(0x100), PciBdf::new(0, 0, 3, 0), None)
            .unwrap();

        assert_eq!(bus.config_read(bdf, 0), 0x1234_5678);
        assert_eq!(bus.config_read(PciBdf::new(0, 0, 4, 0), 0), 0xffff_ffff);
    }

    #[test]
    fn pio_goes_to_the_claiming_device() {
        let mut bus = PciBus::new();
        let first = dummy(0x100);
        let second = dummy(0x200);
        bus.add_device(first.clone(), PciBdf::new(0, 0, 1, 0), None)
            .unwrap();
        bus.add_device(second.clone(), PciBdf::new(0, 0, 2, 0), None)
            .unwrap();

        let mut data = [0u8; 1];
        assert!(bus.pio_read(0x200, &mut data));
        assert!(!bus.pio_read(0x300, &mut data));
        assert_eq!(first.lock().unwrap().reads, 0);
        assert_eq!(second.lock().unwrap().reads, 1);
    }
}
