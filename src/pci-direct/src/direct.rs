// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use log::debug;
use vm_memory::{Address, GuestAddress};

use crate::configuration::{
    BAR0_REG, BAR_IO_ADDR_MASK, BAR_MEM_ADDR_MASK, HEADER_TYPE_MULTIFUNCTION_MASK,
    HEADER_TYPE_REG, NUM_BAR_REGS, NUM_CONFIGURATION_REGISTERS, ShadowConfiguration,
};
use crate::device::{MmioMapping, PciDevice};
use crate::host::{BarLayout, GuestIrqSink, HostPlatform, HostPlatformError, MmioRegion};
use crate::msi::{MSI_CTL_ENABLE, MsiState};
use crate::msix::{MSIX_CAP_DISABLED, MsixState, msix_enabled, msix_table_size};
use crate::{IrqTrigger, PciBdf};

// Capability IDs this model virtualizes.
const CAP_ID_MSI: u8 = 0x05;
const CAP_ID_MSIX: u8 = 0x11;

const BAR_IO_FLAG: u64 = 0x1;
const BAR_MEM_PREFETCHABLE: u32 = 0x8;

/// Construction failure for a directly-assigned device. Passthrough setup
/// cannot be left half-done, so every failure aborts the device.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum DirectPciError {
    /// could not resolve virtual function {1} of {0}: {2}
    ResolveVf(PciBdf, u32, #[source] HostPlatformError),
    /// could not assign {0} to the guest address space: {1}
    AssignDevice(PciBdf, #[source] HostPlatformError),
    /// could not allocate host resources for BAR {0}: {1}
    AllocateBar(usize, #[source] HostPlatformError),
    /// could not allocate a host interrupt for vector {0}: {1}
    AllocateIrq(usize, #[source] HostPlatformError),
}

/// Which physical function to hand to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassthroughTarget {
    /// A whole physical device.
    Device(PciBdf),
    /// One SR-IOV virtual function of `parent`.
    VirtualFunction { parent: PciBdf, index: u32 },
}

/// Host-side backing of one BAR slot. Assigned once during construction,
/// immutable for the device's lifetime.
enum BarMapping {
    /// Host port window backing an I/O BAR.
    Io { base: u16 },
    /// Mapped host region backing a memory BAR; `offset` preserves the BAR
    /// base's low alignment bits inside the page-aligned mapping.
    Memory {
        region: Arc<dyn MmioRegion>,
        offset: u64,
    },
}

struct BarInfo {
    size: u64,
    mapping: Option<BarMapping>,
}

/// Where a guest memory access resolved to.
enum MmioTarget {
    Bar { slot: usize, offset: u64 },
    /// Offset relative to the start of the MSI-X shadow table.
    MsixTable { offset: u64 },
}

/// A host PCI device (or virtual function) assigned directly to the guest.
///
/// The guest reads and writes configuration space against a masked shadow,
/// drives the device's BARs through translated host accesses, and receives
/// the device's physical interrupts re-raised as virtual ones. Shared as
/// `Arc<Mutex<_>>` by the dispatch bus; the mutex is what makes the
/// interrupt path observe a consistent snapshot of the MSI/MSI-X state the
/// guest may be rewriting concurrently.
pub struct DirectPciDevice {
    host: Arc<dyn HostPlatform>,
    irq_sink: Arc<dyn GuestIrqSink>,
    bdf: PciBdf,
    config: ShadowConfiguration,
    bars: Vec<BarInfo>,
    msi: Option<MsiState>,
    msix: Option<MsixState>,
    host_irqs: Vec<u32>,
}

impl Debug for DirectPciDevice {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectPciDevice")
            .field("bdf", &self.bdf)
            .field("irq_count", &self.host_irqs.len())
            .finish()
    }
}

impl DirectPciDevice {
    /// Assigns `target` to the guest and builds the virtualized view of
    /// it: configuration snapshot, IOMMU attachment, BAR mappings,
    /// MSI/MSI-X shadow state and one host interrupt line per vector.
    pub fn new(
        host: Arc<dyn HostPlatform>,
        irq_sink: Arc<dyn GuestIrqSink>,
        target: PassthroughTarget,
    ) -> Result<Self, DirectPciError> {
        let (bdf, parent) = match target {
            PassthroughTarget::Device(bdf) => (bdf, None),
            PassthroughTarget::VirtualFunction { parent, index } => {
                let bdf = host
                    .vf_bdf(parent, index)
                    .map_err(|e| DirectPciError::ResolveVf(parent, index, e))?;
                (bdf, Some((parent, index)))
            }
        };

        let mut registers = [0u32; NUM_CONFIGURATION_REGISTERS];
        for (reg_idx, reg) in registers.iter_mut().enumerate() {
            *reg = host.config_read(bdf, reg_idx);
        }
        let mut config = ShadowConfiguration::new(registers);
        if let Some((parent, _)) = parent {
            // The host enumerates virtual functions under the physical
            // function's ID; present the VF's own one instead.
            config.set_reg(0, host.vf_device_id(parent));
        }

        match parent {
            Some((parent_bdf, _)) => host.assign_device(parent_bdf, Some(bdf)),
            None => host.assign_device(bdf, None),
        }
        .map_err(|e| DirectPciError::AssignDevice(bdf, e))?;

        let layout = match parent {
            Some((parent_bdf, index)) => host.vf_bar_layout(parent_bdf, index),
            None => host.bar_layout(bdf),
        };
        let bars = Self::map_bars(host.as_ref(), &layout, &mut config)?;

        let (msi, msix, irq_count) = Self::parse_capabilities(host.as_ref(), bdf, &mut config);

        let mut host_irqs = Vec::with_capacity(irq_count);
        for vector in 0..irq_count {
            let trigger = if vector == 0 {
                IrqTrigger::Level
            } else {
                IrqTrigger::Edge
            };
            let gsi = host
                .allocate_irq(bdf, vector, trigger)
                .map_err(|e| DirectPciError::AllocateIrq(vector, e))?;
            host_irqs.push(gsi);
        }

        Ok(DirectPciDevice {
            host,
            irq_sink,
            bdf,
            config,
            bars,
            msi,
            msix,
            host_irqs,
        })
    }

    /// The host address of the assigned function.
    pub fn bdf(&self) -> PciBdf {
        self.bdf
    }

    /// Host interrupt lines backing the device's vectors, index i serving
    /// virtual IRQ i. The embedder routes these into
    /// [`PciDevice::handle_host_interrupt`].
    pub fn host_irqs(&self) -> &[u32] {
        &self.host_irqs
    }

    fn map_bars(
        host: &dyn HostPlatform,
        layout: &[BarLayout; NUM_BAR_REGS],
        config: &mut ShadowConfiguration,
    ) -> Result<Vec<BarInfo>, DirectPciError> {
        let mut bars = Vec::with_capacity(NUM_BAR_REGS);
        for (slot, bar) in layout.iter().enumerate() {
            config.set_bar_mask(slot, bar.size);
            if bar.base == 0 || bar.size == 0 {
                bars.push(BarInfo {
                    size: bar.size,
                    mapping: None,
                });
                continue;
            }
            debug!("BAR {slot}: base {:#x} size {:#x}", bar.base, bar.size);

            let mapping = if bar.base & BAR_IO_FLAG != 0 {
                let base = (bar.base as u32 & BAR_IO_ADDR_MASK) as u16;
                let len = bar.size.next_power_of_two().max(4) as u32;
                let port = host
                    .allocate_io_region(base, len)
                    .map_err(|e| DirectPciError::AllocateBar(slot, e))?;
                BarMapping::Io { base: port }
            } else {
                let base = bar.base & !0x1f;
                let len = ((bar.size - 1) | 0xfff) + 1;
                let region = host
                    .allocate_mmio_region(base, len)
                    .map_err(|e| DirectPciError::AllocateBar(slot, e))?;
                BarMapping::Memory {
                    region,
                    offset: bar.base & 0x10,
                }
            };
            bars.push(BarInfo {
                size: bar.size,
                mapping: Some(mapping),
            });
        }
        Ok(bars)
    }

    fn parse_capabilities(
        host: &dyn HostPlatform,
        bdf: PciBdf,
        config: &mut ShadowConfiguration,
    ) -> (Option<MsiState>, Option<MsixState>, usize) {
        let mut irq_count = 1;

        let msi = host.find_capability(bdf, CAP_ID_MSI).map(|offset| {
            let cap_dword = usize::from(offset) / 4;
            let state = MsiState::parse(cap_dword, config.read_reg(cap_dword));
            // MSI starts disabled: the address/data registers are not
            // guest-controlled until the guest programs them itself.
            config.set_reg(cap_dword, config.read_reg(cap_dword) & !MSI_CTL_ENABLE);
            config.set_msi_masks(cap_dword, state.addr_64bit());
            irq_count = irq_count.max(state.irq_count());
            state
        });

        let msix = host.find_capability(bdf, CAP_ID_MSIX).map(|offset| {
            let cap_dword = usize::from(offset) / 4;
            irq_count = irq_count.max(msix_table_size(config.read_reg(cap_dword)));
            let table_dword = config.read_reg(cap_dword + 1);
            config.set_reg(cap_dword, MSIX_CAP_DISABLED);
            MsixState::new(cap_dword, table_dword, irq_count)
        });

        (msi, msix, irq_count)
    }

    fn match_io_bars(&self, port: u16) -> Option<u16> {
        // Low ports belong to the platform; an assigned device never
        // decodes them.
        if port < 0x100 {
            return None;
        }
        if !self.config.io_decode_enabled() {
            return None;
        }

        for (slot, bar) in self.bars.iter().enumerate() {
            let Some(BarMapping::Io { base }) = &bar.mapping else {
                continue;
            };
            let align = (bar.size.max(4) - 1) as u16;
            let bar_base = (self.config.read_reg(BAR0_REG + slot) & BAR_IO_ADDR_MASK) as u16;
            if (port & !align) != (bar_base & !align) {
                continue;
            }
            return Some(base.wrapping_add(port & align));
        }
        None
    }

    fn match_mem_bars(&self, addr: u64, len: usize) -> Option<MmioTarget> {
        if !self.config.mem_decode_enabled() {
            return None;
        }
        let len = len as u64;

        for (slot, bar) in self.bars.iter().enumerate() {
            let Some(BarMapping::Memory { .. }) = &bar.mapping else {
                continue;
            };
            if bar.size < len {
                continue;
            }
            let bar_base = u64::from(self.config.read_reg(BAR0_REG + slot) & BAR_MEM_ADDR_MASK);
            if addr < bar_base || addr > bar_base + (bar.size - len) {
                continue;
            }
            let offset = addr - bar_base;

            if let Some(msix) = &self.msix {
                if msix.bar_index() == slot && msix.contains(offset) {
                    return Some(MmioTarget::MsixTable {
                        offset: offset - msix.table_offset(),
                    });
                }
            }
            return Some(MmioTarget::Bar { slot, offset });
        }
        None
    }

    fn bar_region(&self, slot: usize) -> Option<(&Arc<dyn MmioRegion>, u64)> {
        match &self.bars[slot].mapping {
            Some(BarMapping::Memory { region, offset }) => Some((region, *offset)),
            _ => None,
        }
    }
}

impl PciDevice for DirectPciDevice {
    fn read_config_register(&mut self, reg_idx: usize) -> u32 {
        debug_assert!(reg_idx < NUM_CONFIGURATION_REGISTERS);
        let mut value = if self.config.is_internal(reg_idx) {
            self.config.read_reg(reg_idx)
        } else {
            self.host.config_read(self.bdf, reg_idx)
        };

        // Always presented as a single-function device.
        if reg_idx == HEADER_TYPE_REG {
            value &= !HEADER_TYPE_MULTIFUNCTION_MASK;
        }
        value
    }

    fn write_config_register(&mut self, reg_idx: usize, value: u32) {
        debug_assert!(reg_idx < NUM_CONFIGURATION_REGISTERS);
        if self.config.write_reg(reg_idx, value) {
            // A dword the model does not interpret: hand it to hardware
            // and resync the shadow with whatever the device accepted.
            self.host
                .config_write(self.bdf, reg_idx, self.config.read_reg(reg_idx));
            self.config
                .set_reg(reg_idx, self.host.config_read(self.bdf, reg_idx));
        }
    }

    fn pio_read(&mut self, port: u16, data: &mut [u8]) -> bool {
        let Some(host_port) = self.match_io_bars(port) else {
            return false;
        };
        self.host.io_port_read(host_port, data);
        true
    }

    fn pio_write(&mut self, port: u16, data: &[u8]) -> bool {
        let Some(host_port) = self.match_io_bars(port) else {
            return false;
        };
        self.host.io_port_write(host_port, data);
        true
    }

    fn mmio_read(&mut self, addr: GuestAddress, data: &mut [u8]) -> bool {
        match self.match_mem_bars(addr.raw_value(), data.len()) {
            Some(MmioTarget::Bar { slot, offset }) => {
                if let Some((region, map_offset)) = self.bar_region(slot) {
                    region.read(map_offset + offset, data);
                }
                true
            }
            Some(MmioTarget::MsixTable { offset }) => {
                if let Some(msix) = &self.msix {
                    msix.read_table(offset, data);
                }
                true
            }
            None => false,
        }
    }

    fn mmio_write(&mut self, addr: GuestAddress, data: &[u8]) -> bool {
        match self.match_mem_bars(addr.raw_value(), data.len()) {
            Some(MmioTarget::Bar { slot, offset }) => {
                if let Some((region, map_offset)) = self.bar_region(slot) {
                    region.write(map_offset + offset, data);
                }
                true
            }
            Some(MmioTarget::MsixTable { offset }) => {
                if let Some(msix) = &mut self.msix {
                    if let Some((vector, ctl)) = msix.write_table(offset, data) {
                        // Vector masking must reach the physical table:
                        // the interrupt source itself is hardware.
                        let hw_offset = msix.hw_ctl_offset(vector);
                        let bar_index = msix.bar_index();
                        if let Some(BarMapping::Memory {
                            region,
                            offset: map_offset,
                        }) = &self.bars[bar_index].mapping
                        {
                            let mut buf = [0u8; 4];
                            LittleEndian::write_u32(&mut buf, ctl);
                            region.write(map_offset + hw_offset, &buf);
                        }
                    }
                }
                true
            }
            None => false,
        }
    }

    fn mmio_map(&mut self, addr: GuestAddress) -> Option<MmioMapping> {
        let page = addr.raw_value() & !0xfff;
        match self.match_mem_bars(page, 0x1000)? {
            MmioTarget::Bar { slot, offset } => {
                let (region, map_offset) = self.bar_region(slot)?;
                Some(MmioMapping {
                    region: Arc::clone(region),
                    offset: map_offset + offset,
                    len: self.bars[slot].size - offset,
                })
            }
            // The vector table must stay trapped.
            MmioTarget::MsixTable { .. } => None,
        }
    }

    fn alloc_hint(&mut self, first: GuestAddress, second: u64) -> Option<MmioMapping> {
        // Only a probe confined to a single page of a prefetchable BAR can
        // be answered with a direct allocation.
        if second != !0xfff {
            return None;
        }
        let page = first.raw_value() & !0xfff;
        let MmioTarget::Bar { slot, offset } = self.match_mem_bars(page, 0x1000)? else {
            return None;
        };
        if self.config.read_reg(BAR0_REG + slot) & BAR_MEM_PREFETCHABLE == 0 {
            return None;
        }
        let (region, map_offset) = self.bar_region(slot)?;
        let inner = first.raw_value() & 0xfff;
        Some(MmioMapping {
            region: Arc::clone(region),
            offset: map_offset + offset + inner,
            len: self.bars[slot].size - offset - inner,
        })
    }

    fn handle_host_interrupt(&mut self, line: u32, trigger: IrqTrigger) -> bool {
        let Some(vector) = self.host_irqs.iter().position(|&irq| irq == line) else {
            return false;
        };

        if let Some(msi) = &self.msi {
            if msi.enabled(&self.config) {
                let message = msi.message(&self.config, vector);
                if message.address != 0 {
                    debug!("MSI delivery for vector {vector}: {message:x?}");
                    self.irq_sink.raise(message.vector(), IrqTrigger::Edge);
                    return true;
                }
                return false;
            }
        }

        if let Some(msix) = &self.msix {
            if msix_enabled(self.config.read_reg(msix.cap_dword())) {
                if let Some(entry) = msix.entry(vector) {
                    if entry.address() != 0 {
                        debug!("MSI-X delivery for vector {vector}");
                        self.irq_sink
                            .raise((entry.msg_data & 0xff) as u8, IrqTrigger::Edge);
                        return true;
                    }
                }
                return false;
            }
        }

        if vector == 0 {
            let line = self.config.legacy_interrupt_line();
            self.irq_sink.raise(line, trigger);
            return true;
        }

        // No enabled delivery path for this vector; the interrupt has
        // nowhere to go and is absorbed.
        false
    }

    fn handle_irq_notify(&mut self, base_irq: u8, mask: u8) -> bool {
        let line = self.config.legacy_interrupt_line();
        let in_range =
            u16::from(line) >= u16::from(base_irq) && u16::from(line) < u16::from(base_irq) + 8;
        if in_range && mask & (1u8 << (line & 0x7)) != 0 {
            if let Some(&gsi) = self.host_irqs.first() {
                self.host.notify_irq(gsi);
                return true;
            }
        }
        false
    }
}
