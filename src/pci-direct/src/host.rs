// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

use std::sync::Arc;

use crate::configuration::NUM_BAR_REGS;
use crate::{IrqTrigger, PciBdf};

/// Failure reported by the host platform for a construction-time request.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum HostPlatformError {
    /// device {0} is not present on the host
    DeviceNotFound(PciBdf),
    /// virtual function {1} of {0} does not exist
    VfNotFound(PciBdf, u32),
    /// the IOMMU refused to assign {0}
    AssignRefused(PciBdf),
    /// could not claim host I/O ports at {0}
    IoRegionUnavailable(u16),
    /// could not map host MMIO region at {0}
    MmioRegionUnavailable(u64),
    /// no host interrupt line available for vector {0}
    NoIrqAvailable(usize),
}

/// Decoded base and size of one physical BAR slot.
///
/// A 64-bit BAR reports its full base and size in its low slot; the high
/// slot carries zeros.
#[derive(Copy, Clone, Debug, Default)]
pub struct BarLayout {
    /// Raw BAR register value: flag bits in the low nibble, base above.
    pub base: u64,
    /// True decoded size, a power of two, or 0 for an unimplemented slot.
    pub size: u64,
}

/// Host-side mapping of a device memory region.
///
/// The BAR table exclusively owns the handle; the mapping lives for the
/// device's lifetime.
pub trait MmioRegion: Send + Sync {
    fn read(&self, offset: u64, data: &mut [u8]);
    fn write(&self, offset: u64, data: &[u8]);
    fn len(&self) -> u64;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The host platform collaborator.
///
/// Everything the passthrough model needs from the outside world goes
/// through this trait: configuration cycles on the physical device, BAR
/// and capability enumeration, IOMMU assignment and host resource
/// allocation. All calls are synchronous and complete or fail promptly;
/// construction-time failures are fatal to the device being built.
pub trait HostPlatform: Send + Sync {
    /// Issues a configuration read cycle on the physical device.
    fn config_read(&self, bdf: PciBdf, reg_idx: usize) -> u32;

    /// Issues a configuration write cycle on the physical device.
    fn config_write(&self, bdf: PciBdf, reg_idx: usize, value: u32);

    /// Decoded base/size of every BAR slot of the physical device.
    fn bar_layout(&self, bdf: PciBdf) -> [BarLayout; NUM_BAR_REGS];

    /// BAR layout of one virtual function of `parent`.
    fn vf_bar_layout(&self, parent: PciBdf, vf_index: u32) -> [BarLayout; NUM_BAR_REGS];

    /// Byte offset of the first capability with id `cap_id` in the
    /// device's capability list, if any.
    fn find_capability(&self, bdf: PciBdf, cap_id: u8) -> Option<u8>;

    /// Resolves the address of one virtual function of `parent`.
    fn vf_bdf(&self, parent: PciBdf, vf_index: u32) -> Result<PciBdf, HostPlatformError>;

    /// The device id virtual functions of `parent` enumerate with.
    fn vf_device_id(&self, parent: PciBdf) -> u32;

    /// Attaches the device (or the `vf` child of it) to the guest's DMA
    /// address space.
    fn assign_device(&self, bdf: PciBdf, vf: Option<PciBdf>) -> Result<(), HostPlatformError>;

    /// Claims a host I/O port window of `len` ports at `base`, returning
    /// the host port the window starts at.
    fn allocate_io_region(&self, base: u16, len: u32) -> Result<u16, HostPlatformError>;

    /// Maps `len` bytes of device memory at host physical `base`.
    fn allocate_mmio_region(
        &self,
        base: u64,
        len: u64,
    ) -> Result<Arc<dyn MmioRegion>, HostPlatformError>;

    /// Allocates the host interrupt line backing `vector` of the device.
    fn allocate_irq(
        &self,
        bdf: PciBdf,
        vector: usize,
        trigger: IrqTrigger,
    ) -> Result<u32, HostPlatformError>;

    /// Re-arms a host line after the guest acknowledged the interrupt.
    fn notify_irq(&self, gsi: u32);

    /// Performs a read from a host I/O port window.
    fn io_port_read(&self, port: u16, data: &mut [u8]);

    /// Performs a write to a host I/O port window.
    fn io_port_write(&self, port: u16, data: &[u8]);
}

/// Sink for interrupts re-raised towards the guest.
pub trait GuestIrqSink: Send + Sync {
    /// Raises a virtual interrupt. `vector` is a message vector for
    /// edge-triggered delivery or a legacy line number.
    fn raise(&self, vector: u8, trigger: IrqTrigger);
}
