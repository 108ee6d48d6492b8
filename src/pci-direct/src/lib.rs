// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Direct assignment of host PCI devices to a guest.
//!
//! A [`DirectPciDevice`] hands a physical PCI device (or one of its SR-IOV
//! virtual functions) to the guest while the monitor stays in control of
//! the safety-relevant state: what the guest sees in configuration space,
//! which address windows its BAR accesses may reach, and how physical
//! interrupts are re-raised into the guest.
//!
//! The host side of the world (configuration cycles, resource allocation,
//! IOMMU assignment, interrupt lines) is reached exclusively through the
//! [`HostPlatform`] trait, so the whole model can be exercised against a
//! fake host in tests.

mod bus;
mod configuration;
mod device;
mod direct;
mod host;
mod msi;
mod msix;

use std::fmt::{self, Debug, Display};

pub use self::bus::{PciBus, PciBusError};
pub use self::configuration::{NUM_BAR_REGS, NUM_CONFIGURATION_REGISTERS, ShadowConfiguration};
pub use self::device::{MmioMapping, PciDevice};
pub use self::direct::{DirectPciDevice, DirectPciError, PassthroughTarget};
pub use self::host::{BarLayout, GuestIrqSink, HostPlatform, HostPlatformError, MmioRegion};
pub use self::msi::{MsiMessage, MsiState};
pub use self::msix::{MSIX_TABLE_ENTRY_SIZE, MsixState, MsixTableEntry};

/// Trigger mode of a host line or a re-raised virtual interrupt.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IrqTrigger {
    Edge,
    Level,
}

/// A segment/bus/device/function address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd)]
pub struct PciBdf(u32);

impl PciBdf {
    pub fn segment(&self) -> u16 {
        ((self.0 >> 16) & 0xffff) as u16
    }

    pub fn bus(&self) -> u8 {
        ((self.0 >> 8) & 0xff) as u8
    }

    pub fn device(&self) -> u8 {
        ((self.0 >> 3) & 0x1f) as u8
    }

    pub fn function(&self) -> u8 {
        (self.0 & 0x7) as u8
    }

    pub fn new(segment: u16, bus: u8, device: u8, function: u8) -> Self {
        Self(
            (u32::from(segment) << 16)
                | (u32::from(bus) << 8)
                | (u32::from(device & 0x1f) << 3)
                | u32::from(function & 0x7),
        )
    }
}

impl From<u32> for PciBdf {
    fn from(bdf: u32) -> Self {
        Self(bdf)
    }
}

impl From<PciBdf> for u32 {
    fn from(bdf: PciBdf) -> Self {
        bdf.0
    }
}

impl From<PciBdf> for u16 {
    fn from(bdf: PciBdf) -> Self {
        (bdf.0 & 0xffff) as u16
    }
}

impl From<&PciBdf> for u16 {
    fn from(bdf: &PciBdf) -> Self {
        (bdf.0 & 0xffff) as u16
    }
}

impl Debug for PciBdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:01x}",
            self.segment(),
            self.bus(),
            self.device(),
            self.function()
        )
    }
}

impl Display for PciBdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:01x}",
            self.segment(),
            self.bus(),
            self.device(),
            self.function()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bdf_packing() {
        let bdf = PciBdf::new(0, 0, 3, 1);
        assert_eq!(bdf.device(), 3);
        assert_eq!(bdf.function(), 1);
        assert_eq!(u16::from(bdf), 0x19);
        assert_eq!(format!("{bdf}"), "0000:00:03.1");
    }

    #[test]
    fn bdf_field_truncation() {
        let bdf = PciBdf::new(0, 0, 0xff, 0xff);
        assert_eq!(bdf.device(), 0x1f);
        assert_eq!(bdf.function(), 0x7);
    }
}
