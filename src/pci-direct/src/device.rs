// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use vm_memory::GuestAddress;

use crate::IrqTrigger;
use crate::host::MmioRegion;

/// A resolved direct mapping of a guest physical range onto a host region.
pub struct MmioMapping {
    pub region: Arc<dyn MmioRegion>,
    /// Offset of the resolved guest address inside `region`.
    pub offset: u64,
    /// Bytes valid from `offset`.
    pub len: u64,
}

impl Debug for MmioMapping {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MmioMapping")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

/// A PCI device model attached to the dispatch bus.
///
/// One handler per inbound message kind. Every handler returns a claim
/// result: `true`/`Some` when the access targets a resource this device
/// owns, `false`/`None` to let the bus offer the access to the next
/// candidate. A miss is not an error.
pub trait PciDevice: Send {
    /// Reads the configuration dword at `reg_idx`.
    fn read_config_register(&mut self, reg_idx: usize) -> u32;

    /// Writes the configuration dword at `reg_idx`.
    fn write_config_register(&mut self, reg_idx: usize, value: u32);

    /// Guest port read from `port`.
    fn pio_read(&mut self, _port: u16, _data: &mut [u8]) -> bool {
        false
    }

    /// Guest port write to `port`.
    fn pio_write(&mut self, _port: u16, _data: &[u8]) -> bool {
        false
    }

    /// Guest memory read at `addr`.
    fn mmio_read(&mut self, _addr: GuestAddress, _data: &mut [u8]) -> bool {
        false
    }

    /// Guest memory write at `addr`.
    fn mmio_write(&mut self, _addr: GuestAddress, _data: &[u8]) -> bool {
        false
    }

    /// Direct-map fast path: resolves the page containing `addr` to a host
    /// mapping the caller may install for exit-free access.
    fn mmio_map(&mut self, _addr: GuestAddress) -> Option<MmioMapping> {
        None
    }

    /// Contiguous-allocation probing. `second` is the second page of the
    /// probed range, or `!0xfff` when the probe stays within one page.
    fn alloc_hint(&mut self, _first: GuestAddress, _second: u64) -> Option<MmioMapping> {
        None
    }

    /// A physical interrupt fired on host line `line`.
    fn handle_host_interrupt(&mut self, _line: u32, _trigger: IrqTrigger) -> bool {
        false
    }

    /// The guest interrupt controller reports mask state for the line
    /// range starting at `base_irq`.
    fn handle_irq_notify(&mut self, _base_irq: u8, _mask: u8) -> bool {
        false
    }
}
