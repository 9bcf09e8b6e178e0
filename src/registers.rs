// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Typed accessors over the endpoint MMIO register file.

use crate::spec::MhiCtrl;
use crate::spec::MhiEe;
use crate::spec::MhiState;
use crate::spec::MhiStatus;
use crate::transport::MhiEpTransport;
use std::sync::Arc;

// Standard MHI register file, endpoint view.
pub(crate) const EP_MHIVER: u32 = 0x08;
pub(crate) const EP_MHICTRL: u32 = 0x38;
pub(crate) const EP_MHISTATUS: u32 = 0x48;
pub(crate) const EP_CCABAP_LOWER: u32 = 0x58;
pub(crate) const EP_CCABAP_HIGHER: u32 = 0x5c;
pub(crate) const EP_ECABAP_LOWER: u32 = 0x60;
pub(crate) const EP_ECABAP_HIGHER: u32 = 0x64;
pub(crate) const EP_CRCBAP_LOWER: u32 = 0x68;
pub(crate) const EP_CRCBAP_HIGHER: u32 = 0x6c;
pub(crate) const EP_BHI_EXECENV: u32 = 0x228;

// Interrupt status/mask/clear block: one control status/clear pair plus four
// rows of 32 channel doorbells each.
pub(crate) const MHI_CHDB_INT_STATUS_BASE: u32 = 0x100;
pub(crate) const MHI_CTRL_INT_STATUS: u32 = 0x120;
pub(crate) const MHI_CHDB_INT_MASK_BASE: u32 = 0x130;
pub(crate) const MHI_CHDB_INT_CLEAR_BASE: u32 = 0x160;
pub(crate) const MHI_CTRL_INT_CLEAR: u32 = 0x180;

/// MHICTRL write / reset request observed.
pub(crate) const MHI_CTRL_INT_STATUS_MSK: u32 = 1 << 0;
/// Command ring doorbell observed.
pub(crate) const MHI_CTRL_INT_STATUS_CRDB_MSK: u32 = 1 << 1;

pub(crate) const fn chdb_int_status(row: u32) -> u32 {
    MHI_CHDB_INT_STATUS_BASE + 4 * row
}

pub(crate) const fn chdb_int_mask(row: u32) -> u32 {
    MHI_CHDB_INT_MASK_BASE + 4 * row
}

pub(crate) const fn chdb_int_clear(row: u32) -> u32 {
    MHI_CHDB_INT_CLEAR_BASE + 4 * row
}

/// The endpoint register file.
#[derive(Clone)]
pub(crate) struct Registers {
    transport: Arc<dyn MhiEpTransport>,
}

impl Registers {
    pub fn new(transport: Arc<dyn MhiEpTransport>) -> Self {
        Self { transport }
    }

    fn read(&self, offset: u32) -> u32 {
        self.transport.read_register(offset)
    }

    fn write(&self, offset: u32, value: u32) {
        self.transport.write_register(offset, value)
    }

    fn read64(&self, lower: u32, higher: u32) -> u64 {
        self.read(lower) as u64 | (self.read(higher) as u64) << 32
    }

    /// The MHI state most recently requested by the host through MHICTRL.
    pub fn requested_state(&self) -> MhiState {
        MhiState(MhiCtrl::from_bits(self.read(EP_MHICTRL)).mhistate())
    }

    /// The state this endpoint currently reports through MHISTATUS.
    pub fn current_state(&self) -> MhiState {
        MhiState(MhiStatus::from_bits(self.read(EP_MHISTATUS)).mhistate())
    }

    /// Reports `state` to the host through MHISTATUS.
    pub fn set_state(&self, state: MhiState) {
        let mut status = MhiStatus::from_bits(self.read(EP_MHISTATUS));
        status.set_mhistate(state.0);
        if state == MhiState::SYS_ERR {
            status.set_syserr(true);
        }
        if state == MhiState::READY {
            status.set_ready(true);
        }
        self.write(EP_MHISTATUS, status.into_bits());
    }

    pub fn set_mhi_version(&self, version: u32) {
        self.write(EP_MHIVER, version);
    }

    pub fn set_exec_env(&self, env: MhiEe) {
        self.write(EP_BHI_EXECENV, env.0.into());
    }

    pub fn ctrl_int_status(&self) -> u32 {
        self.read(MHI_CTRL_INT_STATUS)
    }

    /// Clears exactly the control-interrupt bits observed by the caller.
    pub fn ctrl_int_clear(&self, bits: u32) {
        self.write(MHI_CTRL_INT_CLEAR, bits);
    }

    pub fn chdb_status(&self, row: u32) -> u32 {
        self.read(chdb_int_status(row))
    }

    /// Clears exactly the channel-doorbell bits observed by the caller.
    pub fn chdb_clear(&self, row: u32, bits: u32) {
        self.write(chdb_int_clear(row), bits);
    }

    pub fn set_chdb_mask(&self, row: u32, mask: u32) {
        self.write(chdb_int_mask(row), mask);
    }

    /// Base of the channel context array in host memory.
    pub fn channel_ctx_base(&self) -> u64 {
        self.read64(EP_CCABAP_LOWER, EP_CCABAP_HIGHER)
    }

    /// Base of the event ring context array in host memory.
    pub fn event_ctx_base(&self) -> u64 {
        self.read64(EP_ECABAP_LOWER, EP_ECABAP_HIGHER)
    }

    /// Base of the command ring context in host memory.
    pub fn cmd_ctx_base(&self) -> u64 {
        self.read64(EP_CRCBAP_LOWER, EP_CRCBAP_HIGHER)
    }
}
