// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Ring processing deferred from the interrupt path: host channel commands,
//! host-to-endpoint deliveries, and the endpoint-to-host queue path.

use crate::channel::ChannelDirection;
use crate::channel::MhiResult;
use crate::controller::ControllerShared;
use crate::event::EventError;
use crate::ring::RingError;
use crate::spec::ChCfg;
use crate::spec::ChannelState;
use crate::spec::MhiCompletionCode;
use crate::spec::MhiPktType;
use crate::spec::MhiRingElement;
use crate::spec::u32_le;
use crate::spec::MHI_MASK_CH_LEN;
use crate::spec::RING_CTX_SIZE;
use crate::transport::read_plain;
use crate::transport::write_plain;
use crate::transport::HostMemoryError;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;

/// Failure of [`crate::MhiEpDevice::queue_buf`].
#[derive(Debug, Error)]
pub enum QueueBufError {
    #[error("controller has been unregistered")]
    ControllerGone,
    #[error("device has no UL channel")]
    NoUlChannel,
    #[error("channel {0} is not running")]
    NotRunning(u32),
    #[error("no transfer element queued by the host")]
    NoCredit,
    #[error("buffer length {len} exceeds host element capacity {cap}")]
    BufTooLarge { len: usize, cap: u32 },
    #[error("ring access failed")]
    Ring(#[from] RingError),
    #[error("host memory access failed")]
    Memory(#[from] HostMemoryError),
    #[error("completion delivery failed")]
    Event(#[from] EventError),
}

#[derive(Debug, Error)]
enum ChannelRingError {
    #[error("ring access failed")]
    Ring(#[from] RingError),
    #[error("host memory access failed")]
    Memory(#[from] HostMemoryError),
    #[error("completion delivery failed")]
    Event(#[from] EventError),
}

impl ControllerShared {
    /// Drains the command ring, completing each command back to the host.
    pub(crate) fn cmd_ring_work(self: &Arc<Self>) {
        let mut ring = self.cmd_rings[0].lock();
        if !ring.started {
            let ctx_addr = self.regs.cmd_ctx_base();
            if let Err(err) = ring.start(self.transport.as_ref(), ctx_addr) {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "failed to start command ring"
                );
                return;
            }
        }
        if let Err(err) = ring.update_write_offset(self.transport.as_ref()) {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "failed to refresh command ring write pointer"
            );
            return;
        }
        while ring.has_pending() {
            let element = match ring.read_element(self.transport.as_ref()) {
                Ok(element) => element,
                Err(err) => {
                    tracing::error!(
                        error = &err as &dyn std::error::Error,
                        "failed to read command element"
                    );
                    break;
                }
            };
            let cmd_ptr = ring.current_read_ptr();
            if let Err(err) = self.process_cmd(&element, cmd_ptr) {
                tracing::error!(
                    pkt_type = ?element.pkt_type(),
                    channel = element.channel(),
                    error = &err as &dyn std::error::Error,
                    "command processing failed"
                );
            }
            if let Err(err) = ring.inc_read_offset(self.transport.as_ref()) {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "failed to retire command element"
                );
                break;
            }
        }
    }

    fn process_cmd(
        self: &Arc<Self>,
        element: &MhiRingElement,
        cmd_ptr: u64,
    ) -> Result<(), EventError> {
        let ch_id = u32::from(element.channel());
        if ch_id >= self.max_chan || !self.channels[ch_id as usize].lock().configured() {
            tracing::error!(channel = ch_id, "command for unconfigured channel");
            return self.send_cmd_comp_event(MhiCompletionCode::UNDEFINED_ERR, cmd_ptr);
        }

        match element.pkt_type() {
            MhiPktType::START_CHAN_CMD => {
                let need_device;
                {
                    let mut chan = self.channels[ch_id as usize].lock();
                    if !chan.ring.started {
                        let ctx_addr = self.channel_ctx_addr(ch_id);
                        if let Err(err) = chan.ring.start(self.transport.as_ref(), ctx_addr) {
                            tracing::error!(
                                channel = ch_id,
                                error = &err as &dyn std::error::Error,
                                "failed to start transfer ring"
                            );
                            drop(chan);
                            return self
                                .send_cmd_comp_event(MhiCompletionCode::UNDEFINED_ERR, cmd_ptr);
                        }
                    }
                    chan.state = ChannelState::RUNNING;
                    need_device = ch_id % 2 == 0 && chan.device.is_none();
                }
                self.mirror_channel_state(ch_id, ChannelState::RUNNING);
                self.enable_chdb_interrupt(ch_id);
                if need_device {
                    if let Err(err) = self.create_device(ch_id) {
                        tracing::error!(
                            channel = ch_id,
                            error = &err as &dyn std::error::Error,
                            "failed to create channel device"
                        );
                        self.handle_syserr();
                        return Ok(());
                    }
                }
                self.send_cmd_comp_event(MhiCompletionCode::SUCCESS, cmd_ptr)
            }
            MhiPktType::STOP_CHAN_CMD => {
                {
                    let mut chan = self.channels[ch_id as usize].lock();
                    if !chan.ring.started {
                        drop(chan);
                        return self.send_cmd_comp_event(MhiCompletionCode::UNDEFINED_ERR, cmd_ptr);
                    }
                    chan.state = ChannelState::STOP;
                }
                self.mirror_channel_state(ch_id, ChannelState::STOP);
                self.disable_chdb_interrupt(ch_id);
                self.send_cmd_comp_event(MhiCompletionCode::SUCCESS, cmd_ptr)
            }
            MhiPktType::RESET_CHAN_CMD => {
                {
                    let mut chan = self.channels[ch_id as usize].lock();
                    if !chan.ring.started {
                        drop(chan);
                        return self.send_cmd_comp_event(MhiCompletionCode::UNDEFINED_ERR, cmd_ptr);
                    }
                    chan.ring.reset();
                    chan.state = ChannelState::DISABLED;
                }
                self.mirror_channel_state(ch_id, ChannelState::DISABLED);
                self.disable_chdb_interrupt(ch_id);
                self.send_cmd_comp_event(MhiCompletionCode::SUCCESS, cmd_ptr)
            }
            other => {
                tracing::error!(pkt_type = ?other, channel = ch_id, "unsupported command");
                self.send_cmd_comp_event(MhiCompletionCode::UNDEFINED_ERR, cmd_ptr)
            }
        }
    }

    pub(crate) fn channel_ctx_addr(&self, ch_id: u32) -> u64 {
        self.regs.channel_ctx_base() + u64::from(ch_id) * RING_CTX_SIZE
    }

    /// Mirrors the channel state into the `chcfg` word of the channel's host
    /// context.
    pub(crate) fn mirror_channel_state(&self, ch_id: u32, state: ChannelState) {
        let addr = self.channel_ctx_addr(ch_id);
        let result = read_plain(self.transport.as_ref(), addr).and_then(|cur: u32_le| {
            let chcfg = ChCfg::from_bits(cur.get()).with_chstate(state.0);
            write_plain(self.transport.as_ref(), addr, &u32_le::from(chcfg.into_bits()))
        });
        if let Err(err) = result {
            tracing::error!(
                channel = ch_id,
                error = &err as &dyn std::error::Error,
                "failed to mirror channel state"
            );
        }
    }

    pub(crate) fn enable_chdb_interrupt(&self, ch_id: u32) {
        let row = ch_id / MHI_MASK_CH_LEN;
        let bit = 1u32 << (ch_id % MHI_MASK_CH_LEN);
        let mask = self.chdb_masks[row as usize].fetch_or(bit, Ordering::SeqCst) | bit;
        self.regs.set_chdb_mask(row, mask);
    }

    fn disable_chdb_interrupt(&self, ch_id: u32) {
        let row = ch_id / MHI_MASK_CH_LEN;
        let bit = 1u32 << (ch_id % MHI_MASK_CH_LEN);
        let mask = self.chdb_masks[row as usize].fetch_and(!bit, Ordering::SeqCst) & !bit;
        self.regs.set_chdb_mask(row, mask);
    }

    /// Drains every channel doorbell queued by the interrupt path.
    pub(crate) fn ch_ring_work(&self) {
        let ch_ids = std::mem::take(&mut self.pending.lock().ch_db);
        for ch_id in ch_ids {
            if let Err(err) = self.process_ch_ring(ch_id) {
                tracing::error!(
                    channel = ch_id,
                    error = &err as &dyn std::error::Error,
                    "channel ring processing failed"
                );
            }
        }
    }

    /// Refreshes one channel's ring. For DL channels every pending element is
    /// read, delivered to the bound driver, and completed back to the host;
    /// a UL doorbell only refreshes the credit the host has queued.
    fn process_ch_ring(&self, ch_id: u32) -> Result<(), ChannelRingError> {
        let mut chan = self.channels[ch_id as usize].lock();
        if chan.state != ChannelState::RUNNING {
            tracing::debug!(channel = ch_id, state = ?chan.state, "doorbell for idle channel");
            return Ok(());
        }
        chan.ring.update_write_offset(self.transport.as_ref())?;
        if chan.dir != ChannelDirection::FromHost {
            return Ok(());
        }
        while chan.ring.has_pending() {
            let element = chan.ring.read_element(self.transport.as_ref())?;
            let len = element.transfer_len() as usize;
            let mut buf = vec![0; len];
            self.transport.read_from_host(element.ptr.get(), &mut buf)?;
            if let (Some(xfer), Some(device)) = (chan.xfer.clone(), chan.device.clone()) {
                let result = MhiResult {
                    dir: chan.dir,
                    bytes_xferd: len,
                    buf,
                    transaction_status: Ok(()),
                };
                xfer.dl_xfer_cb(&device, result);
            } else {
                tracing::debug!(channel = ch_id, len, "dropping delivery with no driver bound");
            }
            let tre_ptr = chan.ring.current_read_ptr();
            self.send_completion_event(
                chan.ring.er_index(),
                ch_id,
                tre_ptr,
                len as u32,
                MhiCompletionCode::EOT,
                element.bei(),
            )?;
            chan.ring.inc_read_offset(self.transport.as_ref())?;
        }
        Ok(())
    }

    /// Sends `buf` to the host over UL channel `ch_id`, consuming one
    /// host-queued transfer element and completing it.
    pub(crate) fn queue_buf(&self, ch_id: u32, buf: &[u8]) -> Result<(), QueueBufError> {
        let mut chan = self.channels[ch_id as usize].lock();
        if chan.state != ChannelState::RUNNING {
            return Err(QueueBufError::NotRunning(ch_id));
        }
        chan.ring.update_write_offset(self.transport.as_ref())?;
        if !chan.ring.has_pending() {
            return Err(QueueBufError::NoCredit);
        }
        let element = chan.ring.read_element(self.transport.as_ref())?;
        let cap = element.transfer_len();
        if buf.len() as u64 > u64::from(cap) {
            return Err(QueueBufError::BufTooLarge {
                len: buf.len(),
                cap,
            });
        }
        self.transport.write_to_host(element.ptr.get(), buf)?;
        let tre_ptr = chan.ring.current_read_ptr();
        self.send_completion_event(
            chan.ring.er_index(),
            ch_id,
            tre_ptr,
            buf.len() as u32,
            MhiCompletionCode::EOT,
            element.bei(),
        )?;
        chan.ring.inc_read_offset(self.transport.as_ref())?;
        Ok(())
    }
}
