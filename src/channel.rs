// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The per-controller channel table.
//!
//! Channels are statically sized at registration from the configuration
//! table and live for the controller's lifetime. They come in adjacent
//! UL/DL pairs sharing one name; the pairing itself is validated when the
//! pair's device is created.

use crate::device::MhiEpDevice;
use crate::device::MhiEpDriver;
use crate::ring::Ring;
use crate::ring::RingType;
use crate::spec::ChannelState;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

/// Transfer direction of a channel, from the endpoint's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelDirection {
    /// Uplink: endpoint to host.
    ToHost,
    /// Downlink: host to endpoint.
    FromHost,
    /// Rejected at registration; no MHI channel is bidirectional.
    Bidirectional,
    /// Rejected at registration.
    None,
}

/// One entry of the controller configuration's channel table.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Channel index; even for UL, odd for DL.
    pub num: u32,
    /// Name shared by both channels of a pair.
    pub name: String,
    pub dir: ChannelDirection,
}

#[derive(Debug, Error)]
pub enum ChannelConfigError {
    #[error("channel id {num} is out of range (max {max})")]
    IdOutOfRange { num: u32, max: u32 },
    #[error("channel {num} has invalid direction {dir:?}")]
    InvalidDirection { num: u32, dir: ChannelDirection },
    #[error("channel {num} is configured twice")]
    Duplicate { num: u32 },
}

/// The completion of a transfer, delivered to a client driver's transfer
/// callback.
#[derive(Debug)]
pub struct MhiResult {
    pub dir: ChannelDirection,
    pub bytes_xferd: usize,
    /// Payload for host-to-endpoint deliveries; empty otherwise.
    pub buf: Vec<u8>,
    pub transaction_status: Result<(), TransferStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransferStatus {
    /// The channel is being torn down; no further transfers will complete.
    #[error("channel disconnected")]
    Disconnected,
}

impl MhiResult {
    pub(crate) fn disconnected(dir: ChannelDirection) -> Self {
        Self {
            dir,
            bytes_xferd: 0,
            buf: Vec::new(),
            transaction_status: Err(TransferStatus::Disconnected),
        }
    }
}

pub(crate) struct Channel {
    pub id: u32,
    /// `None` for channel slots not present in the configuration table.
    pub name: Option<Arc<str>>,
    pub dir: ChannelDirection,
    pub state: ChannelState,
    pub ring: Ring,
    /// Client driver bound at probe time; cleared (with a disconnect
    /// notification) on unbind.
    pub xfer: Option<Arc<dyn MhiEpDriver>>,
    /// The channel-pair device, holding this channel while it exists.
    pub device: Option<Arc<MhiEpDevice>>,
}

impl Channel {
    fn unconfigured(id: u32) -> Self {
        Self {
            id,
            name: None,
            dir: ChannelDirection::None,
            state: ChannelState::DISABLED,
            ring: Ring::new(RingType::Channel),
            xfer: None,
            device: None,
        }
    }

    pub fn configured(&self) -> bool {
        self.name.is_some()
    }
}

/// Builds the channel table, validating every configured entry. A single bad
/// entry fails the whole table; there is no partial-success mode.
pub(crate) fn init_channels(
    max_chan: u32,
    configs: &[ChannelConfig],
) -> Result<Vec<Mutex<Channel>>, ChannelConfigError> {
    let mut channels: Vec<Mutex<Channel>> =
        (0..max_chan).map(|id| Mutex::new(Channel::unconfigured(id))).collect();

    for config in configs {
        if config.num >= max_chan {
            return Err(ChannelConfigError::IdOutOfRange {
                num: config.num,
                max: max_chan,
            });
        }
        match config.dir {
            ChannelDirection::ToHost | ChannelDirection::FromHost => {}
            dir @ (ChannelDirection::Bidirectional | ChannelDirection::None) => {
                return Err(ChannelConfigError::InvalidDirection {
                    num: config.num,
                    dir,
                });
            }
        }
        let chan = channels[config.num as usize].get_mut();
        if chan.configured() {
            return Err(ChannelConfigError::Duplicate { num: config.num });
        }
        chan.name = Some(config.name.as_str().into());
        chan.dir = config.dir;
    }
    Ok(channels)
}
