// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The MHI endpoint bus: driver registration and matching, controller index
//! allocation, and the per-channel-pair devices handed to client drivers.

use crate::channel::MhiResult;
use crate::controller::ControllerShared;
use crate::spec::ChannelState;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::Weak;
use thiserror::Error;

/// An entry in a driver's channel-name match table.
#[derive(Debug, Clone, Copy)]
pub struct MhiDeviceId {
    pub chan: &'static str,
}

/// A client driver bound to channel-pair devices by name.
///
/// Callbacks are invoked with the corresponding channel lock held: a driver
/// must not call [`MhiEpDevice::queue_buf`] for the same channel from inside
/// its transfer callback.
pub trait MhiEpDriver: Send + Sync {
    /// Called when a device matching the driver's table appears on the bus.
    fn probe(&self, device: &Arc<MhiEpDevice>, id: &MhiDeviceId) -> anyhow::Result<()>;

    /// Called after both channels have been disconnected, before the device
    /// disappears.
    fn remove(&self, device: &Arc<MhiEpDevice>);

    /// Completion of an uplink (endpoint to host) transfer.
    fn ul_xfer_cb(&self, device: &Arc<MhiEpDevice>, result: MhiResult);

    /// Delivery of a downlink (host to endpoint) transfer.
    fn dl_xfer_cb(&self, device: &Arc<MhiEpDevice>, result: MhiResult);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeviceKind {
    /// The per-controller parent device; never matched to a driver.
    Controller,
    /// A channel-pair device.
    Transfer,
}

/// A logical device on the MHI endpoint bus.
pub struct MhiEpDevice {
    pub(crate) kind: DeviceKind,
    pub(crate) name: String,
    pub(crate) chan_name: Option<Arc<str>>,
    pub(crate) controller: Weak<ControllerShared>,
    pub(crate) ul_chan: Option<u32>,
    pub(crate) dl_chan: Option<u32>,
    pub(crate) driver: Mutex<Option<Arc<dyn MhiEpDriver>>>,
}

impl fmt::Debug for MhiEpDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MhiEpDevice")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

impl MhiEpDevice {
    /// Bus name: `mhi_ep<index>` for controller devices,
    /// `<controller>_<channel-name>` for transfer devices.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The channel name shared by the UL/DL pair, if this is a transfer
    /// device.
    pub fn channel_name(&self) -> Option<&str> {
        self.chan_name.as_deref()
    }

    pub fn is_controller(&self) -> bool {
        self.kind == DeviceKind::Controller
    }

    /// Sends `buf` to the host over the device's UL channel, consuming one
    /// host-queued transfer element.
    pub fn queue_buf(&self, buf: &[u8]) -> Result<(), crate::QueueBufError> {
        let controller = self.controller.upgrade().ok_or(crate::QueueBufError::ControllerGone)?;
        let ul_chan = self.ul_chan.ok_or(crate::QueueBufError::NoUlChannel)?;
        controller.queue_buf(ul_chan, buf)
    }
}

#[derive(Debug, Error)]
pub enum DriverRegisterError {
    #[error("driver {0} has an empty channel table")]
    EmptyIdTable(String),
    #[error("driver {0} is already registered")]
    AlreadyRegistered(String),
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("channel {chan} has no DL pair channel")]
    MissingPair { chan: u32 },
    #[error("channel {chan} is not configured")]
    NotConfigured { chan: u32 },
    #[error("channel pair name mismatch: UL {ul:?}, DL {dl:?}")]
    NameMismatch { ul: Arc<str>, dl: Arc<str> },
    #[error("device {name} already exists")]
    AlreadyExists { name: String },
    #[error(transparent)]
    Probe(anyhow::Error),
}

struct DriverEntry {
    name: String,
    id_table: &'static [MhiDeviceId],
    driver: Arc<dyn MhiEpDriver>,
}

/// Allocates the small controller indices, smallest free first.
struct IdAllocator {
    allocated: BTreeSet<u32>,
}

impl IdAllocator {
    fn allocate(&mut self) -> u32 {
        let mut id = 0;
        while self.allocated.contains(&id) {
            id += 1;
        }
        self.allocated.insert(id);
        id
    }

    fn release(&mut self, id: u32) {
        self.allocated.remove(&id);
    }
}

struct BusInner {
    drivers: Vec<DriverEntry>,
    indices: IdAllocator,
}

/// The bus registry shared by controllers and client drivers.
pub struct MhiEpBus {
    inner: Mutex<BusInner>,
}

impl MhiEpBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(BusInner {
                drivers: Vec::new(),
                indices: IdAllocator {
                    allocated: BTreeSet::new(),
                },
            }),
        })
    }

    /// Registers a client driver. Devices created afterwards match against
    /// `id_table` by channel name.
    pub fn register_driver(
        &self,
        name: impl Into<String>,
        id_table: &'static [MhiDeviceId],
        driver: Arc<dyn MhiEpDriver>,
    ) -> Result<(), DriverRegisterError> {
        let name = name.into();
        if id_table.is_empty() {
            return Err(DriverRegisterError::EmptyIdTable(name));
        }
        let mut inner = self.inner.lock();
        if inner.drivers.iter().any(|d| d.name == name) {
            return Err(DriverRegisterError::AlreadyRegistered(name));
        }
        tracing::debug!(driver = %name, "registered mhi endpoint driver");
        inner.drivers.push(DriverEntry {
            name,
            id_table,
            driver,
        });
        Ok(())
    }

    /// Removes a driver from the match table. Devices already bound stay
    /// bound until their controller unregisters.
    pub fn unregister_driver(&self, name: &str) {
        self.inner.lock().drivers.retain(|d| d.name != name);
    }

    /// Transfer devices match by exact channel name; controller devices are
    /// never offered for matching.
    pub(crate) fn match_driver(
        &self,
        chan_name: &str,
    ) -> Option<(Arc<dyn MhiEpDriver>, MhiDeviceId)> {
        let inner = self.inner.lock();
        for entry in &inner.drivers {
            if let Some(id) = entry.id_table.iter().find(|id| id.chan == chan_name) {
                return Some((entry.driver.clone(), *id));
            }
        }
        None
    }

    pub(crate) fn allocate_index(&self) -> u32 {
        self.inner.lock().indices.allocate()
    }

    pub(crate) fn release_index(&self, index: u32) {
        self.inner.lock().indices.release(index);
    }
}

impl ControllerShared {
    /// Creates the device for the channel pair starting at UL channel
    /// `ch_id`, binding both channels to it and probing a matching driver.
    pub(crate) fn create_device(
        self: &Arc<Self>,
        ch_id: u32,
    ) -> Result<Arc<MhiEpDevice>, DeviceError> {
        let ul_id = ch_id;
        let dl_id = ch_id + 1;
        if dl_id >= self.max_chan {
            return Err(DeviceError::MissingPair { chan: ul_id });
        }
        let ul_name = self.channels[ul_id as usize]
            .lock()
            .name
            .clone()
            .ok_or(DeviceError::NotConfigured { chan: ul_id })?;
        let dl_name = self.channels[dl_id as usize]
            .lock()
            .name
            .clone()
            .ok_or(DeviceError::NotConfigured { chan: dl_id })?;
        // Both channels of a pair must carry the same name.
        if ul_name != dl_name {
            return Err(DeviceError::NameMismatch {
                ul: ul_name,
                dl: dl_name,
            });
        }

        let device = Arc::new(MhiEpDevice {
            kind: DeviceKind::Transfer,
            name: format!("{}_{}", self.name, ul_name),
            chan_name: Some(ul_name.clone()),
            controller: Arc::downgrade(self),
            ul_chan: Some(ul_id),
            dl_chan: Some(dl_id),
            driver: Mutex::new(None),
        });

        // The device holds both channels while it exists.
        self.channels[ul_id as usize].lock().device = Some(device.clone());
        self.channels[dl_id as usize].lock().device = Some(device.clone());

        {
            let mut devices = self.devices.lock();
            if devices.iter().any(|d| d.name == device.name) {
                drop(devices);
                self.release_channel_refs(&device);
                return Err(DeviceError::AlreadyExists {
                    name: device.name.clone(),
                });
            }
            devices.push(device.clone());
        }
        tracing::debug!(device = %device.name, "created channel device");

        if let Some((driver, id)) = self.bus.match_driver(&ul_name) {
            // Wire the transfer callbacks before the driver's probe runs.
            self.channels[ul_id as usize].lock().xfer = Some(driver.clone());
            self.channels[dl_id as usize].lock().xfer = Some(driver.clone());
            *device.driver.lock() = Some(driver.clone());
            if let Err(err) = driver.probe(&device, &id) {
                tracing::error!(
                    device = %device.name,
                    error = err.as_ref() as &dyn std::error::Error,
                    "driver probe failed"
                );
                *device.driver.lock() = None;
                self.channels[ul_id as usize].lock().xfer = None;
                self.channels[dl_id as usize].lock().xfer = None;
                self.devices.lock().retain(|d| !Arc::ptr_eq(d, &device));
                self.release_channel_refs(&device);
                return Err(DeviceError::Probe(err));
            }
        }
        Ok(device)
    }

    fn release_channel_refs(&self, device: &Arc<MhiEpDevice>) {
        for chan_id in [device.ul_chan, device.dl_chan].into_iter().flatten() {
            self.channels[chan_id as usize].lock().device = None;
        }
    }

    /// Disconnects both channels from the client driver and invokes its
    /// remove hook. The disconnect notification is delivered through the
    /// bound callback before the callback is cleared.
    pub(crate) fn unbind_device(&self, device: &Arc<MhiEpDevice>) {
        let driver = device.driver.lock().take();
        for (chan_id, is_ul) in [(device.ul_chan, true), (device.dl_chan, false)] {
            let Some(chan_id) = chan_id else { continue };
            let mut chan = self.channels[chan_id as usize].lock();
            if let Some(bound) = chan.xfer.take() {
                let result = MhiResult::disconnected(chan.dir);
                if is_ul {
                    bound.ul_xfer_cb(device, result);
                } else {
                    bound.dl_xfer_cb(device, result);
                }
            }
            chan.state = ChannelState::DISABLED;
            chan.device = None;
        }
        if let Some(driver) = driver {
            driver.remove(device);
        }
    }
}
