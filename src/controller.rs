// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Controller registration and the interrupt path.
//!
//! The backend transport owns the interrupt thread and calls
//! [`MhiEpController::handle_irq`] from it. The handler only reads and clears
//! status registers and queues work; everything that touches host memory runs
//! on the controller's worker thread.

use crate::channel::init_channels;
use crate::channel::Channel;
use crate::channel::ChannelConfig;
use crate::channel::ChannelConfigError;
use crate::device::DeviceKind;
use crate::device::MhiEpBus;
use crate::device::MhiEpDevice;
use crate::registers::Registers;
use crate::registers::MHI_CTRL_INT_STATUS_CRDB_MSK;
use crate::registers::MHI_CTRL_INT_STATUS_MSK;
use crate::ring::Ring;
use crate::ring::RingType;
use crate::spec::MhiEe;
use crate::spec::MhiState;
use crate::spec::MHI_MASK_CH_LEN;
use crate::spec::MHI_MASK_ROWS_CH_DB;
use crate::spec::MHI_MAX_CHANNELS;
use crate::spec::NR_OF_CMD_RINGS;
use crate::transport::MhiEpTransport;
use crate::workqueue::WorkQueue;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;

/// Registration parameters for one endpoint controller.
pub struct MhiEpControllerConfig {
    /// MHI version advertised to the host; must be nonzero.
    pub mhi_version: u32,
    /// Number of channel slots, 1 through 128.
    pub max_channels: u32,
    pub channels: Vec<ChannelConfig>,
}

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("MHI version must be nonzero")]
    InvalidVersion,
    #[error("channel count {0} out of range 1..=128")]
    InvalidChannelCount(u32),
    #[error("invalid channel configuration")]
    Channels(#[from] ChannelConfigError),
    #[error("failed to spawn the controller worker")]
    WorkQueue(#[source] std::io::Error),
}

/// Work deferred from the interrupt path, drained by the worker thread.
pub(crate) struct Pending {
    pub state_transitions: VecDeque<MhiState>,
    pub ch_db: VecDeque<u32>,
}

pub(crate) struct ControllerShared {
    pub(crate) bus: Arc<MhiEpBus>,
    pub(crate) transport: Arc<dyn MhiEpTransport>,
    pub(crate) regs: Registers,
    pub(crate) index: u32,
    pub(crate) name: String,
    pub(crate) max_chan: u32,
    pub(crate) channels: Vec<Mutex<Channel>>,
    pub(crate) cmd_rings: Vec<Mutex<Ring>>,
    pub(crate) event_rings: Mutex<BTreeMap<u32, Ring>>,
    pub(crate) pending: Mutex<Pending>,
    /// Taken (and destroyed) at shutdown; work queued afterwards is dropped.
    pub(crate) wq: Mutex<Option<WorkQueue>>,
    /// Mirror of the channel doorbell mask registers, one word per row.
    pub(crate) chdb_masks: [AtomicU32; MHI_MASK_ROWS_CH_DB as usize],
    pub(crate) irq_enabled: AtomicBool,
    pub(crate) devices: Mutex<Vec<Arc<MhiEpDevice>>>,
    controller_device: Mutex<Option<Arc<MhiEpDevice>>>,
    shut_down: AtomicBool,
}

impl MhiEpBus {
    /// Registers an endpoint controller on the bus, spawning its worker
    /// thread and advertising the MHI version and execution environment
    /// through the register file.
    pub fn register_controller(
        self: &Arc<Self>,
        transport: Arc<dyn MhiEpTransport>,
        config: MhiEpControllerConfig,
    ) -> Result<MhiEpController, RegisterError> {
        if config.mhi_version == 0 {
            return Err(RegisterError::InvalidVersion);
        }
        if config.max_channels == 0 || config.max_channels > MHI_MAX_CHANNELS {
            return Err(RegisterError::InvalidChannelCount(config.max_channels));
        }
        let channels = init_channels(config.max_channels, &config.channels)?;
        let cmd_rings = (0..NR_OF_CMD_RINGS)
            .map(|_| Mutex::new(Ring::new(RingType::Command)))
            .collect();
        let wq = WorkQueue::new("mhi_ep_wq").map_err(RegisterError::WorkQueue)?;

        let regs = Registers::new(transport.clone());
        regs.set_mhi_version(config.mhi_version);
        regs.set_exec_env(MhiEe::AMSS);

        // Infallible from here on; the index must be released on teardown.
        let index = self.allocate_index();
        let shared = Arc::new(ControllerShared {
            bus: self.clone(),
            transport,
            regs,
            index,
            name: format!("mhi_ep{index}"),
            max_chan: config.max_channels,
            channels,
            cmd_rings,
            event_rings: Mutex::new(BTreeMap::new()),
            pending: Mutex::new(Pending {
                state_transitions: VecDeque::new(),
                ch_db: VecDeque::new(),
            }),
            wq: Mutex::new(Some(wq)),
            chdb_masks: Default::default(),
            irq_enabled: AtomicBool::new(false),
            devices: Mutex::new(Vec::new()),
            controller_device: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        });

        let controller_device = Arc::new(MhiEpDevice {
            kind: DeviceKind::Controller,
            name: shared.name.clone(),
            chan_name: None,
            controller: Arc::downgrade(&shared),
            ul_chan: None,
            dl_chan: None,
            driver: Mutex::new(None),
        });
        *shared.controller_device.lock() = Some(controller_device);

        tracing::info!(
            controller = %shared.name,
            channels = config.max_channels,
            "registered MHI endpoint controller"
        );
        Ok(MhiEpController { shared })
    }
}

/// Handle to a registered endpoint controller. Dropping it unregisters the
/// controller.
pub struct MhiEpController {
    shared: Arc<ControllerShared>,
}

impl MhiEpController {
    /// Bus-unique controller index.
    pub fn index(&self) -> u32 {
        self.shared.index
    }

    /// Arms [`Self::handle_irq`]. Interrupts delivered before this are
    /// ignored.
    pub fn enable_irq(&self) {
        self.shared.irq_enabled.store(true, Ordering::SeqCst);
    }

    pub fn disable_irq(&self) {
        self.shared.irq_enabled.store(false, Ordering::SeqCst);
    }

    /// Called by the backend from its interrupt thread. Never blocks on host
    /// memory; ring work is deferred to the worker thread.
    pub fn handle_irq(&self) {
        self.shared.handle_irq();
    }

    /// Unregisters the controller: drains in-flight work, disconnects every
    /// channel device, and releases the controller index.
    pub fn unregister(self) {
        self.shared.shutdown();
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<ControllerShared> {
        &self.shared
    }
}

impl Drop for MhiEpController {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

impl ControllerShared {
    fn queue_work(
        self: &Arc<Self>,
        work: impl FnOnce(&Arc<ControllerShared>) + Send + 'static,
    ) {
        let wq = self.wq.lock();
        if let Some(wq) = wq.as_ref() {
            let shared = self.clone();
            wq.queue(move || work(&shared));
        }
    }

    pub(crate) fn handle_irq(self: &Arc<Self>) {
        if !self.irq_enabled.load(Ordering::SeqCst) {
            return;
        }
        let int_value = self.regs.ctrl_int_status();
        if int_value != 0 {
            self.regs.ctrl_int_clear(int_value);
        }
        if int_value & MHI_CTRL_INT_STATUS_MSK != 0 {
            // The requested state is sampled here, at interrupt time, so
            // back-to-back MHICTRL writes each get their own transition.
            let state = self.regs.requested_state();
            tracing::debug!(state = ?state, "host state transition request");
            self.pending.lock().state_transitions.push_back(state);
            self.queue_work(|shared| shared.state_transition_work());
        }
        if int_value & MHI_CTRL_INT_STATUS_CRDB_MSK != 0 {
            tracing::debug!("command ring doorbell");
            self.queue_work(|shared| shared.cmd_ring_work());
        }
        self.check_channel_interrupt();
    }

    fn check_channel_interrupt(self: &Arc<Self>) {
        let mut queued = false;
        for row in 0..MHI_MASK_ROWS_CH_DB {
            let status = self.regs.chdb_status(row);
            if status == 0 {
                continue;
            }
            let masked = status & self.chdb_masks[row as usize].load(Ordering::SeqCst);
            if masked != 0 {
                queued |= self.queue_channel_db(masked, row * MHI_MASK_CH_LEN);
            }
            // Clear exactly the bits observed, masked or not.
            self.regs.chdb_clear(row, status);
        }
        if queued {
            self.queue_work(|shared| shared.ch_ring_work());
        }
    }

    /// Queues the doorbell channel ids in `bits`, best effort: on allocation
    /// pressure the rest of the row is dropped rather than failing the
    /// interrupt path.
    fn queue_channel_db(&self, mut bits: u32, base: u32) -> bool {
        let mut ids: Vec<u32> = Vec::new();
        while bits != 0 {
            let bit = bits.trailing_zeros();
            bits &= !(1 << bit);
            let ch_id = base + bit;
            if ch_id >= self.max_chan {
                continue;
            }
            if ids.try_reserve(1).is_err() {
                break;
            }
            ids.push(ch_id);
        }
        if ids.is_empty() {
            return false;
        }
        self.pending.lock().ch_db.extend(ids);
        true
    }

    /// Waits for the worker to drain everything queued so far.
    #[cfg(test)]
    pub(crate) fn flush_wq(&self) {
        let (send, recv) = std::sync::mpsc::channel();
        {
            let wq = self.wq.lock();
            let Some(wq) = wq.as_ref() else { return };
            wq.queue(move || {
                let _ = send.send(());
            });
        }
        let _ = recv.recv();
    }

    /// Tears the controller down. Idempotent; also run on drop.
    pub(crate) fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.irq_enabled.store(false, Ordering::SeqCst);
        // Drain in-flight work before disconnecting anything.
        let wq = self.wq.lock().take();
        if let Some(wq) = wq {
            wq.destroy();
        }
        let devices = std::mem::take(&mut *self.devices.lock());
        for device in &devices {
            self.unbind_device(device);
        }
        *self.controller_device.lock() = None;
        self.bus.release_index(self.index);
        tracing::info!(controller = %self.name, "unregistered MHI endpoint controller");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelDirection;
    use crate::device::DeviceError;
    use crate::device::MhiDeviceId;
    use crate::registers::chdb_int_status;
    use crate::registers::EP_MHICTRL;
    use crate::registers::EP_MHISTATUS;
    use crate::registers::MHI_CTRL_INT_STATUS;
    use crate::spec::MhiCtrl;
    use crate::spec::MhiPktType;
    use crate::test_helpers::test_controller;
    use crate::test_helpers::ChannelSpec;
    use crate::test_helpers::MockTransport;
    use crate::test_helpers::TestDriver;
    use crate::test_helpers::EVENT_RING_0;
    use crate::test_helpers::LOOPBACK_CONFIG;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn register_validates_config() {
        let bus = MhiEpBus::new();
        let transport = Arc::new(MockTransport::new(0x1000));
        assert!(matches!(
            bus.register_controller(
                transport.clone(),
                MhiEpControllerConfig {
                    mhi_version: 0,
                    max_channels: 4,
                    channels: vec![],
                }
            ),
            Err(RegisterError::InvalidVersion)
        ));
        for max_channels in [0, 129] {
            assert!(matches!(
                bus.register_controller(
                    transport.clone(),
                    MhiEpControllerConfig {
                        mhi_version: 0x1000000,
                        max_channels,
                        channels: vec![],
                    }
                ),
                Err(RegisterError::InvalidChannelCount(_))
            ));
        }
        assert!(matches!(
            bus.register_controller(
                transport,
                MhiEpControllerConfig {
                    mhi_version: 0x1000000,
                    max_channels: 4,
                    channels: vec![ChannelConfig {
                        num: 0,
                        name: "X".into(),
                        dir: ChannelDirection::Bidirectional,
                    }],
                }
            ),
            Err(RegisterError::Channels(_))
        ));
    }

    #[test]
    fn failed_registration_leaks_nothing() {
        // A failed registration leaves the bus as it was.
        let (bus, controller, transport) = test_controller(LOOPBACK_CONFIG);
        assert_eq!(controller.index(), 0);
        assert!(bus
            .register_controller(
                transport.clone(),
                MhiEpControllerConfig {
                    mhi_version: 0,
                    max_channels: 4,
                    channels: vec![],
                },
            )
            .is_err());
        let second = bus
            .register_controller(
                transport,
                MhiEpControllerConfig {
                    mhi_version: 0x1000000,
                    max_channels: 4,
                    channels: vec![],
                },
            )
            .unwrap();
        // The failed attempt consumed no index.
        assert_eq!(second.index(), 1);
    }

    #[test]
    fn unregister_frees_the_index() {
        let (bus, controller, transport) = test_controller(LOOPBACK_CONFIG);
        assert_eq!(controller.index(), 0);
        controller.unregister();
        let again = bus
            .register_controller(
                transport,
                MhiEpControllerConfig {
                    mhi_version: 0x1000000,
                    max_channels: 4,
                    channels: vec![],
                },
            )
            .unwrap();
        assert_eq!(again.index(), 0);
    }

    #[test]
    fn mismatched_pair_names_reject_device_creation() {
        // Both channels of a pair must share one name.
        let config: &[ChannelSpec] = &[
            ChannelSpec {
                num: 0,
                name: "A",
                dir: ChannelDirection::ToHost,
            },
            ChannelSpec {
                num: 1,
                name: "B",
                dir: ChannelDirection::FromHost,
            },
        ];
        let (_bus, controller, _transport) = test_controller(config);
        assert!(matches!(
            controller.shared().create_device(0),
            Err(DeviceError::NameMismatch { .. })
        ));
        assert!(controller.shared().devices.lock().is_empty());
    }

    #[test]
    fn irq_is_gated_until_enabled() {
        let (_bus, controller, transport) = test_controller(LOOPBACK_CONFIG);
        transport.set_reg(MHI_CTRL_INT_STATUS, MHI_CTRL_INT_STATUS_MSK);
        controller.handle_irq();
        // Not armed: the status register is untouched and nothing is queued.
        assert_eq!(transport.reg(MHI_CTRL_INT_STATUS), MHI_CTRL_INT_STATUS_MSK);
        assert!(controller.shared().pending.lock().state_transitions.is_empty());
    }

    #[test]
    fn ctrl_interrupt_samples_mhictrl_and_transitions() {
        let (_bus, controller, transport) = test_controller(LOOPBACK_CONFIG);
        controller.enable_irq();
        transport.set_reg(
            EP_MHICTRL,
            MhiCtrl::new().with_mhistate(MhiState::M0.0).into_bits(),
        );
        transport.set_reg(MHI_CTRL_INT_STATUS, MHI_CTRL_INT_STATUS_MSK);
        controller.handle_irq();
        controller.shared().flush_wq();

        assert_eq!(transport.reg(MHI_CTRL_INT_STATUS), 0);
        assert_eq!(controller.shared().regs.current_state(), MhiState::M0);
        let events = transport.read_events(EVENT_RING_0);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].pkt_type(), MhiPktType::STATE_CHANGE_EVENT);
        assert_eq!(events[0].mhistate(), MhiState::M0);
    }

    #[test]
    fn channel_doorbell_rows_map_to_channel_ids() {
        // Row 1 bit 3 is channel 35.
        let (_bus, controller, transport) = test_controller(LOOPBACK_CONFIG);
        let shared = controller.shared();
        assert!(shared.queue_channel_db(1 << 3, 32));
        assert_eq!(shared.pending.lock().ch_db.pop_front(), Some(35));

        // Doorbells past max_chan are skipped.
        assert!(!shared.queue_channel_db(1 << 31, 96));
        assert!(shared.pending.lock().ch_db.is_empty());

        // Status bits are cleared whether masked in or not.
        controller.enable_irq();
        transport.set_reg(chdb_int_status(1), 1 << 3);
        controller.handle_irq();
        assert_eq!(transport.reg(chdb_int_status(1)), 0);
    }

    #[test]
    fn masked_out_doorbells_are_not_queued() {
        let (_bus, controller, transport) = test_controller(LOOPBACK_CONFIG);
        let shared = controller.shared();
        controller.enable_irq();
        // Channel 0's doorbell rings but its mask bit was never enabled.
        transport.set_reg(chdb_int_status(0), 1 << 0);
        controller.handle_irq();
        shared.flush_wq();
        assert_eq!(transport.reg(chdb_int_status(0)), 0);
        assert!(shared.pending.lock().ch_db.is_empty());
    }

    #[test]
    fn unregister_waits_for_in_flight_work() {
        // Teardown blocks until the worker finishes the handler it is in.
        let (_bus, controller, transport) = test_controller(LOOPBACK_CONFIG);
        controller.enable_irq();

        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = std::sync::Mutex::new(release_rx);
        transport.set_write_hook(move |offset, _value| {
            if offset == EP_MHISTATUS {
                entered_tx.send(()).unwrap();
                release_rx.lock().unwrap().recv().unwrap();
            }
        });

        transport.set_reg(
            EP_MHICTRL,
            MhiCtrl::new().with_mhistate(MhiState::M0.0).into_bits(),
        );
        transport.set_reg(MHI_CTRL_INT_STATUS, MHI_CTRL_INT_STATUS_MSK);
        controller.handle_irq();
        entered_rx.recv().unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        let join = std::thread::spawn(move || {
            controller.unregister();
            done_tx.send(()).unwrap();
        });
        // The worker is stalled inside the transition; unregister must wait.
        assert!(done_rx.recv_timeout(Duration::from_millis(50)).is_err());
        release_tx.send(()).unwrap();
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        join.join().unwrap();
    }

    #[test]
    fn unregister_disconnects_devices() {
        static IDS: &[MhiDeviceId] = &[MhiDeviceId { chan: "LOOPBACK" }];
        let (bus, controller, _transport) = test_controller(LOOPBACK_CONFIG);
        let driver = Arc::new(TestDriver::new());
        bus.register_driver("test", IDS, driver.clone()).unwrap();
        controller.shared().create_device(0).unwrap();
        driver.clear_log();

        controller.unregister();
        assert_eq!(
            driver.log(),
            vec![
                "ul_xfer_cb mhi_ep0_LOOPBACK disconnected 0",
                "dl_xfer_cb mhi_ep0_LOOPBACK disconnected 0",
                "remove mhi_ep0_LOOPBACK",
            ]
        );
    }
}
