// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Shared test infrastructure: an in-memory transport backend, a canned
//! controller fixture, and a logging client driver.

use crate::channel::ChannelConfig;
use crate::channel::ChannelDirection;
use crate::channel::MhiResult;
use crate::channel::TransferStatus;
use crate::controller::MhiEpController;
use crate::controller::MhiEpControllerConfig;
use crate::device::MhiDeviceId;
use crate::device::MhiEpBus;
use crate::device::MhiEpDevice;
use crate::device::MhiEpDriver;
use crate::registers::chdb_int_clear;
use crate::registers::chdb_int_status;
use crate::registers::EP_CCABAP_LOWER;
use crate::registers::EP_CRCBAP_LOWER;
use crate::registers::EP_ECABAP_LOWER;
use crate::registers::MHI_CTRL_INT_CLEAR;
use crate::registers::MHI_CTRL_INT_STATUS;
use crate::spec::MhiRingElement;
use crate::spec::RingContext;
use crate::spec::MHI_MASK_ROWS_CH_DB;
use crate::spec::RING_CTX_SIZE;
use crate::spec::RING_ELEMENT_SIZE;
use crate::transport::HostMemoryError;
use crate::transport::MhiEpTransport;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

// Host memory layout used by the controller fixture.
const EVENT_CTX_BASE: u64 = 0x0;
const CHAN_CTX_BASE: u64 = 0x1000;
const CMD_CTX_BASE: u64 = 0x3000;
const CMD_RING_BASE: u64 = 0x8000;

const fn channel_ring_base(ch_id: u32) -> u64 {
    0x9000 + ch_id as u64 * 0x400
}

#[derive(Debug, Clone, Copy)]
pub struct EventRingFixture {
    pub index: u32,
    pub rbase: u64,
    pub elements: u64,
    pub msivec: u32,
}

impl EventRingFixture {
    fn ctx_addr(&self) -> u64 {
        EVENT_CTX_BASE + u64::from(self.index) * RING_CTX_SIZE
    }
}

pub const EVENT_RING_0: EventRingFixture = EventRingFixture {
    index: 0,
    rbase: 0x4000,
    elements: 64,
    msivec: 5,
};

type WriteHook = Box<dyn Fn(u32, u32) + Send + Sync>;

/// A transport backend over a plain byte vector, with write-one-to-clear
/// semantics on the interrupt clear registers.
pub struct MockTransport {
    regs: Mutex<HashMap<u32, u32>>,
    mem: Mutex<Vec<u8>>,
    irqs: Mutex<Vec<u32>>,
    write_hook: Mutex<Option<WriteHook>>,
}

impl MockTransport {
    pub fn new(mem_size: usize) -> Self {
        Self {
            regs: Mutex::new(HashMap::new()),
            mem: Mutex::new(vec![0; mem_size]),
            irqs: Mutex::new(Vec::new()),
            write_hook: Mutex::new(None),
        }
    }

    pub fn set_reg(&self, offset: u32, value: u32) {
        self.regs.lock().insert(offset, value);
    }

    pub fn reg(&self, offset: u32) -> u32 {
        self.regs.lock().get(&offset).copied().unwrap_or(0)
    }

    /// Installs a hook observing every register write, on the writer's
    /// thread. Lets tests stall the worker mid-handler.
    pub fn set_write_hook(&self, hook: impl Fn(u32, u32) + Send + Sync + 'static) {
        *self.write_hook.lock() = Some(Box::new(hook));
    }

    pub fn write_bytes(&self, addr: u64, data: &[u8]) {
        let addr = addr as usize;
        self.mem.lock()[addr..addr + data.len()].copy_from_slice(data);
    }

    pub fn read_bytes(&self, addr: u64, len: usize) -> Vec<u8> {
        let addr = addr as usize;
        self.mem.lock()[addr..addr + len].to_vec()
    }

    pub fn write_mem<T: IntoBytes + Immutable>(&self, addr: u64, value: &T) {
        self.write_bytes(addr, value.as_bytes());
    }

    pub fn read_mem<T: FromBytes + IntoBytes + Immutable>(&self, addr: u64) -> T {
        let mut value = T::new_zeroed();
        let len = value.as_bytes().len();
        value.as_mut_bytes().copy_from_slice(&self.read_bytes(addr, len));
        value
    }

    /// Moves the host-owned write pointer of the ring context at `ctx_addr`.
    pub fn set_ctx_wp(&self, ctx_addr: u64, wp: u64) {
        self.write_mem(ctx_addr + 36, &crate::spec::u64_le::from(wp));
    }

    /// The endpoint-owned read pointer of the ring context at `ctx_addr`.
    pub fn ctx_rp(&self, ctx_addr: u64) -> u64 {
        self.read_mem::<crate::spec::u64_le>(ctx_addr + 28).get()
    }

    pub fn irqs(&self) -> Vec<u32> {
        self.irqs.lock().clone()
    }

    pub fn clear_irqs(&self) {
        self.irqs.lock().clear();
    }

    pub fn setup_event_ring(&self, fixture: EventRingFixture) {
        self.setup_event_ring_sized(fixture, fixture.elements);
    }

    pub fn setup_event_ring_sized(&self, fixture: EventRingFixture, elements: u64) {
        let ctx = RingContext::new_event(fixture.msivec, fixture.rbase, elements);
        self.write_mem(fixture.ctx_addr(), &ctx);
    }

    /// Event ring elements produced so far, per the published read pointer.
    pub fn read_events(&self, fixture: EventRingFixture) -> Vec<MhiRingElement> {
        let rp = self.ctx_rp(fixture.ctx_addr());
        let count = (rp - fixture.rbase) / RING_ELEMENT_SIZE;
        (0..count)
            .map(|i| self.read_mem(fixture.rbase + i * RING_ELEMENT_SIZE))
            .collect()
    }

    pub fn chan_ctx_addr(&self, ch_id: u32) -> u64 {
        CHAN_CTX_BASE + u64::from(ch_id) * RING_CTX_SIZE
    }

    /// Places an idle transfer ring for `ch_id` in host memory, event ring 0.
    pub fn setup_channel_ring(&self, ch_id: u32, elements: u64) -> u64 {
        let rbase = channel_ring_base(ch_id);
        let ctx = RingContext::new_channel(0, rbase, elements);
        self.write_mem(self.chan_ctx_addr(ch_id), &ctx);
        rbase
    }

    pub fn setup_cmd_ring(&self, elements: u64) -> u64 {
        let ctx = RingContext::new_command(CMD_RING_BASE, elements);
        self.write_mem(CMD_CTX_BASE, &ctx);
        CMD_RING_BASE
    }

    /// Queues a command at slot `index` and advances the command ring's write
    /// pointer past it, as the host would before ringing the doorbell.
    pub fn push_cmd(&self, index: u64, element: &MhiRingElement) {
        self.write_mem(CMD_RING_BASE + index * RING_ELEMENT_SIZE, element);
        self.set_ctx_wp(CMD_CTX_BASE, CMD_RING_BASE + (index + 1) * RING_ELEMENT_SIZE);
    }

    /// Queues a transfer element at slot `index` of `ch_id`'s ring and
    /// advances the ring's write pointer past it.
    pub fn push_transfer(&self, ch_id: u32, index: u64, element: &MhiRingElement) {
        let rbase = channel_ring_base(ch_id);
        self.write_mem(rbase + index * RING_ELEMENT_SIZE, element);
        self.set_ctx_wp(self.chan_ctx_addr(ch_id), rbase + (index + 1) * RING_ELEMENT_SIZE);
    }
}

impl MhiEpTransport for MockTransport {
    fn read_register(&self, offset: u32) -> u32 {
        self.reg(offset)
    }

    fn write_register(&self, offset: u32, value: u32) {
        if let Some(hook) = self.write_hook.lock().as_ref() {
            hook(offset, value);
        }
        let mut regs = self.regs.lock();
        let clear_target = if offset == MHI_CTRL_INT_CLEAR {
            Some(MHI_CTRL_INT_STATUS)
        } else {
            (0..MHI_MASK_ROWS_CH_DB)
                .find(|&row| offset == chdb_int_clear(row))
                .map(chdb_int_status)
        };
        match clear_target {
            Some(status) => {
                *regs.entry(status).or_default() &= !value;
            }
            None => {
                regs.insert(offset, value);
            }
        }
    }

    fn read_from_host(&self, addr: u64, data: &mut [u8]) -> Result<(), HostMemoryError> {
        let mem = self.mem.lock();
        let start = addr as usize;
        let end = start + data.len();
        if end > mem.len() {
            return Err(HostMemoryError::Unmapped {
                addr,
                len: data.len(),
            });
        }
        data.copy_from_slice(&mem[start..end]);
        Ok(())
    }

    fn write_to_host(&self, addr: u64, data: &[u8]) -> Result<(), HostMemoryError> {
        let mut mem = self.mem.lock();
        let start = addr as usize;
        let end = start + data.len();
        if end > mem.len() {
            return Err(HostMemoryError::Unmapped {
                addr,
                len: data.len(),
            });
        }
        mem[start..end].copy_from_slice(data);
        Ok(())
    }

    fn raise_irq(&self, vector: u32) {
        self.irqs.lock().push(vector);
    }
}

/// A channel-table entry with a static name, convenient for fixtures.
#[derive(Debug, Clone, Copy)]
pub struct ChannelSpec {
    pub num: u32,
    pub name: &'static str,
    pub dir: ChannelDirection,
}

pub const LOOPBACK_CONFIG: &[ChannelSpec] = &[
    ChannelSpec {
        num: 0,
        name: "LOOPBACK",
        dir: ChannelDirection::ToHost,
    },
    ChannelSpec {
        num: 1,
        name: "LOOPBACK",
        dir: ChannelDirection::FromHost,
    },
    ChannelSpec {
        num: 2,
        name: "SAHARA",
        dir: ChannelDirection::ToHost,
    },
    ChannelSpec {
        num: 3,
        name: "SAHARA",
        dir: ChannelDirection::FromHost,
    },
];

/// A registered controller over a [`MockTransport`] with the context bases
/// programmed and event ring 0 live.
pub fn test_controller(
    channels: &[ChannelSpec],
) -> (Arc<MhiEpBus>, MhiEpController, Arc<MockTransport>) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let transport = Arc::new(MockTransport::new(0x2_0000));
    transport.set_reg(EP_ECABAP_LOWER, EVENT_CTX_BASE as u32);
    transport.set_reg(EP_CCABAP_LOWER, CHAN_CTX_BASE as u32);
    transport.set_reg(EP_CRCBAP_LOWER, CMD_CTX_BASE as u32);
    transport.setup_event_ring(EVENT_RING_0);

    let bus = MhiEpBus::new();
    let controller = bus
        .register_controller(
            transport.clone(),
            MhiEpControllerConfig {
                mhi_version: 0x1000000,
                // Two doorbell rows' worth, so row arithmetic is exercised.
                max_channels: 64,
                channels: channels
                    .iter()
                    .map(|c| ChannelConfig {
                        num: c.num,
                        name: c.name.to_owned(),
                        dir: c.dir,
                    })
                    .collect(),
            },
        )
        .unwrap();
    (bus, controller, transport)
}

/// A driver that logs every bus callback and records transfer results.
pub struct TestDriver {
    log: Mutex<Vec<String>>,
    results: Mutex<Vec<MhiResult>>,
    fail_probe: AtomicBool,
}

impl TestDriver {
    pub fn new() -> Self {
        Self {
            log: Mutex::new(Vec::new()),
            results: Mutex::new(Vec::new()),
            fail_probe: AtomicBool::new(false),
        }
    }

    pub fn fail_probe(&self) {
        self.fail_probe.store(true, Ordering::SeqCst);
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn clear_log(&self) {
        self.log.lock().clear();
    }

    pub fn take_results(&self) -> Vec<MhiResult> {
        std::mem::take(&mut self.results.lock())
    }

    fn log_xfer(&self, which: &str, device: &MhiEpDevice, result: MhiResult) {
        let status = match result.transaction_status {
            Ok(()) => "ok",
            Err(TransferStatus::Disconnected) => "disconnected",
        };
        self.log.lock().push(format!(
            "{which} {} {status} {}",
            device.name(),
            result.bytes_xferd
        ));
        self.results.lock().push(result);
    }
}

impl MhiEpDriver for TestDriver {
    fn probe(&self, device: &Arc<MhiEpDevice>, _id: &MhiDeviceId) -> anyhow::Result<()> {
        self.log.lock().push(format!("probe {}", device.name()));
        if self.fail_probe.load(Ordering::SeqCst) {
            anyhow::bail!("probe failure injected");
        }
        Ok(())
    }

    fn remove(&self, device: &Arc<MhiEpDevice>) {
        self.log.lock().push(format!("remove {}", device.name()));
    }

    fn ul_xfer_cb(&self, device: &Arc<MhiEpDevice>, result: MhiResult) {
        self.log_xfer("ul_xfer_cb", device, result);
    }

    fn dl_xfer_cb(&self, device: &Arc<MhiEpDevice>, result: MhiResult) {
        self.log_xfer("dl_xfer_cb", device, result);
    }
}
