// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The contract between the MHI endpoint core and the physical transport
//! backend (a PCIe endpoint function driver, a test harness, ...).

use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

/// An error accessing host memory through the transport.
#[derive(Debug, Error)]
pub enum HostMemoryError {
    /// The host address range is not mapped for bus-master access.
    #[error("host address range {addr:#x}+{len:#x} is not mapped")]
    Unmapped { addr: u64, len: usize },
    /// The transport link is down.
    #[error("transport link is down")]
    LinkDown,
}

/// Services the transport backend provides to the controller core.
///
/// The backend owns the physical interrupt line: it is expected to call
/// [`MhiEpController::handle_irq`](crate::MhiEpController::handle_irq) from its
/// interrupt context whenever the line fires. `read_from_host`/`write_to_host`
/// are bus-master accesses to host memory (ring storage, ring contexts, data
/// buffers) and may be called concurrently from the controller's worker.
pub trait MhiEpTransport: Send + Sync {
    /// Reads a 32-bit register from the endpoint MMIO register file.
    fn read_register(&self, offset: u32) -> u32;

    /// Writes a 32-bit register in the endpoint MMIO register file.
    fn write_register(&self, offset: u32, value: u32);

    /// Reads `data.len()` bytes of host memory at bus address `addr`.
    fn read_from_host(&self, addr: u64, data: &mut [u8]) -> Result<(), HostMemoryError>;

    /// Writes `data` to host memory at bus address `addr`.
    fn write_to_host(&self, addr: u64, data: &[u8]) -> Result<(), HostMemoryError>;

    /// Signals the host on the given event ring interrupt vector.
    fn raise_irq(&self, vector: u32);
}

pub(crate) fn read_plain<T: FromBytes + IntoBytes>(
    transport: &dyn MhiEpTransport,
    addr: u64,
) -> Result<T, HostMemoryError> {
    let mut value = T::new_zeroed();
    transport.read_from_host(addr, value.as_mut_bytes())?;
    Ok(value)
}

pub(crate) fn write_plain<T: IntoBytes + Immutable>(
    transport: &dyn MhiEpTransport,
    addr: u64,
    value: &T,
) -> Result<(), HostMemoryError> {
    transport.write_to_host(addr, value.as_bytes())
}
