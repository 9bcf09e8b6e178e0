// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! MHI (Modem Host Interface) endpoint controller stack.
//!
//! This crate implements the device side of MHI: the host drives command and
//! transfer rings in its own memory and rings doorbells over the transport;
//! this side consumes them, runs the channel state machines, and produces
//! completion and state-change events back into host-owned event rings.
//!
//! A transport backend (typically a PCIe endpoint function) provides register,
//! host-memory, and interrupt access through [`MhiEpTransport`] and registers
//! a controller on an [`MhiEpBus`]. Client drivers register against channel
//! names; when the host starts a channel pair, the bus creates an
//! [`MhiEpDevice`] and probes the matching [`MhiEpDriver`].
//!
//! The interrupt path ([`MhiEpController::handle_irq`]) never touches host
//! memory; all ring processing is deferred to a per-controller worker thread.

mod channel;
mod controller;
mod device;
mod event;
mod process;
mod registers;
mod ring;
mod sm;
pub mod spec;
#[cfg(test)]
mod test_helpers;
mod transport;
mod workqueue;

pub use channel::ChannelConfig;
pub use channel::ChannelConfigError;
pub use channel::ChannelDirection;
pub use channel::MhiResult;
pub use channel::TransferStatus;
pub use controller::MhiEpController;
pub use controller::MhiEpControllerConfig;
pub use controller::RegisterError;
pub use device::DeviceError;
pub use device::DriverRegisterError;
pub use device::MhiDeviceId;
pub use device::MhiEpBus;
pub use device::MhiEpDevice;
pub use device::MhiEpDriver;
pub use event::EventError;
pub use process::QueueBufError;
pub use ring::RingError;
pub use transport::HostMemoryError;
pub use transport::MhiEpTransport;
