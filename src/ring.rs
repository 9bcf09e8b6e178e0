// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The ring engine: circular element queues shared with the host through
//! host-memory ring contexts.
//!
//! Command and transfer rings are produced by the host and consumed here;
//! event rings are produced here and consumed by the host. Both directions
//! share one `Ring` type. For rings this side produces into, `rd_offset` is
//! the next slot this side writes and `wr_offset` mirrors the remote
//! consumer's boundary pointer, matching the MHI context field naming.

use crate::spec::u64_le;
use crate::spec::MhiRingElement;
use crate::spec::RingContext;
use crate::spec::RING_ELEMENT_SIZE;
use crate::transport::read_plain;
use crate::transport::write_plain;
use crate::transport::HostMemoryError;
use crate::transport::MhiEpTransport;
use std::mem::offset_of;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RingError {
    #[error("ring context has invalid length {0:#x}")]
    InvalidLength(u64),
    #[error("ring pointer {ptr:#x} is outside ring base {base:#x}+{len:#x}")]
    BadPointer { ptr: u64, base: u64, len: u64 },
    #[error("ring is full")]
    Full,
    #[error("ring has not been started")]
    NotStarted,
    #[error("error accessing ring memory")]
    Memory(#[from] HostMemoryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RingType {
    Command,
    Event,
    Channel,
}

#[derive(Debug)]
pub(crate) struct Ring {
    ty: RingType,
    pub(crate) started: bool,
    ctx_addr: u64,
    rbase: u64,
    size: u32,
    rd_offset: u32,
    wr_offset: u32,
    /// Interrupt vector, from the context of an event ring.
    msivec: u32,
    /// Associated event ring, from the context of a channel ring.
    er_index: u32,
}

impl Ring {
    pub fn new(ty: RingType) -> Self {
        Self {
            ty,
            started: false,
            ctx_addr: 0,
            rbase: 0,
            size: 0,
            rd_offset: 0,
            wr_offset: 0,
            msivec: 0,
            er_index: 0,
        }
    }

    /// Caches the ring context at `ctx_addr` and derives the element offsets
    /// from its read/write pointers.
    pub fn start(
        &mut self,
        transport: &dyn MhiEpTransport,
        ctx_addr: u64,
    ) -> Result<(), RingError> {
        let ctx: RingContext = read_plain(transport, ctx_addr)?;
        let rlen = ctx.rlen.get();
        if rlen == 0 || rlen % RING_ELEMENT_SIZE != 0 {
            return Err(RingError::InvalidLength(rlen));
        }
        let rbase = ctx.rbase.get();
        self.ctx_addr = ctx_addr;
        self.rbase = rbase;
        self.size = (rlen / RING_ELEMENT_SIZE) as u32;
        self.rd_offset = Self::offset_of_ptr(ctx.rp.get(), rbase, rlen)?;
        self.wr_offset = Self::offset_of_ptr(ctx.wp.get(), rbase, rlen)?;
        match self.ty {
            RingType::Event => self.msivec = ctx.msivec(),
            RingType::Channel => self.er_index = ctx.erindex(),
            RingType::Command => {}
        }
        self.started = true;
        Ok(())
    }

    /// Rewinds the ring to its unstarted state, dropping the cached context.
    pub fn reset(&mut self) {
        *self = Self::new(self.ty);
    }

    fn offset_of_ptr(ptr: u64, base: u64, len: u64) -> Result<u32, RingError> {
        // All fields are host-written; a ring wrapping the address space is
        // as malformed as a pointer outside it.
        let end = base
            .checked_add(len)
            .ok_or(RingError::BadPointer { ptr, base, len })?;
        if ptr < base || ptr >= end || (ptr - base) % RING_ELEMENT_SIZE != 0 {
            return Err(RingError::BadPointer { ptr, base, len });
        }
        Ok(((ptr - base) / RING_ELEMENT_SIZE) as u32)
    }

    fn element_addr(&self, offset: u32) -> u64 {
        self.rbase + u64::from(offset) * RING_ELEMENT_SIZE
    }

    pub fn msivec(&self) -> u32 {
        self.msivec
    }

    pub fn er_index(&self) -> u32 {
        self.er_index
    }

    /// Re-reads the remote side's write pointer from the ring context.
    pub fn update_write_offset(
        &mut self,
        transport: &dyn MhiEpTransport,
    ) -> Result<(), RingError> {
        if !self.started {
            return Err(RingError::NotStarted);
        }
        let wp: u64_le =
            read_plain(transport, self.ctx_addr + offset_of!(RingContext, wp) as u64)?;
        let len = u64::from(self.size) * RING_ELEMENT_SIZE;
        self.wr_offset = Self::offset_of_ptr(wp.get(), self.rbase, len)?;
        Ok(())
    }

    /// Publishes this side's read pointer into the ring context.
    fn publish_read_ptr(&self, transport: &dyn MhiEpTransport) -> Result<(), RingError> {
        let rp: u64_le = self.element_addr(self.rd_offset).into();
        write_plain(transport, self.ctx_addr + offset_of!(RingContext, rp) as u64, &rp)?;
        Ok(())
    }

    /// Whether elements remain between the read offset and the remote write
    /// pointer.
    pub fn has_pending(&self) -> bool {
        self.started && self.rd_offset != self.wr_offset
    }

    /// Host address of the element at the current read offset.
    pub fn current_read_ptr(&self) -> u64 {
        self.element_addr(self.rd_offset)
    }

    /// Reads the element at the current read offset without retiring it.
    pub fn read_element(
        &self,
        transport: &dyn MhiEpTransport,
    ) -> Result<MhiRingElement, RingError> {
        if !self.started {
            return Err(RingError::NotStarted);
        }
        Ok(read_plain(transport, self.current_read_ptr())?)
    }

    /// Retires the element at the read offset and publishes the new read
    /// pointer so the host sees the progress.
    pub fn inc_read_offset(&mut self, transport: &dyn MhiEpTransport) -> Result<(), RingError> {
        self.rd_offset = (self.rd_offset + 1) % self.size;
        self.publish_read_ptr(transport)
    }

    /// Producer side: appends one element and publishes the new read pointer.
    ///
    /// The remote consumer's boundary is refreshed first; the ring is full
    /// when one free slot would remain, same as any ring with a one-element
    /// separation between the two pointers.
    pub fn add_element(
        &mut self,
        transport: &dyn MhiEpTransport,
        element: &MhiRingElement,
    ) -> Result<(), RingError> {
        self.update_write_offset(transport)?;

        let num_free = if self.rd_offset < self.wr_offset {
            self.wr_offset - self.rd_offset - 1
        } else {
            (self.size - self.rd_offset) + self.wr_offset - 1
        };
        if num_free == 0 {
            return Err(RingError::Full);
        }

        write_plain(transport, self.element_addr(self.rd_offset), element)?;
        self.rd_offset = (self.rd_offset + 1) % self.size;
        self.publish_read_ptr(transport)
    }
}
