// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Event delivery to the host: appending elements to event rings and raising
//! the ring's interrupt vector.

use crate::controller::ControllerShared;
use crate::ring::Ring;
use crate::ring::RingError;
use crate::ring::RingType;
use crate::spec::MhiCompletionCode;
use crate::spec::MhiEe;
use crate::spec::MhiRingElement;
use crate::spec::MhiState;
use crate::spec::RING_CTX_SIZE;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("failed to start event ring {index}")]
    Start {
        index: u32,
        #[source]
        source: RingError,
    },
    #[error("failed to append to event ring {index}")]
    Append {
        index: u32,
        #[source]
        source: RingError,
    },
}

impl ControllerShared {
    /// Appends `element` to event ring `ring_index`, starting the ring from
    /// its host context on first use. Raises the ring's interrupt vector
    /// unless `bei` suppresses it.
    pub(crate) fn send_event(
        &self,
        ring_index: u32,
        element: &MhiRingElement,
        bei: bool,
    ) -> Result<(), EventError> {
        let vector;
        {
            let mut event_rings = self.event_rings.lock();
            let ring = event_rings
                .entry(ring_index)
                .or_insert_with(|| Ring::new(RingType::Event));
            if !ring.started {
                let ctx_addr =
                    self.regs.event_ctx_base() + u64::from(ring_index) * RING_CTX_SIZE;
                ring.start(self.transport.as_ref(), ctx_addr).map_err(|source| {
                    EventError::Start {
                        index: ring_index,
                        source,
                    }
                })?;
            }
            ring.add_element(self.transport.as_ref(), element)
                .map_err(|source| EventError::Append {
                    index: ring_index,
                    source,
                })?;
            vector = ring.msivec();
        }
        // Interrupt outside the ring lock.
        if !bei {
            self.transport.raise_irq(vector);
        }
        Ok(())
    }

    /// Reports an MHI state change to the host on the primary event ring.
    pub(crate) fn send_state_change_event(&self, state: MhiState) -> Result<(), EventError> {
        self.send_event(0, &MhiRingElement::state_change(state), false)
    }

    /// Reports an execution-environment change on the primary event ring.
    pub(crate) fn send_ee_event(&self, env: MhiEe) -> Result<(), EventError> {
        self.send_event(0, &MhiRingElement::ee_event(env), false)
    }

    /// Completes the command at `cmd_ptr` on the primary event ring.
    pub(crate) fn send_cmd_comp_event(
        &self,
        code: MhiCompletionCode,
        cmd_ptr: u64,
    ) -> Result<(), EventError> {
        self.send_event(0, &MhiRingElement::cmd_completion(code, cmd_ptr), false)
    }

    /// Completes the transfer element at `tre_ptr` of channel `chan` on the
    /// channel's event ring.
    pub(crate) fn send_completion_event(
        &self,
        ring_index: u32,
        chan: u32,
        tre_ptr: u64,
        len: u32,
        code: MhiCompletionCode,
        bei: bool,
    ) -> Result<(), EventError> {
        self.send_event(
            ring_index,
            &MhiRingElement::transfer_completion(chan as u8, code, len, tre_ptr),
            bei,
        )
    }
}
