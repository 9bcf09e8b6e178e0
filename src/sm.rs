// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! MHI state-machine transitions, run on the controller's work queue.
//!
//! The interrupt path queues the host's requested states; the worker drains
//! them here in arrival order, so back-to-back MHICTRL writes are observed
//! in the order the host issued them.

use crate::controller::ControllerShared;
use crate::spec::ChannelState;
use crate::spec::MhiState;

impl ControllerShared {
    /// Drains every queued state transition and applies each in FIFO order.
    pub(crate) fn state_transition_work(&self) {
        let transitions = std::mem::take(&mut self.pending.lock().state_transitions);
        for state in transitions {
            let result = match state {
                MhiState::M0 => self.set_m0_state(),
                MhiState::M3 => self.set_m3_state(),
                other => {
                    tracing::error!(state = ?other, "unsupported MHI state transition");
                    continue;
                }
            };
            if let Err(err) = result {
                tracing::error!(
                    state = ?state,
                    error = &err as &dyn std::error::Error,
                    "MHI state transition failed"
                );
            }
        }
    }

    /// Enters M0. Resumes suspended channels when coming back from M3.
    fn set_m0_state(&self) -> Result<(), crate::EventError> {
        let old_state = self.regs.current_state();
        self.regs.set_state(MhiState::M0);
        if old_state == MhiState::M3 {
            self.resume_channels();
        }
        self.send_state_change_event(MhiState::M0)
    }

    /// Enters M3, suspending all running channels first.
    fn set_m3_state(&self) -> Result<(), crate::EventError> {
        self.suspend_channels();
        self.regs.set_state(MhiState::M3);
        self.send_state_change_event(MhiState::M3)
    }

    /// Reports a fatal controller error to the host.
    pub(crate) fn handle_syserr(&self) {
        self.regs.set_state(MhiState::SYS_ERR);
        if let Err(err) = self.send_state_change_event(MhiState::SYS_ERR) {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "failed to report SYS_ERR to the host"
            );
        }
    }

    fn suspend_channels(&self) {
        for chan in &self.channels {
            let mut chan = chan.lock();
            if chan.state == ChannelState::RUNNING {
                chan.state = ChannelState::SUSPENDED;
                self.mirror_channel_state(chan.id, ChannelState::SUSPENDED);
            }
        }
    }

    fn resume_channels(&self) {
        for chan in &self.channels {
            let mut chan = chan.lock();
            if chan.state == ChannelState::SUSPENDED {
                chan.state = ChannelState::RUNNING;
                self.mirror_channel_state(chan.id, ChannelState::RUNNING);
            }
        }
    }
}
