// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Constants and structures defined by the MHI specification, as seen from the
//! endpoint side of the link.

use bitfield_struct::bitfield;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub use packed_nums::*;

#[expect(non_camel_case_types)]
mod packed_nums {
    pub type u32_le = zerocopy::U32<zerocopy::LittleEndian>;
    pub type u64_le = zerocopy::U64<zerocopy::LittleEndian>;
}

/// Number of command rings per controller.
pub const NR_OF_CMD_RINGS: usize = 1;

/// Channel doorbell interrupt rows.
pub const MHI_MASK_ROWS_CH_DB: u32 = 4;
/// Channels covered by one doorbell interrupt row.
pub const MHI_MASK_CH_LEN: u32 = 32;
/// Doorbell ceiling on the number of channels a controller can expose.
pub const MHI_MAX_CHANNELS: u32 = MHI_MASK_ROWS_CH_DB * MHI_MASK_CH_LEN;

macro_rules! open_consts {
    ($(#[$attr:meta])* $vis:vis struct $name:ident($repr:ty) { $($(#[$fattr:meta])* $const:ident = $val:expr,)* }) => {
        $(#[$attr])*
        #[derive(Copy, Clone, PartialEq, Eq, Hash, IntoBytes, Immutable, KnownLayout, FromBytes)]
        $vis struct $name(pub $repr);

        impl $name {
            $($(#[$fattr])* pub const $const: Self = Self($val);)*
        }

        impl core::fmt::Debug for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                match *self {
                    $(Self::$const => f.pad(stringify!($const)),)*
                    Self(other) => write!(f, "{}({:#x})", stringify!($name), other),
                }
            }
        }
    };
}

open_consts! {
    /// Ring element types, shared between transfer, command and event rings.
    pub struct MhiPktType(u8) {
        NOOP = 1,
        TRANSFER = 2,
        RESET_CHAN_CMD = 16,
        STOP_CHAN_CMD = 17,
        START_CHAN_CMD = 18,
        STATE_CHANGE_EVENT = 32,
        CMD_COMPLETION_EVENT = 33,
        TX_EVENT = 34,
        EE_EVENT = 64,
    }
}

open_consts! {
    /// MHI power states, as carried in MHICTRL/MHISTATUS and state-change
    /// events.
    pub struct MhiState(u8) {
        RESET = 0,
        READY = 1,
        M0 = 2,
        M1 = 3,
        M2 = 4,
        M3 = 5,
        SYS_ERR = 0xff,
    }
}

open_consts! {
    /// Execution environments reported through the BHI EXECENV register and EE
    /// events.
    pub struct MhiEe(u8) {
        PBL = 0,
        SBL = 1,
        AMSS = 2,
        RDDM = 3,
    }
}

open_consts! {
    /// Event completion codes.
    pub struct MhiCompletionCode(u8) {
        INVALID = 0,
        SUCCESS = 1,
        EOT = 2,
        OVERFLOW = 3,
        EOB = 4,
        OOB = 5,
        DB_MODE = 6,
        UNDEFINED_ERR = 16,
        BAD_TRE = 17,
    }
}

open_consts! {
    /// Channel states mirrored into the channel context `chcfg` word.
    pub struct ChannelState(u8) {
        DISABLED = 0,
        ENABLED = 1,
        RUNNING = 2,
        SUSPENDED = 3,
        STOP = 4,
        ERROR = 5,
    }
}

/// First dword of a completion event: transferred length and completion code.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct EventDword0 {
    #[bits(24)]
    pub len: u32,
    #[bits(8)]
    pub code: u8,
}

/// Second dword of event and command elements: element type and channel id.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct EventDword1 {
    #[bits(16)]
    _reserved: u16,
    #[bits(8)]
    pub pkt_type: u8,
    #[bits(8)]
    pub chan: u8,
}

/// First dword of a state-change event.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct StateChangeDword0 {
    #[bits(24)]
    _reserved: u32,
    #[bits(8)]
    pub state: u8,
}

/// First dword of an execution-environment event.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct EeDword0 {
    #[bits(24)]
    _reserved: u32,
    #[bits(8)]
    pub env: u8,
}

/// First dword of a transfer ring element: buffer length.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct TransferDword0 {
    #[bits(16)]
    pub len: u16,
    #[bits(16)]
    _reserved: u16,
}

/// Second dword of a transfer ring element: chaining and interrupt flags.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct TransferDword1 {
    pub chain: bool,
    #[bits(7)]
    _reserved1: u8,
    pub ieob: bool,
    pub ieot: bool,
    pub bei: bool,
    #[bits(5)]
    _reserved2: u8,
    #[bits(8)]
    pub pkt_type: u8,
    #[bits(8)]
    _reserved3: u8,
}

/// A 16-byte ring element, the unit of every MHI ring.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct MhiRingElement {
    pub ptr: u64_le,
    pub dword: [u32_le; 2],
}

impl MhiRingElement {
    /// Builds a transfer-completion event for `chan`, referencing the transfer
    /// ring element at `tre_ptr`.
    pub fn transfer_completion(chan: u8, code: MhiCompletionCode, len: u32, tre_ptr: u64) -> Self {
        Self {
            ptr: tre_ptr.into(),
            dword: [
                EventDword0::new().with_len(len).with_code(code.0).into_bits().into(),
                EventDword1::new()
                    .with_pkt_type(MhiPktType::TX_EVENT.0)
                    .with_chan(chan)
                    .into_bits()
                    .into(),
            ],
        }
    }

    pub fn state_change(state: MhiState) -> Self {
        Self {
            ptr: 0.into(),
            dword: [
                StateChangeDword0::new().with_state(state.0).into_bits().into(),
                EventDword1::new()
                    .with_pkt_type(MhiPktType::STATE_CHANGE_EVENT.0)
                    .into_bits()
                    .into(),
            ],
        }
    }

    pub fn ee_event(env: MhiEe) -> Self {
        Self {
            ptr: 0.into(),
            dword: [
                EeDword0::new().with_env(env.0).into_bits().into(),
                EventDword1::new().with_pkt_type(MhiPktType::EE_EVENT.0).into_bits().into(),
            ],
        }
    }

    /// Builds a command-completion event referencing the command element at
    /// `cmd_ptr`.
    pub fn cmd_completion(code: MhiCompletionCode, cmd_ptr: u64) -> Self {
        Self {
            ptr: cmd_ptr.into(),
            dword: [
                EventDword0::new().with_code(code.0).into_bits().into(),
                EventDword1::new()
                    .with_pkt_type(MhiPktType::CMD_COMPLETION_EVENT.0)
                    .into_bits()
                    .into(),
            ],
        }
    }

    /// Builds a channel command element, as the host would queue it.
    pub fn channel_command(pkt_type: MhiPktType, chan: u8) -> Self {
        Self {
            ptr: 0.into(),
            dword: [
                0.into(),
                EventDword1::new().with_pkt_type(pkt_type.0).with_chan(chan).into_bits().into(),
            ],
        }
    }

    /// Builds a transfer ring element describing a host buffer.
    pub fn transfer(buf_addr: u64, len: u16, ieot: bool, bei: bool) -> Self {
        Self {
            ptr: buf_addr.into(),
            dword: [
                TransferDword0::new().with_len(len).into_bits().into(),
                TransferDword1::new()
                    .with_ieot(ieot)
                    .with_bei(bei)
                    .with_pkt_type(MhiPktType::TRANSFER.0)
                    .into_bits()
                    .into(),
            ],
        }
    }

    pub fn pkt_type(&self) -> MhiPktType {
        MhiPktType(EventDword1::from_bits(self.dword[1].get()).pkt_type())
    }

    /// Channel id of a command or event element.
    pub fn channel(&self) -> u8 {
        EventDword1::from_bits(self.dword[1].get()).chan()
    }

    /// Buffer length of a transfer ring element.
    pub fn transfer_len(&self) -> u32 {
        TransferDword0::from_bits(self.dword[0].get()).len().into()
    }

    /// Interrupt-suppression (BEI) flag of a transfer ring element.
    pub fn bei(&self) -> bool {
        TransferDword1::from_bits(self.dword[1].get()).bei()
    }

    pub fn ieot(&self) -> bool {
        TransferDword1::from_bits(self.dword[1].get()).ieot()
    }

    /// State carried by a state-change event.
    pub fn mhistate(&self) -> MhiState {
        MhiState(StateChangeDword0::from_bits(self.dword[0].get()).state())
    }
}

/// Size of one ring element in host memory.
pub const RING_ELEMENT_SIZE: u64 = size_of::<MhiRingElement>() as u64;

/// Channel configuration word within [`RingContext::cfg`] index 0.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ChCfg {
    #[bits(8)]
    pub chstate: u8,
    #[bits(2)]
    pub brstmode: u8,
    #[bits(6)]
    pub pollcfg: u8,
    #[bits(16)]
    _reserved: u16,
}

/*
All three ring context kinds share one layout; the three leading dwords differ:

    event ring:   intmodt, ertype, msivec
    channel ring: chcfg, chtype, erindex
    command ring: reserved x3
*/

/// A ring context entry, resident in host memory at the base programmed into
/// CCABAP/ECABAP/CRCBAP.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct RingContext {
    pub cfg: [u32_le; 3],
    pub rbase: u64_le,
    pub rlen: u64_le,
    pub rp: u64_le,
    pub wp: u64_le,
}

/// Size of one ring context entry in host memory.
pub const RING_CTX_SIZE: u64 = size_of::<RingContext>() as u64;

impl RingContext {
    fn empty(rbase: u64, elements: u64) -> Self {
        Self {
            cfg: [0.into(); 3],
            rbase: rbase.into(),
            rlen: (elements * RING_ELEMENT_SIZE).into(),
            rp: rbase.into(),
            wp: rbase.into(),
        }
    }

    pub fn new_event(msivec: u32, rbase: u64, elements: u64) -> Self {
        let mut ctx = Self::empty(rbase, elements);
        ctx.cfg[2] = msivec.into();
        ctx
    }

    pub fn new_channel(erindex: u32, rbase: u64, elements: u64) -> Self {
        let mut ctx = Self::empty(rbase, elements);
        ctx.cfg[2] = erindex.into();
        ctx
    }

    pub fn new_command(rbase: u64, elements: u64) -> Self {
        Self::empty(rbase, elements)
    }

    /// Interrupt vector assigned to an event ring.
    pub fn msivec(&self) -> u32 {
        self.cfg[2].get()
    }

    /// Event ring index assigned to a channel ring.
    pub fn erindex(&self) -> u32 {
        self.cfg[2].get()
    }
}

/// MHICTRL, written by the host to request state transitions.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct MhiCtrl {
    _reserved0: bool,
    pub reset: bool,
    #[bits(6)]
    _reserved1: u8,
    #[bits(3)]
    pub mhistate: u8,
    #[bits(21)]
    _reserved2: u32,
}

/// MHISTATUS, written by the endpoint to report its state.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct MhiStatus {
    pub ready: bool,
    _reserved0: bool,
    pub syserr: bool,
    #[bits(5)]
    _reserved1: u8,
    #[bits(3)]
    pub mhistate: u8,
    #[bits(21)]
    _reserved2: u32,
}
