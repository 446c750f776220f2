//! Type definitions for credit-based transfers
//!
//! A [`Transfer`] describes one data exchange over an LE credit-based
//! channel. Its owner fills in the role, the limits and the hooks, then
//! hands it to the [`TransferEngine`](super::TransferEngine).

use std::fmt;
use std::sync::{Arc, Mutex};

use bitflags::bitflags;

use crate::error::TransferResult;
use crate::l2cap::psm::Spsm;
use crate::l2cap::types::{ChannelId, ConnectionHandle};

/// Identifier handed out by the engine for every accepted transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(pub(crate) u32);

impl TransferId {
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transfer-{}", self.0)
    }
}

/// Direction of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Not participating in any exchange
    Inactive,
    /// We send `data_length` bytes to the peer
    Transmit,
    /// The peer sends `data_length` bytes to us
    Receive,
}

/// Position of a transfer in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Queued; an open request goes out on the next poll
    RequestOpen,
    /// Open request sent, waiting for the peer's response
    RequestPending,
    /// Waiting for the peer to request the channel
    RequestResponse,
    /// Channel open, we are sending
    ActiveTransmit,
    /// Channel open, we are receiving
    ActiveReceive,
    /// All bytes exchanged, close requested, waiting for the channel to go away
    Closing,
}

impl TransferState {
    /// Bit representing this state in a [`StateSet`]
    pub fn as_set(&self) -> StateSet {
        match self {
            Self::RequestOpen => StateSet::REQUEST_OPEN,
            Self::RequestPending => StateSet::REQUEST_PENDING,
            Self::RequestResponse => StateSet::REQUEST_RESPONSE,
            Self::ActiveTransmit => StateSet::ACTIVE_TRANSMIT,
            Self::ActiveReceive => StateSet::ACTIVE_RECEIVE,
            Self::Closing => StateSet::CLOSING,
        }
    }

    /// Active state for the given direction
    pub fn active_for(mode: TransferMode) -> Option<Self> {
        match mode {
            TransferMode::Transmit => Some(Self::ActiveTransmit),
            TransferMode::Receive => Some(Self::ActiveReceive),
            TransferMode::Inactive => None,
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RequestOpen => write!(f, "Request open"),
            Self::RequestPending => write!(f, "Waiting for open response"),
            Self::RequestResponse => write!(f, "Waiting for open request"),
            Self::ActiveTransmit => write!(f, "Transmitting"),
            Self::ActiveReceive => write!(f, "Receiving"),
            Self::Closing => write!(f, "Closing"),
        }
    }
}

bitflags! {
    /// A set of lifecycle states, used to look transfers up across states
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StateSet: u8 {
        const REQUEST_OPEN = 1 << 0;
        const REQUEST_PENDING = 1 << 1;
        const REQUEST_RESPONSE = 1 << 2;
        const ACTIVE_TRANSMIT = 1 << 3;
        const ACTIVE_RECEIVE = 1 << 4;
        const CLOSING = 1 << 5;

        /// States in which data is (or was just) flowing
        const ACTIVE = Self::ACTIVE_TRANSMIT.bits()
            | Self::ACTIVE_RECEIVE.bits()
            | Self::CLOSING.bits();
        /// States in which a channel identifier has been assigned
        const HAS_CHANNEL = Self::REQUEST_PENDING.bits() | Self::ACTIVE.bits();
    }
}

impl StateSet {
    pub fn holds(&self, state: TransferState) -> bool {
        self.contains(state.as_set())
    }
}

/// Hook that produces outgoing data
pub trait Transmitter {
    /// Provide up to `size` bytes starting at `offset`.
    ///
    /// An empty slice (or one longer than the channel's PDU) skips this
    /// poll; the engine asks again on the next one.
    fn on_transmit(&mut self, id: TransferId, offset: u32, size: u32) -> &[u8];
}

/// Hook that consumes incoming data
pub trait Receiver {
    /// Handle a segment received at `offset`. Returns the number of
    /// additional credits to grant the peer (0 for none). On the last
    /// segment the grant is still sent, ahead of the close request.
    fn on_receive(&mut self, id: TransferId, offset: u32, data: &[u8]) -> u16;
}

/// Hooks for lifecycle notifications
pub trait Finisher {
    /// Called exactly once when the transfer leaves the engine
    fn on_finish(&mut self, id: TransferId, result: TransferResult<()>);

    /// Called when the channel has been opened
    fn on_open(&mut self, _id: TransferId) {}
}

/// Shared handle to a transmit hook
pub type TransmitHandler = Arc<Mutex<dyn Transmitter + Send>>;
/// Shared handle to a receive hook
pub type ReceiveHandler = Arc<Mutex<dyn Receiver + Send>>;
/// Shared handle to lifecycle hooks
pub type FinishHandler = Arc<Mutex<dyn Finisher + Send>>;

/// Hooks attached to a transfer
#[derive(Clone, Default)]
pub struct TransferCallbacks {
    pub on_transmit: Option<TransmitHandler>,
    pub on_receive: Option<ReceiveHandler>,
    pub on_finish: Option<FinishHandler>,
}

impl fmt::Debug for TransferCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferCallbacks")
            .field("on_transmit", &self.on_transmit.is_some())
            .field("on_receive", &self.on_receive.is_some())
            .field("on_finish", &self.on_finish.is_some())
            .finish()
    }
}

/// A data exchange over one LE credit-based channel
#[derive(Debug, Clone)]
pub struct Transfer {
    /// Connection the channel lives on
    pub connection: ConnectionHandle,
    /// Channel identifier, assigned once the open request is issued or received
    pub channel_id: ChannelId,
    /// Service identifier of the channel
    pub spsm: Spsm,
    /// Maximum SDU size
    pub max_sdu: u16,
    /// Maximum PDU size
    pub max_pdu: u16,
    /// PDUs we may still send (transmit) or the peer may still send (receive)
    pub credit: u16,
    /// End of the data cursor
    pub data_length: u32,
    /// Current position of the data cursor
    pub data_offset: u32,
    /// Direction of the transfer
    pub mode: TransferMode,
    /// Hooks
    pub callbacks: TransferCallbacks,
}

impl Transfer {
    fn new(mode: TransferMode, connection: ConnectionHandle, data_length: u32) -> Self {
        Self {
            connection,
            channel_id: 0,
            spsm: Spsm::UNSET,
            max_sdu: 0,
            max_pdu: 0,
            credit: 0,
            data_length,
            data_offset: 0,
            mode,
            callbacks: TransferCallbacks::default(),
        }
    }

    /// Create a transfer that sends `data_length` bytes
    pub fn transmitter(connection: ConnectionHandle, data_length: u32) -> Self {
        Self::new(TransferMode::Transmit, connection, data_length)
    }

    /// Create a transfer that receives `data_length` bytes
    pub fn receiver(connection: ConnectionHandle, data_length: u32) -> Self {
        Self::new(TransferMode::Receive, connection, data_length)
    }

    pub fn with_spsm(mut self, spsm: Spsm) -> Self {
        self.spsm = spsm;
        self
    }

    pub fn with_max_sdu(mut self, max_sdu: u16) -> Self {
        self.max_sdu = max_sdu;
        self
    }

    pub fn with_max_pdu(mut self, max_pdu: u16) -> Self {
        self.max_pdu = max_pdu;
        self
    }

    pub fn with_credit(mut self, credit: u16) -> Self {
        self.credit = credit;
        self
    }

    /// Start the data cursor somewhere other than 0
    pub fn with_data_offset(mut self, data_offset: u32) -> Self {
        self.data_offset = data_offset;
        self
    }

    pub fn with_transmitter(mut self, handler: TransmitHandler) -> Self {
        self.callbacks.on_transmit = Some(handler);
        self
    }

    pub fn with_receiver(mut self, handler: ReceiveHandler) -> Self {
        self.callbacks.on_receive = Some(handler);
        self
    }

    pub fn with_finisher(mut self, handler: FinishHandler) -> Self {
        self.callbacks.on_finish = Some(handler);
        self
    }

    /// Bytes left before the cursor reaches `data_length`
    pub fn remaining(&self) -> u32 {
        self.data_length.saturating_sub(self.data_offset)
    }

    /// Whether every byte has been exchanged
    pub fn is_complete(&self) -> bool {
        self.data_offset >= self.data_length
    }

    /// Size of the next transmit segment
    pub fn next_segment_size(&self) -> u32 {
        self.remaining().min(self.max_pdu as u32)
    }
}
