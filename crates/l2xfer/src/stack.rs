//! Boundary to the Bluetooth LE host stack
//!
//! The transfer engine never talks to a controller directly. It issues
//! commands through [`BleStack`] and is fed [`BtEvent`]s by whoever owns
//! the host stack's event loop.

use crate::error::StackError;
use crate::l2cap::psm::Spsm;
use crate::l2cap::types::{ChannelId, CloseReason, ConnectionHandle, ConnectionResult};

/// Imperative calls the transfer engine makes into the host stack.
///
/// Implementations are shared between the event path and the polling path,
/// so every method takes `&self`.
pub trait BleStack {
    /// Send an LE credit based connection request. Returns the local
    /// channel identifier assigned to the new channel.
    fn open_le_channel(
        &self,
        connection: ConnectionHandle,
        spsm: Spsm,
        max_sdu: u16,
        max_pdu: u16,
        credit: u16,
    ) -> Result<ChannelId, StackError>;

    /// Answer an incoming LE credit based connection request
    fn send_le_channel_open_response(
        &self,
        connection: ConnectionHandle,
        cid: ChannelId,
        max_sdu: u16,
        max_pdu: u16,
        credit: u16,
        result: ConnectionResult,
    ) -> Result<(), StackError>;

    /// Send one SDU on an open channel
    fn send_le_channel_data(&self, connection: ConnectionHandle, cid: ChannelId, data: &[u8]) -> Result<(), StackError>;

    /// Grant the peer additional credits
    fn send_le_channel_credit(&self, connection: ConnectionHandle, cid: ChannelId, credit: u16) -> Result<(), StackError>;

    /// Request disconnection of a channel
    fn close_le_channel(&self, connection: ConnectionHandle, cid: ChannelId) -> Result<(), StackError>;
}

impl<S: BleStack + ?Sized> BleStack for &S {
    fn open_le_channel(
        &self,
        connection: ConnectionHandle,
        spsm: Spsm,
        max_sdu: u16,
        max_pdu: u16,
        credit: u16,
    ) -> Result<ChannelId, StackError> {
        (**self).open_le_channel(connection, spsm, max_sdu, max_pdu, credit)
    }

    fn send_le_channel_open_response(
        &self,
        connection: ConnectionHandle,
        cid: ChannelId,
        max_sdu: u16,
        max_pdu: u16,
        credit: u16,
        result: ConnectionResult,
    ) -> Result<(), StackError> {
        (**self).send_le_channel_open_response(connection, cid, max_sdu, max_pdu, credit, result)
    }

    fn send_le_channel_data(&self, connection: ConnectionHandle, cid: ChannelId, data: &[u8]) -> Result<(), StackError> {
        (**self).send_le_channel_data(connection, cid, data)
    }

    fn send_le_channel_credit(&self, connection: ConnectionHandle, cid: ChannelId, credit: u16) -> Result<(), StackError> {
        (**self).send_le_channel_credit(connection, cid, credit)
    }

    fn close_le_channel(&self, connection: ConnectionHandle, cid: ChannelId) -> Result<(), StackError> {
        (**self).close_le_channel(connection, cid)
    }
}

/// Events delivered by the host stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BtEvent {
    /// The peer wants to open a channel
    LeChannelOpenRequest {
        connection: ConnectionHandle,
        spsm: Spsm,
        /// Local channel identifier reserved for the new channel
        cid: ChannelId,
        /// Peer's MTU
        max_sdu: u16,
        /// Peer's MPS
        max_pdu: u16,
        /// Credits the peer grants us
        credit: u16,
    },
    /// The peer answered our open request
    LeChannelOpenResponse {
        connection: ConnectionHandle,
        cid: ChannelId,
        max_sdu: u16,
        max_pdu: u16,
        credit: u16,
        result: ConnectionResult,
    },
    /// A complete SDU arrived on a channel
    LeChannelData {
        connection: ConnectionHandle,
        cid: ChannelId,
        data: Vec<u8>,
    },
    /// The peer granted additional credits
    LeChannelCredit {
        connection: ConnectionHandle,
        cid: ChannelId,
        credit: u16,
    },
    /// A channel is gone
    LeChannelClosed {
        connection: ConnectionHandle,
        cid: ChannelId,
        reason: CloseReason,
    },
    /// The peer rejected one of our signaling commands
    CommandRejected {
        connection: ConnectionHandle,
        code: u8,
        reason: u16,
    },
    /// The LE link itself went down
    ConnectionClosed {
        connection: ConnectionHandle,
        reason: CloseReason,
    },
}

impl BtEvent {
    /// Connection the event belongs to
    pub fn connection(&self) -> ConnectionHandle {
        match self {
            Self::LeChannelOpenRequest { connection, .. }
            | Self::LeChannelOpenResponse { connection, .. }
            | Self::LeChannelData { connection, .. }
            | Self::LeChannelCredit { connection, .. }
            | Self::LeChannelClosed { connection, .. }
            | Self::CommandRejected { connection, .. }
            | Self::ConnectionClosed { connection, .. } => *connection,
        }
    }
}
