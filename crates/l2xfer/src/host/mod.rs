//! LE signaling host
//!
//! [`SignalingHost`] implements [`BleStack`] on top of raw L2CAP frames:
//! - LE credit-based connection setup and teardown on the signaling channel
//! - Credit accounting per channel, holding K-frames back until the peer grants credit
//! - Segmentation and reassembly of SDUs
//!
//! The host owns no transport. Outbound ACL payloads are collected in an
//! outbox that the integrator drains; inbound payloads are fed through
//! [`SignalingHost::handle_frame`], which returns the [`BtEvent`] (if any)
//! to hand to the transfer engine.
//!
//! The engine's `max_pdu` is the SDU payload that fits a single K-frame, so
//! the host advertises an MPS two bytes larger (room for the SDU length)
//! and reports a peer's MPS two bytes smaller.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, RwLock};

use log::{debug, info, trace, warn};

use crate::error::{StackError, TransferResult};
use crate::l2cap::channel::{LeChannel, LeChannelState};
use crate::l2cap::constants::*;
use crate::l2cap::packet::L2capPacket;
use crate::l2cap::psm::Spsm;
use crate::l2cap::signaling::{SignalId, SignalingMessage};
use crate::l2cap::types::{ChannelId, CloseReason, ConnectionHandle, ConnectionResult};
use crate::stack::{BleStack, BtEvent};
use crate::sync::{lock, read, write};


/// ACL payload waiting to be sent on a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    pub connection: ConnectionHandle,
    /// Complete basic L2CAP frame (header included)
    pub bytes: Vec<u8>,
}

/// Signaling request awaiting the peer's answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingCommand {
    /// LE credit based connection request for a local CID
    Connect(ChannelId),
    /// Disconnection request for a local CID
    Disconnect(ChannelId),
}

impl PendingCommand {
    fn code(&self) -> u8 {
        match self {
            Self::Connect(_) => L2CAP_LE_CREDIT_BASED_CONNECTION_REQUEST,
            Self::Disconnect(_) => L2CAP_DISCONNECTION_REQUEST,
        }
    }
}

/// SDU payload that fits one K-frame of the given MPS
fn pdu_budget(mps: u16) -> u16 {
    mps.saturating_sub(L2CAP_SDU_LENGTH_SIZE as u16)
}

/// MPS needed to carry `max_pdu` SDU bytes in one K-frame
fn frame_size(max_pdu: u16) -> u16 {
    max_pdu
        .saturating_add(L2CAP_SDU_LENGTH_SIZE as u16)
        .min(L2CAP_LE_MAX_MPS)
}

fn is_dynamic_cid(cid: ChannelId) -> bool {
    (L2CAP_LE_DYNAMIC_CID_MIN..=L2CAP_LE_DYNAMIC_CID_MAX).contains(&cid)
}

/// Host side of the LE credit-based channel protocol
pub struct SignalingHost {
    /// Channels mapped by local CID
    channels: RwLock<HashMap<ChannelId, LeChannel>>,

    /// Outstanding signaling requests
    pending: Mutex<HashMap<(ConnectionHandle, SignalId), PendingCommand>>,

    /// Next CID to try
    next_cid: Mutex<ChannelId>,

    /// Next available signaling identifier
    next_signal_id: Mutex<SignalId>,

    /// Frames waiting to be sent
    outbox: Mutex<VecDeque<OutboundFrame>>,
}

impl Default for SignalingHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalingHost {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_cid: Mutex::new(L2CAP_LE_DYNAMIC_CID_MIN),
            next_signal_id: Mutex::new(1), // 0 is not a valid identifier
            outbox: Mutex::new(VecDeque::new()),
        }
    }

    /// Drain every frame waiting to be sent
    pub fn take_outbound(&self) -> Vec<OutboundFrame> {
        lock(&self.outbox).drain(..).collect()
    }

    /// Number of channels known to the host
    pub fn channel_count(&self) -> usize {
        read(&self.channels).len()
    }

    /// State of the channel with the given local CID
    pub fn channel_state(&self, cid: ChannelId) -> Option<LeChannelState> {
        read(&self.channels).get(&cid).map(|channel| channel.state())
    }

    /// Credits (ours, the peer's) on the channel with the given local CID
    pub fn channel_credits(&self, cid: ChannelId) -> Option<(u16, u16)> {
        read(&self.channels)
            .get(&cid)
            .map(|channel| (channel.credits(), channel.remote_credits()))
    }

    /// Allocate a new dynamic CID
    fn allocate_cid(&self, channels: &HashMap<ChannelId, LeChannel>) -> Result<ChannelId, StackError> {
        let mut next_cid = lock(&self.next_cid);
        let starting_cid = *next_cid;

        loop {
            let candidate = *next_cid;
            *next_cid = if candidate >= L2CAP_LE_DYNAMIC_CID_MAX {
                L2CAP_LE_DYNAMIC_CID_MIN
            } else {
                candidate + 1
            };

            if !channels.contains_key(&candidate) {
                return Ok(candidate);
            }

            // Check if we've gone full circle
            if *next_cid == starting_cid {
                return Err(StackError::NoResources);
            }
        }
    }

    /// Allocate the next signal identifier
    fn allocate_signal_id(&self) -> SignalId {
        let mut next_id = lock(&self.next_signal_id);
        let id = *next_id;

        *next_id = next_id.wrapping_add(1);
        if *next_id == 0 {
            *next_id = 1;
        }

        id
    }

    fn push_frame(&self, connection: ConnectionHandle, packet: &L2capPacket) {
        let bytes = packet.to_bytes();
        trace!("TX {} {:#06x}: {}", connection, packet.header.channel_id, hex::encode(&bytes));
        lock(&self.outbox).push_back(OutboundFrame { connection, bytes });
    }

    fn send_signal(&self, connection: ConnectionHandle, message: SignalingMessage) {
        debug!("{}: sending {:?}", connection, message);
        self.push_frame(connection, &message.to_packet());
    }

    /// Send a disconnection request for an open channel
    fn request_disconnect(&self, channel: &LeChannel) {
        let identifier = self.allocate_signal_id();
        let connection = channel.connection();

        lock(&self.pending).insert((connection, identifier), PendingCommand::Disconnect(channel.local_cid()));
        self.send_signal(
            connection,
            SignalingMessage::DisconnectionRequest {
                identifier,
                destination_cid: channel.remote_cid(),
                source_cid: channel.local_cid(),
            },
        );
    }

    /// Push out whatever the peer's credit allows
    fn flush(&self, channel: &mut LeChannel) {
        let connection = channel.connection();
        for packet in channel.drain_sendable() {
            self.push_frame(connection, &packet);
        }
        if channel.queued() > 0 {
            trace!(
                "Channel {:#06x}: {} K-frames waiting for credit",
                channel.local_cid(),
                channel.queued()
            );
        }
    }

    fn open_channel<'a>(
        channels: &'a mut HashMap<ChannelId, LeChannel>,
        connection: ConnectionHandle,
        cid: ChannelId,
    ) -> Result<&'a mut LeChannel, StackError> {
        let channel = channels
            .get_mut(&cid)
            .filter(|channel| channel.connection() == connection)
            .ok_or(StackError::ChannelNotFound)?;

        if channel.state() != LeChannelState::Open {
            return Err(StackError::NotConnected);
        }

        Ok(channel)
    }

    /// Process one inbound basic L2CAP frame received on `connection`
    pub fn handle_frame(&self, connection: ConnectionHandle, data: &[u8]) -> TransferResult<Option<BtEvent>> {
        trace!("RX {}: {}", connection, hex::encode(data));
        let packet = L2capPacket::parse(data)?;

        match packet.header.channel_id {
            L2CAP_LE_SIGNALING_CID => self.handle_signaling(connection, &packet.payload),
            cid if is_dynamic_cid(cid) => self.handle_kframe(connection, cid, &packet.payload),
            cid => {
                debug!("{}: ignoring frame on fixed channel {:#06x}", connection, cid);
                Ok(None)
            }
        }
    }

    /// Drop all state belonging to a link that went down
    pub fn connection_closed(&self, connection: ConnectionHandle, reason: CloseReason) -> BtEvent {
        let dropped = {
            let mut channels = write(&self.channels);
            let before = channels.len();
            channels.retain(|_, channel| channel.connection() != connection);
            before - channels.len()
        };
        lock(&self.pending).retain(|(link, _), _| *link != connection);
        lock(&self.outbox).retain(|frame| frame.connection != connection);

        info!("{}: link closed ({}), dropped {} channels", connection, reason, dropped);
        BtEvent::ConnectionClosed { connection, reason }
    }

    fn handle_signaling(&self, connection: ConnectionHandle, payload: &[u8]) -> TransferResult<Option<BtEvent>> {
        let message = match SignalingMessage::parse(payload) {
            Ok(message) => message,
            Err(StackError::CommandNotUnderstood { code, identifier }) => {
                warn!("{}: rejecting unknown signaling command {:#04x}", connection, code);
                self.send_signal(
                    connection,
                    SignalingMessage::CommandReject {
                        identifier,
                        reason: L2CAP_REJECT_NOT_UNDERSTOOD,
                        data: Vec::new(),
                    },
                );
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        debug!("{}: received {:?}", connection, message);

        match message {
            SignalingMessage::LeCreditBasedConnectionRequest {
                identifier,
                spsm,
                source_cid,
                mtu,
                mps,
                initial_credits,
            } => Ok(self.on_connection_request(connection, identifier, spsm, source_cid, mtu, mps, initial_credits)),
            SignalingMessage::LeCreditBasedConnectionResponse {
                identifier,
                destination_cid,
                mtu,
                mps,
                initial_credits,
                result,
            } => Ok(self.on_connection_response(
                connection,
                identifier,
                destination_cid,
                mtu,
                mps,
                initial_credits,
                result,
            )),
            SignalingMessage::DisconnectionRequest {
                identifier,
                destination_cid,
                source_cid,
            } => Ok(self.on_disconnection_request(connection, identifier, destination_cid, source_cid)),
            SignalingMessage::DisconnectionResponse {
                identifier,
                source_cid,
                ..
            } => Ok(self.on_disconnection_response(connection, identifier, source_cid)),
            SignalingMessage::LeFlowControlCredit { cid, credits, .. } => Ok(self.on_credit(connection, cid, credits)),
            SignalingMessage::CommandReject { identifier, reason, .. } => {
                Ok(self.on_command_reject(connection, identifier, reason))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_connection_request(
        &self,
        connection: ConnectionHandle,
        identifier: SignalId,
        spsm: Spsm,
        source_cid: ChannelId,
        mtu: u16,
        mps: u16,
        credits: u16,
    ) -> Option<BtEvent> {
        let refuse = |result: ConnectionResult| {
            warn!("{}: refusing channel for {}: {}", connection, spsm, result);
            self.send_signal(
                connection,
                SignalingMessage::LeCreditBasedConnectionResponse {
                    identifier,
                    destination_cid: 0,
                    mtu: 0,
                    mps: 0,
                    initial_credits: 0,
                    result,
                },
            );
            None
        };

        if mtu < L2CAP_LE_MIN_MTU || mps < L2CAP_LE_MIN_MPS {
            return refuse(ConnectionResult::UnacceptableParameters);
        }
        if !is_dynamic_cid(source_cid) {
            return refuse(ConnectionResult::InvalidSourceCid);
        }

        let mut channels = write(&self.channels);
        if channels
            .values()
            .any(|channel| channel.connection() == connection && channel.remote_cid() == source_cid)
        {
            return refuse(ConnectionResult::SourceCidAlreadyAllocated);
        }

        let local_cid = match self.allocate_cid(&channels) {
            Ok(cid) => cid,
            Err(_) => return refuse(ConnectionResult::NoResourcesAvailable),
        };

        channels.insert(
            local_cid,
            LeChannel::new_incoming(connection, local_cid, identifier, spsm, source_cid, mtu, mps, credits),
        );

        Some(BtEvent::LeChannelOpenRequest {
            connection,
            spsm,
            cid: local_cid,
            max_sdu: mtu,
            max_pdu: pdu_budget(mps),
            credit: credits,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn on_connection_response(
        &self,
        connection: ConnectionHandle,
        identifier: SignalId,
        destination_cid: ChannelId,
        mtu: u16,
        mps: u16,
        credits: u16,
        result: ConnectionResult,
    ) -> Option<BtEvent> {
        let local_cid = match lock(&self.pending).remove(&(connection, identifier)) {
            Some(PendingCommand::Connect(cid)) => cid,
            _ => {
                debug!("{}: unexpected connection response {}", connection, identifier);
                return None;
            }
        };

        let mut channels = write(&self.channels);
        let channel = channels.get_mut(&local_cid)?;
        let abandoned = channel.state() == LeChannelState::Abandoned;

        let result = if result.is_success()
            && (mtu < L2CAP_LE_MIN_MTU || mps < L2CAP_LE_MIN_MPS || !is_dynamic_cid(destination_cid))
        {
            warn!("{}: peer accepted channel {:#06x} with unusable parameters", connection, local_cid);
            ConnectionResult::UnacceptableParameters
        } else {
            result
        };

        if !result.is_success() {
            channels.remove(&local_cid);
            return (!abandoned).then_some(BtEvent::LeChannelOpenResponse {
                connection,
                cid: local_cid,
                max_sdu: 0,
                max_pdu: 0,
                credit: 0,
                result,
            });
        }

        channel.connected(destination_cid, mtu, mps, credits);
        if abandoned {
            channel.set_state(LeChannelState::Abandoned);
            self.request_disconnect(channel);
            return None;
        }

        info!("{}: channel {:#06x} connected to {:#06x}", connection, local_cid, destination_cid);
        Some(BtEvent::LeChannelOpenResponse {
            connection,
            cid: local_cid,
            max_sdu: mtu,
            max_pdu: pdu_budget(mps),
            credit: credits,
            result,
        })
    }

    fn on_disconnection_request(
        &self,
        connection: ConnectionHandle,
        identifier: SignalId,
        destination_cid: ChannelId,
        source_cid: ChannelId,
    ) -> Option<BtEvent> {
        let removed = {
            let mut channels = write(&self.channels);
            match channels.get(&destination_cid) {
                Some(channel) if channel.connection() == connection && channel.remote_cid() == source_cid => {
                    channels.remove(&destination_cid)
                }
                _ => None,
            }
        };

        let Some(channel) = removed else {
            let mut data = destination_cid.to_le_bytes().to_vec();
            data.extend_from_slice(&source_cid.to_le_bytes());
            self.send_signal(
                connection,
                SignalingMessage::CommandReject {
                    identifier,
                    reason: L2CAP_REJECT_INVALID_CID,
                    data,
                },
            );
            return None;
        };

        self.send_signal(
            connection,
            SignalingMessage::DisconnectionResponse {
                identifier,
                destination_cid,
                source_cid,
            },
        );

        info!("{}: peer closed channel {:#06x}", connection, destination_cid);
        (channel.state() != LeChannelState::Abandoned).then_some(BtEvent::LeChannelClosed {
            connection,
            cid: destination_cid,
            reason: CloseReason::RemoteDisconnected,
        })
    }

    fn on_disconnection_response(
        &self,
        connection: ConnectionHandle,
        identifier: SignalId,
        source_cid: ChannelId,
    ) -> Option<BtEvent> {
        match lock(&self.pending).remove(&(connection, identifier)) {
            Some(PendingCommand::Disconnect(cid)) if cid == source_cid => {}
            _ => {
                debug!("{}: unexpected disconnection response {}", connection, identifier);
                return None;
            }
        }

        let channel = write(&self.channels).remove(&source_cid)?;
        info!("{}: channel {:#06x} closed", connection, source_cid);

        (channel.state() != LeChannelState::Abandoned).then_some(BtEvent::LeChannelClosed {
            connection,
            cid: source_cid,
            reason: CloseReason::LocalDisconnected,
        })
    }

    fn on_credit(&self, connection: ConnectionHandle, remote_cid: ChannelId, credits: u16) -> Option<BtEvent> {
        let mut channels = write(&self.channels);
        let Some(channel) = channels.values_mut().find(|channel| {
            channel.connection() == connection
                && channel.remote_cid() == remote_cid
                && channel.state() == LeChannelState::Open
        }) else {
            debug!("{}: credit for unknown channel {:#06x}", connection, remote_cid);
            return None;
        };

        channel.add_remote_credits(credits);
        self.flush(channel);

        Some(BtEvent::LeChannelCredit {
            connection,
            cid: channel.local_cid(),
            credit: credits,
        })
    }

    fn on_command_reject(&self, connection: ConnectionHandle, identifier: SignalId, reason: u16) -> Option<BtEvent> {
        let Some(command) = lock(&self.pending).remove(&(connection, identifier)) else {
            debug!("{}: command reject for unknown request {}", connection, identifier);
            return None;
        };

        warn!(
            "{}: peer rejected command {:#04x} with reason {:#06x}",
            connection,
            command.code(),
            reason
        );

        match command {
            PendingCommand::Connect(cid) => {
                let channel = write(&self.channels).remove(&cid)?;
                (channel.state() != LeChannelState::Abandoned).then_some(BtEvent::CommandRejected {
                    connection,
                    code: command.code(),
                    reason,
                })
            }
            PendingCommand::Disconnect(cid) => {
                let channel = write(&self.channels).remove(&cid)?;
                (channel.state() != LeChannelState::Abandoned).then_some(BtEvent::LeChannelClosed {
                    connection,
                    cid,
                    reason: CloseReason::LocalDisconnected,
                })
            }
        }
    }

    fn handle_kframe(&self, connection: ConnectionHandle, cid: ChannelId, payload: &[u8]) -> TransferResult<Option<BtEvent>> {
        let mut channels = write(&self.channels);
        let Some(channel) = channels
            .get_mut(&cid)
            .filter(|channel| channel.connection() == connection)
        else {
            trace!("{}: K-frame for unknown channel {:#06x}", connection, cid);
            return Ok(None);
        };

        if channel.state() != LeChannelState::Open {
            trace!("{}: dropping K-frame on channel {:#06x} ({})", connection, cid, channel.state());
            return Ok(None);
        }

        match channel.receive_frame(payload) {
            Ok(Some(sdu)) => Ok(Some(BtEvent::LeChannelData {
                connection,
                cid,
                data: sdu,
            })),
            Ok(None) => Ok(None),
            Err(err) => {
                warn!("{}: closing channel {:#06x}: {}", connection, cid, err);
                channel.set_state(LeChannelState::WaitDisconnect);
                self.request_disconnect(channel);
                Err(err.into())
            }
        }
    }
}

impl BleStack for SignalingHost {
    fn open_le_channel(
        &self,
        connection: ConnectionHandle,
        spsm: Spsm,
        max_sdu: u16,
        max_pdu: u16,
        credit: u16,
    ) -> Result<ChannelId, StackError> {
        if !connection.is_valid() {
            return Err(StackError::NotConnected);
        }
        if !spsm.is_valid() {
            return Err(StackError::InvalidParameter(format!("Invalid SPSM {}", spsm)));
        }

        let mps = frame_size(max_pdu);
        if max_sdu < L2CAP_LE_MIN_MTU || mps < L2CAP_LE_MIN_MPS {
            return Err(StackError::InvalidParameter(format!(
                "MTU {} / PDU {} below LE minimum",
                max_sdu, max_pdu
            )));
        }

        let local_cid = {
            let mut channels = write(&self.channels);
            let cid = self.allocate_cid(&channels)?;
            channels.insert(cid, LeChannel::new_outgoing(connection, cid, spsm, max_sdu, mps, credit));
            cid
        };

        let identifier = self.allocate_signal_id();
        lock(&self.pending).insert((connection, identifier), PendingCommand::Connect(local_cid));

        self.send_signal(
            connection,
            SignalingMessage::LeCreditBasedConnectionRequest {
                identifier,
                spsm,
                source_cid: local_cid,
                mtu: max_sdu,
                mps,
                initial_credits: credit,
            },
        );

        Ok(local_cid)
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
        let mut channels = write(&self.channels);
        let channel = channels
            .get_mut(&cid)
            .filter(|channel| channel.connection() == connection && channel.state() == LeChannelState::WaitAccept)
            .ok_or(StackError::ChannelNotFound)?;

        let mps = frame_size(max_pdu);
        if result.is_success() && (max_sdu < L2CAP_LE_MIN_MTU || mps < L2CAP_LE_MIN_MPS) {
            return Err(StackError::InvalidParameter(format!(
                "MTU {} / PDU {} below LE minimum",
                max_sdu, max_pdu
            )));
        }

        let identifier = channel.take_request_id().ok_or(StackError::ChannelNotFound)?;

        let message = if result.is_success() {
            channel.accept(max_sdu, mps, credit);
            info!("{}: accepted channel {:#06x} for {}", connection, cid, channel.spsm());
            SignalingMessage::LeCreditBasedConnectionResponse {
                identifier,
                destination_cid: cid,
                mtu: max_sdu,
                mps,
                initial_credits: credit,
                result,
            }
        } else {
            channels.remove(&cid);
            SignalingMessage::LeCreditBasedConnectionResponse {
                identifier,
                destination_cid: 0,
                mtu: 0,
                mps: 0,
                initial_credits: 0,
                result,
            }
        };

        self.send_signal(connection, message);
        Ok(())
    }

    fn send_le_channel_data(&self, connection: ConnectionHandle, cid: ChannelId, data: &[u8]) -> Result<(), StackError> {
        let mut channels = write(&self.channels);
        let channel = Self::open_channel(&mut channels, connection, cid)?;

        channel.enqueue_sdu(data)?;
        self.flush(channel);
        Ok(())
    }

    fn send_le_channel_credit(&self, connection: ConnectionHandle, cid: ChannelId, credit: u16) -> Result<(), StackError> {
        let mut channels = write(&self.channels);
        let channel = Self::open_channel(&mut channels, connection, cid)?;

        channel.add_credits(credit);
        self.send_signal(
            connection,
            SignalingMessage::LeFlowControlCredit {
                identifier: self.allocate_signal_id(),
                cid,
                credits: credit,
            },
        );
        Ok(())
    }

    fn close_le_channel(&self, connection: ConnectionHandle, cid: ChannelId) -> Result<(), StackError> {
        let mut channels = write(&self.channels);
        let channel = channels
            .get_mut(&cid)
            .filter(|channel| channel.connection() == connection)
            .ok_or(StackError::ChannelNotFound)?;

        match channel.state() {
            LeChannelState::Open => {
                channel.set_state(LeChannelState::WaitDisconnect);
                self.request_disconnect(channel);
                Ok(())
            }
            LeChannelState::WaitDisconnect => Ok(()),
            LeChannelState::WaitConnectRsp => {
                // Torn down once the peer answers
                channel.set_state(LeChannelState::Abandoned);
                Err(StackError::NotConnected)
            }
            LeChannelState::WaitAccept | LeChannelState::Abandoned => Err(StackError::NotConnected),
        }
    }
}
