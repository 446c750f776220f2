//! LE credit-based channel state
//!
//! One [`LeChannel`] is kept by the signaling host for every dynamic
//! channel it knows about. It tracks both directions of credit, queues
//! outbound K-frames while the peer has granted no credit and reassembles
//! inbound K-frames into SDUs.

use std::collections::VecDeque;
use std::fmt;

use log::warn;

use super::packet::{segment_sdu, L2capPacket, SduReassembler};
use super::psm::Spsm;
use super::signaling::SignalId;
use super::types::{ChannelId, ConnectionHandle};
use crate::error::StackError;

/// Channel state as seen by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeChannelState {
    /// Our connection request is out, waiting for the response
    WaitConnectRsp,
    /// The peer requested the channel; waiting for the local decision
    WaitAccept,
    /// Channel open in both directions
    Open,
    /// Our disconnection request is out
    WaitDisconnect,
    /// Locally abandoned while the connection request was outstanding
    Abandoned,
}

impl fmt::Display for LeChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WaitConnectRsp => write!(f, "Waiting for connection response"),
            Self::WaitAccept => write!(f, "Waiting for local accept"),
            Self::Open => write!(f, "Open"),
            Self::WaitDisconnect => write!(f, "Waiting for disconnection response"),
            Self::Abandoned => write!(f, "Abandoned"),
        }
    }
}

/// An LE credit-based channel
#[derive(Debug)]
pub struct LeChannel {
    /// Link the channel lives on
    connection: ConnectionHandle,
    /// Local channel ID
    local_cid: ChannelId,
    /// Peer's channel ID (0 until known)
    remote_cid: ChannelId,
    /// Service the channel was opened for
    spsm: Spsm,
    /// Current state
    state: LeChannelState,
    /// Identifier of the peer's connection request awaiting our response
    request_id: Option<SignalId>,
    /// Largest SDU we accept
    mtu: u16,
    /// Largest K-frame payload we accept
    mps: u16,
    /// Largest SDU the peer accepts
    remote_mtu: u16,
    /// Largest K-frame payload the peer accepts
    remote_mps: u16,
    /// K-frames the peer may still send us
    credits: u16,
    /// K-frames we may still send the peer
    remote_credits: u16,
    /// K-frames waiting for peer credit
    tx_queue: VecDeque<L2capPacket>,
    /// Inbound SDU reassembly
    reassembly: SduReassembler,
}

impl LeChannel {
    fn new(
        connection: ConnectionHandle,
        local_cid: ChannelId,
        spsm: Spsm,
        state: LeChannelState,
        mtu: u16,
        mps: u16,
    ) -> Self {
        Self {
            connection,
            local_cid,
            remote_cid: 0,
            spsm,
            state,
            request_id: None,
            mtu,
            mps,
            remote_mtu: 0,
            remote_mps: 0,
            credits: 0,
            remote_credits: 0,
            tx_queue: VecDeque::new(),
            reassembly: SduReassembler::new(mtu),
        }
    }

    /// Channel we are opening towards the peer
    pub fn new_outgoing(
        connection: ConnectionHandle,
        local_cid: ChannelId,
        spsm: Spsm,
        mtu: u16,
        mps: u16,
        credits: u16,
    ) -> Self {
        let mut channel = Self::new(connection, local_cid, spsm, LeChannelState::WaitConnectRsp, mtu, mps);
        channel.credits = credits;
        channel
    }

    /// Channel the peer asked us to open
    pub fn new_incoming(
        connection: ConnectionHandle,
        local_cid: ChannelId,
        request: SignalId,
        spsm: Spsm,
        remote_cid: ChannelId,
        remote_mtu: u16,
        remote_mps: u16,
        remote_credits: u16,
    ) -> Self {
        let mut channel = Self::new(connection, local_cid, spsm, LeChannelState::WaitAccept, 0, 0);
        channel.request_id = Some(request);
        channel.remote_cid = remote_cid;
        channel.remote_mtu = remote_mtu;
        channel.remote_mps = remote_mps;
        channel.remote_credits = remote_credits;
        channel
    }

    pub fn connection(&self) -> ConnectionHandle {
        self.connection
    }

    pub fn local_cid(&self) -> ChannelId {
        self.local_cid
    }

    pub fn remote_cid(&self) -> ChannelId {
        self.remote_cid
    }

    pub fn spsm(&self) -> Spsm {
        self.spsm
    }

    pub fn state(&self) -> LeChannelState {
        self.state
    }

    pub fn set_state(&mut self, state: LeChannelState) {
        self.state = state;
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn mps(&self) -> u16 {
        self.mps
    }

    pub fn remote_mtu(&self) -> u16 {
        self.remote_mtu
    }

    pub fn remote_mps(&self) -> u16 {
        self.remote_mps
    }

    pub fn credits(&self) -> u16 {
        self.credits
    }

    pub fn remote_credits(&self) -> u16 {
        self.remote_credits
    }

    /// Number of K-frames held back for lack of credit
    pub fn queued(&self) -> usize {
        self.tx_queue.len()
    }

    /// Take the identifier of the peer's pending connection request
    pub fn take_request_id(&mut self) -> Option<SignalId> {
        self.request_id.take()
    }

    /// Accept an incoming channel with our receive limits
    pub fn accept(&mut self, mtu: u16, mps: u16, credits: u16) {
        self.mtu = mtu;
        self.mps = mps;
        self.credits = credits;
        self.reassembly = SduReassembler::new(mtu);
        self.state = LeChannelState::Open;
    }

    /// Record the peer's side of an outgoing channel
    pub fn connected(&mut self, remote_cid: ChannelId, remote_mtu: u16, remote_mps: u16, remote_credits: u16) {
        self.remote_cid = remote_cid;
        self.remote_mtu = remote_mtu;
        self.remote_mps = remote_mps;
        self.remote_credits = remote_credits;
        self.state = LeChannelState::Open;
    }

    /// Credits granted by the peer
    pub fn add_remote_credits(&mut self, credits: u16) {
        self.remote_credits = self.remote_credits.saturating_add(credits);
    }

    /// Credits we grant the peer
    pub fn add_credits(&mut self, credits: u16) {
        self.credits = self.credits.saturating_add(credits);
    }

    /// Segment an SDU into K-frames and queue them for sending
    pub fn enqueue_sdu(&mut self, sdu: &[u8]) -> Result<(), StackError> {
        if self.state != LeChannelState::Open {
            return Err(StackError::NotConnected);
        }
        if sdu.len() > self.remote_mtu as usize {
            return Err(StackError::MtuExceeded);
        }

        self.tx_queue.extend(segment_sdu(self.remote_cid, sdu, self.remote_mps)?);
        Ok(())
    }

    /// Release the queued K-frames covered by the peer's credit
    pub fn drain_sendable(&mut self) -> Vec<L2capPacket> {
        let count = self.tx_queue.len().min(self.remote_credits as usize);
        self.remote_credits -= count as u16;
        self.tx_queue.drain(..count).collect()
    }

    /// Feed one inbound K-frame payload; returns the SDU once complete
    pub fn receive_frame(&mut self, payload: &[u8]) -> Result<Option<Vec<u8>>, StackError> {
        if payload.len() > self.mps as usize {
            return Err(StackError::Malformed(format!(
                "K-frame of {} bytes exceeds MPS {}",
                payload.len(),
                self.mps
            )));
        }
        if self.credits == 0 {
            warn!("Channel {:#06x}: K-frame received without credit", self.local_cid);
        }

        self.credits = self.credits.saturating_sub(1);
        self.reassembly.push(payload)
    }
}
