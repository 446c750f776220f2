//! L2CAP LE Signaling channel implementation
//!
//! This module encodes and decodes the signaling commands exchanged on the
//! LE signaling channel (CID 0x0005) to open, credit and close LE
//! credit-based channels.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};

use super::constants::*;
use super::packet::{L2capCommandHeader, L2capPacket};
use super::psm::Spsm;
use super::types::{ChannelId, ConnectionResult};
use crate::error::StackError;

/// Handle for identifying signaling transactions
pub type SignalId = u8;

/// L2CAP LE Signaling message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    /// Command Reject
    CommandReject {
        identifier: SignalId,
        reason: u16,
        data: Vec<u8>,
    },

    /// Disconnection Request
    DisconnectionRequest {
        identifier: SignalId,
        destination_cid: ChannelId,
        source_cid: ChannelId,
    },

    /// Disconnection Response
    DisconnectionResponse {
        identifier: SignalId,
        destination_cid: ChannelId,
        source_cid: ChannelId,
    },

    /// LE Credit Based Connection Request
    LeCreditBasedConnectionRequest {
        identifier: SignalId,
        spsm: Spsm,
        source_cid: ChannelId,
        mtu: u16,
        mps: u16,
        initial_credits: u16,
    },

    /// LE Credit Based Connection Response
    LeCreditBasedConnectionResponse {
        identifier: SignalId,
        destination_cid: ChannelId,
        mtu: u16,
        mps: u16,
        initial_credits: u16,
        result: ConnectionResult,
    },

    /// LE Flow Control Credit Indication
    LeFlowControlCredit {
        identifier: SignalId,
        cid: ChannelId,
        credits: u16,
    },
}

/// Sequential little-endian reader over command parameters
struct ParamReader<'a> {
    cursor: Cursor<&'a [u8]>,
    command: &'static str,
}

impl<'a> ParamReader<'a> {
    fn new(params: &'a [u8], command: &'static str, min_len: usize) -> Result<Self, StackError> {
        if params.len() < min_len {
            return Err(StackError::Malformed(format!("{} parameters too short", command)));
        }
        Ok(Self {
            cursor: Cursor::new(params),
            command,
        })
    }

    fn u16(&mut self, field: &str) -> Result<u16, StackError> {
        self.cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| StackError::Malformed(format!("{}: failed to read {}", self.command, field)))
    }

    fn rest(&self) -> Vec<u8> {
        let position = self.cursor.position() as usize;
        self.cursor.get_ref()[position..].to_vec()
    }
}

impl SignalingMessage {
    /// Get the command code for this signaling message
    pub fn command_code(&self) -> u8 {
        match self {
            Self::CommandReject { .. } => L2CAP_COMMAND_REJECT,
            Self::DisconnectionRequest { .. } => L2CAP_DISCONNECTION_REQUEST,
            Self::DisconnectionResponse { .. } => L2CAP_DISCONNECTION_RESPONSE,
            Self::LeCreditBasedConnectionRequest { .. } => L2CAP_LE_CREDIT_BASED_CONNECTION_REQUEST,
            Self::LeCreditBasedConnectionResponse { .. } => L2CAP_LE_CREDIT_BASED_CONNECTION_RESPONSE,
            Self::LeFlowControlCredit { .. } => L2CAP_LE_FLOW_CONTROL_CREDIT,
        }
    }

    /// Get the identifier for this signaling message
    pub fn identifier(&self) -> SignalId {
        match self {
            Self::CommandReject { identifier, .. }
            | Self::DisconnectionRequest { identifier, .. }
            | Self::DisconnectionResponse { identifier, .. }
            | Self::LeCreditBasedConnectionRequest { identifier, .. }
            | Self::LeCreditBasedConnectionResponse { identifier, .. }
            | Self::LeFlowControlCredit { identifier, .. } => *identifier,
        }
    }

    /// Parse a signaling message from raw bytes.
    ///
    /// Command codes outside the LE credit-based set fail with
    /// [`StackError::CommandNotUnderstood`] so the caller can answer with a
    /// Command Reject.
    pub fn parse(data: &[u8]) -> Result<Self, StackError> {
        let cmd_header = L2capCommandHeader::parse(data)
            .ok_or_else(|| StackError::Malformed("Signaling data too short".into()))?;

        let params = &data[L2CAP_COMMAND_HEADER_SIZE..];
        if params.len() < cmd_header.length as usize {
            return Err(StackError::Malformed("Command parameters too short".into()));
        }
        let params = &params[..cmd_header.length as usize];
        let identifier = cmd_header.identifier;

        let message = match cmd_header.code {
            L2CAP_COMMAND_REJECT => {
                let mut reader = ParamReader::new(params, "Command reject", 2)?;
                let reason = reader.u16("reason")?;
                Self::CommandReject {
                    identifier,
                    reason,
                    data: reader.rest(),
                }
            }

            L2CAP_DISCONNECTION_REQUEST => {
                let mut reader = ParamReader::new(params, "Disconnection request", 4)?;
                Self::DisconnectionRequest {
                    identifier,
                    destination_cid: reader.u16("destination CID")?,
                    source_cid: reader.u16("source CID")?,
                }
            }

            L2CAP_DISCONNECTION_RESPONSE => {
                let mut reader = ParamReader::new(params, "Disconnection response", 4)?;
                Self::DisconnectionResponse {
                    identifier,
                    destination_cid: reader.u16("destination CID")?,
                    source_cid: reader.u16("source CID")?,
                }
            }

            L2CAP_LE_CREDIT_BASED_CONNECTION_REQUEST => {
                let mut reader = ParamReader::new(params, "LE credit based connection request", 10)?;
                let spsm_value = reader.u16("SPSM")?;
                let spsm = Spsm::from_value(spsm_value).ok_or_else(|| {
                    StackError::Malformed(format!("Invalid SPSM value: {:#06x}", spsm_value))
                })?;
                Self::LeCreditBasedConnectionRequest {
                    identifier,
                    spsm,
                    source_cid: reader.u16("source CID")?,
                    mtu: reader.u16("MTU")?,
                    mps: reader.u16("MPS")?,
                    initial_credits: reader.u16("initial credits")?,
                }
            }

            L2CAP_LE_CREDIT_BASED_CONNECTION_RESPONSE => {
                let mut reader = ParamReader::new(params, "LE credit based connection response", 10)?;
                Self::LeCreditBasedConnectionResponse {
                    identifier,
                    destination_cid: reader.u16("destination CID")?,
                    mtu: reader.u16("MTU")?,
                    mps: reader.u16("MPS")?,
                    initial_credits: reader.u16("initial credits")?,
                    result: ConnectionResult::from_value(reader.u16("result")?),
                }
            }

            L2CAP_LE_FLOW_CONTROL_CREDIT => {
                let mut reader = ParamReader::new(params, "Flow control credit", 4)?;
                Self::LeFlowControlCredit {
                    identifier,
                    cid: reader.u16("CID")?,
                    credits: reader.u16("credits")?,
                }
            }

            code => return Err(StackError::CommandNotUnderstood { code, identifier }),
        };

        Ok(message)
    }

    /// Serialize the signaling message to bytes for transmission
    pub fn serialize(&self) -> Vec<u8> {
        let mut params = Vec::with_capacity(10);

        match self {
            Self::CommandReject { reason, data, .. } => {
                params.extend_from_slice(&reason.to_le_bytes());
                params.extend_from_slice(data);
            }

            Self::DisconnectionRequest { destination_cid, source_cid, .. }
            | Self::DisconnectionResponse { destination_cid, source_cid, .. } => {
                params.extend_from_slice(&destination_cid.to_le_bytes());
                params.extend_from_slice(&source_cid.to_le_bytes());
            }

            Self::LeCreditBasedConnectionRequest { spsm, source_cid, mtu, mps, initial_credits, .. } => {
                params.extend_from_slice(&spsm.value().to_le_bytes());
                params.extend_from_slice(&source_cid.to_le_bytes());
                params.extend_from_slice(&mtu.to_le_bytes());
                params.extend_from_slice(&mps.to_le_bytes());
                params.extend_from_slice(&initial_credits.to_le_bytes());
            }

            Self::LeCreditBasedConnectionResponse { destination_cid, mtu, mps, initial_credits, result, .. } => {
                params.extend_from_slice(&destination_cid.to_le_bytes());
                params.extend_from_slice(&mtu.to_le_bytes());
                params.extend_from_slice(&mps.to_le_bytes());
                params.extend_from_slice(&initial_credits.to_le_bytes());
                params.extend_from_slice(&result.value().to_le_bytes());
            }

            Self::LeFlowControlCredit { cid, credits, .. } => {
                params.extend_from_slice(&cid.to_le_bytes());
                params.extend_from_slice(&credits.to_le_bytes());
            }
        }

        let cmd_header = L2capCommandHeader::new(self.command_code(), self.identifier(), params.len() as u16);

        let mut result = Vec::with_capacity(L2CAP_COMMAND_HEADER_SIZE + params.len());
        result.extend_from_slice(&cmd_header.to_bytes());
        result.append(&mut params);
        result
    }

    /// Create an LE signaling channel packet from this message
    pub fn to_packet(&self) -> L2capPacket {
        L2capPacket::new(L2CAP_LE_SIGNALING_CID, self.serialize())
    }
}
