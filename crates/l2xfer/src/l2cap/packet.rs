//! L2CAP Packet handling
//!
//! This module provides the basic L2CAP frame, the signaling command header
//! and the K-frame segmentation/reassembly used by LE credit-based channels.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};

use super::constants::*;
use super::types::ChannelId;
use crate::error::StackError;

/// L2CAP Packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2capHeader {
    /// Length of the L2CAP payload in bytes
    pub length: u16,
    /// Channel Identifier
    pub channel_id: ChannelId,
}

impl L2capHeader {
    /// Create a new L2CAP header
    pub fn new(length: u16, channel_id: ChannelId) -> Self {
        Self { length, channel_id }
    }

    /// Parse an L2CAP header from raw bytes
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < L2CAP_BASIC_HEADER_SIZE {
            return None;
        }

        let mut cursor = Cursor::new(data);
        let length = cursor.read_u16::<LittleEndian>().ok()?;
        let channel_id = cursor.read_u16::<LittleEndian>().ok()?;

        Some(Self { length, channel_id })
    }

    /// Serialize the header to bytes
    pub fn to_bytes(&self) -> [u8; L2CAP_BASIC_HEADER_SIZE] {
        let mut result = [0u8; L2CAP_BASIC_HEADER_SIZE];
        result[0..2].copy_from_slice(&self.length.to_le_bytes());
        result[2..4].copy_from_slice(&self.channel_id.to_le_bytes());
        result
    }
}

/// Represents a basic L2CAP frame with header and payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L2capPacket {
    /// L2CAP header
    pub header: L2capHeader,
    /// Payload data
    pub payload: Vec<u8>,
}

impl L2capPacket {
    /// Create a new L2CAP packet
    pub fn new(channel_id: ChannelId, payload: Vec<u8>) -> Self {
        let length = payload.len() as u16;

        Self {
            header: L2capHeader::new(length, channel_id),
            payload,
        }
    }

    /// Parse an L2CAP packet from raw bytes
    pub fn parse(data: &[u8]) -> Result<Self, StackError> {
        let header = L2capHeader::parse(data)
            .ok_or_else(|| StackError::Malformed("L2CAP header too short".into()))?;

        let payload_end = L2CAP_BASIC_HEADER_SIZE + header.length as usize;
        if data.len() < payload_end {
            return Err(StackError::Malformed(format!(
                "L2CAP payload truncated: header says {} bytes, got {}",
                header.length,
                data.len() - L2CAP_BASIC_HEADER_SIZE
            )));
        }

        Ok(Self {
            header,
            payload: data[L2CAP_BASIC_HEADER_SIZE..payload_end].to_vec(),
        })
    }

    /// Serialize the L2CAP packet to a byte vector
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(self.size());
        result.extend_from_slice(&self.header.to_bytes());
        result.extend_from_slice(&self.payload);
        result
    }

    /// Get the full size of the packet in bytes
    pub fn size(&self) -> usize {
        L2CAP_BASIC_HEADER_SIZE + self.header.length as usize
    }
}

/// L2CAP Command header used in signaling packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2capCommandHeader {
    /// Command code
    pub code: u8,
    /// Command identifier
    pub identifier: u8,
    /// Length of command parameters
    pub length: u16,
}

impl L2capCommandHeader {
    /// Create a new command header
    pub fn new(code: u8, identifier: u8, length: u16) -> Self {
        Self {
            code,
            identifier,
            length,
        }
    }

    /// Parse a command header from raw bytes
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < L2CAP_COMMAND_HEADER_SIZE {
            return None;
        }

        let mut cursor = Cursor::new(&data[2..4]);
        let length = cursor.read_u16::<LittleEndian>().ok()?;

        Some(Self {
            code: data[0],
            identifier: data[1],
            length,
        })
    }

    /// Serialize the command header to bytes
    pub fn to_bytes(&self) -> [u8; L2CAP_COMMAND_HEADER_SIZE] {
        let mut result = [0u8; L2CAP_COMMAND_HEADER_SIZE];
        result[0] = self.code;
        result[1] = self.identifier;
        result[2..4].copy_from_slice(&self.length.to_le_bytes());
        result
    }
}

/// Split an SDU into K-frames addressed to `channel_id`.
///
/// The first frame carries the 2-byte SDU length in front of its payload.
/// Every frame payload (SDU length included) is at most `mps` bytes.
pub fn segment_sdu(channel_id: ChannelId, sdu: &[u8], mps: u16) -> Result<Vec<L2capPacket>, StackError> {
    if (mps as usize) <= L2CAP_SDU_LENGTH_SIZE {
        return Err(StackError::InvalidParameter(format!("MPS {} too small", mps)));
    }
    if sdu.len() > u16::MAX as usize {
        return Err(StackError::MtuExceeded);
    }

    let mps = mps as usize;
    let first_len = sdu.len().min(mps - L2CAP_SDU_LENGTH_SIZE);

    let mut first = Vec::with_capacity(L2CAP_SDU_LENGTH_SIZE + first_len);
    first.extend_from_slice(&(sdu.len() as u16).to_le_bytes());
    first.extend_from_slice(&sdu[..first_len]);

    let mut frames = vec![L2capPacket::new(channel_id, first)];
    frames.extend(
        sdu[first_len..]
            .chunks(mps)
            .map(|chunk| L2capPacket::new(channel_id, chunk.to_vec())),
    );

    Ok(frames)
}

/// Per-channel reassembly of K-frames into SDUs
#[derive(Debug)]
pub struct SduReassembler {
    /// Largest SDU accepted
    mtu: u16,
    /// SDU being assembled and its announced length
    pending: Option<(Vec<u8>, usize)>,
}

impl SduReassembler {
    pub fn new(mtu: u16) -> Self {
        Self { mtu, pending: None }
    }

    /// Whether a partially received SDU is buffered
    pub fn in_progress(&self) -> bool {
        self.pending.is_some()
    }

    /// Feed one K-frame payload; returns the SDU once it is complete
    pub fn push(&mut self, payload: &[u8]) -> Result<Option<Vec<u8>>, StackError> {
        let (buffer, expected) = match self.pending.take() {
            Some(pending) => pending,
            None => {
                if payload.len() < L2CAP_SDU_LENGTH_SIZE {
                    return Err(StackError::Malformed("K-frame missing SDU length".into()));
                }
                let mut cursor = Cursor::new(payload);
                let sdu_length = cursor
                    .read_u16::<LittleEndian>()
                    .map_err(|_| StackError::Malformed("Failed to read SDU length".into()))?;
                if sdu_length > self.mtu {
                    return Err(StackError::MtuExceeded);
                }

                let mut buffer = Vec::with_capacity(sdu_length as usize);
                buffer.extend_from_slice(&payload[L2CAP_SDU_LENGTH_SIZE..]);
                return self.settle(buffer, sdu_length as usize);
            }
        };

        let mut buffer = buffer;
        buffer.extend_from_slice(payload);
        self.settle(buffer, expected)
    }

    fn settle(&mut self, buffer: Vec<u8>, expected: usize) -> Result<Option<Vec<u8>>, StackError> {
        if buffer.len() > expected {
            return Err(StackError::Malformed(format!(
                "SDU length mismatch in reassembly: expected {}, got {}",
                expected,
                buffer.len()
            )));
        }

        if buffer.len() == expected {
            Ok(Some(buffer))
        } else {
            self.pending = Some((buffer, expected));
            Ok(None)
        }
    }
}
