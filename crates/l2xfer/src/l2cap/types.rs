//! Type definitions for L2CAP operations
//!
//! This module contains core data structures shared by the signaling
//! codec, the host bridge and the transfer engine.

use std::fmt;

use super::constants::*;

/// Channel identifier of a dynamically allocated LE channel
pub type ChannelId = u16;

/// Handle of an LE link as assigned by the host stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(pub u8);

impl ConnectionHandle {
    /// Placeholder for "no connection assigned yet"
    pub const INVALID: Self = Self(0xFF);

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Result code of an LE credit-based connection response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionResult {
    /// Connection successful
    Success,
    /// SPSM not supported
    SpsmNotSupported,
    /// No resources available
    NoResourcesAvailable,
    /// Insufficient authentication
    InsufficientAuthentication,
    /// Insufficient authorization
    InsufficientAuthorization,
    /// Encryption key size too short
    InsufficientEncryptionKeySize,
    /// Insufficient encryption
    InsufficientEncryption,
    /// Invalid source CID
    InvalidSourceCid,
    /// Source CID already allocated
    SourceCidAlreadyAllocated,
    /// Unacceptable parameters
    UnacceptableParameters,
    /// Any other (reserved) value
    Other(u16),
}

impl ConnectionResult {
    /// Get the result value as u16
    pub fn value(&self) -> u16 {
        match self {
            Self::Success => 0x0000,
            Self::SpsmNotSupported => 0x0002,
            Self::NoResourcesAvailable => 0x0004,
            Self::InsufficientAuthentication => 0x0005,
            Self::InsufficientAuthorization => 0x0006,
            Self::InsufficientEncryptionKeySize => 0x0007,
            Self::InsufficientEncryption => 0x0008,
            Self::InvalidSourceCid => 0x0009,
            Self::SourceCidAlreadyAllocated => 0x000A,
            Self::UnacceptableParameters => 0x000B,
            Self::Other(value) => *value,
        }
    }

    /// Create a result from its u16 value
    pub fn from_value(value: u16) -> Self {
        match value {
            0x0000 => Self::Success,
            0x0002 => Self::SpsmNotSupported,
            0x0004 => Self::NoResourcesAvailable,
            0x0005 => Self::InsufficientAuthentication,
            0x0006 => Self::InsufficientAuthorization,
            0x0007 => Self::InsufficientEncryptionKeySize,
            0x0008 => Self::InsufficientEncryption,
            0x0009 => Self::InvalidSourceCid,
            0x000A => Self::SourceCidAlreadyAllocated,
            0x000B => Self::UnacceptableParameters,
            other => Self::Other(other),
        }
    }

    pub fn is_success(&self) -> bool {
        *self == Self::Success
    }
}

impl fmt::Display for ConnectionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "Success"),
            Self::SpsmNotSupported => write!(f, "SPSM not supported"),
            Self::NoResourcesAvailable => write!(f, "No resources available"),
            Self::InsufficientAuthentication => write!(f, "Insufficient authentication"),
            Self::InsufficientAuthorization => write!(f, "Insufficient authorization"),
            Self::InsufficientEncryptionKeySize => write!(f, "Insufficient encryption key size"),
            Self::InsufficientEncryption => write!(f, "Insufficient encryption"),
            Self::InvalidSourceCid => write!(f, "Invalid source CID"),
            Self::SourceCidAlreadyAllocated => write!(f, "Source CID already allocated"),
            Self::UnacceptableParameters => write!(f, "Unacceptable parameters"),
            Self::Other(value) => write!(f, "Reserved result {:#06x}", value),
        }
    }
}

/// Why a channel (or the link carrying it) went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer requested the disconnection
    RemoteDisconnected,
    /// We requested the disconnection and the peer confirmed it
    LocalDisconnected,
    /// The underlying LE link was lost
    ConnectionLost,
    /// Stack-specific reason code
    Other(u16),
}

impl CloseReason {
    /// Whether the channel was torn down by an orderly disconnection
    /// rather than a failure
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::RemoteDisconnected | Self::LocalDisconnected)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RemoteDisconnected => write!(f, "Remote disconnected"),
            Self::LocalDisconnected => write!(f, "Local disconnected"),
            Self::ConnectionLost => write!(f, "Connection lost"),
            Self::Other(code) => write!(f, "Reason {:#06x}", code),
        }
    }
}

/// LE Credit-Based Connection configuration
#[derive(Debug, Clone, Copy)]
pub struct LeCreditBasedConfig {
    /// Maximum Transmission Unit (largest SDU we accept)
    pub mtu: u16,
    /// Maximum PDU size (largest K-frame payload we accept)
    pub mps: u16,
    /// Initial credits granted to the peer
    pub initial_credits: u16,
}

impl Default for LeCreditBasedConfig {
    fn default() -> Self {
        Self {
            mtu: L2CAP_LE_DEFAULT_MTU,
            mps: L2CAP_LE_DEFAULT_MPS,
            initial_credits: 1,
        }
    }
}

impl LeCreditBasedConfig {
    /// Validates that the parameters are within the LE limits
    pub fn validate(&self) -> bool {
        self.mtu >= L2CAP_LE_MIN_MTU
            && self.mps >= L2CAP_LE_MIN_MPS
            && self.mps <= L2CAP_LE_MAX_MPS
    }
}
