//! Error types for the l2xfer library
//!
//! This module defines the error types used throughout the library.
//! Parameter problems are returned synchronously; channel-level failures
//! reach the owner of a transfer only through its finish hook.

use thiserror::Error;

use crate::l2cap::types::{CloseReason, ConnectionResult};

/// Errors reported by a [`BleStack`](crate::stack::BleStack) implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StackError {
    #[error("Channel not found")]
    ChannelNotFound,

    #[error("No resources available")]
    NoResources,

    #[error("Connection not established")]
    NotConnected,

    #[error("MTU exceeded")]
    MtuExceeded,

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Command not understood: code {code:#04x}")]
    CommandNotUnderstood { code: u8, identifier: u8 },
}

/// Errors that can occur when driving a transfer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Missing callback: {0}")]
    MissingCallback(&'static str),

    #[error("Invalid connection handle")]
    InvalidHandle,

    #[error("Transfer not found")]
    UnknownTransfer,

    #[error("Invalid state for operation")]
    InvalidState,

    #[error("Resource limit reached")]
    ResourceLimitReached,

    #[error("Remote device rejected channel: {0}")]
    Rejected(ConnectionResult),

    #[error("Remote device rejected command: reason {0:#06x}")]
    CommandRejected(u16),

    #[error("Channel closed: {0}")]
    Closed(CloseReason),

    #[error("Transfer aborted")]
    Aborted,

    #[error("Transfer engine shut down")]
    Shutdown,

    #[error("Stack error: {0}")]
    Stack(#[from] StackError),
}

/// Result type for transfer operations
pub type TransferResult<T> = std::result::Result<T, TransferError>;
