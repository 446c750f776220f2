//! l2xfer - Credit-based bulk data transfers over Bluetooth LE L2CAP channels
//!
//! This library moves a known number of bytes between two devices over an
//! LE credit-based L2CAP channel. The owner of a transfer supplies the data
//! through hooks; the [`TransferEngine`] opens or accepts the channel,
//! pushes or consumes segments as credit allows and reports the outcome
//! exactly once.
//!
//! The engine talks to the Bluetooth host through the [`BleStack`] trait.
//! [`SignalingHost`] is an implementation that speaks the LE signaling
//! protocol over raw L2CAP frames.

pub mod error;
pub mod host;
pub mod l2cap;
pub mod stack;
pub mod transfer;

mod sync;

// Re-export common types for convenience
pub use error::{StackError, TransferError, TransferResult};
pub use host::{OutboundFrame, SignalingHost};
pub use l2cap::{ChannelId, CloseReason, ConnectionHandle, ConnectionResult, Spsm};
pub use stack::{BleStack, BtEvent};
pub use transfer::{
    EngineConfig, EngineStats, Finisher, Receiver, Transfer, TransferEngine, TransferId, TransferMode,
    TransferState, Transmitter,
};
