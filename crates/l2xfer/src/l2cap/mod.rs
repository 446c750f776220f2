//! L2CAP (Logical Link Control and Adaptation Protocol) for LE credit-based channels
//!
//! This module provides:
//! - Basic L2CAP frames and the LE signaling command codec
//! - K-frame segmentation and SDU reassembly
//! - Per-channel credit and state tracking
//! - SPSM handling

pub mod constants;
pub mod types;
pub mod psm;
pub mod channel;
pub mod signaling;
pub mod packet;

// Re-export the public API
pub use self::types::*;
pub use self::channel::{LeChannel, LeChannelState};
pub use self::psm::{Spsm, obtain_dynamic_spsm};
pub use self::packet::{L2capPacket, SduReassembler};
pub use self::signaling::{SignalingMessage, SignalId};
