//! L2CAP constants for LE credit-based channels
//!
//! See Bluetooth Core Specification Vol 3, Part A.

/// Size of the basic L2CAP header (length + channel ID)
pub const L2CAP_BASIC_HEADER_SIZE: usize = 4;
/// Size of a signaling command header (code + identifier + length)
pub const L2CAP_COMMAND_HEADER_SIZE: usize = 4;
/// Size of the SDU length field carried by the first K-frame of an SDU
pub const L2CAP_SDU_LENGTH_SIZE: usize = 2;

// Fixed channel identifiers
pub const L2CAP_NULL_CID: u16 = 0x0000;
pub const L2CAP_ATT_CID: u16 = 0x0004;
pub const L2CAP_LE_SIGNALING_CID: u16 = 0x0005;
pub const L2CAP_SMP_CID: u16 = 0x0006;

// Dynamically allocated channel identifiers on an LE-U link
pub const L2CAP_LE_DYNAMIC_CID_MIN: u16 = 0x0040;
pub const L2CAP_LE_DYNAMIC_CID_MAX: u16 = 0x007F;

// Signaling command codes used on the LE signaling channel
pub const L2CAP_COMMAND_REJECT: u8 = 0x01;
pub const L2CAP_DISCONNECTION_REQUEST: u8 = 0x06;
pub const L2CAP_DISCONNECTION_RESPONSE: u8 = 0x07;
pub const L2CAP_LE_CREDIT_BASED_CONNECTION_REQUEST: u8 = 0x14;
pub const L2CAP_LE_CREDIT_BASED_CONNECTION_RESPONSE: u8 = 0x15;
pub const L2CAP_LE_FLOW_CONTROL_CREDIT: u8 = 0x16;

// Command reject reasons
pub const L2CAP_REJECT_NOT_UNDERSTOOD: u16 = 0x0000;
pub const L2CAP_REJECT_MTU_EXCEEDED: u16 = 0x0001;
pub const L2CAP_REJECT_INVALID_CID: u16 = 0x0002;

// LE credit-based channel limits
pub const L2CAP_LE_MIN_MTU: u16 = 23;
pub const L2CAP_LE_MIN_MPS: u16 = 23;
pub const L2CAP_LE_MAX_MPS: u16 = 65533;
pub const L2CAP_LE_DEFAULT_MTU: u16 = 247;
pub const L2CAP_LE_DEFAULT_MPS: u16 = 247;
pub const L2CAP_LE_MAX_CREDITS: u16 = 0xFFFF;

// LE simplified PSM ranges
pub const L2CAP_LE_SPSM_FIXED_MIN: u16 = 0x0001;
pub const L2CAP_LE_SPSM_FIXED_MAX: u16 = 0x007F;
pub const L2CAP_LE_SPSM_DYNAMIC_MIN: u16 = 0x0080;
pub const L2CAP_LE_SPSM_DYNAMIC_MAX: u16 = 0x00FF;
