//! Simplified Protocol/Service Multiplexer (SPSM) handling for LE channels
//!
//! LE credit-based channels are addressed by an SPSM rather than a classic
//! PSM. Values 0x0001-0x007F are assigned by the Bluetooth SIG, values
//! 0x0080-0x00FF are dynamic.

use std::fmt;
use std::sync::atomic::{AtomicU16, Ordering};

use super::constants::*;

/// LE Simplified Protocol/Service Multiplexer.
///
/// See Bluetooth Core Specification Vol 3, Part A, Section 4.22 and
/// assigned numbers: https://www.bluetooth.com/specifications/assigned-numbers/
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Spsm(u16);

impl Spsm {
    /// Unset SPSM, matches any incoming request on a responder transfer
    pub const UNSET: Self = Self(0x0000);
    /// Internet Protocol Support Profile
    pub const IPSP: Self = Self(0x0023);
    /// Object Transfer Service
    pub const OTS: Self = Self(0x0025);
    /// Enhanced ATT
    pub const EATT: Self = Self(0x0027);

    /// Create an SPSM from a raw value, rejecting values outside the LE range
    pub fn from_value(value: u16) -> Option<Self> {
        if value == 0 || value > L2CAP_LE_SPSM_DYNAMIC_MAX {
            None
        } else {
            Some(Self(value))
        }
    }

    /// Get the SPSM value as u16
    pub fn value(&self) -> u16 {
        self.0
    }

    pub fn is_set(&self) -> bool {
        self.0 != 0
    }

    /// Check if the SPSM is valid for an LE credit-based connection request
    pub fn is_valid(&self) -> bool {
        self.0 >= L2CAP_LE_SPSM_FIXED_MIN && self.0 <= L2CAP_LE_SPSM_DYNAMIC_MAX
    }

    /// Whether the SPSM falls into the dynamically assigned range
    pub fn is_dynamic(&self) -> bool {
        self.0 >= L2CAP_LE_SPSM_DYNAMIC_MIN && self.0 <= L2CAP_LE_SPSM_DYNAMIC_MAX
    }

    /// Whether a request for `requested` should be routed to a transfer
    /// registered with this SPSM
    pub fn accepts(&self, requested: Spsm) -> bool {
        !self.is_set() || *self == requested
    }
}

impl fmt::Display for Spsm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::UNSET => write!(f, "Unset SPSM"),
            Self::IPSP => write!(f, "IPSP (0x0023)"),
            Self::OTS => write!(f, "OTS (0x0025)"),
            Self::EATT => write!(f, "EATT (0x0027)"),
            Self(value) if self.is_dynamic() => write!(f, "Dynamic SPSM (0x{:04X})", value),
            Self(value) => write!(f, "SPSM (0x{:04X})", value),
        }
    }
}

// Counter for dynamic SPSM allocation
static NEXT_DYNAMIC_SPSM: AtomicU16 = AtomicU16::new(L2CAP_LE_SPSM_DYNAMIC_MIN);

/// Obtain a new dynamic SPSM value
///
/// Values cycle through 0x0080-0x00FF; after the last one the counter
/// wraps back to the start of the range.
pub fn obtain_dynamic_spsm() -> Spsm {
    let value = NEXT_DYNAMIC_SPSM
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
            if current >= L2CAP_LE_SPSM_DYNAMIC_MAX {
                Some(L2CAP_LE_SPSM_DYNAMIC_MIN)
            } else {
                Some(current + 1)
            }
        })
        .unwrap_or_else(|previous| previous);

    Spsm(value)
}
