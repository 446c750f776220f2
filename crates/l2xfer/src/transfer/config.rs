//! Transfer engine configuration

use crate::l2cap::types::LeCreditBasedConfig;

/// Engine-wide settings
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Credit used when a transfer is started with `credit == 0`
    pub default_credit: u16,
    /// Most transfers the engine holds at once, in any state
    pub max_transfers: usize,
    /// MTU/MPS applied to transfers that leave `max_sdu`/`max_pdu` at 0
    pub channel: LeCreditBasedConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_credit: 1,
            max_transfers: 8,
            channel: LeCreditBasedConfig::default(),
        }
    }
}
