//! Credit-based bulk transfers over LE L2CAP channels
//!
//! This module provides:
//! - The [`Transfer`] descriptor and its hooks
//! - The [`TransferEngine`] that moves transfers through their lifecycle
//! - Engine configuration

pub mod config;
pub mod engine;
pub mod types;
#[cfg(test)]
mod tests;

// Re-export the public API
pub use self::config::EngineConfig;
pub use self::engine::{EngineStats, TransferEngine};
pub use self::types::*;
