//! Backhaul Shared Library
//!
//! Wire protocol types and codec spoken between the relay and private-server agents.

pub mod protocol;
pub mod error;

pub use error::{Error, Result};
