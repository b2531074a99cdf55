//! Shared error and control-plane record types for the ipscell agent.

pub mod error;
pub mod proto;

pub use error::IpsCellError;
