//! Wire-level pieces of the host bridge.
//!
//! - **codec**: tag framing, read-until-EOF document frames
//! - **protocol**: request/response envelopes and operation payloads
//! - **transport**: one-connection-per-message outbound delivery
//! - **xml**: small owned element tree for envelopes and descriptors

pub mod codec;
pub mod protocol;
pub mod transport;
pub mod xml;
