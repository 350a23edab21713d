//! Integration test suite for Sentinel.
//!
//! Every test boots real nodes on loopback sockets with ephemeral ports and
//! drives them through the public [`sentinel_network::Sentinel`] handle.

pub mod helpers;
