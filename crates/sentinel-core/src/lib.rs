//! # sentinel-core
//! Foundation types for the Sentinel consensus-layer networking stack.
//!
//! - [`types`]: fixed-size chain primitives (roots, signatures, fork versions)
//! - [`beacon`]: beacon-chain objects carried over gossip
//! - [`clparams`]: per-network genesis, p2p and fork-schedule parameters
//! - [`codec`]: bounded bincode encoding shared by every wire format

pub mod beacon;
pub mod clparams;
pub mod codec;
pub mod constants;
pub mod error;
pub mod types;
