//! Fixed-size chain primitives.
//!
//! Every wire type derives `bincode::Encode`/`bincode::Decode`; the
//! configuration-facing ones (roots, versions, digests) also derive serde.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ParamsError;

pub type Slot = u64;
pub type Epoch = u64;
pub type ValidatorIndex = u64;
pub type CommitteeIndex = u64;
pub type Gwei = u64;

/// A 32-byte SSZ-style root or hash.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Root(pub [u8; 32]);

impl Root {
    /// The zero root.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Root {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl From<[u8; 32]> for Root {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Root {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl FromStr for Root {
    type Err = ParamsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(decode_hex_array(s)?))
    }
}

/// A compressed BLS12-381 signature (96 bytes).
///
/// Signatures are carried opaquely; nothing in this stack verifies them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, bincode::Encode, bincode::Decode)]
pub struct BlsSignature(pub [u8; 96]);

impl BlsSignature {
    pub const EMPTY: Self = Self([0u8; 96]);

    pub fn as_bytes(&self) -> &[u8; 96] {
        &self.0
    }
}

impl Default for BlsSignature {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// A compressed BLS12-381 public key (48 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, bincode::Encode, bincode::Decode)]
pub struct BlsPublicKey(pub [u8; 48]);

impl Default for BlsPublicKey {
    fn default() -> Self {
        Self([0u8; 48])
    }
}

/// A 20-byte execution-layer address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, bincode::Encode, bincode::Decode)]
pub struct ExecutionAddress(pub [u8; 20]);

/// A 4-byte fork version.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Version(pub [u8; 4]);

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for Version {
    type Err = ParamsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(decode_hex_array(s)?))
    }
}

/// A 4-byte digest of the current fork version and the genesis validators root.
///
/// Prefixes every gossip topic and is advertised in identity records so that
/// peers on a different fork or network can be told apart cheaply.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct ForkDigest(pub [u8; 4]);

impl ForkDigest {
    /// Lowercase hex without prefix, as used inside topic names.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ForkDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for ForkDigest {
    type Err = ParamsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(decode_hex_array(s)?))
    }
}

/// Decode an optionally `0x`-prefixed hex string into a fixed-size array.
pub fn decode_hex_array<const N: usize>(s: &str) -> Result<[u8; N], ParamsError> {
    let trimmed = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(trimmed).map_err(|e| ParamsError::InvalidHex(format!("{s}: {e}")))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| ParamsError::InvalidHex(format!("{s}: expected {N} bytes, got {}", b.len())))
}

/// Decode a fixed-size hex literal at compile time. Invalid input fails the build.
pub(crate) const fn hex_literal<const N: usize>(s: &str) -> [u8; N] {
    const fn nibble(c: u8) -> u8 {
        match c {
            b'0'..=b'9' => c - b'0',
            b'a'..=b'f' => c - b'a' + 10,
            b'A'..=b'F' => c - b'A' + 10,
            _ => panic!("invalid hex character"),
        }
    }
    let bytes = s.as_bytes();
    assert!(bytes.len() == N * 2, "hex literal has the wrong length");
    let mut out = [0u8; N];
    let mut i = 0;
    while i < N {
        out[i] = (nibble(bytes[2 * i]) << 4) | nibble(bytes[2 * i + 1]);
        i += 1;
    }
    out
}
