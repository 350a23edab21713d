//! Protocol constants shared by the networking layers.

/// Epoch number used for forks that are not scheduled.
pub const FAR_FUTURE_EPOCH: u64 = u64::MAX;

pub const GENESIS_EPOCH: u64 = 0;
pub const GENESIS_SLOT: u64 = 0;

/// Maximum size of a gossip payload after the Bellatrix fork (10 MiB).
pub const GOSSIP_MAX_SIZE: usize = 10 * 1024 * 1024;

/// Maximum size of a single request/response chunk (10 MiB).
pub const MAX_CHUNK_SIZE: usize = 10 * 1024 * 1024;

/// Upper bound handed to the decoder so that hostile length prefixes can
/// never request more memory than a full gossip payload.
pub const MAX_DECODE_BYTES: usize = GOSSIP_MAX_SIZE;

pub const ATTESTATION_SUBNET_COUNT: u64 = 64;
pub const SYNC_COMMITTEE_SUBNET_COUNT: u64 = 4;
pub const MAX_REQUEST_BLOCKS: u64 = 1024;

/// Length of a gossip content identifier in bytes.
pub const MESSAGE_ID_LEN: usize = 20;

/// Domain mixed into content identifiers of payloads that decoded successfully.
pub const MESSAGE_DOMAIN_VALID: [u8; 4] = [0x01, 0x00, 0x00, 0x00];

/// Seconds to wait for the first byte of a response.
pub const TTFB_TIMEOUT_SECS: u64 = 5;
/// Seconds to wait for a full response once the first byte arrived.
pub const RESP_TIMEOUT_SECS: u64 = 10;

/// Maximum number of bytes in a graffiti field.
pub const GRAFFITI_LEN: usize = 32;
