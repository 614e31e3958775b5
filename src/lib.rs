pub mod commands;
pub mod cryptography;
pub mod diskfree;
pub mod networking;
pub mod probe;
pub mod protocol;
pub mod ratelimit;
pub mod server;
pub mod store;
pub mod web;

use std::time::Duration;

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;
pub const CODE_LENGTH: usize = 6;

/// Plaintext chunk size for chunked uploads and downloads.
pub const CHUNK_SIZE: usize = 256 * 1024;
/// Hard cap on the plaintext size of a single blob.
pub const MAX_BLOB_SIZE: u64 = 15 * 1024 * 1024 * 1024;
/// Secure uploads at or below this size are sent as one sealed buffer;
/// anything larger goes chunked so RAM stays bounded.
pub const SECURE_SINGLE_BLOB_MAX: u64 = 500 * 1024 * 1024;

/// How long a stored blob is served after ingest.
pub const STORAGE_DURATION: Duration = Duration::from_secs(60 * 60);
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub const RATE_LIMIT_ATTEMPTS: u32 = 50;
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(10 * 60);
pub const BAN_DURATION: Duration = Duration::from_secs(15 * 60);

/// Buffered reader/writer size on connection sockets.
pub const BUF_SIZE: usize = 2 * 1024 * 1024;
/// Kernel socket buffer size requested for high-BDP links.
pub const TCP_BUFFER_SIZE: usize = 4 * 1024 * 1024;

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
pub const PROBE_DIAL_TIMEOUT: Duration = Duration::from_millis(500);
pub const PROBE_DEADLINE: Duration = Duration::from_secs(1);
pub const LIST_FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Throughput sample the server sends back to a probe.
pub const PROBE_PAYLOAD_SIZE: u32 = 1024 * 1024;
/// Largest probe payload a client will accept from a server.
pub const PROBE_PAYLOAD_MAX: u32 = 4 * 1024 * 1024;

/// Sentinel free-space value when the platform cannot report it.
pub const FREE_BYTES_UNKNOWN: u64 = u64::MAX;

pub const BENCH_BLOCK_SIZE: usize = 64 * 1024;
pub const BENCH_PHASE_DURATION: Duration = Duration::from_secs(10);

/// Well-known list of relay servers, one `<id>:<host:port>` per line.
pub const ADDRESS_LIST_URL: &str =
    "https://raw.githubusercontent.com/codedrop-relay/servers/refs/heads/main/address";
