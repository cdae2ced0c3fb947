//! Store key generation.

use std::fmt;
use std::fmt::Write as _;
use std::time::Duration;

use crate::ratelimit::Rate;

/// Default namespace prepended to every key.
pub const DEFAULT_PREFIX: &str = "sg";

/// Longest key prefix the configuration accepts.
pub const MAX_PREFIX_LEN: usize = 64;

/// Identifiers up to this many bytes of printable ASCII go into keys verbatim.
const MAX_VERBATIM_ID_LEN: usize = 128;

/// Marks an identifier that was rewritten. Verbatim identifiers never start with it.
const ENCODED_MARKER: char = '~';

/// A key that uniquely identifies one counter or rate state in the store.
///
/// The identifier always comes last and every field before it is numeric,
/// so two keys only collide if prefix, kind, descriptor and identifier are
/// all equal.
///
/// Identifiers are opaque. Short printable ones are used as-is; anything
/// else is hex-encoded (`~x...`), or hashed (`~h...`) when even the hex form
/// would not fit, so every key stays within what memcached accepts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreKey {
    rendered: String,
}

impl StoreKey {
    /// Key for the fixed-window counter of `id` in window number `index`.
    pub fn window(prefix: &str, id: &str, window: Duration, index: u64) -> Self {
        Self {
            rendered: format!(
                "{}:fw:{}:{}:{}",
                prefix,
                window.as_nanos(),
                index,
                encode_id(id)
            ),
        }
    }

    /// Key for the theoretical arrival time of `id` under `rate`.
    pub fn rate(prefix: &str, id: &str, rate: &Rate) -> Self {
        Self {
            rendered: format!(
                "{}:gcra:{}:{}:{}",
                prefix,
                rate.interval().as_nanos(),
                rate.burst(),
                encode_id(id)
            ),
        }
    }

    /// The wire form of the key.
    pub fn as_str(&self) -> &str {
        &self.rendered
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered)
    }
}

/// Whether `s` can sit in a memcached key unchanged.
pub(crate) fn is_key_safe(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_graphic())
}

fn encode_id(id: &str) -> String {
    if !id.is_empty()
        && id.len() <= MAX_VERBATIM_ID_LEN
        && is_key_safe(id)
        && !id.starts_with(ENCODED_MARKER)
    {
        return id.to_string();
    }

    if 2 + id.len() * 2 <= MAX_VERBATIM_ID_LEN {
        let mut encoded = String::with_capacity(2 + id.len() * 2);
        encoded.push(ENCODED_MARKER);
        encoded.push('x');
        for byte in id.bytes() {
            let _ = write!(encoded, "{:02x}", byte);
        }
        return encoded;
    }

    format!("{}h{:032x}:{}", ENCODED_MARKER, fnv1a_128(id.as_bytes()), id.len())
}

/// 128-bit FNV-1a. Stable across processes and builds, unlike the std hashers.
fn fnv1a_128(bytes: &[u8]) -> u128 {
    const OFFSET: u128 = 0x6c62_272e_07bb_0142_62b8_2175_6295_c58d;
    const PRIME: u128 = 0x0000_0000_0100_0000_0000_0000_0000_013b;

    bytes
        .iter()
        .fold(OFFSET, |hash, &b| (hash ^ u128::from(b)).wrapping_mul(PRIME))
}
