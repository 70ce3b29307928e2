//! Collections keyed by untrusted input.
//!
//! Peer and item identifiers are chosen by remote peers, so hash maps
//! holding them use SipHash under a per-tracker random key. [`RandomState`]
//! is the one place keyed hashing happens in this crate; the priority
//! oracle (see [`crate::priority`]) draws on it too.
use bitcoin_hashes::siphash24;
use rand::rngs::OsRng;
use rand::RngCore;

/// A `HashMap` whose hasher is keyed from a `fastrand::Rng`.
pub type HashMap<K, V> = std::collections::HashMap<K, V, RandomState>;

/// A `HashSet` whose hasher is keyed from a `fastrand::Rng`.
pub type HashSet<K> = std::collections::HashSet<K, RandomState>;

/// A SipHash-2-4 key, usable directly for one-shot hashing and as the
/// hasher state of [`HashMap`] and [`HashSet`].
///
/// The default state has an all-zero key and produces reproducible hashes.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomState {
    key1: u64,
    key2: u64,
}

impl RandomState {
    /// A state keyed from the operating system's cryptographic RNG.
    pub fn random() -> Self {
        Self {
            key1: OsRng.next_u64(),
            key2: OsRng.next_u64(),
        }
    }

    /// One-shot keyed hash of a byte string.
    pub fn hash(&self, data: &[u8]) -> u64 {
        siphash24::Hash::hash_with_keys(self.key1, self.key2, data).as_u64()
    }
}

impl std::hash::BuildHasher for RandomState {
    type Hasher = Hasher;

    fn build_hasher(&self) -> Self::Hasher {
        Hasher {
            data: vec![],
            state: *self,
        }
    }
}

impl From<fastrand::Rng> for RandomState {
    fn from(rng: fastrand::Rng) -> Self {
        Self {
            key1: rng.u64(..),
            key2: rng.u64(..),
        }
    }
}

/// Hasher buffering its input for a one-shot [`RandomState::hash`].
#[derive(Default)]
pub struct Hasher {
    data: Vec<u8>,
    state: RandomState,
}

impl std::hash::Hasher for Hasher {
    fn write(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes)
    }

    fn finish(&self) -> u64 {
        self.state.hash(&self.data)
    }
}
