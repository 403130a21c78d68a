//! Fast non-cryptographic hashing for the leaf table. Keys are hashed once up front and carried
//! around as [`PreHashed`] values; the map then uses a pass-through hasher so the hash isn't
//! recomputed on every probe. Cryptographic digests for the propagation rounds don't live here,
//! they're in the fold pass itself.

use hashbrown::HashMap;
use std::hash::BuildHasher;
use std::hash::Hasher;
use std::ops::Deref;

pub(crate) type PassThroughHashMap<K, V> = HashMap<PreHashed<K>, V, PassThroughHasher>;

pub(crate) fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut hasher = foldhash::fast::FixedState::default().build_hasher();
    hasher.write(bytes);
    hasher.finish()
}

/// Mixes a second hash into an existing one. Order-dependent, so hashing the same parts in a
/// different order gives a different result.
pub(crate) fn fold_hashes(hash: u64, other: u64) -> u64 {
    hash ^ other
        .wrapping_add(0x9e37_79b9)
        .wrapping_add(hash << 6)
        .wrapping_add(hash >> 2)
}

/// A value paired with its precomputed hash.
#[derive(Eq, Clone, Copy)]
pub(crate) struct PreHashed<T> {
    value: T,
    hash: u64,
}

impl<T> PreHashed<T> {
    pub(crate) fn new(value: T, hash: u64) -> Self {
        Self { value, hash }
    }

    pub(crate) fn hash(&self) -> u64 {
        self.hash
    }
}

impl<T: PartialEq> PartialEq for PreHashed<T> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<T> std::hash::Hash for PreHashed<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl<T> Deref for PreHashed<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

#[derive(Default)]
pub(crate) struct PassThroughHasher {
    hash: u64,
}

impl Hasher for PassThroughHasher {
    fn finish(&self) -> u64 {
        self.hash
    }

    fn write_u64(&mut self, i: u64) {
        self.hash = i;
    }

    fn write(&mut self, _bytes: &[u8]) {
        panic!("PassThroughHasher used with inappropriate hash implementation");
    }
}

impl BuildHasher for PassThroughHasher {
    type Hasher = PassThroughHasher;

    fn build_hasher(&self) -> Self::Hasher {
        PassThroughHasher::default()
    }
}
