//! Collection aliases shared by every Kestrel crate.

pub use smallvec::{smallvec, SmallVec};

pub type DefaultHashBuilder = foldhash::fast::RandomState;

/// Hash state with a fixed seed, for hashes that must be identical across runs.
pub type StableHashBuilder = foldhash::fast::FixedState;

pub const STABLE_HASH_SEED: u64 = 0x6b65_7374_7265_6c21;

#[inline]
pub fn stable_hash_builder() -> StableHashBuilder {
    foldhash::fast::FixedState::with_seed(STABLE_HASH_SEED)
}

/// Hash a value with the fixed-seed state.
pub fn stable_hash<T: std::hash::Hash + ?Sized>(value: &T) -> u64 {
    use std::hash::BuildHasher;
    stable_hash_builder().hash_one(value)
}

pub mod hashmap {
    pub type HashMap<K, V> = hashbrown::HashMap<K, V, super::DefaultHashBuilder>;
    pub use hashbrown::hash_map::Entry;
}

pub mod hashset {
    pub type HashSet<K> = hashbrown::HashSet<K, super::DefaultHashBuilder>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_hash_is_deterministic() {
        let a = stable_hash(&("pipeline", 7u32));
        let b = stable_hash(&("pipeline", 7u32));
        assert_eq!(a, b);
        assert_ne!(a, stable_hash(&("pipeline", 8u32)));
    }
}
