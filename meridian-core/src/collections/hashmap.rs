pub type HashMap<K, V, S = foldhash::fast::RandomState> = hashbrown::HashMap<K, V, S>;

pub use hashbrown::hash_map::Entry;
