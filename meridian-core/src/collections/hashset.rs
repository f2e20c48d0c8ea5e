pub type HashSet<T, S = foldhash::fast::RandomState> = hashbrown::HashSet<T, S>;
