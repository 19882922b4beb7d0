use rustc_hash::FxHasher;
use std::hash::BuildHasherDefault;

pub type FastBuildHasher = BuildHasherDefault<FxHasher>;
pub type FastMap<K, V> = std::collections::HashMap<K, V, FastBuildHasher>;
pub type FastHashSet<K> = std::collections::HashSet<K, FastBuildHasher>;
pub type FastIndexMap<K, V> = indexmap::IndexMap<K, V, FastBuildHasher>;
