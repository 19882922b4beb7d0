use super::types::{FastMap, Scalar};
use lazy_static::lazy_static;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::{Arc, PoisonError, RwLock};

/// Interned handle. Two handles are equal iff the scalars they were interned
/// from are equal.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Symbol(u32);

impl Symbol {
    #[inline]
    pub fn id(&self) -> u32 {
        self.0
    }
}

lazy_static! {
    static ref GLOBAL: Arc<SymbolTable> = Arc::new(SymbolTable::new());
}

/// A thread-safe scalar interner.
/// Maps values to a stable `Symbol` so contexts compare and hash primary keys
/// as integers. Append-only: entries live until the process exits.
#[derive(Debug)]
pub struct SymbolTable {
    map: RwLock<FastMap<Scalar, Symbol>>,
    vec: RwLock<Vec<Scalar>>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(FastMap::default()),
            vec: RwLock::new(Vec::new()),
        }
    }

    /// Process-wide table shared by every pipeline that does not bring its own.
    pub fn global() -> Arc<SymbolTable> {
        GLOBAL.clone()
    }

    /// Intern a value, returning its unique Symbol.
    ///
    /// `Unset` is interned as `None` so both null sentinels share one handle.
    pub fn intern(&self, val: &Scalar) -> Symbol {
        let val = if val.is_unset() { &Scalar::None } else { val };

        // Fast path: read lock
        {
            let map = self.map.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(&id) = map.get(val) {
                return id;
            }
        }

        // Slow path: write lock
        let mut map = self.map.write().unwrap_or_else(PoisonError::into_inner);
        let mut vec = self.vec.write().unwrap_or_else(PoisonError::into_inner);

        // Check again in case another thread inserted it
        if let Some(&id) = map.get(val) {
            return id;
        }

        let id = Symbol(vec.len() as u32);
        vec.push(val.clone());
        map.insert(val.clone(), id);
        id
    }

    /// Look a value up without interning it.
    pub fn lookup(&self, val: &Scalar) -> Option<Symbol> {
        let val = if val.is_unset() { &Scalar::None } else { val };
        let map = self.map.read().unwrap_or_else(PoisonError::into_inner);
        map.get(val).copied()
    }

    pub fn resolve(&self, id: Symbol) -> Option<Scalar> {
        let vec = self.vec.read().unwrap_or_else(PoisonError::into_inner);
        vec.get(id.0 as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.vec.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Serialize for SymbolTable {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        // Only serialize the vector. The map can be rebuilt.
        let vec = self.vec.read().unwrap_or_else(PoisonError::into_inner);
        vec.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SymbolTable {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let vec: Vec<Scalar> = Vec::deserialize(deserializer)?;
        let mut map = FastMap::default();
        for (i, s) in vec.iter().enumerate() {
            map.insert(s.clone(), Symbol(i as u32));
        }

        Ok(SymbolTable {
            map: RwLock::new(map),
            vec: RwLock::new(vec),
        })
    }
}
