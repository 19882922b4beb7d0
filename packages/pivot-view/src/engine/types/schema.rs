use super::maps::FastIndexMap;
use super::scalar::DType;
use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Ordered column list plus the designated primary-key column.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Schema {
    columns: FastIndexMap<SmolStr, DType>,
    index: usize,
}

impl Schema {
    /// Build a schema from `(name, dtype)` pairs. `index` names the primary-key
    /// column and must be one of them.
    pub fn new<I, S>(columns: I, index: &str) -> Result<Self, EngineError>
    where
        I: IntoIterator<Item = (S, DType)>,
        S: Into<SmolStr>,
    {
        let mut map = FastIndexMap::default();
        for (name, dtype) in columns {
            let name = name.into();
            if map.insert(name.clone(), dtype).is_some() {
                return Err(EngineError::SchemaMismatch {
                    reason: format!("duplicate column '{}'", name),
                });
            }
        }
        let index = map
            .get_index_of(index)
            .ok_or_else(|| EngineError::UnknownColumn(SmolStr::new(index)))?;
        Ok(Self { columns: map, index })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Position of the primary-key column.
    #[inline]
    pub fn index_column(&self) -> usize {
        self.index
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.get_index_of(name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub fn column_name(&self, idx: usize) -> Option<&SmolStr> {
        self.columns.get_index(idx).map(|(name, _)| name)
    }

    /// Declared type, `DType::None` for unknown positions.
    pub fn dtype(&self, idx: usize) -> DType {
        self.columns
            .get_index(idx)
            .map(|(_, dtype)| *dtype)
            .unwrap_or(DType::None)
    }

    pub fn dtype_of(&self, name: &str) -> DType {
        self.columns.get(name).copied().unwrap_or(DType::None)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&SmolStr, DType)> {
        self.columns.iter().map(|(name, dtype)| (name, *dtype))
    }

    pub fn column_names(&self) -> Vec<SmolStr> {
        self.columns.keys().cloned().collect()
    }
}
