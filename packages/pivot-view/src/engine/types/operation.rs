use super::scalar::Scalar;
use serde::{Deserialize, Serialize};

/// Operation type for row mutations.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub const INSERT_TAG: u8 = 0;
    pub const UPDATE_TAG: u8 = 1;
    pub const DELETE_TAG: u8 = 2;

    /// Decode a wire tag. Any other value is protocol corruption.
    #[inline]
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            Self::INSERT_TAG => Some(Operation::Insert),
            Self::UPDATE_TAG => Some(Operation::Update),
            Self::DELETE_TAG => Some(Operation::Delete),
            _ => None,
        }
    }

    #[inline]
    pub fn tag(&self) -> u8 {
        match self {
            Operation::Insert => Self::INSERT_TAG,
            Operation::Update => Self::UPDATE_TAG,
            Operation::Delete => Self::DELETE_TAG,
        }
    }

}

/// One row of an update batch: a raw operation tag plus one value per schema
/// column. The primary key is the value in the schema's index column.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OpRow {
    pub op: u8,
    pub values: Vec<Scalar>,
}

impl OpRow {
    pub fn new(op: Operation, values: Vec<Scalar>) -> Self {
        Self { op: op.tag(), values }
    }

    pub fn insert(values: Vec<Scalar>) -> Self {
        Self::new(Operation::Insert, values)
    }

    /// Partial update: cells left as `Scalar::Unset` keep their current value.
    pub fn update(values: Vec<Scalar>) -> Self {
        Self::new(Operation::Update, values)
    }

    /// Delete row for `pkey`; only the index column is meaningful.
    pub fn delete(width: usize, index: usize, pkey: Scalar) -> Self {
        let mut values = vec![Scalar::Unset; width];
        if let Some(slot) = values.get_mut(index) {
            *slot = pkey;
        }
        Self::new(Operation::Delete, values)
    }

    /// Row with a raw tag, used to feed unchecked wire data through.
    pub fn raw(op: u8, values: Vec<Scalar>) -> Self {
        Self { op, values }
    }
}

/// How a key's liveness and content moved across one applied batch.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Key was not live before and is live now
    Inserted,
    /// Key stayed live and at least one value changed
    Updated,
    /// Key stayed live with identical values
    Unchanged,
    /// Key was live and has been deleted
    Deleted,
    /// Key was deleted without ever being live
    Absent,
}

impl Transition {
    /// Was the key live before the batch?
    #[inline]
    pub fn existed(&self) -> bool {
        matches!(self, Transition::Updated | Transition::Unchanged | Transition::Deleted)
    }

    /// Is the key live after the batch?
    #[inline]
    pub fn is_live(&self) -> bool {
        matches!(self, Transition::Inserted | Transition::Updated | Transition::Unchanged)
    }
}

#[cfg(test)]
mod operation_tests {
    use super::*;

    #[test]
    fn test_tag_roundtrip_and_unknown() {
        for op in [Operation::Insert, Operation::Update, Operation::Delete] {
            assert_eq!(Operation::from_tag(op.tag()), Some(op));
        }
        assert_eq!(Operation::from_tag(9), None);
    }

    #[test]
    fn test_delete_row_places_key_in_index_column() {
        let row = OpRow::delete(3, 1, Scalar::str("k"));
        assert_eq!(row.op, Operation::DELETE_TAG);
        assert_eq!(row.values, vec![Scalar::Unset, Scalar::str("k"), Scalar::Unset]);
    }

    #[test]
    fn test_transition_liveness() {
        assert!(!Transition::Inserted.existed());
        assert!(Transition::Inserted.is_live());
        assert!(Transition::Deleted.existed());
        assert!(!Transition::Deleted.is_live());
        assert!(!Transition::Absent.existed());
        assert!(!Transition::Absent.is_live());
    }
}
