use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Declared type of a column.
///
/// `None` is the sentinel returned for columns that do not exist.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    #[default]
    None,
    Bool,
    Int,
    Float,
    Str,
    Timestamp,
}

impl DType {
    #[inline]
    pub fn is_numeric(&self) -> bool {
        matches!(self, DType::Int | DType::Float)
    }
}

/// A single cell value.
///
/// `Unset` only appears on the ingestion side ("column not provided"). The
/// master table never stores it and contexts normalize it to `None` before
/// anything leaves the query surface.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub enum Scalar {
    #[default]
    None,
    Unset,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(SmolStr),
    Timestamp(i64),
}

impl Scalar {
    pub fn str(s: impl AsRef<str>) -> Self {
        Scalar::Str(SmolStr::new(s.as_ref()))
    }

    /// True for both null-like sentinels.
    #[inline]
    pub fn is_none(&self) -> bool {
        matches!(self, Scalar::None | Scalar::Unset)
    }

    #[inline]
    pub fn is_unset(&self) -> bool {
        matches!(self, Scalar::Unset)
    }

    /// Collapse `Unset` into `None` for output.
    #[inline]
    pub fn normalized(self) -> Self {
        match self {
            Scalar::Unset => Scalar::None,
            other => other,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Int(i) => Some(*i as f64),
            Scalar::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            Scalar::None | Scalar::Unset => DType::None,
            Scalar::Bool(_) => DType::Bool,
            Scalar::Int(_) => DType::Int,
            Scalar::Float(_) => DType::Float,
            Scalar::Str(_) => DType::Str,
            Scalar::Timestamp(_) => DType::Timestamp,
        }
    }

    /// Coerce a value into a column of `dtype`.
    ///
    /// Nulls fit every column; an `Int` is widened into a `Float` column.
    /// Returns `None` when the value does not fit.
    pub fn coerce_to(self, dtype: DType) -> Option<Scalar> {
        match (self, dtype) {
            (v @ (Scalar::None | Scalar::Unset), _) => Some(v),
            (Scalar::Int(i), DType::Float) => Some(Scalar::Float(i as f64)),
            (Scalar::Int(i), DType::Timestamp) => Some(Scalar::Timestamp(i)),
            (v, d) if v.dtype() == d => Some(v),
            _ => None,
        }
    }

    fn kind_rank(&self) -> u8 {
        match self {
            Scalar::None | Scalar::Unset => 0,
            Scalar::Bool(_) => 1,
            Scalar::Int(_) | Scalar::Float(_) => 2,
            Scalar::Str(_) => 3,
            Scalar::Timestamp(_) => 4,
        }
    }

    fn variant_index(&self) -> u8 {
        match self {
            Scalar::None => 0,
            Scalar::Unset => 1,
            Scalar::Bool(_) => 2,
            Scalar::Int(_) => 3,
            Scalar::Float(_) => 4,
            Scalar::Str(_) => 5,
            Scalar::Timestamp(_) => 6,
        }
    }
}

#[inline]
fn canonical_bits(f: f64) -> u64 {
    if f.is_nan() {
        f64::NAN.to_bits()
    } else if f == 0.0 {
        0.0f64.to_bits()
    } else {
        f.to_bits()
    }
}

impl PartialEq for Scalar {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Scalar::None, Scalar::None) | (Scalar::Unset, Scalar::Unset) => true,
            (Scalar::Bool(a), Scalar::Bool(b)) => a == b,
            (Scalar::Int(a), Scalar::Int(b)) => a == b,
            (Scalar::Float(a), Scalar::Float(b)) => canonical_bits(*a) == canonical_bits(*b),
            (Scalar::Str(a), Scalar::Str(b)) => a == b,
            (Scalar::Timestamp(a), Scalar::Timestamp(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Scalar {}

impl Hash for Scalar {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Scalar::None | Scalar::Unset => {}
            Scalar::Bool(b) => b.hash(state),
            Scalar::Int(i) => i.hash(state),
            Scalar::Float(f) => canonical_bits(*f).hash(state),
            Scalar::Str(s) => s.hash(state),
            Scalar::Timestamp(t) => t.hash(state),
        }
    }
}

/// Order used for sorting and min/max: kind rank first, numbers compare
/// across `Int`/`Float`, floats use `total_cmp` on their canonical form.
///
/// `Int(2)` and `Float(2.0)` compare `Equal` here; the [`Ord`] impl breaks
/// that tie by variant so it stays consistent with `Eq`.
pub fn compare_scalars(a: &Scalar, b: &Scalar) -> Ordering {
    let rank = a.kind_rank().cmp(&b.kind_rank());
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Scalar::Bool(x), Scalar::Bool(y)) => x.cmp(y),
        (Scalar::Int(x), Scalar::Int(y)) => x.cmp(y),
        (Scalar::Str(x), Scalar::Str(y)) => x.cmp(y),
        (Scalar::Timestamp(x), Scalar::Timestamp(y)) => x.cmp(y),
        (x, y) => match (x.as_f64(), y.as_f64()) {
            (Some(fx), Some(fy)) => {
                let (fx, fy) = (f64::from_bits(canonical_bits(fx)), f64::from_bits(canonical_bits(fy)));
                fx.total_cmp(&fy)
            }
            _ => Ordering::Equal,
        },
    }
}

impl PartialOrd for Scalar {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scalar {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_scalars(self, other).then_with(|| self.variant_index().cmp(&other.variant_index()))
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::None | Scalar::Unset => f.write_str("null"),
            Scalar::Bool(b) => write!(f, "{}", b),
            Scalar::Int(i) => write!(f, "{}", i),
            Scalar::Float(x) => write!(f, "{}", x),
            Scalar::Str(s) => f.write_str(s),
            Scalar::Timestamp(t) => write!(f, "{}", t),
        }
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Int(v)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Float(v)
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::Str(SmolStr::new(v))
    }
}

impl From<SmolStr> for Scalar {
    fn from(v: SmolStr) -> Self {
        Scalar::Str(v)
    }
}

impl From<serde_json::Value> for Scalar {
    fn from(v: serde_json::Value) -> Self {
        use serde_json::Value;
        match v {
            Value::Null => Scalar::None,
            Value::Bool(b) => Scalar::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Scalar::Int(i),
                None => Scalar::Float(n.as_f64().unwrap_or(0.0)),
            },
            Value::String(s) => Scalar::Str(SmolStr::from(s)),
            // nested values have no column representation
            Value::Array(_) | Value::Object(_) => Scalar::None,
        }
    }
}

#[cfg(test)]
mod scalar_tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(s: &Scalar) -> u64 {
        let mut h = DefaultHasher::new();
        s.hash(&mut h);
        h.finish()
    }

    #[test]
    fn test_null_sentinels() {
        assert!(Scalar::None.is_none());
        assert!(Scalar::Unset.is_none());
        assert!(Scalar::Unset.is_unset());
        assert_eq!(Scalar::Unset.normalized(), Scalar::None);
        assert_eq!(Scalar::Int(3).normalized(), Scalar::Int(3));
        assert_ne!(Scalar::None, Scalar::Unset);
    }

    #[test]
    fn test_float_equality_is_bitwise_with_canonical_nan() {
        assert_eq!(Scalar::Float(f64::NAN), Scalar::Float(f64::NAN));
        assert_eq!(hash_of(&Scalar::Float(f64::NAN)), hash_of(&Scalar::Float(-f64::NAN)));
        assert_eq!(Scalar::Float(0.0), Scalar::Float(-0.0));
        assert_ne!(Scalar::Float(1.0), Scalar::Int(1));
    }

    #[test]
    fn test_ordering_across_kinds() {
        let mut values = vec![
            Scalar::str("b"),
            Scalar::Int(3),
            Scalar::None,
            Scalar::Float(2.5),
            Scalar::Bool(true),
            Scalar::str("a"),
        ];
        values.sort();
        assert_eq!(
            values,
            vec![
                Scalar::None,
                Scalar::Bool(true),
                Scalar::Float(2.5),
                Scalar::Int(3),
                Scalar::str("a"),
                Scalar::str("b"),
            ]
        );
    }

    #[test]
    fn test_ord_agrees_with_eq() {
        assert_eq!(compare_scalars(&Scalar::Int(2), &Scalar::Float(2.0)), Ordering::Equal);
        assert_eq!(Scalar::Int(2).cmp(&Scalar::Float(2.0)), Ordering::Less);
        assert_eq!(Scalar::Float(2.0).cmp(&Scalar::Int(2)), Ordering::Greater);
        assert_eq!(Scalar::None.cmp(&Scalar::Unset), Ordering::Less);
        assert_eq!(Scalar::Float(-0.0).cmp(&Scalar::Float(0.0)), Ordering::Equal);
        assert_eq!(Scalar::Float(f64::NAN).cmp(&Scalar::Float(-f64::NAN)), Ordering::Equal);
        assert!(Scalar::Int(1) < Scalar::Float(1.5));
    }

    #[test]
    fn test_coerce_to_column_types() {
        assert_eq!(Scalar::Int(2).coerce_to(DType::Float), Some(Scalar::Float(2.0)));
        assert_eq!(Scalar::None.coerce_to(DType::Int), Some(Scalar::None));
        assert_eq!(Scalar::Unset.coerce_to(DType::Str), Some(Scalar::Unset));
        assert_eq!(Scalar::str("x").coerce_to(DType::Int), None);
        assert_eq!(Scalar::Float(1.5).coerce_to(DType::Int), None);
    }

    #[test]
    fn test_from_json() {
        assert_eq!(Scalar::from(serde_json::json!(4)), Scalar::Int(4));
        assert_eq!(Scalar::from(serde_json::json!(4.5)), Scalar::Float(4.5));
        assert_eq!(Scalar::from(serde_json::json!("a")), Scalar::str("a"));
        assert_eq!(Scalar::from(serde_json::json!(null)), Scalar::None);
        assert_eq!(Scalar::from(serde_json::json!([1])), Scalar::None);
    }
}
