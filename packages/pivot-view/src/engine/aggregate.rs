use super::types::{compare_scalars, DType, FastHashSet, Scalar};
use super::view_config::{AggFunc, AggSpec, RowLayout};
use smallvec::SmallVec;
use smol_str::SmolStr;
use std::cmp::Ordering;

/// An aggregate spec resolved against a view's row layout.
#[derive(Clone, Debug)]
pub struct BoundAgg {
    pub name: SmolStr,
    pub func: AggFunc,
    /// `None` when the source column does not exist; every value reads null.
    pub column: Option<usize>,
    pub source_dtype: DType,
}

impl BoundAgg {
    pub fn bind(spec: &AggSpec, layout: &RowLayout) -> Self {
        let column = layout.resolve(&spec.column);
        Self {
            name: spec.name().clone(),
            func: spec.func,
            column,
            source_dtype: column.map(|c| layout.dtype(c)).unwrap_or(DType::None),
        }
    }

    #[inline]
    pub fn cell<'a>(&self, row: &'a [Scalar]) -> &'a Scalar {
        self.column.and_then(|c| row.get(c)).unwrap_or(&Scalar::None)
    }

    pub fn output_dtype(&self) -> DType {
        match self.func {
            AggFunc::Count | AggFunc::DistinctCount => DType::Int,
            AggFunc::Mean => DType::Float,
            AggFunc::Sum if self.source_dtype == DType::Int => DType::Int,
            AggFunc::Sum => DType::Float,
            AggFunc::Min | AggFunc::Max | AggFunc::Unique => self.source_dtype,
        }
    }
}

/// Exact running sum of floats.
///
/// The sum is held as non-overlapping partials so adding and retracting are
/// both exact, and [`ExactSum::value`] is the correctly rounded total whatever
/// the order the values arrived in. Non-finite values are counted apart.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExactSum {
    partials: SmallVec<[f64; 4]>,
    pos_inf: i64,
    neg_inf: i64,
    nan: i64,
}

impl ExactSum {
    pub fn add(&mut self, x: f64) {
        self.accumulate(x, 1);
    }

    pub fn retract(&mut self, x: f64) {
        self.accumulate(-x, -1);
    }

    fn accumulate(&mut self, mut x: f64, sign: i64) {
        if x.is_nan() {
            self.nan += sign;
            return;
        }
        if x.is_infinite() {
            // `x` is already negated on retract
            if (x > 0.0) == (sign > 0) {
                self.pos_inf += sign;
            } else {
                self.neg_inf += sign;
            }
            return;
        }
        let mut kept = 0;
        for j in 0..self.partials.len() {
            let mut y = self.partials[j];
            if x.abs() < y.abs() {
                std::mem::swap(&mut x, &mut y);
            }
            let hi = x + y;
            let lo = y - (hi - x);
            if lo != 0.0 {
                self.partials[kept] = lo;
                kept += 1;
            }
            x = hi;
        }
        self.partials.truncate(kept);
        self.partials.push(x);
    }

    pub fn value(&self) -> f64 {
        if self.nan > 0 || (self.pos_inf > 0 && self.neg_inf > 0) {
            return f64::NAN;
        }
        if self.pos_inf > 0 {
            return f64::INFINITY;
        }
        if self.neg_inf > 0 {
            return f64::NEG_INFINITY;
        }
        let p = &self.partials;
        let Some(mut n) = p.len().checked_sub(1) else {
            return 0.0;
        };
        let mut hi = p[n];
        let mut lo = 0.0;
        while n > 0 {
            let x = hi;
            n -= 1;
            let y = p[n];
            hi = x + y;
            lo = y - (hi - x);
            if lo != 0.0 {
                break;
            }
        }
        // half-way case: round using the sign of the next partial
        if n > 0 && ((lo < 0.0 && p[n - 1] < 0.0) || (lo > 0.0 && p[n - 1] > 0.0)) {
            let y = lo * 2.0;
            let x = hi + y;
            if y == x - hi {
                hi = x;
            }
        }
        // normalise -0.0
        if hi == 0.0 {
            0.0
        } else {
            hi
        }
    }
}

/// Running state of one aggregate over one group.
///
/// Sum/Count/Mean update in O(1) both ways. Min/Max update in O(1) on add and
/// go dirty when the current extreme is retracted. DistinctCount and Unique go
/// dirty on every change and are rebuilt by [`AggCell::rescan`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AggCell {
    count: i64,
    numeric: i64,
    isum: i64,
    fsum: ExactSum,
    extreme: Scalar,
    derived: Scalar,
    dirty: bool,
}

impl AggCell {
    pub fn add(&mut self, func: AggFunc, value: &Scalar) {
        if value.is_none() {
            return;
        }
        self.count += 1;
        self.accumulate(value, 1);
        match func {
            AggFunc::Min | AggFunc::Max => {
                if self.extreme.is_none() || beats(func, value, &self.extreme) {
                    self.extreme = value.clone();
                }
            }
            AggFunc::DistinctCount | AggFunc::Unique => self.dirty = true,
            _ => {}
        }
    }

    pub fn retract(&mut self, func: AggFunc, value: &Scalar) {
        if value.is_none() {
            return;
        }
        self.count -= 1;
        self.accumulate(value, -1);
        match func {
            AggFunc::Min | AggFunc::Max => {
                if compare_scalars(value, &self.extreme) == Ordering::Equal {
                    self.dirty = true;
                }
            }
            AggFunc::DistinctCount | AggFunc::Unique => self.dirty = true,
            _ => {}
        }
    }

    fn accumulate(&mut self, value: &Scalar, sign: i64) {
        match value {
            Scalar::Int(i) => {
                self.numeric += sign;
                self.isum = self.isum.wrapping_add(i.wrapping_mul(sign));
                self.exact(*i as f64, sign);
            }
            Scalar::Float(f) => {
                self.numeric += sign;
                self.exact(*f, sign);
            }
            _ => {}
        }
    }

    fn exact(&mut self, f: f64, sign: i64) {
        if sign > 0 {
            self.fsum.add(f);
        } else {
            self.fsum.retract(f);
        }
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Rebuild from the full set of values currently in the group.
    pub fn rescan<'a, I>(&mut self, func: AggFunc, values: I)
    where
        I: IntoIterator<Item = &'a Scalar>,
    {
        *self = AggCell::default();
        let mut distinct: FastHashSet<&Scalar> = FastHashSet::default();
        let mut saw_null = false;
        for v in values {
            if v.is_none() {
                saw_null = true;
                continue;
            }
            self.add(func, v);
            if matches!(func, AggFunc::DistinctCount | AggFunc::Unique) {
                distinct.insert(v);
            }
        }
        self.derived = match func {
            AggFunc::DistinctCount => Scalar::Int(distinct.len() as i64),
            AggFunc::Unique if distinct.len() == 1 && !saw_null => {
                distinct.into_iter().next().cloned().unwrap_or_default()
            }
            _ => Scalar::None,
        };
        self.dirty = false;
    }

    pub fn value(&self, agg: &BoundAgg) -> Scalar {
        match agg.func {
            AggFunc::Count => Scalar::Int(self.count),
            AggFunc::Sum if self.numeric == 0 => Scalar::None,
            AggFunc::Sum if agg.source_dtype == DType::Int => Scalar::Int(self.isum),
            AggFunc::Sum => Scalar::Float(self.fsum.value()),
            AggFunc::Mean if self.numeric == 0 => Scalar::None,
            AggFunc::Mean => Scalar::Float(self.fsum.value() / self.numeric as f64),
            AggFunc::Min | AggFunc::Max => self.extreme.clone(),
            AggFunc::DistinctCount | AggFunc::Unique => self.derived.clone(),
        }
    }
}

fn beats(func: AggFunc, candidate: &Scalar, current: &Scalar) -> bool {
    let ord = compare_scalars(candidate, current);
    match func {
        AggFunc::Min => ord == Ordering::Less,
        _ => ord == Ordering::Greater,
    }
}

#[cfg(test)]
mod aggregate_tests {
    use super::*;

    fn agg(func: AggFunc, dtype: DType) -> BoundAgg {
        BoundAgg {
            name: "x".into(),
            func,
            column: Some(0),
            source_dtype: dtype,
        }
    }

    #[test]
    fn test_sum_count_mean_are_reversible() {
        let mut cell = AggCell::default();
        for v in [1, 2, 3] {
            cell.add(AggFunc::Sum, &Scalar::Int(v));
        }
        cell.add(AggFunc::Sum, &Scalar::None);
        cell.retract(AggFunc::Sum, &Scalar::Int(2));
        assert_eq!(cell.value(&agg(AggFunc::Sum, DType::Int)), Scalar::Int(4));
        assert_eq!(cell.value(&agg(AggFunc::Count, DType::Int)), Scalar::Int(2));
        assert_eq!(cell.value(&agg(AggFunc::Mean, DType::Int)), Scalar::Float(2.0));
        assert!(!cell.is_dirty());
    }

    #[test]
    fn test_min_goes_dirty_only_when_extreme_leaves() {
        let mut cell = AggCell::default();
        for v in [5, 3, 9] {
            cell.add(AggFunc::Min, &Scalar::Int(v));
        }
        assert_eq!(cell.value(&agg(AggFunc::Min, DType::Int)), Scalar::Int(3));
        cell.retract(AggFunc::Min, &Scalar::Int(9));
        assert!(!cell.is_dirty());
        cell.retract(AggFunc::Min, &Scalar::Int(3));
        assert!(cell.is_dirty());
        cell.rescan(AggFunc::Min, &[Scalar::Int(5)]);
        assert_eq!(cell.value(&agg(AggFunc::Min, DType::Int)), Scalar::Int(5));
        assert!(!cell.is_dirty());
    }

    #[test]
    fn test_max_tracks_new_extremes() {
        let mut cell = AggCell::default();
        cell.add(AggFunc::Max, &Scalar::str("b"));
        cell.add(AggFunc::Max, &Scalar::str("d"));
        cell.add(AggFunc::Max, &Scalar::str("a"));
        assert_eq!(cell.value(&agg(AggFunc::Max, DType::Str)), Scalar::str("d"));
    }

    #[test]
    fn test_distinct_and_unique_rescan() {
        let values = [Scalar::str("a"), Scalar::str("b"), Scalar::str("a")];
        let mut cell = AggCell::default();
        cell.add(AggFunc::DistinctCount, &values[0]);
        assert!(cell.is_dirty());
        cell.rescan(AggFunc::DistinctCount, &values);
        assert_eq!(cell.value(&agg(AggFunc::DistinctCount, DType::Str)), Scalar::Int(2));

        let mut unique = AggCell::default();
        unique.rescan(AggFunc::Unique, &[Scalar::Int(4), Scalar::Int(4)]);
        assert_eq!(unique.value(&agg(AggFunc::Unique, DType::Int)), Scalar::Int(4));
        unique.rescan(AggFunc::Unique, &[Scalar::Int(4), Scalar::Int(5)]);
        assert_eq!(unique.value(&agg(AggFunc::Unique, DType::Int)), Scalar::None);
    }

    #[test]
    fn test_float_sum_survives_retracting_a_large_value() {
        let mut cell = AggCell::default();
        cell.add(AggFunc::Sum, &Scalar::Float(1e16));
        cell.add(AggFunc::Sum, &Scalar::Float(1.0));
        cell.retract(AggFunc::Sum, &Scalar::Float(1e16));
        assert_eq!(cell.value(&agg(AggFunc::Sum, DType::Float)), Scalar::Float(1.0));
        assert_eq!(cell.value(&agg(AggFunc::Mean, DType::Float)), Scalar::Float(1.0));
    }

    #[test]
    fn test_float_sum_is_independent_of_arrival_order() {
        let (mut fwd, mut rev) = (AggCell::default(), AggCell::default());
        for v in [0.1, 0.2, 0.3] {
            fwd.add(AggFunc::Sum, &Scalar::Float(v));
        }
        for v in [0.3, 0.2, 0.1] {
            rev.add(AggFunc::Sum, &Scalar::Float(v));
        }
        let sum = agg(AggFunc::Sum, DType::Float);
        assert_eq!(fwd.value(&sum), rev.value(&sum));
        assert_eq!(fwd.value(&sum), Scalar::Float(0.6));
    }

    #[test]
    fn test_exact_sum_non_finite_values_retract() {
        let mut sum = ExactSum::default();
        sum.add(2.5);
        sum.add(f64::INFINITY);
        assert_eq!(sum.value(), f64::INFINITY);
        sum.add(f64::NEG_INFINITY);
        assert!(sum.value().is_nan());
        sum.retract(f64::INFINITY);
        sum.retract(f64::NEG_INFINITY);
        assert_eq!(sum.value(), 2.5);
        sum.retract(2.5);
        assert_eq!(sum.value(), 0.0);
    }

    #[test]
    fn test_empty_numeric_aggregates_are_null() {
        let cell = AggCell::default();
        assert_eq!(cell.value(&agg(AggFunc::Sum, DType::Float)), Scalar::None);
        assert_eq!(cell.value(&agg(AggFunc::Mean, DType::Float)), Scalar::None);
        assert_eq!(cell.value(&agg(AggFunc::Count, DType::Float)), Scalar::Int(0));
    }
}
