/// A clamped half-open range over one axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extent {
    pub start: usize,
    pub end: usize,
}

impl Extent {
    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Clamp signed `[start, end)` into `[0, bound]`. Negative bounds go to 0,
/// bounds past the end go to `bound`, an inverted range becomes empty.
pub fn sanitize(start: i64, end: i64, bound: usize) -> Extent {
    let clamp = |v: i64| -> usize {
        if v <= 0 {
            0
        } else {
            (v as u64).min(bound as u64) as usize
        }
    };
    let start = clamp(start);
    let end = clamp(end).max(start);
    Extent { start, end }
}
