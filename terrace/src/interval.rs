use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::fmt;

use crate::expr::{self, Expr};

/// A closed integer interval with symbolic endpoints. A `None` endpoint is
/// unbounded on that side.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Interval {
    pub min: Option<Expr>,
    pub max: Option<Expr>,
}

/// Ordered list of intervals, one per storage dimension.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
pub struct Region(pub SmallVec<[Interval; 4]>);

/// Bounds of a stage's loop dimensions, keyed by dimension name.
pub type DimBounds = BTreeMap<String, Interval>;

/// Required region per function, keyed by function name.
pub type RegionMap = BTreeMap<String, Region>;

impl Interval {
    pub fn new(min: Expr, max: Expr) -> Interval {
        Interval {
            min: Some(min),
            max: Some(max),
        }
    }

    pub fn everything() -> Interval {
        Interval {
            min: None,
            max: None,
        }
    }

    pub fn point(e: Expr) -> Interval {
        Interval::new(e.clone(), e)
    }

    pub fn is_bounded(&self) -> bool {
        self.min.is_some() && self.max.is_some()
    }

    /// `max - min + 1`, or `None` when either side is unbounded.
    pub fn extent(&self) -> Option<Expr> {
        match (&self.min, &self.max) {
            (Some(lo), Some(hi)) => Some((hi.clone() - lo.clone() + expr::imm(1)).simplify()),
            _ => None,
        }
    }

    pub fn simplify(&self) -> Interval {
        Interval {
            min: self.min.as_ref().map(Expr::simplify),
            max: self.max.as_ref().map(Expr::simplify),
        }
    }

    /// Intersection: the larger min and the smaller max.
    pub fn intersect(&self, other: &Interval) -> Interval {
        let min = match (&self.min, &other.min) {
            (Some(a), Some(b)) => Some(expr::max(a.clone(), b.clone()).simplify()),
            (Some(a), None) | (None, Some(a)) => Some(a.clone()),
            (None, None) => None,
        };
        let max = match (&self.max, &other.max) {
            (Some(a), Some(b)) => Some(expr::min(a.clone(), b.clone()).simplify()),
            (Some(a), None) | (None, Some(a)) => Some(a.clone()),
            (None, None) => None,
        };
        Interval { min, max }
    }

    /// Union hull: the smaller min and the larger max. An unbounded side on
    /// either operand is unbounded in the result.
    pub fn span(&self, other: &Interval) -> Interval {
        let min = match (&self.min, &other.min) {
            (Some(a), Some(b)) => Some(expr::min(a.clone(), b.clone()).simplify()),
            _ => None,
        };
        let max = match (&self.max, &other.max) {
            (Some(a), Some(b)) => Some(expr::max(a.clone(), b.clone()).simplify()),
            _ => None,
        };
        Interval { min, max }
    }
}

impl Region {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, i: Interval) {
        self.0.push(i);
    }

    pub fn everything(rank: usize) -> Region {
        Region((0..rank).map(|_| Interval::everything()).collect())
    }

    pub fn is_unbounded(&self) -> bool {
        self.0.iter().any(|i| !i.is_bounded())
    }

    /// Componentwise union hull with another region of the same rank.
    pub fn merge(&mut self, other: &Region) {
        debug_assert_eq!(self.len(), other.len());
        for (a, b) in self.0.iter_mut().zip(&other.0) {
            *a = a.span(b);
        }
    }

    /// Number of points in the region, or `None` when any side is unbounded.
    pub fn size(&self) -> Option<Expr> {
        let mut total = expr::imm(1);
        for i in &self.0 {
            total = total * i.extent()?;
        }
        Some(total.simplify())
    }

    pub fn simplify(&mut self) {
        for i in self.0.iter_mut() {
            *i = i.simplify();
        }
    }
}

impl FromIterator<Interval> for Region {
    fn from_iter<T: IntoIterator<Item = Interval>>(iter: T) -> Region {
        Region(iter.into_iter().collect())
    }
}

/// Merge `partial` into `result`, unioning the regions of functions present
/// in both.
pub fn merge_regions(result: &mut RegionMap, partial: &RegionMap) {
    for (func, region) in partial {
        match result.get_mut(func) {
            Some(existing) => existing.merge(region),
            None => {
                result.insert(func.clone(), region.clone());
            }
        }
    }
}

/// Interval bounds of `e` where each variable ranges over its interval in
/// `scope`. Unknown variables are treated as points; calls take their bounds
/// from `value_bounds` when present, otherwise they are unbounded.
pub fn bounds_of_expr_in_scope(
    e: &Expr,
    scope: &DimBounds,
    value_bounds: &BTreeMap<String, Interval>,
) -> Interval {
    match e {
        Expr::Imm(v) => Interval::point(expr::imm(*v)),
        Expr::Var(v) => match scope.get(v) {
            Some(i) => i.clone(),
            None => Interval::point(e.clone()),
        },
        Expr::Call(c) => value_bounds
            .get(&c.callee)
            .cloned()
            .unwrap_or_else(Interval::everything),
        Expr::Add(a, b) => {
            let (a, b) = (
                bounds_of_expr_in_scope(a, scope, value_bounds),
                bounds_of_expr_in_scope(b, scope, value_bounds),
            );
            Interval {
                min: join(&a.min, &b.min, |x, y| x + y),
                max: join(&a.max, &b.max, |x, y| x + y),
            }
        }
        Expr::Sub(a, b) => {
            let (a, b) = (
                bounds_of_expr_in_scope(a, scope, value_bounds),
                bounds_of_expr_in_scope(b, scope, value_bounds),
            );
            Interval {
                min: join(&a.min, &b.max, |x, y| x - y),
                max: join(&a.max, &b.min, |x, y| x - y),
            }
        }
        Expr::Mul(a, b) => {
            let (a, b) = (
                bounds_of_expr_in_scope(a, scope, value_bounds),
                bounds_of_expr_in_scope(b, scope, value_bounds),
            );
            // Only the nonnegative-constant-scale case is needed by index
            // arithmetic; anything else degrades to unbounded.
            scale_interval(&a, &b).or_else(|| scale_interval(&b, &a)).unwrap_or_else(Interval::everything)
        }
        Expr::Div(a, b) => {
            let a = bounds_of_expr_in_scope(a, scope, value_bounds);
            match b.simplify().as_imm() {
                Some(d) if d > 0 => Interval {
                    min: a.min.map(|x| (x / expr::imm(d)).simplify()),
                    max: a.max.map(|x| (x / expr::imm(d)).simplify()),
                },
                _ => Interval::everything(),
            }
        }
        Expr::Min(a, b) => {
            let (a, b) = (
                bounds_of_expr_in_scope(a, scope, value_bounds),
                bounds_of_expr_in_scope(b, scope, value_bounds),
            );
            Interval {
                min: join(&a.min, &b.min, expr::min),
                max: join(&a.max, &b.max, expr::min),
            }
        }
        Expr::Max(a, b) => {
            let (a, b) = (
                bounds_of_expr_in_scope(a, scope, value_bounds),
                bounds_of_expr_in_scope(b, scope, value_bounds),
            );
            Interval {
                min: join(&a.min, &b.min, expr::max),
                max: join(&a.max, &b.max, expr::max),
            }
        }
    }
}

fn join(a: &Option<Expr>, b: &Option<Expr>, op: impl Fn(Expr, Expr) -> Expr) -> Option<Expr> {
    match (a, b) {
        (Some(a), Some(b)) => Some(op(a.clone(), b.clone()).simplify()),
        _ => None,
    }
}

fn scale_interval(range: &Interval, factor: &Interval) -> Option<Interval> {
    let f = factor.min.as_ref()?.as_imm()?;
    if factor.max.as_ref()?.as_imm()? != f || f < 0 {
        return None;
    }
    Some(Interval {
        min: range.min.as_ref().map(|x| (x.clone() * expr::imm(f)).simplify()),
        max: range.max.as_ref().map(|x| (x.clone() * expr::imm(f)).simplify()),
    })
}

/// The regions of every function called inside `e`, with each call argument
/// bounded in `scope`. Nested call arguments contribute their own regions.
pub fn boxes_required(
    e: &Expr,
    scope: &DimBounds,
    value_bounds: &BTreeMap<String, Interval>,
) -> RegionMap {
    let mut regions = RegionMap::new();
    for c in e.calls() {
        let required: Region = c
            .args
            .iter()
            .map(|a| bounds_of_expr_in_scope(a, scope, value_bounds).simplify())
            .collect();
        match regions.get_mut(&c.callee) {
            Some(existing) => existing.merge(&required),
            None => {
                regions.insert(c.callee.clone(), required);
            }
        }
    }
    regions
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = |e: &Option<Expr>| match e {
            Some(e) => e.to_string(),
            None => "*".to_string(),
        };
        write!(f, "[{}, {}]", side(&self.min), side(&self.max))
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, interval) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", interval)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{call, imm, var};
    use proptest::prelude::*;

    fn iv(lo: i64, hi: i64) -> Interval {
        Interval::new(imm(lo), imm(hi))
    }

    #[test]
    fn extent_counts_both_endpoints() {
        assert_eq!(iv(0, 1023).extent(), Some(imm(1024)));
        assert_eq!(Interval::everything().extent(), None);
    }

    #[test]
    fn intersect_narrows_and_span_widens() {
        let a = iv(0, 10);
        let b = iv(5, 20);
        assert_eq!(a.intersect(&b), iv(5, 10));
        assert_eq!(a.span(&b), iv(0, 20));
    }

    #[test]
    fn unbounded_sides_dominate_span() {
        let a = iv(0, 10);
        let open = Interval {
            min: Some(imm(3)),
            max: None,
        };
        let s = a.span(&open);
        assert_eq!(s.min, Some(imm(0)));
        assert_eq!(s.max, None);
    }

    #[test]
    fn region_size_is_product_of_extents() {
        let r: Region = [iv(0, 7), iv(0, 3)].into_iter().collect::<Region>();
        assert_eq!(r.size(), Some(imm(32)));
        let u: Region = [iv(0, 7), Interval::everything()].into_iter().collect::<Region>();
        assert_eq!(u.size(), None);
        assert!(u.is_unbounded());
    }

    #[test]
    fn merge_regions_unions_per_function() {
        let mut a = RegionMap::from([("f".to_string(), [iv(0, 3)].into_iter().collect::<Region>())]);
        let b = RegionMap::from([
            ("f".to_string(), [iv(2, 9)].into_iter().collect::<Region>()),
            ("g".to_string(), [iv(1, 1)].into_iter().collect::<Region>()),
        ]);
        merge_regions(&mut a, &b);
        assert_eq!(a["f"], [iv(0, 9)].into_iter().collect::<Region>());
        assert_eq!(a["g"], [iv(1, 1)].into_iter().collect::<Region>());
    }

    #[test]
    fn bounds_track_shifted_variables() {
        let scope = DimBounds::from([("x".to_string(), iv(0, 9))]);
        let b = bounds_of_expr_in_scope(&(var("x") + imm(1)), &scope, &BTreeMap::new());
        assert_eq!(b, iv(1, 10));
        let b = bounds_of_expr_in_scope(&(var("x") - imm(1)), &scope, &BTreeMap::new());
        assert_eq!(b, iv(-1, 8));
    }

    #[test]
    fn bounds_scale_by_constants() {
        let scope = DimBounds::from([("x".to_string(), iv(0, 9))]);
        let b = bounds_of_expr_in_scope(&(var("x") * imm(2)), &scope, &BTreeMap::new());
        assert_eq!(b, iv(0, 18));
        let b = bounds_of_expr_in_scope(&(var("x") / imm(2)), &scope, &BTreeMap::new());
        assert_eq!(b, iv(0, 4));
    }

    #[test]
    fn call_bounds_come_from_value_estimates() {
        let scope = DimBounds::new();
        let vb = BTreeMap::from([("g".to_string(), iv(0, 255))]);
        let b = bounds_of_expr_in_scope(&call("g", vec![imm(0)]), &scope, &vb);
        assert_eq!(b, iv(0, 255));
        let b = bounds_of_expr_in_scope(&call("h", vec![imm(0)]), &scope, &vb);
        assert!(!b.is_bounded());
    }

    #[test]
    fn boxes_required_covers_stencil_taps() {
        let scope = DimBounds::from([
            ("x".to_string(), iv(0, 63)),
            ("y".to_string(), iv(0, 63)),
        ]);
        let e = call("f", vec![var("x") - imm(1), var("y")])
            + call("f", vec![var("x") + imm(1), var("y")]);
        let boxes = boxes_required(&e, &scope, &BTreeMap::new());
        assert_eq!(boxes["f"], [iv(-1, 64), iv(0, 63)].into_iter().collect::<Region>());
    }

    #[test]
    fn boxes_required_sees_nested_call_arguments() {
        let scope = DimBounds::from([("x".to_string(), iv(0, 7))]);
        let vb = BTreeMap::from([("g".to_string(), iv(0, 15))]);
        let e = call("f", vec![call("g", vec![var("x")])]);
        let boxes = boxes_required(&e, &scope, &vb);
        assert_eq!(boxes["g"], [iv(0, 7)].into_iter().collect::<Region>());
        assert_eq!(boxes["f"], [iv(0, 15)].into_iter().collect::<Region>());
    }

    proptest! {
        #[test]
        fn intersect_is_contained_in_both(
            (al, ah) in (-20i64..20).prop_flat_map(|l| (Just(l), l..21)),
            (bl, bh) in (-20i64..20).prop_flat_map(|l| (Just(l), l..21)),
        ) {
            let (a, b) = (iv(al, ah), iv(bl, bh));
            let i = a.intersect(&b);
            let lo = i.min.unwrap().as_imm().unwrap();
            let hi = i.max.unwrap().as_imm().unwrap();
            prop_assert!(lo >= al && lo >= bl);
            prop_assert!(hi <= ah && hi <= bh);
        }

        #[test]
        fn span_contains_both(
            (al, ah) in (-20i64..20).prop_flat_map(|l| (Just(l), l..21)),
            (bl, bh) in (-20i64..20).prop_flat_map(|l| (Just(l), l..21)),
        ) {
            let (a, b) = (iv(al, ah), iv(bl, bh));
            let s = a.span(&b);
            let lo = s.min.unwrap().as_imm().unwrap();
            let hi = s.max.unwrap().as_imm().unwrap();
            prop_assert!(lo <= al && lo <= bl);
            prop_assert!(hi >= ah && hi >= bh);
        }
    }
}
