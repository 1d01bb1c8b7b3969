//! Aggregation expression algebra
//!
//! An [`Expr`] folds point values into a fixed-width binary state, merges
//! two states, and decodes a state back into a float plus a presence flag.
//! States live inside sequence buckets, so every expression declares its
//! encoded width up front.
//!
//! The algebra's fundamental law: `update` followed by `merge` is
//! associative and commutative over disjoint point sets, so a bucket can be
//! re-aggregated across partitions in any order without changing the value
//! `get` decodes.

use crate::encoding::ByteMap;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Named values a point carries into an update
pub trait Params {
    /// Returns the named value, or `None` when the point doesn't carry it
    fn get(&self, name: &str) -> Option<f64>;
}

impl Params for ByteMap {
    fn get(&self, name: &str) -> Option<f64> {
        self.get_float(name)
    }
}

impl Params for HashMap<String, f64> {
    fn get(&self, name: &str) -> Option<f64> {
        self.get(name).copied()
    }
}

/// Merges a subexpression's encoded state into a composite's state
pub type SubMerger = Box<dyn Fn(&mut [u8], &[u8], Option<&ByteMap>) + Send + Sync>;

/// Binary arithmetic operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    fn apply(&self, l: f64, r: f64) -> (f64, bool) {
        match self {
            BinaryOp::Add => (l + r, true),
            BinaryOp::Sub => (l - r, true),
            BinaryOp::Mul => (l * r, true),
            BinaryOp::Div => {
                if r == 0.0 {
                    (0.0, false)
                } else {
                    (l / r, true)
                }
            }
        }
    }
}

/// Predicate over a point's dimensions, gating conditional updates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cond {
    /// The dimension is present
    Present { dim: String },
    /// The dimension equals the given string value
    Equals { dim: String, value: String },
}

impl Cond {
    /// Evaluate against a point's dimensions
    pub fn eval(&self, dims: Option<&ByteMap>) -> bool {
        let Some(dims) = dims else { return false };
        match self {
            Cond::Present { dim } => dims.get(dim).is_some(),
            Cond::Equals { dim, value } => dims.get(dim) == Some(value.as_bytes()),
        }
    }
}

/// An aggregation expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Expr {
    /// A constant value; zero-width
    Const(f64),
    /// A named point value; zero-width
    Field(String),
    /// Running sum of the wrapped value
    Sum(Box<Expr>),
    /// Count of points carrying the wrapped value
    Count(Box<Expr>),
    /// Mean of the wrapped value; carries numerator and denominator
    Avg(Box<Expr>),
    /// Minimum observed value
    Min(Box<Expr>),
    /// Maximum observed value
    Max(Box<Expr>),
    /// Clamps the wrapped expression's output to `[min, max]`
    Bounded {
        expr: Box<Expr>,
        min: f64,
        max: f64,
    },
    /// Applies the wrapped expression only when the condition holds
    If { cond: Cond, expr: Box<Expr> },
    /// Arithmetic over two expressions
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

/// Width of a flagged aggregate state: 1 presence byte + 8 value bytes
const AGG_WIDTH: usize = 9;

impl Expr {
    /// Convenience constructors mirroring the common aggregations
    pub fn field(name: impl Into<String>) -> Expr {
        Expr::Field(name.into())
    }

    pub fn sum(inner: Expr) -> Expr {
        Expr::Sum(Box::new(inner))
    }

    pub fn count(inner: Expr) -> Expr {
        Expr::Count(Box::new(inner))
    }

    pub fn avg(inner: Expr) -> Expr {
        Expr::Avg(Box::new(inner))
    }

    pub fn min(inner: Expr) -> Expr {
        Expr::Min(Box::new(inner))
    }

    pub fn max(inner: Expr) -> Expr {
        Expr::Max(Box::new(inner))
    }

    /// Bytes of state this expression stores per bucket
    pub fn encoded_width(&self) -> usize {
        match self {
            Expr::Const(_) | Expr::Field(_) => 0,
            Expr::Sum(_) | Expr::Min(_) | Expr::Max(_) => AGG_WIDTH,
            Expr::Count(_) => 8,
            Expr::Avg(_) => 16,
            Expr::Bounded { expr, .. } | Expr::If { expr, .. } => expr.encoded_width(),
            Expr::Binary { left, right, .. } => left.encoded_width() + right.encoded_width(),
        }
    }

    /// Make sure this expression is well-formed
    pub fn validate(&self) -> Result<()> {
        match self {
            Expr::Const(_) | Expr::Field(_) => Ok(()),
            Expr::Sum(inner)
            | Expr::Count(inner)
            | Expr::Avg(inner)
            | Expr::Min(inner)
            | Expr::Max(inner) => {
                inner.validate()?;
                if !inner.is_direct() {
                    return Err(Error::InvalidExpression(format!(
                        "aggregate over stateful expression: {}",
                        inner
                    )));
                }
                Ok(())
            }
            Expr::Bounded { expr, min, max } => {
                if min > max {
                    return Err(Error::InvalidExpression(format!(
                        "bounded range inverted: {} > {}",
                        min, max
                    )));
                }
                expr.validate()
            }
            Expr::If { expr, .. } => expr.validate(),
            Expr::Binary { left, right, .. } => {
                left.validate()?;
                right.validate()
            }
        }
    }

    /// Whether this expression evaluates directly from params with no state
    pub fn is_direct(&self) -> bool {
        match self {
            Expr::Const(_) | Expr::Field(_) => true,
            Expr::Bounded { expr, .. } | Expr::If { expr, .. } => expr.is_direct(),
            Expr::Binary { left, right, .. } => left.is_direct() && right.is_direct(),
            _ => false,
        }
    }

    /// Evaluate a direct expression against params without touching state
    fn direct_value(&self, params: &dyn Params, metadata: Option<&ByteMap>) -> Option<f64> {
        match self {
            Expr::Const(v) => Some(*v),
            Expr::Field(name) => params.get(name),
            Expr::Bounded { expr, min, max } => expr
                .direct_value(params, metadata)
                .map(|v| v.clamp(*min, *max)),
            Expr::If { cond, expr } => {
                if cond.eval(metadata) {
                    expr.direct_value(params, metadata)
                } else {
                    None
                }
            }
            Expr::Binary { op, left, right } => {
                let l = left.direct_value(params, metadata)?;
                let r = right.direct_value(params, metadata)?;
                let (v, ok) = op.apply(l, r);
                ok.then_some(v)
            }
            _ => None,
        }
    }

    /// Fold one point into `state`
    ///
    /// Returns the number of state bytes consumed, the expression's value
    /// after the fold, and whether the point contributed.
    pub fn update(
        &self,
        state: &mut [u8],
        params: &dyn Params,
        metadata: Option<&ByteMap>,
    ) -> (usize, f64, bool) {
        match self {
            Expr::Const(v) => (0, *v, false),
            Expr::Field(name) => match params.get(name) {
                Some(v) => (0, v, true),
                None => (0, 0.0, false),
            },
            Expr::Sum(inner) => match inner.direct_value(params, metadata) {
                Some(v) => {
                    let (set, cur) = read_flagged(state);
                    let next = if set { cur + v } else { v };
                    write_flagged(state, true, next);
                    (AGG_WIDTH, next, true)
                }
                None => (AGG_WIDTH, read_flagged(state).1, false),
            },
            Expr::Count(inner) => match inner.direct_value(params, metadata) {
                Some(_) => {
                    let next = read_count(state) + 1;
                    write_count(state, next);
                    (8, next as f64, true)
                }
                None => (8, read_count(state) as f64, false),
            },
            Expr::Avg(inner) => match inner.direct_value(params, metadata) {
                Some(v) => {
                    let (num, den) = read_pair(state);
                    write_pair(state, num + v, den + 1.0);
                    (16, (num + v) / (den + 1.0), true)
                }
                None => {
                    let (num, den) = read_pair(state);
                    let value = if den == 0.0 { 0.0 } else { num / den };
                    (16, value, false)
                }
            },
            Expr::Min(inner) => match inner.direct_value(params, metadata) {
                Some(v) => {
                    let (set, cur) = read_flagged(state);
                    let next = if set { cur.min(v) } else { v };
                    write_flagged(state, true, next);
                    (AGG_WIDTH, next, true)
                }
                None => (AGG_WIDTH, read_flagged(state).1, false),
            },
            Expr::Max(inner) => match inner.direct_value(params, metadata) {
                Some(v) => {
                    let (set, cur) = read_flagged(state);
                    let next = if set { cur.max(v) } else { v };
                    write_flagged(state, true, next);
                    (AGG_WIDTH, next, true)
                }
                None => (AGG_WIDTH, read_flagged(state).1, false),
            },
            Expr::Bounded { expr, min, max } => {
                let (consumed, value, updated) = expr.update(state, params, metadata);
                (consumed, value.clamp(*min, *max), updated)
            }
            Expr::If { cond, expr } => {
                let width = expr.encoded_width();
                if cond.eval(metadata) {
                    expr.update(state, params, metadata)
                } else {
                    let (value, _, _) = expr.get(state);
                    (width, value, false)
                }
            }
            Expr::Binary { op, left, right } => {
                let lw = left.encoded_width();
                let (lstate, rstate) = state.split_at_mut(lw);
                let (_, lv, lup) = left.update(lstate, params, metadata);
                let (_, rv, rup) = right.update(rstate, params, metadata);
                let (value, _) = op.apply(lv, rv);
                (lw + right.encoded_width(), value, lup || rup)
            }
        }
    }

    /// Combine encoded states `x` and `y` into `dst`
    ///
    /// Missing (empty) inputs are treated as unset states. Returns the
    /// bytes consumed from `dst`, `x`, and `y`.
    pub fn merge(&self, dst: &mut [u8], x: &[u8], y: &[u8]) -> (usize, usize, usize) {
        let width = self.encoded_width();
        match self {
            Expr::Const(_) | Expr::Field(_) => (0, 0, 0),
            Expr::Sum(_) => {
                let (xs, xv) = read_flagged_opt(x);
                let (ys, yv) = read_flagged_opt(y);
                let (set, v) = match (xs, ys) {
                    (true, true) => (true, xv + yv),
                    (true, false) => (true, xv),
                    (false, true) => (true, yv),
                    (false, false) => (false, 0.0),
                };
                write_flagged(dst, set, v);
                (width, x.len().min(width), y.len().min(width))
            }
            Expr::Count(_) => {
                let v = read_count_opt(x) + read_count_opt(y);
                write_count(dst, v);
                (width, x.len().min(width), y.len().min(width))
            }
            Expr::Avg(_) => {
                let (xn, xd) = read_pair_opt(x);
                let (yn, yd) = read_pair_opt(y);
                write_pair(dst, xn + yn, xd + yd);
                (width, x.len().min(width), y.len().min(width))
            }
            Expr::Min(_) => {
                let (xs, xv) = read_flagged_opt(x);
                let (ys, yv) = read_flagged_opt(y);
                let (set, v) = match (xs, ys) {
                    (true, true) => (true, xv.min(yv)),
                    (true, false) => (true, xv),
                    (false, true) => (true, yv),
                    (false, false) => (false, 0.0),
                };
                write_flagged(dst, set, v);
                (width, x.len().min(width), y.len().min(width))
            }
            Expr::Max(_) => {
                let (xs, xv) = read_flagged_opt(x);
                let (ys, yv) = read_flagged_opt(y);
                let (set, v) = match (xs, ys) {
                    (true, true) => (true, xv.max(yv)),
                    (true, false) => (true, xv),
                    (false, true) => (true, yv),
                    (false, false) => (false, 0.0),
                };
                write_flagged(dst, set, v);
                (width, x.len().min(width), y.len().min(width))
            }
            Expr::Bounded { expr, .. } | Expr::If { expr, .. } => expr.merge(dst, x, y),
            Expr::Binary { left, right, .. } => {
                let lw = left.encoded_width();
                let (ldst, rdst) = dst.split_at_mut(lw.min(dst.len()));
                let (_, lx, ly) = left.merge(ldst, x, y);
                let (_, rx, ry) = right.merge(rdst, &x[lx..], &y[ly..]);
                (width, lx + rx, ly + ry)
            }
        }
    }

    /// Decode a state into `(value, set, consumed)`
    pub fn get(&self, state: &[u8]) -> (f64, bool, usize) {
        match self {
            Expr::Const(v) => (*v, true, 0),
            Expr::Field(_) => (0.0, false, 0),
            Expr::Sum(_) | Expr::Min(_) | Expr::Max(_) => {
                let (set, v) = read_flagged_opt(state);
                (v, set, AGG_WIDTH.min(state.len()))
            }
            Expr::Count(_) => {
                let v = read_count_opt(state);
                (v as f64, v > 0, 8.min(state.len()))
            }
            Expr::Avg(_) => {
                let (num, den) = read_pair_opt(state);
                if den == 0.0 {
                    (0.0, false, 16.min(state.len()))
                } else {
                    (num / den, true, 16.min(state.len()))
                }
            }
            Expr::Bounded { expr, min, max } => {
                let (v, set, consumed) = expr.get(state);
                (v.clamp(*min, *max), set, consumed)
            }
            Expr::If { expr, .. } => expr.get(state),
            Expr::Binary { op, left, right } => {
                let (lv, lset, lc) = left.get(state);
                let (rv, rset, rc) = right.get(&state[lc..]);
                let (v, ok) = op.apply(lv, rv);
                (v, ok && (lset || rset), lc + rc)
            }
        }
    }

    /// Per-subexpression mergers folding partial states into this one
    ///
    /// The returned list is the same length as `subs`; a slot is `None`
    /// when the subexpression is not represented in this expression.
    pub fn sub_mergers(&self, subs: &[Expr]) -> Vec<Option<SubMerger>> {
        subs.iter().map(|sub| self.sub_merger_for(sub)).collect()
    }

    fn sub_merger_for(&self, sub: &Expr) -> Option<SubMerger> {
        if sub == self {
            let e = self.clone();
            let width = e.encoded_width();
            return Some(Box::new(move |data, other, _md| {
                let mut merged = vec![0u8; width];
                e.merge(&mut merged, data, other);
                data[..width].copy_from_slice(&merged);
            }));
        }
        if let Expr::Avg(inner) = self {
            // Partial sums credit the numerator, partial counts the
            // denominator
            match sub {
                Expr::Sum(sub_inner) if sub_inner == inner => {
                    return Some(Box::new(|data, other, _md| {
                        let (set, v) = read_flagged_opt(other);
                        if set {
                            let (num, den) = read_pair(data);
                            write_pair(data, num + v, den);
                        }
                    }));
                }
                Expr::Count(_) => {
                    return Some(Box::new(|data, other, _md| {
                        let n = read_count_opt(other);
                        let (num, den) = read_pair(data);
                        write_pair(data, num, den + n as f64);
                    }));
                }
                _ => {}
            }
        }
        None
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Const(v) => write!(f, "{}", v),
            Expr::Field(name) => write!(f, "{}", name),
            Expr::Sum(e) => write!(f, "SUM({})", e),
            Expr::Count(e) => write!(f, "COUNT({})", e),
            Expr::Avg(e) => write!(f, "AVG({})", e),
            Expr::Min(e) => write!(f, "MIN({})", e),
            Expr::Max(e) => write!(f, "MAX({})", e),
            Expr::Bounded { expr, min, max } => write!(f, "BOUNDED({}, {}, {})", expr, min, max),
            Expr::If { cond, expr } => write!(f, "IF({:?}, {})", cond, expr),
            Expr::Binary { op, left, right } => {
                let sym = match op {
                    BinaryOp::Add => "+",
                    BinaryOp::Sub => "-",
                    BinaryOp::Mul => "*",
                    BinaryOp::Div => "/",
                };
                write!(f, "({} {} {})", left, sym, right)
            }
        }
    }
}

fn read_flagged(b: &[u8]) -> (bool, f64) {
    (
        b[0] != 0,
        f64::from_be_bytes(b[1..9].try_into().unwrap()),
    )
}

fn read_flagged_opt(b: &[u8]) -> (bool, f64) {
    if b.len() < AGG_WIDTH {
        (false, 0.0)
    } else {
        read_flagged(b)
    }
}

fn write_flagged(b: &mut [u8], set: bool, v: f64) {
    b[0] = set as u8;
    b[1..9].copy_from_slice(&v.to_be_bytes());
}

fn read_count(b: &[u8]) -> u64 {
    u64::from_be_bytes(b[..8].try_into().unwrap())
}

fn read_count_opt(b: &[u8]) -> u64 {
    if b.len() < 8 {
        0
    } else {
        read_count(b)
    }
}

fn write_count(b: &mut [u8], v: u64) {
    b[..8].copy_from_slice(&v.to_be_bytes());
}

fn read_pair(b: &[u8]) -> (f64, f64) {
    (
        f64::from_be_bytes(b[..8].try_into().unwrap()),
        f64::from_be_bytes(b[8..16].try_into().unwrap()),
    )
}

fn read_pair_opt(b: &[u8]) -> (f64, f64) {
    if b.len() < 16 {
        (0.0, 0.0)
    } else {
        read_pair(b)
    }
}

fn write_pair(b: &mut [u8], num: f64, den: f64) {
    b[..8].copy_from_slice(&num.to_be_bytes());
    b[8..16].copy_from_slice(&den.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(entries: &[(&str, f64)]) -> HashMap<String, f64> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }

    #[test]
    fn test_sum_update() {
        let e = Expr::sum(Expr::field("v"));
        let mut state = vec![0u8; e.encoded_width()];

        e.update(&mut state, &params(&[("v", 3.0)]), None);
        e.update(&mut state, &params(&[("v", 3.0)]), None);
        e.update(&mut state, &params(&[("v", 7.0)]), None);

        let (value, set, _) = e.get(&state);
        assert!(set);
        assert_eq!(value, 13.0);
    }

    #[test]
    fn test_sum_ignores_missing_param() {
        let e = Expr::sum(Expr::field("v"));
        let mut state = vec![0u8; e.encoded_width()];

        let (_, _, updated) = e.update(&mut state, &params(&[("other", 1.0)]), None);
        assert!(!updated);
        let (_, set, _) = e.get(&state);
        assert!(!set);
    }

    #[test]
    fn test_count_and_min_max() {
        let count = Expr::count(Expr::field("v"));
        let min = Expr::min(Expr::field("v"));
        let max = Expr::max(Expr::field("v"));
        let mut cs = vec![0u8; count.encoded_width()];
        let mut mins = vec![0u8; min.encoded_width()];
        let mut maxs = vec![0u8; max.encoded_width()];

        for v in [5.0, 2.0, 8.0] {
            let p = params(&[("v", v)]);
            count.update(&mut cs, &p, None);
            min.update(&mut mins, &p, None);
            max.update(&mut maxs, &p, None);
        }

        assert_eq!(count.get(&cs).0, 3.0);
        assert_eq!(min.get(&mins).0, 2.0);
        assert_eq!(max.get(&maxs).0, 8.0);
    }

    #[test]
    fn test_avg_update_and_get() {
        let e = Expr::avg(Expr::field("v"));
        let mut state = vec![0u8; e.encoded_width()];

        // Empty average is unset, not a division by zero
        let (_, set, _) = e.get(&state);
        assert!(!set);

        e.update(&mut state, &params(&[("v", 2.0)]), None);
        e.update(&mut state, &params(&[("v", 4.0)]), None);
        let (value, set, _) = e.get(&state);
        assert!(set);
        assert_eq!(value, 3.0);
    }

    #[test]
    fn test_avg_sub_mergers() {
        let avg = Expr::avg(Expr::field("v"));
        let sum = Expr::sum(Expr::field("v"));
        let count = Expr::count(Expr::field("v"));

        let mergers = avg.sub_mergers(&[sum.clone(), count.clone(), Expr::field("x")]);
        assert!(mergers[0].is_some());
        assert!(mergers[1].is_some());
        assert!(mergers[2].is_none());

        // Fold a partial sum of 14.0 and a partial count of 4 into an
        // empty average
        let mut avg_state = vec![0u8; avg.encoded_width()];
        let mut sum_state = vec![0u8; sum.encoded_width()];
        let mut count_state = vec![0u8; count.encoded_width()];
        for v in [6.0, 8.0] {
            sum.update(&mut sum_state, &params(&[("v", v)]), None);
        }
        for _ in 0..4 {
            count.update(&mut count_state, &params(&[("v", 0.0)]), None);
        }

        mergers[0].as_ref().unwrap()(&mut avg_state, &sum_state, None);
        mergers[1].as_ref().unwrap()(&mut avg_state, &count_state, None);

        let (value, set, _) = avg.get(&avg_state);
        assert!(set);
        assert_eq!(value, 3.5);
    }

    #[test]
    fn test_merge_associative_and_commutative() {
        for e in [
            Expr::sum(Expr::field("v")),
            Expr::count(Expr::field("v")),
            Expr::avg(Expr::field("v")),
            Expr::min(Expr::field("v")),
            Expr::max(Expr::field("v")),
        ] {
            let w = e.encoded_width();
            let mk = |vals: &[f64]| {
                let mut s = vec![0u8; w];
                for v in vals {
                    e.update(&mut s, &params(&[("v", *v)]), None);
                }
                s
            };
            let a = mk(&[1.0, 2.0]);
            let b = mk(&[10.0]);
            let c = mk(&[5.0, 5.0, 5.0]);

            let merge2 = |x: &[u8], y: &[u8]| {
                let mut d = vec![0u8; w];
                e.merge(&mut d, x, y);
                d
            };

            let ab_c = merge2(&merge2(&a, &b), &c);
            let a_bc = merge2(&a, &merge2(&b, &c));
            assert_eq!(ab_c, a_bc, "associativity for {}", e);

            let ba = merge2(&b, &a);
            let ab = merge2(&a, &b);
            assert_eq!(ab.len(), ba.len());
            assert_eq!(e.get(&ab).0, e.get(&ba).0, "commutativity for {}", e);
        }
    }

    #[test]
    fn test_merge_with_empty_side() {
        let e = Expr::sum(Expr::field("v"));
        let mut a = vec![0u8; e.encoded_width()];
        e.update(&mut a, &params(&[("v", 4.0)]), None);

        let mut dst = vec![0u8; e.encoded_width()];
        e.merge(&mut dst, &a, &[]);
        assert_eq!(e.get(&dst).0, 4.0);

        let mut dst = vec![0u8; e.encoded_width()];
        e.merge(&mut dst, &[], &a);
        assert_eq!(e.get(&dst).0, 4.0);
    }

    #[test]
    fn test_bounded_clamps() {
        let e = Expr::Bounded {
            expr: Box::new(Expr::sum(Expr::field("v"))),
            min: 0.0,
            max: 10.0,
        };
        let mut state = vec![0u8; e.encoded_width()];
        e.update(&mut state, &params(&[("v", 25.0)]), None);
        let (value, set, _) = e.get(&state);
        assert!(set);
        assert_eq!(value, 10.0);
    }

    #[test]
    fn test_if_gates_on_dims() {
        let e = Expr::If {
            cond: Cond::Equals {
                dim: "status".to_string(),
                value: "error".to_string(),
            },
            expr: Box::new(Expr::count(Expr::Const(1.0))),
        };
        let mut state = vec![0u8; e.encoded_width()];

        let error_dims = ByteMap::of_strings([("status", "error")]);
        let ok_dims = ByteMap::of_strings([("status", "ok")]);

        e.update(&mut state, &params(&[]), Some(&error_dims));
        e.update(&mut state, &params(&[]), Some(&ok_dims));
        e.update(&mut state, &params(&[]), Some(&error_dims));

        assert_eq!(e.get(&state).0, 2.0);
    }

    #[test]
    fn test_binary_over_aggregates() {
        // error rate = SUM(errors) / SUM(requests)
        let e = Expr::Binary {
            op: BinaryOp::Div,
            left: Box::new(Expr::sum(Expr::field("errors"))),
            right: Box::new(Expr::sum(Expr::field("requests"))),
        };
        assert_eq!(e.encoded_width(), 18);

        let mut state = vec![0u8; e.encoded_width()];
        e.update(
            &mut state,
            &params(&[("errors", 1.0), ("requests", 10.0)]),
            None,
        );
        e.update(
            &mut state,
            &params(&[("errors", 1.0), ("requests", 10.0)]),
            None,
        );

        let (value, set, _) = e.get(&state);
        assert!(set);
        assert_eq!(value, 0.1);
    }

    #[test]
    fn test_binary_divide_by_zero_unset() {
        let e = Expr::Binary {
            op: BinaryOp::Div,
            left: Box::new(Expr::sum(Expr::field("a"))),
            right: Box::new(Expr::sum(Expr::field("b"))),
        };
        let mut state = vec![0u8; e.encoded_width()];
        e.update(&mut state, &params(&[("a", 3.0)]), None);
        let (_, set, _) = e.get(&state);
        assert!(!set);
    }

    #[test]
    fn test_validate_rejects_nested_aggregates() {
        let e = Expr::sum(Expr::sum(Expr::field("v")));
        assert!(matches!(e.validate(), Err(Error::InvalidExpression(_))));

        let e = Expr::Bounded {
            expr: Box::new(Expr::field("v")),
            min: 5.0,
            max: 1.0,
        };
        assert!(matches!(e.validate(), Err(Error::InvalidExpression(_))));

        assert!(Expr::sum(Expr::field("v")).validate().is_ok());
    }

    #[test]
    fn test_yaml_round_trip() {
        let e = Expr::avg(Expr::field("latency"));
        let yaml = serde_yaml::to_string(&e).unwrap();
        let back: Expr = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(e, back);
    }
}
