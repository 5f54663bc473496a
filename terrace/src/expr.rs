use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::{Add, Div, Mul, Sub};

/// A symbolic integer expression.
///
/// Division rounds toward negative infinity, matching the loop-bound
/// arithmetic the solver performs. Calls reference either pipeline functions
/// or opaque input buffers; `value_index` selects a component of a
/// tuple-valued function.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum Expr {
    Imm(i64),
    Var(String),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
    Min(Box<Expr>, Box<Expr>),
    Max(Box<Expr>, Box<Expr>),
    Call(CallExpr),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct CallExpr {
    pub callee: String,
    pub args: Vec<Expr>,
    pub value_index: usize,
}

pub fn imm(v: i64) -> Expr {
    Expr::Imm(v)
}

pub fn var(name: impl Into<String>) -> Expr {
    Expr::Var(name.into())
}

pub fn call(callee: impl Into<String>, args: Vec<Expr>) -> Expr {
    Expr::Call(CallExpr {
        callee: callee.into(),
        args,
        value_index: 0,
    })
}

pub fn min(a: Expr, b: Expr) -> Expr {
    Expr::Min(Box::new(a), Box::new(b))
}

pub fn max(a: Expr, b: Expr) -> Expr {
    Expr::Max(Box::new(a), Box::new(b))
}

/// `(a + b - 1) / b`, the tile-count expression.
pub fn ceil_div(a: Expr, b: Expr) -> Expr {
    (a + b.clone() - imm(1)) / b
}

fn floor_div(a: i64, b: i64) -> i64 {
    debug_assert_ne!(b, 0);
    a.div_euclid(b)
}

impl Expr {
    pub fn as_imm(&self) -> Option<i64> {
        match self {
            Expr::Imm(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_imm(&self) -> bool {
        matches!(self, Expr::Imm(_))
    }

    /// Constant folding and identity elimination. Total; never fails.
    pub fn simplify(&self) -> Expr {
        match self {
            Expr::Imm(_) | Expr::Var(_) => self.clone(),
            Expr::Call(c) => Expr::Call(CallExpr {
                callee: c.callee.clone(),
                args: c.args.iter().map(Expr::simplify).collect(),
                value_index: c.value_index,
            }),
            Expr::Add(a, b) => match (a.simplify(), b.simplify()) {
                (Expr::Imm(x), Expr::Imm(y)) => Expr::Imm(x + y),
                (Expr::Imm(0), e) | (e, Expr::Imm(0)) => e,
                // Re-associate (e + c1) + c2 so chained offsets fold.
                (Expr::Add(e, c1), Expr::Imm(c2)) if c1.is_imm() => {
                    (*e + imm(c1.as_imm().unwrap() + c2)).simplify()
                }
                (Expr::Sub(e, c1), Expr::Imm(c2)) if c1.is_imm() => {
                    (*e + imm(c2 - c1.as_imm().unwrap())).simplify()
                }
                (Expr::Imm(c2), Expr::Add(e, c1)) if c1.is_imm() => {
                    (*e + imm(c1.as_imm().unwrap() + c2)).simplify()
                }
                (x, y) => Expr::Add(Box::new(x), Box::new(y)),
            },
            Expr::Sub(a, b) => match (a.simplify(), b.simplify()) {
                (Expr::Imm(x), Expr::Imm(y)) => Expr::Imm(x - y),
                (e, Expr::Imm(0)) => e,
                (x, y) if x == y => Expr::Imm(0),
                (Expr::Add(e, c1), Expr::Imm(c2)) if c1.is_imm() => {
                    (*e + imm(c1.as_imm().unwrap() - c2)).simplify()
                }
                // (e + b) - e and (b + e) - e reduce to b.
                (Expr::Add(x, y), z) if *x == z => *y,
                (Expr::Add(x, y), z) if *y == z => *x,
                (x, y) => Expr::Sub(Box::new(x), Box::new(y)),
            },
            Expr::Mul(a, b) => match (a.simplify(), b.simplify()) {
                (Expr::Imm(x), Expr::Imm(y)) => Expr::Imm(x * y),
                (Expr::Imm(0), _) | (_, Expr::Imm(0)) => Expr::Imm(0),
                (Expr::Imm(1), e) | (e, Expr::Imm(1)) => e,
                (x, y) => Expr::Mul(Box::new(x), Box::new(y)),
            },
            Expr::Div(a, b) => match (a.simplify(), b.simplify()) {
                (Expr::Imm(x), Expr::Imm(y)) if y != 0 => Expr::Imm(floor_div(x, y)),
                (e, Expr::Imm(1)) => e,
                (Expr::Imm(0), e) if !matches!(e, Expr::Imm(0)) => Expr::Imm(0),
                (x, y) => Expr::Div(Box::new(x), Box::new(y)),
            },
            Expr::Min(a, b) => match (a.simplify(), b.simplify()) {
                (Expr::Imm(x), Expr::Imm(y)) => Expr::Imm(x.min(y)),
                (x, y) if x == y => x,
                (x, y) => Expr::Min(Box::new(x), Box::new(y)),
            },
            Expr::Max(a, b) => match (a.simplify(), b.simplify()) {
                (Expr::Imm(x), Expr::Imm(y)) => Expr::Imm(x.max(y)),
                (x, y) if x == y => x,
                (x, y) => Expr::Max(Box::new(x), Box::new(y)),
            },
        }
    }

    /// Replace every occurrence of the variable `name` with `value`.
    pub fn substitute(&self, name: &str, value: &Expr) -> Expr {
        self.transform(&mut |e| match e {
            Expr::Var(v) if v == name => Some(value.clone()),
            _ => None,
        })
    }

    /// Replace every variable present in `bindings` with its binding.
    pub fn substitute_map(&self, bindings: &BTreeMap<String, Expr>) -> Expr {
        self.transform(&mut |e| match e {
            Expr::Var(v) => bindings.get(v).cloned(),
            _ => None,
        })
    }

    pub fn transform(&self, f: &mut dyn FnMut(&Expr) -> Option<Expr>) -> Expr {
        if let Some(replacement) = f(self) {
            return replacement;
        }
        match self {
            Expr::Imm(_) | Expr::Var(_) => self.clone(),
            Expr::Call(c) => Expr::Call(CallExpr {
                callee: c.callee.clone(),
                args: c.args.iter().map(|a| a.transform(f)).collect(),
                value_index: c.value_index,
            }),
            Expr::Add(a, b) => Expr::Add(Box::new(a.transform(f)), Box::new(b.transform(f))),
            Expr::Sub(a, b) => Expr::Sub(Box::new(a.transform(f)), Box::new(b.transform(f))),
            Expr::Mul(a, b) => Expr::Mul(Box::new(a.transform(f)), Box::new(b.transform(f))),
            Expr::Div(a, b) => Expr::Div(Box::new(a.transform(f)), Box::new(b.transform(f))),
            Expr::Min(a, b) => Expr::Min(Box::new(a.transform(f)), Box::new(b.transform(f))),
            Expr::Max(a, b) => Expr::Max(Box::new(a.transform(f)), Box::new(b.transform(f))),
        }
    }

    pub fn uses_var(&self, name: &str) -> bool {
        let mut found = false;
        self.visit(&mut |e| {
            if let Expr::Var(v) = e {
                if v == name {
                    found = true;
                }
            }
        });
        found
    }

    pub fn uses_any_var(&self, names: &BTreeSet<String>) -> bool {
        let mut found = false;
        self.visit(&mut |e| {
            if let Expr::Var(v) = e {
                if names.contains(v) {
                    found = true;
                }
            }
        });
        found
    }

    pub fn visit(&self, f: &mut impl FnMut(&Expr)) {
        f(self);
        match self {
            Expr::Imm(_) | Expr::Var(_) => {}
            Expr::Call(c) => {
                for a in &c.args {
                    a.visit(f);
                }
            }
            Expr::Add(a, b)
            | Expr::Sub(a, b)
            | Expr::Mul(a, b)
            | Expr::Div(a, b)
            | Expr::Min(a, b)
            | Expr::Max(a, b) => {
                a.visit(f);
                b.visit(f);
            }
        }
    }

    /// Collect every call site in evaluation order.
    pub fn calls(&self) -> Vec<&CallExpr> {
        let mut out = Vec::new();
        self.collect_calls(&mut out);
        out
    }

    fn collect_calls<'a>(&'a self, out: &mut Vec<&'a CallExpr>) {
        match self {
            Expr::Imm(_) | Expr::Var(_) => {}
            Expr::Call(c) => {
                for a in &c.args {
                    a.collect_calls(out);
                }
                out.push(c);
            }
            Expr::Add(a, b)
            | Expr::Sub(a, b)
            | Expr::Mul(a, b)
            | Expr::Div(a, b)
            | Expr::Min(a, b)
            | Expr::Max(a, b) => {
                a.collect_calls(out);
                b.collect_calls(out);
            }
        }
    }

    /// Number of arithmetic operations performed when evaluating one point.
    pub fn op_count(&self) -> i64 {
        let mut count = 0i64;
        self.visit(&mut |e| {
            if matches!(
                e,
                Expr::Add(..)
                    | Expr::Sub(..)
                    | Expr::Mul(..)
                    | Expr::Div(..)
                    | Expr::Min(..)
                    | Expr::Max(..)
            ) {
                count += 1;
            }
        });
        count
    }
}

/// `true` only when `a >= b` reduces to a known constant fact.
pub fn can_prove_ge(a: &Expr, b: &Expr) -> bool {
    matches!((a.clone() - b.clone()).simplify().as_imm(), Some(d) if d >= 0)
}

pub fn can_prove_gt(a: &Expr, b: &Expr) -> bool {
    matches!((a.clone() - b.clone()).simplify().as_imm(), Some(d) if d > 0)
}

pub fn can_prove_lt(a: &Expr, b: &Expr) -> bool {
    can_prove_gt(b, a)
}

pub fn can_prove_eq(a: &Expr, b: &Expr) -> bool {
    matches!((a.clone() - b.clone()).simplify().as_imm(), Some(0))
}

impl Add for Expr {
    type Output = Expr;

    fn add(self, rhs: Expr) -> Expr {
        Expr::Add(Box::new(self), Box::new(rhs))
    }
}

impl Sub for Expr {
    type Output = Expr;

    fn sub(self, rhs: Expr) -> Expr {
        Expr::Sub(Box::new(self), Box::new(rhs))
    }
}

impl Mul for Expr {
    type Output = Expr;

    fn mul(self, rhs: Expr) -> Expr {
        Expr::Mul(Box::new(self), Box::new(rhs))
    }
}

impl Div for Expr {
    type Output = Expr;

    fn div(self, rhs: Expr) -> Expr {
        Expr::Div(Box::new(self), Box::new(rhs))
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Imm(v) => write!(f, "{}", v),
            Expr::Var(v) => write!(f, "{}", v),
            Expr::Add(a, b) => write!(f, "({} + {})", a, b),
            Expr::Sub(a, b) => write!(f, "({} - {})", a, b),
            Expr::Mul(a, b) => write!(f, "({}*{})", a, b),
            Expr::Div(a, b) => write!(f, "({}/{})", a, b),
            Expr::Min(a, b) => write!(f, "min({}, {})", a, b),
            Expr::Max(a, b) => write!(f, "max({}, {})", a, b),
            Expr::Call(c) => write!(f, "{}", c),
        }
    }
}

impl fmt::Display for CallExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({})",
            self.callee,
            self.args.iter().map(|a| a.to_string()).join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn eval(e: &Expr, env: &BTreeMap<String, i64>) -> i64 {
        match e {
            Expr::Imm(v) => *v,
            Expr::Var(v) => env[v],
            Expr::Add(a, b) => eval(a, env) + eval(b, env),
            Expr::Sub(a, b) => eval(a, env) - eval(b, env),
            Expr::Mul(a, b) => eval(a, env) * eval(b, env),
            Expr::Div(a, b) => {
                let d = eval(b, env);
                if d == 0 {
                    0
                } else {
                    eval(a, env).div_euclid(d)
                }
            }
            Expr::Min(a, b) => eval(a, env).min(eval(b, env)),
            Expr::Max(a, b) => eval(a, env).max(eval(b, env)),
            Expr::Call(_) => panic!("no calls in eval tests"),
        }
    }

    fn arb_expr() -> impl Strategy<Value = Expr> {
        let leaf = prop_oneof![
            (-8i64..8).prop_map(Expr::Imm),
            prop_oneof![Just("x"), Just("y")].prop_map(|v| var(v)),
        ];
        leaf.prop_recursive(3, 24, 2, |inner| {
            (inner.clone(), inner, 0u8..6).prop_map(|(a, b, op)| match op {
                0 => a + b,
                1 => a - b,
                2 => a * b,
                3 => a / b,
                4 => min(a, b),
                _ => max(a, b),
            })
        })
    }

    #[test]
    fn folds_constants() {
        assert_eq!((imm(2) + imm(3)).simplify(), imm(5));
        assert_eq!((imm(7) * imm(0)).simplify(), imm(0));
        assert_eq!(min(imm(4), imm(9)).simplify(), imm(4));
        assert_eq!(ceil_div(imm(100), imm(64)).simplify(), imm(2));
    }

    #[test]
    fn eliminates_identities() {
        let x = var("x");
        assert_eq!((x.clone() + imm(0)).simplify(), x);
        assert_eq!((x.clone() * imm(1)).simplify(), x);
        assert_eq!((x.clone() - x.clone()).simplify(), imm(0));
        assert_eq!((x.clone() / imm(1)).simplify(), x);
    }

    #[test]
    fn reassociates_offsets() {
        let x = var("x");
        assert_eq!(((x.clone() + imm(3)) + imm(4)).simplify(), x + imm(7));
    }

    #[test]
    fn division_rounds_toward_negative_infinity() {
        assert_eq!((imm(-7) / imm(2)).simplify(), imm(-4));
        assert_eq!((imm(7) / imm(2)).simplify(), imm(3));
    }

    #[test]
    fn substitution_is_capture_free() {
        let e = var("x") + var("y");
        assert_eq!(e.substitute("x", &imm(5)).simplify(), var("y") + imm(5));
    }

    #[test]
    fn proves_only_constant_facts() {
        assert!(can_prove_ge(&imm(5), &imm(5)));
        assert!(can_prove_gt(&(var("x") + imm(1)), &var("x")));
        assert!(!can_prove_gt(&var("x"), &var("y")));
        assert!(can_prove_eq(&(imm(2) * imm(3)), &imm(6)));
    }

    #[test]
    fn counts_arithmetic_operations() {
        let e = (var("x") + var("y")) * imm(2) + call("f", vec![var("x") - imm(1)]);
        assert_eq!(e.op_count(), 4);
    }

    #[test]
    fn collects_calls_including_nested() {
        let e = call("f", vec![call("g", vec![var("x")])]) + var("y");
        let names: Vec<_> = e.calls().iter().map(|c| c.callee.clone()).collect();
        assert_eq!(names, vec!["g", "f"]);
    }

    #[test]
    fn renders_readably() {
        let e = min(var("x") + imm(1), imm(10));
        assert_eq!(e.to_string(), "min((x + 1), 10)");
    }

    proptest! {
        #[test]
        fn simplify_preserves_value(e in arb_expr(), x in -5i64..5, y in -5i64..5) {
            let env = BTreeMap::from([("x".to_string(), x), ("y".to_string(), y)]);
            // Division by a symbolic zero stays unevaluated on one side; skip
            // those cases by treating 0 divisors as 0 in eval on both sides.
            prop_assert_eq!(eval(&e, &env), eval(&e.simplify(), &env));
        }

        #[test]
        fn simplify_is_idempotent(e in arb_expr()) {
            let once = e.simplify();
            prop_assert_eq!(once.clone(), once.simplify());
        }
    }
}
