//! A small symbolic expression library: enough arithmetic to express stage
//! definitions, infer the boxes their calls touch, and reduce bounds to
//! integer literals once every variable has been substituted away.

use std::collections::HashMap;
use std::fmt;
use std::ops::{Add, Mul, Sub};

use crate::common::Dtype;
use crate::stage::Stage;

#[derive(Clone, Debug)]
pub enum Expr {
    IntImm(i64),
    FloatImm(f64),
    /// A named loop variable.
    Var(String),
    /// A scalar parameter supplied by the caller, with an optional estimate
    /// of its runtime value.
    Param(Param),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(Call),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
}

#[derive(Clone, Debug)]
pub struct Param {
    pub name: String,
    pub estimate: Option<i64>,
}

#[derive(Clone, Debug)]
pub struct Call {
    pub callee: Callee,
    pub args: Vec<Expr>,
}

/// The target of a call: another stage of the pipeline, or an input image
/// whose contents the pipeline only reads.
#[derive(Clone, Debug)]
pub enum Callee {
    Stage(Stage),
    Image(ImageParam),
}

impl Callee {
    pub fn name(&self) -> &str {
        match self {
            Callee::Stage(s) => s.name(),
            Callee::Image(i) => &i.name,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ImageParam {
    pub name: String,
    pub dtype: Dtype,
}

impl ImageParam {
    pub fn new(name: impl Into<String>, dtype: Dtype) -> ImageParam {
        ImageParam {
            name: name.into(),
            dtype,
        }
    }

    /// Builds a load from this image at the given coordinates.
    pub fn at(&self, args: Vec<Expr>) -> Expr {
        Expr::Call(Call {
            callee: Callee::Image(self.clone()),
            args,
        })
    }
}

/// A symbolic inclusive interval.
#[derive(Clone, Debug)]
pub struct Interval {
    pub min: Expr,
    pub max: Expr,
}

impl Interval {
    pub fn point(e: Expr) -> Interval {
        Interval {
            min: e.clone(),
            max: e,
        }
    }
}

/// Maps in-scope loop variables to the interval of values they take.
pub type Scope = HashMap<String, Interval>;

pub fn var(name: &str) -> Expr {
    Expr::Var(name.to_owned())
}

pub fn lit(v: i64) -> Expr {
    Expr::IntImm(v)
}

impl From<i64> for Expr {
    fn from(v: i64) -> Expr {
        Expr::IntImm(v)
    }
}

impl Expr {
    pub fn as_const_int(&self) -> Option<i64> {
        match self {
            Expr::IntImm(v) => Some(*v),
            _ => None,
        }
    }

    pub fn dtype(&self) -> Dtype {
        match self {
            Expr::IntImm(_) | Expr::Var(_) | Expr::Param(_) => Dtype::Sint32,
            Expr::FloatImm(_) => Dtype::Float32,
            Expr::Binary(_, a, b) => a.dtype().promote(b.dtype()),
            Expr::Call(c) => match &c.callee {
                Callee::Stage(s) => s.value_dtype(),
                Callee::Image(i) => i.dtype,
            },
        }
    }

    pub fn min(self, other: impl Into<Expr>) -> Expr {
        Expr::Binary(BinOp::Min, Box::new(self), Box::new(other.into()))
    }

    pub fn max(self, other: impl Into<Expr>) -> Expr {
        Expr::Binary(BinOp::Max, Box::new(self), Box::new(other.into()))
    }
}

impl<R: Into<Expr>> Add<R> for Expr {
    type Output = Expr;

    fn add(self, rhs: R) -> Expr {
        Expr::Binary(BinOp::Add, Box::new(self), Box::new(rhs.into()))
    }
}

impl<R: Into<Expr>> Sub<R> for Expr {
    type Output = Expr;

    fn sub(self, rhs: R) -> Expr {
        Expr::Binary(BinOp::Sub, Box::new(self), Box::new(rhs.into()))
    }
}

impl<R: Into<Expr>> Mul<R> for Expr {
    type Output = Expr;

    fn mul(self, rhs: R) -> Expr {
        Expr::Binary(BinOp::Mul, Box::new(self), Box::new(rhs.into()))
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::IntImm(v) => write!(f, "{v}"),
            Expr::FloatImm(v) => write!(f, "{v}"),
            Expr::Var(n) => write!(f, "{n}"),
            Expr::Param(p) => write!(f, "{}", p.name),
            Expr::Binary(op, a, b) => match op {
                BinOp::Add => write!(f, "({a} + {b})"),
                BinOp::Sub => write!(f, "({a} - {b})"),
                BinOp::Mul => write!(f, "({a}*{b})"),
                BinOp::Div => write!(f, "({a}/{b})"),
                BinOp::Min => write!(f, "min({a}, {b})"),
                BinOp::Max => write!(f, "max({a}, {b})"),
            },
            Expr::Call(c) => {
                write!(f, "{}(", c.callee.name())?;
                for (i, a) in c.args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, ")")
            }
        }
    }
}

fn fold_int(op: BinOp, a: i64, b: i64) -> Option<i64> {
    match op {
        BinOp::Add => Some(a.wrapping_add(b)),
        BinOp::Sub => Some(a.wrapping_sub(b)),
        BinOp::Mul => Some(a.wrapping_mul(b)),
        BinOp::Div => (b != 0).then(|| a.div_euclid(b)),
        BinOp::Min => Some(a.min(b)),
        BinOp::Max => Some(a.max(b)),
    }
}

/// Recursively folds constants and strips arithmetic identities.
pub fn simplify(e: &Expr) -> Expr {
    match e {
        Expr::Binary(op, a, b) => {
            let a = simplify(a);
            let b = simplify(b);
            if let (Some(x), Some(y)) = (a.as_const_int(), b.as_const_int()) {
                if let Some(v) = fold_int(*op, x, y) {
                    return Expr::IntImm(v);
                }
            }
            match (op, a.as_const_int(), b.as_const_int()) {
                (BinOp::Add, Some(0), _) => b,
                (BinOp::Add | BinOp::Sub, _, Some(0)) => a,
                (BinOp::Mul, _, Some(1)) => a,
                (BinOp::Mul, Some(1), _) => b,
                (BinOp::Mul, Some(0), _) | (BinOp::Mul, _, Some(0)) => Expr::IntImm(0),
                _ => Expr::Binary(*op, Box::new(a), Box::new(b)),
            }
        }
        Expr::Call(c) => Expr::Call(Call {
            callee: c.callee.clone(),
            args: c.args.iter().map(simplify).collect(),
        }),
        _ => e.clone(),
    }
}

/// Replaces named variables with the given expressions.
pub fn substitute(bindings: &HashMap<String, Expr>, e: &Expr) -> Expr {
    match e {
        Expr::Var(n) => match bindings.get(n) {
            Some(replacement) => replacement.clone(),
            None => e.clone(),
        },
        Expr::Binary(op, a, b) => Expr::Binary(
            *op,
            Box::new(substitute(bindings, a)),
            Box::new(substitute(bindings, b)),
        ),
        Expr::Call(c) => Expr::Call(Call {
            callee: c.callee.clone(),
            args: c.args.iter().map(|a| substitute(bindings, a)).collect(),
        }),
        _ => e.clone(),
    }
}

/// Replaces every scalar parameter that carries an estimate with that
/// estimate. Parameters without estimates are left in place and will fail
/// later constant extraction.
pub fn apply_param_estimates(e: &Expr) -> Expr {
    match e {
        Expr::Param(p) => match p.estimate {
            Some(v) => Expr::IntImm(v),
            None => e.clone(),
        },
        Expr::Binary(op, a, b) => Expr::Binary(
            *op,
            Box::new(apply_param_estimates(a)),
            Box::new(apply_param_estimates(b)),
        ),
        Expr::Call(c) => Expr::Call(Call {
            callee: c.callee.clone(),
            args: c.args.iter().map(apply_param_estimates).collect(),
        }),
        _ => e.clone(),
    }
}

fn interval_of_binary(op: BinOp, a: Interval, b: Interval, b_expr: &Expr) -> Interval {
    match op {
        BinOp::Add => Interval {
            min: a.min + b.min,
            max: a.max + b.max,
        },
        BinOp::Sub => Interval {
            min: a.min - b.max,
            max: a.max - b.min,
        },
        BinOp::Min => Interval {
            min: a.min.min(b.min),
            max: a.max.min(b.max),
        },
        BinOp::Max => Interval {
            min: a.min.max(b.min),
            max: a.max.max(b.max),
        },
        BinOp::Mul | BinOp::Div => {
            // With a constant right operand the sign picks the orientation.
            if let Some(c) = simplify(b_expr).as_const_int() {
                let (lo, hi) = if c >= 0 {
                    (a.min, a.max)
                } else {
                    (a.max, a.min)
                };
                let apply = |e: Expr| Expr::Binary(op, Box::new(e), Box::new(Expr::IntImm(c)));
                return Interval {
                    min: apply(lo),
                    max: apply(hi),
                };
            }
            // Otherwise take the envelope of the four endpoint combinations.
            let combos: Vec<Expr> = [
                (&a.min, &b.min),
                (&a.min, &b.max),
                (&a.max, &b.min),
                (&a.max, &b.max),
            ]
            .into_iter()
            .map(|(x, y)| Expr::Binary(op, Box::new(x.clone()), Box::new(y.clone())))
            .collect();
            let min = combos
                .iter()
                .skip(1)
                .fold(combos[0].clone(), |acc, c| acc.min(c.clone()));
            let max = combos
                .iter()
                .skip(1)
                .fold(combos[0].clone(), |acc, c| acc.max(c.clone()));
            Interval { min, max }
        }
    }
}

/// The symbolic interval an expression spans when its loop variables range
/// over the intervals in `scope`. Free variables and parameters bound to
/// themselves; call results are opaque.
pub fn bounds_in_scope(e: &Expr, scope: &Scope) -> Interval {
    match e {
        Expr::IntImm(_) | Expr::FloatImm(_) | Expr::Param(_) => Interval::point(e.clone()),
        Expr::Var(n) => match scope.get(n) {
            Some(iv) => iv.clone(),
            None => Interval::point(e.clone()),
        },
        Expr::Binary(op, a, b) => {
            let ia = bounds_in_scope(a, scope);
            let ib = bounds_in_scope(b, scope);
            interval_of_binary(*op, ia, ib, b)
        }
        Expr::Call(_) => Interval::point(e.clone()),
    }
}

/// For every callee reached from `exprs`, the per-dimension interval hull of
/// all argument ranges, in first-call order.
pub fn required_boxes(exprs: &[Expr], scope: &Scope) -> Vec<(Callee, Vec<Interval>)> {
    let mut boxes: Vec<(Callee, Vec<Interval>)> = Vec::new();
    for e in exprs {
        collect_boxes(e, scope, &mut boxes);
    }
    boxes
}

fn collect_boxes(e: &Expr, scope: &Scope, boxes: &mut Vec<(Callee, Vec<Interval>)>) {
    match e {
        Expr::Binary(_, a, b) => {
            collect_boxes(a, scope, boxes);
            collect_boxes(b, scope, boxes);
        }
        Expr::Call(c) => {
            for a in &c.args {
                collect_boxes(a, scope, boxes);
            }
            let bbox: Vec<Interval> = c.args.iter().map(|a| bounds_in_scope(a, scope)).collect();
            match boxes.iter_mut().find(|(k, _)| k.name() == c.callee.name()) {
                Some((_, merged)) => {
                    for (iv, new) in merged.iter_mut().zip(bbox) {
                        iv.min = iv.min.clone().min(new.min);
                        iv.max = iv.max.clone().max(new.max);
                    }
                }
                None => boxes.push((c.callee.clone(), bbox)),
            }
        }
        _ => {}
    }
}

/// Counts expression leaves as a proxy for per-point arithmetic, and tallies
/// how many calls each callee receives. Every call contributes one leaf for
/// itself and one per argument for the implied addressing arithmetic.
#[derive(Debug, Default)]
pub struct LeafCounter {
    pub leaves: i64,
    pub calls: HashMap<String, i64>,
}

impl LeafCounter {
    pub fn visit(&mut self, e: &Expr) {
        match e {
            Expr::IntImm(_) | Expr::FloatImm(_) | Expr::Var(_) | Expr::Param(_) => {
                self.leaves += 1;
            }
            Expr::Binary(_, a, b) => {
                self.visit(a);
                self.visit(b);
            }
            Expr::Call(c) => {
                for a in &c.args {
                    self.visit(a);
                }
                *self.calls.entry(c.callee.name().to_owned()).or_insert(0) += 1;
                self.leaves += 1 + c.args.len() as i64;
            }
        }
    }
}
