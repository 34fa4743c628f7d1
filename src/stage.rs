//! Stages: pure functions from integer coordinates to array values, the
//! vertices of the pipeline the scheduler operates on.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::common::Dtype;
use crate::expr::{Call, Callee, Expr};

/// A pure stage of an array pipeline.
///
/// Handles are cheap to clone and share one definition; identity is by
/// handle, not by name ([`Stage::same_as`]). A stage is defined once with its
/// loop variables and value expressions; output stages additionally carry
/// extent estimates registered through [`Stage::set_estimate`].
#[derive(Clone)]
pub struct Stage {
    inner: Rc<StageInner>,
}

struct StageInner {
    name: String,
    args: Vec<String>,
    values: Vec<Expr>,
    updates: RefCell<Vec<Vec<Expr>>>,
    estimates: RefCell<HashMap<String, (i64, i64)>>,
}

impl Stage {
    pub fn define(name: impl Into<String>, args: &[&str], values: Vec<Expr>) -> Stage {
        debug_assert!(!values.is_empty(), "a stage must produce at least one value");
        Stage {
            inner: Rc::new(StageInner {
                name: name.into(),
                args: args.iter().map(|a| (*a).to_owned()).collect(),
                values,
                updates: RefCell::new(Vec::new()),
                estimates: RefCell::new(HashMap::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn dimensions(&self) -> usize {
        self.inner.args.len()
    }

    /// The names of the stage's loop variables, one per dimension.
    pub fn args(&self) -> &[String] {
        &self.inner.args
    }

    /// The right-hand-side expressions, one per produced value.
    pub fn values(&self) -> &[Expr] {
        &self.inner.values
    }

    /// Appends an update definition. The scheduler rejects stages with
    /// updates; this exists so callers get a typed error rather than silence.
    pub fn push_update(&self, values: Vec<Expr>) {
        self.inner.updates.borrow_mut().push(values);
    }

    pub fn has_updates(&self) -> bool {
        !self.inner.updates.borrow().is_empty()
    }

    /// Registers an estimated extent `[min, min + extent)` for the named
    /// loop variable. Chainable.
    pub fn set_estimate(&self, var: &str, min: i64, extent: i64) -> &Self {
        self.inner
            .estimates
            .borrow_mut()
            .insert(var.to_owned(), (min, extent));
        self
    }

    pub fn estimate_for(&self, var: &str) -> Option<(i64, i64)> {
        self.inner.estimates.borrow().get(var).copied()
    }

    /// Builds a call to this stage at the given coordinates.
    pub fn at(&self, args: Vec<Expr>) -> Expr {
        debug_assert_eq!(args.len(), self.dimensions());
        Expr::Call(Call {
            callee: Callee::Stage(self.clone()),
            args,
        })
    }

    /// The type of values a call to this stage yields.
    pub fn value_dtype(&self) -> Dtype {
        self.inner
            .values
            .first()
            .map(|v| v.dtype())
            .unwrap_or(Dtype::Sint32)
    }

    pub fn same_as(&self, other: &Stage) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage").field("name", &self.inner.name).finish()
    }
}
