//! The seam between this crate and the (out-of-scope) ReQL AST surface.
//!
//! spec.md §1 keeps the hundreds of auto-generated term constructors out of
//! this core; all the core needs is a `Term::build()` operation that
//! produces the JSON-serializable value the wire protocol expects. A real
//! AST layer would implement [`Term`] for every term-constructor type it
//! generates; this crate only provides [`RawTerm`], a thin wrapper around
//! an already-built `serde_json::Value`, for callers and tests that want
//! to hand the core a term directly.

use serde_json::Value;

/// A node in a ReQL expression tree, reduced to the one operation the core
/// depends on.
pub trait Term: std::fmt::Debug {
    /// Serializes this term (and its subterms) into the `[termType, args,
    /// opts?]` JSON shape the wire protocol expects.
    fn build(&self) -> Value;
}

/// A term that is already a fully-built JSON value — the escape hatch for
/// callers (and tests) that aren't going through a generated AST layer.
#[derive(Debug, Clone)]
pub struct RawTerm(pub Value);

impl RawTerm {
    pub fn new(value: impl Into<Value>) -> Self {
        Self(value.into())
    }
}

impl Term for RawTerm {
    fn build(&self) -> Value {
        self.0.clone()
    }
}

impl Term for Value {
    fn build(&self) -> Value {
        self.clone()
    }
}
