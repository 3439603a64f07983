//! The type lattice: fixed-width integers, booleans, unbounded integers
//! and invariant arrays.
//!
//! `uintM <= uintN` iff `M <= N`; `bool` sits outside the numeric order
//! and carries truth rather than a value; `int` is the unbounded top used
//! internally for function parameters and loop indices.

use num_bigint::BigInt;
use num_traits::Signed;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::compiler::ast::{ConditionSemantics, TypeExpr, TypeExprKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Type {
    Uint(usize),
    Bool,
    Int,
    Array {
        element: Box<Type>,
        lo: usize,
        hi: usize,
    },
}

impl Type {
    pub fn from_expr(expr: &TypeExpr) -> Type {
        match expr.kind {
            TypeExprKind::Uint(n) => Type::Uint(n),
            TypeExprKind::Bool => Type::Bool,
        }
    }

    /// The narrowest `uintN` holding a non-negative constant. Negative
    /// constants live in `int`.
    pub fn of_constant(value: &BigInt) -> Type {
        if value.is_negative() {
            Type::Int
        } else {
            Type::Uint((value.bits() as usize).max(1))
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Type::Uint(_) | Type::Int)
    }

    /// Fixed bit width, when the type has one.
    pub fn bit_width(&self) -> Option<usize> {
        match self {
            Type::Uint(n) => Some(*n),
            Type::Bool => Some(1),
            Type::Int | Type::Array { .. } => None,
        }
    }

    pub fn is_subtype_of(&self, other: &Type) -> bool {
        match (self, other) {
            (Type::Uint(m), Type::Uint(n)) => m <= n,
            (Type::Uint(_), Type::Int) => true,
            (Type::Int, Type::Int) => true,
            (Type::Bool, Type::Bool) => true,
            // Arrays are invariant.
            (
                Type::Array { element, lo, hi },
                Type::Array {
                    element: e2,
                    lo: l2,
                    hi: h2,
                },
            ) => element == e2 && lo == l2 && hi == h2,
            _ => false,
        }
    }

    /// Widest of the two; `None` when unrelated.
    pub fn lub(&self, other: &Type) -> Option<Type> {
        match (self, other) {
            (Type::Uint(m), Type::Uint(n)) => Some(Type::Uint(*m.max(n))),
            (Type::Uint(_), Type::Int) | (Type::Int, Type::Uint(_)) | (Type::Int, Type::Int) => {
                Some(Type::Int)
            }
            (Type::Bool, Type::Bool) => Some(Type::Bool),
            (a, b) if a == b => Some(a.clone()),
            _ => None,
        }
    }

    /// Narrowest of the two; `None` when unrelated.
    pub fn glb(&self, other: &Type) -> Option<Type> {
        match (self, other) {
            (Type::Uint(m), Type::Uint(n)) => Some(Type::Uint(*m.min(n))),
            (Type::Uint(m), Type::Int) | (Type::Int, Type::Uint(m)) => Some(Type::Uint(*m)),
            (Type::Int, Type::Int) => Some(Type::Int),
            (Type::Bool, Type::Bool) => Some(Type::Bool),
            (a, b) if a == b => Some(a.clone()),
            _ => None,
        }
    }

    /// How this type reads in condition position, when it does.
    pub fn condition_semantics(&self) -> Option<ConditionSemantics> {
        match self {
            Type::Bool => Some(ConditionSemantics::Boolean),
            Type::Uint(_) | Type::Int => Some(ConditionSemantics::Loobean),
            Type::Array { .. } => None,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Uint(n) => write!(f, "u{}", n),
            Type::Bool => write!(f, "bool"),
            Type::Int => write!(f, "int"),
            Type::Array { element, lo, hi } => write!(f, "{}[{}:{}]", element, lo, hi),
        }
    }
}

/// Fold a sequence of types with `lub`, the typing of `+`, `-` and lists.
pub fn join_all<'a>(types: impl IntoIterator<Item = &'a Type>) -> Option<Type> {
    let mut acc: Option<Type> = None;
    for t in types {
        acc = match acc {
            None => Some(t.clone()),
            Some(prev) => Some(prev.lub(t)?),
        };
    }
    acc
}

/// Fold a sequence of types with `glb`, the typing of `*`.
pub fn meet_all<'a>(types: impl IntoIterator<Item = &'a Type>) -> Option<Type> {
    let mut acc: Option<Type> = None;
    for t in types {
        acc = match acc {
            None => Some(t.clone()),
            Some(prev) => Some(prev.glb(t)?),
        };
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subtyping() {
        assert!(Type::Uint(8).is_subtype_of(&Type::Uint(16)));
        assert!(!Type::Uint(16).is_subtype_of(&Type::Uint(8)));
        assert!(Type::Uint(8).is_subtype_of(&Type::Int));
        assert!(!Type::Bool.is_subtype_of(&Type::Uint(1)));
        assert!(!Type::Uint(1).is_subtype_of(&Type::Bool));
    }

    #[test]
    fn test_bounds() {
        assert_eq!(Type::Uint(8).lub(&Type::Uint(16)), Some(Type::Uint(16)));
        assert_eq!(Type::Uint(8).glb(&Type::Uint(16)), Some(Type::Uint(8)));
        assert_eq!(Type::Bool.lub(&Type::Uint(8)), None);
    }

    #[test]
    fn test_array_invariance() {
        let a = Type::Array {
            element: Box::new(Type::Uint(8)),
            lo: 1,
            hi: 3,
        };
        let b = Type::Array {
            element: Box::new(Type::Uint(16)),
            lo: 1,
            hi: 3,
        };
        assert!(a.is_subtype_of(&a));
        assert!(!a.is_subtype_of(&b));
        assert_eq!(a.lub(&b), None);
    }

    #[test]
    fn test_constant_typing() {
        assert_eq!(Type::of_constant(&BigInt::from(0)), Type::Uint(1));
        assert_eq!(Type::of_constant(&BigInt::from(5)), Type::Uint(3));
        assert_eq!(Type::of_constant(&BigInt::from(300)), Type::Uint(9));
        assert_eq!(Type::of_constant(&BigInt::from(-1)), Type::Int);
    }

    #[test]
    fn test_condition_semantics() {
        assert_eq!(
            Type::Bool.condition_semantics(),
            Some(ConditionSemantics::Boolean)
        );
        assert_eq!(
            Type::Uint(8).condition_semantics(),
            Some(ConditionSemantics::Loobean)
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(Type::Uint(17).to_string(), "u17");
        assert_eq!(Type::Bool.to_string(), "bool");
    }
}
