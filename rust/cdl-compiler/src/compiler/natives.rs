//! The closed catalogue of native computations.
//!
//! A native declares an input-to-output column geometry without a
//! user-level body: given the `(type, multiplier)` of each source column,
//! its geometry function yields the `(type, multiplier)` of each target.

use crate::compiler::types::Type;

type Geometry = fn(&[(Type, usize)]) -> Vec<(Type, usize)>;

pub struct Native {
    pub name: &'static str,
    pub min_arity: usize,
    pub max_arity: usize,
    pub geometry: Geometry,
}

impl Native {
    pub fn accepts_arity(&self, n: usize) -> bool {
        n >= self.min_arity && n <= self.max_arity
    }
}

/// Copy the first source's shape.
fn like_first(inputs: &[(Type, usize)]) -> Vec<(Type, usize)> {
    vec![inputs[0].clone()]
}

/// A binary flag column on the first source's row domain.
fn binary_flag(inputs: &[(Type, usize)]) -> Vec<(Type, usize)> {
    vec![(Type::Uint(1), inputs[0].1)]
}

/// Copy the shape of the value source (the last input).
fn like_last(inputs: &[(Type, usize)]) -> Vec<(Type, usize)> {
    vec![inputs[inputs.len() - 1].clone()]
}

pub const NATIVES: &[Native] = &[
    Native {
        name: "id",
        min_arity: 1,
        max_arity: 1,
        geometry: like_first,
    },
    Native {
        name: "filter",
        min_arity: 2,
        max_arity: 2,
        geometry: like_first,
    },
    Native {
        name: "map-if",
        min_arity: 2,
        max_arity: 3,
        geometry: like_last,
    },
    Native {
        name: "fwd-changes-within",
        min_arity: 2,
        max_arity: 2,
        geometry: binary_flag,
    },
    Native {
        name: "bwd-changes-within",
        min_arity: 2,
        max_arity: 2,
        geometry: binary_flag,
    },
    Native {
        name: "fwd-unchanged-within",
        min_arity: 2,
        max_arity: 2,
        geometry: binary_flag,
    },
    Native {
        name: "bwd-unchanged-within",
        min_arity: 2,
        max_arity: 2,
        geometry: binary_flag,
    },
    Native {
        name: "fwd-fill-within",
        min_arity: 2,
        max_arity: 2,
        geometry: like_last,
    },
    Native {
        name: "bwd-fill-within",
        min_arity: 2,
        max_arity: 2,
        geometry: like_last,
    },
];

pub fn lookup(name: &str) -> Option<(usize, &'static Native)> {
    NATIVES.iter().enumerate().find(|(_, n)| n.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalogue_is_closed() {
        assert_eq!(NATIVES.len(), 9);
        assert!(lookup("filter").is_some());
        assert!(lookup("reverse").is_none());
    }

    #[test]
    fn test_geometries() {
        let inputs = vec![(Type::Uint(8), 2), (Type::Uint(16), 2)];
        let (_, changes) = lookup("fwd-changes-within").unwrap();
        assert_eq!((changes.geometry)(&inputs), vec![(Type::Uint(1), 2)]);
        let (_, fill) = lookup("fwd-fill-within").unwrap();
        assert_eq!((fill.geometry)(&inputs), vec![(Type::Uint(16), 2)]);
        assert!(changes.accepts_arity(2));
        assert!(!changes.accepts_arity(3));
    }
}
