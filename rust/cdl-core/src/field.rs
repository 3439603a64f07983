//! Prime-field element interface consumed by the compiler.
//!
//! The front-end only ever constructs elements from arbitrary-precision
//! integers, compares them, and asks for the modulus geometry; actual field
//! arithmetic lives in the proving back-end.

use num_bigint::{BigInt, BigUint, Sign};
use num_traits::{One, Zero};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;

/// The element interface the compiler is generic over.
///
/// `LIMB_WIDTH` is the width (in bits) at which lookup operands are
/// decomposed when checking limb alignment between source and target.
pub trait PrimeField:
    Clone + fmt::Debug + fmt::Display + PartialEq + Eq + PartialOrd + Ord + Hash + Serialize
{
    const NAME: &'static str;
    const LIMB_WIDTH: usize;

    /// The field modulus `p`.
    fn modulus() -> &'static BigUint;

    /// Construct an element from a (possibly negative, possibly oversized)
    /// integer, reduced into `[0, p)`.
    fn from_bigint(value: &BigInt) -> Self;

    fn to_biguint(&self) -> BigUint;

    /// Number of bits in the modulus.
    fn bit_width() -> usize {
        Self::modulus().bits() as usize
    }

    /// Widest `N` such that every `uintN` value is a valid element, i.e.
    /// `2^N - 1 < p`.
    fn register_width() -> usize {
        let p = Self::modulus();
        let mut n = p.bits() as usize;
        while n > 0 && &((BigUint::one() << n) - BigUint::one()) >= p {
            n -= 1;
        }
        n
    }

    fn from_u64(value: u64) -> Self {
        Self::from_bigint(&BigInt::from(value))
    }

    fn zero() -> Self {
        Self::from_u64(0)
    }

    fn one() -> Self {
        Self::from_u64(1)
    }

    fn is_zero(&self) -> bool {
        self.to_biguint().is_zero()
    }
}

fn reduce(value: &BigInt, modulus: &BigUint) -> BigUint {
    let p = BigInt::from_biguint(Sign::Plus, modulus.clone());
    let mut r = value % &p;
    if r.sign() == Sign::Minus {
        r += &p;
    }
    r.to_biguint().expect("reduced residue is non-negative")
}

macro_rules! modular_field {
    ($(#[$doc:meta])* $name:ident, $tag:literal, $limb:literal, $modulus:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(BigUint);

        impl PrimeField for $name {
            const NAME: &'static str = $tag;
            const LIMB_WIDTH: usize = $limb;

            fn modulus() -> &'static BigUint {
                static MODULUS: Lazy<BigUint> = Lazy::new(|| $modulus);
                &MODULUS
            }

            fn from_bigint(value: &BigInt) -> Self {
                $name(reduce(value, Self::modulus()))
            }

            fn to_biguint(&self) -> BigUint {
                self.0.clone()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{:x}", self.0)
            }
        }
    };
}

modular_field!(
    /// The toy field GF(251), used in tests and small examples.
    Gf251,
    "GF_251",
    8,
    BigUint::from(251u32)
);

modular_field!(
    /// KoalaBear: `p = 2^31 - 2^24 + 1`.
    KoalaBear,
    "KoalaBear",
    16,
    (BigUint::one() << 31u32) - (BigUint::one() << 24u32) + BigUint::one()
);

modular_field!(
    /// The BLS12-377 scalar field.
    Bls12_377,
    "BLS12_377",
    128,
    BigUint::parse_bytes(
        b"8444461749428370424248824938781546531375899335154063827935233455917409239041",
        10,
    )
    .expect("valid BLS12-377 scalar modulus")
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reduction_wraps_negative() {
        let x = Gf251::from_bigint(&BigInt::from(-1));
        assert_eq!(x.to_biguint(), BigUint::from(250u32));
    }

    #[test]
    fn test_reduction_wraps_oversized() {
        let x = Gf251::from_bigint(&BigInt::from(502));
        assert!(x.is_zero());
    }

    #[test]
    fn test_register_width() {
        // 2^7 - 1 = 127 < 251, 2^8 - 1 = 255 >= 251
        assert_eq!(Gf251::register_width(), 7);
        // KoalaBear is a 31-bit prime with 2^30 < p
        assert_eq!(KoalaBear::register_width(), 30);
        assert_eq!(Bls12_377::bit_width(), 253);
    }

    #[test]
    fn test_comparison_is_on_residues() {
        let a = Gf251::from_u64(3);
        let b = Gf251::from_bigint(&BigInt::from(254));
        assert_eq!(a, b);
    }
}
