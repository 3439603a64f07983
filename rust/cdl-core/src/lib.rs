//! CDL Core
//!
//! Shared types used across the compiler and CLI: the prime-field element
//! interface, the register-level IR, and the `MixedProgram` output surface.

pub mod field;
pub mod ir;
pub mod program;

pub use field::PrimeField;
pub use program::MixedProgram;
