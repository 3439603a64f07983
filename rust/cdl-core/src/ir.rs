//! Register-level IR emitted by the compiler front-end.
//!
//! Terms reference physical registers and field constants only; all source
//! sugar (functions, loops, bindings) has been discharged by the time these
//! are built.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::field::PrimeField;

/// Index of a module in the program's unified module space: externs first,
/// in declaration order, then IR modules.
pub type ModuleId = usize;

/// A physical register within one module's register table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegisterRef {
    pub module: ModuleId,
    pub index: usize,
}

impl fmt::Display for RegisterRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}/{}", self.module, self.index)
    }
}

/// Qualified constraint name, used for reporting and output labelling.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Handle {
    pub module: String,
    pub name: String,
}

impl Handle {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Handle {
            module: module.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.module.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}.{}", self.module, self.name)
        }
    }
}

// ── Arithmetic terms ──

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Term<F: PrimeField> {
    Const(F),
    /// A constant carrying the name of the extern constant it came from.
    LabelledConst { label: String, value: F },
    Register { reg: RegisterRef, shift: isize },
    Sum(Vec<Term<F>>),
    Product(Vec<Term<F>>),
    Subtract(Vec<Term<F>>),
    Exponent(Box<Term<F>>, u64),
    /// 0 if the operand is 0, 1 otherwise.
    Normalise(Box<Term<F>>),
    /// Unsafe cast: narrows the operand's assumed value range to `bits`.
    CastOf(Box<Term<F>>, usize),
}

impl<F: PrimeField> Term<F> {
    pub fn zero() -> Self {
        Term::Const(F::zero())
    }

    pub fn is_constant(&self) -> bool {
        match self {
            Term::Const(_) | Term::LabelledConst { .. } => true,
            Term::Register { .. } => false,
            Term::Sum(ts) | Term::Product(ts) | Term::Subtract(ts) => {
                ts.iter().all(Term::is_constant)
            }
            Term::Exponent(t, _) | Term::Normalise(t) | Term::CastOf(t, _) => t.is_constant(),
        }
    }

    /// Every register mentioned by this term, with its access shift.
    pub fn registers(&self) -> Vec<(RegisterRef, isize)> {
        let mut out = Vec::new();
        self.collect_registers(&mut out);
        out
    }

    fn collect_registers(&self, out: &mut Vec<(RegisterRef, isize)>) {
        match self {
            Term::Const(_) | Term::LabelledConst { .. } => {}
            Term::Register { reg, shift } => out.push((*reg, *shift)),
            Term::Sum(ts) | Term::Product(ts) | Term::Subtract(ts) => {
                for t in ts {
                    t.collect_registers(out);
                }
            }
            Term::Exponent(t, _) | Term::Normalise(t) | Term::CastOf(t, _) => {
                t.collect_registers(out)
            }
        }
    }
}

// ── Logical terms ──

/// A term in logical position: something that holds or does not hold on a
/// row. `Vanishes` is the primitive form; the connectives compose it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogicalTerm<F: PrimeField> {
    /// The wrapped arithmetic term equals zero.
    Vanishes(Term<F>),
    Equals(Term<F>, Term<F>),
    NotEquals(Term<F>, Term<F>),
    LessThan(Term<F>, Term<F>),
    LessThanOrEqual(Term<F>, Term<F>),
    GreaterThan(Term<F>, Term<F>),
    GreaterThanOrEqual(Term<F>, Term<F>),
    Negation(Box<LogicalTerm<F>>),
    Conjunction(Vec<LogicalTerm<F>>),
    Disjunction(Vec<LogicalTerm<F>>),
    IfThenElse {
        condition: Box<LogicalTerm<F>>,
        then_branch: Option<Box<LogicalTerm<F>>>,
        else_branch: Option<Box<LogicalTerm<F>>>,
    },
}

impl<F: PrimeField> LogicalTerm<F> {
    pub fn registers(&self) -> Vec<(RegisterRef, isize)> {
        let mut out = Vec::new();
        self.collect_registers(&mut out);
        out
    }

    fn collect_registers(&self, out: &mut Vec<(RegisterRef, isize)>) {
        match self {
            LogicalTerm::Vanishes(t) => t.collect_registers(out),
            LogicalTerm::Equals(l, r)
            | LogicalTerm::NotEquals(l, r)
            | LogicalTerm::LessThan(l, r)
            | LogicalTerm::LessThanOrEqual(l, r)
            | LogicalTerm::GreaterThan(l, r)
            | LogicalTerm::GreaterThanOrEqual(l, r) => {
                l.collect_registers(out);
                r.collect_registers(out);
            }
            LogicalTerm::Negation(t) => t.collect_registers(out),
            LogicalTerm::Conjunction(ts) | LogicalTerm::Disjunction(ts) => {
                for t in ts {
                    t.collect_registers(out);
                }
            }
            LogicalTerm::IfThenElse {
                condition,
                then_branch,
                else_branch,
            } => {
                condition.collect_registers(out);
                if let Some(t) = then_branch {
                    t.collect_registers(out);
                }
                if let Some(t) = else_branch {
                    t.collect_registers(out);
                }
            }
        }
    }
}

// ── Constraints ──

/// One side of a lookup: an optional binary selector plus a term tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupVector<F: PrimeField> {
    pub selector: Option<Term<F>>,
    pub terms: Vec<Term<F>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Constraint<F: PrimeField> {
    Vanishing {
        handle: Handle,
        module: ModuleId,
        domain: Option<Vec<isize>>,
        body: LogicalTerm<F>,
    },
    Range {
        handle: Handle,
        module: ModuleId,
        expr: Term<F>,
        bitwidth: usize,
    },
    Lookup {
        handle: Handle,
        targets: LookupVector<F>,
        sources: Vec<LookupVector<F>>,
    },
    Permutation {
        handle: Handle,
        targets: Vec<RegisterRef>,
        sources: Vec<RegisterRef>,
        signs: Vec<bool>,
    },
    Sorted {
        handle: Handle,
        module: ModuleId,
        bitwidth: usize,
        selector: Option<Term<F>>,
        sources: Vec<Term<F>>,
        signs: Vec<bool>,
        strict: bool,
    },
    Interleaving {
        handle: Handle,
        target: RegisterRef,
        sources: Vec<RegisterRef>,
    },
    Assertion {
        handle: Handle,
        module: ModuleId,
        domain: Option<Vec<isize>>,
        body: LogicalTerm<F>,
    },
}

impl<F: PrimeField> Constraint<F> {
    pub fn handle(&self) -> &Handle {
        match self {
            Constraint::Vanishing { handle, .. }
            | Constraint::Range { handle, .. }
            | Constraint::Lookup { handle, .. }
            | Constraint::Permutation { handle, .. }
            | Constraint::Sorted { handle, .. }
            | Constraint::Interleaving { handle, .. }
            | Constraint::Assertion { handle, .. } => handle,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Constraint::Vanishing { .. } => "vanishing",
            Constraint::Range { .. } => "range",
            Constraint::Lookup { .. } => "lookup",
            Constraint::Permutation { .. } => "permutation",
            Constraint::Sorted { .. } => "sorted",
            Constraint::Interleaving { .. } => "interleaving",
            Constraint::Assertion { .. } => "assertion",
        }
    }
}

// ── Assignments ──

/// A computation that produces register values before constraints are
/// checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Assignment<F: PrimeField> {
    /// A native computation: `name` is one of the closed native catalogue.
    Computed {
        name: String,
        targets: Vec<RegisterRef>,
        sources: Vec<RegisterRef>,
    },
    Interleaving {
        target: RegisterRef,
        sources: Vec<RegisterRef>,
    },
    SortedPermutation {
        targets: Vec<RegisterRef>,
        signs: Vec<bool>,
        sources: Vec<RegisterRef>,
    },
    /// A column populated row-by-row from an expression over its module.
    ComputedColumn { target: RegisterRef, expr: Term<F> },
}

impl<F: PrimeField> Assignment<F> {
    pub fn targets(&self) -> Vec<RegisterRef> {
        match self {
            Assignment::Computed { targets, .. } => targets.clone(),
            Assignment::Interleaving { target, .. } => vec![*target],
            Assignment::SortedPermutation { targets, .. } => targets.clone(),
            Assignment::ComputedColumn { target, .. } => vec![*target],
        }
    }
}

// ── Modules and registers ──

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Register<F: PrimeField> {
    pub name: String,
    pub bit_width: usize,
    pub padding: F,
    pub computed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IrModule<F: PrimeField> {
    pub name: String,
    pub multiplier: usize,
    pub registers: Vec<Register<F>>,
    pub assignments: Vec<Assignment<F>>,
    pub constraints: Vec<Constraint<F>>,
}

impl<F: PrimeField> IrModule<F> {
    pub fn new(name: impl Into<String>, multiplier: usize) -> Self {
        IrModule {
            name: name.into(),
            multiplier,
            registers: Vec::new(),
            assignments: Vec::new(),
            constraints: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::Gf251;

    fn reg(module: usize, index: usize) -> Term<Gf251> {
        Term::Register {
            reg: RegisterRef { module, index },
            shift: 0,
        }
    }

    #[test]
    fn test_term_register_collection() {
        let t = Term::Sum(vec![
            reg(0, 0),
            Term::Product(vec![reg(0, 1), Term::Const(Gf251::from_u64(3))]),
        ]);
        let regs = t.registers();
        assert_eq!(regs.len(), 2);
        assert_eq!(regs[0].0.index, 0);
        assert_eq!(regs[1].0.index, 1);
    }

    #[test]
    fn test_constant_detection() {
        assert!(Term::<Gf251>::zero().is_constant());
        assert!(!reg(0, 0).is_constant());
        assert!(Term::Exponent(Box::new(Term::Const(Gf251::from_u64(2))), 8).is_constant());
    }

    #[test]
    fn test_handle_display() {
        assert_eq!(Handle::new("mem", "stamp").to_string(), "mem.stamp");
        assert_eq!(Handle::new("", "stamp").to_string(), "stamp");
    }
}
