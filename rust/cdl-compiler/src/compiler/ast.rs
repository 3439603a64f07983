//! Typed AST for CDL declarations and expressions.
//!
//! Every node embeds the span of the S-expression it was parsed from;
//! nodes produced by substitution inherit the span of the node they
//! replace.

use num_bigint::BigInt;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::compiler::path::Path;
use crate::compiler::scope::BindingRef;
use crate::compiler::span::Span;

/// A compilation unit: all modules of all source files, aggregated and
/// ordered lexicographically by module name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ast {
    pub modules: Vec<Module>,
}

/// One logical module, possibly assembled from fragments across files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub condition: Option<Expr>,
    pub declarations: Vec<Declaration>,
    pub span: Span,
}

// ── Types ──

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeExpr {
    pub kind: TypeExprKind,
    pub must_prove: bool,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeExprKind {
    Uint(usize),
    Bool,
}

/// Rendering hint carried through to the register table.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum DisplayHint {
    Dec,
    Hex,
    Bytes,
    Opcode,
}

// ── Declarations ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Declaration {
    Columns(DefColumns),
    Const(DefConst),
    Fun(DefFun),
    Aliases(DefAliases),
    Constraint(DefConstraint),
    Property(DefProperty),
    InRange(DefInRange),
    Lookup(DefLookup),
    Permutation(DefPermutation),
    Sorted(DefSorted),
    Interleaved(DefInterleaved),
    Perspective(DefPerspective),
    Computed(DefComputed),
    ComputedColumn(DefComputedColumn),
}

impl Declaration {
    pub fn span(&self) -> Span {
        match self {
            Declaration::Columns(d) => d.span,
            Declaration::Const(d) => d.span,
            Declaration::Fun(d) => d.span,
            Declaration::Aliases(d) => d.span,
            Declaration::Constraint(d) => d.span,
            Declaration::Property(d) => d.span,
            Declaration::InRange(d) => d.span,
            Declaration::Lookup(d) => d.span,
            Declaration::Permutation(d) => d.span,
            Declaration::Sorted(d) => d.span,
            Declaration::Interleaved(d) => d.span,
            Declaration::Perspective(d) => d.span,
            Declaration::Computed(d) => d.span,
            Declaration::ComputedColumn(d) => d.span,
        }
    }

    /// Short label used when attributing resolution failures.
    pub fn describe(&self) -> String {
        match self {
            Declaration::Columns(_) => "defcolumns".to_string(),
            Declaration::Const(_) => "defconst".to_string(),
            Declaration::Fun(d) => format!("defun {}", d.name),
            Declaration::Aliases(_) => "defalias".to_string(),
            Declaration::Constraint(d) => format!("defconstraint {}", d.name),
            Declaration::Property(d) => format!("defproperty {}", d.name),
            Declaration::InRange(_) => "definrange".to_string(),
            Declaration::Lookup(d) => format!("deflookup {}", d.name),
            Declaration::Permutation(_) => "defpermutation".to_string(),
            Declaration::Sorted(d) => {
                if d.strict {
                    "defstrictsorted".to_string()
                } else {
                    "defsorted".to_string()
                }
            }
            Declaration::Interleaved(d) => format!("definterleaved {}", d.target),
            Declaration::Perspective(d) => format!("defperspective {}", d.name),
            Declaration::Computed(_) => "defcomputed".to_string(),
            Declaration::ComputedColumn(d) => format!("defcomputedcolumn {}", d.target.name),
        }
    }
}

/// A single column declaration inside `defcolumns` or a perspective.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDecl {
    pub name: String,
    pub ty: Option<TypeExpr>,
    /// Inclusive index range for array columns.
    pub array: Option<(usize, usize)>,
    pub multiplier: usize,
    pub display: Option<DisplayHint>,
    pub span: Span,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefColumns {
    pub columns: Vec<ColumnDecl>,
    pub span: Span,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstDecl {
    pub name: String,
    pub ty: Option<TypeExpr>,
    /// Extern constants keep their name through lowering instead of being
    /// inlined as bare field elements.
    pub is_extern: bool,
    pub value: Expr,
    pub span: Span,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefConst {
    pub constants: Vec<ConstDecl>,
    pub span: Span,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub ty: Option<TypeExpr>,
    pub span: Span,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefFun {
    pub name: String,
    pub params: Vec<Param>,
    pub ret: Option<TypeExpr>,
    pub body: Expr,
    pub pure: bool,
    pub span: Span,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AliasDecl {
    pub alias: String,
    pub target: String,
    pub span: Span,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefAliases {
    pub aliases: Vec<AliasDecl>,
    /// True for `defunalias`: aliases in the function namespace.
    pub functions: bool,
    pub span: Span,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefConstraint {
    pub name: String,
    pub guard: Option<Expr>,
    pub domain: Option<Vec<isize>>,
    pub perspective: Option<String>,
    pub body: Expr,
    pub span: Span,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefProperty {
    pub name: String,
    pub body: Expr,
    pub span: Span,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefInRange {
    pub expr: Expr,
    pub bound: BigInt,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LookupKind {
    Plain,
    Conditional,
    Multi,
}

/// One side of a lookup: an optional selector and a tuple of expressions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupHalf {
    pub selector: Option<Expr>,
    pub exprs: Vec<Expr>,
    pub span: Span,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefLookup {
    pub name: String,
    pub kind: LookupKind,
    pub targets: LookupHalf,
    pub sources: Vec<LookupHalf>,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortSign {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermutationSource {
    pub sign: Option<SortSign>,
    pub column: String,
    pub span: Span,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefPermutation {
    pub targets: Vec<String>,
    pub sources: Vec<PermutationSource>,
    pub span: Span,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefSorted {
    pub sources: Vec<PermutationSource>,
    pub selector: Option<Expr>,
    pub strict: bool,
    pub span: Span,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefInterleaved {
    pub target: String,
    pub sources: Vec<String>,
    pub span: Span,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefPerspective {
    pub name: String,
    pub selector: Expr,
    pub columns: Vec<ColumnDecl>,
    pub span: Span,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefComputed {
    pub targets: Vec<String>,
    pub function: String,
    pub sources: Vec<String>,
    pub span: Span,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefComputedColumn {
    pub target: ColumnDecl,
    pub body: Expr,
    pub span: Span,
}

// ── Expressions ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum ArithOp {
    #[strum(serialize = "+")]
    Add,
    #[strum(serialize = "-")]
    Sub,
    #[strum(serialize = "*")]
    Mul,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum EquationKind {
    #[strum(serialize = "=")]
    Eq,
    #[strum(serialize = "!=")]
    Neq,
    #[strum(serialize = "<")]
    Lt,
    #[strum(serialize = "<=")]
    Le,
    #[strum(serialize = ">")]
    Gt,
    #[strum(serialize = ">=")]
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectiveKind {
    And,
    Or,
}

/// How the condition of an `if` is read: loobean conditions hold when the
/// value is zero, boolean conditions when it is non-zero. Fixed by the
/// type checker during resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionSemantics {
    Loobean,
    Boolean,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Const(BigInt, Span),
    Symbol {
        path: Path,
        binding: Option<BindingRef>,
        span: Span,
    },
    /// A function parameter, `for` index, or `let` name, rewritten from a
    /// symbol during resolution. Indices are unique within one
    /// declaration's local scope chain.
    LocalVariable {
        index: usize,
        name: String,
        span: Span,
    },
    ArrayAccess {
        base: Box<Expr>,
        index: Box<Expr>,
        span: Span,
    },
    Funcall {
        op: ArithOp,
        args: Vec<Expr>,
        span: Span,
    },
    Exponent {
        base: Box<Expr>,
        exponent: Box<Expr>,
        span: Span,
    },
    /// `~x`: 0 if x is 0, 1 otherwise.
    Normalise(Box<Expr>, Span),
    Shift {
        body: Box<Expr>,
        offset: Box<Expr>,
        span: Span,
    },
    If {
        condition: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Option<Box<Expr>>,
        semantics: Option<ConditionSemantics>,
        span: Span,
    },
    List(Vec<Expr>, Span),
    For {
        index: String,
        /// Local index assigned during resolution.
        local: Option<usize>,
        range: (BigInt, BigInt),
        body: Box<Expr>,
        span: Span,
    },
    Let {
        bindings: Vec<(String, Option<usize>, Expr)>,
        body: Box<Expr>,
        span: Span,
    },
    Reduce {
        fun: Box<Expr>,
        list: Box<Expr>,
        /// Overload chosen during resolution.
        signature: Option<usize>,
        span: Span,
    },
    Invoke {
        fun: Box<Expr>,
        args: Vec<Expr>,
        /// Overload chosen during resolution.
        signature: Option<usize>,
        span: Span,
    },
    Equation {
        kind: EquationKind,
        left: Box<Expr>,
        right: Box<Expr>,
        span: Span,
    },
    Not(Box<Expr>, Span),
    Connective {
        kind: ConnectiveKind,
        args: Vec<Expr>,
        span: Span,
    },
    Cast {
        body: Box<Expr>,
        ty: TypeExpr,
        unchecked: bool,
        span: Span,
    },
    /// Big-endian limb concatenation.
    Concat {
        limbs: Vec<Expr>,
        span: Span,
    },
    Debug(Vec<Expr>, Span),
}

impl Expr {
    pub fn span(&self) -> Span {
        match self {
            Expr::Const(_, s)
            | Expr::Normalise(_, s)
            | Expr::List(_, s)
            | Expr::Not(_, s)
            | Expr::Debug(_, s) => *s,
            Expr::Symbol { span, .. }
            | Expr::LocalVariable { span, .. }
            | Expr::ArrayAccess { span, .. }
            | Expr::Funcall { span, .. }
            | Expr::Exponent { span, .. }
            | Expr::Shift { span, .. }
            | Expr::If { span, .. }
            | Expr::For { span, .. }
            | Expr::Let { span, .. }
            | Expr::Reduce { span, .. }
            | Expr::Invoke { span, .. }
            | Expr::Equation { span, .. }
            | Expr::Connective { span, .. }
            | Expr::Cast { span, .. }
            | Expr::Concat { span, .. } => *span,
        }
    }

    pub fn constant(value: impl Into<BigInt>, span: Span) -> Expr {
        Expr::Const(value.into(), span)
    }

    pub fn symbol(path: Path, span: Span) -> Expr {
        Expr::Symbol {
            path,
            binding: None,
            span,
        }
    }

    /// The constant value of this expression, if it is a literal.
    pub fn as_const(&self) -> Option<&BigInt> {
        match self {
            Expr::Const(n, _) => Some(n),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_hint_round_trip() {
        assert_eq!(DisplayHint::Hex.to_string(), "hex");
        assert_eq!("bytes".parse::<DisplayHint>().unwrap(), DisplayHint::Bytes);
    }

    #[test]
    fn test_expr_span_inheritance() {
        let s = Span::dummy();
        let e = Expr::Funcall {
            op: ArithOp::Add,
            args: vec![Expr::constant(1, s), Expr::constant(2, s)],
            span: s,
        };
        assert_eq!(e.span(), s);
    }

    #[test]
    fn test_arith_op_display() {
        assert_eq!(ArithOp::Add.to_string(), "+");
        assert_eq!(EquationKind::Le.to_string(), "<=");
    }
}
