//! Translation of the resolved, preprocessed AST into register-level IR.
//!
//! Every CDL module maps to one IR module per distinct length multiplier.
//! Arithmetic expressions lower to terms over registers and constants,
//! logical expressions to connective trees, and each declaration form
//! emits its assignments and constraints per its own rule.

use log::debug;
use num_bigint::BigInt;
use num_traits::{One, Signed, ToPrimitive, Zero};

use cdl_core::ir::{
    Assignment, Constraint, Handle, IrModule, LogicalTerm, LookupVector, Register, RegisterRef,
    Term,
};
use cdl_core::program::{ExternModule, MixedProgram};
use cdl_core::PrimeField;

use crate::compiler::ast::*;
use crate::compiler::errors::SyntaxError;
use crate::compiler::path::Path;
use crate::compiler::regalloc::RegisterMap;
use crate::compiler::scope::{Binding, BindingRef, ColumnKind, ScopeTree};
use crate::compiler::span::Span;
use crate::compiler::types::{join_all, meet_all, Type};

/// Lower a fully resolved and preprocessed AST.
pub fn lower<F: PrimeField>(
    ast: &Ast,
    tree: &ScopeTree,
    mut map: RegisterMap,
    externs: Vec<ExternModule>,
) -> (MixedProgram<F>, Vec<SyntaxError>) {
    let mut modules: Vec<IrModule<F>> = Vec::new();
    let extern_count = externs.len();
    let mut lowerer = Lowerer {
        tree,
        map: &mut map,
        externs: &externs,
        extern_count,
        modules: &mut modules,
        errors: Vec::new(),
    };
    lowerer.sync_modules();

    for module in &ast.modules {
        if module.condition.is_some() {
            lowerer
                .errors
                .push(SyntaxError::new(module.span, "conditional modules are not supported"));
            continue;
        }
        for decl in &module.declarations {
            lowerer.lower_declaration(decl, &module.name);
        }
    }
    lowerer.emit_prove_ranges();
    let errors = lowerer.errors;
    debug!(
        "lowered {} IR modules, {} errors",
        modules.len(),
        errors.len()
    );
    (MixedProgram::new(externs, modules), errors)
}

struct Lowerer<'a, F: PrimeField> {
    tree: &'a ScopeTree,
    map: &'a mut RegisterMap,
    externs: &'a [ExternModule],
    extern_count: usize,
    modules: &'a mut Vec<IrModule<F>>,
    errors: Vec<SyntaxError>,
}

impl<F: PrimeField> Lowerer<'_, F> {
    fn error(&mut self, span: Span, message: impl Into<String>) {
        self.errors.push(SyntaxError::new(span, message));
    }

    /// Keep one IR module per register family, in family order.
    fn sync_modules(&mut self) {
        while self.modules.len() < self.map.families.len() {
            let family = &self.map.families[self.modules.len()];
            let mut module = IrModule::new(family.ir_name(), family.multiplier);
            for (_, register) in self.map.family_registers(self.modules.len()) {
                module.registers.push(Register {
                    name: register.name.clone(),
                    bit_width: register.bit_width,
                    padding: F::zero(),
                    computed: register.computed,
                });
            }
            self.modules.push(module);
        }
    }

    /// Family index -> unified module id (externs come first).
    fn module_id(&self, family: usize) -> usize {
        self.extern_count + family
    }

    fn family_of_module(&mut self, module: &str) -> usize {
        let path = if module.is_empty() {
            Path::root()
        } else {
            Path::root().extend(module)
        };
        let family = self.map.ensure_family(path, 1);
        self.sync_modules();
        family
    }

    fn push_constraint(&mut self, family: usize, constraint: Constraint<F>) {
        self.modules[family].constraints.push(constraint);
    }

    fn push_assignment(&mut self, family: usize, assignment: Assignment<F>) {
        self.modules[family].assignments.push(assignment);
    }

    /// The register family a lowered body belongs to: the family of its
    /// registers, or the declaring module for constants-only bodies.
    fn context_of(&mut self, regs: &[(RegisterRef, isize)], module: &str, span: Span) -> usize {
        let mut family: Option<usize> = None;
        for (reg, _) in regs {
            if reg.module < self.extern_count {
                continue;
            }
            let f = reg.module - self.extern_count;
            match family {
                None => family = Some(f),
                Some(prev) if prev == f => {}
                Some(prev) => {
                    self.error(
                        span,
                        format!(
                            "conflicting context: {} does not agree with {}",
                            self.map.families[f].ir_name(),
                            self.map.families[prev].ir_name()
                        ),
                    );
                }
            }
        }
        match family {
            Some(f) => f,
            None => self.family_of_module(module),
        }
    }

    // ── Register access ──

    fn register_ref(&mut self, binding: BindingRef, array_index: Option<usize>, span: Span) -> Option<RegisterRef> {
        let Binding::Column(column) = self.tree.binding(binding) else {
            self.error(span, "invalid register access");
            return None;
        };
        if column.kind == ColumnKind::Extern {
            let module = self
                .externs
                .iter()
                .position(|e| Path::root().extend(&e.name) == column.context)?;
            let index = self.externs[module]
                .registers
                .iter()
                .position(|r| r.name == *column.path.name())?;
            return Some(RegisterRef { module, index });
        }
        let Some(register) = self.map.register_of(binding, array_index) else {
            self.error(span, "invalid register access");
            return None;
        };
        Some(RegisterRef {
            module: self.module_id(self.map.registers()[register].family),
            index: self.map.index_in_family(register),
        })
    }

    fn column_register(&mut self, scope_name: &str, name: &str, span: Span) -> Option<RegisterRef> {
        let scope = self.tree.module_scope(scope_name)?;
        let found = self
            .tree
            .resolve(scope, &Path::parse(name), crate::compiler::scope::Namespace::Symbols)?;
        self.register_ref(found, None, span)
    }

    // ── Arithmetic lowering ──

    fn term_of(&mut self, e: &Expr, shift: isize) -> Option<Term<F>> {
        match e {
            Expr::Const(n, _) => Some(Term::Const(F::from_bigint(n))),
            Expr::Symbol {
                binding: Some(found),
                span,
                ..
            } => match self.tree.binding(*found).clone() {
                Binding::Column(column) => {
                    if column.array.is_some() {
                        self.error(*span, "invalid register access: array column needs an index");
                        return None;
                    }
                    let reg = self.register_ref(*found, None, *span)?;
                    Some(Term::Register { reg, shift })
                }
                Binding::Constant(constant) => {
                    let value = constant.value.clone()?;
                    let element = F::from_bigint(&value);
                    if constant.is_extern {
                        Some(Term::LabelledConst {
                            label: constant.path.to_string(),
                            value: element,
                        })
                    } else {
                        Some(Term::Const(element))
                    }
                }
                _ => {
                    self.error(*span, "invalid register access");
                    None
                }
            },
            // Unresolved symbols were reported during resolution.
            Expr::Symbol { .. } => None,
            Expr::ArrayAccess { base, index, span } => {
                let Expr::Symbol {
                    binding: Some(found),
                    ..
                } = base.as_ref()
                else {
                    self.error(base.span(), "invalid register access");
                    return None;
                };
                let Binding::Column(column) = self.tree.binding(*found).clone() else {
                    self.error(base.span(), "invalid register access");
                    return None;
                };
                let Some((lo, hi)) = column.array else {
                    self.error(*span, "invalid register access: not an array column");
                    return None;
                };
                let Some(i) = self.const_value(index).and_then(|v| v.to_usize()) else {
                    self.error(index.span(), "expected constant array index");
                    return None;
                };
                if i < lo || i > hi {
                    self.error(
                        *span,
                        format!("array index out-of-bounds: {} not in [{}:{}]", i, lo, hi),
                    );
                    return None;
                }
                let reg = self.register_ref(*found, Some(i), *span)?;
                Some(Term::Register { reg, shift })
            }
            Expr::Funcall { op, args, .. } => {
                let terms: Option<Vec<Term<F>>> =
                    args.iter().map(|a| self.term_of(a, shift)).collect();
                let terms = terms?;
                Some(match op {
                    ArithOp::Add => Term::Sum(terms),
                    ArithOp::Sub => Term::Subtract(terms),
                    ArithOp::Mul => Term::Product(terms),
                })
            }
            Expr::Exponent { base, exponent, span } => {
                let base = self.term_of(base, shift)?;
                let Some(power) = self.const_value(exponent).and_then(|v| v.to_u64()) else {
                    self.error(*span, "expected constant exponent");
                    return None;
                };
                Some(Term::Exponent(Box::new(base), power))
            }
            Expr::Normalise(inner, _) => {
                Some(Term::Normalise(Box::new(self.term_of(inner, shift)?)))
            }
            Expr::Shift { body, offset, span } => {
                let Some(delta) = self.const_value(offset).and_then(|v| v.to_isize()) else {
                    self.error(*span, "expected constant shift amount");
                    return None;
                };
                self.term_of(body, shift + delta)
            }
            Expr::Cast {
                body,
                ty,
                unchecked,
                ..
            } => {
                let inner = self.term_of(body, shift)?;
                if *unchecked {
                    let bits = match ty.kind {
                        TypeExprKind::Uint(n) => n,
                        TypeExprKind::Bool => 1,
                    };
                    Some(Term::CastOf(Box::new(inner), bits))
                } else {
                    // Safe casts are checked during resolution and erased
                    // here.
                    Some(inner)
                }
            }
            Expr::Concat { limbs, .. } => {
                let mut parts = Vec::new();
                let mut offset = 0usize;
                for limb in limbs.iter().rev() {
                    let Some(width) = self.type_of(limb).and_then(|t| t.bit_width()) else {
                        self.error(limb.span(), "fixed-width type required");
                        return None;
                    };
                    let term = self.term_of(limb, shift)?;
                    if offset == 0 {
                        parts.push(term);
                    } else {
                        let factor = BigInt::one() << offset;
                        parts.push(Term::Product(vec![
                            Term::Const(F::from_bigint(&factor)),
                            term,
                        ]));
                    }
                    offset += width;
                }
                parts.reverse();
                Some(Term::Sum(parts))
            }
            Expr::If { span, .. } => {
                self.error(*span, "conditionals are only supported in logical position");
                None
            }
            Expr::List(_, span)
            | Expr::Equation { span, .. }
            | Expr::Connective { span, .. } => {
                self.error(*span, "expected arithmetic expression");
                None
            }
            Expr::Not(_, span) => {
                self.error(*span, "expected arithmetic expression");
                None
            }
            Expr::LocalVariable { span, .. } => {
                self.error(*span, "invalid register access");
                None
            }
            Expr::For { .. }
            | Expr::Let { .. }
            | Expr::Reduce { .. }
            | Expr::Invoke { .. }
            | Expr::Debug(..) => {
                unreachable!("preprocessing leaves no sugar nodes")
            }
        }
    }

    // ── Logical lowering ──

    /// `None` is a void constraint: nothing to enforce.
    fn logical_of(&mut self, e: &Expr) -> Option<Option<LogicalTerm<F>>> {
        match e {
            Expr::List(items, _) => {
                let mut parts = Vec::new();
                for item in items {
                    if let Some(part) = self.logical_of(item)? {
                        parts.push(part);
                    }
                }
                Some(match parts.len() {
                    0 => None,
                    1 => Some(parts.into_iter().next().expect("length checked")),
                    _ => Some(LogicalTerm::Conjunction(parts)),
                })
            }
            Expr::Equation {
                kind, left, right, ..
            } => {
                let l = self.term_of(left, 0)?;
                let r = self.term_of(right, 0)?;
                Some(Some(match kind {
                    EquationKind::Eq => LogicalTerm::Equals(l, r),
                    EquationKind::Neq => LogicalTerm::NotEquals(l, r),
                    EquationKind::Lt => LogicalTerm::LessThan(l, r),
                    EquationKind::Le => LogicalTerm::LessThanOrEqual(l, r),
                    EquationKind::Gt => LogicalTerm::GreaterThan(l, r),
                    EquationKind::Ge => LogicalTerm::GreaterThanOrEqual(l, r),
                }))
            }
            Expr::Not(inner, _) => {
                let inner = self.logical_of(inner)?;
                Some(inner.map(|t| LogicalTerm::Negation(Box::new(t))))
            }
            Expr::Connective { kind, args, .. } => {
                let mut parts = Vec::new();
                for a in args {
                    if let Some(part) = self.logical_of(a)? {
                        parts.push(part);
                    }
                }
                Some(Some(match kind {
                    ConnectiveKind::And => LogicalTerm::Conjunction(parts),
                    ConnectiveKind::Or => LogicalTerm::Disjunction(parts),
                }))
            }
            Expr::If {
                condition,
                then_branch,
                else_branch,
                semantics,
                ..
            } => {
                let cond = self.condition_of(condition, *semantics)?;
                let then_branch = self.logical_of(then_branch)?;
                let else_branch = match else_branch {
                    Some(b) => self.logical_of(b)?,
                    None => None,
                };
                if then_branch.is_none() && else_branch.is_none() {
                    return Some(None);
                }
                Some(Some(LogicalTerm::IfThenElse {
                    condition: Box::new(cond),
                    then_branch: then_branch.map(Box::new),
                    else_branch: else_branch.map(Box::new),
                }))
            }
            // An arithmetic expression in logical position vanishes.
            _ => {
                let term = self.term_of(e, 0)?;
                Some(Some(LogicalTerm::Vanishes(term)))
            }
        }
    }

    /// A condition reads per its fixed semantics: loobean conditions hold
    /// when the term is zero, boolean conditions are logical themselves.
    fn condition_of(
        &mut self,
        condition: &Expr,
        semantics: Option<ConditionSemantics>,
    ) -> Option<LogicalTerm<F>> {
        match semantics {
            Some(ConditionSemantics::Loobean) => {
                let term = self.term_of(condition, 0)?;
                Some(LogicalTerm::Vanishes(term))
            }
            _ => self.logical_of(condition)?,
        }
    }

    // ── Declaration emission ──

    fn lower_declaration(&mut self, decl: &Declaration, module: &str) {
        match decl {
            Declaration::Constraint(c) => self.lower_constraint(c, module),
            Declaration::Property(p) => self.lower_property(p, module),
            Declaration::InRange(r) => self.lower_inrange(r, module),
            Declaration::Lookup(l) => self.lower_lookup(l, module),
            Declaration::Permutation(p) => {
                self.lower_permutation(p, module);
            }
            Declaration::Sorted(s) => {
                self.lower_sorted(s, module);
            }
            Declaration::Interleaved(i) => {
                self.lower_interleaved(i, module);
            }
            Declaration::Computed(c) => {
                self.lower_computed(c, module);
            }
            Declaration::ComputedColumn(c) => self.lower_computed_column(c, module),
            // No IR of their own.
            Declaration::Columns(_)
            | Declaration::Const(_)
            | Declaration::Fun(_)
            | Declaration::Aliases(_)
            | Declaration::Perspective(_) => {}
        }
    }

    fn lower_constraint(&mut self, c: &DefConstraint, module: &str) {
        let Some(body) = self.logical_of(&c.body) else {
            return;
        };
        let Some(mut body) = body else {
            return; // void body: nothing to emit
        };
        // The constraint only binds where its guard is non-zero.
        if let Some(guard) = &c.guard {
            let Some(guard_term) = self.term_of(guard, 0) else {
                return;
            };
            body = LogicalTerm::IfThenElse {
                condition: Box::new(LogicalTerm::Vanishes(guard_term)),
                then_branch: None,
                else_branch: Some(Box::new(body)),
            };
        }
        // And, inside a perspective, only where the selector is non-zero.
        if let Some(perspective) = &c.perspective {
            let Some(selector) = self.perspective_selector(module, perspective) else {
                return;
            };
            let Some(selector_term) = self.term_of(&selector, 0) else {
                return;
            };
            body = LogicalTerm::IfThenElse {
                condition: Box::new(LogicalTerm::Vanishes(selector_term)),
                then_branch: None,
                else_branch: Some(Box::new(body)),
            };
        }
        let family = self.context_of(&body.registers(), module, c.span);
        let constraint = Constraint::Vanishing {
            handle: Handle::new(module, &c.name),
            module: self.module_id(family),
            domain: c.domain.clone(),
            body,
        };
        self.push_constraint(family, constraint);
    }

    fn perspective_selector(&mut self, module: &str, perspective: &str) -> Option<Expr> {
        let scope = self.tree.module_scope(module)?;
        let persp_scope = self.tree.enter(scope, perspective)?;
        self.tree.scope(persp_scope).selector.clone()
    }

    fn lower_property(&mut self, p: &DefProperty, module: &str) {
        let Some(Some(body)) = self.logical_of(&p.body) else {
            return;
        };
        let family = self.context_of(&body.registers(), module, p.span);
        let constraint = Constraint::Assertion {
            handle: Handle::new(module, &p.name),
            module: self.module_id(family),
            domain: None,
            body,
        };
        self.push_constraint(family, constraint);
    }

    fn lower_inrange(&mut self, r: &DefInRange, module: &str) {
        let Some(term) = self.term_of(&r.expr, 0) else {
            return;
        };
        if is_signed(&term) {
            self.error(r.span, "signed term where unsigned expected");
            return;
        }
        let Some(bitwidth) = exact_log2(&r.bound) else {
            return; // already reported by the resolver
        };
        let family = self.context_of(&term.registers(), module, r.span);
        let constraint = Constraint::Range {
            handle: Handle::new(module, ""),
            module: self.module_id(family),
            expr: term,
            bitwidth,
        };
        self.push_constraint(family, constraint);
    }

    fn lower_lookup_half(&mut self, half: &LookupHalf) -> Option<LookupVector<F>> {
        let selector = match &half.selector {
            Some(s) => {
                let term = self.term_of(s, 0)?;
                if is_signed(&term) {
                    self.error(s.span(), "signed selector");
                    return None;
                }
                let width = self.type_of(s).and_then(|t| t.bit_width());
                if width.map(|w| w > 1).unwrap_or(true) {
                    self.error(s.span(), "non-binary selector");
                    return None;
                }
                Some(term)
            }
            None => None,
        };
        let mut terms = Vec::new();
        for e in &half.exprs {
            let term = self.term_of(e, 0)?;
            if is_signed(&term) {
                self.error(e.span(), "signed term where unsigned expected");
                return None;
            }
            terms.push(term);
        }
        Some(LookupVector { selector, terms })
    }

    fn lower_lookup(&mut self, l: &DefLookup, module: &str) {
        let Some(targets) = self.lower_lookup_half(&l.targets) else {
            return;
        };
        let mut sources = Vec::new();
        for half in &l.sources {
            let Some(vector) = self.lower_lookup_half(half) else {
                return;
            };
            // Limb decompositions of source and target widths must align
            // under the field's limb width.
            for (src, tgt) in half.exprs.iter().zip(&l.targets.exprs) {
                let src_width = self.type_of(src).and_then(|t| t.bit_width());
                let tgt_width = self.type_of(tgt).and_then(|t| t.bit_width());
                if let (Some(sw), Some(tw)) = (src_width, tgt_width) {
                    match irregular_side(sw, tw, F::LIMB_WIDTH) {
                        Some(IrregularSide::Source) => {
                            self.error(src.span(), "irregular lookup detected");
                            return;
                        }
                        Some(IrregularSide::Target) => {
                            self.error(tgt.span(), "irregular lookup detected");
                            return;
                        }
                        None => {}
                    }
                }
            }
            sources.push(vector);
        }
        let regs: Vec<(RegisterRef, isize)> = targets
            .terms
            .iter()
            .flat_map(|t| t.registers())
            .map(|r| (r.0, r.1))
            .collect();
        let family = self.context_of(&regs, module, l.span);
        let constraint = Constraint::Lookup {
            handle: Handle::new(module, &l.name),
            targets,
            sources,
        };
        self.push_constraint(family, constraint);
    }

    fn lower_permutation(&mut self, p: &DefPermutation, module: &str) -> Option<()> {
        let mut sources = Vec::new();
        for s in &p.sources {
            sources.push(self.column_register(module, &s.column, s.span)?);
        }
        let mut targets = Vec::new();
        for t in &p.targets {
            targets.push(self.column_register(module, t, p.span)?);
        }
        let signs: Vec<bool> = p
            .sources
            .iter()
            .map(|s| s.sign != Some(SortSign::Descending))
            .collect();
        let family = self.context_of(
            &sources.iter().map(|&r| (r, 0)).collect::<Vec<_>>(),
            module,
            p.span,
        );
        let handle = Handle::new(module, permutation_handle(&p.targets));
        self.push_assignment(
            family,
            Assignment::SortedPermutation {
                targets: targets.clone(),
                signs: signs.clone(),
                sources: sources.clone(),
            },
        );
        self.push_constraint(
            family,
            Constraint::Permutation {
                handle: handle.clone(),
                targets: targets.clone(),
                sources,
                signs: signs.clone(),
            },
        );
        // The targets themselves are sorted rows.
        let bitwidth = self.registers_width(&targets);
        self.push_constraint(
            family,
            Constraint::Sorted {
                handle,
                module: self.module_id(family),
                bitwidth,
                selector: None,
                sources: targets
                    .into_iter()
                    .map(|reg| Term::Register { reg, shift: 0 })
                    .collect(),
                signs,
                strict: false,
            },
        );
        Some(())
    }

    fn registers_width(&self, registers: &[RegisterRef]) -> usize {
        registers
            .iter()
            .filter_map(|r| {
                r.module
                    .checked_sub(self.extern_count)
                    .and_then(|f| {
                        self.map
                            .family_registers(f)
                            .nth(r.index)
                            .map(|(_, reg)| reg.bit_width)
                    })
            })
            .max()
            .unwrap_or(0)
    }

    fn lower_sorted(&mut self, s: &DefSorted, module: &str) -> Option<()> {
        let mut registers = Vec::new();
        for src in &s.sources {
            registers.push(self.column_register(module, &src.column, src.span)?);
        }
        let selector = match &s.selector {
            Some(e) => Some(self.term_of(e, 0)?),
            None => None,
        };
        let signs: Vec<bool> = s
            .sources
            .iter()
            .map(|src| src.sign != Some(SortSign::Descending))
            .collect();
        let family = self.context_of(
            &registers.iter().map(|&r| (r, 0)).collect::<Vec<_>>(),
            module,
            s.span,
        );
        let bitwidth = self.registers_width(&registers);
        let constraint = Constraint::Sorted {
            handle: Handle::new(
                module,
                s.sources
                    .iter()
                    .map(|c| c.column.as_str())
                    .collect::<Vec<_>>()
                    .join("_"),
            ),
            module: self.module_id(family),
            bitwidth,
            selector,
            sources: registers
                .into_iter()
                .map(|reg| Term::Register { reg, shift: 0 })
                .collect(),
            signs,
            strict: s.strict,
        };
        self.push_constraint(family, constraint);
        Some(())
    }

    fn lower_interleaved(&mut self, i: &DefInterleaved, module: &str) -> Option<()> {
        let target = self.column_register(module, &i.target, i.span)?;
        let mut sources = Vec::new();
        for s in &i.sources {
            sources.push(self.column_register(module, s, i.span)?);
        }
        // The interleaved column lives in the multiplied family; the
        // assignment and the constraint both land there.
        let family = target.module - self.extern_count;
        self.push_assignment(
            family,
            Assignment::Interleaving {
                target,
                sources: sources.clone(),
            },
        );
        self.push_constraint(
            family,
            Constraint::Interleaving {
                handle: Handle::new(module, &i.target),
                target,
                sources,
            },
        );
        Some(())
    }

    fn lower_computed(&mut self, c: &DefComputed, module: &str) -> Option<()> {
        let mut targets = Vec::new();
        for t in &c.targets {
            targets.push(self.column_register(module, t, c.span)?);
        }
        let mut sources = Vec::new();
        for s in &c.sources {
            sources.push(self.column_register(module, s, c.span)?);
        }
        let &first = targets.first()?;
        let family = first.module - self.extern_count;
        self.push_assignment(
            family,
            Assignment::Computed {
                name: c.function.clone(),
                targets,
                sources,
            },
        );
        Some(())
    }

    fn lower_computed_column(&mut self, c: &DefComputedColumn, module: &str) {
        let Some(target) = self.column_register(module, &c.target.name, c.span) else {
            return;
        };
        let Some(term) = self.term_of(&c.body, 0) else {
            return;
        };
        let family = target.module - self.extern_count;
        // Padding rows take the body's value over all-zero registers.
        let padding = eval_at_zero(&term);
        self.modules[family].registers[target.index].padding = padding;
        self.push_assignment(
            family,
            Assignment::ComputedColumn {
                target,
                expr: term.clone(),
            },
        );
        self.push_constraint(
            family,
            Constraint::Vanishing {
                handle: Handle::new(module, &c.target.name),
                module: self.module_id(family),
                domain: None,
                body: LogicalTerm::Equals(Term::Register { reg: target, shift: 0 }, term),
            },
        );
    }

    /// One range constraint per register carrying a `@prove` source.
    fn emit_prove_ranges(&mut self) {
        let mut pending = Vec::new();
        for (register_index, register) in self.map.registers().iter().enumerate() {
            if !register.must_prove {
                continue;
            }
            let family = register.family;
            let reg = RegisterRef {
                module: self.module_id(family),
                index: self.map.index_in_family(register_index),
            };
            pending.push((
                family,
                Constraint::Range {
                    handle: Handle::new(self.map.families[family].ir_name(), &register.name),
                    module: self.module_id(family),
                    expr: Term::Register { reg, shift: 0 },
                    bitwidth: register.bit_width,
                },
            ));
        }
        for (family, constraint) in pending {
            self.push_constraint(family, constraint);
        }
    }

    // ── Constant folding ──

    /// The numeric value of a resolved expression over literals,
    /// finalised constants and arithmetic. Must fold everything the
    /// resolver's constancy checks fold.
    fn const_value(&self, e: &Expr) -> Option<BigInt> {
        match e {
            Expr::Const(n, _) => Some(n.clone()),
            Expr::Symbol {
                binding: Some(found),
                ..
            } => match self.tree.binding(*found) {
                Binding::Constant(c) => c.value.clone(),
                _ => None,
            },
            Expr::Funcall { op, args, .. } => {
                let values: Option<Vec<BigInt>> =
                    args.iter().map(|a| self.const_value(a)).collect();
                let values = values?;
                let mut it = values.into_iter();
                let first = it.next()?;
                Some(match op {
                    ArithOp::Add => it.fold(first, |a, b| a + b),
                    ArithOp::Mul => it.fold(first, |a, b| a * b),
                    ArithOp::Sub => {
                        let mut acc = first;
                        let mut any = false;
                        for v in it {
                            acc -= v;
                            any = true;
                        }
                        if any {
                            acc
                        } else {
                            -acc
                        }
                    }
                })
            }
            Expr::Exponent { base, exponent, .. } => {
                let base = self.const_value(base)?;
                let exponent = self.const_value(exponent)?.to_u32()?;
                Some(base.pow(exponent))
            }
            Expr::Normalise(inner, _) => {
                let v = self.const_value(inner)?;
                Some(if v.is_zero() {
                    BigInt::zero()
                } else {
                    BigInt::one()
                })
            }
            Expr::Cast { body, .. } => self.const_value(body),
            _ => None,
        }
    }

    // ── Types of resolved expressions ──

    /// Post-resolution type reconstruction, used for limb alignment and
    /// selector checks.
    fn type_of(&self, e: &Expr) -> Option<Type> {
        match e {
            Expr::Const(n, _) => Some(Type::of_constant(n)),
            Expr::Symbol {
                binding: Some(found),
                ..
            } => match self.tree.binding(*found) {
                Binding::Column(c) => Some(c.ty.clone()),
                Binding::Constant(c) => match (&c.ty, &c.value) {
                    (Some(ty), _) => Some(ty.clone()),
                    (None, Some(v)) => Some(Type::of_constant(v)),
                    (None, None) => None,
                },
                _ => None,
            },
            Expr::ArrayAccess { base, .. } => match self.type_of(base)? {
                Type::Array { element, .. } => Some(*element),
                other => Some(other),
            },
            Expr::Funcall { op, args, .. } => {
                let tys: Option<Vec<Type>> = args.iter().map(|a| self.type_of(a)).collect();
                let tys = tys?;
                match op {
                    ArithOp::Add | ArithOp::Sub => join_all(tys.iter()),
                    ArithOp::Mul => meet_all(tys.iter()),
                }
            }
            Expr::Exponent { base, .. } => self.type_of(base),
            Expr::Normalise(..) => Some(Type::Uint(1)),
            Expr::Shift { body, .. } => self.type_of(body),
            Expr::If {
                then_branch,
                else_branch,
                ..
            } => {
                let then_ty = self.type_of(then_branch)?;
                match else_branch {
                    Some(e) => then_ty.lub(&self.type_of(e)?),
                    None => Some(then_ty),
                }
            }
            Expr::Cast { ty, .. } => Some(Type::from_expr(ty)),
            Expr::Concat { limbs, .. } => {
                let mut total = 0;
                for l in limbs {
                    total += self.type_of(l)?.bit_width()?;
                }
                Some(Type::Uint(total))
            }
            Expr::Equation { .. } | Expr::Not(..) | Expr::Connective { .. } => Some(Type::Bool),
            _ => None,
        }
    }
}

/// A deterministic handle for unnamed permutations.
fn permutation_handle(targets: &[String]) -> String {
    targets.join("_")
}

/// A term is signed when subtraction may take it below zero.
fn is_signed<F: PrimeField>(term: &Term<F>) -> bool {
    match term {
        Term::Const(_) | Term::LabelledConst { .. } | Term::Register { .. } => false,
        Term::Subtract(_) => true,
        Term::Sum(ts) | Term::Product(ts) => ts.iter().any(is_signed),
        Term::Exponent(t, _) | Term::Normalise(t) | Term::CastOf(t, _) => is_signed(t),
    }
}

/// `Some(k)` when `n == 2^k`.
fn exact_log2(n: &BigInt) -> Option<usize> {
    if n.is_positive() && (n & (n - BigInt::one())).is_zero() {
        Some(n.bits() as usize - 1)
    } else {
        None
    }
}

/// Evaluate a term with every register reading zero, for padding rows.
fn eval_at_zero<F: PrimeField>(term: &Term<F>) -> F {
    fn eval<F: PrimeField>(term: &Term<F>) -> BigInt {
        match term {
            Term::Const(v) | Term::LabelledConst { value: v, .. } => {
                BigInt::from_biguint(num_bigint::Sign::Plus, v.to_biguint())
            }
            Term::Register { .. } => BigInt::zero(),
            Term::Sum(ts) => ts.iter().map(eval::<F>).sum(),
            Term::Product(ts) => ts.iter().map(eval::<F>).product(),
            Term::Subtract(ts) => {
                let mut it = ts.iter();
                let first = it.next().map(eval::<F>).unwrap_or_default();
                if ts.len() == 1 {
                    -first
                } else {
                    it.fold(first, |a, t| a - eval::<F>(t))
                }
            }
            Term::Exponent(t, k) => eval::<F>(t).pow(*k as u32),
            Term::Normalise(t) => {
                if eval::<F>(t).is_zero() {
                    BigInt::zero()
                } else {
                    BigInt::one()
                }
            }
            Term::CastOf(t, _) => eval::<F>(t),
        }
    }
    F::from_bigint(&eval(term))
}

// ── Limb alignment ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IrregularSide {
    Source,
    Target,
}

/// Split a bit width into limbs of `limb_width`, least significant
/// first; the final limb may be narrower.
fn decompose(mut bits: usize, limb_width: usize) -> Vec<usize> {
    let mut limbs = Vec::new();
    while bits > limb_width {
        limbs.push(limb_width);
        bits -= limb_width;
    }
    limbs.push(bits);
    limbs
}

/// A lookup pairing is irregular when the limb decompositions of the two
/// widths misalign: any limb but the shared final one differing in width
/// is irregular on the wider side.
fn irregular_side(src_bits: usize, tgt_bits: usize, limb_width: usize) -> Option<IrregularSide> {
    let src = decompose(src_bits, limb_width);
    let tgt = decompose(tgt_bits, limb_width);
    let n = src.len().max(tgt.len());
    for i in 0..n {
        let sw = src.get(i).copied().unwrap_or(0);
        let tw = tgt.get(i).copied().unwrap_or(0);
        if sw == tw {
            continue;
        }
        if i + 1 == src.len() && i + 1 == tgt.len() {
            continue; // the shared most-significant limb may differ
        }
        return Some(if sw > tw {
            IrregularSide::Source
        } else {
            IrregularSide::Target
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decompose() {
        assert_eq!(decompose(8, 8), vec![8]);
        assert_eq!(decompose(16, 8), vec![8, 8]);
        assert_eq!(decompose(12, 8), vec![8, 4]);
        assert_eq!(decompose(4, 8), vec![4]);
    }

    #[test]
    fn test_irregular_detection() {
        // u8 into u16 under 8-bit limbs: the target has a limb the
        // source cannot match.
        assert_eq!(irregular_side(8, 16, 8), Some(IrregularSide::Target));
        assert_eq!(irregular_side(16, 8, 8), Some(IrregularSide::Source));
        // Same shapes align.
        assert_eq!(irregular_side(8, 8, 8), None);
        // The shared final limb may differ in width.
        assert_eq!(irregular_side(12, 16, 8), None);
        assert_eq!(irregular_side(4, 8, 8), None);
    }

    #[test]
    fn test_exact_log2() {
        assert_eq!(exact_log2(&BigInt::from(256)), Some(8));
        assert_eq!(exact_log2(&BigInt::from(255)), None);
        assert_eq!(exact_log2(&BigInt::from(2)), Some(1));
    }

    #[test]
    fn test_signed_terms() {
        use cdl_core::field::Gf251;
        let sub: Term<Gf251> = Term::Subtract(vec![Term::zero(), Term::zero()]);
        assert!(is_signed(&sub));
        assert!(is_signed(&Term::Sum(vec![sub.clone()])));
        assert!(!is_signed::<Gf251>(&Term::zero()));
    }
}
