//! Syntactic-sugar discharge: `for`, `let`, `invoke`, `reduce` and
//! `debug` are rewritten away, bottom-up, before translation.
//!
//! Substitution targets local-variable indices, which are unique within a
//! declaration's scope chain, and the node spliced in inherits the span
//! of the node it replaces. Void (a stripped `debug` or an empty
//! expansion) is modelled as `None` and is only legal where a list can
//! absorb it; a run over already-preprocessed output is a no-op.

use num_bigint::BigInt;
use num_traits::One;

use crate::compiler::ast::*;
use crate::compiler::errors::SyntaxError;
use crate::compiler::scope::{Binding, FunctionImpl, ScopeTree};
use crate::compiler::span::Span;

/// Rewrite every translated expression of the AST in place.
pub fn preprocess_ast(ast: &mut Ast, tree: &mut ScopeTree, debug: bool) -> Vec<SyntaxError> {
    let mut pre = Preprocessor {
        tree,
        debug,
        errors: Vec::new(),
    };
    for module in &mut ast.modules {
        for decl in &mut module.declarations {
            pre.preprocess_declaration(decl, &module.name);
        }
    }
    pre.errors
}

struct Preprocessor<'a> {
    tree: &'a mut ScopeTree,
    debug: bool,
    errors: Vec<SyntaxError>,
}

impl Preprocessor<'_> {
    fn error(&mut self, span: Span, message: impl Into<String>) {
        self.errors.push(SyntaxError::new(span, message));
    }

    fn preprocess_declaration(&mut self, decl: &mut Declaration, module: &str) {
        match decl {
            Declaration::Constraint(c) => {
                if let Some(guard) = &mut c.guard {
                    self.preprocess_required(guard);
                }
                // A body voided by debug-stripping becomes the empty
                // list, which the translator elides.
                let span = c.body.span();
                c.body = self
                    .preprocess(&c.body)
                    .ok()
                    .flatten()
                    .unwrap_or(Expr::List(Vec::new(), span));
            }
            Declaration::Property(p) => {
                let span = p.body.span();
                p.body = self
                    .preprocess(&p.body)
                    .ok()
                    .flatten()
                    .unwrap_or(Expr::List(Vec::new(), span));
            }
            Declaration::InRange(r) => self.preprocess_required(&mut r.expr),
            Declaration::Lookup(l) => {
                for half in std::iter::once(&mut l.targets).chain(l.sources.iter_mut()) {
                    if let Some(selector) = &mut half.selector {
                        self.preprocess_required(selector);
                    }
                    for e in &mut half.exprs {
                        self.preprocess_required(e);
                    }
                }
            }
            Declaration::Sorted(s) => {
                if let Some(selector) = &mut s.selector {
                    self.preprocess_required(selector);
                }
            }
            Declaration::ComputedColumn(c) => self.preprocess_required(&mut c.body),
            Declaration::Perspective(p) => {
                self.preprocess_required(&mut p.selector);
                // The virtual scope holds the selector the translator
                // wraps constraints with; keep it in step.
                if let Some(module_scope) = self.tree.module_scope(module) {
                    if let Some(scope) = self.tree.enter(module_scope, &p.name) {
                        self.tree.set_selector(scope, p.selector.clone());
                    }
                }
            }
            // Function bodies are expanded at their call sites; columns,
            // constants, aliases and column-wiring forms carry no
            // translated expressions.
            Declaration::Columns(_)
            | Declaration::Const(_)
            | Declaration::Fun(_)
            | Declaration::Aliases(_)
            | Declaration::Permutation(_)
            | Declaration::Interleaved(_)
            | Declaration::Computed(_) => {}
        }
    }

    /// Preprocess an expression that must not end up void.
    fn preprocess_required(&mut self, e: &mut Expr) {
        match self.preprocess(e) {
            Ok(Some(out)) => *e = out,
            Ok(None) => self.error(e.span(), "void expression not allowed here"),
            Err(()) => {}
        }
    }

    /// `Ok(None)` is a void expression: stripped debug or an empty
    /// expansion.
    fn preprocess(&mut self, e: &Expr) -> Result<Option<Expr>, ()> {
        match e {
            Expr::Const(..) | Expr::Symbol { .. } | Expr::LocalVariable { .. } => {
                Ok(Some(e.clone()))
            }
            Expr::ArrayAccess { base, index, span } => {
                let base = self.required(base)?;
                let index = self.required(index)?;
                Ok(Some(Expr::ArrayAccess {
                    base: Box::new(base),
                    index: Box::new(index),
                    span: *span,
                }))
            }
            Expr::Funcall { op, args, span } => {
                let args = self.required_all(args)?;
                Ok(Some(Expr::Funcall {
                    op: *op,
                    args,
                    span: *span,
                }))
            }
            Expr::Exponent { base, exponent, span } => Ok(Some(Expr::Exponent {
                base: Box::new(self.required(base)?),
                exponent: Box::new(self.required(exponent)?),
                span: *span,
            })),
            Expr::Normalise(inner, span) => {
                Ok(Some(Expr::Normalise(Box::new(self.required(inner)?), *span)))
            }
            Expr::Shift { body, offset, span } => Ok(Some(Expr::Shift {
                body: Box::new(self.required(body)?),
                offset: Box::new(self.required(offset)?),
                span: *span,
            })),
            Expr::If {
                condition,
                then_branch,
                else_branch,
                semantics,
                span,
            } => {
                let condition = self.required(condition)?;
                let then_out = self.preprocess(then_branch)?;
                let else_out = match else_branch {
                    Some(b) => self.preprocess(b)?,
                    None => None,
                };
                // Both branches stripped: the whole conditional is void.
                if then_out.is_none() && else_out.is_none() {
                    return Ok(None);
                }
                // A stripped branch becomes the empty list, which lowers
                // to an absent branch.
                let then_branch = then_out.unwrap_or(Expr::List(Vec::new(), *span));
                Ok(Some(Expr::If {
                    condition: Box::new(condition),
                    then_branch: Box::new(then_branch),
                    else_branch: else_out.map(Box::new),
                    semantics: *semantics,
                    span: *span,
                }))
            }
            Expr::List(items, span) => {
                // Void elements are stripped from list contexts.
                let mut kept = Vec::new();
                for item in items {
                    if let Some(out) = self.preprocess(item)? {
                        kept.push(out);
                    }
                }
                Ok(Some(Expr::List(kept, *span)))
            }
            Expr::For {
                local,
                range,
                body,
                span,
                ..
            } => {
                let index = (*local).ok_or(())?;
                let (lo, hi) = range.clone();
                let mut items = Vec::new();
                let mut i = lo;
                while i <= hi {
                    let instance =
                        substitute(body, index, &Expr::Const(i.clone(), body.span()));
                    if let Some(out) = self.preprocess(&instance)? {
                        items.push(out);
                    }
                    i += BigInt::one();
                }
                if items.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(Expr::List(items, *span)))
                }
            }
            Expr::Let {
                bindings, body, ..
            } => {
                let mut body = (**body).clone();
                let mut rest: Vec<(usize, Expr)> = Vec::new();
                for (_, local, value) in bindings {
                    let index = (*local).ok_or(())?;
                    let value_span = value.span();
                    let mut value = value.clone();
                    // Earlier bindings substitute into later values.
                    for (idx, v) in &rest {
                        value = substitute(&value, *idx, v);
                    }
                    let Some(value) = self.preprocess(&value)? else {
                        self.error(value_span, "void expression not allowed here");
                        return Err(());
                    };
                    rest.push((index, value));
                }
                for (idx, v) in &rest {
                    body = substitute(&body, *idx, v);
                }
                self.preprocess(&body)
            }
            Expr::Reduce {
                fun,
                list,
                signature,
                span,
            } => {
                let list = self.required(list)?;
                let Expr::List(items, _) = list else {
                    self.error(*span, "reduce expects a literal list");
                    return Err(());
                };
                if items.is_empty() {
                    self.error(*span, "reduce of an empty list");
                    return Err(());
                }
                let mut acc = items[0].clone();
                for item in &items[1..] {
                    acc = self.expand_call(fun, *signature, vec![acc, item.clone()], *span)?;
                }
                self.preprocess(&acc)
            }
            Expr::Invoke {
                fun,
                args,
                signature,
                span,
            } => {
                let args = self.required_all(args)?;
                let expansion = self.expand_call(fun, *signature, args, *span)?;
                self.preprocess(&expansion)
            }
            Expr::Equation {
                kind,
                left,
                right,
                span,
            } => Ok(Some(Expr::Equation {
                kind: *kind,
                left: Box::new(self.required(left)?),
                right: Box::new(self.required(right)?),
                span: *span,
            })),
            Expr::Not(inner, span) => {
                Ok(Some(Expr::Not(Box::new(self.required(inner)?), *span)))
            }
            Expr::Connective { kind, args, span } => Ok(Some(Expr::Connective {
                kind: *kind,
                args: self.required_all(args)?,
                span: *span,
            })),
            Expr::Cast {
                body,
                ty,
                unchecked,
                span,
            } => Ok(Some(Expr::Cast {
                body: Box::new(self.required(body)?),
                ty: ty.clone(),
                unchecked: *unchecked,
                span: *span,
            })),
            Expr::Concat { limbs, span } => Ok(Some(Expr::Concat {
                limbs: self.required_all(limbs)?,
                span: *span,
            })),
            Expr::Debug(items, span) => {
                if !self.debug {
                    return Ok(None);
                }
                let mut kept = Vec::new();
                for item in items {
                    if let Some(out) = self.preprocess(item)? {
                        kept.push(out);
                    }
                }
                match kept.len() {
                    0 => Ok(None),
                    1 => Ok(Some(kept.into_iter().next().expect("length checked"))),
                    _ => Ok(Some(Expr::List(kept, *span))),
                }
            }
        }
    }

    fn required(&mut self, e: &Expr) -> Result<Expr, ()> {
        match self.preprocess(e)? {
            Some(out) => Ok(out),
            None => {
                self.error(e.span(), "void expression not allowed here");
                Err(())
            }
        }
    }

    fn required_all(&mut self, exprs: &[Expr]) -> Result<Vec<Expr>, ()> {
        exprs.iter().map(|e| self.required(e)).collect()
    }

    /// Inline one call: intrinsics construct their n-ary body, defined
    /// functions substitute arguments into their resolved body.
    fn expand_call(
        &mut self,
        fun: &Expr,
        signature: Option<usize>,
        args: Vec<Expr>,
        span: Span,
    ) -> Result<Expr, ()> {
        let Expr::Symbol {
            binding: Some(found),
            path,
            ..
        } = fun
        else {
            // Resolution already reported the unresolved callee.
            return Err(());
        };
        let Binding::Function(f) = self.tree.binding(*found) else {
            return Err(());
        };
        let Some(sig) = signature.and_then(|i| f.signatures.get(i)) else {
            return Err(());
        };
        match &sig.body {
            FunctionImpl::Intrinsic(op) => Ok(op.build(args, span)),
            FunctionImpl::Defined(body) => {
                let mut out = body.clone();
                for (i, arg) in args.iter().enumerate() {
                    out = substitute(&out, i, arg);
                }
                Ok(out)
            }
            FunctionImpl::Native(_) => {
                self.error(
                    span,
                    format!("native computation '{}' is not allowed in an expression", path),
                );
                Err(())
            }
        }
    }
}

/// Replace every occurrence of local variable `index` with `value`. The
/// spliced-in copy takes over the span of the reference it replaces.
pub fn substitute(e: &Expr, index: usize, value: &Expr) -> Expr {
    match e {
        Expr::LocalVariable { index: i, span, .. } if *i == index => {
            with_span(value.clone(), *span)
        }
        Expr::Const(..) | Expr::Symbol { .. } | Expr::LocalVariable { .. } => e.clone(),
        Expr::ArrayAccess { base, index: idx, span } => Expr::ArrayAccess {
            base: Box::new(substitute(base, index, value)),
            index: Box::new(substitute(idx, index, value)),
            span: *span,
        },
        Expr::Funcall { op, args, span } => Expr::Funcall {
            op: *op,
            args: args.iter().map(|a| substitute(a, index, value)).collect(),
            span: *span,
        },
        Expr::Exponent { base, exponent, span } => Expr::Exponent {
            base: Box::new(substitute(base, index, value)),
            exponent: Box::new(substitute(exponent, index, value)),
            span: *span,
        },
        Expr::Normalise(inner, span) => {
            Expr::Normalise(Box::new(substitute(inner, index, value)), *span)
        }
        Expr::Shift { body, offset, span } => Expr::Shift {
            body: Box::new(substitute(body, index, value)),
            offset: Box::new(substitute(offset, index, value)),
            span: *span,
        },
        Expr::If {
            condition,
            then_branch,
            else_branch,
            semantics,
            span,
        } => Expr::If {
            condition: Box::new(substitute(condition, index, value)),
            then_branch: Box::new(substitute(then_branch, index, value)),
            else_branch: else_branch
                .as_ref()
                .map(|b| Box::new(substitute(b, index, value))),
            semantics: *semantics,
            span: *span,
        },
        Expr::List(items, span) => Expr::List(
            items.iter().map(|i| substitute(i, index, value)).collect(),
            *span,
        ),
        Expr::For {
            index: name,
            local,
            range,
            body,
            span,
        } => Expr::For {
            index: name.clone(),
            local: *local,
            range: range.clone(),
            body: Box::new(substitute(body, index, value)),
            span: *span,
        },
        Expr::Let {
            bindings,
            body,
            span,
        } => Expr::Let {
            bindings: bindings
                .iter()
                .map(|(n, l, v)| (n.clone(), *l, substitute(v, index, value)))
                .collect(),
            body: Box::new(substitute(body, index, value)),
            span: *span,
        },
        Expr::Reduce {
            fun,
            list,
            signature,
            span,
        } => Expr::Reduce {
            fun: fun.clone(),
            list: Box::new(substitute(list, index, value)),
            signature: *signature,
            span: *span,
        },
        Expr::Invoke {
            fun,
            args,
            signature,
            span,
        } => Expr::Invoke {
            fun: fun.clone(),
            args: args.iter().map(|a| substitute(a, index, value)).collect(),
            signature: *signature,
            span: *span,
        },
        Expr::Equation {
            kind,
            left,
            right,
            span,
        } => Expr::Equation {
            kind: *kind,
            left: Box::new(substitute(left, index, value)),
            right: Box::new(substitute(right, index, value)),
            span: *span,
        },
        Expr::Not(inner, span) => Expr::Not(Box::new(substitute(inner, index, value)), *span),
        Expr::Connective { kind, args, span } => Expr::Connective {
            kind: *kind,
            args: args.iter().map(|a| substitute(a, index, value)).collect(),
            span: *span,
        },
        Expr::Cast {
            body,
            ty,
            unchecked,
            span,
        } => Expr::Cast {
            body: Box::new(substitute(body, index, value)),
            ty: ty.clone(),
            unchecked: *unchecked,
            span: *span,
        },
        Expr::Concat { limbs, span } => Expr::Concat {
            limbs: limbs.iter().map(|l| substitute(l, index, value)).collect(),
            span: *span,
        },
        Expr::Debug(items, span) => Expr::Debug(
            items.iter().map(|i| substitute(i, index, value)).collect(),
            *span,
        ),
    }
}

/// The top node of a substituted expression inherits the span of the
/// node it replaced.
fn with_span(mut e: Expr, span: Span) -> Expr {
    match &mut e {
        Expr::Const(_, s)
        | Expr::Normalise(_, s)
        | Expr::List(_, s)
        | Expr::Not(_, s)
        | Expr::Debug(_, s) => *s = span,
        Expr::Symbol { span: s, .. }
        | Expr::LocalVariable { span: s, .. }
        | Expr::ArrayAccess { span: s, .. }
        | Expr::Funcall { span: s, .. }
        | Expr::Exponent { span: s, .. }
        | Expr::Shift { span: s, .. }
        | Expr::If { span: s, .. }
        | Expr::For { span: s, .. }
        | Expr::Let { span: s, .. }
        | Expr::Reduce { span: s, .. }
        | Expr::Invoke { span: s, .. }
        | Expr::Equation { span: s, .. }
        | Expr::Connective { span: s, .. }
        | Expr::Cast { span: s, .. }
        | Expr::Concat { span: s, .. } => *s = span,
    }
    e
}
