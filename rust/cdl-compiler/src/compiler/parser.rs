//! S-expression tree to AST.
//!
//! The head symbol of each top-level form selects a declaration parser; a
//! rule table maps expression head symbols to constructors, and unknown
//! heads fall back to `Invoke`. Parsing validates shape and arity only;
//! no symbol is resolved and nothing is type-checked here. All failures
//! accumulate as spanned syntax errors; parsing one bad declaration never
//! stops the next.

use num_bigint::BigInt;
use num_traits::ToPrimitive;
use std::collections::BTreeMap;

use crate::compiler::ast::*;
use crate::compiler::errors::SyntaxError;
use crate::compiler::path::Path;
use crate::compiler::sexp::{Reader, Sexp};
use crate::compiler::span::{SourceMap, Span};

/// Parse every file of the source map into one aggregated [`Ast`].
pub fn parse_source_files(sources: &SourceMap) -> (Ast, Vec<SyntaxError>) {
    let mut parser = Parser::new();
    for (id, file) in sources.files() {
        match Reader::new(&file.text, id).read_all() {
            Ok(forms) => parser.parse_file(&forms),
            Err(e) => parser.errors.push(e),
        }
    }
    parser.finish()
}

struct ModuleBuilder {
    condition: Option<Expr>,
    /// Canonical rendering of the condition form, for conflict checks
    /// across fragments.
    condition_text: Option<String>,
    declarations: Vec<Declaration>,
    span: Span,
}

pub struct Parser {
    modules: BTreeMap<String, ModuleBuilder>,
    current: String,
    pub errors: Vec<SyntaxError>,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        let mut modules = BTreeMap::new();
        // The implicit prelude module.
        modules.insert(
            String::new(),
            ModuleBuilder {
                condition: None,
                condition_text: None,
                declarations: Vec::new(),
                span: Span::dummy(),
            },
        );
        Parser {
            modules,
            current: String::new(),
            errors: Vec::new(),
        }
    }

    /// Modules ordered lexicographically, prelude first.
    pub fn finish(self) -> (Ast, Vec<SyntaxError>) {
        let modules = self
            .modules
            .into_iter()
            .map(|(name, b)| Module {
                name,
                condition: b.condition,
                declarations: b.declarations,
                span: b.span,
            })
            .collect();
        (Ast { modules }, self.errors)
    }

    pub fn parse_file(&mut self, forms: &[Sexp]) {
        // Each file starts back in the prelude.
        self.current = String::new();
        for form in forms {
            self.parse_toplevel(form);
        }
    }

    fn error(&mut self, span: Span, message: impl Into<String>) {
        self.errors.push(SyntaxError::new(span, message));
    }

    fn parse_toplevel(&mut self, form: &Sexp) {
        let Sexp::List(items, span) = form else {
            self.error(form.span(), "malformed declaration: expected list");
            return;
        };
        let Some(head) = items.first().and_then(Sexp::as_symbol) else {
            self.error(*span, "malformed declaration: missing head symbol");
            return;
        };
        let operands = &items[1..];
        let declaration = match head {
            "module" => {
                self.parse_module_marker(operands, *span);
                return;
            }
            "defcolumns" => self.parse_defcolumns(operands, *span),
            "defconst" => self.parse_defconst(operands, *span),
            "defun" => self.parse_defun(operands, *span, false),
            "defpurefun" => self.parse_defun(operands, *span, true),
            "defalias" => self.parse_defalias(operands, *span, false),
            "defunalias" => self.parse_defalias(operands, *span, true),
            "defconstraint" => self.parse_defconstraint(operands, *span),
            "defproperty" => self.parse_defproperty(operands, *span),
            "definrange" => self.parse_definrange(operands, *span),
            "deflookup" => self.parse_deflookup(operands, *span),
            "defclookup" => self.parse_defclookup(operands, *span),
            "defmlookup" => self.parse_defmlookup(operands, *span),
            "defpermutation" => self.parse_defpermutation(operands, *span),
            "defsorted" => self.parse_defsorted(operands, *span, false),
            "defstrictsorted" => self.parse_defsorted(operands, *span, true),
            "definterleaved" => self.parse_definterleaved(operands, *span),
            "defperspective" => self.parse_defperspective(operands, *span),
            "defcomputed" => self.parse_defcomputed(operands, *span),
            "defcomputedcolumn" => self.parse_defcomputedcolumn(operands, *span),
            other => {
                self.error(*span, format!("unknown declaration '{}'", other));
                return;
            }
        };
        if let Some(d) = declaration {
            self.modules
                .get_mut(&self.current)
                .expect("current module always exists")
                .declarations
                .push(d);
        }
    }

    // ── Module markers ──

    fn parse_module_marker(&mut self, operands: &[Sexp], span: Span) {
        if operands.is_empty() || operands.len() > 2 {
            self.error(span, "malformed module declaration");
            return;
        }
        let Some(name) = operands[0].as_symbol() else {
            self.error(operands[0].span(), "invalid module name");
            return;
        };
        if !is_valid_identifier(name) {
            self.error(operands[0].span(), format!("invalid identifier '{}'", name));
            return;
        }
        let (condition, condition_text) = match operands.get(1) {
            Some(c) => (self.parse_expr(c), Some(c.to_string())),
            None => (None, None),
        };
        if operands.len() == 2 && condition.is_none() {
            return; // expression error already recorded
        }
        let name = name.to_string();
        match self.modules.get_mut(&name) {
            Some(existing) => {
                // One logical module may be fragmented across files, but
                // its condition must agree everywhere it is stated.
                if let Some(cond) = condition {
                    match &existing.condition_text {
                        None => {
                            existing.condition = Some(cond);
                            existing.condition_text = condition_text;
                        }
                        Some(prev) if Some(prev) == condition_text.as_ref() => {}
                        Some(_) => {
                            self.error(span, format!("conflicting module conditions for '{}'", name))
                        }
                    }
                }
            }
            None => {
                self.modules.insert(
                    name.clone(),
                    ModuleBuilder {
                        condition,
                        condition_text,
                        declarations: Vec::new(),
                        span,
                    },
                );
            }
        }
        self.current = name;
    }

    // ── Columns ──

    fn parse_defcolumns(&mut self, operands: &[Sexp], span: Span) -> Option<Declaration> {
        if operands.is_empty() {
            self.error(span, "malformed declaration: defcolumns expects columns");
            return None;
        }
        let mut columns = Vec::new();
        for item in operands {
            if let Some(c) = self.parse_column_decl(item) {
                columns.push(c);
            }
        }
        Some(Declaration::Columns(DefColumns { columns, span }))
    }

    /// A column is a bare identifier or a list `(name :attrs…)`.
    fn parse_column_decl(&mut self, item: &Sexp) -> Option<ColumnDecl> {
        match item {
            Sexp::Symbol(name, span) => {
                self.check_identifier(name, *span)?;
                Some(ColumnDecl {
                    name: name.clone(),
                    ty: None,
                    array: None,
                    multiplier: 1,
                    display: None,
                    span: *span,
                })
            }
            Sexp::List(items, span) => {
                let Some(Sexp::Symbol(name, name_span)) = items.first() else {
                    self.error(*span, "invalid handle: expected column name");
                    return None;
                };
                self.check_identifier(name, *name_span)?;
                let mut decl = ColumnDecl {
                    name: name.clone(),
                    ty: None,
                    array: None,
                    multiplier: 1,
                    display: None,
                    span: *span,
                };
                let mut rest = items[1..].iter();
                while let Some(attr) = rest.next() {
                    let Some(tag) = attr.as_symbol() else {
                        self.error(attr.span(), "malformed attribute");
                        continue;
                    };
                    match tag {
                        ":display" => match rest.next().and_then(Sexp::as_symbol) {
                            Some(h) => match h.trim_start_matches(':').parse::<DisplayHint>() {
                                Ok(hint) => decl.display = Some(hint),
                                Err(_) => {
                                    self.error(attr.span(), format!("unknown display hint '{}'", h))
                                }
                            },
                            None => self.error(attr.span(), ":display expects a hint"),
                        },
                        ":array" => match rest.next() {
                            Some(r) => decl.array = self.parse_index_range(r),
                            None => self.error(attr.span(), ":array expects a range"),
                        },
                        ":multiplier" => {
                            let value = rest
                                .next()
                                .and_then(Sexp::as_number)
                                .and_then(BigInt::to_usize)
                                .filter(|&m| m >= 1);
                            match value {
                                Some(m) => decl.multiplier = m,
                                None => self
                                    .error(attr.span(), ":multiplier expects a positive integer"),
                            }
                        }
                        tag if tag.starts_with(':') => {
                            if let Some(ty) = self.parse_type_tag(tag, attr.span()) {
                                decl.ty = Some(ty);
                            }
                        }
                        other => self.error(attr.span(), format!("unknown modifier '{}'", other)),
                    }
                }
                Some(decl)
            }
            other => {
                self.error(other.span(), "malformed declaration: invalid column");
                None
            }
        }
    }

    /// `:i128`, `:u64`, `:byte`, `:binary`, `:bool`, optionally suffixed
    /// with `@prove`.
    fn parse_type_tag(&mut self, tag: &str, span: Span) -> Option<TypeExpr> {
        let body = tag.trim_start_matches(':');
        let (base, suffix) = match body.split_once('@') {
            Some((b, s)) => (b, Some(s)),
            None => (body, None),
        };
        let must_prove = match suffix {
            None => false,
            Some("prove") => true,
            Some(other) => {
                self.error(span, format!("unknown modifier '@{}'", other));
                return None;
            }
        };
        let kind = match base {
            "bool" | "loob" => TypeExprKind::Bool,
            "byte" => TypeExprKind::Uint(8),
            "binary" => TypeExprKind::Uint(1),
            _ => {
                let (head, digits) = base.split_at(1.min(base.len()));
                match (head, digits.parse::<usize>()) {
                    ("i", Ok(n)) | ("u", Ok(n)) if n >= 1 => TypeExprKind::Uint(n),
                    _ => {
                        self.error(span, format!("malformed attribute ':{}'", body));
                        return None;
                    }
                }
            }
        };
        Some(TypeExpr {
            kind,
            must_prove,
            span,
        })
    }

    /// `[n]` (meaning `[1:n]`) or `[lo:hi]`, without ordering checks.
    fn parse_range_bounds(&mut self, sexp: &Sexp) -> Option<(usize, usize)> {
        let Sexp::Array(items, span) = sexp else {
            self.error(sexp.span(), "malformed attribute: expected index range");
            return None;
        };
        let parsed = match &items[..] {
            [n] => n.as_number().and_then(BigInt::to_usize).map(|n| (1, n)),
            [lo, hi] => {
                // `[1:3]` reads as the numeral 1 followed by the keyword
                // symbol `:3`.
                let lo = lo.as_number().and_then(BigInt::to_usize);
                let hi = hi
                    .as_symbol()
                    .and_then(|s| s.strip_prefix(':'))
                    .and_then(|s| s.parse::<usize>().ok());
                lo.zip(hi)
            }
            [lo, colon, hi] if colon.as_symbol() == Some(":") => {
                let lo = lo.as_number().and_then(BigInt::to_usize);
                let hi = hi.as_number().and_then(BigInt::to_usize);
                lo.zip(hi)
            }
            _ => None,
        };
        if parsed.is_none() {
            self.error(*span, "malformed attribute: invalid index range");
        }
        parsed
    }

    /// An `:array` range must be non-empty.
    fn parse_index_range(&mut self, sexp: &Sexp) -> Option<(usize, usize)> {
        let (lo, hi) = self.parse_range_bounds(sexp)?;
        if lo <= hi {
            Some((lo, hi))
        } else {
            self.error(sexp.span(), "malformed attribute: invalid index range");
            None
        }
    }

    // ── Constants ──

    /// `(defconst A 3 (B :i8) (+ A 1) …)`: name/value pairs, names
    /// optionally typed.
    fn parse_defconst(&mut self, operands: &[Sexp], span: Span) -> Option<Declaration> {
        if operands.is_empty() || operands.len() % 2 != 0 {
            self.error(span, "malformed declaration: defconst expects name/value pairs");
            return None;
        }
        let mut constants = Vec::new();
        for pair in operands.chunks(2) {
            let (name, ty, is_extern, name_span) = match &pair[0] {
                Sexp::Symbol(n, s) => (n.clone(), None, false, *s),
                Sexp::List(items, s) => {
                    let Some(Sexp::Symbol(n, _)) = items.first() else {
                        self.error(*s, "invalid handle: expected constant name");
                        continue;
                    };
                    let mut ty = None;
                    let mut is_extern = false;
                    for attr in &items[1..] {
                        match attr.as_symbol() {
                            Some(":extern") => is_extern = true,
                            Some(tag) if tag.starts_with(':') => {
                                if let Some(t) = self.parse_type_tag(tag, attr.span()) {
                                    ty = Some(t);
                                }
                            }
                            _ => self.error(attr.span(), "malformed attribute"),
                        }
                    }
                    (n.clone(), ty, is_extern, *s)
                }
                other => {
                    self.error(other.span(), "invalid handle: expected constant name");
                    continue;
                }
            };
            if self.check_identifier(&name, name_span).is_none() {
                continue;
            }
            if let Some(value) = self.parse_expr(&pair[1]) {
                constants.push(ConstDecl {
                    name,
                    ty,
                    is_extern,
                    value,
                    span: name_span.merge(pair[1].span()),
                });
            }
        }
        Some(Declaration::Const(DefConst { constants, span }))
    }

    // ── Functions ──

    /// `(defun (name params…) body)`; the name slot is a bare symbol or
    /// `(name :rettype)`; each param is a bare symbol or `(name :type)`.
    fn parse_defun(&mut self, operands: &[Sexp], span: Span, pure: bool) -> Option<Declaration> {
        let [signature, body] = operands else {
            self.error(span, "malformed declaration: defun expects signature and body");
            return None;
        };
        let Sexp::List(sig_items, sig_span) = signature else {
            self.error(signature.span(), "expected list: function signature");
            return None;
        };
        let Some((name_slot, param_slots)) = sig_items.split_first() else {
            self.error(*sig_span, "invalid handle: empty function signature");
            return None;
        };
        let (name, ret) = match name_slot {
            Sexp::Symbol(n, s) => {
                self.check_function_identifier(n, *s)?;
                (n.clone(), None)
            }
            Sexp::List(items, s) => match items.as_slice() {
                [Sexp::Symbol(n, ns), Sexp::Symbol(tag, tag_span)] => {
                    self.check_function_identifier(n, *ns)?;
                    (n.clone(), self.parse_type_tag(tag, *tag_span))
                }
                _ => {
                    self.error(*s, "invalid handle: expected function name");
                    return None;
                }
            },
            other => {
                self.error(other.span(), "invalid handle: expected function name");
                return None;
            }
        };
        let mut params = Vec::new();
        for slot in param_slots {
            match slot {
                Sexp::Symbol(n, s) => {
                    let _ = self.check_identifier(n, *s);
                    params.push(Param {
                        name: n.clone(),
                        ty: None,
                        span: *s,
                    });
                }
                Sexp::List(items, s) => match items.as_slice() {
                    [Sexp::Symbol(n, ns), Sexp::Symbol(tag, tag_span)] => {
                        let _ = self.check_identifier(n, *ns);
                        params.push(Param {
                            name: n.clone(),
                            ty: self.parse_type_tag(tag, *tag_span),
                            span: *s,
                        });
                    }
                    _ => self.error(*s, "malformed declaration: invalid parameter"),
                },
                other => self.error(other.span(), "malformed declaration: invalid parameter"),
            }
        }
        let body = self.parse_expr(body)?;
        Some(Declaration::Fun(DefFun {
            name,
            params,
            ret,
            body,
            pure,
            span,
        }))
    }

    fn parse_defalias(&mut self, operands: &[Sexp], span: Span, functions: bool) -> Option<Declaration> {
        if operands.is_empty() || operands.len() % 2 != 0 {
            self.error(span, "malformed declaration: defalias expects alias/target pairs");
            return None;
        }
        let mut aliases = Vec::new();
        for pair in operands.chunks(2) {
            match (pair[0].as_symbol(), pair[1].as_symbol()) {
                (Some(alias), Some(target)) => aliases.push(AliasDecl {
                    alias: alias.to_string(),
                    target: target.to_string(),
                    span: pair[0].span().merge(pair[1].span()),
                }),
                _ => self.error(
                    pair[0].span().merge(pair[1].span()),
                    "malformed declaration: alias expects two symbols",
                ),
            }
        }
        Some(Declaration::Aliases(DefAliases {
            aliases,
            functions,
            span,
        }))
    }

    // ── Constraints ──

    /// `(defconstraint handle (attrs…) body)`, attrs being `:guard e`,
    /// `:domain {n}` and `:perspective p`.
    fn parse_defconstraint(&mut self, operands: &[Sexp], span: Span) -> Option<Declaration> {
        let [handle, attrs, body] = operands else {
            self.error(span, "malformed declaration: defconstraint expects handle, attributes, body");
            return None;
        };
        let Some(name) = handle.as_symbol() else {
            self.error(handle.span(), "invalid handle");
            return None;
        };
        self.check_identifier(name, handle.span())?;
        let Sexp::List(attr_items, _) = attrs else {
            self.error(attrs.span(), "expected list: constraint attributes");
            return None;
        };
        let mut guard = None;
        let mut domain = None;
        let mut perspective = None;
        let mut rest = attr_items.iter();
        while let Some(attr) = rest.next() {
            match attr.as_symbol() {
                Some(":guard") => match rest.next() {
                    Some(e) => guard = self.parse_expr(e),
                    None => self.error(attr.span(), ":guard expects an expression"),
                },
                Some(":domain") => match rest.next() {
                    Some(d) => domain = self.parse_domain(d),
                    None => self.error(attr.span(), ":domain expects a set literal"),
                },
                Some(":perspective") => match rest.next().and_then(Sexp::as_symbol) {
                    Some(p) => perspective = Some(p.to_string()),
                    None => self.error(attr.span(), ":perspective expects a name"),
                },
                _ => self.error(attr.span(), "malformed attribute"),
            }
        }
        let body = self.parse_expr(body)?;
        Some(Declaration::Constraint(DefConstraint {
            name: name.to_string(),
            guard,
            domain,
            perspective,
            body,
            span,
        }))
    }

    /// A domain is a set literal holding a single integer.
    fn parse_domain(&mut self, sexp: &Sexp) -> Option<Vec<isize>> {
        match sexp {
            Sexp::Set(items, span) => match items.as_slice() {
                [n] => match n.as_number().and_then(BigInt::to_isize) {
                    Some(v) => Some(vec![v]),
                    None => {
                        self.error(*span, "malformed attribute: domain expects an integer");
                        None
                    }
                },
                _ => {
                    self.error(*span, "malformed attribute: domain expects a single integer");
                    None
                }
            },
            other => {
                self.error(other.span(), "malformed attribute: expected set literal");
                None
            }
        }
    }

    fn parse_defproperty(&mut self, operands: &[Sexp], span: Span) -> Option<Declaration> {
        let [handle, body] = operands else {
            self.error(span, "malformed declaration: defproperty expects handle and body");
            return None;
        };
        let name = self.expect_handle(handle)?;
        let body = self.parse_expr(body)?;
        Some(Declaration::Property(DefProperty { name, body, span }))
    }

    fn parse_definrange(&mut self, operands: &[Sexp], span: Span) -> Option<Declaration> {
        let [expr, bound] = operands else {
            self.error(span, "malformed declaration: definrange expects expression and bound");
            return None;
        };
        let Some(bound) = bound.as_number().cloned() else {
            self.error(bound.span(), "expected constant: range bound");
            return None;
        };
        let expr = self.parse_expr(expr)?;
        Some(Declaration::InRange(DefInRange { expr, bound, span }))
    }

    // ── Lookups ──

    fn parse_lookup_tuple(&mut self, sexp: &Sexp) -> Option<Vec<Expr>> {
        let Sexp::List(items, _) = sexp else {
            self.error(sexp.span(), "expected list: lookup tuple");
            return None;
        };
        let exprs: Vec<Expr> = items.iter().filter_map(|e| self.parse_expr(e)).collect();
        (exprs.len() == items.len()).then_some(exprs)
    }

    /// `(deflookup handle (targets…) (sources…))`
    fn parse_deflookup(&mut self, operands: &[Sexp], span: Span) -> Option<Declaration> {
        let [handle, targets, sources] = operands else {
            self.error(span, "malformed declaration: deflookup expects handle, targets, sources");
            return None;
        };
        let name = self.expect_handle(handle)?;
        let targets = LookupHalf {
            selector: None,
            exprs: self.parse_lookup_tuple(targets)?,
            span: targets.span(),
        };
        let sources = LookupHalf {
            selector: None,
            exprs: self.parse_lookup_tuple(sources)?,
            span: sources.span(),
        };
        Some(Declaration::Lookup(DefLookup {
            name,
            kind: LookupKind::Plain,
            targets,
            sources: vec![sources],
            span,
        }))
    }

    /// `(defclookup handle tsel (targets…) ssel (sources…))`
    fn parse_defclookup(&mut self, operands: &[Sexp], span: Span) -> Option<Declaration> {
        let [handle, tsel, targets, ssel, sources] = operands else {
            self.error(
                span,
                "malformed declaration: defclookup expects handle, selectors and tuples",
            );
            return None;
        };
        let name = self.expect_handle(handle)?;
        let targets = LookupHalf {
            selector: self.parse_expr(tsel),
            exprs: self.parse_lookup_tuple(targets)?,
            span: tsel.span().merge(targets.span()),
        };
        let sources = LookupHalf {
            selector: self.parse_expr(ssel),
            exprs: self.parse_lookup_tuple(sources)?,
            span: ssel.span().merge(sources.span()),
        };
        Some(Declaration::Lookup(DefLookup {
            name,
            kind: LookupKind::Conditional,
            targets,
            sources: vec![sources],
            span,
        }))
    }

    /// `(defmlookup handle (targets…) (sel (sources…))…)`
    fn parse_defmlookup(&mut self, operands: &[Sexp], span: Span) -> Option<Declaration> {
        let Some((handle, rest)) = operands.split_first() else {
            self.error(span, "malformed declaration: defmlookup expects a handle");
            return None;
        };
        let name = self.expect_handle(handle)?;
        let Some((targets, source_blocks)) = rest.split_first() else {
            self.error(span, "malformed declaration: defmlookup expects targets");
            return None;
        };
        let targets = LookupHalf {
            selector: None,
            exprs: self.parse_lookup_tuple(targets)?,
            span: targets.span(),
        };
        if source_blocks.is_empty() {
            self.error(span, "malformed declaration: defmlookup expects source blocks");
            return None;
        }
        let mut sources = Vec::new();
        for block in source_blocks {
            let Sexp::List(items, block_span) = block else {
                self.error(block.span(), "expected list: lookup source block");
                continue;
            };
            let [sel, tuple] = items.as_slice() else {
                self.error(*block_span, "malformed declaration: source block expects selector and tuple");
                continue;
            };
            let selector = self.parse_expr(sel);
            if let Some(exprs) = self.parse_lookup_tuple(tuple) {
                sources.push(LookupHalf {
                    selector,
                    exprs,
                    span: *block_span,
                });
            }
        }
        Some(Declaration::Lookup(DefLookup {
            name,
            kind: LookupKind::Multi,
            targets,
            sources,
            span,
        }))
    }

    // ── Permutations and sortedness ──

    /// A source column with an optional sort sign: `X`, `(+ X)` or `(- X)`.
    fn parse_signed_column(&mut self, sexp: &Sexp) -> Option<PermutationSource> {
        match sexp {
            Sexp::Symbol(name, span) => {
                self.check_identifier(name, *span)?;
                Some(PermutationSource {
                    sign: None,
                    column: name.clone(),
                    span: *span,
                })
            }
            Sexp::List(items, span) => match items.as_slice() {
                [Sexp::Symbol(op, _), Sexp::Symbol(name, _)] if op == "+" || op == "-" => {
                    Some(PermutationSource {
                        sign: Some(if op == "+" {
                            SortSign::Ascending
                        } else {
                            SortSign::Descending
                        }),
                        column: name.clone(),
                        span: *span,
                    })
                }
                _ => {
                    self.error(*span, "malformed declaration: invalid sorted column");
                    None
                }
            },
            other => {
                self.error(other.span(), "malformed declaration: invalid sorted column");
                None
            }
        }
    }

    /// `(defpermutation (targets…) (sources…))`; signs decorate sources.
    fn parse_defpermutation(&mut self, operands: &[Sexp], span: Span) -> Option<Declaration> {
        let [targets, sources] = operands else {
            self.error(span, "malformed declaration: defpermutation expects targets and sources");
            return None;
        };
        let Sexp::List(target_items, _) = targets else {
            self.error(targets.span(), "expected list: permutation targets");
            return None;
        };
        let Sexp::List(source_items, _) = sources else {
            self.error(sources.span(), "expected list: permutation sources");
            return None;
        };
        let mut target_names = Vec::new();
        for t in target_items {
            match t.as_symbol() {
                Some(n) => {
                    let _ = self.check_identifier(n, t.span());
                    target_names.push(n.to_string());
                }
                None => self.error(t.span(), "invalid handle: expected column name"),
            }
        }
        let parsed: Vec<PermutationSource> = source_items
            .iter()
            .filter_map(|s| self.parse_signed_column(s))
            .collect();
        if target_names.len() != source_items.len() || parsed.len() != source_items.len() {
            self.error(span, "malformed declaration: permutation sides must have the same length");
            return None;
        }
        Some(Declaration::Permutation(DefPermutation {
            targets: target_names,
            sources: parsed,
            span,
        }))
    }

    /// `(defsorted (cols…) [:selector e])`
    fn parse_defsorted(&mut self, operands: &[Sexp], span: Span, strict: bool) -> Option<Declaration> {
        let Some((columns, rest)) = operands.split_first() else {
            self.error(span, "malformed declaration: defsorted expects columns");
            return None;
        };
        let Sexp::List(items, _) = columns else {
            self.error(columns.span(), "expected list: sorted columns");
            return None;
        };
        if items.is_empty() {
            self.error(columns.span(), "malformed declaration: defsorted expects columns");
            return None;
        }
        let sources: Vec<PermutationSource> = items
            .iter()
            .filter_map(|s| self.parse_signed_column(s))
            .collect();
        let mut selector = None;
        let mut rest = rest.iter();
        while let Some(attr) = rest.next() {
            match attr.as_symbol() {
                Some(":selector") => match rest.next() {
                    Some(e) => selector = self.parse_expr(e),
                    None => self.error(attr.span(), ":selector expects an expression"),
                },
                _ => self.error(attr.span(), "malformed attribute"),
            }
        }
        Some(Declaration::Sorted(DefSorted {
            sources,
            selector,
            strict,
            span,
        }))
    }

    /// `(definterleaved target (sources…))`
    fn parse_definterleaved(&mut self, operands: &[Sexp], span: Span) -> Option<Declaration> {
        let [target, sources] = operands else {
            self.error(span, "malformed declaration: definterleaved expects target and sources");
            return None;
        };
        let Some(target_name) = target.as_symbol() else {
            self.error(target.span(), "invalid handle: expected column name");
            return None;
        };
        self.check_identifier(target_name, target.span())?;
        let Sexp::List(items, _) = sources else {
            self.error(sources.span(), "expected list: interleaving sources");
            return None;
        };
        if items.is_empty() {
            self.error(sources.span(), "malformed declaration: interleaving expects sources");
            return None;
        }
        let mut names = Vec::new();
        for s in items {
            match s.as_symbol() {
                Some(n) => names.push(n.to_string()),
                None => self.error(s.span(), "invalid handle: expected column name"),
            }
        }
        Some(Declaration::Interleaved(DefInterleaved {
            target: target_name.to_string(),
            sources: names,
            span,
        }))
    }

    /// `(defperspective name selector (columns…))`
    fn parse_defperspective(&mut self, operands: &[Sexp], span: Span) -> Option<Declaration> {
        let [name, selector, columns] = operands else {
            self.error(span, "malformed declaration: defperspective expects name, selector, columns");
            return None;
        };
        let Some(persp_name) = name.as_symbol() else {
            self.error(name.span(), "invalid handle: expected perspective name");
            return None;
        };
        self.check_identifier(persp_name, name.span())?;
        let selector = self.parse_expr(selector)?;
        let Sexp::List(items, _) = columns else {
            self.error(columns.span(), "expected list: perspective columns");
            return None;
        };
        let columns = items
            .iter()
            .filter_map(|c| self.parse_column_decl(c))
            .collect();
        Some(Declaration::Perspective(DefPerspective {
            name: persp_name.to_string(),
            selector,
            columns,
            span,
        }))
    }

    /// `(defcomputed (targets…) name (sources…))`
    fn parse_defcomputed(&mut self, operands: &[Sexp], span: Span) -> Option<Declaration> {
        let [targets, function, sources] = operands else {
            self.error(span, "malformed declaration: defcomputed expects targets, function, sources");
            return None;
        };
        let Sexp::List(target_items, _) = targets else {
            self.error(targets.span(), "expected list: computed targets");
            return None;
        };
        let Some(function) = function.as_symbol() else {
            self.error(function.span(), "invalid handle: expected native name");
            return None;
        };
        let Sexp::List(source_items, _) = sources else {
            self.error(sources.span(), "expected list: computed sources");
            return None;
        };
        let mut target_names = Vec::new();
        for t in target_items {
            match t.as_symbol() {
                Some(n) => {
                    let _ = self.check_identifier(n, t.span());
                    target_names.push(n.to_string());
                }
                None => self.error(t.span(), "invalid handle: expected column name"),
            }
        }
        let mut source_names = Vec::new();
        for s in source_items {
            match s.as_symbol() {
                Some(n) => source_names.push(n.to_string()),
                None => self.error(s.span(), "invalid handle: expected column name"),
            }
        }
        Some(Declaration::Computed(DefComputed {
            targets: target_names,
            function: function.to_string(),
            sources: source_names,
            span,
        }))
    }

    /// `(defcomputedcolumn (name :type…) body)`
    fn parse_defcomputedcolumn(&mut self, operands: &[Sexp], span: Span) -> Option<Declaration> {
        let [target, body] = operands else {
            self.error(span, "malformed declaration: defcomputedcolumn expects target and body");
            return None;
        };
        let target = self.parse_column_decl(target)?;
        let body = self.parse_expr(body)?;
        Some(Declaration::ComputedColumn(DefComputedColumn {
            target,
            body,
            span,
        }))
    }

    // ── Expressions ──

    pub fn parse_expr(&mut self, sexp: &Sexp) -> Option<Expr> {
        match sexp {
            Sexp::Number(n, span) => Some(Expr::Const(n.clone(), *span)),
            Sexp::Symbol(name, span) => {
                if name.starts_with(':') {
                    self.error(*span, format!("unexpected keyword '{}'", name));
                    return None;
                }
                Some(Expr::symbol(Path::parse(name), *span))
            }
            Sexp::Array(items, span) => match items.as_slice() {
                [base, index] => {
                    let base = self.parse_expr(base)?;
                    let index = self.parse_expr(index)?;
                    Some(Expr::ArrayAccess {
                        base: Box::new(base),
                        index: Box::new(index),
                        span: *span,
                    })
                }
                _ => {
                    self.error(*span, "malformed array access");
                    None
                }
            },
            Sexp::List(items, span) => self.parse_call(items, *span),
            Sexp::Text(_, span) | Sexp::Set(_, span) => {
                self.error(*span, "unexpected literal in expression position");
                None
            }
        }
    }

    fn parse_args(&mut self, operands: &[Sexp]) -> Option<Vec<Expr>> {
        let args: Vec<Expr> = operands.iter().filter_map(|e| self.parse_expr(e)).collect();
        (args.len() == operands.len()).then_some(args)
    }

    fn parse_call(&mut self, items: &[Sexp], span: Span) -> Option<Expr> {
        let Some((head, operands)) = items.split_first() else {
            // An empty list is an empty sequence.
            return Some(Expr::List(Vec::new(), span));
        };
        let Some(name) = head.as_symbol() else {
            self.error(head.span(), "not a function");
            return None;
        };
        match name {
            "+" | "*" => {
                let args = self.parse_args(operands)?;
                if args.is_empty() {
                    self.error(span, format!("incorrect arity: '{}' expects arguments", name));
                    return None;
                }
                Some(Expr::Funcall {
                    op: if name == "+" { ArithOp::Add } else { ArithOp::Mul },
                    args,
                    span,
                })
            }
            "-" => {
                let args = self.parse_args(operands)?;
                if args.is_empty() {
                    self.error(span, "incorrect arity: '-' expects arguments");
                    return None;
                }
                Some(Expr::Funcall {
                    op: ArithOp::Sub,
                    args,
                    span,
                })
            }
            "^" => {
                let [base, exponent] = operands else {
                    self.error(span, "incorrect arity: '^' expects base and exponent");
                    return None;
                };
                Some(Expr::Exponent {
                    base: Box::new(self.parse_expr(base)?),
                    exponent: Box::new(self.parse_expr(exponent)?),
                    span,
                })
            }
            "~" => {
                let [arg] = operands else {
                    self.error(span, "incorrect arity: '~' expects one argument");
                    return None;
                };
                Some(Expr::Normalise(Box::new(self.parse_expr(arg)?), span))
            }
            "shift" => {
                let [body, offset] = operands else {
                    self.error(span, "incorrect arity: 'shift' expects expression and offset");
                    return None;
                };
                Some(Expr::Shift {
                    body: Box::new(self.parse_expr(body)?),
                    offset: Box::new(self.parse_expr(offset)?),
                    span,
                })
            }
            "if" => {
                let (condition, then_branch, else_branch) = match operands {
                    [c, t] => (c, t, None),
                    [c, t, e] => (c, t, Some(e)),
                    _ => {
                        self.error(span, "incorrect arity: 'if' expects condition and branches");
                        return None;
                    }
                };
                let else_branch = match else_branch {
                    Some(e) => Some(Box::new(self.parse_expr(e)?)),
                    None => None,
                };
                Some(Expr::If {
                    condition: Box::new(self.parse_expr(condition)?),
                    then_branch: Box::new(self.parse_expr(then_branch)?),
                    else_branch,
                    semantics: None,
                    span,
                })
            }
            "begin" => Some(Expr::List(self.parse_args(operands)?, span)),
            "for" => {
                let [index, range, body] = operands else {
                    self.error(span, "incorrect arity: 'for' expects index, range, body");
                    return None;
                };
                let Some(index_name) = index.as_symbol() else {
                    self.error(index.span(), "invalid identifier: loop index");
                    return None;
                };
                self.check_identifier(index_name, index.span())?;
                let range = self.parse_value_range(range)?;
                Some(Expr::For {
                    index: index_name.to_string(),
                    local: None,
                    range,
                    body: Box::new(self.parse_expr(body)?),
                    span,
                })
            }
            "let" => {
                let [bindings, body] = operands else {
                    self.error(span, "incorrect arity: 'let' expects bindings and body");
                    return None;
                };
                let Sexp::List(binding_items, _) = bindings else {
                    self.error(bindings.span(), "expected list: let bindings");
                    return None;
                };
                let mut parsed = Vec::new();
                for b in binding_items {
                    let Sexp::List(pair, pair_span) = b else {
                        self.error(b.span(), "expected list: let binding");
                        continue;
                    };
                    match pair.as_slice() {
                        [Sexp::Symbol(n, ns), value] => {
                            let _ = self.check_identifier(n, *ns);
                            if let Some(v) = self.parse_expr(value) {
                                parsed.push((n.clone(), None, v));
                            }
                        }
                        _ => self.error(*pair_span, "malformed let binding"),
                    }
                }
                Some(Expr::Let {
                    bindings: parsed,
                    body: Box::new(self.parse_expr(body)?),
                    span,
                })
            }
            "reduce" => {
                let [fun, list] = operands else {
                    self.error(span, "incorrect arity: 'reduce' expects function and list");
                    return None;
                };
                Some(Expr::Reduce {
                    fun: Box::new(self.parse_expr(fun)?),
                    list: Box::new(self.parse_expr(list)?),
                    signature: None,
                    span,
                })
            }
            "debug" => Some(Expr::Debug(self.parse_args(operands)?, span)),
            "vanishes!" => {
                let [arg] = operands else {
                    self.error(span, "incorrect arity: 'vanishes!' expects one argument");
                    return None;
                };
                Some(Expr::Equation {
                    kind: EquationKind::Eq,
                    left: Box::new(self.parse_expr(arg)?),
                    right: Box::new(Expr::constant(0, span)),
                    span,
                })
            }
            "=" | "eq!" | "!=" | "neq!" | "<" | "<=" | ">" | ">=" => {
                let kind = match name {
                    "=" | "eq!" => EquationKind::Eq,
                    "!=" | "neq!" => EquationKind::Neq,
                    "<" => EquationKind::Lt,
                    "<=" => EquationKind::Le,
                    ">" => EquationKind::Gt,
                    _ => EquationKind::Ge,
                };
                let [left, right] = operands else {
                    self.error(span, format!("incorrect arity: '{}' expects two arguments", name));
                    return None;
                };
                Some(Expr::Equation {
                    kind,
                    left: Box::new(self.parse_expr(left)?),
                    right: Box::new(self.parse_expr(right)?),
                    span,
                })
            }
            "not" | "¬" => {
                let [arg] = operands else {
                    self.error(span, "incorrect arity: 'not' expects one argument");
                    return None;
                };
                Some(Expr::Not(Box::new(self.parse_expr(arg)?), span))
            }
            "and" | "∧" | "or" | "∨" => {
                let args = self.parse_args(operands)?;
                if args.len() < 2 {
                    self.error(span, format!("incorrect arity: '{}' expects at least two arguments", name));
                    return None;
                }
                Some(Expr::Connective {
                    kind: if name == "and" || name == "∧" {
                        ConnectiveKind::And
                    } else {
                        ConnectiveKind::Or
                    },
                    args,
                    span,
                })
            }
            "cast" | "cast!" => {
                let [tag, body] = operands else {
                    self.error(span, "incorrect arity: 'cast' expects type and expression");
                    return None;
                };
                let Some(tag_name) = tag.as_symbol().filter(|t| t.starts_with(':')) else {
                    self.error(tag.span(), "malformed attribute: expected type tag");
                    return None;
                };
                let ty = self.parse_type_tag(tag_name, tag.span())?;
                Some(Expr::Cast {
                    body: Box::new(self.parse_expr(body)?),
                    ty,
                    unchecked: name == "cast!",
                    span,
                })
            }
            "concat" | "::" => {
                let limbs = self.parse_args(operands)?;
                if limbs.len() < 2 {
                    self.error(span, "incorrect arity: 'concat' expects at least two limbs");
                    return None;
                }
                Some(Expr::Concat { limbs, span })
            }
            // Unknown heads default to invocation; resolution decides
            // whether the callee exists.
            _ => {
                let args = self.parse_args(operands)?;
                Some(Expr::Invoke {
                    fun: Box::new(Expr::symbol(Path::parse(name), head.span())),
                    args,
                    signature: None,
                    span,
                })
            }
        }
    }

    /// A `for` range `[lo:hi]` or `[n]`; `lo > hi` is an empty range.
    fn parse_value_range(&mut self, sexp: &Sexp) -> Option<(BigInt, BigInt)> {
        let range = self.parse_range_bounds(sexp)?;
        Some((BigInt::from(range.0), BigInt::from(range.1)))
    }

    // ── Identifier rules ──

    fn expect_handle(&mut self, sexp: &Sexp) -> Option<String> {
        match sexp.as_symbol() {
            Some(name) => {
                self.check_identifier(name, sexp.span())?;
                Some(name.to_string())
            }
            None => {
                self.error(sexp.span(), "invalid handle");
                None
            }
        }
    }

    fn check_identifier(&mut self, name: &str, span: Span) -> Option<()> {
        if is_valid_identifier(name) {
            Some(())
        } else {
            self.error(span, format!("invalid identifier '{}'", name));
            None
        }
    }

    fn check_function_identifier(&mut self, name: &str, span: Span) -> Option<()> {
        if is_valid_function_identifier(name) {
            Some(())
        } else {
            self.error(span, format!("invalid identifier '{}'", name));
            None
        }
    }
}

/// First character letter, `_`, `'` or `$`; later characters may add
/// digits, `-`, `!`, `@`.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || matches!(c, '_' | '\'' | '$') => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || matches!(c, '_' | '\'' | '$' | '-' | '!' | '@'))
}

/// Function names additionally accept a leading `~` and the operator
/// names `+`, `*`, `-`, `=`.
pub fn is_valid_function_identifier(name: &str) -> bool {
    if matches!(name, "+" | "*" | "-" | "=") {
        return true;
    }
    if let Some(rest) = name.strip_prefix('~') {
        return rest.is_empty() || is_valid_identifier(rest);
    }
    is_valid_identifier(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::span::SourceMap;

    fn parse_src(src: &str) -> (Ast, Vec<SyntaxError>) {
        let mut sources = SourceMap::new();
        sources.add_file("test.cdl", src);
        parse_source_files(&sources)
    }

    fn parse_ok(src: &str) -> Ast {
        let (ast, errors) = parse_src(src);
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
        ast
    }

    #[test]
    fn test_column_attributes() {
        let ast = parse_ok("(defcolumns X (Y :i16) (Z :byte@prove :display :hex) (W :i8 :array [1:3]))");
        let Declaration::Columns(d) = &ast.modules[0].declarations[0] else {
            panic!("expected defcolumns");
        };
        assert_eq!(d.columns.len(), 4);
        assert!(d.columns[0].ty.is_none());
        assert_eq!(d.columns[1].ty.as_ref().unwrap().kind, TypeExprKind::Uint(16));
        let z = &d.columns[2];
        assert_eq!(z.ty.as_ref().unwrap().kind, TypeExprKind::Uint(8));
        assert!(z.ty.as_ref().unwrap().must_prove);
        assert_eq!(z.display, Some(DisplayHint::Hex));
        assert_eq!(d.columns[3].array, Some((1, 3)));
    }

    #[test]
    fn test_array_count_form() {
        let ast = parse_ok("(defcolumns (X :i8 :array [4]))");
        let Declaration::Columns(d) = &ast.modules[0].declarations[0] else {
            panic!();
        };
        assert_eq!(d.columns[0].array, Some((1, 4)));
    }

    #[test]
    fn test_modules_aggregate_and_sort() {
        let ast = parse_ok(
            "(module zeta) (defcolumns Z) (module alpha) (defcolumns A) (module zeta) (defcolumns W)",
        );
        let names: Vec<&str> = ast.modules.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["", "alpha", "zeta"]);
        assert_eq!(ast.modules[2].declarations.len(), 2);
    }

    #[test]
    fn test_conflicting_module_conditions() {
        let (_, errors) = parse_src("(module m (vanishes! A)) (module m (vanishes! B))");
        assert!(errors.iter().any(|e| e.message.contains("conflicting module conditions")));
    }

    #[test]
    fn test_repeated_module_condition_agrees() {
        let ast = parse_ok("(module m (vanishes! A)) (module m (vanishes! A))");
        let m = ast.modules.iter().find(|m| m.name == "m").unwrap();
        assert!(m.condition.is_some());
    }

    #[test]
    fn test_defconstraint_attributes() {
        let ast = parse_ok(
            "(defconstraint c1 (:guard G :domain {2} :perspective view) (vanishes! X))",
        );
        let Declaration::Constraint(c) = &ast.modules[0].declarations[0] else {
            panic!();
        };
        assert!(c.guard.is_some());
        assert_eq!(c.domain, Some(vec![2]));
        assert_eq!(c.perspective.as_deref(), Some("view"));
    }

    #[test]
    fn test_defconstraint_shape_error() {
        let (_, errors) = parse_src("(defconstraint c1 (vanishes! X))");
        assert!(!errors.is_empty());
    }

    #[test]
    fn test_defun_with_types() {
        let ast = parse_ok("(defpurefun ((double :i16) (x :i8)) (* 2 x))");
        let Declaration::Fun(f) = &ast.modules[0].declarations[0] else {
            panic!();
        };
        assert!(f.pure);
        assert_eq!(f.name, "double");
        assert_eq!(f.ret.as_ref().unwrap().kind, TypeExprKind::Uint(16));
        assert_eq!(f.params.len(), 1);
    }

    #[test]
    fn test_operator_function_names() {
        assert!(is_valid_function_identifier("+"));
        assert!(is_valid_function_identifier("~and"));
        assert!(!is_valid_identifier("3x"));
        assert!(is_valid_identifier("x'@"));
    }

    #[test]
    fn test_expression_rule_table() {
        let ast = parse_ok("(defconstraint c () (if (= X 3) (begin (vanishes! Y) (custom Z 1))))");
        let Declaration::Constraint(c) = &ast.modules[0].declarations[0] else {
            panic!();
        };
        let Expr::If { condition, then_branch, .. } = &c.body else {
            panic!("expected if");
        };
        assert!(matches!(**condition, Expr::Equation { kind: EquationKind::Eq, .. }));
        let Expr::List(items, _) = &**then_branch else {
            panic!("expected begin list");
        };
        assert!(matches!(items[1], Expr::Invoke { .. }));
    }

    #[test]
    fn test_array_access_expression() {
        let ast = parse_ok("(defconstraint c () (vanishes! [X 2]))");
        let Declaration::Constraint(c) = &ast.modules[0].declarations[0] else {
            panic!();
        };
        let Expr::Equation { left, .. } = &c.body else {
            panic!();
        };
        assert!(matches!(**left, Expr::ArrayAccess { .. }));
    }

    #[test]
    fn test_lookup_forms() {
        let ast = parse_ok(
            "(deflookup l1 (A B) (C D))\
             (defclookup l2 S1 (A) S2 (C))\
             (defmlookup l3 (A) (S1 (B)) (S2 (C)))",
        );
        let decls = &ast.modules[0].declarations;
        let Declaration::Lookup(l1) = &decls[0] else { panic!() };
        assert_eq!(l1.kind, LookupKind::Plain);
        assert_eq!(l1.targets.exprs.len(), 2);
        let Declaration::Lookup(l2) = &decls[1] else { panic!() };
        assert_eq!(l2.kind, LookupKind::Conditional);
        assert!(l2.targets.selector.is_some());
        let Declaration::Lookup(l3) = &decls[2] else { panic!() };
        assert_eq!(l3.kind, LookupKind::Multi);
        assert_eq!(l3.sources.len(), 2);
    }

    #[test]
    fn test_permutation_signs() {
        let ast = parse_ok("(defpermutation (A' B') ((+ A) B))");
        let Declaration::Permutation(p) = &ast.modules[0].declarations[0] else {
            panic!();
        };
        assert_eq!(p.sources[0].sign, Some(SortSign::Ascending));
        assert_eq!(p.sources[1].sign, None);
    }

    #[test]
    fn test_errors_accumulate() {
        let (_, errors) = parse_src("(defcolumns) (defproperty) (definrange X)");
        assert!(errors.len() >= 3);
    }

    #[test]
    fn test_unknown_declaration() {
        let (_, errors) = parse_src("(defwidget W)");
        assert!(errors[0].message.contains("unknown declaration"));
    }

    #[test]
    fn test_for_range() {
        let ast = parse_ok("(defconstraint c () (for i [1:3] (vanishes! [X i])))");
        let Declaration::Constraint(c) = &ast.modules[0].declarations[0] else {
            panic!();
        };
        let Expr::For { range, .. } = &c.body else {
            panic!();
        };
        assert_eq!(range.0, BigInt::from(1));
        assert_eq!(range.1, BigInt::from(3));
    }
}
