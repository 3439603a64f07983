//! Fixed-point symbol resolution.
//!
//! Phase A populates the scope tree: perspectives become virtual
//! subscopes, every declaration's symbols are defined, and aliases are
//! absorbed transitively. Phase B drives each declaration's finalizer to
//! a fixed point under a bounded iteration count: a declaration runs only
//! once everything it depends on is finalised, and a declaration that
//! errors once is never retried.

use cdl_core::program::ExternModule;
use log::trace;
use num_bigint::BigInt;
use num_traits::{One, Signed, ToPrimitive, Zero};
use std::collections::{HashMap, HashSet};

use crate::compiler::ast::*;
use crate::compiler::errors::SyntaxError;
use crate::compiler::natives::NATIVES;
use crate::compiler::path::Path;
use crate::compiler::scope::*;
use crate::compiler::span::Span;
use crate::compiler::types::{join_all, meet_all, Type};

/// Upper bound on finalization sweeps before resolution is abandoned.
pub const MAX_ITERATIONS: usize = 32;

/// Field geometry the resolver needs; the element type itself stays out
/// of this pass.
#[derive(Debug, Clone, Copy)]
pub struct FieldInfo {
    /// Bits in the modulus.
    pub bit_width: usize,
    /// Widest `N` such that every `uintN` value fits in the field.
    pub register_width: usize,
}

pub struct Resolved {
    pub ast: Ast,
    pub tree: ScopeTree,
}

/// Resolve every symbol reference of `ast` to a finalised binding.
pub fn resolve(
    mut ast: Ast,
    externs: &[ExternModule],
    field: FieldInfo,
) -> (Resolved, Vec<SyntaxError>) {
    let mut resolver = Resolver {
        tree: ScopeTree::new(),
        errors: Vec::new(),
        field,
    };
    resolver.initialise(&ast, externs);
    resolver.run_to_fixed_point(&mut ast);
    (
        Resolved {
            ast,
            tree: resolver.tree,
        },
        resolver.errors,
    )
}

// ── Local scopes ──

#[derive(Debug, Clone)]
struct LocalVar {
    name: String,
    index: usize,
    ty: Type,
}

/// Wraps a module scope with local variables and the flags controlling
/// what an expression may reference.
#[derive(Debug, Clone)]
struct LocalScope {
    scope: usize,
    locals: Vec<LocalVar>,
    next_index: usize,
    is_global: bool,
    is_pure: bool,
    is_constant: bool,
    /// Fixed (module, multiplier) context, set by the first column access.
    context: Option<(Path, usize)>,
}

impl LocalScope {
    fn new(scope: usize) -> Self {
        LocalScope {
            scope,
            locals: Vec::new(),
            next_index: 0,
            is_global: false,
            is_pure: false,
            is_constant: false,
            context: None,
        }
    }

    fn global(scope: usize) -> Self {
        LocalScope {
            is_global: true,
            ..Self::new(scope)
        }
    }

    fn pure_constant(scope: usize) -> Self {
        LocalScope {
            is_pure: true,
            is_constant: true,
            ..Self::new(scope)
        }
    }

    /// A nested scope clones the parent's locals.
    fn child(&self) -> LocalScope {
        self.clone()
    }

    fn declare_local(&mut self, name: &str, ty: Type) -> usize {
        let index = self.next_index;
        self.next_index += 1;
        self.locals.push(LocalVar {
            name: name.to_string(),
            index,
            ty,
        });
        index
    }

    /// Innermost local with this name.
    fn local(&self, name: &str) -> Option<&LocalVar> {
        self.locals.iter().rev().find(|l| l.name == name)
    }
}

// ── Dependency tracking ──

#[derive(Debug, Clone, PartialEq, Eq)]
struct Dep {
    path: Path,
    ns: Namespace,
}

struct Task {
    module_index: usize,
    decl_index: usize,
    /// Scope the declaration resolves in.
    scope: usize,
    completed: bool,
    failed: bool,
    /// Bindings this declaration itself defines.
    defines: Vec<BindingRef>,
}

// ── The resolver ──

struct Resolver {
    tree: ScopeTree,
    errors: Vec<SyntaxError>,
    field: FieldInfo,
}

impl Resolver {
    fn error(&mut self, span: Span, message: impl Into<String>) {
        self.errors.push(SyntaxError::new(span, message));
    }

    // ── Phase A: initialisation ──

    fn initialise(&mut self, ast: &Ast, externs: &[ExternModule]) {
        self.define_intrinsics();
        self.define_natives();
        self.define_externs(externs);

        // Module scopes, lexicographic order.
        for module in &ast.modules {
            if module.name.is_empty() {
                continue;
            }
            if self.tree.declare(ROOT_SCOPE, &module.name, None).is_err() {
                self.error(
                    module.span,
                    format!("duplicate symbol '{}'", module.name),
                );
            }
        }

        // Perspectives become virtual subscopes before any symbol is
        // defined, so that perspective columns land in the right place.
        for module in &ast.modules {
            let Some(scope) = self.tree.module_scope(&module.name) else {
                continue;
            };
            for decl in &module.declarations {
                if let Declaration::Perspective(p) = decl {
                    if self
                        .tree
                        .declare(scope, &p.name, Some(p.selector.clone()))
                        .is_err()
                    {
                        self.error(p.span, format!("duplicate symbol '{}'", p.name));
                    }
                }
            }
        }

        for module in &ast.modules {
            let Some(scope) = self.tree.module_scope(&module.name) else {
                continue;
            };
            for decl in &module.declarations {
                self.define_declaration(scope, decl);
            }
        }

        self.absorb_aliases(ast);
    }

    fn define_intrinsics(&mut self) {
        for op in [
            IntrinsicOp::Add,
            IntrinsicOp::Sub,
            IntrinsicOp::Mul,
            IntrinsicOp::Exp,
            IntrinsicOp::Normalise,
            IntrinsicOp::Eq,
        ] {
            let signature = FunctionSignature {
                params: Vec::new(),
                ret: None,
                pure: true,
                arity: op.arity(),
                body: FunctionImpl::Intrinsic(op),
                finalised: true,
            };
            self.tree
                .define_function(ROOT_SCOPE, op.name(), Path::root().extend(op.name()), signature)
                .expect("intrinsics define once");
        }
    }

    fn define_natives(&mut self) {
        for (index, native) in NATIVES.iter().enumerate() {
            let signature = FunctionSignature {
                params: Vec::new(),
                ret: None,
                pure: false,
                arity: Arity::Between(native.min_arity, native.max_arity),
                body: FunctionImpl::Native(index),
                finalised: true,
            };
            self.tree
                .define_function(ROOT_SCOPE, native.name, Path::root().extend(native.name), signature)
                .expect("natives define once");
        }
    }

    fn define_externs(&mut self, externs: &[ExternModule]) {
        for ext in externs {
            let Ok(scope) = self.tree.declare(ROOT_SCOPE, &ext.name, None) else {
                self.error(Span::dummy(), format!("duplicate symbol '{}'", ext.name));
                continue;
            };
            let module_path = Path::root().extend(&ext.name);
            for reg in &ext.registers {
                let binding = Binding::Column(ColumnBinding {
                    path: module_path.extend(&reg.name),
                    context: module_path.clone(),
                    perspective: None,
                    ty: Type::Uint(reg.bit_width),
                    multiplier: 1,
                    array: None,
                    kind: ColumnKind::Extern,
                    computed: reg.output,
                    must_prove: false,
                    display: None,
                    finalised: true,
                });
                if self.tree.define(scope, &reg.name, binding).is_err() {
                    self.error(
                        Span::dummy(),
                        format!("duplicate symbol '{}/{}'", ext.name, reg.name),
                    );
                }
            }
        }
    }

    fn column_binding_from_decl(
        &self,
        decl: &ColumnDecl,
        module_path: &Path,
        perspective: Option<&str>,
        kind: ColumnKind,
        finalised: bool,
    ) -> ColumnBinding {
        let ty = decl
            .ty
            .as_ref()
            .map(Type::from_expr)
            .unwrap_or(Type::Int);
        let path = match perspective {
            Some(p) => module_path.extend(p).extend(&decl.name),
            None => module_path.extend(&decl.name),
        };
        ColumnBinding {
            path,
            context: module_path.clone(),
            perspective: perspective.map(str::to_string),
            ty,
            multiplier: decl.multiplier,
            array: decl.array,
            kind,
            computed: !matches!(kind, ColumnKind::Atomic | ColumnKind::Extern),
            must_prove: decl.ty.as_ref().map(|t| t.must_prove).unwrap_or(false),
            display: decl.display,
            finalised,
        }
    }

    fn define_column(&mut self, scope: usize, binding: ColumnBinding, name: &str, span: Span) {
        if self.tree.define(scope, name, Binding::Column(binding)).is_err() {
            self.error(span, format!("duplicate symbol '{}'", name));
        }
    }

    fn define_declaration(&mut self, scope: usize, decl: &Declaration) {
        let module_path = self.tree.scope(scope).path.clone();
        match decl {
            Declaration::Columns(d) => {
                for c in &d.columns {
                    let binding =
                        self.column_binding_from_decl(c, &module_path, None, ColumnKind::Atomic, true);
                    self.define_column(scope, binding, &c.name, c.span);
                }
            }
            Declaration::Perspective(p) => {
                let Some(persp_scope) = self.tree.enter(scope, &p.name) else {
                    return; // declaration failed earlier
                };
                for c in &p.columns {
                    let binding = self.column_binding_from_decl(
                        c,
                        &module_path,
                        Some(&p.name),
                        ColumnKind::Atomic,
                        true,
                    );
                    self.define_column(persp_scope, binding, &c.name, c.span);
                }
            }
            Declaration::Const(d) => {
                for c in &d.constants {
                    let binding = Binding::Constant(ConstantBinding {
                        path: module_path.extend(&c.name),
                        ty: c.ty.as_ref().map(Type::from_expr),
                        value: None,
                        is_extern: c.is_extern,
                        finalised: false,
                    });
                    if self.tree.define(scope, &c.name, binding).is_err() {
                        self.error(c.span, format!("duplicate symbol '{}'", c.name));
                    }
                }
            }
            Declaration::Fun(f) => {
                for p in &f.params {
                    if p.ty.as_ref().map(|t| t.must_prove).unwrap_or(false) {
                        self.error(p.span, "@prove is not allowed on function parameters");
                    }
                }
                let params: Vec<(String, Type)> = f
                    .params
                    .iter()
                    .map(|p| {
                        (
                            p.name.clone(),
                            p.ty.as_ref().map(Type::from_expr).unwrap_or(Type::Int),
                        )
                    })
                    .collect();
                let signature = FunctionSignature {
                    arity: Arity::Exactly(params.len()),
                    params,
                    ret: f.ret.as_ref().map(Type::from_expr),
                    pure: f.pure,
                    body: FunctionImpl::Defined(f.body.clone()),
                    finalised: false,
                };
                if self
                    .tree
                    .define_function(scope, &f.name, module_path.extend(&f.name), signature)
                    .is_err()
                {
                    self.error(f.span, format!("duplicate symbol '{}'", f.name));
                }
            }
            Declaration::Interleaved(d) => {
                let binding = ColumnBinding {
                    path: module_path.extend(&d.target),
                    context: module_path.clone(),
                    perspective: None,
                    ty: Type::Int,
                    multiplier: 1,
                    array: None,
                    kind: ColumnKind::Interleaved,
                    computed: true,
                    must_prove: false,
                    display: None,
                    finalised: false,
                };
                self.define_column(scope, binding, &d.target, d.span);
            }
            Declaration::Permutation(d) => {
                for t in &d.targets {
                    let binding = ColumnBinding {
                        path: module_path.extend(t),
                        context: module_path.clone(),
                        perspective: None,
                        ty: Type::Int,
                        multiplier: 1,
                        array: None,
                        kind: ColumnKind::Permuted,
                        computed: true,
                        must_prove: false,
                        display: None,
                        finalised: false,
                    };
                    self.define_column(scope, binding, t, d.span);
                }
            }
            Declaration::Computed(d) => {
                for t in &d.targets {
                    let binding = ColumnBinding {
                        path: module_path.extend(t),
                        context: module_path.clone(),
                        perspective: None,
                        ty: Type::Int,
                        multiplier: 1,
                        array: None,
                        kind: ColumnKind::Computed,
                        computed: true,
                        must_prove: false,
                        display: None,
                        finalised: false,
                    };
                    self.define_column(scope, binding, t, d.span);
                }
            }
            Declaration::ComputedColumn(d) => {
                let mut binding = self.column_binding_from_decl(
                    &d.target,
                    &module_path,
                    None,
                    ColumnKind::Computed,
                    false,
                );
                binding.computed = true;
                self.define_column(scope, binding, &d.target.name, d.span);
            }
            // No symbols of their own.
            Declaration::Aliases(_)
            | Declaration::Constraint(_)
            | Declaration::Property(_)
            | Declaration::InRange(_)
            | Declaration::Lookup(_)
            | Declaration::Sorted(_) => {}
        }
    }

    /// Aliases may point at other aliases; absorb until nothing moves.
    fn absorb_aliases(&mut self, ast: &Ast) {
        let mut pending: Vec<(usize, AliasDecl, Namespace)> = Vec::new();
        for module in &ast.modules {
            let Some(scope) = self.tree.module_scope(&module.name) else {
                continue;
            };
            for decl in &module.declarations {
                if let Declaration::Aliases(d) = decl {
                    let ns = if d.functions {
                        Namespace::Functions
                    } else {
                        Namespace::Symbols
                    };
                    for a in &d.aliases {
                        pending.push((scope, a.clone(), ns));
                    }
                }
            }
        }
        loop {
            let mut progressed = false;
            pending.retain(|(scope, a, ns)| {
                if self.tree.alias(*scope, &a.alias, &a.target, *ns).is_ok() {
                    progressed = true;
                    false
                } else {
                    true
                }
            });
            if pending.is_empty() || !progressed {
                break;
            }
        }
        for (scope, a, ns) in pending {
            // Either the target never existed or the alias name is taken.
            let taken = self
                .tree
                .resolve(scope, &Path::relative(&a.alias), ns)
                .is_some();
            if taken {
                self.error(a.span, format!("duplicate symbol '{}'", a.alias));
            } else {
                self.error(a.span, format!("unknown symbol '{}'", a.target));
            }
        }
    }

    // ── Phase B: the fixed-point driver ──

    fn run_to_fixed_point(&mut self, ast: &mut Ast) {
        let mut tasks = self.build_tasks(ast);
        for iteration in 0..MAX_ITERATIONS {
            let mut changed = false;
            let mut remaining = 0;
            for task_index in 0..tasks.len() {
                let task = &tasks[task_index];
                if task.completed || task.failed {
                    continue;
                }
                remaining += 1;
                let decl = &ast.modules[task.module_index].declarations[task.decl_index];
                if !self.dependencies_ready(task, decl) {
                    continue;
                }
                trace!("finalizing {}", decl.describe());
                let errors_before = self.errors.len();
                let scope = task.scope;
                let decl = &mut ast.modules[task.module_index].declarations[task.decl_index];
                self.finalize_declaration(decl, scope);
                let task = &mut tasks[task_index];
                if self.errors.len() == errors_before {
                    task.completed = true;
                    remaining -= 1;
                } else {
                    task.failed = true;
                    remaining -= 1;
                }
                changed = true;
            }
            if remaining == 0 {
                return;
            }
            if !changed || iteration + 1 == MAX_ITERATIONS {
                self.report_stall(&tasks, ast);
                return;
            }
        }
    }

    fn build_tasks(&mut self, ast: &Ast) -> Vec<Task> {
        let mut tasks = Vec::new();
        for (module_index, module) in ast.modules.iter().enumerate() {
            let Some(scope) = self.tree.module_scope(&module.name) else {
                continue;
            };
            for (decl_index, decl) in module.declarations.iter().enumerate() {
                if matches!(decl, Declaration::Columns(_) | Declaration::Aliases(_)) {
                    continue; // finalised at definition time
                }
                let defines = self.defined_bindings(scope, decl);
                tasks.push(Task {
                    module_index,
                    decl_index,
                    scope,
                    completed: false,
                    failed: false,
                    defines,
                });
            }
        }
        tasks
    }

    /// Bindings a declaration defines itself; self-dependencies on these
    /// never block it.
    fn defined_bindings(&self, scope: usize, decl: &Declaration) -> Vec<BindingRef> {
        let mut names: Vec<(String, Namespace)> = Vec::new();
        match decl {
            Declaration::Const(d) => {
                names.extend(d.constants.iter().map(|c| (c.name.clone(), Namespace::Symbols)))
            }
            Declaration::Fun(f) => names.push((f.name.clone(), Namespace::Functions)),
            Declaration::Interleaved(d) => names.push((d.target.clone(), Namespace::Symbols)),
            Declaration::Permutation(d) => {
                names.extend(d.targets.iter().map(|t| (t.clone(), Namespace::Symbols)))
            }
            Declaration::Computed(d) => {
                names.extend(d.targets.iter().map(|t| (t.clone(), Namespace::Symbols)))
            }
            Declaration::ComputedColumn(d) => {
                names.push((d.target.name.clone(), Namespace::Symbols))
            }
            Declaration::Perspective(p) => names.push((p.name.clone(), Namespace::Symbols)),
            _ => {}
        }
        names
            .into_iter()
            .filter_map(|(name, ns)| self.tree.resolve(scope, &Path::relative(name), ns))
            .collect()
    }

    fn dependencies_ready(&self, task: &Task, decl: &Declaration) -> bool {
        let mut deps = Vec::new();
        declaration_dependencies(decl, &mut deps);
        for dep in deps {
            let Some(found) = self.tree.resolve(task.scope, &dep.path, dep.ns) else {
                // Unknown symbols surface as proper errors inside the
                // finalizer; do not block on them.
                continue;
            };
            if task.defines.contains(&found) {
                continue;
            }
            if !self.tree.binding(found).is_finalised() {
                return false;
            }
        }
        true
    }

    /// No task can make progress: attribute blame.
    fn report_stall(&mut self, tasks: &[Task], ast: &Ast) {
        let pending: Vec<usize> = tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| !t.completed && !t.failed)
            .map(|(i, _)| i)
            .collect();
        if pending.is_empty() {
            return;
        }
        // Map every binding to the pending task defining it, then look
        // for a dependency cycle.
        let mut owner: HashMap<BindingRef, usize> = HashMap::new();
        for &i in &pending {
            for b in &tasks[i].defines {
                owner.insert(*b, i);
            }
        }
        let edges: HashMap<usize, Vec<usize>> = pending
            .iter()
            .map(|&i| {
                let task = &tasks[i];
                let decl = &ast.modules[task.module_index].declarations[task.decl_index];
                let mut deps = Vec::new();
                declaration_dependencies(decl, &mut deps);
                let next: Vec<usize> = deps
                    .iter()
                    .filter_map(|d| self.tree.resolve(task.scope, &d.path, d.ns))
                    .filter(|b| !task.defines.contains(b))
                    .filter_map(|b| owner.get(&b).copied())
                    .collect();
                (i, next)
            })
            .collect();
        if let Some(cycle) = find_cycle(&pending, &edges) {
            let all_functions = cycle.iter().all(|&i| {
                matches!(
                    ast.modules[tasks[i].module_index].declarations[tasks[i].decl_index],
                    Declaration::Fun(_)
                )
            });
            let task = &tasks[cycle[0]];
            let decl = &ast.modules[task.module_index].declarations[task.decl_index];
            let message = if all_functions {
                format!("recursion not permitted in {}", decl.describe())
            } else {
                format!("cyclic declaration of {}", decl.describe())
            };
            self.error(decl.span(), message);
            return;
        }
        let task = &tasks[pending[0]];
        let decl = &ast.modules[task.module_index].declarations[task.decl_index];
        self.error(
            decl.span(),
            format!("unable to complete resolution of {}", decl.describe()),
        );
    }

    // ── Form-specific finalizers ──

    fn finalize_declaration(&mut self, decl: &mut Declaration, scope: usize) {
        match decl {
            Declaration::Const(d) => self.finalize_const(d, scope),
            Declaration::Fun(f) => self.finalize_fun(f, scope),
            Declaration::Constraint(c) => self.finalize_constraint(c, scope),
            Declaration::Property(p) => self.finalize_property(p, scope),
            Declaration::InRange(r) => self.finalize_inrange(r, scope),
            Declaration::Lookup(l) => self.finalize_lookup(l, scope),
            Declaration::Permutation(p) => self.finalize_permutation(p, scope),
            Declaration::Sorted(s) => self.finalize_sorted(s, scope),
            Declaration::Interleaved(i) => self.finalize_interleaved(i, scope),
            Declaration::Perspective(p) => self.finalize_perspective(p, scope),
            Declaration::Computed(c) => self.finalize_computed(c, scope),
            Declaration::ComputedColumn(c) => self.finalize_computed_column(c, scope),
            Declaration::Columns(_) | Declaration::Aliases(_) => {}
        }
    }

    fn finalize_const(&mut self, d: &mut DefConst, scope: usize) {
        for c in &mut d.constants {
            let mut local = LocalScope::pure_constant(scope);
            let Some(_) = self.resolve_expr(&mut c.value, &mut local) else {
                continue;
            };
            let Some(value) = self.const_value(&c.value) else {
                self.error(c.span, "expected constant expression");
                continue;
            };
            if let Some(ty) = c.ty.as_ref().map(Type::from_expr) {
                if let Some(bits) = ty.bit_width() {
                    let bound = BigInt::one() << bits;
                    if value.is_negative() || value >= bound {
                        self.error(
                            c.span,
                            format!("constant out-of-bounds: {} does not fit {}", value, ty),
                        );
                        continue;
                    }
                }
            }
            let Some(found) = self
                .tree
                .resolve(scope, &Path::relative(&c.name), Namespace::Symbols)
            else {
                continue;
            };
            if let Binding::Constant(b) = self.tree.binding_mut(found) {
                if b.ty.is_none() {
                    b.ty = Some(Type::of_constant(&value));
                }
                b.value = Some(value);
                b.finalised = true;
            }
        }
    }

    fn finalize_fun(&mut self, f: &mut DefFun, scope: usize) {
        // Direct self-reference would never terminate at expansion time.
        let mut deps = Vec::new();
        let mut bound: HashSet<String> = f.params.iter().map(|p| p.name.clone()).collect();
        expr_dependencies(&f.body, &mut bound, &mut deps);
        if deps
            .iter()
            .any(|d| d.ns == Namespace::Functions && d.path.depth() == 1 && d.path.name() == f.name)
        {
            self.error(f.span, format!("recursion not permitted in defun {}", f.name));
            return;
        }
        let mut local = LocalScope::new(scope);
        local.is_pure = f.pure;
        for p in &f.params {
            let ty = p.ty.as_ref().map(Type::from_expr).unwrap_or(Type::Int);
            local.declare_local(&p.name, ty);
        }
        let Some(body_ty) = self.resolve_expr(&mut f.body, &mut local) else {
            return;
        };
        if let Some(ret) = f.ret.as_ref().map(Type::from_expr) {
            if !body_ty.is_subtype_of(&ret) {
                self.error(
                    f.body.span(),
                    format!("expected {}, found {}", ret, body_ty),
                );
                return;
            }
        }
        // Write the resolved body and inferred return type back into the
        // matching overload.
        let Some(found) = self
            .tree
            .resolve(scope, &Path::relative(&f.name), Namespace::Functions)
        else {
            return;
        };
        let param_tys: Vec<Type> = f
            .params
            .iter()
            .map(|p| p.ty.as_ref().map(Type::from_expr).unwrap_or(Type::Int))
            .collect();
        if let Binding::Function(b) = self.tree.binding_mut(found) {
            if let Some(sig) = b.signatures.iter_mut().find(|s| {
                s.arity == Arity::Exactly(param_tys.len())
                    && s.params.iter().map(|p| &p.1).eq(param_tys.iter())
                    && !s.finalised
            }) {
                sig.body = FunctionImpl::Defined(f.body.clone());
                if sig.ret.is_none() {
                    sig.ret = Some(body_ty);
                }
                sig.finalised = true;
            }
        }
    }

    fn constraint_scope(&mut self, perspective: Option<&str>, scope: usize, span: Span) -> Option<usize> {
        match perspective {
            None => Some(scope),
            Some(p) => match self.tree.enter(scope, p) {
                Some(s) if self.tree.scope(s).is_virtual() => Some(s),
                _ => {
                    self.error(span, format!("unknown symbol '{}'", p));
                    None
                }
            },
        }
    }

    fn finalize_constraint(&mut self, c: &mut DefConstraint, scope: usize) {
        let Some(scope) = self.constraint_scope(c.perspective.as_deref(), scope, c.span) else {
            return;
        };
        let mut local = LocalScope::new(scope);
        if let Some(guard) = &mut c.guard {
            if let Some(ty) = self.resolve_expr(guard, &mut local) {
                if !ty.is_numeric() {
                    self.error(guard.span(), format!("expected u1, found {}", ty));
                }
            }
        }
        self.resolve_expr(&mut c.body, &mut local);
    }

    fn finalize_property(&mut self, p: &mut DefProperty, scope: usize) {
        let mut local = LocalScope::new(scope);
        self.resolve_expr(&mut p.body, &mut local);
    }

    fn finalize_inrange(&mut self, r: &mut DefInRange, scope: usize) {
        let mut local = LocalScope::new(scope);
        if self.resolve_expr(&mut r.expr, &mut local).is_none() {
            return;
        }
        let bits = power_of_two(&r.bound);
        match bits {
            Some(bits) if bits >= 1 && bits <= self.field.bit_width => {}
            Some(_) | None => {
                self.error(r.span, format!("bound not power of 2: {}", r.bound));
            }
        }
    }

    fn finalize_lookup(&mut self, l: &mut DefLookup, scope: usize) {
        let target_len = l.targets.exprs.len();
        let mut halves: Vec<&mut LookupHalf> = vec![&mut l.targets];
        halves.extend(l.sources.iter_mut());
        for half in halves {
            // Each side resolves in its own local scope; lookups may span
            // modules, so qualified access is allowed.
            let mut local = LocalScope::global(scope);
            if let Some(selector) = &mut half.selector {
                self.resolve_expr(selector, &mut local);
            }
            for e in &mut half.exprs {
                self.resolve_expr(e, &mut local);
            }
        }
        for half in &l.sources {
            if half.exprs.len() > target_len {
                self.error(half.span, "too many targets");
            } else if half.exprs.len() < target_len {
                self.error(half.span, "too few targets");
            }
        }
    }

    /// Sort signs may decorate only a prefix of the columns and the first
    /// sign must be ascending.
    fn check_sign_prefix(&mut self, sources: &[PermutationSource]) {
        if let Some(first) = sources.first() {
            if first.sign == Some(SortSign::Descending) {
                self.error(first.span, "sort signs must start with '+'");
            }
        }
        let mut unsigned_seen = false;
        for s in sources {
            match s.sign {
                Some(_) if unsigned_seen => {
                    self.error(s.span, "sort sign after unsigned column");
                }
                Some(_) => {}
                None => unsigned_seen = true,
            }
        }
    }

    fn resolve_column_list(
        &mut self,
        names: &[(String, Span)],
        scope: usize,
    ) -> Option<Vec<(BindingRef, ColumnBinding)>> {
        let mut out = Vec::new();
        let mut ok = true;
        for (name, span) in names {
            match self
                .tree
                .resolve(scope, &Path::parse(name), Namespace::Symbols)
            {
                Some(found) => match self.tree.binding(found) {
                    Binding::Column(c) => out.push((found, c.clone())),
                    other => {
                        self.error(*span, format!("expected column, found {}", other.describe()));
                        ok = false;
                    }
                },
                None => {
                    self.error(*span, format!("unknown symbol '{}'", name));
                    ok = false;
                }
            }
        }
        ok.then_some(out)
    }

    fn finalize_permutation(&mut self, p: &mut DefPermutation, scope: usize) {
        self.check_sign_prefix(&p.sources);
        let names: Vec<(String, Span)> = p
            .sources
            .iter()
            .map(|s| (s.column.clone(), s.span))
            .collect();
        let Some(sources) = self.resolve_column_list(&names, scope) else {
            return;
        };
        let multiplier = sources[0].1.multiplier;
        if sources.iter().any(|(_, c)| c.multiplier != multiplier) {
            self.error(p.span, "incompatible length multiplier in permutation sources");
            return;
        }
        for (target, (_, source)) in p.targets.iter().zip(&sources) {
            let Some(found) = self
                .tree
                .resolve(scope, &Path::relative(target), Namespace::Symbols)
            else {
                continue;
            };
            if let Binding::Column(c) = self.tree.binding_mut(found) {
                c.ty = source.ty.clone();
                c.multiplier = source.multiplier;
                c.finalised = true;
            }
        }
    }

    fn finalize_sorted(&mut self, s: &mut DefSorted, scope: usize) {
        self.check_sign_prefix(&s.sources);
        let names: Vec<(String, Span)> = s
            .sources
            .iter()
            .map(|c| (c.column.clone(), c.span))
            .collect();
        let Some(sources) = self.resolve_column_list(&names, scope) else {
            return;
        };
        for ((_, c), src) in sources.iter().zip(&s.sources) {
            if c.multiplier != 1 {
                self.error(
                    src.span,
                    "incompatible length multiplier: sorted columns must have multiplier 1",
                );
            }
        }
        if let Some(selector) = &mut s.selector {
            let mut local = LocalScope::new(scope);
            self.resolve_expr(selector, &mut local);
        }
    }

    fn finalize_interleaved(&mut self, i: &DefInterleaved, scope: usize) {
        let names: Vec<(String, Span)> = i
            .sources
            .iter()
            .map(|s| (s.clone(), i.span))
            .collect();
        let Some(sources) = self.resolve_column_list(&names, scope) else {
            return;
        };
        let multiplier = sources[0].1.multiplier;
        if sources.iter().any(|(_, c)| c.multiplier != multiplier) {
            self.error(i.span, "incompatible length multiplier in interleaving sources");
            return;
        }
        let Some(ty) = join_all(sources.iter().map(|(_, c)| &c.ty)) else {
            self.error(i.span, "interleaving sources have incompatible types");
            return;
        };
        let Some(found) = self
            .tree
            .resolve(scope, &Path::relative(&i.target), Namespace::Symbols)
        else {
            return;
        };
        if let Binding::Column(c) = self.tree.binding_mut(found) {
            c.ty = ty;
            c.multiplier = multiplier * sources.len();
            c.finalised = true;
        }
    }

    fn finalize_perspective(&mut self, p: &mut DefPerspective, scope: usize) {
        let mut local = LocalScope::new(scope);
        if let Some(ty) = self.resolve_expr(&mut p.selector, &mut local) {
            if !ty.is_numeric() && ty != Type::Bool {
                self.error(p.selector.span(), format!("expected u1, found {}", ty));
            }
        }
        // Propagate the resolved selector into the virtual scope, then
        // finalise the perspective's own binding.
        if let Some(persp_scope) = self.tree.enter(scope, &p.name) {
            self.tree.set_selector(persp_scope, p.selector.clone());
        }
        if let Some(found) = self
            .tree
            .resolve(scope, &Path::relative(&p.name), Namespace::Symbols)
        {
            if let Binding::Perspective(b) = self.tree.binding_mut(found) {
                b.finalised = true;
            }
        }
    }

    fn finalize_computed(&mut self, c: &mut DefComputed, scope: usize) {
        let Some(found) = self
            .tree
            .resolve(scope, &Path::relative(&c.function), Namespace::Functions)
        else {
            self.error(c.span, format!("unknown symbol '{}'", c.function));
            return;
        };
        let Binding::Function(f) = self.tree.binding(found) else {
            self.error(c.span, format!("expected native, found '{}'", c.function));
            return;
        };
        let native_index = f.signatures.iter().find_map(|s| match s.body {
            FunctionImpl::Native(i) => Some(i),
            _ => None,
        });
        let Some(native_index) = native_index else {
            self.error(
                c.span,
                format!("expected native computation, found function '{}'", c.function),
            );
            return;
        };
        let native = &NATIVES[native_index];
        if !native.accepts_arity(c.sources.len()) {
            self.error(
                c.span,
                format!(
                    "'{}' found {} arguments, expected {}",
                    c.function,
                    c.sources.len(),
                    native.min_arity
                ),
            );
            return;
        }
        let names: Vec<(String, Span)> = c.sources.iter().map(|s| (s.clone(), c.span)).collect();
        let Some(sources) = self.resolve_column_list(&names, scope) else {
            return;
        };
        let inputs: Vec<(Type, usize)> = sources
            .iter()
            .map(|(_, col)| (col.ty.clone(), col.multiplier))
            .collect();
        let outputs = (native.geometry)(&inputs);
        if outputs.len() > c.targets.len() {
            self.error(c.span, "too few targets");
            return;
        }
        if outputs.len() < c.targets.len() {
            self.error(c.span, "too many targets");
            return;
        }
        for (target, (ty, multiplier)) in c.targets.iter().zip(outputs) {
            let Some(found) = self
                .tree
                .resolve(scope, &Path::relative(target), Namespace::Symbols)
            else {
                continue;
            };
            if let Binding::Column(col) = self.tree.binding_mut(found) {
                col.ty = ty;
                col.multiplier = multiplier;
                col.finalised = true;
            }
        }
    }

    fn finalize_computed_column(&mut self, c: &mut DefComputedColumn, scope: usize) {
        let mut local = LocalScope::new(scope);
        let Some(body_ty) = self.resolve_expr(&mut c.body, &mut local) else {
            return;
        };
        let multiplier = local.context.map(|(_, m)| m).unwrap_or(1);
        let Some(found) = self
            .tree
            .resolve(scope, &Path::relative(&c.target.name), Namespace::Symbols)
        else {
            return;
        };
        if let Binding::Column(col) = self.tree.binding_mut(found) {
            if col.ty == Type::Int {
                col.ty = body_ty;
            }
            col.multiplier = multiplier;
            col.finalised = true;
        }
    }

    // ── Expression resolution and type inference ──

    fn resolve_expr(&mut self, e: &mut Expr, scope: &mut LocalScope) -> Option<Type> {
        match e {
            Expr::Const(n, _) => Some(Type::of_constant(n)),
            Expr::LocalVariable { index, .. } => {
                let index = *index;
                scope
                    .locals
                    .iter()
                    .find(|l| l.index == index)
                    .map(|l| l.ty.clone())
            }
            Expr::Symbol { path, binding, span } => {
                let span = *span;
                if path.depth() == 1 && !path.is_absolute() {
                    if let Some(local) = scope.local(path.name()) {
                        let replacement = Expr::LocalVariable {
                            index: local.index,
                            name: local.name.clone(),
                            span,
                        };
                        let ty = local.ty.clone();
                        *e = replacement;
                        return Some(ty);
                    }
                }
                let Some(found) = self.tree.resolve(scope.scope, path, Namespace::Symbols) else {
                    self.error(span, format!("unknown symbol '{}'", path));
                    return None;
                };
                *binding = Some(found);
                match self.tree.binding(found).clone() {
                    Binding::Column(c) => {
                        if scope.is_pure {
                            self.error(
                                span,
                                format!("column '{}' is not allowed in a pure context", c.path),
                            );
                            return None;
                        }
                        if path.depth() > 1
                            && !scope.is_global
                            && c.context != self.tree.scope(self.tree.concrete_module(scope.scope)).path
                        {
                            self.error(span, format!("unknown symbol '{}'", path));
                            return None;
                        }
                        self.fix_context(scope, c.context.clone(), c.multiplier, span);
                        Some(match c.array {
                            Some((lo, hi)) => Type::Array {
                                element: Box::new(c.ty.clone()),
                                lo,
                                hi,
                            },
                            None => c.ty.clone(),
                        })
                    }
                    Binding::Constant(c) => {
                        if scope.is_constant && c.is_extern {
                            self.error(
                                span,
                                format!("extern constant '{}' is not allowed here", c.path),
                            );
                            return None;
                        }
                        Some(match (&c.ty, &c.value) {
                            (Some(ty), _) => ty.clone(),
                            (None, Some(v)) => Type::of_constant(v),
                            (None, None) => Type::Int,
                        })
                    }
                    Binding::Perspective(p) => {
                        self.error(span, format!("perspective '{}' is not a value", p.path));
                        None
                    }
                    Binding::Function(f) => {
                        self.error(span, format!("function '{}' is not a value", f.path));
                        None
                    }
                }
            }
            Expr::ArrayAccess { base, index, span } => {
                let span = *span;
                let base_ty = self.resolve_expr(base, scope)?;
                let index_ty = self.resolve_expr(index, scope)?;
                if !index_ty.is_numeric() {
                    self.error(index.span(), format!("expected int, found {}", index_ty));
                    return None;
                }
                match base_ty {
                    Type::Array { element, .. } => Some(*element),
                    other => {
                        self.error(span, format!("expected array, found {}", other));
                        None
                    }
                }
            }
            Expr::Funcall { op, args, span } => {
                let span = *span;
                let op = *op;
                let mut tys = Vec::new();
                for a in args.iter_mut() {
                    tys.push(self.resolve_expr(a, scope)?);
                }
                for (t, a) in tys.iter().zip(args.iter()) {
                    if !t.is_numeric() {
                        self.error(a.span(), format!("expected int, found {}", t));
                        return None;
                    }
                }
                let joined = match op {
                    ArithOp::Add | ArithOp::Sub => join_all(tys.iter()),
                    ArithOp::Mul => meet_all(tys.iter()),
                };
                match joined {
                    Some(t) => Some(t),
                    None => {
                        self.error(span, "incompatible operand types");
                        None
                    }
                }
            }
            Expr::Exponent { base, exponent, span } => {
                let span = *span;
                let base_ty = self.resolve_expr(base, scope)?;
                self.resolve_expr(exponent, scope)?;
                if self.const_value(exponent).is_none() {
                    self.error(span, "expected constant exponent");
                    return None;
                }
                Some(base_ty)
            }
            Expr::Normalise(inner, _) => {
                let ty = self.resolve_expr(inner, scope)?;
                if !ty.is_numeric() && ty != Type::Bool {
                    self.error(inner.span(), format!("expected int, found {}", ty));
                    return None;
                }
                Some(Type::Uint(1))
            }
            Expr::Shift { body, offset, span } => {
                let span = *span;
                let body_ty = self.resolve_expr(body, scope)?;
                self.resolve_expr(offset, scope)?;
                if self.const_value(offset).is_none() {
                    self.error(span, "expected constant shift amount");
                    return None;
                }
                Some(body_ty)
            }
            Expr::If {
                condition,
                then_branch,
                else_branch,
                semantics,
                span,
            } => {
                let span = *span;
                let cond_ty = self.resolve_expr(condition, scope)?;
                let sem = match cond_ty.condition_semantics() {
                    Some(s) => s,
                    None => {
                        self.error(
                            condition.span(),
                            format!("expected loobean, found {}", cond_ty),
                        );
                        return None;
                    }
                };
                *semantics = Some(sem);
                let then_ty = self.resolve_expr(then_branch, scope)?;
                let else_ty = match else_branch {
                    Some(b) => Some(self.resolve_expr(b, scope)?),
                    None => None,
                };
                match else_ty {
                    None => Some(then_ty),
                    Some(else_ty) => {
                        let combined = match sem {
                            ConditionSemantics::Loobean => then_ty.glb(&else_ty),
                            ConditionSemantics::Boolean => then_ty.lub(&else_ty),
                        };
                        match combined {
                            Some(t) => Some(t),
                            None => {
                                self.error(
                                    span,
                                    format!("expected {}, found {}", then_ty, else_ty),
                                );
                                None
                            }
                        }
                    }
                }
            }
            Expr::List(items, _) => {
                let mut tys = Vec::new();
                for item in items.iter_mut() {
                    if let Some(t) = self.resolve_expr(item, scope) {
                        tys.push(t);
                    }
                }
                Some(join_all(tys.iter()).unwrap_or(Type::Bool))
            }
            Expr::For {
                index,
                local,
                body,
                span,
                ..
            } => {
                let span = *span;
                let mut inner = scope.child();
                let idx = inner.declare_local(index, Type::Int);
                *local = Some(idx);
                let ty = self.resolve_expr(body, &mut inner)?;
                self.merge_child_context(scope, &inner, span);
                Some(ty)
            }
            Expr::Let { bindings, body, span } => {
                let span = *span;
                let mut inner = scope.child();
                for (name, local, value) in bindings.iter_mut() {
                    let ty = self.resolve_expr(value, &mut inner)?;
                    let idx = inner.declare_local(name, ty);
                    *local = Some(idx);
                }
                let ty = self.resolve_expr(body, &mut inner)?;
                self.merge_child_context(scope, &inner, span);
                Some(ty)
            }
            Expr::Reduce {
                fun,
                list,
                signature,
                span,
            } => {
                let span = *span;
                let list_ty = self.resolve_expr(list, scope)?;
                let Expr::Symbol { path, binding, .. } = fun.as_mut() else {
                    self.error(fun.span(), "expected function name");
                    return None;
                };
                let Some(found) = self.tree.resolve(scope.scope, path, Namespace::Functions)
                else {
                    self.error(span, format!("unknown symbol '{}'", path));
                    return None;
                };
                *binding = Some(found);
                let Binding::Function(f) = self.tree.binding(found) else {
                    self.error(span, format!("unknown symbol '{}'", path));
                    return None;
                };
                let candidates = f.select(2);
                if candidates.is_empty() {
                    self.error(
                        span,
                        format!("'{}' found 2 arguments, expected another arity", path),
                    );
                    return None;
                }
                *signature = Some(candidates[0]);
                Some(list_ty)
            }
            Expr::Invoke {
                fun,
                args,
                signature,
                span,
            } => {
                let span = *span;
                let mut arg_tys = Vec::new();
                for a in args.iter_mut() {
                    arg_tys.push(self.resolve_expr(a, scope)?);
                }
                let Expr::Symbol { path, binding, .. } = fun.as_mut() else {
                    self.error(fun.span(), "expected function name");
                    return None;
                };
                let path = path.clone();
                let Some(found) = self.tree.resolve(scope.scope, &path, Namespace::Functions)
                else {
                    self.error(span, format!("unknown symbol '{}'", path));
                    return None;
                };
                *binding = Some(found);
                let Binding::Function(f) = self.tree.binding(found).clone() else {
                    self.error(span, format!("unknown symbol '{}'", path));
                    return None;
                };
                let (sig_index, ty) =
                    self.select_overload(&f, &path, &arg_tys, scope, span)?;
                *signature = Some(sig_index);
                Some(ty)
            }
            Expr::Equation { left, right, .. } => {
                self.resolve_expr(left, scope)?;
                self.resolve_expr(right, scope)?;
                Some(Type::Bool)
            }
            Expr::Not(inner, _) => {
                let ty = self.resolve_expr(inner, scope)?;
                if ty != Type::Bool {
                    self.error(inner.span(), format!("expected bool, found {}", ty));
                    return None;
                }
                Some(Type::Bool)
            }
            Expr::Connective { args, .. } => {
                for a in args.iter_mut() {
                    let ty = self.resolve_expr(a, scope)?;
                    if ty != Type::Bool {
                        self.error(a.span(), format!("expected bool, found {}", ty));
                        return None;
                    }
                }
                Some(Type::Bool)
            }
            Expr::Cast {
                body,
                ty,
                unchecked,
                span,
            } => {
                let span = *span;
                let target = Type::from_expr(ty);
                let body_ty = self.resolve_expr(body, scope)?;
                if !*unchecked && !body_ty.is_subtype_of(&target) {
                    self.error(
                        span,
                        format!("invalid cast from {} to {}", body_ty, target),
                    );
                    return None;
                }
                Some(target)
            }
            Expr::Concat { limbs, .. } => {
                let mut total = 0;
                for limb in limbs.iter_mut() {
                    let ty = self.resolve_expr(limb, scope)?;
                    match ty.bit_width() {
                        Some(w) if ty.is_numeric() => total += w,
                        _ => {
                            self.error(
                                limb.span(),
                                format!("fixed-width type required, found {}", ty),
                            );
                            return None;
                        }
                    }
                }
                Some(Type::Uint(total))
            }
            Expr::Debug(items, _) => {
                let mut tys = Vec::new();
                for item in items.iter_mut() {
                    if let Some(t) = self.resolve_expr(item, scope) {
                        tys.push(t);
                    }
                }
                Some(join_all(tys.iter()).unwrap_or(Type::Bool))
            }
        }
    }

    /// Record or check the (module, multiplier) context of a column
    /// access.
    fn fix_context(&mut self, scope: &mut LocalScope, module: Path, multiplier: usize, span: Span) {
        match &scope.context {
            None => scope.context = Some((module, multiplier)),
            Some((m, k)) if *m == module && *k == multiplier => {}
            Some((m, k)) => {
                self.error(
                    span,
                    format!(
                        "conflicting context: {}×{} does not agree with {}×{}",
                        module, multiplier, m, k
                    ),
                );
            }
        }
    }

    fn merge_child_context(&mut self, scope: &mut LocalScope, child: &LocalScope, span: Span) {
        if let Some((m, k)) = child.context.clone() {
            self.fix_context(scope, m, k, span);
        }
    }

    /// The most specific overload whose parameters accept the arguments.
    fn select_overload(
        &mut self,
        f: &FunctionBinding,
        path: &Path,
        arg_tys: &[Type],
        scope: &LocalScope,
        span: Span,
    ) -> Option<(usize, Type)> {
        let n = arg_tys.len();
        let by_arity = f.select(n);
        if by_arity.is_empty() {
            let arities = f.known_arities();
            let expected = arities
                .iter()
                .filter(|&&k| k > n)
                .min()
                .or_else(|| arities.iter().filter(|&&k| k < n).max());
            match expected {
                Some(m) => self.error(
                    span,
                    format!("'{}' found {} arguments, expected {}", path, n, m),
                ),
                None => self.error(span, format!("unknown symbol '{}'", path)),
            }
            return None;
        }
        let accepted: Vec<usize> = by_arity
            .iter()
            .copied()
            .filter(|&i| signature_accepts(&f.signatures[i], arg_tys))
            .collect();
        let chosen = match accepted.len() {
            0 => {
                // Arity matched but no overload takes these types: report
                // against the widest candidate.
                let widest = by_arity
                    .iter()
                    .copied()
                    .max_by_key(|&i| {
                        f.signatures[i]
                            .params
                            .iter()
                            .map(|(_, t)| t.bit_width().unwrap_or(usize::MAX))
                            .max()
                            .unwrap_or(0)
                    })
                    .expect("non-empty");
                let sig = &f.signatures[widest];
                for ((_, param), arg) in sig.params.iter().zip(arg_tys) {
                    if param != &Type::Int && !arg.is_subtype_of(param) {
                        self.error(span, format!("expected {}, found {}", param, arg));
                        return None;
                    }
                }
                self.error(span, format!("ambiguous invocation of '{}'", path));
                return None;
            }
            1 => accepted[0],
            _ => {
                // Most specific: pointwise narrowest parameters.
                let most_specific = accepted.iter().copied().find(|&i| {
                    accepted.iter().all(|&j| {
                        f.signatures[i]
                            .params
                            .iter()
                            .zip(&f.signatures[j].params)
                            .all(|((_, a), (_, b))| a.is_subtype_of(b) || a == b)
                    })
                });
                match most_specific {
                    Some(i) => i,
                    None => {
                        self.error(span, format!("ambiguous invocation of '{}'", path));
                        return None;
                    }
                }
            }
        };
        let sig = &f.signatures[chosen];
        if scope.is_pure && !sig.pure {
            self.error(
                span,
                format!("impure function '{}' is not allowed in a pure context", path),
            );
            return None;
        }
        let ty = match &sig.body {
            FunctionImpl::Native(_) => {
                self.error(
                    span,
                    format!("native computation '{}' is not allowed in an expression", path),
                );
                return None;
            }
            FunctionImpl::Intrinsic(op) => match op {
                IntrinsicOp::Add | IntrinsicOp::Sub => {
                    join_all(arg_tys.iter()).unwrap_or(Type::Int)
                }
                IntrinsicOp::Mul => meet_all(arg_tys.iter()).unwrap_or(Type::Int),
                IntrinsicOp::Exp => arg_tys.first().cloned().unwrap_or(Type::Int),
                IntrinsicOp::Normalise => Type::Uint(1),
                IntrinsicOp::Eq => Type::Bool,
            },
            FunctionImpl::Defined(_) => sig.ret.clone().unwrap_or(Type::Int),
        };
        Some((chosen, ty))
    }

    // ── Constant folding ──

    /// The numeric value of an expression over literals, finalised
    /// constants and arithmetic.
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
}

fn signature_accepts(sig: &FunctionSignature, arg_tys: &[Type]) -> bool {
    debug_assert!(sig.arity.accepts(arg_tys.len()));
    match &sig.body {
        FunctionImpl::Defined(_) => sig
            .params
            .iter()
            .zip(arg_tys)
            .all(|((_, param), arg)| param == &Type::Int || arg.is_subtype_of(param)),
        // Intrinsics take any numeric operands.
        FunctionImpl::Intrinsic(_) => arg_tys.iter().all(Type::is_numeric),
        FunctionImpl::Native(_) => true,
    }
}

/// `Some(k)` when `n == 2^k`.
fn power_of_two(n: &BigInt) -> Option<usize> {
    if n.is_positive() && (n & (n - BigInt::one())).is_zero() {
        Some(n.bits() as usize - 1)
    } else {
        None
    }
}

// ── Declaration dependencies ──

fn declaration_dependencies(decl: &Declaration, out: &mut Vec<Dep>) {
    let mut bound = HashSet::new();
    match decl {
        Declaration::Const(d) => {
            for c in &d.constants {
                expr_dependencies(&c.value, &mut bound, out);
            }
        }
        Declaration::Fun(f) => {
            for p in &f.params {
                bound.insert(p.name.clone());
            }
            expr_dependencies(&f.body, &mut bound, out);
        }
        Declaration::Constraint(c) => {
            if let Some(p) = &c.perspective {
                out.push(Dep {
                    path: Path::relative(p),
                    ns: Namespace::Symbols,
                });
            }
            if let Some(g) = &c.guard {
                expr_dependencies(g, &mut bound, out);
            }
            expr_dependencies(&c.body, &mut bound, out);
        }
        Declaration::Property(p) => expr_dependencies(&p.body, &mut bound, out),
        Declaration::InRange(r) => expr_dependencies(&r.expr, &mut bound, out),
        Declaration::Lookup(l) => {
            for half in std::iter::once(&l.targets).chain(&l.sources) {
                if let Some(s) = &half.selector {
                    expr_dependencies(s, &mut bound, out);
                }
                for e in &half.exprs {
                    expr_dependencies(e, &mut bound, out);
                }
            }
        }
        Declaration::Permutation(d) => {
            for s in &d.sources {
                out.push(Dep {
                    path: Path::parse(&s.column),
                    ns: Namespace::Symbols,
                });
            }
        }
        Declaration::Sorted(d) => {
            for s in &d.sources {
                out.push(Dep {
                    path: Path::parse(&s.column),
                    ns: Namespace::Symbols,
                });
            }
            if let Some(s) = &d.selector {
                expr_dependencies(s, &mut bound, out);
            }
        }
        Declaration::Interleaved(d) => {
            for s in &d.sources {
                out.push(Dep {
                    path: Path::parse(s),
                    ns: Namespace::Symbols,
                });
            }
        }
        Declaration::Perspective(p) => expr_dependencies(&p.selector, &mut bound, out),
        Declaration::Computed(d) => {
            out.push(Dep {
                path: Path::relative(&d.function),
                ns: Namespace::Functions,
            });
            for s in &d.sources {
                out.push(Dep {
                    path: Path::parse(s),
                    ns: Namespace::Symbols,
                });
            }
        }
        Declaration::ComputedColumn(d) => expr_dependencies(&d.body, &mut bound, out),
        Declaration::Columns(_) | Declaration::Aliases(_) => {}
    }
}

fn expr_dependencies(e: &Expr, bound: &mut HashSet<String>, out: &mut Vec<Dep>) {
    match e {
        Expr::Const(..) | Expr::LocalVariable { .. } => {}
        Expr::Symbol { path, .. } => {
            if !(path.depth() == 1 && bound.contains(path.name())) {
                out.push(Dep {
                    path: path.clone(),
                    ns: Namespace::Symbols,
                });
            }
        }
        Expr::ArrayAccess { base, index, .. } => {
            expr_dependencies(base, bound, out);
            expr_dependencies(index, bound, out);
        }
        Expr::Funcall { args, .. } | Expr::Connective { args, .. } => {
            for a in args {
                expr_dependencies(a, bound, out);
            }
        }
        Expr::Exponent { base, exponent, .. } => {
            expr_dependencies(base, bound, out);
            expr_dependencies(exponent, bound, out);
        }
        Expr::Normalise(inner, _) | Expr::Not(inner, _) => expr_dependencies(inner, bound, out),
        Expr::Shift { body, offset, .. } => {
            expr_dependencies(body, bound, out);
            expr_dependencies(offset, bound, out);
        }
        Expr::If {
            condition,
            then_branch,
            else_branch,
            ..
        } => {
            expr_dependencies(condition, bound, out);
            expr_dependencies(then_branch, bound, out);
            if let Some(e) = else_branch {
                expr_dependencies(e, bound, out);
            }
        }
        Expr::List(items, _) | Expr::Debug(items, _) => {
            for i in items {
                expr_dependencies(i, bound, out);
            }
        }
        Expr::For { index, body, .. } => {
            let fresh = bound.insert(index.clone());
            expr_dependencies(body, bound, out);
            if fresh {
                bound.remove(index);
            }
        }
        Expr::Let { bindings, body, .. } => {
            let mut added = Vec::new();
            for (name, _, value) in bindings {
                expr_dependencies(value, bound, out);
                if bound.insert(name.clone()) {
                    added.push(name.clone());
                }
            }
            expr_dependencies(body, bound, out);
            for name in added {
                bound.remove(&name);
            }
        }
        Expr::Reduce { fun, list, .. } => {
            if let Expr::Symbol { path, .. } = fun.as_ref() {
                out.push(Dep {
                    path: path.clone(),
                    ns: Namespace::Functions,
                });
            }
            expr_dependencies(list, bound, out);
        }
        Expr::Invoke { fun, args, .. } => {
            if let Expr::Symbol { path, .. } = fun.as_ref() {
                out.push(Dep {
                    path: path.clone(),
                    ns: Namespace::Functions,
                });
            }
            for a in args {
                expr_dependencies(a, bound, out);
            }
        }
        Expr::Equation { left, right, .. } => {
            expr_dependencies(left, bound, out);
            expr_dependencies(right, bound, out);
        }
        Expr::Cast { body, .. } => expr_dependencies(body, bound, out),
        Expr::Concat { limbs, .. } => {
            for l in limbs {
                expr_dependencies(l, bound, out);
            }
        }
    }
}

/// First cycle found among the pending tasks, if any.
fn find_cycle(pending: &[usize], edges: &HashMap<usize, Vec<usize>>) -> Option<Vec<usize>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        White,
        Grey,
        Black,
    }
    let mut marks: HashMap<usize, Mark> = pending.iter().map(|&i| (i, Mark::White)).collect();

    fn visit(
        node: usize,
        edges: &HashMap<usize, Vec<usize>>,
        marks: &mut HashMap<usize, Mark>,
        stack: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        marks.insert(node, Mark::Grey);
        stack.push(node);
        for &next in edges.get(&node).into_iter().flatten() {
            match marks.get(&next) {
                Some(Mark::Grey) => {
                    let start = stack.iter().position(|&n| n == next).unwrap_or(0);
                    return Some(stack[start..].to_vec());
                }
                Some(Mark::White) => {
                    if let Some(cycle) = visit(next, edges, marks, stack) {
                        return Some(cycle);
                    }
                }
                _ => {}
            }
        }
        stack.pop();
        marks.insert(node, Mark::Black);
        None
    }

    for &node in pending {
        if marks[&node] == Mark::White {
            let mut stack = Vec::new();
            if let Some(cycle) = visit(node, edges, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}
