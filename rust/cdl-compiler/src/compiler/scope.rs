//! Hierarchical symbol table: the module tree, its bindings, and the
//! resolution rules over both.
//!
//! Scopes live in an arena and refer to each other by index; a binding is
//! addressed by `(scope, index)` so later finalization stays visible to
//! every reference that resolved before it. Each scope keeps two
//! namespaces: value symbols (columns, constants, perspectives) and
//! functions, which overload.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use num_bigint::BigInt;

use crate::compiler::ast::{ArithOp, DisplayHint, EquationKind, Expr};
use crate::compiler::path::Path;
use crate::compiler::span::Span;
use crate::compiler::types::Type;

/// Address of a binding: `(scope index, binding index)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BindingRef {
    pub scope: usize,
    pub index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Symbols,
    Functions,
}

// ── Bindings ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnKind {
    Atomic,
    Interleaved,
    Permuted,
    Computed,
    Extern,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnBinding {
    pub path: Path,
    /// The owning module; for perspective columns this is the enclosing
    /// module, not the perspective.
    pub context: Path,
    pub perspective: Option<String>,
    pub ty: Type,
    pub multiplier: usize,
    pub array: Option<(usize, usize)>,
    pub kind: ColumnKind,
    pub computed: bool,
    pub must_prove: bool,
    pub display: Option<DisplayHint>,
    pub finalised: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstantBinding {
    pub path: Path,
    pub ty: Option<Type>,
    /// Numeric value, known once finalised.
    pub value: Option<BigInt>,
    pub is_extern: bool,
    pub finalised: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Arity {
    Exactly(usize),
    AtLeast(usize),
    Between(usize, usize),
}

impl Arity {
    pub fn accepts(&self, n: usize) -> bool {
        match self {
            Arity::Exactly(k) => n == *k,
            Arity::AtLeast(k) => n >= *k,
            Arity::Between(lo, hi) => n >= *lo && n <= *hi,
        }
    }
}

/// Built-in operators exposed as function bindings so they can be aliased
/// and folded over with `reduce`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntrinsicOp {
    Add,
    Sub,
    Mul,
    Exp,
    Normalise,
    Eq,
}

impl IntrinsicOp {
    pub fn name(&self) -> &'static str {
        match self {
            IntrinsicOp::Add => "+",
            IntrinsicOp::Sub => "-",
            IntrinsicOp::Mul => "*",
            IntrinsicOp::Exp => "^",
            IntrinsicOp::Normalise => "~",
            IntrinsicOp::Eq => "=",
        }
    }

    pub fn arity(&self) -> Arity {
        match self {
            IntrinsicOp::Add | IntrinsicOp::Sub | IntrinsicOp::Mul => Arity::AtLeast(1),
            IntrinsicOp::Exp | IntrinsicOp::Eq => Arity::Exactly(2),
            IntrinsicOp::Normalise => Arity::Exactly(1),
        }
    }

    /// Construct the n-ary body this operator stands for.
    pub fn build(&self, mut args: Vec<Expr>, span: Span) -> Expr {
        match self {
            IntrinsicOp::Add => Expr::Funcall {
                op: ArithOp::Add,
                args,
                span,
            },
            IntrinsicOp::Sub => Expr::Funcall {
                op: ArithOp::Sub,
                args,
                span,
            },
            IntrinsicOp::Mul => Expr::Funcall {
                op: ArithOp::Mul,
                args,
                span,
            },
            IntrinsicOp::Exp => {
                let exponent = args.pop().expect("checked arity");
                let base = args.pop().expect("checked arity");
                Expr::Exponent {
                    base: Box::new(base),
                    exponent: Box::new(exponent),
                    span,
                }
            }
            IntrinsicOp::Normalise => {
                Expr::Normalise(Box::new(args.pop().expect("checked arity")), span)
            }
            IntrinsicOp::Eq => {
                let right = args.pop().expect("checked arity");
                let left = args.pop().expect("checked arity");
                Expr::Equation {
                    kind: EquationKind::Eq,
                    left: Box::new(left),
                    right: Box::new(right),
                    span,
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FunctionImpl {
    /// User-defined body; replaced by its resolved form at finalization.
    Defined(Expr),
    Intrinsic(IntrinsicOp),
    /// Index into the native catalogue.
    Native(usize),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionSignature {
    pub params: Vec<(String, Type)>,
    pub ret: Option<Type>,
    pub pure: bool,
    pub arity: Arity,
    pub body: FunctionImpl,
    pub finalised: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionBinding {
    pub path: Path,
    pub signatures: Vec<FunctionSignature>,
}

impl FunctionBinding {
    pub fn has_arity(&self, n: usize) -> bool {
        self.signatures.iter().any(|s| s.arity.accepts(n))
    }

    /// Indices of signatures accepting `n` arguments.
    pub fn select(&self, n: usize) -> Vec<usize> {
        self.signatures
            .iter()
            .enumerate()
            .filter(|(_, s)| s.arity.accepts(n))
            .map(|(i, _)| i)
            .collect()
    }

    /// Fixed arities declared by this binding, for arity-hint diagnostics.
    pub fn known_arities(&self) -> Vec<usize> {
        self.signatures
            .iter()
            .filter_map(|s| match s.arity {
                Arity::Exactly(k) => Some(k),
                Arity::AtLeast(_) => None,
                Arity::Between(_, _) => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerspectiveBinding {
    pub path: Path,
    /// The virtual scope holding the perspective's columns.
    pub scope: usize,
    pub finalised: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Binding {
    Column(ColumnBinding),
    Constant(ConstantBinding),
    Function(FunctionBinding),
    Perspective(PerspectiveBinding),
}

impl Binding {
    pub fn path(&self) -> &Path {
        match self {
            Binding::Column(b) => &b.path,
            Binding::Constant(b) => &b.path,
            Binding::Function(b) => &b.path,
            Binding::Perspective(b) => &b.path,
        }
    }

    pub fn is_finalised(&self) -> bool {
        match self {
            Binding::Column(b) => b.finalised,
            Binding::Constant(b) => b.finalised,
            Binding::Function(b) => b.signatures.iter().all(|s| s.finalised),
            Binding::Perspective(b) => b.finalised,
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Binding::Column(_) => "column",
            Binding::Constant(_) => "constant",
            Binding::Function(_) => "function",
            Binding::Perspective(_) => "perspective",
        }
    }
}

// ── The scope tree ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleScope {
    pub path: Path,
    /// Present on virtual (perspective) scopes only.
    pub selector: Option<Expr>,
    pub parent: Option<usize>,
    pub children: BTreeMap<String, usize>,
    pub bindings: Vec<Binding>,
    symbols: HashMap<String, usize>,
    functions: HashMap<String, usize>,
}

impl ModuleScope {
    pub fn is_virtual(&self) -> bool {
        self.selector.is_some()
    }

    fn namespace(&self, ns: Namespace) -> &HashMap<String, usize> {
        match ns {
            Namespace::Symbols => &self.symbols,
            Namespace::Functions => &self.functions,
        }
    }

    /// Binding names in insertion order, for deterministic iteration.
    pub fn binding_names(&self, ns: Namespace) -> Vec<(String, usize)> {
        let map = self.namespace(ns);
        let mut names: Vec<(String, usize)> = map.iter().map(|(k, v)| (k.clone(), *v)).collect();
        names.sort_by_key(|(_, i)| *i);
        names
    }
}

pub const ROOT_SCOPE: usize = 0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeTree {
    scopes: Vec<ModuleScope>,
}

impl Default for ScopeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeTree {
    /// A tree holding only the root (prelude) scope.
    pub fn new() -> Self {
        ScopeTree {
            scopes: vec![ModuleScope {
                path: Path::root(),
                selector: None,
                parent: None,
                children: BTreeMap::new(),
                bindings: Vec::new(),
                symbols: HashMap::new(),
                functions: HashMap::new(),
            }],
        }
    }

    pub fn scope(&self, id: usize) -> &ModuleScope {
        &self.scopes[id]
    }

    pub fn scope_ids(&self) -> impl Iterator<Item = usize> {
        0..self.scopes.len()
    }

    pub fn binding(&self, r: BindingRef) -> &Binding {
        &self.scopes[r.scope].bindings[r.index]
    }

    pub fn binding_mut(&mut self, r: BindingRef) -> &mut Binding {
        &mut self.scopes[r.scope].bindings[r.index]
    }

    /// Create a child scope. Fails when the name is already taken by a
    /// sibling scope.
    pub fn declare(
        &mut self,
        parent: usize,
        name: &str,
        selector: Option<Expr>,
    ) -> Result<usize, ()> {
        if self.scopes[parent].children.contains_key(name) {
            return Err(());
        }
        let id = self.scopes.len();
        let path = self.scopes[parent].path.extend(name);
        let virtual_scope = selector.is_some();
        self.scopes.push(ModuleScope {
            path: path.clone(),
            selector,
            parent: Some(parent),
            children: BTreeMap::new(),
            bindings: Vec::new(),
            symbols: HashMap::new(),
            functions: HashMap::new(),
        });
        self.scopes[parent].children.insert(name.to_string(), id);
        if virtual_scope {
            // A perspective is addressable as a symbol of its module.
            let binding = Binding::Perspective(PerspectiveBinding {
                path,
                scope: id,
                finalised: false,
            });
            let _ = self.define(parent, name, binding);
        }
        Ok(id)
    }

    /// Insert a binding; fails on a duplicate name within the namespace.
    pub fn define(&mut self, scope: usize, name: &str, binding: Binding) -> Result<BindingRef, ()> {
        let ns = match binding {
            Binding::Function(_) => Namespace::Functions,
            _ => Namespace::Symbols,
        };
        let map = match ns {
            Namespace::Symbols => &self.scopes[scope].symbols,
            Namespace::Functions => &self.scopes[scope].functions,
        };
        if map.contains_key(name) {
            return Err(());
        }
        let index = self.scopes[scope].bindings.len();
        self.scopes[scope].bindings.push(binding);
        let map = match ns {
            Namespace::Symbols => &mut self.scopes[scope].symbols,
            Namespace::Functions => &mut self.scopes[scope].functions,
        };
        map.insert(name.to_string(), index);
        Ok(BindingRef { scope, index })
    }

    /// Add an overload to an existing function binding, or create one.
    /// Fails when an overload with the same arity and parameter types is
    /// already present.
    pub fn define_function(
        &mut self,
        scope: usize,
        name: &str,
        path: Path,
        signature: FunctionSignature,
    ) -> Result<BindingRef, ()> {
        if let Some(&index) = self.scopes[scope].functions.get(name) {
            let Binding::Function(f) = &mut self.scopes[scope].bindings[index] else {
                return Err(());
            };
            let duplicate = f.signatures.iter().any(|s| {
                s.arity == signature.arity
                    && s.params.iter().map(|p| &p.1).eq(signature.params.iter().map(|p| &p.1))
            });
            if duplicate {
                return Err(());
            }
            f.signatures.push(signature);
            Ok(BindingRef { scope, index })
        } else {
            self.define(
                scope,
                name,
                Binding::Function(FunctionBinding {
                    path,
                    signatures: vec![signature],
                }),
            )
        }
    }

    /// Bind an alternative name to an existing binding in `ns`. Fails when
    /// the target does not exist (yet) or the alias name is taken.
    pub fn alias(&mut self, scope: usize, alias: &str, target: &str, ns: Namespace) -> Result<(), ()> {
        let scope_ref = &self.scopes[scope];
        let Some(&index) = scope_ref.namespace(ns).get(target) else {
            return Err(());
        };
        let map = match ns {
            Namespace::Symbols => &mut self.scopes[scope].symbols,
            Namespace::Functions => &mut self.scopes[scope].functions,
        };
        if map.contains_key(alias) {
            return Err(());
        }
        map.insert(alias.to_string(), index);
        Ok(())
    }

    /// Descend into a named submodule.
    pub fn enter(&self, scope: usize, name: &str) -> Option<usize> {
        self.scopes[scope].children.get(name).copied()
    }

    /// Replace a virtual scope's selector with its resolved form.
    pub fn set_selector(&mut self, scope: usize, selector: Expr) {
        self.scopes[scope].selector = Some(selector);
    }

    fn lookup_here(&self, scope: usize, name: &str, ns: Namespace) -> Option<BindingRef> {
        self.scopes[scope]
            .namespace(ns)
            .get(name)
            .map(|&index| BindingRef { scope, index })
    }

    /// Resolve a path from `from` following the scope rules: absolute
    /// paths start at the root; unqualified names climb the parent chain;
    /// qualified names descend from the nearest ancestor owning the head
    /// segment.
    pub fn resolve(&self, from: usize, path: &Path, ns: Namespace) -> Option<BindingRef> {
        if path.depth() == 0 {
            return None;
        }
        if path.is_absolute() {
            return self.resolve_qualified(ROOT_SCOPE, path.segments(), ns);
        }
        if path.depth() == 1 {
            let name = path.name();
            let mut scope = from;
            loop {
                if let Some(found) = self.lookup_here(scope, name, ns) {
                    return Some(found);
                }
                match self.scopes[scope].parent {
                    Some(p) => scope = p,
                    None => return None,
                }
            }
        }
        // Qualified: find the nearest enclosing scope with a child named
        // like the head, then descend.
        let head = path.head().expect("depth checked");
        let mut scope = from;
        loop {
            if self.scopes[scope].children.contains_key(head) {
                return self.resolve_qualified(scope, path.segments(), ns);
            }
            match self.scopes[scope].parent {
                Some(p) => scope = p,
                None => return None,
            }
        }
    }

    fn resolve_qualified(&self, mut scope: usize, segments: &[String], ns: Namespace) -> Option<BindingRef> {
        let (name, submodules) = segments.split_last()?;
        for seg in submodules {
            scope = self.enter(scope, seg)?;
        }
        self.lookup_here(scope, name, ns)
    }

    /// The scope of a top-level module, the root for the empty name.
    pub fn module_scope(&self, name: &str) -> Option<usize> {
        if name.is_empty() {
            Some(ROOT_SCOPE)
        } else {
            self.enter(ROOT_SCOPE, name)
        }
    }

    /// The enclosing non-virtual module of a scope.
    pub fn concrete_module(&self, mut scope: usize) -> usize {
        while self.scopes[scope].is_virtual() {
            scope = self.scopes[scope].parent.expect("virtual scopes have parents");
        }
        scope
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(path: Path) -> Binding {
        Binding::Column(ColumnBinding {
            context: path.parent(),
            path,
            perspective: None,
            ty: Type::Uint(8),
            multiplier: 1,
            array: None,
            kind: ColumnKind::Atomic,
            computed: false,
            must_prove: false,
            display: None,
            finalised: true,
        })
    }

    #[test]
    fn test_define_and_duplicate() {
        let mut tree = ScopeTree::new();
        let m = tree.declare(ROOT_SCOPE, "mem", None).unwrap();
        assert!(tree.define(m, "X", column(Path::parse("/mem/X"))).is_ok());
        assert!(tree.define(m, "X", column(Path::parse("/mem/X"))).is_err());
    }

    #[test]
    fn test_unqualified_resolution_climbs() {
        let mut tree = ScopeTree::new();
        tree.define(ROOT_SCOPE, "G", column(Path::parse("/G"))).unwrap();
        let m = tree.declare(ROOT_SCOPE, "mem", None).unwrap();
        let found = tree.resolve(m, &Path::relative("G"), Namespace::Symbols).unwrap();
        assert_eq!(found.scope, ROOT_SCOPE);
    }

    #[test]
    fn test_qualified_resolution() {
        let mut tree = ScopeTree::new();
        let mem = tree.declare(ROOT_SCOPE, "mem", None).unwrap();
        tree.define(mem, "X", column(Path::parse("/mem/X"))).unwrap();
        let rom = tree.declare(ROOT_SCOPE, "rom", None).unwrap();
        // From inside rom, `mem/X` climbs to the root and descends.
        let found = tree.resolve(rom, &Path::parse("mem/X"), Namespace::Symbols);
        assert!(found.is_some());
        // Absolute paths resolve from the root regardless of origin.
        let found = tree.resolve(rom, &Path::parse("/mem/X"), Namespace::Symbols);
        assert!(found.is_some());
    }

    #[test]
    fn test_perspective_scope_and_binding() {
        let mut tree = ScopeTree::new();
        let mem = tree.declare(ROOT_SCOPE, "mem", None).unwrap();
        let selector = Expr::constant(1, Span::dummy());
        let persp = tree.declare(mem, "reading", Some(selector)).unwrap();
        assert!(tree.scope(persp).is_virtual());
        assert_eq!(tree.concrete_module(persp), mem);
        // The perspective itself resolves as a symbol of its module.
        assert!(tree.resolve(mem, &Path::relative("reading"), Namespace::Symbols).is_some());
        // Perspective-qualified column access.
        tree.define(persp, "V", column(Path::parse("/mem/reading/V"))).unwrap();
        assert!(tree.resolve(mem, &Path::parse("reading/V"), Namespace::Symbols).is_some());
    }

    #[test]
    fn test_alias_resolves_to_target() {
        let mut tree = ScopeTree::new();
        let m = tree.declare(ROOT_SCOPE, "mem", None).unwrap();
        tree.define(m, "X", column(Path::parse("/mem/X"))).unwrap();
        assert!(tree.alias(m, "Y", "X", Namespace::Symbols).is_ok());
        let x = tree.resolve(m, &Path::relative("X"), Namespace::Symbols).unwrap();
        let y = tree.resolve(m, &Path::relative("Y"), Namespace::Symbols).unwrap();
        assert_eq!(x, y);
        // Aliasing an unknown target fails so init can retry transitively.
        assert!(tree.alias(m, "Z", "W", Namespace::Symbols).is_err());
    }

    #[test]
    fn test_overload_by_arity_and_types() {
        let mut tree = ScopeTree::new();
        let sig = |w: usize| FunctionSignature {
            params: vec![("x".to_string(), Type::Uint(w))],
            ret: None,
            pure: true,
            arity: Arity::Exactly(1),
            body: FunctionImpl::Defined(Expr::constant(0, Span::dummy())),
            finalised: false,
        };
        let path = Path::parse("/f");
        assert!(tree.define_function(ROOT_SCOPE, "f", path.clone(), sig(8)).is_ok());
        assert!(tree.define_function(ROOT_SCOPE, "f", path.clone(), sig(16)).is_ok());
        // Same arity and parameter types: duplicate.
        assert!(tree.define_function(ROOT_SCOPE, "f", path, sig(8)).is_err());
        let r = tree.resolve(ROOT_SCOPE, &Path::relative("f"), Namespace::Functions).unwrap();
        let Binding::Function(f) = tree.binding(r) else { panic!() };
        assert!(f.has_arity(1));
        assert_eq!(f.select(1).len(), 2);
    }
}
