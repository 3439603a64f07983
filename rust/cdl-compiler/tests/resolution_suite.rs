//! Resolution, scoping and preprocessing behavior, driven through the
//! public pipeline plus the pass entry points where a property is about
//! an intermediate state.

use cdl_compiler::compiler::ast::{Declaration, Expr};
use cdl_compiler::compiler::parser::parse_source_files;
use cdl_compiler::compiler::preprocess::preprocess_ast;
use cdl_compiler::compiler::resolve::{resolve, FieldInfo};
use cdl_compiler::compiler::span::SourceMap;
use cdl_compiler::{compile, CompileOptions, Compiled};
use cdl_core::field::Gf251;
use cdl_core::ir::{Constraint, LogicalTerm, Term};
use cdl_core::program::MixedProgram;

fn compile_src(src: &str) -> Compiled<Gf251> {
    let mut sources = SourceMap::new();
    sources.add_file("test.cdl", src);
    compile(&sources, Vec::new(), &CompileOptions::default())
}

fn compile_ok(src: &str) -> MixedProgram<Gf251> {
    let out = compile_src(src);
    assert!(
        out.diagnostics.is_empty(),
        "unexpected diagnostics: {:?}",
        out.diagnostics
    );
    out.program.expect("program")
}

fn compile_err(src: &str) -> Vec<String> {
    let out = compile_src(src);
    assert!(out.program.is_none(), "expected failure");
    out.diagnostics.into_iter().map(|d| d.message).collect()
}

fn has_error(errors: &[String], needle: &str) -> bool {
    errors.iter().any(|e| e.contains(needle))
}

// ── Symbols and scopes ──

#[test]
fn test_unknown_symbol() {
    let errors = compile_err("(defconstraint c () (vanishes! NOPE))");
    assert!(has_error(&errors, "unknown symbol 'NOPE'"));
}

#[test]
fn test_duplicate_column() {
    let errors = compile_err("(defcolumns (X :i8) (X :i16)) (defconstraint c () (vanishes! X))");
    assert!(has_error(&errors, "duplicate symbol 'X'"));
}

#[test]
fn test_same_name_in_different_modules() {
    compile_ok(
        "(module a) (defcolumns (X :i8)) (defconstraint c () (vanishes! X))\
         (module b) (defcolumns (X :i8)) (defconstraint c () (vanishes! X))",
    );
}

#[test]
fn test_constants_resolve_from_the_prelude() {
    let program = compile_ok(
        "(defconst LIMIT 255)\
         (module m) (defcolumns (X :i8))\
         (defconstraint c () (vanishes! (- X LIMIT)))",
    );
    // The constant folds into the module's own context.
    assert_eq!(program.modules.len(), 1);
    assert_eq!(program.modules[0].name, "m");
}

#[test]
fn test_qualified_access_requires_global_scope() {
    let errors = compile_err(
        "(module a) (defcolumns (X :i8))\
         (module b) (defcolumns (Y :i8))\
         (defconstraint c () (vanishes! (- Y a/X)))",
    );
    assert!(has_error(&errors, "unknown symbol 'a/X'"));
}

#[test]
fn test_lookup_may_span_modules() {
    compile_ok(
        "(module a) (defcolumns (X :i8))\
         (module b) (defcolumns (Y :i8))\
         (deflookup l (a/X) (Y))",
    );
}

#[test]
fn test_conflicting_context_within_constraint() {
    let errors = compile_err(
        "(defcolumns (A :i8) (B :i8))\
         (definterleaved AB (A B))\
         (defconstraint c () (vanishes! (- A AB)))",
    );
    assert!(has_error(&errors, "conflicting context"));
}

// ── Aliases ──

#[test]
fn test_column_alias() {
    let program = compile_ok(
        "(defcolumns (X :i8)) (defalias Y X) (defconstraint c () (vanishes! Y))",
    );
    // The alias shares the target's register; nothing new is allocated.
    assert_eq!(program.modules[0].registers.len(), 1);
}

#[test]
fn test_transitive_aliases_absorb() {
    compile_ok(
        "(defcolumns (X :i8)) (defalias Z Y Y X) (defconstraint c () (vanishes! Z))",
    );
}

#[test]
fn test_alias_to_unknown_target() {
    let errors = compile_err("(defalias Y X) (defconstraint c () (vanishes! Y))");
    assert!(has_error(&errors, "unknown symbol 'X'"));
}

#[test]
fn test_function_alias_feeds_reduce() {
    let program = compile_ok(
        "(defcolumns (A :i8) (B :i8) (C :i8))\
         (defunalias sum +)\
         (defconstraint c () (vanishes! (reduce sum (begin A B C))))",
    );
    let Constraint::Vanishing { body, .. } = &program.modules[0].constraints[0] else {
        panic!();
    };
    // reduce folds left: ((A + B) + C) == 0.
    let LogicalTerm::Equals(Term::Sum(outer), _) = body else {
        panic!("expected a folded sum, got {:?}", body);
    };
    assert!(matches!(outer[0], Term::Sum(_)));
}

#[test]
fn test_reduce_requires_binary_overload() {
    let errors = compile_err(
        "(defcolumns (A :i8))\
         (defpurefun (inc (x :i8)) (+ x 1))\
         (defconstraint c () (vanishes! (reduce inc (begin A A))))",
    );
    assert!(has_error(&errors, "found 2 arguments"));
}

// ── Functions and purity ──

#[test]
fn test_pure_function_may_not_read_columns() {
    let errors = compile_err(
        "(defcolumns (X :i8))\
         (defpurefun (f (a :i8)) (+ a X))\
         (defconstraint c () (vanishes! (f 1)))",
    );
    assert!(has_error(&errors, "pure context"));
}

#[test]
fn test_impure_function_may_read_columns() {
    compile_ok(
        "(defcolumns (X :i8))\
         (defun (f (a :i8)) (+ a X))\
         (defconstraint c () (vanishes! (f 1)))",
    );
}

#[test]
fn test_prove_is_rejected_on_parameters() {
    let errors = compile_err(
        "(defpurefun (f (x :i8@prove)) x)\
         (defconstraint c () (vanishes! (f 1)))",
    );
    assert!(has_error(&errors, "@prove is not allowed on function parameters"));
}

#[test]
fn test_function_return_type_is_checked() {
    let errors = compile_err(
        "(defpurefun ((f :i4) (x :i16)) x)\
         (defconstraint c () (vanishes! (f 1)))",
    );
    assert!(has_error(&errors, "expected u4, found u16"));
}

// ── Let, nesting and substitution ──

#[test]
fn test_let_binding_substitutes() {
    let program = compile_ok(
        "(defcolumns (X :i8))\
         (defconstraint c () (let ((y (+ X 1))) (vanishes! (- y y))))",
    );
    assert_eq!(program.modules[0].constraints.len(), 1);
}

#[test]
fn test_let_bindings_see_earlier_bindings() {
    compile_ok(
        "(defcolumns (X :i8))\
         (defconstraint c () (let ((a (+ X 1)) (b (+ a 1))) (vanishes! b)))",
    );
}

#[test]
fn test_nested_for_loops() {
    let program = compile_ok(
        "(defcolumns (X :i8 :array [1:2]))\
         (defconstraint c () (for i [1:2] (for j [1:2] (vanishes! (- [X i] [X j])))))",
    );
    let Constraint::Vanishing { body, .. } = &program.modules[0].constraints[0] else {
        panic!();
    };
    let LogicalTerm::Conjunction(outer) = body else {
        panic!();
    };
    // 2×2 expansion, flattened one level per loop.
    assert_eq!(outer.len(), 2);
}

#[test]
fn test_function_inlining_composes_with_loops() {
    compile_ok(
        "(defcolumns (X :i8 :array [1:3]))\
         (defpurefun (next (k :i8)) (+ k 1))\
         (defconstraint c () (for i [1:2] (vanishes! (- [X (next i)] [X i]))))",
    );
}

// ── Conditions ──

#[test]
fn test_loobean_condition_vanishes() {
    let program = compile_ok(
        "(defcolumns (X :i8) (Y :i8))\
         (defconstraint c () (if X (vanishes! Y)))",
    );
    let Constraint::Vanishing { body, .. } = &program.modules[0].constraints[0] else {
        panic!();
    };
    let LogicalTerm::IfThenElse { condition, .. } = body else {
        panic!("expected a conditional");
    };
    assert!(matches!(**condition, LogicalTerm::Vanishes(_)));
}

#[test]
fn test_boolean_condition_stays_logical() {
    let program = compile_ok(
        "(defcolumns (X :i8) (Y :i8))\
         (defconstraint c () (if (= X 3) (vanishes! Y)))",
    );
    let Constraint::Vanishing { body, .. } = &program.modules[0].constraints[0] else {
        panic!();
    };
    let LogicalTerm::IfThenElse { condition, .. } = body else {
        panic!();
    };
    assert!(matches!(**condition, LogicalTerm::Equals(..)));
}

#[test]
fn test_inequalities_lower_faithfully() {
    let program = compile_ok(
        "(defcolumns (X :i8) (Y :i8))\
         (defconstraint c () (<= X Y))",
    );
    let Constraint::Vanishing { body, .. } = &program.modules[0].constraints[0] else {
        panic!();
    };
    assert!(matches!(body, LogicalTerm::LessThanOrEqual(..)));
}

#[test]
fn test_connectives_lower_to_junctions() {
    let program = compile_ok(
        "(defcolumns (X :i8) (Y :i8))\
         (defconstraint c () (or (= X 0) (not (= Y 0))))",
    );
    let Constraint::Vanishing { body, .. } = &program.modules[0].constraints[0] else {
        panic!();
    };
    let LogicalTerm::Disjunction(parts) = body else {
        panic!();
    };
    assert!(matches!(parts[1], LogicalTerm::Negation(_)));
}

// ── Constants, casts, shifts ──

#[test]
fn test_typed_constant_bounds() {
    compile_ok("(defconst (K :i8) 255) (defcolumns (X :i8)) (defconstraint c () (vanishes! (- X K)))");
    let errors = compile_err("(defconst (K :i8) 300)");
    assert!(has_error(&errors, "constant out-of-bounds"));
}

#[test]
fn test_extern_constant_lowers_labelled() {
    let program = compile_ok(
        "(defconst (K :extern) 7) (defcolumns (X :i8))\
         (defconstraint c () (vanishes! (- X K)))",
    );
    let Constraint::Vanishing { body, .. } = &program.modules[0].constraints[0] else {
        panic!();
    };
    let LogicalTerm::Equals(Term::Subtract(parts), _) = body else {
        panic!();
    };
    assert!(matches!(parts[1], Term::LabelledConst { .. }));
}

#[test]
fn test_extern_constant_rejected_in_constant_position() {
    let errors = compile_err("(defconst (K :extern) 7 L (+ K 1))");
    assert!(has_error(&errors, "extern constant"));
}

#[test]
fn test_constant_symbol_as_array_index() {
    let program = compile_ok(
        "(defconst N 2)\
         (defcolumns (X :i8 :array [1:3]))\
         (defconstraint c () (vanishes! [X N]))",
    );
    let Constraint::Vanishing { body, .. } = &program.modules[0].constraints[0] else {
        panic!();
    };
    // N folds to 2, selecting the register of X_2.
    let regs = body.registers();
    assert_eq!(regs.len(), 1);
    assert_eq!(program.modules[0].registers[regs[0].0.index].name, "X_2");
}

#[test]
fn test_constant_symbol_as_exponent() {
    let program = compile_ok(
        "(defconst N 3)\
         (defcolumns (X :i8))\
         (defconstraint c () (vanishes! (^ X N)))",
    );
    let Constraint::Vanishing { body, .. } = &program.modules[0].constraints[0] else {
        panic!();
    };
    let LogicalTerm::Equals(Term::Exponent(_, power), _) = body else {
        panic!("expected an exponent term, got {:?}", body);
    };
    assert_eq!(*power, 3);
}

#[test]
fn test_constant_symbol_as_shift_amount() {
    let program = compile_ok(
        "(defconst N 2)\
         (defcolumns (X :i8))\
         (defconstraint c () (vanishes! (- X (shift X N))))",
    );
    let Constraint::Vanishing { body, .. } = &program.modules[0].constraints[0] else {
        panic!();
    };
    let shifts: Vec<isize> = body.registers().iter().map(|(_, s)| *s).collect();
    assert_eq!(shifts, vec![0, 2]);
}

#[test]
fn test_shift_amount_must_be_constant() {
    let errors = compile_err(
        "(defcolumns (X :i8) (Y :i8)) (defconstraint c () (vanishes! (shift X Y)))",
    );
    assert!(has_error(&errors, "expected constant shift amount"));
}

#[test]
fn test_shift_accumulates_into_register_access() {
    let program = compile_ok(
        "(defcolumns (X :i8)) (defconstraint c () (vanishes! (- X (shift X 2))))",
    );
    let Constraint::Vanishing { body, .. } = &program.modules[0].constraints[0] else {
        panic!();
    };
    let shifts: Vec<isize> = body.registers().iter().map(|(_, s)| *s).collect();
    assert_eq!(shifts, vec![0, 2]);
}

#[test]
fn test_exponent_must_be_constant() {
    let errors = compile_err(
        "(defcolumns (X :i8) (Y :i8)) (defconstraint c () (vanishes! (^ X Y)))",
    );
    assert!(has_error(&errors, "expected constant exponent"));
}

#[test]
fn test_safe_cast_is_erased() {
    let program = compile_ok(
        "(defcolumns (X :i8)) (defconstraint c () (vanishes! (cast :i16 X)))",
    );
    let Constraint::Vanishing { body, .. } = &program.modules[0].constraints[0] else {
        panic!();
    };
    let LogicalTerm::Equals(left, _) = body else {
        panic!();
    };
    assert!(matches!(left, Term::Register { .. }));
}

#[test]
fn test_invalid_safe_cast() {
    let errors = compile_err(
        "(defcolumns (X :i16)) (defconstraint c () (vanishes! (cast :i8 X)))",
    );
    assert!(has_error(&errors, "invalid cast"));
}

#[test]
fn test_unsafe_cast_narrows() {
    let program = compile_ok(
        "(defcolumns (X :i16)) (defconstraint c () (vanishes! (cast! :i8 X)))",
    );
    let Constraint::Vanishing { body, .. } = &program.modules[0].constraints[0] else {
        panic!();
    };
    let LogicalTerm::Equals(left, _) = body else {
        panic!();
    };
    assert!(matches!(left, Term::CastOf(_, 8)));
}

#[test]
fn test_concat_weighs_limbs() {
    let program = compile_ok(
        "(defcolumns (HI :i8) (LO :i8))\
         (defconstraint c () (vanishes! (concat HI LO)))",
    );
    let Constraint::Vanishing { body, .. } = &program.modules[0].constraints[0] else {
        panic!();
    };
    let LogicalTerm::Equals(Term::Sum(parts), _) = body else {
        panic!();
    };
    assert_eq!(parts.len(), 2);
    assert!(matches!(parts[0], Term::Product(_)));
    assert!(matches!(parts[1], Term::Register { .. }));
}

// ── Module conditions ──

#[test]
fn test_conditional_modules_are_rejected() {
    let errors = compile_err(
        "(module m (vanishes! FLAG)) (defcolumns (FLAG :binary) (X :i8))\
         (defconstraint c () (vanishes! X))",
    );
    assert!(has_error(&errors, "conditional modules are not supported"));
}

// ── Preprocessing idempotence ──

#[test]
fn test_preprocessing_twice_is_identity() {
    let mut sources = SourceMap::new();
    sources.add_file(
        "test.cdl",
        "(defcolumns (X :i8 :array [1:3]))\
         (defpurefun (next (k :i8)) (+ k 1))\
         (defconstraint c () (for i [1:2] (let ((y [X i])) (vanishes! (- y [X (next i)])))))",
    );
    let (ast, errors) = parse_source_files(&sources);
    assert!(errors.is_empty());
    let (resolved, errors) = resolve(
        ast,
        &[],
        FieldInfo {
            bit_width: 8,
            register_width: 7,
        },
    );
    assert!(errors.is_empty(), "{:?}", errors);
    let mut ast = resolved.ast;
    let mut tree = resolved.tree;
    let errors = preprocess_ast(&mut ast, &mut tree, false);
    assert!(errors.is_empty(), "{:?}", errors);
    let once: Vec<Expr> = constraint_bodies(&ast);
    let errors = preprocess_ast(&mut ast, &mut tree, false);
    assert!(errors.is_empty());
    assert_eq!(once, constraint_bodies(&ast));
}

fn constraint_bodies(ast: &cdl_compiler::compiler::ast::Ast) -> Vec<Expr> {
    ast.modules
        .iter()
        .flat_map(|m| &m.declarations)
        .filter_map(|d| match d {
            Declaration::Constraint(c) => Some(c.body.clone()),
            _ => None,
        })
        .collect()
}

// ── Multi-file aggregation ──

#[test]
fn test_modules_fragment_across_files() {
    let mut sources = SourceMap::new();
    sources.add_file("a.cdl", "(module mem) (defcolumns (A :i8))");
    sources.add_file("b.cdl", "(module mem) (defconstraint c () (vanishes! A))");
    let out: Compiled<Gf251> = compile(&sources, Vec::new(), &CompileOptions::default());
    assert!(out.diagnostics.is_empty(), "{:?}", out.diagnostics);
    let program = out.program.unwrap();
    assert_eq!(program.modules.len(), 1);
    assert_eq!(program.modules[0].name, "mem");
}

#[test]
fn test_properties_lower_to_assertions() {
    let program = compile_ok(
        "(defcolumns (X :i8)) (defproperty p (vanishes! X))",
    );
    assert!(matches!(
        program.modules[0].constraints[0],
        Constraint::Assertion { .. }
    ));
}

#[test]
fn test_constraint_domain_is_carried() {
    let program = compile_ok(
        "(defcolumns (X :i8)) (defconstraint c (:domain {2}) (vanishes! X))",
    );
    let Constraint::Vanishing { domain, .. } = &program.modules[0].constraints[0] else {
        panic!();
    };
    assert_eq!(domain.as_deref(), Some(&[2isize][..]));
}
