//! End-to-end pipeline tests: source text in, `MixedProgram` or
//! diagnostics out.

use cdl_compiler::compiler::regalloc::RegisterStrategy;
use cdl_compiler::compiler::span::SourceMap;
use cdl_compiler::{compile, CompileOptions, Compiled};
use cdl_core::field::{Bls12_377, Gf251};
use cdl_core::ir::{Constraint, LogicalTerm, Term};
use cdl_core::program::{ExternModule, ExternRegister, MixedProgram};
use cdl_core::PrimeField;

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

// ── Scenario A: basic constraint ──

#[test]
fn test_basic_vanishing_constraint() {
    let program = compile_ok("(defcolumns (X :i8)) (defconstraint c1 () (vanishes! X))");
    assert_eq!(program.modules.len(), 1);
    let module = &program.modules[0];
    assert_eq!(module.multiplier, 1);
    assert_eq!(module.registers.len(), 1);
    assert_eq!(module.registers[0].name, "X");
    assert_eq!(module.registers[0].bit_width, 8);
    assert!(!module.registers[0].computed);
    assert_eq!(module.constraints.len(), 1);
    let Constraint::Vanishing { handle, body, .. } = &module.constraints[0] else {
        panic!("expected a vanishing constraint");
    };
    assert_eq!(handle.name, "c1");
    let LogicalTerm::Equals(left, right) = body else {
        panic!("expected X == 0");
    };
    assert!(matches!(left, Term::Register { shift: 0, .. }));
    assert_eq!(*right, Term::Const(Gf251::zero()));
}

// ── Scenario B: interleaving ──

#[test]
fn test_interleaving_multiplier_family() {
    let program =
        compile_ok("(defcolumns (A :i8) (B :i8)) (definterleaved AB (A B))");
    assert_eq!(program.modules.len(), 2);
    let base = &program.modules[0];
    let family = &program.modules[1];
    assert_eq!(base.multiplier, 1);
    assert_eq!(family.multiplier, 2);
    assert_eq!(family.registers.len(), 1);
    assert_eq!(family.registers[0].name, "AB");
    assert_eq!(family.registers[0].bit_width, 8);
    assert!(family.registers[0].computed);
    assert_eq!(family.assignments.len(), 1);
    assert!(family
        .constraints
        .iter()
        .any(|c| matches!(c, Constraint::Interleaving { .. })));
}

#[test]
fn test_interleaving_widens_to_lub() {
    let program =
        compile_ok("(defcolumns (A :i8) (B :i16)) (definterleaved AB (A B))");
    let family = &program.modules[1];
    assert_eq!(family.registers[0].bit_width, 16);
}

#[test]
fn test_interleaving_rejects_mixed_multipliers() {
    let errors = compile_err(
        "(defcolumns (A :i8) (B :i8))\
         (definterleaved AB (A B))\
         (definterleaved BAD (A AB))",
    );
    assert!(has_error(&errors, "incompatible length multiplier"));
}

// ── Scenario C: for-loop expansion over arrays ──

#[test]
fn test_for_expansion_over_array() {
    let program = compile_ok(
        "(defcolumns (X :i8 :array [1:3]))\
         (defconstraint c () (for i [1:3] (vanishes! [X i])))",
    );
    let module = &program.modules[0];
    let names: Vec<&str> = module.registers.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["X_1", "X_2", "X_3"]);
    let Constraint::Vanishing { body, .. } = &module.constraints[0] else {
        panic!();
    };
    let LogicalTerm::Conjunction(parts) = body else {
        panic!("expected three conjoined equalities");
    };
    assert_eq!(parts.len(), 3);
}

#[test]
fn test_array_index_out_of_bounds() {
    let errors = compile_err(
        "(defcolumns (X :i8 :array [1:3]))\
         (defconstraint c () (for i [1:4] (vanishes! [X i])))",
    );
    assert!(has_error(&errors, "array index out-of-bounds"));
}

#[test]
fn test_array_bounds_are_inclusive() {
    compile_ok(
        "(defcolumns (X :i8 :array [1:3]))\
         (defconstraint lo () (vanishes! [X 1]))\
         (defconstraint hi () (vanishes! [X 3]))",
    );
    let errors = compile_err(
        "(defcolumns (X :i8 :array [1:3]))\
         (defconstraint c () (vanishes! [X 0]))",
    );
    assert!(has_error(&errors, "array index out-of-bounds"));
}

// ── Scenario D: overload selection ──

#[test]
fn test_overload_picks_most_specific() {
    compile_ok(
        "(defcolumns (Y :i16))\
         (defpurefun (f (x :i8)) (* x 2))\
         (defpurefun (f (x :i16)) (+ x 1))\
         (defconstraint c () (vanishes! (- Y (f 5))))",
    );
}

#[test]
fn test_overload_widens_for_larger_constants() {
    compile_ok(
        "(defcolumns (Y :i16))\
         (defpurefun (f (x :i8)) (* x 2))\
         (defpurefun (f (x :i16)) (+ x 1))\
         (defconstraint c () (vanishes! (- Y (f 300))))",
    );
}

#[test]
fn test_overload_rejects_oversized_argument() {
    let errors = compile_err(
        "(defcolumns (Y :i16))\
         (defpurefun (f (x :i8)) (* x 2))\
         (defpurefun (f (x :i16)) (+ x 1))\
         (defconstraint c () (vanishes! (- Y (f 100000))))",
    );
    assert!(has_error(&errors, "expected u16, found u17"));
}

#[test]
fn test_arity_hint_on_wrong_argument_count() {
    let errors = compile_err(
        "(defpurefun (f (x :i8) (y :i8)) (+ x y))\
         (defconstraint c () (vanishes! (f 1)))",
    );
    assert!(has_error(&errors, "found 1 arguments, expected 2"));
}

// ── Scenario E: cyclic declarations ──

#[test]
fn test_self_referential_constant_group() {
    // Within one declaration the names are self-defined, so the cycle
    // surfaces as a non-constant value instead of a blocked fixed point.
    let errors = compile_err("(defconst A B B A)");
    assert!(has_error(&errors, "expected constant"));
}

#[test]
fn test_cyclic_constants_across_declarations() {
    let errors = compile_err("(defconst A B) (defconst B A)");
    assert!(has_error(&errors, "cyclic declaration"));
}

#[test]
fn test_recursive_function_rejected() {
    let errors = compile_err(
        "(defpurefun (f (x :i8)) (f x))\
         (defconstraint c () (vanishes! (f 1)))",
    );
    assert!(has_error(&errors, "recursion not permitted"));
}

// ── Scenario F: lookups and limb alignment ──

#[test]
fn test_irregular_lookup_detected() {
    let errors = compile_err(
        "(defcolumns (X :i8) (Y :i16)) (deflookup l (X) (Y))",
    );
    assert!(has_error(&errors, "irregular lookup detected"));
}

#[test]
fn test_regular_lookup_accepted() {
    let program = compile_ok("(defcolumns (X :i8) (Y :i8)) (deflookup l (X) (Y))");
    let module = &program.modules[0];
    let Constraint::Lookup { targets, sources, .. } = &module.constraints[0] else {
        panic!("expected a lookup");
    };
    assert_eq!(targets.terms.len(), 1);
    assert_eq!(sources.len(), 1);
}

#[test]
fn test_lookup_tuple_lengths_must_match() {
    let errors = compile_err(
        "(defcolumns (A :i8) (B :i8) (C :i8)) (deflookup l (A B) (C))",
    );
    assert!(has_error(&errors, "too few targets"));
}

#[test]
fn test_conditional_lookup_selector_must_be_binary() {
    let errors = compile_err(
        "(defcolumns (A :i8) (B :i8) (S :i8))\
         (defclookup l S (A) S (B))",
    );
    assert!(has_error(&errors, "non-binary selector"));
}

#[test]
fn test_multi_lookup() {
    let program = compile_ok(
        "(defcolumns (A :i8) (B :i8) (C :i8) (S1 :binary) (S2 :binary))\
         (defmlookup l (A) (S1 (B)) (S2 (C)))",
    );
    let Constraint::Lookup { sources, .. } = &program.modules[0].constraints[0] else {
        panic!();
    };
    assert_eq!(sources.len(), 2);
    assert!(sources.iter().all(|s| s.selector.is_some()));
}

// ── Range constraints ──

#[test]
fn test_inrange_power_of_two() {
    let program = compile_ok("(defcolumns (X :i8)) (definrange X 256)");
    let Constraint::Range { bitwidth, .. } = &program.modules[0].constraints[0] else {
        panic!("expected a range constraint");
    };
    assert_eq!(*bitwidth, 8);
}

#[test]
fn test_inrange_rejects_non_power_of_two() {
    let errors = compile_err("(defcolumns (X :i8)) (definrange X 255)");
    assert!(has_error(&errors, "bound not power of 2"));
}

#[test]
fn test_inrange_rejects_signed_terms() {
    let errors = compile_err("(defcolumns (X :i8) (Y :i8)) (definrange (- X Y) 256)");
    assert!(has_error(&errors, "signed term where unsigned expected"));
}

#[test]
fn test_prove_columns_emit_range_constraints() {
    let program = compile_ok("(defcolumns (X :i8@prove)) (defconstraint c () (vanishes! X))");
    let module = &program.modules[0];
    assert!(module
        .constraints
        .iter()
        .any(|c| matches!(c, Constraint::Range { bitwidth: 8, .. })));
}

// ── Sortedness and permutations ──

#[test]
fn test_permutation_emits_assignment_and_constraints() {
    let program = compile_ok(
        "(module m) (defcolumns (A :i8) (B :i8))\
         (defpermutation (A' B') ((+ A) B))",
    );
    let module = &program.modules[0];
    assert_eq!(module.assignments.len(), 1);
    assert!(module
        .constraints
        .iter()
        .any(|c| matches!(c, Constraint::Permutation { .. })));
    assert!(module
        .constraints
        .iter()
        .any(|c| matches!(c, Constraint::Sorted { strict: false, .. })));
}

#[test]
fn test_permutation_sign_rules() {
    let errors = compile_err(
        "(module m) (defcolumns (A :i8) (B :i8))\
         (defpermutation (A' B') ((- A) B))",
    );
    assert!(has_error(&errors, "sort signs must start with '+'"));

    let errors = compile_err(
        "(module m) (defcolumns (A :i8) (B :i8))\
         (defpermutation (A' B') (A (+ B)))",
    );
    assert!(has_error(&errors, "sort sign after unsigned column"));
}

#[test]
fn test_strict_sorted_with_selector() {
    let program = compile_ok(
        "(module m) (defcolumns (A :i8) (S :binary))\
         (defstrictsorted ((+ A)) :selector S)",
    );
    let Constraint::Sorted { strict, selector, .. } = &program.modules[0].constraints[0] else {
        panic!();
    };
    assert!(*strict);
    assert!(selector.is_some());
}

#[test]
fn test_sorted_rejects_interleaved_sources() {
    let errors = compile_err(
        "(module m) (defcolumns (A :i8) (B :i8))\
         (definterleaved AB (A B))\
         (defsorted (AB))",
    );
    assert!(has_error(&errors, "incompatible length multiplier"));
}

// ── Computed columns and natives ──

#[test]
fn test_computed_column_assignment_and_equality() {
    let program = compile_ok(
        "(module m) (defcolumns (A :i8))\
         (defcomputedcolumn (D :i16) (+ A 3))",
    );
    let module = &program.modules[0];
    assert_eq!(module.assignments.len(), 1);
    assert!(module
        .constraints
        .iter()
        .any(|c| matches!(c, Constraint::Vanishing { .. })));
    // Padding is the body's value over all-zero registers.
    let d = module.registers.iter().find(|r| r.name == "D").unwrap();
    assert_eq!(d.padding, Gf251::from_u64(3));
}

#[test]
fn test_native_computation() {
    let program = compile_ok(
        "(module m) (defcolumns (FR :i8) (C :i16))\
         (defcomputed (OUT) fwd-fill-within (FR C))",
    );
    let module = &program.modules[0];
    assert_eq!(module.assignments.len(), 1);
    let out = module.registers.iter().find(|r| r.name == "OUT").unwrap();
    assert_eq!(out.bit_width, 16);
    assert!(out.computed);
}

#[test]
fn test_native_arity_is_checked() {
    let errors = compile_err(
        "(module m) (defcolumns (FR :i8))\
         (defcomputed (OUT) fwd-fill-within (FR))",
    );
    assert!(has_error(&errors, "found 1 arguments"));
}

// ── Debug stripping ──

#[test]
fn test_debug_constraints_stripped_by_default() {
    let program = compile_ok(
        "(defcolumns (X :i8)) (defconstraint c () (debug (vanishes! X)))",
    );
    assert!(program.modules[0].constraints.is_empty());
}

#[test]
fn test_debug_constraints_kept_when_enabled() {
    let mut sources = SourceMap::new();
    sources.add_file(
        "test.cdl",
        "(defcolumns (X :i8)) (defconstraint c () (debug (vanishes! X)))",
    );
    let out: Compiled<Gf251> = compile(
        &sources,
        Vec::new(),
        &CompileOptions {
            debug: true,
            strategy: RegisterStrategy::Identity,
        },
    );
    assert!(out.diagnostics.is_empty());
    assert_eq!(out.program.unwrap().modules[0].constraints.len(), 1);
}

#[test]
fn test_empty_for_range_is_void() {
    let program = compile_ok(
        "(defcolumns (X :i8)) (defconstraint c () (for i [1:0] (vanishes! X)))",
    );
    assert!(program.modules[0].constraints.is_empty());
}

#[test]
fn test_singleton_for_range() {
    let program = compile_ok(
        "(defcolumns (X :i8)) (defconstraint c () (for i [0:0] (vanishes! (- X i))))",
    );
    assert_eq!(program.modules[0].constraints.len(), 1);
}

// ── Guards and perspectives ──

#[test]
fn test_guard_wraps_body() {
    let program = compile_ok(
        "(defcolumns (G :i8) (X :i8))\
         (defconstraint c (:guard G) (vanishes! X))",
    );
    let Constraint::Vanishing { body, .. } = &program.modules[0].constraints[0] else {
        panic!();
    };
    let LogicalTerm::IfThenElse {
        condition,
        then_branch,
        else_branch,
    } = body
    else {
        panic!("expected a guard wrapper");
    };
    assert!(matches!(**condition, LogicalTerm::Vanishes(_)));
    assert!(then_branch.is_none());
    assert!(else_branch.is_some());
}

#[test]
fn test_perspective_constraint_is_selector_gated() {
    let program = compile_ok(
        "(module mem) (defcolumns (SEL :binary))\
         (defperspective reading SEL ((V :i8)))\
         (defconstraint c (:perspective reading) (vanishes! V))",
    );
    let body = program.modules[0]
        .constraints
        .iter()
        .find_map(|c| match c {
            Constraint::Vanishing { body, .. } => Some(body),
            _ => None,
        })
        .expect("vanishing constraint");
    assert!(matches!(body, LogicalTerm::IfThenElse { .. }));
}

#[test]
fn test_perspective_qualified_access() {
    compile_ok(
        "(module mem) (defcolumns (SEL :binary))\
         (defperspective reading SEL ((V :i8)))\
         (defconstraint c () (vanishes! reading/V))",
    );
}

// ── Externs ──

#[test]
fn test_extern_registers_resolve() {
    let mut sources = SourceMap::new();
    sources.add_file(
        "test.cdl",
        "(module m) (defcolumns (X :i32)) (deflookup l (rom/PC) (X))",
    );
    let externs = vec![ExternModule {
        name: "rom".to_string(),
        public: true,
        registers: vec![ExternRegister {
            name: "PC".to_string(),
            bit_width: 32,
            output: false,
        }],
    }];
    let out: Compiled<Bls12_377> = compile(&sources, externs, &CompileOptions::default());
    assert!(out.diagnostics.is_empty(), "{:?}", out.diagnostics);
    let program = out.program.unwrap();
    assert_eq!(program.externs.len(), 1);
    let Constraint::Lookup { targets, .. } = &program.modules[0].constraints[0] else {
        panic!();
    };
    // Target reads the extern's register through the unified module
    // space, where externs come first.
    let regs = targets.terms[0].registers();
    assert_eq!(regs[0].0.module, 0);
}

// ── Determinism ──

#[test]
fn test_byte_identical_output_across_runs() {
    let src = "(module mem) (defcolumns (A :i8) (B :i16 :array [2]))\
               (defconstraint c () (vanishes! (+ A [B 1] [B 2])))\
               (definrange A 16)";
    let a = compile_ok(src);
    let b = compile_ok(src);
    assert_eq!(a.digest(), b.digest());
    assert_eq!(a.to_canonical_json(), b.to_canonical_json());
}
