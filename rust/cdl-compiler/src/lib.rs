//! CDL Compiler
//!
//! Compiles the CDL constraint description language into a register-level
//! `MixedProgram` over a prime field. The pipeline is a pure function
//! from `(source files, externs, field)` to `(program, diagnostics)`:
//! parse, resolve to a fixed point, preprocess away the sugar, allocate
//! registers, translate. Every phase batches its errors and the driver
//! runs every phase it still usefully can.

pub mod compiler;

use log::debug;

use cdl_core::program::{ExternModule, MixedProgram};
use cdl_core::PrimeField;

use compiler::errors::{sort_diagnostics, SyntaxError};
use compiler::lower;
use compiler::parser::parse_source_files;
use compiler::preprocess::preprocess_ast;
use compiler::regalloc::{allocate, RegisterStrategy};
use compiler::resolve::{resolve, FieldInfo};
use compiler::span::SourceMap;

/// Options controlling the optional behaviors of the pipeline.
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Keep `debug`-wrapped constraints instead of stripping them.
    pub debug: bool,
    /// Register merge policy; identity unless asked otherwise.
    pub strategy: RegisterStrategy,
}

/// The outcome of one compilation: a program when everything resolved,
/// and every diagnostic gathered along the way, sorted by span.
#[derive(Debug)]
pub struct Compiled<F: PrimeField> {
    pub program: Option<MixedProgram<F>>,
    pub diagnostics: Vec<SyntaxError>,
}

impl<F: PrimeField> Compiled<F> {
    pub fn is_success(&self) -> bool {
        self.diagnostics.is_empty() && self.program.is_some()
    }
}

/// Run the whole pipeline over a set of source files.
pub fn compile<F: PrimeField>(
    sources: &SourceMap,
    externs: Vec<ExternModule>,
    options: &CompileOptions,
) -> Compiled<F> {
    let mut diagnostics = Vec::new();

    let (ast, parse_errors) = parse_source_files(sources);
    diagnostics.extend(parse_errors);
    debug!("parsed {} modules", ast.modules.len());

    let field = FieldInfo {
        bit_width: F::bit_width(),
        register_width: F::register_width(),
    };
    let (resolved, resolve_errors) = resolve(ast, &externs, field);
    diagnostics.extend(resolve_errors);

    let mut ast = resolved.ast;
    let mut tree = resolved.tree;
    diagnostics.extend(preprocess_ast(&mut ast, &mut tree, options.debug));

    let map = allocate(&tree, options.strategy, F::register_width());

    let (program, lower_errors) = lower::lower::<F>(&ast, &tree, map, externs);
    diagnostics.extend(lower_errors);

    sort_diagnostics(&mut diagnostics);
    Compiled {
        program: diagnostics.is_empty().then_some(program),
        diagnostics,
    }
}

/// Render diagnostics in reporting order, one `path:span "message"` line
/// each.
pub fn render_diagnostics(diagnostics: &[SyntaxError], sources: &SourceMap) -> String {
    diagnostics
        .iter()
        .map(|e| e.render(sources))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdl_core::field::Gf251;

    fn compile_src(src: &str) -> Compiled<Gf251> {
        let mut sources = SourceMap::new();
        sources.add_file("test.cdl", src);
        compile(&sources, Vec::new(), &CompileOptions::default())
    }

    #[test]
    fn test_empty_program() {
        let out = compile_src("");
        assert!(out.is_success());
        assert!(out.program.unwrap().modules.is_empty());
    }

    #[test]
    fn test_diagnostics_are_sorted() {
        let out = compile_src("(defconstraint c () (vanishes! NOPE)) (defwidget)");
        assert!(!out.diagnostics.is_empty());
        let spans: Vec<u32> = out.diagnostics.iter().map(|d| d.span.start).collect();
        let mut sorted = spans.clone();
        sorted.sort();
        assert_eq!(spans, sorted);
        assert!(out.program.is_none());
    }

    #[test]
    fn test_determinism() {
        let src = "(module mem) (defcolumns (A :i8) (B :i8)) (defconstraint c () (vanishes! (- A B)))";
        let a = compile_src(src).program.unwrap().digest();
        let b = compile_src(src).program.unwrap().digest();
        assert_eq!(a, b);
    }
}
