//! CDL CLI — command-line interface for the CDL constraint compiler.

use clap::{Parser as ClapParser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;

use cdl_compiler::compiler::regalloc::RegisterStrategy;
use cdl_compiler::compiler::span::SourceMap;
use cdl_compiler::{compile, render_diagnostics, CompileOptions, Compiled};
use cdl_core::field::{Bls12_377, Gf251, KoalaBear};
use cdl_core::{MixedProgram, PrimeField};

// ANSI color helpers
fn green(s: &str) -> String {
    format!("\x1b[32m{}\x1b[0m", s)
}
fn red(s: &str) -> String {
    format!("\x1b[31m{}\x1b[0m", s)
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{}\x1b[0m", s)
}

#[derive(ClapParser)]
#[command(
    name = "cdl",
    version,
    about = "The CDL constraint compiler — arithmetic constraint systems over prime fields",
    help_template = "\
{before-help}{name} {version}
{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}

Examples:
  cdl check zkevm.cdl                  Parse and resolve a constraint set
  cdl verify zkevm.cdl --field gf251   Compile for a field and report
  cdl debug zkevm.cdl                  Print a summary of the compiled IR
"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum FieldChoice {
    Gf251,
    KoalaBear,
    Bls12_377,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a constraint set and hand it to the back-end
    Verify {
        /// Source files
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Field to compile for
        #[arg(long, value_enum, default_value = "bls12-377")]
        field: FieldChoice,

        /// Keep debug constraints instead of stripping them
        #[arg(long)]
        debug: bool,

        /// Merge registers within each module
        #[arg(long)]
        merge_registers: bool,

        /// Write the compiled program as JSON to this path
        #[arg(long, short)]
        out: Option<PathBuf>,
    },
    /// Parse and resolve only; report diagnostics
    Check {
        /// Source files
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Print a module/register/constraint summary of the compiled program
    Debug {
        /// Source files
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Field to compile for
        #[arg(long, value_enum, default_value = "bls12-377")]
        field: FieldChoice,
    },
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Verify {
            files,
            field,
            debug,
            merge_registers,
            out,
        } => {
            let options = CompileOptions {
                debug,
                strategy: if merge_registers {
                    RegisterStrategy::FirstFit
                } else {
                    RegisterStrategy::Identity
                },
            };
            with_field(field, &files, &options, |program, sources| {
                let _ = sources;
                if let Some(path) = out {
                    if let Err(e) = std::fs::write(&path, program.json) {
                        eprintln!("{} {}: {}", red("error:"), path.display(), e);
                        return ExitCode::FAILURE;
                    }
                }
                println!(
                    "{} {} module(s), digest {}",
                    green("ok:"),
                    program.modules,
                    program.digest
                );
                ExitCode::SUCCESS
            })
        }
        Commands::Check { files } => {
            // Field choice does not affect parse/resolve outcomes beyond
            // range bounds; check against the widest supported field.
            let sources = match read_sources(&files) {
                Ok(s) => s,
                Err(code) => return code,
            };
            let compiled: Compiled<Bls12_377> =
                compile(&sources, Vec::new(), &CompileOptions::default());
            report(&compiled, &sources)
        }
        Commands::Debug { files, field } => {
            with_field(field, &files, &CompileOptions::default(), |program, _| {
                print!("{}", program.summary);
                ExitCode::SUCCESS
            })
        }
    }
}

/// What the field-generic closure gets to see, already rendered.
struct ProgramReport {
    modules: usize,
    digest: String,
    json: String,
    summary: String,
}

fn with_field(
    field: FieldChoice,
    files: &[PathBuf],
    options: &CompileOptions,
    on_success: impl FnOnce(ProgramReport, &SourceMap) -> ExitCode,
) -> ExitCode {
    let sources = match read_sources(files) {
        Ok(s) => s,
        Err(code) => return code,
    };
    match field {
        FieldChoice::Gf251 => run::<Gf251>(&sources, options, on_success),
        FieldChoice::KoalaBear => run::<KoalaBear>(&sources, options, on_success),
        FieldChoice::Bls12_377 => run::<Bls12_377>(&sources, options, on_success),
    }
}

fn run<F: PrimeField>(
    sources: &SourceMap,
    options: &CompileOptions,
    on_success: impl FnOnce(ProgramReport, &SourceMap) -> ExitCode,
) -> ExitCode {
    let compiled: Compiled<F> = compile(sources, Vec::new(), options);
    match &compiled.program {
        Some(program) if compiled.diagnostics.is_empty() => {
            let report = ProgramReport {
                modules: program.modules.len(),
                digest: program.digest(),
                json: program.to_canonical_json(),
                summary: summarize(program),
            };
            on_success(report, sources)
        }
        _ => report(&compiled, sources),
    }
}

fn report<F: PrimeField>(compiled: &Compiled<F>, sources: &SourceMap) -> ExitCode {
    if compiled.diagnostics.is_empty() {
        println!("{}", green("ok"));
        ExitCode::SUCCESS
    } else {
        eprintln!("{}", render_diagnostics(&compiled.diagnostics, sources));
        ExitCode::FAILURE
    }
}

fn read_sources(files: &[PathBuf]) -> Result<SourceMap, ExitCode> {
    let mut sources = SourceMap::new();
    for path in files {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                sources.add_file(path.display().to_string(), text);
            }
            Err(e) => {
                eprintln!("{} {}: {}", red("error:"), path.display(), e);
                return Err(ExitCode::FAILURE);
            }
        }
    }
    Ok(sources)
}

fn summarize<F: PrimeField>(program: &MixedProgram<F>) -> String {
    let mut out = String::new();
    for ext in &program.externs {
        out.push_str(&format!(
            "{} {} (extern, {} registers)\n",
            bold("module"),
            ext.name,
            ext.registers.len()
        ));
    }
    for module in &program.modules {
        out.push_str(&format!(
            "{} {} (×{})\n",
            bold("module"),
            module.name,
            module.multiplier
        ));
        for register in &module.registers {
            out.push_str(&format!(
                "  {:<24} u{:<4} {}\n",
                register.name,
                register.bit_width,
                if register.computed { "computed" } else { "input" }
            ));
        }
        let mut counts: Vec<(&str, usize)> = Vec::new();
        for constraint in &module.constraints {
            match counts.iter_mut().find(|(k, _)| *k == constraint.kind()) {
                Some((_, n)) => *n += 1,
                None => counts.push((constraint.kind(), 1)),
            }
        }
        for (kind, count) in counts {
            out.push_str(&format!("  {:<24} {}\n", kind, count));
        }
        if !module.assignments.is_empty() {
            out.push_str(&format!("  {:<24} {}\n", "assignments", module.assignments.len()));
        }
    }
    out.push_str(&format!("digest {}\n", program.digest()));
    out
}
