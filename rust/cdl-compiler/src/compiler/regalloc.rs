//! Register allocation: column bindings become physical registers.
//!
//! Array columns destructure into one register source per index; sources
//! are allocated in insertion order, inputs before computed, grouped into
//! one register family per `(module, multiplier)`. A pluggable strategy
//! decides merging: the identity strategy keeps one register per source,
//! first-fit merges columns of disjoint perspectives within a family.

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::compiler::ast::DisplayHint;
use crate::compiler::path::Path;
use crate::compiler::scope::{Binding, BindingRef, ColumnKind, Namespace, ScopeTree};
use crate::compiler::types::Type;

/// Merge policy applied after the one-register-per-source allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RegisterStrategy {
    /// One register per destructured source.
    #[default]
    Identity,
    /// Merge registers of disjoint perspectives within a family.
    FirstFit,
}

/// A flattened column: one array index of one column binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterSource {
    pub binding: BindingRef,
    /// Index within the array column, if destructured.
    pub array_index: Option<usize>,
    pub module: Path,
    pub perspective: Option<String>,
    pub name: String,
    pub multiplier: usize,
    pub bit_width: usize,
    pub must_prove: bool,
    pub computed: bool,
    pub display: Option<DisplayHint>,
}

/// One register family per `(module, multiplier)`, one IR module each.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterFamily {
    pub module: Path,
    pub multiplier: usize,
}

impl RegisterFamily {
    /// The IR module name: the module itself for multiplier 1, a
    /// suffixed family otherwise.
    pub fn ir_name(&self) -> String {
        let base = if self.module.depth() == 0 {
            "<prelude>".to_string()
        } else {
            self.module.segments().join(".")
        };
        if self.multiplier == 1 {
            base
        } else {
            format!("{}_x{}", base, self.multiplier)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatedRegister {
    pub family: usize,
    pub name: String,
    pub bit_width: usize,
    pub computed: bool,
    pub must_prove: bool,
    pub display: Option<DisplayHint>,
    /// Indices into the source table; more than one after merging.
    pub sources: Vec<usize>,
    active: bool,
}

/// The column-to-register indirection consumed by the translator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterMap {
    pub sources: Vec<RegisterSource>,
    pub families: Vec<RegisterFamily>,
    registers: Vec<AllocatedRegister>,
    /// `(binding, array index)` to register index.
    by_column: HashMap<(usize, usize, usize), usize>,
}

impl RegisterMap {
    pub fn registers(&self) -> &[AllocatedRegister] {
        &self.registers
    }

    /// Registers of one family, in allocation order, with their global
    /// indices.
    pub fn family_registers(&self, family: usize) -> impl Iterator<Item = (usize, &AllocatedRegister)> {
        self.registers
            .iter()
            .enumerate()
            .filter(move |(_, r)| r.family == family)
    }

    /// Index of a register within its family's register table.
    pub fn index_in_family(&self, register: usize) -> usize {
        let family = self.registers[register].family;
        self.registers[..register]
            .iter()
            .filter(|r| r.family == family)
            .count()
    }

    pub fn register_of(&self, binding: BindingRef, array_index: Option<usize>) -> Option<usize> {
        self.by_column
            .get(&(binding.scope, binding.index, array_index.unwrap_or(0)))
            .copied()
    }

    pub fn family_of(&self, module: &Path, multiplier: usize) -> Option<usize> {
        self.families
            .iter()
            .position(|f| &f.module == module && f.multiplier == multiplier)
    }

    /// Register a family with no registers yet; used for constants-only
    /// constraints landing in modules without columns.
    pub fn ensure_family(&mut self, module: Path, multiplier: usize) -> usize {
        if let Some(i) = self.family_of(&module, multiplier) {
            return i;
        }
        self.families.push(RegisterFamily { module, multiplier });
        self.families.len() - 1
    }
}

/// Walk the scope tree and allocate every column to a register.
///
/// Panics when `@prove` sources of different bit widths end up on one
/// register; the allocator must never construct that.
pub fn allocate(
    tree: &ScopeTree,
    strategy: RegisterStrategy,
    field_register_width: usize,
) -> RegisterMap {
    let mut map = RegisterMap::default();

    // 1. Flatten columns into register sources, inputs before computed.
    let mut inputs = Vec::new();
    let mut computed = Vec::new();
    for scope_id in tree.scope_ids() {
        let scope = tree.scope(scope_id);
        for (name, index) in scope.binding_names(Namespace::Symbols) {
            let Binding::Column(column) = &scope.bindings[index] else {
                continue;
            };
            if column.kind == ColumnKind::Extern {
                continue; // externs keep their own register tables
            }
            // Aliases share the binding index, so each column flattens
            // once even when reachable under several names.
            if column.path.name() != name {
                continue;
            }
            let binding = BindingRef {
                scope: scope_id,
                index,
            };
            let bit_width = bit_width_of(&column.ty, field_register_width);
            let bucket = if column.computed {
                &mut computed
            } else {
                &mut inputs
            };
            match column.array {
                None => bucket.push(RegisterSource {
                    binding,
                    array_index: None,
                    module: column.context.clone(),
                    perspective: column.perspective.clone(),
                    name: name.clone(),
                    multiplier: column.multiplier,
                    bit_width,
                    must_prove: column.must_prove,
                    computed: column.computed,
                    display: column.display,
                }),
                Some((lo, hi)) => {
                    for i in lo..=hi {
                        bucket.push(RegisterSource {
                            binding,
                            array_index: Some(i),
                            module: column.context.clone(),
                            perspective: column.perspective.clone(),
                            name: format!("{}_{}", name, i),
                            multiplier: column.multiplier,
                            bit_width,
                            must_prove: column.must_prove,
                            computed: column.computed,
                            display: column.display,
                        });
                    }
                }
            }
        }
    }
    map.sources = inputs;
    map.sources.extend(computed);

    // 2. One register per source, preserving order.
    for (source_index, source) in map.sources.iter().enumerate() {
        let family = match map
            .families
            .iter()
            .position(|f| f.module == source.module && f.multiplier == source.multiplier)
        {
            Some(f) => f,
            None => {
                map.families.push(RegisterFamily {
                    module: source.module.clone(),
                    multiplier: source.multiplier,
                });
                map.families.len() - 1
            }
        };
        map.registers.push(AllocatedRegister {
            family,
            name: source.name.clone(),
            bit_width: source.bit_width,
            computed: source.computed,
            must_prove: source.must_prove,
            display: source.display,
            sources: vec![source_index],
            active: true,
        });
    }

    // 3. Optional merging.
    if strategy == RegisterStrategy::FirstFit {
        merge_first_fit(&mut map);
    }

    // 4. Compact and build the column indirection.
    compact(&mut map);
    debug!(
        "allocated {} registers over {} families",
        map.registers.len(),
        map.families.len()
    );
    map
}

fn bit_width_of(ty: &Type, field_register_width: usize) -> usize {
    ty.bit_width().unwrap_or(field_register_width)
}

/// Merge registers of the same family holding columns of *different*
/// perspectives; their row sets are disjoint, so one physical register
/// can carry both.
fn merge_first_fit(map: &mut RegisterMap) {
    for i in 0..map.registers.len() {
        if !map.registers[i].active {
            continue;
        }
        let Some(persp_i) = source_perspective(map, i) else {
            continue;
        };
        for j in 0..i {
            if !map.registers[j].active || map.registers[j].family != map.registers[i].family {
                continue;
            }
            if map.registers[j].computed != map.registers[i].computed {
                continue;
            }
            let mergeable = map.registers[j].sources.iter().all(|&s| {
                map.sources[s]
                    .perspective
                    .as_ref()
                    .map(|p| p != &persp_i)
                    .unwrap_or(false)
            });
            if !mergeable {
                continue;
            }
            // Fold i into j: union of sources, widest width, dominant
            // must-prove.
            let moved = std::mem::take(&mut map.registers[i].sources);
            let folded_prove = map.registers[i].must_prove;
            map.registers[j].sources.extend(moved);
            let width = map.registers[j]
                .sources
                .iter()
                .map(|&s| map.sources[s].bit_width)
                .max()
                .unwrap_or(0);
            map.registers[j].bit_width = width;
            map.registers[j].must_prove |= folded_prove;
            map.registers[i].active = false;
            break;
        }
    }
    for r in &map.registers {
        if !r.active {
            continue;
        }
        let prove_widths: Vec<usize> = r
            .sources
            .iter()
            .map(|&s| &map.sources[s])
            .filter(|s| s.must_prove)
            .map(|s| s.bit_width)
            .collect();
        if prove_widths.windows(2).any(|w| w[0] != w[1]) {
            panic!(
                "register '{}' merges @prove sources of different widths",
                r.name
            );
        }
    }
}

fn source_perspective(map: &RegisterMap, register: usize) -> Option<String> {
    let &source = map.registers[register].sources.first()?;
    map.sources[source].perspective.clone()
}

/// Drop merged-away registers and rebuild the column indirection.
fn compact(map: &mut RegisterMap) {
    let kept: Vec<AllocatedRegister> =
        map.registers.drain(..).filter(|r| r.active).collect();
    map.registers = kept;
    map.by_column.clear();
    for (register_index, register) in map.registers.iter().enumerate() {
        for &source_index in &register.sources {
            let source = &map.sources[source_index];
            map.by_column.insert(
                (
                    source.binding.scope,
                    source.binding.index,
                    source.array_index.unwrap_or(0),
                ),
                register_index,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::parser::parse_source_files;
    use crate::compiler::resolve::{resolve, FieldInfo};
    use crate::compiler::span::SourceMap;

    fn allocate_src(src: &str, strategy: RegisterStrategy) -> (RegisterMap, ScopeTree) {
        let mut sources = SourceMap::new();
        sources.add_file("test.cdl", src);
        let (ast, errors) = parse_source_files(&sources);
        assert!(errors.is_empty(), "{:?}", errors);
        let (resolved, errors) = resolve(
            ast,
            &[],
            FieldInfo {
                bit_width: 253,
                register_width: 252,
            },
        );
        assert!(errors.is_empty(), "{:?}", errors);
        (allocate(&resolved.tree, strategy, 252), resolved.tree)
    }

    #[test]
    fn test_identity_one_register_per_source() {
        let (map, _) = allocate_src(
            "(module mem) (defcolumns (A :i8) (B :i16) (X :i8 :array [1:3]))",
            RegisterStrategy::Identity,
        );
        let names: Vec<&str> = map.registers().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B", "X_1", "X_2", "X_3"]);
        assert_eq!(map.families.len(), 1);
        assert_eq!(map.families[0].ir_name(), "mem");
    }

    #[test]
    fn test_inputs_before_computed() {
        let (map, _) = allocate_src(
            "(module mem) (defcolumns (A :i8) (B :i8)) (definterleaved AB (A B))",
            RegisterStrategy::Identity,
        );
        let computed: Vec<bool> = map.registers().iter().map(|r| r.computed).collect();
        assert_eq!(computed, vec![false, false, true]);
        // Interleavings open a new multiplier family.
        assert_eq!(map.families.len(), 2);
        assert_eq!(map.families[1].multiplier, 2);
        assert_eq!(map.families[1].ir_name(), "mem_x2");
    }

    #[test]
    fn test_first_fit_merges_disjoint_perspectives() {
        let (map, _) = allocate_src(
            "(module mem) (defcolumns (SEL_A :binary) (SEL_B :binary))\
             (defperspective pa SEL_A ((V :i8)))\
             (defperspective pb SEL_B ((W :i16)))",
            RegisterStrategy::FirstFit,
        );
        // V and W share a register; the two selectors stay apart.
        assert_eq!(map.registers().len(), 3);
        let merged = map
            .registers()
            .iter()
            .find(|r| r.sources.len() == 2)
            .expect("one merged register");
        assert_eq!(merged.bit_width, 16);
    }

    #[test]
    fn test_identity_keeps_perspective_columns_apart() {
        let (map, _) = allocate_src(
            "(module mem) (defcolumns (SEL_A :binary) (SEL_B :binary))\
             (defperspective pa SEL_A ((V :i8)))\
             (defperspective pb SEL_B ((W :i16)))",
            RegisterStrategy::Identity,
        );
        assert_eq!(map.registers().len(), 4);
    }
}
