//! The `MixedProgram` output surface: externs as supplied, plus the IR
//! modules produced by translation.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::field::PrimeField;
use crate::ir::{IrModule, ModuleId, Register, RegisterRef};

/// A register of a pre-existing module, declared rather than compiled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternRegister {
    pub name: String,
    pub bit_width: usize,
    pub output: bool,
}

/// A pre-existing module linked into the program as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternModule {
    pub name: String,
    pub public: bool,
    pub registers: Vec<ExternRegister>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixedProgram<F: PrimeField> {
    pub externs: Vec<ExternModule>,
    pub modules: Vec<IrModule<F>>,
}

impl<F: PrimeField> MixedProgram<F> {
    pub fn new(externs: Vec<ExternModule>, modules: Vec<IrModule<F>>) -> Self {
        MixedProgram { externs, modules }
    }

    /// The unified module space indexes externs first, then IR modules.
    pub fn module_name(&self, id: ModuleId) -> &str {
        if id < self.externs.len() {
            &self.externs[id].name
        } else {
            &self.modules[id - self.externs.len()].name
        }
    }

    pub fn ir_module(&self, id: ModuleId) -> Option<&IrModule<F>> {
        id.checked_sub(self.externs.len()).map(|i| &self.modules[i])
    }

    pub fn register(&self, r: RegisterRef) -> Option<&Register<F>> {
        self.ir_module(r.module)?.registers.get(r.index)
    }

    pub fn register_name(&self, r: RegisterRef) -> String {
        if r.module < self.externs.len() {
            let m = &self.externs[r.module];
            format!("{}.{}", m.name, m.registers[r.index].name)
        } else {
            let m = &self.modules[r.module - self.externs.len()];
            format!("{}.{}", m.name, m.registers[r.index].name)
        }
    }

    /// Canonical JSON serialization. Field ordering is struct ordering and
    /// all collections are emitted in insertion order, so identical inputs
    /// serialize identically across runs and platforms.
    pub fn to_canonical_json(&self) -> String {
        serde_json::to_string(self).expect("program serialization cannot fail")
    }

    /// SHA-256 fingerprint of the canonical serialization.
    pub fn digest(&self) -> String {
        format!(
            "sha256:{:x}",
            Sha256::digest(self.to_canonical_json().as_bytes())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::Gf251;
    use crate::ir::Constraint;
    use crate::ir::{Handle, LogicalTerm, Term};

    fn sample() -> MixedProgram<Gf251> {
        let externs = vec![ExternModule {
            name: "rom".to_string(),
            public: true,
            registers: vec![ExternRegister {
                name: "PC".to_string(),
                bit_width: 32,
                output: true,
            }],
        }];
        let mut module = IrModule::new("mem", 1);
        module.registers.push(Register {
            name: "ADDR".to_string(),
            bit_width: 16,
            padding: Gf251::zero(),
            computed: false,
        });
        module.constraints.push(Constraint::Vanishing {
            handle: Handle::new("mem", "addr-vanishes"),
            module: 1,
            domain: None,
            body: LogicalTerm::Vanishes(Term::Register {
                reg: RegisterRef {
                    module: 1,
                    index: 0,
                },
                shift: 0,
            }),
        });
        MixedProgram::new(externs, vec![module])
    }

    #[test]
    fn test_unified_module_space() {
        let p = sample();
        assert_eq!(p.module_name(0), "rom");
        assert_eq!(p.module_name(1), "mem");
        assert_eq!(
            p.register_name(RegisterRef {
                module: 0,
                index: 0
            }),
            "rom.PC"
        );
        assert_eq!(
            p.register_name(RegisterRef {
                module: 1,
                index: 0
            }),
            "mem.ADDR"
        );
    }

    #[test]
    fn test_digest_is_stable() {
        let a = sample();
        let b = sample();
        assert_eq!(a.digest(), b.digest());
        assert!(a.digest().starts_with("sha256:"));
    }
}
