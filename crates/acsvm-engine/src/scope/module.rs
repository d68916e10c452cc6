//! Per-module variable storage within a map scope
//!
//! Every module added to a map gets one `ModuleScope`: a fixed bank of
//! registers and arrays plus an indirection table. The indirection
//! table defaults to the scope's own slots; `import()` repoints slots
//! whose names the module declares as imports at the exporting
//! module's storage. Module scopes are held in the map's arena and
//! reference each other by arena index, so aliases survive moves and
//! serialization.

use crate::array::Array;
use crate::module::Module;
use crate::serial::{Serial, SerialError, Signature};
use crate::strings::StringRefs;
use crate::{ARRC, REGC};
use acsvm_bytecode::Word;
use rustc_hash::FxHashMap;
use std::io::{Read, Write};
use std::sync::Arc;

/// Location of a variable slot within a map's module-scope arena
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StoreRef {
    /// Arena index of the owning module scope
    pub scope: u32,
    /// Slot within that scope's storage bank
    pub idx: u32,
}

/// One module's registers and arrays within a map
pub struct ModuleScope {
    pub(crate) module: Arc<Module>,
    pub(crate) regs: Vec<Word>,
    pub(crate) arrs: Vec<Array>,
    pub(crate) reg_refs: Vec<StoreRef>,
    pub(crate) arr_refs: Vec<StoreRef>,
}

fn identity_refs(scope: u32, count: usize) -> Vec<StoreRef> {
    (0..count)
        .map(|idx| StoreRef {
            scope,
            idx: idx as u32,
        })
        .collect()
}

fn resolve_refs(
    module: &Module,
    self_idx: u32,
    imports_table: &[Option<Word>],
    exports_of: fn(&Module) -> &[Option<Word>],
    index: &FxHashMap<String, u32>,
    count: usize,
) -> Vec<StoreRef> {
    let mut refs = identity_refs(self_idx, count);
    for (slot, name) in imports_table.iter().enumerate().take(count) {
        let Some(name) = *name else { continue };
        'imports: for imp in &module.imports {
            let Some(&scope) = index.get(&imp.name) else {
                continue;
            };
            let exported = exports_of(imp)
                .iter()
                .take(count)
                .position(|export| *export == Some(name));
            if let Some(idx) = exported {
                refs[slot] = StoreRef {
                    scope,
                    idx: idx as u32,
                };
                break 'imports;
            }
        }
    }
    refs
}

impl ModuleScope {
    /// Create storage for `module` at arena index `self_idx`, applying
    /// the module's initializers
    pub(crate) fn new(module: Arc<Module>, self_idx: u32) -> Self {
        let mut regs = vec![0; REGC];
        for (slot, &value) in module.reg_inits.iter().take(REGC).enumerate() {
            regs[slot] = value;
        }

        let mut arrs: Vec<Array> = std::iter::repeat_with(Array::new).take(ARRC).collect();
        for (slot, init) in module.arr_inits.iter().take(ARRC).enumerate() {
            for &(idx, value) in &init.entries {
                arrs[slot].set(idx, value);
            }
        }

        Self {
            reg_refs: identity_refs(self_idx, REGC),
            arr_refs: identity_refs(self_idx, ARRC),
            module,
            regs,
            arrs,
        }
    }

    /// The module this scope stores variables for
    pub fn module(&self) -> &Arc<Module> {
        &self.module
    }

    /// Resolve declared imports against the exports of this module's
    /// imported modules, in import declaration order; the first
    /// exporter of a name wins and unresolved slots stay local.
    pub(crate) fn import(&mut self, self_idx: u32, index: &FxHashMap<String, u32>) {
        self.reg_refs = resolve_refs(
            &self.module,
            self_idx,
            &self.module.reg_imports,
            |m| &m.reg_names,
            index,
            REGC,
        );
        self.arr_refs = resolve_refs(
            &self.module,
            self_idx,
            &self.module.arr_imports,
            |m| &m.arr_names,
            index,
            ARRC,
        );
    }

    /// Write this scope's own storage. Indirection tables are derived
    /// data and are rebuilt by `import()` on load.
    pub(crate) fn save_state<W: Write>(&self, serial: &mut Serial<W>) -> Result<(), SerialError> {
        serial.write_sign(Signature::ModuleScope.to_word())?;
        for &reg in &self.regs {
            serial.write_vln(reg)?;
        }
        for arr in &self.arrs {
            arr.save_state(serial)?;
        }
        serial.write_sign(!Signature::ModuleScope.to_word())?;
        Ok(())
    }

    /// Read storage written by `save_state`, replacing initializers
    pub(crate) fn load_state<R: Read>(
        &mut self,
        serial: &mut Serial<R>,
    ) -> Result<(), SerialError> {
        serial.read_sign(Signature::ModuleScope.to_word())?;
        for reg in &mut self.regs {
            *reg = serial.read_vln()?;
        }
        for arr in &mut self.arrs {
            arr.load_state(serial)?;
        }
        serial.read_sign(!Signature::ModuleScope.to_word())?;
        Ok(())
    }

    pub(crate) fn sweep_strings(
        &self,
        refs: &mut dyn StringRefs,
        op: fn(&mut dyn StringRefs, Word),
    ) {
        // Registers are treated as single string indices, unlike arrays.
        for &reg in &self.regs {
            op(refs, reg);
        }
        for arr in &self.arrs {
            arr.sweep_strings(refs, op);
        }
    }
}
