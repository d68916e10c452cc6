//! Loaded modules
//!
//! [`Module`] is the engine's immutable, interned form of a decoded
//! [`ModuleData`] container: local string indices are replaced by
//! global table slots, import names are resolved against the
//! environment's registry, and the result is shared behind `Arc`
//! between scopes and threads. Modules are never unloaded, so every
//! string they intern is pinned for the life of the environment.

use crate::serial::{Serial, SerialError};
use crate::strings::{tag_string, StringRefs, StringTable};
use crate::VmError;
use acsvm_bytecode::{ArrayInit, FunctionDef, ModuleData, ScriptNameDef, ScriptType, Word};
use rustc_hash::FxHashMap;
use std::io::{Read, Write};
use std::sync::Arc;

/// How a script is addressed by hosts and by other scripts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptName {
    /// Numbered script
    Int(Word),
    /// Named script; the Word is a global string-table slot
    Str(Word),
}

impl ScriptName {
    pub(crate) fn save_state<W: Write>(&self, serial: &mut Serial<W>) -> Result<(), SerialError> {
        match *self {
            ScriptName::Int(n) => {
                serial.write_byte(0)?;
                serial.write_vln(n)
            }
            ScriptName::Str(slot) => {
                serial.write_byte(1)?;
                serial.write_vln(slot)
            }
        }
    }

    pub(crate) fn load_state<R: Read>(serial: &mut Serial<R>) -> Result<Self, SerialError> {
        match serial.read_byte()? {
            0 => Ok(ScriptName::Int(serial.read_vln()?)),
            1 => Ok(ScriptName::Str(serial.read_vln()?)),
            _ => Err(SerialError::Corrupt("invalid script name tag")),
        }
    }

    pub(crate) fn sweep_strings(
        &self,
        refs: &mut dyn StringRefs,
        op: fn(&mut dyn StringRefs, Word),
    ) {
        if let ScriptName::Str(slot) = *self {
            op(refs, tag_string(slot));
        }
    }
}

/// An executable script entry point within a module
#[derive(Debug, Clone)]
pub struct Script {
    /// Name scripts and hosts start it by
    pub name: ScriptName,
    /// When the host auto-starts it
    pub stype: ScriptType,
    /// Code offset of the first instruction
    pub entry: Word,
    /// Declared argument count
    pub arg_count: Word,
    /// Local register slots, including arguments
    pub local_regs: Word,
    /// Local array slots
    pub local_arrs: Word,
    /// Host-defined flag bits
    pub flags: Word,
}

/// An immutable loaded module
#[derive(Debug)]
pub struct Module {
    /// Registry name, also the identity used by serialized state
    pub name: String,
    /// Bytecode
    pub code: Vec<Word>,
    /// Script entry points
    pub scripts: Vec<Script>,
    /// Callable functions
    pub functions: Vec<FunctionDef>,
    /// Local string index → global table slot
    pub strings: Vec<Word>,
    /// Initial values for module arrays
    pub arr_inits: Vec<ArrayInit>,
    /// Initial values for module registers
    pub reg_inits: Vec<Word>,
    /// Exported array names per slot (global table slots)
    pub arr_names: Vec<Option<Word>>,
    /// Exported register names per slot
    pub reg_names: Vec<Option<Word>>,
    /// Imported array names per slot
    pub arr_imports: Vec<Option<Word>>,
    /// Imported register names per slot
    pub reg_imports: Vec<Option<Word>>,
    /// Modules this one imports, in declaration order
    pub imports: Vec<Arc<Module>>,
}

fn intern_name_table(
    table: &[Option<Word>],
    local: &[Word],
) -> Result<Vec<Option<Word>>, VmError> {
    table
        .iter()
        .map(|slot| {
            slot.map(|idx| {
                local
                    .get(idx as usize)
                    .copied()
                    .ok_or(VmError::BadModule("string index out of range"))
            })
            .transpose()
        })
        .collect()
}

impl Module {
    /// Intern a decoded container against the global string table and
    /// resolve its imports from `registry`. Every import must already
    /// be registered, which also rules out import cycles.
    pub(crate) fn from_data(
        data: &ModuleData,
        strings: &mut StringTable,
        registry: &FxHashMap<String, Arc<Module>>,
    ) -> Result<Self, VmError> {
        let local: Vec<Word> = data
            .strings
            .iter()
            .map(|text| {
                let slot = strings.intern(text);
                strings.lock_slot(slot);
                slot
            })
            .collect();

        let scripts = data
            .scripts
            .iter()
            .map(|def| {
                let name = match def.name {
                    ScriptNameDef::Int(n) => ScriptName::Int(n),
                    ScriptNameDef::Str(idx) => ScriptName::Str(
                        local
                            .get(idx as usize)
                            .copied()
                            .ok_or(VmError::BadModule("script name string out of range"))?,
                    ),
                };
                let stype = ScriptType::from_word(def.stype)
                    .ok_or(VmError::BadModule("invalid script type"))?;
                Ok(Script {
                    name,
                    stype,
                    entry: def.entry,
                    arg_count: def.arg_count,
                    local_regs: def.local_regs,
                    local_arrs: def.local_arrs,
                    flags: def.flags,
                })
            })
            .collect::<Result<Vec<_>, VmError>>()?;

        let imports = data
            .imports
            .iter()
            .map(|name| {
                registry
                    .get(name)
                    .cloned()
                    .ok_or_else(|| VmError::UnknownModule(name.clone()))
            })
            .collect::<Result<Vec<_>, VmError>>()?;

        let arr_names = intern_name_table(&data.arr_names, &local)?;
        let reg_names = intern_name_table(&data.reg_names, &local)?;
        let arr_imports = intern_name_table(&data.arr_imports, &local)?;
        let reg_imports = intern_name_table(&data.reg_imports, &local)?;

        Ok(Self {
            name: data.name.clone(),
            code: data.code.clone(),
            scripts,
            functions: data.functions.clone(),
            strings: local,
            arr_inits: data.arr_inits.clone(),
            reg_inits: data.reg_inits.clone(),
            arr_names,
            reg_names,
            arr_imports,
            reg_imports,
            imports,
        })
    }

    /// Index of the script with the given name, if any
    pub fn find_script(&self, name: ScriptName) -> Option<u32> {
        self.scripts
            .iter()
            .position(|script| script.name == name)
            .map(|idx| idx as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(data: &ModuleData) -> (Module, StringTable) {
        let mut strings = StringTable::new();
        let registry = FxHashMap::default();
        let module = Module::from_data(data, &mut strings, &registry).unwrap();
        (module, strings)
    }

    #[test]
    fn test_strings_interned_and_pinned() {
        let mut data = ModuleData::new("m");
        data.strings = vec!["first".to_string(), "second".to_string()];
        let (module, strings) = load(&data);

        assert_eq!(strings.get(module.strings[0]), Some("first"));
        assert_eq!(strings.get(module.strings[1]), Some("second"));
        assert_eq!(strings.lock_count(module.strings[0]), 1);
    }

    #[test]
    fn test_script_names_resolved() {
        let mut data = ModuleData::new("m");
        data.strings = vec!["boss_defeated".to_string()];
        data.scripts.push(acsvm_bytecode::ScriptDef {
            name: ScriptNameDef::Int(4),
            stype: ScriptType::Closed.to_word(),
            entry: 0,
            arg_count: 0,
            local_regs: 0,
            local_arrs: 0,
            flags: 0,
        });
        data.scripts.push(acsvm_bytecode::ScriptDef {
            name: ScriptNameDef::Str(0),
            stype: ScriptType::Open.to_word(),
            entry: 0,
            arg_count: 0,
            local_regs: 0,
            local_arrs: 0,
            flags: 0,
        });
        let (module, strings) = load(&data);

        assert_eq!(module.find_script(ScriptName::Int(4)), Some(0));
        let slot = match module.scripts[1].name {
            ScriptName::Str(slot) => slot,
            other => panic!("expected string name, got {other:?}"),
        };
        assert_eq!(strings.get(slot), Some("boss_defeated"));
        assert_eq!(module.find_script(ScriptName::Int(99)), None);
    }

    #[test]
    fn test_unknown_import_rejected() {
        let mut data = ModuleData::new("m");
        data.imports = vec!["missing".to_string()];
        let mut strings = StringTable::new();
        let registry = FxHashMap::default();
        let err = Module::from_data(&data, &mut strings, &registry).unwrap_err();
        assert_eq!(err, VmError::UnknownModule("missing".to_string()));
    }

    #[test]
    fn test_bad_string_index_rejected() {
        let mut data = ModuleData::new("m");
        data.arr_names = vec![Some(3)];
        let mut strings = StringTable::new();
        let registry = FxHashMap::default();
        let err = Module::from_data(&data, &mut strings, &registry).unwrap_err();
        assert!(matches!(err, VmError::BadModule(_)));
    }
}
