//! Module container format
//!
//! A `ModuleData` is the raw, host-loadable form of one bytecode unit:
//! code, script and function definitions, a local string list, storage
//! initializers, and the import/export name tables the engine resolves
//! when a map is instantiated. Names inside a container refer to the
//! module's own string list by index; the engine interns them on load.

use crate::encoder::{BytecodeReader, BytecodeWriter, DecodeError};
use crate::opcode::Word;
use thiserror::Error;

/// Magic number for ACS module containers: "ACSM"
pub const MAGIC: [u8; 4] = *b"ACSM";

/// Current container version
pub const VERSION: u32 = 1;

/// Container encoding/decoding errors
#[derive(Debug, Error)]
pub enum ModuleError {
    /// Decode error
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Invalid magic number
    #[error("Invalid magic number: expected ACSM, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported version
    #[error("Unsupported version: {0} (current: {VERSION})")]
    UnsupportedVersion(u32),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
}

/// Script name as stored in a container: an integer, or an index into
/// the module's local string list. The two are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptNameDef {
    /// Integer-named script
    Int(Word),
    /// String-named script (local string index)
    Str(Word),
}

impl ScriptNameDef {
    fn encode(&self, writer: &mut BytecodeWriter) {
        match *self {
            ScriptNameDef::Int(n) => {
                writer.emit_u8(0);
                writer.emit_word(n);
            }
            ScriptNameDef::Str(s) => {
                writer.emit_u8(1);
                writer.emit_word(s);
            }
        }
    }

    fn decode(reader: &mut BytecodeReader<'_>) -> Result<Self, DecodeError> {
        let tag = reader.read_u8()?;
        let value = reader.read_word()?;
        Ok(if tag == 0 {
            ScriptNameDef::Int(value)
        } else {
            ScriptNameDef::Str(value)
        })
    }
}

/// Script definition
#[derive(Debug, Clone)]
pub struct ScriptDef {
    /// Script name
    pub name: ScriptNameDef,
    /// Script kind, as a raw Word (see [`crate::ScriptType`])
    pub stype: Word,
    /// Entry offset into the module code
    pub entry: Word,
    /// Number of startup arguments copied into local registers
    pub arg_count: Word,
    /// Number of local registers (at least `arg_count`)
    pub local_regs: Word,
    /// Number of local arrays
    pub local_arrs: Word,
    /// Engine-defined flag bits
    pub flags: Word,
}

impl ScriptDef {
    fn encode(&self, writer: &mut BytecodeWriter) {
        self.name.encode(writer);
        writer.emit_word(self.stype);
        writer.emit_word(self.entry);
        writer.emit_word(self.arg_count);
        writer.emit_word(self.local_regs);
        writer.emit_word(self.local_arrs);
        writer.emit_word(self.flags);
    }

    fn decode(reader: &mut BytecodeReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            name: ScriptNameDef::decode(reader)?,
            stype: reader.read_word()?,
            entry: reader.read_word()?,
            arg_count: reader.read_word()?,
            local_regs: reader.read_word()?,
            local_arrs: reader.read_word()?,
            flags: reader.read_word()?,
        })
    }
}

/// Function definition, callable via the `Call` opcode
#[derive(Debug, Clone)]
pub struct FunctionDef {
    /// Entry offset into the module code
    pub entry: Word,
    /// Number of arguments popped into local registers on call
    pub arg_count: Word,
    /// Number of local registers (at least `arg_count`)
    pub local_regs: Word,
    /// Number of local arrays
    pub local_arrs: Word,
}

impl FunctionDef {
    fn encode(&self, writer: &mut BytecodeWriter) {
        writer.emit_word(self.entry);
        writer.emit_word(self.arg_count);
        writer.emit_word(self.local_regs);
        writer.emit_word(self.local_arrs);
    }

    fn decode(reader: &mut BytecodeReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            entry: reader.read_word()?,
            arg_count: reader.read_word()?,
            local_regs: reader.read_word()?,
            local_arrs: reader.read_word()?,
        })
    }
}

/// Initial contents for one module array slot
#[derive(Debug, Clone, Default)]
pub struct ArrayInit {
    /// `(index, value)` pairs applied when the module is instantiated
    pub entries: Vec<(Word, Word)>,
}

impl ArrayInit {
    fn encode(&self, writer: &mut BytecodeWriter) {
        writer.emit_u32(self.entries.len() as u32);
        for &(idx, val) in &self.entries {
            writer.emit_word(idx);
            writer.emit_word(val);
        }
    }

    fn decode(reader: &mut BytecodeReader<'_>) -> Result<Self, DecodeError> {
        let count = reader.read_u32()? as usize;
        let mut entries = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            let idx = reader.read_word()?;
            let val = reader.read_word()?;
            entries.push((idx, val));
        }
        Ok(Self { entries })
    }
}

/// A loadable bytecode module
#[derive(Debug, Clone)]
pub struct ModuleData {
    /// Module name, the identity used for imports and save files
    pub name: String,
    /// Word-encoded instruction stream
    pub code: Vec<Word>,
    /// Script definitions
    pub scripts: Vec<ScriptDef>,
    /// Function definitions
    pub functions: Vec<FunctionDef>,
    /// Local string list
    pub strings: Vec<String>,
    /// Per-slot array initializers
    pub arr_inits: Vec<ArrayInit>,
    /// Register initializers
    pub reg_inits: Vec<Word>,
    /// Per-slot exported array names (local string indices)
    pub arr_names: Vec<Option<Word>>,
    /// Per-slot exported register names (local string indices)
    pub reg_names: Vec<Option<Word>>,
    /// Per-slot imported array names (local string indices)
    pub arr_imports: Vec<Option<Word>>,
    /// Per-slot imported register names (local string indices)
    pub reg_imports: Vec<Option<Word>>,
    /// Names of imported modules
    pub imports: Vec<String>,
}

impl ModuleData {
    /// Create a new empty module
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: Vec::new(),
            scripts: Vec::new(),
            functions: Vec::new(),
            strings: Vec::new(),
            arr_inits: Vec::new(),
            reg_inits: Vec::new(),
            arr_names: Vec::new(),
            reg_names: Vec::new(),
            arr_imports: Vec::new(),
            reg_imports: Vec::new(),
            imports: Vec::new(),
        }
    }

    /// Encode the module to binary container format
    ///
    /// Layout: magic (4 bytes) + version (u32) + flags (u32) + checksum
    /// (u32, CRC32 of everything after the header), then the sections in
    /// declaration order.
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = BytecodeWriter::with_capacity(64 + self.code.len() * 4);

        writer.emit_bytes(&MAGIC);
        writer.emit_u32(VERSION);
        writer.emit_u32(0); // flags, reserved
        let checksum_offset = writer.offset();
        writer.emit_u32(0); // checksum placeholder

        writer.emit_str(&self.name);

        writer.emit_u32(self.code.len() as u32);
        for &word in &self.code {
            writer.emit_word(word);
        }

        writer.emit_u32(self.scripts.len() as u32);
        for script in &self.scripts {
            script.encode(&mut writer);
        }

        writer.emit_u32(self.functions.len() as u32);
        for function in &self.functions {
            function.encode(&mut writer);
        }

        writer.emit_u32(self.strings.len() as u32);
        for string in &self.strings {
            writer.emit_str(string);
        }

        writer.emit_u32(self.arr_inits.len() as u32);
        for init in &self.arr_inits {
            init.encode(&mut writer);
        }

        writer.emit_u32(self.reg_inits.len() as u32);
        for &reg in &self.reg_inits {
            writer.emit_word(reg);
        }

        encode_name_table(&mut writer, &self.arr_names);
        encode_name_table(&mut writer, &self.reg_names);
        encode_name_table(&mut writer, &self.arr_imports);
        encode_name_table(&mut writer, &self.reg_imports);

        writer.emit_u32(self.imports.len() as u32);
        for import in &self.imports {
            writer.emit_str(import);
        }

        let checksum = crc32fast::hash(&writer.buffer()[16..]);
        writer.patch_u32(checksum_offset, checksum);

        writer.into_bytes()
    }

    /// Decode a module from binary container format
    pub fn decode(data: &[u8]) -> Result<Self, ModuleError> {
        let mut reader = BytecodeReader::new(data);

        let magic: [u8; 4] = reader
            .read_bytes(4)?
            .try_into()
            .expect("read_bytes(4) returns 4 bytes");
        if magic != MAGIC {
            return Err(ModuleError::InvalidMagic(magic));
        }

        let version = reader.read_u32()?;
        if version != VERSION {
            return Err(ModuleError::UnsupportedVersion(version));
        }

        let _flags = reader.read_u32()?;
        let stored_checksum = reader.read_u32()?;

        let actual = crc32fast::hash(&data[16..]);
        if stored_checksum != actual {
            return Err(ModuleError::ChecksumMismatch {
                expected: stored_checksum,
                actual,
            });
        }

        let name = reader.read_string()?;

        let code_len = reader.read_u32()? as usize;
        let mut code = Vec::with_capacity(code_len.min(1 << 20));
        for _ in 0..code_len {
            code.push(reader.read_word()?);
        }

        let script_count = reader.read_u32()? as usize;
        let mut scripts = Vec::with_capacity(script_count.min(4096));
        for _ in 0..script_count {
            scripts.push(ScriptDef::decode(&mut reader)?);
        }

        let function_count = reader.read_u32()? as usize;
        let mut functions = Vec::with_capacity(function_count.min(4096));
        for _ in 0..function_count {
            functions.push(FunctionDef::decode(&mut reader)?);
        }

        let string_count = reader.read_u32()? as usize;
        let mut strings = Vec::with_capacity(string_count.min(4096));
        for _ in 0..string_count {
            strings.push(reader.read_string()?);
        }

        let init_count = reader.read_u32()? as usize;
        let mut arr_inits = Vec::with_capacity(init_count.min(4096));
        for _ in 0..init_count {
            arr_inits.push(ArrayInit::decode(&mut reader)?);
        }

        let reg_count = reader.read_u32()? as usize;
        let mut reg_inits = Vec::with_capacity(reg_count.min(4096));
        for _ in 0..reg_count {
            reg_inits.push(reader.read_word()?);
        }

        let arr_names = decode_name_table(&mut reader)?;
        let reg_names = decode_name_table(&mut reader)?;
        let arr_imports = decode_name_table(&mut reader)?;
        let reg_imports = decode_name_table(&mut reader)?;

        let import_count = reader.read_u32()? as usize;
        let mut imports = Vec::with_capacity(import_count.min(256));
        for _ in 0..import_count {
            imports.push(reader.read_string()?);
        }

        Ok(Self {
            name,
            code,
            scripts,
            functions,
            strings,
            arr_inits,
            reg_inits,
            arr_names,
            reg_names,
            arr_imports,
            reg_imports,
            imports,
        })
    }
}

fn encode_name_table(writer: &mut BytecodeWriter, table: &[Option<Word>]) {
    writer.emit_u32(table.len() as u32);
    for entry in table {
        match entry {
            Some(idx) => {
                writer.emit_u8(1);
                writer.emit_word(*idx);
            }
            None => writer.emit_u8(0),
        }
    }
}

fn decode_name_table(reader: &mut BytecodeReader<'_>) -> Result<Vec<Option<Word>>, DecodeError> {
    let count = reader.read_u32()? as usize;
    let mut table = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        if reader.read_u8()? != 0 {
            table.push(Some(reader.read_word()?));
        } else {
            table.push(None);
        }
    }
    Ok(table)
}
