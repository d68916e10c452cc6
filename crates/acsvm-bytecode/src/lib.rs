//! Bytecode definitions and module container format for the ACS VM
//!
//! This crate is the leaf of the VM stack: the `Word` scalar type, the
//! opcode set, fixed little-endian encode/decode primitives, and the
//! `ModuleData` container a host loads bytecode units from.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod encoder;
pub mod module;
pub mod opcode;

pub use encoder::{BytecodeReader, BytecodeWriter, DecodeError};
pub use module::{ArrayInit, FunctionDef, ModuleData, ModuleError, ScriptDef, ScriptNameDef};
pub use opcode::{Opcode, ScriptType, Word, STRING_TAG};
