//! ACS scripting virtual machine
//!
//! The engine executes bytecode modules inside a scope hierarchy:
//! [`Environment`] owns global scopes, each global scope owns hub
//! scopes, each hub scope owns map scopes, and map scopes own the
//! per-module variable storage and the script threads. Persistent
//! state round-trips through the binary protocol in [`serial`].
//!
//! Scripts are cooperative: the host drives execution one tick at a
//! time through [`Environment::exec`], and every blocking construct
//! (delays, waits, suspension) is a yield point rather than a real
//! block.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod action;
pub mod array;
pub mod environment;
mod interpreter;
pub mod module;
pub mod scope;
pub mod serial;
pub mod store;
pub mod strings;
pub mod thread;

pub use action::{ActionKind, ActionQueue, ScopeId, ScriptAction};
pub use array::Array;
pub use environment::Environment;
pub use module::{Module, Script, ScriptName};
pub use scope::{GlobalScope, HubScope, MapScope, ModuleScope};
pub use serial::{Serial, SerialError};
pub use store::Store;
pub use strings::{StringRefs, StringTable};
pub use thread::{Thread, ThreadId, ThreadState};

use acsvm_bytecode::Word;
use thiserror::Error;

/// Registers per scope storage bank
pub const REGC: usize = 256;

/// Arrays per scope storage bank
pub const ARRC: usize = 256;

/// Maximum data stack depth per thread
pub const DATA_STACK_LIMIT: usize = 4096;

/// Maximum call stack depth per thread
pub const CALL_STACK_LIMIT: usize = 128;

/// Faults raised while interpreting bytecode
///
/// A fault stops the offending thread and is reported through
/// [`ScriptFault`]; it never unwinds into the host or into sibling
/// threads.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmError {
    /// Data stack grew past [`DATA_STACK_LIMIT`]
    #[error("data stack overflow")]
    StackOverflow,

    /// Pop from an empty data stack
    #[error("data stack underflow")]
    StackUnderflow,

    /// Call stack grew past [`CALL_STACK_LIMIT`]
    #[error("call stack overflow")]
    CallStackOverflow,

    /// Word at the instruction pointer is not an opcode
    #[error("invalid opcode {0:#010x}")]
    InvalidOpcode(Word),

    /// Instruction pointer ran off the end of the code
    #[error("instruction pointer {0} out of range")]
    CodeOutOfRange(usize),

    /// Jump target outside the module's code
    #[error("jump target {0} out of range")]
    JumpOutOfRange(Word),

    /// Signed division or remainder by zero
    #[error("division by zero")]
    DivideByZero,

    /// Call to a function index the module does not define
    #[error("invalid function index {0}")]
    BadFunction(Word),

    /// Register or array slot outside the scope's storage
    #[error("storage slot {0} out of range")]
    StorageOutOfRange(Word),

    /// Executed a Kill instruction
    #[error("kill instruction executed")]
    Killed,

    /// Module references an import that is not registered
    #[error("unknown module {0:?}")]
    UnknownModule(String),

    /// Module container is internally inconsistent
    #[error("malformed module: {0}")]
    BadModule(&'static str),
}

/// Diagnostic record for a faulted thread
///
/// Collected by the [`Environment`]; drain with
/// [`Environment::take_faults`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptFault {
    /// Name of the module whose code faulted
    pub module: String,
    /// Index of the script within that module
    pub script: u32,
    /// Code offset of the faulting instruction
    pub ip: usize,
    /// The fault itself
    pub error: VmError,
}
