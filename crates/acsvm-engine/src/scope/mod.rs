//! The scope hierarchy
//!
//! Storage and script lifetime are organized in four nested levels:
//! global scopes own hub scopes, hub scopes own map scopes, and map
//! scopes own per-module variable storage plus the running threads.
//! Children are created on first access and addressed by Word ids
//! ([`ScopeId`](crate::ScopeId) names a map scope by the full path).
//!
//! Each level carries an [`ActionQueue`](crate::ActionQueue); per tick
//! a queued action sinks one level toward its map scope, moving only
//! when the addressed child already exists and is active.

mod global;
mod hub;
mod map;
mod module;

pub use global::GlobalScope;
pub use hub::HubScope;
pub use map::MapScope;
pub use module::ModuleScope;

use crate::array::Array;
use crate::strings::StringTable;
use crate::thread::ThreadPool;
use crate::ScriptFault;
use acsvm_bytecode::Word;

/// Borrowed execution context threaded from the environment down to
/// the interpreter: shared services plus the enclosing global and hub
/// storage banks.
pub(crate) struct ScopeCtx<'a> {
    pub strings: &'a mut StringTable,
    pub pool: &'a mut ThreadPool,
    pub faults: &'a mut Vec<ScriptFault>,
    pub gbl_regs: &'a mut [Word],
    pub gbl_arrs: &'a mut [Array],
    pub hub_regs: &'a mut [Word],
    pub hub_arrs: &'a mut [Array],
}
