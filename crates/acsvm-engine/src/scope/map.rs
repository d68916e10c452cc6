//! Map scope: module storage, script tables, and threads
//!
//! The map scope is where scripts actually live. It owns one
//! [`ModuleScope`] per added module, lookup tables from script name to
//! script, the slot bindings from script to resident thread, and the
//! list of live threads it ticks each `exec`.

use crate::action::{ActionKind, ActionQueue};
use crate::module::{Module, ScriptName};
use crate::scope::module::ModuleScope;
use crate::scope::ScopeCtx;
use crate::serial::{Serial, SerialError, Signature};
use crate::strings::{untag_string, StringRefs, StringTable};
use crate::thread::{ThreadId, ThreadPool, ThreadState};
use acsvm_bytecode::{ScriptType, Word};
use rustc_hash::FxHashMap;
use std::io::{Read, Write};
use std::sync::Arc;

/// A script's location: module scope arena index + script index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ScriptRef {
    pub scope: u32,
    pub script: u32,
}

/// A map scope
#[derive(Default)]
pub struct MapScope {
    /// Whether this scope executes and receives delegated actions
    pub active: bool,
    pub(crate) actions: ActionQueue,
    pub(crate) module_scopes: Vec<ModuleScope>,
    module_index: FxHashMap<String, u32>,
    script_int: FxHashMap<Word, ScriptRef>,
    script_str: FxHashMap<Word, ScriptRef>,
    bindings: FxHashMap<ScriptRef, ThreadId>,
    threads: Vec<ThreadId>,
    finished: bool,
}

impl MapScope {
    /// Create an empty, inactive map scope with no modules
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a module and, recursively, everything it imports. Modules
    /// already present are skipped, so shared imports get exactly one
    /// scope. The first module added is `module0`.
    pub fn add_module(&mut self, module: &Arc<Module>) {
        if self.module_index.contains_key(&module.name) {
            return;
        }
        let idx = self.module_scopes.len() as u32;
        self.module_index.insert(module.name.clone(), idx);
        self.module_scopes.push(ModuleScope::new(module.clone(), idx));
        for import in &module.imports {
            self.add_module(import);
        }
    }

    /// Finish module registration: build the script lookup tables and
    /// resolve every module scope's imports. Effective exactly once;
    /// later calls are no-ops.
    pub fn add_module_finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        let total: usize = self
            .module_scopes
            .iter()
            .map(|ms| ms.module.scripts.len())
            .sum();
        self.script_int = FxHashMap::with_capacity_and_hasher(total, Default::default());
        self.script_str = FxHashMap::with_capacity_and_hasher(total, Default::default());
        self.bindings = FxHashMap::with_capacity_and_hasher(total, Default::default());

        for (scope, ms) in self.module_scopes.iter().enumerate() {
            for (script, def) in ms.module.scripts.iter().enumerate() {
                let sref = ScriptRef {
                    scope: scope as u32,
                    script: script as u32,
                };
                // First module to define a name wins.
                match def.name {
                    ScriptName::Int(n) => {
                        self.script_int.entry(n).or_insert(sref);
                    }
                    ScriptName::Str(slot) => {
                        self.script_str.entry(slot).or_insert(sref);
                    }
                }
            }
        }

        let index = std::mem::take(&mut self.module_index);
        for (idx, ms) in self.module_scopes.iter_mut().enumerate() {
            ms.import(idx as u32, &index);
        }
        self.module_index = index;
    }

    /// The first module added to this map, if any
    pub fn module0(&self) -> Option<&Arc<Module>> {
        self.module_scopes.first().map(|ms| &ms.module)
    }

    /// Resolve a script-visible Word to a global string slot: tagged
    /// Words directly, plain Words through `module0`'s string list.
    /// Plain Words with no matching entry resolve to slot 0, the
    /// permanent empty string.
    pub(crate) fn get_string_slot(&self, word: Word) -> Word {
        match untag_string(word) {
            Some(slot) => slot,
            None => self
                .module0()
                .and_then(|m| m.strings.get(word as usize).copied())
                .unwrap_or(0),
        }
    }

    /// Resolve a script-visible Word to its text
    pub fn get_string<'a>(&self, word: Word, strings: &'a StringTable) -> Option<&'a str> {
        strings.get(self.get_string_slot(word))
    }

    pub(crate) fn find_script(&self, name: ScriptName) -> Option<ScriptRef> {
        match name {
            ScriptName::Int(n) => self.script_int.get(&n).copied(),
            ScriptName::Str(slot) => self.script_str.get(&slot).copied(),
        }
    }

    fn start_fresh(
        &mut self,
        sref: ScriptRef,
        args: &[Word],
        pool: &mut ThreadPool,
    ) -> Option<ThreadId> {
        let module = self.module_scopes.get(sref.scope as usize)?.module.clone();
        let tid = pool.alloc();
        pool.get_mut(tid)
            .start(module, sref.scope, sref.script, args);
        self.threads.push(tid);
        Some(tid)
    }

    /// Start a script, or resume its resident thread if one is bound.
    /// Returns false when the name resolves to nothing.
    pub fn script_start(&mut self, name: ScriptName, args: &[Word], pool: &mut ThreadPool) -> bool {
        let Some(sref) = self.find_script(name) else {
            return false;
        };
        if let Some(&tid) = self.bindings.get(&sref) {
            pool.get_mut(tid).state = ThreadState::Running;
            return true;
        }
        match self.start_fresh(sref, args, pool) {
            Some(tid) => {
                self.bindings.insert(sref, tid);
                true
            }
            None => false,
        }
    }

    /// Start a fresh thread regardless of residency. The slot binding
    /// is left untouched.
    pub fn script_start_forced(
        &mut self,
        name: ScriptName,
        args: &[Word],
        pool: &mut ThreadPool,
    ) -> bool {
        let Some(sref) = self.find_script(name) else {
            return false;
        };
        self.start_fresh(sref, args, pool).is_some()
    }

    /// Start a fresh thread and run it synchronously to its first
    /// yield point, returning its result Word (0 if the script does
    /// not exist)
    pub(crate) fn script_start_result(
        &mut self,
        name: ScriptName,
        args: &[Word],
        ctx: &mut ScopeCtx<'_>,
    ) -> Word {
        let Some(sref) = self.find_script(name) else {
            return 0;
        };
        let Some(tid) = self.start_fresh(sref, args, ctx.pool) else {
            return 0;
        };
        let mut thread = ctx.pool.take(tid);
        thread.exec(self, ctx);
        let result = thread.result;
        let inactive = thread.state == ThreadState::Inactive;
        ctx.pool.put_back(tid, thread);
        if inactive {
            self.threads.retain(|&t| t != tid);
            ctx.pool.free(tid);
        }
        result
    }

    /// Start a fresh, unbound thread for every script of `stype`;
    /// returns how many were started
    pub fn script_start_type(
        &mut self,
        stype: ScriptType,
        args: &[Word],
        pool: &mut ThreadPool,
    ) -> Word {
        let matches: Vec<ScriptRef> = self
            .module_scopes
            .iter()
            .enumerate()
            .flat_map(|(scope, ms)| {
                ms.module
                    .scripts
                    .iter()
                    .enumerate()
                    .filter(move |(_, def)| def.stype == stype)
                    .map(move |(script, _)| ScriptRef {
                        scope: scope as u32,
                        script: script as u32,
                    })
            })
            .collect();

        let mut started = 0;
        for sref in matches {
            if self.start_fresh(sref, args, pool).is_some() {
                started += 1;
            }
        }
        started
    }

    /// Stop a script's resident thread and clear its binding now
    pub fn script_stop(&mut self, name: ScriptName, pool: &mut ThreadPool) -> bool {
        let Some(sref) = self.find_script(name) else {
            return false;
        };
        match self.bindings.remove(&sref) {
            Some(tid) => {
                pool.get_mut(tid).state = ThreadState::Stopped;
                true
            }
            None => false,
        }
    }

    /// Pause a script's resident thread, keeping the binding
    pub fn script_pause(&mut self, name: ScriptName, pool: &mut ThreadPool) -> bool {
        let Some(sref) = self.find_script(name) else {
            return false;
        };
        match self.bindings.get(&sref) {
            Some(&tid) => {
                pool.get_mut(tid).state = ThreadState::Paused;
                true
            }
            None => false,
        }
    }

    /// Whether the script currently has a live resident thread
    pub fn is_script_active(&self, name: ScriptName, pool: &ThreadPool) -> bool {
        self.find_script(name)
            .and_then(|sref| self.bindings.get(&sref))
            .map(|&tid| pool.get(tid).state != ThreadState::Inactive)
            .unwrap_or(false)
    }

    /// Wake threads blocked on `tag`
    pub(crate) fn notify_tag(&mut self, tag: Word, pool: &mut ThreadPool) {
        for &tid in &self.threads {
            let thread = pool.get_mut(tid);
            if thread.state == ThreadState::WaitTag(tag) {
                thread.state = ThreadState::Running;
            }
        }
    }

    /// Drop a dead thread: clear any binding pointing at it and return
    /// it to the pool
    pub(crate) fn free_thread(&mut self, tid: ThreadId, pool: &mut ThreadPool) {
        self.bindings.retain(|_, bound| *bound != tid);
        pool.free(tid);
    }

    /// One tick: resolve queued actions, then run every live thread,
    /// reaping threads that went inactive in the same pass
    pub(crate) fn exec(&mut self, ctx: &mut ScopeCtx<'_>) {
        while let Some(action) = self.actions.pop() {
            // Unresolvable actions are discarded.
            match action.kind {
                ActionKind::Start => {
                    self.script_start(action.name, &action.args, ctx.pool);
                }
                ActionKind::StartForced => {
                    self.script_start_forced(action.name, &action.args, ctx.pool);
                }
                ActionKind::Stop => {
                    self.script_stop(action.name, ctx.pool);
                }
                ActionKind::Pause => {
                    self.script_pause(action.name, ctx.pool);
                }
            }
        }

        let mut i = 0;
        while i < self.threads.len() {
            let tid = self.threads[i];
            let mut thread = ctx.pool.take(tid);
            thread.exec(self, ctx);
            let inactive = thread.state == ThreadState::Inactive;
            ctx.pool.put_back(tid, thread);
            if inactive {
                self.threads.remove(i);
                self.free_thread(tid, ctx.pool);
            } else {
                i += 1;
            }
        }
    }

    /// Whether any thread of this map is live
    pub fn has_active_thread(&self, pool: &ThreadPool) -> bool {
        self.threads
            .iter()
            .any(|&tid| pool.get(tid).state != ThreadState::Inactive)
    }

    /// Free every thread and forget every module
    pub fn reset(&mut self, pool: &mut ThreadPool) {
        for tid in self.threads.drain(..) {
            pool.free(tid);
        }
        self.bindings.clear();
        self.module_scopes.clear();
        self.module_index.clear();
        self.script_int.clear();
        self.script_str.clear();
        self.actions.clear();
        self.finished = false;
    }

    // Storage access used by the interpreter; all paths go through the
    // indirection tables so imported slots read and write the exporter.

    pub(crate) fn mod_reg(&self, scope: u32, slot: Word) -> Option<Word> {
        let sref = *self
            .module_scopes
            .get(scope as usize)?
            .reg_refs
            .get(slot as usize)?;
        self.module_scopes
            .get(sref.scope as usize)?
            .regs
            .get(sref.idx as usize)
            .copied()
    }

    pub(crate) fn mod_reg_set(&mut self, scope: u32, slot: Word, value: Word) -> Option<()> {
        let sref = *self
            .module_scopes
            .get(scope as usize)?
            .reg_refs
            .get(slot as usize)?;
        *self
            .module_scopes
            .get_mut(sref.scope as usize)?
            .regs
            .get_mut(sref.idx as usize)? = value;
        Some(())
    }

    pub(crate) fn mod_arr_find(&self, scope: u32, slot: Word, idx: Word) -> Option<Word> {
        let sref = *self
            .module_scopes
            .get(scope as usize)?
            .arr_refs
            .get(slot as usize)?;
        Some(
            self.module_scopes
                .get(sref.scope as usize)?
                .arrs
                .get(sref.idx as usize)?
                .find(idx),
        )
    }

    pub(crate) fn mod_arr_set(&mut self, scope: u32, slot: Word, idx: Word, value: Word) -> Option<()> {
        let sref = *self
            .module_scopes
            .get(scope as usize)?
            .arr_refs
            .get(slot as usize)?;
        self.module_scopes
            .get_mut(sref.scope as usize)?
            .arrs
            .get_mut(sref.idx as usize)?
            .set(idx, value);
        Some(())
    }

    /// Write the map block: actions, active flag, modules by name with
    /// their storage, threads with a binding flag byte
    pub(crate) fn save_state<W: Write>(
        &self,
        serial: &mut Serial<W>,
        pool: &ThreadPool,
    ) -> Result<(), SerialError> {
        serial.write_sign(Signature::MapScope.to_word())?;
        self.actions.save_state(serial)?;
        serial.write_byte(self.active as u8)?;

        serial.write_vln(self.module_scopes.len() as Word)?;
        for ms in &self.module_scopes {
            serial.write_str(&ms.module.name)?;
            ms.save_state(serial)?;
        }

        serial.write_vln(self.threads.len() as Word)?;
        for &tid in &self.threads {
            let thread = pool.get(tid);
            thread.save_state(serial)?;
            let bound = ScriptRef {
                scope: thread.scope_mod,
                script: thread.script,
            };
            let is_bound = self.bindings.get(&bound) == Some(&tid);
            serial.write_byte(is_bound as u8)?;
        }

        serial.write_sign(!Signature::MapScope.to_word())?;
        Ok(())
    }

    /// Rebuild the map from a stream written by `save_state`. Every
    /// referenced module must already be in `registry`.
    pub(crate) fn load_state<R: Read>(
        &mut self,
        serial: &mut Serial<R>,
        registry: &FxHashMap<String, Arc<Module>>,
        pool: &mut ThreadPool,
    ) -> Result<(), SerialError> {
        self.reset(pool);
        serial.read_sign(Signature::MapScope.to_word())?;
        self.actions.load_state(serial)?;
        self.active = serial.read_byte()? != 0;

        let modules = serial.read_vln()?;
        for idx in 0..modules {
            let name = serial.read_str()?;
            let module = registry
                .get(&name)
                .ok_or(SerialError::Corrupt("module not registered"))?;
            self.module_index.insert(name, idx);
            let mut ms = ModuleScope::new(module.clone(), idx);
            ms.load_state(serial)?;
            self.module_scopes.push(ms);
        }
        self.add_module_finish();

        let threads = serial.read_vln()?;
        for _ in 0..threads {
            let tid = pool.alloc();
            pool.get_mut(tid).load_state(serial, registry)?;
            self.threads.push(tid);
            if serial.read_byte()? != 0 {
                let thread = pool.get(tid);
                let sref = ScriptRef {
                    scope: thread.scope_mod,
                    script: thread.script,
                };
                self.bindings.insert(sref, tid);
            }
        }

        serial.read_sign(!Signature::MapScope.to_word())?;
        Ok(())
    }

    pub(crate) fn sweep_strings(
        &self,
        pool: &ThreadPool,
        refs: &mut dyn StringRefs,
        op: fn(&mut dyn StringRefs, Word),
    ) {
        self.actions.sweep_strings(refs, op);
        for ms in &self.module_scopes {
            ms.sweep_strings(refs, op);
        }
        for &tid in &self.threads {
            pool.get(tid).sweep_strings(refs, op);
        }
    }
}
