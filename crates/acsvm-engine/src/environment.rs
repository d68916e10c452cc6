//! The top-level VM environment
//!
//! One `Environment` owns everything with global lifetime: the string
//! table, the module registry, the global scopes, the thread pool,
//! the environment-level action queue, and collected fault
//! diagnostics. The host drives it one tick at a time with [`exec`]
//! and addresses scripts by [`ScopeId`] + [`ScriptName`].
//!
//! [`exec`]: Environment::exec

use crate::action::{ActionQueue, ScopeId, ScriptAction};
use crate::module::{Module, ScriptName};
use crate::scope::{GlobalScope, ScopeCtx};
use crate::serial::{Serial, SerialError, Signature};
use crate::strings::{StringRefs, StringTable};
use crate::thread::ThreadPool;
use crate::{ScriptFault, VmError};
use acsvm_bytecode::{ModuleData, ScriptType, Word};
use rustc_hash::FxHashMap;
use std::io::{Read, Write};
use std::sync::Arc;

/// The whole VM
#[derive(Default)]
pub struct Environment {
    strings: StringTable,
    modules: FxHashMap<String, Arc<Module>>,
    globals: FxHashMap<Word, GlobalScope>,
    pool: ThreadPool,
    actions: ActionQueue,
    faults: Vec<ScriptFault>,
}

impl Environment {
    /// Create an empty environment
    pub fn new() -> Self {
        Self::default()
    }

    /// The global string table
    pub fn strings(&self) -> &StringTable {
        &self.strings
    }

    /// The global string table, mutably (for host-side interning)
    pub fn strings_mut(&mut self) -> &mut StringTable {
        &mut self.strings
    }

    /// Intern and register a decoded module container. Every module it
    /// imports must have been loaded first; loading the same name again
    /// returns the already-registered module.
    pub fn load_module(&mut self, data: &ModuleData) -> Result<Arc<Module>, VmError> {
        if let Some(module) = self.modules.get(&data.name) {
            return Ok(module.clone());
        }
        let module = Arc::new(Module::from_data(data, &mut self.strings, &self.modules)?);
        self.modules.insert(data.name.clone(), module.clone());
        Ok(module)
    }

    /// The registered module of that name, if any
    pub fn get_module(&self, name: &str) -> Option<Arc<Module>> {
        self.modules.get(name).cloned()
    }

    /// The global scope with the given id, created on first access
    pub fn get_global_scope(&mut self, id: Word) -> &mut GlobalScope {
        self.globals.entry(id).or_default()
    }

    /// The global scope with the given id, if it exists
    pub fn global_scope(&self, id: Word) -> Option<&GlobalScope> {
        self.globals.get(&id)
    }

    /// The thread pool, for inspecting thread state
    pub fn threads(&self) -> &ThreadPool {
        &self.pool
    }

    /// Queue an action at the environment level; it is delegated
    /// during each level's exec, so it reaches an active map within
    /// one tick and parks above any inactive or missing scope
    pub fn defer_action(&mut self, action: ScriptAction) {
        self.actions.push(action);
    }

    /// Drain collected fault diagnostics
    pub fn take_faults(&mut self) -> Vec<ScriptFault> {
        std::mem::take(&mut self.faults)
    }

    /// Run one tick: sink queued actions into active global scopes,
    /// then tick every active global scope outer-to-inner
    pub fn exec(&mut self) {
        let mut rest = ActionQueue::new();
        while let Some(action) = self.actions.pop() {
            match self.globals.get_mut(&action.id.global) {
                Some(global) if global.active => global.actions.push(action),
                _ => rest.push(action),
            }
        }
        self.actions = rest;

        let Self {
            strings,
            globals,
            pool,
            faults,
            ..
        } = self;
        for global in globals.values_mut().filter(|global| global.active) {
            global.exec(strings, pool, faults);
        }
    }

    /// Whether any thread anywhere is live
    pub fn has_active_thread(&self) -> bool {
        self.globals
            .values()
            .any(|global| global.has_active_thread(&self.pool))
    }

    /// Start a script now, resuming its resident thread if one exists
    pub fn script_start(&mut self, id: ScopeId, name: ScriptName, args: &[Word]) -> bool {
        let Self { globals, pool, .. } = self;
        globals
            .entry(id.global)
            .or_default()
            .get_hub_scope(id.hub)
            .get_map_scope(id.map)
            .script_start(name, args, pool)
    }

    /// Start a fresh thread for a script regardless of residency
    pub fn script_start_forced(&mut self, id: ScopeId, name: ScriptName, args: &[Word]) -> bool {
        let Self { globals, pool, .. } = self;
        globals
            .entry(id.global)
            .or_default()
            .get_hub_scope(id.hub)
            .get_map_scope(id.map)
            .script_start_forced(name, args, pool)
    }

    /// Start a script and run it synchronously to its first yield
    /// point, returning its result Word (0 if it does not exist)
    pub fn script_start_result(&mut self, id: ScopeId, name: ScriptName, args: &[Word]) -> Word {
        let Self {
            strings,
            globals,
            pool,
            faults,
            ..
        } = self;
        let global = globals.entry(id.global).or_default();
        let GlobalScope {
            regs: gbl_regs,
            arrs: gbl_arrs,
            hubs,
            ..
        } = global;
        let hub = hubs.entry(id.hub).or_default();
        let crate::scope::HubScope {
            regs: hub_regs,
            arrs: hub_arrs,
            maps,
            ..
        } = hub;
        let map = maps.entry(id.map).or_default();

        let mut ctx = ScopeCtx {
            strings,
            pool,
            faults,
            gbl_regs: gbl_regs.as_mut_slice(),
            gbl_arrs: gbl_arrs.as_mut_slice(),
            hub_regs: hub_regs.as_mut_slice(),
            hub_arrs: hub_arrs.as_mut_slice(),
        };
        map.script_start_result(name, args, &mut ctx)
    }

    /// Start every script of `stype` in the addressed map; returns how
    /// many started
    pub fn script_start_type(&mut self, id: ScopeId, stype: ScriptType, args: &[Word]) -> Word {
        let Self { globals, pool, .. } = self;
        globals
            .entry(id.global)
            .or_default()
            .get_hub_scope(id.hub)
            .get_map_scope(id.map)
            .script_start_type(stype, args, pool)
    }

    /// Stop a script's resident thread
    pub fn script_stop(&mut self, id: ScopeId, name: ScriptName) -> bool {
        let Self { globals, pool, .. } = self;
        globals
            .entry(id.global)
            .or_default()
            .get_hub_scope(id.hub)
            .get_map_scope(id.map)
            .script_stop(name, pool)
    }

    /// Pause a script's resident thread
    pub fn script_pause(&mut self, id: ScopeId, name: ScriptName) -> bool {
        let Self { globals, pool, .. } = self;
        globals
            .entry(id.global)
            .or_default()
            .get_hub_scope(id.hub)
            .get_map_scope(id.map)
            .script_pause(name, pool)
    }

    /// Whether a script currently has a live resident thread
    pub fn is_script_active(&self, id: ScopeId, name: ScriptName) -> bool {
        self.globals
            .get(&id.global)
            .and_then(|global| global.hub_scope(id.hub))
            .and_then(|hub| hub.map_scope(id.map))
            .map(|map| map.is_script_active(name, &self.pool))
            .unwrap_or(false)
    }

    /// Wake threads in the addressed map blocked on `tag`
    pub fn notify_tag(&mut self, id: ScopeId, tag: Word) {
        let Self { globals, pool, .. } = self;
        let map = globals
            .get_mut(&id.global)
            .and_then(|global| global.hubs.get_mut(&id.hub))
            .and_then(|hub| hub.maps.get_mut(&id.map));
        if let Some(map) = map {
            map.notify_tag(tag, pool);
        }
    }

    fn sweep_all(&mut self, op: fn(&mut dyn StringRefs, Word)) {
        let Self {
            strings,
            globals,
            pool,
            actions,
            ..
        } = self;
        actions.sweep_strings(strings, op);
        for global in globals.values() {
            global.sweep_strings(pool, strings, op);
        }
    }

    /// Collect unreachable, unlocked strings: clear marks, mark every
    /// reference reachable from storage, free the rest
    pub fn collect_strings(&mut self) {
        self.strings.collect_begin();
        self.sweep_all(|r: &mut dyn StringRefs, w| r.mark_referenced(w));
        self.strings.collect_end();
    }

    /// Write the whole VM state. Storage-held string references are
    /// lock-swept for the duration of the write so their pins travel
    /// with the stream.
    pub fn save_state<W: Write>(&mut self, stream: W) -> Result<(), SerialError> {
        self.sweep_all(|r: &mut dyn StringRefs, w| r.lock(w));
        let result = self.write_state(stream);
        self.sweep_all(|r: &mut dyn StringRefs, w| r.unlock(w));
        result
    }

    fn write_state<W: Write>(&self, stream: W) -> Result<(), SerialError> {
        let mut serial = Serial::new_writer(stream, true);
        serial.save_head()?;
        serial.write_sign(Signature::Environ.to_word())?;

        self.strings.save_state(&mut serial)?;
        self.actions.save_state(&mut serial)?;

        serial.write_vln(self.globals.len() as Word)?;
        let mut ids: Vec<Word> = self.globals.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            serial.write_vln(id)?;
            self.globals[&id].save_state(&mut serial, &self.pool)?;
        }

        serial.write_sign(!Signature::Environ.to_word())?;
        serial.save_tail()
    }

    /// Replace the whole VM state from a stream written by
    /// `save_state`. Every module the stream references must already
    /// be registered, in the same load order as in the saving session
    /// so string slots line up.
    pub fn load_state<R: Read>(&mut self, stream: R) -> Result<(), SerialError> {
        self.reset();

        let mut serial = Serial::new_reader(stream);
        serial.load_head()?;
        serial.read_sign(Signature::Environ.to_word())?;

        self.strings.load_state(&mut serial)?;
        self.actions.load_state(&mut serial)?;

        let count = serial.read_vln()?;
        for _ in 0..count {
            let id = serial.read_vln()?;
            let mut global = GlobalScope::new();
            global.load_state(&mut serial, &self.modules, &mut self.pool)?;
            self.globals.insert(id, global);
        }

        serial.read_sign(!Signature::Environ.to_word())?;
        serial.load_tail()?;

        // Saved lock counts include the save-time lock sweep; undo it
        // so host pins are left as they were.
        self.sweep_all(|r: &mut dyn StringRefs, w| r.unlock(w));
        Ok(())
    }

    /// Drop every scope, thread, queued action, and fault. Modules and
    /// strings stay registered.
    pub fn reset(&mut self) {
        self.globals.clear();
        self.pool.clear();
        self.actions.clear();
        self.faults.clear();
    }
}
