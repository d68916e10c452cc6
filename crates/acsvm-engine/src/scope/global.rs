//! Global scope: the root of one scope tree

use crate::action::ActionQueue;
use crate::array::Array;
use crate::module::Module;
use crate::scope::hub::HubScope;
use crate::serial::{Serial, SerialError, Signature};
use crate::strings::{StringRefs, StringTable};
use crate::thread::ThreadPool;
use crate::{ScriptFault, ARRC, REGC};
use acsvm_bytecode::Word;
use rustc_hash::FxHashMap;
use std::io::{Read, Write};
use std::sync::Arc;

/// A global scope: persistent storage plus the hubs below it
pub struct GlobalScope {
    /// Whether this scope executes and receives delegated actions
    pub active: bool,
    pub(crate) regs: Vec<Word>,
    pub(crate) arrs: Vec<Array>,
    pub(crate) actions: ActionQueue,
    pub(crate) hubs: FxHashMap<Word, HubScope>,
}

impl Default for GlobalScope {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalScope {
    /// Create an empty, inactive global scope
    pub fn new() -> Self {
        Self {
            active: false,
            regs: vec![0; REGC],
            arrs: std::iter::repeat_with(Array::new).take(ARRC).collect(),
            actions: ActionQueue::new(),
            hubs: FxHashMap::default(),
        }
    }

    /// The hub scope with the given id, created on first access
    pub fn get_hub_scope(&mut self, id: Word) -> &mut HubScope {
        self.hubs.entry(id).or_default()
    }

    /// The hub scope with the given id, if it exists
    pub fn hub_scope(&self, id: Word) -> Option<&HubScope> {
        self.hubs.get(&id)
    }

    /// One tick: sink queued actions into active hubs, then tick every
    /// active hub
    pub(crate) fn exec(
        &mut self,
        strings: &mut StringTable,
        pool: &mut ThreadPool,
        faults: &mut Vec<ScriptFault>,
    ) {
        let mut rest = ActionQueue::new();
        while let Some(action) = self.actions.pop() {
            match self.hubs.get_mut(&action.id.hub) {
                Some(hub) if hub.active => hub.actions.push(action),
                _ => rest.push(action),
            }
        }
        self.actions = rest;

        let Self { regs, arrs, hubs, .. } = self;
        for hub in hubs.values_mut().filter(|hub| hub.active) {
            hub.exec(
                regs.as_mut_slice(),
                arrs.as_mut_slice(),
                strings,
                pool,
                faults,
            );
        }
    }

    /// Whether any map below this scope has a live thread
    pub fn has_active_thread(&self, pool: &ThreadPool) -> bool {
        self.hubs.values().any(|hub| hub.has_active_thread(pool))
    }

    /// Free every hub and zero this scope's storage
    pub fn reset(&mut self, pool: &mut ThreadPool) {
        for hub in self.hubs.values_mut() {
            hub.reset(pool);
        }
        self.hubs.clear();
        self.regs.fill(0);
        for arr in &mut self.arrs {
            arr.clear();
        }
        self.actions.clear();
    }

    pub(crate) fn save_state<W: Write>(
        &self,
        serial: &mut Serial<W>,
        pool: &ThreadPool,
    ) -> Result<(), SerialError> {
        serial.write_sign(Signature::GlobalScope.to_word())?;
        for arr in &self.arrs {
            arr.save_state(serial)?;
        }
        for &reg in &self.regs {
            serial.write_vln(reg)?;
        }
        self.actions.save_state(serial)?;
        serial.write_byte(self.active as u8)?;

        serial.write_vln(self.hubs.len() as Word)?;
        let mut ids: Vec<Word> = self.hubs.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            serial.write_vln(id)?;
            self.hubs[&id].save_state(serial, pool)?;
        }

        serial.write_sign(!Signature::GlobalScope.to_word())?;
        Ok(())
    }

    pub(crate) fn load_state<R: Read>(
        &mut self,
        serial: &mut Serial<R>,
        registry: &FxHashMap<String, Arc<Module>>,
        pool: &mut ThreadPool,
    ) -> Result<(), SerialError> {
        self.reset(pool);
        serial.read_sign(Signature::GlobalScope.to_word())?;
        for arr in &mut self.arrs {
            arr.load_state(serial)?;
        }
        for reg in &mut self.regs {
            *reg = serial.read_vln()?;
        }
        self.actions.load_state(serial)?;
        self.active = serial.read_byte()? != 0;

        let count = serial.read_vln()?;
        for _ in 0..count {
            let id = serial.read_vln()?;
            let mut hub = HubScope::new();
            hub.load_state(serial, registry, pool)?;
            self.hubs.insert(id, hub);
        }

        serial.read_sign(!Signature::GlobalScope.to_word())?;
        Ok(())
    }

    pub(crate) fn sweep_strings(
        &self,
        pool: &ThreadPool,
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
        self.actions.sweep_strings(refs, op);
        for hub in self.hubs.values() {
            hub.sweep_strings(pool, refs, op);
        }
    }
}
