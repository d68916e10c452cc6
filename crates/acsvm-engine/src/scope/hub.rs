//! Hub scope: shared storage for a cluster of maps

use crate::action::ActionQueue;
use crate::array::Array;
use crate::module::Module;
use crate::scope::map::MapScope;
use crate::scope::ScopeCtx;
use crate::serial::{Serial, SerialError, Signature};
use crate::strings::{StringRefs, StringTable};
use crate::thread::ThreadPool;
use crate::{ScriptFault, ARRC, REGC};
use acsvm_bytecode::Word;
use rustc_hash::FxHashMap;
use std::io::{Read, Write};
use std::sync::Arc;

/// A hub scope: one bank of registers and arrays shared by its maps
pub struct HubScope {
    /// Whether this scope executes and receives delegated actions
    pub active: bool,
    pub(crate) regs: Vec<Word>,
    pub(crate) arrs: Vec<Array>,
    pub(crate) actions: ActionQueue,
    pub(crate) maps: FxHashMap<Word, MapScope>,
}

impl Default for HubScope {
    fn default() -> Self {
        Self::new()
    }
}

impl HubScope {
    /// Create an empty, inactive hub scope
    pub fn new() -> Self {
        Self {
            active: false,
            regs: vec![0; REGC],
            arrs: std::iter::repeat_with(Array::new).take(ARRC).collect(),
            actions: ActionQueue::new(),
            maps: FxHashMap::default(),
        }
    }

    /// The map scope with the given id, created on first access
    pub fn get_map_scope(&mut self, id: Word) -> &mut MapScope {
        self.maps.entry(id).or_default()
    }

    /// The map scope with the given id, if it exists
    pub fn map_scope(&self, id: Word) -> Option<&MapScope> {
        self.maps.get(&id)
    }

    /// One tick: sink queued actions into active maps, then tick every
    /// active map
    pub(crate) fn exec(
        &mut self,
        gbl_regs: &mut [Word],
        gbl_arrs: &mut [Array],
        strings: &mut StringTable,
        pool: &mut ThreadPool,
        faults: &mut Vec<ScriptFault>,
    ) {
        let mut rest = ActionQueue::new();
        while let Some(action) = self.actions.pop() {
            match self.maps.get_mut(&action.id.map) {
                Some(map) if map.active => map.actions.push(action),
                _ => rest.push(action),
            }
        }
        self.actions = rest;

        let Self { regs, arrs, maps, .. } = self;
        for map in maps.values_mut().filter(|map| map.active) {
            let mut ctx = ScopeCtx {
                strings: &mut *strings,
                pool: &mut *pool,
                faults: &mut *faults,
                gbl_regs: &mut *gbl_regs,
                gbl_arrs: &mut *gbl_arrs,
                hub_regs: regs.as_mut_slice(),
                hub_arrs: arrs.as_mut_slice(),
            };
            map.exec(&mut ctx);
        }
    }

    /// Whether any map of this hub has a live thread
    pub fn has_active_thread(&self, pool: &ThreadPool) -> bool {
        self.maps.values().any(|map| map.has_active_thread(pool))
    }

    /// Free every map and zero this hub's storage
    pub fn reset(&mut self, pool: &mut ThreadPool) {
        for map in self.maps.values_mut() {
            map.reset(pool);
        }
        self.maps.clear();
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
        serial.write_sign(Signature::HubScope.to_word())?;
        for arr in &self.arrs {
            arr.save_state(serial)?;
        }
        for &reg in &self.regs {
            serial.write_vln(reg)?;
        }
        self.actions.save_state(serial)?;
        serial.write_byte(self.active as u8)?;

        serial.write_vln(self.maps.len() as Word)?;
        let mut ids: Vec<Word> = self.maps.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            serial.write_vln(id)?;
            self.maps[&id].save_state(serial, pool)?;
        }

        serial.write_sign(!Signature::HubScope.to_word())?;
        Ok(())
    }

    pub(crate) fn load_state<R: Read>(
        &mut self,
        serial: &mut Serial<R>,
        registry: &FxHashMap<String, Arc<Module>>,
        pool: &mut ThreadPool,
    ) -> Result<(), SerialError> {
        self.reset(pool);
        serial.read_sign(Signature::HubScope.to_word())?;
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
            let mut map = MapScope::new();
            map.load_state(serial, registry, pool)?;
            self.maps.insert(id, map);
        }

        serial.read_sign(!Signature::HubScope.to_word())?;
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
        for map in self.maps.values() {
            map.sweep_strings(pool, refs, op);
        }
    }
}
