//! Deferred script control actions
//!
//! Hosts and scopes request script control through [`ScriptAction`]
//! values held in ordered queues. Each scope level delegates its
//! queued actions before ticking its children, so an action handed to
//! the environment descends through every active level and reaches
//! its map within a single tick: environment to the addressed global
//! scope, global scope to the hub, hub to the map, and the map
//! finally resolves the script name and applies the action. An action
//! only moves down once the addressed child scope exists and is
//! active; until then it stays queued at the level above.

use crate::module::ScriptName;
use crate::serial::{Serial, SerialError};
use crate::strings::StringRefs;
use acsvm_bytecode::Word;
use std::collections::VecDeque;
use std::io::{Read, Write};

/// Address of a map scope within the hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId {
    /// Global scope id
    pub global: Word,
    /// Hub scope id within the global scope
    pub hub: Word,
    /// Map scope id within the hub scope
    pub map: Word,
}

impl ScopeId {
    /// Shorthand constructor
    pub fn new(global: Word, hub: Word, map: Word) -> Self {
        Self { global, hub, map }
    }
}

/// What a [`ScriptAction`] does once it reaches its map scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    /// Start the script, or resume its resident thread
    Start,
    /// Start a fresh thread regardless of residency
    StartForced,
    /// Stop the script's resident thread
    Stop,
    /// Pause the script's resident thread
    Pause,
}

impl ActionKind {
    fn to_byte(self) -> u8 {
        match self {
            ActionKind::Start => 0,
            ActionKind::StartForced => 1,
            ActionKind::Stop => 2,
            ActionKind::Pause => 3,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, SerialError> {
        Ok(match byte {
            0 => ActionKind::Start,
            1 => ActionKind::StartForced,
            2 => ActionKind::Stop,
            3 => ActionKind::Pause,
            _ => return Err(SerialError::Corrupt("invalid action kind")),
        })
    }
}

/// A deferred script control request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptAction {
    /// What to do on arrival
    pub kind: ActionKind,
    /// Map scope the script lives in
    pub id: ScopeId,
    /// Script to act on
    pub name: ScriptName,
    /// Arguments for start actions
    pub args: Vec<Word>,
}

impl ScriptAction {
    fn save_state<W: Write>(&self, serial: &mut Serial<W>) -> Result<(), SerialError> {
        serial.write_byte(self.kind.to_byte())?;
        serial.write_vln(self.id.global)?;
        serial.write_vln(self.id.hub)?;
        serial.write_vln(self.id.map)?;
        self.name.save_state(serial)?;
        serial.write_vln(self.args.len() as Word)?;
        for &arg in &self.args {
            serial.write_vln(arg)?;
        }
        Ok(())
    }

    fn load_state<R: Read>(serial: &mut Serial<R>) -> Result<Self, SerialError> {
        let kind = ActionKind::from_byte(serial.read_byte()?)?;
        let id = ScopeId::new(serial.read_vln()?, serial.read_vln()?, serial.read_vln()?);
        let name = ScriptName::load_state(serial)?;
        let count = serial.read_vln()?;
        let mut args = Vec::with_capacity(count as usize);
        for _ in 0..count {
            args.push(serial.read_vln()?);
        }
        Ok(Self {
            kind,
            id,
            name,
            args,
        })
    }

    fn sweep_strings(&self, refs: &mut dyn StringRefs, op: fn(&mut dyn StringRefs, Word)) {
        self.name.sweep_strings(refs, op);
        for &arg in &self.args {
            op(refs, arg);
        }
    }
}

/// FIFO queue of pending script actions
#[derive(Default)]
pub struct ActionQueue {
    queue: VecDeque<ScriptAction>,
}

impl ActionQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an action
    pub fn push(&mut self, action: ScriptAction) {
        self.queue.push_back(action);
    }

    /// Take the oldest pending action
    pub fn pop(&mut self) -> Option<ScriptAction> {
        self.queue.pop_front()
    }

    /// Number of pending actions
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True when nothing is pending
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drop every pending action
    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Write the queue in order
    pub fn save_state<W: Write>(&self, serial: &mut Serial<W>) -> Result<(), SerialError> {
        serial.write_vln(self.queue.len() as Word)?;
        for action in &self.queue {
            action.save_state(serial)?;
        }
        Ok(())
    }

    /// Replace the queue from a stream written by `save_state`
    pub fn load_state<R: Read>(&mut self, serial: &mut Serial<R>) -> Result<(), SerialError> {
        self.queue.clear();
        let count = serial.read_vln()?;
        for _ in 0..count {
            self.queue.push_back(ScriptAction::load_state(serial)?);
        }
        Ok(())
    }

    /// Hand every string reference held by queued actions to `op`
    pub(crate) fn sweep_strings(
        &self,
        refs: &mut dyn StringRefs,
        op: fn(&mut dyn StringRefs, Word),
    ) {
        for action in &self.queue {
            action.sweep_strings(refs, op);
        }
    }

    /// Pin string references held by queued actions
    pub fn lock_strings(&self, refs: &mut dyn StringRefs) {
        self.sweep_strings(refs, |r: &mut dyn StringRefs, w| r.lock(w));
    }

    /// Release string references held by queued actions
    pub fn unlock_strings(&self, refs: &mut dyn StringRefs) {
        self.sweep_strings(refs, |r: &mut dyn StringRefs, w| r.unlock(w));
    }

    /// Mark string references held by queued actions
    pub fn ref_strings(&self, refs: &mut dyn StringRefs) {
        self.sweep_strings(refs, |r: &mut dyn StringRefs, w| r.mark_referenced(w));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strings::{tag_string, StringTable};

    fn sample(kind: ActionKind, map: Word) -> ScriptAction {
        ScriptAction {
            kind,
            id: ScopeId::new(0, 1, map),
            name: ScriptName::Int(7),
            args: vec![1, 2, 3],
        }
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = ActionQueue::new();
        queue.push(sample(ActionKind::Start, 1));
        queue.push(sample(ActionKind::Stop, 2));
        assert_eq!(queue.pop().unwrap().id.map, 1);
        assert_eq!(queue.pop().unwrap().id.map, 2);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_queue_roundtrip() {
        let mut queue = ActionQueue::new();
        queue.push(sample(ActionKind::StartForced, 3));
        queue.push(ScriptAction {
            kind: ActionKind::Pause,
            id: ScopeId::new(9, 8, 7),
            name: ScriptName::Str(4),
            args: Vec::new(),
        });

        let mut serial = Serial::new_writer(Vec::new(), false);
        queue.save_state(&mut serial).unwrap();
        let bytes = serial.into_inner();

        let mut restored = ActionQueue::new();
        let mut serial = Serial::new_reader(&bytes[..]);
        restored.load_state(&mut serial).unwrap();

        assert_eq!(restored.len(), 2);
        let first = restored.pop().unwrap();
        assert_eq!(first.kind, ActionKind::StartForced);
        assert_eq!(first.args, vec![1, 2, 3]);
        let second = restored.pop().unwrap();
        assert_eq!(second.name, ScriptName::Str(4));
        assert_eq!(second.id, ScopeId::new(9, 8, 7));
    }

    #[test]
    fn test_sweeps_cover_names_and_args() {
        let mut strings = StringTable::new();
        let slot = strings.intern("named");
        let arg = strings.intern("payload");

        let mut queue = ActionQueue::new();
        queue.push(ScriptAction {
            kind: ActionKind::Start,
            id: ScopeId::new(0, 0, 0),
            name: ScriptName::Str(slot),
            args: vec![tag_string(arg), 42],
        });

        queue.lock_strings(&mut strings);
        assert_eq!(strings.lock_count(slot), 1);
        assert_eq!(strings.lock_count(arg), 1);
        queue.unlock_strings(&mut strings);
        assert_eq!(strings.lock_count(slot), 0);
    }
}
