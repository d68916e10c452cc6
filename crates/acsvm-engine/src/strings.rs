//! Global string table
//!
//! All script-visible strings live in one interning table owned by the
//! [`Environment`](crate::Environment). Scripts reference entries by
//! Word: the slot index bit-complemented, so the high bit doubles as
//! the "this Word is a string" tag. Slot 0 is the permanent empty
//! string.
//!
//! Entries carry a lock count (host pins) and a reference mark used by
//! the mark/sweep collector. Storage sweeps hand every Word they hold
//! to a [`StringRefs`] sink; non-string Words are ignored there, so
//! sweeps never need to know what a slot contains.

use crate::serial::{Serial, SerialError};
use acsvm_bytecode::{Word, STRING_TAG};
use rustc_hash::FxHashMap;
use std::io::{Read, Write};

/// Encode a table slot as the tagged Word scripts see
pub fn tag_string(idx: Word) -> Word {
    !idx
}

/// Decode a tagged Word back to a table slot, if the tag bit is set
pub fn untag_string(word: Word) -> Option<Word> {
    (word & STRING_TAG != 0).then(|| !word)
}

/// Sink for string references found during storage sweeps
///
/// Implementations receive raw storage Words and must themselves
/// ignore anything that is not a tagged string reference.
pub trait StringRefs {
    /// Pin the referenced string against collection
    fn lock(&mut self, word: Word);
    /// Release one pin on the referenced string
    fn unlock(&mut self, word: Word);
    /// Mark the referenced string reachable for the current collection
    fn mark_referenced(&mut self, word: Word);
}

struct StringEntry {
    text: String,
    lock: Word,
    referenced: bool,
}

/// Interning table of script-visible strings
pub struct StringTable {
    entries: Vec<Option<StringEntry>>,
    lookup: FxHashMap<String, Word>,
    free: Vec<Word>,
}

impl Default for StringTable {
    fn default() -> Self {
        Self::new()
    }
}

impl StringTable {
    /// Create a table holding only the permanent empty string at slot 0
    pub fn new() -> Self {
        let mut lookup = FxHashMap::default();
        lookup.insert(String::new(), 0);
        Self {
            entries: vec![Some(StringEntry {
                text: String::new(),
                lock: 0,
                referenced: false,
            })],
            lookup,
            free: Vec::new(),
        }
    }

    /// Intern `text`, returning its slot. Re-interning returns the
    /// existing slot.
    pub fn intern(&mut self, text: &str) -> Word {
        if let Some(&idx) = self.lookup.get(text) {
            return idx;
        }
        let entry = StringEntry {
            text: text.to_owned(),
            lock: 0,
            referenced: false,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.entries[idx as usize] = Some(entry);
                idx
            }
            None => {
                self.entries.push(Some(entry));
                (self.entries.len() - 1) as Word
            }
        };
        self.lookup.insert(text.to_owned(), idx);
        idx
    }

    /// Text of the string at `idx`, if that slot is live
    pub fn get(&self, idx: Word) -> Option<&str> {
        self.entries
            .get(idx as usize)?
            .as_ref()
            .map(|entry| entry.text.as_str())
    }

    /// Resolve a tagged Word to its text
    pub fn get_tagged(&self, word: Word) -> Option<&str> {
        self.get(untag_string(word)?)
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|slot| slot.is_some()).count()
    }

    /// True when only the permanent empty string exists
    pub fn is_empty(&self) -> bool {
        self.len() == 1
    }

    /// Pin a slot directly, bypassing Word decoding
    pub fn lock_slot(&mut self, idx: Word) {
        if let Some(Some(entry)) = self.entries.get_mut(idx as usize) {
            entry.lock += 1;
        }
    }

    /// Release one pin on a slot directly
    pub fn unlock_slot(&mut self, idx: Word) {
        if let Some(Some(entry)) = self.entries.get_mut(idx as usize) {
            entry.lock = entry.lock.saturating_sub(1);
        }
    }

    /// Lock count of a slot, for diagnostics and tests
    pub fn lock_count(&self, idx: Word) -> Word {
        match self.entries.get(idx as usize) {
            Some(Some(entry)) => entry.lock,
            _ => 0,
        }
    }

    /// Begin a collection: clear every reference mark
    pub fn collect_begin(&mut self) {
        for entry in self.entries.iter_mut().flatten() {
            entry.referenced = false;
        }
    }

    /// Finish a collection: free entries that are neither marked nor
    /// locked. Slot 0 is never freed.
    pub fn collect_end(&mut self) {
        for idx in 1..self.entries.len() {
            let collect = matches!(
                &self.entries[idx],
                Some(entry) if entry.lock == 0 && !entry.referenced
            );
            if collect {
                if let Some(entry) = self.entries[idx].take() {
                    self.lookup.remove(&entry.text);
                    self.free.push(idx as Word);
                }
            }
        }
    }

    /// Write the table: slot count, then per slot a presence byte and,
    /// when present, the text and lock count. Slot indices are stable
    /// across the round trip.
    pub fn save_state<W: Write>(&self, serial: &mut Serial<W>) -> Result<(), SerialError> {
        serial.write_vln(self.entries.len() as Word)?;
        for slot in &self.entries {
            match slot {
                Some(entry) => {
                    serial.write_byte(1)?;
                    serial.write_str(&entry.text)?;
                    serial.write_vln(entry.lock)?;
                }
                None => serial.write_byte(0)?,
            }
        }
        Ok(())
    }

    /// Replace this table's contents from a stream written by
    /// `save_state`
    pub fn load_state<R: Read>(&mut self, serial: &mut Serial<R>) -> Result<(), SerialError> {
        let count = serial.read_vln()? as usize;
        if count == 0 {
            return Err(SerialError::Corrupt("empty string table"));
        }
        self.entries.clear();
        self.lookup.clear();
        self.free.clear();
        for idx in 0..count {
            if serial.read_byte()? == 0 {
                self.entries.push(None);
                self.free.push(idx as Word);
                continue;
            }
            let text = serial.read_str()?;
            let lock = serial.read_vln()?;
            self.lookup.insert(text.clone(), idx as Word);
            self.entries.push(Some(StringEntry {
                text,
                lock,
                referenced: false,
            }));
        }
        Ok(())
    }
}

impl StringRefs for StringTable {
    fn lock(&mut self, word: Word) {
        if let Some(idx) = untag_string(word) {
            self.lock_slot(idx);
        }
    }

    fn unlock(&mut self, word: Word) {
        if let Some(idx) = untag_string(word) {
            self.unlock_slot(idx);
        }
    }

    fn mark_referenced(&mut self, word: Word) {
        if let Some(idx) = untag_string(word) {
            if let Some(Some(entry)) = self.entries.get_mut(idx as usize) {
                entry.referenced = true;
            }
        }
    }
}
