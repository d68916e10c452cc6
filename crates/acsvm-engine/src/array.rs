//! Sparse Word-indexed array
//!
//! A four-level radix trie (bank → segment → page → slot) covering the
//! full 32-bit index space. Levels are allocated lazily along written
//! paths only; an untouched array is a single `None`. Reading an
//! unallocated path yields 0 without materializing anything.

use crate::serial::{Serial, SerialError, Signature};
use crate::strings::StringRefs;
use acsvm_bytecode::Word;
use std::io::{Read, Write};

/// Slots per page; each trie level fans out by the same factor.
const PAGE_SIZE: usize = 256;

type Page = [Word; PAGE_SIZE];

struct Segment {
    pages: [Option<Box<Page>>; PAGE_SIZE],
}

impl Default for Segment {
    fn default() -> Self {
        Self {
            pages: std::array::from_fn(|_| None),
        }
    }
}

struct Bank {
    segments: [Option<Box<Segment>>; PAGE_SIZE],
}

impl Default for Bank {
    fn default() -> Self {
        Self {
            segments: std::array::from_fn(|_| None),
        }
    }
}

type BankTable = [Option<Box<Bank>>; PAGE_SIZE];

/// Sparse mapping from Word index to Word value
#[derive(Default)]
pub struct Array {
    banks: Option<Box<BankTable>>,
}

#[inline]
fn split(idx: Word) -> (usize, usize, usize, usize) {
    (
        (idx >> 24) as usize,
        (idx >> 16) as usize & 0xFF,
        (idx >> 8) as usize & 0xFF,
        idx as usize & 0xFF,
    )
}

impl Array {
    /// Create an empty array
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the value at `idx` without materializing any trie levels.
    /// Unallocated paths read as 0.
    pub fn find(&self, idx: Word) -> Word {
        let (b, s, p, slot) = split(idx);
        self.banks
            .as_ref()
            .and_then(|banks| banks[b].as_ref())
            .and_then(|bank| bank.segments[s].as_ref())
            .and_then(|segment| segment.pages[p].as_ref())
            .map_or(0, |page| page[slot])
    }

    /// Get a mutable reference to the slot at `idx`, materializing the
    /// chain of intermediate levels on demand
    pub fn get_mut(&mut self, idx: Word) -> &mut Word {
        let (b, s, p, slot) = split(idx);
        let banks = self
            .banks
            .get_or_insert_with(|| Box::new(std::array::from_fn(|_| None)));
        let bank = banks[b].get_or_insert_with(Box::default);
        let segment = bank.segments[s].get_or_insert_with(Box::default);
        let page = segment.pages[p].get_or_insert_with(|| Box::new([0; PAGE_SIZE]));
        &mut page[slot]
    }

    /// Write `value` at `idx`
    pub fn set(&mut self, idx: Word, value: Word) {
        *self.get_mut(idx) = value;
    }

    /// Free the entire trie
    pub fn clear(&mut self) {
        self.banks = None;
    }

    /// True iff nothing has ever been materialized
    pub fn is_empty(&self) -> bool {
        self.banks.is_none()
    }

    /// Visit every word of every allocated page, in index order
    fn for_each_page(&self, mut visit: impl FnMut(Word, &Page)) {
        let Some(banks) = self.banks.as_ref() else {
            return;
        };
        for (b, bank) in banks.iter().enumerate() {
            let Some(bank) = bank else { continue };
            for (s, segment) in bank.segments.iter().enumerate() {
                let Some(segment) = segment else { continue };
                for (p, page) in segment.pages.iter().enumerate() {
                    let Some(page) = page else { continue };
                    let base = ((b as Word) << 24) | ((s as Word) << 16) | ((p as Word) << 8);
                    visit(base, page);
                }
            }
        }
    }

    /// Write the array as VLN runs: `(start, length, values…)` per
    /// partially populated page, terminated by a `(0, 0)` sentinel
    pub fn save_state<W: Write>(&self, serial: &mut Serial<W>) -> Result<(), SerialError> {
        serial.write_sign(Signature::Array.to_word())?;

        let mut result: Result<(), SerialError> = Ok(());
        self.for_each_page(|base, page| {
            if result.is_err() {
                return;
            }
            // Trim leading and trailing runs of zero Words.
            let Some(first) = page.iter().position(|&w| w != 0) else {
                return;
            };
            let last = page.iter().rposition(|&w| w != 0).unwrap_or(first);

            result = (|| {
                serial.write_vln(base + first as Word)?;
                serial.write_vln((last - first + 1) as Word)?;
                for &word in &page[first..=last] {
                    serial.write_vln(word)?;
                }
                Ok(())
            })();
        });
        result?;

        serial.write_vln(0)?;
        serial.write_vln(0)?;
        serial.write_sign(!Signature::Array.to_word())?;
        Ok(())
    }

    /// Read array contents previously written by `save_state`. Version-0
    /// sessions instead use the legacy dense grid format.
    pub fn load_state<R: Read>(&mut self, serial: &mut Serial<R>) -> Result<(), SerialError> {
        self.clear();
        serial.read_sign(Signature::Array.to_word())?;

        if serial.version == 0 {
            self.load_state_v0(serial)?;
        } else {
            loop {
                let start = serial.read_vln()?;
                let len = serial.read_vln()?;
                if start == 0 && len == 0 {
                    break;
                }
                for i in 0..len {
                    let value = serial.read_vln()?;
                    if value != 0 {
                        self.set(start.wrapping_add(i), value);
                    }
                }
            }
        }

        serial.read_sign(!Signature::Array.to_word())?;
        Ok(())
    }

    /// Legacy dense format: one presence byte per bank, then per segment,
    /// then per page; each present page is a full 256 VLN Words.
    fn load_state_v0<R: Read>(&mut self, serial: &mut Serial<R>) -> Result<(), SerialError> {
        for b in 0..PAGE_SIZE as Word {
            if serial.read_byte()? == 0 {
                continue;
            }
            for s in 0..PAGE_SIZE as Word {
                if serial.read_byte()? == 0 {
                    continue;
                }
                for p in 0..PAGE_SIZE as Word {
                    if serial.read_byte()? == 0 {
                        continue;
                    }
                    let base = (b << 24) | (s << 16) | (p << 8);
                    for slot in 0..PAGE_SIZE as Word {
                        let value = serial.read_vln()?;
                        if value != 0 {
                            self.set(base | slot, value);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Hand every word of every allocated page to `op`
    pub(crate) fn sweep_strings(
        &self,
        refs: &mut dyn StringRefs,
        op: fn(&mut dyn StringRefs, Word),
    ) {
        self.for_each_page(|_, page| {
            for &word in page.iter() {
                op(refs, word);
            }
        });
    }

    /// Pin every populated Word as a string-table index
    pub fn lock_strings(&self, refs: &mut dyn StringRefs) {
        self.sweep_strings(refs, |r: &mut dyn StringRefs, w| r.lock(w));
    }

    /// Release every populated Word as a string-table index
    pub fn unlock_strings(&self, refs: &mut dyn StringRefs) {
        self.sweep_strings(refs, |r: &mut dyn StringRefs, w| r.unlock(w));
    }

    /// Mark every populated Word as a reachable string-table index
    pub fn ref_strings(&self, refs: &mut dyn StringRefs) {
        self.sweep_strings(refs, |r: &mut dyn StringRefs, w| r.mark_referenced(w));
    }
}
