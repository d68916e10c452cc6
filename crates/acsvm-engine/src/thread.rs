//! Script threads and the thread pool
//!
//! A thread is one cooperative execution of a script: data stack,
//! call stack, frame-relative locals, print buffer, and a state
//! machine driving when it runs. Threads are pooled by the
//! environment and recycled through a free list rather than
//! reallocated per script start.

use crate::array::Array;
use crate::module::Module;
use crate::serial::{Serial, SerialError, Signature};
use crate::store::Store;
use crate::strings::{tag_string, StringRefs};
use acsvm_bytecode::Word;
use rustc_hash::FxHashMap;
use std::io::{Read, Write};
use std::sync::Arc;

/// Execution state of a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadState {
    /// Slot is free; the thread holds no script
    #[default]
    Inactive,
    /// Executes on the next tick
    Running,
    /// Marked for teardown; goes Inactive without executing
    Stopped,
    /// Suspended until explicitly restarted
    Paused,
    /// Blocked until the numbered script goes inactive
    WaitScrI(Word),
    /// Blocked until the named script (global string slot) goes inactive
    WaitScrS(Word),
    /// Blocked until the host signals the tag
    WaitTag(Word),
}

impl ThreadState {
    fn save_state<W: Write>(&self, serial: &mut Serial<W>) -> Result<(), SerialError> {
        match *self {
            ThreadState::Inactive => serial.write_byte(0),
            ThreadState::Running => serial.write_byte(1),
            ThreadState::Stopped => serial.write_byte(2),
            ThreadState::Paused => serial.write_byte(3),
            ThreadState::WaitScrI(n) => {
                serial.write_byte(4)?;
                serial.write_vln(n)
            }
            ThreadState::WaitScrS(slot) => {
                serial.write_byte(5)?;
                serial.write_vln(slot)
            }
            ThreadState::WaitTag(tag) => {
                serial.write_byte(6)?;
                serial.write_vln(tag)
            }
        }
    }

    fn load_state<R: Read>(serial: &mut Serial<R>) -> Result<Self, SerialError> {
        Ok(match serial.read_byte()? {
            0 => ThreadState::Inactive,
            1 => ThreadState::Running,
            2 => ThreadState::Stopped,
            3 => ThreadState::Paused,
            4 => ThreadState::WaitScrI(serial.read_vln()?),
            5 => ThreadState::WaitScrS(serial.read_vln()?),
            6 => ThreadState::WaitTag(serial.read_vln()?),
            _ => return Err(SerialError::Corrupt("invalid thread state")),
        })
    }
}

/// Saved caller context for a function call
pub(crate) struct CallFrame {
    pub ret_ip: usize,
    pub module: Arc<Module>,
    pub scope_mod: u32,
    pub reg_base: usize,
    pub arr_base: usize,
}

/// One cooperative script execution
#[derive(Default)]
pub struct Thread {
    /// Current state; drives whether and how `exec` runs
    pub state: ThreadState,
    /// Result Word, set by SetResult and read by start-result calls
    pub result: Word,
    pub(crate) module: Option<Arc<Module>>,
    pub(crate) scope_mod: u32,
    pub(crate) script: u32,
    pub(crate) ip: usize,
    pub(crate) delay: Word,
    pub(crate) data_stack: Vec<Word>,
    pub(crate) call_stack: Vec<CallFrame>,
    pub(crate) local_regs: Store<Word>,
    pub(crate) local_arrs: Store<Array>,
    pub(crate) print_buf: String,
}

impl Thread {
    /// Initialize this thread for a fresh run of `script` in `module`,
    /// copying `args` into the leading local registers
    pub(crate) fn start(
        &mut self,
        module: Arc<Module>,
        scope_mod: u32,
        script: u32,
        args: &[Word],
    ) {
        self.stop();
        let Some(def) = module.scripts.get(script as usize) else {
            return;
        };
        let regs = (def.local_regs as usize).max(def.arg_count as usize);
        let arrs = def.local_arrs as usize;
        let entry = def.entry as usize;

        self.local_regs.enter(regs);
        for (slot, &arg) in args.iter().take(regs).enumerate() {
            if let Some(reg) = self.local_regs.get_mut(slot as Word) {
                *reg = arg;
            }
        }
        self.local_arrs.enter(arrs);

        self.module = Some(module);
        self.scope_mod = scope_mod;
        self.script = script;
        self.ip = entry;
        self.result = 0;
        self.state = ThreadState::Running;
    }

    /// Tear the thread down to Inactive immediately. The result Word
    /// survives so synchronous starts can read it.
    pub(crate) fn stop(&mut self) {
        self.state = ThreadState::Inactive;
        self.module = None;
        self.scope_mod = 0;
        self.script = 0;
        self.ip = 0;
        self.delay = 0;
        self.data_stack.clear();
        self.call_stack.clear();
        self.local_regs.clear();
        self.local_arrs.clear();
        self.print_buf.clear();
    }

    pub(crate) fn save_state<W: Write>(&self, serial: &mut Serial<W>) -> Result<(), SerialError> {
        let module = self
            .module
            .as_ref()
            .ok_or(SerialError::Corrupt("live thread without module"))?;

        serial.write_sign(Signature::Thread.to_word())?;
        self.state.save_state(serial)?;
        serial.write_str(&module.name)?;
        serial.write_vln(self.scope_mod)?;
        serial.write_vln(self.script)?;
        serial.write_vln(self.ip as Word)?;
        serial.write_vln(self.result)?;
        serial.write_vln(self.delay)?;

        serial.write_vln(self.data_stack.len() as Word)?;
        for &word in &self.data_stack {
            serial.write_vln(word)?;
        }

        serial.write_vln(self.call_stack.len() as Word)?;
        for frame in &self.call_stack {
            serial.write_vln(frame.ret_ip as Word)?;
            serial.write_str(&frame.module.name)?;
            serial.write_vln(frame.scope_mod)?;
            serial.write_vln(frame.reg_base as Word)?;
            serial.write_vln(frame.arr_base as Word)?;
        }

        serial.write_vln(self.local_regs.base() as Word)?;
        serial.write_vln(self.local_regs.data().len() as Word)?;
        for &reg in self.local_regs.data() {
            serial.write_vln(reg)?;
        }

        serial.write_vln(self.local_arrs.base() as Word)?;
        serial.write_vln(self.local_arrs.data().len() as Word)?;
        for arr in self.local_arrs.data() {
            arr.save_state(serial)?;
        }

        serial.write_str(&self.print_buf)?;
        serial.write_sign(!Signature::Thread.to_word())?;
        Ok(())
    }

    pub(crate) fn load_state<R: Read>(
        &mut self,
        serial: &mut Serial<R>,
        registry: &FxHashMap<String, Arc<Module>>,
    ) -> Result<(), SerialError> {
        self.stop();
        serial.read_sign(Signature::Thread.to_word())?;
        self.state = ThreadState::load_state(serial)?;

        let name = serial.read_str()?;
        self.module = Some(
            registry
                .get(&name)
                .ok_or(SerialError::Corrupt("module not registered"))?
                .clone(),
        );
        self.scope_mod = serial.read_vln()?;
        self.script = serial.read_vln()?;
        self.ip = serial.read_vln()? as usize;
        self.result = serial.read_vln()?;
        self.delay = serial.read_vln()?;

        let depth = serial.read_vln()?;
        for _ in 0..depth {
            self.data_stack.push(serial.read_vln()?);
        }

        let frames = serial.read_vln()?;
        for _ in 0..frames {
            let ret_ip = serial.read_vln()? as usize;
            let name = serial.read_str()?;
            let module = registry
                .get(&name)
                .ok_or(SerialError::Corrupt("module not registered"))?
                .clone();
            self.call_stack.push(CallFrame {
                ret_ip,
                module,
                scope_mod: serial.read_vln()?,
                reg_base: serial.read_vln()? as usize,
                arr_base: serial.read_vln()? as usize,
            });
        }

        let reg_base = serial.read_vln()? as usize;
        let regs = serial.read_vln()?;
        for _ in 0..regs {
            self.local_regs.push_raw(serial.read_vln()?);
        }
        self.local_regs.set_base(reg_base);

        let arr_base = serial.read_vln()? as usize;
        let arrs = serial.read_vln()?;
        for _ in 0..arrs {
            let mut arr = Array::new();
            arr.load_state(serial)?;
            self.local_arrs.push_raw(arr);
        }
        self.local_arrs.set_base(arr_base);

        self.print_buf = serial.read_str()?;
        serial.read_sign(!Signature::Thread.to_word())?;
        Ok(())
    }

    pub(crate) fn sweep_strings(
        &self,
        refs: &mut dyn StringRefs,
        op: fn(&mut dyn StringRefs, Word),
    ) {
        for &word in &self.data_stack {
            op(refs, word);
        }
        for &reg in self.local_regs.data() {
            op(refs, reg);
        }
        for arr in self.local_arrs.data() {
            arr.sweep_strings(refs, op);
        }
        op(refs, self.result);
        if let ThreadState::WaitScrS(slot) = self.state {
            op(refs, tag_string(slot));
        }
    }
}

/// Pool identifier of a thread; stable for the thread's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(pub(crate) u32);

/// Arena of threads with a free list
#[derive(Default)]
pub struct ThreadPool {
    threads: Vec<Thread>,
    free: Vec<ThreadId>,
}

impl ThreadPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a free slot, growing the arena if none is available
    pub(crate) fn alloc(&mut self) -> ThreadId {
        match self.free.pop() {
            Some(tid) => tid,
            None => {
                self.threads.push(Thread::default());
                ThreadId((self.threads.len() - 1) as u32)
            }
        }
    }

    /// Return a slot to the free list, discarding its contents
    pub(crate) fn free(&mut self, tid: ThreadId) {
        self.threads[tid.0 as usize].stop();
        self.free.push(tid);
    }

    /// The thread in the given slot
    pub fn get(&self, tid: ThreadId) -> &Thread {
        &self.threads[tid.0 as usize]
    }

    /// The thread in the given slot, mutably
    pub fn get_mut(&mut self, tid: ThreadId) -> &mut Thread {
        &mut self.threads[tid.0 as usize]
    }

    /// Move the thread out of its slot for execution, leaving a
    /// default placeholder; pair with `put_back`
    pub(crate) fn take(&mut self, tid: ThreadId) -> Thread {
        std::mem::take(&mut self.threads[tid.0 as usize])
    }

    /// Return a thread taken with `take`
    pub(crate) fn put_back(&mut self, tid: ThreadId, thread: Thread) {
        self.threads[tid.0 as usize] = thread;
    }

    /// Drop every thread and free-list entry
    pub fn clear(&mut self) {
        self.threads.clear();
        self.free.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acsvm_bytecode::{ModuleData, Opcode, ScriptDef, ScriptNameDef, ScriptType};

    fn test_module() -> (Arc<Module>, FxHashMap<String, Arc<Module>>) {
        let mut data = ModuleData::new("threads");
        data.code = vec![Opcode::Push.to_word(), 1, Opcode::Terminate.to_word()];
        data.scripts.push(ScriptDef {
            name: ScriptNameDef::Int(1),
            stype: ScriptType::Closed.to_word(),
            entry: 0,
            arg_count: 2,
            local_regs: 4,
            local_arrs: 1,
            flags: 0,
        });
        let mut strings = crate::strings::StringTable::new();
        let registry = FxHashMap::default();
        let module = Arc::new(Module::from_data(&data, &mut strings, &registry).unwrap());
        let mut registry = FxHashMap::default();
        registry.insert("threads".to_string(), module.clone());
        (module, registry)
    }

    #[test]
    fn test_start_copies_args() {
        let (module, _) = test_module();
        let mut thread = Thread::default();
        thread.start(module, 0, 0, &[7, 9]);

        assert_eq!(thread.state, ThreadState::Running);
        assert_eq!(*thread.local_regs.get(0).unwrap(), 7);
        assert_eq!(*thread.local_regs.get(1).unwrap(), 9);
        assert_eq!(*thread.local_regs.get(2).unwrap(), 0);
        assert!(thread.local_arrs.get(0).is_some());
    }

    #[test]
    fn test_start_bad_script_stays_inactive() {
        let (module, _) = test_module();
        let mut thread = Thread::default();
        thread.start(module, 0, 42, &[]);
        assert_eq!(thread.state, ThreadState::Inactive);
    }

    #[test]
    fn test_pool_recycles_slots() {
        let mut pool = ThreadPool::new();
        let a = pool.alloc();
        let b = pool.alloc();
        assert_ne!(a, b);
        pool.free(a);
        assert_eq!(pool.alloc(), a);
    }

    #[test]
    fn test_thread_roundtrip() {
        let (module, registry) = test_module();
        let mut thread = Thread::default();
        thread.start(module, 0, 0, &[5]);
        thread.state = ThreadState::WaitTag(13);
        thread.delay = 4;
        thread.result = 77;
        thread.data_stack.extend([10, 20, 30]);
        thread.local_arrs.get_mut(0).unwrap().set(1_000_000, 3);
        thread.print_buf.push_str("partial");
        thread.ip = 2;

        let mut serial = Serial::new_writer(Vec::new(), true);
        thread.save_state(&mut serial).unwrap();
        let bytes = serial.into_inner();

        let mut restored = Thread::default();
        let mut serial = Serial::new_reader(&bytes[..]);
        serial.version = crate::serial::VERSION;
        serial.signs = true;
        restored.load_state(&mut serial, &registry).unwrap();

        assert_eq!(restored.state, ThreadState::WaitTag(13));
        assert_eq!(restored.delay, 4);
        assert_eq!(restored.result, 77);
        assert_eq!(restored.ip, 2);
        assert_eq!(restored.data_stack, vec![10, 20, 30]);
        assert_eq!(*restored.local_regs.get(0).unwrap(), 5);
        assert_eq!(restored.local_arrs.get(0).unwrap().find(1_000_000), 3);
        assert_eq!(restored.print_buf, "partial");
        assert_eq!(restored.module.as_ref().unwrap().name, "threads");
    }

    #[test]
    fn test_stop_keeps_result() {
        let (module, _) = test_module();
        let mut thread = Thread::default();
        thread.start(module, 0, 0, &[]);
        thread.result = 55;
        thread.stop();
        assert_eq!(thread.state, ThreadState::Inactive);
        assert_eq!(thread.result, 55);
        assert!(thread.module.is_none());
    }
}
