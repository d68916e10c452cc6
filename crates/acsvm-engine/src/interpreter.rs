//! The bytecode interpreter
//!
//! `Thread::exec` dispatches on the thread state, then interprets
//! instructions until a yield point. Each step returns a control
//! result consumed by the outer loop; faults stop the thread and are
//! reported as [`ScriptFault`] values without touching sibling
//! threads.

use crate::module::{Module, ScriptName};
use crate::scope::{MapScope, ScopeCtx};
use crate::strings::tag_string;
use crate::thread::{CallFrame, Thread, ThreadState};
use crate::{ScriptFault, VmError, CALL_STACK_LIMIT, DATA_STACK_LIMIT};
use acsvm_bytecode::{Opcode, Word};
use std::sync::Arc;

/// Outcome of one interpreted instruction
enum Step {
    /// Keep interpreting within this tick
    Continue,
    /// End this thread's tick
    Yield,
}

impl Thread {
    /// Run this thread for one tick
    pub(crate) fn exec(&mut self, map: &mut MapScope, ctx: &mut ScopeCtx<'_>) {
        match self.state {
            ThreadState::Inactive | ThreadState::Paused => return,
            ThreadState::Stopped => {
                // Torn down without executing another instruction.
                self.stop();
                return;
            }
            ThreadState::WaitScrI(n) => {
                if map.is_script_active(ScriptName::Int(n), ctx.pool) {
                    return;
                }
                self.state = ThreadState::Running;
            }
            ThreadState::WaitScrS(slot) => {
                if map.is_script_active(ScriptName::Str(slot), ctx.pool) {
                    return;
                }
                self.state = ThreadState::Running;
            }
            ThreadState::WaitTag(_) => return, // woken by notify_tag
            ThreadState::Running => {}
        }

        if self.delay > 0 {
            self.delay -= 1;
            return;
        }

        loop {
            let Some(module) = self.module.clone() else {
                self.stop();
                return;
            };
            let fault_ip = self.ip;
            match self.step(&module, map, ctx) {
                Ok(Step::Continue) => {}
                Ok(Step::Yield) => return,
                Err(error) => {
                    ctx.faults.push(ScriptFault {
                        module: module.name.clone(),
                        script: self.script,
                        ip: fault_ip,
                        error,
                    });
                    self.stop();
                    return;
                }
            }
        }
    }

    fn push(&mut self, word: Word) -> Result<(), VmError> {
        if self.data_stack.len() >= DATA_STACK_LIMIT {
            return Err(VmError::StackOverflow);
        }
        self.data_stack.push(word);
        Ok(())
    }

    fn pop(&mut self) -> Result<Word, VmError> {
        self.data_stack.pop().ok_or(VmError::StackUnderflow)
    }

    /// Word at the instruction pointer, advancing past it
    fn fetch(&mut self, code: &[Word]) -> Result<Word, VmError> {
        let word = *code.get(self.ip).ok_or(VmError::CodeOutOfRange(self.ip))?;
        self.ip += 1;
        Ok(word)
    }

    fn jump(&mut self, code: &[Word], target: Word) -> Result<(), VmError> {
        if (target as usize) < code.len() {
            self.ip = target as usize;
            Ok(())
        } else {
            Err(VmError::JumpOutOfRange(target))
        }
    }

    fn local_reg(&self, slot: Word) -> Result<Word, VmError> {
        self.local_regs
            .get(slot)
            .copied()
            .ok_or(VmError::StorageOutOfRange(slot))
    }

    fn step(
        &mut self,
        module: &Arc<Module>,
        map: &mut MapScope,
        ctx: &mut ScopeCtx<'_>,
    ) -> Result<Step, VmError> {
        let code = module.code.as_slice();
        let word = self.fetch(code)?;
        let op = Opcode::from_word(word).ok_or(VmError::InvalidOpcode(word))?;

        match op {
            Opcode::Nop => {}
            Opcode::Kill => return Err(VmError::Killed),
            Opcode::Terminate => {
                self.stop();
                return Ok(Step::Yield);
            }
            Opcode::Suspend => {
                self.state = ThreadState::Paused;
                return Ok(Step::Yield);
            }
            Opcode::Delay => {
                self.delay = self.pop()?;
                return Ok(Step::Yield);
            }
            Opcode::DelayImm => {
                self.delay = self.fetch(code)?;
                return Ok(Step::Yield);
            }
            Opcode::Yield => return Ok(Step::Yield),
            Opcode::WaitScrI => {
                let name = self.pop()?;
                if map.is_script_active(ScriptName::Int(name), ctx.pool) {
                    self.state = ThreadState::WaitScrI(name);
                    return Ok(Step::Yield);
                }
            }
            Opcode::WaitScrS => {
                let word = self.pop()?;
                let slot = map.get_string_slot(word);
                if map.is_script_active(ScriptName::Str(slot), ctx.pool) {
                    self.state = ThreadState::WaitScrS(slot);
                    return Ok(Step::Yield);
                }
            }
            Opcode::WaitTag => {
                let tag = self.pop()?;
                self.state = ThreadState::WaitTag(tag);
                return Ok(Step::Yield);
            }
            Opcode::SetResult => self.result = self.pop()?,

            Opcode::Push => {
                let imm = self.fetch(code)?;
                self.push(imm)?;
            }
            Opcode::Drop => {
                self.pop()?;
            }
            Opcode::Dup => {
                let top = *self.data_stack.last().ok_or(VmError::StackUnderflow)?;
                self.push(top)?;
            }
            Opcode::Swap => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(b)?;
                self.push(a)?;
            }

            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::CmpEq
            | Opcode::CmpNe
            | Opcode::CmpLt
            | Opcode::CmpLe
            | Opcode::CmpGt
            | Opcode::CmpGe
            | Opcode::AndBit
            | Opcode::OrBit
            | Opcode::XorBit => {
                let b = self.pop()? as i32;
                let a = self.pop()? as i32;
                let out = match op {
                    Opcode::Add => a.wrapping_add(b),
                    Opcode::Sub => a.wrapping_sub(b),
                    Opcode::Mul => a.wrapping_mul(b),
                    Opcode::Div => {
                        if b == 0 {
                            return Err(VmError::DivideByZero);
                        }
                        a.wrapping_div(b)
                    }
                    Opcode::Mod => {
                        if b == 0 {
                            return Err(VmError::DivideByZero);
                        }
                        a.wrapping_rem(b)
                    }
                    Opcode::CmpEq => (a == b) as i32,
                    Opcode::CmpNe => (a != b) as i32,
                    Opcode::CmpLt => (a < b) as i32,
                    Opcode::CmpLe => (a <= b) as i32,
                    Opcode::CmpGt => (a > b) as i32,
                    Opcode::CmpGe => (a >= b) as i32,
                    Opcode::AndBit => a & b,
                    Opcode::OrBit => a | b,
                    Opcode::XorBit => a ^ b,
                    _ => unreachable!(),
                };
                self.push(out as Word)?;
            }
            Opcode::Neg => {
                let a = self.pop()? as i32;
                self.push(a.wrapping_neg() as Word)?;
            }
            Opcode::NotLog => {
                let a = self.pop()?;
                self.push((a == 0) as Word)?;
            }

            Opcode::Jump => {
                let target = self.fetch(code)?;
                self.jump(code, target)?;
            }
            Opcode::JumpIf => {
                let target = self.fetch(code)?;
                if self.pop()? != 0 {
                    self.jump(code, target)?;
                }
            }
            Opcode::JumpNot => {
                let target = self.fetch(code)?;
                if self.pop()? == 0 {
                    self.jump(code, target)?;
                }
            }

            Opcode::PushLocalReg => {
                let slot = self.fetch(code)?;
                let value = self.local_reg(slot)?;
                self.push(value)?;
            }
            Opcode::DropLocalReg => {
                let slot = self.fetch(code)?;
                let value = self.pop()?;
                *self
                    .local_regs
                    .get_mut(slot)
                    .ok_or(VmError::StorageOutOfRange(slot))? = value;
            }
            Opcode::PushModReg => {
                let slot = self.fetch(code)?;
                let value = map
                    .mod_reg(self.scope_mod, slot)
                    .ok_or(VmError::StorageOutOfRange(slot))?;
                self.push(value)?;
            }
            Opcode::DropModReg => {
                let slot = self.fetch(code)?;
                let value = self.pop()?;
                map.mod_reg_set(self.scope_mod, slot, value)
                    .ok_or(VmError::StorageOutOfRange(slot))?;
            }
            Opcode::PushHubReg => {
                let slot = self.fetch(code)?;
                let value = *ctx
                    .hub_regs
                    .get(slot as usize)
                    .ok_or(VmError::StorageOutOfRange(slot))?;
                self.push(value)?;
            }
            Opcode::DropHubReg => {
                let slot = self.fetch(code)?;
                let value = self.pop()?;
                *ctx.hub_regs
                    .get_mut(slot as usize)
                    .ok_or(VmError::StorageOutOfRange(slot))? = value;
            }
            Opcode::PushGblReg => {
                let slot = self.fetch(code)?;
                let value = *ctx
                    .gbl_regs
                    .get(slot as usize)
                    .ok_or(VmError::StorageOutOfRange(slot))?;
                self.push(value)?;
            }
            Opcode::DropGblReg => {
                let slot = self.fetch(code)?;
                let value = self.pop()?;
                *ctx.gbl_regs
                    .get_mut(slot as usize)
                    .ok_or(VmError::StorageOutOfRange(slot))? = value;
            }

            Opcode::PushLocalArr => {
                let slot = self.fetch(code)?;
                let idx = self.pop()?;
                let value = self
                    .local_arrs
                    .get(slot)
                    .ok_or(VmError::StorageOutOfRange(slot))?
                    .find(idx);
                self.push(value)?;
            }
            Opcode::DropLocalArr => {
                let slot = self.fetch(code)?;
                let value = self.pop()?;
                let idx = self.pop()?;
                self.local_arrs
                    .get_mut(slot)
                    .ok_or(VmError::StorageOutOfRange(slot))?
                    .set(idx, value);
            }
            Opcode::PushModArr => {
                let slot = self.fetch(code)?;
                let idx = self.pop()?;
                let value = map
                    .mod_arr_find(self.scope_mod, slot, idx)
                    .ok_or(VmError::StorageOutOfRange(slot))?;
                self.push(value)?;
            }
            Opcode::DropModArr => {
                let slot = self.fetch(code)?;
                let value = self.pop()?;
                let idx = self.pop()?;
                map.mod_arr_set(self.scope_mod, slot, idx, value)
                    .ok_or(VmError::StorageOutOfRange(slot))?;
            }
            Opcode::PushHubArr => {
                let slot = self.fetch(code)?;
                let idx = self.pop()?;
                let value = ctx
                    .hub_arrs
                    .get(slot as usize)
                    .ok_or(VmError::StorageOutOfRange(slot))?
                    .find(idx);
                self.push(value)?;
            }
            Opcode::DropHubArr => {
                let slot = self.fetch(code)?;
                let value = self.pop()?;
                let idx = self.pop()?;
                ctx.hub_arrs
                    .get_mut(slot as usize)
                    .ok_or(VmError::StorageOutOfRange(slot))?
                    .set(idx, value);
            }
            Opcode::PushGblArr => {
                let slot = self.fetch(code)?;
                let idx = self.pop()?;
                let value = ctx
                    .gbl_arrs
                    .get(slot as usize)
                    .ok_or(VmError::StorageOutOfRange(slot))?
                    .find(idx);
                self.push(value)?;
            }
            Opcode::DropGblArr => {
                let slot = self.fetch(code)?;
                let value = self.pop()?;
                let idx = self.pop()?;
                ctx.gbl_arrs
                    .get_mut(slot as usize)
                    .ok_or(VmError::StorageOutOfRange(slot))?
                    .set(idx, value);
            }

            Opcode::Call => {
                let func = self.fetch(code)?;
                let def = module
                    .functions
                    .get(func as usize)
                    .ok_or(VmError::BadFunction(func))?;
                if self.call_stack.len() >= CALL_STACK_LIMIT {
                    return Err(VmError::CallStackOverflow);
                }
                let entry = def.entry as usize;
                let argc = def.arg_count as usize;
                let regs = (def.local_regs as usize).max(argc);
                let arrs = def.local_arrs as usize;

                let mut args = vec![0; argc];
                for slot in (0..argc).rev() {
                    args[slot] = self.pop()?;
                }

                self.call_stack.push(CallFrame {
                    ret_ip: self.ip,
                    module: module.clone(),
                    scope_mod: self.scope_mod,
                    reg_base: self.local_regs.enter(regs),
                    arr_base: self.local_arrs.enter(arrs),
                });
                for (slot, &arg) in args.iter().enumerate() {
                    if let Some(reg) = self.local_regs.get_mut(slot as Word) {
                        *reg = arg;
                    }
                }
                self.ip = entry;
            }
            Opcode::Retn => match self.call_stack.pop() {
                Some(frame) => {
                    self.local_regs.exit(frame.reg_base);
                    self.local_arrs.exit(frame.arr_base);
                    self.ip = frame.ret_ip;
                    self.scope_mod = frame.scope_mod;
                    self.module = Some(frame.module);
                }
                None => {
                    // Returning from the script body terminates it.
                    self.stop();
                    return Ok(Step::Yield);
                }
            },

            Opcode::BeginPrint => self.print_buf.clear(),
            Opcode::PrintNumber => {
                let value = self.pop()? as i32;
                self.print_buf.push_str(&value.to_string());
            }
            Opcode::PrintChar => {
                let value = self.pop()?;
                self.print_buf.push((value & 0xFF) as u8 as char);
            }
            Opcode::PrintString => {
                let word = self.pop()?;
                if let Some(text) = map.get_string(word, ctx.strings) {
                    self.print_buf.push_str(text);
                }
            }
            Opcode::EndPrint => {
                let slot = ctx.strings.intern(&self.print_buf);
                self.print_buf.clear();
                self.push(tag_string(slot))?;
            }
        }

        Ok(Step::Continue)
    }
}
