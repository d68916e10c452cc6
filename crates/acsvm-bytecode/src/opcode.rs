//! Bytecode opcodes for the ACS VM
//!
//! The instruction stream is a sequence of `Word`s. The first Word of an
//! instruction is the opcode; any operands follow as whole Words.

/// The VM's single scalar type.
///
/// Every opcode operand, array element, register, and encoded string
/// reference is a `Word`. A Word with the high bit set denotes a global
/// string-table index, stored bit-complemented.
pub type Word = u32;

/// High bit marking a Word as a direct global string-table reference.
pub const STRING_TAG: Word = 0x8000_0000;

/// Bytecode opcode enumeration
///
/// Opcodes are organized into categories:
/// - 0x00-0x0F: Thread control & yield points
/// - 0x10-0x1F: Stack manipulation
/// - 0x20-0x2F: Arithmetic, comparison & bitwise
/// - 0x30-0x3F: Control flow
/// - 0x40-0x4F: Registers & arrays at each scope level
/// - 0x50-0x5F: Function calls
/// - 0x60-0x6F: Print buffer
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // ===== Thread Control & Yield Points (0x00-0x0F) =====
    /// No operation
    Nop = 0x00,
    /// Deliberate fault; marks unreachable or padding code
    Kill = 0x01,
    /// Terminate the running script (thread goes Inactive)
    Terminate = 0x02,
    /// Suspend the running script (thread goes Paused, resumable by Start)
    Suspend = 0x03,
    /// Pop tick count, sleep that many ticks (yield point)
    Delay = 0x04,
    /// Sleep for the operand's tick count (operand: Word, yield point)
    DelayImm = 0x05,
    /// End this tick's execution without blocking
    Yield = 0x06,
    /// Pop integer script name, block until that script is inactive
    WaitScrI = 0x07,
    /// Pop string index, block until the named script is inactive
    WaitScrS = 0x08,
    /// Pop tag, block until the host signals the tag
    WaitTag = 0x09,
    /// Pop a value into the thread's result Word
    SetResult = 0x0A,

    // ===== Stack Manipulation (0x10-0x1F) =====
    /// Push an immediate Word (operand: Word)
    Push = 0x10,
    /// Pop and discard the top value
    Drop = 0x11,
    /// Duplicate the top value
    Dup = 0x12,
    /// Swap the top two values
    Swap = 0x13,

    // ===== Arithmetic, Comparison & Bitwise (0x20-0x2F) =====
    /// Pop b, pop a, push a + b (wrapping, two's complement)
    Add = 0x20,
    /// Pop b, pop a, push a - b
    Sub = 0x21,
    /// Pop b, pop a, push a * b
    Mul = 0x22,
    /// Pop b, pop a, push a / b (signed; b == 0 faults the thread)
    Div = 0x23,
    /// Pop b, pop a, push a % b (signed; b == 0 faults the thread)
    Mod = 0x24,
    /// Pop a, push -a
    Neg = 0x25,
    /// Pop b, pop a, push a == b
    CmpEq = 0x26,
    /// Pop b, pop a, push a != b
    CmpNe = 0x27,
    /// Pop b, pop a, push a < b (signed)
    CmpLt = 0x28,
    /// Pop b, pop a, push a <= b (signed)
    CmpLe = 0x29,
    /// Pop b, pop a, push a > b (signed)
    CmpGt = 0x2A,
    /// Pop b, pop a, push a >= b (signed)
    CmpGe = 0x2B,
    /// Pop b, pop a, push a & b
    AndBit = 0x2C,
    /// Pop b, pop a, push a | b
    OrBit = 0x2D,
    /// Pop b, pop a, push a ^ b
    XorBit = 0x2E,
    /// Pop a, push !a (logical: 1 if zero, else 0)
    NotLog = 0x2F,

    // ===== Control Flow (0x30-0x3F) =====
    /// Jump to absolute code offset (operand: Word target)
    Jump = 0x30,
    /// Pop a; jump if a != 0 (operand: Word target)
    JumpIf = 0x31,
    /// Pop a; jump if a == 0 (operand: Word target)
    JumpNot = 0x32,

    // ===== Registers & Arrays (0x40-0x4F) =====
    /// Push thread-local register (operand: Word slot)
    PushLocalReg = 0x40,
    /// Pop into thread-local register (operand: Word slot)
    DropLocalReg = 0x41,
    /// Push module-scope register (operand: Word slot)
    PushModReg = 0x42,
    /// Pop into module-scope register (operand: Word slot)
    DropModReg = 0x43,
    /// Push hub-scope register (operand: Word slot)
    PushHubReg = 0x44,
    /// Pop into hub-scope register (operand: Word slot)
    DropHubReg = 0x45,
    /// Push global-scope register (operand: Word slot)
    PushGblReg = 0x46,
    /// Pop into global-scope register (operand: Word slot)
    DropGblReg = 0x47,
    /// Pop index, push element of thread-local array (operand: Word array)
    PushLocalArr = 0x48,
    /// Pop value, pop index, store into thread-local array (operand: Word array)
    DropLocalArr = 0x49,
    /// Pop index, push element of module-scope array (operand: Word array)
    PushModArr = 0x4A,
    /// Pop value, pop index, store into module-scope array (operand: Word array)
    DropModArr = 0x4B,
    /// Pop index, push element of hub-scope array (operand: Word array)
    PushHubArr = 0x4C,
    /// Pop value, pop index, store into hub-scope array (operand: Word array)
    DropHubArr = 0x4D,
    /// Pop index, push element of global-scope array (operand: Word array)
    PushGblArr = 0x4E,
    /// Pop value, pop index, store into global-scope array (operand: Word array)
    DropGblArr = 0x4F,

    // ===== Function Calls (0x50-0x5F) =====
    /// Call module function (operand: Word function index);
    /// pops the callee's declared argument count into its local registers
    Call = 0x50,
    /// Return from function, restoring the caller's frame
    Retn = 0x51,

    // ===== Print Buffer (0x60-0x6F) =====
    /// Clear the thread's print buffer
    BeginPrint = 0x60,
    /// Pop a Word, append its signed decimal rendering
    PrintNumber = 0x61,
    /// Pop a Word, append it as a character (low byte)
    PrintChar = 0x62,
    /// Pop a string index, append the string's text
    PrintString = 0x63,
    /// Intern the print buffer and push its tagged global index
    EndPrint = 0x64,
}

impl Opcode {
    /// Decode an opcode from a bytecode Word
    pub fn from_word(word: Word) -> Option<Self> {
        use Opcode::*;
        Some(match word {
            0x00 => Nop,
            0x01 => Kill,
            0x02 => Terminate,
            0x03 => Suspend,
            0x04 => Delay,
            0x05 => DelayImm,
            0x06 => Yield,
            0x07 => WaitScrI,
            0x08 => WaitScrS,
            0x09 => WaitTag,
            0x0A => SetResult,

            0x10 => Push,
            0x11 => Drop,
            0x12 => Dup,
            0x13 => Swap,

            0x20 => Add,
            0x21 => Sub,
            0x22 => Mul,
            0x23 => Div,
            0x24 => Mod,
            0x25 => Neg,
            0x26 => CmpEq,
            0x27 => CmpNe,
            0x28 => CmpLt,
            0x29 => CmpLe,
            0x2A => CmpGt,
            0x2B => CmpGe,
            0x2C => AndBit,
            0x2D => OrBit,
            0x2E => XorBit,
            0x2F => NotLog,

            0x30 => Jump,
            0x31 => JumpIf,
            0x32 => JumpNot,

            0x40 => PushLocalReg,
            0x41 => DropLocalReg,
            0x42 => PushModReg,
            0x43 => DropModReg,
            0x44 => PushHubReg,
            0x45 => DropHubReg,
            0x46 => PushGblReg,
            0x47 => DropGblReg,
            0x48 => PushLocalArr,
            0x49 => DropLocalArr,
            0x4A => PushModArr,
            0x4B => DropModArr,
            0x4C => PushHubArr,
            0x4D => DropHubArr,
            0x4E => PushGblArr,
            0x4F => DropGblArr,

            0x50 => Call,
            0x51 => Retn,

            0x60 => BeginPrint,
            0x61 => PrintNumber,
            0x62 => PrintChar,
            0x63 => PrintString,
            0x64 => EndPrint,

            _ => return None,
        })
    }

    /// Encode the opcode as a bytecode Word
    pub fn to_word(self) -> Word {
        self as Word
    }

    /// Number of operand Words following the opcode
    pub fn operand_count(self) -> usize {
        use Opcode::*;
        match self {
            DelayImm | Push | Jump | JumpIf | JumpNot | PushLocalReg | DropLocalReg
            | PushModReg | DropModReg | PushHubReg | DropHubReg | PushGblReg | DropGblReg
            | PushLocalArr | DropLocalArr | PushModArr | DropModArr | PushHubArr
            | DropHubArr | PushGblArr | DropGblArr | Call => 1,
            _ => 0,
        }
    }
}

/// Engine-defined script kind, controlling when the host auto-starts it
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptType {
    /// Started only by explicit request
    Closed = 0,
    /// Started when the map begins, runs in the background
    Open = 1,
    /// Started when a player enters
    Enter = 2,
    /// Started when an actor dies
    Death = 3,
    /// Started when returning to a previously visited map
    Return = 4,
}

impl ScriptType {
    /// Decode a script type from a Word
    pub fn from_word(word: Word) -> Option<Self> {
        Some(match word {
            0 => ScriptType::Closed,
            1 => ScriptType::Open,
            2 => ScriptType::Enter,
            3 => ScriptType::Death,
            4 => ScriptType::Return,
            _ => return None,
        })
    }

    /// Encode the script type as a Word
    pub fn to_word(self) -> Word {
        self as Word
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip() {
        use Opcode::*;
        let all = [
            Nop, Kill, Terminate, Suspend, Delay, DelayImm, Yield, WaitScrI, WaitScrS,
            WaitTag, SetResult, Push, Drop, Dup, Swap, Add, Sub, Mul, Div, Mod, Neg,
            CmpEq, CmpNe, CmpLt, CmpLe, CmpGt, CmpGe, AndBit, OrBit, XorBit, NotLog,
            Jump, JumpIf, JumpNot, PushLocalReg, DropLocalReg, PushModReg, DropModReg,
            PushHubReg, DropHubReg, PushGblReg, DropGblReg, PushLocalArr, DropLocalArr,
            PushModArr, DropModArr, PushHubArr, DropHubArr, PushGblArr, DropGblArr,
            Call, Retn, BeginPrint, PrintNumber, PrintChar, PrintString, EndPrint,
        ];
        for opcode in all {
            assert_eq!(Opcode::from_word(opcode.to_word()), Some(opcode));
        }
    }

    #[test]
    fn test_invalid_opcodes() {
        assert_eq!(Opcode::from_word(0x0B), None);
        assert_eq!(Opcode::from_word(0x65), None);
        assert_eq!(Opcode::from_word(0xFFFF_FFFF), None);
    }

    #[test]
    fn test_operand_counts() {
        assert_eq!(Opcode::Push.operand_count(), 1);
        assert_eq!(Opcode::Call.operand_count(), 1);
        assert_eq!(Opcode::Add.operand_count(), 0);
        assert_eq!(Opcode::Terminate.operand_count(), 0);
    }

    #[test]
    fn test_script_type_roundtrip() {
        for ty in [
            ScriptType::Closed,
            ScriptType::Open,
            ScriptType::Enter,
            ScriptType::Death,
            ScriptType::Return,
        ] {
            assert_eq!(ScriptType::from_word(ty.to_word()), Some(ty));
        }
        assert_eq!(ScriptType::from_word(99), None);
    }
}
