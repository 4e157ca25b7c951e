use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

/// The complete instruction set. Every opcode has a stable single-byte
/// encoding, which is what `InstructionSlot::encoded` exposes and what
/// program images refer to.
///
/// Operands are not part of the opcode: an instruction with operands is
/// followed by one `InstructionSlot` per operand in the instruction sequence.
#[repr(u8)]
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash, Serialize, Deserialize, IntoPrimitive, TryFromPrimitive)]
pub enum Opcode {
    Constant,

    // Literals
    Nil,
    True,
    False,

    Pop,

    // Variable access. Each takes one operand: a local slot, a constant index
    // naming a global, or an upvalue slot.
    GetLocal,
    SetLocal,
    GetGlobal,
    DefineGlobal,
    SetGlobal,
    GetUpValue,
    SetUpValue,

    // Property and method access. One name-constant operand each.
    GetProperty,
    SetProperty,
    GetSuper,

    // Binary operators, popping two and pushing one.
    Equal,
    Greater,
    Less,
    Add,
    Subtract,
    Multiply,
    Divide,

    // Unary operators.
    Not,
    Negate,

    Print,

    /// The jump operand is a two-slot short, applied to the ip *after* both
    /// operand slots have been read. So `Jump` with an offset of 0 is a no-op,
    /// and `Loop` with an offset of 3 re-executes the `Loop` itself.
    Jump,
    JumpIfFalse,
    Loop,

    // Calls. `Call` takes an argument count; `Invoke`/`SuperInvoke` take a
    // method-name constant followed by an argument count.
    Call,
    Invoke,
    SuperInvoke,

    /// Takes a function constant, then two operand slots `(is_local, index)`
    /// per upvalue of that function.
    Closure,

    // Class machinery.
    Class,
    Inherit,
    Method,

    Return,
}

impl Opcode {

    /// The number of fixed operand slots following this opcode. `Closure` has
    /// a variable tail (two slots per upvalue of the referenced function)
    /// beyond the one counted here.
    pub fn operand_slots(self) -> usize {
        match self {
            Opcode::Constant
            | Opcode::GetLocal | Opcode::SetLocal
            | Opcode::GetGlobal | Opcode::DefineGlobal | Opcode::SetGlobal
            | Opcode::GetUpValue | Opcode::SetUpValue
            | Opcode::GetProperty | Opcode::SetProperty | Opcode::GetSuper
            | Opcode::Call
            | Opcode::Closure
            | Opcode::Class | Opcode::Method => 1,
            Opcode::Jump | Opcode::JumpIfFalse | Opcode::Loop => 2,
            Opcode::Invoke | Opcode::SuperInvoke => 2,
            _ => 0,
        }
    }
}


/// One slot of a function's instruction sequence: either an opcode or a raw
/// operand. Readers tolerate either shape in any position — an opcode read
/// decodes an `Operand` through its low byte, and an operand read takes an
/// `Op`'s encoded byte as the integer.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Serialize, Deserialize)]
pub enum InstructionSlot {
    Op(Opcode),
    Operand(u16),
}

impl InstructionSlot {

    /// Decodes this slot as an opcode, if it is one.
    pub fn as_opcode(self) -> Option<Opcode> {
        match self {
            InstructionSlot::Op(op) => Some(op),
            InstructionSlot::Operand(value) => u8::try_from(value).ok()
                .and_then(|byte| Opcode::try_from(byte).ok()),
        }
    }

    /// The integer this slot encodes when read as an operand.
    pub fn encoded(self) -> u16 {
        match self {
            InstructionSlot::Op(op) => u8::from(op) as u16,
            InstructionSlot::Operand(value) => value,
        }
    }
}


#[cfg(test)]
mod test {
    use crate::vm::opcode::{InstructionSlot, Opcode};

    #[test] fn test_opcode_layout() { assert_eq!(1, std::mem::size_of::<Opcode>()); }
    #[test] fn test_slot_layout() { assert_eq!(4, std::mem::size_of::<InstructionSlot>()); }

    #[test]
    fn test_opcode_byte_round_trip() {
        for byte in 0..=u8::MAX {
            if let Ok(op) = Opcode::try_from(byte) {
                assert_eq!(byte, u8::from(op));
            }
        }
        assert_eq!(Ok(Opcode::Constant), Opcode::try_from(0));
        assert_eq!(Ok(Opcode::Return), Opcode::try_from(u8::from(Opcode::Return)));
        assert!(Opcode::try_from(200).is_err());
    }

    #[test]
    fn test_slot_as_opcode_tolerates_operands() {
        let encoded: u16 = u8::from(Opcode::Print) as u16;
        assert_eq!(Some(Opcode::Print), InstructionSlot::Operand(encoded).as_opcode());
        assert_eq!(Some(Opcode::Nil), InstructionSlot::Op(Opcode::Nil).as_opcode());
        assert_eq!(None, InstructionSlot::Operand(200).as_opcode());
        assert_eq!(None, InstructionSlot::Operand(0x1234).as_opcode());
    }

    #[test]
    fn test_slot_encoded_tolerates_opcodes() {
        assert_eq!(7, InstructionSlot::Operand(7).encoded());
        assert_eq!(u8::from(Opcode::Nil) as u16, InstructionSlot::Op(Opcode::Nil).encoded());
    }
}
