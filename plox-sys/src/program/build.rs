use indexmap::IndexMap;

use crate::program::{Constant, Context, ProgramImage};
use crate::vm::opcode::{InstructionSlot, Opcode};


/// Assembles `ProgramImage`s programmatically, for anything that wants to
/// produce images without a compiler in front: unit tests, benchmarks, and
/// external tooling. Strings are interned image-wide; function addresses are
/// assigned on creation so forward and self references work.
///
/// Instruction offsets are emitted contiguously from zero and the entry
/// offset is always zero; the model reader accepts far more general images,
/// this builder just never needs to produce them.
pub struct ImageBuilder {
    strings: IndexMap<String, u32>,
    contexts: Vec<Context>,
    next_function: u32,
}

impl ImageBuilder {

    pub fn new() -> ImageBuilder {
        ImageBuilder { strings: IndexMap::new(), contexts: Vec::new(), next_function: 1 }
    }

    /// Interns `value` and returns its string address.
    pub fn string(&mut self, value: &str) -> u32 {
        if let Some(address) = self.strings.get(value) {
            return *address;
        }
        let address: u32 = self.strings.len() as u32 + 1;
        self.strings.insert(String::from(value), address);
        address
    }

    /// Starts a new function. The returned builder is standalone; hand it
    /// back to `define` once its body is complete.
    pub fn function(&mut self, name: &str, arity: u8, upvalue_count: u16) -> FunctionBuilder {
        let address: u32 = self.next_function;
        self.next_function += 1;
        FunctionBuilder {
            address,
            name: String::from(name),
            arity,
            upvalue_count,
            code: Vec::new(),
            constants: Vec::new(),
        }
    }

    pub fn define(&mut self, function: FunctionBuilder) -> u32 {
        let address: u32 = function.address;
        self.contexts.push(function.into_context());
        address
    }

    pub fn build(self) -> ProgramImage {
        ProgramImage {
            strings_at_addresses: self.strings.into_iter()
                .map(|(string, address)| (address, string))
                .collect(),
            contexts: self.contexts,
        }
    }
}

impl Default for ImageBuilder {
    fn default() -> ImageBuilder {
        ImageBuilder::new()
    }
}


pub struct FunctionBuilder {
    address: u32,
    name: String,
    arity: u8,
    upvalue_count: u16,
    code: Vec<InstructionSlot>,
    constants: Vec<Constant>,
}

impl FunctionBuilder {

    pub fn address(&self) -> u32 {
        self.address
    }

    /// The offset the next emitted slot will occupy.
    pub fn here(&self) -> u32 {
        self.code.len() as u32
    }

    pub fn op(&mut self, opcode: Opcode) -> &mut Self {
        self.code.push(InstructionSlot::Op(opcode));
        self
    }

    pub fn operand(&mut self, value: u16) -> &mut Self {
        self.code.push(InstructionSlot::Operand(value));
        self
    }

    /// Emits a raw slot verbatim, for images that exercise the tolerant slot
    /// decoding (an opcode written as `Operand`, or vice versa).
    pub fn raw(&mut self, slot: InstructionSlot) -> &mut Self {
        self.code.push(slot);
        self
    }

    /// Adds `constant` to the pool (or reuses an existing identical entry)
    /// and returns its index.
    pub fn constant(&mut self, constant: Constant) -> u16 {
        if let Some(index) = self.constants.iter().position(|c| *c == constant) {
            return index as u16;
        }
        self.constants.push(constant);
        (self.constants.len() - 1) as u16
    }

    // ===== Shorthands ===== //

    /// `Constant` loading a number.
    pub fn load_number(&mut self, value: f64) -> &mut Self {
        let index: u16 = self.constant(Constant::Number(value));
        self.op(Opcode::Constant).operand(index)
    }

    /// `Constant` loading a string, interned on `image`.
    pub fn load_str(&mut self, image: &mut ImageBuilder, value: &str) -> &mut Self {
        let index: u16 = self.string_const(image, value);
        self.op(Opcode::Constant).operand(index)
    }

    /// A string constant index without emitting anything, for name operands
    /// of `DefineGlobal`, `GetProperty`, `Method` and friends.
    pub fn name_const(&mut self, image: &mut ImageBuilder, name: &str) -> u16 {
        self.string_const(image, name)
    }

    fn string_const(&mut self, image: &mut ImageBuilder, value: &str) -> u16 {
        let address: u32 = image.string(value);
        self.constant(Constant::StringRef(address))
    }

    /// Emits a forward jump with placeholder operands; returns the offset of
    /// the first operand slot for `patch_jump`.
    pub fn emit_jump(&mut self, opcode: Opcode) -> u32 {
        self.op(opcode);
        let at: u32 = self.here();
        self.operand(0).operand(0);
        at
    }

    /// Points the jump emitted at `at` to the current position.
    pub fn patch_jump(&mut self, at: u32) {
        let offset: u32 = self.here() - (at + 2);
        self.code[at as usize] = InstructionSlot::Operand(((offset >> 8) & 0xff) as u16);
        self.code[at as usize + 1] = InstructionSlot::Operand((offset & 0xff) as u16);
    }

    /// Emits a `Loop` jumping back to `target` (usually a saved `here()`).
    pub fn loop_to(&mut self, target: u32) -> &mut Self {
        self.op(Opcode::Loop);
        let offset: u32 = self.here() + 2 - target;
        self.operand(((offset >> 8) & 0xff) as u16).operand((offset & 0xff) as u16)
    }

    fn into_context(self) -> Context {
        Context {
            function_address: self.address,
            name: self.name,
            arity: self.arity,
            upvalue_count: self.upvalue_count,
            first_instruction_address: 0,
            instruction_vals: self.code.into_iter()
                .enumerate()
                .map(|(offset, slot)| (offset as u32, slot))
                .collect(),
            constant_vals: self.constants,
        }
    }
}


#[cfg(test)]
mod test {
    use crate::program::build::ImageBuilder;
    use crate::program::Constant;
    use crate::vm::opcode::InstructionSlot::{Op, Operand};
    use crate::vm::opcode::Opcode::{*};

    #[test]
    fn test_strings_are_interned() {
        let mut image = ImageBuilder::new();
        let a = image.string("hello");
        let b = image.string("world");
        let c = image.string("hello");
        assert_eq!(a, c);
        assert_ne!(a, b);

        let built = image.build();
        assert_eq!(2, built.strings_at_addresses.len());
        assert_eq!(Some(&String::from("hello")), built.strings_at_addresses.get(&a));
    }

    #[test]
    fn test_constants_are_deduplicated() {
        let mut image = ImageBuilder::new();
        let mut script = image.function("", 0, 0);
        let a = script.constant(Constant::Number(1.0));
        let b = script.constant(Constant::Number(2.0));
        let c = script.constant(Constant::Number(1.0));
        assert_eq!(a, c);
        assert_ne!(a, b);
    }

    #[test]
    fn test_patch_jump() {
        let mut image = ImageBuilder::new();
        let mut script = image.function("", 0, 0);
        script.op(False);
        let jump = script.emit_jump(JumpIfFalse);      // operands at offsets 2, 3
        script.op(Pop);
        script.op(Nil);
        script.patch_jump(jump);                       // lands at offset 6
        script.op(Return);
        image.define(script);

        let context = &image.build().contexts[0];
        // ip after the operands is 4, so the encoded offset is 6 - 4 = 2
        assert_eq!(Some(&Operand(0)), context.instruction_vals.get(&2));
        assert_eq!(Some(&Operand(2)), context.instruction_vals.get(&3));
    }

    #[test]
    fn test_loop_to() {
        let mut image = ImageBuilder::new();
        let mut script = image.function("", 0, 0);
        let start = script.here();
        script.op(Nil).op(Pop);
        script.loop_to(start);
        script.op(Return);
        image.define(script);

        let context = &image.build().contexts[0];
        // Loop at offset 2; ip after its operands is 5, and 5 - 5 = 0 = start
        assert_eq!(Some(&Op(Loop)), context.instruction_vals.get(&2));
        assert_eq!(Some(&Operand(0)), context.instruction_vals.get(&3));
        assert_eq!(Some(&Operand(5)), context.instruction_vals.get(&4));
    }

    #[test]
    fn test_addresses_are_distinct() {
        let mut image = ImageBuilder::new();
        let f = image.function("f", 0, 0);
        let g = image.function("g", 1, 0);
        assert_ne!(f.address(), g.address());
    }
}
