use std::rc::Rc;

use fxhash::FxHashMap;
use indexmap::IndexMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::vm::opcode::{InstructionSlot, Opcode};

pub mod build;


/// The logical schema of a program image, as produced by an external
/// compiler. This is the serde-facing shape; `ProgramModel::new` validates it
/// and freezes it into the read-only form the interpreter consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramImage {
    pub strings_at_addresses: FxHashMap<u32, String>,
    pub contexts: Vec<Context>,
}

/// One compiled function. The context with an empty `name` is the top-level
/// script and the entry point of the whole image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub function_address: u32,
    pub name: String,
    pub arity: u8,
    pub upvalue_count: u16,
    pub first_instruction_address: u32,
    pub instruction_vals: FxHashMap<u32, InstructionSlot>,
    pub constant_vals: Vec<Constant>,
}

/// An entry of a function's constant pool. Strings and functions are held by
/// address into the image-level tables rather than inline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Number(f64),
    Bool(bool),
    StringRef(u32),
    FunctionRef(u32),
}

impl ProgramImage {

    pub fn from_ron(text: &str) -> Result<ProgramImage, String> {
        ron::from_str(text).map_err(|e| e.to_string())
    }

    pub fn to_ron(&self) -> Result<String, String> {
        ron::to_string(self).map_err(|e| e.to_string())
    }
}


#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    DuplicateFunctionAddress(u32),
    MissingEntryContext,
    DuplicateEntryContext(u32),
    /// (entry address, its declared arity)
    EntryContextTakesArguments(u32, u8),
    /// (function address, entry offset)
    MissingFirstInstruction(u32, u32),
    /// (function address, string address)
    DanglingStringRef(u32, u32),
    /// (function address, function address referred to)
    DanglingFunctionRef(u32, u32),
}

impl LoadError {
    fn err<T>(self) -> Result<T, LoadError> {
        Err(self)
    }
}


/// A single function of the loaded program, immutable after load.
///
/// Instructions are an ordered map from offset to slot. Offsets are totally
/// ordered but need not be contiguous or zero-based: sequential execution
/// advances to the next offset in the order, while jumps do plain integer
/// arithmetic on the offset value.
#[derive(Debug, Clone)]
pub struct Function {
    pub address: u32,
    pub name: String,
    pub arity: u8,
    pub upvalue_count: u16,
    pub first_instruction_address: u32,
    code: IndexMap<u32, InstructionSlot>,
    constants: Vec<Constant>,
}

impl Function {

    pub fn slot_at(&self, offset: u32) -> Option<InstructionSlot> {
        self.code.get(&offset).copied()
    }

    /// The offset following `offset` in the instruction order, if any.
    pub fn next_offset(&self, offset: u32) -> Option<u32> {
        let index: usize = self.code.get_index_of(&offset)?;
        self.code.get_index(index + 1).map(|(next, _)| *next)
    }

    pub fn constant(&self, index: u16) -> Option<Constant> {
        self.constants.get(index as usize).copied()
    }
}


/// The read-only program model: every table the interpreter reads during
/// execution. Created once by the loader, never mutated afterwards; multiple
/// VM instances may share it behind an immutable reference.
#[derive(Debug, Clone)]
pub struct ProgramModel {
    functions: FxHashMap<u32, Function>,
    strings: FxHashMap<u32, Rc<String>>,
    entry: u32,
}

impl ProgramModel {

    /// Validates and freezes `image`. The interpreter trusts (most of) the
    /// model, so every cross-reference is checked here: function addresses
    /// are unique, exactly one empty-named entry context exists and takes no
    /// arguments, each entry offset resolves, and every `StringRef` /
    /// `FunctionRef` in every constant pool points at a real table entry.
    pub fn new(image: ProgramImage) -> Result<ProgramModel, LoadError> {
        let strings: FxHashMap<u32, Rc<String>> = image.strings_at_addresses.into_iter()
            .map(|(address, string)| (address, Rc::new(string)))
            .collect();

        let mut functions: FxHashMap<u32, Function> = FxHashMap::default();
        let mut entry: Option<u32> = None;
        for context in image.contexts {
            let address: u32 = context.function_address;
            if context.name.is_empty() {
                if entry.replace(address).is_some() {
                    return LoadError::DuplicateEntryContext(address).err();
                }
                if context.arity != 0 {
                    return LoadError::EntryContextTakesArguments(address, context.arity).err();
                }
            }
            let code: IndexMap<u32, InstructionSlot> = context.instruction_vals.into_iter()
                .sorted_by_key(|(offset, _)| *offset)
                .collect();
            if !code.contains_key(&context.first_instruction_address) {
                return LoadError::MissingFirstInstruction(address, context.first_instruction_address).err();
            }
            let function: Function = Function {
                address,
                name: context.name,
                arity: context.arity,
                upvalue_count: context.upvalue_count,
                first_instruction_address: context.first_instruction_address,
                code,
                constants: context.constant_vals,
            };
            if functions.insert(address, function).is_some() {
                return LoadError::DuplicateFunctionAddress(address).err();
            }
        }

        let entry: u32 = match entry {
            Some(address) => address,
            None => return LoadError::MissingEntryContext.err(),
        };

        for function in functions.values() {
            for constant in &function.constants {
                match constant {
                    Constant::StringRef(address) if !strings.contains_key(address) => {
                        return LoadError::DanglingStringRef(function.address, *address).err()
                    },
                    Constant::FunctionRef(address) if !functions.contains_key(address) => {
                        return LoadError::DanglingFunctionRef(function.address, *address).err()
                    },
                    _ => {},
                }
            }
        }

        Ok(ProgramModel { functions, strings, entry })
    }

    /// The address of the top-level script function.
    pub fn entry(&self) -> u32 {
        self.entry
    }

    pub fn function_by_address(&self, address: u32) -> Option<&Function> {
        self.functions.get(&address)
    }

    pub fn string_by_address(&self, address: u32) -> Option<&Rc<String>> {
        self.strings.get(&address)
    }

    // ===== Disassembly ===== //

    /// Renders the whole program, one instruction per line, functions in
    /// address order. Purely a developer surface (the CLI's `-d` flag).
    pub fn disassemble(&self) -> Vec<String> {
        let mut lines: Vec<String> = Vec::new();
        for function in self.functions.values().sorted_by_key(|f| f.address) {
            lines.push(format!("=== {} ===", match function.name.as_str() {
                "" => String::from("<script>"),
                name => format!("<fn {}> ({} args)", name, function.arity),
            }));

            let mut index: usize = 0;
            while index < function.code.len() {
                let (offset, slot) = function.code.get_index(index)
                    .map(|(offset, slot)| (*offset, *slot))
                    .unwrap();
                index += 1;
                let op: Opcode = match slot.as_opcode() {
                    Some(op) => op,
                    None => {
                        lines.push(format!("{:04} ??({})", offset, slot.encoded()));
                        continue
                    },
                };

                let mut operands: Vec<u16> = Vec::new();
                let mut take = |index: &mut usize| -> u16 {
                    let value = function.code.get_index(*index).map_or(0, |(_, slot)| slot.encoded());
                    *index += 1;
                    value
                };
                for _ in 0..op.operand_slots() {
                    operands.push(take(&mut index));
                }
                if op == Opcode::Closure {
                    let tail: u16 = operands.first()
                        .and_then(|i| function.constant(*i))
                        .and_then(|c| match c {
                            Constant::FunctionRef(address) => self.functions.get(&address),
                            _ => None,
                        })
                        .map_or(0, |f| f.upvalue_count);
                    for _ in 0..2 * tail {
                        operands.push(take(&mut index));
                    }
                }

                // the ip an executed jump would be relative to
                let after: u32 = function.code.get_index(index)
                    .map_or(offset + 1 + op.operand_slots() as u32, |(next, _)| *next);
                lines.push(format!("{:04} {}", offset, self.render(function, op, &operands, after)));
            }
        }
        lines
    }

    fn render(&self, function: &Function, op: Opcode, operands: &[u16], after: u32) -> String {
        match op {
            Opcode::Constant
            | Opcode::GetGlobal | Opcode::DefineGlobal | Opcode::SetGlobal
            | Opcode::GetProperty | Opcode::SetProperty | Opcode::GetSuper
            | Opcode::Class | Opcode::Method => {
                format!("{:?} -> {}", op, self.render_constant(function, operands[0]))
            },
            Opcode::GetLocal | Opcode::SetLocal
            | Opcode::GetUpValue | Opcode::SetUpValue
            | Opcode::Call => format!("{:?}({})", op, operands[0]),
            Opcode::Jump | Opcode::JumpIfFalse => {
                format!("{:?} -> {:04}", op, after + short(operands))
            },
            Opcode::Loop => format!("{:?} -> {:04}", op, after.saturating_sub(short(operands))),
            Opcode::Invoke | Opcode::SuperInvoke => {
                format!("{:?} -> {} ({} args)", op, self.render_constant(function, operands[0]), operands[1])
            },
            Opcode::Closure => {
                let upvalues: String = operands[1..].iter().copied().tuples()
                    .map(|(is_local, index)| match is_local {
                        0 => format!("upvalue {}", index),
                        _ => format!("local {}", index),
                    })
                    .join(", ");
                format!("{:?} -> {} [{}]", op, self.render_constant(function, operands[0]), upvalues)
            },
            _ => format!("{:?}", op),
        }
    }

    fn render_constant(&self, function: &Function, index: u16) -> String {
        match function.constant(index) {
            Some(Constant::Number(n)) => n.to_string(),
            Some(Constant::Bool(b)) => b.to_string(),
            Some(Constant::StringRef(address)) => match self.strings.get(&address) {
                Some(string) => format!("'{}'", string),
                None => format!("str({})", address),
            },
            Some(Constant::FunctionRef(address)) => match self.functions.get(&address) {
                Some(f) => format!("<fn {}>", f.name),
                None => format!("fn({})", address),
            },
            None => format!("const({})", index),
        }
    }
}

fn short(operands: &[u16]) -> u32 {
    (((operands[0] << 8) | operands[1]) & 0xffff) as u32
}
