use itertools::Itertools;

use crate::program::LoadError;
use crate::vm::error::RuntimeError;

/// Renders the terminal runtime diagnostic: a header line with the message,
/// then one line per in-progress frame from innermost to outermost. A frame
/// is shown as `name()`, or the literal `script` for the unnamed top level.
///
/// `frames` supplies the function names innermost first; the VM produces it
/// from its (still intact) call stack at the point of failure.
pub fn format_runtime_error<'a>(error: &RuntimeError, frames: impl Iterator<Item = &'a str>) -> String {
    let header: String = format!("[error: {}] in script", error.as_error());
    let walk = frames.map(|name| match name {
        "" => String::from("script"),
        name => format!("{}()", name),
    });
    std::iter::once(header).chain(walk).join("\n")
}


pub trait AsError {
    fn as_error(&self) -> String;
}

impl AsError for RuntimeError {
    fn as_error(&self) -> String {
        match self {
            RuntimeError::TypeErrorOperandMustBeNumber(_) => String::from("Operand must be a number."),
            RuntimeError::TypeErrorOperandsMustBeNumbers(_, _) => String::from("Operands must be numbers."),
            RuntimeError::TypeErrorOperandsMustBeNumbersOrStrings(_, _) => String::from("Operands must be two numbers or two strings."),
            RuntimeError::TypeErrorNotCallable(_) => String::from("Can only call functions and classes."),
            RuntimeError::TypeErrorOnlyInstancesHaveFields(_) => String::from("Only instances have fields."),
            RuntimeError::TypeErrorOnlyInstancesHaveMethods(_) => String::from("Only instances have methods."),
            RuntimeError::TypeErrorSuperclassMustBeClass(_) => String::from("Superclass must be a class."),
            RuntimeError::UndefinedVariable(name) => format!("Undefined variable '{}'.", name),
            RuntimeError::UndefinedProperty(name) => format!("Undefined property '{}'.", name),
            RuntimeError::IncorrectNumberOfArguments(arity, argc) => format!("Expected {} arguments but got {}.", arity, argc),
            RuntimeError::CallStackOverflow => String::from("Stack overflow."),
            RuntimeError::UnknownFunction(address) => format!("Malformed program: no function at address {}.", address),
            RuntimeError::UnknownString(address) => format!("Malformed program: no string at address {}.", address),
            RuntimeError::InvalidOpcode(value) => format!("Malformed program: {} is not an opcode.", value),
            RuntimeError::InstructionOffsetOutOfBounds(function, offset) => format!("Malformed program: function {} has no instruction at offset {}.", function, offset),
            RuntimeError::InvalidConstantIndex(function, index) => format!("Malformed program: function {} has no constant {}.", function, index),
            RuntimeError::InvalidConstantKind(function, index) => format!("Malformed program: constant {} of function {} has the wrong kind.", index, function),
            RuntimeError::InvalidStackSlot(slot) => format!("Malformed program: stack slot {} is out of range.", slot),
            RuntimeError::InvalidUpValueIndex(index) => format!("Malformed program: upvalue {} is out of range.", index),
            RuntimeError::InvalidStackValue(expected) => format!("Malformed program: expected a {} on the stack.", expected),
        }
    }
}

impl AsError for LoadError {
    fn as_error(&self) -> String {
        match self {
            LoadError::DuplicateFunctionAddress(address) => format!("Malformed image: two contexts share the address {}.", address),
            LoadError::MissingEntryContext => String::from("Malformed image: no entry context (a context with an empty name)."),
            LoadError::DuplicateEntryContext(address) => format!("Malformed image: more than one entry context (second at address {}).", address),
            LoadError::EntryContextTakesArguments(address, arity) => format!("Malformed image: the entry context at address {} declares {} parameters.", address, arity),
            LoadError::MissingFirstInstruction(function, offset) => format!("Malformed image: context {} has no instruction at its entry offset {}.", function, offset),
            LoadError::DanglingStringRef(function, address) => format!("Malformed image: context {} refers to the unknown string address {}.", function, address),
            LoadError::DanglingFunctionRef(function, address) => format!("Malformed image: context {} refers to the unknown function address {}.", function, address),
        }
    }
}
