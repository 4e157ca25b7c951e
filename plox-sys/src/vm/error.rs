use crate::vm::value::Value;

pub type ErrorResult<T> = Result<T, Box<RuntimeError>>;
pub type AnyResult = ErrorResult<()>;

/// Every way execution can fail. All of these are terminal for the current
/// invocation: the language has no user-level exception mechanism, so the
/// dispatch loop surfaces the error once through the reporter and halts.
///
/// The `Value` payloads are not part of the user-facing message (see
/// `reporting`); they exist for tracing and tests.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeError {
    TypeErrorOperandMustBeNumber(Value),
    TypeErrorOperandsMustBeNumbers(Value, Value),
    TypeErrorOperandsMustBeNumbersOrStrings(Value, Value),
    TypeErrorNotCallable(Value),
    TypeErrorOnlyInstancesHaveFields(Value),
    TypeErrorOnlyInstancesHaveMethods(Value),
    TypeErrorSuperclassMustBeClass(Value),

    UndefinedVariable(String),
    UndefinedProperty(String),

    /// (arity of the callee, argument count at the call site)
    IncorrectNumberOfArguments(u8, u8),

    CallStackOverflow,

    // Malformed-image family: the program model referenced something that
    // does not exist. A correct loader never lets these through, but the
    // loop fails loudly rather than trusting the image.
    UnknownFunction(u32),
    UnknownString(u32),
    InvalidOpcode(u16),
    /// (function address, offset)
    InstructionOffsetOutOfBounds(u32, u32),
    /// (function address, constant index)
    InvalidConstantIndex(u32, u16),
    /// (function address, constant index)
    InvalidConstantKind(u32, u16),
    InvalidStackSlot(usize),
    InvalidUpValueIndex(usize),
    /// What the instruction expected to find on the stack and did not.
    InvalidStackValue(&'static str),
}

impl RuntimeError {
    pub fn err<T>(self) -> ErrorResult<T> {
        Err(Box::new(self))
    }
}
