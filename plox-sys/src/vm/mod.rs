use std::io::Write;
use std::rc::Rc;

use fxhash::FxHashMap;

use crate::core::NativeFunction;
use crate::program::{self, Function, ProgramModel};
use crate::reporting;
use crate::trace;
use crate::vm::error::{AnyResult, ErrorResult, RuntimeError};
use crate::vm::opcode::{InstructionSlot, Opcode};
use crate::vm::value::{BoundMethod, Class, Closure, Instance, Value};

use Opcode::{*};
use RuntimeError::{*};

pub mod error;
pub mod opcode;
pub mod operator;
pub mod value;


/// Hard bound on the number of in-progress call frames. Exceeding it is a
/// terminal error, not a growable condition, so runaway recursion cannot
/// exhaust the host stack of whatever embeds the VM.
pub const CALL_STACK_MAX: usize = 100;


#[derive(Debug)]
pub enum ExitType {
    /// The top-level script returned.
    Exit,
    /// A runtime error halted execution. The VM's call stack is left intact
    /// for `format_error`.
    Error(Box<RuntimeError>),
}


/// One in-progress invocation. `slot_offset` is the operand-stack index of
/// the callee itself; locals of the frame live at `slot_offset + i`, so the
/// executing closure is always local slot 0 (or the receiver, for methods).
struct CallFrame {
    closure: Rc<Closure>,
    ip: u32,
    slot_offset: usize,
}


pub struct VirtualMachine<W> {
    stack: Vec<Value>,
    call_stack: Vec<CallFrame>,
    globals: FxHashMap<String, Value>,
    program: ProgramModel,
    write: W,
}


impl<W> VirtualMachine<W> where W: Write {

    pub fn new(program: ProgramModel, write: W) -> VirtualMachine<W> {
        let mut globals: FxHashMap<String, Value> = FxHashMap::default();
        for native in NativeFunction::all() {
            globals.insert(String::from(native.name()), Value::NativeFunction(native));
        }
        VirtualMachine {
            stack: Vec::new(),
            call_stack: Vec::new(),
            globals,
            program,
            write,
        }
    }

    pub fn program(&self) -> &ProgramModel {
        &self.program
    }

    pub fn run_until_completion(&mut self) -> ExitType {
        match self.run() {
            Ok(()) => ExitType::Exit,
            Err(error) => ExitType::Error(error),
        }
    }

    /// Renders `error` as the user-facing report, walking the (still intact)
    /// call stack from the innermost frame outwards.
    pub fn format_error(&self, error: &RuntimeError) -> String {
        let frames = self.call_stack.iter().rev()
            .map(|frame| self.program.function_by_address(frame.closure.function)
                .map_or("", |function| function.name.as_str()));
        reporting::format_runtime_error(error, frames)
    }

    fn run(&mut self) -> AnyResult {
        if self.call_stack.is_empty() {
            self.bootstrap()?;
        }
        loop {
            let op: Opcode = self.read_opcode()?;
            match op {
                Constant => {
                    let constant: program::Constant = self.read_constant()?;
                    let value: Value = self.constant_value(constant)?;
                    trace::trace_interpreter!("push constant {:?}", value);
                    self.push(value);
                },
                Nil => {
                    trace::trace_interpreter!("push nil");
                    self.push(Value::Nil);
                },
                True => {
                    trace::trace_interpreter!("push true");
                    self.push(Value::Bool(true));
                },
                False => {
                    trace::trace_interpreter!("push false");
                    self.push(Value::Bool(false));
                },
                Pop => {
                    trace::trace_interpreter!("stack pop");
                    self.pop();
                },

                GetLocal => {
                    let slot: usize = self.read_operand()? as usize;
                    let index: usize = self.frame().slot_offset + slot;
                    trace::trace_interpreter!("get local {}", slot);
                    let value: Value = match self.stack.get(index) {
                        Some(value) => value.clone(),
                        None => return InvalidStackSlot(index).err(),
                    };
                    self.push(value);
                },
                SetLocal => {
                    let slot: usize = self.read_operand()? as usize;
                    let index: usize = self.frame().slot_offset + slot;
                    trace::trace_interpreter!("set local {}", slot);
                    let value: Value = self.peek(0).clone();
                    match self.stack.get_mut(index) {
                        Some(entry) => *entry = value,
                        None => return InvalidStackSlot(index).err(),
                    }
                },

                GetGlobal => {
                    let name: Rc<String> = self.read_string_constant()?;
                    trace::trace_interpreter!("get global '{}'", name);
                    let value: Value = match self.globals.get(name.as_str()) {
                        Some(value) => value.clone(),
                        None => return UndefinedVariable((*name).clone()).err(),
                    };
                    self.push(value);
                },
                DefineGlobal => {
                    let name: Rc<String> = self.read_string_constant()?;
                    trace::trace_interpreter!("define global '{}'", name);
                    let value: Value = self.peek(0).clone();
                    self.globals.insert((*name).clone(), value);
                    self.pop();
                },
                SetGlobal => {
                    let name: Rc<String> = self.read_string_constant()?;
                    trace::trace_interpreter!("set global '{}'", name);
                    if !self.globals.contains_key(name.as_str()) {
                        return UndefinedVariable((*name).clone()).err();
                    }
                    // assignment is an expression: the value stays on the stack
                    let value: Value = self.peek(0).clone();
                    self.globals.insert((*name).clone(), value);
                },

                GetUpValue => {
                    let slot: usize = self.read_operand()? as usize;
                    trace::trace_interpreter!("get upvalue {}", slot);
                    let closure: Rc<Closure> = self.frame().closure.clone();
                    let value: Value = match closure.upvalues.borrow().get(slot) {
                        Some(value) => value.clone(),
                        None => return InvalidUpValueIndex(slot).err(),
                    };
                    self.push(value);
                },
                SetUpValue => {
                    let slot: usize = self.read_operand()? as usize;
                    trace::trace_interpreter!("set upvalue {}", slot);
                    let value: Value = self.peek(0).clone();
                    let closure: Rc<Closure> = self.frame().closure.clone();
                    let mut upvalues = closure.upvalues.borrow_mut();
                    match upvalues.get_mut(slot) {
                        Some(entry) => *entry = value,
                        None => return InvalidUpValueIndex(slot).err(),
                    }
                },

                GetProperty => {
                    let name: Rc<String> = self.read_string_constant()?;
                    trace::trace_interpreter!("get property '{}'", name);
                    let instance: Rc<Instance> = match self.peek(0) {
                        Value::Instance(instance) => instance.clone(),
                        v => return TypeErrorOnlyInstancesHaveFields(v.clone()).err(),
                    };
                    match instance.field(name.as_str()) {
                        Some(value) => {
                            self.pop();
                            self.push(value);
                        },
                        None => self.bind_method(instance.class.clone(), name.as_str())?,
                    }
                },
                SetProperty => {
                    let name: Rc<String> = self.read_string_constant()?;
                    trace::trace_interpreter!("set property '{}'", name);
                    let instance: Rc<Instance> = match self.peek(1) {
                        Value::Instance(instance) => instance.clone(),
                        v => return TypeErrorOnlyInstancesHaveFields(v.clone()).err(),
                    };
                    let value: Value = self.pop();
                    instance.fields.borrow_mut().insert((*name).clone(), value.clone());
                    self.pop();
                    // assignment is an expression: the stored value replaces both
                    self.push(value);
                },
                GetSuper => {
                    let name: Rc<String> = self.read_string_constant()?;
                    trace::trace_interpreter!("get super '{}'", name);
                    let superclass: Rc<Class> = match self.pop() {
                        Value::Class(class) => class,
                        v => return TypeErrorSuperclassMustBeClass(v).err(),
                    };
                    self.bind_method(superclass, name.as_str())?;
                },

                Equal => {
                    trace::trace_interpreter!("op binary ==");
                    let a2: Value = self.pop();
                    let a1: Value = self.pop();
                    let result: Value = operator::binary_equals(a1, a2)?;
                    self.push(result);
                },
                Greater => {
                    trace::trace_interpreter!("op binary >");
                    let a2: Value = self.pop();
                    let a1: Value = self.pop();
                    let result: Value = operator::binary_greater(a1, a2)?;
                    self.push(result);
                },
                Less => {
                    trace::trace_interpreter!("op binary <");
                    let a2: Value = self.pop();
                    let a1: Value = self.pop();
                    let result: Value = operator::binary_less(a1, a2)?;
                    self.push(result);
                },
                Add => {
                    trace::trace_interpreter!("op binary +");
                    let a2: Value = self.pop();
                    let a1: Value = self.pop();
                    let result: Value = operator::binary_add(a1, a2)?;
                    self.push(result);
                },
                Subtract => {
                    trace::trace_interpreter!("op binary -");
                    let a2: Value = self.pop();
                    let a1: Value = self.pop();
                    let result: Value = operator::binary_subtract(a1, a2)?;
                    self.push(result);
                },
                Multiply => {
                    trace::trace_interpreter!("op binary *");
                    let a2: Value = self.pop();
                    let a1: Value = self.pop();
                    let result: Value = operator::binary_multiply(a1, a2)?;
                    self.push(result);
                },
                Divide => {
                    trace::trace_interpreter!("op binary /");
                    let a2: Value = self.pop();
                    let a1: Value = self.pop();
                    let result: Value = operator::binary_divide(a1, a2)?;
                    self.push(result);
                },
                Not => {
                    trace::trace_interpreter!("op unary !");
                    let a1: Value = self.pop();
                    self.push(Value::Bool(a1.is_falsey()));
                },
                Negate => {
                    trace::trace_interpreter!("op unary -");
                    let a1: Value = self.pop();
                    let result: Value = operator::unary_negate(a1)?;
                    self.push(result);
                },

                Print => {
                    let value: Value = self.pop();
                    let text: String = value.as_display_str(&self.program);
                    self.println(text);
                },

                Jump => {
                    let offset: u16 = self.read_short()?;
                    trace::trace_interpreter!("jump +{}", offset);
                    self.frame_mut().ip += offset as u32;
                },
                JumpIfFalse => {
                    let offset: u16 = self.read_short()?;
                    trace::trace_interpreter!("jump if false +{}", offset);
                    // only peeks: the condition stays for the emitting code to pop
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset as u32;
                    }
                },
                Loop => {
                    let offset: u16 = self.read_short()?;
                    trace::trace_interpreter!("loop -{}", offset);
                    let frame: &mut CallFrame = self.frame_mut();
                    frame.ip = match frame.ip.checked_sub(offset as u32) {
                        Some(ip) => ip,
                        None => return InstructionOffsetOutOfBounds(frame.closure.function, frame.ip).err(),
                    };
                },

                Call => {
                    let argc: u8 = self.read_operand()? as u8;
                    trace::trace_interpreter!("call ({} args)", argc);
                    let callee: Value = self.peek(argc as usize).clone();
                    self.call_value(callee, argc)?;
                },
                Invoke => {
                    let name: Rc<String> = self.read_string_constant()?;
                    let argc: u8 = self.read_operand()? as u8;
                    trace::trace_interpreter!("invoke '{}' ({} args)", name, argc);
                    self.invoke(name, argc)?;
                },
                SuperInvoke => {
                    let name: Rc<String> = self.read_string_constant()?;
                    let argc: u8 = self.read_operand()? as u8;
                    trace::trace_interpreter!("super invoke '{}' ({} args)", name, argc);
                    let superclass: Rc<Class> = match self.pop() {
                        Value::Class(class) => class,
                        v => return TypeErrorSuperclassMustBeClass(v).err(),
                    };
                    self.invoke_from_class(superclass, name.as_str(), argc)?;
                },

                Closure => self.op_closure()?,

                Class => {
                    let name: Rc<String> = self.read_string_constant()?;
                    trace::trace_interpreter!("class '{}'", name);
                    self.push(Value::Class(Rc::new(value::Class::new(name))));
                },
                Inherit => {
                    trace::trace_interpreter!("inherit");
                    let superclass: Rc<Class> = match self.peek(1) {
                        Value::Class(class) => class.clone(),
                        v => return TypeErrorSuperclassMustBeClass(v.clone()).err(),
                    };
                    let subclass: Rc<Class> = match self.peek(0) {
                        Value::Class(class) => class.clone(),
                        _ => return InvalidStackValue("class").err(),
                    };
                    // a snapshot of the method table, not a live link: handles are
                    // copied, and later changes to the superclass are not seen
                    let methods = superclass.methods.borrow().clone();
                    subclass.methods.borrow_mut().extend(methods);
                    self.pop();
                },
                Method => {
                    let name: Rc<String> = self.read_string_constant()?;
                    trace::trace_interpreter!("method '{}'", name);
                    let method: Rc<Closure> = match self.peek(0) {
                        Value::Closure(closure) => closure.clone(),
                        _ => return InvalidStackValue("closure").err(),
                    };
                    let class: Rc<Class> = match self.peek(1) {
                        Value::Class(class) => class.clone(),
                        _ => return InvalidStackValue("class").err(),
                    };
                    class.methods.borrow_mut().insert((*name).clone(), method);
                    self.pop();
                },

                Return => {
                    let result: Value = self.pop();
                    let frame: CallFrame = self.call_stack.pop().unwrap();
                    trace::trace_interpreter!("return {:?}", result);
                    if self.call_stack.is_empty() {
                        // the last remaining slot holds the script closure
                        self.pop();
                        break
                    }
                    self.stack.truncate(frame.slot_offset);
                    self.push(result);
                },
            }
        }
        Ok(())
    }

    /// Wraps the entry function in a zero-upvalue closure and calls it, so
    /// the callee-at-`slot_offset` convention holds for the script frame too.
    fn bootstrap(&mut self) -> AnyResult {
        let closure: Rc<Closure> = Rc::new(Closure::new(self.program.entry()));
        self.push(Value::Closure(closure.clone()));
        self.call(closure, 0)
    }

    // ===== Instruction Reads ===== //

    fn frame(&self) -> &CallFrame {
        self.call_stack.last().unwrap()
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.call_stack.last_mut().unwrap()
    }

    /// Reads the slot at the current ip, then advances the ip to the next
    /// offset in the instruction order.
    fn read_slot(&mut self) -> ErrorResult<InstructionSlot> {
        let function_address: u32 = self.frame().closure.function;
        let ip: u32 = self.frame().ip;
        let function: &Function = self.program.function_by_address(function_address).unwrap();
        let slot: InstructionSlot = match function.slot_at(ip) {
            Some(slot) => slot,
            None => return InstructionOffsetOutOfBounds(function_address, ip).err(),
        };
        // past the last instruction there is no successor; any further read
        // reports out-of-bounds at the synthesized offset
        let next: u32 = function.next_offset(ip).unwrap_or(ip + 1);
        self.frame_mut().ip = next;
        Ok(slot)
    }

    fn read_opcode(&mut self) -> ErrorResult<Opcode> {
        let slot: InstructionSlot = self.read_slot()?;
        match slot.as_opcode() {
            Some(op) => Ok(op),
            None => InvalidOpcode(slot.encoded()).err(),
        }
    }

    fn read_operand(&mut self) -> ErrorResult<u16> {
        Ok(self.read_slot()?.encoded())
    }

    /// Consumes two slots and forms `(hi << 8) | lo`, accepting either slot
    /// shape for either half.
    fn read_short(&mut self) -> ErrorResult<u16> {
        let hi: u16 = self.read_operand()?;
        let lo: u16 = self.read_operand()?;
        Ok((hi << 8) | lo)
    }

    fn read_constant(&mut self) -> ErrorResult<program::Constant> {
        let index: u16 = self.read_operand()?;
        let function_address: u32 = self.frame().closure.function;
        let function: &Function = self.program.function_by_address(function_address).unwrap();
        match function.constant(index) {
            Some(constant) => Ok(constant),
            None => InvalidConstantIndex(function_address, index).err(),
        }
    }

    /// Reads a constant operand that must name a string — a global, class,
    /// property or method name.
    fn read_string_constant(&mut self) -> ErrorResult<Rc<String>> {
        let index: u16 = self.read_operand()?;
        let function_address: u32 = self.frame().closure.function;
        let function: &Function = self.program.function_by_address(function_address).unwrap();
        match function.constant(index) {
            Some(program::Constant::StringRef(address)) => match self.program.string_by_address(address) {
                Some(string) => Ok(string.clone()),
                None => UnknownString(address).err(),
            },
            Some(_) => InvalidConstantKind(function_address, index).err(),
            None => InvalidConstantIndex(function_address, index).err(),
        }
    }

    fn constant_value(&self, constant: program::Constant) -> ErrorResult<Value> {
        match constant {
            program::Constant::Number(n) => Ok(Value::Number(n)),
            program::Constant::Bool(b) => Ok(Value::Bool(b)),
            program::Constant::StringRef(address) => match self.program.string_by_address(address) {
                Some(string) => Ok(Value::Str(string.clone())),
                None => UnknownString(address).err(),
            },
            program::Constant::FunctionRef(address) => Ok(Value::Function(address)),
        }
    }

    // ===== Calls ===== //

    /// Dispatches a call to any callable value. On entry `callee` sits at
    /// `peek(argc)` with the arguments above it.
    fn call_value(&mut self, callee: Value, argc: u8) -> AnyResult {
        match callee {
            Value::Closure(closure) => self.call(closure, argc),
            Value::Class(class) => {
                // the callee slot becomes the fresh instance, which is exactly
                // where `init` expects to find `this`
                let instance: Rc<Instance> = Rc::new(Instance::new(class.clone()));
                let slot: usize = self.stack.len() - argc as usize - 1;
                self.stack[slot] = Value::Instance(instance);
                match class.method("init") {
                    Some(init) => self.call(init, argc),
                    None if argc != 0 => IncorrectNumberOfArguments(0, argc).err(),
                    None => Ok(()),
                }
            },
            Value::BoundMethod(bound) => {
                let slot: usize = self.stack.len() - argc as usize - 1;
                self.stack[slot] = Value::Instance(bound.receiver.clone());
                self.call(bound.method.clone(), argc)
            },
            Value::NativeFunction(native) => {
                let from: usize = self.stack.len() - argc as usize;
                let result: Value = native.invoke(argc, &self.stack[from..]);
                self.stack.truncate(from - 1);
                self.push(result);
                Ok(())
            },
            v => TypeErrorNotCallable(v).err(),
        }
    }

    /// Pushes a frame for `closure`. Arity is checked before the frame
    /// budget, so a wrong-arity call never consumes a frame.
    fn call(&mut self, closure: Rc<Closure>, argc: u8) -> AnyResult {
        let (arity, first): (u8, u32) = match self.program.function_by_address(closure.function) {
            Some(function) => (function.arity, function.first_instruction_address),
            None => return UnknownFunction(closure.function).err(),
        };
        if argc != arity {
            return IncorrectNumberOfArguments(arity, argc).err();
        }
        if self.call_stack.len() >= CALL_STACK_MAX {
            return CallStackOverflow.err();
        }
        let slot_offset: usize = self.stack.len() - argc as usize - 1;
        self.call_stack.push(CallFrame { closure, ip: first, slot_offset });
        Ok(())
    }

    /// `Invoke`: fused property access and call on the receiver at
    /// `peek(argc)`. A field wins over a method of the same name, in which
    /// case the field value replaces the receiver slot and is called as a
    /// plain value.
    fn invoke(&mut self, name: Rc<String>, argc: u8) -> AnyResult {
        let receiver: Rc<Instance> = match self.peek(argc as usize) {
            Value::Instance(instance) => instance.clone(),
            v => return TypeErrorOnlyInstancesHaveMethods(v.clone()).err(),
        };
        if let Some(field) = receiver.field(name.as_str()) {
            let slot: usize = self.stack.len() - argc as usize - 1;
            self.stack[slot] = field.clone();
            return self.call_value(field, argc);
        }
        self.invoke_from_class(receiver.class.clone(), name.as_str(), argc)
    }

    fn invoke_from_class(&mut self, class: Rc<Class>, name: &str, argc: u8) -> AnyResult {
        match class.method(name) {
            Some(method) => self.call(method, argc),
            None => UndefinedProperty(String::from(name)).err(),
        }
    }

    /// Looks `name` up on `class` and replaces the receiver at the top of
    /// the stack with a fresh bound method over it.
    fn bind_method(&mut self, class: Rc<Class>, name: &str) -> AnyResult {
        let method: Rc<Closure> = match class.method(name) {
            Some(method) => method,
            None => return UndefinedProperty(String::from(name)).err(),
        };
        let receiver: Rc<Instance> = match self.peek(0) {
            Value::Instance(instance) => instance.clone(),
            v => return TypeErrorOnlyInstancesHaveFields(v.clone()).err(),
        };
        self.pop();
        self.push(Value::BoundMethod(Rc::new(BoundMethod { receiver, method })));
        Ok(())
    }

    /// `Closure`: wraps a function constant in a fresh closure, pushes it,
    /// then captures each upvalue by value — either a local slot of the
    /// current frame, or one of the current frame's own upvalues. Captures
    /// copy the value as it is *now*; later writes to the enclosing local are
    /// not observed.
    fn op_closure(&mut self) -> AnyResult {
        let index: u16 = self.read_operand()?;
        let current: u32 = self.frame().closure.function;
        let constant = self.program.function_by_address(current).unwrap().constant(index);
        let function_address: u32 = match constant {
            Some(program::Constant::FunctionRef(address)) => address,
            Some(_) => return InvalidConstantKind(current, index).err(),
            None => return InvalidConstantIndex(current, index).err(),
        };
        let upvalue_count: u16 = match self.program.function_by_address(function_address) {
            Some(function) => function.upvalue_count,
            None => return UnknownFunction(function_address).err(),
        };
        trace::trace_interpreter!("closure over fn {} ({} upvalues)", function_address, upvalue_count);

        let closure: Rc<Closure> = Rc::new(Closure::new(function_address));
        self.push(Value::Closure(closure.clone()));
        for _ in 0..upvalue_count {
            let is_local: u16 = self.read_operand()?;
            let index: usize = self.read_operand()? as usize;
            let captured: Value = if is_local != 0 {
                let slot: usize = self.frame().slot_offset + index;
                match self.stack.get(slot) {
                    Some(value) => value.clone(),
                    None => return InvalidStackSlot(slot).err(),
                }
            } else {
                let parent: Rc<Closure> = self.frame().closure.clone();
                let value = match parent.upvalues.borrow().get(index) {
                    Some(value) => value.clone(),
                    None => return InvalidUpValueIndex(index).err(),
                };
                value
            };
            closure.upvalues.borrow_mut().push(captured);
        }
        Ok(())
    }
}


pub trait IO {
    fn println(&mut self, text: String);
}

impl<W> IO for VirtualMachine<W> where W: Write {
    fn println(&mut self, text: String) {
        writeln!(&mut self.write, "{}", text).unwrap();
    }
}


pub trait Stack {
    fn peek(&self, offset: usize) -> &Value;
    fn pop(&mut self) -> Value;
    fn push(&mut self, value: Value);
}

impl<W> Stack for VirtualMachine<W> {

    /// Peeks at the top element of the stack, or an element `offset` down
    /// from the top.
    fn peek(&self, offset: usize) -> &Value {
        trace::trace_interpreter_stack!("peek({}) -> {:?}", offset, self.stack[self.stack.len() - 1 - offset]);
        self.stack.get(self.stack.len() - 1 - offset).unwrap()
    }

    fn pop(&mut self) -> Value {
        trace::trace_interpreter_stack!("pop() -> {:?}", self.stack.last().unwrap());
        self.stack.pop().unwrap()
    }

    fn push(&mut self, value: Value) {
        trace::trace_interpreter_stack!("push({:?})", value);
        self.stack.push(value);
    }
}
