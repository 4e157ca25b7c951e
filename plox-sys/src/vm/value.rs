use std::cell::RefCell;
use std::rc::Rc;

use fxhash::FxHashMap;

use crate::core::NativeFunction;
use crate::program::ProgramModel;

/// A runtime value. `Nil`, `Bool`, `Number` and `Str` compare structurally;
/// all heap kinds compare by identity of their handle. `Function` carries the
/// address of a context in the program model and is what a `FunctionRef`
/// constant loads as — it only becomes callable once `Closure` wraps it.
#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Number(f64),
    Str(Rc<String>),
    Function(u32),
    NativeFunction(NativeFunction),
    Closure(Rc<Closure>),
    Class(Rc<Class>),
    Instance(Rc<Instance>),
    BoundMethod(Rc<BoundMethod>),
}

/// A function plus its captured upvalues. Capture is by value at closure
/// creation time, so each closure owns its cells outright; `SetUpValue`
/// mutates them in place through the `RefCell`.
#[derive(Debug)]
pub struct Closure {
    pub function: u32,
    pub upvalues: RefCell<Vec<Value>>,
}

#[derive(Debug)]
pub struct Class {
    pub name: Rc<String>,
    pub methods: RefCell<FxHashMap<String, Rc<Closure>>>,
}

#[derive(Debug)]
pub struct Instance {
    pub class: Rc<Class>,
    pub fields: RefCell<FxHashMap<String, Value>>,
}

/// A method plucked off an instance: `receiver.method` evaluated as a value.
/// Calling it re-installs the receiver as local slot 0.
#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: Rc<Instance>,
    pub method: Rc<Closure>,
}

impl Closure {
    pub fn new(function: u32) -> Closure {
        Closure { function, upvalues: RefCell::new(Vec::new()) }
    }
}

impl Class {
    pub fn new(name: Rc<String>) -> Class {
        Class { name, methods: RefCell::new(FxHashMap::default()) }
    }

    pub fn method(&self, name: &str) -> Option<Rc<Closure>> {
        self.methods.borrow().get(name).cloned()
    }
}

impl Instance {
    pub fn new(class: Rc<Class>) -> Instance {
        Instance { class, fields: RefCell::new(FxHashMap::default()) }
    }

    pub fn field(&self, name: &str) -> Option<Value> {
        self.fields.borrow().get(name).cloned()
    }
}

impl Value {

    pub fn str(value: String) -> Value {
        Value::Str(Rc::new(value))
    }

    /// Exactly `nil` and `false` are falsey; every other value is truthy.
    pub fn is_falsey(&self) -> bool {
        matches!(self, Value::Nil | Value::Bool(false))
    }

    /// The user-facing rendering, as emitted by `Print`. Numbers use the
    /// host's locale-independent `f64` formatting, so `7` rather than `7.0`.
    pub fn as_display_str(&self, program: &ProgramModel) -> String {
        match self {
            Value::Nil => String::from("nil"),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::Str(s) => (**s).clone(),
            Value::Function(address) => function_display(program, *address),
            Value::NativeFunction(_) => String::from("<native fn>"),
            Value::Closure(closure) => function_display(program, closure.function),
            Value::Class(class) => (*class.name).clone(),
            Value::Instance(instance) => format!("<{} instance>", instance.class.name),
            Value::BoundMethod(bound) => function_display(program, bound.method.function),
        }
    }
}

fn function_display(program: &ProgramModel, address: u32) -> String {
    match program.function_by_address(address) {
        Some(function) if function.name.is_empty() => String::from("<script>"),
        Some(function) => format!("<fn {}>", function.name),
        None => String::from("<fn ?>"),
    }
}

/// Language equality: structural for the immediate kinds, identity for heap
/// kinds. Mixed kinds are never equal, and `Number` follows `f64` equality,
/// so `NaN != NaN`.
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(l), Value::Bool(r)) => l == r,
            (Value::Number(l), Value::Number(r)) => l == r,
            (Value::Str(l), Value::Str(r)) => l == r,
            (Value::Function(l), Value::Function(r)) => l == r,
            (Value::NativeFunction(l), Value::NativeFunction(r)) => l == r,
            (Value::Closure(l), Value::Closure(r)) => Rc::ptr_eq(l, r),
            (Value::Class(l), Value::Class(r)) => Rc::ptr_eq(l, r),
            (Value::Instance(l), Value::Instance(r)) => Rc::ptr_eq(l, r),
            (Value::BoundMethod(l), Value::BoundMethod(r)) => Rc::ptr_eq(l, r),
            _ => false,
        }
    }
}


#[cfg(test)]
mod test {
    use std::rc::Rc;

    use crate::vm::value::{Closure, Value};

    #[test]
    fn test_falsey() {
        assert!(Value::Nil.is_falsey());
        assert!(Value::Bool(false).is_falsey());

        assert!(!Value::Bool(true).is_falsey());
        assert!(!Value::Number(0.0).is_falsey());
        assert!(!Value::Number(f64::NAN).is_falsey());
        assert!(!Value::str(String::new()).is_falsey());
        assert!(!Value::Function(1).is_falsey());
    }

    #[test]
    fn test_structural_equality() {
        assert_eq!(Value::Nil, Value::Nil);
        assert_eq!(Value::Bool(true), Value::Bool(true));
        assert_eq!(Value::Number(1.5), Value::Number(1.5));
        assert_eq!(Value::str(String::from("ab")), Value::str(String::from("ab")));

        assert_ne!(Value::Nil, Value::Bool(false));
        assert_ne!(Value::Number(1.0), Value::str(String::from("1")));
        assert_ne!(Value::Number(f64::NAN), Value::Number(f64::NAN));
    }

    #[test]
    fn test_identity_equality() {
        let closure = Rc::new(Closure::new(1));
        assert_eq!(Value::Closure(closure.clone()), Value::Closure(closure.clone()));

        // same function, distinct closure objects
        assert_ne!(Value::Closure(Rc::new(Closure::new(1))), Value::Closure(Rc::new(Closure::new(1))));
        // a closure never equals the bare function it wraps
        assert_ne!(Value::Closure(closure), Value::Function(1));
    }
}
