use std::time::{SystemTime, UNIX_EPOCH};

use crate::vm::value::Value;

/// The fixed registry of built-in functions. Each one is installed into the
/// globals table under its name before execution begins, so programs reach
/// them through ordinary `GetGlobal` / `Call` sequences.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash)]
pub enum NativeFunction {
    Clock,
}

impl NativeFunction {

    pub fn all() -> impl Iterator<Item = NativeFunction> {
        [NativeFunction::Clock].into_iter()
    }

    pub fn name(self) -> &'static str {
        match self {
            NativeFunction::Clock => "clock",
        }
    }

    /// Natives are total: there is no error channel across the native
    /// boundary, so every native produces a value for any argument list.
    pub fn invoke(self, _argc: u8, _args: &[Value]) -> Value {
        match self {
            NativeFunction::Clock => Value::Number(clock_seconds()),
        }
    }
}

fn clock_seconds() -> f64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs_f64(),
        Err(_) => 0.0,
    }
}


#[cfg(test)]
mod test {
    use crate::core::NativeFunction;
    use crate::vm::value::Value;

    #[test]
    fn test_clock_returns_a_number() {
        match NativeFunction::Clock.invoke(0, &[]) {
            Value::Number(n) => assert!(n > 0.0),
            v => panic!("expected a number, got {:?}", v),
        }
    }

    #[test]
    fn test_registry_names_are_unique() {
        let names: Vec<&str> = NativeFunction::all().map(NativeFunction::name).collect();
        let mut deduped = names.clone();
        deduped.dedup();
        assert_eq!(names, deduped);
        assert!(names.contains(&"clock"));
    }
}
