//! Functions implemented in Rust and callable from blox.
//!
//! A native never sees the VM. It gets a [NativeContext], which can read the value stack by
//! absolute slot, plus the number of arguments and the slot of the first one. It answers with
//! `Ok(value)`, or `Err(NativeError)`, which the VM raises as a runtime error.

use std::time::Instant;

use thiserror::Error;

use crate::value::{Object, Value};

/// The signature of every native function: context, argument count, slot of the first argument.
pub type NativeFn = fn(&NativeContext<'_>, usize, usize) -> NativeResult;

/// What a native function returns.
pub type NativeResult = Result<Value, NativeError>;

/// A native function failed. The message becomes the runtime error's message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct NativeError(pub String);

/// The restricted view of the VM handed to native functions.
pub struct NativeContext<'a> {
    stack: &'a [Value],
    started: Instant,
    script_args: &'a [String],
}

/// Every builtin, by the global name it is bound to.
pub const BUILTINS: &[(&str, NativeFn)] = &[
    ("clock", clock),
    ("len", len),
    ("sin", sin),
    ("cos", cos),
    ("append", append),
    ("float", float),
    ("int", int),
    ("join", join),
    ("keys", keys),
    ("args", args),
    ("str", stringify),
    ("type", type_of),
];

impl<'a> NativeContext<'a> {
    pub fn new(stack: &'a [Value], started: Instant, script_args: &'a [String]) -> Self {
        NativeContext {
            stack,
            started,
            script_args,
        }
    }

    /// Reads a stack slot by absolute index.
    pub fn slot(&self, index: usize) -> Result<&'a Value, NativeError> {
        self.stack
            .get(index)
            .ok_or_else(|| NativeError(format!("Stack slot {index} is out of range.")))
    }

    /// Reads the `n`th argument of a call whose first argument is at `first`.
    pub fn arg(&self, first: usize, n: usize) -> Result<&'a Value, NativeError> {
        self.slot(first + n)
    }
}

impl NativeError {
    pub fn new(message: impl Into<String>) -> Self {
        NativeError(message.into())
    }
}

/// Checks the argument count of a native.
fn expect_arity(name: &str, expected: usize, got: usize) -> Result<(), NativeError> {
    if expected == got {
        Ok(())
    } else {
        let plural = if expected == 1 { "" } else { "s" };
        Err(NativeError(format!(
            "{name}() expects {expected} argument{plural} but got {got}."
        )))
    }
}

/// Reads the `n`th argument as a number, promoting Ints.
fn number_arg(
    ctx: &NativeContext<'_>,
    name: &str,
    first: usize,
    n: usize,
) -> Result<f64, NativeError> {
    let value = ctx.arg(first, n)?;
    value.to_f64().ok_or_else(|| {
        NativeError(format!(
            "{name}() expects a number but got {}.",
            value.type_name()
        ))
    })
}

/// Seconds since the VM started.
fn clock(ctx: &NativeContext<'_>, arg_count: usize, _first: usize) -> NativeResult {
    expect_arity("clock", 0, arg_count)?;
    Ok(ctx.started.elapsed().as_secs_f64().into())
}

fn len(ctx: &NativeContext<'_>, arg_count: usize, first: usize) -> NativeResult {
    expect_arity("len", 1, arg_count)?;
    let length = match ctx.arg(first, 0)? {
        Value::Obj(Object::String(string)) => string.chars().count(),
        Value::Obj(Object::List(list)) => list.borrow().items.len(),
        Value::Obj(Object::Dict(dict)) => dict.borrow().len(),
        other => {
            return Err(NativeError(format!(
                "len() expects a list or string but got {}.",
                other.type_name()
            )))
        }
    };
    Ok(Value::Int(length as i64))
}

fn sin(ctx: &NativeContext<'_>, arg_count: usize, first: usize) -> NativeResult {
    expect_arity("sin", 1, arg_count)?;
    Ok(number_arg(ctx, "sin", first, 0)?.sin().into())
}

fn cos(ctx: &NativeContext<'_>, arg_count: usize, first: usize) -> NativeResult {
    expect_arity("cos", 1, arg_count)?;
    Ok(number_arg(ctx, "cos", first, 0)?.cos().into())
}

/// Appends in place, and returns the same list.
fn append(ctx: &NativeContext<'_>, arg_count: usize, first: usize) -> NativeResult {
    expect_arity("append", 2, arg_count)?;
    let target = ctx.arg(first, 0)?;
    match target {
        Value::Obj(Object::List(list)) if !list.borrow().tuple => {
            let item = ctx.arg(first, 1)?.clone();
            list.borrow_mut().items.push(item);
            Ok(target.clone())
        }
        other => Err(NativeError(format!(
            "append() expects a list but got {}.",
            other.type_name()
        ))),
    }
}

fn float(ctx: &NativeContext<'_>, arg_count: usize, first: usize) -> NativeResult {
    expect_arity("float", 1, arg_count)?;
    match ctx.arg(first, 0)? {
        Value::Obj(Object::String(string)) => string
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| NativeError(format!("float() cannot parse {string:?}."))),
        _ => Ok(number_arg(ctx, "float", first, 0)?.into()),
    }
}

fn int(ctx: &NativeContext<'_>, arg_count: usize, first: usize) -> NativeResult {
    expect_arity("int", 1, arg_count)?;
    let value = ctx.arg(first, 0)?;
    match value {
        Value::Obj(Object::String(string)) => string
            .trim()
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| NativeError(format!("int() cannot parse {string:?}."))),
        _ => value.to_i64().map(Value::Int).ok_or_else(|| {
            NativeError(format!(
                "int() expects a number but got {}.",
                value.type_name()
            ))
        }),
    }
}

fn join(ctx: &NativeContext<'_>, arg_count: usize, first: usize) -> NativeResult {
    expect_arity("join", 2, arg_count)?;
    let Value::Obj(Object::List(list)) = ctx.arg(first, 0)? else {
        return Err(NativeError::new("join() expects a list as its first argument."));
    };
    let Some(separator) = ctx.arg(first, 1)?.to_str() else {
        return Err(NativeError::new("join() expects a string separator."));
    };

    let list = list.borrow();
    let mut parts = Vec::with_capacity(list.items.len());
    for item in &list.items {
        match item.to_str() {
            Some(part) => parts.push(part),
            None => {
                return Err(NativeError(format!(
                    "join() can only join strings, but found {}.",
                    item.type_name()
                )))
            }
        }
    }
    Ok(parts.join(separator).into())
}

/// The keys of a dict, sorted.
fn keys(ctx: &NativeContext<'_>, arg_count: usize, first: usize) -> NativeResult {
    expect_arity("keys", 1, arg_count)?;
    let Value::Obj(Object::Dict(dict)) = ctx.arg(first, 0)? else {
        return Err(NativeError::new("keys() expects a dict."));
    };
    let mut keys: Vec<_> = dict.borrow().keys().cloned().collect();
    keys.sort();
    Ok(Value::list(keys.into_iter().map(Value::from).collect()))
}

/// The script's command-line arguments.
fn args(ctx: &NativeContext<'_>, arg_count: usize, _first: usize) -> NativeResult {
    expect_arity("args", 0, arg_count)?;
    Ok(Value::list(
        ctx.script_args
            .iter()
            .map(|arg| Value::from(arg.as_str()))
            .collect(),
    ))
}

fn stringify(ctx: &NativeContext<'_>, arg_count: usize, first: usize) -> NativeResult {
    expect_arity("str", 1, arg_count)?;
    Ok(ctx.arg(first, 0)?.to_string().into())
}

fn type_of(ctx: &NativeContext<'_>, arg_count: usize, first: usize) -> NativeResult {
    expect_arity("type", 1, arg_count)?;
    Ok(ctx.arg(first, 0)?.type_name().into())
}

#[cfg(test)]
mod test {
    use super::*;

    /// Calls a builtin with the given arguments laid out after a dummy callee slot.
    fn call(function: NativeFn, arguments: Vec<Value>) -> NativeResult {
        let mut stack = vec![Value::Nil];
        let count = arguments.len();
        stack.extend(arguments);
        let script_args = vec!["one".to_owned(), "two".to_owned()];
        let ctx = NativeContext::new(&stack, Instant::now(), &script_args);
        function(&ctx, count, 1)
    }

    #[test]
    fn len_of_lists_and_strings() {
        let list = Value::list(vec![1_i64.into(), 2_i64.into(), 3_i64.into()]);
        assert_eq!(Ok(Value::Int(3)), call(len, vec![list]));
        assert_eq!(Ok(Value::Int(3)), call(len, vec!["abc".into()]));
        assert_eq!(Ok(Value::Int(2)), call(len, vec!["🦀🦀".into()]));
        assert!(call(len, vec![Value::Int(42)]).is_err());
        assert!(call(len, vec![]).is_err());
    }

    #[test]
    fn append_mutates_in_place() {
        let list = Value::list(vec![]);
        let returned = call(append, vec![list.clone(), Value::Int(1)]).unwrap();
        assert_eq!(list, returned, "the same list comes back");
        assert_eq!("[1]", list.to_string());
        assert!(call(append, vec![Value::tuple(vec![]), Value::Nil]).is_err());
    }

    #[test]
    fn join_only_joins_strings() {
        let words = Value::list(vec!["a".into(), "b".into()]);
        assert_eq!(Ok(Value::from("a-b")), call(join, vec![words, "-".into()]));

        let mixed = Value::list(vec!["a".into(), Value::Int(1)]);
        let error = call(join, vec![mixed, "-".into()]).unwrap_err();
        assert_eq!("join() can only join strings, but found int.", error.to_string());
    }

    #[test]
    fn numeric_conversions() {
        assert_eq!(Ok(Value::Float(3.0)), call(float, vec![Value::Int(3)]));
        assert_eq!(Ok(Value::Int(3)), call(int, vec![Value::Float(3.9)]));
        assert_eq!(Ok(Value::Int(-12)), call(int, vec![" -12 ".into()]));
        assert!(call(int, vec!["twelve".into()]).is_err());
        assert_eq!(Ok(Value::Float(0.0)), call(sin, vec![Value::Int(0)]));
        assert_eq!(Ok(Value::Float(1.0)), call(cos, vec![Value::Float(0.0)]));
    }

    #[test]
    fn keys_are_sorted() {
        let mut entries = crate::value::Dict::new();
        entries.insert("zebra".into(), Value::Nil);
        entries.insert("apple".into(), Value::Nil);
        let keys = call(keys, vec![Value::dict(entries)]).unwrap();
        assert_eq!(r#"["apple", "zebra"]"#, keys.to_string());
    }

    #[test]
    fn args_come_from_the_context() {
        assert_eq!(r#"["one", "two"]"#, call(args, vec![]).unwrap().to_string());
    }
}
