//! Representation of values in blox.
//!
//! Scalars ([Value::Nil], [Value::Boolean], [Value::Int], [Value::Float]) live directly in a
//! [Value]. Everything else is an [Object]: a closed set of heap-allocated kinds shared through
//! [Rc]. Objects that can change after creation (lists, dicts, classes, instances) sit behind a
//! [RefCell].

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use crate::chunk::Chunk;
use crate::natives::NativeFn;

/// A blox runtime value.
///
/// You can create a blox value from its equivalent Rust type:
///
/// ```
/// # use blox::value::Value;
/// let v: Value = 0.5.into();
/// assert_eq!("0.5", v.to_string());
///
/// let v: Value = 2.0.into();
/// assert_eq!("2.0", v.to_string());
///
/// let v: Value = 7_i64.into();
/// assert_eq!("7", v.to_string());
///
/// let v: Value = "Hello".into();
/// assert!(v.is_string());
/// ```
///
/// This even works with `Option<T>`: `None` turns [Value::Nil].
///
/// ```
/// # use blox::value::Value;
/// let option: Option<f64> = None;
/// let v: Value = option.into();
/// assert_eq!("nil", v.to_string());
/// ```
#[derive(Debug, Default, Clone)]
pub enum Value {
    /// Nil. Doing anything with this is usually an error.
    #[default]
    Nil,
    /// A boolean.
    Boolean(bool),
    /// A 64-bit signed integer.
    Int(i64),
    /// A 64-bit float.
    Float(f64),
    /// A reference to a heap object.
    Obj(Object),
}

/// Every kind of heap object. The discriminant doubles as the object's type tag.
#[derive(Clone)]
pub enum Object {
    String(Rc<str>),
    List(Rc<RefCell<List>>),
    Dict(Rc<RefCell<Dict>>),
    Function(Rc<Function>),
    Closure(Rc<Closure>),
    Class(Rc<RefCell<Class>>),
    Instance(Rc<RefCell<Instance>>),
    BoundMethod(Rc<BoundMethod>),
    Module(Rc<Module>),
    Native(Rc<Native>),
}

/// The type tag of an [Object].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    String,
    List,
    Dict,
    Function,
    Closure,
    Class,
    Instance,
    BoundMethod,
    Module,
    Native,
}

/// A growable list. Tuples are lists that display with parentheses.
#[derive(Debug, Default, Clone)]
pub struct List {
    pub items: Vec<Value>,
    pub tuple: bool,
}

/// Dictionaries map string keys to values.
pub type Dict = HashMap<Rc<str>, Value>;

/// A compiled function. Created once by the compiler and never modified afterwards.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Function {
    /// `None` for the top-level script.
    pub name: Option<Rc<str>>,
    pub arity: usize,
    pub upvalue_count: usize,
    pub chunk: Chunk,
}

/// A function plus everything it closes over. This is what actually gets called.
pub struct Closure {
    pub function: Rc<Function>,
    pub upvalues: Vec<Rc<RefCell<Upvalue>>>,
    /// The global scope of the module the closure was created in.
    pub globals: Rc<RefCell<Globals>>,
}

/// A variable captured by a closure.
#[derive(Debug, Clone)]
pub enum Upvalue {
    /// Still lives on the value stack, at this absolute slot.
    Open(usize),
    /// Hoisted off the stack when its scope ended.
    Closed(Value),
}

/// One entry in a global scope.
#[derive(Debug, Clone)]
pub struct Global {
    pub value: Value,
    /// Set by `const`: the binding can never be assigned again.
    pub immutable: bool,
}

/// A global scope: the top-level bindings of the script or of one module.
pub type Globals = HashMap<Rc<str>, Global>;

pub struct Class {
    pub name: Rc<str>,
    pub methods: HashMap<Rc<str>, Rc<Closure>>,
    pub superclass: Option<Rc<RefCell<Class>>>,
}

pub struct Instance {
    pub class: Rc<RefCell<Class>>,
    pub fields: HashMap<Rc<str>, Value>,
}

/// A method that has been pulled off its receiver, e.g., `var m = obj.method;`.
pub struct BoundMethod {
    pub receiver: Value,
    pub method: Rc<Closure>,
}

/// The global scope of an imported file.
pub struct Module {
    pub name: Rc<str>,
    pub globals: Rc<RefCell<Globals>>,
}

/// A function implemented by the host.
pub struct Native {
    pub name: &'static str,
    pub function: NativeFn,
}

/// A collection of values. Useful for a constant pool.
#[derive(Default, Debug, Clone, PartialEq)]
pub struct ValueArray {
    values: Vec<Value>,
}

///////////////////////////////////////// Implementation //////////////////////////////////////////

impl Value {
    /// Wraps the items in a new list.
    pub fn list(items: Vec<Value>) -> Value {
        Value::Obj(Object::List(Rc::new(RefCell::new(List {
            items,
            tuple: false,
        }))))
    }

    /// Wraps the items in a new tuple.
    pub fn tuple(items: Vec<Value>) -> Value {
        Value::Obj(Object::List(Rc::new(RefCell::new(List { items, tuple: true }))))
    }

    /// Wraps the map in a new dictionary.
    pub fn dict(entries: Dict) -> Value {
        Value::Obj(Object::Dict(Rc::new(RefCell::new(entries))))
    }

    /// Returns true if this value is blox's nil.
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Returns true if this value is a blox string.
    pub fn is_string(&self) -> bool {
        matches!(self, Value::Obj(Object::String(_)))
    }

    /// Returns true if this value is "falsy".
    ///
    /// Only `true` and numbers (including zero) are truthy. Nil, `false` and every object are
    /// falsy.
    pub fn is_falsy(&self) -> bool {
        !matches!(self, Value::Boolean(true) | Value::Int(_) | Value::Float(_))
    }

    /// Returns a reference to the string contents, if this value is a blox string.
    pub fn to_str(&self) -> Option<&str> {
        match self {
            Value::Obj(Object::String(string)) => Some(string),
            _ => None,
        }
    }

    /// Returns the shared string, if this value is a blox string.
    pub fn to_rc_str(&self) -> Option<Rc<str>> {
        match self {
            Value::Obj(Object::String(string)) => Some(Rc::clone(string)),
            _ => None,
        }
    }

    /// Returns the number as a float, promoting Ints.
    pub fn to_f64(&self) -> Option<f64> {
        match *self {
            Value::Int(i) => Some(i as f64),
            Value::Float(f) => Some(f),
            _ => None,
        }
    }

    /// Returns the number as an Int, truncating Floats.
    pub fn to_i64(&self) -> Option<i64> {
        match *self {
            Value::Int(i) => Some(i),
            Value::Float(f) => Some(f as i64),
            _ => None,
        }
    }

    /// The name of this value's type, as reported by `type()` and by error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Boolean(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Obj(object) => object.type_name(),
        }
    }

    /// Applies blox's rules for `==`, returning a Rust bool.
    ///
    /// Ints and Floats compare by numeric value. Objects of the same kind compare by their
    /// display representation, so two distinct lists with the same contents are equal.
    ///
    /// ```
    /// # use blox::value::Value;
    /// assert!(Value::Int(1).equal(&Value::Float(1.0)));
    /// assert!(Value::list(vec![1_i64.into()]).equal(&Value::list(vec![1_i64.into()])));
    /// assert!(!Value::from("1").equal(&Value::Int(1)));
    /// ```
    pub fn equal(&self, other: &Value) -> bool {
        use Value::*;
        match (self, other) {
            (Nil, Nil) => true,
            (Boolean(a), Boolean(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Float(a), Float(b)) => a == b,
            (Int(a), Float(b)) | (Float(b), Int(a)) => (*a as f64) == *b,
            (Obj(Object::String(a)), Obj(Object::String(b))) => a == b,
            (Obj(a), Obj(b)) if a.address() == b.address() => true,
            (Obj(a), Obj(b)) => a.kind() == b.kind() && a.to_string() == b.to_string(),
            _ => false,
        }
    }

    /// Writes the value as it appears inside a container: strings are quoted.
    fn write_repr(&self, f: &mut fmt::Formatter, open: &mut Vec<*const ()>) -> fmt::Result {
        match self {
            Value::Obj(Object::String(string)) => write!(f, "{string:?}"),
            Value::Obj(object) => object.write_nested(f, open),
            other => write!(f, "{other}"),
        }
    }
}

impl Object {
    /// Returns the type tag of this object.
    pub fn kind(&self) -> ObjectKind {
        match self {
            Object::String(_) => ObjectKind::String,
            Object::List(_) => ObjectKind::List,
            Object::Dict(_) => ObjectKind::Dict,
            Object::Function(_) => ObjectKind::Function,
            Object::Closure(_) => ObjectKind::Closure,
            Object::Class(_) => ObjectKind::Class,
            Object::Instance(_) => ObjectKind::Instance,
            Object::BoundMethod(_) => ObjectKind::BoundMethod,
            Object::Module(_) => ObjectKind::Module,
            Object::Native(_) => ObjectKind::Native,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Object::String(_) => "string",
            Object::List(list) if list.borrow().tuple => "tuple",
            Object::List(_) => "list",
            Object::Dict(_) => "dict",
            Object::Function(_) | Object::Closure(_) | Object::BoundMethod(_) => "function",
            Object::Native(_) => "native",
            Object::Class(_) => "class",
            Object::Instance(_) => "instance",
            Object::Module(_) => "module",
        }
    }

    /// The address of the shared allocation. Strict equality and hashing use this for
    /// objects that have identity.
    fn address(&self) -> *const () {
        match self {
            Object::String(rc) => Rc::as_ptr(rc) as *const (),
            Object::List(rc) => Rc::as_ptr(rc) as *const (),
            Object::Dict(rc) => Rc::as_ptr(rc) as *const (),
            Object::Function(rc) => Rc::as_ptr(rc) as *const (),
            Object::Closure(rc) => Rc::as_ptr(rc) as *const (),
            Object::Class(rc) => Rc::as_ptr(rc) as *const (),
            Object::Instance(rc) => Rc::as_ptr(rc) as *const (),
            Object::BoundMethod(rc) => Rc::as_ptr(rc) as *const (),
            Object::Module(rc) => Rc::as_ptr(rc) as *const (),
            Object::Native(rc) => Rc::as_ptr(rc) as *const (),
        }
    }
}

impl Function {
    /// The name used in stack traces and when printing the function.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("script")
    }
}

impl Closure {
    /// A closure over a function that captures nothing.
    pub fn new(function: Rc<Function>, globals: Rc<RefCell<Globals>>) -> Self {
        Closure {
            function,
            upvalues: Vec::new(),
            globals,
        }
    }
}

impl Class {
    pub fn new(name: Rc<str>) -> Self {
        Class {
            name,
            methods: HashMap::new(),
            superclass: None,
        }
    }
}

impl Instance {
    pub fn new(class: Rc<RefCell<Class>>) -> Self {
        Instance {
            class,
            fields: HashMap::new(),
        }
    }
}

impl Global {
    pub fn new(value: Value, immutable: bool) -> Self {
        Global { value, immutable }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Boolean(value) => write!(f, "{value}"),
            Value::Int(num) => write!(f, "{num}"),
            // Debug formatting always keeps a fractional part (or exponent), so floats never
            // print like ints.
            Value::Float(num) => write!(f, "{num:?}"),
            Value::Obj(object) => write!(f, "{object}"),
        }
    }
}

impl Object {
    /// Writes a container, or an ellipsis when it is already being written further up.
    /// `open` holds the addresses of the containers currently being written.
    fn write_nested(&self, f: &mut fmt::Formatter, open: &mut Vec<*const ()>) -> fmt::Result {
        let address = self.address();
        let (start, end) = match self {
            Object::List(list) if list.borrow().tuple => ('(', ')'),
            Object::List(_) => ('[', ']'),
            Object::Dict(_) => ('{', '}'),
            other => return write!(f, "{other}"),
        };
        if open.contains(&address) {
            return write!(f, "{start}...{end}");
        }

        open.push(address);
        f.write_char(start)?;
        match self {
            Object::List(list) => {
                let list = list.borrow();
                for (i, item) in list.items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    item.write_repr(f, open)?;
                }
                if list.tuple && list.items.len() == 1 {
                    f.write_char(',')?;
                }
            }
            Object::Dict(dict) => {
                let dict = dict.borrow();
                let mut keys: Vec<_> = dict.keys().collect();
                keys.sort();
                for (i, key) in keys.into_iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key:?}: ")?;
                    dict[key].write_repr(f, open)?;
                }
            }
            _ => unreachable!("only containers are written with brackets"),
        }
        open.pop();
        f.write_char(end)
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Object::String(string) => write!(f, "{string}"),
            Object::List(_) | Object::Dict(_) => self.write_nested(f, &mut Vec::new()),
            Object::Function(function) => match function.name {
                Some(ref name) => write!(f, "<fn {name}>"),
                None => write!(f, "<script>"),
            },
            Object::Closure(closure) => write!(f, "{}", Object::Function(closure.function.clone())),
            Object::BoundMethod(bound) => {
                write!(f, "{}", Object::Function(bound.method.function.clone()))
            }
            Object::Native(native) => write!(f, "<native fn {}>", native.name),
            Object::Class(class) => write!(f, "{}", class.borrow().name),
            Object::Instance(instance) => {
                write!(f, "{} instance", instance.borrow().class.borrow().name)
            }
            Object::Module(module) => write!(f, "<module {}>", module.name),
        }
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Object::String(string) => write!(f, "{string:?}"),
            // Containers and instances may be cyclic, so only print their shape.
            Object::List(list) => write!(f, "<list of {}>", list.borrow().items.len()),
            Object::Dict(dict) => write!(f, "<dict of {}>", dict.borrow().len()),
            Object::Instance(_) => write!(f, "<instance {self}>"),
            _ => write!(f, "{self}"),
        }
    }
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<closure {}>", self.function.display_name())
    }
}

/// Strict equality: unlike [Value::equal], Ints and Floats are never equal to each other, and
/// only strings and functions compare by contents. Everything else compares by identity.
impl std::cmp::PartialEq for Value {
    fn eq(&self, rhs: &Value) -> bool {
        use Value::*;
        match (self, rhs) {
            (Nil, Nil) => true,
            (Boolean(a), Boolean(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Float(a), Float(b)) => compare_with_nans_eq(*a, *b),
            (Obj(Object::String(a)), Obj(Object::String(b))) => a == b,
            (Obj(Object::Function(a)), Obj(Object::Function(b))) => a == b,
            (Obj(a), Obj(b)) => a.address() == b.address(),
            _ => false,
        }
    }
}

impl std::cmp::Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Nil => (),
            Value::Boolean(b) => b.hash(state),
            Value::Int(i) => i.hash(state),
            Value::Float(num) => {
                if num.is_nan() {
                    u64::MAX.hash(state)
                } else if *num == 0.0 {
                    // -0.0 == 0.0
                    0_u64.hash(state)
                } else {
                    num.to_bits().hash(state)
                }
            }
            Value::Obj(Object::String(s)) => s.hash(state),
            Value::Obj(Object::Function(function)) => function.name.hash(state),
            Value::Obj(object) => object.address().hash(state),
        }
    }
}

/// Compares floats, but, unlike IEEE 754, NaNs are considered equal.
fn compare_with_nans_eq(a: f64, b: f64) -> bool {
    match (a.is_nan(), b.is_nan()) {
        (false, false) => a == b,
        (false, true) => false,
        (true, false) => false,
        (true, true) => true,
    }
}

// Convert any Rust float into a blox value.
impl From<f64> for Value {
    #[inline(always)]
    fn from(float: f64) -> Value {
        Value::Float(float)
    }
}

// Convert any Rust integer into a blox value.
impl From<i64> for Value {
    #[inline(always)]
    fn from(int: i64) -> Value {
        Value::Int(int)
    }
}

impl From<bool> for Value {
    #[inline(always)]
    fn from(value: bool) -> Value {
        Value::Boolean(value)
    }
}

impl From<Rc<str>> for Value {
    fn from(string: Rc<str>) -> Value {
        Value::Obj(Object::String(string))
    }
}

// Convert any Rust (owned) string to a blox value.
impl From<String> for Value {
    fn from(owned: String) -> Value {
        Value::Obj(Object::String(owned.into()))
    }
}

// Copy any Rust (borrowed) string to a blox value.
impl From<&str> for Value {
    fn from(borrowed: &str) -> Value {
        Value::Obj(Object::String(borrowed.into()))
    }
}

impl From<Object> for Value {
    fn from(object: Object) -> Value {
        Value::Obj(object)
    }
}

// Convert any Rust option to a blox value.
impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    #[inline]
    fn from(option: Option<T>) -> Value {
        option.map(Into::into).unwrap_or(Value::Nil)
    }
}

impl ValueArray {
    /// Return an empty [ValueArray].
    pub fn new() -> Self {
        ValueArray::default()
    }

    /// Returns a [Value] at the given index. If the index is out of bounds, this returns `None`.
    #[inline]
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Add a new [Value] to the array, returning its index.
    pub fn write(&mut self, value: Value) -> usize {
        self.values.push(value);
        self.values.len() - 1
    }

    /// Returns how many values are in the pool.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if there are no values.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterates over the values in index order.
    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.values.iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_hash() {
        use std::collections::HashMap;
        // Values break the rules of floats for the purpose of being hashable, so check that it
        // actually works!.
        let mut set: HashMap<Value, String> = HashMap::default();

        let zero: Value = 0.0.into();
        let one: Value = 1.0.into();
        set.insert(zero, "zero".to_owned());
        set.insert(one, "one".to_owned());
        assert_eq!(2, set.len());

        assert!(set.contains_key(&0.0.into()));
        assert!(set.contains_key(&1.0.into()));
        assert!(!set.contains_key(&f64::NAN.into()));
        // Strict equality never crosses Int and Float.
        assert!(!set.contains_key(&Value::Int(1)));

        let nan: Value = f64::NAN.into();
        set.insert(nan, "NaN".to_owned());
        assert_eq!("NaN".to_owned(), *set.get(&f64::NAN.into()).unwrap());
    }

    #[test]
    fn equality_promotes_numbers_but_not_across_types() {
        assert!(Value::Int(3).equal(&Value::Float(3.0)));
        assert!(Value::Float(3.0).equal(&Value::Int(3)));
        assert!(!Value::Int(3).equal(&Value::Float(3.5)));
        assert!(!Value::Nil.equal(&Value::Boolean(false)));
        assert!(Value::from("abc").equal(&"abc".into()));
        // A string that looks like a list is still not a list.
        assert!(!Value::from("[1]").equal(&Value::list(vec![Value::Int(1)])));
    }

    #[test]
    fn distinct_containers_with_the_same_contents_are_equal() {
        let a = Value::list(vec![Value::Int(1), "two".into()]);
        let b = Value::list(vec![Value::Int(1), "two".into()]);
        assert!(a.equal(&b));
        assert_ne!(a, b, "strict equality compares identity");
        assert!(!a.equal(&Value::tuple(vec![Value::Int(1), "two".into()])));
    }

    #[test]
    fn truthiness() {
        assert!(Value::Nil.is_falsy());
        assert!(Value::Boolean(false).is_falsy());
        assert!(!Value::Boolean(true).is_falsy());
        assert!(!Value::Int(0).is_falsy());
        assert!(!Value::Float(0.0).is_falsy());
        assert!(Value::from("non-empty").is_falsy());
        assert!(Value::list(vec![]).is_falsy());
    }

    #[test]
    fn display() {
        assert_eq!("3", Value::Int(3).to_string());
        assert_eq!("3.0", Value::Float(3.0).to_string());
        assert_eq!("raw", Value::from("raw").to_string());
        assert_eq!(
            r#"[1, "a", 2.5]"#,
            Value::list(vec![Value::Int(1), "a".into(), Value::Float(2.5)]).to_string()
        );
        assert_eq!("(1, 2)", Value::tuple(vec![1_i64.into(), 2_i64.into()]).to_string());
        assert_eq!("(1,)", Value::tuple(vec![1_i64.into()]).to_string());

        let mut entries = Dict::new();
        entries.insert("b".into(), Value::Int(2));
        entries.insert("a".into(), Value::Nil);
        assert_eq!(r#"{"a": nil, "b": 2}"#, Value::dict(entries).to_string());
    }

    #[test]
    fn self_containing_containers_print_an_ellipsis() {
        let list = Value::list(vec![Value::Int(1)]);
        if let Value::Obj(Object::List(ref items)) = list {
            items.borrow_mut().items.push(list.clone());
        }
        assert_eq!("[1, [...]]", list.to_string());
        assert!(list.equal(&list.clone()));

        let dict = Value::dict(Dict::new());
        if let Value::Obj(Object::Dict(ref entries)) = dict {
            entries.borrow_mut().insert("me".into(), dict.clone());
            entries.borrow_mut().insert("pair".into(), Value::tuple(vec![dict.clone()]));
        }
        assert_eq!(r#"{"me": {...}, "pair": ({...},)}"#, dict.to_string());
    }

    #[test]
    fn shared_but_acyclic_containers_print_in_full() {
        let inner = Value::list(vec![Value::Int(1)]);
        let outer = Value::list(vec![inner.clone(), inner]);
        assert_eq!("[[1], [1]]", outer.to_string());
    }
}
