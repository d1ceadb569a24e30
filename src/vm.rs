//! The bytecode virtual machine.
//!
//! A [VM] owns everything a running program needs: the value stack, the call frames, the global
//! scope, the open upvalues, the exception handlers and the module cache. There is no global
//! state, so several VMs can coexist.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{self, Stdout, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Instant;

use crate::compiler;
use crate::config::{VmConfig, MAX_STRING_LEN, SCRIPT_EXTENSION};
use crate::error::{RuntimeFault, TraceEntry};
use crate::gc::{CollectHook, CollectReason, Collector};
use crate::natives::{NativeContext, NativeError, NativeFn, BUILTINS};
use crate::prelude::*;
use crate::value::{
    self, BoundMethod, Closure, Function, Global, Globals, Instance, List, Module, Native, Object,
    Upvalue,
};

/// A blox exception on its way to a handler: the raised value, or a runtime error's message.
#[derive(Debug, Clone)]
pub struct Exception(pub Value);

/// The result of anything that can raise.
type Flow<T> = std::result::Result<T, Exception>;

/// Finds the source code of imported modules.
pub trait ModuleLoader {
    /// Turns the path written in an `import` into the key the module is cached under.
    fn resolve(&self, path: &str) -> PathBuf;

    /// Reads the source code of a resolved module.
    fn load(&self, resolved: &Path) -> io::Result<String>;
}

/// Loads modules from the file system, relative to a base directory. Paths without an
/// extension get `.blox`.
#[derive(Debug, Clone)]
pub struct FsLoader {
    base: PathBuf,
}

/// Maintains state for the blox virtual machine.
///
/// `print` writes to `W`, which is stdout by default:
///
/// ```
/// use blox::vm::VM;
/// use blox::config::VmConfig;
///
/// let mut vm = VM::new(VmConfig::default(), Vec::new());
/// vm.interpret("var greeting = \"hello\"").unwrap();
/// vm.interpret("print greeting + \", world\"").unwrap();
/// assert_eq!(b"hello, world\n", vm.output().as_slice());
/// ```
pub struct VM<W: Write = Stdout> {
    config: VmConfig,
    output: W,
    /// Value stack -- modified as elements are pushed and popped from the stack.
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    /// The top-level scope of the script. Modules get their own.
    globals: Rc<RefCell<Globals>>,
    /// Upvalues still pointing into the stack, by ascending slot: the last one is the highest.
    open_upvalues: Vec<Rc<RefCell<Upvalue>>>,
    handlers: Vec<Handler>,
    modules: HashMap<PathBuf, Rc<Module>>,
    /// Modules whose top-level code is running right now.
    loading: HashSet<PathBuf>,
    loader: Box<dyn ModuleLoader>,
    /// Natives defined by the host; every module's globals get them too.
    host_natives: Vec<(&'static str, NativeFn)>,
    collector: Collector,
    started: Instant,
}

/// One function invocation.
struct CallFrame {
    closure: Rc<Closure>,
    /// Instruction pointer --- index into the chunk for the next opcode to be executed.
    ip: usize,
    /// Stack slot of the callee; the function's locals start here.
    base: usize,
}

/// Registered by `try`.
#[derive(Debug, Clone, Copy)]
struct Handler {
    /// Number of frames when the handler was registered; the handler belongs to the topmost.
    frame_depth: usize,
    stack_height: usize,
    /// Where the except/finally code starts.
    ip: usize,
}

/// Creates an [Exception] carrying a runtime error's message.
fn error(message: impl Into<String>) -> Exception {
    Exception(Value::from(message.into()))
}

/// Raises a runtime error.
fn throw<T>(message: impl Into<String>) -> Flow<T> {
    Err(error(message))
}

impl From<NativeError> for Exception {
    fn from(native: NativeError) -> Self {
        error(native.0)
    }
}

impl FsLoader {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        FsLoader { base: base.into() }
    }
}

impl Default for FsLoader {
    fn default() -> Self {
        FsLoader::new(".")
    }
}

impl ModuleLoader for FsLoader {
    fn resolve(&self, path: &str) -> PathBuf {
        let mut resolved = self.base.join(path);
        if resolved.extension().is_none() {
            resolved.set_extension(SCRIPT_EXTENSION);
        }
        resolved
    }

    fn load(&self, resolved: &Path) -> io::Result<String> {
        fs::read_to_string(resolved)
    }
}

impl<W: Write> VM<W> {
    /// Creates a VM that prints to `output`.
    pub fn new(config: VmConfig, output: W) -> Self {
        let stack = Vec::with_capacity(config.stack_capacity());
        let frames = Vec::with_capacity(config.frames_max);
        let collector = Collector::new(config.gc_interval);
        VM {
            config,
            output,
            stack,
            frames,
            globals: new_globals(&[]),
            open_upvalues: Vec::new(),
            handlers: Vec::new(),
            modules: HashMap::new(),
            loading: HashSet::new(),
            loader: Box::new(FsLoader::default()),
            host_natives: Vec::new(),
            collector,
            started: Instant::now(),
        }
    }

    /// Compiles and runs blox source code. Globals persist between calls.
    pub fn interpret(&mut self, source: &str) -> crate::Result<Value> {
        let function = compiler::compile(source)?;
        self.run_function(Rc::new(function))
    }

    /// Runs an already compiled script, e.g., one loaded from the bytecode cache.
    pub fn run_function(&mut self, function: Rc<Function>) -> crate::Result<Value> {
        let closure = Rc::new(Closure::new(function, Rc::clone(&self.globals)));
        self.push(Object::Closure(Rc::clone(&closure)).into());

        let result = self.call(closure, 0).and_then(|()| self.run(0));
        self.collector
            .collect(CollectReason::Completion, self.stack.len());

        result.map_err(|exception| {
            let fault = self.fault(exception);
            tracing::debug!(message = %fault.message, depth = fault.backtrace.len(), "uncaught runtime error");
            eprintln!("{fault}");
            self.reset();
            InterpretationError::RuntimeError(fault)
        })
    }

    /// Where `print` output went.
    pub fn output(&self) -> &W {
        &self.output
    }

    /// Consumes the VM, returning its output.
    pub fn into_output(self) -> W {
        self.output
    }

    /// Installs the routine run on every collection pass.
    pub fn set_collect_hook(&mut self, hook: CollectHook) {
        self.collector.set_hook(hook);
    }

    /// Replaces how imported modules are found.
    pub fn set_loader(&mut self, loader: Box<dyn ModuleLoader>) {
        self.loader = loader;
    }

    /// Binds a host function to a global name in the script's scope and in every module
    /// imported afterwards.
    pub fn define_native(&mut self, name: &'static str, function: NativeFn) {
        define_native(&self.globals, name, function);
        self.host_natives.push((name, function));
    }

    /// Reads a global of the script's scope.
    pub fn global(&self, name: &str) -> Option<Value> {
        self.globals
            .borrow()
            .get(name)
            .map(|global| global.value.clone())
    }

    /// The main opcode interpreter loop. Runs until the frame count drops to `stop_depth`.
    ///
    /// Exceptions are caught by the handlers registered above `stop_depth`; anything else
    /// escapes, with the frames left as they were for the backtrace.
    fn run(&mut self, stop_depth: usize) -> Flow<Value> {
        loop {
            if self.collector.tick() {
                self.collector
                    .collect(CollectReason::Periodic, self.stack.len());
            }

            match self.step(stop_depth) {
                Ok(None) => (),
                Ok(Some(result)) => return Ok(result),
                Err(exception) => self.catch(exception, stop_depth)?,
            }
        }
    }

    /// Executes one instruction. Returns the result when the frame at `stop_depth` returns.
    fn step(&mut self, stop_depth: usize) -> Flow<Option<Value>> {
        use OpCode::*;

        if cfg!(feature = "trace_execution") {
            self.trace_instruction();
        }

        let opcode = self.read_byte();
        let opcode = OpCode::try_from(opcode)
            .unwrap_or_else(|_| panic!("fetched invalid opcode {opcode}"));

        match opcode {
            Constant => {
                let constant = self.read_constant();
                self.push(constant);
            }
            Nil => self.push(Value::Nil),
            True => self.push(true.into()),
            False => self.push(false.into()),
            Pop => {
                self.pop();
            }
            GetLocal => {
                let slot = self.frame().base + self.read_byte() as usize;
                self.push(self.stack[slot].clone());
            }
            SetLocal => {
                let slot = self.frame().base + self.read_byte() as usize;
                self.stack[slot] = self.peek(0).clone();
            }
            GetGlobal => {
                let name = self.read_string();
                let value = self
                    .frame()
                    .closure
                    .globals
                    .borrow()
                    .get(&name)
                    .map(|global| global.value.clone());
                match value {
                    Some(value) => self.push(value),
                    None => return throw(format!("Undefined variable '{name}'.")),
                }
            }
            DefineGlobal | DefineConstGlobal => {
                let name = self.read_string();
                let value = self.peek(0).clone();
                let globals = Rc::clone(&self.frame().closure.globals);
                let mut globals = globals.borrow_mut();
                if globals.get(&name).map_or(false, |global| global.immutable) {
                    return throw(format!("Cannot assign to const '{name}'."));
                }
                globals.insert(name, Global::new(value, opcode == DefineConstGlobal));
                drop(globals);
                self.pop();
            }
            SetGlobal => {
                let name = self.read_string();
                let value = self.peek(0).clone();
                let globals = Rc::clone(&self.frame().closure.globals);
                let mut globals = globals.borrow_mut();
                match globals.get_mut(&name) {
                    None => return throw(format!("Undefined variable '{name}'.")),
                    Some(global) if global.immutable => {
                        return throw(format!("Cannot assign to const '{name}'."))
                    }
                    Some(global) => global.value = value,
                }
            }
            GetUpvalue => {
                let index = self.read_byte() as usize;
                let upvalue = Rc::clone(&self.frame().closure.upvalues[index]);
                let value = match &*upvalue.borrow() {
                    Upvalue::Open(slot) => self.stack[*slot].clone(),
                    Upvalue::Closed(value) => value.clone(),
                };
                self.push(value);
            }
            SetUpvalue => {
                let index = self.read_byte() as usize;
                let upvalue = Rc::clone(&self.frame().closure.upvalues[index]);
                let value = self.peek(0).clone();
                match &mut *upvalue.borrow_mut() {
                    Upvalue::Open(slot) => self.stack[*slot] = value,
                    Upvalue::Closed(closed) => *closed = value,
                };
            }
            AssignConst => {
                let name = self.read_string();
                return throw(format!("Cannot assign to const '{name}'."));
            }
            GetProperty => {
                let name = self.read_string();
                let value = self.get_property(self.peek(0).clone(), &name)?;
                self.pop();
                self.push(value);
            }
            SetProperty => {
                let name = self.read_string();
                let value = self.pop();
                let target = self.pop();
                let Value::Obj(Object::Instance(instance)) = target else {
                    return throw("Only instances have fields.");
                };
                instance.borrow_mut().fields.insert(name, value.clone());
                self.push(value);
            }
            GetSuper => {
                let name = self.read_string();
                let superclass = self.pop();
                let receiver = self.pop();
                let method = self.find_method(&superclass, &name)?;
                self.push(Object::BoundMethod(Rc::new(BoundMethod { receiver, method })).into());
            }
            Equal => {
                let rhs = self.pop();
                let lhs = self.pop();
                self.push(lhs.equal(&rhs).into());
            }
            Greater => self.comparison_op(Ordering::is_gt)?,
            GreaterEqual => self.comparison_op(Ordering::is_ge)?,
            Less => self.comparison_op(Ordering::is_lt)?,
            LessEqual => self.comparison_op(Ordering::is_le)?,
            Add => self.binary_op(add)?,
            Subtract => self.binary_op(subtract)?,
            Multiply => self.binary_op(multiply)?,
            Divide => self.binary_op(divide)?,
            Modulo => self.binary_op(modulo)?,
            Not => {
                let value = self.pop();
                self.push(value.is_falsy().into());
            }
            Negate => {
                let value = match self.pop() {
                    Value::Int(num) => match num.checked_neg() {
                        Some(negated) => Value::Int(negated),
                        None => return throw("Integer overflow."),
                    },
                    Value::Float(num) => Value::Float(-num),
                    _ => return throw("Operand must be a number."),
                };
                self.push(value);
            }
            Print => {
                let value = self.pop();
                if let Err(e) = writeln!(self.output, "{value}") {
                    return throw(format!("Could not print: {e}."));
                }
            }
            Jump => {
                let offset = self.read_u16();
                self.frame_mut().ip += offset as usize;
            }
            JumpIfFalse => {
                let offset = self.read_u16();
                if self.peek(0).is_falsy() {
                    self.frame_mut().ip += offset as usize;
                }
            }
            Loop => {
                let offset = self.read_u16();
                self.frame_mut().ip -= offset as usize;
            }
            Call => {
                let arg_count = self.read_byte() as usize;
                self.call_value(self.peek(arg_count).clone(), arg_count)?;
            }
            Invoke => {
                let name = self.read_string();
                let arg_count = self.read_byte() as usize;
                self.invoke(&name, arg_count)?;
            }
            SuperInvoke => {
                let name = self.read_string();
                let arg_count = self.read_byte() as usize;
                let superclass = self.pop();
                let method = self.find_method(&superclass, &name)?;
                self.call(method, arg_count)?;
            }
            OpCode::Closure => {
                let Value::Obj(Object::Function(function)) = self.read_constant() else {
                    panic!("closure operand must be a function");
                };
                let base = self.frame().base;
                let mut upvalues = Vec::with_capacity(function.upvalue_count);
                for _ in 0..function.upvalue_count {
                    let is_local = self.read_byte() != 0;
                    let index = self.read_byte() as usize;
                    upvalues.push(if is_local {
                        self.capture_upvalue(base + index)
                    } else {
                        Rc::clone(&self.frame().closure.upvalues[index])
                    });
                }
                let closure = value::Closure {
                    function,
                    upvalues,
                    globals: Rc::clone(&self.frame().closure.globals),
                };
                self.push(Object::Closure(Rc::new(closure)).into());
            }
            CloseUpvalue => {
                self.close_upvalues(self.stack.len() - 1);
                self.pop();
            }
            Return => {
                let result = self.pop();
                let frame = self.frames.pop().expect("returning from a frame");
                self.close_upvalues(frame.base);
                let depth = self.frames.len();
                while self
                    .handlers
                    .last()
                    .map_or(false, |handler| handler.frame_depth > depth)
                {
                    self.handlers.pop();
                }
                self.stack.truncate(frame.base);

                if depth == stop_depth {
                    return Ok(Some(result));
                }
                self.push(result);
            }
            OpCode::Class => {
                let name = self.read_string();
                let class = value::Class::new(name);
                self.push(Object::Class(Rc::new(RefCell::new(class))).into());
            }
            Inherit => {
                let Value::Obj(Object::Class(superclass)) = self.peek(1).clone() else {
                    return throw("Superclass must be a class.");
                };
                let Value::Obj(Object::Class(subclass)) = self.peek(0).clone() else {
                    panic!("inheriting into a non-class");
                };
                if Rc::ptr_eq(&superclass, &subclass) {
                    return throw("A class can't inherit from itself.");
                }
                {
                    let superclass_ref = superclass.borrow();
                    let mut subclass_ref = subclass.borrow_mut();
                    subclass_ref.methods.extend(
                        superclass_ref
                            .methods
                            .iter()
                            .map(|(name, method)| (Rc::clone(name), Rc::clone(method))),
                    );
                }
                subclass.borrow_mut().superclass = Some(superclass);
                self.pop();
            }
            Method => {
                let name = self.read_string();
                let Value::Obj(Object::Closure(method)) = self.peek(0).clone() else {
                    panic!("method body must be a closure");
                };
                let Value::Obj(Object::Class(class)) = self.peek(1) else {
                    panic!("methods are bound to classes");
                };
                class.borrow_mut().methods.insert(name, method);
                self.pop();
            }
            BuildList | BuildTuple => {
                let count = self.read_byte() as usize;
                let items = self.stack.split_off(self.stack.len() - count);
                self.push(if opcode == BuildList {
                    Value::list(items)
                } else {
                    Value::tuple(items)
                });
            }
            BuildDict => {
                let count = self.read_byte() as usize;
                let items = self.stack.split_off(self.stack.len() - 2 * count);
                let mut dict = value::Dict::with_capacity(count);
                let mut items = items.into_iter();
                while let (Some(key), Some(value)) = (items.next(), items.next()) {
                    dict.insert(dict_key(&key)?, value);
                }
                self.push(Value::dict(dict));
            }
            Index => {
                let index = self.pop();
                let target = self.pop();
                self.push(subscript(&target, &index)?);
            }
            IndexAssign => {
                let value = self.pop();
                let index = self.pop();
                let target = self.pop();
                assign_subscript(&target, &index, value.clone())?;
                self.push(value);
            }
            Slice => {
                let end = self.pop();
                let start = self.pop();
                let target = self.pop();
                self.push(slice(&target, &start, &end)?);
            }
            SliceAssign => {
                let value = self.pop();
                let end = self.pop();
                let start = self.pop();
                let target = self.pop();
                assign_slice(&target, &start, &end, &value)?;
                self.push(value);
            }
            Import => {
                let path = self.read_string();
                let module = self.import(&path)?;
                self.push(Object::Module(module).into());
            }
            Try => {
                let offset = self.read_u16() as usize;
                let handler = Handler {
                    frame_depth: self.frames.len(),
                    stack_height: self.stack.len(),
                    ip: self.frame().ip + offset,
                };
                self.handlers.push(handler);
            }
            EndTry => {
                self.handlers.pop();
            }
            Raise => {
                let value = self.pop();
                if value.is_nil() {
                    return throw("Cannot raise nil.");
                }
                return Err(Exception(value));
            }
        }

        Ok(None)
    }

    /// Transfers control to the innermost handler registered above `stop_depth`, or lets the
    /// exception escape.
    fn catch(&mut self, exception: Exception, stop_depth: usize) -> Flow<()> {
        let Some(handler) = self
            .handlers
            .last()
            .copied()
            .filter(|handler| handler.frame_depth > stop_depth)
        else {
            return Err(exception);
        };
        self.handlers.pop();

        self.close_upvalues(handler.stack_height);
        self.stack.truncate(handler.stack_height);
        self.frames.truncate(handler.frame_depth);
        self.frame_mut().ip = handler.ip;
        self.push(exception.0);
        Ok(())
    }

    ///////////////////////////////////////// Calls ///////////////////////////////////////////////

    /// Calls whatever is `arg_count` slots below the top of the stack.
    fn call_value(&mut self, callee: Value, arg_count: usize) -> Flow<()> {
        let Value::Obj(object) = callee else {
            return throw("Can only call functions and classes.");
        };

        match object {
            Object::Closure(closure) => self.call(closure, arg_count),
            Object::Native(native) => {
                let first = self.stack.len() - arg_count;
                let context =
                    NativeContext::new(&self.stack, self.started, &self.config.script_args);
                let result = (native.function)(&context, arg_count, first)?;
                self.stack.truncate(first - 1);
                self.push(result);
                Ok(())
            }
            Object::Class(class) => {
                let callee_slot = self.stack.len() - arg_count - 1;
                let instance = Instance::new(Rc::clone(&class));
                self.stack[callee_slot] = Object::Instance(Rc::new(RefCell::new(instance))).into();

                let initializer = class.borrow().methods.get("init").cloned();
                match initializer {
                    Some(initializer) => self.call(initializer, arg_count),
                    None if arg_count != 0 => {
                        throw(format!("Expected 0 arguments but got {arg_count}."))
                    }
                    None => Ok(()),
                }
            }
            Object::BoundMethod(bound) => {
                let callee_slot = self.stack.len() - arg_count - 1;
                self.stack[callee_slot] = bound.receiver.clone();
                self.call(Rc::clone(&bound.method), arg_count)
            }
            _ => throw("Can only call functions and classes."),
        }
    }

    /// Pushes a new frame for the closure. The callee and its arguments are already on the stack.
    fn call(&mut self, closure: Rc<Closure>, arg_count: usize) -> Flow<()> {
        let arity = closure.function.arity;
        if arg_count != arity {
            return throw(format!(
                "Expected {arity} arguments but got {arg_count}."
            ));
        }

        if self.frames.len() >= self.config.frames_max {
            return throw("Stack overflow.");
        }

        let base = self.stack.len() - arg_count - 1;
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            base,
        });
        Ok(())
    }

    /// `receiver.name(args)`, without creating a bound method.
    fn invoke(&mut self, name: &Rc<str>, arg_count: usize) -> Flow<()> {
        let receiver = self.peek(arg_count).clone();
        let callee_slot = self.stack.len() - arg_count - 1;

        match receiver {
            Value::Obj(Object::Instance(instance)) => {
                let field = instance.borrow().fields.get(name).cloned();
                if let Some(field) = field {
                    self.stack[callee_slot] = field.clone();
                    return self.call_value(field, arg_count);
                }
                let class = Value::from(Object::Class(Rc::clone(&instance.borrow().class)));
                let method = self.find_method(&class, name)?;
                self.call(method, arg_count)
            }
            Value::Obj(Object::Module(module)) => {
                let member = module_member(&module, name)?;
                self.stack[callee_slot] = member.clone();
                self.call_value(member, arg_count)
            }
            _ => throw("Only instances have methods."),
        }
    }

    /// Looks up a method of a class value.
    fn find_method(&self, class: &Value, name: &str) -> Flow<Rc<Closure>> {
        let Value::Obj(Object::Class(class)) = class else {
            return throw("Superclass must be a class.");
        };
        let method = class.borrow().methods.get(name).cloned();
        method.ok_or_else(|| error(format!("Undefined property '{name}'.")))
    }

    /// `receiver.name`: a field, a bound method, or a module member.
    fn get_property(&self, receiver: Value, name: &str) -> Flow<Value> {
        match receiver {
            Value::Obj(Object::Instance(ref instance)) => {
                if let Some(field) = instance.borrow().fields.get(name) {
                    return Ok(field.clone());
                }
                let class = Value::from(Object::Class(Rc::clone(&instance.borrow().class)));
                let method = self.find_method(&class, name)?;
                let receiver = receiver.clone();
                Ok(Object::BoundMethod(Rc::new(BoundMethod { receiver, method })).into())
            }
            Value::Obj(Object::Module(module)) => module_member(&module, name),
            _ => throw("Only instances have properties."),
        }
    }

    //////////////////////////////////////// Upvalues /////////////////////////////////////////////

    /// Returns the open upvalue for a stack slot, creating it if needed.
    fn capture_upvalue(&mut self, slot: usize) -> Rc<RefCell<Upvalue>> {
        let position = self
            .open_upvalues
            .partition_point(|upvalue| open_slot(upvalue) < slot);
        if let Some(existing) = self.open_upvalues.get(position) {
            if open_slot(existing) == slot {
                return Rc::clone(existing);
            }
        }

        let created = Rc::new(RefCell::new(Upvalue::Open(slot)));
        self.open_upvalues.insert(position, Rc::clone(&created));
        created
    }

    /// Hoists every open upvalue at or above `from` off the stack.
    fn close_upvalues(&mut self, from: usize) {
        while let Some(slot) = self.open_upvalues.last().map(open_slot) {
            if slot < from {
                break;
            }
            let upvalue = self.open_upvalues.pop().expect("just peeked");
            *upvalue.borrow_mut() = Upvalue::Closed(self.stack[slot].clone());
        }
    }

    ///////////////////////////////////////// Modules /////////////////////////////////////////////

    /// Loads, compiles and runs a module, once.
    fn import(&mut self, path: &str) -> Flow<Rc<Module>> {
        let resolved = self.loader.resolve(path);
        if let Some(module) = self.modules.get(&resolved) {
            return Ok(Rc::clone(module));
        }
        if self.loading.contains(&resolved) {
            return throw(format!("Circular import of '{path}'."));
        }

        let source = self
            .loader
            .load(&resolved)
            .map_err(|e| error(format!("Could not import '{path}': {e}.")))?;
        let function = compiler::compile(&source).map_err(|e| match e {
            InterpretationError::CompileError(diagnostics) => {
                let first = diagnostics
                    .first()
                    .map(ToString::to_string)
                    .unwrap_or_default();
                error(format!("Could not compile module '{path}': {first}"))
            }
            InterpretationError::RuntimeError(fault) => error(fault.message),
        })?;

        tracing::debug!(path = %resolved.display(), "importing module");
        let globals = new_globals(&self.host_natives);
        let closure = Rc::new(Closure::new(Rc::new(function), Rc::clone(&globals)));
        self.push(Object::Closure(Rc::clone(&closure)).into());

        let stop_depth = self.frames.len();
        self.loading.insert(resolved.clone());
        let result = self.call(closure, 0).and_then(|()| self.run(stop_depth));
        self.loading.remove(&resolved);
        result?;

        let name = resolved
            .file_stem()
            .map(|stem| stem.to_string_lossy())
            .unwrap_or_else(|| path.into());
        let module = Rc::new(Module {
            name: name.as_ref().into(),
            globals,
        });
        self.modules.insert(resolved, Rc::clone(&module));
        Ok(module)
    }

    ////////////////////////////////////////// Errors /////////////////////////////////////////////

    /// Describes an uncaught exception, with a backtrace of the frames it escaped from.
    fn fault(&self, exception: Exception) -> RuntimeFault {
        let backtrace = self
            .frames
            .iter()
            .rev()
            .map(|frame| {
                let function = &frame.closure.function;
                TraceEntry {
                    line: function
                        .chunk
                        .line_number_for(frame.ip.saturating_sub(1))
                        .unwrap_or(0),
                    function: function.name.as_ref().map(ToString::to_string),
                }
            })
            .collect();

        RuntimeFault {
            message: exception.0.to_string(),
            backtrace,
        }
    }

    /// Forgets everything about the aborted program, except its globals.
    fn reset(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        self.handlers.clear();
        self.loading.clear();
    }

    /// Logs the stack and the next instruction.
    fn trace_instruction(&self) {
        let frame = self.frame();
        let stack: String = self.stack[frame.base..]
            .iter()
            .map(|value| format!("[ {value:?} ]"))
            .collect();
        let (instruction, _) =
            crate::debug::instruction_to_string(&frame.closure.function.chunk, frame.ip);
        tracing::trace!("          {stack}\n{instruction}");
    }

    /////////////////////////////////////////// Stack /////////////////////////////////////////////

    /// Pops two operands on the stack to perform a binary operation.
    fn binary_op<F>(&mut self, op: F) -> Flow<()>
    where
        F: Fn(Value, Value) -> Flow<Value>,
    {
        let rhs = self.pop();
        let lhs = self.pop();
        let result = op(lhs, rhs)?;
        self.push(result);
        Ok(())
    }

    /// Pops two operands and pushes whether their ordering satisfies `test`. Unordered
    /// operands (NaN) satisfy nothing.
    fn comparison_op(&mut self, test: fn(Ordering) -> bool) -> Flow<()> {
        self.binary_op(|lhs, rhs| Ok(compare(&lhs, &rhs)?.is_some_and(test).into()))
    }

    /// Pushes a [Value] on to the value stack.
    #[inline(always)]
    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    /// Pops and returns the top [Value] on the value stack.
    ///
    /// # Panics
    ///
    /// Panics when the value stack is empty. Given well-formed blox bytecode, a pop cannot occur
    /// when the value stack is empty; therefore the interpreter panics if it is in this state.
    #[inline(always)]
    fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack is empty")
    }

    /// Returns the value `distance` slots below the top of the stack.
    #[inline(always)]
    fn peek(&self, distance: usize) -> &Value {
        &self.stack[self.stack.len() - 1 - distance]
    }

    #[inline(always)]
    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("there is always a running frame")
    }

    #[inline(always)]
    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames
            .last_mut()
            .expect("there is always a running frame")
    }

    /// Fetches the next byte of the running function, **AND** increments the instruction
    /// pointer.
    #[inline(always)]
    fn read_byte(&mut self) -> u8 {
        let frame = self.frame_mut();
        let byte = frame
            .closure
            .function
            .chunk
            .get(frame.ip)
            .expect("I have an instruction pointer within range")
            .byte();
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let high = self.read_byte() as u16;
        let low = self.read_byte() as u16;
        (high << 8) | low
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        self.frame()
            .closure
            .function
            .chunk
            .constants
            .get(index)
            .cloned()
            .expect("there should be a constant at this index")
    }

    fn read_string(&mut self) -> Rc<str> {
        self.read_constant()
            .to_rc_str()
            .expect("name operands are string constants")
    }
}

impl Default for VM<Stdout> {
    fn default() -> Self {
        VM::new(VmConfig::default(), io::stdout())
    }
}

/// A fresh global scope, with the builtins and then the host's natives defined.
fn new_globals(host_natives: &[(&'static str, NativeFn)]) -> Rc<RefCell<Globals>> {
    let globals = Rc::new(RefCell::new(Globals::new()));
    for &(name, function) in BUILTINS.iter().chain(host_natives) {
        define_native(&globals, name, function);
    }
    globals
}

fn define_native(globals: &RefCell<Globals>, name: &'static str, function: NativeFn) {
    let native = Object::Native(Rc::new(Native { name, function }));
    globals
        .borrow_mut()
        .insert(name.into(), Global::new(native.into(), false));
}

/// The slot of an upvalue in the open list.
fn open_slot(upvalue: &Rc<RefCell<Upvalue>>) -> usize {
    match *upvalue.borrow() {
        Upvalue::Open(slot) => slot,
        Upvalue::Closed(_) => unreachable!("closed upvalues leave the open list"),
    }
}

fn module_member(module: &Module, name: &str) -> Flow<Value> {
    let member = module.globals.borrow().get(name).map(|g| g.value.clone());
    member.ok_or_else(|| {
        error(format!(
            "Module '{}' has no member '{name}'.",
            module.name
        ))
    })
}

/////////////////////////////////////////// Arithmetic ////////////////////////////////////////////

/// The overflow error of Int arithmetic.
fn overflow() -> Exception {
    error("Integer overflow.")
}

fn add(lhs: Value, rhs: Value) -> Flow<Value> {
    use Value::*;
    match (&lhs, &rhs) {
        (Int(a), Int(b)) => a.checked_add(*b).map(Int).ok_or_else(overflow),
        (Int(_) | Float(_), Int(_) | Float(_)) => Ok(Float(float(&lhs) + float(&rhs))),
        (Obj(Object::String(a)), Obj(Object::String(b))) => Ok(format!("{a}{b}").into()),
        (Obj(Object::List(a)), Obj(Object::List(b))) => {
            let (a, b) = (a.borrow(), b.borrow());
            let items = a.items.iter().chain(b.items.iter()).cloned().collect();
            Ok(if a.tuple && b.tuple {
                Value::tuple(items)
            } else {
                Value::list(items)
            })
        }
        _ => throw("Operands must be two numbers, two strings or two lists."),
    }
}

fn subtract(lhs: Value, rhs: Value) -> Flow<Value> {
    use Value::*;
    match (&lhs, &rhs) {
        (Int(a), Int(b)) => a.checked_sub(*b).map(Int).ok_or_else(overflow),
        (Int(_) | Float(_), Int(_) | Float(_)) => Ok(Float(float(&lhs) - float(&rhs))),
        _ => throw("Operands must be numbers."),
    }
}

fn multiply(lhs: Value, rhs: Value) -> Flow<Value> {
    use Value::*;
    match (&lhs, &rhs) {
        (Int(a), Int(b)) => a.checked_mul(*b).map(Int).ok_or_else(overflow),
        (Int(_) | Float(_), Int(_) | Float(_)) => Ok(Float(float(&lhs) * float(&rhs))),
        (Obj(Object::String(s)), Int(n)) | (Int(n), Obj(Object::String(s))) => {
            let count = usize::try_from(*n)
                .map_err(|_| error("Cannot repeat a string a negative number of times."))?;
            match s.len().checked_mul(count) {
                Some(len) if len <= MAX_STRING_LEN => Ok(s.repeat(count).into()),
                _ => throw("String repetition too large."),
            }
        }
        _ => throw("Operands must be numbers."),
    }
}

fn divide(lhs: Value, rhs: Value) -> Flow<Value> {
    use Value::*;
    match (&lhs, &rhs) {
        (Int(_), Int(0)) => throw("Division by zero."),
        (Int(a), Int(b)) => a.checked_div(*b).map(Int).ok_or_else(overflow),
        (Int(_) | Float(_), Int(_) | Float(_)) => Ok(Float(float(&lhs) / float(&rhs))),
        _ => throw("Operands must be numbers."),
    }
}

/// Both operands are truncated to Ints.
fn modulo(lhs: Value, rhs: Value) -> Flow<Value> {
    let (Some(a), Some(b)) = (lhs.to_i64(), rhs.to_i64()) else {
        return throw("Operands must be numbers.");
    };
    if b == 0 {
        return throw("Modulo by zero.");
    }
    a.checked_rem(b).map(Value::Int).ok_or_else(overflow)
}

/// Orders two numbers or two strings. NaN is unordered, so every comparison with it is false.
fn compare(lhs: &Value, rhs: &Value) -> Flow<Option<Ordering>> {
    use Value::*;
    match (lhs, rhs) {
        (Int(a), Int(b)) => Ok(Some(a.cmp(b))),
        (Int(_) | Float(_), Int(_) | Float(_)) => Ok(float(lhs).partial_cmp(&float(rhs))),
        (Obj(Object::String(a)), Obj(Object::String(b))) => Ok(Some(a.cmp(b))),
        _ => throw("Operands must be two numbers or two strings."),
    }
}

#[inline]
fn float(value: &Value) -> f64 {
    value.to_f64().unwrap_or(f64::NAN)
}

/////////////////////////////////////////// Subscripts ////////////////////////////////////////////

fn dict_key(key: &Value) -> Flow<Rc<str>> {
    key.to_rc_str()
        .ok_or_else(|| error("Dict keys must be strings."))
}

/// Resolves a possibly negative index into `0..len`.
fn index_in(index: &Value, len: usize) -> Flow<usize> {
    let Value::Int(index) = *index else {
        return throw("Subscript must be an integer.");
    };
    let wrapped = if index < 0 {
        index + len as i64
    } else {
        index
    };
    usize::try_from(wrapped)
        .ok()
        .filter(|&i| i < len)
        .ok_or_else(|| error("Subscript out of range."))
}

/// Resolves slice bounds into `start..end`, clamped to `0..=len`. Nil means "from the start"
/// or "to the end".
fn slice_bounds(start: &Value, end: &Value, len: usize) -> Flow<(usize, usize)> {
    let bound = |value: &Value, default: usize| -> Flow<usize> {
        match *value {
            Value::Nil => Ok(default),
            Value::Int(i) => {
                let i = if i < 0 { i + len as i64 } else { i };
                Ok(i.clamp(0, len as i64) as usize)
            }
            _ => throw("Slice bounds must be integers."),
        }
    };
    let start = bound(start, 0)?;
    let end = bound(end, len)?;
    Ok((start, end.max(start)))
}

fn subscript(target: &Value, index: &Value) -> Flow<Value> {
    match target {
        Value::Obj(Object::List(list)) => {
            let list = list.borrow();
            let i = index_in(index, list.items.len())?;
            Ok(list.items[i].clone())
        }
        Value::Obj(Object::String(string)) => {
            let i = index_in(index, string.chars().count())?;
            let c = string.chars().nth(i).expect("index was checked");
            Ok(c.to_string().into())
        }
        Value::Obj(Object::Dict(dict)) => {
            let key = dict_key(index)?;
            let value = dict.borrow().get(&key).cloned();
            value.ok_or_else(|| error(format!("Key '{key}' not found.")))
        }
        _ => throw("Only lists, strings and dicts can be subscripted."),
    }
}

fn assign_subscript(target: &Value, index: &Value, value: Value) -> Flow<()> {
    match target {
        Value::Obj(Object::List(list)) => {
            let mut list = list.borrow_mut();
            if list.tuple {
                return throw("Tuples are immutable.");
            }
            let i = index_in(index, list.items.len())?;
            list.items[i] = value;
            Ok(())
        }
        Value::Obj(Object::Dict(dict)) => {
            let key = dict_key(index)?;
            dict.borrow_mut().insert(key, value);
            Ok(())
        }
        _ => throw("Only lists and dicts support item assignment."),
    }
}

fn slice(target: &Value, start: &Value, end: &Value) -> Flow<Value> {
    match target {
        Value::Obj(Object::List(list)) => {
            let list = list.borrow();
            let (start, end) = slice_bounds(start, end, list.items.len())?;
            let items = list.items[start..end].to_vec();
            Ok(Value::Obj(Object::List(Rc::new(RefCell::new(List {
                items,
                tuple: list.tuple,
            })))))
        }
        Value::Obj(Object::String(string)) => {
            let (start, end) = slice_bounds(start, end, string.chars().count())?;
            let sliced: String = string.chars().skip(start).take(end - start).collect();
            Ok(sliced.into())
        }
        _ => throw("Only lists and strings can be sliced."),
    }
}

/// Replaces `target[start:end]` with the items of a list or tuple.
fn assign_slice(target: &Value, start: &Value, end: &Value, value: &Value) -> Flow<()> {
    let Value::Obj(Object::List(list)) = target else {
        return throw("Only lists support slice assignment.");
    };
    let Value::Obj(Object::List(replacement)) = value else {
        return throw("Can only assign a list to a slice.");
    };

    // Copy first: the replacement may be the target itself.
    let items = replacement.borrow().items.clone();
    let mut list = list.borrow_mut();
    if list.tuple {
        return throw("Tuples are immutable.");
    }
    let (start, end) = slice_bounds(start, end, list.items.len())?;
    list.items.splice(start..end, items);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    /// Runs the source and returns what it printed.
    fn run(source: &str) -> String {
        let mut vm = VM::new(VmConfig::default(), Vec::new());
        vm.interpret(source).unwrap();
        String::from_utf8(vm.into_output()).unwrap()
    }

    fn runtime_error(source: &str) -> String {
        let mut vm = VM::new(VmConfig::default(), Vec::new());
        match vm.interpret(source) {
            Err(InterpretationError::RuntimeError(fault)) => fault.message,
            other => panic!("expected a runtime error, got {other:?}"),
        }
    }

    #[test]
    fn arithmetic_keeps_ints_and_floats_apart() {
        assert_eq!("3\n3.5\n2\n-2\n2.5\n1\n", run("print 1 + 2\nprint 1 + 2.5\nprint 5 / 2\nprint -5 / 2\nprint 5 / 2.0\nprint 7 % 3"));
        assert_eq!("Division by zero.", runtime_error("print 1 / 0"));
        assert_eq!("Modulo by zero.", runtime_error("print 1 % 0"));
        assert_eq!("Integer overflow.", runtime_error("print 9223372036854775807 + 1"));
        assert_eq!("inf\n", run("print 1.0 / 0"));
    }

    #[test]
    fn comparisons() {
        assert_eq!(
            "true\nfalse\ntrue\ntrue\nfalse\n",
            run("print 1 < 2\nprint 2 <= 1\nprint \"abc\" < \"abd\"\nprint 1 == 1.0\nprint nil == false")
        );
        assert_eq!(
            "Operands must be two numbers or two strings.",
            runtime_error("print 1 < \"2\"")
        );
    }

    #[test]
    fn truthiness_only_admits_true_and_numbers() {
        assert_eq!(
            "false\nfalse\ntrue\ntrue\ntrue\n",
            run("print !0\nprint !true\nprint !nil\nprint !\"\"\nprint ![1]")
        );
    }

    #[test]
    fn stack_overflow_is_a_runtime_error() {
        let mut vm = VM::new(VmConfig::default().with_frames_max(8), Vec::new());
        let Err(InterpretationError::RuntimeError(fault)) =
            vm.interpret("func f() { f() }\nf()")
        else {
            panic!("recursion must overflow");
        };
        assert_eq!("Stack overflow.", fault.message);
        assert_eq!(8, fault.backtrace.len());
    }

    #[test]
    fn backtraces_are_innermost_first() {
        let mut vm = VM::new(VmConfig::default(), Vec::new());
        let Err(InterpretationError::RuntimeError(fault)) =
            vm.interpret("func inner() {\n  return 1 + nil\n}\nfunc outer() {\n  inner()\n}\nouter()")
        else {
            panic!("adding nil must fail");
        };
        let trace: Vec<String> = fault.backtrace.iter().map(ToString::to_string).collect();
        assert_eq!(
            vec!["[line 2] in inner()", "[line 5] in outer()", "[line 7] in script"],
            trace
        );
    }

    #[test]
    fn the_vm_recovers_after_an_error() {
        let mut vm = VM::new(VmConfig::default(), Vec::new());
        vm.interpret("var x = 41").unwrap();
        assert!(vm.interpret("x()").is_err());
        vm.interpret("print x + 1").unwrap();
        assert_eq!(b"42\n", vm.output().as_slice());
    }

    #[test]
    fn collection_passes_run_periodically_and_at_completion() {
        use std::cell::Cell;
        let passes = Rc::new(Cell::new(0));
        let seen = Rc::clone(&passes);

        let mut vm = VM::new(VmConfig::default().with_gc_interval(10), Vec::new());
        vm.set_collect_hook(Box::new(move |_| seen.set(seen.get() + 1)));
        vm.interpret("for (var i = 0; i < 100; i = i + 1) {}").unwrap();
        assert!(passes.get() > 10, "only {} passes", passes.get());
    }

    #[test]
    fn hosts_can_define_natives() {
        fn answer(_: &NativeContext<'_>, _: usize, _: usize) -> crate::natives::NativeResult {
            Ok(Value::Int(42))
        }
        let mut vm = VM::new(VmConfig::default(), Vec::new());
        vm.define_native("answer", answer);
        vm.interpret("var a = answer()").unwrap();
        assert_eq!(Some(Value::Int(42)), vm.global("a"));
    }

    #[test]
    fn slice_bounds_clamp() {
        let list = Value::list((0..5).map(Value::Int).collect());
        let sliced = slice(&list, &Value::Int(-2), &Value::Nil).unwrap();
        assert_eq!("[3, 4]", sliced.to_string());
        let sliced = slice(&list, &Value::Int(3), &Value::Int(1)).unwrap();
        assert_eq!("[]", sliced.to_string());
        let sliced = slice(&list, &Value::Nil, &Value::Int(99)).unwrap();
        assert_eq!("[0, 1, 2, 3, 4]", sliced.to_string());
    }
}
