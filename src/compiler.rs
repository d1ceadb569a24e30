//! Contains the blox parser and bytecode compiler.
//!
//! There is no syntax tree: the Pratt parser emits bytecode as soon as it recognizes each
//! construct. Every function being compiled gets a [FunctionCompiler] on a stack, so nested
//! functions can resolve variables declared by the functions around them (upvalues).
use std::ffi::OsStr;
use std::path::Path;
use std::rc::Rc;

use enum_map::{enum_map, EnumMap};

use crate::chunk::WrittenOpcode;
use crate::error::Diagnostic;
use crate::prelude::*;
use crate::scanner::{normalize_line_endings, Lexeme, Scanner, Token};
use crate::value::{Function, Object};

/////////////////////////////////////////// Public API ////////////////////////////////////////////

/// Compiles the given blox source code and, if successful, returns the top-level script as a
/// [Function]. Nested functions are constants inside its [Chunk].
///
/// ```
/// let script = blox::compiler::compile("print 1 + 2").unwrap();
/// assert_eq!(None, script.name);
/// assert_eq!(0, script.arity);
///
/// let error = blox::compiler::compile("print 1 +").unwrap_err();
/// assert_eq!(blox::InterpretStatus::CompileError, error.status());
/// ```
pub fn compile(source: &str) -> crate::Result<Function> {
    let source = normalize_line_endings(source);
    let parser = Parser::new(&source);
    let compiler = Compiler::new(parser);
    compiler.compile()
}

///////////////////////////////////// Implementation details //////////////////////////////////////

/// How many locals (and upvalues) one function can have: slots are one byte.
const MAX_LOCALS: usize = u8::MAX as usize + 1;

/// Precedence rules for [Token]s in blox.
///
/// Precedence rules have a well-defined partial ordering ([PartialOrd]), which is required for use
/// in the Pratt parsing algorithm.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Eq)]
enum Precedence {
    None,
    /// `=`
    Assignment,
    /// `or`
    Or,
    /// `and`
    And,
    /// `==` `!=`
    Equality,
    /// `<` `>` `<=` `>=`
    Comparison,
    /// + -
    Term,
    /// `*` `/` `%`
    Factor,
    /// `!` `-`
    Unary,
    /// `.` `()` `[]`
    Call,
    /// Literals, and groupings
    Primary,
}

/// A rule in the Pratt parser table. See [Compiler::parse_precedence()] for usage.
#[derive(Copy, Clone)]
struct ParserRule {
    prefix: Option<ParserFn>,
    infix: Option<ParserFn>,
    precedence: Precedence,
}

/// Any possible action taken from the parsing table. Actions take the entire compiler state, and
/// convert it, usually emitting bytecode.
type ParserFn = fn(&mut Compiler, bool) -> ();

/// Contains the parser state. For some strange reason, this also includes error status.
#[derive(Debug)]
struct Parser<'a> {
    scanner: Scanner<'a>,
    current: Lexeme<'a>,
    previous: Lexeme<'a>,
    had_error: bool,
    panic_mode: bool,
    diagnostics: Vec<Diagnostic>,
}

/// What kind of function body is being compiled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FunctionKind {
    /// The top-level code of a file.
    Script,
    Function,
    Method,
    /// A method named `init`: implicitly returns `this`.
    Initializer,
}

/// A local variable, alive in the current function's stack window.
#[derive(Debug)]
struct Local<'a> {
    name: &'a str,
    /// `None` while the variable's own initializer is being compiled.
    depth: Option<usize>,
    is_captured: bool,
    immutable: bool,
}

/// How a closure finds one of its captured variables when it is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpvalueDescriptor {
    /// A slot in the enclosing function (`is_local`) or an index into its upvalues.
    index: u8,
    is_local: bool,
    immutable: bool,
}

/// The innermost loop, for `break` and `continue`.
#[derive(Debug)]
struct LoopContext {
    /// Where `continue` jumps to.
    start: usize,
    /// Locals deeper than this belong to the loop body.
    scope_depth: usize,
    /// Jumps emitted by `break`, patched once the loop's end is known.
    breaks: Vec<usize>,
    /// Exception handlers opened inside the loop must be dropped when leaving it.
    try_depth: usize,
}

/// Per-function compiler state.
struct FunctionCompiler<'a> {
    function: Function,
    kind: FunctionKind,
    locals: Vec<Local<'a>>,
    upvalues: Vec<UpvalueDescriptor>,
    scope_depth: usize,
    loop_context: Option<LoopContext>,
    /// How many `try` blocks enclose the code being compiled.
    try_depth: usize,
}

/// Per-class compiler state.
struct ClassCompiler {
    has_superclass: bool,
}

/// Contains the compiler state, which includes the [Parser] and the functions being produced.
struct Compiler<'a> {
    parser: Parser<'a>,
    frames: Vec<FunctionCompiler<'a>>,
    classes: Vec<ClassCompiler>,
    rules: EnumMap<Token, ParserRule>,
}

impl Precedence {
    /// Returns the next higher level of precedence.
    ///
    /// # Panics
    ///
    /// Panics if trying to obtain a higher-level of precedence than the maximum,
    /// [Precedence::Primary], which is the precedence of literals and l-values.
    #[inline]
    fn higher_precedence(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call => Primary,
            Primary => panic!("Tried to get higher precedence than primary"),
        }
    }
}

impl ParserRule {
    /// Returns one level of precedence higher than the rule's precedence.
    /// See [Precedence::higher_precedence()].
    #[inline(always)]
    fn higher_precedence(&self) -> Precedence {
        self.precedence.higher_precedence()
    }
}

impl<'a> Parser<'a> {
    /// Creates a new parser for the given source code.
    fn new(source: &'a str) -> Parser<'a> {
        let mut scanner = Scanner::new(source);
        let error_token = scanner.make_sentinel("<before first token>");
        let mut parser = Parser {
            current: error_token.clone(),
            previous: error_token,
            scanner,
            had_error: false,
            panic_mode: false,
            diagnostics: Vec::new(),
        };
        // Prime the parser with the first (non-error) token.
        parser.advance();
        parser
    }

    /// Update self.previous and self.current such that they move one token further in the token
    /// stream.
    fn advance(&mut self) {
        self.previous = self.current.clone();

        // Get tokens until we get a non-error token.
        loop {
            self.current = self.scanner.scan_token();
            if self.current.token() != Token::Error {
                break;
            }

            self.error_at_current(self.current.text())
        }
    }

    /// Scan the next token. If the token is not of the desired type, an error is reported.
    fn consume(&mut self, desired_token: Token, message: &str) {
        if self.current.token() == desired_token {
            return self.advance();
        }

        self.error_at_current(message);
    }

    /// Return true if the current token is equal to the given token.
    fn check(&self, token: Token) -> bool {
        self.current.token() == token
    }

    /// Scan the next token. Advances if the token matches `desired_token`. Returns whether
    /// `desired_token` was matched.
    fn match_and_advance(&mut self, desired_token: Token) -> bool {
        if self.check(desired_token) {
            self.advance();
            return true;
        }
        false
    }

    /// Emit a compiler error, located at the previous [Lexeme]. In Pratt parsing, this is the
    /// handler you usually want to call, because the previous lexeme decided which [ParserRule]
    /// was accepted.
    fn error(&mut self, message: &str) {
        self.error_at(self.previous.clone(), message)
    }

    /// Emit a compiler error, located at the current [Lexeme].
    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current.clone(), message)
    }

    /// Emit a compiler error, located at the given [Lexeme].
    fn error_at(&mut self, lexeme: Lexeme<'a>, message: &str) {
        // *Attempt* to prevent a deluge of spurious syntax errors:
        if self.panic_mode {
            return;
        }

        self.panic_mode = true;
        self.had_error = true;

        let location = match lexeme.token() {
            Token::Eof => " at end".to_owned(),
            Token::Error => String::new(),
            Token::NewLine => " at end of line".to_owned(),
            _ => format!(" at '{}'", lexeme.text()),
        };
        let diagnostic = Diagnostic {
            line: lexeme.line(),
            location,
            message: message.to_owned(),
        };
        eprintln!("{diagnostic}");
        self.diagnostics.push(diagnostic);
    }

    /// Synchronize after being in panic mode.
    ///
    /// Tokens are discarded until the parser reaches something that looks like a statement
    /// boundary: just after a statement terminator, or just before a statement keyword.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.token() != Token::Eof {
            if matches!(self.previous.token(), Token::Semicolon | Token::NewLine) {
                return;
            }

            match self.current.token() {
                // Let the enclosing block close itself.
                Token::RightBrace
                | Token::Class
                | Token::Func
                | Token::Var
                | Token::Const
                | Token::For
                | Token::If
                | Token::While
                | Token::Print
                | Token::Return
                | Token::Import
                | Token::Try
                | Token::Raise => return,
                _ => (), // continue panicking
            }

            self.advance();
        }
    }
}

impl<'a> FunctionCompiler<'a> {
    fn new(kind: FunctionKind, name: Option<&str>) -> Self {
        // Slot zero holds the receiver for methods, and the callee itself otherwise. Giving it
        // an empty name makes it impossible to refer to.
        let receiver = match kind {
            FunctionKind::Method | FunctionKind::Initializer => "this",
            FunctionKind::Script | FunctionKind::Function => "",
        };

        FunctionCompiler {
            function: Function {
                name: name.map(Rc::from),
                ..Function::default()
            },
            kind,
            locals: vec![Local {
                name: receiver,
                depth: Some(0),
                is_captured: false,
                immutable: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
            loop_context: None,
            try_depth: 0,
        }
    }
}

impl<'a> Compiler<'a> {
    /// Creates a new compiler with the given [Parser].
    fn new(parser: Parser<'a>) -> Compiler<'a> {
        Compiler {
            parser,
            frames: vec![FunctionCompiler::new(FunctionKind::Script, None)],
            classes: Vec::new(),
            rules: parser_rules(),
        }
    }

    /// Takes ownership of the compiler, and returns the compiled script.
    fn compile(mut self) -> crate::Result<Function> {
        loop {
            self.skip_newlines();
            if self.match_and_advance(Token::Eof) {
                break;
            }
            self.declaration();
        }
        let (script, _) = self.end_compiler();

        if self.parser.had_error {
            return Err(InterpretationError::CompileError(self.parser.diagnostics));
        }

        tracing::debug!(
            code_bytes = script.chunk.len(),
            constants = script.chunk.constants.len(),
            "compiled script"
        );
        Ok(script)
    }

    /// Finishes the innermost function, returning it and the upvalues it captures.
    fn end_compiler(&mut self) -> (Function, Vec<UpvalueDescriptor>) {
        self.emit_return();
        let frame = self.frames.pop().expect("there is always a function being compiled");

        // Print a listing of the bytecode to manually inspect compiled output.
        if cfg!(feature = "print_code") && !self.parser.had_error {
            crate::debug::disassemble_chunk(&frame.function.chunk, frame.function.display_name());
        }

        (frame.function, frame.upvalues)
    }

    /// The core of the Pratt parsing algorithm.
    ///
    /// See: <https://en.wikipedia.org/wiki/Operator-precedence_parser#Pratt_parsing>
    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();

        let can_assign = precedence <= Precedence::Assignment;

        // First, figure out how to parse the prefix.
        if let Some(prefix_rule) = self.rule_from_previous().prefix {
            prefix_rule(self, can_assign);
        } else {
            self.parser.error("Expect expression.");
            return;
        }

        while precedence <= self.rule_from_current().precedence {
            // current is now previous:
            self.advance();
            let infix_rule = self
                .rule_from_previous()
                .infix
                .expect("a rule with a defined precedence must always have an infix rule");

            infix_rule(self, can_assign);
        }

        if can_assign && self.match_and_advance(Token::Equal) {
            self.parser.error("Invalid assignment target.");
        }
    }

    ///////////////////////////////////////// Variables ///////////////////////////////////////////

    /// Add the identifier text to the current chunk's constants table.
    fn identifier_constant(&mut self, name: &str) -> u8 {
        self.make_constant(name.into())
    }

    /// Consume the next identifier and declare it as a variable.
    /// Returns the constant for the identifier name, which is only meaningful for globals.
    fn parse_variable(&mut self, error_message: &str, immutable: bool) -> u8 {
        self.parser.consume(Token::Identifier, error_message);
        let name = self.parser.previous.text();
        self.declare_variable(name, immutable);
        if self.frame().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(name)
    }

    /// Records a local variable in the current scope. Globals are late-bound, so this does
    /// nothing at the top level.
    fn declare_variable(&mut self, name: &'a str, immutable: bool) {
        let frame = self.frame();
        if frame.scope_depth == 0 {
            return;
        }

        let redeclared = frame
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth.map_or(true, |depth| depth >= frame.scope_depth))
            .any(|local| local.name == name);
        if redeclared {
            self.parser
                .error("Already a variable with this name in this scope.");
        }

        self.add_local(name, immutable);
    }

    fn add_local(&mut self, name: &'a str, immutable: bool) {
        if self.frame().locals.len() == MAX_LOCALS {
            self.parser.error("Too many local variables in function.");
            return;
        }

        self.frame_mut().locals.push(Local {
            name,
            depth: None,
            is_captured: false,
            immutable,
        });
    }

    /// The most recent local is now fully initialized and can be referenced.
    fn mark_initialized(&mut self) {
        let frame = self.frame_mut();
        if frame.scope_depth == 0 {
            return;
        }
        let depth = frame.scope_depth;
        if let Some(local) = frame.locals.last_mut() {
            local.depth = Some(depth);
        }
    }

    /// Define a new variable, whose initial value is on top of the stack.
    fn define_variable(&mut self, global: u8, immutable: bool) {
        if self.frame().scope_depth > 0 {
            // The value on the stack *is* the local.
            self.mark_initialized();
            return;
        }

        let opcode = if immutable {
            OpCode::DefineConstGlobal
        } else {
            OpCode::DefineGlobal
        };
        self.emit_instruction(opcode).with_operand(global);
    }

    /// Looks for a local variable in the given function. Returns its slot and whether it's const.
    fn resolve_local(&mut self, frame_index: usize, name: &str) -> Option<(u8, bool)> {
        let (slot, local) = self.frames[frame_index]
            .locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, local)| local.name == name)?;

        let uninitialized = local.depth.is_none();
        let immutable = local.immutable;
        if uninitialized {
            self.parser
                .error("Can't read local variable in its own initializer.");
        }

        Some((slot as u8, immutable))
    }

    /// Looks for a variable in the functions enclosing the given one. When found, every
    /// function in between gets an upvalue for it. Returns the upvalue index in the given
    /// function.
    fn resolve_upvalue(&mut self, frame_index: usize, name: &str) -> Option<(u8, bool)> {
        if frame_index == 0 {
            return None;
        }
        let enclosing = frame_index - 1;

        if let Some((slot, immutable)) = self.resolve_local(enclosing, name) {
            self.frames[enclosing].locals[slot as usize].is_captured = true;
            let index = self.add_upvalue(frame_index, slot, true, immutable);
            return Some((index, immutable));
        }

        if let Some((upvalue, immutable)) = self.resolve_upvalue(enclosing, name) {
            let index = self.add_upvalue(frame_index, upvalue, false, immutable);
            return Some((index, immutable));
        }

        None
    }

    /// Adds an upvalue to the given function, reusing an existing one for the same variable.
    fn add_upvalue(&mut self, frame_index: usize, index: u8, is_local: bool, immutable: bool) -> u8 {
        let descriptor = UpvalueDescriptor {
            index,
            is_local,
            immutable,
        };
        let frame = &self.frames[frame_index];
        if let Some(existing) = frame.upvalues.iter().position(|&up| up == descriptor) {
            return existing as u8;
        }

        if frame.upvalues.len() == MAX_LOCALS {
            self.parser.error("Too many closure variables in function.");
            return 0;
        }

        let frame = &mut self.frames[frame_index];
        frame.upvalues.push(descriptor);
        frame.function.upvalue_count = frame.upvalues.len();
        (frame.upvalues.len() - 1) as u8
    }

    /// Parse a variable. This could either be a variable access or an assignment, depending on
    /// `can_assign` and the syntactic context.
    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let current = self.frames.len() - 1;
        let (get_op, set_op, arg, immutable) =
            if let Some((slot, immutable)) = self.resolve_local(current, name) {
                (OpCode::GetLocal, OpCode::SetLocal, slot, immutable)
            } else if let Some((index, immutable)) = self.resolve_upvalue(current, name) {
                (OpCode::GetUpvalue, OpCode::SetUpvalue, index, immutable)
            } else {
                let constant = self.identifier_constant(name);
                // Whether a global is const is only known at run time.
                (OpCode::GetGlobal, OpCode::SetGlobal, constant, false)
            };

        // Peek ahead and look if we're assigning.
        // This only works if we're parsing at a lower or equal precedence to assignment.
        if can_assign && self.match_and_advance(Token::Equal) {
            self.expression();
            if immutable {
                let constant = self.identifier_constant(name);
                self.emit_instruction(OpCode::AssignConst)
                    .with_operand(constant);
            } else {
                self.emit_instruction(set_op).with_operand(arg);
            }
        } else {
            self.emit_instruction(get_op).with_operand(arg);
        }
    }

    ////////////////////////////////////////// Scopes /////////////////////////////////////////////

    fn begin_scope(&mut self) {
        self.frame_mut().scope_depth += 1;
    }

    /// Leaves a scope, discarding (or hoisting, if captured) every local declared in it.
    fn end_scope(&mut self) {
        self.frame_mut().scope_depth -= 1;
        let depth = self.frame().scope_depth;

        while let Some(local) = self.frame().locals.last() {
            if local.depth.map_or(false, |d| d <= depth) {
                break;
            }
            let opcode = if local.is_captured {
                OpCode::CloseUpvalue
            } else {
                OpCode::Pop
            };
            self.emit_instruction(opcode);
            self.frame_mut().locals.pop();
        }
    }

    /// Emits the cleanup for jumping out of the innermost loop's body: drops the handlers of
    /// `try` blocks opened in the loop, then every local declared in the loop. The compiler's
    /// own bookkeeping is left alone, since code after the jump is still inside the scopes.
    fn emit_loop_exit(&mut self, scope_depth: usize, try_depth: usize) {
        for _ in try_depth..self.frame().try_depth {
            self.emit_instruction(OpCode::EndTry);
        }

        let exits: Vec<OpCode> = self
            .frame()
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth.map_or(true, |depth| depth > scope_depth))
            .map(|local| {
                if local.is_captured {
                    OpCode::CloseUpvalue
                } else {
                    OpCode::Pop
                }
            })
            .collect();
        for opcode in exits {
            self.emit_instruction(opcode);
        }
    }

    /// Starts a loop whose `continue` target is `start`. Returns the enclosing loop, which must
    /// be handed back to [Compiler::end_loop].
    fn begin_loop(&mut self, start: usize) -> Option<LoopContext> {
        let frame = self.frame_mut();
        let context = LoopContext {
            start,
            scope_depth: frame.scope_depth,
            breaks: Vec::new(),
            try_depth: frame.try_depth,
        };
        frame.loop_context.replace(context)
    }

    /// Patches every `break` of the innermost loop to jump here.
    fn end_loop(&mut self, enclosing: Option<LoopContext>) {
        let finished = std::mem::replace(&mut self.frame_mut().loop_context, enclosing);
        if let Some(context) = finished {
            for jump in context.breaks {
                self.patch_jump(jump);
            }
        }
    }

    /////////////////////////////////////// Declarations //////////////////////////////////////////

    /// Parse a declaration.
    fn declaration(&mut self) {
        if self.match_and_advance(Token::Class) {
            self.class_declaration();
        } else if self.match_and_advance(Token::Func) {
            self.func_declaration();
        } else if self.match_and_advance(Token::Var) {
            self.var_declaration(false);
        } else if self.match_and_advance(Token::Const) {
            self.var_declaration(true);
        } else if self.match_and_advance(Token::Import) {
            self.import_declaration();
        } else {
            self.statement();
        }

        if self.parser.panic_mode {
            self.parser.synchronize();
        }
    }

    /// Parse a variable declaration. Assumes `var` or `const` has already been consumed.
    fn var_declaration(&mut self, immutable: bool) {
        let global = self.parse_variable("Expect variable name.", immutable);

        if self.match_and_advance(Token::Equal) {
            self.expression();
        } else {
            if immutable {
                self.parser
                    .error_at_current("Const declaration requires an initializer.");
            }
            self.emit_instruction(OpCode::Nil);
        }

        self.end_statement("Expect newline or ';' after variable declaration.");
        self.define_variable(global, immutable);
    }

    /// Parse a function declaration. Assumes `func` has already been consumed.
    fn func_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.", false);
        let name = self.parser.previous.text();
        // A function may refer to itself, so it's initialized before its body is compiled.
        self.mark_initialized();
        self.function(FunctionKind::Function, name);
        self.define_variable(global, false);
    }

    /// Compiles a parameter list and body into a new function, and emits the code to create a
    /// closure of it. Assumes the name (if any) has been consumed.
    fn function(&mut self, kind: FunctionKind, name: &str) {
        self.frames.push(FunctionCompiler::new(kind, Some(name)));
        self.begin_scope();

        self.parser
            .consume(Token::LeftParen, "Expect '(' after function name.");
        if !self.check(Token::RightParen) {
            loop {
                self.frame_mut().function.arity += 1;
                if self.frame().function.arity > u8::MAX as usize {
                    self.parser
                        .error_at_current("Can't have more than 255 parameters.");
                }
                let constant = self.parse_variable("Expect parameter name.", false);
                self.define_variable(constant, false);
                if !self.match_and_advance(Token::Comma) {
                    break;
                }
            }
        }
        self.skip_newlines();
        self.parser
            .consume(Token::RightParen, "Expect ')' after parameters.");
        self.skip_newlines();
        self.parser
            .consume(Token::LeftBrace, "Expect '{' before function body.");
        self.block();

        // No end_scope(): the whole stack window goes away when the function returns.
        let (function, upvalues) = self.end_compiler();
        let constant = self.make_constant(Object::Function(Rc::new(function)).into());

        let mut written = self.emit_instruction(OpCode::Closure).with_operand(constant);
        for upvalue in upvalues {
            written = written
                .with_operand(upvalue.is_local as u8)
                .with_operand(upvalue.index);
        }
    }

    /// Parse a class declaration. Assumes `class` has already been consumed.
    fn class_declaration(&mut self) {
        self.parser.consume(Token::Identifier, "Expect class name.");
        let class_name = self.parser.previous.text();
        let name_constant = self.identifier_constant(class_name);
        self.declare_variable(class_name, false);

        self.emit_instruction(OpCode::Class)
            .with_operand(name_constant);
        self.define_variable(name_constant, false);

        self.classes.push(ClassCompiler {
            has_superclass: false,
        });

        if self.match_and_advance(Token::Less) {
            self.parser
                .consume(Token::Identifier, "Expect superclass name.");
            let superclass_name = self.parser.previous.text();
            self.named_variable(superclass_name, false);

            if class_name == superclass_name {
                self.parser.error("A class can't inherit from itself.");
            }

            // `super` is a local in a scope wrapped around the class body.
            self.begin_scope();
            self.add_local("super", false);
            self.define_variable(0, false);

            self.named_variable(class_name, false);
            self.emit_instruction(OpCode::Inherit);
            if let Some(class) = self.classes.last_mut() {
                class.has_superclass = true;
            }
        }

        // Keep the class on the stack while its methods are bound to it.
        self.named_variable(class_name, false);
        self.skip_newlines();
        self.parser
            .consume(Token::LeftBrace, "Expect '{' before class body.");
        loop {
            self.skip_newlines();
            if self.check(Token::RightBrace) || self.check(Token::Eof) {
                break;
            }
            self.method();
            if self.parser.panic_mode {
                self.parser.synchronize();
            }
        }
        self.parser
            .consume(Token::RightBrace, "Expect '}' after class body.");
        self.emit_instruction(OpCode::Pop);

        let class = self.classes.pop();
        if class.map_or(false, |class| class.has_superclass) {
            self.end_scope();
        }
    }

    /// Parse a method inside a class body. The `func` keyword is optional.
    fn method(&mut self) {
        self.match_and_advance(Token::Func);
        self.parser.consume(Token::Identifier, "Expect method name.");
        let name = self.parser.previous.text();
        let constant = self.identifier_constant(name);

        let kind = if name == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind, name);
        self.emit_instruction(OpCode::Method).with_operand(constant);
    }

    /// Parse `import "path"` or `import "path" as name`. Assumes `import` has been consumed.
    fn import_declaration(&mut self) {
        self.parser
            .consume(Token::StrLiteral, "Expect module path after 'import'.");
        let path = string_contents(self.parser.previous.text());

        let name = if self.match_and_advance(Token::As) {
            self.parser
                .consume(Token::Identifier, "Expect module name after 'as'.");
            self.parser.previous.text()
        } else {
            let stem = Path::new(path)
                .file_stem()
                .and_then(OsStr::to_str)
                .unwrap_or_default();
            if !is_identifier(stem) {
                self.parser
                    .error("Module file name is not an identifier; use 'import \"...\" as name'.");
            }
            stem
        };

        let path_constant = self.make_constant(path.into());
        self.emit_instruction(OpCode::Import)
            .with_operand(path_constant);

        self.declare_variable(name, false);
        let global = if self.frame().scope_depth > 0 {
            0
        } else {
            self.identifier_constant(name)
        };
        self.define_variable(global, false);
        self.end_statement("Expect newline or ';' after import.");
    }

    //////////////////////////////////////// Statements ///////////////////////////////////////////

    /// Parse a statement.
    fn statement(&mut self) {
        self.skip_newlines();
        if self.match_and_advance(Token::Print) {
            self.print_statement();
        } else if self.match_and_advance(Token::If) {
            self.if_statement();
        } else if self.match_and_advance(Token::While) {
            self.while_statement();
        } else if self.match_and_advance(Token::For) {
            self.for_statement();
        } else if self.match_and_advance(Token::Break) {
            self.break_statement();
        } else if self.match_and_advance(Token::Continue) {
            self.continue_statement();
        } else if self.match_and_advance(Token::Return) {
            self.return_statement();
        } else if self.match_and_advance(Token::Try) {
            self.try_statement();
        } else if self.match_and_advance(Token::Raise) {
            self.raise_statement();
        } else if self.match_and_advance(Token::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    /// Parse the declarations up to the closing brace. Assumes `{` has been consumed.
    fn block(&mut self) {
        loop {
            self.skip_newlines();
            if self.check(Token::RightBrace) || self.check(Token::Eof) {
                break;
            }
            self.declaration();
        }

        self.parser
            .consume(Token::RightBrace, "Expect '}' after block.");
    }

    /// Parse an expression.
    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    /// Parse an expression statement (e.g., assignments, function calls).
    fn expression_statement(&mut self) {
        self.expression();
        self.end_statement("Expect newline or ';' after expression.");
        // Statements have 0 stack effect, but expressions produce a thing on the stack, and we
        // need to get rid of it!
        self.emit_instruction(OpCode::Pop);
    }

    /// Parse a print statement. Assumes `print` has already been consumed.
    fn print_statement(&mut self) {
        self.expression();
        self.end_statement("Expect newline or ';' after value.");
        self.emit_instruction(OpCode::Print);
    }

    fn if_statement(&mut self) {
        self.parser
            .consume(Token::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.parser
            .consume(Token::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_instruction(OpCode::Pop);
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_instruction(OpCode::Pop);

        self.skip_newlines();
        if self.match_and_advance(Token::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().len();
        self.parser
            .consume(Token::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.parser
            .consume(Token::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_instruction(OpCode::Pop);

        let enclosing = self.begin_loop(loop_start);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_instruction(OpCode::Pop);
        self.end_loop(enclosing);
    }

    /// Parse a C-style `for (init; condition; increment) body`.
    fn for_statement(&mut self) {
        self.begin_scope();
        self.parser
            .consume(Token::LeftParen, "Expect '(' after 'for'.");
        if self.match_and_advance(Token::Semicolon) {
            // No initializer.
        } else if self.match_and_advance(Token::Var) {
            self.var_declaration(false);
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().len();
        let mut exit_jump = None;
        if !self.match_and_advance(Token::Semicolon) {
            self.expression();
            self.parser
                .consume(Token::Semicolon, "Expect ';' after loop condition.");

            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_instruction(OpCode::Pop);
        }

        if !self.match_and_advance(Token::RightParen) {
            // The increment runs after the body, so jump over it now and loop back to it later.
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk().len();
            self.expression();
            self.emit_instruction(OpCode::Pop);
            self.parser
                .consume(Token::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        let enclosing = self.begin_loop(loop_start);
        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_instruction(OpCode::Pop);
        }
        self.end_loop(enclosing);
        self.end_scope();
    }

    fn break_statement(&mut self) {
        let Some((scope_depth, try_depth)) = self.innermost_loop() else {
            self.parser.error("Can't use 'break' outside of a loop.");
            self.end_statement("Expect newline or ';' after 'break'.");
            return;
        };

        self.emit_loop_exit(scope_depth, try_depth);
        let jump = self.emit_jump(OpCode::Jump);
        if let Some(context) = self.frame_mut().loop_context.as_mut() {
            context.breaks.push(jump);
        }
        self.end_statement("Expect newline or ';' after 'break'.");
    }

    fn continue_statement(&mut self) {
        let Some((scope_depth, try_depth)) = self.innermost_loop() else {
            self.parser.error("Can't use 'continue' outside of a loop.");
            self.end_statement("Expect newline or ';' after 'continue'.");
            return;
        };

        self.emit_loop_exit(scope_depth, try_depth);
        let start = self
            .frame()
            .loop_context
            .as_ref()
            .map_or(0, |context| context.start);
        self.emit_loop(start);
        self.end_statement("Expect newline or ';' after 'continue'.");
    }

    fn return_statement(&mut self) {
        if self.frame().kind == FunctionKind::Script {
            self.parser.error("Can't return from top-level code.");
        }

        if self.at_end_of_statement() {
            self.end_statement("Expect newline or ';' after 'return'.");
            self.emit_return();
        } else {
            if self.frame().kind == FunctionKind::Initializer {
                self.parser
                    .error("Can't return a value from an initializer.");
            }
            self.expression();
            self.end_statement("Expect newline or ';' after return value.");
            self.emit_instruction(OpCode::Return);
        }
    }

    /// Parse `try { } except (name) { } finally { }`. Assumes `try` has been consumed.
    ///
    /// A handler finds the exception on top of the stack. Every path out of the statement goes
    /// through a "pending exception" slot: nil when nothing needs re-raising. The finally block,
    /// if any, runs next, and then a pending exception is raised again.
    fn try_statement(&mut self) {
        let handler_jump = self.emit_jump(OpCode::Try);
        self.frame_mut().try_depth += 1;
        self.skip_newlines();
        self.parser
            .consume(Token::LeftBrace, "Expect '{' after 'try'.");
        self.begin_scope();
        self.block();
        self.end_scope();
        self.frame_mut().try_depth -= 1;
        self.emit_instruction(OpCode::EndTry);

        self.skip_newlines();
        self.begin_scope();
        if self.match_and_advance(Token::Except) {
            let success_jump = self.emit_jump(OpCode::Jump);
            self.patch_jump(handler_jump);
            self.except_clause();

            // The success path fills the hidden exception slot and the pending slot.
            let join = self.emit_jump(OpCode::Jump);
            self.patch_jump(success_jump);
            self.emit_instruction(OpCode::Nil);
            self.emit_instruction(OpCode::Nil);
            self.patch_jump(join);

            self.skip_newlines();
            if self.match_and_advance(Token::Finally) {
                self.finally_block();
            }
        } else {
            self.emit_instruction(OpCode::Nil);
            let join = self.emit_jump(OpCode::Jump);
            self.patch_jump(handler_jump);
            self.patch_jump(join);
            self.add_local("", false);
            self.mark_initialized();

            self.skip_newlines();
            if self.match_and_advance(Token::Finally) {
                self.finally_block();
            } else {
                self.parser
                    .error_at_current("Expect 'except' or 'finally' after try block.");
            }
        }
        self.reraise_pending();
        self.end_scope();
    }

    /// Compiles `(name) { body }` after `except`, with the exception on top of the stack.
    ///
    /// The body runs under its own handler, so whatever it raises becomes the pending
    /// exception instead of skipping `finally`. Leaves two locals: the exception, no longer
    /// reachable by name, and the pending slot.
    fn except_clause(&mut self) {
        if self.match_and_advance(Token::LeftParen) {
            self.parser
                .consume(Token::Identifier, "Expect exception variable name.");
            let name = self.parser.previous.text();
            self.add_local(name, false);
            self.parser
                .consume(Token::RightParen, "Expect ')' after exception variable.");
        } else {
            self.add_local("", false);
        }
        self.mark_initialized();
        let exception = self.frame().locals.len() - 1;

        self.skip_newlines();
        self.parser
            .consume(Token::LeftBrace, "Expect '{' after except clause.");
        let handler_jump = self.emit_jump(OpCode::Try);
        self.frame_mut().try_depth += 1;
        self.begin_scope();
        self.block();
        self.end_scope();
        self.frame_mut().try_depth -= 1;
        self.emit_instruction(OpCode::EndTry);
        self.emit_instruction(OpCode::Nil);
        let handled = self.emit_jump(OpCode::Jump);
        self.patch_jump(handler_jump);
        self.patch_jump(handled);

        self.frame_mut().locals[exception].name = "";
        self.add_local("", false);
        self.mark_initialized();
    }

    /// Compiles `{ body }` after `finally`.
    fn finally_block(&mut self) {
        self.skip_newlines();
        self.parser
            .consume(Token::LeftBrace, "Expect '{' after 'finally'.");
        self.begin_scope();
        self.block();
        self.end_scope();
    }

    /// Raises the pending exception, the topmost local, unless it is nil.
    fn reraise_pending(&mut self) {
        let pending = (self.frame().locals.len() - 1) as u8;

        // if (pending != nil) raise pending
        self.emit_instruction(OpCode::GetLocal).with_operand(pending);
        self.emit_instruction(OpCode::Nil);
        self.emit_instruction(OpCode::Equal);
        let reraise = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_instruction(OpCode::Pop);
        let done = self.emit_jump(OpCode::Jump);
        self.patch_jump(reraise);
        self.emit_instruction(OpCode::Pop);
        self.emit_instruction(OpCode::GetLocal).with_operand(pending);
        self.emit_instruction(OpCode::Raise);
        self.patch_jump(done);
    }

    fn raise_statement(&mut self) {
        self.expression();
        self.end_statement("Expect newline or ';' after raised value.");
        self.emit_instruction(OpCode::Raise);
    }

    /// A statement ends at `;`, at the end of a line, or just before `}` or the end of input.
    fn end_statement(&mut self, message: &str) {
        if self.match_and_advance(Token::Semicolon) || self.match_and_advance(Token::NewLine) {
            return;
        }
        if self.check(Token::RightBrace) || self.check(Token::Eof) {
            return;
        }
        self.parser.error_at_current(message);
    }

    fn at_end_of_statement(&self) -> bool {
        matches!(
            self.parser.current.token(),
            Token::Semicolon | Token::NewLine | Token::RightBrace | Token::Eof
        )
    }

    /// Compiles comma-separated expressions up to `closing`, returning how many there were.
    /// Assumes the opening bracket has been consumed. Allows a trailing comma.
    fn comma_separated(&mut self, closing: Token, what: &str) -> u8 {
        let mut count: usize = 0;
        loop {
            self.skip_newlines();
            if self.check(closing) {
                break;
            }
            self.expression();
            if count == u8::MAX as usize {
                self.parser
                    .error(&format!("Can't have more than 255 {what}."));
            }
            count += 1;
            if !self.match_and_advance(Token::Comma) {
                break;
            }
        }
        self.skip_newlines();
        count.min(u8::MAX as usize) as u8
    }

    ///////////////////////////////////////// Emitting ////////////////////////////////////////////

    /// Appends [OpCode::Return] to current [Chunk]. Initializers return `this`.
    fn emit_return(&mut self) {
        if self.frame().kind == FunctionKind::Initializer {
            self.emit_instruction(OpCode::GetLocal).with_operand(0);
        } else {
            self.emit_instruction(OpCode::Nil);
        }
        self.emit_instruction(OpCode::Return);
    }

    /// Appends [OpCode::Constant] to current [Chunk], using the current value.
    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_instruction(OpCode::Constant).with_operand(index);
    }

    /// Emits a jump with a placeholder offset. Returns the offset to give to
    /// [Compiler::patch_jump].
    fn emit_jump(&mut self, opcode: OpCode) -> usize {
        self.emit_instruction(opcode).with_u16(u16::MAX)
    }

    /// Makes the jump at `offset` land on the next instruction to be emitted.
    fn patch_jump(&mut self, offset: usize) {
        // -2 to adjust for the jump offset itself.
        let jump = self.current_chunk().len() - offset - 2;
        let jump = u16::try_from(jump).unwrap_or_else(|_| {
            self.parser.error("Too much code to jump over.");
            u16::MAX
        });
        self.current_chunk().patch_u16(offset, jump);
    }

    /// Emits a backwards jump to `loop_start`.
    fn emit_loop(&mut self, loop_start: usize) {
        // +3 for the Loop instruction and its operand.
        let offset = self.current_chunk().len() + 3 - loop_start;
        let offset = u16::try_from(offset).unwrap_or_else(|_| {
            self.parser.error("Loop body too large.");
            u16::MAX
        });
        self.emit_instruction(OpCode::Loop).with_u16(offset);
    }

    /// Appends a new constant to the current [Chunk].
    ///
    /// # Error
    ///
    /// When the constant index is greater than 255 (and thus can no longer be represented as a
    /// u8), this signals a compiler error and returns `0u8`. The current [Chunk] can still be
    /// appended to, however, it is invalid, and should not be emitted as a valid program.
    fn make_constant(&mut self, value: Value) -> u8 {
        if let Some(index) = self.current_chunk().add_constant(value) {
            index
        } else {
            self.parser.error("Too many constants in one chunk.");
            0
        }
    }

    /// Writes an [OpCode] to the current [Chunk].
    /// Returns a [WrittenOpcode], with which you can write an operand.
    fn emit_instruction(&mut self, opcode: OpCode) -> WrittenOpcode {
        let line = self.line_number_of_prefix();
        self.current_chunk().write_opcode(opcode, line)
    }

    /// Writes two [OpCode] to the current [Chunk].
    fn emit_instructions(&mut self, op1: OpCode, op2: OpCode) -> WrittenOpcode {
        let line = self.line_number_of_prefix();
        self.current_chunk().write_opcode(op1, line);
        self.current_chunk().write_opcode(op2, line)
    }

    ///////////////////////////////////////// Aliases /////////////////////////////////////////////

    /// The function currently being compiled.
    #[inline(always)]
    fn frame(&self) -> &FunctionCompiler<'a> {
        self.frames
            .last()
            .expect("there is always a function being compiled")
    }

    #[inline(always)]
    fn frame_mut(&mut self) -> &mut FunctionCompiler<'a> {
        self.frames
            .last_mut()
            .expect("there is always a function being compiled")
    }

    /// Returns the current [Chunk].
    #[inline(always)]
    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.frame_mut().function.chunk
    }

    /// The scope depth and try depth of the innermost loop, if any.
    fn innermost_loop(&self) -> Option<(usize, usize)> {
        self.frame()
            .loop_context
            .as_ref()
            .map(|context| (context.scope_depth, context.try_depth))
    }

    /// Advance one token in scanner, such that:
    /// ```text
    /// (previous, current) = (current, scanner.next_token())
    /// ```
    #[inline(always)]
    fn advance(&mut self) {
        self.parser.advance()
    }

    /// Skips any newline tokens. Used wherever a line break can't end a statement.
    fn skip_newlines(&mut self) {
        while self.parser.match_and_advance(Token::NewLine) {}
    }

    /// Returns the line number of the prefix token, a.k.a., `self.parser.previous`.
    #[inline(always)]
    fn line_number_of_prefix(&self) -> usize {
        self.parser.previous.line()
    }

    /// Delegates to [Parser::check].
    #[inline(always)]
    fn check(&self, token: Token) -> bool {
        self.parser.check(token)
    }

    /// Delegates to [Parser::match_and_advance]. Returns true if the token was matched.
    #[inline(always)]
    fn match_and_advance(&mut self, desired_token: Token) -> bool {
        self.parser.match_and_advance(desired_token)
    }

    /// Returns the rule of the prefix in the process of being parsed.
    #[inline(always)]
    fn rule_from_previous(&self) -> ParserRule {
        self.rules[self.previous_token()]
    }

    /// Returns the rule of the upcoming token.
    #[inline(always)]
    fn rule_from_current(&self) -> ParserRule {
        self.rules[self.parser.current.token()]
    }

    /// Return the token (type) of the previous value. This is useful in prefix parser functions.
    #[inline(always)]
    fn previous_token(&self) -> Token {
        self.parser.previous.token()
    }
}

////////////////////////////////////////// Parser rules ///////////////////////////////////////////

/// Makes defining [ParserRule]s a bit cleaner looking.
macro_rules! rule {
    ($prefix:expr, $infix:expr, $precedence:expr) => {
        ParserRule {
            prefix: $prefix,
            infix: $infix,
            precedence: $precedence,
        }
    };
}

#[rustfmt::skip]
fn parser_rules() -> EnumMap<Token, ParserRule> {
    use Token::*;
    enum_map! {
        //                     Prefix             Infix              Precedence
        LeftParen    => rule!{ Some(grouping),    Some(call),        Precedence::Call },
        LeftBracket  => rule!{ Some(list),        Some(subscript),   Precedence::Call },
        LeftBrace    => rule!{ Some(dict),        None,              Precedence::None },
        Dot          => rule!{ None,              Some(dot),         Precedence::Call },
        Minus        => rule!{ Some(unary),       Some(binary),      Precedence::Term },
        Plus         => rule!{ None,              Some(binary),      Precedence::Term },
        Slash        => rule!{ None,              Some(binary),      Precedence::Factor },
        Star         => rule!{ None,              Some(binary),      Precedence::Factor },
        Percent      => rule!{ None,              Some(binary),      Precedence::Factor },
        Bang         => rule!{ Some(unary),       None,              Precedence::None },
        BangEqual    => rule!{ None,              Some(binary),      Precedence::Equality },
        EqualEqual   => rule!{ None,              Some(binary),      Precedence::Equality },
        Greater      => rule!{ None,              Some(binary),      Precedence::Comparison },
        GreaterEqual => rule!{ None,              Some(binary),      Precedence::Comparison },
        Less         => rule!{ None,              Some(binary),      Precedence::Comparison },
        LessEqual    => rule!{ None,              Some(binary),      Precedence::Comparison },
        Identifier   => rule!{ Some(variable),    None,              Precedence::None },
        StrLiteral   => rule!{ Some(string),      None,              Precedence::None },
        Int          => rule!{ Some(int),         None,              Precedence::None },
        Float        => rule!{ Some(float),       None,              Precedence::None },
        And          => rule!{ None,              Some(and),         Precedence::And },
        Or           => rule!{ None,              Some(or),          Precedence::Or },
        False        => rule!{ Some(literal),     None,              Precedence::None },
        Nil          => rule!{ Some(literal),     None,              Precedence::None },
        True         => rule!{ Some(literal),     None,              Precedence::None },
        Func         => rule!{ Some(lambda),      None,              Precedence::None },
        Super        => rule!{ Some(super_),      None,              Precedence::None },
        This         => rule!{ Some(this),        None,              Precedence::None },
        _            => rule!{ None,              None,              Precedence::None },
    }
}

/// Parse '(' as a prefix: a grouping, or a tuple when a comma follows the first item.
/// Assumes '(' has been consumed.
fn grouping(compiler: &mut Compiler, _can_assign: bool) {
    debug_assert_eq!(Token::LeftParen, compiler.previous_token());

    compiler.skip_newlines();
    if compiler.match_and_advance(Token::RightParen) {
        compiler
            .emit_instruction(OpCode::BuildTuple)
            .with_operand(0);
        return;
    }

    compiler.expression();
    compiler.skip_newlines();
    if compiler.match_and_advance(Token::Comma) {
        let rest = compiler.comma_separated(Token::RightParen, "tuple items");
        compiler
            .parser
            .consume(Token::RightParen, "Expect ')' after tuple items.");
        compiler
            .emit_instruction(OpCode::BuildTuple)
            .with_operand(rest.saturating_add(1));
        return;
    }

    compiler
        .parser
        .consume(Token::RightParen, "Expect ')' after expression.");
}

/// Parse a list literal. Assumes '[' has been consumed.
fn list(compiler: &mut Compiler, _can_assign: bool) {
    let count = compiler.comma_separated(Token::RightBracket, "items in a list literal");
    compiler
        .parser
        .consume(Token::RightBracket, "Expect ']' after list items.");
    compiler
        .emit_instruction(OpCode::BuildList)
        .with_operand(count);
}

/// Parse a dict literal `{ key: value, ... }`. Assumes '{' has been consumed.
fn dict(compiler: &mut Compiler, _can_assign: bool) {
    let mut count: usize = 0;
    loop {
        compiler.skip_newlines();
        if compiler.check(Token::RightBrace) {
            break;
        }
        compiler.expression();
        compiler
            .parser
            .consume(Token::Colon, "Expect ':' after dict key.");
        compiler.expression();
        if count == u8::MAX as usize {
            compiler
                .parser
                .error("Can't have more than 255 entries in a dict literal.");
        }
        count += 1;
        if !compiler.match_and_advance(Token::Comma) {
            break;
        }
    }
    compiler.skip_newlines();
    compiler
        .parser
        .consume(Token::RightBrace, "Expect '}' after dict entries.");
    compiler
        .emit_instruction(OpCode::BuildDict)
        .with_operand(count.min(u8::MAX as usize) as u8);
}

/// Parse a call's argument list. Assumes '(' has been consumed.
fn call(compiler: &mut Compiler, _can_assign: bool) {
    let arg_count = argument_list(compiler);
    compiler
        .emit_instruction(OpCode::Call)
        .with_operand(arg_count);
}

fn argument_list(compiler: &mut Compiler) -> u8 {
    let count = compiler.comma_separated(Token::RightParen, "arguments");
    compiler
        .parser
        .consume(Token::RightParen, "Expect ')' after arguments.");
    count
}

/// Parse `[index]` or `[start:end]` after an expression, possibly followed by an assignment.
fn subscript(compiler: &mut Compiler, can_assign: bool) {
    let mut is_slice = false;
    if compiler.match_and_advance(Token::Colon) {
        // Omitted start.
        compiler.emit_instruction(OpCode::Nil);
        is_slice = true;
    } else {
        compiler.expression();
        if compiler.match_and_advance(Token::Colon) {
            is_slice = true;
        }
    }

    if is_slice {
        if compiler.check(Token::RightBracket) {
            // Omitted end.
            compiler.emit_instruction(OpCode::Nil);
        } else {
            compiler.expression();
        }
    }
    compiler
        .parser
        .consume(Token::RightBracket, "Expect ']' after subscript.");

    if can_assign && compiler.match_and_advance(Token::Equal) {
        compiler.expression();
        compiler.emit_instruction(if is_slice {
            OpCode::SliceAssign
        } else {
            OpCode::IndexAssign
        });
    } else {
        compiler.emit_instruction(if is_slice {
            OpCode::Slice
        } else {
            OpCode::Index
        });
    }
}

/// Parse `.name` after an expression: a property access, an assignment or a method call.
fn dot(compiler: &mut Compiler, can_assign: bool) {
    compiler
        .parser
        .consume(Token::Identifier, "Expect property name after '.'.");
    let name = compiler.identifier_constant(compiler.parser.previous.text());

    if can_assign && compiler.match_and_advance(Token::Equal) {
        compiler.expression();
        compiler
            .emit_instruction(OpCode::SetProperty)
            .with_operand(name);
    } else if compiler.match_and_advance(Token::LeftParen) {
        let arg_count = argument_list(compiler);
        compiler
            .emit_instruction(OpCode::Invoke)
            .with_operand(name)
            .with_operand(arg_count);
    } else {
        compiler
            .emit_instruction(OpCode::GetProperty)
            .with_operand(name);
    }
}

/// Parse an Int literal as a prefix. Assumes the number has been consumed.
fn int(compiler: &mut Compiler, _can_assign: bool) {
    debug_assert_eq!(Token::Int, compiler.previous_token());
    match compiler.parser.previous.text().parse::<i64>() {
        Ok(value) => compiler.emit_constant(value.into()),
        Err(_) => compiler.parser.error("Integer literal is too large."),
    }
}

/// Parse a Float literal as a prefix. Assumes the number has been consumed.
fn float(compiler: &mut Compiler, _can_assign: bool) {
    debug_assert_eq!(Token::Float, compiler.previous_token());
    let value = compiler
        .parser
        .previous
        .text()
        .parse::<f64>()
        .expect("Internal error: Token::Float MUST parse as a float, but didn't?");
    compiler.emit_constant(value.into());
}

/// Parse an unary operator as a prefix. Assumes the operator has been consumed.
fn unary(compiler: &mut Compiler, _can_assign: bool) {
    let operator = compiler.previous_token();

    // Compile the operand, so that it's placed on the stack.
    compiler.parse_precedence(Precedence::Unary);

    match operator {
        Token::Bang => compiler.emit_instruction(OpCode::Not),
        Token::Minus => compiler.emit_instruction(OpCode::Negate),
        _ => unreachable!(),
    };
}

/// Parse a binary operator as an infix. Assumes the operator has been consumed.
fn binary(compiler: &mut Compiler, _can_assign: bool) {
    let operator = compiler.previous_token();
    let rule = compiler.rules[operator];

    compiler.parse_precedence(rule.higher_precedence());
    match operator {
        Token::BangEqual => compiler.emit_instructions(OpCode::Equal, OpCode::Not),
        Token::EqualEqual => compiler.emit_instruction(OpCode::Equal),
        Token::Greater => compiler.emit_instruction(OpCode::Greater),
        Token::GreaterEqual => compiler.emit_instruction(OpCode::GreaterEqual),
        Token::Less => compiler.emit_instruction(OpCode::Less),
        Token::LessEqual => compiler.emit_instruction(OpCode::LessEqual),
        Token::Plus => compiler.emit_instruction(OpCode::Add),
        Token::Minus => compiler.emit_instruction(OpCode::Subtract),
        Token::Star => compiler.emit_instruction(OpCode::Multiply),
        Token::Slash => compiler.emit_instruction(OpCode::Divide),
        Token::Percent => compiler.emit_instruction(OpCode::Modulo),
        _ => unreachable!(),
    };
}

/// Parse `and`: if the left side is falsy, it is the result.
fn and(compiler: &mut Compiler, _can_assign: bool) {
    let end_jump = compiler.emit_jump(OpCode::JumpIfFalse);
    compiler.emit_instruction(OpCode::Pop);
    compiler.parse_precedence(Precedence::And);
    compiler.patch_jump(end_jump);
}

/// Parse `or`: if the left side is truthy, it is the result.
fn or(compiler: &mut Compiler, _can_assign: bool) {
    let else_jump = compiler.emit_jump(OpCode::JumpIfFalse);
    let end_jump = compiler.emit_jump(OpCode::Jump);

    compiler.patch_jump(else_jump);
    compiler.emit_instruction(OpCode::Pop);
    compiler.parse_precedence(Precedence::Or);
    compiler.patch_jump(end_jump);
}

/// Parse a keyword literal as a prefix. Assumes the keyword has been consumed.
fn literal(compiler: &mut Compiler, _can_assign: bool) {
    match compiler.previous_token() {
        Token::False => compiler.emit_instruction(OpCode::False),
        Token::Nil => compiler.emit_instruction(OpCode::Nil),
        Token::True => compiler.emit_instruction(OpCode::True),
        _ => unreachable!(),
    };
}

/// Parse a string literal. Add it to the constant pool.
fn string(compiler: &mut Compiler, _can_assign: bool) {
    debug_assert_eq!(Token::StrLiteral, compiler.previous_token());
    let contents = unescape(string_contents(compiler.parser.previous.text()));
    compiler.emit_constant(contents.into());
}

/// Parse a variable. It can be either a variable access or assignment, which is why `can_assign`
/// is required by all callbacks!
fn variable(compiler: &mut Compiler, can_assign: bool) {
    let name = compiler.parser.previous.text();
    compiler.named_variable(name, can_assign);
}

/// Parse an anonymous function: `func (params) { body }`. Assumes `func` has been consumed.
fn lambda(compiler: &mut Compiler, _can_assign: bool) {
    compiler.function(FunctionKind::Function, "lambda");
}

fn this(compiler: &mut Compiler, _can_assign: bool) {
    if compiler.classes.is_empty() {
        compiler.parser.error("Can't use 'this' outside of a class.");
        return;
    }
    compiler.named_variable("this", false);
}

/// Parse `super.name` or `super.name(args)`. Assumes `super` has been consumed.
fn super_(compiler: &mut Compiler, _can_assign: bool) {
    match compiler.classes.last() {
        None => compiler
            .parser
            .error("Can't use 'super' outside of a class."),
        Some(class) if !class.has_superclass => compiler
            .parser
            .error("Can't use 'super' in a class with no superclass."),
        Some(_) => (),
    }

    compiler
        .parser
        .consume(Token::Dot, "Expect '.' after 'super'.");
    compiler
        .parser
        .consume(Token::Identifier, "Expect superclass method name.");
    let name = compiler.identifier_constant(compiler.parser.previous.text());

    compiler.named_variable("this", false);
    if compiler.match_and_advance(Token::LeftParen) {
        let arg_count = argument_list(compiler);
        compiler.named_variable("super", false);
        compiler
            .emit_instruction(OpCode::SuperInvoke)
            .with_operand(name)
            .with_operand(arg_count);
    } else {
        compiler.named_variable("super", false);
        compiler
            .emit_instruction(OpCode::GetSuper)
            .with_operand(name);
    }
}

///////////////////////////////////////////// Helpers /////////////////////////////////////////////

/// Strips the quotes from a string literal's lexeme.
fn string_contents(literal: &str) -> &str {
    debug_assert!(literal.len() >= 2);
    debug_assert!(literal.starts_with('"'));
    debug_assert!(literal.ends_with('"'));
    &literal[1..literal.len() - 1]
}

/// Replaces backslash escapes. Unknown escapes are kept as written.
fn unescape(contents: &str) -> String {
    let mut result = String::with_capacity(contents.len());
    let mut chars = contents.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            result.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => result.push('\n'),
            Some('t') => result.push('\t'),
            Some('r') => result.push('\r'),
            Some('0') => result.push('\0'),
            Some('"') => result.push('"'),
            Some('\\') => result.push('\\'),
            Some(other) => {
                result.push('\\');
                result.push(other);
            }
            None => result.push('\\'),
        }
    }
    result
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .map_or(false, |c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

////////////////////////////////////////////// Tests //////////////////////////////////////////////

#[cfg(test)]
mod test {
    use super::*;

    /// Compiles the source and returns the messages of every compile error.
    fn errors(source: &str) -> Vec<String> {
        match compile(source) {
            Ok(_) => Vec::new(),
            Err(InterpretationError::CompileError(diagnostics)) => {
                diagnostics.into_iter().map(|d| d.message).collect()
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    fn opcodes(function: &Function) -> Vec<OpCode> {
        let chunk = &function.chunk;
        let mut offset = 0;
        let mut result = Vec::new();
        while offset < chunk.len() {
            let opcode = chunk.get(offset).unwrap().as_opcode().unwrap();
            result.push(opcode);
            offset = crate::debug::next_offset(chunk, offset);
        }
        result
    }

    fn first_function(chunk: &Chunk) -> Rc<Function> {
        chunk
            .constants
            .iter()
            .find_map(|value| match value {
                Value::Obj(Object::Function(f)) => Some(f.clone()),
                _ => None,
            })
            .expect("a function constant")
    }

    #[test]
    fn precedence_confidence_check() {
        // High-level precedence (C-like)
        assert!(Precedence::Assignment < Precedence::Or);
        assert!(Precedence::Or < Precedence::And);
        assert!(Precedence::And < Precedence::Equality);
        assert!(Precedence::Equality < Precedence::Comparison);

        // PEDMAS
        // () has greater precedence than */
        assert!(Precedence::Call > Precedence::Factor);
        // */ has greater precedence than +-
        assert!(Precedence::Factor > Precedence::Term);

        // ``and should be one level of precedence higher than `or`
        assert_eq!(Precedence::And, Precedence::Or.higher_precedence());
        assert_eq!(Precedence::Factor, Precedence::Term.higher_precedence());
    }

    #[test]
    fn compiling_is_deterministic() {
        let source = "
            var greeting = \"hello\"
            func shout(word) { return word * 2 }
            class Box { init(v) { this.v = v } get() { return this.v } }
            print shout(greeting) + str(Box(3).get())
        ";
        let first = compile(source).unwrap();
        let second = compile(source).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn factor_binds_tighter_than_term() {
        use OpCode::*;
        let script = compile("print 1 + 2 * 3").unwrap();
        assert_eq!(
            vec![Constant, Constant, Constant, Multiply, Add, Print, Nil, Return],
            opcodes(&script)
        );
    }

    #[test]
    fn scope_exit_pops_or_closes_in_reverse_order() {
        use OpCode::*;
        let script = compile("{ var a = 1; var b = 2; func f() { return a; } }").unwrap();
        assert_eq!(
            vec![Constant, Constant, Closure, Pop, Pop, CloseUpvalue, Nil, Return],
            opcodes(&script)
        );
    }

    #[test]
    fn closures_describe_their_upvalues() {
        let script = compile(
            "func outer() { var x = 1; func middle() { func inner() { return x; } return inner; } return middle; }",
        )
        .unwrap();
        let outer = first_function(&script.chunk);
        assert_eq!(0, outer.upvalue_count);

        let middle = first_function(&outer.chunk);
        // middle captures outer's local, and inner captures middle's upvalue.
        assert_eq!(1, middle.upvalue_count);
    }

    #[test]
    fn syntax_errors_are_all_reported() {
        assert_eq!(
            vec!["Expect expression.", "Expect expression."],
            errors("print ;\nvar x = ;\nprint 1")
        );
        assert_eq!(vec!["Invalid assignment target."], errors("1 + 2 = 3"));
        assert_eq!(vec!["Unexpected character."], errors("print @"));
        assert_eq!(vec!["Unterminated string."], errors("print \"oops"));
    }

    #[test]
    fn semantic_errors() {
        assert_eq!(
            vec!["Can't return from top-level code."],
            errors("return 1")
        );
        assert_eq!(
            vec!["Can't return a value from an initializer."],
            errors("class A { init() { return 1 } }")
        );
        assert_eq!(
            vec!["A class can't inherit from itself."],
            errors("class A < A {}")
        );
        assert_eq!(
            vec!["Already a variable with this name in this scope."],
            errors("{ var a = 1; var a = 2; }")
        );
        assert_eq!(
            vec!["Can't use 'break' outside of a loop."],
            errors("break")
        );
        assert_eq!(
            vec!["Can't use 'continue' outside of a loop."],
            errors("func f() { continue }")
        );
        assert_eq!(
            vec!["Can't read local variable in its own initializer."],
            errors("{ var a = a; }")
        );
        assert_eq!(vec!["Can't use 'this' outside of a class."], errors("print this"));
        assert_eq!(
            vec!["Can't use 'super' in a class with no superclass."],
            errors("class A { f() { super.f() } }")
        );
        assert_eq!(
            vec!["Expect 'except' or 'finally' after try block."],
            errors("try { }")
        );
    }

    #[test]
    fn shadowing_in_an_inner_scope_is_fine() {
        assert!(errors("{ var a = 1; { var a = 2; } }").is_empty());
    }

    #[test]
    fn too_many_parameters() {
        let params: Vec<String> = (0..256).map(|i| format!("p{i}")).collect();
        let source = format!("func f({}) {{}}", params.join(", "));
        assert_eq!(vec!["Can't have more than 255 parameters."], errors(&source));
    }

    #[test]
    fn too_many_constants() {
        let body: String = (0..300).map(|i| format!("{i}\n")).collect();
        let errors = errors(&body);
        assert!(!errors.is_empty());
        assert!(errors
            .iter()
            .all(|message| message == "Too many constants in one chunk."));
    }

    #[test]
    fn statements_end_at_newlines_or_semicolons() {
        assert!(errors("var a = 1\nvar b = 2; print a + b\n").is_empty());
        assert!(errors("if (true) {\n print 1\n}\nelse {\n print 2\n}").is_empty());
        assert!(errors("print [\n 1,\n 2,\n]").is_empty());
        assert_eq!(
            vec!["Expect newline or ';' after value."],
            errors("print 1 2")
        );
    }

    #[test]
    fn unescaping() {
        assert_eq!("a\nb\t\"c\"\\", unescape(r#"a\nb\t\"c\"\\"#));
        assert_eq!("\\q", unescape(r"\q"));
    }
}
