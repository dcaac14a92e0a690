//! Single-pass compiler: Pratt-parses the token stream from `lexer` and
//! emits bytecode directly into a `Chunk`, while tracking lexical scope
//! (locals, upvalues, class/method context) as it goes. There is no
//! intermediate AST.

use tracing::debug;

use crate::chunk::{Chunk, OpCode};
use crate::gc::Heap;
use crate::lexer::{Lexer, Token, TokenKind};
use crate::object::{Obj, ObjFunction, ObjKind};
use crate::value::Value;
use crate::error::CompileError;

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_PARAMS: usize = 8;

#[derive(Clone, Copy, PartialEq, PartialOrd)]
#[repr(u8)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call => Precedence::Primary,
            Precedence::Primary => Precedence::Primary,
        }
    }
}

fn infix_precedence(kind: TokenKind) -> Precedence {
    use TokenKind::*;
    match kind {
        Or => Precedence::Or,
        And => Precedence::And,
        BangEqual | EqualEqual => Precedence::Equality,
        Greater | GreaterEqual | Less | LessEqual => Precedence::Comparison,
        Plus | Minus => Precedence::Term,
        Star | Slash => Precedence::Factor,
        LeftParen | Dot => Precedence::Call,
        _ => Precedence::None,
    }
}

#[derive(Clone, Copy, PartialEq)]
enum FunctionType {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local {
    name: String,
    /// `None` means "declared but not yet defined" (depth == -1 in the
    /// reference implementation): reading it is an error.
    depth: Option<u32>,
    is_captured: bool,
}

#[derive(Clone, Copy)]
struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

/// Per-function compiler state. The reference implementation chains these
/// via an `enclosing` pointer; here they live on an explicit `Vec` stack
/// inside `Compiler`, which sidesteps a self-referential struct while
/// preserving the same enclosing/nested relationship (the previous entry in
/// the vec is always the enclosing function).
struct FunctionScope {
    function: ObjFunction,
    function_type: FunctionType,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: u32,
}

impl FunctionScope {
    fn new(function_type: FunctionType, name: Option<Obj>) -> Self {
        // Slot 0 is reserved: the receiver in methods/initializers, nameless
        // (the call target) otherwise.
        let receiver_name = if matches!(function_type, FunctionType::Method | FunctionType::Initializer) {
            "this"
        } else {
            ""
        };
        FunctionScope {
            function: ObjFunction::new(name),
            function_type,
            locals: vec![Local {
                name: receiver_name.to_string(),
                depth: Some(0),
                is_captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

struct ClassScope {
    has_superclass: bool,
}

pub struct Compiler<'heap, 'src> {
    heap: &'heap mut Heap,
    lexer: Lexer<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    scopes: Vec<FunctionScope>,
    classes: Vec<ClassScope>,
    /// Upvalue descriptors for the function `end_function` most recently
    /// popped, awaiting emission right after the `CLOSURE` opcode that will
    /// build it in the *enclosing* function's chunk.
    pending_upvalues: Vec<UpvalueDesc>,
}

/// Compiles `source` into a top-level function (the module body), or
/// returns every compile error encountered. Parsing does not stop at the
/// first error: the parser synchronizes at statement boundaries so later
/// errors are also reported, but no function is returned if any occurred.
pub fn compile(source: &str, heap: &mut Heap) -> Result<Obj, Vec<CompileError>> {
    let mut compiler = Compiler {
        heap,
        lexer: Lexer::new(source),
        previous: Token {
            kind: TokenKind::Error,
            lexeme: "",
            line: 0,
        },
        current: Token {
            kind: TokenKind::Error,
            lexeme: "",
            line: 0,
        },
        had_error: false,
        panic_mode: false,
        errors: Vec::new(),
        scopes: vec![FunctionScope::new(FunctionType::Script, None)],
        classes: Vec::new(),
        pending_upvalues: Vec::new(),
    };

    compiler.advance();
    while !compiler.match_token(TokenKind::Eof) {
        compiler.declaration();
    }

    let function = compiler.end_function();
    if compiler.had_error {
        Err(compiler.errors)
    } else {
        debug!(target: "luma_core::compiler", bytes = function.chunk.len(), "compiled top-level function");
        Ok(compiler.heap.allocate(ObjKind::Function(function)))
    }
}

impl<'heap, 'src> Compiler<'heap, 'src> {
    // ---- token stream plumbing -------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.lexer.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            self.error_at_current(self.current.lexeme);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current;
        self.error_at(token, message);
    }

    fn error(&mut self, message: &str) {
        let token = self.previous;
        self.error_at(token, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let lexeme = if token.kind == TokenKind::Eof {
            None
        } else {
            Some(token.lexeme.to_string())
        };
        self.errors.push(CompileError {
            line: token.line,
            lexeme,
            message: message.to_string(),
        });
    }

    /// Statement-boundary recovery: skip tokens until one that plausibly
    /// starts a fresh statement, so later errors in the same source still
    /// get reported.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ---- scope / function accessors --------------------------------------------

    fn scope(&mut self) -> &mut FunctionScope {
        self.scopes.last_mut().expect("at least the script scope")
    }

    fn chunk(&mut self) -> &mut Chunk {
        &mut self.scope().function.chunk
    }

    fn line(&self) -> u32 {
        self.previous.line
    }

    // ---- bytecode emission -------------------------------------------------

    fn emit_op(&mut self, op: OpCode) {
        let line = self.line();
        self.chunk().write_op(op, line);
    }

    fn emit_u8(&mut self, byte: u8) {
        let line = self.line();
        self.chunk().write_u8(byte, line);
    }

    fn emit_op_u8(&mut self, op: OpCode, operand: u8) {
        self.emit_op(op);
        self.emit_u8(operand);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        let line = self.line();
        self.chunk().write_u16_placeholder(line)
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.chunk().len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        self.chunk().patch_u16(offset, jump as u16);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.chunk().len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        let line = self.line();
        self.chunk().write_u8((offset >> 8) as u8, line);
        self.chunk().write_u8((offset & 0xff) as u8, line);
    }

    fn emit_return(&mut self) {
        if self.scope().function_type == FunctionType::Initializer {
            // `init` implicitly returns `this` (slot 0).
            self.emit_op_u8(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        match self.chunk().add_constant(value) {
            Some(idx) => idx,
            None => {
                self.error("Too many constants in one chunk.");
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let idx = self.make_constant(value);
        self.emit_op_u8(OpCode::Constant, idx);
    }

    fn identifier_constant(&mut self, token: Token<'src>) -> u8 {
        let interned = self.heap.intern_string(token.lexeme);
        self.make_constant(Value::Obj(interned))
    }

    // ---- scopes -------------------------------------------------------------

    fn begin_scope(&mut self) {
        self.scope().scope_depth += 1;
    }

    /// Pops locals whose depth exceeds the new scope depth. Each one emits
    /// `CLOSE_UPVALUE` if it was captured by a closure, or `POP` otherwise.
    fn end_scope(&mut self) {
        self.scope().scope_depth -= 1;
        let depth = self.scope().scope_depth;
        while let Some(local) = self.scope().locals.last() {
            if local.depth.map_or(false, |d| d > depth) {
                if local.is_captured {
                    self.emit_op(OpCode::CloseUpvalue);
                } else {
                    self.emit_op(OpCode::Pop);
                }
                self.scope().locals.pop();
            } else {
                break;
            }
        }
    }

    // ---- variables ------------------------------------------------------------

    fn declare_variable(&mut self) {
        if self.scope().scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme.to_string();
        let depth = self.scope().scope_depth;
        for local in self.scope().locals.iter().rev() {
            if local.depth.map_or(false, |d| d < depth) {
                break;
            }
            if local.name == name {
                self.error("Already a variable with this name in this scope.");
            }
        }
        self.add_local(name);
    }

    fn add_local(&mut self, name: String) {
        if self.scope().locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.scope().locals.push(Local {
            name,
            depth: None,
            is_captured: false,
        });
    }

    fn mark_initialized(&mut self) {
        if self.scope().scope_depth == 0 {
            return;
        }
        let depth = self.scope().scope_depth;
        if let Some(local) = self.scope().locals.last_mut() {
            local.depth = Some(depth);
        }
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.scope().scope_depth > 0 {
            return 0;
        }
        let token = self.previous;
        self.identifier_constant(token)
    }

    fn define_variable(&mut self, global: u8) {
        if self.scope().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op_u8(OpCode::DefineGlobal, global);
    }

    /// Resolves `name` against scope `depth` (an index into `self.scopes`,
    /// counting from the outermost). Returns the local slot if found there.
    fn resolve_local(&mut self, scope_idx: usize, name: &str) -> Option<u8> {
        let locals = &self.scopes[scope_idx].locals;
        for (i, local) in locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth.is_none() {
                    self.error("Can't read local variable in its own initializer.");
                }
                return Some(i as u8);
            }
        }
        None
    }

    /// Adds (or reuses) an upvalue descriptor on scope `scope_idx`,
    /// deduplicated by `(index, is_local)`.
    fn add_upvalue(&mut self, scope_idx: usize, index: u8, is_local: bool) -> u8 {
        let upvalues = &mut self.scopes[scope_idx].upvalues;
        for (i, existing) in upvalues.iter().enumerate() {
            if existing.index == index && existing.is_local == is_local {
                return i as u8;
            }
        }
        if upvalues.len() >= MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        upvalues.push(UpvalueDesc { index, is_local });
        self.scopes[scope_idx].function.upvalue_count = upvalues.len() as u8;
        (upvalues.len() - 1) as u8
    }

    /// Walks the enclosing-scope chain looking for `name`. Every
    /// intermediate function along the way acquires its own upvalue
    /// ("flattening"): a deeply nested capture is threaded down one hop at
    /// a time rather than reaching directly into a grandparent's locals, so
    /// each closure stays valid independent of when outer frames return.
    fn resolve_upvalue(&mut self, scope_idx: usize, name: &str) -> Option<u8> {
        if scope_idx == 0 {
            return None;
        }
        let enclosing = scope_idx - 1;
        if let Some(local_slot) = self.resolve_local(enclosing, name) {
            self.scopes[enclosing].locals[local_slot as usize].is_captured = true;
            return Some(self.add_upvalue(scope_idx, local_slot, true));
        }
        if let Some(upvalue_slot) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(scope_idx, upvalue_slot, false));
        }
        None
    }

    fn named_variable(&mut self, token: Token<'src>, can_assign: bool) {
        let scope_idx = self.scopes.len() - 1;
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(scope_idx, token.lexeme) {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(slot) = self.resolve_upvalue(scope_idx, token.lexeme) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, slot)
        } else {
            let idx = self.identifier_constant(token);
            (OpCode::GetGlobal, OpCode::SetGlobal, idx)
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op_u8(set_op, arg);
        } else {
            self.emit_op_u8(get_op, arg);
        }
    }

    // ---- declarations ---------------------------------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");

        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        self.function(FunctionType::Function);
        self.define_variable(global);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous;
        let name_constant = self.identifier_constant(class_name);
        self.declare_variable();

        self.emit_op_u8(OpCode::Class, name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassScope {
            has_superclass: false,
        });

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            let superclass_token = self.previous;
            self.named_variable(superclass_token, false);

            if superclass_token.lexeme == class_name.lexeme {
                self.error("A class can't inherit from itself.");
            }

            self.begin_scope();
            self.add_local("super".to_string());
            self.define_variable(0);

            self.named_variable(class_name, false);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop); // the class value pushed by `named_variable` above.

        let class_scope = self.classes.pop().unwrap();
        if class_scope.has_superclass {
            self.end_scope();
        }
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let method_name = self.previous;
        let name_constant = self.identifier_constant(method_name);

        let function_type = if method_name.lexeme == "init" {
            FunctionType::Initializer
        } else {
            FunctionType::Method
        };
        self.function(function_type);
        self.emit_op_u8(OpCode::Method, name_constant);
    }

    // ---- functions --------------------------------------------------------

    fn function(&mut self, function_type: FunctionType) {
        let name_token = self.previous;
        debug!(target: "luma_core::compiler", name = name_token.lexeme, depth = self.scopes.len(), "entering nested function");
        let name_obj = self.heap.intern_string(name_token.lexeme);
        self.scopes.push(FunctionScope::new(function_type, Some(name_obj)));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                let arity = self.scope().function.arity as usize + 1;
                if arity > MAX_PARAMS {
                    self.error_at_current("Can't have more than 8 parameters.");
                } else {
                    self.scope().function.arity = arity as u8;
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let function = self.end_function();
        let upvalue_count = function.upvalue_count;
        let fn_obj = self.heap.allocate(ObjKind::Function(function));
        let constant = self.make_constant(Value::Obj(fn_obj));
        self.emit_op_u8(OpCode::Closure, constant);

        // Popped off `self.upvalues_for_last_scope` by `end_function`.
        for upvalue in self.pending_upvalues.drain(..) {
            self.emit_u8(if upvalue.is_local { 1 } else { 0 });
            self.emit_u8(upvalue.index);
        }
        debug_assert_eq!(self.pending_upvalues.len(), 0);
        let _ = upvalue_count;
    }

    /// Pops the innermost `FunctionScope`, emits the implicit trailing
    /// return, and stashes its upvalue descriptors in `pending_upvalues` for
    /// the caller (`function`, or top-level `compile`) to emit after the
    /// `CLOSURE` opcode.
    fn end_function(&mut self) -> ObjFunction {
        self.emit_return();
        let scope = self.scopes.pop().expect("scope stack never empties");
        self.pending_upvalues = scope.upvalues;
        scope.function
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    // ---- statements -------------------------------------------------------

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk().len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");

        if self.match_token(TokenKind::Semicolon) {
            // No initializer.
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk().len();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.chunk().len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.scopes.len() == 1 {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.scope().function_type == FunctionType::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    // ---- expressions --------------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        if !self.prefix(self.previous.kind, can_assign) {
            self.error("Expect expression.");
            return;
        }

        while precedence <= infix_precedence(self.current.kind) {
            self.advance();
            self.infix(self.previous.kind, can_assign);
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn prefix(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        use TokenKind::*;
        match kind {
            LeftParen => self.grouping(),
            Minus | Bang => self.unary(),
            Number => self.number(),
            String => self.string(),
            Identifier => self.variable(can_assign),
            Nil | True | False => self.literal(),
            This => self.this_expr(),
            Super => self.super_expr(),
            _ => return false,
        }
        true
    }

    fn infix(&mut self, kind: TokenKind, can_assign: bool) {
        use TokenKind::*;
        match kind {
            Minus | Plus | Star | Slash | BangEqual | EqualEqual | Greater | GreaterEqual
            | Less | LessEqual => self.binary(),
            And => self.and(),
            Or => self.or(),
            LeftParen => self.call(),
            Dot => self.dot(can_assign),
            _ => unreachable!("not an infix operator: {:?}", kind),
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn number(&mut self) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self) {
        let obj = self.heap.intern_string(self.previous.lexeme);
        self.emit_constant(Value::Obj(obj));
    }

    fn literal(&mut self) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::True => self.emit_op(OpCode::True),
            _ => unreachable!(),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let token = self.previous;
        self.named_variable(token, can_assign);
    }

    fn this_expr(&mut self) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        let token = self.previous;
        self.named_variable(token, false);
    }

    fn super_expr(&mut self) {
        if self.classes.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !self.classes.last().unwrap().has_superclass {
            self.error("Can't use 'super' in a class with no superclass.");
        }

        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let method_name = self.previous;
        let name_constant = self.identifier_constant(method_name);

        let this_token = Token {
            kind: TokenKind::This,
            lexeme: "this",
            line: method_name.line,
        };
        let super_token = Token {
            kind: TokenKind::Super,
            lexeme: "super",
            line: method_name.line,
        };

        if self.match_token(TokenKind::LeftParen) {
            self.named_variable(this_token, false);
            let argc = self.argument_list();
            self.named_variable(super_token, false);
            self.emit_op(OpCode::SuperInvoke);
            self.emit_u8(argc);
            self.emit_u8(name_constant);
        } else {
            self.named_variable(this_token, false);
            self.named_variable(super_token, false);
            self.emit_op_u8(OpCode::GetSuper, name_constant);
        }
    }

    fn unary(&mut self) {
        let kind = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match kind {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self) {
        let kind = self.previous.kind;
        let precedence = infix_precedence(kind);
        self.parse_precedence(precedence.next());
        match kind {
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            _ => unreachable!(),
        }
    }

    fn and(&mut self) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self) {
        let argc = self.argument_list();
        self.emit_op(OpCode::Call);
        self.emit_u8(argc);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name_token = self.previous;
        let name_constant = self.identifier_constant(name_token);

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op_u8(OpCode::SetProperty, name_constant);
        } else if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.emit_op(OpCode::Invoke);
            self.emit_u8(argc);
            self.emit_u8(name_constant);
        } else {
            self.emit_op_u8(OpCode::GetProperty, name_constant);
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc: u8 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if argc as usize == MAX_PARAMS {
                    self.error("Can't have more than 8 arguments.");
                } else {
                    argc += 1;
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        argc
    }
}
