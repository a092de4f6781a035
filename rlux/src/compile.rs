use std::iter::Peekable;

use crate::{
    intern, scan, token, Chunk, CompileError, Gc, ObjFun, OpCode, Position, Scanner, StrId, Token,
    UpvalueRef, Value, MAX_LITERAL_ITEMS, MAX_LOCAL_VARIABLES, MAX_PARAMS, MAX_UPVALUES,
};

/// Compile the given source code in to bytecodes that can be read by the
/// virtual machine. Parsing continues after an error so that as many
/// diagnostics as possible are collected in one pass; the function is
/// discarded when any error occurred.
pub fn compile(src: &str) -> Result<Gc<ObjFun>, Vec<CompileError>> {
    let mut parser = Parser::new(src);
    while parser.peek().is_some() {
        parser.declaration();
    }
    let (fun, _) = parser.end_compiler();
    if parser.errors.is_empty() {
        Ok(Gc::new(fun))
    } else {
        Err(parser.errors)
    }
}

/// The kind of function a compiler context is producing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

/// A local variable bound in the current function.
#[derive(Debug)]
struct Local {
    name: String,
    /// Scope depth of the declaration, -1 while the initializer is still running
    depth: i32,
    is_captured: bool,
}

/// Per-function compilation state. One context is pushed for every nested
/// function declaration and popped when its chunk is finished.
#[derive(Debug)]
struct Compiler {
    fun: ObjFun,
    kind: FunctionKind,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueRef>,
    scope_depth: i32,
    in_loop: bool,
    loop_start: usize,
    breaks: Vec<usize>,
}

impl Compiler {
    fn new(kind: FunctionKind, name: StrId) -> Self {
        // Slot 0 holds the receiver for methods and the callee otherwise.
        let slot_zero = Local {
            name: if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) {
                "this".to_string()
            } else {
                String::new()
            },
            depth: 0,
            is_captured: false,
        };
        Self {
            fun: ObjFun {
                name,
                arity: 0,
                upvalue_count: 0,
                chunk: Chunk::default(),
            },
            kind,
            locals: vec![slot_zero],
            upvalues: Vec::new(),
            scope_depth: 0,
            in_loop: false,
            loop_start: 0,
            breaks: Vec::new(),
        }
    }
}

/// Class compilation state, one per nested class declaration.
#[derive(Debug)]
struct ClassCompiler {
    has_superclass: bool,
}

/// Loop state of the enclosing compiler, saved on loop entry and restored on
/// exit so that loops nest and `break`/`continue` bind to the nearest one.
struct LoopContext {
    in_loop: bool,
    loop_start: usize,
    breaks: Vec<usize>,
}

/// Scan for tokens and emit corresponding bytecodes.
#[derive(Debug)]
struct Parser<'a> {
    tokens: Peekable<scan::Iter<'a>>,
    compilers: Vec<Compiler>,
    classes: Vec<ClassCompiler>,
    errors: Vec<CompileError>,
    prev: Option<Token>,
    last_pos: Position,
}

type ParseResult = Result<(), CompileError>;

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            tokens: Scanner::new(src).into_iter().peekable(),
            compilers: vec![Compiler::new(FunctionKind::Script, intern::id(""))],
            classes: Vec::new(),
            errors: Vec::new(),
            prev: None,
            last_pos: Position::default(),
        }
    }

    /// Parse one declaration, recording the error and synchronizing to a
    /// statement boundary when it fails.
    fn declaration(&mut self) {
        let result = if self.advance_when(token::Type::Class).is_some() {
            self.class_declaration()
        } else if self.advance_when(token::Type::Fun).is_some() {
            self.fun_declaration()
        } else if self.advance_when(token::Type::Let).is_some() {
            self.var_declaration()
        } else {
            self.statement()
        };
        if let Err(err) = result {
            self.errors.push(err);
            self.synchronize();
        }
    }

    fn statement(&mut self) -> ParseResult {
        if self.advance_when(token::Type::Dump).is_some() {
            self.dump_statement()
        } else if self.advance_when(token::Type::If).is_some() {
            self.if_statement()
        } else if self.advance_when(token::Type::Return).is_some() {
            self.return_statement()
        } else if self.advance_when(token::Type::While).is_some() {
            self.while_statement()
        } else if self.advance_when(token::Type::For).is_some() {
            self.for_statement()
        } else if self.advance_when(token::Type::Switch).is_some() {
            self.switch_statement()
        } else if self.advance_when(token::Type::Break).is_some() {
            self.break_statement()
        } else if self.advance_when(token::Type::Continue).is_some() {
            self.continue_statement()
        } else if self.advance_when(token::Type::LBrace).is_some() {
            self.begin_scope();
            let result = self.block();
            self.end_scope();
            result
        } else {
            self.expression_statement()
        }
    }

    fn var_declaration(&mut self) -> ParseResult {
        let global = self.parse_variable("Expect variable name.")?;
        if self.advance_when(token::Type::Equal).is_some() {
            self.expression()?;
        } else {
            self.emit(OpCode::Nil);
        }
        self.consume(
            token::Type::Semicolon,
            "Expect ';' after variable declaration.",
        )?;
        self.define_variable(global);
        Ok(())
    }

    fn fun_declaration(&mut self) -> ParseResult {
        let global = self.parse_variable("Expect function name.")?;
        let name = intern::id(
            self.prev
                .as_ref()
                .map(|t| t.lexeme.as_str())
                .unwrap_or_default(),
        );
        self.mark_initialized();
        self.function(FunctionKind::Function, name)?;
        self.define_variable(global);
        Ok(())
    }

    fn class_declaration(&mut self) -> ParseResult {
        let name_tok = self.consume(token::Type::Ident, "Expect class name.")?;
        let name_constant = self.identifier_constant(&name_tok)?;
        self.declare_variable(&name_tok)?;
        self.emit(OpCode::Class(name_constant));
        self.define_variable(name_constant);

        self.classes.push(ClassCompiler {
            has_superclass: false,
        });
        let result = self.class_body(&name_tok);
        let class = self.classes.pop().expect("Class context was pushed.");
        if class.has_superclass {
            self.end_scope();
        }
        result
    }

    fn class_body(&mut self, name_tok: &Token) -> ParseResult {
        if self.advance_when(token::Type::Less).is_some() {
            let super_tok = self.consume(token::Type::Ident, "Expect superclass name.")?;
            self.named_variable(&super_tok, false)?;
            if super_tok.lexeme == name_tok.lexeme {
                return Err(error_at(
                    &super_tok,
                    "A class can't inherit from itself.".to_string(),
                ));
            }
            self.begin_scope();
            self.add_local(self.synthetic_token("super"))?;
            self.define_variable(0);

            self.named_variable(name_tok, false)?;
            self.emit(OpCode::Inherit);
            self.classes
                .last_mut()
                .expect("Class context was pushed.")
                .has_superclass = true;
        }

        self.named_variable(name_tok, false)?;
        self.consume(token::Type::LBrace, "Expect '{' before class body.")?;
        while !self.check(token::Type::RBrace) && self.peek().is_some() {
            self.method()?;
        }
        self.consume(token::Type::RBrace, "Expect '}' after class body.")?;
        self.emit(OpCode::Pop);
        Ok(())
    }

    fn method(&mut self) -> ParseResult {
        let name_tok = self.consume(token::Type::Ident, "Expect method name.")?;
        let constant = self.identifier_constant(&name_tok)?;
        let kind = if name_tok.lexeme == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind, intern::id(&name_tok.lexeme))?;
        self.emit(OpCode::Method(constant));
        Ok(())
    }

    fn function(&mut self, kind: FunctionKind, name: StrId) -> ParseResult {
        self.compilers.push(Compiler::new(kind, name));
        let result = self.function_inner();
        let (fun, upvalues) = self.end_compiler();
        result?;

        let idx = self.make_constant(Value::Fun(Gc::new(fun)))?;
        self.emit(OpCode::Closure(idx, upvalues));
        Ok(())
    }

    fn function_inner(&mut self) -> ParseResult {
        self.begin_scope();
        self.consume(token::Type::LParen, "Expect '(' after function name.")?;
        if !self.check(token::Type::RParen) {
            loop {
                if self.current().fun.arity as usize == MAX_PARAMS {
                    return Err(self.error_at_current("Can't have more than 255 parameters."));
                }
                self.current_mut().fun.arity += 1;
                let constant = self.parse_variable("Expect parameter name.")?;
                self.define_variable(constant);
                if self.advance_when(token::Type::Comma).is_none() {
                    break;
                }
            }
        }
        self.consume(token::Type::RParen, "Expect ')' after parameters.")?;
        self.consume(token::Type::LBrace, "Expect '{' before function body.")?;
        self.block()
    }

    fn block(&mut self) -> ParseResult {
        while !self.check(token::Type::RBrace) && self.peek().is_some() {
            self.declaration();
        }
        self.consume(token::Type::RBrace, "Expect '}' after block.")?;
        Ok(())
    }

    fn dump_statement(&mut self) -> ParseResult {
        self.expression()?;
        self.consume(token::Type::Semicolon, "Expect ';' after value.")?;
        self.emit(OpCode::Dump);
        Ok(())
    }

    fn expression_statement(&mut self) -> ParseResult {
        self.expression()?;
        self.consume(token::Type::Semicolon, "Expect ';' after expression.")?;
        self.emit(OpCode::Pop);
        Ok(())
    }

    fn if_statement(&mut self) -> ParseResult {
        self.consume(token::Type::LParen, "Expect '(' after 'if'.")?;
        self.expression()?;
        self.consume(token::Type::RParen, "Expect ')' after condition.")?;

        let then_jump = self.emit_jump(OpCode::JumpIfFalse(u16::MAX));
        self.emit(OpCode::Pop);
        self.statement()?;
        let else_jump = self.emit_jump(OpCode::Jump(u16::MAX));

        self.patch_jump(then_jump)?;
        self.emit(OpCode::Pop);
        if self.advance_when(token::Type::Else).is_some() {
            self.statement()?;
        }
        self.patch_jump(else_jump)?;
        Ok(())
    }

    fn while_statement(&mut self) -> ParseResult {
        let loop_start = self.chunk().instructions_count();
        let enclosing = self.begin_loop(loop_start);

        self.consume(token::Type::LParen, "Expect '(' after 'while'.")?;
        self.expression()?;
        self.consume(token::Type::RParen, "Expect ')' after condition.")?;

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse(u16::MAX));
        self.emit(OpCode::Pop);
        self.statement()?;
        self.emit_loop(loop_start)?;

        self.patch_jump(exit_jump)?;
        self.emit(OpCode::Pop);

        self.patch_breaks()?;
        self.end_loop(enclosing);
        Ok(())
    }

    fn for_statement(&mut self) -> ParseResult {
        self.begin_scope();
        self.consume(token::Type::LParen, "Expect '(' after 'for'.")?;
        if self.advance_when(token::Type::Semicolon).is_some() {
            // No initializer.
        } else if self.advance_when(token::Type::Let).is_some() {
            self.var_declaration()?;
        } else {
            self.expression_statement()?;
        }

        let mut loop_start = self.chunk().instructions_count();
        let enclosing = self.begin_loop(loop_start);

        let mut exit_jump = None;
        if self.advance_when(token::Type::Semicolon).is_none() {
            self.expression()?;
            self.consume(token::Type::Semicolon, "Expect ';' after loop condition.")?;

            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse(u16::MAX)));
            self.emit(OpCode::Pop);
        }

        if self.advance_when(token::Type::RParen).is_none() {
            // The step runs after the body, the trampoline jump below skips
            // it on the way in.
            let body_jump = self.emit_jump(OpCode::Jump(u16::MAX));
            let increment_start = self.chunk().instructions_count();
            self.expression()?;
            self.emit(OpCode::Pop);
            self.consume(token::Type::RParen, "Expect ')' after for clauses.")?;

            self.emit_loop(loop_start)?;
            loop_start = increment_start;
            self.current_mut().loop_start = increment_start;
            self.patch_jump(body_jump)?;
        }

        self.statement()?;
        self.emit_loop(loop_start)?;

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump)?;
            self.emit(OpCode::Pop);
        }

        self.patch_breaks()?;
        self.end_loop(enclosing);
        self.end_scope();
        Ok(())
    }

    /// The switch value stays on the stack below the statements of the
    /// matched case, and every path through the statement pops it exactly
    /// once at the end, keeping stack depth independent of which case ran.
    fn switch_statement(&mut self) -> ParseResult {
        self.consume(token::Type::LParen, "Expect '(' after 'switch'.")?;
        self.expression()?;
        self.consume(token::Type::RParen, "Expect ')' after switch condition.")?;

        // The switch value occupies a stack slot for the whole statement,
        // reserve a compiler slot for it so locals declared inside case
        // bodies resolve to their real stack positions.
        self.reserve_stack_slot()?;
        let result = self.switch_body();
        self.release_stack_slot();
        result
    }

    fn switch_body(&mut self) -> ParseResult {
        self.consume(token::Type::LBrace, "Expect '{' after switch condition.")?;

        let mut exit_jumps = Vec::new();
        let mut popped_final = false;

        while self.advance_when(token::Type::Case).is_some() {
            self.emit(OpCode::Dup);
            self.expression()?;
            self.consume(token::Type::Colon, "Expect ':' after case expression.")?;
            self.emit(OpCode::Equal);

            let skip_case = self.emit_jump(OpCode::JumpIfFalse(u16::MAX));
            self.emit(OpCode::Pop);
            while !self.check(token::Type::RBrace)
                && !self.check(token::Type::Case)
                && !self.check(token::Type::Default)
                && self.peek().is_some()
            {
                self.statement()?;
            }
            exit_jumps.push(self.emit_jump(OpCode::Jump(u16::MAX)));

            self.patch_jump(skip_case)?;
            self.emit(OpCode::Pop);
        }

        if self.advance_when(token::Type::Default).is_some() {
            self.consume(token::Type::Colon, "Expect ':' after default.")?;
            self.statement()?;
            if exit_jumps.is_empty() {
                popped_final = true;
                self.emit(OpCode::Pop);
            }
        }

        self.consume(token::Type::RBrace, "Expect '}' after switch cases.")?;

        let had_cases = !exit_jumps.is_empty();
        for exit_jump in exit_jumps {
            self.patch_jump(exit_jump)?;
        }
        if had_cases || !popped_final {
            self.emit(OpCode::Pop);
        }
        Ok(())
    }

    fn break_statement(&mut self) -> ParseResult {
        if !self.current().in_loop {
            return Err(self.error("Can't use 'break' outside of a loop."));
        }
        let jump = self.emit_jump(OpCode::Jump(u16::MAX));
        self.current_mut().breaks.push(jump);
        self.consume(token::Type::Semicolon, "Expect ';' after 'break'.")?;
        Ok(())
    }

    fn continue_statement(&mut self) -> ParseResult {
        if !self.current().in_loop {
            return Err(self.error("Can't use 'continue' outside of a loop."));
        }
        let loop_start = self.current().loop_start;
        self.emit_loop(loop_start)?;
        self.consume(token::Type::Semicolon, "Expect ';' after 'continue'.")?;
        Ok(())
    }

    fn return_statement(&mut self) -> ParseResult {
        if self.current().kind == FunctionKind::Script {
            return Err(self.error("Can't return from top-level code."));
        }

        if self.advance_when(token::Type::Semicolon).is_some() {
            self.emit_return();
        } else {
            if self.current().kind == FunctionKind::Initializer {
                return Err(self.error("Can't return a value from an initializer."));
            }
            self.expression()?;
            self.consume(token::Type::Semicolon, "Expect ';' after return value.")?;
            self.emit(OpCode::Return);
        }
        Ok(())
    }

    fn expression(&mut self) -> ParseResult {
        self.parse_precedence(Precedence::Assignment)
    }

    fn parse_precedence(&mut self, precedence: Precedence) -> ParseResult {
        let tok = self.advance()?;
        let can_assign = precedence <= Precedence::Assignment;
        self.prefix_rule(&tok, can_assign)?;

        loop {
            match self.peek() {
                None => break,
                Some(tok) if precedence > Precedence::of(&tok.typ) => break,
                _ => {}
            }
            let tok = self.advance()?;
            self.infix_rule(&tok, can_assign)?;
        }

        if can_assign {
            if let Some(tok) = self.advance_when(token::Type::Equal) {
                return Err(error_at(&tok, "Invalid assignment target.".to_string()));
            }
        }
        Ok(())
    }

    fn prefix_rule(&mut self, tok: &Token, can_assign: bool) -> ParseResult {
        match tok.typ {
            token::Type::LParen => self.grouping(),
            token::Type::LBracket => self.array_literal(),
            token::Type::LBrace => self.table_literal(),
            token::Type::Minus | token::Type::Bang => self.unary(tok),
            token::Type::String => self.string(tok),
            token::Type::Number => self.number(tok),
            token::Type::Ident => self.named_variable(tok, can_assign),
            token::Type::This => self.this(tok),
            token::Type::Super => self.super_(),
            token::Type::False | token::Type::Nil | token::Type::True => self.literal(tok),
            _ => Err(error_at(tok, "Expect expression.".to_string())),
        }
    }

    fn infix_rule(&mut self, tok: &Token, can_assign: bool) -> ParseResult {
        match tok.typ {
            token::Type::LParen => self.call(),
            token::Type::LBracket => self.index(can_assign),
            token::Type::Dot => self.dot(can_assign),
            token::Type::And => self.and(),
            token::Type::Or => self.or(),
            token::Type::Minus
            | token::Type::Plus
            | token::Type::Slash
            | token::Type::Star
            | token::Type::Percent
            | token::Type::Ampersand
            | token::Type::Pipe
            | token::Type::Caret
            | token::Type::BangEqual
            | token::Type::EqualEqual
            | token::Type::Greater
            | token::Type::GreaterEqual
            | token::Type::Less
            | token::Type::LessEqual => self.binary(tok),
            _ => Err(error_at(tok, "Expect expression.".to_string())),
        }
    }

    fn binary(&mut self, operator: &Token) -> ParseResult {
        self.parse_precedence(Precedence::of(&operator.typ).next())?;
        match operator.typ {
            token::Type::BangEqual => {
                self.emit(OpCode::Equal);
                self.emit(OpCode::Not);
            }
            token::Type::EqualEqual => self.emit(OpCode::Equal),
            token::Type::Greater => self.emit(OpCode::Greater),
            token::Type::GreaterEqual => {
                self.emit(OpCode::Less);
                self.emit(OpCode::Not);
            }
            token::Type::Less => self.emit(OpCode::Less),
            token::Type::LessEqual => {
                self.emit(OpCode::Greater);
                self.emit(OpCode::Not);
            }
            token::Type::Plus => self.emit(OpCode::Add),
            token::Type::Minus => self.emit(OpCode::Subtract),
            token::Type::Star => self.emit(OpCode::Multiply),
            token::Type::Slash => self.emit(OpCode::Divide),
            token::Type::Percent => self.emit(OpCode::Modulo),
            token::Type::Ampersand => self.emit(OpCode::BitwiseAnd),
            token::Type::Pipe => self.emit(OpCode::BitwiseOr),
            token::Type::Caret => self.emit(OpCode::BitwiseXor),
            _ => unreachable!("Rule table is wrong."),
        }
        Ok(())
    }

    fn unary(&mut self, operator: &Token) -> ParseResult {
        self.parse_precedence(Precedence::Unary)?;
        match operator.typ {
            token::Type::Bang => self.emit(OpCode::Not),
            token::Type::Minus => self.emit(OpCode::Negate),
            _ => unreachable!("Rule table is wrong."),
        }
        Ok(())
    }

    fn call(&mut self) -> ParseResult {
        let argc = self.argument_list()?;
        self.emit(OpCode::Call(argc));
        Ok(())
    }

    fn index(&mut self, can_assign: bool) -> ParseResult {
        self.expression()?;
        self.consume(token::Type::RBracket, "Expect ']' after index.")?;
        if can_assign && self.advance_when(token::Type::Equal).is_some() {
            self.expression()?;
            self.emit(OpCode::SetIndex);
        } else {
            self.emit(OpCode::Index);
        }
        Ok(())
    }

    fn dot(&mut self, can_assign: bool) -> ParseResult {
        let name_tok = self.consume(token::Type::Ident, "Expect property name after '.'.")?;
        let name = self.identifier_constant(&name_tok)?;

        if can_assign && self.advance_when(token::Type::Equal).is_some() {
            self.expression()?;
            self.emit(OpCode::SetProperty(name));
        } else if self.advance_when(token::Type::LParen).is_some() {
            let argc = self.argument_list()?;
            self.emit(OpCode::Invoke(name, argc));
        } else {
            self.emit(OpCode::GetProperty(name));
        }
        Ok(())
    }

    fn and(&mut self) -> ParseResult {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse(u16::MAX));
        self.emit(OpCode::Pop);
        self.parse_precedence(Precedence::And)?;
        self.patch_jump(end_jump)?;
        Ok(())
    }

    fn or(&mut self) -> ParseResult {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse(u16::MAX));
        let end_jump = self.emit_jump(OpCode::Jump(u16::MAX));

        self.patch_jump(else_jump)?;
        self.emit(OpCode::Pop);

        self.parse_precedence(Precedence::Or)?;
        self.patch_jump(end_jump)?;
        Ok(())
    }

    fn grouping(&mut self) -> ParseResult {
        self.expression()?;
        self.consume(token::Type::RParen, "Expect ')' after expression.")?;
        Ok(())
    }

    fn literal(&mut self, tok: &Token) -> ParseResult {
        match tok.typ {
            token::Type::False => self.emit(OpCode::False),
            token::Type::Nil => self.emit(OpCode::Nil),
            token::Type::True => self.emit(OpCode::True),
            _ => unreachable!("Rule table is wrong."),
        }
        Ok(())
    }

    fn string(&mut self, tok: &Token) -> ParseResult {
        let value = tok.lexeme[1..tok.lexeme.len() - 1].to_string();
        let constant = self.make_constant(Value::Str(intern::id(value)))?;
        self.emit(OpCode::Constant(constant));
        Ok(())
    }

    fn number(&mut self, tok: &Token) -> ParseResult {
        let lexeme = tok.lexeme.as_str();
        let value = if let Some(digits) = lexeme.strip_prefix("0x") {
            i64::from_str_radix(digits, 16).ok().map(|v| v as f64)
        } else if let Some(digits) = lexeme.strip_prefix("0b") {
            i64::from_str_radix(digits, 2).ok().map(|v| v as f64)
        } else if let Some(digits) = lexeme.strip_prefix("0o") {
            i64::from_str_radix(digits, 8).ok().map(|v| v as f64)
        } else {
            lexeme.parse().ok()
        };
        let value = match value {
            Some(value) => value,
            None => return Err(error_at(tok, "Invalid number literal.".to_string())),
        };
        let constant = self.make_constant(Value::Number(value))?;
        self.emit(OpCode::Constant(constant));
        Ok(())
    }

    fn array_literal(&mut self) -> ParseResult {
        let mut count = 0;
        if !self.check(token::Type::RBracket) {
            loop {
                self.expression()?;
                if count == MAX_LITERAL_ITEMS {
                    return Err(
                        self.error("Can't have more than 255 elements in an array literal.")
                    );
                }
                count += 1;
                if self.advance_when(token::Type::Comma).is_none() {
                    break;
                }
            }
        }
        self.consume(token::Type::RBracket, "Expect ']' after array elements.")?;
        self.emit(OpCode::SetArray(count as u8));
        Ok(())
    }

    fn table_literal(&mut self) -> ParseResult {
        let mut count = 0;
        if !self.check(token::Type::RBrace) {
            loop {
                self.expression()?;
                self.consume(token::Type::Colon, "Expect ':' after table key.")?;
                self.expression()?;
                if count == MAX_LITERAL_ITEMS {
                    return Err(self.error("Can't have more than 255 entries in a table literal."));
                }
                count += 1;
                if self.advance_when(token::Type::Comma).is_none() {
                    break;
                }
            }
        }
        self.consume(token::Type::RBrace, "Expect '}' after table entries.")?;
        self.emit(OpCode::SetTable(count as u8));
        Ok(())
    }

    fn this(&mut self, tok: &Token) -> ParseResult {
        if self.classes.is_empty() {
            return Err(error_at(tok, "Can't use 'this' outside of a class.".to_string()));
        }
        self.named_variable(tok, false)
    }

    fn super_(&mut self) -> ParseResult {
        if self.classes.is_empty() {
            return Err(self.error("Can't use 'super' outside of a class."));
        }
        if !self
            .classes
            .last()
            .expect("Class context was pushed.")
            .has_superclass
        {
            return Err(self.error("Can't use 'super' in a class with no superclass."));
        }

        self.consume(token::Type::Dot, "Expect '.' after 'super'.")?;
        let method_tok = self.consume(token::Type::Ident, "Expect superclass method name.")?;
        let name = self.identifier_constant(&method_tok)?;

        let this_tok = self.synthetic_token("this");
        let super_tok = self.synthetic_token("super");
        self.named_variable(&this_tok, false)?;
        if self.advance_when(token::Type::LParen).is_some() {
            let argc = self.argument_list()?;
            self.named_variable(&super_tok, false)?;
            self.emit(OpCode::SuperInvoke(name, argc));
        } else {
            self.named_variable(&super_tok, false)?;
            self.emit(OpCode::GetSuper(name));
        }
        Ok(())
    }

    /// Emit the get, set, or compound-assignment sequence for a variable
    /// reference, resolving it as a local, an upvalue, or a global. Compound
    /// assignments read the target before evaluating the right-hand side, so
    /// the subtrahend of `a -= b` is evaluated second.
    fn named_variable(&mut self, tok: &Token, can_assign: bool) -> ParseResult {
        let (get_op, set_op) = if let Some(slot) = self.resolve_local(self.compilers.len() - 1, tok)?
        {
            (OpCode::GetLocal(slot), OpCode::SetLocal(slot))
        } else if let Some(idx) = self.resolve_upvalue(self.compilers.len() - 1, tok)? {
            (OpCode::GetUpvalue(idx), OpCode::SetUpvalue(idx))
        } else {
            let idx = self.identifier_constant(tok)?;
            (OpCode::GetGlobal(idx), OpCode::SetGlobal(idx))
        };

        let compound = [
            (token::Type::PlusEqual, OpCode::Add),
            (token::Type::MinusEqual, OpCode::Subtract),
            (token::Type::StarEqual, OpCode::Multiply),
            (token::Type::SlashEqual, OpCode::Divide),
        ];

        if can_assign && self.advance_when(token::Type::Equal).is_some() {
            self.expression()?;
            self.emit(set_op);
            return Ok(());
        }
        if can_assign {
            for (typ, op) in compound {
                if self.advance_when(typ).is_some() {
                    self.emit(get_op);
                    self.expression()?;
                    self.emit(op);
                    self.emit(set_op);
                    return Ok(());
                }
            }
        }
        self.emit(get_op);
        Ok(())
    }

    fn argument_list(&mut self) -> Result<u8, CompileError> {
        let mut argc: usize = 0;
        if !self.check(token::Type::RParen) {
            loop {
                self.expression()?;
                if argc == MAX_PARAMS {
                    return Err(self.error_at_current("Can't have more than 255 arguments."));
                }
                argc += 1;
                if self.advance_when(token::Type::Comma).is_none() {
                    break;
                }
            }
        }
        self.consume(token::Type::RParen, "Expect ')' after arguments.")?;
        Ok(argc as u8)
    }

    fn parse_variable(&mut self, message: &str) -> Result<u8, CompileError> {
        let tok = self.consume(token::Type::Ident, message)?;
        self.declare_variable(&tok)?;
        if self.current().scope_depth > 0 {
            return Ok(0);
        }
        self.identifier_constant(&tok)
    }

    fn declare_variable(&mut self, tok: &Token) -> ParseResult {
        let compiler = self.current();
        if compiler.scope_depth == 0 {
            return Ok(());
        }
        for local in compiler.locals.iter().rev() {
            if local.depth != -1 && local.depth < compiler.scope_depth {
                break;
            }
            if local.name == tok.lexeme {
                return Err(error_at(
                    tok,
                    "Already a variable with this name in this scope.".to_string(),
                ));
            }
        }
        self.add_local(tok.clone())
    }

    fn add_local(&mut self, tok: Token) -> ParseResult {
        if self.current().locals.len() == MAX_LOCAL_VARIABLES {
            return Err(error_at(
                &tok,
                "Too many local variables in function.".to_string(),
            ));
        }
        self.current_mut().locals.push(Local {
            name: tok.lexeme,
            depth: -1,
            is_captured: false,
        });
        Ok(())
    }

    fn mark_initialized(&mut self) {
        let compiler = self.current_mut();
        if compiler.scope_depth == 0 {
            return;
        }
        let depth = compiler.scope_depth;
        compiler
            .locals
            .last_mut()
            .expect("A local was just declared.")
            .depth = depth;
    }

    fn define_variable(&mut self, global: u8) {
        if self.current().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit(OpCode::DefineGlobal(global));
    }

    fn resolve_local(
        &mut self,
        compiler_idx: usize,
        tok: &Token,
    ) -> Result<Option<u8>, CompileError> {
        let compiler = &self.compilers[compiler_idx];
        for (slot, local) in compiler.locals.iter().enumerate().rev() {
            if local.name == tok.lexeme {
                if local.depth == -1 {
                    return Err(error_at(
                        tok,
                        "Can't read local variable in its own initializer.".to_string(),
                    ));
                }
                return Ok(Some(slot as u8));
            }
        }
        Ok(None)
    }

    fn resolve_upvalue(
        &mut self,
        compiler_idx: usize,
        tok: &Token,
    ) -> Result<Option<u8>, CompileError> {
        if compiler_idx == 0 {
            return Ok(None);
        }
        let enclosing = compiler_idx - 1;
        if let Some(local) = self.resolve_local(enclosing, tok)? {
            self.compilers[enclosing].locals[local as usize].is_captured = true;
            return self.add_upvalue(compiler_idx, local, true, tok).map(Some);
        }
        if let Some(upvalue) = self.resolve_upvalue(enclosing, tok)? {
            return self
                .add_upvalue(compiler_idx, upvalue, false, tok)
                .map(Some);
        }
        Ok(None)
    }

    fn add_upvalue(
        &mut self,
        compiler_idx: usize,
        index: u8,
        is_local: bool,
        tok: &Token,
    ) -> Result<u8, CompileError> {
        let compiler = &mut self.compilers[compiler_idx];
        for (idx, upvalue) in compiler.upvalues.iter().enumerate() {
            if upvalue.index == index && upvalue.is_local == is_local {
                return Ok(idx as u8);
            }
        }
        if compiler.upvalues.len() == MAX_UPVALUES {
            return Err(error_at(
                tok,
                "Too many closure variables in function.".to_string(),
            ));
        }
        compiler.upvalues.push(UpvalueRef { index, is_local });
        compiler.fun.upvalue_count = compiler.upvalues.len();
        Ok((compiler.upvalues.len() - 1) as u8)
    }

    fn identifier_constant(&mut self, tok: &Token) -> Result<u8, CompileError> {
        self.make_constant(Value::Str(intern::id(&tok.lexeme)))
    }

    fn make_constant(&mut self, value: Value) -> Result<u8, CompileError> {
        match self.chunk().write_const(value) {
            Some(idx) => Ok(idx),
            None => Err(self.error("Too many constants in one chunk.")),
        }
    }

    fn begin_scope(&mut self) {
        self.current_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let compiler = self.current_mut();
        compiler.scope_depth -= 1;

        let mut ops = Vec::new();
        while let Some(local) = compiler.locals.last() {
            if local.depth <= compiler.scope_depth {
                break;
            }
            ops.push(if local.is_captured {
                OpCode::CloseUpvalue
            } else {
                OpCode::Pop
            });
            compiler.locals.pop();
        }
        for op in ops {
            self.emit(op);
        }
    }

    /// Reserve a compiler slot for an unnamed value a statement keeps on the
    /// stack. Identifiers are never empty, so the slot can't be resolved.
    fn reserve_stack_slot(&mut self) -> ParseResult {
        if self.current().locals.len() == MAX_LOCAL_VARIABLES {
            return Err(self.error("Too many local variables in function."));
        }
        let depth = self.current().scope_depth;
        self.current_mut().locals.push(Local {
            name: String::new(),
            depth,
            is_captured: false,
        });
        Ok(())
    }

    fn release_stack_slot(&mut self) {
        self.current_mut()
            .locals
            .pop()
            .expect("A stack slot was reserved.");
    }

    fn begin_loop(&mut self, loop_start: usize) -> LoopContext {
        let compiler = self.current_mut();
        let enclosing = LoopContext {
            in_loop: compiler.in_loop,
            loop_start: compiler.loop_start,
            breaks: std::mem::take(&mut compiler.breaks),
        };
        compiler.in_loop = true;
        compiler.loop_start = loop_start;
        enclosing
    }

    fn end_loop(&mut self, enclosing: LoopContext) {
        let compiler = self.current_mut();
        compiler.in_loop = enclosing.in_loop;
        compiler.loop_start = enclosing.loop_start;
        compiler.breaks = enclosing.breaks;
    }

    fn patch_breaks(&mut self) -> ParseResult {
        let breaks = std::mem::take(&mut self.current_mut().breaks);
        for jump in breaks {
            self.patch_jump(jump)?;
        }
        Ok(())
    }

    fn emit(&mut self, op: OpCode) {
        let pos = self.last_pos;
        self.chunk().write_instruction(op, pos);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit(op);
        self.chunk().instructions_count() - 1
    }

    fn emit_loop(&mut self, loop_start: usize) -> ParseResult {
        let offset = self.chunk().instructions_count() + 1 - loop_start;
        if offset > u16::MAX as usize {
            return Err(self.error("Loop body too large."));
        }
        self.emit(OpCode::Loop(offset as u16));
        Ok(())
    }

    fn patch_jump(&mut self, jump: usize) -> ParseResult {
        // -1 since the instruction pointer has moved past the jump when the
        // offset is applied.
        let offset = self.chunk().instructions_count() - jump - 1;
        if offset > u16::MAX as usize {
            return Err(self.error("Too much code to jump over."));
        }
        self.chunk().patch_jump_instruction(jump, offset as u16);
        Ok(())
    }

    fn emit_return(&mut self) {
        if self.current().kind == FunctionKind::Initializer {
            self.emit(OpCode::GetLocal(0));
        } else {
            self.emit(OpCode::Nil);
        }
        self.emit(OpCode::Return);
    }

    fn end_compiler(&mut self) -> (ObjFun, Vec<UpvalueRef>) {
        self.emit_return();
        let compiler = self
            .compilers
            .pop()
            .expect("A compiler context was pushed.");
        (compiler.fun, compiler.upvalues)
    }

    fn current(&self) -> &Compiler {
        self.compilers
            .last()
            .expect("A compiler context was pushed.")
    }

    fn current_mut(&mut self) -> &mut Compiler {
        self.compilers
            .last_mut()
            .expect("A compiler context was pushed.")
    }

    fn chunk(&mut self) -> &mut Chunk {
        &mut self.current_mut().fun.chunk
    }

    fn synthetic_token(&self, name: &str) -> Token {
        Token {
            typ: token::Type::Ident,
            lexeme: name.to_string(),
            pos: self.last_pos,
        }
    }

    fn synchronize(&mut self) {
        while self.peek().is_some() {
            let tok = self.advance().expect("We have peeked.");
            if tok.typ == token::Type::Semicolon {
                return;
            }
            if let Some(tok) = self.peek() {
                match tok.typ {
                    token::Type::Class
                    | token::Type::Fun
                    | token::Type::Let
                    | token::Type::For
                    | token::Type::If
                    | token::Type::While
                    | token::Type::Dump
                    | token::Type::Return => return,
                    _ => {}
                }
            }
        }
    }

    fn advance(&mut self) -> Result<Token, CompileError> {
        self.skip_scan_errors();
        match self.tokens.next() {
            Some(tok) => {
                let tok = tok.expect("All errors have been skipped.");
                self.last_pos = tok.pos;
                self.prev = Some(tok.clone());
                Ok(tok)
            }
            None => Err(CompileError {
                pos: self.last_pos,
                at: None,
                message: "Unexpected end of input.".to_string(),
            }),
        }
    }

    fn advance_when(&mut self, typ: token::Type) -> Option<Token> {
        if self.check(typ) {
            return Some(self.advance().expect("We have peeked."));
        }
        None
    }

    fn check(&mut self, typ: token::Type) -> bool {
        matches!(self.peek(), Some(tok) if tok.typ == typ)
    }

    fn peek(&mut self) -> Option<&Token> {
        self.skip_scan_errors();
        self.tokens.peek().map(|peeked| match peeked {
            Err(_) => unreachable!("Errors should have been skipped."),
            Ok(tok) => tok,
        })
    }

    fn skip_scan_errors(&mut self) {
        while let Some(Err(err)) = self.tokens.peek() {
            let message = match err {
                scan::ScanError::UnterminatedString(_) => "Unterminated string.".to_string(),
                scan::ScanError::UnexpectedCharacter(_, c) => {
                    format!("Unexpected character '{}'.", c)
                }
            };
            self.errors.push(CompileError {
                pos: err.pos(),
                at: Some(String::new()),
                message,
            });
            self.tokens.next();
        }
    }

    fn consume(&mut self, typ: token::Type, message: &str) -> Result<Token, CompileError> {
        self.skip_scan_errors();
        match self.tokens.peek() {
            Some(Ok(tok)) => {
                if tok.typ == typ {
                    self.advance()
                } else {
                    Err(error_at(tok, message.to_string()))
                }
            }
            None => Err(CompileError {
                pos: self.last_pos,
                at: None,
                message: message.to_string(),
            }),
            Some(Err(_)) => unreachable!("Invalid tokens should already be skipped."),
        }
    }

    /// An error blaming the most recently consumed token.
    fn error(&self, message: &str) -> CompileError {
        match &self.prev {
            Some(tok) => error_at(tok, message.to_string()),
            None => CompileError {
                pos: self.last_pos,
                at: None,
                message: message.to_string(),
            },
        }
    }

    /// An error blaming the token about to be consumed.
    fn error_at_current(&mut self, message: &str) -> CompileError {
        let pos = self.last_pos;
        match self.peek() {
            Some(tok) => error_at(tok, message.to_string()),
            None => CompileError {
                pos,
                at: None,
                message: message.to_string(),
            },
        }
    }
}

fn error_at(tok: &Token, message: String) -> CompileError {
    CompileError {
        pos: tok.pos,
        at: Some(tok.lexeme.clone()),
        message,
    }
}

/// All precedence levels in Lux
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    /// No precedence
    None,
    /// Operator `=`
    Assignment,
    /// Operator `or`
    Or,
    /// Operator `and`
    And,
    /// Operator `==` `!=`
    Equality,
    /// Operator `<` `>` `<=` `>=`
    Comparison,
    /// Operator `+` `-`
    Term,
    /// Operator `*` `/` `%` `&` `|` `^`
    Factor,
    /// Operator `!` `-`
    Unary,
    /// Operator `.` `()` `[]`
    Call,
    /// Literal and keywords
    Primary,
}

impl Precedence {
    /// Get the immediately higher precedence level
    fn next(&self) -> Self {
        match self {
            Self::None => Self::Assignment,
            Self::Assignment => Self::Or,
            Self::Or => Self::And,
            Self::And => Self::Equality,
            Self::Equality => Self::Comparison,
            Self::Comparison => Self::Term,
            Self::Term => Self::Factor,
            Self::Factor => Self::Unary,
            Self::Unary => Self::Call,
            Self::Call => Self::Primary,
            Self::Primary => Self::Primary,
        }
    }

    fn of(typ: &token::Type) -> Self {
        match typ {
            token::Type::Or => Precedence::Or,
            token::Type::And => Precedence::And,
            token::Type::BangEqual | token::Type::EqualEqual => Precedence::Equality,
            token::Type::Greater
            | token::Type::GreaterEqual
            | token::Type::Less
            | token::Type::LessEqual => Precedence::Comparison,
            token::Type::Minus | token::Type::Plus => Precedence::Term,
            token::Type::Slash
            | token::Type::Star
            | token::Type::Percent
            | token::Type::Ampersand
            | token::Type::Pipe
            | token::Type::Caret => Precedence::Factor,
            token::Type::LParen | token::Type::LBracket | token::Type::Dot => Precedence::Call,
            _ => Self::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_ok(src: &str) -> Gc<ObjFun> {
        compile(src).expect("source should compile")
    }

    fn compile_err(src: &str) -> Vec<CompileError> {
        compile(src).expect_err("source should not compile")
    }

    fn first_message(src: &str) -> String {
        compile_err(src)
            .first()
            .expect("at least one error")
            .to_string()
    }

    #[test]
    fn chunk_positions_cover_every_instruction() {
        let fun = compile_ok("let a = 1;\nlet b = a + 2;\ndump b;\n");
        for idx in 0..fun.chunk.instructions_count() {
            let (_, pos) = fun.chunk.read_instruction(idx);
            assert!(pos.line >= 1);
        }
    }

    #[test]
    fn forward_jumps_land_inside_the_chunk() {
        let fun = compile_ok(
            "let a = 0;
            if (a < 10) { a = a + 1; } else { a = a - 1; }
            while (a < 10) { a = a + 1; if (a == 5) break; }
            switch (a) { case 1: dump a; default: dump 0; }",
        );
        let count = fun.chunk.instructions_count();
        for idx in 0..count {
            match fun.chunk.read_instruction(idx).0 {
                OpCode::Jump(offset) | OpCode::JumpIfFalse(offset) => {
                    assert!(idx + 1 + *offset as usize <= count, "jump at {idx} escapes");
                    assert_ne!(*offset, u16::MAX, "jump at {idx} was never patched");
                }
                OpCode::Loop(offset) => {
                    assert!(*offset as usize <= idx + 1, "loop at {idx} escapes");
                }
                _ => {}
            }
        }
    }

    #[test]
    fn closure_upvalue_indices_are_valid() {
        let fun = compile_ok(
            "fun outer() {
                let x = 1;
                let y = 2;
                fun middle() {
                    fun inner() { return x + y; }
                    return inner;
                }
                return middle;
            }",
        );
        // The outer function is the only constant of the script chunk that
        // holds a function.
        let outer = (0..fun.chunk.const_count() as u8)
            .filter_map(|idx| match fun.chunk.read_const(idx) {
                Value::Fun(fun) => Some(Gc::clone(fun)),
                _ => None,
            })
            .next()
            .expect("outer function constant");
        for idx in 0..outer.chunk.instructions_count() {
            if let OpCode::Closure(fun_idx, upvalues) = outer.chunk.read_instruction(idx).0 {
                let middle = match outer.chunk.read_const(*fun_idx) {
                    Value::Fun(fun) => Gc::clone(fun),
                    _ => panic!("closure constant must be a function"),
                };
                assert_eq!(upvalues.len(), middle.upvalue_count);
                for upvalue in upvalues {
                    assert!(upvalue.is_local, "middle captures locals of outer");
                }
            }
        }
    }

    #[test]
    fn compound_assignment_reads_target_before_operand() {
        let fun = compile_ok("let a = 1; a -= 2;");
        let ops: Vec<OpCode> = (0..fun.chunk.instructions_count())
            .map(|idx| fun.chunk.read_instruction(idx).0.clone())
            .collect();
        let get = ops
            .iter()
            .position(|op| matches!(op, OpCode::GetGlobal(_)))
            .expect("compound assignment reads the target");
        assert!(matches!(ops[get + 1], OpCode::Constant(_)));
        assert!(matches!(ops[get + 2], OpCode::Subtract));
        assert!(matches!(ops[get + 3], OpCode::SetGlobal(_)));
    }

    #[test]
    fn self_inheritance_is_rejected() {
        assert!(first_message("class A {} class A < A {}")
            .contains("A class can't inherit from itself."));
    }

    #[test]
    fn reading_local_in_its_own_initializer_is_rejected() {
        assert!(first_message("{ let a = 1; { let a = a; } }")
            .contains("Can't read local variable in its own initializer."));
    }

    #[test]
    fn redeclaration_in_same_scope_is_rejected() {
        assert!(first_message("{ let a = 1; let a = 2; }")
            .contains("Already a variable with this name in this scope."));
    }

    #[test]
    fn invalid_assignment_target_is_rejected() {
        assert!(first_message("1 + 2 = 3;").contains("Invalid assignment target."));
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        assert!(first_message("break;").contains("Can't use 'break' outside of a loop."));
    }

    #[test]
    fn continue_outside_loop_is_rejected() {
        assert!(first_message("continue;").contains("Can't use 'continue' outside of a loop."));
    }

    #[test]
    fn return_value_from_initializer_is_rejected() {
        assert!(
            first_message("class A { init() { return 1; } }")
                .contains("Can't return a value from an initializer.")
        );
    }

    #[test]
    fn top_level_return_is_rejected() {
        assert!(first_message("return 1;").contains("Can't return from top-level code."));
    }

    #[test]
    fn this_outside_class_is_rejected() {
        assert!(first_message("dump this;").contains("Can't use 'this' outside of a class."));
    }

    #[test]
    fn super_without_superclass_is_rejected() {
        assert!(first_message("class A { f() { return super.f(); } }")
            .contains("Can't use 'super' in a class with no superclass."));
    }

    #[test]
    fn error_diagnostics_carry_line_and_token() {
        let message = first_message("let a = ;");
        assert!(message.starts_with("[line 1] Error at ';':"), "{message}");
    }

    #[test]
    fn number_prefixes_are_decoded() {
        let fun = compile_ok("dump 0xff; dump 0b101; dump 0o17;");
        let constants: Vec<f64> = (0..fun.chunk.const_count() as u8)
            .filter_map(|idx| match fun.chunk.read_const(idx) {
                Value::Number(n) => Some(*n),
                _ => None,
            })
            .collect();
        assert_eq!(constants, vec![255.0, 5.0, 15.0]);
    }

    #[test]
    fn errors_do_not_stop_the_parse() {
        let errors = compile_err("let = 1; let b = ; dump b;");
        assert!(errors.len() >= 2, "parser should synchronize and continue");
    }
}
