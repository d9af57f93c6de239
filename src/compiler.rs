use super::ast::{Expr, Literal, Method, Stmt};
use super::chunk::{Chunk, Instruction};
use super::heap::Heap;
use super::object::{Function, Obj, ObjRef};
use super::parser::Parser;
use super::reporter::{Phase, Report, Reporter};
use super::token::{Token, TokenType};
use super::tokenizer::Tokenizer;
use super::value::Value;
use std::cell::RefCell;
use std::mem;
use std::rc::Rc;

/// Compiles a source string down to a script function, or `None` if any
/// phase reported an error. Everything the compiler allocates goes through
/// `heap` directly; collections only ever run from the VM's allocation
/// wrapper, so compile-time objects can't be swept mid-compile.
pub fn compile(source: &str, heap: &mut Heap, reporter: &mut dyn Reporter) -> Option<ObjRef> {
    let mut tokenizer = Tokenizer::new(source);
    let mut parser = Parser::new(&mut tokenizer, reporter);
    let ast = parser.parse().ok()?;

    if cfg!(feature = "debug-ast") {
        for stmt in &ast {
            println!("{:?}", stmt);
        }
    }

    let mut compiler = Compiler::new();
    compiler.compile(&ast, heap, reporter).ok()
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CompilerType {
    Script,
    Function,
    Method,
    Initializer,
}

#[derive(Debug, Clone)]
struct Local {
    name: Rc<Token>,
    depth: u32,
    is_captured: bool,
    is_constant: bool,
}

impl Local {
    fn new(name: Rc<Token>, depth: u32) -> Local {
        Local {
            name,
            depth,
            is_captured: false,
            is_constant: false,
        }
    }

    fn capture(&mut self) {
        self.is_captured = true;
    }
}

#[derive(Debug, Clone)]
pub struct UpValue {
    pub is_local: bool,
    pub idx: usize,
}

impl UpValue {
    fn new(is_local: bool, idx: usize) -> Self {
        Self { is_local, idx }
    }
}

#[derive(Debug)]
struct ClassState {
    has_superclass: bool,
}

#[derive(Debug, Clone)]
pub struct CompilerState {
    scope_depth: u32,
    locals: Vec<Local>,
    up_values: Vec<UpValue>,
    had_error: bool,
    enclosing_state: Option<Rc<RefCell<CompilerState>>>,
}

impl CompilerState {
    fn new(enclosing_state: Option<Rc<RefCell<CompilerState>>>) -> Self {
        Self {
            scope_depth: 0,
            locals: Vec::new(),
            up_values: Vec::new(),
            had_error: false,
            enclosing_state,
        }
    }

    fn append_up_value(&mut self, is_local: bool, idx: usize) -> usize {
        for (i, up_value) in self.up_values.iter().enumerate() {
            if up_value.is_local == is_local && up_value.idx == idx {
                return i;
            }
        }
        let up_value_index = self.up_values.len();
        self.up_values.push(UpValue::new(is_local, idx));
        up_value_index
    }

    fn resolve_local(&self, token: Rc<Token>) -> Option<usize> {
        let mut iter = self.locals.iter().enumerate().rev();

        while let Some((idx, local)) = iter.next() {
            if local.name == token {
                return Some(idx);
            }
        }

        None
    }

    fn resolve_up_value(&mut self, token: Rc<Token>) -> Option<usize> {
        self.enclosing_state.as_ref()?;

        let mut enclosing_state = self.enclosing_state.as_ref().unwrap().borrow_mut();
        if let Some(idx) = enclosing_state.resolve_local(Rc::clone(&token)) {
            enclosing_state.get_local_mut(idx).capture();
            drop(enclosing_state);
            return Some(self.append_up_value(true, idx));
        }
        match enclosing_state.resolve_up_value(Rc::clone(&token)) {
            Some(idx) => {
                drop(enclosing_state);
                Some(self.append_up_value(false, idx))
            }
            _ => None,
        }
    }

    fn get_local(&self, idx: usize) -> &Local {
        self.locals.get(idx).unwrap()
    }

    fn get_local_mut(&mut self, idx: usize) -> &mut Local {
        self.locals.get_mut(idx).unwrap()
    }
}

pub struct Compiler {
    typ: CompilerType,
    name: Option<String>,
    arity: u8,
    chunk: Chunk,
    state: Rc<RefCell<CompilerState>>,
    class_state: Option<Rc<RefCell<ClassState>>>,
}

impl Compiler {
    pub fn new() -> Self {
        let mut state = CompilerState::new(None);

        // slot 0 aliases the running closure itself
        state.locals.push(Local::new(
            Rc::new(Token::new_synthetic(TokenType::EOF, "")),
            0,
        ));

        Compiler {
            typ: CompilerType::Script,
            name: None,
            arity: 0,
            chunk: Chunk::new(),
            state: Rc::new(RefCell::new(state)),
            class_state: None,
        }
    }

    fn new_function(
        typ: CompilerType,
        name: Rc<Token>,
        enclosing_state: Rc<RefCell<CompilerState>>,
        class_state: Option<Rc<RefCell<ClassState>>>,
    ) -> Self {
        let mut state = CompilerState::new(Some(enclosing_state));

        // methods see the receiver in slot 0 as `this`; a plain function
        // sees itself there, which is what makes named recursion work
        state.locals.push(Local::new(
            match typ {
                CompilerType::Method | CompilerType::Initializer => {
                    Rc::new(Token::new_synthetic(TokenType::This, "this"))
                }
                _ => Rc::clone(&name),
            },
            0,
        ));

        Compiler {
            typ,
            name: Some(name.lexeme.clone()),
            arity: 0,
            chunk: Chunk::new(),
            state: Rc::new(RefCell::new(state)),
            class_state,
        }
    }

    fn error_at(&mut self, token: Rc<Token>, msg: &str, reporter: &mut dyn Reporter) {
        let report = Report::new(Phase::Compilation, msg.to_string(), token);
        reporter.error(report);
        self.state.borrow_mut().had_error = true;
    }

    fn string(&mut self, token: Rc<Token>, reporter: &mut dyn Reporter) -> Result<String, ()> {
        let mut content = String::new();
        let mut iter = token.lexeme.chars();

        if let Some(c) = iter.next() {
            if c != '"' {
                content.push(c)
            }
        }

        while let Some(c) = iter.next() {
            if c == '\\' {
                if let Some(c) = iter.next() {
                    match c {
                        'n' => content.push('\n'),
                        'r' => content.push('\r'),
                        't' => content.push('\t'),
                        '\\' => content.push('\\'),
                        '"' => content.push('"'),
                        '\'' => content.push('\''),
                        '0' => content.push('\0'),
                        _ => {
                            self.error_at(
                                Rc::clone(&token),
                                "Unexpected character after '\\'",
                                reporter,
                            );
                            return Err(());
                        }
                    }
                }
            } else if c == '"' {
                break;
            } else {
                content.push(c);
            }
        }
        Ok(content)
    }

    fn make_constant(
        &mut self,
        value: Value,
        token: Rc<Token>,
        reporter: &mut dyn Reporter,
    ) -> Result<u8, ()> {
        match self.chunk.make_constant(value) {
            Ok(idx) => Ok(idx),
            Err(_) => {
                self.error_at(token, "Too many constants in one chunk", reporter);
                Err(())
            }
        }
    }

    fn name_constant(
        &mut self,
        token: Rc<Token>,
        heap: &mut Heap,
        reporter: &mut dyn Reporter,
    ) -> Result<u8, ()> {
        let name_ref = heap.intern(&token.lexeme);
        self.make_constant(Value::from(name_ref), token, reporter)
    }

    fn emit_const(
        &mut self,
        value: Value,
        token: Rc<Token>,
        reporter: &mut dyn Reporter,
    ) -> Result<(), ()> {
        let idx = self.make_constant(value, Rc::clone(&token), reporter)?;
        self.chunk.emit_instr(Instruction::Constant, Some(token));
        self.chunk.emit_byte(idx);
        Ok(())
    }

    fn emit_closure(
        &mut self,
        function: ObjRef,
        up_values: &[UpValue],
        token: Rc<Token>,
        reporter: &mut dyn Reporter,
    ) -> Result<(), ()> {
        let idx = self.make_constant(Value::from(function), Rc::clone(&token), reporter)?;
        self.chunk.emit_instr(Instruction::Closure, Some(token));
        self.chunk.emit_byte(idx);
        for up_value in up_values {
            self.chunk.emit_byte(up_value.is_local as u8);
            self.chunk.emit_byte(up_value.idx as u8);
        }
        Ok(())
    }

    fn patch_jump(&mut self, index: usize, token: Rc<Token>, reporter: &mut dyn Reporter) {
        if self.chunk.patch_jump(index).is_err() {
            self.error_at(token, "Too much code to jump over", reporter);
        }
    }

    fn emit_loop(&mut self, start: usize, token: Rc<Token>, reporter: &mut dyn Reporter) {
        if self.chunk.emit_loop(start, Some(Rc::clone(&token))).is_err() {
            self.error_at(token, "Loop body too large", reporter);
        }
    }

    fn in_global_scope(&self) -> bool {
        self.typ == CompilerType::Script && self.state.borrow().scope_depth == 0
    }

    fn in_function(&self) -> bool {
        self.typ != CompilerType::Script
    }

    fn define_variable(
        &mut self,
        token: Rc<Token>,
        is_constant: bool,
        heap: &mut Heap,
        reporter: &mut dyn Reporter,
    ) -> Result<(), ()> {
        let scope_depth = self.state.borrow().scope_depth;

        if self.in_global_scope() {
            let idx = self.name_constant(Rc::clone(&token), heap, reporter)?;
            self.chunk.emit_instr(
                if is_constant {
                    Instruction::DefineConstant
                } else {
                    Instruction::DefineGlobal
                },
                Some(token),
            );
            self.chunk.emit_byte(idx);
            return Ok(());
        }

        let locals = self.state.borrow().locals.clone();
        let mut iter = locals.iter().rev();
        while let Some(local) = iter.next() {
            if local.depth != scope_depth {
                break;
            }
            if local.name == token {
                self.error_at(
                    token,
                    "A variable with this name already exists in this scope",
                    reporter,
                );
                return Err(());
            }
        }

        if locals.len() == 256 {
            self.error_at(token, "Too many local variables in function", reporter);
            return Err(());
        }

        let mut local = Local::new(token, scope_depth);
        local.is_constant = is_constant;
        self.state.borrow_mut().locals.push(local);
        Ok(())
    }

    fn get_variable(
        &mut self,
        token: Rc<Token>,
        heap: &mut Heap,
        reporter: &mut dyn Reporter,
    ) -> Result<(), ()> {
        let state = self.state.borrow();
        if let Some(idx) = state.resolve_local(Rc::clone(&token)) {
            drop(state);
            self.chunk
                .emit_instr(Instruction::GetLocal, Some(Rc::clone(&token)));
            self.chunk.emit_byte(idx as u8);
            return Ok(());
        }
        drop(state);

        let mut state = self.state.borrow_mut();
        if let Some(idx) = state.resolve_up_value(Rc::clone(&token)) {
            drop(state);
            self.chunk
                .emit_instr(Instruction::GetUpvalue, Some(Rc::clone(&token)));
            self.chunk.emit_byte(idx as u8);
            return Ok(());
        }
        drop(state);

        let idx = self.name_constant(Rc::clone(&token), heap, reporter)?;
        self.chunk
            .emit_instr(Instruction::GetGlobal, Some(token));
        self.chunk.emit_byte(idx);
        Ok(())
    }

    fn set_variable(
        &mut self,
        token: Rc<Token>,
        heap: &mut Heap,
        reporter: &mut dyn Reporter,
    ) -> Result<(), ()> {
        let state = self.state.borrow();
        if let Some(idx) = state.resolve_local(Rc::clone(&token)) {
            let is_constant = state.get_local(idx).is_constant;
            drop(state);
            if is_constant {
                self.error_at(token, "Can't change the value of constant", reporter);
                return Err(());
            }
            self.chunk
                .emit_instr(Instruction::SetLocal, Some(Rc::clone(&token)));
            self.chunk.emit_byte(idx as u8);
            return Ok(());
        }
        drop(state);

        let mut state = self.state.borrow_mut();
        if let Some(idx) = state.resolve_up_value(Rc::clone(&token)) {
            drop(state);
            self.chunk
                .emit_instr(Instruction::SetUpvalue, Some(Rc::clone(&token)));
            self.chunk.emit_byte(idx as u8);
            return Ok(());
        }
        drop(state);

        let idx = self.name_constant(Rc::clone(&token), heap, reporter)?;
        self.chunk
            .emit_instr(Instruction::SetGlobal, Some(token));
        self.chunk.emit_byte(idx);
        Ok(())
    }

    fn literal(
        &mut self,
        literal: &Literal,
        heap: &mut Heap,
        reporter: &mut dyn Reporter,
    ) -> Result<(), ()> {
        match literal {
            Literal::Number(token) => {
                let value = Value::from(token.lexeme.parse::<f64>().unwrap());
                self.emit_const(value, Rc::clone(token), reporter)?;
            }
            Literal::Bool(token) => {
                self.chunk.emit_instr(
                    match token.typ {
                        TokenType::True => Instruction::True,
                        TokenType::False => Instruction::False,
                        _ => unreachable!(),
                    },
                    Some(Rc::clone(token)),
                );
            }
            Literal::String(token) => {
                let content = self.string(Rc::clone(token), reporter)?;
                let value = Value::from(heap.intern(&content));
                self.emit_const(value, Rc::clone(token), reporter)?;
            }
            Literal::Nil(token) => {
                self.chunk
                    .emit_instr(Instruction::Nil, Some(Rc::clone(token)));
            }
        };
        Ok(())
    }

    fn unary(
        &mut self,
        op: Rc<Token>,
        expr: &Expr,
        heap: &mut Heap,
        reporter: &mut dyn Reporter,
    ) -> Result<(), ()> {
        self.expr(expr, heap, reporter)?;
        match op.typ {
            TokenType::Minus => {
                self.chunk.emit_instr(Instruction::Negate, Some(op));
            }
            TokenType::Bang => {
                self.chunk.emit_instr(Instruction::Not, Some(op));
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    fn arith_instr(op: &Rc<Token>) -> Instruction {
        match op.typ {
            TokenType::Plus | TokenType::PlusEqual | TokenType::DPlus => Instruction::Add,
            TokenType::Minus | TokenType::MinusEqual | TokenType::DMinus => Instruction::Subtract,
            TokenType::Star | TokenType::StarEqual => Instruction::Multiply,
            TokenType::Slash | TokenType::SlashEqual => Instruction::Divide,
            TokenType::Percent | TokenType::PercentEqual => Instruction::Modulo,
            TokenType::Power | TokenType::PowerEqual => Instruction::Power,
            _ => unreachable!(),
        }
    }

    fn postfix(
        &mut self,
        op: Rc<Token>,
        target: &Expr,
        heap: &mut Heap,
        reporter: &mut dyn Reporter,
    ) -> Result<(), ()> {
        // `x++` lowers to `x = x + 1` and evaluates to the new value
        match target {
            Expr::Variable(token) => {
                self.get_variable(Rc::clone(token), heap, reporter)?;
                self.emit_const(Value::from(1.0), Rc::clone(&op), reporter)?;
                self.chunk
                    .emit_instr(Self::arith_instr(&op), Some(Rc::clone(&op)));
                self.set_variable(Rc::clone(token), heap, reporter)?;
            }
            Expr::Get(_, object, name) => {
                self.expr(object, heap, reporter)?;
                self.expr(object, heap, reporter)?;
                let idx = self.name_constant(Rc::clone(name), heap, reporter)?;
                self.chunk
                    .emit_instr(Instruction::GetProperty, Some(Rc::clone(name)));
                self.chunk.emit_byte(idx);
                self.emit_const(Value::from(1.0), Rc::clone(&op), reporter)?;
                self.chunk
                    .emit_instr(Self::arith_instr(&op), Some(Rc::clone(&op)));
                self.chunk
                    .emit_instr(Instruction::SetProperty, Some(Rc::clone(name)));
                self.chunk.emit_byte(idx);
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    fn binary(
        &mut self,
        op: Rc<Token>,
        left: &Expr,
        right: &Expr,
        heap: &mut Heap,
        reporter: &mut dyn Reporter,
    ) -> Result<(), ()> {
        match op.typ {
            TokenType::Equal => {
                match left {
                    Expr::Variable(token) => {
                        self.expr(right, heap, reporter)?;
                        self.set_variable(Rc::clone(token), heap, reporter)?;
                    }
                    _ => unreachable!(),
                }
                return Ok(());
            }
            TokenType::PlusEqual
            | TokenType::MinusEqual
            | TokenType::StarEqual
            | TokenType::SlashEqual
            | TokenType::PercentEqual
            | TokenType::PowerEqual => {
                match left {
                    Expr::Variable(token) => {
                        self.get_variable(Rc::clone(token), heap, reporter)?;
                        self.expr(right, heap, reporter)?;
                        self.chunk
                            .emit_instr(Self::arith_instr(&op), Some(Rc::clone(&op)));
                        self.set_variable(Rc::clone(token), heap, reporter)?;
                    }
                    _ => unreachable!(),
                }
                return Ok(());
            }
            _ => {}
        }

        self.expr(left, heap, reporter)?;

        match op.typ {
            TokenType::And => {
                let false_jump = self
                    .chunk
                    .emit_jump(Instruction::JumpIfFalse, Some(Rc::clone(&op)));
                self.chunk.emit_instr(Instruction::Pop, Some(Rc::clone(&op)));
                self.expr(right, heap, reporter)?;
                self.patch_jump(false_jump, op, reporter);
                return Ok(());
            }
            TokenType::Or => {
                let else_jump = self
                    .chunk
                    .emit_jump(Instruction::JumpIfFalse, Some(Rc::clone(&op)));
                let end_jump = self.chunk.emit_jump(Instruction::Jump, Some(Rc::clone(&op)));
                self.patch_jump(else_jump, Rc::clone(&op), reporter);
                self.chunk.emit_instr(Instruction::Pop, Some(Rc::clone(&op)));
                self.expr(right, heap, reporter)?;
                self.patch_jump(end_jump, op, reporter);
                return Ok(());
            }
            _ => {}
        }

        self.expr(right, heap, reporter)?;
        match op.typ {
            TokenType::Plus => {
                self.chunk.emit_instr(Instruction::Add, Some(op));
            }
            TokenType::Minus => {
                self.chunk.emit_instr(Instruction::Subtract, Some(op));
            }
            TokenType::Star => {
                self.chunk.emit_instr(Instruction::Multiply, Some(op));
            }
            TokenType::Slash => {
                self.chunk.emit_instr(Instruction::Divide, Some(op));
            }
            TokenType::Percent => {
                self.chunk.emit_instr(Instruction::Modulo, Some(op));
            }
            TokenType::Power => {
                self.chunk.emit_instr(Instruction::Power, Some(op));
            }
            TokenType::ShiftLeft => {
                self.chunk.emit_instr(Instruction::ShiftLeft, Some(op));
            }
            TokenType::ShiftRight => {
                self.chunk.emit_instr(Instruction::ShiftRight, Some(op));
            }
            TokenType::DEqual => {
                self.chunk.emit_instr(Instruction::Equal, Some(op));
            }
            TokenType::BangEqual => {
                self.chunk
                    .emit_instr(Instruction::Equal, Some(Rc::clone(&op)));
                self.chunk.emit_instr(Instruction::Not, Some(op));
            }
            TokenType::Greater => {
                self.chunk.emit_instr(Instruction::Greater, Some(op));
            }
            TokenType::GreaterEqual => {
                self.chunk
                    .emit_instr(Instruction::Less, Some(Rc::clone(&op)));
                self.chunk.emit_instr(Instruction::Not, Some(op));
            }
            TokenType::Less => {
                self.chunk.emit_instr(Instruction::Less, Some(op));
            }
            TokenType::LessEqual => {
                self.chunk
                    .emit_instr(Instruction::Greater, Some(Rc::clone(&op)));
                self.chunk.emit_instr(Instruction::Not, Some(op));
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    fn this(
        &mut self,
        token: Rc<Token>,
        heap: &mut Heap,
        reporter: &mut dyn Reporter,
    ) -> Result<(), ()> {
        if self.class_state.is_none() {
            self.error_at(token, "Can't use 'this' outside of a class", reporter);
            return Err(());
        }
        self.get_variable(token, heap, reporter)
    }

    fn check_super(&mut self, token: Rc<Token>, reporter: &mut dyn Reporter) -> Result<(), ()> {
        match &self.class_state {
            None => {
                self.error_at(token, "Can't use 'super' outside of a class", reporter);
                Err(())
            }
            Some(class_state) => {
                if !class_state.borrow().has_superclass {
                    self.error_at(
                        token,
                        "Can't use 'super' in a class with no superclass",
                        reporter,
                    );
                    return Err(());
                }
                Ok(())
            }
        }
    }

    fn super_get(
        &mut self,
        keyword: Rc<Token>,
        method: Rc<Token>,
        heap: &mut Heap,
        reporter: &mut dyn Reporter,
    ) -> Result<(), ()> {
        self.check_super(Rc::clone(&keyword), reporter)?;
        let this_token = Rc::new(Token::new_synthetic(TokenType::This, "this"));
        self.get_variable(this_token, heap, reporter)?;
        self.get_variable(Rc::clone(&keyword), heap, reporter)?;
        let idx = self.name_constant(Rc::clone(&method), heap, reporter)?;
        self.chunk
            .emit_instr(Instruction::GetSuper, Some(method));
        self.chunk.emit_byte(idx);
        Ok(())
    }

    fn args(
        &mut self,
        token: &Rc<Token>,
        args: &[Expr],
        heap: &mut Heap,
        reporter: &mut dyn Reporter,
    ) -> Result<u8, ()> {
        let mut count = 0usize;
        for arg in args {
            if count == 0xff {
                self.error_at(Rc::clone(token), "Too many arguments", reporter);
                return Err(());
            }
            self.expr(arg, heap, reporter)?;
            count += 1;
        }
        Ok(count as u8)
    }

    fn call(
        &mut self,
        token: Rc<Token>,
        callee: &Expr,
        args: &[Expr],
        heap: &mut Heap,
        reporter: &mut dyn Reporter,
    ) -> Result<(), ()> {
        match callee {
            // `object.name(args)` fuses the property fetch with the call
            Expr::Get(_, object, name) => {
                self.expr(object, heap, reporter)?;
                let argc = self.args(&token, args, heap, reporter)?;
                let idx = self.name_constant(Rc::clone(name), heap, reporter)?;
                self.chunk
                    .emit_instr(Instruction::Invoke, Some(Rc::clone(name)));
                self.chunk.emit_byte(idx);
                self.chunk.emit_byte(argc);
            }
            Expr::Super(keyword, method) => {
                self.check_super(Rc::clone(keyword), reporter)?;
                let this_token = Rc::new(Token::new_synthetic(TokenType::This, "this"));
                self.get_variable(this_token, heap, reporter)?;
                let argc = self.args(&token, args, heap, reporter)?;
                self.get_variable(Rc::clone(keyword), heap, reporter)?;
                let idx = self.name_constant(Rc::clone(method), heap, reporter)?;
                self.chunk
                    .emit_instr(Instruction::SuperInvoke, Some(Rc::clone(method)));
                self.chunk.emit_byte(idx);
                self.chunk.emit_byte(argc);
            }
            _ => {
                self.expr(callee, heap, reporter)?;
                let argc = self.args(&token, args, heap, reporter)?;
                self.chunk.emit_instr(Instruction::Call, Some(token));
                self.chunk.emit_byte(argc);
            }
        }
        Ok(())
    }

    fn get(
        &mut self,
        object: &Expr,
        name: Rc<Token>,
        heap: &mut Heap,
        reporter: &mut dyn Reporter,
    ) -> Result<(), ()> {
        self.expr(object, heap, reporter)?;
        let idx = self.name_constant(Rc::clone(&name), heap, reporter)?;
        self.chunk
            .emit_instr(Instruction::GetProperty, Some(name));
        self.chunk.emit_byte(idx);
        Ok(())
    }

    fn set(
        &mut self,
        op: Rc<Token>,
        object: &Expr,
        name: Rc<Token>,
        value: &Expr,
        heap: &mut Heap,
        reporter: &mut dyn Reporter,
    ) -> Result<(), ()> {
        self.expr(object, heap, reporter)?;
        let idx = self.name_constant(Rc::clone(&name), heap, reporter)?;

        if op.typ == TokenType::Equal {
            self.expr(value, heap, reporter)?;
        } else {
            // compound property assignment re-evaluates the receiver for
            // the read; side effects in it run twice
            self.expr(object, heap, reporter)?;
            self.chunk
                .emit_instr(Instruction::GetProperty, Some(Rc::clone(&name)));
            self.chunk.emit_byte(idx);
            self.expr(value, heap, reporter)?;
            self.chunk
                .emit_instr(Self::arith_instr(&op), Some(Rc::clone(&op)));
        }

        self.chunk
            .emit_instr(Instruction::SetProperty, Some(name));
        self.chunk.emit_byte(idx);
        Ok(())
    }

    pub fn expr(
        &mut self,
        expr: &Expr,
        heap: &mut Heap,
        reporter: &mut dyn Reporter,
    ) -> Result<(), ()> {
        match expr {
            Expr::Literal(literal) => self.literal(literal, heap, reporter)?,
            Expr::Variable(token) => self.get_variable(Rc::clone(token), heap, reporter)?,
            Expr::This(token) => self.this(Rc::clone(token), heap, reporter)?,
            Expr::Super(keyword, method) => {
                self.super_get(Rc::clone(keyword), Rc::clone(method), heap, reporter)?
            }
            Expr::Unary(op, expr) => self.unary(Rc::clone(op), expr, heap, reporter)?,
            Expr::Postfix(op, target) => self.postfix(Rc::clone(op), target, heap, reporter)?,
            Expr::Binary(op, left, right) => {
                self.binary(Rc::clone(op), left, right, heap, reporter)?
            }
            Expr::Get(_, object, name) => self.get(object, Rc::clone(name), heap, reporter)?,
            Expr::Set(op, object, name, value) => {
                self.set(Rc::clone(op), object, Rc::clone(name), value, heap, reporter)?
            }
            Expr::Call(token, callee, args) => {
                self.call(Rc::clone(token), callee, args, heap, reporter)?
            }
        };
        Ok(())
    }

    fn define_params(
        &mut self,
        params: &[Rc<Token>],
        heap: &mut Heap,
        reporter: &mut dyn Reporter,
    ) -> Result<(), ()> {
        if self.typ == CompilerType::Script {
            unreachable!();
        }

        for param in params {
            if self.arity == 0xff {
                self.error_at(Rc::clone(param), "Too many parameters", reporter);
                return Err(());
            }
            self.define_variable(Rc::clone(param), false, heap, reporter)?;
            self.arity += 1;
        }

        Ok(())
    }

    /// Compiles a function body and emits the CLOSURE instruction for it.
    fn function(
        &mut self,
        typ: CompilerType,
        name: Rc<Token>,
        params: &[Rc<Token>],
        body: &Stmt,
        heap: &mut Heap,
        reporter: &mut dyn Reporter,
    ) -> Result<(), ()> {
        let mut compiler = Compiler::new_function(
            typ,
            Rc::clone(&name),
            Rc::clone(&self.state),
            self.class_state.clone(),
        );
        compiler.define_params(params, heap, reporter)?;

        let body = match body {
            Stmt::Block(stmts) => stmts,
            _ => unreachable!(),
        };
        let function = compiler.compile(body, heap, reporter)?;
        let up_values = compiler.state.borrow().up_values.clone();
        self.emit_closure(function, &up_values, name, reporter)
    }

    fn function_decl(
        &mut self,
        name: Rc<Token>,
        params: &[Rc<Token>],
        body: &Stmt,
        heap: &mut Heap,
        reporter: &mut dyn Reporter,
    ) -> Result<(), ()> {
        self.function(CompilerType::Function, Rc::clone(&name), params, body, heap, reporter)?;
        self.define_variable(name, false, heap, reporter)
    }

    fn class_decl(
        &mut self,
        name: Rc<Token>,
        superclass: &Option<Rc<Token>>,
        methods: &[Method],
        heap: &mut Heap,
        reporter: &mut dyn Reporter,
    ) -> Result<(), ()> {
        let idx = self.name_constant(Rc::clone(&name), heap, reporter)?;
        self.chunk
            .emit_instr(Instruction::Class, Some(Rc::clone(&name)));
        self.chunk.emit_byte(idx);
        self.define_variable(Rc::clone(&name), false, heap, reporter)?;

        let enclosing_class = mem::replace(
            &mut self.class_state,
            Some(Rc::new(RefCell::new(ClassState {
                has_superclass: superclass.is_some(),
            }))),
        );

        if let Some(superclass) = superclass {
            if superclass.lexeme == name.lexeme {
                self.error_at(
                    Rc::clone(superclass),
                    "A class can't inherit from itself",
                    reporter,
                );
                return Err(());
            }

            // the superclass lives in a hidden scope as `super`, so method
            // closures capture it like any other variable
            self.start_scope();
            self.get_variable(Rc::clone(superclass), heap, reporter)?;
            let super_token = Rc::new(Token::new_synthetic(TokenType::Super, "super"));
            self.define_variable(super_token, false, heap, reporter)?;
            self.get_variable(Rc::clone(&name), heap, reporter)?;
            self.chunk
                .emit_instr(Instruction::Inherit, Some(Rc::clone(superclass)));
        }

        self.get_variable(Rc::clone(&name), heap, reporter)?;
        for method in methods {
            let midx = self.name_constant(Rc::clone(&method.name), heap, reporter)?;
            let typ = if method.name.lexeme == "init" {
                CompilerType::Initializer
            } else {
                CompilerType::Method
            };
            self.function(
                typ,
                Rc::clone(&method.name),
                &method.params,
                &method.body,
                heap,
                reporter,
            )?;
            self.chunk
                .emit_instr(Instruction::Method, Some(Rc::clone(&method.name)));
            self.chunk.emit_byte(midx);
        }
        self.chunk.emit_instr(Instruction::Pop, Some(Rc::clone(&name)));

        if superclass.is_some() {
            self.end_scope();
        }

        self.class_state = enclosing_class;
        Ok(())
    }

    fn var_decl(
        &mut self,
        name: Rc<Token>,
        initializer: &Option<Expr>,
        heap: &mut Heap,
        reporter: &mut dyn Reporter,
    ) -> Result<(), ()> {
        match initializer {
            Some(expr) => self.expr(expr, heap, reporter)?,
            None => {
                self.chunk.emit_instr(Instruction::Nil, Some(Rc::clone(&name)));
            }
        };
        self.define_variable(name, false, heap, reporter)
    }

    fn const_decl(
        &mut self,
        name: Rc<Token>,
        initializer: &Expr,
        heap: &mut Heap,
        reporter: &mut dyn Reporter,
    ) -> Result<(), ()> {
        self.expr(initializer, heap, reporter)?;
        self.define_variable(name, true, heap, reporter)
    }

    fn return_stmt(
        &mut self,
        token: Rc<Token>,
        value: &Option<Expr>,
        heap: &mut Heap,
        reporter: &mut dyn Reporter,
    ) -> Result<(), ()> {
        if !self.in_function() {
            self.error_at(token, "Can't return from top-level code", reporter);
            return Err(());
        }

        match value {
            Some(expr) => {
                if self.typ == CompilerType::Initializer {
                    self.error_at(token, "Can't return a value from an initializer", reporter);
                    return Err(());
                }
                self.expr(expr, heap, reporter)?;
                self.chunk.emit_instr(Instruction::Return, None);
            }
            None => {
                self.emit_return();
            }
        }
        Ok(())
    }

    fn start_scope(&mut self) {
        self.state.borrow_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let locals = self.state.borrow().locals.clone();
        let mut iter = locals.iter().rev();

        while let Some(local) = iter.next() {
            if local.depth == self.state.borrow().scope_depth {
                self.state.borrow_mut().locals.pop();
                if local.is_captured {
                    self.chunk.emit_instr(Instruction::CloseUpvalue, None);
                } else {
                    self.chunk.emit_instr(Instruction::Pop, None);
                }
            } else {
                break;
            }
        }

        self.state.borrow_mut().scope_depth -= 1;
    }

    fn if_stmt(
        &mut self,
        condition: &Expr,
        then_branch: &Stmt,
        else_branch: &Option<Box<Stmt>>,
        heap: &mut Heap,
        reporter: &mut dyn Reporter,
    ) -> Result<(), ()> {
        let token = Rc::new(Token::new_synthetic(TokenType::If, "if"));
        self.expr(condition, heap, reporter)?;
        let false_jump = self.chunk.emit_jump(Instruction::JumpIfFalse, None);
        self.chunk.emit_instr(Instruction::Pop, None);
        self.stmt(then_branch, heap, reporter)?;
        let true_jump = self.chunk.emit_jump(Instruction::Jump, None);
        self.patch_jump(false_jump, Rc::clone(&token), reporter);
        self.chunk.emit_instr(Instruction::Pop, None);
        if let Some(stmt) = else_branch {
            self.stmt(stmt, heap, reporter)?;
        }
        self.patch_jump(true_jump, token, reporter);
        Ok(())
    }

    fn while_stmt(
        &mut self,
        condition: &Expr,
        body: &Stmt,
        heap: &mut Heap,
        reporter: &mut dyn Reporter,
    ) -> Result<(), ()> {
        let token = Rc::new(Token::new_synthetic(TokenType::While, "while"));
        let start = self.chunk.len();

        self.expr(condition, heap, reporter)?;
        let false_jump = self.chunk.emit_jump(Instruction::JumpIfFalse, None);
        self.chunk.emit_instr(Instruction::Pop, None);
        self.stmt(body, heap, reporter)?;
        self.emit_loop(start, Rc::clone(&token), reporter);
        self.patch_jump(false_jump, token, reporter);
        self.chunk.emit_instr(Instruction::Pop, None);

        Ok(())
    }

    fn for_stmt(
        &mut self,
        initializer: &Option<Box<Stmt>>,
        condition: &Option<Expr>,
        increment: &Option<Expr>,
        body: &Stmt,
        heap: &mut Heap,
        reporter: &mut dyn Reporter,
    ) -> Result<(), ()> {
        let token = Rc::new(Token::new_synthetic(TokenType::For, "for"));
        self.start_scope();

        if let Some(stmt) = initializer {
            self.stmt(stmt, heap, reporter)?;
        }

        let mut loop_start = self.chunk.len();

        let exit_jump = match condition {
            Some(condition) => {
                self.expr(condition, heap, reporter)?;
                let jump = self.chunk.emit_jump(Instruction::JumpIfFalse, None);
                self.chunk.emit_instr(Instruction::Pop, None);
                Some(jump)
            }
            None => None,
        };

        if let Some(increment) = increment {
            let body_jump = self.chunk.emit_jump(Instruction::Jump, None);
            let increment_start = self.chunk.len();
            self.expr(increment, heap, reporter)?;
            self.chunk.emit_instr(Instruction::Pop, None);
            self.emit_loop(loop_start, Rc::clone(&token), reporter);
            loop_start = increment_start;
            self.patch_jump(body_jump, Rc::clone(&token), reporter);
        }

        self.stmt(body, heap, reporter)?;
        self.emit_loop(loop_start, Rc::clone(&token), reporter);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump, token, reporter);
            self.chunk.emit_instr(Instruction::Pop, None);
        }

        self.end_scope();
        Ok(())
    }

    pub fn stmt(
        &mut self,
        stmt: &Stmt,
        heap: &mut Heap,
        reporter: &mut dyn Reporter,
    ) -> Result<(), ()> {
        match stmt {
            Stmt::Expr(expr) => {
                self.expr(expr, heap, reporter)?;
                self.chunk.emit_instr(Instruction::Pop, None);
            }
            Stmt::Print(token, expr) => {
                self.expr(expr, heap, reporter)?;
                self.chunk
                    .emit_instr(Instruction::Print, Some(Rc::clone(token)));
            }
            Stmt::Exit(token) => {
                self.chunk
                    .emit_instr(Instruction::Exit, Some(Rc::clone(token)));
            }
            Stmt::VarDecl(name, initializer) => {
                self.var_decl(Rc::clone(name), initializer, heap, reporter)?;
            }
            Stmt::ConstDecl(name, initializer) => {
                self.const_decl(Rc::clone(name), initializer, heap, reporter)?;
            }
            Stmt::FunctionDecl(name, params, body) => {
                if self
                    .function_decl(Rc::clone(name), params, body, heap, reporter)
                    .is_err()
                {
                    self.state.borrow_mut().had_error = true;
                    return Err(());
                }
            }
            Stmt::ClassDecl(name, superclass, methods) => {
                self.class_decl(Rc::clone(name), superclass, methods, heap, reporter)?;
            }
            Stmt::Return(token, value) => {
                self.return_stmt(Rc::clone(token), value, heap, reporter)?
            }
            Stmt::Block(stmts) => {
                self.start_scope();
                for stmt in stmts {
                    self.stmt(stmt, heap, reporter)?;
                }
                self.end_scope();
            }
            Stmt::If(condition, then_branch, else_branch) => {
                self.if_stmt(condition, then_branch, else_branch, heap, reporter)?
            }
            Stmt::While(condition, body) => self.while_stmt(condition, body, heap, reporter)?,
            Stmt::For(initializer, condition, increment, body) => {
                self.for_stmt(initializer, condition, increment, body, heap, reporter)?
            }
        }
        Ok(())
    }

    fn emit_return(&mut self) {
        match self.typ {
            // an initializer always hands back the receiver
            CompilerType::Initializer => {
                self.chunk.emit_instr(Instruction::GetLocal, None);
                self.chunk.emit_byte(0);
            }
            _ => {
                self.chunk.emit_instr(Instruction::Nil, None);
            }
        }
        self.chunk.emit_instr(Instruction::Return, None);
    }

    pub fn compile(
        &mut self,
        ast: &[Stmt],
        heap: &mut Heap,
        reporter: &mut dyn Reporter,
    ) -> Result<ObjRef, ()> {
        for stmt in ast {
            self.stmt(stmt, heap, reporter).ok();
        }

        self.emit_return();

        if self.state.borrow().had_error {
            Err(())
        } else {
            let name = self.name.as_ref().map(|name| heap.intern(name));
            let upvalue_count = self.state.borrow().up_values.len();
            let chunk = mem::replace(&mut self.chunk, Chunk::new());
            let function = Function::new(name, self.arity, upvalue_count, chunk);
            Ok(heap.alloc(Obj::Function(function)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::heap::Heap;
    use super::super::reporter::{Report, Reporter};
    use super::compile;

    struct ErrorsTracker {
        errors: Vec<Report>,
    }

    impl ErrorsTracker {
        fn new() -> Self {
            ErrorsTracker { errors: Vec::new() }
        }
    }

    impl Reporter for ErrorsTracker {
        fn warning(&mut self, _report: Report) {}

        fn error(&mut self, report: Report) {
            self.errors.push(report);
        }
    }

    fn compile_err(source: &'static str) -> Vec<String> {
        let mut heap = Heap::new();
        let mut tracker = ErrorsTracker::new();
        assert!(
            compile(source, &mut heap, &mut tracker).is_none(),
            "compiling {source:?} should have failed"
        );
        tracker.errors.into_iter().map(|report| report.msg).collect()
    }

    fn compile_ok(source: &'static str) {
        let mut heap = Heap::new();
        let mut tracker = ErrorsTracker::new();
        assert!(
            compile(source, &mut heap, &mut tracker).is_some(),
            "compiling {source:?} failed: {:?}",
            tracker.errors
        );
    }

    #[test]
    fn valid_programs() {
        compile_ok("print 1 + 2 * 3;");
        compile_ok("var a = 1; { var b = a; print b; }");
        compile_ok("fun f(x) { return f(x - 1); } f(3);");
        compile_ok("class A {} class B < A { m() { return super.m(); } }");
        compile_ok("class A { init(n) { this.n = n; } }");
        compile_ok("for (var i = 0; i < 3; i++) print i;");
        compile_ok("const K = 10; print K;");
    }

    #[test]
    fn top_level_return() {
        let errors = compile_err("return 1;");
        assert_eq!(errors[0], "Can't return from top-level code");
    }

    #[test]
    fn this_and_super_outside_class() {
        let errors = compile_err("print this;");
        assert_eq!(errors[0], "Can't use 'this' outside of a class");

        let errors = compile_err("fun f() { return super.m(); }");
        assert_eq!(errors[0], "Can't use 'super' outside of a class");

        let errors = compile_err("class A { m() { return super.m(); } }");
        assert_eq!(errors[0], "Can't use 'super' in a class with no superclass");
    }

    #[test]
    fn self_inheritance() {
        let errors = compile_err("class A < A {}");
        assert_eq!(errors[0], "A class can't inherit from itself");
    }

    #[test]
    fn constant_local_reassignment() {
        let errors = compile_err("{ const k = 1; k = 2; }");
        assert_eq!(errors[0], "Can't change the value of constant");

        let errors = compile_err("{ const k = 1; k += 2; }");
        assert_eq!(errors[0], "Can't change the value of constant");
    }

    #[test]
    fn initializer_returning_value() {
        let errors = compile_err("class A { init() { return 3; } }");
        assert_eq!(errors[0], "Can't return a value from an initializer");
    }

    #[test]
    fn duplicate_local() {
        let errors = compile_err("{ var a = 1; var a = 2; }");
        assert_eq!(
            errors[0],
            "A variable with this name already exists in this scope"
        );
    }
}
