use super::ast::{Expr, Literal, Method, Stmt};
use super::operators::{Associativity, OPERATORS};
use super::reporter::{Phase, Report, Reporter};
use super::token::{Token, TokenType, BINARY_SET, BOUNDARIES, INVALID_TYPES};
use super::tokenizer::Tokenizer;
use std::rc::Rc;

pub struct Parser<'a, 'c> {
    current: Token,
    previous: Option<Token>,
    tokenizer: &'a mut Tokenizer,
    reporter: &'c mut dyn Reporter,
    had_error: bool,
}

impl<'a, 'c> Parser<'a, 'c> {
    pub fn new(tokenizer: &'a mut Tokenizer, reporter: &'c mut dyn Reporter) -> Self {
        Self {
            current: tokenizer.next_token(reporter),
            previous: None,
            tokenizer,
            reporter,
            had_error: false,
        }
    }

    fn error_at(&mut self, token: &Token, msg: &str) {
        let report = Report::new(Phase::Parsing, msg.to_string(), Rc::new(token.clone()));
        self.reporter.error(report);
        self.had_error = true;
    }

    fn check_previous(&self) -> Result<(), ()> {
        match &self.previous {
            Some(token) => {
                if INVALID_TYPES.contains(&token.typ) {
                    return Err(());
                }
                Ok(())
            }
            None => unreachable!(),
        }
    }

    fn advance(&mut self) -> Result<(), ()> {
        loop {
            if self.current.typ == TokenType::Comment {
                self.current = self.tokenizer.next_token(self.reporter);
                continue;
            }
            if self.current.typ == TokenType::EOF {
                break;
            }

            self.previous = Some(self.current.clone());
            self.check_previous()?;
            self.current = self.tokenizer.next_token(self.reporter);
            break;
        }

        Ok(())
    }

    fn next(&mut self) -> Result<Token, ()> {
        self.advance()?;
        Ok(self.previous.as_ref().unwrap().clone())
    }

    fn consume(&mut self, typ: TokenType, msg: &'static str) -> Result<(), ()> {
        if self.check(typ) {
            self.advance()?;
            Ok(())
        } else {
            let token = self.current.clone();
            self.error_at(&token, msg);
            Err(())
        }
    }

    fn peek(&mut self) -> Token {
        while self.current.typ == TokenType::Comment {
            self.current = self.tokenizer.next_token(self.reporter);
        }

        self.current.clone()
    }

    fn check(&mut self, typ: TokenType) -> bool {
        self.peek().typ == typ
    }

    fn at_end(&mut self) -> bool {
        self.check(TokenType::EOF)
    }

    fn exprs(&mut self) -> Result<Vec<Expr>, ()> {
        let mut items = vec![self.parse_expr()?];
        while self.check(TokenType::Comma) {
            self.advance()?;
            if self.check(TokenType::CParen) {
                break;
            }
            items.push(self.parse_expr()?);
        }
        Ok(items)
    }

    fn literal(&mut self) -> Result<Expr, ()> {
        let token = self.previous.as_ref().unwrap().clone();

        match token.typ {
            TokenType::Identifier => Ok(Expr::Variable(Rc::new(token))),
            TokenType::Number => Ok(Expr::Literal(Literal::Number(Rc::new(token)))),
            TokenType::String => Ok(Expr::Literal(Literal::String(Rc::new(token)))),
            TokenType::True | TokenType::False => Ok(Expr::Literal(Literal::Bool(Rc::new(token)))),
            TokenType::Nil => Ok(Expr::Literal(Literal::Nil(Rc::new(token)))),
            _ => unreachable!(),
        }
    }

    fn unary(&mut self) -> Result<Expr, ()> {
        let token = self.previous.as_ref().unwrap().clone();

        let row: usize = token.typ.into();
        let prefix_precedence = OPERATORS[row].0.unwrap();
        let right = self.expr(prefix_precedence, false)?;
        Ok(Expr::Unary(Rc::new(token), Box::new(right)))
    }

    fn group(&mut self) -> Result<Expr, ()> {
        let expr = self.parse_expr()?;
        self.consume(TokenType::CParen, "Expected ')' after expression")?;

        Ok(expr)
    }

    fn super_(&mut self) -> Result<Expr, ()> {
        let token = self.previous.as_ref().unwrap().clone();
        self.consume(TokenType::Period, "Expected '.' after 'super'")?;
        self.consume(TokenType::Identifier, "Expected superclass method name")?;
        let method = self.previous.as_ref().unwrap().clone();
        Ok(Expr::Super(Rc::new(token), Rc::new(method)))
    }

    fn assignable(expr: &Expr) -> bool {
        matches!(expr, Expr::Variable(_) | Expr::Get(..))
    }

    /// Parses any expression whose operators bind at least as tightly as
    /// `min_precedence`.
    fn expr(&mut self, min_precedence: u8, mut can_assign: bool) -> Result<Expr, ()> {
        let mut token = self.next()?;
        let mut expr;

        expr = match token.typ {
            TokenType::Identifier
            | TokenType::Number
            | TokenType::String
            | TokenType::True
            | TokenType::False
            | TokenType::Nil => self.literal()?,
            TokenType::This => Expr::This(Rc::new(token.clone())),
            TokenType::Super => self.super_()?,
            TokenType::Minus | TokenType::Bang => self.unary()?,
            TokenType::OParen => {
                can_assign = false;
                self.group()?
            }
            _ => {
                self.error_at(&token, "Expected an expression");
                return Err(());
            }
        };

        while !self.at_end() {
            token = self.peek();

            let row: usize = token.typ.into();

            if let Some(infix_precedence) = OPERATORS[row].1 {
                let associativity = OPERATORS[row].3.unwrap();

                if min_precedence < infix_precedence {
                    break;
                }

                if !BINARY_SET.contains(&token.typ) {
                    can_assign = false;
                }

                self.advance()?;

                if BINARY_SET.contains(&token.typ)
                    && (!can_assign || !Self::assignable(&expr))
                {
                    self.error_at(&token, "Invalid assignment target");
                    return Err(());
                }

                let right = self.expr(
                    match associativity {
                        Associativity::Right => infix_precedence,
                        Associativity::Left => infix_precedence - 1,
                    },
                    can_assign,
                )?;

                expr = if BINARY_SET.contains(&token.typ) {
                    match expr {
                        Expr::Get(_, object, name) => {
                            Expr::Set(Rc::new(token), object, name, Box::new(right))
                        }
                        _ => Expr::Binary(Rc::new(token), Box::new(expr), Box::new(right)),
                    }
                } else {
                    Expr::Binary(Rc::new(token), Box::new(expr), Box::new(right))
                };
            } else if let Some(postfix_precedence) = OPERATORS[row].2 {
                if min_precedence < postfix_precedence {
                    break;
                }
                self.advance()?;

                match token.typ {
                    TokenType::OParen => {
                        let args = if self.check(TokenType::CParen) {
                            vec![]
                        } else {
                            self.exprs()?
                        };
                        self.consume(TokenType::CParen, "Expected ')' after arguments")?;

                        expr = Expr::Call(Rc::new(token), Box::new(expr), args);
                    }
                    TokenType::Period => {
                        self.consume(TokenType::Identifier, "Expected property name after '.'")?;
                        let name = self.previous.as_ref().unwrap().clone();
                        expr = Expr::Get(Rc::new(token), Box::new(expr), Rc::new(name));
                    }
                    TokenType::DPlus | TokenType::DMinus => {
                        if !Self::assignable(&expr) {
                            self.error_at(&token, "Invalid assignment target");
                            return Err(());
                        }
                        expr = Expr::Postfix(Rc::new(token), Box::new(expr));
                    }
                    _ => unreachable!(),
                }
            } else {
                break;
            }
        }

        Ok(expr)
    }

    fn block(&mut self) -> Result<Stmt, ()> {
        let mut stmts = vec![];
        while !self.at_end() && !self.check(TokenType::CBrace) {
            stmts.push(self.decl()?);
        }
        self.consume(TokenType::CBrace, "Expected '}' after block")?;
        Ok(Stmt::Block(stmts))
    }

    fn print_stmt(&mut self) -> Result<Stmt, ()> {
        let token = self.previous.as_ref().unwrap().clone();
        let value = self.parse_expr()?;
        self.consume(TokenType::Semicolon, "Expected ';' after value")?;
        Ok(Stmt::Print(Rc::new(token), value))
    }

    fn exit_stmt(&mut self) -> Result<Stmt, ()> {
        let token = self.previous.as_ref().unwrap().clone();
        self.consume(TokenType::Semicolon, "Expected ';' after 'exit'")?;
        Ok(Stmt::Exit(Rc::new(token)))
    }

    fn return_stmt(&mut self) -> Result<Stmt, ()> {
        let token = self.previous.as_ref().unwrap().clone();

        if self.check(TokenType::Semicolon) {
            self.advance()?;
            return Ok(Stmt::Return(Rc::new(token), None));
        }

        let value = self.parse_expr()?;
        self.consume(TokenType::Semicolon, "Expected ';' after return value")?;
        Ok(Stmt::Return(Rc::new(token), Some(value)))
    }

    fn params(&mut self) -> Result<Vec<Rc<Token>>, ()> {
        let mut params = vec![];

        if self.check(TokenType::Identifier) {
            self.advance()?;
            params.push(Rc::new(self.previous.as_ref().unwrap().clone()));
        }
        while self.check(TokenType::Comma) {
            self.advance()?;
            if self.check(TokenType::CParen) {
                break;
            }
            self.consume(TokenType::Identifier, "Expected parameter name")?;
            params.push(Rc::new(self.previous.as_ref().unwrap().clone()));
        }

        Ok(params)
    }

    fn function_decl(&mut self) -> Result<Stmt, ()> {
        self.consume(TokenType::Identifier, "Expected function name")?;
        let name = self.previous.as_ref().unwrap().clone();
        self.consume(TokenType::OParen, "Expected '(' after function name")?;
        let params = self.params()?;
        self.consume(TokenType::CParen, "Expected ')' after parameters")?;
        self.consume(TokenType::OBrace, "Expected '{' before function body")?;
        let body = self.block()?;
        Ok(Stmt::FunctionDecl(Rc::new(name), params, Box::new(body)))
    }

    fn method(&mut self) -> Result<Method, ()> {
        self.consume(TokenType::Identifier, "Expected method name")?;
        let name = self.previous.as_ref().unwrap().clone();
        self.consume(TokenType::OParen, "Expected '(' after method name")?;
        let params = self.params()?;
        self.consume(TokenType::CParen, "Expected ')' after parameters")?;
        self.consume(TokenType::OBrace, "Expected '{' before method body")?;
        let body = self.block()?;
        Ok(Method {
            name: Rc::new(name),
            params,
            body,
        })
    }

    fn class_decl(&mut self) -> Result<Stmt, ()> {
        self.consume(TokenType::Identifier, "Expected class name")?;
        let name = self.previous.as_ref().unwrap().clone();

        let superclass = if self.check(TokenType::Less) {
            self.advance()?;
            self.consume(TokenType::Identifier, "Expected superclass name")?;
            Some(Rc::new(self.previous.as_ref().unwrap().clone()))
        } else {
            None
        };

        self.consume(TokenType::OBrace, "Expected '{' before class body")?;
        let mut methods = vec![];
        while !self.at_end() && !self.check(TokenType::CBrace) {
            methods.push(self.method()?);
        }
        self.consume(TokenType::CBrace, "Expected '}' after class body")?;

        Ok(Stmt::ClassDecl(Rc::new(name), superclass, methods))
    }

    fn var_decl(&mut self) -> Result<Stmt, ()> {
        self.consume(TokenType::Identifier, "Expected variable name")?;
        let name = self.previous.as_ref().unwrap().clone();
        let initializer = if self.check(TokenType::Equal) {
            self.advance()?;
            Some(self.parse_expr()?)
        } else {
            None
        };
        self.consume(TokenType::Semicolon, "Expected ';' after variable declaration")?;
        Ok(Stmt::VarDecl(Rc::new(name), initializer))
    }

    fn const_decl(&mut self) -> Result<Stmt, ()> {
        self.consume(TokenType::Identifier, "Expected constant name")?;
        let name = self.previous.as_ref().unwrap().clone();
        self.consume(TokenType::Equal, "Expected '=' after constant name")?;
        let initializer = self.parse_expr()?;
        self.consume(TokenType::Semicolon, "Expected ';' after constant declaration")?;
        Ok(Stmt::ConstDecl(Rc::new(name), initializer))
    }

    fn if_stmt(&mut self) -> Result<Stmt, ()> {
        self.consume(TokenType::OParen, "Expected '(' after 'if'")?;
        let condition = self.parse_expr()?;
        self.consume(TokenType::CParen, "Expected ')' after condition")?;
        let then_branch = self.stmt()?;
        let else_branch = if self.check(TokenType::Else) {
            self.advance()?;
            Some(Box::new(self.stmt()?))
        } else {
            None
        };

        Ok(Stmt::If(condition, Box::new(then_branch), else_branch))
    }

    fn while_stmt(&mut self) -> Result<Stmt, ()> {
        self.consume(TokenType::OParen, "Expected '(' after 'while'")?;
        let condition = self.parse_expr()?;
        self.consume(TokenType::CParen, "Expected ')' after condition")?;
        let body = self.stmt()?;
        Ok(Stmt::While(condition, Box::new(body)))
    }

    fn for_stmt(&mut self) -> Result<Stmt, ()> {
        self.consume(TokenType::OParen, "Expected '(' after 'for'")?;

        let initializer = if self.check(TokenType::Semicolon) {
            self.advance()?;
            None
        } else if self.check(TokenType::Var) {
            self.advance()?;
            Some(Box::new(self.var_decl()?))
        } else {
            let expr = self.parse_expr()?;
            self.consume(TokenType::Semicolon, "Expected ';' after loop initializer")?;
            Some(Box::new(Stmt::Expr(expr)))
        };

        let condition = if self.check(TokenType::Semicolon) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.consume(TokenType::Semicolon, "Expected ';' after loop condition")?;

        let increment = if self.check(TokenType::CParen) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.consume(TokenType::CParen, "Expected ')' after for clauses")?;

        let body = self.stmt()?;
        Ok(Stmt::For(
            initializer,
            condition,
            increment,
            Box::new(body),
        ))
    }

    fn expr_stmt(&mut self) -> Result<Stmt, ()> {
        let expr = self.parse_expr()?;
        self.consume(TokenType::Semicolon, "Expected ';' after expression")?;
        Ok(Stmt::Expr(expr))
    }

    fn stmt(&mut self) -> Result<Stmt, ()> {
        if self.check(TokenType::Print) {
            self.advance()?;
            self.print_stmt()
        } else if self.check(TokenType::Exit) {
            self.advance()?;
            self.exit_stmt()
        } else if self.check(TokenType::If) {
            self.advance()?;
            self.if_stmt()
        } else if self.check(TokenType::While) {
            self.advance()?;
            self.while_stmt()
        } else if self.check(TokenType::For) {
            self.advance()?;
            self.for_stmt()
        } else if self.check(TokenType::Return) {
            self.advance()?;
            self.return_stmt()
        } else if self.check(TokenType::OBrace) {
            self.advance()?;
            self.block()
        } else {
            self.expr_stmt()
        }
    }

    fn decl(&mut self) -> Result<Stmt, ()> {
        if self.check(TokenType::Class) {
            self.advance()?;
            self.class_decl()
        } else if self.check(TokenType::Fun) {
            self.advance()?;
            self.function_decl()
        } else if self.check(TokenType::Var) {
            self.advance()?;
            self.var_decl()
        } else if self.check(TokenType::Const) {
            self.advance()?;
            self.const_decl()
        } else {
            self.stmt()
        }
    }

    fn sync(&mut self) {
        while !self.check(TokenType::EOF) {
            if BOUNDARIES.contains(&self.peek().typ) {
                break;
            }
            self.advance().ok();
        }
    }

    pub fn parse_expr(&mut self) -> Result<Expr, ()> {
        self.expr(11, true)
    }

    pub fn parse(&mut self) -> Result<Vec<Stmt>, ()> {
        let mut decls = vec![];
        while !self.at_end() {
            match self.decl() {
                Ok(decl) => decls.push(decl),
                Err(_) => {
                    self.sync();
                }
            }
        }
        if self.had_error {
            Err(())
        } else {
            Ok(decls)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::reporter::{Report, Reporter};
    use super::super::tokenizer::Tokenizer;
    use super::Parser;

    pub struct ErrorsTracker {
        errors: Vec<Report>,
        warnings: Vec<Report>,
    }

    impl ErrorsTracker {
        pub fn new() -> Self {
            ErrorsTracker {
                errors: Vec::new(),
                warnings: Vec::new(),
            }
        }
    }

    impl Reporter for ErrorsTracker {
        fn warning(&mut self, report: Report) {
            self.warnings.push(report);
        }

        fn error(&mut self, report: Report) {
            self.errors.push(report);
        }
    }

    fn test_valid_expr(input: &'static str, expected: &'static str) {
        let mut errors_tracker = ErrorsTracker::new();
        let mut tokenizer = Tokenizer::new(input);
        let mut parser = Parser::new(&mut tokenizer, &mut errors_tracker);
        let expr = match parser.parse_expr() {
            Ok(expr) => expr,
            Err(_) => {
                for report in errors_tracker.errors {
                    println!("{:?}", report);
                }
                panic!("Parsing {} failed", input);
            }
        };
        assert_eq!(format!("{:?}", expr), expected);
    }

    fn test_invalid_expr(input: &'static str, expected_error: &'static str) {
        let mut errors_tracker = ErrorsTracker::new();
        let mut tokenizer = Tokenizer::new(input);
        let mut parser = Parser::new(&mut tokenizer, &mut errors_tracker);
        match parser.parse_expr() {
            Ok(_) => panic!("Parsing {} succeeded, but it should have failed", input),
            Err(_) => {
                assert_eq!(errors_tracker.errors[0].msg, expected_error);
            }
        };
    }

    #[test]
    fn parsing_exprs() {
        // precedence
        test_valid_expr("1 + 2 * 3", "(+ 1 (* 2 3))");
        test_valid_expr("1 << 2 + 3", "(<< 1 (+ 2 3))");
        test_valid_expr("1 < 2 << 3", "(< 1 (<< 2 3))");
        test_valid_expr("4 == 4 and true or false", "(or (and (== 4 4) true) false)");
        test_valid_expr("-add(3, 2).value", "(- (get (call add [3 2]) value))");

        // associativity
        test_valid_expr("1 + 2 + 3", "(+ (+ 1 2) 3)");
        test_valid_expr("2 ** 3 ** 2", "(** 2 (** 3 2))");
        test_valid_expr("a = b = c", "(= a (= b c))");

        // parentheses
        test_valid_expr("(1 + 2) * 3", "(* (+ 1 2) 3)");

        // setters and assignment flavors
        test_valid_expr("a.b = 3", "(set= a b 3)");
        test_valid_expr("a.b += 3", "(set+= a b 3)");
        test_valid_expr("x **= 2", "(**= x 2)");
        test_valid_expr("x++", "(++ x)");
        test_valid_expr("a.b--", "(-- (get a b))");
        test_invalid_expr("3 + x = 4", "Invalid assignment target");
        test_invalid_expr("x + 3 = 4", "Invalid assignment target");
        test_invalid_expr("3 + x.y = 4", "Invalid assignment target");
        test_invalid_expr("(x) = 4", "Invalid assignment target");
        test_invalid_expr("f()++", "Invalid assignment target");

        // this and super
        test_valid_expr("this.x", "(get this x)");
        test_valid_expr("super.m(1)", "(call (super m) [1])");

        // random errors
        test_invalid_expr("f(1, 2", "Expected ')' after arguments");
        test_invalid_expr("a.", "Expected property name after '.'");
        test_invalid_expr("super", "Expected '.' after 'super'");
        test_invalid_expr("* 2", "Expected an expression");
    }

    #[test]
    fn parsing_stmts() {
        fn test_valid_stmt(input: &'static str, expected: &'static str) {
            let mut errors_tracker = ErrorsTracker::new();
            let mut tokenizer = Tokenizer::new(input);
            let mut parser = Parser::new(&mut tokenizer, &mut errors_tracker);
            let stmts = match parser.parse() {
                Ok(stmts) => stmts,
                Err(_) => panic!("Parsing {} failed", input),
            };
            let rendered = stmts
                .iter()
                .map(|stmt| format!("{:?}", stmt))
                .collect::<Vec<_>>()
                .join(" ");
            assert_eq!(rendered, expected);
        }

        test_valid_stmt("print 1 + 2;", "(print (+ 1 2))");
        test_valid_stmt("var x = 3; x = 4;", "(var x 3) (expr (= x 4))");
        test_valid_stmt("const K = 10;", "(const K 10)");
        test_valid_stmt(
            "if (x) { print 1; } else { print 2; }",
            "(if x (block (print 1)) (block (print 2)))",
        );
        test_valid_stmt("if (x) print 1;", "(if x (print 1))");
        test_valid_stmt("while (x) x = x - 1;", "(while x (expr (= x (- x 1))))");
        test_valid_stmt(
            "for (var i = 0; i < 3; i++) print i;",
            "(for (var i 0) (< i 3) (++ i) (print i))",
        );
        test_valid_stmt("fun id(x) { return x; }", "(fun id (x) (block (return x)))");
        test_valid_stmt(
            "class A < B { init(n) { } hi() { } }",
            "(class A < B init hi)",
        );
        test_valid_stmt("exit;", "(exit)");
    }

    #[test]
    fn error_recovery() {
        let mut errors_tracker = ErrorsTracker::new();
        let mut tokenizer = Tokenizer::new("var = 1;\nprint 2;\nvar y = ;");
        let mut parser = Parser::new(&mut tokenizer, &mut errors_tracker);
        assert!(parser.parse().is_err());
        // both bad declarations are reported, not just the first
        assert!(errors_tracker.errors.len() >= 2);
    }
}
