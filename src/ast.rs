use super::token::Token;
use std::fmt;
use std::rc::Rc;

pub enum Literal {
    Number(Rc<Token>),
    String(Rc<Token>),
    Bool(Rc<Token>),
    Nil(Rc<Token>),
}

pub enum Expr {
    Literal(Literal),
    Variable(Rc<Token>),
    This(Rc<Token>),
    /// `super.method` — the keyword token and the method name.
    Super(Rc<Token>, Rc<Token>),
    Unary(Rc<Token>, Box<Expr>),
    /// `x++` / `x--`.
    Postfix(Rc<Token>, Box<Expr>),
    Binary(Rc<Token>, Box<Expr>, Box<Expr>),
    /// `object.name` — the period token, the object and the property name.
    Get(Rc<Token>, Box<Expr>, Rc<Token>),
    /// `object.name <op> value` — the operator token carries which
    /// assignment flavor it is.
    Set(Rc<Token>, Box<Expr>, Rc<Token>, Box<Expr>),
    Call(Rc<Token>, Box<Expr>, Vec<Expr>),
}

pub struct Method {
    pub name: Rc<Token>,
    pub params: Vec<Rc<Token>>,
    pub body: Stmt,
}

pub enum Stmt {
    Expr(Expr),
    Print(Rc<Token>, Expr),
    Exit(Rc<Token>),
    VarDecl(Rc<Token>, Option<Expr>),
    ConstDecl(Rc<Token>, Expr),
    FunctionDecl(Rc<Token>, Vec<Rc<Token>>, Box<Stmt>),
    ClassDecl(Rc<Token>, Option<Rc<Token>>, Vec<Method>),
    Return(Rc<Token>, Option<Expr>),
    If(Expr, Box<Stmt>, Option<Box<Stmt>>),
    While(Expr, Box<Stmt>),
    For(
        Option<Box<Stmt>>,
        Option<Expr>,
        Option<Expr>,
        Box<Stmt>,
    ),
    Block(Vec<Stmt>),
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Expr::Literal(literal) => match literal {
                Literal::Number(token)
                | Literal::String(token)
                | Literal::Bool(token)
                | Literal::Nil(token) => write!(f, "{}", token.lexeme),
            },
            Expr::Variable(token) => write!(f, "{}", token.lexeme),
            Expr::This(_) => write!(f, "this"),
            Expr::Super(_, method) => write!(f, "(super {})", method.lexeme),
            Expr::Unary(op, expr) => write!(f, "({} {:?})", op.lexeme, expr),
            Expr::Postfix(op, expr) => write!(f, "({} {:?})", op.lexeme, expr),
            Expr::Binary(op, left, right) => {
                write!(f, "({} {:?} {:?})", op.lexeme, left, right)
            }
            Expr::Get(_, object, name) => write!(f, "(get {:?} {})", object, name.lexeme),
            Expr::Set(op, object, name, value) => {
                write!(f, "(set{} {:?} {} {:?})", op.lexeme, object, name.lexeme, value)
            }
            Expr::Call(_, callee, args) => {
                write!(f, "(call {:?} [", callee)?;
                for (idx, arg) in args.iter().enumerate() {
                    if idx > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{:?}", arg)?;
                }
                write!(f, "])")
            }
        }
    }
}

impl fmt::Debug for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Stmt::Expr(expr) => write!(f, "(expr {:?})", expr),
            Stmt::Print(_, expr) => write!(f, "(print {:?})", expr),
            Stmt::Exit(_) => write!(f, "(exit)"),
            Stmt::VarDecl(name, initializer) => match initializer {
                Some(expr) => write!(f, "(var {} {:?})", name.lexeme, expr),
                None => write!(f, "(var {})", name.lexeme),
            },
            Stmt::ConstDecl(name, initializer) => {
                write!(f, "(const {} {:?})", name.lexeme, initializer)
            }
            Stmt::FunctionDecl(name, params, body) => {
                write!(f, "(fun {} (", name.lexeme)?;
                for (idx, param) in params.iter().enumerate() {
                    if idx > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", param.lexeme)?;
                }
                write!(f, ") {:?})", body)
            }
            Stmt::ClassDecl(name, superclass, methods) => {
                write!(f, "(class {}", name.lexeme)?;
                if let Some(superclass) = superclass {
                    write!(f, " < {}", superclass.lexeme)?;
                }
                for method in methods {
                    write!(f, " {}", method.name.lexeme)?;
                }
                write!(f, ")")
            }
            Stmt::Return(_, value) => match value {
                Some(expr) => write!(f, "(return {:?})", expr),
                None => write!(f, "(return)"),
            },
            Stmt::If(condition, then_branch, else_branch) => {
                write!(f, "(if {:?} {:?}", condition, then_branch)?;
                if let Some(else_branch) = else_branch {
                    write!(f, " {:?}", else_branch)?;
                }
                write!(f, ")")
            }
            Stmt::While(condition, body) => write!(f, "(while {:?} {:?})", condition, body),
            Stmt::For(initializer, condition, increment, body) => {
                write!(f, "(for")?;
                if let Some(initializer) = initializer {
                    write!(f, " {:?}", initializer)?;
                }
                if let Some(condition) = condition {
                    write!(f, " {:?}", condition)?;
                }
                if let Some(increment) = increment {
                    write!(f, " {:?}", increment)?;
                }
                write!(f, " {:?})", body)
            }
            Stmt::Block(stmts) => {
                write!(f, "(block")?;
                for stmt in stmts {
                    write!(f, " {:?}", stmt)?;
                }
                write!(f, ")")
            }
        }
    }
}
