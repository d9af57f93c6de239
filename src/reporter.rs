use super::token::Token;
use std::fmt;
use std::rc::Rc;

#[derive(Debug)]
pub enum Phase {
    Tokenizing,
    Parsing,
    Compilation,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Phase::Tokenizing => write!(f, "lexical"),
            Phase::Parsing => write!(f, "syntax"),
            Phase::Compilation => write!(f, "compile"),
        }
    }
}

#[derive(Debug)]
pub struct Report {
    pub phase: Phase,
    pub msg: String,
    pub token: Rc<Token>,
}

impl Report {
    pub fn new(phase: Phase, msg: String, token: Rc<Token>) -> Self {
        Report { phase, msg, token }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (line, col) = self.token.get_pos();
        write!(f, "{} [{}:{}]\n{}", self.msg, line, col, self.token)
    }
}

pub trait Reporter {
    fn warning(&mut self, report: Report);
    fn error(&mut self, report: Report);
}
