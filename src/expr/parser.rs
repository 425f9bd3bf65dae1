//! Recursive-descent parser producing the expression AST
//!
//! Precedence, lowest first: conditional, `||`, `&&`, equality,
//! relational, additive, multiplicative, unary, postfix (member, index,
//! method call).

use serde_json::Value;

use super::lexer::{tokenize, Token};
use super::ExpressionError;

/// Parsed expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Array(Vec<Expr>),
    Name(String),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call {
        receiver: Box<Expr>,
        method: String,
        args: Vec<Expr>,
    },
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Conditional(Box<Expr>, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    And,
    Or,
    Eq,
    NotEq,
    StrictEq,
    StrictNotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl Expr {
    /// Names referenced at the root of member chains, e.g. `res` in `res.a.b`
    pub fn root_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_names(&mut names);
        names
    }

    fn collect_names<'a>(&'a self, names: &mut Vec<&'a str>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Name(name) => names.push(name),
            Expr::Array(items) => items.iter().for_each(|e| e.collect_names(names)),
            Expr::Member(target, _) => target.collect_names(names),
            Expr::Index(target, index) => {
                target.collect_names(names);
                index.collect_names(names);
            }
            Expr::Call { receiver, args, .. } => {
                receiver.collect_names(names);
                args.iter().for_each(|e| e.collect_names(names));
            }
            Expr::Unary(_, inner) => inner.collect_names(names),
            Expr::Binary(_, lhs, rhs) => {
                lhs.collect_names(names);
                rhs.collect_names(names);
            }
            Expr::Conditional(cond, then, otherwise) => {
                cond.collect_names(names);
                then.collect_names(names);
                otherwise.collect_names(names);
            }
        }
    }
}

/// Parse an expression source string
pub fn parse(source: &str) -> Result<Expr, ExpressionError> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err(ExpressionError::Syntax("Empty expression".to_string()));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.conditional()?;
    if let Some(token) = parser.peek() {
        return Err(ExpressionError::Syntax(format!(
            "Unexpected token {:?} in '{}'",
            token, source
        )));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token) -> Result<(), ExpressionError> {
        if self.eat(&expected) {
            Ok(())
        } else {
            Err(ExpressionError::Syntax(format!(
                "Expected {:?}, found {:?}",
                expected,
                self.peek()
            )))
        }
    }

    fn conditional(&mut self) -> Result<Expr, ExpressionError> {
        let cond = self.binary(0)?;
        if self.eat(&Token::Question) {
            let then = self.conditional()?;
            self.expect(Token::Colon)?;
            let otherwise = self.conditional()?;
            return Ok(Expr::Conditional(
                Box::new(cond),
                Box::new(then),
                Box::new(otherwise),
            ));
        }
        Ok(cond)
    }

    /// Binary operators by precedence climbing
    fn binary(&mut self, min_level: u8) -> Result<Expr, ExpressionError> {
        let mut lhs = self.unary()?;

        while let Some((op, level)) = self.peek().and_then(binary_op) {
            if level < min_level {
                break;
            }
            self.pos += 1;
            let rhs = self.binary(level + 1)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }

        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.eat(&Token::Not) {
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(self.unary()?)));
        }
        if self.eat(&Token::Minus) {
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.unary()?)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, ExpressionError> {
        let mut expr = self.primary()?;

        loop {
            if self.eat(&Token::Dot) {
                let name = match self.advance() {
                    Some(Token::Ident(name)) => name,
                    other => {
                        return Err(ExpressionError::Syntax(format!(
                            "Expected property name after '.', found {:?}",
                            other
                        )))
                    }
                };
                if self.eat(&Token::LParen) {
                    let args = self.arguments(Token::RParen)?;
                    expr = Expr::Call {
                        receiver: Box::new(expr),
                        method: name,
                        args,
                    };
                } else {
                    expr = Expr::Member(Box::new(expr), name);
                }
            } else if self.eat(&Token::LBracket) {
                let index = self.conditional()?;
                self.expect(Token::RBracket)?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                return Ok(expr);
            }
        }
    }

    fn arguments(&mut self, close: Token) -> Result<Vec<Expr>, ExpressionError> {
        let mut args = Vec::new();
        if self.eat(&close) {
            return Ok(args);
        }
        loop {
            args.push(self.conditional()?);
            if self.eat(&close) {
                return Ok(args);
            }
            self.expect(Token::Comma)?;
        }
    }

    fn primary(&mut self) -> Result<Expr, ExpressionError> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Literal(super::eval::number(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) | Some(Token::Undefined) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Ident(name)) => Ok(Expr::Name(name)),
            Some(Token::LParen) => {
                let inner = self.conditional()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBracket) => Ok(Expr::Array(self.arguments(Token::RBracket)?)),
            other => Err(ExpressionError::Syntax(format!(
                "Unexpected {:?}",
                other
            ))),
        }
    }
}

fn binary_op(token: &Token) -> Option<(BinaryOp, u8)> {
    Some(match token {
        Token::Or => (BinaryOp::Or, 0),
        Token::And => (BinaryOp::And, 1),
        Token::Eq => (BinaryOp::Eq, 2),
        Token::NotEq => (BinaryOp::NotEq, 2),
        Token::StrictEq => (BinaryOp::StrictEq, 2),
        Token::StrictNotEq => (BinaryOp::StrictNotEq, 2),
        Token::Lt => (BinaryOp::Lt, 3),
        Token::LtEq => (BinaryOp::LtEq, 3),
        Token::Gt => (BinaryOp::Gt, 3),
        Token::GtEq => (BinaryOp::GtEq, 3),
        Token::Plus => (BinaryOp::Add, 4),
        Token::Minus => (BinaryOp::Sub, 4),
        Token::Star => (BinaryOp::Mul, 5),
        Token::Slash => (BinaryOp::Div, 5),
        Token::Percent => (BinaryOp::Rem, 5),
        _ => return None,
    })
}
