//! Recursive-descent parser for the restricted grammar.
//!
//! Precedence, loosest to tightest: `or`, `and`, comparison, additive,
//! multiplicative, unary (`not`, `-`), primary.

use super::ast::{BinOp, Expr, Func, UnaryOp};
use super::lexer::{Token, TokenKind};
use super::ExprError;
use crate::model::Scalar;

/// Parse a token list into an expression tree.
pub fn parse(tokens: &[Token]) -> Result<Expr, ExprError> {
    let mut parser = Parser { tokens, index: 0 };
    let expr = parser.or_expr()?;
    if let Some(tok) = parser.peek() {
        return Err(ExprError::Parse {
            pos: tok.pos,
            message: format!("unexpected trailing token {:?}", tok.kind),
        });
    }
    Ok(expr)
}

struct Parser<'a> {
    tokens: &'a [Token],
    index: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.index)
    }

    fn advance(&mut self) -> Option<&'a Token> {
        let tok = self.tokens.get(self.index);
        self.index += 1;
        tok
    }

    fn end_pos(&self) -> usize {
        self.tokens.last().map(|t| t.pos + 1).unwrap_or(0)
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> Result<(), ExprError> {
        match self.advance() {
            Some(tok) if &tok.kind == kind => Ok(()),
            Some(tok) => Err(ExprError::Parse {
                pos: tok.pos,
                message: format!("expected {}, found {:?}", what, tok.kind),
            }),
            None => Err(ExprError::Parse {
                pos: self.end_pos(),
                message: format!("expected {}, found end of expression", what),
            }),
        }
    }

    fn or_expr(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.and_expr()?;
        while matches!(self.peek().map(|t| &t.kind), Some(TokenKind::Or)) {
            self.advance();
            let right = self.and_expr()?;
            left = Expr::Binary {
                op: BinOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.comparison()?;
        while matches!(self.peek().map(|t| &t.kind), Some(TokenKind::And)) {
            self.advance();
            let right = self.comparison()?;
            left = Expr::Binary {
                op: BinOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn comparison(&mut self) -> Result<Expr, ExprError> {
        let left = self.additive()?;
        let op = match self.peek().map(|t| &t.kind) {
            Some(TokenKind::EqEq) => BinOp::Eq,
            Some(TokenKind::NotEq) => BinOp::Ne,
            Some(TokenKind::Lt) => BinOp::Lt,
            Some(TokenKind::Le) => BinOp::Le,
            Some(TokenKind::Gt) => BinOp::Gt,
            Some(TokenKind::Ge) => BinOp::Ge,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.additive()?;
        Ok(Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn additive(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek().map(|t| &t.kind) {
                Some(TokenKind::Plus) => BinOp::Add,
                Some(TokenKind::Minus) => BinOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.multiplicative()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek().map(|t| &t.kind) {
                Some(TokenKind::Star) => BinOp::Mul,
                Some(TokenKind::Slash) => BinOp::Div,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        match self.peek().map(|t| &t.kind) {
            Some(TokenKind::Not) => {
                self.advance();
                let operand = self.unary()?;
                Ok(Expr::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                })
            }
            Some(TokenKind::Minus) => {
                self.advance();
                let operand = self.unary()?;
                Ok(Expr::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(operand),
                })
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        let tok = self.advance().ok_or_else(|| ExprError::Parse {
            pos: self.end_pos(),
            message: "expected an operand, found end of expression".into(),
        })?;
        match &tok.kind {
            TokenKind::Number(n) => Ok(Expr::Literal(Scalar::Num(*n))),
            TokenKind::Str(s) => Ok(Expr::Literal(Scalar::Str(s.clone()))),
            TokenKind::Bool(b) => Ok(Expr::Literal(Scalar::Bool(*b))),
            TokenKind::LParen => {
                let inner = self.or_expr()?;
                self.expect(&TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            TokenKind::Ident(name) => {
                // A '(' after an identifier makes it a function call.
                if matches!(self.peek().map(|t| &t.kind), Some(TokenKind::LParen)) {
                    self.advance();
                    let func = Func::from_name(name).ok_or_else(|| ExprError::UnknownFunction {
                        name: name.clone(),
                    })?;
                    let key = if func.takes_key() {
                        let arg = self.advance().ok_or_else(|| ExprError::Parse {
                            pos: self.end_pos(),
                            message: format!("{}() requires a string key", name),
                        })?;
                        match &arg.kind {
                            TokenKind::Str(s) => Some(s.clone()),
                            other => {
                                return Err(ExprError::Parse {
                                    pos: arg.pos,
                                    message: format!(
                                        "{}() takes a double-quoted key, found {:?}",
                                        name, other
                                    ),
                                });
                            }
                        }
                    } else {
                        None
                    };
                    self.expect(&TokenKind::RParen, "')'")?;
                    Ok(Expr::Call { func, key })
                } else {
                    Ok(Expr::Ident(name.clone()))
                }
            }
            other => Err(ExprError::Parse {
                pos: tok.pos,
                message: format!("unexpected token {:?}", other),
            }),
        }
    }
}
