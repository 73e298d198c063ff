//! Recursive-descent parser for the filter DSL.
//!
//! ```text
//! Expr    := Or
//! Or      := And ('OR' And)*
//! And     := Primary ('AND' Primary)*
//! Primary := '(' Expr ')' | Field Op Literal
//! ```
//!
//! AND binds tighter than OR; both associate left.

use super::token::{Token, TokenKind};
use super::{FilterError, FilterStage};

#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Id,
    MetadataRoot,
    MetadataKey(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Contains,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Num(f64),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Cmp { field: Field, op: CmpOp, literal: Literal, position: usize },
}

struct Parser<'a> {
    input: &'a str,
    tokens: &'a [Token],
    cursor: usize,
}

pub(crate) fn parse(input: &str, tokens: &[Token]) -> Result<Expr, FilterError> {
    let mut parser = Parser { input, tokens, cursor: 0 };
    if tokens.is_empty() {
        return Err(FilterError::at(
            FilterStage::Parser,
            input,
            0,
            "empty filter expression",
            "write a comparison like @metadata.topic = \"rust\"",
        ));
    }
    let expr = parser.parse_or()?;
    if let Some(token) = parser.peek() {
        return Err(FilterError::at(
            FilterStage::Parser,
            input,
            token.position,
            "trailing input after the expression",
            "join clauses with AND or OR",
        ));
    }
    Ok(expr)
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.cursor)
    }

    fn bump(&mut self) -> Option<&'a Token> {
        let token = self.tokens.get(self.cursor);
        if token.is_some() {
            self.cursor += 1;
        }
        token
    }

    fn end_position(&self) -> usize {
        self.tokens
            .last()
            .map(|t| t.position)
            .unwrap_or(0)
            .max(self.input.len().saturating_sub(1))
    }

    fn parse_or(&mut self) -> Result<Expr, FilterError> {
        let mut left = self.parse_and()?;
        while matches!(self.peek().map(|t| &t.kind), Some(TokenKind::Or)) {
            self.bump();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, FilterError> {
        let mut left = self.parse_primary()?;
        while matches!(self.peek().map(|t| &t.kind), Some(TokenKind::And)) {
            self.bump();
            let right = self.parse_primary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr, FilterError> {
        let Some(token) = self.bump() else {
            return Err(FilterError::at(
                FilterStage::Parser,
                self.input,
                self.end_position(),
                "expected a comparison or `(`",
                "the expression ended too early",
            ));
        };

        match &token.kind {
            TokenKind::LParen => {
                let inner = self.parse_or()?;
                match self.bump() {
                    Some(Token { kind: TokenKind::RParen, .. }) => Ok(inner),
                    Some(other) => Err(FilterError::at(
                        FilterStage::Parser,
                        self.input,
                        other.position,
                        "expected `)`",
                        "close the parenthesized group",
                    )),
                    None => Err(FilterError::at(
                        FilterStage::Parser,
                        self.input,
                        self.end_position(),
                        "unclosed `(`",
                        "close the parenthesized group",
                    )),
                }
            }
            TokenKind::Field { root, key } => {
                let field = match (root.as_str(), key) {
                    ("id", None) => Field::Id,
                    ("metadata", None) => Field::MetadataRoot,
                    ("metadata", Some(key)) => Field::MetadataKey(key.clone()),
                    _ => {
                        return Err(FilterError::at(
                            FilterStage::Parser,
                            self.input,
                            token.position,
                            format!("unknown field `@{root}`"),
                            "only @id and @metadata.<key> can be filtered",
                        ))
                    }
                };
                let op = self.parse_op()?;
                let literal = self.parse_literal()?;
                Ok(Expr::Cmp { field, op, literal, position: token.position })
            }
            _ => Err(FilterError::at(
                FilterStage::Parser,
                self.input,
                token.position,
                "expected a comparison or `(`",
                "comparisons start with @id or @metadata",
            )),
        }
    }

    fn parse_op(&mut self) -> Result<CmpOp, FilterError> {
        match self.bump() {
            Some(Token { kind: TokenKind::Eq, .. }) => Ok(CmpOp::Eq),
            Some(Token { kind: TokenKind::Contains, .. }) => Ok(CmpOp::Contains),
            Some(other) => Err(FilterError::at(
                FilterStage::Parser,
                self.input,
                other.position,
                "expected `=` or CONTAINS",
                "comparisons look like @metadata.topic = \"rust\"",
            )),
            None => Err(FilterError::at(
                FilterStage::Parser,
                self.input,
                self.end_position(),
                "expected `=` or CONTAINS",
                "the expression ended after a field",
            )),
        }
    }

    fn parse_literal(&mut self) -> Result<Literal, FilterError> {
        match self.bump() {
            Some(Token { kind: TokenKind::Str(s), .. }) => Ok(Literal::Str(s.clone())),
            Some(Token { kind: TokenKind::Num(n), .. }) => Ok(Literal::Num(*n)),
            Some(Token { kind: TokenKind::Bool(b), .. }) => Ok(Literal::Bool(*b)),
            Some(other) => Err(FilterError::at(
                FilterStage::Parser,
                self.input,
                other.position,
                "expected a literal value",
                "literals are quoted strings, numbers, true, or false",
            )),
            None => Err(FilterError::at(
                FilterStage::Parser,
                self.input,
                self.end_position(),
                "expected a literal value",
                "the expression ended after an operator",
            )),
        }
    }
}
