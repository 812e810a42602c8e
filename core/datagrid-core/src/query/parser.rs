//! Pratt parser for the expression language

use super::ast::{BinaryOp, CompareOp, Expr, Literal, UnaryOp};
use super::token::{Spanned, Token, tokenize};
use crate::error::{DgError, DgResult};

// Binding powers, loosest first.
const PREC_TERNARY: u8 = 5;
const PREC_OR: u8 = 10;
const PREC_AND: u8 = 20;
const PREC_NOT: u8 = 30;
const PREC_COMPARISON: u8 = 40;
const PREC_ADD_SUB: u8 = 60;
const PREC_MUL_DIV_MOD: u8 = 70;
const PREC_UNARY: u8 = 80;
const PREC_POW: u8 = 90;
const PREC_POSTFIX: u8 = 100;

/// Deepest expression tree the parser builds. Compilation and evaluation
/// recurse over the tree, so anything deeper is rejected up front.
pub const MAX_DEPTH: usize = 200;

/// Parses one complete expression.
pub fn parse(source: &str) -> DgResult<Expr> {
    let mut parser = Parser {
        source,
        tokens: tokenize(source)?,
        pos: 0,
        depth: 0,
        tallest: 0,
    };
    if parser.peek() == &Token::Eof {
        return Err(DgError::compile("empty expression", source));
    }
    let expr = parser.parse_subexpr(0)?;
    match parser.peek() {
        Token::Eof => Ok(expr),
        _ => Err(parser.error("unexpected trailing input")),
    }
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Spanned>,
    pos: usize,
    /// Active `parse_subexpr` frames
    depth: usize,
    /// Height of the tallest subexpression finished in the current frame
    tallest: usize,
}

impl Parser<'_> {
    fn peek(&self) -> &Token {
        self.peek_nth(0)
    }

    fn peek_nth(&self, n: usize) -> &Token {
        self.tokens
            .get(self.pos + n)
            .map_or(&Token::Eof, |s| &s.token)
    }

    fn next(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn consume(&mut self, expected: &Token) -> bool {
        if self.peek() == expected {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token, what: &str) -> DgResult<()> {
        if self.consume(&expected) {
            Ok(())
        } else {
            Err(self.error(&format!("expected {}", what)))
        }
    }

    /// Error naming the source from the current token on.
    fn error(&self, message: &str) -> DgError {
        let offset = self.tokens.get(self.pos).map_or(0, |s| s.offset);
        let fragment: String = self.source.chars().skip(offset).collect();
        let fragment = if fragment.is_empty() {
            self.source.to_string()
        } else {
            fragment
        };
        DgError::compile(message, fragment)
    }

    fn parse_subexpr(&mut self, precedence: u8) -> DgResult<Expr> {
        if self.depth >= MAX_DEPTH {
            return Err(self.error("expression nested too deeply"));
        }
        self.depth += 1;
        let outer = std::mem::take(&mut self.tallest);
        let result = self.parse_chain(precedence);
        self.depth -= 1;
        let (expr, height) = result?;
        self.tallest = outer.max(height);
        Ok(expr)
    }

    /// A prefix followed by every infix operator binding tighter than
    /// `precedence`, with the height of the resulting tree.
    fn parse_chain(&mut self, precedence: u8) -> DgResult<(Expr, usize)> {
        let mut expr = self.parse_prefix()?;
        let mut height = self.tallest + 1;
        loop {
            let next = self.infix_precedence();
            if precedence >= next {
                break;
            }
            // 왼쪽으로 깊어지는 체인도 높이에 포함
            self.tallest = 0;
            expr = self.parse_infix(expr, next)?;
            height = height.max(self.tallest) + 1;
            if height > MAX_DEPTH {
                return Err(self.error("expression nested too deeply"));
            }
        }
        Ok((expr, height))
    }

    fn parse_prefix(&mut self) -> DgResult<Expr> {
        match self.next() {
            Token::Int(i) => Ok(Expr::Literal(Literal::Int(i))),
            Token::Float(x) => Ok(Expr::Literal(Literal::Float(x))),
            Token::Str(s) => {
                // adjacent string literals concatenate
                let mut text = s;
                while let Token::Str(more) = self.peek().clone() {
                    self.pos += 1;
                    text.push_str(&more);
                }
                Ok(Expr::Literal(Literal::Str(text)))
            }
            Token::True => Ok(Expr::Literal(Literal::Bool(true))),
            Token::False => Ok(Expr::Literal(Literal::Bool(false))),
            Token::None => Ok(Expr::Literal(Literal::None)),
            Token::ColumnRef(name) => Ok(Expr::Column(name)),
            Token::Ident(name) => Ok(Expr::Name(name)),
            Token::Not => Ok(Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(self.parse_subexpr(PREC_NOT)?),
            }),
            Token::Minus => {
                let operand = self.parse_subexpr(PREC_UNARY)?;
                Ok(match operand {
                    Expr::Literal(Literal::Int(i)) => Expr::Literal(Literal::Int(-i)),
                    Expr::Literal(Literal::Float(x)) => Expr::Literal(Literal::Float(-x)),
                    other => Expr::Unary {
                        op: UnaryOp::Neg,
                        expr: Box::new(other),
                    },
                })
            }
            Token::Plus => Ok(Expr::Unary {
                op: UnaryOp::Pos,
                expr: Box::new(self.parse_subexpr(PREC_UNARY)?),
            }),
            Token::LParen => self.parse_parenthesized(),
            Token::LBracket => self.parse_list(),
            Token::LBrace => {
                let items = self.parse_sequence(Token::RBrace, "'}'")?;
                Ok(Expr::Set(items))
            }
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.error("unsupported syntax"))
            }
        }
    }

    fn parse_parenthesized(&mut self) -> DgResult<Expr> {
        if self.consume(&Token::RParen) {
            return Ok(Expr::Tuple(Vec::new()));
        }
        let first = self.parse_subexpr(0)?;
        if self.peek() == &Token::For {
            let comp = self.parse_comprehension(first)?;
            self.expect(Token::RParen, "')'")?;
            return Ok(comp);
        }
        if self.consume(&Token::RParen) {
            return Ok(first);
        }
        self.expect(Token::Comma, "',' or ')'")?;
        let mut items = vec![first];
        items.extend(self.parse_sequence(Token::RParen, "')'")?);
        Ok(Expr::Tuple(items))
    }

    fn parse_list(&mut self) -> DgResult<Expr> {
        if self.consume(&Token::RBracket) {
            return Ok(Expr::List(Vec::new()));
        }
        let first = self.parse_subexpr(0)?;
        if self.peek() == &Token::For {
            let comp = self.parse_comprehension(first)?;
            self.expect(Token::RBracket, "']'")?;
            return Ok(comp);
        }
        let mut items = vec![first];
        if !self.consume(&Token::RBracket) {
            self.expect(Token::Comma, "',' or ']'")?;
            items.extend(self.parse_sequence(Token::RBracket, "']'")?);
        }
        Ok(Expr::List(items))
    }

    /// Comma-separated expressions up to `close`; trailing comma allowed.
    fn parse_sequence(&mut self, close: Token, what: &str) -> DgResult<Vec<Expr>> {
        let mut items = Vec::new();
        loop {
            if self.consume(&close) {
                return Ok(items);
            }
            items.push(self.parse_subexpr(0)?);
            if !self.consume(&Token::Comma) {
                self.expect(close, what)?;
                return Ok(items);
            }
        }
    }

    /// `for target in iter [if cond]...` after the element.
    fn parse_comprehension(&mut self, element: Expr) -> DgResult<Expr> {
        self.expect(Token::For, "'for'")?;
        let target = match self.next() {
            Token::Ident(name) => name,
            _ => {
                self.pos = self.pos.saturating_sub(1);
                return Err(self.error("comprehension target must be a single name"));
            }
        };
        if self.peek() == &Token::Comma {
            return Err(self.error("comprehension target must be a single name"));
        }
        self.expect(Token::In, "'in'")?;
        let iter = self.parse_subexpr(PREC_TERNARY)?;
        let mut conditions = Vec::new();
        while self.consume(&Token::If) {
            conditions.push(self.parse_subexpr(PREC_TERNARY)?);
        }
        if self.peek() == &Token::For {
            return Err(self.error("only single-generator comprehensions are supported"));
        }
        Ok(Expr::ListComp {
            element: Box::new(element),
            target,
            iter: Box::new(iter),
            conditions,
        })
    }

    fn infix_precedence(&self) -> u8 {
        match self.peek() {
            Token::If => PREC_TERNARY,
            Token::Or => PREC_OR,
            Token::And => PREC_AND,
            Token::Not if self.peek_nth(1) == &Token::In => PREC_COMPARISON,
            Token::EqEq
            | Token::NotEq
            | Token::Lt
            | Token::LtEq
            | Token::Gt
            | Token::GtEq
            | Token::In
            | Token::Is => PREC_COMPARISON,
            Token::Plus | Token::Minus => PREC_ADD_SUB,
            Token::Star | Token::Slash | Token::DoubleSlash | Token::Percent => PREC_MUL_DIV_MOD,
            Token::DoubleStar => PREC_POW,
            Token::LParen | Token::LBracket | Token::Dot => PREC_POSTFIX,
            _ => 0,
        }
    }

    fn compare_op(&mut self) -> Option<CompareOp> {
        let op = match self.peek() {
            Token::EqEq => CompareOp::Eq,
            Token::NotEq => CompareOp::NotEq,
            Token::Lt => CompareOp::Lt,
            Token::LtEq => CompareOp::LtEq,
            Token::Gt => CompareOp::Gt,
            Token::GtEq => CompareOp::GtEq,
            Token::In => CompareOp::In,
            Token::Not if self.peek_nth(1) == &Token::In => {
                self.pos += 2;
                return Some(CompareOp::NotIn);
            }
            Token::Is if self.peek_nth(1) == &Token::Not => {
                self.pos += 2;
                return Some(CompareOp::IsNot);
            }
            Token::Is => CompareOp::Is,
            _ => return None,
        };
        self.pos += 1;
        Some(op)
    }

    fn parse_infix(&mut self, left: Expr, precedence: u8) -> DgResult<Expr> {
        if precedence == PREC_COMPARISON {
            let mut ops = Vec::new();
            let mut comparators = Vec::new();
            while let Some(op) = self.compare_op() {
                ops.push(op);
                comparators.push(self.parse_subexpr(PREC_COMPARISON)?);
            }
            return Ok(Expr::Compare {
                left: Box::new(left),
                ops,
                comparators,
            });
        }

        match self.next() {
            Token::If => {
                let test = self.parse_subexpr(PREC_TERNARY)?;
                self.expect(Token::Else, "'else'")?;
                let orelse = self.parse_subexpr(0)?;
                Ok(Expr::IfElse {
                    test: Box::new(test),
                    body: Box::new(left),
                    orelse: Box::new(orelse),
                })
            }
            Token::Or => self.parse_binary(BinaryOp::Or, left, PREC_OR),
            Token::And => self.parse_binary(BinaryOp::And, left, PREC_AND),
            Token::Plus => self.parse_binary(BinaryOp::Add, left, PREC_ADD_SUB),
            Token::Minus => self.parse_binary(BinaryOp::Sub, left, PREC_ADD_SUB),
            Token::Star => self.parse_binary(BinaryOp::Mul, left, PREC_MUL_DIV_MOD),
            Token::Slash => self.parse_binary(BinaryOp::Div, left, PREC_MUL_DIV_MOD),
            Token::DoubleSlash => self.parse_binary(BinaryOp::FloorDiv, left, PREC_MUL_DIV_MOD),
            Token::Percent => self.parse_binary(BinaryOp::Mod, left, PREC_MUL_DIV_MOD),
            // right-associative
            Token::DoubleStar => self.parse_binary(BinaryOp::Pow, left, PREC_POW - 1),
            Token::LParen => {
                let args = self.parse_call_args()?;
                Ok(Expr::Call {
                    func: Box::new(left),
                    args,
                })
            }
            Token::LBracket => {
                let index = self.parse_subexpr(0)?;
                if self.peek() == &Token::Colon {
                    return Err(self.error("slices are not supported"));
                }
                self.expect(Token::RBracket, "']'")?;
                Ok(Expr::Subscript {
                    value: Box::new(left),
                    index: Box::new(index),
                })
            }
            Token::Dot => match self.next() {
                Token::Ident(attr) => Ok(Expr::Attribute {
                    value: Box::new(left),
                    attr,
                }),
                _ => {
                    self.pos = self.pos.saturating_sub(1);
                    Err(self.error("expected attribute name"))
                }
            },
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.error("unsupported syntax"))
            }
        }
    }

    fn parse_binary(&mut self, op: BinaryOp, left: Expr, right_prec: u8) -> DgResult<Expr> {
        let right = self.parse_subexpr(right_prec)?;
        Ok(Expr::binary(op, left, right))
    }

    fn parse_call_args(&mut self) -> DgResult<Vec<Expr>> {
        if self.consume(&Token::RParen) {
            return Ok(Vec::new());
        }
        let first = self.parse_subexpr(0)?;
        if self.peek() == &Token::For {
            // sum(x for x in ...)
            let comp = self.parse_comprehension(first)?;
            self.expect(Token::RParen, "')'")?;
            return Ok(vec![comp]);
        }
        let mut args = vec![first];
        if !self.consume(&Token::RParen) {
            self.expect(Token::Comma, "',' or ')'")?;
            args.extend(self.parse_sequence(Token::RParen, "')'")?);
        }
        Ok(args)
    }
}
