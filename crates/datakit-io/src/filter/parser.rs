// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Recursive-descent parser for filter conditions.
//!
//! ```text
//! conditions := item (';' item)* ';'?
//! item       := '{' expr '}' | expr
//! expr       := and ('or' and)*
//! and        := primary ('and' primary)*
//! primary    := '(' expr ')' | IDENT op literal
//!             | IDENT ('in' | 'not' 'in' | 'notin') list
//!             | IDENT ('match' | 'not' 'match' | 'notmatch') list
//! list       := '[' literal (',' literal)* ']' | literal
//! ```

use regex::Regex;

use crate::filter::lexer::{tokenize, Spanned, Token};
use crate::filter::{CmpOp, Expr, FilterError, Literal};

pub(crate) fn parse_conditions(input: &str) -> Result<Vec<Expr>, FilterError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        input,
        tokens,
        pos: 0,
    };

    let mut exprs = Vec::new();
    loop {
        while parser.eat(&Token::Semicolon) {}
        if parser.at_end() {
            break;
        }
        let expr = if parser.eat(&Token::LBrace) {
            if parser.eat(&Token::RBrace) {
                continue;
            }
            let expr = parser.expr()?;
            parser.expect(&Token::RBrace, "'}'")?;
            expr
        } else {
            parser.expr()?
        };
        exprs.push(expr);
        if !parser.at_end() && !parser.check(&Token::Semicolon) {
            return Err(parser.error("expected ';' between conditions"));
        }
    }
    Ok(exprs)
}

struct Parser<'a> {
    input: &'a str,
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser<'_> {
    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn check(&self, token: &Token) -> bool {
        self.peek() == Some(token)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.check(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|s| s.token.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, token: &Token, what: &str) -> Result<(), FilterError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error(&format!("expected {what}")))
        }
    }

    fn error(&self, message: &str) -> FilterError {
        let offset = self
            .tokens
            .get(self.pos)
            .map_or(self.input.len(), |s| s.offset);
        FilterError::Parse {
            condition: self.input.to_string(),
            offset,
            message: message.to_string(),
        }
    }

    fn expr(&mut self) -> Result<Expr, FilterError> {
        let mut terms = vec![self.and()?];
        while self.eat(&Token::Or) {
            terms.push(self.and()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Expr::Or(terms)
        })
    }

    fn and(&mut self) -> Result<Expr, FilterError> {
        let mut terms = vec![self.primary()?];
        while self.eat(&Token::And) {
            terms.push(self.primary()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Expr::And(terms)
        })
    }

    fn primary(&mut self) -> Result<Expr, FilterError> {
        if self.eat(&Token::LParen) {
            let expr = self.expr()?;
            self.expect(&Token::RParen, "')'")?;
            return Ok(expr);
        }

        let key = match self.peek() {
            Some(Token::Ident(key)) => key.clone(),
            _ => return Err(self.error("expected identifier")),
        };
        self.pos += 1;

        let op_pos = self.pos;
        match self.next() {
            Some(Token::Eq) => self.comparison(key, CmpOp::Eq),
            Some(Token::Ne) => self.comparison(key, CmpOp::Ne),
            Some(Token::Lt) => self.comparison(key, CmpOp::Lt),
            Some(Token::Le) => self.comparison(key, CmpOp::Le),
            Some(Token::Gt) => self.comparison(key, CmpOp::Gt),
            Some(Token::Ge) => self.comparison(key, CmpOp::Ge),
            Some(Token::In) => self.membership(key, false),
            Some(Token::NotIn) => self.membership(key, true),
            Some(Token::Match) => self.pattern(key, false),
            Some(Token::NotMatch) => self.pattern(key, true),
            Some(Token::Not) => match self.next() {
                Some(Token::In) => self.membership(key, true),
                Some(Token::Match) => self.pattern(key, true),
                _ => {
                    self.pos -= 1;
                    Err(self.error("expected 'in' or 'match' after 'not'"))
                }
            },
            _ => {
                self.pos = op_pos;
                Err(self.error("expected operator"))
            }
        }
    }

    fn literal(&mut self) -> Result<Literal, FilterError> {
        let literal = match self.peek() {
            Some(Token::Str(s)) => Literal::Str(s.clone()),
            Some(Token::Num(n)) => Literal::Num(*n),
            Some(Token::Bool(b)) => Literal::Bool(*b),
            Some(Token::Nil) => Literal::Nil,
            _ => return Err(self.error("expected literal value")),
        };
        self.pos += 1;
        Ok(literal)
    }

    fn comparison(&mut self, key: String, op: CmpOp) -> Result<Expr, FilterError> {
        let value = self.literal()?;
        if matches!(value, Literal::Nil) && !matches!(op, CmpOp::Eq | CmpOp::Ne) {
            return Err(self.error("nil only supports '=' and '!='"));
        }
        Ok(Expr::Cmp { key, op, value })
    }

    fn list(&mut self) -> Result<Vec<Literal>, FilterError> {
        if !self.eat(&Token::LBracket) {
            return Ok(vec![self.literal()?]);
        }
        let mut values = vec![self.literal()?];
        while self.eat(&Token::Comma) {
            values.push(self.literal()?);
        }
        self.expect(&Token::RBracket, "']'")?;
        Ok(values)
    }

    fn membership(&mut self, key: String, negate: bool) -> Result<Expr, FilterError> {
        let values = self.list()?;
        Ok(Expr::In {
            key,
            values,
            negate,
        })
    }

    fn pattern(&mut self, key: String, negate: bool) -> Result<Expr, FilterError> {
        let start = self.pos;
        let values = self.list()?;
        let mut patterns = Vec::with_capacity(values.len());
        for value in values {
            let Literal::Str(pattern) = value else {
                self.pos = start;
                return Err(self.error("match expects string patterns"));
            };
            let regex = Regex::new(&pattern).map_err(|e| FilterError::InvalidRegex {
                pattern: pattern.clone(),
                message: e.to_string(),
            })?;
            patterns.push(regex);
        }
        Ok(Expr::Match {
            key,
            patterns,
            negate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_braced_and_bare_conditions() {
        let exprs = parse_conditions("{ a > 1 }; b = 'x';").expect("parse");
        assert_eq!(exprs.len(), 2);
        assert!(matches!(&exprs[0], Expr::Cmp { op: CmpOp::Gt, .. }));
        assert!(matches!(&exprs[1], Expr::Cmp { op: CmpOp::Eq, .. }));
    }

    #[test]
    fn test_and_binds_tighter_than_or() {
        let exprs = parse_conditions("a = 1 or b = 2 and c = 3").expect("parse");
        let Expr::Or(terms) = &exprs[0] else {
            panic!("expected or at the top");
        };
        assert_eq!(terms.len(), 2);
        assert!(matches!(&terms[1], Expr::And(inner) if inner.len() == 2));
    }

    #[test]
    fn test_parentheses_group() {
        let exprs = parse_conditions("(a = 1 or b = 2) and c = 3").expect("parse");
        let Expr::And(terms) = &exprs[0] else {
            panic!("expected and at the top");
        };
        assert!(matches!(&terms[0], Expr::Or(_)));
    }

    #[test]
    fn test_membership_forms() {
        let exprs = parse_conditions("{host in ['h1','h2']}; {host not in ['h3']}; {a notin [1, 2]}")
            .expect("parse");
        assert!(matches!(&exprs[0], Expr::In { negate: false, values, .. } if values.len() == 2));
        assert!(matches!(&exprs[1], Expr::In { negate: true, .. }));
        assert!(matches!(&exprs[2], Expr::In { negate: true, .. }));
    }

    #[test]
    fn test_empty_braces_are_skipped() {
        let exprs = parse_conditions("{}; ;{a = 1}").expect("parse");
        assert_eq!(exprs.len(), 1);
    }

    #[test]
    fn test_malformed_inputs() {
        for bad in [
            "a =",
            "= 1",
            "{a = 1",
            "a = 1 b = 2",
            "a in [1,",
            "a > nil",
            "a not = 1",
            "a match [1]",
            "(a = 1",
        ] {
            assert!(parse_conditions(bad).is_err(), "'{bad}' should not parse");
        }
    }

    #[test]
    fn test_invalid_regex() {
        let err = parse_conditions("msg match ['(unclosed']").expect_err("should fail");
        assert!(matches!(err, FilterError::InvalidRegex { .. }));
    }
}
