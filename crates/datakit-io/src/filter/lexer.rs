// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::filter::FilterError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Bool(bool),
    Nil,
    LBrace,
    RBrace,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Semicolon,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
    In,
    NotIn,
    Match,
    NotMatch,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Spanned {
    pub(crate) token: Token,
    pub(crate) offset: usize,
}

pub(crate) fn tokenize(input: &str) -> Result<Vec<Spanned>, FilterError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let start = i;
        let simple = match c {
            b' ' | b'\t' | b'\r' | b'\n' => {
                i += 1;
                continue;
            }
            b'{' => Some(Token::LBrace),
            b'}' => Some(Token::RBrace),
            b'(' => Some(Token::LParen),
            b')' => Some(Token::RParen),
            b'[' => Some(Token::LBracket),
            b']' => Some(Token::RBracket),
            b',' => Some(Token::Comma),
            b';' => Some(Token::Semicolon),
            _ => None,
        };
        if let Some(token) = simple {
            tokens.push(Spanned { token, offset: i });
            i += 1;
            continue;
        }

        let next = bytes.get(i + 1).copied();
        let token = match (c, next) {
            (b'=', Some(b'=')) => {
                i += 2;
                Token::Eq
            }
            (b'=', _) => {
                i += 1;
                Token::Eq
            }
            (b'!', Some(b'=')) => {
                i += 2;
                Token::Ne
            }
            (b'<', Some(b'=')) => {
                i += 2;
                Token::Le
            }
            (b'<', _) => {
                i += 1;
                Token::Lt
            }
            (b'>', Some(b'=')) => {
                i += 2;
                Token::Ge
            }
            (b'>', _) => {
                i += 1;
                Token::Gt
            }
            (b'&', Some(b'&')) => {
                i += 2;
                Token::And
            }
            (b'|', Some(b'|')) => {
                i += 2;
                Token::Or
            }
            (b'\'' | b'"', _) => {
                let (value, end) = read_string(input, i)?;
                i = end;
                Token::Str(value)
            }
            (b'`', _) => {
                let (value, end) = read_string(input, i)?;
                i = end;
                Token::Ident(value)
            }
            (b'-' | b'0'..=b'9', _) => {
                let end = scan_while(bytes, i + 1, |b| {
                    b.is_ascii_digit() || matches!(b, b'.' | b'e' | b'E' | b'+' | b'-')
                });
                let text = &input[i..end];
                let value = text.parse::<f64>().map_err(|_| FilterError::Parse {
                    condition: input.to_string(),
                    offset: start,
                    message: format!("invalid number '{text}'"),
                })?;
                i = end;
                Token::Num(value)
            }
            (b, _) if b.is_ascii_alphabetic() || b == b'_' => {
                let end = scan_while(bytes, i + 1, |b| {
                    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-')
                });
                let word = &input[i..end];
                i = end;
                keyword(word).unwrap_or_else(|| Token::Ident(word.to_string()))
            }
            _ => {
                return Err(FilterError::Parse {
                    condition: input.to_string(),
                    offset: start,
                    message: format!("unexpected character '{}'", &input[i..].chars().next().unwrap_or('?')),
                })
            }
        };
        tokens.push(Spanned {
            token,
            offset: start,
        });
    }

    Ok(tokens)
}

fn keyword(word: &str) -> Option<Token> {
    let token = match word.to_ascii_lowercase().as_str() {
        "and" => Token::And,
        "or" => Token::Or,
        "not" => Token::Not,
        "in" => Token::In,
        "notin" => Token::NotIn,
        "match" => Token::Match,
        "notmatch" => Token::NotMatch,
        "true" => Token::Bool(true),
        "false" => Token::Bool(false),
        "nil" | "null" => Token::Nil,
        _ => return None,
    };
    Some(token)
}

fn scan_while(bytes: &[u8], mut i: usize, pred: impl Fn(u8) -> bool) -> usize {
    while i < bytes.len() && pred(bytes[i]) {
        i += 1;
    }
    i
}

/// Reads a quoted run starting at `start` (which holds the quote). Supports `\` escapes.
fn read_string(input: &str, start: usize) -> Result<(String, usize), FilterError> {
    let mut chars = input[start..].char_indices();
    let Some((_, quote)) = chars.next() else {
        return Err(unterminated(input, start));
    };

    let mut value = String::new();
    let mut escaped = false;
    for (idx, c) in chars {
        if escaped {
            value.push(match c {
                'n' => '\n',
                't' => '\t',
                other => other,
            });
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == quote {
            return Ok((value, start + idx + c.len_utf8()));
        } else {
            value.push(c);
        }
    }
    Err(unterminated(input, start))
}

fn unterminated(input: &str, offset: usize) -> FilterError {
    FilterError::Parse {
        condition: input.to_string(),
        offset,
        message: "unterminated string".to_string(),
    }
}
