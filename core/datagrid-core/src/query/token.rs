//! Tokenizer for the expression language

use crate::error::{DgError, DgResult};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    /// `{'Name'}`, `{"Name"}` or `{Name}`
    ColumnRef(String),

    // Keywords
    And,
    Or,
    Not,
    In,
    Is,
    If,
    Else,
    For,
    True,
    False,
    None,

    // Symbols
    Plus,        // +
    Minus,       // -
    Star,        // *
    DoubleStar,  // **
    Slash,       // /
    DoubleSlash, // //
    Percent,     // %
    EqEq,        // ==
    NotEq,       // !=
    Lt,          // <
    LtEq,        // <=
    Gt,          // >
    GtEq,        // >=
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Dot,
    Colon,

    Eof,
}

/// Token plus its character offset in the source.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub offset: usize,
}

fn keyword(word: &str) -> Option<Token> {
    Some(match word {
        "and" => Token::And,
        "or" => Token::Or,
        "not" => Token::Not,
        "in" => Token::In,
        "is" => Token::Is,
        "if" => Token::If,
        "else" => Token::Else,
        "for" => Token::For,
        "True" => Token::True,
        "False" => Token::False,
        "None" => Token::None,
        _ => return None,
    })
}

pub fn tokenize(source: &str) -> DgResult<Vec<Spanned>> {
    let chars: Vec<char> = source.chars().collect();
    let len = chars.len();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < len {
        let c = chars[i];
        let start = i;

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let token = match c {
            '(' => Token::LParen,
            ')' => Token::RParen,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            '}' => Token::RBrace,
            ',' => Token::Comma,
            ':' => Token::Colon,
            '+' => Token::Plus,
            '-' => Token::Minus,
            '%' => Token::Percent,
            '{' => match column_ref(&chars, i) {
                Some((name, end)) => {
                    tokens.push(Spanned {
                        token: Token::ColumnRef(name),
                        offset: start,
                    });
                    i = end;
                    continue;
                }
                None => Token::LBrace,
            },
            '*' if chars.get(i + 1) == Some(&'*') => {
                i += 1;
                Token::DoubleStar
            }
            '*' => Token::Star,
            '/' if chars.get(i + 1) == Some(&'/') => {
                i += 1;
                Token::DoubleSlash
            }
            '/' => Token::Slash,
            '=' if chars.get(i + 1) == Some(&'=') => {
                i += 1;
                Token::EqEq
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                i += 1;
                Token::NotEq
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                i += 1;
                Token::LtEq
            }
            '<' => Token::Lt,
            '>' if chars.get(i + 1) == Some(&'=') => {
                i += 1;
                Token::GtEq
            }
            '>' => Token::Gt,
            '\'' | '"' => {
                let (text, end) = string_literal(&chars, i)?;
                tokens.push(Spanned {
                    token: Token::Str(text),
                    offset: start,
                });
                i = end;
                continue;
            }
            '.' if !chars.get(i + 1).is_some_and(|d| d.is_ascii_digit()) => Token::Dot,
            c if c.is_ascii_digit() || c == '.' => {
                let (token, end) = number(&chars, i)?;
                tokens.push(Spanned {
                    token,
                    offset: start,
                });
                i = end;
                continue;
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut end = i;
                while end < len && (chars[end].is_alphanumeric() || chars[end] == '_') {
                    end += 1;
                }
                let word: String = chars[i..end].iter().collect();
                tokens.push(Spanned {
                    token: keyword(&word).unwrap_or(Token::Ident(word)),
                    offset: start,
                });
                i = end;
                continue;
            }
            other => {
                return Err(DgError::compile(
                    format!("unexpected character '{}' at offset {}", other, i),
                    source,
                ));
            }
        };
        tokens.push(Spanned {
            token,
            offset: start,
        });
        i += 1;
    }

    tokens.push(Spanned {
        token: Token::Eof,
        offset: len,
    });
    Ok(tokens)
}

/// Recognizes a column reference starting at the `{` at `open`.
///
/// Returns the name and the index just past the closing brace, or `None` when
/// the brace starts a set literal instead.
fn column_ref(chars: &[char], open: usize) -> Option<(String, usize)> {
    let mut i = open + 1;
    while i < chars.len() && chars[i].is_whitespace() {
        i += 1;
    }
    match chars.get(i) {
        Some('\'') | Some('"') => {
            let (name, mut end) = string_literal(chars, i).ok()?;
            while end < chars.len() && chars[end].is_whitespace() {
                end += 1;
            }
            (chars.get(end) == Some(&'}')).then_some((name, end + 1))
        }
        _ => {
            let close = open + 1 + chars[open + 1..].iter().position(|&c| c == '}')?;
            let name: String = chars[open + 1..close].iter().collect::<String>().trim().to_string();
            let plain = !name.is_empty()
                && !name.contains([',', ':', '{', '\'', '"'])
                && name.parse::<f64>().is_err();
            plain.then_some((name, close + 1))
        }
    }
}

fn string_literal(chars: &[char], open: usize) -> DgResult<(String, usize)> {
    let quote = chars[open];
    let mut text = String::new();
    let mut i = open + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' if i + 1 < chars.len() => {
                text.push(match chars[i + 1] {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    '0' => '\0',
                    other => other,
                });
                i += 2;
            }
            c if c == quote => return Ok((text, i + 1)),
            c => {
                text.push(c);
                i += 1;
            }
        }
    }
    let fragment: String = chars[open..].iter().collect();
    Err(DgError::compile("unterminated string literal", fragment))
}

fn number(chars: &[char], start: usize) -> DgResult<(Token, usize)> {
    let mut i = start;
    let mut is_float = false;
    while i < chars.len() && chars[i].is_ascii_digit() {
        i += 1;
    }
    if i < chars.len() && chars[i] == '.' {
        is_float = true;
        i += 1;
        while i < chars.len() && chars[i].is_ascii_digit() {
            i += 1;
        }
    }
    if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
        let mut j = i + 1;
        if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
            j += 1;
        }
        if j < chars.len() && chars[j].is_ascii_digit() {
            is_float = true;
            i = j;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
        }
    }

    let text: String = chars[start..i].iter().collect();
    let token = if is_float {
        text.parse().map(Token::Float).ok()
    } else {
        text.parse().map(Token::Int).ok()
    };
    token
        .map(|t| (t, i))
        .ok_or_else(|| DgError::compile("invalid number literal", text))
}
