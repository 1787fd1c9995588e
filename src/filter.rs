// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Flow filter expressions.
//!
//! Grammar, loosest binding first:
//!
//! ```text
//! expr   := and ('|' and)*
//! and    := unary ('&' unary)*
//! unary  := '!' unary | '(' expr ')' | term
//! term   := '~u' ARG | '~d' ARG | '~p' ARG | '~m' ARG | ARG
//! ```
//!
//! `~u` matches the full URL, `~d` the host, `~p` the path and query; their
//! arguments are case-insensitive regexes searched anywhere in the subject.
//! `~m` compares the method. A bare argument is shorthand for `~u`. Arguments
//! may be quoted with `'` or `"` to include whitespace.

use hyper::{Method, Uri};
use regex::{Regex, RegexBuilder};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
    #[error("empty filter expression")]
    Empty,
    #[error("unexpected {found} at position {pos}")]
    Unexpected { found: String, pos: usize },
    #[error("unexpected end of filter expression")]
    UnexpectedEnd,
    #[error("unterminated quote starting at position {pos}")]
    UnterminatedQuote { pos: usize },
    #[error("unknown filter {0}")]
    UnknownFilter(String),
    #[error("invalid regex {pattern:?}: {message}")]
    InvalidRegex { pattern: String, message: String },
}

#[derive(Debug, Clone)]
enum Expr {
    Url(Regex),
    Domain(Regex),
    Path(Regex),
    Method(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    fn eval(&self, method: &Method, uri: &Uri) -> bool {
        match self {
            Expr::Url(re) => re.is_match(&uri.to_string()),
            Expr::Domain(re) => uri.host().is_some_and(|h| re.is_match(h)),
            Expr::Path(re) => re.is_match(uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")),
            Expr::Method(m) => method.as_str().eq_ignore_ascii_case(m),
            Expr::Not(inner) => !inner.eval(method, uri),
            Expr::And(a, b) => a.eval(method, uri) && b.eval(method, uri),
            Expr::Or(a, b) => a.eval(method, uri) || b.eval(method, uri),
        }
    }
}

/// A parsed filter expression, matched against a request head.
#[derive(Clone)]
pub struct FlowFilter {
    source: String,
    expr: Expr,
}

impl FlowFilter {
    pub fn parse(source: &str) -> Result<Self, FilterError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(FilterError::Empty);
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expr()?;
        if let Some((tok, pos)) = parser.tokens.get(parser.pos) {
            return Err(FilterError::Unexpected {
                found: tok.to_string(),
                pos: *pos,
            });
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn matches(&self, method: &Method, uri: &Uri) -> bool {
        self.expr.eval(method, uri)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Debug for FlowFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FlowFilter").field(&self.source).finish()
    }
}

impl fmt::Display for FlowFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for FlowFilter {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for FlowFilter {
    type Error = FilterError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl<'de> serde::Deserialize<'de> for FlowFilter {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    LParen,
    RParen,
    And,
    Or,
    Not,
    Word(String),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
            Token::And => f.write_str("'&'"),
            Token::Or => f.write_str("'|'"),
            Token::Not => f.write_str("'!'"),
            Token::Word(w) => write!(f, "{:?}", w),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<(Token, usize)>, FilterError> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let (pos, c) = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push((Token::LParen, pos));
                i += 1;
            }
            ')' => {
                tokens.push((Token::RParen, pos));
                i += 1;
            }
            '&' => {
                tokens.push((Token::And, pos));
                i += 1;
            }
            '|' => {
                tokens.push((Token::Or, pos));
                i += 1;
            }
            '!' => {
                tokens.push((Token::Not, pos));
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let mut word = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(FilterError::UnterminatedQuote { pos }),
                        Some((_, '\\')) if chars.get(i + 1).is_some_and(|(_, n)| *n == quote) => {
                            word.push(quote);
                            i += 2;
                        }
                        Some((_, ch)) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some((_, ch)) => {
                            word.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push((Token::Word(word), pos));
            }
            _ => {
                // Unquoted words run to whitespace. Parentheses that open inside
                // the word belong to it (regex groups); an unmatched ')' ends it.
                let mut word = String::new();
                let mut depth = 0usize;
                while let Some((_, ch)) = chars.get(i) {
                    let ch = *ch;
                    if ch.is_whitespace() {
                        break;
                    }
                    if ch == '(' {
                        depth += 1;
                    } else if ch == ')' {
                        if depth == 0 {
                            break;
                        }
                        depth -= 1;
                    }
                    word.push(ch);
                    i += 1;
                }
                tokens.push((Token::Word(word), pos));
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn next(&mut self) -> Result<(Token, usize), FilterError> {
        let tok = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(FilterError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(tok)
    }

    fn expr(&mut self) -> Result<Expr, FilterError> {
        let mut lhs = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = self.and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, FilterError> {
        let mut lhs = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, FilterError> {
        match self.next()? {
            (Token::Not, _) => Ok(Expr::Not(Box::new(self.unary()?))),
            (Token::LParen, _) => {
                let inner = self.expr()?;
                match self.next()? {
                    (Token::RParen, _) => Ok(inner),
                    (tok, pos) => Err(FilterError::Unexpected {
                        found: tok.to_string(),
                        pos,
                    }),
                }
            }
            (Token::Word(word), _) => self.term(word),
            (tok, pos) => Err(FilterError::Unexpected {
                found: tok.to_string(),
                pos,
            }),
        }
    }

    fn term(&mut self, word: String) -> Result<Expr, FilterError> {
        if !word.starts_with('~') {
            return Ok(Expr::Url(compile(&word)?));
        }
        let arg = match self.next()? {
            (Token::Word(arg), _) => arg,
            (tok, pos) => {
                return Err(FilterError::Unexpected {
                    found: tok.to_string(),
                    pos,
                })
            }
        };
        match word.as_str() {
            "~u" => Ok(Expr::Url(compile(&arg)?)),
            "~d" => Ok(Expr::Domain(compile(&arg)?)),
            "~p" => Ok(Expr::Path(compile(&arg)?)),
            "~m" => Ok(Expr::Method(arg)),
            _ => Err(FilterError::UnknownFilter(word)),
        }
    }
}

fn compile(pattern: &str) -> Result<Regex, FilterError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| FilterError::InvalidRegex {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })
}
