//! Recursive-descent parser for the textual filter language.
//!
//! ```text
//! expr    := and ("or" and)*
//! and     := unary ("and" unary)*
//! unary   := "not" unary | "(" expr ")" | term
//! term    := text "=" (text | "*")
//!          | text "!=" (text | "*")
//!          | text "in" "(" text ("," text)* ")"
//!          | "type:" name ("," name)*
//!          | "geometry:" name
//!          | "id:" number
//!          | "true" | "false"
//! ```

use super::FilterExpression as F;
use crate::error::{Error, Result};
use crate::geometry::GeometryKind;
use crate::osm::{OsmType, OsmTypeSet};

#[derive(Clone, Debug, PartialEq, Eq)]
enum Token {
    Word(String),
    Quoted(String),
    LParen,
    RParen,
    Comma,
    Eq,
    NotEq,
    Star,
    End,
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | ':' | '.' | '-' | '/')
}

const KEYWORDS: [&str; 6] = ["and", "or", "not", "in", "true", "false"];

/// Whether `s` can be written without quotes.
pub(super) fn is_bare_word(s: &str) -> bool {
    !s.is_empty() && s.chars().all(is_word_char) && !KEYWORDS.contains(&s)
}

fn invalid(position: usize, message: impl Into<String>) -> Error {
    Error::InvalidFilter {
        position,
        message: message.into(),
    }
}

fn tokenize(input: &str) -> Result<Vec<(Token, usize)>> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();
    while let Some(&(pos, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' | ')' | ',' | '=' | '*' => {
                chars.next();
                let token = match c {
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    ',' => Token::Comma,
                    '=' => Token::Eq,
                    _ => Token::Star,
                };
                tokens.push((token, pos));
            }
            '!' => {
                chars.next();
                match chars.next() {
                    Some((_, '=')) => tokens.push((Token::NotEq, pos)),
                    _ => return Err(invalid(pos, "expected '=' after '!'")),
                }
            }
            '"' => {
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some((_, '"')) => break,
                        Some((_, '\\')) => match chars.next() {
                            Some((_, escaped)) => text.push(escaped),
                            None => return Err(invalid(pos, "unterminated string")),
                        },
                        Some((_, ch)) => text.push(ch),
                        None => return Err(invalid(pos, "unterminated string")),
                    }
                }
                tokens.push((Token::Quoted(text), pos));
            }
            c if is_word_char(c) => {
                let mut word = String::new();
                while let Some(&(_, ch)) = chars.peek() {
                    if !is_word_char(ch) {
                        break;
                    }
                    word.push(ch);
                    chars.next();
                }
                tokens.push((Token::Word(word), pos));
            }
            other => return Err(invalid(pos, format!("unexpected character {other:?}"))),
        }
    }
    tokens.push((Token::End, input.len()));
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    next: usize,
}

pub(super) fn parse(input: &str) -> Result<F> {
    let mut parser = Parser {
        tokens: tokenize(input)?,
        next: 0,
    };
    let expr = parser.or()?;
    match parser.peek() {
        Token::End => Ok(expr),
        other => Err(invalid(parser.position(), format!("unexpected {other:?}"))),
    }
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.next].0
    }

    fn position(&self) -> usize {
        self.tokens[self.next].1
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.next].0.clone();
        if token != Token::End {
            self.next += 1;
        }
        token
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Token::Word(w) if w == keyword)
    }

    fn expect(&mut self, token: &Token, what: &str) -> Result<()> {
        if self.peek() == token {
            self.advance();
            Ok(())
        } else {
            Err(invalid(self.position(), format!("expected {what}")))
        }
    }

    fn or(&mut self) -> Result<F> {
        let mut lhs = self.and()?;
        while self.at_keyword("or") {
            self.advance();
            lhs = lhs.or(self.and()?);
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<F> {
        let mut lhs = self.unary()?;
        while self.at_keyword("and") {
            self.advance();
            lhs = lhs.and(self.unary()?);
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<F> {
        if self.at_keyword("not") {
            self.advance();
            return Ok(self.unary()?.negate());
        }
        if *self.peek() == Token::LParen {
            self.advance();
            let inner = self.or()?;
            self.expect(&Token::RParen, "')'")?;
            return Ok(inner);
        }
        self.term()
    }

    fn text(&mut self, what: &str) -> Result<String> {
        let pos = self.position();
        match self.advance() {
            Token::Word(w) | Token::Quoted(w) => Ok(w),
            _ => Err(invalid(pos, format!("expected {what}"))),
        }
    }

    fn term(&mut self) -> Result<F> {
        let pos = self.position();
        let (word, quoted) = match self.advance() {
            Token::Word(w) => (w, false),
            Token::Quoted(w) => (w, true),
            Token::End => return Err(invalid(pos, "unexpected end of filter")),
            other => return Err(invalid(pos, format!("unexpected {other:?}"))),
        };
        match self.peek() {
            Token::Eq | Token::NotEq => {
                let negated = *self.peek() == Token::NotEq;
                self.advance();
                let expr = if *self.peek() == Token::Star {
                    self.advance();
                    F::TagExists { key: word }
                } else {
                    F::TagEquals {
                        key: word,
                        value: self.text("a tag value or '*'")?,
                    }
                };
                Ok(if negated { expr.negate() } else { expr })
            }
            _ if self.at_keyword("in") => {
                self.advance();
                self.expect(&Token::LParen, "'(' after 'in'")?;
                let mut values = vec![self.text("a tag value")?];
                while *self.peek() == Token::Comma {
                    self.advance();
                    values.push(self.text("a tag value")?);
                }
                self.expect(&Token::RParen, "')'")?;
                Ok(F::TagEqualsAny { key: word, values })
            }
            _ if quoted => Err(invalid(self.position(), "expected '=', '!=' or 'in'")),
            _ => self.selector(&word, pos),
        }
    }

    fn selector(&mut self, word: &str, pos: usize) -> Result<F> {
        if let Some(name) = word.strip_prefix("type:") {
            let mut types = OsmTypeSet::of(osm_type(name, pos)?);
            while *self.peek() == Token::Comma {
                self.advance();
                let pos = self.position();
                types = types.with(osm_type(&self.text("an entity type")?, pos)?);
            }
            return Ok(F::Type(types));
        }
        if let Some(name) = word.strip_prefix("geometry:") {
            let kind = match name {
                "point" => GeometryKind::Point,
                "line" => GeometryKind::Line,
                "polygon" => GeometryKind::Polygon,
                "other" => GeometryKind::Other,
                _ => return Err(invalid(pos, format!("unknown geometry type {name:?}"))),
            };
            return Ok(F::GeometryType(kind));
        }
        if let Some(id) = word.strip_prefix("id:") {
            return id
                .parse()
                .map(F::Id)
                .map_err(|_| invalid(pos, format!("invalid id {id:?}")));
        }
        match word {
            "true" => Ok(F::Constant(true)),
            "false" => Ok(F::Constant(false)),
            _ => Err(invalid(self.position(), "expected '=', '!=' or 'in'")),
        }
    }
}

fn osm_type(name: &str, pos: usize) -> Result<OsmType> {
    match name {
        "node" => Ok(OsmType::Node),
        "way" => Ok(OsmType::Way),
        "relation" => Ok(OsmType::Relation),
        _ => Err(invalid(pos, format!("unknown entity type {name:?}"))),
    }
}
