//! Reader for the human-readable Micheline notation.
//!
//! Produces the JSON form the node expects: `Pair 1 "a"` becomes
//! `{"prim": "Pair", "args": [{"int": "1"}, {"string": "a"}]}` and
//! `{ CAR ; NIL operation }` becomes an array. Annotations are kept under
//! `annots`; `#` starts a comment running to the end of the line.

use std::iter::Peekable;
use std::vec::IntoIter;

use kestrel_core::{KestrelError, Result};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Int(String),
    Str(String),
    Bytes(String),
    Prim(String),
    Annot(String),
    Open,
    Close,
    BraceOpen,
    BraceClose,
    Semi,
}

impl Token {
    fn starts_term(&self) -> bool {
        !matches!(
            self,
            Token::Annot(_) | Token::Close | Token::BraceClose | Token::Semi
        )
    }
}

fn syntax(msg: impl std::fmt::Display) -> KestrelError {
    KestrelError::Validation(format!("Micheline syntax: {msg}"))
}

fn is_delimiter(c: char) -> bool {
    c.is_whitespace() || matches!(c, '(' | ')' | '{' | '}' | ';' | '"' | '#')
}

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = text.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        let single = match c {
            '(' => Some(Token::Open),
            ')' => Some(Token::Close),
            '{' => Some(Token::BraceOpen),
            '}' => Some(Token::BraceClose),
            ';' => Some(Token::Semi),
            _ => None,
        };
        if let Some(token) = single {
            chars.next();
            tokens.push(token);
            continue;
        }

        if c.is_whitespace() {
            chars.next();
            continue;
        }

        if c == '#' {
            for (_, c) in chars.by_ref() {
                if c == '\n' {
                    break;
                }
            }
            continue;
        }

        if c == '"' {
            chars.next();
            let mut s = String::new();
            loop {
                match chars.next() {
                    Some((_, '"')) => break,
                    Some((_, '\\')) => match chars.next() {
                        Some((_, 'n')) => s.push('\n'),
                        Some((_, 'r')) => s.push('\r'),
                        Some((_, 't')) => s.push('\t'),
                        Some((_, c @ ('"' | '\\'))) => s.push(c),
                        Some((at, c)) => return Err(syntax(format!("bad escape \\{c} at {at}"))),
                        None => return Err(syntax("unterminated string")),
                    },
                    Some((_, c)) => s.push(c),
                    None => return Err(syntax("unterminated string")),
                }
            }
            tokens.push(Token::Str(s));
            continue;
        }

        while chars.peek().is_some_and(|&(_, c)| !is_delimiter(c)) {
            chars.next();
        }
        let end = chars.peek().map_or(text.len(), |&(i, _)| i);
        tokens.push(word(&text[start..end], start)?);
    }

    Ok(tokens)
}

fn word(w: &str, at: usize) -> Result<Token> {
    if let Some(hex) = w.strip_prefix("0x") {
        if hex.len() % 2 != 0 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(syntax(format!("bad bytes literal {w} at {at}")));
        }
        return Ok(Token::Bytes(hex.to_ascii_lowercase()));
    }

    let digits = w.strip_prefix('-').unwrap_or(w);
    if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
        return Ok(Token::Int(w.to_string()));
    }

    match w.chars().next() {
        Some('%' | '@' | ':') => Ok(Token::Annot(w.to_string())),
        Some(c)
            if (c.is_ascii_alphabetic() || c == '_')
                && w.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') =>
        {
            Ok(Token::Prim(w.to_string()))
        }
        _ => Err(syntax(format!("unexpected {w:?} at {at}"))),
    }
}

struct Parser {
    tokens: Peekable<IntoIter<Token>>,
}

impl Parser {
    /// A primitive with its annotations and arguments, or a single term.
    fn expr(&mut self) -> Result<Value> {
        if let Some(Token::Prim(_)) = self.tokens.peek() {
            let mut node = self.prim_head()?;
            let mut args = Vec::new();
            while self.tokens.peek().is_some_and(Token::starts_term) {
                args.push(self.term()?);
            }
            if !args.is_empty() {
                node.insert("args".to_string(), Value::Array(args));
            }
            return Ok(Value::Object(node));
        }
        self.term()
    }

    fn prim_head(&mut self) -> Result<Map<String, Value>> {
        let Some(Token::Prim(name)) = self.tokens.next() else {
            return Err(syntax("expected a primitive"));
        };
        let mut node = Map::new();
        node.insert("prim".to_string(), Value::String(name));

        let mut annots = Vec::new();
        while let Some(Token::Annot(_)) = self.tokens.peek() {
            if let Some(Token::Annot(a)) = self.tokens.next() {
                annots.push(Value::String(a));
            }
        }
        if !annots.is_empty() {
            node.insert("annots".to_string(), Value::Array(annots));
        }
        Ok(node)
    }

    fn term(&mut self) -> Result<Value> {
        match self.tokens.peek() {
            Some(Token::Prim(_)) => return self.prim_head().map(Value::Object),
            None => return Err(syntax("unexpected end of input")),
            _ => {}
        }
        match self.tokens.next() {
            Some(Token::Int(n)) => Ok(json!({ "int": n })),
            Some(Token::Str(s)) => Ok(json!({ "string": s })),
            Some(Token::Bytes(b)) => Ok(json!({ "bytes": b })),
            Some(Token::Open) => {
                let inner = self.expr()?;
                self.expect(Token::Close)?;
                Ok(inner)
            }
            Some(Token::BraceOpen) => {
                let items = self.items(Some(&Token::BraceClose))?;
                self.expect(Token::BraceClose)?;
                Ok(Value::Array(items))
            }
            Some(other) => Err(syntax(format!("unexpected {other:?}"))),
            None => Err(syntax("unexpected end of input")),
        }
    }

    /// `;`-separated expressions up to `end` (or the end of input).
    fn items(&mut self, end: Option<&Token>) -> Result<Vec<Value>> {
        let mut items = Vec::new();
        loop {
            if self.tokens.peek() == end {
                return Ok(items);
            }
            if self.tokens.peek() == Some(&Token::Semi) {
                return Err(syntax("empty instruction"));
            }
            items.push(self.expr()?);
            match self.tokens.peek() {
                Some(Token::Semi) => {
                    self.tokens.next();
                }
                next if next == end => return Ok(items),
                Some(other) => return Err(syntax(format!("expected ';', found {other:?}"))),
                None => return Err(syntax("unexpected end of input")),
            }
        }
    }

    fn expect(&mut self, token: Token) -> Result<()> {
        match self.tokens.next() {
            Some(t) if t == token => Ok(()),
            Some(other) => Err(syntax(format!("expected {token:?}, found {other:?}"))),
            None => Err(syntax(format!("expected {token:?} before end of input"))),
        }
    }
}

/// Top-level expressions of `text`, split on `;`.
pub fn read_items(text: &str) -> Result<Vec<Value>> {
    let mut parser = Parser {
        tokens: tokenize(text)?.into_iter().peekable(),
    };
    let items = parser.items(None)?;
    if items.is_empty() {
        return Err(syntax("empty expression"));
    }
    Ok(items)
}

/// A single expression, or a sequence when `text` holds several separated by `;`.
pub fn read(text: &str) -> Result<Value> {
    let mut items = read_items(text)?;
    if items.len() == 1 {
        return Ok(items.remove(0));
    }
    Ok(Value::Array(items))
}
