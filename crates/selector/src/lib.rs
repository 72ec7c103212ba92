//! Polres selector: a small label-selector language.
//!
//! Supported forms: `all()`, `has(k)`, `k == 'v'`, `k != 'v'`, `k in {'a', 'b'}`,
//! `k not in {...}`, `k contains 'v'`, `k starts with 'v'`, `k ends with 'v'`,
//! combined with `!`, `&&`, `||` and parentheses. An empty expression selects everything.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use polres_core::Labels;
use smallvec::SmallVec;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("unexpected token {found:?} at offset {pos}")]
    UnexpectedToken { pos: usize, found: String },
    #[error("unexpected end of selector")]
    UnexpectedEnd,
    #[error("unterminated string starting at offset {pos}")]
    UnterminatedString { pos: usize },
    #[error("invalid character {ch:?} at offset {pos}")]
    InvalidCharacter { pos: usize, ch: char },
    #[error("selector nests deeper than {} levels at offset {pos}", MAX_DEPTH)]
    TooDeep { pos: usize },
}

/// Bound on both parser recursion and expression tree depth.
pub const MAX_DEPTH: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    All,
    Has(String),
    Eq(String, String),
    Ne(String, String),
    In(String, SmallVec<[String; 4]>),
    NotIn(String, SmallVec<[String; 4]>),
    Contains(String, String),
    StartsWith(String, String),
    EndsWith(String, String),
    Not(Box<Node>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
}

impl Node {
    fn eval(&self, labels: &Labels) -> bool {
        match self {
            Node::All => true,
            Node::Has(k) => labels.contains_key(k),
            Node::Eq(k, v) => labels.get(k) == Some(v.as_str()),
            // Absent keys satisfy `!=`.
            Node::Ne(k, v) => labels.get(k) != Some(v.as_str()),
            Node::In(k, vs) => labels.get(k).map(|x| vs.iter().any(|v| v == x)).unwrap_or(false),
            Node::NotIn(k, vs) => labels.get(k).map(|x| !vs.iter().any(|v| v == x)).unwrap_or(true),
            Node::Contains(k, v) => labels.get(k).map(|x| x.contains(v.as_str())).unwrap_or(false),
            Node::StartsWith(k, v) => labels.get(k).map(|x| x.starts_with(v.as_str())).unwrap_or(false),
            Node::EndsWith(k, v) => labels.get(k).map(|x| x.ends_with(v.as_str())).unwrap_or(false),
            Node::Not(n) => !n.eval(labels),
            Node::And(a, b) => a.eval(labels) && b.eval(labels),
            Node::Or(a, b) => a.eval(labels) || b.eval(labels),
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn set(vs: &[String]) -> String {
            vs.iter().map(|v| format!("'{}'", v)).collect::<Vec<_>>().join(", ")
        }
        match self {
            Node::All => write!(f, "all()"),
            Node::Has(k) => write!(f, "has({})", k),
            Node::Eq(k, v) => write!(f, "{} == '{}'", k, v),
            Node::Ne(k, v) => write!(f, "{} != '{}'", k, v),
            Node::In(k, vs) => write!(f, "{} in {{{}}}", k, set(vs)),
            Node::NotIn(k, vs) => write!(f, "{} not in {{{}}}", k, set(vs)),
            Node::Contains(k, v) => write!(f, "{} contains '{}'", k, v),
            Node::StartsWith(k, v) => write!(f, "{} starts with '{}'", k, v),
            Node::EndsWith(k, v) => write!(f, "{} ends with '{}'", k, v),
            Node::Not(n) => write!(f, "!{}", n),
            Node::And(a, b) => write!(f, "({} && {})", a, b),
            Node::Or(a, b) => write!(f, "({} || {})", a, b),
        }
    }
}

/// A parsed selector. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Selector {
    expr: Arc<str>,
    root: Arc<Node>,
}

impl Selector {
    pub fn parse(expr: &str) -> Result<Self, SelectorError> {
        let tokens = tokenize(expr)?;
        let root = if tokens.is_empty() {
            Node::All
        } else {
            let mut p = Parser { tokens: &tokens, pos: 0, nesting: 0 };
            let (n, _) = p.parse_or()?;
            if let Some((pos, tok)) = p.tokens.get(p.pos) {
                return Err(SelectorError::UnexpectedToken { pos: *pos, found: tok.to_string() });
            }
            n
        };
        Ok(Self { expr: Arc::from(expr), root: Arc::new(root) })
    }

    pub fn matches(&self, labels: &Labels) -> bool { self.root.eval(labels) }

    /// The expression as registered.
    pub fn expr(&self) -> &str { &self.expr }

    /// Normalised rendering; two selectors with the same canonical form select the same endpoints.
    pub fn canonical(&self) -> String { self.root.to_string() }
}

impl PartialEq for Selector {
    fn eq(&self, other: &Self) -> bool { self.root == other.root }
}

impl Eq for Selector {}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.root) }
}

/// One-shot evaluation helper.
pub fn evaluate(expr: &str, labels: &Labels) -> Result<bool, SelectorError> {
    Ok(Selector::parse(expr)?.matches(labels))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tok {
    Ident(String),
    Str(String),
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    EqEq,
    NotEq,
    Bang,
    AndAnd,
    OrOr,
}

impl fmt::Display for Tok {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tok::Ident(s) => f.write_str(s),
            Tok::Str(s) => write!(f, "'{}'", s),
            Tok::LParen => f.write_str("("),
            Tok::RParen => f.write_str(")"),
            Tok::LBrace => f.write_str("{"),
            Tok::RBrace => f.write_str("}"),
            Tok::Comma => f.write_str(","),
            Tok::EqEq => f.write_str("=="),
            Tok::NotEq => f.write_str("!="),
            Tok::Bang => f.write_str("!"),
            Tok::AndAnd => f.write_str("&&"),
            Tok::OrOr => f.write_str("||"),
        }
    }
}

fn is_ident_char(c: char) -> bool { c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/') }

fn tokenize(s: &str) -> Result<Vec<(usize, Tok)>, SelectorError> {
    let chars: Vec<(usize, char)> = s.char_indices().collect();
    let mut out = Vec::new();
    let mut i = 0usize;
    while i < chars.len() {
        let (pos, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);
        match c {
            c if c.is_whitespace() => { i += 1; }
            '(' => { out.push((pos, Tok::LParen)); i += 1; }
            ')' => { out.push((pos, Tok::RParen)); i += 1; }
            '{' => { out.push((pos, Tok::LBrace)); i += 1; }
            '}' => { out.push((pos, Tok::RBrace)); i += 1; }
            ',' => { out.push((pos, Tok::Comma)); i += 1; }
            '=' if next == Some('=') => { out.push((pos, Tok::EqEq)); i += 2; }
            '!' if next == Some('=') => { out.push((pos, Tok::NotEq)); i += 2; }
            '!' => { out.push((pos, Tok::Bang)); i += 1; }
            '&' if next == Some('&') => { out.push((pos, Tok::AndAnd)); i += 2; }
            '|' if next == Some('|') => { out.push((pos, Tok::OrOr)); i += 2; }
            '\'' | '"' => {
                let quote = c;
                let mut j = i + 1;
                let mut lit = String::new();
                loop {
                    match chars.get(j) {
                        None => return Err(SelectorError::UnterminatedString { pos }),
                        Some((_, ch)) if *ch == quote => break,
                        Some((_, ch)) => lit.push(*ch),
                    }
                    j += 1;
                }
                out.push((pos, Tok::Str(lit)));
                i = j + 1;
            }
            c if is_ident_char(c) => {
                let mut j = i;
                let mut ident = String::new();
                while let Some((_, ch)) = chars.get(j) {
                    if !is_ident_char(*ch) { break; }
                    ident.push(*ch);
                    j += 1;
                }
                out.push((pos, Tok::Ident(ident)));
                i = j;
            }
            ch => return Err(SelectorError::InvalidCharacter { pos, ch }),
        }
    }
    Ok(out)
}

struct Parser<'a> {
    tokens: &'a [(usize, Tok)],
    pos: usize,
    nesting: usize,
}

/// A parsed subtree and its depth.
type Parsed = (Node, usize);

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Tok> { self.tokens.get(self.pos).map(|(_, t)| t) }

    fn next(&mut self) -> Result<(usize, &'a Tok), SelectorError> {
        let (p, t) = self.tokens.get(self.pos).ok_or(SelectorError::UnexpectedEnd)?;
        self.pos += 1;
        Ok((*p, t))
    }

    fn expect(&mut self, want: &Tok) -> Result<(), SelectorError> {
        let (pos, t) = self.next()?;
        if t == want { Ok(()) } else { Err(SelectorError::UnexpectedToken { pos, found: t.to_string() }) }
    }

    fn string(&mut self) -> Result<String, SelectorError> {
        match self.next()? {
            (_, Tok::Str(s)) => Ok(s.clone()),
            (pos, t) => Err(SelectorError::UnexpectedToken { pos, found: t.to_string() }),
        }
    }

    fn keyword(&mut self, word: &str) -> Result<(), SelectorError> {
        match self.next()? {
            (_, Tok::Ident(s)) if s == word => Ok(()),
            (pos, t) => Err(SelectorError::UnexpectedToken { pos, found: t.to_string() }),
        }
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).or(self.tokens.last()).map(|(p, _)| *p).unwrap_or(0)
    }

    fn deeper(&self, depth: usize) -> Result<usize, SelectorError> {
        if depth > MAX_DEPTH { Err(SelectorError::TooDeep { pos: self.offset() }) } else { Ok(depth) }
    }

    fn enter(&mut self) -> Result<(), SelectorError> {
        self.nesting += 1;
        self.deeper(self.nesting).map(|_| ())
    }

    fn parse_or(&mut self) -> Result<Parsed, SelectorError> {
        let (mut lhs, mut depth) = self.parse_and()?;
        while self.peek() == Some(&Tok::OrOr) {
            self.pos += 1;
            let (rhs, rd) = self.parse_and()?;
            depth = self.deeper(depth.max(rd) + 1)?;
            lhs = Node::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok((lhs, depth))
    }

    fn parse_and(&mut self) -> Result<Parsed, SelectorError> {
        let (mut lhs, mut depth) = self.parse_unary()?;
        while self.peek() == Some(&Tok::AndAnd) {
            self.pos += 1;
            let (rhs, rd) = self.parse_unary()?;
            depth = self.deeper(depth.max(rd) + 1)?;
            lhs = Node::And(Box::new(lhs), Box::new(rhs));
        }
        Ok((lhs, depth))
    }

    fn parse_unary(&mut self) -> Result<Parsed, SelectorError> {
        if self.peek() == Some(&Tok::Bang) {
            self.pos += 1;
            self.enter()?;
            let (inner, d) = self.parse_unary()?;
            self.nesting -= 1;
            return Ok((Node::Not(Box::new(inner)), self.deeper(d + 1)?));
        }
        self.parse_primary()
    }

    fn parse_set(&mut self) -> Result<SmallVec<[String; 4]>, SelectorError> {
        self.expect(&Tok::LBrace)?;
        let mut vs = SmallVec::new();
        if self.peek() == Some(&Tok::RBrace) {
            self.pos += 1;
            return Ok(vs);
        }
        loop {
            vs.push(self.string()?);
            match self.next()? {
                (_, Tok::Comma) => continue,
                (_, Tok::RBrace) => break,
                (pos, t) => return Err(SelectorError::UnexpectedToken { pos, found: t.to_string() }),
            }
        }
        Ok(vs)
    }

    fn parse_primary(&mut self) -> Result<Parsed, SelectorError> {
        let (pos, tok) = self.next()?;
        if *tok == Tok::LParen {
            self.enter()?;
            let n = self.parse_or()?;
            self.expect(&Tok::RParen)?;
            self.nesting -= 1;
            return Ok(n);
        }
        self.parse_term(pos, tok).map(|n| (n, 1))
    }

    fn parse_term(&mut self, pos: usize, tok: &'a Tok) -> Result<Node, SelectorError> {
        match tok {
            Tok::Ident(word) if word == "all" && self.peek() == Some(&Tok::LParen) => {
                self.expect(&Tok::LParen)?;
                self.expect(&Tok::RParen)?;
                Ok(Node::All)
            }
            Tok::Ident(word) if word == "has" && self.peek() == Some(&Tok::LParen) => {
                self.expect(&Tok::LParen)?;
                let key = match self.next()? {
                    (_, Tok::Ident(k)) => k.clone(),
                    (pos, t) => return Err(SelectorError::UnexpectedToken { pos, found: t.to_string() }),
                };
                self.expect(&Tok::RParen)?;
                Ok(Node::Has(key))
            }
            Tok::Ident(key) => {
                let key = key.clone();
                let (op_pos, op) = self.next()?;
                match op {
                    Tok::EqEq => Ok(Node::Eq(key, self.string()?)),
                    Tok::NotEq => Ok(Node::Ne(key, self.string()?)),
                    Tok::Ident(w) if w == "in" => Ok(Node::In(key, self.parse_set()?)),
                    Tok::Ident(w) if w == "not" => {
                        self.keyword("in")?;
                        Ok(Node::NotIn(key, self.parse_set()?))
                    }
                    Tok::Ident(w) if w == "contains" => Ok(Node::Contains(key, self.string()?)),
                    Tok::Ident(w) if w == "starts" => {
                        self.keyword("with")?;
                        Ok(Node::StartsWith(key, self.string()?))
                    }
                    Tok::Ident(w) if w == "ends" => {
                        self.keyword("with")?;
                        Ok(Node::EndsWith(key, self.string()?))
                    }
                    t => Err(SelectorError::UnexpectedToken { pos: op_pos, found: t.to_string() }),
                }
            }
            t => Err(SelectorError::UnexpectedToken { pos, found: t.to_string() }),
        }
    }
}
