//! Minimal query language
//!
//! ```text
//! title:foo                       simple term
//! title:"two words"               quoted value
//! title: "two words"              space after the colon
//! name:repeat OR user:Hesse       boolean operators
//! NOT (a:1 b:2)                   grouping; juxtaposition is AND
//! ```
//!
//! Precedence is `NOT` > `AND` > `OR`. Matching rules are shared by the
//! in-memory scan and the index sub-index lookup so both always agree:
//! a string field matches when it equals the value, a numeric field matches
//! when the value parses as an equal number, anything else never matches.

use serde_json::Value;

use crate::models::Document;
use crate::storage::{StorageError, StorageResult};

/// Boolean operator of a complex query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    And,
    Or,
}

/// Parsed query tree
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Simple { key: String, value: String },
    Complex { operator: Operator, queries: Vec<Query> },
    Not(Box<Query>),
}

impl Query {
    /// Parse a query string
    pub fn parse(input: &str) -> StorageResult<Query> {
        let tokens = tokenize(input).map_err(|details| syntax(input, details))?;
        if tokens.is_empty() {
            return Err(syntax(input, "empty query".to_string()));
        }

        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let query = parser
            .parse_or()
            .map_err(|details| syntax(input, details))?;

        if parser.pos != parser.tokens.len() {
            return Err(syntax(
                input,
                format!("unexpected {}", parser.tokens[parser.pos]),
            ));
        }
        Ok(query)
    }

    /// Check a document against this query
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Query::Simple { key, value } => doc
                .get(key)
                .map(|field| field_matches(field, value))
                .unwrap_or(false),
            Query::Complex {
                operator: Operator::And,
                queries,
            } => queries.iter().all(|q| q.matches(doc)),
            Query::Complex {
                operator: Operator::Or,
                queries,
            } => queries.iter().any(|q| q.matches(doc)),
            Query::Not(inner) => !inner.matches(doc),
        }
    }

    /// The (key, value) pair of a simple term
    pub fn as_simple(&self) -> Option<(&str, &str)> {
        match self {
            Query::Simple { key, value } => Some((key, value)),
            _ => None,
        }
    }
}

/// Equality between a stored field and a query value
pub fn field_matches(field: &Value, value: &str) -> bool {
    match field {
        Value::String(s) => s == value,
        Value::Number(n) => match (n.as_f64(), value.trim().parse::<f64>()) {
            (Some(a), Ok(b)) => a == b,
            _ => false,
        },
        _ => false,
    }
}

fn syntax(query: &str, details: String) -> StorageError {
    StorageError::QuerySyntax {
        query: query.to_string(),
        details,
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Term { key: String, value: String },
    And,
    Or,
    Not,
    Open,
    Close,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Term { key, value } => write!(f, "term '{}:{}'", key, value),
            Token::And => write!(f, "AND"),
            Token::Or => write!(f, "OR"),
            Token::Not => write!(f, "NOT"),
            Token::Open => write!(f, "'('"),
            Token::Close => write!(f, "')'"),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '(' {
            tokens.push(Token::Open);
            i += 1;
            continue;
        }
        if c == ')' {
            tokens.push(Token::Close);
            i += 1;
            continue;
        }

        let start = i;
        while i < chars.len() && !is_delimiter(chars[i]) && chars[i] != ':' {
            i += 1;
        }
        let word: String = chars[start..i].iter().collect();

        if i < chars.len() && chars[i] == ':' {
            if word.is_empty() {
                return Err(format!("missing key before ':' at {}", start));
            }
            i += 1;
            while i < chars.len() && chars[i] == ' ' {
                i += 1;
            }
            let value = if i < chars.len() && chars[i] == '"' {
                i += 1;
                let mut value = String::new();
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated quoted value".to_string()),
                        Some('\\') if i + 1 < chars.len() => {
                            value.push(chars[i + 1]);
                            i += 2;
                        }
                        Some('"') => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            value.push(*ch);
                            i += 1;
                        }
                    }
                }
                value
            } else {
                let value_start = i;
                while i < chars.len() && !is_delimiter(chars[i]) {
                    i += 1;
                }
                if value_start == i {
                    return Err(format!("missing value for key '{}'", word));
                }
                chars[value_start..i].iter().collect()
            };
            tokens.push(Token::Term { key: word, value });
            continue;
        }

        match word.as_str() {
            "AND" => tokens.push(Token::And),
            "OR" => tokens.push(Token::Or),
            "NOT" => tokens.push(Token::Not),
            _ => return Err(format!("expected 'key:value', found '{}'", word)),
        }
    }

    Ok(tokens)
}

fn is_delimiter(c: char) -> bool {
    c.is_whitespace() || c == '(' || c == ')'
}

/// Deepest nesting of groups and `NOT`s a query may use
const MAX_NESTING: usize = 256;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn descend(&mut self) -> Result<(), String> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(format!("nesting deeper than {} levels", MAX_NESTING));
        }
        Ok(())
    }

    fn parse_or(&mut self) -> Result<Query, String> {
        let mut queries = vec![self.parse_and()?];
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            queries.push(self.parse_and()?);
        }
        Ok(collapse(Operator::Or, queries))
    }

    fn parse_and(&mut self) -> Result<Query, String> {
        let mut queries = vec![self.parse_not()?];
        loop {
            match self.peek() {
                Some(Token::And) => {
                    self.pos += 1;
                    queries.push(self.parse_not()?);
                }
                Some(Token::Term { .. }) | Some(Token::Not) | Some(Token::Open) => {
                    queries.push(self.parse_not()?);
                }
                _ => break,
            }
        }
        Ok(collapse(Operator::And, queries))
    }

    fn parse_not(&mut self) -> Result<Query, String> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            self.descend()?;
            let inner = self.parse_not()?;
            self.depth -= 1;
            return Ok(Query::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Query, String> {
        match self.tokens.get(self.pos).cloned() {
            Some(Token::Term { key, value }) => {
                self.pos += 1;
                Ok(Query::Simple { key, value })
            }
            Some(Token::Open) => {
                self.pos += 1;
                self.descend()?;
                let inner = self.parse_or()?;
                if self.peek() != Some(&Token::Close) {
                    return Err("unbalanced parenthesis".to_string());
                }
                self.pos += 1;
                self.depth -= 1;
                Ok(inner)
            }
            Some(other) => Err(format!("unexpected {}", other)),
            None => Err("unexpected end of query".to_string()),
        }
    }
}

fn collapse(operator: Operator, mut queries: Vec<Query>) -> Query {
    if queries.len() == 1 {
        queries.remove(0)
    } else {
        Query::Complex { operator, queries }
    }
}
