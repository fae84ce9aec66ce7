//! Include/exclude selection predicates.
//!
//! Predicates are boolean expressions over an entity's scalar string fields,
//! parsed into a small fixed AST and interpreted directly. The grammar covers
//! equality, list membership, and `and`/`or`/`not` combinators; there is no
//! access to anything beyond the entity's own fields.

use std::fmt;

use anyhow::{Context, Result, bail};

/// Scalar string field lookup on an index entity.
///
/// Only string-valued fields are bound; list- or object-valued fields are
/// not addressable from predicates.
pub trait FieldBindings {
    fn field(&self, name: &str) -> Option<String>;
}

/// A parsed selection predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    Eq { field: String, value: String },
    Ne { field: String, value: String },
    In {
        field: String,
        values: Vec<String>,
        negated: bool,
    },
    Not(Box<Predicate>),
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
}

impl Predicate {
    /// Parse a predicate expression such as `path == "Alamofire"` or
    /// `action in ["BuildSwiftPackage"] and version != "3.0"`.
    pub fn parse(input: &str) -> Result<Predicate> {
        let tokens = tokenize(input).with_context(|| format!("parse predicate `{input}`"))?;
        let mut parser = Parser { tokens, pos: 0 };
        let predicate = parser
            .expression()
            .with_context(|| format!("parse predicate `{input}`"))?;
        if parser.pos != parser.tokens.len() {
            bail!(
                "parse predicate `{input}`: unexpected trailing {}",
                parser.tokens[parser.pos]
            );
        }
        Ok(predicate)
    }

    /// Evaluate against one entity. Comparisons against fields the entity
    /// does not bind are false, for `==`, `!=`, `in`, and `not in` alike.
    pub fn matches(&self, entity: &dyn FieldBindings) -> bool {
        match self {
            Predicate::Eq { field, value } => {
                entity.field(field).is_some_and(|bound| bound == *value)
            }
            Predicate::Ne { field, value } => {
                entity.field(field).is_some_and(|bound| bound != *value)
            }
            Predicate::In {
                field,
                values,
                negated,
            } => entity
                .field(field)
                .is_some_and(|bound| values.contains(&bound) != *negated),
            Predicate::Not(inner) => !inner.matches(entity),
            Predicate::And(lhs, rhs) => lhs.matches(entity) && rhs.matches(entity),
            Predicate::Or(lhs, rhs) => lhs.matches(entity) || rhs.matches(entity),
        }
    }
}

/// Parsed include/exclude predicate lists for one dispatch level.
#[derive(Debug, Clone, Default)]
pub struct SelectionFilter {
    includes: Vec<Predicate>,
    excludes: Vec<Predicate>,
}

impl SelectionFilter {
    /// Parse all predicates up front so malformed expressions abort the run
    /// before any work is dispatched.
    pub fn new(includes: &[String], excludes: &[String]) -> Result<Self> {
        let parse_all = |raw: &[String]| -> Result<Vec<Predicate>> {
            raw.iter().map(|text| Predicate::parse(text)).collect()
        };
        Ok(Self {
            includes: parse_all(includes)?,
            excludes: parse_all(excludes)?,
        })
    }

    /// Exclusion wins outright; otherwise an empty include list selects
    /// everything, and a non-empty one requires at least one match.
    pub fn selects(&self, entity: &dyn FieldBindings) -> bool {
        if self.excludes.iter().any(|p| p.matches(entity)) {
            return false;
        }
        self.includes.is_empty() || self.includes.iter().any(|p| p.matches(entity))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Str(String),
    Eq,
    Ne,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    And,
    Or,
    Not,
    In,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(name) => write!(f, "identifier `{name}`"),
            Token::Str(value) => write!(f, "string \"{value}\""),
            Token::Eq => f.write_str("`==`"),
            Token::Ne => f.write_str("`!=`"),
            Token::LParen => f.write_str("`(`"),
            Token::RParen => f.write_str("`)`"),
            Token::LBracket => f.write_str("`[`"),
            Token::RBracket => f.write_str("`]`"),
            Token::Comma => f.write_str("`,`"),
            Token::And => f.write_str("`and`"),
            Token::Or => f.write_str("`or`"),
            Token::Not => f.write_str("`not`"),
            Token::In => f.write_str("`in`"),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();
    while let Some(&(pos, ch)) = chars.peek() {
        match ch {
            ' ' | '\t' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '=' => {
                chars.next();
                match chars.next() {
                    Some((_, '=')) => tokens.push(Token::Eq),
                    _ => bail!("expected `==` at offset {pos}"),
                }
            }
            '!' => {
                chars.next();
                match chars.next() {
                    Some((_, '=')) => tokens.push(Token::Ne),
                    _ => bail!("expected `!=` at offset {pos}"),
                }
            }
            '"' | '\'' => {
                chars.next();
                let mut literal = String::new();
                let mut closed = false;
                for (_, inner) in chars.by_ref() {
                    if inner == ch {
                        closed = true;
                        break;
                    }
                    literal.push(inner);
                }
                if !closed {
                    bail!("unterminated string starting at offset {pos}");
                }
                tokens.push(Token::Str(literal));
            }
            _ if ch.is_ascii_alphabetic() || ch == '_' => {
                let mut ident = String::new();
                while let Some(&(_, inner)) = chars.peek() {
                    if inner.is_ascii_alphanumeric() || inner == '_' {
                        ident.push(inner);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(match ident.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "in" => Token::In,
                    _ => Token::Ident(ident),
                });
            }
            _ => bail!("unexpected character `{ch}` at offset {pos}"),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: &Token) -> Result<()> {
        match self.advance() {
            Some(ref token) if token == expected => Ok(()),
            Some(token) => bail!("expected {expected}, found {token}"),
            None => bail!("expected {expected}, found end of input"),
        }
    }

    fn expression(&mut self) -> Result<Predicate> {
        let mut lhs = self.conjunction()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let rhs = self.conjunction()?;
            lhs = Predicate::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn conjunction(&mut self) -> Result<Predicate> {
        let mut lhs = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let rhs = self.unary()?;
            lhs = Predicate::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Predicate> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            let inner = self.unary()?;
            return Ok(Predicate::Not(Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Predicate> {
        match self.advance() {
            Some(Token::LParen) => {
                let inner = self.expression()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(field)) => self.comparison(field),
            Some(token) => bail!("expected a field comparison, found {token}"),
            None => bail!("expected a field comparison, found end of input"),
        }
    }

    fn comparison(&mut self, field: String) -> Result<Predicate> {
        match self.advance() {
            Some(Token::Eq) => Ok(Predicate::Eq {
                field,
                value: self.string_literal()?,
            }),
            Some(Token::Ne) => Ok(Predicate::Ne {
                field,
                value: self.string_literal()?,
            }),
            Some(Token::In) => Ok(Predicate::In {
                field,
                values: self.string_list()?,
                negated: false,
            }),
            Some(Token::Not) => {
                self.expect(&Token::In)?;
                Ok(Predicate::In {
                    field,
                    values: self.string_list()?,
                    negated: true,
                })
            }
            Some(token) => bail!("expected a comparison operator after `{field}`, found {token}"),
            None => bail!("expected a comparison operator after `{field}`, found end of input"),
        }
    }

    fn string_literal(&mut self) -> Result<String> {
        match self.advance() {
            Some(Token::Str(value)) => Ok(value),
            Some(token) => bail!("expected a string literal, found {token}"),
            None => bail!("expected a string literal, found end of input"),
        }
    }

    fn string_list(&mut self) -> Result<Vec<String>> {
        self.expect(&Token::LBracket)?;
        let mut values = vec![self.string_literal()?];
        loop {
            match self.advance() {
                Some(Token::Comma) => values.push(self.string_literal()?),
                Some(Token::RBracket) => break,
                Some(token) => bail!("expected `,` or `]`, found {token}"),
                None => bail!("expected `,` or `]`, found end of input"),
            }
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    struct Entity(BTreeMap<String, String>);

    impl Entity {
        fn new(fields: &[(&str, &str)]) -> Self {
            Self(
                fields
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            )
        }
    }

    impl FieldBindings for Entity {
        fn field(&self, name: &str) -> Option<String> {
            self.0.get(name).cloned()
        }
    }

    fn matches(expr: &str, entity: &Entity) -> bool {
        Predicate::parse(expr).expect("parse").matches(entity)
    }

    #[test]
    fn equality_matches_bound_field() {
        let entity = Entity::new(&[("path", "Alamofire")]);
        assert!(matches("path == \"Alamofire\"", &entity));
        assert!(!matches("path == \"Kingfisher\"", &entity));
        assert!(matches("path != \"Kingfisher\"", &entity));
    }

    #[test]
    fn single_quoted_literals_parse() {
        let entity = Entity::new(&[("version", "3.0")]);
        assert!(matches("version == '3.0'", &entity));
    }

    #[test]
    fn membership_and_negated_membership() {
        let entity = Entity::new(&[("action", "BuildSwiftPackage")]);
        assert!(matches(
            "action in [\"BuildSwiftPackage\", \"TestSwiftPackage\"]",
            &entity
        ));
        assert!(!matches("action in [\"TestSwiftPackage\"]", &entity));
        assert!(matches("action not in [\"TestSwiftPackage\"]", &entity));
        assert!(!matches("action not in [\"BuildSwiftPackage\"]", &entity));
    }

    #[test]
    fn boolean_combinators_and_parens() {
        let entity = Entity::new(&[("path", "Foo"), ("version", "1.0")]);
        assert!(matches(
            "path == \"Foo\" and version == \"1.0\"",
            &entity
        ));
        assert!(matches("path == \"Bar\" or version == \"1.0\"", &entity));
        assert!(matches(
            "not (path == \"Bar\" and version == \"1.0\")",
            &entity
        ));
        assert!(!matches("not path == \"Foo\"", &entity));
    }

    #[test]
    fn unbound_field_comparisons_are_false() {
        let entity = Entity::new(&[("path", "Foo")]);
        assert!(!matches("scheme == \"App\"", &entity));
        assert!(!matches("scheme != \"App\"", &entity));
        assert!(!matches("scheme in [\"App\"]", &entity));
        assert!(!matches("scheme not in [\"App\"]", &entity));
    }

    #[test]
    fn parse_errors_name_the_predicate() {
        let err = Predicate::parse("path = \"Foo\"").unwrap_err();
        assert!(format!("{err:#}").contains("parse predicate `path = \"Foo\"`"));

        assert!(Predicate::parse("path == ").is_err());
        assert!(Predicate::parse("path == \"unterminated").is_err());
        assert!(Predicate::parse("== \"Foo\"").is_err());
        assert!(Predicate::parse("path in []").is_err());
        assert!(Predicate::parse("path == \"Foo\" extra").is_err());
    }

    #[test]
    fn exclude_wins_over_include() {
        let filter = SelectionFilter::new(
            &["path == \"A\"".to_string()],
            &["path == \"A\"".to_string()],
        )
        .expect("filter");
        assert!(!filter.selects(&Entity::new(&[("path", "A")])));
    }

    #[test]
    fn empty_includes_select_everything() {
        let filter = SelectionFilter::new(&[], &[]).expect("filter");
        assert!(filter.selects(&Entity::new(&[("path", "B")])));
    }

    #[test]
    fn includes_require_at_least_one_match() {
        let filter = SelectionFilter::new(
            &["path == \"A\"".to_string(), "path == \"B\"".to_string()],
            &[],
        )
        .expect("filter");
        assert!(filter.selects(&Entity::new(&[("path", "A")])));
        assert!(filter.selects(&Entity::new(&[("path", "B")])));
        assert!(!filter.selects(&Entity::new(&[("path", "C")])));
    }

    #[test]
    fn malformed_predicate_fails_filter_construction() {
        assert!(SelectionFilter::new(&["path ==".to_string()], &[]).is_err());
        assert!(SelectionFilter::new(&[], &["%%".to_string()]).is_err());
    }
}
