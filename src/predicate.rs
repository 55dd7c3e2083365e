//! Boolean tag-predicate parsing and evaluation.
//!
//! Actor requirements and group membership are expressed as boolean
//! expressions over tag tokens: `smoke && !flaky`, `(camera || mic) && lab`,
//! with an optional `type:tag` qualifier scoping a tag to one actor type.
//!
//! Uses logos for tokenization feeding a small recursive-descent parser:
//!
//! ```text
//! expr    := or
//! or      := and ( "||" and )*
//! and     := unary ( "&&" unary )*
//! unary   := "!" unary | primary
//! primary := "(" expr ")" | TAG
//! ```
//!
//! Evaluation is a pure tag-membership lookup; there is no dynamic code
//! evaluation anywhere in this path. Malformed expressions fail closed: the
//! caller gets a descriptive error and no actors match.

use logos::Logos;
use thiserror::Error;

/// Errors surfaced while parsing a predicate expression.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PredicateError {
    #[error("empty predicate expression")]
    Empty,
    #[error("unrecognized input at byte {position} in predicate {expression:?}")]
    UnrecognizedToken { expression: String, position: usize },
    #[error("unexpected {found} at byte {position} in predicate {expression:?}")]
    UnexpectedToken {
        expression: String,
        found: String,
        position: usize,
    },
    #[error("predicate {expression:?} ended unexpectedly")]
    UnexpectedEnd { expression: String },
}

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
enum Token {
    #[token("&&")]
    And,
    #[token("||")]
    Or,
    #[token("!")]
    Not,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[regex(r"[A-Za-z0-9_.-]+(:[A-Za-z0-9_.-]+)?", |lex| lex.slice().to_string())]
    Tag(String),
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::And => "\"&&\"".to_string(),
            Token::Or => "\"||\"".to_string(),
            Token::Not => "\"!\"".to_string(),
            Token::LParen => "\"(\"".to_string(),
            Token::RParen => "\")\"".to_string(),
            Token::Tag(tag) => format!("tag {tag:?}"),
        }
    }
}

/// A parsed predicate expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    Or(Box<Predicate>, Box<Predicate>),
    And(Box<Predicate>, Box<Predicate>),
    Not(Box<Predicate>),
    /// A tag token, optionally scoped to a single actor type.
    Tag {
        actor_type: Option<String>,
        tag: String,
    },
}

impl Predicate {
    /// Parse an expression into a predicate tree.
    pub fn parse(expression: &str) -> Result<Self, PredicateError> {
        let mut tokens = Vec::new();
        let mut lexer = Token::lexer(expression);
        while let Some(token) = lexer.next() {
            let span = lexer.span();
            match token {
                Ok(token) => tokens.push((token, span.start)),
                Err(()) => {
                    return Err(PredicateError::UnrecognizedToken {
                        expression: expression.to_string(),
                        position: span.start,
                    });
                }
            }
        }
        if tokens.is_empty() {
            return Err(PredicateError::Empty);
        }
        let mut parser = Parser {
            expression,
            tokens,
            pos: 0,
        };
        let predicate = parser.or()?;
        if let Some((token, position)) = parser.peek() {
            return Err(PredicateError::UnexpectedToken {
                expression: expression.to_string(),
                found: token.describe(),
                position,
            });
        }
        Ok(predicate)
    }

    /// Evaluate against one actor's type and tag set.
    ///
    /// A qualified `type:tag` token matches only when the actor type equals
    /// the qualifier and the actor carries the tag.
    pub fn matches(&self, actor_type: &str, tags: &[String]) -> bool {
        match self {
            Predicate::Or(lhs, rhs) => lhs.matches(actor_type, tags) || rhs.matches(actor_type, tags),
            Predicate::And(lhs, rhs) => {
                lhs.matches(actor_type, tags) && rhs.matches(actor_type, tags)
            }
            Predicate::Not(inner) => !inner.matches(actor_type, tags),
            Predicate::Tag {
                actor_type: qualifier,
                tag,
            } => {
                if let Some(qualifier) = qualifier
                    && qualifier != actor_type
                {
                    return false;
                }
                tags.iter().any(|candidate| candidate == tag)
            }
        }
    }
}

/// Parse and evaluate in one step.
pub fn matches_expression(
    expression: &str,
    actor_type: &str,
    tags: &[String],
) -> Result<bool, PredicateError> {
    Ok(Predicate::parse(expression)?.matches(actor_type, tags))
}

struct Parser<'a> {
    expression: &'a str,
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<(Token, usize)> {
        self.tokens.get(self.pos).cloned()
    }

    fn advance(&mut self) -> Option<(Token, usize)> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn or(&mut self) -> Result<Predicate, PredicateError> {
        let mut lhs = self.and()?;
        while matches!(self.peek(), Some((Token::Or, _))) {
            self.advance();
            let rhs = self.and()?;
            lhs = Predicate::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Predicate, PredicateError> {
        let mut lhs = self.unary()?;
        while matches!(self.peek(), Some((Token::And, _))) {
            self.advance();
            let rhs = self.unary()?;
            lhs = Predicate::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Predicate, PredicateError> {
        if matches!(self.peek(), Some((Token::Not, _))) {
            self.advance();
            let inner = self.unary()?;
            return Ok(Predicate::Not(Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Predicate, PredicateError> {
        match self.advance() {
            Some((Token::LParen, _)) => {
                let inner = self.or()?;
                match self.advance() {
                    Some((Token::RParen, _)) => Ok(inner),
                    Some((token, position)) => Err(PredicateError::UnexpectedToken {
                        expression: self.expression.to_string(),
                        found: token.describe(),
                        position,
                    }),
                    None => Err(PredicateError::UnexpectedEnd {
                        expression: self.expression.to_string(),
                    }),
                }
            }
            Some((Token::Tag(raw), _)) => {
                let (actor_type, tag) = match raw.split_once(':') {
                    Some((qualifier, tag)) => (Some(qualifier.to_string()), tag.to_string()),
                    None => (None, raw),
                };
                Ok(Predicate::Tag { actor_type, tag })
            }
            Some((token, position)) => Err(PredicateError::UnexpectedToken {
                expression: self.expression.to_string(),
                found: token.describe(),
                position,
            }),
            None => Err(PredicateError::UnexpectedEnd {
                expression: self.expression.to_string(),
            }),
        }
    }
}
